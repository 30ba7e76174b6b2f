//! Static catalogue of applications and their models.
//!
//! The catalogue is loaded once at startup from the inline configuration and
//! an optional models directory, and is immutable afterwards. Load failures
//! are fatal for the daemon.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MODEL_CONFIG_FILE: &str = "model_config.json";
const MODEL_FILE: &str = "model.hef";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Model {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Application {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub models: Vec<Model>,
}

impl Application {
    /// Class labels of the application's models, in model order.
    pub fn labels(&self) -> Vec<String> {
        self.models
            .iter()
            .flat_map(|model| model.labels.iter().cloned())
            .collect()
    }
}

/// Where the catalogue comes from.
#[derive(Clone, Debug, Default)]
pub struct RegistrySettings {
    pub models_dir: Option<PathBuf>,
    pub apps: Vec<Application>,
}

/// `model_config.json` as found in a model directory.
#[derive(Debug, Deserialize)]
struct ModelConfigFile {
    model_id: String,
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
}

/// Read-only application catalogue. Cloning shares the same snapshot.
#[derive(Clone, Debug)]
pub struct AppRegistry {
    apps: Arc<[Application]>,
}

impl AppRegistry {
    pub fn new(apps: Vec<Application>) -> Result<Self> {
        let mut seen = HashSet::new();
        for app in &apps {
            if app.id.trim().is_empty() {
                return Err(anyhow!("application id must not be empty"));
            }
            if !seen.insert(app.id.as_str()) {
                return Err(anyhow!("duplicate application id '{}'", app.id));
            }
        }
        Ok(Self { apps: apps.into() })
    }

    pub fn empty() -> Self {
        Self {
            apps: Arc::from(Vec::new()),
        }
    }

    /// Load inline applications followed by the models directory scan.
    pub fn load(settings: &RegistrySettings) -> Result<Self> {
        let mut apps = settings.apps.clone();
        if let Some(dir) = &settings.models_dir {
            apps.extend(scan_models_dir(dir)?);
        }
        let registry = Self::new(apps)?;
        log::info!("app registry loaded with {} apps", registry.len());
        Ok(registry)
    }

    /// Snapshot of the catalogue in load order.
    pub fn list(&self) -> Vec<Application> {
        self.apps.to_vec()
    }

    pub fn get(&self, id: &str) -> Option<&Application> {
        self.apps.iter().find(|app| app.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

/// Discover applications in `dir`. Each subdirectory holding a
/// `model_config.json` becomes one application with a single model.
pub fn scan_models_dir(dir: &Path) -> Result<Vec<Application>> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create models dir {}", dir.display()))?;
        log::info!("created models directory {}", dir.display());
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read models dir {}", dir.display()))?;
    let mut apps = Vec::new();
    for entry in entries {
        let entry = entry?;
        let model_dir = entry.path();
        if !model_dir.is_dir() {
            continue;
        }
        let config_path = model_dir.join(MODEL_CONFIG_FILE);
        if !config_path.is_file() {
            log::debug!("skipping {} (no {})", model_dir.display(), MODEL_CONFIG_FILE);
            continue;
        }
        apps.push(load_model_dir(&model_dir, &config_path)?);
    }
    apps.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(apps)
}

fn load_model_dir(model_dir: &Path, config_path: &Path) -> Result<Application> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow!("failed to read {}: {}", config_path.display(), e))?;
    let cfg: ModelConfigFile = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid model config {}: {}", config_path.display(), e))?;
    if cfg.model_id.trim().is_empty() {
        return Err(anyhow!("{}: model_id is required", config_path.display()));
    }
    let name = cfg
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| cfg.model_id.clone());
    let model = Model {
        name: name.clone(),
        path: model_dir.join(MODEL_FILE).to_string_lossy().to_string(),
        labels: cfg.labels,
    };
    Ok(Application {
        id: cfg.model_id,
        name,
        description: cfg.description.unwrap_or_default(),
        version: cfg.version.unwrap_or_default(),
        models: vec![model],
    })
}
