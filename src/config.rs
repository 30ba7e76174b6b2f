use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{ApiConfig, DEFAULT_API_ADDR};
use crate::events::{is_valid_token, DEFAULT_BUFFER_CAPACITY, DEFAULT_TOPIC_PREFIX};
use crate::registry::{Application, RegistrySettings};
use crate::session::{
    DriverSettings, RetryPolicy, StoreSettings, DEFAULT_DIAL_TIMEOUT, DEFAULT_FPS_WINDOW,
    DEFAULT_FRAME_TIMEOUT, DEFAULT_MAX_CONSECUTIVE_READ_ERRORS, DEFAULT_MAX_SESSIONS,
};
use crate::transport::MqttSettings;

const DEFAULT_BACKEND: &str = "stub";

#[derive(Debug, Deserialize, Default)]
struct DetectordConfigFile {
    api: Option<ApiConfigFile>,
    registry: Option<RegistryConfigFile>,
    sessions: Option<SessionsConfigFile>,
    driver: Option<DriverConfigFile>,
    bus: Option<BusConfigFile>,
    detector: Option<DetectorConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RegistryConfigFile {
    models_dir: Option<PathBuf>,
    apps: Option<Vec<Application>>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionsConfigFile {
    max_sessions: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DriverConfigFile {
    dial_timeout_ms: Option<u64>,
    frame_timeout_ms: Option<u64>,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    fps_window_ms: Option<u64>,
    max_consecutive_read_errors: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BusConfigFile {
    topic_prefix: Option<String>,
    buffer_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    client_id: Option<String>,
    topic_root: Option<String>,
    username: Option<String>,
    password: Option<String>,
    allow_remote: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct DetectordConfig {
    pub api_addr: String,
    pub registry: RegistrySettings,
    pub max_sessions: usize,
    pub driver: DriverSettings,
    pub bus: BusSettings,
    /// MQTT mirror of the event bus; disabled when no broker is configured.
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    pub topic_prefix: String,
    pub buffer_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl DetectordConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DETECTOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DetectordConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let registry = file
            .registry
            .map(|registry| RegistrySettings {
                models_dir: registry.models_dir,
                apps: registry.apps.unwrap_or_default(),
            })
            .unwrap_or_default();
        let max_sessions = file
            .sessions
            .and_then(|sessions| sessions.max_sessions)
            .unwrap_or(DEFAULT_MAX_SESSIONS);

        let driver_file = file.driver.unwrap_or_default();
        let retry_default = RetryPolicy::default();
        let driver = DriverSettings {
            dial_timeout: millis_or(driver_file.dial_timeout_ms, DEFAULT_DIAL_TIMEOUT),
            frame_timeout: millis_or(driver_file.frame_timeout_ms, DEFAULT_FRAME_TIMEOUT),
            retry: RetryPolicy {
                max_attempts: driver_file
                    .max_attempts
                    .unwrap_or(retry_default.max_attempts),
                base_delay: millis_or(driver_file.backoff_base_ms, retry_default.base_delay),
                max_delay: millis_or(driver_file.backoff_max_ms, retry_default.max_delay),
            },
            fps_window: millis_or(driver_file.fps_window_ms, DEFAULT_FPS_WINDOW),
            max_consecutive_read_errors: driver_file
                .max_consecutive_read_errors
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_READ_ERRORS),
            backend: file
                .detector
                .and_then(|detector| detector.backend)
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
        };

        let bus = file
            .bus
            .map(|bus| BusSettings {
                topic_prefix: bus
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
                buffer_capacity: bus.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY),
            })
            .unwrap_or_default();

        let mqtt = file.mqtt.and_then(|mqtt| {
            let mut settings = MqttSettings::new(mqtt.broker_addr.as_deref()?);
            if let Some(client_id) = mqtt.client_id {
                settings.client_id = client_id;
            }
            settings.topic_root = mqtt.topic_root;
            settings.username = mqtt.username;
            settings.password = mqtt.password;
            settings.allow_remote = mqtt.allow_remote.unwrap_or(false);
            Some(settings)
        });

        Self {
            api_addr,
            registry,
            max_sessions,
            driver,
            bus,
            mqtt,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("DETECTOR_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("DETECTOR_MODELS_DIR") {
            if !dir.trim().is_empty() {
                self.registry.models_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(value) = std::env::var("DETECTOR_MAX_SESSIONS") {
            self.max_sessions = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECTOR_MAX_SESSIONS must be a positive integer"))?;
        }
        if let Ok(value) = std::env::var("DETECTOR_RETRY_MAX_ATTEMPTS") {
            self.driver.retry.max_attempts = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETECTOR_RETRY_MAX_ATTEMPTS must be a positive integer"))?;
        }
        if let Ok(broker) = std::env::var("DETECTOR_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                match self.mqtt.as_mut() {
                    Some(mqtt) => mqtt.broker_addr = broker,
                    None => self.mqtt = Some(MqttSettings::new(&broker)),
                }
            }
        }
        if let Ok(prefix) = std::env::var("DETECTOR_TOPIC_PREFIX") {
            if !prefix.trim().is_empty() {
                self.bus.topic_prefix = prefix.trim().to_string();
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| anyhow!("api.addr '{}' is not a socket address", self.api_addr))?;
        if self.max_sessions == 0 {
            return Err(anyhow!("sessions.max_sessions must be greater than zero"));
        }
        if self.driver.retry.max_attempts == 0 {
            return Err(anyhow!("driver.max_attempts must be greater than zero"));
        }
        for (name, value) in [
            ("driver.dial_timeout_ms", self.driver.dial_timeout),
            ("driver.frame_timeout_ms", self.driver.frame_timeout),
            ("driver.fps_window_ms", self.driver.fps_window),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.driver.retry.max_delay < self.driver.retry.base_delay {
            return Err(anyhow!(
                "driver.backoff_max_ms must not be below driver.backoff_base_ms"
            ));
        }
        if self.driver.backend.trim().is_empty() {
            return Err(anyhow!("detector.backend must not be empty"));
        }
        if self.bus.buffer_capacity == 0 {
            return Err(anyhow!("bus.buffer_capacity must be greater than zero"));
        }
        if !is_valid_token(&self.bus.topic_prefix) {
            return Err(anyhow!(
                "bus.topic_prefix '{}' is not a valid topic token",
                self.bus.topic_prefix
            ));
        }
        if let Some(mqtt) = &self.mqtt {
            mqtt.endpoint()?;
        }
        Ok(())
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            max_sessions: self.max_sessions,
            driver: self.driver.clone(),
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api_addr.clone(),
        }
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn read_config_file(path: &Path) -> Result<DetectordConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
