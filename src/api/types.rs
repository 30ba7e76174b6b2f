//! Request and response records of the control API.

use serde::{Deserialize, Serialize};

use crate::registry::Application;
use crate::session::{LifecycleState, SessionSnapshot};

/// Application-scoped request. An empty `app_id` means every application
/// where the operation allows it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppReq {
    #[serde(default)]
    pub app_id: String,
}

impl AppReq {
    pub fn app(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
        }
    }
}

/// Outcome of an application-scoped bulk operation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppRes {
    pub result: bool,
    /// Sessions affected.
    pub count: u32,
    #[serde(default)]
    pub err: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InferenceReq {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub stream_id: String,
    #[serde(default)]
    pub uri: String,
    /// Embedded JSON settings document; empty selects the defaults.
    #[serde(default)]
    pub settings: String,
}

impl InferenceReq {
    pub fn stream(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InferenceRes {
    /// 1 when the operation affected a session, 0 otherwise.
    pub count: u32,
    /// Lifecycle state number (NG=0, READY=1, CONNECTING=2, CONNECTED=3).
    pub status: u8,
    /// Error message, empty on success.
    pub err: String,
    /// `{"error": ..., "code": ...}` on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<String>,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub stream_id: String,
}

impl InferenceRes {
    pub fn state(&self) -> Option<LifecycleState> {
        LifecycleState::try_from(self.status).ok()
    }

    pub fn is_ok(&self) -> bool {
        self.meta.is_none()
    }

    /// Taxonomy name of the failure, if any.
    pub fn code(&self) -> Option<String> {
        let meta: serde_json::Value = serde_json::from_str(self.meta.as_deref()?).ok()?;
        meta.get("code")?.as_str().map(str::to_string)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

impl From<Application> for AppInfo {
    fn from(app: Application) -> Self {
        Self {
            id: app.id,
            name: app.name,
            desc: app.description,
            version: app.version,
            models: app
                .models
                .into_iter()
                .map(|m| ModelInfo {
                    name: m.name,
                    path: m.path,
                    labels: m.labels,
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppList {
    pub app: Vec<AppInfo>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Inference {
    pub app_id: String,
    pub stream_id: String,
    pub uri: String,
    pub status: u8,
    pub current_fps: f64,
    pub frame_count: u64,
    #[serde(default)]
    pub last_error: String,
}

impl From<SessionSnapshot> for Inference {
    fn from(snap: SessionSnapshot) -> Self {
        Self {
            app_id: snap.app_id,
            stream_id: snap.stream_id,
            uri: snap.uri,
            status: snap.state.as_u8(),
            current_fps: snap.current_fps,
            frame_count: snap.frame_count,
            last_error: snap.last_error.unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InferenceResList {
    pub res: Vec<InferenceRes>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceList {
    pub inferences: Vec<Inference>,
}
