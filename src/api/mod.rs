//! Control API.
//!
//! [`ControlApi`] maps requests onto the session store and app registry and
//! holds no state of its own. Expected failures (unknown app, duplicate
//! stream, bad settings, unknown stream) are reported in the response's
//! `err`/`meta` fields, never as transport errors. [`ApiServer`] exposes the
//! facade as loopback JSON-over-HTTP and [`ControlClient`] talks to it.

mod client;
mod server;
mod types;

use serde_json::json;

use crate::error::RegistrationError;
use crate::session::{SessionSnapshot, SessionStore, SessionUpdate};
use crate::settings::StreamSettings;

pub use client::ControlClient;
pub use server::{ApiConfig, ApiHandle, ApiServer, DEFAULT_API_ADDR, MAX_REQUEST_BYTES};
pub use types::{
    AppInfo, AppList, AppReq, AppRes, Inference, InferenceList, InferenceReq, InferenceRes,
    InferenceResList, ModelInfo,
};

#[derive(Clone)]
pub struct ControlApi {
    store: SessionStore,
}

impl ControlApi {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn get_app_list(&self, _req: &AppReq) -> AppList {
        AppList {
            app: self
                .store
                .registry()
                .list()
                .into_iter()
                .map(AppInfo::from)
                .collect(),
        }
    }

    pub fn add_inference(&self, req: &InferenceReq) -> InferenceRes {
        log::info!(
            "AddInference app={} stream={} uri={}",
            req.app_id,
            req.stream_id,
            req.uri
        );
        let created = StreamSettings::parse(&req.settings)
            .map_err(RegistrationError::from)
            .and_then(|settings| {
                self.store
                    .create(&req.app_id, &req.stream_id, &req.uri, settings)
            });
        match created {
            Ok(snapshot) => success(snapshot, String::new()),
            Err(err) => {
                log::warn!("AddInference {} rejected: {}", req.stream_id, err);
                failure(req, &err.to_string(), err.code())
            }
        }
    }

    /// Replace a session's app, uri or settings; empty fields keep the
    /// current value. The session restarts under the same stream id.
    pub fn update_inference(&self, req: &InferenceReq) -> InferenceRes {
        log::info!(
            "UpdateInference stream={} app={} uri={}",
            req.stream_id,
            req.app_id,
            req.uri
        );
        let updated = if req.stream_id.is_empty() {
            Err(RegistrationError::InvalidRequest("stream_id is required".into()))
        } else {
            non_empty(&req.settings)
                .map(StreamSettings::parse)
                .transpose()
                .map_err(RegistrationError::from)
                .and_then(|settings| {
                    self.store.update(
                        &req.stream_id,
                        SessionUpdate {
                            app_id: non_empty(&req.app_id).map(str::to_string),
                            uri: non_empty(&req.uri).map(str::to_string),
                            settings,
                        },
                    )
                })
        };
        match updated {
            Ok(snapshot) => success(snapshot, String::new()),
            Err(err) => {
                log::warn!("UpdateInference {} rejected: {}", req.stream_id, err);
                failure(req, &err.to_string(), err.code())
            }
        }
    }

    pub fn get_inference_status(&self, req: &InferenceReq) -> InferenceRes {
        match self.store.get_status(&req.stream_id) {
            Ok(snapshot) => {
                let err = snapshot.last_error.clone().unwrap_or_default();
                success(snapshot, err)
            }
            Err(err) => failure(req, &err.to_string(), err.code()),
        }
    }

    /// Status of every session in creation order; a non-empty `app_id`
    /// filters.
    pub fn get_inference_status_all(&self, req: &AppReq) -> InferenceResList {
        InferenceResList {
            res: self
                .store
                .list(non_empty(&req.app_id))
                .into_iter()
                .map(|snapshot| {
                    let err = snapshot.last_error.clone().unwrap_or_default();
                    success(snapshot, err)
                })
                .collect(),
        }
    }

    /// All sessions in creation order; a non-empty `app_id` filters.
    pub fn get_inference_list(&self, req: &InferenceReq) -> InferenceList {
        InferenceList {
            inferences: self
                .store
                .list(non_empty(&req.app_id))
                .into_iter()
                .map(Inference::from)
                .collect(),
        }
    }

    pub fn remove_inference(&self, req: &InferenceReq) -> InferenceRes {
        log::info!("RemoveInference stream={}", req.stream_id);
        match self.store.remove(&req.stream_id) {
            Ok(snapshot) => success(snapshot, String::new()),
            Err(err) => failure(req, &err.to_string(), err.code()),
        }
    }

    /// Remove every session of one application. `app_id` is required.
    pub fn remove_inference_all(&self, req: &AppReq) -> AppRes {
        log::info!("RemoveInferenceAll app={}", req.app_id);
        if req.app_id.is_empty() {
            return AppRes {
                result: false,
                count: 0,
                err: "app_id is required".to_string(),
            };
        }
        let removed = self.store.remove_all(&req.app_id);
        AppRes {
            result: true,
            count: removed.len() as u32,
            err: String::new(),
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value).filter(|v| !v.is_empty())
}

fn success(snapshot: SessionSnapshot, err: String) -> InferenceRes {
    InferenceRes {
        count: 1,
        status: snapshot.state.as_u8(),
        err,
        meta: None,
        app_id: snapshot.app_id,
        stream_id: snapshot.stream_id,
    }
}

fn failure(req: &InferenceReq, message: &str, code: &str) -> InferenceRes {
    InferenceRes {
        count: 0,
        status: 0,
        err: message.to_string(),
        meta: Some(json!({ "error": message, "code": code }).to_string()),
        app_id: req.app_id.clone(),
        stream_id: req.stream_id.clone(),
    }
}
