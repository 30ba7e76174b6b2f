//! Session store: the single owned table of inference sessions.
//!
//! Structural changes (create, remove) take the table's write lock; status
//! reads take the read lock only long enough to clone the session handle and
//! then copy its fields without blocking the worker. Each session is driven
//! by its own worker thread (see [`driver`]).

mod driver;
mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;

use url::Url;

use crate::detect::{BackendRegistry, DetectorBackend};
use crate::error::{LookupError, RegistrationError};
use crate::events::EventBus;
use crate::ingest::{DefaultSourceFactory, SourceFactory};
use crate::registry::AppRegistry;
use crate::settings::StreamSettings;

pub use driver::{
    DriverSettings, RetryPolicy, DEFAULT_DIAL_TIMEOUT, DEFAULT_FPS_WINDOW, DEFAULT_FRAME_TIMEOUT,
    DEFAULT_MAX_CONSECUTIVE_READ_ERRORS,
};
pub use state::{LifecycleState, SessionSnapshot};

use driver::Worker;
use state::SessionShared;

pub const DEFAULT_MAX_SESSIONS: usize = 4;

#[derive(Clone, Debug)]
pub struct StoreSettings {
    pub max_sessions: usize,
    pub driver: DriverSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            driver: DriverSettings::default(),
        }
    }
}

/// Changes applied by [`SessionStore::update`].
#[derive(Clone, Debug, Default)]
pub struct SessionUpdate {
    pub app_id: Option<String>,
    pub uri: Option<String>,
    pub settings: Option<StreamSettings>,
}

fn parse_uri(uri: &str) -> Result<Url, RegistrationError> {
    Url::parse(uri.trim()).map_err(|e| {
        RegistrationError::InvalidRequest(format!("uri '{}' is not valid: {}", uri, e))
    })
}

/// Stream ids double as topic tokens, so they are restricted to a safe set.
pub fn validate_stream_id(stream_id: &str) -> Result<(), RegistrationError> {
    static STREAM_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = STREAM_ID_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
    if !re.is_match(stream_id) {
        return Err(RegistrationError::InvalidRequest(format!(
            "stream_id '{}' must match ^[A-Za-z0-9_-]{{1,64}}$",
            stream_id
        )));
    }
    Ok(())
}

struct SessionEntry {
    shared: Arc<SessionShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEntry {
    fn join_worker(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("{}: worker panicked", self.shared.stream_id);
            }
        }
    }
}

/// Owner of every live session. Cloning shares the same table.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    registry: AppRegistry,
    bus: EventBus,
    sources: Arc<dyn SourceFactory>,
    backends: BackendRegistry,
    settings: StoreSettings,
    next_seq: AtomicU64,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionStore {
    /// Store using the default frame sources and built-in detector backends.
    pub fn new(registry: AppRegistry, bus: EventBus, settings: StoreSettings) -> Self {
        Self::with_components(
            registry,
            bus,
            settings,
            Arc::new(DefaultSourceFactory),
            BackendRegistry::with_builtin(),
        )
    }

    pub fn with_components(
        registry: AppRegistry,
        bus: EventBus,
        settings: StoreSettings,
        sources: Arc<dyn SourceFactory>,
        backends: BackendRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                registry,
                bus,
                sources,
                backends,
                settings,
                next_seq: AtomicU64::new(1),
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.settings.max_sessions
    }

    /// Register a stream and start its worker. Never waits on the connection.
    pub fn create(
        &self,
        app_id: &str,
        stream_id: &str,
        uri: &str,
        settings: StreamSettings,
    ) -> Result<SessionSnapshot, RegistrationError> {
        validate_stream_id(stream_id)?;
        let uri = parse_uri(uri)?;
        settings.validate()?;
        let backend = self.backend_for(app_id, stream_id)?;

        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner());

        let replaced = match sessions.get(stream_id) {
            Some(existing) if existing.shared.is_terminal() => Some(Arc::clone(existing)),
            Some(_) => return Err(RegistrationError::DuplicateStream(stream_id.to_string())),
            None => None,
        };
        let live = sessions.len() - usize::from(replaced.is_some());
        if live >= self.inner.settings.max_sessions {
            return Err(RegistrationError::CapacityExceeded(
                self.inner.settings.max_sessions,
            ));
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (entry, snapshot) = self.start(app_id, stream_id, uri, settings, seq, backend)?;
        if let Some(old) = replaced {
            // Terminal workers have already exited.
            old.join_worker();
            log::info!("{}: replacing terminally failed session", stream_id);
        }
        sessions.insert(stream_id.to_string(), entry);
        log::info!(
            "{}: session added (app={}, uri={}, {}x{}@{})",
            stream_id,
            app_id,
            snapshot.uri,
            settings.width,
            settings.height,
            settings.fps
        );
        Ok(snapshot)
    }

    /// Change a session's app, uri or settings. Fields left `None` keep their
    /// current value. The old worker is cancelled and joined, then a fresh
    /// session starts under the same stream id and list position with its
    /// counters reset. A rejected update leaves the old session running.
    pub fn update(
        &self,
        stream_id: &str,
        update: SessionUpdate,
    ) -> Result<SessionSnapshot, RegistrationError> {
        let old = self
            .entry(stream_id)
            .ok_or_else(|| LookupError::NotFound(stream_id.to_string()))?;
        let app_id = update
            .app_id
            .unwrap_or_else(|| old.shared.app_id.clone());
        let uri = match update.uri {
            Some(raw) => parse_uri(&raw)?,
            None => old.shared.uri.clone(),
        };
        let settings = update.settings.unwrap_or(old.shared.settings);
        settings.validate()?;
        let backend = self.backend_for(&app_id, stream_id)?;

        old.shared.cancel.cancel();
        old.join_worker();

        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match sessions.get(stream_id) {
            Some(current) if Arc::ptr_eq(current, &old) => {}
            _ => return Err(LookupError::NotFound(stream_id.to_string()).into()),
        }
        let (entry, snapshot) =
            match self.start(&app_id, stream_id, uri, settings, old.shared.seq, backend) {
                Ok(started) => started,
                Err(err) => {
                    sessions.remove(stream_id);
                    return Err(err);
                }
            };
        sessions.insert(stream_id.to_string(), entry);
        log::info!(
            "{}: session updated (app={}, uri={}, {}x{}@{})",
            stream_id,
            app_id,
            snapshot.uri,
            settings.width,
            settings.height,
            settings.fps
        );
        Ok(snapshot)
    }

    fn backend_for(
        &self,
        app_id: &str,
        stream_id: &str,
    ) -> Result<Box<dyn DetectorBackend>, RegistrationError> {
        let app = self
            .inner
            .registry
            .get(app_id)
            .ok_or_else(|| RegistrationError::UnknownApp(app_id.to_string()))?;
        self.inner
            .backends
            .create(&self.inner.settings.driver.backend, &app.labels())
            .map_err(|e| RegistrationError::Spawn {
                stream_id: stream_id.to_string(),
                reason: format!("{:#}", e),
            })
    }

    /// Spawn the worker. The returned snapshot is taken before the worker
    /// runs, so it always shows the initial `NG` state.
    fn start(
        &self,
        app_id: &str,
        stream_id: &str,
        uri: Url,
        settings: StreamSettings,
        seq: u64,
        backend: Box<dyn DetectorBackend>,
    ) -> Result<(Arc<SessionEntry>, SessionSnapshot), RegistrationError> {
        let shared = Arc::new(SessionShared::new(stream_id, app_id, uri, settings, seq));
        let snapshot = shared.snapshot();
        let worker = Worker::new(
            Arc::clone(&shared),
            Arc::clone(&self.inner.sources),
            backend,
            self.inner.bus.clone(),
            self.inner.settings.driver.clone(),
        );
        let handle = std::thread::Builder::new()
            .name(format!("session-{}", stream_id))
            .spawn(move || worker.run())
            .map_err(|e| RegistrationError::Spawn {
                stream_id: stream_id.to_string(),
                reason: e.to_string(),
            })?;
        let entry = Arc::new(SessionEntry {
            shared,
            worker: Mutex::new(Some(handle)),
        });
        Ok((entry, snapshot))
    }

    fn entry(&self, stream_id: &str) -> Option<Arc<SessionEntry>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(stream_id)
            .cloned()
    }

    pub fn get_status(&self, stream_id: &str) -> Result<SessionSnapshot, LookupError> {
        self.entry(stream_id)
            .map(|entry| entry.shared.snapshot())
            .ok_or_else(|| LookupError::NotFound(stream_id.to_string()))
    }

    /// Sessions in creation order, optionally restricted to one application.
    pub fn list(&self, app_id: Option<&str>) -> Vec<SessionSnapshot> {
        let mut entries: Vec<Arc<SessionEntry>> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| app_id.map_or(true, |id| entry.shared.app_id == id))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.shared.seq);
        entries
            .iter()
            .map(|entry| entry.shared.snapshot())
            .collect()
    }

    /// Cancel the session's worker, wait for it to stop, then delete the
    /// session. Returns the final snapshot.
    pub fn remove(&self, stream_id: &str) -> Result<SessionSnapshot, LookupError> {
        let entry = self
            .entry(stream_id)
            .ok_or_else(|| LookupError::NotFound(stream_id.to_string()))?;
        entry.shared.cancel.cancel();
        entry.join_worker();

        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match sessions.get(stream_id) {
            Some(current) if Arc::ptr_eq(current, &entry) => {
                sessions.remove(stream_id);
            }
            _ => return Err(LookupError::NotFound(stream_id.to_string())),
        }
        drop(sessions);

        log::info!("{}: session removed", stream_id);
        Ok(entry.shared.snapshot())
    }

    /// Remove every session of one application. Workers are cancelled
    /// together and then joined. Returns the final snapshots in creation
    /// order.
    pub fn remove_all(&self, app_id: &str) -> Vec<SessionSnapshot> {
        let mut entries: Vec<Arc<SessionEntry>> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| entry.shared.app_id == app_id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.shared.seq);
        for entry in &entries {
            entry.shared.cancel.cancel();
        }
        for entry in &entries {
            entry.join_worker();
        }

        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        entries.retain(|entry| {
            let stream_id = entry.shared.stream_id.as_str();
            match sessions.get(stream_id) {
                Some(current) if Arc::ptr_eq(current, entry) => {
                    sessions.remove(stream_id);
                    true
                }
                _ => false,
            }
        });
        drop(sessions);

        log::info!("{}: removed {} sessions", app_id, entries.len());
        entries.iter().map(|entry| entry.shared.snapshot()).collect()
    }

    /// Cancel and join every worker, leaving the store empty.
    pub fn shutdown(&self) {
        let entries: Vec<Arc<SessionEntry>> = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &entries {
            entry.shared.cancel.cancel();
        }
        for entry in &entries {
            entry.join_worker();
        }
        if !entries.is_empty() {
            log::info!("session store shut down ({} sessions)", entries.len());
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let sessions = self.sessions.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in sessions.values() {
            entry.shared.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Application, Model};
    use std::time::{Duration, Instant};

    fn registry() -> AppRegistry {
        AppRegistry::new(vec![Application {
            id: "yolo".into(),
            name: "YOLO".into(),
            description: String::new(),
            version: "1".into(),
            models: vec![Model {
                name: "yolov8".into(),
                path: "/models/yolov8.hef".into(),
                labels: vec!["person".into()],
            }],
        }])
        .unwrap()
    }

    fn fast_settings() -> StoreSettings {
        StoreSettings {
            max_sessions: 2,
            driver: DriverSettings {
                dial_timeout: Duration::from_millis(200),
                frame_timeout: Duration::from_millis(200),
                retry: RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(20),
                },
                ..DriverSettings::default()
            },
        }
    }

    fn small() -> StreamSettings {
        StreamSettings::new(32, 24, 60, 0.0).unwrap()
    }

    fn wait_until(store: &SessionStore, id: &str, pred: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snap = store.get_status(id).unwrap();
            if pred(&snap) || Instant::now() > deadline {
                return snap;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn validates_before_creating() {
        let store = SessionStore::new(registry(), EventBus::default(), fast_settings());
        let err = store.create("yolo", "bad id", "stub://x", small()).unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
        let err = store.create("yolo", "cam1", "not a uri", small()).unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
        let err = store.create("nope", "cam1", "stub://x", small()).unwrap_err();
        assert_eq!(err, RegistrationError::UnknownApp("nope".into()));
        let bad = StreamSettings {
            fps: 0,
            ..small()
        };
        let err = store.create("yolo", "cam1", "stub://x", bad).unwrap_err();
        assert_eq!(err.code(), "InvalidSettings");
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_and_capacity_are_rejected() {
        let store = SessionStore::new(registry(), EventBus::default(), fast_settings());
        store.create("yolo", "a", "stub://a", small()).unwrap();
        assert_eq!(
            store.create("yolo", "a", "stub://a", small()).unwrap_err(),
            RegistrationError::DuplicateStream("a".into())
        );
        store.create("yolo", "b", "stub://b", small()).unwrap();
        assert_eq!(
            store.create("yolo", "c", "stub://c", small()).unwrap_err(),
            RegistrationError::CapacityExceeded(2)
        );
        store.shutdown();
        assert!(store.is_empty());
    }

    #[test]
    fn terminal_session_is_replaced() {
        let store = SessionStore::new(registry(), EventBus::default(), fast_settings());
        store.create("yolo", "cam1", "ftp://nowhere", small()).unwrap();
        let snap = wait_until(&store, "cam1", |s| s.terminal);
        assert!(snap.terminal);
        assert_eq!(snap.state, LifecycleState::Ng);

        let fresh = store.create("yolo", "cam1", "stub://cam1", small()).unwrap();
        assert!(!fresh.terminal);
        let snap = wait_until(&store, "cam1", |s| s.state == LifecycleState::Connected);
        assert_eq!(snap.state, LifecycleState::Connected);
        store.shutdown();
    }

    #[test]
    fn remove_joins_worker_and_forgets_session() {
        let store = SessionStore::new(registry(), EventBus::default(), fast_settings());
        store.create("yolo", "cam1", "stub://cam1", small()).unwrap();
        wait_until(&store, "cam1", |s| s.frame_count > 0);
        let last = store.remove("cam1").unwrap();
        assert!(last.frame_count > 0);
        assert_eq!(
            store.get_status("cam1").unwrap_err(),
            LookupError::NotFound("cam1".into())
        );
        assert!(store.remove("cam1").is_err());
    }

    #[test]
    fn update_restarts_session_in_place() {
        let store = SessionStore::new(registry(), EventBus::default(), fast_settings());
        store.create("yolo", "first", "stub://first", small()).unwrap();
        store.create("yolo", "cam1", "stub://cam1", small()).unwrap();
        wait_until(&store, "cam1", |s| s.frame_count > 2);

        let wider = StreamSettings::new(48, 32, 60, 0.0).unwrap();
        let updated = store
            .update(
                "cam1",
                SessionUpdate {
                    uri: Some("stub://cam1-hd".into()),
                    settings: Some(wider),
                    ..SessionUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.uri, "stub://cam1-hd");
        assert_eq!(updated.app_id, "yolo");
        assert_eq!(updated.settings, wider);
        assert_eq!(updated.frame_count, 0);

        let snap = wait_until(&store, "cam1", |s| s.state == LifecycleState::Connected);
        assert_eq!(snap.state, LifecycleState::Connected);
        let ids: Vec<_> = store.list(None).into_iter().map(|s| s.stream_id).collect();
        assert_eq!(ids, vec!["first", "cam1"]);
        store.shutdown();
    }

    #[test]
    fn rejected_update_keeps_old_session() {
        let store = SessionStore::new(registry(), EventBus::default(), fast_settings());
        store.create("yolo", "cam1", "stub://cam1", small()).unwrap();
        wait_until(&store, "cam1", |s| s.frame_count > 0);

        let err = store
            .update(
                "cam1",
                SessionUpdate {
                    app_id: Some("nope".into()),
                    ..SessionUpdate::default()
                },
            )
            .unwrap_err();
        assert_eq!(err, RegistrationError::UnknownApp("nope".into()));
        let err = store
            .update("ghost", SessionUpdate::default())
            .unwrap_err();
        assert_eq!(err.code(), "NotFound");

        let before = store.get_status("cam1").unwrap().frame_count;
        let after = wait_until(&store, "cam1", |s| s.frame_count > before);
        assert!(after.frame_count > before);
        assert_eq!(after.uri, "stub://cam1");
        store.shutdown();
    }

    #[test]
    fn remove_all_only_touches_one_app() {
        let mut apps = registry().list();
        apps.push(Application {
            id: "fire".into(),
            name: "Fire".into(),
            description: String::new(),
            version: "1".into(),
            models: Vec::new(),
        });
        let settings = StoreSettings {
            max_sessions: 4,
            ..fast_settings()
        };
        let store = SessionStore::new(AppRegistry::new(apps).unwrap(), EventBus::default(), settings);
        store.create("yolo", "a", "stub://a", small()).unwrap();
        store.create("fire", "b", "stub://b", small()).unwrap();
        store.create("yolo", "c", "stub://c", small()).unwrap();

        let removed: Vec<_> = store
            .remove_all("yolo")
            .into_iter()
            .map(|s| s.stream_id)
            .collect();
        assert_eq!(removed, vec!["a", "c"]);
        let left: Vec<_> = store.list(None).into_iter().map(|s| s.stream_id).collect();
        assert_eq!(left, vec!["b"]);
        assert!(store.remove_all("yolo").is_empty());
        store.shutdown();
    }

    #[test]
    fn list_is_in_creation_order_and_filterable() {
        let store = SessionStore::new(registry(), EventBus::default(), fast_settings());
        store.create("yolo", "zeta", "stub://z", small()).unwrap();
        store.create("yolo", "alpha", "stub://a", small()).unwrap();
        let ids: Vec<_> = store.list(None).into_iter().map(|s| s.stream_id).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
        assert_eq!(store.list(Some("yolo")).len(), 2);
        assert!(store.list(Some("other")).is_empty());
        store.shutdown();
    }
}
