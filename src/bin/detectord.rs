//! detectord - stream inference session manager daemon
//!
//! 1. Loads configuration and the application catalogue (fatal on failure)
//! 2. Builds the event bus and the session store
//! 3. Optionally mirrors every bus topic to an MQTT broker
//! 4. Serves the control API on a loopback address until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;

use stream_detector::{
    api::{ApiServer, ControlApi},
    detect::BackendRegistry,
    events::{spawn_forwarder, EventBus},
    ingest::{DefaultSourceFactory, RTSP_SUPPORTED},
    transport::MqttEventSink,
    AppRegistry, DetectordConfig, SessionStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = DetectordConfig::load()?;
    let registry = AppRegistry::load(&config.registry)
        .map_err(|e| anyhow!("failed to load app registry: {:#}", e))?;
    for app in registry.list() {
        log::info!("app {} ({} models)", app.id, app.models.len());
    }

    let backends = BackendRegistry::with_builtin();
    if !backends.list().contains(&config.driver.backend) {
        return Err(anyhow!(
            "unknown detector backend '{}' (available: {})",
            config.driver.backend,
            backends.list().join(", ")
        ));
    }

    if !RTSP_SUPPORTED {
        log::warn!(
            "built without rtsp-gstreamer: rtsp:// streams will fail without retrying, \
             only stub:// sources are available"
        );
    }

    let bus = EventBus::new(&config.bus.topic_prefix, config.bus.buffer_capacity)?;
    let store = SessionStore::with_components(
        registry,
        bus.clone(),
        config.store_settings(),
        std::sync::Arc::new(DefaultSourceFactory),
        backends,
    );

    let forwarder = match &config.mqtt {
        Some(mqtt) => {
            let sink = MqttEventSink::connect(mqtt)?;
            let handle = spawn_forwarder(&bus, &bus.wildcard(), sink)?;
            log::info!("mirroring {} to MQTT broker {}", bus.wildcard(), mqtt.broker_addr);
            Some(handle)
        }
        None => None,
    };

    let api_handle = ApiServer::new(config.api_config(), ControlApi::new(store.clone())).spawn()?;
    log::info!("control api listening on {}", api_handle.addr);
    log::info!(
        "detectord running: max {} sessions, backend {}, events on {}.<stream_id>",
        store.max_sessions(),
        config.driver.backend,
        bus.prefix()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("detectord waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    store.shutdown();
    if let Some(forwarder) = forwarder {
        forwarder.stop()?;
    }
    let stats = bus.stats();
    log::info!(
        "published {} events, delivered {}, dropped {}",
        stats.published,
        stats.delivered,
        stats.dropped
    );

    Ok(())
}
