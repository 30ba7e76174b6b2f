use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use stream_detector::api::{ApiConfig, DEFAULT_API_ADDR};
use stream_detector::config::DetectordConfig;
use stream_detector::AppRegistry;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "DETECTOR_CONFIG",
        "DETECTOR_API_ADDR",
        "DETECTOR_MODELS_DIR",
        "DETECTOR_MAX_SESSIONS",
        "DETECTOR_RETRY_MAX_ATTEMPTS",
        "DETECTOR_MQTT_BROKER",
        "DETECTOR_TOPIC_PREFIX",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = DetectordConfig::load().expect("load defaults");
    assert_eq!(cfg.api_addr, "127.0.0.1:50052");
    assert_eq!(cfg.max_sessions, 4);
    assert_eq!(cfg.driver.retry.max_attempts, 10);
    assert_eq!(cfg.driver.retry.base_delay, Duration::from_millis(3000));
    assert_eq!(cfg.driver.dial_timeout, Duration::from_millis(5000));
    assert_eq!(cfg.driver.backend, "stub");
    assert_eq!(cfg.bus.topic_prefix, "stream");
    assert_eq!(cfg.bus.buffer_capacity, 64);
    assert!(cfg.registry.apps.is_empty());
    assert!(cfg.registry.models_dir.is_none());
    assert!(cfg.mqtt.is_none());
    assert_eq!(cfg.api_config().addr, DEFAULT_API_ADDR);
    assert_eq!(ApiConfig::default().addr, cfg.api_addr);
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "api": { "addr": "127.0.0.1:6000" },
            "registry": {
                "apps": [{
                    "id": "yolo",
                    "name": "YOLO",
                    "models": [{ "name": "yolov8n", "path": "/models/yolov8n/model.hef" }]
                }]
            },
            "sessions": { "max_sessions": 2 },
            "driver": { "dial_timeout_ms": 750, "max_attempts": 3, "backoff_base_ms": 100 },
            "bus": { "buffer_capacity": 8 },
            "mqtt": { "broker_addr": "127.0.0.1:1883", "topic_root": "site1" }
        }"#,
    );
    std::env::set_var("DETECTOR_CONFIG", file.path());
    std::env::set_var("DETECTOR_API_ADDR", "127.0.0.1:7000");
    std::env::set_var("DETECTOR_RETRY_MAX_ATTEMPTS", "5");
    std::env::set_var("DETECTOR_TOPIC_PREFIX", "video");

    let cfg = DetectordConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "127.0.0.1:7000");
    assert_eq!(cfg.registry.apps.len(), 1);
    assert_eq!(cfg.registry.apps[0].id, "yolo");
    assert_eq!(cfg.max_sessions, 2);
    assert_eq!(cfg.driver.dial_timeout, Duration::from_millis(750));
    assert_eq!(cfg.driver.retry.max_attempts, 5);
    assert_eq!(cfg.driver.retry.base_delay, Duration::from_millis(100));
    assert_eq!(cfg.driver.frame_timeout, Duration::from_millis(2000));
    assert_eq!(cfg.bus.topic_prefix, "video");
    assert_eq!(cfg.bus.buffer_capacity, 8);
    let mqtt = cfg.mqtt.as_ref().expect("mqtt section");
    assert_eq!(mqtt.topic_root.as_deref(), Some("site1"));
    assert_eq!(mqtt.client_id, "detectord");

    let store = cfg.store_settings();
    assert_eq!(store.max_sessions, 2);
    assert_eq!(store.driver.retry.max_attempts, 5);

    clear_env();
}

#[test]
fn loads_toml_config_and_models_dir() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let models = tempfile::tempdir().expect("models dir");
    let model_dir = models.path().join("person");
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::write(
        model_dir.join("model_config.json"),
        r#"{"model_id":"person-det","name":"Person","labels":["person"]}"#,
    )
    .unwrap();

    let file = write_config(
        ".toml",
        r#"
[detector]
backend = "stub"

[driver]
frame_timeout_ms = 500
max_consecutive_read_errors = 2

[[registry.apps]]
id = "yolo"
name = "YOLO"
"#,
    );
    std::env::set_var("DETECTOR_CONFIG", file.path());
    std::env::set_var("DETECTOR_MODELS_DIR", models.path());
    std::env::set_var("DETECTOR_MQTT_BROKER", "localhost:1883");

    let cfg = DetectordConfig::load().expect("load toml config");
    assert_eq!(cfg.driver.frame_timeout, Duration::from_millis(500));
    assert_eq!(cfg.driver.max_consecutive_read_errors, 2);
    assert_eq!(cfg.registry.models_dir.as_deref(), Some(models.path()));
    assert_eq!(cfg.mqtt.as_ref().unwrap().broker_addr, "localhost:1883");

    let registry = AppRegistry::load(&cfg.registry).expect("load registry");
    let ids: Vec<_> = registry.list().into_iter().map(|app| app.id).collect();
    assert_eq!(ids, vec!["yolo", "person-det"]);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("DETECTOR_MAX_SESSIONS", "0");
    let err = DetectordConfig::load().unwrap_err();
    assert!(err.to_string().contains("max_sessions"), "{err}");

    std::env::set_var("DETECTOR_MAX_SESSIONS", "many");
    assert!(DetectordConfig::load().is_err());
    std::env::remove_var("DETECTOR_MAX_SESSIONS");

    std::env::set_var("DETECTOR_TOPIC_PREFIX", "bad.prefix");
    let err = DetectordConfig::load().unwrap_err();
    assert!(err.to_string().contains("topic_prefix"), "{err}");
    std::env::remove_var("DETECTOR_TOPIC_PREFIX");

    std::env::set_var("DETECTOR_MQTT_BROKER", "10.0.0.5:1883");
    let err = DetectordConfig::load().unwrap_err();
    assert!(err.to_string().contains("loopback"), "{err}");
    std::env::remove_var("DETECTOR_MQTT_BROKER");

    let file = write_config(".json", r#"{"driver": {"frame_timeout_ms": 0}}"#);
    std::env::set_var("DETECTOR_CONFIG", file.path());
    let err = DetectordConfig::load().unwrap_err();
    assert!(err.to_string().contains("frame_timeout_ms"), "{err}");

    let file = write_config(".json", "{ not json");
    std::env::set_var("DETECTOR_CONFIG", file.path());
    let err = DetectordConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"), "{err}");

    clear_env();
}
