use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Deserialize;

use crate::events::{DetectionEvent, EventSink};

const DEFAULT_CLIENT_ID: &str = "detectord";
const REQUEST_CAPACITY: usize = 64;

/// MQTT mirror settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct MqttSettings {
    /// `host:port`, optionally prefixed with `mqtt://` or `mqtts://`.
    pub broker_addr: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Prepended to every mirrored topic, e.g. `site1` -> `site1/stream/cam1`.
    #[serde(default)]
    pub topic_root: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub allow_remote: bool,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

impl MqttSettings {
    pub fn new(broker_addr: &str) -> Self {
        Self {
            broker_addr: broker_addr.to_string(),
            client_id: default_client_id(),
            topic_root: None,
            username: None,
            password: None,
            allow_remote: false,
        }
    }

    pub fn endpoint(&self) -> Result<MqttEndpoint> {
        let endpoint = parse_mqtt_endpoint(&self.broker_addr, false)?;
        if !self.allow_remote {
            validate_loopback_addr(&endpoint, &self.broker_addr)?;
        }
        Ok(endpoint)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // [::1]:1883
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    let host = endpoint.host.as_str();
    if host == "localhost" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(anyhow!(
        "MQTT broker must be loopback: {} (set mqtt.allow_remote to override)",
        original
    ))
}

/// Map a dot-separated bus topic onto an MQTT topic.
pub fn bus_topic_to_mqtt(topic_root: Option<&str>, bus_topic: &str) -> String {
    let mapped = bus_topic.replace('.', "/");
    match topic_root.map(|root| root.trim_matches('/')) {
        Some(root) if !root.is_empty() => format!("{}/{}", root, mapped),
        _ => mapped,
    }
}

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const STOP_POLL: Duration = Duration::from_millis(50);

/// Client plus the thread driving its connection.
///
/// Connection errors are logged and the connection is re-dialled with
/// doubling backoff. Publishes queue in the client's request channel while
/// the broker is unreachable. The thread exits only after [`disconnect`].
///
/// [`disconnect`]: MqttRuntime::disconnect
pub struct MqttRuntime {
    pub client: Client,
    stop: Arc<AtomicBool>,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut delay = RECONNECT_BASE_DELAY;
            let mut failures: u64 = 0;
            // The iterator ends once every client handle is dropped.
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if failures > 0 {
                            log::info!("MQTT reconnected after {} failed attempts", failures);
                        }
                        failures = 0;
                        delay = RECONNECT_BASE_DELAY;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if thread_stop.load(Ordering::SeqCst) {
                            break;
                        }
                        failures += 1;
                        log::warn!(
                            "MQTT connection error (attempt {}, retrying in {} ms): {}",
                            failures,
                            delay.as_millis(),
                            e
                        );
                        if sleep_unless_stopped(&thread_stop, delay) {
                            break;
                        }
                        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    }
                }
            }
        });
        Self {
            client,
            stop,
            connection_handle: Some(handle),
        }
    }

    pub fn disconnect(self) -> Result<()> {
        let MqttRuntime {
            client,
            stop,
            mut connection_handle,
        } = self;
        stop.store(true, Ordering::SeqCst);
        // The request queue may be full while the broker is unreachable.
        let result = client.try_disconnect();
        drop(client);
        if let Some(handle) = connection_handle.take() {
            let _ = handle.join();
        }
        result?;
        Ok(())
    }
}

/// Returns true if `stop` was raised before `delay` elapsed.
fn sleep_unless_stopped(stop: &AtomicBool, delay: Duration) -> bool {
    let deadline = std::time::Instant::now() + delay;
    while std::time::Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return true;
        }
        std::thread::sleep(STOP_POLL);
    }
    stop.load(Ordering::SeqCst)
}

fn mqtt_options(settings: &MqttSettings, endpoint: &MqttEndpoint) -> MqttOptions {
    let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    if let Some(user) = settings.username.as_deref() {
        options.set_credentials(user, settings.password.clone().unwrap_or_default());
    }
    if endpoint.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Connect a publishing client. The connection is driven on a background thread.
pub fn connect_mqtt(settings: &MqttSettings) -> Result<MqttRuntime> {
    let endpoint = settings.endpoint()?;
    let (client, connection) = Client::new(mqtt_options(settings, &endpoint), REQUEST_CAPACITY);
    log::info!(
        "MQTT client for {}:{} (TLS: {}, auth: {})",
        endpoint.host,
        endpoint.port,
        endpoint.use_tls,
        settings.username.is_some()
    );
    Ok(MqttRuntime::new(client, connection))
}

/// Connect a client whose connection the caller iterates (for subscribers).
pub fn connect_mqtt_subscriber(settings: &MqttSettings) -> Result<(Client, Connection)> {
    let endpoint = settings.endpoint()?;
    Ok(Client::new(mqtt_options(settings, &endpoint), REQUEST_CAPACITY))
}

/// Event sink publishing each detection event as JSON with QoS 1.
pub struct MqttEventSink {
    runtime: Option<MqttRuntime>,
    topic_root: Option<String>,
}

impl MqttEventSink {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        Ok(Self {
            runtime: Some(connect_mqtt(settings)?),
            topic_root: settings.topic_root.clone(),
        })
    }
}

impl EventSink for MqttEventSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn send(&mut self, topic: &str, event: &DetectionEvent) -> Result<()> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow!("MQTT client already closed"))?;
        let payload = serde_json::to_vec(event)?;
        let topic = bus_topic_to_mqtt(self.topic_root.as_deref(), topic);
        runtime
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            if let Err(err) = runtime.disconnect() {
                log::warn!("MQTT disconnect failed: {}", err);
            }
        }
    }
}
