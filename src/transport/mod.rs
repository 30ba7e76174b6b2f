//! Outbound transports for the event bus.
//!
//! The MQTT sink mirrors bus topics onto an MQTT broker so out-of-process
//! subscribers can follow detection events.

pub mod mqtt;

pub use mqtt::{
    bus_topic_to_mqtt, connect_mqtt, connect_mqtt_subscriber, parse_mqtt_endpoint,
    validate_loopback_addr, MqttEndpoint, MqttEventSink, MqttRuntime, MqttSettings,
};
