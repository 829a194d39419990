//! MQTT session settings and option building
//!
//! Pure functions only; the event loop lives in [`super::client`].

use super::super::TransportError;
use crate::address::{EndpointAddress, Scheme};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport;
use std::time::Duration;
use uuid::Uuid;

/// Tunables for [`MqttBrokerTransport`](super::MqttBrokerTransport)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    /// How long to wait for the broker's CONNACK
    pub connect_timeout: Duration,
    /// Capacity of the client's request channel
    pub request_capacity: usize,
    pub max_packet_size: u32,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id_prefix: "busproxy".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            request_capacity: 64,
            max_packet_size: 256 * 1024,
        }
    }
}

impl MqttSettings {
    /// Fresh client id per session; brokers kick duplicate ids
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, Uuid::new_v4().simple())
    }
}

/// Session state as seen by the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected(String),
}

/// Build rumqttc options for one session against `address`
pub fn configure_mqtt_options(
    settings: &MqttSettings,
    address: &EndpointAddress,
    client_id: &str,
) -> Result<MqttOptions, TransportError> {
    match address.scheme() {
        Scheme::Mqtt | Scheme::Mqtts => {}
        other => {
            return Err(TransportError::InvalidBrokerUrl(format!(
                "scheme {} is not served by the MQTT transport",
                other.as_str()
            )))
        }
    }
    if settings.keep_alive < Duration::from_secs(1) {
        return Err(TransportError::InvalidBrokerUrl(
            "keep-alive must be at least one second".to_string(),
        ));
    }

    let mut options = MqttOptions::new(client_id, address.network_host(), address.port());
    if address.scheme().is_tls() {
        options.set_transport(Transport::tls_with_default_config());
    }
    if let Some(username) = address.username() {
        options.set_credentials(username, address.password().unwrap_or_default());
    }
    options.set_keep_alive(settings.keep_alive);
    options.set_max_packet_size(Some(settings.max_packet_size));
    options.set_clean_start(true);

    Ok(options)
}

/// Durable messages need an acknowledged delivery
pub fn qos_for(durable: bool) -> QoS {
    if durable {
        QoS::AtLeastOnce
    } else {
        QoS::AtMostOnce
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
