//! TOML configuration for the `busproxy` binary and embedding applications
//!
//! ```toml
//! [broker]
//! url = "mqtts://broker.example.com:8883"
//! username_env = "BUS_USERNAME"
//! password_env = "BUS_PASSWORD"
//! target = "telemetry"
//!
//! [publisher]
//! durable = true
//! close_after_send = false
//!
//! [subscriber]
//! topic = "commands"
//! window_size = 20
//! ```
//!
//! Credentials are never stored in the file; only the names of the
//! environment variables holding them. They are read when the endpoint
//! address is built.

use crate::address::{AddressError, EndpointAddress, Scheme};
use crate::builder::DEFAULT_WINDOW_SIZE;
use crate::proxy::{PublisherOptions, SubscriberOptions};
use crate::transport::mqtt::MqttSettings;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub publisher: PublisherSection,
    #[serde(default)]
    pub subscriber: SubscriberSection,
}

/// Where the broker is and how to authenticate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Full URL; takes precedence over the individual fields below
    pub url: Option<String>,
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    /// Default topic or queue name
    pub target: String,
}

/// Client tuning shared by the broker adapters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Interval of the `heartbeat` command (default: 900 = 15 minutes)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_client_id_prefix() -> String {
    "busproxy".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    900
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Publisher proxy settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherSection {
    /// Defaults to `broker.target`
    pub topic: Option<String>,
    /// Defaults to a generated unique name
    pub link_name: Option<String>,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub reuse_existing_connection: bool,
    #[serde(default)]
    pub close_after_send: bool,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

fn default_send_timeout() -> u64 {
    10
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            topic: None,
            link_name: None,
            durable: false,
            reuse_existing_connection: false,
            close_after_send: false,
            send_timeout_secs: default_send_timeout(),
        }
    }
}

/// Subscriber proxy settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriberSection {
    /// Defaults to `broker.target`
    pub topic: Option<String>,
    /// Defaults to a generated unique name
    pub link_name: Option<String>,
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    #[serde(default)]
    pub reuse_existing_connection: bool,
}

fn default_window_size() -> u32 {
    DEFAULT_WINDOW_SIZE
}

impl Default for SubscriberSection {
    fn default() -> Self {
        Self {
            topic: None,
            link_name: None,
            window_size: default_window_size(),
            reuse_existing_connection: false,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker address: {0}")]
    Address(#[from] AddressError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no environment
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.target.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[broker] target must not be empty".to_string(),
            ));
        }
        if broker.url.is_none() && broker.host.is_none() && broker.ip.is_none() {
            return Err(ConfigError::InvalidConfig(
                "[broker] needs either url, host or ip".to_string(),
            ));
        }
        if let Some(scheme) = &broker.scheme {
            scheme.parse::<Scheme>()?;
        }
        if self.publisher.send_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "[publisher] send_timeout_secs must be positive".to_string(),
            ));
        }
        if self.transport.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "[transport] connect_timeout_secs must be positive".to_string(),
            ));
        }
        for (section, topic) in [
            ("publisher", &self.publisher.topic),
            ("subscriber", &self.subscriber.topic),
        ] {
            if topic.as_deref().is_some_and(|t| t.trim().is_empty()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "[{section}] topic must not be empty when set"
                )));
            }
        }
        Ok(())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Result<Option<String>, ConfigError> {
        match env_var_name {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// Broker username from its environment variable
    pub fn get_broker_username(&self) -> Result<Option<String>, ConfigError> {
        Self::get_env_var_optional(self.broker.username_env.as_ref())
    }

    /// Broker password from its environment variable
    pub fn get_broker_password(&self) -> Result<Option<String>, ConfigError> {
        Self::get_env_var_optional(self.broker.password_env.as_ref())
    }

    /// Build the endpoint address, resolving credentials from the environment
    pub fn endpoint_address(&self) -> Result<EndpointAddress, ConfigError> {
        let broker = &self.broker;
        let username = self.get_broker_username()?;
        let password = self.get_broker_password()?;

        if let Some(url) = &broker.url {
            let parsed = EndpointAddress::parse(url, broker.target.as_str())?;
            if username.is_none() {
                return Ok(parsed);
            }
            let mut builder = EndpointAddress::builder()
                .scheme(parsed.scheme())
                .port(parsed.port())
                .target(broker.target.as_str());
            builder = match parsed.ip() {
                Some(ip) if parsed.host().is_empty() => builder.ip(ip),
                _ => builder.host(parsed.host()),
            };
            builder = builder.credentials(username.unwrap_or_default(), password.unwrap_or_default());
            return Ok(builder.build()?);
        }

        let mut builder = EndpointAddress::builder().target(broker.target.as_str());
        if let Some(scheme) = &broker.scheme {
            builder = builder.scheme(scheme.parse()?);
        }
        if let Some(host) = &broker.host {
            builder = builder.host(host.as_str());
        }
        if let Some(ip) = broker.ip {
            builder = builder.ip(ip);
        }
        if let Some(port) = broker.port {
            builder = builder.port(port);
        }
        if let Some(username) = username {
            builder = builder.credentials(username, password.unwrap_or_default());
        }
        Ok(builder.build()?)
    }

    pub fn publisher_topic(&self) -> &str {
        self.publisher
            .topic
            .as_deref()
            .unwrap_or(&self.broker.target)
    }

    pub fn subscriber_topic(&self) -> &str {
        self.subscriber
            .topic
            .as_deref()
            .unwrap_or(&self.broker.target)
    }

    pub fn publisher_options(&self) -> PublisherOptions {
        let section = &self.publisher;
        let mut options = PublisherOptions::new(self.publisher_topic())
            .durable(section.durable)
            .reuse_existing_connection(section.reuse_existing_connection)
            .close_after_send(section.close_after_send)
            .send_timeout(Duration::from_secs(section.send_timeout_secs));
        if let Some(link_name) = &section.link_name {
            options = options.link_name(link_name.as_str());
        }
        options
    }

    pub fn subscriber_options(&self) -> SubscriberOptions {
        let section = &self.subscriber;
        let mut options = SubscriberOptions::new(self.subscriber_topic())
            .window_size(section.window_size)
            .reuse_existing_connection(section.reuse_existing_connection);
        if let Some(link_name) = &section.link_name {
            options = options.link_name(link_name.as_str());
        }
        options
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.transport.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.transport.heartbeat_interval_secs)
    }

    /// MQTT client settings from the `[transport]` section
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            client_id_prefix: self.transport.client_id_prefix.clone(),
            keep_alive: self.keep_alive(),
            connect_timeout: self.connect_timeout(),
            ..MqttSettings::default()
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
url = "memory://local"
target = "telemetry"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
url = "mqtts://broker.example.com:8883"
target = "telemetry"

[transport]
client_id_prefix = "gateway"
keep_alive_secs = 45

[publisher]
durable = true
close_after_send = true
send_timeout_secs = 3

[subscriber]
topic = "commands"
link_name = "commands-rx"
window_size = 5
reuse_existing_connection = true
"#;

        let config = BusConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.transport.client_id_prefix, "gateway");
        assert_eq!(config.keep_alive(), Duration::from_secs(45));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.publisher_topic(), "telemetry");
        assert_eq!(config.subscriber_topic(), "commands");

        let publisher = config.publisher_options();
        assert!(publisher.durable);
        assert!(publisher.close_after_send);
        assert_eq!(publisher.send_timeout, Some(Duration::from_secs(3)));

        let subscriber = config.subscriber_options();
        assert_eq!(subscriber.link_name, "commands-rx");
        assert_eq!(subscriber.window_size, 5);
        assert!(subscriber.reuse_existing_connection);

        let address = config.endpoint_address().unwrap();
        assert_eq!(address.scheme(), Scheme::Mqtts);
        assert_eq!(address.port(), 8883);
        assert_eq!(address.target(), "telemetry");
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = BusConfig::test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.publisher.send_timeout_secs, 10);
        assert_eq!(config.subscriber.window_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(900));
        assert!(!config.publisher.durable);
    }

    #[test]
    fn test_mqtt_settings_follow_transport_section() {
        let mut config = BusConfig::test_config();
        config.transport.client_id_prefix = "edge-7".to_string();
        config.transport.keep_alive_secs = 45;

        let settings = config.mqtt_settings();
        assert!(settings.client_id().starts_with("edge-7-"));
        assert_eq!(settings.keep_alive, Duration::from_secs(45));
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_address_from_parts() {
        let toml_content = r#"
[broker]
scheme = "amqp"
ip = "10.0.0.7"
target = "orders"
"#;

        let config = BusConfig::from_toml_str(toml_content).unwrap();
        let address = config.endpoint_address().unwrap();
        assert_eq!(address.scheme(), Scheme::Amqp);
        assert_eq!(address.network_host(), "10.0.0.7");
        assert_eq!(address.port(), 5672);
    }

    #[test]
    fn test_missing_host_rejected() {
        let toml_content = r#"
[broker]
target = "orders"
"#;
        assert!(matches!(
            BusConfig::from_toml_str(toml_content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_empty_target_rejected() {
        let toml_content = r#"
[broker]
url = "mqtt://localhost"
target = " "
"#;
        assert!(BusConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let toml_content = r#"
[broker]
scheme = "kafka"
host = "localhost"
target = "orders"
"#;
        assert!(matches!(
            BusConfig::from_toml_str(toml_content),
            Err(ConfigError::Address(AddressError::UnsupportedScheme(_)))
        ));
    }

    #[test]
    fn test_missing_credential_env_var() {
        let toml_content = r#"
[broker]
url = "mqtt://localhost"
username_env = "BUSPROXY_TEST_SURELY_UNSET_USERNAME"
target = "orders"
"#;
        let config = BusConfig::from_toml_str(toml_content).unwrap();
        assert!(matches!(
            config.endpoint_address(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "BUSPROXY_TEST_SURELY_UNSET_USERNAME"
        ));
    }

    #[test]
    fn test_toml_roundtrip_for_show() {
        let config = BusConfig::test_config();
        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(rendered.contains("[broker]"));
        assert!(rendered.contains("target = \"telemetry\""));
    }
}
