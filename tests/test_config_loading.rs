//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes: what loads, what is rejected, and
//! which options the proxies end up with.

use busproxy::config::{BusConfig, ConfigError};
use busproxy::Scheme;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[broker]
url = "mqtt://broker.local:1884"
target = "telemetry"

[publisher]
durable = true
close_after_send = true
send_timeout_secs = 3

[subscriber]
topic = "commands"
window_size = 50
reuse_existing_connection = true
"#,
    );

    let config = BusConfig::load_from_file(temp_file.path()).unwrap();
    let address = config.endpoint_address().unwrap();

    assert_eq!(address.scheme(), Scheme::Mqtt);
    assert_eq!(address.host(), "broker.local");
    assert_eq!(address.port(), 1884);
    assert_eq!(address.target(), "telemetry");

    let publisher = config.publisher_options();
    assert_eq!(publisher.topic, "telemetry");
    assert!(publisher.durable);
    assert!(publisher.close_after_send);
    assert_eq!(publisher.send_timeout, Some(Duration::from_secs(3)));

    let subscriber = config.subscriber_options();
    assert_eq!(subscriber.topic, "commands");
    assert_eq!(subscriber.window_size, 50);
    assert!(subscriber.reuse_existing_connection);
}

#[test]
fn test_config_from_parts_uses_scheme_default_port() {
    let temp_file = write_config(
        r#"
[broker]
scheme = "amqps"
host = "rabbit.internal"
target = "jobs"
"#,
    );

    let config = BusConfig::load_from_file(temp_file.path()).unwrap();
    let address = config.endpoint_address().unwrap();

    assert_eq!(address.scheme(), Scheme::Amqps);
    assert_eq!(address.port(), 5671);
}

#[test]
fn test_config_ip_only_endpoint() {
    let temp_file = write_config(
        r#"
[broker]
scheme = "mqtt"
ip = "10.0.0.7"
port = 1999
target = "telemetry"
"#,
    );

    let address = BusConfig::load_from_file(temp_file.path())
        .unwrap()
        .endpoint_address()
        .unwrap();

    assert_eq!(address.network_host(), "10.0.0.7");
    assert_eq!(address.port(), 1999);
}

#[test]
fn test_credentials_resolved_from_environment() {
    std::env::set_var("BUSPROXY_IT_USER", "svc-telemetry");
    std::env::set_var("BUSPROXY_IT_PASS", "hunter2");
    let temp_file = write_config(
        r#"
[broker]
url = "mqtt://broker.local"
username_env = "BUSPROXY_IT_USER"
password_env = "BUSPROXY_IT_PASS"
target = "telemetry"
"#,
    );

    let config = BusConfig::load_from_file(temp_file.path()).unwrap();
    let address = config.endpoint_address().unwrap();

    assert_eq!(address.username(), Some("svc-telemetry"));
    assert_eq!(address.password(), Some("hunter2"));
    assert!(!address.redacted_url().contains("hunter2"));
    assert!(!format!("{address:?}").contains("hunter2"));
}

#[test]
fn test_missing_file_reported() {
    let result = BusConfig::load_from_file(std::path::Path::new("/nonexistent/busproxy.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_reported() {
    let temp_file = write_config("[broker\nurl = ");
    let result = BusConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_broker_section_rejected() {
    let temp_file = write_config(
        r#"
[publisher]
durable = true
"#,
    );
    assert!(BusConfig::load_from_file(temp_file.path()).is_err());
}

#[test]
fn test_zero_send_timeout_rejected() {
    let temp_file = write_config(
        r#"
[broker]
url = "memory://local"
target = "telemetry"

[publisher]
send_timeout_secs = 0
"#,
    );
    assert!(matches!(
        BusConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_empty_topic_override_rejected() {
    let temp_file = write_config(
        r#"
[broker]
url = "memory://local"
target = "telemetry"

[subscriber]
topic = ""
"#,
    );
    assert!(matches!(
        BusConfig::load_from_file(temp_file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_unknown_scheme_rejected() {
    let temp_file = write_config(
        r#"
[broker]
url = "kafka://broker:9092"
target = "telemetry"
"#,
    );

    let config = BusConfig::load_from_file(temp_file.path()).unwrap();
    assert!(matches!(
        config.endpoint_address(),
        Err(ConfigError::Address(_))
    ));
}
