//! MQTT v5 transport
//!
//! Split the same way as the rest of the adapters: pure pieces first, I/O
//! last.
//!
//! - [`connection`]: settings, option building, QoS mapping, topic filters
//! - [`message_handler`]: event classification and inbound fan-out
//! - [`client`]: sessions, the event loop task and the links
//!
//! MQTT has no link-level credit, so each receiver keeps a local
//! [`CreditWindow`](crate::transport::CreditWindow) in front of its handler.
//!
//! ```rust,no_run
//! use busproxy::transport::mqtt::{MqttBrokerTransport, MqttSettings};
//! use busproxy::{ConnectionFactory, EndpointAddress};
//! use std::sync::Arc;
//!
//! # fn main() -> busproxy::BusResult<()> {
//! let transport = Arc::new(MqttBrokerTransport::new(MqttSettings::default()));
//! let address = EndpointAddress::parse("mqtt://localhost:1883", "telemetry")?;
//! let factory = ConnectionFactory::new(transport, address);
//! # let _ = factory;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttBrokerTransport, MqttSession};
pub use connection::{configure_mqtt_options, qos_for, topic_matches, MqttSettings, SessionState};
pub use message_handler::{route_mqtt_event, EventRoute, InboundRouter};
