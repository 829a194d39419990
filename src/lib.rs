//! busproxy
//!
//! Self-healing publish/subscribe endpoints for unreliable message brokers.
//!
//! # Overview
//!
//! Application code talks to a [`PublisherProxy`] or a [`SubscriberProxy`]
//! and never sees a broker failure as an error. Each proxy owns at most one
//! physical connection plus one link, both built on demand through a
//! [`ConnectionFactory`]. When the broker drops the connection, or a send
//! fails, the proxy tears everything down and the next call rebuilds it.
//! Nothing retries in the background.
//!
//! - [`address`]: broker endpoint description
//! - [`connection`]: one physical session and its close notifications
//! - [`builder`]: the factory for connections and raw links
//! - [`proxy`]: the self-healing publisher and subscriber
//! - [`transport`]: the broker abstraction plus MQTT, AMQP and in-process
//!   implementations
//!
//! # Quick Start
//!
//! ```rust
//! use busproxy::testing::{memory_factory, RecordingHandler};
//! use busproxy::{PublisherOptions, PublisherProxy, SubscriberOptions, SubscriberProxy};
//!
//! # tokio_test::block_on(async {
//! let (_broker, factory) = memory_factory("telemetry")?;
//!
//! let handler = RecordingHandler::new();
//! let subscriber =
//!     SubscriberProxy::new(factory.clone(), SubscriberOptions::new("telemetry"), handler.clone())?;
//! assert!(subscriber.subscribe().await);
//!
//! let publisher = PublisherProxy::new(factory, PublisherOptions::new("telemetry"))?;
//! publisher.publish("temp=21.5", None).await;
//!
//! assert_eq!(handler.received_strings(), vec!["temp=21.5"]);
//! # Ok::<(), busproxy::BusError>(())
//! # });
//! ```

pub mod address;
pub mod builder;
pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod observability;
pub mod observers;
pub mod proxy;
pub mod testing;
pub mod transport;

pub use address::{AddressBuilder, AddressError, EndpointAddress, Scheme};
pub use builder::{ConnectionFactory, DEFAULT_SEND_TIMEOUT, DEFAULT_WINDOW_SIZE};
pub use config::{BusConfig, ConfigError};
pub use connection::{ConnectionClosed, ConnectionId, TransportConnection};
pub use error::{BusError, BusResult};
pub use link::{Publisher, Subscriber};
pub use proxy::{
    MessagePublisher, MessageSubscriber, ProxyStatus, PublishOutcome, PublisherOptions,
    PublisherProxy, SubscriberOptions, SubscriberProxy,
};
pub use transport::{
    BrokerTransport, HandlerError, MessageHandler, TransportError, TransportPtr,
};
