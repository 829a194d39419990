//! Broker transport abstraction
//!
//! The supervisor layer never speaks a broker protocol itself. It consumes
//! the capability set below, which an MQTT client, an AMQP client or the
//! in-process [`memory`] broker can satisfy:
//!
//! - [`BrokerTransport::open`] opens one physical session against an
//!   [`EndpointAddress`] and hands the transport a [`CloseSignal`] to fire
//!   when the session dies out-of-band.
//! - A [`Session`] attaches named sender and receiver links to topics.
//! - A [`ReceiverLink`] delivers inbound payloads through a
//!   [`MessageDispatch`] under a credit window.

use crate::address::EndpointAddress;
use crate::observability::metrics::LinkMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

pub mod credit;
pub mod memory;
pub mod mqtt;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use credit::CreditWindow;

/// Errors raised by transport adapters
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
    #[error("Session closed")]
    SessionClosed,
    #[error("Link attach failed: {0}")]
    LinkFailed(String),
    #[error("Send failed")]
    SendFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Flow control failed: {0}")]
    FlowControl(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Inbound message handler
///
/// Invoked once per delivered message with the raw payload. Closures of the
/// form `Fn(&[u8]) -> Result<(), HandlerError>` implement it directly.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&[u8]) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        self(payload)
    }
}

/// Outcome of handing one payload to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Handled,
    /// Handler returned an error or panicked; the message is dropped
    Rejected,
}

/// Per-link delivery entry point handed to [`ReceiverLink::start`]
///
/// Isolates the receive loop from the handler: errors and panics are
/// logged and counted, never propagated into the transport.
#[derive(Clone)]
pub struct MessageDispatch {
    handler: Arc<dyn MessageHandler>,
    link_name: Arc<str>,
    metrics: Arc<LinkMetrics>,
}

impl MessageDispatch {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        link_name: impl Into<Arc<str>>,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        Self {
            handler,
            link_name: link_name.into(),
            metrics,
        }
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    pub fn deliver(&self, payload: &[u8]) -> DeliveryStatus {
        self.metrics.message_received();

        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(payload))) {
            Ok(Ok(())) => DeliveryStatus::Handled,
            Ok(Err(e)) => {
                self.metrics.handler_failed();
                warn!(
                    link = %self.link_name,
                    payload_len = payload.len(),
                    error = %e,
                    "Message handler failed, message dropped"
                );
                DeliveryStatus::Rejected
            }
            Err(panic_payload) => {
                self.metrics.handler_failed();
                let reason = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    link = %self.link_name,
                    payload_len = payload.len(),
                    panic = %reason,
                    "Message handler panicked, message dropped"
                );
                DeliveryStatus::Rejected
            }
        }
    }
}

impl std::fmt::Debug for MessageDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatch")
            .field("link_name", &self.link_name)
            .finish()
    }
}

/// Out-of-band closure notification handed to [`BrokerTransport::open`]
///
/// Transports call [`closed`](Self::closed) from whatever task notices the
/// session died (broker DISCONNECT, socket error). Firing is synchronous and
/// cheap; it may happen more than once.
#[derive(Clone)]
pub struct CloseSignal {
    notify: Arc<dyn Fn(&str) + Send + Sync>,
}

impl CloseSignal {
    pub fn new<F>(notify: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            notify: Arc::new(notify),
        }
    }

    /// A signal nobody listens to
    pub fn detached() -> Self {
        Self::new(|_| {})
    }

    pub fn closed(&self, reason: &str) {
        (self.notify)(reason)
    }
}

impl std::fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CloseSignal")
    }
}

/// Factory for physical broker sessions
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Short name for logs ("mqtt", "amqp", "memory")
    fn name(&self) -> &str;

    /// Open a session; resolves once the broker has accepted it
    async fn open(
        &self,
        address: &EndpointAddress,
        on_close: CloseSignal,
    ) -> Result<Arc<dyn Session>, TransportError>;
}

/// One live broker session
#[async_trait]
pub trait Session: Send + Sync {
    async fn create_sender(
        &self,
        topic: &str,
        link_name: &str,
    ) -> Result<Box<dyn SenderLink>, TransportError>;

    async fn create_receiver(
        &self,
        topic: &str,
        link_name: &str,
    ) -> Result<Box<dyn ReceiverLink>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Outbound link bound to one topic
#[async_trait]
pub trait SenderLink: Send + Sync {
    async fn send(&self, payload: Bytes, durable: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Inbound link bound to one topic
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    /// Begin delivering messages to `dispatch`
    async fn start(&self, dispatch: MessageDispatch) -> Result<(), TransportError>;

    /// Replace the link's credit window with `credit` messages
    async fn set_credit(&self, credit: u32) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Shared transport handle
pub type TransportPtr = Arc<dyn BrokerTransport>;
