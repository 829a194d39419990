//! Publisher proxy

use super::{ProxyCore, ProxyStatus};
use crate::builder::{unique_link_name, ConnectionFactory};
use crate::connection::{ConnectionId, TransportConnection};
use crate::error::{sanitize_error_message, BusError, BusResult};
use crate::link::Publisher;
use crate::link_span;
use crate::observability::metrics::LinkMetrics;
use crate::transport::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn, Instrument, Span};

/// Publishing side of the bus, as application code sees it
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn connect(&self);

    async fn disconnect(&self);

    /// Publish `payload`; `durable: None` uses the configured default
    async fn publish(&self, payload: Bytes, durable: Option<bool>) -> PublishOutcome;

    fn is_connected(&self) -> bool;

    fn connection_id(&self) -> Option<ConnectionId>;
}

/// What happened to one `publish` call
///
/// Informational only: a publish never fails from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the broker
    Sent,
    /// Empty payload, nothing sent
    Skipped,
    /// No connection could be established, message discarded
    Dropped,
    /// Send failed or timed out; the proxy disconnected
    Failed,
}

/// Publisher proxy configuration
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub topic: String,
    pub link_name: String,
    pub durable: bool,
    pub reuse_existing_connection: bool,
    pub close_after_send: bool,
    /// Overrides the factory's send timeout
    pub send_timeout: Option<Duration>,
    /// Counters to report into; a fresh set when `None`
    pub metrics: Option<Arc<LinkMetrics>>,
}

impl PublisherOptions {
    /// Options for `topic` with a generated link name
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let link_name = unique_link_name(&format!("{topic}-tx"));
        Self {
            topic,
            link_name,
            durable: false,
            reuse_existing_connection: false,
            close_after_send: false,
            send_timeout: None,
            metrics: None,
        }
    }

    pub fn link_name(mut self, link_name: impl Into<String>) -> Self {
        self.link_name = link_name.into();
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn reuse_existing_connection(mut self, reuse: bool) -> Self {
        self.reuse_existing_connection = reuse;
        self
    }

    pub fn close_after_send(mut self, close: bool) -> Self {
        self.close_after_send = close;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Report into `metrics`, which other proxies may share
    pub fn metrics(mut self, metrics: Arc<LinkMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn validate(&self) -> BusResult<()> {
        if self.topic.trim().is_empty() {
            return Err(BusError::invalid_config("publisher topic must not be empty"));
        }
        if self.link_name.trim().is_empty() {
            return Err(BusError::invalid_config("publisher link name must not be empty"));
        }
        if self.send_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BusError::invalid_config("send timeout must be positive"));
        }
        Ok(())
    }
}

/// Self-healing publisher
///
/// ```no_run
/// # use busproxy::{ConnectionFactory, EndpointAddress, PublisherOptions, PublisherProxy};
/// # use busproxy::transport::memory::MemoryBroker;
/// # use std::sync::Arc;
/// # async fn run() -> busproxy::BusResult<()> {
/// let address = EndpointAddress::parse("memory://local", "telemetry")?;
/// let factory = Arc::new(ConnectionFactory::new(Arc::new(MemoryBroker::new()), address));
/// let publisher = PublisherProxy::new(factory, PublisherOptions::new("telemetry"))?;
///
/// publisher.publish("temp=21.5", None).await;
/// # Ok(())
/// # }
/// ```
pub struct PublisherProxy {
    core: Arc<ProxyCore<Publisher>>,
    topic: String,
    link_name: String,
    durable: AtomicBool,
    close_after_send: AtomicBool,
    send_timeout: Option<Duration>,
}

impl PublisherProxy {
    pub fn new(factory: Arc<ConnectionFactory>, options: PublisherOptions) -> BusResult<Self> {
        options.validate()?;
        let span = link_span!(
            parent: factory.span(),
            role = "publisher",
            link = %options.link_name,
            topic = %options.topic
        );
        Self::with_span(factory, options, span)
    }

    /// Same as [`new`](Self::new), logging under `span`
    pub fn with_span(
        factory: Arc<ConnectionFactory>,
        options: PublisherOptions,
        span: Span,
    ) -> BusResult<Self> {
        options.validate()?;
        let metrics = options
            .metrics
            .unwrap_or_else(|| Arc::new(LinkMetrics::new()));
        let core = ProxyCore::new(factory, options.reuse_existing_connection, metrics, span);
        Ok(Self {
            core,
            topic: options.topic,
            link_name: options.link_name,
            durable: AtomicBool::new(options.durable),
            close_after_send: AtomicBool::new(options.close_after_send),
            send_timeout: options.send_timeout,
        })
    }

    /// Start from an existing connection; it is reused while live if the
    /// options allow it
    pub fn with_connection(
        factory: Arc<ConnectionFactory>,
        options: PublisherOptions,
        connection: TransportConnection,
    ) -> BusResult<Self> {
        let proxy = Self::new(factory, options)?;
        proxy.core.adopt(connection);
        Ok(proxy)
    }

    /// Open the connection and attach the sender link if not already done
    pub async fn connect(&self) {
        let mut slots = self.core.lock().await;
        self.connect_locked(&mut slots).await;
    }

    async fn connect_locked(&self, slots: &mut super::Slots<Publisher>) -> bool {
        let topic = self.topic.clone();
        let link_name = self.link_name.clone();
        let send_timeout = self.send_timeout;

        self.core
            .connect_locked(slots, move |factory: Arc<ConnectionFactory>, connection: TransportConnection| async move {
                let mut publisher = factory
                    .build_publisher_on(&connection, &topic, &link_name)
                    .await?;
                if let Some(timeout) = send_timeout {
                    publisher.set_send_timeout(timeout);
                }
                Ok::<_, BusError>(publisher)
            })
            .instrument(self.core.span().clone())
            .await
    }

    /// Connect if needed, then send
    ///
    /// Never returns an error. A failed send disconnects the proxy and the
    /// message is lost; the next call reconnects.
    pub async fn publish(&self, payload: impl Into<Bytes>, durable: Option<bool>) -> PublishOutcome {
        let payload = payload.into();
        let durable = durable.unwrap_or_else(|| self.durable());
        let metrics = Arc::clone(self.core.metrics());
        let span = self.core.span().clone();

        let mut slots = self.core.lock().await;
        if !self.connect_locked(&mut slots).await {
            metrics.message_dropped();
            debug!(parent: &span, len = payload.len(), "Not connected, message dropped");
            return PublishOutcome::Dropped;
        }

        let outcome = if payload.is_empty() {
            metrics.message_skipped();
            debug!(parent: &span, "Empty payload, send skipped");
            PublishOutcome::Skipped
        } else {
            let sent = match slots.link.as_ref() {
                Some(publisher) => publisher.send(payload, durable).instrument(span.clone()).await,
                None => Err(TransportError::SessionClosed),
            };
            if let Err(e) = sent {
                metrics.publish_failed();
                warn!(
                    parent: &span,
                    error = %sanitize_error_message(&e.to_string()),
                    "Publish failed, disconnecting"
                );
                self.core.release_locked(&mut slots).await;
                return PublishOutcome::Failed;
            }
            metrics.message_published();
            PublishOutcome::Sent
        };

        if self.close_after_send() {
            self.core.release_locked(&mut slots).await;
        }
        outcome
    }

    /// Release link and connection; safe to call any number of times
    pub async fn disconnect(&self) {
        self.core.disconnect().instrument(self.core.span().clone()).await;
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.core.connection_id()
    }

    pub fn status(&self) -> ProxyStatus {
        self.core.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ProxyStatus> {
        self.core.watch_status()
    }

    pub fn metrics(&self) -> Arc<LinkMetrics> {
        Arc::clone(self.core.metrics())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    pub fn durable(&self) -> bool {
        self.durable.load(Ordering::SeqCst)
    }

    pub fn set_durable(&self, durable: bool) {
        self.durable.store(durable, Ordering::SeqCst);
    }

    pub fn close_after_send(&self) -> bool {
        self.close_after_send.load(Ordering::SeqCst)
    }

    pub fn set_close_after_send(&self, close: bool) {
        self.close_after_send.store(close, Ordering::SeqCst);
    }

    pub fn reuse_existing_connection(&self) -> bool {
        self.core.reuse_existing_connection()
    }

    pub fn set_reuse_existing_connection(&self, reuse: bool) {
        self.core.set_reuse_existing_connection(reuse);
    }
}

#[async_trait]
impl MessagePublisher for PublisherProxy {
    async fn connect(&self) {
        PublisherProxy::connect(self).await
    }

    async fn disconnect(&self) {
        PublisherProxy::disconnect(self).await
    }

    async fn publish(&self, payload: Bytes, durable: Option<bool>) -> PublishOutcome {
        PublisherProxy::publish(self, payload, durable).await
    }

    fn is_connected(&self) -> bool {
        PublisherProxy::is_connected(self)
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        PublisherProxy::connection_id(self)
    }
}

impl std::fmt::Debug for PublisherProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherProxy")
            .field("topic", &self.topic)
            .field("link_name", &self.link_name)
            .field("status", &self.status())
            .finish()
    }
}
