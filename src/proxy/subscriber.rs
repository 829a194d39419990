//! Subscriber proxy

use super::{ProxyCore, ProxyStatus, Slots};
use crate::builder::{unique_link_name, ConnectionFactory, DEFAULT_WINDOW_SIZE};
use crate::connection::{ConnectionId, TransportConnection};
use crate::error::{sanitize_error_message, BusError, BusResult};
use crate::link::Subscriber;
use crate::link_span;
use crate::observability::metrics::LinkMetrics;
use crate::transport::MessageHandler;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument, Span};

/// Receiving side of the bus, as application code sees it
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    async fn connect(&self);

    async fn disconnect(&self);

    /// Connect if needed and start delivering; false if not connected
    async fn subscribe(&self) -> bool;

    async fn unsubscribe(&self);

    fn window_size(&self) -> u32;

    async fn set_window_size(&self, window_size: u32);

    fn is_connected(&self) -> bool;

    fn connection_id(&self) -> Option<ConnectionId>;
}

/// Subscriber proxy configuration
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    pub topic: String,
    pub link_name: String,
    /// Maximum messages in flight; 0 pauses delivery
    pub window_size: u32,
    pub reuse_existing_connection: bool,
    /// Counters to report into; a fresh set when `None`
    pub metrics: Option<Arc<LinkMetrics>>,
}

impl SubscriberOptions {
    /// Options for `topic` with a generated link name
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let link_name = unique_link_name(&format!("{topic}-rx"));
        Self {
            topic,
            link_name,
            window_size: DEFAULT_WINDOW_SIZE,
            reuse_existing_connection: false,
            metrics: None,
        }
    }

    pub fn link_name(mut self, link_name: impl Into<String>) -> Self {
        self.link_name = link_name.into();
        self
    }

    pub fn window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn reuse_existing_connection(mut self, reuse: bool) -> Self {
        self.reuse_existing_connection = reuse;
        self
    }

    /// Report into `metrics`, which other proxies may share
    pub fn metrics(mut self, metrics: Arc<LinkMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn validate(&self) -> BusResult<()> {
        if self.topic.trim().is_empty() {
            return Err(BusError::invalid_config("subscriber topic must not be empty"));
        }
        if self.link_name.trim().is_empty() {
            return Err(BusError::invalid_config("subscriber link name must not be empty"));
        }
        Ok(())
    }
}

/// Self-healing subscriber
///
/// Once [`subscribe`](Self::subscribe) has been called, every later
/// reconnect re-attaches the handler, re-grants the configured window and
/// restarts delivery.
pub struct SubscriberProxy {
    core: Arc<ProxyCore<Subscriber>>,
    topic: String,
    link_name: String,
    handler: Arc<dyn MessageHandler>,
    window_size: AtomicU32,
    subscribed: AtomicBool,
}

impl SubscriberProxy {
    pub fn new(
        factory: Arc<ConnectionFactory>,
        options: SubscriberOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> BusResult<Self> {
        options.validate()?;
        let span = link_span!(
            parent: factory.span(),
            role = "subscriber",
            link = %options.link_name,
            topic = %options.topic
        );
        Self::with_span(factory, options, handler, span)
    }

    /// Same as [`new`](Self::new), logging under `span`
    pub fn with_span(
        factory: Arc<ConnectionFactory>,
        options: SubscriberOptions,
        handler: Arc<dyn MessageHandler>,
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
            handler,
            window_size: AtomicU32::new(options.window_size),
            subscribed: AtomicBool::new(false),
        })
    }

    /// Start from an existing connection; it is reused while live if the
    /// options allow it
    pub fn with_connection(
        factory: Arc<ConnectionFactory>,
        options: SubscriberOptions,
        handler: Arc<dyn MessageHandler>,
        connection: TransportConnection,
    ) -> BusResult<Self> {
        let proxy = Self::new(factory, options, handler)?;
        proxy.core.adopt(connection);
        Ok(proxy)
    }

    /// Open the connection, attach the receiver and grant the window
    ///
    /// If a subscription is active, delivery restarts on the new link.
    pub async fn connect(&self) {
        let mut slots = self.core.lock().await;
        self.connect_locked(&mut slots).await;
    }

    async fn connect_locked(&self, slots: &mut Slots<Subscriber>) -> bool {
        let topic = self.topic.clone();
        let link_name = self.link_name.clone();
        let handler = Arc::clone(&self.handler);
        let window = self.window_size();
        let restart = self.is_subscribed();
        let metrics = Arc::clone(self.core.metrics());

        self.core
            .connect_locked(
                slots,
                move |factory: Arc<ConnectionFactory>, connection: TransportConnection| async move {
                    let subscriber = factory
                        .subscriber_with_metrics(&connection, &topic, &link_name, handler, window, metrics)
                        .await?;
                    if restart {
                        if let Err(e) = subscriber.start().await {
                            if let Err(close_error) = subscriber.close().await {
                                debug!(error = %close_error, "Closing receiver after failed restart failed");
                            }
                            return Err(BusError::from(e));
                        }
                        info!(link = %link_name, "Subscription restored");
                    }
                    Ok::<_, BusError>(subscriber)
                },
            )
            .instrument(self.core.span().clone())
            .await
    }

    /// Connect if needed, then start delivering to the handler
    ///
    /// Returns whether delivery is running. When it is not, the subscription
    /// is still remembered and the next successful connect starts it.
    pub async fn subscribe(&self) -> bool {
        let span = self.core.span().clone();
        let mut slots = self.core.lock().await;
        self.subscribed.store(true, Ordering::SeqCst);

        if !self.connect_locked(&mut slots).await {
            debug!(parent: &span, "Not connected, subscription deferred");
            return false;
        }

        let started = match slots.link.as_ref() {
            Some(subscriber) => subscriber.start().instrument(span.clone()).await,
            None => return false,
        };
        if let Err(e) = started {
            warn!(
                parent: &span,
                error = %sanitize_error_message(&e.to_string()),
                "Failed to start receiving, disconnecting"
            );
            self.core.release_locked(&mut slots).await;
            return false;
        }
        true
    }

    /// Stop delivery; errors are logged and swallowed
    pub async fn unsubscribe(&self) {
        let span = self.core.span().clone();
        let slots = self.core.lock().await;
        self.subscribed.store(false, Ordering::SeqCst);

        if let Some(subscriber) = slots.link.as_ref() {
            if let Err(e) = subscriber.stop().instrument(span.clone()).await {
                debug!(parent: &span, error = %e, "Unsubscribe failed, ignoring");
            }
        }
    }

    pub fn window_size(&self) -> u32 {
        self.window_size.load(Ordering::SeqCst)
    }

    /// Store the window; re-grant it at once if connected
    pub async fn set_window_size(&self, window_size: u32) {
        self.window_size.store(window_size, Ordering::SeqCst);

        let span = self.core.span().clone();
        let mut slots = self.core.lock().await;
        if !self.core.is_connected() {
            return;
        }

        let granted = match slots.link.as_ref() {
            Some(subscriber) => subscriber.set_credit(window_size).instrument(span.clone()).await,
            None => return,
        };
        if let Err(e) = granted {
            warn!(
                parent: &span,
                error = %sanitize_error_message(&e.to_string()),
                "Credit grant failed, disconnecting"
            );
            self.core.release_locked(&mut slots).await;
        }
    }

    /// Release link and connection; safe to call any number of times
    ///
    /// The subscription itself is remembered for the next connect.
    pub async fn disconnect(&self) {
        self.core.disconnect().instrument(self.core.span().clone()).await;
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
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

    pub fn reuse_existing_connection(&self) -> bool {
        self.core.reuse_existing_connection()
    }

    pub fn set_reuse_existing_connection(&self, reuse: bool) {
        self.core.set_reuse_existing_connection(reuse);
    }
}

#[async_trait]
impl MessageSubscriber for SubscriberProxy {
    async fn connect(&self) {
        SubscriberProxy::connect(self).await
    }

    async fn disconnect(&self) {
        SubscriberProxy::disconnect(self).await
    }

    async fn subscribe(&self) -> bool {
        SubscriberProxy::subscribe(self).await
    }

    async fn unsubscribe(&self) {
        SubscriberProxy::unsubscribe(self).await
    }

    fn window_size(&self) -> u32 {
        SubscriberProxy::window_size(self)
    }

    async fn set_window_size(&self, window_size: u32) {
        SubscriberProxy::set_window_size(self, window_size).await
    }

    fn is_connected(&self) -> bool {
        SubscriberProxy::is_connected(self)
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        SubscriberProxy::connection_id(self)
    }
}

impl std::fmt::Debug for SubscriberProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberProxy")
            .field("topic", &self.topic)
            .field("link_name", &self.link_name)
            .field("window_size", &self.window_size())
            .field("subscribed", &self.is_subscribed())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = SubscriberOptions::new("commands");

        assert_eq!(options.window_size, DEFAULT_WINDOW_SIZE);
        assert!(options.link_name.starts_with("commands-rx-"));
        assert!(!options.reuse_existing_connection);
    }

    #[test]
    fn test_options_validation() {
        assert!(SubscriberOptions::new("commands").validate().is_ok());
        assert!(SubscriberOptions::new("").validate().is_err());
        assert!(SubscriberOptions::new("commands")
            .link_name("  ")
            .validate()
            .is_err());
        assert!(SubscriberOptions::new("commands")
            .window_size(0)
            .validate()
            .is_ok());
    }
}
