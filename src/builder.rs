//! Connection factory
//!
//! Builds [`TransportConnection`]s, raw [`Publisher`]s and raw
//! [`Subscriber`]s for one broker endpoint. Links are built either on the
//! factory's shared default connection (opened on first use) or on a
//! connection the caller supplies.

use crate::address::EndpointAddress;
use crate::bus_span;
use crate::connection::{ConnectionClosed, TransportConnection};
use crate::error::{BusError, BusResult};
use crate::link::{Publisher, Subscriber};
use crate::link_span;
use crate::observability::metrics::LinkMetrics;
use crate::transport::{MessageDispatch, MessageHandler, TransportPtr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, Instrument, Span};
use uuid::Uuid;

/// Receive window used when none is configured
pub const DEFAULT_WINDOW_SIZE: u32 = 20;

/// Send timeout used when none is configured
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Link names must be unique per process; this appends a random suffix
pub fn unique_link_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

fn require_non_empty(what: &str, value: &str) -> BusResult<()> {
    if value.trim().is_empty() {
        return Err(BusError::invalid_config(format!("{what} must not be empty")));
    }
    Ok(())
}

/// Factory for connections and links against one endpoint
pub struct ConnectionFactory {
    transport: TransportPtr,
    address: EndpointAddress,
    send_timeout: Duration,
    shared: Mutex<Option<TransportConnection>>,
    span: Span,
}

impl ConnectionFactory {
    pub fn new(transport: TransportPtr, address: EndpointAddress) -> Self {
        let span = bus_span!(broker = %address.redacted_url(), transport = transport.name());
        Self {
            transport,
            address,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            shared: Mutex::new(None),
            span,
        }
    }

    /// Log everything this factory and its connections do under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Send timeout applied to publishers built from now on
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn transport(&self) -> &TransportPtr {
        &self.transport
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Fresh, un-opened connection to `address`
    pub fn build_connection(&self, address: &EndpointAddress) -> TransportConnection {
        TransportConnection::with_span(
            Arc::clone(&self.transport),
            address.clone(),
            self.span.clone(),
        )
    }

    /// Fresh, un-opened connection with `on_closed` as its first close observer
    pub fn build_connection_with_close<F>(
        &self,
        address: &EndpointAddress,
        on_closed: F,
    ) -> TransportConnection
    where
        F: Fn(&ConnectionClosed) + Send + Sync + 'static,
    {
        let connection = self.build_connection(address);
        connection.register_close_observer(on_closed);
        connection
    }

    /// The factory's default connection, opened if it is not live
    pub async fn shared_connection(&self) -> TransportConnection {
        let connection = {
            let mut shared = self.shared.lock().await;
            shared
                .get_or_insert_with(|| self.build_connection(&self.address))
                .clone()
        };
        connection.connect().await;
        connection
    }

    /// Raw publisher on the shared default connection
    pub async fn build_publisher(&self, topic: &str, link_name: &str) -> BusResult<Publisher> {
        require_non_empty("topic", topic)?;
        require_non_empty("link name", link_name)?;
        let connection = self.shared_connection().await;
        self.build_publisher_on(&connection, topic, link_name).await
    }

    /// Raw publisher on `connection`, which must be live
    pub async fn build_publisher_on(
        &self,
        connection: &TransportConnection,
        topic: &str,
        link_name: &str,
    ) -> BusResult<Publisher> {
        require_non_empty("topic", topic)?;
        require_non_empty("link name", link_name)?;

        let (connection_id, session) = connection.session().ok_or(BusError::NotConnected)?;
        let span = link_span!(link = link_name, topic = topic, connection_id = %connection_id);
        let link = session
            .create_sender(topic, link_name)
            .instrument(span)
            .await?;

        debug!(parent: &self.span, link = link_name, topic, "Publisher link attached");
        Ok(Publisher::new(
            connection_id,
            topic,
            link_name,
            self.send_timeout,
            link,
        ))
    }

    /// Raw subscriber on the shared default connection
    pub async fn build_subscriber(
        &self,
        topic: &str,
        link_name: &str,
        handler: Arc<dyn MessageHandler>,
        window: u32,
    ) -> BusResult<Subscriber> {
        require_non_empty("topic", topic)?;
        require_non_empty("link name", link_name)?;
        let connection = self.shared_connection().await;
        self.build_subscriber_on(&connection, topic, link_name, handler, window)
            .await
    }

    /// Raw subscriber on `connection`, which must be live
    pub async fn build_subscriber_on(
        &self,
        connection: &TransportConnection,
        topic: &str,
        link_name: &str,
        handler: Arc<dyn MessageHandler>,
        window: u32,
    ) -> BusResult<Subscriber> {
        self.subscriber_with_metrics(
            connection,
            topic,
            link_name,
            handler,
            window,
            Arc::new(LinkMetrics::new()),
        )
        .await
    }

    pub(crate) async fn subscriber_with_metrics(
        &self,
        connection: &TransportConnection,
        topic: &str,
        link_name: &str,
        handler: Arc<dyn MessageHandler>,
        window: u32,
        metrics: Arc<LinkMetrics>,
    ) -> BusResult<Subscriber> {
        require_non_empty("topic", topic)?;
        require_non_empty("link name", link_name)?;

        let (connection_id, session) = connection.session().ok_or(BusError::NotConnected)?;
        let span = link_span!(link = link_name, topic = topic, connection_id = %connection_id);
        let link = session
            .create_receiver(topic, link_name)
            .instrument(span)
            .await?;

        let dispatch = MessageDispatch::new(handler, link_name, Arc::clone(&metrics));
        let subscriber = Subscriber::new(connection_id, topic, link_name, link, dispatch, metrics);

        if let Err(e) = subscriber.set_credit(window).await {
            if let Err(close_error) = subscriber.close().await {
                debug!(parent: &self.span, error = %close_error, "Closing half-built receiver failed");
            }
            return Err(e.into());
        }

        debug!(parent: &self.span, link = link_name, topic, window, "Subscriber link attached");
        Ok(subscriber)
    }

    /// Disconnect the shared default connection, if one was built
    pub async fn close(&self) {
        let shared = self.shared.lock().await.take();
        if let Some(connection) = shared {
            connection.disconnect().await;
        }
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("address", &self.address)
            .field("transport", &self.transport.name())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}
