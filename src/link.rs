//! Raw publisher and subscriber links
//!
//! These are the unsupervised objects the [`ConnectionFactory`] builds: one
//! transport link bound to one session. They report every failure to the
//! caller and never reconnect; the proxies wrap them to add that.
//!
//! [`ConnectionFactory`]: crate::builder::ConnectionFactory

use crate::connection::ConnectionId;
use crate::observability::metrics::LinkMetrics;
use crate::transport::{MessageDispatch, ReceiverLink, SenderLink, TransportError};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Outbound link on one topic
pub struct Publisher {
    connection_id: ConnectionId,
    topic: String,
    link_name: String,
    send_timeout: Duration,
    link: Box<dyn SenderLink>,
}

impl Publisher {
    pub(crate) fn new(
        connection_id: ConnectionId,
        topic: &str,
        link_name: &str,
        send_timeout: Duration,
        link: Box<dyn SenderLink>,
    ) -> Self {
        Self {
            connection_id,
            topic: topic.to_string(),
            link_name: link_name.to_string(),
            send_timeout,
            link,
        }
    }

    /// Send one payload; exceeding the send timeout is a failure
    pub async fn send(&self, payload: Bytes, durable: bool) -> Result<(), TransportError> {
        trace!(link = %self.link_name, len = payload.len(), durable, "Sending");
        tokio::time::timeout(self.send_timeout, self.link.send(payload, durable))
            .await
            .map_err(|_| TransportError::Timeout(self.send_timeout))?
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        debug!(link = %self.link_name, "Closing sender link");
        self.link.close().await
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.send_timeout = timeout;
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("connection_id", &self.connection_id)
            .field("topic", &self.topic)
            .field("link_name", &self.link_name)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

/// Inbound link on one topic with its handler and credit window bound
pub struct Subscriber {
    connection_id: ConnectionId,
    topic: String,
    link_name: String,
    link: Box<dyn ReceiverLink>,
    dispatch: MessageDispatch,
    metrics: Arc<LinkMetrics>,
    window: AtomicU32,
    receiving: AtomicBool,
}

impl Subscriber {
    pub(crate) fn new(
        connection_id: ConnectionId,
        topic: &str,
        link_name: &str,
        link: Box<dyn ReceiverLink>,
        dispatch: MessageDispatch,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        Self {
            connection_id,
            topic: topic.to_string(),
            link_name: link_name.to_string(),
            link,
            dispatch,
            metrics,
            window: AtomicU32::new(0),
            receiving: AtomicBool::new(false),
        }
    }

    /// Start the receive loop; a no-op if already receiving
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.receiving.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.link.start(self.dispatch.clone()).await?;
        self.receiving.store(true, Ordering::SeqCst);
        debug!(link = %self.link_name, topic = %self.topic, "Receive loop started");
        Ok(())
    }

    /// Grant exactly `credit` messages on this link
    pub async fn set_credit(&self, credit: u32) -> Result<(), TransportError> {
        self.link.set_credit(credit).await?;
        self.window.store(credit, Ordering::SeqCst);
        self.metrics.credit_granted();
        debug!(link = %self.link_name, credit, "Credit granted");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), TransportError> {
        if !self.receiving.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.link.stop().await
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.receiving.store(false, Ordering::SeqCst);
        debug!(link = %self.link_name, "Closing receiver link");
        self.link.close().await
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Credit most recently granted on this link
    pub fn window(&self) -> u32 {
        self.window.load(Ordering::SeqCst)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("connection_id", &self.connection_id)
            .field("topic", &self.topic)
            .field("link_name", &self.link_name)
            .field("window", &self.window())
            .field("receiving", &self.is_receiving())
            .finish()
    }
}
