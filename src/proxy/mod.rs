//! Self-healing publisher and subscriber proxies
//!
//! A proxy holds at most one (connection, raw link) pair. Every operation
//! first tries to (re)build that pair through the [`ConnectionFactory`];
//! every transport failure tears the pair down instead of surfacing as an
//! error. Retry is lazy: nothing reconnects in the background, the next
//! call does.
//!
//! The pair lives behind one `tokio::sync::Mutex` per proxy, held for the
//! whole connect/send/disconnect sequence. The current [`ProxyStatus`] is
//! published on a `watch` channel so it can be read without that lock.

mod publisher;
mod subscriber;

pub use publisher::{MessagePublisher, PublishOutcome, PublisherOptions, PublisherProxy};
pub use subscriber::{MessageSubscriber, SubscriberOptions, SubscriberProxy};

use crate::builder::ConnectionFactory;
use crate::connection::{ConnectionClosed, ConnectionId, TransportConnection};
use crate::error::{sanitize_error_message, BusResult};
use crate::link::{Publisher, Subscriber};
use crate::observability::metrics::LinkMetrics;
use crate::observers::{lock_unpoisoned, ObserverId};
use crate::transport::TransportError;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{watch, MutexGuard};
use tracing::{debug, info, warn, Instrument, Span};

/// Connection state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProxyStatus {
    Disconnected,
    Connecting,
    Connected { connection_id: ConnectionId },
}

impl ProxyStatus {
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            ProxyStatus::Connected { connection_id } => Some(*connection_id),
            _ => None,
        }
    }
}

/// Raw link a proxy can hold
#[async_trait]
pub(crate) trait ProxyLink: Send + Sync + 'static {
    async fn close_link(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl ProxyLink for Publisher {
    async fn close_link(&self) -> Result<(), TransportError> {
        self.close().await
    }
}

#[async_trait]
impl ProxyLink for Subscriber {
    async fn close_link(&self) -> Result<(), TransportError> {
        self.close().await
    }
}

pub(crate) struct Slots<L> {
    pub(crate) connection: Option<TransportConnection>,
    pub(crate) link: Option<L>,
    connection_id: Option<ConnectionId>,
    /// Close and disconnect observers registered on a connection this proxy did not build
    observers: Option<(ObserverId, ObserverId)>,
}

impl<L> Default for Slots<L> {
    fn default() -> Self {
        Self {
            connection: None,
            link: None,
            connection_id: None,
            observers: None,
        }
    }
}

/// State and lifecycle shared by both proxy kinds
pub(crate) struct ProxyCore<L> {
    factory: Arc<ConnectionFactory>,
    reuse_existing_connection: AtomicBool,
    slots: tokio::sync::Mutex<Slots<L>>,
    status: watch::Sender<ProxyStatus>,
    /// Connection backing the current `Connected` status, readable without the slots lock
    current: Mutex<Option<TransportConnection>>,
    /// Set by the first established connection; later ones count as reconnects
    ever_connected: AtomicBool,
    metrics: Arc<LinkMetrics>,
    span: Span,
}

impl<L: ProxyLink> ProxyCore<L> {
    pub(crate) fn new(
        factory: Arc<ConnectionFactory>,
        reuse_existing_connection: bool,
        metrics: Arc<LinkMetrics>,
        span: Span,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ProxyStatus::Disconnected);
        Arc::new(Self {
            factory,
            reuse_existing_connection: AtomicBool::new(reuse_existing_connection),
            slots: tokio::sync::Mutex::new(Slots::default()),
            status,
            current: Mutex::new(None),
            ever_connected: AtomicBool::new(false),
            metrics,
            span,
        })
    }

    /// Hand the proxy a connection to start from
    ///
    /// Other holders may disconnect it; the proxy then drops to
    /// `Disconnected` just as on an out-of-band close.
    pub(crate) fn adopt(self: &Arc<Self>, connection: TransportConnection) {
        let on_close = connection.register_close_observer(self.close_observer());
        let on_disconnect = connection.register_disconnect_observer(self.close_observer());
        let slots = Slots {
            connection: Some(connection),
            link: None,
            connection_id: None,
            observers: Some((on_close, on_disconnect)),
        };
        // Construction time: nobody else can hold the lock yet
        if let Ok(mut held) = self.slots.try_lock() {
            *held = slots;
        }
    }

    pub(crate) fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    pub(crate) fn metrics(&self) -> &Arc<LinkMetrics> {
        &self.metrics
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn reuse_existing_connection(&self) -> bool {
        self.reuse_existing_connection.load(Ordering::SeqCst)
    }

    pub(crate) fn set_reuse_existing_connection(&self, reuse: bool) {
        self.reuse_existing_connection.store(reuse, Ordering::SeqCst);
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Slots<L>> {
        self.slots.lock().await
    }

    pub(crate) fn status(&self) -> ProxyStatus {
        *self.status.borrow()
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<ProxyStatus> {
        self.status.subscribe()
    }

    /// Connected status backed by a connection that is still live
    pub(crate) fn is_connected(&self) -> bool {
        let Some(connection_id) = self.status().connection_id() else {
            return false;
        };
        lock_unpoisoned(&self.current)
            .as_ref()
            .is_some_and(|connection| connection.id() == Some(connection_id))
    }

    pub(crate) fn connection_id(&self) -> Option<ConnectionId> {
        if self.is_connected() {
            self.status().connection_id()
        } else {
            None
        }
    }

    fn close_observer(self: &Arc<Self>) -> impl Fn(&ConnectionClosed) + Send + Sync + 'static {
        let core: Weak<Self> = Arc::downgrade(self);
        move |event: &ConnectionClosed| {
            if let Some(core) = core.upgrade() {
                core.on_connection_closed(event.connection_id);
            }
        }
    }

    /// Runs on the transport's task when a held connection dies
    fn on_connection_closed(self: Arc<Self>, connection_id: ConnectionId) {
        let was_current = self.status.send_if_modified(|status| {
            if status.connection_id() == Some(connection_id) {
                *status = ProxyStatus::Disconnected;
                true
            } else {
                false
            }
        });
        if !was_current {
            return;
        }

        self.metrics.disconnected();
        warn!(parent: &self.span, %connection_id, "Connection lost, will reconnect on next use");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let span = self.span.clone();
                handle.spawn(
                    async move {
                        let mut slots = self.slots.lock().await;
                        if slots.connection_id != Some(connection_id) {
                            return;
                        }
                        let reopened = slots
                            .connection
                            .as_ref()
                            .and_then(TransportConnection::id)
                            .is_some_and(|id| id != connection_id);
                        if reopened {
                            // Another holder already reopened the shared connection
                            if let Some(stale) = slots.link.take() {
                                close_quietly(&self.span, &stale).await;
                            }
                            slots.connection_id = None;
                            *lock_unpoisoned(&self.current) = None;
                        } else {
                            self.release_locked(&mut slots).await;
                        }
                    }
                    .instrument(span),
                );
            }
            Err(_) => {
                debug!(parent: &self.span, "No runtime, teardown deferred to next call");
            }
        }
    }

    /// Make sure a live (connection, link) pair is held
    ///
    /// Returns false when the pair could not be built; the proxy is then
    /// fully disconnected. Never fails otherwise.
    pub(crate) async fn connect_locked<F, Fut>(self: &Arc<Self>, slots: &mut Slots<L>, build: F) -> bool
    where
        F: FnOnce(Arc<ConnectionFactory>, TransportConnection) -> Fut,
        Fut: Future<Output = BusResult<L>>,
    {
        let held_live = slots
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_live());
        if held_live && slots.link.is_some() && self.status().connection_id().is_some() {
            return true;
        }

        self.status.send_replace(ProxyStatus::Connecting);
        self.metrics.connect_attempted();

        let reuse = held_live && self.reuse_existing_connection();
        let connection = match (reuse, slots.connection.clone()) {
            (true, Some(connection)) => {
                if let Some(stale) = slots.link.take() {
                    close_quietly(&self.span, &stale).await;
                }
                debug!(parent: &self.span, "Reusing held connection");
                connection
            }
            _ => {
                self.release_locked(slots).await;
                self.status.send_replace(ProxyStatus::Connecting);
                let connection = self
                    .factory
                    .build_connection_with_close(self.factory.address(), self.close_observer());
                slots.connection = Some(connection.clone());
                connection
            }
        };

        connection.connect().await;
        let Some(connection_id) = connection.id() else {
            self.metrics.connect_failed();
            self.release_locked(slots).await;
            return false;
        };

        match build(Arc::clone(&self.factory), connection.clone()).await {
            Ok(link) => {
                slots.link = Some(link);
                slots.connection_id = Some(connection_id);
                *lock_unpoisoned(&self.current) = Some(connection);
                self.status
                    .send_replace(ProxyStatus::Connected { connection_id });
                self.metrics.connection_established();
                if self.ever_connected.swap(true, Ordering::SeqCst) {
                    self.metrics.reconnected();
                }
                info!(parent: &self.span, %connection_id, "Proxy connected");
                true
            }
            Err(e) => {
                warn!(
                    parent: &self.span,
                    %connection_id,
                    error = %sanitize_error_message(&e.to_string()),
                    "Failed to attach link"
                );
                self.metrics.connect_failed();
                self.release_locked(slots).await;
                false
            }
        }
    }

    /// Close link and connection best-effort and clear both; idempotent
    pub(crate) async fn release_locked(&self, slots: &mut Slots<L>) {
        let was_connected = self.status().connection_id().is_some();
        let link = slots.link.take();
        let connection = slots.connection.take();
        let observers = slots.observers.take();
        slots.connection_id = None;
        *lock_unpoisoned(&self.current) = None;
        self.status.send_replace(ProxyStatus::Disconnected);

        if let Some(link) = link {
            close_quietly(&self.span, &link).await;
        }
        if let Some(connection) = connection {
            if let Some((on_close, on_disconnect)) = observers {
                connection.unregister_close_observer(on_close);
                connection.unregister_disconnect_observer(on_disconnect);
            }
            connection.disconnect().await;
        }

        if was_connected {
            self.metrics.disconnected();
            debug!(parent: &self.span, "Proxy disconnected");
        }
    }

    pub(crate) async fn disconnect(&self) {
        let mut slots = self.slots.lock().await;
        self.release_locked(&mut slots).await;
    }
}

async fn close_quietly<L: ProxyLink>(span: &Span, link: &L) {
    if let Err(e) = link.close_link().await {
        debug!(parent: span, error = %e, "Link close failed, ignoring");
    }
}
