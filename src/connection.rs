//! Transport connection: one physical session to a broker endpoint
//!
//! A [`TransportConnection`] is created un-opened. [`connect`] opens a session
//! and stamps it with a fresh [`ConnectionId`]; failures are logged and leave
//! the connection not-live so callers poll [`is_live`] instead of handling
//! errors. The transport may report the session dead at any time through the
//! [`CloseSignal`] it was handed; the connection then flips to not-live on the
//! spot and notifies its close observers.
//!
//! [`connect`]: TransportConnection::connect
//! [`is_live`]: TransportConnection::is_live

use crate::address::EndpointAddress;
use crate::bus_span;
use crate::error::sanitize_error_message;
use crate::observers::{lock_unpoisoned, ObserverId, ObserverList};
use crate::transport::{CloseSignal, Session, TransportPtr};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn, Instrument, Span};
use uuid::Uuid;

/// Identifier of one successfully opened session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Event passed to close observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClosed {
    pub connection_id: ConnectionId,
    pub reason: String,
}

struct LiveSession {
    id: ConnectionId,
    generation: u64,
    session: Arc<dyn Session>,
}

struct ConnectionInner {
    transport: TransportPtr,
    address: EndpointAddress,
    live: AtomicBool,
    /// Bumped on every open attempt; close signals carry the value they were issued with
    generation: AtomicU64,
    /// Highest generation closed while its open was still in flight
    closed_while_opening: AtomicU64,
    current: Mutex<Option<LiveSession>>,
    lifecycle: tokio::sync::Mutex<()>,
    observers: ObserverList<ConnectionClosed>,
    /// Notified when a holder closes the session with `disconnect`
    disconnect_observers: ObserverList<ConnectionClosed>,
    span: Span,
}

impl ConnectionInner {
    fn handle_close(&self, generation: u64, reason: &str) {
        let closed_id = {
            let current = lock_unpoisoned(&self.current);
            match current.as_ref() {
                Some(live) if live.generation == generation => {
                    if !self.live.swap(false, Ordering::SeqCst) {
                        return;
                    }
                    live.id
                }
                None if self.generation.load(Ordering::SeqCst) == generation => {
                    self.closed_while_opening
                        .fetch_max(generation, Ordering::SeqCst);
                    return;
                }
                _ => {
                    debug!(parent: &self.span, generation, reason, "Ignoring close signal from a stale session");
                    return;
                }
            }
        };

        warn!(
            parent: &self.span,
            connection_id = %closed_id,
            reason = %sanitize_error_message(reason),
            "Connection closed by transport"
        );
        self.observers.notify(&ConnectionClosed {
            connection_id: closed_id,
            reason: reason.to_string(),
        });
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let current = match self.current.get_mut() {
            Ok(current) => current.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(live) = current else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let span = self.span.clone();
                handle.spawn(
                    async move {
                        if let Err(e) = live.session.close().await {
                            debug!(connection_id = %live.id, error = %e, "Close on drop failed");
                        }
                    }
                    .instrument(span),
                );
            }
            Err(_) => {
                debug!(parent: &self.span, connection_id = %live.id, "No runtime on drop, session left to the transport");
            }
        }
    }
}

/// Handle to one broker connection
///
/// Clones share the same underlying connection.
#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<ConnectionInner>,
}

impl TransportConnection {
    /// Create an un-opened connection
    pub fn new(transport: TransportPtr, address: EndpointAddress) -> Self {
        let span = bus_span!(broker = %address.redacted_url(), transport = transport.name());
        Self::with_span(transport, address, span)
    }

    /// Create an un-opened connection logging under `span`
    pub fn with_span(transport: TransportPtr, address: EndpointAddress, span: Span) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                address,
                live: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                closed_while_opening: AtomicU64::new(0),
                current: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                observers: ObserverList::new(),
                disconnect_observers: ObserverList::new(),
                span,
            }),
        }
    }

    /// Open the session if it is not already live
    ///
    /// Never returns an error: check [`is_live`](Self::is_live) afterwards.
    pub async fn connect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.live.load(Ordering::SeqCst) {
            return;
        }

        // A session the transport already reported dead still needs closing
        self.release_session().await;

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
        let on_close = CloseSignal::new(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_close(generation, reason);
            }
        });

        debug!(parent: &inner.span, generation, "Opening broker session");
        let opened = inner
            .transport
            .open(&inner.address, on_close)
            .instrument(inner.span.clone())
            .await;

        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    parent: &inner.span,
                    error = %sanitize_error_message(&e.to_string()),
                    "Failed to open broker session"
                );
                return;
            }
        };

        let id = ConnectionId::new();
        let accepted = {
            let mut current = lock_unpoisoned(&inner.current);
            if inner.closed_while_opening.load(Ordering::SeqCst) >= generation {
                false
            } else {
                *current = Some(LiveSession {
                    id,
                    generation,
                    session: Arc::clone(&session),
                });
                inner.live.store(true, Ordering::SeqCst);
                true
            }
        };

        if accepted {
            info!(parent: &inner.span, connection_id = %id, "Broker session opened");
        } else {
            warn!(parent: &inner.span, "Broker session closed while opening");
            if let Err(e) = session.close().await {
                debug!(parent: &inner.span, error = %e, "Closing abandoned session failed");
            }
        }
    }

    /// Close the session; safe to call any number of times
    ///
    /// Close observers are not notified; disconnect observers are, once per
    /// session actually closed.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(connection_id) = self.release_session().await {
            self.inner.disconnect_observers.notify(&ConnectionClosed {
                connection_id,
                reason: "disconnected".to_string(),
            });
        }
    }

    async fn release_session(&self) -> Option<ConnectionId> {
        let inner = &self.inner;
        let previous = {
            let mut current = lock_unpoisoned(&inner.current);
            inner.live.store(false, Ordering::SeqCst);
            current.take()
        };

        if let Some(live) = previous {
            if let Err(e) = live.session.close().await {
                debug!(
                    parent: &inner.span,
                    connection_id = %live.id,
                    error = %sanitize_error_message(&e.to_string()),
                    "Session close failed, ignoring"
                );
            }
            debug!(parent: &inner.span, connection_id = %live.id, "Broker session released");
            return Some(live.id);
        }
        None
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Identifier of the live session, if any
    pub fn id(&self) -> Option<ConnectionId> {
        if !self.is_live() {
            return None;
        }
        lock_unpoisoned(&self.inner.current)
            .as_ref()
            .map(|live| live.id)
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.inner.address
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Session handle, only while live
    pub(crate) fn session(&self) -> Option<(ConnectionId, Arc<dyn Session>)> {
        if !self.is_live() {
            return None;
        }
        lock_unpoisoned(&self.inner.current)
            .as_ref()
            .map(|live| (live.id, Arc::clone(&live.session)))
    }

    /// Observe out-of-band closure; observers run on the transport's task
    pub fn register_close_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ConnectionClosed) + Send + Sync + 'static,
    {
        self.inner.observers.register(observer)
    }

    pub fn unregister_close_observer(&self, id: ObserverId) -> bool {
        self.inner.observers.unregister(id)
    }

    /// Observe explicit [`disconnect`](Self::disconnect) calls, e.g. by
    /// another holder of a shared connection
    pub fn register_disconnect_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ConnectionClosed) + Send + Sync + 'static,
    {
        self.inner.disconnect_observers.register(observer)
    }

    pub fn unregister_disconnect_observer(&self, id: ObserverId) -> bool {
        self.inner.disconnect_observers.unregister(id)
    }

    /// True if both handles refer to the same connection
    pub fn same_connection(&self, other: &TransportConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConnection")
            .field("address", &self.inner.address)
            .field("transport", &self.inner.transport.name())
            .field("live", &self.is_live())
            .field("id", &self.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBroker;
    use std::sync::atomic::AtomicUsize;

    fn connection(broker: &MemoryBroker) -> TransportConnection {
        let address = EndpointAddress::parse("memory://local", "orders").unwrap();
        TransportConnection::new(Arc::new(broker.clone()), address)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        // Arrange
        let broker = MemoryBroker::new();
        let connection = connection(&broker);

        // Act
        connection.connect().await;
        let first = connection.id();
        connection.connect().await;

        // Assert
        assert!(connection.is_live());
        assert!(first.is_some());
        assert_eq!(connection.id(), first);
        assert_eq!(broker.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_is_silent() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let connection = connection(&broker);

        connection.connect().await;

        assert!(!connection.is_live());
        assert_eq!(connection.id(), None);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_resets_id() {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);
        connection.connect().await;

        connection.disconnect().await;
        connection.disconnect().await;

        assert!(!connection.is_live());
        assert_eq!(connection.id(), None);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_issues_new_id() {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);

        connection.connect().await;
        let first = connection.id();
        connection.disconnect().await;
        connection.connect().await;

        assert!(connection.id().is_some());
        assert_ne!(connection.id(), first);
    }

    #[tokio::test]
    async fn test_out_of_band_close_notifies_observers_in_order() {
        // Arrange
        let broker = MemoryBroker::new();
        let connection = connection(&broker);
        let calls = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let calls = Arc::clone(&calls);
            connection.register_close_observer(move |event| {
                calls.lock().unwrap().push((tag, event.connection_id));
            });
        }
        connection.connect().await;
        let id = connection.id().unwrap();

        // Act
        assert_eq!(broker.drop_sessions("broker restart"), 1);

        // Assert
        assert!(!connection.is_live());
        assert_eq!(*calls.lock().unwrap(), vec![("first", id), ("second", id)]);
    }

    #[tokio::test]
    async fn test_unregistered_observer_not_called() {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_ref = Arc::clone(&hits);
        let observer = connection.register_close_observer(move |_| {
            hits_ref.fetch_add(1, Ordering::SeqCst);
        });
        connection.connect().await;

        assert!(connection.unregister_close_observer(observer));
        broker.drop_sessions("gone");

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_close_signal_ignored() {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_ref = Arc::clone(&hits);
        connection.register_close_observer(move |_| {
            hits_ref.fetch_add(1, Ordering::SeqCst);
        });

        connection.connect().await;
        let stale = broker.close_signals();
        connection.disconnect().await;
        connection.connect().await;

        for signal in stale {
            signal.closed("late notification");
        }

        assert!(connection.is_live());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_after_out_of_band_close_reopens() {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);
        connection.connect().await;
        let first = connection.id();
        broker.drop_sessions("network");

        connection.connect().await;

        assert!(connection.is_live());
        assert_ne!(connection.id(), first);
        assert_eq!(broker.sessions_opened(), 2);
        assert_eq!(broker.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);
        let clone = connection.clone();

        connection.connect().await;

        assert!(clone.is_live());
        assert!(clone.same_connection(&connection));
        assert!(clone.session().is_some());
    }
}
