//! In-process broker
//!
//! [`MemoryBroker`] simulates a broker entirely within the process. Topics
//! match by exact name, every receiver attached to a topic gets a copy of
//! each message, and delivery honours the receiver's credit window. Delivery
//! is synchronous: by the time a `send` returns, every receiver with credit
//! has run its handler.
//!
//! Faults can be injected to exercise the supervisor layer: refused or
//! failing opens, failing or stalled sends, failing link attach, and
//! out-of-band session loss via [`MemoryBroker::drop_sessions`]. Everything
//! the broker does is recorded in a bounded [`BrokerEvent`] journal; once it
//! holds [`DEFAULT_JOURNAL_CAPACITY`] events the oldest are discarded.

use super::{
    BrokerTransport, CloseSignal, CreditWindow, MessageDispatch, ReceiverLink, SenderLink,
    Session, TransportError,
};
use crate::address::EndpointAddress;
use crate::observers::lock_unpoisoned;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Journal events kept by [`MemoryBroker::new`]
pub const DEFAULT_JOURNAL_CAPACITY: usize = 10_000;

/// Something the broker observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    SessionOpened { session: u64 },
    SessionClosed { session: u64 },
    SessionDropped { session: u64, reason: String },
    SenderAttached { session: u64, link: String, topic: String },
    ReceiverAttached { session: u64, link: String, topic: String },
    Published { topic: String, payload: Bytes, durable: bool },
    CreditGranted { link: String, credit: u32 },
    ReceiverStarted { link: String },
    ReceiverStopped { link: String },
    LinkClosed { link: String },
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connections: bool,
    fail_next_connects: usize,
    fail_sends: bool,
    fail_link_attach: bool,
    open_delay: Option<Duration>,
    send_delay: Option<Duration>,
}

struct ReceiverEntry {
    id: u64,
    session: u64,
    topic: String,
    window: Arc<CreditWindow>,
}

struct Journal {
    events: VecDeque<BrokerEvent>,
    capacity: usize,
}

impl Journal {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, event: BrokerEvent) {
        if self.capacity == 0 {
            return;
        }
        while self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_JOURNAL_CAPACITY)
    }
}

#[derive(Default)]
struct BrokerState {
    next_id: AtomicU64,
    sessions_opened: AtomicUsize,
    faults: Mutex<Faults>,
    sessions: Mutex<HashMap<u64, CloseSignal>>,
    receivers: Mutex<Vec<ReceiverEntry>>,
    journal: Mutex<Journal>,
}

impl BrokerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record(&self, event: BrokerEvent) {
        lock_unpoisoned(&self.journal).push(event);
    }

    fn session_open(&self, session: u64) -> bool {
        lock_unpoisoned(&self.sessions).contains_key(&session)
    }

    /// Detach every receiver belonging to `session`
    fn drop_receivers(&self, session: u64) {
        let removed: Vec<Arc<CreditWindow>> = {
            let mut receivers = lock_unpoisoned(&self.receivers);
            let mut removed = Vec::new();
            receivers.retain(|entry| {
                if entry.session == session {
                    removed.push(Arc::clone(&entry.window));
                    false
                } else {
                    true
                }
            });
            removed
        };
        for window in removed {
            window.reset();
        }
    }

    fn deliver(&self, topic: &str, payload: &Bytes) -> usize {
        let targets: Vec<Arc<CreditWindow>> = lock_unpoisoned(&self.receivers)
            .iter()
            .filter(|entry| entry.topic == topic)
            .map(|entry| Arc::clone(&entry.window))
            .collect();

        targets
            .iter()
            .filter(|window| window.offer(payload.clone()))
            .count()
    }
}

/// In-process broker; clones share the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker keeping at most `capacity` journal events; 0 disables the journal
    pub fn with_journal_capacity(capacity: usize) -> Self {
        let state = BrokerState {
            journal: Mutex::new(Journal::with_capacity(capacity)),
            ..BrokerState::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Refuse every open until switched off
    pub fn refuse_connections(&self, refuse: bool) {
        lock_unpoisoned(&self.state.faults).refuse_connections = refuse;
    }

    /// Fail the next `count` opens
    pub fn fail_next_connects(&self, count: usize) {
        lock_unpoisoned(&self.state.faults).fail_next_connects = count;
    }

    pub fn fail_sends(&self, fail: bool) {
        lock_unpoisoned(&self.state.faults).fail_sends = fail;
    }

    pub fn fail_link_attach(&self, fail: bool) {
        lock_unpoisoned(&self.state.faults).fail_link_attach = fail;
    }

    /// Delay every open by `delay`
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        lock_unpoisoned(&self.state.faults).open_delay = delay;
    }

    /// Stall every send by `delay`
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        lock_unpoisoned(&self.state.faults).send_delay = delay;
    }

    /// Kill every open session from the broker side
    ///
    /// Each session's close signal fires, the way a network drop would
    /// surface. Returns the number of sessions dropped.
    pub fn drop_sessions(&self, reason: &str) -> usize {
        let dropped: Vec<(u64, CloseSignal)> =
            lock_unpoisoned(&self.state.sessions).drain().collect();

        for (session, _) in &dropped {
            self.state.drop_receivers(*session);
            self.state.record(BrokerEvent::SessionDropped {
                session: *session,
                reason: reason.to_string(),
            });
        }
        debug!(sessions = dropped.len(), reason, "Memory broker dropped sessions");

        for (_, signal) in &dropped {
            signal.closed(reason);
        }
        dropped.len()
    }

    /// Close signals of the sessions currently open
    pub fn close_signals(&self) -> Vec<CloseSignal> {
        lock_unpoisoned(&self.state.sessions)
            .values()
            .cloned()
            .collect()
    }

    /// Deliver a message as if published by another client
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.state.deliver(topic, &payload.into())
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        lock_unpoisoned(&self.state.sessions).len()
    }

    pub fn receiver_count(&self, topic: &str) -> usize {
        lock_unpoisoned(&self.state.receivers)
            .iter()
            .filter(|entry| entry.topic == topic)
            .count()
    }

    /// Payloads accepted on `topic`, in order
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.journal()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Published {
                    topic: published, payload, ..
                } if published == topic => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// Durability flags of the messages accepted on `topic`, in order
    pub fn published_durability(&self, topic: &str) -> Vec<bool> {
        self.journal()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Published {
                    topic: published, durable, ..
                } if published == topic => Some(durable),
                _ => None,
            })
            .collect()
    }

    /// Credit grants issued on `link`, in order
    pub fn credit_grants(&self, link: &str) -> Vec<u32> {
        self.journal()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::CreditGranted { link: granted, credit } if granted == link => {
                    Some(credit)
                }
                _ => None,
            })
            .collect()
    }

    /// Retained events, oldest first
    pub fn journal(&self) -> Vec<BrokerEvent> {
        lock_unpoisoned(&self.state.journal)
            .events
            .iter()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("open_sessions", &self.open_sessions())
            .field("sessions_opened", &self.sessions_opened())
            .finish()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(
        &self,
        address: &EndpointAddress,
        on_close: CloseSignal,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let delay = {
            let mut faults = lock_unpoisoned(&self.state.faults);
            if faults.refuse_connections {
                return Err(TransportError::Unavailable(format!(
                    "{} refused the connection",
                    address.redacted_url()
                )));
            }
            if faults.fail_next_connects > 0 {
                faults.fail_next_connects -= 1;
                return Err(TransportError::ConnectionFailed(
                    "injected connect failure".into(),
                ));
            }
            faults.open_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let session = self.state.next_id();
        lock_unpoisoned(&self.state.sessions).insert(session, on_close);
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        self.state.record(BrokerEvent::SessionOpened { session });

        Ok(Arc::new(MemorySession {
            id: session,
            broker: Arc::clone(&self.state),
        }))
    }
}

struct MemorySession {
    id: u64,
    broker: Arc<BrokerState>,
}

impl MemorySession {
    fn check_attach(&self) -> Result<(), TransportError> {
        if !self.broker.session_open(self.id) {
            return Err(TransportError::SessionClosed);
        }
        if lock_unpoisoned(&self.broker.faults).fail_link_attach {
            return Err(TransportError::LinkFailed("injected attach failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn create_sender(
        &self,
        topic: &str,
        link_name: &str,
    ) -> Result<Box<dyn SenderLink>, TransportError> {
        self.check_attach()?;
        self.broker.record(BrokerEvent::SenderAttached {
            session: self.id,
            link: link_name.to_string(),
            topic: topic.to_string(),
        });

        Ok(Box::new(MemorySender {
            session: self.id,
            topic: topic.to_string(),
            link: link_name.to_string(),
            closed: AtomicBool::new(false),
            broker: Arc::clone(&self.broker),
        }))
    }

    async fn create_receiver(
        &self,
        topic: &str,
        link_name: &str,
    ) -> Result<Box<dyn ReceiverLink>, TransportError> {
        self.check_attach()?;

        let id = self.broker.next_id();
        let window = Arc::new(CreditWindow::new());
        lock_unpoisoned(&self.broker.receivers).push(ReceiverEntry {
            id,
            session: self.id,
            topic: topic.to_string(),
            window: Arc::clone(&window),
        });
        self.broker.record(BrokerEvent::ReceiverAttached {
            session: self.id,
            link: link_name.to_string(),
            topic: topic.to_string(),
        });

        Ok(Box::new(MemoryReceiver {
            id,
            session: self.id,
            link: link_name.to_string(),
            window,
            broker: Arc::clone(&self.broker),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let removed = lock_unpoisoned(&self.broker.sessions).remove(&self.id);
        if removed.is_some() {
            self.broker.drop_receivers(self.id);
            self.broker
                .record(BrokerEvent::SessionClosed { session: self.id });
        }
        Ok(())
    }
}

struct MemorySender {
    session: u64,
    topic: String,
    link: String,
    closed: AtomicBool,
    broker: Arc<BrokerState>,
}

#[async_trait]
impl SenderLink for MemorySender {
    async fn send(&self, payload: Bytes, durable: bool) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || !self.broker.session_open(self.session) {
            return Err(TransportError::SessionClosed);
        }

        let (fail, delay) = {
            let faults = lock_unpoisoned(&self.broker.faults);
            (faults.fail_sends, faults.send_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(TransportError::SendFailed(
                format!("injected send failure on {}", self.link).into(),
            ));
        }

        self.broker.record(BrokerEvent::Published {
            topic: self.topic.clone(),
            payload: payload.clone(),
            durable,
        });
        self.broker.deliver(&self.topic, &payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.record(BrokerEvent::LinkClosed {
                link: self.link.clone(),
            });
        }
        Ok(())
    }
}

struct MemoryReceiver {
    id: u64,
    session: u64,
    link: String,
    window: Arc<CreditWindow>,
    broker: Arc<BrokerState>,
}

impl MemoryReceiver {
    fn check_open(&self) -> Result<(), TransportError> {
        let attached = lock_unpoisoned(&self.broker.receivers)
            .iter()
            .any(|entry| entry.id == self.id);
        if attached && self.broker.session_open(self.session) {
            Ok(())
        } else {
            Err(TransportError::SessionClosed)
        }
    }
}

#[async_trait]
impl ReceiverLink for MemoryReceiver {
    async fn start(&self, dispatch: MessageDispatch) -> Result<(), TransportError> {
        self.check_open()?;
        self.broker.record(BrokerEvent::ReceiverStarted {
            link: self.link.clone(),
        });
        self.window.attach(dispatch);
        Ok(())
    }

    async fn set_credit(&self, credit: u32) -> Result<(), TransportError> {
        self.check_open()?;
        self.broker.record(BrokerEvent::CreditGranted {
            link: self.link.clone(),
            credit,
        });
        self.window.grant(credit);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.window.detach();
        self.broker.record(BrokerEvent::ReceiverStopped {
            link: self.link.clone(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let removed = {
            let mut receivers = lock_unpoisoned(&self.broker.receivers);
            let before = receivers.len();
            receivers.retain(|entry| entry.id != self.id);
            receivers.len() != before
        };
        self.window.reset();
        if removed {
            self.broker.record(BrokerEvent::LinkClosed {
                link: self.link.clone(),
            });
        }
        Ok(())
    }
}
