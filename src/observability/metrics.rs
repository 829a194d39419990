//! Link-level counters
//!
//! Every proxy reports into a [`LinkMetrics`], its own or one handed in
//! through its options (and possibly shared with other proxies). Each
//! increment is mirrored into the process-wide totals returned by
//! [`metrics()`].

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Process-wide totals across all links
pub static METRICS: Lazy<LinkMetrics> = Lazy::new(LinkMetrics::root);

/// Get reference to the process-wide totals
pub fn metrics() -> &'static LinkMetrics {
    &METRICS
}

/// Thread-safe counters for one publisher or subscriber link
#[derive(Debug)]
pub struct LinkMetrics {
    parent: Option<&'static LinkMetrics>,

    connected: AtomicBool,
    connected_since_ms: AtomicI64,
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    connect_failures: AtomicU64,
    reconnects: AtomicU64,
    disconnects: AtomicU64,

    messages_published: AtomicU64,
    messages_skipped: AtomicU64,
    messages_dropped: AtomicU64,
    publish_failures: AtomicU64,

    messages_received: AtomicU64,
    handler_failures: AtomicU64,
    credit_grants: AtomicU64,
}

/// Serializable point-in-time view of a [`LinkMetrics`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub connected: bool,
    pub connected_since: Option<DateTime<Utc>>,
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub connect_failures: u64,
    /// Connections established after the first one
    pub reconnects: u64,
    pub disconnects: u64,
    pub messages_published: u64,
    pub messages_skipped: u64,
    pub messages_dropped: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub handler_failures: u64,
    pub credit_grants: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl LinkMetrics {
    fn root() -> Self {
        Self {
            parent: None,
            connected: AtomicBool::new(false),
            connected_since_ms: AtomicI64::new(0),
            connect_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            messages_skipped: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            credit_grants: AtomicU64::new(0),
        }
    }

    /// Counters that also feed the process-wide totals
    pub fn new() -> Self {
        Self {
            parent: Some(metrics()),
            ..Self::root()
        }
    }

    fn record(&self, pick: impl Fn(&LinkMetrics) -> &AtomicU64) {
        bump(pick(self));
        if let Some(parent) = self.parent {
            bump(pick(parent));
        }
    }

    // Connection lifecycle
    pub fn connect_attempted(&self) {
        self.record(|m| &m.connect_attempts);
    }

    pub fn connection_established(&self) {
        self.record(|m| &m.connections_established);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.record(|m| &m.reconnects);
    }

    pub fn connect_failed(&self) {
        self.record(|m| &m.connect_failures);
        self.mark_disconnected();
    }

    pub fn disconnected(&self) {
        self.record(|m| &m.disconnects);
        self.mark_disconnected();
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since_ms.store(0, Ordering::Relaxed);
    }

    // Publishing
    pub fn message_published(&self) {
        self.record(|m| &m.messages_published);
    }

    pub fn message_skipped(&self) {
        self.record(|m| &m.messages_skipped);
    }

    pub fn message_dropped(&self) {
        self.record(|m| &m.messages_dropped);
    }

    pub fn publish_failed(&self) {
        self.record(|m| &m.publish_failures);
    }

    // Receiving
    pub fn message_received(&self) {
        self.record(|m| &m.messages_received);
    }

    pub fn handler_failed(&self) {
        self.record(|m| &m.handler_failures);
    }

    pub fn credit_granted(&self) {
        self.record(|m| &m.credit_grants);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let since = self.connected_since_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: Utc::now(),
            connected: self.connected.load(Ordering::Relaxed),
            connected_since: (since > 0)
                .then(|| Utc.timestamp_millis_opt(since).single())
                .flatten(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_skipped: self.messages_skipped.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            credit_grants: self.credit_grants.load(Ordering::Relaxed),
        }
    }
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}
