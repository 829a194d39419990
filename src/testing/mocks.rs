//! Mock message handlers and memory-broker fixtures
//!
//! Handlers here implement [`MessageHandler`] and record what they saw, so
//! tests can assert on delivery without wiring channels by hand.

use crate::address::EndpointAddress;
use crate::builder::ConnectionFactory;
use crate::error::BusResult;
use crate::observers::lock_unpoisoned;
use crate::transport::memory::MemoryBroker;
use crate::transport::{HandlerError, MessageHandler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Handler that keeps every payload it receives
#[derive(Debug, Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        lock_unpoisoned(&self.received).clone()
    }

    /// Received payloads decoded as UTF-8 (lossy)
    pub fn received_strings(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|payload| String::from_utf8_lossy(payload).to_string())
            .collect()
    }

    pub fn count(&self) -> usize {
        lock_unpoisoned(&self.received).len()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.received).clear();
    }

    /// Wait until at least `count` messages arrived; false on timeout
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        lock_unpoisoned(&self.received).push(payload.to_vec());
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Handler that rejects every message it is given
#[derive(Debug, Default)]
pub struct FailingHandler {
    calls: AtomicUsize,
}

impl FailingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MessageHandler for FailingHandler {
    fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(format!("refusing {} byte message", payload.len()).into())
    }
}

/// Handler that panics on payloads equal to `trigger`, records the rest
#[derive(Debug)]
pub struct PanickingHandler {
    trigger: Vec<u8>,
    inner: RecordingHandler,
}

impl PanickingHandler {
    pub fn new(trigger: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            trigger: trigger.into(),
            inner: RecordingHandler::default(),
        })
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.inner.received()
    }
}

impl MessageHandler for PanickingHandler {
    fn handle(&self, payload: &[u8]) -> Result<(), HandlerError> {
        if payload == self.trigger.as_slice() {
            panic!("handler tripped on {} byte payload", payload.len());
        }
        self.inner.handle(payload)
    }
}

/// In-process broker plus a factory pointed at it
pub fn memory_factory(target: &str) -> BusResult<(MemoryBroker, Arc<ConnectionFactory>)> {
    let broker = MemoryBroker::new();
    let address = EndpointAddress::parse("memory://local", target)?;
    let factory = Arc::new(ConnectionFactory::new(Arc::new(broker.clone()), address));
    Ok((broker, factory))
}
