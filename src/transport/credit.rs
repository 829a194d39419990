//! Receive-credit bookkeeping shared by the transport adapters
//!
//! A [`CreditWindow`] sits between a transport's inbound stream and the
//! link's [`MessageDispatch`]. Messages are queued until the link has been
//! started and credit is available; each delivery consumes one unit and one
//! unit is restored once the handler returns, so the window bounds the
//! number of in-flight messages.

use super::MessageDispatch;
use crate::observers::lock_unpoisoned;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{trace, warn};

/// Upper bound on messages queued behind an exhausted window
pub const DEFAULT_MAX_PENDING: usize = 10_000;

#[derive(Debug, Default)]
struct CreditState {
    window: u32,
    in_flight: u32,
    grants: u64,
    pending: VecDeque<Bytes>,
    dispatch: Option<MessageDispatch>,
    delivering: bool,
}

impl CreditState {
    fn available(&self) -> u32 {
        self.window.saturating_sub(self.in_flight)
    }

    fn next_delivery(&mut self) -> Option<(MessageDispatch, Bytes)> {
        if self.delivering || self.available() == 0 {
            return None;
        }
        let dispatch = self.dispatch.clone()?;
        let payload = self.pending.pop_front()?;
        self.in_flight += 1;
        self.delivering = true;
        Some((dispatch, payload))
    }
}

/// Per-link credit window with a bounded pending queue
#[derive(Debug)]
pub struct CreditWindow {
    state: Mutex<CreditState>,
    max_pending: usize,
}

impl CreditWindow {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(CreditState::default()),
            max_pending,
        }
    }

    /// Replace the window with `credit` units and deliver what it allows
    pub fn grant(&self, credit: u32) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.window = credit;
            state.grants += 1;
        }
        self.pump();
    }

    /// Current window size (last grant)
    pub fn window(&self) -> u32 {
        lock_unpoisoned(&self.state).window
    }

    /// Number of grants issued on this link
    pub fn grants(&self) -> u64 {
        lock_unpoisoned(&self.state).grants
    }

    pub fn pending(&self) -> usize {
        lock_unpoisoned(&self.state).pending.len()
    }

    pub fn is_attached(&self) -> bool {
        lock_unpoisoned(&self.state).dispatch.is_some()
    }

    /// Queue an inbound message; returns false if the queue is full
    pub fn offer(&self, payload: Bytes) -> bool {
        {
            let mut state = lock_unpoisoned(&self.state);
            if state.pending.len() >= self.max_pending {
                warn!(
                    pending = state.pending.len(),
                    "Receive queue full, inbound message discarded"
                );
                return false;
            }
            state.pending.push_back(payload);
        }
        self.pump();
        true
    }

    /// Start delivering to `dispatch`
    pub fn attach(&self, dispatch: MessageDispatch) {
        lock_unpoisoned(&self.state).dispatch = Some(dispatch);
        self.pump();
    }

    /// Stop delivering; queued messages stay queued
    pub fn detach(&self) {
        lock_unpoisoned(&self.state).dispatch = None;
    }

    /// Drop the dispatch and everything queued
    pub fn reset(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.dispatch = None;
        state.pending.clear();
        state.window = 0;
    }

    /// Deliver queued messages while credit lasts
    ///
    /// Only one caller delivers at a time; concurrent callers return
    /// immediately and the active one picks up their messages. The handler
    /// runs with no lock held.
    fn pump(&self) {
        loop {
            let next = lock_unpoisoned(&self.state).next_delivery();
            let Some((dispatch, payload)) = next else {
                return;
            };

            let status = dispatch.deliver(&payload);
            trace!(link = dispatch.link_name(), ?status, "Delivered inbound message");

            let mut state = lock_unpoisoned(&self.state);
            state.in_flight = state.in_flight.saturating_sub(1);
            state.delivering = false;
        }
    }
}

impl Default for CreditWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::LinkMetrics;
    use crate::transport::HandlerError;
    use std::sync::Arc;

    fn recording_dispatch() -> (MessageDispatch, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = Arc::clone(&seen);
        let handler = move |payload: &[u8]| -> Result<(), HandlerError> {
            seen_ref.lock().unwrap().push(payload.to_vec());
            Ok(())
        };
        let dispatch = MessageDispatch::new(Arc::new(handler), "rx", Arc::new(LinkMetrics::new()));
        (dispatch, seen)
    }

    #[test]
    fn test_messages_wait_for_credit() {
        let window = CreditWindow::new();
        let (dispatch, seen) = recording_dispatch();
        window.attach(dispatch);

        window.offer(Bytes::from_static(b"one"));
        window.offer(Bytes::from_static(b"two"));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(window.pending(), 2);

        window.grant(5);
        assert_eq!(*seen.lock().unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(window.pending(), 0);
    }

    #[test]
    fn test_messages_wait_for_attach() {
        let window = CreditWindow::new();
        window.grant(3);
        window.offer(Bytes::from_static(b"early"));
        assert_eq!(window.pending(), 1);

        let (dispatch, seen) = recording_dispatch();
        window.attach(dispatch);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_zero_window_pauses_delivery() {
        let window = CreditWindow::new();
        let (dispatch, seen) = recording_dispatch();
        window.attach(dispatch);
        window.grant(0);

        window.offer(Bytes::from_static(b"held"));
        assert!(seen.lock().unwrap().is_empty());

        window.grant(1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_grant_replaces_window() {
        let window = CreditWindow::new();
        window.grant(20);
        window.grant(7);
        assert_eq!(window.window(), 7);
        assert_eq!(window.grants(), 2);
    }

    #[test]
    fn test_detach_keeps_queue_and_reset_clears_it() {
        let window = CreditWindow::new();
        let (dispatch, seen) = recording_dispatch();
        window.grant(1);
        window.attach(dispatch);
        window.detach();
        assert!(!window.is_attached());

        window.offer(Bytes::from_static(b"queued"));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(window.pending(), 1);

        window.reset();
        assert_eq!(window.pending(), 0);
        assert_eq!(window.window(), 0);
    }

    #[test]
    fn test_full_queue_rejects() {
        let window = CreditWindow::with_max_pending(1);
        assert!(window.offer(Bytes::from_static(b"a")));
        assert!(!window.offer(Bytes::from_static(b"b")));
    }
}
