//! Acknowledgment correlation.
//!
//! Each socket allocates correlation ids from its own monotonic counter and
//! parks a one-shot binding per outstanding ack. A binding resolves at most
//! once: with the reply payload when the ACK packet arrives, or not at all
//! when the socket closes first, in which case the dropped binding wakes the
//! waiter with a closed result. Late or duplicate replies find no binding
//! and are dropped by the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::protocol::Payload;

/// Why an expected acknowledgment never arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    /// No reply within the configured deadline.
    Timeout,
    /// The connection closed with the ack still pending.
    Closed,
}

impl std::fmt::Display for AckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "Acknowledgment timed out"),
            Self::Closed => write!(f, "Connection closed before acknowledgment"),
        }
    }
}

impl std::error::Error for AckError {}

/// Pending acknowledgments for one socket.
#[derive(Debug)]
pub struct AckRegistry {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<Vec<Payload>>>>,
}

impl AckRegistry {
    /// Create a registry with no outstanding acks. Ids start at 0.
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh id and park its reply binding.
    pub fn allocate(&self) -> (i64, oneshot::Receiver<Vec<Payload>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        (id, rx)
    }

    /// Resolve a pending id with the reply payload.
    ///
    /// Returns `false` when the id has no live binding: never allocated,
    /// already resolved, timed out, or its waiter has gone away.
    pub fn resolve(&self, id: i64, payload: Vec<Payload>) -> bool {
        let binding = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&id));
        match binding {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Discard a binding without resolving it, after a local timeout.
    pub fn forget(&self, id: i64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    /// Drop every pending binding, waking all waiters with a closed result.
    pub fn fail_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    /// Number of outstanding acks.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }
}

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new()
    }
}
