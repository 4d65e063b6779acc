//! Outstanding request table.
//!
//! Maps correlation ids of in-flight requests to the waiter that receives the
//! reply. Reply arrival, timeout expiry and hub shutdown all race on the same
//! entry; every path removes it under the table lock, so exactly one of them
//! wins and the entry never outlives the request.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::message::{CorrelationId, Reply};

#[derive(Default)]
struct Table {
    waiters: HashMap<CorrelationId, oneshot::Sender<Reply>>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct PendingReplies {
    table: Mutex<Table>,
}

impl PendingReplies {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter. `None` once the table is closed.
    pub fn insert(&self, correlation_id: CorrelationId) -> Option<oneshot::Receiver<Reply>> {
        let mut table = self.lock();
        if table.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(correlation_id, tx);
        Some(rx)
    }

    /// Hand `reply` to its waiter. Returns false when nobody is waiting for
    /// it (late, duplicate or foreign reply).
    pub fn complete(&self, reply: Reply) -> bool {
        let waiter = self.lock().waiters.remove(reply.correlation_id());
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, correlation_id: &CorrelationId) -> bool {
        self.lock().waiters.remove(correlation_id).is_some()
    }

    /// Close the table and drop every waiter, which wakes them with a
    /// cancellation. Returns how many were waiting.
    pub fn cancel_all(&self) -> usize {
        let mut table = self.lock();
        table.closed = true;
        let cancelled = table.waiters.len();
        table.waiters.clear();
        cancelled
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.lock().waiters.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// Removes its entry when dropped, whichever way the request ends.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingReplies,
    correlation_id: CorrelationId,
}

impl<'a> PendingGuard<'a> {
    pub fn new(table: &'a PendingReplies, correlation_id: CorrelationId) -> Self {
        Self {
            table,
            correlation_id,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.correlation_id);
    }
}
