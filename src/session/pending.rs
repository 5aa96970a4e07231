//! In-flight request table.
//!
//! Maps each outstanding request id to a one-shot completion slot. The read
//! loop fulfils a slot exactly once and removes it in the same critical
//! section; teardown drains every remaining slot with a transport-closed
//! error and marks the table closed so no late registration can slip in
//! after the drain.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::wire::message::RequestId;
use crate::{AppError, Result};

/// Receiving half of a completion slot.
pub type Completion = oneshot::Receiver<Result<Value>>;

/// One outstanding call.
#[derive(Debug)]
struct PendingRequest {
    method: String,
    created: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct TableState {
    entries: HashMap<RequestId, PendingRequest>,
    /// Set once the table has been drained; carries the reason.
    closed: Option<String>,
}

/// Thread-safe map of pending completion slots keyed by request id.
#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<TableState>,
}

impl PendingTable {
    /// Create an empty, open table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiving half of its slot.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionClosed`] if the table has already been drained.
    /// - [`AppError::Protocol`] if `id` is already pending.
    pub fn register(&self, id: RequestId, method: &str) -> Result<Completion> {
        let mut state = lock(&self.inner);

        if let Some(reason) = &state.closed {
            return Err(AppError::SessionClosed(reason.clone()));
        }
        if state.entries.contains_key(&id) {
            return Err(AppError::Protocol(format!("request id {id} is already pending")));
        }

        let (slot, rx) = oneshot::channel();
        state.entries.insert(
            id,
            PendingRequest {
                method: method.to_owned(),
                created: Instant::now(),
                slot,
            },
        );
        Ok(rx)
    }

    /// Deliver `outcome` to the caller waiting on `id` and forget the id.
    ///
    /// Returns `false` when no request with that id is pending.
    pub fn complete(&self, id: &RequestId, outcome: Result<Value>) -> bool {
        let Some(entry) = lock(&self.inner).entries.remove(id) else {
            return false;
        };

        debug!(
            %id,
            method = entry.method,
            elapsed_ms = u64::try_from(entry.created.elapsed().as_millis()).unwrap_or(u64::MAX),
            ok = outcome.is_ok(),
            "request completed"
        );

        if entry.slot.send(outcome).is_err() {
            debug!(%id, "completion receiver already dropped");
        }
        true
    }

    /// Forget `id` without delivering anything (the caller gave up).
    ///
    /// Returns `false` when the id was not pending.
    pub fn cancel(&self, id: &RequestId) -> bool {
        lock(&self.inner).entries.remove(id).is_some()
    }

    /// Fail every pending request with [`AppError::TransportClosed`] and
    /// refuse further registrations.
    ///
    /// Idempotent; returns how many requests were failed by this call.
    pub fn close_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = {
            let mut state = lock(&self.inner);
            if state.closed.is_none() {
                state.closed = Some(reason.to_owned());
            }
            state.entries.drain().collect()
        };

        let count = drained.len();
        for (id, entry) in drained {
            debug!(%id, method = entry.method, reason, "failing pending request");
            let _ = entry
                .slot
                .send(Err(AppError::TransportClosed(reason.to_owned())));
        }
        count
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    /// Whether no request is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close_all`](Self::close_all) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed.is_some()
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
