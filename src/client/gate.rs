//! Handshake gate.
//!
//! Tracks whether the `initialize` exchange has completed. Every client
//! operation other than `initialize` checks the gate first and fails with
//! [`AppError::NotInitialized`] without writing anything to the peer.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::client::schema::InitializeResult;
use crate::{AppError, Result};

/// Handshake progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GateState {
    /// No handshake has succeeded yet.
    #[default]
    Uninitialized,
    /// An `initialize` request is in flight.
    Initializing,
    /// Handshake complete; operations are accepted.
    Ready,
}

#[derive(Debug, Default)]
struct GateInner {
    state: GateState,
    peer: Option<InitializeResult>,
}

/// Per-client handshake gate.
#[derive(Debug, Default)]
pub struct Gate {
    inner: RwLock<GateInner>,
}

impl Gate {
    /// Closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> GateState {
        self.read().state
    }

    /// Fail unless the handshake has completed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotInitialized`] naming `operation`.
    pub fn ensure_ready(&self, operation: &str) -> Result<()> {
        match self.state() {
            GateState::Ready => Ok(()),
            GateState::Initializing => Err(AppError::NotInitialized(format!(
                "{operation} called while initialize is in flight"
            ))),
            GateState::Uninitialized => Err(AppError::NotInitialized(format!(
                "{operation} called before initialize"
            ))),
        }
    }

    /// Mark an `initialize` request as in flight.
    pub fn begin(&self) {
        self.write().state = GateState::Initializing;
    }

    /// Record the server's answer and open the gate.
    pub fn complete(&self, peer: InitializeResult) {
        let mut inner = self.write();
        inner.peer = Some(peer);
        inner.state = GateState::Ready;
    }

    /// Revert after a failed `initialize`.
    ///
    /// Only an in-flight handshake is reverted: if an overlapping
    /// `initialize` already opened the gate, it stays open.
    pub fn fail(&self) {
        let mut inner = self.write();
        if inner.state == GateState::Initializing {
            inner.peer = None;
            inner.state = GateState::Uninitialized;
        }
    }

    /// Server identity and capabilities from the last successful handshake.
    #[must_use]
    pub fn peer(&self) -> Option<InitializeResult> {
        self.read().peer.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, GateInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GateInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
