//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

use crate::wire::message::RpcError;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of a peer session.
///
/// The enum is `Clone` so that a single teardown can hand the same failure
/// to every suspended caller.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The peer executable could not be launched.
    Spawn(String),
    /// A line on the data stream was empty, malformed, or too long.
    Framing(String),
    /// A gated operation was attempted before the handshake completed.
    NotInitialized(String),
    /// The peer answered with a protocol-level error object.
    Rpc(RpcError),
    /// The session closed or the peer exited while a call was outstanding.
    TransportClosed(String),
    /// The session is already closed; no further operations are accepted.
    SessionClosed(String),
    /// The caller's own cancellation token or deadline fired.
    Cancelled(String),
    /// A well-formed response carried a payload of the wrong shape.
    Protocol(String),
    /// File-system or stream I/O failure.
    Io(String),
}

impl AppError {
    /// Whether this error ends the session rather than a single call.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Framing(_) | Self::TransportClosed(_) | Self::SessionClosed(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Framing(msg) => write!(f, "framing: {msg}"),
            Self::NotInitialized(msg) => write!(f, "not initialized: {msg}"),
            Self::Rpc(err) => write!(f, "rpc: {err}"),
            Self::TransportClosed(msg) => write!(f, "transport closed: {msg}"),
            Self::SessionClosed(msg) => write!(f, "session closed: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Rpc(err)
    }
}
