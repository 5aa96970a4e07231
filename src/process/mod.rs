//! Peer process transport.
//!
//! - `spawner`: launches the peer with piped stdio and supervises its exit
//!   through a single watcher task.
//! - `stderr`: best-effort diagnostic monitor for the peer's error stream.

pub mod spawner;
pub mod stderr;

pub use spawner::{spawn, ExitOutcome, PeerCommand, PeerEndpoints, ProcessHandle};
pub use stderr::{spawn_stderr_monitor, AlertPatterns, DEFAULT_ALERT_PATTERNS};
