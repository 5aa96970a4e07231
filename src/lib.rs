#![forbid(unsafe_code)]

//! Process-backed JSON-RPC sessions and an MCP client built on them.
//!
//! - [`wire`]: newline-delimited JSON-RPC 2.0 framing.
//! - [`process`]: peer spawning, exit supervision, stderr monitoring.
//! - [`session`]: request correlation, inbound routing, teardown.
//! - [`client`]: handshake gate and typed MCP operations.
//! - [`server`]: serving a [`session::MethodRouter`] over a byte stream.
//! - [`cli`]: logging and signal setup for the bundled binaries.

pub mod cli;
pub mod client;
pub mod config;
pub mod errors;
pub mod process;
pub mod server;
pub mod session;
pub mod wire;

pub use client::McpClient;
pub use config::ClientConfig;
pub use errors::{AppError, Result};
pub use session::{Session, SessionOptions, SessionState};
