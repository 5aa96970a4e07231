//! Process plumbing shared by the `mcpkit` and `mcp-time` binaries.
//!
//! Library code never calls these; a binary installs logging once at
//! startup. Logs always go to stderr because stdout may carry the protocol
//! stream.

use clap::ValueEnum;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{AppError, Result};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Log line format selected with `--log-format`.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Install the global stderr subscriber.
///
/// # Errors
///
/// Returns [`AppError::Config`] if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = fmt().with_env_filter(filter).with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
    installed.map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))
}

/// Resolve on SIGINT or (on unix) SIGTERM, returning the signal's name.
pub async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                name = interrupt() => name,
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable, listening for SIGINT only");
                interrupt().await
            }
        }
    }

    #[cfg(not(unix))]
    {
        interrupt().await
    }
}

/// Cancel `scope` when a shutdown signal arrives.
#[must_use]
pub fn cancel_on_signal(scope: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = scope.cancelled() => {}
            name = shutdown_signal() => {
                info!(signal = name, "shutdown signal received");
                scope.cancel();
            }
        }
    })
}

async fn interrupt() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        // Without a handler the process can only be stopped by other means.
        error!(%err, "SIGINT handler failed");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
