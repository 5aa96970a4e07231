//! Client configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::client::schema::{Implementation, LATEST_PROTOCOL_VERSION};
use crate::process::{AlertPatterns, PeerCommand, DEFAULT_ALERT_PATTERNS};
use crate::session::SessionOptions;
use crate::wire::DEFAULT_MAX_LINE_BYTES;
use crate::{AppError, Result};

/// Identity this client announces during the handshake.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientIdentity {
    /// Client name sent as `clientInfo.name`.
    #[serde(default = "default_client_name")]
    pub name: String,
    /// Client version sent as `clientInfo.version`.
    #[serde(default = "default_client_version")]
    pub version: String,
    /// Protocol revision requested in `initialize`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
            protocol_version: default_protocol_version(),
        }
    }
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_owned()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}

fn default_protocol_version() -> String {
    LATEST_PROTOCOL_VERSION.to_owned()
}

/// Session timing and framing limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Per-call deadline in seconds; 0 means no deadline.
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
    /// How long close waits for the peer to exit before killing it.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Longest accepted inbound line, in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout_seconds: default_call_timeout_seconds(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

fn default_call_timeout_seconds() -> u64 {
    30
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

/// Peer diagnostic stream settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DiagnosticsConfig {
    /// Regexes marking a stderr line as an error.
    #[serde(default = "default_alert_patterns")]
    pub stderr_alert_patterns: Vec<String>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            stderr_alert_patterns: default_alert_patterns(),
        }
    }
}

fn default_alert_patterns() -> Vec<String> {
    DEFAULT_ALERT_PATTERNS.iter().map(|p| (*p).to_owned()).collect()
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Handshake identity.
    #[serde(default)]
    pub client: ClientIdentity,
    /// Session tunables.
    #[serde(default)]
    pub session: SessionConfig,
    /// Stderr monitoring.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    /// Default peer to launch when none is given on the command line.
    #[serde(default)]
    pub server: Option<PeerCommand>,
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Per-call deadline, `None` when disabled.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        match self.session.call_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Grace period before a lingering peer is killed.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.session.shutdown_grace_ms)
    }

    /// `clientInfo` sent during the handshake.
    #[must_use]
    pub fn client_info(&self) -> Implementation {
        Implementation {
            name: self.client.name.clone(),
            version: self.client.version.clone(),
        }
    }

    /// Compiled stderr alert patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern does not compile.
    pub fn alert_patterns(&self) -> Result<AlertPatterns> {
        AlertPatterns::new(&self.diagnostics.stderr_alert_patterns)
    }

    /// Session options derived from this configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a pattern does not compile.
    pub fn session_options(&self) -> Result<SessionOptions> {
        Ok(SessionOptions::default()
            .with_call_timeout(self.call_timeout())
            .with_shutdown_grace(self.shutdown_grace())
            .with_max_line_bytes(self.session.max_line_bytes)
            .with_alerts(self.alert_patterns()?))
    }

    fn validate(&self) -> Result<()> {
        if self.client.name.trim().is_empty() {
            return Err(AppError::Config("client.name must not be empty".into()));
        }

        if self.client.version.trim().is_empty() {
            return Err(AppError::Config("client.version must not be empty".into()));
        }

        if self.client.protocol_version.trim().is_empty() {
            return Err(AppError::Config(
                "client.protocol_version must not be empty".into(),
            ));
        }

        if self.session.max_line_bytes == 0 {
            return Err(AppError::Config(
                "session.max_line_bytes must be greater than zero".into(),
            ));
        }

        if let Some(server) = &self.server {
            if server.command.trim().is_empty() {
                return Err(AppError::Config("server.command must not be empty".into()));
            }
        }

        self.alert_patterns()?;
        Ok(())
    }
}
