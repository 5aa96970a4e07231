//! Best-effort monitor for the peer's diagnostic stream.
//!
//! Every non-blank stderr line is logged at `DEBUG`. Lines matching one of
//! the configured alert patterns (by default `error:` and `fatal:`, case
//! insensitive) are additionally logged at `ERROR`. Nothing here affects
//! session control flow: invalid UTF-8 is replaced, read failures end the
//! monitor quietly, and the stream is never required to be drained.

use bytes::BytesMut;
use regex::RegexSet;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{AppError, Result};

/// Patterns recognised by default as elevated-severity stderr lines.
pub const DEFAULT_ALERT_PATTERNS: &[&str] = &["(?i)error:", "(?i)fatal:"];

/// Compiled set of stderr alert patterns.
#[derive(Debug, Clone)]
pub struct AlertPatterns(RegexSet);

impl AlertPatterns {
    /// Compile `patterns` into a set.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if any pattern is not a valid regex.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        RegexSet::new(patterns)
            .map(Self)
            .map_err(|err| AppError::Config(format!("invalid stderr alert pattern: {err}")))
    }

    /// A set that never matches.
    #[must_use]
    pub fn none() -> Self {
        Self(RegexSet::empty())
    }

    /// Whether `line` should be logged at elevated severity.
    #[must_use]
    pub fn is_alert(&self, line: &str) -> bool {
        self.0.is_match(line)
    }
}

impl Default for AlertPatterns {
    fn default() -> Self {
        // The defaults are literal and known to compile.
        Self::new(DEFAULT_ALERT_PATTERNS).unwrap_or_else(|_| Self::none())
    }
}

/// Spawn the stderr monitor for `peer`.
///
/// Lines longer than `max_line_bytes` are skipped up to their next newline,
/// so a peer that never ends a line cannot grow the buffer without bound.
/// The task ends at end of stream, on a read error, or when `cancel` fires.
#[must_use]
pub fn spawn_stderr_monitor<R>(
    peer: String,
    mut stderr: R,
    alerts: AlertPatterns,
    max_line_bytes: usize,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_line_bytes);
        let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);

        loop {
            let read = tokio::select! {
                biased;

                () = cancel.cancelled() => break,
                read = stderr.read_buf(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    if let Ok(Some(rest)) = codec.decode_eof(&mut buf) {
                        report_line(&peer, &alerts, &rest);
                    }
                    debug!(peer, "stderr monitor: EOF");
                    break;
                }
                Ok(_) => {
                    if !drain_lines(&peer, &alerts, &mut codec, &mut buf) {
                        break;
                    }
                }
                Err(err) => {
                    debug!(peer, %err, "stderr monitor: read failed, stopping");
                    break;
                }
            }
        }
    })
}

/// Initial capacity of the stderr read buffer.
const READ_CHUNK_BYTES: usize = 4096;

/// Report every complete line in `buf`. Returns `false` if the monitor
/// should stop.
fn drain_lines(
    peer: &str,
    alerts: &AlertPatterns,
    codec: &mut AnyDelimiterCodec,
    buf: &mut BytesMut,
) -> bool {
    loop {
        match codec.decode(buf) {
            Ok(Some(line)) => report_line(peer, alerts, &line),
            Ok(None) => return true,
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                debug!(peer, "peer stderr line too long, skipping it");
            }
            Err(AnyDelimiterCodecError::Io(err)) => {
                debug!(peer, %err, "stderr monitor: decode failed, stopping");
                return false;
            }
        }
    }
}

fn report_line(peer: &str, alerts: &AlertPatterns, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }

    debug!(peer, stderr = line, "peer stderr");
    if alerts.is_alert(line) {
        error!(peer, stderr = line, "peer reported an error");
    }
}
