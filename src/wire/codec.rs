//! NDJSON framing codec for peer data streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length and turns each `\n`-terminated UTF-8 line into one [`Message`].
//!
//! # Usage
//!
//! Use [`NdjsonCodec`] directly with [`FramedRead`] / [`FramedWrite`], or the
//! [`MessageReader`] / [`MessageWriter`] wrappers which add cancellation and
//! orderly shutdown.
//!
//! ```rust,ignore
//! use mcpkit::wire::codec::MessageReader;
//!
//! let mut reader = MessageReader::new(child_stdout, DEFAULT_MAX_LINE_BYTES);
//! while let Some(msg) = reader.next_message(&cancel).await? { /* … */ }
//! ```

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::wire::message::Message;
use crate::{AppError, Result};

/// Default maximum inbound line length: 1 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited JSON codec.
///
/// # Decoder
///
/// - Blank line → [`AppError::Framing`]`("empty message")`.
/// - Not JSON → [`AppError::Framing`]`("malformed json: …")`.
/// - JSON but not a message → [`AppError::Framing`]`("invalid message: …")`.
/// - Longer than the limit → [`AppError::Framing`]`("line too long: …")`.
///
/// # Encoder
///
/// Compact JSON followed by exactly one `\n`, appended to the output buffer
/// in one piece.
#[derive(Debug)]
pub struct NdjsonCodec {
    lines: LinesCodec,
    max_line_bytes: usize,
}

impl NdjsonCodec {
    /// Codec with the [`DEFAULT_MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Codec with a custom inbound line limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Message;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let limit = self.max_line_bytes;
        match self.lines.decode(src).map_err(|e| map_codec_error(e, limit))? {
            Some(line) => parse_line(&line).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let limit = self.max_line_bytes;
        match self.lines.decode_eof(src).map_err(|e| map_codec_error(e, limit))? {
            Some(line) => parse_line(&line).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for NdjsonCodec {
    type Error = AppError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let line = encode_line(&item)?;
        dst.reserve(line.len());
        dst.extend_from_slice(&line);
        Ok(())
    }
}

/// Parse one line (without its terminator) into a [`Message`].
///
/// Surrounding whitespace, including a trailing `\r`, is ignored.
///
/// # Errors
///
/// Returns [`AppError::Framing`] for blank, non-JSON, or non-message lines.
pub fn parse_line(line: &str) -> Result<Message> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(AppError::Framing("empty message".into()));
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| AppError::Framing(format!("malformed json: {e}")))?;

    serde_json::from_value(value).map_err(|e| AppError::Framing(format!("invalid message: {e}")))
}

/// Serialize `message` as compact JSON followed by a single `\n`.
///
/// # Errors
///
/// Returns [`AppError::Framing`] if serialization fails (a params value
/// containing a non-string map key, for example).
pub fn encode_line(message: &Message) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)
        .map_err(|e| AppError::Framing(format!("failed to serialise message: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ── Stream wrappers ───────────────────────────────────────────────────────────

/// Decode side of a peer stream.
#[derive(Debug)]
pub struct MessageReader<R> {
    framed: FramedRead<R, NdjsonCodec>,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap `reader` with the given inbound line limit.
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            framed: FramedRead::new(reader, NdjsonCodec::with_max_line_bytes(max_line_bytes)),
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` at clean end of stream. If `cancel` has already
    /// fired, returns immediately without touching the stream.
    ///
    /// # Errors
    ///
    /// - [`AppError::Cancelled`] when `cancel` fires before a line arrives.
    /// - [`AppError::Framing`] for an undecodable line.
    /// - [`AppError::Io`] for a failed read.
    pub async fn next_message(&mut self, cancel: &CancellationToken) -> Result<Option<Message>> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled("read cancelled".into()));
        }

        tokio::select! {
            biased;

            () = cancel.cancelled() => Err(AppError::Cancelled("read cancelled".into())),
            item = self.framed.next() => item.transpose(),
        }
    }
}

/// Encode side of a peer stream.
#[derive(Debug)]
pub struct MessageWriter<W> {
    framed: FramedWrite<W, NdjsonCodec>,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wrap `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            framed: FramedWrite::new(writer, NdjsonCodec::new()),
        }
    }

    /// Encode and flush one message.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the peer's input is gone, or
    /// [`AppError::Framing`] if the message cannot be serialised.
    pub async fn write(&mut self, message: Message) -> Result<()> {
        self.framed.send(message).await
    }

    /// Flush pending bytes and shut the underlying writer down, which closes
    /// the peer's input pipe.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the final flush fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.framed.close().await
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

fn map_codec_error(e: LinesCodecError, limit: usize) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Framing(format!("line too long: exceeded {limit} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
