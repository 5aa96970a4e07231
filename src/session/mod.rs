//! Peer session: request correlation over one framed byte stream.
//!
//! A [`Session`] owns the write side of the stream, a single read-loop task,
//! the [`PendingTable`] of outstanding calls, and (for spawned peers) the
//! [`ProcessHandle`]. Any number of tasks may issue calls concurrently;
//! each gets its own id and its own completion slot, and responses may
//! arrive in any order.
//!
//! # Teardown
//!
//! Every termination path (explicit [`Session::close`], end of the peer's
//! output stream, a framing error, peer process exit, or cancellation of
//! the parent scope) converges on the same idempotent teardown:
//!
//! 1. state becomes [`SessionState::Closing`]; new operations are refused;
//! 2. the farewell notification is written, bounded by a timeout;
//! 3. the write side is flushed and shut down, closing the peer's input;
//!    a write stuck on a full pipe is abandoned first;
//! 4. the session scope is cancelled and the read loop is awaited;
//! 5. every pending call fails with [`AppError::TransportClosed`];
//! 6. a spawned peer gets a grace period to exit, then is killed and reaped;
//! 7. state becomes [`SessionState::Closed`].

pub mod pending;
pub mod router;

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::schema::methods;
use crate::process::{self, spawn_stderr_monitor, AlertPatterns, PeerCommand, ProcessHandle};
use crate::wire::codec::DEFAULT_MAX_LINE_BYTES;
use crate::wire::message::{Message, Request, RequestId, Response};
use crate::wire::{MessageReader, MessageWriter};
use crate::{AppError, Result};

pub use pending::PendingTable;
pub use router::{HandlerFuture, InboundHandler, MethodRouter};

use pending::lock;

/// Upper bound on writing the farewell notification during teardown.
const FAREWELL_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on flushing and shutting down the write side.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on waiting for the read loop after cancelling it.
const READER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Default grace period a spawned peer gets to exit on its own.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ── State ────────────────────────────────────────────────────────────────────

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting calls and notifications.
    Open,
    /// Teardown in progress; new operations are refused.
    Closing,
    /// Terminal.
    Closed,
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Tunables for one session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Label used in log fields; defaults to the executable name for
    /// spawned peers and `"peer"` otherwise.
    pub label: Option<String>,
    /// Per-call deadline; `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    /// How long a spawned peer may take to exit after its input closes.
    pub shutdown_grace: Duration,
    /// Longest accepted inbound line, in bytes.
    pub max_line_bytes: usize,
    /// Notification written to the peer at the start of teardown.
    pub farewell: Option<String>,
    /// Stderr lines logged at elevated severity.
    pub alerts: AlertPatterns,
    /// Handler for peer-initiated requests and notifications.
    pub handler: Option<Arc<dyn InboundHandler>>,
    /// Scope the session's own cancellation scope is derived from.
    pub parent: Option<CancellationToken>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            label: None,
            call_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            farewell: Some(methods::EXIT.to_owned()),
            alerts: AlertPatterns::default(),
            handler: None,
            parent: None,
        }
    }
}

impl SessionOptions {
    /// Set the log label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }

    /// Set the peer exit grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the inbound line limit.
    #[must_use]
    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    /// Set the farewell notification method.
    #[must_use]
    pub fn with_farewell(mut self, method: impl Into<String>) -> Self {
        self.farewell = Some(method.into());
        self
    }

    /// Send no farewell notification.
    #[must_use]
    pub fn without_farewell(mut self) -> Self {
        self.farewell = None;
        self
    }

    /// Set the stderr alert patterns.
    #[must_use]
    pub fn with_alerts(mut self, alerts: AlertPatterns) -> Self {
        self.alerts = alerts;
        self
    }

    /// Set the inbound handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Derive the session scope from `parent`.
    #[must_use]
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }
}

impl Debug for SessionOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("label", &self.label)
            .field("call_timeout", &self.call_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("max_line_bytes", &self.max_line_bytes)
            .field("farewell", &self.farewell)
            .field("alerts", &self.alerts)
            .field("handler", &self.handler.is_some())
            .field("parent", &self.parent.is_some())
            .finish()
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct Shared {
    label: String,
    call_timeout: Option<Duration>,
    shutdown_grace: Duration,
    farewell: Option<String>,
    next_id: AtomicI64,
    pending: PendingTable,
    writer: tokio::sync::Mutex<Option<MessageWriter<BoxedWriter>>>,
    state: watch::Sender<SessionState>,
    /// Session scope: cancelling it stops the read loop.
    cancel: CancellationToken,
    /// Stops the stderr monitor once the peer has been reaped.
    diagnostics: CancellationToken,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    teardown: OnceCell<()>,
    handler: Arc<dyn InboundHandler>,
    process: Option<ProcessHandle>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Open => Ok(()),
            SessionState::Closing => Err(AppError::SessionClosed("session is closing".into())),
            SessionState::Closed => Err(AppError::SessionClosed("session is closed".into())),
        }
    }

    /// Serialise one message onto the write side, giving up when the
    /// session scope is cancelled.
    ///
    /// Waiting for the writer and a write blocked on a full pipe both end
    /// with [`AppError::TransportClosed`] once teardown cancels the scope.
    async fn send(&self, message: Message) -> Result<()> {
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => Err(AppError::TransportClosed(
                "session closed before the write completed".into(),
            )),
            result = self.write(message) => result,
        }
    }

    /// Unraced write. A frame whose write is abandoned midway stays in the
    /// writer's buffer and is completed by the next flush, so frames never
    /// interleave.
    async fn write(&self, message: Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(AppError::SessionClosed("write side already shut down".into()));
        };

        trace!(peer = %self.label, frame = ?message, "frame out");
        writer.write(message).await.map_err(|err| match err {
            AppError::Io(msg) => AppError::TransportClosed(format!("write failed: {msg}")),
            other => other,
        })
    }

    /// Move to `Closing` and fail outstanding calls right away.
    ///
    /// Returns `true` if this call performed the transition.
    fn begin_closing(&self, reason: &str) -> bool {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        });

        let failed = self.pending.close_all(reason);
        if failed > 0 {
            debug!(peer = %self.label, failed, reason, "failed outstanding requests");
        }
        transitioned
    }

    async fn run_teardown(&self) {
        info!(peer = %self.label, "closing session");
        self.begin_closing("session closed");

        if let Some(method) = &self.farewell {
            let farewell = self.write(Message::notification(method.clone(), None));
            match timeout(FAREWELL_TIMEOUT, farewell).await {
                Ok(Ok(())) => debug!(peer = %self.label, method, "farewell sent"),
                Ok(Err(err)) => debug!(peer = %self.label, %err, "farewell not delivered"),
                Err(_) => debug!(peer = %self.label, "farewell timed out"),
            }
        }

        let guard = match timeout(WRITER_SHUTDOWN_TIMEOUT, self.writer.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                // A write is stuck on a full pipe; cancelling the scope makes
                // it give up the writer.
                debug!(peer = %self.label, "writer busy, abandoning in-flight writes");
                self.cancel.cancel();
                timeout(WRITER_SHUTDOWN_TIMEOUT, self.writer.lock()).await.ok()
            }
        };
        let writer = match guard {
            Some(mut guard) => guard.take(),
            None => {
                warn!(peer = %self.label, "writer still busy after cancellation");
                None
            }
        };
        if let Some(mut writer) = writer {
            match timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => debug!(peer = %self.label, "write side closed"),
                Ok(Err(err)) => debug!(peer = %self.label, %err, "write side shutdown failed"),
                Err(_) => warn!(peer = %self.label, "write side shutdown timed out, dropping it"),
            }
        }

        self.cancel.cancel();
        let reader = lock(&self.reader_task).take();
        if let Some(handle) = reader {
            if timeout(READER_STOP_TIMEOUT, handle).await.is_err() {
                warn!(peer = %self.label, "read loop did not stop in time");
            }
        }

        self.pending.close_all("session closed");

        if let Some(process) = &self.process {
            if !process.has_exited() && timeout(self.shutdown_grace, process.wait()).await.is_err() {
                info!(
                    peer = %self.label,
                    pid = process.pid(),
                    grace_ms = u64::try_from(self.shutdown_grace.as_millis()).unwrap_or(u64::MAX),
                    "peer still running after grace period, killing"
                );
                process.kill();
            }
            let outcome = process.wait().await;
            debug!(peer = %self.label, outcome = %outcome, "peer process reaped");
        }

        self.diagnostics.cancel();
        self.state.send_replace(SessionState::Closed);
        info!(peer = %self.label, "session closed");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.diagnostics.cancel();
        if let Some(process) = &self.process {
            process.kill();
        }
    }
}

/// Removes an abandoned entry from the pending table when a call future is
/// dropped before its response arrives.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.cancel(&self.id) {
            debug!(id = %self.id, "abandoned pending request");
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Handle to one peer session. Cloning is cheap; all clones share the same
/// stream, pending table, and lifecycle.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.shared.label)
            .field("state", &self.shared.state())
            .field("pending", &self.shared.pending.len())
            .field("pid", &self.shared.process.as_ref().and_then(ProcessHandle::pid))
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn `command` and start a session over its stdio.
    ///
    /// The read loop, stderr monitor, and exit supervisor are all running
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the peer cannot be launched.
    pub fn spawn(command: &PeerCommand, options: SessionOptions) -> Result<Self> {
        let (endpoints, handle) = process::spawn(command)?;

        let label = options.label.clone().unwrap_or_else(|| command.label());
        let alerts = options.alerts.clone();
        let max_line_bytes = options.max_line_bytes;
        let options = options.with_label(label.clone());

        let session = Self::assemble(
            Box::new(endpoints.stdout),
            Box::new(endpoints.stdin),
            Some(handle.clone()),
            options,
        );

        let _stderr = spawn_stderr_monitor(
            label,
            endpoints.stderr,
            alerts,
            max_line_bytes,
            session.shared.diagnostics.clone(),
        );
        session.supervise_exit(handle);

        Ok(session)
    }

    /// Start a session over an already-connected byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect<R, W>(reader: R, writer: W, options: SessionOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::assemble(Box::new(reader), Box::new(writer), None, options)
    }

    fn assemble(
        reader: BoxedReader,
        writer: BoxedWriter,
        process: Option<ProcessHandle>,
        options: SessionOptions,
    ) -> Self {
        let cancel = options
            .parent
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let label = options.label.unwrap_or_else(|| "peer".to_owned());
        let handler = options
            .handler
            .unwrap_or_else(|| Arc::new(MethodRouter::new()));
        let (state, _) = watch::channel(SessionState::Open);

        let shared = Arc::new(Shared {
            label: label.clone(),
            call_timeout: options.call_timeout,
            shutdown_grace: options.shutdown_grace,
            farewell: options.farewell,
            next_id: AtomicI64::new(1),
            pending: PendingTable::new(),
            writer: tokio::sync::Mutex::new(Some(MessageWriter::new(writer))),
            state,
            cancel: cancel.clone(),
            diagnostics: CancellationToken::new(),
            reader_task: Mutex::new(None),
            teardown: OnceCell::new(),
            handler,
            process,
        });

        let reader = MessageReader::new(reader, options.max_line_bytes);
        let task = tokio::spawn(read_loop(Arc::downgrade(&shared), reader, cancel, label));
        *lock(&shared.reader_task) = Some(task);

        Self { shared }
    }

    /// Close the session when the peer process exits on its own.
    fn supervise_exit(&self, handle: ProcessHandle) {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let outcome = handle.wait().await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.begin_closing(&format!("peer exited: {outcome}")) {
                warn!(peer = %shared.label, outcome = %outcome, "peer exited while session open");
            }
            Session { shared }.close().await;
        });
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    /// Send a request and wait for its response, bounded by the session's
    /// default call timeout.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] when the peer answers with an error object.
    /// - [`AppError::TransportClosed`] when the session ends first.
    /// - [`AppError::SessionClosed`] when the session is already closing.
    /// - [`AppError::Cancelled`] when the call timeout fires.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call_with_cancel(method, params, &CancellationToken::new())
            .await
    }

    /// Like [`call`](Self::call), but also abandons the call when `cancel`
    /// fires.
    ///
    /// An abandoned call's id is removed from the pending table; a late
    /// response for it is discarded.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call).
    pub async fn call_with_cancel(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let shared = &self.shared;
        shared.ensure_open()?;

        let id = RequestId::Number(shared.next_id.fetch_add(1, Ordering::Relaxed));
        let completion = shared.pending.register(id.clone(), method)?;
        let _guard = PendingGuard {
            table: &shared.pending,
            id: id.clone(),
        };

        let limit = shared.call_timeout;
        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        debug!(peer = %shared.label, %id, method, "sending request");
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(peer = %shared.label, %id, method, "request cancelled while writing");
                return Err(call_cancelled(method));
            }
            () = &mut deadline => {
                warn!(peer = %shared.label, %id, method, "request timed out while writing");
                return Err(call_timed_out(method, limit));
            }
            sent = shared.send(Message::request(id.clone(), method, params)) => sent?,
        }

        tokio::select! {
            biased;

            outcome = completion => outcome.unwrap_or_else(|_| {
                Err(AppError::TransportClosed("completion slot dropped".into()))
            }),
            () = cancel.cancelled() => {
                debug!(peer = %shared.label, %id, method, "request cancelled by caller");
                Err(call_cancelled(method))
            }
            () = &mut deadline => {
                warn!(peer = %shared.label, %id, method, "request timed out");
                Err(call_timed_out(method, limit))
            }
        }
    }

    /// Write a notification. Returns once the frame is written.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionClosed`] when the session is already closing.
    /// - [`AppError::TransportClosed`] when the write fails.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.shared.ensure_open()?;
        debug!(peer = %self.shared.label, method, "sending notification");
        self.shared
            .send(Message::notification(method, params))
            .await
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Tear the session down. Idempotent and safe to call concurrently;
    /// every caller returns once teardown has finished.
    pub async fn close(&self) {
        self.shared
            .teardown
            .get_or_init(|| self.shared.run_teardown())
            .await;
    }

    /// Resolve once the session reaches [`SessionState::Closed`].
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Log label of this session.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Handle to the spawned peer, if any.
    #[must_use]
    pub fn process(&self) -> Option<&ProcessHandle> {
        self.shared.process.as_ref()
    }

    /// The session's cancellation scope; cancelling it closes the session.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}

fn call_cancelled(method: &str) -> AppError {
    AppError::Cancelled(format!("{method} cancelled"))
}

fn call_timed_out(method: &str, limit: Option<Duration>) -> AppError {
    AppError::Cancelled(format!(
        "{method} timed out after {}ms",
        limit.unwrap_or_default().as_millis()
    ))
}

// ── Read loop ────────────────────────────────────────────────────────────────

/// Single reader of the peer's output. Holds only a weak reference between
/// messages so that dropping every [`Session`] handle releases the stream.
async fn read_loop(
    shared: Weak<Shared>,
    mut reader: MessageReader<BoxedReader>,
    cancel: CancellationToken,
    label: String,
) {
    debug!(peer = %label, "read loop started");

    let reason = loop {
        match reader.next_message(&cancel).await {
            Ok(Some(message)) => {
                trace!(peer = %label, frame = ?message, "frame in");
                let Some(shared) = shared.upgrade() else {
                    break "session dropped".to_owned();
                };
                dispatch(&shared, message);
            }
            Ok(None) => {
                debug!(peer = %label, "peer closed its output stream");
                break "peer closed its output stream".to_owned();
            }
            Err(AppError::Cancelled(_)) => break "session cancelled".to_owned(),
            Err(err) => {
                warn!(peer = %label, %err, "read loop stopped on error");
                break err.to_string();
            }
        }
    };
    drop(reader);

    debug!(peer = %label, reason, "read loop ended");

    if let Some(shared) = shared.upgrade() {
        shared.begin_closing(&reason);
        let session = Session { shared };
        tokio::spawn(async move { session.close().await });
    }
}

fn dispatch(shared: &Arc<Shared>, message: Message) {
    match message {
        Message::Response(Response {
            id: Some(id),
            outcome,
        }) => {
            if !shared.pending.complete(&id, outcome.map_err(AppError::Rpc)) {
                warn!(peer = %shared.label, %id, "response for unknown request id, discarding");
            }
        }
        Message::Response(Response { id: None, outcome }) => {
            warn!(
                peer = %shared.label,
                error = ?outcome.err(),
                "response without id, discarding"
            );
        }
        Message::Request(request) => {
            let handler = Arc::clone(&shared.handler);
            let weak = Arc::downgrade(shared);
            tokio::spawn(answer_request(weak, handler, request));
        }
        Message::Notification(note) => {
            let handler = Arc::clone(&shared.handler);
            tokio::spawn(async move {
                handler.handle_notification(&note.method, note.params).await;
            });
        }
    }
}

async fn answer_request(shared: Weak<Shared>, handler: Arc<dyn InboundHandler>, request: Request) {
    let Request { id, method, params } = request;
    let outcome = handler.handle_request(&method, params).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let response = Response {
        id: Some(id.clone()),
        outcome,
    };
    if let Err(err) = shared.send(response.into()).await {
        debug!(peer = %shared.label, %id, method, %err, "could not answer inbound request");
    }
}
