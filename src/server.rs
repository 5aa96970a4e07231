//! Server role: answer a peer's requests over a byte stream.
//!
//! The same [`Session`] machinery drives both roles; a server is simply a
//! session whose [`MethodRouter`] does the work and which never issues
//! calls of its own.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::session::{MethodRouter, Session, SessionOptions};

/// Serve `router` until the peer closes the stream or `cancel` fires.
///
/// Returns once the session has fully closed.
pub async fn serve<R, W>(router: MethodRouter, reader: R, writer: W, cancel: &CancellationToken)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let options = SessionOptions::default()
        .with_label("client")
        .without_farewell()
        .with_call_timeout(None)
        .with_handler(Arc::new(router))
        .with_parent(cancel.clone());

    let session = Session::connect(reader, writer, options);
    info!(peer = %session.label(), "serving");
    session.closed().await;
    info!(peer = %session.label(), "server session ended");
}

/// Serve `router` on this process's stdin and stdout.
pub async fn serve_stdio(router: MethodRouter, cancel: &CancellationToken) {
    serve(router, tokio::io::stdin(), tokio::io::stdout(), cancel).await;
}
