//! Session teardown: explicit close, end of stream, framing errors, and
//! scope cancellation all converge on one idempotent shutdown.

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use mcpkit::wire::Message;
use mcpkit::{AppError, SessionOptions, SessionState};

use super::test_helpers::{session_pair, stalled_pair, STEP};

/// Closing with N calls outstanding fails all N with `TransportClosed`
/// before `close` returns, and leaves nothing pending.
#[tokio::test]
async fn close_fails_every_pending_call() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let mut calls = Vec::new();
    for _ in 0..5 {
        let session = session.clone();
        calls.push(tokio::spawn(async move { session.call("tools/list", None).await }));
    }
    for _ in 0..5 {
        peer.recv_request().await;
    }
    assert_eq!(session.pending_count(), 5);

    timeout(STEP, session.close()).await.expect("close must be bounded");

    for call in calls {
        let result = call.await.expect("join");
        assert!(
            matches!(result, Err(AppError::TransportClosed(_))),
            "expected TransportClosed, got {result:?}"
        );
    }
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.state(), SessionState::Closed);
}

/// Two concurrent closes both return and the teardown runs once: the peer
/// sees exactly one farewell before end of stream.
#[tokio::test]
async fn concurrent_close_is_idempotent() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let other = session.clone();
    timeout(STEP, async { tokio::join!(session.close(), other.close()) })
        .await
        .expect("both closes must return");
    session.close().await;

    let seen = peer.drain_until_eof().await;
    let farewells = seen
        .iter()
        .filter(|m| matches!(m, Message::Notification(n) if n.method == "exit"))
        .count();
    assert_eq!(farewells, 1, "farewell must be written exactly once: {seen:?}");
    assert_eq!(session.state(), SessionState::Closed);
}

/// After close every operation fails with `SessionClosed`.
#[tokio::test]
async fn operations_after_close_fail_with_session_closed() {
    let (session, _peer) = session_pair(SessionOptions::default().without_farewell());
    session.close().await;

    assert!(matches!(
        session.call("ping", None).await,
        Err(AppError::SessionClosed(_))
    ));
    assert!(matches!(
        session.notify("notifications/progress", None).await,
        Err(AppError::SessionClosed(_))
    ));
}

/// The peer closing its output fails outstanding calls and closes the
/// session on its own.
#[tokio::test]
async fn end_of_stream_closes_session() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let caller = session.clone();
    let call = tokio::spawn(async move { caller.call("tools/list", None).await });
    peer.recv_request().await;
    peer.close_output().await;

    let result = timeout(STEP, call).await.expect("call must not hang").expect("join");
    assert!(matches!(result, Err(AppError::TransportClosed(_))), "got {result:?}");

    timeout(STEP, session.closed()).await.expect("session must reach Closed");
    assert_eq!(session.state(), SessionState::Closed);
}

/// A line that is not JSON terminates the read loop and closes the session.
#[tokio::test]
async fn framing_error_closes_session() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let caller = session.clone();
    let call = tokio::spawn(async move { caller.call("ping", None).await });
    peer.recv_request().await;
    peer.send_raw(b"this is not json\n").await;

    let result = timeout(STEP, call).await.expect("call must not hang").expect("join");
    match result {
        Err(AppError::TransportClosed(reason)) => {
            assert!(reason.contains("malformed json"), "reason was {reason}");
        }
        other => panic!("expected TransportClosed, got {other:?}"),
    }
    timeout(STEP, session.closed()).await.expect("session must reach Closed");
}

/// A blank line is a framing error too.
#[tokio::test]
async fn blank_line_closes_session() {
    let (session, mut peer) = session_pair(SessionOptions::default());
    peer.send_raw(b"\n").await;
    timeout(STEP, session.closed()).await.expect("session must reach Closed");
}

/// An oversized line closes the session instead of buffering forever.
#[tokio::test]
async fn oversized_line_closes_session() {
    let (session, mut peer) = session_pair(SessionOptions::default().with_max_line_bytes(64));
    let big = format!("{{\"jsonrpc\":\"2.0\",\"method\":\"x\",\"params\":\"{}\"}}\n", "a".repeat(256));
    peer.send_raw(big.as_bytes()).await;
    timeout(STEP, session.closed()).await.expect("session must reach Closed");
}

/// Cancelling the parent scope tears the session down.
#[tokio::test]
async fn parent_cancellation_closes_session() {
    let parent = CancellationToken::new();
    let (session, mut peer) = session_pair(SessionOptions::default().with_parent(parent.clone()));

    let caller = session.clone();
    let call = tokio::spawn(async move { caller.call("slow", None).await });
    peer.recv_request().await;
    parent.cancel();

    let result = timeout(STEP, call).await.expect("call must not hang").expect("join");
    assert!(matches!(result, Err(AppError::TransportClosed(_))), "got {result:?}");
    timeout(STEP, session.closed()).await.expect("session must reach Closed");
}

/// Close writes the farewell notification and then closes the write side.
#[tokio::test]
async fn close_sends_farewell_then_eof() {
    let (session, mut peer) = session_pair(SessionOptions::default());
    session.notify("notifications/initialized", None).await.expect("notify");

    session.close().await;

    let seen = peer.drain_until_eof().await;
    let methods: Vec<_> = seen.iter().filter_map(Message::method).collect();
    assert_eq!(methods, vec!["notifications/initialized", "exit"]);
}

/// A session with no farewell closes its write side without writing.
#[tokio::test]
async fn close_without_farewell_writes_nothing() {
    let (session, mut peer) = session_pair(SessionOptions::default().without_farewell());
    session.close().await;
    assert!(peer.drain_until_eof().await.is_empty());
}

/// A peer that keeps writing while the session closes does not stall close.
#[tokio::test]
async fn chatty_peer_does_not_stall_close() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let talker = tokio::spawn(async move {
        for i in 0..50_i64 {
            let note = Message::notification("notifications/message", Some(json!({ "i": i })));
            if peer.try_send(note).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        peer
    });

    timeout(STEP, session.close()).await.expect("close must be bounded");
    assert_eq!(session.state(), SessionState::Closed);
    let _peer = talker.await.expect("join");
}

// ── Stalled writes ───────────────────────────────────────────────────────────

/// Close releases a call blocked writing to a full pipe, and a notify queued
/// behind it, with `TransportClosed`.
#[tokio::test]
async fn close_releases_call_stuck_writing() {
    let (session, _far) = stalled_pair(SessionOptions::default());

    let caller = session.clone();
    let call = tokio::spawn(async move {
        caller
            .call("tools/call", Some(json!({ "blob": "x".repeat(4096) })))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let notifier = session.clone();
    let note = tokio::spawn(async move { notifier.notify("notifications/progress", None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished(), "the write must be blocked on the full pipe");

    timeout(STEP, session.close()).await.expect("close must be bounded");
    assert_eq!(session.state(), SessionState::Closed);

    let result = timeout(STEP, call).await.expect("call must not hang").expect("join");
    assert!(matches!(result, Err(AppError::TransportClosed(_))), "got {result:?}");
    let result = timeout(STEP, note).await.expect("notify must not hang").expect("join");
    assert!(
        matches!(result, Err(AppError::TransportClosed(_) | AppError::SessionClosed(_))),
        "got {result:?}"
    );
    assert_eq!(session.pending_count(), 0);
}
