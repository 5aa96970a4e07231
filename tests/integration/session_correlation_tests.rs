//! Request/response correlation over a scripted duplex peer.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use mcpkit::wire::{Message, RequestId, Response, RpcError};
use mcpkit::{AppError, SessionOptions, SessionState};

use super::test_helpers::{session_pair, stalled_pair, STEP};

// ── Correlation ──────────────────────────────────────────────────────────────

/// Many concurrent calls answered in reverse arrival order each receive
/// exactly their own result.
#[tokio::test]
async fn concurrent_calls_answered_out_of_order_reach_their_callers() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let mut calls = Vec::new();
    for n in 0..16_i64 {
        let session = session.clone();
        calls.push((
            n,
            tokio::spawn(async move { session.call("work", Some(json!({ "n": n }))).await }),
        ));
    }

    let mut arrived = Vec::new();
    for _ in 0..16 {
        arrived.push(peer.recv_request().await);
    }

    let ids: std::collections::HashSet<_> = arrived.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids.len(), 16, "every in-flight request must carry a distinct id");

    for req in arrived.into_iter().rev() {
        let n = req.params.as_ref().and_then(|p| p.get("n")).cloned().expect("n");
        peer.reply(req.id, json!({ "n": n })).await;
    }

    for (n, call) in calls {
        let result = call.await.expect("join").expect("call must succeed");
        assert_eq!(result, json!({ "n": n }), "caller {n} got someone else's result");
    }
    assert_eq!(session.pending_count(), 0);
}

/// Ids are numeric, start at 1 and increase per call.
#[tokio::test]
async fn request_ids_start_at_one_and_increase() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let mut seen = Vec::new();
    for _ in 0..3 {
        let (result, ()) = tokio::join!(session.call("ping", None), async {
            let req = peer.recv_request().await;
            seen.push(req.id.clone());
            peer.reply(req.id, json!({})).await;
        });
        result.expect("ping");
    }

    assert_eq!(
        seen,
        vec![RequestId::Number(1), RequestId::Number(2), RequestId::Number(3)]
    );
}

/// A present `null` result is delivered as `Value::Null`.
#[tokio::test]
async fn null_result_is_delivered_as_null() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let (result, ()) = tokio::join!(session.call("nothing", None), async {
        let req = peer.recv_request().await;
        peer.reply(req.id, Value::Null).await;
    });

    assert_eq!(result.expect("call"), Value::Null);
}

// ── Errors from the peer ─────────────────────────────────────────────────────

/// An error object is returned verbatim as `AppError::Rpc`.
#[tokio::test]
async fn error_response_is_returned_verbatim() {
    let (session, mut peer) = session_pair(SessionOptions::default());
    let error = RpcError::new(-32001, "quota exceeded").with_data(json!({ "retryAfter": 5 }));

    let expected = error.clone();
    let (result, ()) = tokio::join!(session.call("tools/call", None), async {
        let req = peer.recv_request().await;
        peer.send(Response::failure(Some(req.id), expected).into()).await;
    });

    assert_eq!(result, Err(AppError::Rpc(error)));
    assert_eq!(session.state(), SessionState::Open, "a call error must not end the session");
}

/// Responses for unknown ids, and responses with a null id, are discarded
/// without disturbing the session.
#[tokio::test]
async fn unknown_and_null_id_responses_are_discarded() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let (result, ()) = tokio::join!(session.call("ping", None), async {
        let req = peer.recv_request().await;
        peer.reply(RequestId::Number(999), json!("stray")).await;
        peer.send_raw(
            b"{\"jsonrpc\":\"2.0\",\"id\":null,\"error\":{\"code\":-32700,\"message\":\"Parse error\"}}\n",
        )
        .await;
        peer.reply(req.id, json!({ "ok": true })).await;
    });

    assert_eq!(result.expect("call"), json!({ "ok": true }));
    assert_eq!(session.state(), SessionState::Open);
}

// ── Caller cancellation ──────────────────────────────────────────────────────

/// Cancelling a call removes its pending entry; a late response is ignored
/// and the session stays usable.
#[tokio::test]
async fn cancelled_call_is_forgotten() {
    let (session, mut peer) = session_pair(SessionOptions::default());
    let cancel = CancellationToken::new();

    let (result, late_id) = tokio::join!(
        session.call_with_cancel("slow", None, &cancel),
        async {
            let req = peer.recv_request().await;
            cancel.cancel();
            req.id
        }
    );

    assert!(matches!(result, Err(AppError::Cancelled(_))), "got {result:?}");
    assert_eq!(session.pending_count(), 0, "cancelled call must not leak");

    peer.reply(late_id, json!("too late")).await;

    let (result, ()) = tokio::join!(session.call("ping", None), async {
        let req = peer.recv_request().await;
        peer.reply(req.id, json!({})).await;
    });
    assert_eq!(result.expect("session must still work"), json!({}));
}

/// Dropping a call future also removes its pending entry.
#[tokio::test]
async fn dropped_call_future_is_forgotten() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let outcome = tokio::time::timeout(Duration::from_millis(100), async {
        let (result, _) = tokio::join!(session.call("never", None), peer.recv_request());
        result
    })
    .await;

    assert!(outcome.is_err(), "the call must still have been waiting");
    assert_eq!(session.pending_count(), 0);
}

/// The per-call deadline fails the call with `Cancelled`.
#[tokio::test]
async fn call_timeout_fires() {
    let options = SessionOptions::default().with_call_timeout(Some(Duration::from_millis(50)));
    let (session, mut peer) = session_pair(options);

    let (result, _req) = tokio::join!(session.call("slow", None), peer.recv_request());

    match result {
        Err(AppError::Cancelled(msg)) => assert!(msg.contains("timed out"), "got {msg}"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(session.pending_count(), 0);
}

// ── Notifications ────────────────────────────────────────────────────────────

/// Notifications are written without registering a pending request.
#[tokio::test]
async fn notify_writes_without_waiting() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    tokio::time::timeout(STEP, session.notify("notifications/progress", Some(json!({ "p": 1 }))))
        .await
        .expect("notify must not wait for the peer")
        .expect("notify");

    let note = peer.recv_notification().await;
    assert_eq!(note.method, "notifications/progress");
    assert_eq!(note.params, Some(json!({ "p": 1 })));
    assert_eq!(session.pending_count(), 0);
}

/// Interleaved requests for different methods resolve by id, not by order
/// or method name.
#[tokio::test]
async fn correlation_is_by_id_only() {
    let (session, mut peer) = session_pair(SessionOptions::default());

    let a = session.clone();
    let b = session.clone();
    let first = tokio::spawn(async move { a.call("same", None).await });
    let second = tokio::spawn(async move { b.call("same", None).await });

    let mut by_id = HashMap::new();
    for _ in 0..2 {
        let req = peer.recv_request().await;
        by_id.insert(req.id.clone(), req.method);
    }
    for id in by_id.keys() {
        peer.send(Message::from(Response::success(id.clone(), json!(id.to_string()))))
            .await;
    }

    let one = first.await.expect("join").expect("first");
    let two = second.await.expect("join").expect("second");
    assert_ne!(one, two);
}

// ── Stalled writes ───────────────────────────────────────────────────────────

fn big_params() -> Option<Value> {
    Some(json!({ "blob": "x".repeat(4096) }))
}

/// The caller's token releases a call whose write is blocked.
#[tokio::test]
async fn cancel_releases_call_stuck_writing() {
    let (session, _far) = stalled_pair(SessionOptions::default());
    let cancel = CancellationToken::new();

    let caller = session.clone();
    let token = cancel.clone();
    let call = tokio::spawn(async move {
        caller.call_with_cancel("tools/call", big_params(), &token).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished(), "the write must be blocked on the full pipe");

    cancel.cancel();
    let result = tokio::time::timeout(STEP, call)
        .await
        .expect("call must not hang")
        .expect("join");
    assert!(matches!(result, Err(AppError::Cancelled(_))), "got {result:?}");
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.state(), SessionState::Open);
}

/// The call deadline also bounds the write.
#[tokio::test]
async fn call_timeout_bounds_the_write() {
    let options = SessionOptions::default().with_call_timeout(Some(Duration::from_millis(100)));
    let (session, _far) = stalled_pair(options);

    let result = tokio::time::timeout(STEP, session.call("tools/call", big_params()))
        .await
        .expect("call must not hang");
    match result {
        Err(AppError::Cancelled(msg)) => assert!(msg.contains("timed out"), "got {msg}"),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(session.pending_count(), 0);
}
