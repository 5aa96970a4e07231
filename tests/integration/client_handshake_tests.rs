//! Client handshake gate and typed operations against a scripted peer.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use mcpkit::client::GateState;
use mcpkit::wire::{Message, RequestId, Response, RpcError};
use mcpkit::{AppError, ClientConfig, McpClient};

use super::test_helpers::{client_pair, handshake, init_result};

/// Writer that records every byte written to it.
#[derive(Clone, Default)]
struct RecordingWriter(Arc<Mutex<Vec<u8>>>);

impl RecordingWriter {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ── Gate ─────────────────────────────────────────────────────────────────────

/// Every gated operation fails with `NotInitialized` before the handshake
/// and nothing at all reaches the peer.
#[tokio::test]
async fn gated_operations_write_nothing_before_initialize() {
    let recorder = RecordingWriter::default();
    let (_keep_open, silent) = tokio::io::duplex(1024);
    let client = McpClient::connect(silent, recorder.clone(), &ClientConfig::default()).expect("connect");

    let cancel = CancellationToken::new();
    let results = vec![
        client.ping().await.map(|_| ()),
        client.list_tools(None).await.map(|_| ()),
        client.list_all_tools(&cancel).await.map(|_| ()),
        client.list_resources(None).await.map(|_| ()),
        client.read_resource("file:///tmp/x").await.map(|_| ()),
        client.call_tool("time", None).await.map(|_| ()),
        client.request("custom/method", None, &cancel).await.map(|_| ()),
    ];

    for result in results {
        assert!(matches!(result, Err(AppError::NotInitialized(_))), "got {result:?}");
    }
    assert!(recorder.bytes().is_empty(), "gated calls must not write to the peer");
    assert_eq!(client.gate_state(), GateState::Uninitialized);
}

/// `notifications/initialized` is written exactly once, and only after the
/// initialize response has arrived.
#[tokio::test]
async fn initialized_notification_follows_the_response_exactly_once() {
    let (client, mut peer) = client_pair(&ClientConfig::default());

    let (result, ()) = tokio::join!(client.initialize(), async {
        let req = peer.recv_request().await;
        assert_eq!(req.method, "initialize");
        let params = req.params.clone().expect("initialize params");
        assert_eq!(params["protocolVersion"], "2024-11-05");
        assert_eq!(params["clientInfo"]["name"], "mcpkit");

        assert!(
            peer.try_recv(Duration::from_millis(100)).await.is_none(),
            "nothing may be sent before the initialize response"
        );

        peer.reply(req.id, init_result()).await;
        let note = peer.recv_notification().await;
        assert_eq!(note.method, "notifications/initialized");
    });

    let result = result.expect("initialize");
    assert_eq!(result.server_info.name, "stub");
    assert_eq!(client.gate_state(), GateState::Ready);
    assert_eq!(client.peer().map(|p| p.server_info.name), Some("stub".to_owned()));
    assert!(
        peer.try_recv(Duration::from_millis(100)).await.is_none(),
        "initialized must be sent exactly once"
    );
}

/// A failed initialize leaves the gate closed.
#[tokio::test]
async fn failed_initialize_keeps_gate_closed() {
    let (client, mut peer) = client_pair(&ClientConfig::default());

    let (result, ()) = tokio::join!(client.initialize(), async {
        let req = peer.recv_request().await;
        peer.send(Response::failure(Some(req.id), RpcError::invalid_params("unsupported version")).into())
            .await;
    });

    assert!(matches!(result, Err(AppError::Rpc(ref e)) if e.code == -32602), "got {result:?}");
    assert_eq!(client.gate_state(), GateState::Uninitialized);
    assert!(client.peer().is_none());
    assert!(matches!(client.ping().await, Err(AppError::NotInitialized(_))));
}

/// A malformed initialize result is a protocol error and keeps the gate closed.
#[tokio::test]
async fn malformed_initialize_result_is_protocol_error() {
    let (client, mut peer) = client_pair(&ClientConfig::default());

    let (result, ()) = tokio::join!(client.initialize(), async {
        let req = peer.recv_request().await;
        peer.reply(req.id, json!({ "unexpected": true })).await;
    });

    assert!(matches!(result, Err(AppError::Protocol(_))), "got {result:?}");
    assert_eq!(client.gate_state(), GateState::Uninitialized);
}

// ── Typed operations ─────────────────────────────────────────────────────────

/// Pagination follows cursors and concatenates pages in order.
#[tokio::test]
async fn list_all_tools_follows_cursors() {
    let (client, mut peer) = client_pair(&ClientConfig::default());
    handshake(&client, &mut peer).await;

    let cancel = CancellationToken::new();
    let (tools, ()) = tokio::join!(client.list_all_tools(&cancel), async {
        let first = peer.recv_request().await;
        assert_eq!(first.method, "tools/list");
        assert_eq!(first.params, Some(json!({})));
        peer.reply(
            first.id,
            json!({ "tools": [{ "name": "a", "inputSchema": {} }], "nextCursor": "p2" }),
        )
        .await;

        let second = peer.recv_request().await;
        assert_eq!(second.params, Some(json!({ "cursor": "p2" })));
        peer.reply(second.id, json!({ "tools": [{ "name": "b", "inputSchema": {} }] }))
            .await;
    });

    let names: Vec<_> = tools.expect("list").into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["a", "b"]);
}

/// `tools/call` sends name and arguments and decodes the content.
#[tokio::test]
async fn call_tool_round_trip() {
    let (client, mut peer) = client_pair(&ClientConfig::default());
    handshake(&client, &mut peer).await;

    let (result, ()) = tokio::join!(
        client.call_tool("echo", Some(json!({ "text": "hi" }))),
        async {
            let req = peer.recv_request().await;
            assert_eq!(req.method, "tools/call");
            assert_eq!(req.params, Some(json!({ "name": "echo", "arguments": { "text": "hi" } })));
            peer.reply(req.id, json!({ "content": [{ "type": "text", "text": "hi" }] }))
                .await;
        }
    );

    let result = result.expect("call");
    assert_eq!(result.text(), "hi");
    assert!(!result.is_error());
}

/// `resources/read` returns the content items unchanged.
#[tokio::test]
async fn read_resource_returns_contents() {
    let (client, mut peer) = client_pair(&ClientConfig::default());
    handshake(&client, &mut peer).await;

    let item = json!({ "uri": "file:///etc/motd", "mimeType": "text/plain", "text": "hello" });
    let reply = item.clone();
    let (contents, ()) = tokio::join!(client.read_resource("file:///etc/motd"), async {
        let req = peer.recv_request().await;
        assert_eq!(req.method, "resources/read");
        assert_eq!(req.params, Some(json!({ "uri": "file:///etc/motd" })));
        peer.reply(req.id, json!({ "contents": [reply] })).await;
    });

    assert_eq!(contents.expect("read"), vec![item]);
}

// ── Peer-initiated messages ──────────────────────────────────────────────────

/// The client answers a server-initiated ping, and refuses unknown
/// requests with method-not-found.
#[tokio::test]
async fn client_answers_server_requests() {
    let (_client, mut peer) = client_pair(&ClientConfig::default());

    peer.send(Message::request("srv-1", "ping", None)).await;
    let pong = peer.recv_response().await;
    assert_eq!(pong.id, Some(RequestId::from("srv-1")));
    assert_eq!(pong.outcome, Ok(json!({})));

    peer.send(Message::request(7_i64, "sampling/createMessage", Some(json!({})))).await;
    let refused = peer.recv_response().await;
    assert_eq!(refused.id, Some(RequestId::Number(7)));
    assert_eq!(refused.outcome.map_err(|e| e.code), Err(-32601));
}

/// Closing the client closes the session and is idempotent.
#[tokio::test]
async fn client_close_is_idempotent() {
    let (client, mut peer) = client_pair(&ClientConfig::default());
    handshake(&client, &mut peer).await;

    client.close().await;
    client.close().await;

    assert!(matches!(client.ping().await, Err(AppError::SessionClosed(_))));
    let rest = peer.drain_until_eof().await;
    assert!(rest.iter().any(|m| m.method() == Some("exit")));
}
