//! Method names and error codes are part of the protocol; they must not
//! drift.

use serde_json::json;

use mcpkit::client::schema::{methods, CallToolResult, ListToolsResult, LATEST_PROTOCOL_VERSION};
use mcpkit::wire::message::error_codes;

#[test]
fn method_names_are_stable() {
    assert_eq!(methods::INITIALIZE, "initialize");
    assert_eq!(methods::INITIALIZED, "notifications/initialized");
    assert_eq!(methods::PING, "ping");
    assert_eq!(methods::TOOLS_LIST, "tools/list");
    assert_eq!(methods::TOOLS_CALL, "tools/call");
    assert_eq!(methods::RESOURCES_LIST, "resources/list");
    assert_eq!(methods::RESOURCES_READ, "resources/read");
    assert_eq!(methods::EXIT, "exit");
}

#[test]
fn protocol_revision_is_pinned() {
    assert_eq!(LATEST_PROTOCOL_VERSION, "2024-11-05");
}

#[test]
fn standard_error_codes() {
    assert_eq!(error_codes::PARSE_ERROR, -32700);
    assert_eq!(error_codes::INVALID_REQUEST, -32600);
    assert_eq!(error_codes::METHOD_NOT_FOUND, -32601);
    assert_eq!(error_codes::INVALID_PARAMS, -32602);
    assert_eq!(error_codes::INTERNAL_ERROR, -32603);
}

/// `tools/list` results use `inputSchema` and `nextCursor`.
#[test]
fn tool_listing_field_names() {
    let page: ListToolsResult = serde_json::from_value(json!({
        "tools": [{
            "name": "echo",
            "description": "Echo text back",
            "inputSchema": { "type": "object" }
        }],
        "nextCursor": "2"
    }))
    .expect("decode");

    assert_eq!(page.tools[0].name, "echo");
    assert_eq!(page.tools[0].input_schema, json!({ "type": "object" }));
    assert_eq!(page.next_cursor.as_deref(), Some("2"));
}

/// `tools/call` results use `content` and `isError`.
#[test]
fn tool_result_field_names() {
    let value = serde_json::to_value(CallToolResult::error_content("boom")).expect("encode");
    assert_eq!(
        value,
        json!({ "content": [{ "type": "text", "text": "boom" }], "isError": true })
    );
}
