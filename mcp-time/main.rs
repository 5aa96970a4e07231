#![forbid(unsafe_code)]

//! `mcp-time`: minimal MCP tool server on stdio.
//!
//! Serves three tools: `time` (current UTC time), `echo` and `sleep`.
//! `tools/list` returns one tool per page. Exits when stdin closes, on an
//! `exit` notification, or on SIGINT/SIGTERM. Logs go to stderr.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mcpkit::cli::{cancel_on_signal, init_tracing, LogFormat};
use mcpkit::client::schema::{
    methods, CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsResult, PaginatedParams, ServerCapabilities, Tool, LATEST_PROTOCOL_VERSION,
};
use mcpkit::server::serve_stdio;
use mcpkit::session::MethodRouter;
use mcpkit::wire::RpcError;
use mcpkit::{AppError, Result};

/// How long the runtime waits for blocked stdin reads at exit.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(name = "mcp-time", about = "MCP time server on stdio", version, long_about = None)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;
    runtime.block_on(run());
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    Ok(())
}

async fn run() {
    let cancel = CancellationToken::new();

    let _signals = cancel_on_signal(cancel.clone());

    info!(version = env!("CARGO_PKG_VERSION"), "mcp-time serving on stdio");
    serve_stdio(router(cancel.clone()), &cancel).await;
    info!("mcp-time stopped");
}

fn router(cancel: CancellationToken) -> MethodRouter {
    MethodRouter::new()
        .route(methods::INITIALIZE, |params| async move { initialize(params) })
        .route(methods::PING, |_| async { Ok::<_, RpcError>(json!({})) })
        .route(methods::TOOLS_LIST, |params| async move { list_tools(params) })
        .route(methods::TOOLS_CALL, call_tool)
        .on_notification(methods::INITIALIZED, |_| async {
            debug!("client finished initialization");
        })
        .on_notification(methods::EXIT, move |_| {
            let cancel = cancel.clone();
            async move {
                info!("exit notification received");
                cancel.cancel();
            }
        })
}

// ── Handlers ─────────────────────────────────────────────────────────────────

fn initialize(params: Option<Value>) -> std::result::Result<Value, RpcError> {
    let params: InitializeParams = require_params(params)?;
    info!(
        client = %params.client_info.name,
        client_version = %params.client_info.version,
        protocol = %params.protocol_version,
        "initialize"
    );
    if params.protocol_version != LATEST_PROTOCOL_VERSION {
        warn!(requested = %params.protocol_version, "answering with the supported protocol version");
    }

    to_result(&InitializeResult {
        protocol_version: LATEST_PROTOCOL_VERSION.to_owned(),
        capabilities: ServerCapabilities {
            tools: Some(json!({ "listChanged": false })),
            ..ServerCapabilities::default()
        },
        server_info: Implementation {
            name: "time".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        },
        instructions: None,
    })
}

fn catalog() -> Vec<Tool> {
    vec![
        Tool {
            name: "time".to_owned(),
            description: Some("Current UTC time in RFC 3339 format".to_owned()),
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        Tool {
            name: "echo".to_owned(),
            description: Some("Return the given text unchanged".to_owned()),
            input_schema: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        },
        Tool {
            name: "sleep".to_owned(),
            description: Some("Wait the given number of milliseconds, then answer".to_owned()),
            input_schema: json!({
                "type": "object",
                "properties": { "ms": { "type": "integer", "minimum": 0 } },
                "required": ["ms"]
            }),
        },
    ]
}

fn list_tools(params: Option<Value>) -> std::result::Result<Value, RpcError> {
    let params: PaginatedParams = match params {
        Some(value) => parse_params(value)?,
        None => PaginatedParams::default(),
    };

    let tools = catalog();
    let index = match params.cursor {
        None => 0,
        Some(cursor) => cursor
            .parse::<usize>()
            .ok()
            .filter(|i| *i < tools.len())
            .ok_or_else(|| RpcError::invalid_params(format!("unknown cursor: {cursor}")))?,
    };
    let next = index + 1;
    let next_cursor = (next < tools.len()).then(|| next.to_string());

    to_result(&ListToolsResult {
        tools: tools.into_iter().skip(index).take(1).collect(),
        next_cursor,
    })
}

async fn call_tool(params: Option<Value>) -> std::result::Result<Value, RpcError> {
    let call: CallToolParams = require_params(params)?;
    let arguments = call.arguments.unwrap_or_else(|| json!({}));
    debug!(tool = %call.name, "tools/call");

    let result = match call.name.as_str() {
        "time" => CallToolResult::text_content(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        "echo" => {
            let Some(text) = arguments.get("text").and_then(Value::as_str) else {
                return Err(RpcError::invalid_params("echo requires a string `text` argument"));
            };
            CallToolResult::text_content(text)
        }
        "sleep" => {
            let Some(ms) = arguments.get("ms").and_then(Value::as_u64) else {
                return Err(RpcError::invalid_params("sleep requires an integer `ms` argument"));
            };
            tokio::time::sleep(Duration::from_millis(ms)).await;
            CallToolResult::text_content(format!("slept {ms}ms"))
        }
        other => CallToolResult::error_content(format!("unknown tool: {other}")),
    };

    to_result(&result)
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn require_params<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, RpcError> {
    params
        .ok_or_else(|| RpcError::invalid_params("missing params"))
        .and_then(parse_params)
}

fn parse_params<T: DeserializeOwned>(value: Value) -> std::result::Result<T, RpcError> {
    serde_json::from_value(value).map_err(|err| RpcError::invalid_params(err.to_string()))
}

fn to_result<T: Serialize>(value: &T) -> std::result::Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|err| RpcError::internal_error(err.to_string()))
}
