//! MCP client API.
//!
//! [`McpClient`] wraps a [`Session`] with the handshake gate and typed
//! wrappers for the standard client operations. Every operation except
//! [`McpClient::initialize`] is refused until the handshake has completed.

pub mod gate;
pub mod paginate;
pub mod schema;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::process::PeerCommand;
use crate::session::{MethodRouter, Session, SessionOptions};
use crate::wire::RpcError;
use crate::{AppError, Result};

pub use gate::{Gate, GateState};
pub use paginate::{fetch_all, Page};
use schema::{
    methods, CallToolParams, CallToolResult, ClientCapabilities, Implementation,
    InitializeParams, InitializeResult, ListResourcesResult, ListToolsResult, PaginatedParams,
    ReadResourceParams, ReadResourceResult, Resource, Tool,
};

/// Router for requests the server may send to a client.
fn client_router() -> MethodRouter {
    MethodRouter::new().route(methods::PING, |_| async { Ok::<_, RpcError>(json!({})) })
}

/// Client side of one MCP connection.
#[derive(Debug)]
pub struct McpClient {
    session: Session,
    gate: Gate,
    client_info: Implementation,
    protocol_version: String,
    capabilities: ClientCapabilities,
}

impl McpClient {
    /// Spawn `command` and connect to it over stdio.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`] if the peer cannot be launched.
    /// - [`AppError::Config`] if an alert pattern does not compile.
    pub fn spawn(command: &PeerCommand, config: &ClientConfig) -> Result<Self> {
        let options = Self::options(config)?;
        let session = Session::spawn(command, options)?;
        Ok(Self::from_session(session, config))
    }

    /// Connect over an already-open byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if an alert pattern does not compile.
    pub fn connect<R, W>(reader: R, writer: W, config: &ClientConfig) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let options = Self::options(config)?;
        Ok(Self::from_session(
            Session::connect(reader, writer, options),
            config,
        ))
    }

    /// Wrap an existing session. The session should route `ping` itself if
    /// server-initiated pings are expected.
    #[must_use]
    pub fn from_session(session: Session, config: &ClientConfig) -> Self {
        Self {
            session,
            gate: Gate::new(),
            client_info: config.client_info(),
            protocol_version: config.client.protocol_version.clone(),
            capabilities: ClientCapabilities::default(),
        }
    }

    /// Replace the capabilities advertised in `initialize`.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn options(config: &ClientConfig) -> Result<SessionOptions> {
        Ok(config
            .session_options()?
            .with_handler(Arc::new(client_router())))
    }

    // ── Handshake ────────────────────────────────────────────────────────────

    /// Perform the `initialize` exchange, then send
    /// `notifications/initialized`.
    ///
    /// The gate opens before the notification is written, so a failure to
    /// write it is returned while the gate stays open. A failed request
    /// leaves the gate closed.
    ///
    /// # Errors
    ///
    /// - Any [`Session::call`] error for the `initialize` request.
    /// - [`AppError::Protocol`] if the result has the wrong shape.
    /// - Any [`Session::notify`] error for the notification.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        self.gate.begin();

        let params = InitializeParams {
            protocol_version: self.protocol_version.clone(),
            capabilities: self.capabilities.clone(),
            client_info: self.client_info.clone(),
        };

        let result = match self.handshake(&params).await {
            Ok(result) => result,
            Err(err) => {
                self.gate.fail();
                warn!(peer = %self.session.label(), %err, "initialize failed");
                return Err(err);
            }
        };

        if result.protocol_version != self.protocol_version {
            warn!(
                peer = %self.session.label(),
                requested = %self.protocol_version,
                negotiated = %result.protocol_version,
                "server chose a different protocol version"
            );
        }
        info!(
            peer = %self.session.label(),
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "peer initialized"
        );
        if let Some(instructions) = &result.instructions {
            debug!(peer = %self.session.label(), instructions = %instructions, "server instructions");
        }

        self.gate.complete(result.clone());
        self.session.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    async fn handshake(&self, params: &InitializeParams) -> Result<InitializeResult> {
        let value = self
            .session
            .call(methods::INITIALIZE, Some(to_params(params)?))
            .await?;
        decode(methods::INITIALIZE, value)
    }

    // ── Gated operations ─────────────────────────────────────────────────────

    /// Gated raw call. Every typed wrapper goes through here.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotInitialized`] before the handshake; nothing is
    ///   written in that case.
    /// - Any [`Session::call_with_cancel`] error.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.gate.ensure_ready(method)?;
        self.session.call_with_cancel(method, params, cancel).await
    }

    async fn gated<P, T>(&self, method: &str, params: &P) -> Result<T>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        self.gate.ensure_ready(method)?;
        let params = to_params(params)?;
        let value = self.session.call(method, Some(params)).await?;
        decode(method, value)
    }

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// As [`request`](Self::request).
    pub async fn ping(&self) -> Result<()> {
        self.request(methods::PING, None, &CancellationToken::new())
            .await
            .map(|_| ())
    }

    /// Fetch one page of tools.
    ///
    /// # Errors
    ///
    /// As [`request`](Self::request), plus [`AppError::Protocol`] for a
    /// malformed result.
    pub async fn list_tools(&self, cursor: Option<String>) -> Result<Page<Tool>> {
        let params = PaginatedParams { cursor };
        let result: ListToolsResult = self.gated(methods::TOOLS_LIST, &params).await?;
        Ok(Page {
            items: result.tools,
            next_cursor: result.next_cursor,
        })
    }

    /// Fetch every page of tools.
    ///
    /// # Errors
    ///
    /// As [`list_tools`](Self::list_tools), plus [`AppError::Cancelled`]
    /// when `cancel` fires between pages.
    pub async fn list_all_tools(&self, cancel: &CancellationToken) -> Result<Vec<Tool>> {
        fetch_all(cancel, |cursor| self.list_tools(cursor)).await
    }

    /// Fetch one page of resources.
    ///
    /// # Errors
    ///
    /// As [`list_tools`](Self::list_tools).
    pub async fn list_resources(&self, cursor: Option<String>) -> Result<Page<Resource>> {
        let params = PaginatedParams { cursor };
        let result: ListResourcesResult =
            self.gated(methods::RESOURCES_LIST, &params).await?;
        Ok(Page {
            items: result.resources,
            next_cursor: result.next_cursor,
        })
    }

    /// Fetch every page of resources.
    ///
    /// # Errors
    ///
    /// As [`list_all_tools`](Self::list_all_tools).
    pub async fn list_all_resources(&self, cancel: &CancellationToken) -> Result<Vec<Resource>> {
        fetch_all(cancel, |cursor| self.list_resources(cursor)).await
    }

    /// Read a resource's content items.
    ///
    /// # Errors
    ///
    /// As [`list_tools`](Self::list_tools).
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<Value>> {
        let params = ReadResourceParams {
            uri: uri.to_owned(),
        };
        let result: ReadResourceResult = self.gated(methods::RESOURCES_READ, &params).await?;
        Ok(result.contents)
    }

    /// Invoke a tool.
    ///
    /// A tool-level failure comes back as `Ok` with
    /// [`CallToolResult::is_error`] set; only protocol failures are `Err`.
    ///
    /// # Errors
    ///
    /// As [`list_tools`](Self::list_tools).
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_owned(),
            arguments,
        };
        self.gated(methods::TOOLS_CALL, &params).await
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Close the underlying session. Idempotent.
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Server identity and capabilities from the last successful handshake.
    #[must_use]
    pub fn peer(&self) -> Option<InitializeResult> {
        self.gate.peer()
    }

    /// Current handshake state.
    #[must_use]
    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }
}

fn to_params<P: Serialize>(params: &P) -> Result<Value> {
    serde_json::to_value(params)
        .map_err(|err| AppError::Protocol(format!("failed to encode params: {err}")))
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| AppError::Protocol(format!("unexpected {method} result: {err}")))
}
