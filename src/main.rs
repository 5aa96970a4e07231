#![forbid(unsafe_code)]

//! `mcpkit`: drive an MCP tool server over stdio from the command line.
//!
//! Spawns the server, performs the handshake, runs one operation, prints
//! the JSON result on stdout, and closes the session. Logs go to stderr.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mcpkit::cli::{init_tracing, shutdown_signal, LogFormat};
use mcpkit::process::PeerCommand;
use mcpkit::{AppError, ClientConfig, McpClient, Result};

#[derive(Debug, Parser)]
#[command(name = "mcpkit", about = "Drive an MCP tool server over stdio", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    operation: Operation,
}

/// Server command line given after `--`.
#[derive(Debug, Args)]
struct ServerArgs {
    /// Server program and arguments; overrides `[server]` in the config.
    #[arg(last = true)]
    server: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Operation {
    /// Send a liveness probe.
    Ping {
        #[command(flatten)]
        peer: ServerArgs,
    },
    /// List every tool.
    Tools {
        #[command(flatten)]
        peer: ServerArgs,
    },
    /// List every resource.
    Resources {
        #[command(flatten)]
        peer: ServerArgs,
    },
    /// Read one resource.
    Read {
        /// Resource URI.
        uri: String,
        #[command(flatten)]
        peer: ServerArgs,
    },
    /// Invoke a tool.
    Call {
        /// Tool name.
        name: String,
        /// Tool arguments as a JSON object.
        #[arg(long)]
        arguments: Option<String>,
        #[command(flatten)]
        peer: ServerArgs,
    },
}

impl Operation {
    fn server_args(&self) -> &[String] {
        match self {
            Self::Ping { peer }
            | Self::Tools { peer }
            | Self::Resources { peer }
            | Self::Read { peer, .. }
            | Self::Call { peer, .. } => &peer.server,
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = match &args.config {
        Some(path) => ClientConfig::load_from_path(path)?,
        None => ClientConfig::default(),
    };
    let command = resolve_command(args.operation.server_args(), &config)?;
    info!(command = %command.command, args = ?command.args, "starting server");

    let client = McpClient::spawn(&command, &config)?;
    let cancel = CancellationToken::new();

    let outcome = tokio::select! {
        outcome = execute(&client, &args.operation, &cancel) => outcome,
        signal = shutdown_signal() => {
            warn!(signal, "interrupted, closing session");
            cancel.cancel();
            Err(AppError::Cancelled("interrupted".into()))
        }
    };

    client.close().await;

    let value = outcome?;
    let rendered = serde_json::to_string_pretty(&value)
        .map_err(|err| AppError::Protocol(format!("failed to render result: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn resolve_command(trailing: &[String], config: &ClientConfig) -> Result<PeerCommand> {
    if let Some((program, rest)) = trailing.split_first() {
        return Ok(PeerCommand::new(program.clone()).args(rest.iter().cloned()));
    }

    config.server.clone().ok_or_else(|| {
        AppError::Config("no server command: pass one after `--` or set [server] in the config".into())
    })
}

async fn execute(
    client: &McpClient,
    operation: &Operation,
    cancel: &CancellationToken,
) -> Result<Value> {
    client.initialize().await?;

    match operation {
        Operation::Ping { .. } => {
            client.ping().await?;
            Ok(serde_json::json!({}))
        }
        Operation::Tools { .. } => to_json(&client.list_all_tools(cancel).await?),
        Operation::Resources { .. } => to_json(&client.list_all_resources(cancel).await?),
        Operation::Read { uri, .. } => Ok(Value::Array(client.read_resource(uri).await?)),
        Operation::Call {
            name, arguments, ..
        } => {
            let arguments = arguments
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .map_err(|err| AppError::Config(format!("--arguments is not valid JSON: {err}")))?;
            let result = client.call_tool(name, arguments).await?;
            if result.is_error() {
                warn!(tool = %name, "tool reported an error");
            }
            to_json(&result)
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| AppError::Protocol(format!("failed to render result: {err}")))
}
