//! Conduit RPC - standalone backend and command-line caller.
//!
//! `conduit-rpc` (or `conduit-rpc serve`) hosts the demo operations over the
//! HTTP polling transport or a TCP channel. `conduit-rpc call` issues one
//! call against a running backend and prints the result as JSON.

mod operations;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use conduit_core::transport::polling::start_server;
use conduit_core::{ChannelServer, Dispatcher, RpcClient, RpcValue, Settings};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "conduit-rpc")]
#[command(about = "Conduit RPC backend and caller")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Settings file (JSON); defaults apply to anything it omits
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the operations (the default)
    Serve(ServeArgs),
    /// Call one operation on a running backend
    Call(CallArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct ServeArgs {
    /// Transport to serve
    #[arg(long, value_enum, default_value_t = TransportKind::Polling)]
    transport: TransportKind,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Largest channel message in bytes (channel transport only)
    #[arg(long)]
    max_message_size: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct CallArgs {
    /// Transport the backend serves
    #[arg(long, value_enum, default_value_t = TransportKind::Polling)]
    transport: TransportKind,

    /// Backend address: a base URL for polling, host:port for channel
    #[arg(long)]
    target: String,

    /// Operation name
    operation: String,

    /// Requested interface version
    #[arg(default_value = "1.0")]
    version: String,

    /// Parameters as JSON
    #[arg(long, default_value = "null")]
    params: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    Polling,
    Channel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    let mut settings = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading settings from {}", path.display()))?;
            Settings::from_json(&text)?
        }
        None => Settings::default(),
    };

    match args.command {
        Some(Command::Call(call_args)) => call(call_args, &settings).await,
        Some(Command::Serve(serve_args)) => {
            apply_overrides(&mut settings, &serve_args);
            serve(serve_args, settings).await
        }
        None => {
            apply_overrides(&mut settings, &args.serve);
            serve(args.serve, settings).await
        }
    }
}

fn init_logging(debug: bool, json: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    // Logs go to stderr; stdout carries the RPC_PORT line.
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn apply_overrides(settings: &mut Settings, args: &ServeArgs) {
    if let Some(size) = args.max_message_size {
        settings.max_message_size = Some(size);
    }
}

async fn serve(args: ServeArgs, settings: Settings) -> Result<()> {
    info!("Starting Conduit RPC backend ({:?})", args.transport);

    let operations = operations::registry()?;
    let dispatcher = Arc::new(Dispatcher::with_settings(
        operations,
        settings.dispatcher.clone(),
    ));

    match args.transport {
        TransportKind::Polling => {
            let mut handle = start_server(dispatcher, &args.host, args.port).await?;

            // Print port for the parent process to read (intentional stdout)
            println!("RPC_PORT={}", handle.addr().port());
            info!("Polling backend running on {}", handle.addr());

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
            handle.shutdown();
        }
        TransportKind::Channel => {
            let addr: SocketAddr = format!("{}:{}", args.host, args.port)
                .parse()
                .with_context(|| format!("invalid bind address {}:{}", args.host, args.port))?;
            let mut handle =
                ChannelServer::listen(addr, dispatcher, settings.max_message_size()).await?;

            println!("RPC_PORT={}", handle.port());
            info!(
                "Channel backend running on {} (max message {} bytes)",
                handle.addr(),
                settings.max_message_size()
            );

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
            handle.shutdown();
        }
    }

    Ok(())
}

async fn call(args: CallArgs, settings: &Settings) -> Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("--params must be valid JSON")?;

    let client = match args.transport {
        TransportKind::Polling => RpcClient::over_polling(&args.target, settings)?,
        TransportKind::Channel => {
            let addr: SocketAddr = args
                .target
                .parse()
                .with_context(|| format!("invalid channel address {}", args.target))?;
            RpcClient::connect_channel(addr, settings).await?
        }
    };

    let handle = client
        .submit(&args.operation, &args.version, RpcValue::from_json(params))
        .await?;
    handle.on_pending_update(|update| {
        info!("Progress #{}: {}", update.sequence, update.metadata);
    });

    match handle.await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value.to_json())?);
            Ok(())
        }
        Err(e) => bail!("{} ({:?})", e, e.kind()),
    }
}
