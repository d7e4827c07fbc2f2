//! delta-tunnel binary entry point.
//!
//! `serve` runs the tunnel server; `connect` attaches the local terminal to
//! a running server.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use delta_tunnel::client::{self, ClientOptions};
use delta_tunnel::config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
};
use delta_tunnel::pty::{resolve_default_shell, ChildEnv};
use delta_tunnel::{ServerConfig, TunnelServer};

/// Remote terminal tunnel over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "delta-tunnel")]
#[command(about = "WebSocket PTY tunnel with a shared notes channel")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tunnel server
    Serve(ServeArgs),
    /// Attach this terminal to a running server
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "DELTA_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "DELTA_PORT", default_value_t = 8765)]
    port: u32,

    /// Maximum concurrent terminal sessions
    #[arg(long, env = "DELTA_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Idle timeout for a terminal session in seconds (0 disables)
    #[arg(long, env = "DELTA_CONNECTION_TIMEOUT", default_value_t = DEFAULT_CONNECTION_TIMEOUT_SECS, allow_negative_numbers = true)]
    connection_timeout: i64,

    /// PTY read chunk size in bytes
    #[arg(long, env = "DELTA_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Seconds a session's child gets between SIGTERM and SIGKILL
    #[arg(long, default_value_t = 3)]
    terminate_grace: u64,

    /// Folder with the new side of the data, forwarded to children
    #[arg(long, env = "DELTA_NEW")]
    new_folder: Option<String>,

    /// Folder with the old side of the data, forwarded to children
    #[arg(long, env = "DELTA_OLD")]
    old_folder: Option<String>,

    /// Keywords file, forwarded to children
    #[arg(long, env = "DELTA_KEYWORDS")]
    keywords: Option<String>,

    /// Program to run for every connection (defaults to the user's shell)
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Server host
    #[arg(long, env = "DELTA_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, env = "DELTA_PORT", default_value_t = 8765)]
    port: u16,

    /// Endpoint path
    #[arg(long, default_value = "/")]
    path: String,

    /// Seconds to stay connected when stdin is not a terminal
    #[arg(long, default_value_t = 30)]
    non_tty_wait: u64,
}

fn init_tracing(verbose: bool, default_level: Level) {
    let filter = if verbose {
        EnvFilter::default().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(default_level.into()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig::builder()
        .bind_address(args.host)
        .port(args.port)
        .max_connections(args.max_connections)
        .connection_timeout_secs(args.connection_timeout)
        .buffer_size(args.buffer_size)
        .terminate_grace(Duration::from_secs(args.terminate_grace))
        .build()
        .context("Invalid server configuration")?;

    let argv = if args.command.is_empty() {
        vec![resolve_default_shell()]
    } else {
        args.command
    };

    let env = ChildEnv::new()
        .passthrough("DELTA_NEW", args.new_folder)
        .passthrough("DELTA_OLD", args.old_folder)
        .passthrough("DELTA_KEYWORDS", args.keywords);

    info!(
        command = ?argv,
        max_connections = config.max_connections(),
        connection_timeout = ?config.connection_timeout(),
        buffer_size = config.buffer_size(),
        "Starting delta-tunnel server"
    );

    let server = TunnelServer::bind(config, argv, env).await?;
    info!(notes_url = %server.notes_url(), "Notes endpoint ready");
    server.run().await
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let options = ClientOptions {
        host: args.host,
        port: args.port,
        path: args.path,
        non_tty_wait: Duration::from_secs(args.non_tty_wait),
    };
    let exit = client::run(options).await?;
    tracing::debug!(?exit, "Client finished");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = match cli.command {
        Command::Serve(_) => Level::INFO,
        // Log lines would land in the middle of the remote screen.
        Command::Connect(_) => Level::WARN,
    };
    init_tracing(cli.verbose, default_level);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let result = match cli.command {
        Command::Serve(args) => runtime.block_on(serve(args)),
        Command::Connect(args) => runtime.block_on(connect(args)),
    };

    // Blocked PTY or stdin readers must not hold the process open.
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}
