//! Interactive client for a tunnel server.
//!
//! Puts the local terminal in raw mode, forwards keystrokes, keeps the
//! remote PTY sized to the local window and prints whatever comes back.

pub mod session;
pub mod terminal;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info};
use url::Url;

pub use session::{drive, ClientExit, SessionIo};

use crate::pty::WindowSize;

pub const DEFAULT_NON_TTY_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub non_tty_wait: Duration,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: "/".to_string(),
            non_tty_wait: DEFAULT_NON_TTY_WAIT,
        }
    }

    /// `ws://host:port/path`. IPv6 literals are bracketed.
    pub fn url(&self) -> Result<Url> {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let mut url = Url::parse(&format!("ws://{}:{}", host, self.port))
            .with_context(|| format!("Invalid server address {}:{}", self.host, self.port))?;
        url.set_path(&self.path);
        Ok(url)
    }
}

/// Connect, run the session, restore the terminal, print the disconnect
/// notice. Connection failures are returned before the terminal is touched.
pub async fn run(options: ClientOptions) -> Result<ClientExit> {
    let url = options.url()?;
    let (ws, _) = match connect_async(url.as_str()).await {
        Ok(conn) => conn,
        Err(WsError::Http(response)) => bail!(
            "Server at {}:{} refused the connection ({})",
            options.host,
            options.port,
            response.status()
        ),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Could not connect to server at {}:{}", options.host, options.port)
            })
        }
    };
    info!(url = %url, "Connected");

    let is_tty = terminal::stdin_is_tty();
    let raw_mode = if is_tty {
        Some(terminal::RawModeGuard::enable().context("Failed to enable raw mode")?)
    } else {
        eprintln!("Warning: stdin is not a terminal; waiting up to {:?} for output.", options.non_tty_wait);
        None
    };

    let io = if is_tty {
        SessionIo {
            input: Some(terminal::spawn_stdin_reader()),
            resize: Some(spawn_resize_watcher()?),
            initial_size: Some(terminal::current_size()),
            non_tty_wait: None,
        }
    } else {
        SessionIo {
            non_tty_wait: Some(options.non_tty_wait),
            ..Default::default()
        }
    };

    let mut stdout = tokio::io::stdout();
    let result = drive(ws, io, stop_requested(), &mut stdout).await;

    drop(raw_mode);
    if let Ok(ClientExit::NonTtyTimeout) = result {
        eprintln!("Non-TTY client timeout after {:?}", options.non_tty_wait);
    }
    eprintln!("\r\n[delta-tunnel] Disconnected.");
    result
}

/// SIGWINCH -> current terminal size.
fn spawn_resize_watcher() -> Result<mpsc::Receiver<WindowSize>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch =
        signal(SignalKind::window_change()).context("Failed to listen for SIGWINCH")?;
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            let size = terminal::current_size();
            debug!(cols = size.cols, rows = size.rows, "Local window changed");
            if tx.send(size).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// Resolves on SIGTERM or SIGHUP. Ctrl+C is passed through to the remote
/// side as a byte while the terminal is raw.
async fn stop_requested() {
    use tokio::signal::unix::{signal, SignalKind};

    let term = signal(SignalKind::terminate());
    let hup = signal(SignalKind::hangup());
    match (term, hup) {
        (Ok(mut term), Ok(mut hup)) => {
            tokio::select! {
                _ = term.recv() => debug!("Received SIGTERM"),
                _ = hup.recv() => debug!("Received SIGHUP"),
            }
        }
        _ => {
            debug!("Stop signals unavailable");
            std::future::pending::<()>().await
        }
    }
}
