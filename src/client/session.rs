//! The client's socket loop.
//!
//! Local input, resize notifications, inbound frames, an external stop and
//! the no-terminal deadline all race in one `select!`. The first of them to
//! finish ends the session; the socket is then closed.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::pty::{WindowSize, EOF_MARKER};

/// Why the session loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// Ctrl+D or end of local input; the EOF marker was sent.
    LocalEof,
    RemoteClosed,
    /// SIGTERM / SIGHUP.
    Stopped,
    /// No terminal attached and the bounded wait elapsed.
    NonTtyTimeout,
}

/// Local sources feeding the socket. `None` disables a source.
#[derive(Default)]
pub struct SessionIo {
    pub input: Option<mpsc::Receiver<Vec<u8>>>,
    pub resize: Option<mpsc::Receiver<WindowSize>>,
    pub initial_size: Option<WindowSize>,
    pub non_tty_wait: Option<Duration>,
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Run one client session over `ws` until the first duty finishes.
pub async fn drive<S, W, F>(mut ws: S, mut io: SessionIo, stop: F, output: &mut W) -> Result<ClientExit>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    if let Some(size) = io.initial_size {
        ws.send(Message::Text(size.to_sentinel()))
            .await
            .context("Failed to send initial window size")?;
    }

    let non_tty_wait = io.non_tty_wait;
    let deadline = async move {
        match non_tty_wait {
            Some(wait) => tokio::time::sleep(wait).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    tokio::pin!(stop);

    let exit = loop {
        tokio::select! {
            chunk = recv_or_pending(&mut io.input) => {
                let Some(data) = chunk else {
                    ws.send(Message::Binary(vec![EOF_MARKER])).await.ok();
                    break ClientExit::LocalEof;
                };
                match data.iter().position(|b| *b == EOF_MARKER) {
                    Some(at) => {
                        if at > 0 {
                            ws.send(Message::Binary(data[..at].to_vec())).await.ok();
                        }
                        ws.send(Message::Binary(vec![EOF_MARKER])).await.ok();
                        break ClientExit::LocalEof;
                    }
                    None => {
                        if ws.send(Message::Binary(data)).await.is_err() {
                            break ClientExit::RemoteClosed;
                        }
                    }
                }
            }
            size = recv_or_pending(&mut io.resize) => match size {
                Some(size) => {
                    if ws.send(Message::Text(size.to_sentinel())).await.is_err() {
                        break ClientExit::RemoteClosed;
                    }
                }
                None => io.resize = None,
            },
            msg = ws.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    output.write_all(&data).await.context("Failed to write output")?;
                    output.flush().await.ok();
                }
                Some(Ok(Message::Text(text))) => {
                    output.write_all(text.as_bytes()).await.context("Failed to write output")?;
                    output.flush().await.ok();
                }
                Some(Ok(Message::Close(_))) | None => break ClientExit::RemoteClosed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Socket error");
                    break ClientExit::RemoteClosed;
                }
            },
            _ = &mut stop => break ClientExit::Stopped,
            _ = &mut deadline => break ClientExit::NonTtyTimeout,
        }
    };

    if let Err(e) = ws.close().await {
        debug!(error = %e, "Socket close failed");
    }
    Ok(exit)
}
