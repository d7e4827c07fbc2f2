//! One terminal session: a PTY-backed child bridged onto a WebSocket.
//!
//! Two pumps run as independent tasks:
//! - PTY -> socket: a blocking reader thread feeds a channel, the pump
//!   forwards each chunk as a binary frame and interleaves keepalive pings.
//! - socket -> PTY: inbound frames are classified; input goes to a
//!   dedicated writer thread, resize sentinels resize the PTY.
//!
//! The first pump to finish cancels the other. Teardown then runs exactly
//! once: close the socket, drop the PTY master, terminate the child.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use portable_pty::{MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::control::{classify, Inbound, WindowSize};
use super::supervisor::{ProcessSupervisor, SpawnSpec, SupervisedChild, Termination};
use crate::errors::{SpawnError, TransportError};

const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_INPUT_CHANNEL_SIZE: usize = 1024;
const PTY_OUTPUT_CHANNEL_SIZE: usize = 64;

type WsSink = SplitSink<WebSocket, Message>;

/// Lifecycle of a session. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Connecting,
    Active,
    Teardown,
    Closed,
}

/// Why a pump stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    PtyEof,
    PeerClosed,
}

/// Per-session knobs taken from the server configuration.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub keepalive_interval: Duration,
    pub terminate_grace: Duration,
}

/// Owns a session's PTY master and child for the session's lifetime.
pub struct Session {
    id: String,
    peer: SocketAddr,
    child: Arc<SupervisedChild>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    phase: Mutex<SessionPhase>,
    supervisor: ProcessSupervisor,
}

impl Session {
    pub fn pid(&self) -> u32 {
        self.child.pid()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    fn advance(&self, next: SessionPhase) -> bool {
        let mut phase = self.phase.lock();
        if *phase >= next {
            return false;
        }
        *phase = next;
        true
    }

    /// Apply a window size: TIOCSWINSZ on the master, then SIGWINCH to the
    /// child's process group.
    pub fn resize(&self, size: WindowSize) {
        let master = self.master.lock();
        let Some(master) = master.as_ref() else {
            return;
        };
        if let Err(e) = master.resize(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            warn!(session = %self.id, error = %e, "Failed to resize PTY");
            return;
        }
        if let Err(e) = self.child.signal_group(Signal::SIGWINCH) {
            debug!(session = %self.id, error = %e, "Failed to deliver SIGWINCH");
        }
        debug!(session = %self.id, cols = size.cols, rows = size.rows, "PTY resized");
    }

    pub fn window_size(&self) -> Option<WindowSize> {
        let master = self.master.lock();
        let size = master.as_ref()?.get_size().ok()?;
        Some(WindowSize::new(size.cols, size.rows))
    }

    /// Close the PTY master and terminate the child. Runs once; later calls
    /// are no-ops and return `None`.
    pub async fn teardown(&self, grace: Duration) -> Option<Termination> {
        if !self.advance(SessionPhase::Teardown) {
            return None;
        }
        drop(self.master.lock().take());
        let outcome = self.supervisor.terminate(&self.child, grace).await;
        self.advance(SessionPhase::Closed);
        Some(outcome)
    }
}

/// Spawns children and runs sessions over accepted sockets.
#[derive(Clone)]
pub struct PtyBridge {
    supervisor: ProcessSupervisor,
    spec: Arc<SpawnSpec>,
    settings: BridgeSettings,
}

impl PtyBridge {
    pub fn new(supervisor: ProcessSupervisor, spec: SpawnSpec, settings: BridgeSettings) -> Self {
        Self {
            supervisor,
            spec: Arc::new(spec),
            settings,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    fn open(&self, id: &str, peer: SocketAddr) -> Result<(Arc<Session>, PtyIo), SpawnError> {
        let spawned = self.supervisor.spawn(&self.spec, WindowSize::default())?;
        let session = Arc::new(Session {
            id: id.to_string(),
            peer,
            child: spawned.child,
            master: Mutex::new(None),
            phase: Mutex::new(SessionPhase::Connecting),
            supervisor: self.supervisor.clone(),
        });

        let handles = spawned
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, spawned.master.take_writer()?)));
        *session.master.lock() = Some(spawned.master);

        match handles {
            Ok((reader, writer)) => Ok((session, PtyIo { reader, writer })),
            Err(e) => {
                let grace = self.settings.terminate_grace;
                tokio::spawn(async move {
                    session.teardown(grace).await;
                });
                Err(SpawnError::Handle(e))
            }
        }
    }

    /// Run one terminal session to completion over `socket`.
    pub async fn run(&self, socket: WebSocket, id: &str, peer: SocketAddr) {
        let (session, io) = match self.open(id, peer) {
            Ok(opened) => opened,
            Err(e) => {
                error!(session = id, peer = %peer, error = %e, "Failed to start session");
                let mut socket = socket;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };
        session.advance(SessionPhase::Active);
        info!(
            session = id,
            peer = %peer,
            pid = session.pid(),
            pgid = session.child.pgid(),
            "Session active"
        );

        let input_tx = spawn_pty_writer_thread(id.to_string(), io.writer);
        let output_rx = spawn_pty_reader(id.to_string(), io.reader, self.settings.buffer_size);

        let (sink, stream) = socket.split();
        // Shared with the output pump; the close frame below is sent after
        // that pump has been aborted.
        let sink = Arc::new(tokio::sync::Mutex::new(sink));

        let mut pumps = JoinSet::new();
        pumps.spawn(pty_to_socket(
            output_rx,
            Arc::clone(&sink),
            self.settings.keepalive_interval,
        ));
        pumps.spawn(socket_to_pty(
            stream,
            input_tx,
            Arc::clone(&session),
            self.settings.idle_timeout,
        ));

        let first = pumps.join_next().await;
        pumps.abort_all();
        while pumps.join_next().await.is_some() {}

        match first {
            Some(Ok(Ok(end))) => debug!(session = id, ?end, "Pump finished"),
            Some(Ok(Err(e))) => debug!(session = id, error = %e, "Pump ended with transport error"),
            Some(Err(e)) => warn!(session = id, error = %e, "Pump task failed"),
            None => {}
        }

        let _ = sink.lock().await.send(Message::Close(None)).await;
        if let Some(outcome) = session.teardown(self.settings.terminate_grace).await {
            info!(
                session = id,
                peer = %session.peer,
                pid = session.pid(),
                ?outcome,
                "Session closed"
            );
        }
    }
}

struct PtyIo {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

async fn pty_to_socket(
    mut output_rx: mpsc::Receiver<Result<Vec<u8>, std::io::Error>>,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    keepalive: Duration,
) -> Result<PumpEnd, TransportError> {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
    loop {
        tokio::select! {
            chunk = output_rx.recv() => match chunk {
                Some(Ok(data)) => sink.lock().await.send(Message::Binary(data)).await?,
                Some(Err(e)) => return Err(TransportError::PtyRead(e)),
                None => return Ok(PumpEnd::PtyEof),
            },
            _ = ping.tick() => sink.lock().await.send(Message::Ping(Vec::new())).await?,
        }
    }
}

async fn socket_to_pty(
    mut stream: SplitStream<WebSocket>,
    input_tx: mpsc::Sender<Vec<u8>>,
    session: Arc<Session>,
    idle_timeout: Option<Duration>,
) -> Result<PumpEnd, TransportError> {
    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => return Err(TransportError::IdleTimeout(limit)),
            },
            None => stream.next().await,
        };
        let msg = match next {
            Some(msg) => msg?,
            None => return Ok(PumpEnd::PeerClosed),
        };

        match classify(msg) {
            Inbound::Input(data) => {
                if data.is_empty() {
                    continue;
                }
                input_tx
                    .send(data)
                    .await
                    .map_err(|_| TransportError::PtyWriterClosed)?;
            }
            Inbound::Resize(size) => session.resize(size),
            Inbound::BadControl(e) => {
                warn!(session = %session.id, error = %e, "Ignoring bad control frame")
            }
            Inbound::Keepalive => {}
            Inbound::Close => return Ok(PumpEnd::PeerClosed),
        }
    }
}

/// Blocking PTY reads on a worker thread, delivered through a channel.
/// The worker exits on EOF, on a read error, or once the receiver is gone.
fn spawn_pty_reader(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    buffer_size: usize,
) -> mpsc::Receiver<Result<Vec<u8>, std::io::Error>> {
    let (tx, rx) = mpsc::channel(PTY_OUTPUT_CHANNEL_SIZE);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; buffer_size];
        let mut total_bytes_read: usize = 0;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total_bytes_read += n;
                    if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO is how Linux reports that the slave side is gone.
                Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => break,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
        debug!(session = %session_id, total_bytes_read, "PTY reader finished");
    });
    rx
}

/// Dedicated thread for PTY writes so a full PTY never blocks the event loop.
fn spawn_pty_writer_thread(
    session_id: String,
    mut writer: Box<dyn Write + Send>,
) -> mpsc::Sender<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PTY_INPUT_CHANNEL_SIZE);
    std::thread::spawn(move || {
        let mut total_bytes_written: usize = 0;
        while let Some(data) = rx.blocking_recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|_| writer.flush()) {
                    debug!(
                        session = %session_id,
                        error = %e,
                        errno = ?e.raw_os_error(),
                        "PTY write failed"
                    );
                    return;
                }
            }
            total_bytes_written += data.len();
        }
        debug!(session = %session_id, total_bytes_written, "PTY writer finished");
    });
    tx
}
