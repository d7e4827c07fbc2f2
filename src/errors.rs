//! Error kinds, one enum per boundary.
//!
//! Admission refusal is deliberately absent: the limiter answers `false`
//! and the broker turns that into a 503 without treating it as a fault.

use std::io;

use thiserror::Error;

/// Invalid server configuration. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bind_address cannot be empty")]
    EmptyBindAddress,

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u32),

    #[error("max_connections must be at least 1, got {0}")]
    InvalidMaxConnections(usize),

    #[error("connection_timeout cannot be negative, got {0}")]
    NegativeTimeout(i64),

    #[error("buffer_size must be between 1 and {max}, got {got}")]
    InvalidBufferSize { got: usize, max: usize },

    #[error("authentication is not supported by this server")]
    AuthUnsupported,
}

/// PTY allocation or child spawn failed. Aborts one session only.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("child argv is empty")]
    EmptyCommand,

    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to clone PTY handle: {0}")]
    Handle(#[source] anyhow::Error),

    #[error("spawned child reported no process id")]
    MissingPid,
}

/// A socket or PTY stopped working. Ends the session through teardown.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("PTY read failed: {0}")]
    PtyRead(#[source] io::Error),

    #[error("PTY writer closed")]
    PtyWriterClosed,

    #[error("no traffic from peer for {0:?}")]
    IdleTimeout(std::time::Duration),
}

/// One bad message. Ignored; the connection continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed resize sentinel: {0:?}")]
    MalformedResize(String),

    #[error("resize dimensions must be positive, got {cols}x{rows}")]
    ZeroDimension { cols: u16, rows: u16 },

    #[error("unparseable notes message: {0}")]
    MalformedNotes(String),
}
