//! delta-tunnel: a WebSocket remote-terminal tunnel.
//!
//! Each terminal connection gets its own PTY-backed child process; a
//! separate `/notes` endpoint keeps a shared text buffer in sync across
//! every connected client.

pub mod admission;
pub mod broker;
pub mod client;
pub mod config;
pub mod errors;
pub mod notes;
pub mod pty;

pub use admission::ConnectionLimiter;
pub use broker::{ConnectionHandler, DispatchTable, TunnelServer};
pub use config::ServerConfig;
pub use errors::{ConfigError, ProtocolError, SpawnError, TransportError};
pub use notes::{NotesHub, NotesMessage, NOTES_PATH};
