//! PTY-backed child processes and the socket bridge that drives them.

pub mod bridge;
pub mod control;
pub mod env;
pub mod supervisor;

pub use bridge::{BridgeSettings, PtyBridge, Session, SessionPhase};
pub use control::{parse_resize, WindowSize, EOF_MARKER, RESIZE_PREFIX};
pub use env::ChildEnv;
pub use supervisor::{
    process_exists, resolve_default_shell, ChildRegistry, ProcessSupervisor, SpawnSpec,
    SupervisedChild, Termination,
};
