//! Local terminal plumbing for the client.

use std::io::{IsTerminal, Read};

use crossterm::terminal;
use tokio::sync::mpsc;
use tracing::debug;

use crate::pty::WindowSize;

const STDIN_CHUNK_SIZE: usize = 4096;

pub fn stdin_is_tty() -> bool {
    std::io::stdin().is_terminal()
}

/// Raw mode for as long as the guard lives.
pub struct RawModeGuard(());

impl RawModeGuard {
    pub fn enable() -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self(()))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            debug!(error = %e, "Failed to restore terminal mode");
        }
    }
}

/// Current size of the controlling terminal, 80x24 when it cannot be read.
pub fn current_size() -> WindowSize {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => WindowSize::new(cols, rows),
        _ => WindowSize::default(),
    }
}

/// Read stdin on a detached thread. The channel closes on end of input.
///
/// The thread is not joined: a read blocked on the terminal would otherwise
/// hold the process open after the session ends.
pub fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; STDIN_CHUNK_SIZE];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}
