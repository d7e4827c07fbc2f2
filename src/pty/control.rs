//! In-band control sentinels carried on the terminal socket.
//!
//! Terminal bytes travel as binary frames. A text frame of the form
//! `RESIZE <cols> <rows>` is a resize command rather than input; any other
//! text frame is typed into the PTY like binary data.

use axum::extract::ws::Message;

use crate::errors::ProtocolError;

pub const RESIZE_PREFIX: &str = "RESIZE ";

/// Byte the client sends when local input ends (Ctrl+D).
pub const EOF_MARKER: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    pub fn to_sentinel(self) -> String {
        format!("{}{} {}", RESIZE_PREFIX, self.cols, self.rows)
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Parse a `RESIZE <cols> <rows>` sentinel.
pub fn parse_resize(text: &str) -> Result<WindowSize, ProtocolError> {
    let malformed = || ProtocolError::MalformedResize(text.to_string());

    let rest = text.strip_prefix(RESIZE_PREFIX).ok_or_else(malformed)?;
    let mut parts = rest.split_whitespace();
    let (cols, rows) = match (parts.next(), parts.next(), parts.next()) {
        (Some(cols), Some(rows), None) => (cols, rows),
        _ => return Err(malformed()),
    };
    if !is_digits(cols) || !is_digits(rows) {
        return Err(malformed());
    }
    let cols: u16 = cols.parse().map_err(|_| malformed())?;
    let rows: u16 = rows.parse().map_err(|_| malformed())?;
    if cols == 0 || rows == 0 {
        return Err(ProtocolError::ZeroDimension { cols, rows });
    }
    Ok(WindowSize { cols, rows })
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// What a single inbound frame on a terminal socket means.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes to write to the PTY verbatim.
    Input(Vec<u8>),
    Resize(WindowSize),
    /// A resize sentinel that failed to parse. Dropped, connection continues.
    BadControl(ProtocolError),
    /// Ping/pong traffic. Only refreshes liveness.
    Keepalive,
    Close,
}

pub fn classify(msg: Message) -> Inbound {
    match msg {
        Message::Text(text) => {
            if text.starts_with(RESIZE_PREFIX) {
                match parse_resize(&text) {
                    Ok(size) => Inbound::Resize(size),
                    Err(e) => Inbound::BadControl(e),
                }
            } else {
                Inbound::Input(text.into_bytes())
            }
        }
        Message::Binary(data) => Inbound::Input(data),
        Message::Ping(_) | Message::Pong(_) => Inbound::Keepalive,
        Message::Close(_) => Inbound::Close,
    }
}
