//! Interactive shell session
//!
//! Bridges the local terminal to a remote shell session: keystrokes
//! become Data frames, inbound Data is written to stdout, and local
//! resize events are forwarded. The terminal is switched into raw mode
//! for the duration and restored on every exit path via a guard.

use std::io::Write;

use bytes::Bytes;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::sync::mpsc;

use dl_core::error::{SessionError, TunnelError};

use crate::controller::SessionHandle;
use crate::registry::SessionEvent;

/// How the shell session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellExit {
    /// User detached with the escape key
    Detached,
    /// Remote end closed the session
    Closed,
    /// The transport died underneath the session
    TransportLost,
}

/// Restores the terminal's cooked mode when dropped.
///
/// Raw mode must not outlive the session on any exit path, including
/// panics and early returns.
struct RawModeGuard {
    restore: fn() -> std::io::Result<()>,
}

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self {
            restore: disable_raw_mode,
        })
    }

    #[cfg(test)]
    fn with_restore(restore: fn() -> std::io::Result<()>) -> Self {
        Self { restore }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = (self.restore)();
    }
}

/// Interactive terminal session over an open shell session
pub struct ShellSession {
    handle: SessionHandle,
}

impl ShellSession {
    /// Wrap an accepted shell session
    pub fn new(handle: SessionHandle) -> Self {
        Self { handle }
    }

    /// Run the interactive loop until detach, remote close, or
    /// transport loss.
    pub async fn run(mut self) -> Result<ShellExit, TunnelError> {
        let _guard = RawModeGuard::enable().map_err(SessionError::LocalIo)?;

        // Terminal events arrive on a blocking thread; forward them
        // into the async loop
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
        let event_handle = tokio::task::spawn_blocking(move || loop {
            if event::poll(std::time::Duration::from_millis(10)).unwrap_or(false) {
                if let Ok(evt) = event::read() {
                    if event_tx.blocking_send(evt).is_err() {
                        break;
                    }
                }
            }
        });

        let result = bridge(&mut self.handle, &mut event_rx, &mut std::io::stdout()).await;

        event_handle.abort();
        result
    }
}

/// Pump terminal events and session events until one side ends the
/// session.
///
/// A failure to write to the local terminal closes the session so the
/// remote end stops producing output for a sink that no longer exists.
async fn bridge<W: Write>(
    handle: &mut SessionHandle,
    events: &mut mpsc::Receiver<Event>,
    out: &mut W,
) -> Result<ShellExit, TunnelError> {
    enum Step {
        Terminal(Event),
        Session(Option<SessionEvent>),
    }

    loop {
        // Resolve the select before acting so neither arm holds a
        // borrow while the other is handled
        let step = tokio::select! {
            Some(evt) = events.recv() => Step::Terminal(evt),
            evt = handle.recv() => Step::Session(evt),
        };

        match step {
            Step::Terminal(Event::Key(KeyEvent { code, modifiers, .. })) => {
                // Ctrl+] to detach
                if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char(']') {
                    handle.close().await?;
                    return Ok(ShellExit::Detached);
                }

                let data = key_to_bytes(code, modifiers);
                if !data.is_empty() {
                    handle.send_data(Bytes::from(data)).await?;
                }
            }
            Step::Terminal(Event::Resize(cols, rows)) => {
                handle.resize(rows, cols).await?;
            }
            Step::Terminal(_) => {}

            Step::Session(Some(SessionEvent::Data(data))) => {
                if let Err(e) = out.write_all(&data).and_then(|()| out.flush()) {
                    let _ = handle.close().await;
                    return Err(SessionError::LocalIo(e).into());
                }
            }
            Step::Session(Some(SessionEvent::Error(message))) => {
                tracing::warn!(%message, "Server reported shell error");
            }
            Step::Session(Some(SessionEvent::Closed)) => return Ok(ShellExit::Closed),
            Step::Session(Some(SessionEvent::TransportLost)) | Step::Session(None) => {
                return Ok(ShellExit::TransportLost);
            }
            // Accepted was consumed when the session opened
            Step::Session(Some(other)) => {
                tracing::debug!(?other, "Unexpected event on open shell session");
            }
        }
    }
}

/// Convert a key event to the bytes a terminal would send
fn key_to_bytes(code: KeyCode, modifiers: KeyModifiers) -> Vec<u8> {
    use KeyCode::*;

    match code {
        Char(c) => {
            if modifiers.contains(KeyModifiers::CONTROL) {
                // Ctrl+A = 0x01, Ctrl+B = 0x02, etc.
                let ctrl_char = (c.to_ascii_lowercase() as u8).wrapping_sub(b'a' - 1);
                vec![ctrl_char]
            } else if modifiers.contains(KeyModifiers::ALT) {
                // Alt+key sends ESC followed by the key's UTF-8 bytes
                let mut buf = [0u8; 4];
                let mut bytes = vec![0x1b];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                bytes
            } else {
                c.to_string().into_bytes()
            }
        }
        Enter => vec![b'\r'],
        Tab => vec![b'\t'],
        Backspace => vec![0x7f],
        Esc => vec![0x1b],
        Up => vec![0x1b, b'[', b'A'],
        Down => vec![0x1b, b'[', b'B'],
        Right => vec![0x1b, b'[', b'C'],
        Left => vec![0x1b, b'[', b'D'],
        Home => vec![0x1b, b'[', b'H'],
        End => vec![0x1b, b'[', b'F'],
        PageUp => vec![0x1b, b'[', b'5', b'~'],
        PageDown => vec![0x1b, b'[', b'6', b'~'],
        Delete => vec![0x1b, b'[', b'3', b'~'],
        Insert => vec![0x1b, b'[', b'2', b'~'],
        F(n) => match n {
            1 => vec![0x1b, b'O', b'P'],
            2 => vec![0x1b, b'O', b'Q'],
            3 => vec![0x1b, b'O', b'R'],
            4 => vec![0x1b, b'O', b'S'],
            5 => vec![0x1b, b'[', b'1', b'5', b'~'],
            6 => vec![0x1b, b'[', b'1', b'7', b'~'],
            7 => vec![0x1b, b'[', b'1', b'8', b'~'],
            8 => vec![0x1b, b'[', b'1', b'9', b'~'],
            9 => vec![0x1b, b'[', b'2', b'0', b'~'],
            10 => vec![0x1b, b'[', b'2', b'1', b'~'],
            11 => vec![0x1b, b'[', b'2', b'3', b'~'],
            12 => vec![0x1b, b'[', b'2', b'4', b'~'],
            _ => vec![],
        },
        _ => vec![],
    }
}
