//! Local port forwarding
//!
//! Binds local TCP listeners and bridges each accepted connection to a
//! forward session targeting an address on the device. Every local
//! connection gets its own session, so one stalled client never blocks
//! the others.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use dl_core::error::{SessionError, TunnelError};

use crate::controller::{SessionHandle, TunnelController};
use crate::registry::SessionEvent;

/// Read chunk size for the local socket
const READ_CHUNK_SIZE: usize = 8192;

/// One port-forward rule: local port to a target address on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    /// Local port to listen on (loopback only)
    pub local_port: u16,
    /// Host to reach from the device
    pub remote_host: String,
    /// Port on the remote host
    pub remote_port: u16,
}

impl ForwardSpec {
    /// Target address string sent in the Open request
    pub fn target_address(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.local_port, self.remote_host, self.remote_port
        )
    }
}

impl FromStr for ForwardSpec {
    type Err = String;

    /// Parse `LOCAL:REMOTE` or `LOCAL:HOST:REMOTE`.
    ///
    /// The two-part form targets localhost on the device.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (local, host, remote) = match parts.as_slice() {
            [local, remote] => (*local, "localhost", *remote),
            [local, host, remote] => (*local, *host, *remote),
            _ => return Err(format!("Invalid forward spec '{}', expected LOCAL:PORT or LOCAL:HOST:PORT", s)),
        };

        let local_port = local
            .parse::<u16>()
            .map_err(|_| format!("Invalid local port '{}'", local))?;
        let remote_port = remote
            .parse::<u16>()
            .map_err(|_| format!("Invalid remote port '{}'", remote))?;
        if host.is_empty() {
            return Err(format!("Empty host in forward spec '{}'", s));
        }

        Ok(Self {
            local_port,
            remote_host: host.to_string(),
            remote_port,
        })
    }
}

/// Runs the listeners for a set of forward rules
pub struct ForwardManager {
    controller: Arc<TunnelController>,
    listeners: Vec<(TcpListener, ForwardSpec)>,
}

impl ForwardManager {
    /// Bind a loopback listener for every rule.
    ///
    /// Fails fast if any local port cannot be bound; a rule with local
    /// port 0 gets an OS-assigned port, visible via
    /// [`local_addrs`](ForwardManager::local_addrs).
    pub async fn bind(
        controller: Arc<TunnelController>,
        specs: Vec<ForwardSpec>,
    ) -> Result<Self, TunnelError> {
        let mut listeners = Vec::with_capacity(specs.len());
        for spec in specs {
            let listener = TcpListener::bind(("127.0.0.1", spec.local_port))
                .await
                .map_err(SessionError::LocalIo)?;
            tracing::info!(
                "Forwarding {} to {}",
                listener.local_addr().map_err(SessionError::LocalIo)?,
                spec.target_address()
            );
            listeners.push((listener, spec));
        }
        Ok(Self {
            controller,
            listeners,
        })
    }

    /// Addresses the listeners are bound to, in rule order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(l, _)| l.local_addr().ok())
            .collect()
    }

    /// Serve until `cancel` fires or the tunnel stops
    pub async fn run(self, cancel: CancellationToken) {
        let mut tasks = Vec::with_capacity(self.listeners.len());

        for (listener, spec) in self.listeners {
            let controller = Arc::clone(&self.controller);
            tasks.push(tokio::spawn(accept_loop(
                listener,
                spec,
                controller,
                cancel.clone(),
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.controller.closed() => {}
        }

        for task in tasks {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    spec: ForwardSpec,
    controller: Arc<TunnelController>,
    cancel: CancellationToken,
) {
    loop {
        let socket = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(%peer, %spec, "Accepted local connection");
                    socket
                }
                Err(e) => {
                    tracing::warn!(%spec, "Accept failed: {}", e);
                    continue;
                }
            }
        };

        let controller = Arc::clone(&controller);
        let target = spec.target_address();
        tokio::spawn(async move {
            match controller.open_forward(&target).await {
                Ok(handle) => {
                    if let Err(e) = pump_connection(socket, handle).await {
                        tracing::debug!(%target, "Forward connection ended: {}", e);
                    }
                }
                // A refused session closes the local socket; the next
                // connection attempt gets a fresh verdict
                Err(e) => tracing::warn!(%target, "Forward session refused: {}", e),
            }
        });
    }
}

/// Bidirectional pump between the local socket and the session
async fn pump_connection(
    mut socket: TcpStream,
    mut handle: SessionHandle,
) -> Result<(), TunnelError> {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    enum Step {
        Local(std::io::Result<usize>),
        Session(Option<SessionEvent>),
    }

    loop {
        // Resolve the select before acting so neither arm holds a
        // borrow while the other is handled
        let step = tokio::select! {
            read = socket.read(&mut buf) => Step::Local(read),
            evt = handle.recv() => Step::Session(evt),
        };

        match step {
            Step::Local(Ok(0)) => {
                // Local client hung up
                handle.close().await?;
                return Ok(());
            }
            Step::Local(Ok(n)) => {
                handle.send_data(Bytes::copy_from_slice(&buf[..n])).await?;
            }
            Step::Local(Err(e)) => {
                handle.close().await?;
                return Err(SessionError::LocalIo(e).into());
            }

            Step::Session(Some(SessionEvent::Data(data))) => {
                socket
                    .write_all(&data)
                    .await
                    .map_err(SessionError::LocalIo)?;
            }
            Step::Session(Some(SessionEvent::Error(message))) => {
                tracing::warn!(%message, "Server reported forward error");
            }
            Step::Session(Some(SessionEvent::Closed)) => {
                let _ = socket.shutdown().await;
                return Ok(());
            }
            Step::Session(Some(SessionEvent::TransportLost)) | Step::Session(None) => {
                let _ = socket.shutdown().await;
                return Err(TunnelError::TransportLost);
            }
            Step::Session(Some(other)) => {
                tracing::debug!(?other, "Unexpected event on forward session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_part_spec_targets_localhost() {
        let spec: ForwardSpec = "8080:80".parse().unwrap();
        assert_eq!(spec.local_port, 8080);
        assert_eq!(spec.remote_host, "localhost");
        assert_eq!(spec.remote_port, 80);
        assert_eq!(spec.target_address(), "localhost:80");
    }

    #[test]
    fn test_parse_three_part_spec() {
        let spec: ForwardSpec = "5432:db.internal:5432".parse().unwrap();
        assert_eq!(spec.local_port, 5432);
        assert_eq!(spec.remote_host, "db.internal");
        assert_eq!(spec.target_address(), "db.internal:5432");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<ForwardSpec>().is_err());
        assert!("8080".parse::<ForwardSpec>().is_err());
        assert!("notaport:80".parse::<ForwardSpec>().is_err());
        assert!("8080:host:notaport".parse::<ForwardSpec>().is_err());
        assert!("1:2:3:4".parse::<ForwardSpec>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let spec: ForwardSpec = "8080:db:5432".parse().unwrap();
        assert_eq!(spec.to_string().parse::<ForwardSpec>().unwrap(), spec);
    }
}
