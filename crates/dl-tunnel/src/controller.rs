//! Tunnel controller
//!
//! Owns the transport and the dispatch task that demultiplexes inbound
//! frames onto session queues. The dispatch task is the transport's
//! only reader; it also drives the protocol-level keepalive and
//! declares the transport lost when a pong fails to arrive in time.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use dl_core::config::TunnelConfig;
use dl_core::error::{SessionError, TunnelError};
use dl_protocol::{Frame, FrameType, SessionId};

use crate::registry::{SessionEvent, SessionKind, SessionRegistry};
use crate::transport::{FrameSender, Transport};

/// Why the dispatch loop stopped
enum ExitReason {
    /// Local shutdown requested
    Shutdown,
    /// Server closed the connection in an orderly fashion
    RemoteClosed,
    /// Connection died or keepalive timed out
    TransportLost,
}

/// Handle to one open session
///
/// Holds the receiving end of the session's event queue plus a sender
/// for outbound frames. Dropping the handle without calling
/// [`close`](SessionHandle::close) leaves the remote end to discover
/// the session's fate through the transport.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    events: mpsc::Receiver<SessionEvent>,
    sender: FrameSender,
    registry: Arc<SessionRegistry>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        events: mpsc::Receiver<SessionEvent>,
        sender: FrameSender,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            id,
            events,
            sender,
            registry,
        }
    }

    /// ID of this session
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Receive the next event for this session.
    ///
    /// `None` means the session was torn down and no further events
    /// will arrive (the registry dropped its sender).
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Send payload bytes to the remote end
    pub async fn send_data(&self, body: Bytes) -> Result<(), TunnelError> {
        self.sender.send(Frame::data(self.id, body)).await
    }

    /// Notify the remote end of a terminal resize
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), TunnelError> {
        self.sender.send(Frame::resize(self.id, rows, cols)).await
    }

    /// Close this session, notifying the remote end
    pub async fn close(&mut self) -> Result<(), TunnelError> {
        self.registry.mark_closing(self.id);
        let result = self.sender.send(Frame::close(self.id)).await;
        self.registry.remove(self.id);
        result
    }
}

/// The tunnel controller: one per device connection
pub struct TunnelController {
    registry: Arc<SessionRegistry>,
    sender: FrameSender,
    config: TunnelConfig,
    cancel: CancellationToken,
}

impl TunnelController {
    /// Connect to `device_id` and start the dispatch task
    pub async fn connect(
        config: TunnelConfig,
        device_id: &str,
        token: &str,
    ) -> Result<Self, TunnelError> {
        let transport = Transport::connect(&config, device_id, token).await?;
        let sender = transport.sender();
        let registry = Arc::new(SessionRegistry::new(config.session_queue_capacity));
        let cancel = CancellationToken::new();

        tokio::spawn(dispatch_loop(
            transport,
            Arc::clone(&registry),
            sender.clone(),
            config.clone(),
            cancel.clone(),
        ));

        tracing::info!(%device_id, "Tunnel established");

        Ok(Self {
            registry,
            sender,
            config,
            cancel,
        })
    }

    /// Open an interactive shell session with the given terminal size
    pub async fn open_shell(&self, rows: u16, cols: u16) -> Result<SessionHandle, TunnelError> {
        let (id, events) = self.registry.create(SessionKind::Shell);
        self.open(id, events, Frame::open_shell(id, rows, cols))
            .await
    }

    /// Open a forward session to `target_address` on the device
    pub async fn open_forward(&self, target_address: &str) -> Result<SessionHandle, TunnelError> {
        let (id, events) = self.registry.create(SessionKind::Forward);
        self.open(id, events, Frame::open_forward(id, target_address))
            .await
    }

    /// Send the Open frame and wait for the server's verdict
    async fn open(
        &self,
        id: SessionId,
        mut events: mpsc::Receiver<SessionEvent>,
        frame: Frame,
    ) -> Result<SessionHandle, TunnelError> {
        if let Err(e) = self.sender.send(frame).await {
            self.registry.remove(id);
            return Err(e);
        }

        let verdict = tokio::time::timeout(self.config.open_timeout, events.recv()).await;
        match verdict {
            Ok(Some(SessionEvent::Accepted)) => {
                tracing::debug!(%id, "Session accepted");
                Ok(SessionHandle::new(
                    id,
                    events,
                    self.sender.clone(),
                    Arc::clone(&self.registry),
                ))
            }
            Ok(Some(SessionEvent::Rejected(reason))) => {
                tracing::warn!(%id, %reason, "Session refused");
                Err(SessionError::Rejected { reason }.into())
            }
            Ok(Some(SessionEvent::TransportLost)) | Ok(None) => Err(TunnelError::TransportLost),
            // Accept/Reject is always the first event for a session,
            // anything else here is a protocol violation
            Ok(Some(other)) => {
                tracing::warn!(%id, ?other, "Unexpected event while session pending");
                self.registry.remove(id);
                Err(SessionError::OpenTimeout.into())
            }
            Err(_) => {
                tracing::warn!(%id, "Timed out waiting for session accept");
                self.registry.remove(id);
                Err(SessionError::OpenTimeout.into())
            }
        }
    }

    /// Number of currently registered sessions
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Request an orderly shutdown: close every session, then stop the
    /// dispatch task and drain the writer.
    pub async fn shutdown(&self) {
        for id in self.registry.ids() {
            let _ = self.sender.send(Frame::close(id)).await;
        }
        self.cancel.cancel();
    }

    /// Wait until the tunnel has stopped, whether by shutdown or by
    /// losing the transport.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether the tunnel has stopped
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn dispatch_loop(
    mut transport: Transport,
    registry: Arc<SessionRegistry>,
    sender: FrameSender,
    config: TunnelConfig,
    cancel: CancellationToken,
) {
    let mut keepalive = interval_at(
        Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    enum Step {
        Shutdown,
        Keepalive,
        PongTimeout,
        Inbound(Result<Option<Frame>, TunnelError>),
    }

    let reason = loop {
        let deadline = pong_deadline;
        let pong_timeout = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        // Resolve the select before acting so neither arm holds a
        // borrow while the other is handled
        let step = tokio::select! {
            _ = cancel.cancelled() => Step::Shutdown,
            _ = keepalive.tick() => Step::Keepalive,
            _ = pong_timeout => Step::PongTimeout,
            result = transport.receive() => Step::Inbound(result),
        };

        match step {
            Step::Shutdown => break ExitReason::Shutdown,

            Step::Keepalive => {
                // Don't stack pings while one is outstanding
                if pong_deadline.is_none() {
                    if sender.send(Frame::ping()).await.is_err() {
                        break ExitReason::TransportLost;
                    }
                    pong_deadline = Some(Instant::now() + config.keepalive_timeout);
                }
            }

            Step::PongTimeout => {
                tracing::warn!(
                    timeout = ?config.keepalive_timeout,
                    "No pong within keepalive timeout, declaring transport lost"
                );
                break ExitReason::TransportLost;
            }

            Step::Inbound(result) => match result {
                Ok(Some(frame)) => {
                    // Inbound traffic already proves the peer alive, so
                    // push the next ping a full interval out
                    keepalive.reset();
                    if frame.frame_type == FrameType::Pong {
                        pong_deadline = None;
                    } else {
                        route_frame(&registry, &sender, frame).await;
                    }
                }
                Ok(None) => break ExitReason::RemoteClosed,
                Err(TunnelError::Protocol(e)) => {
                    // A malformed frame poisons the byte stream; there
                    // is no resynchronization point to skip to
                    tracing::error!("Protocol error on transport: {}", e);
                    break ExitReason::TransportLost;
                }
                Err(_) => break ExitReason::TransportLost,
            },
        }
    };

    match reason {
        ExitReason::Shutdown => {
            tracing::info!("Tunnel shutting down");
            // Sessions observe a clean close, not a transport failure
            registry.close_all();
        }
        ExitReason::RemoteClosed => {
            tracing::info!("Server closed the connection");
            registry.fail_all();
        }
        ExitReason::TransportLost => {
            tracing::warn!("Transport lost");
            registry.fail_all();
        }
    }

    cancel.cancel();
    drop(sender);
    transport.close(config.drain_timeout).await;
}

/// Route one inbound frame to its session
async fn route_frame(registry: &SessionRegistry, sender: &FrameSender, frame: Frame) {
    let id = frame.session_id;
    match frame.frame_type {
        FrameType::Accept => registry.handle_accept(id),
        FrameType::Reject => registry.handle_reject(id, frame.reason()),
        FrameType::Data => registry.handle_data(id, frame.body),
        FrameType::Error => registry.handle_error(id, frame.reason()),
        FrameType::Close => registry.handle_close(id),
        FrameType::Ping => {
            let _ = sender.send(Frame::pong()).await;
        }
        // Pong is consumed by the dispatch loop; Open and Resize only
        // ever travel towards the device
        FrameType::Pong | FrameType::Open | FrameType::Resize => {
            tracing::debug!(%id, frame_type = ?frame.frame_type, "Unexpected inbound frame, dropping");
        }
    }
}
