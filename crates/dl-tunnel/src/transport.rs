//! Device-connect transport
//!
//! Establishes the WebSocket connection to the management server's
//! device-connect endpoint, authenticating with a bearer token during
//! the HTTP upgrade handshake.
//!
//! Frame writes are serialized through a dedicated writer task that
//! owns the sink; any number of [`FrameSender`] clones feed it through
//! a bounded channel, so concurrent senders never interleave partial
//! frames on the wire.

use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use dl_core::config::TunnelConfig;
use dl_core::error::{ConnectionError, TunnelError};
use dl_protocol::{Frame, FrameCodec};

/// Capacity of the outbound frame channel feeding the writer task.
///
/// Holds frames queued by the dispatch loop and every session while the
/// writer drains them to the socket.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Clonable handle for queueing frames to the transport writer
#[derive(Clone)]
#[derive(Debug)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Queue a frame for transmission.
    ///
    /// Fails with [`TunnelError::TransportLost`] once the writer task
    /// has exited.
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TunnelError::TransportLost)
    }
}

/// An established device-connect transport
pub struct Transport {
    reader: SplitStream<WsStream>,
    codec: FrameCodec,
    buffer: BytesMut,
    sender: FrameSender,
    writer: JoinHandle<()>,
    writer_stop: CancellationToken,
}

impl Transport {
    /// Connect to the device-connect endpoint for `device_id`.
    ///
    /// The bearer token is presented in the `Authorization` header of
    /// the upgrade request. With `server.insecure` set, certificate
    /// verification is disabled for self-signed test servers.
    pub async fn connect(
        config: &TunnelConfig,
        device_id: &str,
        token: &str,
    ) -> Result<Self, ConnectionError> {
        let url = device_connect_url(&config.server.url, device_id)?;
        tracing::debug!(%url, "Connecting to device-connect endpoint");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ConnectionError::InvalidUrl(format!("Invalid token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let connector = if config.server.insecure {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| ConnectionError::Tls(e.to_string()))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (stream, response) = tokio::time::timeout(
            config.connect_timeout,
            connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| ConnectionError::HandshakeFailed(e.to_string()))?;

        tracing::debug!(status = %response.status(), "Upgrade handshake complete");

        let (sink, reader) = stream.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let writer_stop = CancellationToken::new();
        let writer = tokio::spawn(write_loop(sink, rx, writer_stop.clone()));

        Ok(Self {
            reader,
            codec: FrameCodec::new(),
            buffer: BytesMut::with_capacity(8192),
            sender: FrameSender::new(tx),
            writer,
            writer_stop,
        })
    }

    /// Get a clonable sender for this transport
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Receive the next protocol frame.
    ///
    /// Returns `Ok(None)` on orderly close of the connection.
    pub async fn receive(&mut self) -> Result<Option<Frame>, TunnelError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            match self.reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.buffer.extend_from_slice(&data);
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // WebSocket-level pings are answered by tungstenite;
                // the protocol has its own keepalive frames
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!("Transport read error: {}", e);
                    return Err(TunnelError::TransportLost);
                }
            }
        }
    }

    /// Close the transport, giving queued frames `drain` to flush.
    pub async fn close(self, drain: std::time::Duration) {
        let Self {
            sender,
            writer,
            writer_stop,
            ..
        } = self;
        drop(sender);
        writer_stop.cancel();
        if tokio::time::timeout(drain, writer).await.is_err() {
            tracing::debug!("Drain timeout expired with frames still queued");
        }
    }
}

/// Writer task: encodes queued frames and owns the sink.
///
/// Exits when every `FrameSender` clone has been dropped or `stop`
/// fires; either way the already-queued frames are flushed first and a
/// WebSocket close goes out last.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Frame>,
    stop: CancellationToken,
) {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(8192);

    let mut send_frame = |frame: Frame, buf: &mut BytesMut| -> Option<Message> {
        buf.clear();
        match codec.encode(frame, buf) {
            Ok(()) => Some(Message::Binary(buf.to_vec())),
            Err(e) => {
                tracing::error!("Failed to encode frame: {}", e);
                None
            }
        }
    };

    loop {
        let frame = tokio::select! {
            biased;
            maybe = rx.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
            _ = stop.cancelled() => {
                // Flush whatever is already queued before closing
                while let Ok(frame) = rx.try_recv() {
                    if let Some(msg) = send_frame(frame, &mut buf) {
                        if sink.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
                break;
            }
        };

        if let Some(msg) = send_frame(frame, &mut buf) {
            if let Err(e) = sink.send(msg).await {
                tracing::debug!("Transport write error: {}", e);
                return;
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.flush().await;
}

/// Derive the device-connect WebSocket URL from the server's base URL
pub fn device_connect_url(server_url: &str, device_id: &str) -> Result<String, ConnectionError> {
    let base = server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("wss://") || base.starts_with("ws://") {
        base.to_string()
    } else {
        return Err(ConnectionError::InvalidUrl(format!(
            "Unsupported scheme in {}",
            server_url
        )));
    };

    Ok(format!(
        "{}/api/management/v1/deviceconnect/devices/{}/connect",
        ws_base, device_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_https_becomes_wss() {
        let url = device_connect_url("https://fleet.example.com", "dev-1").unwrap();
        assert_eq!(
            url,
            "wss://fleet.example.com/api/management/v1/deviceconnect/devices/dev-1/connect"
        );
    }

    #[test]
    fn test_url_http_becomes_ws() {
        let url = device_connect_url("http://localhost:8080/", "abc").unwrap();
        assert_eq!(
            url,
            "ws://localhost:8080/api/management/v1/deviceconnect/devices/abc/connect"
        );
    }

    #[test]
    fn test_url_ws_scheme_passes_through() {
        let url = device_connect_url("ws://127.0.0.1:9000", "d").unwrap();
        assert!(url.starts_with("ws://127.0.0.1:9000/"));
    }

    #[test]
    fn test_url_unknown_scheme_rejected() {
        assert!(matches!(
            device_connect_url("ftp://example.com", "d"),
            Err(ConnectionError::InvalidUrl(_))
        ));
    }
}
