//! Core error types for devlink
//!
//! The taxonomy separates errors by blast radius: connection errors
//! kill the whole tunnel attempt, transport loss kills every open
//! session, session errors kill exactly one session, and protocol
//! errors are logged and dropped without crashing anything.

use dl_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the devlink tunnel client
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Protocol error (malformed frame)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Could not establish the transport
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Established transport died; fatal to all open sessions
    #[error("Transport lost")]
    TransportLost,

    /// Session-scoped error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors establishing the transport connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Server URL could not be turned into a device-connect endpoint
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    /// The HTTP upgrade handshake failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// TLS setup failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection attempt timed out
    #[error("Connection timed out")]
    Timeout,
}

/// Errors scoped to a single session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Server refused the Open request
    #[error("Session refused by server: {reason}")]
    Rejected { reason: String },

    /// Server reported an error for this session
    #[error("Session error from server: {0}")]
    Remote(String),

    /// Local terminal or socket failed
    #[error("Local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// Server did not answer the Open request in time
    #[error("Timed out waiting for the server to accept the session")]
    OpenTimeout,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
