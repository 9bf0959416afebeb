//! Tunnel client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the management server, e.g. `https://fleet.example.com`
    pub url: String,

    /// Bearer token presented during the upgrade handshake.
    ///
    /// Usually supplied on the command line or via environment instead
    /// of being stored here.
    pub token: Option<String>,

    /// Skip TLS certificate verification (self-signed test servers)
    pub insecure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost".to_string(),
            token: None,
            insecure: false,
        }
    }
}

/// Configuration for the tunnel client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Server connection settings
    pub server: ServerConfig,

    /// Interval between keepalive pings on an idle connection
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// How long to wait for a pong before declaring the transport lost
    #[serde(with = "duration_secs")]
    pub keepalive_timeout: Duration,

    /// Timeout for establishing the transport connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// How long to wait for the server to answer an Open request
    #[serde(with = "duration_secs")]
    pub open_timeout: Duration,

    /// Grace period for in-flight frames during shutdown
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,

    /// Capacity of each session's inbound event queue
    pub session_queue_capacity: usize,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            session_queue_capacity: 64,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(10));
        assert_eq!(config.session_queue_capacity, 64);
        assert!(!config.server.insecure);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            keepalive_interval = 15

            [server]
            url = "https://fleet.example.com"
        "#;

        let config: TunnelConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
        assert_eq!(config.server.url, "https://fleet.example.com");
        // Unspecified fields fall back to defaults
        assert_eq!(config.open_timeout, Duration::from_secs(10));
        assert_eq!(config.backoff.multiplier, 2.0);
    }

    #[test]
    fn test_backoff_defaults() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.initial, Duration::from_secs(1));
        assert_eq!(backoff.max, Duration::from_secs(60));
        assert!(backoff.jitter >= 0.0 && backoff.jitter <= 1.0);
    }
}
