//! dl-core: Core error types and configuration for devlink
//!
//! This crate provides the error taxonomy and configuration structures
//! shared by the tunnel runtime and the CLI.

pub mod config;
pub mod error;

pub use error::{ConfigError, ConnectionError, SessionError, TunnelError};
