//! dl-tunnel: Tunnel runtime for devlink
//!
//! This crate owns the device-connect transport and everything that
//! runs over it: the session registry, the interactive shell session,
//! and the local port-forward listeners.
//!
//! The concurrency model is a single reader and a single writer. The
//! controller's dispatch task is the only reader of the transport and
//! routes inbound frames to per-session event queues; a dedicated
//! writer task owns the sink and serializes frames from any number of
//! [`FrameSender`] clones.

pub mod controller;
pub mod forward;
pub mod reconnect;
pub mod registry;
pub mod shell;
pub mod transport;

pub use controller::{SessionHandle, TunnelController};
pub use forward::{ForwardManager, ForwardSpec};
pub use reconnect::Backoff;
pub use registry::{SessionEvent, SessionKind, SessionRegistry, SessionState};
pub use shell::{ShellExit, ShellSession};
pub use transport::{FrameSender, Transport};
