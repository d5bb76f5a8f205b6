//! eNB control agent: keeps one controller session per base station and routes commands and
//! trigger-gated reports through [`emage_core`].

pub mod config;
pub mod connection;
pub mod error;
pub mod ffi;
pub mod registry;

pub use connection::{Backoff, ConnectionStatus, ControllerConfig, Link, ReportOutcome};
pub use error::AgentError;
pub use registry::{AgentHandle, Registry};
