use std::os::raw::c_int;

use emage_core::{EnbId, FrameEncodeError, OpsError, TriggerError};

/// Errors surfaced by the embedding API.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent {0} already exists")]
    AlreadyExists(EnbId),
    #[error("agent {0} not found")]
    NotFound(EnbId),
    #[error("agent is not connected to a controller")]
    NotConnected,
    #[error("technology init failed: {0}")]
    Init(#[source] OpsError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Frame(#[from] FrameEncodeError),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl AgentError {
    /// Negative errno-style code for C callers.
    pub fn code(&self) -> c_int {
        match self {
            AgentError::AlreadyExists(_) => -17,
            AgentError::NotFound(_) => -2,
            AgentError::NotConnected => -107,
            AgentError::Init(e) => match e.code() {
                c if c < 0 => c,
                _ => -1,
            },
            AgentError::Trigger(TriggerError::DuplicateId(_)) => -17,
            AgentError::Trigger(TriggerError::NotFound(_)) => -2,
            AgentError::Frame(FrameEncodeError::OutOfMemory) => -12,
            AgentError::Frame(_) => -22,
            AgentError::Transport(_) => -5,
        }
    }
}
