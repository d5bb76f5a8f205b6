//! Technology abstraction: the callbacks a radio stack supplies to the agent.

use crate::protocol::HandoverRequest;

/// Result of a command callback. `Some(body)` is sent back to the controller as a reply;
/// `None` means the technology layer answers later (or not at all).
pub type OpsResult = Result<Option<Vec<u8>>, OpsError>;

/// Failure reported by the technology layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpsError {
    #[error("operation not supported by this technology")]
    Unsupported,
    #[error("technology layer returned error code {0}")]
    Code(i32),
    #[error("technology layer failed: {0}")]
    Failed(String),
}

impl OpsError {
    /// Numeric code used in negative acknowledgments and the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            OpsError::Unsupported => -38,
            OpsError::Code(c) => *c,
            OpsError::Failed(_) => -1,
        }
    }
}

/// Operations the agent invokes on the technology it is embedded in.
///
/// One implementation per radio technology, injected when the agent is started. Calls may
/// block; the agent never holds a lock while invoking them.
pub trait AgentOps: Send + Sync {
    /// Called once before the agent connects. An error aborts the start.
    fn init(&self) -> Result<(), OpsError> {
        Ok(())
    }

    /// Called once when the agent terminates. Errors are logged; termination proceeds.
    fn release(&self) -> Result<(), OpsError> {
        Ok(())
    }

    /// The controller session ended. The agent will reconnect on its own.
    fn disconnected(&self) {}

    /// The controller asks for the base station setup.
    fn enb_setup_request(&self) -> OpsResult;

    /// The controller asks for the setup of one cell.
    fn cell_setup_request(&self, cell_id: u16) -> OpsResult;

    fn handover_ue(&self, _request: &HandoverRequest) -> OpsResult {
        Err(OpsError::Unsupported)
    }

    /// Technology-specific commands keyed by kind.
    fn handle_command(&self, _kind: u16, _body: &[u8]) -> OpsResult {
        Err(OpsError::Unsupported)
    }
}
