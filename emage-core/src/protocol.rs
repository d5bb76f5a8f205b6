//! Agent/controller wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::trigger::TriggerKind;

/// Current protocol version. Sent in the hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Base station identifier.
pub type EnbId = u64;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
/// Requests from the controller carry a `seq` echoed back in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Agent → controller, first message of every session.
    Hello { protocol_version: u8, enb_id: EnbId },
    /// Controller asks how the base station is configured.
    EnbSetupRequest { seq: u32 },
    /// Controller asks how a single cell is configured.
    CellSetupRequest { seq: u32, cell_id: u16 },
    /// Arm a trigger in the agent's trigger table.
    TriggerArm {
        seq: u32,
        trigger_id: i32,
        kind: TriggerKind,
        target_cell: Option<u16>,
    },
    /// Disarm a previously armed trigger.
    TriggerDisarm { seq: u32, trigger_id: i32 },
    /// Hand a UE over to another cell or base station.
    Handover { seq: u32, request: HandoverRequest },
    /// Technology-specific command, routed by `kind`.
    Command { seq: u32, kind: u16, body: Vec<u8> },
    /// Successful reply carrying a technology-defined body.
    Reply { seq: u32, body: Vec<u8> },
    /// Positive acknowledgment with no body.
    Ack { seq: u32 },
    /// Negative acknowledgment.
    Nack { seq: u32, reason: NackReason },
    /// Trigger-driven report produced by the agent.
    Report {
        trigger_id: i32,
        kind: TriggerKind,
        cell: Option<u16>,
        body: Vec<u8>,
    },
}

/// UE handover parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverRequest {
    pub source_cell: u16,
    pub rnti: u16,
    pub target_enb: EnbId,
    pub target_cell: u16,
    pub cause: u8,
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackReason {
    UnknownCommand,
    Malformed,
    DuplicateTrigger,
    TriggerNotFound,
    Unsupported,
    /// Technology layer failure code.
    OpsFailed(i32),
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(MessageError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        bincode::deserialize(bytes).map_err(MessageError::Decode)
    }

    /// Sequence number of a controller request, if this is one.
    pub fn request_seq(&self) -> Option<u32> {
        match self {
            Message::EnbSetupRequest { seq }
            | Message::CellSetupRequest { seq, .. }
            | Message::TriggerArm { seq, .. }
            | Message::TriggerDisarm { seq, .. }
            | Message::Handover { seq, .. }
            | Message::Command { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

/// Error (de)serializing a message payload.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
}
