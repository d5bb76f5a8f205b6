//! eNB control agent core.
//! Host-driven: no I/O; the host feeds inbound payloads and local events and sends what comes back.

pub mod dispatch;
pub mod ops;
pub mod outbox;
pub mod protocol;
pub mod trigger;
pub mod wire;

pub use dispatch::{AgentCore, LocalEvent};
pub use ops::{AgentOps, OpsError, OpsResult};
pub use outbox::ReportBuffer;
pub use protocol::{EnbId, HandoverRequest, Message, MessageError, NackReason, PROTOCOL_VERSION};
pub use trigger::{Trigger, TriggerError, TriggerKind, TriggerTable};
pub use wire::{
    decode_frame, encode_frame, encode_message, FrameBuffer, FrameDecodeError, FrameEncodeError,
};
