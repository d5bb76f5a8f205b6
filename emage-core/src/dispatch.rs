//! Host-driven dispatch: AgentCore turns inbound payloads into ops calls and replies, and
//! local events into reports. No I/O; the host does the sending.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::ops::{AgentOps, OpsError, OpsResult};
use crate::protocol::{EnbId, Message, NackReason, PROTOCOL_VERSION};
use crate::trigger::{Trigger, TriggerError, TriggerKind, TriggerTable};

/// A locally observed event the technology layer may want to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEvent {
    pub kind: TriggerKind,
    pub cell: Option<u16>,
}

impl LocalEvent {
    pub fn new(kind: TriggerKind, cell: Option<u16>) -> Self {
        Self { kind, cell }
    }
}

/// Per-agent state that does not depend on the transport: identity, technology callbacks and
/// the trigger table.
pub struct AgentCore {
    enb_id: EnbId,
    ops: Arc<dyn AgentOps>,
    triggers: TriggerTable,
}

impl AgentCore {
    pub fn new(enb_id: EnbId, ops: Arc<dyn AgentOps>) -> Self {
        Self {
            enb_id,
            ops,
            triggers: TriggerTable::new(),
        }
    }

    pub fn enb_id(&self) -> EnbId {
        self.enb_id
    }

    pub fn ops(&self) -> &dyn AgentOps {
        self.ops.as_ref()
    }

    pub fn triggers(&self) -> &TriggerTable {
        &self.triggers
    }

    /// First message of every controller session.
    pub fn hello(&self) -> Message {
        Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            enb_id: self.enb_id,
        }
    }

    /// Handle one inbound payload. Returns the reply to send back on the same session, if any.
    /// Failures are answered with a `Nack`; none of them is fatal to the session.
    pub fn on_message_received(&self, payload: &[u8]) -> Option<Message> {
        let msg = match Message::from_bytes(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(enb_id = self.enb_id, error = %e, "dropping malformed message");
                return Some(Message::Nack {
                    seq: 0,
                    reason: NackReason::Malformed,
                });
            }
        };
        debug!(enb_id = self.enb_id, ?msg, "inbound");

        match msg {
            Message::EnbSetupRequest { seq } => {
                self.reply("enb_setup_request", seq, self.ops.enb_setup_request())
            }
            Message::CellSetupRequest { seq, cell_id } => self.reply(
                "cell_setup_request",
                seq,
                self.ops.cell_setup_request(cell_id),
            ),
            Message::TriggerArm {
                seq,
                trigger_id,
                kind,
                target_cell,
            } => Some(
                match self
                    .triggers
                    .arm(Trigger::new(trigger_id, kind, target_cell))
                {
                    Ok(()) => {
                        debug!(
                            enb_id = self.enb_id,
                            trigger_id,
                            ?kind,
                            ?target_cell,
                            "trigger armed"
                        );
                        Message::Ack { seq }
                    }
                    Err(e) => self.trigger_nack(seq, e),
                },
            ),
            Message::TriggerDisarm { seq, trigger_id } => {
                Some(match self.triggers.disarm(trigger_id) {
                    Ok(_) => {
                        debug!(enb_id = self.enb_id, trigger_id, "trigger disarmed");
                        Message::Ack { seq }
                    }
                    Err(e) => self.trigger_nack(seq, e),
                })
            }
            Message::Handover { seq, request } => {
                self.reply("handover_ue", seq, self.ops.handover_ue(&request))
            }
            Message::Command { seq, kind, body } => {
                match self.ops.handle_command(kind, &body) {
                    Err(OpsError::Unsupported) => {
                        warn!(enb_id = self.enb_id, kind, "unknown command");
                        Some(Message::Nack {
                            seq,
                            reason: NackReason::UnknownCommand,
                        })
                    }
                    other => self.reply("handle_command", seq, other),
                }
            }
            Message::Ack { seq } | Message::Nack { seq, .. } => {
                debug!(enb_id = self.enb_id, seq, "controller acknowledgment ignored");
                None
            }
            Message::Hello { .. } | Message::Reply { .. } | Message::Report { .. } => {
                warn!(enb_id = self.enb_id, "agent-side message received from controller");
                Some(Message::Nack {
                    seq: 0,
                    reason: NackReason::UnknownCommand,
                })
            }
        }
    }

    fn reply(&self, op: &'static str, seq: u32, result: OpsResult) -> Option<Message> {
        match result {
            Ok(Some(body)) => Some(Message::Reply { seq, body }),
            Ok(None) => None,
            Err(e) => {
                warn!(enb_id = self.enb_id, op, error = %e, "technology callback failed");
                let reason = match e {
                    OpsError::Unsupported => NackReason::Unsupported,
                    other => NackReason::OpsFailed(other.code()),
                };
                Some(Message::Nack { seq, reason })
            }
        }
    }

    fn trigger_nack(&self, seq: u32, e: TriggerError) -> Message {
        warn!(enb_id = self.enb_id, error = %e, "trigger command refused");
        let reason = match e {
            TriggerError::DuplicateId(_) => NackReason::DuplicateTrigger,
            TriggerError::NotFound(_) => NackReason::TriggerNotFound,
        };
        Message::Nack { seq, reason }
    }

    /// Build a report for `event` under `trigger_id`, or `None` if no matching trigger is armed.
    /// `build` is only called once the trigger gate has passed.
    pub fn prepare_report<F>(&self, trigger_id: i32, event: LocalEvent, build: F) -> Option<Message>
    where
        F: FnOnce() -> Vec<u8>,
    {
        if !self
            .triggers
            .is_active_for(trigger_id, event.kind, event.cell)
        {
            return None;
        }
        Some(Message::Report {
            trigger_id,
            kind: event.kind,
            cell: event.cell,
            body: build(),
        })
    }
}
