//! Per-agent trigger table: which reports the controller has asked for.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Kinds of trigger the controller can arm. Discriminants match the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TriggerKind {
    None = 0,
    /// UE state transitions.
    UesIdReport = 1,
    /// RRC measurements.
    RrcMeas = 2,
    /// RRC measurement configuration.
    RrcMeasConf = 3,
    /// Cell statistics.
    CellStats = 4,
}

impl TryFrom<i32> for TriggerKind {
    type Error = i32;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => TriggerKind::None,
            1 => TriggerKind::UesIdReport,
            2 => TriggerKind::RrcMeas,
            3 => TriggerKind::RrcMeasConf,
            4 => TriggerKind::CellStats,
            other => return Err(other),
        })
    }
}

/// An armed trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub trigger_id: i32,
    pub kind: TriggerKind,
    /// Cell the reports are restricted to; `None` means any cell.
    pub target_cell: Option<u16>,
}

impl Trigger {
    pub fn new(trigger_id: i32, kind: TriggerKind, target_cell: Option<u16>) -> Self {
        Self {
            trigger_id,
            kind,
            target_cell,
        }
    }

    /// Negative ids are installed by the agent itself (one-shot or locally scheduled),
    /// not armed by the controller.
    pub fn is_agent_scheduled(&self) -> bool {
        self.trigger_id < 0
    }

    /// Whether an event of `kind` on `cell` falls under this trigger.
    pub fn matches(&self, kind: TriggerKind, cell: Option<u16>) -> bool {
        if self.kind != kind {
            return false;
        }
        match (self.target_cell, cell) {
            (None, _) => true,
            (Some(t), Some(c)) => t == c,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("trigger {0} is already armed")]
    DuplicateId(i32),
    #[error("trigger {0} is not armed")]
    NotFound(i32),
}

/// Set of armed triggers for one agent. Every operation takes the lock for a single
/// insert/remove/lookup, so same-id operations are linearized and nothing blocks.
#[derive(Debug, Default)]
pub struct TriggerTable {
    triggers: Mutex<HashMap<i32, Trigger>>,
}

impl TriggerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i32, Trigger>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.triggers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a trigger. An existing trigger with the same id is left untouched.
    pub fn arm(&self, trigger: Trigger) -> Result<(), TriggerError> {
        let mut t = self.lock();
        if t.contains_key(&trigger.trigger_id) {
            return Err(TriggerError::DuplicateId(trigger.trigger_id));
        }
        t.insert(trigger.trigger_id, trigger);
        Ok(())
    }

    pub fn disarm(&self, trigger_id: i32) -> Result<Trigger, TriggerError> {
        self.lock()
            .remove(&trigger_id)
            .ok_or(TriggerError::NotFound(trigger_id))
    }

    /// True if `trigger_id` is armed with the given kind.
    pub fn is_active(&self, trigger_id: i32, kind: TriggerKind) -> bool {
        self.lock()
            .get(&trigger_id)
            .is_some_and(|t| t.kind == kind)
    }

    /// True if `trigger_id` is armed and covers an event of `kind` on `cell`.
    pub fn is_active_for(&self, trigger_id: i32, kind: TriggerKind, cell: Option<u16>) -> bool {
        self.lock()
            .get(&trigger_id)
            .is_some_and(|t| t.matches(kind, cell))
    }

    pub fn get(&self, trigger_id: i32) -> Option<Trigger> {
        self.lock().get(&trigger_id).copied()
    }

    /// Armed triggers of `kind`, ordered by id.
    pub fn armed(&self, kind: TriggerKind) -> Vec<Trigger> {
        let mut out: Vec<Trigger> = self
            .lock()
            .values()
            .filter(|t| t.kind == kind)
            .copied()
            .collect();
        out.sort_by_key(|t| t.trigger_id);
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
