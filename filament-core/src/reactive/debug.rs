//! Debugging Hooks
//!
//! Structured events describing individual track/trigger operations, fed to
//! per-watcher `on_track`/`on_trigger` hooks. Events are only constructed
//! and delivered in debug builds; release builds pay nothing for them.

use std::sync::Arc;

use super::key::Key;
use super::ops::{TrackOp, TriggerOp};
use super::target::TargetId;
use super::value::Value;

/// Whether a debug event describes a read or a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugOp {
    /// A dependency was recorded.
    Track(TrackOp),

    /// A dependency was notified.
    Trigger(TriggerOp),
}

/// A structured description of one track or trigger operation.
#[derive(Debug, Clone)]
pub struct DebuggerEvent {
    /// Identity of the target involved.
    pub target: TargetId,

    /// What happened.
    pub op: DebugOp,

    /// The key involved, if the operation names one.
    pub key: Option<Key>,

    /// The incoming value, for mutations.
    pub new_value: Option<Value>,

    /// The previous value, for mutations.
    pub old_value: Option<Value>,
}

impl DebuggerEvent {
    /// Build a track event.
    pub(crate) fn track(target: TargetId, op: TrackOp, key: Key) -> Self {
        Self {
            target,
            op: DebugOp::Track(op),
            key: Some(key),
            new_value: None,
            old_value: None,
        }
    }

    /// Build a trigger event.
    pub(crate) fn trigger(
        target: TargetId,
        op: TriggerOp,
        key: Option<Key>,
        new_value: Option<Value>,
        old_value: Option<Value>,
    ) -> Self {
        Self {
            target,
            op: DebugOp::Trigger(op),
            key,
            new_value,
            old_value,
        }
    }
}

/// A hook receiving debug events.
pub type DebugHook = Arc<dyn Fn(&DebuggerEvent) + Send + Sync>;
