//! Observability events.
//!
//! The governor hands events to an [`EventSink`] and moves on. Sinks must not
//! block: a slow or full sink drops events rather than stalling admission.

use serde::{Deserialize, Serialize};

use crate::id::Owner;
use crate::types::ResourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Admitted,
    Rejected,
    Released,
    Reclaimed,
    Warned,
    Blocked,
    Unblocked,
    Quarantined,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Admitted => "admitted",
            EventKind::Rejected => "rejected",
            EventKind::Released => "released",
            EventKind::Reclaimed => "reclaimed",
            EventKind::Warned => "warned",
            EventKind::Blocked => "blocked",
            EventKind::Unblocked => "unblocked",
            EventKind::Quarantined => "quarantined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorEvent {
    pub event: EventKind,
    pub key: Owner,
    /// `None` for events about the owner as a whole (block, quarantine).
    pub resource: Option<ResourceKind>,
    pub timestamp_ms: u64,
}

impl GovernorEvent {
    pub fn new(
        event: EventKind,
        key: Owner,
        resource: Option<ResourceKind>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            event,
            key,
            resource,
            timestamp_ms,
        }
    }
}

/// Fire-and-forget event receiver.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GovernorEvent);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: GovernorEvent) {}
}
