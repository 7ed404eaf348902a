//! Event sinks and the fatal-error escalation path.
//!
//! Sinks never block the caller. Wire [`ChannelSink`] to an exporter task in
//! the binary layer if events need to leave the process.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use warden_core::error::Error;
use warden_core::event::{EventKind, EventSink, GovernorEvent};

/// Logs every event as a structured `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[cfg(feature = "tracing")]
impl EventSink for TracingSink {
    fn emit(&self, event: GovernorEvent) {
        let resource = event.resource.map(|r| r.as_str()).unwrap_or("-");
        match event.event {
            EventKind::Quarantined => tracing::error!(
                event = event.event.as_str(),
                key = %event.key,
                resource,
                timestamp_ms = event.timestamp_ms,
                "governor event"
            ),
            EventKind::Rejected | EventKind::Warned | EventKind::Blocked => tracing::warn!(
                event = event.event.as_str(),
                key = %event.key,
                resource,
                timestamp_ms = event.timestamp_ms,
                "governor event"
            ),
            _ => tracing::info!(
                event = event.event.as_str(),
                key = %event.key,
                resource,
                timestamp_ms = event.timestamp_ms,
                "governor event"
            ),
        }
    }
}

#[cfg(not(feature = "tracing"))]
impl EventSink for TracingSink {
    fn emit(&self, _event: GovernorEvent) {}
}

/// Forwards events into a bounded channel. Full channel: the event is
/// dropped and counted.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<GovernorEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<GovernorEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost to a full or closed channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: GovernorEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Turn a ledger failure into the public taxonomy. First-time failures
/// (poisoned lock, non-finite counter) are reported to the sink as a
/// quarantine; repeat calls against an already-quarantined owner are not.
pub(crate) fn escalate(sink: &dyn EventSink, now_ms: u64, err: warden_ledger::Error) -> Error {
    if !matches!(err, warden_ledger::Error::Quarantined { .. }) {
        sink.emit(GovernorEvent::new(
            EventKind::Quarantined,
            err.owner().clone(),
            None,
            now_ms,
        ));
    }
    err.into()
}
