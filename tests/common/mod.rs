//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use warden_core::prelude::*;
use warden_core::transport;
use warden_exec::Governor;

/// In-memory stand-in for a client socket.
pub struct Socket {
    closed: AtomicBool,
}

impl Socket {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn weak(self: &Arc<Self>) -> Weak<dyn Transport> {
        transport::downgrade(self)
    }
}

impl Transport for Socket {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GovernorEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<GovernorEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event == kind)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: GovernorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Runs a hook on the first `Reclaimed` event, while the sweep that emitted
/// it is still in progress.
#[derive(Default)]
pub struct OnFirstReclaim {
    hook: Mutex<Option<Hook>>,
}

impl OnFirstReclaim {
    pub fn set(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl EventSink for OnFirstReclaim {
    fn emit(&self, event: GovernorEvent) {
        if event.event != EventKind::Reclaimed {
            return;
        }
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

pub struct Harness {
    pub governor: Arc<Governor>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingSink>,
}

pub const START_MS: u64 = 1_700_000_000_000;

pub fn harness(config: GovernorConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(START_MS));
    let sink = Arc::new(RecordingSink::default());
    let governor = governor_with(config, &clock, Arc::clone(&sink) as Arc<dyn EventSink>);
    Harness {
        governor,
        clock,
        sink,
    }
}

pub fn governor_with(
    config: GovernorConfig,
    clock: &Arc<ManualClock>,
    sink: Arc<dyn EventSink>,
) -> Arc<Governor> {
    let governor = Governor::builder(config)
        .clock(Arc::clone(clock) as Arc<dyn Clock>)
        .sink(sink)
        .build()
        .expect("valid config");
    Arc::new(governor)
}

pub fn config_with_cap(cap: usize) -> GovernorConfig {
    GovernorConfig {
        max_connections_per_user: cap,
        ..GovernorConfig::default()
    }
}

impl Harness {
    /// Open `n` connections for `user`, returning their sockets.
    pub fn connect_many(&self, user: &str, n: usize) -> Vec<Arc<Socket>> {
        (0..n)
            .map(|i| {
                let socket = Socket::open();
                self.governor
                    .add_connection(
                        UserId::from(user),
                        ConnectionId::from(format!("{user}-c{i}")),
                        ThreadId::from(format!("t{i}")),
                        socket.weak(),
                    )
                    .expect("admission under cap");
                socket
            })
            .collect()
    }

    pub fn connection_usage(&self, user: &str) -> f64 {
        let key = ResourceKey::new(Owner::user(user), ResourceKind::Connections);
        self.governor.counter(&key).unwrap()
    }

    pub fn tenant_usage(&self, tenant: &str, kind: ResourceKind) -> f64 {
        let key = ResourceKey::new(Owner::tenant(tenant), kind);
        self.governor.counter(&key).unwrap()
    }
}

pub fn request(items: &[(ResourceKind, f64)]) -> ResourceRequest {
    ResourceRequest::new(items.iter().copied()).unwrap()
}
