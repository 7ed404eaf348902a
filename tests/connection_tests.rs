//! Per-user connection admission, release and reclamation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use common::{config_with_cap, governor_with, harness, OnFirstReclaim, Socket};
use warden_core::prelude::*;
use warden_exec::HolderState;

#[test]
fn test_cap_is_enforced() {
    let h = harness(config_with_cap(3));
    let _sockets = h.connect_many("alice", 3);

    let extra = Socket::open();
    let err = h
        .governor
        .add_connection(
            UserId::from("alice"),
            ConnectionId::from("alice-extra"),
            ThreadId::from("t9"),
            extra.weak(),
        )
        .unwrap_err();
    match &err {
        Error::QuotaExceeded { key, violations } => {
            assert_eq!(key, "user:alice");
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].resource, ResourceKind::Connections);
            assert_eq!(violations[0].available(), 0.0);
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
    assert!(err.is_recoverable());
    assert_eq!(err.to_string(), "user:alice: Connection quota exceeded: 4 > 3");

    // Other users are unaffected.
    let _bob = h.connect_many("bob", 3);
    assert_eq!(h.connection_usage("alice"), 3.0);
    assert_eq!(h.connection_usage("bob"), 3.0);
}

#[test]
fn test_concurrent_adds_never_exceed_cap() {
    let cap = 5;
    let h = harness(config_with_cap(cap));
    let admitted = Arc::new(AtomicUsize::new(0));
    let sockets: Vec<Arc<Socket>> = (0..32).map(|_| Socket::open()).collect();
    let mut handles = vec![];

    for (i, socket) in sockets.iter().enumerate() {
        let governor = Arc::clone(&h.governor);
        let admitted = Arc::clone(&admitted);
        let weak = socket.weak();
        handles.push(thread::spawn(move || {
            match governor.add_connection(
                UserId::from("alice"),
                ConnectionId::from(format!("c{i}")),
                ThreadId::from(format!("t{i}")),
                weak,
            ) {
                Ok(_) => {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
                Err(Error::QuotaExceeded { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
            assert!(governor.active_connections(&UserId::from("alice")).len() <= cap);
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    assert_eq!(admitted.load(Ordering::SeqCst), cap);
    assert_eq!(h.governor.active_connections(&UserId::from("alice")).len(), cap);
    assert_eq!(h.connection_usage("alice"), cap as f64);
}

#[test]
fn test_remove_twice_changes_ledger_once() {
    let h = harness(config_with_cap(5));
    let _sockets = h.connect_many("alice", 2);
    let id = ConnectionId::from("alice-c0");
    let before = h.governor.ledger_stats();

    assert!(h.governor.remove_connection(&id).unwrap());
    let after_first = h.governor.ledger_stats();
    assert_eq!(after_first.decrements, before.decrements + 1);
    assert_eq!(h.connection_usage("alice"), 1.0);

    assert!(!h.governor.remove_connection(&id).unwrap());
    let after_second = h.governor.ledger_stats();
    assert_eq!(after_second.decrements, after_first.decrements);
    assert_eq!(after_second.clamped_decrements, 0);
    assert_eq!(h.connection_usage("alice"), 1.0);

    assert!(h.governor.connection(&id).is_none());
    assert!(!h
        .governor
        .remove_connection(&ConnectionId::from("never-seen"))
        .unwrap());
}

#[test]
fn test_duplicate_connection_id_is_rejected() {
    let h = harness(config_with_cap(5));
    let _sockets = h.connect_many("alice", 1);
    let socket = Socket::open();
    let err = h
        .governor
        .add_connection(
            UserId::from("alice"),
            ConnectionId::from("alice-c0"),
            ThreadId::from("t1"),
            socket.weak(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyRegistered { .. }));
    assert_eq!(h.connection_usage("alice"), 1.0);
}

#[test]
fn test_closed_transports_at_cap_are_reclaimed_on_demand() {
    let cap = 5;
    let h = harness(config_with_cap(cap));
    let sockets = h.connect_many("alice", cap);
    for socket in &sockets[..3] {
        socket.close();
    }

    let fresh: Vec<Arc<Socket>> = (0..3).map(|_| Socket::open()).collect();
    for (i, socket) in fresh.iter().enumerate() {
        h.governor
            .add_connection(
                UserId::from("alice"),
                ConnectionId::from(format!("alice-new{i}")),
                ThreadId::from("t-new"),
                socket.weak(),
            )
            .expect("reclamation frees a slot");
        assert!(h.governor.active_connections(&UserId::from("alice")).len() <= cap);
    }

    assert_eq!(h.governor.active_connections(&UserId::from("alice")).len(), cap);
    assert_eq!(h.connection_usage("alice"), cap as f64);
    assert_eq!(h.sink.count(EventKind::Reclaimed), 3);
}

#[test]
fn test_on_demand_sweep_frees_only_what_is_needed() {
    let cap = 5;
    let h = harness(config_with_cap(cap));
    let sockets = h.connect_many("alice", cap);
    let zombies: Vec<ConnectionId> = (0..3)
        .map(|i| ConnectionId::from(format!("alice-c{i}")))
        .collect();
    let zombie_handles: Vec<_> = zombies
        .iter()
        .map(|id| h.governor.connection(id).unwrap())
        .collect();
    for socket in &sockets[..3] {
        socket.close();
    }

    let socket = Socket::open();
    h.governor
        .add_connection(
            UserId::from("alice"),
            ConnectionId::from("alice-new"),
            ThreadId::from("t-new"),
            socket.weak(),
        )
        .unwrap();

    let reclaimed = zombie_handles
        .iter()
        .filter(|handle| handle.state() == HolderState::Reclaimed)
        .count();
    assert_eq!(reclaimed, 1);
    assert_eq!(h.governor.active_connections(&UserId::from("alice")).len(), cap);

    // The periodic sweep picks up the rest.
    let report = h.governor.reclaim_now();
    assert_eq!(report.reclaimed_connections, 2);
    assert_eq!(report.failures, 0);
    assert!(!report.timed_out);
    assert_eq!(h.connection_usage("alice"), (cap - 2) as f64);
}

#[test]
fn test_heartbeat_timeout_reclaims_silent_connections() {
    let h = harness(config_with_cap(5));
    let _sockets = h.connect_many("alice", 2);
    let live = ConnectionId::from("alice-c0");
    let silent = ConnectionId::from("alice-c1");

    h.clock.advance(60_000);
    h.governor.touch(&live, h.clock.now_ms()).unwrap();
    h.clock.advance(31_000);

    let report = h.governor.reclaim_now();
    assert_eq!(report.reclaimed_connections, 1);
    assert!(h.governor.connection(&live).is_some());
    assert!(h.governor.connection(&silent).is_none());
    assert_eq!(h.connection_usage("alice"), 1.0);

    let err = h.governor.touch(&silent, h.clock.now_ms()).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn test_heartbeat_during_sweep_keeps_connection() {
    let config = config_with_cap(2);
    let timeout = config.heartbeat_timeout_ms;
    let clock = Arc::new(ManualClock::new(common::START_MS));
    let sink = Arc::new(OnFirstReclaim::default());
    let governor = governor_with(config, &clock, Arc::clone(&sink) as Arc<dyn EventSink>);

    let sockets: Vec<Arc<Socket>> = (0..2).map(|_| Socket::open()).collect();
    for (i, socket) in sockets.iter().enumerate() {
        governor
            .add_connection(
                UserId::from("alice"),
                ConnectionId::from(format!("c{i}")),
                ThreadId::from("t"),
                socket.weak(),
            )
            .unwrap();
    }
    clock.advance(timeout + 1);

    // Both look silent to the sweep; c1 heartbeats while c0 is being reclaimed.
    let touched = Arc::new(Mutex::new(None));
    {
        let governor = Arc::clone(&governor);
        let clock = Arc::clone(&clock);
        let touched = Arc::clone(&touched);
        sink.set(move || {
            let result = governor.touch(&ConnectionId::from("c1"), clock.now_ms());
            *touched.lock().unwrap() = Some(result);
        });
    }

    let report = governor.reclaim_now();
    assert_eq!(report.reclaimed_connections, 1);
    assert!(touched.lock().unwrap().take().unwrap().is_ok());

    let c1 = governor.connection(&ConnectionId::from("c1")).unwrap();
    assert_eq!(c1.state(), HolderState::Active);
    assert!(governor.connection(&ConnectionId::from("c0")).is_none());
    let key = ResourceKey::new(Owner::user("alice"), ResourceKind::Connections);
    assert_eq!(governor.counter(&key).unwrap(), 1.0);

    // Only the slot of the reclaimed connection is free.
    let fresh: Vec<Arc<Socket>> = (0..2).map(|_| Socket::open()).collect();
    governor
        .add_connection(
            UserId::from("alice"),
            ConnectionId::from("c2"),
            ThreadId::from("t"),
            fresh[0].weak(),
        )
        .unwrap();
    let err = governor
        .add_connection(
            UserId::from("alice"),
            ConnectionId::from("c3"),
            ThreadId::from("t"),
            fresh[1].weak(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { .. }));
}

#[test]
fn test_cap_holds_while_sweeps_race_admissions() {
    let cap = 5;
    let h = harness(config_with_cap(cap));
    let sockets = h.connect_many("alice", cap);
    for socket in &sockets[..3] {
        socket.close();
    }

    let adders = 8;
    let sweepers = 2;
    let barrier = Arc::new(Barrier::new(adders + sweepers));
    let admitted = Arc::new(AtomicUsize::new(0));
    let fresh: Vec<Arc<Socket>> = (0..adders).map(|_| Socket::open()).collect();
    let mut handles = vec![];

    for (i, socket) in fresh.iter().enumerate() {
        let governor = Arc::clone(&h.governor);
        let barrier = Arc::clone(&barrier);
        let admitted = Arc::clone(&admitted);
        let weak = socket.weak();
        handles.push(thread::spawn(move || {
            barrier.wait();
            match governor.add_connection(
                UserId::from("alice"),
                ConnectionId::from(format!("new-{i}")),
                ThreadId::from(format!("t{i}")),
                weak,
            ) {
                Ok(_) => {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
                Err(Error::QuotaExceeded { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
            assert!(governor.active_connections(&UserId::from("alice")).len() <= cap);
        }));
    }
    for _ in 0..sweepers {
        let governor = Arc::clone(&h.governor);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..20 {
                governor.reclaim_now();
                assert!(governor.active_connections(&UserId::from("alice")).len() <= cap);
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    // The zombies freed at most three slots.
    let admitted = admitted.load(Ordering::SeqCst);
    assert!(admitted <= 3);
    h.governor.reclaim_now();
    let active = h.governor.active_connections(&UserId::from("alice")).len();
    assert_eq!(active, 2 + admitted);
    assert_eq!(h.connection_usage("alice"), active as f64);
    assert_eq!(h.sink.count(EventKind::Reclaimed), 3);
    assert_eq!(h.governor.ledger_stats().clamped_decrements, 0);
}

#[test]
fn test_dropped_transport_counts_as_closed() {
    let h = harness(config_with_cap(5));
    let sockets = h.connect_many("alice", 2);
    drop(sockets);

    let report = h.governor.reclaim_now();
    assert_eq!(report.reclaimed_connections, 2);
    assert_eq!(h.connection_usage("alice"), 0.0);
}

#[test]
fn test_reclaimed_handle_is_not_released_twice() {
    let h = harness(config_with_cap(5));
    let sockets = h.connect_many("alice", 1);
    let id = ConnectionId::from("alice-c0");
    let handle = h.governor.connection(&id).unwrap();
    sockets[0].close();

    assert_eq!(h.governor.reclaim_now().reclaimed_connections, 1);
    assert_eq!(handle.state(), HolderState::Reclaimed);
    assert!(!h.governor.remove_connection(&id).unwrap());
    assert_eq!(h.governor.reclaim_now().reclaimed_connections, 0);
    assert_eq!(h.connection_usage("alice"), 0.0);
    assert_eq!(h.governor.ledger_stats().clamped_decrements, 0);
}

#[test]
fn test_guard_releases_on_abort() {
    let h = harness(config_with_cap(2));
    let socket = Socket::open();

    {
        let guard = h
            .governor
            .add_connection_guarded(
                UserId::from("alice"),
                ConnectionId::from("handshake"),
                ThreadId::from("t1"),
                socket.weak(),
            )
            .unwrap();
        assert!(guard.handle().is_active());
        assert_eq!(h.connection_usage("alice"), 1.0);
        // Client disconnects before the handshake completes.
    }
    assert_eq!(h.connection_usage("alice"), 0.0);
    assert!(h.governor.connection(&ConnectionId::from("handshake")).is_none());

    let guard = h
        .governor
        .add_connection_guarded(
            UserId::from("alice"),
            ConnectionId::from("handshake"),
            ThreadId::from("t1"),
            socket.weak(),
        )
        .unwrap();
    let handle = guard.commit();
    assert!(handle.is_active());
    assert_eq!(h.connection_usage("alice"), 1.0);
}

#[test]
fn test_connection_events() {
    let h = harness(config_with_cap(1));
    let _sockets = h.connect_many("alice", 1);
    let socket = Socket::open();
    let _ = h.governor.add_connection(
        UserId::from("alice"),
        ConnectionId::from("alice-extra"),
        ThreadId::from("t1"),
        socket.weak(),
    );
    h.governor
        .remove_connection(&ConnectionId::from("alice-c0"))
        .unwrap();

    let kinds: Vec<EventKind> = h.sink.events().iter().map(|e| e.event).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Admitted, EventKind::Rejected, EventKind::Released]
    );
    for event in h.sink.events() {
        assert_eq!(event.key, Owner::user("alice"));
        assert_eq!(event.resource, Some(ResourceKind::Connections));
        assert_eq!(event.timestamp_ms, common::START_MS);
    }
}

#[test]
fn test_connection_info_serializes() {
    let h = harness(config_with_cap(1));
    let _sockets = h.connect_many("alice", 1);
    let info = h
        .governor
        .connection(&ConnectionId::from("alice-c0"))
        .unwrap()
        .info();
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["user_id"], "alice");
    assert_eq!(json["state"], "ACTIVE");
    assert_eq!(json["last_seen_ms"], common::START_MS);
}
