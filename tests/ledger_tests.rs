//! Ledger accounting under contention, and quarantine recovery.

mod common;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use common::{config_with_cap, harness, Socket};
use warden_core::prelude::*;
use warden_ledger::Ledger;

#[test]
fn test_ledger_concurrent_increments() {
    let ledger = Arc::new(Ledger::new(Arc::new(SystemClock)));
    let owner = Owner::tenant("acme");
    let mut handles = vec![];

    for _ in 0..8 {
        let ledger = Arc::clone(&ledger);
        let owner = owner.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..1_000 {
                ledger
                    .increment(&owner, ResourceKind::ConcurrentRequests, 1.0)
                    .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    let snapshot = ledger.snapshot(&owner).unwrap();
    assert_eq!(snapshot.usage.get(ResourceKind::ConcurrentRequests), 8_000.0);
    assert_eq!(ledger.stats().increments, 8_000);
}

#[test]
fn test_ledger_check_then_increment_is_atomic() {
    let ledger = Arc::new(Ledger::new(Arc::new(SystemClock)));
    let owner = Owner::user("alice");
    let limit = 10.0;
    let mut handles = vec![];

    for _ in 0..16 {
        let ledger = Arc::clone(&ledger);
        let owner = owner.clone();
        handles.push(thread::spawn(move || {
            let mut admitted = 0;
            for _ in 0..50 {
                let ok = ledger
                    .transact(&owner, |account| {
                        if account.get(ResourceKind::Connections) + 1.0 > limit {
                            return false;
                        }
                        account.increment(ResourceKind::Connections, 1.0);
                        true
                    })
                    .unwrap();
                if ok {
                    admitted += 1;
                }
            }
            admitted
        }));
    }

    let total: usize = handles
        .into_iter()
        .map(|h| h.join().expect("Thread panicked"))
        .sum();
    assert_eq!(total, 10);
    assert_eq!(
        ledger.snapshot(&owner).unwrap().usage.get(ResourceKind::Connections),
        limit
    );
}

#[test]
fn test_concurrent_add_and_remove_balance_out() {
    let h = harness(config_with_cap(4));
    let sockets: Vec<Arc<Socket>> = (0..4).map(|_| Socket::open()).collect();
    let mut handles = vec![];

    for (i, socket) in sockets.iter().enumerate() {
        let governor = Arc::clone(&h.governor);
        let weak = socket.weak();
        handles.push(thread::spawn(move || {
            for round in 0..200 {
                let id = ConnectionId::from(format!("c{i}-{round}"));
                governor
                    .add_connection(
                        UserId::from("alice"),
                        id.clone(),
                        ThreadId::from("t"),
                        weak.clone(),
                    )
                    .unwrap();
                assert!(governor.remove_connection(&id).unwrap());
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    assert_eq!(h.connection_usage("alice"), 0.0);
    assert!(h.governor.active_connections(&UserId::from("alice")).is_empty());
    let stats = h.governor.ledger_stats();
    assert_eq!(stats.increments, 800);
    assert_eq!(stats.decrements, 800);
    assert_eq!(stats.clamped_decrements, 0);
}

#[test]
fn test_poisoned_owner_is_quarantined_and_recoverable() {
    let h = harness(config_with_cap(3));
    let _sockets = h.connect_many("alice", 2);
    let _bob = h.connect_many("bob", 1);
    let alice = Owner::user("alice");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        h.governor
            .ledger()
            .transact(&alice, |_account| panic!("bug inside critical section"))
    }));
    assert!(outcome.is_err());

    let socket = Socket::open();
    let err = h
        .governor
        .add_connection(
            UserId::from("alice"),
            ConnectionId::from("alice-new"),
            ThreadId::from("t"),
            socket.weak(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InternalConsistency { .. }));
    assert!(!err.is_recoverable());
    assert_eq!(h.sink.count(EventKind::Quarantined), 1);

    // Later calls keep failing without new quarantine events.
    assert!(h.governor.usage(&alice).is_err());
    assert!(h
        .governor
        .remove_connection(&ConnectionId::from("alice-c0"))
        .is_err());
    assert_eq!(h.sink.count(EventKind::Quarantined), 1);
    assert_eq!(h.governor.ledger_stats().quarantines, 1);

    // Unrelated owners keep working.
    assert!(h.governor.remove_connection(&ConnectionId::from("bob-c0")).unwrap());

    // The sweep counts the failure and carries on.
    drop(_sockets);
    let report = h.governor.reclaim_now();
    assert_eq!(report.failures, 2);
    assert_eq!(report.reclaimed_connections, 0);

    assert!(h.governor.lift_quarantine(&alice));
    assert!(!h.governor.lift_quarantine(&alice));
    assert_eq!(h.connection_usage("alice"), 2.0);

    let report = h.governor.reclaim_now();
    assert_eq!(report.reclaimed_connections, 2);
    assert_eq!(h.connection_usage("alice"), 0.0);

    let (sweeps, failures) = h.governor.reclaim_counters();
    assert_eq!(sweeps, 2);
    assert_eq!(failures, 2);
}

#[test]
fn test_non_finite_amount_is_rejected_at_the_boundary() {
    let err = ResourceRequest::one(ResourceKind::CpuCores, f64::NAN).unwrap_err();
    assert!(matches!(err, Error::InvalidAmount { .. }));
    let err = ResourceRequest::one(ResourceKind::MemoryMb, -1.0).unwrap_err();
    assert!(matches!(err, Error::InvalidAmount { .. }));
    let err = ResourceRequest::one(ResourceKind::Connections, 1.5).unwrap_err();
    assert!(matches!(err, Error::InvalidAmount { .. }));
}
