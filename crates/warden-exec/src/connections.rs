//! Connection handles and the table that indexes them.
//!
//! Handles are inserted and retired only inside the owning user's ledger
//! critical section. The table lock is always taken after the account lock,
//! never before.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::Serialize;

use warden_core::error::{Error, Result};
use warden_core::id::{ConnectionId, Owner, ThreadId, UserId};
use warden_core::transport::{self, Transport};
use warden_core::types::{ResourceAmounts, ResourceKind};

use crate::holder::{HolderState, StateCell};

/// One admitted connection. The governor holds only a weak reference to the
/// transport; the socket belongs to the caller.
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    user_id: UserId,
    thread_id: ThreadId,
    transport: Weak<dyn Transport>,
    established_at_ms: u64,
    last_seen_ms: AtomicU64,
    state: StateCell,
}

impl ConnectionHandle {
    pub(crate) fn new(
        connection_id: ConnectionId,
        user_id: UserId,
        thread_id: ThreadId,
        transport: Weak<dyn Transport>,
        now_ms: u64,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            thread_id,
            transport,
            established_at_ms: now_ms,
            last_seen_ms: AtomicU64::new(now_ms),
            state: StateCell::active(),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn owner(&self) -> Owner {
        Owner::User(self.user_id.clone())
    }

    pub fn transport(&self) -> Weak<dyn Transport> {
        Weak::clone(&self.transport)
    }

    pub fn established_at_ms(&self) -> u64 {
        self.established_at_ms
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Acquire)
    }

    pub fn state(&self) -> HolderState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Heartbeat. Timestamps never move backwards.
    pub(crate) fn touch(&self, timestamp_ms: u64) {
        self.last_seen_ms.fetch_max(timestamp_ms, Ordering::AcqRel);
    }

    /// Closed or dropped transport, or silent for longer than `heartbeat_timeout_ms`.
    pub fn is_zombie(&self, now_ms: u64, heartbeat_timeout_ms: u64) -> bool {
        transport::is_dead(&self.transport)
            || now_ms.saturating_sub(self.last_seen_ms()) > heartbeat_timeout_ms
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    /// What this handle holds in its owner's ledger account.
    pub(crate) fn held(&self) -> ResourceAmounts {
        [(ResourceKind::Connections, 1.0)].into_iter().collect()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.connection_id.clone(),
            user_id: self.user_id.clone(),
            thread_id: self.thread_id.clone(),
            established_at_ms: self.established_at_ms,
            last_seen_ms: self.last_seen_ms(),
            state: self.state(),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("thread_id", &self.thread_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Serializable view of a [`ConnectionHandle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub thread_id: ThreadId,
    pub established_at_ms: u64,
    pub last_seen_ms: u64,
    pub state: HolderState,
}

#[derive(Default)]
pub struct ConnectionTable {
    by_id: RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, handle: Arc<ConnectionHandle>) -> Result<()> {
        let mut by_id = self.write();
        if by_id.contains_key(&handle.connection_id) {
            return Err(Error::AlreadyRegistered {
                what: "connection",
                id: handle.connection_id.to_string(),
            });
        }
        by_id.insert(handle.connection_id.clone(), handle);
        Ok(())
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.read().get(connection_id).cloned()
    }

    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.read().contains_key(connection_id)
    }

    /// Drop a retired handle from the index. Only removes that exact handle.
    pub(crate) fn forget(&self, handle: &Arc<ConnectionHandle>) {
        let mut by_id = self.write();
        if by_id
            .get(&handle.connection_id)
            .is_some_and(|h| Arc::ptr_eq(h, handle))
        {
            by_id.remove(&handle.connection_id);
        }
    }

    /// ACTIVE handles of `user`, oldest first.
    pub fn active_for(&self, user_id: &UserId) -> Vec<Arc<ConnectionHandle>> {
        self.select(|h| h.is_active() && &h.user_id == user_id)
    }

    /// Handles matching `pred`, oldest first.
    pub(crate) fn select(
        &self,
        pred: impl Fn(&ConnectionHandle) -> bool,
    ) -> Vec<Arc<ConnectionHandle>> {
        let mut out: Vec<Arc<ConnectionHandle>> = self
            .read()
            .values()
            .filter(|h| pred(h))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.established_at_ms
                .cmp(&b.established_at_ms)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<ConnectionHandle>>> {
        self.by_id.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<ConnectionHandle>>> {
        self.by_id.write().unwrap_or_else(PoisonError::into_inner)
    }
}
