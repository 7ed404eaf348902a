//! Tenant allocation leases.
//!
//! Every tenant allocation is recorded as a lease holding exactly the amounts
//! it added to the ledger. Deallocation consumes lease amounts oldest first,
//! and the reclaimer takes back leases whose expiry has passed. Lease amounts
//! are only changed inside the tenant's ledger critical section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use warden_core::id::{LeaseId, Owner, TenantId};
use warden_core::types::{ResourceAmounts, ResourceRequest};

use crate::holder::{HolderState, StateCell};

pub struct Lease {
    lease_id: LeaseId,
    tenant_id: TenantId,
    /// Insertion order; ties on `allocated_at_ms` are broken by it.
    seq: u64,
    held: Mutex<ResourceAmounts>,
    allocated_at_ms: u64,
    expires_at_ms: AtomicU64,
    state: StateCell,
}

impl Lease {
    fn new(
        tenant_id: TenantId,
        request: &ResourceRequest,
        seq: u64,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Self {
        Self {
            lease_id: LeaseId::generate(),
            tenant_id,
            seq,
            held: Mutex::new(request.amounts().clone()),
            allocated_at_ms: now_ms,
            expires_at_ms: AtomicU64::new(now_ms.saturating_add(ttl_ms)),
            state: StateCell::active(),
        }
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn owner(&self) -> Owner {
        Owner::Tenant(self.tenant_id.clone())
    }

    pub fn allocated_at_ms(&self) -> u64 {
        self.allocated_at_ms
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms.load(Ordering::Acquire)
    }

    pub fn state(&self) -> HolderState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms() <= now_ms
    }

    /// Amounts still held against the tenant's usage.
    pub fn held(&self) -> ResourceAmounts {
        self.held_mut().clone()
    }

    pub(crate) fn held_mut(&self) -> MutexGuard<'_, ResourceAmounts> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn extend(&self, expires_at_ms: u64) {
        self.expires_at_ms.store(expires_at_ms, Ordering::Release);
    }

    pub(crate) fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn info(&self) -> LeaseInfo {
        LeaseInfo {
            lease_id: self.lease_id,
            tenant_id: self.tenant_id.clone(),
            held: self.held(),
            allocated_at_ms: self.allocated_at_ms,
            expires_at_ms: self.expires_at_ms(),
            state: self.state(),
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("lease_id", &self.lease_id)
            .field("tenant_id", &self.tenant_id)
            .field("expires_at_ms", &self.expires_at_ms())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseInfo {
    pub lease_id: LeaseId,
    pub tenant_id: TenantId,
    pub held: ResourceAmounts,
    pub allocated_at_ms: u64,
    pub expires_at_ms: u64,
    pub state: HolderState,
}

#[derive(Default)]
pub struct LeaseTable {
    by_id: RwLock<HashMap<LeaseId, Arc<Lease>>>,
    next_seq: AtomicU64,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new lease for `request`.
    pub(crate) fn open(
        &self,
        tenant_id: TenantId,
        request: &ResourceRequest,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Arc<Lease> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let lease = Arc::new(Lease::new(tenant_id, request, seq, now_ms, ttl_ms));
        self.write().insert(lease.lease_id, Arc::clone(&lease));
        lease
    }

    pub fn get(&self, lease_id: &LeaseId) -> Option<Arc<Lease>> {
        self.read().get(lease_id).cloned()
    }

    pub(crate) fn forget(&self, lease_id: &LeaseId) {
        self.write().remove(lease_id);
    }

    /// Drop every lease of `tenant_id`; used by cascade unregistration.
    pub(crate) fn forget_tenant(&self, tenant_id: &TenantId) -> Vec<Arc<Lease>> {
        let mut by_id = self.write();
        let ids: Vec<LeaseId> = by_id
            .values()
            .filter(|l| &l.tenant_id == tenant_id)
            .map(|l| l.lease_id)
            .collect();
        ids.iter().filter_map(|id| by_id.remove(id)).collect()
    }

    /// ACTIVE leases of `tenant_id`, oldest first.
    pub fn active_for(&self, tenant_id: &TenantId) -> Vec<Arc<Lease>> {
        self.select(|l| l.is_active() && &l.tenant_id == tenant_id)
    }

    /// Leases matching `pred`, oldest first.
    pub(crate) fn select(&self, pred: impl Fn(&Lease) -> bool) -> Vec<Arc<Lease>> {
        let mut out: Vec<Arc<Lease>> = self
            .read()
            .values()
            .filter(|l| pred(l))
            .cloned()
            .collect();
        out.sort_by_key(|l| (l.allocated_at_ms, l.seq));
        out
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<LeaseId, Arc<Lease>>> {
        self.by_id.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<LeaseId, Arc<Lease>>> {
        self.by_id.write().unwrap_or_else(PoisonError::into_inner)
    }
}
