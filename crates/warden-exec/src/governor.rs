//! The governor facade: the only surface callers talk to.
//!
//! Every public method is one admission-controller transaction or one
//! read. Nothing here exposes a multi-step sequence another caller could
//! interleave with.

use std::sync::{Arc, Weak};
use std::time::Duration;

use warden_core::clock::{Clock, SystemClock};
use warden_core::config::GovernorConfig;
use warden_core::error::{Error, Result};
use warden_core::event::{EventKind, EventSink, GovernorEvent, NoopSink};
use warden_core::id::{ConnectionId, LeaseId, Owner, ResourceKey, TenantId, ThreadId, UserId};
use warden_core::quota::{QuotaUpdate, TenantPolicy, TenantQuota};
use warden_core::transport::Transport;
use warden_core::types::{ResourceAmounts, ResourceKind, ResourceRequest, AMOUNT_EPSILON};
use warden_ledger::{Ledger, StatsSnapshot, UsageSnapshot};
use warden_policy::{
    EnforcementBoard, EnforcementEngine, EnforcementLevel, QuotaRegistry, Transition,
};

use crate::admission::{AdmissionController, Availability};
use crate::connections::{ConnectionHandle, ConnectionTable};
use crate::guard::{AllocationGuard, ConnectionGuard};
use crate::holder::HolderState;
use crate::leases::{Lease, LeaseInfo, LeaseTable};
use crate::metrics::escalate;
use crate::reclaim::{Reclaimer, SweepReport};
use crate::status::{utilization, TenantStatus};

/// A successful tenant allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub lease_id: LeaseId,
    pub tenant_id: TenantId,
    pub expires_at_ms: u64,
    /// Set while the tenant is throttled; callers should wait this long
    /// before their next request.
    pub throttle: Option<Duration>,
}

pub struct GovernorBuilder {
    config: GovernorConfig,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl GovernorBuilder {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            clock: None,
            sink: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Governor> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sink = self.sink.unwrap_or_else(|| Arc::new(NoopSink));

        let ledger = Arc::new(Ledger::new(Arc::clone(&clock)));
        let registry = Arc::new(QuotaRegistry::new());
        let board = Arc::new(EnforcementBoard::new());
        let reclaimer = Arc::new(Reclaimer::new(
            Arc::clone(&ledger),
            Arc::new(ConnectionTable::new()),
            Arc::new(LeaseTable::new()),
            Arc::clone(&sink),
            Arc::clone(&clock),
            self.config.heartbeat_timeout_ms,
        ));
        let engine = EnforcementEngine::new(
            Arc::clone(&registry),
            Arc::clone(&ledger),
            Arc::clone(&board),
            Arc::clone(&clock),
        );
        let admission = AdmissionController::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&board),
            Arc::clone(&reclaimer),
            Arc::clone(&sink),
            Arc::clone(&clock),
            self.config.max_connections_per_user,
            self.config.on_demand_sweep_timeout(),
        );

        #[cfg(feature = "tracing")]
        tracing::info!(config = ?self.config, "governor started");

        Ok(Governor {
            config: self.config,
            clock,
            sink,
            ledger,
            registry,
            board,
            engine,
            reclaimer,
            admission,
        })
    }
}

pub struct Governor {
    config: GovernorConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    ledger: Arc<Ledger>,
    registry: Arc<QuotaRegistry>,
    board: Arc<EnforcementBoard>,
    engine: EnforcementEngine,
    reclaimer: Arc<Reclaimer>,
    admission: AdmissionController,
}

impl Governor {
    /// Governor on the system clock with no event sink.
    pub fn new(config: GovernorConfig) -> Result<Self> {
        GovernorBuilder::new(config).build()
    }

    pub fn builder(config: GovernorConfig) -> GovernorBuilder {
        GovernorBuilder::new(config)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    // --- connections (keyed by user) ---

    pub fn add_connection(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        thread_id: ThreadId,
        transport: Weak<dyn Transport>,
    ) -> Result<Arc<ConnectionHandle>> {
        let connections = self.reclaimer.connections();
        if connections.contains(&connection_id) {
            return Err(Error::AlreadyRegistered {
                what: "connection",
                id: connection_id.to_string(),
            });
        }
        let owner = Owner::User(user_id.clone());
        let request = ResourceRequest::one(ResourceKind::Connections, 1.0)?;

        self.admission.admit(&owner, &request, |_account| {
            let handle = Arc::new(ConnectionHandle::new(
                connection_id.clone(),
                user_id.clone(),
                thread_id.clone(),
                Weak::clone(&transport),
                self.clock.now_ms(),
            ));
            connections.insert(Arc::clone(&handle))?;
            Ok(handle)
        })
    }

    /// Like [`Governor::add_connection`], but the connection is removed again
    /// when the guard drops unless it was committed.
    pub fn add_connection_guarded(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        thread_id: ThreadId,
        transport: Weak<dyn Transport>,
    ) -> Result<ConnectionGuard> {
        let handle = self.add_connection(user_id, connection_id, thread_id, transport)?;
        Ok(ConnectionGuard::new(Arc::clone(&self.reclaimer), handle))
    }

    /// Idempotent. `Ok(false)` if the connection is unknown or already gone.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> Result<bool> {
        match self.reclaimer.connections().get(connection_id) {
            Some(handle) => self.reclaimer.release_holder(&handle, HolderState::Removed),
            None => Ok(false),
        }
    }

    /// Heartbeat for an ACTIVE connection. Runs in the user's critical
    /// section so it cannot interleave with a reclamation of the handle.
    pub fn touch(&self, connection_id: &ConnectionId, timestamp_ms: u64) -> Result<()> {
        let handle = self
            .reclaimer
            .connections()
            .get(connection_id)
            .ok_or_else(|| not_found("connection", connection_id))?;
        let touched = self
            .ledger
            .transact(&handle.owner(), |_account| {
                handle.is_active().then(|| handle.touch(timestamp_ms))
            })
            .map_err(|e| self.escalate(e))?;
        touched.ok_or_else(|| not_found("connection", connection_id))
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.reclaimer.connections().get(connection_id)
    }

    pub fn active_connections(&self, user_id: &UserId) -> Vec<Arc<ConnectionHandle>> {
        self.reclaimer.connections().active_for(user_id)
    }

    // --- tenants ---

    pub fn register_tenant(
        &self,
        tenant_id: TenantId,
        quota: Option<TenantQuota>,
        policy: TenantPolicy,
    ) -> Result<TenantQuota> {
        self.registry.register(tenant_id, quota, policy)
    }

    pub fn update_tenant_quota(
        &self,
        tenant_id: &TenantId,
        update: &QuotaUpdate,
    ) -> Result<TenantQuota> {
        self.registry.update(tenant_id, update)
    }

    pub fn set_tenant_policy(&self, tenant_id: &TenantId, policy: TenantPolicy) -> Result<()> {
        self.registry.set_policy(tenant_id, policy)
    }

    /// Remove the tenant with its usage, leases and enforcement state, all in
    /// the tenant's final ledger critical section.
    pub fn unregister_tenant(&self, tenant_id: &TenantId) -> Result<()> {
        if !self.registry.contains(tenant_id) {
            return Err(not_found("tenant", tenant_id));
        }
        let owner = Owner::Tenant(tenant_id.clone());
        let leases = self.reclaimer.leases();

        self.ledger.remove(&owner, |mut account| {
            self.registry.unregister(tenant_id)?;
            for lease in leases.active_for(tenant_id) {
                match account.as_deref_mut() {
                    Some(account) => {
                        self.reclaimer
                            .retire_in(account, &lease, HolderState::Removed);
                    }
                    None => {
                        lease.state_cell().retire(HolderState::Removed);
                    }
                }
            }
            leases.forget_tenant(tenant_id);
            self.board.remove(tenant_id);

            #[cfg(feature = "tracing")]
            tracing::info!(tenant = %tenant_id, "tenant unregistered");
            Ok(())
        })
    }

    /// Would `request` be admitted right now? No mutation, no reclamation.
    pub fn check_resource_availability(
        &self,
        tenant_id: &TenantId,
        request: &ResourceRequest,
    ) -> Result<Availability> {
        self.admission.check(tenant_id, request)
    }

    /// `Ok(false)` when over quota. A blocked tenant is an error.
    pub fn allocate_resources(
        &self,
        tenant_id: &TenantId,
        request: &ResourceRequest,
    ) -> Result<bool> {
        match self.allocate(tenant_id, request) {
            Ok(_) => Ok(true),
            Err(Error::QuotaExceeded { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Allocate and record a lease for `request`.
    pub fn allocate(&self, tenant_id: &TenantId, request: &ResourceRequest) -> Result<Allocation> {
        self.open_lease(tenant_id, request).map(|(_, allocation)| allocation)
    }

    pub fn allocate_guarded(
        &self,
        tenant_id: &TenantId,
        request: &ResourceRequest,
    ) -> Result<AllocationGuard> {
        let (lease, allocation) = self.open_lease(tenant_id, request)?;
        Ok(AllocationGuard::new(Arc::clone(&self.reclaimer), lease, allocation))
    }

    fn open_lease(
        &self,
        tenant_id: &TenantId,
        request: &ResourceRequest,
    ) -> Result<(Arc<Lease>, Allocation)> {
        let owner = Owner::Tenant(tenant_id.clone());
        let ttl_ms = self.config.lease_ttl_ms;
        let leases = self.reclaimer.leases();

        let lease = self.admission.admit(&owner, request, |_account| {
            Ok(leases.open(tenant_id.clone(), request, self.clock.now_ms(), ttl_ms))
        })?;
        let allocation = Allocation {
            lease_id: lease.lease_id(),
            tenant_id: tenant_id.clone(),
            expires_at_ms: lease.expires_at_ms(),
            throttle: self
                .admission
                .throttle_for(tenant_id, self.config.throttle_delay()),
        };
        Ok((lease, allocation))
    }

    /// Push an ACTIVE lease's expiry to now + TTL. Returns the new expiry.
    pub fn renew_lease(&self, lease_id: &LeaseId) -> Result<u64> {
        let lease = self
            .reclaimer
            .leases()
            .get(lease_id)
            .ok_or_else(|| not_found("lease", lease_id))?;
        let expires_at_ms = self.clock.now_ms().saturating_add(self.config.lease_ttl_ms);
        let renewed = self
            .ledger
            .transact(&lease.owner(), |_account| {
                lease.is_active().then(|| {
                    lease.extend(expires_at_ms);
                    expires_at_ms
                })
            })
            .map_err(|e| self.escalate(e))?;
        renewed.ok_or_else(|| not_found("lease", lease_id))
    }

    /// Idempotent. `Ok(false)` if the lease is unknown or already gone.
    pub fn release_lease(&self, lease_id: &LeaseId) -> Result<bool> {
        match self.reclaimer.leases().get(lease_id) {
            Some(lease) => self.reclaimer.release_holder(&lease, HolderState::Removed),
            None => Ok(false),
        }
    }

    /// Give back up to `request` from the tenant's leases, oldest first.
    ///
    /// The ledger is decremented by exactly what the leases still held, so
    /// repeating a deallocation never takes usage below zero. Returns
    /// `Ok(false)` for an unknown tenant.
    pub fn deallocate_resources(
        &self,
        tenant_id: &TenantId,
        request: &ResourceRequest,
    ) -> Result<bool> {
        if !self.registry.contains(tenant_id) {
            return Ok(false);
        }
        let owner = Owner::Tenant(tenant_id.clone());
        let leases = self.reclaimer.leases();

        let released = self
            .ledger
            .transact(&owner, |account| {
                let mut released = ResourceAmounts::new();
                for lease in leases.active_for(tenant_id) {
                    let emptied = {
                        let mut held = lease.held_mut();
                        for (kind, amount) in request.iter() {
                            let want = amount - released.get(kind);
                            let take = want.min(held.get(kind));
                            if take > AMOUNT_EPSILON {
                                held.sub_clamped(kind, take);
                                released.add(kind, take);
                            }
                        }
                        held.is_empty()
                    };
                    if emptied {
                        self.reclaimer
                            .retire_in(account, &lease, HolderState::Removed);
                    }
                    if covers(&released, request) {
                        break;
                    }
                }
                account.release(&released);
                released
            })
            .map_err(|e| self.escalate(e))?;

        self.reclaimer
            .emit_each(EventKind::Released, &owner, &released);
        Ok(true)
    }

    pub fn leases(&self, tenant_id: &TenantId) -> Vec<LeaseInfo> {
        self.reclaimer
            .leases()
            .active_for(tenant_id)
            .iter()
            .map(|l| l.info())
            .collect()
    }

    pub fn get_tenant_status(&self, tenant_id: &TenantId) -> Result<TenantStatus> {
        let record = self
            .registry
            .record(tenant_id)
            .ok_or_else(|| not_found("tenant", tenant_id))?;
        let snapshot = self.usage(&Owner::Tenant(tenant_id.clone()))?;
        let enforcement = self.board.get(tenant_id);

        Ok(TenantStatus {
            tenant_id: tenant_id.clone(),
            utilization: utilization(&snapshot.usage, &record.quota),
            quota: record.quota,
            usage: snapshot.usage,
            policy: record.policy,
            enforcement: enforcement
                .as_ref()
                .map_or(EnforcementLevel::Normal, |s| s.level),
            throttled: enforcement.as_ref().is_some_and(|s| s.throttled),
            blocked: enforcement.as_ref().is_some_and(|s| s.blocked),
            reasons: enforcement.map(|s| s.reasons).unwrap_or_default(),
            active_leases: self.reclaimer.leases().active_for(tenant_id).len(),
            last_updated_ms: snapshot.last_updated_ms,
        })
    }

    // --- enforcement and maintenance ---

    /// One enforcement tick. Returns the level changes it made.
    pub fn enforce_isolation(&self) -> Vec<Transition> {
        let transitions = self.engine.evaluate();
        let now = self.clock.now_ms();
        for t in &transitions {
            let kind = match t.to {
                EnforcementLevel::Blocked => EventKind::Blocked,
                EnforcementLevel::Warning => EventKind::Warned,
                EnforcementLevel::Normal => continue,
            };
            self.sink.emit(GovernorEvent::new(
                kind,
                Owner::Tenant(t.tenant_id.clone()),
                None,
                now,
            ));
        }
        transitions
    }

    /// Administrative unblock. `Ok(false)` if the tenant was not blocked.
    pub fn unblock_tenant(&self, tenant_id: &TenantId) -> Result<bool> {
        match self.engine.unblock(tenant_id)? {
            Some(_) => {
                self.sink.emit(GovernorEvent::new(
                    EventKind::Unblocked,
                    Owner::Tenant(tenant_id.clone()),
                    None,
                    self.clock.now_ms(),
                ));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Full reclamation sweep, bounded by one reclaim interval.
    pub fn reclaim_now(&self) -> SweepReport {
        let deadline = std::time::Instant::now() + self.config.reclaim_interval();
        self.reclaimer.sweep(Some(deadline))
    }

    /// Reinstate a quarantined owner with usage rebuilt from its ACTIVE
    /// holders. Returns `false` if the owner was not quarantined.
    pub fn lift_quarantine(&self, owner: &Owner) -> bool {
        let rebuilt: ResourceAmounts = match owner {
            Owner::User(user_id) => {
                let active = self.reclaimer.connections().active_for(user_id).len();
                [(ResourceKind::Connections, active as f64)].into_iter().collect()
            }
            Owner::Tenant(tenant_id) => {
                let mut total = ResourceAmounts::new();
                for lease in self.reclaimer.leases().active_for(tenant_id) {
                    for (kind, amount) in lease.held().iter() {
                        total.add(kind, amount);
                    }
                }
                total
            }
        };
        self.ledger.lift_quarantine(owner, rebuilt)
    }

    pub fn usage(&self, owner: &Owner) -> Result<UsageSnapshot> {
        self.ledger.snapshot(owner).map_err(|e| self.escalate(e))
    }

    /// One ledger counter, e.g. a user's `connections`.
    pub fn counter(&self, key: &ResourceKey) -> Result<f64> {
        self.ledger.counter(key).map_err(|e| self.escalate(e))
    }

    pub fn ledger_stats(&self) -> StatsSnapshot {
        self.ledger.stats()
    }

    /// Sweeps run and per-holder reclaim failures since start.
    pub fn reclaim_counters(&self) -> (u64, u64) {
        self.reclaimer.counters()
    }

    /// Reach the ledger directly. Intended for diagnostics and tests.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    fn escalate(&self, err: warden_ledger::Error) -> Error {
        escalate(&*self.sink, self.clock.now_ms(), err)
    }
}

fn covers(released: &ResourceAmounts, request: &ResourceRequest) -> bool {
    request
        .iter()
        .all(|(kind, amount)| released.get(kind) + AMOUNT_EPSILON >= amount)
}

fn not_found(what: &'static str, id: &impl std::fmt::Display) -> Error {
    Error::NotFound {
        what,
        id: id.to_string(),
    }
}
