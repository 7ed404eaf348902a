//! Release-on-abort guards.
//!
//! An admission that is abandoned after the ledger was already incremented
//! (the client went away mid-handshake, the task was cancelled) must give the
//! capacity back. Dropping an uncommitted guard releases it; `commit` hands
//! ownership of the holder to the caller instead.

use std::sync::Arc;

use crate::connections::ConnectionHandle;
use crate::governor::Allocation;
use crate::holder::HolderState;
use crate::leases::Lease;
use crate::reclaim::{Holder, Reclaimer};

pub struct ConnectionGuard {
    reclaimer: Arc<Reclaimer>,
    handle: Arc<ConnectionHandle>,
    armed: bool,
}

impl ConnectionGuard {
    pub(crate) fn new(reclaimer: Arc<Reclaimer>, handle: Arc<ConnectionHandle>) -> Self {
        Self {
            reclaimer,
            handle,
            armed: true,
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// Keep the connection. From here on the caller releases it explicitly.
    pub fn commit(mut self) -> Arc<ConnectionHandle> {
        self.armed = false;
        Arc::clone(&self.handle)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            release(&self.reclaimer, &self.handle);
        }
    }
}

pub struct AllocationGuard {
    reclaimer: Arc<Reclaimer>,
    lease: Arc<Lease>,
    allocation: Allocation,
    armed: bool,
}

impl AllocationGuard {
    pub(crate) fn new(
        reclaimer: Arc<Reclaimer>,
        lease: Arc<Lease>,
        allocation: Allocation,
    ) -> Self {
        Self {
            reclaimer,
            lease,
            allocation,
            armed: true,
        }
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn commit(mut self) -> Allocation {
        self.armed = false;
        self.allocation.clone()
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            release(&self.reclaimer, &self.lease);
        }
    }
}

fn release<H: Holder>(reclaimer: &Reclaimer, holder: &H) {
    // Nowhere to return an error from drop; a quarantined owner is already
    // logged and reported by the ledger.
    if let Err(_err) = reclaimer.release_holder(holder, HolderState::Removed) {
        #[cfg(feature = "tracing")]
        tracing::error!(owner = %holder.owner(), error = %_err, "guard release failed");
    }
}
