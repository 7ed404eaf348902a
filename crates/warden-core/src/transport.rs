//! The transport seam.
//!
//! The governor never owns a socket. It keeps a `Weak<dyn Transport>` per
//! connection and only asks whether the other side is gone. A transport
//! that has already been dropped counts as closed.

use std::sync::{Arc, Weak};

pub trait Transport: Send + Sync {
    fn is_closed(&self) -> bool;
}

/// `true` if the transport was dropped or reports itself closed.
pub fn is_dead(transport: &Weak<dyn Transport>) -> bool {
    transport.upgrade().map_or(true, |t| t.is_closed())
}

/// Downgrade a shared transport into the weak reference stored on handles.
pub fn downgrade<T: Transport + 'static>(transport: &Arc<T>) -> Weak<dyn Transport> {
    let weak: Weak<T> = Arc::downgrade(transport);
    weak
}
