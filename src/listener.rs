//! The listener surface user callbacks implement (spec §4.5, §4.6).

use crate::invocation::InvocationContext;
use std::sync::Arc;

/// Stable identity for a listener, used to tag per-thread scratch slots
/// (spec §4.7) and to scan for a listener's entries on `detach` without
/// needing to keep the original `Arc` around on every thread.
pub type ListenerId = usize;

/// Derive a [`ListenerId`] from a listener handle. Two `Arc`s that were
/// cloned from the same allocation yield the same id.
pub fn listener_id(listener: &Arc<dyn InvocationListener>) -> ListenerId {
    Arc::as_ptr(listener) as *const () as ListenerId
}

/// Which half of a call a dispatch is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointCut {
    /// The intercepted function is about to run.
    Enter,
    /// The intercepted function has returned.
    Leave,
}

/// A listener attached to one or more functions via
/// [`crate::interceptor::Interceptor::attach`].
///
/// `on_leave` has a default empty implementation; override
/// [`InvocationListener::has_on_leave`] to `false` only when `on_leave` is
/// left at its default, so the engine can skip installing an on-leave
/// trampoline for this listener's sake (spec §4.2, `has_on_leave_listener`).
/// Getting this wrong by returning `false` while overriding `on_leave` just
/// means that listener's `on_leave` is silently never called — it does not
/// corrupt other listeners' dispatch.
pub trait InvocationListener: Send + Sync {
    /// Called before the intercepted function runs.
    fn on_enter(&self, _context: &mut InvocationContext) {}

    /// Called after the intercepted function returns.
    fn on_leave(&self, _context: &mut InvocationContext) {}

    /// Whether this listener implements a meaningful `on_leave`. Default
    /// `true` (conservative: assume both callbacks may fire).
    fn has_on_leave(&self) -> bool {
        true
    }
}
