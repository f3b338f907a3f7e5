//! Function context and the copy-on-write listener list (spec §3, §4.2).

use crate::address::CodeAddress;
use crate::backend::TrampolineHandle;
use crate::constants::MAX_LISTENERS_PER_FUNCTION;
use crate::listener::InvocationListener;
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Which interception surface a context exposes. A context may not mix the
/// two: an address is bound as one kind for its lifetime (spec §4.1,
/// `wrong-type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Listener dispatch (on-enter/on-leave) plus an optional replacement.
    Default,
    /// Replacement-only: no shadow-stack frame, no listener dispatch.
    Fast,
}

/// One attached listener plus its per-function opaque data (spec §3,
/// "Listener entry").
#[derive(Clone)]
pub struct ListenerEntry {
    pub listener: Arc<dyn InvocationListener>,
    pub function_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl ListenerEntry {
    pub fn new(listener: Arc<dyn InvocationListener>, function_data: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            listener,
            function_data,
        }
    }

    fn has_on_leave(&self) -> bool {
        self.listener.has_on_leave()
    }

    fn is_same_listener(&self, other: &Arc<dyn InvocationListener>) -> bool {
        Arc::ptr_eq(&self.listener, other)
    }
}

/// An immutable snapshot of a function context's listener list. Slot
/// indices stay stable across add/remove within one snapshot generation so
/// in-flight invocations can index into per-call scratch by slot (spec
/// §4.2, "keeping slot indices stable").
pub type ListenerSnapshot = Vec<Option<ListenerEntry>>;

/// A replacement function installed at an address, plus its opaque data
/// (spec §4.1 `replace`/`replace_fast`).
#[derive(Clone)]
pub struct Replacement {
    pub function: CodeAddress,
    pub data: Option<Arc<dyn Any + Send + Sync>>,
}

/// Per-target state (spec §3, "Function context"). Fields that the fast
/// dispatch path (spec §4.5/§4.6) reads without acquiring the
/// interceptor's lock are atomics or lock-free snapshots; fields that are
/// fixed for the context's whole lifetime once created are plain values.
pub struct FunctionContext {
    /// The canonical (pointer-auth-stripped) address this context
    /// instruments.
    pub target_address: CodeAddress,
    pub kind: ContextKind,

    /// Backend-owned trampoline storage; released on destruction once the
    /// usage counter has drained (spec §4.4). Held behind a `Mutex` so
    /// [`FunctionContext::take_trampoline_handle`] can move it out of a
    /// shared `Arc` exactly once, for the final `Backend::destroy_trampoline`
    /// call.
    trampoline_handle: Mutex<Option<TrampolineHandle>>,
    /// Address of the "invoke original" continuation.
    pub on_invoke_trampoline: CodeAddress,
    /// Address of the on-leave trampoline installed as a caller's return
    /// address whenever the engine must trap on return.
    pub on_leave_trampoline: CodeAddress,
    /// Number of prologue bytes this trampoline overwrites.
    pub overwritten_prologue_len: usize,

    listeners: ArcSwap<ListenerSnapshot>,
    has_on_leave_listener: AtomicBool,
    replacement: ArcSwapOption<Replacement>,

    activated: AtomicBool,
    destroyed: AtomicBool,
    /// How many threads are presently executing through this context's
    /// trampoline. Trampoline memory may only be freed once this reaches
    /// zero (spec §3 invariants, §5 "Memory-safety contract").
    usage_counter: AtomicUsize,
}

impl FunctionContext {
    pub fn new(
        target_address: CodeAddress,
        kind: ContextKind,
        trampoline_handle: TrampolineHandle,
        on_invoke_trampoline: CodeAddress,
        on_leave_trampoline: CodeAddress,
        overwritten_prologue_len: usize,
    ) -> Self {
        Self {
            target_address,
            kind,
            trampoline_handle: Mutex::new(Some(trampoline_handle)),
            on_invoke_trampoline,
            on_leave_trampoline,
            overwritten_prologue_len,
            listeners: ArcSwap::from_pointee(Vec::new()),
            has_on_leave_listener: AtomicBool::new(false),
            replacement: ArcSwapOption::empty(),
            activated: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            usage_counter: AtomicUsize::new(0),
        }
    }

    /// Run `f` against the backend-owned trampoline handle, if it has not
    /// already been taken by [`FunctionContext::take_trampoline_handle`].
    pub fn with_trampoline_handle<R>(&self, f: impl FnOnce(&TrampolineHandle) -> R) -> Option<R> {
        self.trampoline_handle.lock().as_ref().map(f)
    }

    /// Move the trampoline handle out for the one-time
    /// `Backend::destroy_trampoline` call at the end of this context's
    /// life. Returns `None` if already taken.
    pub fn take_trampoline_handle(&self) -> Option<TrampolineHandle> {
        self.trampoline_handle.lock().take()
    }

    /// Lock-free snapshot load used by the entry/leave dispatch fast path.
    pub fn listener_snapshot(&self) -> Arc<ListenerSnapshot> {
        self.listeners.load_full()
    }

    pub fn has_on_leave_listener(&self) -> bool {
        self.has_on_leave_listener.load(Ordering::Acquire)
    }

    pub fn replacement(&self) -> Option<Arc<Replacement>> {
        self.replacement.load_full()
    }

    pub fn set_replacement(&self, replacement: Option<Replacement>) {
        self.replacement.store(replacement.map(Arc::new));
    }

    pub fn activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    pub fn set_activated(&self, value: bool) {
        self.activated.store(value, Ordering::Release);
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn set_destroyed(&self, value: bool) {
        self.destroyed.store(value, Ordering::Release);
    }

    pub fn usage_counter(&self) -> usize {
        self.usage_counter.load(Ordering::Acquire)
    }

    pub fn increment_usage(&self) {
        self.usage_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_usage(&self) {
        self.usage_counter.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether this context has no listeners and no replacement, and so
    /// should be removed from the interceptor's address map (spec §4.2,
    /// "A context is empty").
    pub fn is_empty(&self) -> bool {
        self.replacement.load().is_none()
            && self
                .listeners
                .load()
                .iter()
                .all(|slot| slot.is_none())
    }

    /// Publish a new snapshot with `entry` appended (spec §4.2, "Adding a
    /// listener publishes a new snapshot"). Returns the previous snapshot
    /// so the caller can schedule its release via the transaction's
    /// deferred-destroy queue, and an error if the listener is already
    /// present or the function is at capacity.
    pub fn add_listener(
        &self,
        listener: Arc<dyn InvocationListener>,
        function_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Arc<ListenerSnapshot>, AddListenerError> {
        let old = self.listeners.load_full();

        if old.iter().flatten().any(|e| e.is_same_listener(&listener)) {
            return Err(AddListenerError::AlreadyAttached);
        }

        let live_count = old.iter().filter(|s| s.is_some()).count();
        if live_count >= MAX_LISTENERS_PER_FUNCTION {
            return Err(AddListenerError::Full);
        }

        let has_on_leave = listener.has_on_leave();

        let mut new_list: ListenerSnapshot = Vec::with_capacity(old.len() + 1);
        new_list.extend(old.iter().cloned());
        new_list.push(Some(ListenerEntry::new(listener, function_data)));

        self.listeners.store(Arc::new(new_list));
        if has_on_leave {
            self.has_on_leave_listener.store(true, Ordering::Release);
        }

        Ok(old)
    }

    /// Null out the slot belonging to `listener`, keeping every other
    /// slot's index stable (spec §4.2, "Removing marks the slot null").
    /// Returns the previous snapshot for deferred release, or `None` if
    /// the listener was not present.
    pub fn remove_listener(
        &self,
        listener: &Arc<dyn InvocationListener>,
    ) -> Option<Arc<ListenerSnapshot>> {
        let old = self.listeners.load_full();

        let index = old
            .iter()
            .position(|slot| matches!(slot, Some(e) if e.is_same_listener(listener)))?;

        let mut new_list: ListenerSnapshot = old.iter().cloned().collect();
        new_list[index] = None;

        self.listeners.store(Arc::new(new_list));

        let still_has_on_leave = self
            .listeners
            .load()
            .iter()
            .flatten()
            .any(|e| e.has_on_leave());
        self.has_on_leave_listener
            .store(still_has_on_leave, Ordering::Release);

        Some(old)
    }
}

/// Failure modes for [`FunctionContext::add_listener`], mapped to
/// [`crate::error::InterceptorError`] by the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddListenerError {
    AlreadyAttached,
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::InvocationContext;

    struct NoopListener {
        on_leave: bool,
    }

    impl InvocationListener for NoopListener {
        fn on_enter(&self, _ctx: &mut InvocationContext) {}
        fn on_leave(&self, _ctx: &mut InvocationContext) {}
        fn has_on_leave(&self) -> bool {
            self.on_leave
        }
    }

    fn new_ctx() -> FunctionContext {
        FunctionContext::new(0x1000, ContextKind::Default, Box::new(()), 0x2000, 0x3000, 8)
    }

    #[test]
    fn empty_on_creation() {
        let ctx = new_ctx();
        assert!(ctx.is_empty());
    }

    #[test]
    fn add_then_remove_restores_emptiness() {
        let ctx = new_ctx();
        let listener: Arc<dyn InvocationListener> = Arc::new(NoopListener { on_leave: true });

        ctx.add_listener(listener.clone(), None).unwrap();
        assert!(!ctx.is_empty());
        assert!(ctx.has_on_leave_listener());

        ctx.remove_listener(&listener).unwrap();
        assert!(ctx.is_empty());
        assert!(!ctx.has_on_leave_listener());
    }

    #[test]
    fn duplicate_attach_rejected() {
        let ctx = new_ctx();
        let listener: Arc<dyn InvocationListener> = Arc::new(NoopListener { on_leave: true });

        ctx.add_listener(listener.clone(), None).unwrap();
        let err = ctx.add_listener(listener, None).unwrap_err();
        assert_eq!(err, AddListenerError::AlreadyAttached);
    }

    #[test]
    fn slot_indices_stay_stable_across_removal() {
        let ctx = new_ctx();
        let a: Arc<dyn InvocationListener> = Arc::new(NoopListener { on_leave: false });
        let b: Arc<dyn InvocationListener> = Arc::new(NoopListener { on_leave: true });

        ctx.add_listener(a.clone(), None).unwrap();
        ctx.add_listener(b.clone(), None).unwrap();

        ctx.remove_listener(&a).unwrap();

        let snapshot = ctx.listener_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].is_none());
        assert!(snapshot[1].is_some());
        // `b` still has on_leave, so the flag must still be set even
        // though `a`'s slot was cleared.
        assert!(ctx.has_on_leave_listener());
    }

    #[test]
    fn has_on_leave_listener_recomputed_on_remove() {
        let ctx = new_ctx();
        let a: Arc<dyn InvocationListener> = Arc::new(NoopListener { on_leave: true });
        let b: Arc<dyn InvocationListener> = Arc::new(NoopListener { on_leave: false });

        ctx.add_listener(a.clone(), None).unwrap();
        ctx.add_listener(b, None).unwrap();
        assert!(ctx.has_on_leave_listener());

        ctx.remove_listener(&a).unwrap();
        assert!(!ctx.has_on_leave_listener());
    }
}
