//! Per-thread state: the shadow invocation stack, the ignore-level counter,
//! the re-entrancy guard, and per-(thread, listener) scratch data (spec §3
//! "Thread context", §4.7).

use crate::constants::LISTENER_DATA_SLOT_SIZE;
use crate::invocation::InvocationStackEntry;
use crate::listener::ListenerId;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell, RefMut};
use std::sync::Arc;

/// A lazily-allocated scratch slot tagged with the listener that currently
/// owns it. Slots are reused across listeners once their owner detaches
/// (spec §4.7, "purge that listener's thread-data slots").
struct ListenerDataSlot {
    owner: Option<ListenerId>,
    data: [u8; LISTENER_DATA_SLOT_SIZE],
}

/// Per-thread state. One instance per OS thread that has ever entered this
/// core's dispatch path, created lazily on first touch and torn down by the
/// `thread_local!` destructor on thread exit.
pub struct ThreadContext {
    stack: RefCell<Vec<InvocationStackEntry>>,
    ignore_level: Cell<i32>,
    listener_thread_data: RefCell<Vec<ListenerDataSlot>>,
}

impl ThreadContext {
    fn new() -> Self {
        Self {
            stack: RefCell::new(Vec::new()),
            ignore_level: Cell::new(0),
            listener_thread_data: RefCell::new(Vec::new()),
        }
    }

    /// Current shadow-stack depth.
    pub fn len(&self) -> usize {
        self.stack.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a new frame. Panics on overflow past `MAX_CALL_DEPTH`, which
    /// the spec treats as a fatal programming error rather than a
    /// recoverable one (spec §3 invariants).
    pub fn push(&self, entry: InvocationStackEntry) {
        let mut stack = self.stack.borrow_mut();
        assert!(
            stack.len() < crate::constants::MAX_CALL_DEPTH,
            "shadow stack depth exceeded MAX_CALL_DEPTH"
        );
        stack.push(entry);
    }

    /// Pop the top frame. Panics if the stack is empty — popping more
    /// frames than were pushed is a bug in the caller, not a runtime
    /// condition to recover from.
    pub fn pop(&self) -> InvocationStackEntry {
        self.stack
            .borrow_mut()
            .pop()
            .expect("shadow stack underflow")
    }

    pub fn with_top<R>(&self, f: impl FnOnce(&InvocationStackEntry) -> R) -> R {
        let stack = self.stack.borrow();
        f(stack.last().expect("shadow stack is empty"))
    }

    pub fn with_top_mut<R>(&self, f: impl FnOnce(&mut InvocationStackEntry) -> R) -> R {
        let mut stack = self.stack.borrow_mut();
        f(stack.last_mut().expect("shadow stack is empty"))
    }

    /// Locate the innermost frame satisfying `pred` (spec §4.8, "locating a
    /// frame by its on-leave trampoline address").
    pub fn with_frame_matching<R>(
        &self,
        pred: impl Fn(&InvocationStackEntry) -> bool,
        f: impl FnOnce(Option<&InvocationStackEntry>) -> R,
    ) -> R {
        let stack = self.stack.borrow();
        f(stack.iter().rev().find(|entry| pred(entry)))
    }

    /// A snapshot of every function context currently on this thread's
    /// shadow stack, innermost first (spec §4.1 `get_current_stack`).
    pub fn current_stack(&self) -> Vec<Arc<crate::context::FunctionContext>> {
        self.stack
            .borrow()
            .iter()
            .rev()
            .map(|entry| entry.function_ctx.clone())
            .collect()
    }

    /// Snapshot the current shadow-stack depth (spec §4.8, "`save`...
    /// snapshot... the shadow stack"). The returned value is only ever
    /// meaningful as an argument to [`ThreadContext::restore`] on the same
    /// thread.
    pub fn save(&self) -> usize {
        self.len()
    }

    /// Truncate the shadow stack back to a depth previously returned by
    /// [`ThreadContext::save`], decrementing the usage counter of every
    /// discarded frame's function context (spec §4.8, "later truncate the
    /// shadow stack (decrementing the usage counter of discarded
    /// frames)"). Used by hosts that `longjmp`/unwind out of instrumented
    /// code without ever returning through the on-leave trampolines that
    /// would otherwise have popped those frames and balanced their usage
    /// counters. A no-op if the stack is already at or below `depth`.
    pub fn restore(&self, depth: usize) {
        loop {
            let should_pop = self.stack.borrow().len() > depth;
            if !should_pop {
                break;
            }
            let discarded = self.pop();
            discarded.function_ctx.decrement_usage();
        }
    }

    pub fn ignore_level(&self) -> i32 {
        self.ignore_level.get()
    }

    pub fn push_ignore(&self) {
        self.ignore_level.set(self.ignore_level.get() + 1);
    }

    pub fn pop_ignore(&self) {
        let level = self.ignore_level.get();
        if level > 0 {
            self.ignore_level.set(level - 1);
        }
    }

    /// Fetch (allocating if necessary) this thread's scratch slot for
    /// `listener`. Reuses an unowned slot before growing the array (spec
    /// §4.7, "sized to a per-function maximum").
    pub fn listener_thread_data(&self, listener: ListenerId) -> RefMut<'_, [u8; LISTENER_DATA_SLOT_SIZE]> {
        let mut slots = self.listener_thread_data.borrow_mut();

        let index = match slots.iter().position(|s| s.owner == Some(listener)) {
            Some(i) => i,
            None => match slots.iter().position(|s| s.owner.is_none()) {
                Some(i) => {
                    slots[i].owner = Some(listener);
                    slots[i].data = [0u8; LISTENER_DATA_SLOT_SIZE];
                    i
                }
                None => {
                    slots.push(ListenerDataSlot {
                        owner: Some(listener),
                        data: [0u8; LISTENER_DATA_SLOT_SIZE],
                    });
                    slots.len() - 1
                }
            },
        };

        RefMut::map(slots, |v| &mut v[index].data)
    }

    /// Release this thread's scratch slot for `listener`, if it has one, so
    /// a future listener can reuse it (spec §4.7).
    pub fn purge_listener(&self, listener: ListenerId) {
        for slot in self.listener_thread_data.borrow_mut().iter_mut() {
            if slot.owner == Some(listener) {
                slot.owner = None;
            }
        }
    }
}

/// Drop wrapper registered in the `thread_local!` below. Its `Drop` impl is
/// what actually unregisters the thread context from [`mod@registry`] at
/// thread exit — the inner `Arc` alone dropping would just decrement a
/// refcount the registry is also holding.
struct ThreadContextHandle(Arc<ThreadContext>);

impl Drop for ThreadContextHandle {
    fn drop(&mut self) {
        registry::unregister(&self.0);
    }
}

thread_local! {
    static CONTEXT: ThreadContextHandle = {
        let ctx = Arc::new(ThreadContext::new());
        registry::register(ctx.clone());
        ThreadContextHandle(ctx)
    };

    /// The identity of the interceptor this thread currently holds the
    /// re-entrancy guard for, or 0 if none (spec §4.5, "guard TLS key").
    static GUARD: Cell<usize> = Cell::new(0);
}

/// This thread's [`ThreadContext`], creating it on first use.
pub fn current() -> Arc<ThreadContext> {
    CONTEXT.with(|h| h.0.clone())
}

/// Whether this thread is already inside dispatch for interceptor
/// `identity` (spec §4.5, step 2: "If the guard TLS key... belongs to this
/// same interceptor, the call is a re-entry").
pub fn guard_holds(identity: usize) -> bool {
    GUARD.with(|g| g.get() == identity)
}

pub fn set_guard(identity: usize) {
    GUARD.with(|g| g.set(identity));
}

pub fn clear_guard() {
    GUARD.with(|g| g.set(0));
}

/// Registry of every live [`ThreadContext`], used by `detach` to purge a
/// departing listener's thread-data slots across every thread, not just the
/// calling one (spec §4.7).
pub mod registry {
    use super::ThreadContext;
    use super::Lazy;
    use super::Mutex;
    use std::sync::Arc;

    static LIVE: Lazy<Mutex<Vec<Arc<ThreadContext>>>> = Lazy::new(|| Mutex::new(Vec::new()));

    pub(super) fn register(ctx: Arc<ThreadContext>) {
        LIVE.lock().push(ctx);
    }

    pub(super) fn unregister(ctx: &Arc<ThreadContext>) {
        let mut live = LIVE.lock();
        if let Some(pos) = live.iter().position(|c| Arc::ptr_eq(c, ctx)) {
            live.swap_remove(pos);
        }
    }

    /// Run `f` over every thread context currently registered.
    pub fn for_each(mut f: impl FnMut(&Arc<ThreadContext>)) {
        let live = LIVE.lock();
        for ctx in live.iter() {
            f(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_level_saturates_at_zero() {
        let ctx = ThreadContext::new();
        assert_eq!(ctx.ignore_level(), 0);
        ctx.pop_ignore();
        assert_eq!(ctx.ignore_level(), 0);
        ctx.push_ignore();
        ctx.push_ignore();
        assert_eq!(ctx.ignore_level(), 2);
        ctx.pop_ignore();
        assert_eq!(ctx.ignore_level(), 1);
    }

    #[test]
    fn listener_thread_data_is_stable_per_listener() {
        let ctx = ThreadContext::new();
        let a: ListenerId = 0xaaa;
        let b: ListenerId = 0xbbb;

        ctx.listener_thread_data(a)[0] = 7;
        assert_eq!(ctx.listener_thread_data(a)[0], 7);
        assert_eq!(ctx.listener_thread_data(b)[0], 0);
    }

    #[test]
    fn purge_frees_slot_for_reuse() {
        let ctx = ThreadContext::new();
        let a: ListenerId = 0x1;
        ctx.listener_thread_data(a)[0] = 42;
        ctx.purge_listener(a);

        let b: ListenerId = 0x2;
        // Reuses the freed slot rather than growing the array, and the
        // reused slot is zeroed.
        assert_eq!(ctx.listener_thread_data(b)[0], 0);
    }

    #[test]
    fn current_thread_context_starts_empty() {
        let ctx = current();
        assert!(ctx.is_empty());
    }

    fn push_frame(ctx: &ThreadContext, function_ctx: Arc<crate::context::FunctionContext>) {
        ctx.push(InvocationStackEntry {
            function_ctx,
            caller_ret_addr: 0,
            cpu_context: crate::invocation::CpuContext { pc: 0, sp: 0, registers: [0; 32] },
            calling_replacement: false,
            original_system_error: 0,
            system_error: 0,
            point_cut: crate::listener::PointCut::Enter,
            listener_invocation_data: Vec::new(),
        });
    }

    /// spec §4.8: `restore` truncates the shadow stack back to a depth
    /// `save` previously captured, decrementing the usage counter of every
    /// discarded frame — the path a host takes when it unwinds out of
    /// instrumented code (e.g. `longjmp`) without ever running the
    /// on-leave trampolines that would otherwise have popped those frames.
    #[test]
    fn restore_discards_frames_pushed_after_save_and_drains_their_usage() {
        let ctx = ThreadContext::new();
        let outer = Arc::new(crate::context::FunctionContext::new(0x1000, crate::context::ContextKind::Default, Box::new(()), 0, 0, 8));
        let inner = Arc::new(crate::context::FunctionContext::new(0x2000, crate::context::ContextKind::Default, Box::new(()), 0, 0, 8));
        outer.increment_usage();
        inner.increment_usage();
        push_frame(&ctx, outer.clone());

        let saved = ctx.save();
        push_frame(&ctx, inner.clone());
        assert_eq!(ctx.len(), 2);

        ctx.restore(saved);

        assert_eq!(ctx.len(), 1, "only the frame pushed after save() is discarded");
        assert_eq!(inner.usage_counter(), 0, "discarded frame's usage counter is drained");
        assert_eq!(outer.usage_counter(), 1, "frame predating the save point is untouched");
    }

    #[test]
    fn restore_past_current_depth_is_a_no_op() {
        let ctx = ThreadContext::new();
        let saved = ctx.save();
        ctx.restore(saved + 5);
        assert_eq!(ctx.len(), 0);
    }
}
