//! The invocation engine: the entry/leave dispatch that every trampoline
//! calls into, and the types callbacks observe (spec §3, §4.5, §4.6, §4.8).

use crate::address::CodeAddress;
use crate::backend::{Os, ThreadId};
use crate::constants::LISTENER_DATA_SLOT_SIZE;
use crate::context::FunctionContext;
use crate::listener::{listener_id, PointCut};
use crate::thread_context::{self, ThreadContext};
use std::any::Any;
use std::cell::RefMut;
use std::sync::Arc;

/// Architecture-neutral register snapshot. The backend is responsible for
/// mapping this to and from whatever shape its trampolines actually use;
/// this core only ever reads/writes `pc` and treats the rest as opaque
/// storage a replacement function's argument/return-value access is built
/// on top of.
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    pub pc: CodeAddress,
    pub sp: usize,
    pub registers: [usize; 32],
}

/// One in-flight call on a thread's shadow stack (spec §3, "Invocation
/// stack entry").
pub struct InvocationStackEntry {
    pub function_ctx: Arc<FunctionContext>,
    /// The caller's original return address, or the on-leave trampoline
    /// address once a trap-on-return has been installed over it.
    pub caller_ret_addr: CodeAddress,
    /// Snapshot of registers taken right before handing control to a
    /// replacement function (spec §3, "used by replacements").
    pub cpu_context: CpuContext,
    pub calling_replacement: bool,
    pub original_system_error: i32,
    pub system_error: i32,
    /// Which half of the call is presently active, as observed by
    /// [`crate::interceptor::Interceptor::get_current_invocation`] (spec
    /// §4.1 `get_current_invocation`, §4.8). Set to `Enter` when the frame
    /// is pushed, flipped to `Leave` once the on-leave trampoline re-enters
    /// dispatch for it.
    pub point_cut: PointCut,
    /// Per-listener scratch, indexed by the listener's slot in the
    /// snapshot that was live when this frame was pushed.
    pub listener_invocation_data: Vec<[u8; LISTENER_DATA_SLOT_SIZE]>,
}

/// The capability a callback receives during `on_enter`/`on_leave`: it may
/// read call metadata, inspect and mutate live registers (which is how a
/// listener or replacement observes/changes arguments and return values),
/// and read/write the thread's current OS error value (spec §3
/// "invocation-backend views", §4.5/§4.6).
pub struct InvocationContext<'a> {
    pub point_cut: PointCut,
    pub function_address: CodeAddress,
    pub thread_id: ThreadId,
    /// Shadow-stack depth at the time of this call, including this frame.
    pub depth: usize,
    pub cpu_context: &'a mut CpuContext,
    system_error: &'a mut i32,
    pub function_data: Option<&'a Arc<dyn Any + Send + Sync>>,
    pub listener_invocation_data: Option<&'a mut [u8; LISTENER_DATA_SLOT_SIZE]>,
    pub listener_thread_data: Option<RefMut<'a, [u8; LISTENER_DATA_SLOT_SIZE]>>,
    pub replacement_data: Option<&'a Arc<dyn Any + Send + Sync>>,
}

impl<'a> InvocationContext<'a> {
    pub fn system_error(&self) -> i32 {
        *self.system_error
    }

    pub fn set_system_error(&mut self, value: i32) {
        *self.system_error = value;
    }
}

/// What the trampoline should do once dispatch returns (spec §4.5, steps
/// 12-13).
#[derive(Debug, Clone)]
pub enum NextHop {
    /// Run the original function body.
    InvokeOriginal,
    /// Hand control to a replacement instead.
    Replacement {
        function: CodeAddress,
        data: Option<Arc<dyn Any + Send + Sync>>,
    },
}

fn fixup_pc(target_address: CodeAddress, cpu_context: &mut CpuContext) {
    #[cfg(target_arch = "arm")]
    let target_address = target_address & !1usize;

    cpu_context.pc = target_address;
}

/// The entry-path dispatch every on-invoke trampoline calls into (spec
/// §4.5). `caller_ret_addr` is overwritten with the on-leave trampoline's
/// address whenever the engine needs to trap on return; the backend is
/// responsible for actually threading that value into the trampoline's own
/// return-address slot.
pub fn dispatch_enter(
    interceptor_identity: usize,
    os: &dyn Os,
    function_ctx: &Arc<FunctionContext>,
    cpu_context: &mut CpuContext,
    caller_ret_addr: &mut CodeAddress,
    selected_thread_id: Option<ThreadId>,
) -> NextHop {
    function_ctx.increment_usage();

    // On Windows the thread-error value must be read before anything else
    // can clobber it; everywhere else it is read after the re-entrancy
    // check instead, matching the host's own error-propagation timing
    // (DESIGN.md, Open Question a).
    #[cfg(windows)]
    let mut system_error = os.get_last_error();

    if thread_context::guard_holds(interceptor_identity) {
        thread_context::clear_guard();
        function_ctx.decrement_usage();
        return NextHop::InvokeOriginal;
    }
    thread_context::set_guard(interceptor_identity);

    let tctx = thread_context::current();

    // A replacement calling back into the very function it replaced must
    // never be redirected into the replacement again (that would recurse
    // forever), but the call still gets its own on-enter/on-leave pass
    // through any still-attached listeners, same as any other call
    // (spec §4.5, step 4; each through-call performs exactly one pass).
    let is_replacement_reentry = !tctx.is_empty()
        && tctx.with_top(|top| {
            top.calling_replacement && top.function_ctx.target_address == function_ctx.target_address
        });

    #[cfg(not(windows))]
    let mut system_error = os.get_last_error();

    let invoke_listeners = tctx.ignore_level() <= 0
        && selected_thread_id.map_or(true, |selected| os.current_thread_id() == selected);

    let replacement = if is_replacement_reentry {
        None
    } else {
        function_ctx.replacement()
    };
    let will_trap_on_leave =
        replacement.is_some() || (invoke_listeners && function_ctx.has_on_leave_listener());

    fixup_pc(function_ctx.target_address, cpu_context);

    if will_trap_on_leave || invoke_listeners {
        let pushed_ret_addr = if will_trap_on_leave {
            *caller_ret_addr
        } else {
            function_ctx.target_address
        };
        let snapshot = function_ctx.listener_snapshot();

        tctx.push(InvocationStackEntry {
            function_ctx: function_ctx.clone(),
            caller_ret_addr: pushed_ret_addr,
            cpu_context: *cpu_context,
            calling_replacement: false,
            original_system_error: system_error,
            system_error,
            point_cut: PointCut::Enter,
            listener_invocation_data: vec![[0u8; LISTENER_DATA_SLOT_SIZE]; snapshot.len()],
        });

        if invoke_listeners {
            let thread_id = os.current_thread_id();
            let depth = tctx.len();

            for (slot, maybe_entry) in snapshot.iter().enumerate() {
                if let Some(entry) = maybe_entry {
                    let lid = listener_id(&entry.listener);
                    tctx.with_top_mut(|frame| {
                        let mut ctx = InvocationContext {
                            point_cut: PointCut::Enter,
                            function_address: function_ctx.target_address,
                            thread_id,
                            depth,
                            cpu_context: &mut *cpu_context,
                            system_error: &mut frame.system_error,
                            function_data: entry.function_data.as_ref(),
                            listener_invocation_data: frame.listener_invocation_data.get_mut(slot),
                            listener_thread_data: Some(tctx.listener_thread_data(lid)),
                            replacement_data: None,
                        };
                        entry.listener.on_enter(&mut ctx);
                    });
                }
            }
            system_error = tctx.with_top(|frame| frame.system_error);
        }

        if !will_trap_on_leave {
            let popped = tctx.pop();
            popped.function_ctx.decrement_usage();
        }

        os.set_last_error(system_error);
        thread_context::clear_guard();

        if will_trap_on_leave {
            *caller_ret_addr = function_ctx.on_leave_trampoline;
        }

        if let Some(repl) = &replacement {
            tctx.with_top_mut(|frame| {
                frame.calling_replacement = true;
                frame.cpu_context = *cpu_context;
                frame.original_system_error = system_error;
            });
            NextHop::Replacement {
                function: repl.function,
                data: repl.data.clone(),
            }
        } else {
            // If `will_trap_on_leave`, usage stays incremented until
            // `dispatch_leave` pops this frame; otherwise it was already
            // balanced by the pop above.
            NextHop::InvokeOriginal
        }
    } else {
        os.set_last_error(system_error);
        thread_context::clear_guard();
        function_ctx.decrement_usage();
        NextHop::InvokeOriginal
    }
}

/// The leave-path dispatch the on-leave trampoline calls into (spec §4.6).
/// Returns the address dispatch has restored as the real return address —
/// the backend is responsible for actually returning there.
pub fn dispatch_leave(interceptor_identity: usize, os: &dyn Os, cpu_context: &mut CpuContext) -> CodeAddress {
    #[cfg(windows)]
    let mut system_error = os.get_last_error();

    thread_context::set_guard(interceptor_identity);

    #[cfg(not(windows))]
    let mut system_error = os.get_last_error();

    let tctx = thread_context::current();

    let (function_ctx, caller_ret_addr, calling_replacement, original_system_error) =
        tctx.with_top(|frame| {
            (
                frame.function_ctx.clone(),
                frame.caller_ret_addr,
                frame.calling_replacement,
                frame.original_system_error,
            )
        });
    let real_ret_addr = os.sign_code_pointer(caller_ret_addr);

    if calling_replacement {
        let seen = tctx.with_top(|frame| frame.system_error);
        if seen != original_system_error {
            system_error = seen;
        }
    }

    fixup_pc(function_ctx.target_address, cpu_context);
    tctx.with_top_mut(|frame| frame.point_cut = PointCut::Leave);

    if function_ctx.has_on_leave_listener() {
        let snapshot = function_ctx.listener_snapshot();
        let thread_id = os.current_thread_id();
        let depth = tctx.len();

        for (slot, maybe_entry) in snapshot.iter().enumerate() {
            if let Some(entry) = maybe_entry {
                if !entry.listener.has_on_leave() {
                    continue;
                }
                let lid = listener_id(&entry.listener);
                tctx.with_top_mut(|frame| {
                    let mut ctx = InvocationContext {
                        point_cut: PointCut::Leave,
                        function_address: function_ctx.target_address,
                        thread_id,
                        depth,
                        cpu_context: &mut *cpu_context,
                        system_error: &mut frame.system_error,
                        function_data: entry.function_data.as_ref(),
                        listener_invocation_data: frame.listener_invocation_data.get_mut(slot),
                        listener_thread_data: Some(tctx.listener_thread_data(lid)),
                        replacement_data: None,
                    };
                    entry.listener.on_leave(&mut ctx);
                });
            }
        }
        system_error = tctx.with_top(|frame| frame.system_error);
    }

    os.set_last_error(system_error);

    let popped = tctx.pop();
    popped.function_ctx.decrement_usage();

    thread_context::clear_guard();

    real_ret_addr
}

/// Expose the calling thread's innermost in-flight call, if any (spec
/// §4.1 `get_current_invocation`). Unlike the view a listener receives
/// during `on_enter`/`on_leave`, this is not tied to any one listener: it
/// carries no per-listener scratch and no function/replacement data, only
/// the call metadata and the live CPU-context/system-error fields every
/// caller can see and mutate. Returns `None` (the "empty sentinel" of
/// spec §4.1) when the calling thread has no frame on its shadow stack.
pub fn current_invocation<R>(os: &dyn Os, f: impl FnOnce(Option<&mut InvocationContext>) -> R) -> R {
    let tctx = thread_context::current();
    if tctx.is_empty() {
        return f(None);
    }

    let thread_id = os.current_thread_id();
    let depth = tctx.len();

    tctx.with_top_mut(|frame| {
        let point_cut = frame.point_cut;
        let function_address = frame.function_ctx.target_address;
        let mut ctx = InvocationContext {
            point_cut,
            function_address,
            thread_id,
            depth,
            cpu_context: &mut frame.cpu_context,
            system_error: &mut frame.system_error,
            function_data: None,
            listener_invocation_data: None,
            listener_thread_data: None,
            replacement_data: None,
        };
        f(Some(&mut ctx))
    })
}

/// Look up the shadow-stack frame whose on-leave trampoline is
/// `on_leave_trampoline`, from the outermost call inward (spec §4.8,
/// "locating a frame by its on-leave trampoline address"). Used to resolve
/// [`crate::interceptor::Interceptor::get_current_stack`] entries back to
/// their originating call.
pub fn find_frame_by_trampoline<R>(
    tctx: &ThreadContext,
    on_leave_trampoline: CodeAddress,
    f: impl FnOnce(Option<&InvocationStackEntry>) -> R,
) -> R {
    tctx.with_frame_matching(
        |entry| entry.function_ctx.on_leave_trampoline == on_leave_trampoline,
        f,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::TestOs;
    use crate::context::ContextKind;
    use crate::listener::InvocationListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        enters: AtomicUsize,
        leaves: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Self {
            Self {
                enters: AtomicUsize::new(0),
                leaves: AtomicUsize::new(0),
            }
        }
    }

    impl InvocationListener for CountingListener {
        fn on_enter(&self, _ctx: &mut InvocationContext) {
            self.enters.fetch_add(1, Ordering::Relaxed);
        }
        fn on_leave(&self, _ctx: &mut InvocationContext) {
            self.leaves.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn new_function_ctx() -> Arc<FunctionContext> {
        Arc::new(FunctionContext::new(
            0x4000,
            ContextKind::Default,
            Box::new(()),
            0x5000,
            0x6000,
            8,
        ))
    }

    #[test]
    fn enter_then_leave_invokes_both_callbacks_and_balances_usage() {
        let os = TestOs::new();
        let function_ctx = new_function_ctx();
        let counting = Arc::new(CountingListener::new());
        let listener: Arc<dyn InvocationListener> = counting.clone();
        function_ctx.add_listener(listener, None).unwrap();

        let mut cpu = CpuContext {
            pc: 0x4000,
            sp: 0,
            registers: [0; 32],
        };
        let mut caller_ret = 0x9999;

        let hop = dispatch_enter(1, &os, &function_ctx, &mut cpu, &mut caller_ret, None);
        assert!(matches!(hop, NextHop::InvokeOriginal));
        assert_eq!(caller_ret, function_ctx.on_leave_trampoline);
        assert_eq!(function_ctx.usage_counter(), 1);
        assert_eq!(counting.enters.load(Ordering::Relaxed), 1);

        let restored = dispatch_leave(1, &os, &mut cpu);
        assert_eq!(restored, 0x9999);
        assert_eq!(function_ctx.usage_counter(), 0);
        assert_eq!(counting.leaves.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn replacement_bypasses_reentry_into_same_function() {
        let os = TestOs::new();
        let function_ctx = new_function_ctx();
        function_ctx
            .set_replacement(Some(crate::context::Replacement {
                function: 0x7000,
                data: None,
            }));

        let mut cpu = CpuContext {
            pc: 0x4000,
            sp: 0,
            registers: [0; 32],
        };
        let mut caller_ret = 0x9999;

        let hop = dispatch_enter(1, &os, &function_ctx, &mut cpu, &mut caller_ret, None);
        assert!(matches!(hop, NextHop::Replacement { .. }));

        // The replacement now calls back into the original function on
        // this same thread: with no listeners attached here, the through-
        // call is a no-op pass and must not be redirected into the
        // replacement again or install a leave trap.
        let mut inner_cpu = cpu;
        let mut inner_ret = 0x1234;
        let inner_hop = dispatch_enter(1, &os, &function_ctx, &mut inner_cpu, &mut inner_ret, None);
        assert!(matches!(inner_hop, NextHop::InvokeOriginal));
        assert_eq!(inner_ret, 0x1234, "reentrant call must not trap on leave");

        dispatch_leave(1, &os, &mut cpu);
    }

    #[test]
    fn replacement_through_call_still_fires_listeners_each_time() {
        let os = TestOs::new();
        let function_ctx = new_function_ctx();
        let counting = Arc::new(CountingListener::new());
        let listener: Arc<dyn InvocationListener> = counting.clone();
        function_ctx.add_listener(listener, None).unwrap();
        function_ctx
            .set_replacement(Some(crate::context::Replacement {
                function: 0x7000,
                data: None,
            }));

        let mut cpu = CpuContext {
            pc: 0x4000,
            sp: 0,
            registers: [0; 32],
        };
        let mut caller_ret = 0x9999;
        let hop = dispatch_enter(1, &os, &function_ctx, &mut cpu, &mut caller_ret, None);
        assert!(matches!(hop, NextHop::Replacement { .. }));

        for _ in 0..2 {
            let mut inner_ret = 0x1234;
            let inner_hop = dispatch_enter(1, &os, &function_ctx, &mut cpu, &mut inner_ret, None);
            assert!(
                matches!(inner_hop, NextHop::InvokeOriginal),
                "a through-call must never be redirected back into the replacement"
            );
            assert_eq!(inner_ret, function_ctx.on_leave_trampoline);
            dispatch_leave(1, &os, &mut cpu);
        }

        assert_eq!(counting.enters.load(Ordering::Relaxed), 1 + 2);
        assert_eq!(counting.leaves.load(Ordering::Relaxed), 2);

        dispatch_leave(1, &os, &mut cpu);
        assert_eq!(counting.leaves.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn ignored_thread_skips_listener_dispatch() {
        let os = TestOs::new();
        let function_ctx = new_function_ctx();
        let listener: Arc<dyn InvocationListener> = Arc::new(CountingListener::new());
        function_ctx.add_listener(listener, None).unwrap();

        let tctx = thread_context::current();
        tctx.push_ignore();

        let mut cpu = CpuContext {
            pc: 0x4000,
            sp: 0,
            registers: [0; 32],
        };
        let mut caller_ret = 0x9999;
        let hop = dispatch_enter(1, &os, &function_ctx, &mut cpu, &mut caller_ret, None);
        assert!(matches!(hop, NextHop::InvokeOriginal));
        // No on-leave listener and ignored, so no trap was installed.
        assert_eq!(caller_ret, 0x9999);

        tctx.pop_ignore();
    }

    #[test]
    fn current_invocation_reflects_point_cut_and_is_none_when_idle() {
        let os = TestOs::new();
        let function_ctx = new_function_ctx();

        current_invocation(&os, |ctx| {
            assert!(ctx.is_none(), "no call in flight on a fresh thread");
        });

        let mut cpu = CpuContext {
            pc: 0x4000,
            sp: 0,
            registers: [0; 32],
        };
        let mut caller_ret = 0x9999;
        // No listeners and no replacement, but force a trap on leave isn't
        // possible without one — attach a listener so the frame is pushed.
        let listener: Arc<dyn InvocationListener> = Arc::new(CountingListener::new());
        function_ctx.add_listener(listener, None).unwrap();

        dispatch_enter(2, &os, &function_ctx, &mut cpu, &mut caller_ret, None);

        current_invocation(&os, |ctx| {
            let ctx = ctx.expect("a call is in flight");
            assert_eq!(ctx.point_cut, PointCut::Enter);
            assert_eq!(ctx.function_address, function_ctx.target_address);
        });

        dispatch_leave(2, &os, &mut cpu);

        current_invocation(&os, |ctx| {
            assert!(ctx.is_none(), "frame was popped on leave");
        });
    }
}
