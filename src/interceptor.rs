//! The top-level instrumentation manager (spec §3 "Interceptor", §4.1,
//! §4.7).

use crate::address::CodeAddress;
use crate::backend::{Backend, CodeAllocator, CodeSigningPolicy, Os, ThreadId};
use crate::constants::DEFAULT_CODE_SLICE_SIZE;
use crate::context::{AddListenerError, ContextKind, FunctionContext, Replacement};
use crate::error::{InterceptorError, Result};
use crate::invocation::{self, CpuContext, NextHop};
use crate::listener::{listener_id, InvocationListener};
use crate::thread_context::{self, registry};
use crate::transaction::{self, Transaction, UpdateKind};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, ReentrantMutex};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// State mutated only while the interceptor's lock is held.
struct InterceptorState {
    functions: HashMap<CodeAddress, Arc<FunctionContext>>,
    transaction: Transaction,
}

/// The backend/allocator/OS triple a process registers once via
/// [`Interceptor::set_host`] before the first [`Interceptor::obtain`].
struct Host {
    backend: Arc<dyn Backend>,
    allocator: Arc<dyn CodeAllocator>,
    os: Arc<dyn Os>,
}

static HOST: OnceCell<Host> = OnceCell::new();
static SINGLETON: Lazy<Mutex<Weak<Interceptor>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// The instrumentation manager: owns the address-keyed table of
/// [`FunctionContext`]s, the current (possibly nested) [`Transaction`],
/// and the selected-thread filter, and exposes the attach/detach/replace
/// surface (spec §4.1).
pub struct Interceptor {
    backend: Arc<dyn Backend>,
    allocator: Arc<dyn CodeAllocator>,
    os: Arc<dyn Os>,
    selected_thread_id: std::sync::atomic::AtomicU64,
    state: ReentrantMutex<RefCell<InterceptorState>>,
}

impl Interceptor {
    fn new(backend: Arc<dyn Backend>, allocator: Arc<dyn CodeAllocator>, os: Arc<dyn Os>) -> Self {
        let _ = allocator.init(DEFAULT_CODE_SLICE_SIZE);
        Self {
            backend,
            allocator,
            os,
            selected_thread_id: std::sync::atomic::AtomicU64::new(0),
            state: ReentrantMutex::new(RefCell::new(InterceptorState {
                functions: HashMap::new(),
                transaction: Transaction::new(),
            })),
        }
    }

    /// Register the backend/allocator/OS triple every later
    /// [`Interceptor::obtain`] call will use. May only be called once per
    /// process; a concrete host binding is out of scope for this core
    /// (spec §1 Non-goals), so something upstream must call this before
    /// the first `obtain()`.
    pub fn set_host(backend: Arc<dyn Backend>, allocator: Arc<dyn CodeAllocator>, os: Arc<dyn Os>) -> std::result::Result<(), ()> {
        HOST.set(Host { backend, allocator, os }).map_err(|_| ())
    }

    /// The process-wide instance, created on first call and kept alive as
    /// long as at least one `Arc` handle to it survives (spec §3
    /// "Interceptor... ref-counted singleton").
    pub fn obtain() -> Arc<Interceptor> {
        let mut slot = SINGLETON.lock();
        if let Some(existing) = slot.upgrade() {
            return existing;
        }

        let host = HOST.get().expect("Interceptor::set_host must be called before obtain()");
        let instance = Arc::new(Self::new(host.backend.clone(), host.allocator.clone(), host.os.clone()));
        *slot = Arc::downgrade(&instance);
        instance
    }

    /// Build an independent `Interceptor` bound to its own host, bypassing
    /// the process-wide singleton. Intended for tests that need isolation
    /// from one another (spec §8, scenarios exercised against the
    /// `testing` doubles).
    pub fn with_host(backend: Arc<dyn Backend>, allocator: Arc<dyn CodeAllocator>, os: Arc<dyn Os>) -> Arc<Interceptor> {
        Arc::new(Self::new(backend, allocator, os))
    }

    fn identity(&self) -> usize {
        &self.state as *const _ as usize
    }

    fn resolve(&self, state: &InterceptorState, address: CodeAddress) -> CodeAddress {
        let address = self.os.strip_code_pointer(address);

        if state.functions.contains_key(&address) {
            return address;
        }

        if self.os.code_signing_policy() == CodeSigningPolicy::Required {
            return address;
        }

        match self.backend.resolve_redirect(address) {
            Some(target) => self.resolve(state, target),
            None => address,
        }
    }

    /// Find or create the [`FunctionContext`] for `address`, scheduling
    /// its activation if this is the first time it has been seen (spec
    /// §4.1, "instrumenting an address").
    fn instrument(&self, state: &mut InterceptorState, kind: ContextKind, address: CodeAddress) -> Result<Arc<FunctionContext>> {
        if let Some(existing) = state.functions.get(&address) {
            if existing.kind != kind {
                return Err(InterceptorError::WrongType);
            }
            return Ok(existing.clone());
        }

        let created = if self.os.code_signing_policy() == CodeSigningPolicy::Required {
            self.backend
                .claim_grafted_trampoline(address)
                .ok_or(InterceptorError::PolicyViolation)?
        } else {
            self.backend.create_trampoline(address)?
        };

        let ctx = Arc::new(FunctionContext::new(
            address,
            kind,
            created.handle,
            created.on_invoke_trampoline,
            created.on_leave_trampoline,
            created.overwritten_prologue_len,
        ));

        state.functions.insert(address, ctx.clone());
        state.transaction.schedule_update(
            ctx.clone(),
            UpdateKind::Activate,
            self.os.page_size(),
            self.backend.function_address(address),
        );

        Ok(ctx)
    }

    /// Remove `ctx` from the live address map, if it is there, and
    /// schedule its teardown (spec §4.4, "A context whose listener list
    /// and replacement are both empty... is removed and destroyed").
    fn destroy_if_empty(&self, state: &mut InterceptorState, ctx: &Arc<FunctionContext>) {
        if !ctx.is_empty() {
            return;
        }

        state.functions.remove(&ctx.target_address);
        ctx.set_destroyed(true);

        if ctx.activated() {
            state.transaction.schedule_update(
                ctx.clone(),
                UpdateKind::Deactivate,
                self.os.page_size(),
                self.backend.function_address(ctx.target_address),
            );
        }

        let backend = self.backend.clone();
        let ctx_for_notify = ctx.clone();
        state.transaction.schedule_destroy(
            ctx.clone(),
            Box::new(move || {
                if let Some(handle) = ctx_for_notify.take_trampoline_handle() {
                    backend.destroy_trampoline(handle);
                }
            }),
        );
    }

    /// Commit the transaction this `guard` is holding, if it just closed
    /// its outermost nesting level, then drain destroy tasks. Destroy
    /// notifications run with the lock fully released — the lock is
    /// reacquired only to push a task back onto the next transaction when
    /// its context is still in use (spec §4.3 end, §4.4).
    fn end_transaction(&self, mut guard: parking_lot::ReentrantMutexGuard<'_, RefCell<InterceptorState>>) {
        let taken = {
            let mut state = guard.borrow_mut();
            state.transaction.take_if_outermost()
        };
        let Some(mut taken) = taken else { return };

        transaction::commit(&taken, self.backend.as_ref(), self.allocator.as_ref(), self.os.as_ref());

        let mut destroy_queue = taken.take_pending_destroy();
        drop(taken);

        while let Some(task) = destroy_queue.pop_front() {
            if task.ctx.usage_counter() == 0 {
                drop(guard);
                (task.notify)();
                guard = self.state.lock();
            } else {
                trace!(address = task.ctx.target_address, "destroy deferred: trampoline still in use");
                let mut state = guard.borrow_mut();
                state.transaction.reschedule_destroy(task);
            }
        }
    }

    fn ignore_current_thread(&self) {
        thread_context::current().push_ignore();
    }

    fn unignore_current_thread(&self) {
        thread_context::current().pop_ignore();
    }

    /// Attach `listener` to the function at `function_address` (spec
    /// §4.1 `attach`).
    pub fn attach(
        &self,
        function_address: CodeAddress,
        listener: Arc<dyn InvocationListener>,
        listener_function_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<()> {
        self.ignore_current_thread();
        let guard = self.state.lock();

        let result = {
            let mut state = guard.borrow_mut();
            state.transaction.begin();

            let resolved = self.resolve(&state, function_address);
            (|| -> Result<()> {
                let ctx = self.instrument(&mut state, ContextKind::Default, resolved)?;
                match ctx.add_listener(listener, listener_function_data) {
                    Ok(old_snapshot) => {
                        state.transaction.schedule_destroy(ctx.clone(), Box::new(move || drop(old_snapshot)));
                        Ok(())
                    }
                    Err(AddListenerError::AlreadyAttached) => Err(InterceptorError::AlreadyAttached),
                    Err(AddListenerError::Full) => Err(InterceptorError::AllocatorExhausted {
                        reason: "maximum listener capacity reached for this function".into(),
                    }),
                }
            })()
        };

        self.end_transaction(guard);
        self.unignore_current_thread();

        result
    }

    /// Detach `listener` from every function it is attached to, and purge
    /// its per-thread scratch data on every live thread (spec §4.1
    /// `detach`, §4.7).
    pub fn detach(&self, listener: &Arc<dyn InvocationListener>) {
        self.ignore_current_thread();
        let guard = self.state.lock();

        {
            let mut state = guard.borrow_mut();
            state.transaction.begin();

            let affected: Vec<Arc<FunctionContext>> = state
                .functions
                .values()
                .filter(|ctx| ctx.listener_snapshot().iter().flatten().any(|e| Arc::ptr_eq(&e.listener, listener)))
                .cloned()
                .collect();

            for ctx in &affected {
                if let Some(old_snapshot) = ctx.remove_listener(listener) {
                    state.transaction.schedule_destroy(ctx.clone(), Box::new(move || drop(old_snapshot)));
                }
                self.destroy_if_empty(&mut state, ctx);
            }
        }

        let lid = listener_id(listener);
        registry::for_each(|tctx| tctx.purge_listener(lid));

        self.end_transaction(guard);
        self.unignore_current_thread();
    }

    fn replace_with_kind(
        &self,
        kind: ContextKind,
        function_address: CodeAddress,
        replacement_function: CodeAddress,
        replacement_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<CodeAddress> {
        let guard = self.state.lock();

        let result = {
            let mut state = guard.borrow_mut();
            state.transaction.begin();

            let resolved = self.resolve(&state, function_address);
            (|| -> Result<CodeAddress> {
                let ctx = self.instrument(&mut state, kind, resolved)?;
                if ctx.replacement().is_some() {
                    return Err(InterceptorError::AlreadyReplaced);
                }
                ctx.set_replacement(Some(Replacement {
                    function: replacement_function,
                    data: replacement_data,
                }));
                Ok(ctx.on_invoke_trampoline)
            })()
        };

        self.end_transaction(guard);
        result
    }

    /// Replace the function at `function_address` with
    /// `replacement_function`, dispatching listeners as normal around the
    /// replacement call (spec §4.1 `replace`). Returns the address of the
    /// original function's "invoke original" trampoline.
    pub fn replace(
        &self,
        function_address: CodeAddress,
        replacement_function: CodeAddress,
        replacement_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<CodeAddress> {
        self.replace_with_kind(ContextKind::Default, function_address, replacement_function, replacement_data)
    }

    /// Replace the function at `function_address` with
    /// `replacement_function` without any listener dispatch or
    /// shadow-stack bookkeeping (spec §4.1 `replace_fast`).
    pub fn replace_fast(&self, function_address: CodeAddress, replacement_function: CodeAddress) -> Result<CodeAddress> {
        self.replace_with_kind(ContextKind::Fast, function_address, replacement_function, None)
    }

    /// Undo a `replace`/`replace_fast`, removing the context entirely if
    /// it has no remaining listeners either (spec §4.1 `revert`).
    pub fn revert(&self, function_address: CodeAddress) {
        let guard = self.state.lock();

        {
            let mut state = guard.borrow_mut();
            state.transaction.begin();

            let resolved = self.resolve(&state, function_address);
            if let Some(ctx) = state.functions.get(&resolved).cloned() {
                ctx.set_replacement(None);
                self.destroy_if_empty(&mut state, &ctx);
            }
        }

        self.end_transaction(guard);
    }

    /// Increment the transaction nesting level without committing (spec
    /// §4.1 `begin_transaction`).
    pub fn begin_transaction(&self) {
        let guard = self.state.lock();
        guard.borrow_mut().transaction.begin();
    }

    /// Close one nesting level, committing if it was the outermost one
    /// (spec §4.1 `end_transaction`).
    pub fn end_transaction_public(&self) {
        let guard = self.state.lock();
        self.end_transaction(guard);
    }

    /// Force a commit of whatever is currently pending by opening and
    /// immediately closing a transaction, returning whether the queue of
    /// destroy tasks ended up empty (spec §4.1 `flush`).
    pub fn flush(&self) -> bool {
        let guard = self.state.lock();

        let was_idle = guard.borrow().transaction.level() == 0;
        if !was_idle {
            return false;
        }

        guard.borrow_mut().transaction.begin();
        self.end_transaction(guard);

        let guard = self.state.lock();
        guard.borrow().transaction.is_empty()
    }

    /// Whether `address` is presently instrumented (spec EXPANDED,
    /// `Interceptor::is_instrumented`, mirroring `gum_interceptor_has`).
    pub fn is_instrumented(&self, address: CodeAddress) -> bool {
        let guard = self.state.lock();
        let address = self.os.strip_code_pointer(address);
        guard.borrow().functions.contains_key(&address)
    }

    /// Look up the context backing `address`, for driving
    /// [`Interceptor::dispatch_enter`]/[`Interceptor::dispatch_leave`]
    /// directly in tests that simulate what a real trampoline would call.
    /// A production host never needs this: its generated trampolines
    /// already close over the right context at creation time.
    #[cfg(any(test, feature = "test-support"))]
    pub fn function_context_for(&self, address: CodeAddress) -> Option<Arc<FunctionContext>> {
        let guard = self.state.lock();
        let address = self.os.strip_code_pointer(address);
        guard.borrow().functions.get(&address).cloned()
    }

    /// Restrict listener dispatch (not replacement dispatch) to the
    /// calling thread (spec §4.1 `ignore_other_threads`).
    pub fn ignore_other_threads(&self) {
        self.selected_thread_id
            .store(self.os.current_thread_id(), std::sync::atomic::Ordering::Release);
    }

    /// Undo [`Interceptor::ignore_other_threads`]; must be called from the
    /// same thread (spec §4.1 `unignore_other_threads`).
    pub fn unignore_other_threads(&self) {
        debug_assert_eq!(
            self.selected_thread_id.load(std::sync::atomic::Ordering::Acquire),
            self.os.current_thread_id()
        );
        self.selected_thread_id.store(0, std::sync::atomic::Ordering::Release);
    }

    fn selected_thread(&self) -> Option<ThreadId> {
        match self.selected_thread_id.load(std::sync::atomic::Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Increment this thread's ignore level (spec §4.1
    /// `ignore_current_thread`).
    pub fn ignore_current_thread_public(&self) {
        self.ignore_current_thread();
    }

    /// Decrement this thread's ignore level (spec §4.1
    /// `unignore_current_thread`).
    pub fn unignore_current_thread_public(&self) {
        self.unignore_current_thread();
    }

    /// Decrement this thread's ignore level only if positive, reporting
    /// whether it did (spec §4.1 `maybe_unignore_current_thread`).
    pub fn maybe_unignore_current_thread(&self) -> bool {
        let tctx = thread_context::current();
        if tctx.ignore_level() <= 0 {
            return false;
        }
        tctx.pop_ignore();
        true
    }

    /// The function contexts currently on this thread's shadow stack,
    /// innermost first (spec §4.1 `get_current_stack`).
    pub fn current_stack(&self) -> Vec<Arc<FunctionContext>> {
        thread_context::current().current_stack()
    }

    /// Run `f` against the calling thread's innermost in-flight call, or
    /// against `None` if it has none (spec §4.1 `get_current_invocation`).
    pub fn get_current_invocation<R>(&self, f: impl FnOnce(Option<&mut crate::invocation::InvocationContext>) -> R) -> R {
        invocation::current_invocation(self.os.as_ref(), f)
    }

    /// Snapshot the calling thread's shadow-stack depth (spec §4.8
    /// `save`), to later discard frames pushed after this point via
    /// [`Interceptor::restore_shadow_stack`] without ever running their
    /// on-leave trampolines.
    pub fn save_shadow_stack(&self) -> usize {
        thread_context::current().save()
    }

    /// Truncate the calling thread's shadow stack back to a depth
    /// previously returned by [`Interceptor::save_shadow_stack`],
    /// decrementing the usage counter of every discarded frame (spec §4.8
    /// `restore`). For hosts that unwind out of instrumented code (e.g. via
    /// `longjmp`) without returning through the on-leave trampolines that
    /// would otherwise have balanced those counters.
    pub fn restore_shadow_stack(&self, depth: usize) {
        thread_context::current().restore(depth);
    }

    /// Entry point every on-invoke trampoline calls into (spec §4.5).
    pub fn dispatch_enter(
        &self,
        function_ctx: &Arc<FunctionContext>,
        cpu_context: &mut CpuContext,
        caller_ret_addr: &mut CodeAddress,
    ) -> NextHop {
        invocation::dispatch_enter(
            self.identity(),
            self.os.as_ref(),
            function_ctx,
            cpu_context,
            caller_ret_addr,
            self.selected_thread(),
        )
    }

    /// Entry point every on-leave trampoline calls into (spec §4.6).
    pub fn dispatch_leave(&self, cpu_context: &mut CpuContext) -> CodeAddress {
        invocation::dispatch_leave(self.identity(), self.os.as_ref(), cpu_context)
    }
}
