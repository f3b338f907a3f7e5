//! Batches and commits the executable-memory updates a whole nesting level
//! of interceptor calls accumulates, using whichever of the host's update
//! strategies its [`Os`] capabilities allow (spec §4.3).

use crate::address::CodeAddress;
use crate::backend::{Backend, CodeAllocator, CodeSigningPolicy, Os, Protection};
use crate::context::FunctionContext;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Which side of a trampoline's lifecycle an [`UpdateTask`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Activate,
    Deactivate,
}

/// One pending prologue write, queued against the page(s) it touches.
pub struct UpdateTask {
    pub ctx: Arc<FunctionContext>,
    pub kind: UpdateKind,
}

/// A deferred trampoline teardown, run once its context's usage counter has
/// drained to zero (spec §4.4).
pub struct DestroyTask {
    pub ctx: Arc<FunctionContext>,
    pub notify: DestroyNotify,
}

pub type DestroyNotify = Box<dyn FnOnce() + Send>;

/// Accumulates the work produced by one nesting level of
/// `begin_transaction`/`end_transaction` (spec §3, "Transaction"). Pages
/// are keyed in a [`BTreeMap`] so [`Transaction::take_if_outermost`]'s
/// caller iterates them in ascending address order for free, matching the
/// deterministic ordering the commit algorithm depends on.
pub struct Transaction {
    level: i32,
    is_dirty: bool,
    pending_destroy: VecDeque<DestroyTask>,
    pending_update: BTreeMap<CodeAddress, Vec<UpdateTask>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            level: 0,
            is_dirty: false,
            pending_destroy: VecDeque::new(),
            pending_update: BTreeMap::new(),
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn begin(&mut self) {
        self.level += 1;
    }

    /// Close one nesting level. If this was the outermost level and there
    /// is work pending, swaps in a fresh, empty `Transaction` and returns
    /// the one just closed for the caller to commit. Otherwise leaves
    /// `self` untouched and returns `None` (spec §4.3, "nesting").
    pub fn take_if_outermost(&mut self) -> Option<Transaction> {
        self.level -= 1;
        if self.level > 0 || !self.is_dirty {
            return None;
        }
        self.is_dirty = false;
        Some(std::mem::replace(self, Transaction::new()))
    }

    pub fn schedule_destroy(&mut self, ctx: Arc<FunctionContext>, notify: DestroyNotify) {
        self.is_dirty = true;
        self.pending_destroy.push_back(DestroyTask { ctx, notify });
    }

    /// Re-queue a destroy task whose context was still in use when a
    /// commit drained the queue (spec §4.4, "still in use... rescheduled
    /// into the next transaction").
    pub fn reschedule_destroy(&mut self, task: DestroyTask) {
        self.is_dirty = true;
        self.pending_destroy.push_back(task);
    }

    pub fn take_pending_destroy(&mut self) -> VecDeque<DestroyTask> {
        std::mem::take(&mut self.pending_destroy)
    }

    /// Queue a prologue write against the page(s) its target spans. When
    /// the overwritten prologue straddles a page boundary, the end page is
    /// registered too (so its protection is flipped / it is included in
    /// the staged segment) even though the write itself is issued once,
    /// from the start page's bucket — mirroring the host's own trampoline
    /// writer, which performs a single write spanning both pages.
    pub fn schedule_update(&mut self, ctx: Arc<FunctionContext>, kind: UpdateKind, page_size: usize, prologue_write_address: CodeAddress) {
        self.is_dirty = true;

        let start_page = page_address(prologue_write_address, page_size);
        let end_page = page_address(
            prologue_write_address + ctx.overwritten_prologue_len.saturating_sub(1),
            page_size,
        );

        self.pending_update
            .entry(start_page)
            .or_default()
            .push(UpdateTask { ctx, kind });

        if end_page != start_page {
            self.pending_update.entry(end_page).or_default();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending_destroy.is_empty() && self.pending_update.is_empty()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

fn page_address(address: CodeAddress, page_size: usize) -> CodeAddress {
    address - (address % page_size)
}

/// Apply the host's commit strategy to every queued [`UpdateTask`] in
/// `taken` (spec §4.3). Does not touch `taken.pending_destroy` — draining
/// that queue requires releasing the interceptor's lock around each
/// notification, which only [`crate::interceptor::Interceptor`] can do.
pub fn commit(taken: &Transaction, backend: &dyn Backend, allocator: &dyn CodeAllocator, os: &dyn Os) {
    allocator.commit();

    if taken.pending_update.is_empty() {
        return;
    }

    match os.code_signing_policy() {
        CodeSigningPolicy::Required => commit_signed_code_required(taken, backend),
        CodeSigningPolicy::NotRequired => {
            let rwx_supported = os.is_rwx_supported();
            let code_segment_supported = os.is_code_segment_supported();

            if rwx_supported || !code_segment_supported {
                commit_direct(taken, backend, os, rwx_supported);
            } else {
                commit_staged_segment(taken, backend, os);
            }
        }
    }
}

/// Mirrors the host's own activate/deactivate entry points: a context that
/// has already been marked destroyed never gets (re-)activated, and the
/// `activated` bookkeeping flag is flipped before the backend call so a
/// concurrent reader never observes a trampoline mid-flight as inactive.
fn apply(update: &UpdateTask, backend: &dyn Backend, prologue_ptr: CodeAddress) {
    match update.kind {
        UpdateKind::Activate => {
            if update.ctx.destroyed() {
                return;
            }
            update.ctx.set_activated(true);
            update.ctx.with_trampoline_handle(|h| backend.activate_trampoline(h, prologue_ptr));
        }
        UpdateKind::Deactivate => {
            update.ctx.set_activated(false);
            update.ctx.with_trampoline_handle(|h| backend.deactivate_trampoline(h, prologue_ptr));
        }
    }
}

/// Pages are signed and immutable; only pre-grafted trampolines may ever be
/// claimed, so the "write" here never touches page contents — it just
/// flips each context's own activation bookkeeping at its real address
/// (spec §4.3, "signed-code-required").
fn commit_signed_code_required(taken: &Transaction, backend: &dyn Backend) {
    for tasks in taken.pending_update.values() {
        for update in tasks {
            let address = backend.function_address(update.ctx.target_address);
            apply(update, backend, address);
        }
    }
}

/// RWX pages (or hosts with no staged-segment alternative) are updated in
/// place: flip every touched page writable, apply every task, flip back to
/// executable, flush the instruction cache. When RWX itself is
/// unavailable, every other thread is suspended for the duration so none
/// of them can execute a half-written prologue (spec §4.3, "W^X without a
/// code segment").
fn commit_direct(taken: &Transaction, backend: &dyn Backend, os: &dyn Os, rwx_supported: bool) {
    let page_size = os.page_size();
    let protection = if rwx_supported { Protection::Rwx } else { Protection::Rw };

    let mut suspended = Vec::new();
    if !rwx_supported {
        let current = os.current_thread_id();
        for id in os.enumerate_threads() {
            if id == current {
                continue;
            }
            if os.suspend_thread(id) {
                suspended.push(id);
            }
        }
        debug!(count = suspended.len(), "suspended threads for in-place commit");
    }

    for &page in taken.pending_update.keys() {
        let _ = os.mprotect(page, page_size, protection);
    }

    for tasks in taken.pending_update.values() {
        for update in tasks {
            let address = backend.function_address(update.ctx.target_address);
            apply(update, backend, address);
        }
    }

    if !rwx_supported {
        for &page in taken.pending_update.keys() {
            let _ = os.mprotect(page, page_size, Protection::Rx);
        }
    }

    for &page in taken.pending_update.keys() {
        os.flush_icache(page, page_size);
    }

    for id in suspended {
        os.resume_thread(id);
    }
}

/// Stage every touched page's contents in a separate, writable segment,
/// apply every task against the staged copies, realize the segment as
/// executable, then map each staged page over its live counterpart one at
/// a time (spec §4.3, "W^X with a code segment"). No live page is ever
/// directly writable.
fn commit_staged_segment(taken: &Transaction, backend: &dyn Backend, os: &dyn Os) {
    let page_size = os.page_size();
    let num_pages = taken.pending_update.len();

    let segment = match os.code_segment_alloc(num_pages * page_size) {
        Ok(segment) => segment,
        Err(err) => {
            trace!(?err, "failed to allocate staging code segment");
            return;
        }
    };
    let source_base = os.code_segment_address(&segment);

    for (offset, tasks) in taken.pending_update.values().enumerate() {
        let staged_page = source_base + offset * page_size;
        for update in tasks {
            let live_address = backend.function_address(update.ctx.target_address);
            let live_page = page_address(live_address, page_size);
            let staged_address = staged_page + (live_address - live_page);
            apply(update, backend, staged_address);
        }
    }

    os.code_segment_realize(&segment);

    for (offset, &page) in taken.pending_update.keys().enumerate() {
        os.code_segment_map(&segment, offset * page_size, page_size, page);
        os.flush_icache(page, page_size);
    }

    os.code_segment_free(segment);
}
