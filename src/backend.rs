//! External collaborator traits (spec §6).
//!
//! This core does not generate trampolines, allocate executable memory, or
//! touch OS facilities itself — it is handed implementations of the traits
//! below by the host. Nothing in this file ships a real x86/ARM code
//! generator, a real executable-memory pool, or a real `mprotect` binding;
//! that is explicitly out of scope (spec §1 Non-goals). The `testing`
//! submodule provides minimal in-memory doubles of all three so the rest of
//! this crate is exercisable without a concrete backend.

use crate::address::CodeAddress;
use crate::error::{InterceptorError, Result};
use std::any::Any;

/// Opaque backend-owned trampoline storage. The core never interprets its
/// contents; it only holds it for the trampoline's lifetime and hands it
/// back to [`Backend::destroy_trampoline`].
pub type TrampolineHandle = Box<dyn Any + Send + Sync>;

/// Opaque backend-owned staging code segment, used by the W^X-with-segment
/// commit strategy (spec §4.3).
pub type CodeSegmentHandle = Box<dyn Any + Send + Sync>;

/// OS thread identifier, opaque to this core beyond equality.
pub type ThreadId = u64;

/// A TLS key allocated through [`Os::tls_key_create`].
pub type TlsKey = usize;

/// Page protection requested of [`Os::mprotect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Read + write, no execute.
    Rw,
    /// Read + execute, no write.
    Rx,
    /// Read + write + execute.
    Rwx,
}

/// Whether the host requires all executable pages to carry a valid code
/// signature (spec §4.3, "signed-code-required" strategy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSigningPolicy {
    /// Pages may be written to freely.
    NotRequired,
    /// Pages may not be modified; only pre-grafted trampolines may be
    /// claimed (spec §4.1, "Under signed-code-required policy, resolution
    /// does not follow such redirects").
    Required,
}

/// Everything [`crate::context::FunctionContext::new`] needs back from a
/// successful trampoline synthesis.
pub struct CreatedTrampoline {
    /// Backend-owned storage, released via [`Backend::destroy_trampoline`].
    pub handle: TrampolineHandle,
    /// Address of the "invoke original" continuation.
    pub on_invoke_trampoline: CodeAddress,
    /// Address of the on-leave trampoline the engine installs as a
    /// caller's return address when it must trap on return.
    pub on_leave_trampoline: CodeAddress,
    /// Number of prologue bytes this trampoline overwrites.
    pub overwritten_prologue_len: usize,
}

/// Architecture-specific code generator (spec §6, "the backend"). Out of
/// scope to implement here; this core only consumes it.
pub trait Backend: Send + Sync {
    /// Synthesize on-invoke and on-leave stubs for `target_address`.
    fn create_trampoline(&self, target_address: CodeAddress) -> Result<CreatedTrampoline>;

    /// Release a trampoline's backend-owned storage. Called only after the
    /// batcher has restored the original prologue and the usage counter
    /// has drained to zero (spec §4.4).
    fn destroy_trampoline(&self, handle: TrampolineHandle);

    /// Write the jump to the trampoline at `prologue_ptr`, which may be a
    /// staged copy of the live page rather than the live address itself.
    fn activate_trampoline(&self, handle: &TrampolineHandle, prologue_ptr: CodeAddress);

    /// Restore the original prologue bytes at `prologue_ptr`.
    fn deactivate_trampoline(&self, handle: &TrampolineHandle, prologue_ptr: CodeAddress);

    /// Adopt a pre-existing compiler-inserted stub instead of patching the
    /// prologue, for signed-code hosts. Returns `None` if none is present.
    fn claim_grafted_trampoline(&self, target_address: CodeAddress) -> Option<CreatedTrampoline>;

    /// Follow an existing jump/trampoline at `address`, if any.
    fn resolve_redirect(&self, address: CodeAddress) -> Option<CodeAddress>;

    /// The actual prologue-write address for this context; on some
    /// architectures this differs from the logical target address.
    fn function_address(&self, target_address: CodeAddress) -> CodeAddress;
}

/// Executable-memory pool (spec §6, "code allocator").
pub trait CodeAllocator: Send + Sync {
    /// Reserve a pool of at least `size` bytes of executable memory.
    fn init(&self, size: usize) -> Result<()>;
    /// Make any reservations made since the last commit executable.
    fn commit(&self);
    /// Release the pool.
    fn free(&self);
}

/// OS facilities this core needs (spec §6): page protection, i-cache
/// control, thread enumeration/suspend/resume, thread-local storage,
/// thread-error access, and code-signing policy.
pub trait Os: Send + Sync {
    /// Page size of the host, used to round trampoline targets to page
    /// boundaries for the update batcher.
    fn page_size(&self) -> usize;

    /// Change protection on the page(s) starting at `page` for `size`
    /// bytes.
    fn mprotect(&self, page: CodeAddress, size: usize, protection: Protection) -> Result<()>;

    /// Flush the instruction cache for the page(s) starting at `page`.
    fn flush_icache(&self, page: CodeAddress, size: usize);

    /// All live thread ids on the host, used by the W^X-no-segment commit
    /// strategy to suspend every thread but the caller's.
    fn enumerate_threads(&self) -> Vec<ThreadId>;

    /// The calling thread's id.
    fn current_thread_id(&self) -> ThreadId;

    /// Suspend a thread; returns `false` if it could not be suspended
    /// (already exited, access denied, etc).
    fn suspend_thread(&self, id: ThreadId) -> bool;

    /// Resume a previously suspended thread.
    fn resume_thread(&self, id: ThreadId);

    /// Whether this host requires signed code.
    fn code_signing_policy(&self) -> CodeSigningPolicy;

    /// Whether RWX pages are permitted on this host.
    fn is_rwx_supported(&self) -> bool;

    /// Whether the host supports staging code in a separate segment and
    /// mapping it over live pages (the W^X-with-segment strategy).
    fn is_code_segment_supported(&self) -> bool;

    /// Allocate a staging code segment of `size` bytes.
    fn code_segment_alloc(&self, size: usize) -> Result<CodeSegmentHandle>;
    /// The writable address backing a staging segment before it is
    /// realized.
    fn code_segment_address(&self, segment: &CodeSegmentHandle) -> CodeAddress;
    /// Make a staging segment's contents executable.
    fn code_segment_realize(&self, segment: &CodeSegmentHandle);
    /// Map `size` bytes at `offset` within a realized segment over
    /// `target_page`.
    fn code_segment_map(
        &self,
        segment: &CodeSegmentHandle,
        offset: usize,
        size: usize,
        target_page: CodeAddress,
    );
    /// Release a staging segment.
    fn code_segment_free(&self, segment: CodeSegmentHandle);

    /// Read the calling thread's OS error value (errno / `GetLastError`).
    fn get_last_error(&self) -> i32;
    /// Write the calling thread's OS error value.
    fn set_last_error(&self, value: i32);

    /// Allocate a new TLS key.
    fn tls_key_create(&self) -> TlsKey;
    /// Free a TLS key.
    fn tls_key_free(&self, key: TlsKey);
    /// Read a TLS slot.
    fn tls_get(&self, key: TlsKey) -> usize;
    /// Write a TLS slot.
    fn tls_set(&self, key: TlsKey, value: usize);

    /// Strip pointer-authentication/Thumb tags from `address`. Hosts
    /// without such tagging may rely on the default, architecture-neutral
    /// implementation.
    fn strip_code_pointer(&self, address: CodeAddress) -> CodeAddress {
        crate::address::strip_code_pointer(address)
    }

    /// Re-apply whatever signing the host's ABI expects before `address`
    /// is written back as a return address. The default is the identity
    /// function; ARM64e hosts override it to perform real PAC signing.
    fn sign_code_pointer(&self, address: CodeAddress) -> CodeAddress {
        address
    }
}

/// Convert a generic allocator/backend failure reason into the taxonomy of
/// spec §7, distinguishing resource exhaustion from permanent rejection.
pub fn wrong_signature(reason: impl Into<String>) -> InterceptorError {
    InterceptorError::WrongSignature {
        reason: reason.into(),
    }
}

/// In-memory doubles of [`Backend`], [`CodeAllocator`] and [`Os`], enabled
/// under the `test-support` feature so the rest of this crate's logic
/// (instrumentation manager, invocation engine, transaction batcher) can be
/// exercised without a concrete architecture backend or real executable
/// memory. None of this is meant for production hosts.
#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A fake "prologue": just a byte counter the test backend patches
    /// in-place instead of writing real machine code.
    #[derive(Debug, Default)]
    struct FakePage {
        patched: bool,
    }

    /// A [`Backend`] double that hands out monotonically increasing fake
    /// addresses instead of generating real trampolines, and tracks which
    /// fake "prologues" are currently patched.
    pub struct TestBackend {
        next_address: AtomicUsize,
        pages: Mutex<HashMap<CodeAddress, FakePage>>,
    }

    impl TestBackend {
        pub fn new() -> Self {
            Self {
                next_address: AtomicUsize::new(0x1000_0000),
                pages: Mutex::new(HashMap::new()),
            }
        }

        fn fresh_address(&self) -> CodeAddress {
            self.next_address.fetch_add(0x100, Ordering::Relaxed)
        }

        /// Whether the fake prologue at `address` is currently patched.
        pub fn is_patched(&self, address: CodeAddress) -> bool {
            self.pages
                .lock()
                .get(&address)
                .map(|p| p.patched)
                .unwrap_or(false)
        }
    }

    impl Default for TestBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Backend for TestBackend {
        fn create_trampoline(&self, target_address: CodeAddress) -> Result<CreatedTrampoline> {
            if target_address == 0 {
                return Err(wrong_signature("null target address"));
            }
            self.pages.lock().entry(target_address).or_default();
            Ok(CreatedTrampoline {
                handle: Box::new(target_address),
                on_invoke_trampoline: self.fresh_address(),
                on_leave_trampoline: self.fresh_address(),
                overwritten_prologue_len: 8,
            })
        }

        fn destroy_trampoline(&self, _handle: TrampolineHandle) {}

        fn activate_trampoline(&self, handle: &TrampolineHandle, prologue_ptr: CodeAddress) {
            let _ = handle;
            self.pages
                .lock()
                .entry(prologue_ptr)
                .or_default()
                .patched = true;
        }

        fn deactivate_trampoline(&self, handle: &TrampolineHandle, prologue_ptr: CodeAddress) {
            let _ = handle;
            self.pages
                .lock()
                .entry(prologue_ptr)
                .or_default()
                .patched = false;
        }

        fn claim_grafted_trampoline(&self, _target_address: CodeAddress) -> Option<CreatedTrampoline> {
            None
        }

        fn resolve_redirect(&self, _address: CodeAddress) -> Option<CodeAddress> {
            None
        }

        fn function_address(&self, target_address: CodeAddress) -> CodeAddress {
            target_address
        }
    }

    /// A [`CodeAllocator`] double: just counts lifecycle calls.
    #[derive(Default)]
    pub struct TestCodeAllocator {
        pub init_calls: AtomicUsize,
        pub commit_calls: AtomicUsize,
        pub free_calls: AtomicUsize,
    }

    impl TestCodeAllocator {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl CodeAllocator for TestCodeAllocator {
        fn init(&self, _size: usize) -> Result<()> {
            self.init_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn commit(&self) {
            self.commit_calls.fetch_add(1, Ordering::Relaxed);
        }

        fn free(&self) {
            self.free_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// An [`Os`] double running entirely in-process: "threads" are tracked
    /// in a set, TLS is a plain `HashMap<TlsKey, usize>` per thread (backed
    /// by a real `thread_local!`, since tests run as real OS threads),
    /// page protection is recorded rather than enforced, and thread-error
    /// is a simple `Cell`.
    pub struct TestOs {
        policy: CodeSigningPolicy,
        rwx_supported: bool,
        code_segment_supported: bool,
        page_size: usize,
        suspended: Mutex<Vec<ThreadId>>,
        next_tls_key: AtomicUsize,
        next_thread_id: AtomicU64,
        pub suspend_rounds: AtomicUsize,
        pub mprotect_calls: Mutex<Vec<(CodeAddress, Protection)>>,
    }

    thread_local! {
        static TLS_SLOTS: std::cell::RefCell<HashMap<TlsKey, usize>> =
            std::cell::RefCell::new(HashMap::new());
        static THIS_THREAD_ID: ThreadId = TestOs::allocate_thread_id();
    }

    impl TestOs {
        pub fn new() -> Self {
            Self {
                policy: CodeSigningPolicy::NotRequired,
                rwx_supported: true,
                code_segment_supported: false,
                page_size: 4096,
                suspended: Mutex::new(Vec::new()),
                next_tls_key: AtomicUsize::new(1),
                next_thread_id: AtomicU64::new(1),
                suspend_rounds: AtomicUsize::new(0),
                mprotect_calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_policy(policy: CodeSigningPolicy) -> Self {
            Self {
                policy,
                ..Self::new()
            }
        }

        pub fn with_rwx(rwx_supported: bool, code_segment_supported: bool) -> Self {
            Self {
                rwx_supported,
                code_segment_supported,
                ..Self::new()
            }
        }

        fn allocate_thread_id() -> ThreadId {
            // Each real OS thread gets a distinct fake id on first touch.
            static COUNTER: AtomicU64 = AtomicU64::new(1);
            COUNTER.fetch_add(1, Ordering::Relaxed)
        }
    }

    impl Default for TestOs {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Os for TestOs {
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn mprotect(&self, page: CodeAddress, _size: usize, protection: Protection) -> Result<()> {
            self.mprotect_calls.lock().push((page, protection));
            Ok(())
        }

        fn flush_icache(&self, _page: CodeAddress, _size: usize) {}

        fn enumerate_threads(&self) -> Vec<ThreadId> {
            // The double only ever "knows about" the current thread plus
            // whatever the test harness has told it to suspend. The
            // no-RWX commit strategy calls this exactly once per commit
            // (never per-page or per-function), so counting calls here
            // doubles as the "one suspend round per commit" counter.
            self.suspend_rounds.fetch_add(1, Ordering::Relaxed);
            self.suspended.lock().clone()
        }

        fn current_thread_id(&self) -> ThreadId {
            THIS_THREAD_ID.with(|id| *id)
        }

        fn suspend_thread(&self, id: ThreadId) -> bool {
            self.suspended.lock().push(id);
            true
        }

        fn resume_thread(&self, id: ThreadId) {
            self.suspended.lock().retain(|&t| t != id);
        }

        fn code_signing_policy(&self) -> CodeSigningPolicy {
            self.policy
        }

        fn is_rwx_supported(&self) -> bool {
            self.rwx_supported
        }

        fn is_code_segment_supported(&self) -> bool {
            self.code_segment_supported
        }

        fn code_segment_alloc(&self, size: usize) -> Result<CodeSegmentHandle> {
            Ok(Box::new(Mutex::new(vec![0u8; size])))
        }

        fn code_segment_address(&self, segment: &CodeSegmentHandle) -> CodeAddress {
            let buf = segment.downcast_ref::<Mutex<Vec<u8>>>().unwrap();
            buf.lock().as_ptr() as CodeAddress
        }

        fn code_segment_realize(&self, _segment: &CodeSegmentHandle) {}

        fn code_segment_map(
            &self,
            _segment: &CodeSegmentHandle,
            _offset: usize,
            _size: usize,
            _target_page: CodeAddress,
        ) {
        }

        fn code_segment_free(&self, _segment: CodeSegmentHandle) {}

        fn get_last_error(&self) -> i32 {
            TLS_SLOTS.with(|slots| *slots.borrow().get(&0).unwrap_or(&0) as i32)
        }

        fn set_last_error(&self, value: i32) {
            TLS_SLOTS.with(|slots| {
                slots.borrow_mut().insert(0, value as usize);
            });
        }

        fn tls_key_create(&self) -> TlsKey {
            self.next_tls_key.fetch_add(1, Ordering::Relaxed)
        }

        fn tls_key_free(&self, key: TlsKey) {
            TLS_SLOTS.with(|slots| {
                slots.borrow_mut().remove(&key);
            });
        }

        fn tls_get(&self, key: TlsKey) -> usize {
            TLS_SLOTS.with(|slots| *slots.borrow().get(&key).unwrap_or(&0))
        }

        fn tls_set(&self, key: TlsKey, value: usize) {
            TLS_SLOTS.with(|slots| {
                slots.borrow_mut().insert(key, value);
            });
        }
    }

    /// Bundle of doubles plus an `Arc` to the backend for tests that need
    /// to assert on it directly (e.g. `is_patched`).
    pub struct TestHost {
        pub backend: Arc<TestBackend>,
        pub allocator: Arc<TestCodeAllocator>,
        pub os: Arc<TestOs>,
    }

    impl TestHost {
        pub fn new() -> Self {
            Self {
                backend: Arc::new(TestBackend::new()),
                allocator: Arc::new(TestCodeAllocator::new()),
                os: Arc::new(TestOs::new()),
            }
        }
    }

    impl Default for TestHost {
        fn default() -> Self {
            Self::new()
        }
    }
}
