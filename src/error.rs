//! Error types for the interceptor core.
//!
//! Attach/replace report structured codes rather than signalling failure
//! out-of-band (see spec §7); this module is the taxonomy those codes are
//! drawn from. Transient conditions (pending usage counters, pending
//! destroys) are never represented here — they are rescheduled silently by
//! the transaction batcher. Internal invariant violations are programming
//! errors and `panic!`/`unreachable!`, not `InterceptorError` variants.

use thiserror::Error;

/// Errors returned by the public attach/replace/revert surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterceptorError {
    /// The listener is already attached to this address.
    #[error("listener already attached to this address")]
    AlreadyAttached,

    /// A replacement is already installed at this address.
    #[error("a replacement is already installed at this address")]
    AlreadyReplaced,

    /// The backend could not generate a trampoline for this prologue:
    /// too short, an unsupported instruction, or a relocation failure.
    #[error("backend refused to generate a trampoline: {reason}")]
    WrongSignature {
        /// Backend-supplied description of why the prologue was rejected.
        reason: String,
    },

    /// The host requires signed code and no pre-grafted trampoline stub
    /// is available at this address.
    #[error("code-signing policy forbids writing to this address")]
    PolicyViolation,

    /// The address is already bound as the other interception kind
    /// (listener-based vs. fast replacement-only).
    #[error("address is already bound as the other interception kind")]
    WrongType,

    /// The code allocator could not reserve storage for a trampoline.
    /// Distinct from `WrongSignature`: this is a resource condition that
    /// may succeed on retry after other contexts are destroyed, whereas
    /// a wrong-signature rejection never will.
    #[error("code allocator exhausted: {reason}")]
    AllocatorExhausted {
        /// Allocator-supplied description of the exhaustion.
        reason: String,
    },

    /// No function context is registered at this address.
    #[error("address is not instrumented")]
    NotInstrumented,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, InterceptorError>;
