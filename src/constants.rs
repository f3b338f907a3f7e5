//! Compile-time tunables (spec §6).
//!
//! These are the only "configuration" this core has: the spec defines them
//! as constants fixed at build time, not a loaded document, so there is no
//! config-file loader here.

/// Maximum depth of the per-thread shadow stack (spec §3, §5). Exceeding
/// this is a fatal programming error, not a recoverable condition.
pub const MAX_CALL_DEPTH: usize = 8192;

/// Maximum number of listeners that may be attached to a single function
/// context at once.
pub const MAX_LISTENERS_PER_FUNCTION: usize = 64;

/// Size in bytes of the per-listener scratch buffer carried by each
/// invocation-stack entry (spec §3, "per-listener scratch buffer of fixed
/// size").
pub const LISTENER_DATA_SLOT_SIZE: usize = 16 * std::mem::size_of::<usize>();

/// Default size of a generated trampoline's code slice. Larger on MIPS,
/// which needs more instructions to synthesize a full-range jump.
#[cfg(target_arch = "mips")]
pub const DEFAULT_CODE_SLICE_SIZE: usize = 1024;

/// Default size of a generated trampoline's code slice on architectures
/// other than MIPS (x86/x86_64/ARM/AArch64).
#[cfg(not(target_arch = "mips"))]
pub const DEFAULT_CODE_SLICE_SIZE: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_depth_is_nonzero() {
        assert!(MAX_CALL_DEPTH > 0);
    }

    #[test]
    fn slot_size_fits_pointer_sized_scratch() {
        assert_eq!(LISTENER_DATA_SLOT_SIZE % std::mem::size_of::<usize>(), 0);
    }
}
