//! Address canonicalization (spec §9, "Pointer authentication / Thumb bit").
//!
//! Address comparisons and hash keys use a canonicalized form (pointer
//! authentication stripped, Thumb bit cleared); return-address writes
//! restore signing. Both address resolution (`Interceptor::attach`) and PC
//! fixup (the entry/leave dispatch) need the identical transform, so it is
//! factored out here instead of being duplicated.

/// An address as observed by the caller: may carry a pointer-authentication
/// code in its high bits (ARM64e) or a Thumb-mode tag in bit 0 (32-bit ARM).
pub type RawAddress = usize;

/// An address with authentication/mode tags removed, suitable for use as a
/// map key or for equality comparisons against a canonical function address.
pub type CodeAddress = usize;

#[cfg(target_arch = "aarch64")]
const PAC_MASK: usize = 0x00ff_ffff_ffff_ffff;

/// Strip pointer-authentication bits and clear the Thumb bit, producing the
/// canonical form used for map keys and equality checks.
pub fn strip_code_pointer(address: RawAddress) -> CodeAddress {
    #[cfg(target_arch = "aarch64")]
    let address = address & PAC_MASK;

    #[cfg(target_arch = "arm")]
    let address = address & !1usize;

    address
}

/// Re-apply whatever tagging the host's ABI expects on a return address
/// before writing it back into a caller's stack frame. On hosts without
/// pointer authentication this is the identity function; where the `Os`
/// backend in use requires signing (ARM64e), callers resign via
/// `Os::sign_code_pointer` instead of this helper — this function only
/// normalizes the *comparison* key, never produces a pointer that is
/// written back to executable control-flow state.
pub fn is_canonical(address: RawAddress) -> bool {
    strip_code_pointer(address) == address
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_on_plain_addresses() {
        let addr = 0x1000usize;
        assert_eq!(strip_code_pointer(addr), addr);
        assert!(is_canonical(addr));
    }

    #[cfg(target_arch = "arm")]
    #[test]
    fn clears_thumb_bit() {
        assert_eq!(strip_code_pointer(0x1001), 0x1000);
        assert!(!is_canonical(0x1001));
    }
}
