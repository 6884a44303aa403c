//! Virtual address reservation for stream-ordered allocations.
//!
//! An allocation node owns its virtual address from the moment it is added
//! to a graph; physical backing is bound later, at instantiation. Addresses
//! are never reused within a process.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::id::DevicePtr;

/// Alignment of every reserved range.
pub const ALLOCATION_GRANULARITY: u64 = 256;

/// Largest size a single allocation node may request.
pub const MAX_ALLOCATION: u64 = 1 << 40;

const VIRTUAL_BASE: u64 = 0x7f00_0000_0000;

static NEXT_VIRTUAL: AtomicU64 = AtomicU64::new(VIRTUAL_BASE);

/// Rounds `size` up to the allocation granularity (minimum one granule),
/// saturating at the largest aligned size.
pub fn aligned_size(size: u64) -> u64 {
    size.max(1)
        .div_ceil(ALLOCATION_GRANULARITY)
        .saturating_mul(ALLOCATION_GRANULARITY)
}

/// Reserves a fresh virtual range of at least `size` bytes.
pub fn reserve(size: u64) -> DevicePtr {
    DevicePtr(NEXT_VIRTUAL.fetch_add(aligned_size(size), Ordering::Relaxed))
}

/// Returns `true` if `ptr` lies in the reserved virtual window.
pub fn is_virtual(ptr: DevicePtr) -> bool {
    ptr.0 >= VIRTUAL_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_do_not_overlap() {
        let a = reserve(10);
        let b = reserve(1000);
        let c = reserve(1);
        assert!(b.0 >= a.0 + aligned_size(10));
        assert!(c.0 >= b.0 + aligned_size(1000));
        assert_eq!(a.0 % ALLOCATION_GRANULARITY, 0);
        assert!(is_virtual(a));
    }

    #[test]
    fn aligned_size_rounds_up() {
        assert_eq!(aligned_size(0), 256);
        assert_eq!(aligned_size(256), 256);
        assert_eq!(aligned_size(257), 512);
        assert_eq!(aligned_size(u64::MAX) % ALLOCATION_GRANULARITY, 0);
    }
}
