//! x86_64 architecture-specific implementation.
//!
//! This module provides the hardware translation layer for x86_64 with 4-level paging,
//! along with the page size and the default kernel/user windows.

use ::x86_64::VirtAddr;

mod flags;
mod translation;

pub use flags::PageFlags;
pub use translation::{HardwareMap, HardwareTranslationLayer};

/// Default page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Lowest address of the default user window.
pub const USER_BASE: usize = 0;

/// Size of the default user window: the canonical lower half (128 TiB).
pub const USER_SIZE: usize = 0x0000_8000_0000_0000;

/// Lowest address of the default kernel window: the start of the canonical upper half.
pub const KERNEL_BASE: usize = 0xFFFF_8000_0000_0000;

/// Size of the default kernel window. The top page is left out so the window's end
/// stays representable.
pub const KERNEL_SIZE: usize = 0x0000_7FFF_FFFF_F000;

/// Index of the first level-4 entry belonging to the kernel half.
pub(crate) const KERNEL_HALF_START: usize = 256;

/// Returns true if `[base, base + size)` is non-empty and lies entirely within one
/// canonical half of the address space.
pub fn is_canonical_range(base: usize, size: usize) -> bool {
    let Some(last) = size.checked_sub(1).and_then(|offset| base.checked_add(offset)) else {
        return false;
    };
    match (VirtAddr::try_new(base as u64), VirtAddr::try_new(last as u64)) {
        (Ok(first), Ok(last)) => {
            (first.as_u64() < KERNEL_BASE as u64) == (last.as_u64() < KERNEL_BASE as u64)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ranges() {
        assert!(is_canonical_range(USER_BASE, USER_SIZE));
        assert!(is_canonical_range(KERNEL_BASE, KERNEL_SIZE));
        assert!(!is_canonical_range(USER_BASE, USER_SIZE + PAGE_SIZE));
        assert!(!is_canonical_range(0x0000_9000_0000_0000, PAGE_SIZE));
        assert!(!is_canonical_range(KERNEL_BASE - PAGE_SIZE, 2 * PAGE_SIZE));
        assert!(!is_canonical_range(KERNEL_BASE, 0));
    }
}
