//! Virtual address type used throughout the address-space manager.
//!
//! Addresses here are plain numbers within an address space's window. Whether
//! an address is canonical for the hardware is the translation layer's
//! concern, so no canonical-form validation happens at construction.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

/// A virtual memory address.
///
/// This is a newtype wrapper around a raw `usize`. It provides alignment helpers and
/// overflow-checked arithmetic for placement computations.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    /// The lowest virtual address.
    pub const ZERO: Self = Self(0);

    /// Creates a new virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Checks if the address is aligned to the given alignment.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Returns whether the address is aligned to the architecture page size.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.is_aligned(arch::PAGE_SIZE)
    }

    /// Aligns the address down to the given alignment.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }

    /// Aligns the address up to the given alignment, returning `None` on overflow.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub const fn checked_align_up(self, align: usize) -> Option<Self> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        match self.0.checked_add(align - 1) {
            Some(raw) => Some(Self(raw & !(align - 1))),
            None => None,
        }
    }

    /// Adds a byte offset, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the page-aligned address of the page containing this address.
    #[inline]
    pub const fn page_base(self) -> Self {
        self.align_down(arch::PAGE_SIZE)
    }
}

impl fmt::Pointer for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for VirtualAddress {
    #[inline]
    fn from(addr: usize) -> Self {
        Self::new(addr)
    }
}

impl From<VirtualAddress> for usize {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        addr.0
    }
}

impl Add<usize> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub<VirtualAddress> for VirtualAddress {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: VirtualAddress) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Returns whether `size` is a non-zero multiple of the page size.
#[inline]
pub const fn is_page_multiple(size: usize) -> bool {
    size != 0 && size & (arch::PAGE_SIZE - 1) == 0
}
