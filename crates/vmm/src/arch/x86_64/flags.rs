//! Page table entry flags for x86_64 architecture.

use ::x86_64::structures::paging::PageTableFlags;

use crate::Protection;

/// Page table entry flags for x86_64.
///
/// This wraps the x86_64 crate's page table entry flags and derives them from an
/// area's [`Protection`]. Pages are always present; execution is denied through the
/// no-execute bit, which requires `EFER.NXE` to be enabled by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl From<Protection> for PageFlags {
    fn from(protection: Protection) -> Self {
        let mut flags = PageTableFlags::PRESENT;
        flags.set(
            PageTableFlags::WRITABLE,
            protection.contains(Protection::WRITE),
        );
        flags.set(
            PageTableFlags::USER_ACCESSIBLE,
            protection.contains(Protection::USER),
        );
        flags.set(
            PageTableFlags::NO_EXECUTE,
            !protection.contains(Protection::EXECUTE),
        );
        Self(flags)
    }
}

impl PageFlags {
    /// Returns the raw x86_64 page table flags.
    pub const fn bits(self) -> PageTableFlags {
        self.0
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    /// Returns whether the no-execute bit is set.
    pub fn is_no_execute(self) -> bool {
        self.0.contains(PageTableFlags::NO_EXECUTE)
    }
}
