//! Area protection attributes.

use bitflags::bitflags;

bitflags! {
    /// Access permissions of an area.
    ///
    /// The address-space manager treats these as opaque and hands them to the
    /// translation layer unchanged; only fault classification inspects them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// The area may be read.
        const READ = 1 << 0;
        /// The area may be written.
        const WRITE = 1 << 1;
        /// Instructions may be fetched from the area.
        const EXECUTE = 1 << 2;
        /// The area is accessible from user mode.
        const USER = 1 << 3;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Protection {
    /// Returns whether an access of kind `access` is permitted.
    pub fn allows(self, access: Protection) -> bool {
        self.contains(access)
    }
}

impl Default for Protection {
    fn default() -> Self {
        Self::READ
    }
}
