//! Areas: contiguous virtual ranges inside an address space.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{Protection, VirtualAddress, context::ProcessId};

/// Source of area identifiers, shared by every address space.
static NEXT_AREA_ID: AtomicU64 = AtomicU64::new(0);

/// Identifies an area.
///
/// Identifiers are unique across all address spaces and never reused, so a stale copy of
/// a removed area cannot be mistaken for a newer area placed at the same base, even in a
/// later space of a process id that was registered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(u64);

impl AreaId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates a fresh identifier.
    pub(crate) fn next() -> Self {
        Self::new(NEXT_AREA_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A contiguous, page-aligned virtual range with uniform protection.
///
/// Areas are owned by exactly one address space. Values handed out to callers are
/// copies; the `owner` field names the space without keeping it alive.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Area {
    id: AreaId,
    base: VirtualAddress,
    size: usize,
    protection: Protection,
    owner: ProcessId,
}

impl Area {
    pub(crate) const fn new(
        id: AreaId,
        base: VirtualAddress,
        size: usize,
        protection: Protection,
        owner: ProcessId,
    ) -> Self {
        Self {
            id,
            base,
            size,
            protection,
            owner,
        }
    }

    /// Returns the identifier of this area.
    pub const fn id(&self) -> AreaId {
        self.id
    }

    /// Returns the base address of this area.
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the size of this area in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the end address (exclusive) of this area.
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_usize() + self.size)
    }

    /// Returns the protection of this area.
    pub const fn protection(&self) -> Protection {
        self.protection
    }

    /// Returns the process owning the address space this area belongs to.
    pub const fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Returns true if `address` lies within this area.
    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.base && address < self.end()
    }

    /// Returns true if this area overlaps `[base, base + size)`.
    pub fn overlaps(&self, base: VirtualAddress, size: usize) -> bool {
        base.as_usize() < self.end().as_usize() && self.base.as_usize() < base.as_usize() + size
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub(crate) fn set_protection(&mut self, protection: Protection) {
        self.protection = protection;
    }
}

impl fmt::Debug for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Area {{ id: {}, range: {}..{}, protection: {:?}, owner: {} }}",
            self.id.as_u64(),
            self.base,
            self.end(),
            self.protection,
            self.owner
        )
    }
}
