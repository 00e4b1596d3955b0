//! Placement policies and the first-fit gap search.

use alloc::collections::BTreeMap;

use crate::{Area, Protection, VirtualAddress, arch};

/// Ordered area collection of an address space, keyed by base address.
pub(crate) type AreaMap = BTreeMap<VirtualAddress, Area>;

/// How the address of a new area is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Use exactly this address or fail.
    Exact(VirtualAddress),
    /// Try this address; if it is taken or out of range, search like [`Placement::Any`].
    BaseOrAny(VirtualAddress),
    /// The lowest gap anywhere in the address space.
    Any,
    /// The lowest gap within `[start, end)`.
    AnyInRange {
        start: VirtualAddress,
        end: VirtualAddress,
    },
}

/// A request for a new area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaRequest {
    pub placement: Placement,
    /// Size in bytes, a non-zero multiple of the page size.
    pub size: usize,
    /// Minimum alignment of the base address: a power of two, at least one page.
    pub alignment: usize,
    pub protection: Protection,
}

impl AreaRequest {
    /// Creates a page-aligned request with default protection.
    pub const fn new(placement: Placement, size: usize) -> Self {
        Self {
            placement,
            size,
            alignment: arch::PAGE_SIZE,
            protection: Protection::READ,
        }
    }

    /// Requests `size` bytes at exactly `base`.
    pub const fn exact(base: VirtualAddress, size: usize) -> Self {
        Self::new(Placement::Exact(base), size)
    }

    /// Requests `size` bytes preferably at `base`, anywhere otherwise.
    pub const fn base_or_any(base: VirtualAddress, size: usize) -> Self {
        Self::new(Placement::BaseOrAny(base), size)
    }

    /// Requests `size` bytes anywhere.
    pub const fn any(size: usize) -> Self {
        Self::new(Placement::Any, size)
    }

    /// Requests `size` bytes somewhere in `[start, end)`.
    pub const fn in_range(start: VirtualAddress, end: VirtualAddress, size: usize) -> Self {
        Self::new(Placement::AnyInRange { start, end }, size)
    }

    /// Sets the minimum alignment of the base address.
    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets the protection of the new area.
    pub const fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }
}

/// Returns true if no area in `areas` overlaps `[base, base + size)`.
///
/// Only the last area starting below the range's end can collide: every earlier area
/// ends at or before that one's base.
pub(crate) fn is_range_free(areas: &AreaMap, base: VirtualAddress, size: usize) -> bool {
    let end = VirtualAddress::new(base.as_usize() + size);
    match areas.range(..end).next_back() {
        Some((_, area)) => !area.overlaps(base, size),
        None => true,
    }
}

/// Finds the lowest address in `[window_start, window_end)` at or above `from` where
/// `size` bytes aligned to `align` fit between existing areas.
///
/// This is first-fit: the first gap in ascending order that can hold the request wins,
/// even if a tighter gap exists further up.
pub(crate) fn find_gap(
    areas: &AreaMap,
    window_start: usize,
    window_end: usize,
    from: usize,
    size: usize,
    align: usize,
) -> Option<VirtualAddress> {
    let mut cursor = from.max(window_start);

    // An area starting below the cursor may still cover it.
    if let Some((_, previous)) = areas.range(..VirtualAddress::new(cursor)).next_back() {
        cursor = cursor.max(previous.end().as_usize());
    }

    for area in areas.range(VirtualAddress::new(cursor)..).map(|(_, area)| area) {
        let limit = area.base().as_usize().min(window_end);
        if let Some(candidate) = fit(cursor, limit, size, align) {
            return Some(VirtualAddress::new(candidate));
        }
        if area.base().as_usize() >= window_end {
            return None;
        }
        cursor = area.end().as_usize();
    }

    fit(cursor, window_end, size, align).map(VirtualAddress::new)
}

/// Places `size` bytes aligned to `align` at or after `start`, if they end by `limit`.
fn fit(start: usize, limit: usize, size: usize, align: usize) -> Option<usize> {
    let candidate = VirtualAddress::new(start).checked_align_up(align)?;
    let end = candidate.checked_add(size)?;
    (end.as_usize() <= limit).then_some(candidate.as_usize())
}
