//! Resumable iteration over the areas of an address space.

use core::ops::Bound;

use crate::{Area, AreasReadGuard, TranslationLayer, VirtualAddress};

/// A position in the area list of one address space.
///
/// Unlike an iterator, a cursor does not borrow the lock: it remembers the base of the
/// last area it returned and the change counter it was created under. Callers may drop
/// the read lock between steps and take it again later.
///
/// Callers must hold a read guard for the duration of each [`AreaCursor::next_area`]
/// call, which the signature enforces. After re-locking they should check
/// [`AreaCursor::is_stale`]: if the space changed in between, the cursor still returns
/// each remaining area at most once and in ascending order, but areas inserted behind it
/// are missed and the walk no longer describes a single snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaCursor {
    /// Serial of the address space the cursor walks.
    space: u64,
    last: Option<VirtualAddress>,
    changes: u64,
}

impl AreaCursor {
    pub(crate) fn new(space: u64, changes: u64) -> Self {
        Self {
            space,
            last: None,
            changes,
        }
    }

    /// Returns the area following the last one returned, in ascending address order.
    ///
    /// Returns None at the end of the list, or if `areas` locks a different address space
    /// than the one this cursor was created for, even one of the same process.
    pub fn next_area<L: TranslationLayer>(&mut self, areas: &AreasReadGuard<'_, L>) -> Option<Area> {
        if areas.space().serial() != self.space {
            return None;
        }

        let map = areas.area_map();
        let next = match self.last {
            None => map.values().next(),
            Some(last) => map
                .range((Bound::Excluded(last), Bound::Unbounded))
                .next()
                .map(|(_, area)| area),
        };

        let area = *next?;
        self.last = Some(area.base());
        Some(area)
    }

    /// Returns true if the address space changed since this cursor was created or rewound.
    pub fn is_stale<L: TranslationLayer>(&self, areas: &AreasReadGuard<'_, L>) -> bool {
        areas.space().serial() != self.space || areas.change_count() != self.changes
    }

    /// Moves the cursor back before the first area and takes a fresh snapshot of the
    /// change counter.
    pub fn rewind<L: TranslationLayer>(&mut self, areas: &AreasReadGuard<'_, L>) {
        self.space = areas.space().serial();
        self.last = None;
        self.changes = areas.change_count();
    }
}
