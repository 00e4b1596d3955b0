//! Emulated translation layer.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::PAGE_SIZE;
use crate::{Protection, TranslationError, TranslationLayer, VirtualAddress, context::ProcessId};

/// A translation map for software emulation.
///
/// Records every mapped page and its protection instead of building page tables.
pub struct EmulatedMap {
    owner: ProcessId,
    pages: Mutex<BTreeMap<VirtualAddress, Protection>>,
}

impl EmulatedMap {
    /// Returns the process this map was created for.
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Returns the number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns the protection of the page containing `address`, or None if it is not mapped.
    pub fn translate(&self, address: VirtualAddress) -> Option<Protection> {
        self.pages.lock().get(&address.page_base()).copied()
    }
}

/// Translation layer for software emulation.
///
/// Physical memory is modelled as a budget of pages: mapping a range consumes one page
/// of budget per virtual page, unmapping returns it. The layer also counts created and
/// destroyed maps so tests can observe address-space teardown.
pub struct EmulatedTranslationLayer {
    /// Pages of "physical memory" still available.
    free_pages: AtomicUsize,
    /// Maximum number of maps alive at once, if limited.
    map_limit: Option<usize>,
    live_maps: AtomicUsize,
    maps_created: AtomicUsize,
    maps_destroyed: AtomicUsize,
}

impl EmulatedTranslationLayer {
    /// Creates a layer backed by `physical_pages` pages of emulated memory.
    pub fn new(physical_pages: usize) -> Self {
        Self {
            free_pages: AtomicUsize::new(physical_pages),
            map_limit: None,
            live_maps: AtomicUsize::new(0),
            maps_created: AtomicUsize::new(0),
            maps_destroyed: AtomicUsize::new(0),
        }
    }

    /// Limits the number of maps that may be alive at the same time.
    pub fn with_map_limit(mut self, limit: usize) -> Self {
        self.map_limit = Some(limit);
        self
    }

    /// Returns the number of emulated physical pages not backing any mapping.
    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Acquire)
    }

    /// Returns the number of maps created so far.
    pub fn maps_created(&self) -> usize {
        self.maps_created.load(Ordering::Acquire)
    }

    /// Returns the number of maps destroyed so far.
    pub fn maps_destroyed(&self) -> usize {
        self.maps_destroyed.load(Ordering::Acquire)
    }

    /// Returns the number of maps currently alive.
    pub fn live_maps(&self) -> usize {
        self.live_maps.load(Ordering::Acquire)
    }

    /// Claims `count` pages from the budget.
    fn reserve_pages(&self, count: usize) -> Result<(), TranslationError> {
        loop {
            let current = self.free_pages.load(Ordering::Relaxed);
            let remaining = current
                .checked_sub(count)
                .ok_or(TranslationError::OutOfMemory)?;

            // Try to claim the pages
            if self
                .free_pages
                .compare_exchange(current, remaining, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn release_pages(&self, count: usize) {
        self.free_pages.fetch_add(count, Ordering::AcqRel);
    }
}

fn pages_in(base: VirtualAddress, size: usize) -> impl Iterator<Item = VirtualAddress> {
    (0..size / PAGE_SIZE).map(move |index| base + index * PAGE_SIZE)
}

impl TranslationLayer for EmulatedTranslationLayer {
    type Map = EmulatedMap;

    fn create_map(&self, owner: ProcessId) -> Result<EmulatedMap, TranslationError> {
        if let Some(limit) = self.map_limit {
            let claimed = self.live_maps.fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            });
            if claimed.is_err() {
                return Err(TranslationError::MapLimit);
            }
        } else {
            self.live_maps.fetch_add(1, Ordering::AcqRel);
        }
        self.maps_created.fetch_add(1, Ordering::AcqRel);

        Ok(EmulatedMap {
            owner,
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    fn destroy_map(&self, map: EmulatedMap) {
        let remaining = map.pages.lock().len();
        self.release_pages(remaining);
        self.live_maps.fetch_sub(1, Ordering::AcqRel);
        self.maps_destroyed.fetch_add(1, Ordering::AcqRel);
    }

    fn map_range(
        &self,
        map: &EmulatedMap,
        base: VirtualAddress,
        size: usize,
        protection: Protection,
    ) -> Result<(), TranslationError> {
        debug_assert!(base.is_page_aligned() && size % PAGE_SIZE == 0);

        let mut pages = map.pages.lock();
        if pages_in(base, size).any(|page| pages.contains_key(&page)) {
            return Err(TranslationError::AlreadyMapped);
        }

        self.reserve_pages(size / PAGE_SIZE)?;
        for page in pages_in(base, size) {
            pages.insert(page, protection);
        }
        Ok(())
    }

    fn unmap_range(&self, map: &EmulatedMap, base: VirtualAddress, size: usize) {
        let mut pages = map.pages.lock();
        let released = pages_in(base, size)
            .filter(|page| pages.remove(page).is_some())
            .count();
        self.release_pages(released);
    }

    fn protect_range(
        &self,
        map: &EmulatedMap,
        base: VirtualAddress,
        size: usize,
        protection: Protection,
    ) {
        let mut pages = map.pages.lock();
        for page in pages_in(base, size) {
            if let Some(entry) = pages.get_mut(&page) {
                *entry = protection;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: ProcessId = ProcessId::new(7);

    #[test]
    fn maps_and_unmaps_pages() {
        let layer = EmulatedTranslationLayer::new(16);
        let map = layer.create_map(OWNER).unwrap();

        layer
            .map_range(&map, VirtualAddress::new(0x2000), 3 * PAGE_SIZE, Protection::READ)
            .unwrap();
        assert_eq!(map.mapped_pages(), 3);
        assert_eq!(layer.free_pages(), 13);
        assert_eq!(map.translate(VirtualAddress::new(0x3abc)), Some(Protection::READ));
        assert_eq!(map.translate(VirtualAddress::new(0x5000)), None);

        layer.unmap_range(&map, VirtualAddress::new(0x2000), 2 * PAGE_SIZE);
        assert_eq!(map.mapped_pages(), 1);
        assert_eq!(layer.free_pages(), 15);
    }

    #[test]
    fn rejects_double_mapping() {
        let layer = EmulatedTranslationLayer::new(16);
        let map = layer.create_map(OWNER).unwrap();

        layer
            .map_range(&map, VirtualAddress::new(0x1000), PAGE_SIZE, Protection::READ)
            .unwrap();
        let result = layer.map_range(&map, VirtualAddress::new(0), 2 * PAGE_SIZE, Protection::READ);
        assert_eq!(result, Err(TranslationError::AlreadyMapped));
        assert_eq!(map.mapped_pages(), 1);
    }

    #[test]
    fn exhausts_budget_without_partial_mapping() {
        let layer = EmulatedTranslationLayer::new(2);
        let map = layer.create_map(OWNER).unwrap();

        let result = layer.map_range(&map, VirtualAddress::new(0), 3 * PAGE_SIZE, Protection::READ);
        assert_eq!(result, Err(TranslationError::OutOfMemory));
        assert_eq!(map.mapped_pages(), 0);
        assert_eq!(layer.free_pages(), 2);
    }

    #[test]
    fn destroy_returns_pages_and_counts() {
        let layer = EmulatedTranslationLayer::new(8);
        let map = layer.create_map(OWNER).unwrap();
        layer
            .map_range(&map, VirtualAddress::new(0), 4 * PAGE_SIZE, Protection::READ)
            .unwrap();

        layer.destroy_map(map);
        assert_eq!(layer.free_pages(), 8);
        assert_eq!(layer.maps_created(), 1);
        assert_eq!(layer.maps_destroyed(), 1);
        assert_eq!(layer.live_maps(), 0);
    }

    #[test]
    fn enforces_map_limit() {
        let layer = EmulatedTranslationLayer::new(8).with_map_limit(1);
        let first = layer.create_map(OWNER).unwrap();
        assert_eq!(
            layer.create_map(ProcessId::new(8)).err(),
            Some(TranslationError::MapLimit)
        );

        layer.destroy_map(first);
        assert!(layer.create_map(ProcessId::new(8)).is_ok());
    }

    #[test]
    fn protect_changes_mapped_pages_only() {
        let layer = EmulatedTranslationLayer::new(8);
        let map = layer.create_map(OWNER).unwrap();
        layer
            .map_range(&map, VirtualAddress::new(0), PAGE_SIZE, Protection::READ)
            .unwrap();

        layer.protect_range(&map, VirtualAddress::new(0), 2 * PAGE_SIZE, Protection::READ_WRITE);
        assert_eq!(map.translate(VirtualAddress::new(0)), Some(Protection::READ_WRITE));
        assert_eq!(map.translate(VirtualAddress::new(0x1000)), None);
    }
}
