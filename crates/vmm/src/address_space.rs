//! Address space management.
//!
//! This module provides the architecture-independent [`AddressSpace`], which tracks the
//! areas of one process (or of the kernel), places new areas, and tears everything down
//! once the last reference is released.
//!
//! # Locking
//!
//! The area collection, free-space counter and change counter live behind a reader/writer
//! lock. Structural operations are methods of the lock guards: [`AreasReadGuard`] for
//! lookups and iteration, [`AreasWriteGuard`] for insertion, removal, resizing and
//! protection changes. Guards release the lock when dropped, on every exit path.
//!
//! The reference count and the fault counter are atomics and never need the lock, so a
//! fault handler can account for a fault while only holding the read lock.
//!
//! # Placement hint
//!
//! The base of the most recently inserted area is cached in an atomic. Lookups probe it
//! first and placement may start its search behind it, but it is never trusted without
//! checking that an area still exists at that base.

use alloc::sync::Arc;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Bound, Deref};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::address::is_page_multiple;
use crate::area::AreaId;
use crate::context::ProcessId;
use crate::cursor::AreaCursor;
use crate::placement::{self, AreaMap, AreaRequest, Placement};
use crate::{Area, Protection, TranslationLayer, VirtualAddress, VmError, arch};

/// Hint value meaning "no hint".
const NO_HINT: usize = usize::MAX;

/// Source of address space serial numbers.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Whether an address space belongs to the kernel or to a user process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// Outcome of classifying a page fault against an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The address is covered by an area that permits the access.
    Resolved(Area),
    /// No area covers the address.
    Unmapped,
    /// An area covers the address but forbids the access.
    ProtectionViolation(Area),
}

/// A point-in-time summary of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceStats {
    pub size: usize,
    pub free_space: usize,
    pub area_count: usize,
    pub changes: u64,
    pub faults: u64,
    pub deleting: bool,
}

/// State guarded by the address space lock.
struct AreaState {
    /// Areas ordered by base address. Never overlapping.
    areas: AreaMap,
    /// Bytes of the space not covered by any area.
    free_space: usize,
    /// Bumped on every change to the collection.
    changes: u64,
    /// Smallest request size known not to fit anywhere below the hinted area; zero when
    /// nothing is known.
    hint_floor: usize,
}

impl AreaState {
    /// Finds the area containing `address`, probing the hinted area first.
    fn lookup(&self, hint: usize, address: VirtualAddress) -> Option<&Area> {
        if hint != NO_HINT {
            if let Some(area) = self.areas.get(&VirtualAddress::new(hint)) {
                if area.contains(address) {
                    return Some(area);
                }
            }
        }

        self.areas
            .range(..=address)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(address))
    }
}

/// An architecture-independent virtual address space.
///
/// Each address space owns a translation map and the ordered collection of its areas.
/// Address spaces are created by the [`AddressSpaceRegistry`](crate::AddressSpaceRegistry)
/// and shared through [`AddressSpaceHandle`]s.
pub struct AddressSpace<L: TranslationLayer> {
    id: ProcessId,
    /// Distinguishes this space from every other, including later spaces of the same process.
    serial: u64,
    kind: SpaceKind,
    base: VirtualAddress,
    size: usize,
    layer: Arc<L>,
    /// Taken exactly once, when the space is dropped.
    map: ManuallyDrop<L::Map>,
    state: RwLock<AreaState>,
    hint: AtomicUsize,
    faults: AtomicU64,
    deleting: AtomicBool,
    lock_retired: AtomicBool,
}

impl<L: TranslationLayer> AddressSpace<L> {
    /// Creates an empty address space covering `[base, base + size)`.
    pub(crate) fn new(
        id: ProcessId,
        kind: SpaceKind,
        base: VirtualAddress,
        size: usize,
        layer: Arc<L>,
    ) -> Result<Self, VmError> {
        if !base.is_page_aligned() || !is_page_multiple(size) {
            return Err(VmError::InvalidArgument);
        }
        if base.checked_add(size).is_none() {
            return Err(VmError::OutOfRange);
        }

        let map = layer.create_map(id).map_err(|err| {
            log::warn!("failed to create translation map for process {}: {}", id, err);
            VmError::from(err)
        })?;

        log::debug!(
            "created {:?} address space for process {}: {}..{}",
            kind,
            id,
            base,
            base + size
        );

        Ok(Self {
            id,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            kind,
            base,
            size,
            layer,
            map: ManuallyDrop::new(map),
            state: RwLock::new(AreaState {
                areas: AreaMap::new(),
                free_space: size,
                changes: 0,
                hint_floor: 0,
            }),
            hint: AtomicUsize::new(NO_HINT),
            faults: AtomicU64::new(0),
            deleting: AtomicBool::new(false),
            lock_retired: AtomicBool::new(false),
        })
    }

    /// Returns the process owning this address space.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Returns whether this is the kernel's or a user address space.
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Returns the lowest address of this address space.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the size of this address space in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the end address (exclusive) of this address space.
    pub fn end(&self) -> VirtualAddress {
        self.base + self.size
    }

    /// Returns the translation map of this address space.
    pub fn translation_map(&self) -> &L::Map {
        &self.map
    }

    /// Returns true once the owning process has started to terminate.
    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    /// Returns the number of faults recorded so far.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Records a fault without taking any lock. Returns the new fault count.
    pub fn record_fault(&self) -> u64 {
        self.faults.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Acquires the lock for reading.
    ///
    /// Fails with [`VmError::LockFailure`] once the lock has been retired, including for
    /// callers that were already waiting when that happened.
    pub fn read(&self) -> Result<AreasReadGuard<'_, L>, VmError> {
        self.check_lock()?;
        let state = self.state.read();
        self.check_lock()?;
        Ok(AreasReadGuard { space: self, state })
    }

    /// Acquires the lock for writing.
    ///
    /// Fails with [`VmError::LockFailure`] once the lock has been retired, including for
    /// callers that were already waiting when that happened.
    pub fn write(&self) -> Result<AreasWriteGuard<'_, L>, VmError> {
        self.check_lock()?;
        let state = self.state.write();
        self.check_lock()?;
        Ok(AreasWriteGuard { space: self, state })
    }

    /// Classifies a fault at `address` for an access of kind `access`.
    ///
    /// Counts the fault first, then takes only the read lock.
    pub fn handle_fault(
        &self,
        address: VirtualAddress,
        access: Protection,
    ) -> Result<FaultResolution, VmError> {
        self.record_fault();
        let areas = self.read()?;

        let resolution = match areas.lookup_area(address) {
            None => FaultResolution::Unmapped,
            Some(area) if area.protection().allows(access) => FaultResolution::Resolved(*area),
            Some(area) => FaultResolution::ProtectionViolation(*area),
        };
        log::trace!(
            "fault at {} ({:?}) in process {}: {:?}",
            address,
            access,
            self.id,
            resolution
        );
        Ok(resolution)
    }

    /// Returns a summary of this address space.
    pub fn stats(&self) -> Result<AddressSpaceStats, VmError> {
        let areas = self.read()?;
        Ok(AddressSpaceStats {
            size: self.size,
            free_space: areas.free_space(),
            area_count: areas.area_count(),
            changes: areas.change_count(),
            faults: self.fault_count(),
            deleting: self.is_deleting(),
        })
    }

    /// Returns a cursor positioned before the first area.
    pub fn cursor(&self) -> Result<AreaCursor, VmError> {
        Ok(self.read()?.cursor())
    }

    pub(crate) fn mark_deleting(&self) {
        self.deleting.store(true, Ordering::Release);
    }

    /// Makes every further lock acquisition fail with [`VmError::LockFailure`].
    pub(crate) fn retire_lock(&self) {
        if !self.lock_retired.swap(true, Ordering::AcqRel) {
            log::warn!("address space lock of process {} retired", self.id);
        }
    }

    fn check_lock(&self) -> Result<(), VmError> {
        if self.lock_retired.load(Ordering::Acquire) {
            Err(VmError::LockFailure)
        } else {
            Ok(())
        }
    }

    fn hint(&self) -> usize {
        self.hint.load(Ordering::Acquire)
    }
}

impl<L: TranslationLayer> Drop for AddressSpace<L> {
    fn drop(&mut self) {
        self.lock_retired.store(true, Ordering::Release);

        // SAFETY: This is the only place the map is taken, and `self` is never used again.
        let map = unsafe { ManuallyDrop::take(&mut self.map) };
        let state = self.state.get_mut();
        let areas = core::mem::take(&mut state.areas);

        for area in areas.values() {
            self.layer.unmap_range(&map, area.base(), area.size());
            state.free_space += area.size();
        }
        self.layer.destroy_map(map);

        log::debug!(
            "destroyed address space of process {} ({} areas torn down)",
            self.id,
            areas.len()
        );
    }
}

impl<L: TranslationLayer> fmt::Debug for AddressSpace<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("size", &self.size)
            .field("deleting", &self.is_deleting())
            .finish()
    }
}

/// A counted reference to an address space.
///
/// Acquiring a handle increments the reference count, dropping or releasing it decrements
/// it. The space is torn down when the count drops to zero, exactly once.
pub struct AddressSpaceHandle<L: TranslationLayer>(Arc<AddressSpace<L>>);

impl<L: TranslationLayer> AddressSpaceHandle<L> {
    pub(crate) fn new(space: AddressSpace<L>) -> Self {
        Self(Arc::new(space))
    }

    /// Acquires another reference to the same address space.
    pub fn acquire(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    /// Releases this reference. Tears the space down if it was the last one.
    pub fn release(self) {
        drop(self);
    }

    /// Returns the number of outstanding references, including the registry's.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Returns true if both handles refer to the same address space.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<L: TranslationLayer> Clone for AddressSpaceHandle<L> {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl<L: TranslationLayer> Deref for AddressSpaceHandle<L> {
    type Target = AddressSpace<L>;

    fn deref(&self) -> &AddressSpace<L> {
        &self.0
    }
}

impl<L: TranslationLayer> fmt::Debug for AddressSpaceHandle<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// Macro to define the queries available under either lock mode.
macro_rules! impl_area_queries {
    ($guard:ident) => {
        impl<'a, L: TranslationLayer> $guard<'a, L> {
            /// Returns the address space this guard locks.
            pub fn space(&self) -> &'a AddressSpace<L> {
                self.space
            }

            /// Returns the area containing `address`, or None if it falls in a gap.
            pub fn lookup_area(&self, address: VirtualAddress) -> Option<&Area> {
                self.state.lookup(self.space.hint(), address)
            }

            /// Returns the areas in ascending address order.
            pub fn areas(&self) -> impl Iterator<Item = &Area> + '_ {
                self.state.areas.values()
            }

            /// Returns the number of areas.
            pub fn area_count(&self) -> usize {
                self.state.areas.len()
            }

            /// Returns the number of bytes not covered by any area.
            pub fn free_space(&self) -> usize {
                self.state.free_space
            }

            /// Returns the change counter.
            pub fn change_count(&self) -> u64 {
                self.state.changes
            }

            /// Returns a cursor positioned before the first area.
            pub fn cursor(&self) -> AreaCursor {
                AreaCursor::new(self.space.serial, self.state.changes)
            }

            pub(crate) fn area_map(&self) -> &AreaMap {
                &self.state.areas
            }
        }
    };
}

/// Shared access to the areas of an address space.
pub struct AreasReadGuard<'a, L: TranslationLayer> {
    space: &'a AddressSpace<L>,
    state: RwLockReadGuard<'a, AreaState>,
}

impl_area_queries!(AreasReadGuard);

/// Exclusive access to the areas of an address space.
pub struct AreasWriteGuard<'a, L: TranslationLayer> {
    space: &'a AddressSpace<L>,
    state: RwLockWriteGuard<'a, AreaState>,
}

impl_area_queries!(AreasWriteGuard);

impl<L: TranslationLayer> AreasWriteGuard<'_, L> {
    /// Places a new area and maps it through the translation layer.
    ///
    /// On failure the address space is left exactly as it was.
    pub fn insert_area(&mut self, request: AreaRequest) -> Result<Area, VmError> {
        let space = self.space;
        if space.is_deleting() {
            return Err(VmError::Gone);
        }

        let AreaRequest {
            placement,
            size,
            alignment,
            protection,
        } = request;
        if !is_page_multiple(size) || !alignment.is_power_of_two() || alignment < arch::PAGE_SIZE
        {
            return Err(VmError::InvalidArgument);
        }

        let space_start = space.base.as_usize();
        let space_end = space.end().as_usize();

        // The second value tells whether the search covered everything from the space base.
        let (base, searched_from_start) = match placement {
            Placement::Exact(address) => (self.check_exact(address, size, alignment)?, false),
            Placement::BaseOrAny(address) => match self.check_exact(address, size, alignment) {
                Ok(base) => (base, false),
                Err(VmError::Overlap | VmError::OutOfRange) => {
                    (self.search(space_start, space_end, size, alignment)?, true)
                }
                Err(err) => return Err(err),
            },
            Placement::Any => (self.search(space_start, space_end, size, alignment)?, true),
            Placement::AnyInRange { start, end } => {
                if !start.is_page_aligned() || !end.is_page_aligned() || start >= end {
                    return Err(VmError::InvalidArgument);
                }
                if start < space.base || end > space.end() {
                    return Err(VmError::OutOfRange);
                }
                let base = self.search(start.as_usize(), end.as_usize(), size, alignment)?;
                (base, start == space.base)
            }
        };

        space
            .layer
            .map_range(&space.map, base, size, protection)
            .map_err(|err| {
                log::warn!(
                    "translation layer refused {}..{} in process {}: {}",
                    base,
                    base + size,
                    space.id,
                    err
                );
                VmError::from(err)
            })?;

        let state = &mut *self.state;
        let area = Area::new(
            AreaId::next(),
            base,
            size,
            protection,
            space.id,
        );
        state.areas.insert(base, area);
        state.free_space -= size;
        state.changes += 1;
        state.hint_floor = if searched_from_start && alignment == arch::PAGE_SIZE {
            size
        } else {
            0
        };
        space.hint.store(base.as_usize(), Ordering::Release);

        log::trace!("inserted {:?}", area);
        Ok(area)
    }

    /// Unmaps an area and removes it from the address space.
    ///
    /// The translation layer stops honoring the range before the area leaves the
    /// collection, and both happen under the write lock.
    pub fn remove_area(&mut self, area: &Area) -> Result<Area, VmError> {
        let stored = self.stored(area)?;
        let space = self.space;

        space
            .layer
            .unmap_range(&space.map, stored.base(), stored.size());

        let state = &mut *self.state;
        state.areas.remove(&stored.base());
        state.free_space += stored.size();
        state.changes += 1;

        let hint = space.hint();
        if hint == stored.base().as_usize() {
            space.hint.store(NO_HINT, Ordering::Release);
            state.hint_floor = 0;
        } else if hint != NO_HINT && stored.base().as_usize() < hint {
            state.hint_floor = 0;
        }

        log::trace!("removed {:?}", stored);
        Ok(stored)
    }

    /// Grows or shrinks an area in place.
    ///
    /// Growing requires the pages after the area to be free and inside the space, and maps
    /// them before the area is updated. Shrinking unmaps the released tail.
    pub fn resize_area(&mut self, area: &Area, new_size: usize) -> Result<Area, VmError> {
        if !is_page_multiple(new_size) {
            return Err(VmError::InvalidArgument);
        }
        let stored = self.stored(area)?;
        let space = self.space;
        let old_size = stored.size();

        if new_size > old_size {
            if space.is_deleting() {
                return Err(VmError::Gone);
            }
            let grow = new_size - old_size;
            let new_end = stored
                .base()
                .checked_add(new_size)
                .ok_or(VmError::OutOfRange)?;
            if new_end > space.end() {
                return Err(VmError::OutOfRange);
            }
            let next = self
                .state
                .areas
                .range((Bound::Excluded(stored.base()), Bound::Unbounded))
                .next();
            if let Some((_, next)) = next {
                if next.base() < new_end {
                    return Err(VmError::Overlap);
                }
            }

            space
                .layer
                .map_range(&space.map, stored.end(), grow, stored.protection())?;
            self.state.free_space -= grow;
        } else if new_size < old_size {
            let shrink = old_size - new_size;
            space
                .layer
                .unmap_range(&space.map, stored.base() + new_size, shrink);

            let state = &mut *self.state;
            state.free_space += shrink;
            let hint = space.hint();
            if hint != NO_HINT && stored.base().as_usize() < hint {
                state.hint_floor = 0;
            }
        } else {
            return Ok(stored);
        }

        let state = &mut *self.state;
        let entry = state
            .areas
            .get_mut(&stored.base())
            .ok_or(VmError::InvalidArgument)?;
        entry.set_size(new_size);
        let resized = *entry;
        state.changes += 1;

        log::trace!("resized {:?} from {} bytes", resized, old_size);
        Ok(resized)
    }

    /// Changes the protection of an area.
    pub fn protect_area(&mut self, area: &Area, protection: Protection) -> Result<Area, VmError> {
        let stored = self.stored(area)?;
        let space = self.space;

        space
            .layer
            .protect_range(&space.map, stored.base(), stored.size(), protection);

        let state = &mut *self.state;
        let entry = state
            .areas
            .get_mut(&stored.base())
            .ok_or(VmError::InvalidArgument)?;
        entry.set_protection(protection);
        let updated = *entry;
        state.changes += 1;

        log::trace!("changed protection of {:?}", updated);
        Ok(updated)
    }

    /// Returns the current version of `area` if it belongs to this address space.
    fn stored(&self, area: &Area) -> Result<Area, VmError> {
        if area.owner() != self.space.id {
            return Err(VmError::InvalidArgument);
        }
        match self.state.areas.get(&area.base()) {
            Some(stored) if stored.id() == area.id() => Ok(*stored),
            _ => Err(VmError::InvalidArgument),
        }
    }

    /// Validates an exact placement.
    fn check_exact(
        &self,
        address: VirtualAddress,
        size: usize,
        alignment: usize,
    ) -> Result<VirtualAddress, VmError> {
        if !address.is_aligned(alignment) {
            return Err(VmError::InvalidArgument);
        }
        let end = address.checked_add(size).ok_or(VmError::OutOfRange)?;
        if address < self.space.base || end > self.space.end() {
            return Err(VmError::OutOfRange);
        }
        if !placement::is_range_free(&self.state.areas, address, size) {
            return Err(VmError::Overlap);
        }
        Ok(address)
    }

    /// First-fit search in `[start, end)`.
    fn search(
        &self,
        start: usize,
        end: usize,
        size: usize,
        alignment: usize,
    ) -> Result<VirtualAddress, VmError> {
        if size > self.state.free_space {
            return Err(VmError::OutOfSpace);
        }

        let from = self.search_start(start, size);
        placement::find_gap(&self.state.areas, start, end, from, size, alignment)
            .ok_or(VmError::OutOfSpace)
    }

    /// Returns where a search for `size` bytes may begin without missing a lower gap.
    ///
    /// Everything below the hinted area is known to be too small for requests of at least
    /// `hint_floor` bytes, so such requests can start right after it.
    fn search_start(&self, start: usize, size: usize) -> usize {
        let floor = self.state.hint_floor;
        if floor == 0 || size < floor {
            return start;
        }

        let hint = self.space.hint();
        if hint == NO_HINT {
            return start;
        }
        match self.state.areas.get(&VirtualAddress::new(hint)) {
            Some(area) if area.end().as_usize() > start => area.end().as_usize(),
            _ => start,
        }
    }
}
