//! Hardware translation layer for x86_64 4-level paging.

use ::x86_64::{
    VirtAddr,
    structures::paging::{
        FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageTable,
        PageTableFlags, PhysFrame, Size4KiB, mapper::MapToError,
    },
};
use spin::{Mutex, MutexGuard};

use super::{KERNEL_HALF_START, PAGE_SIZE, PageFlags};
use crate::{Protection, TranslationError, TranslationLayer, VirtualAddress, context::ProcessId};

/// A translation map backed by a level-4 page table.
pub struct HardwareMap {
    owner: ProcessId,
    root: Mutex<PhysFrame<Size4KiB>>,
}

impl HardwareMap {
    /// Returns the process this map was created for.
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Returns the frame holding the level-4 table, for loading into CR3.
    pub fn root_frame(&self) -> PhysFrame<Size4KiB> {
        *self.root.lock()
    }
}

/// Translation layer using the x86_64 crate's paging structures.
///
/// Page tables and backing frames come from a caller-supplied frame allocator. All
/// physical memory must be reachable through a direct map at `physical_offset`.
///
/// The kernel's map is `kernel_root` itself. Every level-4 entry of its kernel half
/// (256 to 511) points to a level-3 table from construction on, and process maps copy
/// those entries, so kernel mappings made later show up in every process.
pub struct HardwareTranslationLayer<A> {
    physical_offset: VirtAddr,
    kernel_root: PhysFrame<Size4KiB>,
    frames: Mutex<A>,
}

impl<A> HardwareTranslationLayer<A>
where
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB> + Send,
{
    /// Creates a new hardware translation layer, filling every empty kernel-half entry of
    /// `kernel_root` with a fresh level-3 table.
    ///
    /// # Safety
    /// The caller must ensure:
    /// - all physical memory is mapped at `physical_offset`
    /// - `kernel_root` is the level-4 table the kernel runs on
    /// - `frames` hands out unused frames and accepts them back
    /// - no level-4 table other than `kernel_root` exists yet
    pub unsafe fn new(
        physical_offset: VirtAddr,
        kernel_root: PhysFrame<Size4KiB>,
        frames: A,
    ) -> Result<Self, TranslationError> {
        let layer = Self {
            physical_offset,
            kernel_root,
            frames: Mutex::new(frames),
        };
        layer.populate_kernel_half()?;
        Ok(layer)
    }

    /// Points every unused kernel-half entry of the kernel root at an empty level-3 table.
    fn populate_kernel_half(&self) -> Result<(), TranslationError> {
        let mut frames = self.frames.lock();
        // SAFETY: The kernel root is a valid level-4 table in the direct map, and no other
        // root has copied its entries yet.
        let root = unsafe { &mut *self.table_ptr(self.kernel_root) };

        for entry in root.iter_mut().skip(KERNEL_HALF_START) {
            if !entry.is_unused() {
                continue;
            }
            let frame = frames
                .allocate_frame()
                .ok_or(TranslationError::OutOfMemory)?;
            // SAFETY: The frame is freshly allocated and reachable through the direct map.
            unsafe { (*self.table_ptr(frame)).zero() };
            entry.set_frame(frame, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        }
        Ok(())
    }

    /// Returns a pointer to the first byte of `frame` in the direct map.
    fn frame_ptr(&self, frame: PhysFrame<Size4KiB>) -> *mut u8 {
        (self.physical_offset + frame.start_address().as_u64()).as_mut_ptr()
    }

    /// Returns a pointer to the page table stored in `frame`.
    fn table_ptr(&self, frame: PhysFrame<Size4KiB>) -> *mut PageTable {
        self.frame_ptr(frame).cast()
    }

    /// Builds a mapper over the table rooted at `root`.
    ///
    /// The returned mapper borrows the root guard, so only one mapper per map exists.
    fn mapper<'a>(&self, root: &'a mut MutexGuard<'_, PhysFrame<Size4KiB>>) -> OffsetPageTable<'a> {
        // SAFETY: The root frame holds a valid level-4 table created by `create_map`, and
        // holding its guard gives us exclusive access to it.
        unsafe {
            let table = &mut *self.table_ptr(**root);
            OffsetPageTable::new(table, self.physical_offset)
        }
    }

    /// Frees a page table and every lower-level table it references.
    ///
    /// `level` is the level of the table in `frame` (4 for the root).
    fn free_table(&self, frames: &mut A, frame: PhysFrame<Size4KiB>, level: u8) {
        if level > 1 {
            // SAFETY: The frame was installed as a page table by the mapper.
            let table = unsafe { &*self.table_ptr(frame) };
            for entry in table.iter() {
                if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                    continue;
                }
                if let Ok(child) = entry.frame() {
                    self.free_table(frames, child, level - 1);
                }
            }
        }

        // SAFETY: Nothing references the table anymore.
        unsafe { frames.deallocate_frame(frame) };
    }

    /// Unmaps `count` pages starting at `base` and hands their frames back to the allocator.
    fn unmap_pages(
        &self,
        mapper: &mut OffsetPageTable<'_>,
        frames: &mut A,
        base: VirtualAddress,
        count: usize,
    ) {
        for index in 0..count {
            let page = page_at(base + index * PAGE_SIZE);
            if let Ok((frame, flush)) = mapper.unmap(page) {
                flush.flush();
                // SAFETY: The frame was allocated by `map_range` and is no longer mapped.
                unsafe { frames.deallocate_frame(frame) };
            }
        }
    }
}

fn page_at(address: VirtualAddress) -> Page<Size4KiB> {
    Page::containing_address(VirtAddr::new(address.as_usize() as u64))
}

impl<A> TranslationLayer for HardwareTranslationLayer<A>
where
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB> + Send,
{
    type Map = HardwareMap;

    fn create_map(&self, owner: ProcessId) -> Result<HardwareMap, TranslationError> {
        if owner.is_kernel() {
            return Ok(HardwareMap {
                owner,
                root: Mutex::new(self.kernel_root),
            });
        }

        let root = self
            .frames
            .lock()
            .allocate_frame()
            .ok_or(TranslationError::OutOfMemory)?;

        // SAFETY: Both frames are reachable through the direct map, and the new frame is
        // not referenced by anyone else yet.
        unsafe {
            let new_table = &mut *self.table_ptr(root);
            let kernel_table = &*self.table_ptr(self.kernel_root);
            new_table.zero();
            for index in KERNEL_HALF_START..512 {
                new_table[index] = kernel_table[index].clone();
            }
        }

        log::trace!("created level-4 table {:?} for process {}", root, owner);
        Ok(HardwareMap {
            owner,
            root: Mutex::new(root),
        })
    }

    fn destroy_map(&self, map: HardwareMap) {
        let root = map.root.into_inner();
        if map.owner.is_kernel() {
            // The kernel root and its tables outlive every address space.
            return;
        }

        let mut frames = self.frames.lock();

        // SAFETY: The map is being destroyed, nothing else can reach its tables.
        let table = unsafe { &*self.table_ptr(root) };
        for entry in table.iter().take(KERNEL_HALF_START) {
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                continue;
            }
            if let Ok(child) = entry.frame() {
                self.free_table(&mut frames, child, 3);
            }
        }

        // SAFETY: The root table is no longer loaded nor referenced.
        unsafe { frames.deallocate_frame(root) };
        log::trace!("destroyed level-4 table {:?} of process {}", root, map.owner);
    }

    fn map_range(
        &self,
        map: &HardwareMap,
        base: VirtualAddress,
        size: usize,
        protection: Protection,
    ) -> Result<(), TranslationError> {
        let mut root = map.root.lock();
        let mut mapper = self.mapper(&mut root);
        let mut frames = self.frames.lock();
        let flags = PageFlags::from(protection).bits();
        let count = size / PAGE_SIZE;

        for index in 0..count {
            let page = page_at(base + index * PAGE_SIZE);
            let result = match frames.allocate_frame() {
                Some(frame) => {
                    // SAFETY: The frame is freshly allocated and reachable through the direct map.
                    unsafe {
                        core::ptr::write_bytes(self.frame_ptr(frame), 0, PAGE_SIZE);
                    }
                    // SAFETY: The page lies in a range the address space just reserved, and
                    // the frame is unused.
                    match unsafe { mapper.map_to(page, frame, flags, &mut *frames) } {
                        Ok(flush) => {
                            flush.flush();
                            Ok(())
                        }
                        Err(err) => {
                            // SAFETY: The frame was never mapped.
                            unsafe { frames.deallocate_frame(frame) };
                            Err(match err {
                                MapToError::FrameAllocationFailed => TranslationError::OutOfMemory,
                                _ => TranslationError::AlreadyMapped,
                            })
                        }
                    }
                }
                None => Err(TranslationError::OutOfMemory),
            };

            if let Err(err) = result {
                // Leave nothing of the range behind.
                self.unmap_pages(&mut mapper, &mut frames, base, index);
                log::warn!("failed to map {} at {}: {}", size, base, err);
                return Err(err);
            }
        }

        Ok(())
    }

    fn unmap_range(&self, map: &HardwareMap, base: VirtualAddress, size: usize) {
        let mut root = map.root.lock();
        let mut mapper = self.mapper(&mut root);
        let mut frames = self.frames.lock();
        self.unmap_pages(&mut mapper, &mut frames, base, size / PAGE_SIZE);
    }

    fn protect_range(
        &self,
        map: &HardwareMap,
        base: VirtualAddress,
        size: usize,
        protection: Protection,
    ) {
        let mut root = map.root.lock();
        let mut mapper = self.mapper(&mut root);
        let flags = PageFlags::from(protection).bits();

        for index in 0..size / PAGE_SIZE {
            let page = page_at(base + index * PAGE_SIZE);
            // SAFETY: Only the permission bits of an existing mapping change.
            if let Ok(flush) = unsafe { mapper.update_flags(page, flags) } {
                flush.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ::x86_64::PhysAddr;

    use super::*;

    /// Hands out host page-sized tables as "physical" frames, so a direct map at offset
    /// zero reaches them.
    #[derive(Default)]
    struct HostFrames {
        limit: Option<usize>,
        allocated: usize,
        freed: Vec<PhysFrame<Size4KiB>>,
    }

    fn host_frame() -> PhysFrame<Size4KiB> {
        let table: &'static mut PageTable = Box::leak(Box::new(PageTable::new()));
        PhysFrame::containing_address(PhysAddr::new(table as *mut PageTable as u64))
    }

    unsafe impl FrameAllocator<Size4KiB> for HostFrames {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
            if self.limit == Some(self.allocated) {
                return None;
            }
            self.allocated += 1;
            Some(host_frame())
        }
    }

    impl FrameDeallocator<Size4KiB> for HostFrames {
        unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
            self.freed.push(frame);
        }
    }

    fn layer(frames: HostFrames) -> (HardwareTranslationLayer<HostFrames>, PhysFrame<Size4KiB>) {
        let kernel_root = host_frame();
        // SAFETY: Every frame is a live host table, reachable at offset zero.
        let layer = unsafe { HardwareTranslationLayer::new(VirtAddr::new(0), kernel_root, frames) }
            .unwrap();
        (layer, kernel_root)
    }

    #[test]
    fn construction_fills_the_kernel_half() {
        let (layer, kernel_root) = layer(HostFrames::default());
        assert_eq!(layer.frames.lock().allocated, 512 - KERNEL_HALF_START);

        // SAFETY: The root is a live host table.
        let root = unsafe { &*layer.table_ptr(kernel_root) };
        assert!(root.iter().skip(KERNEL_HALF_START).all(|entry| !entry.is_unused()));
        assert!(root.iter().take(KERNEL_HALF_START).all(|entry| entry.is_unused()));
    }

    #[test]
    fn construction_reports_exhaustion() {
        let frames = HostFrames {
            limit: Some(10),
            ..HostFrames::default()
        };
        // SAFETY: As in `layer`.
        let result = unsafe { HardwareTranslationLayer::new(VirtAddr::new(0), host_frame(), frames) };
        assert!(matches!(result, Err(TranslationError::OutOfMemory)));
    }

    #[test]
    fn kernel_map_is_the_kernel_root() {
        let (layer, kernel_root) = layer(HostFrames::default());
        let kernel = layer.create_map(ProcessId::KERNEL).unwrap();
        assert_eq!(kernel.root_frame(), kernel_root);

        layer.destroy_map(kernel);
        assert!(layer.frames.lock().freed.is_empty());
    }

    #[test]
    fn process_maps_share_the_kernel_half() {
        let (layer, kernel_root) = layer(HostFrames::default());
        let process = layer.create_map(ProcessId::new(1)).unwrap();
        let process_root = process.root_frame();
        assert_ne!(process_root, kernel_root);

        // SAFETY: Both roots are live host tables.
        let (kernel_table, process_table) = unsafe {
            (&*layer.table_ptr(kernel_root), &*layer.table_ptr(process_root))
        };
        for index in KERNEL_HALF_START..512 {
            assert_eq!(process_table[index].addr(), kernel_table[index].addr());
        }
        assert!(process_table.iter().take(KERNEL_HALF_START).all(|entry| entry.is_unused()));

        // Only the private root goes back, never the shared level-3 tables.
        layer.destroy_map(process);
        assert_eq!(layer.frames.lock().freed, [process_root]);
    }
}
