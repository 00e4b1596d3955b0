//! The registry of address spaces, keyed by process.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::RwLock;

use crate::address::is_page_multiple;
use crate::address_space::{AddressSpace, AddressSpaceHandle, SpaceKind};
use crate::context::{ExecutionContext, ProcessId};
use crate::{TranslationLayer, VirtualAddress, VmError, arch};

/// Where kernel and user address spaces may live.
///
/// The two windows must not overlap, which keeps every user space clear of the kernel's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutConfig {
    pub kernel_base: VirtualAddress,
    pub kernel_size: usize,
    pub user_base: VirtualAddress,
    pub user_size: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            kernel_base: VirtualAddress::new(arch::KERNEL_BASE),
            kernel_size: arch::KERNEL_SIZE,
            user_base: VirtualAddress::new(arch::USER_BASE),
            user_size: arch::USER_SIZE,
        }
    }
}

impl LayoutConfig {
    /// Checks that both windows are page-aligned, non-empty, representable and disjoint.
    ///
    /// On x86_64 each window must also lie within one canonical half.
    pub fn validate(&self) -> Result<(), VmError> {
        let kernel = window(self.kernel_base, self.kernel_size)?;
        let user = window(self.user_base, self.user_size)?;
        if kernel.0 < user.1 && user.0 < kernel.1 {
            return Err(VmError::Overlap);
        }
        Ok(())
    }

    /// Returns true if `[base, base + size)` lies within the user window.
    pub fn contains_user_range(&self, base: VirtualAddress, size: usize) -> bool {
        match base.checked_add(size) {
            Some(end) => base >= self.user_base && end <= self.user_base + self.user_size,
            None => false,
        }
    }
}

fn window(base: VirtualAddress, size: usize) -> Result<(usize, usize), VmError> {
    if !base.is_page_aligned() || !is_page_multiple(size) {
        return Err(VmError::InvalidArgument);
    }
    let end = base.checked_add(size).ok_or(VmError::OutOfRange)?;
    #[cfg(target_arch = "x86_64")]
    if !arch::x86_64::is_canonical_range(base.as_usize(), size) {
        return Err(VmError::OutOfRange);
    }
    Ok((base.as_usize(), end.as_usize()))
}

/// Tracks the address space of every process, plus the kernel's.
///
/// The registry holds one reference to each user space it tracks and owns the kernel
/// space for its whole life. Lookups take the registry lock for reading and acquire a
/// reference before releasing it, so a space cannot be torn down between lookup and use.
pub struct AddressSpaceRegistry<L: TranslationLayer> {
    layer: Arc<L>,
    layout: LayoutConfig,
    context: Box<dyn ExecutionContext>,
    kernel: AddressSpaceHandle<L>,
    spaces: RwLock<BTreeMap<ProcessId, AddressSpaceHandle<L>>>,
    shut_down: AtomicBool,
}

impl<L: TranslationLayer> AddressSpaceRegistry<L> {
    /// Creates the registry and the kernel address space.
    ///
    /// The kernel space covers the whole kernel window of `layout`.
    pub fn boot(
        layer: Arc<L>,
        layout: LayoutConfig,
        context: impl ExecutionContext + 'static,
    ) -> Result<Self, VmError> {
        layout.validate()?;

        let kernel = AddressSpace::new(
            ProcessId::KERNEL,
            SpaceKind::Kernel,
            layout.kernel_base,
            layout.kernel_size,
            Arc::clone(&layer),
        )?;

        log::debug!(
            "address space registry booted: kernel {}..{}, user {}..{}",
            layout.kernel_base,
            layout.kernel_base + layout.kernel_size,
            layout.user_base,
            layout.user_base + layout.user_size
        );

        Ok(Self {
            layer,
            layout,
            context: Box::new(context),
            kernel: AddressSpaceHandle::new(kernel),
            spaces: RwLock::new(BTreeMap::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Returns the layout this registry was booted with.
    pub fn layout(&self) -> &LayoutConfig {
        &self.layout
    }

    /// Returns the translation layer shared by every address space.
    pub fn translation_layer(&self) -> &Arc<L> {
        &self.layer
    }

    /// Creates and registers the address space of process `id`.
    ///
    /// Returns a new reference in addition to the one the registry keeps.
    pub fn create_address_space(
        &self,
        id: ProcessId,
        base: VirtualAddress,
        size: usize,
    ) -> Result<AddressSpaceHandle<L>, VmError> {
        if id.is_kernel() || !base.is_page_aligned() || !is_page_multiple(size) {
            return Err(VmError::InvalidArgument);
        }
        if !self.layout.contains_user_range(base, size) {
            return Err(VmError::OutOfRange);
        }

        let mut spaces = self.spaces.write();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(VmError::Gone);
        }
        if spaces.contains_key(&id) {
            return Err(VmError::AlreadyExists);
        }

        let space = AddressSpace::new(id, SpaceKind::User, base, size, Arc::clone(&self.layer))?;
        let handle = AddressSpaceHandle::new(space);
        spaces.insert(id, handle.acquire());
        Ok(handle)
    }

    /// Returns a new reference to the address space of process `id`.
    ///
    /// The kernel id yields the kernel space. Spaces that are being deleted are not
    /// handed out.
    pub fn get_address_space(&self, id: ProcessId) -> Option<AddressSpaceHandle<L>> {
        if id.is_kernel() {
            return Some(self.kernel.acquire());
        }

        let spaces = self.spaces.read();
        spaces
            .get(&id)
            .filter(|space| !space.is_deleting())
            .map(AddressSpaceHandle::acquire)
    }

    /// Returns the kernel address space without taking a reference.
    pub fn kernel_address_space(&self) -> &AddressSpace<L> {
        &self.kernel
    }

    /// Returns the process the calling CPU currently runs on behalf of.
    pub fn current_address_space_id(&self) -> ProcessId {
        self.context.current_process()
    }

    /// Returns a new reference to the address space of the current process.
    pub fn current_address_space(&self) -> Option<AddressSpaceHandle<L>> {
        self.get_address_space(self.current_address_space_id())
    }

    /// Marks the space of process `id` as deleting, unregisters it and drops the
    /// registry's reference. Returns false if no such process is registered.
    pub fn remove_process(&self, id: ProcessId) -> bool {
        let removed = {
            let mut spaces = self.spaces.write();
            match spaces.get(&id) {
                Some(space) => space.mark_deleting(),
                None => return false,
            }
            spaces.remove(&id)
        };

        log::debug!("process {} unregistered", id);
        // Teardown, if this was the last reference, runs outside the registry lock.
        drop(removed);
        true
    }

    /// Like [`remove_process`](Self::remove_process), then releases `handle` too.
    ///
    /// The registry entry is only removed if it still names the space `handle` refers to.
    /// Handles to the kernel space are just released.
    pub fn remove_and_release(&self, handle: AddressSpaceHandle<L>) {
        if handle.kind() == SpaceKind::Kernel {
            handle.release();
            return;
        }

        let removed = {
            let mut spaces = self.spaces.write();
            handle.mark_deleting();
            match spaces.get(&handle.id()) {
                Some(registered) if registered.ptr_eq(&handle) => spaces.remove(&handle.id()),
                _ => None,
            }
        };

        if removed.is_some() {
            log::debug!("process {} unregistered", handle.id());
        }
        drop(removed);
        handle.release();
    }

    /// Returns the number of registered user address spaces.
    pub fn len(&self) -> usize {
        self.spaces.read().len()
    }

    /// Returns true if no user address space is registered.
    pub fn is_empty(&self) -> bool {
        self.spaces.read().is_empty()
    }

    /// Returns the ids of all registered processes in ascending order.
    pub fn process_ids(&self) -> Vec<ProcessId> {
        self.spaces.read().keys().copied().collect()
    }

    /// Unregisters every user space, then retires every lock, the kernel's last.
    ///
    /// Outstanding handles stay valid, but their locks fail with
    /// [`VmError::LockFailure`]. No space can be created afterwards. The kernel space is
    /// torn down when the registry is dropped.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let spaces = core::mem::take(&mut *self.spaces.write());
        let count = spaces.len();
        for (_, space) in spaces {
            space.mark_deleting();
            space.retire_lock();
        }

        self.kernel.mark_deleting();
        self.kernel.retire_lock();
        log::debug!("address space registry shut down ({} user spaces)", count);
    }
}
