//! Interface to the hardware-facing translation layer.
//!
//! The address-space manager decides *where* areas live. Installing and removing
//! the actual virtual-to-physical mappings is delegated to a [`TranslationLayer`],
//! which owns one opaque map per address space.

use crate::{Protection, TranslationError, VirtualAddress, context::ProcessId};

/// The translation layer collaborator.
///
/// Every method may be called concurrently for different maps. Calls for the same map
/// are serialized by the owning address space's write lock, except `destroy_map`, which
/// is only called once no other reference to the space exists.
pub trait TranslationLayer: Send + Sync {
    /// Per-address-space translation map handle.
    type Map: Send + Sync;

    /// Creates an empty translation map for the given owner.
    fn create_map(&self, owner: ProcessId) -> Result<Self::Map, TranslationError>;

    /// Releases a translation map. Any range still mapped is discarded.
    fn destroy_map(&self, map: Self::Map);

    /// Backs `[base, base + size)` with memory and maps it with `protection`.
    ///
    /// On failure nothing in the range is left mapped.
    fn map_range(
        &self,
        map: &Self::Map,
        base: VirtualAddress,
        size: usize,
        protection: Protection,
    ) -> Result<(), TranslationError>;

    /// Unmaps `[base, base + size)`, releasing its backing memory. Unmapped pages are skipped.
    fn unmap_range(&self, map: &Self::Map, base: VirtualAddress, size: usize);

    /// Changes the protection of an already mapped range.
    fn protect_range(
        &self,
        map: &Self::Map,
        base: VirtualAddress,
        size: usize,
        protection: Protection,
    );
}
