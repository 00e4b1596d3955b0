#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager (VMM) keeps track of the virtual address spaces of
//! the Polaris kernel and its processes. It provides:
//!
//! - One address space per process plus the kernel's, shared through counted handles.
//! - Non-overlapping areas with first-fit placement and hint-accelerated lookup.
//! - Fault classification against the area layout.
//! - A translation-layer seam, implemented with x86_64 page tables or in software.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
pub mod arch;
mod area;
mod context;
mod cursor;
mod error;
mod placement;
mod protection;
mod registry;
mod translation;

pub use address::{VirtualAddress, is_page_multiple};
pub use address_space::{
    AddressSpace, AddressSpaceHandle, AddressSpaceStats, AreasReadGuard, AreasWriteGuard,
    FaultResolution, SpaceKind,
};
pub use area::{Area, AreaId};
pub use context::{ExecutionContext, ProcessId};
pub use cursor::AreaCursor;
pub use error::{TranslationError, VmError};
pub use placement::{AreaRequest, Placement};
pub use protection::Protection;
pub use registry::{AddressSpaceRegistry, LayoutConfig};
pub use translation::TranslationLayer;

pub use arch::PAGE_SIZE;
