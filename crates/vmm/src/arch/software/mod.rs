//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated architecture that can run on any host.
//! It's designed for testing and development without requiring actual hardware access.
//!
//! The software-emulated architecture is a "scale model" of x86_64:
//! - 4 KiB pages, as on x86_64
//! - a 32-bit virtual address space (vs 48-bit on x86_64)
//! - the lower half belongs to user processes, the upper half to the kernel
//!
//! Instead of page tables, the emulated translation layer records which pages are
//! mapped and charges them against a fixed budget of "physical" pages, so tests can
//! observe every call the address-space manager makes and provoke exhaustion.

mod context;
mod translation;

pub use context::{ContextGuard, EmulatedContext};
pub use translation::{EmulatedMap, EmulatedTranslationLayer};

/// Page size in bytes (4 KiB = 2^12).
pub const PAGE_SIZE: usize = 4096;

/// Lowest address of the default user window.
pub const USER_BASE: usize = 0;

/// Size of the default user window (the lower 2 GiB).
pub const USER_SIZE: usize = 0x8000_0000;

/// Lowest address of the default kernel window.
pub const KERNEL_BASE: usize = 0x8000_0000;

/// Size of the default kernel window. The top page is left out so the window's end
/// stays representable.
pub const KERNEL_SIZE: usize = 0x7FFF_F000;
