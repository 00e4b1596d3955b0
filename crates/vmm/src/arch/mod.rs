//! Architecture-specific implementations for address-space management.
//!
//! This module conditionally imports either the hardware translation layer or software
//! emulation based on the target architecture and features. Both provide the same
//! constants describing the page size and the default kernel/user windows.

// Use x86_64 hardware implementation when we're on x86_64 and not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::{KERNEL_BASE, KERNEL_SIZE, PAGE_SIZE, USER_BASE, USER_SIZE};

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
pub mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use self::software::{KERNEL_BASE, KERNEL_SIZE, PAGE_SIZE, USER_BASE, USER_SIZE};
