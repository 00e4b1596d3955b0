//! Process identity and the execution-context collaborator.

use core::fmt;

/// Identifies the process owning an address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    /// The identifier reserved for the kernel address space.
    pub const KERNEL: Self = Self(0);

    /// Creates a new process identifier.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true if this is the kernel's identifier.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 == Self::KERNEL.0
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_kernel() {
            f.write_str("ProcessId(kernel)")
        } else {
            write!(f, "ProcessId({})", self.0)
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolves which process the calling thread is running on behalf of.
///
/// Implemented by the scheduler. Must be callable from fault context.
pub trait ExecutionContext: Send + Sync {
    /// Returns the process the calling context belongs to.
    fn current_process(&self) -> ProcessId;
}

impl<F> ExecutionContext for F
where
    F: Fn() -> ProcessId + Send + Sync,
{
    fn current_process(&self) -> ProcessId {
        self()
    }
}
