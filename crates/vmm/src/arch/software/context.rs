//! Emulated execution context.

use core::cell::Cell;

use crate::context::{ExecutionContext, ProcessId};

std::thread_local! {
    /// The process each host thread is currently "running" on behalf of.
    static CURRENT_PROCESS: Cell<ProcessId> = const { Cell::new(ProcessId::KERNEL) };
}

/// Execution context for software emulation.
///
/// Each host thread stands in for a CPU. Threads start out in the kernel and switch
/// processes with [`EmulatedContext::enter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EmulatedContext;

impl EmulatedContext {
    /// Makes the calling thread run on behalf of `process` until the guard is dropped.
    pub fn enter(process: ProcessId) -> ContextGuard {
        let previous = CURRENT_PROCESS.with(|current| current.replace(process));
        ContextGuard { previous }
    }
}

impl ExecutionContext for EmulatedContext {
    fn current_process(&self) -> ProcessId {
        CURRENT_PROCESS.with(Cell::get)
    }
}

/// Restores the previously running process when dropped.
#[must_use = "the previous process is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: ProcessId,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT_PROCESS.with(|current| current.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_kernel() {
        assert_eq!(EmulatedContext.current_process(), ProcessId::KERNEL);
    }

    #[test]
    fn enter_nests_and_restores() {
        let outer = EmulatedContext::enter(ProcessId::new(3));
        assert_eq!(EmulatedContext.current_process(), ProcessId::new(3));
        {
            let _inner = EmulatedContext::enter(ProcessId::new(4));
            assert_eq!(EmulatedContext.current_process(), ProcessId::new(4));
        }
        assert_eq!(EmulatedContext.current_process(), ProcessId::new(3));
        drop(outer);
        assert_eq!(EmulatedContext.current_process(), ProcessId::KERNEL);
    }

    #[test]
    fn threads_are_independent() {
        let _guard = EmulatedContext::enter(ProcessId::new(9));
        let other = std::thread::spawn(|| EmulatedContext.current_process())
            .join()
            .unwrap();
        assert_eq!(other, ProcessId::KERNEL);
        assert_eq!(EmulatedContext.current_process(), ProcessId::new(9));
    }
}
