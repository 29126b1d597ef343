//! Fiber kind and state flags

use core::cell::Cell;
use core::fmt;

/// Role of a fiber within its thread's scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberKind {
    /// Stub representing the OS thread's native stack. Owns no stack
    /// mapping and is never reclaimed by the scheduler.
    Main = 0,

    /// The per-thread dispatcher. Runs the scheduling policy whenever
    /// no worker is ready.
    Dispatch = 1,

    /// An ordinary fiber running user code.
    Worker = 2,
}

impl FiberKind {
    #[inline]
    pub const fn is_worker(self) -> bool {
        matches!(self, FiberKind::Worker)
    }

    /// Kinds whose control block is embedded in the stack they own
    #[inline]
    pub const fn owns_stack(self) -> bool {
        !matches!(self, FiberKind::Main)
    }
}

impl fmt::Display for FiberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberKind::Main => write!(f, "main"),
            FiberKind::Dispatch => write!(f, "dispatch"),
            FiberKind::Worker => write!(f, "worker"),
        }
    }
}

/// Bit set once the fiber's user function has returned
pub const TERMINATED: u8 = 1 << 0;

/// Bit set when the fiber has been attached and marked ready
pub const STARTED: u8 = 1 << 1;

/// Bit set when the dispatcher's dispatch loop has exited
pub const DISPATCH_DONE: u8 = 1 << 2;

/// Per-fiber state flags
///
/// Single-threaded by contract, hence `Cell` rather than atomics.
pub struct FiberFlags(Cell<u8>);

impl FiberFlags {
    #[inline]
    pub const fn new() -> Self {
        FiberFlags(Cell::new(0))
    }

    #[inline]
    pub fn contains(&self, bit: u8) -> bool {
        self.0.get() & bit != 0
    }

    #[inline]
    pub fn insert(&self, bit: u8) {
        self.0.set(self.0.get() | bit);
    }

    #[inline]
    pub fn terminated(&self) -> bool {
        self.contains(TERMINATED)
    }

    #[inline]
    pub fn started(&self) -> bool {
        self.contains(STARTED)
    }

    #[inline]
    pub fn dispatch_done(&self) -> bool {
        self.contains(DISPATCH_DONE)
    }
}

impl Default for FiberFlags {
    fn default() -> Self {
        FiberFlags::new()
    }
}

impl fmt::Debug for FiberFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberFlags({:#04b})", self.0.get())
    }
}
