//! # strand-runtime
//!
//! Per-thread runtime for the strand fiber scheduler.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Stack mapping with guard pages (mmap)
//! - The fiber control block and its lifecycle
//! - The per-thread scheduler and dispatcher fiber
//! - The lazily-initialized thread registry
//!
//! Scheduling is cooperative and strictly per OS thread: every thread
//! owns its own scheduler, dispatcher and fiber set, and nothing here
//! is shared across threads.

#![allow(dead_code)]

pub mod arch;
pub mod dispatcher;
pub mod fiber;
pub mod registry;
pub mod scheduler;
pub mod stack;

// Re-exports
pub use fiber::{Builder, FiberCtrl, FiberRef};
pub use registry::{fiber_active, set_custom_dispatcher, set_suspend_hook};
pub use scheduler::{sleep, sleep_until, yield_now, Scheduler};
pub use stack::{MmapStacks, StackRegion, StackSource};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
