//! # strand - cooperative stackful fibers
//!
//! Lightweight threads scheduled cooperatively within a single OS
//! thread. Each fiber owns a real stack and is switched by saving and
//! restoring machine context; the per-thread scheduler tracks ready,
//! sleeping and terminated fibers and reclaims them safely once their
//! stacks have unwound.
//!
//! ## Quick Start
//!
//! ```no_run
//! use strand::{spawn, yield_now};
//!
//! let counter = std::rc::Rc::new(std::cell::Cell::new(0));
//!
//! let c = counter.clone();
//! let fiber = spawn(move || {
//!     c.set(c.get() + 1);
//!     yield_now();
//!     c.set(c.get() + 1);
//! })
//! .expect("stack allocation failed");
//!
//! fiber.join();
//! assert_eq!(counter.get(), 2);
//! ```
//!
//! ## Model
//!
//! - Every OS thread lazily gets its own scheduler, a *main* fiber
//!   stub for the thread's native stack, and a *dispatcher* fiber that
//!   runs whenever no worker is ready.
//! - Scheduling is strictly cooperative: fibers suspend in `join`,
//!   `sleep`, `yield_now`, or when their body returns. There is no
//!   preemption and no cross-thread migration.
//! - Fibers are not `Send`; they live and die on the thread that
//!   spawned them.
//!
//! The dispatch policy and the idle-suspension source can be replaced
//! per thread with [`set_custom_dispatcher`] and [`set_suspend_hook`].

pub use strand_core::error::{FiberError, FiberResult, StackError};
pub use strand_core::list::{Hook, List};
pub use strand_core::name::FiberName;
pub use strand_core::state::FiberKind;
pub use strand_core::trace::{set_verbosity, Level};

pub use strand_runtime::fiber::{wait_hook_of, Builder, FiberCtrl, FiberRef};
pub use strand_runtime::registry::{fiber_active, set_custom_dispatcher, set_suspend_hook};
pub use strand_runtime::scheduler::{sleep, sleep_until, yield_now, Scheduler};
pub use strand_runtime::stack::{MmapStacks, StackRegion, StackSource};

/// Spawn a fiber on the calling thread's scheduler and start it.
///
/// Equivalent to [`Builder::spawn`] followed by
/// [`FiberCtrl::start`].
pub fn spawn<F>(f: F) -> FiberResult<FiberRef>
where
    F: FnOnce() + 'static,
{
    let fiber = Builder::new().spawn(f)?;
    fiber.start();
    Ok(fiber)
}
