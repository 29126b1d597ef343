//! Thread registry
//!
//! Per-OS-thread anchor for the fiber runtime: the active fiber
//! pointer, the scheduler, the main fiber stub and the optional custom
//! dispatch algorithm and suspension hook.
//!
//! Initialized lazily on first access. A raw pointer in a
//! const-initialized TLS cell stays readable while the owning cell is
//! dropped at thread exit, so teardown code can still reach the
//! registry; teardown destroys the scheduler first (driving the
//! dispatcher to completion and draining its queues), then the main
//! stub.

use core::cell::Cell;
use core::ptr::{self, NonNull};
use std::time::Instant;

use strand_core::fdebug;

use crate::fiber::FiberCtrl;
use crate::scheduler::Scheduler;

/// Replacement for the default dispatch loop, owning the whole policy
pub type DispatchAlgo = dyn FnMut(&Scheduler) + 'static;

/// Blocks the OS thread when nothing is runnable; receives the earliest
/// sleeper deadline, if any
pub type SuspendHook = dyn FnMut(Option<Instant>) + 'static;

/// Per-thread runtime anchor
///
/// Field order matters: the scheduler drops before the main stub.
pub struct Registry {
    /// The currently running fiber
    active: Cell<*mut FiberCtrl>,

    sched: Option<Box<Scheduler>>,
    main: Option<Box<FiberCtrl>>,

    custom_algo: Cell<Option<Box<DispatchAlgo>>>,
    suspend_hook: Cell<Option<Box<SuspendHook>>>,
}

impl Registry {
    #[inline]
    pub(crate) fn active(&self) -> *mut FiberCtrl {
        self.active.get()
    }

    #[inline]
    pub(crate) fn swap_active(&self, next: *mut FiberCtrl) -> *mut FiberCtrl {
        self.active.replace(next)
    }

    #[inline]
    pub(crate) fn scheduler(&self) -> &Scheduler {
        self.sched.as_deref().expect("thread scheduler already torn down")
    }
}

thread_local! {
    /// Raw view of the registry; const-initialized so it has no
    /// destructor and stays accessible during thread teardown
    static REGISTRY_PTR: Cell<*mut Registry> = const { Cell::new(ptr::null_mut()) };

    /// Owner of the registry; its drop at thread exit runs the
    /// scheduler teardown
    static REGISTRY_OWNER: Cell<Option<Box<Registry>>> = const { Cell::new(None) };
}

/// The calling thread's registry, created on first use
pub(crate) fn registry() -> &'static Registry {
    let ptr = REGISTRY_PTR.with(|cell| cell.get());
    if !ptr.is_null() {
        return unsafe { &*ptr };
    }
    init_registry()
}

#[cold]
fn init_registry() -> &'static Registry {
    fdebug!("initializing fiber runtime for this thread");

    let main = Box::new(FiberCtrl::new_main());
    let main_ptr = &*main as *const FiberCtrl as *mut FiberCtrl;
    let sched = Scheduler::bootstrap(main_ptr);

    let reg = Box::new(Registry {
        active: Cell::new(main_ptr),
        sched: Some(sched),
        main: Some(main),
        custom_algo: Cell::new(None),
        suspend_hook: Cell::new(None),
    });

    let reg_ptr = &*reg as *const Registry as *mut Registry;
    REGISTRY_PTR.with(|cell| cell.set(reg_ptr));
    REGISTRY_OWNER.with(|cell| cell.set(Some(reg)));
    unsafe { &*reg_ptr }
}

/// The fiber currently running on this thread
pub fn fiber_active() -> NonNull<FiberCtrl> {
    let active = registry().active();
    debug_assert!(!active.is_null());
    unsafe { NonNull::new_unchecked(active) }
}

#[inline]
pub(crate) fn active_ptr() -> *mut FiberCtrl {
    registry().active()
}

#[inline]
pub(crate) fn swap_active(next: *mut FiberCtrl) -> *mut FiberCtrl {
    registry().swap_active(next)
}

/// The calling thread's scheduler
pub fn current_scheduler() -> &'static Scheduler {
    registry().scheduler()
}

/// Install a dispatch algorithm replacing the default loop.
///
/// Takes effect the next time the dispatcher is entered for the first
/// time on this thread.
pub fn set_custom_dispatcher<F>(algo: F)
where
    F: FnMut(&Scheduler) + 'static,
{
    registry().custom_algo.set(Some(Box::new(algo)));
}

pub(crate) fn take_custom_dispatcher() -> Option<Box<DispatchAlgo>> {
    registry().custom_algo.take()
}

/// Re-install an algorithm after running it, unless it installed a
/// replacement meanwhile.
pub(crate) fn restore_custom_dispatcher(algo: Box<DispatchAlgo>) {
    let cell = &registry().custom_algo;
    let current = cell.take();
    match current {
        Some(replacement) => cell.set(Some(replacement)),
        None => cell.set(Some(algo)),
    }
}

/// Install the suspension source the dispatcher blocks on when all
/// queues are empty.
///
/// Without one, idle dispatch sleeps until the earliest deadline, and
/// aborts when there is none.
pub fn set_suspend_hook<F>(hook: F)
where
    F: FnMut(Option<Instant>) + 'static,
{
    registry().suspend_hook.set(Some(Box::new(hook)));
}

pub(crate) fn take_suspend_hook() -> Option<Box<SuspendHook>> {
    registry().suspend_hook.take()
}

pub(crate) fn restore_suspend_hook(hook: Box<SuspendHook>) {
    let cell = &registry().suspend_hook;
    let current = cell.take();
    match current {
        Some(replacement) => cell.set(Some(replacement)),
        None => cell.set(Some(hook)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::FiberKind;

    #[test]
    fn test_registry_initializes_with_main_active() {
        std::thread::spawn(|| {
            let active = fiber_active();
            let active = unsafe { active.as_ref() };
            assert_eq!(active.kind(), FiberKind::Main);
            assert_eq!(active.name().as_str(), "main");
            assert!(!active.is_terminated());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_registries_are_per_thread() {
        let first = std::thread::spawn(|| fiber_active().as_ptr() as usize)
            .join()
            .unwrap();
        let second = std::thread::spawn(|| fiber_active().as_ptr() as usize)
            .join()
            .unwrap();
        // Different threads, independent main stubs. Addresses may
        // collide after reuse, so only check both initialized.
        assert_ne!(first, 0);
        assert_ne!(second, 0);
    }
}
