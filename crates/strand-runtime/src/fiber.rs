//! Fiber control block and lifecycle
//!
//! A `FiberCtrl` is the per-fiber bookkeeping record: identity, state
//! flags, reference count, intrusive queue hooks and the saved context
//! that resumes the fiber. For worker and dispatcher fibers the block
//! is placement-constructed at the high end of the fiber's own stack,
//! so one mapping covers both stack and bookkeeping.
//!
//! The block embedded in a stack can never be destroyed while that
//! stack is active. Reclaiming a fiber therefore always happens from a
//! *different* fiber: the reclaimer resumes the dead fiber one last
//! time with a null payload, the dead fiber unwinds and switches back,
//! and only then is the mapping released.

use core::cell::Cell;
use core::ptr::{self, NonNull};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use strand_core::error::{FiberError, FiberResult};
use strand_core::list::{Hook, List};
use strand_core::name::FiberName;
use strand_core::state::{self, FiberFlags, FiberKind};
use strand_core::{ferror, ftrace};

use crate::arch::{self, RawContext, Transfer};
use crate::registry;
use crate::scheduler::Scheduler;
use crate::stack::{StackRegion, StackSource, GUARD_SIZE, MMAP_STACKS};

/// Default usable stack size for worker fibers
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest accepted worker stack
pub const MIN_STACK_SIZE: usize = 16 * 1024;

type FiberBody = Box<dyn FnOnce()>;

/// Per-fiber control block
///
/// Scheduling state is single-threaded per OS thread; interior
/// mutability is `Cell`-based because shared borrows stay live across
/// suspension points.
pub struct FiberCtrl {
    kind: FiberKind,
    name: FiberName,

    /// Strong references. Zero permits destruction, which never runs on
    /// the fiber's own stack.
    use_count: Cell<u32>,
    flags: FiberFlags,

    /// Owning scheduler; bound exactly once when the fiber is attached
    scheduler: Cell<*const Scheduler>,

    /// Continuation that resumes this fiber. Empty while the fiber is
    /// running, and for a main stub that has not suspended yet.
    entry: Cell<Option<RawContext>>,

    pub(crate) ready_hook: Hook<FiberCtrl>,
    pub(crate) sleep_hook: Hook<FiberCtrl>,
    pub(crate) wait_hook: Hook<FiberCtrl>,
    pub(crate) terminate_hook: Hook<FiberCtrl>,

    /// Deadline while linked in the sleep queue
    wake_time: Cell<Option<Instant>>,

    /// Fibers blocked in `join` on this fiber, woken in join order
    wait_queue: List<FiberCtrl>,

    /// Owned stack mapping; absent for the main stub
    stack: Option<StackRegion>,
    stack_source: Option<&'static dyn StackSource>,

    /// Worker body, consumed on first run
    body: Cell<Option<FiberBody>>,
}

/// Wait-queue hook accessor, exposed so collaborators can build wait
/// queues that stay compatible with termination drain
pub fn wait_hook_of(f: &FiberCtrl) -> &Hook<FiberCtrl> {
    &f.wait_hook
}

pub(crate) fn ready_hook_of(f: &FiberCtrl) -> &Hook<FiberCtrl> {
    &f.ready_hook
}

pub(crate) fn sleep_hook_of(f: &FiberCtrl) -> &Hook<FiberCtrl> {
    &f.sleep_hook
}

pub(crate) fn terminate_hook_of(f: &FiberCtrl) -> &Hook<FiberCtrl> {
    &f.terminate_hook
}

impl FiberCtrl {
    fn new(
        kind: FiberKind,
        name: FiberName,
        entry: Option<RawContext>,
        stack: Option<StackRegion>,
        stack_source: Option<&'static dyn StackSource>,
        body: Option<FiberBody>,
    ) -> Self {
        FiberCtrl {
            kind,
            name,
            use_count: Cell::new(1),
            flags: FiberFlags::new(),
            scheduler: Cell::new(ptr::null()),
            entry: Cell::new(entry),
            ready_hook: Hook::new(),
            sleep_hook: Hook::new(),
            wait_hook: Hook::new(),
            terminate_hook: Hook::new(),
            wake_time: Cell::new(None),
            wait_queue: List::new(wait_hook_of),
            stack,
            stack_source,
            body: Cell::new(body),
        }
    }

    /// Stub representing the OS thread's native stack
    pub(crate) fn new_main() -> Self {
        FiberCtrl::new(FiberKind::Main, FiberName::new("main"), None, None, None, None)
    }

    #[inline]
    pub fn kind(&self) -> FiberKind {
        self.kind
    }

    #[inline]
    pub fn name(&self) -> &FiberName {
        &self.name
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.flags.terminated()
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.flags.started()
    }

    #[inline]
    pub(crate) fn use_count(&self) -> u32 {
        self.use_count.get()
    }

    #[inline]
    pub(crate) fn retain(&self) {
        self.use_count.set(self.use_count.get() + 1);
    }

    #[inline]
    pub(crate) fn scheduler_ptr(&self) -> *const Scheduler {
        self.scheduler.get()
    }

    #[inline]
    pub(crate) fn bind_scheduler(&self, sched: *const Scheduler) {
        debug_assert!(self.scheduler.get().is_null(), "fiber already attached");
        self.scheduler.set(sched);
    }

    #[inline]
    pub(crate) fn mark_dispatch_done(&self) {
        self.flags.insert(state::DISPATCH_DONE);
    }

    #[inline]
    pub(crate) fn is_dispatch_done(&self) -> bool {
        self.flags.dispatch_done()
    }

    #[inline]
    pub(crate) fn set_wake_time(&self, deadline: Instant) {
        self.wake_time.set(Some(deadline));
    }

    #[inline]
    pub(crate) fn clear_wake_time(&self) {
        self.wake_time.set(None);
    }

    #[inline]
    pub(crate) fn wake_time(&self) -> Option<Instant> {
        self.wake_time.get()
    }

    /// True when linked in one of the queues a fiber can occupy at most
    /// one of
    pub(crate) fn in_exclusive_queue(&self) -> bool {
        self.ready_hook.is_linked() || self.sleep_hook.is_linked() || self.terminate_hook.is_linked()
    }

    /// Attach this fiber to the calling thread's scheduler and mark it
    /// ready.
    pub fn start(&self) {
        assert!(!self.flags.started(), "fiber '{}' already started", self.name);
        assert!(!self.flags.terminated(), "fiber '{}' already terminated", self.name);
        self.flags.insert(state::STARTED);

        let sched = registry::current_scheduler();
        sched.attach(self);
        sched.mark_ready(self);
    }

    /// Suspend the caller until this fiber terminates.
    ///
    /// Returns immediately when the fiber has already terminated.
    pub fn join(&self) {
        let active = registry::active_ptr();
        let me = self as *const FiberCtrl as *mut FiberCtrl;
        assert!(active != me, "fiber '{}' cannot join itself", self.name);

        if self.flags.terminated() {
            return;
        }
        assert!(self.flags.started(), "joining fiber '{}' before it was started", self.name);

        unsafe {
            // Single-threaded core contract: joiner and joinee share a
            // scheduler.
            assert_eq!(
                (*active).scheduler.get(),
                self.scheduler.get(),
                "joining a fiber owned by another scheduler",
            );

            self.wait_queue.push_back(active);
            let reclaim = (*self.scheduler.get()).preempt();
            debug_assert!(reclaim.is_none());
        }
        debug_assert!(self.flags.terminated());
    }

    /// Final act of a fiber whose body has returned.
    ///
    /// Marks the fiber terminated, queues it for reclamation, wakes its
    /// joiners and yields. The returned context is the one the
    /// reclaimer later resumes us with; the surrounding trampoline must
    /// switch to it to unwind this stack.
    ///
    /// # Safety
    ///
    /// Must be called on the active fiber, exactly once, from its own
    /// entry trampoline.
    pub unsafe fn terminate(&self) -> RawContext {
        let me = self as *const FiberCtrl as *mut FiberCtrl;
        debug_assert_eq!(registry::active_ptr(), me);
        debug_assert!(!self.flags.terminated());
        debug_assert!(!self.in_exclusive_queue());
        ftrace!("fiber '{}' terminating", self.name);

        self.flags.insert(state::TERMINATED);
        let sched = &*self.scheduler.get();
        sched.schedule_termination(self);

        while let Some(joiner) = self.wait_queue.pop_front() {
            // Wake on the joiner's own scheduler, in join order.
            let joiner_sched = &*(*joiner).scheduler.get();
            joiner_sched.mark_ready(&*joiner);
        }

        match sched.preempt() {
            Some(reclaim) => reclaim,
            None => unreachable!("terminated fiber '{}' resumed without a reclaim context", self.name),
        }
    }

    /// Transfer control to this fiber.
    ///
    /// Swaps the registry's active fiber, resumes this fiber's saved
    /// context and stores the resulting continuation into the previous
    /// fiber's `entry`. Returns `None` when the caller is later resumed
    /// normally, or `Some(ctx)` when it is resumed for destruction.
    ///
    /// # Safety
    ///
    /// The fiber must hold a saved context (it is suspended or fresh)
    /// and must not be the active fiber.
    pub unsafe fn switch_to(&self) -> Option<RawContext> {
        let me = self as *const FiberCtrl as *mut FiberCtrl;
        let prev = registry::swap_active(me);
        debug_assert!(prev != me, "fiber '{}' switching to itself", self.name);

        let target = match self.entry.take() {
            Some(ctx) => ctx,
            None => unreachable!("fiber '{}' has no saved context", self.name),
        };
        let transfer = arch::switch(target, prev as *mut u8);
        resolve_transfer(transfer)
    }

    /// Drop one strong reference.
    ///
    /// At zero the fiber is destroyed, unless the release happens on
    /// the fiber's own stack; then destruction is deferred to the
    /// terminate queue and the caller must never return onto this
    /// stack.
    pub(crate) unsafe fn release(ptr: NonNull<FiberCtrl>) {
        let f = ptr.as_ref();
        let count = f.use_count.get();
        debug_assert!(count > 0, "fiber reference count underflow");
        f.use_count.set(count - 1);
        if count != 1 {
            return;
        }

        if registry::active_ptr() == ptr.as_ptr() {
            // Cannot unmap the stack we are running on; park the block
            // on the terminate queue and let the dispatcher or the main
            // fiber reclaim it.
            f.use_count.set(1);
            (*f.scheduler.get()).defer_reclaim(f);
            return;
        }
        destroy(ptr);
    }
}

impl core::fmt::Debug for FiberCtrl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FiberCtrl")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("use_count", &self.use_count.get())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Destroy a fiber whose last reference has been dropped.
///
/// Resumes the fiber one final time with a null payload so its stack
/// unwinds, then drops the control block and releases the mapping.
///
/// # Safety
///
/// `ptr` must reference a zero-count fiber that is not the active one.
unsafe fn destroy(ptr: NonNull<FiberCtrl>) {
    let f = ptr.as_ref();
    ftrace!("destroying fiber '{}'", f.name);
    debug_assert_eq!(f.use_count.get(), 0);
    debug_assert!(f.kind.owns_stack(), "main stub released through reference counting");
    debug_assert!(f.wait_queue.is_empty(), "fiber destroyed with pending joiners");
    debug_assert!(!f.in_exclusive_queue() && !f.wait_hook.is_linked());

    if let Some(back) = f.entry.take() {
        let _ = arch::switch(back, ptr::null_mut());
    }

    let stack = f.stack;
    let source = f.stack_source;
    ptr::drop_in_place(ptr.as_ptr());
    if let (Some(region), Some(source)) = (stack, source) {
        source.deallocate(region);
    }
}

/// Interpret an incoming transfer at a suspension point or first entry.
///
/// A non-null payload is the control block of the fiber that resumed
/// us; its continuation is stored there and the resume is a normal one
/// (`None`). A null payload means we were resumed for destruction and
/// must unwind, switching to the returned context last.
pub(crate) unsafe fn resolve_transfer(transfer: Transfer) -> Option<RawContext> {
    if transfer.data.is_null() {
        return Some(transfer.ctx);
    }
    let prev = transfer.data as *mut FiberCtrl;
    let stale = (*prev).entry.replace(Some(transfer.ctx));
    debug_assert!(stale.is_none(), "suspending fiber already had a saved context");
    None
}

/// Switch away for the last time; this stack is never resumed normally
/// again.
pub(crate) fn abandon(back: RawContext) -> ! {
    unsafe {
        let _ = arch::switch(back, ptr::null_mut());
    }
    unreachable!("abandoned fiber was resumed");
}

/// First-run entry of worker fibers
unsafe extern "C" fn worker_main(resumer: *mut u8, payload: *mut u8, ctrl: *mut u8) -> ! {
    let me = ctrl as *mut FiberCtrl;
    let transfer = Transfer::from_raw(resumer, payload);

    if let Some(back) = resolve_transfer(transfer) {
        // Reclaimed before ever running: discard the body and unwind.
        drop((*me).body.take());
        abandon(back);
    }

    let body = (*me).body.take().expect("worker fiber started without a body");
    if let Err(_panic) = panic::catch_unwind(AssertUnwindSafe(body)) {
        ferror!("fiber '{}' panicked; aborting", (*me).name);
        std::process::abort();
    }

    let back = (*me).terminate();
    abandon(back);
}

/// Carve a control block out of the high end of a stack mapping.
///
/// Returns the block address and the stack top left for execution.
fn carve_control_block(region: StackRegion) -> Result<(*mut FiberCtrl, *mut u8), FiberError> {
    let top = region.top() as usize;
    let align = core::mem::align_of::<FiberCtrl>().max(16);
    let ctrl = (top - core::mem::size_of::<FiberCtrl>()) & !(align - 1);
    let stack_top = ctrl & !0xF;

    let floor = region.base() as usize + GUARD_SIZE;
    if stack_top <= floor || stack_top - floor < GUARD_SIZE {
        return Err(FiberError::InvalidConfig("stack too small for a control block"));
    }
    Ok((ctrl as *mut FiberCtrl, stack_top as *mut u8))
}

/// Create a fiber of `kind` with its control block embedded in `region`.
///
/// # Safety
///
/// `region` must be freshly allocated from `source`.
pub(crate) unsafe fn create_on_stack(
    kind: FiberKind,
    name: FiberName,
    region: StackRegion,
    source: &'static dyn StackSource,
    entry_fn: arch::EntryFn,
    body: Option<FiberBody>,
) -> FiberResult<FiberRef> {
    let (ctrl, stack_top) = match carve_control_block(region) {
        Ok(parts) => parts,
        Err(e) => {
            source.deallocate(region);
            return Err(e);
        }
    };

    let ctx = arch::init_context(stack_top, entry_fn, ctrl as *mut u8);
    ptr::write(
        ctrl,
        FiberCtrl::new(kind, name, Some(ctx), Some(region), Some(source), body),
    );
    Ok(FiberRef::from_raw(ctrl))
}

/// Configures and creates worker fibers
///
/// ```ignore
/// let fiber = Builder::new()
///     .name("uploader")
///     .stack_size(128 * 1024)
///     .spawn(|| upload_all())?;
/// fiber.start();
/// fiber.join();
/// ```
pub struct Builder {
    name: FiberName,
    stack_size: usize,
    source: &'static dyn StackSource,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            name: FiberName::default(),
            stack_size: DEFAULT_STACK_SIZE,
            source: &MMAP_STACKS,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = FiberName::new(name);
        self
    }

    /// Usable stack size; rounded up to whole pages
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn stack_source(mut self, source: &'static dyn StackSource) -> Self {
        self.source = source;
        self
    }

    /// Validate the configuration without allocating anything.
    pub fn validate(&self) -> FiberResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(FiberError::InvalidConfig("stack_size below minimum"));
        }
        if self.stack_size.checked_add(crate::stack::PAGE_SIZE).is_none() {
            return Err(FiberError::InvalidConfig("stack_size overflows when page-rounded"));
        }
        Ok(())
    }

    /// Create the fiber without starting it.
    ///
    /// The only runtime failure is stack allocation; every later
    /// lifecycle violation asserts.
    pub fn spawn<F>(self, f: F) -> FiberResult<FiberRef>
    where
        F: FnOnce() + 'static,
    {
        self.validate()?;

        let region = self.source.allocate(self.stack_size)?;
        unsafe {
            create_on_stack(
                FiberKind::Worker,
                self.name,
                region,
                self.source,
                worker_main,
                Some(Box::new(f)),
            )
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

/// Strong reference to a fiber control block
///
/// Not `Send`: fibers belong to the thread that created them.
pub struct FiberRef {
    ptr: NonNull<FiberCtrl>,
}

impl FiberRef {
    /// Adopt an existing strong count.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live control block with an unclaimed reference.
    pub(crate) unsafe fn from_raw(ptr: *mut FiberCtrl) -> Self {
        FiberRef {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut FiberCtrl {
        self.ptr.as_ptr()
    }
}

impl core::ops::Deref for FiberRef {
    type Target = FiberCtrl;

    #[inline]
    fn deref(&self) -> &FiberCtrl {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for FiberRef {
    fn clone(&self) -> Self {
        self.retain();
        FiberRef { ptr: self.ptr }
    }
}

impl Drop for FiberRef {
    fn drop(&mut self) {
        unsafe { FiberCtrl::release(self.ptr) };
    }
}

impl core::fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        (**self).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn on_fiber_thread(test: impl FnOnce() + Send + 'static) {
        std::thread::spawn(test).join().unwrap();
    }

    #[test]
    fn test_builder_rejects_tiny_stack() {
        let err = Builder::new().stack_size(1024).spawn(|| {}).unwrap_err();
        assert!(matches!(err, FiberError::InvalidConfig(_)));
    }

    #[test]
    fn test_builder_validate_without_spawning() {
        assert!(Builder::new().validate().is_ok());
        assert!(Builder::new().stack_size(MIN_STACK_SIZE).validate().is_ok());

        let builder = Builder::new().stack_size(1024);
        assert!(matches!(builder.validate(), Err(FiberError::InvalidConfig(_))));

        let builder = Builder::new().stack_size(usize::MAX);
        assert!(matches!(builder.validate(), Err(FiberError::InvalidConfig(_))));
    }

    #[test]
    fn test_spawn_without_start_is_reclaimed() {
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        on_fiber_thread(move || {
            let fiber = Builder::new()
                .name("never-started")
                .spawn(move || {
                    ran2.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            assert_eq!(fiber.use_count(), 1);
            assert!(!fiber.is_started());
            drop(fiber);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_single_worker_join() {
        let value = Arc::new(AtomicU32::new(0));
        let value2 = value.clone();
        on_fiber_thread(move || {
            let v = value2.clone();
            let fiber = Builder::new()
                .name("writer")
                .spawn(move || {
                    v.store(42, Ordering::SeqCst);
                })
                .unwrap();
            fiber.start();
            fiber.join();

            assert!(fiber.is_terminated());
            assert_eq!(value2.load(Ordering::SeqCst), 42);
            assert_eq!(registry::current_scheduler().worker_count(), 0);
        });
        assert_eq!(value.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_join_after_termination_returns_immediately() {
        on_fiber_thread(|| {
            let fiber = Builder::new().name("quick").spawn(|| {}).unwrap();
            fiber.start();
            fiber.join();
            assert!(fiber.is_terminated());

            // Second join observes the terminated flag and must not
            // suspend; nothing would ever wake us again.
            fiber.join();
            assert!(fiber.is_terminated());
        });
    }

    #[test]
    fn test_dropping_handle_keeps_running_fiber_alive() {
        let done = Arc::new(AtomicU32::new(0));
        let done2 = done.clone();
        on_fiber_thread(move || {
            let d = done2.clone();
            let fiber = Builder::new()
                .name("detached")
                .spawn(move || {
                    d.store(7, Ordering::SeqCst);
                })
                .unwrap();
            fiber.start();
            // The scheduler's reference keeps the fiber alive after the
            // handle goes away.
            drop(fiber);
            crate::scheduler::yield_now();
        });
        assert_eq!(done.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_name_truncates() {
        let fiber = Builder::new()
            .name("a-rather-long-fiber-name")
            .spawn(|| {})
            .unwrap();
        assert_eq!(fiber.name().as_str(), "a-rather-long-fi");
        assert_eq!(fiber.kind(), FiberKind::Worker);
    }
}
