//! Dispatcher fiber
//!
//! Every thread has exactly one dispatcher. It runs whenever no worker
//! is ready, executing either the default dispatch loop or a custom
//! algorithm installed through the registry.
//!
//! Its entry distinguishes two resumes by the transfer payload: a
//! normal dispatch entry (payload carries the previous fiber) and the
//! final destruction resume (null payload), after which it unwinds its
//! own stack and hands control back to whoever released it.

use strand_core::error::FiberResult;
use strand_core::fdebug;
use strand_core::name::FiberName;
use strand_core::state::FiberKind;

use crate::arch::Transfer;
use crate::fiber::{self, FiberCtrl, FiberRef};
use crate::registry;
use crate::scheduler::Scheduler;
use crate::stack::{StackSource, MMAP_STACKS};

/// Usable stack for the dispatcher; the dispatch loop has shallow
/// frames
pub(crate) const DISPATCH_STACK_SIZE: usize = 64 * 1024;

/// Allocate the dispatcher for `sched`.
///
/// The control block sits at the top of the dispatcher's own stack, so
/// the returned reference is the only allocation made.
pub(crate) fn create(sched: *const Scheduler) -> FiberResult<FiberRef> {
    let region = MMAP_STACKS.allocate(DISPATCH_STACK_SIZE)?;
    unsafe {
        let fiber = fiber::create_on_stack(
            FiberKind::Dispatch,
            FiberName::new("_dispatch"),
            region,
            &MMAP_STACKS,
            dispatch_main,
            None,
        )?;
        fiber.bind_scheduler(sched);
        Ok(fiber)
    }
}

/// Entry of the dispatcher fiber
unsafe extern "C" fn dispatch_main(resumer: *mut u8, payload: *mut u8, ctrl: *mut u8) -> ! {
    let me = ctrl as *mut FiberCtrl;
    let transfer = Transfer::from_raw(resumer, payload);

    let back = match fiber::resolve_transfer(transfer) {
        // Released without ever dispatching; just unwind.
        Some(back) => back,
        None => {
            let sched = &*(*me).scheduler_ptr();

            match registry::take_custom_dispatcher() {
                Some(mut algo) => {
                    fdebug!("dispatcher running custom algorithm");
                    algo(sched);
                    registry::restore_custom_dispatcher(algo);
                }
                None => sched.default_dispatch(),
            }

            fdebug!("dispatch loop finished, switching to main");
            (*me).mark_dispatch_done();

            // Control comes back exactly once more: the destruction
            // resume issued when the scheduler drops our reference.
            match (*sched.main_ptr()).switch_to() {
                Some(back) => back,
                None => unreachable!("dispatcher resumed normally after exiting"),
            }
        }
    };

    fiber::abandon(back);
}
