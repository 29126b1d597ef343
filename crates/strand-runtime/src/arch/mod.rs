//! Architecture-specific context switching
//!
//! A context switch saves the callee-saved registers of the suspending
//! fiber on its own stack, adopts the target fiber's stack pointer and
//! restores the target's registers. The suspender's fresh stack pointer
//! travels to the resumed side as [`Transfer::ctx`], so every
//! suspension leaves behind a well-defined way to resume it. A payload
//! pointer rides along untouched.
//!
//! No heap allocation happens per switch; a fresh fiber costs one
//! hand-written frame at the top of its stack.

use core::fmt;
use core::ptr::NonNull;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        use self::x86_64 as imp;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        use self::aarch64 as imp;
    }
}

/// Raw switch result, returned in the first two return registers
#[repr(C)]
pub struct RawTransfer {
    pub ctx: *mut u8,
    pub data: *mut u8,
}

/// First-run entry of a fiber
///
/// Receives the resumer's context, the payload it passed, and the
/// address of this fiber's control block. Never returns; a fiber ends
/// by switching away for the last time.
pub type EntryFn = unsafe extern "C" fn(resumer: *mut u8, payload: *mut u8, ctrl: *mut u8) -> !;

/// Handle to a suspended machine context
///
/// One-shot: resuming a context consumes it, and the resumed side hands
/// back a fresh handle for its resumer.
pub struct RawContext(NonNull<u8>);

impl RawContext {
    /// # Safety
    ///
    /// `sp` must be a stack pointer produced by [`switch`] or
    /// [`init_context`] that has not been resumed since.
    #[inline]
    pub(crate) unsafe fn from_ptr(sp: *mut u8) -> Self {
        debug_assert!(!sp.is_null());
        RawContext(NonNull::new_unchecked(sp))
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }
}

impl fmt::Debug for RawContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawContext({:p})", self.0)
    }
}

/// What a resumed fiber observes: who resumed it, and with what payload
#[derive(Debug)]
pub struct Transfer {
    /// Continuation of the fiber we were resumed from
    pub ctx: RawContext,
    /// Payload pointer the resumer passed; null carries meaning for the
    /// fiber lifecycle (see `fiber::resolve_transfer`)
    pub data: *mut u8,
}

impl Transfer {
    /// # Safety
    ///
    /// Same contract as [`RawContext::from_ptr`] for `resumer`.
    #[inline]
    pub(crate) unsafe fn from_raw(resumer: *mut u8, data: *mut u8) -> Self {
        Transfer {
            ctx: RawContext::from_ptr(resumer),
            data,
        }
    }
}

/// Transfer control to `target`, suspending the current context.
///
/// Returns when something later resumes the suspended context, carrying
/// the resumer's continuation and payload.
///
/// # Safety
///
/// `target` must be resumable exactly once and its stack must be live.
#[inline]
pub unsafe fn switch(target: RawContext, payload: *mut u8) -> Transfer {
    let raw = imp::switch_context(target.as_ptr(), payload);
    Transfer::from_raw(raw.ctx, raw.data)
}

/// Build the initial context of a fresh fiber.
///
/// The first resume lands in an architecture trampoline that forwards
/// the incoming transfer plus `ctrl` to `entry` on the new stack.
///
/// # Safety
///
/// `stack_top` must be the high end of a mapped stack with room for the
/// initial frame below it.
#[inline]
pub unsafe fn init_context(stack_top: *mut u8, entry: EntryFn, ctrl: *mut u8) -> RawContext {
    imp::init_context(stack_top, entry, ctrl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{MmapStacks, StackSource};
    use core::ptr;

    unsafe extern "C" fn bump_entry(resumer: *mut u8, payload: *mut u8, ctrl: *mut u8) -> ! {
        let counter = payload as *mut u32;
        *counter += 1;
        assert_eq!(ctrl as usize, 0xC0DE);

        // Hand control straight back; this context is then abandoned.
        let _ = switch(RawContext::from_ptr(resumer), ptr::null_mut());
        unreachable!();
    }

    #[test]
    fn test_switch_runs_entry_on_new_stack() {
        let source = MmapStacks;
        let region = source.allocate(64 * 1024).unwrap();

        let mut counter: u32 = 0;
        unsafe {
            let ctx = init_context(region.top(), bump_entry, 0xC0DE as *mut u8);
            let transfer = switch(ctx, &mut counter as *mut u32 as *mut u8);

            assert_eq!(counter, 1);
            assert!(transfer.data.is_null());
            source.deallocate(region);
        }
    }

    #[test]
    fn test_switch_ping_pong() {
        unsafe extern "C" fn pong(resumer: *mut u8, payload: *mut u8, _ctrl: *mut u8) -> ! {
            let counter = payload as *mut u32;
            let mut back = RawContext::from_ptr(resumer);
            loop {
                *counter += 1;
                let t = switch(back, ptr::null_mut());
                back = t.ctx;
            }
        }

        let source = MmapStacks;
        let region = source.allocate(64 * 1024).unwrap();

        let mut counter: u32 = 0;
        unsafe {
            let ctx = init_context(region.top(), pong, ptr::null_mut());
            let t = switch(ctx, &mut counter as *mut u32 as *mut u8);
            assert_eq!(counter, 1);
            let t = switch(t.ctx, &mut counter as *mut u32 as *mut u8);
            assert_eq!(counter, 2);
            let _ = t;
            source.deallocate(region);
        }
    }
}
