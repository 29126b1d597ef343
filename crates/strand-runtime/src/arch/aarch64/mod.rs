//! aarch64 context switching implementation
//!
//! Saves the AAPCS64 callee-saved registers: x19-x28, fp, lr and the
//! low halves of v8-v15. lr doubles as the resume point.

use super::{EntryFn, RawContext, RawTransfer};
use std::arch::naked_asm;

/// Saved frame size in bytes: ten x-register pairs of 16 bytes
const FRAME_SIZE: usize = 160;

/// Frame offsets of the seeded registers
const OFF_X19: usize = 0;
const OFF_X20: usize = 8;
const OFF_LR: usize = 88;

/// Build the initial frame of a fresh fiber
///
/// # Safety
///
/// `stack_top` must be the high end of a mapped region with at least
/// `FRAME_SIZE` writable bytes below it.
pub unsafe fn init_context(stack_top: *mut u8, entry: EntryFn, ctrl: *mut u8) -> RawContext {
    // sp must stay 16-byte aligned at all times on aarch64.
    let base = (stack_top as usize) & !0xF;
    let frame = (base - FRAME_SIZE) as *mut u8;

    core::ptr::write_bytes(frame, 0, FRAME_SIZE);
    (frame.add(OFF_X19) as *mut u64).write(entry as usize as u64);
    (frame.add(OFF_X20) as *mut u64).write(ctrl as u64);
    (frame.add(OFF_LR) as *mut u64).write(fiber_entry_trampoline as usize as u64);

    RawContext::from_ptr(frame)
}

/// First-run landing pad
///
/// The resumer's context arrives in x0 and its payload in x1, exactly
/// as a resumed [`switch_context`] call would return them; x19/x20 were
/// seeded by [`init_context`].
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov x2, x20",
        "blr x19",
        "brk #0x1",
    );
}

/// Switch stacks: save callee-saved registers, adopt `target_sp`,
/// restore and resume.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_target_sp: *mut u8, _payload: *mut u8) -> RawTransfer {
    naked_asm!(
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        // Publish our continuation and adopt the target stack.
        "mov x9, x0",
        "mov x0, sp",
        "mov sp, x9",
        // Restore the target side and resume it; x1 carries the
        // payload through untouched.
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "ret",
    );
}
