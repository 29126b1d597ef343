//! x86_64 context switching implementation
//!
//! Uses inline assembly for the switch. Stable in Rust 1.88+.
//!
//! Only the System V callee-saved registers travel through a voluntary
//! switch: rsp, rbx, rbp, r12-r15, plus the return address that acts as
//! the resume point. Everything else is caller-saved and already dead
//! at the call site.

use super::{EntryFn, RawContext, RawTransfer};
use std::arch::naked_asm;

/// Saved frame, low address first: r15, r14, r13, r12, rbx, rbp, rip
const FRAME_WORDS: usize = 7;

/// Build the initial frame of a fresh fiber
///
/// When first resumed, [`switch_context`] pops the frame and "returns"
/// into [`fiber_entry_trampoline`], which calls `entry` with the
/// incoming transfer and `ctrl`.
///
/// # Safety
///
/// `stack_top` must be the high end of a mapped region with at least
/// `FRAME_WORDS * 8` writable bytes below it.
pub unsafe fn init_context(stack_top: *mut u8, entry: EntryFn, ctrl: *mut u8) -> RawContext {
    // Aligned so rsp is 16-byte aligned when the trampoline runs,
    // per the System V AMD64 ABI.
    let base = (stack_top as usize) & !0xF;
    let frame = (base - FRAME_WORDS * 8) as *mut u64;

    frame.add(0).write(0); // r15
    frame.add(1).write(0); // r14
    frame.add(2).write(ctrl as u64); // r13
    frame.add(3).write(entry as usize as u64); // r12
    frame.add(4).write(0); // rbx
    frame.add(5).write(0); // rbp
    frame.add(6).write(fiber_entry_trampoline as usize as u64); // rip

    RawContext::from_ptr(frame as *mut u8)
}

/// First-run landing pad
///
/// The resumer's context arrives in rax and its payload in rdx, exactly
/// as a resumed [`switch_context`] call would return them; r12/r13 were
/// seeded by [`init_context`].
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, rax",
        "mov rsi, rdx",
        "mov rdx, r13",
        "call r12",
        "ud2",
    );
}

/// Switch stacks: save callee-saved registers, adopt `target_sp`,
/// restore and resume.
///
/// Returns (in rax:rdx) the suspender's new stack pointer and the
/// payload, observed by whichever context gets resumed.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_target_sp: *mut u8, _payload: *mut u8) -> RawTransfer {
    naked_asm!(
        // Save our side; the return address is already on the stack.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Publish our continuation and adopt the target stack.
        "mov rax, rsp",
        "mov rsp, rdi",
        "mov rdx, rsi",
        // Restore the target side and resume it.
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}
