//! Syscall entry: SYSCALL instruction and the 0x80 soft-interrupt gate.
//!
//! Both paths build a full [`TaskRegs`] frame at the top of the current
//! task's kernel stack and hand it to the dispatcher; results travel back
//! through the frame (RAX = result, RDX = errno) and an `iretq` returns to
//! user mode. Returning via `iretq` on both paths keeps a single restore
//! convention and lets the fork path clone one frame layout.
//!
//! The SYSCALL stub leans on the per-CPU block published through GS:
//! `gs:[8]` holds the kernel stack top, `gs:[16]` is scratch for the user
//! RSP. GS bases are never swapped (see the scheduler switch stubs).

use core::arch::naked_asm;

use super::gdt;
use super::instructions::{
    MSR_EFER, MSR_LSTAR, MSR_SFMASK, MSR_STAR, read_msr, write_msr,
};
use crate::sched::task::TaskRegs;

/// RFLAGS bits cleared on SYSCALL entry: TF, IF, DF, IOPL, NT, AC.
const SFMASK_BITS: u64 = 0x100 | 0x200 | 0x400 | 0x3000 | 0x4000 | 0x40000;

/// Programs EFER.SCE, STAR, LSTAR and SFMASK on the calling CPU.
pub fn init() {
    write_msr(MSR_EFER, read_msr(MSR_EFER) | 1);

    let star = (u64::from(gdt::KERNEL_CODE) << 32) | (u64::from(gdt::KERNEL_DATA | 3) << 48);
    write_msr(MSR_STAR, star);
    write_msr(MSR_LSTAR, syscall_instr_stub as usize as u64);
    write_msr(MSR_SFMASK, SFMASK_BITS);
}

/// Rust-side landing point: dispatches on the assembled frame.
extern "C" fn syscall_entry(frame: *mut TaskRegs) {
    // SAFETY: Both stubs pass a pointer to the frame they just built on
    // the current kernel stack; it lives until the stub's restore path.
    let frame = unsafe { &mut *frame };
    crate::syscall::dispatch(frame);
}

/// `SYSCALL` instruction entry (via IA32_LSTAR).
///
/// On entry RCX = user RIP, R11 = user RFLAGS, RSP is still the user
/// stack. The stub parks the user RSP in the per-CPU block, switches to
/// the kernel stack and synthesizes the same frame an interrupt would
/// have pushed.
#[unsafe(naked)]
pub extern "C" fn syscall_instr_stub() {
    naked_asm!(
        "mov gs:[16], rsp",
        "mov rsp, gs:[8]",
        "push 0x43",            // user SS
        "push qword ptr gs:[16]", // user RSP
        "push r11",             // user RFLAGS
        "push 0x3B",            // user CS
        "push rcx",             // user RIP
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {entry}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        entry = sym syscall_entry,
    );
}

/// Soft-interrupt entry (vector 0x80, DPL 3). The CPU already switched to
/// the kernel stack and pushed the interrupt frame.
#[unsafe(naked)]
pub extern "C" fn soft_syscall_stub() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {entry}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        entry = sym syscall_entry,
    );
}
