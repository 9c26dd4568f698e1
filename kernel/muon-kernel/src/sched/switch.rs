//! Context-switch entry and exit stubs.
//!
//! All three entries funnel into [`super::context_switch`] with a pointer
//! to a freshly built [`super::task::TaskRegs`] frame and the entry reason:
//!
//! * [`timer_switch_stub`] — installed on the APIC timer vector; the CPU
//!   pushed the interrupt frame, the stub adds the 15 GPRs.
//! * [`cooperative_switch`] — simulates an interrupt on the current stack
//!   so a task can suspend itself (sleep, event wait, exit) or fork.
//! * [`exit_switch`] — the only way out: optional CR3 load, stack pointer
//!   to the chosen frame, register pops, `iretq`.
//!
//! GS is never swapped: both `IA32_GS_BASE` and `IA32_KERNEL_GS_BASE` hold
//! the per-CPU block address on every CPU, so `gs:[0]` resolves from ring 0
//! regardless of where the interrupt landed.
//!
//! Register push order is fixed by the [`super::task::TaskRegs`] layout:
//! rax, rbx, rcx, rdx, rsi, rdi, rbp, r8..r15 (r15 ends up lowest).

use core::arch::naked_asm;

/// APIC timer entry: save the interrupted context, run the scheduler.
///
/// If the scheduler declines to switch (SMP gate still closed) it returns
/// here and the interrupted context resumes via the restore path.
#[unsafe(naked)]
pub extern "C" fn timer_switch_stub() {
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
        "xor esi, esi", // REASON_TIMER
        "call {switch}",
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
        switch = sym super::context_switch,
    );
}

/// Cooperative entry: builds a fake interrupt frame resuming just past the
/// stub, then runs the scheduler with the given reason.
///
/// The resumed task re-enters at the local label with its pre-call stack
/// pointer and simply returns to the caller. RAX is clobbered.
#[unsafe(naked)]
pub extern "C" fn cooperative_switch(reason: u64) {
    naked_asm!(
        // Fake the hardware frame: ss, rsp, rflags, cs, rip.
        "mov rax, rsp",
        "push 0x30", // kernel data selector
        "push rax",
        "pushfq",
        "push 0x28", // kernel code selector
        "lea rax, [rip + 2f]",
        "push rax",
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
        "mov rsi, rdi", // reason
        "mov rdi, rsp", // frame
        "sub rsp, 8",   // call-site alignment
        "call {switch}",
        // Scheduler declined (SMP gate): unwind the fake frame in place.
        "add rsp, 8",
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
        "add rsp, 40", // drop the fake hardware frame
        "2:",
        "ret",
        switch = sym super::context_switch,
    );
}

/// Restores the chosen task: optional CR3 switch first (so the frame is
/// read through the target address space), then pops and `iretq`.
///
/// # Safety
///
/// `frame` must point at a valid [`super::task::TaskRegs`] readable in the
/// target address space; `cr3` must be the target paging root or 0 to keep
/// the current one. Never returns.
#[unsafe(naked)]
pub unsafe extern "C" fn exit_switch(frame: u64, cr3: u64) -> ! {
    naked_asm!(
        "test rsi, rsi",
        "jz 2f",
        "mov cr3, rsi",
        "2:",
        "mov rsp, rdi",
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
    );
}
