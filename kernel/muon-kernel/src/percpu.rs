//! Per-CPU blocks, published through the GS base MSRs.
//!
//! Each CPU owns one leaked [`PerCpu`]. `GS:[0]` holds a self-pointer so
//! [`current_cpu`] is a single load; the syscall entry stub additionally
//! relies on the `kernel_rsp`/`user_rsp` slots at fixed offsets. Both
//! `IA32_GS_BASE` and `IA32_KERNEL_GS_BASE` carry the block address, which
//! makes `swapgs` a no-op for kernel-mode entries.

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::arch::x86_64::gdt::Tss;
use crate::arch::x86_64::instructions::{MSR_GS_BASE, MSR_KERN_GS_BASE, write_msr};

/// Per-CPU state. `#[repr(C)]` fixes the offsets the assembly stubs use:
/// offset 0 = self pointer, offset 8 = kernel RSP, offset 16 = user RSP
/// scratch.
#[repr(C)]
pub struct PerCpu {
    /// Self-pointer for `GS:[0]` access (offset 0).
    pub self_ptr: u64,
    /// Kernel stack top loaded by the SYSCALL entry stub (offset 8).
    pub kernel_rsp: u64,
    /// Saved user RSP during syscall entry (offset 16).
    pub user_rsp: u64,
    /// Logical CPU id (BSP = 0).
    pub cpu_id: u32,
    /// This CPU's LAPIC id.
    pub lapic_id: u8,
    /// Whether this is the bootstrap processor.
    pub is_bsp: bool,
    /// The current task's errno cell, published at context switch.
    pub errno: AtomicI64,
    /// Address of this CPU's TSS (for RSP0 updates at context switch).
    pub tss: AtomicU64,
}

impl PerCpu {
    /// Writes the errno cell.
    pub fn set_errno(&self, value: i64) {
        self.errno.store(value, Ordering::Relaxed);
    }

    /// Reads the errno cell.
    pub fn get_errno(&self) -> i64 {
        self.errno.load(Ordering::Relaxed)
    }

    /// The CPU's TSS.
    ///
    /// # Safety
    ///
    /// Only the owning CPU may mutate its TSS, with interrupts disabled.
    pub unsafe fn tss_mut(&self) -> &mut Tss {
        // SAFETY: Set once at CPU init to a leaked TSS; contract above.
        unsafe { &mut *(self.tss.load(Ordering::Relaxed) as *mut Tss) }
    }
}

/// Allocates this CPU's block and publishes it through both GS base MSRs.
///
/// # Safety
///
/// Must run once per CPU, after the GDT/TSS install, before any syscall or
/// scheduler activity on the CPU.
pub unsafe fn init_cpu(cpu_id: u32, lapic_id: u8, is_bsp: bool, tss: *mut Tss, kernel_rsp: u64) {
    let block = Box::leak(Box::new(PerCpu {
        self_ptr: 0,
        kernel_rsp,
        user_rsp: 0,
        cpu_id,
        lapic_id,
        is_bsp,
        errno: AtomicI64::new(0),
        tss: AtomicU64::new(tss as u64),
    }));
    block.self_ptr = block as *const PerCpu as u64;

    write_msr(MSR_GS_BASE, block.self_ptr);
    write_msr(MSR_KERN_GS_BASE, block.self_ptr);
}

/// Returns the calling CPU's block via the `GS:[0]` self-pointer.
pub fn current_cpu() -> &'static PerCpu {
    let ptr: u64;
    // SAFETY: GS:[0] was set by init_cpu before this can be reached; the
    // block is leaked and never moves.
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
        &*(ptr as *const PerCpu)
    }
}

/// Updates the kernel stack top used by the SYSCALL entry stub.
///
/// # Safety
///
/// Only the owning CPU may call this, with interrupts disabled (the
/// scheduler does, at context switch).
pub unsafe fn set_kernel_rsp(rsp: u64) {
    let cpu = current_cpu();
    // SAFETY: Exclusive per the contract; the stub reads it only on the
    // same CPU.
    unsafe {
        core::ptr::write_volatile(core::ptr::addr_of!(cpu.kernel_rsp) as *mut u64, rsp);
    }
}
