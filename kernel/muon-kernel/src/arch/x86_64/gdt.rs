//! Global descriptor table and TSS, one set per CPU.
//!
//! The layout is fixed by the SMP trampoline and the syscall MSRs: the
//! 16-bit and 32-bit entries exist for the real-mode bring-up path, the
//! 64-bit pairs sit at the selectors baked into SYSCALL/SYSRET and the
//! trap-frame builders.

extern crate alloc;

use alloc::boxed::Box;

use super::instructions::{DescriptorTablePointer, lgdt, ltr};

/// Kernel 64-bit code selector.
pub const KERNEL_CODE: u16 = 0x28;
/// Kernel 64-bit data selector.
pub const KERNEL_DATA: u16 = 0x30;
/// User 64-bit code selector (RPL 3).
pub const USER_CODE: u16 = 0x38 | 3;
/// User 64-bit data selector (RPL 3).
pub const USER_DATA: u16 = 0x40 | 3;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x48;

/// 64-bit task state segment.
#[repr(C, packed)]
pub struct Tss {
    reserved0: u32,
    /// Stack loaded on ring-3 → ring-0 transitions.
    pub rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    reserved1: u64,
    /// Interrupt stack table slots.
    pub ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    iopb_offset: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            iopb_offset: core::mem::size_of::<Tss>() as u16,
        }
    }
}

/// Entry count: null + 8 segments + 2 words of TSS descriptor.
const GDT_ENTRIES: usize = 11;

/// One CPU's GDT and TSS, heap-allocated and leaked per CPU.
pub struct CpuTables {
    gdt: [u64; GDT_ENTRIES],
    /// The CPU's task state segment.
    pub tss: Tss,
}

impl CpuTables {
    fn new() -> Self {
        Self {
            gdt: [
                0,                     // 0x00 null
                0x0000_9A00_0000_FFFF, // 0x08 kernel code 16
                0x0000_9200_0000_FFFF, // 0x10 kernel data 16
                0x00CF_9A00_0000_FFFF, // 0x18 kernel code 32
                0x00CF_9200_0000_FFFF, // 0x20 kernel data 32
                0x00AF_9A00_0000_FFFF, // 0x28 kernel code 64
                0x00CF_9200_0000_FFFF, // 0x30 kernel data 64
                0x00AF_FA00_0000_FFFF, // 0x38 user code 64
                0x00CF_F200_0000_FFFF, // 0x40 user data 64
                0,                     // 0x48 TSS low (filled in install)
                0,                     //      TSS high
            ],
            tss: Tss::new(),
        }
    }

    fn fill_tss_descriptor(&mut self) {
        let base = core::ptr::addr_of!(self.tss) as u64;
        let limit = (core::mem::size_of::<Tss>() - 1) as u64;
        // Available 64-bit TSS, present, byte granularity.
        let low = limit & 0xFFFF
            | (base & 0xFF_FFFF) << 16
            | 0x89 << 40
            | (limit & 0xF_0000) << 32
            | (base & 0xFF00_0000) << 32;
        self.gdt[9] = low;
        self.gdt[10] = base >> 32;
    }
}

/// Allocates, installs and leaks this CPU's descriptor tables.
///
/// Loads the GDT, reloads every segment register and the task register.
/// Returns the leaked tables so the per-CPU block can keep the TSS pointer
/// for RSP0 updates at context switch.
pub fn install_for_cpu(initial_rsp0: u64) -> &'static mut CpuTables {
    let tables = Box::leak(Box::new(CpuTables::new()));
    tables.tss.rsp0 = initial_rsp0;
    tables.fill_tss_descriptor();

    let ptr = DescriptorTablePointer {
        limit: (GDT_ENTRIES * 8 - 1) as u16,
        base: tables.gdt.as_ptr() as u64,
    };
    // SAFETY: The GDT is fully built, leaked, and the selector constants
    // match the entry layout above. The far return reloads CS; mov reloads
    // the data segments; ltr points at the descriptor filled just above.
    unsafe {
        lgdt(&ptr);
        core::arch::asm!(
            "push {code}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {data:x}",
            "mov es, {data:x}",
            "mov ss, {data:x}",
            "xor eax, eax",
            "mov fs, ax",
            "mov gs, ax",
            code = in(reg) u64::from(KERNEL_CODE),
            data = in(reg) u64::from(KERNEL_DATA),
            tmp = out(reg) _,
            out("rax") _,
        );
        ltr(TSS_SELECTOR);
    }
    tables
}
