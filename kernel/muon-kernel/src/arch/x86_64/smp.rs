//! SMP bring-up: real-mode trampoline and AP initialization.
//!
//! The BSP copies a 16→32→64-bit trampoline blob to physical 0x70000,
//! fills its argument slots (CR3, IDTR image, entry point, per-AP stack,
//! per-AP argument, boot counter) and starts each AP with an INIT IPI, a
//! 10 ms wait, and up to two STARTUP IPIs polled against the boot counter
//! for 200 ms each. The low megabyte is identity-mapped around the
//! procedure and unmapped once every AP has reported in.

use core::sync::atomic::{AtomicU32, Ordering};

use muon_acpi::Madt;
use muon_acpi::madt::{LAPIC_FLAG_ENABLED, LAPIC_FLAG_ONLINE_CAPABLE};
use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::{kinfo, kwarn};

use crate::config::TRAMPOLINE_ADDR;
use crate::mm::vmm::{HhdmMapper, PageFlags};

use super::apic::{self, IpiKind};
use super::instructions::sidt;

mod trampoline;

/// Offsets of the argument slots within the trampoline page.
const ARG_BASE: u64 = 0xF00;
const ARG_CR3: u64 = ARG_BASE;
const ARG_IDTR: u64 = ARG_BASE + 0x08;
const ARG_ENTRY: u64 = ARG_BASE + 0x18;
const ARG_RSP: u64 = ARG_BASE + 0x20;
const ARG_CPU: u64 = ARG_BASE + 0x28;
const ARG_COUNTER: u64 = ARG_BASE + 0x30;

/// Pages for each AP's boot kernel stack (16 KiB).
const AP_STACK_PAGES: u64 = 4;

/// CPUs that completed [`ap_entry`].
static APS_ONLINE: AtomicU32 = AtomicU32::new(0);

fn arg_ptr<T>(offset: u64) -> *mut T {
    crate::mm::hhdm::phys_to_virt(PhysAddr::new(TRAMPOLINE_ADDR + offset)).as_mut_ptr()
}

fn read_boot_counter() -> u32 {
    // SAFETY: The counter slot lives in the trampoline page, mapped via
    // the HHDM.
    unsafe { core::ptr::read_volatile(arg_ptr::<u32>(ARG_COUNTER)) }
}

/// Boots every usable AP listed in the MADT. Returns the total CPU count
/// (BSP included) and declares it to the scheduler gate.
pub fn init(madt: &Madt) {
    let kernel_root = crate::mm::vmm::with_vmm(|vmm| vmm.kernel_root());

    // Identity-map the low megabyte for the real-mode stage.
    crate::mm::vmm::with_vmm(|vmm| {
        crate::mm::pmm::with_pmm(|pmm| {
            vmm.map(
                &HhdmMapper,
                pmm,
                None,
                VirtAddr::zero(),
                PhysAddr::zero(),
                256,
                PageFlags::DEFAULT,
                false,
            );
        });
    });

    // Copy the blob and fill the static argument slots.
    let blob = trampoline::blob();
    assert!(blob.len() as u64 <= ARG_BASE, "trampoline blob overlaps args");
    // SAFETY: The trampoline page is reserved low memory the PMM never
    // hands out; the HHDM alias is mapped writable.
    unsafe {
        core::ptr::copy_nonoverlapping(blob.as_ptr(), arg_ptr::<u8>(0), blob.len());
        core::ptr::write_volatile(arg_ptr::<u64>(ARG_CR3), kernel_root.as_u64());
        core::ptr::write_volatile(arg_ptr::<[u8; 10]>(ARG_IDTR), sidt());
        core::ptr::write_volatile(arg_ptr::<u64>(ARG_ENTRY), ap_entry as usize as u64);
        core::ptr::write_volatile(arg_ptr::<u32>(ARG_COUNTER), 0);
    }

    let bsp_lapic = apic::lapic_id();
    let mut cpu_count = 1u32;

    for (proc_id, lapic_id, flags) in madt.local_apics() {
        if flags & (LAPIC_FLAG_ENABLED | LAPIC_FLAG_ONLINE_CAPABLE) == 0 {
            kinfo!("SMP: core {} neither enabled nor online-capable", proc_id);
            continue;
        }
        if lapic_id == bsp_lapic {
            continue;
        }
        if cpu_count as usize >= crate::config::MAX_CPUS {
            kwarn!("SMP: MAX_CPUS reached, leaving core {} offline", proc_id);
            break;
        }

        let stack_phys = crate::mm::pmm::with_pmm(|pmm| pmm.get(AP_STACK_PAGES, 0));
        let stack_top = crate::mm::hhdm::phys_to_virt(PhysAddr::new(stack_phys)).as_u64()
            + AP_STACK_PAGES * crate::mm::PAGE_SIZE;
        // SAFETY: Writing per-AP argument slots before the STARTUP IPI.
        unsafe {
            core::ptr::write_volatile(arg_ptr::<u64>(ARG_RSP), stack_top);
            core::ptr::write_volatile(
                arg_ptr::<u64>(ARG_CPU),
                u64::from(cpu_count) | (u64::from(lapic_id) << 32),
            );
        }

        let counter_before = read_boot_counter();
        apic::send_ipi(lapic_id, 0, IpiKind::Init);
        super::hpet::sleep_ms(10);

        let mut started = false;
        for _attempt in 0..2 {
            apic::send_ipi(
                lapic_id,
                (TRAMPOLINE_ADDR / crate::mm::PAGE_SIZE) as u8,
                IpiKind::Startup,
            );
            for _poll in 0..20 {
                if read_boot_counter() != counter_before {
                    started = true;
                    break;
                }
                super::hpet::sleep_ms(10);
            }
            if started {
                break;
            }
        }

        if started {
            kinfo!("SMP: core {} (lapic {}) up", proc_id, lapic_id);
            cpu_count += 1;
        } else {
            kwarn!("SMP: core {} (lapic {}) failed to start", proc_id, lapic_id);
            crate::mm::pmm::with_pmm(|pmm| pmm.free(stack_phys, AP_STACK_PAGES));
        }
    }

    // Wait for every started AP to leave the trampoline path, then drop
    // the identity mapping.
    while APS_ONLINE.load(Ordering::Acquire) < cpu_count - 1 {
        super::hpet::sleep_ms(1);
    }
    crate::mm::vmm::with_vmm(|vmm| {
        crate::mm::pmm::with_pmm(|pmm| {
            vmm.unmap(&HhdmMapper, pmm, None, VirtAddr::zero(), 256, false);
        });
    });

    crate::sched::set_expected_cpus(cpu_count);
    kinfo!("SMP: {} processors brought up", cpu_count);
}

/// Long-mode AP entry, reached from the trampoline with the packed
/// cpu-id/lapic-id argument in RDI.
extern "C" fn ap_entry(arg: u64) -> ! {
    let cpu_id = (arg & 0xFFFF_FFFF) as u32;
    let lapic_id = (arg >> 32) as u8;

    let tables = super::gdt::install_for_cpu(0);
    // SAFETY: GDT/TSS are installed; this runs once on this AP before any
    // syscall or scheduling activity here.
    unsafe {
        super::idt::load();
        crate::percpu::init_cpu(cpu_id, lapic_id, false, &raw mut tables.tss, 0);
    }
    apic::enable();
    super::syscall::init();

    super::hpet::sleep_ms(10);
    APS_ONLINE.fetch_add(1, Ordering::AcqRel);

    crate::sched::init_cpu();

    // SAFETY: IDT, LAPIC and the scheduler gate are all set up.
    unsafe { super::instructions::sti() };
    loop {
        super::instructions::hlt();
    }
}
