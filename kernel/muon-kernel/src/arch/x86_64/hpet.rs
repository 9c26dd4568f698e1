//! HPET time source.
//!
//! The main counter is the kernel's nanosecond clock: scheduler wakeups,
//! timestamps and the APIC timer calibration all read it. Configured once
//! from the ACPI HPET table; when the table is absent the PIT fallback in
//! [`super::pit`] provides coarse waits instead.

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::addr::PhysAddr;
use muon_core::kinfo;

const REG_CAPABILITIES: u64 = 0x000;
const REG_CONFIGURATION: u64 = 0x010;
const REG_MAIN_COUNTER: u64 = 0x0F0;

/// ENABLE_CNF bit in the configuration register.
const ENABLE: u64 = 1;

/// Virtual register base; zero until [`init`].
static HPET_BASE: AtomicU64 = AtomicU64::new(0);
/// Counter period in femtoseconds per tick.
static PERIOD_FS: AtomicU64 = AtomicU64::new(0);

fn read64(offset: u64) -> u64 {
    let base = HPET_BASE.load(Ordering::Acquire);
    // SAFETY: Offsets are architectural HPET registers inside the mapped
    // block; init stored a valid base.
    unsafe { core::ptr::read_volatile((base + offset) as *const u64) }
}

fn write64(offset: u64, value: u64) {
    let base = HPET_BASE.load(Ordering::Acquire);
    // SAFETY: See read64.
    unsafe { core::ptr::write_volatile((base + offset) as *mut u64, value) };
}

/// Maps the register block, reads the counter period and starts the
/// counter.
pub fn init(phys_base: PhysAddr) {
    let virt = crate::mm::hhdm::phys_to_virt(phys_base);
    crate::mm::vmm::with_vmm(|vmm| {
        crate::mm::pmm::with_pmm(|pmm| {
            vmm.map(
                &crate::mm::vmm::HhdmMapper,
                pmm,
                None,
                virt,
                phys_base,
                1,
                crate::mm::vmm::PageFlags::MMIO,
                false,
            );
        });
    });
    HPET_BASE.store(virt.as_u64(), Ordering::Release);

    let caps = read64(REG_CAPABILITIES);
    PERIOD_FS.store(caps >> 32, Ordering::Release);
    write64(REG_CONFIGURATION, read64(REG_CONFIGURATION) | ENABLE);

    kinfo!(
        "HPET: {} at {}, period {} fs",
        if caps & (1 << 13) != 0 { "64-bit" } else { "32-bit" },
        phys_base,
        caps >> 32
    );
}

/// Whether the HPET was found and started.
pub fn is_available() -> bool {
    HPET_BASE.load(Ordering::Acquire) != 0
}

/// Nanoseconds since the counter started.
pub fn now_ns() -> u64 {
    if !is_available() {
        return 0;
    }
    let period_fs = PERIOD_FS.load(Ordering::Relaxed);
    let ticks = read64(REG_MAIN_COUNTER);
    (u128::from(ticks) * u128::from(period_fs) / 1_000_000) as u64
}

/// Busy-waits for at least `ns` nanoseconds.
pub fn sleep_ns(ns: u64) {
    if !is_available() {
        super::pit::wait_ms(ns.div_ceil(1_000_000));
        return;
    }
    let target = now_ns() + ns;
    while now_ns() < target {
        core::hint::spin_loop();
    }
}

/// Busy-waits for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    sleep_ns(ms * 1_000_000);
}
