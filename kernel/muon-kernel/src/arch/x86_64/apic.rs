//! Local APIC: enable, EOI, inter-processor interrupts, timer.
//!
//! The register block is memory-mapped; all accesses are volatile 32-bit.
//! The timer is calibrated once on the BSP against a 50 ms HPET window and
//! then programmed periodic on every CPU at the scheduler timeslice.

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::addr::PhysAddr;
use muon_core::kinfo;

const REG_ID: u64 = 0x20;
const REG_EOI: u64 = 0xB0;
const REG_SPURIOUS: u64 = 0xF0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INIT: u64 = 0x380;
const REG_TIMER_CURRENT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

/// Software-enable bit in the spurious vector register.
const SPURIOUS_ENABLE: u32 = 0x100;
/// Spurious interrupts land on the last vector.
const SPURIOUS_VECTOR: u32 = 0xFF;

/// LVT mask bit.
const LVT_MASKED: u32 = 1 << 16;
/// LVT timer periodic mode.
const LVT_PERIODIC: u32 = 1 << 17;

/// Divide-configuration encoding for divide-by-4.
const DIVIDE_BY_4: u32 = 0b0001;
/// The divisor that encoding selects.
const TIMER_DIVISOR: u64 = 4;

/// IPI delivery modes (ICR bits 8..10).
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum IpiKind {
    /// INIT de-assert/assert.
    Init = 5,
    /// STARTUP with the vector as the page number.
    Startup = 6,
}

/// Virtual base of the LAPIC register block; zero until [`init`].
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Calibrated timer base frequency; zero until [`calibrate_timer`].
static TIMER_BASE_FREQ: AtomicU64 = AtomicU64::new(0);

fn read(offset: u64) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    debug_assert!(base != 0, "LAPIC not mapped");
    // SAFETY: Offsets are architectural LAPIC registers inside the mapped
    // block.
    unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
}

fn write(offset: u64, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    debug_assert!(base != 0, "LAPIC not mapped");
    // SAFETY: See read.
    unsafe { core::ptr::write_volatile((base + offset) as *mut u32, value) };
}

/// Records the LAPIC physical base (from the MADT) and maps it.
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
    LAPIC_BASE.store(virt.as_u64(), Ordering::Release);
    enable();
    kinfo!("APIC: lapic {} mapped, id {}", phys_base, lapic_id());
}

/// Software-enables the calling CPU's LAPIC.
pub fn enable() {
    write(REG_SPURIOUS, SPURIOUS_ENABLE | SPURIOUS_VECTOR);
}

/// This CPU's LAPIC id.
pub fn lapic_id() -> u8 {
    (read(REG_ID) >> 24) as u8
}

/// Signals end-of-interrupt to the LAPIC.
pub fn send_eoi() {
    write(REG_EOI, 1);
}

/// Sends an IPI; the write to ICR-low dispatches it.
pub fn send_ipi(dest_lapic: u8, vector: u8, kind: IpiKind) {
    write(REG_ICR_HIGH, u32::from(dest_lapic) << 24);
    write(REG_ICR_LOW, ((kind as u32) << 8) | u32::from(vector));
}

/// Calibrates the timer against the HPET: masked, divide-by-4, counting
/// down from the full 32-bit range across a 50 ms wait.
pub fn calibrate_timer() {
    write(REG_LVT_TIMER, LVT_MASKED);
    write(REG_TIMER_DIVIDE, DIVIDE_BY_4);
    write(REG_TIMER_INIT, u32::MAX);

    super::hpet::sleep_ns(50_000_000);

    let current = read(REG_TIMER_CURRENT);
    let elapsed = u64::from(u32::MAX - current);
    let base_freq = elapsed * 2 * TIMER_DIVISOR;
    TIMER_BASE_FREQ.store(base_freq, Ordering::Release);
    write(REG_LVT_TIMER, LVT_MASKED);
    kinfo!("APIC: timer base frequency {} Hz", base_freq);
}

/// Starts the periodic timer on the calling CPU, firing `vector` every
/// `period_ns` nanoseconds. [`calibrate_timer`] must have run on the BSP.
pub fn start_timer(vector: u8, period_ns: u64) {
    let base_freq = TIMER_BASE_FREQ.load(Ordering::Acquire);
    debug_assert!(base_freq != 0, "APIC timer not calibrated");
    let desired_hz = 1_000_000_000 / period_ns;
    let initial = (base_freq / (desired_hz * TIMER_DIVISOR)).max(1);

    write(REG_TIMER_DIVIDE, DIVIDE_BY_4);
    write(REG_LVT_TIMER, u32::from(vector) | LVT_PERIODIC);
    write(REG_TIMER_INIT, initial as u32);
}
