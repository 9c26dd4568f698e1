//! Higher-half direct map.
//!
//! The bootloader mirrors all physical memory at a fixed virtual offset.
//! The offset is recorded once at boot and used for every phys/virt
//! translation the kernel needs outside of page-table walks.

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::addr::{PhysAddr, VirtAddr};

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Records the HHDM offset. Called once, before any translation.
pub fn init(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

/// The HHDM offset.
pub fn offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Translates a physical address into its HHDM virtual alias.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_truncate(phys.as_u64() + offset())
}

/// Translates an HHDM virtual alias back to its physical address.
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    PhysAddr::new(virt.as_u64() - offset())
}
