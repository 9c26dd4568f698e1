//! Kernel heap.
//!
//! A linked-list allocator over a physically contiguous block reached
//! through the HHDM, so no extra page-table work is needed. Sized once at
//! boot; frame-sized allocations (stacks, page tables, user pages) go to
//! the PMM directly, the heap only carries kernel objects.

use linked_list_allocator::LockedHeap;
use muon_core::addr::PhysAddr;

use super::num_pages;

/// Kernel heap size (16 MiB).
const HEAP_SIZE: u64 = 16 * 1024 * 1024;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Allocates and installs the kernel heap. Called once after the PMM is up.
pub fn init() {
    let phys = super::pmm::with_pmm(|pmm| pmm.get(num_pages(HEAP_SIZE), 0));
    let virt = super::hhdm::phys_to_virt(PhysAddr::new(phys));
    // SAFETY: The block was just allocated from the PMM and its HHDM alias
    // is mapped writable; nothing else references it.
    unsafe {
        HEAP.lock().init(virt.as_mut_ptr(), HEAP_SIZE as usize);
    }
}
