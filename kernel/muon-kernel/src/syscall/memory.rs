//! Memory-mapping syscall.

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::errno::{EINVAL, Errno};

use crate::mm::vmm::{HhdmMapper, PageFlags};
use crate::mm::{PAGE_SIZE, num_pages};
use crate::sched::task::MemMap;

/// MAP_FIXED: honour the address hint exactly.
const MAP_FIXED: u64 = 0x10;

/// `mmap(hint, length, prot, flags, fd, offset)`.
///
/// Allocates `length` bytes of page-backed memory plus one leading
/// bookkeeping page and returns the address just past it. With MAP_FIXED
/// the mapping lands at the hint in both the global kernel space and the
/// task's space; otherwise the pages are identity-mapped at the physical
/// address the allocator picked. The region joins the task's mapping list
/// so fork replicates it and the reaper tears it down.
///
/// Lock order: the scheduler lock wraps the VMM/PMM work, matching the
/// switch path.
pub fn sys_mmap(
    hint: u64,
    length: u64,
    _prot: u64,
    flags: u64,
    _fd: u64,
    _offset: u64,
) -> Result<i64, Errno> {
    if length == 0 {
        return Err(EINVAL);
    }
    let pages = num_pages(length) + 1;
    let map_flags = PageFlags::USER_DEFAULT;

    let vaddr = crate::sched::with_current(|task| {
        crate::mm::vmm::with_vmm(|vmm| {
            crate::mm::pmm::with_pmm(|pmm| {
                let mapper = HhdmMapper;
                let phys = pmm.get(pages, 0);
                let vaddr = if flags & MAP_FIXED != 0 { hint } else { phys };

                if flags & MAP_FIXED != 0 {
                    vmm.map(
                        &mapper,
                        pmm,
                        None,
                        VirtAddr::new_truncate(vaddr),
                        PhysAddr::new(phys),
                        pages,
                        map_flags,
                        true,
                    );
                }
                if let Some(space) = task.addr_space.as_mut() {
                    space.map(
                        &mapper,
                        pmm,
                        VirtAddr::new_truncate(vaddr),
                        PhysAddr::new(phys),
                        pages,
                        map_flags,
                    );
                }
                task.mmap_list.push(MemMap {
                    vaddr,
                    paddr: phys,
                    pages,
                    flags: map_flags,
                });

                // Bookkeeping header in the leading page.
                let header =
                    crate::mm::hhdm::phys_to_virt(PhysAddr::new(phys)).as_mut_ptr::<u64>();
                // SAFETY: The header page was just allocated for this
                // mapping.
                unsafe {
                    header.write(pages - 1);
                    header.add(1).write(length);
                }
                vaddr
            })
        })
    });

    match vaddr {
        Some(vaddr) => Ok((vaddr + PAGE_SIZE) as i64),
        None => Err(EINVAL),
    }
}
