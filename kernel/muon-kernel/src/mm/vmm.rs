//! Virtual memory manager: 4-level page tables and address spaces.
//!
//! Each [`AddressSpace`] owns a 32 KiB-aligned 8-page block for its PML4
//! plus every intermediate table frame it allocates. The walker reaches
//! table memory through the [`PhysMapper`] trait — the kernel implements it
//! over the HHDM, host tests over a byte arena — so mapping, unmapping and
//! translation are testable off-target.
//!
//! Table teardown invariant: an intermediate table is freed only once all
//! 512 of its entries are zero, so a walker holding a Present parent entry
//! can always trust the child table.

extern crate alloc;

use alloc::vec::Vec;

use muon_core::addr::{PhysAddr, VirtAddr};

use super::PAGE_SIZE;
use super::pmm::FrameBitmap;

bitflags::bitflags! {
    /// Page-table entry flags (hardware bit positions).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Entry is present.
        const PRESENT = 1;
        /// Writable.
        const WRITABLE = 2;
        /// Accessible from ring 3.
        const USER = 4;
        /// Write-through caching.
        const WRITE_THROUGH = 8;
        /// Caching disabled.
        const CACHE_DISABLE = 16;
        /// Write-combining (PAT bit on leaf entries).
        const WRITE_COMBINE = 128;
    }
}

impl PageFlags {
    /// Kernel read-write mapping.
    pub const DEFAULT: Self = Self::PRESENT.union(Self::WRITABLE);
    /// Device memory mapping.
    pub const MMIO: Self = Self::DEFAULT.union(Self::CACHE_DISABLE);
    /// User-mode read-write mapping.
    pub const USER_DEFAULT: Self = Self::DEFAULT.union(Self::USER);
}

/// Physical address bits of a table entry.
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// PS bit: the entry maps a large page instead of pointing at a table.
const HUGE_PAGE: u64 = 1 << 7;

/// Pages in a PML4 root block.
const ROOT_BLOCK_PAGES: u64 = 8;

/// Access to physical table memory for the walker.
pub trait PhysMapper {
    /// Returns a pointer to the 4 KiB frame at `phys`.
    ///
    /// The pointer must stay valid while the frame is allocated.
    fn frame_ptr(&self, phys: PhysAddr) -> *mut u8;

    /// The currently active paging root, when running on hardware.
    fn active_root(&self) -> Option<PhysAddr> {
        None
    }

    /// Invalidates the TLB entry covering `vaddr`.
    fn flush(&self, _vaddr: VirtAddr) {}
}

/// A record of one mapping, kept for replication and teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRecord {
    /// Virtual base.
    pub vaddr: u64,
    /// Physical base.
    pub paddr: u64,
    /// Length in pages.
    pub pages: u64,
    /// Leaf flags.
    pub flags: PageFlags,
}

/// A PML4 root block and the intermediate table frames it owns.
pub struct AddressSpace {
    pml4: PhysAddr,
    tables: Vec<PhysAddr>,
}

fn table<'a, M: PhysMapper>(mapper: &M, phys: PhysAddr) -> &'a mut [u64; 512] {
    // SAFETY: `phys` is a live table frame owned by an address space; the
    // mapper contract guarantees the pointer addresses that frame.
    unsafe { &mut *mapper.frame_ptr(phys).cast::<[u64; 512]>() }
}

impl AddressSpace {
    /// Allocates a zeroed 8-page PML4 block.
    pub fn new<M: PhysMapper>(mapper: &M, pmm: &mut FrameBitmap) -> Self {
        let pml4 = PhysAddr::new(pmm.get_aligned(ROOT_BLOCK_PAGES, ROOT_BLOCK_PAGES, 0));
        // SAFETY: The block was just allocated for this root.
        unsafe {
            core::ptr::write_bytes(
                mapper.frame_ptr(pml4),
                0,
                (ROOT_BLOCK_PAGES * PAGE_SIZE) as usize,
            );
        }
        Self {
            pml4,
            tables: Vec::new(),
        }
    }

    /// The physical address loaded into CR3 for this space.
    pub fn root(&self) -> PhysAddr {
        self.pml4
    }

    /// Walks to (or creates) the child table behind `parent[index]`.
    ///
    /// `child_stride` is the span each entry of the child table covers.
    /// A large-page entry inherited from the bootloader tables is split
    /// into a full child table of smaller mappings first, so 4 KiB holes
    /// can be punched anywhere.
    fn ensure_table<M: PhysMapper>(
        &mut self,
        mapper: &M,
        pmm: &mut FrameBitmap,
        parent: PhysAddr,
        index: usize,
        child_stride: u64,
    ) -> PhysAddr {
        let entries = table(mapper, parent);
        let entry = entries[index];

        if entry & PageFlags::PRESENT.bits() == 0 {
            let frame = PhysAddr::new(pmm.get(1, 0));
            // SAFETY: Fresh frame, becomes a zeroed page table.
            unsafe { core::ptr::write_bytes(mapper.frame_ptr(frame), 0, PAGE_SIZE as usize) };
            // Intermediate entries carry the widest permissions; the leaf
            // decides the effective ones.
            entries[index] = frame.as_u64() | PageFlags::USER_DEFAULT.bits();
            self.tables.push(frame);
            return frame;
        }

        if entry & HUGE_PAGE != 0 {
            let frame = PhysAddr::new(pmm.get(1, 0));
            let base = entry & ENTRY_ADDR_MASK;
            let flags = entry & !(ENTRY_ADDR_MASK | HUGE_PAGE);
            // Children of a split 1 GiB entry are 2 MiB pages and keep
            // the PS bit; children of a split 2 MiB entry are leaves.
            let child_flags = if child_stride > PAGE_SIZE {
                flags | HUGE_PAGE
            } else {
                flags
            };
            let child = table(mapper, frame);
            for (i, slot) in child.iter_mut().enumerate() {
                *slot = (base + i as u64 * child_stride) | child_flags;
            }
            entries[index] = frame.as_u64() | PageFlags::USER_DEFAULT.bits();
            self.tables.push(frame);
            return frame;
        }

        PhysAddr::new(entry & ENTRY_ADDR_MASK)
    }

    /// Maps `pages` consecutive pages starting at `vaddr` onto `paddr`.
    pub fn map<M: PhysMapper>(
        &mut self,
        mapper: &M,
        pmm: &mut FrameBitmap,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        pages: u64,
        flags: PageFlags,
    ) {
        let active = mapper.active_root() == Some(self.pml4);
        for page in 0..pages {
            let va = VirtAddr::new_truncate(vaddr.as_u64() + page * PAGE_SIZE);
            let pa = paddr.as_u64() + page * PAGE_SIZE;

            let pdpt = self.ensure_table(mapper, pmm, self.pml4, va.table_index(4), 1 << 30);
            let pd = self.ensure_table(mapper, pmm, pdpt, va.table_index(3), 1 << 21);
            let pt = self.ensure_table(mapper, pmm, pd, va.table_index(2), PAGE_SIZE);
            table(mapper, pt)[va.table_index(1)] =
                (pa & ENTRY_ADDR_MASK) | flags.union(PageFlags::PRESENT).bits();

            if active {
                mapper.flush(va);
            }
        }
    }

    /// Unmaps `pages` pages starting at `vaddr`. Idempotent on unmapped
    /// ranges. Intermediate tables are freed as soon as they empty out.
    pub fn unmap<M: PhysMapper>(
        &mut self,
        mapper: &M,
        pmm: &mut FrameBitmap,
        vaddr: VirtAddr,
        pages: u64,
    ) {
        let active = mapper.active_root() == Some(self.pml4);
        for page in 0..pages {
            let va = VirtAddr::new_truncate(vaddr.as_u64() + page * PAGE_SIZE);

            let pml4 = table(mapper, self.pml4);
            if pml4[va.table_index(4)] & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let pdpt_phys = PhysAddr::new(pml4[va.table_index(4)] & ENTRY_ADDR_MASK);
            let pdpt = table(mapper, pdpt_phys);
            if pdpt[va.table_index(3)] & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let pd_phys = PhysAddr::new(pdpt[va.table_index(3)] & ENTRY_ADDR_MASK);
            let pd = table(mapper, pd_phys);
            if pd[va.table_index(2)] & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let pt_phys = PhysAddr::new(pd[va.table_index(2)] & ENTRY_ADDR_MASK);
            let pt = table(mapper, pt_phys);

            pt[va.table_index(1)] = 0;
            if active {
                mapper.flush(va);
            }

            // Free each level as soon as all 512 entries are clear.
            if pt.iter().all(|&e| e == 0) {
                pd[va.table_index(2)] = 0;
                self.release_table(pmm, pt_phys);
                if pd.iter().all(|&e| e == 0) {
                    pdpt[va.table_index(3)] = 0;
                    self.release_table(pmm, pd_phys);
                    if pdpt.iter().all(|&e| e == 0) {
                        pml4[va.table_index(4)] = 0;
                        self.release_table(pmm, pdpt_phys);
                    }
                }
            }
        }
    }

    fn release_table(&mut self, pmm: &mut FrameBitmap, frame: PhysAddr) {
        if let Some(pos) = self.tables.iter().position(|&t| t == frame) {
            self.tables.swap_remove(pos);
            pmm.free(frame.as_u64(), 1);
        }
    }

    /// Returns the physical frame behind `vaddr`, or `None` when any table
    /// along the walk is not present. Large pages resolve to the frame
    /// containing the address.
    pub fn translate<M: PhysMapper>(&self, mapper: &M, vaddr: VirtAddr) -> Option<PhysAddr> {
        let mut current = self.pml4;
        for level in [4u8, 3, 2] {
            let entry = table(mapper, current)[vaddr.table_index(level)];
            if entry & PageFlags::PRESENT.bits() == 0 {
                return None;
            }
            if level < 4 && entry & HUGE_PAGE != 0 {
                let span = 1u64 << (12 + 9 * (level - 1));
                let base = entry & ENTRY_ADDR_MASK;
                return Some(PhysAddr::new(
                    (base + (vaddr.as_u64() & (span - 1))) & !(PAGE_SIZE - 1),
                ));
            }
            current = PhysAddr::new(entry & ENTRY_ADDR_MASK);
        }
        let leaf = table(mapper, current)[vaddr.table_index(1)];
        if leaf & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(PhysAddr::new(leaf & ENTRY_ADDR_MASK))
    }

    /// Copies the higher-half PML4 entries from `kernel`, sharing the
    /// kernel's table tree. Kernel-half mappings are global and never
    /// unmapped, so sharing is safe.
    pub fn adopt_kernel_half<M: PhysMapper>(&mut self, mapper: &M, kernel: &AddressSpace) {
        let src = table(mapper, kernel.pml4);
        let dst = table(mapper, self.pml4);
        dst[256..512].copy_from_slice(&src[256..512]);
    }

    /// Frees every owned table frame and the PML4 block itself.
    ///
    /// Shared kernel-half tables are not in `tables` and stay untouched.
    pub fn destroy(mut self, pmm: &mut FrameBitmap) {
        for frame in self.tables.drain(..) {
            pmm.free(frame.as_u64(), 1);
        }
        pmm.free(self.pml4.as_u64(), ROOT_BLOCK_PAGES);
    }
}

// ---------------------------------------------------------------------------
// Global VMM
// ---------------------------------------------------------------------------

/// The kernel address space plus the globally-shared user-visible mappings.
pub struct Vmm {
    kernel: AddressSpace,
    shared_maps: Vec<MapRecord>,
}

impl Vmm {
    /// Wraps an existing kernel address space.
    pub fn new(kernel: AddressSpace) -> Self {
        Self {
            kernel,
            shared_maps: Vec::new(),
        }
    }

    /// The kernel address space.
    pub fn kernel_space(&mut self) -> &mut AddressSpace {
        &mut self.kernel
    }

    /// CR3 value of the kernel space.
    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel.pml4
    }

    /// Maps into `space`, or into the kernel space when `space` is `None`.
    ///
    /// A kernel-space mapping with `user_visible` set is recorded so every
    /// address space created afterwards mirrors it.
    #[allow(clippy::too_many_arguments)]
    pub fn map<M: PhysMapper>(
        &mut self,
        mapper: &M,
        pmm: &mut FrameBitmap,
        space: Option<&mut AddressSpace>,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        pages: u64,
        flags: PageFlags,
        user_visible: bool,
    ) {
        match space {
            Some(s) => s.map(mapper, pmm, vaddr, paddr, pages, flags),
            None => {
                self.kernel.map(mapper, pmm, vaddr, paddr, pages, flags);
                if user_visible {
                    self.shared_maps.push(MapRecord {
                        vaddr: vaddr.as_u64(),
                        paddr: paddr.as_u64(),
                        pages,
                        flags,
                    });
                }
            }
        }
    }

    /// Unmaps from `space`, or from the kernel space when `None`.
    pub fn unmap<M: PhysMapper>(
        &mut self,
        mapper: &M,
        pmm: &mut FrameBitmap,
        space: Option<&mut AddressSpace>,
        vaddr: VirtAddr,
        pages: u64,
        user_visible: bool,
    ) {
        match space {
            Some(s) => s.unmap(mapper, pmm, vaddr, pages),
            None => {
                self.kernel.unmap(mapper, pmm, vaddr, pages);
                if user_visible {
                    self.shared_maps
                        .retain(|r| r.vaddr != vaddr.as_u64() || r.pages != pages);
                }
            }
        }
    }

    /// Translates through `space`, or the kernel space when `None`.
    pub fn translate<M: PhysMapper>(
        &self,
        mapper: &M,
        space: Option<&AddressSpace>,
        vaddr: VirtAddr,
    ) -> Option<PhysAddr> {
        space.unwrap_or(&self.kernel).translate(mapper, vaddr)
    }

    /// Creates a task address space: fresh PML4 block, shared kernel half,
    /// and a replay of every user-visible global mapping.
    pub fn create_address_space<M: PhysMapper>(
        &mut self,
        mapper: &M,
        pmm: &mut FrameBitmap,
    ) -> AddressSpace {
        let mut space = AddressSpace::new(mapper, pmm);
        space.adopt_kernel_half(mapper, &self.kernel);
        for record in self.shared_maps.clone() {
            space.map(
                mapper,
                pmm,
                VirtAddr::new_truncate(record.vaddr),
                PhysAddr::new(record.paddr),
                record.pages,
                record.flags,
            );
        }
        space
    }
}

// ---------------------------------------------------------------------------
// Kernel glue
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod kernel_glue {
    use muon_core::addr::{PhysAddr, VirtAddr};
    use muon_core::sync::SpinLock;

    use super::{AddressSpace, PhysMapper, Vmm};

    /// [`PhysMapper`] over the higher-half direct map.
    pub struct HhdmMapper;

    impl PhysMapper for HhdmMapper {
        fn frame_ptr(&self, phys: PhysAddr) -> *mut u8 {
            crate::mm::hhdm::phys_to_virt(phys).as_mut_ptr()
        }

        fn active_root(&self) -> Option<PhysAddr> {
            Some(crate::arch::x86_64::instructions::read_cr3())
        }

        fn flush(&self, vaddr: VirtAddr) {
            crate::arch::x86_64::instructions::invlpg(vaddr);
        }
    }

    static VMM: SpinLock<Option<Vmm>> = SpinLock::new(None);

    /// Builds the kernel address space around the bootloader-provided root
    /// and stores it globally.
    pub fn init(boot_root: PhysAddr) {
        let kernel = AddressSpace {
            pml4: boot_root,
            tables: alloc::vec::Vec::new(),
        };
        let mut vmm = VMM.lock();
        assert!(vmm.is_none(), "VMM already initialized");
        *vmm = Some(Vmm::new(kernel));
    }

    /// Runs `f` with the global VMM.
    ///
    /// # Panics
    ///
    /// Panics if the VMM has not been initialized.
    pub fn with_vmm<R>(f: impl FnOnce(&mut Vmm) -> R) -> R {
        let mut vmm = VMM.lock();
        f(vmm.as_mut().expect("VMM not initialized"))
    }
}

#[cfg(target_os = "none")]
pub use kernel_glue::{HhdmMapper, init, with_vmm};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{MemoryRegion, MemoryRegionKind};

    const MIB: u64 = 0x10_0000;
    const ARENA_SIZE: u64 = 8 * MIB;

    /// Host-side physical memory: one arena indexed by physical address.
    struct Arena {
        base: *mut u8,
    }

    impl PhysMapper for Arena {
        fn frame_ptr(&self, phys: PhysAddr) -> *mut u8 {
            assert!(phys.as_u64() < ARENA_SIZE, "arena overflow: {phys}");
            // SAFETY: Bounds-checked against the arena size.
            unsafe { self.base.add(phys.as_u64() as usize) }
        }
    }

    fn setup() -> (Arena, FrameBitmap) {
        let arena = Arena {
            base: Box::leak(vec![0u8; ARENA_SIZE as usize].into_boxed_slice()).as_mut_ptr(),
        };
        let map = [MemoryRegion {
            base: 0,
            length: ARENA_SIZE,
            kind: MemoryRegionKind::Usable,
        }];
        let bitmap_storage = Box::leak(vec![0u8; (ARENA_SIZE / 32768) as usize].into_boxed_slice());
        let pmm = unsafe { FrameBitmap::init(&map, |_b, _l| bitmap_storage).unwrap() };
        (arena, pmm)
    }

    #[test]
    fn map_then_translate() {
        let (arena, mut pmm) = setup();
        let mut space = AddressSpace::new(&arena, &mut pmm);
        let va = VirtAddr::new(0x40_0000);
        let pa = PhysAddr::new(0x20_0000);
        space.map(&arena, &mut pmm, va, pa, 1, PageFlags::USER_DEFAULT);
        assert_eq!(space.translate(&arena, va), Some(pa));
        // Neighbouring page is not mapped.
        assert_eq!(space.translate(&arena, VirtAddr::new(0x40_1000)), None);
    }

    #[test]
    fn unmap_clears_translation() {
        let (arena, mut pmm) = setup();
        let mut space = AddressSpace::new(&arena, &mut pmm);
        let va = VirtAddr::new(0x40_0000);
        space.map(
            &arena,
            &mut pmm,
            va,
            PhysAddr::new(0x20_0000),
            4,
            PageFlags::DEFAULT,
        );
        space.unmap(&arena, &mut pmm, va, 4);
        assert_eq!(space.translate(&arena, va), None);
        // Unmap is idempotent on unmapped addresses.
        space.unmap(&arena, &mut pmm, va, 4);
    }

    #[test]
    fn empty_tables_are_released() {
        let (arena, mut pmm) = setup();
        let mut space = AddressSpace::new(&arena, &mut pmm);
        let before = pmm.free_size();
        space.map(
            &arena,
            &mut pmm,
            VirtAddr::new(0x40_0000),
            PhysAddr::new(0x20_0000),
            1,
            PageFlags::DEFAULT,
        );
        // Three intermediate tables were allocated.
        assert_eq!(pmm.free_size(), before - 3 * PAGE_SIZE);
        space.unmap(&arena, &mut pmm, VirtAddr::new(0x40_0000), 1);
        // All of them empty out and come back.
        assert_eq!(pmm.free_size(), before);
        assert!(space.tables.is_empty());
    }

    #[test]
    fn sibling_mapping_keeps_tables_alive() {
        let (arena, mut pmm) = setup();
        let mut space = AddressSpace::new(&arena, &mut pmm);
        space.map(
            &arena,
            &mut pmm,
            VirtAddr::new(0x40_0000),
            PhysAddr::new(0x20_0000),
            1,
            PageFlags::DEFAULT,
        );
        space.map(
            &arena,
            &mut pmm,
            VirtAddr::new(0x40_1000),
            PhysAddr::new(0x20_1000),
            1,
            PageFlags::DEFAULT,
        );
        space.unmap(&arena, &mut pmm, VirtAddr::new(0x40_0000), 1);
        // The sibling still translates; its tables survived.
        assert_eq!(
            space.translate(&arena, VirtAddr::new(0x40_1000)),
            Some(PhysAddr::new(0x20_1000))
        );
    }

    #[test]
    fn huge_mappings_split_on_demand() {
        let (arena, mut pmm) = setup();
        let mut space = AddressSpace::new(&arena, &mut pmm);
        let anchor = VirtAddr::new(0x4000_0000);
        space.map(
            &arena,
            &mut pmm,
            anchor,
            PhysAddr::new(0x20_0000),
            1,
            PageFlags::DEFAULT,
        );

        // Plant a 2 MiB large-page entry the way a bootloader would.
        let pml4 = table(&arena, space.pml4);
        let pdpt = PhysAddr::new(pml4[anchor.table_index(4)] & ENTRY_ADDR_MASK);
        let pd = PhysAddr::new(table(&arena, pdpt)[anchor.table_index(3)] & ENTRY_ADDR_MASK);
        table(&arena, pd)[1] =
            0x40_0000 | PageFlags::DEFAULT.bits() | HUGE_PAGE;

        // Translation resolves through the large page.
        let inside = VirtAddr::new(0x4020_3000);
        assert_eq!(
            space.translate(&arena, inside),
            Some(PhysAddr::new(0x40_3000))
        );

        // Punching a 4 KiB mapping into the range splits it.
        space.map(
            &arena,
            &mut pmm,
            inside,
            PhysAddr::new(0x30_0000),
            1,
            PageFlags::DEFAULT,
        );
        assert_eq!(
            space.translate(&arena, inside),
            Some(PhysAddr::new(0x30_0000))
        );
        // Neighbours keep their pre-split translation.
        assert_eq!(
            space.translate(&arena, VirtAddr::new(0x4020_4000)),
            Some(PhysAddr::new(0x40_4000))
        );
    }

    #[test]
    fn root_block_is_32k_aligned() {
        let (arena, mut pmm) = setup();
        let space = AddressSpace::new(&arena, &mut pmm);
        assert!(space.root().is_aligned(8 * PAGE_SIZE));
    }

    #[test]
    fn new_spaces_mirror_shared_mappings() {
        let (arena, mut pmm) = setup();
        let kernel = AddressSpace::new(&arena, &mut pmm);
        let mut vmm = Vmm::new(kernel);

        let va = VirtAddr::new(0x50_0000);
        let pa = PhysAddr::new(0x30_0000);
        vmm.map(
            &arena,
            &mut pmm,
            None,
            va,
            pa,
            2,
            PageFlags::USER_DEFAULT,
            true,
        );

        let space = vmm.create_address_space(&arena, &mut pmm);
        assert_eq!(space.translate(&arena, va), Some(pa));
        assert_eq!(
            space.translate(&arena, VirtAddr::new(0x50_1000)),
            Some(PhysAddr::new(0x30_1000))
        );
    }

    #[test]
    fn kernel_half_is_shared() {
        let (arena, mut pmm) = setup();
        let mut kernel = AddressSpace::new(&arena, &mut pmm);
        let kva = VirtAddr::new_truncate(0xFFFF_8000_0010_0000);
        kernel.map(
            &arena,
            &mut pmm,
            kva,
            PhysAddr::new(0x10_0000),
            1,
            PageFlags::DEFAULT,
        );
        let mut vmm = Vmm::new(kernel);
        let space = vmm.create_address_space(&arena, &mut pmm);
        assert_eq!(
            space.translate(&arena, kva),
            Some(PhysAddr::new(0x10_0000))
        );
    }

    #[test]
    fn destroy_returns_all_frames() {
        let (arena, mut pmm) = setup();
        let before = pmm.free_size();
        let mut space = AddressSpace::new(&arena, &mut pmm);
        space.map(
            &arena,
            &mut pmm,
            VirtAddr::new(0x40_0000),
            PhysAddr::new(0x20_0000),
            8,
            PageFlags::USER_DEFAULT,
        );
        space.destroy(&mut pmm);
        assert_eq!(pmm.free_size(), before);
    }
}
