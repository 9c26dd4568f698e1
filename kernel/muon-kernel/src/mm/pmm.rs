//! Bitmap physical frame allocator.
//!
//! One bit per 4 KiB frame over `[0, phys_limit)`; bit set means the frame
//! is free. The bitmap itself lives inside the first large-enough USABLE
//! region and its own frames are marked used. Allocation is all-or-nothing
//! over a contiguous run; [`FrameBitmap::get`] does a first-fit scan upward
//! from a base hint.
//!
//! The allocator has no interior lock: callers reach it through the global
//! [`SpinLock`] (or, at boot, from the BSP before the APs are started).

use muon_core::sync::SpinLock;

use super::{MemoryRegion, MemoryRegionKind, PAGE_SIZE, num_pages};

/// Frames tracked per bitmap byte.
const FRAMES_PER_BYTE: u64 = 8;

/// Low memory is never handed out; the trampoline and BIOS structures live
/// there.
const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

/// Physical memory exhaustion during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No USABLE region is large enough to hold the bitmap.
    NoBitmapRegion,
    /// The memory map contains no usable memory at all.
    OutOfMemory,
}

/// The frame bitmap and its accounting.
pub struct FrameBitmap {
    bitmap: &'static mut [u8],
    phys_limit: u64,
    total_size: u64,
    free_size: u64,
}

impl FrameBitmap {
    /// Builds the allocator from the boot memory map.
    ///
    /// `phys_to_slice` hands back writable storage for the chosen bitmap
    /// placement (the kernel passes an HHDM translation; tests pass a
    /// buffer).
    ///
    /// # Errors
    ///
    /// [`PmmError::NoBitmapRegion`] when no USABLE entry above 1 MiB can
    /// hold the bitmap.
    ///
    /// # Safety
    ///
    /// `memmap` must describe physical memory truthfully and
    /// `phys_to_slice` must return exclusive storage of the requested size.
    pub unsafe fn init(
        memmap: &[MemoryRegion],
        phys_to_slice: impl FnOnce(u64, usize) -> &'static mut [u8],
    ) -> Result<Self, PmmError> {
        let mut phys_limit = 0u64;
        let mut total_size = 0u64;
        for entry in memmap {
            if matches!(
                entry.kind,
                MemoryRegionKind::Usable
                    | MemoryRegionKind::BootloaderReclaimable
                    | MemoryRegionKind::AcpiReclaimable
                    | MemoryRegionKind::KernelAndModules
            ) {
                total_size += entry.length;
            }
            phys_limit = phys_limit.max(entry.base + entry.length);
        }
        if total_size == 0 {
            return Err(PmmError::OutOfMemory);
        }

        let bitmap_bytes = (phys_limit / (PAGE_SIZE * FRAMES_PER_BYTE)) as usize;
        let bitmap_base = memmap
            .iter()
            .filter(|e| e.kind == MemoryRegionKind::Usable)
            .filter_map(|e| {
                let start = e.base.max(LOW_MEMORY_LIMIT);
                let end = e.base + e.length;
                (end > start && end - start >= bitmap_bytes as u64).then_some(start)
            })
            .next()
            .ok_or(PmmError::NoBitmapRegion)?;

        let bitmap = phys_to_slice(bitmap_base, bitmap_bytes);
        bitmap.fill(0);

        let mut this = Self {
            bitmap,
            phys_limit,
            total_size,
            free_size: 0,
        };

        for entry in memmap {
            let end = entry.base + entry.length;
            if entry.kind != MemoryRegionKind::Usable || end <= LOW_MEMORY_LIMIT {
                continue;
            }
            let start = entry.base.max(LOW_MEMORY_LIMIT);
            this.free(start, num_pages(end - start));
        }

        // The bitmap's own frames are in a USABLE region and were just
        // marked free; claim them.
        assert!(this.alloc(bitmap_base, num_pages(bitmap_bytes as u64)));

        Ok(this)
    }

    fn is_free(&self, addr: u64, pages: u64) -> bool {
        for frame in 0..pages {
            let idx = ((addr + frame * PAGE_SIZE) / PAGE_SIZE) as usize;
            if self.bitmap[idx / 8] & (1 << (idx % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Claims `pages` frames starting at `addr` iff all of them are free.
    pub fn alloc(&mut self, addr: u64, pages: u64) -> bool {
        if !self.is_free(addr, pages) {
            return false;
        }
        for frame in 0..pages {
            let idx = ((addr + frame * PAGE_SIZE) / PAGE_SIZE) as usize;
            self.bitmap[idx / 8] &= !(1 << (idx % 8));
        }
        self.free_size -= pages * PAGE_SIZE;
        true
    }

    /// First-fit scan upward from `base_hint` in page steps.
    ///
    /// # Panics
    ///
    /// Frame exhaustion is fatal: reaching `phys_limit` without a fit
    /// panics the kernel.
    pub fn get(&mut self, pages: u64, base_hint: u64) -> u64 {
        let mut addr = base_hint;
        while addr + pages * PAGE_SIZE <= self.phys_limit {
            if self.alloc(addr, pages) {
                return addr;
            }
            addr += PAGE_SIZE;
        }
        panic!("PMM: out of physical memory ({pages} pages)");
    }

    /// First-fit scan like [`FrameBitmap::get`], but only considering
    /// starts aligned to `align_pages` pages.
    ///
    /// # Panics
    ///
    /// Panics on exhaustion, like [`FrameBitmap::get`].
    pub fn get_aligned(&mut self, pages: u64, align_pages: u64, base_hint: u64) -> u64 {
        let step = align_pages * PAGE_SIZE;
        let mut addr = base_hint.next_multiple_of(step);
        while addr + pages * PAGE_SIZE <= self.phys_limit {
            if self.alloc(addr, pages) {
                return addr;
            }
            addr += step;
        }
        panic!("PMM: out of physical memory ({pages} pages, {align_pages}-page aligned)");
    }

    /// Releases frames; only frames that were actually used count toward
    /// the freed size, so the call is idempotent.
    pub fn free(&mut self, addr: u64, pages: u64) {
        for frame in 0..pages {
            let idx = ((addr + frame * PAGE_SIZE) / PAGE_SIZE) as usize;
            if self.bitmap[idx / 8] & (1 << (idx % 8)) == 0 {
                self.free_size += PAGE_SIZE;
            }
            self.bitmap[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Bytes of free physical memory.
    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    /// Bytes counted toward the boot memory total.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Highest tracked physical address.
    pub fn phys_limit(&self) -> u64 {
        self.phys_limit
    }
}

// ---------------------------------------------------------------------------
// Global allocator instance
// ---------------------------------------------------------------------------

/// Global physical memory manager.
static PMM: SpinLock<Option<FrameBitmap>> = SpinLock::new(None);

/// Initializes the global PMM from the boot memory map.
///
/// The bitmap storage is reached through the HHDM.
#[cfg(target_os = "none")]
pub fn init(memmap: &[MemoryRegion]) {
    // SAFETY: The boot memory map is authoritative, and the chosen bitmap
    // region is USABLE memory nobody else has claimed yet.
    let allocator = unsafe {
        FrameBitmap::init(memmap, |base, len| {
            core::slice::from_raw_parts_mut(
                super::hhdm::phys_to_virt(muon_core::addr::PhysAddr::new(base)).as_mut_ptr(),
                len,
            )
        })
    }
    .expect("PMM: no region for the frame bitmap");

    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(allocator);
}

/// Runs `f` with the global PMM.
///
/// # Panics
///
/// Panics if the PMM has not been initialized.
pub fn with_pmm<R>(f: impl FnOnce(&mut FrameBitmap) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 0x10_0000;

    fn leaked(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    fn simple_map() -> Vec<MemoryRegion> {
        vec![
            MemoryRegion {
                base: 0,
                length: MIB,
                kind: MemoryRegionKind::Usable,
            },
            MemoryRegion {
                base: MIB,
                length: 128 * MIB,
                kind: MemoryRegionKind::Usable,
            },
        ]
    }

    fn build(map: &[MemoryRegion]) -> FrameBitmap {
        unsafe { FrameBitmap::init(map, |_base, len| leaked(len)).unwrap() }
    }

    #[test]
    fn init_accounts_totals() {
        let pmm = build(&simple_map());
        assert_eq!(pmm.phys_limit(), 129 * MIB);
        assert_eq!(pmm.total_size(), 129 * MIB);
        // Everything above 1 MiB is free except the bitmap's own frames.
        let bitmap_bytes = (129 * MIB) / (PAGE_SIZE * 8);
        assert_eq!(
            pmm.free_size(),
            128 * MIB - num_pages(bitmap_bytes) * PAGE_SIZE
        );
    }

    #[test]
    fn alloc_free_roundtrip_is_identity() {
        let mut pmm = build(&simple_map());
        let before = pmm.free_size();
        let addr = pmm.get(4, 0);
        assert_eq!(pmm.free_size(), before - 4 * PAGE_SIZE);
        pmm.free(addr, 4);
        assert_eq!(pmm.free_size(), before);
        // free + used = total over the tracked range is preserved.
        assert!(pmm.free_size() <= pmm.total_size());
    }

    #[test]
    fn get_is_first_fit_from_hint() {
        let mut pmm = build(&simple_map());
        let a = pmm.get(1, 2 * MIB);
        assert_eq!(a, 2 * MIB);
        let b = pmm.get(1, 2 * MIB);
        assert_eq!(b, 2 * MIB + PAGE_SIZE);
        pmm.free(a, 1);
        assert_eq!(pmm.get(1, 2 * MIB), a);
    }

    #[test]
    fn alloc_rejects_partial_overlap() {
        let mut pmm = build(&simple_map());
        let addr = pmm.get(2, 0);
        assert!(!pmm.alloc(addr + PAGE_SIZE, 2));
        // An adjacent fully-free run still works.
        assert!(pmm.alloc(addr + 2 * PAGE_SIZE, 2));
    }

    #[test]
    fn double_free_does_not_inflate_accounting() {
        let mut pmm = build(&simple_map());
        let before = pmm.free_size();
        let addr = pmm.get(2, 0);
        pmm.free(addr, 2);
        pmm.free(addr, 2);
        assert_eq!(pmm.free_size(), before);
    }

    #[test]
    fn low_memory_never_handed_out() {
        let mut pmm = build(&simple_map());
        assert!(pmm.get(1, 0) >= MIB);
    }

    #[test]
    fn reserved_regions_stay_used() {
        let map = vec![
            MemoryRegion {
                base: 0,
                length: 2 * MIB,
                kind: MemoryRegionKind::Usable,
            },
            MemoryRegion {
                base: 2 * MIB,
                length: MIB,
                kind: MemoryRegionKind::Reserved,
            },
            MemoryRegion {
                base: 3 * MIB,
                length: MIB,
                kind: MemoryRegionKind::Usable,
            },
        ];
        let mut pmm = build(&map);
        assert!(!pmm.alloc(2 * MIB, 1));
        // Reserved space is not part of the boot total.
        assert_eq!(pmm.total_size(), 3 * MIB);
        // A 256-page run cannot straddle the reserved hole; the scan lands
        // on the region beyond it.
        let got = pmm.get(256, MIB);
        assert_eq!(got, 3 * MIB);
    }

    #[test]
    fn aligned_get_respects_alignment() {
        let mut pmm = build(&simple_map());
        // Disturb the natural alignment with a single-page allocation.
        let _ = pmm.get(1, 0);
        let addr = pmm.get_aligned(8, 8, 0);
        assert_eq!(addr % (8 * PAGE_SIZE), 0);
        assert!(pmm.get_aligned(8, 8, addr) > addr);
    }

    #[test]
    #[should_panic(expected = "out of physical memory")]
    fn exhaustion_panics() {
        let map = vec![MemoryRegion {
            base: 0,
            length: 2 * MIB,
            kind: MemoryRegionKind::Usable,
        }];
        let mut pmm = build(&map);
        pmm.get(1024, 0); // 4 MiB from a 1 MiB-free map
    }
}
