//! Limine boot stub.
//!
//! Declares the protocol requests, converts the responses into the
//! kernel's [`BootInfo`] and enters [`muon_kernel::kernel_init`]. All
//! policy lives in the kernel; this stub only translates.

#![no_std]
#![no_main]

mod requests;

use muon_kernel::boot::{BootInfo, FramebufferInfo, MAX_MEMORY_REGIONS};
use muon_kernel::mm::{MemoryRegion, MemoryRegionKind};
use muon_limine::MemMapEntryType;
use planck_noalloc::vec::ArrayVec;

use requests::REQUESTS;

fn region_kind(entry_type: MemMapEntryType) -> MemoryRegionKind {
    match entry_type {
        MemMapEntryType::Usable => MemoryRegionKind::Usable,
        MemMapEntryType::Reserved => MemoryRegionKind::Reserved,
        MemMapEntryType::AcpiReclaimable => MemoryRegionKind::AcpiReclaimable,
        MemMapEntryType::AcpiNvs => MemoryRegionKind::AcpiNvs,
        MemMapEntryType::BadMemory => MemoryRegionKind::BadMemory,
        MemMapEntryType::BootloaderReclaimable => MemoryRegionKind::BootloaderReclaimable,
        MemMapEntryType::KernelAndModules => MemoryRegionKind::KernelAndModules,
        MemMapEntryType::Framebuffer => MemoryRegionKind::Framebuffer,
    }
}

/// Limine jumps here with the responses filled in.
#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    assert!(REQUESTS.base_revision.is_supported());

    let hhdm = REQUESTS.hhdm.response().expect("no HHDM response");
    let memmap = REQUESTS.memmap.response().expect("no memory map response");
    let kernel_address = REQUESTS
        .kernel_address
        .response()
        .expect("no kernel address response");

    let mut memory_map: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS> = ArrayVec::new();
    for entry in memmap.entries() {
        if memory_map.len() == MAX_MEMORY_REGIONS {
            break;
        }
        memory_map.push(MemoryRegion {
            base: entry.base,
            length: entry.length,
            kind: region_kind(entry.entry_type),
        });
    }

    // The first module is the root USTAR image. Limine reports its HHDM
    // address; the kernel wants the physical one.
    let initrd = REQUESTS.modules.response().and_then(|modules| {
        modules
            .modules()
            .next()
            .map(|file| (file.address - hhdm.offset, file.size))
    });

    let framebuffer = REQUESTS.framebuffer.response().and_then(|fbs| {
        fbs.framebuffers().next().map(|fb| FramebufferInfo {
            address: fb.address,
            width: fb.width as u32,
            height: fb.height as u32,
            pitch: fb.pitch as u32,
            bpp: fb.bpp,
        })
    });

    let boot_info = BootInfo {
        memory_map,
        hhdm_offset: hhdm.offset,
        kernel_phys_base: kernel_address.physical_base,
        kernel_virt_base: kernel_address.virtual_base,
        page_table_root: read_cr3_raw(),
        rsdp_address: REQUESTS.rsdp.response().map(|r| {
            // Revision 3+ loaders report a physical address; older ones
            // report an HHDM pointer.
            if r.address >= hhdm.offset {
                r.address - hhdm.offset
            } else {
                r.address
            }
        }),
        initrd,
        framebuffer,
    };

    muon_kernel::kernel_init(&boot_info)
}

fn read_cr3_raw() -> u64 {
    let value: u64;
    // SAFETY: CR3 reads are side-effect free at CPL 0.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value & 0x000F_FFFF_FFFF_F000
}
