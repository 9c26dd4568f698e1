//! Boot information and the kernel init sequence.
//!
//! The boot stub converts the bootloader's native structures into
//! [`BootInfo`] before any kernel state exists, then calls
//! [`kernel_init`], which runs the bring-up in dependency order: memory,
//! descriptor tables, interrupt controllers, time, SMP, filesystems, and
//! finally the first user task.

extern crate alloc;

use alloc::format;
use alloc::sync::Arc;

use muon_core::addr::PhysAddr;
use muon_core::kinfo;
use planck_noalloc::vec::ArrayVec;

use crate::mm::MemoryRegion;

/// Maximum memory map entries captured from the bootloader.
pub const MAX_MEMORY_REGIONS: usize = 128;

/// A linear framebuffer handed over by the bootloader, forwarded to the
/// external terminal driver.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual (HHDM) address of the pixel memory.
    pub address: u64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u16,
}

/// Everything the kernel needs from the bootloader, in kernel-owned types.
pub struct BootInfo {
    /// Physical memory map.
    pub memory_map: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    /// HHDM offset: virtual = physical + offset.
    pub hhdm_offset: u64,
    /// Physical base the kernel was loaded at.
    pub kernel_phys_base: u64,
    /// Virtual base the kernel runs at.
    pub kernel_virt_base: u64,
    /// Physical address of the active PML4.
    pub page_table_root: u64,
    /// ACPI RSDP physical address.
    pub rsdp_address: Option<u64>,
    /// Root USTAR image loaded as a module: physical address and length.
    pub initrd: Option<(u64, u64)>,
    /// First framebuffer, if any.
    pub framebuffer: Option<FramebufferInfo>,
}

/// Early BSS stack backing RSP0/syscalls until the first context switch.
#[repr(align(16))]
struct EarlyStack([u8; 16 * 1024]);

static mut EARLY_STACK: EarlyStack = EarlyStack([0; 16 * 1024]);

fn early_stack_top() -> u64 {
    core::ptr::addr_of!(EARLY_STACK) as u64 + core::mem::size_of::<EarlyStack>() as u64
}

/// ACPI physical access through the HHDM.
struct HhdmAcpi;

impl muon_acpi::AcpiHandler for HhdmAcpi {
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8] {
        let virt = crate::mm::hhdm::phys_to_virt(PhysAddr::new(phys));
        // SAFETY: ACPI tables live in reclaimable firmware memory covered
        // by the HHDM and are never reclaimed by this kernel.
        unsafe { core::slice::from_raw_parts(virt.as_ptr(), size) }
    }
}

/// Kernel entry point, called by the boot stub. Never returns: once the
/// scheduler gate opens, the first timer tick abandons this context.
pub fn kernel_init(boot: &BootInfo) -> ! {
    crate::log::init_early_serial();
    kinfo!("muon: booting");

    // Memory.
    crate::mm::hhdm::init(boot.hhdm_offset);
    crate::mm::pmm::init(boot.memory_map.as_slice());
    crate::mm::pmm::with_pmm(|pmm| {
        kinfo!(
            "PMM: {} MiB free / {} MiB total, limit {:#x}",
            pmm.free_size() >> 20,
            pmm.total_size() >> 20,
            pmm.phys_limit()
        );
    });
    crate::mm::vmm::init(PhysAddr::new(boot.page_table_root));
    crate::mm::heap::init();
    crate::log::init_logger();
    kinfo!(
        "muon: kernel at {:#x} (phys {:#x})",
        boot.kernel_virt_base,
        boot.kernel_phys_base
    );

    // Descriptor tables, interrupt plumbing, syscall MSRs (BSP).
    let tables = crate::arch::x86_64::gdt::install_for_cpu(early_stack_top());
    // SAFETY: Single-threaded BSP init with interrupts disabled; GDT was
    // just installed.
    unsafe {
        crate::arch::x86_64::idt::init();
        crate::percpu::init_cpu(0, 0, true, &raw mut tables.tss, early_stack_top());
    }
    crate::arch::x86_64::pic::init();
    crate::arch::x86_64::syscall::init();

    // ACPI: MADT for the APIC topology, HPET for the time source.
    let rsdp_addr = boot.rsdp_address.expect("no RSDP from the bootloader");
    let acpi = HhdmAcpi;
    let rsdp = muon_acpi::Rsdp::parse(&acpi, rsdp_addr).expect("bad RSDP");
    let madt_addr = muon_acpi::rsdt::find_table(
        &acpi,
        rsdp.sdt_address,
        rsdp.is_xsdt,
        muon_acpi::madt::MADT_SIGNATURE,
    )
    .expect("no MADT");
    let madt = muon_acpi::Madt::parse(&acpi, madt_addr).expect("bad MADT");

    match muon_acpi::rsdt::find_table(
        &acpi,
        rsdp.sdt_address,
        rsdp.is_xsdt,
        muon_acpi::hpet::HPET_SIGNATURE,
    ) {
        Ok(addr) => {
            let table = muon_acpi::HpetTable::parse(&acpi, addr).expect("bad HPET table");
            crate::arch::x86_64::hpet::init(PhysAddr::new(table.base_address));
        }
        Err(_) => kinfo!("HPET absent, PIT fallback in use"),
    }

    crate::arch::x86_64::apic::init(PhysAddr::new(u64::from(madt.local_apic_address)));
    crate::arch::x86_64::apic::calibrate_timer();
    crate::sched::init_timer();

    // Application processors.
    crate::arch::x86_64::smp::init(&madt);

    // Filesystems.
    crate::fs::vfs::init();
    crate::fs::vfs::with_vfs(|vfs| {
        vfs.register_fs(Arc::new(crate::fs::ramfs::RamFs::new()));
        vfs.register_fs(Arc::new(crate::fs::fat32::Fat32Fs::new()));
        vfs.register_fs(Arc::new(crate::fs::ttyfs::TtyFs::new()));
        vfs.register_fs(Arc::new(crate::fs::pipefs::PipeFs::new()));
        vfs.mount(None, "/", "ramfs").expect("cannot mount ramfs root");
    });

    if let Some((phys, len)) = boot.initrd {
        // SAFETY: The module was loaded into KernelAndModules memory the
        // PMM never reuses, reachable through the HHDM.
        let image = unsafe {
            core::slice::from_raw_parts(
                crate::mm::hhdm::phys_to_virt(PhysAddr::new(phys)).as_ptr::<u8>(),
                len as usize,
            )
        };
        let count = crate::fs::vfs::with_vfs(|vfs| crate::fs::ramfs::populate(vfs, image))
            .expect("bad root archive");
        kinfo!("ramfs: {} entries from the boot archive", count);
    }

    crate::fs::vfs::with_vfs(|vfs| {
        use crate::fs::NodeType;
        use crate::fs::vfs::LookupFlags;
        // The archive may already carry these directories.
        for dir in ["/disk", "/dev", "/dev/tty"] {
            vfs.path_to_node(dir, LookupFlags::CREATE, NodeType::Folder)
                .unwrap_or_else(|e| panic!("mkdir {dir}: {e:?}"));
        }
        vfs.mount(None, "/dev/tty", "ttyfs").expect("cannot mount ttyfs");

        let tty_node = vfs
            .path_to_node("/dev/tty", crate::fs::vfs::LookupFlags::empty(), NodeType::Invalid)
            .expect("tty node vanished");
        let ident = vfs.node_ident(tty_node).expect("tty without state");
        crate::proc::set_system_tty(Arc::new(crate::fs::ttyfs::TtyFs::new()), ident);
    });

    // Disk-backed mounts for every device the drivers announced.
    for (index, (name, dev)) in crate::fs::take_block_devices().into_iter().enumerate() {
        crate::fs::vfs::with_vfs(|vfs| {
            use crate::fs::NodeType;
            let dev_path = format!("/dev/{name}");
            let node = vfs.create(&dev_path, NodeType::BlockDev)?;
            vfs.set_node_ident(node, Arc::new(crate::fs::BlockDeviceIdent(dev)));
            let mount_path = format!("/disk/{index}");
            vfs.create(&mount_path, NodeType::Folder)?;
            vfs.mount(Some(&dev_path), &mount_path, "fat32")
        })
        .map(|()| kinfo!("fat32: {} mounted under /disk/{}", name, index))
        .unwrap_or_else(|e| kinfo!("fat32: {} not mounted ({:?})", name, e));
    }

    // First user task, then open the scheduler gate on the BSP.
    crate::proc::spawn_init();
    crate::sched::init_cpu();

    // SAFETY: IDT, APIC, per-CPU state and the scheduler are all live.
    unsafe { crate::arch::x86_64::instructions::sti() };
    kinfo!("muon: boot complete, waiting for the first tick");
    loop {
        crate::arch::x86_64::instructions::hlt();
    }
}
