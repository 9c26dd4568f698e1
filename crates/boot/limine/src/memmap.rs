//! Memory map entry types.

/// The type of a memory map entry, as reported by the bootloader.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemMapEntryType {
    /// Usable RAM.
    Usable = 0,
    /// Reserved by firmware or hardware.
    Reserved = 1,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable = 2,
    /// ACPI NVS memory, never usable.
    AcpiNvs = 3,
    /// Defective memory.
    BadMemory = 4,
    /// Bootloader memory, reclaimable after boot.
    BootloaderReclaimable = 5,
    /// The kernel image and loaded modules.
    KernelAndModules = 6,
    /// Framebuffer memory.
    Framebuffer = 7,
}

/// A single memory map entry.
#[repr(C)]
pub struct MemMapEntry {
    /// Physical start address of the region.
    pub base: u64,
    /// Region length in bytes.
    pub length: u64,
    /// Region type.
    pub entry_type: MemMapEntryType,
}
