//! ACPI table parsing for the muon kernel.
//!
//! Covers exactly the tables the kernel consumes: RSDP (RSDT/XSDT
//! selection), the RSDT/XSDT themselves, MADT (LAPIC and I/O APIC records)
//! and HPET. Physical memory access goes through the [`AcpiHandler`] trait,
//! so the parsers run unmodified in host tests over fabricated table images.
//!
//! Fields are extracted manually with `from_le_bytes`; the tables are small
//! and the handful of offsets reads clearer than a layout DSL.

#![cfg_attr(not(test), no_std)]

pub mod hpet;
pub mod madt;
pub mod rsdp;
pub mod rsdt;
pub mod sdt;

pub use hpet::HpetTable;
pub use madt::{Madt, MadtEntry};
pub use rsdp::Rsdp;
pub use sdt::SdtHeader;

/// Failure while parsing an ACPI structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// Signature bytes did not match.
    InvalidSignature,
    /// Byte checksum over the structure is non-zero.
    InvalidChecksum,
    /// The structure is shorter than its own length field claims.
    TruncatedData,
    /// The requested table does not exist.
    TableNotFound,
}

/// Maps physical table memory for the parsers.
///
/// The kernel implements this over the HHDM; host tests implement it over a
/// byte buffer standing in for physical memory.
pub trait AcpiHandler {
    /// Returns `size` bytes of physical memory starting at `phys`.
    ///
    /// # Safety
    ///
    /// `phys..phys+size` must be readable memory that outlives the returned
    /// slice (table memory is never reclaimed while the kernel runs).
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8];
}

pub(crate) fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(off..off + 2)?.try_into().ok()?))
}

pub(crate) fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(off..off + 4)?.try_into().ok()?))
}

pub(crate) fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(off..off + 8)?.try_into().ok()?))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::AcpiHandler;

    /// Host-side "physical memory": a leaked byte image addressed from 0.
    pub struct FakePhys {
        pub image: &'static [u8],
    }

    impl FakePhys {
        pub fn new(image: Vec<u8>) -> Self {
            Self {
                image: Box::leak(image.into_boxed_slice()),
            }
        }
    }

    impl AcpiHandler for FakePhys {
        unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8] {
            &self.image[phys as usize..phys as usize + size]
        }
    }

    /// Fills in the SDT length and checksum over `table`.
    pub fn seal_sdt(table: &mut [u8]) {
        let len = table.len() as u32;
        table[4..8].copy_from_slice(&len.to_le_bytes());
        table[9] = 0;
        let sum: u8 = table.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        table[9] = 0u8.wrapping_sub(sum);
    }
}
