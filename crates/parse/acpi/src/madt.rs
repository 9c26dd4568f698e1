//! Multiple APIC Description Table parsing.
//!
//! Provides the local APIC base, the per-CPU LAPIC records the SMP bring-up
//! iterates, and the I/O APIC records.

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler, read_u16, read_u32};

/// MADT table signature.
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// LAPIC record flag: processor enabled.
pub const LAPIC_FLAG_ENABLED: u32 = 1 << 0;
/// LAPIC record flag: processor can be brought online.
pub const LAPIC_FLAG_ONLINE_CAPABLE: u32 = 1 << 1;

/// Parsed MADT.
pub struct Madt {
    /// Physical address of the local APIC register block.
    pub local_apic_address: u32,
    /// MADT flags (bit 0: dual 8259 PICs present).
    pub flags: u32,
    entries_data: &'static [u8],
}

/// One interrupt-controller record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadtEntry {
    /// Type 0: processor local APIC.
    LocalApic {
        /// ACPI processor id.
        processor_id: u8,
        /// Local APIC id.
        apic_id: u8,
        /// Enabled / online-capable flags.
        flags: u32,
    },
    /// Type 1: I/O APIC.
    IoApic {
        /// I/O APIC id.
        io_apic_id: u8,
        /// Physical register base.
        address: u32,
        /// First global system interrupt handled.
        gsi_base: u32,
    },
    /// Type 2: ISA interrupt source override.
    InterruptOverride {
        /// ISA IRQ being redirected.
        source: u8,
        /// Target global system interrupt.
        gsi: u32,
        /// MPS INTI flags.
        flags: u16,
    },
    /// Any other record type, skipped.
    Other(u8),
}

impl Madt {
    /// Parses the MADT at `phys`.
    ///
    /// # Errors
    ///
    /// Signature/checksum failures from [`crate::sdt::load_table`].
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::sdt::load_table(handler, phys, MADT_SIGNATURE)?;
        let local_apic_address =
            read_u32(table.data, SdtHeader::SIZE).ok_or(AcpiError::TruncatedData)?;
        let flags = read_u32(table.data, SdtHeader::SIZE + 4).ok_or(AcpiError::TruncatedData)?;
        Ok(Self {
            local_apic_address,
            flags,
            entries_data: table.data.get(SdtHeader::SIZE + 8..).unwrap_or(&[]),
        })
    }

    /// Iterates the interrupt-controller records.
    pub fn entries(&self) -> MadtEntryIter<'_> {
        MadtEntryIter {
            data: self.entries_data,
            offset: 0,
        }
    }

    /// Iterates only the LAPIC records.
    pub fn local_apics(&self) -> impl Iterator<Item = (u8, u8, u32)> + '_ {
        self.entries().filter_map(|e| match e {
            MadtEntry::LocalApic {
                processor_id,
                apic_id,
                flags,
            } => Some((processor_id, apic_id, flags)),
            _ => None,
        })
    }
}

/// Iterator over MADT records.
pub struct MadtEntryIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl Iterator for MadtEntryIter<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data;
        let base = self.offset;
        if base + 2 > data.len() {
            return None;
        }
        let etype = data[base];
        let elen = data[base + 1] as usize;
        if elen < 2 || base + elen > data.len() {
            return None;
        }
        self.offset += elen;

        Some(match etype {
            0 if elen >= 8 => MadtEntry::LocalApic {
                processor_id: data[base + 2],
                apic_id: data[base + 3],
                flags: read_u32(data, base + 4)?,
            },
            1 if elen >= 12 => MadtEntry::IoApic {
                io_apic_id: data[base + 2],
                address: read_u32(data, base + 4)?,
                gsi_base: read_u32(data, base + 8)?,
            },
            2 if elen >= 10 => MadtEntry::InterruptOverride {
                source: data[base + 3],
                gsi: read_u32(data, base + 4)?,
                flags: read_u16(data, base + 8)?,
            },
            other => MadtEntry::Other(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakePhys, seal_sdt};

    fn build_madt(records: &[&[u8]]) -> Vec<u8> {
        let mut t = vec![0u8; 44];
        t[0..4].copy_from_slice(b"APIC");
        t[36..40].copy_from_slice(&0xFEE0_0000u32.to_le_bytes());
        t[40..44].copy_from_slice(&1u32.to_le_bytes());
        for r in records {
            t.extend_from_slice(r);
        }
        seal_sdt(&mut t);
        t
    }

    #[test]
    fn lapic_and_ioapic_records() {
        let lapic0 = [0u8, 8, 0, 0, 1, 0, 0, 0];
        let lapic1 = [0u8, 8, 1, 1, 1, 0, 0, 0];
        let ioapic = [1u8, 12, 9, 0, 0x00, 0x00, 0xC0, 0xFE, 0, 0, 0, 0];
        let img = build_madt(&[&lapic0, &lapic1, &ioapic]);
        let phys = FakePhys::new(img);

        let madt = Madt::parse(&phys, 0).unwrap();
        assert_eq!(madt.local_apic_address, 0xFEE0_0000);

        let lapics: Vec<_> = madt.local_apics().collect();
        assert_eq!(lapics, vec![(0, 0, 1), (1, 1, 1)]);

        let io: Vec<_> = madt
            .entries()
            .filter(|e| matches!(e, MadtEntry::IoApic { .. }))
            .collect();
        assert_eq!(
            io,
            vec![MadtEntry::IoApic {
                io_apic_id: 9,
                address: 0xFEC0_0000,
                gsi_base: 0
            }]
        );
    }

    #[test]
    fn unknown_records_survive_iteration() {
        let weird = [9u8, 4, 0xAA, 0xBB];
        let lapic = [0u8, 8, 2, 2, 1, 0, 0, 0];
        let img = build_madt(&[&weird, &lapic]);
        let phys = FakePhys::new(img);
        let madt = Madt::parse(&phys, 0).unwrap();
        assert_eq!(madt.local_apics().count(), 1);
    }
}
