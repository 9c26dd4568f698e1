//! HPET description table parsing.

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler, read_u16, read_u32, read_u64};

/// HPET table signature.
pub const HPET_SIGNATURE: &[u8; 4] = b"HPET";

/// Parsed HPET table.
#[derive(Debug, Clone, Copy)]
pub struct HpetTable {
    /// Hardware id of the event timer block.
    pub event_timer_block_id: u32,
    /// Physical base of the HPET register block (from the GAS).
    pub base_address: u64,
    /// Sequence number when multiple HPETs exist.
    pub hpet_number: u8,
    /// Minimum periodic tick, femtoseconds.
    pub minimum_tick: u16,
}

impl HpetTable {
    /// Parses the HPET table at `phys`.
    ///
    /// # Errors
    ///
    /// Signature/checksum failures from [`crate::sdt::load_table`].
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::sdt::load_table(handler, phys, HPET_SIGNATURE)?;
        let base = SdtHeader::SIZE;
        Ok(Self {
            event_timer_block_id: read_u32(table.data, base).ok_or(AcpiError::TruncatedData)?,
            // Generic Address Structure at +4: the 64-bit address lives at +8
            // within it (space id, width, offset, access size precede it).
            base_address: read_u64(table.data, base + 8).ok_or(AcpiError::TruncatedData)?,
            hpet_number: *table
                .data
                .get(base + 16)
                .ok_or(AcpiError::TruncatedData)?,
            minimum_tick: read_u16(table.data, base + 17).ok_or(AcpiError::TruncatedData)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakePhys, seal_sdt};

    #[test]
    fn parses_base_address() {
        let mut t = vec![0u8; 56];
        t[0..4].copy_from_slice(b"HPET");
        t[36..40].copy_from_slice(&0x8086_A201u32.to_le_bytes());
        t[44..52].copy_from_slice(&0xFED0_0000u64.to_le_bytes());
        t[52] = 0;
        t[53..55].copy_from_slice(&0x80u16.to_le_bytes());
        seal_sdt(&mut t);
        let phys = FakePhys::new(t);
        let hpet = HpetTable::parse(&phys, 0).unwrap();
        assert_eq!(hpet.base_address, 0xFED0_0000);
        assert_eq!(hpet.minimum_tick, 0x80);
    }
}
