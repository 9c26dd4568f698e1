//! Root System Description Pointer parsing.
//!
//! The bootloader hands over the RSDP physical address. Revision 0 points at
//! a 32-bit RSDT; revision 2+ adds the 64-bit XSDT, which is preferred when
//! present.

use crate::{AcpiError, AcpiHandler, read_u32, read_u64};

const RSDP_V1_SIZE: usize = 20;
const RSDP_V2_SIZE: usize = 36;

/// Parsed RSDP.
#[derive(Debug, Clone, Copy)]
pub struct Rsdp {
    /// ACPI revision (0 = 1.0, 2+ = 2.0 and later).
    pub revision: u8,
    /// Physical address of the RSDT or XSDT.
    pub sdt_address: u64,
    /// Whether `sdt_address` points at an XSDT (64-bit entries).
    pub is_xsdt: bool,
}

impl Rsdp {
    /// Parses and validates the RSDP at `phys`.
    ///
    /// # Errors
    ///
    /// Signature or checksum mismatches are rejected; for revision 2+ the
    /// extended checksum is verified as well.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        // SAFETY: phys comes from the bootloader's RSDP response; firmware
        // tables are never reclaimed.
        let v1 = unsafe { handler.map_physical_region(phys, RSDP_V1_SIZE) };
        if &v1[0..8] != b"RSD PTR " {
            return Err(AcpiError::InvalidSignature);
        }
        if v1.iter().fold(0u8, |a, &b| a.wrapping_add(b)) != 0 {
            return Err(AcpiError::InvalidChecksum);
        }

        let revision = v1[15];
        if revision < 2 {
            return Ok(Self {
                revision,
                sdt_address: u64::from(read_u32(v1, 16).ok_or(AcpiError::TruncatedData)?),
                is_xsdt: false,
            });
        }

        // SAFETY: Same as above; revision 2 guarantees the extended fields.
        let v2 = unsafe { handler.map_physical_region(phys, RSDP_V2_SIZE) };
        if v2.iter().fold(0u8, |a, &b| a.wrapping_add(b)) != 0 {
            return Err(AcpiError::InvalidChecksum);
        }
        Ok(Self {
            revision,
            sdt_address: read_u64(v2, 24).ok_or(AcpiError::TruncatedData)?,
            is_xsdt: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakePhys;

    fn seal_range(buf: &mut [u8], at: usize, len: usize) {
        buf[at] = 0;
        let sum: u8 = buf[..len].iter().fold(0u8, |a, &b| a.wrapping_add(b));
        buf[at] = 0u8.wrapping_sub(sum);
    }

    #[test]
    fn v1_selects_rsdt() {
        let mut r = vec![0u8; 36];
        r[0..8].copy_from_slice(b"RSD PTR ");
        r[15] = 0;
        r[16..20].copy_from_slice(&0x1234u32.to_le_bytes());
        seal_range(&mut r, 8, 20);
        let phys = FakePhys::new(r);
        let rsdp = Rsdp::parse(&phys, 0).unwrap();
        assert!(!rsdp.is_xsdt);
        assert_eq!(rsdp.sdt_address, 0x1234);
    }

    #[test]
    fn v2_selects_xsdt() {
        let mut r = vec![0u8; 36];
        r[0..8].copy_from_slice(b"RSD PTR ");
        r[15] = 2;
        r[16..20].copy_from_slice(&0x1234u32.to_le_bytes());
        r[24..32].copy_from_slice(&0xAB_CDEFu64.to_le_bytes());
        seal_range(&mut r, 8, 20);
        seal_range(&mut r, 32, 36);
        let phys = FakePhys::new(r);
        let rsdp = Rsdp::parse(&phys, 0).unwrap();
        assert!(rsdp.is_xsdt);
        assert_eq!(rsdp.sdt_address, 0xAB_CDEF);
    }

    #[test]
    fn bad_signature_rejected() {
        let r = vec![0u8; 36];
        let phys = FakePhys::new(r);
        assert_eq!(
            Rsdp::parse(&phys, 0).unwrap_err(),
            AcpiError::InvalidSignature
        );
    }
}
