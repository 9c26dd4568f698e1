//! RSDT / XSDT enumeration and table lookup.

use crate::sdt::SdtHeader;
use crate::{AcpiError, AcpiHandler, read_u32, read_u64};

/// Searches the RSDT or XSDT for the table with the given signature.
///
/// Entries are 4 bytes in an RSDT and 8 in an XSDT; each points at an SDT
/// whose header carries the signature being matched.
///
/// # Errors
///
/// [`AcpiError::TableNotFound`] when no entry matches.
pub fn find_table(
    handler: &impl AcpiHandler,
    sdt_addr: u64,
    is_xsdt: bool,
    signature: &[u8; 4],
) -> Result<u64, AcpiError> {
    // SAFETY: sdt_addr comes from a checksummed RSDP; table memory persists.
    let header_data = unsafe { handler.map_physical_region(sdt_addr, SdtHeader::SIZE) };
    let header = SdtHeader::read(header_data).ok_or(AcpiError::TruncatedData)?;

    let total = header.length as usize;
    if total < SdtHeader::SIZE {
        return Err(AcpiError::TruncatedData);
    }
    // SAFETY: Same as above, full declared length.
    let data = unsafe { handler.map_physical_region(sdt_addr, total) };

    let entry_size = if is_xsdt { 8 } else { 4 };
    let mut off = SdtHeader::SIZE;
    while off + entry_size <= total {
        let entry = if is_xsdt {
            read_u64(data, off).ok_or(AcpiError::TruncatedData)?
        } else {
            u64::from(read_u32(data, off).ok_or(AcpiError::TruncatedData)?)
        };
        off += entry_size;

        // SAFETY: Entry addresses point at SDTs in firmware memory.
        let candidate = unsafe { handler.map_physical_region(entry, SdtHeader::SIZE) };
        if &candidate[0..4] == signature {
            return Ok(entry);
        }
    }

    Err(AcpiError::TableNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakePhys, seal_sdt};

    #[test]
    fn finds_table_by_signature() {
        // Image layout: RSDT at 0, APIC table at 0x100, HPET table at 0x200.
        let mut img = vec![0u8; 0x300];

        let mut apic = vec![0u8; 44];
        apic[0..4].copy_from_slice(b"APIC");
        seal_sdt(&mut apic);
        img[0x100..0x100 + apic.len()].copy_from_slice(&apic);

        let mut hpet = vec![0u8; 56];
        hpet[0..4].copy_from_slice(b"HPET");
        seal_sdt(&mut hpet);
        img[0x200..0x200 + hpet.len()].copy_from_slice(&hpet);

        let mut rsdt = vec![0u8; 36 + 8];
        rsdt[0..4].copy_from_slice(b"RSDT");
        rsdt[36..40].copy_from_slice(&0x100u32.to_le_bytes());
        rsdt[40..44].copy_from_slice(&0x200u32.to_le_bytes());
        seal_sdt(&mut rsdt);
        img[..rsdt.len()].copy_from_slice(&rsdt);

        let phys = FakePhys::new(img);
        assert_eq!(find_table(&phys, 0, false, b"HPET").unwrap(), 0x200);
        assert_eq!(find_table(&phys, 0, false, b"APIC").unwrap(), 0x100);
        assert_eq!(
            find_table(&phys, 0, false, b"FACP").unwrap_err(),
            AcpiError::TableNotFound
        );
    }
}
