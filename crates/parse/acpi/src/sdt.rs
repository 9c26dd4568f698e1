//! System Description Table header handling.

use crate::{AcpiError, AcpiHandler, read_u32};

/// The 36-byte header shared by every SDT.
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    /// 4-byte ASCII table signature.
    pub signature: [u8; 4],
    /// Total table length in bytes, header included.
    pub length: u32,
}

impl SdtHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 36;

    /// Reads the header at the start of `data`.
    pub fn read(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            signature: data[0..4].try_into().ok()?,
            length: read_u32(data, 4)?,
        })
    }
}

/// A fully mapped table: validated header plus all bytes.
#[derive(Debug)]
pub struct Table {
    /// Table bytes, `header.length` long.
    pub data: &'static [u8],
    /// The parsed header.
    pub header: SdtHeader,
}

/// Maps a table, verifies its signature and byte checksum.
///
/// # Errors
///
/// [`AcpiError::InvalidSignature`] on a signature mismatch,
/// [`AcpiError::InvalidChecksum`] when the bytes do not sum to zero,
/// [`AcpiError::TruncatedData`] when the header cannot be read.
pub fn load_table(
    handler: &impl AcpiHandler,
    phys: u64,
    signature: &[u8; 4],
) -> Result<Table, AcpiError> {
    // SAFETY: Caller provides a physical address discovered from a
    // checksummed parent table; table memory is never reclaimed.
    let header_data = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
    let header = SdtHeader::read(header_data).ok_or(AcpiError::TruncatedData)?;
    if &header.signature != signature {
        return Err(AcpiError::InvalidSignature);
    }

    // SAFETY: Same as above, now with the self-declared length.
    let data = unsafe { handler.map_physical_region(phys, header.length as usize) };
    let sum: u8 = data.iter().fold(0u8, |a, &b| a.wrapping_add(b));
    if sum != 0 {
        return Err(AcpiError::InvalidChecksum);
    }

    Ok(Table { data, header })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakePhys, seal_sdt};

    #[test]
    fn valid_table_loads() {
        let mut t = vec![0u8; 40];
        t[0..4].copy_from_slice(b"TEST");
        seal_sdt(&mut t);
        let phys = FakePhys::new(t);
        let table = load_table(&phys, 0, b"TEST").unwrap();
        assert_eq!(table.header.length, 40);
    }

    #[test]
    fn wrong_signature_rejected() {
        let mut t = vec![0u8; 40];
        t[0..4].copy_from_slice(b"ABCD");
        seal_sdt(&mut t);
        let phys = FakePhys::new(t);
        assert_eq!(
            load_table(&phys, 0, b"TEST").unwrap_err(),
            AcpiError::InvalidSignature
        );
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut t = vec![0u8; 40];
        t[0..4].copy_from_slice(b"TEST");
        seal_sdt(&mut t);
        t[20] ^= 0xFF;
        let phys = FakePhys::new(t);
        assert_eq!(
            load_table(&phys, 0, b"TEST").unwrap_err(),
            AcpiError::InvalidChecksum
        );
    }
}
