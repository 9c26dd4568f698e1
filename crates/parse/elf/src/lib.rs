//! Minimal ELF64 parser for the muon kernel.
//!
//! Parses the ELF64 header and program headers from a raw byte slice using
//! safe field extraction (`from_le_bytes`). No unsafe code, no allocation.
//! The exec path only needs `PT_LOAD`, `PT_INTERP` and `PT_PHDR`, so section
//! headers are not modeled.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod header;
pub mod segment;

pub use header::{Elf64Header, ElfError, ElfType};
pub use segment::{ElfFile, ProgramHeader, SegmentKind, SegmentsIter};

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal valid ELF64 image with the given program headers.
    pub(crate) fn build_elf(etype: u16, phdrs: &[[u8; 56]]) -> Vec<u8> {
        let mut img = vec![0u8; 64 + 56 * phdrs.len()];
        img[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        img[4] = 2; // ELFCLASS64
        img[5] = 1; // little-endian
        img[6] = 1; // EV_CURRENT
        img[7] = 0; // SysV ABI
        img[16..18].copy_from_slice(&etype.to_le_bytes());
        img[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // x86-64
        img[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        img[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        img[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        img[56..58].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());
        for (i, ph) in phdrs.iter().enumerate() {
            img[64 + i * 56..64 + (i + 1) * 56].copy_from_slice(ph);
        }
        img
    }

    pub(crate) fn build_phdr(
        ptype: u32,
        flags: u32,
        offset: u64,
        vaddr: u64,
        filesz: u64,
        memsz: u64,
    ) -> [u8; 56] {
        let mut ph = [0u8; 56];
        ph[0..4].copy_from_slice(&ptype.to_le_bytes());
        ph[4..8].copy_from_slice(&flags.to_le_bytes());
        ph[8..16].copy_from_slice(&offset.to_le_bytes());
        ph[16..24].copy_from_slice(&vaddr.to_le_bytes());
        ph[32..40].copy_from_slice(&filesz.to_le_bytes());
        ph[40..48].copy_from_slice(&memsz.to_le_bytes());
        ph
    }

    #[test]
    fn parse_roundtrip() {
        let img = build_elf(2, &[build_phdr(1, 5, 0x1000, 0x40_1000, 0x200, 0x300)]);
        let elf = ElfFile::parse(&img).unwrap();
        assert_eq!(elf.header().entry, 0x40_1000);
        assert_eq!(elf.header().etype, ElfType::Exec);
        let loads: Vec<_> = elf.load_segments().collect();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].vaddr, 0x40_1000);
        assert_eq!(loads[0].memsz, 0x300);
    }
}
