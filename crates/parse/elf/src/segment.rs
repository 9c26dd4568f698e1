//! Program header table parsing.

use crate::header::{Elf64Header, ElfError, read_u32, read_u64};

/// `p_type` values the loader cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// `PT_LOAD`: mapped into the task address space.
    Load,
    /// `PT_INTERP`: path of the dynamic interpreter.
    Interp,
    /// `PT_PHDR`: virtual address of the program header table.
    Phdr,
    /// Anything else; skipped by the loader.
    Other(u32),
}

/// Segment is executable.
pub const PF_X: u32 = 1;
/// Segment is writable.
pub const PF_W: u32 = 2;
/// Segment is readable.
pub const PF_R: u32 = 4;

/// One parsed program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    /// Segment kind.
    pub kind: SegmentKind,
    /// `p_flags` permission bits (PF_X/PF_W/PF_R).
    pub flags: u32,
    /// File offset of the segment contents.
    pub offset: u64,
    /// Target virtual address (unrebased).
    pub vaddr: u64,
    /// Bytes present in the file.
    pub filesz: u64,
    /// Bytes occupied in memory (>= filesz; the rest is zero-filled).
    pub memsz: u64,
}

impl ProgramHeader {
    /// Misalignment of the segment vaddr within its page.
    pub fn misalign(&self) -> u64 {
        self.vaddr & 0xFFF
    }

    /// Number of 4 KiB pages needed to hold `misalign + memsz`.
    pub fn page_count(&self) -> u64 {
        (self.misalign() + self.memsz).div_ceil(4096)
    }
}

/// A parsed ELF image: validated header plus the backing bytes.
pub struct ElfFile<'a> {
    header: Elf64Header,
    data: &'a [u8],
}

impl<'a> ElfFile<'a> {
    /// Parses and validates the image.
    ///
    /// # Errors
    ///
    /// Propagates header validation failures and rejects images whose
    /// program header table does not fit.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = Elf64Header::parse(data)?;
        let table_end = header.phoff as usize
            + header.phnum as usize * header.phentsize as usize;
        if header.phentsize < 56 || table_end > data.len() {
            return Err(ElfError::BadProgramHeaders);
        }
        Ok(Self { header, data })
    }

    /// The validated header.
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    /// The raw image bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Iterates over all program headers.
    pub fn segments(&self) -> SegmentsIter<'a> {
        SegmentsIter {
            data: self.data,
            phoff: self.header.phoff as usize,
            phentsize: self.header.phentsize as usize,
            remaining: self.header.phnum as usize,
        }
    }

    /// Iterates over `PT_LOAD` segments only.
    pub fn load_segments(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        self.segments().filter(|s| s.kind == SegmentKind::Load)
    }

    /// Returns the `PT_INTERP` path, if the image requests an interpreter.
    ///
    /// Trailing NUL bytes are stripped.
    pub fn interpreter(&self) -> Option<&'a str> {
        let seg = self.segments().find(|s| s.kind == SegmentKind::Interp)?;
        let raw = self
            .data
            .get(seg.offset as usize..(seg.offset + seg.filesz) as usize)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        core::str::from_utf8(&raw[..end]).ok()
    }

    /// Returns the `PT_PHDR` virtual address, if present.
    pub fn phdr_vaddr(&self) -> Option<u64> {
        self.segments()
            .find(|s| s.kind == SegmentKind::Phdr)
            .map(|s| s.vaddr)
    }

    /// Returns the file bytes backing a segment.
    pub fn segment_bytes(&self, seg: &ProgramHeader) -> Option<&'a [u8]> {
        self.data
            .get(seg.offset as usize..(seg.offset + seg.filesz) as usize)
    }
}

/// Iterator over the program header table.
pub struct SegmentsIter<'a> {
    data: &'a [u8],
    phoff: usize,
    phentsize: usize,
    remaining: usize,
}

impl Iterator for SegmentsIter<'_> {
    type Item = ProgramHeader;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let base = self.phoff;
        self.phoff += self.phentsize;
        self.remaining -= 1;

        let ptype = read_u32(self.data, base)?;
        Some(ProgramHeader {
            kind: match ptype {
                1 => SegmentKind::Load,
                3 => SegmentKind::Interp,
                6 => SegmentKind::Phdr,
                other => SegmentKind::Other(other),
            },
            flags: read_u32(self.data, base + 4)?,
            offset: read_u64(self.data, base + 8)?,
            vaddr: read_u64(self.data, base + 16)?,
            filesz: read_u64(self.data, base + 32)?,
            memsz: read_u64(self.data, base + 40)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{build_elf, build_phdr};

    #[test]
    fn misalignment_page_count() {
        let seg = ProgramHeader {
            kind: SegmentKind::Load,
            flags: PF_R,
            offset: 0,
            vaddr: 0x40_1234,
            filesz: 0x100,
            memsz: 0x2000,
        };
        assert_eq!(seg.misalign(), 0x234);
        // 0x234 + 0x2000 = 0x2234 -> 3 pages
        assert_eq!(seg.page_count(), 3);
    }

    #[test]
    fn aligned_segment_exact_pages() {
        let seg = ProgramHeader {
            kind: SegmentKind::Load,
            flags: PF_R,
            offset: 0,
            vaddr: 0x40_0000,
            filesz: 0x1000,
            memsz: 0x1000,
        };
        assert_eq!(seg.misalign(), 0);
        assert_eq!(seg.page_count(), 1);
    }

    #[test]
    fn interp_path_extracted() {
        let path = b"/lib/ld.so\0";
        let mut ph = build_phdr(3, 0, 200, 0, path.len() as u64, path.len() as u64);
        ph[8..16].copy_from_slice(&200u64.to_le_bytes());
        let mut img = build_elf(2, &[ph]);
        img.resize(200 + path.len(), 0);
        img[200..].copy_from_slice(path);
        let elf = ElfFile::parse(&img).unwrap();
        assert_eq!(elf.interpreter(), Some("/lib/ld.so"));
    }

    #[test]
    fn phdr_vaddr_reported() {
        let img = build_elf(2, &[build_phdr(6, 0, 64, 0x40_0040, 0, 0)]);
        let elf = ElfFile::parse(&img).unwrap();
        assert_eq!(elf.phdr_vaddr(), Some(0x40_0040));
    }

    #[test]
    fn truncated_phdr_table_rejected() {
        let mut img = build_elf(2, &[]);
        img[56..58].copy_from_slice(&4u16.to_le_bytes()); // claims 4 phdrs
        assert!(matches!(
            ElfFile::parse(&img),
            Err(ElfError::BadProgramHeaders)
        ));
    }
}
