//! ELF64 file header parsing and validation.

/// ELF magic bytes.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// `e_ident` index of the class byte.
const EI_CLASS: usize = 4;
/// `e_ident` index of the data-encoding byte.
const EI_DATA: usize = 5;
/// `e_ident` index of the OS ABI byte.
const EI_OSABI: usize = 7;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFOSABI_SYSV: u8 = 0;
const EM_X86_64: u16 = 0x3E;

/// Size of the ELF64 file header in bytes.
pub const EHDR_SIZE: usize = 64;

/// Validation failure while parsing an ELF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The image is shorter than a structure it must contain.
    Truncated,
    /// Magic bytes are not `\x7fELF`.
    BadMagic,
    /// Not a 64-bit little-endian SysV image.
    UnsupportedIdent,
    /// `e_machine` is not x86-64.
    WrongMachine,
    /// `e_type` is neither ET_EXEC nor ET_DYN.
    UnsupportedType,
    /// Program header table extends past the end of the image.
    BadProgramHeaders,
}

/// Object file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfType {
    /// `ET_EXEC`: load segments at their stated vaddrs.
    Exec,
    /// `ET_DYN`: rebase segments and entry by the interpreter base.
    Dyn,
}

/// The fields of the ELF64 header the loader consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    /// Object file type.
    pub etype: ElfType,
    /// Entry point virtual address (unrebased).
    pub entry: u64,
    /// File offset of the program header table.
    pub phoff: u64,
    /// Size of one program header entry.
    pub phentsize: u16,
    /// Number of program header entries.
    pub phnum: u16,
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

impl Elf64Header {
    /// Parses and validates the header at the start of `data`.
    ///
    /// # Errors
    ///
    /// Any identification mismatch is rejected; the loader refuses images
    /// that are not little-endian SysV x86-64 ELF64.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[EI_CLASS] != ELFCLASS64
            || data[EI_DATA] != ELFDATA2LSB
            || data[EI_OSABI] != ELFOSABI_SYSV
        {
            return Err(ElfError::UnsupportedIdent);
        }

        let etype = match read_u16(data, 16).ok_or(ElfError::Truncated)? {
            2 => ElfType::Exec,
            3 => ElfType::Dyn,
            _ => return Err(ElfError::UnsupportedType),
        };
        if read_u16(data, 18).ok_or(ElfError::Truncated)? != EM_X86_64 {
            return Err(ElfError::WrongMachine);
        }

        Ok(Self {
            etype,
            entry: read_u64(data, 24).ok_or(ElfError::Truncated)?,
            phoff: read_u64(data, 32).ok_or(ElfError::Truncated)?,
            phentsize: read_u16(data, 54).ok_or(ElfError::Truncated)?,
            phnum: read_u16(data, 56).ok_or(ElfError::Truncated)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::build_elf;

    #[test]
    fn rejects_bad_magic() {
        let mut img = build_elf(2, &[]);
        img[0] = 0;
        assert_eq!(Elf64Header::parse(&img), Err(ElfError::BadMagic));
    }

    #[test]
    fn rejects_32bit_class() {
        let mut img = build_elf(2, &[]);
        img[4] = 1;
        assert_eq!(Elf64Header::parse(&img), Err(ElfError::UnsupportedIdent));
    }

    #[test]
    fn rejects_big_endian() {
        let mut img = build_elf(2, &[]);
        img[5] = 2;
        assert_eq!(Elf64Header::parse(&img), Err(ElfError::UnsupportedIdent));
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut img = build_elf(2, &[]);
        img[18] = 0x28; // aarch64
        assert_eq!(Elf64Header::parse(&img), Err(ElfError::WrongMachine));
    }

    #[test]
    fn rejects_relocatable_type() {
        let img = build_elf(1, &[]); // ET_REL
        assert_eq!(Elf64Header::parse(&img), Err(ElfError::UnsupportedType));
    }

    #[test]
    fn rejects_truncated_image() {
        assert_eq!(Elf64Header::parse(&[0x7F; 10]), Err(ElfError::Truncated));
    }

    #[test]
    fn accepts_shared_object() {
        let img = build_elf(3, &[]);
        let hdr = Elf64Header::parse(&img).unwrap();
        assert_eq!(hdr.etype, ElfType::Dyn);
    }
}
