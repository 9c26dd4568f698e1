//! USTAR archive walker.
//!
//! The ramfs root image is a plain USTAR archive: a sequence of 512-byte
//! headers, each followed by the entry body padded up to the next 512-byte
//! boundary. Numeric fields (mode, size, mtime) are NUL/space-terminated
//! octal ASCII. The archive ends at two zero blocks or at the end of the
//! slice.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

/// Size of a header / framing block.
pub const BLOCK_SIZE: usize = 512;

const NAME_OFF: usize = 0;
const NAME_LEN: usize = 100;
const MODE_OFF: usize = 100;
const SIZE_OFF: usize = 124;
const MTIME_OFF: usize = 136;
const TYPE_OFF: usize = 156;
const LINK_OFF: usize = 157;
const LINK_LEN: usize = 100;
const MAGIC_OFF: usize = 257;

/// Entry kinds the ramfs materialises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Type byte '0' (or NUL): regular file.
    File,
    /// Type byte '2': symbolic link.
    Symlink,
    /// Type byte '3': character device.
    CharDev,
    /// Type byte '4': block device.
    BlockDev,
    /// Type byte '5': directory.
    Folder,
}

/// One archive entry borrowed from the image.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    /// Path name, without a trailing slash.
    pub name: &'a str,
    /// Entry kind.
    pub kind: EntryKind,
    /// Permission bits from the octal mode field.
    pub mode: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: u64,
    /// Symlink target (empty unless kind is Symlink).
    pub link: &'a str,
    /// Body bytes (empty for folders and devices).
    pub data: &'a [u8],
}

/// Parses a NUL/space-terminated octal ASCII field.
fn parse_octal(field: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in field {
        match b {
            b'0'..=b'7' => value = value * 8 + u64::from(b - b'0'),
            b' ' => continue,
            _ => break,
        }
    }
    value
}

/// Extracts a NUL-terminated string field.
fn parse_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

/// Iterator over the entries of a USTAR archive.
pub struct ArchiveIter<'a> {
    image: &'a [u8],
    offset: usize,
}

/// Returns an iterator over the archive entries in `image`.
pub fn entries(image: &[u8]) -> ArchiveIter<'_> {
    ArchiveIter { image, offset: 0 }
}

impl<'a> Iterator for ArchiveIter<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let header = self.image.get(self.offset..self.offset + BLOCK_SIZE)?;
            // Two zero blocks terminate the archive; one is enough to stop.
            if header.iter().all(|&b| b == 0) {
                return None;
            }
            if &header[MAGIC_OFF..MAGIC_OFF + 5] != b"ustar" {
                return None;
            }

            let size = parse_octal(&header[SIZE_OFF..SIZE_OFF + 12]) as usize;
            let body_off = self.offset + BLOCK_SIZE;
            let data = self.image.get(body_off..body_off + size)?;
            self.offset = body_off + size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

            let kind = match header[TYPE_OFF] {
                0 | b'0' => EntryKind::File,
                b'2' => EntryKind::Symlink,
                b'3' => EntryKind::CharDev,
                b'4' => EntryKind::BlockDev,
                b'5' => EntryKind::Folder,
                // Unsupported entry (fifo, pax extension, ...): skip it.
                _ => continue,
            };

            let name = parse_str(&header[NAME_OFF..NAME_OFF + NAME_LEN]).trim_end_matches('/');
            if name.is_empty() {
                continue;
            }

            return Some(Entry {
                name,
                kind,
                mode: parse_octal(&header[MODE_OFF..MODE_OFF + 8]) as u32,
                mtime: parse_octal(&header[MTIME_OFF..MTIME_OFF + 12]),
                link: parse_str(&header[LINK_OFF..LINK_OFF + LINK_LEN]),
                data,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, kind: u8, mode: u32, size: usize, mtime: u64, link: &str) -> [u8; 512] {
        let mut h = [0u8; 512];
        h[..name.len()].copy_from_slice(name.as_bytes());
        let mode_s = format!("{mode:07o}");
        h[MODE_OFF..MODE_OFF + 7].copy_from_slice(mode_s.as_bytes());
        let size_s = format!("{size:011o}");
        h[SIZE_OFF..SIZE_OFF + 11].copy_from_slice(size_s.as_bytes());
        let mtime_s = format!("{mtime:011o}");
        h[MTIME_OFF..MTIME_OFF + 11].copy_from_slice(mtime_s.as_bytes());
        h[TYPE_OFF] = kind;
        h[LINK_OFF..LINK_OFF + link.len()].copy_from_slice(link.as_bytes());
        h[MAGIC_OFF..MAGIC_OFF + 5].copy_from_slice(b"ustar");
        h
    }

    fn archive(parts: &[(&str, u8, u32, &[u8], u64, &str)]) -> Vec<u8> {
        let mut img = Vec::new();
        for &(name, kind, mode, data, mtime, link) in parts {
            img.extend_from_slice(&header(name, kind, mode, data.len(), mtime, link));
            img.extend_from_slice(data);
            img.resize(img.len().div_ceil(512) * 512, 0);
        }
        img.extend_from_slice(&[0u8; 1024]);
        img
    }

    #[test]
    fn walks_files_and_folders() {
        let img = archive(&[
            ("bin", b'5', 0o755, b"", 100, ""),
            ("bin/init", b'0', 0o755, b"\x7fELF....", 200, ""),
            ("etc/motd", b'0', 0o644, b"hello muon\n", 300, ""),
        ]);
        let got: Vec<_> = entries(&img).collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].name, "bin");
        assert_eq!(got[0].kind, EntryKind::Folder);
        assert_eq!(got[0].mode, 0o755);
        assert_eq!(got[1].name, "bin/init");
        assert_eq!(got[1].data, b"\x7fELF....");
        assert_eq!(got[2].mtime, 300);
        assert_eq!(got[2].data.len(), 11);
    }

    #[test]
    fn symlink_carries_target() {
        let img = archive(&[("bin/sh", b'2', 0o777, b"", 0, "/bin/hansh")]);
        let got: Vec<_> = entries(&img).collect();
        assert_eq!(got[0].kind, EntryKind::Symlink);
        assert_eq!(got[0].link, "/bin/hansh");
    }

    #[test]
    fn body_padding_respected() {
        // 513-byte body occupies two blocks; the next entry must still parse.
        let body = vec![0xAB; 513];
        let img = archive(&[("a", b'0', 0o644, &body, 0, ""), ("b", b'0', 0o644, b"x", 0, "")]);
        let got: Vec<_> = entries(&img).collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data.len(), 513);
        assert_eq!(got[1].name, "b");
    }

    #[test]
    fn trailing_slash_stripped_from_folders() {
        let img = archive(&[("usr/", b'5', 0o755, b"", 0, "")]);
        let got: Vec<_> = entries(&img).collect();
        assert_eq!(got[0].name, "usr");
    }

    #[test]
    fn stops_at_zero_block() {
        let img = vec![0u8; 4096];
        assert_eq!(entries(&img).count(), 0);
    }

    #[test]
    fn unknown_types_skipped() {
        let img = archive(&[("f", b'6', 0o644, b"", 0, ""), ("g", b'0', 0o644, b"", 0, "")]);
        let got: Vec<_> = entries(&img).collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "g");
    }
}
