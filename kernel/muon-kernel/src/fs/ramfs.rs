//! In-memory filesystem, populated from the embedded USTAR boot image.
//!
//! The tree structure lives in the VFS; ramfs only backs file contents and
//! symlink targets with heap buffers. The boot path unpacks the USTAR
//! archive straight through the VFS so every archive entry becomes a tnode
//! with its recorded mode and mtime.

extern crate alloc;

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::sync::SpinLock;

use super::vfs::{LookupFlags, Vfs};
use super::{FileSystem, FsError, NodeIdent, NodeType};

/// Per-node state: the file bytes.
pub struct RamNode {
    data: SpinLock<Vec<u8>>,
}

impl RamNode {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            data: SpinLock::new(Vec::new()),
        })
    }
}

/// The ramfs filesystem.
pub struct RamFs;

impl RamFs {
    /// Creates the filesystem singleton.
    pub fn new() -> Self {
        Self
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

fn node(ident: &NodeIdent) -> Result<&RamNode, FsError> {
    ident.downcast_ref::<RamNode>().ok_or(FsError::Invalid)
}

impl FileSystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn mount(&self, _device: Option<NodeIdent>) -> Result<NodeIdent, FsError> {
        Ok(RamNode::new())
    }

    fn mknode(
        &self,
        _parent: &NodeIdent,
        _name: &str,
        _kind: NodeType,
    ) -> Result<NodeIdent, FsError> {
        Ok(RamNode::new())
    }

    fn rmnode(&self, _parent: &NodeIdent, _name: &str, _ident: &NodeIdent) -> Result<(), FsError> {
        Ok(())
    }

    fn read(&self, ident: &NodeIdent, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let data = node(ident)?.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, ident: &NodeIdent, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        let mut data = node(ident)?.data.lock();
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// Unpacks a USTAR archive into the tree below `base` (normally `/`).
/// Returns the number of entries materialised.
pub fn populate(vfs: &mut Vfs, image: &[u8]) -> Result<usize, FsError> {
    let mut count = 0;
    for entry in muon_ustar::entries(image) {
        let path = format!("/{}", entry.name);
        let kind = match entry.kind {
            muon_ustar::EntryKind::File => NodeType::File,
            muon_ustar::EntryKind::Symlink => NodeType::Symlink,
            muon_ustar::EntryKind::CharDev => NodeType::CharDev,
            muon_ustar::EntryKind::BlockDev => NodeType::BlockDev,
            muon_ustar::EntryKind::Folder => NodeType::Folder,
        };

        ensure_parents(vfs, &path)?;
        let node_id = match vfs.path_to_node(&path, LookupFlags::CREATE, kind) {
            Ok(id) => id,
            // Archives may repeat directories; keep the first.
            Err(FsError::AlreadyExists) => continue,
            Err(e) => return Err(e),
        };
        vfs.stamp(node_id, entry.mtime * 1_000_000_000, entry.mode);

        match kind {
            NodeType::File if !entry.data.is_empty() => {
                let ident = vfs.node_ident(node_id).ok_or(FsError::Invalid)?;
                let ram = node(&ident)?;
                *ram.data.lock() = entry.data.to_vec();
                vfs.set_size(node_id, entry.data.len());
            }
            NodeType::Symlink => {
                vfs.set_link(node_id, entry.link)?;
            }
            _ => {}
        }
        count += 1;
    }
    Ok(count)
}

fn ensure_parents(vfs: &mut Vfs, p: &str) -> Result<(), FsError> {
    let Ok((parent, _)) = super::path::split_parent(p) else {
        return Ok(());
    };
    if parent == "/" {
        return Ok(());
    }
    let mut prefix = String::new();
    for part in parent.trim_start_matches('/').split('/') {
        prefix.push('/');
        prefix.push_str(part);
        match vfs.path_to_node(&prefix, LookupFlags::CREATE, NodeType::Folder) {
            Ok(_) | Err(FsError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::vfs::Vfs;
    use super::super::{OpenMode, SeekWhence};
    use super::*;

    fn clock() -> u64 {
        0
    }

    fn archive() -> Vec<u8> {
        // Hand-built USTAR image: /bin (dir), /bin/init (file),
        // /etc/motd (file without a parent dir entry), /bin/sh -> init.
        fn header(name: &str, kind: u8, size: usize, mtime: u64, link: &str) -> [u8; 512] {
            let mut h = [0u8; 512];
            h[..name.len()].copy_from_slice(name.as_bytes());
            h[100..107].copy_from_slice(format!("{:07o}", 0o755).as_bytes());
            h[124..135].copy_from_slice(format!("{size:011o}").as_bytes());
            h[136..147].copy_from_slice(format!("{mtime:011o}").as_bytes());
            h[156] = kind;
            h[157..157 + link.len()].copy_from_slice(link.as_bytes());
            h[257..262].copy_from_slice(b"ustar");
            h
        }
        let mut img = Vec::new();
        for (name, kind, body, mtime, link) in [
            ("bin", b'5', &b""[..], 11, ""),
            ("bin/init", b'0', &b"\x7fELF"[..], 22, ""),
            ("etc/motd", b'0', &b"welcome\n"[..], 33, ""),
            ("bin/sh", b'2', &b""[..], 44, "/bin/init"),
        ] {
            img.extend_from_slice(&header(name, kind, body.len(), mtime, link));
            img.extend_from_slice(body);
            img.resize(img.len().div_ceil(512) * 512, 0);
        }
        img.extend_from_slice(&[0u8; 1024]);
        img
    }

    fn mounted() -> Vfs {
        let mut vfs = Vfs::new(clock);
        vfs.register_fs(Arc::new(RamFs::new()));
        vfs.mount(None, "/", "ramfs").unwrap();
        vfs
    }

    #[test]
    fn ustar_roundtrip_materialises_every_entry() {
        let mut vfs = mounted();
        let count = populate(&mut vfs, &archive()).unwrap();
        assert_eq!(count, 4);

        let mut table = Vec::new();
        let h = vfs.open(&mut table, "/bin/init", OpenMode::Read).unwrap();
        assert_eq!(vfs.file_size(&table, h).unwrap(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(&mut table, h, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"\x7fELF");

        // Names, sizes and mtimes match the octal header fields.
        let node = vfs
            .path_to_node("/etc/motd", LookupFlags::empty(), NodeType::Invalid)
            .unwrap();
        assert_eq!(vfs.tnode(node).stat.mtime_ns, 33 * 1_000_000_000);
        assert_eq!(vfs.tnode(node).stat.size, 8);
    }

    #[test]
    fn archive_symlink_resolves() {
        let mut vfs = mounted();
        populate(&mut vfs, &archive()).unwrap();
        let mut table = Vec::new();
        let h = vfs.open(&mut table, "/bin/sh", OpenMode::Read).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(&mut table, h, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"\x7fELF");
    }

    #[test]
    fn missing_parent_directories_are_created() {
        let mut vfs = mounted();
        populate(&mut vfs, &archive()).unwrap();
        // /etc never appeared in the archive but /etc/motd did.
        let node = vfs
            .path_to_node("/etc", LookupFlags::empty(), NodeType::Invalid)
            .unwrap();
        assert_eq!(vfs.inode(vfs.tnode(node).inode).kind, NodeType::Folder);
    }

    #[test]
    fn writes_grow_in_memory() {
        let mut vfs = mounted();
        populate(&mut vfs, &archive()).unwrap();
        let mut table = Vec::new();
        let h = vfs
            .open(&mut table, "/etc/motd", OpenMode::ReadWrite)
            .unwrap();
        vfs.seek(&mut table, h, 0, SeekWhence::End).unwrap();
        vfs.write(&mut table, h, b"more").unwrap();
        assert_eq!(vfs.file_size(&table, h).unwrap(), 12);
    }
}
