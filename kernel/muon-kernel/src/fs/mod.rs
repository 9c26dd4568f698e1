//! Virtual filesystem layer.
//!
//! The tree (tnodes naming inodes) lives in [`vfs`]; concrete filesystems
//! plug in through the [`FileSystem`] trait and keep their per-node state
//! behind an opaque [`NodeIdent`] they downcast themselves. Everything here
//! is host-testable; only the TTY's blocking read reaches into the
//! scheduler and is gated accordingly.

extern crate alloc;

pub mod fat32;
pub mod path;
pub mod pipefs;
pub mod ramfs;
pub mod ttyfs;
pub mod vfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use muon_core::errno::{self, Errno};

/// Filesystem-internal error kinds. Translated to errno values only at the
/// syscall boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path or child does not exist.
    NotFound,
    /// Creation target already exists.
    AlreadyExists,
    /// Handle does not name an open file.
    BadHandle,
    /// Operation not allowed on this node or mode.
    PermissionDenied,
    /// Malformed argument (path, seek, length).
    Invalid,
    /// No data/space right now on a non-blocking node.
    WouldBlock,
    /// Allocation failure.
    OutOfMemory,
    /// On-disk or in-image structure is damaged.
    CorruptImage,
    /// Device I/O failed.
    IoFailure,
    /// The filesystem does not implement this operation.
    Unsupported,
    /// The open-file table is full.
    TableFull,
}

impl FsError {
    /// The errno delivered to userspace for this error.
    pub fn errno(self) -> Errno {
        match self {
            Self::NotFound => errno::ENOENT,
            Self::AlreadyExists => errno::EEXIST,
            Self::BadHandle => errno::EBADF,
            Self::PermissionDenied => errno::EACCES,
            Self::Invalid => errno::EINVAL,
            Self::WouldBlock => errno::EAGAIN,
            Self::OutOfMemory => errno::ENOMEM,
            Self::CorruptImage => errno::ENOEXEC,
            Self::IoFailure => errno::EIO,
            Self::Unsupported => errno::ENOSYS,
            Self::TableFull => errno::EMFILE,
        }
    }
}

/// Node types carried by inodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Regular file.
    File,
    /// Symbolic link.
    Symlink,
    /// Directory.
    Folder,
    /// Block device.
    BlockDev,
    /// Character device.
    CharDev,
    /// A mounted filesystem root.
    Mountpoint,
    /// Tombstone.
    Invalid,
}

impl NodeType {
    /// Whether path resolution may descend through a node of this type.
    pub fn is_traversable(self) -> bool {
        matches!(self, Self::Folder | Self::Mountpoint)
    }
}

/// Open mode of a file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Read and write.
    ReadWrite,
}

/// Seek origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    /// From the current position.
    Current,
    /// From the end of the file.
    End,
    /// Absolute.
    Set,
}

impl SeekWhence {
    /// Decodes the numeric whence used by the seek syscall.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(Self::Current),
            2 => Some(Self::End),
            3 => Some(Self::Set),
            _ => None,
        }
    }
}

/// Stat block carried on every tnode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    /// Device id of the owning filesystem instance.
    pub dev: i64,
    /// Inode id.
    pub ino: u64,
    /// Type-and-permission bits.
    pub mode: u32,
    /// Size in bytes at last update.
    pub size: usize,
    /// Modification time, nanoseconds since the epoch.
    pub mtime_ns: u64,
}

/// A directory entry as reported to userspace.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Component name.
    pub name: String,
    /// Node type.
    pub kind: NodeType,
    /// Size in bytes.
    pub size: usize,
    /// Modification time, nanoseconds.
    pub mtime_ns: u64,
}

/// Opaque per-node filesystem state, downcast by the owning filesystem.
pub type NodeIdent = Arc<dyn Any + Send + Sync>;

/// A child a filesystem reports during [`FileSystem::refresh`] or
/// [`FileSystem::lookup_path`], materialised into the tree by the VFS.
pub struct ChildSpec {
    /// Component name.
    pub name: String,
    /// Node type.
    pub kind: NodeType,
    /// Size in bytes.
    pub size: usize,
    /// Modification time, nanoseconds.
    pub mtime_ns: u64,
    /// Symlink target, when kind is Symlink.
    pub link: String,
    /// The node's filesystem state.
    pub ident: NodeIdent,
}

/// A per-task open-file handle.
#[derive(Clone)]
pub struct FileDesc {
    /// Absolute path the handle was opened with.
    pub path: String,
    /// Seek position.
    pub seek_pos: usize,
    /// Open mode.
    pub mode: OpenMode,
    /// The named tree edge.
    pub tnode: vfs::TnodeId,
    /// The bound inode.
    pub inode: vfs::InodeId,
}

/// The pluggable filesystem interface.
///
/// Per-node state travels as a [`NodeIdent`]; data-path methods take it
/// directly so the VFS can drop its own lock around potentially blocking
/// calls. Filesystems guard their internals with their own identity locks,
/// nested inside the VFS lock per the kernel lock order.
pub trait FileSystem: Send + Sync {
    /// Filesystem name, used by mount(…, fsname).
    fn name(&self) -> &'static str;

    /// Temporary filesystems (ramfs, ttyfs, pipefs) mount without a
    /// backing device.
    fn is_temporary(&self) -> bool {
        true
    }

    /// Creates the mount-root state. `device` is the block device node's
    /// ident for disk-backed filesystems, `None` for temporary ones.
    fn mount(&self, device: Option<NodeIdent>) -> Result<NodeIdent, FsError>;

    /// Creates backing state for a freshly created node.
    fn mknode(&self, parent: &NodeIdent, name: &str, kind: NodeType)
    -> Result<NodeIdent, FsError>;

    /// Removes the backing state of a node.
    fn rmnode(&self, _parent: &NodeIdent, _name: &str, _ident: &NodeIdent) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    /// Resolves `rel_path` below the mount root for nodes not yet in the
    /// tree, returning the chain of children leading to the target.
    /// Temporary filesystems keep everything in the tree and return
    /// NotFound.
    fn lookup_path(&self, _root: &NodeIdent, _rel_path: &str) -> Result<Vec<ChildSpec>, FsError> {
        Err(FsError::NotFound)
    }

    /// Reads at `offset`. Blocking nodes (TTY) may suspend the caller.
    fn read(&self, ident: &NodeIdent, offset: usize, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes at `offset`.
    fn write(&self, ident: &NodeIdent, offset: usize, buf: &[u8]) -> Result<usize, FsError>;

    /// Persists node metadata after a size-changing write.
    fn sync(&self, _ident: &NodeIdent, _size: usize) -> Result<(), FsError> {
        Ok(())
    }

    /// Enumerates the node's children for materialisation. Idempotent.
    fn refresh(&self, _ident: &NodeIdent) -> Result<Vec<ChildSpec>, FsError> {
        Ok(Vec::new())
    }

    /// Device-specific control.
    fn ioctl(&self, _ident: &NodeIdent, _request: u64, _arg: u64) -> Result<i64, FsError> {
        Err(FsError::Unsupported)
    }
}

/// Sector-addressed block device, the seam between FAT32 and the disk
/// driver (external). Sectors are 512 bytes.
pub trait BlockDevice: Send + Sync {
    /// Reads `buf.len() / 512` sectors starting at `lba`.
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), FsError>;
    /// Writes `buf.len() / 512` sectors starting at `lba`.
    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), FsError>;
    /// Total sector count.
    fn sector_count(&self) -> u64;
}

/// The [`NodeIdent`] carried by BlockDev tree nodes; disk-backed
/// filesystems downcast to it at mount time.
pub struct BlockDeviceIdent(pub Arc<dyn BlockDevice>);

/// Block devices announced by external disk drivers before the VFS
/// mounts run.
static BLOCK_DEVICES: muon_core::sync::SpinLock<Vec<(String, Arc<dyn BlockDevice>)>> =
    muon_core::sync::SpinLock::new(Vec::new());

/// Announces a probed disk. The boot path creates `/dev/<name>` for it
/// and attempts a FAT32 mount under `/disk`.
pub fn register_block_device(name: &str, dev: Arc<dyn BlockDevice>) {
    BLOCK_DEVICES.lock().push((String::from(name), dev));
}

/// Drains the announced devices (used once by the boot path).
pub fn take_block_devices() -> Vec<(String, Arc<dyn BlockDevice>)> {
    core::mem::take(&mut *BLOCK_DEVICES.lock())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_fixed() {
        assert_eq!(FsError::NotFound.errno(), 1043);
        assert_eq!(FsError::AlreadyExists.errno(), 1019);
        assert_eq!(FsError::BadHandle.errno(), 1008);
        assert_eq!(FsError::TableFull.errno(), 1031);
        assert_eq!(FsError::Unsupported.errno(), 1051);
    }

    #[test]
    fn traversable_types() {
        assert!(NodeType::Folder.is_traversable());
        assert!(NodeType::Mountpoint.is_traversable());
        assert!(!NodeType::File.is_traversable());
        assert!(!NodeType::Symlink.is_traversable());
    }

    #[test]
    fn seek_whence_decoding() {
        assert_eq!(SeekWhence::from_raw(1), Some(SeekWhence::Current));
        assert_eq!(SeekWhence::from_raw(2), Some(SeekWhence::End));
        assert_eq!(SeekWhence::from_raw(3), Some(SeekWhence::Set));
        assert_eq!(SeekWhence::from_raw(0), None);
    }
}
