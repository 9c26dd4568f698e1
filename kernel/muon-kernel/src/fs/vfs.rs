//! The VFS tree: tnodes naming inodes, handle tables, mounts.
//!
//! Tnodes and inodes live in index-based arenas inside the [`Vfs`] struct;
//! child → parent references are indices, so the tree has no ownership
//! cycles. Every inode is reachable from the root through exactly one
//! tnode chain (no hard links), and its refcount equals the number of live
//! file descriptors plus one for the tnode naming it.
//!
//! Open handles are per-task: handle = table index + 100. Boot-time and
//! kernel-context opens use a separate kernel-owned table.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::VFS_MIN_HANDLE;

use super::{
    ChildSpec, DirEntry, FileDesc, FileSystem, FsError, NodeIdent, NodeType, OpenMode, SeekWhence,
    Stat, path,
};

/// Arena index of a tnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TnodeId(usize);

/// Arena index of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeId(usize);

/// Follow at most this many symlink hops.
const SYMLINK_DEPTH: usize = 8;

bitflags::bitflags! {
    /// Path resolution behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u8 {
        /// Create the final component if missing.
        const CREATE = 1;
        /// Fail if the final component exists.
        const ERR_ON_EXIST = 2;
    }
}

/// A named edge in the tree.
pub struct Tnode {
    /// Component name.
    pub name: String,
    /// Stat block.
    pub stat: Stat,
    /// The named inode.
    pub inode: InodeId,
    /// Parent inode (None for the root tnode).
    pub parent: Option<InodeId>,
}

/// An index node.
pub struct Inode {
    /// Node type.
    pub kind: NodeType,
    /// Size in bytes.
    pub size: usize,
    /// Permission bits.
    pub perms: u32,
    /// Owner uid.
    pub uid: u32,
    /// Live references: file descriptors plus the naming tnode.
    pub refcount: u32,
    /// Index of the backing filesystem, if any.
    pub fs: Option<usize>,
    /// Filesystem per-node state.
    pub ident: Option<NodeIdent>,
    /// Back-pointer to the mount tnode when this is a mount root.
    pub mountpoint: Option<TnodeId>,
    /// Child tnodes (Folder/Mountpoint only).
    pub children: Vec<TnodeId>,
    /// Symlink target.
    pub link: String,
}

/// A per-task (or kernel) open-file table.
pub type OpenTable = Vec<Option<FileDesc>>;

/// The tree, the registered filesystems and the id counters.
pub struct Vfs {
    tnodes: Vec<Option<Tnode>>,
    inodes: Vec<Option<Inode>>,
    filesystems: Vec<Arc<dyn FileSystem>>,
    root: TnodeId,
    next_dev_id: i64,
    next_ino_id: u64,
    clock: fn() -> u64,
}

impl Vfs {
    /// Creates the tree with a root folder tnode.
    pub fn new(clock: fn() -> u64) -> Self {
        let mut vfs = Self {
            tnodes: Vec::new(),
            inodes: Vec::new(),
            filesystems: Vec::new(),
            root: TnodeId(0),
            next_dev_id: 1,
            next_ino_id: 1,
            clock,
        };
        let inode = vfs.alloc_inode(Inode {
            kind: NodeType::Folder,
            size: 0,
            perms: 0o777,
            uid: 0,
            refcount: 1,
            fs: None,
            ident: None,
            mountpoint: None,
            children: Vec::new(),
            link: String::new(),
        });
        let stat = Stat {
            dev: vfs.new_dev_id(),
            ino: vfs.new_ino_id(),
            mode: 0o777,
            size: 0,
            mtime_ns: 0,
        };
        vfs.root = vfs.alloc_tnode(Tnode {
            name: String::new(),
            stat,
            inode,
            parent: None,
        });
        vfs
    }

    /// Registers a filesystem implementation.
    pub fn register_fs(&mut self, fs: Arc<dyn FileSystem>) {
        self.filesystems.push(fs);
    }

    fn fs_index(&self, name: &str) -> Option<usize> {
        self.filesystems.iter().position(|f| f.name() == name)
    }

    fn new_dev_id(&mut self) -> i64 {
        let id = self.next_dev_id;
        self.next_dev_id += 1;
        id
    }

    fn new_ino_id(&mut self) -> u64 {
        let id = self.next_ino_id;
        self.next_ino_id += 1;
        id
    }

    fn alloc_inode(&mut self, inode: Inode) -> InodeId {
        if let Some(idx) = self.inodes.iter().position(Option::is_none) {
            self.inodes[idx] = Some(inode);
            InodeId(idx)
        } else {
            self.inodes.push(Some(inode));
            InodeId(self.inodes.len() - 1)
        }
    }

    fn alloc_tnode(&mut self, tnode: Tnode) -> TnodeId {
        if let Some(idx) = self.tnodes.iter().position(Option::is_none) {
            self.tnodes[idx] = Some(tnode);
            TnodeId(idx)
        } else {
            self.tnodes.push(Some(tnode));
            TnodeId(self.tnodes.len() - 1)
        }
    }

    /// Shared tnode access.
    pub fn tnode(&self, id: TnodeId) -> &Tnode {
        self.tnodes[id.0].as_ref().expect("stale tnode id")
    }

    fn tnode_mut(&mut self, id: TnodeId) -> &mut Tnode {
        self.tnodes[id.0].as_mut().expect("stale tnode id")
    }

    /// Shared inode access.
    pub fn inode(&self, id: InodeId) -> &Inode {
        self.inodes[id.0].as_ref().expect("stale inode id")
    }

    fn inode_mut(&mut self, id: InodeId) -> &mut Inode {
        self.inodes[id.0].as_mut().expect("stale inode id")
    }

    fn find_child(&self, parent: InodeId, name: &str) -> Option<TnodeId> {
        self.inode(parent)
            .children
            .iter()
            .copied()
            .find(|&t| self.tnode(t).name == name)
    }

    /// Walks `path` through the tree.
    ///
    /// With [`LookupFlags::CREATE`], a missing final component is created
    /// as `create_type` under a traversable parent, with its mode and
    /// mtime stamped from the clock and the parent's filesystem asked for
    /// backing state. With [`LookupFlags::ERR_ON_EXIST`], an existing
    /// final component is an error.
    pub fn path_to_node(
        &mut self,
        p: &str,
        flags: LookupFlags,
        create_type: NodeType,
    ) -> Result<TnodeId, FsError> {
        let parts = path::components(p)?;
        let mut current = self.root;

        for (depth, part) in parts.iter().enumerate() {
            let is_last = depth == parts.len() - 1;
            let inode_id = self.tnode(current).inode;
            if !self.inode(inode_id).kind.is_traversable() {
                return Err(FsError::NotFound);
            }
            match self.find_child(inode_id, part) {
                Some(child) => {
                    if is_last && flags.contains(LookupFlags::ERR_ON_EXIST) {
                        return Err(FsError::AlreadyExists);
                    }
                    current = child;
                }
                None if is_last && flags.contains(LookupFlags::CREATE) => {
                    return self.create_child(inode_id, part, create_type, None, 0, 0o777);
                }
                None => return Err(FsError::NotFound),
            }
        }
        Ok(current)
    }

    /// Creates a child node under `parent`, asking the parent's filesystem
    /// for backing state unless `ident` is already provided.
    fn create_child(
        &mut self,
        parent: InodeId,
        name: &str,
        kind: NodeType,
        ident: Option<NodeIdent>,
        size: usize,
        perms: u32,
    ) -> Result<TnodeId, FsError> {
        let fs_idx = self.inode(parent).fs;
        let ident = match ident {
            Some(ident) => Some(ident),
            None => match fs_idx {
                Some(idx) => {
                    let fs = self.filesystems[idx].clone();
                    let parent_ident = self
                        .inode(parent)
                        .ident
                        .clone()
                        .ok_or(FsError::Invalid)?;
                    Some(fs.mknode(&parent_ident, name, kind)?)
                }
                None => None,
            },
        };

        let now = (self.clock)();
        let inode = self.alloc_inode(Inode {
            kind,
            size,
            perms,
            uid: 0,
            refcount: 1,
            fs: fs_idx,
            ident,
            mountpoint: None,
            children: Vec::new(),
            link: String::new(),
        });
        let stat = Stat {
            dev: self.new_dev_id(),
            ino: self.new_ino_id(),
            mode: perms,
            size,
            mtime_ns: now,
        };
        let tnode = self.alloc_tnode(Tnode {
            name: name.to_string(),
            stat,
            inode,
            parent: Some(parent),
        });
        self.inode_mut(parent).children.push(tnode);
        Ok(tnode)
    }

    /// Creates a node of the given type at `path`.
    pub fn create(&mut self, p: &str, kind: NodeType) -> Result<TnodeId, FsError> {
        self.path_to_node(p, LookupFlags::CREATE | LookupFlags::ERR_ON_EXIST, kind)
    }

    /// Sets the symlink target of an existing Symlink node.
    pub fn set_link(&mut self, node: TnodeId, target: &str) -> Result<(), FsError> {
        let inode_id = self.tnode(node).inode;
        let inode = self.inode_mut(inode_id);
        if inode.kind != NodeType::Symlink {
            return Err(FsError::Invalid);
        }
        inode.link = target.to_string();
        Ok(())
    }

    /// Resolves a path for open: tree walk first, then a disk-backed
    /// filesystem's [`FileSystem::lookup_path`] to materialise nodes the
    /// tree has not seen yet, then symlink following.
    fn resolve_for_open(&mut self, p: &str) -> Result<TnodeId, FsError> {
        let mut current = p.to_string();
        for _ in 0..SYMLINK_DEPTH {
            let node = match self.path_to_node(&current, LookupFlags::empty(), NodeType::Invalid) {
                Ok(node) => node,
                Err(FsError::NotFound) => self.materialize_from_fs(&current)?,
                Err(e) => return Err(e),
            };
            let inode = self.inode(self.tnode(node).inode);
            if inode.kind != NodeType::Symlink {
                return Ok(node);
            }
            let (parent, _) = path::split_parent(&current)?;
            current = path::absolutize(parent, &inode.link);
        }
        Err(FsError::Invalid)
    }

    /// Walks as far as the tree goes, then asks the deepest mountpoint's
    /// filesystem to resolve the remainder and grafts the returned chain
    /// into the tree.
    fn materialize_from_fs(&mut self, p: &str) -> Result<TnodeId, FsError> {
        let parts = path::components(p)?;
        let mut current = self.root;
        let mut mount: Option<(usize, NodeIdent, InodeId, usize)> = None;

        for (depth, part) in parts.iter().enumerate() {
            let inode_id = self.tnode(current).inode;
            let inode = self.inode(inode_id);
            if inode.kind == NodeType::Mountpoint {
                if let (Some(fs_idx), Some(ident)) = (inode.fs, inode.ident.clone()) {
                    if !self.filesystems[fs_idx].is_temporary() {
                        mount = Some((fs_idx, ident, inode_id, depth));
                    }
                }
            }
            match self.find_child(inode_id, part) {
                Some(child) => current = child,
                None => {
                    let (fs_idx, ident, mount_inode, mount_depth) =
                        mount.ok_or(FsError::NotFound)?;
                    let rel = parts[mount_depth..].join("/");
                    let fs = self.filesystems[fs_idx].clone();
                    let chain = fs.lookup_path(&ident, &rel)?;
                    if chain.is_empty() {
                        return Err(FsError::NotFound);
                    }
                    let mut parent = mount_inode;
                    let mut node = None;
                    for spec in chain {
                        let t = match self.find_child(parent, &spec.name) {
                            Some(existing) => existing,
                            None => self.graft_child(parent, spec, fs_idx)?,
                        };
                        parent = self.tnode(t).inode;
                        node = Some(t);
                    }
                    return node.ok_or(FsError::NotFound);
                }
            }
        }
        Ok(current)
    }

    fn graft_child(
        &mut self,
        parent: InodeId,
        spec: ChildSpec,
        fs_idx: usize,
    ) -> Result<TnodeId, FsError> {
        let node = self.create_child(
            parent,
            &spec.name,
            spec.kind,
            Some(spec.ident),
            spec.size,
            0o777,
        )?;
        self.tnode_mut(node).stat.mtime_ns = spec.mtime_ns;
        if spec.kind == NodeType::Symlink {
            let inode_id = self.tnode(node).inode;
            self.inode_mut(inode_id).link = spec.link;
        }
        Ok(node)
    }

    /// Opens `path` into a handle in `table`.
    pub fn open(
        &mut self,
        table: &mut OpenTable,
        p: &str,
        mode: OpenMode,
    ) -> Result<i64, FsError> {
        let node = self.resolve_for_open(p)?;
        let inode_id = self.tnode(node).inode;

        // Closed slots are reused first; otherwise the table grows with
        // demand. Only exhausting the handle space itself is an error.
        let slot = match table.iter().position(Option::is_none) {
            Some(idx) => idx,
            None => {
                if table.len() as u64 >= (i64::MAX - VFS_MIN_HANDLE) as u64 {
                    return Err(FsError::TableFull);
                }
                table.push(None);
                table.len() - 1
            }
        };

        self.inode_mut(inode_id).refcount += 1;
        table[slot] = Some(FileDesc {
            path: p.to_string(),
            seek_pos: 0,
            mode,
            tnode: node,
            inode: inode_id,
        });
        Ok(slot as i64 + VFS_MIN_HANDLE)
    }

    fn desc<'t>(&self, table: &'t OpenTable, handle: i64) -> Result<&'t FileDesc, FsError> {
        let idx = usize::try_from(handle - VFS_MIN_HANDLE).map_err(|_| FsError::BadHandle)?;
        table
            .get(idx)
            .and_then(|slot| slot.as_ref())
            .ok_or(FsError::BadHandle)
    }

    fn desc_mut<'t>(
        &self,
        table: &'t mut OpenTable,
        handle: i64,
    ) -> Result<&'t mut FileDesc, FsError> {
        let idx = usize::try_from(handle - VFS_MIN_HANDLE).map_err(|_| FsError::BadHandle)?;
        table
            .get_mut(idx)
            .and_then(|slot| slot.as_mut())
            .ok_or(FsError::BadHandle)
    }

    /// Closes a handle, dropping the descriptor's inode reference.
    pub fn close(&mut self, table: &mut OpenTable, handle: i64) -> Result<(), FsError> {
        let idx = usize::try_from(handle - VFS_MIN_HANDLE).map_err(|_| FsError::BadHandle)?;
        let desc = table
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or(FsError::BadHandle)?;
        self.drop_reference(desc.inode);
        Ok(())
    }

    /// Drops one descriptor reference on an inode (close or task reap).
    pub fn drop_reference(&mut self, inode: InodeId) {
        let node = self.inode_mut(inode);
        node.refcount = node.refcount.saturating_sub(1);
    }

    /// Adds one descriptor reference per live entry (fork/exec
    /// inheritance).
    pub fn retain_table(&mut self, table: &OpenTable) {
        for desc in table.iter().flatten() {
            self.inode_mut(desc.inode).refcount += 1;
        }
    }

    /// Reads from a handle at its seek position. Truncates at EOF;
    /// reading at EOF returns 0.
    pub fn read(
        &mut self,
        table: &mut OpenTable,
        handle: i64,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        let desc = self.desc(table, handle)?;
        if desc.mode == OpenMode::Write {
            return Err(FsError::PermissionDenied);
        }
        let (inode_id, seek) = (desc.inode, desc.seek_pos);
        let inode = self.inode(inode_id);
        let size = inode.size;

        let len = if inode.kind == NodeType::File {
            if seek >= size {
                return Ok(0);
            }
            buf.len().min(size - seek)
        } else {
            buf.len()
        };

        let fs = inode.fs.map(|i| self.filesystems[i].clone());
        let ident = inode.ident.clone();
        let n = match (fs, ident) {
            (Some(fs), Some(ident)) => fs.read(&ident, seek, &mut buf[..len])?,
            _ => return Err(FsError::Unsupported),
        };
        self.desc_mut(table, handle)?.seek_pos += n;
        Ok(n)
    }

    /// Writes at the handle's seek position, growing the file size and
    /// syncing filesystem metadata when it grows.
    pub fn write(
        &mut self,
        table: &mut OpenTable,
        handle: i64,
        buf: &[u8],
    ) -> Result<usize, FsError> {
        let desc = self.desc(table, handle)?;
        if desc.mode == OpenMode::Read {
            return Err(FsError::PermissionDenied);
        }
        let (inode_id, tnode_id, seek) = (desc.inode, desc.tnode, desc.seek_pos);
        let inode = self.inode(inode_id);
        let fs = inode.fs.map(|i| self.filesystems[i].clone());
        let ident = inode.ident.clone();

        let n = match (fs.clone(), ident.clone()) {
            (Some(fs), Some(ident)) => fs.write(&ident, seek, buf)?,
            _ => return Err(FsError::Unsupported),
        };

        self.desc_mut(table, handle)?.seek_pos += n;
        let end = seek + n;
        let grew = {
            let inode = self.inode(inode_id);
            inode.kind == NodeType::File && end > inode.size
        };
        if grew {
            self.inode_mut(inode_id).size = end;
            self.tnode_mut(tnode_id).stat.size = end;
            if let (Some(fs), Some(ident)) = (fs, ident) {
                fs.sync(&ident, end)?;
            }
        }
        Ok(n)
    }

    /// Repositions a handle. Out-of-range targets leave the position
    /// unchanged.
    pub fn seek(
        &mut self,
        table: &mut OpenTable,
        handle: i64,
        offset: i64,
        whence: SeekWhence,
    ) -> Result<i64, FsError> {
        let size = self.inode(self.desc(table, handle)?.inode).size as i64;
        let desc = self.desc_mut(table, handle)?;
        let target = match whence {
            SeekWhence::Set => offset,
            SeekWhence::Current => desc.seek_pos as i64 + offset,
            SeekWhence::End => size + offset,
        };
        if target < 0 || target > size {
            return Err(FsError::Invalid);
        }
        desc.seek_pos = target as usize;
        Ok(target)
    }

    /// Current position of a handle.
    pub fn tell(&self, table: &OpenTable, handle: i64) -> Result<i64, FsError> {
        Ok(self.desc(table, handle)?.seek_pos as i64)
    }

    /// Size of the file behind a handle.
    pub fn file_size(&self, table: &OpenTable, handle: i64) -> Result<usize, FsError> {
        Ok(self.inode(self.desc(table, handle)?.inode).size)
    }

    /// Mounts `fsname` at `mount_path`, which must be an existing empty
    /// folder. Non-temporary filesystems take the block device at
    /// `device_path`.
    pub fn mount(
        &mut self,
        device_path: Option<&str>,
        mount_path: &str,
        fsname: &str,
    ) -> Result<(), FsError> {
        let fs_idx = self.fs_index(fsname).ok_or(FsError::NotFound)?;
        let fs = self.filesystems[fs_idx].clone();

        let device_ident = if fs.is_temporary() {
            None
        } else {
            let dev_path = device_path.ok_or(FsError::Invalid)?;
            let dev_node = self.path_to_node(dev_path, LookupFlags::empty(), NodeType::Invalid)?;
            let dev_inode = self.inode(self.tnode(dev_node).inode);
            if dev_inode.kind != NodeType::BlockDev {
                return Err(FsError::Invalid);
            }
            Some(dev_inode.ident.clone().ok_or(FsError::Invalid)?)
        };

        let target = self.path_to_node(mount_path, LookupFlags::empty(), NodeType::Invalid)?;
        let target_inode_id = self.tnode(target).inode;
        {
            let target_inode = self.inode(target_inode_id);
            if target_inode.kind != NodeType::Folder || !target_inode.children.is_empty() {
                return Err(FsError::Invalid);
            }
        }

        let root_ident = fs.mount(device_ident)?;
        let inode = self.inode_mut(target_inode_id);
        inode.kind = NodeType::Mountpoint;
        inode.fs = Some(fs_idx);
        inode.ident = Some(root_ident);
        inode.mountpoint = Some(target);
        Ok(())
    }

    /// Re-enumerates the children of the directory behind `handle`,
    /// materialising newly discovered ones. Idempotent.
    pub fn refresh(&mut self, table: &OpenTable, handle: i64) -> Result<(), FsError> {
        let inode_id = self.desc(table, handle)?.inode;
        let inode = self.inode(inode_id);
        if !inode.kind.is_traversable() {
            return Err(FsError::Invalid);
        }
        let (fs_idx, ident) = match (inode.fs, inode.ident.clone()) {
            (Some(f), Some(i)) => (f, i),
            _ => return Ok(()),
        };
        let children = self.filesystems[fs_idx].refresh(&ident)?;
        for spec in children {
            if self.find_child(inode_id, &spec.name).is_none() {
                self.graft_child(inode_id, spec, fs_idx)?;
            }
        }
        Ok(())
    }

    /// Reads one directory entry at the handle's position and advances it.
    /// Returns `None` past the end.
    pub fn getdent(
        &mut self,
        table: &mut OpenTable,
        handle: i64,
    ) -> Result<Option<DirEntry>, FsError> {
        let desc = self.desc(table, handle)?;
        let (inode_id, pos) = (desc.inode, desc.seek_pos);
        let inode = self.inode(inode_id);
        if !inode.kind.is_traversable() {
            return Err(FsError::Invalid);
        }
        let Some(&child) = inode.children.get(pos) else {
            return Ok(None);
        };
        let tnode = self.tnode(child);
        let entry = DirEntry {
            name: tnode.name.clone(),
            kind: self.inode(tnode.inode).kind,
            size: self.inode(tnode.inode).size,
            mtime_ns: tnode.stat.mtime_ns,
        };
        self.desc_mut(table, handle)?.seek_pos += 1;
        Ok(Some(entry))
    }

    /// Changes the permission bits of the node behind `handle`.
    pub fn chmod(&mut self, table: &OpenTable, handle: i64, perms: u32) -> Result<(), FsError> {
        let desc = self.desc(table, handle)?;
        if desc.mode == OpenMode::Read {
            return Err(FsError::PermissionDenied);
        }
        let inode_id = desc.inode;
        self.inode_mut(inode_id).perms = perms;
        Ok(())
    }

    /// Dispatches an ioctl to the node's filesystem.
    pub fn ioctl(
        &mut self,
        table: &OpenTable,
        handle: i64,
        request: u64,
        arg: u64,
    ) -> Result<i64, FsError> {
        let inode = self.inode(self.desc(table, handle)?.inode);
        match (inode.fs, inode.ident.clone()) {
            (Some(fs), Some(ident)) => self.filesystems[fs].ioctl(&ident, request, arg),
            _ => Err(FsError::Unsupported),
        }
    }

    /// Removes the node at `path`. Folders must be empty.
    pub fn unlink(&mut self, p: &str) -> Result<(), FsError> {
        let node = self.path_to_node(p, LookupFlags::empty(), NodeType::Invalid)?;
        let tnode = self.tnode(node);
        let inode_id = tnode.inode;
        let parent = tnode.parent.ok_or(FsError::PermissionDenied)?;
        let name = tnode.name.clone();

        let inode = self.inode(inode_id);
        if inode.kind.is_traversable() && !inode.children.is_empty() {
            return Err(FsError::Invalid);
        }
        if let (Some(fs_idx), Some(ident)) = (inode.fs, inode.ident.clone()) {
            let parent_ident = self.inode(parent).ident.clone();
            if let Some(parent_ident) = parent_ident {
                self.filesystems[fs_idx].rmnode(&parent_ident, &name, &ident)?;
            }
        }

        self.inode_mut(parent).children.retain(|&c| c != node);
        let refs = {
            let inode = self.inode_mut(inode_id);
            inode.refcount = inode.refcount.saturating_sub(1);
            inode.refcount
        };
        if refs == 0 {
            self.inodes[inode_id.0] = None;
        }
        self.tnodes[node.0] = None;
        Ok(())
    }

    /// Overrides a node's recorded mtime and permission bits (used when
    /// materialising archive entries with their own timestamps).
    pub fn stamp(&mut self, node: TnodeId, mtime_ns: u64, perms: u32) {
        self.tnode_mut(node).stat.mtime_ns = mtime_ns;
        self.tnode_mut(node).stat.mode = perms;
        let inode_id = self.tnode(node).inode;
        self.inode_mut(inode_id).perms = perms;
    }

    /// The filesystem state of a node.
    pub fn node_ident(&self, node: TnodeId) -> Option<NodeIdent> {
        self.inode(self.tnode(node).inode).ident.clone()
    }

    /// Attaches filesystem state to a node created without one (device
    /// nodes announced by drivers).
    pub fn set_node_ident(&mut self, node: TnodeId, ident: NodeIdent) {
        let inode_id = self.tnode(node).inode;
        self.inode_mut(inode_id).ident = Some(ident);
    }

    /// Overrides a node's size after out-of-band population.
    pub fn set_size(&mut self, node: TnodeId, size: usize) {
        let inode_id = self.tnode(node).inode;
        self.inode_mut(inode_id).size = size;
        self.tnode_mut(node).stat.size = size;
    }

    /// The inode currently bound to a handle, with its filesystem and
    /// state — the kernel glue uses this to route blocking reads outside
    /// the VFS lock.
    #[allow(clippy::type_complexity)]
    pub fn handle_target(
        &self,
        table: &OpenTable,
        handle: i64,
    ) -> Result<(Option<Arc<dyn FileSystem>>, Option<NodeIdent>, NodeType), FsError> {
        let inode = self.inode(self.desc(table, handle)?.inode);
        Ok((
            inode.fs.map(|i| self.filesystems[i].clone()),
            inode.ident.clone(),
            inode.kind,
        ))
    }

    /// Refcount probe for tests and invariant checks.
    pub fn refcount_of(&self, table: &OpenTable, handle: i64) -> Result<u32, FsError> {
        Ok(self.inode(self.desc(table, handle)?.inode).refcount)
    }

    /// True when every inode with a positive refcount is reachable from
    /// the root.
    pub fn all_reachable(&self) -> bool {
        let mut reachable = alloc::vec![false; self.inodes.len()];
        let mut stack = alloc::vec![self.tnode(self.root).inode];
        while let Some(InodeId(idx)) = stack.pop() {
            if reachable[idx] {
                continue;
            }
            reachable[idx] = true;
            if let Some(inode) = &self.inodes[idx] {
                for &child in &inode.children {
                    stack.push(self.tnode(child).inode);
                }
            }
        }
        self.inodes.iter().enumerate().all(|(idx, slot)| {
            slot.as_ref()
                .is_none_or(|inode| inode.refcount == 0 || reachable[idx])
        })
    }
}

// ---------------------------------------------------------------------------
// Kernel glue: global instance and per-task handle routing
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod kernel_glue {
    use muon_core::sync::SpinLock;

    use super::*;
    use crate::fs::FileDesc;

    static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

    /// Open-file table for boot-time and kernel-task handles.
    static KERNEL_TABLE: SpinLock<OpenTable> = SpinLock::new(Vec::new());

    /// Creates the global VFS with the wall-clock timestamp source.
    pub fn init() {
        let mut vfs = VFS.lock();
        assert!(vfs.is_none(), "VFS already initialized");
        *vfs = Some(Vfs::new(crate::time::wall_nanos));
    }

    /// Runs `f` with the global VFS locked.
    ///
    /// # Panics
    ///
    /// Panics if the VFS has not been initialized.
    pub fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
        let mut vfs = VFS.lock();
        f(vfs.as_mut().expect("VFS not initialized"))
    }

    /// Runs `f` with the calling context's open-file table: the current
    /// task's when scheduling is live, the kernel table otherwise.
    ///
    /// The scheduler lock is held only long enough to fetch the table
    /// pointer, not across filesystem I/O. The pointer stays valid and
    /// unaliased: the task is boxed until reaped, only ever touches its
    /// own table from its own syscall context (fork/exec read the parent
    /// table while the parent is suspended in that very call), and the
    /// VFS lock serializes the open-files vector per the kernel lock
    /// assignment.
    fn with_table<R>(f: impl FnOnce(&mut OpenTable) -> R) -> R {
        let ptr = crate::sched::with_current(|task| core::ptr::from_mut(&mut task.open_files));
        match ptr {
            // SAFETY: See above.
            Some(table) => f(unsafe { &mut *table }),
            None => f(&mut KERNEL_TABLE.lock()),
        }
    }

    /// Opens `path` for the calling context.
    pub fn open(path: &str, mode: OpenMode) -> Result<i64, FsError> {
        with_table(|table| with_vfs(|vfs| vfs.open(table, path, mode)))
    }

    /// Closes a handle of the calling context.
    pub fn close(handle: i64) -> Result<(), FsError> {
        with_table(|table| with_vfs(|vfs| vfs.close(table, handle)))
    }

    /// Reads from a handle. TTY-backed handles block on the event bus
    /// outside the VFS lock.
    pub fn read(handle: i64, buf: &mut [u8]) -> Result<usize, FsError> {
        let blocking =
            with_table(|table| with_vfs(|vfs| vfs.handle_target(table, handle)))?;
        if let (Some(fs), Some(ident), _) = &blocking {
            if fs.name() == "ttyfs" {
                return fs.read(ident, 0, buf);
            }
        }
        with_table(|table| with_vfs(|vfs| vfs.read(table, handle, buf)))
    }

    /// Writes to a handle. TTY writes render to the console outside the
    /// VFS lock.
    pub fn write(handle: i64, buf: &[u8]) -> Result<usize, FsError> {
        let target = with_table(|table| with_vfs(|vfs| vfs.handle_target(table, handle)))?;
        if let (Some(fs), Some(ident), _) = &target {
            if fs.name() == "ttyfs" {
                return fs.write(ident, 0, buf);
            }
        }
        with_table(|table| with_vfs(|vfs| vfs.write(table, handle, buf)))
    }

    /// Seeks a handle.
    pub fn seek(handle: i64, offset: i64, whence: SeekWhence) -> Result<i64, FsError> {
        with_table(|table| with_vfs(|vfs| vfs.seek(table, handle, offset, whence)))
    }

    /// Current position of a handle.
    pub fn tell(handle: i64) -> Result<i64, FsError> {
        with_table(|table| with_vfs(|vfs| vfs.tell(table, handle)))
    }

    /// Size of the file behind a handle.
    pub fn file_size(handle: i64) -> Result<usize, FsError> {
        with_table(|table| with_vfs(|vfs| vfs.file_size(table, handle)))
    }

    /// Refreshes the directory behind a handle.
    pub fn refresh(handle: i64) -> Result<(), FsError> {
        with_table(|table| with_vfs(|vfs| vfs.refresh(table, handle)))
    }

    /// Reads the next directory entry of a handle.
    pub fn getdent(handle: i64) -> Result<Option<DirEntry>, FsError> {
        with_table(|table| with_vfs(|vfs| vfs.getdent(table, handle)))
    }

    /// Dispatches an ioctl.
    pub fn ioctl(handle: i64, request: u64, arg: u64) -> Result<i64, FsError> {
        with_table(|table| with_vfs(|vfs| vfs.ioctl(table, handle, request, arg)))
    }

    /// Mounts a filesystem (see [`Vfs::mount`]).
    pub fn mount(
        device_path: Option<&str>,
        mount_path: &str,
        fsname: &str,
    ) -> Result<(), FsError> {
        with_vfs(|vfs| vfs.mount(device_path, mount_path, fsname))
    }

    /// Drops the inode reference of a descriptor owned by a reaped task.
    pub fn release_desc(desc: FileDesc) {
        with_vfs(|vfs| vfs.drop_reference(desc.inode));
    }

    /// Bumps inode refcounts for every descriptor in a duplicated table.
    pub fn retain_descs(table: &OpenTable) {
        with_vfs(|vfs| vfs.retain_table(table));
    }
}

#[cfg(target_os = "none")]
pub use kernel_glue::{
    close, file_size, getdent, init, ioctl, mount, open, read, refresh, release_desc,
    retain_descs, seek, tell, with_vfs, write,
};

#[cfg(test)]
mod tests {
    use super::super::ramfs::RamFs;
    use super::*;

    fn test_clock() -> u64 {
        777_000
    }

    fn fresh() -> (Vfs, OpenTable) {
        let mut vfs = Vfs::new(test_clock);
        vfs.register_fs(Arc::new(RamFs::new()));
        vfs.mount(None, "/", "ramfs").unwrap();
        (vfs, Vec::new())
    }

    #[test]
    fn create_open_write_read_roundtrip() {
        let (mut vfs, mut table) = fresh();
        vfs.create("/motd", NodeType::File).unwrap();
        let h = vfs.open(&mut table, "/motd", OpenMode::ReadWrite).unwrap();
        assert_eq!(h, VFS_MIN_HANDLE);

        assert_eq!(vfs.write(&mut table, h, b"hello muon").unwrap(), 10);
        assert_eq!(vfs.file_size(&table, h).unwrap(), 10);

        vfs.seek(&mut table, h, 0, SeekWhence::Set).unwrap();
        let mut buf = [0u8; 16];
        let n = vfs.read(&mut table, h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello muon");
        // At EOF, reads return 0.
        assert_eq!(vfs.read(&mut table, h, &mut buf).unwrap(), 0);
    }

    #[test]
    fn open_close_restores_refcount() {
        let (mut vfs, mut table) = fresh();
        vfs.create("/f", NodeType::File).unwrap();
        let h = vfs.open(&mut table, "/f", OpenMode::Read).unwrap();
        let during = vfs.refcount_of(&table, h).unwrap();
        assert_eq!(during, 2); // tnode + descriptor
        vfs.close(&mut table, h).unwrap();
        let node = vfs.path_to_node("/f", LookupFlags::empty(), NodeType::Invalid).unwrap();
        assert_eq!(vfs.inode(vfs.tnode(node).inode).refcount, 1);
    }

    #[test]
    fn missing_paths_and_create_flags() {
        let (mut vfs, mut table) = fresh();
        assert_eq!(
            vfs.open(&mut table, "/absent", OpenMode::Read).unwrap_err(),
            FsError::NotFound
        );
        vfs.create("/dir", NodeType::Folder).unwrap();
        assert_eq!(
            vfs.create("/dir", NodeType::Folder).unwrap_err(),
            FsError::AlreadyExists
        );
        // Created nodes carry the clock timestamp.
        let node = vfs.path_to_node("/dir", LookupFlags::empty(), NodeType::Invalid).unwrap();
        assert_eq!(vfs.tnode(node).stat.mtime_ns, test_clock());
    }

    #[test]
    fn intermediate_components_must_exist() {
        let (mut vfs, _) = fresh();
        assert_eq!(
            vfs.path_to_node("/no/such/file", LookupFlags::CREATE, NodeType::File)
                .unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn seek_bounds_checked() {
        let (mut vfs, mut table) = fresh();
        vfs.create("/f", NodeType::File).unwrap();
        let h = vfs.open(&mut table, "/f", OpenMode::ReadWrite).unwrap();
        vfs.write(&mut table, h, b"0123456789").unwrap();

        assert_eq!(vfs.seek(&mut table, h, 4, SeekWhence::Set).unwrap(), 4);
        assert_eq!(vfs.seek(&mut table, h, 2, SeekWhence::Current).unwrap(), 6);
        assert_eq!(vfs.seek(&mut table, h, -1, SeekWhence::End).unwrap(), 9);
        // Out of range leaves the position unchanged.
        assert_eq!(
            vfs.seek(&mut table, h, 11, SeekWhence::Set).unwrap_err(),
            FsError::Invalid
        );
        assert_eq!(vfs.seek(&mut table, h, 0, SeekWhence::Current).unwrap(), 9);
    }

    #[test]
    fn seek_then_tell_reports_the_position() {
        let (mut vfs, mut table) = fresh();
        vfs.create("/f", NodeType::File).unwrap();
        let h = vfs.open(&mut table, "/f", OpenMode::ReadWrite).unwrap();
        vfs.write(&mut table, h, b"0123456789").unwrap();

        // seek(h, k, SET); tell(h) = k for every in-range k.
        for k in [0i64, 1, 5, 10] {
            vfs.seek(&mut table, h, k, SeekWhence::Set).unwrap();
            assert_eq!(vfs.tell(&table, h).unwrap(), k);
        }
        // An out-of-range seek leaves the position unchanged.
        assert!(vfs.seek(&mut table, h, 11, SeekWhence::Set).is_err());
        assert_eq!(vfs.tell(&table, h).unwrap(), 10);
        assert!(vfs.seek(&mut table, h, -1, SeekWhence::Set).is_err());
        assert_eq!(vfs.tell(&table, h).unwrap(), 10);

        assert_eq!(vfs.tell(&table, 9999).unwrap_err(), FsError::BadHandle);
    }

    #[test]
    fn handle_table_grows_with_demand_and_reuses_slots() {
        let (mut vfs, mut table) = fresh();
        vfs.create("/f", NodeType::File).unwrap();

        // Handles always satisfy handle = VFS_MIN_HANDLE + table index;
        // the table itself grows with demand.
        let handles: Vec<i64> = (0..40)
            .map(|_| vfs.open(&mut table, "/f", OpenMode::Read).unwrap())
            .collect();
        for (idx, &h) in handles.iter().enumerate() {
            assert_eq!(h, VFS_MIN_HANDLE + idx as i64);
        }
        assert_eq!(table.len(), 40);

        // A closed slot is reused before the table grows again.
        vfs.close(&mut table, VFS_MIN_HANDLE + 7).unwrap();
        let reused = vfs.open(&mut table, "/f", OpenMode::Read).unwrap();
        assert_eq!(reused, VFS_MIN_HANDLE + 7);
        assert_eq!(table.len(), 40);
    }

    #[test]
    fn mount_requires_empty_folder() {
        let (mut vfs, _) = fresh();
        vfs.create("/mnt", NodeType::Folder).unwrap();
        vfs.create("/mnt/busy", NodeType::File).unwrap();
        assert_eq!(
            vfs.mount(None, "/mnt", "ramfs").unwrap_err(),
            FsError::Invalid
        );
        vfs.create("/mnt2", NodeType::Folder).unwrap();
        vfs.mount(None, "/mnt2", "ramfs").unwrap();
        let node = vfs.path_to_node("/mnt2", LookupFlags::empty(), NodeType::Invalid).unwrap();
        assert_eq!(vfs.inode(vfs.tnode(node).inode).kind, NodeType::Mountpoint);
    }

    #[test]
    fn getdent_enumerates_children() {
        let (mut vfs, mut table) = fresh();
        vfs.create("/d", NodeType::Folder).unwrap();
        vfs.create("/d/a", NodeType::File).unwrap();
        vfs.create("/d/b", NodeType::Folder).unwrap();
        let h = vfs.open(&mut table, "/d", OpenMode::Read).unwrap();
        let first = vfs.getdent(&mut table, h).unwrap().unwrap();
        let second = vfs.getdent(&mut table, h).unwrap().unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(first.kind, NodeType::File);
        assert_eq!(second.name, "b");
        assert!(vfs.getdent(&mut table, h).unwrap().is_none());
    }

    #[test]
    fn unlink_removes_and_folders_must_be_empty() {
        let (mut vfs, _) = fresh();
        vfs.create("/d", NodeType::Folder).unwrap();
        vfs.create("/d/f", NodeType::File).unwrap();
        assert_eq!(vfs.unlink("/d").unwrap_err(), FsError::Invalid);
        vfs.unlink("/d/f").unwrap();
        vfs.unlink("/d").unwrap();
        assert!(matches!(
            vfs.path_to_node("/d", LookupFlags::empty(), NodeType::Invalid),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn symlinks_resolve_on_open() {
        let (mut vfs, mut table) = fresh();
        vfs.create("/target", NodeType::File).unwrap();
        let link = vfs.create("/alias", NodeType::Symlink).unwrap();
        vfs.set_link(link, "/target").unwrap();
        let h = vfs.open(&mut table, "/alias", OpenMode::ReadWrite).unwrap();
        vfs.write(&mut table, h, b"via link").unwrap();

        let mut table2 = Vec::new();
        let h2 = vfs.open(&mut table2, "/target", OpenMode::Read).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(vfs.read(&mut table2, h2, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"via link");
    }

    /// A disk-like filesystem that resolves paths on demand, standing in
    /// for FAT32 in materialisation tests.
    struct FakeDiskFs;

    struct FakeDiskNode(#[allow(dead_code)] &'static str);

    impl super::super::FileSystem for FakeDiskFs {
        fn name(&self) -> &'static str {
            "fakedisk"
        }

        fn is_temporary(&self) -> bool {
            false
        }

        fn mount(&self, _device: Option<NodeIdent>) -> Result<NodeIdent, FsError> {
            Ok(Arc::new(FakeDiskNode("root")))
        }

        fn mknode(
            &self,
            _parent: &NodeIdent,
            _name: &str,
            _kind: NodeType,
        ) -> Result<NodeIdent, FsError> {
            Ok(Arc::new(FakeDiskNode("fresh")))
        }

        fn lookup_path(
            &self,
            _root: &NodeIdent,
            rel_path: &str,
        ) -> Result<alloc::vec::Vec<ChildSpec>, FsError> {
            if rel_path != "sub/data.txt" {
                return Err(FsError::NotFound);
            }
            Ok(alloc::vec![
                ChildSpec {
                    name: String::from("sub"),
                    kind: NodeType::Folder,
                    size: 0,
                    mtime_ns: 5,
                    link: String::new(),
                    ident: Arc::new(FakeDiskNode("sub")),
                },
                ChildSpec {
                    name: String::from("data.txt"),
                    kind: NodeType::File,
                    size: 9,
                    mtime_ns: 6,
                    link: String::new(),
                    ident: Arc::new(FakeDiskNode("data")),
                },
            ])
        }

        fn read(
            &self,
            _ident: &NodeIdent,
            offset: usize,
            buf: &mut [u8],
        ) -> Result<usize, FsError> {
            let data = b"disk data";
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn write(
            &self,
            _ident: &NodeIdent,
            _offset: usize,
            _buf: &[u8],
        ) -> Result<usize, FsError> {
            Err(FsError::Unsupported)
        }
    }

    #[test]
    fn disk_paths_materialise_through_lookup() {
        let (mut vfs, mut table) = fresh();
        vfs.register_fs(Arc::new(FakeDiskFs));
        vfs.create("/dev", NodeType::Folder).unwrap();
        let dev = vfs.create("/dev/disk0", NodeType::BlockDev).unwrap();
        // The fake filesystem ignores the device; give the node some state
        // so mount() finds an ident.
        vfs.set_node_ident(dev, Arc::new(FakeDiskNode("dev")));
        vfs.create("/mnt", NodeType::Folder).unwrap();
        vfs.mount(Some("/dev/disk0"), "/mnt", "fakedisk").unwrap();

        // Nothing below /mnt exists in the tree yet; open() must pull the
        // chain out of the filesystem.
        let h = vfs
            .open(&mut table, "/mnt/sub/data.txt", OpenMode::Read)
            .unwrap();
        let mut buf = [0u8; 9];
        assert_eq!(vfs.read(&mut table, h, &mut buf).unwrap(), 9);
        assert_eq!(&buf, b"disk data");

        // The chain is now part of the tree, stamped with the
        // filesystem-reported metadata.
        let node = vfs
            .path_to_node("/mnt/sub", LookupFlags::empty(), NodeType::Invalid)
            .unwrap();
        assert_eq!(vfs.tnode(node).stat.mtime_ns, 5);

        // A second open reuses the grafted nodes.
        let h2 = vfs
            .open(&mut table, "/mnt/sub/data.txt", OpenMode::Read)
            .unwrap();
        assert_eq!(vfs.refcount_of(&table, h2).unwrap(), 3);

        // Unknown names below the mount still miss.
        assert_eq!(
            vfs.open(&mut table, "/mnt/sub/nope", OpenMode::Read)
                .unwrap_err(),
            FsError::NotFound
        );
    }

    #[test]
    fn referenced_inodes_stay_reachable() {
        let (mut vfs, mut table) = fresh();
        vfs.create("/a", NodeType::File).unwrap();
        vfs.create("/b", NodeType::Folder).unwrap();
        vfs.create("/b/c", NodeType::File).unwrap();
        let _h = vfs.open(&mut table, "/b/c", OpenMode::Read).unwrap();
        assert!(vfs.all_reachable());
    }
}
