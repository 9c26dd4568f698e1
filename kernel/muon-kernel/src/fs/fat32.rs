//! FAT32 filesystem over a sector block device.
//!
//! Mounting reads the MBR, picks the first partition of type 0x0B, 0x0C or
//! 0x1C, parses the BPB and caches the first FAT in memory. Directory
//! entries are walked 512 bytes at a time with long file names assembled
//! from LFN runs and validated against the DOS checksum. Writes grow the
//! cluster chain by first-fit in the FAT, persisting the touched FAT
//! sector immediately; the directory entry is rewritten when the size
//! changes.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use muon_core::sync::SpinLock;

use super::{
    BlockDevice, BlockDeviceIdent, ChildSpec, FileSystem, FsError, NodeIdent, NodeType,
};

const SECTOR_SIZE: usize = 512;
const DIR_ENTRY_SIZE: usize = 32;

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LFN: u8 = 0x0F;

/// End-of-chain marker written when terminating a chain.
const EOC: u32 = 0x0FFF_FFFF;
/// Any value at or above this ends a chain.
const EOC_MIN: u32 = 0x0FFF_FFF8;

/// MBR partition types holding FAT32 volumes.
const PARTITION_TYPES: [u8; 3] = [0x0B, 0x0C, 0x1C];

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// One mounted FAT32 volume: geometry plus the cached FAT.
struct Volume {
    dev: Arc<dyn BlockDevice>,
    sectors_per_cluster: u32,
    fat_begin_lba: u64,
    cluster_begin_lba: u64,
    root_cluster: u32,
    fat: SpinLock<Vec<u32>>,
}

impl Volume {
    fn mount(dev: Arc<dyn BlockDevice>) -> Result<Arc<Self>, FsError> {
        let mut mbr = [0u8; SECTOR_SIZE];
        dev.read_sectors(0, &mut mbr)?;
        if mbr[510] != 0x55 || mbr[511] != 0xAA {
            return Err(FsError::CorruptImage);
        }
        let part_lba = (0..4)
            .map(|i| &mbr[446 + i * 16..446 + (i + 1) * 16])
            .find(|p| PARTITION_TYPES.contains(&p[4]))
            .map(|p| u64::from(read_u32(p, 8)))
            .ok_or(FsError::NotFound)?;

        let mut bpb = [0u8; SECTOR_SIZE];
        dev.read_sectors(part_lba, &mut bpb)?;
        let bytes_per_sector = read_u16(&bpb, 11);
        if bytes_per_sector as usize != SECTOR_SIZE {
            return Err(FsError::CorruptImage);
        }
        let sectors_per_cluster = u32::from(bpb[13]);
        let reserved_sectors = u64::from(read_u16(&bpb, 14));
        let num_fats = u64::from(bpb[16]);
        let sectors_per_fat = u64::from(read_u32(&bpb, 36));
        let root_cluster = read_u32(&bpb, 44);
        if sectors_per_cluster == 0 || sectors_per_fat == 0 {
            return Err(FsError::CorruptImage);
        }

        let fat_begin_lba = part_lba + reserved_sectors;
        let cluster_begin_lba = fat_begin_lba + num_fats * sectors_per_fat;

        // Cache the first FAT. Only the first copy is ever consulted.
        let mut fat_bytes = vec![0u8; (sectors_per_fat as usize) * SECTOR_SIZE];
        dev.read_sectors(fat_begin_lba, &mut fat_bytes)?;
        let fat = fat_bytes
            .chunks_exact(4)
            .map(|c| read_u32(c, 0) & 0x0FFF_FFFF)
            .collect();

        Ok(Arc::new(Self {
            dev,
            sectors_per_cluster,
            fat_begin_lba,
            cluster_begin_lba,
            root_cluster,
            fat: SpinLock::new(fat),
        }))
    }

    fn cluster_bytes(&self) -> usize {
        self.sectors_per_cluster as usize * SECTOR_SIZE
    }

    fn cluster_lba(&self, cluster: u32) -> u64 {
        self.cluster_begin_lba + u64::from(cluster - 2) * u64::from(self.sectors_per_cluster)
    }

    fn read_cluster(&self, cluster: u32, buf: &mut [u8]) -> Result<(), FsError> {
        self.dev.read_sectors(self.cluster_lba(cluster), buf)
    }

    fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<(), FsError> {
        self.dev.write_sectors(self.cluster_lba(cluster), buf)
    }

    /// The next cluster in the chain, or `None` at end-of-chain.
    fn next_cluster(&self, cluster: u32) -> Option<u32> {
        let fat = self.fat.lock();
        let next = *fat.get(cluster as usize)?;
        if next < 2 || next >= EOC_MIN {
            None
        } else {
            Some(next)
        }
    }

    /// First-fit allocation of a free cluster, linked after `prev`.
    /// Persists the FAT sectors holding both updated entries.
    fn alloc_cluster(&self, prev: u32) -> Result<u32, FsError> {
        let (new, sectors) = {
            let mut fat = self.fat.lock();
            let new = (2..fat.len() as u32)
                .find(|&k| fat[k as usize] == 0)
                .ok_or(FsError::OutOfMemory)?;
            fat[prev as usize] = new;
            fat[new as usize] = EOC;

            let prev_sector = prev as usize * 4 / SECTOR_SIZE;
            let new_sector = new as usize * 4 / SECTOR_SIZE;
            let mut sectors = vec![(prev_sector, self.fat_sector_image(&fat, prev_sector))];
            if new_sector != prev_sector {
                sectors.push((new_sector, self.fat_sector_image(&fat, new_sector)));
            }
            (new, sectors)
        };
        for (index, image) in sectors {
            self.dev
                .write_sectors(self.fat_begin_lba + index as u64, &image)?;
        }
        Ok(new)
    }

    fn fat_sector_image(&self, fat: &[u32], sector_index: usize) -> [u8; SECTOR_SIZE] {
        let mut image = [0u8; SECTOR_SIZE];
        let base = sector_index * SECTOR_SIZE / 4;
        for (i, chunk) in image.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&fat.get(base + i).copied().unwrap_or(0).to_le_bytes());
        }
        image
    }
}

// ---------------------------------------------------------------------------
// Directory entries
// ---------------------------------------------------------------------------

/// Where a file's 8.3 entry lives and what it currently says.
#[derive(Clone, Copy)]
struct EntryInfo {
    attr: u8,
    first_cluster: u32,
    size: u32,
    /// Directory cluster holding the 8.3 entry (0 for the root node).
    dent_cluster: u32,
    /// Entry index within that cluster.
    dent_index: usize,
}

/// Per-node state: the shared volume plus the node's entry.
pub struct FatNode {
    vol: Arc<Volume>,
    entry: SpinLock<EntryInfo>,
}

fn node(ident: &NodeIdent) -> Result<&FatNode, FsError> {
    ident.downcast_ref::<FatNode>().ok_or(FsError::Invalid)
}

/// DOS checksum over the 11-byte 8.3 name, used to validate LFN runs.
fn dos_checksum(name83: &[u8; 11]) -> u8 {
    name83
        .iter()
        .fold(0u8, |sum, &c| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(c))
}

/// Decodes an 8.3 name: space-padded base and extension.
fn short_name(name83: &[u8; 11]) -> String {
    let mut raw = *name83;
    if raw[0] == 0x05 {
        raw[0] = 0xE5;
    }
    let base: String = raw[..8]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .into();
    let ext: String = raw[8..]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .into();
    if ext.is_empty() {
        base
    } else {
        alloc::format!("{base}.{ext}")
    }
}

/// Extracts the 13 UTF-16 characters of one LFN entry.
fn lfn_chars(entry: &[u8]) -> [u16; 13] {
    let mut chars = [0u16; 13];
    let ranges = [(1usize, 5usize), (14, 6), (28, 2)];
    let mut out = 0;
    for (start, count) in ranges {
        for i in 0..count {
            chars[out] = read_u16(entry, start + i * 2);
            out += 1;
        }
    }
    chars
}

/// Converts a DOS date/time pair to nanoseconds since the Unix epoch.
fn dos_datetime_ns(date: u16, time: u16) -> u64 {
    let year = i64::from(date >> 9) + 1980;
    let month = i64::from((date >> 5) & 0xF).max(1);
    let day = i64::from(date & 0x1F).max(1);
    // Days-from-civil, valid for the FAT epoch range.
    let a = (14 - month) / 12;
    let y = year + 4800 - a;
    let m = month + 12 * a - 3;
    let jdn = day + (153 * m + 2) / 5 + 365 * y + y / 4 - y / 100 + y / 400 - 32045;
    let days = jdn - 2_440_588;

    let secs = days * 86_400
        + i64::from(time >> 11) * 3600
        + i64::from((time >> 5) & 0x3F) * 60
        + i64::from(time & 0x1F) * 2;
    secs.max(0) as u64 * 1_000_000_000
}

/// One decoded directory entry during a scan.
struct ScannedEntry {
    name: String,
    info: EntryInfo,
    mtime_ns: u64,
}

/// Walks a directory's cluster chain, assembling LFN runs, and yields each
/// real entry. Stops early when `visit` returns `false`.
fn scan_dir(
    vol: &Volume,
    start_cluster: u32,
    mut visit: impl FnMut(ScannedEntry) -> bool,
) -> Result<(), FsError> {
    let mut cluster = if start_cluster < 2 {
        vol.root_cluster
    } else {
        start_cluster
    };
    let mut buf = vec![0u8; vol.cluster_bytes()];
    let mut lfn_parts: Vec<(u8, [u16; 13])> = Vec::new();
    let mut lfn_checksum = 0u8;

    loop {
        vol.read_cluster(cluster, &mut buf)?;
        for index in 0..buf.len() / DIR_ENTRY_SIZE {
            let entry = &buf[index * DIR_ENTRY_SIZE..(index + 1) * DIR_ENTRY_SIZE];
            match entry[0] {
                0x00 => return Ok(()),
                0xE5 => {
                    lfn_parts.clear();
                    continue;
                }
                _ => {}
            }

            if entry[11] == ATTR_LFN {
                let seq = entry[0] & 0x1F;
                if entry[0] & 0x40 != 0 {
                    lfn_parts.clear();
                }
                lfn_checksum = entry[13];
                lfn_parts.push((seq, lfn_chars(entry)));
                continue;
            }
            if entry[11] & ATTR_VOLUME_ID != 0 {
                lfn_parts.clear();
                continue;
            }

            let mut name83 = [0u8; 11];
            name83.copy_from_slice(&entry[..11]);

            let name = if !lfn_parts.is_empty() && lfn_checksum == dos_checksum(&name83) {
                lfn_parts.sort_by_key(|&(seq, _)| seq);
                let utf16: Vec<u16> = lfn_parts
                    .iter()
                    .flat_map(|(_, chars)| chars.iter().copied())
                    .take_while(|&c| c != 0 && c != 0xFFFF)
                    .collect();
                char::decode_utf16(utf16)
                    .map(|c| c.unwrap_or('?'))
                    .collect()
            } else {
                short_name(&name83)
            };
            lfn_parts.clear();

            let first_cluster =
                (u32::from(read_u16(entry, 20)) << 16) | u32::from(read_u16(entry, 26));
            let scanned = ScannedEntry {
                name,
                info: EntryInfo {
                    attr: entry[11],
                    first_cluster,
                    size: read_u32(entry, 28),
                    dent_cluster: cluster,
                    dent_index: index,
                },
                mtime_ns: dos_datetime_ns(read_u16(entry, 24), read_u16(entry, 22)),
            };
            if !visit(scanned) {
                return Ok(());
            }
        }
        match vol.next_cluster(cluster) {
            Some(next) => cluster = next,
            None => return Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// FileSystem implementation
// ---------------------------------------------------------------------------

/// The FAT32 filesystem.
pub struct Fat32Fs;

impl Fat32Fs {
    /// Creates the filesystem singleton.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Fat32Fs {
    fn default() -> Self {
        Self::new()
    }
}

fn child_spec(vol: &Arc<Volume>, entry: ScannedEntry) -> ChildSpec {
    let kind = if entry.info.attr & ATTR_DIRECTORY != 0 {
        NodeType::Folder
    } else {
        NodeType::File
    };
    ChildSpec {
        name: entry.name,
        kind,
        size: entry.info.size as usize,
        mtime_ns: entry.mtime_ns,
        link: String::new(),
        ident: Arc::new(FatNode {
            vol: vol.clone(),
            entry: SpinLock::new(entry.info),
        }),
    }
}

impl FileSystem for Fat32Fs {
    fn name(&self) -> &'static str {
        "fat32"
    }

    fn is_temporary(&self) -> bool {
        false
    }

    fn mount(&self, device: Option<NodeIdent>) -> Result<NodeIdent, FsError> {
        let device = device.ok_or(FsError::Invalid)?;
        let dev = device
            .downcast_ref::<BlockDeviceIdent>()
            .ok_or(FsError::Invalid)?
            .0
            .clone();
        let vol = Volume::mount(dev)?;
        let root = EntryInfo {
            attr: ATTR_DIRECTORY,
            first_cluster: vol.root_cluster,
            size: 0,
            dent_cluster: 0,
            dent_index: 0,
        };
        Ok(Arc::new(FatNode {
            vol,
            entry: SpinLock::new(root),
        }))
    }

    fn mknode(
        &self,
        parent: &NodeIdent,
        _name: &str,
        _kind: NodeType,
    ) -> Result<NodeIdent, FsError> {
        let parent = node(parent)?;
        Ok(Arc::new(FatNode {
            vol: parent.vol.clone(),
            entry: SpinLock::new(EntryInfo {
                attr: 0,
                first_cluster: 0,
                size: 0,
                dent_cluster: 0,
                dent_index: 0,
            }),
        }))
    }

    fn lookup_path(&self, root: &NodeIdent, rel_path: &str) -> Result<Vec<ChildSpec>, FsError> {
        let root = node(root)?;
        let components: Vec<&str> = rel_path.split('/').filter(|c| !c.is_empty()).collect();
        let mut chain = Vec::new();
        let mut cluster = root.entry.lock().first_cluster;

        for (depth, component) in components.iter().enumerate() {
            let mut found: Option<ScannedEntry> = None;
            scan_dir(&root.vol, cluster, |entry| {
                if entry.name.eq_ignore_ascii_case(component) {
                    found = Some(entry);
                    false
                } else {
                    true
                }
            })?;
            let entry = found.ok_or(FsError::NotFound)?;
            let is_dir = entry.info.attr & ATTR_DIRECTORY != 0;
            if !is_dir && depth != components.len() - 1 {
                return Err(FsError::NotFound);
            }
            cluster = entry.info.first_cluster;
            chain.push(child_spec(&root.vol, entry));
        }
        if chain.is_empty() {
            return Err(FsError::NotFound);
        }
        Ok(chain)
    }

    fn read(&self, ident: &NodeIdent, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let fat_node = node(ident)?;
        let info = *fat_node.entry.lock();
        let vol = &fat_node.vol;
        let cb = vol.cluster_bytes();

        let mut cluster = info.first_cluster;
        if cluster < 2 {
            return Ok(0);
        }
        for _ in 0..offset / cb {
            match vol.next_cluster(cluster) {
                Some(next) => cluster = next,
                None => return Ok(0),
            }
        }

        let mut tmp = vec![0u8; cb];
        let mut pos = offset % cb;
        let mut done = 0;
        loop {
            vol.read_cluster(cluster, &mut tmp)?;
            let n = (cb - pos).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&tmp[pos..pos + n]);
            done += n;
            pos = 0;
            if done == buf.len() {
                return Ok(done);
            }
            match vol.next_cluster(cluster) {
                Some(next) => cluster = next,
                None => return Ok(done),
            }
        }
    }

    fn write(&self, ident: &NodeIdent, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        let fat_node = node(ident)?;
        let vol = fat_node.vol.clone();
        let cb = vol.cluster_bytes();

        let first = {
            let mut info = fat_node.entry.lock();
            if info.attr & ATTR_READ_ONLY != 0 {
                return Err(FsError::PermissionDenied);
            }
            if info.first_cluster < 2 {
                // Empty file: the chain starts with this write.
                let fresh = {
                    let mut fat = vol.fat.lock();
                    let fresh = (2..fat.len() as u32)
                        .find(|&k| fat[k as usize] == 0)
                        .ok_or(FsError::OutOfMemory)?;
                    fat[fresh as usize] = EOC;
                    let sector = fresh as usize * 4 / SECTOR_SIZE;
                    let image = vol.fat_sector_image(&fat, sector);
                    vol.dev
                        .write_sectors(vol.fat_begin_lba + sector as u64, &image)?;
                    fresh
                };
                info.first_cluster = fresh;
            }
            info.first_cluster
        };

        // Walk (allocating as needed) to the cluster containing `offset`.
        let mut cluster = first;
        for _ in 0..offset / cb {
            cluster = match vol.next_cluster(cluster) {
                Some(next) => next,
                None => vol.alloc_cluster(cluster)?,
            };
        }

        let mut tmp = vec![0u8; cb];
        let mut pos = offset % cb;
        let mut done = 0;
        loop {
            vol.read_cluster(cluster, &mut tmp)?;
            let n = (cb - pos).min(buf.len() - done);
            tmp[pos..pos + n].copy_from_slice(&buf[done..done + n]);
            vol.write_cluster(cluster, &tmp)?;
            done += n;
            pos = 0;
            if done == buf.len() {
                return Ok(done);
            }
            cluster = match vol.next_cluster(cluster) {
                Some(next) => next,
                None => vol.alloc_cluster(cluster)?,
            };
        }
    }

    /// Rewrites the 8.3 directory entry with the new size and the current
    /// first cluster.
    fn sync(&self, ident: &NodeIdent, size: usize) -> Result<(), FsError> {
        let fat_node = node(ident)?;
        let info = {
            let mut info = fat_node.entry.lock();
            info.size = size as u32;
            *info
        };
        if info.dent_cluster < 2 {
            // The root directory has no entry of its own.
            return Ok(());
        }
        let vol = &fat_node.vol;
        let mut buf = vec![0u8; vol.cluster_bytes()];
        vol.read_cluster(info.dent_cluster, &mut buf)?;
        let at = info.dent_index * DIR_ENTRY_SIZE;
        buf[at + 20..at + 22].copy_from_slice(&((info.first_cluster >> 16) as u16).to_le_bytes());
        buf[at + 26..at + 28].copy_from_slice(&(info.first_cluster as u16).to_le_bytes());
        buf[at + 28..at + 32].copy_from_slice(&info.size.to_le_bytes());
        vol.write_cluster(info.dent_cluster, &buf)
    }

    fn refresh(&self, ident: &NodeIdent) -> Result<Vec<ChildSpec>, FsError> {
        let fat_node = node(ident)?;
        let info = *fat_node.entry.lock();
        if info.attr & ATTR_DIRECTORY == 0 && info.dent_cluster >= 2 {
            return Err(FsError::Invalid);
        }
        let mut children = Vec::new();
        scan_dir(&fat_node.vol, info.first_cluster, |entry| {
            if entry.name != "." && entry.name != ".." {
                children.push(child_spec(&fat_node.vol, entry));
            }
            true
        })?;
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory disk image.
    struct MemDisk(SpinLock<Vec<u8>>);

    impl BlockDevice for MemDisk {
        fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
            let disk = self.0.lock();
            let start = lba as usize * SECTOR_SIZE;
            buf.copy_from_slice(&disk[start..start + buf.len()]);
            Ok(())
        }

        fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), FsError> {
            let mut disk = self.0.lock();
            let start = lba as usize * SECTOR_SIZE;
            disk[start..start + buf.len()].copy_from_slice(buf);
            Ok(())
        }

        fn sector_count(&self) -> u64 {
            (self.0.lock().len() / SECTOR_SIZE) as u64
        }
    }

    const PART_LBA: u64 = 1;
    const RESERVED: u64 = 2;
    const FAT_SECTORS: u64 = 4;
    const FAT_LBA: u64 = PART_LBA + RESERVED; // 3
    const DATA_LBA: u64 = FAT_LBA + FAT_SECTORS; // 7
    const FILE_BODY: &[u8] = b"hello from the fat fs\n+++";

    fn put_dirent(dir: &mut [u8], index: usize, name83: &[u8; 11], attr: u8, cluster: u32, size: u32) {
        let at = index * DIR_ENTRY_SIZE;
        dir[at..at + 11].copy_from_slice(name83);
        dir[at + 11] = attr;
        dir[at + 20..at + 22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        dir[at + 22..at + 24].copy_from_slice(&0x6000u16.to_le_bytes()); // 12:00:00
        dir[at + 24..at + 26].copy_from_slice(&0x5821u16.to_le_bytes()); // 2024-01-01
        dir[at + 26..at + 28].copy_from_slice(&(cluster as u16).to_le_bytes());
        dir[at + 28..at + 32].copy_from_slice(&size.to_le_bytes());
    }

    fn put_lfn(dir: &mut [u8], index: usize, seq: u8, checksum: u8, chars: &[u16; 13]) {
        let at = index * DIR_ENTRY_SIZE;
        dir[at] = seq;
        dir[at + 11] = ATTR_LFN;
        dir[at + 13] = checksum;
        for (i, &c) in chars.iter().enumerate() {
            let off = match i {
                0..=4 => at + 1 + i * 2,
                5..=10 => at + 14 + (i - 5) * 2,
                _ => at + 28 + (i - 11) * 2,
            };
            dir[off..off + 2].copy_from_slice(&c.to_le_bytes());
        }
    }

    fn lfn_block(s: &str) -> [u16; 13] {
        let mut chars = [0xFFFFu16; 13];
        for (i, c) in s.encode_utf16().enumerate() {
            chars[i] = c;
        }
        if s.len() < 13 {
            chars[s.len()] = 0;
        }
        chars
    }

    /// Builds a small valid image:
    ///   cluster 2 = root dir (HELLOWLD.TXT + SUB)
    ///   cluster 3 = HELLOWLD.TXT body (25 bytes)
    ///   cluster 4 = SUB directory (NOTES.TXT)
    ///   cluster 5 = NOTES.TXT body
    fn build_image() -> Arc<MemDisk> {
        let mut disk = vec![0u8; SECTOR_SIZE * 64];

        // MBR: one FAT32 (LBA) partition starting at PART_LBA.
        disk[446 + 4] = 0x0C;
        disk[446 + 8..446 + 12].copy_from_slice(&(PART_LBA as u32).to_le_bytes());
        disk[510] = 0x55;
        disk[511] = 0xAA;

        // BPB.
        let bpb = PART_LBA as usize * SECTOR_SIZE;
        disk[bpb + 11..bpb + 13].copy_from_slice(&512u16.to_le_bytes());
        disk[bpb + 13] = 1; // sectors per cluster
        disk[bpb + 14..bpb + 16].copy_from_slice(&(RESERVED as u16).to_le_bytes());
        disk[bpb + 16] = 1; // one FAT
        disk[bpb + 36..bpb + 40].copy_from_slice(&(FAT_SECTORS as u32).to_le_bytes());
        disk[bpb + 44..bpb + 48].copy_from_slice(&2u32.to_le_bytes()); // root cluster

        // FAT: clusters 0..=5 occupied.
        let fat = FAT_LBA as usize * SECTOR_SIZE;
        for (idx, value) in [
            (0usize, 0x0FFF_FFF8u32),
            (1, EOC),
            (2, EOC),
            (3, EOC),
            (4, EOC),
            (5, EOC),
        ] {
            disk[fat + idx * 4..fat + idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }

        // Root directory (cluster 2).
        {
            let mut dir = vec![0u8; SECTOR_SIZE];
            let name83 = *b"HELLOWLDTXT";
            let checksum = dos_checksum(&name83);
            // LFN entries are stored last-chunk-first: sequence 2 (final,
            // 0x40 flag) then sequence 1, then the 8.3 entry.
            put_lfn(&mut dir, 0, 0x42, checksum, &lfn_block("t"));
            put_lfn(&mut dir, 1, 0x01, checksum, &lfn_block("helloworld.tx"));
            put_dirent(&mut dir, 2, &name83, 0, 3, 25);
            put_dirent(&mut dir, 3, b"SUB        ", ATTR_DIRECTORY, 4, 0);
            let at = (DATA_LBA as usize) * SECTOR_SIZE;
            disk[at..at + SECTOR_SIZE].copy_from_slice(&dir);
        }

        // HELLOWLD.TXT body (cluster 3).
        {
            let at = (DATA_LBA as usize + 1) * SECTOR_SIZE;
            disk[at..at + 25].copy_from_slice(&FILE_BODY[..25]);
        }

        // SUB directory (cluster 4) with NOTES.TXT -> cluster 5.
        {
            let mut dir = vec![0u8; SECTOR_SIZE];
            put_dirent(&mut dir, 0, b"NOTES   TXT", 0, 5, 5);
            let at = (DATA_LBA as usize + 2) * SECTOR_SIZE;
            disk[at..at + SECTOR_SIZE].copy_from_slice(&dir);
            let body = (DATA_LBA as usize + 3) * SECTOR_SIZE;
            disk[body..body + 5].copy_from_slice(b"notes");
        }

        Arc::new(MemDisk(SpinLock::new(disk)))
    }

    fn mount(disk: Arc<MemDisk>) -> (Fat32Fs, NodeIdent) {
        let fs = Fat32Fs::new();
        let ident: NodeIdent = Arc::new(BlockDeviceIdent(disk));
        let root = fs.mount(Some(ident)).unwrap();
        (fs, root)
    }

    #[test]
    fn mount_finds_partition_and_root() {
        let (fs, root) = mount(build_image());
        let children = fs.refresh(&root).unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["helloworld.txt", "SUB"]);
    }

    #[test]
    fn long_file_name_is_assembled_in_reverse_order() {
        let (fs, root) = mount(build_image());
        let children = fs.refresh(&root).unwrap();
        assert_eq!(children[0].name, "helloworld.txt");
        assert_eq!(children[0].size, 25);
        assert_eq!(children[0].kind, NodeType::File);
    }

    #[test]
    fn lookup_by_long_and_short_name() {
        let (fs, root) = mount(build_image());
        let chain = fs.lookup_path(&root, "helloworld.txt").unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].size, 25);
        // Subdirectory traversal.
        let chain = fs.lookup_path(&root, "SUB/NOTES.TXT").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].name, "NOTES.TXT");
        assert_eq!(chain[1].size, 5);
        assert!(fs.lookup_path(&root, "NOPE.TXT").is_err());
    }

    #[test]
    fn read_within_chain_is_bit_exact() {
        let (fs, root) = mount(build_image());
        let chain = fs.lookup_path(&root, "helloworld.txt").unwrap();
        let mut buf = [0u8; 25];
        assert_eq!(fs.read(&chain[0].ident, 0, &mut buf).unwrap(), 25);
        assert_eq!(&buf, &FILE_BODY[..25]);
        // Offset read.
        let mut tail = [0u8; 5];
        assert_eq!(fs.read(&chain[0].ident, 20, &mut tail).unwrap(), 5);
        assert_eq!(&tail, &FILE_BODY[20..25]);
    }

    #[test]
    fn write_then_read_roundtrip_within_cluster() {
        let (fs, root) = mount(build_image());
        let chain = fs.lookup_path(&root, "helloworld.txt").unwrap();
        fs.write(&chain[0].ident, 6, b"REWRIT").unwrap();
        let mut buf = [0u8; 25];
        fs.read(&chain[0].ident, 0, &mut buf).unwrap();
        assert_eq!(&buf[6..12], b"REWRIT");
        assert_eq!(&buf[..6], &FILE_BODY[..6]);
    }

    #[test]
    fn growth_allocates_first_fit_cluster_and_updates_fat_and_dirent() {
        let disk = build_image();
        let (fs, root) = mount(disk.clone());
        let chain = fs.lookup_path(&root, "helloworld.txt").unwrap();

        // 1800 bytes at offset 10 spills past the single 512-byte cluster.
        let data = vec![0xA5u8; 1800];
        assert_eq!(fs.write(&chain[0].ident, 10, &data).unwrap(), 1800);
        fs.sync(&chain[0].ident, 1810).unwrap();

        // First-fit finds cluster 6; the chain grows 3 -> 6 -> 7 -> 8.
        let raw = disk.0.lock();
        let fat_at = |idx: usize| {
            let base = FAT_LBA as usize * SECTOR_SIZE + idx * 4;
            u32::from_le_bytes([raw[base], raw[base + 1], raw[base + 2], raw[base + 3]])
        };
        assert_eq!(fat_at(3), 6);
        assert_eq!(fat_at(6), 7);
        assert_eq!(fat_at(7), 8);
        assert_eq!(fat_at(8), EOC);

        // The directory entry's size field was rewritten.
        let dirent = DATA_LBA as usize * SECTOR_SIZE + 2 * DIR_ENTRY_SIZE;
        let size = u32::from_le_bytes([
            raw[dirent + 28],
            raw[dirent + 29],
            raw[dirent + 30],
            raw[dirent + 31],
        ]);
        assert_eq!(size, 1810);
        drop(raw);

        // And the data reads back bit-exact.
        let mut buf = vec![0u8; 1810];
        assert_eq!(fs.read(&chain[0].ident, 0, &mut buf).unwrap(), 1810);
        assert_eq!(&buf[..10], &FILE_BODY[..10]);
        assert_eq!(&buf[10..], &data[..]);
    }

    #[test]
    fn checksum_matches_reference() {
        // Reference value computed with the canonical DOS algorithm.
        assert_eq!(dos_checksum(b"HELLOWLDTXT"), {
            let mut sum = 0u8;
            for &c in b"HELLOWLDTXT" {
                sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(c);
            }
            sum
        });
    }

    #[test]
    fn rejects_disk_without_mbr_signature() {
        let disk = Arc::new(MemDisk(SpinLock::new(vec![0u8; SECTOR_SIZE * 8])));
        let fs = Fat32Fs::new();
        let ident: NodeIdent = Arc::new(BlockDeviceIdent(disk));
        assert!(fs.mount(Some(ident)).is_err());
    }
}
