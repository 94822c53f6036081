//! The file store: inodes, a flat directory and a zone bitmap.
//!
//! Files reserve a fixed number of zones at creation; a write that would
//! run past the reserved zones fails whole with `EXFULL` rather than
//! spilling. Directory entries are hard links: an inode lives until its
//! last name is unlinked.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use heron_abi::{
    FS_DATA_START_SECTOR, FS_DEFAULT_ZONES, FS_NAME_MAX, FS_ROOT_INO, FS_ZONE_COUNT, FS_ZONE_LEN,
    Status,
};

/// Hard links allowed per inode.
pub const FS_LINK_MAX: u8 = 8;

struct Inode {
    /// Zone numbers reserved for this file.
    zones: Vec<u16>,
    /// Current file length in bytes.
    len: u32,
    nlink: u8,
    data: Vec<u8>,
}

impl Inode {
    fn capacity(&self) -> u32 {
        (self.zones.len() * FS_ZONE_LEN) as u32
    }
}

/// The one-partition file store.
pub struct FileStore {
    inodes: BTreeMap<u16, Inode>,
    dir: BTreeMap<Vec<u8>, u16>,
    zone_used: [bool; FS_ZONE_COUNT],
}

impl FileStore {
    /// A freshly formatted store.
    pub fn new() -> FileStore {
        let mut store = FileStore {
            inodes: BTreeMap::new(),
            dir: BTreeMap::new(),
            zone_used: [false; FS_ZONE_COUNT],
        };
        store.mkfs();
        store
    }

    /// Re-create an empty store: root inode only, all zones free.
    pub fn mkfs(&mut self) -> Status {
        self.inodes.clear();
        self.dir.clear();
        self.zone_used = [false; FS_ZONE_COUNT];
        self.inodes.insert(
            FS_ROOT_INO,
            Inode {
                zones: Vec::new(),
                len: 0,
                nlink: 1,
                data: Vec::new(),
            },
        );
        Status::Ok
    }

    /// Create a file, reserving `zones` zones (0 = store default).
    ///
    /// With `truncate` set, an existing name is truncated to length zero
    /// and its inode returned instead of failing with `EEXIST`.
    pub fn mknod(&mut self, name: &[u8], zones: u8, truncate: bool) -> Result<u16, Status> {
        let name = check_name(name)?;

        if let Some(&ino) = self.dir.get(name) {
            if !truncate {
                return Err(Status::Exist);
            }
            let inode = self.inodes.get_mut(&ino).ok_or(Status::NoEnt)?;
            inode.len = 0;
            inode.data.clear();
            return Ok(ino);
        }

        let want = if zones == 0 { FS_DEFAULT_ZONES } else { zones } as usize;
        let free: Vec<u16> = self
            .zone_used
            .iter()
            .enumerate()
            .filter(|(_, used)| !**used)
            .map(|(zone, _)| zone as u16)
            .take(want)
            .collect();
        if free.len() < want {
            return Err(Status::NoSpc);
        }

        let ino = (FS_ROOT_INO + 1..u16::MAX)
            .find(|ino| !self.inodes.contains_key(ino))
            .ok_or(Status::NoSpc)?;

        for &zone in &free {
            self.zone_used[zone as usize] = true;
        }
        self.inodes.insert(
            ino,
            Inode {
                zones: free,
                len: 0,
                nlink: 1,
                data: Vec::new(),
            },
        );
        self.dir.insert(name.to_vec(), ino);
        Ok(ino)
    }

    /// Resolve a path string to an inode number.
    pub fn path(&self, name: &[u8]) -> Result<u16, Status> {
        if name == b"/" {
            return Ok(FS_ROOT_INO);
        }
        let name = check_name(name)?;
        self.dir.get(name).copied().ok_or(Status::NoEnt)
    }

    /// Add a directory entry for an existing inode.
    pub fn link(&mut self, ino: u16, name: &[u8]) -> Status {
        let name = match check_name(name) {
            Ok(name) => name,
            Err(status) => return status,
        };
        if self.dir.contains_key(name) {
            return Status::Exist;
        }
        let Some(inode) = self.inodes.get_mut(&ino) else {
            return Status::NoEnt;
        };
        if inode.nlink >= FS_LINK_MAX {
            return Status::MLink;
        }
        inode.nlink += 1;
        self.dir.insert(name.to_vec(), ino);
        Status::Ok
    }

    /// Remove a directory entry; the inode is freed with its last name.
    pub fn unlink(&mut self, name: &[u8]) -> Status {
        if name == b"/" {
            return Status::Perm;
        }
        let name = match check_name(name) {
            Ok(name) => name,
            Err(status) => return status,
        };
        let Some(ino) = self.dir.remove(name) else {
            return Status::NoEnt;
        };
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.nlink -= 1;
            if inode.nlink == 0
                && let Some(dead) = self.inodes.remove(&ino)
            {
                for zone in dead.zones {
                    self.zone_used[zone as usize] = false;
                }
            }
        }
        Status::Ok
    }

    /// Read up to `len` bytes at `pos`. Returns the bytes and the new file
    /// position.
    pub fn read(&self, ino: u16, pos: u32, len: usize) -> Result<(Vec<u8>, u32), Status> {
        let inode = self.inodes.get(&ino).ok_or(Status::NoEnt)?;
        if pos >= inode.len {
            return Ok((Vec::new(), pos));
        }
        let start = pos as usize;
        let end = (start + len).min(inode.len as usize);
        let bytes = inode.data[start..end].to_vec();
        let new_pos = end as u32;
        Ok((bytes, new_pos))
    }

    /// Write `data` at `pos`, optionally truncating first. Returns the new
    /// file position.
    ///
    /// A write that would run past the file's reserved zones fails whole
    /// with `EXFULL`.
    pub fn write(
        &mut self,
        ino: u16,
        pos: u32,
        data: &[u8],
        truncate: bool,
    ) -> Result<u32, Status> {
        let inode = self.inodes.get_mut(&ino).ok_or(Status::NoEnt)?;
        if truncate {
            inode.len = 0;
            inode.data.clear();
        }
        let end = pos as usize + data.len();
        if end as u32 > inode.capacity() {
            return Err(Status::XFull);
        }
        if inode.data.len() < end {
            inode.data.resize(end, 0);
        }
        inode.data[pos as usize..end].copy_from_slice(data);
        inode.len = inode.len.max(end as u32);
        Ok(end as u32)
    }

    /// Map a file zone index to its backing sector.
    pub fn indir(&self, ino: u16, zone_index: u8) -> Result<u16, Status> {
        let inode = self.inodes.get(&ino).ok_or(Status::NoEnt)?;
        let zone = inode
            .zones
            .get(zone_index as usize)
            .copied()
            .ok_or(Status::Inval)?;
        Ok(FS_DATA_START_SECTOR + zone)
    }

    /// Free zones left on the store (diagnostics).
    pub fn free_zones(&self) -> usize {
        self.zone_used.iter().filter(|used| !**used).count()
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a name: strip one leading slash, reject empty, nested and
/// over-long names.
fn check_name(name: &[u8]) -> Result<&[u8], Status> {
    let name = name.strip_prefix(b"/").unwrap_or(name);
    if name.is_empty() {
        return Err(Status::Inval);
    }
    if name.contains(&b'/') {
        return Err(Status::NotDir);
    }
    if name.len() > FS_NAME_MAX {
        return Err(Status::NameTooLong);
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mknod_then_path_resolves() {
        let mut store = FileStore::new();
        let ino = store.mknod(b"log0", 0, false).unwrap();
        assert_eq!(store.path(b"log0"), Ok(ino));
        assert_eq!(store.path(b"/log0"), Ok(ino));
    }

    #[test]
    fn test_unlink_then_path_is_noent() {
        let mut store = FileStore::new();
        store.mknod(b"gone", 0, false).unwrap();
        assert_eq!(store.unlink(b"gone"), Status::Ok);
        assert_eq!(store.path(b"gone"), Err(Status::NoEnt));
        assert_eq!(store.unlink(b"gone"), Status::NoEnt);
    }

    #[test]
    fn test_mkfs_then_root_resolves() {
        let mut store = FileStore::new();
        store.mknod(b"junk", 0, false).unwrap();
        assert_eq!(store.mkfs(), Status::Ok);
        assert_eq!(store.path(b"/"), Ok(FS_ROOT_INO));
        assert_eq!(store.path(b"junk"), Err(Status::NoEnt));
        assert_eq!(store.free_zones(), FS_ZONE_COUNT);
    }

    #[test]
    fn test_mknod_existing() {
        let mut store = FileStore::new();
        let ino = store.mknod(b"f", 0, false).unwrap();
        store.write(ino, 0, b"abc", false).unwrap();

        assert_eq!(store.mknod(b"f", 0, false), Err(Status::Exist));

        // Truncating mknod reuses the inode and empties the file.
        assert_eq!(store.mknod(b"f", 0, true), Ok(ino));
        let (bytes, pos) = store.read(ino, 0, 16).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(pos, 0);
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut store = FileStore::new();
        let ino = store.mknod(b"f", 1, false).unwrap();

        let new_pos = store.write(ino, 0, b"hello", false).unwrap();
        assert_eq!(new_pos, 5);
        let new_pos = store.write(ino, new_pos, b" world", false).unwrap();
        assert_eq!(new_pos, 11);

        let (bytes, pos) = store.read(ino, 0, 64).unwrap();
        assert_eq!(bytes, b"hello world");
        assert_eq!(pos, 11);

        // Read past the end returns nothing and keeps the position.
        let (bytes, pos) = store.read(ino, 40, 8).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(pos, 40);
    }

    #[test]
    fn test_write_past_reserved_zones_is_xfull() {
        let mut store = FileStore::new();
        let ino = store.mknod(b"f", 1, false).unwrap();
        let capacity = FS_ZONE_LEN;

        let fill = alloc::vec![0xAB; capacity];
        assert!(store.write(ino, 0, &fill, false).is_ok());

        // One more byte does not fit; the write fails whole.
        assert_eq!(store.write(ino, capacity as u32, b"x", false), Err(Status::XFull));
        let (bytes, _) = store.read(ino, 0, capacity + 8).unwrap();
        assert_eq!(bytes.len(), capacity);
    }

    #[test]
    fn test_link_unlink_keeps_inode_alive() {
        let mut store = FileStore::new();
        let ino = store.mknod(b"a", 0, false).unwrap();
        store.write(ino, 0, b"data", false).unwrap();

        assert_eq!(store.link(ino, b"b"), Status::Ok);
        assert_eq!(store.unlink(b"a"), Status::Ok);

        // Still reachable through the second name.
        assert_eq!(store.path(b"b"), Ok(ino));
        let (bytes, _) = store.read(ino, 0, 8).unwrap();
        assert_eq!(bytes, b"data");

        let free_before = store.free_zones();
        assert_eq!(store.unlink(b"b"), Status::Ok);
        assert!(store.free_zones() > free_before);
    }

    #[test]
    fn test_link_limits() {
        let mut store = FileStore::new();
        let ino = store.mknod(b"a", 0, false).unwrap();
        assert_eq!(store.link(ino, b"a"), Status::Exist);
        assert_eq!(store.link(9999, b"b"), Status::NoEnt);

        for n in 1..FS_LINK_MAX {
            let name = [b'l', b'0' + n];
            assert_eq!(store.link(ino, &name), Status::Ok);
        }
        assert_eq!(store.link(ino, b"over"), Status::MLink);
    }

    #[test]
    fn test_bad_names() {
        let mut store = FileStore::new();
        assert_eq!(store.mknod(b"", 0, false), Err(Status::Inval));
        assert_eq!(store.mknod(b"a/b", 0, false), Err(Status::NotDir));
        assert_eq!(
            store.mknod(b"a-very-long-name-indeed", 0, false),
            Err(Status::NameTooLong)
        );
    }

    #[test]
    fn test_zone_exhaustion_is_nospc() {
        let mut store = FileStore::new();
        let per_file = 8u8;
        let mut made = 0;
        loop {
            let name = [b'f', made];
            match store.mknod(&name, per_file, false) {
                Ok(_) => made += 1,
                Err(status) => {
                    assert_eq!(status, Status::NoSpc);
                    break;
                }
            }
        }
        assert_eq!(made as usize, FS_ZONE_COUNT / per_file as usize);
    }

    #[test]
    fn test_indir_maps_zones_to_sectors() {
        let mut store = FileStore::new();
        let ino = store.mknod(b"f", 2, false).unwrap();
        let s0 = store.indir(ino, 0).unwrap();
        let s1 = store.indir(ino, 1).unwrap();
        assert!(s0 >= FS_DATA_START_SECTOR);
        assert_ne!(s0, s1);
        assert_eq!(store.indir(ino, 2), Err(Status::Inval));
        assert_eq!(store.indir(404, 0), Err(Status::NoEnt));
    }
}
