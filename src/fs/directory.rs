//! Directories are regular files holding an array of fixed-size entries.
//! Every directory carries `.` and `..`; lookup is linear.

use alloc::string::String;
use alloc::sync::Arc;

use super::inode::Inode;
use super::{FileSys, ROOT_DIR_SECTOR};

/// Longest file name component, excluding the NUL.
pub const NAME_MAX: usize = 14;
/// On-disk size of one directory entry.
pub const DIR_ENTRY_SIZE: usize = 20;

/// One directory slot. `in_use` false marks a reusable hole, not a file
/// that is merely closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode_sector: u32,
    pub name: [u8; NAME_MAX + 1],
    pub in_use: bool,
}

impl DirEntry {
    pub fn new(name: &str, inode_sector: u32) -> DirEntry {
        debug_assert!(name.len() <= NAME_MAX);
        let mut buf = [0u8; NAME_MAX + 1];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        DirEntry {
            inode_sector,
            name: buf,
            in_use: true,
        }
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX + 1);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn pack(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut out = [0u8; DIR_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.inode_sector.to_le_bytes());
        out[4..4 + NAME_MAX + 1].copy_from_slice(&self.name);
        out[19] = self.in_use as u8;
        out
    }

    pub fn unpack(raw: &[u8; DIR_ENTRY_SIZE]) -> DirEntry {
        let mut name = [0u8; NAME_MAX + 1];
        name.copy_from_slice(&raw[4..4 + NAME_MAX + 1]);
        DirEntry {
            inode_sector: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            name,
            in_use: raw[19] != 0,
        }
    }
}

/// An open directory with a read position for readdir.
pub struct Dir {
    pub inode: Arc<Inode>,
    pos: u32,
}

/// Split a path into its directory prefix and final component.
/// The empty prefix means "relative to the working directory".
/// Returns None when there is no final component (empty path or a path
/// ending in '/'), except for the root itself which resolves to
/// ("/", ".").
pub fn separate_path(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    if path == "/" {
        return Some(("/", "."));
    }
    if path.ends_with('/') {
        return None;
    }
    match path.rfind('/') {
        None => Some(("", path)),
        Some(0) => Some(("/", &path[1..])),
        Some(i) => Some((&path[..i], &path[i + 1..])),
    }
}

impl FileSys {
    /// Wrap an open inode as a directory, taking ownership of the handle.
    /// Closes it and fails when the inode is not a directory.
    pub fn dir_open(&self, inode: Arc<Inode>) -> Option<Dir> {
        if self.inode_is_dir(&inode) {
            Some(Dir { inode, pos: 0 })
        } else {
            self.inode_close(inode);
            None
        }
    }

    pub fn dir_open_root(&self) -> Dir {
        self.dir_open(self.inode_open(ROOT_DIR_SECTOR))
            .expect("root directory corrupted")
    }

    pub fn dir_close(&self, dir: Dir) {
        self.inode_close(dir.inode);
    }

    /// Create a directory in `sector` under `parent`, seeding `.` and `..`
    /// and linking it as `name` in the parent.
    pub fn dir_create(&self, sector: u32, parent: u32, name: &str, entry_cnt: u32) -> bool {
        if !self.inode_create(sector, entry_cnt * DIR_ENTRY_SIZE as u32, true) {
            return false;
        }
        let new_dir = match self.dir_open(self.inode_open(sector)) {
            Some(d) => d,
            None => return false,
        };
        let mut ok = self.dir_add(&new_dir, ".", sector);
        ok &= self.dir_add(&new_dir, "..", parent);
        self.dir_close(new_dir);
        if sector != parent {
            let parent_dir = match self.dir_open(self.inode_open(parent)) {
                Some(d) => d,
                None => return false,
            };
            ok &= self.dir_add(&parent_dir, name, sector);
            self.dir_close(parent_dir);
        }
        ok
    }

    fn entry_at(&self, dir: &Dir, ofs: u32) -> Option<DirEntry> {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        if self.inode_read_at(&dir.inode, &mut raw, ofs) != DIR_ENTRY_SIZE {
            return None;
        }
        Some(DirEntry::unpack(&raw))
    }

    /// Find `name`, returning the entry and its byte offset.
    fn lookup_entry(&self, dir: &Dir, name: &str) -> Option<(DirEntry, u32)> {
        let mut ofs = 0;
        while let Some(entry) = self.entry_at(dir, ofs) {
            if entry.in_use && entry.name_str() == name {
                return Some((entry, ofs));
            }
            ofs += DIR_ENTRY_SIZE as u32;
        }
        None
    }

    /// Inode sector of `name` within `dir`.
    pub fn dir_lookup(&self, dir: &Dir, name: &str) -> Option<u32> {
        self.lookup_entry(dir, name).map(|(e, _)| e.inode_sector)
    }

    /// Add an entry, reusing the first free slot. Fails on duplicates and
    /// over-long names.
    pub fn dir_add(&self, dir: &Dir, name: &str, inode_sector: u32) -> bool {
        if name.is_empty() || name.len() > NAME_MAX {
            return false;
        }
        if self.lookup_entry(dir, name).is_some() {
            return false;
        }
        // First unused slot, or end of file.
        let mut ofs = 0;
        while let Some(entry) = self.entry_at(dir, ofs) {
            if !entry.in_use {
                break;
            }
            ofs += DIR_ENTRY_SIZE as u32;
        }
        let entry = DirEntry::new(name, inode_sector);
        self.inode_write_at(&dir.inode, &entry.pack(), ofs) == DIR_ENTRY_SIZE
    }

    /// Clear the entry for `name` and mark its inode removed. Sector
    /// reclamation waits for the last close.
    pub fn dir_remove(&self, dir: &Dir, name: &str) -> bool {
        let (mut entry, ofs) = match self.lookup_entry(dir, name) {
            Some(found) => found,
            None => return false,
        };
        let inode = self.inode_open(entry.inode_sector);
        entry.in_use = false;
        if self.inode_write_at(&dir.inode, &entry.pack(), ofs) != DIR_ENTRY_SIZE {
            self.inode_close(inode);
            return false;
        }
        self.inode_remove(&inode);
        self.inode_close(inode);
        true
    }

    /// Next entry name, skipping `.` and `..`. Advances the directory
    /// position.
    pub fn dir_readdir(&self, dir: &mut Dir) -> Option<String> {
        while let Some(entry) = self.entry_at(dir, dir.pos) {
            dir.pos += DIR_ENTRY_SIZE as u32;
            if entry.in_use && entry.name_str() != "." && entry.name_str() != ".." {
                return Some(String::from(entry.name_str()));
            }
        }
        None
    }

    /// True when the directory holds nothing besides `.` and `..`.
    pub fn dir_is_empty(&self, dir: &Dir) -> bool {
        let mut probe = Dir {
            inode: self.inode_reopen(&dir.inode),
            pos: 0,
        };
        let empty = self.dir_readdir(&mut probe).is_none();
        self.dir_close(probe);
        empty
    }

    /// Resolve a path to the inode sector of its final component.
    /// A leading '/' is absolute, anything else starts at `wd`;
    /// consecutive slashes collapse; the empty path is `wd` itself.
    pub fn parse(&self, wd: u32, path: &str) -> Option<u32> {
        let mut sector = if path.starts_with('/') {
            ROOT_DIR_SECTOR
        } else {
            wd
        };
        for token in path.split('/').filter(|t| !t.is_empty()) {
            let dir = self.dir_open(self.inode_open(sector))?;
            let next = self.dir_lookup(&dir, token);
            self.dir_close(dir);
            sector = next?;
        }
        Some(sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packs_to_fixed_layout() {
        let entry = DirEntry::new("hello.txt", 42);
        let raw = entry.pack();
        assert_eq!(u32::from_le_bytes(raw[0..4].try_into().unwrap()), 42);
        assert_eq!(&raw[4..13], b"hello.txt");
        assert_eq!(raw[13], 0);
        assert_eq!(raw[19], 1);
        assert_eq!(DirEntry::unpack(&raw), entry);
    }

    #[test]
    fn name_fills_fourteen_bytes() {
        let entry = DirEntry::new("fourteen-bytes", 1);
        assert_eq!(entry.name_str(), "fourteen-bytes");
        let raw = entry.pack();
        assert_eq!(DirEntry::unpack(&raw).name_str(), "fourteen-bytes");
    }

    #[test]
    fn separate_path_cases() {
        assert_eq!(separate_path("a/b/c"), Some(("a/b", "c")));
        assert_eq!(separate_path("/a"), Some(("/", "a")));
        assert_eq!(separate_path("file"), Some(("", "file")));
        assert_eq!(separate_path("/"), Some(("/", ".")));
        assert_eq!(separate_path(""), None);
        assert_eq!(separate_path("a/b/"), None);
    }
}
