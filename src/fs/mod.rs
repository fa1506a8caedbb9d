//! The on-disk file system: inode-indexed files, hierarchical directories,
//! a free-sector bitmap, all behind the write-back buffer cache.

pub mod cache;
pub mod directory;
pub mod fd;
pub mod file;
pub mod freemap;
pub mod fsutil;
pub mod inode;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use cache::BufferCache;
use file::File;
use freemap::FreeMap;
use inode::Inode;

use crate::drivers::block::{self, BlockDevice, BlockRole};
use crate::scheduler::sync::Lock;

/// Free map file inode sector.
pub const FREE_MAP_SECTOR: u32 = 0;
/// Root directory file inode sector.
pub const ROOT_DIR_SECTOR: u32 = 1;

pub struct FileSys {
    pub(crate) cache: BufferCache,
    pub(crate) freemap: Mutex<FreeMap>,
    /// Serializes file-system operations that originate from system calls.
    /// Internal paths never re-acquire it.
    pub fs_lock: Lock,
    pub(crate) open_inodes: Mutex<Vec<Arc<Inode>>>,
}

static FS: Once<FileSys> = Once::new();

/// Bring up the global file system on the device holding the FileSys role.
pub fn init(format: bool) {
    let dev = block::role_device(BlockRole::FileSys).expect("no file system device");
    FS.call_once(|| {
        if format {
            crate::log_info!("Formatting file system.");
            FileSys::format(dev)
        } else {
            FileSys::open_existing(dev)
        }
    });
    crate::log_info!(
        "File system ready, {} free sectors.",
        fs().freemap.lock().count_free()
    );
}

pub fn fs() -> &'static FileSys {
    FS.get().expect("file system used before init")
}

/// Close a shared handle; the underlying file closes with the last owner.
pub fn close_shared(fs: &FileSys, file: Arc<Mutex<File>>) {
    if let Ok(inner) = Arc::try_unwrap(file) {
        fs.file_close(inner.into_inner());
    }
}

impl FileSys {
    fn empty(dev: Arc<dyn BlockDevice>) -> FileSys {
        let sectors = dev.capacity();
        FileSys {
            cache: BufferCache::new(dev),
            freemap: Mutex::new(FreeMap::new(sectors)),
            fs_lock: Lock::new(),
            open_inodes: Mutex::new(Vec::new()),
        }
    }

    /// Build a fresh file system: free-map file at sector 0, empty root
    /// directory at sector 1.
    pub fn format(dev: Arc<dyn BlockDevice>) -> FileSys {
        let fs = FileSys::empty(dev);
        {
            let mut freemap = fs.freemap.lock();
            freemap.mark_used(FREE_MAP_SECTOR);
            freemap.mark_used(ROOT_DIR_SECTOR);
        }
        let bitmap_len = fs.freemap.lock().byte_len();
        assert!(
            fs.inode_create(FREE_MAP_SECTOR, bitmap_len, false),
            "format: disk too small for the free map"
        );
        assert!(
            fs.dir_create(ROOT_DIR_SECTOR, ROOT_DIR_SECTOR, "/", 16),
            "format: cannot create root directory"
        );
        fs.flush_freemap();
        fs
    }

    /// Mount a previously formatted device, restoring the free map from
    /// its file.
    pub fn open_existing(dev: Arc<dyn BlockDevice>) -> FileSys {
        let sectors = dev.capacity();
        let fs = FileSys::empty(dev);
        let inode = fs.inode_open(FREE_MAP_SECTOR);
        let len = fs.inode_length(&inode);
        let mut bytes = alloc::vec![0u8; len as usize];
        fs.inode_read_at(&inode, &mut bytes, 0);
        fs.inode_close(inode);
        *fs.freemap.lock() = FreeMap::from_bytes(sectors, &bytes);
        fs
    }

    /// Persist the in-memory free map into its file. The file never grows
    /// here: format sized it for the whole bitmap.
    pub(crate) fn flush_freemap(&self) {
        let bytes = self.freemap.lock().to_bytes();
        let inode = self.inode_open(FREE_MAP_SECTOR);
        self.inode_write_at(&inode, &bytes, 0);
        self.inode_close(inode);
    }

    /// Durability fence: everything dirty goes to disk.
    pub fn writeback_all(&self) {
        self.cache.writeback_all();
    }

    /// Shutdown: persist the free map, then flush.
    pub fn done(&self) {
        self.flush_freemap();
        self.cache.writeback_all();
    }

    // ── create / open / remove / mkdir ───────────────────────

    /// Create a zero-filled regular file of `initial_size` bytes under the
    /// directory in `dir_sector`.
    pub fn create(&self, dir_sector: u32, name: &str, initial_size: u32) -> bool {
        let dir = match self.dir_open(self.inode_open(dir_sector)) {
            Some(dir) => dir,
            None => return false,
        };
        if self.dir_lookup(&dir, name).is_some() {
            self.dir_close(dir);
            return false;
        }
        let sector = match self.freemap.lock().allocate() {
            Some(sector) => sector,
            None => {
                self.dir_close(dir);
                return false;
            }
        };
        let mut ok = self.inode_create(sector, initial_size, false);
        if ok {
            ok = self.dir_add(&dir, name, sector);
        }
        if !ok {
            // Release whatever was allocated through the removal path.
            let inode = self.inode_open(sector);
            self.inode_remove(&inode);
            self.inode_close(inode);
        }
        self.dir_close(dir);
        ok
    }

    /// Open `name` under the directory in `dir_sector`. Directories open
    /// fine; readdir/isdir work through the descriptor.
    pub fn open(&self, dir_sector: u32, name: &str) -> Option<File> {
        let dir = self.dir_open(self.inode_open(dir_sector))?;
        let found = self.dir_lookup(&dir, name);
        self.dir_close(dir);
        Some(self.file_open_inode(self.inode_open(found?)))
    }

    /// Remove `name` from the directory in `dir_sector`. Non-empty
    /// directories stay; open handles keep the data alive until the last
    /// close.
    pub fn remove(&self, dir_sector: u32, name: &str) -> bool {
        let dir = match self.dir_open(self.inode_open(dir_sector)) {
            Some(dir) => dir,
            None => return false,
        };
        let target_sector = match self.dir_lookup(&dir, name) {
            Some(sector) => sector,
            None => {
                self.dir_close(dir);
                return false;
            }
        };
        let target = self.inode_open(target_sector);
        if self.inode_is_dir(&target) {
            let empty = match self.dir_open(self.inode_reopen(&target)) {
                Some(tdir) => {
                    let empty = self.dir_is_empty(&tdir);
                    self.dir_close(tdir);
                    empty
                }
                None => true,
            };
            if !empty {
                self.inode_close(target);
                self.dir_close(dir);
                return false;
            }
        }
        self.inode_close(target);
        let ok = self.dir_remove(&dir, name);
        self.dir_close(dir);
        ok
    }

    /// Create a subdirectory (16 entries preallocated, like the root).
    pub fn mkdir(&self, dir_sector: u32, name: &str) -> bool {
        let dir = match self.dir_open(self.inode_open(dir_sector)) {
            Some(dir) => dir,
            None => return false,
        };
        let exists = self.dir_lookup(&dir, name).is_some();
        self.dir_close(dir);
        if exists {
            return false;
        }
        let sector = match self.freemap.lock().allocate() {
            Some(sector) => sector,
            None => return false,
        };
        let ok = self.dir_create(sector, dir_sector, name, 16);
        if !ok {
            let inode = self.inode_open(sector);
            self.inode_remove(&inode);
            self.inode_close(inode);
        }
        ok
    }

    #[cfg(test)]
    pub(crate) fn format_in_memory(sectors: u32) -> FileSys {
        FileSys::format(Arc::new(crate::drivers::block::MemDisk::new(sectors)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::block::MemDisk;

    #[test]
    fn file_round_trip_at_offsets() {
        let fs = FileSys::format_in_memory(1024);
        assert!(fs.create(ROOT_DIR_SECTOR, "data", 0));
        let mut f = fs.open(ROOT_DIR_SECTOR, "data").unwrap();

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.file_write(&mut f, &payload), 3000);
        assert_eq!(fs.file_length(&f), 3000);

        let mut back = alloc::vec![0u8; 3000];
        assert_eq!(fs.file_read_at(&f, &mut back, 0), 3000);
        assert_eq!(back, payload);

        // Overwrite in the middle, crossing a sector boundary.
        fs.file_write_at(&f, b"hello", 510);
        let mut five = [0u8; 5];
        fs.file_read_at(&f, &mut five, 510);
        assert_eq!(&five, b"hello");

        // Write far past EOF grows the file with a zero-filled gap.
        fs.file_write_at(&f, b"tail", 100_000);
        assert_eq!(fs.file_length(&f), 100_004);
        let mut gap = [0xFFu8; 4];
        fs.file_read_at(&f, &mut gap, 50_000);
        assert_eq!(gap, [0, 0, 0, 0]);
        let mut tail = [0u8; 4];
        fs.file_read_at(&f, &mut tail, 100_000);
        assert_eq!(&tail, b"tail");

        fs.file_close(f);
    }

    #[test]
    fn double_indirect_files_read_back() {
        let fs = FileSys::format_in_memory(1024);
        // 200 KiB needs the doubly-indirect level (12 + 128 sectors cover
        // only 70 KiB).
        assert!(fs.create(ROOT_DIR_SECTOR, "big", 200 * 1024));
        let f = fs.open(ROOT_DIR_SECTOR, "big").unwrap();
        assert_eq!(fs.file_length(&f), 200 * 1024);

        fs.file_write_at(&f, b"deep", 199 * 1024);
        let mut buf = [0u8; 4];
        fs.file_read_at(&f, &mut buf, 199 * 1024);
        assert_eq!(&buf, b"deep");
        fs.file_close(f);
    }

    #[test]
    fn survives_remount() {
        let disk = Arc::new(MemDisk::new(256));
        {
            let fs = FileSys::format(disk.clone());
            assert!(fs.create(ROOT_DIR_SECTOR, "keep", 0));
            let mut f = fs.open(ROOT_DIR_SECTOR, "keep").unwrap();
            fs.file_write(&mut f, b"persistent");
            fs.file_close(f);
            fs.done();
        }
        let fs = FileSys::open_existing(disk);
        let f = fs.open(ROOT_DIR_SECTOR, "keep").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(fs.file_read_at(&f, &mut buf, 0), 10);
        assert_eq!(&buf, b"persistent");
        fs.file_close(f);
    }

    #[test]
    fn directory_lifecycle() {
        let fs = FileSys::format_in_memory(512);
        assert!(fs.mkdir(ROOT_DIR_SECTOR, "a"));
        let a = fs.parse(ROOT_DIR_SECTOR, "/a").unwrap();
        assert!(fs.mkdir(a, "b"));

        // chdir /a then mkdir c: relative to the working directory.
        let wd = fs.parse(ROOT_DIR_SECTOR, "/a").unwrap();
        assert!(fs.mkdir(wd, "c"));
        assert!(fs.parse(ROOT_DIR_SECTOR, "/a/c").is_some());

        // A non-empty directory cannot be removed.
        assert!(!fs.remove(ROOT_DIR_SECTOR, "a"));
        assert!(fs.remove(a, "b"));
        assert!(fs.remove(a, "c"));
        assert!(fs.remove(ROOT_DIR_SECTOR, "a"));
        assert!(fs.parse(ROOT_DIR_SECTOR, "/a").is_none());
    }

    #[test]
    fn dot_entries_point_home() {
        let fs = FileSys::format_in_memory(512);
        fs.mkdir(ROOT_DIR_SECTOR, "sub");
        let sub = fs.parse(ROOT_DIR_SECTOR, "/sub").unwrap();
        assert_eq!(fs.parse(sub, "."), Some(sub));
        assert_eq!(fs.parse(sub, ".."), Some(ROOT_DIR_SECTOR));
        // The root's .. is the root itself.
        assert_eq!(fs.parse(ROOT_DIR_SECTOR, "/.."), Some(ROOT_DIR_SECTOR));
    }

    #[test]
    fn parse_edge_cases() {
        let fs = FileSys::format_in_memory(512);
        fs.mkdir(ROOT_DIR_SECTOR, "a");
        let a = fs.parse(ROOT_DIR_SECTOR, "a").unwrap();
        fs.mkdir(a, "b");

        assert_eq!(fs.parse(a, "/"), Some(ROOT_DIR_SECTOR));
        assert_eq!(fs.parse(a, ""), Some(a));
        assert_eq!(fs.parse(ROOT_DIR_SECTOR, "a//b"), fs.parse(ROOT_DIR_SECTOR, "a/b"));
        assert_eq!(fs.parse(ROOT_DIR_SECTOR, "//a///b"), fs.parse(ROOT_DIR_SECTOR, "/a/b"));
        assert!(fs.parse(ROOT_DIR_SECTOR, "missing/x").is_none());

        // A file mid-path is an error, a file at the end is fine.
        fs.create(a, "f", 16);
        assert!(fs.parse(ROOT_DIR_SECTOR, "a/f").is_some());
        assert!(fs.parse(ROOT_DIR_SECTOR, "a/f/x").is_none());
    }

    #[test]
    fn remove_while_open_defers_reclamation() {
        let fs = FileSys::format_in_memory(512);
        fs.create(ROOT_DIR_SECTOR, "ghost", 0);
        let mut f = fs.open(ROOT_DIR_SECTOR, "ghost").unwrap();
        fs.file_write(&mut f, b"still here");
        let free_before_remove = fs.freemap.lock().count_free();

        assert!(fs.remove(ROOT_DIR_SECTOR, "ghost"));
        // Gone from the namespace, still readable through the handle.
        assert_eq!(fs.inode_open_count(f.inode.sector), 1);
        assert!(fs.open(ROOT_DIR_SECTOR, "ghost").is_none());
        let mut buf = [0u8; 10];
        assert_eq!(fs.file_read_at(&f, &mut buf, 0), 10);
        assert_eq!(&buf, b"still here");

        // Sectors come back only on the last close.
        assert_eq!(fs.freemap.lock().count_free(), free_before_remove);
        fs.file_close(f);
        assert!(fs.freemap.lock().count_free() > free_before_remove);
        assert!(fs.open_inode_sectors().is_empty());
    }

    #[test]
    fn full_disk_create_fails_without_leaking() {
        let fs = FileSys::format_in_memory(64);
        let free = fs.freemap.lock().count_free();
        // Far more data than the 64-sector disk can hold.
        assert!(!fs.create(ROOT_DIR_SECTOR, "huge", 1024 * 1024));
        assert!(fs.open(ROOT_DIR_SECTOR, "huge").is_none());
        assert_eq!(fs.freemap.lock().count_free(), free);
    }

    #[test]
    fn duplicate_names_rejected() {
        let fs = FileSys::format_in_memory(256);
        assert!(fs.create(ROOT_DIR_SECTOR, "once", 0));
        assert!(!fs.create(ROOT_DIR_SECTOR, "once", 0));
        assert!(!fs.mkdir(ROOT_DIR_SECTOR, "once"));
    }
}
