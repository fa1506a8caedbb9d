//! Per-process file-descriptor table. Descriptors 0 and 1 are the console;
//! real files start at 2 and are never reused within a process.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::file::File;

/// mapid value for a descriptor that is not memory-mapped.
pub const UNMAPPED: i32 = -1;

pub struct FdNode {
    pub fd: u32,
    pub mapid: i32,
    pub file: Arc<Mutex<File>>,
}

pub struct FdTable {
    nodes: Vec<FdNode>,
    next_fd: u32,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            nodes: Vec::new(),
            next_fd: 2,
        }
    }

    /// Install a file and hand out the next descriptor number.
    pub fn install(&mut self, file: Arc<Mutex<File>>) -> u32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.nodes.push(FdNode {
            fd,
            mapid: UNMAPPED,
            file,
        });
        fd
    }

    pub fn get(&self, fd: u32) -> Option<Arc<Mutex<File>>> {
        self.nodes.iter().find(|n| n.fd == fd).map(|n| n.file.clone())
    }

    pub fn set_mapid(&mut self, fd: u32, mapid: i32) -> bool {
        match self.nodes.iter_mut().find(|n| n.fd == fd) {
            Some(node) => {
                node.mapid = mapid;
                true
            }
            None => false,
        }
    }

    pub fn mapid_of(&self, fd: u32) -> Option<i32> {
        self.nodes.iter().find(|n| n.fd == fd).map(|n| n.mapid)
    }

    /// Clear the mapid on whichever descriptor carries `mapid`.
    pub fn clear_mapid(&mut self, mapid: i32) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.mapid == mapid) {
            node.mapid = UNMAPPED;
        }
    }

    pub fn remove(&mut self, fd: u32) -> Option<FdNode> {
        let at = self.nodes.iter().position(|n| n.fd == fd)?;
        Some(self.nodes.remove(at))
    }

    /// Drain the table on process exit.
    pub fn take_all(&mut self) -> Vec<FdNode> {
        core::mem::take(&mut self.nodes)
    }
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_file() -> Arc<Mutex<File>> {
        // Handles in these tests never touch the disk; a table-only check.
        let fs = crate::fs::FileSys::format_in_memory(64);
        Arc::new(Mutex::new(fs.file_open_inode(fs.inode_open(1))))
    }

    #[test]
    fn descriptors_start_at_two_and_never_recycle() {
        let mut table = FdTable::new();
        let a = table.install(fake_file());
        let b = table.install(fake_file());
        assert_eq!((a, b), (2, 3));

        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        let c = table.install(fake_file());
        assert_eq!(c, 4, "closed descriptor numbers must not be reused");
    }

    #[test]
    fn mapid_tracking() {
        let mut table = FdTable::new();
        let fd = table.install(fake_file());
        assert_eq!(table.mapid_of(fd), Some(UNMAPPED));
        assert!(table.set_mapid(fd, 7));
        assert_eq!(table.mapid_of(fd), Some(7));
        table.clear_mapid(7);
        assert_eq!(table.mapid_of(fd), Some(UNMAPPED));
        assert!(!table.set_mapid(99, 1));
    }
}
