//! Supplemental page table (SPT) and per-process VMA layout, including
//! memory-mapped files. The SPT is the authoritative record of every
//! legitimate user page; the hardware PTE may lag behind it (lazy load).

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::fs::file::File;
use crate::memory::{pg_ofs, pg_round_down, PGSIZE, PHYS_BASE, STACK_FLOOR};
use crate::scheduler::task::Tid;

bitflags! {
    /// Allocation hints for freshly installed pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Wire the backing frame against eviction.
        const PIN = 1 << 0;
        /// Page may be shared read-only between processes.
        const SHARED = 1 << 1;
    }
}

/// What a user page is for. `Unused` is only ever a classification result;
/// it is never stored in the SPT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Code,
    Data,
    Stack,
    Mmap,
    Unused,
}

/// Where the page's bytes currently live. `Swap` is reserved: anonymous
/// pages are pinned in memory until a swap store exists, so nothing moves
/// there yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Memory,
    NotPresent,
    Swap,
}

/// One supplemental page-table entry.
#[derive(Debug, Clone, Copy)]
pub struct PageNode {
    pub owner: Tid,
    pub upage: u64,
    pub role: Role,
    pub loc: Location,
    pub frame: Option<usize>,
    pub shared: bool,
}

lazy_static! {
    /// tid → (user page → node), mirroring the per-process hash tables of
    /// the classic design.
    static ref SPT: Mutex<HashMap<Tid, HashMap<u64, PageNode>>> = Mutex::new(HashMap::new());
}

/// Register an address space for `tid`.
pub fn process_init(tid: Tid) {
    SPT.lock().insert(tid, HashMap::new());
}

/// Record a page. Returns false if the page already exists.
pub fn add_page(tid: Tid, upage: u64, role: Role, loc: Location, frame: Option<usize>) -> bool {
    assert!(role != Role::Unused);
    assert_eq!(pg_ofs(upage), 0);
    let mut spt = SPT.lock();
    let pages = spt.get_mut(&tid).expect("SPT: unknown process");
    if pages.contains_key(&upage) {
        return false;
    }
    pages.insert(
        upage,
        PageNode {
            owner: tid,
            upage,
            role,
            loc,
            frame,
            shared: false,
        },
    );
    true
}

/// Look up the page covering `uaddr`.
pub fn seek(tid: Tid, uaddr: u64) -> Option<PageNode> {
    let spt = SPT.lock();
    spt.get(&tid)?.get(&pg_round_down(uaddr)).copied()
}

pub fn role_of(tid: Tid, uaddr: u64) -> Option<Role> {
    seek(tid, uaddr).map(|n| n.role)
}

/// Link a frame to a page that was not in memory.
pub fn assign_frame(tid: Tid, upage: u64, frame: usize) {
    let mut spt = SPT.lock();
    if let Some(node) = spt.get_mut(&tid).and_then(|p| p.get_mut(&upage)) {
        debug_assert!(node.loc != Location::Memory);
        debug_assert!(node.frame.is_none());
        node.loc = Location::Memory;
        node.frame = Some(frame);
    }
}

/// Unlink an evicted page from its frame.
pub fn mark_not_present(tid: Tid, upage: u64) {
    let mut spt = SPT.lock();
    if let Some(node) = spt.get_mut(&tid).and_then(|p| p.get_mut(&upage)) {
        node.loc = Location::NotPresent;
        node.frame = None;
    }
}

/// Destroy one page: frame, hardware mapping and SPT entry.
pub fn free_page(tid: Tid, uaddr: u64) {
    let upage = pg_round_down(uaddr);
    let node = {
        let mut spt = SPT.lock();
        match spt.get_mut(&tid).and_then(|p| p.remove(&upage)) {
            Some(node) => node,
            None => return,
        }
    };
    if let Some(frame) = node.frame {
        crate::vm::frame::free_frame(frame);
    }
    if let Some(pagedir) = crate::scheduler::with_thread(tid, |t| t.pagedir).flatten() {
        crate::memory::paging::clear_user_page(pagedir, upage);
    }
}

/// Destroy every page in [begin, end).
pub fn free_range(tid: Tid, begin: u64, end: u64) {
    assert!(begin < end);
    let mut upage = pg_round_down(begin);
    while upage < end {
        free_page(tid, upage);
        upage += PGSIZE;
    }
}

/// Tear down a process's whole page list on exit.
pub fn destroy_pagelist(tid: Tid) {
    let pages = match SPT.lock().remove(&tid) {
        Some(pages) => pages,
        None => return,
    };
    let pagedir = crate::scheduler::with_thread(tid, |t| t.pagedir).flatten();
    for (upage, node) in pages {
        if let Some(frame) = node.frame {
            crate::vm::frame::free_frame(frame);
        }
        if let Some(pagedir) = pagedir {
            crate::memory::paging::clear_user_page(pagedir, upage);
        }
    }
}

// ── VMA ──────────────────────────────────────────────────────

/// One mmap reservation.
pub struct MmapNode {
    pub mapid: i32,
    pub fd: u32,
    pub file: Arc<Mutex<File>>,
    pub begin: u64,
    pub end: u64,
}

/// Per-process virtual-memory layout: segment extents plus the mmap list.
pub struct Vma {
    /// True while the ELF loader populates the code segment; code-extent
    /// faults are only legitimate then.
    pub loading_exe: bool,
    pub code_begin: u64,
    pub code_end: u64,
    pub data_begin: u64,
    pub data_end: u64,
    /// Stack grows downward: begin is the lowest mapped page.
    pub stack_begin: u64,
    pub stack_end: u64,
    pub mmaps: Vec<MmapNode>,
    next_mapid: i32,
}

impl Vma {
    pub fn new() -> Vma {
        Vma {
            loading_exe: false,
            code_begin: 0,
            code_end: 0,
            data_begin: 0,
            data_end: 0,
            stack_begin: 0,
            stack_end: 0,
            mmaps: Vec::new(),
            next_mapid: 0,
        }
    }

    /// Map ids count up from 1 and are never reused within the process.
    pub fn allocate_mapid(&mut self) -> i32 {
        self.next_mapid += 1;
        self.next_mapid
    }

    pub fn mmap_by_addr(&self, addr: u64) -> Option<&MmapNode> {
        self.mmaps.iter().find(|m| addr >= m.begin && addr < m.end)
    }

    /// Would [begin, end) collide with any existing region?
    pub fn region_conflicts(&self, begin: u64, end: u64) -> bool {
        let overlaps = |lo: u64, hi: u64| lo < end && begin < hi;
        if overlaps(self.code_begin, self.code_end)
            || overlaps(self.data_begin, self.data_end)
            || overlaps(STACK_FLOOR, self.stack_end)
        {
            return true;
        }
        self.mmaps.iter().any(|m| overlaps(m.begin, m.end))
    }

    /// Which segment a faulting address belongs to. `user_rsp` feeds the
    /// stack-growth heuristic: anything within 32 bytes below the saved
    /// stack pointer (and above the 8 MiB floor) counts as stack.
    pub fn classify(&self, addr: u64, user_rsp: u64) -> Role {
        if self.loading_exe && addr >= self.code_begin && addr <= self.code_end {
            return Role::Code;
        }
        if addr >= self.code_begin && addr < self.code_end {
            return Role::Code;
        }
        if addr >= self.data_begin && addr < self.data_end {
            return Role::Data;
        }
        if addr >= STACK_FLOOR
            && addr < self.stack_end
            && (addr >= self.stack_begin || addr + 32 >= user_rsp)
        {
            return Role::Stack;
        }
        if self.mmap_by_addr(addr).is_some() {
            return Role::Mmap;
        }
        Role::Unused
    }
}

impl Default for Vma {
    fn default() -> Self {
        Vma::new()
    }
}

// ── Page population ──────────────────────────────────────────

/// Allocate and map a brand-new page. For Mmap pages the corresponding
/// file slice is read in (one page or the tail, zero-filled past EOF).
pub fn install_new_page(tid: Tid, upage: u64, role: Role, writable: bool, flags: PageFlags) -> bool {
    let pagedir = match crate::scheduler::with_thread(tid, |t| t.pagedir).flatten() {
        Some(pd) => pd,
        None => return false,
    };
    let frame = match crate::vm::frame::allocate(tid, upage, flags.contains(PageFlags::PIN)) {
        Some(frame) => frame,
        None => return false,
    };
    if !crate::memory::paging::map_user_page(pagedir, upage, crate::vm::frame::phys_of(frame), writable)
    {
        crate::vm::frame::free_frame(frame);
        return false;
    }
    if !add_page(tid, upage, role, Location::Memory, Some(frame)) {
        crate::memory::paging::clear_user_page(pagedir, upage);
        crate::vm::frame::free_frame(frame);
        return false;
    }
    if role == Role::Mmap && !read_mmap_contents(tid, upage, frame) {
        free_page(tid, upage);
        return false;
    }
    true
}

/// Bring a not-present page back into memory from its recorded source.
/// Only Mmap pages ever leave memory (anonymous pages are pinned), so the
/// source is always the backing file.
pub fn pull_page(tid: Tid, node: &PageNode) -> bool {
    debug_assert!(node.loc != Location::Memory);
    if node.role != Role::Mmap {
        // Swap-out for anonymous pages is not implemented; nothing else
        // can be off-memory.
        return false;
    }
    let pagedir = match crate::scheduler::with_thread(tid, |t| t.pagedir).flatten() {
        Some(pd) => pd,
        None => return false,
    };
    let frame = match crate::vm::frame::allocate(tid, node.upage, false) {
        Some(frame) => frame,
        None => return false,
    };
    if !crate::memory::paging::map_user_page(
        pagedir,
        node.upage,
        crate::vm::frame::phys_of(frame),
        true,
    ) {
        crate::vm::frame::free_frame(frame);
        return false;
    }
    assign_frame(tid, node.upage, frame);
    if !read_mmap_contents(tid, node.upage, frame) {
        free_page(tid, node.upage);
        return false;
    }
    true
}

/// Fill `frame` with the file bytes backing the mmap page at `upage`.
fn read_mmap_contents(tid: Tid, upage: u64, frame: usize) -> bool {
    let region = crate::scheduler::with_thread(tid, |t| {
        t.vma
            .mmap_by_addr(upage)
            .map(|m| (m.file.clone(), m.begin, m.end))
    })
    .flatten();
    let (file, begin, end) = match region {
        Some(r) => r,
        None => return false,
    };
    let offset = upage - begin;
    let read_bytes = PGSIZE.min(end - upage) as usize;
    let fs = crate::fs::fs();
    let file = file.lock();
    crate::vm::frame::with_frame_slice(frame, |slice| {
        fs.file_read_at(&file, &mut slice[..read_bytes], offset as u32) == read_bytes
    })
}

// ── mmap / munmap ────────────────────────────────────────────

/// Reserve [addr, addr + filesize) for a file mapping. Nothing is
/// populated until the first fault. Returns the new map id or -1.
pub fn mmap_map(tid: Tid, fd: u32, file: Arc<Mutex<File>>, addr: u64) -> i32 {
    if addr == 0 || pg_ofs(addr) != 0 {
        return -1;
    }
    let filesize = {
        let f = file.lock();
        crate::fs::fs().file_length(&f) as u64
    };
    if filesize == 0 {
        return -1;
    }
    let end = addr + filesize;
    if end > PHYS_BASE {
        return -1;
    }
    crate::scheduler::with_thread(tid, |t| {
        if t.vma.region_conflicts(addr, end) {
            return -1;
        }
        let mapid = t.vma.allocate_mapid();
        t.vma.mmaps.push(MmapNode {
            mapid,
            fd,
            file: file.clone(),
            begin: addr,
            end,
        });
        mapid
    })
    .unwrap_or(-1)
}

/// Write dirty pages back, free the region and close its file handle.
pub fn mmap_unmap(tid: Tid, mapid: i32) {
    let node = crate::scheduler::with_thread(tid, |t| {
        t.vma
            .mmaps
            .iter()
            .position(|m| m.mapid == mapid)
            .map(|i| t.vma.mmaps.remove(i))
    })
    .flatten();
    let node = match node {
        Some(node) => node,
        None => return,
    };
    writeback_and_free_region(tid, &node);
    crate::fs::close_shared(crate::fs::fs(), node.file);
}

/// Unmap every region a process still holds, on exit.
pub fn mmap_unmap_all(tid: Tid) {
    loop {
        let mapid = crate::scheduler::with_thread(tid, |t| t.vma.mmaps.first().map(|m| m.mapid))
            .flatten();
        match mapid {
            Some(mapid) => mmap_unmap(tid, mapid),
            None => break,
        }
    }
}

fn writeback_and_free_region(tid: Tid, node: &MmapNode) {
    let pagedir = crate::scheduler::with_thread(tid, |t| t.pagedir).flatten();
    let mut upage = node.begin;
    while upage < node.end {
        if let Some(page) = seek(tid, upage) {
            if page.loc == Location::Memory {
                let dirty = pagedir
                    .map(|pd| crate::memory::paging::is_dirty(pd, upage))
                    .unwrap_or(false);
                if dirty {
                    if let Some(frame) = page.frame {
                        mmap_writeback_page(node, upage, frame);
                    }
                }
            }
        }
        upage += PGSIZE;
    }
    free_range(tid, node.begin, node.end);
}

/// Flush one dirty mmap page to its backing file. Also used by frame
/// eviction.
pub fn mmap_writeback_page(node: &MmapNode, upage: u64, frame: usize) {
    let offset = upage - node.begin;
    let bytes = PGSIZE.min(node.end - upage) as usize;
    let fs = crate::fs::fs();
    let file = node.file.lock();
    crate::vm::frame::with_frame_slice(frame, |slice| {
        fs.file_write_at(&file, &slice[..bytes], offset as u32);
    });
}

/// Snapshot of the mmap region covering `upage`, for eviction.
pub fn mmap_region_of(tid: Tid, upage: u64) -> Option<(Arc<Mutex<File>>, u64, u64)> {
    crate::scheduler::with_thread(tid, |t| {
        t.vma
            .mmap_by_addr(upage)
            .map(|m| (m.file.clone(), m.begin, m.end))
    })
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vma_with_layout() -> Vma {
        let mut vma = Vma::new();
        vma.code_begin = 0x0040_0000;
        vma.code_end = 0x0040_3000;
        vma.data_begin = 0x0040_4000;
        vma.data_end = 0x0040_6000;
        vma.stack_begin = PHYS_BASE - PGSIZE;
        vma.stack_end = PHYS_BASE;
        vma
    }

    #[test]
    fn classify_segments() {
        let vma = vma_with_layout();
        let rsp = PHYS_BASE - 100;
        assert_eq!(vma.classify(0x0040_0000, rsp), Role::Code);
        assert_eq!(vma.classify(0x0040_2FFF, rsp), Role::Code);
        assert_eq!(vma.classify(0x0040_4000, rsp), Role::Data);
        assert_eq!(vma.classify(PHYS_BASE - 50, rsp), Role::Stack);
        assert_eq!(vma.classify(0x2000_0000, rsp), Role::Unused);
    }

    #[test]
    fn stack_heuristic_honors_rsp_window() {
        let vma = vma_with_layout();
        let rsp = PHYS_BASE - 3 * PGSIZE;
        // Within 32 bytes below rsp: legitimate growth.
        assert_eq!(vma.classify(rsp - 32, rsp), Role::Stack);
        // Far below rsp and below the mapped extent: not stack.
        assert_eq!(vma.classify(rsp - 33, rsp), Role::Unused);
        // Above the current extent is always stack (already-mapped range).
        assert_eq!(vma.classify(PHYS_BASE - PGSIZE + 8, rsp), Role::Stack);
    }

    #[test]
    fn stack_floor_is_hard() {
        let vma = vma_with_layout();
        let rsp = STACK_FLOOR;
        assert_eq!(vma.classify(STACK_FLOOR, rsp), Role::Stack);
        assert_eq!(vma.classify(STACK_FLOOR - 1, rsp - 1), Role::Unused);
    }

    #[test]
    fn loading_exe_permits_code_extension() {
        let mut vma = vma_with_layout();
        let rsp = PHYS_BASE - 100;
        assert_eq!(vma.classify(vma.code_end, rsp), Role::Unused);
        vma.loading_exe = true;
        assert_eq!(vma.classify(vma.code_end, rsp), Role::Code);
    }

    #[test]
    fn mapids_are_monotonic_and_unique() {
        let mut vma = Vma::new();
        assert_eq!(vma.allocate_mapid(), 1);
        assert_eq!(vma.allocate_mapid(), 2);
        assert_eq!(vma.allocate_mapid(), 3);
    }

    #[test]
    fn region_conflict_detection() {
        let vma = vma_with_layout();
        // Overlapping code.
        assert!(vma.region_conflicts(0x0040_2000, 0x0040_4000));
        // The whole stack window is reserved.
        assert!(vma.region_conflicts(PHYS_BASE - 2 * PGSIZE, PHYS_BASE - PGSIZE));
        // Free space between data and the stack floor.
        assert!(!vma.region_conflicts(0x1000_0000, 0x1000_2000));
    }
}
