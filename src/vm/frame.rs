//! The user frame pool: a fixed array of physical frames claimed at boot,
//! handed to the SPT on demand and reclaimed by clock eviction.
//!
//! Eviction policy: second-chance over unpinned frames, preferring
//! not-accessed-not-dirty victims. Anonymous pages (code/data/stack) are
//! treated as wired until swap exists, so only Mmap pages are candidates;
//! dirty ones are written back to their file first.

use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::paging::FrameAllocator;

use crate::memory::{phys_to_virt, PGSIZE};
use crate::scheduler::task::Tid;
use crate::vm::page::{self, Role};

/// Default pool size when -ul does not cap it: 1024 frames (4 MiB).
pub const DEFAULT_POOL_FRAMES: usize = 1024;

struct FrameSlot {
    phys: u64,
    /// Back-reference to the single page occupying this frame.
    page: Option<(Tid, u64)>,
    pinned: bool,
}

struct FrameTable {
    slots: Vec<FrameSlot>,
    hand: usize,
}

lazy_static! {
    static ref FRAMES: Mutex<FrameTable> = Mutex::new(FrameTable {
        slots: Vec::new(),
        hand: 0,
    });
}

/// Claim up to `limit` physical frames for the pool.
pub fn init(limit: usize) {
    let mut table = FRAMES.lock();
    let mut allocator = crate::memory::FRAME_ALLOCATOR.lock();
    while table.slots.len() < limit {
        match allocator.allocate_frame() {
            Some(frame) => table.slots.push(FrameSlot {
                phys: frame.start_address().as_u64(),
                page: None,
                pinned: false,
            }),
            None => break,
        }
    }
    crate::log_info!("Frame pool: {} user frames.", table.slots.len());
}

pub fn phys_of(index: usize) -> u64 {
    FRAMES.lock().slots[index].phys
}

/// Kernel-side view of a frame's bytes.
pub fn with_frame_slice<R>(index: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
    let phys = phys_of(index);
    let slice = unsafe {
        core::slice::from_raw_parts_mut(phys_to_virt(phys) as *mut u8, PGSIZE as usize)
    };
    f(slice)
}

/// True when no frame is free; a read syscall pre-faults its buffer then.
pub fn is_full() -> bool {
    FRAMES.lock().slots.iter().all(|s| s.page.is_some())
}

/// Allocate a zeroed frame for (tid, upage), evicting if necessary.
pub fn allocate(tid: Tid, upage: u64, pinned: bool) -> Option<usize> {
    let index = {
        let mut table = FRAMES.lock();
        match table.slots.iter().position(|s| s.page.is_none()) {
            Some(i) => Some(i),
            None => evict(&mut *table),
        }
        .map(|i| {
            table.slots[i].page = Some((tid, upage));
            table.slots[i].pinned = pinned;
            i
        })
    }?;
    with_frame_slice(index, |slice| slice.fill(0));
    Some(index)
}

/// Return a frame to the pool. The caller owns the page-table side.
pub fn free_frame(index: usize) {
    let mut table = FRAMES.lock();
    table.slots[index].page = None;
    table.slots[index].pinned = false;
}

/// Pin or unpin the frame backing a page, if it is resident. Used around
/// syscalls that touch user buffers to keep recursion out of the fault
/// path.
pub fn set_pinned(tid: Tid, upage: u64, pinned: bool) {
    let mut table = FRAMES.lock();
    if let Some(slot) = table
        .slots
        .iter_mut()
        .find(|s| s.page == Some((tid, upage)))
    {
        slot.pinned = pinned;
    }
}

/// Clock second-chance over the pool. Returns a now-free slot.
fn evict(table: &mut FrameTable) -> Option<usize> {
    let n = table.slots.len();
    if n == 0 {
        return None;
    }
    let mut dirty_fallback: Option<usize> = None;

    for _ in 0..2 * n {
        let i = table.hand;
        table.hand = (table.hand + 1) % n;
        let slot = &table.slots[i];
        if slot.pinned {
            continue;
        }
        let (owner, upage) = match slot.page {
            Some(p) => p,
            None => return Some(i),
        };
        // Until swap is wired up, anonymous pages never leave memory.
        if page::role_of(owner, upage) != Some(Role::Mmap) {
            continue;
        }
        let pagedir = match crate::scheduler::with_thread(owner, |t| t.pagedir).flatten() {
            Some(pd) => pd,
            None => continue,
        };
        if crate::memory::paging::is_accessed(pagedir, upage) {
            crate::memory::paging::clear_accessed(pagedir, upage);
            continue;
        }
        if crate::memory::paging::is_dirty(pagedir, upage) {
            if dirty_fallback.is_none() {
                dirty_fallback = Some(i);
            }
            continue;
        }
        evict_slot(table, i);
        return Some(i);
    }

    let i = dirty_fallback?;
    evict_slot(table, i);
    Some(i)
}

/// Push one occupied slot out: write dirty mmap data back, clear the
/// mapping, detach the SPT entry.
fn evict_slot(table: &mut FrameTable, index: usize) {
    let (owner, upage) = table.slots[index].page.expect("evicting a free frame");
    let phys = table.slots[index].phys;

    if let Some(pagedir) = crate::scheduler::with_thread(owner, |t| t.pagedir).flatten() {
        if crate::memory::paging::is_dirty(pagedir, upage) {
            if let Some((file, begin, end)) = page::mmap_region_of(owner, upage) {
                let offset = upage - begin;
                let bytes = PGSIZE.min(end - upage) as usize;
                let fs = crate::fs::fs();
                let file = file.lock();
                let slice = unsafe {
                    core::slice::from_raw_parts(phys_to_virt(phys) as *const u8, PGSIZE as usize)
                };
                fs.file_write_at(&file, &slice[..bytes], offset as u32);
            }
        }
        crate::memory::paging::clear_user_page(pagedir, upage);
    }
    page::mark_not_present(owner, upage);
    table.slots[index].page = None;
}
