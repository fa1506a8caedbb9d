//! Write-back buffer cache: a fixed set of 64 sector-sized entries between
//! the file system and the disk. Every file-system sector moves through
//! here; nothing else touches the device.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

use super::inode::InodeDisk;
use crate::drivers::block::{BlockDevice, SECTOR_SIZE};

pub const CACHE_SLOTS: usize = 64;

struct Slot {
    sector: Option<u32>,
    dirty: bool,
    accessed: bool,
    pinned: u32,
    data: [u8; SECTOR_SIZE],
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            sector: None,
            dirty: false,
            accessed: false,
            pinned: 0,
            data: [0; SECTOR_SIZE],
        }
    }
}

struct Index {
    map: HashMap<u32, usize>,
    hand: usize,
}

pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    /// Guards the sector → slot map and the clock hand; taken only to
    /// install or evict. Entry data sits behind the per-slot locks.
    index: Mutex<Index>,
    slots: Vec<Mutex<Slot>>,
}

impl BufferCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> BufferCache {
        let mut slots = Vec::with_capacity(CACHE_SLOTS);
        for _ in 0..CACHE_SLOTS {
            slots.push(Mutex::new(Slot::empty()));
        }
        BufferCache {
            dev,
            index: Mutex::new(Index {
                map: HashMap::new(),
                hand: 0,
            }),
            slots,
        }
    }

    /// Find the slot caching `sector`, installing it on a miss. `load`
    /// controls whether a fresh slot is filled from disk (pointless when
    /// the caller is about to overwrite the whole sector).
    fn slot_for(&self, sector: u32, load: bool) -> usize {
        let mut index = self.index.lock();
        if let Some(&i) = index.map.get(&sector) {
            return i;
        }

        // Miss: clock second-chance over unpinned entries.
        let mut spins = 0;
        let victim = loop {
            let i = index.hand;
            index.hand = (index.hand + 1) % CACHE_SLOTS;
            let mut slot = self.slots[i].lock();
            if slot.pinned > 0 {
                spins += 1;
                assert!(spins < 2 * CACHE_SLOTS, "every cache entry is pinned");
                continue;
            }
            if slot.sector.is_some() && slot.accessed {
                slot.accessed = false;
                continue;
            }
            break i;
        };

        let mut slot = self.slots[victim].lock();
        if let Some(old) = slot.sector {
            if slot.dirty {
                self.dev.write_sector(old, &slot.data);
                slot.dirty = false;
            }
            index.map.remove(&old);
        }
        slot.sector = Some(sector);
        slot.accessed = false;
        if load {
            self.dev.read_sector(sector, &mut slot.data);
        } else {
            slot.data.fill(0);
        }
        index.map.insert(sector, victim);
        victim
    }

    /// Run `f` on the locked slot holding `sector`. Loops because the slot
    /// could be evicted between lookup and lock.
    fn with_slot<R>(&self, sector: u32, load: bool, mut f: impl FnMut(&mut Slot) -> R) -> R {
        loop {
            let i = self.slot_for(sector, load);
            let mut slot = self.slots[i].lock();
            if slot.sector == Some(sector) {
                return f(&mut slot);
            }
        }
    }

    /// Read a whole sector. `pin` wires the entry down until `unpin`.
    pub fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE], pin: bool) {
        self.with_slot(sector, true, |slot| {
            slot.accessed = true;
            if pin {
                slot.pinned += 1;
            }
            buf.copy_from_slice(&slot.data);
        });
    }

    /// Write a whole sector (into the cache; disk happens on eviction or
    /// write-back).
    pub fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE], pin: bool) {
        self.with_slot(sector, false, |slot| {
            slot.accessed = true;
            slot.dirty = true;
            if pin {
                slot.pinned += 1;
            }
            slot.data.copy_from_slice(buf);
        });
    }

    /// Partial-sector read.
    pub fn read_at(&self, sector: u32, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        self.with_slot(sector, true, |slot| {
            slot.accessed = true;
            buf.copy_from_slice(&slot.data[offset..offset + buf.len()]);
        });
    }

    /// Partial-sector write; the rest of the sector is preserved.
    pub fn write_at(&self, sector: u32, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        let whole = offset == 0 && buf.len() == SECTOR_SIZE;
        self.with_slot(sector, !whole, |slot| {
            slot.accessed = true;
            slot.dirty = true;
            slot.data[offset..offset + buf.len()].copy_from_slice(buf);
        });
    }

    /// A copy of the on-disk inode in `sector`, served from the cache.
    pub fn find_inode(&self, sector: u32) -> Box<InodeDisk> {
        let mut raw = [0u8; SECTOR_SIZE];
        self.read(sector, &mut raw, false);
        Box::new(InodeDisk::from_bytes(&raw))
    }

    pub fn unpin(&self, sector: u32) {
        let index = self.index.lock();
        if let Some(&i) = index.map.get(&sector) {
            let mut slot = self.slots[i].lock();
            debug_assert!(slot.pinned > 0);
            slot.pinned = slot.pinned.saturating_sub(1);
        }
    }

    /// Flush every dirty entry: the durability fence used on process exit
    /// and shutdown.
    pub fn writeback_all(&self) {
        for cell in &self.slots {
            let mut slot = cell.lock();
            if slot.dirty {
                if let Some(sector) = slot.sector {
                    self.dev.write_sector(sector, &slot.data);
                    slot.dirty = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::block::MemDisk;

    fn sector_of(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn write_then_read_hits_cache() {
        let disk = Arc::new(MemDisk::new(16));
        let cache = BufferCache::new(disk.clone());

        cache.write(3, &sector_of(0xAB), false);
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(3, &mut buf, false);
        assert_eq!(buf, sector_of(0xAB));

        // Not yet on disk: write-back policy.
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(3, &mut raw);
        assert_eq!(raw, sector_of(0));
    }

    #[test]
    fn writeback_all_flushes_to_disk() {
        let disk = Arc::new(MemDisk::new(16));
        let cache = BufferCache::new(disk.clone());

        cache.write(1, &sector_of(0x11), false);
        cache.write(2, &sector_of(0x22), false);
        cache.writeback_all();

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(1, &mut raw);
        assert_eq!(raw, sector_of(0x11));
        disk.read_sector(2, &mut raw);
        assert_eq!(raw, sector_of(0x22));
    }

    #[test]
    fn eviction_writes_dirty_victims_back() {
        let disk = Arc::new(MemDisk::new(1024));
        let cache = BufferCache::new(disk.clone());

        for s in 0..CACHE_SLOTS as u32 {
            cache.write(s, &sector_of(s as u8), false);
        }
        // Touch twice as many sectors as there are slots; the early ones
        // must be evicted and written back.
        for s in CACHE_SLOTS as u32..(2 * CACHE_SLOTS) as u32 {
            cache.write(s, &sector_of(s as u8), false);
        }

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(0, &mut raw);
        assert_eq!(raw, sector_of(0));

        // The evicted sector reads back correctly through the cache too.
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(0, &mut buf, false);
        assert_eq!(buf, sector_of(0));
    }

    #[test]
    fn pinned_entries_survive_pressure() {
        let disk = Arc::new(MemDisk::new(4096));
        let cache = BufferCache::new(disk.clone());

        cache.write(7, &sector_of(0x77), true); // pinned
        for s in 100..100 + 3 * CACHE_SLOTS as u32 {
            cache.write(s, &sector_of(1), false);
        }
        // Still cached and dirty: the disk has not seen it.
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(7, &mut raw);
        assert_eq!(raw, sector_of(0));

        cache.unpin(7);
        cache.writeback_all();
        disk.read_sector(7, &mut raw);
        assert_eq!(raw, sector_of(0x77));
    }

    #[test]
    fn partial_writes_preserve_the_rest() {
        let disk = Arc::new(MemDisk::new(16));
        let cache = BufferCache::new(disk.clone());

        cache.write(5, &sector_of(0xEE), false);
        cache.write_at(5, 100, &[1, 2, 3]);

        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(5, &mut buf, false);
        assert_eq!(&buf[100..103], &[1, 2, 3]);
        assert_eq!(buf[99], 0xEE);
        assert_eq!(buf[103], 0xEE);

        let mut small = [0u8; 3];
        cache.read_at(5, 100, &mut small);
        assert_eq!(small, [1, 2, 3]);
    }
}
