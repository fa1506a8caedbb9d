//! Free-sector bitmap. Lives in memory while the kernel runs and is
//! persisted through the free-map file whose inode sits at sector 0.

use alloc::vec::Vec;
use bit_field::BitField;

/// One bit per disk sector; set = allocated.
pub struct FreeMap {
    bits: Vec<u32>,
    sectors: u32,
}

impl FreeMap {
    pub fn new(sectors: u32) -> FreeMap {
        let words = (sectors as usize + 31) / 32;
        FreeMap {
            bits: alloc::vec![0u32; words],
            sectors,
        }
    }

    /// Size of the on-disk representation in bytes.
    pub fn byte_len(&self) -> u32 {
        (self.sectors + 7) / 8
    }

    pub fn is_used(&self, sector: u32) -> bool {
        self.bits[(sector / 32) as usize].get_bit((sector % 32) as usize)
    }

    pub fn mark_used(&mut self, sector: u32) {
        self.bits[(sector / 32) as usize].set_bit((sector % 32) as usize, true);
    }

    /// Allocate one free sector, lowest-numbered first.
    pub fn allocate(&mut self) -> Option<u32> {
        for sector in 0..self.sectors {
            if !self.is_used(sector) {
                self.mark_used(sector);
                return Some(sector);
            }
        }
        None
    }

    pub fn release(&mut self, sector: u32) {
        debug_assert!(self.is_used(sector), "releasing a free sector");
        self.bits[(sector / 32) as usize].set_bit((sector % 32) as usize, false);
    }

    pub fn count_free(&self) -> u32 {
        (0..self.sectors).filter(|&s| !self.is_used(s)).count() as u32
    }

    /// Serialize for the free-map file.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len() as usize);
        for word in &self.bits {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.truncate(self.byte_len() as usize);
        out
    }

    /// Rebuild from the free-map file's content.
    pub fn from_bytes(sectors: u32, bytes: &[u8]) -> FreeMap {
        let mut map = FreeMap::new(sectors);
        for (i, &b) in bytes.iter().enumerate() {
            for bit in 0..8 {
                let sector = (i * 8 + bit) as u32;
                if sector < sectors && b.get_bit(bit) {
                    map.mark_used(sector);
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_first() {
        let mut map = FreeMap::new(64);
        map.mark_used(0);
        map.mark_used(1);
        assert_eq!(map.allocate(), Some(2));
        assert_eq!(map.allocate(), Some(3));
        map.release(2);
        assert_eq!(map.allocate(), Some(2));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut map = FreeMap::new(8);
        for _ in 0..8 {
            assert!(map.allocate().is_some());
        }
        assert_eq!(map.allocate(), None);
        assert_eq!(map.count_free(), 0);
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut map = FreeMap::new(100);
        map.mark_used(0);
        map.mark_used(33);
        map.mark_used(99);
        let restored = FreeMap::from_bytes(100, &map.to_bytes());
        for s in 0..100 {
            assert_eq!(map.is_used(s), restored.is_used(s), "sector {}", s);
        }
    }
}
