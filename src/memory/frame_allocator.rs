use alloc::vec::Vec;
use multiboot2::{MemoryArea, MemoryAreaType};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Physical memory below this mark is left alone: BIOS structures, the
/// kernel image and the Multiboot info all live there.
const RESERVED_BELOW: u64 = 16 * 1024 * 1024;

/// Physical frame allocator fed by the Multiboot2 memory map.
///
/// Frames are handed out in ascending address order; released frames go on a
/// free list and are preferred on the next allocation, so page tables and
/// user frames can be recycled.
pub struct BumpFrameAllocator {
    areas: Option<&'static [MemoryArea]>,
    next: usize,
    free_list: Vec<PhysFrame>,
}

impl BumpFrameAllocator {
    pub const fn new() -> Self {
        BumpFrameAllocator {
            areas: None,
            next: 0,
            free_list: Vec::new(),
        }
    }

    /// # Safety
    /// The memory map must describe real, unused RAM; frames handed out are
    /// written to without further checks.
    pub unsafe fn init(&mut self, areas: &'static [MemoryArea]) {
        self.areas = Some(areas);
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        self.areas
            .expect("frame allocator used before init")
            .iter()
            .filter(|area| MemoryAreaType::from(area.typ()) == MemoryAreaType::Available)
            .map(|area| area.start_address()..area.end_address())
            .flat_map(|range| range.step_by(4096))
            .filter(|&addr| addr >= RESERVED_BELOW)
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }

    /// Allocate `count` physically contiguous frames and return the first.
    /// Used once, for the kernel heap.
    pub fn allocate_contiguous(&mut self, count: usize) -> Option<PhysFrame> {
        let first = self.allocate_frame()?;
        let mut prev = first;
        for _ in 1..count {
            let frame = self.allocate_frame()?;
            if frame.start_address() != prev.start_address() + 4096u64 {
                // Crossed a hole in the memory map. A machine this fragmented
                // below the heap mark cannot host the kernel heap.
                panic!("contiguous frame run interrupted at {:?}", frame);
            }
            prev = frame;
        }
        Some(first)
    }
}

unsafe impl FrameAllocator<Size4KiB> for BumpFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if let Some(frame) = self.free_list.pop() {
            return Some(frame);
        }
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

impl FrameDeallocator<Size4KiB> for BumpFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.free_list.push(frame);
    }
}
