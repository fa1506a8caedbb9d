use linked_list_allocator::LockedHeap;

use super::frame_allocator::BumpFrameAllocator;
use super::phys_to_virt;

/// 8 MiB of kernel heap. Thread records, caches, page tables for the SPT and
/// every `alloc` collection live here.
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Claim a contiguous physical run for the heap and hand it to the
/// allocator. Must run before the first `alloc` use.
pub fn init_heap(frame_allocator: &mut BumpFrameAllocator) {
    let frames = HEAP_SIZE / 4096;
    let first = frame_allocator
        .allocate_contiguous(frames)
        .expect("not enough physical memory for the kernel heap");
    let heap_bottom = phys_to_virt(first.start_address().as_u64()) as *mut u8;
    unsafe {
        ALLOCATOR.lock().init(heap_bottom, HEAP_SIZE);
    }
}
