pub mod allocator;
pub mod frame_allocator;
pub mod paging;

use frame_allocator::BumpFrameAllocator;
use lazy_static::lazy_static;
use spin::Mutex;

/// Base of the kernel's linear map of physical memory, built by the boot
/// stub. Physical address 0 is visible at this virtual address.
pub const PHYS_OFFSET: u64 = 0xFFFF_8000_0000_0000;

/// Top of user virtual memory. User programs may map anything below this
/// mark; everything at or above it belongs to the kernel. (The name is
/// historical: in the 32-bit layout this doubled as the physical-map base.)
pub const PHYS_BASE: u64 = 0xC000_0000;

pub const PGSIZE: u64 = 4096;

/// Lowest address user stacks may grow to: 8 MiB below PHYS_BASE.
pub const STACK_FLOOR: u64 = PHYS_BASE - 8 * 1024 * 1024;

pub fn pg_round_down(va: u64) -> u64 {
    va & !(PGSIZE - 1)
}

pub fn pg_round_up(va: u64) -> u64 {
    (va + PGSIZE - 1) & !(PGSIZE - 1)
}

pub fn pg_ofs(va: u64) -> u64 {
    va & (PGSIZE - 1)
}

pub fn is_user_vaddr(va: u64) -> bool {
    va < PHYS_BASE
}

/// Kernel virtual address of a physical address, through the linear map.
pub fn phys_to_virt(paddr: u64) -> u64 {
    PHYS_OFFSET + paddr
}

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Mutex<BumpFrameAllocator> =
        Mutex::new(BumpFrameAllocator::new());
}

pub fn init(boot_info: &multiboot2::BootInformation) {
    let memory_map_tag = boot_info.memory_map_tag().expect("Memory map tag required");

    // The tag memory sits in the Multiboot info area, which is never
    // reclaimed, so promoting the borrow to 'static is sound here.
    let areas = memory_map_tag.memory_areas();
    let static_areas: &'static [multiboot2::MemoryArea] =
        unsafe { core::slice::from_raw_parts(areas.as_ptr(), areas.len()) };

    {
        let mut frame_allocator = FRAME_ALLOCATOR.lock();
        unsafe { frame_allocator.init(static_areas) };
        allocator::init_heap(&mut frame_allocator);
    }
    paging::init();

    crate::log_info!("Physical frame allocator and kernel heap initialized.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(pg_round_down(0x1234), 0x1000);
        assert_eq!(pg_round_down(0x1000), 0x1000);
        assert_eq!(pg_round_up(0x1001), 0x2000);
        assert_eq!(pg_round_up(0x1000), 0x1000);
        assert_eq!(pg_ofs(0x1234), 0x234);
    }

    #[test]
    fn user_kernel_split() {
        assert!(is_user_vaddr(0));
        assert!(is_user_vaddr(PHYS_BASE - 1));
        assert!(!is_user_vaddr(PHYS_BASE));
        assert!(!is_user_vaddr(u64::MAX));
    }
}
