use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::{
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{FrameAllocator, FrameDeallocator, PageTable, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

use super::{phys_to_virt, FRAME_ALLOCATOR};

/// Physical address of the kernel-only PML4 built by the boot stub.
/// Captured once at `init()`; activating `None` switches back to it.
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    let (frame, _) = Cr3::read();
    KERNEL_PML4.store(frame.start_address().as_u64(), Ordering::SeqCst);
}

pub fn kernel_pml4() -> u64 {
    KERNEL_PML4.load(Ordering::SeqCst)
}

fn table_from_phys(phys: u64) -> &'static mut PageTable {
    unsafe { &mut *(phys_to_virt(phys) as *mut PageTable) }
}

/// Create a fresh user address space. The kernel half (PML4 slots 256..512)
/// is shared with the boot page tables; the user half starts empty.
pub fn create_user_pml4() -> Option<u64> {
    let frame = FRAME_ALLOCATOR.lock().allocate_frame()?;
    let phys = frame.start_address().as_u64();
    let new = table_from_phys(phys);
    let kernel = table_from_phys(kernel_pml4());
    for i in 0..512 {
        if i < 256 || kernel[i].is_unused() {
            new[i].set_unused();
        } else {
            new[i].set_addr(kernel[i].addr(), kernel[i].flags());
        }
    }
    Some(phys)
}

/// Walk (and optionally grow) the paging tree down to the PTE for `upage`.
fn walk_mut(
    pml4: u64,
    upage: u64,
    create: bool,
) -> Option<&'static mut x86_64::structures::paging::page_table::PageTableEntry> {
    let addr = VirtAddr::new(upage);
    let indices = [
        u16::from(addr.p4_index()) as usize,
        u16::from(addr.p3_index()) as usize,
        u16::from(addr.p2_index()) as usize,
    ];
    let mut table = table_from_phys(pml4);
    for &idx in indices.iter() {
        let entry = &mut table[idx];
        if entry.is_unused() {
            if !create {
                return None;
            }
            let frame = FRAME_ALLOCATOR.lock().allocate_frame()?;
            let phys = frame.start_address().as_u64();
            table_from_phys(phys).zero();
            entry.set_addr(
                PhysAddr::new(phys),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
            );
        }
        table = table_from_phys(entry.addr().as_u64());
    }
    Some(&mut table[u16::from(addr.p1_index()) as usize])
}

fn flush_if_active(pml4: u64, upage: u64) {
    let (frame, _) = Cr3::read();
    if frame.start_address().as_u64() == pml4 {
        x86_64::instructions::tlb::flush(VirtAddr::new(upage));
    }
}

/// Map one user page. Fails if `upage` is already mapped or a page-table
/// frame cannot be allocated.
pub fn map_user_page(pml4: u64, upage: u64, frame_phys: u64, writable: bool) -> bool {
    let entry = match walk_mut(pml4, upage, true) {
        Some(e) => e,
        None => return false,
    };
    if !entry.is_unused() {
        return false;
    }
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    entry.set_addr(PhysAddr::new(frame_phys), flags);
    flush_if_active(pml4, upage);
    true
}

/// Drop the hardware mapping for `upage` (the backing frame is managed by
/// the VM frame pool, not here).
pub fn clear_user_page(pml4: u64, upage: u64) {
    if let Some(entry) = walk_mut(pml4, upage, false) {
        if !entry.is_unused() {
            entry.set_unused();
            flush_if_active(pml4, upage);
        }
    }
}

pub fn is_dirty(pml4: u64, upage: u64) -> bool {
    match walk_mut(pml4, upage, false) {
        Some(entry) => entry.flags().contains(PageTableFlags::DIRTY),
        None => false,
    }
}

pub fn is_accessed(pml4: u64, upage: u64) -> bool {
    match walk_mut(pml4, upage, false) {
        Some(entry) => entry.flags().contains(PageTableFlags::ACCESSED),
        None => false,
    }
}

pub fn clear_accessed(pml4: u64, upage: u64) {
    if let Some(entry) = walk_mut(pml4, upage, false) {
        let flags = entry.flags();
        if flags.contains(PageTableFlags::ACCESSED) {
            entry.set_flags(flags - PageTableFlags::ACCESSED);
            flush_if_active(pml4, upage);
        }
    }
}

/// Load CR3. `None` activates the kernel-only tables.
///
/// # Safety
/// The tables must stay alive while active. Correct ordering on process
/// teardown is activate-kernel first, destroy second.
pub unsafe fn activate(pml4: Option<u64>) {
    let target = pml4.unwrap_or_else(kernel_pml4);
    let (current, _) = Cr3::read();
    if current.start_address().as_u64() != target {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(target)),
            Cr3Flags::empty(),
        );
    }
}

/// Free the page-table frames of the user half. All user data frames must
/// already have been released through the VM frame pool.
pub fn destroy_user_pml4(pml4: u64) {
    let mut allocator = FRAME_ALLOCATOR.lock();
    let root = table_from_phys(pml4);
    for l4e in root.iter_mut().take(256) {
        if l4e.is_unused() {
            continue;
        }
        let pdpt = table_from_phys(l4e.addr().as_u64());
        for l3e in pdpt.iter_mut() {
            if l3e.is_unused() {
                continue;
            }
            let pd = table_from_phys(l3e.addr().as_u64());
            for l2e in pd.iter_mut() {
                if l2e.is_unused() {
                    continue;
                }
                unsafe {
                    allocator.deallocate_frame(PhysFrame::containing_address(l2e.addr()));
                }
            }
            unsafe {
                allocator.deallocate_frame(PhysFrame::containing_address(l3e.addr()));
            }
        }
        unsafe {
            allocator.deallocate_frame(PhysFrame::containing_address(l4e.addr()));
        }
        l4e.set_unused();
    }
    unsafe {
        allocator.deallocate_frame(PhysFrame::containing_address(PhysAddr::new(pml4)));
    }
}
