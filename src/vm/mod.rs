//! Virtual-memory manager: page-fault resolution on top of the SPT, the
//! frame pool and the per-process VMA.

pub mod frame;
pub mod page;

use page::{Location, Role};

use crate::memory::{is_user_vaddr, pg_round_down, PGSIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is in place; retry the access.
    Resolved,
    /// Illegitimate user access: terminate the process with -1.
    Kill,
    /// A fault the kernel has no business taking.
    KernelBug,
}

pub fn init(user_page_limit: Option<usize>) {
    frame::init(user_page_limit.unwrap_or(frame::DEFAULT_POOL_FRAMES));
}

/// Resolve a page fault at `addr`.
///
/// `present` means the PTE existed (a rights violation, not a miss);
/// `write`/`user` describe the access; `user_rsp` is the faulting thread's
/// saved user stack pointer, feeding the stack-growth heuristic.
pub fn handle_page_fault(
    addr: u64,
    present: bool,
    write: bool,
    user: bool,
    user_rsp: u64,
) -> FaultOutcome {
    let cur = crate::scheduler::current_tid();
    let is_user_process = crate::scheduler::with_current(|t| t.pagedir.is_some());
    if !is_user_process {
        return FaultOutcome::KernelBug;
    }

    // Kernel addresses: user access is plainly illegal; a kernel-mode
    // fault up there is the kernel's own bug.
    if !is_user_vaddr(addr) {
        return if user {
            FaultOutcome::Kill
        } else {
            FaultOutcome::KernelBug
        };
    }

    let role = crate::scheduler::with_current(|t| t.vma.classify(addr, user_rsp));
    if role == Role::Unused {
        return FaultOutcome::Kill;
    }

    // A present page that still faulted means a protection violation,
    // i.e. a write to a read-only page.
    if present {
        return FaultOutcome::Kill;
    }

    let upage = pg_round_down(addr);
    match page::seek(cur, addr) {
        Some(node) => match node.loc {
            // SPT says in-memory but the PTE disagreed: inconsistent state.
            Location::Memory => FaultOutcome::KernelBug,
            Location::NotPresent | Location::Swap => {
                if page::pull_page(cur, &node) {
                    FaultOutcome::Resolved
                } else {
                    FaultOutcome::Kill
                }
            }
        },
        None => {
            // Brand-new page. Stack pages must be written before they are
            // read; a read fault on an unallocated stack page is an error.
            if role == Role::Stack && !write {
                return FaultOutcome::Kill;
            }
            let writable = role != Role::Code;
            if !page::install_new_page(cur, upage, role, writable, page::PageFlags::empty()) {
                return FaultOutcome::Kill;
            }
            // Track segment growth: stacks grow down, code grows up while
            // loading, mmap extents are fixed.
            crate::scheduler::with_current(|t| match role {
                Role::Stack => {
                    if t.vma.stack_begin > upage {
                        t.vma.stack_begin = upage;
                    }
                }
                Role::Code => {
                    if t.vma.loading_exe && t.vma.code_end < upage + PGSIZE {
                        t.vma.code_end = upage + PGSIZE;
                    }
                }
                _ => {}
            });
            FaultOutcome::Resolved
        }
    }
}
