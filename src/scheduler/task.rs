use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use super::context::Context;
use super::fixed_point::Fp;
use super::sync::{LockInner, Semaphore};
use crate::fs::fd::FdTable;
use crate::fs::ROOT_DIR_SECTOR;
use crate::vm::page::Vma;

/// Unique thread (and, for user programs, process) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u32);

/// Thread priorities.
pub const PRI_MIN: i32 = 0;
pub const PRI_DEFAULT: i32 = 31;
pub const PRI_MAX: i32 = 63;

/// Upper bound on locks a single thread may hold at once.
pub const MAX_LOCKS: usize = 10;

/// Exit status sentinel: the child has not reported yet.
pub const STATUS_NOT_SPECIFIED: i32 = -2;

/// Kernel stack size per thread (16 KiB).
pub const KSTACK_SIZE: usize = 4096 * 4;

/// Sentinel written at the lowest word of every kernel stack. A mismatch on
/// a context switch means the stack grew into it.
pub const STACK_MAGIC: u64 = 0xcd6a_bf4b_cd6a_bf4b;

/// States in a thread's life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Parent-owned record through which a child reports its exit status.
/// The parent keeps the `Arc` in its child list; the child only holds a
/// `Weak`, so a parent that exits first simply lets the record die.
pub struct WaitNode {
    pub child_tid: Tid,
    pub parent_tid: Tid,
    status: AtomicI32,
    waited: AtomicBool,
    pub sema: Semaphore,
}

impl WaitNode {
    pub fn new(child_tid: Tid, parent_tid: Tid) -> WaitNode {
        WaitNode {
            child_tid,
            parent_tid,
            status: AtomicI32::new(STATUS_NOT_SPECIFIED),
            waited: AtomicBool::new(false),
            sema: Semaphore::new(0),
        }
    }

    pub fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::SeqCst)
    }

    /// Marks the node as waited on. Returns false if it already was;
    /// waiting twice on the same child must fail.
    pub fn claim_wait(&self) -> bool {
        !self.waited.swap(true, Ordering::SeqCst)
    }
}

/// A kernel thread or user process.
///
/// The record itself lives boxed in the scheduler's all-thread table; the
/// kernel stack is a separately owned allocation whose lowest word holds
/// `STACK_MAGIC` as an overflow tripwire (the moral equivalent of the
/// classic thread-at-the-bottom-of-its-stack-page layout).
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub state: ThreadState,
    pub context: Context,
    kernel_stack: Box<[u8]>,

    /// Effective priority, after donations.
    pub priority: i32,
    pub base_priority: i32,
    pub nice: i32,
    pub recent_cpu: Fp,
    pub wake_time: i64,

    /// Working directory, as an inode sector.
    pub wd: u32,

    /// User address space root (PML4), if this thread runs a user program.
    pub pagedir: Option<u64>,
    pub vma: Vma,

    /// Open file descriptors.
    pub fd_table: FdTable,
    /// The executable backing this process, held open with writes denied.
    pub exec_file: Option<crate::fs::file::File>,
    /// Upped by a child once its load attempt finished, either way.
    pub exec_sema: Semaphore,

    /// Wait nodes of our children; freed wholesale when we exit.
    pub children: Vec<Arc<WaitNode>>,
    /// Our own slot in the parent's child list.
    pub wait_node: Option<Weak<WaitNode>>,

    /// The lock this thread is currently blocked on, if any.
    pub waiting_on: Option<Arc<LockInner>>,
    /// Locks currently held (bounded by MAX_LOCKS).
    pub held_locks: Vec<Arc<LockInner>>,
}

impl Thread {
    /// Build a thread record with a fresh kernel stack. Returns None if the
    /// stack cannot be allocated; the caller's state is untouched in that
    /// case.
    pub fn try_new(tid: Tid, name: &str, priority: i32) -> Option<Thread> {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        let layout = Layout::from_size_align(KSTACK_SIZE, 16).unwrap();
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if raw.is_null() {
            return None;
        }
        let slice = core::ptr::slice_from_raw_parts_mut(raw, KSTACK_SIZE);
        let mut kernel_stack = unsafe { Box::from_raw(slice) };
        kernel_stack[..8].copy_from_slice(&STACK_MAGIC.to_ne_bytes());

        Some(Thread {
            tid,
            name: String::from(name),
            state: ThreadState::Blocked,
            context: Context::empty(),
            kernel_stack,
            priority,
            base_priority: priority,
            nice: 0,
            recent_cpu: Fp::ZERO,
            wake_time: -1,
            wd: ROOT_DIR_SECTOR,
            pagedir: None,
            vma: Vma::new(),
            fd_table: FdTable::new(),
            exec_file: None,
            exec_sema: Semaphore::new(0),
            children: Vec::new(),
            wait_node: None,
            waiting_on: None,
            held_locks: Vec::new(),
        })
    }

    /// Thread record for the already-running boot thread. It keeps the
    /// stack the boot stub gave it, so no kernel stack is allocated and the
    /// sentinel check is vacuous for it.
    pub fn bootstrap(tid: Tid, name: &str) -> Thread {
        let mut t = Thread::try_new(tid, name, PRI_DEFAULT).expect("boot thread allocation");
        t.kernel_stack = Box::new([]);
        t.state = ThreadState::Running;
        t
    }

    /// Top of this thread's kernel stack, 16-byte aligned.
    pub fn stack_top(&self) -> u64 {
        if self.kernel_stack.is_empty() {
            return 0;
        }
        let top = self.kernel_stack.as_ptr() as u64 + self.kernel_stack.len() as u64;
        top & !0xF
    }

    /// Verify the stack overflow sentinel.
    pub fn sentinel_ok(&self) -> bool {
        if self.kernel_stack.len() < 8 {
            return true;
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.kernel_stack[..8]);
        u64::from_ne_bytes(word) == STACK_MAGIC
    }

    pub fn is_user(&self) -> bool {
        self.pagedir.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_thread_has_intact_sentinel() {
        let t = Thread::try_new(Tid(7), "probe", PRI_DEFAULT).unwrap();
        assert!(t.sentinel_ok());
        assert_eq!(t.state, ThreadState::Blocked);
        assert_eq!(t.priority, t.base_priority);
        assert_eq!(t.stack_top() % 16, 0);
        assert!(t.stack_top() > t.kernel_stack.as_ptr() as u64);
    }

    #[test]
    fn wait_node_claims_exactly_once() {
        let node = WaitNode::new(Tid(3), Tid(1));
        assert_eq!(node.status(), STATUS_NOT_SPECIFIED);
        assert!(node.claim_wait());
        assert!(!node.claim_wait());
        node.set_status(42);
        assert_eq!(node.status(), 42);
    }
}
