//! Blocking synchronization primitives: counting semaphores and
//! priority-donating locks. Spinlocks guard the primitives' own state; the
//! scheduler supplies block/unblock and all donation bookkeeping.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::task::Tid;

struct SemaInner {
    value: Mutex<u32>,
    waiters: Mutex<Vec<Tid>>,
}

/// A counting semaphore whose waiters block in the scheduler.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaInner>,
}

impl Semaphore {
    pub fn new(value: u32) -> Semaphore {
        Semaphore {
            inner: Arc::new(SemaInner {
                value: Mutex::new(value),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Down or "P": wait until the value becomes positive, then decrement.
    /// Must not be called from interrupt context.
    pub fn down(&self) {
        x86_64::instructions::interrupts::without_interrupts(|| loop {
            {
                let mut value = self.inner.value.lock();
                if *value > 0 {
                    *value -= 1;
                    return;
                }
            }
            self.inner.waiters.lock().push(super::current_tid());
            super::block_current();
            // Unblocked: loop and compete for the value again.
        });
    }

    /// Up or "V": increment the value and wake the highest-priority waiter.
    /// Safe to call from interrupt context (it will not yield there).
    pub fn up(&self) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            *self.inner.value.lock() += 1;
            let snapshot: Vec<Tid> = self.inner.waiters.lock().clone();
            if let Some(tid) = super::highest_priority_of(&snapshot) {
                self.inner.waiters.lock().retain(|t| *t != tid);
                super::unblock(tid);
            }
        });
        if !crate::interrupts::in_interrupt() {
            super::yield_on_priority();
        }
    }

    /// Tids currently blocked on this semaphore.
    pub(super) fn waiters_snapshot(&self) -> Vec<Tid> {
        self.inner.waiters.lock().clone()
    }
}

pub struct LockMeta {
    pub holder: Option<Tid>,
    /// Highest effective priority among this lock's waiters; what the
    /// holder inherits through donation.
    pub priority: i32,
}

pub struct LockInner {
    pub meta: Mutex<LockMeta>,
    sema: Semaphore,
}

impl LockInner {
    pub(super) fn waiters_snapshot(&self) -> Vec<Tid> {
        self.sema.waiters_snapshot()
    }
}

/// A mutual-exclusion lock with priority donation. Cloning shares the lock.
#[derive(Clone)]
pub struct Lock {
    pub(super) inner: Arc<LockInner>,
}

impl Lock {
    pub fn new() -> Lock {
        Lock {
            inner: Arc::new(LockInner {
                meta: Mutex::new(LockMeta {
                    holder: None,
                    priority: super::task::PRI_MIN,
                }),
                sema: Semaphore::new(1),
            }),
        }
    }

    pub fn acquire(&self) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            let held = { self.inner.meta.lock().holder.is_some() };
            if held {
                // Record what we wait on and push our priority down the
                // waiter → holder chain before going to sleep.
                super::note_lock_wait(&self.inner);
            }
            self.inner.sema.down();
            super::note_lock_acquired(&self.inner);
        });
    }

    pub fn release(&self) {
        x86_64::instructions::interrupts::without_interrupts(|| {
            super::note_lock_released(&self.inner);
        });
        self.inner.sema.up();
    }

    pub fn held_by_current(&self) -> bool {
        self.inner.meta.lock().holder == Some(super::current_tid())
    }
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}
