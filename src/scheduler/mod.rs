pub mod context;
pub mod fixed_point;
pub mod process;
pub mod sync;
pub mod task;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use context::Context;
use fixed_point::{Fp, LOAD_DECAY, LOAD_WEIGHT};
use lazy_static::lazy_static;
use spin::Mutex;
use sync::LockInner;
use task::{Thread, ThreadState, Tid, WaitNode, MAX_LOCKS, PRI_MAX, PRI_MIN};

/// Timer ticks each thread gets before preemption.
const TIME_SLICE: u32 = 4;

/// Donation chains longer than this are cut off; deeper nesting means a
/// lock graph no teaching workload produces.
const MAX_DONATION_DEPTH: usize = 8;

/// The global scheduler state.
pub struct Scheduler {
    /// Every live thread, keyed by tid. Boxing keeps the records (and the
    /// Contexts pointed at during switches) at stable addresses.
    all: BTreeMap<Tid, Box<Thread>>,
    /// Ready queue, sorted by effective priority descending, insertion
    /// order among equals.
    ready: VecDeque<Tid>,
    /// Threads blocked in sleep_until.
    sleepers: Vec<Tid>,
    current: Tid,
    idle: Option<Tid>,
    next_tid: u32,
    pub mlfqs: bool,
    pub load_avg: Fp,
    slice_ticks: u32,
    /// Earliest wake_time on the sleep list, or -1 when it is empty.
    next_wake: i64,
    idle_ticks: u64,
    kernel_ticks: u64,
    user_ticks: u64,
}

impl Scheduler {
    fn new(mlfqs: bool) -> Scheduler {
        Scheduler {
            all: BTreeMap::new(),
            ready: VecDeque::new(),
            sleepers: Vec::new(),
            current: Tid(0),
            idle: None,
            next_tid: 1,
            mlfqs,
            load_avg: Fp::ZERO,
            slice_ticks: 0,
            next_wake: -1,
            idle_ticks: 0,
            kernel_ticks: 0,
            user_ticks: 0,
        }
    }

    /// Turn the code that is currently running into the "main" thread.
    fn bootstrap(mlfqs: bool) -> Scheduler {
        let mut sched = Scheduler::new(mlfqs);
        let tid = sched.allocate_tid();
        let main = Thread::bootstrap(tid, "main");
        sched.current = tid;
        sched.all.insert(tid, Box::new(main));
        sched
    }

    fn allocate_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    fn thread(&self, tid: Tid) -> &Thread {
        self.all.get(&tid).expect("no such thread")
    }

    fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.all.get_mut(&tid).expect("no such thread")
    }

    /// Insert into the ready queue after every thread of the same or higher
    /// priority, so equal priorities stay FIFO.
    fn ready_insert(&mut self, tid: Tid) {
        let priority = self.thread(tid).priority;
        let pos = self
            .ready
            .iter()
            .position(|&t| self.thread(t).priority < priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, tid);
    }

    fn unblock_locked(&mut self, tid: Tid) {
        debug_assert_eq!(self.thread(tid).state, ThreadState::Blocked);
        self.thread_mut(tid).state = ThreadState::Ready;
        if Some(tid) != self.idle {
            self.ready_insert(tid);
        }
    }

    /// Re-sort a ready thread after its priority changed.
    fn requeue(&mut self, tid: Tid) {
        if let Some(pos) = self.ready.iter().position(|&t| t == tid) {
            self.ready.remove(pos);
            self.ready_insert(tid);
        }
    }

    /// Next thread to run: head of the ready queue, or the idle thread.
    fn pick_next(&mut self) -> Tid {
        match self.ready.pop_front() {
            Some(tid) => tid,
            None => self.idle.expect("ready queue empty before idle exists"),
        }
    }

    fn highest_priority_in(&self, tids: &[Tid]) -> Option<Tid> {
        let mut best: Option<Tid> = None;
        for &tid in tids {
            match best {
                None => best = Some(tid),
                Some(b) => {
                    if self.thread(tid).priority > self.thread(b).priority {
                        best = Some(tid);
                    }
                }
            }
        }
        best
    }

    // ── Priority donation ────────────────────────────────────

    /// Record that `waiter` blocks on `lock`, then push its priority down
    /// the waiter → holder chain.
    fn lock_wait(&mut self, waiter: Tid, lock: &Arc<LockInner>) {
        self.thread_mut(waiter).waiting_on = Some(lock.clone());
        let priority = self.thread(waiter).priority;
        {
            let mut meta = lock.meta.lock();
            if priority > meta.priority {
                meta.priority = priority;
            }
        }
        self.donate_chain(waiter);
    }

    /// Walk holder links starting at `from`'s awaited lock, donating
    /// `from`'s effective priority wherever it is higher.
    fn donate_chain(&mut self, from: Tid) {
        let priority = self.thread(from).priority;
        let mut lock = match self.thread(from).waiting_on.clone() {
            Some(l) => l,
            None => return,
        };
        for _ in 0..MAX_DONATION_DEPTH {
            let holder = match lock.meta.lock().holder {
                Some(h) => h,
                None => break,
            };
            if priority > self.thread(holder).priority {
                self.thread_mut(holder).priority = priority;
                self.requeue(holder);
            }
            match self.thread(holder).waiting_on.clone() {
                Some(next) => {
                    let mut meta = next.meta.lock();
                    if priority > meta.priority {
                        meta.priority = priority;
                    }
                    drop(meta);
                    lock = next;
                }
                None => break,
            }
        }
    }

    /// `who` now owns `lock`: clear its wait link, remember the lock, and
    /// reset the lock's donation level to its remaining waiters.
    fn lock_acquired(&mut self, who: Tid, lock: &Arc<LockInner>) {
        let remaining = lock.waiters_snapshot();
        let waiter_max = remaining
            .iter()
            .map(|&t| self.thread(t).priority)
            .max()
            .unwrap_or(PRI_MIN);
        {
            let thread = self.thread_mut(who);
            thread.waiting_on = None;
            assert!(thread.held_locks.len() < MAX_LOCKS);
            thread.held_locks.push(lock.clone());
        }
        let mut meta = lock.meta.lock();
        meta.holder = Some(who);
        meta.priority = waiter_max;
    }

    /// `who` releases `lock`: forget it and fall back to the highest of the
    /// base priority and the donation levels of locks still held.
    fn lock_released(&mut self, who: Tid, lock: &Arc<LockInner>) {
        {
            let thread = self.thread_mut(who);
            let before = thread.held_locks.len();
            thread.held_locks.retain(|l| !Arc::ptr_eq(l, lock));
            assert_ne!(before, thread.held_locks.len(), "releasing a lock not held");
        }
        let new_priority = if self.mlfqs {
            self.thread(who).priority
        } else {
            let thread = self.thread(who);
            let mut p = thread.base_priority;
            for held in &thread.held_locks {
                p = p.max(held.meta.lock().priority);
            }
            p
        };
        self.thread_mut(who).priority = new_priority;
        self.requeue(who);
        lock.meta.lock().holder = None;
    }

    /// Change a thread's base priority. The effective priority follows
    /// only when no donation is active; donated priority survives until
    /// the last donated lock is released.
    fn set_base_priority(&mut self, tid: Tid, new_priority: i32) {
        {
            let thread = self.thread_mut(tid);
            if thread.base_priority == thread.priority {
                thread.priority = new_priority;
            }
            thread.base_priority = new_priority;
        }
        self.requeue(tid);
    }

    // ── MLFQS bookkeeping ────────────────────────────────────

    /// Ready plus running threads, the idle thread excepted.
    fn ready_thread_count(&self) -> i32 {
        let mut n = self.ready.len() as i32;
        if Some(self.current) != self.idle {
            n += 1;
        }
        n
    }

    fn update_load_avg(&mut self) {
        let ready = self.ready_thread_count();
        self.load_avg = self
            .load_avg
            .mul(LOAD_DECAY)
            .add(LOAD_WEIGHT.mul_int(ready));
    }

    fn recompute_all_recent_cpu(&mut self) {
        let twice_load = self.load_avg.mul_int(2);
        let coeff = twice_load.div(twice_load.add_int(1));
        let idle = self.idle;
        for (tid, thread) in self.all.iter_mut() {
            if Some(*tid) == idle {
                continue;
            }
            thread.recent_cpu = coeff.mul(thread.recent_cpu).add_int(thread.nice);
        }
    }

    fn recompute_all_priorities(&mut self) {
        let idle = self.idle;
        for (tid, thread) in self.all.iter_mut() {
            if Some(*tid) == idle {
                continue;
            }
            let p = PRI_MAX - thread.recent_cpu.div_int(4).to_int() - 2 * thread.nice;
            thread.priority = p.clamp(PRI_MIN, PRI_MAX);
        }
        // Stable sort keeps round-robin order among equal priorities.
        let mut ready: Vec<Tid> = self.ready.iter().copied().collect();
        ready.sort_by_key(|&t| core::cmp::Reverse(self.thread(t).priority));
        self.ready = ready.into();
    }

    // ── Sleep list ───────────────────────────────────────────

    fn add_sleeper(&mut self, tid: Tid, wake: i64) {
        self.thread_mut(tid).wake_time = wake;
        self.sleepers.push(tid);
        if self.next_wake < 0 || wake < self.next_wake {
            self.next_wake = wake;
        }
    }

    /// Wake every sleeper that is due. Only scans when the tracked minimum
    /// is reached.
    fn wake_expired(&mut self, now: i64) {
        if self.next_wake < 0 || now < self.next_wake {
            return;
        }
        let mut i = 0;
        while i < self.sleepers.len() {
            let tid = self.sleepers[i];
            if self.thread(tid).wake_time <= now {
                self.sleepers.swap_remove(i);
                self.unblock_locked(tid);
            } else {
                i += 1;
            }
        }
        self.next_wake = self
            .sleepers
            .iter()
            .map(|&t| self.thread(t).wake_time)
            .min()
            .unwrap_or(-1);
    }

    /// Per-tick work. Returns true if the running thread should be
    /// preempted when the handler unwinds.
    fn tick_update(&mut self, now: i64) -> bool {
        // Statistics.
        if Some(self.current) == self.idle {
            self.idle_ticks += 1;
        } else if self.thread(self.current).is_user() {
            self.user_ticks += 1;
        } else {
            self.kernel_ticks += 1;
        }

        if self.mlfqs {
            if Some(self.current) != self.idle {
                let cur = self.current;
                let t = self.thread_mut(cur);
                t.recent_cpu = t.recent_cpu.add_int(1);
            }
            if now % crate::drivers::timer::TIMER_FREQ == 0 {
                self.update_load_avg();
                self.recompute_all_recent_cpu();
            }
            if now % 4 == 0 {
                self.recompute_all_priorities();
            }
        }

        self.wake_expired(now);

        self.slice_ticks += 1;
        let cur_priority = self.thread(self.current).priority;
        let higher_ready = self
            .ready
            .front()
            .map(|&t| self.thread(t).priority > cur_priority)
            .unwrap_or(false);
        (self.slice_ticks >= TIME_SLICE && !self.ready.is_empty()) || higher_ready
    }
}

lazy_static! {
    static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new(false));
}

static CURRENT_TID: AtomicU32 = AtomicU32::new(0);

/// Running thread's tid, without taking the scheduler lock. The moral
/// equivalent of rounding the stack pointer down to the thread page.
pub fn current_tid() -> Tid {
    Tid(CURRENT_TID.load(Ordering::SeqCst))
}

/// Initialize the scheduler: the currently executing code becomes the
/// "main" thread.
pub fn init(mlfqs: bool) {
    let mut sched = SCHEDULER.lock();
    *sched = Scheduler::bootstrap(mlfqs);
    CURRENT_TID.store(sched.current.0, Ordering::SeqCst);
    drop(sched);
    crate::log_info!(
        "Scheduler initialized ({}).",
        if mlfqs { "mlfqs" } else { "priority" }
    );
}

/// Spawn the idle thread and start preemptive scheduling.
pub fn start() {
    let idle_tid = spawn("idle", PRI_MIN, idle_thread, 0).expect("cannot spawn idle thread");
    {
        let mut sched = SCHEDULER.lock();
        sched.idle = Some(idle_tid);
        // The idle thread never sits in the ready queue; pick_next falls
        // back to it explicitly.
        sched.ready.retain(|&t| t != idle_tid);
    }
    x86_64::instructions::interrupts::enable();
    crate::log_info!("Preemptive scheduling started.");
}

fn idle_thread(_aux: u64) {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

/// First Rust frame of every spawned thread; reached through the naked
/// trampoline below with the thread function in rdi and its argument in rsi.
extern "C" fn kernel_thread_entry(func: u64, aux: u64) -> ! {
    reap_dying();
    x86_64::instructions::interrupts::enable();
    let function: fn(u64) = unsafe { core::mem::transmute(func as usize) };
    function(aux);
    exit_thread();
}

#[unsafe(naked)]
extern "C" fn thread_entry_trampoline() {
    core::arch::naked_asm!(
        "mov rdi, r12",
        "mov rsi, r13",
        "call {entry}",
        entry = sym kernel_thread_entry,
    );
}

/// Create a new kernel thread and make it ready. The new thread may start
/// running before spawn returns (it preempts us if it has higher priority).
/// Returns None if allocation fails; the caller is untouched in that case.
pub fn spawn(name: &str, priority: i32, func: fn(u64), aux: u64) -> Option<Tid> {
    let tid = x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let tid = sched.allocate_tid();
        let mut thread = Thread::try_new(tid, name, priority)?;
        thread.context = unsafe {
            Context::prime(
                thread.stack_top(),
                thread_entry_trampoline as usize as u64,
                func as usize as u64,
                aux,
            )
        };

        // Wire up the parent/child wait relationship: we own the node, the
        // child only ever sees it through a weak reference.
        let parent = sched.current;
        let node = Arc::new(WaitNode::new(tid, parent));
        thread.wait_node = Some(Arc::downgrade(&node));
        sched.thread_mut(parent).children.push(node);

        sched.all.insert(tid, Box::new(thread));
        sched.unblock_locked(tid);
        Some(tid)
    })?;
    yield_on_priority();
    Some(tid)
}

/// Run `f` on the current thread's record.
pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        f(sched.thread_mut(cur))
    })
}

/// Run `f` on an arbitrary live thread's record.
pub fn with_thread<R>(tid: Tid, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        sched.all.get_mut(&tid).map(|t| f(t))
    })
}

pub fn thread_name() -> String {
    with_current(|t| t.name.clone())
}

/// Block the current thread. Interrupts must be off; somebody else must
/// eventually unblock us.
pub fn block_current() {
    let mut sched = SCHEDULER.lock();
    let cur = sched.current;
    sched.thread_mut(cur).state = ThreadState::Blocked;
    schedule(sched);
}

/// Make a blocked thread ready. Does not preempt.
pub fn unblock(tid: Tid) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        sched.unblock_locked(tid);
    });
}

/// Yield the CPU, staying ready.
pub fn yield_now() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if sched.idle.is_none() && sched.ready.is_empty() {
            return;
        }
        let cur = sched.current;
        sched.thread_mut(cur).state = ThreadState::Ready;
        if Some(cur) != sched.idle {
            sched.ready_insert(cur);
        }
        schedule(sched);
    });
}

/// Yield iff some ready thread has strictly higher effective priority.
pub fn yield_on_priority() {
    let should = x86_64::instructions::interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        match sched.ready.front() {
            Some(&head) => sched.thread(head).priority > sched.thread(sched.current).priority,
            None => false,
        }
    });
    if should {
        yield_now();
    }
}

/// Preemption entry used by the timer interrupt. Taking the scheduler lock
/// with try_lock keeps a tick that lands inside a scheduler operation from
/// deadlocking (those run with interrupts off, so this is belt and braces).
pub fn try_yield_from_interrupt() {
    let mut sched = match SCHEDULER.try_lock() {
        Some(guard) => guard,
        None => return,
    };
    if sched.idle.is_none() || sched.ready.is_empty() {
        return;
    }
    let cur = sched.current;
    sched.thread_mut(cur).state = ThreadState::Ready;
    if Some(cur) != sched.idle {
        sched.ready_insert(cur);
    }
    schedule(sched);
}

/// Sleep until the tick counter reaches `wake`.
pub fn sleep_until(wake: i64) {
    let slept = x86_64::instructions::interrupts::without_interrupts(|| {
        let now = crate::drivers::timer::ticks();
        if wake <= now {
            return false;
        }
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.add_sleeper(cur, wake);
        sched.thread_mut(cur).state = ThreadState::Blocked;
        schedule(sched);
        true
    });
    if !slept {
        yield_now();
    }
}

/// Deschedule and destroy the current thread. The successor reclaims the
/// thread record and stack.
pub fn exit_thread() -> ! {
    x86_64::instructions::interrupts::disable();
    let mut sched = SCHEDULER.lock();
    let cur = sched.current;
    // Free the wait nodes of our children; orphans simply lose the weak
    // reference and report to nobody.
    sched.thread_mut(cur).children.clear();
    sched.thread_mut(cur).state = ThreadState::Dying;
    schedule(sched);
    unreachable!("a dying thread was rescheduled");
}

/// Timer hook; returns true when the caller should preempt on the way out.
pub fn on_timer_tick(now: i64) -> bool {
    let mut sched = match SCHEDULER.try_lock() {
        Some(guard) => guard,
        None => return false,
    };
    if sched.idle.is_none() {
        return false;
    }
    sched.tick_update(now)
}

// ── Priorities, nice, statistics ─────────────────────────────

pub fn get_priority() -> i32 {
    with_current(|t| t.priority)
}

/// Set the base priority of the running thread. Under donation, the
/// effective priority only changes once every donated lock is released;
/// under MLFQS the call is a no-op.
pub fn set_priority(new_priority: i32) {
    let ignored = x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        if sched.mlfqs {
            return true;
        }
        let cur = sched.current;
        sched.set_base_priority(cur, new_priority);
        false
    });
    if !ignored {
        yield_on_priority();
    }
}

pub fn get_nice() -> i32 {
    with_current(|t| t.nice)
}

pub fn set_nice(nice: i32) {
    with_current(|t| t.nice = nice.clamp(-20, 20));
    yield_on_priority();
}

/// 100 times the system load average, rounded to nearest.
pub fn get_load_avg() -> i32 {
    x86_64::instructions::interrupts::without_interrupts(|| {
        SCHEDULER.lock().load_avg.mul_int(100).to_int_nearest()
    })
}

/// 100 times the current thread's recent_cpu, rounded to nearest.
pub fn get_recent_cpu() -> i32 {
    with_current(|t| t.recent_cpu.mul_int(100).to_int_nearest())
}

pub fn print_stats() {
    let (idle, kernel, user) = x86_64::instructions::interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        (sched.idle_ticks, sched.kernel_ticks, sched.user_ticks)
    });
    crate::println!(
        "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
        idle,
        kernel,
        user
    );
}

// ── Donation entry points used by sync::Lock ─────────────────

pub(crate) fn note_lock_wait(lock: &Arc<LockInner>) {
    let mut sched = SCHEDULER.lock();
    let cur = sched.current;
    sched.lock_wait(cur, lock);
}

pub(crate) fn note_lock_acquired(lock: &Arc<LockInner>) {
    let mut sched = SCHEDULER.lock();
    let cur = sched.current;
    sched.lock_acquired(cur, lock);
}

pub(crate) fn note_lock_released(lock: &Arc<LockInner>) {
    let mut sched = SCHEDULER.lock();
    let cur = sched.current;
    sched.lock_released(cur, lock);
}

/// Highest-priority tid among `tids` (first wins ties, keeping FIFO).
pub fn highest_priority_of(tids: &[Tid]) -> Option<Tid> {
    if tids.is_empty() {
        return None;
    }
    let sched = SCHEDULER.lock();
    sched.highest_priority_in(tids)
}

// ── The switch itself ────────────────────────────────────────

/// Pick the next thread and switch to it. The caller must have moved the
/// running thread out of the Running state and must pass in the (interrupts
/// off) scheduler guard, which is dropped before the switch.
fn schedule(mut sched: spin::MutexGuard<'static, Scheduler>) {
    let cur_tid = sched.current;
    debug_assert_ne!(sched.thread(cur_tid).state, ThreadState::Running);

    let next_tid = sched.pick_next();
    {
        let next = sched.thread(next_tid);
        assert!(
            next.sentinel_ok(),
            "kernel stack overflow in thread '{}'",
            next.name
        );
    }

    sched.current = next_tid;
    CURRENT_TID.store(next_tid.0, Ordering::SeqCst);
    sched.slice_ticks = 0;

    let (next_pagedir, next_stack_top, next_ctx) = {
        let next = sched.thread_mut(next_tid);
        next.state = ThreadState::Running;
        (
            next.pagedir,
            next.stack_top(),
            &next.context as *const Context,
        )
    };

    if next_tid == cur_tid {
        drop(sched);
        unsafe { crate::memory::paging::activate(next_pagedir) };
        return;
    }

    crate::interrupts::gdt::set_tss_rsp0(next_stack_top);
    let cur_ctx = &mut sched.thread_mut(cur_tid).context as *mut Context;

    // The lock must go before the switch: the next thread resumes inside
    // its own critical section, not ours.
    drop(sched);

    // A dying thread parks its state like any other; nobody ever resumes
    // it, and a successor reclaims the record in reap_dying.
    unsafe {
        crate::memory::paging::activate(next_pagedir);
        context::switch_stacks(cur_ctx, next_ctx);
    }

    // Back on cur's stack: bury whoever died while we were away.
    reap_dying();
}

/// Destroy threads that went Dying since the last switch. Runs on the
/// successor's stack, never the dying thread's own.
fn reap_dying() {
    let mut sched = SCHEDULER.lock();
    let current = sched.current;
    let dead: Vec<Tid> = sched
        .all
        .iter()
        .filter(|(_, t)| t.state == ThreadState::Dying)
        .map(|(&tid, _)| tid)
        .filter(|&tid| tid != current)
        .collect();
    for tid in dead {
        sched.all.remove(&tid);
    }
}

#[cfg(test)]
mod tests {
    use super::sync::Lock;
    use super::task::{ThreadState, PRI_DEFAULT};
    use super::*;

    fn add_thread(sched: &mut Scheduler, name: &str, priority: i32) -> Tid {
        let tid = sched.allocate_tid();
        let t = Thread::try_new(tid, name, priority).unwrap();
        sched.all.insert(tid, Box::new(t));
        tid
    }

    fn add_ready(sched: &mut Scheduler, name: &str, priority: i32) -> Tid {
        let tid = add_thread(sched, name, priority);
        sched.thread_mut(tid).state = ThreadState::Ready;
        sched.ready_insert(tid);
        tid
    }

    #[test]
    fn ready_queue_sorted_and_fifo_among_equals() {
        let mut sched = Scheduler::bootstrap(false);
        let low = add_ready(&mut sched, "low", 10);
        let first = add_ready(&mut sched, "first", 31);
        let second = add_ready(&mut sched, "second", 31);
        let high = add_ready(&mut sched, "high", 50);

        assert_eq!(sched.pick_next(), high);
        assert_eq!(sched.pick_next(), first);
        assert_eq!(sched.pick_next(), second);
        assert_eq!(sched.pick_next(), low);
    }

    #[test]
    fn requeue_moves_thread_after_priority_change() {
        let mut sched = Scheduler::bootstrap(false);
        let a = add_ready(&mut sched, "a", 20);
        let b = add_ready(&mut sched, "b", 30);
        sched.thread_mut(a).priority = 40;
        sched.requeue(a);
        assert_eq!(sched.pick_next(), a);
        assert_eq!(sched.pick_next(), b);
    }

    #[test]
    fn donation_raises_holder_and_release_restores() {
        let mut sched = Scheduler::bootstrap(false);
        let holder = add_thread(&mut sched, "holder", 30);
        let waiter = add_thread(&mut sched, "waiter", 40);
        let lock = Lock::new();

        sched.lock_acquired(holder, &lock.inner);
        sched.lock_wait(waiter, &lock.inner);
        assert_eq!(sched.thread(holder).priority, 40);
        assert_eq!(sched.thread(holder).base_priority, 30);

        sched.lock_released(holder, &lock.inner);
        assert_eq!(sched.thread(holder).priority, 30);
        assert!(sched.thread(holder).held_locks.is_empty());
    }

    #[test]
    fn donation_walks_nested_chain() {
        // a(30) holds la; b(40) holds lb and waits on la; c(50) waits on lb.
        let mut sched = Scheduler::bootstrap(false);
        let a = add_thread(&mut sched, "a", 30);
        let b = add_thread(&mut sched, "b", 40);
        let c = add_thread(&mut sched, "c", 50);
        let la = Lock::new();
        let lb = Lock::new();

        sched.lock_acquired(a, &la.inner);
        sched.lock_acquired(b, &lb.inner);
        sched.lock_wait(b, &la.inner);
        assert_eq!(sched.thread(a).priority, 40);

        sched.lock_wait(c, &lb.inner);
        assert_eq!(sched.thread(b).priority, 50);
        assert_eq!(sched.thread(a).priority, 50, "donation must cross the chain");

        // b releases nothing yet; a releases la and falls back to base.
        sched.lock_released(a, &la.inner);
        assert_eq!(sched.thread(a).priority, 30);
    }

    #[test]
    fn release_keeps_highest_remaining_donation() {
        let mut sched = Scheduler::bootstrap(false);
        let holder = add_thread(&mut sched, "holder", 10);
        let w1 = add_thread(&mut sched, "w1", 35);
        let w2 = add_thread(&mut sched, "w2", 45);
        let l1 = Lock::new();
        let l2 = Lock::new();

        sched.lock_acquired(holder, &l1.inner);
        sched.lock_acquired(holder, &l2.inner);
        sched.lock_wait(w1, &l1.inner);
        sched.lock_wait(w2, &l2.inner);
        assert_eq!(sched.thread(holder).priority, 45);

        sched.lock_released(holder, &l2.inner);
        // Still holding l1 with a 35-priority waiter.
        assert_eq!(sched.thread(holder).priority, 35);
        sched.lock_released(holder, &l1.inner);
        assert_eq!(sched.thread(holder).priority, 10);
    }

    #[test]
    fn set_priority_defers_to_active_donation() {
        let mut sched = Scheduler::bootstrap(false);
        let holder = add_thread(&mut sched, "holder", 30);
        let waiter = add_thread(&mut sched, "waiter", 40);
        let lock = Lock::new();

        sched.lock_acquired(holder, &lock.inner);
        sched.lock_wait(waiter, &lock.inner);
        assert_eq!(sched.thread(holder).priority, 40);

        // Donated priority wins until the lock goes away; the new base is
        // remembered.
        sched.set_base_priority(holder, 35);
        assert_eq!(sched.thread(holder).priority, 40);
        assert_eq!(sched.thread(holder).base_priority, 35);
        sched.lock_released(holder, &lock.inner);
        assert_eq!(sched.thread(holder).priority, 35);

        // Without donation the change is immediate.
        sched.set_base_priority(holder, 20);
        assert_eq!(sched.thread(holder).priority, 20);
    }

    #[test]
    fn sleep_list_tracks_minimum_wake_time() {
        let mut sched = Scheduler::bootstrap(false);
        let a = add_thread(&mut sched, "a", PRI_DEFAULT);
        let b = add_thread(&mut sched, "b", PRI_DEFAULT);
        sched.thread_mut(a).state = ThreadState::Blocked;
        sched.thread_mut(b).state = ThreadState::Blocked;
        sched.add_sleeper(a, 100);
        sched.add_sleeper(b, 50);
        assert_eq!(sched.next_wake, 50);

        // Nothing due yet: no wakeups, minimum unchanged.
        sched.wake_expired(49);
        assert_eq!(sched.thread(b).state, ThreadState::Blocked);

        sched.wake_expired(50);
        assert_eq!(sched.thread(b).state, ThreadState::Ready);
        assert_eq!(sched.thread(a).state, ThreadState::Blocked);
        assert_eq!(sched.next_wake, 100);

        sched.wake_expired(100);
        assert_eq!(sched.thread(a).state, ThreadState::Ready);
        assert_eq!(sched.next_wake, -1);
    }

    #[test]
    fn mlfqs_priority_formula() {
        let mut sched = Scheduler::bootstrap(true);
        let t = add_thread(&mut sched, "t", PRI_DEFAULT);
        sched.thread_mut(t).recent_cpu = Fp::from_int(40);
        sched.thread_mut(t).nice = 5;
        sched.recompute_all_priorities();
        // 63 - 40/4 - 2*5 = 43
        assert_eq!(sched.thread(t).priority, 43);

        sched.thread_mut(t).recent_cpu = Fp::from_int(1000);
        sched.recompute_all_priorities();
        assert_eq!(sched.thread(t).priority, PRI_MIN, "priority clamps at PRI_MIN");
    }

    #[test]
    fn load_avg_counts_ready_and_running() {
        let mut sched = Scheduler::bootstrap(true);
        add_ready(&mut sched, "r1", PRI_DEFAULT);
        add_ready(&mut sched, "r2", PRI_DEFAULT);
        // current ("main") counts too: 3 ready threads total.
        assert_eq!(sched.ready_thread_count(), 3);
        for _ in 0..600 {
            sched.update_load_avg();
        }
        assert_eq!(sched.load_avg.to_int_nearest(), 3);
    }
}
