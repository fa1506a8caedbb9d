//! 8254 PIT programming and the kernel tick counter.

use core::sync::atomic::{AtomicI64, Ordering};
use x86_64::instructions::port::Port;

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;

/// PIT input clock in Hz.
const PIT_HZ: u32 = 1_193_182;

static TICKS: AtomicI64 = AtomicI64::new(0);

/// Program channel 0 for rate generation at TIMER_FREQ.
pub fn init() {
    let divisor = (PIT_HZ / TIMER_FREQ as u32) as u16;
    let mut command: Port<u8> = Port::new(0x43);
    let mut channel0: Port<u8> = Port::new(0x40);
    unsafe {
        command.write(0x34); // channel 0, lobyte/hibyte, mode 2
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
    crate::log_info!("PIT timer programmed at {} Hz.", TIMER_FREQ);
}

/// Ticks since boot.
pub fn ticks() -> i64 {
    TICKS.load(Ordering::SeqCst)
}

/// Timer interrupt body. Returns true when the running thread's slice is
/// up or a higher-priority thread became ready.
pub fn on_tick() -> bool {
    let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
    crate::scheduler::on_timer_tick(now)
}

/// Block the caller for roughly `n` ticks.
pub fn sleep(n: i64) {
    crate::scheduler::sleep_until(ticks() + n)
}
