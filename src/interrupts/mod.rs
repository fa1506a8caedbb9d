pub mod gdt;
pub mod idt;
pub mod usermode;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Nesting depth of external interrupt handlers. Blocking primitives must
/// not yield while this is non-zero.
static INTERRUPT_DEPTH: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn enter_interrupt() {
    INTERRUPT_DEPTH.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn leave_interrupt() {
    INTERRUPT_DEPTH.fetch_sub(1, Ordering::SeqCst);
}

/// True while running an external interrupt handler.
pub fn in_interrupt() -> bool {
    INTERRUPT_DEPTH.load(Ordering::SeqCst) > 0
}

pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
}
