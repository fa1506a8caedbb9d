//! Just enough PS/2 keyboard to satisfy `read(0, ..)`: scancodes from the
//! IRQ1 handler become ASCII bytes in a queue readers block on.

use alloc::collections::VecDeque;
use spin::Mutex;

use crate::scheduler::sync::Semaphore;

/// Scancode set 1, unshifted. 0 = no mapping.
const SCANCODE_MAP: [u8; 64] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ', 0, 0, 0, 0, 0, 0,
];

struct Input {
    queue: Mutex<VecDeque<u8>>,
    avail: Semaphore,
}

lazy_static::lazy_static! {
    static ref INPUT: Input = Input {
        queue: Mutex::new(VecDeque::new()),
        avail: Semaphore::new(0),
    };
}

/// Called from the IRQ1 handler. Key releases and unmapped codes are
/// dropped.
pub fn push_scancode(scancode: u8) {
    if scancode & 0x80 != 0 {
        return;
    }
    let byte = SCANCODE_MAP
        .get(scancode as usize)
        .copied()
        .unwrap_or(0);
    if byte == 0 {
        return;
    }
    INPUT.queue.lock().push_back(byte);
    // up() never yields in interrupt context, so this is IRQ-safe.
    INPUT.avail.up();
}

/// Blocking read of one input byte; backs `read` on fd 0.
pub fn getc() -> u8 {
    INPUT.avail.down();
    INPUT
        .queue
        .lock()
        .pop_front()
        .expect("input semaphore out of sync with queue")
}
