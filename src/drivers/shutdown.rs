//! Machine power-off and reboot, plus the policy configured by -q / -r.

use core::sync::atomic::{AtomicU8, Ordering};
use x86_64::instructions::port::Port;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ShutdownMode {
    /// Halt in place when the actions finish.
    #[default]
    None = 0,
    PowerOff = 1,
    Reboot = 2,
}

static MODE: AtomicU8 = AtomicU8::new(ShutdownMode::None as u8);

pub fn configure(mode: ShutdownMode) {
    MODE.store(mode as u8, Ordering::SeqCst);
}

fn mode() -> ShutdownMode {
    match MODE.load(Ordering::SeqCst) {
        1 => ShutdownMode::PowerOff,
        2 => ShutdownMode::Reboot,
        _ => ShutdownMode::None,
    }
}

/// Act out the configured shutdown policy after the boot actions ran.
pub fn shutdown() -> ! {
    match mode() {
        ShutdownMode::PowerOff => power_off(),
        ShutdownMode::Reboot => reboot(),
        ShutdownMode::None => halt_forever(),
    }
}

/// Panic policy: power off under -q so a scripted run terminates, halt
/// otherwise so the console survives for inspection.
pub fn on_panic() -> ! {
    if mode() == ShutdownMode::PowerOff {
        power_off()
    } else {
        halt_forever()
    }
}

pub fn power_off() -> ! {
    crate::println!("Powering off...");
    unsafe {
        // QEMU and Bochs ACPI poweroff ports; whichever one exists wins.
        Port::<u16>::new(0x604).write(0x2000);
        Port::<u16>::new(0xB004).write(0x2000);
    }
    halt_forever()
}

pub fn reboot() -> ! {
    crate::println!("Rebooting...");
    unsafe {
        // Pulse the keyboard controller's reset line.
        Port::<u8>::new(0x64).write(0xFE);
    }
    halt_forever()
}

fn halt_forever() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}
