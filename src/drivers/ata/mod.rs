pub mod pio;

use alloc::sync::Arc;

use crate::drivers::block::BlockDevice;
use pio::AtaDevice;

/// Probe both legacy IDE channels and register every disk that answers as
/// hd[a-d], in probe order.
pub fn init() {
    let channels: [(u16, u16, bool, &str); 4] = [
        (0x1F0, 0x3F6, true, "hda"),
        (0x1F0, 0x3F6, false, "hdb"),
        (0x170, 0x376, true, "hdc"),
        (0x170, 0x376, false, "hdd"),
    ];

    for (io_base, ctrl_base, is_master, name) in channels {
        let mut dev = AtaDevice::new(io_base, ctrl_base, is_master);
        if dev.identify().is_ok() {
            crate::log_info!("ATA PIO: {} detected, {} sectors.", name, dev.capacity());
            crate::drivers::block::register(name, Arc::new(dev));
        }
    }
}
