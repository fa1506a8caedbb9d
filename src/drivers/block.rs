//! The named block-device interface the file system sits on, plus the
//! role registry that assigns devices to the filesys/scratch/swap slots at
//! boot.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub const SECTOR_SIZE: usize = 512;

/// A device addressable in 512-byte sectors. Implementations panic on
/// hardware errors; a disk that stops answering is fatal to a kernel whose
/// file system lives on it.
pub trait BlockDevice: Send + Sync {
    /// Total sectors on the device.
    fn capacity(&self) -> u32;
    fn read_sector(&self, lba: u32, buf: &mut [u8; SECTOR_SIZE]);
    fn write_sector(&self, lba: u32, buf: &[u8; SECTOR_SIZE]);
}

/// The roles the kernel command line can assign devices to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    FileSys = 0,
    Scratch = 1,
    Swap = 2,
}

struct Registry {
    devices: Vec<(String, Arc<dyn BlockDevice>)>,
    roles: [Option<Arc<dyn BlockDevice>>; 3],
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    devices: Vec::new(),
    roles: [None, None, None],
});

pub fn register(name: &str, dev: Arc<dyn BlockDevice>) {
    let mut registry = REGISTRY.lock();
    registry.devices.push((String::from(name), dev));
}

pub fn by_name(name: &str) -> Option<Arc<dyn BlockDevice>> {
    let registry = REGISTRY.lock();
    registry
        .devices
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, d)| d.clone())
}

/// Bind `role` to the device named `name`, or to the `index`-th registered
/// device when no name was given (probe order).
pub fn assign_role(role: BlockRole, name: Option<&str>, index: usize) {
    let dev = match name {
        Some(name) => match by_name(name) {
            Some(dev) => Some(dev),
            None => panic!("No such block device \"{}\"", name),
        },
        None => {
            let registry = REGISTRY.lock();
            registry.devices.get(index).map(|(_, d)| d.clone())
        }
    };
    if let Some(dev) = dev {
        REGISTRY.lock().roles[role as usize] = Some(dev);
    } else {
        crate::log_warn!("no device available for role {:?}", role);
    }
}

pub fn role_device(role: BlockRole) -> Option<Arc<dyn BlockDevice>> {
    REGISTRY.lock().roles[role as usize].clone()
}

/// An in-memory disk for the file-system and cache test suites.
#[cfg(test)]
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

#[cfg(test)]
impl MemDisk {
    pub fn new(sector_count: u32) -> MemDisk {
        MemDisk {
            sectors: Mutex::new(alloc::vec![[0u8; SECTOR_SIZE]; sector_count as usize]),
        }
    }
}

#[cfg(test)]
impl BlockDevice for MemDisk {
    fn capacity(&self) -> u32 {
        self.sectors.lock().len() as u32
    }

    fn read_sector(&self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) {
        buf.copy_from_slice(&self.sectors.lock()[lba as usize]);
    }

    fn write_sector(&self, lba: u32, buf: &[u8; SECTOR_SIZE]) {
        self.sectors.lock()[lba as usize].copy_from_slice(buf);
    }
}
