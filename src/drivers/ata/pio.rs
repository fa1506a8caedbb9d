use bitflags::bitflags;
use core::fmt;
use x86_64::instructions::port::Port;

use crate::drivers::block::{BlockDevice, SECTOR_SIZE};

/// Task-file registers, as offsets from the channel's I/O base.
#[derive(Debug, Clone, Copy)]
#[repr(u16)]
enum Reg {
    Data = 0,
    SectorCount = 2,
    LbaLo = 3,
    LbaMid = 4,
    LbaHi = 5,
    Drive = 6,
    /// Status on read, command on write.
    Command = 7,
}

bitflags! {
    /// Status register bits.
    #[derive(Clone, Copy)]
    struct Status: u8 {
        const ERR = 1 << 0;
        const DRQ = 1 << 3;
        const DF = 1 << 5;
        const BSY = 1 << 7;
    }
}

// Commands.
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;
const CMD_IDENTIFY: u8 = 0xEC;

/// Drive-select bits: obligatory 1 bits plus LBA addressing mode.
const SELECT_FIXED: u8 = 0xA0;
const SELECT_SLAVE: u8 = 1 << 4;
const SELECT_LBA: u8 = 1 << 6;

/// Status polls before a stuck device is declared dead.
const POLL_BUDGET: u32 = 1_000_000;

#[derive(Debug, Clone, Copy)]
pub enum AtaError {
    DeviceNotFound,
    DeviceFault,
    Timeout,
}

impl fmt::Display for AtaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AtaError::DeviceNotFound => write!(f, "Device not found"),
            AtaError::DeviceFault => write!(f, "Device fault"),
            AtaError::Timeout => write!(f, "Status poll timed out"),
        }
    }
}

pub type AtaResult<T> = Result<T, AtaError>;

/// One drive on a legacy IDE channel, driven by polled PIO.
pub struct AtaDevice {
    io_base: u16,
    ctrl_base: u16,
    select: u8,
    pub detected: bool,
    capacity: u32,
}

impl AtaDevice {
    pub const fn new(io_base: u16, ctrl_base: u16, is_master: bool) -> Self {
        AtaDevice {
            io_base,
            ctrl_base,
            select: if is_master {
                SELECT_FIXED
            } else {
                SELECT_FIXED | SELECT_SLAVE
            },
            detected: false,
            capacity: 0,
        }
    }

    fn read_reg(&self, reg: Reg) -> u8 {
        unsafe { Port::<u8>::new(self.io_base + reg as u16).read() }
    }

    fn write_reg(&self, reg: Reg, value: u8) {
        unsafe { Port::<u8>::new(self.io_base + reg as u16).write(value) }
    }

    fn read_data(&self) -> u16 {
        unsafe { Port::<u16>::new(self.io_base + Reg::Data as u16).read() }
    }

    fn write_data(&self, value: u16) {
        unsafe { Port::<u16>::new(self.io_base + Reg::Data as u16).write(value) }
    }

    /// Alternate status: readable without acknowledging interrupts.
    fn alt_status(&self) -> u8 {
        unsafe { Port::<u8>::new(self.ctrl_base).read() }
    }

    /// The mandated 400ns settle after a drive select, paid for with four
    /// alternate-status reads.
    fn settle(&self) {
        for _ in 0..4 {
            let _ = self.alt_status();
        }
    }

    /// Spin until the device is idle and, if `want` is non-empty, has
    /// raised those bits. ERR/DF abort the wait; a spent budget means the
    /// device went silent.
    fn poll(&self, want: Status) -> AtaResult<Status> {
        let mut budget = POLL_BUDGET;
        loop {
            let status = Status::from_bits_truncate(self.read_reg(Reg::Command));
            if !status.contains(Status::BSY) {
                if status.intersects(Status::ERR | Status::DF) {
                    return Err(AtaError::DeviceFault);
                }
                if want.is_empty() || status.contains(want) {
                    return Ok(status);
                }
            }
            budget -= 1;
            if budget == 0 {
                return Err(AtaError::Timeout);
            }
            core::hint::spin_loop();
        }
    }

    /// Select this drive with the high LBA nibble, program the transfer
    /// length and address, and fire `cmd`.
    fn issue(&self, lba: u32, count: u8, cmd: u8) -> AtaResult<()> {
        self.poll(Status::empty())?;
        self.write_reg(Reg::Drive, self.select | SELECT_LBA | ((lba >> 24) as u8 & 0x0F));
        self.settle();
        self.write_reg(Reg::SectorCount, count);
        self.write_reg(Reg::LbaLo, lba as u8);
        self.write_reg(Reg::LbaMid, (lba >> 8) as u8);
        self.write_reg(Reg::LbaHi, (lba >> 16) as u8);
        self.write_reg(Reg::Command, cmd);
        Ok(())
    }

    /// Probe the drive with IDENTIFY, recording its LBA28 capacity.
    pub fn identify(&mut self) -> AtaResult<()> {
        self.write_reg(Reg::Drive, self.select);
        self.settle();
        for reg in [Reg::SectorCount, Reg::LbaLo, Reg::LbaMid, Reg::LbaHi] {
            self.write_reg(reg, 0);
        }
        self.write_reg(Reg::Command, CMD_IDENTIFY);

        // A floating bus reads as all-zero status: nothing on the cable.
        if self.read_reg(Reg::Command) == 0 {
            return Err(AtaError::DeviceNotFound);
        }
        // Whatever answered, wait it out; anything that errors or stalls
        // here is not a disk we can use.
        self.poll(Status::empty())
            .map_err(|_| AtaError::DeviceNotFound)?;
        // ATAPI and friends leave a non-zero signature in the LBA bytes.
        if self.read_reg(Reg::LbaMid) != 0 || self.read_reg(Reg::LbaHi) != 0 {
            return Err(AtaError::DeviceNotFound);
        }
        self.poll(Status::DRQ).map_err(|_| AtaError::DeviceNotFound)?;

        let mut identify = [0u16; 256];
        for word in identify.iter_mut() {
            *word = self.read_data();
        }
        // Words 60..62 hold the LBA28 sector count.
        self.capacity = identify[60] as u32 | (identify[61] as u32) << 16;
        self.detected = true;
        Ok(())
    }

    /// Read one sector at `lba`.
    pub fn read_lba(&self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> AtaResult<()> {
        if !self.detected {
            return Err(AtaError::DeviceNotFound);
        }
        self.issue(lba, 1, CMD_READ_SECTORS)?;
        self.poll(Status::DRQ)?;
        for chunk in buf.chunks_exact_mut(2) {
            chunk.copy_from_slice(&self.read_data().to_le_bytes());
        }
        Ok(())
    }

    /// Write one sector at `lba` and flush the drive's cache.
    pub fn write_lba(&self, lba: u32, buf: &[u8; SECTOR_SIZE]) -> AtaResult<()> {
        if !self.detected {
            return Err(AtaError::DeviceNotFound);
        }
        self.issue(lba, 1, CMD_WRITE_SECTORS)?;
        self.poll(Status::DRQ)?;
        for chunk in buf.chunks_exact(2) {
            self.write_data(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        self.write_reg(Reg::Command, CMD_CACHE_FLUSH);
        self.poll(Status::empty())?;
        Ok(())
    }
}

/// The buffer cache is the only caller and has no recovery story for a
/// dead disk, so hardware errors are fatal here.
impl BlockDevice for AtaDevice {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read_sector(&self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) {
        if let Err(e) = self.read_lba(lba, buf) {
            panic!("ide: read of sector {} failed: {}", lba, e);
        }
    }

    fn write_sector(&self, lba: u32, buf: &[u8; SECTOR_SIZE]) {
        if let Err(e) = self.write_lba(lba, buf) {
            panic!("ide: write of sector {} failed: {}", lba, e);
        }
    }
}
