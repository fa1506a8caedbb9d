//! System-call dispatch. User programs trap through int 0x30 with the
//! syscall number and up to three word arguments on their stack; the
//! result is returned in RAX. Bad argument-slot pointers kill the caller;
//! bad buffer contents are left to the page-fault path.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::fs::directory::{separate_path, NAME_MAX};
use crate::fs::fd::UNMAPPED;
use crate::fs::{fs, FileSys};
use crate::interrupts::usermode::TrapFrame;
use crate::memory::{is_user_vaddr, pg_round_down, PGSIZE, PHYS_BASE};
use crate::scheduler::{self, process};
use crate::vm::page::{self, Role};

pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_EXEC: u64 = 2;
pub const SYS_WAIT: u64 = 3;
pub const SYS_CREATE: u64 = 4;
pub const SYS_REMOVE: u64 = 5;
pub const SYS_OPEN: u64 = 6;
pub const SYS_FILESIZE: u64 = 7;
pub const SYS_READ: u64 = 8;
pub const SYS_WRITE: u64 = 9;
pub const SYS_SEEK: u64 = 10;
pub const SYS_TELL: u64 = 11;
pub const SYS_CLOSE: u64 = 12;
pub const SYS_MMAP: u64 = 13;
pub const SYS_MUNMAP: u64 = 14;
pub const SYS_CHDIR: u64 = 15;
pub const SYS_MKDIR: u64 = 16;
pub const SYS_READDIR: u64 = 17;
pub const SYS_ISDIR: u64 = 18;
pub const SYS_INUMBER: u64 = 19;

const ERROR: u64 = u64::MAX;
/// Longest path accepted from user space.
const PATH_MAX: usize = 128;
/// create() keeps the original's tighter cap.
const CREATE_PATH_MAX: usize = 64;

pub fn init() {
    crate::log_info!("Syscall interface on int {:#x}.", crate::interrupts::idt::SYSCALL_VECTOR);
}

/// Read one word from user space; None for kernel addresses. The actual
/// dereference may still fault, which the fault path resolves or punishes.
fn user_word(addr: u64) -> Option<u64> {
    if addr == 0 || addr.checked_add(8)? > PHYS_BASE {
        return None;
    }
    Some(unsafe { (addr as *const u64).read_unaligned() })
}

/// i-th syscall argument, one word above the number on the user stack.
fn arg(frame: &TrapFrame, i: u64) -> Option<u64> {
    user_word(frame.rsp + 8 * (1 + i))
}

/// Copy a NUL-terminated user string, capped at `max` bytes.
fn user_cstr(ptr: u64, max: usize) -> Option<String> {
    if ptr == 0 || !is_user_vaddr(ptr) {
        return None;
    }
    let mut bytes = Vec::new();
    for i in 0..max as u64 {
        if !is_user_vaddr(ptr + i) {
            return None;
        }
        let b = unsafe { ((ptr + i) as *const u8).read() };
        if b == 0 {
            return String::from_utf8(bytes).ok();
        }
        bytes.push(b);
    }
    None
}

/// Borrow a user buffer. The range must sit below PHYS_BASE; page presence
/// is the fault handler's business.
fn user_slice_mut(ptr: u64, len: usize) -> Option<&'static mut [u8]> {
    if ptr == 0 || len == 0 {
        return None;
    }
    let end = ptr.checked_add(len as u64)?;
    if end > PHYS_BASE {
        return None;
    }
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len) })
}

fn user_slice(ptr: u64, len: usize) -> Option<&'static [u8]> {
    user_slice_mut(ptr, len).map(|s| &*s)
}

/// Resolve a user path into (directory sector, final component).
fn resolve(fs: &FileSys, path: &str) -> Option<(u32, String)> {
    let (dir_part, name) = separate_path(path)?;
    let wd = scheduler::with_current(|t| t.wd);
    let dir_sector = fs.parse(wd, dir_part)?;
    Some((dir_sector, String::from(name)))
}

fn current_file(fd: u64) -> Option<Arc<Mutex<crate::fs::file::File>>> {
    scheduler::with_current(|t| t.fd_table.get(fd as u32))
}

/// Central dispatcher, called from the int 0x30 stub with the saved frame.
pub extern "C" fn dispatch(frame: &mut TrapFrame) -> u64 {
    // The trap gate masked interrupts; syscalls are preemptible.
    x86_64::instructions::interrupts::enable();

    let number = match user_word(frame.rsp) {
        Some(n) => n,
        None => process::exit(-1),
    };

    match number {
        SYS_HALT => crate::drivers::shutdown::power_off(),
        SYS_EXIT => {
            let status = require(arg(frame, 0)) as i32;
            process::exit(status)
        }
        SYS_EXEC => sys_exec(frame),
        SYS_WAIT => {
            let pid = require(arg(frame, 0));
            process::wait(crate::scheduler::task::Tid(pid as u32)) as i64 as u64
        }
        SYS_CREATE => sys_create(frame),
        SYS_REMOVE => sys_remove(frame),
        SYS_OPEN => sys_open(frame),
        SYS_FILESIZE => sys_filesize(frame),
        SYS_READ => sys_read(frame),
        SYS_WRITE => sys_write(frame),
        SYS_SEEK => sys_seek(frame),
        SYS_TELL => sys_tell(frame),
        SYS_CLOSE => sys_close(frame),
        SYS_MMAP => sys_mmap(frame),
        SYS_MUNMAP => sys_munmap(frame),
        SYS_CHDIR => sys_chdir(frame),
        SYS_MKDIR => sys_mkdir(frame),
        SYS_READDIR => sys_readdir(frame),
        SYS_ISDIR => sys_isdir(frame),
        SYS_INUMBER => sys_inumber(frame),
        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            process::exit(-1)
        }
    }
}

/// Argument slots must be valid user addresses; anything else kills the
/// caller, like any other bad pointer handed to the kernel.
fn require(value: Option<u64>) -> u64 {
    match value {
        Some(v) => v,
        None => process::exit(-1),
    }
}

fn sys_exec(frame: &TrapFrame) -> u64 {
    let ptr = require(arg(frame, 0));
    let cmdline = match user_cstr(ptr, process::MAX_CMDLINE_LENGTH) {
        Some(s) => s,
        None => return ERROR,
    };
    process::execute_and_wait_load(&cmdline) as i64 as u64
}

fn sys_create(frame: &TrapFrame) -> u64 {
    let ptr = require(arg(frame, 0));
    let size = require(arg(frame, 1)) as u32;
    if ptr == 0 || !is_user_vaddr(ptr) {
        process::exit(-1);
    }
    let path = match user_cstr(ptr, CREATE_PATH_MAX) {
        Some(s) => s,
        None => return false as u64,
    };
    let fs = fs();
    let (dir_sector, name) = match resolve(fs, &path) {
        Some(r) => r,
        None => return false as u64,
    };
    fs.fs_lock.acquire();
    let ok = fs.create(dir_sector, &name, size);
    fs.fs_lock.release();
    ok as u64
}

fn sys_remove(frame: &TrapFrame) -> u64 {
    let ptr = require(arg(frame, 0));
    if ptr == 0 || !is_user_vaddr(ptr) {
        process::exit(-1);
    }
    let path = match user_cstr(ptr, PATH_MAX) {
        Some(s) => s,
        None => return false as u64,
    };
    let fs = fs();
    let (dir_sector, name) = match resolve(fs, &path) {
        Some(r) => r,
        None => return false as u64,
    };
    fs.fs_lock.acquire();
    let ok = fs.remove(dir_sector, &name);
    fs.fs_lock.release();
    ok as u64
}

fn sys_open(frame: &TrapFrame) -> u64 {
    let ptr = require(arg(frame, 0));
    if ptr == 0 || !is_user_vaddr(ptr) {
        return ERROR;
    }
    let path = match user_cstr(ptr, PATH_MAX) {
        Some(s) => s,
        None => return ERROR,
    };
    let fs = fs();
    let (dir_sector, name) = match resolve(fs, &path) {
        Some(r) => r,
        None => return ERROR,
    };
    fs.fs_lock.acquire();
    let file = fs.open(dir_sector, &name);
    fs.fs_lock.release();
    match file {
        Some(file) => {
            let handle = Arc::new(Mutex::new(file));
            scheduler::with_current(|t| t.fd_table.install(handle)) as u64
        }
        None => ERROR,
    }
}

fn sys_filesize(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    match current_file(fd) {
        Some(file) => {
            let file = file.lock();
            fs().file_length(&file) as u64
        }
        None => ERROR,
    }
}

/// Make sure the pages behind a user buffer are resident and wired, so
/// the disk path below cannot recurse into the fault handler while every
/// frame is taken. Returns the pages pinned.
fn pin_buffer(tid: crate::scheduler::task::Tid, ptr: u64, len: usize, rsp: u64) -> Vec<u64> {
    let mut pinned = Vec::new();
    if !crate::vm::frame::is_full() {
        return pinned;
    }
    let mut upage = pg_round_down(ptr);
    let end = ptr + len as u64;
    while upage < end {
        match page::seek(tid, upage) {
            Some(node) if node.loc == page::Location::Memory => {
                crate::vm::frame::set_pinned(tid, upage, true);
                pinned.push(upage);
            }
            Some(node) => {
                if page::pull_page(tid, &node) {
                    crate::vm::frame::set_pinned(tid, upage, true);
                    pinned.push(upage);
                }
            }
            None => {
                let role = scheduler::with_current(|t| t.vma.classify(upage, rsp));
                if role != Role::Unused
                    && page::install_new_page(tid, upage, role, role != Role::Code, page::PageFlags::PIN)
                {
                    pinned.push(upage);
                }
            }
        }
        upage += PGSIZE;
    }
    pinned
}

fn unpin_buffer(tid: crate::scheduler::task::Tid, pinned: &[u64]) {
    for &upage in pinned {
        crate::vm::frame::set_pinned(tid, upage, false);
    }
}

fn sys_read(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    let ptr = require(arg(frame, 1));
    let len = require(arg(frame, 2)) as usize;

    if fd == 1 {
        return ERROR;
    }
    if len == 0 {
        return 0;
    }
    let buf = match user_slice_mut(ptr, len) {
        Some(buf) => buf,
        None => process::exit(-1),
    };
    if fd == 0 {
        buf[0] = crate::drivers::kbd::getc();
        return 1;
    }

    let file = match current_file(fd) {
        Some(file) => file,
        None => return ERROR,
    };
    let tid = scheduler::current_tid();
    let pinned = pin_buffer(tid, ptr, len, frame.rsp);

    let fs = fs();
    fs.fs_lock.acquire();
    let n = {
        let mut file = file.lock();
        fs.file_read(&mut file, buf)
    };
    fs.fs_lock.release();

    unpin_buffer(tid, &pinned);
    n as u64
}

fn sys_write(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    let ptr = require(arg(frame, 1));
    let len = require(arg(frame, 2)) as usize;

    if fd == 0 {
        return ERROR;
    }
    if len == 0 {
        return 0;
    }
    let buf = match user_slice(ptr, len) {
        Some(buf) => buf,
        None => process::exit(-1),
    };
    if fd == 1 {
        crate::vga::putbuf(buf);
        return len as u64;
    }

    let file = match current_file(fd) {
        Some(file) => file,
        None => return ERROR,
    };
    let fs = fs();
    {
        let file = file.lock();
        if fs.file_is_dir(&file) {
            return ERROR;
        }
    }
    fs.fs_lock.acquire();
    let n = {
        let mut file = file.lock();
        fs.file_write(&mut file, buf)
    };
    fs.fs_lock.release();
    n as u64
}

fn sys_seek(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    let pos = require(arg(frame, 1)) as u32;
    if let Some(file) = current_file(fd) {
        let fs = fs();
        fs.fs_lock.acquire();
        fs.file_seek(&mut file.lock(), pos);
        fs.fs_lock.release();
    }
    0
}

fn sys_tell(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    match current_file(fd) {
        Some(file) => fs().file_tell(&file.lock()) as u64,
        None => ERROR,
    }
}

fn sys_close(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    if fd == 0 || fd == 1 {
        return ERROR;
    }
    let node = match scheduler::with_current(|t| t.fd_table.remove(fd as u32)) {
        Some(node) => node,
        None => return ERROR,
    };
    let fs = fs();

    // A still-mapped region must survive the close: give the mapping its
    // own handle on the file before this one goes away.
    if node.mapid != UNMAPPED {
        let fresh = {
            let file = node.file.lock();
            fs.file_reopen(&file)
        };
        scheduler::with_current(|t| {
            if let Some(m) = t.vma.mmaps.iter_mut().find(|m| m.mapid == node.mapid) {
                m.file = Arc::new(Mutex::new(fresh));
            }
        });
    }

    fs.fs_lock.acquire();
    crate::fs::close_shared(fs, node.file);
    fs.fs_lock.release();
    fs.writeback_all();
    0
}

fn sys_mmap(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    let addr = require(arg(frame, 1));
    if fd == 0 || fd == 1 {
        return ERROR;
    }
    let file = match current_file(fd) {
        Some(file) => file,
        None => return ERROR,
    };
    let tid = scheduler::current_tid();
    let mapid = page::mmap_map(tid, fd as u32, file, addr);
    if mapid != -1 {
        scheduler::with_current(|t| t.fd_table.set_mapid(fd as u32, mapid));
    }
    mapid as i64 as u64
}

fn sys_munmap(frame: &TrapFrame) -> u64 {
    let mapid = require(arg(frame, 0)) as i32;
    let tid = scheduler::current_tid();
    // The descriptor (if still open) stops being a mapping.
    scheduler::with_current(|t| t.fd_table.clear_mapid(mapid));
    page::mmap_unmap(tid, mapid);
    0
}

fn sys_chdir(frame: &TrapFrame) -> u64 {
    let ptr = require(arg(frame, 0));
    let path = match user_cstr(ptr, PATH_MAX) {
        Some(s) => s,
        None => return false as u64,
    };
    let fs = fs();
    let wd = scheduler::with_current(|t| t.wd);
    match fs.parse(wd, &path) {
        Some(sector) => {
            let inode = fs.inode_open(sector);
            let is_dir = fs.inode_is_dir(&inode);
            fs.inode_close(inode);
            if !is_dir {
                return false as u64;
            }
            scheduler::with_current(|t| t.wd = sector);
            true as u64
        }
        None => false as u64,
    }
}

fn sys_mkdir(frame: &TrapFrame) -> u64 {
    let ptr = require(arg(frame, 0));
    let path = match user_cstr(ptr, PATH_MAX) {
        Some(s) => s,
        None => return false as u64,
    };
    let fs = fs();
    let (dir_sector, name) = match resolve(fs, &path) {
        Some(r) => r,
        None => return false as u64,
    };
    fs.fs_lock.acquire();
    let ok = fs.mkdir(dir_sector, &name);
    fs.fs_lock.release();
    ok as u64
}

fn sys_readdir(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    let ptr = require(arg(frame, 1));
    let out = match user_slice_mut(ptr, NAME_MAX + 1) {
        Some(out) => out,
        None => process::exit(-1),
    };
    let file = match current_file(fd) {
        Some(file) => file,
        None => return false as u64,
    };
    let fs = fs();
    let mut file = file.lock();
    if !fs.file_is_dir(&file) {
        return false as u64;
    }

    // Walk entries from the descriptor's offset so successive calls
    // advance through the directory.
    let mut raw = [0u8; crate::fs::directory::DIR_ENTRY_SIZE];
    loop {
        if fs.file_read(&mut file, &mut raw) != raw.len() {
            return false as u64;
        }
        let entry = crate::fs::directory::DirEntry::unpack(&raw);
        if !entry.in_use || entry.name_str() == "." || entry.name_str() == ".." {
            continue;
        }
        let name = entry.name_str().as_bytes();
        out[..name.len()].copy_from_slice(name);
        out[name.len()] = 0;
        return true as u64;
    }
}

fn sys_isdir(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    match current_file(fd) {
        Some(file) => fs().file_is_dir(&file.lock()) as u64,
        None => false as u64,
    }
}

fn sys_inumber(frame: &TrapFrame) -> u64 {
    let fd = require(arg(frame, 0));
    match current_file(fd) {
        Some(file) => fs().file_inumber(&file.lock()) as u64,
        None => ERROR,
    }
}
