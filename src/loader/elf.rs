//! ELF64 loader: header validation, page-by-page segment population and
//! initial user-stack construction.

use core::fmt;

use crate::fs::directory::separate_path;
use crate::fs::file::File;
use crate::fs::FileSys;
use crate::memory::{is_user_vaddr, pg_round_up, PGSIZE, PHYS_BASE};
use crate::scheduler::process::push_arguments;
use crate::scheduler::task::Tid;
use crate::vm::page::{self, Role};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u32 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_SHLIB: u32 = 5;

const PF_W: u32 = 2;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const MAX_PHDRS: u16 = 1024;

// ══════════════════════════════════════════════════════════════
//  Headers
// ══════════════════════════════════════════════════════════════

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < EHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ExecError::UnsupportedArch);
        }
        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        let e_version = u32::from_le_bytes(data[20..24].try_into().unwrap());
        if e_type != ET_EXEC {
            return Err(ExecError::UnsupportedType);
        }
        if e_machine != EM_X86_64 {
            return Err(ExecError::UnsupportedArch);
        }
        if e_version != EV_CURRENT {
            return Err(ExecError::InvalidFormat);
        }
        let ehdr = Elf64Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        };
        if ehdr.e_phentsize as usize != PHDR_SIZE || ehdr.e_phnum > MAX_PHDRS {
            return Err(ExecError::InvalidFormat);
        }
        Ok(ehdr)
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < PHDR_SIZE {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }

    fn writable(&self) -> bool {
        self.p_flags & PF_W != 0
    }
}

/// Checks whether a PT_LOAD header describes a loadable segment.
fn validate_segment(phdr: &Elf64Phdr, file_len: u64) -> bool {
    // File offset and virtual address must be congruent modulo the page.
    if phdr.p_offset % PGSIZE != phdr.p_vaddr % PGSIZE {
        return false;
    }
    if phdr.p_offset > file_len {
        return false;
    }
    if phdr.p_memsz < phdr.p_filesz || phdr.p_memsz == 0 {
        return false;
    }
    // Entirely inside user space, no wraparound.
    let seg_end = match phdr.p_vaddr.checked_add(phdr.p_memsz) {
        Some(end) => end,
        None => return false,
    };
    if !is_user_vaddr(phdr.p_vaddr) || !is_user_vaddr(seg_end) {
        return false;
    }
    // Page 0 stays unmapped so user null pointers fault cleanly.
    if phdr.p_vaddr < PGSIZE {
        return false;
    }
    true
}

// ══════════════════════════════════════════════════════════════
//  ExecError
// ══════════════════════════════════════════════════════════════

#[derive(Debug)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    UnsupportedSegment,
    MemoryError,
    ReadError,
    ArgsTooLong,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "open failed"),
            ExecError::InvalidFormat => write!(f, "invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "unsupported ELF type (need ET_EXEC)"),
            ExecError::UnsupportedSegment => write!(f, "dynamic executables are not supported"),
            ExecError::MemoryError => write!(f, "out of memory"),
            ExecError::ReadError => write!(f, "file read error"),
            ExecError::ArgsTooLong => write!(f, "argument list does not fit on the stack"),
        }
    }
}

/// Entry point and initial stack pointer of a loaded program.
pub struct LoadedImage {
    pub entry: u64,
    pub user_rsp: u64,
}

// ══════════════════════════════════════════════════════════════
//  Loader
// ══════════════════════════════════════════════════════════════

/// Load the executable named by the first token of `cmdline` into the
/// current thread and build its argv stack. On success the thread owns a
/// populated address space and a deny-write handle on its executable.
pub fn load(cmdline: &str) -> Result<LoadedImage, ExecError> {
    let tid = crate::scheduler::current_tid();
    let path = crate::scheduler::process::first_token(cmdline);
    let fs = crate::fs::fs();

    // Fresh address space, active from here on so the kernel can populate
    // user pages through it.
    let pagedir = crate::memory::paging::create_user_pml4().ok_or(ExecError::MemoryError)?;
    crate::scheduler::with_current(|t| t.pagedir = Some(pagedir));
    unsafe { crate::memory::paging::activate(Some(pagedir)) };
    page::process_init(tid);

    let wd = crate::scheduler::with_current(|t| t.wd);
    let (dir_part, name) = separate_path(path).ok_or(ExecError::FileNotFound)?;
    let dir_sector = fs.parse(wd, dir_part).ok_or(ExecError::FileNotFound)?;
    let mut file = fs.open(dir_sector, name).ok_or(ExecError::FileNotFound)?;

    // Writes to a running executable are denied until process exit.
    fs.file_deny_write(&file);

    match load_image(fs, tid, &mut file, cmdline) {
        Ok(image) => {
            crate::scheduler::with_current(|t| t.exec_file = Some(file));
            Ok(image)
        }
        Err(err) => {
            fs.file_allow_write(&file);
            fs.file_close(file);
            Err(err)
        }
    }
}

fn load_image(
    fs: &FileSys,
    tid: Tid,
    file: &mut File,
    cmdline: &str,
) -> Result<LoadedImage, ExecError> {
    let file_len = fs.file_length(file) as u64;

    let mut ehdr_raw = [0u8; EHDR_SIZE];
    if fs.file_read_at(file, &mut ehdr_raw, 0) != EHDR_SIZE {
        return Err(ExecError::InvalidFormat);
    }
    let ehdr = Elf64Ehdr::parse(&ehdr_raw)?;

    crate::scheduler::with_current(|t| t.vma.loading_exe = true);

    for i in 0..ehdr.e_phnum as u64 {
        let off = ehdr.e_phoff + i * PHDR_SIZE as u64;
        if off + PHDR_SIZE as u64 > file_len {
            return Err(ExecError::InvalidFormat);
        }
        let mut phdr_raw = [0u8; PHDR_SIZE];
        if fs.file_read_at(file, &mut phdr_raw, off as u32) != PHDR_SIZE {
            return Err(ExecError::ReadError);
        }
        let phdr = Elf64Phdr::parse(&phdr_raw)?;
        match phdr.p_type {
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(ExecError::UnsupportedSegment),
            PT_LOAD => {
                if !validate_segment(&phdr, file_len) {
                    return Err(ExecError::InvalidFormat);
                }
                load_segment(fs, tid, file, &phdr)?;
            }
            _ => {}
        }
    }

    let user_rsp = setup_stack(tid, cmdline)?;
    crate::log_info!(
        "load: '{}' entry={:#x} rsp={:#x}",
        crate::scheduler::process::first_token(cmdline),
        ehdr.e_entry,
        user_rsp
    );
    Ok(LoadedImage {
        entry: ehdr.e_entry,
        user_rsp,
    })
}

/// Populate one PT_LOAD segment page by page: the first `p_filesz` bytes
/// come from the file, the rest of `p_memsz` is zero (BSS).
fn load_segment(
    fs: &FileSys,
    tid: Tid,
    file: &File,
    phdr: &Elf64Phdr,
) -> Result<(), ExecError> {
    let writable = phdr.writable();
    let role = if writable { Role::Data } else { Role::Code };

    let page_offset = phdr.p_vaddr % PGSIZE;
    let mut upage = phdr.p_vaddr - page_offset;
    let mut file_ofs = phdr.p_offset - page_offset;
    let mut read_left = page_offset + phdr.p_filesz;
    let mut total_left = pg_round_up(page_offset + phdr.p_memsz);

    // Track segment extents in the VMA while loading_exe is set.
    crate::scheduler::with_current(|t| {
        let (begin, end) = (upage, upage + total_left);
        if writable {
            if t.vma.data_begin == 0 || begin < t.vma.data_begin {
                t.vma.data_begin = begin;
            }
            if end > t.vma.data_end {
                t.vma.data_end = end;
            }
        } else {
            if t.vma.code_begin == 0 || begin < t.vma.code_begin {
                t.vma.code_begin = begin;
            }
            if end > t.vma.code_end {
                t.vma.code_end = end;
            }
        }
    });

    while total_left > 0 {
        let page_read = read_left.min(PGSIZE) as usize;

        if !page::install_new_page(tid, upage, role, writable, page::PageFlags::empty()) {
            return Err(ExecError::MemoryError);
        }
        if page_read > 0 {
            let frame = page::seek(tid, upage)
                .and_then(|n| n.frame)
                .ok_or(ExecError::MemoryError)?;
            let ok = crate::vm::frame::with_frame_slice(frame, |slice| {
                fs.file_read_at(file, &mut slice[..page_read], file_ofs as u32) == page_read
            });
            if !ok {
                return Err(ExecError::ReadError);
            }
        }

        upage += PGSIZE;
        file_ofs += PGSIZE;
        read_left = read_left.saturating_sub(PGSIZE);
        total_left -= PGSIZE;
    }
    Ok(())
}

/// Map the initial stack page just under PHYS_BASE and lay out argv on it.
fn setup_stack(tid: Tid, cmdline: &str) -> Result<u64, ExecError> {
    let stack_page = PHYS_BASE - PGSIZE;
    if !page::install_new_page(tid, stack_page, Role::Stack, true, page::PageFlags::empty()) {
        return Err(ExecError::MemoryError);
    }
    crate::scheduler::with_current(|t| {
        t.vma.stack_begin = stack_page;
        t.vma.stack_end = PHYS_BASE;
    });

    let frame = page::seek(tid, stack_page)
        .and_then(|n| n.frame)
        .ok_or(ExecError::MemoryError)?;
    crate::vm::frame::with_frame_slice(frame, |slice| {
        push_arguments(slice, PHYS_BASE, cmdline).ok_or(ExecError::ArgsTooLong)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_ehdr() -> [u8; EHDR_SIZE] {
        let mut raw = [0u8; EHDR_SIZE];
        raw[0..4].copy_from_slice(&ELF_MAGIC);
        raw[4] = ELFCLASS64;
        raw[5] = ELFDATA2LSB;
        raw[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        raw[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        raw[20..24].copy_from_slice(&EV_CURRENT.to_le_bytes());
        raw[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        raw[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        raw[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        raw[56..58].copy_from_slice(&1u16.to_le_bytes());
        raw
    }

    #[test]
    fn header_validation_accepts_wellformed() {
        let ehdr = Elf64Ehdr::parse(&valid_ehdr()).unwrap();
        assert_eq!(ehdr.e_entry, 0x40_1000);
        assert_eq!(ehdr.e_phnum, 1);
    }

    #[test]
    fn header_validation_rejects_wrong_class_type_machine() {
        let mut raw = valid_ehdr();
        raw[4] = 1; // ELFCLASS32
        assert!(matches!(
            Elf64Ehdr::parse(&raw),
            Err(ExecError::UnsupportedArch)
        ));

        let mut raw = valid_ehdr();
        raw[16] = 3; // ET_DYN
        assert!(matches!(
            Elf64Ehdr::parse(&raw),
            Err(ExecError::UnsupportedType)
        ));

        let mut raw = valid_ehdr();
        raw[18] = 0x03; // EM_386
        raw[19] = 0x00;
        assert!(matches!(
            Elf64Ehdr::parse(&raw),
            Err(ExecError::UnsupportedArch)
        ));

        let mut raw = valid_ehdr();
        raw[0] = 0;
        assert!(matches!(
            Elf64Ehdr::parse(&raw),
            Err(ExecError::InvalidFormat)
        ));
    }

    fn phdr(p_offset: u64, p_vaddr: u64, filesz: u64, memsz: u64) -> Elf64Phdr {
        Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: 0,
            p_offset,
            p_vaddr,
            p_filesz: filesz,
            p_memsz: memsz,
        }
    }

    #[test]
    fn segment_validation_rules() {
        // Congruent offsets, inside user space: fine.
        assert!(validate_segment(&phdr(0x1000, 0x40_1000, 100, 200), 0x10000));
        // Offset not congruent with vaddr.
        assert!(!validate_segment(&phdr(0x1001, 0x40_1000, 100, 200), 0x10000));
        // memsz smaller than filesz.
        assert!(!validate_segment(&phdr(0x1000, 0x40_1000, 300, 200), 0x10000));
        // Empty segment.
        assert!(!validate_segment(&phdr(0x1000, 0x40_1000, 0, 0), 0x10000));
        // Page 0 is off limits.
        assert!(!validate_segment(&phdr(0, 0, 100, 200), 0x10000));
        // Reaches into kernel space.
        assert!(!validate_segment(
            &phdr(0x1000, crate::memory::PHYS_BASE - 0x1000, 0x2000, 0x2000),
            0x10000
        ));
        // Offset past the end of the file.
        assert!(!validate_segment(&phdr(0x20000, 0x40_0000, 100, 200), 0x10000));
    }
}
