//! User-process lifecycle: exec, wait and exit, plus the argv layout pushed
//! onto a fresh user stack.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::sync::Semaphore;
use super::task::{Tid, PRI_DEFAULT};

pub const MAX_CMDLINE_LENGTH: usize = 128;
pub const MAX_CMDLINE_TOKENS: usize = 32;

/// Set by a child whose executable failed to load, read (and cleared) by
/// the parent blocked in exec.
static LOAD_FAILED: Mutex<bool> = Mutex::new(false);

/// First whitespace-separated token of a command line: the program path.
pub fn first_token(cmdline: &str) -> &str {
    cmdline.split_whitespace().next().unwrap_or("")
}

/// Spawn a thread that will load and run the user program named by the
/// first token of `cmdline`. Returns the child tid; the load outcome is
/// reported separately through the exec semaphore.
pub fn execute(cmdline: &str) -> Option<Tid> {
    if cmdline.len() >= MAX_CMDLINE_LENGTH || first_token(cmdline).is_empty() {
        return None;
    }
    let boxed = Box::new(String::from(cmdline));
    let name = first_token(cmdline);
    let aux = Box::into_raw(boxed) as u64;
    let tid = super::spawn(name, PRI_DEFAULT, start_process, aux);
    if tid.is_none() {
        // The thread never existed, so reclaim the command line ourselves.
        unsafe { drop(Box::from_raw(aux as *mut String)) };
    }
    tid
}

/// exec syscall semantics: spawn, then block until the child has tried to
/// load. Returns the child tid, or -1 when spawning or loading failed.
pub fn execute_and_wait_load(cmdline: &str) -> i32 {
    let tid = match execute(cmdline) {
        Some(tid) => tid,
        None => return -1,
    };
    let sema = super::with_current(|t| t.exec_sema.clone());
    sema.down();

    let failed = {
        let mut flag = LOAD_FAILED.lock();
        core::mem::replace(&mut *flag, false)
    };
    if failed {
        -1
    } else {
        tid.0 as i32
    }
}

/// Body of a freshly spawned process thread: load the executable and drop
/// to ring 3, or report failure and die.
fn start_process(aux: u64) {
    let cmdline = unsafe { *Box::from_raw(aux as *mut String) };

    match crate::loader::elf::load(&cmdline) {
        Ok(image) => {
            super::with_current(|t| t.vma.loading_exe = false);
            if let Some(sema) = parent_exec_sema() {
                sema.up();
            }
            unsafe { crate::interrupts::usermode::jump_to_usermode(image.entry, image.user_rsp) }
        }
        Err(err) => {
            crate::log_warn!("load: {}: {}", first_token(&cmdline), err);
            *LOAD_FAILED.lock() = true;
            if let Some(sema) = parent_exec_sema() {
                sema.up();
            }
            exit(-1);
        }
    }
}

fn parent_exec_sema() -> Option<Semaphore> {
    let node = super::with_current(|t| t.wait_node.clone())?.upgrade()?;
    super::with_thread(node.parent_tid, |p| p.exec_sema.clone())
}

/// Wait for a direct child to exit and collect its status. Returns -1 for
/// unknown children and for repeated waits on the same child.
pub fn wait(child: Tid) -> i32 {
    let node = super::with_current(|t| {
        t.children
            .iter()
            .find(|n| n.child_tid == child)
            .map(Arc::clone)
    });
    let node = match node {
        Some(node) => node,
        None => return -1,
    };
    if !node.claim_wait() {
        return -1;
    }
    node.sema.down();
    node.status()
}

/// Terminate the current process: release every owned resource, report the
/// status to the parent and die. Also the path the trap layer takes to kill
/// a faulting process (status -1).
pub fn exit(status: i32) -> ! {
    let cur = super::current_tid();
    let name = super::thread_name();

    // Announce while the console still knows who we are.
    crate::println!("{}: exit({})", name, status);

    // Push cached file-system state to disk, then drop mmap regions (which
    // writes their dirty pages), the supplemental page table, and frames.
    crate::fs::fs().writeback_all();
    crate::vm::page::mmap_unmap_all(cur);
    crate::vm::page::destroy_pagelist(cur);

    // Close the descriptor table.
    let nodes = super::with_current(|t| t.fd_table.take_all());
    for node in nodes {
        crate::fs::close_shared(crate::fs::fs(), node.file);
    }

    // Re-allow writes to the executable and drop our handle on it.
    if let Some(file) = super::with_current(|t| t.exec_file.take()) {
        let fs = crate::fs::fs();
        fs.file_allow_write(&file);
        fs.file_close(file);
    }

    // Tear down the address space. Activate the kernel tables first so a
    // timer tick can never walk freed page tables.
    if let Some(pagedir) = super::with_current(|t| t.pagedir.take()) {
        unsafe { crate::memory::paging::activate(None) };
        crate::memory::paging::destroy_user_pml4(pagedir);
    }

    // Report to the parent last; it may run the moment we up the semaphore.
    if let Some(node) = super::with_current(|t| t.wait_node.clone()).and_then(|w| w.upgrade()) {
        node.set_status(status);
        node.sema.up();
    }

    super::exit_thread();
}

/// Lay out program arguments on a fresh user stack image.
///
/// `stack` is the memory backing `[stack_top_vaddr - stack.len(),
/// stack_top_vaddr)`. Pushes the token strings, a word-aligned argv array
/// with NULL terminator, argv, argc and a fake return address. Returns the
/// new stack pointer, or None if the arguments do not fit.
pub fn push_arguments(stack: &mut [u8], stack_top_vaddr: u64, cmdline: &str) -> Option<u64> {
    let base = stack_top_vaddr - stack.len() as u64;
    let mut sp = stack_top_vaddr;

    let mut write_u64 = |stack: &mut [u8], at: u64, value: u64| -> Option<()> {
        if at < base || at + 8 > stack_top_vaddr {
            return None;
        }
        let off = (at - base) as usize;
        stack[off..off + 8].copy_from_slice(&value.to_le_bytes());
        Some(())
    };

    // String bodies, left to right. Order does not matter, only the
    // pointers collected along the way do.
    let mut argv_addrs: Vec<u64> = Vec::new();
    for token in cmdline.split_whitespace() {
        if argv_addrs.len() >= MAX_CMDLINE_TOKENS {
            return None;
        }
        let bytes = token.as_bytes();
        sp = sp.checked_sub(bytes.len() as u64 + 1)?;
        if sp < base {
            return None;
        }
        let off = (sp - base) as usize;
        stack[off..off + bytes.len()].copy_from_slice(bytes);
        stack[off + bytes.len()] = 0;
        argv_addrs.push(sp);
    }
    let argc = argv_addrs.len() as u64;

    // Word alignment, then argv[argc] = NULL and the pointers, right to
    // left, then argv, argc and a fake return address.
    sp &= !7;
    sp -= 8;
    write_u64(stack, sp, 0)?;
    for &addr in argv_addrs.iter().rev() {
        sp -= 8;
        write_u64(stack, sp, addr)?;
    }
    let argv = sp;
    sp -= 8;
    write_u64(stack, sp, argv)?;
    sp -= 8;
    write_u64(stack, sp, argc)?;
    sp -= 8;
    write_u64(stack, sp, 0)?;
    Some(sp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u64(stack: &[u8], base: u64, at: u64) -> u64 {
        let off = (at - base) as usize;
        u64::from_le_bytes(stack[off..off + 8].try_into().unwrap())
    }

    fn read_cstr(stack: &[u8], base: u64, at: u64) -> String {
        let off = (at - base) as usize;
        let end = stack[off..].iter().position(|&b| b == 0).unwrap() + off;
        String::from_utf8(stack[off..end].to_vec()).unwrap()
    }

    #[test]
    fn argv_layout_round_trips() {
        let top = 0xC000_0000u64;
        let mut stack = alloc::vec![0u8; 4096];
        let base = top - stack.len() as u64;

        let sp = push_arguments(&mut stack, top, "echo one two").unwrap();
        assert_eq!(sp % 8, 0);

        // [sp] fake return address, [sp+8] argc, [sp+16] argv.
        assert_eq!(read_u64(&stack, base, sp), 0);
        let argc = read_u64(&stack, base, sp + 8);
        assert_eq!(argc, 3);
        let argv = read_u64(&stack, base, sp + 16);
        assert_eq!(argv, sp + 24);

        let a0 = read_u64(&stack, base, argv);
        let a1 = read_u64(&stack, base, argv + 8);
        let a2 = read_u64(&stack, base, argv + 16);
        let nul = read_u64(&stack, base, argv + 24);
        assert_eq!(read_cstr(&stack, base, a0), "echo");
        assert_eq!(read_cstr(&stack, base, a1), "one");
        assert_eq!(read_cstr(&stack, base, a2), "two");
        assert_eq!(nul, 0);
    }

    #[test]
    fn empty_cmdline_has_zero_argc() {
        let top = 0x1000u64;
        let mut stack = alloc::vec![0u8; 512];
        let sp = push_arguments(&mut stack, top, "").unwrap();
        let base = top - 512;
        assert_eq!(read_u64(&stack, base, sp + 8), 0);
    }

    #[test]
    fn oversized_arguments_are_rejected() {
        let top = 0x1000u64;
        let mut stack = alloc::vec![0u8; 64];
        assert!(push_arguments(&mut stack, top, "prog with far too many bytes of argument data to fit").is_none());

        let mut big = String::new();
        for i in 0..(MAX_CMDLINE_TOKENS + 1) {
            big.push_str(" t");
            big.push_str(&i.to_string());
        }
        let mut stack = alloc::vec![0u8; 4096];
        assert!(push_arguments(&mut stack, top, &big).is_none());
    }

    #[test]
    fn first_token_extraction() {
        assert_eq!(first_token("prog a b"), "prog");
        assert_eq!(first_token("   prog"), "prog");
        assert_eq!(first_token(""), "");
    }
}
