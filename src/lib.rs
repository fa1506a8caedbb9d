//! ferrite_os: a teaching-grade x86_64 kernel. Priority/MLFQS scheduling
//! with donation, lazily populated virtual memory with mmap, an inode file
//! system behind a write-back buffer cache, and an int 0x30 syscall layer.

#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

extern crate alloc;

pub mod boot;
pub mod drivers;
pub mod fs;
pub mod interrupts;
pub mod loader;
pub mod memory;
pub mod scheduler;
pub mod syscalls;
pub mod vga;
pub mod serial;
pub mod vm;

#[cfg(not(test))]
use core::panic::PanicInfo;

/// Kernel entry point. The boot stub hands over the Multiboot2 info
/// pointer after switching to long mode with the physical linear map in
/// place.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    vga::init();
    serial::init();
    interrupts::init();
    log_info!("ferrite_os kernel started.");

    // GRUB hands over a physical pointer; reach the info area through the
    // kernel's linear map.
    let boot_info = unsafe {
        multiboot2::BootInformation::load(
            memory::phys_to_virt(multiboot_info_addr as u64) as *const _
        )
        .expect("Failed to load Multiboot2 info")
    };
    memory::init(&boot_info);

    let cmdline = boot_info
        .command_line_tag()
        .and_then(|tag| tag.cmdline().ok())
        .unwrap_or("");
    println!("Kernel command line: {}", cmdline);
    let config = boot::parse(cmdline);
    if let Some(seed) = config.random_seed {
        log_info!("Random seed set to {} (consumed by the test harness).", seed);
    }
    drivers::shutdown::configure(config.shutdown);
    if config.print_usage {
        boot::usage();
    }

    scheduler::init(config.mlfqs);
    drivers::timer::init();
    syscalls::init();
    scheduler::start();

    drivers::init();
    boot::assign_block_roles(&config);
    fs::init(config.format_filesys);
    vm::init(config.user_page_limit);
    println!("Boot complete.");

    boot::run_actions(&config);

    fs::fs().done();
    scheduler::print_stats();
    drivers::shutdown::shutdown()
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    println!("Kernel PANIC: {}", info);
    log_error!("{}", info);
    drivers::shutdown::on_panic()
}
