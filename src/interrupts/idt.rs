use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::gdt;
use crate::{log_error, println};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Trap gate user programs enter the kernel through.
pub const SYSCALL_VECTOR: usize = 0x30;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()].set_handler_fn(keyboard_interrupt_handler);
        unsafe {
            idt[SYSCALL_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(
                    crate::interrupts::usermode::syscall_entry_asm as usize as u64,
                ))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

fn from_user(stack_frame: &InterruptStackFrame) -> bool {
    stack_frame.code_segment & 3 == 3
}

/// An exception raised by user code kills the process with status -1; one
/// raised by the kernel is a kernel bug.
fn kill_or_panic(stack_frame: InterruptStackFrame, which: &str) -> ! {
    if from_user(&stack_frame) {
        println!(
            "{}: dying due to exception ({}).",
            crate::scheduler::thread_name(),
            which
        );
        crate::scheduler::process::exit(-1);
    }
    log_error!("EXCEPTION: {} in kernel code", which);
    panic!("EXCEPTION: {}\n{:#?}", which, stack_frame);
}

macro_rules! user_fault_handler {
    ($name:ident, $label:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame) {
            kill_or_panic(stack_frame, $label);
        }
    };
}

macro_rules! user_fault_handler_with_code {
    ($name:ident, $label:expr) => {
        extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame, _error_code: u64) {
            kill_or_panic(stack_frame, $label);
        }
    };
}

user_fault_handler!(divide_error_handler, "#DE Divide Error");
user_fault_handler!(debug_handler, "#DB Debug Exception");
user_fault_handler!(overflow_handler, "#OF Overflow Exception");
user_fault_handler!(bound_range_handler, "#BR BOUND Range Exceeded");
user_fault_handler!(invalid_opcode_handler, "#UD Invalid Opcode");
user_fault_handler!(device_not_available_handler, "#NM Device Not Available");
user_fault_handler!(x87_floating_point_handler, "#MF x87 FPU Error");
user_fault_handler!(simd_floating_point_handler, "#XF SIMD FP Exception");
user_fault_handler_with_code!(segment_not_present_handler, "#NP Segment Not Present");
user_fault_handler_with_code!(stack_segment_handler, "#SS Stack Fault");
user_fault_handler_with_code!(general_protection_fault_handler, "#GP General Protection");

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    if from_user(&stack_frame) {
        kill_or_panic(stack_frame, "#BP Breakpoint");
    }
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    // CR2 must be read before interrupts come back on.
    let fault_addr = Cr2::read().as_u64();
    x86_64::instructions::interrupts::enable();

    let present = error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let user = error_code.contains(PageFaultErrorCode::USER_MODE);
    let user_rsp = stack_frame.stack_pointer.as_u64();

    match crate::vm::handle_page_fault(fault_addr, present, write, user, user_rsp) {
        crate::vm::FaultOutcome::Resolved => {}
        crate::vm::FaultOutcome::Kill => {
            crate::scheduler::process::exit(-1);
        }
        crate::vm::FaultOutcome::KernelBug => {
            log_error!(
                "Page fault at {:#x}: {} error {} page in {} context.",
                fault_addr,
                if present { "rights violation" } else { "not present" },
                if write { "writing" } else { "reading" },
                if user { "user" } else { "kernel" }
            );
            panic!("EXCEPTION: PAGE FAULT\n{:#?}", stack_frame);
        }
    }
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    super::enter_interrupt();
    let preempt = crate::drivers::timer::on_tick();
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
    super::leave_interrupt();
    if preempt {
        crate::scheduler::try_yield_from_interrupt();
    }
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;

    super::enter_interrupt();
    let mut port: Port<u8> = Port::new(0x60);
    let scancode = unsafe { port.read() };
    crate::drivers::kbd::push_scancode(scancode);
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
    super::leave_interrupt();
}
