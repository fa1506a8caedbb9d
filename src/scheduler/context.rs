use core::arch::naked_asm;

/// Saved execution state of a suspended thread: nothing but its kernel
/// stack pointer. The callee-saved registers are parked on the thread's
/// own stack by `switch_stacks`, so the record stays a single word and a
/// switch is a symmetric exchange of stack pointers.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
}

impl Context {
    /// Placeholder for the boot thread; overwritten by the first switch
    /// away from it.
    pub const fn empty() -> Self {
        Context { rsp: 0 }
    }

    /// Fabricate the switch frame of a thread that has never run, so the
    /// first switch into it "returns" to `entry`. The frame mirrors what
    /// `switch_stacks` pops: six callee-saved registers under a return
    /// address, with r12/r13 smuggling the thread function and its
    /// argument into the entry trampoline.
    ///
    /// # Safety
    /// `stack_top` must be the top of a live, writable kernel stack with
    /// room for the seven-word frame.
    pub unsafe fn prime(stack_top: u64, entry: u64, r12: u64, r13: u64) -> Context {
        let top = stack_top & !0xF;
        let frame = [0u64, 0, r13, r12, 0, 0, entry]; // r15 r14 r13 r12 rbp rbx ret
        let mut sp = top;
        for &word in frame.iter().rev() {
            sp -= 8;
            (sp as *mut u64).write(word);
        }
        // ret will pop `entry` with rsp back at `top`, which is 16-byte
        // aligned; the trampoline's own call then establishes the usual
        // entry alignment.
        Context { rsp: sp }
    }
}

/// Suspend the running thread into `old` and resume `new`.
///
/// Callee-saved registers go onto the current stack, the stack pointer is
/// swapped through the two Context records, and the final `ret` continues
/// wherever `new` last suspended (or, for a primed frame, enters the
/// thread for the first time). A thread that is never switched back to
/// simply leaves its parked frame to be reclaimed with its stack, which
/// is why dying threads need no separate no-save variant.
///
/// # Safety
/// `old` must be writable and `new` must hold an rsp produced by a prior
/// switch or by `Context::prime`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_stacks(old: *mut Context, new: *const Context) {
    naked_asm!(
        // Park callee-saved state on the outgoing stack. The return
        // address of this very call sits just above, completing the
        // frame that a later switch will unwind.
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // The exchange itself: one store, one load.
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        // Unwind the incoming thread's parked frame and continue where
        // it left off.
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
    );
}
