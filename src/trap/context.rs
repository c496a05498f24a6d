//! x86-64 register view of a signal context.

use libc::{REG_RBP, REG_RIP, REG_RSP, greg_t, ucontext_t};

/// Width of a return address on the stack.
pub const WORD_SIZE: u64 = 8;

/// Instruction, frame and stack pointer of an interrupted thread.
///
/// Captured from the kernel-delivered `ucontext_t`; changes are written back
/// with [`RegisterContext::apply`] and take effect when the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterContext {
    instruction_pointer: u64,
    frame_pointer: u64,
    stack_pointer: u64,
}

impl RegisterContext {
    pub fn new(instruction_pointer: u64, frame_pointer: u64, stack_pointer: u64) -> Self {
        Self {
            instruction_pointer,
            frame_pointer,
            stack_pointer,
        }
    }

    pub fn capture(uc: &ucontext_t) -> Self {
        let gregs = &uc.uc_mcontext.gregs;
        Self {
            instruction_pointer: gregs[REG_RIP as usize] as u64,
            frame_pointer: gregs[REG_RBP as usize] as u64,
            stack_pointer: gregs[REG_RSP as usize] as u64,
        }
    }

    pub fn apply(&self, uc: &mut ucontext_t) {
        let gregs = &mut uc.uc_mcontext.gregs;
        gregs[REG_RIP as usize] = self.instruction_pointer as greg_t;
        gregs[REG_RBP as usize] = self.frame_pointer as greg_t;
        gregs[REG_RSP as usize] = self.stack_pointer as greg_t;
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.instruction_pointer
    }

    pub fn set_instruction_pointer(&mut self, value: u64) {
        self.instruction_pointer = value;
    }

    pub fn frame_pointer(&self) -> u64 {
        self.frame_pointer
    }

    pub fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    pub fn set_stack_pointer(&mut self, value: u64) {
        self.stack_pointer = value;
    }

    /// Reads the word at the top of the stack.
    ///
    /// # Safety
    ///
    /// The stack pointer must address readable memory, which holds whenever
    /// the context was delivered for a fault inside a called function.
    pub unsafe fn return_address(&self) -> u64 {
        unsafe { std::ptr::read(self.stack_pointer as *const u64) }
    }

    /// Drops the top word from the stack, as a `ret` would.
    pub fn pop_word(&mut self) {
        self.stack_pointer = self.stack_pointer.wrapping_add(WORD_SIZE);
    }
}
