use crate::CachedInstruction;
use std::ops::Range;

/// Properties of a guest instruction that shape a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionClass {
    pub is_branch: bool,
    pub is_load: bool,
    pub is_store: bool,
    /// The result of the instruction is not visible to the following instruction.
    pub has_load_delay: bool,
    pub can_trap: bool,
    /// Control never falls through to the next instruction (syscalls, breakpoints, invalid
    /// instructions).
    pub is_exit: bool,
}

/// Outcome of interpreting a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The instruction raised an exception and control was redirected. The rest of the block
    /// must not execute.
    Exception,
}

/// The emulated machine the cache runs code for.
///
/// Implementations own the CPU state and the memory bus. Stores that land on a tracked code
/// page must be queued and handed back through [`Guest::drain_code_writes`]; the cache does not
/// observe memory writes on its own.
pub trait Guest {
    /// Address of the next instruction to execute.
    fn pc(&self) -> u32;
    fn in_user_mode(&self) -> bool;

    /// Whether the current execution slice is over.
    fn timeslice_expired(&self) -> bool;
    fn has_pending_interrupt(&self) -> bool;
    /// Redirects execution to the interrupt handler.
    fn dispatch_interrupt(&mut self);

    /// Reads an instruction word without side effects.
    fn fetch_instruction(&mut self, addr: u32) -> Option<u32>;
    /// Called when an instruction fetch during execution fails. The guest raises its bus error
    /// exception here.
    fn instruction_fetch_failed(&mut self, addr: u32);
    fn classify(&self, bits: u32, user_mode: bool) -> InstructionClass;
    /// Executes the instruction at the current program counter.
    fn interpret(&mut self, instruction: &CachedInstruction) -> Step;

    /// Starts or stops tracking writes to a RAM code page.
    fn set_code_page(&mut self, page: u32, tracked: bool);
    /// Stops tracking writes to every RAM code page.
    fn clear_code_pages(&mut self);
    /// Moves the indices of code pages written since the last call into `pages`.
    fn drain_code_writes(&mut self, pages: &mut Vec<u32>);

    /// Enables or disables direct host access to guest RAM. Returns whether the request was
    /// honored.
    fn set_fastmem_enabled(&mut self, enabled: bool) -> bool {
        _ = enabled;
        false
    }

    /// Host address range backing guest RAM while fastmem is enabled.
    fn fastmem_view(&self) -> Option<Range<usize>> {
        None
    }
}
