//! A tiny MIPS flavoured machine.
//!
//! Just enough of a guest to drive a [`codecache::CodeCache`]: a handful of integer
//! instructions with branch delay slots, RAM with write tracking over code pages, a read only
//! boot ROM and a scratchpad that is never cached.
pub mod asm;
pub mod bus;
pub mod cpu;
pub mod recompiler;

use bus::Bus;
use codecache::{CachedInstruction, Guest, InstructionClass, MemoryMap, Step};
use cpu::Cpu;
use easyerr::Error;
use std::ops::Range;

pub use cpu::Halt;
pub use recompiler::ThreadedRecompiler;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot load program word at {addr:08X}")]
    Unmapped { addr: u32 },
}

/// CPU and memory of the toy machine.
pub struct Machine {
    pub cpu: Cpu,
    pub bus: Bus,
    /// Instructions to execute before the timeslice expires.
    pub budget: u64,
}

impl Machine {
    pub fn new(map: MemoryMap) -> Self {
        Self {
            cpu: Cpu::default(),
            bus: Bus::new(map),
            budget: u64::MAX,
        }
    }

    /// Writes a program to memory, one word after the other.
    pub fn load(&mut self, addr: u32, words: &[u32]) -> Result<(), LoadError> {
        for (i, word) in words.iter().enumerate() {
            let addr = addr.wrapping_add(4 * i as u32);
            self.bus
                .poke(addr, *word)
                .ok_or(LoadError::Unmapped { addr })?;
        }

        Ok(())
    }

    /// Resets the CPU to start executing at `entry`.
    pub fn reset(&mut self, entry: u32) {
        self.cpu.reset(entry);
    }

    /// Allows the machine to run `count` more instructions.
    pub fn extend_budget(&mut self, count: u64) {
        self.budget = self.cpu.retired.saturating_add(count);
    }

    #[inline(always)]
    pub fn halted(&self) -> Option<Halt> {
        self.cpu.halt
    }

    #[inline(always)]
    pub fn reg(&self, reg: u8) -> u32 {
        self.cpu.regs[reg as usize]
    }
}

impl Guest for Machine {
    #[inline(always)]
    fn pc(&self) -> u32 {
        self.cpu.pc
    }

    #[inline(always)]
    fn in_user_mode(&self) -> bool {
        self.cpu.user_mode
    }

    #[inline(always)]
    fn timeslice_expired(&self) -> bool {
        self.cpu.halt.is_some() || self.cpu.retired >= self.budget
    }

    #[inline(always)]
    fn has_pending_interrupt(&self) -> bool {
        self.cpu.pending_interrupt && self.cpu.halt.is_none()
    }

    fn dispatch_interrupt(&mut self) {
        tracing::debug!("dispatching interrupt at {:08X}", self.cpu.pc);
        self.cpu.interrupt();
    }

    #[inline(always)]
    fn fetch_instruction(&mut self, addr: u32) -> Option<u32> {
        self.bus.read(addr)
    }

    fn instruction_fetch_failed(&mut self, addr: u32) {
        self.cpu.halt = Some(Halt::BusError { pc: addr, addr });
    }

    #[inline(always)]
    fn classify(&self, bits: u32, _user_mode: bool) -> InstructionClass {
        cpu::classify(bits)
    }

    #[inline(always)]
    fn interpret(&mut self, instruction: &CachedInstruction) -> Step {
        debug_assert_eq!(self.cpu.pc, instruction.pc);
        self.cpu.step(&mut self.bus, instruction.bits)
    }

    fn set_code_page(&mut self, page: u32, tracked: bool) {
        self.bus.set_code_page(page, tracked);
    }

    fn clear_code_pages(&mut self) {
        self.bus.clear_code_pages();
    }

    fn drain_code_writes(&mut self, pages: &mut Vec<u32>) {
        self.bus.drain_code_writes(pages);
    }

    fn set_fastmem_enabled(&mut self, enabled: bool) -> bool {
        self.bus.set_fastmem(enabled);
        true
    }

    fn fastmem_view(&self) -> Option<Range<usize>> {
        self.bus.fastmem_view()
    }
}
