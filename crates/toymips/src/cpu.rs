use crate::bus::Bus;
use codecache::{InstructionClass, Step};

/// Where interrupts transfer control to.
pub const INTERRUPT_VECTOR: u32 = 0x0000_0080;

/// Why the machine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Syscall,
    Break,
    ReservedInstruction { pc: u32, bits: u32 },
    AddressError { pc: u32, addr: u32 },
    BusError { pc: u32, addr: u32 },
}

/// Register file and control state.
#[derive(Debug, Clone, Default)]
pub struct Cpu {
    pub regs: [u32; 32],
    pub pc: u32,
    pub next_pc: u32,
    pub user_mode: bool,
    /// Return address of the last interrupt.
    pub epc: u32,
    pub pending_interrupt: bool,
    pub halt: Option<Halt>,
    /// Number of instructions executed.
    pub retired: u64,
}

#[inline(always)]
fn op(bits: u32) -> u32 {
    bits >> 26
}

#[inline(always)]
fn funct(bits: u32) -> u32 {
    bits & 0x3F
}

#[inline(always)]
fn rs(bits: u32) -> usize {
    ((bits >> 21) & 31) as usize
}

#[inline(always)]
fn rt(bits: u32) -> usize {
    ((bits >> 16) & 31) as usize
}

#[inline(always)]
fn rd(bits: u32) -> usize {
    ((bits >> 11) & 31) as usize
}

#[inline(always)]
fn shamt(bits: u32) -> u32 {
    (bits >> 6) & 31
}

#[inline(always)]
fn imm(bits: u32) -> u32 {
    bits & 0xFFFF
}

#[inline(always)]
fn simm(bits: u32) -> u32 {
    i32::from(bits as u16 as i16) as u32
}

/// Classifies an instruction word. Unknown encodings always trap.
pub fn classify(bits: u32) -> InstructionClass {
    let plain = InstructionClass::default();
    let branch = InstructionClass {
        is_branch: true,
        ..plain
    };
    let exit = InstructionClass {
        can_trap: true,
        is_exit: true,
        ..plain
    };

    match op(bits) {
        0x00 => match funct(bits) {
            0x00 | 0x21 | 0x23 | 0x24 | 0x25 | 0x2A | 0x2B => plain,
            0x08 | 0x09 => branch,
            _ => exit,
        },
        0x02..=0x05 => branch,
        0x09 | 0x0A | 0x0C | 0x0D | 0x0F => plain,
        0x23 => InstructionClass {
            is_load: true,
            has_load_delay: true,
            can_trap: true,
            ..plain
        },
        0x2B => InstructionClass {
            is_store: true,
            can_trap: true,
            ..plain
        },
        _ => exit,
    }
}

impl Cpu {
    pub fn reset(&mut self, entry: u32) {
        *self = Self {
            pc: entry,
            next_pc: entry.wrapping_add(4),
            ..Self::default()
        };
    }

    #[inline(always)]
    fn set(&mut self, reg: usize, value: u32) {
        if reg != 0 {
            self.regs[reg] = value;
        }
    }

    fn halt(&mut self, pc: u32, halt: Halt) -> Step {
        tracing::debug!("halted at {pc:08X}: {halt:?}");
        self.pc = pc;
        self.next_pc = pc.wrapping_add(4);
        self.halt = Some(halt);

        Step::Exception
    }

    /// Enters the interrupt handler.
    pub fn interrupt(&mut self) {
        self.epc = self.pc;
        self.pc = INTERRUPT_VECTOR;
        self.next_pc = INTERRUPT_VECTOR + 4;
        self.user_mode = false;
        self.pending_interrupt = false;
    }

    /// Executes `bits` as the instruction at the current program counter.
    ///
    /// Loads complete immediately: the load delay slot is reported to the cache but not
    /// emulated.
    pub fn step(&mut self, bus: &mut Bus, bits: u32) -> Step {
        let pc = self.pc;
        self.pc = self.next_pc;
        self.next_pc = self.pc.wrapping_add(4);
        self.retired += 1;

        let s = self.regs[rs(bits)];
        let t = self.regs[rt(bits)];
        let branch_base = pc.wrapping_add(4);
        let branch_target = branch_base.wrapping_add(simm(bits) << 2);

        match op(bits) {
            0x00 => match funct(bits) {
                0x00 => self.set(rd(bits), t << shamt(bits)),
                0x08 => self.next_pc = s,
                0x09 => {
                    self.set(rd(bits), pc.wrapping_add(8));
                    self.next_pc = s;
                }
                0x0C => return self.halt(pc, Halt::Syscall),
                0x0D => return self.halt(pc, Halt::Break),
                0x21 => self.set(rd(bits), s.wrapping_add(t)),
                0x23 => self.set(rd(bits), s.wrapping_sub(t)),
                0x24 => self.set(rd(bits), s & t),
                0x25 => self.set(rd(bits), s | t),
                0x2A => self.set(rd(bits), u32::from((s as i32) < (t as i32))),
                0x2B => self.set(rd(bits), u32::from(s < t)),
                _ => return self.halt(pc, Halt::ReservedInstruction { pc, bits }),
            },
            0x02 => self.next_pc = (branch_base & 0xF000_0000) | ((bits & 0x03FF_FFFF) << 2),
            0x03 => {
                self.set(31, pc.wrapping_add(8));
                self.next_pc = (branch_base & 0xF000_0000) | ((bits & 0x03FF_FFFF) << 2);
            }
            0x04 => {
                if s == t {
                    self.next_pc = branch_target;
                }
            }
            0x05 => {
                if s != t {
                    self.next_pc = branch_target;
                }
            }
            0x09 => self.set(rt(bits), s.wrapping_add(simm(bits))),
            0x0A => self.set(rt(bits), u32::from((s as i32) < (simm(bits) as i32))),
            0x0C => self.set(rt(bits), s & imm(bits)),
            0x0D => self.set(rt(bits), s | imm(bits)),
            0x0F => self.set(rt(bits), imm(bits) << 16),
            0x23 => {
                let addr = s.wrapping_add(simm(bits));
                if !addr.is_multiple_of(4) {
                    return self.halt(pc, Halt::AddressError { pc, addr });
                }

                let Some(value) = bus.read(addr) else {
                    return self.halt(pc, Halt::BusError { pc, addr });
                };

                self.set(rt(bits), value);
            }
            0x2B => {
                let addr = s.wrapping_add(simm(bits));
                if !addr.is_multiple_of(4) {
                    return self.halt(pc, Halt::AddressError { pc, addr });
                }

                if bus.write(addr, t).is_none() {
                    return self.halt(pc, Halt::BusError { pc, addr });
                }
            }
            _ => return self.halt(pc, Halt::ReservedInstruction { pc, bits }),
        }

        Step::Continue
    }
}
