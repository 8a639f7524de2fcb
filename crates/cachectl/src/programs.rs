use clap::ValueEnum;
use toymips::asm::{self, reg};

/// Where the boot ROM is visible through the uncached segment.
const BOOT_ROM: u32 = 0xBFC0_0000;

/// A program along with where it starts executing.
pub struct Program {
    pub entry: u32,
    pub segments: Vec<(u32, Vec<u32>)>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Demo {
    /// Boots from ROM, then sums the numbers from 1 to 100 into v0.
    Loop,
    /// Calls a routine, overwrites its first instruction and calls it again.
    Selfmod,
}

impl Demo {
    pub fn program(self) -> Program {
        match self {
            Self::Loop => sum_loop(),
            Self::Selfmod => self_modifying(),
        }
    }
}

fn boot_stub(target: u32) -> Vec<u32> {
    let mut code = asm::li(reg::T2, target).to_vec();
    code.extend([asm::jr(reg::T2), asm::nop()]);
    code
}

fn sum_loop() -> Program {
    let main = vec![
        asm::addiu(reg::T1, reg::ZERO, 100),
        asm::addiu(reg::T0, reg::T0, 1),
        asm::addu(reg::V0, reg::V0, reg::T0),
        asm::bne(reg::T0, reg::T1, -3),
        asm::nop(),
        asm::syscall(),
    ];

    Program {
        entry: BOOT_ROM,
        segments: vec![(BOOT_ROM, boot_stub(0x8000_1000)), (0x8000_1000, main)],
    }
}

fn self_modifying() -> Program {
    let mut main = vec![asm::jal(0x8000_2000), asm::nop()];
    main.extend(asm::li(reg::A1, asm::addiu(reg::V0, reg::ZERO, 2)));
    main.extend(asm::li(reg::A0, 0x8000_2000));
    main.extend([
        asm::sw(reg::A1, 0, reg::A0),
        asm::jal(0x8000_2000),
        asm::nop(),
        asm::syscall(),
    ]);

    let routine = vec![
        asm::addiu(reg::V0, reg::ZERO, 1),
        asm::addu(reg::V1, reg::V1, reg::V0),
        asm::jr(reg::RA),
        asm::nop(),
    ];

    Program {
        entry: 0x8000_1000,
        segments: vec![(0x8000_1000, main), (0x8000_2000, routine)],
    }
}
