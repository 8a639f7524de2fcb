//! Encoders for the supported instructions.

pub mod reg {
    pub const ZERO: u8 = 0;
    pub const AT: u8 = 1;
    pub const V0: u8 = 2;
    pub const V1: u8 = 3;
    pub const A0: u8 = 4;
    pub const A1: u8 = 5;
    pub const T0: u8 = 8;
    pub const T1: u8 = 9;
    pub const T2: u8 = 10;
    pub const S0: u8 = 16;
    pub const SP: u8 = 29;
    pub const RA: u8 = 31;
}

#[inline(always)]
fn r_type(rs: u8, rt: u8, rd: u8, shamt: u8, funct: u32) -> u32 {
    (u32::from(rs & 31) << 21)
        | (u32::from(rt & 31) << 16)
        | (u32::from(rd & 31) << 11)
        | (u32::from(shamt & 31) << 6)
        | funct
}

#[inline(always)]
fn i_type(op: u32, rs: u8, rt: u8, imm: u16) -> u32 {
    (op << 26) | (u32::from(rs & 31) << 21) | (u32::from(rt & 31) << 16) | u32::from(imm)
}

pub fn nop() -> u32 {
    0
}

pub fn sll(rd: u8, rt: u8, shamt: u8) -> u32 {
    r_type(0, rt, rd, shamt, 0x00)
}

pub fn jr(rs: u8) -> u32 {
    r_type(rs, 0, 0, 0, 0x08)
}

pub fn jalr(rd: u8, rs: u8) -> u32 {
    r_type(rs, 0, rd, 0, 0x09)
}

pub fn syscall() -> u32 {
    0x0C
}

pub fn brk() -> u32 {
    0x0D
}

pub fn addu(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x21)
}

pub fn subu(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x23)
}

pub fn and(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x24)
}

pub fn or(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x25)
}

pub fn slt(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x2A)
}

pub fn sltu(rd: u8, rs: u8, rt: u8) -> u32 {
    r_type(rs, rt, rd, 0, 0x2B)
}

/// Absolute jump within the current 256 MiB segment.
pub fn j(target: u32) -> u32 {
    (0x02 << 26) | ((target >> 2) & 0x03FF_FFFF)
}

pub fn jal(target: u32) -> u32 {
    (0x03 << 26) | ((target >> 2) & 0x03FF_FFFF)
}

/// `offset` is in instructions, relative to the delay slot.
pub fn beq(rs: u8, rt: u8, offset: i16) -> u32 {
    i_type(0x04, rs, rt, offset as u16)
}

/// `offset` is in instructions, relative to the delay slot.
pub fn bne(rs: u8, rt: u8, offset: i16) -> u32 {
    i_type(0x05, rs, rt, offset as u16)
}

pub fn addiu(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x09, rs, rt, imm as u16)
}

pub fn slti(rt: u8, rs: u8, imm: i16) -> u32 {
    i_type(0x0A, rs, rt, imm as u16)
}

pub fn andi(rt: u8, rs: u8, imm: u16) -> u32 {
    i_type(0x0C, rs, rt, imm)
}

pub fn ori(rt: u8, rs: u8, imm: u16) -> u32 {
    i_type(0x0D, rs, rt, imm)
}

pub fn lui(rt: u8, imm: u16) -> u32 {
    i_type(0x0F, 0, rt, imm)
}

pub fn lw(rt: u8, offset: i16, base: u8) -> u32 {
    i_type(0x23, base, rt, offset as u16)
}

pub fn sw(rt: u8, offset: i16, base: u8) -> u32 {
    i_type(0x2B, base, rt, offset as u16)
}

/// Loads a full word into a register.
pub fn li(rt: u8, value: u32) -> [u32; 2] {
    [lui(rt, (value >> 16) as u16), ori(rt, rt, value as u16)]
}
