use crate::MemoryMap;

/// Identity of a block: the guest address it starts at and the privilege mode it was entered in.
///
/// Packed into a single word: bit 0 is the user mode flag and bits 2..32 hold the word-aligned
/// program counter. Ordering and hashing follow the packed value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey(u32);

impl BlockKey {
    const USER_MODE: u32 = 1;
    const PC_MASK: u32 = !0b11;

    #[inline(always)]
    pub fn new(user_mode: bool, pc: u32) -> Self {
        debug_assert!(pc.is_multiple_of(4), "block pc {pc:08X} is not word aligned");
        Self((pc & Self::PC_MASK) | u32::from(user_mode))
    }

    #[inline(always)]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits & (Self::PC_MASK | Self::USER_MODE))
    }

    #[inline(always)]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub fn pc(self) -> u32 {
        self.0 & Self::PC_MASK
    }

    #[inline(always)]
    pub fn user_mode(self) -> bool {
        self.0 & Self::USER_MODE != 0
    }

    /// The start address with the segment bits removed.
    #[inline(always)]
    pub fn physical_pc(self, map: &MemoryMap) -> u32 {
        map.physical(self.pc())
    }
}

impl std::fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockKey({self})")
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.user_mode() { "user" } else { "kernel" };
        write!(f, "{mode}:{:08X}", self.pc())
    }
}
