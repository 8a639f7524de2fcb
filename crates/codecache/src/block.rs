use crate::{BlockKey, InstructionClass, MemoryMap};
use std::ops::RangeInclusive;

slotmap::new_key_type! {
    /// Handle to a block owned by a [`CodeCache`](crate::CodeCache). Handles of removed blocks
    /// never alias newer ones.
    pub struct BlockId;
}

/// A decoded guest instruction, as recorded when the block was compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedInstruction {
    pub bits: u32,
    pub pc: u32,
    pub is_branch: bool,
    pub is_branch_delay_slot: bool,
    pub is_load: bool,
    pub is_store: bool,
    pub is_load_delay_slot: bool,
    pub is_last: bool,
    pub has_load_delay: bool,
    pub can_trap: bool,
}

impl CachedInstruction {
    #[inline(always)]
    pub fn is_loadstore(&self) -> bool {
        self.is_load || self.is_store
    }
}

/// Native code emitted for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCode {
    pub addr: usize,
    pub len: usize,
}

impl HostCode {
    #[inline(always)]
    pub fn contains(&self, host_pc: usize) -> bool {
        (self.addr..self.addr + self.len).contains(&host_pc)
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.addr + self.len
    }
}

/// A memory access site in host code that may need to be rewritten to its slow path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpatchInfo {
    pub host_pc: usize,
    pub guest_pc: u32,
    pub is_store: bool,
}

/// A straight-line run of guest instructions.
#[derive(Debug, Clone)]
pub struct Block {
    pub key: BlockKey,
    pub instructions: Vec<CachedInstruction>,
    pub host_code: Option<HostCode>,
    /// Blocks that transfer control directly into this one.
    pub link_predecessors: Vec<BlockId>,
    /// Blocks this one transfers control directly to.
    pub link_successors: Vec<BlockId>,
    pub backpatch: Vec<BackpatchInfo>,
    pub contains_loadstore_instructions: bool,
    /// Set when guest code in the block's pages was overwritten. The block stays in the cache
    /// so that it can be revalidated.
    pub invalidated: bool,
}

impl Block {
    pub fn new(key: BlockKey) -> Self {
        Self {
            key,
            instructions: Vec::new(),
            host_code: None,
            link_predecessors: Vec::new(),
            link_successors: Vec::new(),
            backpatch: Vec::new(),
            contains_loadstore_instructions: false,
            invalidated: false,
        }
    }

    #[inline(always)]
    pub fn pc(&self) -> u32 {
        self.key.pc()
    }

    #[inline(always)]
    pub fn size_in_bytes(&self) -> u32 {
        self.instructions.len() as u32 * 4
    }

    #[inline(always)]
    pub fn is_in_ram(&self, map: &MemoryMap) -> bool {
        map.is_ram(self.key.physical_pc(map))
    }

    /// Code page the block starts in.
    #[inline(always)]
    pub fn start_page(&self, map: &MemoryMap) -> u32 {
        self.key.physical_pc(map) / map.code_page_size
    }

    /// Code page holding the last byte of the block, clamped to the end of RAM.
    #[inline(always)]
    pub fn end_page(&self, map: &MemoryMap) -> u32 {
        let last = self.key.physical_pc(map) + self.size_in_bytes().max(1) - 1;
        (last / map.code_page_size).min(map.ram_page_count() - 1)
    }

    /// Every code page overlapped by the block.
    #[inline(always)]
    pub fn pages(&self, map: &MemoryMap) -> RangeInclusive<u32> {
        self.start_page(map)..=self.end_page(map)
    }
}

/// Walks a straight-line run of instructions and decides where it ends.
///
/// A block ends after the delay slot of a branch, after an instruction that always leaves the
/// block (such as a syscall) or once it reaches the instruction limit. A branch in a delay slot
/// does not end the block by itself: the block continues into the following slot.
pub(crate) struct BlockScanner {
    limit: u32,
    count: u32,
    in_branch_delay_slot: bool,
    in_load_delay_slot: bool,
}

impl BlockScanner {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            count: 0,
            in_branch_delay_slot: false,
            in_load_delay_slot: false,
        }
    }

    /// Records the next instruction. Returns it alongside whether it is the last one.
    pub fn push(&mut self, pc: u32, bits: u32, class: InstructionClass) -> (CachedInstruction, bool) {
        let in_delay_slot = self.in_branch_delay_slot;
        let mut instruction = CachedInstruction {
            bits,
            pc,
            is_branch: class.is_branch,
            is_branch_delay_slot: in_delay_slot,
            is_load: class.is_load,
            is_store: class.is_store,
            is_load_delay_slot: self.in_load_delay_slot,
            is_last: false,
            has_load_delay: class.has_load_delay,
            can_trap: class.can_trap,
        };

        self.count += 1;
        self.in_branch_delay_slot = class.is_branch;
        self.in_load_delay_slot = class.has_load_delay;

        let ends = (in_delay_slot && !class.is_branch)
            || class.is_exit
            || (self.count >= self.limit && !class.is_branch);

        instruction.is_last = ends;
        (instruction, ends)
    }
}
