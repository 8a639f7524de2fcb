//! A block cache for CPU cores that mix interpretation and native code.
//!
//! Guest code is split into [`Block`]s keyed by their start address and privilege mode. Blocks
//! are either interpreted from their cached decode or compiled to host code by a [`Recompiler`].
//! Writes to guest RAM are tracked per code page so that self-modifying code invalidates the
//! blocks built from it.
mod block;
mod cache;
mod dispatch;
mod fault;
mod guest;
mod hostmap;
mod key;
mod memory;
mod pages;
mod recompiler;

pub use block::{BackpatchInfo, Block, BlockId, CachedInstruction, HostCode};
pub use cache::{CodeCache, CompileError, Stats};
pub use dispatch::{DispatchTable, Entry};
pub use fault::{FaultHandlerRegistry, FaultResult, PageFault, RegistryError};
pub use guest::{Guest, InstructionClass, Step};
pub use hostmap::HostCodeIndex;
pub use key::BlockKey;
pub use memory::MemoryMap;
pub use pages::PageIndex;
pub use recompiler::{BackendError, BackpatchSite, Compiled, Recompiler};

pub use jitalloc;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of instructions in a block. A branch at the limit still takes its delay
    /// slot.
    pub max_block_instructions: u32,
    /// Whether to run blocks through the recompiler.
    pub use_recompiler: bool,
    /// Whether recompiled code accesses guest RAM directly.
    pub fastmem: bool,
    /// Whether blocks jump directly into their successors.
    pub enable_linking: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_block_instructions: 256,
            use_recompiler: false,
            fastmem: false,
            enable_linking: true,
        }
    }
}
