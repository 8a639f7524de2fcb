use crate::{BackpatchInfo, Block, HostCode};
use easyerr::Error;
use jitalloc::{AllocError, CodeBuffer};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("instruction at {pc:08X} cannot be compiled")]
    Unsupported { pc: u32 },
    #[error("host code buffer is full")]
    CodeBufferFull,
    #[error(transparent)]
    Alloc { source: AllocError },
}

/// A memory access site reported by the backend, relative to the start of the emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpatchSite {
    pub offset: usize,
    pub guest_pc: u32,
    pub is_store: bool,
}

/// Host code produced for a block, before it is placed in the code buffer.
#[derive(Debug, Clone, Default)]
pub struct Compiled {
    pub code: Vec<u8>,
    pub backpatch: Vec<BackpatchSite>,
}

/// A native code backend.
///
/// The cache decides what to compile and where the code lives; the backend only turns blocks
/// into bytes and knows how to rewrite them.
pub trait Recompiler<G: ?Sized> {
    /// Emits host code for a decoded block. With `fastmem`, memory accesses may go directly to
    /// host memory and must be reported as backpatch sites.
    fn compile(&mut self, block: &Block, fastmem: bool) -> Result<Compiled, BackendError>;

    /// Runs the block's host code.
    fn execute(&mut self, guest: &mut G, block: &Block, code: HostCode);

    /// Patches the exit of `from` to jump straight into `to`.
    fn link(
        &mut self,
        buffer: &mut CodeBuffer,
        from: &Block,
        to: &Block,
    ) -> Result<(), BackendError> {
        _ = (buffer, from, to);
        Ok(())
    }

    /// Restores the exit of `from` that was previously linked to `to`.
    fn unlink(
        &mut self,
        buffer: &mut CodeBuffer,
        from: &Block,
        to: &Block,
    ) -> Result<(), BackendError> {
        _ = (buffer, from, to);
        Ok(())
    }

    /// Rewrites a fastmem access site to take the slow memory path.
    fn backpatch(
        &mut self,
        buffer: &mut CodeBuffer,
        block: &Block,
        site: &BackpatchInfo,
    ) -> Result<(), BackendError>;
}
