//! A threaded "recompiler" for the toy machine.
//!
//! Host code is a patchable trace rather than real machine code: one slot per guest
//! instruction followed by an exit stub. Execution walks the block's cached decode, while the
//! emitted bytes record the state of links and backpatched accesses exactly like a real backend
//! would, so that the cache's bookkeeping can be observed.
use crate::Machine;
use codecache::jitalloc::CodeBuffer;
use codecache::{
    BackendError, BackpatchInfo, BackpatchSite, Block, Compiled, Guest, HostCode, Recompiler, Step,
};
use rustc_hash::FxHashSet;

/// Bytes per guest instruction.
pub const SLOT_LEN: usize = 4;
/// Bytes of the exit stub at the end of every block.
pub const EXIT_LEN: usize = 5;

pub const OP_STEP: u8 = 0x90;
pub const OP_FASTMEM: u8 = 0x89;
pub const OP_SLOWMEM: u8 = 0xE8;
pub const OP_RET: u8 = 0xC3;
pub const OP_JMP: u8 = 0xE9;

const EXIT_STUB: [u8; EXIT_LEN] = [OP_RET, 0, 0, 0, 0];

#[derive(Debug, Default)]
pub struct ThreadedRecompiler {
    /// Guest addresses whose blocks refuse to compile.
    pub unsupported: FxHashSet<u32>,
    /// Number of blocks executed through host code.
    pub executed: u64,
}

impl ThreadedRecompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host address of the exit stub of a block's code.
    pub fn exit_stub(code: HostCode) -> usize {
        code.end() - EXIT_LEN
    }

    /// Decodes the exit stub bytes into the host address it jumps to, if linked.
    pub fn link_target(stub_addr: usize, stub: &[u8]) -> Option<usize> {
        if stub.first() != Some(&OP_JMP) {
            return None;
        }

        let rel = i32::from_le_bytes(stub.get(1..5)?.try_into().ok()?);
        Some((stub_addr + EXIT_LEN).wrapping_add_signed(rel as isize))
    }
}

impl Recompiler<Machine> for ThreadedRecompiler {
    fn compile(&mut self, block: &Block, fastmem: bool) -> Result<Compiled, BackendError> {
        if let Some(ins) = block
            .instructions
            .iter()
            .find(|ins| self.unsupported.contains(&ins.pc))
        {
            return Err(BackendError::Unsupported { pc: ins.pc });
        }

        let mut compiled = Compiled::default();
        for (i, ins) in block.instructions.iter().enumerate() {
            let op = if ins.is_store && fastmem {
                compiled.backpatch.push(BackpatchSite {
                    offset: i * SLOT_LEN,
                    guest_pc: ins.pc,
                    is_store: true,
                });

                OP_FASTMEM
            } else if ins.is_loadstore() {
                OP_SLOWMEM
            } else {
                OP_STEP
            };

            compiled.code.extend_from_slice(&[op, 0, 0, 0]);
        }

        compiled.code.extend_from_slice(&EXIT_STUB);
        Ok(compiled)
    }

    fn execute(&mut self, guest: &mut Machine, block: &Block, _code: HostCode) {
        self.executed += 1;
        for ins in &block.instructions {
            if guest.pc() != ins.pc || guest.interpret(ins) == Step::Exception {
                break;
            }
        }
    }

    fn link(
        &mut self,
        buffer: &mut CodeBuffer,
        from: &Block,
        to: &Block,
    ) -> Result<(), BackendError> {
        let (Some(from_code), Some(to_code)) = (from.host_code, to.host_code) else {
            return Ok(());
        };

        let stub = Self::exit_stub(from_code);
        let rel = to_code.addr as i64 - (stub + EXIT_LEN) as i64;
        let rel = i32::try_from(rel).map_err(|_| BackendError::Unsupported { pc: from.pc() })?;

        let mut bytes = [OP_JMP, 0, 0, 0, 0];
        bytes[1..].copy_from_slice(&rel.to_le_bytes());
        buffer
            .patch(stub, &bytes)
            .map_err(|source| BackendError::Alloc { source })
    }

    fn unlink(
        &mut self,
        buffer: &mut CodeBuffer,
        from: &Block,
        _to: &Block,
    ) -> Result<(), BackendError> {
        let Some(code) = from.host_code else {
            return Ok(());
        };

        buffer
            .patch(Self::exit_stub(code), &EXIT_STUB)
            .map_err(|source| BackendError::Alloc { source })
    }

    fn backpatch(
        &mut self,
        buffer: &mut CodeBuffer,
        _block: &Block,
        site: &BackpatchInfo,
    ) -> Result<(), BackendError> {
        buffer
            .patch(site.host_pc, &[OP_SLOWMEM])
            .map_err(|source| BackendError::Alloc { source })
    }
}
