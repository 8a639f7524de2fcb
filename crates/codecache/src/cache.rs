mod fastmem;

use crate::{
    BackendError, BackpatchInfo, Block, BlockId, BlockKey, CacheConfig, DispatchTable, Entry,
    FaultHandlerRegistry, Guest, HostCode, HostCodeIndex, MemoryMap, PageIndex, Recompiler, Step,
    block::BlockScanner,
};
use easyerr::{Error, ResultExt};
use jitalloc::{AllocError, CodeBuffer};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

const HOST_CODE_ALIGNMENT: usize = 16;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no instruction could be fetched at {pc:08X}")]
    EmptyBlock { pc: u32 },
    #[error("no recompiler is configured")]
    NoRecompiler,
    #[error(transparent)]
    Backend { source: BackendError },
    #[error(transparent)]
    Alloc { source: AllocError },
}

impl CompileError {
    fn is_buffer_exhausted(&self) -> bool {
        matches!(
            self,
            Self::Alloc {
                source: AllocError::Exhausted { .. }
            } | Self::Backend {
                source: BackendError::CodeBufferFull
            }
        )
    }
}

/// Counters describing what the cache has been doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Block map lookups, including the ones that ended up compiling.
    pub lookups: u64,
    pub compiles: u64,
    pub revalidations: u64,
    pub flushes: u64,
    /// Blocks marked invalid because their pages were written to.
    pub invalidations: u64,
    /// Transfers between blocks that went through a link instead of a lookup.
    pub links_followed: u64,
    pub uncached_passes: u64,
    pub backpatches: u64,
}

/// The block cache.
///
/// Owns every block along with the indices over them and drives execution of a [`Guest`].
pub struct CodeCache<G> {
    map: MemoryMap,
    config: CacheConfig,

    blocks: SlotMap<BlockId, Block>,
    block_map: FxHashMap<BlockKey, BlockId>,
    pages: PageIndex,
    host_index: HostCodeIndex,
    dispatch: DispatchTable,

    backend: Option<Box<dyn Recompiler<G>>>,
    buffer: Option<CodeBuffer>,
    faults: Option<Box<dyn FaultHandlerRegistry>>,

    use_recompiler: bool,
    fastmem: bool,
    fault_handler_installed: bool,

    invalidation_buffer: Vec<BlockId>,
    written_pages: Vec<u32>,
    stats: Stats,
}

impl<G: Guest> CodeCache<G> {
    /// Creates an empty cache that interprets everything. Call [`CodeCache::initialize`] before
    /// running code.
    pub fn new(map: MemoryMap, config: CacheConfig) -> Self {
        Self {
            blocks: SlotMap::with_key(),
            block_map: FxHashMap::default(),
            pages: PageIndex::new(map.ram_page_count()),
            host_index: HostCodeIndex::new(),
            dispatch: DispatchTable::new(&map),

            backend: None,
            buffer: None,
            faults: None,

            use_recompiler: false,
            fastmem: false,
            fault_handler_installed: false,

            invalidation_buffer: Vec::new(),
            written_pages: Vec::new(),
            stats: Stats::default(),

            map,
            config,
        }
    }

    /// Attaches a native code backend along with the buffer its code is placed in.
    pub fn with_recompiler(mut self, backend: Box<dyn Recompiler<G>>, buffer: CodeBuffer) -> Self {
        self.backend = Some(backend);
        self.buffer = Some(buffer);
        self
    }

    /// Attaches the capability used to route host memory faults to the cache.
    pub fn with_fault_handler(mut self, registry: Box<dyn FaultHandlerRegistry>) -> Self {
        self.faults = Some(registry);
        self
    }

    /// Starts from an empty cache in the execution mode given by the configuration.
    pub fn initialize(&mut self, guest: &mut G) {
        self.flush(guest);
        self.apply_mode(guest, self.config.use_recompiler, self.config.fastmem);
    }

    #[inline(always)]
    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    #[inline(always)]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[inline(always)]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    #[inline(always)]
    pub fn uses_recompiler(&self) -> bool {
        self.use_recompiler
    }

    #[inline(always)]
    pub fn fastmem_enabled(&self) -> bool {
        self.fastmem
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks.iter()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Finds the block registered under `key` without revalidating or compiling anything.
    pub fn find_block(&self, key: BlockKey) -> Option<BlockId> {
        self.block_map.get(&key).copied()
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn page_index(&self) -> &PageIndex {
        &self.pages
    }

    pub fn host_code_index(&self) -> &HostCodeIndex {
        &self.host_index
    }

    pub fn code_buffer(&self) -> Option<&CodeBuffer> {
        self.buffer.as_ref()
    }

    /// Destroys every block and resets all indices.
    pub fn flush(&mut self, guest: &mut G) {
        tracing::info!(blocks = self.blocks.len(), "flushing code cache");

        guest.clear_code_pages();
        self.pages.clear();
        self.block_map.clear();
        self.blocks.clear();
        self.host_index.clear();
        self.dispatch.reset();
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.reset();
        }

        self.stats.flushes += 1;
    }

    /// Switches between interpreting and recompiling blocks. Any change flushes the cache.
    pub fn set_use_recompiler(&mut self, guest: &mut G, enable: bool, fastmem: bool) {
        if self.use_recompiler == enable && self.fastmem == fastmem {
            return;
        }

        self.flush(guest);
        self.apply_mode(guest, enable, fastmem);
    }

    fn apply_mode(&mut self, guest: &mut G, enable: bool, fastmem: bool) {
        self.shutdown_fastmem(guest);

        let available = self.backend.is_some() && self.buffer.is_some();
        if enable && !available {
            tracing::warn!("no recompiler available - staying in interpreter mode");
        }

        self.use_recompiler = enable && available;
        if self.use_recompiler && fastmem {
            self.fastmem = self.initialize_fastmem(guest);
        }

        tracing::info!(
            recompiler = self.use_recompiler,
            fastmem = self.fastmem,
            "execution mode set"
        );
    }

    /// Gives up on native code for the rest of the session.
    fn disable_recompiler(&mut self, guest: &mut G) {
        self.shutdown_fastmem(guest);
        self.use_recompiler = false;
    }

    #[inline(always)]
    pub fn next_block_key(&self, guest: &G) -> BlockKey {
        BlockKey::new(guest.in_user_mode(), guest.pc())
    }

    #[inline(always)]
    fn is_cacheable(&self, pc: u32) -> bool {
        pc.is_multiple_of(4) && self.map.is_code_address(pc)
    }

    /// Runs the guest until its timeslice expires, using whichever mode is active.
    pub fn run(&mut self, guest: &mut G) {
        if self.use_recompiler {
            self.execute_recompiler(guest);
        } else {
            self.execute(guest);
        }
    }

    /// Runs the guest by interpreting cached blocks until its timeslice expires.
    pub fn execute(&mut self, guest: &mut G) {
        while !guest.timeslice_expired() {
            // writes made while no block was running, e.g. between timeslices
            self.process_code_writes(guest);

            if guest.has_pending_interrupt() {
                guest.dispatch_interrupt();
            }

            if !self.is_cacheable(guest.pc()) {
                self.interpret_uncached_block(guest);
                continue;
            }

            let key = self.next_block_key(guest);
            match self.lookup_block(guest, key) {
                Some(id) => self.run_block_chain(guest, id),
                None => self.interpret_uncached_block(guest),
            }
        }
    }

    /// Runs the guest through the dispatch table until its timeslice expires. Falls back to
    /// [`CodeCache::execute`] once the recompiler is disabled.
    pub fn execute_recompiler(&mut self, guest: &mut G) {
        while !guest.timeslice_expired() {
            if !self.use_recompiler {
                self.execute(guest);
                return;
            }

            self.process_code_writes(guest);
            if guest.has_pending_interrupt() {
                guest.dispatch_interrupt();
            }

            let pc = guest.pc();
            if !self.is_cacheable(pc) {
                self.interpret_uncached_block(guest);
                continue;
            }

            let key = self.next_block_key(guest);
            let id = match self.dispatch.dispatch(pc) {
                Entry::Block(id)
                    if self
                        .blocks
                        .get(id)
                        .is_some_and(|b| b.key == key && !b.invalidated) =>
                {
                    id
                }
                _ => {
                    let Some(id) = self.fast_compile_block(guest, key) else {
                        self.interpret_uncached_block(guest);
                        continue;
                    };

                    id
                }
            };

            self.run_block_chain(guest, id);
        }
    }

    /// Slow path of the dispatch table: finds or compiles the block and installs it in its slot.
    fn fast_compile_block(&mut self, guest: &mut G, key: BlockKey) -> Option<BlockId> {
        let id = self.lookup_block(guest, key)?;
        if self.blocks[id].host_code.is_some() {
            self.dispatch.set_entry(key.pc(), Entry::Block(id));
        }

        Some(id)
    }

    /// Runs a block, then keeps following the blocks it transfers control to for as long as
    /// that does not require leaving the loop.
    fn run_block_chain(&mut self, guest: &mut G, first: BlockId) {
        let mut current = first;
        loop {
            self.execute_block(guest, current);
            self.process_code_writes(guest);

            if !self.config.enable_linking
                || guest.timeslice_expired()
                || guest.has_pending_interrupt()
                || !self.is_cacheable(guest.pc())
            {
                return;
            }

            let key = self.next_block_key(guest);
            let Some(block) = self.blocks.get(current) else {
                return;
            };

            if key == block.key {
                if block.invalidated {
                    let Some(id) = self.revalidate_block(guest, current) else {
                        self.interpret_uncached_block(guest);
                        return;
                    };

                    current = id;
                }

                continue;
            }

            let linked = block
                .link_successors
                .iter()
                .copied()
                .find(|&s| self.blocks.get(s).is_some_and(|b| b.key == key));

            current = if let Some(next) = linked {
                self.stats.links_followed += 1;
                next
            } else {
                let Some(next) = self.lookup_block(guest, key) else {
                    self.interpret_uncached_block(guest);
                    return;
                };

                self.link_block(current, next);
                next
            };
        }
    }

    fn execute_block(&mut self, guest: &mut G, id: BlockId) {
        let Some(block) = self.blocks.get(id) else {
            return;
        };

        if self.use_recompiler
            && let Some(code) = block.host_code
            && let Some(backend) = self.backend.as_mut()
        {
            backend.execute(guest, block, code);
            return;
        }

        // control can leave the straight line early, e.g. through a branch in a delay slot
        for instruction in &block.instructions {
            if guest.pc() != instruction.pc || guest.interpret(instruction) == Step::Exception {
                break;
            }
        }
    }

    /// Interprets a single block worth of instructions without caching anything.
    fn interpret_uncached_block(&mut self, guest: &mut G) {
        self.stats.uncached_passes += 1;

        let user_mode = guest.in_user_mode();
        let mut scanner = BlockScanner::new(self.config.max_block_instructions);
        loop {
            let pc = guest.pc();
            let Some(bits) = guest.fetch_instruction(pc) else {
                guest.instruction_fetch_failed(pc);
                break;
            };

            let (instruction, last) = scanner.push(pc, bits, guest.classify(bits, user_mode));
            if guest.interpret(&instruction) == Step::Exception || last {
                break;
            }
        }

        self.process_code_writes(guest);
    }

    /// Finds the block for `key`, revalidating or compiling it as needed. Returns `None` when
    /// the code at `key` could not be cached.
    pub fn lookup_block(&mut self, guest: &mut G, key: BlockKey) -> Option<BlockId> {
        self.stats.lookups += 1;

        match self.block_map.get(&key) {
            Some(&id) if self.blocks[id].invalidated => self.revalidate_block(guest, id),
            Some(&id) => Some(id),
            None => self.compile_block(guest, key),
        }
    }

    fn compile_block(&mut self, guest: &mut G, key: BlockKey) -> Option<BlockId> {
        let block = self.build_block(guest, key)?;
        let id = self.blocks.insert(block);
        self.block_map.insert(key, id);
        self.register_block(guest, id);

        Some(id)
    }

    /// Decodes the block at `key` and, in recompiler mode, emits its host code. The block is not
    /// registered anywhere yet.
    fn build_block(&mut self, guest: &mut G, key: BlockKey) -> Option<Block> {
        let _span = tracing::trace_span!("compiling block", key = %key).entered();

        let mut block = Block::new(key);
        if let Err(e) = self.decode_block(guest, &mut block) {
            tracing::warn!("failed to compile block at {key}: {e}");
            return None;
        }

        self.stats.compiles += 1;
        if self.use_recompiler {
            self.compile_host_code(guest, &mut block);
        }

        tracing::trace!(
            instructions = block.instructions.len(),
            host_code = block.host_code.is_some(),
            "compiled block"
        );

        Some(block)
    }

    fn decode_block(&self, guest: &mut G, block: &mut Block) -> Result<(), CompileError> {
        let user_mode = block.key.user_mode();
        let mut scanner = BlockScanner::new(self.config.max_block_instructions);
        let mut pc = block.pc();

        loop {
            let Some(bits) = guest.fetch_instruction(pc) else {
                tracing::trace!("instruction fetch at {pc:08X} failed - ending block");
                if let Some(last) = block.instructions.last_mut() {
                    last.is_last = true;
                }

                break;
            };

            let (instruction, last) = scanner.push(pc, bits, guest.classify(bits, user_mode));
            block.contains_loadstore_instructions |= instruction.is_loadstore();
            block.instructions.push(instruction);

            if last {
                break;
            }

            pc = pc.wrapping_add(4);
        }

        if block.instructions.is_empty() {
            return Err(CompileError::EmptyBlock { pc: block.pc() });
        }

        Ok(())
    }

    /// Compiles host code for the block, flushing the cache once if the code buffer is full.
    /// On failure the block is left without host code.
    ///
    /// Host code of recompiled blocks is never freed on its own: the space stays dead in the
    /// buffer until it fills up and the resulting flush reclaims everything.
    fn compile_host_code(&mut self, guest: &mut G, block: &mut Block) {
        let result = match self.emit_host_code(block) {
            Err(e) if e.is_buffer_exhausted() => {
                tracing::info!("host code buffer is full - flushing code cache");
                self.flush(guest);
                self.emit_host_code(block)
            }
            result => result,
        };

        match result {
            Ok(()) => (),
            Err(e) if e.is_buffer_exhausted() => {
                tracing::warn!("host code buffer is full after a flush - disabling recompiler");
                self.disable_recompiler(guest);
            }
            Err(e) => {
                tracing::warn!("failed to compile host code for {}, interpreting it: {e}", block.key);
            }
        }
    }

    fn emit_host_code(&mut self, block: &mut Block) -> Result<(), CompileError> {
        let (Some(backend), Some(buffer)) = (self.backend.as_mut(), self.buffer.as_mut()) else {
            return Err(CompileError::NoRecompiler);
        };

        let compiled = backend
            .compile(block, self.fastmem)
            .context(CompileCtx::Backend)?;
        let alloc = buffer
            .allocate(HOST_CODE_ALIGNMENT, &compiled.code)
            .context(CompileCtx::Alloc)?;

        let code = HostCode {
            addr: alloc.addr(),
            len: alloc.len(),
        };

        block.backpatch = compiled
            .backpatch
            .iter()
            .map(|site| BackpatchInfo {
                host_pc: code.addr + site.offset,
                guest_pc: site.guest_pc,
                is_store: site.is_store,
            })
            .collect();
        block.host_code = Some(code);

        Ok(())
    }

    /// Adds a valid block to the page index and, if it has host code, to the host code index
    /// and the dispatch table.
    fn register_block(&mut self, guest: &mut G, id: BlockId) {
        let block = &self.blocks[id];
        if block.is_in_ram(&self.map) {
            for page in block.pages(&self.map) {
                if self.pages.insert(page, id) {
                    guest.set_code_page(page, true);
                }
            }
        }

        if let Some(code) = block.host_code {
            self.host_index.insert(code.addr, id);
            self.dispatch.set_entry(block.pc(), Entry::Block(id));
        }
    }

    fn remove_from_pages(&mut self, guest: &mut G, id: BlockId) {
        let block = &self.blocks[id];
        if !block.is_in_ram(&self.map) {
            return;
        }

        for page in block.pages(&self.map) {
            if self.pages.remove(page, id) {
                guest.set_code_page(page, false);
            }
        }
    }

    /// Brings an invalidated block back. If its code is unchanged it is reused as is, otherwise
    /// it is recompiled under the same key.
    fn revalidate_block(&mut self, guest: &mut G, id: BlockId) -> Option<BlockId> {
        self.stats.revalidations += 1;

        let block = &self.blocks[id];
        let unchanged = block
            .instructions
            .iter()
            .all(|ins| guest.fetch_instruction(ins.pc) == Some(ins.bits));

        if unchanged {
            tracing::debug!("block {} is unchanged - revalidating", block.key);
            self.blocks[id].invalidated = false;
            self.register_block(guest, id);

            return Some(id);
        }

        tracing::debug!("block {} was modified - recompiling", block.key);
        self.recompile_block(guest, id)
    }

    /// Rebuilds a modified block. Its previous host code is abandoned in the code buffer.
    fn recompile_block(&mut self, guest: &mut G, id: BlockId) -> Option<BlockId> {
        let key = self.blocks[id].key;
        if let Some(code) = self.blocks[id].host_code.take() {
            self.host_index.remove(code.addr);
        }

        let Some(fresh) = self.build_block(guest, key) else {
            self.flush_block(guest, id);
            return None;
        };

        // building might have flushed the whole cache
        let id = if let Some(block) = self.blocks.get_mut(id) {
            *block = fresh;
            id
        } else {
            let id = self.blocks.insert(fresh);
            self.block_map.insert(key, id);
            id
        };

        self.register_block(guest, id);
        Some(id)
    }

    /// Removes a single block from the cache.
    fn flush_block(&mut self, guest: &mut G, id: BlockId) {
        let Some(block) = self.blocks.get(id) else {
            return;
        };

        tracing::debug!("flushing block {}", block.key);
        if !block.invalidated {
            self.remove_from_pages(guest, id);
        }

        self.unlink_block(id);
        let Some(block) = self.blocks.remove(id) else {
            return;
        };

        if self.block_map.get(&block.key) == Some(&id) {
            self.block_map.remove(&block.key);
        }

        if let Some(code) = block.host_code {
            self.host_index.remove(code.addr);
        }
    }

    /// Records that `from` transfers control directly to `to`, patching host code when both
    /// blocks have it.
    pub fn link_block(&mut self, from: BlockId, to: BlockId) {
        let (Some(a), Some(b)) = (self.blocks.get(from), self.blocks.get(to)) else {
            return;
        };

        if from == to || a.invalidated || b.invalidated || a.link_successors.contains(&to) {
            return;
        }

        tracing::trace!("linking {} to {}", a.key, b.key);
        if a.host_code.is_some()
            && b.host_code.is_some()
            && let (Some(backend), Some(buffer)) = (self.backend.as_mut(), self.buffer.as_mut())
            && let Err(e) = backend.link(buffer, a, b)
        {
            tracing::warn!("failed to patch link from {} to {}: {e}", a.key, b.key);
        }

        self.blocks[from].link_successors.push(to);
        self.blocks[to].link_predecessors.push(from);
    }

    /// Removes every link into and out of the block.
    pub fn unlink_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };

        let predecessors = std::mem::take(&mut block.link_predecessors);
        let successors = std::mem::take(&mut block.link_successors);

        for pred in predecessors {
            if let Some(p) = self.blocks.get_mut(pred) {
                p.link_successors.retain(|&s| s != id);
            }

            self.unpatch_link(pred, id);
            self.revert_dispatch(pred);
        }

        for succ in successors {
            if let Some(s) = self.blocks.get_mut(succ) {
                s.link_predecessors.retain(|&p| p != id);
            }

            self.unpatch_link(id, succ);
            self.revert_dispatch(succ);
        }

        self.revert_dispatch(id);
    }

    fn unpatch_link(&mut self, from: BlockId, to: BlockId) {
        let (Some(a), Some(b)) = (self.blocks.get(from), self.blocks.get(to)) else {
            return;
        };

        if a.host_code.is_some()
            && b.host_code.is_some()
            && let (Some(backend), Some(buffer)) = (self.backend.as_mut(), self.buffer.as_mut())
            && let Err(e) = backend.unlink(buffer, a, b)
        {
            tracing::warn!("failed to unpatch link from {} to {}: {e}", a.key, b.key);
        }
    }

    /// Points the block's dispatch slot back at the compile trampoline if it currently points
    /// at the block.
    fn revert_dispatch(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.get(id)
            && block.host_code.is_some()
            && self.dispatch.dispatch(block.pc()) == Entry::Block(id)
        {
            self.dispatch.set_entry(block.pc(), Entry::Compile);
        }
    }

    /// Invalidates every block overlapping a RAM code page and stops tracking writes to it.
    ///
    /// Blocks are only marked: they stay in the cache until the next lookup either revalidates
    /// or recompiles them.
    pub fn invalidate_blocks_with_page_index(&mut self, guest: &mut G, page: u32) {
        if page >= self.pages.len() {
            tracing::warn!("ignoring invalidation of out of range code page {page}");
            return;
        }

        let mut invalidated = std::mem::take(&mut self.invalidation_buffer);
        invalidated.extend(self.pages.blocks(page).iter().copied());
        if !invalidated.is_empty() {
            tracing::debug!(page, blocks = invalidated.len(), "invalidating code page");
        }

        for id in invalidated.drain(..) {
            self.remove_from_pages(guest, id);
            self.blocks[id].invalidated = true;
            self.unlink_block(id);
            self.stats.invalidations += 1;
        }

        guest.set_code_page(page, false);
        self.invalidation_buffer = invalidated;
    }

    /// Invalidates the code page containing a written guest address, if it is in RAM.
    pub fn invalidate_address(&mut self, guest: &mut G, addr: u32) {
        if let Some(page) = self.map.ram_page(self.map.physical(addr)) {
            self.invalidate_blocks_with_page_index(guest, page);
        }
    }

    /// Invalidates the code pages the guest reported as written.
    pub fn process_code_writes(&mut self, guest: &mut G) {
        let mut pages = std::mem::take(&mut self.written_pages);
        guest.drain_code_writes(&mut pages);
        for page in pages.drain(..) {
            self.invalidate_blocks_with_page_index(guest, page);
        }

        self.written_pages = pages;
    }
}

impl<G> Drop for CodeCache<G> {
    fn drop(&mut self) {
        if self.fault_handler_installed
            && let Some(registry) = self.faults.as_mut()
        {
            registry.remove();
        }
    }
}

impl<G> std::fmt::Debug for CodeCache<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("blocks", &self.blocks.len())
            .field("use_recompiler", &self.use_recompiler)
            .field("fastmem", &self.fastmem)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
