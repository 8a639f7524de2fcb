mod common;

use codecache::{BlockKey, CacheConfig, CodeCache, Entry, MemoryMap};
use common::{assert_flushed, interpreter, machine, recompiler, recompiler_with, Registry};
use toymips::asm::{self, reg};
use toymips::bus::SCRATCHPAD_BASE;
use toymips::recompiler::{EXIT_LEN, OP_RET};
use toymips::{Halt, Machine, ThreadedRecompiler};

fn straight_line() -> [u32; 3] {
    [
        asm::addiu(reg::T0, reg::ZERO, 1),
        asm::addiu(reg::T1, reg::ZERO, 2),
        asm::syscall(),
    ]
}

/// A at 0x1000 jumps to B at 0x1010, which loops back to A until T0 reaches T1, then falls
/// into C at 0x1018.
fn counting_loop() -> Vec<u32> {
    vec![
        asm::addiu(reg::T0, reg::T0, 1),
        asm::j(0x1010),
        asm::nop(),
        asm::nop(),
        asm::bne(reg::T0, reg::T1, -5),
        asm::nop(),
        asm::syscall(),
    ]
}

fn link_target(cache: &CodeCache<Machine>, from: BlockKey) -> Option<usize> {
    let block = cache.block(cache.find_block(from)?)?;
    let stub = ThreadedRecompiler::exit_stub(block.host_code?);
    let bytes = cache.code_buffer()?.bytes(stub, EXIT_LEN)?;
    ThreadedRecompiler::link_target(stub, bytes)
}

#[test]
fn compiled_block_is_installed() {
    let mut guest = machine(0x1000, &straight_line());
    guest.cpu.user_mode = true;

    let mut cache = recompiler();
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.halted(), Some(Halt::Syscall));
    assert_eq!(guest.reg(reg::T1), 2);

    let id = cache.find_block(BlockKey::new(true, 0x1000)).unwrap();
    let block = cache.block(id).unwrap();
    assert_eq!(block.instructions.len(), 3);
    assert!(block.instructions[2].is_last);
    assert!(!block.instructions[1].is_last);
    assert!(block.host_code.is_some());

    assert_eq!(cache.dispatch_table().dispatch(0x1000), Entry::Block(id));
    assert_eq!(
        cache.page_index().blocks(4).iter().copied().collect::<Vec<_>>(),
        vec![id]
    );
    assert!(guest.bus.is_code_page(4));
    assert_eq!(cache.host_code_index().len(), 1);
}

#[test]
fn code_write_invalidates_and_recompiles() {
    let key = BlockKey::new(true, 0x1000);
    let mut guest = machine(0x1000, &straight_line());
    guest.cpu.user_mode = true;

    let mut cache = recompiler();
    cache.initialize(&mut guest);
    cache.run(&mut guest);
    let id = cache.find_block(key).unwrap();

    guest
        .bus
        .write(0x1004, asm::addiu(reg::T1, reg::ZERO, 5))
        .unwrap();
    cache.process_code_writes(&mut guest);

    let block = cache.block(id).unwrap();
    assert!(block.invalidated);
    assert_eq!(cache.dispatch_table().dispatch(0x1000), Entry::Compile);
    assert!(cache.page_index().blocks(4).is_empty());
    assert!(!guest.bus.is_code_page(4));

    guest.reset(0x1000);
    guest.cpu.user_mode = true;
    cache.run(&mut guest);

    assert_eq!(guest.reg(reg::T1), 5);
    assert_eq!(cache.stats().compiles, 2);
    assert_eq!(cache.stats().revalidations, 1);

    let id = cache.find_block(key).unwrap();
    let block = cache.block(id).unwrap();
    assert!(!block.invalidated);
    assert_eq!(block.instructions[1].bits, asm::addiu(reg::T1, reg::ZERO, 5));
    assert_eq!(cache.dispatch_table().dispatch(0x1000), Entry::Block(id));
    assert_eq!(cache.host_code_index().len(), 1);
}

#[test]
fn write_between_runs_is_seen_before_dispatch() {
    for mut cache in [interpreter(), recompiler()] {
        let mut guest = machine(0x1000, &straight_line());
        cache.initialize(&mut guest);
        cache.run(&mut guest);
        assert_eq!(guest.reg(reg::T1), 2);

        // nothing drains the queued write before the next run
        guest
            .bus
            .write(0x1004, asm::addiu(reg::T1, reg::ZERO, 5))
            .unwrap();

        guest.reset(0x1000);
        cache.run(&mut guest);

        assert_eq!(guest.halted(), Some(Halt::Syscall));
        assert_eq!(guest.reg(reg::T1), 5);
        assert_eq!(cache.stats().compiles, 2);
        assert_eq!(cache.stats().revalidations, 1);
        assert_eq!(cache.stats().invalidations, 1);
        assert!(guest.bus.is_code_page(4));
    }
}

#[test]
fn unchanged_block_is_revalidated_in_place() {
    let key = BlockKey::new(false, 0x1000);
    let mut guest = machine(0x1000, &straight_line());

    let mut cache = interpreter();
    cache.initialize(&mut guest);
    cache.run(&mut guest);
    let id = cache.find_block(key).unwrap();

    cache.invalidate_address(&mut guest, 0x8000_1008);
    assert!(cache.block(id).unwrap().invalidated);

    guest.reset(0x1000);
    cache.run(&mut guest);

    assert_eq!(cache.find_block(key), Some(id));
    assert!(!cache.block(id).unwrap().invalidated);
    assert_eq!(cache.stats().compiles, 1);
    assert_eq!(cache.stats().revalidations, 1);
    assert!(guest.bus.is_code_page(4));
}

#[test]
fn direct_jump_is_linked_and_followed() {
    let mut guest = machine(0x1000, &counting_loop());
    guest.cpu.regs[reg::T1 as usize] = 10;

    let mut cache = recompiler();
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.halted(), Some(Halt::Syscall));
    assert_eq!(guest.reg(reg::T0), 10);

    let stats = cache.stats();
    assert_eq!(stats.compiles, 3);
    assert_eq!(stats.lookups, 4);
    assert_eq!(stats.links_followed, 17);

    let a = cache.find_block(BlockKey::new(false, 0x1000)).unwrap();
    let b = cache.find_block(BlockKey::new(false, 0x1010)).unwrap();
    let c = cache.find_block(BlockKey::new(false, 0x1018)).unwrap();
    assert_eq!(cache.block(a).unwrap().link_successors, vec![b]);
    assert_eq!(cache.block(a).unwrap().link_predecessors, vec![b]);
    assert_eq!(cache.block(b).unwrap().link_successors, vec![a, c]);
    assert_eq!(cache.block(b).unwrap().link_predecessors, vec![a]);
    assert_eq!(cache.block(c).unwrap().link_predecessors, vec![b]);

    let b_code = cache.block(b).unwrap().host_code.unwrap();
    assert_eq!(
        link_target(&cache, BlockKey::new(false, 0x1000)),
        Some(b_code.addr)
    );
}

#[test]
fn interpreter_follows_links_too() {
    let mut guest = machine(0x1000, &counting_loop());
    guest.cpu.regs[reg::T1 as usize] = 10;

    let mut cache = interpreter();
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.reg(reg::T0), 10);
    assert_eq!(cache.stats().lookups, 4);
    assert_eq!(cache.stats().links_followed, 17);
}

#[test]
fn linking_can_be_disabled() {
    let mut guest = machine(0x1000, &counting_loop());
    guest.cpu.regs[reg::T1 as usize] = 10;

    let config = CacheConfig {
        enable_linking: false,
        ..CacheConfig::default()
    };
    let mut cache = CodeCache::new(MemoryMap::default(), config);
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.reg(reg::T0), 10);
    assert_eq!(cache.stats().links_followed, 0);
    assert_eq!(cache.stats().lookups, 21);
    assert!(cache.blocks().all(|(_, b)| b.link_successors.is_empty()));
}

#[test]
fn invalidation_unlinks_both_directions() {
    // A at 0x1000 (page 4) jumps to B at 0x2000 (page 8), which loops back to A
    let mut guest = machine(
        0x1000,
        &[
            asm::addiu(reg::T0, reg::T0, 1),
            asm::j(0x2000),
            asm::nop(),
        ],
    );
    guest
        .load(
            0x2000,
            &[asm::bne(reg::T0, reg::T1, -1025), asm::nop(), asm::syscall()],
        )
        .unwrap();
    guest.cpu.regs[reg::T1 as usize] = 3;

    let mut cache = recompiler();
    cache.initialize(&mut guest);
    cache.run(&mut guest);
    assert_eq!(guest.reg(reg::T0), 3);

    let a_key = BlockKey::new(false, 0x1000);
    let a = cache.find_block(a_key).unwrap();
    let b = cache.find_block(BlockKey::new(false, 0x2000)).unwrap();
    assert!(link_target(&cache, a_key).is_some());
    assert_eq!(cache.dispatch_table().dispatch(0x1000), Entry::Block(a));

    cache.invalidate_blocks_with_page_index(&mut guest, 8);

    let block_a = cache.block(a).unwrap();
    let block_b = cache.block(b).unwrap();
    assert!(!block_a.invalidated);
    assert!(block_b.invalidated);
    assert!(block_a.link_successors.is_empty());
    assert!(block_a.link_predecessors.is_empty());
    assert!(block_b.link_successors.is_empty());
    assert!(block_b.link_predecessors.is_empty());

    // no dangling edges anywhere
    for (id, block) in cache.blocks() {
        for succ in &block.link_successors {
            assert!(cache.block(*succ).unwrap().link_predecessors.contains(&id));
        }

        for pred in &block.link_predecessors {
            assert!(cache.block(*pred).unwrap().link_successors.contains(&id));
        }
    }

    assert_eq!(cache.dispatch_table().dispatch(0x1000), Entry::Compile);
    assert_eq!(cache.dispatch_table().dispatch(0x2000), Entry::Compile);
    assert_eq!(link_target(&cache, a_key), None);

    let stub = ThreadedRecompiler::exit_stub(block_a.host_code.unwrap());
    assert_eq!(
        cache.code_buffer().unwrap().bytes(stub, 1),
        Some(&[OP_RET][..])
    );

    assert!(guest.bus.is_code_page(4));
    assert!(!guest.bus.is_code_page(8));
}

#[test]
fn flush_is_idempotent() {
    let mut guest = machine(0x1000, &counting_loop());
    guest.cpu.regs[reg::T1 as usize] = 4;

    let mut cache = recompiler();
    cache.initialize(&mut guest);
    assert_flushed(&cache, &guest);

    cache.flush(&mut guest);
    assert_flushed(&cache, &guest);

    cache.run(&mut guest);
    assert_eq!(cache.block_count(), 3);
    assert!(!cache.host_code_index().is_empty());

    cache.flush(&mut guest);
    assert_flushed(&cache, &guest);
    cache.flush(&mut guest);
    assert_flushed(&cache, &guest);
}

#[test]
fn keys_are_unique_per_mode() {
    let mut guest = machine(0x1000, &straight_line());

    let mut cache = interpreter();
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    guest.reset(0x1000);
    guest.cpu.user_mode = true;
    cache.run(&mut guest);

    let kernel = cache.find_block(BlockKey::new(false, 0x1000)).unwrap();
    let user = cache.find_block(BlockKey::new(true, 0x1000)).unwrap();
    assert_ne!(kernel, user);
    assert_eq!(cache.block_count(), 2);

    for _ in 0..3 {
        assert_eq!(
            cache.lookup_block(&mut guest, BlockKey::new(true, 0x1000)),
            Some(user)
        );
    }

    assert_eq!(cache.block_count(), 2);
    assert_eq!(cache.page_index().blocks(4).len(), 2);
}

#[test]
fn block_crossing_pages_is_tracked_in_both() {
    let mut guest = machine(
        0x13F8,
        &[
            asm::addiu(reg::T0, reg::ZERO, 1),
            asm::addiu(reg::T0, reg::T0, 1),
            asm::addiu(reg::T0, reg::T0, 1),
            asm::syscall(),
        ],
    );

    let mut cache = interpreter();
    cache.initialize(&mut guest);
    cache.run(&mut guest);
    assert_eq!(guest.reg(reg::T0), 3);

    let id = cache.find_block(BlockKey::new(false, 0x13F8)).unwrap();
    let block = cache.block(id).unwrap();
    assert_eq!(block.pages(cache.map()), 4..=5);
    assert!(cache.page_index().blocks(4).contains(&id));
    assert!(cache.page_index().blocks(5).contains(&id));
    assert!(!cache.page_index().is_tracked(6));

    cache.invalidate_blocks_with_page_index(&mut guest, 5);
    assert!(cache.block(id).unwrap().invalidated);
    assert!(!cache.page_index().is_tracked(4));
    assert!(!cache.page_index().is_tracked(5));
    assert!(!guest.bus.is_code_page(4));
    assert!(!guest.bus.is_code_page(5));
}

/// Calls a routine at 0x2000, overwrites its first instruction, then calls it again.
fn self_modifying() -> Vec<u32> {
    let mut program = vec![asm::jal(0x2000), asm::nop()];
    program.extend(asm::li(reg::A1, asm::addiu(reg::V0, reg::ZERO, 2)));
    program.extend(asm::li(reg::A0, 0x2000));
    program.extend([asm::sw(reg::A1, 0, reg::A0), asm::jal(0x2000), asm::nop(), asm::syscall()]);
    program
}

fn routine() -> [u32; 4] {
    [
        asm::addiu(reg::V0, reg::ZERO, 1),
        asm::addu(reg::V1, reg::V1, reg::V0),
        asm::jr(reg::RA),
        asm::nop(),
    ]
}

#[test]
fn self_modifying_code() {
    for use_recompiler in [false, true] {
        let mut guest = machine(0x1000, &self_modifying());
        guest.load(0x2000, &routine()).unwrap();

        let mut cache = if use_recompiler {
            recompiler()
        } else {
            interpreter()
        };

        cache.initialize(&mut guest);
        cache.run(&mut guest);

        assert_eq!(guest.halted(), Some(Halt::Syscall));
        assert_eq!(guest.reg(reg::V0), 2);
        assert_eq!(guest.reg(reg::V1), 3);
        assert!(cache.stats().invalidations >= 1);
        assert_eq!(cache.stats().revalidations, 1);

        let routine = cache.find_block(BlockKey::new(false, 0x2000)).unwrap();
        let block = cache.block(routine).unwrap();
        assert!(!block.invalidated);
        assert_eq!(block.instructions[0].bits, asm::addiu(reg::V0, reg::ZERO, 2));
    }
}

#[test]
fn backend_failure_falls_back_to_interpreter() {
    let mut backend = ThreadedRecompiler::new();
    backend.unsupported.insert(0x1004);

    let mut guest = machine(0x1000, &straight_line());
    let mut cache = recompiler_with(backend, 1 << 16, false, Registry::default());
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.halted(), Some(Halt::Syscall));
    assert_eq!(guest.reg(reg::T1), 2);
    assert!(cache.uses_recompiler());

    let id = cache.find_block(BlockKey::new(false, 0x1000)).unwrap();
    assert!(cache.block(id).unwrap().host_code.is_none());
    assert_eq!(cache.dispatch_table().dispatch(0x1000), Entry::Compile);
    assert!(cache.host_code_index().is_empty());
    assert!(cache.page_index().is_tracked(4));
}

#[test]
fn full_buffer_is_flushed_once() {
    // A takes 17 bytes at offset 0, B needs 13 more bytes at offset 32
    let mut guest = machine(
        0x1000,
        &[
            asm::addiu(reg::T0, reg::T0, 1),
            asm::j(0x1010),
            asm::nop(),
            asm::nop(),
            asm::addiu(reg::T1, reg::ZERO, 7),
            asm::syscall(),
        ],
    );

    let mut cache = recompiler_with(ThreadedRecompiler::new(), 40, false, Registry::default());
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.halted(), Some(Halt::Syscall));
    assert_eq!(guest.reg(reg::T0), 1);
    assert_eq!(guest.reg(reg::T1), 7);
    assert!(cache.uses_recompiler());
    assert_eq!(cache.stats().flushes, 2);

    assert_eq!(cache.block_count(), 1);
    let b = cache.find_block(BlockKey::new(false, 0x1010)).unwrap();
    assert!(cache.block(b).unwrap().host_code.is_some());
    assert!(cache.block(b).unwrap().link_predecessors.is_empty());
}

#[test]
fn recompiled_code_stays_until_flush() {
    let patched = asm::addiu(reg::T1, reg::ZERO, 5);

    // the block takes 17 bytes, so its rebuild lands at offset 32
    let mut guest = machine(0x1000, &straight_line());
    let mut cache = recompiler();
    cache.initialize(&mut guest);
    cache.run(&mut guest);
    assert_eq!(cache.code_buffer().unwrap().used(), 17);

    guest.bus.write(0x1004, patched).unwrap();
    guest.reset(0x1000);
    cache.run(&mut guest);

    assert_eq!(guest.reg(reg::T1), 5);
    assert_eq!(cache.code_buffer().unwrap().used(), 49);
    assert_eq!(cache.host_code_index().len(), 1);
    assert_eq!(cache.stats().flushes, 1);

    // with no room for the rebuild, the flush reclaims the dead code
    let mut guest = machine(0x1000, &straight_line());
    let mut cache = recompiler_with(ThreadedRecompiler::new(), 40, false, Registry::default());
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    guest.bus.write(0x1004, patched).unwrap();
    guest.reset(0x1000);
    cache.run(&mut guest);

    assert_eq!(guest.reg(reg::T1), 5);
    assert!(cache.uses_recompiler());
    assert_eq!(cache.stats().flushes, 2);
    assert_eq!(cache.code_buffer().unwrap().used(), 17);
    assert_eq!(cache.block_count(), 1);
}

#[test]
fn buffer_too_small_disables_recompiler() {
    let mut guest = machine(0x1000, &straight_line());
    let mut cache = recompiler_with(ThreadedRecompiler::new(), 16, false, Registry::default());
    cache.initialize(&mut guest);
    assert!(cache.uses_recompiler());

    cache.run(&mut guest);

    assert_eq!(guest.halted(), Some(Halt::Syscall));
    assert_eq!(guest.reg(reg::T1), 2);
    assert!(!cache.uses_recompiler());
    assert_eq!(cache.stats().flushes, 2);

    let id = cache.find_block(BlockKey::new(false, 0x1000)).unwrap();
    assert!(cache.block(id).unwrap().host_code.is_none());
}

#[test]
fn uncacheable_code_is_interpreted() {
    let mut guest = machine(
        SCRATCHPAD_BASE,
        &[asm::addiu(reg::T0, reg::ZERO, 7), asm::syscall()],
    );

    let mut cache = recompiler();
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.halted(), Some(Halt::Syscall));
    assert_eq!(guest.reg(reg::T0), 7);
    assert_eq!(cache.block_count(), 0);
    assert_eq!(cache.stats().uncached_passes, 1);
    assert_eq!(cache.stats().lookups, 0);
}

#[test]
fn unmapped_code_raises_bus_error() {
    let mut guest = machine(0x1000, &[asm::j(0x0080_0000), asm::nop()]);

    let mut cache = interpreter();
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(
        guest.halted(),
        Some(Halt::BusError {
            pc: 0x0080_0000,
            addr: 0x0080_0000
        })
    );
}

#[test]
fn pending_interrupt_is_dispatched_first() {
    let mut guest = machine(0x1000, &[asm::j(0x1000), asm::nop()]);
    guest
        .load(0x80, &[asm::addiu(reg::V0, reg::ZERO, 9), asm::syscall()])
        .unwrap();
    guest.cpu.pending_interrupt = true;

    let mut cache = interpreter();
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.halted(), Some(Halt::Syscall));
    assert_eq!(guest.reg(reg::V0), 9);
    assert_eq!(guest.cpu.epc, 0x1000);
}

#[test]
fn timeslice_bounds_execution() {
    let mut guest = machine(0x1000, &[asm::addiu(reg::T0, reg::T0, 1), asm::j(0x1000), asm::nop()]);
    guest.extend_budget(99);

    let mut cache = recompiler();
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.halted(), None);
    assert_eq!(guest.cpu.retired, 99);
    assert_eq!(guest.reg(reg::T0), 33);

    guest.extend_budget(30);
    cache.run(&mut guest);
    assert_eq!(guest.reg(reg::T0), 43);
    assert_eq!(cache.stats().compiles, 1);
}

#[test]
fn block_length_is_limited() {
    let mut guest = machine(0x1000, &straight_line());
    let config = CacheConfig {
        max_block_instructions: 2,
        ..CacheConfig::default()
    };

    let mut cache = CodeCache::new(MemoryMap::default(), config);
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    assert_eq!(guest.halted(), Some(Halt::Syscall));
    let first = cache.find_block(BlockKey::new(false, 0x1000)).unwrap();
    let second = cache.find_block(BlockKey::new(false, 0x1008)).unwrap();
    assert_eq!(cache.block(first).unwrap().instructions.len(), 2);
    assert_eq!(cache.block(second).unwrap().instructions.len(), 1);
    assert_eq!(cache.block(first).unwrap().link_successors, vec![second]);
}

#[test]
fn switching_modes_flushes() {
    let mut guest = machine(0x1000, &straight_line());

    let mut cache = recompiler();
    cache.initialize(&mut guest);
    cache.run(&mut guest);
    assert_eq!(cache.block_count(), 1);

    let flushes = cache.stats().flushes;
    cache.set_use_recompiler(&mut guest, true, false);
    assert_eq!(cache.stats().flushes, flushes);

    cache.set_use_recompiler(&mut guest, false, false);
    assert!(!cache.uses_recompiler());
    assert_flushed(&cache, &guest);

    guest.reset(0x1000);
    cache.run(&mut guest);
    let id = cache.find_block(BlockKey::new(false, 0x1000)).unwrap();
    assert!(cache.block(id).unwrap().host_code.is_none());
}

#[test]
fn out_of_range_page_is_ignored() {
    let mut guest = machine(0x1000, &straight_line());
    let mut cache = interpreter();
    cache.initialize(&mut guest);
    cache.run(&mut guest);

    cache.invalidate_blocks_with_page_index(&mut guest, 1 << 20);
    cache.invalidate_address(&mut guest, 0x1F80_0000);
    assert_eq!(cache.stats().invalidations, 0);
    assert!(guest.bus.is_code_page(4));
}
