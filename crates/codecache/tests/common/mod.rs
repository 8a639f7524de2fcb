#![allow(dead_code)]

use codecache::jitalloc::CodeBuffer;
use codecache::{CacheConfig, CodeCache, FaultHandlerRegistry, MemoryMap, RegistryError};
use std::cell::Cell;
use std::rc::Rc;
use toymips::{Machine, ThreadedRecompiler};

/// Fault handler registry that only records whether it is installed.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    pub installed: Rc<Cell<bool>>,
    pub fail: bool,
}

impl FaultHandlerRegistry for Registry {
    fn install(&mut self) -> Result<(), RegistryError> {
        if self.fail {
            return Err(RegistryError::Os {
                source: std::io::Error::other("fault handlers are unavailable"),
            });
        }

        if self.installed.replace(true) {
            return Err(RegistryError::AlreadyInstalled);
        }

        Ok(())
    }

    fn remove(&mut self) {
        self.installed.set(false);
    }
}

pub fn machine(entry: u32, program: &[u32]) -> Machine {
    let mut machine = Machine::new(MemoryMap::default());
    machine.load(entry, program).unwrap();
    machine.reset(entry);
    machine
}

pub fn interpreter() -> CodeCache<Machine> {
    CodeCache::new(MemoryMap::default(), CacheConfig::default())
}

pub fn recompiler_with(
    backend: ThreadedRecompiler,
    capacity: usize,
    fastmem: bool,
    registry: Registry,
) -> CodeCache<Machine> {
    let config = CacheConfig {
        use_recompiler: true,
        fastmem,
        ..CacheConfig::default()
    };

    CodeCache::new(MemoryMap::default(), config)
        .with_recompiler(Box::new(backend), CodeBuffer::new(capacity).unwrap())
        .with_fault_handler(Box::new(registry))
}

pub fn recompiler() -> CodeCache<Machine> {
    recompiler_with(
        ThreadedRecompiler::new(),
        1 << 16,
        false,
        Registry::default(),
    )
}

/// Asserts the cache is in the state right after a flush.
pub fn assert_flushed(cache: &CodeCache<Machine>, guest: &Machine) {
    assert_eq!(cache.block_count(), 0);
    assert!(cache.host_code_index().is_empty());
    assert!(cache.dispatch_table().is_reset());
    assert_eq!(cache.page_index().tracked_pages().count(), 0);
    assert_eq!(guest.bus.code_page_count(), 0);
    if let Some(buffer) = cache.code_buffer() {
        assert_eq!(buffer.used(), 0);
    }
}
