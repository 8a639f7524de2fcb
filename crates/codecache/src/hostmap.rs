use crate::BlockId;
use std::collections::BTreeMap;

/// Ordered map from the host address where a block's code starts to the block.
#[derive(Debug, Default)]
pub struct HostCodeIndex {
    starts: BTreeMap<usize, BlockId>,
}

impl HostCodeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: usize, id: BlockId) {
        self.starts.insert(addr, id);
    }

    pub fn remove(&mut self, addr: usize) -> Option<BlockId> {
        self.starts.remove(&addr)
    }

    /// Block whose code starts at or closest before `host_pc`. Callers must still check that
    /// the block's code actually covers the address.
    pub fn find(&self, host_pc: usize) -> Option<(usize, BlockId)> {
        self.starts
            .range(..=host_pc)
            .next_back()
            .map(|(addr, id)| (*addr, *id))
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn clear(&mut self) {
        self.starts.clear();
    }
}
