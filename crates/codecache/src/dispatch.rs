use crate::{BlockId, MemoryMap};
use static_assertions::const_assert;

/// What the dispatcher does when control reaches a guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Look the block up, compiling it if needed, then install it in the slot.
    Compile,
    /// Run the block's host code directly.
    Block(BlockId),
}

const_assert!(size_of::<Entry>() == 8);

/// One dispatch slot per instruction word of RAM and boot ROM.
pub struct DispatchTable {
    map: MemoryMap,
    slots: Box<[Entry]>,
}

impl DispatchTable {
    pub fn new(map: &MemoryMap) -> Self {
        debug_assert!(map.ram_size.is_power_of_two());
        debug_assert!(map.bios_size.is_power_of_two());

        let len = map.ram_slots() + map.bios_slots();
        Self {
            map: map.clone(),
            slots: vec![Entry::Compile; len].into_boxed_slice(),
        }
    }

    /// Points every slot back at the compile trampoline.
    pub fn reset(&mut self) {
        self.slots.fill(Entry::Compile);
    }

    #[inline(always)]
    pub fn set_entry(&mut self, pc: u32, entry: Entry) {
        let slot = self.map.dispatch_slot(pc);
        self.slots[slot] = entry;
    }

    /// Entry to transfer control to for the instruction at `pc`. The address must be a code
    /// address.
    #[inline(always)]
    pub fn dispatch(&self, pc: u32) -> Entry {
        debug_assert!(self.map.is_code_address(pc));
        self.slots[self.map.dispatch_slot(pc)]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether every slot points at the compile trampoline.
    pub fn is_reset(&self) -> bool {
        self.slots.iter().all(|e| *e == Entry::Compile)
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let installed = self.slots.iter().filter(|e| **e != Entry::Compile).count();
        f.debug_struct("DispatchTable")
            .field("slots", &self.slots.len())
            .field("installed", &installed)
            .finish()
    }
}
