use bitvec::vec::BitVec;
use codecache::MemoryMap;
use std::ops::Range;

pub const SCRATCHPAD_BASE: u32 = 0x1F80_0000;
pub const SCRATCHPAD_LEN: u32 = 0x400;

/// Memory of the toy machine: RAM, boot ROM and a small scratchpad.
///
/// Writes to RAM pages marked as code pages are queued for the cache to pick up.
pub struct Bus {
    map: MemoryMap,
    ram: Box<[u8]>,
    bios: Box<[u8]>,
    scratchpad: Box<[u8]>,
    code_pages: BitVec,
    code_writes: Vec<u32>,
    fastmem: bool,
}

enum Target {
    Ram(usize),
    Bios(usize),
    Scratchpad(usize),
}

impl Bus {
    pub fn new(map: MemoryMap) -> Self {
        Self {
            ram: vec![0; map.ram_size as usize].into_boxed_slice(),
            bios: vec![0; map.bios_size as usize].into_boxed_slice(),
            scratchpad: vec![0; SCRATCHPAD_LEN as usize].into_boxed_slice(),
            code_pages: BitVec::repeat(false, map.ram_page_count() as usize),
            code_writes: Vec::new(),
            fastmem: false,
            map,
        }
    }

    #[inline(always)]
    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    fn target(&self, addr: u32) -> Option<Target> {
        let phys = self.map.physical(addr);
        if self.map.is_ram(phys) {
            Some(Target::Ram(phys as usize))
        } else if self.map.is_bios(phys) {
            Some(Target::Bios((phys - self.map.bios_base) as usize))
        } else if (SCRATCHPAD_BASE..SCRATCHPAD_BASE + SCRATCHPAD_LEN).contains(&phys) {
            Some(Target::Scratchpad((phys - SCRATCHPAD_BASE) as usize))
        } else {
            None
        }
    }

    /// Reads an aligned word. Returns `None` on unmapped or misaligned addresses.
    pub fn read(&self, addr: u32) -> Option<u32> {
        if !addr.is_multiple_of(4) {
            return None;
        }

        let (memory, offset) = match self.target(addr)? {
            Target::Ram(offset) => (&self.ram, offset),
            Target::Bios(offset) => (&self.bios, offset),
            Target::Scratchpad(offset) => (&self.scratchpad, offset),
        };

        let bytes = memory.get(offset..offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Writes an aligned word as the guest would. The boot ROM is read only.
    pub fn write(&mut self, addr: u32, value: u32) -> Option<()> {
        if !addr.is_multiple_of(4) {
            return None;
        }

        let word = match self.target(addr)? {
            Target::Ram(offset) => {
                self.note_ram_write(offset as u32);
                self.ram.get_mut(offset..offset + 4)?
            }
            Target::Scratchpad(offset) => self.scratchpad.get_mut(offset..offset + 4)?,
            Target::Bios(_) => return None,
        };

        word.copy_from_slice(&value.to_le_bytes());
        Some(())
    }

    /// Writes a word anywhere, including the boot ROM.
    pub fn poke(&mut self, addr: u32, value: u32) -> Option<()> {
        if let Some(Target::Bios(offset)) = self.target(addr) {
            if !addr.is_multiple_of(4) {
                return None;
            }

            self.bios
                .get_mut(offset..offset + 4)?
                .copy_from_slice(&value.to_le_bytes());
            return Some(());
        }

        self.write(addr, value)
    }

    fn note_ram_write(&mut self, phys: u32) {
        let page = phys / self.map.code_page_size;
        if self.code_pages[page as usize] && self.code_writes.last() != Some(&page) {
            self.code_writes.push(page);
        }
    }

    pub fn set_code_page(&mut self, page: u32, tracked: bool) {
        if let Some(mut bit) = self.code_pages.get_mut(page as usize) {
            *bit = tracked;
        }
    }

    pub fn clear_code_pages(&mut self) {
        self.code_pages.fill(false);
    }

    pub fn is_code_page(&self, page: u32) -> bool {
        self.code_pages.get(page as usize).is_some_and(|bit| *bit)
    }

    pub fn code_page_count(&self) -> usize {
        self.code_pages.count_ones()
    }

    pub fn drain_code_writes(&mut self, pages: &mut Vec<u32>) {
        pages.append(&mut self.code_writes);
    }

    pub fn set_fastmem(&mut self, enabled: bool) {
        self.fastmem = enabled;
    }

    /// Host addresses of RAM, while fastmem is enabled.
    pub fn fastmem_view(&self) -> Option<Range<usize>> {
        let start = self.ram.as_ptr().addr();
        self.fastmem.then(|| start..start + self.ram.len())
    }
}
