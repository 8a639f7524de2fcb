use bytesize::{KIB, MIB};

/// Layout of the guest address space as seen by the cache.
///
/// Only two regions hold cacheable code: main RAM, starting at physical address zero, and the
/// boot ROM. Anything else is executed uncached. Region sizes must be powers of two and RAM must
/// be a whole number of code pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    /// Mask applied to a virtual address to obtain the physical one.
    pub physical_mask: u32,
    /// Size of main RAM, in bytes.
    pub ram_size: u32,
    /// Physical base address of the boot ROM.
    pub bios_base: u32,
    /// Size of the boot ROM, in bytes.
    pub bios_size: u32,
    /// Granularity of write tracking over RAM, in bytes.
    pub code_page_size: u32,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self {
            physical_mask: 0x1FFF_FFFF,
            ram_size: (2 * MIB) as u32,
            bios_base: 0x1FC0_0000,
            bios_size: (512 * KIB) as u32,
            code_page_size: KIB as u32,
        }
    }
}

impl MemoryMap {
    #[inline(always)]
    pub fn physical(&self, addr: u32) -> u32 {
        addr & self.physical_mask
    }

    #[inline(always)]
    pub fn ram_mask(&self) -> u32 {
        self.ram_size - 1
    }

    #[inline(always)]
    pub fn bios_mask(&self) -> u32 {
        self.bios_size - 1
    }

    /// Whether the physical address is inside main RAM.
    #[inline(always)]
    pub fn is_ram(&self, phys: u32) -> bool {
        phys < self.ram_size
    }

    /// Whether the physical address is inside the boot ROM.
    #[inline(always)]
    pub fn is_bios(&self, phys: u32) -> bool {
        phys.wrapping_sub(self.bios_base) < self.bios_size
    }

    /// Whether code at the given virtual address can be cached.
    #[inline(always)]
    pub fn is_code_address(&self, addr: u32) -> bool {
        let phys = self.physical(addr);
        self.is_ram(phys) || self.is_bios(phys)
    }

    #[inline(always)]
    pub fn ram_page_count(&self) -> u32 {
        self.ram_size / self.code_page_size
    }

    /// Code page containing the given physical address, if it is in RAM.
    #[inline(always)]
    pub fn ram_page(&self, phys: u32) -> Option<u32> {
        self.is_ram(phys).then(|| phys / self.code_page_size)
    }

    #[inline(always)]
    pub fn ram_slots(&self) -> usize {
        (self.ram_size / 4) as usize
    }

    #[inline(always)]
    pub fn bios_slots(&self) -> usize {
        (self.bios_size / 4) as usize
    }

    /// Index of the dispatch slot for the instruction at `addr`.
    ///
    /// Boot ROM addresses are placed after all of RAM. Every other address is folded into RAM
    /// through the RAM mask.
    #[inline(always)]
    pub fn dispatch_slot(&self, addr: u32) -> usize {
        let phys = self.physical(addr);
        if phys >= self.bios_base {
            self.ram_slots() + ((phys & self.bios_mask()) >> 2) as usize
        } else {
            ((phys & self.ram_mask()) >> 2) as usize
        }
    }
}
