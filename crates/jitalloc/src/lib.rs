//! Bounded executable memory buffer for JITs.
//!
//! A [`CodeBuffer`] reserves a single mapping up front and hands out code allocations from it in
//! a bump fashion. Memory is never returned piecemeal: the owner either keeps allocating until
//! the buffer is exhausted or calls [`CodeBuffer::reset`] to discard everything at once.
use easyerr::{Error, ResultExt};
use std::ptr::NonNull;

#[cfg(target_family = "unix")]
use rustix::mm::{self as mman, MapFlags, MprotectFlags, ProtFlags};
#[cfg(target_family = "windows")]
use windows::Win32::System::{
    Diagnostics::Debug::FlushInstructionCache, Memory, Threading::GetCurrentProcess,
};

const REGION_MIN_LEN: usize = 1 << 16;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("cannot allocate zero bytes of code")]
    ZeroLength,
    #[error("requested {requested} bytes but only {available} bytes are available")]
    Exhausted { requested: usize, available: usize },
    #[error("address range {addr:#X}+{len} is not inside the allocated code")]
    OutOfBounds { addr: usize, len: usize },
    #[error(transparent)]
    Map { source: std::io::Error },
    #[error(transparent)]
    Protect { source: std::io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protection {
    ReadExec,
    ReadWrite,
}

/// A memory mapped region.
struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: changing the protection can be done from any thread
unsafe impl Send for Region {}

impl Region {
    fn new(len: usize) -> Result<Self, AllocError> {
        let len = len.max(REGION_MIN_LEN);

        #[cfg(target_family = "unix")]
        let region = unsafe {
            mman::mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::empty(),
                MapFlags::PRIVATE,
            )
        }
        .map_err(std::io::Error::from)
        .context(AllocCtx::Map)?;

        #[cfg(target_family = "windows")]
        let region = unsafe {
            Memory::VirtualAlloc(
                None,
                len,
                Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                Memory::PAGE_NOACCESS,
            )
        };

        let Some(ptr) = NonNull::new(region.cast::<u8>()) else {
            return Err(std::io::Error::last_os_error()).context(AllocCtx::Map);
        };

        Ok(Self { ptr, len })
    }

    /// Changes the protection of the first `length` bytes of the region.
    ///
    /// # Safety
    /// No references into the affected range may be alive if the new protection forbids the
    /// kind of access they perform.
    unsafe fn protect(&self, length: usize, protection: Protection) -> Result<(), AllocError> {
        if length == 0 {
            return Ok(());
        }

        #[cfg(target_family = "unix")]
        let result = unsafe {
            let flags = match protection {
                Protection::ReadExec => MprotectFlags::READ | MprotectFlags::EXEC,
                Protection::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
            };

            mman::mprotect(self.ptr.as_ptr().cast(), length, flags)
                .map_err(std::io::Error::from)
                .context(AllocCtx::Protect)
        };

        #[cfg(target_family = "windows")]
        let result = unsafe {
            let mut previous = Memory::PAGE_PROTECTION_FLAGS(0);
            let flags = match protection {
                Protection::ReadExec => Memory::PAGE_EXECUTE_READ,
                Protection::ReadWrite => Memory::PAGE_READWRITE,
            };

            Memory::VirtualProtect(self.ptr.as_ptr().cast(), length, flags, &raw mut previous)
                .map_err(|_| std::io::Error::last_os_error())
                .context(AllocCtx::Protect)
        };

        result
    }

    #[cfg_attr(target_family = "unix", allow(unused_variables))]
    fn flush_icache(&self, start: *const u8, len: usize) {
        #[cfg(target_family = "windows")]
        unsafe {
            let process = GetCurrentProcess();
            _ = FlushInstructionCache(process, Some(start.cast()), len);
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        #[cfg(target_family = "unix")]
        unsafe {
            _ = mman::munmap(self.ptr.as_ptr().cast(), self.len);
        }

        #[cfg(target_family = "windows")]
        unsafe {
            _ = Memory::VirtualFree(self.ptr.as_ptr().cast(), 0, Memory::MEM_RELEASE);
        }
    }
}

/// A chunk of code inside a [`CodeBuffer`].
///
/// Allocations stay valid until the buffer they came from is reset or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    addr: usize,
    len: usize,
}

impl Allocation {
    /// Host address of the first byte of the allocation.
    #[inline(always)]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Length of the allocation, in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns a pointer to the allocation.
    ///
    /// # Safety
    /// The buffer this allocation comes from must not be reset, patched or dropped while the
    /// pointer is being used.
    #[inline(always)]
    pub unsafe fn as_ptr(&self) -> NonNull<[u8]> {
        let ptr = NonNull::new(std::ptr::with_exposed_provenance_mut::<u8>(self.addr))
            .unwrap_or(NonNull::dangling());

        NonNull::slice_from_raw_parts(ptr, self.len)
    }
}

/// A fixed capacity buffer of executable memory.
pub struct CodeBuffer {
    region: Region,
    /// Usable capacity, which might be smaller than the mapping.
    capacity: usize,
    /// Offset of the first free byte.
    offset: usize,
}

impl CodeBuffer {
    /// Maps a new buffer able to hold `capacity` bytes of code.
    pub fn new(capacity: usize) -> Result<Self, AllocError> {
        let region = Region::new(capacity)?;
        _ = region.ptr.as_ptr().expose_provenance();

        Ok(Self {
            region,
            capacity,
            offset: 0,
        })
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Amount of bytes currently handed out, including alignment padding.
    #[inline(always)]
    pub fn used(&self) -> usize {
        self.offset
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.capacity - self.offset
    }

    /// Host address of the start of the buffer.
    #[inline(always)]
    pub fn base(&self) -> usize {
        self.region.ptr.as_ptr().addr()
    }

    /// Whether `addr` lies inside code allocated from this buffer.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        (self.base()..self.base() + self.offset).contains(&addr)
    }

    /// Copies `data` into the buffer and makes it executable.
    pub fn allocate(&mut self, alignment: usize, data: &[u8]) -> Result<Allocation, AllocError> {
        if data.is_empty() {
            return Err(AllocError::ZeroLength);
        }

        let alignment = alignment.max(1).next_power_of_two();
        let start = self.offset.next_multiple_of(alignment);
        let available = self.capacity.saturating_sub(start);
        if available < data.len() {
            return Err(AllocError::Exhausted {
                requested: data.len(),
                available,
            });
        }

        let end = start + data.len();
        unsafe {
            self.region.protect(end, Protection::ReadWrite)?;
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.region.ptr.as_ptr().add(start),
                data.len(),
            );
            self.region.protect(end, Protection::ReadExec)?;
        }

        self.offset = end;
        let addr = self.base() + start;
        self.region.flush_icache(self.region.ptr.as_ptr().wrapping_add(start), data.len());

        Ok(Allocation {
            addr,
            len: data.len(),
        })
    }

    /// Overwrites already allocated code at `addr` with `data`.
    pub fn patch(&mut self, addr: usize, data: &[u8]) -> Result<(), AllocError> {
        let start = self.checked_offset(addr, data.len())?;

        unsafe {
            self.region.protect(self.offset, Protection::ReadWrite)?;
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.region.ptr.as_ptr().add(start),
                data.len(),
            );
            self.region.protect(self.offset, Protection::ReadExec)?;
        }

        self.region.flush_icache(self.region.ptr.as_ptr().wrapping_add(start), data.len());
        Ok(())
    }

    /// Reads back `len` bytes of allocated code at `addr`.
    pub fn bytes(&self, addr: usize, len: usize) -> Option<&[u8]> {
        let start = self.checked_offset(addr, len).ok()?;

        // SAFETY: the range is inside the allocated prefix, which is always readable
        Some(unsafe { std::slice::from_raw_parts(self.region.ptr.as_ptr().add(start), len) })
    }

    /// Discards every allocation. Previously returned [`Allocation`]s must no longer be used.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    fn checked_offset(&self, addr: usize, len: usize) -> Result<usize, AllocError> {
        let start = addr.wrapping_sub(self.base());
        if addr < self.base() || start.saturating_add(len) > self.offset {
            return Err(AllocError::OutOfBounds { addr, len });
        }

        Ok(start)
    }
}

impl std::fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBuffer")
            .field("base", &format_args!("{:#X}", self.base()))
            .field("capacity", &self.capacity)
            .field("used", &self.offset)
            .finish()
    }
}
