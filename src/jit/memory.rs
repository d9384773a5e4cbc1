//! Executable memory management using mmap.
//!
//! This module provides a safe abstraction over OS-level memory mapping
//! for the JIT code space, the scoped write window used while code is
//! being generated or patched, and instruction-cache maintenance.

use std::cell::Cell;
use std::ptr::NonNull;

use thiserror::Error;

/// Error type for memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory allocation of {size} bytes failed")]
    AllocationFailed { size: usize },
    #[error("memory protection change failed: {0}")]
    ProtectionFailed(&'static str),
    #[error("invalid memory size")]
    InvalidSize,
    #[error("write of {len} bytes at offset {offset} is outside the mapping")]
    OutOfBounds { offset: usize, len: usize },
}

/// Get the page size for the current system.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// Round `size` up to the next multiple of the page size.
pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// A block of memory allocated via mmap that holds generated code.
///
/// With `write_xor_execute` the mapping is never writable and executable at
/// the same time: it rests as read+execute and is flipped to read+write only
/// while a [`WriteScope`] is alive. Without it the mapping is RWX for its
/// whole lifetime and scopes are free.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    write_xor_execute: bool,
    write_depth: Cell<u32>,
}

impl ExecutableMemory {
    /// Allocate a new block of memory with the given size.
    pub fn new(size: usize, write_xor_execute: bool) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let aligned_size = round_up_to_page(size);
        let prot = if write_xor_execute {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        };
        let ptr = mmap_anonymous(aligned_size, prot)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            write_xor_execute,
            write_depth: Cell::new(0),
        })
    }

    /// Get a pointer to the memory.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get a mutable pointer to the memory. Writing through it is only
    /// valid while a [`WriteScope`] is alive.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Start address of the mapping.
    pub fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// One past the last address of the mapping.
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    /// Get the size of the allocated memory.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr` lies inside this mapping.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Whether the mapping is currently writable.
    pub fn is_writable(&self) -> bool {
        !self.write_xor_execute || self.write_depth.get() > 0
    }

    /// Open a write window over the mapping. Scopes nest; protection is
    /// restored when the outermost scope is dropped, on every exit path.
    pub fn begin_write(&self) -> Result<WriteScope<'_>, MemoryError> {
        if self.write_xor_execute && self.write_depth.get() == 0 {
            self.protect(libc::PROT_READ | libc::PROT_WRITE)?;
        }
        self.write_depth.set(self.write_depth.get() + 1);
        Ok(WriteScope { mem: self })
    }

    /// Write bytes to the memory at the given offset.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if offset.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: data.len(),
            });
        }

        let _scope = self.begin_write()?;
        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }
        flush_icache(self.start() + offset, self.start() + offset + data.len());

        Ok(())
    }

    fn protect(&self, prot: libc::c_int) -> Result<(), MemoryError> {
        let result =
            unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.size, prot) };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed("mprotect"));
        }
        Ok(())
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

/// RAII write window returned by [`ExecutableMemory::begin_write`].
pub struct WriteScope<'a> {
    mem: &'a ExecutableMemory,
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        let depth = self.mem.write_depth.get() - 1;
        self.mem.write_depth.set(depth);
        if depth == 0 && self.mem.write_xor_execute {
            if let Err(e) = self.mem.protect(libc::PROT_READ | libc::PROT_EXEC) {
                // Running on with writable code pages would break W^X.
                panic!("failed to restore executable protection: {}", e);
            }
        }
    }
}

pub(crate) fn mmap_anonymous(size: usize, prot: libc::c_int) -> Result<NonNull<u8>, MemoryError> {
    mmap_with_flags(size, prot, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)
}

pub(crate) fn mmap_with_flags(
    size: usize,
    prot: libc::c_int,
    flags: libc::c_int,
) -> Result<NonNull<u8>, MemoryError> {
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };

    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed { size });
    }

    NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed { size })
}

/// Size of the guest address space mirrored by the fastmem arena.
pub const FASTMEM_ARENA_SIZE: usize = 1 << 32;

/// A reservation covering the whole 32-bit guest address space.
///
/// Everything starts inaccessible; guest RAM regions are made readable and
/// writable in place. Any other guest address faults when generated code
/// touches it, which is what drives backpatching.
pub struct FastmemArena {
    base: NonNull<u8>,
    mapped: Vec<(u32, usize)>,
}

impl FastmemArena {
    pub fn new() -> Result<Self, MemoryError> {
        let base = mmap_with_flags(
            FASTMEM_ARENA_SIZE,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        )?;
        Ok(Self { base, mapped: Vec::new() })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Whether `host_addr` points into the reservation.
    pub fn contains(&self, host_addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        host_addr >= base && host_addr - base < FASTMEM_ARENA_SIZE
    }

    /// Make `[guest_addr, guest_addr + size)` behave as RAM.
    pub fn map_region(&mut self, guest_addr: u32, size: usize) -> Result<(), MemoryError> {
        let page = page_size();
        if size == 0 || guest_addr as usize % page != 0 || guest_addr as usize + size > FASTMEM_ARENA_SIZE {
            return Err(MemoryError::InvalidSize);
        }
        let size = round_up_to_page(size);
        let ptr = unsafe { self.base.as_ptr().add(guest_addr as usize) };
        let result = unsafe {
            libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE)
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed("mprotect"));
        }
        self.mapped.push((guest_addr, size));
        Ok(())
    }

    /// Whether `[guest_addr, guest_addr + len)` lies inside one mapped
    /// region.
    pub fn is_ram(&self, guest_addr: u32, len: usize) -> bool {
        let start = guest_addr as usize;
        self.mapped
            .iter()
            .any(|&(region, size)| start >= region as usize && start + len <= region as usize + size)
    }
}

impl Drop for FastmemArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, FASTMEM_ARENA_SIZE);
        }
    }
}

/// Make freshly written code in `[start, end)` visible to instruction fetch.
///
/// Cleans the data cache to the point of unification, invalidates the
/// instruction cache over the same lines and synchronises the pipeline.
#[cfg(target_arch = "aarch64")]
pub fn flush_icache(start: usize, end: usize) {
    use std::arch::asm;

    if start >= end {
        return;
    }

    let ctr: u64;
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
    let icache_line = 4usize << (ctr & 0xF);
    let dcache_line = 4usize << ((ctr >> 16) & 0xF);

    let mut addr = start & !(dcache_line - 1);
    while addr < end {
        unsafe { asm!("dc cvau, {}", in(reg) addr, options(nostack)) };
        addr += dcache_line;
    }
    unsafe { asm!("dsb ish", options(nostack)) };

    let mut addr = start & !(icache_line - 1);
    while addr < end {
        unsafe { asm!("ic ivau, {}", in(reg) addr, options(nostack)) };
        addr += icache_line;
    }
    unsafe { asm!("dsb ish", "isb", options(nostack)) };
}

/// Hosts with coherent instruction fetch need no maintenance.
#[cfg(not(target_arch = "aarch64"))]
pub fn flush_icache(_start: usize, _end: usize) {}
