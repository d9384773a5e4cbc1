//! Code buffer for building JIT code.
//!
//! A `CodeBuffer` is a cursor and an end pointer into a writable region.
//! The region is either owned heap memory (used for sizing passes and
//! tests) or a window into the executable code space. The cursor never
//! passes the end: a write that does not fit clamps the cursor to the end
//! and raises a sticky failure flag that the compiler checks once a block
//! is finished.

use super::memory::flush_icache;

/// Narrow "append one word" capability shared by the integer and the
/// floating-point emitters.
pub trait CodeSink {
    /// Append one instruction word at the cursor.
    fn write_u32(&mut self, word: u32);
    /// Absolute address of the cursor.
    fn code_ptr(&self) -> usize;
}

/// A buffer for building machine code.
pub struct CodeBuffer {
    /// Heap backing when the buffer owns its region.
    storage: Option<Box<[u32]>>,
    region_start: usize,
    region_end: usize,
    /// Cursor (absolute address).
    code: usize,
    /// Writes may not reach this address.
    code_end: usize,
    write_failed: bool,
    last_flush_end: usize,
}

impl CodeBuffer {
    /// Create a heap-backed buffer with room for `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let words = capacity / 4;
        let storage = vec![0u32; words].into_boxed_slice();
        let start = storage.as_ptr() as usize;
        let end = start + words * 4;
        Self {
            storage: Some(storage),
            region_start: start,
            region_end: end,
            code: start,
            code_end: end,
            write_failed: false,
            last_flush_end: start,
        }
    }

    /// Create a buffer over an externally owned region.
    ///
    /// # Safety
    /// `ptr..ptr+len` must stay mapped for the lifetime of the buffer and
    /// must be writable whenever the buffer is written to.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        let start = ptr as usize;
        debug_assert!(start % 4 == 0, "code region must be word aligned");
        Self {
            storage: None,
            region_start: start,
            region_end: start + len,
            code: start,
            code_end: start + len,
            write_failed: false,
            last_flush_end: start,
        }
    }

    /// Whether the buffer owns heap storage.
    pub fn is_heap_backed(&self) -> bool {
        self.storage.is_some()
    }

    pub fn region_start(&self) -> usize {
        self.region_start
    }

    pub fn region_end(&self) -> usize {
        self.region_end
    }

    /// Get the current cursor address.
    pub fn code_ptr(&self) -> usize {
        self.code
    }

    /// Get the current end address.
    pub fn code_end(&self) -> usize {
        self.code_end
    }

    /// Bytes left before the end pointer.
    pub fn space_left(&self) -> usize {
        self.code_end - self.code
    }

    /// Bytes written since the start of the region.
    pub fn len(&self) -> usize {
        self.code - self.region_start
    }

    pub fn is_empty(&self) -> bool {
        self.code == self.region_start
    }

    /// Whether any write has been refused since the last `set_code_ptr`.
    pub fn has_write_failed(&self) -> bool {
        self.write_failed
    }

    /// Whether `addr` lies in the buffer's region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.region_start && addr < self.region_end
    }

    /// Move the cursor to `ptr` with the end at `end` and reset the flush
    /// watermark.
    pub fn set_code_ptr(&mut self, ptr: usize, end: usize, write_failed: bool) {
        self.set_code_ptr_unsafe(ptr, end, write_failed);
        self.last_flush_end = ptr;
    }

    /// Move the cursor without touching the flush watermark. Used for
    /// rewinding inside an emission sequence.
    pub fn set_code_ptr_unsafe(&mut self, ptr: usize, end: usize, write_failed: bool) {
        assert!(
            ptr >= self.region_start && end <= self.region_end && ptr <= end,
            "code pointer {:#x}..{:#x} outside region {:#x}..{:#x}",
            ptr,
            end,
            self.region_start,
            self.region_end
        );
        self.code = ptr;
        self.code_end = end;
        self.write_failed = write_failed;
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        if self.code + 4 > self.code_end {
            self.code = self.code_end;
            self.write_failed = true;
            return;
        }

        unsafe { std::ptr::write_unaligned(self.code as *mut u32, value) };
        self.code += 4;
    }

    /// Read back the word at `addr`.
    pub fn read_u32(&self, addr: usize) -> u32 {
        assert!(
            addr >= self.region_start && addr + 4 <= self.region_end,
            "read at {:#x} outside code region",
            addr
        );
        unsafe { std::ptr::read_unaligned(addr as *const u32) }
    }

    /// Overwrite the word at `addr` without moving the cursor.
    pub fn patch_u32(&mut self, addr: usize, value: u32) {
        assert!(
            addr >= self.region_start && addr + 4 <= self.region_end,
            "patch at {:#x} outside code region",
            addr
        );
        unsafe { std::ptr::write_unaligned(addr as *mut u32, value) };
    }

    /// All words between `start` and `end`.
    pub fn words(&self, start: usize, end: usize) -> Vec<u32> {
        (start..end).step_by(4).map(|a| self.read_u32(a)).collect()
    }

    /// Get the code bytes written so far (for inspection).
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.region_start as *const u8, self.len()) }
    }

    /// Flush the instruction cache over everything written since the last
    /// flush.
    pub fn flush_icache(&mut self) {
        flush_icache(self.last_flush_end, self.code);
        self.last_flush_end = self.code;
    }
}

impl CodeSink for CodeBuffer {
    fn write_u32(&mut self, word: u32) {
        self.emit_u32(word);
    }

    fn code_ptr(&self) -> usize {
        self.code
    }
}
