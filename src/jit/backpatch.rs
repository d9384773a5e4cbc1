//! Guest memory accesses and fault-driven backpatching.
//!
//! Loads and stores are first emitted as a plain host access into the
//! fastmem arena (`[MEM_REG, Waddr, UXTW]`). If the address turns out not to
//! be backed by RAM the access faults, the fault handler finds the access in
//! the fault table and rewrites it into a call to a slow path that was
//! emitted into far code alongside it.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Bound, BitOr};

use tracing::debug;

use super::aarch64::{Arm64Emitter, IndexReg, Reg, RegisterMove};
use super::bitset::BitSet32;
use super::memory::flush_icache;
use super::regs::{FP_SCRATCH, MEM_REG, SCRATCH};

/// Shape of one guest memory access.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOAD: Self = Self(1 << 0);
    pub const STORE: Self = Self(1 << 1);
    pub const SIZE_8: Self = Self(1 << 2);
    pub const SIZE_16: Self = Self(1 << 3);
    pub const SIZE_32: Self = Self(1 << 4);
    pub const SIZE_64: Self = Self(1 << 5);
    /// Data lives in an S or D register.
    pub const FLOAT: Self = Self(1 << 6);
    /// Sign-extend 8/16-bit loads.
    pub const EXTEND: Self = Self(1 << 7);
    /// Access memory in host byte order (`lwbrx` and friends).
    pub const REVERSE: Self = Self(1 << 8);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_store(self) -> bool {
        self.contains(Self::STORE)
    }

    pub fn is_float(self) -> bool {
        self.contains(Self::FLOAT)
    }

    pub fn size_bits(self) -> u32 {
        if self.contains(Self::SIZE_8) {
            8
        } else if self.contains(Self::SIZE_16) {
            16
        } else if self.contains(Self::SIZE_32) {
            32
        } else {
            64
        }
    }

    /// Panics on combinations no guest instruction produces.
    pub fn validate(self) {
        assert!(
            self.contains(Self::LOAD) != self.contains(Self::STORE),
            "{self:?}: exactly one of LOAD and STORE"
        );
        let sizes = (self.0 >> 2) & 0xF;
        assert!(sizes.count_ones() == 1, "{self:?}: exactly one size");
        if self.is_float() {
            assert!(self.size_bits() >= 32, "{self:?}: float accesses are 32 or 64 bits");
        }
        if self.contains(Self::EXTEND) {
            assert!(
                !self.is_store() && !self.is_float() && self.size_bits() <= 16,
                "{self:?}: only narrow integer loads extend"
            );
        }
    }
}

impl BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 9] = ["LOAD", "STORE", "SIZE_8", "SIZE_16", "SIZE_32", "SIZE_64", "FLOAT", "EXTEND", "REVERSE"];
        let names: Vec<&str> = NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.0 & (1 << i) != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "AccessFlags({})", names.join(" | "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemAccessMode {
    /// The address is known to be RAM: emit only the inline access.
    AlwaysFastAccess,
    /// The address is known not to be RAM: emit only the call.
    AlwaysSlowAccess,
    /// Emit the inline access and register it for backpatching.
    #[default]
    Auto,
}

/// Guest memory routines called by slow paths.
///
/// Reads return the value as the guest sees it, zero-extended to the
/// return width. Writes take the value first and the address second.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCallbacks {
    pub read_u8: extern "C" fn(u32) -> u32,
    pub read_u16: extern "C" fn(u32) -> u32,
    pub read_u32: extern "C" fn(u32) -> u32,
    pub read_u64: extern "C" fn(u32) -> u64,
    pub write_u8: extern "C" fn(u32, u32),
    pub write_u16: extern "C" fn(u32, u32),
    pub write_u32: extern "C" fn(u32, u32),
    pub write_u64: extern "C" fn(u64, u32),
}

impl MemoryCallbacks {
    fn address_for(&self, flags: AccessFlags) -> usize {
        match (flags.is_store(), flags.size_bits()) {
            (false, 8) => self.read_u8 as usize,
            (false, 16) => self.read_u16 as usize,
            (false, 32) => self.read_u32 as usize,
            (false, _) => self.read_u64 as usize,
            (true, 8) => self.write_u8 as usize,
            (true, 16) => self.write_u16 as usize,
            (true, 32) => self.write_u32 as usize,
            (true, _) => self.write_u64 as usize,
        }
    }
}

/// A fast access that may fault, and where to send it when it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRegion {
    pub start: usize,
    pub end: usize,
    pub slow_entry: usize,
    pub gprs: BitSet32,
    pub fprs: BitSet32,
    pub flags: AccessFlags,
}

/// Fault regions keyed by the end address of their fast span.
#[derive(Debug, Default)]
pub struct FaultTable {
    regions: BTreeMap<usize, FaultRegion>,
}

impl FaultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn insert(&mut self, region: FaultRegion) {
        debug_assert!(region.start < region.end);
        self.regions.insert(region.end, region);
    }

    /// The region whose fast span contains `pc`: the first entry ending
    /// after `pc`, provided it also starts at or before it.
    pub fn lookup(&self, pc: usize) -> Option<&FaultRegion> {
        self.regions
            .range((Bound::Excluded(pc), Bound::Unbounded))
            .next()
            .map(|(_, region)| region)
            .filter(|region| region.start <= pc)
    }

    pub fn remove(&mut self, end: usize) -> Option<FaultRegion> {
        self.regions.remove(&end)
    }

    /// Drop every region whose fast span lies inside `[start, end)`.
    pub fn remove_range(&mut self, start: usize, end: usize) {
        let ends: Vec<usize> = self
            .regions
            .range((Bound::Excluded(start), Bound::Included(end)))
            .filter(|(_, region)| region.start >= start)
            .map(|(&end, _)| end)
            .collect();
        for end in ends {
            self.regions.remove(&end);
        }
    }
}

/// Emits guest memory accesses and repairs faulting ones.
pub struct Backpatcher {
    faults: FaultTable,
    callbacks: MemoryCallbacks,
    fastmem: bool,
}

impl Backpatcher {
    pub fn new(callbacks: MemoryCallbacks, fastmem: bool) -> Self {
        Self { faults: FaultTable::new(), callbacks, fastmem }
    }

    pub fn callbacks(&self) -> &MemoryCallbacks {
        &self.callbacks
    }

    pub fn faults(&self) -> &FaultTable {
        &self.faults
    }

    pub fn faults_mut(&mut self) -> &mut FaultTable {
        &mut self.faults
    }

    /// Emit one guest access of shape `flags` between `data` and the guest
    /// address in `addr`.
    ///
    /// `gprs` and `fprs` are the host registers a slow path must preserve.
    /// With fastmem disabled `Auto` degrades to `AlwaysSlowAccess`.
    #[allow(clippy::too_many_arguments)]
    pub fn emit_backpatch_routine(
        &mut self,
        near: &mut Arm64Emitter,
        far: &mut Arm64Emitter,
        flags: AccessFlags,
        mode: MemAccessMode,
        data: Reg,
        addr: Reg,
        gprs: BitSet32,
        fprs: BitSet32,
    ) {
        flags.validate();
        let mode = match mode {
            MemAccessMode::Auto if !self.fastmem => MemAccessMode::AlwaysSlowAccess,
            mode => mode,
        };
        match mode {
            MemAccessMode::AlwaysFastAccess => emit_fast_access(near, flags, data, addr),
            MemAccessMode::AlwaysSlowAccess => {
                emit_slow_access(near, &self.callbacks, flags, data, addr, gprs, fprs);
            }
            MemAccessMode::Auto => {
                let start = near.code_ptr();
                emit_fast_access(near, flags, data, addr);
                let end = near.code_ptr();

                // Entered with BL from the patched span, so LR is saved too.
                let slow_entry = far.code_ptr();
                let mut saved = gprs;
                saved.insert(SCRATCH.num() as u32);
                emit_slow_access(far, &self.callbacks, flags, data, addr, saved, fprs);
                far.ret();

                self.faults.insert(FaultRegion { start, end, slow_entry, gprs, fprs, flags });
            }
        }
    }

    /// Rewrite the fast access containing `pc` into a call of its slow
    /// path. Returns the address to resume at, or `None` when `pc` is not
    /// inside any registered access.
    ///
    /// The caller must hold the code space writable.
    pub fn handle_fastmem_fault(&mut self, code: &mut Arm64Emitter, pc: usize) -> Option<usize> {
        let region = *self.faults.lookup(pc)?;

        let saved = (code.code_ptr(), code.buffer().code_end(), code.has_write_failed());
        code.buffer_mut().set_code_ptr_unsafe(region.start, region.end, false);
        code.bl(region.slow_entry);
        while code.code_ptr() < region.end {
            code.nop();
        }
        code.buffer_mut().set_code_ptr_unsafe(saved.0, saved.1, saved.2);
        flush_icache(region.start, region.end);

        self.faults.remove(region.end);
        debug!(
            pc = format_args!("{pc:#x}"),
            start = format_args!("{:#x}", region.start),
            slow = format_args!("{:#x}", region.slow_entry),
            flags = ?region.flags,
            "backpatched fastmem access"
        );
        Some(region.start)
    }
}

fn sized(reg: Reg, flags: AccessFlags) -> Reg {
    if flags.size_bits() == 64 { reg.to_64() } else { reg.to_32() }
}

/// The inline access. Guest memory is big-endian, so data is byte-swapped
/// unless `REVERSE` asks for host order.
pub fn emit_fast_access(emit: &mut Arm64Emitter, flags: AccessFlags, data: Reg, addr: Reg) {
    let index = IndexReg::uxtw(addr);
    let size = flags.size_bits();
    let swap = !flags.contains(AccessFlags::REVERSE);

    if flags.is_float() {
        if flags.is_store() {
            let value = if swap {
                let tmp = if size == 64 { FP_SCRATCH.to_64() } else { FP_SCRATCH.to_32() };
                if size == 64 {
                    emit.float().rev64(tmp, data);
                } else {
                    emit.float().rev32(tmp, data);
                }
                tmp
            } else {
                data
            };
            emit.str_reg(value, MEM_REG, index);
        } else {
            emit.ldr_reg(data, MEM_REG, index);
            if swap {
                if size == 64 {
                    emit.float().rev64(data, data);
                } else {
                    emit.float().rev32(data, data);
                }
            }
        }
        return;
    }

    let data = sized(data, flags);
    if flags.is_store() {
        let value = if swap && size > 8 {
            let tmp = sized(SCRATCH, flags);
            if size == 16 {
                emit.rev16(tmp, data);
            } else {
                emit.rev(tmp, data);
            }
            tmp
        } else {
            data
        };
        match size {
            8 => emit.strb_reg(value, MEM_REG, index),
            16 => emit.strh_reg(value, MEM_REG, index),
            _ => emit.str_reg(value, MEM_REG, index),
        }
    } else {
        match size {
            8 => emit.ldrb_reg(data, MEM_REG, index),
            16 => emit.ldrh_reg(data, MEM_REG, index),
            _ => emit.ldr_reg(data, MEM_REG, index),
        }
        if swap {
            match size {
                16 => emit.rev16(data, data),
                32 | 64 => emit.rev(data, data),
                _ => {}
            }
        }
        if flags.contains(AccessFlags::EXTEND) {
            if size == 8 {
                emit.sxtb(data, data);
            } else {
                emit.sxth(data, data);
            }
        }
    }
}

/// A call to the guest memory routine for `flags`, preserving `gprs` and
/// `fprs` (minus the loaded register).
pub fn emit_slow_access(
    emit: &mut Arm64Emitter,
    callbacks: &MemoryCallbacks,
    flags: AccessFlags,
    data: Reg,
    addr: Reg,
    gprs: BitSet32,
    fprs: BitSet32,
) {
    let (mut gprs, mut fprs) = (gprs, fprs);
    if !flags.is_store() {
        if flags.is_float() {
            fprs.remove(data.num() as u32);
        } else {
            gprs.remove(data.num() as u32);
        }
    }
    emit.abi_push_registers(gprs);
    emit.abi_push_fp_registers(fprs);

    let size = flags.size_bits();
    let result = sized(Reg::X0, flags);
    let reverse = flags.contains(AccessFlags::REVERSE);
    let swap_result = |emit: &mut Arm64Emitter| match size {
        16 => emit.rev16(result, result),
        32 | 64 => emit.rev(result, result),
        _ => {}
    };

    if flags.is_store() {
        if flags.is_float() {
            if addr.num() != 1 {
                emit.mov(Reg::W1, addr.to_32());
            }
            emit.float().fmov_to_gpr(result, data);
        } else {
            emit.parallel_moves(&[
                RegisterMove::new(result, sized(data, flags)),
                RegisterMove::new(Reg::W1, addr.to_32()),
            ]);
        }
        if reverse {
            swap_result(emit);
        }
        emit.quick_call_function(callbacks.address_for(flags), Reg::X8);
    } else {
        if addr.num() != 0 {
            emit.mov(Reg::W0, addr.to_32());
        }
        emit.quick_call_function(callbacks.address_for(flags), Reg::X8);
        if reverse {
            swap_result(emit);
        }
        if flags.is_float() {
            emit.float().fmov_from_gpr(data, result);
        } else if flags.contains(AccessFlags::EXTEND) {
            if size == 8 {
                emit.sxtb(data.to_32(), result);
            } else {
                emit.sxth(data.to_32(), result);
            }
        } else if data.num() != 0 {
            emit.mov(sized(data, flags), result);
        }
    }

    emit.abi_pop_fp_registers(fprs);
    emit.abi_pop_registers(gprs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::aarch64::branch_target;
    use crate::jit::codebuf::CodeBuffer;
    use crate::jit::memory::ExecutableMemory;

    extern "C" fn read8(_: u32) -> u32 {
        0
    }
    extern "C" fn read16(_: u32) -> u32 {
        0
    }
    extern "C" fn read32(_: u32) -> u32 {
        0
    }
    extern "C" fn read64(_: u32) -> u64 {
        0
    }
    extern "C" fn write32(_: u32, _: u32) {}
    extern "C" fn write64(_: u64, _: u32) {}

    fn callbacks() -> MemoryCallbacks {
        MemoryCallbacks {
            read_u8: read8,
            read_u16: read16,
            read_u32: read32,
            read_u64: read64,
            write_u8: write32,
            write_u16: write32,
            write_u32: write32,
            write_u64: write64,
        }
    }

    /// Near and far emitters over the two halves of one mapping.
    fn near_far(mem: &ExecutableMemory) -> (Arm64Emitter, Arm64Emitter) {
        let half = mem.size() / 2;
        let near = unsafe { CodeBuffer::from_raw(mem.as_mut_ptr(), mem.size()) };
        let mut far = unsafe { CodeBuffer::from_raw(mem.as_mut_ptr(), mem.size()) };
        far.set_code_ptr(mem.start() + half, mem.end(), false);
        (Arm64Emitter::new(near), Arm64Emitter::new(far))
    }

    fn load32() -> AccessFlags {
        AccessFlags::LOAD | AccessFlags::SIZE_32
    }

    #[test]
    fn test_fast_load_swaps() {
        let mut e = Arm64Emitter::with_capacity(64);
        let start = e.code_ptr();
        emit_fast_access(&mut e, load32(), Reg::W19, Reg::W20);
        let words = e.buffer().words(start, e.code_ptr());
        // LDR W19, [X28, W20, UXTW]; REV W19, W19
        assert_eq!(words, vec![0xB8744B93, 0x5AC00A73]);
    }

    #[test]
    fn test_fast_store_swaps_through_scratch() {
        let mut e = Arm64Emitter::with_capacity(64);
        let start = e.code_ptr();
        emit_fast_access(&mut e, AccessFlags::STORE | AccessFlags::SIZE_32, Reg::W19, Reg::W20);
        let words = e.buffer().words(start, e.code_ptr());
        // REV W30, W19; STR W30, [X28, W20, UXTW]
        assert_eq!(words, vec![0x5AC00A7E, 0xB8344B9E]);
    }

    #[test]
    fn test_fast_byte_load_extends() {
        let mut e = Arm64Emitter::with_capacity(64);
        let start = e.code_ptr();
        emit_fast_access(&mut e, AccessFlags::LOAD | AccessFlags::SIZE_8 | AccessFlags::EXTEND, Reg::W6, Reg::W7);
        let words = e.buffer().words(start, e.code_ptr());
        // LDRB W6, [X28, W7, UXTW]; SXTB W6, W6
        assert_eq!(words, vec![0x38674B86, 0x13001CC6]);
    }

    #[test]
    #[should_panic(expected = "exactly one size")]
    fn test_flags_need_a_size() {
        AccessFlags::LOAD.validate();
    }

    #[test]
    fn test_fault_lookup_is_by_end() {
        let mut table = FaultTable::new();
        let region = |start, end| FaultRegion {
            start,
            end,
            slow_entry: 0,
            gprs: BitSet32::new(),
            fprs: BitSet32::new(),
            flags: load32(),
        };
        table.insert(region(0x100, 0x108));
        table.insert(region(0x200, 0x208));
        assert_eq!(table.lookup(0x104).map(|r| r.start), Some(0x100));
        assert_eq!(table.lookup(0x100).map(|r| r.start), Some(0x100));
        // Past the end of the first span and before the start of the next.
        assert!(table.lookup(0x108).is_none());
        assert!(table.lookup(0x300).is_none());
        table.remove_range(0x1F0, 0x300);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_auto_registers_fault_region() {
        let mem = ExecutableMemory::new(8192, false).unwrap();
        let (mut near, mut far) = near_far(&mem);
        let mut bp = Backpatcher::new(callbacks(), true);
        let start = near.code_ptr();
        bp.emit_backpatch_routine(
            &mut near,
            &mut far,
            load32(),
            MemAccessMode::Auto,
            Reg::W19,
            Reg::W20,
            BitSet32::from_bits(1 << 6),
            BitSet32::new(),
        );
        let region = *bp.faults().lookup(start).unwrap();
        assert_eq!(region.end, near.code_ptr());
        assert_eq!(region.slow_entry, mem.start() + mem.size() / 2);
        // The slow path returns to the patched site.
        assert_eq!(far.buffer().read_u32(far.code_ptr() - 4), 0xD65F03C0);
    }

    #[test]
    fn test_fault_patches_once() {
        let mem = ExecutableMemory::new(8192, false).unwrap();
        let (mut near, mut far) = near_far(&mem);
        let mut bp = Backpatcher::new(callbacks(), true);
        let start = near.code_ptr();
        bp.emit_backpatch_routine(
            &mut near,
            &mut far,
            AccessFlags::LOAD | AccessFlags::SIZE_16 | AccessFlags::EXTEND,
            MemAccessMode::Auto,
            Reg::W19,
            Reg::W20,
            BitSet32::new(),
            BitSet32::new(),
        );
        let end = near.code_ptr();
        let slow = bp.faults().lookup(start).unwrap().slow_entry;

        assert_eq!(bp.handle_fastmem_fault(&mut near, start), Some(start));
        let words = near.buffer().words(start, end);
        assert_eq!(words[0] & 0xFC000000, 0x94000000);
        assert_eq!(branch_target(words[0], start), Some(slow));
        assert!(words[1..].iter().all(|&w| w == 0xD503201F));
        // The cursor is where it was.
        assert_eq!(near.code_ptr(), end);

        // The site is gone from the table.
        assert!(bp.faults().is_empty());
        assert_eq!(bp.handle_fastmem_fault(&mut near, start), None);
    }

    #[test]
    fn test_fastmem_off_calls_directly() {
        let mem = ExecutableMemory::new(8192, false).unwrap();
        let (mut near, mut far) = near_far(&mem);
        let far_start = far.code_ptr();
        let mut bp = Backpatcher::new(callbacks(), false);
        let start = near.code_ptr();
        bp.emit_backpatch_routine(
            &mut near,
            &mut far,
            load32(),
            MemAccessMode::Auto,
            Reg::W19,
            Reg::W20,
            BitSet32::new(),
            BitSet32::new(),
        );
        assert!(bp.faults().is_empty());
        assert_eq!(far.code_ptr(), far_start);
        let words = near.buffer().words(start, near.code_ptr());
        // MOV W0, W20; (MOVZ/MOVK X8 ..; BLR X8 | BL); MOV W19, W0
        assert_eq!(words[0], 0x2A1403E0);
        assert_eq!(*words.last().unwrap(), 0x2A0003F3);
    }
}
