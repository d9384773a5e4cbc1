//! Memory-mapped I/O handlers.
//!
//! Each hardware register has a read and/or write handler describing how an
//! access is serviced. The handlers are plain data; consumers walk them with
//! a visitor. The JIT's visitors generate an access specialised to the
//! handler when the guest address is known at compile time.

use std::collections::HashMap;

use super::aarch64::{Arm64Emitter, CallArg, IndexType, Reg};
use super::bitset::BitSet32;
use super::regs::SCRATCH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadHandler {
    /// Reads as zero.
    Nop,
    Constant(u32),
    /// Reads `*ptr & mask`, where `ptr` points at a host integer of the
    /// access size.
    Direct { ptr: usize, mask: u32 },
    /// Calls `func(ctx, address)`.
    Complex { func: extern "C" fn(usize, u32) -> u32, ctx: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHandler {
    Nop,
    /// Stores `value & mask` to `*ptr`.
    Direct { ptr: usize, mask: u32 },
    /// Calls `func(ctx, address, value)`.
    Complex { func: extern "C" fn(usize, u32, u32), ctx: usize },
}

pub trait ReadHandlingMethodVisitor {
    fn visit_nop(&mut self);
    fn visit_constant(&mut self, value: u32);
    fn visit_direct(&mut self, ptr: usize, mask: u32);
    fn visit_complex(&mut self, func: usize, ctx: usize);
}

pub trait WriteHandlingMethodVisitor {
    fn visit_nop(&mut self);
    fn visit_direct(&mut self, ptr: usize, mask: u32);
    fn visit_complex(&mut self, func: usize, ctx: usize);
}

impl ReadHandler {
    pub fn visit<V: ReadHandlingMethodVisitor + ?Sized>(&self, visitor: &mut V) {
        match *self {
            ReadHandler::Nop => visitor.visit_nop(),
            ReadHandler::Constant(value) => visitor.visit_constant(value),
            ReadHandler::Direct { ptr, mask } => visitor.visit_direct(ptr, mask),
            ReadHandler::Complex { func, ctx } => visitor.visit_complex(func as usize, ctx),
        }
    }
}

impl WriteHandler {
    pub fn visit<V: WriteHandlingMethodVisitor + ?Sized>(&self, visitor: &mut V) {
        match *self {
            WriteHandler::Nop => visitor.visit_nop(),
            WriteHandler::Direct { ptr, mask } => visitor.visit_direct(ptr, mask),
            WriteHandler::Complex { func, ctx } => visitor.visit_complex(func as usize, ctx),
        }
    }
}

/// Handlers keyed by guest physical address and access size in bits.
#[derive(Debug, Default, Clone)]
pub struct MmioMapping {
    reads: HashMap<(u32, u32), ReadHandler>,
    writes: HashMap<(u32, u32), WriteHandler>,
}

impl MmioMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_read(&mut self, address: u32, size_bits: u32, handler: ReadHandler) {
        assert!(matches!(size_bits, 8 | 16 | 32), "MMIO accesses are 8, 16 or 32 bits");
        self.reads.insert((address, size_bits), handler);
    }

    pub fn register_write(&mut self, address: u32, size_bits: u32, handler: WriteHandler) {
        assert!(matches!(size_bits, 8 | 16 | 32), "MMIO accesses are 8, 16 or 32 bits");
        self.writes.insert((address, size_bits), handler);
    }

    pub fn read_handler(&self, address: u32, size_bits: u32) -> Option<&ReadHandler> {
        self.reads.get(&(address, size_bits))
    }

    pub fn write_handler(&self, address: u32, size_bits: u32) -> Option<&WriteHandler> {
        self.writes.get(&(address, size_bits))
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}

fn truncate(value: u32, size: u32) -> u32 {
    match size {
        8 => value & 0xFF,
        16 => value & 0xFFFF,
        _ => value,
    }
}

fn extend_constant(value: u32, size: u32, sign_extend: bool) -> u32 {
    let value = truncate(value, size);
    match (sign_extend, size) {
        (true, 8) => value as u8 as i8 as i32 as u32,
        (true, 16) => value as u16 as i16 as i32 as u32,
        _ => value,
    }
}

/// Emits a read of one MMIO register into `dst` (a W register).
///
/// Clobbers X30; complex handlers also clobber the call-scratch registers
/// outside `gprs`.
pub struct MmioReadCodeGenerator<'a> {
    emit: &'a mut Arm64Emitter,
    gprs: BitSet32,
    fprs: BitSet32,
    dst: Reg,
    size: u32,
    sign_extend: bool,
    address: u32,
}

impl<'a> MmioReadCodeGenerator<'a> {
    pub fn new(
        emit: &'a mut Arm64Emitter,
        gprs: BitSet32,
        fprs: BitSet32,
        dst: Reg,
        size: u32,
        sign_extend: bool,
        address: u32,
    ) -> Self {
        Self { emit, gprs, fprs, dst: dst.to_32(), size, sign_extend, address }
    }

    /// Narrow `src` to the access size and extend it into `dst`.
    fn extend(&mut self, src: Reg) {
        match (self.size, self.sign_extend) {
            (8, true) => self.emit.sxtb(self.dst, src),
            (8, false) => self.emit.uxtb(self.dst, src),
            (16, true) => self.emit.sxth(self.dst, src),
            (16, false) => self.emit.uxth(self.dst, src),
            _ if src != self.dst => self.emit.mov(self.dst, src),
            _ => {}
        }
    }
}

impl ReadHandlingMethodVisitor for MmioReadCodeGenerator<'_> {
    fn visit_nop(&mut self) {
        self.emit.movz(self.dst, 0, 0);
    }

    fn visit_constant(&mut self, value: u32) {
        let value = extend_constant(value, self.size, self.sign_extend);
        self.emit.movi2r(self.dst, value as u64);
    }

    fn visit_direct(&mut self, ptr: usize, mask: u32) {
        self.emit.movp2r(SCRATCH, ptr);
        match self.size {
            8 => self.emit.ldrb(self.dst, SCRATCH, IndexType::Unsigned, 0),
            16 => self.emit.ldrh(self.dst, SCRATCH, IndexType::Unsigned, 0),
            _ => self.emit.ldr(self.dst, SCRATCH, IndexType::Unsigned, 0),
        }
        let full = truncate(u32::MAX, self.size);
        if truncate(mask, self.size) != full {
            self.emit.andi2r(self.dst, self.dst, mask as u64, Some(SCRATCH.to_32()));
        }
        if self.sign_extend {
            let dst = self.dst;
            self.extend(dst);
        }
    }

    fn visit_complex(&mut self, func: usize, ctx: usize) {
        let mut gprs = self.gprs;
        gprs.remove(self.dst.num() as u32);
        self.emit.abi_push_registers(gprs);
        self.emit.abi_push_fp_registers(self.fprs);
        self.emit
            .abi_call_function(func, &[CallArg::Imm(ctx as u64), CallArg::Imm(self.address as u64)]);
        self.extend(Reg::W0);
        self.emit.abi_pop_fp_registers(self.fprs);
        self.emit.abi_pop_registers(gprs);
    }
}

/// Emits a write of `src` (a W register) to one MMIO register.
///
/// Clobbers W0 and X30; complex handlers also clobber the call-scratch
/// registers outside `gprs`.
pub struct MmioWriteCodeGenerator<'a> {
    emit: &'a mut Arm64Emitter,
    gprs: BitSet32,
    fprs: BitSet32,
    src: Reg,
    size: u32,
    address: u32,
}

impl<'a> MmioWriteCodeGenerator<'a> {
    pub fn new(emit: &'a mut Arm64Emitter, gprs: BitSet32, fprs: BitSet32, src: Reg, size: u32, address: u32) -> Self {
        Self { emit, gprs, fprs, src: src.to_32(), size, address }
    }
}

impl WriteHandlingMethodVisitor for MmioWriteCodeGenerator<'_> {
    fn visit_nop(&mut self) {}

    fn visit_direct(&mut self, ptr: usize, mask: u32) {
        let value = if truncate(mask, self.size) != truncate(u32::MAX, self.size) {
            self.emit.andi2r(Reg::W0, self.src, mask as u64, Some(SCRATCH.to_32()));
            Reg::W0
        } else {
            self.src
        };
        self.emit.movp2r(SCRATCH, ptr);
        match self.size {
            8 => self.emit.strb(value, SCRATCH, IndexType::Unsigned, 0),
            16 => self.emit.strh(value, SCRATCH, IndexType::Unsigned, 0),
            _ => self.emit.str(value, SCRATCH, IndexType::Unsigned, 0),
        }
    }

    fn visit_complex(&mut self, func: usize, ctx: usize) {
        self.emit.abi_push_registers(self.gprs);
        self.emit.abi_push_fp_registers(self.fprs);
        self.emit.abi_call_function(
            func,
            &[CallArg::Imm(ctx as u64), CallArg::Imm(self.address as u64), CallArg::Reg(self.src)],
        );
        self.emit.abi_pop_fp_registers(self.fprs);
        self.emit.abi_pop_registers(self.gprs);
    }
}
