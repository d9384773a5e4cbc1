//! AArch64 instruction encoding for JIT compilation.
//!
//! [`Arm64Emitter`] packs operands into 32-bit A64 words and appends them to
//! a [`CodeBuffer`]. Every emit method writes exactly one word unless its
//! docs say otherwise (the immediate helpers and the call sequences). A
//! full buffer never overruns: the write is dropped and the buffer's sticky
//! failure flag is raised instead.
//!
//! Operands that do not fit an instruction field are a caller bug and
//! panic. Nothing here truncates a displacement or an immediate.

mod branch;
mod emitter;
mod float;
mod immediates;
mod logical_imm;
mod moves;

pub use branch::{FixupBranch, FixupKind, branch_target};
pub use float::FloatEmitter;
pub use immediates::{MovApproach, MovPlan, plan_movi2r};
pub use logical_imm::{LogicalImm, fp_imm8_to_f64, fp_to_imm8, is_imm_arithmetic};
pub use moves::{CallArg, RegisterMove};

use super::codebuf::{CodeBuffer, CodeSink};

/// Register file and view of a [`Reg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegKind {
    /// 32-bit general register.
    W,
    /// 64-bit general register.
    X,
    Wsp,
    Sp,
    Wzr,
    Zr,
    /// 32-bit view of a vector register.
    S,
    /// 64-bit view of a vector register.
    D,
    /// 128-bit vector register.
    Q,
}

/// An AArch64 register operand: a register number plus the view it is
/// accessed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg {
    kind: RegKind,
    num: u8,
}

impl Reg {
    pub const fn new(kind: RegKind, num: u8) -> Self {
        assert!(num < 32);
        Self { kind, num }
    }

    pub const fn w(num: u8) -> Self {
        Self::new(RegKind::W, num)
    }

    pub const fn x(num: u8) -> Self {
        Self::new(RegKind::X, num)
    }

    pub const WZR: Reg = Reg::new(RegKind::Wzr, 31);
    pub const ZR: Reg = Reg::new(RegKind::Zr, 31);
    pub const WSP: Reg = Reg::new(RegKind::Wsp, 31);
    pub const SP: Reg = Reg::new(RegKind::Sp, 31);
    /// Frame pointer.
    pub const FP: Reg = Reg::X29;
    /// Link register.
    pub const LR: Reg = Reg::X30;

    pub const W0: Reg = Reg::new(RegKind::W, 0);
    pub const W1: Reg = Reg::new(RegKind::W, 1);
    pub const W2: Reg = Reg::new(RegKind::W, 2);
    pub const W3: Reg = Reg::new(RegKind::W, 3);
    pub const W4: Reg = Reg::new(RegKind::W, 4);
    pub const W5: Reg = Reg::new(RegKind::W, 5);
    pub const W6: Reg = Reg::new(RegKind::W, 6);
    pub const W7: Reg = Reg::new(RegKind::W, 7);
    pub const W8: Reg = Reg::new(RegKind::W, 8);
    pub const W9: Reg = Reg::new(RegKind::W, 9);
    pub const W10: Reg = Reg::new(RegKind::W, 10);
    pub const W11: Reg = Reg::new(RegKind::W, 11);
    pub const W12: Reg = Reg::new(RegKind::W, 12);
    pub const W13: Reg = Reg::new(RegKind::W, 13);
    pub const W14: Reg = Reg::new(RegKind::W, 14);
    pub const W15: Reg = Reg::new(RegKind::W, 15);
    pub const W16: Reg = Reg::new(RegKind::W, 16);
    pub const W17: Reg = Reg::new(RegKind::W, 17);
    pub const W18: Reg = Reg::new(RegKind::W, 18);
    pub const W19: Reg = Reg::new(RegKind::W, 19);
    pub const W20: Reg = Reg::new(RegKind::W, 20);
    pub const W21: Reg = Reg::new(RegKind::W, 21);
    pub const W22: Reg = Reg::new(RegKind::W, 22);
    pub const W23: Reg = Reg::new(RegKind::W, 23);
    pub const W24: Reg = Reg::new(RegKind::W, 24);
    pub const W25: Reg = Reg::new(RegKind::W, 25);
    pub const W26: Reg = Reg::new(RegKind::W, 26);
    pub const W27: Reg = Reg::new(RegKind::W, 27);
    pub const W28: Reg = Reg::new(RegKind::W, 28);
    pub const W29: Reg = Reg::new(RegKind::W, 29);
    pub const W30: Reg = Reg::new(RegKind::W, 30);
    pub const X0: Reg = Reg::new(RegKind::X, 0);
    pub const X1: Reg = Reg::new(RegKind::X, 1);
    pub const X2: Reg = Reg::new(RegKind::X, 2);
    pub const X3: Reg = Reg::new(RegKind::X, 3);
    pub const X4: Reg = Reg::new(RegKind::X, 4);
    pub const X5: Reg = Reg::new(RegKind::X, 5);
    pub const X6: Reg = Reg::new(RegKind::X, 6);
    pub const X7: Reg = Reg::new(RegKind::X, 7);
    pub const X8: Reg = Reg::new(RegKind::X, 8);
    pub const X9: Reg = Reg::new(RegKind::X, 9);
    pub const X10: Reg = Reg::new(RegKind::X, 10);
    pub const X11: Reg = Reg::new(RegKind::X, 11);
    pub const X12: Reg = Reg::new(RegKind::X, 12);
    pub const X13: Reg = Reg::new(RegKind::X, 13);
    pub const X14: Reg = Reg::new(RegKind::X, 14);
    pub const X15: Reg = Reg::new(RegKind::X, 15);
    pub const X16: Reg = Reg::new(RegKind::X, 16);
    pub const X17: Reg = Reg::new(RegKind::X, 17);
    pub const X18: Reg = Reg::new(RegKind::X, 18);
    pub const X19: Reg = Reg::new(RegKind::X, 19);
    pub const X20: Reg = Reg::new(RegKind::X, 20);
    pub const X21: Reg = Reg::new(RegKind::X, 21);
    pub const X22: Reg = Reg::new(RegKind::X, 22);
    pub const X23: Reg = Reg::new(RegKind::X, 23);
    pub const X24: Reg = Reg::new(RegKind::X, 24);
    pub const X25: Reg = Reg::new(RegKind::X, 25);
    pub const X26: Reg = Reg::new(RegKind::X, 26);
    pub const X27: Reg = Reg::new(RegKind::X, 27);
    pub const X28: Reg = Reg::new(RegKind::X, 28);
    pub const X29: Reg = Reg::new(RegKind::X, 29);
    pub const X30: Reg = Reg::new(RegKind::X, 30);
    pub const S0: Reg = Reg::new(RegKind::S, 0);
    pub const S1: Reg = Reg::new(RegKind::S, 1);
    pub const S2: Reg = Reg::new(RegKind::S, 2);
    pub const S3: Reg = Reg::new(RegKind::S, 3);
    pub const S4: Reg = Reg::new(RegKind::S, 4);
    pub const S5: Reg = Reg::new(RegKind::S, 5);
    pub const S6: Reg = Reg::new(RegKind::S, 6);
    pub const S7: Reg = Reg::new(RegKind::S, 7);
    pub const S8: Reg = Reg::new(RegKind::S, 8);
    pub const S9: Reg = Reg::new(RegKind::S, 9);
    pub const S10: Reg = Reg::new(RegKind::S, 10);
    pub const S11: Reg = Reg::new(RegKind::S, 11);
    pub const S12: Reg = Reg::new(RegKind::S, 12);
    pub const S13: Reg = Reg::new(RegKind::S, 13);
    pub const S14: Reg = Reg::new(RegKind::S, 14);
    pub const S15: Reg = Reg::new(RegKind::S, 15);
    pub const S16: Reg = Reg::new(RegKind::S, 16);
    pub const S17: Reg = Reg::new(RegKind::S, 17);
    pub const S18: Reg = Reg::new(RegKind::S, 18);
    pub const S19: Reg = Reg::new(RegKind::S, 19);
    pub const S20: Reg = Reg::new(RegKind::S, 20);
    pub const S21: Reg = Reg::new(RegKind::S, 21);
    pub const S22: Reg = Reg::new(RegKind::S, 22);
    pub const S23: Reg = Reg::new(RegKind::S, 23);
    pub const S24: Reg = Reg::new(RegKind::S, 24);
    pub const S25: Reg = Reg::new(RegKind::S, 25);
    pub const S26: Reg = Reg::new(RegKind::S, 26);
    pub const S27: Reg = Reg::new(RegKind::S, 27);
    pub const S28: Reg = Reg::new(RegKind::S, 28);
    pub const S29: Reg = Reg::new(RegKind::S, 29);
    pub const S30: Reg = Reg::new(RegKind::S, 30);
    pub const S31: Reg = Reg::new(RegKind::S, 31);
    pub const D0: Reg = Reg::new(RegKind::D, 0);
    pub const D1: Reg = Reg::new(RegKind::D, 1);
    pub const D2: Reg = Reg::new(RegKind::D, 2);
    pub const D3: Reg = Reg::new(RegKind::D, 3);
    pub const D4: Reg = Reg::new(RegKind::D, 4);
    pub const D5: Reg = Reg::new(RegKind::D, 5);
    pub const D6: Reg = Reg::new(RegKind::D, 6);
    pub const D7: Reg = Reg::new(RegKind::D, 7);
    pub const D8: Reg = Reg::new(RegKind::D, 8);
    pub const D9: Reg = Reg::new(RegKind::D, 9);
    pub const D10: Reg = Reg::new(RegKind::D, 10);
    pub const D11: Reg = Reg::new(RegKind::D, 11);
    pub const D12: Reg = Reg::new(RegKind::D, 12);
    pub const D13: Reg = Reg::new(RegKind::D, 13);
    pub const D14: Reg = Reg::new(RegKind::D, 14);
    pub const D15: Reg = Reg::new(RegKind::D, 15);
    pub const D16: Reg = Reg::new(RegKind::D, 16);
    pub const D17: Reg = Reg::new(RegKind::D, 17);
    pub const D18: Reg = Reg::new(RegKind::D, 18);
    pub const D19: Reg = Reg::new(RegKind::D, 19);
    pub const D20: Reg = Reg::new(RegKind::D, 20);
    pub const D21: Reg = Reg::new(RegKind::D, 21);
    pub const D22: Reg = Reg::new(RegKind::D, 22);
    pub const D23: Reg = Reg::new(RegKind::D, 23);
    pub const D24: Reg = Reg::new(RegKind::D, 24);
    pub const D25: Reg = Reg::new(RegKind::D, 25);
    pub const D26: Reg = Reg::new(RegKind::D, 26);
    pub const D27: Reg = Reg::new(RegKind::D, 27);
    pub const D28: Reg = Reg::new(RegKind::D, 28);
    pub const D29: Reg = Reg::new(RegKind::D, 29);
    pub const D30: Reg = Reg::new(RegKind::D, 30);
    pub const D31: Reg = Reg::new(RegKind::D, 31);
    pub const Q0: Reg = Reg::new(RegKind::Q, 0);
    pub const Q1: Reg = Reg::new(RegKind::Q, 1);
    pub const Q2: Reg = Reg::new(RegKind::Q, 2);
    pub const Q3: Reg = Reg::new(RegKind::Q, 3);
    pub const Q4: Reg = Reg::new(RegKind::Q, 4);
    pub const Q5: Reg = Reg::new(RegKind::Q, 5);
    pub const Q6: Reg = Reg::new(RegKind::Q, 6);
    pub const Q7: Reg = Reg::new(RegKind::Q, 7);
    pub const Q8: Reg = Reg::new(RegKind::Q, 8);
    pub const Q9: Reg = Reg::new(RegKind::Q, 9);
    pub const Q10: Reg = Reg::new(RegKind::Q, 10);
    pub const Q11: Reg = Reg::new(RegKind::Q, 11);
    pub const Q12: Reg = Reg::new(RegKind::Q, 12);
    pub const Q13: Reg = Reg::new(RegKind::Q, 13);
    pub const Q14: Reg = Reg::new(RegKind::Q, 14);
    pub const Q15: Reg = Reg::new(RegKind::Q, 15);
    pub const Q16: Reg = Reg::new(RegKind::Q, 16);
    pub const Q17: Reg = Reg::new(RegKind::Q, 17);
    pub const Q18: Reg = Reg::new(RegKind::Q, 18);
    pub const Q19: Reg = Reg::new(RegKind::Q, 19);
    pub const Q20: Reg = Reg::new(RegKind::Q, 20);
    pub const Q21: Reg = Reg::new(RegKind::Q, 21);
    pub const Q22: Reg = Reg::new(RegKind::Q, 22);
    pub const Q23: Reg = Reg::new(RegKind::Q, 23);
    pub const Q24: Reg = Reg::new(RegKind::Q, 24);
    pub const Q25: Reg = Reg::new(RegKind::Q, 25);
    pub const Q26: Reg = Reg::new(RegKind::Q, 26);
    pub const Q27: Reg = Reg::new(RegKind::Q, 27);
    pub const Q28: Reg = Reg::new(RegKind::Q, 28);
    pub const Q29: Reg = Reg::new(RegKind::Q, 29);
    pub const Q30: Reg = Reg::new(RegKind::Q, 30);
    pub const Q31: Reg = Reg::new(RegKind::Q, 31);

    pub fn kind(self) -> RegKind {
        self.kind
    }

    /// The 5-bit field value of this register.
    pub fn code(self) -> u32 {
        self.num as u32
    }

    /// Register number (31 for SP and ZR).
    pub fn num(self) -> u8 {
        self.num
    }

    pub fn is_gpr(self) -> bool {
        !self.is_vector()
    }

    pub fn is_vector(self) -> bool {
        matches!(self.kind, RegKind::S | RegKind::D | RegKind::Q)
    }

    /// 64-bit general register view (X, SP or ZR).
    pub fn is_64bit(self) -> bool {
        matches!(self.kind, RegKind::X | RegKind::Sp | RegKind::Zr)
    }

    pub fn is_zr(self) -> bool {
        matches!(self.kind, RegKind::Zr | RegKind::Wzr)
    }

    pub fn is_sp(self) -> bool {
        matches!(self.kind, RegKind::Sp | RegKind::Wsp)
    }

    pub fn is_single(self) -> bool {
        self.kind == RegKind::S
    }

    pub fn is_double(self) -> bool {
        self.kind == RegKind::D
    }

    pub fn is_quad(self) -> bool {
        self.kind == RegKind::Q
    }

    /// Width of the view in bits.
    pub fn bits(self) -> u32 {
        match self.kind {
            RegKind::W | RegKind::Wsp | RegKind::Wzr | RegKind::S => 32,
            RegKind::X | RegKind::Sp | RegKind::Zr | RegKind::D => 64,
            RegKind::Q => 128,
        }
    }

    pub fn to_64(self) -> Reg {
        let kind = match self.kind {
            RegKind::W => RegKind::X,
            RegKind::Wsp => RegKind::Sp,
            RegKind::Wzr => RegKind::Zr,
            RegKind::S | RegKind::Q => RegKind::D,
            k => k,
        };
        Reg { kind, num: self.num }
    }

    pub fn to_32(self) -> Reg {
        let kind = match self.kind {
            RegKind::X => RegKind::W,
            RegKind::Sp => RegKind::Wsp,
            RegKind::Zr => RegKind::Wzr,
            RegKind::D | RegKind::Q => RegKind::S,
            k => k,
        };
        Reg { kind, num: self.num }
    }

    pub fn to_quad(self) -> Reg {
        assert!(self.is_vector(), "{:?} is not a vector register", self);
        Reg::new(RegKind::Q, self.num)
    }

    /// Same register number in the 32- or 64-bit view matching `like`.
    pub fn with_width_of(self, like: Reg) -> Reg {
        if like.bits() == 64 { self.to_64() } else { self.to_32() }
    }

    pub(crate) fn sf(self) -> u32 {
        (self.is_64bit() as u32) << 31
    }
}

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,  // Equal
    Ne = 0b0001,  // Not equal
    Cs = 0b0010,  // Carry set / unsigned higher or same
    Cc = 0b0011,  // Carry clear / unsigned lower
    Mi = 0b0100,  // Minus / negative
    Pl = 0b0101,  // Plus / positive or zero
    Vs = 0b0110,  // Overflow set
    Vc = 0b0111,  // Overflow clear
    Hi = 0b1000,  // Unsigned higher
    Ls = 0b1001,  // Unsigned lower or same
    Ge = 0b1010,  // Signed greater than or equal
    Lt = 0b1011,  // Signed less than
    Gt = 0b1100,  // Signed greater than
    Le = 0b1101,  // Signed less than or equal
    Al = 0b1110,  // Always
    Nv = 0b1111,  // Always (reserved encoding)
}

impl Cond {
    pub const HS: Cond = Cond::Cs;
    pub const LO: Cond = Cond::Cc;

    pub fn code(self) -> u32 {
        self as u32
    }

    /// The condition that holds exactly when `self` does not.
    pub fn invert(self) -> Cond {
        Cond::from_code(self.code() ^ 1)
    }

    pub fn from_code(code: u32) -> Cond {
        match code & 0xF {
            0b0000 => Cond::Eq,
            0b0001 => Cond::Ne,
            0b0010 => Cond::Cs,
            0b0011 => Cond::Cc,
            0b0100 => Cond::Mi,
            0b0101 => Cond::Pl,
            0b0110 => Cond::Vs,
            0b0111 => Cond::Vc,
            0b1000 => Cond::Hi,
            0b1001 => Cond::Ls,
            0b1010 => Cond::Ge,
            0b1011 => Cond::Lt,
            0b1100 => Cond::Gt,
            0b1101 => Cond::Le,
            0b1110 => Cond::Al,
            _ => Cond::Nv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftType {
    Lsl = 0,
    Lsr = 1,
    Asr = 2,
    Ror = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendType {
    Uxtb = 0,
    Uxth = 1,
    Uxtw = 2,
    Uxtx = 3,
    Sxtb = 4,
    Sxth = 5,
    Sxtw = 6,
    Sxtx = 7,
}

/// Second register operand of an arithmetic or logical instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOption {
    /// `Rm, <shift> #amount`
    Shifted { rm: Reg, shift: ShiftType, amount: u8 },
    /// `Rm, <extend> #amount` (add/sub only)
    Extended { rm: Reg, extend: ExtendType, amount: u8 },
}

impl ArithOption {
    pub fn reg(rm: Reg) -> Self {
        Self::Shifted { rm, shift: ShiftType::Lsl, amount: 0 }
    }

    pub fn lsl(rm: Reg, amount: u8) -> Self {
        Self::Shifted { rm, shift: ShiftType::Lsl, amount }
    }

    pub fn lsr(rm: Reg, amount: u8) -> Self {
        Self::Shifted { rm, shift: ShiftType::Lsr, amount }
    }

    pub fn asr(rm: Reg, amount: u8) -> Self {
        Self::Shifted { rm, shift: ShiftType::Asr, amount }
    }

    pub fn ror(rm: Reg, amount: u8) -> Self {
        Self::Shifted { rm, shift: ShiftType::Ror, amount }
    }

    pub fn extend(rm: Reg, extend: ExtendType, amount: u8) -> Self {
        Self::Extended { rm, extend, amount }
    }

    pub fn rm(self) -> Reg {
        match self {
            Self::Shifted { rm, .. } | Self::Extended { rm, .. } => rm,
        }
    }
}

/// Index register of a register-offset load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexReg {
    pub rm: Reg,
    /// One of UXTW, UXTX (LSL), SXTW or SXTX.
    pub extend: ExtendType,
    /// Scale the index by the access size.
    pub scaled: bool,
}

impl IndexReg {
    /// `[Xn, Xm]`
    pub fn x(rm: Reg) -> Self {
        Self { rm: rm.to_64(), extend: ExtendType::Uxtx, scaled: false }
    }

    /// `[Xn, Wm, UXTW]`
    pub fn uxtw(rm: Reg) -> Self {
        Self { rm: rm.to_32(), extend: ExtendType::Uxtw, scaled: false }
    }

    pub fn scaled(self) -> Self {
        Self { scaled: true, ..self }
    }
}

/// Addressing mode for immediate-offset loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// `[Xn, #uimm]`, scaled by the access size.
    Unsigned,
    /// `[Xn, #simm]` (pairs only).
    Signed,
    /// `[Xn, #simm]!`
    Pre,
    /// `[Xn], #simm`
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierType {
    OshLd = 0b0001,
    OshSt = 0b0010,
    Osh = 0b0011,
    NshLd = 0b0101,
    NshSt = 0b0110,
    Nsh = 0b0111,
    IshLd = 0b1001,
    IshSt = 0b1010,
    Ish = 0b1011,
    Ld = 0b1101,
    St = 0b1110,
    Sy = 0b1111,
}

/// System registers reachable through MRS/MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemReg {
    Nzcv,
    Fpcr,
    Fpsr,
    TpidrEl0,
    CntvctEl0,
}

impl SystemReg {
    /// `o0:op1:CRn:CRm:op2` field packed at bit 5.
    fn encoding(self) -> u32 {
        let (op0, op1, crn, crm, op2) = match self {
            SystemReg::Nzcv => (3, 3, 4, 2, 0),
            SystemReg::Fpcr => (3, 3, 4, 4, 0),
            SystemReg::Fpsr => (3, 3, 4, 4, 1),
            SystemReg::TpidrEl0 => (3, 3, 13, 0, 2),
            SystemReg::CntvctEl0 => (3, 3, 14, 0, 2),
        };
        ((op0 & 1) << 19) | (op1 << 16) | (crn << 12) | (crm << 8) | (op2 << 5)
    }
}

/// AArch64 instruction emitter over an owned [`CodeBuffer`].
pub struct Arm64Emitter {
    buf: CodeBuffer,
}

impl Arm64Emitter {
    pub fn new(buf: CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emitter over a fresh heap buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(CodeBuffer::new(capacity))
    }

    pub fn buffer(&self) -> &CodeBuffer {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    pub fn into_buffer(self) -> CodeBuffer {
        self.buf
    }

    /// Get the current cursor address.
    pub fn code_ptr(&self) -> usize {
        self.buf.code_ptr()
    }

    pub fn has_write_failed(&self) -> bool {
        self.buf.has_write_failed()
    }

    pub fn set_code_ptr(&mut self, ptr: usize, end: usize, write_failed: bool) {
        self.buf.set_code_ptr(ptr, end, write_failed);
    }

    pub fn flush_icache(&mut self) {
        self.buf.flush_icache();
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    /// Floating-point and vector emitter sharing this emitter's cursor.
    pub fn float(&mut self) -> FloatEmitter<'_> {
        FloatEmitter::new(&mut self.buf)
    }

    /// Pad with NOPs up to a 16-byte boundary.
    pub fn align_code_16(&mut self) {
        while self.code_ptr() & 15 != 0 && !self.has_write_failed() {
            self.nop();
        }
    }

    /// Pad with BRK up to a page boundary.
    pub fn align_code_page(&mut self) {
        let page = super::memory::page_size();
        while self.code_ptr() & (page - 1) != 0 && !self.has_write_failed() {
            self.brk(0);
        }
    }

    /// Skip `bytes` of code space, filling it with BRK so that stray
    /// execution traps.
    pub fn reserve_code_space(&mut self, bytes: usize) {
        for _ in 0..bytes / 4 {
            self.brk(0);
        }
    }
}

impl CodeSink for Arm64Emitter {
    fn write_u32(&mut self, word: u32) {
        self.buf.emit_u32(word);
    }

    fn code_ptr(&self) -> usize {
        self.buf.code_ptr()
    }
}
