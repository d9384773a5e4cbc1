//! Floating-point and SIMD instructions.
//!
//! The float emitter only needs to append words, so it borrows the integer
//! emitter's buffer through [`CodeSink`] instead of sharing its internals.

use super::Reg;
use crate::jit::codebuf::CodeSink;

pub struct FloatEmitter<'a> {
    sink: &'a mut dyn CodeSink,
}

/// `type` field: 0 for single, 1 for double.
fn fp_type(reg: Reg) -> u32 {
    assert!(reg.is_single() || reg.is_double(), "{:?} is not a scalar FP register", reg);
    reg.is_double() as u32
}

impl<'a> FloatEmitter<'a> {
    pub fn new(sink: &'a mut dyn CodeSink) -> Self {
        Self { sink }
    }

    fn emit(&mut self, inst: u32) {
        self.sink.write_u32(inst);
    }

    // ==================== Load / store ====================

    /// (size field, opc offset, scale) for a vector transfer.
    fn transfer(rt: Reg) -> (u32, u32, u32) {
        match rt.bits() {
            32 => (2, 0, 2),
            64 => (3, 0, 3),
            _ => (0, 2, 4),
        }
    }

    fn load_store_unsigned(&mut self, load: bool, rt: Reg, rn: Reg, offset: u32) {
        assert!(rt.is_vector());
        let (size, opc, scale) = Self::transfer(rt);
        assert!(
            offset % (1 << scale) == 0 && (offset >> scale) < 4096,
            "offset {} invalid for {:?}",
            offset,
            rt
        );
        // size 111 1 01 opc imm12 Rn Rt
        let inst = 0x3D000000
            | (size << 30)
            | ((opc + load as u32) << 22)
            | ((offset >> scale) << 10)
            | (rn.code() << 5)
            | rt.code();
        self.emit(inst);
    }

    fn load_store_reg(&mut self, load: bool, rt: Reg, rn: Reg, rm: Reg, scaled: bool) {
        assert!(rt.is_vector());
        let (size, opc, _) = Self::transfer(rt);
        // UXTW for a W index, LSL for an X index.
        let option = if rm.is_64bit() { 0b011 } else { 0b010 };
        // size 111 1 00 opc 1 Rm option S 10 Rn Rt
        let inst = 0x3C200800
            | (size << 30)
            | ((opc + load as u32) << 22)
            | (rm.code() << 16)
            | (option << 13)
            | ((scaled as u32) << 12)
            | (rn.code() << 5)
            | rt.code();
        self.emit(inst);
    }

    /// LDR St/Dt/Qt, [Xn, #offset]
    pub fn ldr(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.load_store_unsigned(true, rt, rn, offset);
    }

    /// STR St/Dt/Qt, [Xn, #offset]
    pub fn str(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.load_store_unsigned(false, rt, rn, offset);
    }

    /// LDR St/Dt/Qt, [Xn, Rm]
    pub fn ldr_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.load_store_reg(true, rt, rn, rm, false);
    }

    /// STR St/Dt/Qt, [Xn, Rm]
    pub fn str_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.load_store_reg(false, rt, rn, rm, false);
    }

    // ==================== Moves ====================

    /// FMOV Sd, Sn / FMOV Dd, Dn
    pub fn fmov(&mut self, rd: Reg, rn: Reg) {
        self.one_source(0b000000, rd, rn);
    }

    /// FMOV Sd, Wn / FMOV Dd, Xn
    pub fn fmov_from_gpr(&mut self, rd: Reg, rn: Reg) {
        let base = if rd.is_double() { 0x9E670000 } else { 0x1E270000 };
        assert_eq!(rd.bits(), rn.bits(), "FMOV between different widths");
        self.emit(base | (rn.code() << 5) | rd.code());
    }

    /// FMOV Wd, Sn / FMOV Xd, Dn
    pub fn fmov_to_gpr(&mut self, rd: Reg, rn: Reg) {
        let base = if rn.is_double() { 0x9E660000 } else { 0x1E260000 };
        assert_eq!(rd.bits(), rn.bits(), "FMOV between different widths");
        self.emit(base | (rn.code() << 5) | rd.code());
    }

    /// FMOV Sd/Dd, #imm8
    pub fn fmov_imm(&mut self, rd: Reg, imm8: u8) {
        // M 0 S 11110 type 1 imm8 100 imm5 Rd
        self.emit(0x1E201000 | (fp_type(rd) << 22) | ((imm8 as u32) << 13) | rd.code());
    }

    // ==================== Arithmetic ====================

    fn one_source(&mut self, opcode: u32, rd: Reg, rn: Reg) {
        // M 0 S 11110 type 1 opcode 10000 Rn Rd
        let inst = 0x1E204000 | (fp_type(rn) << 22) | (opcode << 15) | (rn.code() << 5) | rd.code();
        self.emit(inst);
    }

    fn two_source(&mut self, opcode: u32, rd: Reg, rn: Reg, rm: Reg) {
        // M 0 S 11110 type 1 Rm opcode 10 Rn Rd
        let inst = 0x1E200800
            | (fp_type(rd) << 22)
            | (rm.code() << 16)
            | (opcode << 12)
            | (rn.code() << 5)
            | rd.code();
        self.emit(inst);
    }

    pub fn fabs(&mut self, rd: Reg, rn: Reg) {
        self.one_source(0b000001, rd, rn);
    }

    pub fn fneg(&mut self, rd: Reg, rn: Reg) {
        self.one_source(0b000010, rd, rn);
    }

    pub fn fsqrt(&mut self, rd: Reg, rn: Reg) {
        self.one_source(0b000011, rd, rn);
    }

    /// FCVT between single and double; the direction follows `rd`/`rn`.
    pub fn fcvt(&mut self, rd: Reg, rn: Reg) {
        assert_ne!(rd.bits(), rn.bits(), "FCVT needs different precisions");
        let opcode = if rd.is_double() { 0b000101 } else { 0b000100 };
        self.one_source(opcode, rd, rn);
    }

    pub fn fmul(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.two_source(0b0000, rd, rn, rm);
    }

    pub fn fdiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.two_source(0b0001, rd, rn, rm);
    }

    pub fn fadd(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.two_source(0b0010, rd, rn, rm);
    }

    pub fn fsub(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.two_source(0b0011, rd, rn, rm);
    }

    pub fn fmax(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.two_source(0b0100, rd, rn, rm);
    }

    pub fn fmin(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.two_source(0b0101, rd, rn, rm);
    }

    /// FCMP Sn, Sm / FCMP Dn, Dm
    pub fn fcmp(&mut self, rn: Reg, rm: Reg) {
        self.emit(0x1E202000 | (fp_type(rn) << 22) | (rm.code() << 16) | (rn.code() << 5));
    }

    /// FCMP Sn, #0.0
    pub fn fcmp_zero(&mut self, rn: Reg) {
        self.emit(0x1E202008 | (fp_type(rn) << 22) | (rn.code() << 5));
    }

    // ==================== Conversion ====================

    /// SCVTF Sd/Dd, Wn/Xn
    pub fn scvtf(&mut self, rd: Reg, rn: Reg) {
        self.emit(rn.sf() | 0x1E220000 | (fp_type(rd) << 22) | (rn.code() << 5) | rd.code());
    }

    /// UCVTF Sd/Dd, Wn/Xn
    pub fn ucvtf(&mut self, rd: Reg, rn: Reg) {
        self.emit(rn.sf() | 0x1E230000 | (fp_type(rd) << 22) | (rn.code() << 5) | rd.code());
    }

    /// FCVTZS Wd/Xd, Sn/Dn
    pub fn fcvtzs(&mut self, rd: Reg, rn: Reg) {
        self.emit(rd.sf() | 0x1E380000 | (fp_type(rn) << 22) | (rn.code() << 5) | rd.code());
    }

    /// FCVTZU Wd/Xd, Sn/Dn
    pub fn fcvtzu(&mut self, rd: Reg, rn: Reg) {
        self.emit(rd.sf() | 0x1E390000 | (fp_type(rn) << 22) | (rn.code() << 5) | rd.code());
    }

    // ==================== Vector byte reversal ====================

    fn vector_rev(&mut self, base: u32, rd: Reg, rn: Reg) {
        // Q selects 16B over 8B.
        let q = (rd.is_quad() as u32) << 30;
        self.emit(base | q | (rn.code() << 5) | rd.code());
    }

    /// REV16 Vd.8B/16B, Vn
    pub fn rev16(&mut self, rd: Reg, rn: Reg) {
        self.vector_rev(0x0E201800, rd, rn);
    }

    /// REV32 Vd.8B/16B, Vn
    pub fn rev32(&mut self, rd: Reg, rn: Reg) {
        self.vector_rev(0x2E200800, rd, rn);
    }

    /// REV64 Vd.8B/16B, Vn
    pub fn rev64(&mut self, rd: Reg, rn: Reg) {
        self.vector_rev(0x0E200800, rd, rn);
    }
}
