//! Integer data-processing, load/store and system instructions.

use super::{
    ArithOption, Arm64Emitter, BarrierType, Cond, ExtendType, IndexReg, IndexType, LogicalImm,
    Reg, ShiftType, SystemReg,
};

/// Zero register with the width of `like`.
pub(crate) fn zr(like: Reg) -> Reg {
    if like.is_64bit() { Reg::ZR } else { Reg::WZR }
}

fn rd_rn(rd: Reg, rn: Reg) -> u32 {
    (rn.code() << 5) | rd.code()
}

// Add/sub base opcodes (sf cleared).
const ADD: u32 = 0x0B000000;
const ADDS: u32 = 0x2B000000;
const SUB: u32 = 0x4B000000;
const SUBS: u32 = 0x6B000000;

// Logical (shifted register) base opcodes, N bit included.
const AND: u32 = 0x0A000000;
const BIC: u32 = 0x0A200000;
const ORR: u32 = 0x2A000000;
const ORN: u32 = 0x2A200000;
const EOR: u32 = 0x4A000000;
const EON: u32 = 0x4A200000;
const ANDS: u32 = 0x6A000000;
const BICS: u32 = 0x6A200000;

impl Arm64Emitter {
    // ==================== Add / subtract ====================

    fn encode_arith(&mut self, base: u32, rd: Reg, rn: Reg, option: ArithOption) {
        let option = match option {
            // The shifted form reads register 31 as ZR; SP needs the
            // extended form.
            ArithOption::Shifted { rm, shift: ShiftType::Lsl, amount }
                if (rd.is_sp() || rn.is_sp()) && amount <= 4 =>
            {
                let extend = if rd.is_64bit() { ExtendType::Uxtx } else { ExtendType::Uxtw };
                ArithOption::Extended { rm, extend, amount }
            }
            other => other,
        };

        let inst = match option {
            ArithOption::Shifted { rm, shift, amount } => {
                assert!(shift != ShiftType::Ror, "ROR is not an add/sub shift");
                assert!((amount as u32) < rd.bits(), "shift amount {} out of range", amount);
                // sf op S 01011 shift 0 Rm imm6 Rn Rd
                rd.sf()
                    | base
                    | ((shift as u32) << 22)
                    | (rm.code() << 16)
                    | ((amount as u32) << 10)
                    | rd_rn(rd, rn)
            }
            ArithOption::Extended { rm, extend, amount } => {
                assert!(amount <= 4, "extend shift {} out of range", amount);
                // sf op S 01011 00 1 Rm option imm3 Rn Rd
                rd.sf()
                    | base
                    | 0x00200000
                    | (rm.code() << 16)
                    | ((extend as u32) << 13)
                    | ((amount as u32) << 10)
                    | rd_rn(rd, rn)
            }
        };
        self.emit_raw(inst);
    }

    /// ADD Rd, Rn, Rm
    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_arith(ADD, rd, rn, ArithOption::reg(rm));
    }

    pub fn add_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_arith(ADD, rd, rn, option);
    }

    /// ADDS Rd, Rn, Rm
    pub fn adds(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_arith(ADDS, rd, rn, ArithOption::reg(rm));
    }

    pub fn adds_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_arith(ADDS, rd, rn, option);
    }

    /// SUB Rd, Rn, Rm
    pub fn sub(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_arith(SUB, rd, rn, ArithOption::reg(rm));
    }

    pub fn sub_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_arith(SUB, rd, rn, option);
    }

    /// SUBS Rd, Rn, Rm
    pub fn subs(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_arith(SUBS, rd, rn, ArithOption::reg(rm));
    }

    pub fn subs_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_arith(SUBS, rd, rn, option);
    }

    /// CMP Rn, Rm (SUBS ZR, Rn, Rm)
    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        self.encode_arith(SUBS, zr(rn), rn, ArithOption::reg(rm));
    }

    pub fn cmp_opt(&mut self, rn: Reg, option: ArithOption) {
        self.encode_arith(SUBS, zr(rn), rn, option);
    }

    /// CMN Rn, Rm (ADDS ZR, Rn, Rm)
    pub fn cmn(&mut self, rn: Reg, rm: Reg) {
        self.encode_arith(ADDS, zr(rn), rn, ArithOption::reg(rm));
    }

    /// NEG Rd, Rm (SUB Rd, ZR, Rm)
    pub fn neg(&mut self, rd: Reg, rm: Reg) {
        self.encode_arith(SUB, rd, zr(rd), ArithOption::reg(rm));
    }

    /// NEGS Rd, Rm
    pub fn negs(&mut self, rd: Reg, rm: Reg) {
        self.encode_arith(SUBS, rd, zr(rd), ArithOption::reg(rm));
    }

    fn encode_add_sub_imm(&mut self, base: u32, rd: Reg, rn: Reg, imm12: u32, shift12: bool) {
        assert!(imm12 < 4096, "add/sub immediate {:#x} does not fit 12 bits", imm12);
        // sf op S 100010 sh imm12 Rn Rd
        let inst = rd.sf() | base | ((shift12 as u32) << 22) | (imm12 << 10) | rd_rn(rd, rn);
        self.emit_raw(inst);
    }

    /// ADD Rd, Rn, #imm12{, LSL #12}
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u32, shift12: bool) {
        self.encode_add_sub_imm(0x11000000, rd, rn, imm12, shift12);
    }

    /// ADDS Rd, Rn, #imm12{, LSL #12}
    pub fn adds_imm(&mut self, rd: Reg, rn: Reg, imm12: u32, shift12: bool) {
        self.encode_add_sub_imm(0x31000000, rd, rn, imm12, shift12);
    }

    /// SUB Rd, Rn, #imm12{, LSL #12}
    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u32, shift12: bool) {
        self.encode_add_sub_imm(0x51000000, rd, rn, imm12, shift12);
    }

    /// SUBS Rd, Rn, #imm12{, LSL #12}
    pub fn subs_imm(&mut self, rd: Reg, rn: Reg, imm12: u32, shift12: bool) {
        self.encode_add_sub_imm(0x71000000, rd, rn, imm12, shift12);
    }

    /// CMP Rn, #imm12{, LSL #12}
    pub fn cmp_imm(&mut self, rn: Reg, imm12: u32, shift12: bool) {
        self.encode_add_sub_imm(0x71000000, zr(rn), rn, imm12, shift12);
    }

    /// CMN Rn, #imm12{, LSL #12}
    pub fn cmn_imm(&mut self, rn: Reg, imm12: u32, shift12: bool) {
        self.encode_add_sub_imm(0x31000000, zr(rn), rn, imm12, shift12);
    }

    fn encode_carry(&mut self, base: u32, rd: Reg, rn: Reg, rm: Reg) {
        // sf op S 11010000 Rm 000000 Rn Rd
        self.emit_raw(rd.sf() | base | (rm.code() << 16) | rd_rn(rd, rn));
    }

    pub fn adc(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_carry(0x1A000000, rd, rn, rm);
    }

    pub fn adcs(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_carry(0x3A000000, rd, rn, rm);
    }

    pub fn sbc(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_carry(0x5A000000, rd, rn, rm);
    }

    pub fn sbcs(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_carry(0x7A000000, rd, rn, rm);
    }

    // ==================== Conditional ====================

    fn encode_cond_compare(&mut self, base: u32, rn: Reg, field: u32, nzcv: u8, cond: Cond) {
        assert!(nzcv < 16 && field < 32);
        // sf op 1 11010010 Rm/imm5 cond x 0 Rn 0 nzcv
        let inst =
            rn.sf() | base | (field << 16) | (cond.code() << 12) | (rn.code() << 5) | nzcv as u32;
        self.emit_raw(inst);
    }

    /// CCMP Rn, Rm, #nzcv, cond
    pub fn ccmp(&mut self, rn: Reg, rm: Reg, nzcv: u8, cond: Cond) {
        self.encode_cond_compare(0x7A400000, rn, rm.code(), nzcv, cond);
    }

    /// CCMP Rn, #imm5, #nzcv, cond
    pub fn ccmp_imm(&mut self, rn: Reg, imm5: u32, nzcv: u8, cond: Cond) {
        self.encode_cond_compare(0x7A400800, rn, imm5, nzcv, cond);
    }

    pub fn ccmn(&mut self, rn: Reg, rm: Reg, nzcv: u8, cond: Cond) {
        self.encode_cond_compare(0x3A400000, rn, rm.code(), nzcv, cond);
    }

    pub fn ccmn_imm(&mut self, rn: Reg, imm5: u32, nzcv: u8, cond: Cond) {
        self.encode_cond_compare(0x3A400800, rn, imm5, nzcv, cond);
    }

    fn encode_cond_select(&mut self, base: u32, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        // sf op S 11010100 Rm cond op2 Rn Rd
        let inst = rd.sf() | base | (rm.code() << 16) | (cond.code() << 12) | rd_rn(rd, rn);
        self.emit_raw(inst);
    }

    /// CSEL Rd, Rn, Rm, cond
    pub fn csel(&mut self, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        self.encode_cond_select(0x1A800000, rd, rn, rm, cond);
    }

    pub fn csinc(&mut self, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        self.encode_cond_select(0x1A800400, rd, rn, rm, cond);
    }

    pub fn csinv(&mut self, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        self.encode_cond_select(0x5A800000, rd, rn, rm, cond);
    }

    pub fn csneg(&mut self, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        self.encode_cond_select(0x5A800400, rd, rn, rm, cond);
    }

    /// CSET Rd, cond: 1 if `cond` holds, else 0.
    pub fn cset(&mut self, rd: Reg, cond: Cond) {
        let z = zr(rd);
        self.csinc(rd, z, z, cond.invert());
    }

    /// CSETM Rd, cond: all ones if `cond` holds, else 0.
    pub fn csetm(&mut self, rd: Reg, cond: Cond) {
        let z = zr(rd);
        self.csinv(rd, z, z, cond.invert());
    }

    /// CINC Rd, Rn, cond
    pub fn cinc(&mut self, rd: Reg, rn: Reg, cond: Cond) {
        self.csinc(rd, rn, rn, cond.invert());
    }

    /// CNEG Rd, Rn, cond
    pub fn cneg(&mut self, rd: Reg, rn: Reg, cond: Cond) {
        self.csneg(rd, rn, rn, cond.invert());
    }

    // ==================== Data processing ====================

    fn encode_data1(&mut self, opcode: u32, rd: Reg, rn: Reg) {
        // sf 1 0 11010110 00000 opcode Rn Rd
        self.emit_raw(rd.sf() | 0x5AC00000 | (opcode << 10) | rd_rn(rd, rn));
    }

    pub fn rbit(&mut self, rd: Reg, rn: Reg) {
        self.encode_data1(0, rd, rn);
    }

    /// REV16: swap bytes in each halfword.
    pub fn rev16(&mut self, rd: Reg, rn: Reg) {
        self.encode_data1(1, rd, rn);
    }

    /// REV32 Xd, Xn: swap bytes in each word.
    pub fn rev32(&mut self, rd: Reg, rn: Reg) {
        assert!(rd.is_64bit(), "REV32 needs X registers");
        self.encode_data1(2, rd, rn);
    }

    /// REV: reverse all bytes of the register.
    pub fn rev(&mut self, rd: Reg, rn: Reg) {
        self.encode_data1(if rd.is_64bit() { 3 } else { 2 }, rd, rn);
    }

    pub fn clz(&mut self, rd: Reg, rn: Reg) {
        self.encode_data1(4, rd, rn);
    }

    pub fn cls(&mut self, rd: Reg, rn: Reg) {
        self.encode_data1(5, rd, rn);
    }

    fn encode_data2(&mut self, opcode: u32, rd: Reg, rn: Reg, rm: Reg) {
        // sf 0 0 11010110 Rm opcode Rn Rd
        self.emit_raw(rd.sf() | 0x1AC00000 | (rm.code() << 16) | (opcode << 10) | rd_rn(rd, rn));
    }

    pub fn udiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_data2(0b000010, rd, rn, rm);
    }

    pub fn sdiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_data2(0b000011, rd, rn, rm);
    }

    pub fn lslv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_data2(0b001000, rd, rn, rm);
    }

    pub fn lsrv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_data2(0b001001, rd, rn, rm);
    }

    pub fn asrv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_data2(0b001010, rd, rn, rm);
    }

    pub fn rorv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_data2(0b001011, rd, rn, rm);
    }

    fn encode_data3(&mut self, base: u32, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        // sf 00 11011 op31 Rm o0 Ra Rn Rd
        let inst = base | (rm.code() << 16) | (ra.code() << 10) | rd_rn(rd, rn);
        self.emit_raw(inst);
    }

    /// MADD Rd, Rn, Rm, Ra: Ra + Rn * Rm
    pub fn madd(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.encode_data3(rd.sf() | 0x1B000000, rd, rn, rm, ra);
    }

    /// MSUB Rd, Rn, Rm, Ra: Ra - Rn * Rm
    pub fn msub(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.encode_data3(rd.sf() | 0x1B008000, rd, rn, rm, ra);
    }

    /// MUL Rd, Rn, Rm
    pub fn mul(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.madd(rd, rn, rm, zr(rd));
    }

    /// MNEG Rd, Rn, Rm
    pub fn mneg(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.msub(rd, rn, rm, zr(rd));
    }

    /// SMADDL Xd, Wn, Wm, Xa
    pub fn smaddl(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.encode_data3(0x9B200000, rd, rn, rm, ra);
    }

    /// SMULL Xd, Wn, Wm
    pub fn smull(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.smaddl(rd, rn, rm, Reg::ZR);
    }

    /// SMULH Xd, Xn, Xm
    pub fn smulh(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_data3(0x9B400000, rd, rn, rm, Reg::ZR);
    }

    /// UMADDL Xd, Wn, Wm, Xa
    pub fn umaddl(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.encode_data3(0x9BA00000, rd, rn, rm, ra);
    }

    /// UMULL Xd, Wn, Wm
    pub fn umull(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.umaddl(rd, rn, rm, Reg::ZR);
    }

    /// UMULH Xd, Xn, Xm
    pub fn umulh(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_data3(0x9BC00000, rd, rn, rm, Reg::ZR);
    }

    // ==================== Logical ====================

    fn encode_logical(&mut self, base: u32, rd: Reg, rn: Reg, option: ArithOption) {
        let ArithOption::Shifted { rm, shift, amount } = option else {
            panic!("logical instructions take no extended register operand");
        };
        assert!((amount as u32) < rd.bits(), "shift amount {} out of range", amount);
        // sf opc 01010 shift N Rm imm6 Rn Rd
        let inst = rd.sf()
            | base
            | ((shift as u32) << 22)
            | (rm.code() << 16)
            | ((amount as u32) << 10)
            | rd_rn(rd, rn);
        self.emit_raw(inst);
    }

    /// AND Rd, Rn, Rm
    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_logical(AND, rd, rn, ArithOption::reg(rm));
    }

    pub fn and_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_logical(AND, rd, rn, option);
    }

    pub fn bic(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_logical(BIC, rd, rn, ArithOption::reg(rm));
    }

    pub fn bic_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_logical(BIC, rd, rn, option);
    }

    /// ORR Rd, Rn, Rm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_logical(ORR, rd, rn, ArithOption::reg(rm));
    }

    pub fn orr_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_logical(ORR, rd, rn, option);
    }

    pub fn orn(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_logical(ORN, rd, rn, ArithOption::reg(rm));
    }

    pub fn orn_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_logical(ORN, rd, rn, option);
    }

    /// EOR Rd, Rn, Rm
    pub fn eor(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_logical(EOR, rd, rn, ArithOption::reg(rm));
    }

    pub fn eor_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_logical(EOR, rd, rn, option);
    }

    pub fn eon(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_logical(EON, rd, rn, ArithOption::reg(rm));
    }

    pub fn ands(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_logical(ANDS, rd, rn, ArithOption::reg(rm));
    }

    pub fn ands_opt(&mut self, rd: Reg, rn: Reg, option: ArithOption) {
        self.encode_logical(ANDS, rd, rn, option);
    }

    pub fn bics(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.encode_logical(BICS, rd, rn, ArithOption::reg(rm));
    }

    /// TST Rn, Rm (ANDS ZR, Rn, Rm)
    pub fn tst(&mut self, rn: Reg, rm: Reg) {
        self.encode_logical(ANDS, zr(rn), rn, ArithOption::reg(rm));
    }

    /// MOV Rd, Rm
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        if rd.is_sp() || rm.is_sp() {
            self.add_imm(rd, rm, 0, false);
        } else {
            // ORR Rd, ZR, Rm
            self.encode_logical(ORR, rd, zr(rd), ArithOption::reg(rm));
        }
    }

    /// MVN Rd, Rm (ORN Rd, ZR, Rm)
    pub fn mvn(&mut self, rd: Reg, rm: Reg) {
        self.encode_logical(ORN, rd, zr(rd), ArithOption::reg(rm));
    }

    fn encode_logical_imm(&mut self, base: u32, rd: Reg, rn: Reg, imm: LogicalImm) {
        // sf opc 100100 N immr imms Rn Rd
        assert!(rd.is_64bit() || !imm.n, "64-bit element in a 32-bit logical immediate");
        self.emit_raw(rd.sf() | base | imm.fields() | rd_rn(rd, rn));
    }

    /// AND Rd, Rn, #imm
    pub fn and_imm(&mut self, rd: Reg, rn: Reg, imm: LogicalImm) {
        self.encode_logical_imm(0x12000000, rd, rn, imm);
    }

    /// ORR Rd, Rn, #imm
    pub fn orr_imm(&mut self, rd: Reg, rn: Reg, imm: LogicalImm) {
        self.encode_logical_imm(0x32000000, rd, rn, imm);
    }

    /// EOR Rd, Rn, #imm
    pub fn eor_imm(&mut self, rd: Reg, rn: Reg, imm: LogicalImm) {
        self.encode_logical_imm(0x52000000, rd, rn, imm);
    }

    /// ANDS Rd, Rn, #imm
    pub fn ands_imm(&mut self, rd: Reg, rn: Reg, imm: LogicalImm) {
        self.encode_logical_imm(0x72000000, rd, rn, imm);
    }

    /// TST Rn, #imm
    pub fn tst_imm(&mut self, rn: Reg, imm: LogicalImm) {
        self.encode_logical_imm(0x72000000, zr(rn), rn, imm);
    }

    // ==================== Move wide ====================

    fn encode_move_wide(&mut self, base: u32, rd: Reg, imm16: u32, shift: u32) {
        assert!(imm16 <= 0xFFFF, "move-wide immediate {:#x} exceeds 16 bits", imm16);
        assert!(
            shift % 16 == 0 && shift < rd.bits(),
            "move-wide shift {} invalid for {:?}",
            shift,
            rd
        );
        // sf opc 100101 hw imm16 Rd
        self.emit_raw(rd.sf() | base | ((shift / 16) << 21) | (imm16 << 5) | rd.code());
    }

    /// MOVZ Rd, #imm16, LSL #shift
    pub fn movz(&mut self, rd: Reg, imm16: u32, shift: u32) {
        self.encode_move_wide(0x52800000, rd, imm16, shift);
    }

    /// MOVN Rd, #imm16, LSL #shift
    pub fn movn(&mut self, rd: Reg, imm16: u32, shift: u32) {
        self.encode_move_wide(0x12800000, rd, imm16, shift);
    }

    /// MOVK Rd, #imm16, LSL #shift
    pub fn movk(&mut self, rd: Reg, imm16: u32, shift: u32) {
        self.encode_move_wide(0x72800000, rd, imm16, shift);
    }

    // ==================== Bitfield ====================

    fn encode_bitfield(&mut self, base: u32, rd: Reg, rn: Reg, immr: u32, imms: u32) {
        let size = rd.bits();
        assert!(immr < size && imms < size, "bitfield #{}, #{} out of range", immr, imms);
        // sf opc 100110 N immr imms Rn Rd
        let n = (rd.is_64bit() as u32) << 22;
        self.emit_raw(rd.sf() | base | n | (immr << 16) | (imms << 10) | rd_rn(rd, rn));
    }

    pub fn sbfm(&mut self, rd: Reg, rn: Reg, immr: u32, imms: u32) {
        self.encode_bitfield(0x13000000, rd, rn, immr, imms);
    }

    pub fn bfm(&mut self, rd: Reg, rn: Reg, immr: u32, imms: u32) {
        self.encode_bitfield(0x33000000, rd, rn, immr, imms);
    }

    pub fn ubfm(&mut self, rd: Reg, rn: Reg, immr: u32, imms: u32) {
        self.encode_bitfield(0x53000000, rd, rn, immr, imms);
    }

    fn check_field(rd: Reg, lsb: u32, width: u32) {
        assert!(
            width >= 1 && lsb + width <= rd.bits(),
            "bitfield lsb {} width {} out of range",
            lsb,
            width
        );
    }

    /// BFI Rd, Rn, #lsb, #width
    pub fn bfi(&mut self, rd: Reg, rn: Reg, lsb: u32, width: u32) {
        Self::check_field(rd, lsb, width);
        let size = rd.bits();
        self.bfm(rd, rn, (size - lsb) % size, width - 1);
    }

    /// BFXIL Rd, Rn, #lsb, #width
    pub fn bfxil(&mut self, rd: Reg, rn: Reg, lsb: u32, width: u32) {
        Self::check_field(rd, lsb, width);
        self.bfm(rd, rn, lsb, lsb + width - 1);
    }

    /// UBFIZ Rd, Rn, #lsb, #width
    pub fn ubfiz(&mut self, rd: Reg, rn: Reg, lsb: u32, width: u32) {
        Self::check_field(rd, lsb, width);
        let size = rd.bits();
        self.ubfm(rd, rn, (size - lsb) % size, width - 1);
    }

    /// SBFIZ Rd, Rn, #lsb, #width
    pub fn sbfiz(&mut self, rd: Reg, rn: Reg, lsb: u32, width: u32) {
        Self::check_field(rd, lsb, width);
        let size = rd.bits();
        self.sbfm(rd, rn, (size - lsb) % size, width - 1);
    }

    /// UBFX Rd, Rn, #lsb, #width
    pub fn ubfx(&mut self, rd: Reg, rn: Reg, lsb: u32, width: u32) {
        Self::check_field(rd, lsb, width);
        self.ubfm(rd, rn, lsb, lsb + width - 1);
    }

    /// SBFX Rd, Rn, #lsb, #width
    pub fn sbfx(&mut self, rd: Reg, rn: Reg, lsb: u32, width: u32) {
        Self::check_field(rd, lsb, width);
        self.sbfm(rd, rn, lsb, lsb + width - 1);
    }

    pub fn sxtb(&mut self, rd: Reg, rn: Reg) {
        self.sbfm(rd, rn, 0, 7);
    }

    pub fn sxth(&mut self, rd: Reg, rn: Reg) {
        self.sbfm(rd, rn, 0, 15);
    }

    /// SXTW Xd, Wn
    pub fn sxtw(&mut self, rd: Reg, rn: Reg) {
        assert!(rd.is_64bit(), "SXTW needs a 64-bit destination");
        self.sbfm(rd, rn, 0, 31);
    }

    pub fn uxtb(&mut self, rd: Reg, rn: Reg) {
        self.ubfm(rd.to_32(), rn, 0, 7);
    }

    pub fn uxth(&mut self, rd: Reg, rn: Reg) {
        self.ubfm(rd.to_32(), rn, 0, 15);
    }

    /// LSL Rd, Rn, #shift
    pub fn lsl_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        let size = rd.bits();
        assert!(shift < size, "shift {} out of range", shift);
        self.ubfm(rd, rn, (size - shift) % size, size - 1 - shift);
    }

    /// LSR Rd, Rn, #shift
    pub fn lsr_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        self.ubfm(rd, rn, shift, rd.bits() - 1);
    }

    /// ASR Rd, Rn, #shift
    pub fn asr_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        self.sbfm(rd, rn, shift, rd.bits() - 1);
    }

    /// ROR Rd, Rn, #shift
    pub fn ror_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        self.extr(rd, rn, rn, shift);
    }

    /// EXTR Rd, Rn, Rm, #lsb
    pub fn extr(&mut self, rd: Reg, rn: Reg, rm: Reg, lsb: u32) {
        assert!(lsb < rd.bits(), "EXTR lsb {} out of range", lsb);
        // sf 00 100111 N 0 Rm imms Rn Rd
        let n = (rd.is_64bit() as u32) << 22;
        self.emit_raw(rd.sf() | 0x13800000 | n | (rm.code() << 16) | (lsb << 10) | rd_rn(rd, rn));
    }

    // ==================== Load / store ====================

    /// Access size as log2(bytes) for a plain LDR/STR of `rt`.
    fn transfer_size(rt: Reg) -> u32 {
        match rt.bits() {
            32 => 2,
            64 => 3,
            _ => 4,
        }
    }

    /// Shared immediate-offset encoder. `size` is log2 of the access size
    /// (4 for Q registers).
    pub(crate) fn encode_load_store(
        &mut self,
        size: u32,
        opc: u32,
        rt: Reg,
        rn: Reg,
        index: IndexType,
        offset: i32,
    ) {
        let (size_field, opc, vector) = Self::size_fields(size, opc, rt);
        let inst = match index {
            IndexType::Unsigned => {
                let scale = 1i32 << size;
                assert!(
                    offset >= 0 && offset % scale == 0 && offset / scale < 4096,
                    "unsigned offset {} invalid for {}-byte access",
                    offset,
                    scale
                );
                // size 111 V 01 opc imm12 Rn Rt
                0x39000000
                    | (size_field << 30)
                    | vector
                    | (opc << 22)
                    | (((offset / scale) as u32) << 10)
                    | rd_rn(rt, rn)
            }
            IndexType::Pre | IndexType::Post => {
                assert!((-256..=255).contains(&offset), "index offset {} out of range", offset);
                let mode = if index == IndexType::Pre { 0b11 } else { 0b01 };
                // size 111 V 00 opc 0 imm9 mode Rn Rt
                0x38000000
                    | (size_field << 30)
                    | vector
                    | (opc << 22)
                    | (((offset as u32) & 0x1FF) << 12)
                    | (mode << 10)
                    | rd_rn(rt, rn)
            }
            IndexType::Signed => panic!("signed offset addressing only exists for pairs"),
        };
        self.emit_raw(inst);
    }

    /// Split a log2 access size into the `size` field, the adjusted opc and
    /// the V bit.
    fn size_fields(size: u32, opc: u32, rt: Reg) -> (u32, u32, u32) {
        if rt.is_vector() {
            if size == 4 { (0, opc | 2, 1 << 26) } else { (size, opc, 1 << 26) }
        } else {
            (size, opc, 0)
        }
    }

    fn encode_load_store_reg(&mut self, size: u32, opc: u32, rt: Reg, rn: Reg, index: IndexReg) {
        assert!(
            matches!(
                index.extend,
                ExtendType::Uxtw | ExtendType::Uxtx | ExtendType::Sxtw | ExtendType::Sxtx
            ),
            "invalid index extend {:?}",
            index.extend
        );
        let (size_field, opc, vector) = Self::size_fields(size, opc, rt);
        // size 111 V 00 opc 1 Rm option S 10 Rn Rt
        let inst = 0x38200800
            | (size_field << 30)
            | vector
            | (opc << 22)
            | (index.rm.code() << 16)
            | ((index.extend as u32) << 13)
            | ((index.scaled as u32) << 12)
            | rd_rn(rt, rn);
        self.emit_raw(inst);
    }

    fn encode_load_store_unscaled(&mut self, size: u32, opc: u32, rt: Reg, rn: Reg, offset: i32) {
        assert!((-256..=255).contains(&offset), "unscaled offset {} out of range", offset);
        let (size_field, opc, vector) = Self::size_fields(size, opc, rt);
        // size 111 V 00 opc 0 imm9 00 Rn Rt
        let inst = 0x38000000
            | (size_field << 30)
            | vector
            | (opc << 22)
            | (((offset as u32) & 0x1FF) << 12)
            | rd_rn(rt, rn);
        self.emit_raw(inst);
    }

    /// LDR Rt, [Rn, #offset] with the given addressing mode.
    pub fn ldr(&mut self, rt: Reg, rn: Reg, index: IndexType, offset: i32) {
        self.encode_load_store(Self::transfer_size(rt), 1, rt, rn, index, offset);
    }

    /// STR Rt, [Rn, #offset] with the given addressing mode.
    pub fn str(&mut self, rt: Reg, rn: Reg, index: IndexType, offset: i32) {
        self.encode_load_store(Self::transfer_size(rt), 0, rt, rn, index, offset);
    }

    pub fn ldrb(&mut self, rt: Reg, rn: Reg, index: IndexType, offset: i32) {
        self.encode_load_store(0, 1, rt.to_32(), rn, index, offset);
    }

    pub fn strb(&mut self, rt: Reg, rn: Reg, index: IndexType, offset: i32) {
        self.encode_load_store(0, 0, rt.to_32(), rn, index, offset);
    }

    pub fn ldrh(&mut self, rt: Reg, rn: Reg, index: IndexType, offset: i32) {
        self.encode_load_store(1, 1, rt.to_32(), rn, index, offset);
    }

    pub fn strh(&mut self, rt: Reg, rn: Reg, index: IndexType, offset: i32) {
        self.encode_load_store(1, 0, rt.to_32(), rn, index, offset);
    }

    /// LDRSB: sign-extends into the width of `rt`.
    pub fn ldrsb(&mut self, rt: Reg, rn: Reg, index: IndexType, offset: i32) {
        let opc = if rt.is_64bit() { 2 } else { 3 };
        self.encode_load_store(0, opc, rt, rn, index, offset);
    }

    /// LDRSH: sign-extends into the width of `rt`.
    pub fn ldrsh(&mut self, rt: Reg, rn: Reg, index: IndexType, offset: i32) {
        let opc = if rt.is_64bit() { 2 } else { 3 };
        self.encode_load_store(1, opc, rt, rn, index, offset);
    }

    /// LDRSW Xt, ...
    pub fn ldrsw(&mut self, rt: Reg, rn: Reg, index: IndexType, offset: i32) {
        assert!(rt.is_64bit(), "LDRSW needs a 64-bit destination");
        self.encode_load_store(2, 2, rt, rn, index, offset);
    }

    /// LDR Rt, [Rn, Rm{, extend}]
    pub fn ldr_reg(&mut self, rt: Reg, rn: Reg, index: IndexReg) {
        self.encode_load_store_reg(Self::transfer_size(rt), 1, rt, rn, index);
    }

    pub fn str_reg(&mut self, rt: Reg, rn: Reg, index: IndexReg) {
        self.encode_load_store_reg(Self::transfer_size(rt), 0, rt, rn, index);
    }

    pub fn ldrb_reg(&mut self, rt: Reg, rn: Reg, index: IndexReg) {
        self.encode_load_store_reg(0, 1, rt.to_32(), rn, index);
    }

    pub fn strb_reg(&mut self, rt: Reg, rn: Reg, index: IndexReg) {
        self.encode_load_store_reg(0, 0, rt.to_32(), rn, index);
    }

    pub fn ldrh_reg(&mut self, rt: Reg, rn: Reg, index: IndexReg) {
        self.encode_load_store_reg(1, 1, rt.to_32(), rn, index);
    }

    pub fn strh_reg(&mut self, rt: Reg, rn: Reg, index: IndexReg) {
        self.encode_load_store_reg(1, 0, rt.to_32(), rn, index);
    }

    pub fn ldrsb_reg(&mut self, rt: Reg, rn: Reg, index: IndexReg) {
        let opc = if rt.is_64bit() { 2 } else { 3 };
        self.encode_load_store_reg(0, opc, rt, rn, index);
    }

    pub fn ldrsh_reg(&mut self, rt: Reg, rn: Reg, index: IndexReg) {
        let opc = if rt.is_64bit() { 2 } else { 3 };
        self.encode_load_store_reg(1, opc, rt, rn, index);
    }

    /// LDUR Rt, [Rn, #simm9]
    pub fn ldur(&mut self, rt: Reg, rn: Reg, offset: i32) {
        self.encode_load_store_unscaled(Self::transfer_size(rt), 1, rt, rn, offset);
    }

    /// STUR Rt, [Rn, #simm9]
    pub fn stur(&mut self, rt: Reg, rn: Reg, offset: i32) {
        self.encode_load_store_unscaled(Self::transfer_size(rt), 0, rt, rn, offset);
    }

    fn encode_pair(&mut self, load: bool, index: IndexType, rt: Reg, rt2: Reg, rn: Reg, imm: i32) {
        let (opc, vector, scale) = match rt.kind() {
            super::RegKind::S => (0b00, 1, 2),
            super::RegKind::D => (0b01, 1, 3),
            super::RegKind::Q => (0b10, 1, 4),
            _ if rt.is_64bit() => (0b10, 0, 3),
            _ => (0b00, 0, 2),
        };
        let mode = match index {
            IndexType::Post => 0b001,
            IndexType::Signed => 0b010,
            IndexType::Pre => 0b011,
            IndexType::Unsigned => panic!("pairs have no unsigned offset form"),
        };
        let step = 1i32 << scale;
        assert!(imm % step == 0, "pair offset {} not a multiple of {}", imm, step);
        let imm7 = imm / step;
        assert!((-64..=63).contains(&imm7), "pair offset {} out of range", imm);
        // opc 101 V 0 mode L imm7 Rt2 Rn Rt
        let inst = (opc << 30)
            | (0b101 << 27)
            | (vector << 26)
            | (mode << 23)
            | ((load as u32) << 22)
            | (((imm7 as u32) & 0x7F) << 15)
            | (rt2.code() << 10)
            | rd_rn(rt, rn);
        self.emit_raw(inst);
    }

    /// STP Rt, Rt2, [Rn, #imm] with the given addressing mode.
    pub fn stp(&mut self, index: IndexType, rt: Reg, rt2: Reg, rn: Reg, imm: i32) {
        self.encode_pair(false, index, rt, rt2, rn, imm);
    }

    /// LDP Rt, Rt2, [Rn, #imm] with the given addressing mode.
    pub fn ldp(&mut self, index: IndexType, rt: Reg, rt2: Reg, rn: Reg, imm: i32) {
        self.encode_pair(true, index, rt, rt2, rn, imm);
    }

    /// LDR Rt, <literal at target>
    pub fn ldr_literal(&mut self, rt: Reg, target: usize) {
        let distance = (target as i64 - self.code_ptr() as i64) >> 2;
        assert!(
            (-0x40000..=0x3FFFF).contains(&distance),
            "literal at {:#x} out of range",
            target
        );
        let base = match rt.kind() {
            super::RegKind::S => 0x1C000000,
            super::RegKind::D => 0x5C000000,
            super::RegKind::Q => 0x9C000000,
            _ if rt.is_64bit() => 0x58000000,
            _ => 0x18000000,
        };
        self.emit_raw(base | ((distance as u32 & 0x7FFFF) << 5) | rt.code());
    }

    /// LDAR Rt, [Xn]
    pub fn ldar(&mut self, rt: Reg, rn: Reg) {
        let base = if rt.is_64bit() { 0xC8DFFC00 } else { 0x88DFFC00 };
        self.emit_raw(base | rd_rn(rt, rn));
    }

    /// STLR Rt, [Xn]
    pub fn stlr(&mut self, rt: Reg, rn: Reg) {
        let base = if rt.is_64bit() { 0xC89FFC00 } else { 0x889FFC00 };
        self.emit_raw(base | rd_rn(rt, rn));
    }

    /// LDXR Rt, [Xn]
    pub fn ldxr(&mut self, rt: Reg, rn: Reg) {
        let base = if rt.is_64bit() { 0xC85F7C00 } else { 0x885F7C00 };
        self.emit_raw(base | rd_rn(rt, rn));
    }

    /// STXR Ws, Rt, [Xn]
    pub fn stxr(&mut self, rs: Reg, rt: Reg, rn: Reg) {
        let base = if rt.is_64bit() { 0xC8007C00 } else { 0x88007C00 };
        self.emit_raw(base | (rs.code() << 16) | rd_rn(rt, rn));
    }

    // ==================== PC-relative addresses ====================

    /// ADR Xd, <target> (within ±1 MiB).
    pub fn adr(&mut self, rd: Reg, target: usize) {
        let offset = target as i64 - self.code_ptr() as i64;
        assert!(
            (-(1 << 20)..(1 << 20)).contains(&offset),
            "ADR target {:#x} out of range",
            target
        );
        self.encode_address(0x10000000, rd, offset);
    }

    /// ADRP Xd, <page of target> (within ±4 GiB).
    pub fn adrp(&mut self, rd: Reg, target: usize) {
        let pages = (target as i64 >> 12) - (self.code_ptr() as i64 >> 12);
        assert!(
            (-(1 << 20)..(1 << 20)).contains(&pages),
            "ADRP target {:#x} out of range",
            target
        );
        self.encode_address(0x90000000, rd, pages);
    }

    fn encode_address(&mut self, base: u32, rd: Reg, imm: i64) {
        // op immlo 10000 immhi Rd
        let imm = imm as u32;
        self.emit_raw(base | ((imm & 3) << 29) | (((imm >> 2) & 0x7FFFF) << 5) | rd.code());
    }

    // ==================== System ====================

    /// BRK #imm16
    pub fn brk(&mut self, imm16: u16) {
        self.emit_raw(0xD4200000 | ((imm16 as u32) << 5));
    }

    /// HLT #imm16
    pub fn hlt(&mut self, imm16: u16) {
        self.emit_raw(0xD4400000 | ((imm16 as u32) << 5));
    }

    /// SVC #imm16
    pub fn svc(&mut self, imm16: u16) {
        self.emit_raw(0xD4000001 | ((imm16 as u32) << 5));
    }

    /// HINT #op
    pub fn hint(&mut self, op: u8) {
        assert!(op < 128);
        self.emit_raw(0xD503201F | ((op as u32) << 5));
    }

    /// NOP
    pub fn nop(&mut self) {
        self.hint(0);
    }

    pub fn yield_hint(&mut self) {
        self.hint(1);
    }

    pub fn dmb(&mut self, barrier: BarrierType) {
        self.emit_raw(0xD50330BF | ((barrier as u32) << 8));
    }

    pub fn dsb(&mut self, barrier: BarrierType) {
        self.emit_raw(0xD503309F | ((barrier as u32) << 8));
    }

    /// ISB SY
    pub fn isb(&mut self) {
        self.emit_raw(0xD50330DF | ((BarrierType::Sy as u32) << 8));
    }

    /// MRS Xt, <sysreg>
    pub fn mrs(&mut self, rt: Reg, reg: SystemReg) {
        self.emit_raw(0xD5300000 | reg.encoding() | rt.code());
    }

    /// MSR <sysreg>, Xt
    pub fn msr(&mut self, reg: SystemReg, rt: Reg) {
        self.emit_raw(0xD5100000 | reg.encoding() | rt.code());
    }
}
