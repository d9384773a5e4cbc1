//! Immediate materialisation (`movi2r` and friends) and the immediate
//! forms of add/sub/logical operations that fall back to a scratch
//! register when the value has no direct encoding.

use super::emitter::zr;
use super::{Arm64Emitter, LogicalImm, Reg, fp_to_imm8, is_imm_arithmetic};

/// How the first instruction of a `movi2r` sequence seeds the register.
/// Ordered: everything after `MovnBase` costs one extra instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MovApproach {
    MovzBase,
    MovnBase,
    AdrBase,
    AdrpBase,
    OrrBase,
}

/// One 16-bit chunk still to be inserted after the base instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovPart {
    pub imm: u16,
    pub shift: u32,
}

/// Instruction sequence chosen for one immediate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovPlan {
    pub approach: MovApproach,
    /// Register value after the base instruction.
    pub base: u64,
    /// Halfwords where the value differs from `base`.
    pub parts: Vec<MovPart>,
    pub is_64: bool,
}

impl MovPlan {
    fn cost(approach: MovApproach, parts: &[MovPart]) -> usize {
        parts.len() + (approach > MovApproach::MovnBase) as usize
    }

    /// Number of instruction words the plan emits.
    pub fn instruction_count(&self) -> usize {
        match self.approach {
            // MOVZ/MOVN always emit their base instruction.
            MovApproach::MovzBase | MovApproach::MovnBase => self.parts.len().max(1),
            _ => self.parts.len() + 1,
        }
    }
}

fn sign_extend_21(x: u64) -> i64 {
    ((x << 43) as i64) >> 43
}

/// Choose the shortest sequence that leaves `value` in a register, with
/// the sequence placed at `pc`.
///
/// Candidates are MOVZ (+MOVK), MOVN (+MOVK), ADR/ADRP (+MOVK/ADD, 64-bit
/// only) and ORR of a bitmask immediate (+MOVK). The first instruction
/// always writes the whole register.
pub fn plan_movi2r(value: u64, is_64: bool, pc: usize) -> MovPlan {
    let (mask, max_parts, width) = if is_64 {
        (u64::MAX, 4, 64)
    } else {
        (0xFFFF_FFFF, 2, 32)
    };
    let imm = value & mask;

    let parts_from = |base: u64| -> Vec<MovPart> {
        (0..max_parts)
            .filter_map(|i| {
                let shift = i * 16;
                let imm_half = (imm >> shift) as u16;
                let base_half = (base >> shift) as u16;
                (imm_half != base_half).then_some(MovPart { imm: imm_half, shift })
            })
            .collect()
    };

    let mut best = MovPlan {
        approach: MovApproach::MovzBase,
        base: 0,
        parts: parts_from(0),
        is_64,
    };
    // Ties keep the earlier candidate.
    let try_base = |best: &mut MovPlan, base: u64, approach: MovApproach| {
        let parts = parts_from(base);
        if MovPlan::cost(approach, &parts) < MovPlan::cost(best.approach, &best.parts) {
            *best = MovPlan { approach, base, parts, is_64 };
        }
    };

    try_base(&mut best, mask, MovApproach::MovnBase);

    if is_64 {
        let pc = pc as u64;
        let adrp_offset = sign_extend_21((imm >> 12).wrapping_sub(pc >> 12)) << 12;
        let adr_offset = sign_extend_21(imm.wrapping_sub(pc));
        try_base(&mut best, (pc & !0xFFF).wrapping_add(adrp_offset as u64), MovApproach::AdrpBase);
        try_base(&mut best, pc.wrapping_add(adr_offset as u64), MovApproach::AdrBase);
    }

    // Bitmask classification is not free; skip it once a single
    // instruction is already known.
    if MovPlan::cost(best.approach, &best.parts) > 1 {
        if is_64 {
            for orr_imm in [
                (imm << 32) | (imm & 0x0000_0000_FFFF_FFFF),
                (imm & 0xFFFF_FFFF_0000_0000) | (imm >> 32),
                (imm << 48) | (imm & 0x0000_FFFF_FFFF_0000) | (imm >> 48),
            ] {
                if LogicalImm::new(orr_imm, width).valid {
                    try_base(&mut best, orr_imm, MovApproach::OrrBase);
                }
            }
        } else if LogicalImm::new(imm, width).valid {
            try_base(&mut best, imm, MovApproach::OrrBase);
        }
    }

    best
}

impl Arm64Emitter {
    fn emit_mov_plan(&mut self, rd: Reg, plan: &MovPlan) {
        let width = if plan.is_64 { 64 } else { 32 };
        let mut parts = plan.parts.iter();

        match plan.approach {
            MovApproach::MovzBase => {
                let first = parts.next().copied().unwrap_or(MovPart { imm: 0, shift: 0 });
                self.movz(rd, first.imm as u32, first.shift);
            }
            MovApproach::MovnBase => {
                let first = parts.next().copied().unwrap_or(MovPart { imm: 0xFFFF, shift: 0 });
                self.movn(rd, !first.imm as u32, first.shift);
            }
            MovApproach::AdrBase => self.adr(rd, plan.base as usize),
            MovApproach::AdrpBase => self.adrp(rd, plan.base as usize),
            MovApproach::OrrBase => self.orr_imm(rd, zr(rd), LogicalImm::new(plan.base, width)),
        }

        for part in parts {
            if plan.approach == MovApproach::AdrpBase && part.shift == 0 {
                // ADRP + ADD is fused by many cores. Bits 12..15 already
                // match because ADRP selected the right page.
                debug_assert_eq!(part.imm as u64 & 0xF000, plan.base & 0xF000);
                self.add_imm(rd, rd, part.imm as u32 & 0xFFF, false);
            } else {
                self.movk(rd, part.imm as u32, part.shift);
            }
        }
    }

    /// Load an arbitrary immediate into `rd` with the shortest sequence.
    pub fn movi2r(&mut self, rd: Reg, imm: u64) {
        let plan = plan_movi2r(imm, rd.is_64bit(), self.code_ptr());
        self.emit_mov_plan(rd, &plan);
    }

    /// Load a host pointer.
    pub fn movp2r(&mut self, rd: Reg, ptr: usize) {
        assert!(rd.is_64bit(), "pointers need an X register");
        self.movi2r(rd, ptr as u64);
    }

    /// Load whichever of `imm1` and `imm2` is shorter to materialise.
    /// Returns `true` when `imm2` was chosen.
    pub fn movi2r2(&mut self, rd: Reg, imm1: u64, imm2: u64) -> bool {
        let pc = self.code_ptr();
        let plan1 = plan_movi2r(imm1, rd.is_64bit(), pc);
        let plan2 = plan_movi2r(imm2, rd.is_64bit(), pc);
        let second = plan1.instruction_count() > plan2.instruction_count();
        self.emit_mov_plan(rd, if second { &plan2 } else { &plan1 });
        second
    }

    fn add_immediate(&mut self, rd: Reg, rn: Reg, imm: u32, shift: bool, negative: bool, flags: bool) {
        match (negative, flags) {
            (false, false) => self.add_imm(rd, rn, imm, shift),
            (false, true) => self.adds_imm(rd, rn, imm, shift),
            (true, false) => self.sub_imm(rd, rn, imm, shift),
            (true, true) => self.subs_imm(rd, rn, imm, shift),
        }
    }

    fn addi2r_internal(
        &mut self,
        rd: Reg,
        rn: Reg,
        imm: u64,
        negative: bool,
        flags: bool,
        scratch: Option<Reg>,
    ) {
        debug_assert_eq!(rd.is_64bit(), rn.is_64bit());
        let (imm, imm_neg) = if rd.is_64bit() {
            (imm, imm.wrapping_neg())
        } else {
            let imm = imm & 0xFFFF_FFFF;
            (imm, imm.wrapping_neg() & 0xFFFF_FFFF)
        };
        let neg_negative = !negative;

        if imm == 0 && !flags {
            if rd == rn {
                return;
            }
            if !rd.is_sp() && !rn.is_sp() {
                self.mov(rd, rn);
                return;
            }
        }

        if imm <= 0xFFF {
            return self.add_immediate(rd, rn, imm as u32, false, negative, flags);
        }
        if imm <= 0xFFFFFF && imm & 0xFFF == 0 {
            return self.add_immediate(rd, rn, (imm >> 12) as u32, true, negative, flags);
        }
        if imm_neg <= 0xFFF {
            return self.add_immediate(rd, rn, imm_neg as u32, false, neg_negative, flags);
        }
        if imm_neg <= 0xFFFFFF && imm_neg & 0xFFF == 0 {
            return self.add_immediate(rd, rn, (imm_neg >> 12) as u32, true, neg_negative, flags);
        }

        // Two in-place adds cover 24 bits. They split the operation, so
        // the flags would be wrong.
        if !flags && (imm >= 0x10000 || scratch.is_none()) && imm < 0x1000000 {
            self.add_immediate(rd, rn, (imm & 0xFFF) as u32, false, negative, false);
            self.add_immediate(rd, rd, (imm >> 12) as u32, true, negative, false);
            return;
        }
        if !flags && (imm_neg >= 0x10000 || scratch.is_none()) && imm_neg < 0x1000000 {
            self.add_immediate(rd, rn, (imm_neg & 0xFFF) as u32, false, neg_negative, false);
            self.add_immediate(rd, rd, (imm_neg >> 12) as u32, true, neg_negative, false);
            return;
        }

        let Some(scratch) = scratch else {
            panic!("add/sub of {:#x} has no immediate form and needs a scratch register", imm);
        };
        let negative = negative ^ self.movi2r2(scratch, imm, imm_neg);
        match (negative, flags) {
            (false, false) => self.add(rd, rn, scratch),
            (false, true) => self.adds(rd, rn, scratch),
            (true, false) => self.sub(rd, rn, scratch),
            (true, true) => self.subs(rd, rn, scratch),
        }
    }

    /// Rd = Rn + imm
    pub fn addi2r(&mut self, rd: Reg, rn: Reg, imm: u64, scratch: Option<Reg>) {
        self.addi2r_internal(rd, rn, imm, false, false, scratch);
    }

    /// Rd = Rn + imm, setting flags
    pub fn addsi2r(&mut self, rd: Reg, rn: Reg, imm: u64, scratch: Option<Reg>) {
        self.addi2r_internal(rd, rn, imm, false, true, scratch);
    }

    /// Rd = Rn - imm
    pub fn subi2r(&mut self, rd: Reg, rn: Reg, imm: u64, scratch: Option<Reg>) {
        self.addi2r_internal(rd, rn, imm, true, false, scratch);
    }

    /// Rd = Rn - imm, setting flags
    pub fn subsi2r(&mut self, rd: Reg, rn: Reg, imm: u64, scratch: Option<Reg>) {
        self.addi2r_internal(rd, rn, imm, true, true, scratch);
    }

    /// Compare Rn with imm
    pub fn cmpi2r(&mut self, rn: Reg, imm: u64, scratch: Option<Reg>) {
        self.addi2r_internal(zr(rn), rn, imm, true, true, scratch);
    }

    pub fn try_addi2r(&mut self, rd: Reg, rn: Reg, imm: u64) -> bool {
        let Some((imm12, shift)) = is_imm_arithmetic(imm) else { return false };
        self.add_imm(rd, rn, imm12, shift);
        true
    }

    pub fn try_subi2r(&mut self, rd: Reg, rn: Reg, imm: u64) -> bool {
        let Some((imm12, shift)) = is_imm_arithmetic(imm) else { return false };
        self.sub_imm(rd, rn, imm12, shift);
        true
    }

    pub fn try_cmpi2r(&mut self, rn: Reg, imm: u64) -> bool {
        let Some((imm12, shift)) = is_imm_arithmetic(imm) else { return false };
        self.cmp_imm(rn, imm12, shift);
        true
    }

    fn logical_imm_for(rd: Reg, imm: u64) -> LogicalImm {
        LogicalImm::new(imm, if rd.is_64bit() { 64 } else { 32 })
    }

    pub fn try_andi2r(&mut self, rd: Reg, rn: Reg, imm: u64) -> bool {
        let li = Self::logical_imm_for(rd, imm);
        if li.valid {
            self.and_imm(rd, rn, li);
        }
        li.valid
    }

    pub fn try_orri2r(&mut self, rd: Reg, rn: Reg, imm: u64) -> bool {
        let li = Self::logical_imm_for(rd, imm);
        if li.valid {
            self.orr_imm(rd, rn, li);
        }
        li.valid
    }

    pub fn try_eori2r(&mut self, rd: Reg, rn: Reg, imm: u64) -> bool {
        let li = Self::logical_imm_for(rd, imm);
        if li.valid {
            self.eor_imm(rd, rn, li);
        }
        li.valid
    }

    /// Replicate a 32-bit operand so that "all ones" can be tested on the
    /// full word.
    fn widen_logical(rn: Reg, imm: u64) -> u64 {
        if rn.is_64bit() {
            imm
        } else {
            (imm << 32) | (imm & 0xFFFF_FFFF)
        }
    }

    /// The caller's scratch in the width of `rn`, so W-sized operations
    /// only materialise 32 bits.
    fn scratch_for(scratch: Option<Reg>, rn: Reg, op: &str, imm: u64) -> Reg {
        match scratch {
            Some(reg) => reg.with_width_of(rn),
            None => panic!("{} of {:#x} has no logical immediate form and needs a scratch register", op, imm),
        }
    }

    /// Rd = Rn & imm
    pub fn andi2r(&mut self, rd: Reg, rn: Reg, imm: u64, scratch: Option<Reg>) {
        let imm = Self::widen_logical(rn, imm);
        if imm == 0 {
            self.movz(rd, 0, 0);
        } else if !imm == 0 {
            if rd != rn {
                self.mov(rd, rn);
            }
        } else if LogicalImm::new(imm, 64).valid {
            self.and_imm(rd, rn, Self::logical_imm_for(rd, imm));
        } else {
            let scratch = Self::scratch_for(scratch, rn, "AND", imm);
            self.movi2r(scratch, imm);
            self.and(rd, rn, scratch);
        }
    }

    /// Rd = Rn | imm
    pub fn orri2r(&mut self, rd: Reg, rn: Reg, imm: u64, scratch: Option<Reg>) {
        let imm = Self::widen_logical(rn, imm);
        if imm == 0 {
            if rd != rn {
                self.mov(rd, rn);
            }
        } else if !imm == 0 {
            self.movn(rd, 0, 0);
        } else if LogicalImm::new(imm, 64).valid {
            self.orr_imm(rd, rn, Self::logical_imm_for(rd, imm));
        } else {
            let scratch = Self::scratch_for(scratch, rn, "ORR", imm);
            self.movi2r(scratch, imm);
            self.orr(rd, rn, scratch);
        }
    }

    /// Rd = Rn ^ imm
    pub fn eori2r(&mut self, rd: Reg, rn: Reg, imm: u64, scratch: Option<Reg>) {
        let imm = Self::widen_logical(rn, imm);
        if imm == 0 {
            if rd != rn {
                self.mov(rd, rn);
            }
        } else if !imm == 0 {
            self.mvn(rd, rn);
        } else if LogicalImm::new(imm, 64).valid {
            self.eor_imm(rd, rn, Self::logical_imm_for(rd, imm));
        } else {
            let scratch = Self::scratch_for(scratch, rn, "EOR", imm);
            self.movi2r(scratch, imm);
            self.eor(rd, rn, scratch);
        }
    }

    /// Rd = Rn & imm, setting flags
    pub fn andsi2r(&mut self, rd: Reg, rn: Reg, imm: u64, scratch: Option<Reg>) {
        let imm = Self::widen_logical(rn, imm);
        if imm == 0 {
            let z = zr(rn);
            self.ands(rd, z, z);
        } else if !imm == 0 {
            self.ands(rd, rn, rn);
        } else if LogicalImm::new(imm, 64).valid {
            self.ands_imm(rd, rn, Self::logical_imm_for(rd, imm));
        } else {
            let scratch = Self::scratch_for(scratch, rn, "ANDS", imm);
            self.movi2r(scratch, imm);
            self.ands(rd, rn, scratch);
        }
    }

    /// Load a floating-point constant into `rd` (S or D). Values without an
    /// FMOV immediate go through `scratch`.
    pub fn movi2f(&mut self, rd: Reg, value: f64, scratch: Option<Reg>) {
        let single = rd.is_single();
        let representable = !single || (value as f32) as f64 == value;
        if value.to_bits() == 0 {
            self.float().fmov_from_gpr(rd, if single { Reg::WZR } else { Reg::ZR });
        } else if let Some(imm8) = fp_to_imm8(value).filter(|_| representable) {
            self.float().fmov_imm(rd, imm8);
        } else {
            let scratch = match scratch {
                Some(reg) => reg,
                None => panic!("float constant {} needs a scratch register", value),
            };
            if single {
                let gpr = scratch.to_32();
                self.movi2r(gpr, (value as f32).to_bits() as u64);
                self.float().fmov_from_gpr(rd, gpr);
            } else {
                let gpr = scratch.to_64();
                self.movi2r(gpr, value.to_bits());
                self.float().fmov_from_gpr(rd, gpr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(f: impl FnOnce(&mut Arm64Emitter)) -> Vec<u32> {
        let mut e = Arm64Emitter::with_capacity(256);
        let start = e.code_ptr();
        f(&mut e);
        e.buffer().words(start, e.code_ptr())
    }

    #[test]
    fn test_plan_single_instruction_values() {
        let zero = plan_movi2r(0, true, 0);
        assert_eq!(zero.approach, MovApproach::MovzBase);
        assert_eq!(zero.instruction_count(), 1);

        let ones = plan_movi2r(u64::MAX, true, 0);
        assert_eq!(ones.approach, MovApproach::MovnBase);
        assert_eq!(ones.instruction_count(), 1);

        assert_eq!(plan_movi2r(0x0000_FFFF_0000_0000, true, 0).instruction_count(), 1);
        let movn = plan_movi2r(0xFFFF_FFFF_1234_FFFF, true, 0);
        assert_eq!(movn.approach, MovApproach::MovnBase);
        assert_eq!(movn.instruction_count(), 1);

        let orr = plan_movi2r(0x5555_5555_5555_5555, true, 0);
        assert_eq!(orr.approach, MovApproach::OrrBase);
        assert_eq!(orr.instruction_count(), 1);
    }

    #[test]
    fn test_plan_worst_case_is_four() {
        let plan = plan_movi2r(0x1234_5678_9ABC_DEF0, true, 0);
        assert_eq!(plan.approach, MovApproach::MovzBase);
        assert_eq!(plan.instruction_count(), 4);
    }

    #[test]
    fn test_plan_prefers_adr_for_nearby_code() {
        let pc = 0x7F00_0000_1000usize;
        let plan = plan_movi2r(pc as u64 + 0x100, true, pc);
        assert_eq!(plan.approach, MovApproach::AdrBase);
        assert_eq!(plan.instruction_count(), 1);
    }

    #[test]
    fn test_plan_32bit() {
        let plan = plan_movi2r(0xFFFF_1234, false, 0);
        assert_eq!(plan.approach, MovApproach::MovnBase);
        assert_eq!(plan.instruction_count(), 1);
        // Upper bits are ignored for W registers.
        assert_eq!(plan_movi2r(0xDEAD_BEEF_0000_0001, false, 0).instruction_count(), 1);
    }

    #[test]
    fn test_movi2r_words() {
        assert_eq!(
            emitted(|e| e.movi2r(Reg::W0, 0x1234_5678)),
            vec![0x528ACF00, 0x72A24680]
        );
        // MOVN X1, #0
        assert_eq!(emitted(|e| e.movi2r(Reg::X1, u64::MAX)), vec![0x92800001]);
        // MOVZ X2, #0
        assert_eq!(emitted(|e| e.movi2r(Reg::X2, 0)), vec![0xD2800002]);
    }

    #[test]
    fn test_movi2r2_keeps_shorter() {
        let mut e = Arm64Emitter::with_capacity(64);
        let start = e.code_ptr();
        assert!(e.movi2r2(Reg::X0, 0x1234_5678_9ABC_DEF0, 5));
        assert_eq!(e.code_ptr(), start + 4);

        let start = e.code_ptr();
        assert!(!e.movi2r2(Reg::X0, 5, 0x1234_5678_9ABC_DEF0));
        assert_eq!(e.code_ptr(), start + 4);
    }

    #[test]
    fn test_addi2r_forms() {
        // ADD X0, X1, #0x10
        assert_eq!(emitted(|e| e.addi2r(Reg::X0, Reg::X1, 0x10, None)), vec![0x91004020]);
        // Split into two adds without a scratch.
        assert_eq!(
            emitted(|e| e.addi2r(Reg::X0, Reg::X1, 0x123456, None)),
            vec![0x91115820, 0x91448C00]
        );
        // SUB W0, W1, #-1 becomes ADD W0, W1, #1
        assert_eq!(
            emitted(|e| e.subi2r(Reg::W0, Reg::W1, 0xFFFF_FFFF, None)),
            vec![0x11000420]
        );
        // Adding zero to itself emits nothing.
        assert!(emitted(|e| e.addi2r(Reg::X3, Reg::X3, 0, None)).is_empty());
        // CMP W0, #1, LSL #12
        assert_eq!(emitted(|e| e.cmpi2r(Reg::W0, 0x1000, None)), vec![0x7140041F]);
    }

    #[test]
    fn test_addi2r_with_scratch() {
        let words = emitted(|e| e.addi2r(Reg::X0, Reg::X1, 0x1234_5678, Some(Reg::X2)));
        assert_eq!(words.len(), 3);
        // ADD X0, X1, X2
        assert_eq!(*words.last().unwrap(), 0x8B020020);
    }

    #[test]
    #[should_panic(expected = "needs a scratch register")]
    fn test_addi2r_without_scratch_panics() {
        emitted(|e| e.addi2r(Reg::X0, Reg::X1, 0x1234_5678, None));
    }

    #[test]
    fn test_logical_i2r() {
        // AND W0, W1, #0xFF
        assert_eq!(emitted(|e| e.andi2r(Reg::W0, Reg::W1, 0xFF, None)), vec![0x12001C20]);
        // AND with all ones is a move.
        assert_eq!(
            emitted(|e| e.andi2r(Reg::W0, Reg::W1, 0xFFFF_FFFF, None)),
            vec![0x2A0103E0]
        );
        assert!(emitted(|e| e.orri2r(Reg::X4, Reg::X4, 0, None)).is_empty());
        assert!(!Arm64Emitter::with_capacity(16).try_eori2r(Reg::X0, Reg::X0, 0x1234));
    }

    #[test]
    fn test_logical_i2r_scratch_follows_operand_width() {
        // 0x12345678 has no bitmask form: two 32-bit moves into W2, then
        // ORR W0, W1, W2.
        let words = emitted(|e| e.orri2r(Reg::W0, Reg::W1, 0x1234_5678, Some(Reg::X2)));
        assert_eq!(words.len(), 3);
        assert!(words[..2].iter().all(|w| w >> 31 == 0 && w & 0x1F == 2), "{words:#010x?}");
        assert_eq!(words[2], 0x2A020020);

        let words = emitted(|e| e.andi2r(Reg::X0, Reg::X1, 0x1234_5678, Some(Reg::W2)));
        assert_eq!(words.len(), 3);
        // AND X0, X1, X2
        assert_eq!(*words.last().unwrap(), 0x8A020020);
    }

    #[test]
    fn test_movi2f() {
        // FMOV S0, #1.0
        assert_eq!(emitted(|e| e.movi2f(Reg::S0, 1.0, None)), vec![0x1E2E1000]);
        // FMOV D1, XZR
        assert_eq!(emitted(|e| e.movi2f(Reg::D1, 0.0, None)), vec![0x9E6703E1]);
        let words = emitted(|e| e.movi2f(Reg::S2, 0.1, Some(Reg::W9)));
        // MOVZ + MOVK + FMOV S2, W9
        assert_eq!(words.len(), 3);
        assert_eq!(*words.last().unwrap(), 0x1E270122);
    }
}
