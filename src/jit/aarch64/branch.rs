//! Branches: direct branches to known addresses, forward fixups, and
//! register branches.

use super::{Arm64Emitter, Cond, Reg};

/// BRK #0: placeholder for a fixup that has not been resolved yet.
const FIXUP_PLACEHOLDER: u32 = 0xD4200000;

const IMM26_RANGE: std::ops::RangeInclusive<i64> = -0x2000000..=0x1FFFFFF;
const IMM19_RANGE: std::ops::RangeInclusive<i64> = -0x40000..=0x3FFFF;
const IMM14_RANGE: std::ops::RangeInclusive<i64> = -0x2000..=0x1FFF;

/// Branch shape recorded by a fixup, with its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    Cbz(Reg),
    Cbnz(Reg),
    BCond(Cond),
    Tbz(Reg, u8),
    Tbnz(Reg, u8),
    B,
    Bl,
}

impl FixupKind {
    fn range(self) -> std::ops::RangeInclusive<i64> {
        match self {
            FixupKind::B | FixupKind::Bl => IMM26_RANGE,
            FixupKind::Cbz(_) | FixupKind::Cbnz(_) | FixupKind::BCond(_) => IMM19_RANGE,
            FixupKind::Tbz(..) | FixupKind::Tbnz(..) => IMM14_RANGE,
        }
    }

    /// Encode this branch at `site` jumping to `target`.
    fn encode(self, site: usize, target: usize) -> u32 {
        let distance = (target as i64 - site as i64) >> 2;
        assert!(
            (target as i64 - site as i64) & 3 == 0,
            "branch target {:#x} is not word aligned",
            target
        );
        assert!(
            self.range().contains(&distance),
            "{:?} from {:#x} to {:#x}: displacement {} words out of range",
            self,
            site,
            target,
            distance
        );
        match self {
            FixupKind::B => 0x14000000 | (distance as u32 & 0x3FFFFFF),
            FixupKind::Bl => 0x94000000 | (distance as u32 & 0x3FFFFFF),
            FixupKind::BCond(cond) => 0x54000000 | ((distance as u32 & 0x7FFFF) << 5) | cond.code(),
            FixupKind::Cbz(rt) => {
                rt.sf() | 0x34000000 | ((distance as u32 & 0x7FFFF) << 5) | rt.code()
            }
            FixupKind::Cbnz(rt) => {
                rt.sf() | 0x35000000 | ((distance as u32 & 0x7FFFF) << 5) | rt.code()
            }
            FixupKind::Tbz(rt, bit) => test_bit_branch(0x36000000, rt, bit, distance),
            FixupKind::Tbnz(rt, bit) => test_bit_branch(0x37000000, rt, bit, distance),
        }
    }
}

fn test_bit_branch(base: u32, rt: Reg, bit: u8, distance: i64) -> u32 {
    assert!(bit < 64 && (rt.is_64bit() || bit < 32), "bit {} out of range for {:?}", bit, rt);
    let bit = bit as u32;
    // b5 011011 op b40 imm14 Rt
    base | ((bit >> 5) << 31) | ((bit & 0x1F) << 19) | ((distance as u32 & 0x3FFF) << 5) | rt.code()
}

/// A forward branch whose target is not known yet.
///
/// Created by the `fixup_*` emitters and consumed by
/// [`Arm64Emitter::set_jump_target`]; it cannot be resolved twice. A fixup
/// emitted into a full buffer has no site and resolving it is a no-op, the
/// surrounding block is discarded anyway.
#[must_use = "a fixup branch must be resolved with set_jump_target"]
#[derive(Debug, PartialEq, Eq)]
pub struct FixupBranch {
    ptr: Option<usize>,
    kind: FixupKind,
}

impl FixupBranch {
    /// Address of the placeholder word, if it was written.
    pub fn site(&self) -> Option<usize> {
        self.ptr
    }

    pub fn kind(&self) -> FixupKind {
        self.kind
    }
}

/// Decode the destination of the direct branch `word` located at `site`.
/// Returns `None` for anything that is not a direct branch.
pub fn branch_target(word: u32, site: usize) -> Option<usize> {
    let distance = if word & 0x7C000000 == 0x14000000 {
        // B / BL
        sign_extend(word & 0x3FFFFFF, 26)
    } else if word & 0xFF000010 == 0x54000000 || word & 0x7E000000 == 0x34000000 {
        // B.cond / CBZ / CBNZ
        sign_extend((word >> 5) & 0x7FFFF, 19)
    } else if word & 0x7E000000 == 0x36000000 {
        // TBZ / TBNZ
        sign_extend((word >> 5) & 0x3FFF, 14)
    } else {
        return None;
    };
    Some((site as i64 + distance * 4) as usize)
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

impl Arm64Emitter {
    fn write_fixup_branch(&mut self, kind: FixupKind) -> FixupBranch {
        let site = self.code_ptr();
        self.emit_raw(FIXUP_PLACEHOLDER);
        let ptr = if self.has_write_failed() { None } else { Some(site) };
        FixupBranch { ptr, kind }
    }

    /// Resolve `branch` to the current cursor.
    pub fn set_jump_target(&mut self, branch: FixupBranch) {
        let target = self.code_ptr();
        self.set_jump_target_to(branch, target);
    }

    /// Resolve `branch` to an explicit address.
    pub fn set_jump_target_to(&mut self, branch: FixupBranch, target: usize) {
        let Some(site) = branch.ptr else { return };
        let word = branch.kind.encode(site, target);
        self.buffer_mut().patch_u32(site, word);
    }

    /// Whether a B/BL at the cursor reaches `target`.
    pub fn is_in_branch_range(&self, target: usize) -> bool {
        let distance = target as i64 - self.code_ptr() as i64;
        distance & 3 == 0 && IMM26_RANGE.contains(&(distance >> 2))
    }

    // ==================== Fixups ====================

    pub fn fixup_b(&mut self) -> FixupBranch {
        self.write_fixup_branch(FixupKind::B)
    }

    pub fn fixup_bl(&mut self) -> FixupBranch {
        self.write_fixup_branch(FixupKind::Bl)
    }

    pub fn fixup_b_cond(&mut self, cond: Cond) -> FixupBranch {
        self.write_fixup_branch(FixupKind::BCond(cond))
    }

    pub fn fixup_cbz(&mut self, rt: Reg) -> FixupBranch {
        self.write_fixup_branch(FixupKind::Cbz(rt))
    }

    pub fn fixup_cbnz(&mut self, rt: Reg) -> FixupBranch {
        self.write_fixup_branch(FixupKind::Cbnz(rt))
    }

    pub fn fixup_tbz(&mut self, rt: Reg, bit: u8) -> FixupBranch {
        self.write_fixup_branch(FixupKind::Tbz(rt, bit))
    }

    pub fn fixup_tbnz(&mut self, rt: Reg, bit: u8) -> FixupBranch {
        self.write_fixup_branch(FixupKind::Tbnz(rt, bit))
    }

    // ==================== Direct branches ====================

    fn branch_to(&mut self, kind: FixupKind, target: usize) {
        let word = kind.encode(self.code_ptr(), target);
        self.emit_raw(word);
    }

    /// B <target>
    pub fn b(&mut self, target: usize) {
        self.branch_to(FixupKind::B, target);
    }

    /// BL <target>
    pub fn bl(&mut self, target: usize) {
        self.branch_to(FixupKind::Bl, target);
    }

    /// B.cond <target>
    pub fn b_cond(&mut self, cond: Cond, target: usize) {
        self.branch_to(FixupKind::BCond(cond), target);
    }

    pub fn cbz(&mut self, rt: Reg, target: usize) {
        self.branch_to(FixupKind::Cbz(rt), target);
    }

    pub fn cbnz(&mut self, rt: Reg, target: usize) {
        self.branch_to(FixupKind::Cbnz(rt), target);
    }

    pub fn tbz(&mut self, rt: Reg, bit: u8, target: usize) {
        self.branch_to(FixupKind::Tbz(rt, bit), target);
    }

    pub fn tbnz(&mut self, rt: Reg, bit: u8, target: usize) {
        self.branch_to(FixupKind::Tbnz(rt, bit), target);
    }

    /// Encode `B target` as if it were located at `site`.
    pub fn encode_b(site: usize, target: usize) -> u32 {
        FixupKind::B.encode(site, target)
    }

    /// Encode `BL target` as if it were located at `site`.
    pub fn encode_bl(site: usize, target: usize) -> u32 {
        FixupKind::Bl.encode(site, target)
    }

    // ==================== Register branches ====================

    /// BR Xn
    pub fn br(&mut self, rn: Reg) {
        // 1101 0110 0001 1111 0000 00nn nnn0 0000
        self.emit_raw(0xD61F0000 | (rn.code() << 5));
    }

    /// BLR Xn
    pub fn blr(&mut self, rn: Reg) {
        // 1101 0110 0011 1111 0000 00nn nnn0 0000
        self.emit_raw(0xD63F0000 | (rn.code() << 5));
    }

    /// RET (X30)
    pub fn ret(&mut self) {
        self.ret_to(Reg::X30);
    }

    /// RET Xn
    pub fn ret_to(&mut self, rn: Reg) {
        // 1101 0110 0101 1111 0000 00nn nnn0 0000
        self.emit_raw(0xD65F0000 | (rn.code() << 5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_at(e: &Arm64Emitter, addr: usize) -> u32 {
        e.buffer().read_u32(addr)
    }

    #[test]
    fn test_placeholder_is_brk() {
        let mut e = Arm64Emitter::with_capacity(16);
        let site = e.code_ptr();
        let branch = e.fixup_b();
        assert_eq!(branch.site(), Some(site));
        assert_eq!(word_at(&e, site), 0xD4200000);
        e.set_jump_target(branch);
    }

    #[test]
    fn test_b_cond_forward_40_bytes() {
        let mut e = Arm64Emitter::with_capacity(64);
        let site = e.code_ptr();
        let branch = e.fixup_b_cond(Cond::Ne);
        for _ in 0..9 {
            e.nop();
        }
        assert_eq!(e.code_ptr(), site + 40);
        e.set_jump_target(branch);

        let word = word_at(&e, site);
        assert_eq!(word & 0xFF000010, 0x54000000);
        assert_eq!(word & 0xF, Cond::Ne.code());
        assert_eq!(sign_extend((word >> 5) & 0x7FFFF, 19) * 4, 40);
        assert_eq!(branch_target(word, site), Some(site + 40));
    }

    #[test]
    fn test_backward_b() {
        let mut e = Arm64Emitter::with_capacity(64);
        let top = e.code_ptr();
        e.nop();
        e.nop();
        let site = e.code_ptr();
        e.b(top);
        assert_eq!(word_at(&e, site), 0x17FFFFFE);
        assert_eq!(branch_target(word_at(&e, site), site), Some(top));
    }

    #[test]
    fn test_cbz_tbnz_encodings() {
        let mut e = Arm64Emitter::with_capacity(64);
        let start = e.code_ptr();
        e.cbz(Reg::W3, start + 8);
        e.tbnz(Reg::X5, 33, start + 4);
        // CBZ W3, #8
        assert_eq!(word_at(&e, start), 0x34000043);
        // TBNZ X5, #33, #0
        assert_eq!(word_at(&e, start + 4), 0xB7080005);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_tbz_out_of_range_panics() {
        let mut e = Arm64Emitter::with_capacity(16);
        let here = e.code_ptr();
        e.tbz(Reg::W0, 0, here + 0x8000);
    }

    #[test]
    fn test_fixup_in_full_buffer_has_no_site() {
        let mut e = Arm64Emitter::with_capacity(4);
        e.nop();
        let branch = e.fixup_cbnz(Reg::X1);
        assert!(e.has_write_failed());
        assert_eq!(branch.site(), None);
        e.set_jump_target(branch);
    }

    #[test]
    fn test_register_branches() {
        let mut e = Arm64Emitter::with_capacity(16);
        let start = e.code_ptr();
        e.br(Reg::X16);
        e.blr(Reg::X8);
        e.ret();
        assert_eq!(word_at(&e, start), 0xD61F0200);
        assert_eq!(word_at(&e, start + 4), 0xD63F0100);
        assert_eq!(word_at(&e, start + 8), 0xD65F03C0);
    }
}
