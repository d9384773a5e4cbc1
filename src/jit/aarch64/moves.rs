//! Register shuffles, stack save/restore and host calls.

use super::{Arm64Emitter, IndexType, Reg};
use crate::jit::bitset::BitSet32;

/// First and one-past-last register numbers usable as a cycle breaker:
/// X0-X7 carry arguments and X18 upwards are reserved or callee saved.
const TEMP_REG_BEGIN: u8 = 8;
const TEMP_REG_END: u8 = 18;

/// One `dst <- src` register copy of a [`Arm64Emitter::parallel_moves`]
/// batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMove {
    pub dst: Reg,
    pub src: Reg,
}

impl RegisterMove {
    pub fn new(dst: Reg, src: Reg) -> Self {
        Self { dst, src }
    }
}

/// Argument of [`Arm64Emitter::abi_call_function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    /// Copied into the argument register with the register's width.
    Reg(Reg),
    Imm(u64),
}

impl Arm64Emitter {
    /// Perform a batch of register copies as if they all happened at once.
    ///
    /// Destinations must be distinct general registers. Cycles are broken
    /// with one register from X8..X17 that no move reads or writes; the
    /// register used (if any) is returned. At most one such register is
    /// used for the whole batch.
    pub fn parallel_moves(&mut self, moves: &[RegisterMove]) -> Option<Reg> {
        let mut written = BitSet32::new();
        for m in moves {
            assert!(m.dst.is_gpr() && !m.dst.is_sp() && !m.dst.is_zr(), "bad move target {:?}", m.dst);
            assert!(m.src.is_gpr() && !m.src.is_sp(), "bad move source {:?}", m.src);
            assert!(!written.contains(m.dst.code()), "{:?} written twice", m.dst);
            written.insert(m.dst.code());
        }

        // A move onto its own register at most zero-extends; do that once
        // every other move has read the old value.
        let (self_moves, mut pending): (Vec<_>, Vec<_>) =
            moves.iter().copied().partition(|m| m.dst.code() == m.src.code());
        let mut reserved = BitSet32::new();
        for m in &self_moves {
            reserved.insert(m.dst.code());
        }

        let mut usage = [0u8; 32];
        for m in &pending {
            usage[m.src.code() as usize] += 1;
        }

        let mut temp_used = None;
        while !pending.is_empty() {
            let mut removed = false;

            let mut i = pending.len();
            while i > 0 {
                i -= 1;
                let m = pending[i];
                if usage[m.dst.code() as usize] == 0 {
                    self.mov(m.dst, m.src);
                    usage[m.src.code() as usize] -= 1;
                    pending.remove(i);
                    removed = true;
                }
            }

            if !removed {
                // Only cycles remain; redirect one of them through a temp.
                let Some(temp) = (TEMP_REG_BEGIN..TEMP_REG_END)
                    .find(|&n| usage[n as usize] == 0 && !reserved.contains(n as u32))
                else {
                    panic!("no free temporary register to break a move cycle");
                };
                let src = pending[0].src.code() as usize;
                let temp = Reg::x(temp);
                self.mov(temp, Reg::x(src as u8));
                usage[temp.code() as usize] = usage[src];
                usage[src] = 0;
                for m in pending.iter_mut().filter(|m| m.src.code() as usize == src) {
                    m.src = temp.with_width_of(m.src);
                }
                temp_used = Some(temp);
            }
        }

        for m in self_moves {
            if m.dst != m.src {
                self.mov(m.dst, m.src);
            }
        }

        temp_used
    }

    /// Push the X registers in `registers`, keeping SP 16-byte aligned.
    pub fn abi_push_registers(&mut self, registers: BitSet32) {
        let regs: Vec<Reg> = registers.iter().map(|n| Reg::x(n as u8)).collect();
        if regs.is_empty() {
            return;
        }
        let num_regs = regs.len();
        let stack_size = ((num_regs + (num_regs & 1)) * 8) as i32;

        // The first store moves SP so that nothing is ever live below it.
        let rest = if num_regs & 1 == 1 {
            self.str(regs[0], Reg::SP, IndexType::Pre, -stack_size);
            &regs[1..]
        } else {
            self.stp(IndexType::Pre, regs[0], regs[1], Reg::SP, -stack_size);
            &regs[2..]
        };
        for (i, pair) in rest.chunks(2).enumerate() {
            self.stp(IndexType::Signed, pair[0], pair[1], Reg::SP, 16 * (i as i32 + 1));
        }
    }

    /// Pop registers pushed by [`Self::abi_push_registers`] with the same set.
    pub fn abi_pop_registers(&mut self, registers: BitSet32) {
        let regs: Vec<Reg> = registers.iter().map(|n| Reg::x(n as u8)).collect();
        if regs.is_empty() {
            return;
        }
        let num_regs = regs.len();
        let stack_size = ((num_regs + (num_regs & 1)) * 8) as i32;

        let (head, rest) = regs.split_at(if num_regs & 1 == 1 { 1 } else { 2 });
        for (i, pair) in rest.chunks(2).enumerate() {
            self.ldp(IndexType::Signed, pair[0], pair[1], Reg::SP, 16 * (i as i32 + 1));
        }
        // SP moves on the last load.
        match *head {
            [first, second] => self.ldp(IndexType::Post, first, second, Reg::SP, stack_size),
            [first] => self.ldr(first, Reg::SP, IndexType::Post, stack_size),
            _ => unreachable!(),
        }
    }

    /// Save the full Q registers in `registers`.
    pub fn abi_push_fp_registers(&mut self, registers: BitSet32) {
        let num_regs = registers.count() as i32;
        if num_regs == 0 {
            return;
        }
        let regs: Vec<Reg> = registers.iter().map(|n| Reg::new(super::RegKind::Q, n as u8)).collect();
        self.sub_imm(Reg::SP, Reg::SP, (num_regs * 16) as u32, false);
        for (i, pair) in regs.chunks(2).enumerate() {
            let offset = i as i32 * 32;
            match *pair {
                [a, b] => self.stp(IndexType::Signed, a, b, Reg::SP, offset),
                [a] => self.float().str(a, Reg::SP, offset as u32),
                _ => unreachable!(),
            }
        }
    }

    /// Restore registers saved by [`Self::abi_push_fp_registers`].
    pub fn abi_pop_fp_registers(&mut self, registers: BitSet32) {
        let num_regs = registers.count() as i32;
        if num_regs == 0 {
            return;
        }
        let regs: Vec<Reg> = registers.iter().map(|n| Reg::new(super::RegKind::Q, n as u8)).collect();
        for (i, pair) in regs.chunks(2).enumerate() {
            let offset = i as i32 * 32;
            match *pair {
                [a, b] => self.ldp(IndexType::Signed, a, b, Reg::SP, offset),
                [a] => self.float().ldr(a, Reg::SP, offset as u32),
                _ => unreachable!(),
            }
        }
        self.add_imm(Reg::SP, Reg::SP, (num_regs * 16) as u32, false);
    }

    /// Call `func`, directly when it is in BL range, else through `scratch`.
    pub fn quick_call_function(&mut self, func: usize, scratch: Reg) {
        if self.is_in_branch_range(func) {
            self.bl(func);
        } else {
            self.movp2r(scratch.to_64(), func);
            self.blr(scratch.to_64());
        }
    }

    /// Place `args` in X0.. (register arguments first, as one parallel
    /// batch, then immediates) and call `func`. Clobbers X8 for far calls.
    pub fn abi_call_function(&mut self, func: usize, args: &[CallArg]) {
        assert!(args.len() <= 8, "at most eight register arguments");
        let moves: Vec<RegisterMove> = args
            .iter()
            .enumerate()
            .filter_map(|(i, arg)| match *arg {
                CallArg::Reg(src) => Some(RegisterMove::new(Reg::x(i as u8).with_width_of(src), src)),
                CallArg::Imm(_) => None,
            })
            .collect();
        self.parallel_moves(&moves);
        for (i, arg) in args.iter().enumerate() {
            if let CallArg::Imm(value) = *arg {
                self.movi2r(Reg::x(i as u8), value);
            }
        }
        self.quick_call_function(func, Reg::X8);
    }
}
