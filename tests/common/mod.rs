//! A tiny AArch64 interpreter for the instruction subset the tests inspect:
//! immediate moves, logical and arithmetic immediates, register ORR/MOV,
//! ADR/ADRP and direct branches.

#![allow(dead_code)]

use ppcjit::jit::aarch64::Arm64Emitter;

pub const NOP: u32 = 0xD503_201F;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    pub x: [u64; 31],
    pub sp: u64,
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self { x: [0; 31], sp: 0, n: false, z: false, c: false, v: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Next,
    Branch(u64),
    Unsupported(u32),
}

fn bits(word: u32, lo: u32, len: u32) -> u64 {
    ((word >> lo) & ((1u32 << len) - 1)) as u64
}

fn sign_extend(value: u64, width: u32) -> i64 {
    ((value << (64 - width)) as i64) >> (64 - width)
}

/// Expand `N:immr:imms` into a `width`-bit value, written from the
/// architecture pseudocode rather than the crate's own decoder.
pub fn decode_logical_imm(n: u32, immr: u32, imms: u32, width: u32) -> Option<u64> {
    let combined = (n << 6) | (!imms & 0x3F);
    if combined == 0 {
        return None;
    }
    let len = 31 - combined.leading_zeros();
    if len < 1 || (width == 32 && n == 1) {
        return None;
    }
    let esize = 1u32 << len;
    let levels = esize - 1;
    let s = imms & levels;
    let r = immr & levels;
    if s == levels {
        return None;
    }
    let welem = if s + 1 == 64 { u64::MAX } else { (1u64 << (s + 1)) - 1 };
    let emask = if esize == 64 { u64::MAX } else { (1u64 << esize) - 1 };
    let elem = if r == 0 { welem } else { ((welem >> r) | (welem << (esize - r))) & emask };
    let mut value = 0u64;
    let mut shift = 0;
    while shift < width {
        value |= elem << shift;
        shift += esize;
    }
    Some(if width == 32 { value & 0xFFFF_FFFF } else { value })
}

/// Every value with a logical-immediate encoding at `width` bits.
pub fn all_logical_immediates(width: u32) -> std::collections::HashSet<u64> {
    let mut set = std::collections::HashSet::new();
    for n in 0..2 {
        for immr in 0..64 {
            for imms in 0..64 {
                if let Some(v) = decode_logical_imm(n, immr, imms, width) {
                    set.insert(v);
                }
            }
        }
    }
    set
}

impl Cpu {
    fn read(&self, reg: u32, sf: bool, sp: bool) -> u64 {
        let value = match reg {
            31 if sp => self.sp,
            31 => 0,
            r => self.x[r as usize],
        };
        if sf { value } else { value & 0xFFFF_FFFF }
    }

    fn write(&mut self, reg: u32, sf: bool, sp: bool, value: u64) {
        let value = if sf { value } else { value & 0xFFFF_FFFF };
        match reg {
            31 if sp => self.sp = value,
            31 => {}
            r => self.x[r as usize] = value,
        }
    }

    fn condition(&self, cond: u32) -> bool {
        let base = match cond >> 1 {
            0 => self.z,
            1 => self.c,
            2 => self.n,
            3 => self.v,
            4 => self.c && !self.z,
            5 => self.n == self.v,
            6 => self.n == self.v && !self.z,
            _ => true,
        };
        if cond & 1 == 1 && cond != 0xF { !base } else { base }
    }

    fn set_sub_flags(&mut self, a: u64, b: u64, sf: bool) -> u64 {
        let (width, mask) = if sf { (64, u64::MAX) } else { (32, 0xFFFF_FFFF) };
        let (a, b) = (a & mask, b & mask);
        let result = a.wrapping_sub(b) & mask;
        self.n = (result >> (width - 1)) & 1 == 1;
        self.z = result == 0;
        self.c = a >= b;
        let sa = sign_extend(a, width);
        let sb = sign_extend(b, width);
        self.v = if sf { sa.checked_sub(sb).is_none() } else { !(i32::MIN as i64..=i32::MAX as i64).contains(&(sa - sb)) };
        result
    }

    /// Execute one instruction located at `pc`.
    pub fn step(&mut self, word: u32, pc: u64) -> Step {
        let sf = word >> 31 == 1;
        let rd = (word & 0x1F) as u32;
        let rn = bits(word, 5, 5) as u32;

        if word == NOP {
            return Step::Next;
        }
        // MOVN / MOVZ / MOVK
        if word & 0x1F80_0000 == 0x1280_0000 {
            let opc = bits(word, 29, 2);
            let shift = bits(word, 21, 2) * 16;
            let imm = bits(word, 5, 16) << shift;
            let value = match opc {
                0 => !imm,
                2 => imm,
                3 => (self.read(rd, true, false) & !(0xFFFF << shift)) | imm,
                _ => return Step::Unsupported(word),
            };
            self.write(rd, sf, false, value);
            return Step::Next;
        }
        // Logical (immediate)
        if word & 0x1F80_0000 == 0x1200_0000 {
            let width = if sf { 64 } else { 32 };
            let Some(imm) = decode_logical_imm(bits(word, 22, 1) as u32, bits(word, 16, 6) as u32, bits(word, 10, 6) as u32, width)
            else {
                return Step::Unsupported(word);
            };
            let a = self.read(rn, sf, false);
            let (value, flags) = match bits(word, 29, 2) {
                0 => (a & imm, false),
                1 => (a | imm, false),
                2 => (a ^ imm, false),
                _ => (a & imm, true),
            };
            if flags {
                self.n = (value >> (width - 1)) & 1 == 1;
                self.z = value == 0;
                self.c = false;
                self.v = false;
            }
            self.write(rd, sf, !flags, value);
            return Step::Next;
        }
        // Logical (shifted register), LSL only
        if word & 0x1F00_0000 == 0x0A00_0000 {
            if bits(word, 22, 2) != 0 {
                return Step::Unsupported(word);
            }
            let rm = bits(word, 16, 5) as u32;
            let amount = bits(word, 10, 6) as u32;
            let mut b = self.read(rm, sf, false) << amount;
            if bits(word, 21, 1) == 1 {
                b = !b;
            }
            let a = self.read(rn, sf, false);
            let value = match bits(word, 29, 2) {
                0 => a & b,
                1 => a | b,
                2 => a ^ b,
                _ => return Step::Unsupported(word),
            };
            self.write(rd, sf, false, value);
            return Step::Next;
        }
        // ADD/SUB (immediate)
        if word & 0x1F80_0000 == 0x1100_0000 {
            let imm = bits(word, 10, 12) << (bits(word, 22, 1) * 12);
            let a = self.read(rn, sf, true);
            let sub = bits(word, 30, 1) == 1;
            let set_flags = bits(word, 29, 1) == 1;
            let value = if sub {
                if set_flags { self.set_sub_flags(a, imm, sf) } else { a.wrapping_sub(imm) }
            } else {
                if set_flags {
                    return Step::Unsupported(word);
                }
                a.wrapping_add(imm)
            };
            self.write(rd, sf, !set_flags, value);
            return Step::Next;
        }
        // ADR / ADRP
        if word & 0x1F00_0000 == 0x1000_0000 {
            let imm = sign_extend((bits(word, 5, 19) << 2) | bits(word, 29, 2), 21);
            let value = if sf {
                (pc & !0xFFF).wrapping_add((imm << 12) as u64)
            } else {
                pc.wrapping_add(imm as u64)
            };
            self.write(rd, true, false, value);
            return Step::Next;
        }
        // B / BL
        if word & 0x7C00_0000 == 0x1400_0000 {
            let offset = sign_extend(bits(word, 0, 26), 26) * 4;
            if sf {
                self.x[30] = pc + 4;
            }
            return Step::Branch(pc.wrapping_add(offset as u64));
        }
        // B.cond
        if word & 0xFF00_0010 == 0x5400_0000 {
            let offset = sign_extend(bits(word, 5, 19), 19) * 4;
            return if self.condition(word & 0xF) { Step::Branch(pc.wrapping_add(offset as u64)) } else { Step::Next };
        }
        // CBZ / CBNZ
        if word & 0x7E00_0000 == 0x3400_0000 {
            let offset = sign_extend(bits(word, 5, 19), 19) * 4;
            let zero = self.read(rd, sf, false) == 0;
            let taken = zero != (bits(word, 24, 1) == 1);
            return if taken { Step::Branch(pc.wrapping_add(offset as u64)) } else { Step::Next };
        }
        Step::Unsupported(word)
    }

    /// Run `words` placed at `base` until control leaves them. Returns the
    /// address execution left to.
    pub fn run(&mut self, words: &[u32], base: u64) -> u64 {
        let end = base + words.len() as u64 * 4;
        let mut pc = base;
        let mut budget = 100_000;
        while pc >= base && pc < end {
            budget -= 1;
            assert!(budget > 0, "runaway execution");
            let word = words[((pc - base) / 4) as usize];
            match self.step(word, pc) {
                Step::Next => pc += 4,
                Step::Branch(target) => pc = target,
                Step::Unsupported(word) => panic!("unsupported instruction {word:#010x} at {pc:#x}"),
            }
        }
        pc
    }
}

/// Emit with `f` into a fresh buffer and run the result.
pub fn run_emitted(cpu: &mut Cpu, f: impl FnOnce(&mut Arm64Emitter)) -> Vec<u32> {
    let mut emit = Arm64Emitter::with_capacity(4096);
    let start = emit.code_ptr();
    f(&mut emit);
    assert!(!emit.has_write_failed());
    let words = emit.buffer().words(start, emit.code_ptr());
    cpu.run(&words, start as u64);
    words
}

pub mod fixtures {
    use ppcjit::config::JitConfig;
    use ppcjit::jit::backpatch::MemoryCallbacks;

    extern "C" fn read32(_: u32) -> u32 {
        0
    }
    extern "C" fn read64(_: u32) -> u64 {
        0
    }
    extern "C" fn write32(_: u32, _: u32) {}
    extern "C" fn write64(_: u64, _: u32) {}

    /// Guest memory callbacks that read zero and drop writes.
    pub fn null_callbacks() -> MemoryCallbacks {
        MemoryCallbacks {
            read_u8: read32,
            read_u16: read32,
            read_u32: read32,
            read_u64: read64,
            write_u8: write32,
            write_u16: write32,
            write_u32: write32,
            write_u64: write64,
        }
    }

    pub fn small_config(fastmem: bool) -> JitConfig {
        JitConfig {
            fastmem,
            near_code_size: 256 * 1024,
            far_code_size: 256 * 1024,
            ..JitConfig::default()
        }
    }
}
