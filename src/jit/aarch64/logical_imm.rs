//! Immediate field classification: bitmask immediates for logical
//! instructions, 12-bit arithmetic immediates and the 8-bit FMOV immediate.

/// Bitmask immediate operand (`N:immr:imms`) of AND/ORR/EOR/ANDS.
///
/// Only built from a value through [`LogicalImm::new`]. An invalid value
/// is reported with `valid == false` and must never reach an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalImm {
    pub r: u8,
    pub s: u8,
    pub n: bool,
    pub valid: bool,
}

impl LogicalImm {
    const INVALID: LogicalImm = LogicalImm { r: 0, s: 0, n: false, valid: false };

    /// Classify `value` as a `width`-bit (32 or 64) bitmask immediate.
    ///
    /// A bitmask immediate is a run of ones, rotated inside an element of
    /// 2, 4, 8, 16, 32 or 64 bits, replicated across the register.
    pub fn new(value: u64, width: u32) -> Self {
        debug_assert!(width == 32 || width == 64);
        let value = if width == 32 {
            let low = value & 0xFFFF_FFFF;
            low | (low << 32)
        } else {
            value
        };

        if value == 0 || !value == 0 {
            return Self::INVALID;
        }

        // Rotate so the element starts with its run of ones at bit 0; the
        // element can then not be split across the word boundary.
        let rotation = (value & value.wrapping_add(1)).trailing_zeros() as i32;
        let normalized = value.rotate_right(rotation as u32);
        let element_size = (normalized & normalized.wrapping_add(1)).trailing_zeros() as i32;
        let ones = (!normalized).trailing_zeros() as i32;

        // Must repeat every element; this also forces a power-of-two size.
        if value.rotate_right(element_size as u32) != value {
            return Self::INVALID;
        }

        LogicalImm {
            r: ((element_size - rotation) & (element_size - 1)) as u8,
            s: (((-element_size) << 1 | (ones - 1)) & 0x3F) as u8,
            n: (element_size >> 6) & 1 == 1,
            valid: true,
        }
    }

    /// Expand the fields back into the `width`-bit value they encode.
    pub fn value(self, width: u32) -> u64 {
        assert!(self.valid, "decoding an invalid logical immediate");
        match decode_bit_masks(self.n, self.r, self.s, width) {
            Some(value) => value,
            None => unreachable!("classified fields always decode"),
        }
    }

    /// `N:immr:imms` packed at bits 22, 16 and 10.
    pub(crate) fn fields(self) -> u32 {
        assert!(self.valid, "emitting an invalid logical immediate");
        ((self.n as u32) << 22) | ((self.r as u32) << 16) | ((self.s as u32) << 10)
    }
}

/// The architectural DecodeBitMasks for the `wmask` result. Returns `None`
/// for reserved field combinations.
pub fn decode_bit_masks(n: bool, immr: u8, imms: u8, width: u32) -> Option<u64> {
    let combined = ((n as u32) << 6) | (!imms as u32 & 0x3F);
    if combined == 0 {
        return None;
    }
    let len = 31 - combined.leading_zeros();
    if len < 1 || (width == 32 && n) {
        return None;
    }
    let esize = 1u32 << len;
    let levels = esize - 1;
    let s = imms as u32 & levels;
    let r = immr as u32 & levels;
    if s == levels {
        return None;
    }

    let emask = if esize == 64 { u64::MAX } else { (1u64 << esize) - 1 };
    let welem = (1u64 << (s + 1)) - 1;
    let elem = if r == 0 {
        welem
    } else {
        ((welem >> r) | (welem << (esize - r))) & emask
    };

    let mut value = 0u64;
    let mut shift = 0;
    while shift < width {
        value |= elem << shift;
        shift += esize;
    }
    if width == 32 {
        value &= 0xFFFF_FFFF;
    }
    Some(value)
}

/// Split `value` into an ADD/SUB immediate: a 12-bit value, optionally
/// shifted left by 12. Returns `(imm12, shift)`.
pub fn is_imm_arithmetic(value: u64) -> Option<(u32, bool)> {
    if value < 4096 {
        Some((value as u32, false))
    } else if value & 0xFFF000 == value {
        Some(((value >> 12) as u32, true))
    } else {
        None
    }
}

/// Encode `value` as the 8-bit FMOV immediate `±(16 + efgh)/16 × 2^e`
/// with `e` in -3..=4.
pub fn fp_to_imm8(value: f64) -> Option<u8> {
    let bits = value.to_bits();
    if bits & 0x0000_FFFF_FFFF_FFFF != 0 {
        return None;
    }
    let b = (bits >> 61) & 1;
    // Exponent must be NOT(b):bbbbbbbb:cd.
    if (bits >> 62) & 1 == b {
        return None;
    }
    let replicated = (bits >> 54) & 0xFF;
    if replicated != if b == 1 { 0xFF } else { 0 } {
        return None;
    }
    let sign = (bits >> 63) & 1;
    let cd = (bits >> 52) & 3;
    let efgh = (bits >> 48) & 0xF;
    Some(((sign << 7) | (b << 6) | (cd << 4) | efgh) as u8)
}

pub fn fp_imm8_to_f64(imm8: u8) -> f64 {
    let imm = imm8 as u64;
    let sign = (imm >> 7) & 1;
    let b = (imm >> 6) & 1;
    let cd = (imm >> 4) & 3;
    let efgh = imm & 0xF;
    let exp = ((b ^ 1) << 10) | (if b == 1 { 0xFF << 2 } else { 0 }) | cd;
    f64::from_bits((sign << 63) | (exp << 52) | (efgh << 48))
}
