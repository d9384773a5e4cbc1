//! Guest CPU state as seen by generated code.
//!
//! Generated code addresses every field relative to the state pointer held
//! in [`PPC_REG`](super::PPC_REG), so the layout is `#[repr(C)]` and the
//! offsets below are what the emitters bake into load/store immediates.

use std::mem::offset_of;

pub const NUM_GPRS: usize = 32;
pub const NUM_CR_FIELDS: usize = 8;

/// Exception bits raised by generated code or the memory callbacks.
pub mod exception {
    pub const DSI: u32 = 1 << 0;
    pub const ISI: u32 = 1 << 1;
    pub const PROGRAM: u32 = 1 << 2;
    pub const SYSCALL: u32 = 1 << 3;
    pub const FPU_UNAVAILABLE: u32 = 1 << 4;
    pub const EXTERNAL_INT: u32 = 1 << 5;
}

#[repr(C, align(16))]
#[derive(Debug, Clone)]
pub struct PowerPcState {
    pub pc: u32,
    pub npc: u32,
    pub gpr: [u32; NUM_GPRS],
    /// Condition register fields, one 64-bit "compare value" per field.
    pub cr: [u64; NUM_CR_FIELDS],
    pub msr: u32,
    pub fpscr: u32,
    pub exceptions: u32,
    /// Cycles left before the next scheduled event.
    pub downcount: i32,
    pub lr: u32,
    pub ctr: u32,
    pub xer: u32,
    pub xer_ca: u32,
    /// Paired-single registers.
    pub ps: [[f64; 2]; 32],
}

impl Default for PowerPcState {
    fn default() -> Self {
        Self {
            pc: 0,
            npc: 0,
            gpr: [0; NUM_GPRS],
            cr: [0; NUM_CR_FIELDS],
            msr: 0,
            fpscr: 0,
            exceptions: 0,
            downcount: 0,
            lr: 0,
            ctr: 0,
            xer: 0,
            xer_ca: 0,
            ps: [[0.0; 2]; 32],
        }
    }
}

impl PowerPcState {
    pub const PC: usize = offset_of!(PowerPcState, pc);
    pub const NPC: usize = offset_of!(PowerPcState, npc);
    pub const MSR: usize = offset_of!(PowerPcState, msr);
    pub const EXCEPTIONS: usize = offset_of!(PowerPcState, exceptions);
    pub const DOWNCOUNT: usize = offset_of!(PowerPcState, downcount);
    pub const LR: usize = offset_of!(PowerPcState, lr);
    pub const CTR: usize = offset_of!(PowerPcState, ctr);

    pub const fn gpr_offset(index: usize) -> usize {
        assert!(index < NUM_GPRS);
        offset_of!(PowerPcState, gpr) + index * 4
    }

    pub const fn cr_offset(field: usize) -> usize {
        assert!(field < NUM_CR_FIELDS);
        offset_of!(PowerPcState, cr) + field * 8
    }

    pub const fn ps_offset(index: usize) -> usize {
        assert!(index < 32);
        offset_of!(PowerPcState, ps) + index * 16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_fit_scaled_immediates() {
        // 32-bit fields must be 4-aligned and 64-bit fields 8-aligned for
        // the unsigned-offset LDR/STR forms.
        for i in 0..NUM_GPRS {
            assert_eq!(PowerPcState::gpr_offset(i) % 4, 0);
        }
        for i in 0..NUM_CR_FIELDS {
            assert_eq!(PowerPcState::cr_offset(i) % 8, 0);
        }
        // Even/odd GPR pairs can be fetched with one 64-bit load.
        assert_eq!(PowerPcState::gpr_offset(0) % 8, 0);
        assert!(PowerPcState::ps_offset(31) < 4096 * 8);
    }
}
