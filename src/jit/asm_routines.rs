//! Shared assembly routines: the entry trampoline, the dispatcher loop and
//! the exit path.
//!
//! ```text
//! enter:                 save callee-saved state, load PPC_REG/MEM_REG
//!                        DISPATCHER_PC = state.pc
//! dispatcher:            if state.downcount <= 0 goto do_timing
//! dispatcher_no_check:   state.pc = DISPATCHER_PC
//!                        entry = dispatch(ctx, DISPATCHER_PC)
//!                        if entry == 0 goto exit
//!                        goto entry (with GT flags set)
//! do_timing:             state.pc = DISPATCHER_PC
//!                        stop = timing(ctx)
//!                        DISPATCHER_PC = state.pc
//!                        if stop goto exit
//!                        goto dispatcher_no_check
//! exit:                  restore and return to the caller of enter
//! ```
//!
//! Block entries test the GT condition left by the exit that jumped to
//! them, so every path into a block must have fresh flags.

use std::ffi::c_void;

use super::aarch64::{Arm64Emitter, Cond, IndexType, Reg};
use super::bitset::BitSet32;
use super::ppc_state::PowerPcState;
use super::regs::{DISPATCHER_PC, MEM_REG, PPC_REG, SCRATCH};

/// X19..X30, the callee-saved general registers of AAPCS64.
const CALLEE_SAVED_GPRS: BitSet32 = BitSet32::from_bits(0x7FF8_0000);
/// Q8..Q15; only their low halves are callee-saved but saving whole
/// registers keeps the frame simple.
const CALLEE_SAVED_FPRS: BitSet32 = BitSet32::from_bits(0x0000_FF00);

/// Returns the host entry for a guest address, or 0 to leave the JIT.
pub type DispatchHook = extern "C" fn(*mut c_void, u32) -> usize;
/// Runs timed events and exceptions. Returns non-zero to leave the JIT.
pub type TimingHook = extern "C" fn(*mut c_void) -> u32;
/// Signature of [`AsmRoutines::enter`].
pub type EnterFn = unsafe extern "C" fn(*mut PowerPcState, *mut u8, *mut c_void);

/// Addresses of the generated routines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsmRoutines {
    pub enter: usize,
    pub dispatcher: usize,
    pub dispatcher_no_check: usize,
    pub do_timing: usize,
    pub exit: usize,
    /// One past the last routine word.
    pub end: usize,
}

/// Emit the routines at the cursor of `emit`.
pub fn generate(emit: &mut Arm64Emitter, dispatch: DispatchHook, timing: TimingHook) -> AsmRoutines {
    let pc = PowerPcState::PC as i32;
    let downcount = PowerPcState::DOWNCOUNT as i32;

    let enter = emit.code_ptr();
    emit.abi_push_registers(CALLEE_SAVED_GPRS);
    emit.abi_push_fp_registers(CALLEE_SAVED_FPRS);
    // [SP] holds the context pointer handed to both hooks.
    emit.sub_imm(Reg::SP, Reg::SP, 16, false);
    emit.str(Reg::X2, Reg::SP, IndexType::Unsigned, 0);
    emit.mov(PPC_REG, Reg::X0);
    emit.mov(MEM_REG, Reg::X1);
    emit.ldr(DISPATCHER_PC, PPC_REG, IndexType::Unsigned, pc);

    let dispatcher = emit.code_ptr();
    let scratch = SCRATCH.to_32();
    emit.ldr(scratch, PPC_REG, IndexType::Unsigned, downcount);
    emit.cmp_imm(scratch, 0, false);
    let bail = emit.fixup_b_cond(Cond::Le);

    let dispatcher_no_check = emit.code_ptr();
    emit.str(DISPATCHER_PC, PPC_REG, IndexType::Unsigned, pc);
    emit.ldr(Reg::X0, Reg::SP, IndexType::Unsigned, 0);
    emit.mov(Reg::W1, DISPATCHER_PC);
    emit.quick_call_function(dispatch as usize, Reg::X8);
    let no_block = emit.fixup_cbz(Reg::X0);
    emit.cmp_imm(Reg::X0, 0, false);
    emit.br(Reg::X0);

    emit.set_jump_target(bail);
    let do_timing = emit.code_ptr();
    emit.str(DISPATCHER_PC, PPC_REG, IndexType::Unsigned, pc);
    emit.ldr(Reg::X0, Reg::SP, IndexType::Unsigned, 0);
    emit.quick_call_function(timing as usize, Reg::X8);
    // The hook may have redirected the guest.
    emit.ldr(DISPATCHER_PC, PPC_REG, IndexType::Unsigned, pc);
    let stop = emit.fixup_cbnz(Reg::W0);
    emit.b(dispatcher_no_check);

    let exit = emit.code_ptr();
    emit.set_jump_target(no_block);
    emit.set_jump_target(stop);
    emit.add_imm(Reg::SP, Reg::SP, 16, false);
    emit.abi_pop_fp_registers(CALLEE_SAVED_FPRS);
    emit.abi_pop_registers(CALLEE_SAVED_GPRS);
    emit.ret();

    AsmRoutines { enter, dispatcher, dispatcher_no_check, do_timing, exit, end: emit.code_ptr() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::aarch64::branch_target;

    extern "C" fn dispatch(_: *mut c_void, _: u32) -> usize {
        0
    }

    extern "C" fn timing(_: *mut c_void) -> u32 {
        1
    }

    #[test]
    fn test_routine_layout() {
        let mut emit = Arm64Emitter::with_capacity(4096);
        let routines = generate(&mut emit, dispatch, timing);
        assert!(!emit.has_write_failed());
        assert!(routines.enter < routines.dispatcher);
        assert!(routines.dispatcher < routines.dispatcher_no_check);
        assert!(routines.dispatcher_no_check < routines.do_timing);
        assert!(routines.do_timing < routines.exit);
        assert_eq!(routines.end, emit.code_ptr());

        let buf = emit.buffer();
        // RET closes the routines.
        assert_eq!(buf.read_u32(routines.end - 4), 0xD65F03C0);
        // The downcount bail lands on do_timing.
        let bail = routines.dispatcher_no_check - 4;
        assert_eq!(branch_target(buf.read_u32(bail), bail), Some(routines.do_timing));
    }

    #[test]
    fn test_no_unresolved_fixups() {
        let mut emit = Arm64Emitter::with_capacity(4096);
        let routines = generate(&mut emit, dispatch, timing);
        let words = emit.buffer().words(routines.enter, routines.end);
        assert!(words.iter().all(|&w| w != 0xD4200000), "BRK placeholder left behind");

        // Every direct branch other than a hook call stays inside the routines.
        for (i, &word) in words.iter().enumerate() {
            let site = routines.enter + i * 4;
            if word & 0xFC00_0000 == 0x9400_0000 {
                continue;
            }
            if let Some(target) = branch_target(word, site) {
                assert!(target >= routines.enter && target < routines.end, "{word:#010x} at {site:#x}");
            }
        }
    }
}
