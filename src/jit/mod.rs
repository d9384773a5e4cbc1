//! PowerPC to AArch64 recompiler core.
//!
//! - `aarch64`: instruction encoder, immediates and call helpers
//! - `regcache`: guest register cache
//! - `backpatch` / `mmio`: guest memory accesses and their slow paths
//! - `block_cache`: compiled blocks, links between them, invalidation
//! - `compiler`: the driver tying them together over executable memory
//!
//! This module is only compiled when the `jit` feature is enabled.

pub mod aarch64;
pub mod asm_routines;
pub mod backpatch;
pub mod bitset;
pub mod block_cache;
pub mod codebuf;
pub mod compiler;
pub mod fault_handler;
pub mod free_ranges;
pub mod memory;
pub mod mmio;
pub mod ppc_state;
pub mod regcache;

/// Fixed host register assignments inside generated code.
///
/// X30 is only free between guest memory accesses: a backpatched access
/// becomes a `BL` and clobbers it.
pub mod regs {
    use super::aarch64::Reg;

    /// Guest CPU state ([`super::ppc_state::PowerPcState`]).
    pub const PPC_REG: Reg = Reg::X29;
    /// Base of the fastmem arena.
    pub const MEM_REG: Reg = Reg::X28;
    /// Guest PC handed to the dispatcher.
    pub const DISPATCHER_PC: Reg = Reg::W26;

    pub const SCRATCH: Reg = Reg::X30;
    pub const FP_SCRATCH: Reg = Reg::Q31;
}

pub use compiler::{AccessAddress, BlockBuilder, Jit, JitError, Translator};
