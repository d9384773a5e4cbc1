//! ppcjit - a PowerPC to AArch64 dynamic recompiler core
//!
//! Provides the AArch64 encoder, guest register cache, fastmem backpatching
//! with MMIO fast paths, and the block cache that links compiled blocks.
//! Guest instruction decoding is left to an embedder-supplied
//! [`jit::Translator`].

pub mod config;
#[cfg(feature = "jit")]
pub mod jit;

pub use config::{ConfigError, JitConfig};
#[cfg(feature = "jit")]
pub use jit::{Jit, JitError, Translator};
