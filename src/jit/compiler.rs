//! The JIT driver.
//!
//! [`Jit`] owns the code space, the block cache and the per-block helpers
//! (register cache, backpatcher, MMIO table). Guest instructions themselves
//! are translated by an external [`Translator`], which receives a
//! [`BlockBuilder`] for each block and emits through it.
//!
//! Code space is a single mapping: the near region (block bodies, starting
//! with the shared routines) followed by the far region (exit stubs and
//! memory slow paths). Both emitters span the whole mapping; each block is
//! written into the largest free range of its region.

use std::collections::BTreeSet;
use std::ffi::c_void;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::aarch64::{Arm64Emitter, Cond, IndexType, Reg};
use super::asm_routines::{self, AsmRoutines};
use super::backpatch::{AccessFlags, Backpatcher, MemAccessMode, MemoryCallbacks};
use super::bitset::BitSet32;
use super::block_cache::{BlockCache, BlockLinker, JitBlock, LinkData};
use super::codebuf::CodeBuffer;
use super::free_ranges::RangeSizeSet;
use super::memory::{ExecutableMemory, FastmemArena, MemoryError, flush_icache};
use super::mmio::{MmioMapping, MmioReadCodeGenerator, MmioWriteCodeGenerator};
use super::ppc_state::PowerPcState;
use super::regcache::{FlushMode, GprCache};
use super::regs::{DISPATCHER_PC, PPC_REG, SCRATCH};
use crate::config::{ConfigError, JitConfig};

/// Words reserved at every block entry: the downcount test, the guest PC
/// (at most two words for a W register) and the branch to the timing
/// routine. A destroyed block's entry is rewritten in the same space.
const BLOCK_ENTRY_WORDS: usize = 4;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("code space exhausted even after clearing the cache")]
    CodeSpaceExhausted,
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to translate block at {address:#010x}: {message}")]
    Translation { address: u32, message: String },
    #[error("failed to install fault handler: {0}")]
    SignalHandler(#[source] std::io::Error),
    #[error("generated code cannot run on this host")]
    UnsupportedHost,
}

/// The guest instruction front end.
pub trait Translator {
    /// Translate the block starting at `address` through `block`.
    ///
    /// Call [`BlockBuilder::begin_instruction`] before each guest
    /// instruction. A block that does not end with an unconditional exit
    /// falls through to the address after its last instruction.
    fn translate(&mut self, block: &mut BlockBuilder<'_>, address: u32) -> Result<(), JitError>;

    /// Called from the dispatcher when the downcount runs out or a block
    /// raised an exception. May change `state.pc`. Returns true to leave
    /// [`Jit::run`].
    fn on_timing(&mut self, state: &mut PowerPcState) -> bool {
        let _ = state;
        true
    }
}

/// Where a guest memory access gets its address from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessAddress {
    /// A W register holding the guest address.
    Reg(Reg),
    /// An address known while compiling.
    Const(u32),
}

/// Per-block emission state handed to a [`Translator`].
pub struct BlockBuilder<'a> {
    pub near: &'a mut Arm64Emitter,
    pub far: &'a mut Arm64Emitter,
    pub gpr: &'a mut GprCache,
    backpatch: &'a mut Backpatcher,
    mmio: &'a MmioMapping,
    routines: &'a AsmRoutines,
    config: &'a JitConfig,
    arena: Option<&'a FastmemArena>,
    address: u32,
    entry: usize,
    exits: Vec<LinkData>,
    physical_addresses: BTreeSet<u32>,
    num_instructions: u32,
    last_instruction: Option<u32>,
    /// Cycles charged to the downcount by an exit at this point.
    cycles: u32,
    ended: bool,
}

struct BlockOutput {
    entry: usize,
    exits: Vec<LinkData>,
    physical_addresses: BTreeSet<u32>,
    num_instructions: u32,
}

impl<'a> BlockBuilder<'a> {
    /// Guest address of the block.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn config(&self) -> &JitConfig {
        self.config
    }

    pub fn num_instructions(&self) -> u32 {
        self.num_instructions
    }

    /// Address following the last instruction begun so far.
    pub fn next_pc(&self) -> u32 {
        self.last_instruction.map_or(self.address, |pc| pc.wrapping_add(4))
    }

    /// Write the block entry: continue into the body while the downcount
    /// from the incoming exit is positive, otherwise hand the block's
    /// address to the timing routine.
    fn write_entry(&mut self) {
        let entry = self.near.code_ptr();
        let body = self.near.fixup_b_cond(Cond::Gt);
        self.near.movi2r(DISPATCHER_PC, self.address as u64);
        while self.near.code_ptr() < entry + (BLOCK_ENTRY_WORDS - 1) * 4 {
            self.near.nop();
        }
        self.near.b(self.routines.do_timing);
        self.near.set_jump_target(body);
        self.entry = entry;
    }

    /// Start the guest instruction at `address`, costing `cycles`.
    pub fn begin_instruction(&mut self, address: u32, cycles: u32) {
        if !self.config.register_cache && self.num_instructions > 0 {
            self.gpr.flush(self.near, FlushMode::All, None);
        }
        self.physical_addresses.insert(address);
        self.num_instructions += 1;
        self.last_instruction = Some(address);
        self.cycles = self.cycles.saturating_add(cycles);
        self.ended = false;
    }

    /// Emit one guest memory access between `data` and `address`.
    ///
    /// Constant addresses go to the MMIO table first, then to the inline
    /// access alone when they are known RAM. Everything else gets the
    /// inline access backed by a fault-driven slow path (or only the slow
    /// path when fastmem is off). Clobbers W0 and X30.
    pub fn memory_access(&mut self, flags: AccessFlags, data: Reg, address: AccessAddress) {
        flags.validate();
        let gprs = self.gpr.caller_saved_used();
        let fprs = BitSet32::new();

        let (addr, mode) = match address {
            AccessAddress::Reg(reg) => (reg.to_32(), MemAccessMode::Auto),
            AccessAddress::Const(guest) => {
                if self.emit_mmio_access(flags, data, guest, gprs, fprs) {
                    return;
                }
                self.near.movi2r(Reg::W0, guest as u64);
                let size = (flags.size_bits() / 8) as usize;
                let mode = if self.arena.is_some_and(|arena| arena.is_ram(guest, size)) {
                    MemAccessMode::AlwaysFastAccess
                } else {
                    MemAccessMode::Auto
                };
                (Reg::W0, mode)
            }
        };
        self.backpatch
            .emit_backpatch_routine(self.near, self.far, flags, mode, data, addr, gprs, fprs);
    }

    fn emit_mmio_access(
        &mut self,
        flags: AccessFlags,
        data: Reg,
        address: u32,
        gprs: BitSet32,
        fprs: BitSet32,
    ) -> bool {
        let size = flags.size_bits();
        if flags.is_float() || size > 32 {
            return false;
        }
        if flags.is_store() {
            let Some(handler) = self.mmio.write_handler(address, size) else {
                return false;
            };
            let mut generator = MmioWriteCodeGenerator::new(self.near, gprs, fprs, data, size, address);
            handler.visit(&mut generator);
        } else {
            let Some(handler) = self.mmio.read_handler(address, size) else {
                return false;
            };
            let sign_extend = flags.contains(AccessFlags::EXTEND);
            let mut generator =
                MmioReadCodeGenerator::new(self.near, gprs, fprs, data, size, sign_extend, address);
            handler.visit(&mut generator);
        }
        true
    }

    /// Subtract the cycles run so far from the downcount, leaving the
    /// flags of the result for the dispatcher and the next block's entry.
    fn emit_downcount(&mut self) {
        let counter = SCRATCH.to_32();
        let offset = PowerPcState::DOWNCOUNT as i32;
        self.near.ldr(counter, PPC_REG, IndexType::Unsigned, offset);
        self.near.subsi2r(counter, counter, self.cycles as u64, Some(Reg::W0));
        self.near.str(counter, PPC_REG, IndexType::Unsigned, offset);
    }

    /// Leave the block for `destination`. The exit is a single linkable
    /// branch, initially pointing at a far stub that enters the dispatcher.
    pub fn write_exit(&mut self, destination: u32, is_call: bool) {
        self.gpr.flush(self.near, FlushMode::MaintainState, None);
        self.emit_downcount();

        let exit_ptr = self.near.code_ptr();
        let exit_stub = self.far.code_ptr();
        if is_call {
            self.near.bl(exit_stub);
        } else {
            self.near.b(exit_stub);
        }
        self.far.movi2r(DISPATCHER_PC, destination as u64);
        self.far.b(self.routines.dispatcher);

        self.exits.push(LinkData {
            exit_address: destination,
            exit_ptr,
            exit_stub,
            is_call,
            linked: false,
        });
        self.ended = true;
    }

    /// Leave the block for `destination` when `cond` holds and fall
    /// through otherwise. The register cache state is kept for the
    /// fall-through path.
    pub fn write_conditional_exit(&mut self, cond: Cond, destination: u32) {
        let skip = self.near.fixup_b_cond(cond.invert());
        self.write_exit(destination, false);
        self.near.set_jump_target(skip);
        self.ended = false;
    }

    /// Leave the block for the guest address in `dest`, which is not
    /// linkable.
    pub fn write_exit_reg(&mut self, dest: Reg) {
        if dest.to_32() != DISPATCHER_PC {
            self.near.mov(DISPATCHER_PC, dest.to_32());
        }
        self.gpr.flush(self.near, FlushMode::MaintainState, None);
        self.emit_downcount();
        self.near.b(self.routines.dispatcher);
        self.ended = true;
    }

    /// Raise `exception` (bits of [`super::ppc_state::exception`]) at
    /// guest address `pc` and let the timing routine deliver it.
    pub fn write_exception_exit(&mut self, pc: u32, exception: u32) {
        self.gpr.flush(self.near, FlushMode::MaintainState, None);
        let pending = SCRATCH.to_32();
        let offset = PowerPcState::EXCEPTIONS as i32;
        self.near.ldr(pending, PPC_REG, IndexType::Unsigned, offset);
        self.near.orri2r(pending, pending, exception as u64, Some(Reg::W0));
        self.near.str(pending, PPC_REG, IndexType::Unsigned, offset);
        self.emit_downcount();
        self.near.movi2r(DISPATCHER_PC, pc as u64);
        self.near.b(self.routines.do_timing);
        self.ended = true;
    }

    fn finish(mut self) -> BlockOutput {
        if !self.ended {
            let next = self.next_pc();
            self.write_exit(next, false);
        }
        let mut physical_addresses = self.physical_addresses;
        physical_addresses.insert(self.address);
        BlockOutput {
            entry: self.entry,
            exits: self.exits,
            physical_addresses,
            num_instructions: self.num_instructions,
        }
    }
}

/// Writes link sites and destroyed entries through the near emitter.
struct ArmBlockLinker<'a> {
    emit: &'a mut Arm64Emitter,
    routines: AsmRoutines,
}

impl BlockLinker for ArmBlockLinker<'_> {
    fn write_link_block(&mut self, link: &LinkData, target: Option<usize>) {
        let site = link.exit_ptr;
        let target = target.unwrap_or(link.exit_stub);
        let word = if link.is_call {
            Arm64Emitter::encode_bl(site, target)
        } else {
            Arm64Emitter::encode_b(site, target)
        };
        self.emit.buffer_mut().patch_u32(site, word);
        flush_icache(site, site + 4);
    }

    fn write_destroy_block(&mut self, block: &JitBlock) {
        let entry = block.normal_entry;
        let end = entry + BLOCK_ENTRY_WORDS * 4;
        let saved = (self.emit.code_ptr(), self.emit.buffer().code_end(), self.emit.has_write_failed());

        self.emit.buffer_mut().set_code_ptr_unsafe(entry, end, false);
        self.emit.movi2r(DISPATCHER_PC, block.effective_address as u64);
        while self.emit.code_ptr() < end - 4 {
            self.emit.nop();
        }
        self.emit.b(self.routines.dispatcher_no_check);
        debug_assert!(!self.emit.has_write_failed(), "destroyed block entry does not fit");

        self.emit.buffer_mut().set_code_ptr_unsafe(saved.0, saved.1, saved.2);
        flush_icache(entry, end);
    }
}

/// Addresses of the two code regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRegions {
    pub near_start: usize,
    pub near_end: usize,
    pub far_start: usize,
    pub far_end: usize,
}

pub struct Jit {
    config: JitConfig,
    memory: ExecutableMemory,
    regions: CodeRegions,
    near: Arm64Emitter,
    far: Arm64Emitter,
    near_free: RangeSizeSet,
    far_free: RangeSizeSet,
    routines: AsmRoutines,
    blocks: BlockCache,
    gpr: GprCache,
    backpatch: Backpatcher,
    mmio: MmioMapping,
    arena: Option<FastmemArena>,
}

impl Jit {
    /// Reserve code space (and the fastmem arena when enabled) and
    /// generate the shared routines.
    pub fn new(config: JitConfig, callbacks: MemoryCallbacks) -> Result<Self, JitError> {
        config.validate()?;
        let memory = ExecutableMemory::new(
            config.near_code_size + config.far_code_size,
            config.write_xor_execute,
        )?;
        let far_start = memory.start() + config.near_code_size;
        let regions = CodeRegions {
            near_start: memory.start(),
            near_end: far_start,
            far_start,
            far_end: memory.end(),
        };
        // Both emitters may address the whole mapping: link sites live in
        // near code and point into far code.
        let near = Arm64Emitter::new(unsafe { CodeBuffer::from_raw(memory.as_mut_ptr(), memory.size()) });
        let far = Arm64Emitter::new(unsafe { CodeBuffer::from_raw(memory.as_mut_ptr(), memory.size()) });

        let arena = if config.fastmem { Some(FastmemArena::new()?) } else { None };
        let backpatch = Backpatcher::new(callbacks, arena.is_some());

        let mut jit = Self {
            blocks: BlockCache::new(config.block_linking),
            config,
            memory,
            regions,
            near,
            far,
            near_free: RangeSizeSet::new(),
            far_free: RangeSizeSet::new(),
            routines: AsmRoutines::default(),
            gpr: GprCache::new(),
            backpatch,
            mmio: MmioMapping::new(),
            arena,
        };
        jit.reset_code_space()?;
        info!(
            near = jit.config.near_code_size,
            far = jit.config.far_code_size,
            fastmem = jit.arena.is_some(),
            "jit initialised"
        );
        Ok(jit)
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn routines(&self) -> &AsmRoutines {
        &self.routines
    }

    pub fn regions(&self) -> CodeRegions {
        self.regions
    }

    pub fn blocks(&self) -> &BlockCache {
        &self.blocks
    }

    pub fn backpatcher(&self) -> &Backpatcher {
        &self.backpatch
    }

    /// Read access to the code space, e.g. for disassembly.
    pub fn code(&self) -> &CodeBuffer {
        self.near.buffer()
    }

    pub fn free_near(&self) -> &RangeSizeSet {
        &self.near_free
    }

    pub fn free_far(&self) -> &RangeSizeSet {
        &self.far_free
    }

    /// MMIO handlers consulted for constant addresses. Blocks compiled
    /// before a change keep their old code until they are invalidated.
    pub fn mmio_mut(&mut self) -> &mut MmioMapping {
        &mut self.mmio
    }

    pub fn fastmem_arena(&self) -> Option<&FastmemArena> {
        self.arena.as_ref()
    }

    /// Back `[guest_addr, guest_addr + size)` with RAM in the fastmem
    /// arena. A no-op without fastmem.
    pub fn map_ram(&mut self, guest_addr: u32, size: usize) -> Result<(), JitError> {
        if let Some(arena) = self.arena.as_mut() {
            arena.map_region(guest_addr, size)?;
        }
        Ok(())
    }

    /// Host pointer to guest RAM at `guest_addr`.
    pub fn ram_ptr(&self, guest_addr: u32) -> Option<*mut u8> {
        let arena = self.arena.as_ref()?;
        arena
            .is_ram(guest_addr, 1)
            .then(|| unsafe { arena.base().add(guest_addr as usize) })
    }

    /// Regenerate the routines and mark everything after them free.
    fn reset_code_space(&mut self) -> Result<(), JitError> {
        let CodeRegions { near_start, near_end, far_start, far_end } = self.regions;
        let _write = self.memory.begin_write()?;

        self.near.set_code_ptr(near_start, near_end, false);
        self.routines = asm_routines::generate(&mut self.near, dispatch_hook, timing_hook);
        if self.near.has_write_failed() {
            return Err(JitError::CodeSpaceExhausted);
        }
        self.near.align_code_16();
        let routines_end = self.near.code_ptr();
        self.near.flush_icache();

        self.backpatch.faults_mut().clear();
        self.near_free.clear();
        self.far_free.clear();
        self.near_free.insert(routines_end, near_end);
        self.far_free.insert(far_start, far_end);
        Ok(())
    }

    /// Destroy every block and start over with empty code space.
    pub fn clear_cache(&mut self) -> Result<(), JitError> {
        {
            let _write = self.memory.begin_write()?;
            let mut linker = ArmBlockLinker { emit: &mut self.near, routines: self.routines };
            self.blocks.clear(&mut linker);
        }
        self.blocks.take_ranges_to_free_near();
        self.blocks.take_ranges_to_free_far();
        self.reset_code_space()?;
        warn!("jit cache cleared");
        Ok(())
    }

    /// Destroy every block with guest code in `[address, address + length)`.
    /// Returns the number of blocks destroyed.
    pub fn invalidate_icache(&mut self, address: u32, length: u32) -> Result<usize, JitError> {
        let _write = self.memory.begin_write()?;
        let mut linker = ArmBlockLinker { emit: &mut self.near, routines: self.routines };
        let destroyed = self.blocks.invalidate_icache(address, length, &mut linker);
        if destroyed > 0 {
            debug!(address = format_args!("{address:#010x}"), length, destroyed, "invalidated blocks");
        }
        Ok(destroyed)
    }

    /// Return spans of destroyed blocks to the free trackers.
    fn reclaim_freed_ranges(&mut self) {
        for (start, end) in self.blocks.take_ranges_to_free_near().iter() {
            self.backpatch.faults_mut().remove_range(start, end);
            self.near_free.insert(start, end);
        }
        for (start, end) in self.blocks.take_ranges_to_free_far().iter() {
            self.far_free.insert(start, end);
        }
    }

    /// Host entry of the block at `address`, compiling it if needed.
    pub fn jit(&mut self, address: u32, translator: &mut dyn Translator) -> Result<usize, JitError> {
        if let Some(entry) = self.blocks.entry_point(address) {
            return Ok(entry);
        }
        self.reclaim_freed_ranges();
        if let Some(entry) = self.try_compile(address, translator)? {
            return Ok(entry);
        }

        warn!(address = format_args!("{address:#010x}"), "code space exhausted, clearing cache");
        self.clear_cache()?;
        match self.try_compile(address, translator)? {
            Some(entry) => Ok(entry),
            None => {
                error!(address = format_args!("{address:#010x}"), "block does not fit in empty code space");
                Err(JitError::CodeSpaceExhausted)
            }
        }
    }

    /// Compile into the largest free ranges. `Ok(None)` means the block
    /// did not fit.
    fn try_compile(&mut self, address: u32, translator: &mut dyn Translator) -> Result<Option<usize>, JitError> {
        let (Some((near_begin, near_limit)), Some((far_begin, far_limit))) =
            (self.near_free.largest(), self.far_free.largest())
        else {
            return Ok(None);
        };

        let _write = self.memory.begin_write()?;
        self.blocks.allocate_block(address);
        self.near.set_code_ptr(near_begin, near_limit, false);
        self.far.set_code_ptr(far_begin, far_limit, false);
        self.gpr.start();

        let mut builder = BlockBuilder {
            near: &mut self.near,
            far: &mut self.far,
            gpr: &mut self.gpr,
            backpatch: &mut self.backpatch,
            mmio: &self.mmio,
            routines: &self.routines,
            config: &self.config,
            arena: self.arena.as_ref(),
            address,
            entry: near_begin,
            exits: Vec::new(),
            physical_addresses: BTreeSet::new(),
            num_instructions: 0,
            last_instruction: None,
            cycles: 0,
            ended: false,
        };
        builder.write_entry();
        let result = translator.translate(&mut builder, address);
        let output = builder.finish();

        let near_end = self.near.code_ptr();
        let far_end = self.far.code_ptr();
        if let Err(e) = result {
            self.backpatch.faults_mut().remove_range(near_begin, near_limit);
            self.blocks.abandon_block(address);
            return Err(e);
        }
        if self.near.has_write_failed() || self.far.has_write_failed() {
            self.backpatch.faults_mut().remove_range(near_begin, near_limit);
            self.blocks.abandon_block(address);
            debug!(address = format_args!("{address:#010x}"), "block did not fit in free range");
            return Ok(None);
        }
        self.near.flush_icache();
        self.far.flush_icache();
        self.near_free.erase(near_begin, near_end);
        self.far_free.erase(far_begin, far_end);

        let Some(block) = self.blocks.get_block_mut(address) else {
            unreachable!("block allocated before translation");
        };
        block.normal_entry = output.entry;
        block.near_begin = near_begin;
        block.near_end = near_end;
        block.far_begin = far_begin;
        block.far_end = far_end;
        block.linked_exits = output.exits;
        block.physical_addresses = output.physical_addresses;
        block.num_instructions = output.num_instructions;

        let mut linker = ArmBlockLinker { emit: &mut self.near, routines: self.routines };
        self.blocks.finalize_block(address, &mut linker);
        debug!(
            address = format_args!("{address:#010x}"),
            instructions = output.num_instructions,
            near = near_end - near_begin,
            far = far_end - far_begin,
            "compiled block"
        );
        Ok(Some(output.entry))
    }

    /// Repair a fastmem access that faulted at host `pc` while touching
    /// host address `access_addr`. Returns the address to resume at, or
    /// `None` when the fault is not ours.
    pub fn handle_fault(&mut self, access_addr: usize, pc: usize) -> Option<usize> {
        let in_arena = self.arena.as_ref().is_some_and(|arena| arena.contains(access_addr));
        if !in_arena || !self.memory.contains(pc) {
            error!(
                access = format_args!("{access_addr:#x}"),
                pc = format_args!("{pc:#x}"),
                "unhandled memory fault outside generated code or the fastmem arena"
            );
            return None;
        }

        let _write = match self.memory.begin_write() {
            Ok(scope) => scope,
            Err(e) => {
                error!("cannot make code writable for backpatching: {e}");
                return None;
            }
        };
        let resume = self.backpatch.handle_fastmem_fault(&mut self.near, pc);
        if resume.is_none() {
            error!(
                access = format_args!("{access_addr:#x}"),
                pc = format_args!("{pc:#x}"),
                "memory fault in generated code matches no fastmem access"
            );
        }
        resume
    }

    /// Run guest code from `state.pc` until the translator's timing hook
    /// asks to stop or compilation fails.
    pub fn run(&mut self, state: &mut PowerPcState, translator: &mut dyn Translator) -> Result<(), JitError> {
        #[cfg(target_arch = "aarch64")]
        {
            use super::asm_routines::EnterFn;
            use super::fault_handler::{ActiveJit, install_fault_handler};

            if self.arena.is_some() {
                install_fault_handler()?;
            }
            let mem_base = self.arena.as_ref().map_or(std::ptr::null_mut(), |arena| arena.base());
            let state_ptr: *mut PowerPcState = state;
            let mut ctx = RunContext {
                jit: self as *mut Jit,
                translator: translator as *mut dyn Translator,
                state: state_ptr,
                error: None,
            };
            let _active = ActiveJit::enter(self as *mut Jit);
            let enter: EnterFn = unsafe { std::mem::transmute::<usize, EnterFn>(self.routines.enter) };
            unsafe { enter(state_ptr, mem_base, &mut ctx as *mut RunContext<'_> as *mut c_void) };
            match ctx.error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = (state, translator);
            Err(JitError::UnsupportedHost)
        }
    }
}

/// What the dispatcher hooks need, passed through the routines as an
/// opaque pointer.
struct RunContext<'a> {
    jit: *mut Jit,
    translator: *mut (dyn Translator + 'a),
    state: *mut PowerPcState,
    error: Option<JitError>,
}

extern "C" fn dispatch_hook(ctx: *mut c_void, pc: u32) -> usize {
    let ctx = unsafe { &mut *(ctx as *mut RunContext<'_>) };
    let (jit, translator) = unsafe { (&mut *ctx.jit, &mut *ctx.translator) };
    match jit.jit(pc, translator) {
        Ok(entry) => entry,
        Err(e) => {
            error!(pc = format_args!("{pc:#010x}"), "leaving jit: {e}");
            ctx.error = Some(e);
            0
        }
    }
}

extern "C" fn timing_hook(ctx: *mut c_void) -> u32 {
    let ctx = unsafe { &mut *(ctx as *mut RunContext<'_>) };
    let (translator, state) = unsafe { (&mut *ctx.translator, &mut *ctx.state) };
    translator.on_timing(state) as u32
}
