//! Guest register cache.
//!
//! Tracks where each guest GPR and condition-register field currently lives
//! (guest state in memory, a known constant, or a host register) and emits
//! the loads and stores needed to move values between those places.
//!
//! The cache never stores a reference to the emitter; every operation that
//! may generate code takes it explicitly.

use std::fmt;

use tracing::trace;

use super::aarch64::{Arm64Emitter, IndexType, Reg};
use super::bitset::BitSet32;
use super::ppc_state::{NUM_CR_FIELDS, NUM_GPRS, PowerPcState};
use super::regs::{PPC_REG, SCRATCH};

/// Host registers handed out by the cache, in preference order. Callee
/// saved registers come first so that they survive helper calls.
const ALLOCATION_ORDER: [u8; 20] = [19, 20, 21, 22, 23, 24, 25, 27, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17];

/// Highest register number the host calling convention lets a callee clobber.
const LAST_CALLER_SAVED: u8 = 18;

/// A guest register slot: GPR 0..32 or CR field 0..8.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestReg(u8);

impl GuestReg {
    pub const COUNT: usize = NUM_GPRS + NUM_CR_FIELDS;

    pub fn gpr(index: usize) -> Self {
        assert!(index < NUM_GPRS, "r{index} out of range");
        Self(index as u8)
    }

    pub fn cr(field: usize) -> Self {
        assert!(field < NUM_CR_FIELDS, "cr{field} out of range");
        Self((NUM_GPRS + field) as u8)
    }

    pub fn all() -> impl Iterator<Item = GuestReg> {
        (0..Self::COUNT as u8).map(GuestReg)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_cr(self) -> bool {
        self.index() >= NUM_GPRS
    }

    /// Offset of the backing field inside [`PowerPcState`].
    pub fn state_offset(self) -> usize {
        if self.is_cr() {
            PowerPcState::cr_offset(self.index() - NUM_GPRS)
        } else {
            PowerPcState::gpr_offset(self.index())
        }
    }

    /// The view of `reg` holding this guest register's value.
    pub fn view(self, reg: Reg) -> Reg {
        if self.is_cr() { reg.to_64() } else { reg.to_32() }
    }

    fn zero_reg(self) -> Reg {
        if self.is_cr() { Reg::ZR } else { Reg::WZR }
    }
}

impl fmt::Debug for GuestReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cr() {
            write!(f, "cr{}", self.index() - NUM_GPRS)
        } else {
            write!(f, "r{}", self.index())
        }
    }
}

/// Which 32-bit half of a shared 64-bit host register a paired slot owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// The value lives only in guest state.
    NotLoaded,
    /// The value is a known constant. `dirty` means guest state has not
    /// been updated with it yet.
    Immediate { value: u64, dirty: bool },
    InRegister { reg: Reg, dirty: bool },
    /// Two adjacent GPRs loaded by one 64-bit load. Both halves are always
    /// clean; writing either one splits the pair first.
    PairedAway { reg: Reg, sibling: GuestReg, half: Half },
}

impl SlotState {
    pub fn host_reg(&self) -> Option<Reg> {
        match *self {
            SlotState::InRegister { reg, .. } | SlotState::PairedAway { reg, .. } => Some(reg),
            SlotState::NotLoaded | SlotState::Immediate { .. } => None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        matches!(
            *self,
            SlotState::Immediate { dirty: true, .. } | SlotState::InRegister { dirty: true, .. }
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct GuestSlot {
    state: SlotState,
    /// Instructions since this slot was last touched.
    last_used: u32,
    locked: bool,
}

impl GuestSlot {
    const EMPTY: GuestSlot = GuestSlot { state: SlotState::NotLoaded, last_used: 0, locked: false };
}

/// One allocatable host register. Ownership is derived from the guest
/// slots, never stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRegister {
    reg: Reg,
    locked: bool,
}

impl HostRegister {
    pub fn reg(&self) -> Reg {
        self.reg
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Store dirty values and forget every binding.
    All,
    /// Store dirty values but keep bindings and dirty flags as they are,
    /// for code paths that branch away and then continue with the cache.
    MaintainState,
}

pub struct GprCache {
    host_regs: Vec<HostRegister>,
    slots: [GuestSlot; GuestReg::COUNT],
}

impl Default for GprCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GprCache {
    pub fn new() -> Self {
        Self {
            host_regs: ALLOCATION_ORDER
                .iter()
                .map(|&n| HostRegister { reg: Reg::x(n), locked: false })
                .collect(),
            slots: [GuestSlot::EMPTY; GuestReg::COUNT],
        }
    }

    /// Forget all state at the start of a block.
    pub fn start(&mut self) {
        self.slots = [GuestSlot::EMPTY; GuestReg::COUNT];
        for host in &mut self.host_regs {
            host.locked = false;
        }
    }

    pub fn host_registers(&self) -> &[HostRegister] {
        &self.host_regs
    }

    pub fn state(&self, guest: GuestReg) -> SlotState {
        self.slots[guest.index()].state
    }

    pub fn last_used(&self, guest: GuestReg) -> u32 {
        self.slots[guest.index()].last_used
    }

    /// Guest slot currently holding `reg`, if any. For a pair this is the
    /// low half.
    pub fn owner(&self, reg: Reg) -> Option<GuestReg> {
        GuestReg::all().find(|&g| match self.slots[g.index()].state {
            SlotState::InRegister { reg: r, .. } => r.num() == reg.num(),
            SlotState::PairedAway { reg: r, half, .. } => r.num() == reg.num() && half == Half::Low,
            _ => false,
        })
    }

    /// Registers that are neither locked nor bound.
    pub fn unlocked_register_count(&self) -> usize {
        self.host_regs
            .iter()
            .filter(|h| !h.locked && self.owner(h.reg).is_none())
            .count()
    }

    fn host_index(&self, reg: Reg) -> Option<usize> {
        self.host_regs.iter().position(|h| h.reg.num() == reg.num())
    }

    fn find_free(&self) -> Option<Reg> {
        self.host_regs
            .iter()
            .find(|h| !h.locked && self.owner(h.reg).is_none())
            .map(|h| h.reg)
    }

    /// The unlocked bound slot that has gone unused the longest.
    fn most_stale(&self) -> Option<GuestReg> {
        let mut best: Option<GuestReg> = None;
        for guest in GuestReg::all() {
            let slot = &self.slots[guest.index()];
            let Some(reg) = slot.state.host_reg() else {
                continue;
            };
            if slot.locked || self.host_regs.iter().any(|h| h.reg.num() == reg.num() && h.locked) {
                continue;
            }
            if let SlotState::PairedAway { sibling, .. } = slot.state
                && self.slots[sibling.index()].locked
            {
                continue;
            }
            if best.is_none_or(|b| slot.last_used > self.slots[b.index()].last_used) {
                best = Some(guest);
            }
        }
        best
    }

    /// Find a host register for a new binding, evicting if necessary.
    fn allocate(&mut self, emit: &mut Arm64Emitter) -> Reg {
        if let Some(reg) = self.find_free() {
            return reg;
        }
        let Some(victim) = self.most_stale() else {
            panic!("register exhaustion: every host register is locked or bound to a locked guest register");
        };
        trace!(?victim, last_used = self.slots[victim.index()].last_used, "evicting guest register");
        let Some(reg) = self.state(victim).host_reg() else {
            unreachable!("eviction victim is always bound");
        };
        self.flush_slot(emit, victim, FlushMode::All, SCRATCH);
        reg
    }

    /// Get a scratch host register. It stays locked until [`Self::unlock`].
    pub fn get_reg(&mut self, emit: &mut Arm64Emitter) -> Reg {
        let reg = self.allocate(emit);
        if let Some(i) = self.host_index(reg) {
            self.host_regs[i].locked = true;
        }
        reg
    }

    /// Reserve specific host registers, first evicting whatever they hold.
    pub fn lock(&mut self, emit: &mut Arm64Emitter, regs: &[Reg]) {
        for &reg in regs {
            let Some(i) = self.host_index(reg) else {
                panic!("{reg:?} is not an allocatable register");
            };
            if let Some(owner) = self.owner(reg) {
                self.flush_slot(emit, owner, FlushMode::All, SCRATCH);
            }
            self.host_regs[i].locked = true;
        }
    }

    pub fn unlock(&mut self, regs: &[Reg]) {
        for &reg in regs {
            let Some(i) = self.host_index(reg) else {
                panic!("{reg:?} is not an allocatable register");
            };
            assert!(self.host_regs[i].locked, "{reg:?} unlocked twice");
            self.host_regs[i].locked = false;
        }
    }

    /// Pin a guest slot's binding so it cannot be evicted.
    pub fn lock_guest(&mut self, guest: GuestReg) {
        self.slots[guest.index()].locked = true;
    }

    pub fn unlock_guest(&mut self, guest: GuestReg) {
        self.slots[guest.index()].locked = false;
    }

    fn touch(&mut self, guest: GuestReg) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i == guest.index() {
                slot.last_used = 0;
            } else {
                slot.last_used = slot.last_used.saturating_add(1);
            }
        }
    }

    /// Age every slot not in `used` by one instruction.
    pub fn update_last_used(&mut self, used: &[GuestReg]) {
        for guest in GuestReg::all() {
            let slot = &mut self.slots[guest.index()];
            if used.contains(&guest) {
                slot.last_used = 0;
            } else {
                slot.last_used = slot.last_used.saturating_add(1);
            }
        }
    }

    /// Host register holding `guest` for reading.
    pub fn r(&mut self, emit: &mut Arm64Emitter, guest: GuestReg) -> Reg {
        self.bind_to_register(emit, guest, true, false)
    }

    /// Host register holding `guest` for reading and writing.
    pub fn rw(&mut self, emit: &mut Arm64Emitter, guest: GuestReg) -> Reg {
        self.bind_to_register(emit, guest, true, true)
    }

    /// Make sure `guest` is in a host register and return its view.
    ///
    /// With `will_read` the current value is loaded or materialised. With
    /// `will_write` the slot becomes dirty; without it the slot keeps its
    /// dirty flag, so a later [`FlushMode::MaintainState`] flush never
    /// writes back a value the caller has not produced yet.
    pub fn bind_to_register(
        &mut self,
        emit: &mut Arm64Emitter,
        guest: GuestReg,
        will_read: bool,
        will_write: bool,
    ) -> Reg {
        if let SlotState::PairedAway { reg, half, .. } = self.state(guest) {
            match half {
                Half::Low if !will_write => {
                    self.touch(guest);
                    return guest.view(reg);
                }
                Half::Low => self.unpair(guest),
                Half::High if will_read => self.split_high(emit, guest),
                Half::High => self.unpair(guest),
            }
        }

        let state = match self.state(guest) {
            SlotState::NotLoaded => {
                let reg = self.allocate(emit);
                if will_read {
                    emit.ldr(guest.view(reg), PPC_REG, IndexType::Unsigned, guest.state_offset() as i32);
                }
                SlotState::InRegister { reg, dirty: will_write }
            }
            SlotState::Immediate { value, dirty } => {
                if !will_read && dirty && !will_write {
                    self.store_immediate(emit, guest, value, SCRATCH);
                }
                // Immediates occupy no register, so they are not candidates
                // for eviction while allocating.
                let reg = self.allocate(emit);
                if will_read {
                    emit.movi2r(guest.view(reg), value);
                }
                SlotState::InRegister { reg, dirty: (will_read && dirty) || will_write }
            }
            SlotState::InRegister { reg, dirty } => SlotState::InRegister { reg, dirty: dirty || will_write },
            SlotState::PairedAway { .. } => unreachable!("pair split above"),
        };
        self.slots[guest.index()].state = state;
        self.touch(guest);
        match state.host_reg() {
            Some(reg) => guest.view(reg),
            None => unreachable!("bound slot has a register"),
        }
    }

    /// Load the even/odd GPR pair starting at `low` with one 64-bit load.
    /// Returns `None` when either half is already cached some other way.
    pub fn bind_pair(&mut self, emit: &mut Arm64Emitter, low: GuestReg) -> Option<Reg> {
        assert!(!low.is_cr() && low.index() % 2 == 0, "{low:?} cannot start a pair");
        let high = GuestReg::gpr(low.index() + 1);
        if self.state(low) != SlotState::NotLoaded || self.state(high) != SlotState::NotLoaded {
            return None;
        }
        let reg = self.allocate(emit);
        emit.ldr(reg.to_64(), PPC_REG, IndexType::Unsigned, low.state_offset() as i32);
        self.slots[low.index()].state = SlotState::PairedAway { reg, sibling: high, half: Half::Low };
        self.slots[high.index()].state = SlotState::PairedAway { reg, sibling: low, half: Half::High };
        self.touch(low);
        self.slots[high.index()].last_used = 0;
        Some(reg.to_64())
    }

    /// Dissolve the pair `guest` belongs to without emitting code: the low
    /// half keeps the register and the high half falls back to memory.
    fn unpair(&mut self, guest: GuestReg) {
        let SlotState::PairedAway { reg, sibling, half } = self.state(guest) else {
            return;
        };
        let (low, high) = match half {
            Half::Low => (guest, sibling),
            Half::High => (sibling, guest),
        };
        self.slots[low.index()].state = SlotState::InRegister { reg, dirty: false };
        self.slots[high.index()].state = SlotState::NotLoaded;
    }

    /// Move the high half of a pair into its own register.
    fn split_high(&mut self, emit: &mut Arm64Emitter, high: GuestReg) {
        let SlotState::PairedAway { reg, sibling: low, half: Half::High } = self.state(high) else {
            return;
        };
        let saved = (self.slots[low.index()].locked, self.slots[high.index()].locked);
        self.slots[low.index()].locked = true;
        self.slots[high.index()].locked = true;
        let new_reg = self.allocate(emit);
        self.slots[low.index()].locked = saved.0;
        self.slots[high.index()].locked = saved.1;

        emit.lsr_imm(new_reg.to_64(), reg.to_64(), 32);
        self.slots[low.index()].state = SlotState::InRegister { reg, dirty: false };
        self.slots[high.index()].state = SlotState::InRegister { reg: new_reg, dirty: false };
    }

    /// Record that `guest` now holds a known constant.
    pub fn set_immediate(&mut self, guest: GuestReg, value: u64, dirty: bool) {
        self.unpair(guest);
        let value = if guest.is_cr() { value } else { value & 0xFFFF_FFFF };
        self.slots[guest.index()].state = SlotState::Immediate { value, dirty };
        self.touch(guest);
    }

    pub fn is_imm(&self, guest: GuestReg) -> bool {
        matches!(self.state(guest), SlotState::Immediate { .. })
    }

    pub fn get_imm(&self, guest: GuestReg) -> u64 {
        match self.state(guest) {
            SlotState::Immediate { value, .. } => value,
            other => panic!("{guest:?} is not an immediate ({other:?})"),
        }
    }

    /// Drop whatever the cache holds for `guest` without storing it.
    pub fn discard(&mut self, guest: GuestReg) {
        self.unpair(guest);
        self.slots[guest.index()].state = SlotState::NotLoaded;
    }

    fn store_immediate(&mut self, emit: &mut Arm64Emitter, guest: GuestReg, value: u64, scratch: Reg) {
        let offset = guest.state_offset() as i32;
        if value == 0 {
            emit.str(guest.zero_reg(), PPC_REG, IndexType::Unsigned, offset);
        } else {
            let tmp = guest.view(scratch);
            emit.movi2r(tmp, value);
            emit.str(tmp, PPC_REG, IndexType::Unsigned, offset);
        }
    }

    fn flush_slot(&mut self, emit: &mut Arm64Emitter, guest: GuestReg, mode: FlushMode, scratch: Reg) {
        match self.state(guest) {
            SlotState::NotLoaded => {}
            SlotState::Immediate { value, dirty } => {
                if dirty {
                    self.store_immediate(emit, guest, value, scratch);
                }
                if mode == FlushMode::All {
                    self.slots[guest.index()].state = SlotState::NotLoaded;
                }
            }
            SlotState::InRegister { reg, dirty } => {
                if dirty {
                    emit.str(guest.view(reg), PPC_REG, IndexType::Unsigned, guest.state_offset() as i32);
                }
                if mode == FlushMode::All {
                    self.slots[guest.index()].state = SlotState::NotLoaded;
                }
            }
            SlotState::PairedAway { sibling, .. } => {
                if mode == FlushMode::All {
                    self.slots[guest.index()].state = SlotState::NotLoaded;
                    self.slots[sibling.index()].state = SlotState::NotLoaded;
                }
            }
        }
    }

    /// Write back every dirty slot. `scratch` (default X30) materialises
    /// immediates. Locked host registers stay locked.
    pub fn flush(&mut self, emit: &mut Arm64Emitter, mode: FlushMode, scratch: Option<Reg>) {
        let scratch = scratch.unwrap_or(SCRATCH);
        for guest in GuestReg::all() {
            self.flush_slot(emit, guest, mode, scratch);
        }
    }

    /// Write back and release only the listed slots.
    pub fn store_registers(&mut self, emit: &mut Arm64Emitter, regs: &[GuestReg], scratch: Option<Reg>) {
        let scratch = scratch.unwrap_or(SCRATCH);
        for &guest in regs {
            self.flush_slot(emit, guest, FlushMode::All, scratch);
        }
    }

    /// Host registers (by number) that are bound or locked, as a set.
    pub fn used_registers(&self) -> BitSet32 {
        self.host_regs
            .iter()
            .filter(|h| h.locked || self.owner(h.reg).is_some())
            .map(|h| h.reg.num() as u32)
            .collect()
    }

    /// The subset of [`Self::used_registers`] a host call may clobber.
    pub fn caller_saved_used(&self) -> BitSet32 {
        self.used_registers()
            .iter()
            .filter(|&n| n <= LAST_CALLER_SAVED as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter() -> Arm64Emitter {
        Arm64Emitter::with_capacity(4096)
    }

    fn words(e: &Arm64Emitter, start: usize) -> Vec<u32> {
        e.buffer().words(start, e.code_ptr())
    }

    fn ldr_word(rt: Reg, offset: usize) -> u32 {
        let mut e = emitter();
        e.ldr(rt, PPC_REG, IndexType::Unsigned, offset as i32);
        words(&e, e.buffer().region_start())[0]
    }

    #[test]
    fn test_read_loads_once() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let start = e.code_ptr();
        let r3 = GuestReg::gpr(3);
        let reg = cache.r(&mut e, r3);
        assert_eq!(reg, Reg::W19);
        assert_eq!(cache.r(&mut e, r3), reg);
        assert_eq!(words(&e, start), vec![ldr_word(Reg::W19, PowerPcState::gpr_offset(3))]);
        assert!(!cache.state(r3).is_dirty());
    }

    #[test]
    fn test_cr_fields_use_x_view() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let reg = cache.r(&mut e, GuestReg::cr(2));
        assert!(reg.is_64bit());
    }

    #[test]
    fn test_flush_all_stores_dirty_only() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        cache.r(&mut e, GuestReg::gpr(1));
        cache.rw(&mut e, GuestReg::gpr(2));
        let start = e.code_ptr();
        cache.flush(&mut e, FlushMode::All, None);
        assert_eq!(words(&e, start).len(), 1);
        assert_eq!(cache.state(GuestReg::gpr(1)), SlotState::NotLoaded);
        assert_eq!(cache.state(GuestReg::gpr(2)), SlotState::NotLoaded);
        assert_eq!(cache.unlocked_register_count(), ALLOCATION_ORDER.len());
    }

    #[test]
    fn test_flush_maintain_state_keeps_bindings() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let r2 = GuestReg::gpr(2);
        let reg = cache.rw(&mut e, r2);
        cache.flush(&mut e, FlushMode::MaintainState, None);
        assert_eq!(cache.state(r2), SlotState::InRegister { reg: reg.to_64(), dirty: true });
    }

    #[test]
    fn test_bind_without_write_stays_clean() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let r4 = GuestReg::gpr(4);
        cache.bind_to_register(&mut e, r4, false, false);
        let start = e.code_ptr();
        cache.flush(&mut e, FlushMode::MaintainState, None);
        // Nothing was loaded and nothing is written back.
        assert_eq!(e.code_ptr(), start);
    }

    #[test]
    fn test_dirty_immediate_written_before_blind_bind() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let r5 = GuestReg::gpr(5);
        cache.set_immediate(r5, 0, true);
        let start = e.code_ptr();
        cache.bind_to_register(&mut e, r5, false, false);
        // STR WZR, [X29, #offset]
        let w = words(&e, start);
        assert_eq!(w.len(), 1);
        assert_eq!(w[0] & 0x1F, 31);
        assert!(!cache.state(r5).is_dirty());
    }

    #[test]
    fn test_immediate_flush_uses_scratch() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        cache.set_immediate(GuestReg::gpr(6), 0x1234, true);
        cache.set_immediate(GuestReg::gpr(7), 0x99, false);
        let start = e.code_ptr();
        cache.flush(&mut e, FlushMode::All, Some(Reg::W0));
        // MOVZ W0, #0x1234; STR W0, [X29, #off]
        assert_eq!(words(&e, start)[0], 0x52824680);
        assert_eq!(words(&e, start).len(), 2);
    }

    #[test]
    fn test_get_imm() {
        let mut cache = GprCache::new();
        let r1 = GuestReg::gpr(1);
        cache.set_immediate(r1, 0x1_0000_0005, false);
        assert!(cache.is_imm(r1));
        assert_eq!(cache.get_imm(r1), 5);
        cache.discard(r1);
        assert!(!cache.is_imm(r1));
    }

    #[test]
    fn test_eviction_prefers_stalest() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        for i in 0..ALLOCATION_ORDER.len() {
            cache.r(&mut e, GuestReg::gpr(i));
        }
        assert_eq!(cache.unlocked_register_count(), 0);
        // r0 is the stalest; pin it so r1 goes instead.
        cache.lock_guest(GuestReg::gpr(0));
        let reg = cache.r(&mut e, GuestReg::gpr(25));
        assert_eq!(cache.state(GuestReg::gpr(1)), SlotState::NotLoaded);
        assert_eq!(reg.num(), ALLOCATION_ORDER[1]);
        assert!(cache.state(GuestReg::gpr(0)).host_reg().is_some());
    }

    #[test]
    fn test_eviction_writes_back_dirty() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        cache.rw(&mut e, GuestReg::gpr(0));
        for i in 1..ALLOCATION_ORDER.len() {
            cache.r(&mut e, GuestReg::gpr(i));
        }
        let start = e.code_ptr();
        cache.r(&mut e, GuestReg::gpr(30));
        let w = words(&e, start);
        // STR W19 for r0, then the load of r30.
        assert_eq!(w.len(), 2);
        assert_eq!(w[0] & 0xFFC00000, 0xB9000000);
    }

    #[test]
    #[should_panic(expected = "register exhaustion")]
    fn test_exhaustion_panics() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        for i in 0..ALLOCATION_ORDER.len() {
            let g = GuestReg::gpr(i);
            cache.r(&mut e, g);
            cache.lock_guest(g);
        }
        cache.r(&mut e, GuestReg::gpr(31));
    }

    #[test]
    fn test_get_reg_locks_until_unlock() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let tmp = cache.get_reg(&mut e);
        assert_eq!(cache.unlocked_register_count(), ALLOCATION_ORDER.len() - 1);
        let other = cache.r(&mut e, GuestReg::gpr(0));
        assert_ne!(other.num(), tmp.num());
        cache.unlock(&[tmp]);
        assert_eq!(cache.unlocked_register_count(), ALLOCATION_ORDER.len() - 1);
    }

    #[test]
    fn test_lock_evicts_owner() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let reg = cache.rw(&mut e, GuestReg::gpr(9));
        cache.lock(&mut e, &[reg]);
        assert_eq!(cache.state(GuestReg::gpr(9)), SlotState::NotLoaded);
        assert!(cache.host_registers()[0].is_locked());
    }

    #[test]
    fn test_pair_read_and_split() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let (r4, r5) = (GuestReg::gpr(4), GuestReg::gpr(5));
        let start = e.code_ptr();
        let pair = cache.bind_pair(&mut e, r4).unwrap();
        assert_eq!(words(&e, start), vec![ldr_word(pair, PowerPcState::gpr_offset(4))]);

        // The low half reads straight from the pair.
        assert_eq!(cache.r(&mut e, r4), pair.to_32());
        // The high half gets its own register.
        let high = cache.r(&mut e, r5);
        assert_ne!(high.num(), pair.num());
        assert_eq!(cache.state(r4), SlotState::InRegister { reg: pair, dirty: false });
        assert_eq!(cache.state(r5), SlotState::InRegister { reg: high.to_64(), dirty: false });
    }

    #[test]
    fn test_write_low_half_releases_high() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let (r6, r7) = (GuestReg::gpr(6), GuestReg::gpr(7));
        let pair = cache.bind_pair(&mut e, r6).unwrap();
        let start = e.code_ptr();
        let reg = cache.rw(&mut e, r6);
        assert_eq!(reg, pair.to_32());
        assert_eq!(e.code_ptr(), start);
        assert_eq!(cache.state(r7), SlotState::NotLoaded);
        assert!(cache.state(r6).is_dirty());
    }

    #[test]
    fn test_pair_refused_when_cached() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        cache.set_immediate(GuestReg::gpr(9), 1, false);
        assert!(cache.bind_pair(&mut e, GuestReg::gpr(8)).is_none());
    }

    #[test]
    fn test_caller_saved_used() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        for i in 0..9 {
            cache.r(&mut e, GuestReg::gpr(i));
        }
        // Eight callee-saved registers first, then W6.
        assert_eq!(cache.caller_saved_used().iter().collect::<Vec<_>>(), vec![6]);
    }

    #[test]
    fn test_update_last_used() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let (r1, r2) = (GuestReg::gpr(1), GuestReg::gpr(2));
        cache.r(&mut e, r1);
        cache.r(&mut e, r2);
        cache.update_last_used(&[r1]);
        assert_eq!(cache.last_used(r1), 0);
        assert_eq!(cache.last_used(r2), 1);
    }

    #[test]
    fn test_flush_all_keeps_scratch_locked() {
        let mut e = emitter();
        let mut cache = GprCache::new();
        let tmp = cache.get_reg(&mut e);
        cache.rw(&mut e, GuestReg::gpr(3));
        cache.flush(&mut e, FlushMode::All, None);

        let again = cache.get_reg(&mut e);
        assert_ne!(tmp.num(), again.num());
        assert!(cache.host_registers().iter().any(|h| h.reg().num() == tmp.num() && h.is_locked()));
        cache.unlock(&[tmp, again]);
        assert_eq!(cache.unlocked_register_count(), 20);
    }
}
