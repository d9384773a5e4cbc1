mod common;

use common::fixtures::{null_callbacks, small_config};
use common::{Cpu, NOP};
use ppcjit::jit::aarch64::{Arm64Emitter, Cond, Reg, branch_target};
use ppcjit::jit::backpatch::AccessFlags;
use ppcjit::jit::bitset::BitSet32;
use ppcjit::jit::mmio::{MmioMapping, MmioReadCodeGenerator, ReadHandler, ReadHandlingMethodVisitor};
use ppcjit::jit::regcache::GuestReg;
use ppcjit::jit::{AccessAddress, BlockBuilder, Jit, JitError, Translator};

#[test]
fn add_x0_x1_x2_fields() {
    let mut emit = Arm64Emitter::with_capacity(16);
    let start = emit.code_ptr();
    emit.add(Reg::X0, Reg::X1, Reg::X2);
    let word = emit.buffer().read_u32(start);

    assert_eq!(word >> 31, 1, "sf");
    assert_eq!(word & 0x7F20_0000, 0x0B00_0000, "ADD (shifted register)");
    assert_eq!((word >> 16) & 0x1F, 2, "Rm");
    assert_eq!((word >> 5) & 0x1F, 1, "Rn");
    assert_eq!(word & 0x1F, 0, "Rd");
}

#[test]
fn forward_conditional_branch_40_bytes() {
    let mut emit = Arm64Emitter::with_capacity(128);
    let site = emit.code_ptr();
    let fixup = emit.fixup_b_cond(Cond::Eq);
    for _ in 0..9 {
        emit.nop();
    }
    emit.set_jump_target(fixup);

    let word = emit.buffer().read_u32(site);
    let imm19 = ((word >> 5) & 0x7FFFF) as i32;
    let displacement = (imm19 << 13) >> 13;
    assert_eq!(displacement * 4, 40);
    assert_eq!(branch_target(word, site), Some(site + 40));
    assert!(emit.buffer().words(site + 4, site + 40).iter().all(|&w| w == NOP));
}

#[derive(Default)]
struct CountingVisitor {
    nop: usize,
    constant: Vec<u32>,
    direct: usize,
    complex: usize,
}

impl ReadHandlingMethodVisitor for CountingVisitor {
    fn visit_nop(&mut self) {
        self.nop += 1;
    }
    fn visit_constant(&mut self, value: u32) {
        self.constant.push(value);
    }
    fn visit_direct(&mut self, _ptr: usize, _mask: u32) {
        self.direct += 1;
    }
    fn visit_complex(&mut self, _func: usize, _ctx: usize) {
        self.complex += 1;
    }
}

#[test]
fn mmio_constant_load_visits_once_and_extends() {
    let mut mapping = MmioMapping::new();
    mapping.register_read(0xCC00_2000, 16, ReadHandler::Constant(0x1234_8001));

    let handler = mapping.read_handler(0xCC00_2000, 16).unwrap();
    let mut counter = CountingVisitor::default();
    handler.visit(&mut counter);
    assert_eq!(counter.constant, vec![0x1234_8001]);
    assert_eq!(counter.nop + counter.direct + counter.complex, 0);

    // Sign-extending halfword load of the constant.
    let mut cpu = Cpu::default();
    common::run_emitted(&mut cpu, |e| {
        let mut generator = MmioReadCodeGenerator::new(e, BitSet32::new(), BitSet32::new(), Reg::W9, 16, true, 0xCC00_2000);
        handler.visit(&mut generator);
    });
    assert_eq!(cpu.x[9], 0xFFFF_8001);

    // Zero-extending byte load.
    let mut cpu = Cpu::default();
    common::run_emitted(&mut cpu, |e| {
        let mut generator = MmioReadCodeGenerator::new(e, BitSet32::new(), BitSet32::new(), Reg::W9, 8, false, 0xCC00_2000);
        ReadHandler::Constant(0x1234_8081).visit(&mut generator);
    });
    assert_eq!(cpu.x[9], 0x81);
}

/// One 16-bit load of a constant address into r3.
struct ConstLoad(u32);

impl Translator for ConstLoad {
    fn translate(&mut self, block: &mut BlockBuilder<'_>, address: u32) -> Result<(), JitError> {
        block.begin_instruction(address, 1);
        let dst = block.gpr.bind_to_register(block.near, GuestReg::gpr(3), false, true);
        block.memory_access(
            AccessFlags::LOAD | AccessFlags::SIZE_16 | AccessFlags::EXTEND,
            dst,
            AccessAddress::Const(self.0),
        );
        Ok(())
    }
}

#[test]
fn mmio_constant_load_bypasses_fast_and_slow_paths() {
    let mut jit = Jit::new(small_config(true), null_callbacks()).unwrap();
    jit.mmio_mut().register_read(0xCC00_2000, 16, ReadHandler::Constant(0x8001));

    jit.jit(0x8000_0000, &mut ConstLoad(0xCC00_2000)).unwrap();
    let mmio_block = jit.blocks().get_block(0x8000_0000).unwrap();
    let mmio_far = mmio_block.far_end - mmio_block.far_begin;
    assert!(jit.backpatcher().faults().is_empty());

    // The same load from an unmapped, non-MMIO address gets a fault entry
    // and a slow path in far code.
    jit.jit(0x8000_1000, &mut ConstLoad(0xCC00_3000)).unwrap();
    let plain = jit.blocks().get_block(0x8000_1000).unwrap();
    assert_eq!(jit.backpatcher().faults().len(), 1);
    assert!(plain.far_end - plain.far_begin > mmio_far);
}

#[test]
fn known_ram_constant_access_is_fast_only() {
    let mut jit = Jit::new(small_config(true), null_callbacks()).unwrap();
    jit.map_ram(0, 0x10_0000).unwrap();
    jit.jit(0x8000_0000, &mut ConstLoad(0x100)).unwrap();
    assert!(jit.backpatcher().faults().is_empty());
    assert!(jit.ram_ptr(0x100).is_some());
}
