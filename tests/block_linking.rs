mod common;

use std::collections::HashMap;

use common::fixtures::{null_callbacks, small_config};
use ppcjit::config::JitConfig;
use ppcjit::jit::aarch64::branch_target;
use ppcjit::jit::block_cache::BlockState;
use ppcjit::jit::{BlockBuilder, Jit, JitError, Translator};

/// Every block is one instruction followed by a jump to `edges[address]`.
struct Graph {
    edges: HashMap<u32, u32>,
}

impl Graph {
    fn new(edges: &[(u32, u32)]) -> Self {
        Self { edges: edges.iter().copied().collect() }
    }
}

impl Translator for Graph {
    fn translate(&mut self, block: &mut BlockBuilder<'_>, address: u32) -> Result<(), JitError> {
        block.begin_instruction(address, 2);
        match self.edges.get(&address) {
            Some(&target) => {
                block.write_exit(target, false);
                Ok(())
            }
            None => Err(JitError::Translation { address, message: "no such block".to_string() }),
        }
    }
}

fn exit_target(jit: &Jit, block: u32) -> usize {
    let exit = jit.blocks().get_block(block).unwrap().linked_exits[0];
    branch_target(jit.code().read_u32(exit.exit_ptr), exit.exit_ptr).unwrap()
}

fn stub(jit: &Jit, block: u32) -> usize {
    jit.blocks().get_block(block).unwrap().linked_exits[0].exit_stub
}

#[test]
fn chain_links_as_blocks_appear() {
    let mut jit = Jit::new(small_config(false), null_callbacks()).unwrap();
    let mut graph = Graph::new(&[(0x100, 0x200), (0x200, 0x300), (0x300, 0x100)]);

    let a = jit.jit(0x100, &mut graph).unwrap();
    assert_eq!(exit_target(&jit, 0x100), stub(&jit, 0x100));

    let b = jit.jit(0x200, &mut graph).unwrap();
    assert_eq!(exit_target(&jit, 0x100), b);
    assert_eq!(exit_target(&jit, 0x200), stub(&jit, 0x200));

    let c = jit.jit(0x300, &mut graph).unwrap();
    assert_eq!(exit_target(&jit, 0x200), c);
    // The back edge to the first block links immediately.
    assert_eq!(exit_target(&jit, 0x300), a);
}

#[test]
fn invalidating_middle_block_unlinks_only_its_callers() {
    let mut jit = Jit::new(small_config(false), null_callbacks()).unwrap();
    let mut graph = Graph::new(&[(0x100, 0x200), (0x200, 0x300), (0x300, 0x300)]);
    for address in [0x100, 0x200, 0x300] {
        jit.jit(address, &mut graph).unwrap();
    }
    let c = jit.blocks().entry_point(0x300).unwrap();

    assert_eq!(jit.invalidate_icache(0x200, 4).unwrap(), 1);
    assert!(jit.blocks().get_block(0x200).is_none());
    assert_eq!(exit_target(&jit, 0x100), stub(&jit, 0x100));
    assert_eq!(exit_target(&jit, 0x300), c);
    assert_eq!(jit.blocks().get_block(0x100).unwrap().state, BlockState::Linked);

    // Recompiling relinks the caller.
    let b = jit.jit(0x200, &mut graph).unwrap();
    assert_eq!(exit_target(&jit, 0x100), b);
}

#[test]
fn linking_disabled_keeps_stub_exits() {
    let config = JitConfig { block_linking: false, ..small_config(false) };
    let mut jit = Jit::new(config, null_callbacks()).unwrap();
    let mut graph = Graph::new(&[(0x100, 0x200), (0x200, 0x100)]);
    jit.jit(0x100, &mut graph).unwrap();
    jit.jit(0x200, &mut graph).unwrap();
    assert_eq!(exit_target(&jit, 0x100), stub(&jit, 0x100));
    assert_eq!(exit_target(&jit, 0x200), stub(&jit, 0x200));
    assert_eq!(jit.blocks().get_block(0x100).unwrap().state, BlockState::Unlinked);
}

#[test]
fn invalidation_range_covers_partial_overlap() {
    struct Long;
    impl Translator for Long {
        fn translate(&mut self, block: &mut BlockBuilder<'_>, address: u32) -> Result<(), JitError> {
            for i in 0..8 {
                block.begin_instruction(address + i * 4, 1);
            }
            Ok(())
        }
    }
    let mut jit = Jit::new(small_config(false), null_callbacks()).unwrap();
    jit.jit(0x1000, &mut Long).unwrap();
    jit.jit(0x2000, &mut Long).unwrap();

    // Last instruction of the first block only.
    assert_eq!(jit.invalidate_icache(0x101C, 4).unwrap(), 1);
    assert!(jit.blocks().get_block(0x1000).is_none());
    assert!(jit.blocks().get_block(0x2000).is_some());
    assert_eq!(jit.invalidate_icache(0x3000, 0x100).unwrap(), 0);
}

#[test]
fn clear_cache_restores_all_free_space() {
    let mut jit = Jit::new(small_config(false), null_callbacks()).unwrap();
    let near_free = jit.free_near().total_size();
    let far_free = jit.free_far().total_size();
    let routines = *jit.routines();

    let mut graph = Graph::new(&[(0x100, 0x200), (0x200, 0x100)]);
    jit.jit(0x100, &mut graph).unwrap();
    jit.jit(0x200, &mut graph).unwrap();
    assert!(jit.free_near().total_size() < near_free);

    jit.clear_cache().unwrap();
    assert!(jit.blocks().is_empty());
    assert_eq!(jit.free_near().total_size(), near_free);
    assert_eq!(jit.free_far().total_size(), far_free);
    assert_eq!(*jit.routines(), routines);
}
