//! Compiled block bookkeeping.
//!
//! Blocks are keyed by guest entry address. Every exit of a block is a
//! [`LinkData`] whose one-instruction patch site either branches straight to
//! the target block or to the exit's stub in far code, which hands the
//! target address to the dispatcher. The cache decides which; writing the
//! instruction is left to a [`BlockLinker`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::trace;

use super::free_ranges::RangeSizeSet;

/// Physical addresses are indexed in 32-byte granules.
pub const BLOCK_RANGE_SHIFT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Compiling,
    /// Finished and a valid link target.
    Linked,
    /// Finished, but exits are never linked to it.
    Unlinked,
    Freed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkData {
    /// Guest address the exit continues at.
    pub exit_address: u32,
    /// The patchable branch instruction.
    pub exit_ptr: usize,
    /// Far-code stub that dispatches to `exit_address`.
    pub exit_stub: usize,
    pub is_call: bool,
    pub linked: bool,
}

#[derive(Debug, Clone)]
pub struct JitBlock {
    pub effective_address: u32,
    pub normal_entry: usize,
    pub near_begin: usize,
    pub near_end: usize,
    pub far_begin: usize,
    pub far_end: usize,
    pub linked_exits: Vec<LinkData>,
    /// Guest physical addresses of every translated instruction.
    pub physical_addresses: BTreeSet<u32>,
    pub num_instructions: u32,
    pub state: BlockState,
}

impl JitBlock {
    fn new(effective_address: u32) -> Self {
        Self {
            effective_address,
            normal_entry: 0,
            near_begin: 0,
            near_end: 0,
            far_begin: 0,
            far_end: 0,
            linked_exits: Vec::new(),
            physical_addresses: BTreeSet::new(),
            num_instructions: 0,
            state: BlockState::Compiling,
        }
    }

    /// Whether any translated instruction overlaps `[start, end)`.
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        self.physical_addresses
            .range(start.saturating_sub(3)..end)
            .any(|&addr| addr.saturating_add(4) > start)
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.state, BlockState::Linked | BlockState::Unlinked)
    }
}

/// Writes link sites and destroyed-block entries into code space.
pub trait BlockLinker {
    /// Point `link` at the block entry `target`, or back at its exit stub.
    fn write_link_block(&mut self, link: &LinkData, target: Option<usize>);
    /// Make the entry of a destroyed block bounce to the dispatcher.
    fn write_destroy_block(&mut self, block: &JitBlock);
}

pub struct BlockCache {
    blocks: HashMap<u32, JitBlock>,
    /// Target address -> blocks with an exit to it.
    links_to: HashMap<u32, HashSet<u32>>,
    /// Physical granule -> blocks with an instruction in it.
    block_range_map: BTreeMap<u32, BTreeSet<u32>>,
    ranges_to_free_near: RangeSizeSet,
    ranges_to_free_far: RangeSizeSet,
    block_linking: bool,
}

impl BlockCache {
    pub fn new(block_linking: bool) -> Self {
        Self {
            blocks: HashMap::new(),
            links_to: HashMap::new(),
            block_range_map: BTreeMap::new(),
            ranges_to_free_near: RangeSizeSet::new(),
            ranges_to_free_far: RangeSizeSet::new(),
            block_linking,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_linking(&self) -> bool {
        self.block_linking
    }

    pub fn blocks(&self) -> impl Iterator<Item = &JitBlock> {
        self.blocks.values()
    }

    pub fn get_block(&self, address: u32) -> Option<&JitBlock> {
        self.blocks.get(&address)
    }

    pub fn get_block_mut(&mut self, address: u32) -> Option<&mut JitBlock> {
        self.blocks.get_mut(&address)
    }

    /// Entry of the finished block at `address`.
    pub fn entry_point(&self, address: u32) -> Option<usize> {
        self.blocks
            .get(&address)
            .filter(|block| block.is_valid())
            .map(|block| block.normal_entry)
    }

    /// Start a new block. Any old block at the same address must have been
    /// destroyed first.
    pub fn allocate_block(&mut self, address: u32) -> &mut JitBlock {
        assert!(!self.blocks.contains_key(&address), "block at {address:#010x} already exists");
        self.blocks.entry(address).or_insert_with(|| JitBlock::new(address))
    }

    /// Drop a block that failed to compile. Nothing links to it yet.
    pub fn abandon_block(&mut self, address: u32) {
        if let Some(block) = self.blocks.get(&address)
            && block.state == BlockState::Compiling
        {
            self.blocks.remove(&address);
        }
    }

    /// Publish a compiled block: index it, then link it in both
    /// directions.
    pub fn finalize_block(&mut self, address: u32, linker: &mut dyn BlockLinker) {
        let Some(block) = self.blocks.get_mut(&address) else {
            panic!("finalizing unknown block {address:#010x}");
        };
        block.state = if self.block_linking { BlockState::Linked } else { BlockState::Unlinked };

        for &phys in &block.physical_addresses {
            self.block_range_map
                .entry(phys >> BLOCK_RANGE_SHIFT)
                .or_default()
                .insert(address);
        }
        for exit in &block.linked_exits {
            self.links_to.entry(exit.exit_address).or_default().insert(address);
        }

        if self.block_linking {
            self.link_block(address, linker);
        }
    }

    /// Link the unlinked exits of `address` whose targets are linkable.
    fn link_block_exits(&mut self, address: u32, linker: &mut dyn BlockLinker) {
        let Some(block) = self.blocks.get(&address) else {
            return;
        };
        let targets: Vec<(usize, usize)> = block
            .linked_exits
            .iter()
            .enumerate()
            .filter(|(_, exit)| !exit.linked)
            .filter_map(|(i, exit)| {
                let target = self.blocks.get(&exit.exit_address)?;
                (target.state == BlockState::Linked).then_some((i, target.normal_entry))
            })
            .collect();
        let Some(block) = self.blocks.get_mut(&address) else {
            return;
        };
        for (i, entry) in targets {
            let exit = &mut block.linked_exits[i];
            linker.write_link_block(exit, Some(entry));
            exit.linked = true;
            trace!(from = format_args!("{address:#010x}"), to = format_args!("{:#010x}", exit.exit_address), "linked exit");
        }
    }

    /// Link `address`'s exits and every exit waiting for `address`.
    pub fn link_block(&mut self, address: u32, linker: &mut dyn BlockLinker) {
        self.link_block_exits(address, linker);
        let sources: Vec<u32> = self
            .links_to
            .get(&address)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for source in sources {
            if source != address {
                self.link_block_exits(source, linker);
            }
        }
    }

    /// Point every exit targeting `address` back at its stub.
    pub fn unlink_block(&mut self, address: u32, linker: &mut dyn BlockLinker) {
        let Some(sources) = self.links_to.get(&address) else {
            return;
        };
        for source in sources {
            let Some(block) = self.blocks.get_mut(source) else {
                continue;
            };
            for exit in block
                .linked_exits
                .iter_mut()
                .filter(|exit| exit.exit_address == address && exit.linked)
            {
                linker.write_link_block(exit, None);
                exit.linked = false;
            }
        }
    }

    /// Remove a block, unlinking everything that touches it and queueing
    /// its code spans for reuse.
    pub fn destroy_block(&mut self, address: u32, linker: &mut dyn BlockLinker) {
        self.unlink_block(address, linker);
        let Some(mut block) = self.blocks.remove(&address) else {
            return;
        };

        for exit in block.linked_exits.iter_mut().filter(|exit| exit.linked) {
            linker.write_link_block(exit, None);
            exit.linked = false;
        }
        linker.write_destroy_block(&block);

        for exit in &block.linked_exits {
            if let Some(set) = self.links_to.get_mut(&exit.exit_address) {
                set.remove(&address);
                if set.is_empty() {
                    self.links_to.remove(&exit.exit_address);
                }
            }
        }
        for &phys in &block.physical_addresses {
            let granule = phys >> BLOCK_RANGE_SHIFT;
            if let Some(set) = self.block_range_map.get_mut(&granule) {
                set.remove(&address);
                if set.is_empty() {
                    self.block_range_map.remove(&granule);
                }
            }
        }

        self.ranges_to_free_near.insert(block.near_begin, block.near_end);
        self.ranges_to_free_far.insert(block.far_begin, block.far_end);
        block.state = BlockState::Freed;
        trace!(address = format_args!("{address:#010x}"), "destroyed block");
    }

    /// Destroy every block with code in `[address, address + length)`.
    /// Returns the number of blocks destroyed.
    pub fn invalidate_icache(&mut self, address: u32, length: u32, linker: &mut dyn BlockLinker) -> usize {
        if length == 0 {
            return 0;
        }
        let end = address.saturating_add(length);
        let first = address.saturating_sub(3) >> BLOCK_RANGE_SHIFT;
        let last = (end - 1) >> BLOCK_RANGE_SHIFT;

        let candidates: BTreeSet<u32> = self
            .block_range_map
            .range(first..=last)
            .flat_map(|(_, set)| set.iter().copied())
            .collect();
        let doomed: Vec<u32> = candidates
            .into_iter()
            .filter(|a| self.blocks.get(a).is_some_and(|block| block.overlaps(address, end)))
            .collect();
        for &block in &doomed {
            self.destroy_block(block, linker);
        }
        doomed.len()
    }

    /// Destroy every block.
    pub fn clear(&mut self, linker: &mut dyn BlockLinker) {
        let addresses: Vec<u32> = self.blocks.keys().copied().collect();
        for address in addresses {
            self.destroy_block(address, linker);
        }
        self.links_to.clear();
        self.block_range_map.clear();
    }

    /// Near spans freed since the last call.
    pub fn take_ranges_to_free_near(&mut self) -> RangeSizeSet {
        std::mem::take(&mut self.ranges_to_free_near)
    }

    /// Far spans freed since the last call.
    pub fn take_ranges_to_free_far(&mut self) -> RangeSizeSet {
        std::mem::take(&mut self.ranges_to_free_far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingLinker {
        links: Vec<(usize, Option<usize>)>,
        destroyed: Vec<u32>,
    }

    impl BlockLinker for RecordingLinker {
        fn write_link_block(&mut self, link: &LinkData, target: Option<usize>) {
            self.links.push((link.exit_ptr, target));
        }

        fn write_destroy_block(&mut self, block: &JitBlock) {
            self.destroyed.push(block.effective_address);
        }
    }

    /// A one-instruction block at `address` exiting to `exits`, with code at
    /// `entry`.
    fn add_block(cache: &mut BlockCache, linker: &mut RecordingLinker, address: u32, entry: usize, exits: &[u32]) {
        let block = cache.allocate_block(address);
        block.normal_entry = entry;
        block.near_begin = entry;
        block.near_end = entry + 0x40;
        block.far_begin = entry + 0x1000;
        block.far_end = entry + 0x1020;
        block.physical_addresses.insert(address);
        for (i, &target) in exits.iter().enumerate() {
            block.linked_exits.push(LinkData {
                exit_address: target,
                exit_ptr: entry + 0x10 + i * 4,
                exit_stub: entry + 0x1000 + i * 8,
                is_call: false,
                linked: false,
            });
        }
        cache.finalize_block(address, linker);
    }

    #[test]
    fn test_links_both_directions() {
        let mut cache = BlockCache::new(true);
        let mut linker = RecordingLinker::default();
        add_block(&mut cache, &mut linker, 0x100, 0x10000, &[0x200]);
        // The target is not compiled yet.
        assert!(linker.links.is_empty());

        add_block(&mut cache, &mut linker, 0x200, 0x20000, &[0x100]);
        // 0x200 -> 0x100 links at once, then the waiting 0x100 -> 0x200.
        assert_eq!(linker.links, vec![(0x20010, Some(0x10000)), (0x10010, Some(0x20000))]);
        assert!(cache.get_block(0x100).unwrap().linked_exits[0].linked);
    }

    #[test]
    fn test_self_loop_links_once() {
        let mut cache = BlockCache::new(true);
        let mut linker = RecordingLinker::default();
        add_block(&mut cache, &mut linker, 0x100, 0x10000, &[0x100]);
        assert_eq!(linker.links, vec![(0x10010, Some(0x10000))]);
    }

    #[test]
    fn test_abandon_only_drops_compiling_blocks() {
        let mut cache = BlockCache::new(true);
        let mut linker = RecordingLinker::default();
        cache.allocate_block(0x300);
        assert_eq!(cache.get_block(0x300).unwrap().state, BlockState::Compiling);
        assert_eq!(cache.entry_point(0x300), None);
        cache.abandon_block(0x300);
        assert!(cache.get_block(0x300).is_none());

        // A waiting exit is not linked to a block that never finished.
        add_block(&mut cache, &mut linker, 0x100, 0x10000, &[0x300]);
        cache.allocate_block(0x300);
        cache.abandon_block(0x300);
        assert!(linker.links.is_empty());

        cache.abandon_block(0x100);
        assert_eq!(cache.get_block(0x100).unwrap().state, BlockState::Linked);
    }

    #[test]
    fn test_linking_disabled() {
        let mut cache = BlockCache::new(false);
        let mut linker = RecordingLinker::default();
        add_block(&mut cache, &mut linker, 0x100, 0x10000, &[0x200]);
        add_block(&mut cache, &mut linker, 0x200, 0x20000, &[0x100]);
        assert!(linker.links.is_empty());
        assert_eq!(cache.get_block(0x100).unwrap().state, BlockState::Unlinked);
        assert_eq!(cache.entry_point(0x100), Some(0x10000));
    }

    #[test]
    fn test_invalidate_unlinks_and_frees() {
        let mut cache = BlockCache::new(true);
        let mut linker = RecordingLinker::default();
        add_block(&mut cache, &mut linker, 0x100, 0x10000, &[0x200]);
        add_block(&mut cache, &mut linker, 0x200, 0x20000, &[0x100]);
        linker.links.clear();

        assert_eq!(cache.invalidate_icache(0x200, 4, &mut linker), 1);
        assert!(cache.get_block(0x200).is_none());
        assert_eq!(cache.entry_point(0x200), None);
        // The incoming exit from 0x100 and the block's own exit both go back
        // to their stubs.
        assert_eq!(linker.links, vec![(0x10010, None), (0x20010, None)]);
        assert_eq!(linker.destroyed, vec![0x200]);
        assert!(!cache.get_block(0x100).unwrap().linked_exits[0].linked);

        let near = cache.take_ranges_to_free_near();
        assert_eq!(near.iter().collect::<Vec<_>>(), vec![(0x20000, 0x20040)]);
        assert!(cache.take_ranges_to_free_near().is_empty());

        // Recompiling relinks the waiting exit.
        linker.links.clear();
        add_block(&mut cache, &mut linker, 0x200, 0x30000, &[]);
        assert_eq!(linker.links, vec![(0x10010, Some(0x30000))]);
    }

    #[test]
    fn test_invalidate_misses_neighbours() {
        let mut cache = BlockCache::new(true);
        let mut linker = RecordingLinker::default();
        add_block(&mut cache, &mut linker, 0x100, 0x10000, &[]);
        add_block(&mut cache, &mut linker, 0x108, 0x20000, &[]);
        // Same 32-byte granule, different instructions.
        assert_eq!(cache.invalidate_icache(0x104, 4, &mut linker), 0);
        // A write straddling into the instruction counts.
        assert_eq!(cache.invalidate_icache(0x106, 4, &mut linker), 1);
        assert!(cache.get_block(0x100).is_some());
    }

    #[test]
    fn test_clear_destroys_all() {
        let mut cache = BlockCache::new(true);
        let mut linker = RecordingLinker::default();
        add_block(&mut cache, &mut linker, 0x100, 0x10000, &[0x200]);
        add_block(&mut cache, &mut linker, 0x200, 0x20000, &[]);
        cache.clear(&mut linker);
        assert!(cache.is_empty());
        assert_eq!(linker.destroyed.len(), 2);
        assert_eq!(cache.take_ranges_to_free_far().len(), 2);
    }
}
