//! Static block frequency estimates.
//!
//! Frequencies are fixed-point `u64` numbers relative to `ENTRY_FREQ`, the frequency of the entry
//! block. Without profile data we assume that every branch is taken with equal probability and
//! that every loop iterates `LOOP_SCALE` times.

use crate::dominator_tree::DominatorTree;
use crate::entity::SecondaryMap;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use crate::loop_analysis::LoopAnalysis;
use crate::timing::{self, Pass};

/// Frequency of the entry block.
pub const ENTRY_FREQ: u64 = 1 << 16;

/// Assumed trip count of every loop.
pub const LOOP_SCALE: u64 = 8;

/// Estimated execution frequencies of the blocks in a function.
pub struct BlockFrequencyInfo {
    freqs: SecondaryMap<Block, u64>,
    valid: bool,
}

impl BlockFrequencyInfo {
    /// Create an empty analysis.
    pub fn new() -> Self {
        Self {
            freqs: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Clear all frequencies.
    pub fn clear(&mut self) {
        self.freqs.clear();
        self.valid = false;
    }

    /// Has `compute` been called since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Compute block frequencies.
    ///
    /// Blocks are visited in reverse post-order so every forward predecessor is done before its
    /// successors. Back edges are ignored; instead loop headers are scaled up by `LOOP_SCALE`,
    /// and edges leaving loops are scaled back down once per loop exited.
    pub fn compute(
        &mut self,
        func: &Function,
        cfg: &ControlFlowGraph,
        domtree: &DominatorTree,
        loops: &LoopAnalysis,
    ) {
        let _tt = timing::start(Pass::BlockFrequency);
        self.freqs.clear();
        self.freqs.resize(func.blocks.len());
        let entry = match func.layout.entry_block() {
            Some(entry) => entry,
            None => return,
        };

        for block in domtree.rpo() {
            let mut freq = if block == entry { ENTRY_FREQ } else { 0 };
            for pred in cfg.pred_iter(block) {
                if !domtree.is_reachable(pred.block) || domtree.dominates(block, pred.block) {
                    continue;
                }
                freq = freq.saturating_add(self.edge_freq(cfg, loops, pred.block, block));
            }
            if loops.is_loop_header(block).is_some() {
                freq = freq.saturating_mul(LOOP_SCALE);
            }
            self.freqs[block] = freq.max(1);
        }
        self.valid = true;
    }

    /// The estimated frequency of the edge `from -> to`.
    pub fn edge_freq(
        &self,
        cfg: &ControlFlowGraph,
        loops: &LoopAnalysis,
        from: Block,
        to: Block,
    ) -> u64 {
        let succs = cfg.num_succs(from).max(1) as u64;
        let mut freq = self.freqs[from] / succs;
        for _ in 0..loops.loops_exited(from, to) {
            freq /= LOOP_SCALE;
        }
        freq.max(1)
    }

    /// The estimated frequency of `block`. Unreachable blocks have frequency 0.
    pub fn block_freq(&self, block: Block) -> u64 {
        self.freqs[block]
    }

    /// The frequency of the entry block.
    pub fn entry_freq(&self) -> u64 {
        ENTRY_FREQ
    }

    /// The frequency of `block` relative to the entry block.
    pub fn relative_freq(&self, block: Block) -> f32 {
        self.freqs[block] as f32 / ENTRY_FREQ as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstData, Reg, RegClass};

    fn analyze(func: &Function) -> BlockFrequencyInfo {
        let cfg = ControlFlowGraph::with_function(func);
        let domtree = DominatorTree::with_function(func, &cfg);
        let mut loops = LoopAnalysis::new();
        loops.compute(func, &cfg, &domtree);
        let mut bfi = BlockFrequencyInfo::new();
        bfi.compute(func, &cfg, &domtree, &loops);
        bfi
    }

    #[test]
    fn diamond_splits_evenly() {
        let mut func = Function::with_name("diamond");
        let c = func.new_vreg(RegClass::from_u32(0));
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        let b3 = func.append_block();
        func.append_inst(b0, InstData::iconst(c, 0));
        func.append_inst(b0, InstData::brif(Reg::Virt(c), b1, b2));
        func.append_inst(b1, InstData::jump(b3));
        func.append_inst(b2, InstData::jump(b3));
        func.append_inst(b3, InstData::ret([]));

        let bfi = analyze(&func);
        assert_eq!(bfi.block_freq(b0), ENTRY_FREQ);
        assert_eq!(bfi.block_freq(b1), ENTRY_FREQ / 2);
        assert_eq!(bfi.block_freq(b2), ENTRY_FREQ / 2);
        assert_eq!(bfi.block_freq(b3), ENTRY_FREQ);
    }

    #[test]
    fn loops_are_hot() {
        let mut func = Function::with_name("loop");
        let c = func.new_vreg(RegClass::from_u32(0));
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        func.append_inst(b0, InstData::iconst(c, 0));
        func.append_inst(b0, InstData::jump(b1));
        func.append_inst(b1, InstData::brif(Reg::Virt(c), b1, b2));
        func.append_inst(b2, InstData::ret([]));

        let bfi = analyze(&func);
        assert_eq!(bfi.block_freq(b1), ENTRY_FREQ * LOOP_SCALE);
        // Half the header frequency leaves the loop, scaled back down.
        assert_eq!(bfi.block_freq(b2), ENTRY_FREQ / 2);
        assert_eq!(bfi.relative_freq(b1), 8.0);
    }
}
