//! Optimal spill code placement.
//!
//! Region splitting has to decide, for every edge bundle, whether a register should be in a
//! physical register or on the stack when crossing the bundle. The decision is modelled as a
//! Hopfield network: every bundle is a node with a value of -1 (stack), 0 or +1 (register).
//! Blocks where the register is live contribute biases to the bundles on their borders, and
//! blocks the register is live through link their ingoing and outgoing bundles, with a weight
//! equal to the block frequency. Nodes are updated until no value changes.
//!
//! Only bundles touched by a constraint or a link are active; the rest of the graph is ignored.

use crate::block_frequency::BlockFrequencyInfo;
use crate::entity::EntityRef;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use crate::regalloc::edge_bundles::EdgeBundles;
use smallvec::SmallVec;

/// What a block wants at one of its borders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BorderConstraint {
    /// No preference.
    DontCare,
    /// The register should be in a register here.
    PrefReg,
    /// The register should be on the stack here.
    PrefSpill,
    /// Either works, the value is live but unconstrained.
    PrefBoth,
    /// The register must be on the stack here.
    MustSpill,
}

/// The constraints of a block the register is live in.
#[derive(Clone, Copy, Debug)]
pub struct BlockConstraint {
    /// The block.
    pub block: Block,
    /// Constraint on the ingoing bundle.
    pub entry: BorderConstraint,
    /// Constraint on the outgoing bundle.
    pub exit: BorderConstraint,
    /// The block redefines the value, so live-in and live-out need not agree.
    pub changes_value: bool,
}

#[derive(Clone, Default)]
struct Node {
    bias_n: u64,
    bias_p: u64,
    value: i8,
    sum_link_weights: u64,
    links: SmallVec<[(u64, u32); 4]>,
}

impl Node {
    fn prefer_reg(&self) -> bool {
        self.value > 0
    }

    fn must_spill(&self) -> bool {
        self.bias_n >= self.bias_p.saturating_add(self.sum_link_weights)
    }

    fn clear(&mut self, threshold: u64) {
        self.bias_n = 0;
        self.bias_p = 0;
        self.value = 0;
        self.sum_link_weights = threshold;
        self.links.clear();
    }

    fn add_link(&mut self, bundle: u32, weight: u64) {
        self.sum_link_weights = self.sum_link_weights.saturating_add(weight);
        for link in &mut self.links {
            if link.1 == bundle {
                link.0 = link.0.saturating_add(weight);
                return;
            }
        }
        self.links.push((weight, bundle));
    }

    fn add_bias(&mut self, freq: u64, direction: BorderConstraint) {
        match direction {
            BorderConstraint::PrefReg => self.bias_p = self.bias_p.saturating_add(freq),
            BorderConstraint::PrefSpill => self.bias_n = self.bias_n.saturating_add(freq),
            BorderConstraint::MustSpill => self.bias_n = u64::MAX,
            BorderConstraint::DontCare | BorderConstraint::PrefBoth => {}
        }
    }
}

/// The spill placement network.
#[derive(Default)]
pub struct SpillPlacement {
    bundles: EdgeBundles,
    nodes: Vec<Node>,
    active: Vec<bool>,
    todo: Vec<u32>,
    in_todo: Vec<bool>,
    recent_positive: Vec<u32>,
    block_freqs: Vec<u64>,
    entry_freq: u64,
    threshold: u64,
}

impl SpillPlacement {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the bundles of `func` and record its block frequencies.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph, freqs: &BlockFrequencyInfo) {
        self.bundles.compute(func, cfg);
        let n = self.bundles.num_bundles();
        self.nodes = vec![Node::default(); n];
        self.active = vec![false; n];
        self.in_todo = vec![false; n];
        self.todo.clear();
        self.recent_positive.clear();
        self.block_freqs = vec![0; func.blocks.len()];
        for block in func.layout.blocks() {
            self.block_freqs[block.index()] = freqs.block_freq(block);
        }
        self.entry_freq = freqs.entry_freq();
        // The dead zone around 0 scales with the entry frequency.
        self.threshold = (self.entry_freq >> 13).max(1);
    }

    /// The edge bundles of the function.
    pub fn bundles(&self) -> &EdgeBundles {
        &self.bundles
    }

    /// The frequency of `block`.
    pub fn block_frequency(&self, block: Block) -> u64 {
        self.block_freqs[block.index()]
    }

    /// Start a new placement problem.
    pub fn prepare(&mut self) {
        self.recent_positive.clear();
        self.todo.clear();
        self.in_todo.iter_mut().for_each(|b| *b = false);
        self.active.iter_mut().for_each(|b| *b = false);
    }

    fn activate(&mut self, n: usize) {
        if !self.in_todo[n] {
            self.in_todo[n] = true;
            self.todo.push(n as u32);
        }
        if self.active[n] {
            return;
        }
        self.active[n] = true;
        self.nodes[n].clear(self.threshold);
        // Huge bundles come from big switches. Make them reluctant to expand the region.
        if self.bundles.blocks(n).len() > 100 {
            self.nodes[n].bias_p = 0;
            self.nodes[n].bias_n = self.entry_freq / 16;
        }
    }

    /// Add the border constraints of the blocks the register is live in.
    pub fn add_constraints(&mut self, live_blocks: &[BlockConstraint]) {
        for lb in live_blocks {
            let freq = self.block_frequency(lb.block);
            if lb.entry != BorderConstraint::DontCare {
                let ib = self.bundles.bundle(lb.block, false);
                self.activate(ib);
                self.nodes[ib].add_bias(freq, lb.entry);
            }
            if lb.exit != BorderConstraint::DontCare {
                let ob = self.bundles.bundle(lb.block, true);
                self.activate(ob);
                self.nodes[ob].add_bias(freq, lb.exit);
            }
        }
    }

    /// Prefer the stack on both borders of `blocks`, twice as much when `strong`.
    pub fn add_pref_spill(&mut self, blocks: &[Block], strong: bool) {
        for &block in blocks {
            let mut freq = self.block_frequency(block);
            if strong {
                freq = freq.saturating_add(freq);
            }
            let ib = self.bundles.bundle(block, false);
            let ob = self.bundles.bundle(block, true);
            self.activate(ib);
            self.activate(ob);
            self.nodes[ib].add_bias(freq, BorderConstraint::PrefSpill);
            self.nodes[ob].add_bias(freq, BorderConstraint::PrefSpill);
        }
    }

    /// Link the bundles on both sides of each live-through block in `blocks`.
    pub fn add_links(&mut self, blocks: &[Block]) {
        for &block in blocks {
            let ib = self.bundles.bundle(block, false);
            let ob = self.bundles.bundle(block, true);
            if ib == ob {
                continue;
            }
            self.activate(ib);
            self.activate(ob);
            let freq = self.block_frequency(block);
            self.nodes[ib].add_link(ob as u32, freq);
            self.nodes[ob].add_link(ib as u32, freq);
        }
    }

    fn update(&mut self, n: usize) -> bool {
        let node = &self.nodes[n];
        let mut sum_n = node.bias_n;
        let mut sum_p = node.bias_p;
        for &(w, other) in &node.links {
            match self.nodes[other as usize].value {
                -1 => sum_n = sum_n.saturating_add(w),
                1 => sum_p = sum_p.saturating_add(w),
                _ => {}
            }
        }
        let before = node.prefer_reg();
        let value = if sum_n >= sum_p.saturating_add(self.threshold) {
            -1
        } else if sum_p >= sum_n.saturating_add(self.threshold) {
            1
        } else {
            0
        };
        self.nodes[n].value = value;
        if before == self.nodes[n].prefer_reg() {
            return false;
        }
        // Neighbours with a different value may change now.
        for i in 0..self.nodes[n].links.len() {
            let other = self.nodes[n].links[i].1 as usize;
            if self.nodes[other].value != value && !self.in_todo[other] {
                self.in_todo[other] = true;
                self.todo.push(other as u32);
            }
        }
        true
    }

    /// Update every active node once. Returns true if any node now prefers a register; those
    /// are reported by `recent_positive`.
    pub fn scan_active_bundles(&mut self) -> bool {
        self.recent_positive.clear();
        for n in 0..self.active.len() {
            if !self.active[n] {
                continue;
            }
            self.update(n);
            if self.nodes[n].must_spill() {
                continue;
            }
            if self.nodes[n].prefer_reg() {
                self.recent_positive.push(n as u32);
            }
        }
        !self.recent_positive.is_empty()
    }

    /// Propagate changes until the network is stable.
    pub fn iterate(&mut self) {
        self.recent_positive.clear();
        while let Some(n) = self.todo.pop() {
            let n = n as usize;
            self.in_todo[n] = false;
            if !self.update(n) {
                continue;
            }
            if self.nodes[n].prefer_reg() {
                self.recent_positive.push(n as u32);
            }
        }
    }

    /// Bundles that switched to preferring a register in the last scan or iteration.
    pub fn recent_positive(&self) -> &[u32] {
        &self.recent_positive
    }

    /// Write the bundles preferring a register to `live_bundles`. Returns true if every active
    /// bundle got a register.
    pub fn finish(&mut self, live_bundles: &mut Vec<bool>) -> bool {
        live_bundles.clear();
        live_bundles.resize(self.active.len(), false);
        let mut perfect = true;
        for n in 0..self.active.len() {
            if !self.active[n] {
                continue;
            }
            if self.nodes[n].prefer_reg() {
                live_bundles[n] = true;
            } else {
                perfect = false;
            }
        }
        self.todo.clear();
        self.in_todo.iter_mut().for_each(|b| *b = false);
        perfect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::{InstData, Reg};
    use crate::isa::generic;
    use crate::loop_analysis::LoopAnalysis;

    // b0 -> b1 -> b2 -> b3, with b1/b2 in a loop when `looped`.
    fn setup(looped: bool) -> (Function, [Block; 4], SpillPlacement) {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let c = func.new_vreg(isa.gpr_class());
        let b: [Block; 4] = core::array::from_fn(|_| func.append_block());
        func.append_inst(b[0], InstData::iconst(c, 1));
        func.append_inst(b[0], InstData::jump(b[1]));
        func.append_inst(b[1], InstData::jump(b[2]));
        if looped {
            func.append_inst(b[2], InstData::brif(c, b[1], b[3]));
        } else {
            func.append_inst(b[2], InstData::jump(b[3]));
        }
        func.append_inst(b[3], InstData::ret([Reg::Virt(c)]));
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let mut loops = LoopAnalysis::new();
        loops.compute(&func, &cfg, &domtree);
        let mut freqs = BlockFrequencyInfo::new();
        freqs.compute(&func, &cfg, &domtree, &loops);
        let mut sp = SpillPlacement::new();
        sp.compute(&func, &cfg, &freqs);
        (func, b, sp)
    }

    fn constraint(
        block: Block,
        entry: BorderConstraint,
        exit: BorderConstraint,
    ) -> BlockConstraint {
        BlockConstraint {
            block,
            entry,
            exit,
            changes_value: false,
        }
    }

    #[test]
    fn register_preference_spreads_through_links() {
        let (_func, b, mut sp) = setup(false);
        sp.prepare();
        sp.add_constraints(&[
            constraint(b[0], BorderConstraint::DontCare, BorderConstraint::PrefReg),
            constraint(b[3], BorderConstraint::PrefReg, BorderConstraint::DontCare),
        ]);
        sp.add_links(&[b[1], b[2]]);
        sp.scan_active_bundles();
        sp.iterate();
        let mut live = Vec::new();
        assert!(sp.finish(&mut live));
        let bundles = sp.bundles();
        assert!(live[bundles.bundle(b[1], false)]);
        assert!(live[bundles.bundle(b[2], true)]);
    }

    #[test]
    fn must_spill_wins() {
        let (_func, b, mut sp) = setup(false);
        sp.prepare();
        sp.add_constraints(&[
            constraint(b[0], BorderConstraint::DontCare, BorderConstraint::PrefReg),
            constraint(b[2], BorderConstraint::MustSpill, BorderConstraint::DontCare),
        ]);
        sp.add_links(&[b[1]]);
        sp.scan_active_bundles();
        sp.iterate();
        let mut live = Vec::new();
        assert!(!sp.finish(&mut live));
        assert!(!live[sp.bundles().bundle(b[2], false)]);
    }

    #[test]
    fn hot_loop_prefers_spill_outside() {
        let (_func, b, mut sp) = setup(true);
        sp.prepare();
        // Used in the loop, spill pressure outside it.
        sp.add_constraints(&[
            constraint(b[1], BorderConstraint::PrefReg, BorderConstraint::PrefReg),
            constraint(b[2], BorderConstraint::PrefReg, BorderConstraint::PrefReg),
        ]);
        sp.add_pref_spill(&[b[0]], true);
        sp.scan_active_bundles();
        sp.iterate();
        let mut live = Vec::new();
        sp.finish(&mut live);
        // The loop bundle stays in a register.
        assert!(live[sp.bundles().bundle(b[2], false)]);
        assert!(!live[sp.bundles().bundle(b[0], false)]);
    }
}
