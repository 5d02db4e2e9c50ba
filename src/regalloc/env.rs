//! The state of one allocation run.
//!
//! The spiller, the split editor and the greedy driver all edit the same function, intervals,
//! matrix and assignment map. `RegAllocEnv` bundles mutable borrows of them so they can be
//! passed around as one value, and provides the instruction edits that keep every holder of
//! slot indexes consistent.

use crate::block_frequency::BlockFrequencyInfo;
use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst, InstData, VirtReg};
use crate::isa::TargetIsa;
use crate::loop_analysis::LoopAnalysis;
use crate::regalloc::greedy::RegAllocStats;
use crate::regalloc::live_intervals::LiveIntervals;
use crate::regalloc::live_stacks::LiveStacks;
use crate::regalloc::reg_matrix::LiveRegMatrix;
use crate::regalloc::slot_indexes::SlotIndex;
use crate::regalloc::spill_weights::VirtRegAuxInfo;
use crate::regalloc::virt_reg_map::VirtRegMap;
use crate::settings::Flags;
use crate::trace;

/// Build a `FuncView` from the fields of a `RegAllocEnv`, borrowing only the function.
///
/// This leaves the other fields free to be borrowed mutably in the same expression.
#[macro_export]
macro_rules! fview {
    ($env:expr) => {
        $crate::regalloc::live_intervals::FuncView {
            func: &*$env.func,
            isa: $env.isa,
            cfg: $env.cfg,
            domtree: $env.domtree,
        }
    };
}

/// Where to insert an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertPos {
    /// Immediately before an instruction.
    Before(Inst),
    /// Immediately after an instruction.
    After(Inst),
    /// At the top of a block.
    Top(Block),
    /// At the end of a block, before its last split point.
    End(Block),
}

/// Everything an allocation run reads and edits.
pub struct RegAllocEnv<'a> {
    /// The function being allocated.
    pub func: &'a mut Function,
    /// The target.
    pub isa: &'a dyn TargetIsa,
    /// Allocator settings.
    pub flags: &'a Flags,
    /// The control flow graph. The allocator never changes it.
    pub cfg: &'a ControlFlowGraph,
    /// The dominator tree.
    pub domtree: &'a DominatorTree,
    /// The loop forest.
    pub loops: &'a LoopAnalysis,
    /// Block frequencies.
    pub freqs: &'a BlockFrequencyInfo,
    /// Live intervals and the program point index.
    pub lis: &'a mut LiveIntervals,
    /// Stack slot intervals.
    pub stacks: &'a mut LiveStacks,
    /// Assigned intervals per register unit.
    pub matrix: &'a mut LiveRegMatrix,
    /// Assignments, originals and hints.
    pub vrm: &'a mut VirtRegMap,
    /// Counters for the run.
    pub stats: RegAllocStats,
    /// Rematerialized defs that became dead but must stay until every remat from them is done.
    pub dead_remats: Vec<Inst>,
}

impl<'a> RegAllocEnv<'a> {
    /// Insert `data` at `pos` and number it. Returns the instruction and its base index.
    pub fn insert_inst(&mut self, pos: InsertPos, data: InstData) -> (Inst, SlotIndex) {
        let inst = match pos {
            InsertPos::Before(before) => self.func.insert_inst_before(before, data),
            InsertPos::After(after) => self.func.insert_inst_after(after, data),
            InsertPos::Top(block) => self.func.prepend_inst(block, data),
            InsertPos::End(block) => match self.isa.last_split_point(self.func, block) {
                Some(lsp) => self.func.insert_inst_before(lsp, data),
                None => self.func.append_inst(block, data),
            },
        };
        let idx = self.index_new_inst(inst);
        trace!("Inserted {inst} at {idx}");
        (inst, idx)
    }

    // Number `inst`, remapping the points held outside the interval analysis if that renumbered
    // any entries.
    fn index_new_inst(&mut self, inst: Inst) -> SlotIndex {
        let generation = self.lis.generation();
        let idx = self.lis.insert_inst_in_maps(self.func, inst);
        if self.lis.generation() != generation {
            let indexes = self.lis.indexes();
            let remap = |i| indexes.remap(i, generation);
            self.matrix.remap_indexes(remap);
            self.stacks.remap_indexes(remap);
        }
        idx
    }

    /// Remove `inst` from the function and the index.
    pub fn remove_inst(&mut self, inst: Inst) {
        trace!("Removing {inst}");
        self.lis.remove_inst_from_maps(inst);
        self.func.remove_inst(inst);
    }

    /// The point before which code should be inserted at the end of `block`.
    pub fn last_split_point(&self, block: Block) -> SlotIndex {
        match self.isa.last_split_point(self.func, block) {
            Some(inst) => self.lis.indexes().index_of(inst),
            None => self.lis.indexes().block_end(block),
        }
    }

    /// Recompute the spill weight and hint of `vreg`.
    pub fn calculate_spill_weight_and_hint(&mut self, vreg: VirtReg) {
        VirtRegAuxInfo::new(&*self.func, self.isa, self.cfg, self.loops, self.freqs)
            .calculate_spill_weight_and_hint(vreg, self.lis, self.vrm);
    }

    /// The weight `vreg` would have as a local split product covering `[start, end]`.
    pub fn future_weight(&self, vreg: VirtReg, start: SlotIndex, end: SlotIndex) -> f32 {
        VirtRegAuxInfo::new(&*self.func, self.isa, self.cfg, self.loops, self.freqs).future_weight(
            self.lis.interval(vreg),
            start,
            end,
            self.lis,
            self.vrm,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ir::Reg;
    use crate::isa::generic::{self, GenericIsa};
    use crate::settings;

    /// Analyses owned by a test, from which a `RegAllocEnv` can be borrowed.
    pub(crate) struct TestEnv {
        pub func: Function,
        pub isa: GenericIsa,
        pub flags: Flags,
        pub cfg: ControlFlowGraph,
        pub domtree: DominatorTree,
        pub loops: LoopAnalysis,
        pub freqs: BlockFrequencyInfo,
        pub lis: LiveIntervals,
        pub stacks: LiveStacks,
        pub matrix: LiveRegMatrix,
        pub vrm: VirtRegMap,
    }

    impl TestEnv {
        pub fn new(func: Function, isa: GenericIsa) -> Self {
            Self::with_flags(func, isa, Flags::new(settings::builder()))
        }

        pub fn with_flags(func: Function, isa: GenericIsa, flags: Flags) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let cfg = ControlFlowGraph::with_function(&func);
            let domtree = DominatorTree::with_function(&func, &cfg);
            let mut loops = LoopAnalysis::new();
            loops.compute(&func, &cfg, &domtree);
            let mut freqs = BlockFrequencyInfo::new();
            freqs.compute(&func, &cfg, &domtree, &loops);
            let mut lis = LiveIntervals::new();
            lis.compute(crate::regalloc::live_intervals::FuncView {
                func: &func,
                isa: &isa,
                cfg: &cfg,
                domtree: &domtree,
            });
            let mut matrix = LiveRegMatrix::new();
            matrix.init(isa.reg_info().num_units);
            let mut test = Self {
                func,
                isa,
                flags,
                cfg,
                domtree,
                loops,
                freqs,
                lis,
                stacks: LiveStacks::new(),
                matrix,
                vrm: VirtRegMap::new(),
            };
            test.env().calculate_all_weights();
            test
        }

        pub fn env(&mut self) -> RegAllocEnv<'_> {
            RegAllocEnv {
                func: &mut self.func,
                isa: &self.isa,
                flags: &self.flags,
                cfg: &self.cfg,
                domtree: &self.domtree,
                loops: &self.loops,
                freqs: &self.freqs,
                lis: &mut self.lis,
                stacks: &mut self.stacks,
                matrix: &mut self.matrix,
                vrm: &mut self.vrm,
                stats: RegAllocStats::default(),
                dead_remats: Vec::new(),
            }
        }
    }

    impl RegAllocEnv<'_> {
        fn calculate_all_weights(&mut self) {
            VirtRegAuxInfo::new(&*self.func, self.isa, self.cfg, self.loops, self.freqs)
                .calculate_spill_weights_and_hints(self.lis, self.vrm);
        }
    }

    #[test]
    fn insertion_keeps_assignments_aligned() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        let ret = func.append_inst(b0, InstData::ret([Reg::Virt(a)]));
        let mut t = TestEnv::new(func, isa);
        let r0 = t.isa.gpr(0);
        let mut env = t.env();
        env.matrix
            .assign(env.lis.interval(a), r0, env.vrm, env.isa);

        // Exhaust the gap before the return so entries get renumbered.
        for i in 0..40 {
            env.insert_inst(InsertPos::Before(ret), InstData::iconst(b, i));
        }
        let li = env.lis.interval(a);
        let unit = env.isa.reg_info().units(r0).next().unwrap();
        let union: Vec<_> = env.matrix.union(unit).iter().collect();
        assert_eq!(union.len(), 1);
        assert_eq!(union[0].0, li.begin_index());
        assert_eq!(union[0].1, li.end_index());
        assert!(env.lis.indexes().index_of(ret) > env.lis.indexes().block_start(b0));
        assert!(fview!(env).func.layout.block_insts(b0).count() > 40);
    }

    #[test]
    fn end_position_precedes_terminator() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        let jump = func.append_inst(b0, InstData::jump(b1));
        func.append_inst(b1, InstData::ret([Reg::Virt(a)]));
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();
        let (inst, idx) = env.insert_inst(InsertPos::End(b0), InstData::copy(a, a));
        assert!(idx < env.lis.indexes().index_of(jump));
        assert_eq!(env.last_split_point(b0), env.lis.indexes().index_of(jump));
        env.remove_inst(inst);
        assert!(!env.lis.indexes().has_index(inst));
    }
}
