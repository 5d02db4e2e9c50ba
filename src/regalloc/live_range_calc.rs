//! Live range calculation with SSA reconstruction.
//!
//! `LiveRangeCalc` extends a live range to reach a set of uses. Each use is reached from the
//! definitions that dominate it. When several values reach a use, phi-values are inserted at the
//! blocks where they meet, so the result is a live range in SSA form again.
//!
//! The calculator can also be driven by hand: seed the live-out values of some blocks with
//! `set_live_out_value`, add the blocks where the range is live-in with `add_live_in_block`, and
//! let `calculate_values` fill in the values of the live-in blocks.

use crate::dominator_tree::DominatorTree;
use crate::entity::packed_option::PackedOption;
use crate::entity::{EntitySet, SecondaryMap};
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use crate::isa::TargetIsa;
use crate::regalloc::live_range::{LiveRange, Segment, ValNo};
use crate::regalloc::slot_indexes::{SlotIndex, SlotIndexes};
use crate::trace;
use smallvec::SmallVec;

/// The function level inputs of liveness computations.
#[derive(Clone, Copy)]
pub struct LivenessInputs<'a> {
    /// The function.
    pub func: &'a Function,
    /// The target.
    pub isa: &'a dyn TargetIsa,
    /// Control flow graph of `func`.
    pub cfg: &'a ControlFlowGraph,
    /// Dominator tree of `func`.
    pub domtree: &'a DominatorTree,
    /// Program point index of `func`.
    pub indexes: &'a SlotIndexes,
}

/// The value leaving a block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum OutValue {
    /// Live through with a value that isn't known yet, or not live at all.
    #[default]
    Unknown,
    /// Explicitly undefined.
    Undef,
    /// A known value.
    Value(ValNo),
}

impl OutValue {
    fn value(self) -> Option<ValNo> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct LiveOut {
    value: OutValue,
    // The block defining `value`, computed lazily.
    def_block: PackedOption<Block>,
}

/// A block where the range is live-in with a value yet to be determined.
#[derive(Clone, Debug)]
struct LiveInBlock {
    block: Block,
    // Cleared once the value has been determined and the range updated.
    pending: bool,
    // Where the live-in range ends, or `None` when the range is live through the block.
    kill: Option<SlotIndex>,
    value: Option<ValNo>,
}

/// Computes live ranges in SSA form.
pub struct LiveRangeCalc {
    // Blocks with a live-out entry. Doubles as the visited set of `find_reaching_defs`.
    seen: EntitySet<Block>,
    // The value live out of each seen block.
    map: SecondaryMap<Block, LiveOut>,
    // Work list of live-in blocks.
    live_in: Vec<LiveInBlock>,
    // Blocks known to be reached, or not reached, by a def of the current range.
    def_on_entry: EntitySet<Block>,
    undef_on_entry: EntitySet<Block>,
}

impl LiveRangeCalc {
    /// Create a calculator.
    pub fn new() -> Self {
        Self {
            seen: EntitySet::new(),
            map: SecondaryMap::new(),
            live_in: Vec::new(),
            def_on_entry: EntitySet::new(),
            undef_on_entry: EntitySet::new(),
        }
    }

    /// Prepare for a new live range.
    ///
    /// The live-out map can be shared by several ranges as long as they are never live out of
    /// the same block; use `reset_live_out_map` to only forget the live-out values.
    pub fn reset(&mut self) {
        self.reset_live_out_map();
        self.def_on_entry.clear();
        self.undef_on_entry.clear();
        self.live_in.clear();
    }

    /// Forget all live-out values.
    pub fn reset_live_out_map(&mut self) {
        self.seen.clear();
        self.map.clear();
    }

    /// Record that `value` is live out of `block`. `None` means live through with an unknown
    /// value.
    pub fn set_live_out_value(&mut self, block: Block, value: Option<ValNo>) {
        self.seen.insert(block);
        self.map[block] = LiveOut {
            value: value.map_or(OutValue::Unknown, OutValue::Value),
            def_block: None.into(),
        };
    }

    fn set_live_out(&mut self, block: Block, value: OutValue) {
        self.seen.insert(block);
        self.map[block] = LiveOut {
            value,
            def_block: None.into(),
        };
    }

    /// Add `block` to the live-in work list. The range is live from the block start to `kill`,
    /// or through the whole block when `kill` is `None`.
    pub fn add_live_in_block(&mut self, block: Block, kill: Option<SlotIndex>) {
        self.live_in.push(LiveInBlock {
            block,
            pending: true,
            kill,
            value: None,
        });
    }

    /// Determine the values of all live-in blocks, inserting phi-values where needed, and add
    /// the live-in segments to `lr`.
    pub fn calculate_values(&mut self, lr: &mut LiveRange, inputs: LivenessInputs) {
        self.update_ssa(lr, inputs);
        self.update_from_live_ins(lr, inputs);
    }

    /// Extend `lr` to be live at `use_idx`, which is the register slot of an instruction
    /// reading the register.
    ///
    /// `undefs` lists points where the lanes of `lr` become undefined; liveness doesn't
    /// propagate past them.
    pub fn extend(
        &mut self,
        lr: &mut LiveRange,
        use_idx: SlotIndex,
        undefs: &[SlotIndex],
        inputs: LivenessInputs,
    ) {
        let indexes = inputs.indexes;
        let use_block = indexes
            .block_at(use_idx.prev_slot())
            .unwrap_or_else(|| panic!("no block at use {use_idx}"));

        // Is there a def in the same block we can extend?
        let block_start = indexes.block_start(use_block);
        let (found, hit_undef) = lr.extend_in_block(undefs, block_start, use_idx);
        if found.is_some() || hit_undef {
            return;
        }

        if self.find_reaching_defs(lr, use_block, use_idx, undefs, inputs) {
            return;
        }
        // Several values reach the use, we may need phi-values.
        self.calculate_values(lr, inputs);
    }

    /// Walk the predecessors of `use_block` breadth first, collecting the values live out of
    /// them. Returns true if the range was extended to `use_idx` with a unique value. Otherwise
    /// the live-in blocks are left in the work list for `calculate_values`.
    fn find_reaching_defs(
        &mut self,
        lr: &mut LiveRange,
        use_block: Block,
        use_idx: SlotIndex,
        undefs: &[SlotIndex],
        inputs: LivenessInputs,
    ) -> bool {
        let LivenessInputs { cfg, indexes, .. } = inputs;
        let mut use_idx = Some(use_idx);
        let mut worklist: SmallVec<[Block; 16]> = SmallVec::new();
        worklist.push(use_block);
        let mut unique = true;
        let mut the_value: OutValue = OutValue::Unknown;
        let mut found_undef = false;

        let mut i = 0;
        while i < worklist.len() {
            let block = worklist[i];
            i += 1;
            if cfg.num_preds(block) == 0 {
                assert!(
                    !undefs.is_empty(),
                    "use at {} is not jointly dominated by defs: no value reaches {block}",
                    use_idx.map_or_else(|| "loop".to_string(), |u| u.to_string()),
                );
                found_undef = true;
            }

            for pred in cfg.pred_iter(block) {
                let pred = pred.block;
                if self.seen.contains(pred) {
                    if let OutValue::Value(v) = self.map[pred].value {
                        if the_value != OutValue::Value(v) && the_value != OutValue::Unknown {
                            unique = false;
                        }
                        the_value = OutValue::Value(v);
                    }
                    continue;
                }

                // First time we see `pred`. Try to find its live-out value, or leave it unknown
                // if `pred` is live through with an unknown value.
                let (start, end) = indexes.block_range(pred);
                let (value, undef) = lr.extend_in_block(undefs, start, end);
                found_undef |= undef;
                self.set_live_out(
                    pred,
                    if undef {
                        OutValue::Undef
                    } else {
                        value.map_or(OutValue::Unknown, OutValue::Value)
                    },
                );
                if let Some(v) = value {
                    if the_value != OutValue::Value(v) && the_value != OutValue::Unknown {
                        unique = false;
                    }
                    the_value = OutValue::Value(v);
                }
                if value.is_some() || undef {
                    continue;
                }

                if pred != use_block {
                    if !worklist.contains(&pred) {
                        worklist.push(pred);
                    }
                } else {
                    // A loop back to the use block, so the value is really live through it.
                    use_idx = None;
                }
            }
        }

        self.live_in.clear();
        found_undef |= the_value.value().is_none();
        if !undefs.is_empty() && found_undef {
            unique = false;
        }

        if unique {
            let value = the_value
                .value()
                .expect("unique reaching value must be defined");
            trace!(
                "Unique value {} reaches {} blocks",
                value,
                worklist.len()
            );
            for &block in &worklist {
                let (start, mut end) = indexes.block_range(block);
                match use_idx {
                    Some(u) if block == use_block => end = u,
                    _ => self.map[block] = LiveOut {
                        value: OutValue::Value(value),
                        def_block: None.into(),
                    },
                }
                lr.add_segment(Segment::new(start, end, value));
            }
            return true;
        }

        // Several values were found, so the work list becomes the live-in list for
        // `update_ssa`.
        worklist.sort_unstable();
        for &block in &worklist {
            if !undefs.is_empty() && !self.is_def_on_entry(lr, undefs, block, inputs) {
                continue;
            }
            let kill = if block == use_block { use_idx } else { None };
            self.add_live_in_block(block, kill);
        }
        false
    }

    /// Does some def of `lr` reach the entry of `block` without passing an undef point?
    ///
    /// Answers are cached until the next `reset`.
    pub fn is_def_on_entry(
        &mut self,
        lr: &LiveRange,
        undefs: &[SlotIndex],
        block: Block,
        inputs: LivenessInputs,
    ) -> bool {
        if self.def_on_entry.contains(block) {
            return true;
        }
        if self.undef_on_entry.contains(block) {
            return false;
        }
        let LivenessInputs { cfg, indexes, .. } = inputs;

        let mut worklist: Vec<Block> = cfg.pred_iter(block).map(|p| p.block).collect();
        worklist.dedup();
        let mut i = 0;
        while i < worklist.len() {
            let b = worklist[i];
            i += 1;
            if self.seen.contains(b) && self.map[b].value.value().is_some() {
                return self.mark_defined(b, block, cfg);
            }
            let (begin, end) = indexes.block_range(b);
            // `end` doesn't belong to `b`: a segment starting there is the first one after it.
            let ub = lr.segments.partition_point(|s| s.start <= end.prev_slot());
            if ub > 0 {
                let seg = lr.segments[ub - 1];
                if seg.end > begin {
                    // A segment overlaps `b`. Unless the range is explicitly undefined between
                    // the end of the segment and the end of the block, it is defined on exit.
                    if LiveRange::is_undef_in(undefs, seg.end, end) {
                        continue;
                    }
                    return self.mark_defined(b, block, cfg);
                }
            }

            // No segment overlaps `b`. Don't look past blocks that undefine the range.
            if self.undef_on_entry.contains(b) || LiveRange::is_undef_in(undefs, begin, end) {
                self.undef_on_entry.insert(b);
                continue;
            }
            if self.def_on_entry.contains(b) {
                return self.mark_defined(b, block, cfg);
            }
            for p in cfg.pred_iter(b) {
                if !worklist.contains(&p.block) {
                    worklist.push(p.block);
                }
            }
        }

        self.undef_on_entry.insert(block);
        false
    }

    fn mark_defined(&mut self, b: Block, block: Block, cfg: &ControlFlowGraph) -> bool {
        for s in cfg.succ_iter(b) {
            self.def_on_entry.insert(s);
        }
        self.def_on_entry.insert(block);
        true
    }

    // The block defining the live-out value of `block`, caching it.
    fn def_block_of(
        &mut self,
        lr: &LiveRange,
        block: Block,
        indexes: &SlotIndexes,
    ) -> Option<Block> {
        let lo = self.map[block];
        let v = lo.value.value()?;
        if let Some(b) = lo.def_block.expand() {
            return Some(b);
        }
        let b = indexes.block_at(lr[v].def)?;
        self.map[block].def_block = b.into();
        Some(b)
    }

    /// Propagate live-out values down the dominator tree, inserting phi-values where they
    /// meet, until nothing changes.
    fn update_ssa(&mut self, lr: &mut LiveRange, inputs: LivenessInputs) {
        let LivenessInputs {
            cfg,
            domtree,
            indexes,
            ..
        } = inputs;
        loop {
            let mut changed = false;
            for i in 0..self.live_in.len() {
                if !self.live_in[i].pending {
                    continue;
                }
                let block = self.live_in[i].block;
                let idom = domtree.idom(block);

                // A live-in value to a block without immediate dominator needs a phi. This is
                // an unreachable block or the entry block.
                let mut need_phi = idom.map_or(true, |d| !self.seen.contains(d));
                let mut idom_value = OutValue::Unknown;

                // The idom dominates all our predecessors, but it may not be their immediate
                // dominator. A predecessor carrying a value properly dominated by the idom means
                // we are in the dominance frontier of that value.
                if let Some(idom) = idom.filter(|_| !need_phi) {
                    idom_value = self.map[idom].value;
                    self.def_block_of(lr, idom, indexes);
                    for pred in cfg.pred_iter(block) {
                        let pv = self.map[pred.block].value;
                        if pv == OutValue::Unknown || pv == idom_value {
                            continue;
                        }
                        if pv == OutValue::Undef {
                            need_phi = true;
                            break;
                        }
                        let def_block = self.def_block_of(lr, pred.block, indexes);
                        if def_block.is_some_and(|d| domtree.dominates(idom, d)) {
                            need_phi = true;
                            break;
                        }
                    }
                }

                let kill = self.live_in[i].kill;
                if need_phi {
                    changed = true;
                    let (start, end) = indexes.block_range(block);
                    let vn = lr.get_next_value(start);
                    trace!("Phi-value {} at {}", vn, block);
                    let entry = &mut self.live_in[i];
                    entry.value = Some(vn);
                    entry.pending = false;
                    match kill {
                        Some(k) => {
                            lr.add_segment(Segment::new(start, k, vn));
                        }
                        None => {
                            lr.add_segment(Segment::new(start, end, vn));
                            self.map[block] = LiveOut {
                                value: OutValue::Value(vn),
                                def_block: block.into(),
                            };
                        }
                    }
                } else if let OutValue::Value(v) = idom_value {
                    // No phi here. Remember the incoming value.
                    self.live_in[i].value = Some(v);
                    // A value killed in the block doesn't propagate through.
                    if kill.is_some() {
                        continue;
                    }
                    if self.map[block].value == idom_value {
                        continue;
                    }
                    changed = true;
                    let idom = idom.expect("value without dominator");
                    self.map[block] = self.map[idom];
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Add the segments of all live-in blocks to `lr`.
    fn update_from_live_ins(&mut self, lr: &mut LiveRange, inputs: LivenessInputs) {
        for entry in core::mem::take(&mut self.live_in) {
            if !entry.pending {
                continue;
            }
            let value = entry
                .value
                .unwrap_or_else(|| panic!("no live-in value found for {}", entry.block));
            let (start, mut end) = inputs.indexes.block_range(entry.block);
            match entry.kill {
                Some(k) => end = k,
                None => {
                    // Live through, so live out as well.
                    debug_assert!(self.seen.contains(entry.block));
                    self.map[entry.block] = LiveOut {
                        value: OutValue::Value(value),
                        def_block: None.into(),
                    };
                }
            }
            lr.add_segment(Segment::new(start, end, value));
        }
    }
}

impl Default for LiveRangeCalc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Inst, InstData, Reg, RegClass};
    use crate::isa::generic;

    struct Setup {
        func: Function,
        cfg: ControlFlowGraph,
        domtree: DominatorTree,
        sx: SlotIndexes,
        isa: generic::GenericIsa,
    }

    impl Setup {
        fn new(func: Function) -> Self {
            let cfg = ControlFlowGraph::with_function(&func);
            let domtree = DominatorTree::with_function(&func, &cfg);
            let mut sx = SlotIndexes::new();
            sx.compute(&func);
            Self {
                func,
                cfg,
                domtree,
                sx,
                isa: generic::builder().finish(),
            }
        }

        fn inputs(&self) -> LivenessInputs {
            LivenessInputs {
                func: &self.func,
                isa: &self.isa,
                cfg: &self.cfg,
                domtree: &self.domtree,
                indexes: &self.sx,
            }
        }

        fn def(&self, lr: &mut LiveRange, inst: Inst) -> ValNo {
            lr.create_dead_def(self.sx.index_of(inst).reg_slot(false))
        }

        fn use_at(&self, inst: Inst) -> SlotIndex {
            self.sx.index_of(inst).reg_slot(false)
        }
    }

    // block0: v = 1; brif c, block1, block2
    // block1: v = 2; jump block3
    // block2: jump block3
    // block3: return v
    fn diamond() -> (Function, [Inst; 4], [Block; 4]) {
        let mut func = Function::with_name("diamond");
        let rc = RegClass::from_u32(0);
        let v = func.new_vreg(rc);
        let c = func.new_vreg(rc);
        let b = [
            func.append_block(),
            func.append_block(),
            func.append_block(),
            func.append_block(),
        ];
        let d0 = func.append_inst(b[0], InstData::iconst(v, 1));
        func.append_inst(b[0], InstData::iconst(c, 0));
        func.append_inst(b[0], InstData::brif(Reg::Virt(c), b[1], b[2]));
        let d1 = func.append_inst(b[1], InstData::iconst(v, 2));
        func.append_inst(b[1], InstData::jump(b[3]));
        let j2 = func.append_inst(b[2], InstData::jump(b[3]));
        let r = func.append_inst(b[3], InstData::ret([Reg::Virt(v)]));
        (func, [d0, d1, j2, r], b)
    }

    #[test]
    fn join_creates_one_phi() {
        let (func, [d0, d1, _, r], b) = diamond();
        let s = Setup::new(func);
        let mut lr = LiveRange::new();
        let v0 = s.def(&mut lr, d0);
        let v1 = s.def(&mut lr, d1);
        let mut calc = LiveRangeCalc::new();
        calc.extend(&mut lr, s.use_at(r), &[], s.inputs());
        lr.verify().unwrap();

        assert_eq!(lr.num_valnos(), 3);
        let phi = lr.vn_info_before(s.use_at(r)).unwrap();
        assert!(phi != v0 && phi != v1);
        assert!(lr[phi].is_phi_def());
        assert_eq!(lr[phi].def, s.sx.block_start(b[3]));
        // v0 flows out of block0 and through block2.
        assert_eq!(lr.vn_info_before(s.sx.block_end(b[2])), Some(v0));
        assert_eq!(lr.vn_info_before(s.sx.block_end(b[1])), Some(v1));

        // Extending again changes nothing.
        let before = lr.clone();
        calc.reset();
        calc.extend(&mut lr, s.use_at(r), &[], s.inputs());
        assert_eq!(lr, before);
    }

    #[test]
    fn single_def_needs_no_phi() {
        // block0: v = 1; c = 0; jump block1
        // block1: v2 = alu v, v; brif c, block1, block2
        // block2: return v
        let mut func = Function::with_name("loop");
        let rc = RegClass::from_u32(0);
        let v = func.new_vreg(rc);
        let c = func.new_vreg(rc);
        let t = func.new_vreg(rc);
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        let d = func.append_inst(b0, InstData::iconst(v, 1));
        func.append_inst(b0, InstData::iconst(c, 0));
        func.append_inst(b0, InstData::jump(b1));
        let u = func.append_inst(b1, InstData::alu(t, v, v));
        func.append_inst(b1, InstData::brif(Reg::Virt(c), b1, b2));
        let r = func.append_inst(b2, InstData::ret([Reg::Virt(v)]));
        let s = Setup::new(func);

        let mut lr = LiveRange::new();
        let v0 = s.def(&mut lr, d);
        let mut calc = LiveRangeCalc::new();
        calc.extend(&mut lr, s.use_at(u), &[], s.inputs());
        calc.reset();
        calc.extend(&mut lr, s.use_at(r), &[], s.inputs());
        lr.verify().unwrap();

        assert_eq!(lr.num_valnos(), 1);
        assert!(!lr[v0].is_phi_def());
        // Live through the whole loop body.
        let (start, end) = s.sx.block_range(b1);
        assert!(lr.segment_containing(start).is_some_and(|seg| seg.end >= end));
        assert_eq!(lr.vn_info_before(s.use_at(r)), Some(v0));
    }

    #[test]
    fn manual_live_ins() {
        let (func, [d0, _, _, r], b) = diamond();
        let s = Setup::new(func);
        let mut lr = LiveRange::new();
        let v0 = s.def(&mut lr, d0);
        let (_, end0) = s.sx.block_range(b[0]);
        lr.add_segment(Segment::new(s.sx.index_of(d0).reg_slot(false), end0, v0));

        let mut calc = LiveRangeCalc::new();
        calc.set_live_out_value(b[0], Some(v0));
        for &block in &b[1..3] {
            calc.set_live_out_value(block, None);
            calc.add_live_in_block(block, None);
        }
        calc.set_live_out_value(b[3], None);
        calc.add_live_in_block(b[3], Some(s.use_at(r)));
        calc.calculate_values(&mut lr, s.inputs());
        lr.verify().unwrap();

        // Everything is dominated by block0, so no phi-values are needed.
        assert_eq!(lr.num_valnos(), 1);
        assert_eq!(lr.vn_info_before(s.use_at(r)), Some(v0));
    }
}
