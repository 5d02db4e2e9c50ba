//! The live intervals analysis.
//!
//! `LiveIntervals` owns the program point index of a function, the live interval of every
//! virtual register, the live ranges of physical register units and the positions of call
//! clobber masks. Unit ranges are computed on first use.

use crate::dominator_tree::DominatorTree;
use crate::entity::{EntityRef, SecondaryMap};
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Inst, Operand, Reg, RegMask, RegUnit, VirtReg};
use crate::isa::{RegSet, TargetIsa};
use crate::regalloc::live_interval::LiveInterval;
use crate::regalloc::live_interval_calc::{use_slot, LiveIntervalCalc};
use crate::regalloc::live_range::{LiveRange, Segment, ValNo};
use crate::regalloc::live_range_calc::LivenessInputs;
use crate::regalloc::slot_indexes::{SlotIndex, SlotIndexes};
use crate::timing::{self, Pass};
use crate::trace;
use core::cell::OnceCell;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

/// The read-only function state liveness computations need.
#[derive(Clone, Copy)]
pub struct FuncView<'a> {
    /// The function.
    pub func: &'a Function,
    /// The target.
    pub isa: &'a dyn TargetIsa,
    /// Control flow graph of `func`.
    pub cfg: &'a ControlFlowGraph,
    /// Dominator tree of `func`.
    pub domtree: &'a DominatorTree,
}

impl<'a> FuncView<'a> {
    /// Combine with a program point index.
    pub fn with_indexes(self, indexes: &'a SlotIndexes) -> LivenessInputs<'a> {
        LivenessInputs {
            func: self.func,
            isa: self.isa,
            cfg: self.cfg,
            domtree: self.domtree,
            indexes,
        }
    }
}

/// Live intervals for all virtual registers of a function.
pub struct LiveIntervals {
    indexes: SlotIndexes,
    intervals: SecondaryMap<VirtReg, Option<LiveInterval>>,
    unit_ranges: SecondaryMap<RegUnit, OnceCell<LiveRange>>,
    // Physical register operands touching each unit, collected by `compute`.
    unit_operands: SecondaryMap<RegUnit, Vec<(Inst, u16)>>,
    regmask_slots: Vec<SlotIndex>,
    regmask_masks: Vec<RegMask>,
    calc: LiveIntervalCalc,
    generation: u32,
}

impl Default for LiveIntervals {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveIntervals {
    /// Create an empty analysis.
    pub fn new() -> Self {
        Self {
            indexes: SlotIndexes::new(),
            intervals: SecondaryMap::new(),
            unit_ranges: SecondaryMap::new(),
            unit_operands: SecondaryMap::new(),
            regmask_slots: Vec::new(),
            regmask_masks: Vec::new(),
            calc: LiveIntervalCalc::new(),
            generation: 0,
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.indexes.clear();
        self.intervals.clear();
        self.unit_ranges.clear();
        self.unit_operands.clear();
        self.regmask_slots.clear();
        self.regmask_masks.clear();
        self.calc.reset();
        self.generation = self.indexes.generation();
    }

    /// The program point index.
    pub fn indexes(&self) -> &SlotIndexes {
        &self.indexes
    }

    /// Number the function and compute the interval of every virtual register with operands.
    pub fn compute(&mut self, view: FuncView) {
        let _tt = timing::start(Pass::LiveIntervals);
        self.clear();
        self.indexes.compute(view.func);
        self.generation = self.indexes.generation();

        let info = view.isa.reg_info();
        self.unit_ranges.resize(info.num_units);
        for block in view.func.layout.blocks() {
            for inst in view.func.layout.block_insts(block) {
                for (idx, op) in view.func[inst].operands.iter().enumerate() {
                    match *op {
                        Operand::RegMask(mask) => {
                            self.regmask_slots
                                .push(self.indexes.index_of(inst).reg_slot(false));
                            self.regmask_masks.push(mask);
                        }
                        Operand::Reg {
                            reg: Reg::Phys(p), ..
                        } => {
                            for unit in info.units(p) {
                                self.unit_operands[unit].push((inst, idx as u16));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        for vreg in view.func.vregs.keys() {
            if !view.func.reg_empty(vreg) {
                self.create_and_compute_interval(vreg, view);
            }
        }
    }

    /// Does `vreg` have an interval?
    pub fn has_interval(&self, vreg: VirtReg) -> bool {
        self.intervals[vreg].is_some()
    }

    /// The interval of `vreg`, which must exist.
    pub fn interval(&self, vreg: VirtReg) -> &LiveInterval {
        self.intervals[vreg]
            .as_ref()
            .unwrap_or_else(|| panic!("{vreg} has no live interval"))
    }

    /// The interval of `vreg`, for modification.
    pub fn interval_mut(&mut self, vreg: VirtReg) -> &mut LiveInterval {
        self.intervals[vreg]
            .as_mut()
            .unwrap_or_else(|| panic!("{vreg} has no live interval"))
    }

    /// Create an empty interval for `vreg`.
    pub fn create_empty_interval(&mut self, vreg: VirtReg) -> &mut LiveInterval {
        debug_assert!(!self.has_interval(vreg), "{vreg} already has an interval");
        self.intervals[vreg].insert(LiveInterval::new(vreg))
    }

    /// Create and compute the interval of `vreg` from its operands.
    pub fn create_and_compute_interval(&mut self, vreg: VirtReg, view: FuncView) -> &LiveInterval {
        let mut li = self.intervals[vreg]
            .take()
            .unwrap_or_else(|| LiveInterval::new(vreg));
        self.compute_into(&mut li, view);
        self.intervals[vreg].insert(li)
    }

    fn compute_into(&mut self, li: &mut LiveInterval, view: FuncView) {
        let track = view
            .isa
            .should_track_sub_reg_liveness(view.func.vreg_class(li.reg));
        self.calc.reset();
        self.calc
            .calculate(li, track, view.with_indexes(&self.indexes));
    }

    /// Drop the interval of `vreg`.
    pub fn remove_interval(&mut self, vreg: VirtReg) -> Option<LiveInterval> {
        self.intervals[vreg].take()
    }

    /// Put back an interval taken with `remove_interval`.
    pub fn put_interval(&mut self, li: LiveInterval) {
        let reg = li.reg;
        self.intervals[reg] = Some(li);
    }

    /// The live range of `unit`, computing it on first use.
    pub fn reg_unit(&self, unit: RegUnit, view: FuncView) -> &LiveRange {
        // `compute` sized the map, so the shared default cell is never initialized.
        let cell = self
            .unit_ranges
            .get(unit)
            .unwrap_or_else(|| panic!("{unit} is not a register unit of the target"));
        cell.get_or_init(|| self.compute_reg_unit(unit, view))
    }

    /// The live range of `unit` if it was already computed.
    pub fn cached_reg_unit(&self, unit: RegUnit) -> Option<&LiveRange> {
        self.unit_ranges.get(unit).and_then(OnceCell::get)
    }

    // Physical registers are not SSA: every def creates a value, block live-ins create phis,
    // and the values are extended to the reading operands.
    fn compute_reg_unit(&self, unit: RegUnit, view: FuncView) -> LiveRange {
        let info = view.isa.reg_info();
        let mut lr = LiveRange::new();
        let reserved = info
            .unit_regs(unit)
            .iter()
            .any(|&r| view.isa.reserved_regs().contains(r));
        for block in view.func.layout.blocks() {
            let live_in = view.func.blocks[block]
                .live_ins
                .iter()
                .any(|&r| info.units(r).any(|u| u == unit));
            if live_in {
                lr.create_dead_def(self.indexes.block_start(block));
            }
        }
        let inputs = view.with_indexes(&self.indexes);
        let mut uses: SmallVec<[SlotIndex; 8]> = SmallVec::new();
        for &(inst, idx) in &self.unit_operands[unit] {
            if !self.indexes.has_index(inst) {
                continue;
            }
            let op = &view.func[inst].operands[usize::from(idx)];
            if op.is_def() {
                lr.create_dead_def(self.indexes.index_of(inst).reg_slot(op.is_early_clobber()));
            } else if op.reads_reg() && !reserved {
                uses.push(use_slot(inputs, inst, usize::from(idx)));
            }
        }
        LiveIntervalCalc::new().extend_to_points(&mut lr, &uses, &[], inputs);
        lr
    }

    /// If `li` is live across a call clobber mask, return the registers clobbered by those masks.
    pub fn check_reg_mask_interference(
        &self,
        li: &LiveRange,
        func: &Function,
        isa: &dyn TargetIsa,
    ) -> Option<RegSet> {
        let mut clobbered: Option<RegSet> = None;
        for seg in &li.segments {
            let first = self.regmask_slots.partition_point(|&s| s < seg.start);
            for i in first..self.regmask_slots.len() {
                if self.regmask_slots[i] >= seg.end {
                    break;
                }
                let regs = isa.call_clobbers(func, self.regmask_masks[i]);
                clobbered.get_or_insert_with(RegSet::new).union(&regs);
            }
        }
        clobbered
    }

    /// The call clobber slots, sorted.
    pub fn reg_mask_slots(&self) -> &[SlotIndex] {
        &self.regmask_slots
    }

    /// The call clobber masks with their slots in `[start, end)`.
    pub fn reg_masks_in(
        &self,
        start: SlotIndex,
        end: SlotIndex,
    ) -> impl Iterator<Item = (SlotIndex, RegMask)> + '_ {
        let first = self.regmask_slots.partition_point(|&s| s < start);
        self.regmask_slots[first..]
            .iter()
            .zip(&self.regmask_masks[first..])
            .take_while(move |&(&s, _)| s < end)
            .map(|(&s, &m)| (s, m))
    }

    /// Number a newly inserted instruction, remapping stored points if that renumbered anything.
    pub fn insert_inst_in_maps(&mut self, func: &Function, inst: Inst) -> SlotIndex {
        let idx = self.indexes.insert_inst_in_maps(func, inst);
        self.sync_generation();
        idx
    }

    /// Remove `inst` from the index.
    pub fn remove_inst_from_maps(&mut self, inst: Inst) {
        self.indexes.remove(inst);
    }

    /// Give the index of `old` to `new`.
    pub fn replace_inst_in_maps(&mut self, old: Inst, new: Inst) -> SlotIndex {
        self.indexes.replace(old, new)
    }

    fn sync_generation(&mut self) {
        let generation = self.indexes.generation();
        if generation == self.generation {
            return;
        }
        let (indexes, since) = (&self.indexes, self.generation);
        let remap = |idx| indexes.remap(idx, since);
        for li in self.intervals.values_mut().flatten() {
            li.remap_indexes(remap);
        }
        for lr in self.unit_ranges.values_mut().filter_map(OnceCell::get_mut) {
            lr.remap_indexes(remap);
        }
        for slot in &mut self.regmask_slots {
            *slot = remap(*slot);
        }
        self.generation = generation;
    }

    /// The renumbering generation the stored intervals are expressed in.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Extend `lr` to each of `points`. No point may be reached by an undefined value.
    pub fn extend_to_indices(
        &mut self,
        lr: &mut LiveRange,
        points: &[SlotIndex],
        undefs: &[SlotIndex],
        view: FuncView,
    ) {
        self.calc
            .extend_to_points(lr, points, undefs, view.with_indexes(&self.indexes));
    }

    /// Shrink the interval of `vreg` to its current uses.
    ///
    /// Defs that are no longer read are reported in `dead`. Returns true if the interval may
    /// now consist of several disconnected components.
    pub fn shrink_to_uses(
        &mut self,
        vreg: VirtReg,
        view: FuncView,
        dead: Option<&mut Vec<Inst>>,
    ) -> bool {
        let _tt = timing::start(Pass::LiveIntervals);
        let mut li = match self.intervals[vreg].take() {
            Some(li) => li,
            None => return false,
        };
        let inputs = view.with_indexes(&self.indexes);
        trace!("Shrink: {li}");

        let mut uses = Vec::new();
        for opref in view.func.reg_operands(vreg) {
            let op = view.func.operand(opref);
            if !op.reads_reg() || !self.indexes.has_index(opref.inst) {
                continue;
            }
            let idx = use_slot(inputs, opref.inst, opref.index);
            match li.range.query(idx).value_in() {
                Some(vn) => uses.push((idx, vn)),
                None => trace!("{vreg}: no value live at {idx}"),
            }
        }
        let (new, may_separate) = shrink_range(&li.range, uses, inputs);
        if let Some(dead) = dead {
            for (vn, info) in new.valnos() {
                if info.is_unused() || info.is_phi_def() {
                    continue;
                }
                let dead_def = new
                    .segment_containing(info.def)
                    .map_or(true, |s| s.valno == vn && s.end == info.def.dead_slot());
                if dead_def {
                    if let Some(inst) = self.indexes.instruction_at(info.def) {
                        dead.push(inst);
                    }
                }
            }
        }
        li.range = new;

        if li.has_sub_ranges() {
            for i in 0..li.subranges.len() {
                let mask = li.subranges[i].lane_mask;
                let mut uses = Vec::new();
                for opref in view.func.reg_operands(vreg) {
                    let op = view.func.operand(opref);
                    if !op.reads_reg() || op.is_def() || !self.indexes.has_index(opref.inst) {
                        continue;
                    }
                    if op.subreg() != 0 && !view.isa.sub_reg_lane_mask(op.subreg()).overlaps(mask) {
                        continue;
                    }
                    let idx = use_slot(inputs, opref.inst, opref.index);
                    if let Some(vn) = li.subranges[i].range.query(idx).value_in() {
                        uses.push((idx, vn));
                    }
                }
                let (new, _) = shrink_range(&li.subranges[i].range, uses, inputs);
                li.subranges[i].range = new;
            }
            li.remove_empty_sub_ranges();
        }
        trace!("Shrunk: {li}");
        self.intervals[vreg] = Some(li);
        may_separate
    }

    /// Split the interval of `vreg` into its connected components.
    ///
    /// Each component but the first gets a new virtual register of the same class; the operands
    /// are rewritten and all intervals recomputed. Returns the new registers.
    pub fn split_separate_components(
        &mut self,
        vreg: VirtReg,
        func: &mut Function,
        isa: &dyn TargetIsa,
        cfg: &ControlFlowGraph,
        domtree: &DominatorTree,
    ) -> Vec<VirtReg> {
        let classes = match self.intervals[vreg].as_ref() {
            Some(li) => connected_value_classes(
                li,
                FuncView {
                    func: &*func,
                    isa,
                    cfg,
                    domtree,
                },
                &self.indexes,
            ),
            None => return Vec::new(),
        };
        let num_classes = classes.iter().flatten().max().map_or(0, |&c| c + 1);
        if num_classes <= 1 {
            return Vec::new();
        }

        let class = func.vreg_class(vreg);
        let new_regs: Vec<VirtReg> = (1..num_classes).map(|_| func.new_vreg(class)).collect();
        let li = self.interval(vreg);
        let mut rewrites = Vec::new();
        for opref in func.reg_operands(vreg) {
            let op = func.operand(opref);
            let base = match self.indexes.try_index_of(opref.inst) {
                Some(idx) => idx,
                None => continue,
            };
            let q = li.range.query(base);
            let vn = if op.reads_reg() {
                q.value_in()
            } else {
                q.value_defined()
            };
            if let Some(c) = vn.and_then(|vn| classes[vn.index()]) {
                if c > 0 {
                    rewrites.push((opref, new_regs[c - 1]));
                }
            }
        }
        for (opref, reg) in rewrites {
            func.set_operand_reg(opref.inst, opref.index, Reg::Virt(reg));
        }

        let weight = self.interval(vreg).weight;
        let view = FuncView {
            func: &*func,
            isa,
            cfg,
            domtree,
        };
        for &reg in core::iter::once(&vreg).chain(&new_regs) {
            self.create_and_compute_interval(reg, view);
            self.interval_mut(reg).weight = weight;
        }
        trace!("Split {vreg} into {} components", num_classes);
        new_regs
    }

    /// Re-synchronize the index of `block` between `begin` and `end` and recompute the
    /// intervals of `regs`.
    pub fn repair_intervals_in_range(
        &mut self,
        view: FuncView,
        block: Block,
        begin: Option<Inst>,
        end: Option<Inst>,
        regs: &[VirtReg],
    ) {
        self.indexes.repair_range(view.func, block, begin, end);
        self.sync_generation();
        for &reg in regs {
            if view.func.reg_empty(reg) {
                self.intervals[reg] = None;
            } else {
                self.create_and_compute_interval(reg, view);
            }
        }
    }

    /// Mark the last use of each value of `vreg` in every block with a kill flag.
    pub fn add_kill_flags(&self, vreg: VirtReg, func: &mut Function) {
        let li = match self.intervals[vreg].as_ref() {
            Some(li) => li,
            None => return,
        };
        let mut kills = Vec::new();
        for seg in &li.segments {
            if seg.end.is_block() {
                continue;
            }
            if let Some(inst) = self.indexes.instruction_at(seg.end) {
                kills.push(inst);
            }
        }
        for inst in kills {
            func.set_reg_flag(inst, Reg::Virt(vreg), crate::ir::OperandFlags::KILL, true);
        }
    }

    /// Iterate over all virtual registers with intervals.
    pub fn vregs(&self) -> impl Iterator<Item = VirtReg> + '_ {
        self.intervals
            .iter()
            .filter_map(|(v, li)| li.as_ref().map(|_| v))
    }

    /// Is physical register `reg` live into `block`?
    pub fn is_live_in_to_block(&self, li: &LiveRange, block: Block) -> bool {
        li.live_at(self.indexes.block_start(block))
    }

    /// The block containing all of `li`, if it is local to one.
    pub fn interval_in_one_block(&self, li: &LiveRange) -> Option<Block> {
        if li.is_empty() {
            return None;
        }
        let block = self.indexes.block_at(li.begin_index())?;
        if li.end_index() <= self.indexes.block_end(block) {
            Some(block)
        } else {
            None
        }
    }
}

// Rebuild `old` covering only the given uses. Value numbers are kept; values that no longer
// reach anything are marked unused. Returns the new range and whether a value became unused.
fn shrink_range(
    old: &LiveRange,
    uses: Vec<(SlotIndex, ValNo)>,
    inputs: LivenessInputs,
) -> (LiveRange, bool) {
    let mut new = old.clone();
    new.segments.clear();
    for (vn, info) in old.valnos() {
        if !info.is_unused() && !info.is_phi_def() {
            new.add_segment(Segment::new(info.def, info.def.dead_slot(), vn));
        }
    }

    let indexes = inputs.indexes;
    let mut live_out: FxHashSet<Block> = FxHashSet::default();
    let mut work = uses;
    while let Some((idx, vn)) = work.pop() {
        let block = match indexes.block_at(idx.prev_slot()) {
            Some(b) => b,
            None => continue,
        };
        let start = indexes.block_start(block);
        let def = old[vn].def;
        if def >= start && def < idx {
            new.add_segment(Segment::new(def, idx, vn));
            continue;
        }
        if start < idx {
            new.add_segment(Segment::new(start, idx, vn));
        }
        for pred in inputs.cfg.pred_iter(block) {
            let end = indexes.block_end(pred.block);
            if let Some(pvn) = old.vn_info_before(end) {
                if live_out.insert(pred.block) {
                    work.push((end, pvn));
                }
            }
        }
    }

    let mut may_separate = false;
    let unused: Vec<ValNo> = new
        .valnos()
        .filter(|&(vn, info)| {
            !info.is_unused() && info.is_phi_def() && !new.segments.iter().any(|s| s.valno == vn)
        })
        .map(|(vn, _)| vn)
        .collect();
    for vn in unused {
        new[vn].mark_unused();
        may_separate = true;
    }
    if new.valnos().filter(|(_, i)| !i.is_unused()).count() > 1 {
        may_separate = true;
    }
    (new, may_separate)
}

// Group the values of `li` into connected components. Values are connected when one flows into
// a phi of the other, or when an instruction reading one value defines the other.
fn connected_value_classes(
    li: &LiveInterval,
    view: FuncView,
    indexes: &SlotIndexes,
) -> Vec<Option<usize>> {
    let n = li.range.num_valnos();
    let mut parent: Vec<usize> = (0..n).collect();
    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }
    let mut join = |a: usize, b: usize| {
        let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
        if ra != rb {
            parent[ra.max(rb)] = ra.min(rb);
        }
    };

    for (vn, info) in li.range.valnos() {
        if info.is_unused() {
            continue;
        }
        if info.is_phi_def() {
            if let Some(block) = indexes.block_at(info.def) {
                for pred in view.cfg.pred_iter(block) {
                    if let Some(pvn) = li.range.vn_info_before(indexes.block_end(pred.block)) {
                        join(vn.index(), pvn.index());
                    }
                }
            }
        } else if let Some(inst) = indexes.instruction_at(info.def) {
            if view.func[inst].reads_virt_reg(li.reg) {
                if let Some(used) = li.range.query(indexes.index_of(inst)).value_in() {
                    join(vn.index(), used.index());
                }
            }
        }
    }

    // Number the components in order of their first value.
    let mut ids: Vec<Option<usize>> = vec![None; n];
    let mut next = 0;
    let mut out = vec![None; n];
    for (vn, info) in li.range.valnos() {
        if info.is_unused() {
            continue;
        }
        let root = find(&mut parent, vn.index());
        let id = *ids[root].get_or_insert_with(|| {
            next += 1;
            next - 1
        });
        out[vn.index()] = Some(id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InstData;
    use crate::isa::generic;

    struct Env {
        isa: generic::GenericIsa,
        func: Function,
    }

    impl Env {
        fn analyze(&mut self) -> (ControlFlowGraph, DominatorTree, LiveIntervals) {
            let cfg = ControlFlowGraph::with_function(&self.func);
            let domtree = DominatorTree::with_function(&self.func, &cfg);
            let mut lis = LiveIntervals::new();
            lis.compute(FuncView {
                func: &self.func,
                isa: &self.isa,
                cfg: &cfg,
                domtree: &domtree,
            });
            (cfg, domtree, lis)
        }
    }

    #[test]
    fn computes_all_intervals_and_units() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let v = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.blocks[b0].live_ins.push(isa.gpr(0));
        func.append_inst(b0, InstData::copy(v, isa.gpr(0)));
        let mask = isa.call_clobber_mask(&mut func);
        func.append_inst(
            b0,
            InstData::new(crate::ir::Opcode::Call, [Operand::RegMask(mask)]),
        );
        func.append_inst(b0, InstData::ret([Reg::Virt(v)]));
        let mut env = Env { isa, func };
        let (cfg, domtree, mut lis) = env.analyze();
        let view = FuncView {
            func: &env.func,
            isa: &env.isa,
            cfg: &cfg,
            domtree: &domtree,
        };

        assert!(lis.has_interval(v));
        assert_eq!(lis.interval(v).segments.len(), 1);
        let clobbered = lis
            .check_reg_mask_interference(lis.interval(v), view.func, view.isa)
            .unwrap();
        assert!(clobbered.contains(env.isa.gpr(1)));

        let unit = env.isa.reg_info().units(env.isa.gpr(0)).next().unwrap();
        assert!(lis.cached_reg_unit(unit).is_none());
        let lr = lis.reg_unit(unit, view).clone();
        assert_eq!(lr.num_valnos(), 1);
        assert!(lr.begin_index().is_block());
    }

    #[test]
    fn shrink_reports_dead_defs() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let v = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let i0 = func.append_inst(b0, InstData::iconst(v, 1));
        let use_inst = func.append_inst(b0, InstData::alu_imm(v, v, 1).with_tie(0, 1));
        func.append_inst(b0, InstData::ret([]));
        let mut env = Env { isa, func };
        let (cfg, domtree, mut lis) = env.analyze();
        assert_eq!(lis.interval(v).num_valnos(), 2);

        let view = FuncView {
            func: &env.func,
            isa: &env.isa,
            cfg: &cfg,
            domtree: &domtree,
        };
        let mut dead = Vec::new();
        lis.shrink_to_uses(v, view, Some(&mut dead));
        // The tied def is never read.
        assert_eq!(dead, vec![use_inst]);
        let li = lis.interval(v);
        assert_eq!(li.begin_index(), lis.indexes().index_of(i0).reg_slot(false));
    }

    #[test]
    fn separate_components() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let v = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(v, 1));
        func.append_inst(b0, InstData::ret([Reg::Virt(v)]));
        func.append_inst(b0, InstData::iconst(v, 2));
        func.append_inst(b0, InstData::ret([Reg::Virt(v)]));
        let mut env = Env { isa, func };
        let (cfg, domtree, mut lis) = env.analyze();
        let new = lis.split_separate_components(v, &mut env.func, &env.isa, &cfg, &domtree);
        assert_eq!(new.len(), 1);
        assert_eq!(lis.interval(v).num_valnos(), 1);
        assert_eq!(lis.interval(new[0]).num_valnos(), 1);
        assert!(!lis.interval(v).overlaps(lis.interval(new[0])));
    }

    #[test]
    fn insertion_keeps_intervals_in_sync() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let v = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let i0 = func.append_inst(b0, InstData::iconst(v, 1));
        let i1 = func.append_inst(b0, InstData::ret([Reg::Virt(v)]));
        let mut env = Env { isa, func };
        let (_cfg, _domtree, mut lis) = env.analyze();
        // Fill the gap until the index has to renumber.
        for _ in 0..8 {
            let n = env.func.insert_inst_before(i1, InstData::new(crate::ir::Opcode::Nop, []));
            lis.insert_inst_in_maps(&env.func, n);
        }
        assert!(lis.indexes().generation() > 0);
        let li = lis.interval(v);
        assert_eq!(li.begin_index(), lis.indexes().index_of(i0).reg_slot(false));
        assert_eq!(li.end_index(), lis.indexes().index_of(i1).reg_slot(false));
    }
}
