//! Computing live intervals from the operands of a function.

use crate::ir::{Inst, VirtReg};
use crate::isa::LaneBitmask;
use crate::regalloc::live_interval::LiveInterval;
use crate::regalloc::live_range::LiveRange;
use crate::regalloc::live_range_calc::{LiveRangeCalc, LivenessInputs};
use crate::regalloc::slot_indexes::SlotIndex;
use smallvec::SmallVec;

/// Builds the live interval of a virtual register from its defs and uses.
#[derive(Default)]
pub struct LiveIntervalCalc {
    calc: LiveRangeCalc,
}

impl LiveIntervalCalc {
    /// Create a calculator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the state of the previous computation.
    pub fn reset(&mut self) {
        self.calc.reset();
    }

    /// The underlying SSA calculator.
    pub fn range_calc(&mut self) -> &mut LiveRangeCalc {
        &mut self.calc
    }

    /// Compute `li` from scratch.
    ///
    /// Every def operand creates a value, and the values are extended to all uses. With
    /// `track_sub_regs`, sub-register operands create subranges and each subrange is computed
    /// separately; the main range is then the union of the subranges.
    pub fn calculate(
        &mut self,
        li: &mut LiveInterval,
        track_sub_regs: bool,
        inputs: LivenessInputs,
    ) {
        let LivenessInputs {
            func, isa, indexes, ..
        } = inputs;
        let reg = li.reg;
        let class_mask = isa.reg_info().class(func.vreg_class(reg)).lane_mask;
        li.range.clear();
        li.clear_sub_ranges();

        // Step 1: minimal segments for every def. Several defs of `reg` on one instruction
        // share a value.
        for opref in func.reg_operands(reg) {
            let op = *func.operand(opref);
            if !op.is_def() && !op.reads_reg() {
                continue;
            }
            let def_idx = indexes.index_of(opref.inst).reg_slot(op.is_early_clobber());
            let subreg = op.subreg();
            if li.has_sub_ranges() || (subreg != 0 && track_sub_regs) {
                let sub_mask = if subreg != 0 {
                    isa.sub_reg_lane_mask(subreg)
                } else {
                    class_mask
                };
                // The first sub-register operand turns the main range into a subrange.
                if !li.has_sub_ranges() && !li.range.is_empty() {
                    li.create_sub_range_from_main(class_mask);
                }
                let is_def = op.is_def();
                li.refine_sub_ranges(
                    sub_mask,
                    |sr| {
                        if is_def {
                            sr.range.create_dead_def(def_idx);
                        }
                    },
                    func,
                    indexes,
                    isa,
                );
            }
            if op.is_def() && !li.has_sub_ranges() {
                li.range.create_dead_def(def_idx);
            }
        }

        // Partially undefined uses may have created empty subranges.
        li.remove_empty_sub_ranges();

        // Step 2: extend to all uses.
        if li.has_sub_ranges() {
            let mut undefs = Vec::new();
            for i in 0..li.subranges.len() {
                let mask = li.subranges[i].lane_mask;
                undefs.clear();
                li.compute_sub_range_undefs(&mut undefs, mask, func, indexes, isa);
                let mut calc = LiveRangeCalc::new();
                let range = &mut li.subranges[i].range;
                extend_to_uses_with(&mut calc, range, reg, mask, &undefs, inputs);
            }
            li.range.clear();
            self.construct_main_range_from_subranges(li, inputs);
        } else {
            self.calc.reset_live_out_map();
            self.extend_to_uses(&mut li.range, reg, LaneBitmask::ALL, &[], inputs);
        }
    }

    /// Rebuild the empty main range of `li` from its subranges.
    pub fn construct_main_range_from_subranges(
        &mut self,
        li: &mut LiveInterval,
        inputs: LivenessInputs,
    ) {
        debug_assert!(li.range.is_empty() && li.range.num_valnos() == 0);
        let mut defs: SmallVec<[SlotIndex; 8]> = SmallVec::new();
        for sr in &li.subranges {
            for (_, info) in sr.range.valnos() {
                if !info.is_unused() && !info.is_phi_def() {
                    defs.push(info.def);
                }
            }
        }
        defs.sort_unstable();
        for def in defs {
            li.range.create_dead_def(def);
        }
        self.calc.reset();
        let reg = li.reg;
        self.extend_to_uses(&mut li.range, reg, LaneBitmask::ALL, &[], inputs);
    }

    /// Extend `lr` to every operand of `reg` reading lanes in `mask`.
    pub fn extend_to_uses(
        &mut self,
        lr: &mut LiveRange,
        reg: VirtReg,
        mask: LaneBitmask,
        undefs: &[SlotIndex],
        inputs: LivenessInputs,
    ) {
        extend_to_uses_with(&mut self.calc, lr, reg, mask, undefs, inputs);
    }

    /// Create a dead def in `lr` for every def operand of `reg`.
    pub fn create_dead_defs(&mut self, lr: &mut LiveRange, reg: VirtReg, inputs: LivenessInputs) {
        let LivenessInputs { func, indexes, .. } = inputs;
        for opref in func.reg_defs(reg) {
            let op = func.operand(opref);
            lr.create_dead_def(indexes.index_of(opref.inst).reg_slot(op.is_early_clobber()));
        }
    }

    /// Extend `lr` to reach each of `points`.
    pub fn extend_to_points(
        &mut self,
        lr: &mut LiveRange,
        points: &[SlotIndex],
        undefs: &[SlotIndex],
        inputs: LivenessInputs,
    ) {
        self.calc.reset();
        for &p in points {
            self.calc.extend(lr, p, undefs, inputs);
        }
    }
}

/// The point where operand `idx` of `inst` reads its register.
///
/// Uses tied to an early-clobber def read the register at the early-clobber slot.
pub fn use_slot(inputs: LivenessInputs, inst: Inst, idx: usize) -> SlotIndex {
    let data = &inputs.func[inst];
    let op = &data.operands[idx];
    let ec = if op.is_def() {
        op.is_early_clobber()
    } else {
        data.ties
            .tied_def(idx)
            .is_some_and(|d| data.operands[d].is_early_clobber())
    };
    inputs.indexes.index_of(inst).reg_slot(ec)
}

fn extend_to_uses_with(
    calc: &mut LiveRangeCalc,
    lr: &mut LiveRange,
    reg: VirtReg,
    mask: LaneBitmask,
    undefs: &[SlotIndex],
    inputs: LivenessInputs,
) {
    let is_sub_range = !mask.is_all();
    let mut points: SmallVec<[SlotIndex; 16]> = SmallVec::new();
    for opref in inputs.func.reg_operands(reg) {
        let op = inputs.func.operand(opref);
        // A sub-register def reads the other lanes of the register, which only matters for the
        // main range.
        if !op.reads_reg() || (is_sub_range && op.is_def()) {
            continue;
        }
        if op.subreg() != 0 {
            let mut lanes = inputs.isa.sub_reg_lane_mask(op.subreg());
            if op.is_def() {
                lanes = !lanes;
            }
            if (lanes & mask).is_none() {
                continue;
            }
        }
        points.push(use_slot(inputs, opref.inst, opref.index));
    }
    // Reading the same register several times is fine, extending is idempotent.
    for p in points {
        calc.extend(lr, p, undefs, inputs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::flowgraph::ControlFlowGraph;
    use crate::ir::{Function, InstData, Operand, OperandFlags, Reg};
    use crate::isa::generic::{self, SUB_HI, SUB_LO};
    use crate::regalloc::slot_indexes::SlotIndexes;

    #[test]
    fn straight_line_interval() {
        let isa = generic::builder().finish();
        let mut func = Function::with_name("f");
        let v = func.new_vreg(isa.gpr_class());
        let t = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let i0 = func.append_inst(b0, InstData::iconst(v, 1));
        func.append_inst(b0, InstData::alu(t, v, v));
        let i2 = func.append_inst(b0, InstData::ret([Reg::Virt(v), Reg::Virt(t)]));
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let mut sx = SlotIndexes::new();
        sx.compute(&func);
        let inputs = LivenessInputs {
            func: &func,
            isa: &isa,
            cfg: &cfg,
            domtree: &domtree,
            indexes: &sx,
        };

        let mut calc = LiveIntervalCalc::new();
        let mut li = LiveInterval::new(v);
        calc.calculate(&mut li, false, inputs);
        assert_eq!(li.segments.len(), 1);
        assert_eq!(li.begin_index(), sx.index_of(i0).reg_slot(false));
        assert_eq!(li.end_index(), sx.index_of(i2).reg_slot(false));

        // Recomputing gives the same result.
        let before = li.clone();
        calc.calculate(&mut li, false, inputs);
        assert_eq!(li, before);

        let mut dead = LiveRange::new();
        calc.create_dead_defs(&mut dead, t, inputs);
        assert_eq!(dead.segments.len(), 1);
        assert!(dead.segments[0].end.is_dead());
    }

    #[test]
    fn sub_register_lanes() {
        let isa = generic::builder().gprs(4).pairs(true).track_sub_reg_liveness(true).finish();
        let pair = isa.pair_class().unwrap();
        let gpr = isa.gpr_class();
        let mut func = Function::with_name("lanes");
        let v = func.new_vreg(pair);
        let x = func.new_vreg(gpr);
        let b0 = func.append_block();
        let sub_def = |idx, undef: bool| {
            let mut flags = OperandFlags::DEF;
            if undef {
                flags |= OperandFlags::UNDEF;
            }
            Operand::Reg {
                reg: Reg::Virt(v),
                subreg: idx,
                flags,
            }
        };
        // v.lo = iconst 1 (undef); v.hi = iconst 2; x = copy v.lo; return v
        let mut d0 = InstData::iconst(v, 1);
        d0.operands[0] = sub_def(SUB_LO, true);
        let mut d1 = InstData::iconst(v, 2);
        d1.operands[0] = sub_def(SUB_HI, false);
        let mut c = InstData::copy(x, v);
        c.operands[1] = Operand::reg_use(v).with_subreg(SUB_LO);
        let i0 = func.append_inst(b0, d0);
        let i1 = func.append_inst(b0, d1);
        let i2 = func.append_inst(b0, c);
        let i3 = func.append_inst(b0, InstData::ret([Reg::Virt(v)]));

        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let mut sx = SlotIndexes::new();
        sx.compute(&func);
        let inputs = LivenessInputs {
            func: &func,
            isa: &isa,
            cfg: &cfg,
            domtree: &domtree,
            indexes: &sx,
        };
        let mut li = LiveInterval::new(v);
        LiveIntervalCalc::new().calculate(&mut li, true, inputs);
        li.verify().unwrap();

        assert_eq!(li.subranges.len(), 2);
        let lo = li.subranges.iter().find(|s| s.lane_mask == LaneBitmask(0b01)).unwrap();
        let hi = li.subranges.iter().find(|s| s.lane_mask == LaneBitmask(0b10)).unwrap();
        let r = |i| sx.index_of(i).reg_slot(false);
        assert_eq!(lo.range.begin_index(), r(i0));
        assert_eq!(lo.range.end_index(), r(i3));
        assert_eq!(hi.range.begin_index(), r(i1));
        assert_eq!(hi.range.end_index(), r(i3));
        assert!(lo.range.live_at(r(i2)));
        // The main range starts at the first def.
        assert_eq!(li.begin_index(), r(i0));
        assert_eq!(li.end_index(), r(i3));
    }
}
