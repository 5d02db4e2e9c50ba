//! The live register matrix.
//!
//! For every register unit, the matrix holds the union of the live intervals assigned to a
//! physical register containing the unit. Checking whether a virtual register can be assigned
//! a physical register then amounts to checking the unions of its units, the fixed unit live
//! ranges and the call clobbers.

use crate::entity::SecondaryMap;
use crate::ir::{PhysReg, RegUnit, VirtReg};
use crate::isa::TargetIsa;
use crate::regalloc::interval_union::{LiveIntervalUnion, Query};
use crate::regalloc::live_interval::LiveInterval;
use crate::regalloc::live_intervals::{FuncView, LiveIntervals};
use crate::regalloc::live_range::LiveRange;
use crate::regalloc::slot_indexes::SlotIndex;
use crate::regalloc::virt_reg_map::VirtRegMap;
use crate::trace;
use smallvec::SmallVec;

/// The kind of interference found by `LiveRegMatrix::check_interference`, cheapest to resolve
/// last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterferenceKind {
    /// No interference.
    Free,
    /// Interference with another virtual register, which may be evicted.
    VirtReg,
    /// Interference with a fixed use of a register unit.
    RegUnit,
    /// The register is clobbered by a call while live.
    RegMask,
}

/// Assigned live intervals per register unit.
#[derive(Default)]
pub struct LiveRegMatrix {
    unions: SecondaryMap<RegUnit, LiveIntervalUnion>,
    queries: SecondaryMap<RegUnit, Query>,
    // Bumped whenever virtual register intervals change behind the matrix's back.
    user_tag: u32,
}

impl LiveRegMatrix {
    /// Create an empty matrix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare for a target with `num_units` register units.
    pub fn init(&mut self, num_units: usize) {
        self.unions.clear();
        self.queries.clear();
        self.unions.resize(num_units);
        self.queries.resize(num_units);
        self.user_tag = self.user_tag.wrapping_add(1);
    }

    // Call `f` with each unit of `phys` and the part of `li` living in it.
    fn for_each_unit<'l>(
        li: &'l LiveInterval,
        phys: PhysReg,
        isa: &dyn TargetIsa,
        mut f: impl FnMut(RegUnit, &'l LiveRange) -> bool,
    ) -> bool {
        for (unit, lanes) in isa.reg_info().reg_units(phys) {
            if li.has_sub_ranges() {
                if let Some(sr) = li.subranges.iter().find(|sr| sr.lane_mask.overlaps(lanes)) {
                    if f(unit, &sr.range) {
                        return true;
                    }
                }
            } else if f(unit, &li.range) {
                return true;
            }
        }
        false
    }

    /// Assign `li` to `phys`, recording it in `vrm`.
    pub fn assign(
        &mut self,
        li: &LiveInterval,
        phys: PhysReg,
        vrm: &mut VirtRegMap,
        isa: &dyn TargetIsa,
    ) {
        trace!("Assigning {} to {}", li.reg, isa.reg_info().display_reg(phys));
        vrm.assign_virt_to_phys(li.reg, phys);
        let unions = &mut self.unions;
        Self::for_each_unit(li, phys, isa, |unit, range| {
            unions[unit].unify(li.reg, range);
            false
        });
    }

    /// Undo the assignment of `li`.
    pub fn unassign(&mut self, li: &LiveInterval, vrm: &mut VirtRegMap, isa: &dyn TargetIsa) {
        let phys = match vrm.phys(li.reg) {
            Some(p) => p,
            None => return,
        };
        trace!("Unassigning {} from {}", li.reg, isa.reg_info().display_reg(phys));
        vrm.clear_virt(li.reg);
        let unions = &mut self.unions;
        Self::for_each_unit(li, phys, isa, |unit, range| {
            unions[unit].extract(li.reg, range);
            false
        });
    }

    /// Is any virtual register assigned to a register overlapping `phys`?
    pub fn is_phys_reg_used(&self, phys: PhysReg, isa: &dyn TargetIsa) -> bool {
        isa.reg_info()
            .units(phys)
            .any(|unit| !self.unions[unit].is_empty())
    }

    /// Is `li` live across a call clobbering `phys`?
    pub fn check_reg_mask_interference(
        &self,
        li: &LiveInterval,
        phys: PhysReg,
        lis: &LiveIntervals,
        view: FuncView,
    ) -> bool {
        let info = view.isa.reg_info();
        match lis.check_reg_mask_interference(li, view.func, view.isa) {
            Some(clobbered) => clobbered.iter().any(|r| info.regs_overlap(r, phys)),
            None => false,
        }
    }

    /// Does `li` overlap a fixed live range of a unit of `phys`?
    pub fn check_reg_unit_interference(
        &self,
        li: &LiveInterval,
        phys: PhysReg,
        lis: &LiveIntervals,
        view: FuncView,
    ) -> bool {
        Self::for_each_unit(li, phys, view.isa, |unit, range| {
            lis.reg_unit(unit, view).overlaps(range)
        })
    }

    /// The query of `li` against the union of `unit`, brought up to date.
    pub fn query(&mut self, li: &LiveInterval, unit: RegUnit) -> (&mut Query, &LiveIntervalUnion) {
        let union = &self.unions[unit];
        let query = &mut self.queries[unit];
        query.init(self.user_tag, li.reg, union.tag());
        (query, union)
    }

    /// Up to `max` virtual registers assigned to `unit` that interfere with `li`, and whether
    /// that is all of them.
    pub fn interfering_vregs(
        &mut self,
        li: &LiveInterval,
        unit: RegUnit,
        max: usize,
    ) -> (SmallVec<[VirtReg; 4]>, bool) {
        let (query, union) = self.query(li, unit);
        let found = query.collect_interfering_vregs(union, &li.range, max);
        let found = SmallVec::from_slice(found);
        (found, query.seen_all_interferences())
    }

    /// Check whether `li` can be assigned to `phys`.
    pub fn check_interference(
        &mut self,
        li: &LiveInterval,
        phys: PhysReg,
        lis: &LiveIntervals,
        view: FuncView,
    ) -> InterferenceKind {
        if li.is_empty() {
            return InterferenceKind::Free;
        }
        if self.check_reg_mask_interference(li, phys, lis, view) {
            return InterferenceKind::RegMask;
        }
        if self.check_reg_unit_interference(li, phys, lis, view) {
            return InterferenceKind::RegUnit;
        }
        let user_tag = self.user_tag;
        let (unions, queries) = (&self.unions, &mut self.queries);
        let interferes = Self::for_each_unit(li, phys, view.isa, |unit, range| {
            let q = &mut queries[unit];
            q.init(user_tag, li.reg, unions[unit].tag());
            q.check_interference(&unions[unit], range)
        });
        if interferes {
            InterferenceKind::VirtReg
        } else {
            InterferenceKind::Free
        }
    }

    /// Does any virtual register assigned to a unit of `phys` overlap `[start, end)`?
    pub fn check_range_interference(
        &self,
        start: SlotIndex,
        end: SlotIndex,
        phys: PhysReg,
        isa: &dyn TargetIsa,
    ) -> bool {
        isa.reg_info()
            .units(phys)
            .any(|unit| self.unions[unit].overlapping(start, end).next().is_some())
    }

    /// The union of `unit`.
    pub fn union(&self, unit: RegUnit) -> &LiveIntervalUnion {
        &self.unions[unit]
    }

    /// The virtual register assigned to a unit of `phys` at `idx`, if any.
    pub fn one_vreg(&self, phys: PhysReg, idx: SlotIndex, isa: &dyn TargetIsa) -> Option<VirtReg> {
        isa.reg_info()
            .units(phys)
            .find_map(|unit| self.unions[unit].vreg_at(idx))
    }

    /// Invalidate cached queries after intervals of assigned registers changed.
    pub fn invalidate_virt_regs(&mut self) {
        self.user_tag = self.user_tag.wrapping_add(1);
    }

    /// Apply an index remapping to all unions.
    pub fn remap_indexes(&mut self, remap: impl Fn(SlotIndex) -> SlotIndex) {
        for union in self.unions.values_mut() {
            if !union.is_empty() {
                union.remap_indexes(&remap);
            }
        }
        self.invalidate_virt_regs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::flowgraph::ControlFlowGraph;
    use crate::ir::{Function, InstData, Opcode, Operand, Reg};
    use crate::isa::generic;

    #[test]
    fn interference_kinds() {
        let isa = generic::builder().gprs(3).callee_saved(1).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let c = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::iconst(b, 2));
        func.append_inst(b0, InstData::copy(isa.gpr(0), b));
        let mask = isa.call_clobber_mask(&mut func);
        func.append_inst(
            b0,
            InstData::new(
                Opcode::Call,
                [Operand::RegMask(mask), Operand::implicit_use(isa.gpr(0))],
            ),
        );
        func.append_inst(b0, InstData::iconst(c, 3));
        func.append_inst(b0, InstData::ret([Reg::Virt(a), Reg::Virt(c)]));

        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let view = FuncView {
            func: &func,
            isa: &isa,
            cfg: &cfg,
            domtree: &domtree,
        };
        let mut lis = LiveIntervals::new();
        lis.compute(view);
        let mut matrix = LiveRegMatrix::new();
        matrix.init(isa.reg_info().num_units);
        let mut vrm = VirtRegMap::new();

        // The callee-saved register comes last in the allocation order.
        let saved = *isa.reg_info().class(isa.gpr_class()).order.last().unwrap();
        let clobbered: Vec<_> = isa
            .reg_info()
            .class(isa.gpr_class())
            .order
            .iter()
            .copied()
            .filter(|&r| r != saved)
            .collect();

        let la = lis.interval(a);
        assert_eq!(
            matrix.check_interference(la, clobbered[0], &lis, view),
            InterferenceKind::RegMask
        );
        assert_eq!(
            matrix.check_interference(la, saved, &lis, view),
            InterferenceKind::Free
        );
        matrix.assign(la, saved, &mut vrm, &isa);
        assert_eq!(vrm.phys(a), Some(saved));
        assert!(matrix.is_phys_reg_used(saved, &isa));

        // `c` overlaps `a`.
        let lc = lis.interval(c);
        assert_eq!(
            matrix.check_interference(lc, saved, &lis, view),
            InterferenceKind::VirtReg
        );
        let unit = isa.reg_info().units(saved).next().unwrap();
        let (found, all) = matrix.interfering_vregs(lc, unit, 4);
        assert_eq!(found.as_slice(), &[a]);
        assert!(all);

        // `b` overlaps the fixed use of gpr0 only through its copy, which ends its range.
        let lb = lis.interval(b);
        assert_eq!(
            matrix.check_interference(lb, isa.gpr(0), &lis, view),
            InterferenceKind::Free
        );

        matrix.unassign(la, &mut vrm, &isa);
        assert!(!matrix.is_phys_reg_used(saved, &isa));
        assert_eq!(
            matrix.check_interference(lc, saved, &lis, view),
            InterferenceKind::Free
        );
    }
}
