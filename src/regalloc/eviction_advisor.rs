//! Eviction policy.
//!
//! When no register is free for a virtual register, the greedy allocator may take one from the
//! virtual registers already assigned to it. The advisor decides which physical register, if
//! any, is worth evicting for.

use crate::ir::{PhysReg, VirtReg};
use crate::regalloc::allocation_order::AllocationOrder;
use crate::regalloc::env::RegAllocEnv;
use crate::regalloc::greedy::{ExtraRegInfo, LiveRangeStage};
use crate::regalloc::live_interval::LiveInterval;
use crate::regalloc::reg_matrix::InterferenceKind;
use crate::{fview, trace};
use core::cmp::Ordering;
use rustc_hash::FxHashSet;

/// With this many interfering registers on one unit, one of them is probably too heavy.
pub const EVICT_INTERFERENCE_CUTOFF: usize = 10;

/// The cost of evicting the interference of a physical register.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EvictionCost {
    /// Number of satisfied hints broken, plus a penalty for breaking cascades.
    pub broken_hints: u32,
    /// The largest spill weight evicted.
    pub max_weight: f32,
}

impl EvictionCost {
    /// The cost nothing is cheaper than.
    pub fn max() -> Self {
        Self {
            broken_hints: u32::MAX,
            max_weight: 0.0,
        }
    }

    /// Is this the unbounded cost?
    pub fn is_max(&self) -> bool {
        self.broken_hints == u32::MAX
    }
}

impl PartialOrd for EvictionCost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.broken_hints.cmp(&other.broken_hints) {
            Ordering::Equal => self.max_weight.partial_cmp(&other.max_weight),
            ord => Some(ord),
        }
    }
}

/// Chooses what to evict.
pub trait EvictionAdvisor {
    /// Find a physical register in `order` whose interference `vreg` may evict.
    ///
    /// With `cheap_only`, only registers whose interference is lighter than `vreg` qualify, no
    /// hint may be broken and unused callee-saved registers are skipped.
    fn try_find_evictee_phys_reg(
        &self,
        vreg: VirtReg,
        order: &AllocationOrder,
        cheap_only: bool,
        fixed: &FxHashSet<VirtReg>,
        info: &ExtraRegInfo,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg>;

    /// May `vreg` evict the interference of its hint `phys`?
    fn can_evict_hint_interference(
        &self,
        vreg: VirtReg,
        phys: PhysReg,
        fixed: &FxHashSet<VirtReg>,
        info: &ExtraRegInfo,
        env: &mut RegAllocEnv,
    ) -> bool;
}

/// The default policy: evict lighter registers from older cascades.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultEvictionAdvisor {
    /// Refuse to evict a local register that could be reassigned elsewhere, when looking for a
    /// cheap register.
    pub enable_local_reassign: bool,
}

impl DefaultEvictionAdvisor {
    /// Create the default advisor.
    pub fn new(enable_local_reassign: bool) -> Self {
        Self {
            enable_local_reassign,
        }
    }

    // Should `a` evict `b`?
    fn should_evict(
        &self,
        a: &LiveInterval,
        is_hint: bool,
        b: &LiveInterval,
        breaks_hint: bool,
        info: &ExtraRegInfo,
    ) -> bool {
        let can_split = info.stage(b.reg) < LiveRangeStage::Spill;
        // Follow hints as long as the evictee can be split.
        if can_split && is_hint && !breaks_hint {
            return true;
        }
        a.weight > b.weight
    }

    // Can `vreg` be assigned a register other than `from` without eviction?
    fn can_reassign(&self, vreg: VirtReg, from: PhysReg, env: &mut RegAllocEnv) -> bool {
        let order = AllocationOrder::create(vreg, env.func, env.isa, env.vrm);
        let li = env.lis.interval(vreg);
        let found = order.iter().any(|phys| {
            phys != from
                && env.matrix.check_interference(li, phys, env.lis, fview!(env))
                    == InterferenceKind::Free
        });
        found
    }

    /// Can `vreg` evict everything interfering with it in `phys`, at a cost below `max_cost`?
    /// On success `max_cost` is updated to the cost.
    pub fn can_evict_interference_based_on_cost(
        &self,
        vreg: VirtReg,
        phys: PhysReg,
        is_hint: bool,
        max_cost: &mut EvictionCost,
        fixed: &FxHashSet<VirtReg>,
        info: &ExtraRegInfo,
        env: &mut RegAllocEnv,
    ) -> bool {
        let kind = {
            let li = env.lis.interval(vreg);
            env.matrix.check_interference(li, phys, env.lis, fview!(env))
        };
        if kind > InterferenceKind::VirtReg {
            return false;
        }
        let li = env.lis.interval(vreg);
        let is_local = li.is_empty() || env.lis.interval_in_one_block(&li.range).is_some();
        let class_size = |v: VirtReg| -> usize {
            AllocationOrder::create(v, env.func, env.isa, env.vrm).order().len()
        };
        let cascade = info.cascade_or_current_next(vreg);
        let mut cost = EvictionCost::default();
        let mut local_evictees = Vec::new();
        let units: Vec<_> = env.isa.reg_info().units(phys).collect();
        for unit in units {
            let (interfering, _) =
                env.matrix
                    .interfering_vregs(li, unit, EVICT_INTERFERENCE_CUTOFF);
            if interfering.len() >= EVICT_INTERFERENCE_CUTOFF {
                return false;
            }
            for &other in interfering.iter().rev() {
                if fixed.contains(&other) {
                    return false;
                }
                // Spill products can neither split nor spill.
                if info.stage(other) == LiveRangeStage::Done {
                    return false;
                }
                let intf = env.lis.interval(other);
                // Small enough ranges get infinite weight and may evict almost anything,
                // including unspillable ranges from a larger class.
                let urgent = !li.is_spillable()
                    && (intf.is_spillable() || class_size(vreg) < class_size(other));
                let other_cascade = info.cascade(other);
                if cascade == other_cascade {
                    return false;
                }
                if cascade < other_cascade {
                    if !urgent {
                        return false;
                    }
                    // Breaking a cascade is the last resort.
                    cost.broken_hints += 10;
                }
                let breaks_hint = env
                    .vrm
                    .phys_hint(other)
                    .is_some_and(|h| env.vrm.phys(other) == Some(h));
                cost.broken_hints += u32::from(breaks_hint);
                cost.max_weight = cost.max_weight.max(intf.weight);
                if !(cost < *max_cost) {
                    return false;
                }
                if urgent {
                    continue;
                }
                if !self.should_evict(li, is_hint, intf, breaks_hint, info) {
                    return false;
                }
                if !max_cost.is_max()
                    && is_local
                    && env.lis.interval_in_one_block(&intf.range).is_some()
                {
                    local_evictees.push(other);
                }
            }
        }
        // When only looking for a cheaper register, evicting a local range may just move the
        // problem around.
        for other in local_evictees {
            if !self.enable_local_reassign || !self.can_reassign(other, phys, env) {
                trace!(
                    "Not evicting local {other} from {}",
                    env.isa.reg_info().display_reg(phys)
                );
                return false;
            }
        }
        *max_cost = cost;
        true
    }

    fn is_unused_callee_saved_reg(phys: PhysReg, env: &RegAllocEnv) -> bool {
        env.isa.callee_saved_regs().contains(phys) && !env.matrix.is_phys_reg_used(phys, env.isa)
    }
}

impl EvictionAdvisor for DefaultEvictionAdvisor {
    fn try_find_evictee_phys_reg(
        &self,
        vreg: VirtReg,
        order: &AllocationOrder,
        cheap_only: bool,
        fixed: &FxHashSet<VirtReg>,
        info: &ExtraRegInfo,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg> {
        let mut best_cost = EvictionCost::max();
        if cheap_only {
            best_cost.broken_hints = 0;
            best_cost.max_weight = env.lis.interval(vreg).weight;
        }
        let mut best = None;
        for phys in order.iter() {
            // The first use of a callee-saved register has a cost.
            if cheap_only && Self::is_unused_callee_saved_reg(phys, env) {
                continue;
            }
            if !self.can_evict_interference_based_on_cost(
                vreg,
                phys,
                false,
                &mut best_cost,
                fixed,
                info,
                env,
            ) {
                continue;
            }
            best = Some(phys);
            if order.is_hint(phys) {
                break;
            }
        }
        best
    }

    fn can_evict_hint_interference(
        &self,
        vreg: VirtReg,
        phys: PhysReg,
        fixed: &FxHashSet<VirtReg>,
        info: &ExtraRegInfo,
        env: &mut RegAllocEnv,
    ) -> bool {
        let mut max_cost = EvictionCost::max();
        self.can_evict_interference_based_on_cost(
            vreg,
            phys,
            true,
            &mut max_cost,
            fixed,
            info,
            env,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, InstData, Reg};
    use crate::isa::generic;
    use crate::regalloc::env::tests::TestEnv;

    #[test]
    fn cost_ordering() {
        let cheap = EvictionCost {
            broken_hints: 0,
            max_weight: 5.0,
        };
        let hint = EvictionCost {
            broken_hints: 1,
            max_weight: 0.5,
        };
        assert!(cheap < hint);
        assert!(hint < EvictionCost::max());
        assert!(EvictionCost::max().is_max());
        assert!(cheap
            < EvictionCost {
                broken_hints: 0,
                max_weight: 6.0
            });
    }

    // One register, `a` assigned to it, `b` overlapping `a`.
    fn setup() -> (TestEnv, VirtReg, VirtReg) {
        let isa = generic::builder().gprs(1).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let c = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::iconst(b, 2));
        func.append_inst(b0, InstData::alu(c, b, b));
        func.append_inst(b0, InstData::alu(c, c, b));
        func.append_inst(b0, InstData::alu(c, c, b));
        func.append_inst(b0, InstData::ret([Reg::Virt(a), Reg::Virt(c)]));
        let mut t = TestEnv::new(func, isa);
        let r0 = t.isa.gpr(0);
        let mut env = t.env();
        env.matrix.assign(env.lis.interval(a), r0, env.vrm, env.isa);
        (t, a, b)
    }

    #[test]
    fn heavier_registers_evict_lighter_ones() {
        let (mut t, a, b) = setup();
        let r0 = t.isa.gpr(0);
        let mut env = t.env();
        let mut info = ExtraRegInfo::default();
        info.grow(env.func.vregs.len());
        assert!(env.lis.interval(b).weight > env.lis.interval(a).weight);

        let advisor = DefaultEvictionAdvisor::default();
        let fixed = FxHashSet::default();
        let order = AllocationOrder::create(b, env.func, env.isa, env.vrm);
        assert_eq!(
            advisor.try_find_evictee_phys_reg(b, &order, false, &fixed, &info, &mut env),
            Some(r0)
        );
        // The lighter register may not evict the heavier one.
        let order = AllocationOrder::create(a, env.func, env.isa, env.vrm);
        env.matrix.unassign(env.lis.interval(a), env.vrm, env.isa);
        env.matrix.assign(env.lis.interval(b), r0, env.vrm, env.isa);
        assert_eq!(
            advisor.try_find_evictee_phys_reg(a, &order, false, &fixed, &info, &mut env),
            None
        );
    }

    #[test]
    fn cascades_and_fixed_registers_block_eviction() {
        let (mut t, a, b) = setup();
        let r0 = t.isa.gpr(0);
        let mut env = t.env();
        let mut info = ExtraRegInfo::default();
        info.grow(env.func.vregs.len());
        let advisor = DefaultEvictionAdvisor::default();

        let mut fixed = FxHashSet::default();
        fixed.insert(a);
        assert!(!advisor.can_evict_hint_interference(b, r0, &fixed, &info, &mut env));

        // An evictee from the same cascade can't be evicted again.
        let fixed = FxHashSet::default();
        let cascade = info.get_or_assign_new_cascade(b);
        info.set_cascade(a, cascade);
        assert!(!advisor.can_evict_hint_interference(b, r0, &fixed, &info, &mut env));

        // Spill products are never evicted.
        let mut info = ExtraRegInfo::default();
        info.grow(env.func.vregs.len());
        info.set_stage(a, LiveRangeStage::Done);
        assert!(!advisor.can_evict_hint_interference(b, r0, &fixed, &info, &mut env));
    }
}
