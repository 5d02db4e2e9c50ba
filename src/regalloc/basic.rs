//! Basic register allocation.
//!
//! Virtual registers are assigned heaviest spill weight first. A register without a free
//! physical register takes one whose interference is all lighter and spillable, spilling the
//! interference. Otherwise it is spilled itself. Nothing is split, so this allocator mostly
//! serves as a baseline for the greedy one.

use crate::ir::{PhysReg, VirtReg};
use crate::regalloc::alloc_base::{RegAllocBase, Selection};
use crate::regalloc::allocation_order::AllocationOrder;
use crate::regalloc::env::RegAllocEnv;
use crate::regalloc::live_range_edit::{LiveRangeEdit, LiveRangeEditDelegate};
use crate::regalloc::reg_matrix::InterferenceKind;
use crate::regalloc::spiller::{InlineSpiller, Spiller};
use crate::timing::{self, Pass};
use crate::{fview, trace};
use core::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

// A queue entry. Heavier registers come first, and lower numbers win ties.
struct Weighted(f32, Reverse<VirtReg>);

impl PartialEq for Weighted {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Weighted {}

impl PartialOrd for Weighted {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Weighted {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

#[derive(Default)]
struct BasicState {
    queue: BinaryHeap<Weighted>,
}

impl BasicState {
    fn push(&mut self, vreg: VirtReg, env: &RegAllocEnv) {
        let weight = env.lis.interval(vreg).weight;
        trace!("Queueing {vreg} with weight {weight}");
        self.queue.push(Weighted(weight, Reverse(vreg)));
    }
}

impl LiveRangeEditDelegate for BasicState {
    fn can_erase_virt_reg(&mut self, env: &mut RegAllocEnv, vreg: VirtReg) -> bool {
        if env.vrm.has_phys(vreg) {
            env.matrix.unassign(env.lis.interval(vreg), env.vrm, env.isa);
            return true;
        }
        // Still queued. It is dropped when dequeued.
        false
    }

    fn will_shrink_virt_reg(&mut self, env: &mut RegAllocEnv, vreg: VirtReg) {
        if !env.vrm.has_phys(vreg) {
            return;
        }
        env.matrix.unassign(env.lis.interval(vreg), env.vrm, env.isa);
        self.push(vreg, env);
    }
}

/// The basic register allocator.
pub struct Basic {
    state: BasicState,
    spiller: Box<dyn Spiller + Send>,
}

impl Default for Basic {
    fn default() -> Self {
        Self::new()
    }
}

impl Basic {
    /// Create an allocator with the inline spiller.
    pub fn new() -> Self {
        Self {
            state: BasicState::default(),
            spiller: Box::new(InlineSpiller::new()),
        }
    }

    /// Use another spiller.
    pub fn set_spiller(&mut self, spiller: Box<dyn Spiller + Send>) {
        self.spiller = spiller;
    }

    /// Allocate every virtual register with a live interval.
    pub fn run(&mut self, env: &mut RegAllocEnv) {
        let _tt = timing::start(Pass::Assign);
        self.state.queue.clear();
        self.seed_live_regs(env);
        self.allocate_phys_regs(env);
        self.post_optimization(env);
    }

    fn spill(&mut self, vreg: VirtReg, new_vregs: &mut Vec<VirtReg>, env: &mut RegAllocEnv) {
        trace!("Spilling {vreg}");
        let mut edit = LiveRangeEdit::new(Some(vreg), Some(&mut self.state));
        self.spiller.spill(&mut edit, env);
        new_vregs.extend_from_slice(edit.regs());
    }

    // Spill everything assigned to `phys` that overlaps `vreg`, provided all of it is
    // spillable and lighter than `vreg`.
    fn spill_interferences(
        &mut self,
        vreg: VirtReg,
        phys: PhysReg,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> bool {
        let weight = env.lis.interval(vreg).weight;
        let mut intfs: Vec<VirtReg> = Vec::new();
        let units: Vec<_> = env.isa.reg_info().units(phys).collect();
        for unit in units {
            let li = env.lis.interval(vreg);
            let (regs, _) = env.matrix.interfering_vregs(li, unit, usize::MAX);
            for intf in regs {
                let intf_li = env.lis.interval(intf);
                if !intf_li.is_spillable() || intf_li.weight > weight {
                    return false;
                }
                if !intfs.contains(&intf) {
                    intfs.push(intf);
                }
            }
        }
        trace!(
            "Spilling {} interferences with {vreg} in {}",
            intfs.len(),
            env.isa.reg_info().display_reg(phys)
        );
        for intf in intfs {
            // Spilling an earlier one may have erased it.
            if !env.vrm.has_phys(intf) {
                continue;
            }
            env.matrix.unassign(env.lis.interval(intf), env.vrm, env.isa);
            env.stats.evictions += 1;
            self.spill(intf, new_vregs, env);
        }
        true
    }
}

impl RegAllocBase for Basic {
    fn enqueue(&mut self, vreg: VirtReg, env: &mut RegAllocEnv) {
        self.state.push(vreg, env);
    }

    fn dequeue(&mut self) -> Option<VirtReg> {
        self.state.queue.pop().map(|Weighted(_, Reverse(vreg))| vreg)
    }

    fn select_or_split(
        &mut self,
        vreg: VirtReg,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Selection {
        trace!("Selecting for {vreg}");
        let order = AllocationOrder::create(vreg, env.func, env.isa, env.vrm);
        let mut candidates = Vec::new();
        for phys in order.iter() {
            let kind = {
                let li = env.lis.interval(vreg);
                env.matrix.check_interference(li, phys, env.lis, fview!(env))
            };
            match kind {
                InterferenceKind::Free => return Selection::Phys(phys),
                InterferenceKind::VirtReg => candidates.push(phys),
                InterferenceKind::RegUnit | InterferenceKind::RegMask => {}
            }
        }
        for phys in candidates {
            if self.spill_interferences(vreg, phys, new_vregs, env) {
                return Selection::Phys(phys);
            }
        }
        if !env.lis.interval(vreg).is_spillable() {
            return Selection::Failed;
        }
        self.spill(vreg, new_vregs, env);
        Selection::Handled
    }

    fn spiller(&mut self) -> &mut dyn Spiller {
        &mut *self.spiller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::ir::{Function, InstData, Reg};
    use crate::isa::generic::{self, GenericIsa};
    use crate::regalloc::env::tests::TestEnv;

    // `a` lives long with two references. `b` is short and read three times.
    fn light_and_heavy(isa: &GenericIsa) -> (Function, VirtReg, VirtReg) {
        let mut func = Function::with_name("weights");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let x = func.new_vreg(isa.gpr_class());
        let y = func.new_vreg(isa.gpr_class());
        let z = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::iconst(b, 2));
        func.append_inst(b0, InstData::alu_imm(x, b, 1));
        func.append_inst(b0, InstData::alu_imm(y, b, 2));
        func.append_inst(b0, InstData::alu_imm(z, b, 3));
        func.append_inst(b0, InstData::ret([Reg::Virt(a)]));
        (func, a, b)
    }

    #[test]
    fn heaviest_first() {
        let mut heap = BinaryHeap::new();
        heap.push(Weighted(1.0, Reverse(VirtReg::new(0))));
        heap.push(Weighted(f32::INFINITY, Reverse(VirtReg::new(1))));
        heap.push(Weighted(3.0, Reverse(VirtReg::new(3))));
        heap.push(Weighted(3.0, Reverse(VirtReg::new(2))));
        let order: Vec<_> = core::iter::from_fn(|| heap.pop())
            .map(|Weighted(_, Reverse(v))| v.index())
            .collect();
        assert_eq!(order, [1, 2, 3, 0]);
    }

    #[test]
    fn lighter_interference_is_spilled() {
        let isa = generic::builder().gprs(1).finish();
        let r0 = isa.gpr(0);
        let (func, a, b) = light_and_heavy(&isa);
        let mut t = TestEnv::new(func, isa);
        let (wa, wb) = (t.lis.interval(a).weight, t.lis.interval(b).weight);
        assert!(wb > wa, "{wb} <= {wa}");
        let mut env = t.env();
        env.matrix.assign(env.lis.interval(a), r0, env.vrm, env.isa);

        let mut basic = Basic::new();
        let mut new_vregs = Vec::new();
        let sel = basic.select_or_split(b, &mut new_vregs, &mut env);
        assert_eq!(sel, Selection::Phys(r0));
        assert_eq!(env.stats.evictions, 1);
        assert!(!env.vrm.has_phys(a));
        assert!(!new_vregs.is_empty() || env.stats.remats > 0 || env.stats.spills > 0);
    }

    #[test]
    fn heavier_interference_stays() {
        let isa = generic::builder().gprs(1).finish();
        let r0 = isa.gpr(0);
        let (func, a, b) = light_and_heavy(&isa);
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();
        env.matrix.assign(env.lis.interval(b), r0, env.vrm, env.isa);

        let mut basic = Basic::new();
        let mut new_vregs = Vec::new();
        let sel = basic.select_or_split(a, &mut new_vregs, &mut env);
        assert_eq!(sel, Selection::Handled);
        assert_eq!(env.stats.evictions, 0);
        assert_eq!(env.vrm.phys(b), Some(r0));
    }

    #[test]
    fn pressure_is_resolved_by_spilling() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("three");
        let p = func.new_vreg(isa.gpr_class());
        let x = func.new_vreg(isa.gpr_class());
        let y = func.new_vreg(isa.gpr_class());
        let z = func.new_vreg(isa.gpr_class());
        let u = func.new_vreg(isa.gpr_class());
        let v = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(p, 7));
        func.append_inst(b0, InstData::alu_imm(x, p, 1));
        func.append_inst(b0, InstData::alu_imm(y, p, 2));
        func.append_inst(b0, InstData::alu_imm(z, p, 3));
        func.append_inst(b0, InstData::alu(u, x, y));
        func.append_inst(b0, InstData::alu(v, u, z));
        func.append_inst(b0, InstData::ret([Reg::Virt(v)]));
        let mut t = TestEnv::new(func, isa);
        let stats = {
            let mut env = t.env();
            Basic::new().run(&mut env);
            env.stats
        };
        assert!(stats.failed.is_empty(), "{stats:?}");
        assert!(stats.spills + stats.remats > 0, "{stats:?}");
        let unassigned: Vec<_> = t
            .lis
            .vregs()
            .filter(|&v| !t.func.reg_empty(v) && !t.vrm.has_phys(v))
            .collect();
        assert!(unassigned.is_empty(), "{unassigned:?}");
        t.func.verify_reg_lists().unwrap();
    }
}
