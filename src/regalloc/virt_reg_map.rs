//! The virtual register map and the rewriter applying it.
//!
//! During allocation every virtual register is assigned either a physical register or a stack
//! slot, and registers created by splitting and spilling remember the original register they
//! came from. Once allocation is done, `VirtRegRewriter` replaces all virtual register operands
//! with their physical registers.

use crate::entity::packed_option::PackedOption;
use crate::entity::SecondaryMap;
use crate::ir::{Function, Inst, Opcode, PhysReg, Reg, StackSlot, VirtReg};
use crate::isa::TargetIsa;
use crate::regalloc::live_intervals::LiveIntervals;
use crate::timing::{self, Pass};
use crate::trace;

/// Assignments of virtual registers.
#[derive(Clone, Debug, Default)]
pub struct VirtRegMap {
    phys: SecondaryMap<VirtReg, PackedOption<PhysReg>>,
    stack: SecondaryMap<VirtReg, PackedOption<StackSlot>>,
    original: SecondaryMap<VirtReg, PackedOption<VirtReg>>,
    hints: SecondaryMap<VirtReg, Option<Reg>>,
}

impl VirtRegMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all assignments.
    pub fn clear(&mut self) {
        self.phys.clear();
        self.stack.clear();
        self.original.clear();
        self.hints.clear();
    }

    /// Does `vreg` have a physical register?
    pub fn has_phys(&self, vreg: VirtReg) -> bool {
        self.phys[vreg].is_some()
    }

    /// The physical register of `vreg`.
    pub fn phys(&self, vreg: VirtReg) -> Option<PhysReg> {
        self.phys[vreg].expand()
    }

    /// Assign `vreg` to `phys`. `vreg` must not be assigned.
    pub fn assign_virt_to_phys(&mut self, vreg: VirtReg, phys: PhysReg) {
        debug_assert!(self.phys[vreg].is_none(), "{vreg} is already assigned");
        self.phys[vreg] = phys.into();
    }

    /// Undo the physical register assignment of `vreg`.
    pub fn clear_virt(&mut self, vreg: VirtReg) {
        debug_assert!(self.phys[vreg].is_some(), "{vreg} is not assigned");
        self.phys[vreg] = None.into();
    }

    /// Assign `vreg` to the stack slot `slot`.
    pub fn assign_virt_to_stack_slot(&mut self, vreg: VirtReg, slot: StackSlot) {
        debug_assert!(self.stack[vreg].is_none(), "{vreg} already has a stack slot");
        self.stack[vreg] = slot.into();
    }

    /// The stack slot of `vreg`.
    pub fn stack_slot(&self, vreg: VirtReg) -> Option<StackSlot> {
        self.stack[vreg].expand()
    }

    /// Record that `vreg` was split or spilled off `parent`.
    pub fn set_is_split_from_reg(&mut self, vreg: VirtReg, parent: VirtReg) {
        let orig = self.original(parent);
        self.original[vreg] = orig.into();
    }

    /// The register that `vreg` descends from, or `vreg` itself.
    pub fn original(&self, vreg: VirtReg) -> VirtReg {
        self.original[vreg].expand().unwrap_or(vreg)
    }

    /// Was `vreg` created by splitting or spilling?
    pub fn is_derived(&self, vreg: VirtReg) -> bool {
        self.original[vreg].is_some()
    }

    /// Prefer allocating `vreg` to `hint`, or to the register `hint` is assigned.
    pub fn set_hint(&mut self, vreg: VirtReg, hint: Reg) {
        self.hints[vreg] = Some(hint);
    }

    /// The raw allocation hint of `vreg`.
    pub fn hint(&self, vreg: VirtReg) -> Option<Reg> {
        self.hints[vreg]
    }

    /// The physical register `vreg` would like to get.
    pub fn phys_hint(&self, vreg: VirtReg) -> Option<PhysReg> {
        match self.hints[vreg]? {
            Reg::Phys(p) => Some(p),
            Reg::Virt(v) => self.phys(v),
        }
    }

    /// Does `vreg` have a hint it didn't get?
    pub fn has_broken_hint(&self, vreg: VirtReg) -> bool {
        match (self.phys_hint(vreg), self.phys(vreg)) {
            (Some(h), Some(p)) => h != p,
            _ => false,
        }
    }
}

/// Replaces virtual registers with their assignments.
pub struct VirtRegRewriter<'a> {
    func: &'a mut Function,
    isa: &'a dyn TargetIsa,
    vrm: &'a VirtRegMap,
    lis: &'a mut LiveIntervals,
}

impl<'a> VirtRegRewriter<'a> {
    /// Create a rewriter.
    pub fn new(
        func: &'a mut Function,
        isa: &'a dyn TargetIsa,
        vrm: &'a VirtRegMap,
        lis: &'a mut LiveIntervals,
    ) -> Self {
        Self {
            func,
            isa,
            vrm,
            lis,
        }
    }

    /// Rewrite the function. Returns the number of identity copies removed.
    pub fn run(mut self) -> usize {
        let _tt = timing::start(Pass::Rewrite);
        self.add_live_ins();
        let mut removed = 0;
        let blocks: Vec<_> = self.func.layout.blocks().collect();
        for block in blocks {
            let insts: Vec<Inst> = self.func.layout.block_insts(block).collect();
            for inst in insts {
                self.rewrite_inst(inst);
                if self.remove_identity_copy(inst) {
                    removed += 1;
                }
            }
        }
        removed
    }

    fn rewrite_inst(&mut self, inst: Inst) {
        let info = self.isa.reg_info();
        for idx in 0..self.func[inst].operands.len() {
            let op = self.func[inst].operands[idx];
            let vreg = match op.virt_reg() {
                Some(v) => v,
                None => continue,
            };
            let phys = self
                .vrm
                .phys(vreg)
                .unwrap_or_else(|| panic!("{vreg} in {inst} was not allocated"));
            let phys = match op.subreg() {
                0 => phys,
                sub => info.sub_reg(phys, sub).unwrap_or_else(|| {
                    panic!("{} has no sub-register {sub}", info.display_reg(phys))
                }),
            };
            trace!("{inst}: {vreg} -> {}", info.display_reg(phys));
            self.func.set_operand_reg(inst, idx, Reg::Phys(phys));
            self.func.set_operand_subreg(inst, idx, 0);
        }
    }

    fn remove_identity_copy(&mut self, inst: Inst) -> bool {
        let data = &self.func[inst];
        if !data.opcode.is_copy() || data.operands.len() < 2 {
            return false;
        }
        let (d, s) = (&data.operands[0], &data.operands[1]);
        if d.reg() != s.reg() || d.reg().is_none() || d.subreg() != 0 || s.subreg() != 0 {
            return false;
        }
        if data.operands.len() > 2 {
            // Keep the implicit operands alive.
            self.func.remove_operand(inst, 1);
            self.func.remove_operand(inst, 0);
            self.func.set_opcode(inst, Opcode::Kill);
            trace!("Identity copy {inst} becomes a kill");
        } else {
            self.lis.remove_inst_from_maps(inst);
            self.func.remove_inst(inst);
            trace!("Deleting identity copy {inst}");
        }
        true
    }

    // Physical registers holding a virtual register live into a block become block live-ins.
    fn add_live_ins(&mut self) {
        let blocks: Vec<_> = self.func.layout.blocks().collect();
        for vreg in self.lis.vregs().collect::<Vec<_>>() {
            let phys = match self.vrm.phys(vreg) {
                Some(p) => p,
                None => continue,
            };
            let li = self.lis.interval(vreg);
            for &block in &blocks {
                if self.func.layout.entry_block() == Some(block) {
                    continue;
                }
                if li.live_at(self.lis.indexes().block_start(block)) {
                    let live_ins = &mut self.func.blocks[block].live_ins;
                    if !live_ins.contains(&phys) {
                        live_ins.push(phys);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::entity::EntityRef;
    use crate::flowgraph::ControlFlowGraph;
    use crate::ir::{InstData, Operand};
    use crate::isa::generic::{self, SUB_HI};
    use crate::regalloc::live_intervals::FuncView;

    #[test]
    fn originals_and_hints() {
        let mut vrm = VirtRegMap::new();
        let (v0, v1, v2) = (VirtReg::new(0), VirtReg::new(1), VirtReg::new(2));
        vrm.set_is_split_from_reg(v1, v0);
        vrm.set_is_split_from_reg(v2, v1);
        assert_eq!(vrm.original(v2), v0);
        assert!(!vrm.is_derived(v0));

        vrm.set_hint(v1, Reg::Virt(v0));
        assert_eq!(vrm.phys_hint(v1), None);
        vrm.assign_virt_to_phys(v0, PhysReg::new(3));
        assert_eq!(vrm.phys_hint(v1), Some(PhysReg::new(3)));
        vrm.assign_virt_to_phys(v1, PhysReg::new(2));
        assert!(vrm.has_broken_hint(v1));
        vrm.clear_virt(v1);
        assert!(!vrm.has_phys(v1));
    }

    #[test]
    fn rewrite_function() {
        let isa = generic::builder().gprs(4).pairs(true).finish();
        let mut func = Function::with_name("f");
        let p = func.new_vreg(isa.pair_class().unwrap());
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        func.append_inst(b0, InstData::iconst(p, 7));
        let mut hi = InstData::copy(a, p);
        hi.operands[1] = Operand::reg_use(p).with_subreg(SUB_HI);
        func.append_inst(b0, hi);
        func.append_inst(b0, InstData::copy(b, a));
        func.append_inst(b0, InstData::jump(b1));
        func.append_inst(b1, InstData::ret([Reg::Virt(b)]));

        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let mut lis = LiveIntervals::new();
        lis.compute(FuncView {
            func: &func,
            isa: &isa,
            cfg: &cfg,
            domtree: &domtree,
        });
        let mut vrm = VirtRegMap::new();
        let pair = isa.reg_info().class(isa.pair_class().unwrap()).order[0];
        let hi_reg = isa.reg_info().sub_reg(pair, SUB_HI).unwrap();
        vrm.assign_virt_to_phys(p, pair);
        vrm.assign_virt_to_phys(a, hi_reg);
        vrm.assign_virt_to_phys(b, hi_reg);

        let removed = VirtRegRewriter::new(&mut func, &isa, &vrm, &mut lis).run();
        // Both copies end up in the same register.
        assert_eq!(removed, 2);
        crate::verifier::verify_allocated(&func, &isa).unwrap();
        assert_eq!(func.layout.block_insts(b0).count(), 2);
        assert_eq!(func.blocks[b1].live_ins, vec![hi_reg]);
    }
}
