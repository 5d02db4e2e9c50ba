//! The order in which physical registers are tried for a virtual register.

use crate::ir::{Function, PhysReg, VirtReg};
use crate::isa::TargetIsa;
use crate::regalloc::virt_reg_map::VirtRegMap;
use smallvec::SmallVec;

/// Allocation hints first, then the allocatable registers of the class in preference order.
#[derive(Clone, Debug)]
pub struct AllocationOrder {
    hints: SmallVec<[PhysReg; 2]>,
    order: SmallVec<[PhysReg; 16]>,
}

impl AllocationOrder {
    /// The allocation order of `vreg`.
    pub fn create(vreg: VirtReg, func: &Function, isa: &dyn TargetIsa, vrm: &VirtRegMap) -> Self {
        let class = isa.reg_info().class(func.vreg_class(vreg));
        let order: SmallVec<[PhysReg; 16]> = class
            .order
            .iter()
            .copied()
            .filter(|&r| isa.is_allocatable(r))
            .collect();
        let mut hints = SmallVec::new();
        if let Some(hint) = vrm.phys_hint(vreg) {
            if order.contains(&hint) {
                hints.push(hint);
            }
        }
        Self { hints, order }
    }

    /// Every candidate, hints first.
    pub fn iter(&self) -> impl Iterator<Item = PhysReg> + '_ {
        self.iter_limit(0)
    }

    /// The hints followed by at most `limit` registers of the class order. A limit of 0 means
    /// the whole order.
    pub fn iter_limit(&self, limit: usize) -> impl Iterator<Item = PhysReg> + '_ {
        let end = match limit {
            0 => self.order.len(),
            n => n.min(self.order.len()),
        };
        self.hints.iter().copied().chain(
            self.order[..end]
                .iter()
                .copied()
                .filter(move |r| !self.hints.contains(r)),
        )
    }

    /// Is `phys` one of the hints?
    pub fn is_hint(&self, phys: PhysReg) -> bool {
        self.hints.contains(&phys)
    }

    /// The allocatable registers of the class, without hints.
    pub fn order(&self) -> &[PhysReg] {
        &self.order
    }

    /// The hinted registers.
    pub fn hints(&self) -> &[PhysReg] {
        &self.hints
    }

    /// Is the class order empty?
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Reg;
    use crate::isa::generic;

    #[test]
    fn hints_come_first() {
        let isa = generic::builder().gprs(4).reserve(1).finish();
        let mut func = Function::with_name("f");
        let v = func.new_vreg(isa.gpr_class());
        let mut vrm = VirtRegMap::new();

        let plain = AllocationOrder::create(v, &func, &isa, &vrm);
        assert!(!plain.order().contains(&isa.gpr(1)));
        assert_eq!(plain.iter().count(), 3);

        vrm.set_hint(v, Reg::Phys(isa.gpr(3)));
        let hinted = AllocationOrder::create(v, &func, &isa, &vrm);
        let regs: Vec<_> = hinted.iter().collect();
        assert_eq!(regs[0], isa.gpr(3));
        assert_eq!(regs.len(), 3);
        assert!(hinted.is_hint(isa.gpr(3)));
        assert_eq!(hinted.iter_limit(1).count(), 2);

        // A reserved register is never a hint.
        vrm.set_hint(v, Reg::Phys(isa.gpr(1)));
        assert!(AllocationOrder::create(v, &func, &isa, &vrm).hints().is_empty());
    }
}
