//! The driver loop shared by the register allocators.
//!
//! An allocator provides a priority queue and `select_or_split`. The loop here seeds the queue
//! with every live virtual register, dequeues them one at a time, assigns what was selected and
//! queues what was split off, until the queue runs dry.

use crate::ir::{PhysReg, VirtReg};
use crate::regalloc::allocation_order::AllocationOrder;
use crate::regalloc::env::RegAllocEnv;
use crate::regalloc::spiller::Spiller;
use crate::trace;

/// The outcome of `select_or_split`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// Assign this register.
    Phys(PhysReg),
    /// The register was requeued, split or spilled.
    Handled,
    /// Nothing worked.
    Failed,
}

/// A register allocator built on the shared driver loop.
pub trait RegAllocBase {
    /// Add `vreg` to the queue.
    fn enqueue(&mut self, vreg: VirtReg, env: &mut RegAllocEnv);

    /// The next register to allocate.
    fn dequeue(&mut self) -> Option<VirtReg>;

    /// Pick a physical register for `vreg`, or change it and its neighbors so that it can be
    /// retried. Registers created by splitting or spilling go into `new_vregs`.
    fn select_or_split(
        &mut self,
        vreg: VirtReg,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Selection;

    /// The spiller, for its deferred work.
    fn spiller(&mut self) -> &mut dyn Spiller;

    /// Queue every virtual register that has uses or defs.
    fn seed_live_regs(&mut self, env: &mut RegAllocEnv) {
        let vregs: Vec<VirtReg> = env.lis.vregs().collect();
        for vreg in vregs {
            if env.func.reg_empty(vreg) {
                continue;
            }
            self.enqueue(vreg, env);
        }
    }

    /// Allocate until the queue is empty.
    fn allocate_phys_regs(&mut self, env: &mut RegAllocEnv) {
        while let Some(vreg) = self.dequeue() {
            if !env.lis.has_interval(vreg) {
                continue;
            }
            debug_assert!(!env.vrm.has_phys(vreg), "{vreg} is already assigned");
            // Unused registers appear when the spiller coalesces snippets.
            if env.func.reg_empty(vreg) {
                trace!("Dropping unused {vreg}");
                env.lis.remove_interval(vreg);
                continue;
            }
            env.matrix.invalidate_virt_regs();
            let mut split_vregs = Vec::new();
            match self.select_or_split(vreg, &mut split_vregs, env) {
                Selection::Phys(phys) => {
                    trace!("Assigning {vreg} to {}", env.isa.reg_info().display_reg(phys));
                    env.matrix.assign(env.lis.interval(vreg), phys, env.vrm, env.isa);
                }
                Selection::Handled => {}
                Selection::Failed => out_of_registers(vreg, env),
            }
            for reg in split_vregs {
                if !env.lis.has_interval(reg) || env.vrm.has_phys(reg) {
                    continue;
                }
                if env.func.reg_empty(reg) {
                    trace!("Not queueing unused {reg}");
                    env.lis.remove_interval(reg);
                    continue;
                }
                self.enqueue(reg, env);
            }
        }
    }

    /// Finish deferred spills and delete the rematerialized defs nobody reads.
    fn post_optimization(&mut self, env: &mut RegAllocEnv) {
        self.spiller().post_optimization(env);
        // Rematerialized defs are kept until every remat from them is done.
        let dead: Vec<_> = env.dead_remats.drain(..).collect();
        for inst in dead {
            if env.func.is_inst_inserted(inst) {
                env.remove_inst(inst);
            }
        }
    }
}

// Keep the output well formed when nothing fits.
fn out_of_registers(vreg: VirtReg, env: &mut RegAllocEnv) {
    let class = env.func.vreg_class(vreg);
    let order = AllocationOrder::create(vreg, env.func, env.isa, env.vrm);
    let phys = order
        .order()
        .first()
        .copied()
        .or_else(|| env.isa.reg_info().class(class).order.first().copied());
    log::warn!(
        "Ran out of registers allocating {vreg} in class {}",
        env.isa.reg_info().class(class).name
    );
    env.stats.failed.push(vreg);
    if let Some(phys) = phys {
        // Not through the matrix, since the register is already occupied there.
        env.vrm.assign_virt_to_phys(vreg, phys);
    }
}
