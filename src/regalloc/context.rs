//! Register allocator context.
//!
//! The `Context` struct contains data structures that should be preserved across invocations of
//! the register allocator. This doesn't preserve any data between functions, but it avoids
//! allocating data structures independently for each function being compiled.

use crate::block_frequency::BlockFrequencyInfo;
use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::Function;
use crate::isa::TargetIsa;
use crate::loop_analysis::LoopAnalysis;
use crate::regalloc::basic::Basic;
use crate::regalloc::env::RegAllocEnv;
use crate::regalloc::greedy::{Greedy, RegAllocStats};
use crate::regalloc::live_intervals::{FuncView, LiveIntervals};
use crate::regalloc::live_stacks::LiveStacks;
use crate::regalloc::reg_matrix::LiveRegMatrix;
use crate::regalloc::spill_weights::VirtRegAuxInfo;
use crate::regalloc::virt_reg_map::{VirtRegMap, VirtRegRewriter};
use crate::result::{RegAllocError, RegAllocResult};
use crate::settings::{self, Flags, RegallocAlgorithm};
use crate::timing::{self, Pass};
use crate::verifier::liveness::verify_liveness;
use crate::verifier::{verify_allocated, verify_function};

/// Persistent memory allocations for register allocation.
pub struct Context {
    flags: Flags,
    cfg: ControlFlowGraph,
    domtree: DominatorTree,
    loops: LoopAnalysis,
    freqs: BlockFrequencyInfo,
    lis: LiveIntervals,
    stacks: LiveStacks,
    matrix: LiveRegMatrix,
    vrm: VirtRegMap,
    greedy: Greedy,
    basic: Basic,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a new context with the default settings.
    ///
    /// This context should be reused for multiple functions in order to avoid repeated memory
    /// allocations.
    pub fn new() -> Self {
        Self::with_flags(Flags::new(settings::builder()))
    }

    /// Create a new context with `flags`.
    pub fn with_flags(flags: Flags) -> Self {
        Self {
            flags,
            cfg: ControlFlowGraph::new(),
            domtree: DominatorTree::new(),
            loops: LoopAnalysis::new(),
            freqs: BlockFrequencyInfo::new(),
            lis: LiveIntervals::new(),
            stacks: LiveStacks::new(),
            matrix: LiveRegMatrix::new(),
            vrm: VirtRegMap::new(),
            greedy: Greedy::new(),
            basic: Basic::new(),
        }
    }

    /// The settings used by this context.
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// The greedy allocator, for replacing its spiller or eviction policy.
    pub fn greedy_mut(&mut self) -> &mut Greedy {
        &mut self.greedy
    }

    /// The basic allocator, for replacing its spiller.
    pub fn basic_mut(&mut self) -> &mut Basic {
        &mut self.basic
    }

    /// The assignments of the last run.
    pub fn virt_reg_map(&self) -> &VirtRegMap {
        &self.vrm
    }

    /// The live intervals as they were left by the last run, before rewriting.
    pub fn live_intervals(&self) -> &LiveIntervals {
        &self.lis
    }

    /// Clear all data structures in this context.
    pub fn clear(&mut self) {
        self.cfg.clear();
        self.domtree.clear();
        self.lis.clear();
        self.stacks.clear();
        self.vrm.clear();
    }

    /// Allocate registers in `func`.
    ///
    /// Afterwards every virtual register operand in `func` is replaced by a physical register,
    /// and spilled registers are accessed through stack slots.
    pub fn run(
        &mut self,
        isa: &dyn TargetIsa,
        func: &mut Function,
    ) -> RegAllocResult<RegAllocStats> {
        let _tt = timing::start(Pass::Regalloc);
        self.clear();

        if self.flags.enable_verifier() {
            verify_function(func, isa)?;
        }
        check_allocatable(isa, func)?;

        // Pass: CFG analyses.
        self.cfg.compute(func);
        self.domtree.compute(func, &self.cfg);
        self.loops.compute(func, &self.cfg, &self.domtree);
        self.freqs
            .compute(func, &self.cfg, &self.domtree, &self.loops);

        // Pass: Liveness.
        let view = FuncView {
            func,
            isa,
            cfg: &self.cfg,
            domtree: &self.domtree,
        };
        self.lis.compute(view);
        if self.flags.enable_verifier() {
            verify_liveness(view, &self.lis)?;
        }
        self.matrix.init(isa.reg_info().num_units);
        VirtRegAuxInfo::new(func, isa, &self.cfg, &self.loops, &self.freqs)
            .calculate_spill_weights_and_hints(&mut self.lis, &mut self.vrm);

        // Pass: Allocation.
        let stats = {
            let mut env = RegAllocEnv {
                func: &mut *func,
                isa,
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
            };
            match self.flags.regalloc_algorithm() {
                RegallocAlgorithm::Greedy => self.greedy.run(&mut env),
                RegallocAlgorithm::Basic => self.basic.run(&mut env),
            }
            env.stats
        };
        if !stats.failed.is_empty() {
            log::warn!(
                "{}: {} registers could not be allocated",
                func.name,
                stats.failed.len()
            );
        }

        // Pass: Rewrite.
        let removed = VirtRegRewriter::new(func, isa, &self.vrm, &mut self.lis).run();
        log::debug!("{}: removed {removed} identity copies", func.name);

        if self.flags.enable_verifier() && stats.failed.is_empty() {
            verify_allocated(func, isa)?;
        }
        Ok(stats)
    }
}

// Every register class in use needs an allocatable register.
fn check_allocatable(isa: &dyn TargetIsa, func: &Function) -> RegAllocResult<()> {
    for vreg in func.vregs.keys() {
        if func.reg_empty(vreg) {
            continue;
        }
        let class = func.vreg_class(vreg);
        let data = isa.reg_info().class(class);
        if !data.allocatable || !data.order.iter().any(|&r| isa.is_allocatable(r)) {
            return Err(RegAllocError::Unallocatable { vreg, class });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstData, Reg};
    use crate::isa::generic;
    use crate::settings::Configurable;

    fn assert_send<T: Send>() {}

    #[test]
    fn context_is_send() {
        assert_send::<Context>();
    }

    #[test]
    fn straight_line_without_spills() {
        let _ = env_logger::builder().is_test(true).try_init();
        let isa = generic::builder().gprs(1).finish();
        let mut func = Function::with_name("straight");
        let v1 = func.new_vreg(isa.gpr_class());
        let v2 = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(v1, 1));
        func.append_inst(b0, InstData::alu(v2, v1, v1));
        func.append_inst(b0, InstData::ret([Reg::Virt(v2)]));

        let mut ctx = Context::new();
        let stats = ctx.run(&isa, &mut func).unwrap();
        assert_eq!(stats.spills, 0);
        assert_eq!(stats.reloads, 0);
        assert!(stats.failed.is_empty());
        assert_eq!(ctx.virt_reg_map().phys(v1), Some(isa.gpr(0)));
    }

    #[test]
    fn reserved_class_is_unallocatable() {
        let isa = generic::builder().gprs(1).reserve(0).finish();
        let mut func = Function::with_name("reserved");
        let v = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(v, 1));
        func.append_inst(b0, InstData::ret([Reg::Virt(v)]));

        let err = Context::new().run(&isa, &mut func).unwrap_err();
        assert_eq!(
            err,
            RegAllocError::Unallocatable {
                vreg: v,
                class: isa.gpr_class()
            }
        );
    }

    #[test]
    fn basic_allocator_is_selectable() {
        let _ = env_logger::builder().is_test(true).try_init();
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("pressure");
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

        let mut builder = settings::builder();
        builder.set("regalloc_algorithm", "basic").unwrap();
        let mut ctx = Context::with_flags(Flags::new(builder));
        let stats = ctx.run(&isa, &mut func).unwrap();
        assert!(stats.failed.is_empty(), "{stats:?}");
        assert!(stats.spills + stats.remats > 0, "{stats:?}");
        // Nothing is split by the basic allocator.
        assert_eq!(stats.region_splits + stats.block_splits + stats.local_splits, 0);
    }
}
