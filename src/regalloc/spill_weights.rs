//! Spill weights and copy hints.
//!
//! The spill weight of an interval estimates how expensive it would be to spill: every
//! instruction reading or writing the register costs its block frequency, and the sum is
//! normalized by the size of the interval so long sparse ranges are cheap to spill. Copies to
//! and from other registers become allocation hints.

use crate::block_frequency::BlockFrequencyInfo;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function, Reg, VirtReg};
use crate::isa::TargetIsa;
use crate::loop_analysis::LoopAnalysis;
use crate::regalloc::live_interval::LiveInterval;
use crate::regalloc::live_intervals::LiveIntervals;
use crate::regalloc::slot_indexes::SlotIndex;
use crate::regalloc::virt_reg_map::VirtRegMap;
use crate::timing::{self, Pass};
use crate::trace;
use rustc_hash::FxHashMap;

/// Normalize a use/def frequency sum by the size of the interval it was collected over.
///
/// The constant bias keeps very short intervals from getting enormous weights; it stands for
/// about 25 instructions.
pub fn normalize_spill_weight(use_def_freq: f32, size: u64, instr_dist: u64) -> f32 {
    use_def_freq / (size as f32 + 25.0 * (instr_dist * 4) as f32)
}

// Result of scanning the instructions of an interval.
struct WeightCalc {
    total: f32,
    hint: Option<Reg>,
    num_instrs: u32,
}

/// Computes spill weights and allocation hints.
pub struct VirtRegAuxInfo<'a> {
    func: &'a Function,
    isa: &'a dyn TargetIsa,
    cfg: &'a ControlFlowGraph,
    loops: &'a LoopAnalysis,
    freqs: &'a BlockFrequencyInfo,
}

impl<'a> VirtRegAuxInfo<'a> {
    /// Create a calculator for `func`.
    pub fn new(
        func: &'a Function,
        isa: &'a dyn TargetIsa,
        cfg: &'a ControlFlowGraph,
        loops: &'a LoopAnalysis,
        freqs: &'a BlockFrequencyInfo,
    ) -> Self {
        Self {
            func,
            isa,
            cfg,
            loops,
            freqs,
        }
    }

    /// Compute the weight and hint of every interval.
    pub fn calculate_spill_weights_and_hints(&self, lis: &mut LiveIntervals, vrm: &mut VirtRegMap) {
        let _tt = timing::start(Pass::SpillWeights);
        let vregs: Vec<VirtReg> = lis.vregs().collect();
        for vreg in vregs {
            self.calculate_spill_weight_and_hint(vreg, lis, vrm);
        }
    }

    /// Compute the weight of the interval of `vreg` and record its best copy hint.
    pub fn calculate_spill_weight_and_hint(
        &self,
        vreg: VirtReg,
        lis: &mut LiveIntervals,
        vrm: &mut VirtRegMap,
    ) {
        let orig = vrm.original(vreg);
        if orig != vreg && lis.has_interval(orig) && !lis.interval(orig).is_spillable() {
            lis.interval_mut(vreg).mark_not_spillable();
        }

        let li = lis.interval(vreg);
        let calc = self.scan(li, lis, None);
        if let Some(hint) = calc.hint {
            vrm.set_hint(vreg, hint);
        }
        let li = lis.interval(vreg);
        if !li.is_spillable() {
            return;
        }

        let zero_length = li.is_zero_length(lis.indexes());
        let mut live_at_mask = Vec::new();
        if zero_length && !li.find_indexes_live_at(lis.reg_mask_slots(), &mut live_at_mask) {
            trace!("{vreg} is too short to spill");
            lis.interval_mut(vreg).mark_not_spillable();
            return;
        }

        let mut total = calc.total;
        if calc.hint.is_some() {
            total *= 1.01;
        }
        if self.is_rematerializable(li, lis, vrm) {
            total *= 0.5;
        }
        let weight = normalize_spill_weight(total, li.size(), lis.indexes().instr_dist());
        trace!("{vreg} weight {weight} over {} instructions", calc.num_instrs);
        lis.interval_mut(vreg).weight = weight;
    }

    /// The weight `li` would have if it were split down to `[start, end]` inside one block.
    ///
    /// Local splitting uses this to compare the weight of a split product against the weights of
    /// the interference it has to get past. Nothing is recorded.
    pub fn future_weight(
        &self,
        li: &LiveInterval,
        start: SlotIndex,
        end: SlotIndex,
        lis: &LiveIntervals,
        vrm: &VirtRegMap,
    ) -> f32 {
        if !li.is_spillable() {
            return f32::INFINITY;
        }
        let calc = self.scan(li, lis, Some((start, end)));
        let mut total = calc.total;
        if calc.hint.is_some() {
            total *= 1.01;
        }
        if self.is_rematerializable(li, lis, vrm) {
            total *= 0.5;
        }
        // The copies entering and leaving the artifact.
        let block = lis.indexes().block_at(end);
        total += 2.0 * block.map_or(1.0, |b| self.freqs.relative_freq(b));
        normalize_spill_weight(
            total,
            start.distance(end).max(0) as u64,
            lis.indexes().instr_dist(),
        )
    }

    fn scan(
        &self,
        li: &LiveInterval,
        lis: &LiveIntervals,
        bounds: Option<(SlotIndex, SlotIndex)>,
    ) -> WeightCalc {
        let vreg = li.reg;
        let indexes = lis.indexes();
        let spillable = li.is_spillable();
        let mut calc = WeightCalc {
            total: 0.0,
            hint: None,
            num_instrs: 0,
        };
        let mut hint_weights: FxHashMap<Reg, f32> = FxHashMap::default();
        let mut best: Option<(Reg, f32)> = None;
        let mut cur_block: Option<(Block, bool)> = None;

        for inst in self.func.reg_insts(vreg) {
            let idx = match indexes.try_index_of(inst) {
                Some(idx) => idx,
                None => continue,
            };
            if let Some((start, end)) = bounds {
                if idx < start.base() || idx > end {
                    continue;
                }
            }
            calc.num_instrs += 1;
            let data = &self.func[inst];
            if data.is_identity_copy() || data.opcode.is_implicit_def() {
                continue;
            }
            let reads = data.reads_virt_reg(vreg);
            let writes = data.defines_virt_reg(vreg);

            let mut weight = 1.0;
            if spillable {
                let block = match self.func.inst_block(inst) {
                    Some(b) => b,
                    None => continue,
                };
                let exiting = match cur_block {
                    Some((b, exiting)) if b == block => exiting,
                    _ => {
                        let exiting = self.is_loop_exiting(block);
                        cur_block = Some((block, exiting));
                        exiting
                    }
                };
                weight = (u32::from(reads) + u32::from(writes)) as f32
                    * self.freqs.relative_freq(block);
                // Looks like the update of an induction variable.
                if writes && exiting && li.live_at(indexes.block_end(block).prev_slot()) {
                    weight *= 3.0;
                }
                calc.total += weight;
            }

            let other = match data.copy_regs() {
                Some((d, s)) if d == Reg::Virt(vreg) => s,
                Some((d, s)) if s == Reg::Virt(vreg) => d,
                _ => continue,
            };
            if let Reg::Phys(p) = other {
                if !self.isa.is_allocatable(p) {
                    continue;
                }
            }
            let w = hint_weights.entry(other).or_insert(0.0);
            *w += weight;
            let candidate = (other, *w);
            best = match best {
                Some(b) if !Self::better_hint(candidate, b) => Some(b),
                _ => Some(candidate),
            };
        }
        calc.hint = best.map(|(r, _)| r);
        calc
    }

    // Physical hints beat virtual ones, then heavier hints win.
    fn better_hint(a: (Reg, f32), b: (Reg, f32)) -> bool {
        let (ap, bp) = (matches!(a.0, Reg::Phys(_)), matches!(b.0, Reg::Phys(_)));
        if ap != bp {
            return ap;
        }
        if a.0 == b.0 {
            return true;
        }
        a.1 > b.1
    }

    fn is_loop_exiting(&self, block: Block) -> bool {
        self.loops.innermost_loop(block).is_some()
            && self
                .cfg
                .succ_iter(block)
                .any(|succ| self.loops.loops_exited(block, succ) > 0)
    }

    /// Is every value of `li` defined by a rematerializable instruction, possibly through
    /// split copies of the same original register?
    pub fn is_rematerializable(
        &self,
        li: &LiveInterval,
        lis: &LiveIntervals,
        vrm: &VirtRegMap,
    ) -> bool {
        let indexes = lis.indexes();
        let orig = vrm.original(li.reg);
        for (_, info) in li.valnos() {
            if info.is_unused() {
                continue;
            }
            if info.is_phi_def() {
                return false;
            }
            let mut reg = li.reg;
            let mut def = info.def;
            let mut inst = match indexes.instruction_at(def) {
                Some(i) => i,
                None => return false,
            };
            while let Some((dst, src)) = self.func[inst].copy_regs() {
                if dst != Reg::Virt(reg) {
                    return false;
                }
                reg = match src {
                    Reg::Virt(v) if vrm.original(v) == orig && lis.has_interval(v) => v,
                    _ => return false,
                };
                let src_vn = match lis.interval(reg).query(def).value_in() {
                    Some(vn) => vn,
                    None => return false,
                };
                let src_info = &lis.interval(reg)[src_vn];
                if src_info.is_phi_def() {
                    return false;
                }
                def = src_info.def;
                inst = match indexes.instruction_at(def) {
                    Some(i) => i,
                    None => return false,
                };
            }
            if !self.func[inst].is_trivially_rematerializable() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::ir::InstData;
    use crate::isa::generic;
    use crate::regalloc::live_intervals::FuncView;

    struct Analyses {
        cfg: ControlFlowGraph,
        domtree: DominatorTree,
        loops: LoopAnalysis,
        freqs: BlockFrequencyInfo,
        lis: LiveIntervals,
    }

    fn analyze(func: &Function, isa: &dyn TargetIsa) -> Analyses {
        let cfg = ControlFlowGraph::with_function(func);
        let domtree = DominatorTree::with_function(func, &cfg);
        let mut loops = LoopAnalysis::new();
        loops.compute(func, &cfg, &domtree);
        let mut freqs = BlockFrequencyInfo::new();
        freqs.compute(func, &cfg, &domtree, &loops);
        let mut lis = LiveIntervals::new();
        lis.compute(FuncView {
            func,
            isa,
            cfg: &cfg,
            domtree: &domtree,
        });
        Analyses {
            cfg,
            domtree,
            loops,
            freqs,
            lis,
        }
    }

    #[test]
    fn loop_uses_weigh_more() {
        let isa = generic::builder().gprs(4).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let c = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::iconst(b, 2));
        func.append_inst(b0, InstData::iconst(c, 3));
        func.append_inst(b0, InstData::jump(b1));
        func.append_inst(b1, InstData::alu(b, b, b));
        func.append_inst(b1, InstData::brif(c, b1, b2));
        func.append_inst(b2, InstData::ret([Reg::Virt(a), Reg::Virt(b)]));

        let mut an = analyze(&func, &isa);
        let mut vrm = VirtRegMap::new();
        VirtRegAuxInfo::new(&func, &isa, &an.cfg, &an.loops, &an.freqs)
            .calculate_spill_weights_and_hints(&mut an.lis, &mut vrm);
        let (wa, wb) = (an.lis.interval(a).weight, an.lis.interval(b).weight);
        assert!(wa > 0.0 && wa.is_finite());
        assert!(wb > wa, "{wb} <= {wa}");
        let _ = &an.domtree;
    }

    #[test]
    fn copy_hints_prefer_physical() {
        let isa = generic::builder().gprs(4).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::copy(b, a));
        func.append_inst(b0, InstData::copy(isa.gpr(2), a));
        func.append_inst(b0, InstData::ret([Reg::Virt(b), isa.gpr(2).into()]));

        let mut an = analyze(&func, &isa);
        let mut vrm = VirtRegMap::new();
        VirtRegAuxInfo::new(&func, &isa, &an.cfg, &an.loops, &an.freqs)
            .calculate_spill_weights_and_hints(&mut an.lis, &mut vrm);
        assert_eq!(vrm.hint(a), Some(Reg::Phys(isa.gpr(2))));
        assert_eq!(vrm.hint(b), Some(Reg::Virt(a)));
    }

    #[test]
    fn short_ranges_are_unspillable() {
        let isa = generic::builder().gprs(4).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let c = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(c, 3));
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::alu_imm(b, a, 2));
        func.append_inst(b0, InstData::ret([Reg::Virt(b), Reg::Virt(c)]));

        let mut an = analyze(&func, &isa);
        let mut vrm = VirtRegMap::new();
        VirtRegAuxInfo::new(&func, &isa, &an.cfg, &an.loops, &an.freqs)
            .calculate_spill_weights_and_hints(&mut an.lis, &mut vrm);
        // `a` dies in the instruction after its def.
        assert!(!an.lis.interval(a).is_spillable());
        assert!(an.lis.interval(c).is_spillable());
    }

    #[test]
    fn remat_halves_weight() {
        let isa = generic::builder().gprs(4).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let x = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(x, 5));
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::alu_imm(b, x, 1));
        func.append_inst(b0, InstData::iconst(x, 6));
        func.append_inst(b0, InstData::ret([Reg::Virt(a), Reg::Virt(b), Reg::Virt(x)]));

        let an = analyze(&func, &isa);
        let vrm = VirtRegMap::new();
        let aux = VirtRegAuxInfo::new(&func, &isa, &an.cfg, &an.loops, &an.freqs);
        assert!(aux.is_rematerializable(an.lis.interval(a), &an.lis, &vrm));
        assert!(!aux.is_rematerializable(an.lis.interval(b), &an.lis, &vrm));
        assert!(aux.is_rematerializable(an.lis.interval(x), &an.lis, &vrm));
    }

    #[test]
    fn normalization() {
        let short = normalize_spill_weight(2.0, 64, 16);
        let long = normalize_spill_weight(2.0, 6400, 16);
        assert!(short > long);
        assert_eq!(normalize_spill_weight(0.0, 10, 16), 0.0);
    }
}
