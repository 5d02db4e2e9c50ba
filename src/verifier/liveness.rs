//! Liveness verifier.

use crate::ir::{Inst, VirtReg};
use crate::regalloc::live_interval::LiveInterval;
use crate::regalloc::live_intervals::{FuncView, LiveIntervals};
use crate::timing::{self, Pass};
use crate::verifier::{VerifierErrors, VerifierResult, VerifierStepResult};

/// Verify the live intervals of `view.func`.
///
/// - Every virtual register with operands must have an interval, and the interval must be
///   well formed.
/// - Every value that isn't a phi must be defined by an instruction that defines the register.
/// - Every def must start a value at its def slot.
/// - Every reading use must be reached by a value.
/// - When a value is live into a reachable block, it must be live out of every reachable
///   predecessor, as the same value unless it is a phi defined at the block.
///
/// Intervals are not checked for minimality, which would mean recomputing them.
pub fn verify_liveness(view: FuncView, lis: &LiveIntervals) -> VerifierResult<()> {
    let _tt = timing::start(Pass::Verifier);
    let mut errors = VerifierErrors::default();
    let verifier = LivenessVerifier { view, lis };
    for vreg in view.func.vregs.keys() {
        if view.func.reg_empty(vreg) {
            continue;
        }
        if !lis.has_interval(vreg) {
            errors.report((vreg, "has operands but no live interval"));
            continue;
        }
        // Errors in one interval don't stop the others from being checked.
        let _ = verifier.check_interval(lis.interval(vreg), &mut errors);
    }
    if errors.is_empty() {
        let _ = verifier.check_insts(&mut errors);
    }
    errors.into()
}

struct LivenessVerifier<'a> {
    view: FuncView<'a>,
    lis: &'a LiveIntervals,
}

impl<'a> LivenessVerifier<'a> {
    fn check_interval(&self, li: &LiveInterval, errors: &mut VerifierErrors) -> VerifierStepResult {
        if let Err(message) = li.verify() {
            return errors.fatal((li.reg, message));
        }
        let indexes = self.lis.indexes();
        for (vn, info) in li.valnos() {
            if info.is_unused() || info.is_phi_def() {
                continue;
            }
            let defines = indexes
                .instruction_at(info.def)
                .filter(|&inst| self.view.func.is_inst_inserted(inst))
                .is_some_and(|inst| self.defines(inst, li.reg));
            if !defines {
                let msg = format!("{vn} at {} has no defining instruction", info.def);
                errors.report((li.reg, msg));
            }
        }
        self.check_live_ins(li, errors)
    }

    fn check_live_ins(&self, li: &LiveInterval, errors: &mut VerifierErrors) -> VerifierStepResult {
        let indexes = self.lis.indexes();
        for block in self.view.func.layout.blocks() {
            if !self.view.domtree.is_reachable(block) {
                continue;
            }
            let start = indexes.block_start(block);
            let vn = match li.vn_info_at(start) {
                Some(vn) => vn,
                None => continue,
            };
            let is_phi = li[vn].def == start;
            for pred in self.view.cfg.pred_iter(block) {
                if !self.view.domtree.is_reachable(pred.block) {
                    continue;
                }
                let out = li.vn_info_before(indexes.block_end(pred.block));
                match out {
                    None => {
                        let msg =
                            format!("{} live into {block} but not out of {}", li.reg, pred.block);
                        return errors.fatal((pred.inst, msg));
                    }
                    Some(out) if !is_phi && out != vn => {
                        let msg = format!(
                            "{} enters {block} as {vn} but leaves {} as {out}",
                            li.reg, pred.block
                        );
                        return errors.fatal((pred.inst, msg));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    fn check_insts(&self, errors: &mut VerifierErrors) -> VerifierStepResult {
        let indexes = self.lis.indexes();
        for block in self.view.func.layout.blocks() {
            if !self.view.domtree.is_reachable(block) {
                continue;
            }
            for inst in self.view.func.layout.block_insts(block) {
                let idx = indexes.index_of(inst);
                for (n, op) in self.view.func[inst].operands.iter().enumerate() {
                    let vreg = match op.virt_reg() {
                        Some(vreg) => vreg,
                        None => continue,
                    };
                    let li = self.lis.interval(vreg);
                    if op.reads_reg() && li.query(idx).value_in().is_none() {
                        errors.report((inst, format!("{vreg} is not live at use {n}")));
                    }
                    if op.is_def() {
                        let slot = idx.reg_slot(op.is_early_clobber());
                        let starts = li.vn_info_at(slot).is_some_and(|vn| li[vn].def == slot);
                        if !starts {
                            errors.report((inst, format!("def {n} of {vreg} starts no value")));
                        }
                    }
                }
            }
        }
        errors.as_result()
    }

    fn defines(&self, inst: Inst, vreg: VirtReg) -> bool {
        self.view.func[inst]
            .operands
            .iter()
            .any(|op| op.is_def() && op.virt_reg() == Some(vreg))
    }
}
