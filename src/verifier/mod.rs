//! A verifier for ensuring that functions are well formed.
//! It verifies:
//!
//! Block integrity
//!
//! - All instructions reached from the `block_insts` iterator must belong to
//!   the block as reported by `inst_block()`.
//! - Every block must end in a terminator instruction, and no other instruction
//!   can be a terminator.
//! - Branch destinations must be blocks in the layout.
//!
//! Operand integrity
//!
//! - Virtual, physical and stack slot references must exist.
//! - Sub-register indices must be known to the target.
//! - Tied operands must pair a def with a use of the same register.
//! - The use/def lists must agree with the instruction operands.
//!
//! After allocation `verify_allocated` additionally checks that no virtual register operand is
//! left, and `liveness::verify_liveness` checks computed live intervals against the operands.

use crate::entity::EntityRef;
use crate::ir::{Block, Function, Inst, Operand, VirtReg};
use crate::isa::TargetIsa;
use crate::timing::{self, Pass};
use core::fmt::{self, Display, Formatter};
use thiserror::Error;

pub mod liveness;

/// A reference to any of the entities an error can be reported for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AnyEntity {
    /// The whole function.
    Function,
    /// A block.
    Block(Block),
    /// An instruction.
    Inst(Inst),
    /// A virtual register.
    VirtReg(VirtReg),
}

impl Display for AnyEntity {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Self::Function => f.write_str("function"),
            Self::Block(b) => b.fmt(f),
            Self::Inst(i) => i.fmt(f),
            Self::VirtReg(v) => v.fmt(f),
        }
    }
}

impl From<Block> for AnyEntity {
    fn from(b: Block) -> Self {
        Self::Block(b)
    }
}

impl From<Inst> for AnyEntity {
    fn from(i: Inst) -> Self {
        Self::Inst(i)
    }
}

impl From<VirtReg> for AnyEntity {
    fn from(v: VirtReg) -> Self {
        Self::VirtReg(v)
    }
}

/// A verifier error.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[error("{location}: {message}")]
pub struct VerifierError {
    /// The entity causing the verifier error.
    pub location: AnyEntity,
    /// The error message.
    pub message: String,
}

impl<L: Into<AnyEntity>, M: Into<String>> From<(L, M)> for VerifierError {
    fn from(items: (L, M)) -> Self {
        let (location, message) = items;
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Result of a step in the verification process.
///
/// Functions that return `VerifierStepResult` should also take a
/// mutable reference to `VerifierErrors` as argument in order to report
/// errors.
///
/// Here, `Ok` represents a step that **did not lead to a fatal error**,
/// meaning that the verification process may continue. However, other (non-fatal)
/// errors might have been reported through the previously mentioned `VerifierErrors`
/// argument.
pub type VerifierStepResult = Result<(), ()>;

/// Result of a verification operation.
///
/// Unlike `VerifierStepResult` which may be `Ok` while still having reported
/// errors, this type always returns `Err` if an error (fatal or not) was reported.
pub type VerifierResult<T> = Result<T, VerifierErrors>;

/// List of verifier errors.
#[derive(Error, Debug, Default, PartialEq, Eq, Clone)]
pub struct VerifierErrors(pub Vec<VerifierError>);

impl VerifierErrors {
    /// Return a new `VerifierErrors` struct.
    #[inline]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Return whether no errors were reported.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return whether one or more errors were reported.
    #[inline]
    pub fn has_error(&self) -> bool {
        !self.0.is_empty()
    }

    /// Return a `VerifierStepResult` that is fatal if at least one error was reported,
    /// and non-fatal otherwise.
    #[inline]
    pub fn as_result(&self) -> VerifierStepResult {
        if self.is_empty() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Report an error, adding it to the list of errors.
    pub fn report(&mut self, error: impl Into<VerifierError>) {
        self.0.push(error.into());
    }

    /// Report a fatal error and return `Err`.
    pub fn fatal(&mut self, error: impl Into<VerifierError>) -> VerifierStepResult {
        self.report(error);
        Err(())
    }

    /// Report a non-fatal error and return `Ok`.
    pub fn nonfatal(&mut self, error: impl Into<VerifierError>) -> VerifierStepResult {
        self.report(error);
        Ok(())
    }
}

impl From<Vec<VerifierError>> for VerifierErrors {
    fn from(v: Vec<VerifierError>) -> Self {
        Self(v)
    }
}

impl From<VerifierErrors> for VerifierResult<()> {
    fn from(errors: VerifierErrors) -> Self {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Display for VerifierErrors {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        for err in &self.0 {
            writeln!(f, "- {err}")?;
        }
        Ok(())
    }
}

/// Verify `func` before register allocation.
pub fn verify_function(func: &Function, isa: &dyn TargetIsa) -> VerifierResult<()> {
    let _tt = timing::start(Pass::Verifier);
    let mut errors = VerifierErrors::default();
    let verifier = Verifier { func, isa };
    let _ = verifier.run(&mut errors);
    errors.into()
}

/// Verify `func` after register allocation and rewriting.
pub fn verify_allocated(func: &Function, isa: &dyn TargetIsa) -> VerifierResult<()> {
    let _tt = timing::start(Pass::Verifier);
    let mut errors = VerifierErrors::default();
    let verifier = Verifier { func, isa };
    if verifier.run(&mut errors).is_ok() {
        let _ = verifier.no_virtual_regs(&mut errors);
    }
    errors.into()
}

struct Verifier<'a> {
    func: &'a Function,
    isa: &'a dyn TargetIsa,
}

impl<'a> Verifier<'a> {
    fn run(&self, errors: &mut VerifierErrors) -> VerifierStepResult {
        if self.func.layout.entry_block().is_none() {
            return errors.fatal((AnyEntity::Function, "function has no blocks"));
        }
        for block in self.func.layout.blocks() {
            self.block_integrity(block, errors)?;
            for inst in self.func.layout.block_insts(block) {
                self.instruction_integrity(inst, errors)?;
                self.tied_operands(inst, errors)?;
            }
        }
        if let Err(message) = self.func.verify_reg_lists() {
            return errors.fatal((AnyEntity::Function, message));
        }
        errors.as_result()
    }

    fn block_integrity(&self, block: Block, errors: &mut VerifierErrors) -> VerifierStepResult {
        let layout = &self.func.layout;
        let last = match layout.last_inst(block) {
            Some(inst) => inst,
            None => return errors.fatal((block, "block is empty")),
        };
        if !self.func[last].opcode.is_terminator() {
            return errors.fatal((last, format!("{block} doesn't end in a terminator")));
        }
        let mut seen_terminator = false;
        for inst in layout.block_insts(block) {
            if layout.inst_block(inst) != Some(block) {
                return errors.fatal((inst, format!("should belong to {block}")));
            }
            let is_term = self.func[inst].opcode.is_terminator();
            if seen_terminator && !is_term {
                return errors.fatal((inst, "instruction follows a terminator"));
            }
            seen_terminator |= is_term;
        }
        for (entry, &reg) in self.func.blocks[block].live_ins.iter().enumerate() {
            if reg.index() >= self.isa.reg_info().num_regs() {
                errors.report((block, format!("live-in {entry} is an invalid register {reg}")));
            }
        }
        Ok(())
    }

    fn instruction_integrity(&self, inst: Inst, errors: &mut VerifierErrors) -> VerifierStepResult {
        let data = &self.func[inst];
        let info = self.isa.reg_info();
        for (idx, op) in data.operands.iter().enumerate() {
            match *op {
                Operand::Reg { reg, subreg, .. } => {
                    if let Some(v) = reg.virt() {
                        if !self.func.vregs.is_valid(v) {
                            return errors.fatal((inst, format!("operand {idx} uses invalid {v}")));
                        }
                    }
                    if let Some(p) = reg.phys() {
                        if p.index() >= info.num_regs() {
                            return errors.fatal((inst, format!("operand {idx} uses invalid {p}")));
                        }
                    }
                    if subreg != 0 && subreg as usize > info.sub_reg_indices.len() {
                        let msg = format!("operand {idx} has unknown sub-register {subreg}");
                        errors.report((inst, msg));
                    }
                }
                Operand::Block(dest) => {
                    if !self.func.layout.is_block_inserted(dest) {
                        return errors.fatal((inst, format!("branch to {dest} not in layout")));
                    }
                }
                Operand::FrameIndex(ss) => {
                    if !self.func.stack_slots.is_valid(ss) {
                        return errors.fatal((inst, format!("operand {idx} uses invalid {ss}")));
                    }
                }
                Operand::RegMask(mask) => {
                    if !self.func.reg_masks.is_valid(mask) {
                        return errors.fatal((inst, format!("operand {idx} uses invalid {mask}")));
                    }
                }
                Operand::Imm(_) | Operand::JumpTable(_) => {}
            }
        }
        Ok(())
    }

    fn tied_operands(&self, inst: Inst, errors: &mut VerifierErrors) -> VerifierStepResult {
        let data = &self.func[inst];
        for (def, use_idx) in data.ties.iter() {
            let (d, u) = match (data.operands.get(def), data.operands.get(use_idx)) {
                (Some(d), Some(u)) => (d, u),
                _ => return errors.fatal((inst, format!("tie {def}/{use_idx} out of range"))),
            };
            if !d.is_def() || !u.is_use() {
                let msg = format!("tie {def}/{use_idx} must pair a def and a use");
                return errors.fatal((inst, msg));
            }
            if d.reg() != u.reg() {
                errors.report((inst, format!("tied operands {def} and {use_idx} differ")));
            }
        }
        Ok(())
    }

    fn no_virtual_regs(&self, errors: &mut VerifierErrors) -> VerifierStepResult {
        for block in self.func.layout.blocks() {
            for inst in self.func.layout.block_insts(block) {
                if let Some(v) = self.func[inst].operands.iter().find_map(Operand::virt_reg) {
                    errors.report((inst, format!("{v} left after allocation")));
                }
            }
        }
        errors.as_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstData, Reg};
    use crate::isa::generic;

    #[test]
    fn empty() {
        let isa = generic::builder().finish();
        let func = Function::with_name("f");
        let errors = verify_function(&func, &isa).unwrap_err();
        assert_eq!(errors.0[0].message, "function has no blocks");
    }

    #[test]
    fn missing_terminator() {
        let isa = generic::builder().finish();
        let mut func = Function::with_name("f");
        let v0 = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let i0 = func.append_inst(b0, InstData::iconst(v0, 1));
        let errors = verify_function(&func, &isa).unwrap_err();
        assert_eq!(errors.0[0].location, AnyEntity::Inst(i0));
        assert_eq!(errors.to_string(), "- inst0: block0 doesn't end in a terminator\n");
    }

    #[test]
    fn leftover_virtual_reg() {
        let isa = generic::builder().finish();
        let mut func = Function::with_name("f");
        let v0 = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(v0, 1));
        func.append_inst(b0, InstData::ret([Reg::Virt(v0)]));
        verify_function(&func, &isa).unwrap();
        assert!(verify_allocated(&func, &isa).is_err());
    }

    #[test]
    fn mismatched_tie() {
        let isa = generic::builder().finish();
        let mut func = Function::with_name("f");
        let v0 = func.new_vreg(isa.gpr_class());
        let v1 = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(v0, 1));
        func.append_inst(b0, InstData::alu_imm(v1, v0, 1).with_tie(0, 1));
        func.append_inst(b0, InstData::ret([Reg::Virt(v1)]));
        let errors = verify_function(&func, &isa).unwrap_err();
        assert_eq!(errors.0.len(), 1);
    }
}
