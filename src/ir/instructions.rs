//! Instruction opcodes and instruction data.
//!
//! The allocator only needs a handful of generic opcodes, each with the static properties the
//! spiller, splitter and rewriter query. Operands are kept in an ordered list; the conventional
//! operand order of each opcode is documented on the variant.

use crate::ir::operands::{Operand, OperandFlags};
use crate::ir::{Block, Reg, StackSlot, VirtReg};
use core::fmt;
use smallvec::SmallVec;

/// An instruction opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Does nothing.
    Nop,
    /// `dst = src`.
    Copy,
    /// `dst = imm`. Cheap enough to recompute anywhere.
    Iconst,
    /// Marks registers as killed without doing anything.
    Kill,
    /// `dst = undefined`.
    ImplicitDef,
    /// Store `src` to the stack slot operand.
    Spill,
    /// Load `dst` from the stack slot operand.
    Reload,
    /// `dst = a op b`, where `b` may be a register, an immediate or a stack slot.
    Alu,
    /// `dst = load [addr]`.
    Load,
    /// `store val, [addr]`.
    Store,
    /// A call. The first operand is the clobber mask, followed by implicit argument uses and
    /// implicit result defs.
    Call,
    /// Unconditional branch to the block operand.
    Jump,
    /// `brif cond, then_block, else_block`.
    Brif,
    /// Return, with implicit uses of the returned registers.
    Return,
}

impl Opcode {
    /// Is this a full register copy?
    pub fn is_copy(self) -> bool {
        self == Self::Copy
    }

    /// Does this instruction end a block?
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Jump | Self::Brif | Self::Return)
    }

    /// Can this instruction transfer control to another block of the function?
    pub fn is_branch(self) -> bool {
        matches!(self, Self::Jump | Self::Brif)
    }

    /// Is this a call?
    pub fn is_call(self) -> bool {
        self == Self::Call
    }

    /// Is this a return?
    pub fn is_return(self) -> bool {
        self == Self::Return
    }

    /// May this instruction read memory?
    pub fn may_load(self) -> bool {
        matches!(self, Self::Load | Self::Reload | Self::Call)
    }

    /// May this instruction write memory?
    pub fn may_store(self) -> bool {
        matches!(self, Self::Store | Self::Spill | Self::Call)
    }

    /// Does this instruction have effects beyond defining its register operands?
    pub fn has_side_effects(self) -> bool {
        matches!(self, Self::Call | Self::Store | Self::Spill) || self.is_terminator()
    }

    /// Is this instruction as cheap as a register move, so recomputing it beats a reload?
    pub fn is_as_cheap_as_a_move(self) -> bool {
        matches!(self, Self::Iconst | Self::ImplicitDef)
    }

    /// Can the register in operand `idx` be replaced by a stack slot operand?
    pub fn can_fold_stack_use(self, idx: usize) -> bool {
        self == Self::Alu && idx == 2
    }

    /// Is this a `Kill` pseudo instruction?
    pub fn is_kill(self) -> bool {
        self == Self::Kill
    }

    /// Is this an `ImplicitDef` pseudo instruction?
    pub fn is_implicit_def(self) -> bool {
        self == Self::ImplicitDef
    }

    /// The lowercase name of the opcode.
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Copy => "copy",
            Self::Iconst => "iconst",
            Self::Kill => "kill",
            Self::ImplicitDef => "implicit_def",
            Self::Spill => "spill",
            Self::Reload => "reload",
            Self::Alu => "alu",
            Self::Load => "load",
            Self::Store => "store",
            Self::Call => "call",
            Self::Jump => "jump",
            Self::Brif => "brif",
            Self::Return => "return",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maximum number of tied operand pairs per instruction.
pub const MAX_TIES: usize = 4;

/// Side table of tied operands: a def that must be assigned the same register as a use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TieTable {
    pairs: SmallVec<[(u8, u8); 2]>,
}

impl TieTable {
    /// Tie def operand `def` to use operand `use_idx`.
    pub fn tie(&mut self, def: usize, use_idx: usize) {
        assert!(self.pairs.len() < MAX_TIES, "too many tied operands");
        assert!(
            self.tied_use(def).is_none() && self.tied_def(use_idx).is_none(),
            "operand tied twice"
        );
        self.pairs.push((def as u8, use_idx as u8));
    }

    /// The use tied to def operand `def`.
    pub fn tied_use(&self, def: usize) -> Option<usize> {
        self.pairs
            .iter()
            .find(|p| usize::from(p.0) == def)
            .map(|p| usize::from(p.1))
    }

    /// The def tied to use operand `use_idx`.
    pub fn tied_def(&self, use_idx: usize) -> Option<usize> {
        self.pairs
            .iter()
            .find(|p| usize::from(p.1) == use_idx)
            .map(|p| usize::from(p.0))
    }

    /// The partner of operand `idx`, whichever side of a tie it is on.
    pub fn partner(&self, idx: usize) -> Option<usize> {
        self.tied_use(idx).or_else(|| self.tied_def(idx))
    }

    /// Is there any tie?
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate over `(def, use)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.pairs
            .iter()
            .map(|&(d, u)| (usize::from(d), usize::from(u)))
    }

    /// Fix up operand indices after operand `idx` has been removed.
    pub(crate) fn operand_removed(&mut self, idx: usize) {
        self.pairs
            .retain(|p| usize::from(p.0) != idx && usize::from(p.1) != idx);
        for p in &mut self.pairs {
            if usize::from(p.0) > idx {
                p.0 -= 1;
            }
            if usize::from(p.1) > idx {
                p.1 -= 1;
            }
        }
    }
}

/// The contents of one instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstData {
    /// The opcode.
    pub opcode: Opcode,
    /// Ordered operand list.
    pub operands: SmallVec<[Operand; 4]>,
    /// Tied operand pairs.
    pub ties: TieTable,
}

impl InstData {
    /// Create an instruction from an opcode and its operands.
    pub fn new(opcode: Opcode, operands: impl IntoIterator<Item = Operand>) -> Self {
        Self {
            opcode,
            operands: operands.into_iter().collect(),
            ties: TieTable::default(),
        }
    }

    /// `dst = copy src`.
    pub fn copy(dst: impl Into<Reg>, src: impl Into<Reg>) -> Self {
        Self::new(
            Opcode::Copy,
            [Operand::reg_def(dst), Operand::reg_use(src)],
        )
    }

    /// `dst = iconst imm`.
    pub fn iconst(dst: impl Into<Reg>, imm: i64) -> Self {
        Self::new(Opcode::Iconst, [Operand::reg_def(dst), Operand::Imm(imm)])
    }

    /// `dst = alu a, b`.
    pub fn alu(dst: impl Into<Reg>, a: impl Into<Reg>, b: impl Into<Reg>) -> Self {
        Self::new(
            Opcode::Alu,
            [
                Operand::reg_def(dst),
                Operand::reg_use(a),
                Operand::reg_use(b),
            ],
        )
    }

    /// `dst = alu a, imm`.
    pub fn alu_imm(dst: impl Into<Reg>, a: impl Into<Reg>, imm: i64) -> Self {
        Self::new(
            Opcode::Alu,
            [Operand::reg_def(dst), Operand::reg_use(a), Operand::Imm(imm)],
        )
    }

    /// `spill src, [slot]`.
    pub fn spill(src: impl Into<Reg>, slot: StackSlot) -> Self {
        Self::new(
            Opcode::Spill,
            [Operand::reg_use(src), Operand::FrameIndex(slot)],
        )
    }

    /// `dst = reload [slot]`.
    pub fn reload(dst: impl Into<Reg>, slot: StackSlot) -> Self {
        Self::new(
            Opcode::Reload,
            [Operand::reg_def(dst), Operand::FrameIndex(slot)],
        )
    }

    /// `jump dest`.
    pub fn jump(dest: Block) -> Self {
        Self::new(Opcode::Jump, [Operand::Block(dest)])
    }

    /// `brif cond, then_dest, else_dest`.
    pub fn brif(cond: impl Into<Reg>, then_dest: Block, else_dest: Block) -> Self {
        Self::new(
            Opcode::Brif,
            [
                Operand::reg_use(cond),
                Operand::Block(then_dest),
                Operand::Block(else_dest),
            ],
        )
    }

    /// `return uses...`.
    pub fn ret(uses: impl IntoIterator<Item = Reg>) -> Self {
        Self::new(Opcode::Return, uses.into_iter().map(Operand::implicit_use))
    }

    /// Tie def operand `def` to use operand `use_idx`, returning the instruction.
    pub fn with_tie(mut self, def: usize, use_idx: usize) -> Self {
        self.ties.tie(def, use_idx);
        self
    }

    /// Branch destinations, in operand order.
    pub fn branch_destinations(&self) -> impl Iterator<Item = Block> + '_ {
        self.operands.iter().filter_map(|op| match *op {
            Operand::Block(b) => Some(b),
            _ => None,
        })
    }

    /// If this is a full copy between registers, return `(dst, src)`.
    pub fn copy_regs(&self) -> Option<(Reg, Reg)> {
        if !self.opcode.is_copy() || self.operands.len() != 2 {
            return None;
        }
        let (d, s) = (&self.operands[0], &self.operands[1]);
        if d.subreg() != 0 || s.subreg() != 0 {
            return None;
        }
        Some((d.reg()?, s.reg()?))
    }

    /// Is this a full copy of one register into itself?
    pub fn is_identity_copy(&self) -> bool {
        self.copy_regs().is_some_and(|(d, s)| d == s)
    }

    /// If this is a stack slot access, return the register moved and the slot.
    pub fn stack_access(&self) -> Option<(Reg, StackSlot)> {
        if !matches!(self.opcode, Opcode::Spill | Opcode::Reload) {
            return None;
        }
        let reg = self.operands.first()?.reg()?;
        match self.operands.get(1)? {
            Operand::FrameIndex(ss) => Some((reg, *ss)),
            _ => None,
        }
    }

    /// Does this instruction read `vreg` in any lane?
    pub fn reads_virt_reg(&self, vreg: VirtReg) -> bool {
        self.operands
            .iter()
            .any(|op| op.virt_reg() == Some(vreg) && op.reads_reg())
    }

    /// Does this instruction write `vreg`?
    pub fn defines_virt_reg(&self, vreg: VirtReg) -> bool {
        self.operands
            .iter()
            .any(|op| op.virt_reg() == Some(vreg) && op.is_def())
    }

    /// Is every register def of this instruction marked dead?
    pub fn all_defs_dead(&self) -> bool {
        self.operands
            .iter()
            .filter(|op| op.is_def() && !op.is_implicit())
            .all(Operand::is_dead)
    }

    /// Can this instruction be deleted when its defs are unused?
    pub fn is_safe_to_delete(&self) -> bool {
        !self.opcode.has_side_effects() && !self.opcode.may_store()
    }

    /// Can this instruction be recomputed anywhere, with no register inputs and no effects?
    pub fn is_trivially_rematerializable(&self) -> bool {
        self.opcode.is_as_cheap_as_a_move()
            && !self.opcode.has_side_effects()
            && !self.opcode.may_load()
            && self
                .operands
                .iter()
                .filter(|op| op.is_reg() && !op.is_def())
                .all(|op| op.is_undef())
            && self.operands.iter().filter(|op| op.is_def()).count() == 1
    }

    /// The register defined by operand 0, if it is a def.
    pub fn dest(&self) -> Option<Reg> {
        self.operands.first().filter(|op| op.is_def())?.reg()
    }

    /// Set or clear `flag` on every register operand for `reg`.
    pub(crate) fn set_reg_flag(&mut self, reg: Reg, flag: OperandFlags, value: bool) {
        for op in &mut self.operands {
            if op.reg() == Some(reg) {
                op.set_flag(flag, value);
            }
        }
    }
}

impl fmt::Display for InstData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let defs = self
            .operands
            .iter()
            .take_while(|op| op.is_def() && !op.is_implicit())
            .count();
        for (i, op) in self.operands[..defs].iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{op}")?;
        }
        if defs > 0 {
            f.write_str(" = ")?;
        }
        f.write_str(self.opcode.name())?;
        for (i, op) in self.operands[defs..].iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            write!(f, "{op}")?;
            if let Some(def) = self.ties.tied_def(defs + i) {
                write!(f, "(tied-def {def})")?;
            }
        }
        Ok(())
    }
}
