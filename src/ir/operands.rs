//! Instruction operands.

use crate::ir::{Block, PhysReg, Reg, RegMask, StackSlot, VirtReg};
use core::fmt;

/// Index of a sub-register of a register class, as defined by the target. The value 0 means the
/// full register.
pub type SubRegIndex = u8;

bitflags::bitflags! {
    /// Flags describing how a register operand accesses its register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct OperandFlags: u8 {
        /// The operand writes the register. Operands without this flag read it.
        const DEF = 1 << 0;
        /// The operand is implied by the opcode rather than encoded.
        const IMPLICIT = 1 << 1;
        /// This use is the last read of the register.
        const KILL = 1 << 2;
        /// This def is never read.
        const DEAD = 1 << 3;
        /// The value read doesn't matter, or a sub-register def doesn't preserve the other lanes.
        const UNDEF = 1 << 4;
        /// The def is written before the instruction reads its inputs.
        const EARLY_CLOBBER = 1 << 5;
        /// The use reads a value defined by the same instruction bundle.
        const INTERNAL_READ = 1 << 6;
    }
}

/// One operand of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// A register, optionally restricted to one of its sub-registers.
    Reg {
        /// The register accessed.
        reg: Reg,
        /// Sub-register index, or 0 for the full register.
        subreg: SubRegIndex,
        /// Access flags.
        flags: OperandFlags,
    },
    /// An immediate integer.
    Imm(i64),
    /// A branch destination.
    Block(Block),
    /// A stack slot used as a memory operand.
    FrameIndex(StackSlot),
    /// A jump table index.
    JumpTable(u32),
    /// The registers clobbered by a call.
    RegMask(RegMask),
}

impl Operand {
    /// A register use.
    pub fn reg_use(reg: impl Into<Reg>) -> Self {
        Self::Reg {
            reg: reg.into(),
            subreg: 0,
            flags: OperandFlags::empty(),
        }
    }

    /// A register def.
    pub fn reg_def(reg: impl Into<Reg>) -> Self {
        Self::Reg {
            reg: reg.into(),
            subreg: 0,
            flags: OperandFlags::DEF,
        }
    }

    /// An implicit register use, as found on calls and returns.
    pub fn implicit_use(reg: impl Into<Reg>) -> Self {
        Self::Reg {
            reg: reg.into(),
            subreg: 0,
            flags: OperandFlags::IMPLICIT,
        }
    }

    /// An implicit register def.
    pub fn implicit_def(reg: impl Into<Reg>) -> Self {
        Self::Reg {
            reg: reg.into(),
            subreg: 0,
            flags: OperandFlags::DEF | OperandFlags::IMPLICIT,
        }
    }

    /// Return this register operand restricted to sub-register `idx`.
    pub fn with_subreg(mut self, idx: SubRegIndex) -> Self {
        if let Self::Reg { subreg, .. } = &mut self {
            *subreg = idx;
        }
        self
    }

    /// Return this register operand with `extra` flags added.
    pub fn with_flags(mut self, extra: OperandFlags) -> Self {
        if let Self::Reg { flags, .. } = &mut self {
            *flags |= extra;
        }
        self
    }

    /// Is this a register operand?
    pub fn is_reg(&self) -> bool {
        matches!(self, Self::Reg { .. })
    }

    /// The register of a register operand.
    pub fn reg(&self) -> Option<Reg> {
        match *self {
            Self::Reg { reg, .. } => Some(reg),
            _ => None,
        }
    }

    /// The virtual register of a register operand.
    pub fn virt_reg(&self) -> Option<VirtReg> {
        self.reg().and_then(Reg::virt)
    }

    /// The physical register of a register operand.
    pub fn phys_reg(&self) -> Option<PhysReg> {
        self.reg().and_then(Reg::phys)
    }

    /// The sub-register index of a register operand, 0 otherwise.
    pub fn subreg(&self) -> SubRegIndex {
        match *self {
            Self::Reg { subreg, .. } => subreg,
            _ => 0,
        }
    }

    /// The flags of a register operand, empty otherwise.
    pub fn flags(&self) -> OperandFlags {
        match *self {
            Self::Reg { flags, .. } => flags,
            _ => OperandFlags::empty(),
        }
    }

    /// Is this a register def?
    pub fn is_def(&self) -> bool {
        self.flags().contains(OperandFlags::DEF)
    }

    /// Is this a register use?
    pub fn is_use(&self) -> bool {
        self.is_reg() && !self.is_def()
    }

    /// Is this an implicit register operand?
    pub fn is_implicit(&self) -> bool {
        self.flags().contains(OperandFlags::IMPLICIT)
    }

    /// Is this use the last read of its register?
    pub fn is_kill(&self) -> bool {
        self.flags().contains(OperandFlags::KILL)
    }

    /// Is this def never read?
    pub fn is_dead(&self) -> bool {
        self.flags().contains(OperandFlags::DEAD)
    }

    /// Is the undef flag set?
    pub fn is_undef(&self) -> bool {
        self.flags().contains(OperandFlags::UNDEF)
    }

    /// Is this an early-clobber def?
    pub fn is_early_clobber(&self) -> bool {
        self.flags().contains(OperandFlags::EARLY_CLOBBER)
    }

    /// Is this a read of a value defined earlier in the same bundle?
    pub fn is_internal_read(&self) -> bool {
        self.flags().contains(OperandFlags::INTERNAL_READ)
    }

    /// Does this operand read the current value of its register?
    ///
    /// Uses read the register unless marked undef. A sub-register def without the undef flag
    /// also reads the register, since the other lanes pass through unchanged.
    pub fn reads_reg(&self) -> bool {
        if !self.is_reg() || self.is_undef() || self.is_internal_read() {
            return false;
        }
        !self.is_def() || self.subreg() != 0
    }

    /// Replace the register of a register operand.
    pub(crate) fn set_reg(&mut self, new: Reg) {
        if let Self::Reg { reg, .. } = self {
            *reg = new;
        }
    }

    /// Replace the sub-register index of a register operand.
    pub(crate) fn set_subreg(&mut self, idx: SubRegIndex) {
        if let Self::Reg { subreg, .. } = self {
            *subreg = idx;
        }
    }

    /// Add or remove flags of a register operand.
    pub(crate) fn set_flag(&mut self, flag: OperandFlags, value: bool) {
        if let Self::Reg { flags, .. } = self {
            flags.set(flag, value);
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Reg { reg, subreg, flags } => {
                if flags.contains(OperandFlags::IMPLICIT) {
                    f.write_str(if flags.contains(OperandFlags::DEF) {
                        "implicit-def "
                    } else {
                        "implicit "
                    })?;
                }
                for (flag, name) in [
                    (OperandFlags::KILL, "killed "),
                    (OperandFlags::DEAD, "dead "),
                    (OperandFlags::UNDEF, "undef "),
                    (OperandFlags::EARLY_CLOBBER, "early-clobber "),
                ] {
                    if flags.contains(flag) {
                        f.write_str(name)?;
                    }
                }
                write!(f, "{reg}")?;
                if subreg != 0 {
                    write!(f, ".sub{subreg}")?;
                }
                Ok(())
            }
            Self::Imm(imm) => write!(f, "{imm}"),
            Self::Block(block) => write!(f, "{block}"),
            Self::FrameIndex(ss) => write!(f, "[{ss}]"),
            Self::JumpTable(jt) => write!(f, "jt{jt}"),
            Self::RegMask(mask) => write!(f, "{mask}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    #[test]
    fn reads() {
        let v = VirtReg::new(0);
        assert!(Operand::reg_use(v).reads_reg());
        assert!(!Operand::reg_def(v).reads_reg());
        assert!(Operand::reg_def(v).with_subreg(1).reads_reg());
        assert!(!Operand::reg_def(v)
            .with_subreg(1)
            .with_flags(OperandFlags::UNDEF)
            .reads_reg());
        assert!(!Operand::reg_use(v).with_flags(OperandFlags::UNDEF).reads_reg());
        assert!(!Operand::Imm(3).reads_reg());
    }

    #[test]
    fn display() {
        let v = VirtReg::new(4);
        assert_eq!(
            Operand::reg_def(v).with_flags(OperandFlags::DEAD).to_string(),
            "dead v4"
        );
        assert_eq!(Operand::reg_use(v).with_subreg(2).to_string(), "v4.sub2");
        assert_eq!(Operand::FrameIndex(StackSlot::new(1)).to_string(), "[ss1]");
    }
}
