//! Entity references used by the allocator's IR.
//!
//! Instruction operands and analysis tables refer to blocks, instructions, registers and stack
//! slots through small `u32` index types rather than Rust references. There is a separate index
//! type for each kind of entity so the type system keeps them apart, and compact tables store
//! optional references as `PackedOption`.
//!
//! All entity references implement `Display` with a short prefix, so `v12` is a virtual register
//! and `block3` is a basic block.

use crate::entity::entity_impl;
use core::fmt;

/// An opaque reference to a basic block in a `Function`.
///
/// The numbering is stable but arbitrary; it does not follow the layout order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an instruction in a `Function`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// A virtual register.
///
/// Virtual registers are created by instruction selection in unbounded numbers and must all be
/// mapped to a physical register or a stack slot by the allocator.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtReg(u32);
entity_impl!(VirtReg, "v");

/// A physical register described by the target's `RegInfo`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysReg(u32);
entity_impl!(PhysReg, "p");

/// A register unit.
///
/// Register units are the smallest units of register allocation. Normally there is one unit per
/// register, but when registers alias, the aliasing is modeled with registers that cover
/// multiple units. Each unit can only hold one value at any program point.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegUnit(u32);
entity_impl!(RegUnit, "unit");

/// A register class of the target.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegClass(u32);
entity_impl!(RegClass, "rc");

/// A stack slot in the function's frame.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSlot(u32);
entity_impl!(StackSlot, "ss");

/// A register mask describing the physical registers clobbered by a call.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegMask(u32);
entity_impl!(RegMask, "mask");

/// Either kind of register that can appear in a register operand.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    /// A virtual register waiting to be allocated.
    Virt(VirtReg),
    /// A fixed physical register.
    Phys(PhysReg),
}

impl Reg {
    /// The virtual register, if this is one.
    pub fn virt(self) -> Option<VirtReg> {
        match self {
            Self::Virt(v) => Some(v),
            Self::Phys(_) => None,
        }
    }

    /// The physical register, if this is one.
    pub fn phys(self) -> Option<PhysReg> {
        match self {
            Self::Virt(_) => None,
            Self::Phys(p) => Some(p),
        }
    }

    /// Is this a virtual register?
    pub fn is_virtual(self) -> bool {
        matches!(self, Self::Virt(_))
    }
}

impl From<VirtReg> for Reg {
    fn from(v: VirtReg) -> Self {
        Self::Virt(v)
    }
}

impl From<PhysReg> for Reg {
    fn from(p: PhysReg) -> Self {
        Self::Phys(p)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Virt(v) => v.fmt(f),
            Self::Phys(p) => write!(f, "%{p}"),
        }
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    #[test]
    fn display() {
        assert_eq!(Block::new(0).to_string(), "block0");
        assert_eq!(VirtReg::new(12).to_string(), "v12");
        assert_eq!(Reg::from(PhysReg::new(3)).to_string(), "%p3");
        assert_eq!(Reg::from(VirtReg::new(1)).virt(), Some(VirtReg::new(1)));
        assert_eq!(Reg::from(PhysReg::new(1)).virt(), None);
    }
}
