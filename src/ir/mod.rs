//! Representation of functions in virtual register form.

mod entities;
mod function;
pub mod instructions;
pub mod layout;
pub mod operands;
pub mod reglists;

pub use crate::ir::entities::{
    Block, Inst, PhysReg, Reg, RegClass, RegMask, RegUnit, StackSlot, VirtReg,
};
pub use crate::ir::function::{BlockData, Function, RegMaskData, StackSlotData, VRegData};
pub use crate::ir::instructions::{InstData, Opcode, TieTable};
pub use crate::ir::layout::Layout;
pub use crate::ir::operands::{Operand, OperandFlags, SubRegIndex};
pub use crate::ir::reglists::OperandRef;
