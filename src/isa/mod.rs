//! Target description.
//!
//! The allocator needs to know the register file of the target, which registers are reserved or
//! preserved across calls, and a few instruction properties that depend on the target. This is
//! all provided through the `TargetIsa` trait.
//!
//! The `generic` module builds configurable targets for testing:
//!
//! ```ignore
//! let isa = isa::generic::builder().gprs(4).callee_saved(1).finish();
//! ```

use crate::ir::{Block, Function, Inst, InstData, PhysReg, RegClass, RegMask, SubRegIndex};

pub mod generic;
pub mod registers;

pub use crate::isa::registers::{LaneBitmask, RegInfo, RegSet};

/// Methods that are specialized to a target ISA.
pub trait TargetIsa: Send + Sync {
    /// Get the name of this ISA.
    fn name(&self) -> &'static str;

    /// Get a data structure describing the registers of this ISA.
    fn reg_info(&self) -> &RegInfo;

    /// Registers that are never allocated.
    fn reserved_regs(&self) -> &RegSet;

    /// Registers a callee must preserve.
    fn callee_saved_regs(&self) -> &RegSet;

    /// The registers clobbered by a call with clobber mask `mask`.
    fn call_clobbers(&self, func: &Function, mask: RegMask) -> RegSet {
        func.reg_masks[mask].clobbered().iter().copied().collect()
    }

    /// Lanes covered by sub-register index `idx`.
    fn sub_reg_lane_mask(&self, idx: SubRegIndex) -> LaneBitmask {
        self.reg_info().sub_reg_lane_mask(idx)
    }

    /// Compose sub-register indices: the `b` sub-register of the `a` sub-register.
    ///
    /// Returns `None` when the composition doesn't exist.
    fn compose_sub_reg(&self, a: SubRegIndex, b: SubRegIndex) -> Option<SubRegIndex> {
        match (a, b) {
            (0, b) => Some(b),
            (a, 0) => Some(a),
            _ => None,
        }
    }

    /// Can operand `idx` of `inst` be replaced with a stack slot reference?
    fn can_fold_memory_operand(&self, inst: &InstData, idx: usize) -> bool {
        inst.opcode.can_fold_stack_use(idx)
            && inst.ties.partner(idx).is_none()
            && inst.operands[idx].subreg() == 0
    }

    /// The last instruction in `block` before which new copies can be inserted, or `None` when
    /// they can be appended at the end of the block.
    ///
    /// Code inserted at the end of a block must stay in front of the terminators.
    fn last_split_point(&self, func: &Function, block: Block) -> Option<Inst> {
        func.layout
            .first_terminator(block, |inst| func[inst].opcode.is_terminator())
    }

    /// Should liveness be tracked per lane for registers of `rc`?
    fn should_track_sub_reg_liveness(&self, rc: RegClass) -> bool {
        let _ = rc;
        false
    }

    /// Is `reg` allocatable at all?
    fn is_allocatable(&self, reg: PhysReg) -> bool {
        !self.reserved_regs().contains(reg)
    }
}
