//! Cursor for inserting and removing instructions.
//!
//! A `FuncCursor` tracks a position in a function's layout and inserts new instructions at that
//! position, keeping the use/def lists of the function up to date.

use crate::ir::{Block, Function, Inst, InstData};

/// The possible positions of a cursor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CursorPosition {
    /// Cursor is not pointing anywhere. No instructions can be inserted.
    Nowhere,
    /// Cursor is pointing at an existing instruction.
    /// New instructions will be inserted *before* the current instruction.
    At(Inst),
    /// Cursor is before the beginning of a block. New instructions are inserted at the top of
    /// the block. Calling `next_inst()` will move to the first instruction in the block.
    Before(Block),
    /// Cursor is pointing after the end of a block.
    /// New instructions will be appended to the block.
    After(Block),
}

/// A cursor editing a function.
pub struct FuncCursor<'f> {
    pos: CursorPosition,

    /// The referenced function.
    pub func: &'f mut Function,
}

impl<'f> FuncCursor<'f> {
    /// Create a new `FuncCursor` pointing nowhere.
    pub fn new(func: &'f mut Function) -> Self {
        Self {
            pos: CursorPosition::Nowhere,
            func,
        }
    }

    /// Get the current cursor position.
    pub fn position(&self) -> CursorPosition {
        self.pos
    }

    /// Set the current position.
    pub fn set_position(&mut self, pos: CursorPosition) {
        self.pos = pos;
    }

    /// Rebuild this cursor positioned at `inst`.
    pub fn at_inst(mut self, inst: Inst) -> Self {
        self.goto_inst(inst);
        self
    }

    /// Rebuild this cursor positioned after `inst`.
    pub fn after_inst(mut self, inst: Inst) -> Self {
        self.goto_after_inst(inst);
        self
    }

    /// Rebuild this cursor positioned at the top of `block`.
    pub fn at_top(mut self, block: Block) -> Self {
        self.goto_top(block);
        self
    }

    /// Rebuild this cursor positioned at the bottom of `block`.
    pub fn at_bottom(mut self, block: Block) -> Self {
        self.goto_bottom(block);
        self
    }

    /// Get the block corresponding to the current position.
    pub fn current_block(&self) -> Option<Block> {
        use self::CursorPosition::*;
        match self.pos {
            Nowhere => None,
            At(inst) => self.func.layout.inst_block(inst),
            Before(block) | After(block) => Some(block),
        }
    }

    /// Get the instruction corresponding to the current position, if any.
    pub fn current_inst(&self) -> Option<Inst> {
        match self.pos {
            CursorPosition::At(inst) => Some(inst),
            _ => None,
        }
    }

    /// Go to a specific instruction which must be inserted in the layout.
    /// New instructions will be inserted before `inst`.
    pub fn goto_inst(&mut self, inst: Inst) {
        debug_assert!(self.func.layout.inst_block(inst).is_some());
        self.pos = CursorPosition::At(inst);
    }

    /// Go to the position after a specific instruction, which must be inserted in the layout.
    /// New instructions will be inserted after `inst`.
    pub fn goto_after_inst(&mut self, inst: Inst) {
        let layout = &self.func.layout;
        self.pos = match layout.next_inst(inst) {
            Some(next) => CursorPosition::At(next),
            None => CursorPosition::After(
                layout
                    .inst_block(inst)
                    .expect("current instruction removed?"),
            ),
        };
    }

    /// Go to the top of `block`.
    pub fn goto_top(&mut self, block: Block) {
        debug_assert!(self.func.layout.is_block_inserted(block));
        self.pos = CursorPosition::Before(block);
    }

    /// Go to the bottom of `block`.
    pub fn goto_bottom(&mut self, block: Block) {
        debug_assert!(self.func.layout.is_block_inserted(block));
        self.pos = CursorPosition::After(block);
    }

    /// Move to the next instruction in the same block and return it.
    ///
    /// At the end of the block, the cursor moves to `After(block)` and `None` is returned.
    pub fn next_inst(&mut self) -> Option<Inst> {
        use self::CursorPosition::*;
        let layout = &self.func.layout;
        match self.pos {
            Nowhere | After(..) => None,
            At(inst) => {
                if let Some(next) = layout.next_inst(inst) {
                    self.pos = At(next);
                    Some(next)
                } else {
                    self.pos =
                        After(layout.inst_block(inst).expect("current instruction removed?"));
                    None
                }
            }
            Before(block) => {
                if let Some(next) = layout.first_inst(block) {
                    self.pos = At(next);
                    Some(next)
                } else {
                    self.pos = After(block);
                    None
                }
            }
        }
    }

    /// Insert an instruction at the current position and return it.
    ///
    /// The cursor stays put, so a sequence of insertions comes out in program order.
    pub fn insert_inst(&mut self, data: InstData) -> Inst {
        use self::CursorPosition::*;
        match self.pos {
            Nowhere => panic!("Cannot insert instructions with a cursor pointing nowhere"),
            At(cur) => self.func.insert_inst_before(cur, data),
            After(block) => self.func.append_inst(block, data),
            Before(block) => {
                let inst = self.func.prepend_inst(block, data);
                self.pos = match self.func.layout.next_inst(inst) {
                    Some(next) => At(next),
                    None => After(block),
                };
                inst
            }
        }
    }

    /// Remove the instruction under the cursor and move to the next one.
    pub fn remove_inst(&mut self) -> Inst {
        let inst = self.current_inst().expect("No instruction to remove");
        self.next_inst();
        self.func.remove_inst(inst);
        inst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::ir::{Reg, RegClass};

    #[test]
    fn insertion_order() {
        let mut func = Function::with_name("f");
        let v0 = func.new_vreg(RegClass::new(0));
        let b0 = func.append_block();
        let ret = func.append_inst(b0, InstData::ret([Reg::Virt(v0)]));

        let mut pos = FuncCursor::new(&mut func).at_top(b0);
        let a = pos.insert_inst(InstData::iconst(v0, 1));
        let b = pos.insert_inst(InstData::alu_imm(v0, v0, 2));
        assert_eq!(pos.current_inst(), Some(ret));
        assert_eq!(pos.remove_inst(), ret);
        assert_eq!(pos.position(), CursorPosition::After(b0));
        let c = pos.insert_inst(InstData::ret([Reg::Virt(v0)]));

        let insts: Vec<Inst> = func.layout.block_insts(b0).collect();
        assert_eq!(insts, [a, b, c]);
    }
}
