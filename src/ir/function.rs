//! Intermediate representation of a function.
//!
//! The `Function` struct defined in this module owns all of its blocks and instructions, the
//! virtual register table, the stack frame and the use/def lists.

use crate::entity::packed_option::PackedOption;
use crate::entity::{PrimaryMap, SecondaryMap};
use crate::ir::instructions::{InstData, Opcode};
use crate::ir::layout::Layout;
use crate::ir::operands::{Operand, OperandFlags};
use crate::ir::reglists::{OperandRef, RegOperand, RegOperandIter, RegOperandLists};
use crate::ir::{Block, Inst, PhysReg, Reg, RegClass, RegMask, StackSlot, VirtReg};
use core::fmt;
use core::ops::Index;
use smallvec::SmallVec;

/// Per virtual register data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VRegData {
    /// The register class constraining the allocation.
    pub class: RegClass,
}

/// Per block data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockData {
    /// Physical registers live into the block. Filled in for the entry block by the caller
    /// (incoming arguments) and for all blocks by the rewriter.
    pub live_ins: Vec<PhysReg>,
}

/// A stack slot in the frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackSlotData {
    /// Size in bytes.
    pub size: u32,
    /// Alignment in bytes.
    pub align: u32,
}

/// The physical registers clobbered by a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegMaskData {
    clobbers: Vec<PhysReg>,
}

impl RegMaskData {
    /// Create a mask clobbering `regs`.
    pub fn new(regs: impl IntoIterator<Item = PhysReg>) -> Self {
        let mut clobbers: Vec<PhysReg> = regs.into_iter().collect();
        clobbers.sort_unstable();
        clobbers.dedup();
        Self { clobbers }
    }

    /// Does the mask clobber `reg`?
    pub fn clobbers(&self, reg: PhysReg) -> bool {
        self.clobbers.binary_search(&reg).is_ok()
    }

    /// The clobbered registers, sorted.
    pub fn clobbered(&self) -> &[PhysReg] {
        &self.clobbers
    }
}

/// A function in virtual register form.
#[derive(Clone, Debug, Default)]
pub struct Function {
    /// Name used in dumps.
    pub name: String,

    /// Per block data. The block order is defined by `layout`.
    pub blocks: PrimaryMap<Block, BlockData>,

    /// Block and instruction order.
    pub layout: Layout,

    /// Virtual registers.
    pub vregs: PrimaryMap<VirtReg, VRegData>,

    /// Stack slots.
    pub stack_slots: PrimaryMap<StackSlot, StackSlotData>,

    /// Call clobber masks.
    pub reg_masks: PrimaryMap<RegMask, RegMaskData>,

    insts: PrimaryMap<Inst, InstData>,
    reg_lists: RegOperandLists,
    op_records: SecondaryMap<Inst, SmallVec<[PackedOption<RegOperand>; 4]>>,
}

impl Function {
    /// Create an empty function.
    pub fn with_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Create a new virtual register in `class`.
    pub fn new_vreg(&mut self, class: RegClass) -> VirtReg {
        self.vregs.push(VRegData { class })
    }

    /// The register class of `vreg`.
    pub fn vreg_class(&self, vreg: VirtReg) -> RegClass {
        self.vregs[vreg].class
    }

    /// Create a stack slot.
    pub fn create_stack_slot(&mut self, size: u32, align: u32) -> StackSlot {
        self.stack_slots.push(StackSlotData { size, align })
    }

    /// Create a clobber mask.
    pub fn create_reg_mask(&mut self, regs: impl IntoIterator<Item = PhysReg>) -> RegMask {
        self.reg_masks.push(RegMaskData::new(regs))
    }

    /// Create a new block and append it to the layout.
    pub fn append_block(&mut self) -> Block {
        let block = self.blocks.push(BlockData::default());
        self.layout.append_block(block);
        block
    }

    /// The entry block.
    pub fn entry_block(&self) -> Option<Block> {
        self.layout.entry_block()
    }

    /// Number of instructions ever created, including removed ones.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Is `inst` currently in the layout?
    pub fn is_inst_inserted(&self, inst: Inst) -> bool {
        self.layout.inst_block(inst).is_some()
    }

    /// The block containing `inst`.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.layout.inst_block(inst)
    }

    // Create an instruction that isn't in the layout yet and link its operands.
    fn make_inst(&mut self, data: InstData) -> Inst {
        let inst = self.insts.push(data);
        let mut records = SmallVec::new();
        for (idx, op) in self.insts[inst].operands.iter().enumerate() {
            records.push(Self::link_operand(&mut self.reg_lists, inst, idx, op));
        }
        self.op_records[inst] = records;
        inst
    }

    fn link_operand(
        lists: &mut RegOperandLists,
        inst: Inst,
        idx: usize,
        op: &Operand,
    ) -> PackedOption<RegOperand> {
        match op.virt_reg() {
            Some(v) => lists.link(v, inst, idx, op.is_def()).into(),
            None => None.into(),
        }
    }

    /// Append an instruction to the end of `block`.
    pub fn append_inst(&mut self, block: Block, data: InstData) -> Inst {
        let inst = self.make_inst(data);
        self.layout.append_inst(inst, block);
        inst
    }

    /// Insert an instruction before `before`.
    pub fn insert_inst_before(&mut self, before: Inst, data: InstData) -> Inst {
        let inst = self.make_inst(data);
        self.layout.insert_inst(inst, before);
        inst
    }

    /// Insert an instruction after `after`.
    pub fn insert_inst_after(&mut self, after: Inst, data: InstData) -> Inst {
        let inst = self.make_inst(data);
        self.layout.insert_inst_after(inst, after);
        inst
    }

    /// Insert an instruction at the top of `block`.
    pub fn prepend_inst(&mut self, block: Block, data: InstData) -> Inst {
        let inst = self.make_inst(data);
        self.layout.prepend_inst(inst, block);
        inst
    }

    /// Remove `inst` from the layout and drop its operands from the use/def lists.
    ///
    /// The instruction data stays allocated so stale references can still be inspected.
    pub fn remove_inst(&mut self, inst: Inst) {
        for rec in self.op_records[inst].drain(..) {
            if let Some(r) = rec.expand() {
                self.reg_lists.unlink(r);
            }
        }
        self.layout.remove_inst(inst);
    }

    /// Replace operand `idx` of `inst`.
    pub fn set_operand(&mut self, inst: Inst, idx: usize, op: Operand) {
        if let Some(r) = self.op_records[inst][idx].expand() {
            self.reg_lists.unlink(r);
        }
        self.insts[inst].operands[idx] = op;
        self.op_records[inst][idx] = Self::link_operand(&mut self.reg_lists, inst, idx, &op);
    }

    /// Replace the register of operand `idx`, keeping its flags and sub-register index.
    pub fn set_operand_reg(&mut self, inst: Inst, idx: usize, reg: Reg) {
        let mut op = self.insts[inst].operands[idx];
        op.set_reg(reg);
        self.set_operand(inst, idx, op);
    }

    /// Replace the sub-register index of operand `idx`.
    pub fn set_operand_subreg(&mut self, inst: Inst, idx: usize, subreg: u8) {
        self.insts[inst].operands[idx].set_subreg(subreg);
    }

    /// Set or clear a flag on operand `idx`.
    pub fn set_operand_flag(&mut self, inst: Inst, idx: usize, flag: OperandFlags, value: bool) {
        let mut op = self.insts[inst].operands[idx];
        op.set_flag(flag, value);
        if flag.contains(OperandFlags::DEF) {
            // Def-ness decides the list position.
            self.set_operand(inst, idx, op);
        } else {
            self.insts[inst].operands[idx] = op;
        }
    }

    /// Set or clear a flag on every operand of `inst` naming `reg`.
    pub fn set_reg_flag(&mut self, inst: Inst, reg: Reg, flag: OperandFlags, value: bool) {
        debug_assert!(!flag.contains(OperandFlags::DEF));
        self.insts[inst].set_reg_flag(reg, flag, value);
    }

    /// Append an operand to `inst`.
    pub fn add_operand(&mut self, inst: Inst, op: Operand) {
        let idx = self.insts[inst].operands.len();
        self.insts[inst].operands.push(op);
        let rec = Self::link_operand(&mut self.reg_lists, inst, idx, &op);
        self.op_records[inst].push(rec);
    }

    /// Remove operand `idx` from `inst`, shifting later operands down.
    pub fn remove_operand(&mut self, inst: Inst, idx: usize) {
        if let Some(r) = self.op_records[inst][idx].expand() {
            self.reg_lists.unlink(r);
        }
        self.op_records[inst].remove(idx);
        let data = &mut self.insts[inst];
        data.operands.remove(idx);
        data.ties.operand_removed(idx);
        for (i, rec) in self.op_records[inst].iter().enumerate().skip(idx) {
            if let Some(r) = rec.expand() {
                self.reg_lists.set_index(r, i);
            }
        }
    }

    /// Change the opcode of `inst`.
    pub fn set_opcode(&mut self, inst: Inst, opcode: Opcode) {
        self.insts[inst].opcode = opcode;
    }

    /// Tie def operand `def` of `inst` to its use operand `use_idx`.
    pub fn tie_operands(&mut self, inst: Inst, def: usize, use_idx: usize) {
        self.insts[inst].ties.tie(def, use_idx);
    }

    /// Iterate over all operands naming `vreg`, defs first.
    pub fn reg_operands(&self, vreg: VirtReg) -> RegOperandIter {
        self.reg_lists.operands(vreg)
    }

    /// Iterate over the def operands of `vreg`.
    pub fn reg_defs(&self, vreg: VirtReg) -> impl Iterator<Item = OperandRef> + '_ {
        self.reg_lists.defs(vreg)
    }

    /// Iterate over the use operands of `vreg`.
    pub fn reg_uses(&self, vreg: VirtReg) -> impl Iterator<Item = OperandRef> + '_ {
        self.reg_lists.uses(vreg)
    }

    /// Collect the distinct instructions referring to `vreg`.
    pub fn reg_insts(&self, vreg: VirtReg) -> Vec<Inst> {
        let mut insts: Vec<Inst> = self.reg_operands(vreg).map(|o| o.inst).collect();
        insts.sort_unstable();
        insts.dedup();
        insts
    }

    /// Does `vreg` have no defs?
    pub fn def_empty(&self, vreg: VirtReg) -> bool {
        self.reg_lists.def_empty(vreg)
    }

    /// Does `vreg` have no operands at all?
    pub fn reg_empty(&self, vreg: VirtReg) -> bool {
        self.reg_lists.is_empty(vreg)
    }

    /// The single def instruction of `vreg`, if it has exactly one.
    pub fn unique_def(&self, vreg: VirtReg) -> Option<Inst> {
        let mut defs = self.reg_defs(vreg);
        let first = defs.next()?.inst;
        if defs.all(|d| d.inst == first) {
            Some(first)
        } else {
            None
        }
    }

    /// The operand at `op`.
    pub fn operand(&self, op: OperandRef) -> &Operand {
        &self.insts[op.inst].operands[op.index]
    }

    /// Check use/def list consistency against the instruction operands.
    pub fn verify_reg_lists(&self) -> Result<(), String> {
        self.reg_lists.verify()?;
        for block in self.layout.blocks() {
            for inst in self.layout.block_insts(block) {
                for (idx, op) in self.insts[inst].operands.iter().enumerate() {
                    let linked = self.op_records[inst]
                        .get(idx)
                        .is_some_and(|r| r.is_some());
                    if linked != op.virt_reg().is_some() {
                        return Err(format!("{inst} operand {idx} is not tracked"));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Index<Inst> for Function {
    type Output = InstData;

    fn index(&self, inst: Inst) -> &InstData {
        &self.insts[inst]
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "function {} {{", self.name)?;
        for (ss, data) in self.stack_slots.iter() {
            writeln!(f, "    {ss} = stack_slot {}, align {}", data.size, data.align)?;
        }
        for block in self.layout.blocks() {
            write!(f, "{block}:")?;
            let live_ins = &self.blocks[block].live_ins;
            if !live_ins.is_empty() {
                f.write_str(" ; live-in:")?;
                for r in live_ins {
                    write!(f, " %{r}")?;
                }
            }
            writeln!(f)?;
            for inst in self.layout.block_insts(block) {
                writeln!(f, "    {}", self.insts[inst])?;
            }
        }
        writeln!(f, "}}")
    }
}
