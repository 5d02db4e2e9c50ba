//! Spilling.
//!
//! The inline spiller assigns a stack slot to a register and inserts reloads before its uses
//! and stores after its defs, each with a tiny new virtual register. Before that it tries to
//! rematerialize cheap defs at their uses and to fold the stack slot into the using
//! instruction. Siblings (registers split from the same original) share the stack slot, so a
//! copy between siblings can often be turned into a store or a load, and stores of a value that
//! is already on the stack are removed.
//!
//! After allocation, `HoistSpillHelper` merges the stores of one value into fewer, colder
//! blocks.

use crate::entity::EntityRef;
use crate::ir::{Block, Inst, InstData, Opcode, Operand, OperandFlags, Reg, StackSlot, VirtReg};
use crate::regalloc::env::{InsertPos, RegAllocEnv};
use crate::regalloc::live_interval::LiveInterval;
use crate::regalloc::live_range::{LiveRange, ValNo};
use crate::regalloc::live_range_edit::{LiveRangeEdit, LiveRangeEditDelegate, Remat};
use crate::regalloc::slot_indexes::SlotIndex;
use crate::timing::{self, Pass};
use crate::{fview, trace};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Spills live ranges.
pub trait Spiller {
    /// Spill the parent register of `edit`, recording the new registers in it.
    fn spill(&mut self, edit: &mut LiveRangeEdit, env: &mut RegAllocEnv);

    /// Run after every register is allocated.
    fn post_optimization(&mut self, env: &mut RegAllocEnv);
}

/// If `data` is a full copy between `reg` and another virtual register, return the other one.
fn is_copy_of(data: &InstData, reg: VirtReg) -> Option<VirtReg> {
    let (dst, src) = data.copy_regs()?;
    if dst == Reg::Virt(reg) {
        src.virt()
    } else if src == Reg::Virt(reg) {
        dst.virt()
    } else {
        None
    }
}

/// Spills registers by inserting code around their uses.
#[derive(Default)]
pub struct InlineSpiller {
    hoister: HoistSpillHelper,

    // State of the current spill.
    original: Option<VirtReg>,
    stack_slot: Option<StackSlot>,
    regs_to_spill: SmallVec<[VirtReg; 8]>,
    // Copies between registers in `regs_to_spill`, deleted at the end.
    snippet_copies: FxHashSet<Inst>,
    // Values that must be kept because some use couldn't be rematerialized.
    used_values: FxHashSet<(VirtReg, ValNo)>,
    dead_defs: Vec<Inst>,
}

impl InlineSpiller {
    /// Create a spiller.
    pub fn new() -> Self {
        Self::default()
    }

    fn original(&self) -> VirtReg {
        self.original
            .unwrap_or_else(|| panic!("no spill in progress"))
    }

    fn slot(&self) -> StackSlot {
        self.stack_slot
            .unwrap_or_else(|| panic!("no stack slot assigned yet"))
    }

    fn is_sibling(&self, vreg: VirtReg, env: &RegAllocEnv) -> bool {
        env.vrm.original(vreg) == self.original()
    }

    fn is_reg_to_spill(&self, vreg: VirtReg) -> bool {
        self.regs_to_spill.contains(&vreg)
    }

    // A snippet is a tiny interval in one block whose only instructions besides copies to or
    // from `reg` and stack accesses are a single other instruction.
    fn is_snippet(&self, snip: VirtReg, reg: VirtReg, env: &RegAllocEnv) -> bool {
        let li = env.lis.interval(snip);
        if li.num_valnos() > 2 || li.is_empty() {
            return false;
        }
        if env.lis.interval_in_one_block(&li.range).is_none() {
            return false;
        }
        let mut use_inst = None;
        for inst in env.func.reg_insts(snip) {
            let data = &env.func[inst];
            if is_copy_of(data, reg).is_some() {
                continue;
            }
            if let (Some((r, ss)), Some(slot)) = (data.stack_access(), self.stack_slot) {
                if r == Reg::Virt(snip) && ss == slot {
                    continue;
                }
            }
            if use_inst.is_some_and(|u| u != inst) {
                return false;
            }
            use_inst = Some(inst);
        }
        true
    }

    // Collect the sibling snippets of the register being spilled.
    fn collect_regs_to_spill(&mut self, reg: VirtReg, env: &RegAllocEnv) {
        self.regs_to_spill.clear();
        self.regs_to_spill.push(reg);
        self.snippet_copies.clear();
        if self.original() == reg {
            return;
        }
        for inst in env.func.reg_insts(reg) {
            let snip = match is_copy_of(&env.func[inst], reg) {
                Some(s) if self.is_sibling(s, env) && env.lis.has_interval(s) => s,
                _ => continue,
            };
            if !self.is_snippet(snip, reg, env) {
                continue;
            }
            self.snippet_copies.insert(inst);
            if !self.is_reg_to_spill(snip) {
                trace!("Spilling snippet {snip} with {reg}");
                self.regs_to_spill.push(snip);
            }
        }
    }

    // Remember that `vn` of `vreg` is needed, following phis and snippet copies.
    fn mark_value_used(&mut self, vreg: VirtReg, vn: ValNo, env: &RegAllocEnv) {
        let mut work = vec![(vreg, vn)];
        while let Some((vreg, vn)) = work.pop() {
            if !self.used_values.insert((vreg, vn)) {
                continue;
            }
            let li = env.lis.interval(vreg);
            let def = li[vn].def;
            let indexes = env.lis.indexes();
            if def.is_block() {
                if let Some(block) = indexes.block_at(def) {
                    for pred in env.cfg.pred_iter(block) {
                        if let Some(pvn) = li.vn_info_before(indexes.block_end(pred.block)) {
                            work.push((vreg, pvn));
                        }
                    }
                }
                continue;
            }
            let inst = match indexes.instruction_at(def) {
                Some(inst) if self.snippet_copies.contains(&inst) => inst,
                _ => continue,
            };
            let src = match env.func[inst].copy_regs() {
                Some((_, Reg::Virt(src))) => src,
                _ => continue,
            };
            debug_assert!(self.is_reg_to_spill(src), "unexpected register in {inst}");
            if let Some(svn) = env.lis.interval(src).vn_info_at(def.base().reg_slot(true)) {
                work.push((src, svn));
            }
        }
    }

    // Try to rematerialize the value `reg` has at `inst`. Returns true if `inst` no longer reads
    // `reg`.
    fn rematerialize_for(
        &mut self,
        edit: &mut LiveRangeEdit,
        reg: VirtReg,
        inst: Inst,
        env: &mut RegAllocEnv,
    ) -> bool {
        if !env.func.is_inst_inserted(inst) || !env.func[inst].reads_virt_reg(reg) {
            return false;
        }
        let base = env.lis.indexes().index_of(inst);
        let parent_vn = match env.lis.interval(reg).vn_info_at(base) {
            Some(vn) => vn,
            None => {
                // Nothing is live, so the read is undefined.
                trace!("{inst} reads undefined {reg}");
                for i in 0..env.func[inst].operands.len() {
                    let op = env.func[inst].operands[i];
                    if op.virt_reg() == Some(reg) && !op.is_def() {
                        env.func.set_operand_flag(inst, i, OperandFlags::UNDEF, true);
                    }
                }
                return true;
            }
        };
        if self.snippet_copies.contains(&inst) {
            return false;
        }

        let original = self.original();
        let mut remat = Remat::new(parent_vn);
        if env.lis.has_interval(original) {
            remat.orig_vn = env.lis.interval(original).vn_info_at(base.reg_slot(true));
        }
        let use_idx = base.reg_slot(true);
        if !edit.can_rematerialize_at(&mut remat, use_idx, false, env) {
            self.mark_value_used(reg, parent_vn, env);
            return false;
        }
        // The new register can't also take the place of a def.
        if env.func[inst].defines_virt_reg(reg) {
            self.mark_value_used(reg, parent_vn, env);
            return false;
        }

        let new = edit.create_from(original, env);
        edit.rematerialize_at(InsertPos::Before(inst), new, &remat, env);
        for i in 0..env.func[inst].operands.len() {
            let op = env.func[inst].operands[i];
            if op.virt_reg() == Some(reg) {
                env.func.set_operand_reg(inst, i, Reg::Virt(new));
                env.func.set_operand_flag(inst, i, OperandFlags::KILL, true);
            }
        }
        env.lis.create_and_compute_interval(new, fview!(env));
        trace!("Rematerialized {reg} into {new} for {inst}");
        true
    }

    fn rematerialize_all(&mut self, edit: &mut LiveRangeEdit, env: &mut RegAllocEnv) {
        if !edit.any_rematerializable(env) {
            return;
        }
        self.used_values.clear();
        let mut any_remat = false;
        for reg in self.regs_to_spill.clone() {
            for inst in env.func.reg_insts(reg) {
                any_remat |= self.rematerialize_for(edit, reg, inst, env);
            }
        }
        if !any_remat {
            return;
        }

        // Values with every use rematerialized are dead now.
        for &reg in &self.regs_to_spill {
            let li = env.lis.interval(reg);
            let defs: Vec<(ValNo, SlotIndex)> = li
                .valnos()
                .filter(|(vn, info)| {
                    !info.is_unused()
                        && !info.is_phi_def()
                        && !self.used_values.contains(&(reg, *vn))
                })
                .map(|(vn, info)| (vn, info.def))
                .collect();
            for (_, def) in defs {
                let inst = match env.lis.indexes().instruction_at(def) {
                    Some(inst) => inst,
                    None => continue,
                };
                for i in 0..env.func[inst].operands.len() {
                    let op = env.func[inst].operands[i];
                    if op.virt_reg() == Some(reg) && op.is_def() {
                        env.func.set_operand_flag(inst, i, OperandFlags::DEAD, true);
                    }
                }
                if env.func[inst].all_defs_dead() {
                    self.dead_defs.push(inst);
                }
            }
        }
        if self.dead_defs.is_empty() {
            return;
        }
        let mut dead = core::mem::take(&mut self.dead_defs);
        edit.eliminate_dead_defs(&mut dead, &self.regs_to_spill, env);

        let mut kept = SmallVec::new();
        for reg in self.regs_to_spill.clone() {
            if env.func.reg_empty(reg) {
                edit.erase_virt_reg(reg, env);
                continue;
            }
            debug_assert!(env.lis.has_interval(reg), "{reg} lost its interval");
            kept.push(reg);
        }
        self.regs_to_spill = kept;
    }

    // Delete a stack access of `reg` to our own slot. Returns true if `inst` is gone.
    fn coalesce_stack_access(&mut self, inst: Inst, reg: VirtReg, env: &mut RegAllocEnv) -> bool {
        let data = &env.func[inst];
        let is_load = data.opcode == Opcode::Reload;
        match data.stack_access() {
            Some((r, ss)) if r == Reg::Virt(reg) && Some(ss) == self.stack_slot => {}
            _ => return false,
        }
        trace!("Coalescing stack access {inst}");
        if !is_load {
            self.hoister.rm_from_mergeable_spills(inst, self.slot(), env);
        }
        env.remove_inst(inst);
        if is_load {
            env.stats.reloads_removed += 1;
            env.stats.reloads = env.stats.reloads.saturating_sub(1);
        } else {
            env.stats.spills_removed += 1;
            env.stats.spills = env.stats.spills.saturating_sub(1);
        }
        true
    }

    // Turn `inst` into a stack access or fold the slot into it instead of using `reg`.
    fn fold_memory_operand(&mut self, inst: Inst, reg: VirtReg, env: &mut RegAllocEnv) -> bool {
        let slot = self.slot();
        let data = &env.func[inst];
        if let Some((dst, src)) = data.copy_regs() {
            if dst == src {
                return false;
            }
            if src == Reg::Virt(reg) {
                // dst = copy reg  =>  dst = reload [slot]
                env.func.set_operand(inst, 1, Operand::FrameIndex(slot));
                env.func.set_opcode(inst, Opcode::Reload);
                env.stats.folded_reloads += 1;
                trace!("Folded reload {inst}");
                return true;
            }
            // reg = copy src  =>  spill src, [slot]
            let kill = data.operands[1].is_kill();
            let undef = data.operands[1].is_undef();
            let mut op = Operand::reg_use(src);
            if kill {
                op = op.with_flags(OperandFlags::KILL);
            }
            if undef {
                op = op.with_flags(OperandFlags::UNDEF);
            }
            env.func.set_operand(inst, 0, op);
            env.func.set_operand(inst, 1, Operand::FrameIndex(slot));
            env.func.set_opcode(inst, Opcode::Spill);
            env.stats.folded_spills += 1;
            self.hoister
                .add_to_mergeable_spills(inst, slot, self.original(), env);
            trace!("Folded spill {inst}");
            return true;
        }

        // A single read of `reg` in a foldable operand position.
        let ops: SmallVec<[usize; 4]> = data
            .operands
            .iter()
            .enumerate()
            .filter(|(_, op)| op.virt_reg() == Some(reg))
            .map(|(i, _)| i)
            .collect();
        if ops.len() != 1 {
            return false;
        }
        let idx = ops[0];
        if data.operands[idx].is_def() || !env.isa.can_fold_memory_operand(data, idx) {
            return false;
        }
        env.func.set_operand(inst, idx, Operand::FrameIndex(slot));
        env.stats.folded_reloads += 1;
        trace!("Folded stack use into {inst}");
        true
    }

    fn insert_reload(&mut self, new: VirtReg, inst: Inst, env: &mut RegAllocEnv) {
        let slot = self.slot();
        let (reload, _) = env.insert_inst(InsertPos::Before(inst), InstData::reload(new, slot));
        trace!("Reload {new} at {reload}");
        env.stats.reloads += 1;
    }

    fn insert_spill(&mut self, new: VirtReg, inst: Inst, env: &mut RegAllocEnv) {
        let slot = self.slot();
        if env.func[inst].opcode.is_implicit_def() {
            // Nothing to store, keep the register live to the kill.
            env.insert_inst(
                InsertPos::After(inst),
                InstData::new(
                    Opcode::Kill,
                    [Operand::reg_use(new).with_flags(OperandFlags::KILL)],
                ),
            );
            return;
        }
        let mut data = InstData::spill(new, slot);
        data.operands[0] = Operand::reg_use(new).with_flags(OperandFlags::KILL);
        let (spill, _) = env.insert_inst(InsertPos::After(inst), data);
        trace!("Spill {new} at {spill}");
        env.stats.spills += 1;
        self.hoister
            .add_to_mergeable_spills(spill, slot, self.original(), env);
    }

    // The value of the sibling `src` copied into `spill_reg` at `copy` is killed there. Store it
    // right after its def instead, so the copy becomes dead.
    fn hoist_spill_inside_block(
        &mut self,
        spill_reg: VirtReg,
        copy: Inst,
        env: &mut RegAllocEnv,
    ) -> bool {
        let idx = env.lis.indexes().index_of(copy);
        debug_assert!(
            env.lis
                .interval(spill_reg)
                .vn_info_at(idx.reg_slot(false))
                .is_some(),
            "{copy} doesn't define {spill_reg}"
        );
        let src = match env.func[copy].copy_regs() {
            Some((_, Reg::Virt(src))) => src,
            _ => return false,
        };
        let src_li = env.lis.interval(src);
        let src_vn = match src_li.vn_info_at(idx) {
            Some(vn) => vn,
            None => return false,
        };
        let src_def = src_li[src_vn].def;
        let indexes = env.lis.indexes();
        if indexes.block_at(src_def) != env.func.inst_block(copy) || !src_li.query(idx).is_kill() {
            return false;
        }

        // Extend the stack slot over the whole original value.
        let slot = self.slot();
        let original = self.original();
        let class = env.func.vreg_class(original);
        let orig_vn = if env.lis.has_interval(original) {
            env.lis.interval(original).vn_info_at(idx)
        } else {
            None
        };
        if let Some(orig_vn) = orig_vn {
            let stack = env.stacks.get_or_create(slot, class);
            let vn0 = first_value(stack, src_def);
            stack.merge_value_in_as_value(&env.lis.interval(original).range, orig_vn, vn0);
        }

        self.eliminate_redundant_spills(src, src_vn, env);

        let pos = if src_def.is_block() {
            match env.lis.indexes().block_at(src_def) {
                Some(block) => InsertPos::Top(block),
                None => return false,
            }
        } else {
            match env.lis.indexes().instruction_at(src_def) {
                Some(def) => InsertPos::After(def),
                None => return false,
            }
        };
        let (spill, _) = env.insert_inst(pos, InstData::spill(src, slot));
        trace!("Hoisted spill of {src} to {spill} inside its block");
        self.hoister
            .add_to_mergeable_spills(spill, slot, original, env);
        env.stats.spills += 1;
        true
    }

    // `vn` of the sibling `vreg` is known to be on the stack. Remove its other stores and those
    // of the siblings it is copied to.
    fn eliminate_redundant_spills(&mut self, vreg: VirtReg, vn: ValNo, env: &mut RegAllocEnv) {
        let slot = self.slot();
        let class = env.func.vreg_class(self.original());
        let mut work = vec![(vreg, vn)];
        while let Some((reg, vn)) = work.pop() {
            if self.is_reg_to_spill(reg) || !env.lis.has_interval(reg) {
                continue;
            }
            {
                let li = env.lis.interval(reg);
                let stack = env.stacks.get_or_create(slot, class);
                let vn0 = first_value(stack, li[vn].def);
                stack.merge_value_in_as_value(&li.range, vn, vn0);
            }

            let users: Vec<Inst> = {
                let mut users: Vec<Inst> = env.func.reg_uses(reg).map(|o| o.inst).collect();
                users.sort_unstable();
                users.dedup();
                users
            };
            for inst in users {
                let data = &env.func[inst];
                if !data.opcode.may_store() && !data.opcode.is_copy() {
                    continue;
                }
                let idx = env.lis.indexes().index_of(inst);
                if env.lis.interval(reg).vn_info_at(idx) != Some(vn) {
                    continue;
                }
                if let Some(dst) = is_copy_of(data, reg) {
                    if self.is_sibling(dst, env) && env.lis.has_interval(dst) {
                        if let Some(dvn) = env.lis.interval(dst).vn_info_at(idx.reg_slot(false)) {
                            work.push((dst, dvn));
                        }
                    }
                    continue;
                }
                let is_store = data.opcode == Opcode::Spill;
                if is_store && data.stack_access() == Some((Reg::Virt(reg), slot)) {
                    trace!("Redundant spill {inst}");
                    env.func.set_opcode(inst, Opcode::Kill);
                    env.func.remove_operand(inst, 1);
                    self.dead_defs.push(inst);
                    env.stats.spills_removed += 1;
                    if self.hoister.rm_from_mergeable_spills(inst, slot, env) {
                        env.stats.spills = env.stats.spills.saturating_sub(1);
                    }
                }
            }
        }
    }

    fn spill_around_uses(&mut self, edit: &mut LiveRangeEdit, reg: VirtReg, env: &mut RegAllocEnv) {
        for inst in env.func.reg_insts(reg) {
            if !env.func.is_inst_inserted(inst) || self.snippet_copies.contains(&inst) {
                continue;
            }
            if self.coalesce_stack_access(inst, reg, env) {
                continue;
            }

            let base = env.lis.indexes().index_of(inst);
            let data = &env.func[inst];
            let reads = data.reads_virt_reg(reg);
            let writes = data.defines_virt_reg(reg);

            if let Some(sib) = is_copy_of(data, reg).filter(|&s| self.is_sibling(s, env)) {
                if self.is_reg_to_spill(sib) {
                    // A copy between snippets.
                    self.snippet_copies.insert(inst);
                    continue;
                }
                if writes {
                    if self.hoist_spill_inside_block(reg, inst, env) {
                        env.func.set_operand_flag(inst, 0, OperandFlags::DEAD, true);
                        self.dead_defs.push(inst);
                        continue;
                    }
                } else if let Some(svn) = env.lis.interval(sib).vn_info_at(base) {
                    // A reload for a sibling copy. Later stores of the sibling are redundant.
                    self.eliminate_redundant_spills(sib, svn, env);
                }
            }

            if self.fold_memory_operand(inst, reg, env) {
                continue;
            }

            let new = edit.create_from(reg, env);
            if reads {
                self.insert_reload(new, inst, env);
            }
            let q = env.lis.interval(reg).query(base);
            let mut has_live_def = false;
            for i in 0..env.func[inst].operands.len() {
                let op = env.func[inst].operands[i];
                if op.virt_reg() != Some(reg) {
                    continue;
                }
                env.func.set_operand_reg(inst, i, Reg::Virt(new));
                if op.is_def() {
                    if !op.is_dead() && !q.is_dead_def() {
                        has_live_def = true;
                    }
                } else if env.func[inst].ties.tied_def(i).is_none() {
                    env.func.set_operand_flag(inst, i, OperandFlags::KILL, true);
                }
            }
            if writes && has_live_def {
                self.insert_spill(new, inst, env);
            }
            env.lis.create_and_compute_interval(new, fview!(env));
            env.lis.interval_mut(new).mark_not_spillable();
        }
    }

    fn spill_all(&mut self, edit: &mut LiveRangeEdit, env: &mut RegAllocEnv) {
        let original = self.original();
        let class = env.func.vreg_class(original);
        let slot = match self.stack_slot {
            Some(slot) => slot,
            None => {
                let data = env.isa.reg_info().class(class);
                let slot = env.func.create_stack_slot(data.spill_size, data.spill_align);
                env.vrm.assign_virt_to_stack_slot(original, slot);
                self.stack_slot = Some(slot);
                slot
            }
        };
        let reg = edit.reg();
        if reg != original && env.vrm.stack_slot(reg).is_none() {
            env.vrm.assign_virt_to_stack_slot(reg, slot);
        }
        trace!("Merged spilled regs into {slot}");
        for &r in &self.regs_to_spill {
            env.stacks.merge(slot, class, &env.lis.interval(r).range);
        }

        for r in self.regs_to_spill.clone() {
            self.spill_around_uses(edit, r, env);
            if env.vrm.stack_slot(r).is_none() {
                env.vrm.assign_virt_to_stack_slot(r, slot);
            }
        }

        if !self.dead_defs.is_empty() {
            let mut dead = core::mem::take(&mut self.dead_defs);
            edit.eliminate_dead_defs(&mut dead, &self.regs_to_spill, env);
        }

        // Only snippet copies are left.
        for &r in &self.regs_to_spill {
            for inst in env.func.reg_insts(r) {
                debug_assert!(self.snippet_copies.contains(&inst), "{inst} still uses {r}");
                env.remove_inst(inst);
            }
        }
        for r in self.regs_to_spill.clone() {
            edit.erase_virt_reg(r, env);
        }
    }
}

// The single value of a stack slot range.
fn first_value(stack: &mut LiveRange, def: SlotIndex) -> ValNo {
    let first = stack.valnos().next().map(|(vn, _)| vn);
    match first {
        Some(vn) => vn,
        None => stack.get_next_value(def),
    }
}

impl Spiller for InlineSpiller {
    fn spill(&mut self, edit: &mut LiveRangeEdit, env: &mut RegAllocEnv) {
        let _tt = timing::start(Pass::Spill);
        let reg = edit.reg();
        assert!(
            env.lis.interval(reg).is_spillable(),
            "attempting to spill unspillable {reg}"
        );
        let original = env.vrm.original(reg);
        self.original = Some(original);
        self.stack_slot = env.vrm.stack_slot(original);
        self.used_values.clear();
        self.dead_defs.clear();
        trace!("Inline spilling {reg} from {original}");

        self.collect_regs_to_spill(reg, env);
        self.rematerialize_all(edit, env);
        if !self.regs_to_spill.is_empty() {
            self.spill_all(edit, env);
        }
        edit.calculate_reg_class_and_hint(env);
        self.original = None;
    }

    fn post_optimization(&mut self, env: &mut RegAllocEnv) {
        if env.flags.hoist_spills() {
            self.hoister.hoist_all_spills(env);
        }
        self.hoister.clear();
    }
}

// Gives registers split off during dead code elimination the assignment of their parent.
struct AssignmentCopier;

impl LiveRangeEditDelegate for AssignmentCopier {
    fn did_clone_virt_reg(&mut self, env: &mut RegAllocEnv, new: VirtReg, old: VirtReg) {
        if let Some(phys) = env.vrm.phys(old) {
            env.vrm.assign_virt_to_phys(new, phys);
        } else if let Some(slot) = env.vrm.stack_slot(old) {
            env.vrm.assign_virt_to_stack_slot(new, slot);
        } else {
            panic!("{old} has neither a register nor a stack slot");
        }
    }
}

/// Merges and hoists stores of equal values to the same stack slot.
#[derive(Default)]
pub struct HoistSpillHelper {
    // Stores of one value of an original register to one slot.
    mergeable_spills: FxHashMap<(StackSlot, ValNo), Vec<Inst>>,
    // Keys of `mergeable_spills` in insertion order.
    order: Vec<(StackSlot, ValNo)>,
    // The original interval at the time a slot was first stored to, and the index generation
    // it is expressed in.
    orig_intervals: FxHashMap<StackSlot, (LiveInterval, u32)>,
}

impl HoistSpillHelper {
    /// Create an empty helper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all stores.
    pub fn clear(&mut self) {
        self.mergeable_spills.clear();
        self.order.clear();
        self.orig_intervals.clear();
    }

    // The saved original interval of `slot`, brought up to date with the index.
    fn orig_interval(&mut self, slot: StackSlot, env: &RegAllocEnv) -> Option<&LiveInterval> {
        let (li, generation) = self.orig_intervals.get_mut(&slot)?;
        let current = env.lis.generation();
        if *generation != current {
            let indexes = env.lis.indexes();
            let since = *generation;
            li.remap_indexes(|idx| indexes.remap(idx, since));
            *generation = current;
        }
        Some(li)
    }

    // The value of the original read by `spill`, which may be its last use.
    fn orig_value(&mut self, spill: Inst, slot: StackSlot, env: &RegAllocEnv) -> Option<ValNo> {
        let idx = env.lis.indexes().try_index_of(spill)?;
        self.orig_interval(slot, env)?
            .vn_info_before(idx.reg_slot(false))
    }

    /// Record `spill` as a store of a value of `original` to `slot`.
    pub fn add_to_mergeable_spills(
        &mut self,
        spill: Inst,
        slot: StackSlot,
        original: VirtReg,
        env: &RegAllocEnv,
    ) {
        if !self.orig_intervals.contains_key(&slot) {
            if !env.lis.has_interval(original) {
                return;
            }
            let li = env.lis.interval(original).clone();
            self.orig_intervals.insert(slot, (li, env.lis.generation()));
        }
        let vn = match self.orig_value(spill, slot, env) {
            Some(vn) => vn,
            None => return,
        };
        let key = (slot, vn);
        let spills = self.mergeable_spills.entry(key).or_insert_with(|| {
            self.order.push(key);
            Vec::new()
        });
        if !spills.contains(&spill) {
            spills.push(spill);
        }
    }

    /// Forget `spill`. Returns true if it was recorded.
    pub fn rm_from_mergeable_spills(
        &mut self,
        spill: Inst,
        slot: StackSlot,
        env: &RegAllocEnv,
    ) -> bool {
        let vn = match self.orig_value(spill, slot, env) {
            Some(vn) => vn,
            None => return false,
        };
        match self.mergeable_spills.get_mut(&(slot, vn)) {
            Some(spills) => match spills.iter().position(|&s| s == spill) {
                Some(pos) => {
                    spills.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Hoist the recorded stores of every value.
    pub fn hoist_all_spills(&mut self, env: &mut RegAllocEnv) {
        let _tt = timing::start(Pass::HoistSpills);

        // Registers with defs, grouped by original.
        let mut siblings: FxHashMap<VirtReg, Vec<VirtReg>> = FxHashMap::default();
        for vreg in env.func.vregs.keys() {
            if !env.func.def_empty(vreg) {
                siblings.entry(env.vrm.original(vreg)).or_default().push(vreg);
            }
        }

        let mut copier = AssignmentCopier;
        for key in self.order.clone() {
            let (slot, orig_vn) = key;
            let mut spills = match self.mergeable_spills.get(&key) {
                Some(s) if !s.is_empty() => s.clone(),
                _ => continue,
            };
            spills.retain(|&s| env.func.is_inst_inserted(s));
            if spills.is_empty() {
                continue;
            }
            let orig_li = match self.orig_interval(slot, env) {
                Some(li) => li.clone(),
                None => continue,
            };
            let no_siblings = Vec::new();
            let sibs = siblings.get(&orig_li.reg).unwrap_or(&no_siblings);
            let (to_remove, to_insert) = run_hoist_spills(&orig_li, orig_vn, spills, sibs, env);

            for (block, live_reg) in to_insert {
                let spill = InstData::spill(live_reg, slot);
                let (inst, _) = env.insert_inst(InsertPos::End(block), spill);
                trace!("Hoisted spill {inst} of {live_reg} into {block}");
                env.stats.spills += 1;
                env.stats.hoisted_spills += 1;
            }

            env.stats.spills = env.stats.spills.saturating_sub(to_remove.len());
            for &inst in &to_remove {
                env.func.set_opcode(inst, Opcode::Kill);
                if let Some(i) = env.func[inst]
                    .operands
                    .iter()
                    .position(|op| matches!(op, Operand::FrameIndex(_)))
                {
                    env.func.remove_operand(inst, i);
                }
            }
            let mut dead = to_remove;
            let mut edit =
                LiveRangeEdit::new(None, Some(&mut copier as &mut dyn LiveRangeEditDelegate));
            edit.eliminate_dead_defs(&mut dead, &[], env);
        }
    }
}

// Decide which of `spills` to remove and which blocks get a new store, and from which sibling.
fn run_hoist_spills(
    orig_li: &LiveInterval,
    orig_vn: ValNo,
    mut spills: Vec<Inst>,
    siblings: &[VirtReg],
    env: &RegAllocEnv,
) -> (Vec<Inst>, Vec<(Block, VirtReg)>) {
    let indexes = env.lis.indexes();
    let mut to_remove = Vec::new();

    // Keep the earliest store per block.
    let mut block_spill: FxHashMap<Block, Inst> = FxHashMap::default();
    for &spill in &spills {
        let block = match env.func.inst_block(spill) {
            Some(b) => b,
            None => continue,
        };
        match block_spill.get(&block).copied() {
            Some(prev) => {
                let (keep, drop) = if indexes.index_of(spill) > indexes.index_of(prev) {
                    (prev, spill)
                } else {
                    (spill, prev)
                };
                to_remove.push(drop);
                block_spill.insert(block, keep);
            }
            None => {
                block_spill.insert(block, spill);
            }
        }
    }
    spills.retain(|s| !to_remove.contains(s));

    let root = match indexes.block_at(orig_li[orig_vn].def) {
        Some(b) => b,
        None => return (to_remove, Vec::new()),
    };

    // A store below another store is redundant. The blocks on the paths from the remaining
    // stores up to the root are the candidates for hoisting.
    let mut work_set: FxHashSet<Block> = FxHashSet::default();
    // Blocks keeping a store, with the sibling to store from if the store is new.
    let mut to_keep: FxHashMap<Block, Option<VirtReg>> = FxHashMap::default();
    for &spill in &spills {
        let block = match env.func.inst_block(spill) {
            Some(b) if env.domtree.dominates(root, b) => b,
            _ => continue,
        };
        let mut path = vec![block];
        let mut redundant = false;
        let mut node = block;
        while node != root {
            node = match env.domtree.idom(node) {
                Some(n) => n,
                None => break,
            };
            if block_spill.contains_key(&node) {
                redundant = true;
                break;
            }
            path.push(node);
        }
        if redundant {
            to_remove.push(spill);
        } else {
            to_keep.insert(block, None);
            work_set.extend(path);
        }
    }

    // Top-down order of the candidates.
    let mut orders = vec![root];
    let mut i = 0;
    while i < orders.len() {
        let node = orders[i];
        i += 1;
        for &child in env.domtree.children(node) {
            if work_set.contains(&child) {
                orders.push(child);
            }
        }
    }

    // Bottom-up, find the cheapest places for the stores of each subtree.
    let mut subtree: FxHashMap<Block, (Vec<Block>, u64)> = FxHashMap::default();
    for &node in orders.iter().rev() {
        let freq = env.freqs.block_freq(node);
        if to_keep.contains_key(&node) {
            subtree.insert(node, (vec![node], freq));
            continue;
        }
        let mut nodes = Vec::new();
        let mut cost = 0u64;
        for &child in env.domtree.children(node) {
            if let Some((child_nodes, child_cost)) = subtree.remove(&child) {
                nodes.extend(child_nodes);
                cost = cost.saturating_add(child_cost);
            }
        }
        if nodes.is_empty() {
            continue;
        }
        let live_reg = match spill_candidate(orig_li, orig_vn, node, siblings, env) {
            Some(r) => r,
            None => {
                subtree.insert(node, (nodes, cost));
                continue;
            }
        };
        // Merging several stores is worth a little extra frequency.
        let hoist = if nodes.len() > 1 {
            u128::from(cost) * 10 > u128::from(freq) * 9
        } else {
            cost > freq
        };
        if hoist {
            for n in &nodes {
                if let Some(None) = to_keep.get(n) {
                    to_remove.push(block_spill[n]);
                }
                to_keep.remove(n);
            }
            to_keep.insert(node, Some(live_reg));
            subtree.insert(node, (vec![node], freq));
        } else {
            subtree.insert(node, (nodes, cost));
        }
    }

    let mut to_insert: Vec<(Block, VirtReg)> = to_keep
        .into_iter()
        .filter_map(|(b, r)| r.map(|r| (b, r)))
        .collect();
    to_insert.sort_by_key(|&(b, _)| b.index());
    (to_remove, to_insert)
}

// Can a store of `orig_vn` be placed at the end of `block`? Returns a sibling holding the value
// in a register there.
fn spill_candidate(
    orig_li: &LiveInterval,
    orig_vn: ValNo,
    block: Block,
    siblings: &[VirtReg],
    env: &RegAllocEnv,
) -> Option<VirtReg> {
    let idx = env.last_split_point(block);
    if idx <= orig_li[orig_vn].def || orig_li.vn_info_before(idx) != Some(orig_vn) {
        return None;
    }
    siblings.iter().copied().find(|&sib| {
        env.vrm.has_phys(sib)
            && env.lis.has_interval(sib)
            && env.lis.interval(sib).vn_info_before(idx).is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Function;
    use crate::isa::generic;
    use crate::regalloc::env::tests::TestEnv;

    fn operands_name(func: &Function, vreg: VirtReg) -> bool {
        !func.reg_empty(vreg)
    }

    #[test]
    fn spill_around_uses_and_fold() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let x = func.new_vreg(isa.gpr_class());
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let c = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(x, 1));
        let def = func.append_inst(b0, InstData::alu(a, x, x));
        let use1 = func.append_inst(b0, InstData::alu_imm(b, a, 3));
        let use2 = func.append_inst(b0, InstData::alu(c, b, a));
        func.append_inst(b0, InstData::ret([Reg::Virt(c)]));
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();

        let mut spiller = InlineSpiller::new();
        let mut edit = LiveRangeEdit::new(Some(a), None);
        spiller.spill(&mut edit, &mut env);

        assert!(!operands_name(env.func, a));
        let slot = env.vrm.stack_slot(a).unwrap();
        // A store after the def, a reload before the first use, and a folded second use.
        let after_def = env.func.layout.next_inst(def).unwrap();
        assert_eq!(env.func[after_def].opcode, Opcode::Spill);
        let before_use = env.func.layout.prev_inst(use1).unwrap();
        assert_eq!(env.func[before_use].opcode, Opcode::Reload);
        assert_eq!(env.func[use2].operands[2], Operand::FrameIndex(slot));
        assert_eq!(env.stats.spills, 1);
        assert_eq!(env.stats.reloads, 1);
        assert_eq!(env.stats.folded_reloads, 1);
        assert_eq!(edit.len(), 2);
        for &r in edit.regs() {
            assert!(!env.lis.interval(r).is_spillable());
        }
        assert!(env.stacks.get(slot).is_some());
    }

    #[test]
    fn constants_are_rematerialized() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let x = func.new_vreg(isa.gpr_class());
        let a = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let def = func.append_inst(b0, InstData::iconst(x, 7));
        let add = func.append_inst(b0, InstData::alu_imm(a, x, 1));
        let ret = func.append_inst(b0, InstData::ret([Reg::Virt(a), Reg::Virt(x)]));
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();

        let mut spiller = InlineSpiller::new();
        let mut edit = LiveRangeEdit::new(Some(x), None);
        spiller.spill(&mut edit, &mut env);

        assert!(!operands_name(env.func, x));
        assert_eq!(env.stats.remats, 2);
        assert_eq!(env.stats.spills, 0);
        assert!(env.vrm.stack_slot(x).is_none());
        for user in [add, ret] {
            let prev = env.func.layout.prev_inst(user).unwrap();
            assert_eq!(env.func[prev].opcode, Opcode::Iconst);
        }
        // The original def stays behind as a dead remat.
        assert_eq!(env.dead_remats, vec![def]);
    }

    #[test]
    fn copies_to_siblings_become_stack_accesses() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let x = func.new_vreg(isa.gpr_class());
        let a = func.new_vreg(isa.gpr_class());
        let y = func.new_vreg(isa.gpr_class());
        let s = func.new_vreg(isa.gpr_class());
        let z = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(x, 1));
        let def = func.append_inst(b0, InstData::alu(a, x, x));
        func.append_inst(b0, InstData::alu(y, a, a));
        let to_s = func.append_inst(b0, InstData::copy(s, a));
        // Keeps `s` live across an instruction, so it can be spilled.
        func.append_inst(b0, InstData::alu_imm(z, y, 1));
        func.append_inst(b0, InstData::ret([Reg::Virt(s), Reg::Virt(z)]));
        let mut t = TestEnv::new(func, isa);
        t.vrm.set_is_split_from_reg(s, a);
        let mut env = t.env();

        let mut spiller = InlineSpiller::new();
        let mut edit = LiveRangeEdit::new(Some(s), None);
        spiller.spill(&mut edit, &mut env);

        // `s = copy a` kills `a`, so `a` is stored right after its def and the copy goes away.
        assert!(!env.func.is_inst_inserted(to_s));
        assert!(!operands_name(env.func, s));
        assert_eq!(env.stats.spills, 1);
        let slot = env.vrm.stack_slot(a).unwrap();
        assert_eq!(env.vrm.stack_slot(s), Some(slot));
        let store = env.func.layout.next_inst(def).unwrap();
        assert_eq!(env.func[store].stack_access(), Some((Reg::Virt(a), slot)));
    }

    #[test]
    fn stores_are_hoisted_to_the_dominator() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let c = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        let b3 = func.append_block();
        func.append_inst(b0, InstData::iconst(c, 0));
        func.append_inst(b0, InstData::alu(a, c, c));
        let br = func.append_inst(b0, InstData::brif(c, b1, b2));
        let slot = func.create_stack_slot(8, 8);
        let s1 = func.append_inst(b1, InstData::spill(a, slot));
        func.append_inst(b1, InstData::jump(b3));
        let s2 = func.append_inst(b2, InstData::spill(a, slot));
        func.append_inst(b2, InstData::jump(b3));
        func.append_inst(b3, InstData::ret([]));
        let mut t = TestEnv::new(func, isa);
        let r0 = t.isa.gpr(0);
        t.vrm.assign_virt_to_phys(a, r0);
        t.vrm.assign_virt_to_stack_slot(a, slot);
        let mut env = t.env();
        env.stats.spills = 2;

        let mut hoister = HoistSpillHelper::new();
        hoister.add_to_mergeable_spills(s1, slot, a, &env);
        hoister.add_to_mergeable_spills(s2, slot, a, &env);
        hoister.hoist_all_spills(&mut env);

        assert!(!env.func.is_inst_inserted(s1));
        assert!(!env.func.is_inst_inserted(s2));
        let hoisted = env.func.layout.prev_inst(br).unwrap();
        assert_eq!(env.func[hoisted].stack_access(), Some((Reg::Virt(a), slot)));
        assert_eq!(env.stats.hoisted_spills, 1);
        assert_eq!(env.stats.spills, 1);
    }

    #[test]
    fn cold_stores_stay_put() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let c = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        func.append_inst(b0, InstData::iconst(c, 0));
        func.append_inst(b0, InstData::alu(a, c, c));
        func.append_inst(b0, InstData::brif(c, b1, b2));
        let slot = func.create_stack_slot(8, 8);
        let s1 = func.append_inst(b1, InstData::spill(a, slot));
        func.append_inst(b1, InstData::jump(b2));
        func.append_inst(b2, InstData::ret([]));
        let mut t = TestEnv::new(func, isa);
        let r0 = t.isa.gpr(0);
        t.vrm.assign_virt_to_phys(a, r0);
        let mut env = t.env();

        let mut hoister = HoistSpillHelper::new();
        hoister.add_to_mergeable_spills(s1, slot, a, &env);
        hoister.hoist_all_spills(&mut env);
        // One store in a colder block isn't moved.
        assert!(env.func.is_inst_inserted(s1));
        assert_eq!(env.stats.hoisted_spills, 0);
    }
}
