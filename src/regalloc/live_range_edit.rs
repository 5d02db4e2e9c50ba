//! Editing a live range that is being split or spilled.
//!
//! A `LiveRangeEdit` owns the new virtual registers created from one parent register. It knows
//! which values of the parent can be rematerialized, performs the rematerialization and
//! removes instructions whose defs became dead, shrinking the intervals they read.
//!
//! The allocator driving the edit gets callbacks through `LiveRangeEditDelegate` so that it can
//! unassign registers before their intervals change.

use crate::ir::{Inst, Operand, OperandFlags, Reg, VirtReg};
use crate::regalloc::env::{InsertPos, RegAllocEnv};
use crate::regalloc::live_range::{Segment, ValNo};
use crate::regalloc::slot_indexes::SlotIndex;
use crate::{fview, trace};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

/// Callbacks from a `LiveRangeEdit` to the register allocator.
pub trait LiveRangeEditDelegate {
    /// `inst` is about to be deleted.
    fn will_erase_inst(&mut self, env: &mut RegAllocEnv, inst: Inst) {
        let _ = (env, inst);
    }

    /// The interval of `vreg` is about to be erased. Returning false keeps an empty interval
    /// instead.
    fn can_erase_virt_reg(&mut self, env: &mut RegAllocEnv, vreg: VirtReg) -> bool {
        let _ = (env, vreg);
        true
    }

    /// The interval of `vreg` is about to shrink.
    fn will_shrink_virt_reg(&mut self, env: &mut RegAllocEnv, vreg: VirtReg) {
        let _ = (env, vreg);
    }

    /// `new` was created from `old`.
    fn did_clone_virt_reg(&mut self, env: &mut RegAllocEnv, new: VirtReg, old: VirtReg) {
        let _ = (env, new, old);
    }
}

/// A value that could be rematerialized.
#[derive(Clone, Copy, Debug)]
pub struct Remat {
    /// The value of the parent register.
    pub parent_vn: ValNo,
    /// The value of the original register defined at the same place, if known.
    pub orig_vn: Option<ValNo>,
    /// The instruction defining the original value, once checked.
    pub orig_inst: Option<Inst>,
}

impl Remat {
    /// Describe the parent value `parent_vn`.
    pub fn new(parent_vn: ValNo) -> Self {
        Self {
            parent_vn,
            orig_vn: None,
            orig_inst: None,
        }
    }
}

/// New registers created while editing one parent.
pub struct LiveRangeEdit<'d> {
    parent: Option<VirtReg>,
    new_regs: Vec<VirtReg>,
    delegate: Option<&'d mut dyn LiveRangeEditDelegate>,
    scanned_remattable: bool,
    // Values of the original interval with a rematerializable def.
    remattable: FxHashSet<ValNo>,
    // Values of the parent that were rematerialized at least once.
    rematted: FxHashSet<ValNo>,
}

impl<'d> LiveRangeEdit<'d> {
    /// Start editing `parent`. An edit without a parent can only eliminate dead code.
    pub fn new(
        parent: Option<VirtReg>,
        delegate: Option<&'d mut dyn LiveRangeEditDelegate>,
    ) -> Self {
        Self {
            parent,
            new_regs: Vec::new(),
            delegate,
            scanned_remattable: false,
            remattable: FxHashSet::default(),
            rematted: FxHashSet::default(),
        }
    }

    /// The register being edited.
    pub fn reg(&self) -> VirtReg {
        self.parent
            .unwrap_or_else(|| panic!("live range edit has no parent register"))
    }

    /// The registers created so far.
    pub fn regs(&self) -> &[VirtReg] {
        &self.new_regs
    }

    /// The number of registers created.
    pub fn len(&self) -> usize {
        self.new_regs.len()
    }

    /// Were no registers created?
    pub fn is_empty(&self) -> bool {
        self.new_regs.is_empty()
    }

    /// The `i`th new register.
    pub fn get(&self, i: usize) -> VirtReg {
        self.new_regs[i]
    }

    /// Create a new virtual register in the class of `old` with an empty interval.
    pub fn create_empty_interval_from(&mut self, old: VirtReg, env: &mut RegAllocEnv) -> VirtReg {
        let vreg = env.func.new_vreg(env.func.vreg_class(old));
        env.vrm.set_is_split_from_reg(vreg, old);
        let unspillable = self
            .parent
            .is_some_and(|p| env.lis.has_interval(p) && !env.lis.interval(p).is_spillable());
        let li = env.lis.create_empty_interval(vreg);
        if unspillable {
            li.mark_not_spillable();
        }
        self.new_regs.push(vreg);
        trace!("Created {vreg} from {old}");
        vreg
    }

    /// Create a new register for the parent with an empty interval.
    pub fn create_empty_interval(&mut self, env: &mut RegAllocEnv) -> VirtReg {
        let parent = self.reg();
        self.create_empty_interval_from(parent, env)
    }

    /// Create a new register from `old`. The caller computes its interval once the operands are
    /// in place.
    pub fn create_from(&mut self, old: VirtReg, env: &mut RegAllocEnv) -> VirtReg {
        self.create_empty_interval_from(old, env)
    }

    // Find the parent values whose original def can be recomputed anywhere.
    fn scan_remattable(&mut self, env: &RegAllocEnv) {
        self.scanned_remattable = true;
        let parent = self.reg();
        let orig = env.vrm.original(parent);
        if !env.lis.has_interval(orig) || !env.lis.has_interval(parent) {
            return;
        }
        let orig_li = env.lis.interval(orig);
        for (_, info) in env.lis.interval(parent).valnos() {
            if info.is_unused() {
                continue;
            }
            let orig_vn = match orig_li.vn_info_at(info.def) {
                Some(vn) => vn,
                None => continue,
            };
            let def = orig_li[orig_vn].def;
            if def.is_block() {
                continue;
            }
            let inst = match env.lis.indexes().instruction_at(def) {
                Some(inst) => inst,
                None => continue,
            };
            let data = &env.func[inst];
            if data.is_trivially_rematerializable() && data.operands[0].subreg() == 0 {
                self.remattable.insert(orig_vn);
            }
        }
        trace!("{parent}: {} rematerializable values", self.remattable.len());
    }

    /// Does the parent have any value that could be rematerialized?
    pub fn any_rematerializable(&mut self, env: &RegAllocEnv) -> bool {
        if !self.scanned_remattable {
            self.scan_remattable(env);
        }
        !self.remattable.is_empty()
    }

    /// Can `remat` be recomputed at `use_idx`? On success `remat.orig_inst` is set.
    ///
    /// With `cheap_as_a_move`, only defs as cheap as a copy qualify.
    pub fn can_rematerialize_at(
        &mut self,
        remat: &mut Remat,
        use_idx: SlotIndex,
        cheap_as_a_move: bool,
        env: &RegAllocEnv,
    ) -> bool {
        if !self.scanned_remattable {
            self.scan_remattable(env);
        }
        let orig_vn = match remat.orig_vn {
            Some(vn) => vn,
            None => return false,
        };
        if !self.remattable.contains(&orig_vn) {
            return false;
        }
        let orig_li = env.lis.interval(env.vrm.original(self.reg()));
        let inst = match env.lis.indexes().instruction_at(orig_li[orig_vn].def) {
            Some(inst) => inst,
            None => return false,
        };
        if cheap_as_a_move && !env.func[inst].opcode.is_as_cheap_as_a_move() {
            return false;
        }
        // Rematerializable defs read no registers, so their inputs are available at `use_idx`.
        trace!("Can remat {} at {use_idx}", env.func[inst]);
        remat.orig_inst = Some(inst);
        true
    }

    /// Insert a copy of the def of `remat` at `pos`, defining `dest`. Returns the def slot of
    /// the new instruction.
    pub fn rematerialize_at(
        &mut self,
        pos: InsertPos,
        dest: VirtReg,
        remat: &Remat,
        env: &mut RegAllocEnv,
    ) -> SlotIndex {
        let orig = remat
            .orig_inst
            .unwrap_or_else(|| panic!("rematerializing {} without a def", remat.parent_vn));
        let mut data = env.func[orig].clone();
        let mut def = data.operands[0];
        def.set_reg(Reg::Virt(dest));
        def.set_flag(OperandFlags::DEAD, false);
        data.operands[0] = def;
        let (_, idx) = env.insert_inst(pos, data);
        self.rematted.insert(remat.parent_vn);
        env.stats.remats += 1;
        idx.reg_slot(false)
    }

    /// Was `parent_vn` rematerialized?
    pub fn did_rematerialize(&self, parent_vn: ValNo) -> bool {
        self.rematted.contains(&parent_vn)
    }

    /// Record that `parent_vn` was rematerialized.
    pub fn mark_rematerialized(&mut self, parent_vn: ValNo) {
        self.rematted.insert(parent_vn);
    }

    /// Erase the interval of `vreg`, or empty it if the delegate wants to keep it.
    pub fn erase_virt_reg(&mut self, vreg: VirtReg, env: &mut RegAllocEnv) {
        let erase = match self.delegate.as_deref_mut() {
            Some(delegate) => delegate.can_erase_virt_reg(env, vreg),
            None => true,
        };
        if erase {
            trace!("Erasing {vreg}");
            env.lis.remove_interval(vreg);
        } else if env.lis.has_interval(vreg) {
            let li = env.lis.interval_mut(vreg);
            li.range.clear();
            li.clear_sub_ranges();
        }
    }

    /// Delete the instructions in `dead` and everything that becomes dead as a consequence.
    ///
    /// Intervals read by deleted instructions are shrunk, and split into their connected
    /// components unless they are in `regs_being_spilled`.
    pub fn eliminate_dead_defs(
        &mut self,
        dead: &mut Vec<Inst>,
        regs_being_spilled: &[VirtReg],
        env: &mut RegAllocEnv,
    ) {
        let mut to_shrink: Vec<VirtReg> = Vec::new();
        loop {
            while let Some(inst) = dead.pop() {
                self.eliminate_dead_def(inst, &mut to_shrink, env);
            }
            let vreg = match to_shrink.pop() {
                Some(v) => v,
                None => break,
            };
            if !env.lis.has_interval(vreg) || env.lis.interval(vreg).is_empty() {
                continue;
            }
            if let Some(delegate) = self.delegate.as_deref_mut() {
                delegate.will_shrink_virt_reg(env, vreg);
            }
            if !env.lis.shrink_to_uses(vreg, fview!(env), Some(dead)) {
                continue;
            }
            if regs_being_spilled.contains(&vreg) {
                continue;
            }
            self.split_components(vreg, env);
        }
    }

    /// Give each connected component of the interval of `vreg` but the first its own register.
    /// The new registers are added to the edit. Returns how many were created.
    pub fn split_components(&mut self, vreg: VirtReg, env: &mut RegAllocEnv) -> usize {
        let original = env.vrm.original(vreg);
        let components =
            env.lis
                .split_separate_components(vreg, env.func, env.isa, env.cfg, env.domtree);
        for &new in &components {
            if original != vreg {
                env.vrm.set_is_split_from_reg(new, original);
            }
            if let Some(delegate) = self.delegate.as_deref_mut() {
                delegate.did_clone_virt_reg(env, new, vreg);
            }
            self.new_regs.push(new);
        }
        components.len()
    }

    fn eliminate_dead_def(
        &mut self,
        inst: Inst,
        to_shrink: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) {
        if !env.func.is_inst_inserted(inst) || !env.lis.indexes().has_index(inst) {
            return;
        }
        let data = &env.func[inst];
        if !data.is_safe_to_delete() {
            trace!("Can't delete {inst}: {data}");
            return;
        }
        let idx = env.lis.indexes().index_of(inst);

        // Never delete an instruction with a live def.
        for op in &data.operands {
            if !op.is_def() || op.is_dead() {
                continue;
            }
            match op.reg() {
                Some(Reg::Virt(v)) => {
                    let live = env.lis.has_interval(v)
                        && env.lis.interval(v).query(idx).value_out().is_some();
                    if live {
                        return;
                    }
                }
                Some(Reg::Phys(_)) => return,
                None => {}
            }
        }
        trace!("Dead def {inst}: {data}");

        // A dead def of the original value may still be needed for rematerialization.
        let mut dest = None;
        let explicit_defs = data
            .operands
            .iter()
            .filter(|op| op.is_def() && !op.is_implicit())
            .count();
        if explicit_defs == 1 {
            if let Some(Reg::Virt(d)) = data.dest() {
                let orig = env.vrm.original(d);
                let is_orig_def = env.lis.has_interval(orig)
                    && env
                        .lis
                        .interval(orig)
                        .vn_info_at(idx.reg_slot(false))
                        .is_some_and(|vn| {
                            SlotIndex::is_same_instr(env.lis.interval(orig)[vn].def, idx)
                        });
                if is_orig_def {
                    dest = Some(d);
                }
            }
        }
        let is_copy = data.opcode.is_copy();
        let is_remat = data.is_trivially_rematerializable();

        let mut reads_phys = false;
        let mut has_live_vreg_uses = false;
        let mut regs_to_erase: SmallVec<[VirtReg; 4]> = SmallVec::new();
        let operands: SmallVec<[Operand; 4]> = data.operands.clone();
        for op in &operands {
            let vreg = match op.reg() {
                Some(Reg::Virt(v)) => v,
                Some(Reg::Phys(p)) => {
                    if !op.is_def() && !env.isa.reserved_regs().contains(p) {
                        reads_phys = true;
                    }
                    continue;
                }
                None => continue,
            };
            if !env.lis.has_interval(vreg) {
                continue;
            }
            let li = env.lis.interval(vreg);

            // Copy reads usually come from splitting and are worth shrinking. Other reads are
            // only shrunk when that is cheap.
            let shrink = (op.reads_reg() && (op.is_def() || is_copy))
                || (op.reads_reg()
                    && (env.func.reg_uses(vreg).count() == 1 || li.query(idx).is_kill()));
            if shrink {
                if !to_shrink.contains(&vreg) {
                    to_shrink.push(vreg);
                }
            } else if op.reads_reg() {
                has_live_vreg_uses = true;
            }

            if op.is_def() {
                let def_slot = idx.reg_slot(op.is_early_clobber());
                let defined = |range: &crate::regalloc::LiveRange| {
                    range
                        .vn_info_at(def_slot)
                        .filter(|&vn| SlotIndex::is_same_instr(range[vn].def, idx))
                };
                if let Some(vn) = defined(&li.range) {
                    if let Some(delegate) = self.delegate.as_deref_mut() {
                        delegate.will_shrink_virt_reg(env, vreg);
                    }
                    let li = env.lis.interval_mut(vreg);
                    li.range.remove_value_no(vn);
                    for sr in &mut li.subranges {
                        if let Some(svn) = defined(&sr.range) {
                            sr.range.remove_value_no(svn);
                        }
                    }
                    li.remove_empty_sub_ranges();
                }
                if env.lis.interval(vreg).is_empty() {
                    regs_to_erase.push(vreg);
                }
            }
        }

        if reads_phys {
            // Keep the physical register reads alive with a kill.
            trace!("Converting dead {inst} to a kill");
            env.func.set_opcode(inst, crate::ir::Opcode::Kill);
            for i in (0..env.func[inst].operands.len()).rev() {
                if env.func[inst].operands[i].phys_reg().is_none() {
                    env.func.remove_operand(inst, i);
                }
            }
        } else if let Some(dest) = dest.filter(|_| !has_live_vreg_uses && is_remat) {
            // Later remats clone this def, so keep it around with a fresh dead register.
            let new = self.create_empty_interval_from(dest, env);
            self.new_regs.pop();
            let def = idx.reg_slot(false);
            let li = env.lis.interval_mut(new);
            let vn = li.range.get_next_value(def);
            li.range.add_segment(Segment::new(def, def.dead_slot(), vn));
            env.func.set_operand_reg(inst, 0, Reg::Virt(new));
            env.func.set_operand_flag(inst, 0, OperandFlags::DEAD, true);
            trace!("Keeping dead remat {inst} as {new}");
            env.dead_remats.push(inst);
        } else {
            if let Some(delegate) = self.delegate.as_deref_mut() {
                delegate.will_erase_inst(env, inst);
            }
            env.remove_inst(inst);
            env.stats.dce_deleted += 1;
        }

        for vreg in regs_to_erase {
            if env.func.reg_empty(vreg) {
                self.erase_virt_reg(vreg, env);
            }
        }
    }

    /// Compute the spill weight and hint of every new register.
    pub fn calculate_reg_class_and_hint(&self, env: &mut RegAllocEnv) {
        for &vreg in &self.new_regs {
            if env.lis.has_interval(vreg) && !env.lis.interval(vreg).is_empty() {
                env.calculate_spill_weight_and_hint(vreg);
            }
        }
    }
}
