//! Live range splitting.
//!
//! `SplitAnalysis` summarizes how a live interval uses the blocks it is live in. `SplitEditor`
//! carves the interval into new intervals: the caller opens intervals, says where the value
//! enters and leaves each of them, and assigns program point ranges to them. Interval 0 is the
//! complement, holding the value everywhere no other interval was selected.
//!
//! Copies between the intervals are recorded against the existing instructions and only
//! inserted by `finish`, so every program point handed out during a split refers to the
//! numbering the split started with.

use crate::entity::EntitySet;
use crate::ir::{Block, Inst, InstData, OperandFlags, Reg, VirtReg};
use crate::regalloc::env::{InsertPos, RegAllocEnv};
use crate::regalloc::live_range::{LiveRange, ValNo};
use crate::regalloc::live_range_edit::{LiveRangeEdit, Remat};
use crate::regalloc::slot_indexes::{SlotIndex, SlotIndexes};
use crate::settings::SplitSpillMode;
use crate::timing::{self, Pass};
use crate::{fview, trace};
use core::cmp;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;

/// How a live interval uses one block.
///
/// A block with a gap in the interval is described twice: once for the live-in part and once
/// for the live-out part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// The block.
    pub block: Block,
    /// The first use or def in the block.
    pub first_instr: SlotIndex,
    /// The last use or def in the block, or the end of the last segment when not live out.
    pub last_instr: SlotIndex,
    /// The first def in the block, if any.
    pub first_def: Option<SlotIndex>,
    /// Live into the block.
    pub live_in: bool,
    /// Live out of the block.
    pub live_out: bool,
}

impl BlockInfo {
    /// Are all uses in the block on one instruction?
    pub fn is_one_instr(&self) -> bool {
        SlotIndex::is_same_instr(self.first_instr, self.last_instr)
    }
}

/// The block level shape of a live interval.
#[derive(Default)]
pub struct SplitAnalysis {
    cur: Option<VirtReg>,
    use_slots: Vec<SlotIndex>,
    use_blocks: Vec<BlockInfo>,
    through_blocks: EntitySet<Block>,
    num_through_blocks: usize,
    num_gap_blocks: usize,
}

impl SplitAnalysis {
    /// Create an empty analysis.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the current interval.
    pub fn clear(&mut self) {
        self.cur = None;
        self.use_slots.clear();
        self.use_blocks.clear();
        self.through_blocks.clear();
        self.num_through_blocks = 0;
        self.num_gap_blocks = 0;
    }

    /// Analyze the interval of `vreg`.
    pub fn analyze(&mut self, vreg: VirtReg, env: &mut RegAllocEnv) {
        self.clear();
        self.cur = Some(vreg);
        self.analyze_uses(vreg, env);
        if !self.calc_live_block_info(&env.lis.interval(vreg).range, env.lis.indexes()) {
            // A segment ends in a block without uses. Shrinking removes the dangling part.
            trace!("Shrinking dangling {vreg} before analysis");
            env.lis.shrink_to_uses(vreg, fview!(env), None);
            self.use_blocks.clear();
            let ok = self.calc_live_block_info(&env.lis.interval(vreg).range, env.lis.indexes());
            assert!(ok, "{vreg} still has dangling segments after shrinking");
        }
        trace!(
            "Analyzed {vreg}: {} use blocks, {} through blocks, {} gap blocks",
            self.use_blocks.len(),
            self.num_through_blocks,
            self.num_gap_blocks
        );
    }

    fn analyze_uses(&mut self, vreg: VirtReg, env: &RegAllocEnv) {
        // Defs come from the values so early clobbers get their own slot.
        let li = env.lis.interval(vreg);
        for (_, info) in li.valnos() {
            if !info.is_phi_def() && !info.is_unused() {
                self.use_slots.push(info.def);
            }
        }
        let indexes = env.lis.indexes();
        for opref in env.func.reg_operands(vreg) {
            let op = env.func.operand(opref);
            if op.is_def() || op.is_undef() {
                continue;
            }
            if let Some(idx) = indexes.try_index_of(opref.inst) {
                self.use_slots.push(idx.reg_slot(false));
            }
        }
        self.use_slots.sort_unstable();
        // Keep the smaller slot of each instruction.
        self.use_slots.dedup_by(|b, a| SlotIndex::is_same_instr(*a, *b));
    }

    // Fill in `use_blocks` and `through_blocks`. Returns false if a segment ends in a block
    // with no uses.
    fn calc_live_block_info(&mut self, lr: &LiveRange, indexes: &SlotIndexes) -> bool {
        self.through_blocks.clear();
        self.num_through_blocks = 0;
        self.num_gap_blocks = 0;
        let segs = &lr.segments;
        if segs.is_empty() {
            return true;
        }
        let uses = &self.use_slots;
        let mut s = 0;
        let mut u = 0;
        let mut block = match indexes.block_at(segs[0].start) {
            Some(b) => b,
            None => return true,
        };
        loop {
            let (start, stop) = indexes.block_range(block);
            if u == uses.len() || uses[u] >= stop {
                self.num_through_blocks += 1;
                self.through_blocks.insert(block);
                if segs[s].end < stop {
                    return false;
                }
            } else {
                let first_instr = uses[u];
                while u < uses.len() && uses[u] < stop {
                    u += 1;
                }
                let mut bi = BlockInfo {
                    block,
                    first_instr,
                    last_instr: uses[u - 1],
                    first_def: None,
                    live_in: segs[s].start <= start,
                    live_out: true,
                };
                if !bi.live_in {
                    bi.first_def = Some(bi.first_instr);
                }
                // Look for gaps in the block.
                while segs[s].end < stop {
                    let last_stop = segs[s].end;
                    s += 1;
                    if s == segs.len() || segs[s].start >= stop {
                        bi.live_out = false;
                        bi.last_instr = last_stop;
                        break;
                    }
                    if last_stop < segs[s].start {
                        self.num_gap_blocks += 1;
                        let mut live_in_part = bi;
                        live_in_part.live_out = false;
                        live_in_part.last_instr = last_stop;
                        self.use_blocks.push(live_in_part);
                        bi.live_in = false;
                        bi.live_out = true;
                        bi.first_instr = segs[s].start;
                        bi.first_def = Some(segs[s].start);
                    }
                    if bi.first_def.is_none() {
                        bi.first_def = Some(segs[s].start);
                    }
                }
                self.use_blocks.push(bi);
                if s == segs.len() {
                    break;
                }
            }
            // The segment ends exactly at the block end.
            if segs[s].end == stop {
                s += 1;
                if s == segs.len() {
                    break;
                }
            }
            let next = if segs[s].start < stop {
                indexes.next_block(block)
            } else {
                indexes.block_at(segs[s].start)
            };
            block = match next {
                Some(b) => b,
                None => break,
            };
        }
        true
    }

    /// The analyzed register.
    pub fn reg(&self) -> VirtReg {
        self.cur
            .unwrap_or_else(|| panic!("no interval analyzed"))
    }

    /// Sorted slots of the instructions using or defining the register.
    pub fn use_slots(&self) -> &[SlotIndex] {
        &self.use_slots
    }

    /// Blocks with uses or defs.
    pub fn use_blocks(&self) -> &[BlockInfo] {
        &self.use_blocks
    }

    /// Blocks the register is live through without uses.
    pub fn through_blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.through_blocks.keys().filter(move |&b| self.through_blocks.contains(b))
    }

    /// Is `block` a live-through block without uses?
    pub fn is_through_block(&self, block: Block) -> bool {
        self.through_blocks.contains(block)
    }

    /// The number of live-through blocks.
    pub fn num_through_blocks(&self) -> usize {
        self.num_through_blocks
    }

    /// The number of blocks the register is live in.
    pub fn num_live_blocks(&self) -> usize {
        self.use_blocks.len() - self.num_gap_blocks + self.num_through_blocks
    }

    /// Should the uses in `bi` be isolated in a block-local interval?
    ///
    /// With `single_instrs`, a block with a single using instruction qualifies too, unless the
    /// instruction is a copy or the use was already produced by an earlier split.
    pub fn should_split_single_block(
        &self,
        bi: &BlockInfo,
        single_instrs: bool,
        env: &RegAllocEnv,
    ) -> bool {
        if !bi.is_one_instr() {
            return true;
        }
        if !single_instrs {
            return false;
        }
        if bi.live_in && bi.live_out {
            return true;
        }
        let copy_like = env
            .lis
            .indexes()
            .instruction_at(bi.first_instr)
            .is_some_and(|inst| env.func[inst].opcode.is_copy());
        if copy_like {
            return false;
        }
        self.is_original_endpoint(bi.first_instr, env)
    }

    // Does the original interval begin or end at `idx`?
    fn is_original_endpoint(&self, idx: SlotIndex, env: &RegAllocEnv) -> bool {
        let original = env.vrm.original(self.reg());
        if !env.lis.has_interval(original) {
            return false;
        }
        let segs = &env.lis.interval(original).segments;
        let i = segs.partition_point(|s| s.end <= idx);
        if i < segs.len() && segs[i].start <= idx {
            return segs[i].start == idx;
        }
        i > 0 && segs[i - 1].end == idx
    }

    /// Collect the blocks using the register in more than one instruction. Returns false if
    /// there is nothing to gain from splitting them off.
    pub fn get_multi_use_blocks(&self, blocks: &mut Vec<Block>) -> bool {
        if self.use_slots.is_empty() || self.num_live_blocks() <= 1 {
            return false;
        }
        for bi in &self.use_blocks {
            if !bi.is_one_instr() && !blocks.contains(&bi.block) {
                blocks.push(bi.block);
            }
        }
        !blocks.is_empty()
    }
}

/// The number of blocks `lr` is live in.
pub fn count_live_blocks(lr: &LiveRange, indexes: &SlotIndexes) -> usize {
    let segs = &lr.segments;
    if segs.is_empty() {
        return 0;
    }
    let mut block = match indexes.block_at(segs[0].start) {
        Some(b) => b,
        None => return 0,
    };
    let mut stop = indexes.block_end(block);
    let mut count = 0;
    let mut s = 0;
    loop {
        count += 1;
        s += segs[s..].partition_point(|seg| seg.end <= stop);
        if s == segs.len() {
            return count;
        }
        loop {
            block = match indexes.next_block(block) {
                Some(b) => b,
                None => return count,
            };
            stop = indexes.block_end(block);
            if stop > segs[s].start {
                break;
            }
        }
    }
}

/// Assignment of program point ranges to split intervals. Unassigned points belong to the
/// complement.
#[derive(Default, Debug)]
struct RegAssign {
    // start -> (end, interval)
    map: BTreeMap<SlotIndex, (SlotIndex, usize)>,
}

impl RegAssign {
    fn insert(&mut self, start: SlotIndex, end: SlotIndex, intv: usize) {
        if start >= end {
            return;
        }
        // Trim the range overlapping `start` from the left.
        if let Some((&s, &(e, v))) = self.map.range(..start).next_back() {
            if e > start {
                self.map.insert(s, (start, v));
                if e > end {
                    self.map.insert(end, (e, v));
                }
            }
        }
        // Drop or trim the ranges starting inside `[start, end)`.
        let inside: Vec<SlotIndex> = self.map.range(start..end).map(|(&s, _)| s).collect();
        for s in inside {
            if let Some((e, v)) = self.map.remove(&s) {
                if e > end {
                    self.map.insert(end, (e, v));
                }
            }
        }
        self.map.insert(start, (end, intv));
    }

    fn lookup(&self, idx: SlotIndex) -> usize {
        match self.map.range(..=idx).next_back() {
            Some((_, &(end, intv))) if idx < end => intv,
            _ => 0,
        }
    }
}

// A copy or remat recorded by the editor.
#[derive(Clone, Debug)]
struct PendingCopy {
    pos: InsertPos,
    // The point where the copy defines its interval.
    def: SlotIndex,
    // The point where the copy reads the parent value.
    read: SlotIndex,
    intv: usize,
    parent_vn: ValNo,
    remat: Option<Remat>,
}

/// Edits a live interval into several new ones.
pub struct SplitEditor<'e, 'd> {
    edit: &'e mut LiveRangeEdit<'d>,
    mode: SplitSpillMode,
    parent: VirtReg,
    // Index in `edit` of the complement.
    first: usize,
    num_intervals: usize,
    open: Option<usize>,
    reg_assign: RegAssign,
    copies: Vec<PendingCopy>,
}

impl<'e, 'd> SplitEditor<'e, 'd> {
    /// Prepare to split the parent register of `edit`.
    pub fn new(edit: &'e mut LiveRangeEdit<'d>, mode: SplitSpillMode) -> Self {
        let parent = edit.reg();
        let first = edit.len();
        Self {
            edit,
            mode,
            parent,
            first,
            num_intervals: 0,
            open: None,
            reg_assign: RegAssign::default(),
            copies: Vec::new(),
        }
    }

    fn intv_reg(&self, intv: usize) -> VirtReg {
        self.edit.get(self.first + intv)
    }

    fn open_intv_index(&self) -> usize {
        self.open
            .unwrap_or_else(|| panic!("no open interval"))
    }

    fn parent_li<'a>(&self, env: &'a RegAllocEnv) -> &'a LiveRange {
        &env.lis.interval(self.parent).range
    }

    /// Create a new interval and select it. Returns its index.
    pub fn open_intv(&mut self, env: &mut RegAllocEnv) -> usize {
        if self.num_intervals == 0 {
            self.edit.create_empty_interval(env);
            self.num_intervals = 1;
        }
        self.edit.create_empty_interval(env);
        let idx = self.num_intervals;
        self.num_intervals += 1;
        self.open = Some(idx);
        trace!("Opened split interval {idx}");
        idx
    }

    /// The number of intervals created so far, including the complement.
    pub fn num_intervals(&self) -> usize {
        self.num_intervals
    }

    /// Select a previously opened interval.
    pub fn select_intv(&mut self, idx: usize) {
        assert!(idx > 0 && idx < self.num_intervals, "bad split interval {idx}");
        self.open = Some(idx);
    }

    /// Finish with the open interval.
    pub fn close_intv(&mut self) {
        assert!(self.open.is_some(), "no open interval");
        self.open = None;
    }

    // Record a def of `intv` with `parent_vn` at `pos`, rematerializing when that is as cheap
    // as a copy.
    fn def_from_parent(
        &mut self,
        intv: usize,
        parent_vn: ValNo,
        (pos, def, read): (InsertPos, SlotIndex, SlotIndex),
        env: &RegAllocEnv,
    ) -> SlotIndex {
        let original = env.vrm.original(self.parent);
        let mut remat = None;
        if env.lis.has_interval(original) {
            if let Some(orig_vn) = env.lis.interval(original).vn_info_at(def) {
                let mut rm = Remat::new(parent_vn);
                rm.orig_vn = Some(orig_vn);
                if self.edit.can_rematerialize_at(&mut rm, def, true, env) {
                    remat = Some(rm);
                }
            }
        }
        trace!(
            "Split copy of {parent_vn} into interval {intv} at {def}{}",
            if remat.is_some() { " (remat)" } else { "" }
        );
        self.copies.push(PendingCopy {
            pos,
            def,
            read,
            intv,
            parent_vn,
            remat,
        });
        def
    }

    /// Enter the open interval before the instruction at `idx`. Returns the start of the
    /// interval.
    pub fn enter_intv_before(&mut self, idx: SlotIndex, env: &mut RegAllocEnv) -> SlotIndex {
        let open = self.open_intv_index();
        let at = before_point(idx, env);
        let parent_vn = match self.parent_li(env).vn_info_at(at.1) {
            Some(vn) => vn,
            None => return idx.base().next_slot(),
        };
        self.def_from_parent(open, parent_vn, at, env)
    }

    /// Enter the open interval after the instruction at `idx`.
    pub fn enter_intv_after(&mut self, idx: SlotIndex, env: &mut RegAllocEnv) -> SlotIndex {
        let open = self.open_intv_index();
        let boundary = idx.dead_slot();
        let parent_vn = match self.parent_li(env).vn_info_at(boundary) {
            Some(vn) => vn,
            None => return boundary.next_slot(),
        };
        let at = after_point(boundary, env);
        self.def_from_parent(open, parent_vn, at, env)
    }

    /// Enter the open interval at the last split point of `block` and use it to the block end.
    pub fn enter_intv_at_end(&mut self, block: Block, env: &mut RegAllocEnv) -> SlotIndex {
        let open = self.open_intv_index();
        let end = env.lis.indexes().block_end(block);
        let parent_vn = match self.parent_li(env).vn_info_at(end.prev_slot()) {
            Some(vn) => vn,
            None => return end,
        };
        let at = end_point(block, env);
        let def = self.def_from_parent(open, parent_vn, at, env);
        self.reg_assign.insert(def, end, open);
        def
    }

    /// Assign `[start, end)` to the open interval.
    pub fn use_intv(&mut self, start: SlotIndex, end: SlotIndex) {
        let open = self.open_intv_index();
        trace!("Use interval {open} in [{start}, {end})");
        self.reg_assign.insert(start, end, open);
    }

    /// Assign the whole of `block` to the open interval.
    pub fn use_intv_block(&mut self, block: Block, env: &RegAllocEnv) {
        let (start, end) = env.lis.indexes().block_range(block);
        self.use_intv(start, end);
    }

    /// Leave the open interval after the instruction at `idx`, copying back to the complement.
    pub fn leave_intv_after(&mut self, idx: SlotIndex, env: &mut RegAllocEnv) -> SlotIndex {
        self.open_intv_index();
        let boundary = idx.dead_slot();
        let parent_vn = match self.parent_li(env).vn_info_at(boundary) {
            Some(vn) => vn,
            None => return boundary.next_slot(),
        };
        let inst = env.lis.indexes().instruction_at(boundary);
        // Outside partition mode, copy before a reading instruction so the complement starts
        // early and the open interval ends at the read.
        if let Some(inst) = inst {
            let parent_def = self.parent_li(env)[parent_vn].def;
            if self.mode != SplitSpillMode::Partition
                && !SlotIndex::is_same_instr(parent_def, idx)
                && env.func[inst].reads_virt_reg(self.parent)
            {
                let base = boundary.base();
                let pos = (InsertPos::Before(inst), base, base.prev_slot());
                self.def_from_parent(0, parent_vn, pos, env);
                return idx;
            }
        }
        let at = after_point(boundary, env);
        self.def_from_parent(0, parent_vn, at, env)
    }

    /// Leave the open interval before the instruction at `idx`.
    pub fn leave_intv_before(&mut self, idx: SlotIndex, env: &mut RegAllocEnv) -> SlotIndex {
        self.open_intv_index();
        let at = before_point(idx, env);
        let parent_vn = match self.parent_li(env).vn_info_at(at.1) {
            Some(vn) => vn,
            None => return idx.base().next_slot(),
        };
        self.def_from_parent(0, parent_vn, at, env)
    }

    /// Leave the open interval at the top of `block`, which must be live in.
    pub fn leave_intv_at_top(&mut self, block: Block, env: &mut RegAllocEnv) -> SlotIndex {
        let open = self.open_intv_index();
        let start = env.lis.indexes().block_start(block);
        let parent_vn = match self.parent_li(env).vn_info_at(start) {
            Some(vn) => vn,
            None => return start,
        };
        let def = self.def_from_parent(
            0,
            parent_vn,
            (InsertPos::Top(block), start.dead_slot(), start),
            env,
        );
        self.reg_assign.insert(start, def, open);
        def
    }

    /// Assign `[start, end)` to the open interval while the complement stays live there too.
    /// The range must not cross a def of the parent.
    pub fn overlap_intv(&mut self, start: SlotIndex, end: SlotIndex, env: &RegAllocEnv) {
        let open = self.open_intv_index();
        debug_assert_eq!(
            self.parent_li(env).vn_info_at(start),
            self.parent_li(env).vn_info_before(end),
            "overlap range crosses a def"
        );
        trace!("Overlap interval {open} in [{start}, {end})");
        self.reg_assign.insert(start, end, open);
    }

    /// Isolate the uses of `bi` in a new interval.
    pub fn split_single_block(&mut self, bi: &BlockInfo, env: &mut RegAllocEnv) {
        self.open_intv(env);
        let lsp = env.last_split_point(bi.block);
        let seg_start = self.enter_intv_before(cmp::min(bi.first_instr, lsp), env);
        if !bi.live_out || bi.last_instr < lsp {
            let end = self.leave_intv_after(bi.last_instr, env);
            self.use_intv(seg_start, end);
        } else {
            // The last use is after the last split point.
            let seg_stop = self.leave_intv_before(lsp, env);
            self.use_intv(seg_start, seg_stop);
            self.overlap_intv(seg_stop, bi.last_instr, env);
        }
    }

    /// Split a block without uses the register is live through.
    ///
    /// `intv_in` and `intv_out` are the intervals live into and out of the block, `None` for the
    /// stack. `leave_before` is the first interference for `intv_in` and `enter_after` the last
    /// interference for `intv_out`.
    pub fn split_live_through_block(
        &mut self,
        block: Block,
        intv_in: Option<usize>,
        leave_before: Option<SlotIndex>,
        intv_out: Option<usize>,
        enter_after: Option<SlotIndex>,
        env: &mut RegAllocEnv,
    ) {
        let (start, stop) = env.lis.indexes().block_range(block);
        trace!("{block} [{start};{stop}) live through, intv in {intv_in:?}, out {intv_out:?}");
        debug_assert!(intv_in.is_some() || intv_out.is_some(), "isolated block");
        debug_assert!(leave_before.map_or(true, |l| l < stop), "interference after block");
        debug_assert!(enter_after.map_or(true, |e| e >= start), "interference before block");

        let intv_out = match intv_out {
            Some(out) => out,
            None => {
                // Spill on entry.
                if let Some(intv_in) = intv_in {
                    self.select_intv(intv_in);
                    self.leave_intv_at_top(block, env);
                }
                return;
            }
        };
        let intv_in = match intv_in {
            Some(i) => i,
            None => {
                // Reload on exit.
                self.select_intv(intv_out);
                self.enter_intv_at_end(block, env);
                return;
            }
        };

        if intv_in == intv_out && leave_before.is_none() && enter_after.is_none() {
            // Straight through.
            self.select_intv(intv_out);
            self.use_intv(start, stop);
            return;
        }

        let lsp = env.last_split_point(block);
        let disjoint = match (leave_before, enter_after) {
            (Some(l), Some(e)) => l.base() > e.dead_slot(),
            _ => true,
        };
        if intv_in != intv_out && disjoint {
            // Switch intervals between the interferences.
            self.select_intv(intv_out);
            let idx = match leave_before {
                Some(l) if l < lsp => {
                    let idx = self.enter_intv_before(l, env);
                    self.use_intv(idx, stop);
                    idx
                }
                _ => self.enter_intv_at_end(block, env),
            };
            self.select_intv(intv_in);
            self.use_intv(start, idx);
            return;
        }

        // The interferences overlap: leave `intv_in` before them and enter `intv_out` after.
        self.select_intv(intv_out);
        let idx = match enter_after {
            Some(e) => self.enter_intv_after(e, env),
            None => self.enter_intv_at_end(block, env),
        };
        self.use_intv(idx, stop);

        self.select_intv(intv_in);
        let idx = match leave_before {
            Some(l) => self.leave_intv_before(l, env),
            None => self.leave_intv_at_top(block, env),
        };
        self.use_intv(start, idx);
    }

    /// Split a block where the register is live in to `intv_in` and has uses. `leave_before`
    /// is the first interference for `intv_in`.
    pub fn split_reg_in_block(
        &mut self,
        bi: &BlockInfo,
        intv_in: usize,
        leave_before: Option<SlotIndex>,
        env: &mut RegAllocEnv,
    ) {
        let (start, _) = env.lis.indexes().block_range(bi.block);
        debug_assert!(bi.live_in, "{} isn't live in", bi.block);

        if !bi.live_out && leave_before.map_or(true, |l| l >= bi.last_instr) {
            // Killed before the interference.
            self.select_intv(intv_in);
            self.use_intv(start, bi.last_instr);
            return;
        }

        let lsp = env.last_split_point(bi.block);
        if leave_before.map_or(true, |l| l > bi.last_instr.dead_slot()) {
            // Live out on the stack, leave after the last use.
            self.select_intv(intv_in);
            if bi.last_instr < lsp {
                let idx = self.leave_intv_after(bi.last_instr, env);
                self.use_intv(start, idx);
            } else {
                let idx = self.leave_intv_before(lsp, env);
                self.overlap_intv(idx, bi.last_instr, env);
                self.use_intv(start, idx);
            }
            return;
        }

        // The interference overlaps the uses: they get a local interval.
        let leave_before = leave_before.unwrap_or(lsp);
        self.open_intv(env);
        if !bi.live_out || bi.last_instr < lsp {
            let to = self.leave_intv_after(bi.last_instr, env);
            let from = self.enter_intv_before(leave_before, env);
            self.use_intv(from, to);
            self.select_intv(intv_in);
            self.use_intv(start, from);
            return;
        }

        // Late last use: copy to the stack before the last split point.
        let to = self.leave_intv_before(lsp, env);
        self.overlap_intv(to, bi.last_instr, env);
        let from = self.enter_intv_before(cmp::min(to, leave_before), env);
        self.use_intv(from, to);
        self.select_intv(intv_in);
        self.use_intv(start, from);
    }

    /// Split a block where the register has uses and is live out in `intv_out`. `enter_after`
    /// is the last interference for `intv_out`.
    pub fn split_reg_out_block(
        &mut self,
        bi: &BlockInfo,
        intv_out: usize,
        enter_after: Option<SlotIndex>,
        env: &mut RegAllocEnv,
    ) {
        let (_, stop) = env.lis.indexes().block_range(bi.block);
        debug_assert!(bi.live_out, "{} isn't live out", bi.block);

        if !bi.live_in && enter_after.map_or(true, |e| e <= bi.first_instr) {
            // Defined after the interference.
            self.select_intv(intv_out);
            self.use_intv(bi.first_instr, stop);
            return;
        }

        if enter_after.map_or(true, |e| e < bi.first_instr.base()) {
            // Reload after the interference.
            self.select_intv(intv_out);
            let lsp = env.last_split_point(bi.block);
            let idx = self.enter_intv_before(cmp::min(lsp, bi.first_instr), env);
            self.use_intv(idx, stop);
            return;
        }

        // The interference overlaps the uses: they get a local interval.
        let enter_after = enter_after.unwrap_or(bi.first_instr);
        self.select_intv(intv_out);
        let idx = self.enter_intv_after(enter_after, env);
        self.use_intv(idx, stop);

        self.open_intv(env);
        let from = self.enter_intv_before(cmp::min(idx, bi.first_instr), env);
        self.use_intv(from, idx);
    }

    /// Insert the recorded copies and compute the new intervals.
    ///
    /// `lr_map`, when given, receives for each new register the interval it came from.
    pub fn finish(mut self, lr_map: Option<&mut Vec<usize>>, env: &mut RegAllocEnv) {
        let _tt = timing::start(Pass::Split);
        self.open = None;
        if self.num_intervals == 0 {
            if let Some(map) = lr_map {
                map.clear();
            }
            return;
        }

        if self.mode != SplitSpillMode::Partition {
            self.hoist_copies(env);
        }

        // Parent defs whose every use may have been rematerialized.
        let mut remat_victims: Vec<Inst> = Vec::new();
        {
            let parent = self.parent_li(env);
            let indexes = env.lis.indexes();
            let mut seen = FxHashSet::default();
            for copy in &self.copies {
                if copy.remat.is_some() && seen.insert(copy.parent_vn) {
                    if let Some(inst) = indexes.instruction_at(parent[copy.parent_vn].def) {
                        remat_victims.push(inst);
                    }
                }
            }
        }

        self.rewrite_assigned(env);

        // Resolve every copy source before inserting anything.
        let sources: Vec<usize> = self
            .copies
            .iter()
            .map(|c| self.reg_assign.lookup(c.read))
            .collect();
        let mut inserted: Vec<Inst> = Vec::new();
        for (copy, src) in self.copies.iter().zip(sources) {
            let dest = self.intv_reg(copy.intv);
            match &copy.remat {
                Some(remat) => {
                    let def = self.edit.rematerialize_at(copy.pos, dest, remat, env);
                    if let Some(inst) = env.lis.indexes().instruction_at(def) {
                        inserted.push(inst);
                    }
                }
                None if src == copy.intv => {
                    trace!("Dropping identity split copy into interval {src}");
                }
                None => {
                    let from = self.intv_reg(src);
                    let (inst, _) = env.insert_inst(copy.pos, InstData::copy(dest, from));
                    env.stats.copies += 1;
                    inserted.push(inst);
                }
            }
        }

        for i in 0..self.num_intervals {
            let reg = self.intv_reg(i);
            if env.func.reg_empty(reg) {
                self.edit.erase_virt_reg(reg, env);
            } else {
                env.lis.create_and_compute_interval(reg, fview!(env));
            }
        }

        // Inserted copies that are never read, and rematerialized parent defs.
        let mut dead = Vec::new();
        for inst in inserted.into_iter().chain(remat_victims) {
            if mark_dead_defs(inst, env) {
                dead.push(inst);
            }
        }
        if !dead.is_empty() {
            self.edit.eliminate_dead_defs(&mut dead, &[], env);
        }

        let num_regs = self.edit.len() - self.first;
        let mut map: Vec<usize> = (0..num_regs).collect();
        for i in 0..self.num_intervals {
            let reg = self.intv_reg(i);
            if !env.lis.has_interval(reg) || env.lis.interval(reg).is_empty() {
                continue;
            }
            let added = self.edit.split_components(reg, env);
            map.extend(core::iter::repeat(i).take(added));
        }

        self.edit.calculate_reg_class_and_hint(env);
        trace!("Split {} into {} registers", self.parent, map.len());
        if let Some(lr_map) = lr_map {
            *lr_map = map;
        }
    }

    // Rewrite every operand of the parent to the interval assigned at its point.
    fn rewrite_assigned(&mut self, env: &mut RegAllocEnv) {
        let indexes = env.lis.indexes();
        let mut rewrites = Vec::new();
        for opref in env.func.reg_operands(self.parent) {
            let base = match indexes.try_index_of(opref.inst) {
                Some(idx) => idx,
                None => continue,
            };
            let data = &env.func[opref.inst];
            let op = data.operands[opref.index];
            // A tied use must end up in the same register as its def.
            let point = if op.is_def() || op.is_undef() {
                base.reg_slot(op.is_early_clobber())
            } else if let Some(d) = data.ties.tied_def(opref.index) {
                base.reg_slot(data.operands[d].is_early_clobber())
            } else {
                base
            };
            rewrites.push((opref, self.reg_assign.lookup(point)));
        }
        for (opref, intv) in rewrites {
            let reg = self.intv_reg(intv);
            env.func.set_operand_reg(opref.inst, opref.index, Reg::Virt(reg));
            env.func
                .set_operand_flag(opref.inst, opref.index, OperandFlags::KILL, false);
        }
    }

    // Remove complement copies that are dominated by another def of the same value, and merge
    // the rest into one copy in a common dominator.
    fn hoist_copies(&mut self, env: &mut RegAllocEnv) {
        let parent = self.parent_li(env);
        let indexes = env.lis.indexes();

        let mut skip: FxHashSet<ValNo> = FxHashSet::default();
        let mut back_copies: FxHashMap<ValNo, Vec<usize>> = FxHashMap::default();
        let mut order: Vec<ValNo> = Vec::new();
        for (i, copy) in self.copies.iter().enumerate() {
            if copy.remat.is_some() {
                // The complement will probably disappear anyway.
                skip.insert(copy.parent_vn);
            } else if copy.intv == 0 {
                back_copies
                    .entry(copy.parent_vn)
                    .or_insert_with(|| {
                        order.push(copy.parent_vn);
                        Vec::new()
                    })
                    .push(i);
            }
        }

        let mut remove: FxHashSet<usize> = FxHashSet::default();
        let mut hoisted: Vec<(ValNo, Block)> = Vec::new();
        for vn in order {
            if skip.contains(&vn) {
                continue;
            }
            let copies = &back_copies[&vn];
            let parent_def = parent[vn].def;
            if self.reg_assign.lookup(parent_def) == 0 {
                // The complement holds the parent def itself.
                trace!("Complement defines {vn} directly, removing back-copies");
                remove.extend(copies.iter().copied());
                continue;
            }
            if copies.len() < 2 {
                continue;
            }

            // The nearest common dominator of the copies, and the dominating copy if there is
            // one.
            let mut dom: Option<(Block, Option<usize>)> = None;
            let mut cost = 0u64;
            for &c in copies {
                let def = self.copies[c].def;
                let block = match indexes.block_at(def) {
                    Some(b) => b,
                    None => continue,
                };
                cost = cost.saturating_add(env.freqs.block_freq(block));
                dom = Some(match dom {
                    None => (block, Some(c)),
                    Some((b, best)) if b == block => {
                        let earlier = best.map_or(true, |p| def < self.copies[p].def);
                        (b, if earlier { Some(c) } else { best })
                    }
                    Some((b, best)) => {
                        let near = env.domtree.common_dominator(b, block);
                        if near == block {
                            (block, Some(c))
                        } else if near != b {
                            (near, None)
                        } else {
                            (b, best)
                        }
                    }
                });
            }
            let (dom_block, dom_copy) = match dom {
                Some(d) => d,
                None => continue,
            };
            if let Some(keep) = dom_copy {
                remove.extend(copies.iter().copied().filter(|&c| c != keep));
                continue;
            }

            let def_block = match indexes.block_at(parent_def) {
                Some(b) => b,
                None => continue,
            };
            let block = shallow_dominator(dom_block, def_block, env);
            if self.mode == SplitSpillMode::Speed && env.freqs.block_freq(block) > cost {
                trace!("Not hoisting {vn} copies into hotter {block}");
                continue;
            }
            let lsp = env.last_split_point(block);
            if lsp <= parent_def || parent.vn_info_before(lsp) != Some(vn) {
                continue;
            }
            let at = end_point(block, env);
            if self.reg_assign.lookup(at.2) == 0 {
                continue;
            }
            remove.extend(copies.iter().copied());
            hoisted.push((vn, block));
        }

        if remove.is_empty() {
            return;
        }
        let mut i = 0;
        self.copies.retain(|_| {
            let keep = !remove.contains(&i);
            i += 1;
            keep
        });
        for (vn, block) in hoisted {
            trace!("Hoisting back-copies of {vn} into {block}");
            let at = end_point(block, env);
            self.def_from_parent(0, vn, at, env);
        }
    }
}

// Mark the virtual register defs of `inst` dead if none of them is live out. Returns true if
// the instruction defines nothing live.
fn mark_dead_defs(inst: Inst, env: &mut RegAllocEnv) -> bool {
    if !env.func.is_inst_inserted(inst) {
        return false;
    }
    let base = match env.lis.indexes().try_index_of(inst) {
        Some(idx) => idx,
        None => return false,
    };
    let mut defs = Vec::new();
    for (i, op) in env.func[inst].operands.iter().enumerate() {
        if !op.is_def() {
            continue;
        }
        match op.virt_reg() {
            Some(v) => {
                let live_out = env.lis.has_interval(v)
                    && env.lis.interval(v).query(base).value_out().is_some();
                if live_out {
                    return false;
                }
                defs.push(i);
            }
            None if op.reg().is_some() => return false,
            None => {}
        }
    }
    if defs.is_empty() {
        return false;
    }
    for i in defs {
        env.func.set_operand_flag(inst, i, OperandFlags::DEAD, true);
    }
    true
}

// Where a copy placed before the point `idx` goes: the position, its def point and the point
// where it reads the parent.
fn before_point(idx: SlotIndex, env: &RegAllocEnv) -> (InsertPos, SlotIndex, SlotIndex) {
    let indexes = env.lis.indexes();
    if idx.is_dead() {
        if let Some(inst) = indexes.instruction_at(idx) {
            // Right after the instruction.
            return (InsertPos::After(inst), idx, idx.base().reg_slot(false));
        }
    }
    let base = idx.base();
    if let Some(inst) = indexes.instruction_at(base) {
        return (InsertPos::Before(inst), base, base.prev_slot());
    }
    let block = indexes
        .block_at(base)
        .unwrap_or_else(|| panic!("{idx} is outside the function"));
    let start = indexes.block_start(block);
    if base == start {
        return (InsertPos::Top(block), start.dead_slot(), start);
    }
    // A point between instructions: before the next one.
    match indexes.block_insts(block).find(|&(i, _)| i >= base) {
        Some((_, inst)) => (InsertPos::Before(inst), base, base.prev_slot()),
        None => end_point(block, env),
    }
}

// Where a copy placed after the instruction at the dead slot `boundary` goes.
fn after_point(boundary: SlotIndex, env: &RegAllocEnv) -> (InsertPos, SlotIndex, SlotIndex) {
    let indexes = env.lis.indexes();
    if let Some(inst) = indexes.instruction_at(boundary) {
        return (InsertPos::After(inst), boundary, boundary.base().reg_slot(false));
    }
    let block = indexes
        .block_at(boundary)
        .unwrap_or_else(|| panic!("{boundary} is outside the function"));
    let start = indexes.block_start(block);
    (InsertPos::Top(block), start.dead_slot(), start)
}

// Where a copy at the end of `block` goes: before its last split point.
fn end_point(block: Block, env: &RegAllocEnv) -> (InsertPos, SlotIndex, SlotIndex) {
    let indexes = env.lis.indexes();
    if let Some(lsp) = env.isa.last_split_point(env.func, block) {
        let base = indexes.index_of(lsp);
        return (InsertPos::End(block), base, base.prev_slot());
    }
    match env.func.layout.last_inst(block) {
        Some(last) => {
            let base = indexes.index_of(last);
            (InsertPos::End(block), base.dead_slot(), base.reg_slot(false))
        }
        None => {
            let start = indexes.block_start(block);
            (InsertPos::End(block), start.dead_slot(), start)
        }
    }
}

// A dominator of `block` no deeper in loops, not above `def_block`.
fn shallow_dominator(mut block: Block, def_block: Block, env: &RegAllocEnv) -> Block {
    let def_loop = env.loops.innermost_loop(def_block);
    let mut best = block;
    let mut best_depth = u32::MAX;
    loop {
        let lp = match env.loops.innermost_loop(block) {
            Some(lp) => lp,
            // Every dominator is at least as hot.
            None => return block,
        };
        if Some(lp) == def_loop {
            return block;
        }
        let depth = env.loops.loop_depth(block);
        if depth < best_depth {
            best = block;
            best_depth = depth;
        }
        // Leave the loop through the dominator of its header.
        match env.domtree.idom(env.loops.loop_header(lp)) {
            Some(idom) if env.domtree.dominates(def_block, idom) => block = idom,
            _ => return best,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Opcode};
    use crate::isa::generic;
    use crate::regalloc::env::tests::TestEnv;
    use crate::settings::{self, Configurable};

    fn copies_in(func: &Function, block: Block) -> Vec<Inst> {
        func.layout
            .block_insts(block)
            .filter(|&i| func[i].opcode == Opcode::Copy)
            .collect()
    }

    #[test]
    fn block_info_of_a_diamond() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        let b3 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::brif(a, b1, b2));
        func.append_inst(b1, InstData::alu(b, a, a));
        func.append_inst(b1, InstData::jump(b3));
        func.append_inst(b2, InstData::jump(b3));
        func.append_inst(b3, InstData::ret([Reg::Virt(a)]));
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();

        let mut sa = SplitAnalysis::new();
        sa.analyze(a, &mut env);
        assert_eq!(sa.use_slots().len(), 4);
        let blocks: Vec<Block> = sa.use_blocks().iter().map(|bi| bi.block).collect();
        assert_eq!(blocks, vec![b0, b1, b3]);
        assert!(sa.is_through_block(b2));
        assert_eq!(sa.num_through_blocks(), 1);
        assert_eq!(sa.num_live_blocks(), 4);
        assert_eq!(
            count_live_blocks(&env.lis.interval(a).range, env.lis.indexes()),
            4
        );

        let entry = sa.use_blocks()[0];
        assert!(!entry.live_in && entry.live_out);
        assert_eq!(entry.first_def, Some(entry.first_instr));
        let exit = sa.use_blocks()[2];
        assert!(exit.live_in && !exit.live_out);
        assert!(exit.is_one_instr());
        assert!(!sa.should_split_single_block(&exit, false, &env));
        assert!(sa.should_split_single_block(&entry, false, &env));
    }

    #[test]
    fn gap_blocks_are_described_twice() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::alu(b, a, a));
        func.append_inst(b0, InstData::iconst(a, 2));
        func.append_inst(b0, InstData::ret([Reg::Virt(a), Reg::Virt(b)]));
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();

        let mut sa = SplitAnalysis::new();
        sa.analyze(a, &mut env);
        assert_eq!(sa.use_blocks().len(), 2);
        assert!(!sa.use_blocks()[0].live_out);
        assert!(!sa.use_blocks()[1].live_in);
        assert_eq!(sa.num_live_blocks(), 1);
        let mut multi = Vec::new();
        assert!(!sa.get_multi_use_blocks(&mut multi));
    }

    #[test]
    fn single_block_split_isolates_uses() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let x = func.new_vreg(isa.gpr_class());
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let c = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        func.append_inst(b0, InstData::iconst(x, 1));
        func.append_inst(b0, InstData::alu(a, x, x));
        func.append_inst(b0, InstData::jump(b1));
        let use1 = func.append_inst(b1, InstData::alu(b, a, a));
        let use2 = func.append_inst(b1, InstData::alu(c, b, a));
        func.append_inst(b1, InstData::ret([Reg::Virt(c)]));
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();

        let mut sa = SplitAnalysis::new();
        sa.analyze(a, &mut env);
        let bi = *sa
            .use_blocks()
            .iter()
            .find(|bi| bi.block == b1)
            .unwrap();
        assert!(bi.live_in && !bi.live_out);

        let mut edit = LiveRangeEdit::new(Some(a), None);
        let mut se = SplitEditor::new(&mut edit, SplitSpillMode::Partition);
        se.split_single_block(&bi, &mut env);
        se.close_intv();
        let mut lr_map = Vec::new();
        se.finish(Some(&mut lr_map), &mut env);

        assert!(env.func.reg_empty(a));
        assert_eq!(edit.len(), 2);
        assert_eq!(lr_map, vec![0, 1]);
        let (complement, local) = (edit.get(0), edit.get(1));
        // One copy into the local interval before the first use, none back.
        let copies = copies_in(env.func, b1);
        assert_eq!(copies.len(), 1);
        assert_eq!(env.func.layout.next_inst(copies[0]), Some(use1));
        assert_eq!(
            env.func[copies[0]].copy_regs(),
            Some((Reg::Virt(local), Reg::Virt(complement)))
        );
        assert!(env.func[use2].reads_virt_reg(local));
        let li = env.lis.interval(local);
        assert_eq!(li.num_valnos(), 1);
        assert_eq!(env.vrm.original(local), a);
        assert_eq!(env.stats.copies, 1);
        assert!(!env.lis.interval(complement).is_empty());
    }

    #[test]
    fn live_through_block_spills_on_entry() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let x = func.new_vreg(isa.gpr_class());
        let a = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        func.append_inst(b0, InstData::iconst(x, 1));
        func.append_inst(b0, InstData::alu(a, x, x));
        func.append_inst(b0, InstData::jump(b1));
        let through = func.append_inst(b1, InstData::jump(b2));
        func.append_inst(b2, InstData::ret([Reg::Virt(a)]));
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();

        let mut sa = SplitAnalysis::new();
        sa.analyze(a, &mut env);
        assert!(sa.is_through_block(b1));
        let bis: Vec<BlockInfo> = sa.use_blocks().to_vec();

        // Interval 1 holds the value in b0 and into b1, the complement from the top of b1 on.
        let mut edit = LiveRangeEdit::new(Some(a), None);
        let mut se = SplitEditor::new(&mut edit, SplitSpillMode::Partition);
        let intv = se.open_intv(&mut env);
        se.split_reg_out_block(&bis[0], intv, None, &mut env);
        se.split_live_through_block(b1, Some(intv), None, None, None, &mut env);
        se.close_intv();
        se.finish(None, &mut env);

        let (complement, reg) = (edit.get(0), edit.get(1));
        let copy = env.func.layout.prev_inst(through).unwrap();
        assert_eq!(
            env.func[copy].copy_regs(),
            Some((Reg::Virt(complement), Reg::Virt(reg)))
        );
        let indexes = env.lis.indexes();
        assert!(env.lis.interval(reg).live_at(indexes.block_start(b1)));
        assert!(!env.lis.interval(reg).live_at(indexes.block_start(b2)));
        assert!(env.lis.interval(complement).live_at(indexes.block_start(b2)));
    }

    #[test]
    fn size_mode_drops_back_copies_of_complement_defs() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let x = func.new_vreg(isa.gpr_class());
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(x, 1));
        func.append_inst(b0, InstData::alu(a, x, x));
        func.append_inst(b0, InstData::alu(x, x, x));
        let use1 = func.append_inst(b0, InstData::alu(b, a, x));
        func.append_inst(b0, InstData::ret([Reg::Virt(a), Reg::Virt(b)]));
        let flags = settings::Flags::new({
            let mut b = settings::builder();
            b.set("split_spill_mode", "size").unwrap();
            b
        });
        let mut t = TestEnv::with_flags(func, isa, flags);
        let mut env = t.env();
        let use_idx = env.lis.indexes().index_of(use1);

        // A local interval around the middle use.
        let mut edit = LiveRangeEdit::new(Some(a), None);
        let mut se = SplitEditor::new(&mut edit, SplitSpillMode::Size);
        se.open_intv(&mut env);
        let start = se.enter_intv_before(use_idx, &mut env);
        let end = se.leave_intv_after(use_idx.reg_slot(false), &mut env);
        se.use_intv(start, end);
        se.close_intv();
        se.finish(None, &mut env);

        // The complement keeps the original def, so no copy goes back to it.
        let copies = copies_in(env.func, b0);
        assert_eq!(copies.len(), 1);
        let (complement, local) = (edit.get(0), edit.get(1));
        assert_eq!(
            env.func[copies[0]].copy_regs(),
            Some((Reg::Virt(local), Reg::Virt(complement)))
        );
        assert!(env.func[use1].reads_virt_reg(local));
        // Both intervals are live across the use.
        assert!(env.lis.interval(complement).live_at(use_idx));
    }

    #[test]
    fn constants_are_rematerialized_instead_of_copied() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        let def = func.append_inst(b0, InstData::iconst(a, 3));
        func.append_inst(b0, InstData::jump(b1));
        func.append_inst(b1, InstData::alu(b, a, a));
        func.append_inst(b1, InstData::ret([Reg::Virt(b)]));
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();

        let mut sa = SplitAnalysis::new();
        sa.analyze(a, &mut env);
        let bi = *sa.use_blocks().iter().find(|bi| bi.block == b1).unwrap();
        let mut edit = LiveRangeEdit::new(Some(a), None);
        let mut se = SplitEditor::new(&mut edit, SplitSpillMode::Partition);
        se.split_single_block(&bi, &mut env);
        se.close_intv();
        se.finish(None, &mut env);

        assert!(copies_in(env.func, b1).is_empty());
        assert_eq!(env.stats.remats, 1);
        assert_eq!(env.stats.copies, 0);
        // The original def is dead but kept for later remats.
        assert_eq!(env.dead_remats, vec![def]);
    }

    #[test]
    fn only_unread_defs_are_marked_dead() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let read = func.append_inst(b0, InstData::iconst(a, 1));
        let unread = func.append_inst(b0, InstData::iconst(b, 2));
        func.append_inst(b0, InstData::ret([Reg::Virt(a)]));
        let mut t = TestEnv::new(func, isa);
        let mut env = t.env();

        assert!(!mark_dead_defs(read, &mut env));
        assert!(!env.func[read].operands[0].is_dead());
        assert!(mark_dead_defs(unread, &mut env));
        assert!(env.func[unread].operands[0].is_dead());
    }
}
