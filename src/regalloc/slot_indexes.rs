//! Program point numbering.
//!
//! Every block start and every instruction gets an entry in an ordered list of index entries.
//! Each entry has a number, and a `SlotIndex` is an entry number combined with one of four
//! sub-slots. Numbers are spaced `instr_dist` apart so new instructions can be numbered between
//! their neighbours. When a gap is exhausted, the entries following the insertion point are
//! renumbered with half spacing until they catch up with the existing numbers.
//!
//! Renumbering changes the value of stored slot indexes. Every renumbering is appended to a log,
//! and holders of slot indexes remember the log generation they were computed at so they can
//! remap their points with `SlotIndexes::remap`.

use crate::entity::packed_option::{PackedOption, ReservedValue};
use crate::entity::{entity_impl, PrimaryMap, SecondaryMap};
use crate::ir::{Block, Function, Inst};
use crate::timing::{self, Pass};
use crate::trace;
use core::cmp;
use core::fmt;
use rustc_hash::FxHashMap;

/// Default distance between the numbers of consecutive entries.
pub const INSTR_DIST: u64 = 16;

/// The sub-slots of an instruction, in program order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    /// Block boundary. Live ranges entering a block or an instruction start here.
    Block = 0,
    /// Early-clobber defs are written before the instruction reads its uses.
    EarlyClobber = 1,
    /// Normal register uses and defs.
    Register = 2,
    /// Dead defs end here.
    Dead = 3,
}

impl Slot {
    fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => Self::Block,
            1 => Self::EarlyClobber,
            2 => Self::Register,
            _ => Self::Dead,
        }
    }
}

/// A program point: an entry number and a sub-slot.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u64);

impl SlotIndex {
    /// Create a slot index from an entry number and a slot.
    pub fn new(number: u64, slot: Slot) -> Self {
        debug_assert!(number < (u64::MAX >> 2));
        Self((number << 2) | slot as u64)
    }

    /// The entry number.
    pub fn number(self) -> u64 {
        self.0 >> 2
    }

    /// The sub-slot.
    pub fn slot(self) -> Slot {
        Slot::from_bits(self.0)
    }

    /// The same entry with another slot.
    pub fn with_slot(self, slot: Slot) -> Self {
        Self::new(self.number(), slot)
    }

    /// The block slot of this entry.
    pub fn base(self) -> Self {
        self.with_slot(Slot::Block)
    }

    /// The register slot of this entry, or the early-clobber slot when `ec` is set.
    pub fn reg_slot(self, ec: bool) -> Self {
        self.with_slot(if ec { Slot::EarlyClobber } else { Slot::Register })
    }

    /// The dead slot of this entry.
    pub fn dead_slot(self) -> Self {
        self.with_slot(Slot::Dead)
    }

    /// Is this a block boundary slot?
    pub fn is_block(self) -> bool {
        self.slot() == Slot::Block
    }

    /// Is this an early-clobber slot?
    pub fn is_early_clobber(self) -> bool {
        self.slot() == Slot::EarlyClobber
    }

    /// Is this a register slot (early-clobber or normal)?
    pub fn is_register(self) -> bool {
        matches!(self.slot(), Slot::EarlyClobber | Slot::Register)
    }

    /// Is this a dead slot?
    pub fn is_dead(self) -> bool {
        self.slot() == Slot::Dead
    }

    /// Do `a` and `b` refer to the same instruction?
    pub fn is_same_instr(a: Self, b: Self) -> bool {
        a.number() == b.number()
    }

    /// Is `a` strictly before `b`, ignoring slots?
    pub fn is_earlier_instr(a: Self, b: Self) -> bool {
        a.number() < b.number()
    }

    /// The point immediately before this one in the total order.
    ///
    /// This doesn't have to be a point of an existing entry. It is only meaningful for ordering.
    pub fn prev_slot(self) -> Self {
        Self(self.0 - 1)
    }

    /// The point immediately after this one in the total order.
    pub fn next_slot(self) -> Self {
        Self(self.0 + 1)
    }

    /// The distance between two points, in slots.
    pub fn distance(self, other: Self) -> i64 {
        other.0 as i64 - self.0 as i64
    }

    /// The same slot of the entry now numbered `number`.
    pub fn renumbered(self, number: u64) -> Self {
        Self((number << 2) | (self.0 & 3))
    }
}

impl ReservedValue for SlotIndex {
    fn reserved_value() -> Self {
        Self(u64::MAX)
    }

    fn is_reserved_value(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for SlotIndex {
    fn default() -> Self {
        Self::reserved_value()
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_reserved_value() {
            return f.write_str("invalid");
        }
        let s = match self.slot() {
            Slot::Block => 'B',
            Slot::EarlyClobber => 'e',
            Slot::Register => 'r',
            Slot::Dead => 'd',
        };
        write!(f, "{}{}", self.number(), s)
    }
}

impl fmt::Debug for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One renumbering of a run of consecutive entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Renumbering {
    /// `(old, new)` entry numbers, sorted by old number.
    pub moves: Vec<(u64, u64)>,
}

impl Renumbering {
    /// Apply this renumbering to `idx`.
    pub fn apply(&self, idx: SlotIndex) -> SlotIndex {
        if idx.is_reserved_value() {
            return idx;
        }
        match self.moves.binary_search_by_key(&idx.number(), |&(old, _)| old) {
            Ok(pos) => idx.renumbered(self.moves[pos].1),
            Err(_) => idx,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Entry(u32);
entity_impl!(Entry, "entry");

#[derive(Clone, Debug)]
struct EntryData {
    inst: PackedOption<Inst>,
    number: u64,
    prev: PackedOption<Entry>,
    next: PackedOption<Entry>,
}

/// The program point index of a function.
pub struct SlotIndexes {
    entries: PrimaryMap<Entry, EntryData>,
    by_number: FxHashMap<u64, Entry>,
    inst_entry: SecondaryMap<Inst, PackedOption<Entry>>,
    block_start: SecondaryMap<Block, PackedOption<Entry>>,
    block_pos: SecondaryMap<Block, u32>,
    block_order: Vec<Block>,
    head: PackedOption<Entry>,
    sentinel: PackedOption<Entry>,
    instr_dist: u64,
    log: Vec<Renumbering>,
    valid: bool,
}

impl SlotIndexes {
    /// Create an empty index with the default spacing.
    pub fn new() -> Self {
        Self::with_instr_dist(INSTR_DIST)
    }

    /// Create an empty index spacing entries `dist` apart.
    pub fn with_instr_dist(dist: u64) -> Self {
        assert!(dist > 0);
        Self {
            entries: PrimaryMap::new(),
            by_number: FxHashMap::default(),
            inst_entry: SecondaryMap::new(),
            block_start: SecondaryMap::new(),
            block_pos: SecondaryMap::new(),
            block_order: Vec::new(),
            head: None.into(),
            sentinel: None.into(),
            instr_dist: dist,
            log: Vec::new(),
            valid: false,
        }
    }

    /// Forget all numbering. The renumbering log is kept so generations stay monotone.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_number.clear();
        self.inst_entry.clear();
        self.block_start.clear();
        self.block_pos.clear();
        self.block_order.clear();
        self.head = None.into();
        self.sentinel = None.into();
        self.valid = false;
    }

    /// Has `compute` been called since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Distance between consecutive entries after a full numbering.
    pub fn instr_dist(&self) -> u64 {
        self.instr_dist
    }

    /// Number all blocks and instructions of `func`.
    pub fn compute(&mut self, func: &Function) {
        let _tt = timing::start(Pass::SlotIndexes);
        self.clear();
        let mut number = 0;
        for block in func.layout.blocks() {
            self.block_pos[block] = self.block_order.len() as u32;
            self.block_order.push(block);
            let e = self.append_entry(None, number);
            self.block_start[block] = e.into();
            number += self.instr_dist;
            for inst in func.layout.block_insts(block) {
                let e = self.append_entry(Some(inst), number);
                self.inst_entry[inst] = e.into();
                number += self.instr_dist;
            }
        }
        let e = self.append_entry(None, number);
        self.sentinel = e.into();
        self.valid = true;
    }

    fn append_entry(&mut self, inst: Option<Inst>, number: u64) -> Entry {
        // During a full numbering the most recently pushed entry is the tail of the list.
        let prev = self.entries.keys().next_back();
        let e = self.entries.push(EntryData {
            inst: inst.into(),
            number,
            prev: prev.into(),
            next: None.into(),
        });
        match prev {
            Some(p) => self.entries[p].next = e.into(),
            None => self.head = e.into(),
        }
        self.by_number.insert(number, e);
        e
    }

    fn idx(&self, e: Entry, slot: Slot) -> SlotIndex {
        SlotIndex::new(self.entries[e].number, slot)
    }

    fn entry_of(&self, idx: SlotIndex) -> Option<Entry> {
        self.by_number.get(&idx.number()).copied()
    }

    /// The current renumbering generation.
    pub fn generation(&self) -> u32 {
        self.log.len() as u32
    }

    /// Renumberings that happened after `generation`.
    pub fn renumberings_since(&self, generation: u32) -> &[Renumbering] {
        &self.log[cmp::min(generation as usize, self.log.len())..]
    }

    /// Remap a point computed at `generation` to the current numbering.
    pub fn remap(&self, idx: SlotIndex, generation: u32) -> SlotIndex {
        self.renumberings_since(generation)
            .iter()
            .fold(idx, |idx, r| r.apply(idx))
    }

    /// Does `inst` have an index?
    pub fn has_index(&self, inst: Inst) -> bool {
        self.inst_entry[inst].is_some()
    }

    /// The base index of `inst`, which must be numbered.
    pub fn index_of(&self, inst: Inst) -> SlotIndex {
        match self.try_index_of(inst) {
            Some(idx) => idx,
            None => panic!("{inst} has no slot index"),
        }
    }

    /// The base index of `inst`, if it is numbered.
    pub fn try_index_of(&self, inst: Inst) -> Option<SlotIndex> {
        self.inst_entry[inst]
            .expand()
            .map(|e| self.idx(e, Slot::Block))
    }

    /// The instruction at `idx`, if any. Block boundaries and tombstones have no instruction.
    pub fn instruction_at(&self, idx: SlotIndex) -> Option<Inst> {
        self.entry_of(idx).and_then(|e| self.entries[e].inst.expand())
    }

    /// The first index of `block`.
    pub fn block_start(&self, block: Block) -> SlotIndex {
        match self.block_start[block].expand() {
            Some(e) => self.idx(e, Slot::Block),
            None => panic!("{block} has no slot index"),
        }
    }

    /// The index following the last instruction of `block`. This is the start index of the next
    /// block in the layout.
    pub fn block_end(&self, block: Block) -> SlotIndex {
        let pos = self.block_pos[block] as usize + 1;
        match self.block_order.get(pos) {
            Some(&next) => self.block_start(next),
            None => self.last_index(),
        }
    }

    /// The `[start, end)` range of `block`.
    pub fn block_range(&self, block: Block) -> (SlotIndex, SlotIndex) {
        (self.block_start(block), self.block_end(block))
    }

    /// The index of the final sentinel entry.
    pub fn last_index(&self) -> SlotIndex {
        match self.sentinel.expand() {
            Some(e) => self.idx(e, Slot::Block),
            None => SlotIndex::new(0, Slot::Block),
        }
    }

    /// The index of the first entry.
    pub fn first_index(&self) -> SlotIndex {
        match self.head.expand() {
            Some(e) => self.idx(e, Slot::Block),
            None => SlotIndex::new(0, Slot::Block),
        }
    }

    /// The block containing `idx`.
    pub fn block_at(&self, idx: SlotIndex) -> Option<Block> {
        if idx >= self.last_index() {
            return None;
        }
        let pos = self
            .block_order
            .partition_point(|&b| self.block_start(b) <= idx);
        pos.checked_sub(1).map(|p| self.block_order[p])
    }

    /// Blocks in numbering order.
    pub fn blocks(&self) -> &[Block] {
        &self.block_order
    }

    /// The block following `block` in numbering order.
    pub fn next_block(&self, block: Block) -> Option<Block> {
        self.block_order.get(self.block_pos[block] as usize + 1).copied()
    }

    /// The next entry after `idx` with the same slot.
    pub fn next_index(&self, idx: SlotIndex) -> SlotIndex {
        match self.entry_of(idx).and_then(|e| self.entries[e].next.expand()) {
            Some(n) => self.idx(n, idx.slot()),
            None => self.last_index(),
        }
    }

    /// The previous entry before `idx` with the same slot.
    pub fn prev_index(&self, idx: SlotIndex) -> SlotIndex {
        match self.entry_of(idx).and_then(|e| self.entries[e].prev.expand()) {
            Some(p) => self.idx(p, idx.slot()),
            None => self.first_index(),
        }
    }

    /// The next index after `idx` that has an instruction, keeping the slot. Returns the last
    /// index when there is none.
    pub fn next_nonnull_index(&self, idx: SlotIndex) -> SlotIndex {
        let mut cur = self.entry_of(idx).and_then(|e| self.entries[e].next.expand());
        while let Some(e) = cur {
            if self.entries[e].inst.is_some() {
                return self.idx(e, idx.slot());
            }
            cur = self.entries[e].next.expand();
        }
        self.last_index()
    }

    /// The index of the closest numbered instruction before `inst` in its block, or the block
    /// start.
    pub fn index_before(&self, func: &Function, inst: Inst) -> SlotIndex {
        let mut cur = func.layout.prev_inst(inst);
        while let Some(i) = cur {
            if let Some(idx) = self.try_index_of(i) {
                return idx;
            }
            cur = func.layout.prev_inst(i);
        }
        let block = func.layout.inst_block(inst).expect("instruction not in layout");
        self.block_start(block)
    }

    /// The index of the closest numbered instruction after `inst` in its block, or the block end.
    pub fn index_after(&self, func: &Function, inst: Inst) -> SlotIndex {
        let mut cur = func.layout.next_inst(inst);
        while let Some(i) = cur {
            if let Some(idx) = self.try_index_of(i) {
                return idx;
            }
            cur = func.layout.next_inst(i);
        }
        let block = func.layout.inst_block(inst).expect("instruction not in layout");
        self.block_end(block)
    }

    /// Number a newly inserted instruction and return its base index.
    ///
    /// The new entry is placed after the closest numbered instruction preceding `inst` in the
    /// layout. Its number halves the gap to the following entry, and when there is no gap left
    /// the following entries are renumbered.
    pub fn insert_inst_in_maps(&mut self, func: &Function, inst: Inst) -> SlotIndex {
        debug_assert!(!self.has_index(inst), "{inst} is already numbered");
        let prev_idx = self.index_before(func, inst);
        let prev = self.entry_of(prev_idx).expect("missing entry");
        let next = self.entries[prev].next.expand().expect("block start without successor");
        let (pn, nn) = (self.entries[prev].number, self.entries[next].number);
        let dist = (nn - pn) / 2;

        let e = self.entries.push(EntryData {
            inst: inst.into(),
            number: pn + dist,
            prev: prev.into(),
            next: next.into(),
        });
        self.entries[prev].next = e.into();
        self.entries[next].prev = e.into();
        self.inst_entry[inst] = e.into();

        if dist == 0 {
            self.renumber_from(e);
        } else {
            self.by_number.insert(pn + dist, e);
        }
        self.idx(e, Slot::Block)
    }

    // Renumber `new` and the entries following it with half spacing until the numbers are
    // monotone again. `new` is not yet in `by_number`.
    fn renumber_from(&mut self, new: Entry) {
        let space = cmp::max(self.instr_dist / 2, 1);
        let start = self.entries[new].prev.expand().expect("renumbering the first entry");
        let mut number = self.entries[start].number;
        let mut moves = Vec::new();
        let mut cur = new;
        loop {
            number += space;
            let old = self.entries[cur].number;
            self.entries[cur].number = number;
            if cur != new {
                moves.push((old, number));
            }
            match self.entries[cur].next.expand() {
                Some(n) if self.entries[n].number <= number => cur = n,
                _ => break,
            }
        }

        for &(old, _) in &moves {
            self.by_number.remove(&old);
        }
        self.by_number.insert(self.entries[new].number, new);
        let mut e = self.entries[new].next.expand();
        for _ in 0..moves.len() {
            let n = e.expect("renumbered entry vanished");
            self.by_number.insert(self.entries[n].number, n);
            e = self.entries[n].next.expand();
        }

        trace!(
            "Renumbering {} entries, {}..{} -> {}..{}",
            moves.len(),
            moves.first().map_or(0, |m| m.0),
            moves.last().map_or(0, |m| m.0),
            moves.first().map_or(0, |m| m.1),
            moves.last().map_or(0, |m| m.1),
        );
        self.log.push(Renumbering { moves });
    }

    /// Remove `inst` from the index. Its entry stays behind as a tombstone so existing points
    /// remain ordered.
    pub fn remove(&mut self, inst: Inst) {
        if let Some(e) = self.inst_entry[inst].take() {
            self.entries[e].inst = None.into();
        }
    }

    /// Give the index of `old` to `new`, which must not be numbered yet.
    pub fn replace(&mut self, old: Inst, new: Inst) -> SlotIndex {
        debug_assert!(!self.has_index(new));
        let e = self.inst_entry[old].take().expect("replacing an unnumbered instruction");
        self.entries[e].inst = new.into();
        self.inst_entry[new] = e.into();
        self.idx(e, Slot::Block)
    }

    /// Re-synchronize the index of `block` with the layout between `begin` and `end`.
    ///
    /// Entries whose instruction has left the block become tombstones and instructions without
    /// an index are numbered. `None` bounds mean the block start and end.
    pub fn repair_range(
        &mut self,
        func: &Function,
        block: Block,
        begin: Option<Inst>,
        end: Option<Inst>,
    ) {
        let (start, stop) = (
            begin.and_then(|i| self.try_index_of(i)).unwrap_or(self.block_start(block)),
            end.and_then(|i| self.try_index_of(i)).unwrap_or(self.block_end(block)),
        );
        let mut cur = self.entry_of(start);
        while let Some(e) = cur {
            if self.entries[e].number >= stop.number() {
                break;
            }
            if let Some(inst) = self.entries[e].inst.expand() {
                if func.layout.inst_block(inst) != Some(block) {
                    trace!("Repair: {inst} left {block}");
                    self.remove(inst);
                }
            }
            cur = self.entries[e].next.expand();
        }

        let mut inst = match begin {
            Some(i) => Some(i),
            None => func.layout.first_inst(block),
        };
        while let Some(i) = inst {
            if Some(i) == end {
                break;
            }
            if !self.has_index(i) {
                self.insert_inst_in_maps(func, i);
            }
            inst = func.layout.next_inst(i);
        }
    }

    /// Iterate over the numbered instructions of `block` with their base indexes.
    pub fn block_insts(&self, block: Block) -> impl Iterator<Item = (SlotIndex, Inst)> + '_ {
        let end = self.block_end(block);
        let mut cur = self.block_start[block].expand();
        core::iter::from_fn(move || loop {
            let e = cur?;
            let data = &self.entries[e];
            if data.number >= end.number() {
                return None;
            }
            cur = data.next.expand();
            if let Some(inst) = data.inst.expand() {
                return Some((SlotIndex::new(data.number, Slot::Block), inst));
            }
        })
    }
}

impl fmt::Display for SlotIndexes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut cur = self.head.expand();
        while let Some(e) = cur {
            let data = &self.entries[e];
            match data.inst.expand() {
                Some(inst) => writeln!(f, "{}\t{inst}", data.number)?,
                None => writeln!(f, "{}", data.number)?,
            }
            cur = data.next.expand();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstData, Reg, RegClass};

    fn straight_line() -> (Function, Block, Vec<Inst>) {
        let mut func = Function::with_name("f");
        let v0 = func.new_vreg(RegClass::from_u32(0));
        let b0 = func.append_block();
        let i0 = func.append_inst(b0, InstData::iconst(v0, 1));
        let i1 = func.append_inst(b0, InstData::alu(v0, v0, v0));
        let i2 = func.append_inst(b0, InstData::ret([Reg::Virt(v0)]));
        (func, b0, vec![i0, i1, i2])
    }

    #[test]
    fn slot_order() {
        let a = SlotIndex::new(16, Slot::Block);
        assert!(a < a.reg_slot(true));
        assert!(a.reg_slot(true) < a.reg_slot(false));
        assert!(a.reg_slot(false) < a.dead_slot());
        assert!(a.dead_slot() < SlotIndex::new(17, Slot::Block));
        assert!(SlotIndex::is_same_instr(a, a.dead_slot()));
        assert_eq!(a.dead_slot().next_slot(), SlotIndex::new(17, Slot::Block));
        assert_eq!(a.reg_slot(false).to_string(), "16r");
        assert!(PackedOption::<SlotIndex>::default().is_none());
    }

    #[test]
    fn numbering() {
        let (func, b0, insts) = straight_line();
        let mut sx = SlotIndexes::new();
        sx.compute(&func);
        assert_eq!(sx.block_start(b0).number(), 0);
        assert_eq!(sx.index_of(insts[0]).number(), 16);
        assert_eq!(sx.index_of(insts[2]).number(), 48);
        assert_eq!(sx.block_end(b0), sx.last_index());
        assert_eq!(sx.instruction_at(sx.index_of(insts[1]).reg_slot(false)), Some(insts[1]));
        assert_eq!(sx.instruction_at(sx.block_start(b0)), None);
        assert_eq!(sx.block_at(sx.index_of(insts[1])), Some(b0));
        assert_eq!(sx.block_at(sx.last_index()), None);
        assert_eq!(sx.next_index(sx.index_of(insts[0])), sx.index_of(insts[1]));
        assert_eq!(sx.block_insts(b0).count(), 3);
    }

    #[test]
    fn insertion_halves_gap() {
        let (mut func, b0, insts) = straight_line();
        let mut sx = SlotIndexes::new();
        sx.compute(&func);
        let v = func.new_vreg(RegClass::from_u32(0));
        let new = func.insert_inst_before(insts[1], InstData::iconst(v, 2));
        let idx = sx.insert_inst_in_maps(&func, new);
        assert_eq!(idx.number(), 24);
        assert_eq!(sx.generation(), 0);
        assert_eq!(sx.instruction_at(idx), Some(new));
        assert_eq!(sx.block_at(idx), Some(b0));
    }

    #[test]
    fn renumbering_is_local_and_logged() {
        let (mut func, _b0, insts) = straight_line();
        let mut sx = SlotIndexes::with_instr_dist(2);
        sx.compute(&func);
        let old_i1 = sx.index_of(insts[1]).reg_slot(false);
        let v = func.new_vreg(RegClass::from_u32(0));

        // Gap 2 -> 1 -> 0.
        let a = func.insert_inst_before(insts[1], InstData::iconst(v, 2));
        sx.insert_inst_in_maps(&func, a);
        assert_eq!(sx.generation(), 0);
        let b = func.insert_inst_before(insts[1], InstData::iconst(v, 3));
        sx.insert_inst_in_maps(&func, b);
        assert_eq!(sx.generation(), 1);

        let order: Vec<u64> = [insts[0], a, b, insts[1], insts[2]]
            .iter()
            .map(|&i| sx.index_of(i).number())
            .collect();
        let sorted = {
            let mut s = order.clone();
            s.sort_unstable();
            s.dedup();
            s
        };
        assert_eq!(order, sorted);

        let remapped = sx.remap(old_i1, 0);
        assert_eq!(remapped, sx.index_of(insts[1]).reg_slot(false));
        assert_eq!(sx.instruction_at(remapped), Some(insts[1]));
    }

    #[test]
    fn tombstones_and_repair() {
        let (mut func, b0, insts) = straight_line();
        let mut sx = SlotIndexes::new();
        sx.compute(&func);
        let old = sx.index_of(insts[1]);

        func.remove_inst(insts[1]);
        let v = func.new_vreg(RegClass::from_u32(0));
        let new = func.insert_inst_before(insts[2], InstData::iconst(v, 9));
        sx.repair_range(&func, b0, None, None);

        assert!(!sx.has_index(insts[1]));
        assert_eq!(sx.instruction_at(old), None);
        let idx = sx.index_of(new);
        assert!(idx > sx.index_of(insts[0]) && idx < sx.index_of(insts[2]));
        assert!(idx < old);
        assert_eq!(sx.next_nonnull_index(sx.index_of(insts[0])), idx);
    }
}
