//! Value numbered live ranges.
//!
//! A live range is a sorted list of non-overlapping `[start, end)` segments of program points,
//! each tagged with the value number that is live across it. A value number identifies one SSA
//! definition of the register. Values defined at a block boundary slot are phi-values: they merge
//! the values flowing in from the predecessors.
//!
//! Live ranges are used for virtual registers (wrapped in `LiveInterval`), register units and
//! stack slots.

use crate::entity::{entity_impl, EntityRef};
use crate::regalloc::slot_indexes::{SlotIndex, SlotIndexes};
use core::fmt;
use core::ops::{Index, IndexMut};

/// A value number: an index into the value table of one live range.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValNo(u32);
entity_impl!(ValNo, "vn");

/// Information about one value number.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VNInfo {
    /// The program point where the value is defined. A block boundary slot means the value is a
    /// phi-value.
    pub def: SlotIndex,
    unused: bool,
}

impl VNInfo {
    fn new(def: SlotIndex) -> Self {
        Self { def, unused: false }
    }

    /// Is this a phi-value?
    pub fn is_phi_def(&self) -> bool {
        self.def.is_block()
    }

    /// Has this value been removed from its range?
    pub fn is_unused(&self) -> bool {
        self.unused
    }

    /// Mark this value as removed.
    pub fn mark_unused(&mut self) {
        self.unused = true;
    }
}

/// A contiguous piece of a live range.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Segment {
    /// First point in the segment.
    pub start: SlotIndex,
    /// Point following the segment.
    pub end: SlotIndex,
    /// The value live across the segment.
    pub valno: ValNo,
}

impl Segment {
    /// Create a segment.
    pub fn new(start: SlotIndex, end: SlotIndex, valno: ValNo) -> Self {
        debug_assert!(start < end, "cannot create empty or inverted segment [{start},{end})");
        Self { start, end, valno }
    }

    /// Does this segment contain `idx`?
    pub fn contains(&self, idx: SlotIndex) -> bool {
        self.start <= idx && idx < self.end
    }

    /// Does this segment contain all of `[start, end)`?
    pub fn contains_interval(&self, start: SlotIndex, end: SlotIndex) -> bool {
        debug_assert!(start < end, "backwards interval");
        self.start <= start && end <= self.end
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{},{}:{})", self.start, self.end, self.valno.as_u32())
    }
}

/// The result of `LiveRange::query`.
///
/// Describes the values of a live range around one instruction: the value live into the
/// instruction, the value live out of it, and whether the instruction kills or defines them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LiveQueryResult {
    early_val: Option<ValNo>,
    late_val: Option<ValNo>,
    end_point: Option<SlotIndex>,
    kill: bool,
}

impl LiveQueryResult {
    /// The value live into the instruction, if any.
    pub fn value_in(&self) -> Option<ValNo> {
        self.early_val
    }

    /// Is the value live into the instruction killed by it? Also true when the instruction
    /// redefines the register with a different value.
    pub fn is_kill(&self) -> bool {
        self.kill
    }

    /// Does the instruction define a value that is never read?
    pub fn is_dead_def(&self) -> bool {
        self.end_point.is_some_and(SlotIndex::is_dead)
    }

    /// The value live out of the instruction, if any. Dead defs aren't live out.
    pub fn value_out(&self) -> Option<ValNo> {
        if self.is_dead_def() {
            None
        } else {
            self.late_val
        }
    }

    /// The value live out of the instruction or defined dead by it.
    pub fn value_out_or_dead(&self) -> Option<ValNo> {
        self.late_val
    }

    /// The value defined by the instruction, if any.
    pub fn value_defined(&self) -> Option<ValNo> {
        if self.early_val == self.late_val {
            None
        } else {
            self.late_val
        }
    }

    /// The end point of the last segment queried.
    pub fn end_point(&self) -> Option<SlotIndex> {
        self.end_point
    }

    /// Is the value live into the instruction also live out? This is the live-through case.
    pub fn is_live_through(&self) -> bool {
        self.early_val.is_some() && self.early_val == self.value_out()
    }
}

/// A value numbered set of program point segments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiveRange {
    /// Sorted, non-overlapping segments.
    pub segments: Vec<Segment>,
    valnos: Vec<VNInfo>,
}

impl Index<ValNo> for LiveRange {
    type Output = VNInfo;

    fn index(&self, vn: ValNo) -> &VNInfo {
        &self.valnos[vn.index()]
    }
}

impl IndexMut<ValNo> for LiveRange {
    fn index_mut(&mut self, vn: ValNo) -> &mut VNInfo {
        &mut self.valnos[vn.index()]
    }
}

impl LiveRange {
    /// Create an empty live range.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all segments and values.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.valnos.clear();
    }

    /// Does the range have no segments?
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of value numbers, including unused ones.
    pub fn num_valnos(&self) -> usize {
        self.valnos.len()
    }

    /// Iterate over all value numbers, including unused ones.
    pub fn valnos(&self) -> impl Iterator<Item = (ValNo, &VNInfo)> + '_ {
        self.valnos
            .iter()
            .enumerate()
            .map(|(i, v)| (ValNo::new(i), v))
    }

    /// Does the range have exactly one value?
    pub fn contains_one_value(&self) -> bool {
        self.valnos.len() == 1
    }

    /// The first point of the range.
    pub fn begin_index(&self) -> SlotIndex {
        self.segments.first().expect("empty live range").start
    }

    /// The point following the range.
    pub fn end_index(&self) -> SlotIndex {
        self.segments.last().expect("empty live range").end
    }

    /// Has the range ended at `idx`?
    pub fn expired_at(&self, idx: SlotIndex) -> bool {
        self.segments.last().map_or(true, |s| idx >= s.end)
    }

    /// Create a new value defined at `def`.
    pub fn get_next_value(&mut self, def: SlotIndex) -> ValNo {
        let vn = ValNo::new(self.valnos.len());
        self.valnos.push(VNInfo::new(def));
        vn
    }

    /// Create a copy of value `orig` of another range.
    pub fn create_value_copy(&mut self, orig: &VNInfo) -> ValNo {
        let vn = ValNo::new(self.valnos.len());
        self.valnos.push(*orig);
        vn
    }

    /// Index of the first segment ending after `pos`.
    pub fn find(&self, pos: SlotIndex) -> usize {
        self.segments.partition_point(|s| s.end <= pos)
    }

    /// The segment containing `idx`, if any.
    pub fn segment_containing(&self, idx: SlotIndex) -> Option<&Segment> {
        let i = self.find(idx);
        self.segments.get(i).filter(|s| s.start <= idx)
    }

    /// Index of the segment containing `idx`, if any.
    pub fn segment_index_containing(&self, idx: SlotIndex) -> Option<usize> {
        let i = self.find(idx);
        self.segments.get(i).filter(|s| s.start <= idx).map(|_| i)
    }

    /// Is the range live at `idx`?
    pub fn live_at(&self, idx: SlotIndex) -> bool {
        self.segment_containing(idx).is_some()
    }

    /// The value live at `idx`.
    pub fn vn_info_at(&self, idx: SlotIndex) -> Option<ValNo> {
        self.segment_containing(idx).map(|s| s.valno)
    }

    /// The value live just before `idx`. This is the value killed at a use slot or live out of a
    /// block whose end is `idx`.
    pub fn vn_info_before(&self, idx: SlotIndex) -> Option<ValNo> {
        self.segment_containing(idx.prev_slot()).map(|s| s.valno)
    }

    /// Describe the liveness around the instruction at `idx`.
    pub fn query(&self, idx: SlotIndex) -> LiveQueryResult {
        let base = idx.base();
        let mut i = self.find(base);
        let mut res = LiveQueryResult {
            early_val: None,
            late_val: None,
            end_point: None,
            kill: false,
        };
        let seg = match self.segments.get(i) {
            Some(s) => *s,
            None => return res,
        };

        // Is this an instruction live-in segment?
        if seg.start <= base {
            res.early_val = Some(seg.valno);
            res.end_point = Some(seg.end);
            // Move to the potentially live-out segment.
            if SlotIndex::is_same_instr(idx, seg.end) {
                res.kill = true;
                i += 1;
                if i == self.segments.len() {
                    return res;
                }
            }
            // A phi-value defined in the middle of a segment is live out of the layout
            // predecessor; it isn't live into this instruction.
            if self[seg.valno].def == base {
                res.early_val = None;
            }
        }

        // Segments starting after the current instruction don't matter.
        let seg = self.segments[i];
        if !SlotIndex::is_earlier_instr(idx, seg.start) {
            res.late_val = Some(seg.valno);
            res.end_point = Some(seg.end);
        }
        res
    }

    /// Add a segment, coalescing with touching segments of the same value.
    ///
    /// Overlapping a segment of a different value is an invariant violation.
    pub fn add_segment(&mut self, seg: Segment) -> ValNo {
        assert!(
            seg.start < seg.end,
            "cannot add empty or inverted segment {seg}"
        );
        let i = self.segments.partition_point(|s| s.start <= seg.start);

        // If the new segment starts in the middle or right at the end of a segment with the same
        // value, extend that one.
        if i > 0 {
            let b = &self.segments[i - 1];
            if b.valno == seg.valno {
                if b.end >= seg.start {
                    self.extend_segment_end_to(i - 1, seg.end);
                    return seg.valno;
                }
            } else {
                assert!(
                    b.end <= seg.start,
                    "{seg} overlaps {b} with a different value"
                );
            }
        }

        // If it ends in the middle of or right before a segment of the same value, merge them.
        if let Some(a) = self.segments.get(i) {
            if a.valno == seg.valno {
                if a.start <= seg.end {
                    let j = self.extend_segment_start_to(i, seg.start);
                    if seg.end > self.segments[j].end {
                        self.extend_segment_end_to(j, seg.end);
                    }
                    return seg.valno;
                }
            } else {
                assert!(
                    a.start >= seg.end,
                    "{seg} overlaps {a} with a different value"
                );
            }
        }

        self.segments.insert(i, seg);
        seg.valno
    }

    // Extend segment `i` to end at `new_end`, merging the segments it now covers.
    fn extend_segment_end_to(&mut self, i: usize, new_end: SlotIndex) {
        let valno = self.segments[i].valno;
        let mut merge_to = i + 1;
        while merge_to < self.segments.len() && new_end >= self.segments[merge_to].end {
            debug_assert_eq!(
                self.segments[merge_to].valno,
                valno,
                "cannot merge with differing values"
            );
            merge_to += 1;
        }
        let mut end = cmp_max(new_end, self.segments[merge_to - 1].end);
        // A touching segment of another value stays separate.
        if let Some(next) = self.segments.get(merge_to) {
            if next.start <= end && next.valno == valno {
                end = next.end;
                merge_to += 1;
            }
        }
        self.segments[i].end = end;
        self.segments.drain(i + 1..merge_to);
    }

    // Extend segment `i` to start at `new_start`, merging the segments it now covers. Returns the
    // index of the merged segment.
    fn extend_segment_start_to(&mut self, i: usize, new_start: SlotIndex) -> usize {
        let valno = self.segments[i].valno;
        let end = self.segments[i].end;
        let mut merge_to = i;
        loop {
            if merge_to == 0 {
                self.segments[i].start = new_start;
                self.segments.drain(0..i);
                return 0;
            }
            debug_assert_eq!(
                self.segments[merge_to].valno,
                valno,
                "cannot merge with differing values"
            );
            merge_to -= 1;
            if new_start > self.segments[merge_to].start {
                break;
            }
        }

        if self.segments[merge_to].end >= new_start && self.segments[merge_to].valno == valno {
            // We start in the middle of another segment; extend it.
            self.segments[merge_to].end = end;
        } else {
            merge_to += 1;
            self.segments[merge_to].start = new_start;
            self.segments[merge_to].end = end;
        }
        self.segments.drain(merge_to + 1..i + 1);
        merge_to
    }

    /// Remove `[start, end)`, which must be inside one segment.
    ///
    /// When `remove_dead_valno` is set and the segment's value has no other segments, the value
    /// is removed as well.
    pub fn remove_segment(&mut self, start: SlotIndex, end: SlotIndex, remove_dead_valno: bool) {
        let i = self.find(start);
        let seg = match self.segments.get(i) {
            Some(s) => *s,
            None => panic!("segment [{start},{end}) is not in range"),
        };
        assert!(
            seg.contains_interval(start, end),
            "segment [{start},{end}) is not entirely in {seg}"
        );

        if seg.start == start {
            if seg.end == end {
                self.segments.remove(i);
                if remove_dead_valno {
                    self.remove_valno_if_dead(seg.valno);
                }
            } else {
                self.segments[i].start = end;
            }
            return;
        }

        if seg.end == end {
            self.segments[i].end = start;
            return;
        }

        // Split the segment in two.
        self.segments[i].end = start;
        self.segments.insert(i + 1, Segment::new(end, seg.end, seg.valno));
    }

    fn remove_valno_if_dead(&mut self, vn: ValNo) {
        if self.segments.iter().all(|s| s.valno != vn) {
            self.mark_valno_for_deletion(vn);
        }
    }

    /// Remove all segments of `vn` and the value itself.
    pub fn remove_value_no(&mut self, vn: ValNo) {
        if self.is_empty() {
            return;
        }
        self.segments.retain(|s| s.valno != vn);
        self.mark_valno_for_deletion(vn);
    }

    // The last value is popped, with any unused values before it. Other values are marked
    // unused and keep their number until `rename_values`.
    fn mark_valno_for_deletion(&mut self, vn: ValNo) {
        if vn.index() + 1 == self.valnos.len() {
            self.valnos.pop();
            while self.valnos.last().is_some_and(VNInfo::is_unused) {
                self.valnos.pop();
            }
        } else {
            self[vn].mark_unused();
        }
    }

    /// Drop unused values and renumber the remaining ones densely. Returns the new value number
    /// of every old one.
    pub fn rename_values(&mut self) -> Vec<Option<ValNo>> {
        let mut map = Vec::with_capacity(self.valnos.len());
        let mut kept = Vec::with_capacity(self.valnos.len());
        for v in self.valnos.drain(..) {
            if v.is_unused() {
                map.push(None);
            } else {
                map.push(Some(ValNo::new(kept.len())));
                kept.push(v);
            }
        }
        self.valnos = kept;
        for s in &mut self.segments {
            s.valno = map[s.valno.index()].expect("segment of an unused value");
        }
        map
    }

    /// Is any of `undefs` in `[begin, end)`?
    pub fn is_undef_in(undefs: &[SlotIndex], begin: SlotIndex, end: SlotIndex) -> bool {
        undefs.iter().any(|&u| begin <= u && u < end)
    }

    /// Extend the range inside one block to reach `kill`.
    ///
    /// `start_idx` is the start of the block containing `kill`. If a segment in the block reaches
    /// up to `kill`, extend it and return its value. An undef point between the segment end and
    /// `kill` blocks the extension; the second result reports that.
    pub fn extend_in_block(
        &mut self,
        undefs: &[SlotIndex],
        start_idx: SlotIndex,
        kill: SlotIndex,
    ) -> (Option<ValNo>, bool) {
        if self.is_empty() {
            return (None, false);
        }
        let before_use = kill.prev_slot();
        let i = self.segments.partition_point(|s| s.start <= before_use);
        if i == 0 {
            return (None, Self::is_undef_in(undefs, start_idx, before_use));
        }
        let i = i - 1;
        let seg = self.segments[i];
        if seg.end <= start_idx {
            return (None, Self::is_undef_in(undefs, start_idx, before_use));
        }
        if seg.end < kill {
            if Self::is_undef_in(undefs, seg.end, before_use) {
                return (None, true);
            }
            self.extend_segment_end_to(i, kill);
        }
        (Some(seg.valno), false)
    }

    /// Create a dead def at `def`, or return the value already defined by the same instruction.
    pub fn create_dead_def(&mut self, def: SlotIndex) -> ValNo {
        self.create_dead_def_for(def, None)
    }

    /// Like `create_dead_def`, using the existing value `for_vn`.
    pub fn create_dead_def_for(&mut self, def: SlotIndex, for_vn: Option<ValNo>) -> ValNo {
        let i = self.find(def);
        if let Some(seg) = self.segments.get(i).copied() {
            if SlotIndex::is_same_instr(def, seg.start) {
                debug_assert!(for_vn.map_or(true, |v| self[v].def == seg.start));
                debug_assert_eq!(self[seg.valno].def, seg.start, "inconsistent value def");
                // Both normal and early-clobber defs on one instruction become early-clobber.
                if def < seg.start {
                    self.segments[i].start = def;
                    self[seg.valno].def = def;
                }
                return seg.valno;
            }
            assert!(
                SlotIndex::is_earlier_instr(def, seg.start),
                "already live at def {def}"
            );
        }
        let vn = match for_vn {
            Some(v) => v,
            None => self.get_next_value(def),
        };
        self.segments.insert(i, Segment::new(def, def.dead_slot(), vn));
        vn
    }

    /// Add the segments of `other` with value `other_vn` to this range as value `as_vn`.
    pub fn merge_value_in_as_value(&mut self, other: &LiveRange, other_vn: ValNo, as_vn: ValNo) {
        for s in other.segments.iter().filter(|s| s.valno == other_vn) {
            self.add_segment(Segment::new(s.start, s.end, as_vn));
        }
    }

    /// Do this range and `other` share a point?
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        let (a, b) = (&self.segments, &other.segments);
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            if a[i].end <= b[j].start {
                i += 1;
            } else if b[j].end <= a[i].start {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    /// Is the range live anywhere in `[start, end)`?
    pub fn overlaps_range(&self, start: SlotIndex, end: SlotIndex) -> bool {
        debug_assert!(start < end);
        let i = self.find(start);
        self.segments.get(i).is_some_and(|s| s.start < end)
    }

    /// Does this range cover every point of `other`?
    pub fn covers(&self, other: &LiveRange) -> bool {
        if self.is_empty() {
            return other.is_empty();
        }
        for o in &other.segments {
            let mut i = self.find(o.start);
            match self.segments.get(i) {
                Some(s) if s.start <= o.start => {}
                _ => return false,
            }
            while self.segments[i].end < o.end {
                let last_end = self.segments[i].end;
                i += 1;
                match self.segments.get(i) {
                    Some(s) if s.start == last_end => {}
                    _ => return false,
                }
            }
        }
        true
    }

    /// Is every segment confined to a single instruction?
    pub fn is_zero_length(&self, indexes: &SlotIndexes) -> bool {
        self.segments.iter().all(|s| {
            indexes.next_nonnull_index(s.start.base()).base() >= s.end.base()
        })
    }

    /// Append the points of sorted `indexes` where the range is live to `out`. Returns true if
    /// any was found.
    pub fn find_indexes_live_at(&self, indexes: &[SlotIndex], out: &mut Vec<SlotIndex>) -> bool {
        let mut found = false;
        let mut seg = 0;
        for &idx in indexes {
            while seg < self.segments.len() && self.segments[seg].end <= idx {
                seg += 1;
            }
            if seg == self.segments.len() {
                break;
            }
            if self.segments[seg].start <= idx {
                out.push(idx);
                found = true;
            }
        }
        found
    }

    /// Copy all segments and values of `other` into this empty range.
    pub fn assign(&mut self, other: &LiveRange) {
        self.segments.clone_from(&other.segments);
        self.valnos.clone_from(&other.valnos);
    }

    /// Apply `remap` to every stored program point.
    pub fn remap_indexes(&mut self, mut remap: impl FnMut(SlotIndex) -> SlotIndex) {
        for s in &mut self.segments {
            s.start = remap(s.start);
            s.end = remap(s.end);
        }
        for v in &mut self.valnos {
            v.def = remap(v.def);
        }
    }

    /// Check the internal invariants.
    pub fn verify(&self) -> Result<(), String> {
        for (i, s) in self.segments.iter().enumerate() {
            if s.start >= s.end {
                return Err(format!("empty segment {s}"));
            }
            if s.valno.index() >= self.valnos.len() || self[s.valno].is_unused() {
                return Err(format!("{s} has a bad value"));
            }
            if let Some(next) = self.segments.get(i + 1) {
                if s.end > next.start {
                    return Err(format!("{s} overlaps {next}"));
                }
                if s.end == next.start && s.valno == next.valno {
                    return Err(format!("{s} and {next} should be coalesced"));
                }
            }
        }
        for (vn, info) in self.valnos() {
            if info.is_unused() {
                continue;
            }
            match self.segment_containing(info.def) {
                Some(s) if s.valno == vn => {}
                _ => return Err(format!("{vn} is not live at its def {}", info.def)),
            }
        }
        Ok(())
    }
}

fn cmp_max(a: SlotIndex, b: SlotIndex) -> SlotIndex {
    if a > b {
        a
    } else {
        b
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.segments.is_empty() {
            f.write_str("EMPTY")?;
        }
        for s in &self.segments {
            write!(f, "{s}")?;
        }
        for (vn, info) in self.valnos() {
            write!(f, " {}@", vn.as_u32())?;
            if info.is_unused() {
                f.write_str("x")?;
            } else {
                write!(f, "{}", info.def)?;
                if info.is_phi_def() {
                    f.write_str("-phi")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regalloc::slot_indexes::Slot;
    use proptest::prelude::*;

    fn r(n: u64) -> SlotIndex {
        SlotIndex::new(n, Slot::Register)
    }

    fn b(n: u64) -> SlotIndex {
        SlotIndex::new(n, Slot::Block)
    }

    #[test]
    fn coalescing() {
        let mut lr = LiveRange::new();
        let v0 = lr.get_next_value(r(1));
        lr.add_segment(Segment::new(r(1), r(3), v0));
        lr.add_segment(Segment::new(r(5), r(7), v0));
        assert_eq!(lr.segments.len(), 2);
        // Bridging segment merges everything.
        lr.add_segment(Segment::new(r(3), r(5), v0));
        assert_eq!(lr.segments, [Segment::new(r(1), r(7), v0)]);
        // Covered segment is a no-op.
        lr.add_segment(Segment::new(r(2), r(4), v0));
        assert_eq!(lr.segments.len(), 1);
        // Extending the start over earlier segments.
        lr.add_segment(Segment::new(b(0), r(2), v0));
        assert_eq!(lr.segments, [Segment::new(b(0), r(7), v0)]);
        lr.verify().unwrap();
        assert_eq!(lr.to_string(), "[0B,7r:0) 0@1r");
    }

    #[test]
    #[should_panic(expected = "different value")]
    fn overlapping_values_rejected() {
        let mut lr = LiveRange::new();
        let v0 = lr.get_next_value(r(1));
        let v1 = lr.get_next_value(r(2));
        lr.add_segment(Segment::new(r(1), r(4), v0));
        lr.add_segment(Segment::new(r(2), r(6), v1));
    }

    #[test]
    fn remove_splits() {
        let mut lr = LiveRange::new();
        let v0 = lr.get_next_value(r(1));
        lr.add_segment(Segment::new(r(1), r(9), v0));
        lr.remove_segment(r(3), r(5), true);
        assert_eq!(
            lr.segments,
            [Segment::new(r(1), r(3), v0), Segment::new(r(5), r(9), v0)]
        );
        lr.remove_segment(r(5), r(9), true);
        lr.remove_segment(r(1), r(3), true);
        assert!(lr.is_empty());
        assert_eq!(lr.num_valnos(), 0);
    }

    #[test]
    fn query_kinds() {
        // v0 defined at 1r, killed at 3r. v1 defined at 3r, dead. v2 live through 5..
        let mut lr = LiveRange::new();
        let v0 = lr.get_next_value(r(1));
        let v1 = lr.get_next_value(r(3));
        let v2 = lr.get_next_value(b(4));
        lr.add_segment(Segment::new(r(1), r(3), v0));
        lr.add_segment(Segment::new(r(3), r(3).dead_slot(), v1));
        lr.add_segment(Segment::new(b(4), b(8), v2));

        let q = lr.query(b(1));
        assert_eq!(q.value_in(), None);
        assert_eq!(q.value_out(), Some(v0));
        assert_eq!(q.value_defined(), Some(v0));

        let q = lr.query(b(3));
        assert_eq!(q.value_in(), Some(v0));
        assert!(q.is_kill());
        assert!(q.is_dead_def());
        assert_eq!(q.value_out(), None);
        assert_eq!(q.value_out_or_dead(), Some(v1));

        let q = lr.query(b(5));
        assert!(q.is_live_through());
        assert_eq!(q.value_in(), Some(v2));

        let q = lr.query(b(9));
        assert_eq!(q.value_in(), None);
        assert_eq!(q.value_out(), None);

        // The phi-value isn't live into its def point.
        let q = lr.query(b(4));
        assert_eq!(q.value_in(), None);
        assert_eq!(q.value_out(), Some(v2));
    }

    #[test]
    fn extend_in_block() {
        let mut lr = LiveRange::new();
        let v0 = lr.get_next_value(r(1));
        lr.add_segment(Segment::new(r(1), r(1).dead_slot(), v0));
        assert_eq!(lr.extend_in_block(&[], b(0), r(3)), (Some(v0), false));
        assert_eq!(lr.segments, [Segment::new(r(1), r(3), v0)]);
        // Nothing defined in the next block.
        assert_eq!(lr.extend_in_block(&[], b(4), r(6)), (None, false));
        // An undef point blocks the extension.
        assert_eq!(lr.extend_in_block(&[r(4)], b(0), r(6)), (None, true));
    }

    #[test]
    fn extension_stops_at_redefinition() {
        // v0 defined at 1r and read by the instruction at 3 that redefines it as v1.
        let mut lr = LiveRange::new();
        let v0 = lr.create_dead_def(r(1));
        let v1 = lr.create_dead_def(r(3));
        lr.add_segment(Segment::new(r(3), r(5), v1));
        assert_eq!(lr.extend_in_block(&[], b(0), r(3)), (Some(v0), false));
        assert_eq!(
            lr.segments,
            [Segment::new(r(1), r(3), v0), Segment::new(r(3), r(5), v1)]
        );
        lr.verify().unwrap();
    }

    #[test]
    fn dead_defs_and_values() {
        let mut lr = LiveRange::new();
        let v0 = lr.create_dead_def(r(2));
        assert_eq!(lr.create_dead_def(r(2)), v0);
        // Early clobber on the same instruction takes over the def.
        assert_eq!(lr.create_dead_def(r(2).reg_slot(true)), v0);
        assert_eq!(lr[v0].def, r(2).reg_slot(true));
        let v1 = lr.create_dead_def(r(5));
        assert_eq!(lr.segments.len(), 2);
        lr.remove_value_no(v0);
        assert!(lr[v0].is_unused());
        let map = lr.rename_values();
        assert_eq!(map, [None, Some(ValNo::new(0))]);
        assert_eq!(lr.segments[0].valno, ValNo::new(0));
        assert_eq!(v1, ValNo::new(1));
        lr.verify().unwrap();
    }

    #[test]
    fn covers_and_overlaps() {
        let mut a = LiveRange::new();
        let va = a.get_next_value(r(1));
        a.add_segment(Segment::new(r(1), r(4), va));
        let vb = a.get_next_value(r(4));
        a.add_segment(Segment::new(r(4), r(8), vb));

        let mut other = LiveRange::new();
        let vo = other.get_next_value(r(2));
        other.add_segment(Segment::new(r(2), r(6), vo));
        assert!(a.covers(&other));
        assert!(a.overlaps(&other));
        other.add_segment(Segment::new(r(9), r(10), vo));
        assert!(!a.covers(&other));
        assert!(!a.overlaps_range(r(8), r(9)));

        let mut out = Vec::new();
        assert!(a.find_indexes_live_at(&[b(0), r(3), r(8), r(9)], &mut out));
        assert_eq!(out, [r(3)]);

        let mut merged = LiveRange::new();
        let vm = merged.get_next_value(r(2));
        merged.merge_value_in_as_value(&other, vo, vm);
        assert_eq!(merged.segments.len(), 2);
    }

    // Generate a sorted set of disjoint segments with alternating values.
    fn arb_range() -> impl Strategy<Value = LiveRange> {
        prop::collection::btree_set(1u64..200, 0..20).prop_map(|points| {
            let points: Vec<u64> = points.into_iter().collect();
            let mut lr = LiveRange::new();
            for pair in points.chunks_exact(2) {
                let vn = lr.get_next_value(r(pair[0]));
                lr.add_segment(Segment::new(r(pair[0]), r(pair[1]), vn));
            }
            lr
        })
    }

    proptest! {
        #[test]
        fn query_agrees_with_segments(lr in arb_range(), n in 0u64..210) {
            let idx = b(n);
            let q = lr.query(idx);
            // At a block slot the value in is the segment covering the point just before.
            let expected = lr
                .segment_containing(idx)
                .filter(|s| s.start < idx)
                .map(|s| s.valno);
            prop_assert_eq!(q.value_in(), expected);
        }

        #[test]
        fn add_remove_round_trip(lr in arb_range(), s in 0u64..210, len in 1u64..10) {
            let (start, end) = (b(s), b(s + len));
            prop_assume!(!lr.overlaps_range(start, end));
            let mut edited = lr.clone();
            let vn = edited.get_next_value(start);
            edited.add_segment(Segment::new(start, end, vn));
            prop_assert!(edited.verify().is_ok());
            edited.remove_segment(start, end, true);
            prop_assert_eq!(&edited.segments, &lr.segments);
            prop_assert_eq!(edited.num_valnos(), lr.num_valnos());
        }

        #[test]
        fn coalescing_is_idempotent(lr in arb_range()) {
            let mut again = lr.clone();
            for seg in lr.segments.clone() {
                again.add_segment(seg);
            }
            prop_assert_eq!(&again.segments, &lr.segments);
        }
    }
}
