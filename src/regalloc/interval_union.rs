//! The union of live ranges assigned to one register unit.

use crate::ir::VirtReg;
use crate::regalloc::live_range::LiveRange;
use crate::regalloc::slot_indexes::SlotIndex;
use core::ops::Bound::{Excluded, Unbounded};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Segments of all virtual registers assigned to a register unit, keyed by start.
#[derive(Clone, Debug, Default)]
pub struct LiveIntervalUnion {
    segments: BTreeMap<SlotIndex, (SlotIndex, VirtReg)>,
    tag: u32,
}

impl LiveIntervalUnion {
    /// Create an empty union.
    pub fn new() -> Self {
        Self::default()
    }

    /// Is nothing assigned?
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// A counter bumped on every change.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Forget all segments.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.tag = self.tag.wrapping_add(1);
    }

    /// Add the segments of `range` for `vreg`.
    ///
    /// Panics if a segment overlaps one already in the union.
    pub fn unify(&mut self, vreg: VirtReg, range: &LiveRange) {
        if range.is_empty() {
            return;
        }
        self.tag = self.tag.wrapping_add(1);
        for seg in &range.segments {
            if let Some((_, &(end, other))) = self.segments.range(..=seg.start).next_back() {
                assert!(end <= seg.start, "{vreg} overlaps {other} at {}", seg.start);
            }
            if let Some((&start, &(_, other))) =
                self.segments.range((Excluded(seg.start), Unbounded)).next()
            {
                assert!(start >= seg.end, "{vreg} overlaps {other} at {start}");
            }
            self.segments.insert(seg.start, (seg.end, vreg));
        }
    }

    /// Remove the segments of `range` for `vreg`. The exact inverse of `unify`.
    pub fn extract(&mut self, vreg: VirtReg, range: &LiveRange) {
        if range.is_empty() {
            return;
        }
        self.tag = self.tag.wrapping_add(1);
        for seg in &range.segments {
            let removed = self.segments.remove(&seg.start);
            debug_assert_eq!(removed, Some((seg.end, vreg)), "{vreg} not in union");
        }
    }

    /// The first program point covered by the union.
    pub fn start_index(&self) -> Option<SlotIndex> {
        self.segments.keys().next().copied()
    }

    /// The last program point covered by the union.
    pub fn end_index(&self) -> Option<SlotIndex> {
        self.segments.values().next_back().map(|&(end, _)| end)
    }

    /// Iterate over `(start, end, vreg)` in order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotIndex, SlotIndex, VirtReg)> + '_ {
        self.segments
            .iter()
            .map(|(&start, &(end, vreg))| (start, end, vreg))
    }

    /// Iterate over union segments overlapping `[start, end)`.
    pub fn overlapping(
        &self,
        start: SlotIndex,
        end: SlotIndex,
    ) -> impl Iterator<Item = (SlotIndex, SlotIndex, VirtReg)> + '_ {
        let before = self
            .segments
            .range(..=start)
            .next_back()
            .filter(|&(_, &(e, _))| e > start);
        let after = self.segments.range((Excluded(start), Excluded(end)));
        before
            .into_iter()
            .chain(after)
            .map(|(&s, &(e, v))| (s, e, v))
    }

    /// The virtual register assigned at `idx`, if any.
    pub fn vreg_at(&self, idx: SlotIndex) -> Option<VirtReg> {
        self.segments
            .range(..=idx)
            .next_back()
            .filter(|&(_, &(end, _))| end > idx)
            .map(|(_, &(_, v))| v)
    }

    /// Apply an index remapping. The order of segments doesn't change.
    pub fn remap_indexes(&mut self, remap: impl Fn(SlotIndex) -> SlotIndex) {
        let old = core::mem::take(&mut self.segments);
        self.segments = old
            .into_iter()
            .map(|(start, (end, v))| (remap(start), (remap(end), v)))
            .collect();
        self.tag = self.tag.wrapping_add(1);
    }
}

/// The interference between a live range and a union, collected lazily.
///
/// A query remembers the union tag and a caller tag it was computed for, so it is recomputed only
/// when either changed.
#[derive(Clone, Debug, Default)]
pub struct Query {
    union_tag: u32,
    user_tag: u32,
    vreg: Option<VirtReg>,
    interfering: SmallVec<[VirtReg; 4]>,
    seen_all: bool,
    valid: bool,
}

impl Query {
    /// Create an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare the query for `vreg` against a union with tag `union_tag`. Results computed for
    /// the same inputs are kept.
    pub fn init(&mut self, user_tag: u32, vreg: VirtReg, union_tag: u32) {
        if self.valid
            && self.user_tag == user_tag
            && self.union_tag == union_tag
            && self.vreg == Some(vreg)
        {
            return;
        }
        self.user_tag = user_tag;
        self.union_tag = union_tag;
        self.vreg = Some(vreg);
        self.interfering.clear();
        self.seen_all = false;
        self.valid = true;
    }

    /// Is the query out of date with respect to `union`?
    pub fn is_stale(&self, union: &LiveIntervalUnion) -> bool {
        !self.valid || self.union_tag != union.tag()
    }

    /// Collect up to `max` distinct registers of `union` interfering with `range`.
    pub fn collect_interfering_vregs(
        &mut self,
        union: &LiveIntervalUnion,
        range: &LiveRange,
        max: usize,
    ) -> &[VirtReg] {
        debug_assert!(!self.is_stale(union));
        if self.seen_all || self.interfering.len() >= max {
            return &self.interfering;
        }
        // Rescan from the start; the list only grows.
        'outer: for seg in &range.segments {
            for (_, _, v) in union.overlapping(seg.start, seg.end) {
                if Some(v) == self.vreg || self.interfering.contains(&v) {
                    continue;
                }
                self.interfering.push(v);
                if self.interfering.len() >= max {
                    break 'outer;
                }
            }
        }
        if self.interfering.len() < max {
            self.seen_all = true;
        }
        &self.interfering
    }

    /// Does `range` interfere with anything in `union`?
    pub fn check_interference(&mut self, union: &LiveIntervalUnion, range: &LiveRange) -> bool {
        !self.collect_interfering_vregs(union, range, 1).is_empty()
    }

    /// Registers found so far.
    pub fn interfering_vregs(&self) -> &[VirtReg] {
        &self.interfering
    }

    /// Has the whole range been scanned?
    pub fn seen_all_interferences(&self) -> bool {
        self.seen_all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::regalloc::live_range::Segment;
    use crate::regalloc::slot_indexes::Slot;

    fn r(n: u64) -> SlotIndex {
        SlotIndex::new(n, Slot::Register)
    }

    fn range(segs: &[(u64, u64)]) -> LiveRange {
        let mut lr = LiveRange::new();
        let vn = lr.get_next_value(r(segs[0].0));
        for &(s, e) in segs {
            lr.add_segment(Segment::new(r(s), r(e), vn));
        }
        lr
    }

    #[test]
    fn unify_extract() {
        let (v0, v1) = (VirtReg::new(0), VirtReg::new(1));
        let mut u = LiveIntervalUnion::new();
        let a = range(&[(1, 3), (5, 7)]);
        let b = range(&[(3, 5)]);
        u.unify(v0, &a);
        u.unify(v1, &b);
        assert_eq!(u.iter().count(), 3);
        assert_eq!(u.vreg_at(r(4)), Some(v1));
        assert_eq!(u.vreg_at(r(7)), None);
        let tag = u.tag();
        u.extract(v0, &a);
        assert_ne!(u.tag(), tag);
        assert_eq!(u.start_index(), Some(r(3)));
        assert_eq!(u.end_index(), Some(r(5)));
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn overlap_is_a_bug() {
        let mut u = LiveIntervalUnion::new();
        u.unify(VirtReg::new(0), &range(&[(1, 4)]));
        u.unify(VirtReg::new(1), &range(&[(3, 6)]));
    }

    #[test]
    fn query_caps_and_exhausts() {
        let mut u = LiveIntervalUnion::new();
        for i in 0..4 {
            u.unify(VirtReg::new(i), &range(&[(2 * i as u64 + 1, 2 * i as u64 + 2)]));
        }
        let lr = range(&[(0, 10)]);
        let me = VirtReg::new(9);
        let mut q = Query::new();
        q.init(0, me, u.tag());
        assert_eq!(q.collect_interfering_vregs(&u, &lr, 2).len(), 2);
        assert!(!q.seen_all_interferences());
        assert_eq!(q.collect_interfering_vregs(&u, &lr, 10).len(), 4);
        assert!(q.seen_all_interferences());

        // Same inputs keep the results.
        q.init(0, me, u.tag());
        assert_eq!(q.interfering_vregs().len(), 4);
        u.extract(VirtReg::new(0), &range(&[(1, 2)]));
        assert!(q.is_stale(&u));
        q.init(0, me, u.tag());
        assert!(q.check_interference(&u, &lr));
    }
}
