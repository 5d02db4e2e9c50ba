//! Live ranges of spill slots.

use crate::entity::SecondaryMap;
use crate::ir::{RegClass, StackSlot};
use crate::regalloc::live_range::{LiveRange, ValNo};
use crate::regalloc::slot_indexes::SlotIndex;

/// The live range of each stack slot the spiller created, with the class stored in it.
#[derive(Default)]
pub struct LiveStacks {
    ranges: SecondaryMap<StackSlot, Option<(LiveRange, RegClass)>>,
}

impl LiveStacks {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all slots.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// The range of `slot`, created empty for `class` on first use.
    pub fn get_or_create(&mut self, slot: StackSlot, class: RegClass) -> &mut LiveRange {
        let (lr, _) = self.ranges[slot].get_or_insert_with(|| (LiveRange::new(), class));
        lr
    }

    /// The range of `slot` if it has one.
    pub fn get(&self, slot: StackSlot) -> Option<&LiveRange> {
        self.ranges[slot].as_ref().map(|(lr, _)| lr)
    }

    /// The register class stored in `slot`.
    pub fn class(&self, slot: StackSlot) -> Option<RegClass> {
        self.ranges[slot].as_ref().map(|&(_, rc)| rc)
    }

    /// Merge `range` into the range of `slot`, all under a single value.
    pub fn merge(&mut self, slot: StackSlot, class: RegClass, range: &LiveRange) {
        let lr = self.get_or_create(slot, class);
        let first = lr.valnos().next().map(|(vn, _)| vn);
        let vn = match first {
            Some(vn) => vn,
            None => {
                let start = range.segments.first().map_or(SlotIndex::default(), |s| s.start);
                lr.get_next_value(start)
            }
        };
        merge_all_as(lr, range, vn);
    }

    /// Iterate over the slots with ranges.
    pub fn iter(&self) -> impl Iterator<Item = (StackSlot, &LiveRange)> + '_ {
        self.ranges
            .iter()
            .filter_map(|(ss, r)| r.as_ref().map(|(lr, _)| (ss, lr)))
    }

    /// Apply an index remapping to every stored range.
    pub fn remap_indexes(&mut self, remap: impl Fn(SlotIndex) -> SlotIndex) {
        for (lr, _) in self.ranges.values_mut().flatten() {
            lr.remap_indexes(&remap);
        }
    }
}

fn merge_all_as(lr: &mut LiveRange, other: &LiveRange, vn: ValNo) {
    for (ovn, _) in other.valnos() {
        lr.merge_value_in_as_value(other, ovn, vn);
    }
}
