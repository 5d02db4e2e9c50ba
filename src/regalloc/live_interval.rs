//! Live intervals of virtual registers.
//!
//! A `LiveInterval` is the live range of one virtual register together with its spill weight.
//! Registers of classes with sub-register liveness tracking also carry subranges: one live range
//! per set of lanes that are always live together.

use crate::ir::{Function, VirtReg};
use crate::isa::{LaneBitmask, TargetIsa};
use crate::regalloc::live_range::{LiveRange, ValNo};
use crate::regalloc::slot_indexes::{SlotIndex, SlotIndexes};
use core::fmt;
use core::ops::{Deref, DerefMut};
use smallvec::SmallVec;

/// Liveness of a subset of the lanes of a register.
#[derive(Clone, Debug, PartialEq)]
pub struct SubRange {
    /// The lanes described by this subrange.
    pub lane_mask: LaneBitmask,
    /// Where the lanes are live.
    pub range: LiveRange,
}

impl SubRange {
    fn new(lane_mask: LaneBitmask) -> Self {
        Self {
            lane_mask,
            range: LiveRange::new(),
        }
    }
}

/// The live interval of a virtual register.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveInterval {
    /// The register this interval describes.
    pub reg: VirtReg,
    /// Spill weight. Infinity means the interval can't be spilled.
    pub weight: f32,
    /// The combined liveness of all lanes.
    pub range: LiveRange,
    /// Per lane liveness, sorted by nothing in particular. Lane masks are disjoint.
    pub subranges: Vec<SubRange>,
}

impl Deref for LiveInterval {
    type Target = LiveRange;

    fn deref(&self) -> &LiveRange {
        &self.range
    }
}

impl DerefMut for LiveInterval {
    fn deref_mut(&mut self) -> &mut LiveRange {
        &mut self.range
    }
}

impl LiveInterval {
    /// Create an empty interval for `reg`.
    pub fn new(reg: VirtReg) -> Self {
        Self {
            reg,
            weight: 0.0,
            range: LiveRange::new(),
            subranges: Vec::new(),
        }
    }

    /// Can this interval be spilled?
    pub fn is_spillable(&self) -> bool {
        self.weight != f32::INFINITY
    }

    /// Prevent this interval from being spilled.
    pub fn mark_not_spillable(&mut self) {
        self.weight = f32::INFINITY;
    }

    /// The number of slots covered by the interval.
    pub fn size(&self) -> u64 {
        self.range
            .segments
            .iter()
            .map(|s| s.start.distance(s.end) as u64)
            .sum()
    }

    /// Does the interval track lanes separately?
    pub fn has_sub_ranges(&self) -> bool {
        !self.subranges.is_empty()
    }

    /// Add an empty subrange for `lane_mask`.
    pub fn create_sub_range(&mut self, lane_mask: LaneBitmask) -> &mut SubRange {
        self.subranges.push(SubRange::new(lane_mask));
        self.subranges.last_mut().expect("just pushed")
    }

    /// Add a subrange for `lane_mask` with a copy of `copy`.
    pub fn create_sub_range_from(&mut self, lane_mask: LaneBitmask, copy: &LiveRange) {
        let mut sr = SubRange::new(lane_mask);
        sr.range.assign(copy);
        self.subranges.push(sr);
    }

    /// Create a subrange for `lane_mask` copying the main range.
    pub fn create_sub_range_from_main(&mut self, lane_mask: LaneBitmask) {
        let copy = self.range.clone();
        self.create_sub_range_from(lane_mask, &copy);
    }

    /// Remove all subranges.
    pub fn clear_sub_ranges(&mut self) {
        self.subranges.clear();
    }

    /// Remove subranges without segments.
    pub fn remove_empty_sub_ranges(&mut self) {
        self.subranges.retain(|sr| !sr.range.is_empty());
    }

    /// Refine the subranges so that `lane_mask` is covered by a set of whole subranges, then call
    /// `apply` on each of them.
    ///
    /// A subrange partially covered by `lane_mask` is split in two. Each half keeps only the
    /// values whose definition writes some of its lanes; phi-values are kept in both. Lanes of
    /// `lane_mask` not covered by any subrange get a new empty subrange.
    pub fn refine_sub_ranges(
        &mut self,
        lane_mask: LaneBitmask,
        mut apply: impl FnMut(&mut SubRange),
        func: &Function,
        indexes: &SlotIndexes,
        isa: &dyn TargetIsa,
    ) {
        let mut to_apply = lane_mask;
        let reg = self.reg;
        let mut i = 0;
        // New subranges are pushed at the end, and we don't want to visit them again.
        let existing = self.subranges.len();
        while i < existing {
            let sr_mask = self.subranges[i].lane_mask;
            let matching = sr_mask & lane_mask;
            if matching.is_none() {
                i += 1;
                continue;
            }
            let target = if sr_mask == matching {
                i
            } else {
                self.subranges[i].lane_mask = sr_mask & !matching;
                let mut split = SubRange::new(matching);
                split.range.assign(&self.subranges[i].range);
                strip_values_not_defining_mask(reg, &mut split, func, indexes, isa);
                strip_values_not_defining_mask(reg, &mut self.subranges[i], func, indexes, isa);
                self.subranges.push(split);
                self.subranges.len() - 1
            };
            apply(&mut self.subranges[target]);
            to_apply = to_apply & !matching;
            i += 1;
        }
        if to_apply.any() {
            self.subranges.push(SubRange::new(to_apply));
            let last = self.subranges.len() - 1;
            apply(&mut self.subranges[last]);
        }
    }

    /// Collect the points where a partial def of this register leaves lanes in `lane_mask`
    /// undefined.
    ///
    /// A sub-register def with the undef flag only writes some lanes of the register; the other
    /// lanes are undefined after it.
    pub fn compute_sub_range_undefs(
        &self,
        undefs: &mut Vec<SlotIndex>,
        lane_mask: LaneBitmask,
        func: &Function,
        indexes: &SlotIndexes,
        isa: &dyn TargetIsa,
    ) {
        let class_mask = isa.reg_info().class(func.vreg_class(self.reg)).lane_mask;
        for opref in func.reg_defs(self.reg) {
            let op = func.operand(opref);
            if !op.is_undef() {
                continue;
            }
            debug_assert_ne!(op.subreg(), 0, "undef should only be set on sub-register defs");
            let def_mask = isa.sub_reg_lane_mask(op.subreg());
            let undef_mask = class_mask & !def_mask;
            if (undef_mask & lane_mask).any() {
                let idx = indexes.index_of(opref.inst).reg_slot(op.is_early_clobber());
                undefs.push(idx);
            }
        }
    }

    /// Apply `remap` to every stored program point, subranges included.
    pub fn remap_indexes(&mut self, mut remap: impl FnMut(SlotIndex) -> SlotIndex) {
        self.range.remap_indexes(&mut remap);
        for sr in &mut self.subranges {
            sr.range.remap_indexes(&mut remap);
        }
    }

    /// Check the interval and its subranges.
    pub fn verify(&self) -> Result<(), String> {
        self.range.verify().map_err(|e| format!("{}: {e}", self.reg))?;
        let mut seen = LaneBitmask::NONE;
        for sr in &self.subranges {
            if sr.lane_mask.is_none() {
                return Err(format!("{}: subrange with empty lane mask", self.reg));
            }
            if sr.lane_mask.overlaps(seen) {
                return Err(format!("{}: overlapping subrange {}", self.reg, sr.lane_mask));
            }
            seen = seen | sr.lane_mask;
            if sr.range.is_empty() {
                return Err(format!("{}: empty subrange {}", self.reg, sr.lane_mask));
            }
            sr.range
                .verify()
                .map_err(|e| format!("{} {}: {e}", self.reg, sr.lane_mask))?;
            if !self.range.covers(&sr.range) {
                return Err(format!(
                    "{}: subrange {} not covered by the main range",
                    self.reg, sr.lane_mask
                ));
            }
        }
        Ok(())
    }
}

// Remove the values of `sr` whose defining instruction doesn't write any of its lanes.
fn strip_values_not_defining_mask(
    reg: VirtReg,
    sr: &mut SubRange,
    func: &Function,
    indexes: &SlotIndexes,
    isa: &dyn TargetIsa,
) {
    let mut dead: SmallVec<[ValNo; 8]> = SmallVec::new();
    for (vn, info) in sr.range.valnos() {
        if info.is_unused() || info.is_phi_def() {
            continue;
        }
        let inst = indexes
            .instruction_at(info.def)
            .unwrap_or_else(|| panic!("cannot find the definition of {reg} at {}", info.def));
        let defines = func[inst].operands.iter().any(|op| {
            op.is_def()
                && op.virt_reg() == Some(reg)
                && isa.sub_reg_lane_mask(op.subreg()).overlaps(sr.lane_mask)
        });
        if !defines {
            dead.push(vn);
        }
    }
    for vn in dead {
        sr.range.remove_value_no(vn);
    }
}

impl fmt::Display for LiveInterval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.reg, self.range)?;
        for sr in &self.subranges {
            write!(f, " L{} {}", sr.lane_mask, sr.range)?;
        }
        if self.weight != 0.0 {
            write!(f, " weight:{:.3e}", self.weight)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstData, Operand, OperandFlags, Reg};
    use crate::isa::generic::{self, SUB_HI, SUB_LO};
    use crate::regalloc::live_range::Segment;

    #[test]
    fn refine_splits_by_defining_lanes() {
        let isa = generic::builder().gprs(4).pairs(true).finish();
        let pair = isa.pair_class().unwrap();
        let mut func = Function::with_name("lanes");
        let v = func.new_vreg(pair);
        let b0 = func.append_block();
        // v.lo = iconst; v.hi = iconst; return v
        let i0 = func.append_inst(
            b0,
            InstData::iconst(v, 1).clone_with_def_subreg(SUB_LO, true),
        );
        let i1 = func.append_inst(
            b0,
            InstData::iconst(v, 2).clone_with_def_subreg(SUB_HI, false),
        );
        func.append_inst(b0, InstData::ret([Reg::Virt(v)]));
        let mut sx = SlotIndexes::new();
        sx.compute(&func);

        let d0 = sx.index_of(i0).reg_slot(false);
        let d1 = sx.index_of(i1).reg_slot(false);
        let mut li = LiveInterval::new(v);
        let v0 = li.get_next_value(d0);
        li.add_segment(Segment::new(d0, d1, v0));
        let v1 = li.get_next_value(d1);
        li.add_segment(Segment::new(d1, d1.dead_slot(), v1));
        li.create_sub_range_from_main(LaneBitmask(0b11));

        let mut applied = Vec::new();
        li.refine_sub_ranges(
            LaneBitmask(0b10),
            |sr| applied.push(sr.lane_mask),
            &func,
            &sx,
            &isa,
        );
        assert_eq!(applied, [LaneBitmask(0b10)]);
        assert_eq!(li.subranges.len(), 2);
        // The low lanes are only defined by i0, the high lanes only by i1.
        let lo = &li.subranges[0];
        assert_eq!(lo.lane_mask, LaneBitmask(0b01));
        assert_eq!(lo.range.segments.len(), 1);
        assert_eq!(lo.range.segments[0].start, d0);
        let hi = &li.subranges[1];
        assert_eq!(hi.range.segments.len(), 1);
        assert_eq!(hi.range.segments[0].start, d1);

        let mut undefs = Vec::new();
        li.compute_sub_range_undefs(&mut undefs, LaneBitmask(0b10), &func, &sx, &isa);
        assert_eq!(undefs, [d0]);
        li.verify().unwrap();
    }

    #[test]
    fn uncovered_lanes_get_new_subrange() {
        let isa = generic::builder().gprs(4).pairs(true).finish();
        let func = Function::with_name("empty");
        let sx = SlotIndexes::new();
        let mut li = LiveInterval::new(VirtReg::from_u32(0));
        let mut n = 0;
        li.refine_sub_ranges(LaneBitmask(0b01), |_| n += 1, &func, &sx, &isa);
        li.refine_sub_ranges(LaneBitmask(0b11), |_| n += 1, &func, &sx, &isa);
        assert_eq!(n, 3);
        assert_eq!(li.subranges.len(), 2);
        li.remove_empty_sub_ranges();
        assert!(!li.has_sub_ranges());
        assert!(li.is_spillable());
        li.mark_not_spillable();
        assert!(!li.is_spillable());
    }

    impl InstData {
        // Put a sub-register index on the def operand.
        fn clone_with_def_subreg(mut self, idx: u8, undef: bool) -> Self {
            let mut flags = OperandFlags::DEF;
            if undef {
                flags |= OperandFlags::UNDEF;
            }
            if let Some(Reg::Virt(v)) = self.operands[0].reg() {
                self.operands[0] = Operand::Reg {
                    reg: Reg::Virt(v),
                    subreg: idx,
                    flags,
                };
            }
            self
        }
    }
}
