//! Data structures describing the registers in an ISA.
//!
//! Physical registers are made of one or more register units, the smallest pieces of the register
//! file that can hold a value independently. Two registers alias exactly when they share a unit.
//! Registers with sub-registers also carry a lane mask per unit so liveness can be tracked per
//! sub-register.

use crate::entity::{PrimaryMap, SecondaryMap};
use crate::ir::{PhysReg, RegClass, RegUnit, SubRegIndex};
use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use smallvec::SmallVec;

/// A set of lanes of a register.
///
/// Each sub-register index of the target covers some of the lanes of its super-register. The
/// full register covers all lanes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LaneBitmask(pub u64);

impl LaneBitmask {
    /// No lanes.
    pub const NONE: Self = Self(0);
    /// All lanes.
    pub const ALL: Self = Self(!0);

    /// Is this the empty lane set?
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Does this contain any lane?
    pub fn any(self) -> bool {
        self.0 != 0
    }

    /// Is this the full lane set?
    pub fn is_all(self) -> bool {
        self == Self::ALL
    }

    /// Do `self` and `other` share a lane?
    pub fn overlaps(self, other: Self) -> bool {
        (self & other).any()
    }

    /// Is every lane of `other` also in `self`?
    pub fn contains(self, other: Self) -> bool {
        (self & other) == other
    }
}

impl BitAnd for LaneBitmask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for LaneBitmask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Not for LaneBitmask {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl BitAndAssign for LaneBitmask {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl BitOrAssign for LaneBitmask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for LaneBitmask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl fmt::Debug for LaneBitmask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Description of a physical register.
#[derive(Clone, Debug)]
pub struct PhysRegData {
    /// Register name used in dumps.
    pub name: String,
    /// The units covered by this register, with the lanes each unit holds.
    pub units: SmallVec<[(RegUnit, LaneBitmask); 2]>,
    /// The sub-registers by sub-register index.
    pub sub_regs: SmallVec<[(SubRegIndex, PhysReg); 2]>,
}

/// Description of a register class.
#[derive(Clone, Debug)]
pub struct RegClassData {
    /// Class name used in dumps.
    pub name: String,
    /// Registers in the class, in preferred allocation order.
    pub order: Vec<PhysReg>,
    /// Lanes covered by registers of this class.
    pub lane_mask: LaneBitmask,
    /// Bytes needed to spill a register of this class.
    pub spill_size: u32,
    /// Alignment of a spill slot for this class.
    pub spill_align: u32,
    /// Allocation priority. Higher priority classes are allocated first.
    pub priority: u8,
    /// Allocate live ranges of this class globally by size, even when they are local to a block.
    pub global_priority: bool,
    /// Can registers of this class be allocated at all?
    pub allocatable: bool,
}

/// Description of a sub-register index.
#[derive(Clone, Debug)]
pub struct SubRegIndexData {
    /// Name used in dumps.
    pub name: String,
    /// Lanes of the super-register covered by the sub-register.
    pub lane_mask: LaneBitmask,
}

/// Information about the registers of a target.
#[derive(Clone, Debug, Default)]
pub struct RegInfo {
    /// All physical registers.
    pub regs: PrimaryMap<PhysReg, PhysRegData>,
    /// All register classes.
    pub classes: PrimaryMap<RegClass, RegClassData>,
    /// Sub-register indices. Index 0 is the full register and has no entry here.
    pub sub_reg_indices: Vec<SubRegIndexData>,
    /// Number of register units.
    pub num_units: usize,
    unit_roots: SecondaryMap<RegUnit, SmallVec<[PhysReg; 2]>>,
}

impl RegInfo {
    /// Create register info from its tables, computing the unit to register mapping.
    pub fn new(
        regs: PrimaryMap<PhysReg, PhysRegData>,
        classes: PrimaryMap<RegClass, RegClassData>,
        sub_reg_indices: Vec<SubRegIndexData>,
    ) -> Self {
        let mut unit_roots: SecondaryMap<RegUnit, SmallVec<[PhysReg; 2]>> = SecondaryMap::new();
        let mut num_units = 0;
        for (reg, data) in regs.iter() {
            for &(unit, _) in &data.units {
                unit_roots[unit].push(reg);
                num_units = num_units.max(unit.as_u32() as usize + 1);
            }
        }
        Self {
            regs,
            classes,
            sub_reg_indices,
            num_units,
            unit_roots,
        }
    }

    /// Number of physical registers.
    pub fn num_regs(&self) -> usize {
        self.regs.len()
    }

    /// The name of `reg`.
    pub fn reg_name(&self, reg: PhysReg) -> &str {
        &self.regs[reg].name
    }

    /// The units of `reg` with their lane masks.
    pub fn reg_units(&self, reg: PhysReg) -> impl Iterator<Item = (RegUnit, LaneBitmask)> + '_ {
        self.regs[reg].units.iter().copied()
    }

    /// The units of `reg`.
    pub fn units(&self, reg: PhysReg) -> impl Iterator<Item = RegUnit> + '_ {
        self.regs[reg].units.iter().map(|&(u, _)| u)
    }

    /// All registers containing `unit`.
    pub fn unit_regs(&self, unit: RegUnit) -> &[PhysReg] {
        &self.unit_roots[unit]
    }

    /// Do `a` and `b` share a register unit?
    pub fn regs_overlap(&self, a: PhysReg, b: PhysReg) -> bool {
        a == b || self.units(a).any(|ua| self.units(b).any(|ub| ua == ub))
    }

    /// Registers aliasing `reg`, including `reg` itself.
    pub fn aliases(&self, reg: PhysReg) -> SmallVec<[PhysReg; 4]> {
        let mut out: SmallVec<[PhysReg; 4]> = SmallVec::new();
        for unit in self.units(reg) {
            for &r in self.unit_regs(unit) {
                if !out.contains(&r) {
                    out.push(r);
                }
            }
        }
        out
    }

    /// The register class data for `rc`.
    pub fn class(&self, rc: RegClass) -> &RegClassData {
        &self.classes[rc]
    }

    /// Is `reg` a member of `rc`?
    pub fn class_contains(&self, rc: RegClass, reg: PhysReg) -> bool {
        self.classes[rc].order.contains(&reg)
    }

    /// The sub-register of `reg` at `idx`. Index 0 is `reg` itself.
    pub fn sub_reg(&self, reg: PhysReg, idx: SubRegIndex) -> Option<PhysReg> {
        if idx == 0 {
            return Some(reg);
        }
        self.regs[reg]
            .sub_regs
            .iter()
            .find(|&&(i, _)| i == idx)
            .map(|&(_, r)| r)
    }

    /// The lanes covered by sub-register index `idx`.
    pub fn sub_reg_lane_mask(&self, idx: SubRegIndex) -> LaneBitmask {
        if idx == 0 {
            return LaneBitmask::ALL;
        }
        self.sub_reg_indices
            .get(idx as usize - 1)
            .map_or(LaneBitmask::ALL, |d| d.lane_mask)
    }

    /// Display `reg` by name.
    pub fn display_reg(&self, reg: PhysReg) -> DisplayReg {
        DisplayReg(reg, self)
    }
}

/// Displays a physical register by name.
pub struct DisplayReg<'a>(PhysReg, &'a RegInfo);

impl fmt::Display for DisplayReg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.1.regs.get(self.0) {
            Some(data) => write!(f, "%{}", data.name),
            None => write!(f, "%{}", self.0),
        }
    }
}

/// A set of physical registers as a bit vector.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegSet {
    words: SmallVec<[u64; 2]>,
}

impl RegSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn word_bit(reg: PhysReg) -> (usize, u64) {
        let idx = reg.as_u32() as usize;
        (idx / 64, 1 << (idx % 64))
    }

    /// Add `reg` to the set.
    pub fn insert(&mut self, reg: PhysReg) {
        let (w, b) = Self::word_bit(reg);
        if self.words.len() <= w {
            self.words.resize(w + 1, 0);
        }
        self.words[w] |= b;
    }

    /// Remove `reg` from the set.
    pub fn remove(&mut self, reg: PhysReg) {
        let (w, b) = Self::word_bit(reg);
        if let Some(word) = self.words.get_mut(w) {
            *word &= !b;
        }
    }

    /// Is `reg` in the set?
    pub fn contains(&self, reg: PhysReg) -> bool {
        let (w, b) = Self::word_bit(reg);
        self.words.get(w).is_some_and(|&word| word & b != 0)
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of registers in the set.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Add all registers of `other`.
    pub fn union(&mut self, other: &Self) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (x, &y) in self.words.iter_mut().zip(&other.words) {
            *x |= y;
        }
    }

    /// Iterate over the registers in the set in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = PhysReg> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut bits = word;
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let b = bits.trailing_zeros();
                bits &= bits - 1;
                Some(PhysReg::from_u32(w as u32 * 64 + b))
            })
        })
    }
}

impl FromIterator<PhysReg> for RegSet {
    fn from_iter<I: IntoIterator<Item = PhysReg>>(iter: I) -> Self {
        let mut set = Self::new();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
