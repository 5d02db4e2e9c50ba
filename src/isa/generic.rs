//! A configurable generic target.
//!
//! The generic target has `N` general purpose registers `r0..rN` in register class 0, each
//! covering one register unit. Optionally it also has a class of register pairs where pair `k`
//! is made of `r2k` (sub-register 1, lane 0) and `r2k+1` (sub-register 2, lane 1).
//!
//! The last few general purpose registers can be made callee-saved, and any register can be
//! reserved. Allocation orders list caller-saved registers first.

use crate::entity::{EntityRef, PrimaryMap};
use crate::ir::{Function, PhysReg, RegClass, RegMask, RegUnit, SubRegIndex};
use crate::isa::registers::{PhysRegData, RegClassData, SubRegIndexData};
use crate::isa::{LaneBitmask, RegInfo, RegSet, TargetIsa};
use smallvec::smallvec;

/// Sub-register index of the low half of a pair.
pub const SUB_LO: SubRegIndex = 1;
/// Sub-register index of the high half of a pair.
pub const SUB_HI: SubRegIndex = 2;

/// Builder for a generic target.
#[derive(Clone, Debug)]
pub struct Builder {
    gprs: u32,
    pairs: bool,
    callee_saved: u32,
    reserved: Vec<u32>,
    track_sub_regs: bool,
}

/// Create a builder for a generic target with 8 caller-saved registers and no pairs.
pub fn builder() -> Builder {
    Builder {
        gprs: 8,
        pairs: false,
        callee_saved: 0,
        reserved: Vec::new(),
        track_sub_regs: false,
    }
}

impl Builder {
    /// Set the number of general purpose registers.
    pub fn gprs(mut self, n: u32) -> Self {
        self.gprs = n;
        self
    }

    /// Add a class of register pairs.
    pub fn pairs(mut self, enable: bool) -> Self {
        self.pairs = enable;
        self
    }

    /// Make the last `n` general purpose registers callee-saved.
    pub fn callee_saved(mut self, n: u32) -> Self {
        self.callee_saved = n;
        self
    }

    /// Reserve general purpose register `idx`.
    pub fn reserve(mut self, idx: u32) -> Self {
        self.reserved.push(idx);
        self
    }

    /// Track liveness per lane for the pair class.
    pub fn track_sub_reg_liveness(mut self, enable: bool) -> Self {
        self.track_sub_regs = enable;
        self
    }

    /// Build the target.
    pub fn finish(self) -> GenericIsa {
        assert!(self.callee_saved <= self.gprs);
        let mut regs = PrimaryMap::new();
        let first_csr = self.gprs - self.callee_saved;
        let mut callee_saved = RegSet::new();
        let mut reserved = RegSet::new();

        for i in 0..self.gprs {
            let reg = regs.push(PhysRegData {
                name: format!("r{i}"),
                units: smallvec![(RegUnit::new(i as usize), LaneBitmask::ALL)],
                sub_regs: smallvec![],
            });
            if i >= first_csr {
                callee_saved.insert(reg);
            }
            if self.reserved.contains(&i) {
                reserved.insert(reg);
            }
        }

        let caller_first = |regs: Vec<PhysReg>, csr: &RegSet| -> Vec<PhysReg> {
            let (mut order, saved): (Vec<_>, Vec<_>) =
                regs.into_iter().partition(|&r| !csr.contains(r));
            order.extend(saved);
            order
        };

        let mut classes = PrimaryMap::new();
        let gpr_order = caller_first(regs.keys().collect(), &callee_saved);
        let gpr_class = classes.push(RegClassData {
            name: "gpr".to_string(),
            order: gpr_order,
            lane_mask: LaneBitmask::ALL,
            spill_size: 8,
            spill_align: 8,
            priority: 0,
            global_priority: false,
            allocatable: true,
        });

        let mut sub_reg_indices = Vec::new();
        let mut pair_class = None;
        if self.pairs {
            sub_reg_indices.push(SubRegIndexData {
                name: "lo".to_string(),
                lane_mask: LaneBitmask(0b01),
            });
            sub_reg_indices.push(SubRegIndexData {
                name: "hi".to_string(),
                lane_mask: LaneBitmask(0b10),
            });
            let mut pairs = Vec::new();
            for k in 0..self.gprs / 2 {
                let lo = PhysReg::new(2 * k as usize);
                let hi = PhysReg::new(2 * k as usize + 1);
                let pair = regs.push(PhysRegData {
                    name: format!("r{}_r{}", 2 * k, 2 * k + 1),
                    units: smallvec![
                        (RegUnit::new(2 * k as usize), LaneBitmask(0b01)),
                        (RegUnit::new(2 * k as usize + 1), LaneBitmask(0b10)),
                    ],
                    sub_regs: smallvec![(SUB_LO, lo), (SUB_HI, hi)],
                });
                if callee_saved.contains(lo) || callee_saved.contains(hi) {
                    callee_saved.insert(pair);
                }
                if reserved.contains(lo) || reserved.contains(hi) {
                    reserved.insert(pair);
                }
                pairs.push(pair);
            }
            pair_class = Some(classes.push(RegClassData {
                name: "pair".to_string(),
                order: caller_first(pairs, &callee_saved),
                lane_mask: LaneBitmask(0b11),
                spill_size: 16,
                spill_align: 8,
                priority: 1,
                global_priority: false,
                allocatable: true,
            }));
        }

        GenericIsa {
            reg_info: RegInfo::new(regs, classes, sub_reg_indices),
            reserved,
            callee_saved,
            gpr_class,
            pair_class,
            track_sub_regs: self.track_sub_regs,
        }
    }
}

/// A generic target built by `Builder`.
#[derive(Clone, Debug)]
pub struct GenericIsa {
    reg_info: RegInfo,
    reserved: RegSet,
    callee_saved: RegSet,
    gpr_class: RegClass,
    pair_class: Option<RegClass>,
    track_sub_regs: bool,
}

impl GenericIsa {
    /// The general purpose register class.
    pub fn gpr_class(&self) -> RegClass {
        self.gpr_class
    }

    /// The pair register class, if configured.
    pub fn pair_class(&self) -> Option<RegClass> {
        self.pair_class
    }

    /// General purpose register `i`.
    pub fn gpr(&self, i: usize) -> PhysReg {
        PhysReg::new(i)
    }

    /// Create a clobber mask in `func` covering every register that isn't callee-saved.
    pub fn call_clobber_mask(&self, func: &mut Function) -> RegMask {
        let regs: Vec<PhysReg> = self
            .reg_info
            .regs
            .keys()
            .filter(|&r| !self.callee_saved.contains(r))
            .collect();
        func.create_reg_mask(regs)
    }
}

impl TargetIsa for GenericIsa {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn reg_info(&self) -> &RegInfo {
        &self.reg_info
    }

    fn reserved_regs(&self) -> &RegSet {
        &self.reserved
    }

    fn callee_saved_regs(&self) -> &RegSet {
        &self.callee_saved
    }

    fn compose_sub_reg(&self, a: SubRegIndex, b: SubRegIndex) -> Option<SubRegIndex> {
        match (a, b) {
            (0, b) => Some(b),
            (a, 0) => Some(a),
            _ => None,
        }
    }

    fn should_track_sub_reg_liveness(&self, rc: RegClass) -> bool {
        self.track_sub_regs && Some(rc) == self.pair_class
    }
}
