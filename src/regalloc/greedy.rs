//! Greedy register allocation.
//!
//! Virtual registers are taken from a priority queue, largest and most constrained first. A
//! register that finds no free physical register may evict lighter registers, be split into
//! pieces that are queued again, or be spilled. Each round moves a register to a later
//! `LiveRangeStage` or resolves it, so allocation terminates.
//!
//! Splitting happens around regions of the CFG that may keep the register in a physical
//! register (`try_region_split`), around single blocks, inside a block (`try_local_split`) and
//! around single instructions.

use crate::ir::{Block, PhysReg, VirtReg};
use crate::regalloc::alloc_base::{RegAllocBase, Selection};
use crate::regalloc::allocation_order::AllocationOrder;
use crate::regalloc::env::RegAllocEnv;
use crate::regalloc::eviction_advisor::{DefaultEvictionAdvisor, EvictionAdvisor};
use crate::regalloc::interference_cache::{
    BlockInterference, CacheContext, CacheCursor, InterferenceCache, CACHE_ENTRIES,
};
use crate::regalloc::live_range_edit::{LiveRangeEdit, LiveRangeEditDelegate};
use crate::regalloc::reg_matrix::InterferenceKind;
use crate::regalloc::slot_indexes::SlotIndex;
use crate::regalloc::spill_placement::{BlockConstraint, BorderConstraint, SpillPlacement};
use crate::regalloc::spiller::{InlineSpiller, Spiller};
use crate::regalloc::split_kit::{count_live_blocks, SplitAnalysis, SplitEditor};
use crate::settings::SplitSpillMode;
use crate::timing::{self, Pass};
use crate::{fview, trace};
use core::cmp::Reverse;
use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashSet;
use std::collections::BinaryHeap;

/// How far the allocator got with a virtual register.
///
/// Stages only move forward, which is what bounds the work done per register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LiveRangeStage {
    /// Not seen by the allocator yet.
    #[default]
    New,
    /// Queued for assignment and eviction.
    Assign,
    /// Requeued once. The next round splits or spills it.
    Split,
    /// Came out of a split that made little progress. Only block splitting is tried again.
    Split2,
    /// Spilled unless it can be assigned.
    Spill,
    /// Waiting for the deferred spill round.
    Memory,
    /// A spill product. Assignment is the only option left.
    Done,
}

#[derive(Clone, Copy, Debug, Default)]
struct RegInfo {
    stage: LiveRangeStage,
    cascade: u32,
}

/// Per register stage and eviction cascade.
#[derive(Clone, Debug)]
pub struct ExtraRegInfo {
    info: SecondaryMap<VirtReg, RegInfo>,
    next_cascade: u32,
}

impl Default for ExtraRegInfo {
    fn default() -> Self {
        Self {
            info: SecondaryMap::new(),
            next_cascade: 1,
        }
    }
}

impl ExtraRegInfo {
    /// Forget everything.
    pub fn clear(&mut self) {
        self.info.clear();
        self.next_cascade = 1;
    }

    /// Make room for `n` registers.
    pub fn grow(&mut self, n: usize) {
        self.info.resize(n);
    }

    /// The stage of `vreg`.
    pub fn stage(&self, vreg: VirtReg) -> LiveRangeStage {
        self.info[vreg].stage
    }

    /// Move `vreg` to `stage`.
    pub fn set_stage(&mut self, vreg: VirtReg, stage: LiveRangeStage) {
        self.info[vreg].stage = stage;
    }

    /// Move the registers in `regs` that are still `New` to `stage`.
    pub fn set_stage_if_new(&mut self, regs: &[VirtReg], stage: LiveRangeStage) {
        for &vreg in regs {
            if self.info[vreg].stage == LiveRangeStage::New {
                self.info[vreg].stage = stage;
            }
        }
    }

    /// The cascade of `vreg`, 0 if it never evicted anything.
    pub fn cascade(&self, vreg: VirtReg) -> u32 {
        self.info[vreg].cascade
    }

    /// Set the cascade of `vreg`.
    pub fn set_cascade(&mut self, vreg: VirtReg, cascade: u32) {
        self.info[vreg].cascade = cascade;
    }

    /// The cascade of `vreg`, assigning a fresh one if it has none.
    pub fn get_or_assign_new_cascade(&mut self, vreg: VirtReg) -> u32 {
        let cascade = self.info[vreg].cascade;
        if cascade != 0 {
            return cascade;
        }
        let cascade = self.next_cascade;
        self.next_cascade += 1;
        self.info[vreg].cascade = cascade;
        cascade
    }

    /// The cascade of `vreg`, or the one it would get.
    pub fn cascade_or_current_next(&self, vreg: VirtReg) -> u32 {
        match self.info[vreg].cascade {
            0 => self.next_cascade,
            cascade => cascade,
        }
    }

    fn did_clone(&mut self, new: VirtReg, old: VirtReg) {
        // Components of a register deserve a new assignment attempt.
        self.info[old].stage = LiveRangeStage::Assign;
        self.info[new] = self.info[old];
    }
}

bitflags::bitflags! {
    /// Last-chance recoloring limits hit while allocating one register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CutOffStage: u8 {
        /// The recursion depth limit.
        const DEPTH = 1 << 0;
        /// The interference count limit.
        const INTERF = 1 << 1;
    }
}

/// Counters collected during one allocation run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegAllocStats {
    /// Spill stores inserted.
    pub spills: usize,
    /// Reloads inserted.
    pub reloads: usize,
    /// Defs rematerialized instead of reloaded.
    pub remats: usize,
    /// Reloads folded into their user.
    pub folded_reloads: usize,
    /// Spills folded into their def.
    pub folded_spills: usize,
    /// Redundant spill stores removed.
    pub spills_removed: usize,
    /// Redundant reloads removed.
    pub reloads_removed: usize,
    /// Spill stores merged into a dominating store.
    pub hoisted_spills: usize,
    /// Copies inserted by splitting.
    pub copies: usize,
    /// Dead instructions deleted.
    pub dce_deleted: usize,
    /// Registers evicted from their assignment.
    pub evictions: usize,
    /// Splits around CFG regions.
    pub region_splits: usize,
    /// Splits isolating single blocks.
    pub block_splits: usize,
    /// Splits inside one block.
    pub local_splits: usize,
    /// Splits around single instructions.
    pub instruction_splits: usize,
    /// Registers assigned by last-chance recoloring.
    pub recolorings: usize,
    /// Last-chance recoloring attempts stopped by a limit.
    pub recoloring_cutoffs: usize,
    /// Registers that could not be allocated and got an arbitrary register.
    pub failed: Vec<VirtReg>,
}

// Priority bits.
const PRIO_ASSIGN: u32 = 1 << 31;
const PRIO_HINT: u32 = 1 << 30;
const PRIO_GLOBAL: u32 = 1 << 29;
const PRIO_CLASS_SHIFT: u32 = 24;
const PRIO_SIZE_MASK: u32 = (1 << 24) - 1;

// A local split must improve on the interference by this factor to be taken.
const HYSTERESIS: f32 = 2007.0 / 2048.0;

// Blocks `grow_region` may visit while expanding one candidate.
const GROW_REGION_BUDGET: usize = 10000;

// The CSR cost is given relative to this entry frequency.
const CSR_COST_ENTRY_FREQ: u64 = 1 << 14;

/// The order registers are allocated in.
#[derive(Default)]
struct RegQueue {
    heap: BinaryHeap<(u32, Reverse<VirtReg>)>,
    mem_ops: u32,
}

impl RegQueue {
    fn clear(&mut self) {
        self.heap.clear();
        self.mem_ops = 0;
    }

    /// Queue `vreg` keyed by stage, hint, global or local, then size. Spill weight plays no part.
    fn push(&mut self, vreg: VirtReg, extra: &mut ExtraRegInfo, env: &RegAllocEnv) {
        if extra.stage(vreg) == LiveRangeStage::New {
            extra.set_stage(vreg, LiveRangeStage::Assign);
        }
        let prio = self.priority(vreg, extra, env);
        trace!("Queueing {vreg} with priority {prio:#x}");
        // Lower register numbers win ties.
        self.heap.push((prio, Reverse(vreg)));
    }

    fn pop(&mut self) -> Option<VirtReg> {
        self.heap.pop().map(|(_, Reverse(vreg))| vreg)
    }

    fn priority(&mut self, vreg: VirtReg, extra: &ExtraRegInfo, env: &RegAllocEnv) -> u32 {
        let li = env.lis.interval(vreg);
        let indexes = env.lis.indexes();
        let per_instr = (indexes.instr_dist() * 4).max(1);
        let size = li.size();
        let clamp = |n: u64| n.min(u64::from(PRIO_SIZE_MASK)) as u32;
        match extra.stage(vreg) {
            // Unsplit ranges that didn't fit wait until everything else is allocated.
            LiveRangeStage::Split => clamp(size),
            // Memory ranges go last, in the reverse order they came in.
            LiveRangeStage::Memory => {
                let prio = self.mem_ops;
                self.mem_ops += 1;
                prio
            }
            stage => {
                let class = env.isa.reg_info().class(env.func.vreg_class(vreg));
                let num_regs = class
                    .order
                    .iter()
                    .filter(|&&r| env.isa.is_allocatable(r))
                    .count() as u64;
                // Giant ranges use the global heuristic to avoid pathological spilling.
                let force_global = class.global_priority || size / per_instr > 2 * num_regs;
                let local = stage == LiveRangeStage::Assign
                    && !force_global
                    && !li.is_empty()
                    && env.lis.interval_in_one_block(&li.range).is_some();
                let mut prio = if local {
                    // Local ranges in instruction order.
                    let to_end = li.begin_index().distance(indexes.last_index()).max(0) as u64;
                    clamp(to_end / per_instr)
                } else {
                    // Global ranges by size, above local ones.
                    clamp(size) | PRIO_GLOBAL
                };
                prio |= u32::from(class.priority & 0x1f) << PRIO_CLASS_SHIFT;
                prio |= PRIO_ASSIGN;
                if env.vrm.phys_hint(vreg).is_some() {
                    prio |= PRIO_HINT;
                }
                prio
            }
        }
    }
}

/// The allocator state live range edits report back to.
#[derive(Default)]
struct AllocState {
    queue: RegQueue,
    extra: ExtraRegInfo,
}

impl LiveRangeEditDelegate for AllocState {
    fn can_erase_virt_reg(&mut self, env: &mut RegAllocEnv, vreg: VirtReg) -> bool {
        if env.vrm.has_phys(vreg) {
            env.matrix.unassign(env.lis.interval(vreg), env.vrm, env.isa);
            return true;
        }
        // Still queued. It is dropped when dequeued.
        false
    }

    fn will_shrink_virt_reg(&mut self, env: &mut RegAllocEnv, vreg: VirtReg) {
        if !env.vrm.has_phys(vreg) {
            return;
        }
        // Give the assigned register back and try again with the smaller range.
        env.matrix.unassign(env.lis.interval(vreg), env.vrm, env.isa);
        self.queue.push(vreg, &mut self.extra, env);
    }

    fn did_clone_virt_reg(&mut self, _env: &mut RegAllocEnv, new: VirtReg, old: VirtReg) {
        self.extra.did_clone(new, old);
    }
}

// A physical register, or the compact region, to split around.
#[derive(Default)]
struct GlobalSplitCandidate {
    phys: Option<PhysReg>,
    cursor: Option<CacheCursor>,
    live_bundles: Vec<bool>,
    active_blocks: Vec<Block>,
    intv: usize,
}

impl GlobalSplitCandidate {
    // Bundles live in this candidate that no one claimed yet are claimed for `cand`.
    fn claim_bundles(&self, bundle_cand: &mut [Option<usize>], cand: usize) -> usize {
        let mut count = 0;
        for (bundle, _) in self.live_bundles.iter().enumerate().filter(|&(_, &live)| live) {
            if bundle_cand[bundle].is_none() {
                bundle_cand[bundle] = Some(cand);
                count += 1;
            }
        }
        count
    }
}

fn cache_ctx<'a>(env: &'a RegAllocEnv) -> CacheContext<'a> {
    CacheContext {
        matrix: &*env.matrix,
        lis: &*env.lis,
        view: fview!(env),
    }
}

// State of region splitting.
#[derive(Default)]
struct RegionSplitter {
    ic: InterferenceCache,
    placer: SpillPlacement,
    cands: Vec<GlobalSplitCandidate>,
    bundle_cand: Vec<Option<usize>>,
    constraints: Vec<BlockConstraint>,
}

impl RegionSplitter {
    fn reset_cand(&mut self, cand: usize, phys: Option<PhysReg>, env: &RegAllocEnv) {
        while self.cands.len() <= cand {
            self.cands.push(GlobalSplitCandidate::default());
        }
        let c = &mut self.cands[cand];
        if let Some(cursor) = c.cursor.take() {
            self.ic.release(cursor);
        }
        c.phys = phys;
        c.cursor = phys.map(|p| self.ic.cursor(p, cache_ctx(env)));
        c.live_bundles.clear();
        c.active_blocks.clear();
        c.intv = 0;
    }

    fn release_cand(&mut self, cand: usize) {
        if let Some(cursor) = self.cands[cand].cursor.take() {
            self.ic.release(cursor);
        }
    }

    fn release_all(&mut self) {
        for cand in &mut self.cands {
            if let Some(cursor) = cand.cursor.take() {
                self.ic.release(cursor);
            }
        }
    }

    // The interference of candidate `cand` in `block`. The compact region has none.
    fn intf(&mut self, cand: usize, block: Block, env: &RegAllocEnv) -> BlockInterference {
        match &self.cands[cand].cursor {
            Some(cursor) => self.ic.block(cursor, block, cache_ctx(env)),
            None => BlockInterference::default(),
        }
    }

    // Add the use block constraints for `cand` to the spill placer. Returns the static cost of
    // the spill code they force, or `None` if no bundle may hold a register.
    fn add_split_constraints(
        &mut self,
        cand: usize,
        sa: &SplitAnalysis,
        env: &RegAllocEnv,
    ) -> Option<u64> {
        let mut cost = 0u64;
        self.constraints.clear();
        for bi in sa.use_blocks() {
            let mut bc = BlockConstraint {
                block: bi.block,
                entry: if bi.live_in {
                    BorderConstraint::PrefReg
                } else {
                    BorderConstraint::DontCare
                },
                exit: BorderConstraint::DontCare,
                changes_value: bi.first_def.is_some(),
            };
            if bi.live_out {
                let implicit_def = env
                    .lis
                    .indexes()
                    .instruction_at(bi.last_instr)
                    .is_some_and(|inst| env.func[inst].opcode.is_implicit_def());
                if !implicit_def {
                    bc.exit = BorderConstraint::PrefReg;
                }
            }
            let intf = self.intf(cand, bi.block, env);
            if let (Some(first), Some(last)) = (intf.first, intf.last) {
                // Spill code needed in this block.
                let mut ins = 0u64;
                if bi.live_in {
                    if first <= env.lis.indexes().block_start(bi.block) {
                        bc.entry = BorderConstraint::MustSpill;
                        ins += 1;
                    } else if first < bi.first_instr {
                        bc.entry = BorderConstraint::PrefSpill;
                        ins += 1;
                    } else if first < bi.last_instr {
                        ins += 1;
                    }
                }
                if bi.live_out {
                    if last >= env.last_split_point(bi.block) {
                        bc.exit = BorderConstraint::MustSpill;
                        ins += 1;
                    } else if last > bi.last_instr {
                        bc.exit = BorderConstraint::PrefSpill;
                        ins += 1;
                    } else if last > bi.first_instr {
                        ins += 1;
                    }
                }
                cost = cost.saturating_add(ins * self.placer.block_frequency(bi.block));
            }
            self.constraints.push(bc);
        }
        self.placer.add_constraints(&self.constraints);
        if self.placer.scan_active_bundles() {
            Some(cost)
        } else {
            None
        }
    }

    // Add constraints for the live-through `blocks` of `cand`.
    fn add_through_constraints(&mut self, cand: usize, blocks: &[Block], env: &RegAllocEnv) {
        let mut links = Vec::new();
        let mut constraints = Vec::new();
        for &block in blocks {
            let intf = self.intf(cand, block, env);
            let (first, last) = match (intf.first, intf.last) {
                (Some(first), Some(last)) => (first, last),
                _ => {
                    links.push(block);
                    continue;
                }
            };
            let entry = if first <= env.lis.indexes().block_start(block) {
                BorderConstraint::MustSpill
            } else {
                BorderConstraint::PrefSpill
            };
            let exit = if last >= env.last_split_point(block) {
                BorderConstraint::MustSpill
            } else {
                BorderConstraint::PrefSpill
            };
            constraints.push(BlockConstraint {
                block,
                entry,
                exit,
                changes_value: false,
            });
        }
        self.placer.add_constraints(&constraints);
        self.placer.add_links(&links);
    }

    // Grow the region of `cand` through the live-through blocks next to bundles preferring a
    // register. Returns false when the budget runs out.
    fn grow_region(&mut self, cand: usize, sa: &SplitAnalysis, env: &RegAllocEnv) -> bool {
        let mut todo: FxHashSet<Block> = sa.through_blocks().collect();
        let mut budget = GROW_REGION_BUDGET;
        let mut added = 0;
        loop {
            let recent: Vec<u32> = self.placer.recent_positive().to_vec();
            for bundle in recent {
                let blocks = self.placer.bundles().blocks(bundle as usize);
                if blocks.len() >= budget {
                    return false;
                }
                budget -= blocks.len();
                for &block in blocks {
                    if todo.remove(&block) {
                        self.cands[cand].active_blocks.push(block);
                    }
                }
            }
            if self.cands[cand].active_blocks.len() == added {
                break;
            }
            let new_blocks: Vec<Block> = self.cands[cand].active_blocks[added..].to_vec();
            if self.cands[cand].phys.is_some() {
                self.add_through_constraints(cand, &new_blocks, env);
            } else {
                // A compact region keeps the value out of registers in through blocks.
                self.placer.add_pref_spill(&new_blocks, true);
            }
            added = self.cands[cand].active_blocks.len();
            self.placer.iterate();
        }
        true
    }

    // Spill code needed by the region of `cand`, beyond the static use block cost.
    fn global_split_cost(&mut self, cand: usize, sa: &SplitAnalysis, env: &RegAllocEnv) -> u64 {
        let mut cost = 0u64;
        for (bi, bc) in sa.use_blocks().iter().zip(self.constraints.clone()) {
            let bundles = self.placer.bundles();
            let reg_in = self.cands[cand].live_bundles[bundles.bundle(bc.block, false)];
            let reg_out = self.cands[cand].live_bundles[bundles.bundle(bc.block, true)];
            let mut ins = 0u64;
            if bi.live_in {
                ins += u64::from(reg_in != (bc.entry == BorderConstraint::PrefReg));
            }
            if bi.live_out {
                ins += u64::from(reg_out != (bc.exit == BorderConstraint::PrefReg));
            }
            cost = cost.saturating_add(ins * self.placer.block_frequency(bc.block));
        }
        let active = self.cands[cand].active_blocks.clone();
        for block in active {
            let bundles = self.placer.bundles();
            let reg_in = self.cands[cand].live_bundles[bundles.bundle(block, false)];
            let reg_out = self.cands[cand].live_bundles[bundles.bundle(block, true)];
            let freq = self.placer.block_frequency(block);
            match (reg_in, reg_out) {
                (false, false) => {}
                (true, true) => {
                    // Spill and reload around interference.
                    if self.intf(cand, block, env).first.is_some() {
                        cost = cost.saturating_add(2 * freq);
                    }
                }
                _ => cost = cost.saturating_add(freq),
            }
        }
        cost
    }

    // Try to split around a compact region kept in a register with the rest on the stack.
    fn calc_compact_region(&mut self, sa: &SplitAnalysis, env: &RegAllocEnv) -> bool {
        if sa.num_through_blocks() == 0 {
            return false;
        }
        self.reset_cand(0, None, env);
        self.placer.prepare();
        if self.add_split_constraints(0, sa, env).is_none() {
            return false;
        }
        if !self.grow_region(0, sa, env) {
            return false;
        }
        let mut live = core::mem::take(&mut self.cands[0].live_bundles);
        self.placer.finish(&mut live);
        let any = live.iter().any(|&b| b);
        self.cands[0].live_bundles = live;
        trace!("Compact region: {}", if any { "found" } else { "none" });
        any
    }

    // Evaluate splitting around `phys` as candidate `num_cands`. Updates `best_cost`,
    // `num_cands` and `best`.
    fn region_split_cost_around(
        &mut self,
        phys: PhysReg,
        best_cost: &mut u64,
        num_cands: &mut usize,
        best: &mut Option<usize>,
        sa: &SplitAnalysis,
        env: &RegAllocEnv,
    ) {
        // Drop the candidate with the fewest bundles when running out of cache cursors.
        if *num_cands == CACHE_ENTRIES {
            let worst = (0..*num_cands)
                .filter(|&c| Some(c) != *best && self.cands[c].phys.is_some())
                .min_by_key(|&c| self.cands[c].live_bundles.iter().filter(|&&b| b).count());
            if let Some(worst) = worst {
                *num_cands -= 1;
                self.cands.swap(worst, *num_cands);
                if *best == Some(*num_cands) {
                    *best = Some(worst);
                }
            } else {
                return;
            }
        }
        let cand = *num_cands;
        self.reset_cand(cand, Some(phys), env);
        self.placer.prepare();
        let mut cost = match self.add_split_constraints(cand, sa, env) {
            Some(cost) => cost,
            None => {
                trace!("{}: no positive bundles", env.isa.reg_info().display_reg(phys));
                self.release_cand(cand);
                return;
            }
        };
        if cost >= *best_cost {
            trace!(
                "{}: static cost {cost} is not better",
                env.isa.reg_info().display_reg(phys)
            );
            self.release_cand(cand);
            return;
        }
        if !self.grow_region(cand, sa, env) {
            trace!("{}: region too large", env.isa.reg_info().display_reg(phys));
            self.release_cand(cand);
            return;
        }
        let mut live = core::mem::take(&mut self.cands[cand].live_bundles);
        self.placer.finish(&mut live);
        let any = live.iter().any(|&b| b);
        self.cands[cand].live_bundles = live;
        if !any {
            self.release_cand(cand);
            return;
        }
        cost = cost.saturating_add(self.global_split_cost(cand, sa, env));
        trace!(
            "{}: split cost {cost}",
            env.isa.reg_info().display_reg(phys)
        );
        if cost < *best_cost {
            *best = Some(cand);
            *best_cost = cost;
        }
        *num_cands += 1;
    }
}

/// The greedy register allocator.
pub struct Greedy {
    state: AllocState,
    spiller: Box<dyn Spiller + Send>,
    advisor: Box<dyn EvictionAdvisor + Send>,
    custom_advisor: bool,
    sa: SplitAnalysis,
    region: RegionSplitter,
    cut_off: CutOffStage,
    csr_cost: u64,
}

impl Default for Greedy {
    fn default() -> Self {
        Self::new()
    }
}

impl Greedy {
    /// Create an allocator with the inline spiller and the default eviction policy.
    pub fn new() -> Self {
        Self {
            state: AllocState::default(),
            spiller: Box::new(InlineSpiller::new()),
            advisor: Box::new(DefaultEvictionAdvisor::default()),
            custom_advisor: false,
            sa: SplitAnalysis::new(),
            region: RegionSplitter::default(),
            cut_off: CutOffStage::empty(),
            csr_cost: 0,
        }
    }

    /// Use another spiller.
    pub fn set_spiller(&mut self, spiller: Box<dyn Spiller + Send>) {
        self.spiller = spiller;
    }

    /// Use another eviction policy.
    pub fn set_eviction_advisor(&mut self, advisor: Box<dyn EvictionAdvisor + Send>) {
        self.advisor = advisor;
        self.custom_advisor = true;
    }

    /// The stages and cascades of the last run.
    pub fn extra_info(&self) -> &ExtraRegInfo {
        &self.state.extra
    }

    /// Allocate every virtual register with a live interval.
    ///
    /// Afterwards every register is assigned a physical register or was spilled. Spilled
    /// registers leave no operands behind.
    pub fn run(&mut self, env: &mut RegAllocEnv) {
        let _tt = timing::start(Pass::Assign);
        self.init(env);
        self.seed_live_regs(env);
        self.allocate_phys_regs(env);
        self.post_optimization(env);
    }

    fn init(&mut self, env: &mut RegAllocEnv) {
        self.state.queue.clear();
        self.state.extra.clear();
        self.state.extra.grow(env.func.vregs.len());
        self.sa.clear();
        self.region.release_all();
        self.region.cands.clear();
        self.region.ic.clear();
        self.region.placer.compute(env.func, env.cfg, env.freqs);
        self.cut_off = CutOffStage::empty();
        if !self.custom_advisor {
            let local_reassign = env.flags.enable_local_reassign();
            self.advisor = Box::new(DefaultEvictionAdvisor::new(local_reassign));
        }
        let raw = u64::from(env.flags.csr_first_time_cost());
        let entry = env.freqs.entry_freq();
        self.csr_cost = if entry == 0 {
            0
        } else {
            raw.saturating_mul(entry) / CSR_COST_ENTRY_FREQ
        };
    }

    fn select_or_split_impl(
        &mut self,
        vreg: VirtReg,
        new_vregs: &mut Vec<VirtReg>,
        fixed: &mut FxHashSet<VirtReg>,
        recolor_stack: &mut Vec<(VirtReg, PhysReg)>,
        depth: u32,
        env: &mut RegAllocEnv,
    ) -> Selection {
        let mut cheap_only = false;
        let order = AllocationOrder::create(vreg, env.func, env.isa, env.vrm);
        if let Some(phys) = self.try_assign(vreg, &order, new_vregs, fixed, env) {
            // Eviction decisions were made for this register, go with them.
            if self.csr_cost == 0
                || !self.is_unused_callee_saved(phys, env)
                || !new_vregs.is_empty()
            {
                return Selection::Phys(phys);
            }
            let csr = self.try_assign_csr_first_time(
                vreg,
                phys,
                &order,
                &mut cheap_only,
                new_vregs,
                env,
            );
            match csr {
                Some(phys) => return Selection::Phys(phys),
                None if !new_vregs.is_empty() => return Selection::Handled,
                None => {}
            }
        }
        if !new_vregs.is_empty() {
            return Selection::Handled;
        }

        let stage = self.state.extra.stage(vreg);
        // Split ranges already failed to evict. They get no second chance until split.
        if stage != LiveRangeStage::Split {
            if let Some(phys) = self.try_evict(vreg, &order, new_vregs, cheap_only, fixed, env) {
                return Selection::Phys(phys);
            }
        }

        // Wait for the second round, when all smaller ranges are allocated and the
        // interference to split around is known.
        if stage < LiveRangeStage::Split {
            self.state.extra.set_stage(vreg, LiveRangeStage::Split);
            trace!("{vreg}: waiting for the second round");
            new_vregs.push(vreg);
            return Selection::Handled;
        }

        if stage < LiveRangeStage::Spill && !env.lis.interval(vreg).is_empty() {
            let before = new_vregs.len();
            let phys = self.try_split(vreg, &order, new_vregs, env);
            if let Some(phys) = phys {
                return Selection::Phys(phys);
            }
            if new_vregs.len() > before {
                return Selection::Handled;
            }
        }

        if stage >= LiveRangeStage::Done || !env.lis.interval(vreg).is_spillable() {
            if !env.flags.enable_last_chance_recoloring() {
                return Selection::Failed;
            }
            return self.try_last_chance_recoloring(
                vreg,
                &order,
                new_vregs,
                fixed,
                recolor_stack,
                depth,
                env,
            );
        }

        if env.flags.enable_deferred_spilling() && stage < LiveRangeStage::Memory {
            self.state.extra.set_stage(vreg, LiveRangeStage::Memory);
            trace!("{vreg}: deferring spill");
            new_vregs.push(vreg);
        } else {
            self.spill(vreg, new_vregs, env);
        }
        Selection::Handled
    }

    fn spill(&mut self, vreg: VirtReg, new_vregs: &mut Vec<VirtReg>, env: &mut RegAllocEnv) {
        let mut edit = LiveRangeEdit::new(Some(vreg), Some(&mut self.state));
        self.spiller.spill(&mut edit, env);
        let regs = edit.regs().to_vec();
        drop(edit);
        self.state.extra.set_stage_if_new(&regs, LiveRangeStage::Done);
        new_vregs.extend(regs);
    }

    fn is_unused_callee_saved(&self, phys: PhysReg, env: &RegAllocEnv) -> bool {
        env.isa.callee_saved_regs().contains(phys) && !env.matrix.is_phys_reg_used(phys, env.isa)
    }

    // The first free register in `order`, preferring hints. A missed hint may be taken by
    // evicting its interference.
    fn try_assign(
        &mut self,
        vreg: VirtReg,
        order: &AllocationOrder,
        new_vregs: &mut Vec<VirtReg>,
        fixed: &FxHashSet<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg> {
        let mut found = None;
        for phys in order.iter() {
            let kind = {
                let li = env.lis.interval(vreg);
                env.matrix.check_interference(li, phys, env.lis, fview!(env))
            };
            if kind == InterferenceKind::Free {
                if order.is_hint(phys) {
                    return Some(phys);
                }
                found = Some(phys);
                break;
            }
        }
        let phys = found?;
        if let Some(hint) = env.vrm.phys_hint(vreg) {
            if hint != phys && order.is_hint(hint) {
                trace!("{vreg} missed hint {}", env.isa.reg_info().display_reg(hint));
                let info = &self.state.extra;
                if self.advisor.can_evict_hint_interference(vreg, hint, fixed, info, env) {
                    self.evict_interference(vreg, hint, new_vregs, env);
                    return Some(hint);
                }
            }
        }
        Some(phys)
    }

    // Pick between a first use of a callee-saved register and splitting or spilling.
    fn try_assign_csr_first_time(
        &mut self,
        vreg: VirtReg,
        phys: PhysReg,
        order: &AllocationOrder,
        cheap_only: &mut bool,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg> {
        let stage = self.state.extra.stage(vreg);
        if stage == LiveRangeStage::Spill && env.lis.interval(vreg).is_spillable() {
            // Spill rather than use the CSR when spilling is cheaper.
            self.sa.analyze(vreg, env);
            if self.spill_cost() >= self.csr_cost {
                return Some(phys);
            }
            // Keep the eviction away from unused callee-saved registers.
            *cheap_only = true;
            return None;
        }
        if stage < LiveRangeStage::Split {
            // Split rather than use the CSR when splitting is cheaper.
            self.sa.analyze(vreg, env);
            let mut num_cands = 0;
            let mut best_cost = self.csr_cost;
            let best = self.region_split_cost(order, &mut best_cost, &mut num_cands, true, env);
            let best = match best {
                Some(best) => best,
                None => {
                    self.region.release_all();
                    return Some(phys);
                }
            };
            self.do_region_split(vreg, Some(best), false, new_vregs, env);
            return None;
        }
        Some(phys)
    }

    fn try_evict(
        &mut self,
        vreg: VirtReg,
        order: &AllocationOrder,
        new_vregs: &mut Vec<VirtReg>,
        cheap_only: bool,
        fixed: &FxHashSet<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg> {
        let _tt = timing::start(Pass::Eviction);
        let info = &self.state.extra;
        let phys = self
            .advisor
            .try_find_evictee_phys_reg(vreg, order, cheap_only, fixed, info, env)?;
        self.evict_interference(vreg, phys, new_vregs, env);
        Some(phys)
    }

    // Unassign everything interfering with `vreg` in `phys` and requeue it.
    fn evict_interference(
        &mut self,
        vreg: VirtReg,
        phys: PhysReg,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) {
        // Evictees get the cascade of the evictor, so they can't evict it back.
        let cascade = self.state.extra.get_or_assign_new_cascade(vreg);
        trace!(
            "Evicting interference of {vreg} in {}, cascade {cascade}",
            env.isa.reg_info().display_reg(phys)
        );
        let mut intfs = Vec::new();
        let units: Vec<_> = env.isa.reg_info().units(phys).collect();
        for unit in units {
            let li = env.lis.interval(vreg);
            let (regs, _) = env.matrix.interfering_vregs(li, unit, usize::MAX);
            intfs.extend(regs);
        }
        for intf in intfs {
            // A register may interfere on several units.
            if !env.vrm.has_phys(intf) {
                continue;
            }
            env.matrix.unassign(env.lis.interval(intf), env.vrm, env.isa);
            debug_assert!(
                self.state.extra.cascade(intf) < cascade
                    || (!env.lis.interval(vreg).is_spillable()
                        && env.lis.interval(intf).is_spillable()),
                "cannot decrease the cascade of {intf}"
            );
            self.state.extra.set_cascade(intf, cascade);
            env.stats.evictions += 1;
            new_vregs.push(intf);
        }
    }

    fn try_split(
        &mut self,
        vreg: VirtReg,
        order: &AllocationOrder,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg> {
        let _tt = timing::start(Pass::Split);
        if self.state.extra.stage(vreg) >= LiveRangeStage::Spill {
            return None;
        }
        let local = env.lis.interval_in_one_block(&env.lis.interval(vreg).range).is_some();
        self.sa.analyze(vreg, env);
        if local {
            let phys = self.try_local_split(vreg, order, new_vregs, env);
            if phys.is_some() || !new_vregs.is_empty() {
                return phys;
            }
            return self.try_instruction_split(vreg, new_vregs, env);
        }
        // Split2 ranges made dubious progress with region splitting already.
        let huge = self.sa.num_live_blocks() > env.flags.huge_size_for_split() as usize;
        if self.state.extra.stage(vreg) < LiveRangeStage::Split2 && !huge {
            let phys = self.try_region_split(vreg, order, new_vregs, env);
            if phys.is_some() || !new_vregs.is_empty() {
                return phys;
            }
        }
        self.try_block_split(vreg, new_vregs, env)
    }

    // The cost of spilling the analyzed register: one spill or reload per use block, two
    // where the block redefines a live-through value.
    fn spill_cost(&self) -> u64 {
        let mut cost = 0u64;
        for bi in self.sa.use_blocks() {
            let freq = self.region.placer.block_frequency(bi.block);
            cost = cost.saturating_add(freq);
            if bi.live_in && bi.live_out && bi.first_def.is_some() {
                cost = cost.saturating_add(freq);
            }
        }
        cost
    }

    fn region_split_cost(
        &mut self,
        order: &AllocationOrder,
        best_cost: &mut u64,
        num_cands: &mut usize,
        ignore_csr: bool,
        env: &RegAllocEnv,
    ) -> Option<usize> {
        let mut best = None;
        for phys in order.iter() {
            if ignore_csr && self.is_unused_callee_saved(phys, env) {
                continue;
            }
            self.region
                .region_split_cost_around(phys, best_cost, num_cands, &mut best, &self.sa, env);
        }
        best
    }

    fn try_region_split(
        &mut self,
        vreg: VirtReg,
        order: &AllocationOrder,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg> {
        let spill_cost = self.spill_cost();
        let has_compact = self.region.calc_compact_region(&self.sa, env);
        let (mut num_cands, mut best_cost) = if has_compact {
            (1, u64::MAX)
        } else {
            // Splitting must then beat isolating every block.
            trace!("Cost of isolating all blocks of {vreg}: {spill_cost}");
            (0, spill_cost)
        };
        let best = self.region_split_cost(order, &mut best_cost, &mut num_cands, false, env);
        if !has_compact && best.is_none() {
            self.region.release_all();
            return None;
        }
        self.do_region_split(vreg, best, has_compact, new_vregs, env);
        None
    }

    fn do_region_split(
        &mut self,
        vreg: VirtReg,
        best: Option<usize>,
        has_compact: bool,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) {
        let mode = env.flags.split_spill_mode();
        let mut edit = LiveRangeEdit::new(Some(vreg), Some(&mut self.state));
        let mut se = SplitEditor::new(&mut edit, mode);
        let region = &mut self.region;
        let num_bundles = region.placer.bundles().num_bundles();
        region.bundle_cand.clear();
        region.bundle_cand.resize(num_bundles, None);

        let mut used = Vec::new();
        if let Some(best) = best {
            if region.cands[best].claim_bundles(&mut region.bundle_cand, best) > 0 {
                used.push(best);
                region.cands[best].intv = se.open_intv(env);
                trace!(
                    "Splitting {vreg} for {:?} into interval {}",
                    region.cands[best].phys,
                    region.cands[best].intv
                );
            }
        }
        if has_compact && region.cands[0].claim_bundles(&mut region.bundle_cand, 0) > 0 {
            used.push(0);
            region.cands[0].intv = se.open_intv(env);
            trace!("Splitting {vreg} around the compact region");
        }

        let num_global = se.num_intervals();
        debug_assert!(num_global > 0, "no global intervals configured");

        // Blocks with uses.
        let use_blocks = self.sa.use_blocks().to_vec();
        for bi in &use_blocks {
            let (mut intv_in, mut intf_in) = (None, None);
            let (mut intv_out, mut intf_out) = (None, None);
            if bi.live_in {
                let bundle = region.placer.bundles().bundle(bi.block, false);
                if let Some(cand) = region.bundle_cand[bundle] {
                    intv_in = Some(region.cands[cand].intv);
                    intf_in = region.intf(cand, bi.block, env).first;
                }
            }
            if bi.live_out {
                let bundle = region.placer.bundles().bundle(bi.block, true);
                if let Some(cand) = region.bundle_cand[bundle] {
                    intv_out = Some(region.cands[cand].intv);
                    intf_out = region.intf(cand, bi.block, env).last;
                }
            }
            match (intv_in, intv_out) {
                (None, None) => {
                    // An isolated block with several uses gets its own interval.
                    if self.sa.should_split_single_block(bi, false, env) {
                        se.split_single_block(bi, env);
                    }
                }
                (Some(_), Some(_)) => {
                    se.split_live_through_block(bi.block, intv_in, intf_in, intv_out, intf_out, env)
                }
                (Some(intv), None) => se.split_reg_in_block(bi, intv, intf_in, env),
                (None, Some(intv)) => se.split_reg_out_block(bi, intv, intf_out, env),
            }
        }

        // Live-through blocks of the used candidates, each once.
        let mut todo: FxHashSet<Block> = self.sa.through_blocks().collect();
        for &cand in &used {
            let blocks = region.cands[cand].active_blocks.clone();
            for block in blocks {
                if !todo.remove(&block) {
                    continue;
                }
                let (mut intv_in, mut intf_in) = (None, None);
                let (mut intv_out, mut intf_out) = (None, None);
                let bundle_in = region.placer.bundles().bundle(block, false);
                if let Some(c) = region.bundle_cand[bundle_in] {
                    intv_in = Some(region.cands[c].intv);
                    intf_in = region.intf(c, block, env).first;
                }
                let bundle_out = region.placer.bundles().bundle(block, true);
                if let Some(c) = region.bundle_cand[bundle_out] {
                    intv_out = Some(region.cands[c].intv);
                    intf_out = region.intf(c, block, env).last;
                }
                if intv_in.is_none() && intv_out.is_none() {
                    continue;
                }
                se.split_live_through_block(block, intv_in, intf_in, intv_out, intf_out, env);
            }
        }
        region.release_all();

        env.stats.region_splits += 1;
        let mut intv_map = Vec::new();
        se.finish(Some(&mut intv_map), env);
        let regs = edit.regs().to_vec();
        drop(edit);

        // Sort out the new intervals:
        // - the complement is not split again,
        // - global intervals may split again while they cover fewer blocks,
        // - local intervals and dead code leftovers are new.
        let orig_blocks = self.sa.num_live_blocks();
        for (i, &reg) in regs.iter().enumerate() {
            if !env.lis.has_interval(reg) || self.state.extra.stage(reg) != LiveRangeStage::New {
                continue;
            }
            let intv = intv_map.get(i).copied().unwrap_or(usize::MAX);
            if intv == 0 {
                self.state.extra.set_stage(reg, LiveRangeStage::Spill);
            } else if intv < num_global {
                let live = count_live_blocks(&env.lis.interval(reg).range, env.lis.indexes());
                if live >= orig_blocks {
                    trace!("{reg} covers the same {orig_blocks} blocks as the original");
                    self.state.extra.set_stage(reg, LiveRangeStage::Split2);
                }
            }
        }
        new_vregs.extend(regs);
    }

    fn try_block_split(
        &mut self,
        vreg: VirtReg,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg> {
        let mode = env.flags.split_spill_mode();
        let mut edit = LiveRangeEdit::new(Some(vreg), Some(&mut self.state));
        let mut se = SplitEditor::new(&mut edit, mode);
        let use_blocks = self.sa.use_blocks().to_vec();
        for bi in &use_blocks {
            if self.sa.should_split_single_block(bi, false, env) {
                se.split_single_block(bi, env);
            }
        }
        if se.num_intervals() == 0 {
            return None;
        }
        env.stats.block_splits += 1;
        let mut intv_map = Vec::new();
        se.finish(Some(&mut intv_map), env);
        let regs = edit.regs().to_vec();
        drop(edit);
        // The remainder goes straight to spilling. The local ranges stay new.
        for (i, &reg) in regs.iter().enumerate() {
            if env.lis.has_interval(reg)
                && self.state.extra.stage(reg) == LiveRangeStage::New
                && intv_map.get(i) == Some(&0)
            {
                self.state.extra.set_stage(reg, LiveRangeStage::Spill);
            }
        }
        new_vregs.extend(regs);
        None
    }

    // For each gap between consecutive uses, the heaviest interference in `phys`. Fixed
    // interference is infinitely heavy.
    fn calc_gap_weights(&self, phys: PhysReg, env: &RegAllocEnv) -> Vec<f32> {
        let bi = self.sa.use_blocks()[0];
        let uses = self.sa.use_slots();
        let num_gaps = uses.len() - 1;
        let start = if bi.live_in { bi.first_instr.base() } else { bi.first_instr };
        let stop = if bi.live_out { bi.last_instr.dead_slot() } else { bi.last_instr };
        let mut weights = vec![0.0f32; num_gaps];

        // Interference overlapping an instruction counts in the gaps on both sides.
        let mark = |weights: &mut [f32], s: SlotIndex, e: SlotIndex, w: f32| {
            let mut gap = 0;
            while gap < num_gaps && uses[gap + 1].dead_slot() < s {
                gap += 1;
            }
            while gap < num_gaps {
                weights[gap] = weights[gap].max(w);
                if uses[gap + 1].base() >= e {
                    break;
                }
                gap += 1;
            }
        };

        let units: Vec<_> = env.isa.reg_info().units(phys).collect();
        for &unit in &units {
            for (s, e, other) in env.matrix.union(unit).overlapping(start, stop) {
                mark(&mut weights, s, e, env.lis.interval(other).weight);
            }
        }
        for &unit in &units {
            let fixed = env.lis.reg_unit(unit, fview!(env));
            for seg in fixed.segments.iter().filter(|s| s.end > start && s.start < stop) {
                mark(&mut weights, seg.start, seg.end, f32::INFINITY);
            }
        }
        weights
    }

    // Split a block-local range around the sequence of uses with the least interference.
    fn try_local_split(
        &mut self,
        vreg: VirtReg,
        order: &AllocationOrder,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg> {
        if self.sa.use_blocks().len() != 1 {
            return None;
        }
        let bi = self.sa.use_blocks()[0];
        let uses = self.sa.use_slots().to_vec();
        if uses.len() <= 2 {
            return None;
        }
        let num_gaps = uses.len() - 1;

        // Gaps crossed by a call clobber.
        let mut reg_mask_gaps = Vec::new();
        let clobbered = env.lis.check_reg_mask_interference(
            &env.lis.interval(vreg).range,
            env.func,
            env.isa,
        );
        if clobbered.is_some() {
            let (block_start, block_end) = env.lis.indexes().block_range(bi.block);
            let masks: Vec<SlotIndex> = env
                .lis
                .reg_masks_in(block_start, block_end)
                .map(|(slot, _)| slot)
                .filter(|&slot| slot >= uses[0].reg_slot(false))
                .collect();
            let mut ri = 0;
            for gap in 0..num_gaps {
                if ri == masks.len() {
                    break;
                }
                if SlotIndex::is_earlier_instr(uses[gap + 1], masks[ri]) {
                    continue;
                }
                // A clobber on the last use doesn't overlap the range.
                if SlotIndex::is_same_instr(uses[gap + 1], masks[ri]) && gap + 1 == num_gaps {
                    break;
                }
                reg_mask_gaps.push(gap);
                while ri < masks.len() && SlotIndex::is_earlier_instr(masks[ri], uses[gap + 1]) {
                    ri += 1;
                }
            }
        }

        // Ranges at Split2 must make progress, which bounds repeated local splitting.
        let progress_required = self.state.extra.stage(vreg) >= LiveRangeStage::Split2;
        let mut best_before = num_gaps;
        let mut best_after = 0;
        let mut best_diff = 0.0f32;

        for phys in order.iter() {
            let mut gap_weight = self.calc_gap_weights(phys, env);
            let clobbers_phys = {
                let li = env.lis.interval(vreg);
                env.matrix.check_reg_mask_interference(li, phys, env.lis, fview!(env))
            };
            if clobbers_phys {
                for &gap in &reg_mask_gaps {
                    gap_weight[gap] = f32::INFINITY;
                }
            }

            // Split before uses[split_before] and after uses[split_after]. `max_gap` is the
            // heaviest interference in between.
            let mut split_before = 0;
            let mut split_after = 1;
            let mut max_gap = gap_weight[0];
            loop {
                let live_before = split_before != 0 || bi.live_in;
                let live_after = split_after != num_gaps || bi.live_out;
                if !live_before && !live_after {
                    break;
                }
                let mut shrink = true;
                let new_gaps = usize::from(live_before) + split_after - split_before
                    + usize::from(live_after);
                let legal = !progress_required || new_gaps < num_gaps;
                if legal && max_gap < f32::INFINITY {
                    let est_weight =
                        env.future_weight(vreg, uses[split_before], uses[split_after]);
                    if est_weight * HYSTERESIS >= max_gap {
                        shrink = false;
                        let diff = est_weight - max_gap;
                        if diff > best_diff {
                            best_diff = HYSTERESIS * diff;
                            best_before = split_before;
                            best_after = split_after;
                        }
                    }
                }
                if shrink {
                    split_before += 1;
                    if split_before < split_after {
                        if gap_weight[split_before - 1] >= max_gap {
                            max_gap = gap_weight[split_before..split_after]
                                .iter()
                                .fold(0.0f32, |m, &w| m.max(w));
                        }
                        continue;
                    }
                    max_gap = 0.0;
                }
                if split_after >= num_gaps {
                    break;
                }
                max_gap = max_gap.max(gap_weight[split_after]);
                split_after += 1;
            }
        }

        if best_before == num_gaps {
            return None;
        }
        trace!(
            "Local split of {vreg} between {} and {}",
            uses[best_before],
            uses[best_after]
        );

        let mut edit = LiveRangeEdit::new(Some(vreg), Some(&mut self.state));
        let mut se = SplitEditor::new(&mut edit, SplitSpillMode::Partition);
        se.open_intv(env);
        let seg_start = se.enter_intv_before(uses[best_before], env);
        let seg_stop = se.leave_intv_after(uses[best_after], env);
        se.use_intv(seg_start, seg_stop);
        let mut intv_map = Vec::new();
        se.finish(Some(&mut intv_map), env);
        let regs = edit.regs().to_vec();
        drop(edit);

        // A range with as many gaps as before must make progress next time.
        let live_before = best_before != 0 || bi.live_in;
        let live_after = best_after != num_gaps || bi.live_out;
        let new_gaps =
            usize::from(live_before) + best_after - best_before + usize::from(live_after);
        if new_gaps >= num_gaps {
            debug_assert!(!progress_required, "local split of {vreg} made no progress");
            for (i, &reg) in regs.iter().enumerate() {
                if intv_map.get(i) == Some(&1) && env.lis.has_interval(reg) {
                    trace!("{reg} made no progress");
                    self.state.extra.set_stage(reg, LiveRangeStage::Split2);
                }
            }
        }
        env.stats.local_splits += 1;
        new_vregs.extend(regs);
        None
    }

    // Split around every instruction reading only part of a register tracked by lanes. The
    // pieces may then fit registers that are partly occupied.
    fn try_instruction_split(
        &mut self,
        vreg: VirtReg,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Option<PhysReg> {
        if !env.lis.interval(vreg).has_sub_ranges() {
            return None;
        }
        let uses = self.sa.use_slots().to_vec();
        if uses.len() <= 1 {
            return None;
        }
        let full_mask = env
            .isa
            .reg_info()
            .class(env.func.vreg_class(vreg))
            .lane_mask;
        let mut edit = LiveRangeEdit::new(Some(vreg), Some(&mut self.state));
        let mut se = SplitEditor::new(&mut edit, SplitSpillMode::Size);
        for &idx in &uses {
            if let Some(inst) = env.lis.indexes().instruction_at(idx) {
                let data = &env.func[inst];
                let is_full_copy = data.opcode.is_copy()
                    && data.operands.iter().all(|op| op.subreg() == 0);
                let reads_subset = data.operands.iter().any(|op| {
                    op.virt_reg() == Some(vreg)
                        && op.reads_reg()
                        && op.subreg() != 0
                        && env.isa.reg_info().sub_reg_lane_mask(op.subreg()) != full_mask
                });
                if is_full_copy || !reads_subset {
                    trace!("Not splitting around {inst}");
                    continue;
                }
            }
            se.open_intv(env);
            let seg_start = se.enter_intv_before(idx, env);
            let seg_stop = se.leave_intv_after(idx, env);
            se.use_intv(seg_start, seg_stop);
        }
        if se.num_intervals() == 0 {
            trace!("All uses of {vreg} read the full register");
            return None;
        }
        se.finish(None, env);
        let regs = edit.regs().to_vec();
        drop(edit);
        // This was the last chance.
        for &reg in &regs {
            if env.lis.has_interval(reg) {
                self.state.extra.set_stage(reg, LiveRangeStage::Spill);
            }
        }
        env.stats.instruction_splits += 1;
        new_vregs.extend(regs);
        None
    }

    // Can every register interfering with `vreg` in `phys` be recolored? Collects them.
    fn may_recolor_all_interferences(
        &mut self,
        vreg: VirtReg,
        phys: PhysReg,
        candidates: &mut Vec<VirtReg>,
        fixed: &FxHashSet<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> bool {
        let max = if env.flags.exhaustive_search() {
            usize::MAX
        } else {
            env.flags.lcr_max_interf() as usize
        };
        let class = env.func.vreg_class(vreg);
        let units: Vec<_> = env.isa.reg_info().units(phys).collect();
        for unit in units {
            let li = env.lis.interval(vreg);
            let (regs, _) = env.matrix.interfering_vregs(li, unit, max);
            if regs.len() >= max {
                trace!("Too many interferences for recoloring {vreg}");
                self.cut_off |= CutOffStage::INTERF;
                return false;
            }
            for &other in regs.iter().rev() {
                // A Done register of the same class is as stuck as `vreg`.
                let stuck = self.state.extra.stage(other) == LiveRangeStage::Done
                    && env.func.vreg_class(other) == class;
                if stuck || fixed.contains(&other) {
                    trace!("{other} can't be recolored");
                    return false;
                }
                if !candidates.contains(&other) {
                    candidates.push(other);
                }
            }
        }
        true
    }

    // Assign `vreg` by moving the registers in its way to other registers, recursively.
    #[allow(clippy::too_many_arguments)]
    fn try_last_chance_recoloring(
        &mut self,
        vreg: VirtReg,
        order: &AllocationOrder,
        new_vregs: &mut Vec<VirtReg>,
        fixed: &mut FxHashSet<VirtReg>,
        recolor_stack: &mut Vec<(VirtReg, PhysReg)>,
        depth: u32,
        env: &mut RegAllocEnv,
    ) -> Selection {
        trace!("Last chance recoloring for {vreg} at depth {depth}");
        let entry_size = recolor_stack.len();
        if depth >= env.flags.lcr_max_depth() && !env.flags.exhaustive_search() {
            trace!("Recoloring depth limit reached");
            self.cut_off |= CutOffStage::DEPTH;
            return Selection::Failed;
        }
        fixed.insert(vreg);

        for phys in order.iter() {
            let kind = {
                let li = env.lis.interval(vreg);
                env.matrix.check_interference(li, phys, env.lis, fview!(env))
            };
            // Only virtual register interference can be recolored.
            if kind > InterferenceKind::VirtReg {
                continue;
            }
            let mut candidates = Vec::new();
            if !self.may_recolor_all_interferences(vreg, phys, &mut candidates, fixed, env) {
                continue;
            }
            let mut queue = RegQueue::default();
            for &cand in &candidates {
                queue.push(cand, &mut self.state.extra, env);
                let assigned = env.vrm.phys(cand);
                let assigned = assigned.unwrap_or_else(|| panic!("{cand} interferes unassigned"));
                recolor_stack.push((cand, assigned));
                env.matrix.unassign(env.lis.interval(cand), env.vrm, env.isa);
            }
            // Pretend `vreg` is in `phys` while recoloring the others.
            env.matrix.assign(env.lis.interval(vreg), phys, env.vrm, env.isa);
            let saved_fixed = fixed.clone();
            let mut current = Vec::new();
            let recolored = self.try_recoloring_candidates(
                &mut queue,
                &mut current,
                fixed,
                recolor_stack,
                depth,
                env,
            );
            if recolored {
                new_vregs.extend(current);
                env.stats.recolorings += 1;
                if env.vrm.has_phys(vreg) {
                    env.matrix.unassign(env.lis.interval(vreg), env.vrm, env.isa);
                    return Selection::Phys(phys);
                }
                // Recoloring deleted `vreg`.
                fixed.remove(&vreg);
                return Selection::Handled;
            }
            trace!("Recoloring {vreg} into {} failed", env.isa.reg_info().display_reg(phys));
            *fixed = saved_fixed;
            if env.vrm.has_phys(vreg) {
                env.matrix.unassign(env.lis.interval(vreg), env.vrm, env.isa);
            }
            // Candidates get their registers back below.
            for reg in current {
                if !candidates.contains(&reg) {
                    new_vregs.push(reg);
                }
            }
            // Roll back this attempt and every nested one.
            for &(reg, _) in recolor_stack[entry_size..].iter().rev() {
                if env.vrm.has_phys(reg) && env.lis.has_interval(reg) {
                    env.matrix.unassign(env.lis.interval(reg), env.vrm, env.isa);
                }
            }
            for &(reg, assigned) in &recolor_stack[entry_size..] {
                if env.lis.has_interval(reg)
                    && !env.lis.interval(reg).is_empty()
                    && !env.func.reg_empty(reg)
                {
                    env.matrix.assign(env.lis.interval(reg), assigned, env.vrm, env.isa);
                }
            }
            recolor_stack.truncate(entry_size);
        }
        Selection::Failed
    }

    fn try_recoloring_candidates(
        &mut self,
        queue: &mut RegQueue,
        new_vregs: &mut Vec<VirtReg>,
        fixed: &mut FxHashSet<VirtReg>,
        recolor_stack: &mut Vec<(VirtReg, PhysReg)>,
        depth: u32,
        env: &mut RegAllocEnv,
    ) -> bool {
        while let Some(reg) = queue.pop() {
            trace!("Trying to recolor {reg}");
            let sel =
                self.select_or_split_impl(reg, new_vregs, fixed, recolor_stack, depth + 1, env);
            let empty = !env.lis.has_interval(reg) || env.lis.interval(reg).is_empty();
            match sel {
                Selection::Failed => return false,
                // A split may leave nothing to recolor.
                Selection::Handled if empty => continue,
                Selection::Handled => return false,
                Selection::Phys(phys) => {
                    trace!("Recolored {reg} to {}", env.isa.reg_info().display_reg(phys));
                    env.matrix.assign(env.lis.interval(reg), phys, env.vrm, env.isa);
                    fixed.insert(reg);
                }
            }
        }
        true
    }
}

impl RegAllocBase for Greedy {
    fn enqueue(&mut self, vreg: VirtReg, env: &mut RegAllocEnv) {
        self.state.queue.push(vreg, &mut self.state.extra, env);
    }

    fn dequeue(&mut self) -> Option<VirtReg> {
        self.state.queue.pop()
    }

    fn select_or_split(
        &mut self,
        vreg: VirtReg,
        new_vregs: &mut Vec<VirtReg>,
        env: &mut RegAllocEnv,
    ) -> Selection {
        trace!(
            "Selecting for {vreg} in stage {:?}, cascade {}",
            self.state.extra.stage(vreg),
            self.state.extra.cascade(vreg)
        );
        self.cut_off = CutOffStage::empty();
        let mut fixed = FxHashSet::default();
        let mut recolor_stack = Vec::new();
        let sel =
            self.select_or_split_impl(vreg, new_vregs, &mut fixed, &mut recolor_stack, 0, env);
        if sel != Selection::Failed || self.cut_off.is_empty() {
            return sel;
        }
        env.stats.recoloring_cutoffs += 1;
        log::debug!(
            "Recoloring {vreg} stopped by {:?}, spilling instead",
            self.cut_off
        );
        if !env.lis.has_interval(vreg) || !env.lis.interval(vreg).is_spillable() {
            return Selection::Failed;
        }
        self.spill(vreg, new_vregs, env);
        Selection::Handled
    }

    fn spiller(&mut self) -> &mut dyn Spiller {
        &mut *self.spiller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::ir::{Function, InstData, Reg};
    use crate::isa::generic::{self, GenericIsa};
    use crate::regalloc::env::tests::TestEnv;
    use crate::settings::{self, Configurable, Flags};

    fn assigned_everything(t: &TestEnv) -> bool {
        t.lis
            .vregs()
            .filter(|&v| !t.func.reg_empty(v))
            .all(|v| t.vrm.has_phys(v))
    }

    // Three values live at once, with two registers.
    fn three_live(isa: &GenericIsa) -> Function {
        let mut func = Function::with_name("three");
        let p = func.new_vreg(isa.gpr_class());
        let x = func.new_vreg(isa.gpr_class());
        let y = func.new_vreg(isa.gpr_class());
        let z = func.new_vreg(isa.gpr_class());
        let u = func.new_vreg(isa.gpr_class());
        let v = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(p, 7));
        func.append_inst(b0, InstData::alu_imm(x, p, 1));
        func.append_inst(b0, InstData::alu_imm(y, p, 2));
        func.append_inst(b0, InstData::alu_imm(z, p, 3));
        func.append_inst(b0, InstData::alu(u, x, y));
        func.append_inst(b0, InstData::alu(v, u, z));
        func.append_inst(b0, InstData::ret([Reg::Virt(v)]));
        func
    }

    fn allocate(t: &mut TestEnv) -> RegAllocStats {
        let mut env = t.env();
        Greedy::new().run(&mut env);
        env.stats
    }

    #[test]
    fn stages_advance() {
        assert!(LiveRangeStage::New < LiveRangeStage::Assign);
        assert!(LiveRangeStage::Split < LiveRangeStage::Split2);
        assert!(LiveRangeStage::Memory < LiveRangeStage::Done);
        assert_eq!(LiveRangeStage::default(), LiveRangeStage::New);
    }

    #[test]
    fn cascades_start_at_one() {
        let mut info = ExtraRegInfo::default();
        let a = VirtReg::new(0);
        let b = VirtReg::new(1);
        assert_eq!(info.cascade(a), 0);
        assert_eq!(info.cascade_or_current_next(a), 1);
        assert_eq!(info.get_or_assign_new_cascade(a), 1);
        assert_eq!(info.get_or_assign_new_cascade(a), 1);
        assert_eq!(info.get_or_assign_new_cascade(b), 2);
        info.clear();
        assert_eq!(info.cascade_or_current_next(b), 1);
    }

    #[test]
    fn clones_inherit_the_stage() {
        let mut info = ExtraRegInfo::default();
        let a = VirtReg::new(0);
        let b = VirtReg::new(1);
        info.set_stage(a, LiveRangeStage::Split2);
        info.set_cascade(a, 3);
        info.did_clone(b, a);
        assert_eq!(info.stage(a), LiveRangeStage::Assign);
        assert_eq!(info.stage(b), LiveRangeStage::Assign);
        assert_eq!(info.cascade(b), 3);

        info.set_stage(b, LiveRangeStage::Done);
        info.set_stage_if_new(&[a, b, VirtReg::new(2)], LiveRangeStage::Spill);
        assert_eq!(info.stage(b), LiveRangeStage::Done);
        assert_eq!(info.stage(VirtReg::new(2)), LiveRangeStage::Spill);
    }

    #[test]
    fn local_ranges_go_in_instruction_order() {
        let isa = generic::builder().gprs(4).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::iconst(b, 2));
        func.append_inst(b0, InstData::ret([Reg::Virt(a), Reg::Virt(b)]));
        let mut t = TestEnv::new(func, isa);
        let env = t.env();
        let mut queue = RegQueue::default();
        let mut extra = ExtraRegInfo::default();
        queue.push(b, &mut extra, &env);
        queue.push(a, &mut extra, &env);
        assert_eq!(extra.stage(a), LiveRangeStage::Assign);
        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn global_ranges_come_before_local_ones() {
        let isa = generic::builder().gprs(4).finish();
        let mut func = Function::with_name("f");
        let l = func.new_vreg(isa.gpr_class());
        let g = func.new_vreg(isa.gpr_class());
        let m = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        let b1 = func.append_block();
        func.append_inst(b0, InstData::iconst(l, 1));
        func.append_inst(b0, InstData::iconst(g, 2));
        func.append_inst(b0, InstData::alu(m, l, l));
        func.append_inst(b0, InstData::jump(b1));
        func.append_inst(b1, InstData::ret([Reg::Virt(g)]));
        let mut t = TestEnv::new(func, isa);
        let env = t.env();
        let mut queue = RegQueue::default();
        let mut extra = ExtraRegInfo::default();
        queue.push(l, &mut extra, &env);
        queue.push(g, &mut extra, &env);
        assert_eq!(queue.pop(), Some(g));
        assert_eq!(queue.pop(), Some(l));
    }

    #[test]
    fn everything_fits() {
        let isa = generic::builder().gprs(2).finish();
        let mut func = Function::with_name("f");
        let a = func.new_vreg(isa.gpr_class());
        let b = func.new_vreg(isa.gpr_class());
        let c = func.new_vreg(isa.gpr_class());
        let b0 = func.append_block();
        func.append_inst(b0, InstData::iconst(a, 1));
        func.append_inst(b0, InstData::iconst(b, 2));
        func.append_inst(b0, InstData::alu(c, a, b));
        func.append_inst(b0, InstData::ret([Reg::Virt(c)]));
        let mut t = TestEnv::new(func, isa);
        let stats = allocate(&mut t);
        assert_eq!(stats.spills, 0);
        assert!(stats.failed.is_empty());
        assert!(assigned_everything(&t));
        assert_ne!(t.vrm.phys(a), t.vrm.phys(b));
    }

    #[test]
    fn pressure_forces_spill_code() {
        let isa = generic::builder().gprs(2).finish();
        let func = three_live(&isa);
        let mut t = TestEnv::new(func, isa);
        let stats = allocate(&mut t);
        assert!(stats.failed.is_empty(), "{stats:?}");
        assert!(stats.spills + stats.remats > 0, "{stats:?}");
        assert!(assigned_everything(&t));
        t.func.verify_reg_lists().unwrap();
    }

    #[test]
    fn deferred_spilling_still_allocates() {
        let isa = generic::builder().gprs(2).finish();
        let func = three_live(&isa);
        let mut builder = settings::builder();
        builder.enable("enable_deferred_spilling").unwrap();
        let mut t = TestEnv::with_flags(func, isa, Flags::new(builder));
        let stats = allocate(&mut t);
        assert!(stats.failed.is_empty(), "{stats:?}");
        assert!(assigned_everything(&t));
    }
}
