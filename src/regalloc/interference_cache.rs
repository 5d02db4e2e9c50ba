//! Per block interference summaries for physical registers.
//!
//! Region splitting asks, for many blocks and a handful of candidate registers, where the first
//! and last interference inside the block is. The cache keeps those answers for a fixed pool of
//! physical registers, reusing entries round robin. An entry is recomputed lazily when one of
//! the unions it summarizes changed.

use crate::entity::packed_option::PackedOption;
use crate::entity::SecondaryMap;
use crate::ir::{Block, PhysReg};
use crate::regalloc::live_intervals::{FuncView, LiveIntervals};
use crate::regalloc::reg_matrix::LiveRegMatrix;
use crate::regalloc::slot_indexes::SlotIndex;
use crate::trace;
use smallvec::SmallVec;

/// Number of physical registers cached at the same time.
pub const CACHE_ENTRIES: usize = 32;

/// The interference of a physical register inside one block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockInterference {
    /// The first interfering point, if any.
    pub first: Option<SlotIndex>,
    /// The end of the last interference.
    pub last: Option<SlotIndex>,
}

impl BlockInterference {
    fn add(&mut self, start: SlotIndex, end: SlotIndex) {
        self.first = Some(self.first.map_or(start, |f| f.min(start)));
        self.last = Some(self.last.map_or(end, |l| l.max(end)));
    }
}

/// What the cache reads to compute summaries.
#[derive(Clone, Copy)]
pub struct CacheContext<'a> {
    /// The assignments.
    pub matrix: &'a LiveRegMatrix,
    /// The fixed unit ranges and call clobbers.
    pub lis: &'a LiveIntervals,
    /// The function.
    pub view: FuncView<'a>,
}

#[derive(Clone, Default)]
struct Entry {
    phys: PackedOption<PhysReg>,
    refs: u32,
    union_tags: SmallVec<[u32; 2]>,
    generation: u32,
    blocks: SecondaryMap<Block, Option<BlockInterference>>,
}

impl Entry {
    fn reset(&mut self, phys: PhysReg, ctx: CacheContext) {
        self.phys = phys.into();
        self.blocks.clear();
        self.union_tags = Self::tags(phys, ctx);
        self.generation = ctx.lis.generation();
    }

    fn tags(phys: PhysReg, ctx: CacheContext) -> SmallVec<[u32; 2]> {
        ctx.view
            .isa
            .reg_info()
            .units(phys)
            .map(|u| ctx.matrix.union(u).tag())
            .collect()
    }

    fn is_valid(&self, ctx: CacheContext) -> bool {
        match self.phys.expand() {
            Some(phys) => {
                self.generation == ctx.lis.generation() && self.union_tags == Self::tags(phys, ctx)
            }
            None => false,
        }
    }

    fn compute(phys: PhysReg, block: Block, ctx: CacheContext) -> BlockInterference {
        let indexes = ctx.lis.indexes();
        let (start, end) = indexes.block_range(block);
        let mut bi = BlockInterference::default();
        for unit in ctx.view.isa.reg_info().units(phys) {
            for (s, e, _) in ctx.matrix.union(unit).overlapping(start, end) {
                bi.add(s.max(start), e.min(end));
            }
            let fixed = ctx.lis.reg_unit(unit, ctx.view);
            for seg in fixed.segments.iter().filter(|s| s.start < end && s.end > start) {
                bi.add(seg.start.max(start), seg.end.min(end));
            }
        }
        let info = ctx.view.isa.reg_info();
        for (slot, mask) in ctx.lis.reg_masks_in(start, end) {
            let clobbered = ctx.view.isa.call_clobbers(ctx.view.func, mask);
            if clobbered.iter().any(|r| info.regs_overlap(r, phys)) {
                bi.add(slot, slot.next_slot());
            }
        }
        bi
    }
}

/// A reference to a cache entry. Must be given back with `InterferenceCache::release`.
#[derive(Debug)]
pub struct CacheCursor {
    entry: usize,
    phys: PhysReg,
}

impl CacheCursor {
    /// The physical register this cursor describes.
    pub fn phys(&self) -> PhysReg {
        self.phys
    }
}

/// A bounded pool of per block interference summaries.
pub struct InterferenceCache {
    entries: Vec<Entry>,
    round_robin: usize,
    by_phys: SecondaryMap<PhysReg, PackedOption<CacheIndex>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct CacheIndex(u32);
crate::entity::entity_impl!(CacheIndex);

impl Default for InterferenceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InterferenceCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: vec![Entry::default(); CACHE_ENTRIES],
            round_robin: 0,
            by_phys: SecondaryMap::new(),
        }
    }

    /// Drop all entries. No cursor may be outstanding.
    pub fn clear(&mut self) {
        debug_assert!(self.entries.iter().all(|e| e.refs == 0), "cursor still held");
        for e in &mut self.entries {
            *e = Entry::default();
        }
        self.by_phys.clear();
        self.round_robin = 0;
    }

    /// Get a cursor for `phys`, reusing or recycling an entry.
    ///
    /// Panics if every entry is referenced.
    pub fn cursor(&mut self, phys: PhysReg, ctx: CacheContext) -> CacheCursor {
        use crate::entity::EntityRef;
        if let Some(ci) = self.by_phys[phys].expand() {
            let e = &mut self.entries[ci.index()];
            if e.phys.expand() == Some(phys) {
                if !e.is_valid(ctx) {
                    trace!("Interference cache: refreshing {phys}");
                    e.reset(phys, ctx);
                }
                e.refs += 1;
                return CacheCursor {
                    entry: ci.index(),
                    phys,
                };
            }
        }

        for _ in 0..CACHE_ENTRIES {
            let i = self.round_robin;
            self.round_robin = (self.round_robin + 1) % CACHE_ENTRIES;
            if self.entries[i].refs != 0 {
                continue;
            }
            if let Some(old) = self.entries[i].phys.expand() {
                self.by_phys[old] = None.into();
            }
            self.entries[i].reset(phys, ctx);
            self.entries[i].refs = 1;
            self.by_phys[phys] = CacheIndex::new(i).into();
            return CacheCursor { entry: i, phys };
        }
        panic!("all interference cache entries are in use");
    }

    /// Give back a cursor.
    pub fn release(&mut self, cursor: CacheCursor) {
        let e = &mut self.entries[cursor.entry];
        debug_assert!(e.refs > 0);
        e.refs -= 1;
    }

    /// The interference of the cursor's register in `block`.
    pub fn block(
        &mut self,
        cursor: &CacheCursor,
        block: Block,
        ctx: CacheContext,
    ) -> BlockInterference {
        let e = &mut self.entries[cursor.entry];
        debug_assert_eq!(e.phys.expand(), Some(cursor.phys));
        if !e.is_valid(ctx) {
            e.reset(cursor.phys, ctx);
        }
        if let Some(bi) = e.blocks[block] {
            return bi;
        }
        let bi = Entry::compute(cursor.phys, block, ctx);
        e.blocks[block] = Some(bi);
        bi
    }

    /// Does the cursor's register interfere anywhere in `block`?
    pub fn has_interference(
        &mut self,
        cursor: &CacheCursor,
        block: Block,
        ctx: CacheContext,
    ) -> bool {
        self.block(cursor, block, ctx).first.is_some()
    }

    /// Number of outstanding references, for testing.
    pub fn refs(&self, phys: PhysReg) -> u32 {
        use crate::entity::EntityRef;
        self.by_phys[phys]
            .expand()
            .map_or(0, |ci| self.entries[ci.index()].refs)
    }
}
