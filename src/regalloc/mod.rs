//! Register allocation.
//!
//! This module contains data structures and algorithms used for register allocation. The
//! allocator works on a function in virtual register form and assigns each virtual register a
//! physical register or a stack slot.
//!
//! The pieces, from the bottom up:
//!
//! - `slot_indexes` numbers program points.
//! - `live_range` and `live_interval` describe liveness as value numbered segment lists, and
//!   `live_range_calc`/`live_interval_calc` compute them with SSA reconstruction.
//! - `live_intervals` owns the intervals of a function, and `live_stacks` those of spill slots.
//! - `interval_union`, `reg_matrix` and `interference_cache` track what is assigned where.
//! - `spiller`, `split_kit` and `live_range_edit` change live ranges.
//! - `alloc_base` holds the queue loop shared by `greedy`, the default allocator, and `basic`.
//! - `virt_reg_map` rewrites the result into the function.

pub mod alloc_base;
pub mod allocation_order;
pub mod basic;
pub mod context;
pub mod edge_bundles;
pub mod env;
pub mod eviction_advisor;
pub mod greedy;
pub mod interference_cache;
pub mod interval_union;
pub mod live_interval;
pub mod live_interval_calc;
pub mod live_intervals;
pub mod live_range;
pub mod live_range_calc;
pub mod live_range_edit;
pub mod live_stacks;
pub mod reg_matrix;
pub mod slot_indexes;
pub mod spill_placement;
pub mod spill_weights;
pub mod spiller;
pub mod split_kit;
pub mod virt_reg_map;

pub use self::context::Context;
pub use self::env::RegAllocEnv;
pub use self::live_interval::{LiveInterval, SubRange};
pub use self::live_range::{LiveQueryResult, LiveRange, Segment, VNInfo, ValNo};
pub use self::slot_indexes::{Slot, SlotIndex, SlotIndexes};
