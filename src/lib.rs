//! Greedy register allocation.
//!
//! This crate assigns the virtual registers of a function to physical registers or stack slots.
//! It is built from the classic pieces of a live-interval allocator: a program point index, value
//! numbered live intervals computed with SSA reconstruction, a per register unit interference
//! matrix, an inline spiller with rematerialization and spill hoisting, a live range splitter and
//! the greedy driver tying them together.
//!
//! The entry point is [`Context::run`].
#![warn(missing_docs)]
#![warn(unused_import_braces)]

pub use crate::regalloc::context::Context;
pub use crate::regalloc::greedy::RegAllocStats;
pub use crate::result::{RegAllocError, RegAllocResult};
pub use crate::verifier::verify_function;

pub use cranelift_entity as entity;

pub mod block_frequency;
pub mod cursor;
pub mod dominator_tree;
pub mod flowgraph;
pub mod ir;
pub mod isa;
pub mod loop_analysis;
pub mod regalloc;
pub mod settings;
pub mod timing;
pub mod verifier;

mod result;

pub use crate::timing::PassTimes;

/// Even when trace logging is disabled, the trace macro has a significant performance cost so we
/// disable it by default.
#[macro_export]
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(any(feature = "trace-log", debug_assertions)) {
            ::log::trace!($($tt)*);
        }
    };
}

/// Dynamic check for whether trace logging is enabled.
#[macro_export]
macro_rules! trace_log_enabled {
    () => {
        cfg!(any(feature = "trace-log", debug_assertions))
            && ::log::log_enabled!(::log::Level::Trace)
    };
}
