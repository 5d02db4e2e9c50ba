//! Result and error types representing the outcome of allocating registers for a function.

use crate::ir::{RegClass, VirtReg};
use crate::verifier::VerifierErrors;
use thiserror::Error;

/// A register allocation error.
///
/// Running out of registers is not an error: the allocator degrades to an arbitrary assignment
/// and records the failure in its statistics. These errors describe input the allocator can't
/// work with at all.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegAllocError {
    /// A list of IR verifier errors.
    ///
    /// This always represents a bug, either in the code that generated the input function, or a
    /// bug in the allocator itself.
    #[error("Verifier errors")]
    Verifier(#[from] VerifierErrors),

    /// The input function is malformed in a way the verifier doesn't describe.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A virtual register belongs to a class without any allocatable register.
    #[error("{vreg} uses register class {class} which has no allocatable registers")]
    Unallocatable {
        /// The virtual register that can't be allocated.
        vreg: VirtReg,
        /// Its register class.
        class: RegClass,
    },
}

/// A convenient alias for a `Result` that uses `RegAllocError` as the error type.
pub type RegAllocResult<T> = Result<T, RegAllocError>;
