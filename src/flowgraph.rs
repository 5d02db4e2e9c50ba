//! A control flow graph represented as mappings of basic blocks to their predecessors
//! and successors.
//!
//! Successors are represented as basic blocks while predecessors are represented by basic
//! blocks along with the branch instruction that transfers control.
//!
//! ```c
//!     block0:
//!         ...
//!         brif v1, block1, block2
//! ```
//!
//! Here `block1` and `block2` would each have a single predecessor denoted as
//! `(block0, brif v1, block1, block2)`.

use crate::entity::SecondaryMap;
use crate::ir::{Block, Function, Inst};
use crate::timing::{self, Pass};
use smallvec::SmallVec;

/// A basic block denoted by its enclosing block and last instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPredecessor {
    /// Enclosing block key.
    pub block: Block,
    /// Last instruction in the basic block.
    pub inst: Inst,
}

impl BlockPredecessor {
    /// Convenient method to construct new BlockPredecessor.
    pub fn new(block: Block, inst: Inst) -> Self {
        Self { block, inst }
    }
}

/// A container for the successors and predecessors of some Block.
#[derive(Clone, Default)]
struct CFGNode {
    /// Instructions that can branch or jump to this block, with the block containing them.
    predecessors: SmallVec<[BlockPredecessor; 2]>,
    /// Set of blocks that are the targets of branches and jumps in this block, in operand order
    /// without duplicates.
    successors: SmallVec<[Block; 2]>,
}

/// The Control Flow Graph maintains a mapping of blocks to their predecessors
/// and successors where predecessors are basic blocks and successors are
/// basic blocks.
pub struct ControlFlowGraph {
    data: SecondaryMap<Block, CFGNode>,
    valid: bool,
}

impl ControlFlowGraph {
    /// Allocate a new blank control flow graph.
    pub fn new() -> Self {
        Self {
            data: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Clear all data structures in this control flow graph.
    pub fn clear(&mut self) {
        self.data.clear();
        self.valid = false;
    }

    /// Allocate and compute the control flow graph for `func`.
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    /// Compute the control flow graph of `func`.
    ///
    /// This will clear and overwrite any information already stored in this data structure.
    pub fn compute(&mut self, func: &Function) {
        let _tt = timing::start(Pass::Flowgraph);
        self.clear();
        self.data.resize(func.blocks.len());

        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                for dest in func[inst].branch_destinations() {
                    self.add_edge(block, inst, dest);
                }
            }
        }

        self.valid = true;
    }

    fn add_edge(&mut self, from: Block, from_inst: Inst, to: Block) {
        let succs = &mut self.data[from].successors;
        if !succs.contains(&to) {
            succs.push(to);
        }
        let preds = &mut self.data[to].predecessors;
        if !preds.iter().any(|p| p.block == from) {
            preds.push(BlockPredecessor::new(from, from_inst));
        }
    }

    /// Get an iterator over the CFG predecessors to `block`.
    pub fn pred_iter(&self, block: Block) -> impl ExactSizeIterator<Item = BlockPredecessor> + '_ {
        self.data[block].predecessors.iter().copied()
    }

    /// Get an iterator over the CFG successors to `block`.
    pub fn succ_iter(&self, block: Block) -> impl ExactSizeIterator<Item = Block> + '_ {
        debug_assert!(self.is_valid());
        self.data[block].successors.iter().copied()
    }

    /// Number of predecessors of `block`.
    pub fn num_preds(&self, block: Block) -> usize {
        self.data[block].predecessors.len()
    }

    /// Number of successors of `block`.
    pub fn num_succs(&self, block: Block) -> usize {
        self.data[block].successors.len()
    }

    /// Check if the CFG is in a valid state.
    ///
    /// Note that this doesn't perform any kind of validity checks. It simply checks if the
    /// `compute()` method has been called since the last `clear()`. It does not check that the
    /// CFG is consistent with the function.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}
