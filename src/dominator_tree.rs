//! A Dominator Tree represented as mappings of Blocks to their immediate dominator.
//!
//! The tree is computed with the iterative algorithm of Cooper, Harvey and Kennedy over the
//! reverse post-order of the CFG. A preorder numbering of the finished tree then answers
//! dominance queries between blocks in constant time.

use crate::entity::packed_option::PackedOption;
use crate::entity::SecondaryMap;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use crate::timing::{self, Pass};
use core::cmp::Ordering;
use smallvec::SmallVec;

/// RPO numbers are not first assigned in a contiguous way but as multiples of STRIDE, to leave
/// room for modifications of the dominator tree.
const STRIDE: u32 = 4;

/// Special RPO numbers used during `compute_postorder`.
const SEEN: u32 = 1;

/// Dominator tree node. We keep one of these per block.
#[derive(Clone, Default)]
struct DomNode {
    /// Number of this node in a reverse post-order traversal of the CFG, starting from 1.
    /// This number is monotonic in the reverse postorder but not contiguous, since we leave
    /// holes for later localized modifications of the dominator tree.
    /// Unreachable nodes get number 0, all others are positive.
    rpo_number: u32,

    /// The immediate dominator of this block.
    ///
    /// This is `None` for unreachable blocks and the entry block which doesn't have an immediate
    /// dominator.
    idom: PackedOption<Block>,

    /// Preorder number in the dominator tree, starting from 1. 0 for unreachable blocks.
    pre_number: u32,

    /// Largest preorder number in the dominator subtree rooted at this block.
    pre_max: u32,

    /// Blocks immediately dominated by this one, in reverse post-order.
    children: SmallVec<[Block; 2]>,
}

/// The dominator tree for a single function.
pub struct DominatorTree {
    nodes: SecondaryMap<Block, DomNode>,

    /// CFG post-order of all reachable blocks.
    postorder: Vec<Block>,

    /// Scratch memory used by `compute_postorder()`.
    stack: Vec<(Block, usize)>,
}

/// Methods for querying the dominator tree.
impl DominatorTree {
    /// Is `block` reachable from the entry block?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.nodes[block].rpo_number != 0
    }

    /// Iterate over the reachable blocks in reverse post-order.
    pub fn rpo(&self) -> impl DoubleEndedIterator<Item = Block> + '_ {
        self.postorder.iter().rev().copied()
    }

    /// Returns the immediate dominator of `block`.
    ///
    /// The entry block and unreachable blocks have no immediate dominator.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.nodes[block].idom.expand()
    }

    /// The blocks immediately dominated by `block`.
    pub fn children(&self, block: Block) -> &[Block] {
        &self.nodes[block].children
    }

    // Compare two blocks relative to the reverse post-order.
    fn rpo_cmp_block(&self, a: Block, b: Block) -> Ordering {
        self.nodes[a].rpo_number.cmp(&self.nodes[b].rpo_number)
    }

    /// Returns `true` if `a` dominates `b`.
    ///
    /// A block is considered to dominate itself. Unreachable blocks are dominated only by
    /// themselves.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        if a == b {
            return true;
        }
        let na = &self.nodes[a];
        let nb = &self.nodes[b];
        na.pre_number != 0 && nb.pre_number != 0 && na.pre_number <= nb.pre_number
            && nb.pre_number <= na.pre_max
    }

    /// Find the nearest block dominating both `a` and `b`.
    ///
    /// Both blocks must be reachable.
    pub fn common_dominator(&self, mut a: Block, mut b: Block) -> Block {
        debug_assert!(self.is_reachable(a) && self.is_reachable(b));
        loop {
            match self.rpo_cmp_block(a, b) {
                Ordering::Less => {
                    // `a` comes before `b` in the RPO. Move `b` up.
                    match self.idom(b) {
                        Some(idom) => b = idom,
                        None => return b,
                    }
                }
                Ordering::Greater => match self.idom(a) {
                    Some(idom) => a = idom,
                    None => return a,
                },
                Ordering::Equal => break,
            }
        }
        debug_assert_eq!(a, b, "Unreachable block passed to common_dominator?");
        a
    }
}

impl DominatorTree {
    /// Allocate a new blank dominator tree. Use `compute` to compute the dominator tree for a
    /// function.
    pub fn new() -> Self {
        Self {
            nodes: SecondaryMap::new(),
            postorder: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Allocate and compute a dominator tree.
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut domtree = Self::new();
        domtree.compute(func, cfg);
        domtree
    }

    /// Reset and compute a CFG post-order and dominator tree.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        let _tt = timing::start(Pass::Domtree);
        debug_assert!(cfg.is_valid());
        self.clear();
        self.compute_postorder(func, cfg);
        self.compute_domtree(cfg);
        self.compute_preorder();
    }

    /// Clear the data structures used to represent the dominator tree.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.postorder.clear();
        debug_assert!(self.stack.is_empty());
    }

    // Compute a CFG post-order of all reachable blocks.
    fn compute_postorder(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        let entry = match func.layout.entry_block() {
            Some(entry) => entry,
            None => return,
        };
        self.nodes[entry].rpo_number = SEEN;
        self.stack.push((entry, 0));
        while let Some(&mut (block, ref mut next)) = self.stack.last_mut() {
            let succ = cfg.succ_iter(block).nth(*next);
            *next += 1;
            match succ {
                Some(succ) => {
                    if self.nodes[succ].rpo_number == 0 {
                        self.nodes[succ].rpo_number = SEEN;
                        self.stack.push((succ, 0));
                    }
                }
                None => {
                    self.stack.pop();
                    self.postorder.push(block);
                }
            }
        }
    }

    // Build a dominator tree from a control flow graph using Keith D. Cooper's
    // "Simple, Fast Dominator Algorithm."
    fn compute_domtree(&mut self, cfg: &ControlFlowGraph) {
        let (entry, rest) = match self.postorder.split_last() {
            Some((&entry, rest)) => (entry, rest),
            None => return,
        };

        // Assign RPO numbers.
        self.nodes[entry].rpo_number = 2 * STRIDE;
        for (rpo_idx, &block) in rest.iter().rev().enumerate() {
            self.nodes[block].rpo_number = (rpo_idx as u32 + 3) * STRIDE;
        }

        // Iterate until convergence. The entry block points to itself while iterating so the
        // intersection walk stops there.
        self.nodes[entry].idom = entry.into();
        let mut changed = true;
        while changed {
            changed = false;
            for i in (0..rest.len()).rev() {
                let block = self.postorder[i];
                let idom = self.compute_idom(block, cfg);
                if self.nodes[block].idom != idom.into() {
                    self.nodes[block].idom = idom.into();
                    changed = true;
                }
            }
        }
        self.nodes[entry].idom = None.into();

        for i in (0..rest.len()).rev() {
            let block = self.postorder[i];
            if let Some(idom) = self.nodes[block].idom.expand() {
                self.nodes[idom].children.push(block);
            }
        }
    }

    // Compute the immediate dominator for `block` using the current `idom` states of the
    // reachable nodes.
    fn compute_idom(&self, block: Block, cfg: &ControlFlowGraph) -> Block {
        // Get an iterator with just the reachable, already visited predecessors to `block`.
        let mut reachable_preds = cfg
            .pred_iter(block)
            .filter(|pred| self.nodes[pred.block].idom.is_some())
            .map(|pred| pred.block);

        // The RPO must visit at least one predecessor before this node.
        let mut idom = match reachable_preds.next() {
            Some(b) => b,
            None => panic!("{block} has no processed predecessor"),
        };

        for pred in reachable_preds {
            idom = self.intersect(idom, pred);
        }
        idom
    }

    fn intersect(&self, mut a: Block, mut b: Block) -> Block {
        while a != b {
            while self.nodes[a].rpo_number > self.nodes[b].rpo_number {
                a = self.nodes[a].idom.expand().unwrap_or(a);
            }
            while self.nodes[b].rpo_number > self.nodes[a].rpo_number {
                b = self.nodes[b].idom.expand().unwrap_or(b);
            }
        }
        a
    }

    // Number the dominator tree in preorder so `dominates` is a range check.
    fn compute_preorder(&mut self) {
        let entry = match self.postorder.last() {
            Some(&entry) => entry,
            None => return,
        };
        let mut n = 0;
        let mut stack: Vec<(Block, bool)> = vec![(entry, false)];
        while let Some((block, done)) = stack.pop() {
            if done {
                self.nodes[block].pre_max = n;
                continue;
            }
            n += 1;
            self.nodes[block].pre_number = n;
            stack.push((block, true));
            for &child in self.nodes[block].children.iter().rev() {
                stack.push((child, false));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstData, Reg, RegClass};
    use crate::entity::EntityRef;

    fn diamond() -> (Function, [Block; 4]) {
        let mut func = Function::with_name("diamond");
        let c = func.new_vreg(RegClass::new(0));
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        let b3 = func.append_block();
        func.append_inst(b0, InstData::iconst(c, 0));
        func.append_inst(b0, InstData::brif(Reg::Virt(c), b1, b2));
        func.append_inst(b1, InstData::jump(b3));
        func.append_inst(b2, InstData::jump(b3));
        func.append_inst(b3, InstData::ret([]));
        (func, [b0, b1, b2, b3])
    }

    #[test]
    fn empty() {
        let func = Function::with_name("f");
        let cfg = ControlFlowGraph::with_function(&func);
        let dtree = DominatorTree::with_function(&func, &cfg);
        assert_eq!(dtree.rpo().next(), None);
    }

    #[test]
    fn diamond_idoms() {
        let (func, [b0, b1, b2, b3]) = diamond();
        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);

        assert_eq!(dt.idom(b0), None);
        assert_eq!(dt.idom(b1), Some(b0));
        assert_eq!(dt.idom(b2), Some(b0));
        assert_eq!(dt.idom(b3), Some(b0));
        assert!(dt.dominates(b0, b3));
        assert!(!dt.dominates(b1, b3));
        assert!(dt.dominates(b2, b2));
        assert_eq!(dt.common_dominator(b1, b2), b0);
        assert_eq!(dt.common_dominator(b3, b0), b0);
        assert_eq!(dt.children(b0).len(), 3);
        assert_eq!(dt.rpo().next(), Some(b0));
    }

    #[test]
    fn loop_and_unreachable() {
        let mut func = Function::with_name("loop");
        let c = func.new_vreg(RegClass::new(0));
        let b0 = func.append_block();
        let b1 = func.append_block();
        let b2 = func.append_block();
        let dead = func.append_block();
        func.append_inst(b0, InstData::iconst(c, 0));
        func.append_inst(b0, InstData::jump(b1));
        func.append_inst(b1, InstData::brif(Reg::Virt(c), b1, b2));
        func.append_inst(b2, InstData::ret([]));
        func.append_inst(dead, InstData::jump(b2));

        let cfg = ControlFlowGraph::with_function(&func);
        let dt = DominatorTree::with_function(&func, &cfg);
        assert_eq!(dt.idom(b1), Some(b0));
        assert_eq!(dt.idom(b2), Some(b1));
        assert!(dt.dominates(b1, b2));
        assert!(!dt.is_reachable(dead));
        assert!(!dt.dominates(b0, dead));
        assert_eq!(dt.rpo().count(), 3);
        assert_eq!(dead, Block::new(3));
    }
}
