//! A loop analysis represented as mappings of loops to their header Block
//! and parent in the loop tree.

use crate::dominator_tree::DominatorTree;
use crate::entity::entity_impl;
use crate::entity::packed_option::PackedOption;
use crate::entity::{Keys, PrimaryMap, SecondaryMap};
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use crate::timing::{self, Pass};
use smallvec::SmallVec;

/// A opaque reference to a code loop.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Loop(u32);
entity_impl!(Loop, "loop");

/// Loop tree information for a single function.
///
/// Loops are referenced by the Loop object, and for each loop you can access its header block,
/// its eventual parent in the loop tree and all the block belonging to the loop.
pub struct LoopAnalysis {
    loops: PrimaryMap<Loop, LoopData>,
    block_loop_map: SecondaryMap<Block, PackedOption<Loop>>,
}

struct LoopData {
    header: Block,
    parent: PackedOption<Loop>,
    depth: u32,
}

impl LoopData {
    /// Creates a `LoopData` object with the loop header and its eventual parent in the loop tree.
    fn new(header: Block, parent: Option<Loop>) -> Self {
        Self {
            header,
            parent: parent.into(),
            depth: 0,
        }
    }
}

/// Methods for querying the loop analysis.
impl LoopAnalysis {
    /// Allocate a new blank loop analysis struct. Use `compute` to compute the loop analysis for
    /// a function.
    pub fn new() -> Self {
        Self {
            loops: PrimaryMap::new(),
            block_loop_map: SecondaryMap::new(),
        }
    }

    // All the loops of the function.
    fn loops(&self) -> Keys<Loop> {
        self.loops.keys()
    }

    /// Returns the header block of a particular loop.
    ///
    /// The characteristic property of a loop header block is that it dominates some of its
    /// predecessors.
    pub fn loop_header(&self, lp: Loop) -> Block {
        self.loops[lp].header
    }

    // The eventual parent of a loop in the loop tree.
    fn loop_parent(&self, lp: Loop) -> Option<Loop> {
        self.loops[lp].parent.expand()
    }

    /// Return the innermost loop for a given block.
    pub fn innermost_loop(&self, block: Block) -> Option<Loop> {
        self.block_loop_map[block].expand()
    }

    /// Determine if a Block is a loop header. If so, return the loop.
    pub fn is_loop_header(&self, block: Block) -> Option<Loop> {
        self.innermost_loop(block)
            .filter(|&lp| self.loop_header(lp) == block)
    }

    // Is `block` in `lp`, directly or through a nested loop?
    fn is_in_loop(&self, block: Block, lp: Loop) -> bool {
        match self.block_loop_map[block].expand() {
            None => false,
            Some(block_loop) => self.is_child_loop(block_loop, lp),
        }
    }

    // Is `child` nested in `parent`, or equal to it?
    fn is_child_loop(&self, child: Loop, parent: Loop) -> bool {
        let mut finger = Some(child);
        while let Some(finger_loop) = finger {
            if finger_loop == parent {
                return true;
            }
            finger = self.loop_parent(finger_loop);
        }
        false
    }

    /// Returns the loop nesting depth of a block. Blocks outside all loops have depth 0.
    pub fn loop_depth(&self, block: Block) -> u32 {
        self.innermost_loop(block)
            .map_or(0, |lp| self.loops[lp].depth)
    }

    /// Is the edge `from -> to` leaving at least one loop? Returns the number of loops exited.
    pub fn loops_exited(&self, from: Block, to: Block) -> u32 {
        let mut exited = 0;
        let mut finger = self.innermost_loop(from);
        while let Some(lp) = finger {
            if self.is_in_loop(to, lp) {
                break;
            }
            exited += 1;
            finger = self.loop_parent(lp);
        }
        exited
    }
}

impl LoopAnalysis {
    /// Detects the loops in a function. Needs the control flow graph and the dominator tree.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        let _tt = timing::start(Pass::LoopAnalysis);
        self.loops.clear();
        self.block_loop_map.clear();
        self.block_loop_map.resize(func.blocks.len());
        self.find_loop_headers(cfg, domtree);
        self.discover_loop_blocks(cfg, domtree);
        self.assign_loop_depths();
    }

    /// Clear all the data structures contained in the loop analysis. This will leave the
    /// analysis in a similar state to a context returned by `new()` except that allocated
    /// memory be retained.
    pub fn clear(&mut self) {
        self.loops.clear();
        self.block_loop_map.clear();
    }

    // A block is a loop header if it dominates any of its predecessors.
    fn is_block_loop_header(block: Block, cfg: &ControlFlowGraph, domtree: &DominatorTree) -> bool {
        cfg.pred_iter(block)
            .any(|pred| domtree.is_reachable(pred.block) && domtree.dominates(block, pred.block))
    }

    // Traverses the CFG in reverse postorder and create a loop object for every block having a
    // back edge.
    fn find_loop_headers(&mut self, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        for block in domtree
            .rpo()
            .filter(|&block| Self::is_block_loop_header(block, cfg, domtree))
        {
            let lp = self.loops.push(LoopData::new(block, None));
            self.block_loop_map[block] = lp.into();
        }
    }

    // Intended to be called after `find_loop_headers`. For each detected loop header,
    // discovers all the block belonging to the loop and its inner loops. After a call to this
    // function, the loop tree is fully constructed.
    fn discover_loop_blocks(&mut self, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        let mut stack: Vec<Block> = Vec::new();
        // We handle each loop header in reverse order, corresponding to a pseudo postorder
        // traversal of the graph.
        for lp in self.loops().rev() {
            let header = self.loops[lp].header;
            // Follow the back edges.
            stack.extend(
                cfg.pred_iter(header)
                    .filter(|pred| {
                        domtree.is_reachable(pred.block) && domtree.dominates(header, pred.block)
                    })
                    .map(|pred| pred.block),
            );
            while let Some(node) = stack.pop() {
                let continue_dfs = match self.block_loop_map[node].expand() {
                    None => {
                        // The node hasn't been visited yet, we tag it as part of the loop
                        self.block_loop_map[node] = lp.into();
                        Some(node)
                    }
                    Some(mut node_loop) => {
                        // The node is part of a loop, which can be lp or an inner loop. Walk up
                        // to the outermost loop that isn't lp.
                        let mut parent = self.loops[node_loop].parent;
                        while let Some(p) = parent.expand() {
                            if p == lp {
                                break;
                            }
                            node_loop = p;
                            parent = self.loops[node_loop].parent;
                        }
                        match parent.expand() {
                            Some(_) => None,
                            None if node_loop != lp => {
                                // A new inner loop of lp.
                                self.loops[node_loop].parent = lp.into();
                                Some(self.loops[node_loop].header)
                            }
                            None => None,
                        }
                    }
                };
                if let Some(continue_dfs) = continue_dfs {
                    stack.extend(
                        cfg.pred_iter(continue_dfs)
                            .filter(|pred| domtree.is_reachable(pred.block))
                            .map(|pred| pred.block),
                    );
                }
            }
        }
    }

    fn assign_loop_depths(&mut self) {
        let mut stack: SmallVec<[Loop; 8]> = SmallVec::new();
        for lp in self.loops.keys() {
            if self.loops[lp].depth != 0 {
                continue;
            }
            stack.push(lp);
            while let Some(&lp) = stack.last() {
                match self.loops[lp].parent.expand() {
                    Some(parent) if self.loops[parent].depth == 0 => stack.push(parent),
                    Some(parent) => {
                        self.loops[lp].depth = self.loops[parent].depth + 1;
                        stack.pop();
                    }
                    None => {
                        self.loops[lp].depth = 1;
                        stack.pop();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstData, Reg, RegClass};

    #[test]
    fn nested_loops_detection() {
        let mut func = Function::with_name("nested");
        let c = func.new_vreg(RegClass::from_u32(0));
        let block0 = func.append_block();
        let block1 = func.append_block();
        let block2 = func.append_block();
        let block3 = func.append_block();
        let block4 = func.append_block();

        func.append_inst(block0, InstData::iconst(c, 0));
        func.append_inst(block0, InstData::jump(block1));
        func.append_inst(block1, InstData::jump(block2));
        func.append_inst(block2, InstData::brif(Reg::Virt(c), block2, block3));
        func.append_inst(block3, InstData::brif(Reg::Virt(c), block1, block4));
        func.append_inst(block4, InstData::ret([]));

        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let mut loop_analysis = LoopAnalysis::new();
        loop_analysis.compute(&func, &cfg, &domtree);

        let loops = loop_analysis.loops().collect::<Vec<Loop>>();
        assert_eq!(loops.len(), 2);
        assert_eq!(loop_analysis.loop_header(loops[0]), block1);
        assert_eq!(loop_analysis.loop_header(loops[1]), block2);
        assert_eq!(loop_analysis.loop_parent(loops[1]), Some(loops[0]));
        assert_eq!(loop_analysis.loop_parent(loops[0]), None);
        assert!(loop_analysis.is_in_loop(block1, loops[0]));
        assert!(!loop_analysis.is_in_loop(block1, loops[1]));
        assert!(loop_analysis.is_in_loop(block2, loops[1]));
        assert!(loop_analysis.is_in_loop(block2, loops[0]));
        assert!(loop_analysis.is_in_loop(block3, loops[0]));
        assert!(!loop_analysis.is_in_loop(block0, loops[0]));
        assert!(!loop_analysis.is_in_loop(block4, loops[0]));
        assert_eq!(loop_analysis.loop_depth(block0), 0);
        assert_eq!(loop_analysis.loop_depth(block1), 1);
        assert_eq!(loop_analysis.loop_depth(block2), 2);
        assert_eq!(loop_analysis.loop_depth(block3), 1);
        assert_eq!(loop_analysis.loops_exited(block3, block4), 1);
        assert_eq!(loop_analysis.loops_exited(block2, block3), 1);
        assert_eq!(loop_analysis.loops_exited(block2, block2), 0);
    }
}
