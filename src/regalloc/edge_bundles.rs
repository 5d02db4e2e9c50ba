//! Edge bundles.
//!
//! Every block has an ingoing and an outgoing bundle node. An edge `a -> b` ties the outgoing
//! node of `a` to the ingoing node of `b`, and the connected components are the bundles. All
//! CFG edges in a bundle must agree on whether a split register lives in a register or on the
//! stack, so bundles are the nodes of the spill placement graph.

use crate::entity::EntityRef;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use crate::trace;
use smallvec::SmallVec;

/// The bundle numbering of a function.
#[derive(Default)]
pub struct EdgeBundles {
    // Bundle number of node `2 * block + out`.
    nodes: Vec<u32>,
    blocks: Vec<SmallVec<[Block; 4]>>,
}

impl EdgeBundles {
    /// Create an empty numbering.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the numbering.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.blocks.clear();
    }

    /// Number the bundles of `func`.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.clear();
        let num_nodes = 2 * func.blocks.len();
        let mut parent: Vec<u32> = (0..num_nodes as u32).collect();
        for block in func.layout.blocks() {
            let out = 2 * block.index() + 1;
            for succ in cfg.succ_iter(block) {
                union(&mut parent, out, 2 * succ.index());
            }
        }

        // Compress to dense bundle numbers.
        let mut number = vec![u32::MAX; num_nodes];
        self.nodes = vec![0; num_nodes];
        let mut next = 0;
        for node in 0..num_nodes {
            let root = find(&mut parent, node) as usize;
            if number[root] == u32::MAX {
                number[root] = next;
                next += 1;
            }
            self.nodes[node] = number[root];
        }

        self.blocks = vec![SmallVec::new(); next as usize];
        for block in func.layout.blocks() {
            let b0 = self.bundle(block, false);
            let b1 = self.bundle(block, true);
            self.blocks[b0].push(block);
            if b1 != b0 {
                self.blocks[b1].push(block);
            }
        }
        trace!("{} edge bundles for {} blocks", next, func.blocks.len());
    }

    /// The bundle of the ingoing (`out == false`) or outgoing edges of `block`.
    pub fn bundle(&self, block: Block, out: bool) -> usize {
        self.nodes[2 * block.index() + usize::from(out)] as usize
    }

    /// The number of bundles.
    pub fn num_bundles(&self) -> usize {
        self.blocks.len()
    }

    /// The blocks connected to `bundle`.
    pub fn blocks(&self, bundle: usize) -> &[Block] {
        &self.blocks[bundle]
    }
}

fn find(parent: &mut [u32], mut x: usize) -> u32 {
    while parent[x] as usize != x {
        let up = parent[parent[x] as usize];
        parent[x] = up;
        x = up as usize;
    }
    x as u32
}

fn union(parent: &mut [u32], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parent[hi as usize] = lo;
    }
}
