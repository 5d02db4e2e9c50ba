//! Helpers shared by the integration tests: a reference interpreter for the test IR, and a
//! check that spill slots are written before they are read.

#![allow(dead_code)]

use greedy_regalloc::dominator_tree::DominatorTree;
use greedy_regalloc::flowgraph::ControlFlowGraph;
use greedy_regalloc::ir::{Block, Function, Inst, Opcode, Operand, Reg, StackSlot};
use rustc_hash::{FxHashMap, FxHashSet};

// Instructions executed before a run is cut off.
const STEP_LIMIT: usize = 10_000;

/// What a run of a function observed, independent of register names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    /// Branch conditions and call arguments, in execution order.
    pub events: Vec<i64>,
    /// The returned values, or `None` when the step limit was hit first.
    pub returned: Option<Vec<i64>>,
}

impl Trace {
    /// Do two runs agree? Runs that were cut off are compared on their common prefix.
    pub fn agrees_with(&self, other: &Self) -> bool {
        match (&self.returned, &other.returned) {
            (Some(_), Some(_)) => self == other,
            _ => {
                let n = self.events.len().min(other.events.len());
                self.events[..n] == other.events[..n]
            }
        }
    }
}

/// The ALU operation. It doesn't commute, so swapped operands change the result.
pub fn alu(a: i64, b: i64) -> i64 {
    a.wrapping_mul(3).wrapping_sub(b)
}

struct Machine<'a> {
    func: &'a Function,
    regs: FxHashMap<Reg, i64>,
    slots: FxHashMap<StackSlot, i64>,
    memory: FxHashMap<i64, i64>,
    events: Vec<i64>,
    calls: i64,
}

impl<'a> Machine<'a> {
    fn read(&self, inst: Inst, op: &Operand) -> Result<i64, String> {
        match *op {
            Operand::Reg { reg, .. } => match self.regs.get(&reg) {
                Some(&v) => Ok(v),
                None if op.is_undef() => Ok(0),
                None => Err(format!("{inst} reads {reg} before it is written")),
            },
            Operand::Imm(imm) => Ok(imm),
            Operand::FrameIndex(ss) => self
                .slots
                .get(&ss)
                .copied()
                .ok_or_else(|| format!("{inst} reads {ss} before it is stored")),
            ref op => Err(format!("{inst} has no value in {op:?}")),
        }
    }

    fn write(&mut self, inst: Inst, op: &Operand, value: i64) -> Result<(), String> {
        match *op {
            Operand::Reg { reg, .. } => {
                self.regs.insert(reg, value);
                Ok(())
            }
            Operand::FrameIndex(ss) => {
                self.slots.insert(ss, value);
                Ok(())
            }
            ref op => Err(format!("{inst} can't write {op:?}")),
        }
    }

    fn operand(&self, inst: Inst, n: usize) -> Result<&'a Operand, String> {
        let func: &'a Function = self.func;
        func[inst]
            .operands
            .get(n)
            .ok_or_else(|| format!("{inst} has no operand {n}"))
    }

    // Execute `inst`. Returns the next block for branches, and the values for returns.
    fn step(&mut self, inst: Inst) -> Result<Flow, String> {
        let func = self.func;
        let data = &func[inst];
        if data.operands.iter().any(|op| op.subreg() != 0) {
            return Err(format!("{inst}: sub-register operands are not interpreted"));
        }
        match data.opcode {
            Opcode::Nop | Opcode::Kill => {}
            Opcode::ImplicitDef => self.write(inst, self.operand(inst, 0)?, 0)?,
            Opcode::Iconst | Opcode::Copy | Opcode::Reload => {
                let v = self.read(inst, self.operand(inst, 1)?)?;
                self.write(inst, self.operand(inst, 0)?, v)?;
            }
            Opcode::Spill => {
                let v = self.read(inst, self.operand(inst, 0)?)?;
                self.write(inst, self.operand(inst, 1)?, v)?;
            }
            Opcode::Alu => {
                let a = self.read(inst, self.operand(inst, 1)?)?;
                let b = self.read(inst, self.operand(inst, 2)?)?;
                self.write(inst, self.operand(inst, 0)?, alu(a, b))?;
            }
            Opcode::Load => {
                let addr = self.read(inst, self.operand(inst, 1)?)?;
                let v = self.memory.get(&addr).copied().unwrap_or(0);
                self.write(inst, self.operand(inst, 0)?, v)?;
            }
            Opcode::Store => {
                let v = self.read(inst, self.operand(inst, 0)?)?;
                let addr = self.read(inst, self.operand(inst, 1)?)?;
                self.memory.insert(addr, v);
            }
            Opcode::Call => {
                self.calls += 1;
                for op in data.operands.iter().filter(|op| op.is_use()) {
                    let v = self.read(inst, op)?;
                    self.events.push(v);
                }
                if let Some(Operand::RegMask(mask)) = data.operands.first() {
                    let mask = &func.reg_masks[*mask];
                    self.regs
                        .retain(|reg, _| !matches!(*reg, Reg::Phys(p) if mask.clobbers(p)));
                }
                let base = self.calls * 1000;
                for (n, op) in data.operands.iter().filter(|op| op.is_def()).enumerate() {
                    self.write(inst, op, base + n as i64)?;
                }
            }
            Opcode::Jump => {
                let dest = data.branch_destinations().next();
                return dest.map(Flow::Goto).ok_or_else(|| format!("{inst} has no target"));
            }
            Opcode::Brif => {
                let cond = self.read(inst, self.operand(inst, 0)?)?;
                self.events.push(cond);
                let mut dests = data.branch_destinations();
                let (then_dest, else_dest) = (dests.next(), dests.next());
                let dest = if cond != 0 { then_dest } else { else_dest };
                return dest.map(Flow::Goto).ok_or_else(|| format!("{inst} lacks a target"));
            }
            Opcode::Return => {
                let values = data
                    .operands
                    .iter()
                    .filter(|op| op.is_use())
                    .map(|op| self.read(inst, op))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Flow::Return(values));
            }
        }
        Ok(Flow::Next)
    }
}

enum Flow {
    Next,
    Goto(Block),
    Return(Vec<i64>),
}

/// Run `func` from its entry block.
///
/// The function works the same before and after allocation: virtual and physical registers
/// are both just names for values. Reading a register or stack slot that holds nothing is an
/// error, and so is reading a caller-saved register across a call.
pub fn interpret(func: &Function) -> Result<Trace, String> {
    let mut m = Machine {
        func,
        regs: FxHashMap::default(),
        slots: FxHashMap::default(),
        memory: FxHashMap::default(),
        events: Vec::new(),
        calls: 0,
    };
    let mut block = func.layout.entry_block().ok_or("no entry block")?;
    let mut steps = 0;
    loop {
        let mut next = None;
        for inst in func.layout.block_insts(block) {
            steps += 1;
            if steps > STEP_LIMIT {
                return Ok(Trace {
                    events: m.events,
                    returned: None,
                });
            }
            match m.step(inst)? {
                Flow::Next => {}
                Flow::Goto(dest) => {
                    next = Some(dest);
                    break;
                }
                Flow::Return(values) => {
                    return Ok(Trace {
                        events: m.events,
                        returned: Some(values),
                    })
                }
            }
        }
        block = next.ok_or_else(|| format!("{block} falls off its end"))?;
    }
}

/// Check that on every path from the entry, each stack slot read comes after a store to the
/// slot.
pub fn reloads_follow_stores(func: &Function) -> Result<(), String> {
    let cfg = ControlFlowGraph::with_function(func);
    let domtree = DominatorTree::with_function(func, &cfg);
    let rpo: Vec<Block> = domtree.rpo().collect();
    let entry = match rpo.first() {
        Some(&entry) => entry,
        None => return Ok(()),
    };

    // Slots stored on every path to the end of each block. Absent blocks are not reached yet.
    let mut stored_out: FxHashMap<Block, FxHashSet<StackSlot>> = FxHashMap::default();
    let stored_in = |block: Block, out: &FxHashMap<Block, FxHashSet<StackSlot>>| {
        if block == entry {
            return FxHashSet::default();
        }
        let mut sets = cfg.pred_iter(block).filter_map(|p| out.get(&p.block));
        let mut stored = sets.next().cloned().unwrap_or_default();
        for set in sets {
            stored.retain(|ss| set.contains(ss));
        }
        stored
    };
    let mut changed = true;
    while changed {
        changed = false;
        for &block in &rpo {
            let mut stored = stored_in(block, &stored_out);
            let _ = transfer(func, block, &mut stored, false);
            if stored_out.get(&block) != Some(&stored) {
                stored_out.insert(block, stored);
                changed = true;
            }
        }
    }
    for &block in &rpo {
        let mut stored = stored_in(block, &stored_out);
        transfer(func, block, &mut stored, true)?;
    }
    Ok(())
}

fn transfer(
    func: &Function,
    block: Block,
    stored: &mut FxHashSet<StackSlot>,
    check: bool,
) -> Result<(), String> {
    for inst in func.layout.block_insts(block) {
        let data = &func[inst];
        for op in data.operands.iter() {
            if let Operand::FrameIndex(ss) = *op {
                if data.opcode == Opcode::Spill {
                    stored.insert(ss);
                } else if check && !stored.contains(&ss) {
                    return Err(format!("{inst} in {block} may read {ss} before any store"));
                }
            }
        }
    }
    Ok(())
}
