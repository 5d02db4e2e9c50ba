//! End to end allocation of small functions.

mod common;

use greedy_regalloc::dominator_tree::DominatorTree;
use greedy_regalloc::flowgraph::ControlFlowGraph;
use greedy_regalloc::ir::{Block, Function, InstData, Opcode, Operand, Reg, VirtReg};
use greedy_regalloc::isa::generic::{self, GenericIsa};
use greedy_regalloc::regalloc::live_intervals::{FuncView, LiveIntervals};
use greedy_regalloc::settings::{self, Configurable, Flags};
use greedy_regalloc::{Context, RegAllocStats};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn no_virtual_operands(func: &Function) -> bool {
    func.layout.blocks().all(|block| {
        func.layout.block_insts(block).all(|inst| {
            func[inst]
                .operands
                .iter()
                .all(|op| op.virt_reg().is_none())
        })
    })
}

// Allocate `func`, and check that it computes what it computed before.
fn allocate_with(isa: &GenericIsa, func: &mut Function, flags: Flags) -> (Context, RegAllocStats) {
    let before = common::interpret(func).unwrap();
    let mut ctx = Context::with_flags(flags);
    let stats = ctx.run(isa, func).unwrap();
    assert!(stats.failed.is_empty(), "{stats:?}");
    assert!(no_virtual_operands(func), "{func}");
    let after = common::interpret(func).unwrap_or_else(|e| panic!("{e}\n{func}"));
    assert!(after.agrees_with(&before), "{before:?} != {after:?}\n{func}");
    common::reloads_follow_stores(func).unwrap_or_else(|e| panic!("{e}\n{func}"));
    (ctx, stats)
}

fn allocate(isa: &GenericIsa, func: &mut Function) -> (Context, RegAllocStats) {
    allocate_with(isa, func, Flags::new(settings::builder()))
}

fn basic_flags() -> Flags {
    let mut builder = settings::builder();
    builder.set("regalloc_algorithm", "basic").unwrap();
    Flags::new(builder)
}

fn intervals(isa: &GenericIsa, func: &Function) -> LiveIntervals {
    let cfg = ControlFlowGraph::with_function(func);
    let domtree = DominatorTree::with_function(func, &cfg);
    let mut lis = LiveIntervals::new();
    lis.compute(FuncView {
        func,
        isa,
        cfg: &cfg,
        domtree: &domtree,
    });
    lis
}

#[test]
fn straight_line_fits_one_register() {
    init_logger();
    let isa = generic::builder().gprs(1).finish();
    let mut func = Function::with_name("straight");
    let v1 = func.new_vreg(isa.gpr_class());
    let v2 = func.new_vreg(isa.gpr_class());
    let b0 = func.append_block();
    func.append_inst(b0, InstData::iconst(v1, 3));
    func.append_inst(b0, InstData::alu(v2, v1, v1));
    func.append_inst(b0, InstData::ret([Reg::Virt(v2)]));

    let (ctx, stats) = allocate(&isa, &mut func);
    assert_eq!(ctx.virt_reg_map().phys(v1), Some(isa.gpr(0)));
    assert_eq!(stats.spills, 0);
    assert_eq!(stats.reloads, 0);
}

#[test]
fn one_of_two_values_spills_around_a_call() {
    init_logger();
    // Only the callee-saved register survives the call.
    let isa = generic::builder().gprs(2).callee_saved(1).finish();
    let mut func = Function::with_name("call");
    let p = func.new_vreg(isa.gpr_class());
    let a = func.new_vreg(isa.gpr_class());
    let b = func.new_vreg(isa.gpr_class());
    let c = func.new_vreg(isa.gpr_class());
    let b0 = func.append_block();
    let mask = isa.call_clobber_mask(&mut func);
    func.append_inst(b0, InstData::iconst(p, 9));
    func.append_inst(b0, InstData::alu(a, p, p));
    func.append_inst(b0, InstData::alu_imm(b, a, 2));
    func.append_inst(b0, InstData::new(Opcode::Call, [Operand::RegMask(mask)]));
    func.append_inst(b0, InstData::alu(c, b, a));
    func.append_inst(b0, InstData::ret([Reg::Virt(c)]));

    let (ctx, stats) = allocate(&isa, &mut func);
    let vrm = ctx.virt_reg_map();
    let spilled = [a, b]
        .iter()
        .filter(|&&v| vrm.stack_slot(v).is_some())
        .count();
    assert_eq!(spilled, 1, "{stats:?}");
    assert!(stats.spills + stats.folded_spills >= 1);
}

#[test]
fn pressure_in_a_loop_is_resolved() {
    init_logger();
    let isa = generic::builder().gprs(2).finish();
    let mut func = Function::with_name("loop");
    let regs: Vec<VirtReg> = (0..4).map(|_| func.new_vreg(isa.gpr_class())).collect();
    let (x, y, z, w) = (regs[0], regs[1], regs[2], regs[3]);
    let b0 = func.append_block();
    let b1 = func.append_block();
    let b2 = func.append_block();
    func.append_inst(b0, InstData::iconst(x, 1));
    func.append_inst(b0, InstData::alu(y, x, x));
    func.append_inst(b0, InstData::alu_imm(z, x, 4));
    func.append_inst(b0, InstData::jump(b1));
    func.append_inst(b1, InstData::alu(w, y, z));
    func.append_inst(b1, InstData::alu(y, w, x));
    func.append_inst(b1, InstData::brif(w, b1, b2));
    func.append_inst(b2, InstData::ret([Reg::Virt(y)]));

    allocate(&isa, &mut func);
}

#[test]
fn stricter_split_mode_allocates_too() {
    init_logger();
    let isa = generic::builder().gprs(2).finish();
    let mut func = Function::with_name("speed");
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

    let mut builder = settings::builder();
    builder.set("split_spill_mode", "speed").unwrap();
    allocate_with(&isa, &mut func, Flags::new(builder));
}

#[test]
fn loop_carried_value_has_no_phi() {
    init_logger();
    let isa = generic::builder().gprs(4).finish();
    let mut func = Function::with_name("carried");
    let v = func.new_vreg(isa.gpr_class());
    let w = func.new_vreg(isa.gpr_class());
    let b0 = func.append_block();
    let b1 = func.append_block();
    let b2 = func.append_block();
    func.append_inst(b0, InstData::iconst(v, 1));
    func.append_inst(b0, InstData::jump(b1));
    func.append_inst(b1, InstData::alu(w, v, v));
    func.append_inst(b1, InstData::brif(w, b1, b2));
    func.append_inst(b2, InstData::ret([Reg::Virt(v)]));

    let lis = intervals(&isa, &func);
    let li = lis.interval(v);
    assert_eq!(li.num_valnos(), 1);
    assert!(li.valnos().all(|(_, info)| !info.is_phi_def()));
    let start = lis.indexes().block_start(b1);
    let seg = li.segment_containing(start).unwrap();
    assert!(seg.end >= lis.indexes().block_end(b1));
}

#[test]
fn join_gets_one_phi() {
    init_logger();
    let isa = generic::builder().gprs(4).finish();
    let mut func = Function::with_name("join");
    let c = func.new_vreg(isa.gpr_class());
    let v = func.new_vreg(isa.gpr_class());
    let blocks: Vec<Block> = (0..4).map(|_| func.append_block()).collect();
    func.append_inst(blocks[0], InstData::iconst(c, 0));
    func.append_inst(blocks[0], InstData::brif(c, blocks[1], blocks[2]));
    func.append_inst(blocks[1], InstData::iconst(v, 1));
    func.append_inst(blocks[1], InstData::jump(blocks[3]));
    func.append_inst(blocks[2], InstData::iconst(v, 2));
    func.append_inst(blocks[2], InstData::jump(blocks[3]));
    func.append_inst(blocks[3], InstData::ret([Reg::Virt(v)]));

    let lis = intervals(&isa, &func);
    let li = lis.interval(v);
    let phis: Vec<_> = li.valnos().filter(|(_, info)| info.is_phi_def()).collect();
    assert_eq!(phis.len(), 1);
    assert_eq!(phis[0].1.def, lis.indexes().block_start(blocks[3]));
    assert_eq!(li.num_valnos(), 3);
}

#[test]
fn redefinition_from_itself_keeps_both_values() {
    init_logger();
    let isa = generic::builder().gprs(1).finish();
    let mut func = Function::with_name("redef");
    let v = func.new_vreg(isa.gpr_class());
    let b0 = func.append_block();
    func.append_inst(b0, InstData::iconst(v, 5));
    func.append_inst(b0, InstData::alu_imm(v, v, 1));
    func.append_inst(b0, InstData::ret([Reg::Virt(v)]));

    let lis = intervals(&isa, &func);
    let li = lis.interval(v);
    li.verify().unwrap();
    assert_eq!(li.num_valnos(), 2);
    assert_eq!(li.segments.len(), 2);
    assert_ne!(li.segments[0].valno, li.segments[1].valno);

    allocate(&isa, &mut func);
    assert_eq!(common::interpret(&func).unwrap().returned, Some(vec![14]));
}

// Five values live through a diamond, with three registers. `a`, `b` and `d` cross both arms
// into the join, where `x` meets from two defs.
fn pressured_diamond(isa: &GenericIsa, cond: i64) -> Function {
    let mut func = Function::with_name("diamond");
    let regs: Vec<VirtReg> = (0..9).map(|_| func.new_vreg(isa.gpr_class())).collect();
    let (c, a, b, d, x, y, r, s, t) = (
        regs[0], regs[1], regs[2], regs[3], regs[4], regs[5], regs[6], regs[7], regs[8],
    );
    let blocks: Vec<Block> = (0..4).map(|_| func.append_block()).collect();
    func.append_inst(blocks[0], InstData::iconst(c, cond));
    func.append_inst(blocks[0], InstData::iconst(a, 11));
    func.append_inst(blocks[0], InstData::alu_imm(b, a, 4));
    func.append_inst(blocks[0], InstData::alu(d, a, b));
    func.append_inst(blocks[0], InstData::brif(c, blocks[1], blocks[2]));
    func.append_inst(blocks[1], InstData::alu(x, a, d));
    func.append_inst(blocks[1], InstData::alu_imm(y, b, 3));
    func.append_inst(blocks[1], InstData::alu(x, x, y));
    func.append_inst(blocks[1], InstData::jump(blocks[3]));
    func.append_inst(blocks[2], InstData::alu(x, b, d));
    func.append_inst(blocks[2], InstData::alu_imm(y, a, 7));
    func.append_inst(blocks[2], InstData::alu(x, y, x));
    func.append_inst(blocks[2], InstData::jump(blocks[3]));
    func.append_inst(blocks[3], InstData::alu(r, a, b));
    func.append_inst(blocks[3], InstData::alu(s, r, d));
    func.append_inst(blocks[3], InstData::alu(t, s, x));
    func.append_inst(blocks[3], InstData::ret([Reg::Virt(t)]));
    func
}

#[test]
fn diamond_under_pressure_computes_the_same() {
    init_logger();
    let isa = generic::builder().gprs(3).finish();
    for cond in [0, 1] {
        let mut func = pressured_diamond(&isa, cond);
        let (_, stats) = allocate(&isa, &mut func);
        assert!(stats.spills + stats.folded_spills + stats.remats > 0, "{stats:?}");
    }
}

#[test]
fn diamond_under_pressure_with_basic_allocator() {
    init_logger();
    let isa = generic::builder().gprs(3).finish();
    for cond in [0, 1] {
        let mut func = pressured_diamond(&isa, cond);
        allocate_with(&isa, &mut func, basic_flags());
    }
}

#[test]
fn diamond_under_pressure_in_every_split_mode() {
    init_logger();
    let isa = generic::builder().gprs(3).finish();
    for mode in ["partition", "size", "speed"] {
        for cond in [0, 1] {
            let mut func = pressured_diamond(&isa, cond);
            let mut builder = settings::builder();
            builder.set("split_spill_mode", mode).unwrap();
            allocate_with(&isa, &mut func, Flags::new(builder));
        }
    }
}

#[test]
fn loop_pressure_with_basic_allocator() {
    init_logger();
    let isa = generic::builder().gprs(2).finish();
    let mut func = Function::with_name("loop");
    let regs: Vec<VirtReg> = (0..5).map(|_| func.new_vreg(isa.gpr_class())).collect();
    let (i, x, y, z, w) = (regs[0], regs[1], regs[2], regs[3], regs[4]);
    let b0 = func.append_block();
    let b1 = func.append_block();
    let b2 = func.append_block();
    // `i` goes 4, 3, 0, so the loop body runs twice.
    func.append_inst(b0, InstData::iconst(i, 4));
    func.append_inst(b0, InstData::iconst(x, 2));
    func.append_inst(b0, InstData::alu_imm(y, x, 5));
    func.append_inst(b0, InstData::jump(b1));
    func.append_inst(b1, InstData::alu(z, x, y));
    func.append_inst(b1, InstData::alu(w, z, i));
    func.append_inst(b1, InstData::alu_imm(i, i, 9));
    func.append_inst(b1, InstData::brif(i, b1, b2));
    func.append_inst(b2, InstData::ret([Reg::Virt(w)]));

    let before = common::interpret(&func).unwrap();
    assert_eq!(before.events, [3, 0]);
    allocate_with(&isa, &mut func, basic_flags());
}
