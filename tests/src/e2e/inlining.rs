//! Tail-call inlining end to end.

use crate::helpers::assemble;
use dexloom_core::{
    balloon, editor, inline_tail_call, Instruction, MethodRef, Op, PoolRef,
};

#[test]
fn tail_called_callee_replaces_the_invoke() {
    // callee(a, b) = a + b: regs 3, ins 2.
    let callee = assemble(3, 2, |s| {
        s.push_insn(Instruction::new(Op::AddInt).with_dest(0).with_srcs(vec![1, 2]));
        s.push_insn(Instruction::new(Op::Return).with_srcs(vec![0]));
    });

    // caller: return callee(v0, v1).
    let mut caller = assemble(2, 0, |s| {
        s.push_insn(
            Instruction::new(Op::InvokeStatic)
                .with_srcs(vec![0, 1])
                .with_reference(PoolRef::Method(MethodRef(3))),
        );
        s.push_insn(Instruction::new(Op::MoveResult).with_dest(0));
        s.push_insn(Instruction::new(Op::Return).with_srcs(vec![0]));
    });

    editor::edit(&mut caller, |stream| {
        let (invoke, _) = stream
            .insns()
            .find(|(_, i)| i.op().is_invoke())
            .expect("invoke");
        inline_tail_call(stream, &callee, invoke)
    })
    .expect("inline");

    let stream = balloon(&caller).expect("decode");
    let ops: Vec<Op> = stream.insns().map(|(_, i)| i.op()).collect();
    assert_eq!(ops, vec![Op::AddInt, Op::Return], "no invoke remains");
    assert_eq!(caller.registers_size, 2, "register width preserved");
    assert_eq!(caller.outs_size, 0, "no call sites left");

    let add = stream
        .insns()
        .find(|(_, i)| i.op() == Op::AddInt)
        .map(|(_, i)| i.clone())
        .expect("add");
    assert_eq!(add.srcs(), &[0, 1], "parameters landed on the arguments");
}

#[test]
fn callee_with_more_temps_widens_the_caller() {
    // callee(a): two temps before the parameter; regs 3, ins 1.
    let callee = assemble(3, 1, |s| {
        s.push_insn(Instruction::new(Op::Const4).with_dest(0).with_literal(1));
        s.push_insn(Instruction::new(Op::Const4).with_dest(1).with_literal(2));
        s.push_insn(Instruction::new(Op::AddInt).with_dest(0).with_srcs(vec![0, 1]));
        s.push_insn(Instruction::new(Op::Return).with_srcs(vec![0]));
    });

    // caller: regs 2, ins 1 (one temp, one parameter).
    let mut caller = assemble(2, 1, |s| {
        s.push_insn(
            Instruction::new(Op::InvokeStatic)
                .with_srcs(vec![1])
                .with_reference(PoolRef::Method(MethodRef(3))),
        );
        s.push_insn(Instruction::new(Op::MoveResult).with_dest(0));
        s.push_insn(Instruction::new(Op::Return).with_srcs(vec![0]));
    });

    editor::edit(&mut caller, |stream| {
        let (invoke, _) = stream
            .insns()
            .find(|(_, i)| i.op().is_invoke())
            .expect("invoke");
        inline_tail_call(stream, &callee, invoke)
    })
    .expect("inline");

    assert_eq!(
        caller.registers_size, 3,
        "two callee temps + one caller parameter"
    );
    let stream = balloon(&caller).expect("decode");
    let ops: Vec<Op> = stream.insns().map(|(_, i)| i.op()).collect();
    assert_eq!(
        ops,
        vec![Op::Const4, Op::Const4, Op::AddInt, Op::Return],
        "callee body in place of the call"
    );
}
