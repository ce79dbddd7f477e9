//! The full builder-removal scenario: allocation, two stores, build(),
//! two loads (one of a never-written field), arithmetic on the results.

use crate::helpers::assemble;
use dexloom_core::{
    balloon, FieldRef, Instruction, MethodRef, Op, PoolRef, TypeRef,
};
use dexloom_transforms::remove_builders::{BuilderInfo, RemoveBuilders};
use dexloom_transforms::MethodPass;

#[test]
fn builder_disappears_and_values_flow_through_registers() {
    let f1 = FieldRef(1);
    let f2 = FieldRef(2);
    let builder = BuilderInfo {
        class: TypeRef(1),
        ctor: MethodRef(1),
        build: MethodRef(2),
        build_body: assemble(1, 1, |s| {
            s.push_insn(Instruction::new(Op::ReturnObject).with_srcs(vec![0]));
        }),
        fields: vec![f1, f2],
    };

    // new-instance; <init>; iput f1; build(); iget f1; iget f2; add; return
    let mut body = assemble(6, 0, |s| {
        s.push_insn(
            Instruction::new(Op::NewInstance)
                .with_dest(0)
                .with_reference(PoolRef::Type(TypeRef(1))),
        );
        s.push_insn(
            Instruction::new(Op::InvokeDirect)
                .with_srcs(vec![0])
                .with_reference(PoolRef::Method(MethodRef(1))),
        );
        s.push_insn(Instruction::new(Op::Const4).with_dest(1).with_literal(7));
        s.push_insn(
            Instruction::new(Op::Iput)
                .with_srcs(vec![1, 0])
                .with_reference(PoolRef::Field(f1)),
        );
        s.push_insn(
            Instruction::new(Op::InvokeVirtual)
                .with_srcs(vec![0])
                .with_reference(PoolRef::Method(MethodRef(2))),
        );
        s.push_insn(Instruction::new(Op::MoveResultObject).with_dest(2));
        s.push_insn(
            Instruction::new(Op::Iget)
                .with_dest(3)
                .with_srcs(vec![2])
                .with_reference(PoolRef::Field(f1)),
        );
        s.push_insn(
            Instruction::new(Op::Iget)
                .with_dest(4)
                .with_srcs(vec![2])
                .with_reference(PoolRef::Field(f2)),
        );
        s.push_insn(
            Instruction::new(Op::AddInt)
                .with_dest(5)
                .with_srcs(vec![3, 4]),
        );
        s.push_insn(Instruction::new(Op::Return).with_srcs(vec![5]));
    });

    let pass = RemoveBuilders::new(builder);
    assert!(pass.apply(&mut body).expect("pass"), "method changed");

    assert_eq!(
        body.registers_size, 7,
        "one register added for the null constant"
    );

    let stream = balloon(&body).expect("decode result");
    let ops: Vec<Op> = stream.insns().map(|(_, i)| i.op()).collect();
    assert!(!ops.contains(&Op::NewInstance));
    assert!(!ops.contains(&Op::Iput));
    assert!(!ops.contains(&Op::Iget));
    assert!(!ops.iter().any(|o| o.is_invoke()));

    // The null constant sits at method entry, in the freed slot v6.
    let (_, first) = stream.insns().next().expect("first instruction");
    assert_eq!(first.op(), Op::Const4);
    assert_eq!(first.dest(), 6);
    assert_eq!(first.literal(), 0);

    // The add now reads the stored value's register and the null register.
    let add = stream
        .insns()
        .find(|(_, i)| i.op() == Op::AddInt)
        .map(|(_, i)| i.clone())
        .expect("add");
    assert_eq!(add.src(0), 1, "f1 use feeds from the iput source");
    assert_eq!(add.src(1), 6, "undefined f2 reads the null constant");

    let ret = stream
        .insns()
        .find(|(_, i)| i.op() == Op::Return)
        .map(|(_, i)| i.clone())
        .expect("return");
    assert_eq!(ret.src(0), 5, "unrelated registers untouched");
}

#[test]
fn conflicting_field_locations_abort_the_rewrite() {
    let f1 = FieldRef(1);
    let builder = BuilderInfo {
        class: TypeRef(1),
        ctor: MethodRef(1),
        build: MethodRef(2),
        build_body: assemble(1, 1, |s| {
            s.push_insn(Instruction::new(Op::ReturnObject).with_srcs(vec![0]));
        }),
        fields: vec![f1],
    };

    // The value register is clobbered between the store and the load's use:
    // OVERWRITTEN state, so the rewrite must refuse.
    let mut body = assemble(6, 0, |s| {
        s.push_insn(Instruction::new(Op::Const4).with_dest(1).with_literal(7));
        s.push_insn(
            Instruction::new(Op::Iput)
                .with_srcs(vec![1, 0])
                .with_reference(PoolRef::Field(f1)),
        );
        s.push_insn(
            Instruction::new(Op::InvokeVirtual)
                .with_srcs(vec![0])
                .with_reference(PoolRef::Method(MethodRef(2))),
        );
        s.push_insn(Instruction::new(Op::MoveResultObject).with_dest(2));
        s.push_insn(Instruction::new(Op::Const4).with_dest(1).with_literal(9));
        s.push_insn(
            Instruction::new(Op::Iget)
                .with_dest(3)
                .with_srcs(vec![2])
                .with_reference(PoolRef::Field(f1)),
        );
        s.push_insn(Instruction::new(Op::Return).with_srcs(vec![3]));
    });

    let pass = RemoveBuilders::new(builder);
    assert!(
        !pass.apply(&mut body).expect("pass runs"),
        "rewrite refuses when no unique register holds the value"
    );
}
