//! End-to-end editing scenarios: mid-body insertion, try preservation under
//! deletion, and switch case removal.

use crate::helpers::assemble;
use dexloom_core::{
    balloon, editor, Instruction, MethodItem, MethodRef, Op, Payload, PoolRef, TargetKind,
    TypeRef,
};

#[test]
fn insert_before_the_return() {
    // const/4 v0, #1; return v0  ->  v0 = 1 + 2 on the way out.
    let mut body = assemble(1, 0, |s| {
        s.push_insn(Instruction::new(Op::Const4).with_dest(0).with_literal(1));
        s.push_insn(Instruction::new(Op::Return).with_srcs(vec![0]));
    });

    editor::edit(&mut body, |stream| {
        // Room for the second constant.
        assert!(dexloom_core::enlarge_regs(stream, 2));
        let (const_id, _) = stream
            .insns()
            .find(|(_, i)| i.op() == Op::Const4)
            .expect("const");
        stream.insert_after(
            Some(const_id),
            vec![
                Instruction::new(Op::Const4).with_dest(1).with_literal(2),
                Instruction::new(Op::AddInt)
                    .with_dest(0)
                    .with_srcs(vec![0, 1]),
            ],
        )
    })
    .expect("edit");

    let stream = balloon(&body).expect("decode");
    let ops: Vec<Op> = stream.insns().map(|(_, i)| i.op()).collect();
    assert_eq!(ops, vec![Op::Const4, Op::Const4, Op::AddInt, Op::Return]);
    let add = stream
        .insns()
        .find(|(_, i)| i.op() == Op::AddInt)
        .map(|(_, i)| i.clone())
        .expect("add");
    assert_eq!(add.dest(), 0);
    assert_eq!(add.srcs(), &[0, 1]);
    assert_eq!(body.registers_size, 2);
}

#[test]
fn deleting_inside_a_try_preserves_coverage_and_handlers() {
    // try { nop; invoke } catch (type@5) { return-void }
    let mut body = assemble(1, 0, |s| {
        let nop = s.push_insn(Instruction::new(Op::Nop));
        let inv = s.push_insn(
            Instruction::new(Op::InvokeStatic)
                .with_srcs(vec![0])
                .with_reference(PoolRef::Method(MethodRef(4))),
        );
        s.push_insn(Instruction::new(Op::ReturnVoid));
        let handler = s.push_insn(Instruction::new(Op::ReturnVoid));
        let catch = s.insert_before_item(
            handler,
            MethodItem::Catch(dexloom_core::CatchEntry {
                ty: Some(TypeRef(5)),
                next: None,
            }),
        );
        s.insert_before_item(
            nop,
            MethodItem::TryBound(dexloom_core::TryBoundary {
                kind: dexloom_core::TryKind::Start,
                catch_start: catch,
            }),
        );
        s.insert_after_item(
            inv,
            MethodItem::TryBound(dexloom_core::TryBoundary {
                kind: dexloom_core::TryKind::End,
                catch_start: catch,
            }),
        );
    });
    assert_eq!(body.tries.len(), 1);
    let handler_types_before: Vec<TypeRef> =
        body.tries[0].handlers.iter().map(|&(t, _)| t).collect();

    editor::edit(&mut body, |stream| {
        let (nop_id, _) = stream
            .insns()
            .find(|(_, i)| i.op() == Op::Nop)
            .expect("nop");
        stream.remove_opcode(nop_id)
    })
    .expect("edit");

    assert_eq!(body.tries.len(), 1);
    let entry = &body.tries[0];
    assert_eq!(entry.start_addr, 0, "region still starts at the invoke");
    assert_eq!(
        entry.insn_count, 3,
        "region covers exactly the surviving invoke"
    );
    let handler_types: Vec<TypeRef> = entry.handlers.iter().map(|&(t, _)| t).collect();
    assert_eq!(handler_types, handler_types_before, "handler chain unchanged");

    // The surviving covered instruction set is exactly the invoke.
    let stream = balloon(&body).expect("decode");
    let covered: Vec<Op> = stream
        .insns()
        .filter(|(id, _)| {
            let addr = stream.addr(*id);
            addr >= entry.start_addr && addr < entry.start_addr + entry.insn_count as u32
        })
        .map(|(_, i)| i.op())
        .collect();
    assert_eq!(covered, vec![Op::InvokeStatic]);
}

#[test]
fn removing_a_switch_case_drops_key_and_label() {
    // packed-switch {1, 2, 3} over three single-const cases.
    let mut body = assemble(2, 0, |s| {
        let sw = s.push_insn(
            Instruction::new(Op::PackedSwitch)
                .with_srcs(vec![0])
                .with_payload(Payload::Switch {
                    keys: vec![1, 2, 3],
                }),
        );
        s.push_insn(Instruction::new(Op::ReturnVoid));
        for case in 0..3u32 {
            let c = s.push_insn(
                Instruction::new(Op::Const4)
                    .with_dest(1)
                    .with_literal(case as i64 + 10),
            );
            s.insert_before_item(
                c,
                MethodItem::Target(dexloom_core::BranchTarget {
                    src: sw,
                    kind: TargetKind::Case(case),
                }),
            );
        }
        s.push_insn(Instruction::new(Op::ReturnVoid));
    });

    editor::edit(&mut body, |stream| {
        let (case2, _) = stream
            .insns()
            .find(|(_, i)| i.op() == Op::Const4 && i.literal() == 11)
            .expect("case-2 instruction");
        stream.remove_switch_case(case2)
    })
    .expect("edit");

    let stream = balloon(&body).expect("decode");
    let (sw_id, sw) = stream
        .insns()
        .find(|(_, i)| i.op().is_switch())
        .expect("switch survives");
    assert_eq!(
        sw.op(),
        Op::SparseSwitch,
        "a key hole turns the packed form sparse"
    );
    match sw.payload() {
        Some(Payload::Switch { keys }) => assert_eq!(keys, &[1, 3]),
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(stream.targets_of(sw_id).len(), 2, "case-2 label is gone");

    // Fall-through default still reaches the first return.
    let after = stream.next(sw_id).expect("successor");
    assert!(matches!(stream.item(after), MethodItem::Insn(i) if i.op() == Op::ReturnVoid));
}
