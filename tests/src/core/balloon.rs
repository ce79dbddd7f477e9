//! Round-trip properties of decode and re-encode.

use crate::helpers::assemble;
use dexloom_core::{
    balloon, sync, BranchTarget, CatchEntry, DebugStep, Instruction, MethodItem, MethodStream,
    Op, SourcePosition, StringRef, TargetKind, TryBoundary, TryKind, TypeRef,
};

/// A body exercising a branch, a guarded region with a typed handler, a
/// source position and an opaque debug step.
fn busy_body() -> dexloom_core::CodeBody {
    assemble(2, 0, |s| {
        let div = s.push_insn(
            Instruction::new(Op::DivInt).with_dest(0).with_srcs(vec![0, 1]),
        );
        let marker = s.prev(div).expect("throw marker");
        let goto = s.push_insn(Instruction::new(Op::Goto));
        let handler = s.push_insn(Instruction::new(Op::Const4).with_dest(0).with_literal(0));
        let ret = s.push_insn(Instruction::new(Op::Return).with_srcs(vec![0]));
        s.insert_before_item(
            ret,
            MethodItem::Target(BranchTarget {
                src: goto,
                kind: TargetKind::Simple,
            }),
        );

        let catch = s.insert_before_item(
            handler,
            MethodItem::Catch(CatchEntry {
                ty: Some(TypeRef(7)),
                next: None,
            }),
        );
        s.insert_before_item(
            marker,
            MethodItem::TryBound(TryBoundary {
                kind: TryKind::Start,
                catch_start: catch,
            }),
        );
        s.insert_after_item(
            div,
            MethodItem::TryBound(TryBoundary {
                kind: TryKind::End,
                catch_start: catch,
            }),
        );

        let first = s.head().expect("head");
        s.insert_before_item(
            first,
            MethodItem::Pos(SourcePosition {
                file: Some(StringRef(1)),
                line: 42,
            }),
        );
        s.insert_before_item(first, MethodItem::Debug(DebugStep::PrologueEnd));
    })
}

#[test]
fn round_trip_is_stable_up_to_renumbering() {
    let body = busy_body();
    let reference = balloon(&body).expect("first decode");

    let mut editable = balloon(&body).expect("second decode");
    let re_encoded = sync(&mut editable).expect("re-encode");
    let round_tripped = balloon(&re_encoded).expect("decode of re-encode");

    assert_eq!(
        reference.to_string(),
        round_tripped.to_string(),
        "decode(encode(decode(B))) must render identically to decode(B)"
    );
}

#[test]
fn sync_is_idempotent_byte_for_byte() {
    let body = busy_body();
    let mut first_stream = balloon(&body).expect("decode");
    let first = sync(&mut first_stream).expect("first encode");
    let mut second_stream = balloon(&first).expect("decode again");
    let second = sync(&mut second_stream).expect("second encode");
    assert_eq!(first, second);
}

#[test]
fn decoded_stream_holds_all_invariants() {
    let stream = balloon(&busy_body()).expect("decode");
    stream.check_invariants().expect("invariants");
}

#[test]
fn debug_program_round_trips_positions_and_steps() {
    let body = busy_body();
    let positions = body
        .debug
        .iter()
        .filter(|e| matches!(e, dexloom_core::DebugEvent::Position(_)))
        .count();
    let steps = body
        .debug
        .iter()
        .filter(|e| matches!(e, dexloom_core::DebugEvent::Step(_)))
        .count();
    assert_eq!(positions, 1);
    assert_eq!(steps, 1);

    let stream = balloon(&body).expect("decode");
    let pos_items = stream
        .iter()
        .filter(|&id| matches!(stream.item(id), MethodItem::Pos(_)))
        .count();
    let dbg_items = stream
        .iter()
        .filter(|&id| matches!(stream.item(id), MethodItem::Debug(_)))
        .count();
    assert_eq!(pos_items, 1);
    assert_eq!(dbg_items, 1);
}

#[test]
fn empty_method_stream_survives_the_trip() {
    let mut s = MethodStream::new(0, 0);
    let body = sync(&mut s).expect("encode empty");
    assert!(body.insns.is_empty());
    let back = balloon(&body).expect("decode empty");
    assert!(back.is_empty());
}
