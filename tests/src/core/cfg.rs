//! CFG partition, edge soundness, and throw-edge placement.

use dexloom_core::{
    build_cfg, BranchTarget, CatchEntry, EdgeKind, Instruction, ItemId, MethodItem, MethodStream,
    Op, Payload, TargetKind, TryBoundary, TryKind, TypeRef,
};
use petgraph::visit::EdgeRef;

/// if-eqz over a const, a switch with two cases, a guarded division and a
/// typed handler chained to a catch-all.
fn busy_stream() -> MethodStream {
    let mut s = MethodStream::new(3, 0);
    let iff = s.push_insn(Instruction::new(Op::IfEqz).with_srcs(vec![0]));
    s.push_insn(Instruction::new(Op::Const4).with_dest(1).with_literal(1));
    let sw = s.push_insn(
        Instruction::new(Op::PackedSwitch)
            .with_srcs(vec![0])
            .with_payload(Payload::Switch { keys: vec![1, 2] }),
    );
    let join = s.push_insn(Instruction::new(Op::Nop));
    s.insert_before_item(
        join,
        MethodItem::Target(BranchTarget {
            src: iff,
            kind: TargetKind::Simple,
        }),
    );
    s.insert_before_item(
        join,
        MethodItem::Target(BranchTarget {
            src: sw,
            kind: TargetKind::Case(0),
        }),
    );
    let div = s.push_insn(
        Instruction::new(Op::DivInt).with_dest(0).with_srcs(vec![0, 1]),
    );
    let marker = s.prev(div).expect("marker");
    s.insert_before_item(
        marker,
        MethodItem::Target(BranchTarget {
            src: sw,
            kind: TargetKind::Case(1),
        }),
    );
    let ret = s.push_insn(Instruction::new(Op::Return).with_srcs(vec![0]));

    let handler = s.push_insn(Instruction::new(Op::Const4).with_dest(0).with_literal(0));
    s.push_insn(Instruction::new(Op::Return).with_srcs(vec![0]));
    let catch_all = s.insert_before_item(
        handler,
        MethodItem::Catch(CatchEntry {
            ty: None,
            next: None,
        }),
    );
    let catch = s.insert_before_item(
        catch_all,
        MethodItem::Catch(CatchEntry {
            ty: Some(TypeRef(9)),
            next: Some(catch_all),
        }),
    );

    // Guard the division only.
    let case1_label = s.prev(marker).expect("case 1 label");
    s.insert_after_item(
        case1_label,
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
    let _ = ret;
    s.check_invariants().expect("fixture invariants");
    s
}

#[test]
fn blocks_partition_the_stream_exactly() {
    let s = busy_stream();
    let cfg = build_cfg(&s, true).expect("cfg");
    let mut covered: Vec<ItemId> = Vec::new();
    for n in cfg.blocks() {
        let b = *cfg.block(n);
        covered.extend(s.range(b.first, b.last));
    }
    let all: Vec<ItemId> = s.iter().collect();
    assert_eq!(covered, all);
}

#[test]
fn fallthrough_edges_respect_stream_order() {
    let s = busy_stream();
    let cfg = build_cfg(&s, true).expect("cfg");
    for e in cfg.graph.edge_references() {
        if *e.weight() != EdgeKind::Fallthrough {
            continue;
        }
        let pred_last = cfg.block(e.source()).last;
        let succ_first = cfg.block(e.target()).first;
        assert_eq!(
            s.next(pred_last),
            Some(succ_first),
            "fallthrough successor must be textually adjacent"
        );
    }
}

#[test]
fn branch_edges_land_on_their_labels() {
    let s = busy_stream();
    let cfg = build_cfg(&s, true).expect("cfg");
    for e in cfg.graph.edge_references() {
        if *e.weight() != EdgeKind::Branch {
            continue;
        }
        let first = cfg.block(e.target()).first;
        let src_ok = matches!(
            s.item(first),
            MethodItem::Target(t) if {
                let term = cfg
                    .block_insns(&s, e.source())
                    .last()
                    .map(|(id, _)| id)
                    .expect("branch block has a terminator");
                t.src == term
            }
        );
        assert!(src_ok, "branch target block must start at the branch's label");
    }
}

#[test]
fn switch_cases_carry_their_indices() {
    let s = busy_stream();
    let cfg = build_cfg(&s, true).expect("cfg");
    let mut case_indices: Vec<u32> = cfg
        .graph
        .edge_references()
        .filter_map(|e| match e.weight() {
            EdgeKind::SwitchCase(i) => Some(*i),
            _ => None,
        })
        .collect();
    case_indices.sort_unstable();
    assert_eq!(case_indices, vec![0, 1]);
}

#[test]
fn throw_edges_leave_before_the_throwing_instruction() {
    let s = busy_stream();
    let cfg = build_cfg(&s, true).expect("cfg");
    let throw_sources: Vec<_> = cfg
        .graph
        .edge_references()
        .filter(|e| *e.weight() == EdgeKind::Throw)
        .map(|e| e.source())
        .collect();
    assert_eq!(throw_sources.len(), 2, "one throw edge per catch in the chain");
    for src in throw_sources {
        let last = cfg.block(src).last;
        assert!(
            matches!(s.item(last), MethodItem::ThrowPoint { .. }),
            "with splitting on, the throwing block ends at the marker"
        );
    }
}

#[test]
fn without_splitting_the_throwing_instruction_stays_in_its_block() {
    let s = busy_stream();
    let cfg = build_cfg(&s, false).expect("cfg");
    for e in cfg.graph.edge_references() {
        if *e.weight() != EdgeKind::Throw {
            continue;
        }
        let throws = cfg
            .block_insns(&s, e.source())
            .any(|(_, i)| i.op().may_throw());
        assert!(throws, "throw edge must leave the block holding the thrower");
    }
}

#[test]
fn catch_chain_edges_follow_next_links() {
    let s = busy_stream();
    let cfg = build_cfg(&s, true).expect("cfg");
    let chain_edges = cfg
        .graph
        .edge_references()
        .filter(|e| *e.weight() == EdgeKind::CatchChain)
        .count();
    assert_eq!(chain_edges, 1, "typed handler links to the catch-all");
}

#[test]
fn entry_is_the_first_block_and_unique() {
    let s = busy_stream();
    let cfg = build_cfg(&s, true).expect("cfg");
    let first_item = s.head().expect("head");
    assert_eq!(cfg.block_of(first_item), Some(cfg.entry));
}
