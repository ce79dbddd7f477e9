//! Re-encoding a method stream into a packed body.
//!
//! Synchronization is a fixpoint: addresses determine branch displacements,
//! and displacements that overflow a short branch form force the branch to
//! widen, which moves every later address. Widening is monotone (goto ->
//! goto/16 -> goto/32, never back), so the loop is bounded by the number of
//! branches. Conditional branches have no wider form; an overflowing one is
//! a synchronization failure naming the offending branch.

use crate::balloon::{FILL_ARRAY_IDENT, PACKED_SWITCH_IDENT, SPARSE_SWITCH_IDENT};
use crate::body::{CodeBody, DebugEvent, TryItem};
use crate::catalog::Op;
use crate::insn::Payload;
use crate::result::{Error, Result};
use crate::stream::{ItemId, MethodItem, MethodStream, TargetKind, TryKind};
use std::collections::HashMap;
use tracing::debug;

/// Packed switches whose key set has lost contiguity (case removal) are
/// emitted in sparse form; the opcode flips in place, same width.
fn normalize_switches(stream: &mut MethodStream) {
    let packed: Vec<ItemId> = stream
        .insns()
        .filter(|(_, i)| i.op() == Op::PackedSwitch)
        .map(|(id, _)| id)
        .collect();
    for id in packed {
        let contiguous = match stream.insn(id).and_then(|i| i.payload()) {
            Some(Payload::Switch { keys }) => keys.windows(2).all(|w| w[1] == w[0] + 1),
            _ => true,
        };
        if !contiguous {
            if let Some(insn) = stream.insn_mut(id) {
                insn.set_op(Op::SparseSwitch);
            }
            debug!("switch keys no longer contiguous; flipped to sparse form");
        }
    }
}

fn assign_addresses(stream: &mut MethodStream) -> u32 {
    let ids: Vec<ItemId> = stream.iter().collect();
    let mut addr = 0u32;
    for id in ids {
        let width = match stream.item(id) {
            MethodItem::Insn(i) => i.units(),
            _ => 0,
        };
        stream.set_addr(id, addr);
        addr += width;
    }
    addr
}

/// Target items of each branch source, ordered by case index.
fn targets_by_src(stream: &MethodStream) -> HashMap<ItemId, Vec<ItemId>> {
    let mut map: HashMap<ItemId, Vec<(u32, ItemId)>> = HashMap::new();
    for id in stream.iter() {
        if let MethodItem::Target(t) = stream.item(id) {
            let idx = match t.kind {
                TargetKind::Simple => 0,
                TargetKind::Case(i) => i,
            };
            map.entry(t.src).or_default().push((idx, id));
        }
    }
    map.into_iter()
        .map(|(src, mut v)| {
            v.sort_by_key(|&(idx, _)| idx);
            (src, v.into_iter().map(|(_, id)| id).collect())
        })
        .collect()
}

/// One feasibility pass: widen any short branch whose displacement no longer
/// fits. Returns whether anything changed (addresses must be reassigned).
fn widen_pass(stream: &mut MethodStream, targets: &HashMap<ItemId, Vec<ItemId>>) -> Result<bool> {
    let branches: Vec<(ItemId, Op)> = stream
        .insns()
        .filter(|(_, i)| i.op().branches())
        .map(|(id, i)| (id, i.op()))
        .collect();

    let mut changed = false;
    for (id, op) in branches {
        let target = targets
            .get(&id)
            .and_then(|v| v.first().copied())
            .ok_or_else(|| Error::BrokenStream(format!("{} has no target", op.name())))?;
        let disp = stream.addr(target) as i64 - stream.addr(id) as i64;
        let widened = match op {
            Op::Goto if disp == 0 || !(-128..=127).contains(&disp) => Some(Op::Goto16),
            Op::Goto16 if disp == 0 || !(-32768..=32767).contains(&disp) => Some(Op::Goto32),
            _ if !op.is_goto() && !(-32768..=32767).contains(&disp) => {
                return Err(Error::BranchOutOfRange {
                    addr: stream.addr(id),
                    disp: disp as i32,
                });
            }
            _ => None,
        };
        if let Some(wide) = widened {
            debug!(
                "widening {} at {:#x} to {} (displacement {})",
                op.name(),
                stream.addr(id),
                wide.name(),
                disp
            );
            if let Some(insn) = stream.insn_mut(id) {
                insn.set_op(wide);
            }
            changed = true;
        }
    }
    Ok(changed)
}

fn push_u32(out: &mut Vec<u16>, v: i32) {
    out.push(v as u16);
    out.push(((v as u32) >> 16) as u16);
}

/// Re-encode the stream into a packed body. On return, every item's cached
/// address is current.
pub fn sync(stream: &mut MethodStream) -> Result<CodeBody> {
    stream.check_invariants()?;
    normalize_switches(stream);

    let guard = stream.count_opcodes() + 2;
    let mut rounds = 0usize;
    loop {
        assign_addresses(stream);
        rounds += 1;
        let targets = targets_by_src(stream);
        if !widen_pass(stream, &targets)? {
            break;
        }
        if rounds > guard {
            return Err(Error::BrokenStream(
                "branch widening failed to converge".into(),
            ));
        }
    }
    debug!("addresses stable after {} assignment rounds", rounds);

    let targets = targets_by_src(stream);

    // Emission.
    let mut out: Vec<u16> = Vec::with_capacity(stream.sum_opcode_sizes() as usize);
    struct Patch {
        insn: ItemId,
        offset_pos: usize,
    }
    let mut patches: Vec<Patch> = Vec::new();

    for id in stream.iter().collect::<Vec<_>>() {
        let insn = match stream.item(id) {
            MethodItem::Insn(i) => i,
            _ => continue,
        };
        let addr = stream.addr(id);
        debug_assert_eq!(addr as usize, out.len());
        let op = insn.op();
        let disp = if op.branches() {
            let t = targets[&id][0];
            Some((stream.addr(t) as i64 - addr as i64) as i32)
        } else if op.has_payload() {
            patches.push(Patch {
                insn: id,
                offset_pos: out.len() + 1,
            });
            Some(0)
        } else {
            None
        };
        insn.encode(addr, disp, &mut out)?;
    }

    // Payloads go after the instruction stream, 4-byte aligned, with the
    // owning instruction's offset field patched against final positions.
    for patch in &patches {
        if out.len() % 2 == 1 {
            out.push(0x0000);
        }
        let paddr = out.len() as u32;
        let insn_addr = stream.addr(patch.insn);
        let insn = stream.insn(patch.insn).expect("payload owner");
        match insn.payload() {
            Some(Payload::Switch { keys }) => {
                let case_targets = targets.get(&patch.insn).cloned().unwrap_or_default();
                if case_targets.len() != keys.len() {
                    return Err(Error::BrokenStream(
                        "switch payload and case labels disagree".into(),
                    ));
                }
                let rels: Vec<i32> = case_targets
                    .iter()
                    .map(|&t| (stream.addr(t) as i64 - insn_addr as i64) as i32)
                    .collect();
                if insn.op() == Op::PackedSwitch {
                    out.push(PACKED_SWITCH_IDENT);
                    out.push(keys.len() as u16);
                    push_u32(&mut out, keys.first().copied().unwrap_or(0));
                    for rel in rels {
                        push_u32(&mut out, rel);
                    }
                } else {
                    let mut pairs: Vec<(i32, i32)> =
                        keys.iter().copied().zip(rels).collect();
                    pairs.sort_by_key(|&(k, _)| k);
                    out.push(SPARSE_SWITCH_IDENT);
                    out.push(pairs.len() as u16);
                    for &(k, _) in &pairs {
                        push_u32(&mut out, k);
                    }
                    for &(_, rel) in &pairs {
                        push_u32(&mut out, rel);
                    }
                }
            }
            Some(Payload::FillArray {
                element_width,
                data,
            }) => {
                out.push(FILL_ARRAY_IDENT);
                out.push(*element_width);
                let elements = if *element_width == 0 {
                    0
                } else {
                    data.len() / *element_width as usize
                };
                push_u32(&mut out, elements as i32);
                let mut i = 0;
                while i < data.len() {
                    let lo = data[i] as u16;
                    let hi = if i + 1 < data.len() { data[i + 1] as u16 } else { 0 };
                    out.push(lo | (hi << 8));
                    i += 2;
                }
            }
            None => {
                return Err(Error::BrokenStream(format!(
                    "{} has no payload",
                    insn.op().name()
                )))
            }
        }
        let rel = (paddr as i64 - insn_addr as i64) as i32;
        out[patch.offset_pos] = rel as u16;
        out[patch.offset_pos + 1] = ((rel as u32) >> 16) as u16;
    }

    // Try/handler table, keyed by finalized addresses.
    let mut tries: Vec<TryItem> = Vec::new();
    let mut open: Vec<(u32, ItemId)> = Vec::new();
    for id in stream.iter() {
        let b = match stream.item(id) {
            MethodItem::TryBound(b) => *b,
            _ => continue,
        };
        match b.kind {
            TryKind::Start => open.push((stream.addr(id), b.catch_start)),
            TryKind::End => {
                let (start_addr, catch_start) = open
                    .pop()
                    .ok_or_else(|| Error::BrokenStream("unbalanced try boundaries".into()))?;
                if catch_start != b.catch_start {
                    return Err(Error::BrokenStream("try regions interleave".into()));
                }
                let end_addr = stream.addr(id);
                let count = end_addr - start_addr;
                let insn_count =
                    u16::try_from(count).map_err(|_| Error::TryRangeTooLong(start_addr))?;

                let mut handlers = Vec::new();
                let mut catch_all = None;
                let mut cur = Some(catch_start);
                while let Some(c) = cur {
                    let entry = match stream.item(c) {
                        MethodItem::Catch(e) => *e,
                        _ => {
                            return Err(Error::BrokenStream(
                                "catch chain links to non-catch".into(),
                            ))
                        }
                    };
                    match entry.ty {
                        Some(ty) => handlers.push((ty, stream.addr(c))),
                        None => catch_all = Some(stream.addr(c)),
                    }
                    cur = entry.next;
                }
                tries.push(TryItem {
                    start_addr,
                    insn_count,
                    handlers,
                    catch_all,
                });
            }
        }
    }
    if !open.is_empty() {
        return Err(Error::BrokenStream("unclosed try region".into()));
    }
    tries.sort_by_key(|t| t.start_addr);

    // Canonical debug program: coalesced advances, then the event itself.
    let mut events: Vec<DebugEvent> = Vec::new();
    let mut cursor = 0u32;
    for id in stream.iter() {
        let (is_pos, addr) = match stream.item(id) {
            MethodItem::Pos(_) | MethodItem::Debug(_) => (true, stream.addr(id)),
            _ => (false, 0),
        };
        if !is_pos {
            continue;
        }
        if addr > cursor {
            events.push(DebugEvent::AdvancePc(addr - cursor));
            cursor = addr;
        }
        match stream.item(id) {
            MethodItem::Pos(p) => events.push(DebugEvent::Position(*p)),
            MethodItem::Debug(s) => events.push(DebugEvent::Step(*s)),
            _ => unreachable!(),
        }
    }

    let outs_size = stream
        .insns()
        .filter(|(_, i)| i.op().is_invoke())
        .map(|(_, i)| i.srcs_size())
        .max()
        .unwrap_or(0) as u16;

    debug!(
        "synced {} instructions into {} code units, {} tries, {} debug events",
        stream.count_opcodes(),
        out.len(),
        tries.len(),
        events.len()
    );

    Ok(CodeBody {
        registers_size: stream.registers_size(),
        ins_size: stream.ins_size(),
        outs_size,
        insns: out,
        tries,
        debug: events,
    })
}
