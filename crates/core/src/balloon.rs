//! Decoding a packed body into a method stream.
//!
//! The scan walks the code units linearly, producing one instruction item
//! per opcode and absorbing payload pseudo-instructions into side data on
//! their owning instruction. Branch displacements become target items,
//! try entries become boundary items wired to catch chains, and the debug
//! program is interleaved as position and debug items. After decoding, every
//! cross-reference is by item identity and the cached addresses are correct.

use crate::body::{CodeBody, DebugEvent};
use crate::catalog::Op;
use crate::insn::{self, Payload};
use crate::result::{Error, Result};
use crate::stream::{
    BranchTarget, CatchEntry, ItemId, MethodItem, MethodStream, TargetKind, TryBoundary, TryKind,
};
use std::collections::BTreeMap;
use tracing::debug;

pub(crate) const PACKED_SWITCH_IDENT: u16 = 0x0100;
pub(crate) const SPARSE_SWITCH_IDENT: u16 = 0x0200;
pub(crate) const FILL_ARRAY_IDENT: u16 = 0x0300;

/// Width in code units of the payload pseudo-instruction at `pos`, if one
/// starts there.
pub(crate) fn payload_units(units: &[u16], pos: usize) -> Option<usize> {
    match *units.get(pos)? {
        PACKED_SWITCH_IDENT => {
            let size = *units.get(pos + 1)? as usize;
            Some(4 + size * 2)
        }
        SPARSE_SWITCH_IDENT => {
            let size = *units.get(pos + 1)? as usize;
            Some(2 + size * 4)
        }
        FILL_ARRAY_IDENT => {
            let width = *units.get(pos + 1)? as usize;
            let size =
                (*units.get(pos + 2)? as usize) | ((*units.get(pos + 3)? as usize) << 16);
            Some(4 + (size * width + 1) / 2)
        }
        _ => None,
    }
}

fn unit_pair(units: &[u16], pos: usize) -> i32 {
    (units[pos] as u32 | ((units[pos + 1] as u32) << 16)) as i32
}

fn check_extent(units: &[u16], pos: usize) -> Result<usize> {
    let total = payload_units(units, pos).ok_or(Error::MalformedPayload(pos))?;
    if pos + total > units.len() {
        return Err(Error::Truncated(pos));
    }
    Ok(total)
}

/// Read a packed-switch payload: case keys plus displacements relative to
/// the owning switch opcode.
fn read_packed(units: &[u16], pos: usize) -> Result<(Vec<i32>, Vec<i32>)> {
    check_extent(units, pos)?;
    let size = units[pos + 1] as usize;
    let first_key = unit_pair(units, pos + 2);
    let mut keys = Vec::with_capacity(size);
    let mut rels = Vec::with_capacity(size);
    for i in 0..size {
        keys.push(first_key.wrapping_add(i as i32));
        rels.push(unit_pair(units, pos + 4 + i * 2));
    }
    Ok((keys, rels))
}

fn read_sparse(units: &[u16], pos: usize) -> Result<(Vec<i32>, Vec<i32>)> {
    check_extent(units, pos)?;
    let size = units[pos + 1] as usize;
    let mut keys = Vec::with_capacity(size);
    let mut rels = Vec::with_capacity(size);
    for i in 0..size {
        keys.push(unit_pair(units, pos + 2 + i * 2));
        rels.push(unit_pair(units, pos + 2 + size * 2 + i * 2));
    }
    Ok((keys, rels))
}

fn read_fill(units: &[u16], pos: usize) -> Result<Payload> {
    check_extent(units, pos)?;
    let element_width = units[pos + 1];
    let size = units[pos + 2] as usize | ((units[pos + 3] as usize) << 16);
    let byte_len = size * element_width as usize;
    let mut data = Vec::with_capacity(byte_len);
    for j in 0..byte_len {
        let unit = units[pos + 4 + j / 2];
        data.push((unit >> (8 * (j % 2))) as u8);
    }
    Ok(Payload::FillArray {
        element_width,
        data,
    })
}

fn absolute(addr: u32, disp: i32) -> Result<u32> {
    let t = addr as i64 + disp as i64;
    u32::try_from(t).map_err(|_| Error::NoInstructionAt(addr))
}

/// Decode a packed body into its editable stream form.
pub fn balloon(body: &CodeBody) -> Result<MethodStream> {
    let units = &body.insns;
    let mut stream = MethodStream::new(body.registers_size, body.ins_size);
    let mut at: BTreeMap<u32, ItemId> = BTreeMap::new();
    let mut widths: BTreeMap<u32, u32> = BTreeMap::new();
    let mut branches: Vec<(ItemId, u32, TargetKind)> = Vec::new();

    let mut pos = 0usize;
    while pos < units.len() {
        if let Some(skip) = payload_units(units, pos) {
            // Payloads are absorbed when their owner is decoded; the linear
            // scan just steps over them.
            pos += skip;
            continue;
        }
        let decoded = insn::decode(units, pos)?;
        let addr = pos as u32;
        let op = decoded.insn.op();
        let id = stream.push_back_item(MethodItem::Insn(decoded.insn));
        stream.set_addr(id, addr);
        at.insert(addr, id);
        widths.insert(addr, decoded.units);

        if let Some(disp) = decoded.branch {
            branches.push((id, absolute(addr, disp)?, TargetKind::Simple));
        }
        if let Some(off) = decoded.payload_off {
            let ppos = absolute(addr, off)? as usize;
            match op {
                Op::PackedSwitch | Op::SparseSwitch => {
                    let (keys, rels) = if op == Op::PackedSwitch {
                        read_packed(units, ppos)?
                    } else {
                        read_sparse(units, ppos)?
                    };
                    for (i, &rel) in rels.iter().enumerate() {
                        branches.push((id, absolute(addr, rel)?, TargetKind::Case(i as u32)));
                    }
                    stream
                        .insn_mut(id)
                        .expect("just pushed")
                        .set_payload(Payload::Switch { keys });
                }
                Op::FillArrayData => {
                    let payload = read_fill(units, ppos)?;
                    stream.insn_mut(id).expect("just pushed").set_payload(payload);
                }
                _ => return Err(Error::MalformedPayload(ppos)),
            }
        }
        pos += decoded.units as usize;
    }

    // Branch destinations become labels immediately before their instruction.
    for (src, taddr, kind) in branches {
        let insn_id = *at.get(&taddr).ok_or(Error::NoInstructionAt(taddr))?;
        let t = stream.insert_before_item(insn_id, MethodItem::Target(BranchTarget { src, kind }));
        stream.set_addr(t, taddr);
    }

    // Try entries: boundary items around the covered run, catch items at the
    // handler addresses, chained in declaration order with catch-all last.
    for entry in &body.tries {
        let start_id = *at
            .get(&entry.start_addr)
            .ok_or(Error::NoInstructionAt(entry.start_addr))?;
        let end_excl = entry.start_addr + entry.insn_count as u32;
        let (&last_addr, &last_id) = at
            .range(entry.start_addr..end_excl)
            .next_back()
            .ok_or(Error::NoInstructionAt(entry.start_addr))?;

        let mut first_catch = None;
        let mut prev_catch: Option<ItemId> = None;
        let handlers = entry
            .handlers
            .iter()
            .map(|&(ty, haddr)| (Some(ty), haddr))
            .chain(entry.catch_all.map(|haddr| (None, haddr)));
        for (ty, haddr) in handlers {
            let hinsn = *at.get(&haddr).ok_or(Error::NoInstructionAt(haddr))?;
            let c = stream.insert_before_item(hinsn, MethodItem::Catch(CatchEntry { ty, next: None }));
            stream.set_addr(c, haddr);
            if let Some(p) = prev_catch {
                if let MethodItem::Catch(e) = stream.item_mut(p) {
                    e.next = Some(c);
                }
            }
            first_catch.get_or_insert(c);
            prev_catch = Some(c);
        }
        let first_catch = first_catch
            .ok_or_else(|| Error::BrokenStream("try entry with no handlers".into()))?;

        let tb = stream.insert_before_item(
            start_id,
            MethodItem::TryBound(TryBoundary {
                kind: TryKind::Start,
                catch_start: first_catch,
            }),
        );
        stream.set_addr(tb, entry.start_addr);
        let te = stream.insert_after_item(
            last_id,
            MethodItem::TryBound(TryBoundary {
                kind: TryKind::End,
                catch_start: first_catch,
            }),
        );
        stream.set_addr(te, last_addr + widths.get(&last_addr).copied().unwrap_or(1));
    }

    // Debug program: advance-pc moves the cursor only; everything else pins
    // an item at the cursor's instruction.
    let mut cursor: u32 = 0;
    for ev in &body.debug {
        match ev {
            DebugEvent::AdvancePc(d) => cursor += d,
            DebugEvent::Position(p) => {
                let insn_id = *at.get(&cursor).ok_or(Error::NoInstructionAt(cursor))?;
                let it = stream.insert_before_item(insn_id, MethodItem::Pos(*p));
                stream.set_addr(it, cursor);
            }
            DebugEvent::Step(s) => {
                let insn_id = *at.get(&cursor).ok_or(Error::NoInstructionAt(cursor))?;
                let it = stream.insert_before_item(insn_id, MethodItem::Debug(*s));
                stream.set_addr(it, cursor);
            }
        }
    }

    // Throw-point markers go in last so each sits immediately before its
    // instruction, inside any try region that covers it.
    let throwing: Vec<ItemId> = stream
        .insns()
        .filter(|(_, i)| i.op().may_throw())
        .map(|(id, _)| id)
        .collect();
    for id in throwing {
        let addr = stream.addr(id);
        let m = stream.insert_before_item(id, MethodItem::ThrowPoint { insn: id });
        stream.set_addr(m, addr);
    }

    debug_assert!(stream.check_invariants().is_ok());
    debug!(
        "ballooned {} code units into {} items ({} instructions)",
        units.len(),
        stream.len(),
        stream.count_opcodes()
    );
    Ok(stream)
}
