//! Tail-call and bounded inlining, with register widening.
//!
//! Splicing is a structural clone: callee items are copied into the caller
//! and every cross-reference is rewritten through an old-to-new id map, so
//! callee branches, try regions and markers survive intact. Callee parameter
//! registers land on the invoke's argument registers; other callee registers
//! go to caller registers that are dead after the invoke, with the register
//! file widened when the dead pool runs short. Refusals are pass-visible
//! (`Ok(false)`) and leave the caller unchanged.

use crate::balloon::balloon;
use crate::body::CodeBody;
use crate::catalog::Op;
use crate::cfg::build_cfg;
use crate::dataflow::TaintedRegs;
use crate::insn::Instruction;
use crate::liveness::live_out_map;
use crate::result::{Error, Result};
use crate::stream::{BranchTarget, ItemId, MethodItem, MethodStream, TargetKind};
use std::collections::HashMap;
use tracing::debug;

/// Default ceiling on a caller's register file for bounded inlining, chosen
/// so 4-bit operand forms stay encodable.
pub const DEFAULT_REG_BUDGET: u16 = 16;

fn fits(reg: u16, width: u8) -> bool {
    (reg as u32) < (1u32 << width)
}

/// Callee-to-caller register translation.
struct RegMap {
    /// First parameter register of the callee (parameters sit at the top).
    callee_param_base: u16,
    /// Parameter words map onto the invoke's argument registers.
    params: Vec<u16>,
    /// Non-parameter callee registers map onto these caller registers.
    temps: Vec<u16>,
}

impl RegMap {
    fn map(&self, reg: u16) -> u16 {
        if reg >= self.callee_param_base {
            self.params[(reg - self.callee_param_base) as usize]
        } else {
            self.temps[reg as usize]
        }
    }
}

fn remap_instruction(insn: &mut Instruction, map: &RegMap) -> Result<()> {
    let op = insn.op();
    if op.has_dest() && !op.dest_is_src0() {
        let d = map.map(insn.dest());
        if !fits(d, op.dest_width()) {
            return Err(Error::RegisterOutOfRange {
                reg: d,
                width: op.dest_width(),
                op: op.name(),
            });
        }
        insn.set_dest(d);
    }
    for i in 0..insn.srcs_size() {
        let s = map.map(insn.src(i));
        if !fits(s, op.src_width(i)) {
            return Err(Error::RegisterOutOfRange {
                reg: s,
                width: op.src_width(i),
                op: op.name(),
            });
        }
        insn.set_src(i, s);
    }
    if op.is_range() && !insn.srcs().is_empty() {
        let first = insn.src(0);
        for i in 1..insn.srcs_size() {
            if insn.src(i) != first + i as u16 {
                return Err(Error::BrokenRange(0));
            }
        }
    }
    Ok(())
}

fn check_remappable(callee: &MethodStream, map: &RegMap) -> bool {
    callee.insns().all(|(_, i)| {
        let mut probe = i.clone();
        remap_instruction(&mut probe, map).is_ok()
    })
}

fn remap_stream(callee: &mut MethodStream, map: &RegMap) -> Result<()> {
    let ids: Vec<ItemId> = callee.insns().map(|(id, _)| id).collect();
    for id in ids {
        let insn = callee.insn_mut(id).expect("instruction id");
        remap_instruction(insn, map)?;
    }
    Ok(())
}

/// Widen the register file to `newregs`, renumbering parameter registers
/// (which sit at the top of the file) upward and rewriting every operand
/// that names one. Returns false, changing nothing, if any operand field
/// cannot encode its shifted register.
pub fn enlarge_regs(stream: &mut MethodStream, newregs: u16) -> bool {
    let old = stream.registers_size();
    let ins = stream.ins_size();
    if newregs < old {
        return false;
    }
    if newregs == old {
        return true;
    }
    let delta = newregs - old;
    let base = old - ins;

    for (_, insn) in stream.insns() {
        let op = insn.op();
        if op.has_dest() && !op.dest_is_src0() {
            let d = insn.dest();
            if d >= base && !fits(d + delta, op.dest_width()) {
                return false;
            }
        }
        for i in 0..insn.srcs_size() {
            let s = insn.src(i);
            if s >= base && !fits(s + delta, op.src_width(i)) {
                return false;
            }
        }
        if op.is_range() && !insn.srcs().is_empty() {
            // A uniform shift keeps a range contiguous only if it covers
            // parameters entirely or not at all.
            let first_is_param = insn.src(0) >= base;
            if insn.srcs().iter().any(|&r| (r >= base) != first_is_param) {
                return false;
            }
        }
    }

    let ids: Vec<ItemId> = stream.insns().map(|(id, _)| id).collect();
    for id in ids {
        let insn = stream.insn_mut(id).expect("instruction id");
        let op = insn.op();
        if op.has_dest() && !op.dest_is_src0() {
            let d = insn.dest();
            if d >= base {
                insn.set_dest(d + delta);
            }
        }
        for i in 0..insn.srcs_size() {
            let s = insn.src(i);
            if s >= base {
                insn.set_src(i, s + delta);
            }
        }
    }
    stream.set_registers_size(newregs);
    debug!("widened register file from {} to {} registers", old, newregs);
    true
}

/// Copy every callee item into the caller after `anchor`, rewriting internal
/// cross-references through the id map. Returns the span of new items.
fn splice_after(
    caller: &mut MethodStream,
    anchor: ItemId,
    callee: &MethodStream,
) -> (Option<ItemId>, Option<ItemId>) {
    let mut id_map: HashMap<ItemId, ItemId> = HashMap::new();
    let mut cursor = anchor;
    let mut first = None;
    for old in callee.iter() {
        let item = callee.item(old).clone();
        let new = caller.insert_after_item(cursor, item);
        id_map.insert(old, new);
        first.get_or_insert(new);
        cursor = new;
    }
    let new_ids: Vec<ItemId> = id_map.values().copied().collect();
    for new in new_ids {
        match caller.item_mut(new) {
            MethodItem::Target(t) => t.src = id_map[&t.src],
            MethodItem::TryBound(b) => b.catch_start = id_map[&b.catch_start],
            MethodItem::Catch(c) => {
                if let Some(n) = c.next {
                    c.next = Some(id_map[&n]);
                }
            }
            MethodItem::ThrowPoint { insn } => *insn = id_map[insn],
            _ => {}
        }
    }
    (first, if cursor == anchor { None } else { Some(cursor) })
}

fn move_for_return(ret: Op) -> Option<Op> {
    match ret {
        Op::Return => Some(Op::Move16),
        Op::ReturnWide => Some(Op::MoveWide16),
        Op::ReturnObject => Some(Op::MoveObject16),
        _ => None,
    }
}

/// Rewrite callee returns for a mid-body splice: the returned value moves
/// into the invoke's result register and control jumps past the splice. A
/// return that is already the last instruction just falls through.
fn rewrite_returns(callee: &mut MethodStream, result_reg: Option<u16>) -> Result<()> {
    let returns: Vec<ItemId> = callee
        .insns()
        .filter(|(_, i)| i.op().is_return())
        .map(|(id, _)| id)
        .collect();
    let last_insn = callee.insns().last().map(|(id, _)| id);

    let mut gotos: Vec<ItemId> = Vec::new();
    for id in returns {
        let (ret_op, ret_src) = {
            let insn = callee.insn(id).expect("return id");
            let src = if insn.op() == Op::ReturnVoid {
                None
            } else {
                Some(insn.src(0))
            };
            (insn.op(), src)
        };
        let is_last = Some(id) == last_insn;
        let mv = match (result_reg, ret_src, move_for_return(ret_op)) {
            (Some(dst), Some(src), Some(op)) => {
                Some(Instruction::new(op).with_dest(dst).with_srcs(vec![src]))
            }
            _ => None,
        };
        match mv {
            Some(mv) => {
                callee.replace_opcode(id, mv)?;
                if !is_last {
                    let g = callee.insert_after_item(id, MethodItem::Insn(Instruction::new(Op::Goto)));
                    gotos.push(g);
                }
            }
            None => {
                if is_last {
                    callee.remove_opcode(id)?;
                } else {
                    let g = callee.insert_after_item(id, MethodItem::Insn(Instruction::new(Op::Goto)));
                    callee.remove_opcode(id)?;
                    gotos.push(g);
                }
            }
        }
    }
    // One shared continuation point at the end of the callee: the items that
    // follow the splice in the caller.
    for g in gotos {
        callee.push_back_item(MethodItem::Target(BranchTarget {
            src: g,
            kind: TargetKind::Simple,
        }));
    }
    Ok(())
}

/// Inline a tail-called callee into the caller at `invoke`.
///
/// Preconditions (violations are errors, not refusals): `invoke` is an
/// invoke instruction, and nothing but an optional move-result and one
/// return follows it — the callee's own returns become the method's
/// returns.
pub fn inline_tail_call(
    caller: &mut MethodStream,
    callee_body: &CodeBody,
    invoke: ItemId,
) -> Result<()> {
    let inv_addr = caller.addr(invoke);
    match caller.insn(invoke) {
        Some(i) if i.op().is_invoke() => {}
        _ => return Err(Error::NotTailCall(inv_addr)),
    }

    let mut move_result = None;
    let mut ret = None;
    let mut cur = caller.next(invoke);
    while let Some(id) = cur {
        match caller.item(id) {
            MethodItem::Insn(i) if i.op().is_move_result() && ret.is_none() && move_result.is_none() => {
                move_result = Some(id)
            }
            MethodItem::Insn(i) if i.op().is_return() && ret.is_none() => ret = Some(id),
            MethodItem::Insn(_)
            | MethodItem::Target(_)
            | MethodItem::Catch(_)
            | MethodItem::TryBound(_) => return Err(Error::NotTailCall(inv_addr)),
            _ => {}
        }
        cur = caller.next(id);
    }

    let mut callee = balloon(callee_body)?;
    let callee_ins = callee.ins_size();
    let callee_nonparam = callee.registers_size() - callee_ins;
    let caller_nonparam = caller.registers_size() - caller.ins_size();

    if callee_nonparam > caller_nonparam {
        let newregs = callee_nonparam + caller.ins_size();
        if !enlarge_regs(caller, newregs) {
            return Err(Error::CannotWiden(newregs));
        }
    }

    let params: Vec<u16> = caller
        .insn(invoke)
        .expect("invoke instruction")
        .srcs()
        .to_vec();
    if params.len() != callee_ins as usize {
        return Err(Error::BrokenStream(
            "invoke arity does not match callee parameters".into(),
        ));
    }
    let map = RegMap {
        callee_param_base: callee_nonparam,
        params,
        temps: (0..callee_nonparam).collect(),
    };
    if !check_remappable(&callee, &map) {
        return Err(Error::CannotWiden(caller.registers_size()));
    }
    remap_stream(&mut callee, &map)?;

    if let Some(mr) = move_result {
        caller.remove_opcode(mr)?;
    }
    if let Some(r) = ret {
        caller.remove_opcode(r)?;
    }
    let spliced = callee.count_opcodes();
    splice_after(caller, invoke, &callee);
    caller.remove_opcode(invoke)?;
    debug!("tail-inlined {} callee instructions", spliced);
    Ok(())
}

/// Per-caller state shared across multiple bounded inlines: the register
/// budget, a size estimate, and one liveness result computed lazily and
/// deliberately reused (Redex-style) rather than recomputed per splice.
pub struct InlineContext<'a> {
    caller: &'a mut MethodStream,
    pub original_regs: u16,
    pub estimated_units: u64,
    reg_budget: u16,
    liveness: Option<HashMap<ItemId, TaintedRegs>>,
}

impl<'a> InlineContext<'a> {
    pub fn new(caller: &'a mut MethodStream, use_liveness: bool) -> Result<Self> {
        let original_regs = caller.registers_size();
        let estimated_units = caller.sum_opcode_sizes() as u64;
        let liveness = if use_liveness {
            let cfg = build_cfg(caller, true)?;
            Some(live_out_map(caller, &cfg)?)
        } else {
            None
        };
        Ok(InlineContext {
            caller,
            original_regs,
            estimated_units,
            reg_budget: DEFAULT_REG_BUDGET,
            liveness,
        })
    }

    pub fn with_reg_budget(mut self, budget: u16) -> Self {
        self.reg_budget = budget;
        self
    }

    pub fn caller(&mut self) -> &mut MethodStream {
        self.caller
    }

    /// Registers live immediately after `insn`. Instructions outside the
    /// cached result (spliced after it was computed) conservatively report
    /// everything live.
    pub fn live_out(&mut self, insn: ItemId) -> Result<TaintedRegs> {
        if self.liveness.is_none() {
            let cfg = build_cfg(self.caller, true)?;
            self.liveness = Some(live_out_map(self.caller, &cfg)?);
        }
        let map = self.liveness.as_ref().expect("just computed");
        Ok(match map.get(&insn) {
            Some(s) => s.clone(),
            None => {
                let mut all = TaintedRegs::new(self.caller.registers_size());
                for r in 0..self.caller.registers_size() {
                    all.insert(r);
                }
                all
            }
        })
    }
}

/// Inline `callee_body` at a mid-body invoke. Returns `Ok(false)` — caller
/// untouched — when the register plan would exceed the context's budget or
/// some operand field cannot hold its remapped register.
pub fn inline_bounded(
    ctx: &mut InlineContext<'_>,
    callee_body: &CodeBody,
    invoke: ItemId,
) -> Result<bool> {
    let caller_regs = ctx.caller.registers_size();
    let caller_nonparam = caller_regs - ctx.caller.ins_size();

    let inv_srcs: Vec<u16> = match ctx.caller.insn(invoke) {
        Some(i) if i.op().is_invoke() => i.srcs().to_vec(),
        _ => return Err(Error::BrokenStream("inline target is not an invoke".into())),
    };

    let mut callee = balloon(callee_body)?;
    let callee_ins = callee.ins_size();
    let callee_nonparam = callee.registers_size() - callee_ins;
    if inv_srcs.len() != callee_ins as usize {
        return Err(Error::BrokenStream(
            "invoke arity does not match callee parameters".into(),
        ));
    }

    // The move-result fused to this invoke, if any.
    let mut move_result = None;
    let mut cur = ctx.caller.next(invoke);
    while let Some(id) = cur {
        match ctx.caller.item(id) {
            MethodItem::Insn(i) if i.op().is_move_result() => {
                move_result = Some(id);
                break;
            }
            MethodItem::Pos(_) | MethodItem::Debug(_) | MethodItem::ThrowPoint { .. } => {
                cur = ctx.caller.next(id);
            }
            _ => break,
        }
    }

    // Callee temporaries take caller registers that are dead after the
    // invoke; whatever is left over extends the file.
    let live = ctx.live_out(invoke)?;
    let mut temps: Vec<u16> = (0..caller_nonparam)
        .filter(|r| !live.contains(*r) && !inv_srcs.contains(r))
        .collect();
    let extra = (callee_nonparam as usize).saturating_sub(temps.len()) as u16;
    let newregs = caller_regs + extra;
    if newregs > ctx.reg_budget {
        debug!(
            "refusing inline: {} registers would exceed the budget of {}",
            newregs, ctx.reg_budget
        );
        return Ok(false);
    }
    // Widening shifts parameter registers up by `extra` and frees the zone
    // right above the old non-parameter area.
    temps.extend((0..extra).map(|i| caller_nonparam + i));
    temps.truncate(callee_nonparam as usize);
    let predicted_params: Vec<u16> = inv_srcs
        .iter()
        .map(|&s| if s >= caller_nonparam { s + extra } else { s })
        .collect();

    let map = RegMap {
        callee_param_base: callee_nonparam,
        params: predicted_params,
        temps,
    };
    if !check_remappable(&callee, &map) {
        debug!("refusing inline: callee operands cannot hold remapped registers");
        return Ok(false);
    }
    if extra > 0 && !enlarge_regs(ctx.caller, newregs) {
        debug!("refusing inline: caller register file cannot widen to {}", newregs);
        return Ok(false);
    }
    remap_stream(&mut callee, &map)?;

    let result_reg = move_result.map(|id| {
        ctx.caller
            .insn(id)
            .expect("move-result instruction")
            .dest()
    });
    rewrite_returns(&mut callee, result_reg)?;

    // The caller's position in force before the invoke, re-established after
    // the spliced items.
    let mut prior_pos = None;
    let mut back = ctx.caller.prev(invoke);
    while let Some(id) = back {
        if let MethodItem::Pos(p) = ctx.caller.item(id) {
            prior_pos = Some(*p);
            break;
        }
        back = ctx.caller.prev(id);
    }

    let units = callee.sum_opcode_sizes() as u64;
    let (_, last) = splice_after(ctx.caller, invoke, &callee);
    if let (Some(p), Some(last)) = (prior_pos, last) {
        ctx.caller.insert_after_item(last, MethodItem::Pos(p));
    }
    if let Some(mr) = move_result {
        ctx.caller.remove_opcode(mr)?;
    }
    ctx.caller.remove_opcode(invoke)?;
    ctx.estimated_units += units;
    debug!("inlined callee ({} units) at invoke", units);
    Ok(true)
}
