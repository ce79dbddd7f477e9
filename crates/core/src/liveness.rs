//! Backward liveness over register sets.
//!
//! Transfer kills definitions and then gens uses, so a register that an
//! instruction both reads and writes stays live across it. All CFG edges
//! count as successors, so values reaching a handler stay live through the
//! throwing region.

use crate::cfg::Cfg;
use crate::dataflow::{AnalysisState, TaintedRegs};
use crate::insn::Instruction;
use crate::result::Result;
use crate::stream::{ItemId, MethodStream};
use petgraph::graph::NodeIndex;
use std::collections::HashMap;
use tracing::debug;

fn kill_defs(insn: &Instruction, live: &mut TaintedRegs) {
    let op = insn.op();
    if op.has_dest() {
        live.remove(insn.dest());
        if op.dest_is_wide() {
            live.remove(insn.dest() + 1);
        }
    }
}

fn gen_uses(insn: &Instruction, live: &mut TaintedRegs) {
    let op = insn.op();
    for (i, &s) in insn.srcs().iter().enumerate() {
        live.insert(s);
        if op.src_is_wide(i) {
            live.insert(s + 1);
        }
    }
}

fn block_out(
    cfg: &Cfg,
    live_in: &HashMap<NodeIndex, TaintedRegs>,
    nregs: u16,
    n: NodeIndex,
) -> TaintedRegs {
    let mut state = TaintedRegs::new(nregs);
    for s in cfg.succs(n) {
        if let Some(si) = live_in.get(&s) {
            state.meet(si);
        }
    }
    state
}

/// Compute the set of registers live immediately after every reachable
/// instruction.
pub fn live_out_map(stream: &MethodStream, cfg: &Cfg) -> Result<HashMap<ItemId, TaintedRegs>> {
    cfg.check_fresh(stream)?;
    let order = cfg.postorder();
    let nregs = stream.registers_size();
    let mut live_in: HashMap<NodeIndex, TaintedRegs> = HashMap::new();

    let mut rounds = 0usize;
    let mut changed = true;
    while changed {
        changed = false;
        rounds += 1;
        for &n in &order {
            let mut state = block_out(cfg, &live_in, nregs, n);
            let insns: Vec<&Instruction> = cfg.block_insns(stream, n).map(|(_, i)| i).collect();
            for insn in insns.iter().rev() {
                kill_defs(insn, &mut state);
                gen_uses(insn, &mut state);
            }
            if live_in.get(&n) != Some(&state) {
                live_in.insert(n, state);
                changed = true;
            }
        }
    }
    debug!("liveness reached fixpoint after {} rounds", rounds);

    let mut result = HashMap::new();
    for &n in &order {
        let mut state = block_out(cfg, &live_in, nregs, n);
        let insns: Vec<(ItemId, &Instruction)> = cfg.block_insns(stream, n).collect();
        for &(id, insn) in insns.iter().rev() {
            result.insert(id, state.clone());
            kill_defs(insn, &mut state);
            gen_uses(insn, &mut state);
        }
    }
    Ok(result)
}
