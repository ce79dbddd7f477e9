//! Forward dataflow over basic blocks.
//!
//! The driver iterates a caller-supplied transfer function to a fixed point
//! in reverse postorder and hands back one in-state per reachable
//! instruction, keyed by item identity (addresses are worthless under
//! editing). Termination is the caller's contract: the state must form a
//! finite-height lattice and the transfer must be monotone. The driver has
//! no watchdog.

use crate::cfg::Cfg;
use crate::insn::Instruction;
use crate::pool::FieldRef;
use crate::result::Result;
use crate::stream::{ItemId, MethodStream};
use fixedbitset::FixedBitSet;
use petgraph::graph::NodeIndex;
use std::collections::HashMap;
use tracing::debug;

/// An abstract state usable by the dataflow driver.
pub trait AnalysisState: Clone + PartialEq {
    /// Fold in the state arriving over one more predecessor edge.
    fn meet(&mut self, other: &Self);
}

fn join_preds<S: AnalysisState>(
    cfg: &Cfg,
    out: &HashMap<NodeIndex, S>,
    entry_state: &S,
    n: NodeIndex,
) -> Option<S> {
    let mut acc: Option<S> = if n == cfg.entry {
        Some(entry_state.clone())
    } else {
        None
    };
    for p in cfg.preds(n) {
        if let Some(o) = out.get(&p) {
            match acc.as_mut() {
                Some(a) => a.meet(o),
                None => acc = Some(o.clone()),
            }
        }
    }
    acc
}

/// Run a forward dataflow to fixpoint and return the in-state of every
/// reachable instruction.
pub fn forward_dataflow<S, F>(
    stream: &MethodStream,
    cfg: &Cfg,
    entry_state: S,
    mut transfer: F,
) -> Result<HashMap<ItemId, S>>
where
    S: AnalysisState,
    F: FnMut(&Instruction, &mut S),
{
    cfg.check_fresh(stream)?;
    let rpo = cfg.rpo();
    let mut out: HashMap<NodeIndex, S> = HashMap::new();

    let mut rounds = 0usize;
    let mut changed = true;
    while changed {
        changed = false;
        rounds += 1;
        for &n in &rpo {
            let Some(mut state) = join_preds(cfg, &out, &entry_state, n) else {
                continue;
            };
            for (_, insn) in cfg.block_insns(stream, n) {
                transfer(insn, &mut state);
            }
            if out.get(&n) != Some(&state) {
                out.insert(n, state);
                changed = true;
            }
        }
    }
    debug!("forward dataflow reached fixpoint after {} rounds", rounds);

    let mut result = HashMap::new();
    for &n in &rpo {
        let Some(mut state) = join_preds(cfg, &out, &entry_state, n) else {
            continue;
        };
        for (id, insn) in cfg.block_insns(stream, n) {
            result.insert(id, state.clone());
            transfer(insn, &mut state);
        }
    }
    Ok(result)
}

/// A register set; meet is union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintedRegs {
    bits: FixedBitSet,
}

impl TaintedRegs {
    pub fn new(nregs: u16) -> Self {
        TaintedRegs {
            bits: FixedBitSet::with_capacity(nregs as usize),
        }
    }

    pub fn insert(&mut self, reg: u16) {
        if reg as usize >= self.bits.len() {
            self.bits.grow(reg as usize + 1);
        }
        self.bits.insert(reg as usize);
    }

    pub fn remove(&mut self, reg: u16) {
        if (reg as usize) < self.bits.len() {
            self.bits.set(reg as usize, false);
        }
    }

    pub fn contains(&self, reg: u16) -> bool {
        (reg as usize) < self.bits.len() && self.bits.contains(reg as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.count_ones(..) == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.bits.ones().map(|r| r as u16)
    }
}

impl AnalysisState for TaintedRegs {
    fn meet(&mut self, other: &Self) {
        if self.bits.len() < other.bits.len() {
            self.bits.grow(other.bits.len());
        }
        self.bits.union_with(&other.bits);
    }
}

/// Where a field's value currently lives, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    /// No write seen yet.
    Undefined,
    /// Conflicting locations on different paths.
    Different,
    /// The register that held the value has since been clobbered.
    Overwritten,
    /// The value is in this register.
    Reg(u16),
}

/// Per-field value locations; meet keeps agreement and degrades any
/// disagreement to [`FieldValue::Different`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldsRegs {
    pub field_to_reg: HashMap<FieldRef, FieldValue>,
}

impl FieldsRegs {
    /// Every tracked field starts out undefined.
    pub fn new(fields: &[FieldRef]) -> Self {
        FieldsRegs {
            field_to_reg: fields
                .iter()
                .map(|&f| (f, FieldValue::Undefined))
                .collect(),
        }
    }

    pub fn get(&self, field: FieldRef) -> FieldValue {
        self.field_to_reg
            .get(&field)
            .copied()
            .unwrap_or(FieldValue::Undefined)
    }
}

impl AnalysisState for FieldsRegs {
    fn meet(&mut self, other: &Self) {
        for (field, value) in self.field_to_reg.iter_mut() {
            if other.field_to_reg.get(field) != Some(value) {
                *value = FieldValue::Different;
            }
        }
    }
}
