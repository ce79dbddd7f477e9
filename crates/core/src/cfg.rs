//! Deriving a control-flow graph from a method stream.
//!
//! A block is a maximal run of items with no interior branch target whose
//! terminator is a branch, a return/throw, or (with `split_before_throw`) a
//! throw-point marker. With splitting on, exceptional edges leave the block
//! that *ends* at the marker, before the throwing instruction's effects, so
//! a definition the throwing instruction would have produced is never
//! considered available on the handler path.

use crate::insn::Instruction;
use crate::result::{Error, Result};
use crate::stream::{ItemId, MethodItem, MethodStream, TargetKind, TryKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::DfsPostOrder;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One basic block: the inclusive item span it covers in the stream.
#[derive(Debug, Clone, Copy)]
pub struct BlockData {
    pub first: ItemId,
    pub last: ItemId,
}

/// Edge classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Textual successor.
    Fallthrough,
    /// Taken edge of a goto or if form.
    Branch,
    /// One switch case, carrying its payload index.
    SwitchCase(u32),
    /// Into an exception handler.
    Throw,
    /// Link between consecutive catches of one handler chain.
    CatchChain,
}

/// A control-flow view over a stream. The view records the stream revision
/// it was built from and refuses to serve once the stream has been edited.
#[derive(Debug)]
pub struct Cfg {
    pub graph: DiGraph<BlockData, EdgeKind>,
    pub entry: NodeIndex,
    revision: u64,
    node_of: HashMap<ItemId, NodeIndex>,
}

impl Cfg {
    /// Fails with [`Error::StaleCfg`] if the stream has changed since build.
    pub fn check_fresh(&self, stream: &MethodStream) -> Result<()> {
        if stream.revision() == self.revision {
            Ok(())
        } else {
            Err(Error::StaleCfg)
        }
    }

    pub fn block(&self, n: NodeIndex) -> &BlockData {
        &self.graph[n]
    }

    /// Blocks in stream order.
    pub fn blocks(&self) -> impl Iterator<Item = NodeIndex> {
        self.graph.node_indices()
    }

    /// The block containing the given item.
    pub fn block_of(&self, id: ItemId) -> Option<NodeIndex> {
        self.node_of.get(&id).copied()
    }

    /// Instructions of a block, in order.
    pub fn block_insns<'s>(
        &self,
        stream: &'s MethodStream,
        n: NodeIndex,
    ) -> impl Iterator<Item = (ItemId, &'s Instruction)> + 's {
        let BlockData { first, last } = self.graph[n];
        stream.range(first, last).filter_map(move |id| {
            match stream.item(id) {
                MethodItem::Insn(i) => Some((id, i)),
                _ => None,
            }
        })
    }

    pub fn preds(&self, n: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(n, Direction::Incoming)
    }

    pub fn succs(&self, n: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(n, Direction::Outgoing)
    }

    /// Postorder over blocks reachable from the entry.
    pub fn postorder(&self) -> Vec<NodeIndex> {
        let mut order = Vec::new();
        let mut dfs = DfsPostOrder::new(&self.graph, self.entry);
        while let Some(n) = dfs.next(&self.graph) {
            order.push(n);
        }
        order
    }

    /// Reverse postorder, the forward-dataflow schedule.
    pub fn rpo(&self) -> Vec<NodeIndex> {
        let mut order = self.postorder();
        order.reverse();
        order
    }
}

/// Build the CFG of a stream.
pub fn build_cfg(stream: &MethodStream, split_before_throw: bool) -> Result<Cfg> {
    if stream.is_empty() {
        return Err(Error::EmptyMethod);
    }

    // Phase 1+2: leaders and spans in one walk. A new block opens at every
    // label and at every catch item (a handler entry is its own leader); a
    // run of consecutive labels stays in one block. A block closes after a
    // terminator, after a try end, and (when splitting) after a throw-point
    // marker.
    let mut spans: Vec<(ItemId, ItemId)> = Vec::new();
    let mut first: Option<ItemId> = None;
    let mut only_labels = false;
    for id in stream.iter() {
        let item = stream.item(id);
        let is_label = matches!(item, MethodItem::Target(_));
        let is_catch = matches!(item, MethodItem::Catch(_));
        if (is_label && !only_labels) || is_catch {
            if let Some(f) = first.take() {
                let prev = stream.prev(id).expect("leader has a predecessor");
                spans.push((f, prev));
            }
        }
        if first.is_none() {
            only_labels = true;
        }
        first.get_or_insert(id);
        if !is_label {
            only_labels = false;
        }
        let closes = match item {
            MethodItem::Insn(i) => {
                let op = i.op();
                !op.can_continue() || op.branches() || op.is_switch()
            }
            MethodItem::ThrowPoint { .. } => split_before_throw,
            MethodItem::TryBound(b) => b.kind == TryKind::End,
            _ => false,
        };
        if closes {
            spans.push((first.take().expect("open block"), id));
        }
    }
    if let Some(f) = first {
        spans.push((f, stream.tail().expect("nonempty stream")));
    }

    let mut graph: DiGraph<BlockData, EdgeKind> = DiGraph::new();
    let mut node_of: HashMap<ItemId, NodeIndex> = HashMap::new();
    let mut nodes: Vec<NodeIndex> = Vec::with_capacity(spans.len());
    for &(f, l) in &spans {
        let n = graph.add_node(BlockData { first: f, last: l });
        for id in stream.range(f, l) {
            node_of.insert(id, n);
        }
        nodes.push(n);
    }

    // Phase 3: edges.
    for (i, &n) in nodes.iter().enumerate() {
        let BlockData { first, last } = graph[n];
        let term = stream
            .range(first, last)
            .filter(|&id| matches!(stream.item(id), MethodItem::Insn(_)))
            .last();
        let next_block = nodes.get(i + 1).copied();

        let Some(term) = term else {
            if let Some(nb) = next_block {
                graph.add_edge(n, nb, EdgeKind::Fallthrough);
            }
            continue;
        };
        let op = stream.insn(term).expect("terminator is an instruction").op();

        if op.branches() {
            let target = stream.targets_of(term);
            let target_node = node_of[&target[0]];
            graph.add_edge(n, target_node, EdgeKind::Branch);
            if op.can_continue() {
                if let Some(nb) = next_block {
                    graph.add_edge(n, nb, EdgeKind::Fallthrough);
                }
            }
        } else if op.is_switch() {
            for t in stream.targets_of(term) {
                let case = match stream.item(t) {
                    MethodItem::Target(bt) => match bt.kind {
                        TargetKind::Case(c) => c,
                        TargetKind::Simple => 0,
                    },
                    _ => unreachable!("targets_of yields targets"),
                };
                graph.add_edge(n, node_of[&t], EdgeKind::SwitchCase(case));
            }
            if let Some(nb) = next_block {
                graph.add_edge(n, nb, EdgeKind::Fallthrough);
            }
        } else if op.can_continue() {
            if let Some(nb) = next_block {
                graph.add_edge(n, nb, EdgeKind::Fallthrough);
            }
        }
        // return/throw: no ordinary successors.
    }

    // Exceptional edges. Regions stack LIFO over their intersection; the
    // innermost chain contributes its throw edges first.
    let mut open: Vec<ItemId> = Vec::new();
    for &n in &nodes {
        let BlockData { first, last } = graph[n];
        let mut active = open.clone();
        let mut last_item_is_marker = false;
        let mut contains_throwing = false;
        for id in stream.range(first, last) {
            match stream.item(id) {
                MethodItem::TryBound(b) => match b.kind {
                    TryKind::Start => {
                        open.push(b.catch_start);
                        active.push(b.catch_start);
                    }
                    TryKind::End => {
                        open.pop();
                    }
                },
                MethodItem::Insn(insn) if insn.op().may_throw() => contains_throwing = true,
                _ => {}
            }
            last_item_is_marker = matches!(stream.item(id), MethodItem::ThrowPoint { .. });
        }
        let throws_here = if split_before_throw {
            last_item_is_marker
        } else {
            contains_throwing
        };
        if !throws_here || active.is_empty() {
            continue;
        }
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        for &chain in active.iter().rev() {
            let mut cur = Some(chain);
            while let Some(c) = cur {
                let entry = match stream.item(c) {
                    MethodItem::Catch(e) => *e,
                    _ => {
                        return Err(Error::BrokenStream(
                            "try boundary names a non-catch".into(),
                        ))
                    }
                };
                let cn = node_of[&c];
                if seen.insert(cn) {
                    graph.add_edge(n, cn, EdgeKind::Throw);
                }
                cur = entry.next;
            }
        }
    }

    // Chain links between consecutive catches.
    let mut chain_edges: Vec<(NodeIndex, NodeIndex)> = Vec::new();
    for id in stream.iter() {
        if let MethodItem::Catch(e) = stream.item(id) {
            if let Some(next) = e.next {
                chain_edges.push((node_of[&id], node_of[&next]));
            }
        }
    }
    for (a, b) in chain_edges {
        let already = graph
            .edges_connecting(a, b)
            .any(|e| *e.weight() == EdgeKind::CatchChain);
        if !already {
            graph.add_edge(a, b, EdgeKind::CatchChain);
        }
    }

    let entry = nodes[0];
    debug!(
        "built cfg: {} blocks, {} edges (split_before_throw={})",
        graph.node_count(),
        graph.edge_count(),
        split_before_throw
    );
    debug_assert!({
        let covered: usize = nodes
            .iter()
            .map(|&n| {
                let BlockData { first, last } = graph[n];
                stream.range(first, last).count()
            })
            .sum();
        covered == stream.len()
    });

    Ok(Cfg {
        graph,
        entry,
        revision: stream.revision(),
        node_of,
    })
}
