//! The editing API over a method stream.
//!
//! Every operation repairs cross-references so the stream invariants hold on
//! return: deleting a branch deletes its labels, deleting a switch deletes
//! its case labels, replacing a branch hands its target to the replacement.
//! Register renumbering is never done here; callers that need a wider
//! register file go through the inliner's widening.

use crate::insn::{Instruction, Payload};
use crate::result::{Error, Result};
use crate::stream::{ItemId, MethodItem, MethodStream, TargetKind, TryKind};
use tracing::debug;

impl MethodStream {
    /// Append an instruction, placing a throw-point marker in front of it
    /// when the opcode may throw (mirroring what decoding does).
    pub fn push_insn(&mut self, insn: Instruction) -> ItemId {
        let throwing = insn.op().may_throw();
        let id = self.push_back_item(MethodItem::Insn(insn));
        if throwing {
            self.insert_before_item(id, MethodItem::ThrowPoint { insn: id });
        }
        id
    }

    /// Insert instructions after `anchor`. `None` prepends: after any leading
    /// position and debug items, but before the first instruction.
    pub fn insert_after(&mut self, anchor: Option<ItemId>, insns: Vec<Instruction>) -> Result<()> {
        match anchor {
            Some(mut cursor) => {
                if !self.contains(cursor) {
                    return Err(Error::BrokenStream("insert after dead item".into()));
                }
                for insn in insns {
                    let throwing = insn.op().may_throw();
                    let id = self.insert_after_item(cursor, MethodItem::Insn(insn));
                    if throwing {
                        self.insert_before_item(id, MethodItem::ThrowPoint { insn: id });
                    }
                    cursor = id;
                }
            }
            None => {
                let pivot = self.iter().find(|&id| {
                    !matches!(self.item(id), MethodItem::Pos(_) | MethodItem::Debug(_))
                });
                for insn in insns {
                    let throwing = insn.op().may_throw();
                    let id = match pivot {
                        Some(p) => self.insert_before_item(p, MethodItem::Insn(insn)),
                        None => self.push_back_item(MethodItem::Insn(insn)),
                    };
                    if throwing {
                        self.insert_before_item(id, MethodItem::ThrowPoint { insn: id });
                    }
                }
            }
        }
        Ok(())
    }

    fn throw_point_of(&self, insn: ItemId) -> Option<ItemId> {
        let prev = self.prev(insn)?;
        match self.item(prev) {
            MethodItem::ThrowPoint { insn: marked } if *marked == insn => Some(prev),
            _ => None,
        }
    }

    /// Delete an instruction item. Branch labels whose source it was are
    /// deleted with it, as is its throw-point marker.
    pub fn remove_opcode(&mut self, id: ItemId) -> Result<()> {
        let op = match self.item(id) {
            MethodItem::Insn(insn) => insn.op(),
            _ => return Err(Error::BrokenStream("remove_opcode on non-instruction".into())),
        };
        if op.branches() || op.is_switch() {
            for target in self.targets_of(id) {
                self.unlink(target);
            }
        }
        if let Some(marker) = self.throw_point_of(id) {
            self.unlink(marker);
        }
        self.unlink(id);
        debug!("removed {}", op.name());
        Ok(())
    }

    /// In-place swap preserving position and identity. If both the old and
    /// the new instruction are branches, the replacement adopts the old
    /// branch's target. Replacing a non-branch with a branch is rejected:
    /// there is no target to adopt.
    pub fn replace_opcode(&mut self, id: ItemId, to: Instruction) -> Result<()> {
        let old_op = match self.item(id) {
            MethodItem::Insn(insn) => insn.op(),
            _ => return Err(Error::BrokenStream("replace_opcode on non-instruction".into())),
        };
        let new_op = to.op();

        let old_branches = old_op.branches() || old_op.is_switch();
        let new_branches = new_op.branches() || new_op.is_switch();
        if new_branches && !old_branches {
            return Err(Error::BrokenStream(
                "replacement branch has no target to adopt".into(),
            ));
        }
        if old_branches && !new_branches {
            for target in self.targets_of(id) {
                self.unlink(target);
            }
        }

        match (old_op.may_throw(), new_op.may_throw()) {
            (true, false) => {
                if let Some(marker) = self.throw_point_of(id) {
                    self.unlink(marker);
                }
            }
            (false, true) => {
                self.insert_before_item(id, MethodItem::ThrowPoint { insn: id });
            }
            _ => {}
        }

        debug!("replaced {} with {}", old_op.name(), new_op.name());
        *self.item_mut(id) = MethodItem::Insn(to);
        Ok(())
    }

    /// Like [`MethodStream::replace_opcode`], but both instructions must be
    /// branch forms; the replacement ends up jumping where the original did.
    pub fn replace_branch(&mut self, id: ItemId, to: Instruction) -> Result<()> {
        let old_is_branch = matches!(
            self.item(id),
            MethodItem::Insn(insn) if insn.op().branches()
        );
        if !old_is_branch || !to.op().branches() {
            return Err(Error::BrokenStream("replace_branch needs two branches".into()));
        }
        self.replace_opcode(id, to)
    }

    /// Delete the switch case containing the given instruction: its payload
    /// key and its label. The case's instructions stay; control reaches them
    /// only by whatever other paths exist.
    pub fn remove_switch_case(&mut self, id: ItemId) -> Result<()> {
        if !matches!(self.item(id), MethodItem::Insn(_)) {
            return Err(Error::BrokenStream("remove_switch_case on non-instruction".into()));
        }

        // The case label is the closest preceding multi-branch target.
        let mut cur = self.prev(id);
        let mut found = None;
        while let Some(p) = cur {
            if let MethodItem::Target(t) = self.item(p) {
                if let TargetKind::Case(idx) = t.kind {
                    found = Some((p, t.src, idx));
                    break;
                }
            }
            cur = self.prev(p);
        }
        let (label, switch_id, idx) = found.ok_or_else(|| {
            Error::BrokenStream("instruction is not inside a switch case".into())
        })?;

        match self.insn_mut(switch_id).and_then(|i| i.payload_mut()) {
            Some(Payload::Switch { keys }) if (idx as usize) < keys.len() => {
                let key = keys.remove(idx as usize);
                debug!("removed switch case key {}", key);
            }
            _ => return Err(Error::BrokenStream("switch payload out of sync".into())),
        }

        // Later cases of the same switch shift down one slot.
        let shifted: Vec<ItemId> = self
            .targets_of(switch_id)
            .into_iter()
            .filter(|&t| {
                matches!(
                    self.item(t),
                    MethodItem::Target(bt) if matches!(bt.kind, TargetKind::Case(i) if i > idx)
                )
            })
            .collect();
        for t in shifted {
            if let MethodItem::Target(bt) = self.item_mut(t) {
                if let TargetKind::Case(i) = bt.kind {
                    bt.kind = TargetKind::Case(i - 1);
                }
            }
        }

        self.unlink(label);
        Ok(())
    }

    /// Untyped, invariant-preserving removal. Returns the successor item, the
    /// way list erasure does, so iteration can continue.
    pub fn erase(&mut self, id: ItemId) -> Result<Option<ItemId>> {
        match self.item(id) {
            MethodItem::Insn(insn) => {
                let op = insn.op();
                if op.branches() || op.is_switch() {
                    for target in self.targets_of(id) {
                        self.unlink(target);
                    }
                }
                if let Some(marker) = self.throw_point_of(id) {
                    self.unlink(marker);
                }
                Ok(self.unlink(id))
            }
            MethodItem::Pos(_) | MethodItem::Debug(_) | MethodItem::ThrowPoint { .. } => {
                Ok(self.unlink(id))
            }
            MethodItem::Target(t) => {
                if self.contains(t.src) {
                    return Err(Error::BrokenStream(
                        "erasing a live branch's target; remove the branch instead".into(),
                    ));
                }
                Ok(self.unlink(id))
            }
            MethodItem::TryBound(tb) => {
                let catch_start = tb.catch_start;
                let kind = tb.kind;
                self.erase_try_region(id, catch_start, kind)
            }
            MethodItem::Catch(_) => Err(Error::BrokenStream(
                "erasing a catch entry; remove its try region instead".into(),
            )),
        }
    }

    fn erase_try_region(
        &mut self,
        id: ItemId,
        catch_start: ItemId,
        kind: TryKind,
    ) -> Result<Option<ItemId>> {
        // Find the partner boundary of the same region, balancing nesting of
        // regions that share the catch chain.
        let mut depth = 0i32;
        let mut partner = None;
        let ids: Vec<ItemId> = match kind {
            TryKind::Start => self.iter().skip_while(|&x| x != id).skip(1).collect(),
            TryKind::End => {
                let mut before: Vec<ItemId> = self.iter().take_while(|&x| x != id).collect();
                before.reverse();
                before
            }
        };
        let want = match kind {
            TryKind::Start => TryKind::End,
            TryKind::End => TryKind::Start,
        };
        for x in ids {
            if let MethodItem::TryBound(b) = self.item(x) {
                if b.catch_start == catch_start {
                    if b.kind == want && depth == 0 {
                        partner = Some(x);
                        break;
                    }
                    if b.kind == kind {
                        depth += 1;
                    } else {
                        depth -= 1;
                    }
                }
            }
        }
        let partner =
            partner.ok_or_else(|| Error::BrokenStream("unpaired try boundary".into()))?;
        self.unlink(partner);

        // Drop the catch chain unless another region still points into it.
        let chain_referenced = self.iter().any(|x| {
            x != id
                && matches!(self.item(x), MethodItem::TryBound(b) if b.catch_start == catch_start)
        });
        if !chain_referenced {
            let mut chain = Vec::new();
            let mut cur = Some(catch_start);
            while let Some(c) = cur {
                chain.push(c);
                cur = match self.item(c) {
                    MethodItem::Catch(e) => e.next,
                    _ => None,
                };
            }
            for c in chain {
                self.unlink(c);
            }
        }
        Ok(self.unlink(id))
    }
}
