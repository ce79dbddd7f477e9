//! Builder removal.
//!
//! A builder object that never escapes the method is pure plumbing: values
//! flow in through `iput` and straight back out through `iget`. This pass
//! inlines the `build()` call, tracks per-field value locations with two
//! forward dataflows (one over setters, one over getters), rewires every use
//! of a getter result to the register the setter read from, and deletes the
//! allocation together with all field traffic. A field read before any write
//! reads null: the pass widens the register file by one and materializes the
//! null constant at method entry.

use crate::{MethodPass, Result};
use dexloom_core::dataflow::{forward_dataflow, FieldValue, FieldsRegs};
use dexloom_core::{
    build_cfg, editor, enlarge_regs, inline_bounded, CodeBody, FieldRef, InlineContext,
    Instruction, ItemId, MethodRef, MethodStream, Op, TypeRef,
};
use std::collections::HashMap;
use tracing::debug;

/// Everything the pass needs to know about one builder class.
#[derive(Debug, Clone)]
pub struct BuilderInfo {
    /// The builder's type.
    pub class: TypeRef,
    /// Its constructor.
    pub ctor: MethodRef,
    /// Its `build()` method.
    pub build: MethodRef,
    /// The `build()` body, to be inlined at call sites.
    pub build_body: CodeBody,
    /// The builder's instance fields.
    pub fields: Vec<FieldRef>,
}

/// The builder-removal pass over one method.
pub struct RemoveBuilders {
    builder: BuilderInfo,
}

impl RemoveBuilders {
    pub fn new(builder: BuilderInfo) -> Self {
        RemoveBuilders { builder }
    }
}

impl MethodPass for RemoveBuilders {
    fn name(&self) -> &'static str {
        "RemoveBuilders"
    }

    fn apply(&self, body: &mut CodeBody) -> Result<bool> {
        let changed = editor::edit(body, |stream| {
            if !inline_build(stream, &self.builder)? {
                return Ok(false);
            }
            remove_builder(stream, &self.builder)
        })?;
        Ok(changed)
    }
}

/// Track where a builder field's value lives across one instruction.
fn fields_mapping(
    insn: &Instruction,
    fregs: &mut FieldsRegs,
    builder: &BuilderInfo,
    is_setter: bool,
) {
    let op = insn.op();

    // A write clobbers any register (or wide pair half) holding a field value.
    if op.has_dest() {
        let dest = insn.dest();
        for value in fregs.field_to_reg.values_mut() {
            if let FieldValue::Reg(r) = *value {
                if r == dest || (op.dest_is_wide() && r == dest + 1) {
                    *value = FieldValue::Overwritten;
                }
            }
        }
    }

    if (is_setter && op.is_iput()) || (!is_setter && op.is_iget()) {
        if let Some(field) = insn.reference().and_then(|r| r.field()) {
            if builder.fields.contains(&field) {
                let current = if is_setter { insn.src(0) } else { insn.dest() };
                fregs.field_to_reg.insert(field, FieldValue::Reg(current));
            }
        }
    }
}

/// Inline every `build()` invoke. Refuses, before touching anything, when
/// the method holds more than one — two live instances of the same builder
/// are not handled.
fn inline_build(stream: &mut MethodStream, builder: &BuilderInfo) -> dexloom_core::Result<bool> {
    let invokes: Vec<ItemId> = stream
        .insns()
        .filter(|(_, i)| {
            i.op().is_invoke() && i.reference().and_then(|r| r.method()) == Some(builder.build)
        })
        .map(|(id, _)| id)
        .collect();
    if invokes.len() > 1 {
        debug!("method calls build() more than once; refusing");
        return Ok(false);
    }

    let mut ctx = InlineContext::new(stream, false)?;
    for invoke in invokes {
        if !inline_bounded(&mut ctx, &builder.build_body, invoke)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn remove_builder(stream: &mut MethodStream, builder: &BuilderInfo) -> dexloom_core::Result<bool> {
    let cfg = build_cfg(stream, true)?;
    let fields_in: HashMap<ItemId, FieldsRegs> = forward_dataflow(
        stream,
        &cfg,
        FieldsRegs::new(&builder.fields),
        |insn, state| fields_mapping(insn, state, builder, true),
    )?;
    let fields_out: HashMap<ItemId, FieldsRegs> = forward_dataflow(
        stream,
        &cfg,
        FieldsRegs::new(&builder.fields),
        |insn, state| fields_mapping(insn, state, builder, false),
    )?;

    let mut deletes: Vec<ItemId> = Vec::new();
    let mut replacements: Vec<(ItemId, usize, u16)> = Vec::new();
    let mut undefined: Vec<(ItemId, usize)> = Vec::new();

    for block in cfg.rpo() {
        for (id, insn) in cfg.block_insns(stream, block) {
            let op = insn.op();

            if op.is_iput() || op.is_iget() {
                let is_builder_field = insn
                    .reference()
                    .and_then(|r| r.field())
                    .map(|f| builder.fields.contains(&f))
                    .unwrap_or(false);
                if is_builder_field {
                    deletes.push(id);
                    continue;
                }
            } else if op == Op::NewInstance {
                if insn.reference().and_then(|r| r.type_ref()) == Some(builder.class) {
                    deletes.push(id);
                    continue;
                }
            } else if op.is_invoke()
                && insn.reference().and_then(|r| r.method()) == Some(builder.ctor)
            {
                deletes.push(id);
                continue;
            }

            let Some(in_state) = fields_in.get(&id) else {
                continue;
            };
            let out_state = fields_out
                .get(&id)
                .expect("both analyses cover the same reachable instructions");

            for idx in 0..insn.srcs_size() {
                let current = insn.src(idx);
                for (field, out_value) in &out_state.field_to_reg {
                    if *out_value != FieldValue::Reg(current) {
                        continue;
                    }
                    match in_state.get(*field) {
                        FieldValue::Reg(r) => replacements.push((id, idx, r)),
                        FieldValue::Undefined => undefined.push((id, idx)),
                        FieldValue::Different | FieldValue::Overwritten => {
                            debug!("no unique register holds field {:?}; aborting", field);
                            return Ok(false);
                        }
                    }
                }
            }
        }
    }

    if !undefined.is_empty() {
        let regs = stream.registers_size();
        let non_input = regs - stream.ins_size();
        if !enlarge_regs(stream, regs + 1) {
            return Ok(false);
        }
        // The slot freed right above the old non-parameter area holds null;
        // it feeds every read of a never-written field.
        stream.insert_after(
            None,
            vec![Instruction::new(Op::Const4)
                .with_dest(non_input)
                .with_literal(0)],
        )?;
        for r in replacements.iter_mut() {
            if r.2 >= non_input {
                r.2 += 1;
            }
        }
        for (id, idx) in undefined {
            replacements.push((id, idx, non_input));
        }
    }

    let changed = !deletes.is_empty() || !replacements.is_empty();
    for id in &deletes {
        stream.remove_opcode(*id)?;
    }
    for (id, idx, reg) in &replacements {
        if let Some(insn) = stream.insn_mut(*id) {
            insn.set_src(*idx, *reg);
        }
    }
    debug!(
        "builder removal: {} deletions, {} operand rewrites",
        deletes.len(),
        replacements.len()
    );
    Ok(changed)
}
