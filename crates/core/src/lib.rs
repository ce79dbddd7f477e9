//! Method-body editing core for DEX bytecode.
//!
//! Optimization passes mutate a method as an item stream — instructions,
//! branch labels, try boundaries, catch chains, debug entries and throw
//! markers — without maintaining branch offsets, try ranges or debug
//! addressing by hand. [`balloon::balloon`] decodes a packed body into that
//! form; [`sync::sync`] re-encodes it, reassigning addresses, widening short
//! branches to fit, and rebuilding the try and debug tables. CFG and
//! dataflow views are derived on demand and go stale on edit.

pub mod balloon;
pub mod body;
pub mod catalog;
pub mod cfg;
pub mod dataflow;
pub mod edit;
pub mod editor;
pub mod inline;
pub mod insn;
pub mod liveness;
pub mod pool;
pub mod result;
pub mod stream;
pub mod sync;

pub use balloon::balloon;
pub use body::{CodeBody, DebugEvent, DebugStep, SourcePosition, TryItem};
pub use catalog::{Format, Op, OpFlags};
pub use cfg::{build_cfg, BlockData, Cfg, EdgeKind};
pub use dataflow::{forward_dataflow, AnalysisState, FieldValue, FieldsRegs, TaintedRegs};
pub use editor::{edit, MethodEditor};
pub use inline::{enlarge_regs, inline_bounded, inline_tail_call, InlineContext};
pub use insn::{Instruction, Payload};
pub use liveness::live_out_map;
pub use pool::{FieldRef, MethodRef, PoolRef, StringRef, TypeRef};
pub use result::{Error, Result};
pub use stream::{
    BranchTarget, CatchEntry, ItemId, MethodItem, MethodStream, TargetKind, TryBoundary, TryKind,
};
pub use sync::sync;
