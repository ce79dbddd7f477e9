//! The packed method body as exchanged with the DEX file collaborator.
//!
//! A [`CodeBody`] is the bit-faithful in-memory form of a `code_item`:
//! register file shape, raw 16-bit code units, the try/handler table, and
//! the debug line program. The editing core decodes one of these into a
//! method stream and re-encodes a fresh one on synchronization.

use crate::pool::{StringRef, TypeRef};

/// A (source file, line) pin applying to the instruction that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub file: Option<StringRef>,
    pub line: u32,
}

/// A debug-program step other than position and pc bookkeeping. The core
/// treats these as opaque: they are carried through editing verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugStep {
    StartLocal { reg: u16, name: StringRef },
    EndLocal { reg: u16 },
    RestartLocal { reg: u16 },
    PrologueEnd,
    EpilogueBegin,
    SetFile(StringRef),
}

/// One event of the debug line program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEvent {
    /// Move the address cursor forward by this many code units.
    AdvancePc(u32),
    /// Pin a source position at the cursor.
    Position(SourcePosition),
    /// An opaque step at the cursor.
    Step(DebugStep),
}

/// One entry of the try/handler table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryItem {
    /// First covered instruction, in code units.
    pub start_addr: u32,
    /// Number of covered code units.
    pub insn_count: u16,
    /// Typed handlers in declaration order: (exception type, handler address).
    pub handlers: Vec<(TypeRef, u32)>,
    /// Catch-all handler address, if any; always last in the chain.
    pub catch_all: Option<u32>,
}

/// A packed method body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeBody {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    /// Raw instruction stream, including embedded payloads.
    pub insns: Vec<u16>,
    pub tries: Vec<TryItem>,
    pub debug: Vec<DebugEvent>,
}

impl CodeBody {
    /// An empty body with the given register file shape.
    pub fn new(registers_size: u16, ins_size: u16) -> Self {
        CodeBody {
            registers_size,
            ins_size,
            ..Default::default()
        }
    }
}
