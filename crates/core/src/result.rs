//! Core result and error types.

use thiserror::Error;

/// Core error type encompassing all method-body editing failures.
#[derive(Debug, Error)]
pub enum Error {
    /// A conditional branch displacement exceeds the widest encoding the
    /// instruction has; there is no longer form to widen into.
    #[error("branch at {addr:#x} cannot reach its target (displacement {disp})")]
    BranchOutOfRange {
        /// Address of the offending branch instruction, in code units.
        addr: u32,
        /// The displacement that failed to encode.
        disp: i32,
    },

    /// Range-form invoke registers are no longer contiguous after rewriting.
    #[error("range invoke at {0:#x} has non-contiguous registers")]
    BrokenRange(u32),

    /// An edit or decode would leave the item stream with dangling or
    /// inconsistent cross-references.
    #[error("broken method stream: {0}")]
    BrokenStream(String),

    /// The caller's register file cannot be widened to the requested size.
    #[error("cannot widen register file to {0} registers")]
    CannotWiden(u16),

    /// The method has no instructions, so no entry block exists.
    #[error("method has no instructions")]
    EmptyMethod,

    /// A literal does not fit the immediate field of its encoding.
    #[error("literal {lit} does not fit a {width}-bit immediate")]
    LiteralOutOfRange {
        /// The literal value.
        lit: i64,
        /// Width of the immediate field in bits.
        width: u8,
    },

    /// Embedded payload data (switch table or array data) is malformed.
    #[error("malformed payload at unit {0}")]
    MalformedPayload(usize),

    /// An instruction that requires a constant-pool reference has none.
    #[error("{op} at {addr:#x} is missing its pool reference")]
    MissingReference {
        /// Opcode name.
        op: &'static str,
        /// Instruction address in code units.
        addr: u32,
    },

    /// A branch target, try entry or debug event named an address with no
    /// instruction.
    #[error("no instruction at address {0:#x}")]
    NoInstructionAt(u32),

    /// An invoke passed to the tail-call inliner is not in tail position.
    #[error("invoke at {0:#x} is not in tail position")]
    NotTailCall(u32),

    /// A constant-pool index does not fit its 16-bit instruction field.
    #[error("pool index {0} does not fit a 16-bit reference field")]
    ReferenceOutOfRange(u32),

    /// A register id does not fit the operand field of its instruction.
    #[error("register v{reg} does not fit a {width}-bit operand of {op}")]
    RegisterOutOfRange {
        /// The register id.
        reg: u16,
        /// Width of the operand field in bits.
        width: u8,
        /// Opcode name.
        op: &'static str,
    },

    /// A CFG view was consulted after the stream it was built from changed.
    #[error("control-flow graph is stale; rebuild it after editing")]
    StaleCfg,

    /// The code units end in the middle of an instruction or payload.
    #[error("truncated code stream at unit {0}")]
    Truncated(usize),

    /// A try region covers more instructions than its count field can hold.
    #[error("try region at {0:#x} is too long to encode")]
    TryRangeTooLong(u32),

    /// An opcode byte with no catalog entry.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}

/// Core result type.
pub type Result<T> = std::result::Result<T, Error>;
