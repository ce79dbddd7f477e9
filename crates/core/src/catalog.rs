//! Per-opcode shape of the Dalvik instruction subset the optimizer edits.
//!
//! The raw encoding tables are owned by the runtime collaborator; this module
//! adapts the slice of them the editing core needs: encoding format, operand
//! counts and bit widths, destination aliasing, and the control-flow and
//! throw behavior the CFG builder and synchronizer key off. "May throw" is a
//! catalog attribute here; nothing in the crate re-derives it from opcode
//! semantics.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

/// Dalvik opcodes handled by the editing core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Op {
    Nop = 0x00,
    Move = 0x01,
    MoveFrom16 = 0x02,
    Move16 = 0x03,
    MoveWide = 0x04,
    MoveWideFrom16 = 0x05,
    MoveWide16 = 0x06,
    MoveObject = 0x07,
    MoveObjectFrom16 = 0x08,
    MoveObject16 = 0x09,
    MoveResult = 0x0a,
    MoveResultWide = 0x0b,
    MoveResultObject = 0x0c,
    MoveException = 0x0d,
    ReturnVoid = 0x0e,
    Return = 0x0f,
    ReturnWide = 0x10,
    ReturnObject = 0x11,
    Const4 = 0x12,
    Const16 = 0x13,
    Const = 0x14,
    ConstString = 0x1a,
    ConstClass = 0x1c,
    CheckCast = 0x1f,
    InstanceOf = 0x20,
    ArrayLength = 0x21,
    NewInstance = 0x22,
    NewArray = 0x23,
    FillArrayData = 0x26,
    Throw = 0x27,
    Goto = 0x28,
    Goto16 = 0x29,
    Goto32 = 0x2a,
    PackedSwitch = 0x2b,
    SparseSwitch = 0x2c,
    CmpLong = 0x31,
    IfEq = 0x32,
    IfNe = 0x33,
    IfLt = 0x34,
    IfGe = 0x35,
    IfGt = 0x36,
    IfLe = 0x37,
    IfEqz = 0x38,
    IfNez = 0x39,
    IfLtz = 0x3a,
    IfGez = 0x3b,
    IfGtz = 0x3c,
    IfLez = 0x3d,
    Aget = 0x44,
    Aput = 0x4b,
    Iget = 0x52,
    IgetWide = 0x53,
    IgetObject = 0x54,
    Iput = 0x59,
    IputWide = 0x5a,
    IputObject = 0x5b,
    InvokeVirtual = 0x6e,
    InvokeSuper = 0x6f,
    InvokeDirect = 0x70,
    InvokeStatic = 0x71,
    InvokeInterface = 0x72,
    InvokeVirtualRange = 0x74,
    InvokeStaticRange = 0x77,
    AddInt = 0x90,
    SubInt = 0x91,
    MulInt = 0x92,
    DivInt = 0x93,
    AddInt2Addr = 0xb0,
    AddIntLit16 = 0xd0,
    AddIntLit8 = 0xd8,
}

/// Dalvik encoding formats of the opcodes above. The format fixes the width
/// in 16-bit code units and the layout of every operand field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F30t,
    F22x,
    F32x,
    F21t,
    F21s,
    F21c,
    F22t,
    F22b,
    F22c,
    F22s,
    F23x,
    F31i,
    F31t,
    F35c,
    F3rc,
}

impl Format {
    /// Encoded width in 16-bit code units (embedded payloads not included).
    pub fn units(self) -> u32 {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => 1,
            Format::F20t
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21c
            | Format::F22t
            | Format::F22b
            | Format::F22c
            | Format::F22s
            | Format::F23x => 2,
            Format::F30t
            | Format::F32x
            | Format::F31i
            | Format::F31t
            | Format::F35c
            | Format::F3rc => 3,
        }
    }
}

bitflags! {
    /// Behavioral attributes of an opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// Execution may transfer to an exception handler.
        const CAN_THROW = 0x01;
        /// Execution can continue to the textually next instruction.
        const CAN_CONTINUE = 0x02;
        /// Carries a single branch displacement operand.
        const BRANCHES = 0x04;
        /// Carries a switch payload with one displacement per case.
        const MULTI_BRANCH = 0x08;
        /// Writes a destination register.
        const SETS_REGISTER = 0x10;
        /// The destination is a register pair.
        const SETS_WIDE = 0x20;
        /// The destination field aliases source 0 (the `/2addr` layout).
        const DEST_IS_SRC0 = 0x40;
        /// Leaves its result in the hidden result register (invokes).
        const INVOKE = 0x80;
        /// Sources are a contiguous register range (`/range` layout).
        const RANGE = 0x100;
        /// Owns an out-of-line data payload (switch tables, array data).
        const PAYLOAD = 0x200;
    }
}

/// Kinds of constant-pool reference an opcode may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    String,
    Type,
    Field,
    Method,
}

/// One catalog row: everything the core needs to know about an opcode.
#[derive(Debug)]
pub struct OpInfo {
    pub op: Op,
    pub name: &'static str,
    pub format: Format,
    pub flags: OpFlags,
    pub ref_kind: Option<RefKind>,
}

static CATALOG: Lazy<HashMap<u8, OpInfo>> = Lazy::new(|| {
    use Format::*;
    use Op::*;
    use RefKind as R;

    let cont = OpFlags::CAN_CONTINUE;
    let set = OpFlags::SETS_REGISTER | cont;
    let set_wide = set | OpFlags::SETS_WIDE;
    let throwing = OpFlags::CAN_THROW | cont;
    let invoke = OpFlags::CAN_THROW | OpFlags::CAN_CONTINUE | OpFlags::INVOKE;

    let rows = [
        (Nop, "nop", F10x, cont, None),
        (Move, "move", F12x, set, None),
        (MoveFrom16, "move/from16", F22x, set, None),
        (Move16, "move/16", F32x, set, None),
        (MoveWide, "move-wide", F12x, set_wide, None),
        (MoveWideFrom16, "move-wide/from16", F22x, set_wide, None),
        (MoveWide16, "move-wide/16", F32x, set_wide, None),
        (MoveObject, "move-object", F12x, set, None),
        (MoveObjectFrom16, "move-object/from16", F22x, set, None),
        (MoveObject16, "move-object/16", F32x, set, None),
        (MoveResult, "move-result", F11x, set, None),
        (MoveResultWide, "move-result-wide", F11x, set_wide, None),
        (MoveResultObject, "move-result-object", F11x, set, None),
        (MoveException, "move-exception", F11x, set, None),
        (ReturnVoid, "return-void", F10x, OpFlags::empty(), None),
        (Return, "return", F11x, OpFlags::empty(), None),
        (ReturnWide, "return-wide", F11x, OpFlags::empty(), None),
        (ReturnObject, "return-object", F11x, OpFlags::empty(), None),
        (Const4, "const/4", F11n, set, None),
        (Const16, "const/16", F21s, set, None),
        (Const, "const", F31i, set, None),
        (ConstString, "const-string", F21c, set | OpFlags::CAN_THROW, Some(R::String)),
        (ConstClass, "const-class", F21c, set | OpFlags::CAN_THROW, Some(R::Type)),
        (CheckCast, "check-cast", F21c, throwing, Some(R::Type)),
        (InstanceOf, "instance-of", F22c, set, Some(R::Type)),
        (ArrayLength, "array-length", F12x, set | OpFlags::CAN_THROW, None),
        (NewInstance, "new-instance", F21c, set | OpFlags::CAN_THROW, Some(R::Type)),
        (NewArray, "new-array", F22c, set | OpFlags::CAN_THROW, Some(R::Type)),
        (FillArrayData, "fill-array-data", F31t, throwing | OpFlags::PAYLOAD, None),
        (Throw, "throw", F11x, OpFlags::CAN_THROW, None),
        (Goto, "goto", F10t, OpFlags::BRANCHES, None),
        (Goto16, "goto/16", F20t, OpFlags::BRANCHES, None),
        (Goto32, "goto/32", F30t, OpFlags::BRANCHES, None),
        (PackedSwitch, "packed-switch", F31t, cont | OpFlags::MULTI_BRANCH | OpFlags::PAYLOAD, None),
        (SparseSwitch, "sparse-switch", F31t, cont | OpFlags::MULTI_BRANCH | OpFlags::PAYLOAD, None),
        (CmpLong, "cmp-long", F23x, set, None),
        (IfEq, "if-eq", F22t, cont | OpFlags::BRANCHES, None),
        (IfNe, "if-ne", F22t, cont | OpFlags::BRANCHES, None),
        (IfLt, "if-lt", F22t, cont | OpFlags::BRANCHES, None),
        (IfGe, "if-ge", F22t, cont | OpFlags::BRANCHES, None),
        (IfGt, "if-gt", F22t, cont | OpFlags::BRANCHES, None),
        (IfLe, "if-le", F22t, cont | OpFlags::BRANCHES, None),
        (IfEqz, "if-eqz", F21t, cont | OpFlags::BRANCHES, None),
        (IfNez, "if-nez", F21t, cont | OpFlags::BRANCHES, None),
        (IfLtz, "if-ltz", F21t, cont | OpFlags::BRANCHES, None),
        (IfGez, "if-gez", F21t, cont | OpFlags::BRANCHES, None),
        (IfGtz, "if-gtz", F21t, cont | OpFlags::BRANCHES, None),
        (IfLez, "if-lez", F21t, cont | OpFlags::BRANCHES, None),
        (Aget, "aget", F23x, set | OpFlags::CAN_THROW, None),
        (Aput, "aput", F23x, throwing, None),
        (Iget, "iget", F22c, set | OpFlags::CAN_THROW, Some(R::Field)),
        (IgetWide, "iget-wide", F22c, set_wide | OpFlags::CAN_THROW, Some(R::Field)),
        (IgetObject, "iget-object", F22c, set | OpFlags::CAN_THROW, Some(R::Field)),
        (Iput, "iput", F22c, throwing, Some(R::Field)),
        (IputWide, "iput-wide", F22c, throwing, Some(R::Field)),
        (IputObject, "iput-object", F22c, throwing, Some(R::Field)),
        (InvokeVirtual, "invoke-virtual", F35c, invoke, Some(R::Method)),
        (InvokeSuper, "invoke-super", F35c, invoke, Some(R::Method)),
        (InvokeDirect, "invoke-direct", F35c, invoke, Some(R::Method)),
        (InvokeStatic, "invoke-static", F35c, invoke, Some(R::Method)),
        (InvokeInterface, "invoke-interface", F35c, invoke, Some(R::Method)),
        (InvokeVirtualRange, "invoke-virtual/range", F3rc, invoke | OpFlags::RANGE, Some(R::Method)),
        (InvokeStaticRange, "invoke-static/range", F3rc, invoke | OpFlags::RANGE, Some(R::Method)),
        (AddInt, "add-int", F23x, set, None),
        (SubInt, "sub-int", F23x, set, None),
        (MulInt, "mul-int", F23x, set, None),
        (DivInt, "div-int", F23x, set | OpFlags::CAN_THROW, None),
        (AddInt2Addr, "add-int/2addr", F12x, set | OpFlags::DEST_IS_SRC0, None),
        (AddIntLit16, "add-int/lit16", F22s, set, None),
        (AddIntLit8, "add-int/lit8", F22b, set, None),
    ];

    rows.into_iter()
        .map(|(op, name, format, flags, ref_kind)| {
            (
                op as u8,
                OpInfo {
                    op,
                    name,
                    format,
                    flags,
                    ref_kind,
                },
            )
        })
        .collect()
});

/// Iterate every opcode in the catalog.
pub fn all_ops() -> impl Iterator<Item = Op> {
    CATALOG.values().map(|info| info.op)
}

impl Op {
    /// Look up an opcode by its byte value.
    pub fn from_byte(byte: u8) -> Option<Op> {
        CATALOG.get(&byte).map(|info| info.op)
    }

    /// The catalog row for this opcode.
    pub fn info(self) -> &'static OpInfo {
        CATALOG
            .get(&(self as u8))
            .expect("every Op variant has a catalog row")
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn format(self) -> Format {
        self.info().format
    }

    pub fn flags(self) -> OpFlags {
        self.info().flags
    }

    /// Constant-pool reference kind carried by this opcode, if any.
    pub fn ref_kind(self) -> Option<RefKind> {
        self.info().ref_kind
    }

    pub fn may_throw(self) -> bool {
        self.flags().contains(OpFlags::CAN_THROW)
    }

    pub fn can_continue(self) -> bool {
        self.flags().contains(OpFlags::CAN_CONTINUE)
    }

    /// True for the goto and if forms (single displacement operand).
    pub fn branches(self) -> bool {
        self.flags().contains(OpFlags::BRANCHES)
    }

    /// True for packed-switch and sparse-switch.
    pub fn is_switch(self) -> bool {
        self.flags().contains(OpFlags::MULTI_BRANCH)
    }

    pub fn is_invoke(self) -> bool {
        self.flags().contains(OpFlags::INVOKE)
    }

    pub fn is_range(self) -> bool {
        self.flags().contains(OpFlags::RANGE)
    }

    pub fn has_payload(self) -> bool {
        self.flags().contains(OpFlags::PAYLOAD)
    }

    /// True for `goto` in any width.
    pub fn is_goto(self) -> bool {
        matches!(self, Op::Goto | Op::Goto16 | Op::Goto32)
    }

    pub fn is_move_result(self) -> bool {
        matches!(self, Op::MoveResult | Op::MoveResultWide | Op::MoveResultObject)
    }

    pub fn is_return(self) -> bool {
        matches!(
            self,
            Op::ReturnVoid | Op::Return | Op::ReturnWide | Op::ReturnObject
        )
    }

    pub fn is_iget(self) -> bool {
        matches!(self, Op::Iget | Op::IgetWide | Op::IgetObject)
    }

    pub fn is_iput(self) -> bool {
        matches!(self, Op::Iput | Op::IputWide | Op::IputObject)
    }

    /// Whether the opcode writes a destination register.
    pub fn has_dest(self) -> bool {
        self.flags().contains(OpFlags::SETS_REGISTER)
    }

    /// Whether the destination register is a pair.
    pub fn dest_is_wide(self) -> bool {
        self.flags().contains(OpFlags::SETS_WIDE)
    }

    /// Whether the destination field aliases source 0 (`/2addr` layout).
    pub fn dest_is_src0(self) -> bool {
        self.flags().contains(OpFlags::DEST_IS_SRC0)
    }

    /// Fixed source-operand count, or `None` when the count is carried by the
    /// instruction instance (invoke forms).
    pub fn src_count(self) -> Option<usize> {
        if self.is_invoke() {
            return None;
        }
        let count = match self.format() {
            Format::F10x | Format::F10t | Format::F20t | Format::F30t => 0,
            Format::F11n | Format::F21s | Format::F31i => 0,
            Format::F11x | Format::F21c => {
                if self.has_dest() {
                    0
                } else {
                    1
                }
            }
            Format::F12x => {
                if self.dest_is_src0() {
                    2
                } else if self.has_dest() {
                    1
                } else {
                    2
                }
            }
            Format::F22x | Format::F32x | Format::F21t | Format::F31t | Format::F22b
            | Format::F22s => 1,
            Format::F22t => 2,
            Format::F22c => {
                if self.has_dest() {
                    1
                } else {
                    2
                }
            }
            Format::F23x => {
                if self.has_dest() {
                    2
                } else {
                    3
                }
            }
            Format::F35c | Format::F3rc => unreachable!("invoke forms are variadic"),
        };
        Some(count)
    }

    /// Bit width of the destination operand field.
    pub fn dest_width(self) -> u8 {
        match self.format() {
            Format::F12x | Format::F11n | Format::F22c | Format::F22s => 4,
            Format::F11x | Format::F22x | Format::F21s | Format::F21c | Format::F31i
            | Format::F22b | Format::F23x => 8,
            Format::F32x => 16,
            _ => 0,
        }
    }

    /// Bit width of the i-th source operand field.
    pub fn src_width(self, i: usize) -> u8 {
        match self.format() {
            Format::F12x | Format::F22t => 4,
            Format::F22c | Format::F22s => 4,
            Format::F11x | Format::F21t | Format::F21c | Format::F31t => 8,
            Format::F23x => 8,
            Format::F22b => 8,
            Format::F22x => 16,
            Format::F32x => 16,
            Format::F35c => 4,
            Format::F3rc => 16,
            _ => {
                debug_assert!(false, "{} has no source {}", self.name(), i);
                0
            }
        }
    }

    /// Whether the i-th source operand is a register pair.
    pub fn src_is_wide(self, i: usize) -> bool {
        match self {
            Op::MoveWide | Op::MoveWideFrom16 | Op::MoveWide16 | Op::ReturnWide => i == 0,
            Op::IputWide => i == 0,
            Op::CmpLong => true,
            _ => false,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
