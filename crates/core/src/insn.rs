//! The decoded instruction record and its code-unit encoding.
//!
//! An [`Instruction`] stores operands unpacked: register slots, an optional
//! literal, an optional constant-pool reference, and (for the payload
//! carriers) the out-of-line data. Branch displacements are *not* stored
//! here; between decode and re-encode they exist only as target items in the
//! method stream, and the synchronizer supplies the final displacement when
//! it emits code units.

use crate::catalog::{Format, Op};
use crate::pool::{FieldRef, MethodRef, PoolRef, StringRef, TypeRef};
use crate::result::{Error, Result};
use std::fmt;

/// Out-of-line data owned by a payload-carrying instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Case keys of a packed or sparse switch. The per-case branch targets
    /// live in the method stream as target items, indexed by case position.
    Switch { keys: Vec<i32> },
    /// Raw element data of a `fill-array-data`.
    FillArray { element_width: u16, data: Vec<u8> },
}

/// A single decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    op: Op,
    dest: u16,
    srcs: Vec<u16>,
    literal: i64,
    reference: Option<PoolRef>,
    payload: Option<Payload>,
}

impl Instruction {
    /// A fresh instruction with zeroed operands. Variadic (invoke) forms
    /// start with no sources; push them with [`Instruction::with_src`] or
    /// [`Instruction::set_srcs`].
    pub fn new(op: Op) -> Self {
        let srcs = vec![0; op.src_count().unwrap_or(0)];
        Instruction {
            op,
            dest: 0,
            srcs,
            literal: 0,
            reference: None,
            payload: None,
        }
    }

    pub fn with_dest(mut self, reg: u16) -> Self {
        self.set_dest(reg);
        self
    }

    /// Append one source register. Meant for the variadic invoke forms; for
    /// fixed forms prefer `with_srcs` or `set_src`.
    pub fn with_src(mut self, reg: u16) -> Self {
        self.srcs.push(reg);
        self
    }

    pub fn with_srcs(mut self, regs: Vec<u16>) -> Self {
        self.srcs = regs;
        self
    }

    pub fn with_literal(mut self, lit: i64) -> Self {
        self.literal = lit;
        self
    }

    pub fn with_reference(mut self, r: PoolRef) -> Self {
        self.reference = Some(r);
        self
    }

    pub fn with_payload(mut self, p: Payload) -> Self {
        self.payload = Some(p);
        self
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub(crate) fn set_op(&mut self, op: Op) {
        self.op = op;
    }

    /// The destination register. For `/2addr` forms this reads source 0.
    pub fn dest(&self) -> u16 {
        if self.op.dest_is_src0() {
            self.srcs[0]
        } else {
            self.dest
        }
    }

    /// Write the destination register. For `/2addr` forms this writes
    /// source 0, so a later write to source 0 wins.
    pub fn set_dest(&mut self, reg: u16) {
        if self.op.dest_is_src0() {
            self.srcs[0] = reg;
        } else {
            self.dest = reg;
        }
    }

    pub fn src(&self, i: usize) -> u16 {
        self.srcs[i]
    }

    pub fn set_src(&mut self, i: usize, reg: u16) {
        self.srcs[i] = reg;
    }

    pub fn srcs(&self) -> &[u16] {
        &self.srcs
    }

    pub fn set_srcs(&mut self, regs: Vec<u16>) {
        self.srcs = regs;
    }

    pub fn srcs_size(&self) -> usize {
        self.srcs.len()
    }

    pub fn literal(&self) -> i64 {
        self.literal
    }

    pub fn set_literal(&mut self, lit: i64) {
        self.literal = lit;
    }

    pub fn reference(&self) -> Option<PoolRef> {
        self.reference
    }

    pub fn set_reference(&mut self, r: PoolRef) {
        self.reference = Some(r);
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        self.payload.as_mut()
    }

    pub fn set_payload(&mut self, p: Payload) {
        self.payload = Some(p);
    }

    /// Encoded width in 16-bit code units (payload data not included).
    pub fn units(&self) -> u32 {
        self.op.format().units()
    }

    fn ref_index(&self, addr: u32) -> Result<u16> {
        let r = self.reference.ok_or(Error::MissingReference {
            op: self.op.name(),
            addr,
        })?;
        let idx = r.index();
        u16::try_from(idx).map_err(|_| Error::ReferenceOutOfRange(idx))
    }

    fn checked_reg(&self, reg: u16, width: u8) -> Result<u16> {
        if (reg as u32) < (1u32 << width) {
            Ok(reg)
        } else {
            Err(Error::RegisterOutOfRange {
                reg,
                width,
                op: self.op.name(),
            })
        }
    }

    fn checked_lit(&self, width: u8) -> Result<i64> {
        let lit = self.literal;
        let min = -(1i64 << (width - 1));
        let max = (1i64 << (width - 1)) - 1;
        if lit < min || lit > max {
            Err(Error::LiteralOutOfRange { lit, width })
        } else {
            Ok(lit)
        }
    }

    /// Emit this instruction's code units. `branch` carries the displacement
    /// for branch and payload-carrying forms; the synchronizer owns its
    /// computation.
    pub fn encode(&self, addr: u32, branch: Option<i32>, out: &mut Vec<u16>) -> Result<()> {
        let opb = self.op as u8 as u16;
        let disp = || -> Result<i32> {
            branch.ok_or_else(|| Error::BrokenStream(format!("{} has no target", self.op.name())))
        };
        match self.op.format() {
            Format::F10x => out.push(opb),
            Format::F12x => {
                let a = if self.op.has_dest() { self.dest() } else { self.src(0) };
                let b = self.src(self.srcs.len() - 1);
                let a = self.checked_reg(a, 4)?;
                let b = self.checked_reg(b, 4)?;
                out.push(opb | (a << 8) | (b << 12));
            }
            Format::F11n => {
                let a = self.checked_reg(self.dest(), 4)?;
                let lit = self.checked_lit(4)?;
                out.push(opb | (a << 8) | (((lit as u16) & 0xf) << 12));
            }
            Format::F11x => {
                let reg = if self.op.has_dest() { self.dest() } else { self.src(0) };
                let reg = self.checked_reg(reg, 8)?;
                out.push(opb | (reg << 8));
            }
            Format::F10t => {
                let d = disp()?;
                if !(-128..=127).contains(&d) || d == 0 {
                    return Err(Error::BranchOutOfRange { addr, disp: d });
                }
                out.push(opb | (((d as i8 as u8) as u16) << 8));
            }
            Format::F20t => {
                let d = disp()?;
                if !(-32768..=32767).contains(&d) || d == 0 {
                    return Err(Error::BranchOutOfRange { addr, disp: d });
                }
                out.push(opb);
                out.push(d as i16 as u16);
            }
            Format::F30t => {
                let d = disp()?;
                out.push(opb);
                out.push(d as u16);
                out.push((d >> 16) as u16);
            }
            Format::F22x => {
                let a = self.checked_reg(self.dest(), 8)?;
                out.push(opb | (a << 8));
                out.push(self.src(0));
            }
            Format::F32x => {
                out.push(opb);
                out.push(self.dest());
                out.push(self.src(0));
            }
            Format::F21t => {
                let a = self.checked_reg(self.src(0), 8)?;
                let d = disp()?;
                if !(-32768..=32767).contains(&d) {
                    return Err(Error::BranchOutOfRange { addr, disp: d });
                }
                out.push(opb | (a << 8));
                out.push(d as i16 as u16);
            }
            Format::F21s => {
                let a = self.checked_reg(self.dest(), 8)?;
                let lit = self.checked_lit(16)?;
                out.push(opb | (a << 8));
                out.push(lit as i16 as u16);
            }
            Format::F21c => {
                let reg = if self.op.has_dest() { self.dest() } else { self.src(0) };
                let reg = self.checked_reg(reg, 8)?;
                out.push(opb | (reg << 8));
                out.push(self.ref_index(addr)?);
            }
            Format::F22t => {
                let a = self.checked_reg(self.src(0), 4)?;
                let b = self.checked_reg(self.src(1), 4)?;
                let d = disp()?;
                if !(-32768..=32767).contains(&d) {
                    return Err(Error::BranchOutOfRange { addr, disp: d });
                }
                out.push(opb | (a << 8) | (b << 12));
                out.push(d as i16 as u16);
            }
            Format::F22b => {
                let a = self.checked_reg(self.dest(), 8)?;
                let b = self.checked_reg(self.src(0), 8)?;
                let lit = self.checked_lit(8)?;
                out.push(opb | (a << 8));
                out.push(b | (((lit as i8 as u8) as u16) << 8));
            }
            Format::F22c => {
                let a = if self.op.has_dest() { self.dest() } else { self.src(0) };
                let b = if self.op.has_dest() { self.src(0) } else { self.src(1) };
                let a = self.checked_reg(a, 4)?;
                let b = self.checked_reg(b, 4)?;
                out.push(opb | (a << 8) | (b << 12));
                out.push(self.ref_index(addr)?);
            }
            Format::F22s => {
                let a = self.checked_reg(self.dest(), 4)?;
                let b = self.checked_reg(self.src(0), 4)?;
                let lit = self.checked_lit(16)?;
                out.push(opb | (a << 8) | (b << 12));
                out.push(lit as i16 as u16);
            }
            Format::F23x => {
                let (a, b, c) = if self.op.has_dest() {
                    (self.dest(), self.src(0), self.src(1))
                } else {
                    (self.src(0), self.src(1), self.src(2))
                };
                let a = self.checked_reg(a, 8)?;
                let b = self.checked_reg(b, 8)?;
                let c = self.checked_reg(c, 8)?;
                out.push(opb | (a << 8));
                out.push(b | (c << 8));
            }
            Format::F31i => {
                let a = self.checked_reg(self.dest(), 8)?;
                let lit = self.checked_lit(32)?;
                out.push(opb | (a << 8));
                out.push(lit as u16);
                out.push((lit >> 16) as u16);
            }
            Format::F31t => {
                let a = self.checked_reg(self.src(0), 8)?;
                let d = disp()?;
                out.push(opb | (a << 8));
                out.push(d as u16);
                out.push((d >> 16) as u16);
            }
            Format::F35c => {
                if self.srcs.len() > 5 {
                    return Err(Error::BrokenStream(format!(
                        "{} with {} arguments",
                        self.op.name(),
                        self.srcs.len()
                    )));
                }
                let mut nib = [0u16; 5];
                for (i, &r) in self.srcs.iter().enumerate() {
                    nib[i] = self.checked_reg(r, 4)?;
                }
                let count = self.srcs.len() as u16;
                out.push(opb | (nib[4] << 8) | (count << 12));
                out.push(self.ref_index(addr)?);
                out.push(nib[0] | (nib[1] << 4) | (nib[2] << 8) | (nib[3] << 12));
            }
            Format::F3rc => {
                let count = self.srcs.len();
                if count > u8::MAX as usize {
                    return Err(Error::BrokenRange(addr));
                }
                let first = self.srcs.first().copied().unwrap_or(0);
                for (i, &r) in self.srcs.iter().enumerate() {
                    if r != first + i as u16 {
                        return Err(Error::BrokenRange(addr));
                    }
                }
                out.push(opb | ((count as u16) << 8));
                out.push(self.ref_index(addr)?);
                out.push(first);
            }
        }
        Ok(())
    }
}

/// Result of decoding one instruction from the code-unit stream.
#[derive(Debug)]
pub struct Decoded {
    pub insn: Instruction,
    /// Width in code units.
    pub units: u32,
    /// Branch displacement for goto/if forms.
    pub branch: Option<i32>,
    /// Payload offset for 31t forms.
    pub payload_off: Option<i32>,
}

fn nib_a(unit: u16) -> u16 {
    (unit >> 8) & 0xf
}

fn nib_b(unit: u16) -> u16 {
    unit >> 12
}

fn byte_a(unit: u16) -> u16 {
    unit >> 8
}

fn make_ref(op: Op, idx: u16) -> Option<PoolRef> {
    use crate::catalog::RefKind;
    let idx = idx as u32;
    op.ref_kind().map(|kind| match kind {
        RefKind::String => PoolRef::String(StringRef(idx)),
        RefKind::Type => PoolRef::Type(TypeRef(idx)),
        RefKind::Field => PoolRef::Field(FieldRef(idx)),
        RefKind::Method => PoolRef::Method(MethodRef(idx)),
    })
}

/// Decode the instruction at `pos`. Payload pseudo-instructions are not
/// decoded here; callers detect and skip them first.
pub fn decode(units: &[u16], pos: usize) -> Result<Decoded> {
    let unit0 = *units.get(pos).ok_or(Error::Truncated(pos))?;
    let op = Op::from_byte((unit0 & 0xff) as u8).ok_or(Error::UnknownOpcode((unit0 & 0xff) as u8))?;
    let width = op.format().units() as usize;
    if pos + width > units.len() {
        return Err(Error::Truncated(pos));
    }
    let unit = |i: usize| units[pos + i];
    let wide32 = |i: usize| (unit(i) as u32 | ((unit(i + 1) as u32) << 16)) as i32;

    let mut insn = Instruction::new(op);
    let mut branch = None;
    let mut payload_off = None;

    match op.format() {
        Format::F10x => {}
        Format::F12x => {
            if op.dest_is_src0() {
                insn.set_src(0, nib_a(unit0));
                insn.set_src(1, nib_b(unit0));
            } else if op.has_dest() {
                insn.set_dest(nib_a(unit0));
                insn.set_src(0, nib_b(unit0));
            } else {
                insn.set_src(0, nib_a(unit0));
                insn.set_src(1, nib_b(unit0));
            }
        }
        Format::F11n => {
            insn.set_dest(nib_a(unit0));
            // sign-extend the nibble
            let nibble = (nib_b(unit0) as u8) << 4;
            insn.set_literal(((nibble as i8) >> 4) as i64);
        }
        Format::F11x => {
            if op.has_dest() {
                insn.set_dest(byte_a(unit0));
            } else {
                insn.set_src(0, byte_a(unit0));
            }
        }
        Format::F10t => branch = Some((byte_a(unit0) as u8 as i8) as i32),
        Format::F20t => branch = Some(unit(1) as i16 as i32),
        Format::F30t => branch = Some(wide32(1)),
        Format::F22x => {
            insn.set_dest(byte_a(unit0));
            insn.set_src(0, unit(1));
        }
        Format::F32x => {
            insn.set_dest(unit(1));
            insn.set_src(0, unit(2));
        }
        Format::F21t => {
            insn.set_src(0, byte_a(unit0));
            branch = Some(unit(1) as i16 as i32);
        }
        Format::F21s => {
            insn.set_dest(byte_a(unit0));
            insn.set_literal(unit(1) as i16 as i64);
        }
        Format::F21c => {
            if op.has_dest() {
                insn.set_dest(byte_a(unit0));
            } else {
                insn.set_src(0, byte_a(unit0));
            }
            insn.reference = make_ref(op, unit(1));
        }
        Format::F22t => {
            insn.set_src(0, nib_a(unit0));
            insn.set_src(1, nib_b(unit0));
            branch = Some(unit(1) as i16 as i32);
        }
        Format::F22b => {
            insn.set_dest(byte_a(unit0));
            insn.set_src(0, unit(1) & 0xff);
            insn.set_literal(((unit(1) >> 8) as u8 as i8) as i64);
        }
        Format::F22c => {
            if op.has_dest() {
                insn.set_dest(nib_a(unit0));
                insn.set_src(0, nib_b(unit0));
            } else {
                insn.set_src(0, nib_a(unit0));
                insn.set_src(1, nib_b(unit0));
            }
            insn.reference = make_ref(op, unit(1));
        }
        Format::F22s => {
            insn.set_dest(nib_a(unit0));
            insn.set_src(0, nib_b(unit0));
            insn.set_literal(unit(1) as i16 as i64);
        }
        Format::F23x => {
            if op.has_dest() {
                insn.set_dest(byte_a(unit0));
                insn.set_src(0, unit(1) & 0xff);
                insn.set_src(1, unit(1) >> 8);
            } else {
                insn.set_src(0, byte_a(unit0));
                insn.set_src(1, unit(1) & 0xff);
                insn.set_src(2, unit(1) >> 8);
            }
        }
        Format::F31i => {
            insn.set_dest(byte_a(unit0));
            insn.set_literal(wide32(1) as i64);
        }
        Format::F31t => {
            insn.set_src(0, byte_a(unit0));
            payload_off = Some(wide32(1));
        }
        Format::F35c => {
            let count = (nib_b(unit0) & 0xf) as usize;
            if count > 5 {
                return Err(Error::MalformedPayload(pos));
            }
            let g = nib_a(unit0);
            let regs = unit(2);
            let all = [
                regs & 0xf,
                (regs >> 4) & 0xf,
                (regs >> 8) & 0xf,
                (regs >> 12) & 0xf,
                g,
            ];
            insn.set_srcs(all[..count].to_vec());
            insn.reference = make_ref(op, unit(1));
        }
        Format::F3rc => {
            let count = byte_a(unit0) as usize;
            let first = unit(2);
            insn.set_srcs((0..count).map(|i| first + i as u16).collect());
            insn.reference = make_ref(op, unit(1));
        }
    }

    Ok(Decoded {
        insn,
        units: width as u32,
        branch,
        payload_off,
    })
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.name())?;
        if self.op.has_dest() && !self.op.dest_is_src0() {
            write!(f, " v{}", self.dest)?;
        }
        for &s in &self.srcs {
            write!(f, " v{}", s)?;
        }
        if matches!(
            self.op.format(),
            Format::F11n | Format::F21s | Format::F31i | Format::F22b | Format::F22s
        ) {
            write!(f, " #{}", self.literal)?;
        }
        if let Some(r) = self.reference {
            write!(f, " {}", r)?;
        }
        Ok(())
    }
}
