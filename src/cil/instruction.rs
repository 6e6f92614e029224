//! The instruction AST the emitter logs before handing bytes to the host
//!
//! The representation is slightly different from the raw instruction listing to make it more
//! convenient to verify and patch:
//!
//!   - Short encodings (`br.s`, `ldc.i4.s`, `ldloc.0`, ...) don't show up at all. Every
//!     instruction uses its long form, so patching a forward-branch operand never changes the
//!     width of anything. Picking minimal encodings is an optimization concern, not a
//!     correctness one.
//!
//!   - Branch operands are a [`BranchTarget`] that starts out as a label id and is rewritten in
//!     place once the label is marked and the relative offset is known.

use crate::cil::metadata::{CtorId, FieldId, MethodId, MethodSig, TypeId};

/// Index of an instruction in the emission log (not a byte offset)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InstructionIndex(pub usize);

/// Identity of a label within its owning emitter
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LabelId(pub(crate) u32);

/// A branch operand: unresolved while the target label is unmarked
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BranchTarget {
    /// Placeholder bytes were emitted; a patch is pending on this label
    Pending(LabelId),

    /// Relative offset from the end of the branching instruction
    Resolved(i32),
}

impl BranchTarget {
    /// The value that goes on the wire: a zero placeholder until the patch lands
    pub fn encoded(&self) -> i32 {
        match self {
            BranchTarget::Pending(_) => 0,
            BranchTarget::Resolved(relative) => *relative,
        }
    }
}

/// One logged instruction: an opcode and its (possibly patched) operand
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction<'g> {
    pub opcode: Opcode,
    pub operand: Operand<'g>,
}

impl<'g> Instruction<'g> {
    pub fn new(opcode: Opcode, operand: Operand<'g>) -> Instruction<'g> {
        Instruction { opcode, operand }
    }

    /// Encoded byte width: opcode bytes plus operand bytes
    pub fn width(&self) -> usize {
        self.opcode.encoding().len() + self.operand.width()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand<'g> {
    None,
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),

    /// User string; interned into a string token at serialization
    String(String),

    Type(TypeId<'g>),
    Method(MethodId<'g>),
    Ctor(CtorId<'g>),
    Field(FieldId<'g>),

    /// Standalone signature for `calli`
    Signature(MethodSig<'g>),

    /// Local slot index (long-form encoding, two bytes)
    Local(u16),

    /// Argument slot index (long-form encoding, two bytes)
    Arg(u16),

    Target(BranchTarget),

    /// Jump table: count prefix then one target per case
    Switch(Vec<BranchTarget>),
}

impl<'g> Operand<'g> {
    /// Encoded byte width of the operand alone
    ///
    /// Metadata references (types, members, strings, signatures) all encode as 4-byte tokens.
    pub fn width(&self) -> usize {
        match self {
            Operand::None => 0,
            Operand::Int32(_) | Operand::Float32(_) => 4,
            Operand::Int64(_) | Operand::Float64(_) => 8,
            Operand::String(_)
            | Operand::Type(_)
            | Operand::Method(_)
            | Operand::Ctor(_)
            | Operand::Field(_)
            | Operand::Signature(_) => 4,
            Operand::Local(_) | Operand::Arg(_) => 2,
            Operand::Target(_) => 4,
            Operand::Switch(targets) => 4 + 4 * targets.len(),
        }
    }
}

/// The opcode families the emitter can produce, with their canonical long-form encodings
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Opcode {
    Nop,
    Dup,
    Pop,

    LdcI4,
    LdcI8,
    LdcR4,
    LdcR8,
    Ldnull,
    Ldstr,

    Ldarg,
    Starg,
    Ldloc,
    Ldloca,
    Stloc,

    Ldfld,
    Ldsfld,
    Stfld,
    Stsfld,

    Call,
    Callvirt,
    Calli,
    Ldftn,
    Ret,

    Br,
    Brfalse,
    Brtrue,
    Beq,
    BneUn,
    Blt,
    Bgt,
    Switch,

    Leave,
    Endfinally,
    Throw,
    Rethrow,

    Newobj,
    Newarr,
    Ldlen,
    Ldelem,
    Stelem,

    Box,
    UnboxAny,
    Castclass,
    Isinst,

    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    ShrUn,

    Ceq,
    Cgt,
    Clt,

    ConvI1,
    ConvI2,
    ConvI4,
    ConvI8,
    ConvR4,
    ConvR8,
    ConvI,
}

impl Opcode {
    /// Encoded opcode bytes (one byte, or two for the `0xFE`-prefixed page)
    pub fn encoding(&self) -> &'static [u8] {
        match self {
            Opcode::Nop => &[0x00],
            Opcode::Dup => &[0x25],
            Opcode::Pop => &[0x26],
            Opcode::LdcI4 => &[0x20],
            Opcode::LdcI8 => &[0x21],
            Opcode::LdcR4 => &[0x22],
            Opcode::LdcR8 => &[0x23],
            Opcode::Ldnull => &[0x14],
            Opcode::Ldstr => &[0x72],
            Opcode::Ldarg => &[0xFE, 0x09],
            Opcode::Starg => &[0xFE, 0x0B],
            Opcode::Ldloc => &[0xFE, 0x0C],
            Opcode::Ldloca => &[0xFE, 0x0D],
            Opcode::Stloc => &[0xFE, 0x0E],
            Opcode::Ldfld => &[0x7B],
            Opcode::Ldsfld => &[0x7E],
            Opcode::Stfld => &[0x7D],
            Opcode::Stsfld => &[0x80],
            Opcode::Call => &[0x28],
            Opcode::Callvirt => &[0x6F],
            Opcode::Calli => &[0x29],
            Opcode::Ldftn => &[0xFE, 0x06],
            Opcode::Ret => &[0x2A],
            Opcode::Br => &[0x38],
            Opcode::Brfalse => &[0x39],
            Opcode::Brtrue => &[0x3A],
            Opcode::Beq => &[0x3B],
            Opcode::BneUn => &[0x40],
            Opcode::Blt => &[0x3F],
            Opcode::Bgt => &[0x3D],
            Opcode::Switch => &[0x45],
            Opcode::Leave => &[0xDD],
            Opcode::Endfinally => &[0xDC],
            Opcode::Throw => &[0x7A],
            Opcode::Rethrow => &[0xFE, 0x1A],
            Opcode::Newobj => &[0x73],
            Opcode::Newarr => &[0x8D],
            Opcode::Ldlen => &[0x8E],
            Opcode::Ldelem => &[0xA3],
            Opcode::Stelem => &[0xA4],
            Opcode::Box => &[0x8C],
            Opcode::UnboxAny => &[0xA5],
            Opcode::Castclass => &[0x74],
            Opcode::Isinst => &[0x75],
            Opcode::Add => &[0x58],
            Opcode::Sub => &[0x59],
            Opcode::Mul => &[0x5A],
            Opcode::Div => &[0x5B],
            Opcode::Rem => &[0x5D],
            Opcode::Neg => &[0x65],
            Opcode::And => &[0x5F],
            Opcode::Or => &[0x60],
            Opcode::Xor => &[0x61],
            Opcode::Not => &[0x66],
            Opcode::Shl => &[0x62],
            Opcode::Shr => &[0x63],
            Opcode::ShrUn => &[0x64],
            Opcode::Ceq => &[0xFE, 0x01],
            Opcode::Cgt => &[0xFE, 0x02],
            Opcode::Clt => &[0xFE, 0x04],
            Opcode::ConvI1 => &[0x67],
            Opcode::ConvI2 => &[0x68],
            Opcode::ConvI4 => &[0x69],
            Opcode::ConvI8 => &[0x6A],
            Opcode::ConvR4 => &[0x6B],
            Opcode::ConvR8 => &[0x6C],
            Opcode::ConvI => &[0xD3],
        }
    }

    /// Assembly mnemonic, used in diagnostics
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Dup => "dup",
            Opcode::Pop => "pop",
            Opcode::LdcI4 => "ldc.i4",
            Opcode::LdcI8 => "ldc.i8",
            Opcode::LdcR4 => "ldc.r4",
            Opcode::LdcR8 => "ldc.r8",
            Opcode::Ldnull => "ldnull",
            Opcode::Ldstr => "ldstr",
            Opcode::Ldarg => "ldarg",
            Opcode::Starg => "starg",
            Opcode::Ldloc => "ldloc",
            Opcode::Ldloca => "ldloca",
            Opcode::Stloc => "stloc",
            Opcode::Ldfld => "ldfld",
            Opcode::Ldsfld => "ldsfld",
            Opcode::Stfld => "stfld",
            Opcode::Stsfld => "stsfld",
            Opcode::Call => "call",
            Opcode::Callvirt => "callvirt",
            Opcode::Calli => "calli",
            Opcode::Ldftn => "ldftn",
            Opcode::Ret => "ret",
            Opcode::Br => "br",
            Opcode::Brfalse => "brfalse",
            Opcode::Brtrue => "brtrue",
            Opcode::Beq => "beq",
            Opcode::BneUn => "bne.un",
            Opcode::Blt => "blt",
            Opcode::Bgt => "bgt",
            Opcode::Switch => "switch",
            Opcode::Leave => "leave",
            Opcode::Endfinally => "endfinally",
            Opcode::Throw => "throw",
            Opcode::Rethrow => "rethrow",
            Opcode::Newobj => "newobj",
            Opcode::Newarr => "newarr",
            Opcode::Ldlen => "ldlen",
            Opcode::Ldelem => "ldelem",
            Opcode::Stelem => "stelem",
            Opcode::Box => "box",
            Opcode::UnboxAny => "unbox.any",
            Opcode::Castclass => "castclass",
            Opcode::Isinst => "isinst",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Rem => "rem",
            Opcode::Neg => "neg",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Not => "not",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::ShrUn => "shr.un",
            Opcode::Ceq => "ceq",
            Opcode::Cgt => "cgt",
            Opcode::Clt => "clt",
            Opcode::ConvI1 => "conv.i1",
            Opcode::ConvI2 => "conv.i2",
            Opcode::ConvI4 => "conv.i4",
            Opcode::ConvI8 => "conv.i8",
            Opcode::ConvR4 => "conv.r4",
            Opcode::ConvR8 => "conv.r8",
            Opcode::ConvI => "conv.i",
        }
    }

    /// Does the instruction transfer control to a label operand?
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Opcode::Br
                | Opcode::Brfalse
                | Opcode::Brtrue
                | Opcode::Beq
                | Opcode::BneUn
                | Opcode::Blt
                | Opcode::Bgt
                | Opcode::Switch
                | Opcode::Leave
        )
    }

    /// Does control never fall through to the next instruction?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Br
                | Opcode::Ret
                | Opcode::Throw
                | Opcode::Rethrow
                | Opcode::Leave
                | Opcode::Endfinally
        )
    }
}
