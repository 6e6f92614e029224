//! Append-only log of emitted instructions
//!
//! The buffer is the seam between the verifier and the host: every verified instruction is logged
//! here (so errors and patches can refer to instructions by index) and its bytes are pushed
//! through the [`HostEmitter`] in the same call. Ordering is never changed after the fact; the
//! only rewrite allowed is patching an operand in place, and only with one of identical width.

use crate::cil::host::HostEmitter;
use crate::cil::instruction::{Instruction, InstructionIndex, Opcode, Operand};
use crate::cil::metadata::{CtorId, FieldId, MethodId, MethodSig, TypeId};
use crate::util::Offset;
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;

/// Log of pending instructions plus the host connection
pub struct InstructionBuffer<'g, H> {
    host: H,
    log: Vec<(Offset, Instruction<'g>)>,
    tokens: TokenTable<'g>,
}

impl<'g, H: HostEmitter<'g>> InstructionBuffer<'g, H> {
    pub fn new(host: H) -> InstructionBuffer<'g, H> {
        InstructionBuffer {
            host,
            log: vec![],
            tokens: TokenTable::new(),
        }
    }

    /// Index the next appended instruction will receive
    pub fn next_index(&self) -> InstructionIndex {
        InstructionIndex(self.log.len())
    }

    /// Number of instructions logged so far
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Byte offset the next appended instruction will start at
    pub fn current_offset(&self) -> Offset {
        self.host.current_offset()
    }

    /// Byte offset of a previously appended instruction
    pub fn offset_of(&self, index: InstructionIndex) -> Offset {
        self.log[index.0].0
    }

    pub fn instruction(&self, index: InstructionIndex) -> &Instruction<'g> {
        &self.log[index.0].1
    }

    /// Opcode of the most recently appended instruction
    pub fn last_opcode(&self) -> Option<Opcode> {
        self.log.last().map(|(_, insn)| insn.opcode)
    }

    /// Append an instruction, pushing its bytes through the host
    pub fn append(&mut self, insn: Instruction<'g>) -> InstructionIndex {
        let index = self.next_index();
        let offset = self.host.current_offset();
        self.host.append_opcode(insn.opcode.encoding());
        let operand_bytes = self.tokens.serialize_operand(&insn.operand);
        if !operand_bytes.is_empty() {
            self.host.append_operand(&operand_bytes);
        }
        self.log.push((offset, insn));
        index
    }

    /// Rewrite the operand of a previously appended instruction
    ///
    /// The replacement must have the same encoded width as the original; branch targets do (a
    /// pending placeholder and a resolved offset are both four bytes), and nothing else is ever
    /// patched.
    pub fn patch(&mut self, index: InstructionIndex, operand: Operand<'g>) {
        let (offset, insn) = &mut self.log[index.0];
        assert_eq!(
            insn.operand.width(),
            operand.width(),
            "operand patch must preserve width"
        );
        let operand_offset = *offset + insn.opcode.encoding().len();
        insn.operand = operand;
        let bytes = self.tokens.serialize_operand(&insn.operand);
        self.host.patch(operand_offset, &bytes);
    }

    /// Direct access to the host, for scope headers and finalization
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}

/// Metadata-token interning
///
/// Types, members, strings, and standalone signatures all encode as 4-byte tokens whose high byte
/// names the metadata table. Tokens are handed out in first-use order, which is what makes two
/// identical emission sequences produce byte-identical buffers.
struct TokenTable<'g> {
    types: HashMap<TypeId<'g>, u32>,
    methods: HashMap<MemberKey<'g>, u32>,
    fields: HashMap<FieldId<'g>, u32>,
    strings: HashMap<String, u32>,
    signatures: HashMap<MethodSig<'g>, u32>,
}

/// Methods and constructors share the method table
#[derive(Hash, Eq, PartialEq)]
enum MemberKey<'g> {
    Method(MethodId<'g>),
    Ctor(CtorId<'g>),
}

const TYPE_TABLE: u32 = 0x0200_0000;
const FIELD_TABLE: u32 = 0x0400_0000;
const METHOD_TABLE: u32 = 0x0600_0000;
const SIGNATURE_TABLE: u32 = 0x1100_0000;
const STRING_TABLE: u32 = 0x7000_0000;

impl<'g> TokenTable<'g> {
    fn new() -> TokenTable<'g> {
        TokenTable {
            types: HashMap::new(),
            methods: HashMap::new(),
            fields: HashMap::new(),
            strings: HashMap::new(),
            signatures: HashMap::new(),
        }
    }

    fn type_token(&mut self, id: TypeId<'g>) -> u32 {
        let next = TYPE_TABLE | (self.types.len() as u32 + 1);
        *self.types.entry(id).or_insert(next)
    }

    fn member_token(&mut self, key: MemberKey<'g>) -> u32 {
        let next = METHOD_TABLE | (self.methods.len() as u32 + 1);
        *self.methods.entry(key).or_insert(next)
    }

    fn field_token(&mut self, id: FieldId<'g>) -> u32 {
        let next = FIELD_TABLE | (self.fields.len() as u32 + 1);
        *self.fields.entry(id).or_insert(next)
    }

    fn string_token(&mut self, literal: &str) -> u32 {
        if let Some(token) = self.strings.get(literal) {
            return *token;
        }
        let token = STRING_TABLE | (self.strings.len() as u32 + 1);
        self.strings.insert(literal.to_owned(), token);
        token
    }

    fn signature_token(&mut self, sig: &MethodSig<'g>) -> u32 {
        if let Some(token) = self.signatures.get(sig) {
            return *token;
        }
        let token = SIGNATURE_TABLE | (self.signatures.len() as u32 + 1);
        self.signatures.insert(sig.clone(), token);
        token
    }

    /// Encode an operand to its little-endian byte form
    fn serialize_operand(&mut self, operand: &Operand<'g>) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::with_capacity(operand.width());
        self.write_operand(operand, &mut out)
            .expect("writing to an in-memory buffer cannot fail");
        out
    }

    fn write_operand<W: WriteBytesExt>(
        &mut self,
        operand: &Operand<'g>,
        out: &mut W,
    ) -> std::io::Result<()> {
        match operand {
            Operand::None => {}
            Operand::Int32(v) => out.write_i32::<LittleEndian>(*v)?,
            Operand::Int64(v) => out.write_i64::<LittleEndian>(*v)?,
            Operand::Float32(v) => out.write_f32::<LittleEndian>(*v)?,
            Operand::Float64(v) => out.write_f64::<LittleEndian>(*v)?,
            Operand::String(literal) => {
                let token = self.string_token(literal);
                out.write_u32::<LittleEndian>(token)?;
            }
            Operand::Type(id) => {
                let token = self.type_token(*id);
                out.write_u32::<LittleEndian>(token)?;
            }
            Operand::Method(id) => {
                let token = self.member_token(MemberKey::Method(*id));
                out.write_u32::<LittleEndian>(token)?;
            }
            Operand::Ctor(id) => {
                let token = self.member_token(MemberKey::Ctor(*id));
                out.write_u32::<LittleEndian>(token)?;
            }
            Operand::Field(id) => {
                let token = self.field_token(*id);
                out.write_u32::<LittleEndian>(token)?;
            }
            Operand::Signature(sig) => {
                let token = self.signature_token(sig);
                out.write_u32::<LittleEndian>(token)?;
            }
            Operand::Local(index) | Operand::Arg(index) => {
                out.write_u16::<LittleEndian>(*index)?;
            }
            Operand::Target(target) => {
                out.write_i32::<LittleEndian>(target.encoded())?;
            }
            Operand::Switch(targets) => {
                out.write_u32::<LittleEndian>(targets.len() as u32)?;
                for target in targets {
                    out.write_i32::<LittleEndian>(target.encoded())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cil::host::BytecodeHost;
    use crate::cil::instruction::{BranchTarget, LabelId};

    fn buffer() -> InstructionBuffer<'static, BytecodeHost<'static>> {
        InstructionBuffer::new(BytecodeHost::new())
    }

    #[test]
    fn append_assigns_monotonic_indices_and_offsets() {
        let mut buffer = buffer();
        let i0 = buffer.append(Instruction::new(Opcode::LdcI4, Operand::Int32(5)));
        let i1 = buffer.append(Instruction::new(Opcode::Ret, Operand::None));

        assert_eq!(i0, InstructionIndex(0));
        assert_eq!(i1, InstructionIndex(1));
        assert_eq!(buffer.offset_of(i0), Offset(0));
        assert_eq!(buffer.offset_of(i1), Offset(5));
        assert_eq!(buffer.current_offset(), Offset(6));
    }

    #[test]
    fn patch_rewrites_branch_operand() {
        let mut buffer = buffer();
        let br = buffer.append(Instruction::new(
            Opcode::Br,
            Operand::Target(BranchTarget::Pending(LabelId(0))),
        ));
        buffer.append(Instruction::new(Opcode::Ret, Operand::None));
        buffer.patch(br, Operand::Target(BranchTarget::Resolved(1)));

        let body = buffer.host_mut().finalize(None, vec![], 0);
        assert_eq!(body.bytes, vec![0x38, 1, 0, 0, 0, 0x2A]);
    }

    #[test]
    fn string_tokens_are_interned() {
        let mut buffer = buffer();
        buffer.append(Instruction::new(
            Opcode::Ldstr,
            Operand::String(String::from("x")),
        ));
        buffer.append(Instruction::new(
            Opcode::Ldstr,
            Operand::String(String::from("x")),
        ));

        let body = buffer.host_mut().finalize(None, vec![], 0);
        assert_eq!(body.bytes[1..5], body.bytes[6..10]);
    }
}
