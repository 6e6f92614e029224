use crate::cil::buffer::InstructionBuffer;
use crate::cil::emit::scopes::{ScopeId, ScopeKind};
use crate::cil::emit::state::{Label, Local, LocalData, VerifierState};
use crate::cil::errors::{Error, ErrorKind};
use crate::cil::host::HostEmitter;
use crate::cil::instruction::{
    BranchTarget, Instruction, InstructionIndex, LabelId, Opcode, Operand,
};
use crate::cil::metadata::{
    Assignable, CtorId, FieldId, MethodId, MethodSig, SystemLibrary, TypeGraph, TypeId,
};
use crate::cil::names::Name;
use crate::cil::stack::AbstractStack;
use crate::cil::types::{CilType, StackType};

/// Verifying emitter for one method body
///
/// Callers describe a method as a sequence of instruction calls; every call is checked against
/// the abstract stack and the structural rules before any bytes reach the host, so the first
/// malformed instruction is rejected at its own call site instead of surfacing as an opaque
/// failure when the body is materialized.
///
/// ### Poisoning
///
/// The first error leaves the verifier state meaningless, so the emitter records it and refuses
/// all further work, citing the original failure. Fix the offending call and build a fresh
/// emitter; there is nothing to salvage from a partially verified stream.
///
/// ### Ownership
///
/// The [`Label`] and [`Local`] tokens an emitter hands out are only valid on that emitter.
/// Presenting a token to a different emitter fails with [`ErrorKind::OwnershipError`] rather than
/// silently corrupting bookkeeping.
pub struct Emitter<'g, H: HostEmitter<'g>> {
    graph: &'g TypeGraph<'g>,
    system: &'g SystemLibrary<'g>,
    signature: MethodSig<'g>,
    state: VerifierState<'g>,
    buffer: InstructionBuffer<'g, H>,
    id: u64,
    poisoned: Option<Error>,
    finalized: bool,
    delegate: Option<H::Delegate>,
}

impl<'g, H: HostEmitter<'g>> Emitter<'g, H> {
    /// New emitter for a method with the given signature
    pub fn new(
        graph: &'g TypeGraph<'g>,
        system: &'g SystemLibrary<'g>,
        signature: MethodSig<'g>,
        host: H,
    ) -> Emitter<'g, H> {
        let args = signature.parameters.clone();
        Emitter {
            graph,
            system,
            signature,
            state: VerifierState::new(args),
            buffer: InstructionBuffer::new(host),
            id: graph.next_emitter_id(),
            poisoned: None,
            finalized: false,
            delegate: None,
        }
    }

    /// The abstract stack right now, rendered bottom first (diagnostic surface)
    pub fn stack_shape(&self) -> Vec<String> {
        self.state.stack.render()
    }

    /// Number of instructions emitted so far
    pub fn instruction_count(&self) -> usize {
        self.buffer.len()
    }

    /// How many branches have been recorded against the label so far
    pub fn incoming_branches(&self, label: Label) -> Result<usize, Error> {
        let id = self.check_label(label)?;
        Ok(self.state.label(id).incoming.len())
    }

    /// Number of distinct stack shapes that have flowed into branch targets
    pub fn recorded_branch_shapes(&self) -> usize {
        self.state.recorded_branch_shapes()
    }

    fn fail(&self, kind: ErrorKind) -> Error {
        self.state.fail(&self.buffer, kind)
    }

    fn invalid(&self, reason: String) -> Error {
        self.fail(ErrorKind::InvalidOperation { reason })
    }

    /// Refuse work on a poisoned or finalized emitter
    fn ready(&self) -> Result<(), Error> {
        if let Some(original) = &self.poisoned {
            return Err(self.invalid(format!(
                "emitter was poisoned by an earlier error: {}",
                original.kind
            )));
        }
        if self.finalized {
            return Err(self.invalid(String::from(
                "emitter is finalized; no further mutation is allowed",
            )));
        }
        Ok(())
    }

    /// Run one mutating operation, poisoning the emitter on failure
    fn checked<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.ready()?;
        match op(self) {
            Ok(value) => Ok(value),
            Err(error) => {
                self.poisoned = Some(error.clone());
                Err(error)
            }
        }
    }

    fn update(
        &mut self,
        insn: Instruction<'g>,
        expected_pops: &[StackType<'g>],
        pushed: &[StackType<'g>],
    ) -> Result<InstructionIndex, Error> {
        self.state
            .update_state(&mut self.buffer, insn, expected_pops, pushed)
    }

    /// The top `n` stack types (top first), or a stack-underflow error
    fn peek(&self, n: usize) -> Result<Vec<StackType<'g>>, Error> {
        self.state.stack.top_n(n).ok_or_else(|| {
            self.fail(ErrorKind::StackUnderflow {
                required: n,
                have: self.state.stack.depth(),
            })
        })
    }

    fn check_label(&self, label: Label) -> Result<LabelId, Error> {
        // A foreign label's id may not even index into this emitter's tables
        if label.owner != self.id {
            return Err(self.fail(ErrorKind::OwnershipError {
                token: format!("label L{}", label.id.0),
            }));
        }
        Ok(label.id)
    }

    fn check_local(&self, local: Local) -> Result<u16, Error> {
        if local.owner != self.id || (local.index as usize) >= self.state.locals.len() {
            return Err(self.fail(ErrorKind::OwnershipError {
                token: format!("local #{}", local.index),
            }));
        }
        Ok(local.index)
    }

    /// Graph entry usable as a metadata-token operand for this type
    fn type_entry(&self, ty: &CilType<'g>) -> Result<TypeId<'g>, Error> {
        match ty {
            CilType::Base(base) => Ok(self.system.boxed_base(*base)),
            CilType::Ref(id) => Ok(*id),
            CilType::ByRef(_) => Err(self.invalid(format!(
                "{} is a managed pointer and has no type token",
                ty
            ))),
        }
    }

    // ------------------------------------------------------------------------------------------
    // Constants

    pub fn load_constant_i32(&mut self, value: i32) -> Result<(), Error> {
        self.checked(|e| {
            e.update(
                Instruction::new(Opcode::LdcI4, Operand::Int32(value)),
                &[],
                &[StackType::Int32],
            )
            .map(|_| ())
        })
    }

    pub fn load_constant_i64(&mut self, value: i64) -> Result<(), Error> {
        self.checked(|e| {
            e.update(
                Instruction::new(Opcode::LdcI8, Operand::Int64(value)),
                &[],
                &[StackType::Int64],
            )
            .map(|_| ())
        })
    }

    pub fn load_constant_f32(&mut self, value: f32) -> Result<(), Error> {
        self.checked(|e| {
            e.update(
                Instruction::new(Opcode::LdcR4, Operand::Float32(value)),
                &[],
                &[StackType::Float32],
            )
            .map(|_| ())
        })
    }

    pub fn load_constant_f64(&mut self, value: f64) -> Result<(), Error> {
        self.checked(|e| {
            e.update(
                Instruction::new(Opcode::LdcR8, Operand::Float64(value)),
                &[],
                &[StackType::Float64],
            )
            .map(|_| ())
        })
    }

    pub fn load_constant_string(&mut self, value: &str) -> Result<(), Error> {
        self.checked(|e| {
            let string = StackType::Reference(e.system.string);
            e.update(
                Instruction::new(Opcode::Ldstr, Operand::String(value.to_owned())),
                &[],
                &[string],
            )
            .map(|_| ())
        })
    }

    pub fn load_null(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            e.update(
                Instruction::new(Opcode::Ldnull, Operand::None),
                &[],
                &[StackType::NullLiteral],
            )
            .map(|_| ())
        })
    }

    // ------------------------------------------------------------------------------------------
    // Plain stack manipulation

    pub fn nop(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            e.update(Instruction::new(Opcode::Nop, Operand::None), &[], &[])
                .map(|_| ())
        })
    }

    pub fn duplicate(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            e.update(
                Instruction::new(Opcode::Dup, Operand::None),
                &[top.clone()],
                &[top.clone(), top],
            )
            .map(|_| ())
        })
    }

    pub fn pop(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            e.update(Instruction::new(Opcode::Pop, Operand::None), &[top], &[])
                .map(|_| ())
        })
    }

    // ------------------------------------------------------------------------------------------
    // Arithmetic, logic, comparisons, conversions

    pub fn add(&mut self) -> Result<(), Error> {
        self.binary_arithmetic(Opcode::Add)
    }

    pub fn subtract(&mut self) -> Result<(), Error> {
        self.binary_arithmetic(Opcode::Sub)
    }

    pub fn multiply(&mut self) -> Result<(), Error> {
        self.binary_arithmetic(Opcode::Mul)
    }

    pub fn divide(&mut self) -> Result<(), Error> {
        self.binary_arithmetic(Opcode::Div)
    }

    pub fn remainder(&mut self) -> Result<(), Error> {
        self.binary_arithmetic(Opcode::Rem)
    }

    pub fn and(&mut self) -> Result<(), Error> {
        self.binary_bitwise(Opcode::And)
    }

    pub fn or(&mut self) -> Result<(), Error> {
        self.binary_bitwise(Opcode::Or)
    }

    pub fn xor(&mut self) -> Result<(), Error> {
        self.binary_bitwise(Opcode::Xor)
    }

    pub fn shift_left(&mut self) -> Result<(), Error> {
        self.shift(Opcode::Shl)
    }

    pub fn shift_right(&mut self) -> Result<(), Error> {
        self.shift(Opcode::Shr)
    }

    pub fn shift_right_unsigned(&mut self) -> Result<(), Error> {
        self.shift(Opcode::ShrUn)
    }

    pub fn negate(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            if !top.is_numeric() {
                return Err(e.mismatch(Opcode::Neg, 0, "a numeric type", &top));
            }
            e.update(
                Instruction::new(Opcode::Neg, Operand::None),
                &[top.clone()],
                &[top],
            )
            .map(|_| ())
        })
    }

    pub fn not(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            if !top.is_integer() {
                return Err(e.mismatch(Opcode::Not, 0, "an integer type", &top));
            }
            e.update(
                Instruction::new(Opcode::Not, Operand::None),
                &[top.clone()],
                &[top],
            )
            .map(|_| ())
        })
    }

    pub fn compare_equal(&mut self) -> Result<(), Error> {
        self.comparison(Opcode::Ceq, true)
    }

    pub fn compare_greater_than(&mut self) -> Result<(), Error> {
        self.comparison(Opcode::Cgt, false)
    }

    pub fn compare_less_than(&mut self) -> Result<(), Error> {
        self.comparison(Opcode::Clt, false)
    }

    pub fn convert_int8(&mut self) -> Result<(), Error> {
        self.convert(Opcode::ConvI1, StackType::Int32)
    }

    pub fn convert_int16(&mut self) -> Result<(), Error> {
        self.convert(Opcode::ConvI2, StackType::Int32)
    }

    pub fn convert_int32(&mut self) -> Result<(), Error> {
        self.convert(Opcode::ConvI4, StackType::Int32)
    }

    pub fn convert_int64(&mut self) -> Result<(), Error> {
        self.convert(Opcode::ConvI8, StackType::Int64)
    }

    pub fn convert_float32(&mut self) -> Result<(), Error> {
        self.convert(Opcode::ConvR4, StackType::Float32)
    }

    pub fn convert_float64(&mut self) -> Result<(), Error> {
        self.convert(Opcode::ConvR8, StackType::Float64)
    }

    pub fn convert_native_int(&mut self) -> Result<(), Error> {
        self.convert(Opcode::ConvI, StackType::NativeInt)
    }

    fn mismatch(
        &self,
        opcode: Opcode,
        position: usize,
        expected: &str,
        actual: &StackType<'g>,
    ) -> Error {
        self.fail(ErrorKind::TypeMismatch {
            opcode: opcode.mnemonic(),
            position,
            expected: expected.to_owned(),
            actual: actual.to_string(),
        })
    }

    fn binary_arithmetic(&mut self, opcode: Opcode) -> Result<(), Error> {
        self.checked(|e| {
            let operands = e.peek(2)?;
            let (top, below) = (&operands[0], &operands[1]);
            let result = arithmetic_result(below, top)
                .ok_or_else(|| e.mismatch(opcode, 0, &below.to_string(), top))?;
            e.update(
                Instruction::new(opcode, Operand::None),
                &[top.clone(), below.clone()],
                &[result],
            )
            .map(|_| ())
        })
    }

    fn binary_bitwise(&mut self, opcode: Opcode) -> Result<(), Error> {
        self.checked(|e| {
            let operands = e.peek(2)?;
            let (top, below) = (&operands[0], &operands[1]);
            if !top.is_integer() {
                return Err(e.mismatch(opcode, 0, "an integer type", top));
            }
            if !below.is_integer() {
                return Err(e.mismatch(opcode, 1, "an integer type", below));
            }
            let result = arithmetic_result(below, top)
                .ok_or_else(|| e.mismatch(opcode, 0, &below.to_string(), top))?;
            e.update(
                Instruction::new(opcode, Operand::None),
                &[top.clone(), below.clone()],
                &[result],
            )
            .map(|_| ())
        })
    }

    fn shift(&mut self, opcode: Opcode) -> Result<(), Error> {
        self.checked(|e| {
            let operands = e.peek(2)?;
            let (amount, value) = (&operands[0], &operands[1]);
            if !matches!(amount, StackType::Int32 | StackType::NativeInt) {
                return Err(e.mismatch(opcode, 0, "int32 or native int", amount));
            }
            if !value.is_integer() {
                return Err(e.mismatch(opcode, 1, "an integer type", value));
            }
            e.update(
                Instruction::new(opcode, Operand::None),
                &[amount.clone(), value.clone()],
                &[value.clone()],
            )
            .map(|_| ())
        })
    }

    fn comparison(&mut self, opcode: Opcode, references_ok: bool) -> Result<(), Error> {
        self.checked(|e| {
            let operands = e.peek(2)?;
            let (top, below) = (&operands[0], &operands[1]);
            let comparable = below.comparable_with(top)
                && (references_ok || (!below.is_reference() && !top.is_reference()));
            if !comparable {
                return Err(e.mismatch(opcode, 0, &below.to_string(), top));
            }
            e.update(
                Instruction::new(opcode, Operand::None),
                &[top.clone(), below.clone()],
                &[StackType::Int32],
            )
            .map(|_| ())
        })
    }

    fn convert(&mut self, opcode: Opcode, result: StackType<'g>) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            if !top.is_numeric() {
                return Err(e.mismatch(opcode, 0, "a numeric type", &top));
            }
            e.update(Instruction::new(opcode, Operand::None), &[top], &[result])
                .map(|_| ())
        })
    }

    // ------------------------------------------------------------------------------------------
    // Locals and arguments

    /// Declare a local variable slot, optionally with a name for diagnostics
    pub fn declare_local(
        &mut self,
        ty: CilType<'g>,
        name: Option<&str>,
    ) -> Result<Local, Error> {
        self.checked(|e| {
            if matches!(name, Some("")) {
                return Err(e.fail(ErrorKind::ArgumentNull { param: "name" }));
            }
            let index = e.state.locals.len();
            if index > u16::MAX as usize {
                return Err(e.invalid(String::from("too many locals declared")));
            }
            e.state.locals.push(LocalData {
                name: name.map(str::to_owned),
                ty,
                initialized: false,
            });
            Ok(Local {
                index: index as u16,
                owner: e.id,
            })
        })
    }

    pub fn load_local(&mut self, local: Local) -> Result<(), Error> {
        self.checked(|e| {
            let index = e.check_local(local)?;
            let data = &e.state.locals[index as usize];
            if !data.initialized {
                let shown = data.name.clone().unwrap_or_else(|| format!("#{}", index));
                return Err(e.invalid(format!("local {} is loaded before any store", shown)));
            }
            let pushed = data.ty.stack_type();
            e.update(
                Instruction::new(Opcode::Ldloc, Operand::Local(index)),
                &[],
                &[pushed],
            )
            .map(|_| ())
        })
    }

    pub fn store_local(&mut self, local: Local) -> Result<(), Error> {
        self.checked(|e| {
            let index = e.check_local(local)?;
            let expected = e.state.locals[index as usize].ty.stack_type();
            e.update(
                Instruction::new(Opcode::Stloc, Operand::Local(index)),
                &[expected],
                &[],
            )?;
            e.state.locals[index as usize].initialized = true;
            Ok(())
        })
    }

    /// Push a managed pointer to the local's slot
    ///
    /// Taking the address counts as initializing: the pointer may be written through before the
    /// next load.
    pub fn load_local_address(&mut self, local: Local) -> Result<(), Error> {
        self.checked(|e| {
            let index = e.check_local(local)?;
            let pointee = e.state.locals[index as usize].ty.clone();
            e.update(
                Instruction::new(Opcode::Ldloca, Operand::Local(index)),
                &[],
                &[StackType::ManagedPointer(Box::new(pointee))],
            )?;
            e.state.locals[index as usize].initialized = true;
            Ok(())
        })
    }

    pub fn load_argument(&mut self, index: u16) -> Result<(), Error> {
        self.checked(|e| {
            let ty = e
                .state
                .args
                .get(index as usize)
                .ok_or_else(|| {
                    e.invalid(format!(
                        "argument index {} out of range ({} declared)",
                        index,
                        e.state.args.len()
                    ))
                })?
                .clone();
            e.update(
                Instruction::new(Opcode::Ldarg, Operand::Arg(index)),
                &[],
                &[ty.stack_type()],
            )
            .map(|_| ())
        })
    }

    pub fn store_argument(&mut self, index: u16) -> Result<(), Error> {
        self.checked(|e| {
            let ty = e
                .state
                .args
                .get(index as usize)
                .ok_or_else(|| {
                    e.invalid(format!(
                        "argument index {} out of range ({} declared)",
                        index,
                        e.state.args.len()
                    ))
                })?
                .clone();
            e.update(
                Instruction::new(Opcode::Starg, Operand::Arg(index)),
                &[ty.stack_type()],
                &[],
            )
            .map(|_| ())
        })
    }

    // ------------------------------------------------------------------------------------------
    // Fields

    pub fn load_field(&mut self, field: FieldId<'g>) -> Result<(), Error> {
        self.checked(|e| {
            let pushed = field.field_type.stack_type();
            if field.is_static() {
                e.update(
                    Instruction::new(Opcode::Ldsfld, Operand::Field(field)),
                    &[],
                    &[pushed],
                )
                .map(|_| ())
            } else {
                let receiver = e.receiver_pop(field.class, 0, 1, Opcode::Ldfld)?;
                e.update(
                    Instruction::new(Opcode::Ldfld, Operand::Field(field)),
                    &[receiver],
                    &[pushed],
                )
                .map(|_| ())
            }
        })
    }

    pub fn store_field(&mut self, field: FieldId<'g>) -> Result<(), Error> {
        self.checked(|e| {
            let expected = field.field_type.stack_type();
            if field.is_static() {
                e.update(
                    Instruction::new(Opcode::Stsfld, Operand::Field(field)),
                    &[expected],
                    &[],
                )
                .map(|_| ())
            } else {
                let receiver = e.receiver_pop(field.class, 1, 2, Opcode::Stfld)?;
                e.update(
                    Instruction::new(Opcode::Stfld, Operand::Field(field)),
                    &[expected, receiver],
                    &[],
                )
                .map(|_| ())
            }
        })
    }

    /// Validate the stack slot holding a member-access receiver and return the type to pop
    ///
    /// Reference-type owners take an object reference; value-type owners take the value itself or
    /// a managed pointer to it.
    fn receiver_pop(
        &self,
        owner: TypeId<'g>,
        position: usize,
        total_pops: usize,
        opcode: Opcode,
    ) -> Result<StackType<'g>, Error> {
        let operands = self.peek(total_pops)?;
        let actual = &operands[position];
        let ok = if owner.is_value_type() {
            match actual {
                StackType::Value(id) => *id == owner,
                StackType::ManagedPointer(pointee) => **pointee == CilType::Ref(owner),
                _ => false,
            }
        } else {
            actual.is_assignable(&StackType::Reference(owner))
        };
        if ok {
            Ok(actual.clone())
        } else {
            Err(self.mismatch(opcode, position, owner.name.as_str(), actual))
        }
    }

    // ------------------------------------------------------------------------------------------
    // Calls

    pub fn call(&mut self, method: MethodId<'g>) -> Result<(), Error> {
        self.checked(|e| e.emit_call(Opcode::Call, method))
    }

    /// Call through the virtual dispatch slot; the method must be an instance method
    pub fn call_virtual(&mut self, method: MethodId<'g>) -> Result<(), Error> {
        self.checked(|e| {
            if method.is_static() {
                return Err(e.invalid(format!(
                    "callvirt requires an instance method, but {:?} is static",
                    method
                )));
            }
            e.emit_call(Opcode::Callvirt, method)
        })
    }

    fn emit_call(&mut self, opcode: Opcode, method: MethodId<'g>) -> Result<(), Error> {
        // Arguments pop in reverse of declaration order, then the receiver (if any)
        let mut expected: Vec<StackType<'g>> = method
            .signature
            .parameters
            .iter()
            .rev()
            .map(CilType::stack_type)
            .collect();
        if !method.is_static() {
            let receiver = if opcode == Opcode::Callvirt {
                // A virtual call on a value type would need boxing or a constrained prefix
                self.peek(expected.len() + 1)?;
                StackType::Reference(method.class)
            } else {
                self.receiver_pop(method.class, expected.len(), expected.len() + 1, opcode)?
            };
            expected.push(receiver);
        }
        let pushed: Vec<StackType<'g>> = method
            .signature
            .return_type
            .iter()
            .map(CilType::stack_type)
            .collect();
        self.update(
            Instruction::new(opcode, Operand::Method(method)),
            &expected,
            &pushed,
        )
        .map(|_| ())
    }

    /// Indirect call through a function pointer on top of the stack
    pub fn call_indirect(&mut self, signature: MethodSig<'g>) -> Result<(), Error> {
        self.checked(|e| {
            let mut expected = vec![StackType::NativeInt];
            expected.extend(signature.parameters.iter().rev().map(CilType::stack_type));
            let pushed: Vec<StackType<'g>> = signature
                .return_type
                .iter()
                .map(CilType::stack_type)
                .collect();
            e.update(
                Instruction::new(Opcode::Calli, Operand::Signature(signature)),
                &expected,
                &pushed,
            )
            .map(|_| ())
        })
    }

    /// Push a function pointer usable by `call_indirect`
    pub fn load_function_pointer(&mut self, method: MethodId<'g>) -> Result<(), Error> {
        self.checked(|e| {
            e.update(
                Instruction::new(Opcode::Ldftn, Operand::Method(method)),
                &[],
                &[StackType::NativeInt],
            )
            .map(|_| ())
        })
    }

    // ------------------------------------------------------------------------------------------
    // Object and array construction

    /// Allocate an object and run the constructor; pops the constructor arguments
    pub fn new_object(&mut self, ctor: CtorId<'g>) -> Result<(), Error> {
        self.checked(|e| {
            if ctor.class.is_value_type() {
                return Err(e.invalid(String::from(
                    "cannot construct value type with new_object",
                )));
            }
            let expected: Vec<StackType<'g>> = ctor
                .parameters
                .iter()
                .rev()
                .map(CilType::stack_type)
                .collect();
            let constructed = StackType::Reference(ctor.class);
            e.update(
                Instruction::new(Opcode::Newobj, Operand::Ctor(ctor)),
                &expected,
                &[constructed],
            )
            .map(|_| ())
        })
    }

    /// Resolve a constructor by exact parameter types, then construct
    pub fn new_object_with_params(
        &mut self,
        ty: TypeId<'g>,
        parameters: &[CilType<'g>],
    ) -> Result<(), Error> {
        self.checked(|e| {
            let ctor = ty.constructor(parameters).ok_or_else(|| {
                e.fail(ErrorKind::NoSuchConstructor {
                    type_name: ty.name.as_str().to_owned(),
                    parameters: parameters.iter().map(|p| p.to_string()).collect(),
                })
            })?;
            if ctor.class.is_value_type() {
                return Err(e.invalid(String::from(
                    "cannot construct value type with new_object",
                )));
            }
            let expected: Vec<StackType<'g>> = ctor
                .parameters
                .iter()
                .rev()
                .map(CilType::stack_type)
                .collect();
            let constructed = StackType::Reference(ctor.class);
            e.update(
                Instruction::new(Opcode::Newobj, Operand::Ctor(ctor)),
                &expected,
                &[constructed],
            )
            .map(|_| ())
        })
    }

    /// Allocate a one-dimensional array; pops the length, pushes the array reference
    pub fn new_array(&mut self, element: CilType<'g>) -> Result<(), Error> {
        self.checked(|e| {
            let length = e.peek(1)?.remove(0);
            if !matches!(length, StackType::Int32 | StackType::NativeInt) {
                return Err(e.mismatch(Opcode::Newarr, 0, "int32 or native int", &length));
            }
            let element_entry = e.type_entry(&element)?;
            let array = e.graph.array_of(element);
            e.update(
                Instruction::new(Opcode::Newarr, Operand::Type(element_entry)),
                &[length],
                &[StackType::Reference(array)],
            )
            .map(|_| ())
        })
    }

    /// Pops an array reference, pushes its length as a native int
    pub fn load_length(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            let ok = matches!(&top, StackType::Reference(id) if id.is_array());
            if !ok {
                return Err(e.mismatch(Opcode::Ldlen, 0, "an array reference", &top));
            }
            e.update(
                Instruction::new(Opcode::Ldlen, Operand::None),
                &[top],
                &[StackType::NativeInt],
            )
            .map(|_| ())
        })
    }

    /// Pops an index and an array reference, pushes the element
    pub fn load_element(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let operands = e.peek(2)?;
            let (index, array) = (&operands[0], &operands[1]);
            if !matches!(index, StackType::Int32 | StackType::NativeInt) {
                return Err(e.mismatch(Opcode::Ldelem, 0, "int32 or native int", index));
            }
            let element = match array {
                StackType::Reference(id) => id.element_type().cloned(),
                _ => None,
            }
            .ok_or_else(|| e.mismatch(Opcode::Ldelem, 1, "an array reference", array))?;
            let element_entry = e.type_entry(&element)?;
            let pushed = element.stack_type();
            e.update(
                Instruction::new(Opcode::Ldelem, Operand::Type(element_entry)),
                &[index.clone(), array.clone()],
                &[pushed],
            )
            .map(|_| ())
        })
    }

    /// Pops a value, an index, and an array reference; stores the value into the element
    pub fn store_element(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let operands = e.peek(3)?;
            let (index, array) = (&operands[1], &operands[2]);
            if !matches!(index, StackType::Int32 | StackType::NativeInt) {
                return Err(e.mismatch(Opcode::Stelem, 1, "int32 or native int", index));
            }
            let element = match array {
                StackType::Reference(id) => id.element_type().cloned(),
                _ => None,
            }
            .ok_or_else(|| e.mismatch(Opcode::Stelem, 2, "an array reference", array))?;
            let element_entry = e.type_entry(&element)?;
            e.update(
                Instruction::new(Opcode::Stelem, Operand::Type(element_entry)),
                &[element.stack_type(), index.clone(), array.clone()],
                &[],
            )
            .map(|_| ())
        })
    }

    // ------------------------------------------------------------------------------------------
    // Boxing and casts

    /// Box a value type or primitive into an object reference
    pub fn box_value(&mut self, ty: &CilType<'g>) -> Result<(), Error> {
        self.checked(|e| {
            let (expected, boxed) = match ty {
                CilType::Base(base) => (ty.stack_type(), e.system.boxed_base(*base)),
                CilType::Ref(id) if id.is_value_type() => (StackType::Value(*id), *id),
                other => {
                    return Err(e.invalid(format!("box requires a value type, not {}", other)))
                }
            };
            e.update(
                Instruction::new(Opcode::Box, Operand::Type(boxed)),
                &[expected],
                &[StackType::Reference(boxed)],
            )
            .map(|_| ())
        })
    }

    /// Unbox (or castclass, for reference types) to the given type
    pub fn unbox_any(&mut self, ty: &CilType<'g>) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            if !top.is_reference() {
                return Err(e.mismatch(Opcode::UnboxAny, 0, "an object reference", &top));
            }
            let entry = e.type_entry(ty)?;
            let pushed = ty.stack_type();
            e.update(
                Instruction::new(Opcode::UnboxAny, Operand::Type(entry)),
                &[top],
                &[pushed],
            )
            .map(|_| ())
        })
    }

    /// Downcast, throwing at runtime on failure
    pub fn cast_class(&mut self, ty: TypeId<'g>) -> Result<(), Error> {
        self.checked(|e| {
            if ty.is_value_type() {
                return Err(e.invalid(format!(
                    "castclass requires a reference type, but {} is a value type",
                    ty.name.as_str()
                )));
            }
            let top = e.peek(1)?.remove(0);
            if !top.is_reference() {
                return Err(e.mismatch(Opcode::Castclass, 0, "an object reference", &top));
            }
            e.update(
                Instruction::new(Opcode::Castclass, Operand::Type(ty)),
                &[top],
                &[StackType::Reference(ty)],
            )
            .map(|_| ())
        })
    }

    /// Type test: pushes the reference as `ty` on success, null otherwise
    pub fn is_instance(&mut self, ty: TypeId<'g>) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            if !top.is_reference() {
                return Err(e.mismatch(Opcode::Isinst, 0, "an object reference", &top));
            }
            e.update(
                Instruction::new(Opcode::Isinst, Operand::Type(ty)),
                &[top],
                &[StackType::Reference(ty)],
            )
            .map(|_| ())
        })
    }

    // ------------------------------------------------------------------------------------------
    // Labels and branches

    /// Define a new jump target; it must be marked exactly once before finalization
    pub fn define_label(&mut self, name: Option<&str>) -> Result<Label, Error> {
        self.checked(|e| {
            if matches!(name, Some("")) {
                return Err(e.fail(ErrorKind::ArgumentNull { param: "name" }));
            }
            let id = e.state.define_label(name.map(str::to_owned));
            Ok(Label { id, owner: e.id })
        })
    }

    /// Bind the label to the current position in the stream
    pub fn mark_label(&mut self, label: Label) -> Result<(), Error> {
        self.checked(|e| {
            let id = e.check_label(label)?;
            e.state.mark_label(&mut e.buffer, id)
        })
    }

    /// Unconditional branch
    pub fn branch(&mut self, label: Label) -> Result<(), Error> {
        self.checked(|e| e.emit_branch(Opcode::Br, label, vec![]))
    }

    pub fn branch_if_true(&mut self, label: Label) -> Result<(), Error> {
        self.branch_on_truthy(Opcode::Brtrue, label)
    }

    pub fn branch_if_false(&mut self, label: Label) -> Result<(), Error> {
        self.branch_on_truthy(Opcode::Brfalse, label)
    }

    pub fn branch_if_equal(&mut self, label: Label) -> Result<(), Error> {
        self.branch_on_pair(Opcode::Beq, label, true)
    }

    pub fn branch_if_not_equal(&mut self, label: Label) -> Result<(), Error> {
        self.branch_on_pair(Opcode::BneUn, label, true)
    }

    pub fn branch_if_less(&mut self, label: Label) -> Result<(), Error> {
        self.branch_on_pair(Opcode::Blt, label, false)
    }

    pub fn branch_if_greater(&mut self, label: Label) -> Result<(), Error> {
        self.branch_on_pair(Opcode::Bgt, label, false)
    }

    fn branch_on_truthy(&mut self, opcode: Opcode, label: Label) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            if !top.is_truthy() {
                return Err(e.mismatch(
                    opcode,
                    0,
                    "an integer, reference, or managed pointer",
                    &top,
                ));
            }
            e.emit_branch(opcode, label, vec![top])
        })
    }

    fn branch_on_pair(
        &mut self,
        opcode: Opcode,
        label: Label,
        references_ok: bool,
    ) -> Result<(), Error> {
        self.checked(|e| {
            let operands = e.peek(2)?;
            let (top, below) = (&operands[0], &operands[1]);
            let comparable = below.comparable_with(top)
                && (references_ok || (!below.is_reference() && !top.is_reference()));
            if !comparable {
                return Err(e.mismatch(opcode, 0, &below.to_string(), top));
            }
            e.emit_branch(opcode, label, vec![top.clone(), below.clone()])
        })
    }

    /// Shared tail of every branch: agreement check, operand resolution, state update
    fn emit_branch(
        &mut self,
        opcode: Opcode,
        label: Label,
        pops: Vec<StackType<'g>>,
    ) -> Result<(), Error> {
        let id = self.check_label(label)?;
        let (flowing, _) = self.state.stack.pop_n(pops.len()).ok_or_else(|| {
            self.fail(ErrorKind::StackUnderflow {
                required: pops.len(),
                have: self.state.stack.depth(),
            })
        })?;
        let flowing = if opcode == Opcode::Leave {
            AbstractStack::root()
        } else {
            flowing
        };
        self.state
            .check_marked_target(&self.buffer, id, &flowing)?;
        let width = opcode.encoding().len() + 4;
        let target = self.state.branch_target(&self.buffer, id, width);
        let index = self.update(
            Instruction::new(opcode, Operand::Target(target)),
            &pops,
            &[],
        )?;
        if matches!(target, BranchTarget::Resolved(_)) {
            self.state.record_resolved_branch(id, index, &flowing);
        }
        Ok(())
    }

    /// Jump table: pops an `int32` selector, falls through when it is out of range
    pub fn switch(&mut self, labels: &[Label]) -> Result<(), Error> {
        self.checked(|e| {
            if labels.is_empty() {
                return Err(e.fail(ErrorKind::ArgumentNull { param: "labels" }));
            }
            let selector = e.peek(1)?.remove(0);
            if selector != StackType::Int32 {
                return Err(e.mismatch(Opcode::Switch, 0, "int32", &selector));
            }
            let (flowing, _) = e.state.stack.pop_n(1).expect("peeked above");
            let mut ids = Vec::with_capacity(labels.len());
            for label in labels {
                let id = e.check_label(*label)?;
                e.state.check_marked_target(&e.buffer, id, &flowing)?;
                ids.push(id);
            }
            let width = 1 + 4 + 4 * ids.len();
            let targets: Vec<BranchTarget> = ids
                .iter()
                .map(|id| e.state.branch_target(&e.buffer, *id, width))
                .collect();
            let index = e.update(
                Instruction::new(Opcode::Switch, Operand::Switch(targets.clone())),
                &[selector],
                &[],
            )?;
            for (id, target) in ids.iter().zip(&targets) {
                if matches!(target, BranchTarget::Resolved(_)) {
                    e.state.record_resolved_branch(*id, index, &flowing);
                }
            }
            Ok(())
        })
    }

    /// Return from the method; the stack must hold exactly the return value (or nothing)
    pub fn ret(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            match e.signature.return_type.clone() {
                None => {
                    if !e.state.stack.is_root() {
                        return Err(e.invalid(format!(
                            "returning from a void method leaves {} value(s) on the stack",
                            e.state.stack.depth()
                        )));
                    }
                    e.update(Instruction::new(Opcode::Ret, Operand::None), &[], &[])
                        .map(|_| ())
                }
                Some(return_type) => {
                    let depth = e.state.stack.depth();
                    if depth > 1 {
                        return Err(e.invalid(format!(
                            "return leaves {} extra value(s) on the stack",
                            depth - 1
                        )));
                    }
                    let expected = return_type.stack_type();
                    e.update(
                        Instruction::new(Opcode::Ret, Operand::None),
                        &[expected],
                        &[],
                    )
                    .map(|_| ())
                }
            }
        })
    }

    /// Throw the exception on top of the stack
    pub fn throw(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let top = e.peek(1)?.remove(0);
            let ok = match &top {
                StackType::NullLiteral => true,
                StackType::Reference(id) => id.is_exception_type(),
                _ => false,
            };
            if !ok {
                return Err(e.mismatch(Opcode::Throw, 0, "System.Exception", &top));
            }
            e.update(Instruction::new(Opcode::Throw, Operand::None), &[top], &[])
                .map(|_| ())
        })
    }

    /// Rethrow the exception being handled; only valid inside a catch handler
    pub fn rethrow(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            if !e.state.scopes.inside_catch() {
                return Err(e.fail(ErrorKind::ScopeError {
                    reason: String::from("rethrow is only valid inside a catch handler"),
                    frame: e.state.scopes.describe_innermost(),
                }));
            }
            e.update(Instruction::new(Opcode::Rethrow, Operand::None), &[], &[])
                .map(|_| ())
        })
    }

    // ------------------------------------------------------------------------------------------
    // Exception scopes

    fn scope_error(&self, reason: String) -> Error {
        self.fail(ErrorKind::ScopeError {
            reason,
            frame: self.state.scopes.describe_innermost(),
        })
    }

    fn require_root_stack(&self, transition: &str) -> Result<(), Error> {
        if self.state.stack.is_root() {
            Ok(())
        } else {
            Err(self.scope_error(format!(
                "the evaluation stack must be empty at {} ({} value(s) on it)",
                transition,
                self.state.stack.depth()
            )))
        }
    }

    /// The try frame a handler transition should attach to, if the innermost open frame is a try
    fn innermost_try(&self, transition: &str) -> Result<ScopeId, Error> {
        let innermost = self
            .state
            .scopes
            .innermost()
            .ok_or_else(|| self.scope_error(format!("{} outside any protected region", transition)))?;
        match self.state.scopes.frame(innermost).kind {
            ScopeKind::Try { .. } => Ok(innermost),
            ScopeKind::Catch { .. } => Err(self.scope_error(format!(
                "{} while a catch handler is still open",
                transition
            ))),
            ScopeKind::Finally { .. } => Err(self.scope_error(format!(
                "{} while a finally handler is still open",
                transition
            ))),
        }
    }

    /// Open a protected region; the evaluation stack must be empty
    pub fn begin_exception_block(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            e.require_root_stack("begin_exception_block")?;
            let end_label = e.state.define_label(None);
            e.state.scopes.open(
                ScopeKind::Try {
                    end_label,
                    handlers: 0,
                    has_finally: false,
                },
                e.buffer.next_index(),
            );
            e.buffer.host_mut().begin_try();
            Ok(())
        })
    }

    /// Open a typed catch handler on the innermost try
    pub fn begin_catch_block(&mut self, caught: TypeId<'g>) -> Result<(), Error> {
        self.checked(|e| {
            e.require_root_stack("begin_catch_block")?;
            let try_id = e.innermost_try("begin_catch_block")?;
            if !caught.is_exception_type() {
                return Err(e.scope_error(format!(
                    "catch type {} does not derive from System.Exception",
                    caught.name.as_str()
                )));
            }
            if let ScopeKind::Try { handlers, .. } = &mut e.state.scopes.frame_mut(try_id).kind {
                *handlers += 1;
            }
            e.state.scopes.open(
                ScopeKind::Catch {
                    parent: try_id,
                    caught,
                },
                e.buffer.next_index(),
            );
            e.buffer.host_mut().begin_catch(caught);
            // The handler begins with the caught exception as the only stack slot
            e.state.stack =
                AbstractStack::root().push(StackType::Reference(caught));
            e.state.max_stack = e.state.max_stack.max(1);
            Ok(())
        })
    }

    /// Catch handler for every exception, equivalent to catching `System.Exception`
    pub fn begin_catch_all_block(&mut self) -> Result<(), Error> {
        let exception = self.system.exception;
        self.begin_catch_block(exception)
    }

    /// Close the open catch handler, leaving to the end of the protected region
    pub fn end_catch_block(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let innermost = e
                .state
                .scopes
                .innermost()
                .ok_or_else(|| e.scope_error(String::from("end_catch_block outside any protected region")))?;
            let parent = match e.state.scopes.frame(innermost).kind {
                ScopeKind::Catch { parent, .. } => parent,
                _ => {
                    return Err(
                        e.scope_error(String::from("end_catch_block without an open catch handler"))
                    )
                }
            };
            e.require_root_stack("end_catch_block")?;
            let end_label = match e.state.scopes.frame(parent).kind {
                ScopeKind::Try { end_label, .. } => end_label,
                _ => unreachable!("catch frames always point at a try"),
            };
            // Leaving a handler both registers the forward patch and records the (empty) stack
            // that flows to the region's end label
            e.emit_leave(end_label)?;
            e.state.scopes.close_innermost(e.buffer.next_index());
            Ok(())
        })
    }

    /// Open the finally handler on the innermost try; at most one per region
    pub fn begin_finally_block(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            e.require_root_stack("begin_finally_block")?;
            let try_id = e.innermost_try("begin_finally_block")?;
            match &mut e.state.scopes.frame_mut(try_id).kind {
                ScopeKind::Try {
                    handlers,
                    has_finally,
                    ..
                } => {
                    if *has_finally {
                        return Err(e.scope_error(String::from(
                            "protected region already has a finally handler",
                        )));
                    }
                    *handlers += 1;
                    *has_finally = true;
                }
                _ => unreachable!("innermost_try returned a non-try frame"),
            }
            e.state
                .scopes
                .open(ScopeKind::Finally { parent: try_id }, e.buffer.next_index());
            e.buffer.host_mut().begin_finally();
            e.state.stack = AbstractStack::root();
            Ok(())
        })
    }

    /// Close the open finally handler
    pub fn end_finally_block(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let innermost = e.state.scopes.innermost();
            let is_finally = matches!(
                innermost.map(|id| &e.state.scopes.frame(id).kind),
                Some(ScopeKind::Finally { .. })
            );
            if !is_finally {
                return Err(
                    e.scope_error(String::from("end_finally_block without an open finally handler"))
                );
            }
            e.require_root_stack("end_finally_block")?;
            e.update(
                Instruction::new(Opcode::Endfinally, Operand::None),
                &[],
                &[],
            )?;
            e.state.scopes.close_innermost(e.buffer.next_index());
            Ok(())
        })
    }

    /// Seal the protected region; requires at least one attached handler, all of them closed
    pub fn end_exception_block(&mut self) -> Result<(), Error> {
        self.checked(|e| {
            let innermost = e
                .state
                .scopes
                .innermost()
                .ok_or_else(|| e.scope_error(String::from("end_exception_block outside any protected region")))?;
            let (end_label, handlers) = match e.state.scopes.frame(innermost).kind {
                ScopeKind::Try {
                    end_label,
                    handlers,
                    ..
                } => (end_label, handlers),
                ScopeKind::Catch { .. } => {
                    return Err(e.scope_error(String::from(
                        "end_exception_block while a catch handler is still open",
                    )))
                }
                ScopeKind::Finally { .. } => {
                    return Err(e.scope_error(String::from(
                        "end_exception_block while a finally handler is still open",
                    )))
                }
            };
            if handlers == 0 {
                return Err(e.scope_error(String::from(
                    "try requires at least one catch or finally",
                )));
            }
            e.require_root_stack("end_exception_block")?;
            e.buffer.host_mut().end_try();
            e.state.scopes.close_innermost(e.buffer.next_index());
            e.state.stack = AbstractStack::root();
            e.state.mark_label(&mut e.buffer, end_label)
        })
    }

    /// `leave` targeting a label, emptying the evaluation stack on the way out
    fn emit_leave(&mut self, target: LabelId) -> Result<(), Error> {
        let root = AbstractStack::root();
        self.state.check_marked_target(&self.buffer, target, &root)?;
        let width = Opcode::Leave.encoding().len() + 4;
        let operand = Operand::Target(self.state.branch_target(&self.buffer, target, width));
        self.update(Instruction::new(Opcode::Leave, operand), &[], &[])
            .map(|_| ())
    }

    // ------------------------------------------------------------------------------------------
    // Finalization

    /// Verify the method is structurally complete and hand the stream to the host
    ///
    /// The first successful call caches the host's delegate; later calls return the same cached
    /// value without touching anything.
    pub fn create_delegate(&mut self) -> Result<&H::Delegate, Error> {
        if self.finalized {
            return Ok(self
                .delegate
                .as_ref()
                .expect("finalized emitter always caches its delegate"));
        }
        match self.finalize_checks() {
            Ok(()) => {}
            Err(error) => {
                self.poisoned = Some(error.clone());
                return Err(error);
            }
        }

        let locals: Vec<CilType<'g>> = self.state.locals.iter().map(|l| l.ty.clone()).collect();
        let delegate = self.buffer.host_mut().finalize(
            self.signature.return_type.clone(),
            locals,
            self.state.max_stack,
        );
        self.delegate = Some(delegate);
        self.finalized = true;
        Ok(self
            .delegate
            .as_ref()
            .expect("delegate cached on the line above"))
    }

    fn finalize_checks(&self) -> Result<(), Error> {
        self.ready()?;
        if let Some(label) = self.state.unmarked_labels().into_iter().next() {
            return Err(self.fail(ErrorKind::LabelError {
                reason: String::from("label is never marked"),
                label,
            }));
        }
        if !self.state.scopes.all_closed() {
            return Err(self.scope_error(format!(
                "{} protected scope(s) still open at finalization",
                self.state.scopes.open_count()
            )));
        }
        if !self.state.patches_resolved() {
            return Err(self.invalid(String::from(
                "unresolved forward-branch patches remain at finalization",
            )));
        }
        match self.buffer.last_opcode() {
            None => Err(self.invalid(String::from("method body is empty"))),
            Some(op) if !op.is_terminator() => Err(self.invalid(format!(
                "method body must end with a terminating instruction, not {}",
                op.mnemonic()
            ))),
            Some(_) => Ok(()),
        }
    }
}

/// Result type of a binary numeric operation, per the CLI's binary numeric table
///
/// `int32` and `native int` mix (producing `native int`); the float widths mix (producing
/// `float64`); nothing else does.
fn arithmetic_result<'g>(a: &StackType<'g>, b: &StackType<'g>) -> Option<StackType<'g>> {
    use StackType::*;
    match (a, b) {
        (Int32, Int32) => Some(Int32),
        (Int32, NativeInt) | (NativeInt, Int32) | (NativeInt, NativeInt) => Some(NativeInt),
        (Int64, Int64) => Some(Int64),
        (Float32, Float32) => Some(Float32),
        (Float32, Float64) | (Float64, Float32) | (Float64, Float64) => Some(Float64),
        _ => None,
    }
}
