//! Eagerly-verified emission of CIL method bodies
//!
//! The raw path to dynamic code - append opcodes, hope, and let the runtime's own checker reject
//! the stream when it is materialized - fails late and opaquely. This crate puts an abstract
//! interpreter in front of emission: every instruction is checked against the evaluation stack,
//! the type system, and the structural rules (label marks, branch agreement, try/catch/finally
//! nesting) at the call that produces it, so the first mistake is reported with the offending
//! instruction and the stack shape in hand.
//!
//! Start at [`cil::emit::Emitter`].

pub mod cil;
pub mod util;
