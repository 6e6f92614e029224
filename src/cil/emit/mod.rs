//! Verified instruction emission
//!
//! The emitter is an abstract interpreter that runs alongside emission. For any specific
//! instruction inside a method body, the evaluation stack must have the same shape regardless of
//! which control flow was used to reach it: although the values on the stack may obviously be
//! different, the types and order cannot. The verifier tracks that shape (an
//! [`crate::cil::stack::AbstractStack`]) instruction by instruction, which makes it possible to
//! check that the next instruction makes sense (eg. `add` only makes sense if the top two slots
//! hold compatible numeric types) at the moment it is requested.
//!
//! Rather than merging the shapes that flow into a jump target, the verifier requires them to be
//! structurally identical. The tradeoff is that it might reject code that is not incorrect -
//! never that it accepts incorrect code - and in exchange no fixpoint iteration is needed: every
//! instruction is verified exactly once, eagerly, at its own call site.
//!
//! [`Emitter`] is the caller surface; the state module holds the abstract-interpretation core
//! that every opcode handler funnels through; the scopes module tracks the try/catch/finally
//! discipline.

mod emitter;
mod scopes;
mod state;

pub use emitter::Emitter;
pub use state::{Label, Local};
