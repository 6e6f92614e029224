//! Build verified CIL method bodies
//!
//! ### Simple example
//!
//! A method that returns a fresh five-element `int32[]`:
//!
//! ```
//! use cilgen::cil::emit::Emitter;
//! use cilgen::cil::host::BytecodeHost;
//! use cilgen::cil::metadata::{MethodSig, TypeGraph, TypeGraphArenas};
//! use cilgen::cil::types::CilType;
//!
//! # fn build() -> Result<(), cilgen::cil::errors::Error> {
//! // Set up the metadata graph and the well-known System.* types
//! let arenas = TypeGraphArenas::new();
//! let graph = TypeGraph::new(&arenas);
//! let system = graph.insert_system_library_types();
//!
//! // int32[] make_array()
//! let signature = MethodSig::new(
//!     vec![],
//!     Some(CilType::Ref(graph.array_of(CilType::int32()))),
//! );
//!
//! let mut emit = Emitter::new(&graph, &system, signature, BytecodeHost::new());
//! emit.load_constant_i32(5)?;
//! emit.new_array(CilType::int32())?;
//! emit.ret()?;
//! let body = emit.create_delegate()?;
//! assert!(!body.bytes.is_empty());
//! # Ok(())
//! # }
//! # build().unwrap();
//! ```
//!
//! Every call is verified eagerly: had the `load_constant_i32` been missing, the `new_array`
//! call itself would have returned a stack-underflow error instead of the malformed stream
//! surfacing later as an opaque failure inside the runtime.

pub mod buffer;
pub mod emit;
pub mod errors;
pub mod host;
pub mod instruction;
pub mod metadata;
pub mod names;
pub mod stack;
pub mod types;

pub use emit::{Emitter, Label, Local};
pub use errors::{Error, ErrorKind};
pub use host::{BytecodeHost, HostEmitter, MethodBody};
pub use types::{BaseType, CilType, StackType};
