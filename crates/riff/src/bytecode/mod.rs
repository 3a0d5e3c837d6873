//! Bytecode representation.
//!
//! This module holds what the external compiler produces and the interpreter
//! consumes: the opcode set and operand encoding (`op`), compiled units
//! (`prototype`), and the emission surface (`builder`). The AST-to-bytecode
//! compiler itself lives outside this crate.

pub use builder::{JumpPatch, ProtoBuilder};
pub use op::{Instruction, Opcode, Operand, decode, name, reg};
pub use prototype::{CallArg, CompiledCall, Param, Prototype};

mod builder;
mod op;
mod prototype;
