//! Bytecode representation: opcodes and chunks.

mod chunk;
mod op;

pub use chunk::{Chunk, MAX_CONSTANTS};
pub use op::Opcode;
