//! Bytecode primitives: method bodies, source text assembler/emitter and
//! structural validation.

/// Method bodies (`Op`, `OperatorRef`, `LineTable`, `Method`).
pub mod method;
/// Validation shared by the loader, the lowering pass and the upgrader.
pub mod helpers;
/// Source text emission.
pub mod disasm;
/// Source text assembly.
pub mod asm;

pub use method::{LineTable, Method, Op, OperatorRef};
