//! 64-bit x86 Backend
//!
//! Instruction emission for the 64-bit target: 8-byte words, 16-byte
//! dual-word slots, System V register-based native calls with 16-byte
//! stack alignment at call sites, and position-independent code —
//! addresses referenced from code are RIP-relative 32-bit displacements,
//! never absolute immediates embedded mid-instruction.
//!
//! ## Modules
//!
//! - `registers`: x86-64 register definitions, REX and ModR/M encoding
//! - `codegen`: the [`Assembler`](crate::Assembler) implementation

pub mod codegen;
pub mod registers;

pub use codegen::X64Assembler;
