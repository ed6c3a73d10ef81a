// This module serves as the central hub for stagegen's architecture-neutral infrastructure:
// the error types every layer returns, the stack frame layout computed from a method's IR,
// the LIFO register pool the method compilers allocate from, relocation records and the
// placeholder tokens the linker resolves, and the arena-backed compilation session that
// interns label names and collects build statistics. Backends build on these pieces; none
// of them know about a particular instruction set.

//! Core stagegen Infrastructure
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based string interning using `bumpalo`
//! - Compilation statistics
//!
//! ## Register Allocation (`register_file`)
//! - LIFO free pool with bitset tracking of live registers
//! - Balance check at the end of every method
//!
//! ## Frame Layout (`frame`)
//! - Deterministic, sorted-name variable slots
//!
//! ## Relocations (`reloc`)
//! - Explicit absolute-address records and tagged placeholder tokens

pub mod error;
pub mod frame;
pub mod register_file;
pub mod reloc;
pub mod session;

pub use error::{
    BuildError, BuildResult, CompileError, CompileResult, LinkError, LinkResult,
};
pub use frame::FrameLayout;
pub use register_file::{AsmReg, RegAllocError, RegBitSet, RegisterFile};
pub use reloc::{RelocTarget, Relocation};
pub use session::{CompilationSession, SessionStats};
