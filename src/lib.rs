//! stagegen - native code generation for first-stage programs.
//!
//! stagegen lowers a small structured IR (integer and memory computation,
//! control flow, system calls and calls between methods) into machine code and
//! links every method plus the declared globals into one self-contained,
//! position-independent image. The image needs no loader or runtime: whoever
//! maps it adds the load address to each relocation slot and jumps to offset 0.
//!
//! # Primary Usage
//!
//! ```no_run
//! use stagegen::ir::*;
//!
//! let program = Program::new("main").with_method("main", vec![ret(42i64)]);
//! let linked = stagegen::build_standalone_program(&program)?;
//! let image = stagegen::elf::standalone_elf(&linked, &Default::default())?;
//! # Ok::<(), stagegen::BuildError>(())
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Fragment, Method and Program, with builder helpers
//! - [`core`] - Shared infrastructure (errors, frames, registers, relocations, session)
//! - [`x64`] - x86-64 lowering and instruction encoding
//! - [`linker`] - Whole-program linking
//! - [`backend`] - Architecture registry
//! - [`elf`] - Standalone ELF images
//! - [`native`] - Running linked programs in-process

pub mod backend;
pub mod core;
pub mod elf;
pub mod ir;
pub mod linker;
#[cfg(all(unix, target_arch = "x86_64"))]
pub mod native;
pub mod samples;
pub mod x64;

pub use backend::{
    backend_for, build_for, build_standalone_program, build_standalone_program_for_arch,
    register_backend, registered_architectures, Arch, Backend,
};
pub use self::core::{
    // Errors
    BuildError, BuildResult, CompileError, CompileResult, LinkError, LinkResult,
    // Register allocation
    AsmReg, RegAllocError, RegisterFile,
    // Session management
    CompilationSession, SessionStats,
};
pub use elf::{standalone_elf, ElfConfig};
pub use ir::{Fragment, GlobalConfig, Method, Program};
pub use linker::{LinkedProgram, MethodBlob};
