//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - System V and Linux syscall register conventions
//! - Method lowering, including the printf intrinsic
//! - The backend registered for [`Arch::X86_64`](crate::backend::Arch::X86_64)

pub mod backend;
pub mod calling_convention;
pub mod compiler;
pub mod encoder;
pub mod printf;

pub use backend::X64Backend;
pub use calling_convention::{CCAssigner, SysVAssigner, SyscallAssigner};
pub use compiler::{CompiledMethod, MethodCompiler};
pub use encoder::{EncodingError, JumpCondition, X64Encoder};
pub use printf::PRINTF_STACK_RESERVE;
