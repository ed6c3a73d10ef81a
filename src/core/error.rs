// This module defines the error types for stagegen using the thiserror crate. CompileError
// covers everything that can stop the lowering of a single method: unsupported fragment
// shapes, unknown variables, shift and displacement range checks, argument count limits,
// label bookkeeping, stack-slot scoping, printf format problems, register exhaustion and
// encoder failures. LinkError covers whole-program problems found while validating the IR
// or stitching method blobs together (missing entrypoint, undeclared globals, token
// collisions, relocation checks, leftover placeholders). BuildError is what the top-level
// build entry points return: link failures plus backend registry and image-writer errors.

//! Error types for stagegen.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

use super::register_file::RegAllocError;
use crate::ir::Width;
use crate::x64::encoder::EncodingError;

/// Error raised while lowering one method.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Unsupported fragment: {what}")]
    UnsupportedFragment { what: String },

    #[error("Unsupported {width:?} access for {operation}")]
    UnsupportedWidth { operation: &'static str, width: Width },

    #[error("Unknown variable {name:?}")]
    UnknownVariable { name: String },

    #[error("Empty {what} name")]
    EmptyName { what: &'static str },

    #[error("Shift amount must be a compile-time constant")]
    NonConstantShift,

    #[error("Shift amount {amount} out of range (0..=255)")]
    ShiftOutOfRange { amount: i64 },

    #[error("Displacement {disp} does not fit a signed 32-bit offset")]
    DisplacementOutOfRange { disp: i64 },

    #[error("Literal {value:#x} collides with the placeholder token space")]
    ReservedImmediate { value: u64 },

    #[error("Too many {what} arguments: {count} (max {max})")]
    TooManyArguments {
        what: &'static str,
        count: usize,
        max: usize,
    },

    #[error("Too many parameters (max {max})")]
    TooManyParameters { max: usize },

    #[error("Parameter {name:?} declared twice")]
    DuplicateParameter { name: String },

    #[error("Register allocation failed: {0}")]
    RegisterAllocation(#[from] RegAllocError),

    #[error("{live} register(s) still allocated after compiling method")]
    RegisterLeak { live: usize },

    #[error("Label {name:?} declared more than once")]
    DuplicateLabel { name: String },

    #[error("Label {name:?} is referenced but never declared")]
    UndefinedLabel { name: String },

    #[error("Label name {name:?} uses the reserved '.' prefix")]
    ReservedLabel { name: String },

    #[error("Stack slot {id} referenced outside of its scope")]
    InactiveStackSlot { id: u64 },

    #[error("Stack slot {id} is malformed: {reason}")]
    InvalidStackSlot { id: u64, reason: String },

    #[error("Constant {name:?} defined twice in one method")]
    DuplicateConstant { name: String },

    #[error("Unknown constant {name:?}")]
    UnknownConstant { name: String },

    #[error("Invalid printf format {format:?}: {reason}")]
    InvalidFormat { format: String, reason: String },

    #[error("Frame of {size} bytes is too large")]
    FrameTooLarge { size: u64 },

    #[error("Instruction encoding failed: {0}")]
    Encoding(#[from] EncodingError),
}

/// Error raised while linking a whole program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Entrypoint method {name:?} not found")]
    MissingEntrypoint { name: String },

    #[error("Method {method:?} references undeclared global {global:?}")]
    UndeclaredGlobal { method: String, global: String },

    #[error("Method {method:?} references unknown method {target:?}")]
    UnknownMethod { method: String, target: String },

    #[error("Global {name:?} is invalid: {reason}")]
    InvalidGlobal { name: String, reason: String },

    #[error("Failed to compile method {method:?}: {source}")]
    Method {
        method: String,
        #[source]
        source: CompileError,
    },

    #[error("Placeholder token {token:#018x} for {name:?} collides with another symbol")]
    TokenCollision { name: String, token: u64 },

    #[error("Relocation at {position} is out of range (image is {len} bytes)")]
    RelocationOutOfRange { position: usize, len: usize },

    #[error("Relocation at {position} expected placeholder {expected:#x}, found {found:#x}")]
    RelocationMismatch {
        position: usize,
        expected: u64,
        found: u64,
    },

    #[error("Unresolved placeholder token {token:#018x} at offset {position}")]
    UnresolvedToken { position: usize, token: u64 },

    #[error("Linked image of {size} bytes exceeds the {limit} byte limit")]
    ImageTooLarge { size: u64, limit: u64 },
}

/// Top-level build error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Unknown architecture {name:?}")]
    UnknownArchitecture { name: String },

    #[error("No backend registered for {arch}")]
    BackendNotRegistered { arch: crate::backend::Arch },

    #[error("Backend for {arch} registered twice")]
    DuplicateBackend { arch: crate::backend::Arch },

    #[error("Invalid ELF configuration: {reason}")]
    InvalidElfConfig { reason: String },

    #[error("ELF writer failed: {reason}")]
    ElfWrite { reason: String },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// Result type alias for linking.
pub type LinkResult<T> = Result<T, LinkError>;

/// Result type alias for top-level builds.
pub type BuildResult<T> = Result<T, BuildError>;
