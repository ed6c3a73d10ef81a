//! x86-64 Backend implementation.
//!
//! Bridges the architecture-neutral linker with [`MethodCompiler`]: every
//! method is compiled on its own into a blob of code and constant data plus
//! its relocation records.

use log::trace;

use super::compiler::{CompiledMethod, MethodCompiler};
use crate::backend::{Arch, Backend};
use crate::core::error::CompileResult;
use crate::core::session::CompilationSession;
use crate::ir::Method;
use crate::linker::MethodBlob;

/// x86-64 backend implementing the Backend trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct X64Backend;

impl X64Backend {
    pub fn new() -> Self {
        Self
    }

    /// Compile one method, keeping its frame layout.
    pub fn compile_detailed(
        &self,
        session: &CompilationSession<'_>,
        name: &str,
        method: &Method,
    ) -> CompileResult<CompiledMethod> {
        trace!("x86-64: compiling {} ({} fragments)", name, method.fragments().len());
        MethodCompiler::new(session, name, method)?.compile(method)
    }
}

impl From<CompiledMethod> for MethodBlob {
    fn from(compiled: CompiledMethod) -> Self {
        MethodBlob {
            code: compiled.code,
            relocations: compiled.relocations,
            bss_size: compiled.bss_size,
        }
    }
}

impl Backend for X64Backend {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn compile_method(
        &self,
        session: &CompilationSession<'_>,
        name: &str,
        method: &Method,
    ) -> CompileResult<MethodBlob> {
        Ok(self.compile_detailed(session, name, method)?.into())
    }
}
