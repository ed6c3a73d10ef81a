// This module holds the architecture registry. Arch names the targets a build can ask
// for and parses the usual spellings; Backend is the per-architecture seam the linker
// drives, compiling one method at a time into a relocatable blob. The registry maps each
// Arch to at most one backend behind a process-wide RwLock, with the x86-64 backend
// installed on first use. Registering a second backend for an architecture is an error;
// looking up an architecture nobody registered is an error distinct from failing to parse
// its name.

//! Architecture selection and the backend registry.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use bumpalo::Bump;
use hashbrown::HashMap;
use log::{debug, info};

use crate::core::error::{BuildError, BuildResult, CompileResult};
use crate::core::session::CompilationSession;
use crate::ir::{Method, Program};
use crate::linker::{self, LinkedProgram, MethodBlob};
use crate::x64::X64Backend;

/// Target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    pub const ALL: [Arch; 3] = [Arch::X86_64, Arch::Aarch64, Arch::Riscv64];

    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" | "x64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "riscv64" => Ok(Arch::Riscv64),
            _ => Err(BuildError::UnknownArchitecture {
                name: s.to_string(),
            }),
        }
    }
}

/// A code generator for one architecture.
pub trait Backend: Send + Sync {
    fn arch(&self) -> Arch;

    /// Compile one method into a relocatable blob.
    fn compile_method(
        &self,
        session: &CompilationSession<'_>,
        name: &str,
        method: &Method,
    ) -> CompileResult<MethodBlob>;

    /// Compile and link a whole program, reporting into `session`.
    fn build_with_session(
        &self,
        program: &Program,
        session: &CompilationSession<'_>,
    ) -> BuildResult<LinkedProgram> {
        Ok(linker::link(self, program, session)?)
    }

    /// Compile and link a whole program.
    fn build_standalone_program(&self, program: &Program) -> BuildResult<LinkedProgram> {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        self.build_with_session(program, &session)
    }
}

type Registry = HashMap<Arch, Arc<dyn Backend>>;

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| {
    let mut backends: Registry = HashMap::new();
    backends.insert(Arch::X86_64, Arc::new(X64Backend::new()));
    RwLock::new(backends)
});

/// Register `backend` for its architecture.
pub fn register_backend(backend: Arc<dyn Backend>) -> BuildResult<()> {
    let arch = backend.arch();
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    if registry.contains_key(&arch) {
        return Err(BuildError::DuplicateBackend { arch });
    }
    registry.insert(arch, backend);
    info!("registered backend for {arch}");
    Ok(())
}

/// The backend registered for `arch`.
pub fn backend_for(arch: Arch) -> BuildResult<Arc<dyn Backend>> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&arch)
        .cloned()
        .ok_or(BuildError::BackendNotRegistered { arch })
}

/// Architectures with a registered backend, sorted.
pub fn registered_architectures() -> Vec<Arch> {
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    let mut arches: Vec<Arch> = registry.keys().copied().collect();
    arches.sort();
    arches
}

/// Build `program` for x86-64.
pub fn build_standalone_program(program: &Program) -> BuildResult<LinkedProgram> {
    build_for(Arch::X86_64, program)
}

/// Build `program` for the architecture named `arch`.
pub fn build_standalone_program_for_arch(arch: &str, program: &Program) -> BuildResult<LinkedProgram> {
    build_for(arch.parse()?, program)
}

/// Build `program` for `arch`.
pub fn build_for(arch: Arch, program: &Program) -> BuildResult<LinkedProgram> {
    let backend = backend_for(arch)?;
    debug!("building {} for {}", program.entrypoint, arch);
    backend.build_standalone_program(program)
}
