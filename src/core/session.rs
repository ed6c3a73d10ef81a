// This module provides arena-based session management using the bumpalo crate. A
// CompilationSession lives for one program build: it owns a reference to the arena used to
// intern label names for every method compiled in the build (so per-method label tables can
// key on `&'arena str` without cloning strings per lookup) and it accumulates SessionStats
// across methods. Statistics cover methods compiled, emitted code size, the largest method,
// fragments lowered by kind, calls and syscalls lowered and relocations emitted; the CLI
// prints them after a build. The session is only ever used from one thread and uses
// interior mutability so that compilers can share it by reference.

//! Arena-based compilation session management.
//!
//! All interned names are tied to the session lifetime.

use bumpalo::Bump;
use hashbrown::HashSet;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics.
    stats: RefCell<SessionStats>,

    /// String interning for label names.
    interned_strings: RefCell<HashSet<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashSet::new()),
        }
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned: &'arena str = self.arena.alloc_str(s);
        strings.insert(interned);
        interned
    }

    /// Record that a method was compiled.
    pub fn record_method_compiled(&self, name: &str, code_size: usize, relocations: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.methods_compiled += 1;
        stats.total_code_size += code_size;
        stats.relocations_emitted += relocations;

        if stats.largest_method_size < code_size {
            stats.largest_method_size = code_size;
            stats.largest_method_name = name.to_string();
        }
    }

    /// Record one lowered fragment.
    pub fn record_fragment_lowered(&self, kind: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.fragments_lowered += 1;
        *stats.fragment_counts.entry(kind).or_insert(0) += 1;
    }

    pub fn record_call_lowered(&self) {
        self.stats.borrow_mut().calls_lowered += 1;
    }

    pub fn record_syscall_lowered(&self) {
        self.stats.borrow_mut().syscalls_lowered += 1;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of methods compiled.
    pub methods_compiled: usize,

    /// Total code size generated (bytes, before linking).
    pub total_code_size: usize,

    /// Fragments lowered, all kinds.
    pub fragments_lowered: usize,

    /// Count of each fragment kind lowered.
    pub fragment_counts: BTreeMap<&'static str, usize>,

    /// Largest method compiled.
    pub largest_method_size: usize,

    /// Name of largest method.
    pub largest_method_name: String,

    pub calls_lowered: usize,

    pub syscalls_lowered: usize,

    /// Absolute-address relocations recorded by the method compilers.
    pub relocations_emitted: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Methods compiled: {}", self.methods_compiled)?;
        writeln!(f, "  Fragments lowered: {}", self.fragments_lowered)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Calls lowered: {}", self.calls_lowered)?;
        writeln!(f, "  Syscalls lowered: {}", self.syscalls_lowered)?;
        writeln!(f, "  Relocations emitted: {}", self.relocations_emitted)?;

        if !self.largest_method_name.is_empty() {
            writeln!(
                f,
                "  Largest method: {} ({} bytes)",
                self.largest_method_name, self.largest_method_size
            )?;
        }

        if !self.fragment_counts.is_empty() {
            writeln!(f, "  Fragment breakdown:")?;
            let mut sorted: Vec<_> = self.fragment_counts.iter().collect();
            sorted.sort_by_key(|(_, count)| std::cmp::Reverse(**count));

            for (kind, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", kind, count)?;
            }
        }

        Ok(())
    }
}
