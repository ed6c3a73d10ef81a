// This module implements the whole-program linker. It validates a Program (entrypoint
// present, every referenced global declared, every method pointer naming a real method,
// global alignments powers of two), asks a backend to compile each method into a blob
// (entrypoint first so it lands at offset 0, the rest in name order), concatenates the
// blobs at 16-byte boundaries, and lays out one BSS area after the code: each method's
// scratch region first, packed at 16-byte granularity, then every declared global in name
// order at its own alignment. Relocation records coming out of the method compilers are
// checked against the placeholder bytes they point at and then patched with image-relative
// offsets; a final scan makes sure no method or global token survived. The result is a
// LinkedProgram that a loader can map at any base address by adding the base to each
// relocated 8-byte slot.

//! Whole-program linking of compiled methods.

use std::collections::BTreeMap;

use hashbrown::{HashMap, HashSet};
use log::{debug, info, trace};

use crate::backend::Backend;
use crate::core::error::{LinkError, LinkResult};
use crate::core::frame::align_to;
use crate::core::reloc::{global_token, method_token, RelocTarget, Relocation};
use crate::core::session::CompilationSession;
use crate::ir::{visit, GlobalConfig, Program};

/// Alignment of every method blob in the image.
pub const METHOD_ALIGNMENT: u64 = 16;

/// Alignment of the BSS area and of each method's scratch region.
pub const BSS_ALIGNMENT: u64 = 16;

/// Largest image (code plus BSS) the linker produces.
pub const MAX_IMAGE_SIZE: u64 = 1 << 31;

/// Fill between method blobs.
const PADDING_BYTE: u8 = 0xcc;

/// One compiled method as handed to the linker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodBlob {
    /// Code followed by constant data.
    pub code: Vec<u8>,
    /// Absolute-address slots in `code`.
    pub relocations: Vec<Relocation>,
    /// Scratch bytes needed by the method.
    pub bss_size: u64,
}

/// A linked, position-independent image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkedProgram {
    /// Code and constant data. Execution starts at offset 0.
    pub code: Vec<u8>,
    /// Sorted offsets of 8-byte little-endian image-relative addresses.
    pub relocations: Vec<usize>,
    /// Zero bytes to allocate directly after `code`.
    pub bss_size: usize,
    /// Start offset of every method.
    pub methods: BTreeMap<String, usize>,
    /// Image offset of every global.
    pub globals: BTreeMap<String, usize>,
}

impl LinkedProgram {
    /// Code plus BSS.
    pub fn image_size(&self) -> usize {
        self.code.len() + self.bss_size
    }

    /// A copy of the code with every relocation rebased to `base`.
    pub fn relocated_code(&self, base: u64) -> Vec<u8> {
        let mut code = self.code.clone();
        for &pos in &self.relocations {
            if let Some(slot) = code.get_mut(pos..pos + 8) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(slot);
                let value = u64::from_le_bytes(raw).wrapping_add(base);
                slot.copy_from_slice(&value.to_le_bytes());
            }
        }
        code
    }

    /// Name of the method starting at `offset`, if any.
    pub fn method_at(&self, offset: usize) -> Option<&str> {
        self.methods
            .iter()
            .find(|(_, &start)| start == offset)
            .map(|(name, _)| name.as_str())
    }
}

/// Validate `program` and return its normalised globals.
pub fn validate(program: &Program) -> LinkResult<BTreeMap<String, GlobalConfig>> {
    if !program.methods.contains_key(&program.entrypoint) {
        return Err(LinkError::MissingEntrypoint {
            name: program.entrypoint.clone(),
        });
    }

    let mut globals = BTreeMap::new();
    for (name, config) in &program.globals {
        let normalized = config
            .normalized()
            .map_err(|reason| LinkError::InvalidGlobal {
                name: name.clone(),
                reason,
            })?;
        globals.insert(name.clone(), normalized);
    }

    for (name, method) in &program.methods {
        if let Some(global) = visit::collect_globals(method)
            .into_iter()
            .find(|g| !globals.contains_key(g))
        {
            return Err(LinkError::UndeclaredGlobal {
                method: name.clone(),
                global,
            });
        }
        if let Some(target) = visit::collect_method_pointers(method)
            .into_iter()
            .find(|m| !program.methods.contains_key(m))
        {
            return Err(LinkError::UnknownMethod {
                method: name.clone(),
                target,
            });
        }
    }
    Ok(globals)
}

/// Method names in link order: entrypoint first, then by name.
pub fn link_order(program: &Program) -> Vec<&str> {
    std::iter::once(program.entrypoint.as_str())
        .chain(
            program
                .methods
                .keys()
                .map(String::as_str)
                .filter(|name| *name != program.entrypoint),
        )
        .collect()
}

/// Check that no two symbols share a placeholder token.
fn collect_tokens(program: &Program) -> LinkResult<HashSet<u64>> {
    let mut owners: HashMap<u64, &str> = HashMap::new();
    let symbols = program
        .methods
        .keys()
        .map(|name| (name.as_str(), method_token(name)))
        .chain(
            program
                .globals
                .keys()
                .map(|name| (name.as_str(), global_token(name))),
        );
    for (name, token) in symbols {
        if let Some(previous) = owners.insert(token, name) {
            if previous != name {
                return Err(LinkError::TokenCollision {
                    name: name.to_string(),
                    token,
                });
            }
        }
    }
    Ok(owners.into_keys().collect())
}

/// Compile and link `program` with `backend`.
pub fn link<B: Backend + ?Sized>(
    backend: &B,
    program: &Program,
    session: &CompilationSession<'_>,
) -> LinkResult<LinkedProgram> {
    let globals = validate(program)?;
    let tokens = collect_tokens(program)?;

    // ==== COMPILE AND CONCATENATE ====
    let mut code: Vec<u8> = Vec::new();
    let mut methods = BTreeMap::new();
    let mut blobs = Vec::new();
    for name in link_order(program) {
        let Some(method) = program.method(name) else {
            continue;
        };
        let blob = backend
            .compile_method(session, name, method)
            .map_err(|source| LinkError::Method {
                method: name.to_string(),
                source,
            })?;

        let start = align_to(code.len() as u64, METHOD_ALIGNMENT) as usize;
        code.resize(start, PADDING_BYTE);
        code.extend_from_slice(&blob.code);
        methods.insert(name.to_string(), start);
        debug!("placed method {} at {:#x} ({} bytes)", name, start, blob.code.len());
        blobs.push((name, start, blob));
    }

    // ==== BSS LAYOUT ====
    let code_len = code.len() as u64;
    let bss_base = align_to(code_len, BSS_ALIGNMENT);
    let mut cursor = 0u64;
    let mut scratch_base = Vec::with_capacity(blobs.len());
    for (_, _, blob) in &blobs {
        cursor = align_to(cursor, BSS_ALIGNMENT);
        scratch_base.push(bss_base + cursor);
        cursor += blob.bss_size;
    }

    let mut global_offsets = BTreeMap::new();
    for (name, config) in &globals {
        let offset = align_to(bss_base + cursor, config.align);
        global_offsets.insert(name.clone(), offset as usize);
        cursor = offset - bss_base + config.size;
        trace!("global {} at {:#x} ({} bytes)", name, offset, config.size);
    }

    let bss_size = (bss_base - code_len) + cursor;
    let image_size = code_len + bss_size;
    if image_size > MAX_IMAGE_SIZE {
        return Err(LinkError::ImageTooLarge {
            size: image_size,
            limit: MAX_IMAGE_SIZE,
        });
    }

    // ==== RELOCATION ====
    let mut relocations = Vec::new();
    for (index, (name, start, blob)) in blobs.iter().enumerate() {
        for reloc in &blob.relocations {
            let position = start + reloc.offset;
            let found = read_u64(&code, position)?;
            let expected = reloc.target.placeholder();
            if found != expected {
                return Err(LinkError::RelocationMismatch {
                    position,
                    expected,
                    found,
                });
            }

            let value = match &reloc.target {
                RelocTarget::Local(offset) => *start as u64 + offset,
                RelocTarget::Scratch(offset) => scratch_base[index] + offset,
                RelocTarget::Method(target) => {
                    *methods
                        .get(target)
                        .ok_or_else(|| LinkError::UnknownMethod {
                            method: name.to_string(),
                            target: target.clone(),
                        })? as u64
                }
                RelocTarget::Global(global) => {
                    *global_offsets
                        .get(global)
                        .ok_or_else(|| LinkError::UndeclaredGlobal {
                            method: name.to_string(),
                            global: global.clone(),
                        })? as u64
                }
            };
            code[position..position + 8].copy_from_slice(&value.to_le_bytes());
            trace!("patched {:#x} -> {:#x} ({:?})", position, value, reloc.target);
            relocations.push(position);
        }
    }
    relocations.sort_unstable();

    // A token surviving here means an address escaped the relocation records.
    if let Some((position, token)) = code
        .windows(8)
        .enumerate()
        .map(|(pos, w)| (pos, u64::from_le_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]])))
        .find(|(_, value)| tokens.contains(value))
    {
        return Err(LinkError::UnresolvedToken { position, token });
    }

    info!(
        "linked {} methods: {} bytes code, {} bytes bss, {} relocations",
        methods.len(),
        code.len(),
        bss_size,
        relocations.len()
    );

    Ok(LinkedProgram {
        code,
        relocations,
        bss_size: bss_size as usize,
        methods,
        globals: global_offsets,
    })
}

fn read_u64(code: &[u8], position: usize) -> LinkResult<u64> {
    let slot = code
        .get(position..position.saturating_add(8))
        .ok_or(LinkError::RelocationOutOfRange {
            position,
            len: code.len(),
        })?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(slot);
    Ok(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CompileResult;
    use crate::ir::*;
    use bumpalo::Bump;

    /// Emits a fixed blob per method without touching real codegen.
    struct FakeBackend;

    impl Backend for FakeBackend {
        fn arch(&self) -> crate::backend::Arch {
            crate::backend::Arch::Riscv64
        }

        fn compile_method(
            &self,
            _session: &CompilationSession<'_>,
            name: &str,
            _method: &Method,
        ) -> CompileResult<MethodBlob> {
            let mut code = vec![0x90; 3];
            let mut relocations = Vec::new();
            let target = if name == "main" {
                RelocTarget::Global("g".into())
            } else {
                RelocTarget::Scratch(8)
            };
            relocations.push(Relocation {
                offset: code.len(),
                target: target.clone(),
            });
            code.extend_from_slice(&target.placeholder().to_le_bytes());
            Ok(MethodBlob {
                code,
                relocations,
                bss_size: 24,
            })
        }
    }

    fn program() -> Program {
        Program::new("main")
            .with_method("main", vec![assign(GlobalVar::new("g").mem(), 1i64)])
            .with_method("aux", vec![ret(0i64)])
            .with_global("g", GlobalConfig::new(8, 32))
    }

    #[test]
    fn test_layout_and_patching() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let linked = link(&FakeBackend, &program(), &session).unwrap();

        assert_eq!(linked.methods["main"], 0);
        assert_eq!(linked.methods["aux"], 16);
        assert_eq!(linked.code.len(), 16 + 11);
        assert_eq!(linked.relocations, vec![3, 19]);

        // Scratch of "main" at 32, scratch of "aux" at 64, global at 96.
        assert_eq!(linked.globals["g"], 96);
        assert_eq!(read_u64(&linked.code, 3).unwrap(), 96);
        assert_eq!(read_u64(&linked.code, 19).unwrap(), 64 + 8);
        assert_eq!(linked.bss_size, 96 + 8 - 27);
    }

    #[test]
    fn test_validation_errors() {
        let missing = Program::new("nope").with_method("main", vec![ret(0i64)]);
        assert!(matches!(
            validate(&missing),
            Err(LinkError::MissingEntrypoint { .. })
        ));

        let undeclared =
            Program::new("main").with_method("main", vec![assign(Var::new("x"), GlobalVar::new("g").mem())]);
        assert!(matches!(
            validate(&undeclared),
            Err(LinkError::UndeclaredGlobal { .. })
        ));

        let unknown = Program::new("main").with_method("main", vec![call_method("ghost", None)]);
        assert!(matches!(
            validate(&unknown),
            Err(LinkError::UnknownMethod { .. })
        ));

        let bad_align = program().with_global("h", GlobalConfig::new(8, 12));
        assert!(matches!(
            validate(&bad_align),
            Err(LinkError::InvalidGlobal { .. })
        ));
    }

    #[test]
    fn test_link_order_puts_entrypoint_first() {
        let p = Program::new("zz")
            .with_method("aa", vec![])
            .with_method("zz", vec![])
            .with_method("mm", vec![]);
        assert_eq!(link_order(&p), ["zz", "aa", "mm"]);
    }

    #[test]
    fn test_relocated_code_adds_base() {
        let linked = LinkedProgram {
            code: 0x10u64.to_le_bytes().to_vec(),
            relocations: vec![0],
            bss_size: 0,
            ..Default::default()
        };
        let code = linked.relocated_code(0x40_0000);
        assert_eq!(u64::from_le_bytes(code[..8].try_into().unwrap()), 0x40_0010);
    }
}
