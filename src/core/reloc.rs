//! Relocation records and placeholder tokens.
//!
//! Every absolute address a method materialises is an 8-byte immediate whose
//! position is recorded as a [`Relocation`]. Until link time those bytes hold
//! a placeholder: a blob-local offset for method data and scratch, or a
//! tagged FNV-1a token naming a method or global. The linker checks the
//! placeholder before it patches in the final offset.

/// Tag in the top 16 bits of a method-address token.
pub const METHOD_TOKEN_TAG: u64 = 0x5ead_0000_0000_0000;

/// Tag in the top 16 bits of a global-address token.
pub const GLOBAL_TOKEN_TAG: u64 = 0x5eae_0000_0000_0000;

const TOKEN_TAG_MASK: u64 = 0xffff_0000_0000_0000;
const TOKEN_HASH_MASK: u64 = 0x0000_ffff_ffff_ffff;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(FNV_PRIME)
    })
}

pub fn method_token(name: &str) -> u64 {
    METHOD_TOKEN_TAG | (fnv1a64(name.as_bytes()) & TOKEN_HASH_MASK)
}

pub fn global_token(name: &str) -> u64 {
    GLOBAL_TOKEN_TAG | (fnv1a64(name.as_bytes()) & TOKEN_HASH_MASK)
}

/// True when `value` carries one of the token tags. Literals like this are
/// rejected so that the final token scan cannot misfire.
pub fn is_token_like(value: u64) -> bool {
    matches!(value & TOKEN_TAG_MASK, METHOD_TOKEN_TAG | GLOBAL_TOKEN_TAG)
}

/// What an absolute-address slot points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelocTarget {
    /// Offset into the method's own blob (code or constant data).
    Local(u64),
    /// Offset into the method's scratch (BSS) region.
    Scratch(u64),
    /// Start of another method.
    Method(String),
    /// A declared global.
    Global(String),
}

impl RelocTarget {
    /// Bytes the compiler leaves in the slot until link time.
    pub fn placeholder(&self) -> u64 {
        match self {
            RelocTarget::Local(offset) | RelocTarget::Scratch(offset) => *offset,
            RelocTarget::Method(name) => method_token(name),
            RelocTarget::Global(name) => global_token(name),
        }
    }
}

/// An 8-byte little-endian absolute address at `offset` in a method blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Relocation {
    pub offset: usize,
    pub target: RelocTarget,
}
