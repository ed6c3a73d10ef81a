//! Register allocation and management.
//!
//! This module implements the RegisterFile: a LIFO free-register pool scoped to
//! a single method compilation. There is no eviction and no spilling; when too
//! many values are live at once the allocation fails and the caller reports a
//! resource-exhaustion error. The pool remembers which registers it handed out
//! so that a method can be balance-checked once it has been compiled.

use thiserror::Error;

/// Maximum number of register banks supported (GP, FP, etc.).
pub const MAX_REGISTER_BANKS: usize = 4;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    /// General-purpose register with the given hardware number.
    pub const fn gp(id: RegId) -> Self {
        Self { bank: 0, id }
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegBitSet {
    /// Bit mask for each register bank.
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    /// Create empty register set.
    pub fn new() -> Self {
        Self {
            banks: [0; MAX_REGISTER_BANKS],
        }
    }

    /// Build a set from a list of registers.
    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id >= 64 {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    /// Set a register.
    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    /// Clear a register.
    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    /// Number of registers in the set.
    pub fn len(&self) -> usize {
        self.banks.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.iter().all(|&b| b == 0)
    }

    /// Iterate over the registers in the set in (bank, id) order.
    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        self.banks.iter().enumerate().flat_map(|(bank, &mask)| {
            (0..64u8)
                .filter(move |id| mask & (1u64 << id) != 0)
                .map(move |id| AsmReg::new(bank as RegBank, id))
        })
    }
}

/// Register allocation errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAllocError {
    /// Every allocatable register is live.
    #[error("no registers available ({live} live)")]
    NoRegistersAvailable { live: usize },
    /// The register is not part of the allocatable pool.
    #[error("register {0:?} is not allocatable")]
    InvalidRegister(AsmReg),
}

/// RegisterFile manages register allocation for a single method.
///
/// Free registers are kept in a stack; `alloc` pops from the end so the most
/// recently freed register is reused first.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    /// Registers available for allocation, popped from the back.
    free: Vec<AsmReg>,
    /// Every register the pool manages.
    allocatable: RegBitSet,
    /// Currently allocated registers.
    used: RegBitSet,
    /// Never handed out and freeing it is a no-op.
    stack_pointer: AsmReg,
}

impl RegisterFile {
    /// Create a pool over `initial_free`; the last entry is handed out first.
    pub fn new(initial_free: &[AsmReg], stack_pointer: AsmReg) -> Self {
        let free: Vec<AsmReg> = initial_free
            .iter()
            .copied()
            .filter(|&r| r != stack_pointer)
            .collect();
        Self {
            allocatable: RegBitSet::from_regs(&free),
            free,
            used: RegBitSet::new(),
            stack_pointer,
        }
    }

    /// Pop a free register.
    pub fn alloc(&mut self) -> Result<AsmReg, RegAllocError> {
        let reg = self.free.pop().ok_or(RegAllocError::NoRegistersAvailable {
            live: self.used.len(),
        })?;
        self.used.set(reg);
        log::trace!("regalloc: alloc {:?}", reg);
        Ok(reg)
    }

    /// Take the first free candidate, otherwise fall back to `alloc`.
    pub fn alloc_prefer(&mut self, candidates: &[AsmReg]) -> Result<AsmReg, RegAllocError> {
        for &reg in candidates {
            if self.reserve(reg) {
                return Ok(reg);
            }
        }
        self.alloc()
    }

    /// Allocate a register that is not in `avoid`.
    pub fn alloc_avoiding(&mut self, avoid: &[AsmReg]) -> Result<AsmReg, RegAllocError> {
        let pos = self
            .free
            .iter()
            .rposition(|r| !avoid.contains(r))
            .ok_or(RegAllocError::NoRegistersAvailable {
                live: self.used.len(),
            })?;
        let reg = self.free.remove(pos);
        self.used.set(reg);
        log::trace!("regalloc: alloc {:?} (avoiding {:?})", reg, avoid);
        Ok(reg)
    }

    /// Remove one specific register from the pool. Returns false when the
    /// register is already in use or not managed by this pool.
    pub fn reserve(&mut self, reg: AsmReg) -> bool {
        match self.free.iter().position(|&r| r == reg) {
            Some(pos) => {
                self.free.remove(pos);
                self.used.set(reg);
                log::trace!("regalloc: reserve {:?}", reg);
                true
            }
            None => false,
        }
    }

    /// Return a register to the pool.
    pub fn free(&mut self, reg: AsmReg) {
        if reg == self.stack_pointer || !self.used.contains(reg) {
            return;
        }
        self.used.clear(reg);
        self.free.push(reg);
        log::trace!("regalloc: free {:?}", reg);
    }

    pub fn is_allocated(&self, reg: AsmReg) -> bool {
        self.used.contains(reg)
    }

    pub fn is_allocatable(&self, reg: AsmReg) -> bool {
        self.allocatable.contains(reg)
    }

    /// Registers currently handed out.
    pub fn live(&self) -> &RegBitSet {
        &self.used
    }

    pub fn live_count(&self) -> usize {
        self.used.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// True when every register obtained has been returned.
    pub fn is_balanced(&self) -> bool {
        self.used.is_empty()
    }
}
