// This module describes the two register conventions the x86-64 backend lowers to: the
// System V AMD64 integer calling convention used for calls between compiled methods
// (arguments in RDI, RSI, RDX, RCX, R8, R9 and the result in RAX) and the Linux syscall
// convention (number and result in RAX, arguments in RDI, RSI, RDX, R10, R8, R9, with RCX
// and R11 destroyed by the instruction). It also fixes the pool of registers the method
// compiler may allocate from: only caller-saved registers, so generated code never has to
// preserve anything for its caller beyond the frame pointer it pushes itself, and the
// per-argument preferred-register order used to steer syscall operands straight into
// their final registers.

//! System V x86-64 and Linux syscall register conventions.

use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::AsmReg;

pub const RAX: AsmReg = AsmReg::gp(0);
pub const RCX: AsmReg = AsmReg::gp(1);
pub const RDX: AsmReg = AsmReg::gp(2);
pub const RBX: AsmReg = AsmReg::gp(3);
pub const RSP: AsmReg = AsmReg::gp(4);
pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSI: AsmReg = AsmReg::gp(6);
pub const RDI: AsmReg = AsmReg::gp(7);
pub const R8: AsmReg = AsmReg::gp(8);
pub const R9: AsmReg = AsmReg::gp(9);
pub const R10: AsmReg = AsmReg::gp(10);
pub const R11: AsmReg = AsmReg::gp(11);
pub const R12: AsmReg = AsmReg::gp(12);
pub const R13: AsmReg = AsmReg::gp(13);
pub const R14: AsmReg = AsmReg::gp(14);
pub const R15: AsmReg = AsmReg::gp(15);

/// Registers the method compiler may hand out. The last entry is used first.
pub const ALLOCATABLE_REGS: [AsmReg; 9] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

/// Trait describing where a convention puts arguments and results.
pub trait CCAssigner {
    /// Human-readable name used in errors.
    fn name(&self) -> &'static str;

    /// Argument registers in argument order.
    fn arg_registers(&self) -> &'static [AsmReg];

    /// Register holding the result.
    fn return_register(&self) -> AsmReg;

    /// Registers destroyed by the transfer besides the argument and result
    /// registers.
    fn scratch_clobbers(&self) -> &'static [AsmReg];

    /// Check an argument count up front.
    fn check_arg_count(&self, count: usize) -> CompileResult<()> {
        let max = self.arg_registers().len();
        if count > max {
            return Err(CompileError::TooManyArguments {
                what: self.name(),
                count,
                max,
            });
        }
        Ok(())
    }

    /// Every register whose value does not survive a transfer with
    /// `arg_count` arguments.
    fn clobbered(&self, arg_count: usize) -> Vec<AsmReg> {
        let args = &self.arg_registers()[..arg_count.min(self.arg_registers().len())];
        let mut regs = vec![self.return_register()];
        for &reg in args.iter().chain(self.scratch_clobbers()) {
            if !regs.contains(&reg) {
                regs.push(reg);
            }
        }
        regs
    }
}

/// System V x86-64 integer calling convention.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysVAssigner;

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    pub const GP_ARG_REGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

    pub fn new() -> Self {
        Self
    }
}

impl CCAssigner for SysVAssigner {
    fn name(&self) -> &'static str {
        "call"
    }

    fn arg_registers(&self) -> &'static [AsmReg] {
        &Self::GP_ARG_REGS
    }

    fn return_register(&self) -> AsmReg {
        RAX
    }

    fn scratch_clobbers(&self) -> &'static [AsmReg] {
        // A callee may use the whole allocatable pool.
        &ALLOCATABLE_REGS
    }
}

/// Linux x86-64 `syscall` convention.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallAssigner;

impl SyscallAssigner {
    pub const ARG_REGS: [AsmReg; 6] = [RDI, RSI, RDX, R10, R8, R9];

    pub fn new() -> Self {
        Self
    }
}

impl CCAssigner for SyscallAssigner {
    fn name(&self) -> &'static str {
        "syscall"
    }

    fn arg_registers(&self) -> &'static [AsmReg] {
        &Self::ARG_REGS
    }

    fn return_register(&self) -> AsmReg {
        RAX
    }

    fn scratch_clobbers(&self) -> &'static [AsmReg] {
        const CLOBBERS: [AsmReg; 2] = [RCX, R11];
        &CLOBBERS
    }
}

/// Preferred registers for syscall argument `index`: its own slot first,
/// then registers not needed by earlier arguments, earlier slots last.
pub fn syscall_preferred_registers(index: usize) -> Vec<AsmReg> {
    let args = &SyscallAssigner::ARG_REGS;
    let Some(&target) = args.get(index) else {
        return Vec::new();
    };
    let avoid = &args[..index];
    let base = [target, R11, RCX, R9, R8, RDX, R10, RSI, RDI];

    let mut preferred: Vec<AsmReg> = Vec::with_capacity(base.len());
    for reg in base {
        if !avoid.contains(&reg) && !preferred.contains(&reg) {
            preferred.push(reg);
        }
    }
    for reg in base {
        if !preferred.contains(&reg) {
            preferred.push(reg);
        }
    }
    preferred
}

/// Linux x86-64 syscall numbers and flags used by the backend and samples.
pub mod linux {
    pub const SYS_WRITE: i64 = 1;
    pub const SYS_CLOSE: i64 = 3;
    pub const SYS_GETPID: i64 = 39;
    pub const SYS_EXIT: i64 = 60;
    pub const SYS_EXIT_GROUP: i64 = 231;
    pub const SYS_OPENAT: i64 = 257;

    pub const STDOUT_FILENO: i64 = 1;
    pub const AT_FDCWD: i64 = -100;
    pub const O_WRONLY: i64 = 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysv_gp_argument_assignment() {
        let assigner = SysVAssigner::new();
        assert_eq!(assigner.arg_registers(), &[RDI, RSI, RDX, RCX, R8, R9]);
        assert!(assigner.check_arg_count(6).is_ok());
        assert!(matches!(
            assigner.check_arg_count(7),
            Err(CompileError::TooManyArguments { max: 6, count: 7, .. })
        ));
        assert_eq!(assigner.return_register(), RAX);
    }

    #[test]
    fn test_syscall_clobbers() {
        let clobbered = SyscallAssigner::new().clobbered(6);
        for reg in [RAX, RCX, R11, RDI, RSI, RDX, R10, R8, R9] {
            assert!(clobbered.contains(&reg), "{reg:?} should be clobbered");
        }
        assert!(!clobbered.contains(&RBX));

        // Unused argument registers survive a syscall.
        let two = SyscallAssigner::new().clobbered(2);
        assert_eq!(two, vec![RAX, RDI, RSI, RCX, R11]);

        // A callee may use any allocatable register.
        let call = SysVAssigner::new().clobbered(0);
        for reg in ALLOCATABLE_REGS {
            assert!(call.contains(&reg));
        }
    }

    #[test]
    fn test_allocatable_pool_is_caller_saved() {
        for reg in [RBX, RSP, RBP, R12, R13, R14, R15] {
            assert!(!ALLOCATABLE_REGS.contains(&reg));
        }
    }

    #[test]
    fn test_syscall_preferred_registers() {
        assert_eq!(syscall_preferred_registers(0)[0], RDI);
        let third = syscall_preferred_registers(2);
        assert_eq!(third[0], RDX);
        // RDI and RSI hold earlier arguments, so they come last.
        assert_eq!(&third[third.len() - 2..], &[RSI, RDI]);
        // RDX is both the target and a fallback, so it appears once.
        assert_eq!(third.len(), 8);
        let mut unique = third.clone();
        unique.dedup();
        assert_eq!(unique.len(), third.len());
        assert!(syscall_preferred_registers(6).is_empty());
    }
}
