// This module wraps the iced-x86 CodeAssembler and is the only place in the crate that knows
// how x86-64 instructions are spelled. X64Encoder converts AsmReg register references into
// iced register operands at 8/16/32/64-bit widths and exposes the small instruction set the
// method compiler lowers to: moves and width-correct loads/stores against base+displacement
// operands, the integer ALU operations, compares and conditional jumps, push/pop, call
// through a register, syscall, and the mfence/clflush pair used by the cache-maintenance
// intrinsic. Labels are iced CodeLabels; because iced allows only one label per instruction
// the encoder inserts a zero-byte pseudo instruction when two labels land on the same spot.
// Absolute addresses are materialised with a 10-byte `mov r64, imm64` whose position is
// recovered after assembly from a label bound to the instruction, which is how relocation
// offsets are reported to the linker.

//! x86-64 instruction encoding using iced-x86.

use crate::core::register_file::AsmReg;
use crate::ir::Width;
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, Code, IcedError, Instruction, Register};

/// Byte offset of the immediate inside `mov r64, imm64` (REX.W + opcode).
pub const MOV_IMM64_IMM_OFFSET: usize = 2;

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Unsupported instruction or operand combination.
    UnsupportedInstruction,
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// Label was never bound to a position.
    UnboundLabel,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::UnsupportedInstruction => {
                write!(f, "Unsupported instruction or operand combination")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::UnboundLabel => write!(f, "Label was never bound"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<IcedError> for EncodingError {
    fn from(e: IcedError) -> Self {
        EncodingError::AssemblyError(e.to_string())
    }
}

/// Jump conditions for conditional branches (signed compares).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    Sign,
    /// Unsigned below.
    Below,
}

/// Integer ALU operations with a register or immediate source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

fn gp64(reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }

    const GP64_REGS: [AsmRegister64; 16] = [
        rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
    ];

    GP64_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister)
}

fn gp32(reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }

    const GP32_REGS: [AsmRegister32; 16] = [
        eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
    ];

    GP32_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister)
}

fn gp16(reg: AsmReg) -> Result<AsmRegister16, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }

    const GP16_REGS: [AsmRegister16; 16] = [
        ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
    ];

    GP16_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister)
}

fn gp8(reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
    if reg.bank != 0 {
        return Err(EncodingError::InvalidRegister);
    }

    const GP8_REGS: [AsmRegister8; 16] = [
        al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
    ];

    GP8_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::InvalidRegister)
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
    /// A label was bound and no instruction has been added since.
    label_pending: bool,
    /// Instructions emitted so far, pseudo instructions excluded.
    instruction_count: usize,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64)?;

        Ok(Self {
            assembler,
            label_pending: false,
            instruction_count: 0,
        })
    }

    fn emit(
        &mut self,
        f: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    ) -> Result<(), EncodingError> {
        f(&mut self.assembler)?;
        self.label_pending = false;
        self.instruction_count += 1;
        Ok(())
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    // ==== LABEL MANAGEMENT FOR CONTROL FLOW ====

    /// Create a new, unbound label.
    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind_label(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        if self.label_pending {
            // iced allows a single label per instruction.
            self.assembler.zero_bytes()?;
        }
        self.assembler.set_label(label)?;
        self.label_pending = true;
        Ok(())
    }

    /// Emit unconditional jump.
    pub fn jmp(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.emit(|a| a.jmp(label))
    }

    /// Emit conditional jump.
    pub fn jcc(&mut self, condition: JumpCondition, label: CodeLabel) -> Result<(), EncodingError> {
        self.emit(|a| match condition {
            JumpCondition::Equal => a.je(label),
            JumpCondition::NotEqual => a.jne(label),
            JumpCondition::Less => a.jl(label),
            JumpCondition::Greater => a.jg(label),
            JumpCondition::LessEqual => a.jle(label),
            JumpCondition::GreaterEqual => a.jge(label),
            JumpCondition::Sign => a.js(label),
            JumpCondition::Below => a.jb(label),
        })
    }

    // ==== MOVES ====

    /// Emit MOV instruction - register to register.
    pub fn mov_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (gp64(dst)?, gp64(src)?);
        self.emit(|a| a.mov(d, s))
    }

    /// Emit MOV instruction - 32-bit register to register, clearing the upper half.
    pub fn mov32_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (gp32(dst)?, gp32(src)?);
        self.emit(|a| a.mov(d, s))
    }

    /// Load an immediate using the shortest encoding that preserves the value.
    pub fn mov_reg_imm(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        if let Ok(v) = u32::try_from(imm) {
            let d = gp32(dst)?;
            self.emit(|a| a.mov(d, v))
        } else if let Ok(v) = i32::try_from(imm) {
            // mov r/m64, imm32 sign-extends; code_asm only offers the imm64 form here.
            let d = Register::from(gp64(dst)?);
            let insn = Instruction::with2(Code::Mov_rm64_imm32, d, v)?;
            self.emit(|a| a.add_instruction(insn))
        } else {
            let d = gp64(dst)?;
            self.emit(|a| a.mov(d, imm as u64))
        }
    }

    /// Emit `mov r64, imm64` with the full 8-byte immediate. Returns a label
    /// bound to the instruction so its offset can be found after assembly.
    pub fn mov_abs(&mut self, dst: AsmReg, value: u64) -> Result<CodeLabel, EncodingError> {
        let d = gp64(dst)?;
        let mut anchor = self.create_label();
        self.bind_label(&mut anchor)?;
        self.emit(|a| a.mov(d, value))?;
        Ok(anchor)
    }

    /// Load `width` bytes from `[base + disp]`, zero-extending narrow values.
    pub fn load(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        disp: i32,
        width: Width,
    ) -> Result<(), EncodingError> {
        let b = gp64(base)?;
        match width {
            Width::W64 => {
                let d = gp64(dst)?;
                self.emit(|a| a.mov(d, qword_ptr(b + disp)))
            }
            Width::W32 => {
                let d = gp32(dst)?;
                self.emit(|a| a.mov(d, dword_ptr(b + disp)))
            }
            Width::W16 => {
                let d = gp32(dst)?;
                self.emit(|a| a.movzx(d, word_ptr(b + disp)))
            }
            Width::W8 => {
                let d = gp32(dst)?;
                self.emit(|a| a.movzx(d, byte_ptr(b + disp)))
            }
        }
    }

    /// Store the low `width` bytes of `src` to `[base + disp]`.
    pub fn store(
        &mut self,
        base: AsmReg,
        disp: i32,
        src: AsmReg,
        width: Width,
    ) -> Result<(), EncodingError> {
        let b = gp64(base)?;
        match width {
            Width::W64 => {
                let s = gp64(src)?;
                self.emit(|a| a.mov(qword_ptr(b + disp), s))
            }
            Width::W32 => {
                let s = gp32(src)?;
                self.emit(|a| a.mov(dword_ptr(b + disp), s))
            }
            Width::W16 => {
                let s = gp16(src)?;
                self.emit(|a| a.mov(word_ptr(b + disp), s))
            }
            Width::W8 => {
                let s = gp8(src)?;
                self.emit(|a| a.mov(byte_ptr(b + disp), s))
            }
        }
    }

    /// Zero-extend the low `width` bits of `reg` in place.
    pub fn zero_extend(&mut self, reg: AsmReg, width: Width) -> Result<(), EncodingError> {
        match width {
            Width::W64 => Ok(()),
            Width::W32 => self.mov32_reg_reg(reg, reg),
            Width::W16 => {
                let (d, s) = (gp32(reg)?, gp16(reg)?);
                self.emit(|a| a.movzx(d, s))
            }
            Width::W8 => {
                let (d, s) = (gp32(reg)?, gp8(reg)?);
                self.emit(|a| a.movzx(d, s))
            }
        }
    }

    /// Emit LEA instruction - `dst = base + disp`.
    pub fn lea(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<(), EncodingError> {
        let (d, b) = (gp64(dst)?, gp64(base)?);
        self.emit(|a| a.lea(d, qword_ptr(b + disp)))
    }

    // ==== ARITHMETIC ====

    /// 64-bit ALU operation, register source.
    pub fn alu_reg_reg(&mut self, op: AluOp, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (gp64(dst)?, gp64(src)?);
        self.emit(|a| match op {
            AluOp::Add => a.add(d, s),
            AluOp::Sub => a.sub(d, s),
            AluOp::And => a.and(d, s),
            AluOp::Or => a.or(d, s),
            AluOp::Xor => a.xor(d, s),
            AluOp::Cmp => a.cmp(d, s),
        })
    }

    /// 64-bit ALU operation, sign-extended 32-bit immediate source.
    pub fn alu_reg_imm(&mut self, op: AluOp, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let d = gp64(dst)?;
        self.emit(|a| match op {
            AluOp::Add => a.add(d, imm),
            AluOp::Sub => a.sub(d, imm),
            AluOp::And => a.and(d, imm),
            AluOp::Or => a.or(d, imm),
            AluOp::Xor => a.xor(d, imm),
            AluOp::Cmp => a.cmp(d, imm),
        })
    }

    /// Emit IMUL instruction - `dst *= src` (low 64 bits).
    pub fn imul_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let (d, s) = (gp64(dst)?, gp64(src)?);
        self.emit(|a| a.imul_2(d, s))
    }

    pub fn shl_imm(&mut self, dst: AsmReg, amount: u8) -> Result<(), EncodingError> {
        let d = gp64(dst)?;
        self.emit(|a| a.shl(d, amount as u32))
    }

    /// Logical right shift.
    pub fn shr_imm(&mut self, dst: AsmReg, amount: u8) -> Result<(), EncodingError> {
        let d = gp64(dst)?;
        self.emit(|a| a.shr(d, amount as u32))
    }

    pub fn test_reg_reg(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let (l, r) = (gp64(left)?, gp64(right)?);
        self.emit(|a| a.test(l, r))
    }

    // ==== STACK, CALLS AND SYSTEM ====

    pub fn push_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = gp64(reg)?;
        self.emit(|a| a.push(r))
    }

    pub fn pop_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = gp64(reg)?;
        self.emit(|a| a.pop(r))
    }

    pub fn call_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = gp64(reg)?;
        self.emit(|a| a.call(r))
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.emit(|a| a.ret())
    }

    pub fn syscall(&mut self) -> Result<(), EncodingError> {
        self.emit(|a| a.syscall())
    }

    pub fn mfence(&mut self) -> Result<(), EncodingError> {
        self.emit(|a| a.mfence())
    }

    /// Flush the cache line containing `[reg]`.
    pub fn clflush(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = gp64(reg)?;
        self.emit(|a| a.clflush(byte_ptr(r)))
    }

    // ==== DATA ====

    /// Emit raw data bytes.
    pub fn data(&mut self, bytes: &[u8]) -> Result<(), EncodingError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.assembler.db(bytes)?;
        self.label_pending = false;
        Ok(())
    }

    /// Generate the final machine code bytes.
    pub fn finalize(mut self) -> Result<AssembledCode, EncodingError> {
        if self.label_pending {
            self.assembler.zero_bytes()?;
        }
        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
        Ok(AssembledCode { result })
    }
}

/// Output of [`X64Encoder::finalize`], assembled at address 0.
pub struct AssembledCode {
    result: CodeAssemblerResult,
}

impl AssembledCode {
    pub fn bytes(&self) -> &[u8] {
        &self.result.inner.code_buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.result.inner.code_buffer
    }

    /// Byte offset of a bound label.
    pub fn label_offset(&self, label: &CodeLabel) -> Result<usize, EncodingError> {
        let ip = self
            .result
            .label_ip(label)
            .map_err(|_| EncodingError::UnboundLabel)?;
        Ok(ip as usize)
    }
}
