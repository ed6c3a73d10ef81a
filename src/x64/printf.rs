// This module lowers the printf diagnostic intrinsic. Only `%x` (lower-case hexadecimal,
// no leading zeros) and `%%` are understood. The arguments are evaluated into registers
// first; the lowering then drops the stack pointer by PRINTF_STACK_RESERVE bytes, saves
// every register it is about to touch into that area and uses the remaining bytes as a
// digit buffer, so that printf can appear anywhere without disturbing live values. Each
// literal run and each converted number becomes one write(2) to stdout. If a write fails
// the sequence switches, once, to /dev/kmsg, announces the fallback there and repeats the
// failed write; a fallback descriptor is closed again at the end. The frame allocator
// adds PRINTF_STACK_RESERVE to the frame of every method that contains a printf.

//! The printf intrinsic.

use log::warn;

use super::calling_convention::{
    linux, R10, R12, R13, R14, R15, R8, R9, RAX, RCX, R11, RDI, RDX, RSI, RSP,
};
use super::compiler::MethodCompiler;
use super::encoder::{AluOp, JumpCondition};
use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::AsmReg;
use crate::ir::{Fragment, Width};

/// Registers saved around the intrinsic, in save-area order.
pub const SAVED_REGS: [AsmReg; 13] = [
    RAX, RDI, RSI, RDX, RCX, R8, R9, R10, R11, R12, R13, R14, R15,
];

/// Bytes of digit buffer after the save area.
pub const BUFFER_SIZE: u32 = 32;

const BUFFER_OFFSET: i32 = SAVED_REGS.len() as i32 * 8;

/// Stack the intrinsic claims below the current stack pointer.
pub const PRINTF_STACK_RESERVE: u32 = SAVED_REGS.len() as u32 * 8 + BUFFER_SIZE;

const KMSG_PATH: &[u8] = b"/dev/kmsg\0";
const FALLBACK_NOTICE: &[u8] = b"printf error: using fallback kmsg\n";

const HEX_DIGITS: i32 = 16;

/// One piece of a parsed format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(Vec<u8>),
    Hex,
}

/// Split a format string into literal text and `%x` conversions.
pub fn parse_format(format: &str) -> CompileResult<Vec<Segment>> {
    let invalid = |reason: String| CompileError::InvalidFormat {
        format: format.to_string(),
        reason,
    };

    let mut segments = Vec::new();
    let mut text = Vec::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            let mut buf = [0u8; 4];
            text.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('%') => text.push(b'%'),
            Some('x') => {
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Hex);
            }
            Some(other) => return Err(invalid(format!("unsupported conversion %{other}"))),
            None => return Err(invalid("dangling '%' at end of format".to_string())),
        }
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

impl MethodCompiler<'_, '_> {
    pub(super) fn lower_printf(&mut self, format: &str, args: &[Fragment]) -> CompileResult<()> {
        let segments = parse_format(format)?;
        let conversions = segments.iter().filter(|s| **s == Segment::Hex).count();
        if conversions != args.len() {
            return Err(CompileError::InvalidFormat {
                format: format.to_string(),
                reason: format!("{conversions} conversion(s) but {} argument(s)", args.len()),
            });
        }
        if segments.is_empty() {
            warn!("printf with an empty format produces no output");
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval_value(arg)?.reg);
        }

        let enc = self.enc();
        enc.alu_reg_imm(AluOp::Sub, RSP, PRINTF_STACK_RESERVE as i32)?;
        for (idx, &reg) in SAVED_REGS.iter().enumerate() {
            enc.store(RSP, idx as i32 * 8, reg, Width::W64)?;
        }
        enc.lea(R12, RSP, BUFFER_OFFSET)?;
        enc.mov_reg_imm(R15, linux::STDOUT_FILENO)?;

        let mut next_value = values.iter();
        for segment in &segments {
            match segment {
                Segment::Text(bytes) => {
                    self.load_data_address(R13, bytes)?;
                    self.enc().mov_reg_imm(R14, bytes.len() as i64)?;
                }
                Segment::Hex => {
                    let reg = *next_value.next().ok_or_else(|| CompileError::InvalidFormat {
                        format: format.to_string(),
                        reason: "missing argument".to_string(),
                    })?;
                    let slot = SAVED_REGS
                        .iter()
                        .position(|&r| r == reg)
                        .ok_or(CompileError::UnsupportedFragment {
                            what: format!("printf argument in unsaved register {reg:?}"),
                        })?;
                    self.enc().load(R8, RSP, slot as i32 * 8, Width::W64)?;
                    self.emit_hex()?;
                }
            }
            self.emit_write()?;
        }

        let done = self.printf_label("close_done");
        self.enc()
            .alu_reg_imm(AluOp::Cmp, R15, linux::STDOUT_FILENO as i32)?;
        self.branch_to(JumpCondition::Equal, done)?;
        let enc = self.enc();
        enc.mov_reg_reg(RDI, R15)?;
        enc.mov_reg_imm(RAX, linux::SYS_CLOSE)?;
        enc.syscall()?;
        self.place_label(done)?;

        let enc = self.enc();
        for (idx, &reg) in SAVED_REGS.iter().enumerate() {
            enc.load(reg, RSP, idx as i32 * 8, Width::W64)?;
        }
        enc.alu_reg_imm(AluOp::Add, RSP, PRINTF_STACK_RESERVE as i32)?;

        for reg in values {
            self.free(reg);
        }
        Ok(())
    }

    /// Convert R8 to hex digits in the buffer at R12. Leaves the first
    /// significant digit's address in R13 and the digit count in R14.
    fn emit_hex(&mut self) -> CompileResult<()> {
        let head = self.printf_label("loop");
        let less = self.printf_label("less");
        let store = self.printf_label("store");
        let trim_loop = self.printf_label("trim_loop");
        let trim_done = self.printf_label("trim_done");

        let enc = self.enc();
        enc.lea(R13, R12, HEX_DIGITS)?;
        enc.mov_reg_reg(R9, R8)?;

        self.place_label(head)?;
        let enc = self.enc();
        enc.mov_reg_reg(RAX, R9)?;
        enc.alu_reg_imm(AluOp::And, RAX, 0xf)?;
        enc.alu_reg_imm(AluOp::Cmp, RAX, 10)?;
        self.branch_to(JumpCondition::Less, less)?;
        self.enc().alu_reg_imm(AluOp::Add, RAX, b'a' as i32 - 10)?;
        self.jump_to(store)?;
        self.place_label(less)?;
        self.enc().alu_reg_imm(AluOp::Add, RAX, b'0' as i32)?;
        self.place_label(store)?;
        let enc = self.enc();
        enc.alu_reg_imm(AluOp::Sub, R13, 1)?;
        enc.store(R13, 0, RAX, Width::W8)?;
        enc.shr_imm(R9, 4)?;
        enc.alu_reg_reg(AluOp::Cmp, R13, R12)?;
        self.branch_to(JumpCondition::NotEqual, head)?;

        // Skip leading zeros, keeping at least one digit.
        self.place_label(trim_loop)?;
        let enc = self.enc();
        enc.lea(R10, R12, HEX_DIGITS - 1)?;
        enc.alu_reg_reg(AluOp::Cmp, R13, R10)?;
        self.branch_to(JumpCondition::Equal, trim_done)?;
        let enc = self.enc();
        enc.load(RAX, R13, 0, Width::W8)?;
        enc.alu_reg_imm(AluOp::Cmp, RAX, b'0' as i32)?;
        self.branch_to(JumpCondition::NotEqual, trim_done)?;
        self.enc().alu_reg_imm(AluOp::Add, R13, 1)?;
        self.jump_to(trim_loop)?;

        self.place_label(trim_done)?;
        let enc = self.enc();
        enc.lea(R14, R12, HEX_DIGITS)?;
        enc.alu_reg_reg(AluOp::Sub, R14, R13)?;
        Ok(())
    }

    /// write(R15, R13, R14), switching to /dev/kmsg on the first failure.
    fn emit_write(&mut self) -> CompileResult<()> {
        let failed = self.printf_label("write_failed");
        let written = self.printf_label("written");

        self.emit_write_syscall()?;
        self.enc().test_reg_reg(RAX, RAX)?;
        self.branch_to(JumpCondition::Sign, failed)?;
        self.jump_to(written)?;

        self.place_label(failed)?;
        self.enc()
            .alu_reg_imm(AluOp::Cmp, R15, linux::STDOUT_FILENO as i32)?;
        self.branch_to(JumpCondition::NotEqual, written)?;
        self.enc().mov_reg_imm(RDI, linux::AT_FDCWD)?;
        self.load_data_address(RSI, KMSG_PATH)?;
        let enc = self.enc();
        enc.mov_reg_imm(RDX, linux::O_WRONLY)?;
        enc.mov_reg_imm(RAX, linux::SYS_OPENAT)?;
        enc.syscall()?;
        enc.test_reg_reg(RAX, RAX)?;
        self.branch_to(JumpCondition::Sign, written)?;
        self.enc().mov_reg_reg(R15, RAX)?;

        self.enc().mov_reg_reg(RDI, R15)?;
        self.load_data_address(RSI, FALLBACK_NOTICE)?;
        let enc = self.enc();
        enc.mov_reg_imm(RDX, FALLBACK_NOTICE.len() as i64)?;
        enc.mov_reg_imm(RAX, linux::SYS_WRITE)?;
        enc.syscall()?;
        self.emit_write_syscall()?;

        self.place_label(written)
    }

    fn emit_write_syscall(&mut self) -> CompileResult<()> {
        let enc = self.enc();
        enc.mov_reg_reg(RDI, R15)?;
        enc.mov_reg_reg(RSI, R13)?;
        enc.mov_reg_reg(RDX, R14)?;
        enc.mov_reg_imm(RAX, linux::SYS_WRITE)?;
        enc.syscall()?;
        Ok(())
    }
}
