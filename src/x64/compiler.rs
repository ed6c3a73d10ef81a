// This module implements MethodCompiler, the x86-64 lowering of one IR method to a
// self-contained machine-code blob. A method is compiled in a single forward pass over its
// fragment tree. Before emission the compiler lays out the stack frame (one 8-byte slot per
// variable, plus the printf reserve when needed) and registers the method's named constant
// data and scratch regions so that pointers to them may appear before their definitions.
// Values are evaluated into registers from a small caller-saved pool; there is no spilling,
// every evaluation frees exactly what it allocated and an unbalanced pool at the end of the
// method is an error. Calls and syscalls evaluate their operands into temporaries, preserve
// live registers the transfer would destroy with push/pop, and then perform a hazard-aware
// parallel move into the argument registers. Control flow uses named labels held in a
// per-method table keyed by session-interned strings; compiler-generated names start with
// '.' and user names may not. All absolute addresses (method and global pointers, constant
// data, scratch) are `mov r64, imm64` instructions whose immediates are recorded as
// relocations and left holding a placeholder for the linker to verify and patch. Returned
// blobs are code followed by the method's constant data.

//! Lowering of a single method to x86-64 machine code.

use hashbrown::{HashMap, HashSet};
use iced_x86::code_asm::CodeLabel;
use log::{debug, trace, warn};

use super::calling_convention::{
    syscall_preferred_registers, CCAssigner, SysVAssigner, SyscallAssigner, ALLOCATABLE_REGS,
    RAX, RBP, RSP,
};
use super::encoder::{AluOp, EncodingError, JumpCondition, X64Encoder, MOV_IMM64_IMM_OFFSET};
use super::printf::PRINTF_STACK_RESERVE;
use crate::core::error::{CompileError, CompileResult};
use crate::core::frame::{align_to, FrameLayout};
use crate::core::register_file::{AsmReg, RegisterFile};
use crate::core::reloc::{is_token_like, RelocTarget, Relocation};
use crate::core::session::CompilationSession;
use crate::ir::{
    visit, CompareKind, Condition, Fragment, MemBase, MemRef, Method, OpKind, StackSlotScope,
    Var, Width,
};

/// Alignment of each scratch region inside a method's BSS.
const SCRATCH_ALIGNMENT: u64 = 8;

/// Output of compiling one method.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    /// Machine code followed by constant data.
    pub code: Vec<u8>,
    /// Absolute-address slots in `code`, sorted by offset.
    pub relocations: Vec<Relocation>,
    /// Bytes of zero-initialised scratch the method needs.
    pub bss_size: u64,
    pub frame: FrameLayout,
}

/// A value held in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Value {
    pub reg: AsmReg,
    pub width: Width,
}

impl Value {
    fn new(reg: AsmReg, width: Width) -> Self {
        Self { reg, width }
    }
}

struct LabelEntry {
    label: CodeLabel,
    placed: bool,
}

struct DataItem {
    label: CodeLabel,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
enum ConstantLoc {
    Data(usize),
    Scratch(u64),
}

enum PendingTarget {
    Data(usize),
    Fixed(RelocTarget),
}

struct PendingReloc {
    anchor: CodeLabel,
    target: PendingTarget,
}

struct ActiveSlot {
    id: u64,
    base: i32,
}

/// Call or syscall operand after evaluation.
#[derive(Clone, Copy)]
enum ArgValue<'f> {
    InReg(AsmReg),
    /// Loaded straight into its argument register after the moves.
    Direct(&'f Fragment),
}

/// Register contents of a literal: narrow literals are zero-extended, as
/// `mov r32, imm32` leaves them.
fn literal_bits(frag: &Fragment) -> Option<i64> {
    match *frag {
        Fragment::Int64(v) => Some(v),
        Fragment::Int32(v) => Some(v as u32 as i64),
        Fragment::Int16(v) => Some(v as u16 as i64),
        Fragment::Int8(v) => Some(v as u8 as i64),
        _ => None,
    }
}

/// Compiles one method. Create one per method; it is consumed by
/// [`MethodCompiler::compile`].
pub struct MethodCompiler<'s, 'arena> {
    name: String,
    session: &'s CompilationSession<'arena>,
    enc: X64Encoder,
    regs: RegisterFile,
    frame: FrameLayout,

    labels: HashMap<&'arena str, LabelEntry>,
    label_counter: u32,
    printf_counter: u32,
    epilogue: &'arena str,
    saves_frame_pointer: bool,

    /// Bytes pushed below the frame by call/syscall preservation.
    push_depth: i32,

    next_param: usize,
    params: HashSet<String>,
    active_slots: Vec<ActiveSlot>,

    data: Vec<DataItem>,
    data_index: HashMap<Vec<u8>, usize>,
    constants: HashMap<String, ConstantLoc>,
    bss_size: u64,
    pending_relocs: Vec<PendingReloc>,
}

impl<'s, 'arena> MethodCompiler<'s, 'arena> {
    pub fn new(
        session: &'s CompilationSession<'arena>,
        name: &str,
        method: &Method,
    ) -> CompileResult<Self> {
        let frame = FrameLayout::compute(method, PRINTF_STACK_RESERVE)?;
        let mut compiler = Self {
            name: name.to_string(),
            session,
            enc: X64Encoder::new()?,
            regs: RegisterFile::new(&ALLOCATABLE_REGS, RSP),
            frame,
            labels: HashMap::new(),
            label_counter: 0,
            printf_counter: 0,
            epilogue: "",
            saves_frame_pointer: visit::makes_calls(method),
            push_depth: 0,
            next_param: 0,
            params: HashSet::new(),
            active_slots: Vec::new(),
            data: Vec::new(),
            data_index: HashMap::new(),
            constants: HashMap::new(),
            bss_size: 0,
            pending_relocs: Vec::new(),
        };
        compiler.epilogue = compiler.internal_label("epilogue");
        compiler.register_constants(method)?;
        Ok(compiler)
    }

    /// Lower `method` and assemble it.
    pub fn compile(mut self, method: &Method) -> CompileResult<CompiledMethod> {
        self.emit_prologue()?;
        for frag in method.fragments() {
            self.lower_stmt(frag)?;
        }

        if !self.regs.is_balanced() {
            return Err(CompileError::RegisterLeak {
                live: self.regs.live_count(),
            });
        }

        self.emit_epilogue()?;
        self.check_labels()?;
        self.finish()
    }

    // ==== FRAME ====

    fn emit_prologue(&mut self) -> CompileResult<()> {
        if self.saves_frame_pointer {
            self.enc.push_reg(RBP)?;
            self.enc.mov_reg_reg(RBP, RSP)?;
        }
        let frame = self.frame.frame_size();
        if frame != 0 {
            self.enc.alu_reg_imm(AluOp::Sub, RSP, frame as i32)?;
        }
        Ok(())
    }

    fn emit_epilogue(&mut self) -> CompileResult<()> {
        let epilogue = self.epilogue;
        self.place_label(epilogue)?;
        let frame = self.frame.frame_size();
        if frame != 0 {
            self.enc.alu_reg_imm(AluOp::Add, RSP, frame as i32)?;
        }
        if self.saves_frame_pointer {
            self.enc.pop_reg(RBP)?;
        }
        self.enc.ret()?;
        Ok(())
    }

    fn var_disp(&self, var: &Var) -> CompileResult<i32> {
        let offset = self.frame.offset(var.name())?;
        offset
            .checked_add(self.push_depth)
            .ok_or(CompileError::FrameTooLarge {
                size: offset as u64 + self.push_depth as u64,
            })
    }

    fn slot_disp(&self, slot: u64, disp: i64) -> CompileResult<i32> {
        let active = self
            .active_slots
            .iter()
            .rev()
            .find(|s| s.id == slot)
            .ok_or(CompileError::InactiveStackSlot { id: slot })?;
        let total = active.base as i64 + disp + self.push_depth as i64;
        i32::try_from(total).map_err(|_| CompileError::DisplacementOutOfRange { disp })
    }

    // ==== LABELS ====

    fn internal_label(&mut self, kind: &str) -> &'arena str {
        self.label_counter += 1;
        self.session
            .intern_str(&format!(".ir_{kind}_{}", self.label_counter))
    }

    pub(super) fn printf_label(&mut self, kind: &str) -> &'arena str {
        self.printf_counter += 1;
        self.session
            .intern_str(&format!(".printf_{kind}_{}", self.printf_counter))
    }

    fn user_label<'n>(&self, name: &'n str) -> CompileResult<&'n str> {
        if name.is_empty() {
            return Err(CompileError::EmptyName { what: "label" });
        }
        if name.starts_with('.') {
            return Err(CompileError::ReservedLabel {
                name: name.to_string(),
            });
        }
        Ok(name)
    }

    fn label_of(&mut self, name: &str) -> CodeLabel {
        let key = self.session.intern_str(name);
        let enc = &mut self.enc;
        self.labels
            .entry(key)
            .or_insert_with(|| LabelEntry {
                label: enc.create_label(),
                placed: false,
            })
            .label
    }

    pub(super) fn place_label(&mut self, name: &str) -> CompileResult<()> {
        let key = self.session.intern_str(name);
        let enc = &mut self.enc;
        let entry = self.labels.entry(key).or_insert_with(|| LabelEntry {
            label: enc.create_label(),
            placed: false,
        });
        if entry.placed {
            return Err(CompileError::DuplicateLabel {
                name: name.to_string(),
            });
        }
        entry.placed = true;
        let mut label = entry.label;
        self.enc.bind_label(&mut label)?;
        entry.label = label;
        trace!("{}: label {}", self.name, name);
        Ok(())
    }

    pub(super) fn jump_to(&mut self, name: &str) -> CompileResult<()> {
        let label = self.label_of(name);
        self.enc.jmp(label)?;
        Ok(())
    }

    pub(super) fn branch_to(&mut self, condition: JumpCondition, name: &str) -> CompileResult<()> {
        let label = self.label_of(name);
        self.enc.jcc(condition, label)?;
        Ok(())
    }

    fn check_labels(&self) -> CompileResult<()> {
        let mut missing: Vec<&str> = self
            .labels
            .iter()
            .filter(|(_, entry)| !entry.placed)
            .map(|(name, _)| *name)
            .collect();
        missing.sort_unstable();
        match missing.first() {
            Some(name) => Err(CompileError::UndefinedLabel {
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    // ==== CONSTANTS AND ADDRESSES ====

    fn register_constants(&mut self, method: &Method) -> CompileResult<()> {
        let mut found = Vec::new();
        visit::walk_method(method, &mut |frag| {
            if matches!(frag, Fragment::ConstantBytes { .. } | Fragment::Scratch { .. }) {
                found.push(frag);
            }
        });

        for frag in found {
            let (name, loc) = match frag {
                Fragment::ConstantBytes { name, data } => {
                    (name, ConstantLoc::Data(self.intern_data(data.clone())?))
                }
                Fragment::Scratch { name, size } => {
                    let offset = align_to(self.bss_size, SCRATCH_ALIGNMENT);
                    self.bss_size = offset + size;
                    (name, ConstantLoc::Scratch(offset))
                }
                _ => continue,
            };
            if name.is_empty() {
                return Err(CompileError::EmptyName { what: "constant" });
            }
            if self.constants.insert(name.clone(), loc).is_some() {
                return Err(CompileError::DuplicateConstant { name: name.clone() });
            }
        }
        Ok(())
    }

    fn intern_data(&mut self, bytes: Vec<u8>) -> CompileResult<usize> {
        if let Some(&index) = self.data_index.get(&bytes) {
            return Ok(index);
        }
        for window in bytes.windows(8) {
            let mut word = [0u8; 8];
            word.copy_from_slice(window);
            Self::check_literal(i64::from_le_bytes(word))?;
        }
        let index = self.data.len();
        let label = self.enc.create_label();
        self.data.push(DataItem {
            label,
            bytes: bytes.clone(),
        });
        self.data_index.insert(bytes, index);
        Ok(index)
    }

    /// Materialise the address of literal `bytes` in `dst`.
    pub(super) fn load_data_address(&mut self, dst: AsmReg, bytes: &[u8]) -> CompileResult<()> {
        let index = self.intern_data(bytes.to_vec())?;
        self.load_address(dst, PendingTarget::Data(index))
    }

    fn load_address(&mut self, dst: AsmReg, target: PendingTarget) -> CompileResult<()> {
        let anchor = self.enc.mov_abs(dst, 0)?;
        self.pending_relocs.push(PendingReloc { anchor, target });
        Ok(())
    }

    fn constant_target(&self, name: &str) -> CompileResult<PendingTarget> {
        match self.constants.get(name) {
            Some(ConstantLoc::Data(index)) => Ok(PendingTarget::Data(*index)),
            Some(ConstantLoc::Scratch(offset)) => {
                Ok(PendingTarget::Fixed(RelocTarget::Scratch(*offset)))
            }
            None => Err(CompileError::UnknownConstant {
                name: name.to_string(),
            }),
        }
    }

    fn check_literal(value: i64) -> CompileResult<()> {
        if is_token_like(value as u64) {
            return Err(CompileError::ReservedImmediate {
                value: value as u64,
            });
        }
        Ok(())
    }

    // ==== REGISTERS ====

    fn alloc(&mut self, hint: &[AsmReg]) -> CompileResult<AsmReg> {
        let reg = if hint.is_empty() {
            self.regs.alloc()?
        } else {
            self.regs.alloc_prefer(hint)?
        };
        Ok(reg)
    }

    pub(super) fn free(&mut self, reg: AsmReg) {
        self.regs.free(reg);
    }

    pub(super) fn enc(&mut self) -> &mut X64Encoder {
        &mut self.enc
    }

    // ==== STATEMENTS ====

    fn lower_stmt(&mut self, frag: &Fragment) -> CompileResult<()> {
        trace!("{}: lowering {}", self.name, frag.kind_name());
        match frag {
            Fragment::Block(items) => {
                for item in items {
                    self.lower_stmt(item)?;
                }
                return Ok(());
            }
            Fragment::Assign { dst, src } => {
                let value = self.eval_value(src)?;
                self.store_value(dst, value)?;
                self.free(value.reg);
            }
            Fragment::Return(value) => {
                let value = self.eval_value_hinted(value, &[RAX])?;
                if value.reg != RAX {
                    self.enc.mov_reg_reg(RAX, value.reg)?;
                }
                self.free(value.reg);
                let epilogue = self.epilogue;
                self.jump_to(epilogue)?;
            }
            Fragment::Syscall { number, args } => {
                let reg = self.lower_syscall(*number, args, &[RAX])?;
                self.free(reg);
            }
            Fragment::Call {
                target,
                args,
                result,
            } => {
                let reg = self.lower_call(target, args, &[RAX])?;
                if let Some(var) = result {
                    let disp = self.var_disp(var)?;
                    self.enc.store(RSP, disp, reg, Width::W64)?;
                }
                self.free(reg);
            }
            Fragment::Printf { format, args } => self.lower_printf(format, args)?,
            Fragment::If {
                cond,
                then,
                otherwise,
            } => self.lower_if(cond, then, otherwise.as_deref())?,
            Fragment::Goto(name) => {
                let name = self.user_label(name)?;
                self.jump_to(name)?;
            }
            Fragment::Label(name) => {
                let name = self.user_label(name)?;
                self.place_label(name)?;
            }
            Fragment::DeclareLabel { label, body } => {
                let name = self.user_label(label)?;
                self.place_label(name)?;
                for item in body {
                    self.lower_stmt(item)?;
                }
            }
            Fragment::DeclareParam(var) => self.lower_param(var)?,
            Fragment::StackSlot(scope) => self.lower_stack_slot(scope)?,
            // Registered before emission.
            Fragment::ConstantBytes { .. } | Fragment::Scratch { .. } => {}
            Fragment::CacheFlush { base, size } => self.lower_cache_flush(base, size)?,
            other => {
                return Err(CompileError::UnsupportedFragment {
                    what: format!("{} used as a statement", other.kind_name()),
                })
            }
        }
        self.session.record_fragment_lowered(frag.kind_name());
        Ok(())
    }

    fn lower_param(&mut self, var: &Var) -> CompileResult<()> {
        if !self.params.insert(var.name().to_string()) {
            return Err(CompileError::DuplicateParameter {
                name: var.name().to_string(),
            });
        }
        let regs = SysVAssigner::GP_ARG_REGS;
        let reg = *regs
            .get(self.next_param)
            .ok_or(CompileError::TooManyParameters { max: regs.len() })?;
        self.next_param += 1;
        let disp = self.var_disp(var)?;
        self.enc.store(RSP, disp, reg, Width::W64)?;
        Ok(())
    }

    fn lower_stack_slot(&mut self, scope: &StackSlotScope) -> CompileResult<()> {
        let invalid = |reason: String| CompileError::InvalidStackSlot {
            id: scope.id,
            reason,
        };
        let first = scope
            .chunks
            .first()
            .ok_or_else(|| invalid("slot has no chunks".to_string()))?;
        let base = self.frame.offset(first)?;
        for (index, chunk) in scope.chunks.iter().enumerate() {
            let expected = base as i64 + index as i64 * 8;
            if self.frame.offset(chunk)? as i64 != expected {
                return Err(invalid(format!("chunk {chunk:?} is not contiguous")));
            }
        }
        if self.active_slots.iter().any(|s| s.id == scope.id) {
            return Err(invalid("slot scope entered twice".to_string()));
        }

        self.active_slots.push(ActiveSlot { id: scope.id, base });
        let result = self.lower_stmt(&scope.body);
        self.active_slots.pop();
        result
    }

    fn lower_if(
        &mut self,
        cond: &Condition,
        then: &Fragment,
        otherwise: Option<&Fragment>,
    ) -> CompileResult<()> {
        let on_true = self.internal_label("if_true");
        let end = self.internal_label("if_end");
        let on_false = match otherwise {
            Some(_) => self.internal_label("if_else"),
            None => end,
        };

        self.lower_branch(cond, on_true, on_false)?;
        if let Some(otherwise) = otherwise {
            self.place_label(on_false)?;
            self.lower_stmt(otherwise)?;
            self.jump_to(end)?;
        }
        self.place_label(on_true)?;
        self.lower_stmt(then)?;
        self.place_label(end)?;
        Ok(())
    }

    fn lower_branch(&mut self, cond: &Condition, on_true: &str, on_false: &str) -> CompileResult<()> {
        let jump = match cond {
            Condition::Compare { kind, left, right } => {
                let lhs = self.eval_value(left)?;
                match literal_bits(right).and_then(|v| i32::try_from(v).ok()) {
                    Some(imm) => self.enc.alu_reg_imm(AluOp::Cmp, lhs.reg, imm)?,
                    None => {
                        let rhs = self.eval_value(right)?;
                        self.enc.alu_reg_reg(AluOp::Cmp, lhs.reg, rhs.reg)?;
                        self.free(rhs.reg);
                    }
                }
                self.free(lhs.reg);
                match kind {
                    CompareKind::Eq => JumpCondition::Equal,
                    CompareKind::Ne => JumpCondition::NotEqual,
                    CompareKind::Lt => JumpCondition::Less,
                    CompareKind::Le => JumpCondition::LessEqual,
                    CompareKind::Gt => JumpCondition::Greater,
                    CompareKind::Ge => JumpCondition::GreaterEqual,
                }
            }
            Condition::IsZero(value) | Condition::IsNegative(value) => {
                let value = self.eval_value(value)?;
                self.enc.test_reg_reg(value.reg, value.reg)?;
                self.free(value.reg);
                if matches!(cond, Condition::IsZero(_)) {
                    JumpCondition::Equal
                } else {
                    JumpCondition::Sign
                }
            }
        };
        self.branch_to(jump, on_true)?;
        self.jump_to(on_false)
    }

    fn lower_cache_flush(&mut self, base: &Fragment, size: &Fragment) -> CompileResult<()> {
        const CACHE_LINE: i32 = 64;

        let ptr = self.eval_value(base)?.reg;
        let end = self.eval_value(size)?.reg;
        self.enc.alu_reg_reg(AluOp::Add, end, ptr)?;
        self.enc.alu_reg_imm(AluOp::And, ptr, -CACHE_LINE)?;

        let head = self.internal_label("flush_loop");
        self.enc.mfence()?;
        self.place_label(head)?;
        self.enc.clflush(ptr)?;
        self.enc.alu_reg_imm(AluOp::Add, ptr, CACHE_LINE)?;
        self.enc.alu_reg_reg(AluOp::Cmp, ptr, end)?;
        self.branch_to(JumpCondition::Below, head)?;
        self.enc.mfence()?;

        self.free(end);
        self.free(ptr);
        Ok(())
    }

    // ==== VALUES ====

    pub(super) fn eval_value(&mut self, frag: &Fragment) -> CompileResult<Value> {
        self.eval_value_hinted(frag, &[])
    }

    /// Evaluate `frag` into a freshly allocated register, preferring `hint`.
    fn eval_value_hinted(&mut self, frag: &Fragment, hint: &[AsmReg]) -> CompileResult<Value> {
        self.session.record_fragment_lowered(frag.kind_name());
        let value = match frag {
            Fragment::Int64(v) => {
                Self::check_literal(*v)?;
                let reg = self.alloc(hint)?;
                self.enc.mov_reg_imm(reg, *v)?;
                Value::new(reg, Width::W64)
            }
            Fragment::Int32(_) | Fragment::Int16(_) | Fragment::Int8(_) => {
                let reg = self.alloc(hint)?;
                self.enc.mov_reg_imm(reg, literal_bits(frag).unwrap_or_default())?;
                let width = match frag {
                    Fragment::Int32(_) => Width::W32,
                    Fragment::Int16(_) => Width::W16,
                    _ => Width::W8,
                };
                Value::new(reg, width)
            }
            Fragment::Var(var) => {
                let disp = self.var_disp(var)?;
                let reg = self.alloc(hint)?;
                self.enc.load(reg, RSP, disp, Width::W64)?;
                Value::new(reg, Width::W64)
            }
            Fragment::VarView { var, width } => {
                let disp = self.var_disp(var)?;
                let reg = self.alloc(hint)?;
                self.enc.load(reg, RSP, disp, *width)?;
                Value::new(reg, *width)
            }
            Fragment::Mem(mem) => {
                let disp = Self::mem_disp(mem)?;
                let reg = self.address_base(&mem.base, hint)?;
                self.enc.load(reg, reg, disp, mem.width)?;
                Value::new(reg, mem.width)
            }
            Fragment::Op { kind, left, right } => self.lower_op(*kind, left, right, hint)?,
            Fragment::Syscall { number, args } => {
                Value::new(self.lower_syscall(*number, args, hint)?, Width::W64)
            }
            Fragment::Call {
                target,
                args,
                result,
            } => {
                let reg = self.lower_call(target, args, hint)?;
                if let Some(var) = result {
                    let disp = self.var_disp(var)?;
                    self.enc.store(RSP, disp, reg, Width::W64)?;
                }
                Value::new(reg, Width::W64)
            }
            Fragment::SlotMem { slot, disp, width } => {
                let width = width.unwrap_or(Width::W64);
                let disp = self.slot_disp(*slot, *disp)?;
                let reg = self.alloc(hint)?;
                self.enc.load(reg, RSP, disp, width)?;
                Value::new(reg, width)
            }
            Fragment::SlotPtr { .. }
            | Fragment::ConstantPointer(_)
            | Fragment::MethodPointer(_)
            | Fragment::GlobalPointer(_)
            | Fragment::Str(_) => {
                let reg = self.alloc(hint)?;
                if let Err(e) = self.load_direct(reg, frag) {
                    self.free(reg);
                    return Err(e);
                }
                Value::new(reg, Width::W64)
            }
            other => {
                return Err(CompileError::UnsupportedFragment {
                    what: format!("{} used as a value", other.kind_name()),
                })
            }
        };
        Ok(value)
    }

    fn mem_disp(mem: &MemRef) -> CompileResult<i32> {
        i32::try_from(mem.disp).map_err(|_| CompileError::DisplacementOutOfRange { disp: mem.disp })
    }

    /// Allocate a register holding the base address of a memory operand.
    fn address_base(&mut self, base: &MemBase, hint: &[AsmReg]) -> CompileResult<AsmReg> {
        match base {
            MemBase::Var(var) => {
                let disp = self.var_disp(var)?;
                let reg = self.alloc(hint)?;
                self.enc.load(reg, RSP, disp, Width::W64)?;
                Ok(reg)
            }
            MemBase::Global(name) => {
                let reg = self.alloc(hint)?;
                self.load_address(reg, PendingTarget::Fixed(RelocTarget::Global(name.clone())))?;
                Ok(reg)
            }
        }
    }

    /// Load an address-like or literal operand into `dst` without
    /// allocating.
    fn load_direct(&mut self, dst: AsmReg, frag: &Fragment) -> CompileResult<()> {
        match frag {
            Fragment::Int64(v) => {
                Self::check_literal(*v)?;
                self.enc.mov_reg_imm(dst, *v)?;
            }
            Fragment::Int32(_) | Fragment::Int16(_) | Fragment::Int8(_) => {
                let bits = literal_bits(frag).unwrap_or_default();
                self.enc.mov_reg_imm(dst, bits)?;
            }
            Fragment::Str(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                self.load_data_address(dst, &bytes)?;
            }
            Fragment::SlotPtr { slot, disp } => {
                let disp = self.slot_disp(*slot, *disp)?;
                self.enc.lea(dst, RSP, disp)?;
            }
            Fragment::ConstantPointer(name) => {
                let target = self.constant_target(name)?;
                self.load_address(dst, target)?;
            }
            Fragment::MethodPointer(name) => {
                if name.is_empty() {
                    return Err(CompileError::EmptyName { what: "method" });
                }
                self.load_address(dst, PendingTarget::Fixed(RelocTarget::Method(name.clone())))?;
            }
            Fragment::GlobalPointer(name) => {
                if name.is_empty() {
                    return Err(CompileError::EmptyName { what: "global" });
                }
                self.load_address(dst, PendingTarget::Fixed(RelocTarget::Global(name.clone())))?;
            }
            other => {
                return Err(CompileError::UnsupportedFragment {
                    what: format!("{} as a direct operand", other.kind_name()),
                })
            }
        }
        Ok(())
    }

    fn is_direct(frag: &Fragment) -> bool {
        matches!(
            frag,
            Fragment::Int64(_)
                | Fragment::Int32(_)
                | Fragment::Int16(_)
                | Fragment::Int8(_)
                | Fragment::Str(_)
                | Fragment::SlotPtr { .. }
                | Fragment::ConstantPointer(_)
                | Fragment::MethodPointer(_)
                | Fragment::GlobalPointer(_)
        )
    }

    fn lower_op(
        &mut self,
        kind: OpKind,
        left: &Fragment,
        right: &Fragment,
        hint: &[AsmReg],
    ) -> CompileResult<Value> {
        if matches!(kind, OpKind::Shl | OpKind::Shr) {
            let amount = right.as_literal().ok_or(CompileError::NonConstantShift)?;
            let amount =
                u8::try_from(amount).map_err(|_| CompileError::ShiftOutOfRange { amount })?;
            let lhs = self.eval_value_hinted(left, hint)?;
            if kind == OpKind::Shl {
                self.enc.shl_imm(lhs.reg, amount)?;
            } else {
                self.enc.shr_imm(lhs.reg, amount)?;
            }
            return Ok(Value::new(lhs.reg, Width::W64));
        }

        let lhs = self.eval_value_hinted(left, hint)?;
        let alu = match kind {
            OpKind::Add => Some(AluOp::Add),
            OpKind::Sub => Some(AluOp::Sub),
            OpKind::And => Some(AluOp::And),
            OpKind::Or => Some(AluOp::Or),
            OpKind::Xor => Some(AluOp::Xor),
            OpKind::Mul | OpKind::Shl | OpKind::Shr => None,
        };

        let imm = literal_bits(right).and_then(|v| i32::try_from(v).ok());
        match (alu, imm) {
            (Some(alu), Some(imm)) => self.enc.alu_reg_imm(alu, lhs.reg, imm)?,
            _ => {
                let rhs = self.eval_value(right)?;
                match alu {
                    Some(alu) => self.enc.alu_reg_reg(alu, lhs.reg, rhs.reg)?,
                    None => self.enc.imul_reg_reg(lhs.reg, rhs.reg)?,
                }
                self.free(rhs.reg);
            }
        }
        Ok(Value::new(lhs.reg, Width::W64))
    }

    /// Store `value` to an assignment destination. Destination width wins;
    /// stack-slot memory without a width uses the value's width.
    fn store_value(&mut self, dst: &Fragment, value: Value) -> CompileResult<()> {
        match dst {
            Fragment::Var(var) => {
                let disp = self.var_disp(var)?;
                self.enc.store(RSP, disp, value.reg, Width::W64)?;
            }
            Fragment::VarView { var, width } => {
                let disp = self.var_disp(var)?;
                self.enc.store(RSP, disp, value.reg, *width)?;
            }
            Fragment::Mem(mem) => {
                let disp = Self::mem_disp(mem)?;
                let base = self.address_base(&mem.base, &[])?;
                self.enc.store(base, disp, value.reg, mem.width)?;
                self.free(base);
            }
            Fragment::SlotMem { slot, disp, width } => {
                let disp = self.slot_disp(*slot, *disp)?;
                self.enc
                    .store(RSP, disp, value.reg, width.unwrap_or(value.width))?;
            }
            Fragment::Register(reg) => {
                if *reg == RSP || *reg == RBP {
                    return Err(CompileError::UnsupportedFragment {
                        what: "assignment to the stack or frame pointer".to_string(),
                    });
                }
                if self.regs.is_allocated(*reg) && *reg != value.reg {
                    warn!("{}: assignment overwrites live register {:?}", self.name, reg);
                }
                if *reg != value.reg {
                    self.enc.mov_reg_reg(*reg, value.reg)?;
                }
            }
            other => {
                return Err(CompileError::UnsupportedFragment {
                    what: format!("{} as an assignment destination", other.kind_name()),
                })
            }
        }
        Ok(())
    }

    // ==== CALLS AND SYSCALLS ====

    /// Evaluate operands that need a register into temporaries.
    fn eval_arguments<'f>(
        &mut self,
        args: &'f [Fragment],
        preferred: impl Fn(usize) -> Vec<AsmReg>,
    ) -> CompileResult<Vec<ArgValue<'f>>> {
        let mut values = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            if Self::is_direct(arg) {
                values.push(ArgValue::Direct(arg));
            } else {
                let value = self.eval_value_hinted(arg, &preferred(index))?;
                values.push(ArgValue::InReg(value.reg));
            }
        }
        Ok(values)
    }

    /// Push live registers from `outer` that the transfer destroys.
    fn preserve(&mut self, outer: &[AsmReg], clobbered: &[AsmReg]) -> CompileResult<Vec<AsmReg>> {
        let mut pushed = Vec::new();
        for &reg in outer {
            if clobbered.contains(&reg) {
                self.enc.push_reg(reg)?;
                self.push_depth += 8;
                pushed.push(reg);
            }
        }
        Ok(pushed)
    }

    fn restore(&mut self, pushed: &[AsmReg]) -> CompileResult<()> {
        for &reg in pushed.iter().rev() {
            self.enc.pop_reg(reg)?;
            self.push_depth -= 8;
        }
        Ok(())
    }

    /// Move evaluated operands into `slots`. A temporary that sits in a slot
    /// written earlier in the sequence is saved to a scratch register first.
    fn move_arguments(&mut self, mut values: Vec<ArgValue<'_>>, slots: &[AsmReg]) -> CompileResult<()> {
        let mut owned: Vec<AsmReg> = values
            .iter()
            .filter_map(|v| match v {
                ArgValue::InReg(reg) => Some(*reg),
                ArgValue::Direct(_) => None,
            })
            .collect();

        for i in 0..values.len() {
            let ArgValue::InReg(src) = values[i] else {
                continue;
            };
            let dst = slots[i];
            for j in (i + 1)..values.len() {
                if let ArgValue::InReg(held) = values[j] {
                    if held == dst {
                        let saved = self.regs.alloc_avoiding(slots)?;
                        self.enc.mov_reg_reg(saved, held)?;
                        trace!("{}: saved argument {} from {:?} to {:?}", self.name, j, held, saved);
                        values[j] = ArgValue::InReg(saved);
                        owned.push(saved);
                    }
                }
            }
            if src != dst {
                self.enc.mov_reg_reg(dst, src)?;
            }
        }

        for reg in owned {
            self.free(reg);
        }
        for (i, value) in values.iter().enumerate() {
            if let ArgValue::Direct(frag) = value {
                self.load_direct(slots[i], frag)?;
            }
        }
        Ok(())
    }

    /// Take the transfer's result out of RAX into an allocated register.
    fn take_result(&mut self, hint: &[AsmReg]) -> CompileResult<AsmReg> {
        let hint = if hint.is_empty() { &[RAX][..] } else { hint };
        let reg = self.alloc(hint)?;
        if reg != RAX {
            self.enc.mov_reg_reg(reg, RAX)?;
        }
        Ok(reg)
    }

    fn lower_syscall(&mut self, number: i64, args: &[Fragment], hint: &[AsmReg]) -> CompileResult<AsmReg> {
        let cc = SyscallAssigner::new();
        cc.check_arg_count(args.len())?;
        let slots = &cc.arg_registers()[..args.len()];
        let outer: Vec<AsmReg> = self.regs.live().iter().collect();

        let values = self.eval_arguments(args, syscall_preferred_registers)?;
        let pushed = self.preserve(&outer, &cc.clobbered(args.len()))?;
        self.move_arguments(values, slots)?;
        self.enc.mov_reg_imm(RAX, number)?;
        self.enc.syscall()?;

        let result = self.take_result(hint)?;
        self.restore(&pushed)?;
        self.session.record_syscall_lowered();
        trace!("{}: syscall {} with {} args, {} preserved", self.name, number, args.len(), pushed.len());
        Ok(result)
    }

    fn lower_call(&mut self, target: &Fragment, args: &[Fragment], hint: &[AsmReg]) -> CompileResult<AsmReg> {
        let cc = SysVAssigner::new();
        cc.check_arg_count(args.len())?;
        let slots = &cc.arg_registers()[..args.len()];
        let outer: Vec<AsmReg> = self.regs.live().iter().collect();

        let mut callee = self.eval_value(target)?.reg;
        if slots.contains(&callee) {
            let moved = self.regs.alloc_avoiding(slots)?;
            self.enc.mov_reg_reg(moved, callee)?;
            self.free(callee);
            callee = moved;
        }

        let values = self.eval_arguments(args, |i| vec![slots[i]])?;
        let pushed = self.preserve(&outer, &cc.clobbered(args.len()))?;
        self.move_arguments(values, slots)?;
        self.enc.call_reg(callee)?;
        self.free(callee);

        let result = self.take_result(hint)?;
        self.restore(&pushed)?;
        self.session.record_call_lowered();
        Ok(result)
    }

    // ==== ASSEMBLY ====

    fn finish(mut self) -> CompileResult<CompiledMethod> {
        let mut data = std::mem::take(&mut self.data);
        for item in &mut data {
            self.enc.bind_label(&mut item.label)?;
            self.enc.data(&item.bytes)?;
        }

        let assembled = self.enc.finalize()?;
        let mut data_offsets = Vec::with_capacity(data.len());
        for item in &data {
            data_offsets.push(assembled.label_offset(&item.label)? as u64);
        }

        let mut relocations = Vec::with_capacity(self.pending_relocs.len());
        for pending in &self.pending_relocs {
            let offset = assembled.label_offset(&pending.anchor)? + MOV_IMM64_IMM_OFFSET;
            let target = match &pending.target {
                PendingTarget::Data(index) => RelocTarget::Local(data_offsets[*index]),
                PendingTarget::Fixed(target) => target.clone(),
            };
            relocations.push(Relocation { offset, target });
        }
        relocations.sort();

        let mut code = assembled.into_bytes();
        for reloc in &relocations {
            let slot = code
                .get_mut(reloc.offset..reloc.offset + 8)
                .ok_or_else(|| {
                    EncodingError::AssemblyError(format!(
                        "relocation at {} lies outside the code",
                        reloc.offset
                    ))
                })?;
            slot.copy_from_slice(&reloc.target.placeholder().to_le_bytes());
            trace!("{}: reloc at {:#x} -> {:?}", self.name, reloc.offset, reloc.target);
        }

        self.session
            .record_method_compiled(&self.name, code.len(), relocations.len());
        debug!(
            "compiled method {}: frame {} bytes, code {} bytes, {} relocations, bss {} bytes",
            self.name,
            self.frame.frame_size(),
            code.len(),
            relocations.len(),
            self.bss_size
        );

        Ok(CompiledMethod {
            code,
            relocations,
            bss_size: self.bss_size,
            frame: self.frame,
        })
    }
}
