// This module defines the stagegen intermediate representation. A Program names an
// entrypoint, a set of Methods and the globals they may touch; a Method is an ordered list
// of Fragments; a Fragment is one tree node that is either a value (literals, variables,
// memory references, operator nodes, pointers to constants, methods or globals), a
// statement (assignment, return, syscall, call, printf, if/goto/label, stack-slot scope,
// parameter declaration, cache flush) or, through the Condition type, a branch test. The
// IR is plain data: builders in `helpers` construct it, `visit` walks it, and the backends
// only ever read it.

//! Intermediate representation for stage programs.
//!
//! See [`helpers`] for the constructor functions most callers use.

pub mod helpers;
pub mod visit;

pub use helpers::*;

use std::collections::BTreeMap;

use crate::core::register_file::AsmReg;

/// Access width of a value or memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }
}

/// A named 64-bit method-local variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(pub String);

impl Var {
    pub fn new(name: impl Into<String>) -> Self {
        Var(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// The low 32 bits of the variable.
    pub fn as32(&self) -> Fragment {
        Fragment::VarView {
            var: self.clone(),
            width: Width::W32,
        }
    }

    pub fn as16(&self) -> Fragment {
        Fragment::VarView {
            var: self.clone(),
            width: Width::W16,
        }
    }

    pub fn as8(&self) -> Fragment {
        Fragment::VarView {
            var: self.clone(),
            width: Width::W8,
        }
    }

    /// Memory at the address held in this variable.
    pub fn mem(&self) -> MemRef {
        MemRef {
            base: MemBase::Var(self.clone()),
            disp: 0,
            width: Width::W64,
        }
    }

    pub fn mem_with_disp(&self, disp: i64) -> MemRef {
        self.mem().with_disp(disp)
    }
}

/// A program-wide global living in the shared BSS region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalVar(pub String);

impl GlobalVar {
    pub fn new(name: impl Into<String>) -> Self {
        GlobalVar(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn mem(&self) -> MemRef {
        MemRef {
            base: MemBase::Global(self.0.clone()),
            disp: 0,
            width: Width::W64,
        }
    }

    pub fn mem_with_disp(&self, disp: i64) -> MemRef {
        self.mem().with_disp(disp)
    }

    /// Absolute address of the global.
    pub fn pointer(&self) -> Fragment {
        Fragment::GlobalPointer(self.0.clone())
    }
}

/// Base of a memory reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemBase {
    /// Address held in a variable.
    Var(Var),
    /// Address of a global.
    Global(String),
}

/// `width` bytes at `base + disp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemRef {
    pub base: MemBase,
    pub disp: i64,
    pub width: Width,
}

impl MemRef {
    pub fn with_disp(mut self, disp: i64) -> Self {
        self.disp = disp;
        self
    }

    pub fn as8(mut self) -> Self {
        self.width = Width::W8;
        self
    }

    pub fn as16(mut self) -> Self {
        self.width = Width::W16;
        self
    }

    pub fn as32(mut self) -> Self {
        self.width = Width::W32;
        self
    }
}

/// Binary operators. All arithmetic wraps at 64 bits and `Shr` is logical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

/// Signed comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A branch test used by [`Fragment::If`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Compare {
        kind: CompareKind,
        left: Box<Fragment>,
        right: Box<Fragment>,
    },
    IsZero(Box<Fragment>),
    IsNegative(Box<Fragment>),
}

/// A lexical stack-slot scope created by [`helpers::with_stack_slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSlotScope {
    pub id: u64,
    /// Size in bytes, a multiple of 8.
    pub size: u64,
    /// Frame variables backing the slot, one per 8 bytes, in address order.
    pub chunks: Vec<String>,
    pub body: Box<Fragment>,
}

/// One IR tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Block(Vec<Fragment>),

    Int64(i64),
    Int32(i32),
    Int16(i16),
    Int8(i8),

    Var(Var),
    /// Narrowed view of a variable's low bits.
    VarView { var: Var, width: Width },
    Mem(MemRef),

    Op {
        kind: OpKind,
        left: Box<Fragment>,
        right: Box<Fragment>,
    },

    Assign {
        dst: Box<Fragment>,
        src: Box<Fragment>,
    },
    Return(Box<Fragment>),

    Syscall {
        number: i64,
        args: Vec<Fragment>,
    },
    Call {
        target: Box<Fragment>,
        args: Vec<Fragment>,
        result: Option<Var>,
    },
    /// Diagnostic output; only `%x` and `%%` are understood.
    Printf { format: String, args: Vec<Fragment> },

    If {
        cond: Condition,
        then: Box<Fragment>,
        otherwise: Option<Box<Fragment>>,
    },
    Goto(String),
    /// Marks a label at this point.
    Label(String),
    /// Marks a label and continues with `body`.
    DeclareLabel { label: String, body: Vec<Fragment> },

    /// Stores the next incoming argument register into the variable.
    DeclareParam(Var),

    StackSlot(StackSlotScope),
    SlotMem {
        slot: u64,
        disp: i64,
        width: Option<Width>,
    },
    SlotPtr { slot: u64, disp: i64 },

    /// Method-local read-only data addressed through [`Fragment::ConstantPointer`].
    ConstantBytes { name: String, data: Vec<u8> },
    ConstantPointer(String),
    /// Method-local zero-initialised storage addressed through
    /// [`Fragment::ConstantPointer`].
    Scratch { name: String, size: u64 },

    MethodPointer(String),
    GlobalPointer(String),

    /// Address of a zero-terminated string literal.
    Str(String),
    /// A physical register, used as an assignment destination.
    Register(AsmReg),

    /// Write back and invalidate the cache lines covering `[base, base + size)`.
    CacheFlush {
        base: Box<Fragment>,
        size: Box<Fragment>,
    },
}

impl Fragment {
    /// Short name of the node kind, used in diagnostics and statistics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Fragment::Block(_) => "block",
            Fragment::Int64(_) => "int64",
            Fragment::Int32(_) => "int32",
            Fragment::Int16(_) => "int16",
            Fragment::Int8(_) => "int8",
            Fragment::Var(_) => "var",
            Fragment::VarView { .. } => "var_view",
            Fragment::Mem(_) => "mem",
            Fragment::Op { .. } => "op",
            Fragment::Assign { .. } => "assign",
            Fragment::Return(_) => "return",
            Fragment::Syscall { .. } => "syscall",
            Fragment::Call { .. } => "call",
            Fragment::Printf { .. } => "printf",
            Fragment::If { .. } => "if",
            Fragment::Goto(_) => "goto",
            Fragment::Label(_) => "label",
            Fragment::DeclareLabel { .. } => "declare_label",
            Fragment::DeclareParam(_) => "declare_param",
            Fragment::StackSlot(_) => "stack_slot",
            Fragment::SlotMem { .. } => "slot_mem",
            Fragment::SlotPtr { .. } => "slot_ptr",
            Fragment::ConstantBytes { .. } => "constant_bytes",
            Fragment::ConstantPointer(_) => "constant_pointer",
            Fragment::Scratch { .. } => "scratch",
            Fragment::MethodPointer(_) => "method_pointer",
            Fragment::GlobalPointer(_) => "global_pointer",
            Fragment::Str(_) => "str",
            Fragment::Register(_) => "register",
            Fragment::CacheFlush { .. } => "cache_flush",
        }
    }

    /// Value of an integer literal, sign-extended to 64 bits.
    pub fn as_literal(&self) -> Option<i64> {
        match *self {
            Fragment::Int64(v) => Some(v),
            Fragment::Int32(v) => Some(v as i64),
            Fragment::Int16(v) => Some(v as i64),
            Fragment::Int8(v) => Some(v as i64),
            _ => None,
        }
    }
}

impl From<i64> for Fragment {
    fn from(v: i64) -> Self {
        Fragment::Int64(v)
    }
}

impl From<i32> for Fragment {
    fn from(v: i32) -> Self {
        Fragment::Int32(v)
    }
}

impl From<i16> for Fragment {
    fn from(v: i16) -> Self {
        Fragment::Int16(v)
    }
}

impl From<i8> for Fragment {
    fn from(v: i8) -> Self {
        Fragment::Int8(v)
    }
}

impl From<Var> for Fragment {
    fn from(v: Var) -> Self {
        Fragment::Var(v)
    }
}

impl From<&Var> for Fragment {
    fn from(v: &Var) -> Self {
        Fragment::Var(v.clone())
    }
}

impl From<MemRef> for Fragment {
    fn from(m: MemRef) -> Self {
        Fragment::Mem(m)
    }
}

impl From<Vec<Fragment>> for Fragment {
    fn from(v: Vec<Fragment>) -> Self {
        Fragment::Block(v)
    }
}

/// An ordered fragment sequence forming one callable routine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Method(pub Vec<Fragment>);

impl Method {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Method(fragments)
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.0
    }
}

impl From<Vec<Fragment>> for Method {
    fn from(v: Vec<Fragment>) -> Self {
        Method(v)
    }
}

/// Size and alignment of a global. Zero means the 8-byte default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalConfig {
    pub size: u64,
    pub align: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self { size: 8, align: 8 }
    }
}

impl GlobalConfig {
    pub fn new(size: u64, align: u64) -> Self {
        Self { size, align }
    }

    /// Apply defaults and check the alignment is a power of two.
    pub fn normalized(&self) -> Result<GlobalConfig, String> {
        let size = if self.size == 0 { 8 } else { self.size };
        let align = if self.align == 0 { 8 } else { self.align };
        if !align.is_power_of_two() {
            return Err(format!("alignment {align} is not a power of two"));
        }
        Ok(GlobalConfig { size, align })
    }
}

/// A whole program: entrypoint, methods and declared globals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub entrypoint: String,
    pub methods: BTreeMap<String, Method>,
    pub globals: BTreeMap<String, GlobalConfig>,
}

impl Program {
    pub fn new(entrypoint: impl Into<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            ..Default::default()
        }
    }

    pub fn with_method(mut self, name: impl Into<String>, method: impl Into<Method>) -> Self {
        self.methods.insert(name.into(), method.into());
        self
    }

    pub fn with_global(mut self, name: impl Into<String>, config: GlobalConfig) -> Self {
        self.globals.insert(name.into(), config);
        self
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Wrap the program so that it can run as a process entry point: a new
    /// `_start` method calls the old entrypoint and passes its result to
    /// `exit_group`.
    pub fn with_exit_stub(mut self, exit_syscall: i64) -> Self {
        let status = Var::new("status");
        let entry = std::mem::take(&mut self.entrypoint);
        let stub = Method::new(vec![
            call_method(entry, Some(status.clone())),
            syscall(exit_syscall, vec![status.clone().into()]),
            ret(status),
        ]);
        self.methods.insert(EXIT_STUB_NAME.to_string(), stub);
        self.entrypoint = EXIT_STUB_NAME.to_string();
        self
    }
}

/// Name of the method added by [`Program::with_exit_stub`].
pub const EXIT_STUB_NAME: &str = "_start";
