//! Constructor functions for IR fragments.
//!
//! These keep IR-building code short: `assign(x, 5i64)` rather than spelling
//! out `Fragment::Assign { .. }` with boxes. The larger helpers at the bottom
//! (checked syscalls, constant blobs, stack slots, stage results) expand into
//! plain fragment trees and add no new node kinds.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{CompareKind, Condition, Fragment, GlobalVar, MemRef, OpKind, StackSlotScope, Var, Width};

pub fn block(fragments: Vec<Fragment>) -> Fragment {
    Fragment::Block(fragments)
}

pub fn assign(dst: impl Into<Fragment>, src: impl Into<Fragment>) -> Fragment {
    Fragment::Assign {
        dst: Box::new(dst.into()),
        src: Box::new(src.into()),
    }
}

pub fn ret(value: impl Into<Fragment>) -> Fragment {
    Fragment::Return(Box::new(value.into()))
}

pub fn op(kind: OpKind, left: impl Into<Fragment>, right: impl Into<Fragment>) -> Fragment {
    Fragment::Op {
        kind,
        left: Box::new(left.into()),
        right: Box::new(right.into()),
    }
}

pub fn syscall(number: i64, args: Vec<Fragment>) -> Fragment {
    Fragment::Syscall { number, args }
}

pub fn printf(format: impl Into<String>, args: Vec<Fragment>) -> Fragment {
    Fragment::Printf {
        format: format.into(),
        args,
    }
}

/// Call through `target` with no arguments and no result.
pub fn call(target: impl Into<Fragment>) -> Fragment {
    call_with(target, Vec::new(), None)
}

pub fn call_with(target: impl Into<Fragment>, args: Vec<Fragment>, result: Option<Var>) -> Fragment {
    Fragment::Call {
        target: Box::new(target.into()),
        args,
        result,
    }
}

/// Call a method of the same program by name.
pub fn call_method(name: impl Into<String>, result: Option<Var>) -> Fragment {
    call_with(method_pointer(name), Vec::new(), result)
}

pub fn method_pointer(name: impl Into<String>) -> Fragment {
    Fragment::MethodPointer(name.into())
}

pub fn if_then(cond: Condition, then: impl Into<Fragment>) -> Fragment {
    Fragment::If {
        cond,
        then: Box::new(then.into()),
        otherwise: None,
    }
}

pub fn if_else(cond: Condition, then: impl Into<Fragment>, otherwise: impl Into<Fragment>) -> Fragment {
    Fragment::If {
        cond,
        then: Box::new(then.into()),
        otherwise: Some(Box::new(otherwise.into())),
    }
}

pub fn goto(label: impl Into<String>) -> Fragment {
    Fragment::Goto(label.into())
}

pub fn label(name: impl Into<String>) -> Fragment {
    Fragment::Label(name.into())
}

pub fn declare_label(name: impl Into<String>, body: Vec<Fragment>) -> Fragment {
    Fragment::DeclareLabel {
        label: name.into(),
        body,
    }
}

pub fn declare_param(name: impl Into<String>) -> Fragment {
    Fragment::DeclareParam(Var::new(name))
}

pub fn cache_flush(base: impl Into<Fragment>, size: impl Into<Fragment>) -> Fragment {
    Fragment::CacheFlush {
        base: Box::new(base.into()),
        size: Box::new(size.into()),
    }
}

pub fn string(s: impl Into<String>) -> Fragment {
    Fragment::Str(s.into())
}

fn compare(kind: CompareKind, left: impl Into<Fragment>, right: impl Into<Fragment>) -> Condition {
    Condition::Compare {
        kind,
        left: Box::new(left.into()),
        right: Box::new(right.into()),
    }
}

pub fn is_equal(left: impl Into<Fragment>, right: impl Into<Fragment>) -> Condition {
    compare(CompareKind::Eq, left, right)
}

pub fn is_not_equal(left: impl Into<Fragment>, right: impl Into<Fragment>) -> Condition {
    compare(CompareKind::Ne, left, right)
}

pub fn is_less_than(left: impl Into<Fragment>, right: impl Into<Fragment>) -> Condition {
    compare(CompareKind::Lt, left, right)
}

pub fn is_less_or_equal(left: impl Into<Fragment>, right: impl Into<Fragment>) -> Condition {
    compare(CompareKind::Le, left, right)
}

pub fn is_greater_than(left: impl Into<Fragment>, right: impl Into<Fragment>) -> Condition {
    compare(CompareKind::Gt, left, right)
}

pub fn is_greater_or_equal(left: impl Into<Fragment>, right: impl Into<Fragment>) -> Condition {
    compare(CompareKind::Ge, left, right)
}

pub fn is_zero(value: impl Into<Fragment>) -> Condition {
    Condition::IsZero(Box::new(value.into()))
}

pub fn is_negative(value: impl Into<Fragment>) -> Condition {
    Condition::IsNegative(Box::new(value.into()))
}

/// Store `value` into the first 8 bytes of a global.
pub fn assign_global(global: &GlobalVar, value: impl Into<Fragment>) -> Fragment {
    assign(global.mem(), value)
}

// ==== CHECKED SYSCALLS ====

/// A syscall whose negative result runs `on_error`.
#[derive(Debug, Clone)]
pub struct SyscallChecked {
    pub result: Var,
    pub number: i64,
    pub args: Vec<Fragment>,
    pub on_error: Fragment,
}

pub fn syscall_checked(cfg: SyscallChecked) -> Fragment {
    block(vec![
        assign(cfg.result.clone(), syscall(cfg.number, cfg.args)),
        if_then(is_negative(cfg.result), cfg.on_error),
    ])
}

// ==== CONSTANT DATA ====

/// Options for [`load_constant_bytes_config`].
#[derive(Debug, Clone, Default)]
pub struct ConstantBytesConfig {
    pub name: String,
    pub data: Vec<u8>,
    /// Append a NUL unless the data already ends with one.
    pub zero_terminate: bool,
    /// Receives the length without the terminator.
    pub length: Option<Var>,
    /// Receives the length including the terminator.
    pub total_length: Option<Var>,
    /// Receives the address of the data.
    pub pointer: Option<Var>,
}

pub fn load_constant_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Fragment {
    load_constant_bytes_config(ConstantBytesConfig {
        name: name.into(),
        data: data.into(),
        ..Default::default()
    })
}

pub fn load_constant_bytes_config(cfg: ConstantBytesConfig) -> Fragment {
    let mut raw = cfg.data;
    let original_len = raw.len();
    if cfg.zero_terminate && raw.last() != Some(&0) {
        raw.push(0);
    }
    let total_len = raw.len();

    let mut frags = vec![Fragment::ConstantBytes {
        name: cfg.name.clone(),
        data: raw,
    }];
    if let Some(length) = cfg.length {
        frags.push(assign(length, original_len as i64));
    }
    if let Some(total) = cfg.total_length {
        frags.push(assign(total, total_len as i64));
    }
    if let Some(pointer) = cfg.pointer {
        frags.push(assign(pointer, Fragment::ConstantPointer(cfg.name)));
    }
    block(frags)
}

pub fn constant_pointer(name: impl Into<String>) -> Fragment {
    Fragment::ConstantPointer(name.into())
}

/// Reserve `size` zero-initialised bytes addressed through [`constant_pointer`].
pub fn reserve_scratch(name: impl Into<String>, size: u64) -> Fragment {
    Fragment::Scratch {
        name: name.into(),
        size,
    }
}

// ==== STAGE RESULTS ====

pub const DEFAULT_STAGE_RESULT_SHIFT: i64 = 32;

static HELPER_VAR_COUNTER: AtomicU64 = AtomicU64::new(0);
static STACK_SLOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn helper_var(prefix: &str) -> Var {
    let id = HELPER_VAR_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    Var::new(format!("__ir_{prefix}_{id}"))
}

/// Options for [`write_stage_result`].
#[derive(Debug, Clone)]
pub struct StageResultStore {
    pub base: MemRef,
    pub offset: i64,
    pub value: Var,
    pub scratch: Option<Var>,
    /// Zero selects [`DEFAULT_STAGE_RESULT_SHIFT`].
    pub shift: i64,
}

/// Store a 64-bit value as two 32-bit halves at `offset` and `offset + 4`.
pub fn write_stage_result(cfg: StageResultStore) -> Fragment {
    let shift = if cfg.shift <= 0 {
        DEFAULT_STAGE_RESULT_SHIFT
    } else {
        cfg.shift
    };
    let scratch = cfg.scratch.unwrap_or_else(|| helper_var("stage_hi"));
    let low = cfg.base.clone().with_disp(cfg.offset).as32();
    let high = cfg.base.with_disp(cfg.offset + 4).as32();

    block(vec![
        assign(low, cfg.value.as32()),
        assign(scratch.clone(), op(OpKind::Shr, cfg.value, shift)),
        assign(high, scratch.as32()),
    ])
}

// ==== STACK SLOTS ====

const SLOT_CHUNK_BYTES: u64 = 8;

/// Handle passed to the body builder of [`with_stack_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSlot {
    id: u64,
    size: u64,
}

impl StackSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The first 8 bytes of the slot.
    pub fn base(&self) -> Fragment {
        self.at(0)
    }

    pub fn at(&self, disp: i64) -> Fragment {
        Fragment::SlotMem {
            slot: self.id,
            disp,
            width: None,
        }
    }

    pub fn at_width(&self, disp: i64, width: Width) -> Fragment {
        Fragment::SlotMem {
            slot: self.id,
            disp,
            width: Some(width),
        }
    }

    pub fn pointer(&self) -> Fragment {
        self.pointer_with_disp(0)
    }

    pub fn pointer_with_disp(&self, disp: i64) -> Fragment {
        Fragment::SlotPtr { slot: self.id, disp }
    }
}

/// Frame-backed scratch memory valid only inside `body`.
pub fn with_stack_slot(size: u64, body: impl FnOnce(StackSlot) -> Fragment) -> Fragment {
    let id = STACK_SLOT_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let chunks = size.div_ceil(SLOT_CHUNK_BYTES).max(1);
    let slot = StackSlot {
        id,
        size: chunks * SLOT_CHUNK_BYTES,
    };
    Fragment::StackSlot(StackSlotScope {
        id,
        size: slot.size,
        chunks: (0..chunks).map(|i| slot_chunk_name(id, i)).collect(),
        body: Box::new(body(slot)),
    })
}

/// Zero-padded so that chunks sort in address order.
pub fn slot_chunk_name(id: u64, index: u64) -> String {
    format!("__ir_slot_{id}_{index:06}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_bytes_zero_termination() {
        let frag = load_constant_bytes_config(ConstantBytesConfig {
            name: "path".into(),
            data: b"/init".to_vec(),
            zero_terminate: true,
            length: Some(Var::new("len")),
            total_length: Some(Var::new("total")),
            pointer: Some(Var::new("ptr")),
        });
        let Fragment::Block(frags) = frag else {
            panic!("expected block");
        };
        assert_eq!(
            frags[0],
            Fragment::ConstantBytes {
                name: "path".into(),
                data: b"/init\0".to_vec()
            }
        );
        assert_eq!(frags[1], assign(Var::new("len"), 5i64));
        assert_eq!(frags[2], assign(Var::new("total"), 6i64));
        assert_eq!(frags.len(), 4);
    }

    #[test]
    fn test_stack_slot_rounds_up_to_chunks() {
        let frag = with_stack_slot(20, |slot| {
            assert_eq!(slot.size(), 24);
            assign(slot.base(), 1i64)
        });
        let Fragment::StackSlot(scope) = frag else {
            panic!("expected stack slot");
        };
        assert_eq!(scope.size, 24);
        assert_eq!(scope.chunks.len(), 3);
        assert!(scope.chunks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_stage_result_splits_halves() {
        let frag = write_stage_result(StageResultStore {
            base: Var::new("out").mem(),
            offset: 8,
            value: Var::new("v"),
            scratch: Some(Var::new("hi")),
            shift: 0,
        });
        let Fragment::Block(frags) = frag else {
            panic!("expected block");
        };
        assert_eq!(frags[0], assign(Var::new("out").mem_with_disp(8).as32(), Var::new("v").as32()));
        assert_eq!(frags[1], assign(Var::new("hi"), op(OpKind::Shr, Var::new("v"), 32i64)));
        assert_eq!(frags[2], assign(Var::new("out").mem_with_disp(12).as32(), Var::new("hi").as32()));
    }
}
