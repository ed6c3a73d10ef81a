//! Read-only traversal of fragment trees.
//!
//! The frame allocator, the linker's validation pass and the backend's
//! prologue decisions all need facts about a whole method (which variables
//! it names, which globals and methods it references, whether it calls out
//! or prints). They are computed here from the IR, never from emitted bytes.

use std::collections::BTreeSet;

use super::{Condition, Fragment, MemBase, Method};

/// Visit `frag` and every fragment nested inside it, parents first.
pub fn walk<'a>(frag: &'a Fragment, f: &mut dyn FnMut(&'a Fragment)) {
    f(frag);
    match frag {
        Fragment::Block(items) | Fragment::DeclareLabel { body: items, .. } => {
            for item in items {
                walk(item, f);
            }
        }
        Fragment::Op { left, right, .. } => {
            walk(left, f);
            walk(right, f);
        }
        Fragment::Assign { dst, src } => {
            walk(dst, f);
            walk(src, f);
        }
        Fragment::Return(value) => walk(value, f),
        Fragment::Syscall { args, .. } | Fragment::Printf { args, .. } => {
            for arg in args {
                walk(arg, f);
            }
        }
        Fragment::Call { target, args, .. } => {
            walk(target, f);
            for arg in args {
                walk(arg, f);
            }
        }
        Fragment::If {
            cond,
            then,
            otherwise,
        } => {
            walk_condition(cond, f);
            walk(then, f);
            if let Some(otherwise) = otherwise {
                walk(otherwise, f);
            }
        }
        Fragment::StackSlot(scope) => walk(&scope.body, f),
        Fragment::CacheFlush { base, size } => {
            walk(base, f);
            walk(size, f);
        }
        Fragment::Int64(_)
        | Fragment::Int32(_)
        | Fragment::Int16(_)
        | Fragment::Int8(_)
        | Fragment::Var(_)
        | Fragment::VarView { .. }
        | Fragment::Mem(_)
        | Fragment::Goto(_)
        | Fragment::Label(_)
        | Fragment::DeclareParam(_)
        | Fragment::SlotMem { .. }
        | Fragment::SlotPtr { .. }
        | Fragment::ConstantBytes { .. }
        | Fragment::ConstantPointer(_)
        | Fragment::Scratch { .. }
        | Fragment::MethodPointer(_)
        | Fragment::GlobalPointer(_)
        | Fragment::Str(_)
        | Fragment::Register(_) => {}
    }
}

fn walk_condition<'a>(cond: &'a Condition, f: &mut dyn FnMut(&'a Fragment)) {
    match cond {
        Condition::Compare { left, right, .. } => {
            walk(left, f);
            walk(right, f);
        }
        Condition::IsZero(value) | Condition::IsNegative(value) => walk(value, f),
    }
}

/// Visit every fragment of a method.
pub fn walk_method<'a>(method: &'a Method, f: &mut dyn FnMut(&'a Fragment)) {
    for frag in method.fragments() {
        walk(frag, f);
    }
}

/// Every variable name the method refers to, including call results and
/// stack-slot chunks, in sorted order.
pub fn collect_variables(method: &Method) -> BTreeSet<String> {
    let mut vars = BTreeSet::new();
    walk_method(method, &mut |frag| match frag {
        Fragment::Var(v) | Fragment::VarView { var: v, .. } | Fragment::DeclareParam(v) => {
            vars.insert(v.0.clone());
        }
        Fragment::Mem(m) => {
            if let MemBase::Var(v) = &m.base {
                vars.insert(v.0.clone());
            }
        }
        Fragment::Call {
            result: Some(v), ..
        } => {
            vars.insert(v.0.clone());
        }
        Fragment::StackSlot(scope) => {
            vars.extend(scope.chunks.iter().cloned());
        }
        _ => {}
    });
    vars.remove("");
    vars
}

/// Names of globals referenced through memory operands or pointers.
pub fn collect_globals(method: &Method) -> BTreeSet<String> {
    let mut globals = BTreeSet::new();
    walk_method(method, &mut |frag| match frag {
        Fragment::Mem(m) => {
            if let MemBase::Global(name) = &m.base {
                globals.insert(name.clone());
            }
        }
        Fragment::GlobalPointer(name) => {
            globals.insert(name.clone());
        }
        _ => {}
    });
    globals
}

/// Names of methods whose address the method takes.
pub fn collect_method_pointers(method: &Method) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    walk_method(method, &mut |frag| {
        if let Fragment::MethodPointer(name) = frag {
            names.insert(name.clone());
        }
    });
    names
}

/// True when the method contains a call to another routine.
pub fn makes_calls(method: &Method) -> bool {
    let mut found = false;
    walk_method(method, &mut |frag| {
        found |= matches!(frag, Fragment::Call { .. });
    });
    found
}

/// True when the method contains a printf at any depth.
pub fn contains_printf(method: &Method) -> bool {
    let mut found = false;
    walk_method(method, &mut |frag| {
        found |= matches!(frag, Fragment::Printf { .. });
    });
    found
}
