//! Frame layout for methods.

use stagegen::core::frame::{FrameLayout, STACK_ALIGNMENT, VAR_SLOT_SIZE};
use stagegen::ir::*;
use stagegen::x64::PRINTF_STACK_RESERVE;

#[test]
fn offsets_follow_sorted_names() {
    let method = Method::new(vec![
        assign(Var::new("zeta"), 1i64),
        assign(Var::new("alpha"), Var::new("mid")),
        ret(Var::new("zeta")),
    ]);
    let frame = FrameLayout::compute(&method, PRINTF_STACK_RESERVE).unwrap();
    assert_eq!(frame.variable_count(), 3);
    assert_eq!(frame.offset("alpha").unwrap(), 0);
    assert_eq!(frame.offset("mid").unwrap(), VAR_SLOT_SIZE as i32);
    assert_eq!(frame.offset("zeta").unwrap(), 2 * VAR_SLOT_SIZE as i32);
    assert_eq!(frame.frame_size(), 32);
    assert!(frame.offset("missing").is_err());
}

#[test]
fn variables_are_found_in_nested_fragments() {
    let method = Method::new(vec![if_else(
        is_less_than(Var::new("a"), Var::new("b")),
        block(vec![assign(Var::new("c").mem_with_disp(8), 1i64)]),
        call_with(method_pointer("f"), vec![Var::new("d").into()], Some(Var::new("e"))),
    )]);
    let frame = FrameLayout::compute(&method, 0).unwrap();
    for name in ["a", "b", "c", "d", "e"] {
        assert!(frame.offset(name).is_ok(), "{name} missing");
    }
}

#[test]
fn printf_reserve_is_added_only_when_needed() {
    let plain = Method::new(vec![assign(Var::new("x"), 1i64)]);
    let frame = FrameLayout::compute(&plain, PRINTF_STACK_RESERVE).unwrap();
    assert_eq!(frame.reserve(), 0);
    assert_eq!(frame.frame_size(), 16);

    let nested = Method::new(vec![if_then(
        is_zero(Var::new("x")),
        printf("x is zero\n", vec![]),
    )]);
    let frame = FrameLayout::compute(&nested, PRINTF_STACK_RESERVE).unwrap();
    assert_eq!(frame.reserve(), PRINTF_STACK_RESERVE);
    assert!(frame.frame_size() >= frame.var_frame_size() + PRINTF_STACK_RESERVE);
    assert_eq!(frame.frame_size() % STACK_ALIGNMENT, 0);
}

#[test]
fn stack_slot_chunks_are_contiguous() {
    let method = Method::new(vec![
        assign(Var::new("before"), 0i64),
        with_stack_slot(20, |slot| {
            assert_eq!(slot.size(), 24);
            block(vec![assign(slot.at(16), 1i64), ret(slot.base())])
        }),
    ]);
    let Fragment::StackSlot(scope) = &method.fragments()[1] else {
        panic!("expected a stack slot");
    };
    assert_eq!(scope.chunks.len(), 3);

    let frame = FrameLayout::compute(&method, 0).unwrap();
    let base = frame.offset(&scope.chunks[0]).unwrap();
    for (index, chunk) in scope.chunks.iter().enumerate() {
        assert_eq!(frame.offset(chunk).unwrap(), base + 8 * index as i32);
    }
}

#[test]
fn empty_method_has_empty_frame() {
    let frame = FrameLayout::compute(&Method::new(vec![]), PRINTF_STACK_RESERVE).unwrap();
    assert_eq!(frame.frame_size(), 0);
    assert_eq!(frame.variable_count(), 0);
}
