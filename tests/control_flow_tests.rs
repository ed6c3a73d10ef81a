//! Control-flow lowering: structural checks everywhere, execution on x86-64 Linux.

use bumpalo::Bump;
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};
use stagegen::ir::*;
use stagegen::x64::X64Backend;
use stagegen::CompilationSession;

fn decode_method(fragments: Vec<Fragment>) -> Vec<Instruction> {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let compiled = X64Backend::new()
        .compile_detailed(&session, "test", &Method::new(fragments))
        .unwrap();
    Decoder::with_ip(64, &compiled.code, 0, DecoderOptions::NONE)
        .iter()
        .collect()
}

fn counting_loop() -> Vec<Fragment> {
    let i = Var::new("i");
    let sum = Var::new("sum");
    vec![
        assign(i.clone(), 1i64),
        assign(sum.clone(), 0i64),
        label("loop"),
        if_then(is_greater_than(i.clone(), 10i64), goto("done")),
        assign(sum.clone(), op(OpKind::Add, sum.clone(), i.clone())),
        assign(i.clone(), op(OpKind::Add, i, 1i64)),
        goto("loop"),
        label("done"),
        ret(sum),
    ]
}

#[test]
fn loop_has_backward_branch() {
    let insns = decode_method(counting_loop());
    let backward = insns.iter().any(|insn| {
        insn.flow_control() == FlowControl::UnconditionalBranch
            && insn.near_branch_target() < insn.ip()
    });
    assert!(backward);
    assert_eq!(insns.iter().filter(|i| i.flow_control() == FlowControl::Return).count(), 1);
}

#[test]
fn every_return_goes_through_the_epilogue() {
    let insns = decode_method(vec![
        if_else(is_zero(Var::new("x")), ret(1i64), ret(2i64)),
        ret(3i64),
    ]);
    assert_eq!(insns.iter().filter(|i| i.flow_control() == FlowControl::Return).count(), 1);
}

#[test]
fn labels_are_scoped_per_method() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let backend = X64Backend::new();
    for name in ["first", "second"] {
        let method = Method::new(vec![label("again"), ret(0i64)]);
        assert!(backend.compile_detailed(&session, name, &method).is_ok());
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod native {
    use super::*;
    use stagegen::build_standalone_program;
    use stagegen::native::NativeImage;

    fn run(fragments: Vec<Fragment>) -> u64 {
        let _ = env_logger::builder().is_test(true).try_init();
        let program = Program::new("main").with_method("main", fragments);
        let linked = build_standalone_program(&program).unwrap();
        let image = NativeImage::load(&linked).unwrap();
        unsafe { image.invoke(&[]) }
    }

    #[test]
    fn counting_loop_sums() {
        assert_eq!(run(counting_loop()), 55);
    }

    #[test]
    fn literals_round_trip_through_variables() {
        for value in [0i64, 1, -1, i64::MIN, i64::MAX, 0x7fff_ffff, 0x8000_0000, -0x8000_0000] {
            let x = Var::new("x");
            assert_eq!(run(vec![assign(x.clone(), value), ret(x)]), value as u64);
        }
    }

    #[test]
    fn arithmetic_wraps() {
        let x = Var::new("x");
        assert_eq!(
            run(vec![assign(x.clone(), i64::MAX), ret(op(OpKind::Add, x.clone(), 1i64))]),
            i64::MIN as u64
        );
        assert_eq!(
            run(vec![assign(x.clone(), i64::MIN), ret(op(OpKind::Sub, x, 1i64))]),
            i64::MAX as u64
        );
    }

    #[test]
    fn both_branches_to_one_label() {
        let result = run(vec![
            if_else(is_zero(0i64), goto("after"), goto("after")),
            ret(1i64),
            label("after"),
            ret(2i64),
        ]);
        assert_eq!(result, 2);
    }

    #[test]
    fn ten_nested_ifs() {
        let depth = Var::new("depth");
        let mut body = assign(depth.clone(), 10i64);
        for level in (0..10i64).rev() {
            body = if_then(is_greater_than(10i64, level), body);
        }
        assert_eq!(run(vec![assign(depth.clone(), 0i64), body, ret(depth)]), 10);
    }

    #[test]
    fn crossing_gotos() {
        let trace = Var::new("trace");
        let step = |digit: i64, next: &str| {
            vec![
                assign(trace.clone(), op(OpKind::Add, op(OpKind::Mul, trace.clone(), 10i64), digit)),
                goto(next),
            ]
        };
        let mut body = vec![assign(trace.clone(), 0i64), goto("a")];
        body.push(label("c"));
        body.extend(step(3, "d"));
        body.push(label("a"));
        body.extend(step(1, "b"));
        body.push(label("d"));
        body.extend(step(4, "end"));
        body.push(label("b"));
        body.extend(step(2, "c"));
        body.push(label("end"));
        body.push(ret(trace));
        assert_eq!(run(body), 1234);
    }

    #[test]
    fn signed_comparisons() {
        let x = Var::new("x");
        let cases: Vec<(Condition, u64)> = vec![
            (is_less_than(x.clone(), 3i64), 1),
            (is_less_or_equal(x.clone(), -5i64), 1),
            (is_greater_than(x.clone(), -6i64), 1),
            (is_greater_or_equal(x.clone(), 0i64), 0),
            (is_equal(x.clone(), -5i64), 1),
            (is_not_equal(x.clone(), -5i64), 0),
            (is_negative(x.clone()), 1),
            (is_zero(x.clone()), 0),
        ];
        for (cond, expected) in cases {
            let result = run(vec![
                assign(x.clone(), -5i64),
                if_else(cond.clone(), ret(1i64), ret(0i64)),
            ]);
            assert_eq!(result, expected, "{cond:?}");
        }
    }

    #[test]
    fn register_compare_against_large_constant() {
        let x = Var::new("x");
        let result = run(vec![
            assign(x.clone(), 0x1_0000_0000i64),
            if_then(is_equal(x, 0x1_0000_0000i64), ret(1i64)),
            ret(0i64),
        ]);
        assert_eq!(result, 1);
    }

    #[test]
    fn arithmetic_and_shifts() {
        let a = Var::new("a");
        let b = Var::new("b");
        assert_eq!(
            run(vec![
                assign(a.clone(), 6i64),
                assign(b.clone(), 7i64),
                ret(op(OpKind::Mul, a.clone(), b.clone())),
            ]),
            42
        );
        assert_eq!(
            run(vec![
                assign(a.clone(), 0xf0i64),
                ret(op(OpKind::Xor, op(OpKind::Shr, a.clone(), 4i64), op(OpKind::Shl, 1i64, 8i64))),
            ]),
            0x10f
        );
        assert_eq!(
            run(vec![
                assign(a.clone(), -1i64),
                ret(op(OpKind::Shr, a, 60i64)),
            ]),
            0xf
        );
        assert_eq!(run(vec![ret(op(OpKind::Sub, 0i64, 1i64))]), u64::MAX);
    }

    #[test]
    fn narrow_views() {
        let x = Var::new("x");
        let result = run(vec![
            assign(x.clone(), 0x1122_3344_5566_7788i64),
            ret(op(OpKind::Add, x.as8(), x.as16())),
        ]);
        assert_eq!(result, 0x88 + 0x7788);
    }

    #[test]
    fn declare_label_body_runs() {
        let n = Var::new("n");
        let result = run(vec![
            assign(n.clone(), 0i64),
            declare_label(
                "top",
                vec![
                    assign(n.clone(), op(OpKind::Add, n.clone(), 3i64)),
                    if_then(is_less_than(n.clone(), 30i64), goto("top")),
                ],
            ),
            ret(n),
        ]);
        assert_eq!(result, 30);
    }

    #[test]
    fn bubble_sort_in_stack_slot() {
        let i = Var::new("i");
        let a = Var::new("a");
        let b = Var::new("b");
        let result = run(vec![with_stack_slot(40, |slot| {
            let values = [5i64, 3, 8, 1, 9];
            let mut body: Vec<Fragment> = values
                .iter()
                .enumerate()
                .map(|(idx, &v)| assign(slot.at(idx as i64 * 8), v))
                .collect();
            body.push(assign(i.clone(), 0i64));
            body.push(label("pass"));
            for idx in 0..4i64 {
                body.push(assign(a.clone(), slot.at(idx * 8)));
                body.push(assign(b.clone(), slot.at(idx * 8 + 8)));
                body.push(if_then(
                    is_greater_than(a.clone(), b.clone()),
                    block(vec![
                        assign(slot.at(idx * 8), b.clone()),
                        assign(slot.at(idx * 8 + 8), a.clone()),
                    ]),
                ));
            }
            body.push(assign(i.clone(), op(OpKind::Add, i.clone(), 1i64)));
            body.push(if_then(is_less_than(i.clone(), 4i64), goto("pass")));
            // smallest * 100 + largest
            body.push(ret(op(
                OpKind::Add,
                op(OpKind::Mul, slot.at(0), 100i64),
                slot.at(32),
            )));
            block(body)
        })]);
        assert_eq!(result, 109);
    }

    #[test]
    fn slot_pointer_and_cache_flush() {
        let p = Var::new("p");
        let result = run(vec![with_stack_slot(16, |slot| {
            block(vec![
                assign(p.clone(), slot.pointer()),
                assign(p.mem_with_disp(8), 77i64),
                cache_flush(p.clone(), 16i64),
                ret(slot.at(8)),
            ])
        })]);
        assert_eq!(result, 77);
    }
}
