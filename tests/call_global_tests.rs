//! Calls, syscalls and globals.

use bumpalo::Bump;
use iced_x86::{Decoder, DecoderOptions, Mnemonic, Register};
use stagegen::ir::*;
use stagegen::x64::X64Backend;
use stagegen::{CompilationSession, CompileError};

#[test]
fn syscall_loads_number_into_eax() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let method = Method::new(vec![syscall(60, vec![3i64.into()]), ret(0i64)]);
    let compiled = X64Backend::new()
        .compile_detailed(&session, "exit", &method)
        .unwrap();
    let insns: Vec<_> = Decoder::with_ip(64, &compiled.code, 0, DecoderOptions::NONE)
        .iter()
        .collect();
    let pos = insns
        .iter()
        .position(|i| i.mnemonic() == Mnemonic::Syscall)
        .unwrap();
    let before = &insns[..pos];
    assert!(before
        .iter()
        .any(|i| i.mnemonic() == Mnemonic::Mov && i.op0_register() == Register::EAX && i.immediate(1) == 60));
    assert!(before
        .iter()
        .any(|i| i.op0_register() == Register::EDI || i.op0_register() == Register::RDI));
    assert_eq!(session.stats().syscalls_lowered, 1);
}

#[test]
fn syscall_argument_limit() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let args: Vec<Fragment> = (0..7i64).map(Fragment::from).collect();
    let method = Method::new(vec![syscall(1, args)]);
    let err = X64Backend::new()
        .compile_detailed(&session, "m", &method)
        .unwrap_err();
    assert!(matches!(err, CompileError::TooManyArguments { max: 6, .. }));
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod native {
    use super::*;
    use stagegen::build_standalone_program;
    use stagegen::native::NativeImage;
    use stagegen::samples;

    fn load(program: &Program) -> NativeImage {
        let _ = env_logger::builder().is_test(true).try_init();
        let linked = build_standalone_program(program).unwrap();
        NativeImage::load(&linked).unwrap()
    }

    #[test]
    fn samples_return_expected_values() {
        for sample in samples::all() {
            let image = load(&(sample.build)());
            let result = unsafe { image.invoke(&[]) };
            assert_eq!(result, sample.expected, "sample {}", sample.name);
        }
    }

    #[test]
    fn stage_result_halves_land_in_global() {
        let image = load(&samples::globals());
        let value = unsafe { image.invoke(&[]) };
        assert_eq!(image.read_global("out"), Some(value));
    }

    #[test]
    fn six_register_arguments() {
        let params: Vec<Fragment> = (0..6).map(|i| declare_param(format!("p{i}"))).collect();
        let mut callee = params;
        // p0 + 2*p1 + 3*p2 + 4*p3 + 5*p4 + 6*p5
        let mut sum = Fragment::from(Var::new("p0"));
        for i in 1..6i64 {
            sum = op(OpKind::Add, sum, op(OpKind::Mul, Var::new(format!("p{i}")), i + 1));
        }
        callee.push(ret(sum));

        let result = Var::new("result");
        let args: Vec<Fragment> = (1..=6i64).map(Fragment::from).collect();
        let program = Program::new("main")
            .with_method(
                "main",
                vec![
                    call_with(method_pointer("weighted"), args, Some(result.clone())),
                    ret(result),
                ],
            )
            .with_method("weighted", callee);
        let image = load(&program);
        assert_eq!(unsafe { image.invoke(&[]) }, 1 + 4 + 9 + 16 + 25 + 36);
    }

    #[test]
    fn entry_parameters_come_from_the_caller() {
        let program = Program::new("main").with_method(
            "main",
            vec![
                declare_param("a"),
                declare_param("b"),
                ret(op(OpKind::Sub, Var::new("a"), Var::new("b"))),
            ],
        );
        let image = load(&program);
        assert_eq!(unsafe { image.invoke(&[50, 8]) }, 42);
    }

    #[test]
    fn arguments_that_swap_registers() {
        // Arguments read the callee's own parameter registers in reverse order.
        let program = Program::new("main")
            .with_method(
                "main",
                vec![
                    declare_param("x"),
                    declare_param("y"),
                    call_with(
                        method_pointer("pair"),
                        vec![Var::new("y").into(), Var::new("x").into()],
                        Some(Var::new("r")),
                    ),
                    ret(Var::new("r")),
                ],
            )
            .with_method(
                "pair",
                vec![
                    declare_param("hi"),
                    declare_param("lo"),
                    ret(op(OpKind::Or, op(OpKind::Shl, Var::new("hi"), 8i64), Var::new("lo"))),
                ],
            );
        let image = load(&program);
        assert_eq!(unsafe { image.invoke(&[0x11, 0x22]) }, 0x2211);
    }

    #[test]
    fn live_values_survive_nested_calls() {
        let x = Var::new("x");
        let program = Program::new("main")
            .with_method(
                "main",
                vec![
                    assign(x.clone(), 5i64),
                    ret(op(
                        OpKind::Add,
                        op(OpKind::Mul, x, 3i64),
                        call_with(method_pointer("seven"), vec![], None),
                    )),
                ],
            )
            .with_method(
                "seven",
                vec![
                    // Clobber every caller-saved register the pool hands out.
                    assign(Var::new("a"), op(OpKind::Add, op(OpKind::Add, 1i64, 2i64), op(OpKind::Add, 3i64, 1i64))),
                    ret(Var::new("a")),
                ],
            );
        let image = load(&program);
        assert_eq!(unsafe { image.invoke(&[]) }, 22);
    }

    #[test]
    fn indirect_call_through_variable() {
        let f = Var::new("f");
        let program = Program::new("main")
            .with_method(
                "main",
                vec![
                    assign(f.clone(), method_pointer("answer")),
                    call_with(f, vec![], Some(Var::new("r"))),
                    ret(Var::new("r")),
                ],
            )
            .with_method("answer", vec![ret(42i64)]);
        let image = load(&program);
        assert_eq!(unsafe { image.invoke(&[]) }, 42);
        assert_eq!(unsafe { image.invoke_method("answer", &[]) }, Some(42));
    }

    #[test]
    fn global_pointer_passed_to_callee() {
        let g = GlobalVar::new("g");
        let program = Program::new("main")
            .with_method(
                "main",
                vec![
                    call_with(method_pointer("store"), vec![g.pointer()], None),
                    ret(g.mem()),
                ],
            )
            .with_method(
                "store",
                vec![declare_param("p"), assign(Var::new("p").mem(), 99i64), ret(0i64)],
            )
            .with_global("g", GlobalConfig::default());
        let image = load(&program);
        assert_eq!(unsafe { image.invoke(&[]) }, 99);
        assert_eq!(image.read_global("g"), Some(99));
    }

    #[test]
    fn getpid_syscall() {
        let program = Program::new("main").with_method("main", vec![ret(syscall(39, vec![]))]);
        let image = load(&program);
        assert_eq!(unsafe { image.invoke(&[]) }, std::process::id() as u64);
    }

    #[test]
    fn checked_syscall_runs_error_branch() {
        let r = Var::new("r");
        // close(-1) fails with EBADF.
        let program = Program::new("main").with_method(
            "main",
            vec![
                syscall_checked(SyscallChecked {
                    result: r.clone(),
                    number: 3,
                    args: vec![(-1i64).into()],
                    on_error: ret(op(OpKind::Sub, 0i64, r)),
                }),
                ret(0i64),
            ],
        );
        let image = load(&program);
        assert_eq!(unsafe { image.invoke(&[]) }, libc::EBADF as u64);
    }

    #[test]
    fn strings_and_constants_are_addressable() {
        let p = Var::new("p");
        let program = Program::new("main").with_method(
            "main",
            vec![
                assign(p.clone(), string("AB")),
                load_constant_bytes("blob", vec![0x10, 0x20]),
                assign(Var::new("q"), constant_pointer("blob")),
                ret(op(
                    OpKind::Add,
                    p.mem().as16(),
                    Var::new("q").mem_with_disp(1).as8(),
                )),
            ],
        );
        let image = load(&program);
        assert_eq!(unsafe { image.invoke(&[]) }, 0x4241 + 0x20);
    }
}
