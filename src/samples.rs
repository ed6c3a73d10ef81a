//! Built-in sample programs.
//!
//! Small programs that exercise the whole pipeline: the CLI builds them, and
//! the integration tests execute them on the host and compare the result.

use crate::ir::*;
pub use crate::x64::calling_convention::linux::{SYS_EXIT_GROUP, SYS_WRITE};
use crate::x64::calling_convention::linux::STDOUT_FILENO;

const HELLO_MESSAGE: &[u8] = b"hello from stagegen\n";

/// A named sample program.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub name: &'static str,
    pub description: &'static str,
    pub build: fn() -> Program,
    /// Value the entrypoint returns when executed.
    pub expected: u64,
}

/// All samples, in listing order.
pub fn all() -> &'static [Sample] {
    &SAMPLES
}

/// The sample called `name`.
pub fn find(name: &str) -> Option<&'static Sample> {
    SAMPLES.iter().find(|s| s.name == name)
}

static SAMPLES: [Sample; 5] = [
    Sample {
        name: "hello",
        description: "write a greeting to stdout and return the byte count",
        build: hello,
        expected: HELLO_MESSAGE.len() as u64,
    },
    Sample {
        name: "factorial",
        description: "recursive factorial of 10 with register arguments",
        build: factorial,
        expected: 3_628_800,
    },
    Sample {
        name: "is_even",
        description: "mutual recursion through a global counter",
        build: is_even,
        expected: 1,
    },
    Sample {
        name: "globals",
        description: "two globals combined by a helper, result stored as halves",
        build: globals,
        expected: 0x1_0000_002a,
    },
    Sample {
        name: "printf",
        description: "hex diagnostics through the printf intrinsic",
        build: printf_demo,
        expected: 0,
    },
];

pub fn hello() -> Program {
    let message = Var::new("message");
    let length = Var::new("length");
    let written = Var::new("written");
    Program::new("main").with_method(
        "main",
        vec![
            load_constant_bytes_config(ConstantBytesConfig {
                name: "greeting".into(),
                data: HELLO_MESSAGE.to_vec(),
                zero_terminate: true,
                length: Some(length.clone()),
                pointer: Some(message.clone()),
                ..Default::default()
            }),
            syscall_checked(SyscallChecked {
                result: written.clone(),
                number: SYS_WRITE,
                args: vec![STDOUT_FILENO.into(), message.into(), length.into()],
                on_error: ret(0i64),
            }),
            ret(written),
        ],
    )
}

pub fn factorial() -> Program {
    let n = Var::new("n");
    let rest = Var::new("rest");
    let result = Var::new("result");
    Program::new("main")
        .with_method(
            "main",
            vec![
                call_with(method_pointer("factorial"), vec![10i64.into()], Some(result.clone())),
                ret(result),
            ],
        )
        .with_method(
            "factorial",
            vec![
                declare_param("n"),
                if_then(is_less_or_equal(n.clone(), 1i64), ret(1i64)),
                call_with(
                    method_pointer("factorial"),
                    vec![op(OpKind::Sub, n.clone(), 1i64)],
                    Some(rest.clone()),
                ),
                ret(op(OpKind::Mul, n, rest)),
            ],
        )
}

pub fn is_even() -> Program {
    let n = Var::new("n");
    let result = Var::new("result");
    let counter = GlobalVar::new("counter");

    let step = |base_case: i64, next: &str| {
        Method::new(vec![
            assign(n.clone(), counter.mem()),
            if_then(is_zero(n.clone()), ret(base_case)),
            assign_global(&counter, op(OpKind::Sub, n.clone(), 1i64)),
            call_method(next, Some(result.clone())),
            ret(result.clone()),
        ])
    };

    Program::new("main")
        .with_method(
            "main",
            vec![
                assign_global(&counter, 4i64),
                call_method("is_even", Some(result.clone())),
                ret(result.clone()),
            ],
        )
        .with_method("is_even", step(1, "is_odd"))
        .with_method("is_odd", step(0, "is_even"))
        .with_global("counter", GlobalConfig::default())
}

pub fn globals() -> Program {
    let a = GlobalVar::new("a");
    let b = GlobalVar::new("b");
    let out = GlobalVar::new("out");
    let sum = Var::new("sum");
    let value = Var::new("value");

    Program::new("main")
        .with_method(
            "main",
            vec![
                assign_global(&a, 40i64),
                assign(b.mem().as32(), 2i32),
                call_method("combine", Some(sum.clone())),
                assign(value.clone(), op(OpKind::Or, sum, op(OpKind::Shl, 1i64, 32i64))),
                write_stage_result(StageResultStore {
                    base: out.mem(),
                    offset: 0,
                    value: value.clone(),
                    scratch: None,
                    shift: 0,
                }),
                ret(value),
            ],
        )
        .with_method(
            "combine",
            vec![ret(op(OpKind::Add, a.mem(), b.mem().as32()))],
        )
        .with_global("a", GlobalConfig::default())
        .with_global("b", GlobalConfig::new(4, 4))
        .with_global("out", GlobalConfig::new(16, 16))
}

pub fn printf_demo() -> Program {
    let value = Var::new("value");
    Program::new("main").with_method(
        "main",
        vec![
            assign(value.clone(), 0xbeefi64),
            printf("value=%x (100%%)\n", vec![value.clone().into()]),
            printf("shifted=%x\n", vec![op(OpKind::Shl, value, 8i64)]),
            ret(0i64),
        ],
    )
}
