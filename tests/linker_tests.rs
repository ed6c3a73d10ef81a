//! Whole-program linking through the x86-64 backend.

use stagegen::core::reloc::{global_token, is_token_like, method_token};
use stagegen::ir::*;
use stagegen::linker::{METHOD_ALIGNMENT, BSS_ALIGNMENT};
use stagegen::{build_standalone_program, BuildError, CompileError, LinkError, LinkedProgram};

fn link(program: &Program) -> Result<LinkedProgram, BuildError> {
    let _ = env_logger::builder().is_test(true).try_init();
    build_standalone_program(program)
}

fn read_u64(code: &[u8], pos: usize) -> u64 {
    u64::from_le_bytes(code[pos..pos + 8].try_into().unwrap())
}

#[test]
fn entrypoint_is_placed_first() {
    let program = Program::new("zzz_main")
        .with_method("aaa_helper", vec![ret(1i64)])
        .with_method("zzz_main", vec![call_method("aaa_helper", None), ret(0i64)]);
    let linked = link(&program).unwrap();
    assert_eq!(linked.methods["zzz_main"], 0);
    assert_eq!(linked.method_at(0), Some("zzz_main"));
    assert_eq!(linked.methods["aaa_helper"] as u64 % METHOD_ALIGNMENT, 0);
    assert!(linked.methods["aaa_helper"] > 0);
}

#[test]
fn method_pointers_resolve_to_method_offsets() {
    let program = Program::new("main")
        .with_method("main", vec![ret(method_pointer("target"))])
        .with_method("target", vec![ret(7i64)]);
    let linked = link(&program).unwrap();
    assert_eq!(linked.relocations.len(), 1);
    let value = read_u64(&linked.code, linked.relocations[0]);
    assert_eq!(value as usize, linked.methods["target"]);

    let rebased = linked.relocated_code(0x40_0000);
    assert_eq!(
        read_u64(&rebased, linked.relocations[0]),
        0x40_0000 + linked.methods["target"] as u64
    );
}

#[test]
fn globals_are_laid_out_after_code() {
    let program = Program::new("main")
        .with_method(
            "main",
            vec![
                assign_global(&GlobalVar::new("a"), 1i64),
                assign(GlobalVar::new("big").mem(), 2i64),
                assign(GlobalVar::new("small").mem().as8(), 3i8),
                ret(0i64),
            ],
        )
        .with_global("a", GlobalConfig::default())
        .with_global("big", GlobalConfig::new(100, 64))
        .with_global("small", GlobalConfig::new(1, 1));
    let linked = link(&program).unwrap();

    let code_len = linked.code.len();
    let bss_start = (code_len as u64).div_ceil(BSS_ALIGNMENT) * BSS_ALIGNMENT;
    for (name, &offset) in &linked.globals {
        assert!(offset as u64 >= bss_start, "{name} overlaps code");
        assert!(offset < linked.image_size(), "{name} outside image");
    }
    assert_eq!(linked.globals["big"] % 64, 0);
    assert!(linked.globals["big"] + 100 <= linked.image_size());
    assert!(linked.globals["a"] < linked.globals["big"]);
    assert!(linked.globals["big"] < linked.globals["small"]);

    // Every relocated slot points inside the image.
    for &pos in &linked.relocations {
        assert!((read_u64(&linked.code, pos) as usize) < linked.image_size());
    }
}

#[test]
fn scratch_regions_do_not_overlap_globals() {
    let program = Program::new("main")
        .with_method(
            "main",
            vec![
                reserve_scratch("buf", 24),
                assign(Var::new("p"), constant_pointer("buf")),
                assign(GlobalVar::new("g").mem(), Var::new("p")),
                ret(0i64),
            ],
        )
        .with_global("g", GlobalConfig::default());
    let linked = link(&program).unwrap();
    let scratch_addrs: Vec<u64> = linked
        .relocations
        .iter()
        .map(|&pos| read_u64(&linked.code, pos))
        .collect();
    let global = linked.globals["g"] as u64;
    for addr in scratch_addrs.iter().filter(|&&a| a != global) {
        assert!(addr + 24 <= global, "scratch at {addr:#x} overlaps global at {global:#x}");
    }
}

#[test]
fn validation_errors() {
    let missing = Program::new("main").with_method("other", vec![ret(0i64)]);
    assert!(matches!(
        link(&missing),
        Err(BuildError::Link(LinkError::MissingEntrypoint { .. }))
    ));

    let undeclared = Program::new("main").with_method("main", vec![ret(GlobalVar::new("nope").mem())]);
    assert!(matches!(
        link(&undeclared),
        Err(BuildError::Link(LinkError::UndeclaredGlobal { ref global, .. })) if global == "nope"
    ));

    let unknown = Program::new("main").with_method("main", vec![call_method("ghost", None)]);
    assert!(matches!(
        link(&unknown),
        Err(BuildError::Link(LinkError::UnknownMethod { ref target, .. })) if target == "ghost"
    ));

    let bad_align = Program::new("main")
        .with_method("main", vec![ret(0i64)])
        .with_global("g", GlobalConfig::new(8, 12));
    assert!(matches!(
        link(&bad_align),
        Err(BuildError::Link(LinkError::InvalidGlobal { .. }))
    ));
}

#[test]
fn method_errors_name_the_method() {
    let program = Program::new("main")
        .with_method("main", vec![call_method("broken", None), ret(0i64)])
        .with_method("broken", vec![goto("missing")]);
    match link(&program) {
        Err(BuildError::Link(LinkError::Method { method, source })) => {
            assert_eq!(method, "broken");
            assert!(matches!(source, CompileError::UndefinedLabel { .. }));
        }
        other => panic!("expected a method error, got {other:?}"),
    }
}

#[test]
fn linking_is_deterministic() {
    let build = || {
        Program::new("main")
            .with_method("main", vec![call_method("b", None), call_method("a", None), ret(0i64)])
            .with_method("a", vec![printf("a=%x\n", vec![1i64.into()]), ret(0i64)])
            .with_method("b", vec![ret(string("b"))])
            .with_global("x", GlobalConfig::default())
    };
    assert_eq!(link(&build()).unwrap(), link(&build()).unwrap());
}

#[test]
fn no_placeholder_token_survives_linking() {
    let counter = GlobalVar::new("counter");
    let table = GlobalVar::new("table");
    let p = Var::new("p");
    let program = Program::new("main")
        .with_method(
            "main",
            vec![
                assign(p.clone(), method_pointer("helper")),
                call_with(p.clone(), vec![table.pointer()], None),
                assign_global(&counter, op(OpKind::Add, counter.mem(), 1i64)),
                assign(table.mem_with_disp(8).as32(), 5i32),
                ret(method_pointer("other")),
            ],
        )
        .with_method(
            "helper",
            vec![
                declare_param("t"),
                assign(Var::new("t").mem(), counter.mem()),
                ret(table.pointer()),
            ],
        )
        .with_method("other", vec![call_method("helper", None), ret(counter.pointer())])
        .with_global("counter", GlobalConfig::default())
        .with_global("table", GlobalConfig::new(32, 16));
    let linked = link(&program).unwrap();
    assert!(linked.relocations.len() >= 7);

    let tokens: Vec<u64> = ["main", "helper", "other"]
        .into_iter()
        .map(method_token)
        .chain(["counter", "table"].into_iter().map(global_token))
        .collect();
    for pos in 0..=linked.code.len() - 8 {
        let word = read_u64(&linked.code, pos);
        assert!(!tokens.contains(&word), "token {word:#x} left at {pos:#x}");
        assert!(!is_token_like(word), "token-like value {word:#x} at {pos:#x}");
    }
}
