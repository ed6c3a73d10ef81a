//! Standalone ELF images.

use object::{Object, ObjectKind, ObjectSegment};
use stagegen::elf::{standalone_elf, ElfConfig};
use stagegen::samples::{self, SYS_EXIT_GROUP};
use stagegen::{build_standalone_program, BuildError, LinkedProgram};

fn linked_sample(name: &str) -> LinkedProgram {
    let _ = env_logger::builder().is_test(true).try_init();
    let sample = samples::find(name).unwrap();
    build_standalone_program(&(sample.build)().with_exit_stub(SYS_EXIT_GROUP)).unwrap()
}

#[test]
fn image_parses_as_executable() {
    let linked = linked_sample("globals");
    let config = ElfConfig::default();
    let image = standalone_elf(&linked, &config).unwrap();

    let file = object::File::parse(&*image).unwrap();
    assert_eq!(file.kind(), ObjectKind::Executable);
    assert_eq!(file.architecture(), object::Architecture::X86_64);
    assert!(file.is_64());
    assert!(file.is_little_endian());
    assert_eq!(file.entry(), config.base_address);

    let segments: Vec<_> = file.segments().collect();
    assert_eq!(segments.len(), 1);
    let segment = &segments[0];
    assert_eq!(segment.address(), config.base_address);
    assert_eq!(segment.size(), linked.image_size() as u64);
    assert_eq!(
        segment.file_range(),
        (config.segment_offset, linked.code.len() as u64)
    );
    assert_eq!(segment.data().unwrap(), &linked.relocated_code(config.base_address)[..]);
}

#[test]
fn custom_base_address_rebases_relocations() {
    let linked = linked_sample("is_even");
    assert!(!linked.relocations.is_empty());
    let base = 0x80_0000;
    let image = standalone_elf(&linked, &ElfConfig::with_base(base)).unwrap();
    let payload = &image[0x1000..];
    for &pos in &linked.relocations {
        let original = u64::from_le_bytes(linked.code[pos..pos + 8].try_into().unwrap());
        let patched = u64::from_le_bytes(payload[pos..pos + 8].try_into().unwrap());
        assert_eq!(patched, original + base);
    }
}

#[test]
fn invalid_config_is_rejected() {
    let linked = linked_sample("hello");
    let config = ElfConfig {
        base_address: 0x40_1234,
        ..ElfConfig::default()
    };
    assert!(matches!(
        standalone_elf(&linked, &config),
        Err(BuildError::InvalidElfConfig { .. })
    ));
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn executable_exits_with_entrypoint_result() {
    use std::os::unix::fs::PermissionsExt;

    let linked = linked_sample("is_even");
    let image = standalone_elf(&linked, &ElfConfig::default()).unwrap();
    let path = std::path::Path::new(env!("CARGO_TARGET_TMPDIR")).join("stagegen_is_even");
    std::fs::write(&path, &image).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let status = std::process::Command::new(&path).status().unwrap();
    assert_eq!(status.code(), Some(1));
}
