//! stagegen command-line driver.
//!
//! Builds the built-in sample programs into raw images or standalone ELF
//! executables, disassembles them, and runs them on the host.

use std::fs;
use std::path::PathBuf;

use bumpalo::Bump;
use clap::{Parser, Subcommand};
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use log::{debug, info};

use stagegen::elf::{standalone_elf, ElfConfig};
use stagegen::samples::{self, Sample, SYS_EXIT_GROUP};
use stagegen::{backend_for, Arch, CompilationSession, LinkedProgram};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "stagegen", version, about = "Build first-stage programs from the stagegen IR")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the built-in sample programs
    List,
    /// Link a sample and optionally write the image
    Build {
        sample: String,
        #[arg(long, default_value = "x86_64")]
        arch: String,
        /// Where to write the raw image (or ELF with --elf)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Wrap the program in an exit stub and write a standalone ELF executable
        #[arg(long)]
        elf: bool,
        /// Load address of the ELF segment
        #[arg(long, value_parser = parse_address)]
        base: Option<u64>,
    },
    /// Disassemble a linked sample
    Disasm {
        sample: String,
        #[arg(long, default_value = "x86_64")]
        arch: String,
    },
    /// Execute a sample in this process and print its result
    Run { sample: String },
}

fn parse_address(s: &str) -> Result<u64, String> {
    let trimmed = s.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match cli.command {
        Commands::List => {
            for sample in samples::all() {
                println!("{:<10} {}", sample.name, sample.description);
            }
            Ok(())
        }
        Commands::Build {
            sample,
            arch,
            output,
            elf,
            base,
        } => build(&sample, &arch, output, elf, base),
        Commands::Disasm { sample, arch } => disasm(&sample, &arch),
        Commands::Run { sample } => run(&sample),
    }
}

fn find_sample(name: &str) -> CliResult<&'static Sample> {
    samples::find(name).ok_or_else(|| {
        let known: Vec<_> = samples::all().iter().map(|s| s.name).collect();
        format!("unknown sample {name:?} (known: {})", known.join(", ")).into()
    })
}

fn link_sample(sample: &Sample, arch: &str, exit_stub: bool) -> CliResult<LinkedProgram> {
    let arch: Arch = arch.parse()?;
    let backend = backend_for(arch)?;
    let mut program = (sample.build)();
    if exit_stub {
        program = program.with_exit_stub(SYS_EXIT_GROUP);
    }

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let linked = backend.build_with_session(&program, &session)?;
    debug!("{}", session.stats());
    info!(
        "linked {} for {}: {} code bytes, {} BSS bytes",
        sample.name,
        arch,
        linked.code.len(),
        linked.bss_size
    );
    Ok(linked)
}

fn build(
    name: &str,
    arch: &str,
    output: Option<PathBuf>,
    elf: bool,
    base: Option<u64>,
) -> CliResult<()> {
    let sample = find_sample(name)?;
    let linked = link_sample(sample, arch, elf)?;

    println!("sample:      {}", sample.name);
    println!("code:        {} bytes", linked.code.len());
    println!("bss:         {} bytes", linked.bss_size);
    println!("relocations: {}", linked.relocations.len());
    for (method, offset) in &linked.methods {
        println!("  {offset:#06x}  {method}");
    }
    for (global, offset) in &linked.globals {
        println!("  {offset:#06x}  @{global}");
    }

    let Some(path) = output else {
        return Ok(());
    };
    let bytes = if elf {
        let config = base.map(ElfConfig::with_base).unwrap_or_default();
        standalone_elf(&linked, &config)?
    } else {
        linked.code.clone()
    };
    fs::write(&path, &bytes)?;
    println!("wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

fn disasm(name: &str, arch: &str) -> CliResult<()> {
    let sample = find_sample(name)?;
    let linked = link_sample(sample, arch, false)?;
    if arch.parse::<Arch>()? != Arch::X86_64 {
        return Err(format!("no disassembler for {arch}").into());
    }

    let mut decoder = Decoder::with_ip(64, &linked.code, 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    formatter.options_mut().set_first_operand_char_index(10);
    let mut text = String::new();
    let mut instruction = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        let offset = instruction.ip() as usize;
        if let Some(method) = linked.method_at(offset) {
            println!("\n<{method}>:");
        }
        text.clear();
        formatter.format(&instruction, &mut text);
        let bytes = &linked.code[offset..offset + instruction.len()];
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        println!("  {offset:06x}  {hex:<24} {text}");
    }
    Ok(())
}

#[cfg(all(unix, target_arch = "x86_64"))]
fn run(name: &str) -> CliResult<()> {
    use stagegen::native::NativeImage;

    let sample = find_sample(name)?;
    let linked = link_sample(sample, "x86_64", false)?;
    let image = NativeImage::load(&linked)?;
    // SAFETY: samples follow the System V convention and only issue benign syscalls.
    let result = unsafe { image.invoke(&[]) };
    println!("{} returned {result} ({result:#x})", sample.name);
    if result != sample.expected {
        return Err(format!("expected {:#x}", sample.expected).into());
    }
    Ok(())
}

#[cfg(not(all(unix, target_arch = "x86_64")))]
fn run(name: &str) -> CliResult<()> {
    find_sample(name)?;
    Err("running samples requires an x86-64 Unix host".into())
}
