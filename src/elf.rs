// This module writes a linked program as a standalone x86-64 ELF executable. The image
// has no sections and a single PT_LOAD segment: the file holds the relocated code at
// `segment_offset`, memory extends it by the BSS size, and the entry point is the first
// byte of the segment. The segment is readable, writable and executable because method
// scratch and globals share it with the code. The configuration is validated up front:
// the headers must fit before the segment, the alignment must be a power of two, and the
// base address must be congruent with the file offset so the kernel can map it.

//! Standalone ELF image writer.

use log::debug;
use object::elf::{EM_X86_64, ET_EXEC, PF_R, PF_W, PF_X, PT_LOAD};
use object::write::elf::{FileHeader, ProgramHeader, Writer};
use object::Endianness;

use crate::core::error::{BuildError, BuildResult};
use crate::linker::LinkedProgram;

const ELF_HEADER_SIZE: u64 = 64;
const PROGRAM_HEADER_SIZE: u64 = 56;

/// Placement of the loadable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfConfig {
    /// Virtual address of the first code byte; also the entry point.
    pub base_address: u64,
    /// File offset of the segment.
    pub segment_offset: u64,
    pub segment_alignment: u64,
}

impl Default for ElfConfig {
    fn default() -> Self {
        Self {
            base_address: 0x40_1000,
            segment_offset: 0x1000,
            segment_alignment: 0x1000,
        }
    }
}

impl ElfConfig {
    /// Default placement at a different base address.
    pub fn with_base(base_address: u64) -> Self {
        Self {
            base_address,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> BuildResult<()> {
        let invalid = |reason: String| Err(BuildError::InvalidElfConfig { reason });

        let headers = ELF_HEADER_SIZE + PROGRAM_HEADER_SIZE;
        if self.segment_offset < headers {
            return invalid(format!(
                "segment offset {:#x} too small for ELF headers ({headers:#x})",
                self.segment_offset
            ));
        }
        if !self.segment_alignment.is_power_of_two() {
            return invalid(format!(
                "segment alignment {:#x} is not a power of two",
                self.segment_alignment
            ));
        }
        if self.segment_offset % self.segment_alignment != 0 {
            return invalid(format!(
                "segment offset {:#x} must be aligned to {:#x}",
                self.segment_offset, self.segment_alignment
            ));
        }
        if self.base_address < self.segment_offset {
            return invalid(format!(
                "base address {:#x} must be >= segment offset {:#x}",
                self.base_address, self.segment_offset
            ));
        }
        if (self.base_address - self.segment_offset) % self.segment_alignment != 0 {
            return invalid(format!(
                "base address {:#x} is not congruent to offset {:#x} modulo {:#x}",
                self.base_address, self.segment_offset, self.segment_alignment
            ));
        }
        if usize::try_from(self.segment_offset).is_err() {
            return invalid(format!(
                "segment offset {:#x} exceeds platform limits",
                self.segment_offset
            ));
        }
        Ok(())
    }
}

/// Emit `program` as an executable image.
pub fn standalone_elf(program: &LinkedProgram, config: &ElfConfig) -> BuildResult<Vec<u8>> {
    config.validate()?;

    let code = program.relocated_code(config.base_address);
    let file_size = code.len() as u64;
    let mem_size = file_size + program.bss_size as u64;

    let mut buffer = Vec::new();
    let mut writer = Writer::new(Endianness::Little, true, &mut buffer);
    writer.reserve_file_header();
    writer.reserve_program_headers(1);
    let segment_offset = config.segment_offset as usize;
    writer.reserve_until(segment_offset);
    writer.reserve(code.len(), 1);

    writer
        .write_file_header(&FileHeader {
            os_abi: object::elf::ELFOSABI_NONE,
            abi_version: 0,
            e_type: ET_EXEC,
            e_machine: EM_X86_64,
            e_entry: config.base_address,
            e_flags: 0,
        })
        .map_err(|e| BuildError::ElfWrite {
            reason: e.to_string(),
        })?;

    writer.write_align_program_headers();
    writer.write_program_header(&ProgramHeader {
        p_type: PT_LOAD,
        p_flags: PF_R | PF_W | PF_X,
        p_offset: config.segment_offset,
        p_vaddr: config.base_address,
        p_paddr: config.base_address,
        p_filesz: file_size,
        p_memsz: mem_size,
        p_align: config.segment_alignment,
    });

    writer.pad_until(segment_offset);
    writer.write(&code);

    debug!(
        "wrote ELF image: {} bytes, segment at {:#x} ({} file / {} memory bytes)",
        buffer.len(),
        config.base_address,
        file_size,
        mem_size
    );
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ElfConfig::default().validate().is_ok());
        assert!(ElfConfig::with_base(0x80_0000).validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            ElfConfig {
                segment_offset: 0x40,
                ..ElfConfig::default()
            },
            ElfConfig {
                segment_alignment: 0x1800,
                ..ElfConfig::default()
            },
            ElfConfig {
                segment_offset: 0x1800,
                ..ElfConfig::default()
            },
            ElfConfig::with_base(0x800),
            ElfConfig::with_base(0x40_1800),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(BuildError::InvalidElfConfig { .. })),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_header_and_payload_placement() {
        let program = LinkedProgram {
            code: vec![0xc3; 5],
            bss_size: 16,
            ..Default::default()
        };
        let image = standalone_elf(&program, &ElfConfig::default()).unwrap();
        assert_eq!(&image[..4], b"\x7fELF");
        assert_eq!(image.len(), 0x1000 + 5);
        assert_eq!(&image[0x1000..], &[0xc3; 5]);
    }
}
