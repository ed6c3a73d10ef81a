// This module loads a linked program into the current process so it can be executed
// directly. The image is mapped anonymously, the code is copied in, the BSS after it is
// left zeroed by the kernel, and every relocation slot is rebased to the mapping address.
// The whole mapping then becomes readable, writable and executable: globals and method
// scratch live in the same region as the code, so there is no way to split it into
// separate W^X pages without changing the image layout.

//! In-process loader for linked programs (x86-64 Unix).

use std::io;
use std::ptr;

use log::debug;

use crate::linker::LinkedProgram;

/// Most System V integer arguments [`NativeImage::invoke`] passes in registers.
pub const MAX_INVOKE_ARGS: usize = 6;

type EntryFn = extern "sysv64" fn(u64, u64, u64, u64, u64, u64) -> u64;

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// A linked program mapped into this process.
pub struct NativeImage {
    base: *mut u8,
    map_size: usize,
    image_size: usize,
    methods: Vec<(String, usize)>,
    globals: Vec<(String, usize)>,
}

// SAFETY: NativeImage owns its mapping exclusively and never hands out mutable aliases.
unsafe impl Send for NativeImage {}

impl NativeImage {
    /// Map `program`, apply its relocations and make it executable.
    pub fn load(program: &LinkedProgram) -> io::Result<Self> {
        let image_size = program.image_size();
        let page = page_size();
        let map_size = image_size.max(1).div_ceil(page) * page;

        // SAFETY: anonymous private mapping with no file backing.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let image = Self {
            base: raw as *mut u8,
            map_size,
            image_size,
            methods: program.methods.iter().map(|(n, &o)| (n.clone(), o)).collect(),
            globals: program.globals.iter().map(|(n, &o)| (n.clone(), o)).collect(),
        };

        let code = program.relocated_code(image.base as u64);
        // SAFETY: the mapping is at least `image_size >= code.len()` bytes and writable.
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), image.base, code.len()) };

        // SAFETY: `base` and `map_size` describe the mapping created above.
        let rc = unsafe {
            libc::mprotect(
                raw,
                map_size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            // Dropping `image` unmaps the region.
            return Err(io::Error::last_os_error());
        }

        debug!(
            "loaded image at {:p}: {} code bytes, {} BSS bytes, {} relocations",
            image.base,
            program.code.len(),
            program.bss_size,
            program.relocations.len()
        );
        Ok(image)
    }

    /// Address the image is mapped at.
    pub fn base_address(&self) -> u64 {
        self.base as u64
    }

    /// Code plus BSS.
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Absolute address of the global `name`.
    pub fn global_address(&self, name: &str) -> Option<u64> {
        self.globals
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, offset)| self.base_address() + *offset as u64)
    }

    /// Read the first 8 bytes of the global `name`.
    pub fn read_global(&self, name: &str) -> Option<u64> {
        let offset = self.globals.iter().find(|(n, _)| n == name)?.1;
        if offset + 8 > self.image_size {
            return None;
        }
        // SAFETY: the range lies inside the mapping.
        let value = unsafe { ptr::read_unaligned(self.base.add(offset) as *const u64) };
        Some(value)
    }

    /// Call the entrypoint with up to six integer arguments.
    ///
    /// # Safety
    ///
    /// The image runs with the full privileges of this process. It must have
    /// been built from a program whose entrypoint follows the System V calling
    /// convention and does not corrupt state the caller depends on.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_INVOKE_ARGS`] arguments are passed.
    pub unsafe fn invoke(&self, args: &[u64]) -> u64 {
        // SAFETY: forwarded to the caller.
        unsafe { self.invoke_at(0, args) }
    }

    /// Call the method `name` directly.
    ///
    /// # Safety
    ///
    /// Same contract as [`NativeImage::invoke`].
    pub unsafe fn invoke_method(&self, name: &str, args: &[u64]) -> Option<u64> {
        let offset = self.methods.iter().find(|(n, _)| n == name)?.1;
        // SAFETY: forwarded to the caller.
        Some(unsafe { self.invoke_at(offset, args) })
    }

    unsafe fn invoke_at(&self, offset: usize, args: &[u64]) -> u64 {
        assert!(
            args.len() <= MAX_INVOKE_ARGS,
            "at most {MAX_INVOKE_ARGS} arguments are supported, got {}",
            args.len()
        );
        let mut regs = [0u64; MAX_INVOKE_ARGS];
        regs[..args.len()].copy_from_slice(args);

        // SAFETY: `offset` is a method start inside the executable mapping; extra
        // zero arguments are ignored by a System V callee.
        let entry: EntryFn = unsafe { std::mem::transmute(self.base.add(offset)) };
        entry(regs[0], regs[1], regs[2], regs[3], regs[4], regs[5])
    }
}

impl Drop for NativeImage {
    fn drop(&mut self) {
        // SAFETY: `base` and `map_size` describe a mapping owned by this value.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_size);
        }
    }
}

impl std::fmt::Debug for NativeImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeImage")
            .field("base", &self.base)
            .field("image_size", &self.image_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_invoke_raw_image() {
        // mov rax, rdi; add rax, rsi; ret
        let program = LinkedProgram {
            code: vec![0x48, 0x89, 0xf8, 0x48, 0x01, 0xf0, 0xc3],
            bss_size: 8,
            ..Default::default()
        };
        let image = NativeImage::load(&program).unwrap();
        assert_eq!(image.image_size(), 15);
        assert_eq!(unsafe { image.invoke(&[40, 2]) }, 42);
    }

    #[test]
    fn test_relocations_are_rebased() {
        // movabs rax, <image offset 16>; ret
        let mut code = vec![0x48, 0xb8];
        code.extend_from_slice(&16u64.to_le_bytes());
        code.push(0xc3);
        let program = LinkedProgram {
            code,
            relocations: vec![2],
            bss_size: 16,
            globals: [("g".to_string(), 16)].into_iter().collect(),
            ..Default::default()
        };
        let image = NativeImage::load(&program).unwrap();
        let result = unsafe { image.invoke(&[]) };
        assert_eq!(result, image.base_address() + 16);
        assert_eq!(image.global_address("g"), Some(result));
        assert_eq!(image.read_global("g"), Some(0));
    }
}
