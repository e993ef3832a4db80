//! Crafted images and a fake page controller for the unit tests.
use std::cell::RefCell;

use scroll::{ctx::TryIntoCtx, Endian, Pwrite, LE};

use crate::{
    elf::*,
    error::{HookError, Result},
    memory::ImageBuffer,
    platform::{PageControl, Protection},
};

pub const BASE: usize = 0x70aca000;
pub const IMAGE_SIZE: usize = 0x2000;
const R_AARCH64_JUMP_SLOT: u64 = 1026;
const R_ARM_JUMP_SLOT: u64 = 22;

/// Offsets of the tables inside a fixture image.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub phdrs: usize,
    pub dynamic: usize,
    pub strtab: usize,
    pub symtab: usize,
    pub rel: usize,
    pub got: usize,
}

const LAYOUT: Layout = Layout {
    phdrs: 0x40,
    dynamic: 0x100,
    strtab: 0x200,
    symtab: 0x400,
    rel: 0x800,
    got: 0x1000,
};

/// A shared object importing `imports` through its PLT, in that order.
#[derive(Debug, Clone)]
pub struct Fixture {
    class: Class,
    imports: Vec<String>,
    dynamic: bool,
    rel: bool,
    absolute_dynamic: bool,
    executable: bool,
}

fn put<T>(bytes: &mut [u8], offset: usize, value: T)
where
    T: TryIntoCtx<Endian, Error = scroll::Error>,
{
    bytes.pwrite_with(value, offset, LE).unwrap();
}

impl Fixture {
    pub fn new(class: Class, imports: &[&str]) -> Self {
        Self {
            class,
            imports: imports.iter().map(|s| s.to_string()).collect(),
            dynamic: true,
            rel: false,
            absolute_dynamic: false,
            executable: false,
        }
    }
    pub fn without_dynamic(mut self) -> Self {
        self.dynamic = false;
        self
    }
    pub fn with_rel(mut self) -> Self {
        self.rel = true;
        self
    }
    /// Dynamic pointers already relocated, the way glibc leaves them.
    pub fn with_absolute_dynamic(mut self) -> Self {
        self.absolute_dynamic = true;
        self
    }
    /// Linked at `BASE` like a non-PIE executable.
    pub fn as_executable(mut self) -> Self {
        self.executable = true;
        self
    }

    pub fn layout(&self) -> Layout {
        LAYOUT
    }
    pub fn slot(&self, idx: usize) -> usize {
        BASE + LAYOUT.got + idx * self.class.word_size()
    }
    /// What the loader left in slot `idx`.
    pub fn original(&self, idx: usize) -> usize {
        0x1000_0000 + idx * 0x10
    }

    fn reloc_size(&self) -> usize {
        match (self.class, self.rel) {
            (Class::Elf64, false) => 24,
            (Class::Elf64, true) => 16,
            (Class::Elf32, false) => 12,
            (Class::Elf32, true) => 8,
        }
    }

    pub fn build(&self) -> ImageBuffer {
        let mut bytes = vec![0u8; IMAGE_SIZE];
        let link_base = if self.executable { BASE as u64 } else { 0 };
        let ptr_base = if self.executable || self.absolute_dynamic {
            BASE as u64
        } else {
            0
        };

        let mut names = vec![0u8];
        let mut name_offsets = Vec::new();
        for name in &self.imports {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        bytes[LAYOUT.strtab..LAYOUT.strtab + names.len()].copy_from_slice(&names);

        let count = self.imports.len();
        let pltrel = if self.rel { DT_REL } else { DT_RELA };
        // A stale DT_STRTAB first (later duplicate wins) and junk after DT_NULL
        let dynamic: [(i64, u64); 8] = [
            (DT_STRTAB, 0xbeef),
            (DT_PLTRELSZ, (count * self.reloc_size()) as u64),
            (DT_PLTREL, pltrel as u64),
            (DT_JMPREL, ptr_base + LAYOUT.rel as u64),
            (DT_SYMTAB, ptr_base + LAYOUT.symtab as u64),
            (DT_STRTAB, ptr_base + LAYOUT.strtab as u64),
            (DT_NULL, 0),
            (DT_STRTAB, 0xdead),
        ];
        let phnum = if self.dynamic { 2 } else { 1 };
        let e_type = if self.executable { 2 } else { 3 };

        match self.class {
            Class::Elf64 => {
                let mut e_ident = [0u8; EI_NIDENT];
                e_ident[..4].copy_from_slice(&ELF_MAGIC);
                e_ident[4..7].copy_from_slice(&[2, 1, 1]);
                put(
                    &mut bytes,
                    0,
                    Elf64Ehdr {
                        e_ident,
                        e_type,
                        e_machine: 183,
                        e_version: 1,
                        e_phoff: LAYOUT.phdrs as u64,
                        e_ehsize: 64,
                        e_phentsize: 56,
                        e_phnum: phnum,
                        ..Default::default()
                    },
                );
                put(
                    &mut bytes,
                    LAYOUT.phdrs,
                    Elf64Phdr {
                        p_type: PT_LOAD,
                        p_vaddr: link_base,
                        p_memsz: IMAGE_SIZE as u64,
                        p_filesz: IMAGE_SIZE as u64,
                        ..Default::default()
                    },
                );
                if self.dynamic {
                    put(
                        &mut bytes,
                        LAYOUT.phdrs + 56,
                        Elf64Phdr {
                            p_type: PT_DYNAMIC,
                            p_offset: LAYOUT.dynamic as u64,
                            p_vaddr: link_base + LAYOUT.dynamic as u64,
                            p_memsz: (dynamic.len() * 16) as u64,
                            ..Default::default()
                        },
                    );
                }
                for (idx, (d_tag, d_val)) in dynamic.into_iter().enumerate() {
                    put(&mut bytes, LAYOUT.dynamic + idx * 16, Elf64Dyn { d_tag, d_val });
                }
                for (idx, st_name) in name_offsets.into_iter().enumerate() {
                    let sym = Elf64Sym {
                        st_name,
                        st_info: 0x12,
                        ..Default::default()
                    };
                    put(&mut bytes, LAYOUT.symtab + (idx + 1) * 24, sym);
                    let r_offset = link_base + (LAYOUT.got + idx * 8) as u64;
                    let r_info = ((idx as u64 + 1) << 32) | R_AARCH64_JUMP_SLOT;
                    let at = LAYOUT.rel + idx * self.reloc_size();
                    if self.rel {
                        put(&mut bytes, at, Elf64Rel { r_offset, r_info });
                    } else {
                        let r_addend = 0;
                        put(&mut bytes, at, Elf64Rela { r_offset, r_info, r_addend });
                    }
                    put(&mut bytes, LAYOUT.got + idx * 8, self.original(idx) as u64);
                }
            }
            Class::Elf32 => {
                let mut e_ident = [0u8; EI_NIDENT];
                e_ident[..4].copy_from_slice(&ELF_MAGIC);
                e_ident[4..7].copy_from_slice(&[1, 1, 1]);
                put(
                    &mut bytes,
                    0,
                    Elf32Ehdr {
                        e_ident,
                        e_type,
                        e_machine: 40,
                        e_version: 1,
                        e_phoff: LAYOUT.phdrs as u32,
                        e_ehsize: 52,
                        e_phentsize: 32,
                        e_phnum: phnum,
                        ..Default::default()
                    },
                );
                put(
                    &mut bytes,
                    LAYOUT.phdrs,
                    Elf32Phdr {
                        p_type: PT_LOAD,
                        p_vaddr: link_base as u32,
                        p_memsz: IMAGE_SIZE as u32,
                        p_filesz: IMAGE_SIZE as u32,
                        ..Default::default()
                    },
                );
                if self.dynamic {
                    put(
                        &mut bytes,
                        LAYOUT.phdrs + 32,
                        Elf32Phdr {
                            p_type: PT_DYNAMIC,
                            p_offset: LAYOUT.dynamic as u32,
                            p_vaddr: (link_base + LAYOUT.dynamic as u64) as u32,
                            p_memsz: (dynamic.len() * 8) as u32,
                            ..Default::default()
                        },
                    );
                }
                for (idx, (d_tag, d_val)) in dynamic.into_iter().enumerate() {
                    let entry = Elf32Dyn {
                        d_tag: d_tag as i32,
                        d_val: d_val as u32,
                    };
                    put(&mut bytes, LAYOUT.dynamic + idx * 8, entry);
                }
                for (idx, st_name) in name_offsets.into_iter().enumerate() {
                    let sym = Elf32Sym {
                        st_name,
                        st_info: 0x12,
                        ..Default::default()
                    };
                    put(&mut bytes, LAYOUT.symtab + (idx + 1) * 16, sym);
                    let r_offset = (link_base as u32) + (LAYOUT.got + idx * 4) as u32;
                    let r_info = ((idx as u32 + 1) << 8) | R_ARM_JUMP_SLOT as u32;
                    let at = LAYOUT.rel + idx * self.reloc_size();
                    if self.rel {
                        put(&mut bytes, at, Elf32Rel { r_offset, r_info });
                    } else {
                        let r_addend = 0;
                        put(&mut bytes, at, Elf32Rela { r_offset, r_info, r_addend });
                    }
                    put(&mut bytes, LAYOUT.got + idx * 4, self.original(idx) as u32);
                }
            }
        }
        ImageBuffer::new(BASE, bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCall {
    Protect(usize, usize, Protection),
    Invalidate(usize, usize),
}

/// Records what the patcher asks of the OS instead of doing it.
#[derive(Debug, Default)]
pub struct RecordingPages {
    pub calls: RefCell<Vec<PageCall>>,
    pub refuse: bool,
}

impl RecordingPages {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Default::default()
        }
    }
    pub fn calls(&self) -> Vec<PageCall> {
        self.calls.borrow().clone()
    }
}

impl PageControl for RecordingPages {
    fn page_size(&self) -> usize {
        0x1000
    }
    fn protect(&self, start: usize, len: usize, protection: Protection) -> Result<()> {
        if self.refuse {
            return Err(HookError::Protection {
                addr: start,
                source: std::io::Error::from_raw_os_error(libc::EACCES),
            });
        }
        self.calls
            .borrow_mut()
            .push(PageCall::Protect(start, len, protection));
        Ok(())
    }
    fn invalidate_icache(&self, start: usize, end: usize) {
        self.calls.borrow_mut().push(PageCall::Invalidate(start, end));
    }
}
