//! Read-only views over an ELF image that is already mapped in memory.
//!
//! Every structure is read through [`ImageMemory`], so a truncated or
//! hostile image yields an error instead of a wild read.
use std::mem::size_of;

use scroll::{ctx::TryFromCtx, Endian, Pread, Pwrite};

use crate::{
    error::{HookError, Result},
    memory::ImageMemory,
};

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

pub const DT_NULL: i64 = 0;
pub const DT_PLTRELSZ: i64 = 2;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_RELA: i64 = 7;
pub const DT_REL: i64 = 17;
pub const DT_PLTREL: i64 = 20;
pub const DT_JMPREL: i64 = 23;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf32Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf64Dyn {
    pub d_tag: i64,
    pub d_val: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf32Dyn {
    pub d_tag: i32,
    pub d_val: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf64Rela {
    pub r_offset: u64,
    pub r_info: u64,
    pub r_addend: i64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf32Rela {
    pub r_offset: u32,
    pub r_info: u32,
    pub r_addend: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf64Rel {
    pub r_offset: u64,
    pub r_info: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf32Rel {
    pub r_offset: u32,
    pub r_info: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf64Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Pread, Pwrite)]
pub struct Elf32Sym {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Elf32,
    Elf64,
}

impl Class {
    /// Class of the running process.
    pub const fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Self::Elf64
        } else {
            Self::Elf32
        }
    }
    pub const fn word_size(self) -> usize {
        match self {
            Self::Elf32 => 4,
            Self::Elf64 => 8,
        }
    }
    const fn phdr_size(self) -> usize {
        match self {
            Self::Elf32 => size_of::<Elf32Phdr>(),
            Self::Elf64 => size_of::<Elf64Phdr>(),
        }
    }
    const fn dyn_size(self) -> usize {
        match self {
            Self::Elf32 => size_of::<Elf32Dyn>(),
            Self::Elf64 => size_of::<Elf64Dyn>(),
        }
    }
    const fn sym_size(self) -> usize {
        match self {
            Self::Elf32 => size_of::<Elf32Sym>(),
            Self::Elf64 => size_of::<Elf64Sym>(),
        }
    }
    const fn reloc_size(self, kind: RelocKind) -> usize {
        match (self, kind) {
            (Self::Elf32, RelocKind::Rel) => size_of::<Elf32Rel>(),
            (Self::Elf32, RelocKind::Rela) => size_of::<Elf32Rela>(),
            (Self::Elf64, RelocKind::Rel) => size_of::<Elf64Rel>(),
            (Self::Elf64, RelocKind::Rela) => size_of::<Elf64Rela>(),
        }
    }
    /// Symbol table index packed into `r_info`.
    pub const fn sym_index(self, info: u64) -> u64 {
        match self {
            Self::Elf32 => info >> 8,
            Self::Elf64 => info >> 32,
        }
    }
}

/// Encoding of the PLT relocation table, chosen by `DT_PLTREL`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Rel,
    #[default]
    Rela,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub memsz: u64,
}

/// The dynamic entries the PLT patcher cares about, already turned into
/// absolute addresses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DynamicInfo {
    pub jmprel: Option<usize>,
    pub pltrelsz: usize,
    pub pltrel: RelocKind,
    pub symtab: Option<usize>,
    pub strtab: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    pub offset: u64,
    pub info: u64,
}

/// A loaded module, addressed from the start of its first mapping.
pub struct ModuleImage<'m, M: ImageMemory + ?Sized> {
    memory: &'m M,
    base: usize,
    bias: usize,
    class: Class,
    endian: Endian,
    phdrs: Vec<ProgramHeader>,
}

impl<'m, M: ImageMemory + ?Sized> ModuleImage<'m, M> {
    pub fn parse(memory: &'m M, base: usize) -> Result<Self> {
        let ident = memory.read(base, EI_NIDENT)?;
        if ident[..4] != ELF_MAGIC {
            return Err(HookError::NotElf(base));
        }
        let class = match ident[EI_CLASS] {
            ELFCLASS32 => Class::Elf32,
            ELFCLASS64 => Class::Elf64,
            other => return Err(HookError::Malformed(format!("unknown ELF class {other}"))),
        };
        let endian = match ident[EI_DATA] {
            ELFDATA2LSB => Endian::Little,
            ELFDATA2MSB => Endian::Big,
            other => return Err(HookError::Malformed(format!("unknown ELF data {other}"))),
        };
        let mut image = Self {
            memory,
            base,
            bias: base,
            class,
            endian,
            phdrs: Vec::new(),
        };
        let (phoff, phnum) = match class {
            Class::Elf64 => {
                let header: Elf64Ehdr = image.read(base)?;
                (header.e_phoff, header.e_phnum)
            }
            Class::Elf32 => {
                let header: Elf32Ehdr = image.read(base)?;
                (header.e_phoff.into(), header.e_phnum)
            }
        };
        let table = base.wrapping_add(to_usize(phoff)?);
        let phdrs = (0..usize::from(phnum))
            .map(|idx| image.program_header(table + idx * class.phdr_size()))
            .collect::<Result<Vec<_>>>()?;
        // ET_EXEC images carry absolute vaddrs, shared objects start at 0
        if let Some(load) = phdrs.iter().find(|p| p.p_type == PT_LOAD) {
            image.bias = base.wrapping_sub(to_usize(load.vaddr.wrapping_sub(load.offset))?);
        }
        image.phdrs = phdrs;
        Ok(image)
    }

    pub fn base(&self) -> usize {
        self.base
    }
    pub fn bias(&self) -> usize {
        self.bias
    }
    pub fn class(&self) -> Class {
        self.class
    }
    pub fn endian(&self) -> Endian {
        self.endian
    }
    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.phdrs
    }

    fn read<T>(&self, addr: usize) -> Result<T>
    where
        T: for<'a> TryFromCtx<'a, Endian, Error = scroll::Error>,
    {
        let bytes = self.memory.read(addr, size_of::<T>())?;
        Ok(bytes.pread_with(0, self.endian)?)
    }

    fn program_header(&self, addr: usize) -> Result<ProgramHeader> {
        Ok(match self.class {
            Class::Elf64 => {
                let phdr: Elf64Phdr = self.read(addr)?;
                ProgramHeader {
                    p_type: phdr.p_type,
                    offset: phdr.p_offset,
                    vaddr: phdr.p_vaddr,
                    memsz: phdr.p_memsz,
                }
            }
            Class::Elf32 => {
                let phdr: Elf32Phdr = self.read(addr)?;
                ProgramHeader {
                    p_type: phdr.p_type,
                    offset: phdr.p_offset.into(),
                    vaddr: phdr.p_vaddr.into(),
                    memsz: phdr.p_memsz.into(),
                }
            }
        })
    }

    /// Translate a link-time virtual address into a process address.
    pub fn vaddr(&self, vaddr: u64) -> Result<usize> {
        Ok(self.bias.wrapping_add(to_usize(vaddr)?))
    }

    /// Like [`Self::vaddr`], but for `d_ptr` values, which glibc rewrites
    /// in place to absolute addresses while loading.
    fn dyn_ptr(&self, value: u64) -> Result<usize> {
        let value = to_usize(value)?;
        if self.bias != 0 && value >= self.bias {
            Ok(value)
        } else {
            Ok(self.bias.wrapping_add(value))
        }
    }

    fn dyn_entry(&self, addr: usize) -> Result<(i64, u64)> {
        Ok(match self.class {
            Class::Elf64 => {
                let entry: Elf64Dyn = self.read(addr)?;
                (entry.d_tag, entry.d_val)
            }
            Class::Elf32 => {
                let entry: Elf32Dyn = self.read(addr)?;
                (entry.d_tag.into(), entry.d_val.into())
            }
        })
    }

    /// Walk `PT_DYNAMIC`. Returns `None` when the image has no dynamic
    /// segment at all.
    pub fn dynamic(&self) -> Result<Option<DynamicInfo>> {
        let Some(segment) = self.phdrs.iter().find(|p| p.p_type == PT_DYNAMIC) else {
            return Ok(None);
        };
        let table = self.vaddr(segment.vaddr)?;
        let count = to_usize(segment.memsz)? / self.class.dyn_size();
        let mut info = DynamicInfo::default();
        for idx in 0..count {
            let (tag, value) = self.dyn_entry(table + idx * self.class.dyn_size())?;
            match tag {
                DT_NULL => break,
                DT_JMPREL => info.jmprel = Some(self.dyn_ptr(value)?),
                DT_PLTRELSZ => info.pltrelsz = to_usize(value)?,
                DT_PLTREL => {
                    info.pltrel = match value as i64 {
                        DT_REL => RelocKind::Rel,
                        _ => RelocKind::Rela,
                    }
                }
                DT_SYMTAB => info.symtab = Some(self.dyn_ptr(value)?),
                DT_STRTAB => info.strtab = Some(self.dyn_ptr(value)?),
                _ => {}
            }
        }
        Ok(Some(info))
    }

    /// Number of entries in the PLT relocation table.
    pub fn plt_reloc_count(&self, info: &DynamicInfo) -> usize {
        match info.jmprel {
            Some(_) => info.pltrelsz / self.class.reloc_size(info.pltrel),
            None => 0,
        }
    }

    pub fn plt_reloc(&self, info: &DynamicInfo, idx: usize) -> Result<Reloc> {
        let table = info
            .jmprel
            .ok_or_else(|| HookError::Malformed("DT_JMPREL is missing".to_string()))?;
        let addr = table + idx * self.class.reloc_size(info.pltrel);
        // Rel and Rela share the leading offset/info pair
        Ok(match self.class {
            Class::Elf64 => {
                let rel: Elf64Rel = self.read(addr)?;
                Reloc {
                    offset: rel.r_offset,
                    info: rel.r_info,
                }
            }
            Class::Elf32 => {
                let rel: Elf32Rel = self.read(addr)?;
                Reloc {
                    offset: rel.r_offset.into(),
                    info: rel.r_info.into(),
                }
            }
        })
    }

    /// Name of the symbol a relocation is bound to, without the NUL.
    pub fn symbol_name(&self, info: &DynamicInfo, reloc: &Reloc) -> Result<&'m [u8]> {
        let (Some(symtab), Some(strtab)) = (info.symtab, info.strtab) else {
            return Err(HookError::Malformed(
                "DT_SYMTAB or DT_STRTAB is missing".to_string(),
            ));
        };
        let idx = to_usize(self.class.sym_index(reloc.info))?;
        let addr = symtab.wrapping_add(idx.wrapping_mul(self.class.sym_size()));
        // st_name is the first field of both layouts
        let name: u32 = self.read(addr)?;
        self.memory.read_cstr(strtab.wrapping_add(name as usize))
    }

    /// Current content of a pointer sized slot of this image.
    pub fn read_word(&self, addr: usize) -> Result<usize> {
        match self.class {
            Class::Elf64 => to_usize(self.read::<u64>(addr)?),
            Class::Elf32 => Ok(self.read::<u32>(addr)? as usize),
        }
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| HookError::Malformed(format!("{value:#x} does not fit an address")))
}
