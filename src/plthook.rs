use scroll::{Endian, Pwrite};

use crate::{
    elf::{Class, DynamicInfo, ModuleImage},
    error::{HookError, Result},
    memory::ImageMemory,
    opts::HookOptions,
    platform::{page_floor, PageControl, Protection},
};

/// How a requested symbol is compared with the names in the image.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SymbolMatch {
    #[default]
    Exact,
    /// The resolved name only has to start with the requested one, so
    /// `ba` also hits `bar`. Kept for callers relying on that looseness.
    Prefix,
}

impl SymbolMatch {
    pub fn matches(self, wanted: &[u8], name: &[u8]) -> bool {
        match self {
            Self::Exact => name == wanted,
            Self::Prefix => name.starts_with(wanted),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// `slot` now holds the replacement; `previous` is what it held before.
    Patched { slot: usize, previous: usize },
    NoMatchingModule,
    NoDynamicSegment,
    SymbolNotFound,
}

impl PatchOutcome {
    pub fn is_patched(&self) -> bool {
        matches!(self, Self::Patched { .. })
    }
}

/// A relocation slot that was found but not written yet.
struct Slot {
    addr: usize,
    previous: usize,
    class: Class,
    endian: Endian,
}

fn find_slot<M: ImageMemory + ?Sized>(
    image: &ModuleImage<'_, M>,
    info: &DynamicInfo,
    symbol: &str,
    symbol_match: SymbolMatch,
) -> Result<Option<Slot>> {
    let count = image.plt_reloc_count(info);
    log::debug!(
        "{count} PLT relocations in module at {:#x}, looking for {symbol}",
        image.base()
    );
    for idx in 0..count {
        let reloc = image.plt_reloc(info, idx)?;
        let name = image.symbol_name(info, &reloc)?;
        if !symbol_match.matches(symbol.as_bytes(), name) {
            continue;
        }
        let addr = image.vaddr(reloc.offset)?;
        log::info!(
            "Matched {} (relocation {idx}) for {symbol}, slot at {addr:#x}",
            bstr::BStr::new(name)
        );
        return Ok(Some(Slot {
            addr,
            previous: image.read_word(addr)?,
            class: image.class(),
            endian: image.endian(),
        }));
    }
    Ok(None)
}

/// Rebind `symbol` in the PLT of the module loaded at `base`.
///
/// Only the first matching relocation is rewritten. Modules without a
/// dynamic segment or without the symbol are left untouched.
pub fn patch<M, P>(
    memory: &mut M,
    pages: &P,
    base: usize,
    symbol: &str,
    replacement: usize,
    opts: &HookOptions,
) -> Result<PatchOutcome>
where
    M: ImageMemory + ?Sized,
    P: PageControl + ?Sized,
{
    let mut outcomes = replace_plt_functions(memory, pages, base, &[(symbol, replacement)], opts)?;
    outcomes.pop().unwrap_or(Ok(PatchOutcome::SymbolNotFound))
}

/// Rebind several symbols of one module, parsing its tables once.
///
/// The outer error means the module itself could not be read and nothing
/// was written. Otherwise every symbol gets its own result, in the order
/// of `functions`, and a failure on one symbol does not stop the others.
pub fn replace_plt_functions<M, P>(
    memory: &mut M,
    pages: &P,
    base: usize,
    functions: &[(&str, usize)],
    opts: &HookOptions,
) -> Result<Vec<Result<PatchOutcome>>>
where
    M: ImageMemory + ?Sized,
    P: PageControl + ?Sized,
{
    let slots = {
        let image = ModuleImage::parse(&*memory, base)?;
        let Some(info) = image.dynamic()? else {
            log::info!("Module at {base:#x} has no dynamic segment");
            return Ok(functions
                .iter()
                .map(|_| Ok(PatchOutcome::NoDynamicSegment))
                .collect());
        };
        functions
            .iter()
            .map(|(symbol, _)| find_slot(&image, &info, symbol, opts.symbol_match))
            .collect::<Result<Vec<_>>>()?
    };

    // Every width is checked before the first slot changes
    let words: Vec<Option<Result<Word>>> = functions
        .iter()
        .zip(&slots)
        .map(|((_, replacement), slot)| slot.as_ref().map(|slot| slot.encode(*replacement)))
        .collect();

    let mut outcomes = Vec::with_capacity(functions.len());
    for (((symbol, replacement), slot), word) in functions.iter().zip(slots).zip(words) {
        let (Some(slot), Some(word)) = (slot, word) else {
            log::info!("Missing symbol: {symbol}");
            outcomes.push(Ok(PatchOutcome::SymbolNotFound));
            continue;
        };
        let written = word.and_then(|word| replace_plt_function(memory, pages, &slot, &word, opts));
        match written {
            Ok(()) => {
                log::info!(
                    "Hooked {symbol} at {:#x}: {:#x} -> {replacement:#x}",
                    slot.addr,
                    slot.previous
                );
                outcomes.push(Ok(PatchOutcome::Patched {
                    slot: slot.addr,
                    previous: slot.previous,
                }));
            }
            Err(e) => {
                log::error!("Could not hook {symbol} at {:#x}: {e}", slot.addr);
                outcomes.push(Err(e));
            }
        }
    }
    Ok(outcomes)
}

/// A slot value in the image's own width and byte order.
struct Word {
    bytes: [u8; 8],
    width: usize,
}

impl Slot {
    fn encode(&self, replacement: usize) -> Result<Word> {
        let mut bytes = [0u8; 8];
        let width = match self.class {
            Class::Elf64 => bytes.pwrite_with(replacement as u64, 0, self.endian)?,
            Class::Elf32 => {
                let narrow = u32::try_from(replacement)
                    .map_err(|_| HookError::ReplacementTooWide(replacement))?;
                bytes.pwrite_with(narrow, 0, self.endian)?
            }
        };
        Ok(Word { bytes, width })
    }
}

fn replace_plt_function<M, P>(
    memory: &mut M,
    pages: &P,
    slot: &Slot,
    word: &Word,
    opts: &HookOptions,
) -> Result<()>
where
    M: ImageMemory + ?Sized,
    P: PageControl + ?Sized,
{
    let page_size = pages.page_size();
    let page = page_floor(slot.addr, page_size);

    // The linker leaves the GOT read-only after relocation
    pages.protect(page, page_size, Protection::ReadWrite)?;
    memory.write(slot.addr, &word.bytes[..word.width])?;
    pages.invalidate_icache(page, page + page_size);
    if opts.restore_protection {
        pages.protect(page, page_size, Protection::ReadOnly)?;
    }
    Ok(())
}
