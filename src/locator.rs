use bstr::BString;
use regex::bytes::RegexBuilder;

use crate::{
    error::{HookError, Result},
    maps::{parse_maps, MapRecord, MapSource},
    memory::ImageMemory,
    opts::HookOptions,
    platform::PageControl,
    plthook::{replace_plt_functions, PatchOutcome},
};

/// What happened to one symbol in one matching module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePatch {
    pub base: usize,
    pub path: BString,
    pub symbol: String,
    pub outcome: PatchOutcome,
}

/// A matching module that could not be hooked. `symbol` is `None` when
/// the module itself could not be read.
#[derive(Debug)]
pub struct ModuleFailure {
    pub base: usize,
    pub path: BString,
    pub symbol: Option<String>,
    pub error: HookError,
}

/// Everything a scan did. Slots listed in `patches` were rewritten even
/// when `failures` is not empty.
#[derive(Debug, Default)]
pub struct HookReport {
    pub patches: Vec<ModulePatch>,
    pub failures: Vec<ModuleFailure>,
}

impl HookReport {
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.failures.is_empty()
    }

    /// The outcome for `symbol`. A patch anywhere wins over failures
    /// elsewhere; without one the first relevant failure is returned.
    pub fn outcome(self, symbol: &str) -> Result<PatchOutcome> {
        let outcome = summarize(&self.patches, symbol);
        if outcome.is_patched() {
            return Ok(outcome);
        }
        match self
            .failures
            .into_iter()
            .find(|f| f.symbol.as_deref().map_or(true, |s| s == symbol))
        {
            Some(failure) => Err(failure.error),
            None => Ok(outcome),
        }
    }
}

/// Patch every module header mapping of `source` whose path matches
/// `pattern` (an unanchored regular expression over the raw path bytes).
pub fn locate_and_hook<S, M, P>(
    source: &S,
    memory: &mut M,
    pages: &P,
    pattern: &str,
    functions: &[(&str, usize)],
    opts: &HookOptions,
) -> Result<HookReport>
where
    S: MapSource + ?Sized,
    M: ImageMemory + ?Sized,
    P: PageControl + ?Sized,
{
    let contents = source.read_maps()?;
    let records: Vec<MapRecord> = parse_maps(&contents).collect();
    hook_records(&records, memory, pages, pattern, functions, opts)
}

pub(crate) fn hook_records<M, P>(
    records: &[MapRecord],
    memory: &mut M,
    pages: &P,
    pattern: &str,
    functions: &[(&str, usize)],
    opts: &HookOptions,
) -> Result<HookReport>
where
    M: ImageMemory + ?Sized,
    P: PageControl + ?Sized,
{
    // Paths are bytes, `.` has to match any of them like a C-locale ERE
    let regex = RegexBuilder::new(pattern).unicode(false).build()?;
    let mut report = HookReport::default();
    for record in records {
        if !record.is_module_header() {
            continue;
        }
        if !regex.is_match(&record.path) {
            continue;
        }
        log::info!("Found {} at {:#x}", record.path(), record.start);
        let outcomes = match replace_plt_functions(memory, pages, record.start, functions, opts) {
            Ok(outcomes) => outcomes,
            Err(HookError::NotElf(addr)) => {
                log::debug!("{} at {addr:#x} is not an ELF image", record.path());
                continue;
            }
            Err(error) => {
                log::error!("Skipping {} at {:#x}: {error}", record.path(), record.start);
                report.failures.push(ModuleFailure {
                    base: record.start,
                    path: record.path.clone(),
                    symbol: None,
                    error,
                });
                continue;
            }
        };
        for ((symbol, _), outcome) in functions.iter().zip(outcomes) {
            match outcome {
                Ok(outcome) => report.patches.push(ModulePatch {
                    base: record.start,
                    path: record.path.clone(),
                    symbol: symbol.to_string(),
                    outcome,
                }),
                Err(error) => report.failures.push(ModuleFailure {
                    base: record.start,
                    path: record.path.clone(),
                    symbol: Some(symbol.to_string()),
                    error,
                }),
            }
        }
    }
    if report.is_empty() {
        log::info!("No module matching {pattern} was found");
    }
    Ok(report)
}

/// Fold the per-module results for `symbol` into one outcome, preferring
/// a successful patch.
pub fn summarize(patches: &[ModulePatch], symbol: &str) -> PatchOutcome {
    let rank = |outcome: &PatchOutcome| match outcome {
        PatchOutcome::Patched { .. } => 3,
        PatchOutcome::SymbolNotFound => 2,
        PatchOutcome::NoDynamicSegment => 1,
        PatchOutcome::NoMatchingModule => 0,
    };
    patches
        .iter()
        .filter(|p| p.symbol == symbol)
        .map(|p| p.outcome)
        // first patched module wins ties
        .rev()
        .max_by_key(rank)
        .unwrap_or(PatchOutcome::NoMatchingModule)
}
