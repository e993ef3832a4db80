//! Redirect PLT imports of a loaded module to functions of our own.
//!
//! The module is located through `/proc/self/maps`, its dynamic section is
//! walked in memory, and the GOT slot bound to the requested symbol is
//! overwritten with the replacement pointer.
pub mod elf;
pub mod error;
pub mod locator;
pub mod maps;
pub mod memory;
pub mod opts;
pub mod platform;
pub mod plthook;
#[cfg(test)]
mod fixture;

use std::{
    ffi::CStr,
    sync::{LockResult, PoisonError},
};

use libc::{c_char, c_void};

pub use crate::{
    error::{HookError, Result},
    locator::{locate_and_hook, summarize, HookReport, ModuleFailure, ModulePatch},
    maps::{MapRecord, MapSource, ProcMaps},
    memory::{ImageBuffer, ImageMemory, SelfMemory},
    opts::HookOptions,
    platform::{LibcPages, PageControl, Protection},
    plthook::{patch, replace_plt_functions, PatchOutcome, SymbolMatch},
};

// Just setup the logger so we see those logcats
#[cfg(target_os = "android")]
pub fn setup_logging() {
    android_logger::init_once(
        android_logger::Config::default().with_max_level(log::LevelFilter::Trace),
    );
}
#[cfg(not(target_os = "android"))]
pub fn setup_logging() {
    // The host process may already own the logger
    let _ = env_logger::try_init();
}

#[ctor::ctor]
fn safe_setup() {
    setup_logging();
    #[cfg(target_os = "android")]
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("Thread crashed: {}", panic_info);
    }));
}

pub trait LockResultExt {
    type Guard;
    fn ignore_poison(self) -> Self::Guard;
}
impl<Guard> LockResultExt for LockResult<Guard> {
    type Guard = Guard;
    fn ignore_poison(self) -> Guard {
        self.unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hook several imports of every module in this process whose path
/// matches `pattern`. A module that fails is recorded in the report and
/// the scan goes on.
pub fn hook_self_many(
    pattern: &str,
    functions: &[(&str, *const ())],
    opts: &HookOptions,
) -> Result<HookReport> {
    let contents = ProcMaps::current().read_maps()?;
    let records: Vec<MapRecord> = maps::parse_maps(&contents).collect();
    // SAFETY: the snapshot was just taken from this very process
    let mut memory = unsafe { SelfMemory::from_records(&records) };
    let functions: Vec<(&str, usize)> = functions
        .iter()
        .map(|(name, replacement)| (*name, *replacement as usize))
        .collect();
    locator::hook_records(&records, &mut memory, &LibcPages, pattern, &functions, opts)
}

/// Hook `symbol` in every module of this process whose path matches
/// `pattern`, using the global options. Reports the patch when any module
/// was patched, even if another one failed.
pub fn hook_self(pattern: &str, symbol: &str, replacement: *const ()) -> Result<PatchOutcome> {
    hook_self_many(pattern, &[(symbol, replacement)], &opts::current())?.outcome(symbol)
}

unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> Option<&'a str> {
    if ptr.is_null() {
        log::error!("relahook: {what} is null");
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(e) => {
            log::error!("relahook: {what} is not utf8: {e}");
            None
        }
    }
}

/// C entry point. Failures are only logged. When `original` is not null
/// and the hook was applied, it receives the previous slot value.
///
/// # Safety
/// `pattern` and `symbol` must be null or valid C strings, and `original`
/// null or valid for a pointer write.
#[no_mangle]
pub unsafe extern "C" fn relahook_hook(
    pattern: *const c_char,
    symbol: *const c_char,
    replacement: *const c_void,
    original: *mut *const c_void,
) {
    let (Some(pattern), Some(symbol)) = (c_str(pattern, "pattern"), c_str(symbol, "symbol"))
    else {
        return;
    };
    match hook_self(pattern, symbol, replacement.cast()) {
        Ok(PatchOutcome::Patched { slot, previous }) => {
            log::info!("Hooked {symbol} in {pattern} (slot {slot:#x})");
            if !original.is_null() {
                *original = previous as *const c_void;
            }
        }
        Ok(outcome) => log::info!("{symbol} in {pattern} not hooked: {outcome:?}"),
        Err(e) => log::error!("Hooking {symbol} in {pattern} failed: {e}"),
    }
}
