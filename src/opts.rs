use std::sync::{LazyLock, Mutex};

use crate::{plthook::SymbolMatch, LockResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookOptions {
    pub symbol_match: SymbolMatch,
    /// Put the slot's page back to read-only once it is patched.
    pub restore_protection: bool,
}
impl Default for HookOptions {
    fn default() -> Self {
        Self {
            symbol_match: SymbolMatch::Exact,
            restore_protection: false,
        }
    }
}
pub static OPTS: LazyLock<Mutex<HookOptions>> =
    LazyLock::new(|| Mutex::new(HookOptions::default()));

pub fn current() -> HookOptions {
    *OPTS.lock().ignore_poison()
}

#[no_mangle]
extern "C" fn relahook_set_prefix_match(on: bool) {
    let mut opts = OPTS.lock().ignore_poison();
    opts.symbol_match = if on {
        SymbolMatch::Prefix
    } else {
        SymbolMatch::Exact
    };
}
#[no_mangle]
extern "C" fn relahook_set_restore_protection(on: bool) {
    let mut opts = OPTS.lock().ignore_poison();
    opts.restore_protection = on;
}
