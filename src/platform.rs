use libc::{c_void, PROT_READ, PROT_WRITE};

use crate::error::{HookError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

/// Page protection and cache maintenance the patcher needs from the OS.
pub trait PageControl {
    fn page_size(&self) -> usize;
    fn protect(&self, start: usize, len: usize, protection: Protection) -> Result<()>;
    fn invalidate_icache(&self, start: usize, end: usize);
}

pub fn page_floor(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

/// The real thing, through `mprotect` and the compiler's cache flush.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcPages;

impl PageControl for LibcPages {
    fn page_size(&self) -> usize {
        page_size::get()
    }

    fn protect(&self, start: usize, len: usize, protection: Protection) -> Result<()> {
        let prot = match protection {
            Protection::ReadOnly => PROT_READ,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
        };
        let res = unsafe { libc::mprotect(start as *mut c_void, len, prot) };
        if res != 0 {
            return Err(HookError::Protection {
                addr: start,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn invalidate_icache(&self, start: usize, end: usize) {
        let flushed = unsafe { clear_cache::clear_cache(start as *const u8, end as *const u8) };
        if !flushed {
            log::warn!("Instruction cache flush failed for {start:#x}-{end:#x}");
        }
    }
}
