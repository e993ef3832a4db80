use std::{ops::Range, ptr, slice};

use bstr::ByteSlice;

use crate::{
    error::{HookError, Result},
    maps::MapRecord,
};

/// Byte level access to the address space a module lives in.
///
/// Addresses are absolute; implementations refuse anything outside the
/// memory they know to be mapped.
pub trait ImageMemory {
    fn read(&self, addr: usize, len: usize) -> Result<&[u8]>;

    /// NUL terminated string at `addr`, without the terminator.
    fn read_cstr(&self, addr: usize) -> Result<&[u8]>;

    fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<()>;
}

fn terminated(bytes: &[u8], addr: usize) -> Result<&[u8]> {
    match bytes.find_byte(0) {
        Some(nul) => Ok(&bytes[..nul]),
        None => Err(HookError::Malformed(format!(
            "string at {addr:#x} is not terminated"
        ))),
    }
}

/// An image held in an owned buffer, pretending to be loaded at `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    base: usize,
    bytes: Vec<u8>,
}

impl ImageBuffer {
    pub fn new(base: usize, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }
    pub fn base(&self) -> usize {
        self.base
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn range(&self, addr: usize, len: usize) -> Result<Range<usize>> {
        let out_of_bounds = || HookError::OutOfBounds { addr, len };
        let start = addr.checked_sub(self.base).ok_or_else(out_of_bounds)?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.bytes.len() {
            return Err(out_of_bounds());
        }
        Ok(start..end)
    }
}

impl ImageMemory for ImageBuffer {
    fn read(&self, addr: usize, len: usize) -> Result<&[u8]> {
        let range = self.range(addr, len)?;
        Ok(&self.bytes[range])
    }
    fn read_cstr(&self, addr: usize) -> Result<&[u8]> {
        let start = self.range(addr, 0)?.start;
        terminated(&self.bytes[start..], addr)
    }
    fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<()> {
        let range = self.range(addr, bytes.len())?;
        self.bytes[range].copy_from_slice(bytes);
        Ok(())
    }
}

/// The memory of the current process, limited to what a maps snapshot
/// reports as mapped.
#[derive(Debug, Clone, Default)]
pub struct SelfMemory {
    readable: Vec<Range<usize>>,
    mapped: Vec<Range<usize>>,
}

impl SelfMemory {
    /// # Safety
    /// `records` must describe the current process, and the described
    /// mappings must stay in place while this value is used.
    pub unsafe fn from_records(records: &[MapRecord]) -> Self {
        Self {
            readable: merge(records.iter().filter(|r| r.perms.read)),
            mapped: merge(records.iter()),
        }
    }

    fn check(regions: &[Range<usize>], addr: usize, len: usize) -> Result<usize> {
        let end = addr
            .checked_add(len)
            .ok_or(HookError::OutOfBounds { addr, len })?;
        regions
            .iter()
            .find(|r| r.start <= addr && end <= r.end)
            .map(|r| r.end - addr)
            .ok_or(HookError::OutOfBounds { addr, len })
    }
}

// Adjacent mappings become one region so tables may straddle them
fn merge<'a>(records: impl Iterator<Item = &'a MapRecord>) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = records.map(|r| r.start..r.end).collect();
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.end >= range.start => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

impl ImageMemory for SelfMemory {
    fn read(&self, addr: usize, len: usize) -> Result<&[u8]> {
        Self::check(&self.readable, addr, len)?;
        // SAFETY: the range lies inside a readable mapping (see from_records)
        Ok(unsafe { slice::from_raw_parts(addr as *const u8, len) })
    }
    fn read_cstr(&self, addr: usize) -> Result<&[u8]> {
        let available = Self::check(&self.readable, addr, 0)?;
        // SAFETY: as above, up to the end of the containing region
        let bytes = unsafe { slice::from_raw_parts(addr as *const u8, available) };
        terminated(bytes, addr)
    }
    fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<()> {
        Self::check(&self.mapped, addr, bytes.len())?;
        // SAFETY: mapped, and the caller made the page writable beforehand
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
        Ok(())
    }
}
