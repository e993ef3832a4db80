use std::{fs, path::PathBuf};

use atoi::{FromRadix10Checked, FromRadix16Checked};
use bstr::{BStr, BString, ByteSlice};

use crate::error::Result;

/// Something that can hand out a snapshot of a process mapping table.
pub trait MapSource {
    fn read_maps(&self) -> Result<Vec<u8>>;
}

/// The kernel's `/proc/self/maps` file.
#[derive(Debug, Clone)]
pub struct ProcMaps {
    path: PathBuf,
}

impl ProcMaps {
    pub fn current() -> Self {
        Self {
            path: PathBuf::from("/proc/self/maps"),
        }
    }
}

impl MapSource for ProcMaps {
    fn read_maps(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }
}

// Lets tests and offline tools feed a captured table
impl MapSource for str {
    fn read_maps(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

// Paths in a real table are not necessarily UTF-8
impl MapSource for [u8] {
    fn read_maps(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub private: bool,
}

impl Perms {
    fn parse(field: &[u8]) -> Self {
        let at = |idx: usize, flag: u8| field.get(idx) == Some(&flag);
        Self {
            read: at(0, b'r'),
            write: at(1, b'w'),
            exec: at(2, b'x'),
            private: at(3, b'p'),
        }
    }
}

/// One line of the mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRecord {
    pub start: usize,
    pub end: usize,
    pub perms: Perms,
    pub offset: usize,
    pub dev: (u32, u32),
    pub inode: u64,
    pub path: BString,
}

impl MapRecord {
    /// Parse `start-end perms offset major:minor inode   path`.
    ///
    /// Returns `None` when the address range, permissions or offset are
    /// missing; device and inode are best effort and default to zero.
    pub fn parse(line: &[u8]) -> Option<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let mut rest = line;
        let (start, end) = next_field(&mut rest).split_once_str(b"-")?;
        let start = hex(start)?;
        let end = hex(end)?;
        let perms = next_field(&mut rest);
        if perms.is_empty() {
            return None;
        }
        let perms = Perms::parse(perms);
        let offset = hex(next_field(&mut rest))?;
        let dev = next_field(&mut rest)
            .split_once_str(b":")
            .and_then(|(major, minor)| Some((hex(major)? as u32, hex(minor)? as u32)))
            .unwrap_or_default();
        let inode = decimal(next_field(&mut rest)).unwrap_or_default();
        let path = BString::from(rest.trim_ascii_start());
        Some(Self {
            start,
            end,
            perms,
            offset,
            dev,
            inode,
            path,
        })
    }

    pub fn path(&self) -> &BStr {
        self.path.as_bstr()
    }

    /// Whether this mapping is the first mapping (the ELF header) of a
    /// file backed module: readable, private, offset 0 and a real path.
    pub fn is_module_header(&self) -> bool {
        self.perms.read
            && self.perms.private
            && self.offset == 0
            && !self.path.is_empty()
            && !self.path.starts_with(b"[")
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }
}

/// Iterate over every parseable line of a mapping table.
pub fn parse_maps(contents: &[u8]) -> impl Iterator<Item = MapRecord> + '_ {
    contents
        .lines_with_terminator()
        .filter(|line| !line.trim_ascii().is_empty())
        .filter_map(|line| {
            let record = MapRecord::parse(line);
            if record.is_none() {
                log::debug!("Skipping unparseable maps line: {}", line.as_bstr());
            }
            record
        })
}

fn next_field<'a>(rest: &mut &'a [u8]) -> &'a [u8] {
    let trimmed = rest.trim_ascii_start();
    let end = trimmed.find_byteset(b" \t").unwrap_or(trimmed.len());
    let (field, tail) = trimmed.split_at(end);
    *rest = tail;
    field
}

fn hex(field: &[u8]) -> Option<usize> {
    match usize::from_radix_16_checked(field) {
        (Some(value), used) if used == field.len() && used > 0 => Some(value),
        _ => None,
    }
}

fn decimal(field: &[u8]) -> Option<u64> {
    match u64::from_radix_10_checked(field) {
        (Some(value), used) if used == field.len() && used > 0 => Some(value),
        _ => None,
    }
}
