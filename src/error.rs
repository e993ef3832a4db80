use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Cannot read memory maps: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid module path pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Access of {len} bytes at {addr:#x} is outside mapped memory")]
    OutOfBounds { addr: usize, len: usize },

    #[error("No ELF header at {0:#x}")]
    NotElf(usize),

    #[error("Malformed ELF image: {0}")]
    Malformed(String),

    #[error("ELF parse error: {0}")]
    Parse(#[from] scroll::Error),

    #[error("mprotect failed on page {addr:#x}: {source}")]
    Protection {
        addr: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Replacement {0:#x} does not fit into a 32-bit slot")]
    ReplacementTooWide(usize),
}

pub type Result<T> = std::result::Result<T, HookError>;
