use std::io::Read;
use std::path::Path;

use crate::db::{Database, OpenFlags};
use crate::error::Result;
use crate::header;

/// An engine family the surrounding system can select by stable name, or by
/// sniffing the magic at the front of an existing file.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Does this 20-byte (or longer) prefix belong to this family?
    fn detect(&self, magic: &[u8]) -> bool;
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Database>;
}

pub struct SkiplogBackend;

impl Backend for SkiplogBackend {
    fn name(&self) -> &'static str {
        "skiplog"
    }

    fn detect(&self, magic: &[u8]) -> bool {
        header::detect(magic)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<Database> {
        Database::open(path, flags)
    }
}

pub static BACKENDS: &[&dyn Backend] = &[&SkiplogBackend];

/// Look a backend up by its stable name.
pub fn named(name: &str) -> Option<&'static dyn Backend> {
    BACKENDS.iter().copied().find(|b| b.name() == name)
}

/// Sniff an existing file and return the backend whose magic it carries.
pub fn detect(path: &Path) -> Result<Option<&'static dyn Backend>> {
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 20];
    let n = file.read(&mut magic)?;
    Ok(BACKENDS.iter().copied().find(|b| b.detect(&magic[..n])))
}
