//! Embedded, single-file, crash-safe ordered key/value store.
//!
//! The on-disk format is an append-only log structured as a skiplist:
//! records carry their forward pointers, every transaction ends with a
//! commit record, and the header's `current_size` fences off everything
//! durable from whatever a crashed writer may have left behind. Readers and
//! writers coordinate across processes with advisory file locks; a
//! process-global registry shares one engine per path within a process.

pub mod backend;
mod checkpoint;
mod db;
pub mod error;
mod header;
mod io;
mod locator;
mod mapped;
mod record;
mod recovery;
mod registry;
mod skiplist;

use std::path::Path;

pub use db::{Database, OpenFlags, Transaction};
pub use error::{Error, Result};
pub use skiplist::Comparator;

/// Library-wide configuration, consumed once at [`init`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Sweep `init`'s directory for databases of this family and run crash
    /// recovery on each before anything opens them.
    pub recover: bool,
}

/// Process-wide initialization. Optional: engines work without it; it only
/// drives the recover-on-startup sweep.
pub fn init(dir: Option<&Path>, config: Config) -> Result<()> {
    let (Some(dir), true) = (dir, config.recover) else {
        return Ok(());
    };
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        match backend::detect(&path) {
            // Open runs recovery when the file is dirty; closing is enough.
            Ok(Some(b)) => match b.open(&path, OpenFlags::empty()) {
                Ok(db) => db.close(),
                Err(e) => tracing::warn!(?path, error = %e, "startup recovery failed"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(?path, error = %e, "could not probe file"),
        }
    }
    Ok(())
}

/// Process-wide teardown: drop the open-database registry.
pub fn done() {
    registry::clear();
}
