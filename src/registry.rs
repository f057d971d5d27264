use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::db::{OpenFlags, SharedDb};
use crate::error::Result;

/// Process-global table of open databases. Two opens of the same path must
/// share one engine: one memory map, one lock state, one in-flight
/// transaction slot.
static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Entry>>> = Lazy::new(Default::default);

struct Entry {
    shared: Arc<SharedDb>,
    refs: usize,
}

fn registry_key(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

pub(crate) fn acquire(path: &Path, flags: OpenFlags) -> Result<Arc<SharedDb>> {
    let key = registry_key(path)?;
    let mut table = REGISTRY.lock();

    // A path already open shares its engine unconditionally; whether a
    // transaction is in flight only matters when the new handle tries to
    // begin one (or read without one).
    if let Some(entry) = table.get_mut(&key) {
        entry.refs += 1;
        return Ok(entry.shared.clone());
    }

    let shared = SharedDb::open(&key, flags)?;
    table.insert(
        key,
        Entry {
            shared: shared.clone(),
            refs: 1,
        },
    );
    Ok(shared)
}

pub(crate) fn release(path: &Path) {
    let Ok(key) = registry_key(path) else { return };
    let mut table = REGISTRY.lock();
    let Some(entry) = table.get_mut(&key) else {
        // Already swept by `done`.
        return;
    };
    entry.refs -= 1;
    if entry.refs == 0 {
        let entry = table.remove(&key);
        if let Some(entry) = entry {
            entry.shared.dispose();
        }
    }
}

/// Tear the table down wholesale (process shutdown). Handles still alive
/// keep working through their own references; their eventual release is a
/// no-op.
pub(crate) fn clear() {
    let mut table = REGISTRY.lock();
    for (path, entry) in table.drain() {
        if entry.refs > 0 {
            tracing::warn!(?path, refs = entry.refs, "shutdown with database still open");
        }
        entry.shared.dispose();
    }
}
