use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::header::Header;
use crate::mapped::{LockLevel, MappedFile};
use crate::skiplist::Skiplist;

/// Garbage below this many bytes is never worth a rewrite.
const MINREWRITE: u64 = 16 * 1024;

/// Sidecar used by compaction and rebuild; atomically renamed over the
/// database on success.
pub(crate) fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".NEW");
    PathBuf::from(name)
}

/// Post-commit trigger: compact once the file has outgrown twice its last
/// compacted size and the difference is worth the copy.
pub(crate) fn wanted(header: &Header) -> bool {
    header.current_size > header.repack_size.saturating_mul(2)
        && header.current_size - header.repack_size > MINREWRITE
}

/// Copy the live contents into a fresh sidecar, fsync it, and atomically
/// take its place. The caller holds the write lock and the engine is clean
/// (freshly committed or recovered). The original file is not touched until
/// the rename; any failure before that point just discards the sidecar.
pub(crate) fn run(list: &mut Skiplist) -> Result<()> {
    list.check_consistent()?;

    let path = list.mf.path().to_owned();
    let sidecar = sidecar_path(&path);
    let _ = std::fs::remove_file(&sidecar);

    match build(list, &sidecar) {
        Ok(mut new) => {
            new.mf.rename_over(&path)?;
            tracing::debug!(
                ?path,
                generation = new.header.generation,
                size = new.header.current_size,
                "compacted database"
            );
            list.adopt(new);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&sidecar);
            tracing::warn!(?path, error = %e, "compaction abandoned");
            Err(e)
        }
    }
}

fn build(src: &mut Skiplist, sidecar: &Path) -> Result<Skiplist> {
    let mut mf = MappedFile::open(sidecar, true)?;
    let header = Skiplist::init_file(&mut mf)?;
    let mut new = Skiplist::new(mf, header, src.compar);
    let txn_start = new.header.current_size;

    src.relocate(b"")?;
    while let Some(rec) = src.advance()? {
        let key = rec.key(&src.mf)?.to_vec();
        let value = rec.value(&src.mf)?.to_vec();
        new.relocate(&key)?;
        new.store_here(&value)?;
    }

    // The copy is one transaction: a terminal commit record covering all of
    // it keeps the compacted file replayable should it ever need a rebuild.
    new.append_commit(txn_start)?;

    // The new baseline is the compacted size itself; the bumped generation
    // invalidates every locator cached against the old file.
    new.header.generation = src.header.generation + 1;
    new.header.current_size = new.end;
    new.header.repack_size = new.end;
    new.check_consistent()?;
    new.mf.commit()?;
    new.header.commit(&mut new.mf)?;

    // The replacement must already hold the write lock when it goes live:
    // waiters on the old inode wake up, notice the rename, reopen, and then
    // queue on this lock.
    new.mf.lock(LockLevel::Write)?;
    Ok(new)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trigger_needs_both_growth_and_volume() {
        let mut h = Header::new(344);
        assert!(!wanted(&h));

        // Doubled but tiny: not worth it.
        h.current_size = 1000;
        assert!(!wanted(&h));

        // Large but not doubled.
        h.repack_size = 100_000;
        h.current_size = 150_000;
        assert!(!wanted(&h));

        h.current_size = 220_000;
        assert!(wanted(&h));
    }

    #[test]
    fn sidecar_naming() {
        assert_eq!(
            sidecar_path(Path::new("/t/db")),
            PathBuf::from("/t/db.NEW")
        );
    }
}
