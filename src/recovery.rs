use std::cmp::Ordering;

use crate::checkpoint::sidecar_path;
use crate::error::{Error, Result};
use crate::header::HeaderFlags;
use crate::locator::LEVELS;
use crate::mapped::MappedFile;
use crate::record::{Record, RecordType, DUMMY_OFFSET};
use crate::skiplist::Skiplist;

/// Bring a dirty (or size-skewed) file back to a consistent committed
/// state. In-place pointer repair is tried first; if the committed region
/// itself turns out damaged, the file is rebuilt from its commit records.
/// Idempotent: running it on an already-clean file changes nothing.
pub(crate) fn recover(list: &mut Skiplist) -> Result<()> {
    tracing::warn!(path = ?list.mf.path(), "recovering database");
    let repaired = repair(list).and_then(|()| list.check_consistent());
    match repaired {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!(path = ?list.mf.path(), error = %e, "in-place repair failed, rebuilding from commit records");
            rebuild(list)
        }
    }
}

/// Stage one: walk the committed level-0 chain (the slot pair makes it
/// survive any crash or abort) and recompute everything else from it: zero
/// level-0 scratch slots pointing into the discarded tail, re-aim every
/// upper-level pointer at the next record of that height, recount, then cut
/// the file back to the committed size.
pub(crate) fn repair(list: &mut Skiplist) -> Result<()> {
    let cs = list.header.current_size;
    let dropped = list.mf.len().saturating_sub(cs);
    if dropped > 0 {
        tracing::warn!(path = ?list.mf.path(), dropped, "discarding uncommitted tail");
    }
    if list.mf.len() < cs {
        return Err(Error::corrupt(
            list.mf.path(),
            cs,
            "file shorter than committed size",
        ));
    }

    if !list.header.dirty() {
        list.header.flags.insert(HeaderFlags::DIRTY);
        list.header.commit(&mut list.mf)?;
    }

    // Last record seen at each upper level, and the forward pointer it
    // carries there. The next record of that height decides whether that
    // pointer survived intact or was left wrong by a dangling append, an
    // aborted delete, or an aborted replace.
    let mut prev_at: [(u64, u64); LEVELS] = [(0, 0); LEVELS];
    let mut live = 0u64;
    let mut prev_key: Option<(u64, u64)> = None;
    let mut off = DUMMY_OFFSET;

    while off != 0 {
        let mut rec = Record::decode(&list.mf, off)?;
        if off == DUMMY_OFFSET {
            if rec.rtype != RecordType::Dummy {
                return Err(Error::corrupt(
                    list.mf.path(),
                    off,
                    "list head is not a dummy record",
                ));
            }
        } else {
            rec.check_tail(&list.mf)?;
            match rec.rtype {
                RecordType::Key => live += 1,
                RecordType::Delete => {}
                _ => {
                    return Err(Error::corrupt(
                        list.mf.path(),
                        off,
                        "chain contains a non-key record",
                    ))
                }
            }

            // Key order doubles as the cycle guard.
            if let Some((koff, klen)) = prev_key {
                let prev = list
                    .mf
                    .slice(koff, klen)
                    .ok_or_else(|| Error::corrupt(list.mf.path(), off, "key past end of file"))?;
                let cur = rec.key(&list.mf)?;
                if list.compar.cmp(cur, prev) != Ordering::Greater {
                    return Err(Error::corrupt(list.mf.path(), off, "chain keys out of order"));
                }
            }
            prev_key = Some((rec.key_offset, rec.key_len));
        }

        let mut changed = false;
        for slot in 0..2 {
            if rec.ptrs[slot] >= cs && rec.ptrs[slot] != 0 {
                rec.ptrs[slot] = 0;
                changed = true;
            }
        }
        for level in 1..=rec.level as usize {
            let (pred_off, pred_ptr) = prev_at[level];
            if pred_off != 0 && pred_ptr != off {
                relink(&mut list.mf, pred_off, level, off)?;
            }
            prev_at[level] = (off, rec.ptrs[level + 1]);
        }
        if changed {
            list.rewrite_record(&rec)?;
        }

        off = rec.next_at(0, cs);
    }

    // The chain ends here at every level; whatever the last participants
    // still point at is gone.
    for level in 1..LEVELS {
        let (pred_off, pred_ptr) = prev_at[level];
        if pred_off != 0 && pred_ptr != 0 {
            relink(&mut list.mf, pred_off, level, 0)?;
        }
    }

    list.mf.truncate(cs)?;
    list.mf.commit()?;
    list.end = cs;
    list.header.num_records = live;
    list.header.flags.remove(HeaderFlags::DIRTY);
    list.header.commit(&mut list.mf)?;
    tracing::debug!(path = ?list.mf.path(), records = live, "repair complete");
    Ok(())
}

/// One record can need relinking at several levels, so each fix works off a
/// fresh decode rather than a stale copy.
fn relink(mf: &mut MappedFile, pred_off: u64, level: usize, target: u64) -> Result<()> {
    let mut pred = Record::decode(mf, pred_off)?;
    pred.ptrs[level + 1] = target;
    let buf = pred.prepare();
    mf.write_all_at(&buf, pred.offset)?;
    Ok(())
}

/// Stage two: scan the damaged file record by record, replay every
/// transaction whose commit record survived into a fresh sidecar, and
/// rename it over the original. Refuses to replace the file if nothing at
/// all could be recovered.
fn rebuild(list: &mut Skiplist) -> Result<()> {
    let path = list.mf.path().to_owned();
    let sidecar = sidecar_path(&path);
    let _ = std::fs::remove_file(&sidecar);

    match rebuild_into(list, &sidecar) {
        Ok(mut new) => {
            new.mf.rename_over(&path)?;
            tracing::warn!(
                ?path,
                records = new.header.num_records,
                generation = new.header.generation,
                "rebuilt database"
            );
            list.adopt(new);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&sidecar);
            Err(e)
        }
    }
}

fn rebuild_into(list: &mut Skiplist, sidecar: &std::path::Path) -> Result<Skiplist> {
    let mut mf = MappedFile::open(sidecar, true)?;
    let header = Skiplist::init_file(&mut mf)?;
    let mut new = Skiplist::new(mf, header, list.compar);
    let rebuild_start = new.header.current_size;

    let dummy = list.dummy()?;
    let mut off = DUMMY_OFFSET + dummy.len;
    let end = list.mf.len();
    // Records staged since the last commit record; the commit flushes them.
    let mut staged: Vec<(RecordType, Vec<u8>, Vec<u8>, u64)> = Vec::new();
    let mut poisoned = false;

    while off < end {
        let rec = match Record::decode(&list.mf, off) {
            Ok(rec) => rec,
            Err(e) => {
                // Without a valid length there is no next record boundary.
                tracing::warn!(off, error = %e, "scan stopped at unreadable record");
                break;
            }
        };
        match rec.rtype {
            RecordType::Key | RecordType::Delete => {
                if rec.check_tail(&list.mf).is_err() {
                    tracing::warn!(off, "dropping transaction with damaged payload");
                    poisoned = true;
                    staged.clear();
                } else if !poisoned {
                    staged.push((
                        rec.rtype,
                        rec.key(&list.mf)?.to_vec(),
                        rec.value(&list.mf)?.to_vec(),
                        off,
                    ));
                }
            }
            RecordType::Commit => {
                if poisoned {
                    poisoned = false;
                } else if let Err(e) = replay(&mut new, &mut staged, rec.ptrs[0]) {
                    tracing::warn!(off, error = %e, "replay of one transaction failed");
                }
                staged.clear();
            }
            RecordType::Dummy => {
                tracing::warn!(off, "scan stopped at stray dummy record");
                break;
            }
        }
        off += rec.len;
    }

    if new.header.num_records == 0 {
        return Err(Error::NotFound);
    }

    // Seal the replayed content behind a commit record of its own, so the
    // rebuilt file is itself rebuildable.
    new.append_commit(rebuild_start)?;

    new.header.generation = list.header.generation + 1;
    new.header.current_size = new.end;
    new.header.repack_size = new.end;
    new.check_consistent()?;
    new.mf.commit()?;
    new.header.commit(&mut new.mf)?;

    // Locked before it goes live, so the caller keeps exclusive access
    // across the swap exactly as it had on the file being replaced.
    new.mf.lock(crate::mapped::LockLevel::Write)?;
    Ok(new)
}

fn replay(
    new: &mut Skiplist,
    staged: &mut Vec<(RecordType, Vec<u8>, Vec<u8>, u64)>,
    start: u64,
) -> Result<()> {
    for (rtype, key, value, off) in staged.drain(..) {
        if off < start {
            continue;
        }
        new.relocate(&key)?;
        match rtype {
            RecordType::Key => new.store_here(&value)?,
            RecordType::Delete => {
                if new.current_live().is_some() {
                    new.delete_here()?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}
