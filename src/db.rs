use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::checkpoint;
use crate::error::{Error, Result};
use crate::header::Header;
use crate::mapped::{LockLevel, MappedFile};
use crate::record::{Record, DUMMY_OFFSET};
use crate::recovery;
use crate::registry;
use crate::skiplist::{Comparator, Skiplist};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Create and initialize the file if the path does not exist.
        const CREATE = 1;
        /// Order keys by mailbox hierarchy instead of raw bytes.
        const MBOXSORT = 2;
        /// Never compact automatically after a commit.
        const NOCOMPACT = 4;
    }
}

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to an open database. Opening the same path twice hands back the
/// same underlying engine through the process-global registry; dropping the
/// handle releases one reference.
pub struct Database {
    shared: Arc<SharedDb>,
}

/// The single in-flight transaction of an engine. Consumed by
/// [`Database::commit`] and [`Database::abort`]; dropping it un-finished
/// rolls the transaction back.
pub struct Transaction {
    id: u64,
    db: Weak<SharedDb>,
    finished: bool,
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(shared) = self.db.upgrade() {
            tracing::warn!(id = self.id, "transaction dropped without commit, rolling back");
            if let Err(e) = shared.abort_by_id(self.id) {
                tracing::error!(id = self.id, error = %e, "rollback of dropped transaction failed");
            }
        }
    }
}

pub(crate) struct SharedDb {
    pub(crate) path: PathBuf,
    flags: OpenFlags,
    inner: Mutex<Engine>,
}

struct TxnState {
    id: u64,
    /// Set once the first mutation has flipped the DIRTY bit on disk.
    mutated: bool,
    /// `current_size` when the transaction began: the offset of its first
    /// record, and the target of its commit record.
    begin_size: u64,
}

struct Engine {
    list: Skiplist,
    txn: Option<TxnState>,
}

impl SharedDb {
    pub(crate) fn open(path: &Path, flags: OpenFlags) -> Result<Arc<Self>> {
        let compar = if flags.contains(OpenFlags::MBOXSORT) {
            Comparator::MailboxOrder
        } else {
            Comparator::Lexical
        };
        let create = flags.contains(OpenFlags::CREATE);

        let mut mf = match MappedFile::open(path, create) {
            Ok(mf) => mf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };
        // Initialization and recovery both need the write lock; dropping the
        // file on any failure below releases it.
        mf.lock(LockLevel::Write)?;

        let header = if mf.len() == 0 {
            if !create {
                return Err(Error::NotFound);
            }
            Skiplist::init_file(&mut mf)?
        } else {
            Header::read(&mf)?
        };

        let mut list = Skiplist::new(mf, header, compar);
        if list.header.dirty() || list.header.current_size != list.mf.len() {
            recovery::recover(&mut list)?;
        }
        list.mf.lock(LockLevel::Unlocked)?;

        tracing::debug!(?path, generation = list.header.generation, records = list.header.num_records, "opened database");
        Ok(Arc::new(Self {
            path: path.to_owned(),
            flags,
            inner: Mutex::new(Engine { list, txn: None }),
        }))
    }

    /// Called by the registry when the last reference goes away. A handle
    /// disposed while still holding a lock is a caller bug; log it and let
    /// the descriptor going away release the lock.
    pub(crate) fn dispose(&self) {
        let eng = self.inner.lock();
        if eng.list.mf.lock_level() != LockLevel::Unlocked {
            tracing::warn!(path = ?self.path, "disposing a database that is still locked");
        }
    }

    fn abort_by_id(&self, id: u64) -> Result<()> {
        let mut eng = self.inner.lock();
        eng.txn_matches(id)?;
        let state = eng.take_txn()?;
        let result = if state.mutated {
            recovery::repair(&mut eng.list)
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            tracing::error!(path = ?self.path, error = %e, "rollback failed, file left dirty for recovery");
        }
        let _ = eng.list.mf.lock(LockLevel::Unlocked);
        tracing::debug!(id, "transaction aborted");
        result
    }
}

impl Engine {
    fn txn_matches(&self, id: u64) -> Result<()> {
        match &self.txn {
            Some(state) if state.id == id => Ok(()),
            _ => Err(Error::Locked),
        }
    }

    fn take_txn(&mut self) -> Result<TxnState> {
        self.txn.take().ok_or(Error::Locked)
    }

    /// Re-read the header after acquiring a lock: another process may have
    /// committed, compacted, or replaced the file since we last held one.
    fn refresh(&mut self) -> Result<()> {
        self.list.mf.refresh_len()?;
        self.list.header = Header::read(&self.list.mf)?;
        self.list.end = self.list.header.current_size;
        Ok(())
    }

    fn needs_recovery(&self) -> bool {
        self.list.header.dirty() || self.list.header.current_size != self.list.mf.len()
    }

    /// Take the read lock for a one-shot operation. If the file turns out to
    /// need recovery, upgrade to the write lock, repair, and drop back down.
    fn begin_read(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::Locked);
        }
        self.list.mf.lock(LockLevel::Read)?;
        let result = (|| loop {
            self.refresh()?;
            if !self.needs_recovery() {
                return Ok(());
            }
            self.list.mf.lock(LockLevel::Write)?;
            self.refresh()?;
            if self.needs_recovery() {
                recovery::recover(&mut self.list)?;
            }
            // The downgrade is not atomic; go around again in case another
            // writer crashed in the window.
            self.list.mf.lock(LockLevel::Read)?;
        })();
        if result.is_err() {
            let _ = self.list.mf.lock(LockLevel::Unlocked);
        }
        result
    }

    fn end_read(&mut self) {
        if let Err(e) = self.list.mf.lock(LockLevel::Unlocked) {
            tracing::error!(path = ?self.list.mf.path(), error = %e, "failed to release read lock");
        }
    }

    /// First mutation of a transaction: flip DIRTY on disk and fsync it, so
    /// any crash from here on is detected. Later writes in the same
    /// transaction ride on that one flip.
    fn touch(&mut self) -> Result<()> {
        let state = self.txn.as_mut().ok_or(Error::Locked)?;
        if !state.mutated {
            self.list.header.flags.insert(crate::header::HeaderFlags::DIRTY);
            self.list.header.commit(&mut self.list.mf)?;
            state.mutated = true;
            tracing::debug!(id = state.id, "transaction turned dirty");
        }
        Ok(())
    }

    fn fetch_at(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.list.find(key)?;
        match self.list.current_live() {
            Some(rec) => Ok(rec.value(&self.list.mf)?.to_vec()),
            None => Err(Error::NotFound),
        }
    }

    fn fetch_next_at(&mut self, key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        self.list.find(key)?;
        match self.list.advance()? {
            Some(rec) => Ok((
                rec.key(&self.list.mf)?.to_vec(),
                rec.value(&self.list.mf)?.to_vec(),
            )),
            None => Err(Error::NotFound),
        }
    }

    /// One step of a prefix scan: the first live key matching `prefix` when
    /// `last` is None, the next one after `last` otherwise. Pairs are copied
    /// out so no borrow of the map outlives the locks.
    fn next_pair(
        &mut self,
        prefix: &[u8],
        last: Option<&[u8]>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let rec = match last {
            None => {
                self.list.relocate(prefix)?;
                match self.list.current_live() {
                    Some(rec) => Some(rec.clone()),
                    None => self.list.advance()?,
                }
            }
            Some(last) => {
                self.list.find(last)?;
                self.list.advance()?
            }
        };

        let Some(rec) = rec else { return Ok(None) };
        let key = rec.key(&self.list.mf)?;
        if !key.starts_with(prefix) {
            return Ok(None);
        }
        Ok(Some((key.to_vec(), rec.value(&self.list.mf)?.to_vec())))
    }

    fn put(&mut self, key: &[u8], value: &[u8], create_only: bool) -> Result<()> {
        self.list.find(key)?;
        if create_only && self.list.current_live().is_some() {
            return Err(Error::Exists);
        }
        self.touch()?;
        self.list.store_here(value)
    }

    fn remove(&mut self, key: &[u8], force: bool) -> Result<()> {
        self.list.find(key)?;
        if self.list.current_live().is_none() {
            return if force { Ok(()) } else { Err(Error::NotFound) };
        }
        self.touch()?;
        self.list.delete_here()
    }

    /// Append the commit record, make the data durable, then publish it by
    /// rewriting the header. Exactly two fsyncs; none at all for a
    /// transaction that never wrote.
    fn commit_inner(&mut self, state: &TxnState) -> Result<()> {
        if !state.mutated {
            return Ok(());
        }
        self.list.append_commit(state.begin_size)?;
        self.list.mf.commit()?;

        self.list.header.current_size = self.list.end;
        self.list.header.flags.remove(crate::header::HeaderFlags::DIRTY);
        self.list.header.commit(&mut self.list.mf)?;
        Ok(())
    }

    fn dump(&mut self, out: &mut dyn Write, detail: u32) -> Result<()> {
        let h = &self.list.header;
        writeln!(
            out,
            "{}: generation={} records={} current={} repack={} flags={:?} syncs={}",
            self.list.mf.path().display(),
            h.generation,
            h.num_records,
            h.current_size,
            h.repack_size,
            h.flags,
            self.list.mf.sync_count(),
        )?;
        if detail == 0 {
            return Ok(());
        }

        // Physical scan: shadowed and unreachable records show up too.
        let mut off = DUMMY_OFFSET;
        while off < self.list.end {
            let rec = match Record::decode(&self.list.mf, off) {
                Ok(rec) => rec,
                Err(e) => {
                    writeln!(out, "{off:010}: unreadable ({e})")?;
                    break;
                }
            };
            let key = rec.key(&self.list.mf).unwrap_or(&b"?"[..]);
            writeln!(
                out,
                "{off:010}: {} level={} keylen={} vallen={} ptrs={:?} key={:?}",
                rec.rtype.as_byte() as char,
                rec.level,
                rec.key_len,
                rec.val_len,
                &rec.ptrs[..rec.slots()],
                String::from_utf8_lossy(key),
            )?;
            off += rec.len;
        }
        Ok(())
    }
}

impl Database {
    /// Open (or create) the database at `path`, sharing the engine with any
    /// other handle to the same path in this process.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let shared = registry::acquire(path.as_ref(), flags)?;
        Ok(Self { shared })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Explicit close; identical to dropping the handle.
    pub fn close(self) {}

    fn check_txn(&self, txn: &Transaction) -> Result<()> {
        if Weak::ptr_eq(&txn.db, &Arc::downgrade(&self.shared)) {
            Ok(())
        } else {
            Err(Error::Locked)
        }
    }

    /// Start the engine's single transaction: take the write lock, re-read
    /// the header, and recover first if a previous writer crashed.
    pub fn begin(&self) -> Result<Transaction> {
        let mut eng = self.shared.inner.lock();
        if eng.txn.is_some() {
            return Err(Error::Locked);
        }
        eng.list.mf.lock(LockLevel::Write)?;
        let prepared = (|| {
            eng.refresh()?;
            if eng.needs_recovery() {
                recovery::recover(&mut eng.list)?;
            }
            Ok(())
        })();
        if let Err(e) = prepared {
            let _ = eng.list.mf.lock(LockLevel::Unlocked);
            return Err(e);
        }

        let id = NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed);
        eng.txn = Some(TxnState {
            id,
            mutated: false,
            begin_size: eng.list.header.current_size,
        });
        tracing::debug!(id, path = ?self.shared.path, "transaction started");
        Ok(Transaction {
            id,
            db: Arc::downgrade(&self.shared),
            finished: false,
        })
    }

    pub fn fetch(&self, key: &[u8], txn: Option<&Transaction>) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        let mut eng = self.shared.inner.lock();
        match txn {
            Some(t) => {
                self.check_txn(t)?;
                eng.txn_matches(t.id)?;
                eng.fetch_at(key)
            }
            None => {
                eng.begin_read()?;
                let r = eng.fetch_at(key);
                eng.end_read();
                r
            }
        }
    }

    /// Smallest live key strictly greater than `key` (the first key when
    /// `key` is empty), with its value.
    pub fn fetch_next(&self, key: &[u8], txn: Option<&Transaction>) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut eng = self.shared.inner.lock();
        match txn {
            Some(t) => {
                self.check_txn(t)?;
                eng.txn_matches(t.id)?;
                eng.fetch_next_at(key)
            }
            None => {
                eng.begin_read()?;
                let r = eng.fetch_next_at(key);
                eng.end_read();
                r
            }
        }
    }

    /// In-order scan of every live key starting with `prefix`. The engine
    /// lock is released around each callback, so a callback running without
    /// a transaction may reenter the database, including mutating it; the
    /// scan picks up after the last yielded key. `filter` short-circuits
    /// records before they reach the callback; returning `Break` from the
    /// callback ends the scan early.
    pub fn foreach<F>(
        &self,
        prefix: &[u8],
        filter: Option<&dyn Fn(&[u8], &[u8]) -> bool>,
        mut cb: F,
        txn: Option<&Transaction>,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<ControlFlow<()>>,
    {
        if let Some(t) = txn {
            self.check_txn(t)?;
        }
        let mut last: Option<Vec<u8>> = None;
        loop {
            let pair = {
                let mut eng = self.shared.inner.lock();
                match txn {
                    Some(t) => {
                        eng.txn_matches(t.id)?;
                        eng.next_pair(prefix, last.as_deref())?
                    }
                    None => {
                        eng.begin_read()?;
                        let r = eng.next_pair(prefix, last.as_deref());
                        eng.end_read();
                        r?
                    }
                }
            };
            let Some((key, value)) = pair else {
                return Ok(());
            };
            if filter.map_or(true, |f| f(&key, &value)) {
                if let ControlFlow::Break(()) = cb(&key, &value)? {
                    return Ok(());
                }
            }
            last = Some(key);
        }
    }

    /// Insert or replace.
    pub fn store(&self, key: &[u8], value: &[u8], txn: Option<&mut Transaction>) -> Result<()> {
        self.put(key, value, txn, false)
    }

    /// Insert; fails with [`Error::Exists`] if the key is already live.
    pub fn create(&self, key: &[u8], value: &[u8], txn: Option<&mut Transaction>) -> Result<()> {
        self.put(key, value, txn, true)
    }

    fn put(
        &self,
        key: &[u8],
        value: &[u8],
        txn: Option<&mut Transaction>,
        create_only: bool,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        match txn {
            Some(t) => {
                self.check_txn(t)?;
                let mut eng = self.shared.inner.lock();
                eng.txn_matches(t.id)?;
                eng.put(key, value, create_only)
            }
            None => self.one_shot(|eng| eng.put(key, value, create_only)),
        }
    }

    /// Delete `key`. Deleting an absent key is an error unless `force`.
    pub fn delete(&self, key: &[u8], txn: Option<&mut Transaction>, force: bool) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidKey);
        }
        match txn {
            Some(t) => {
                self.check_txn(t)?;
                let mut eng = self.shared.inner.lock();
                eng.txn_matches(t.id)?;
                eng.remove(key, force)
            }
            None => self.one_shot(|eng| eng.remove(key, force)),
        }
    }

    /// Run one mutation inside its own transaction.
    fn one_shot(&self, op: impl FnOnce(&mut Engine) -> Result<()>) -> Result<()> {
        let txn = self.begin()?;
        let result = {
            let mut eng = self.shared.inner.lock();
            op(&mut *eng)
        };
        match result {
            Ok(()) => self.commit(txn),
            Err(e) => {
                if let Err(abort_err) = self.abort(txn) {
                    tracing::error!(error = %abort_err, "rollback of failed one-shot operation failed");
                }
                Err(e)
            }
        }
    }

    /// Publish the transaction. Succeed or fail, the handle is spent.
    pub fn commit(&self, mut txn: Transaction) -> Result<()> {
        self.check_txn(&txn)?;
        txn.finished = true;
        let id = txn.id;
        drop(txn);

        let mut eng = self.shared.inner.lock();
        eng.txn_matches(id)?;
        let state = eng.take_txn()?;
        let result = eng.commit_inner(&state);
        match &result {
            Ok(()) => {
                tracing::debug!(id, "transaction committed");
                if state.mutated
                    && !self.shared.flags.contains(OpenFlags::NOCOMPACT)
                    && checkpoint::wanted(&eng.list.header)
                {
                    if let Err(e) = checkpoint::run(&mut eng.list) {
                        tracing::warn!(path = ?self.shared.path, error = %e, "post-commit compaction failed");
                    }
                }
            }
            Err(e) => {
                tracing::error!(path = ?self.shared.path, error = %e, "commit failed, rolling back");
                if state.mutated {
                    if let Err(e2) = recovery::repair(&mut eng.list) {
                        tracing::error!(path = ?self.shared.path, error = %e2, "rollback after failed commit failed too");
                    }
                }
            }
        }
        let _ = eng.list.mf.lock(LockLevel::Unlocked);
        result
    }

    /// Roll the transaction back: truncate to the committed size and repair
    /// the pointers the transaction touched.
    pub fn abort(&self, mut txn: Transaction) -> Result<()> {
        self.check_txn(&txn)?;
        txn.finished = true;
        let id = txn.id;
        drop(txn);
        self.shared.abort_by_id(id)
    }

    /// Admin diagnostic. Detail 0 prints the header; detail 1 adds every
    /// physical record, reachable or not.
    pub fn dump(&self, out: &mut dyn Write, detail: u32) -> Result<()> {
        let mut eng = self.shared.inner.lock();
        eng.begin_read()?;
        let r = eng.dump(out, detail);
        eng.end_read();
        r
    }

    /// Full structural scan; [`Error::Corrupt`] describes the first
    /// violation found.
    pub fn consistent(&self) -> Result<()> {
        let mut eng = self.shared.inner.lock();
        eng.begin_read()?;
        let r = eng.list.check_consistent();
        eng.end_read();
        r
    }

    /// Compact now, regardless of the trigger heuristic.
    pub fn checkpoint(&self) -> Result<()> {
        let mut eng = self.shared.inner.lock();
        if eng.txn.is_some() {
            return Err(Error::Locked);
        }
        eng.list.mf.lock(LockLevel::Write)?;
        let result = (|| {
            eng.refresh()?;
            if eng.needs_recovery() {
                recovery::recover(&mut eng.list)?;
            }
            checkpoint::run(&mut eng.list)
        })();
        let _ = eng.list.mf.lock(LockLevel::Unlocked);
        result
    }

    /// Number of fsyncs issued through this engine since it was opened (or
    /// last compacted).
    pub fn sync_count(&self) -> u64 {
        self.shared.inner.lock().list.mf.sync_count()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        registry::release(&self.shared.path);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.shared.path)
            .finish()
    }
}
