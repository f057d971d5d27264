use std::cmp::Ordering;
use std::io::IoSlice;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::header::Header;
use crate::locator::{Locator, LEVELS};
use crate::mapped::MappedFile;
use crate::record::{Record, RecordType, DUMMY_OFFSET, MAX_LEVEL};

/// Strict weak order over keys, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Plain byte-wise comparison.
    Lexical,
    /// Mailbox-hierarchy order: the separator `.` sorts before every other
    /// byte, so `a.b` < `a-x.b` even though `-` < `.` in raw byte order.
    MailboxOrder,
}

impl Comparator {
    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Comparator::Lexical => a.cmp(b),
            Comparator::MailboxOrder => {
                let weight = |b: u8| if b == b'.' { 1u8 } else { b };
                a.iter()
                    .map(|&b| weight(b))
                    .cmp(b.iter().map(|&b| weight(b)))
            }
        }
    }
}

/// The on-disk skiplist: mapped file, working header, logical end of file,
/// and the cached search position. Everything above this type (transactions,
/// the registry, checkpointing) drives these primitives.
pub(crate) struct Skiplist {
    pub mf: MappedFile,
    pub header: Header,
    /// Logical end of file: equal to `header.current_size` between
    /// transactions, and running ahead of it while one is appending.
    pub end: u64,
    pub compar: Comparator,
    pub loc: Locator,
    rng: StdRng,
}

impl Skiplist {
    pub fn new(mf: MappedFile, header: Header, compar: Comparator) -> Self {
        let end = header.current_size;
        Self {
            mf,
            header,
            end,
            compar,
            loc: Locator::default(),
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Lay down a fresh, empty database: the dummy head followed by a clean
    /// header, both durable before anyone gets to see the file.
    pub fn init_file(mf: &mut MappedFile) -> Result<Header> {
        mf.truncate(0)?;
        let mut dummy = Record::dummy();
        dummy.tail_crc = Record::payload_crc(b"", b"");
        mf.write_all_at(&dummy.prepare(), DUMMY_OFFSET)?;

        let header = Header::new(DUMMY_OFFSET + dummy.len);
        header.write(mf)?;
        mf.commit()?;
        Ok(header)
    }

    /// Append the transaction terminator; its slot 0 names the first record
    /// of the transaction so a rebuild can replay it.
    pub fn append_commit(&mut self, txn_start: u64) -> Result<()> {
        let mut rec = Record::with_layout(RecordType::Commit, 0, self.end, 0, 0);
        rec.ptrs[0] = txn_start;
        rec.tail_crc = Record::payload_crc(b"", b"");
        self.append(&rec, b"", b"")
    }

    /// Swap in the state of a freshly built replacement file (compaction or
    /// rebuild) while the engine handle stays the same for callers.
    pub fn adopt(&mut self, other: Skiplist) {
        self.mf = other.mf;
        self.header = other.header;
        self.end = other.end;
        self.loc = Locator::default();
    }

    fn corrupt(&self, offset: u64, reason: &'static str) -> Error {
        Error::corrupt(self.mf.path(), offset, reason)
    }

    /// Draw the level of a new record: geometric with p = 1/2, capped.
    fn random_level(&mut self) -> u8 {
        let mut level = 0;
        while level < MAX_LEVEL && self.rng.gen::<bool>() {
            level += 1;
        }
        level
    }

    pub fn dummy(&self) -> Result<Record> {
        let dummy = Record::decode(&self.mf, DUMMY_OFFSET)?;
        if dummy.rtype != RecordType::Dummy {
            return Err(self.corrupt(DUMMY_OFFSET, "list head is not a dummy record"));
        }
        Ok(dummy)
    }

    /// Full top-down search for `key`, rebuilding the locator frame. After
    /// this returns, `loc.back`/`loc.forward` bracket the insertion point at
    /// every level, and `loc.record` is the exact match if there is one
    /// (live or tombstone).
    pub fn relocate(&mut self, key: &[u8]) -> Result<()> {
        let cs = self.header.current_size;
        let mut loc = Locator::start(key, self.header.generation, self.end);
        let dummy = self.dummy()?;

        if key.is_empty() {
            // Frame the very beginning of the list: iteration starts here.
            for level in 0..LEVELS {
                loc.back[level] = DUMMY_OFFSET;
                loc.forward[level] = dummy.next_at(level, cs);
            }
            loc.record = Some(dummy);
            loc.framed = true;
            self.loc = loc;
            return Ok(());
        }

        let mut cur = dummy;
        for level in (0..LEVELS).rev() {
            loop {
                let next_off = cur.next_at(level, cs);
                if next_off == 0 {
                    break;
                }
                let next = Record::decode(&self.mf, next_off)?;
                let next_key = next.key(&self.mf)?;

                // The chain must keep ascending; a non-increasing step means
                // a pointer loop or torn linkage.
                if cur.rtype != RecordType::Dummy
                    && self.compar.cmp(next_key, cur.key(&self.mf)?) != Ordering::Greater
                {
                    return Err(self.corrupt(next_off, "chain keys out of order"));
                }

                match self.compar.cmp(next_key, key) {
                    Ordering::Less => cur = next,
                    _ => break,
                }
            }
            loc.back[level] = cur.offset;
            loc.forward[level] = cur.next_at(level, cs);
        }

        // Exact match: adopt the record's own forward pointers, so an insert
        // or delete at this position links past it.
        let candidate = loc.forward[0];
        if candidate != 0 {
            let rec = Record::decode(&self.mf, candidate)?;
            if self.compar.cmp(rec.key(&self.mf)?, key) == Ordering::Equal {
                rec.check_tail(&self.mf)?;
                for level in 0..=rec.level as usize {
                    loc.forward[level] = rec.next_at(level, cs);
                }
                loc.is_exact = true;
                loc.record = Some(rec);
            }
        }

        loc.framed = true;
        self.loc = loc;
        Ok(())
    }

    /// Position on `key`, reusing the cached locator when it still frames
    /// exactly this key against the current `(generation, end)`.
    pub fn find(&mut self, key: &[u8]) -> Result<()> {
        if self.loc.valid(self.header.generation, self.end)
            && self.loc.framed
            && self.loc.is_exact
            && self.loc.key == key
        {
            return Ok(());
        }
        self.relocate(key)
    }

    /// The record the locator points at, if it is a live key.
    pub fn current_live(&self) -> Option<&Record> {
        self.loc
            .record
            .as_ref()
            .filter(|r| self.loc.is_exact && r.rtype == RecordType::Key)
    }

    /// Step to the next live key in comparator order, skipping tombstones.
    /// Revalidates (re-searches) first if anything moved underneath us.
    pub fn advance(&mut self) -> Result<Option<Record>> {
        if !self.loc.valid(self.header.generation, self.end) {
            let key = std::mem::take(&mut self.loc.key);
            self.relocate(&key)?;
        }

        let cs = self.header.current_size;
        let mut prev_off;
        let mut next_off = match &self.loc.record {
            // From the exact match (or the dummy), step past it.
            Some(rec) => {
                prev_off = rec.offset;
                rec.next_at(0, cs)
            }
            // From a gap: the successor is the next candidate.
            None => {
                prev_off = self.loc.back[0];
                self.loc.forward[0]
            }
        };

        while next_off != 0 {
            let rec = Record::decode(&self.mf, next_off)?;
            rec.check_tail(&self.mf)?;
            match rec.rtype {
                RecordType::Delete => {
                    prev_off = next_off;
                    next_off = rec.next_at(0, cs);
                }
                RecordType::Key => {
                    self.loc.key = rec.key(&self.mf)?.to_vec();
                    self.loc.is_exact = true;
                    self.loc.back[0] = prev_off;
                    self.loc.forward[0] = rec.next_at(0, cs);
                    self.loc.record = Some(rec);
                    // The upper levels of the frame no longer match this
                    // position; only a fresh search may drive a stitch.
                    self.loc.framed = false;
                    return Ok(self.loc.record.clone());
                }
                _ => return Err(self.corrupt(next_off, "chain contains a non-key record")),
            }
        }

        // End of list; remember we ran off it.
        self.loc.is_exact = false;
        self.loc.record = None;
        self.loc.back[0] = prev_off;
        self.loc.forward[0] = 0;
        self.loc.framed = false;
        Ok(None)
    }

    /// Append the encoded record plus payload at the logical end of file.
    fn append(&mut self, rec: &Record, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert_eq!(rec.offset, self.end);
        let header = rec.prepare();
        let bufs = [
            IoSlice::new(&header),
            IoSlice::new(key),
            IoSlice::new(value),
            IoSlice::new(rec.padding()),
        ];
        self.mf.write_all_at_vectored(&bufs, rec.offset)?;
        self.end = rec.offset + rec.len;
        Ok(())
    }

    /// Re-encode a record's header in place after its pointers changed; the
    /// head CRC rides along in the same positioned write.
    pub fn rewrite_record(&mut self, rec: &Record) -> Result<()> {
        let buf = rec.prepare();
        self.mf.write_all_at(&buf, rec.offset)?;
        Ok(())
    }

    /// Rewrite the back-pointers framed by the locator so that level `i`
    /// points at `targets[i]`, for every level up to `max_level`. Levels
    /// sharing a predecessor are folded into one header rewrite.
    fn stitch(&mut self, max_level: usize, targets: &[u64; LEVELS]) -> Result<()> {
        let cs = self.header.current_size;
        let mut level = 0;
        while level <= max_level {
            let off = self.loc.back[level];
            let mut pred = Record::decode(&self.mf, off)?;
            while level <= max_level && self.loc.back[level] == off {
                pred.set_next(level, targets[level], cs);
                level += 1;
            }
            self.rewrite_record(&pred)?;
        }
        Ok(())
    }

    /// Insert or replace at the framed position. The locator must come from
    /// a fresh search on the key being stored.
    pub fn store_here(&mut self, value: &[u8]) -> Result<()> {
        debug_assert!(self.loc.framed);
        let cs = self.header.current_size;
        let shadowed = self.loc.record.clone().filter(|_| self.loc.is_exact);

        // Replacing a live record takes it out of the count until the new
        // one lands.
        if matches!(&shadowed, Some(r) if r.rtype == RecordType::Key) {
            self.header.num_records -= 1;
        }

        let level = self.random_level();
        let key = std::mem::take(&mut self.loc.key);
        let mut rec = Record::with_layout(
            RecordType::Key,
            level,
            self.end,
            key.len() as u64,
            value.len() as u64,
        );
        for i in 0..=level as usize {
            rec.set_next(i, self.loc.forward[i], cs);
        }
        rec.tail_crc = Record::payload_crc(&key, value);
        self.append(&rec, &key, value)?;
        self.loc.key = key;

        // Levels the new record occupies point at it; levels above it (when
        // shadowing a taller record) skip the shadowed record entirely.
        let shadowed_level = shadowed.as_ref().map(|r| r.level).unwrap_or(0);
        let max_level = level.max(shadowed_level) as usize;
        let mut targets = self.loc.forward;
        for entry in targets.iter_mut().take(level as usize + 1) {
            *entry = rec.offset;
        }
        self.stitch(max_level, &targets)?;

        self.header.num_records += 1;
        tracing::trace!(offset = rec.offset, level = rec.level as u64, "stored record");
        self.loc.forward = targets;
        self.loc.is_exact = true;
        self.loc.record = Some(rec);
        self.loc.end = self.end;
        Ok(())
    }

    /// Replace the framed live record with a tombstone that carries its key
    /// and its level-0 successor, then unlink it from every upper level.
    pub fn delete_here(&mut self) -> Result<()> {
        debug_assert!(self.loc.framed);
        let cs = self.header.current_size;
        let old = match self.current_live() {
            Some(rec) => rec.clone(),
            None => return Err(Error::NotFound),
        };

        let key = std::mem::take(&mut self.loc.key);
        let mut del = Record::with_layout(RecordType::Delete, 0, self.end, key.len() as u64, 0);
        del.set_next(0, self.loc.forward[0], cs);
        del.tail_crc = Record::payload_crc(&key, b"");
        self.append(&del, &key, b"")?;
        self.loc.key = key;

        let mut targets = self.loc.forward;
        targets[0] = del.offset;
        self.stitch(old.level as usize, &targets)?;

        let del_offset = del.offset;
        self.header.num_records -= 1;
        self.loc.is_exact = true;
        self.loc.record = Some(del);
        self.loc.end = self.end;
        tracing::trace!(offset = del_offset, unlinked = old.offset, "deleted record");
        Ok(())
    }

    /// Walk the whole level-0 chain verifying invariant structure: keys
    /// strictly ascending, every upper-level pointer converging on the next
    /// record of that height, tail CRCs intact, live count matching the
    /// header.
    pub fn check_consistent(&self) -> Result<()> {
        let cs = self.header.current_size;
        let dummy = self.dummy()?;

        let mut expect: [u64; LEVELS] = std::array::from_fn(|i| dummy.next_at(i, cs));
        let mut prev: Option<Record> = None;
        let mut live = 0u64;
        let mut off = dummy.next_at(0, cs);

        while off != 0 {
            let rec = Record::decode(&self.mf, off)?;
            rec.check_tail(&self.mf)?;

            if expect[0] != off {
                return Err(self.corrupt(off, "level-0 chain skew"));
            }
            if let Some(prev) = &prev {
                if self.compar.cmp(rec.key(&self.mf)?, prev.key(&self.mf)?) != Ordering::Greater {
                    return Err(self.corrupt(off, "chain keys out of order"));
                }
            }
            match rec.rtype {
                RecordType::Key => live += 1,
                RecordType::Delete => {}
                _ => return Err(self.corrupt(off, "chain contains a non-key record")),
            }

            expect[0] = rec.next_at(0, cs);
            for level in 1..=rec.level as usize {
                if expect[level] != off {
                    return Err(self.corrupt(off, "upper-level pointer skew"));
                }
                expect[level] = rec.next_at(level, cs);
            }
            prev = Some(rec);
            off = expect[0];
        }

        if expect.iter().any(|&e| e != 0) {
            return Err(self.corrupt(self.end, "dangling upper-level pointer"));
        }
        if live != self.header.num_records {
            return Err(self.corrupt(0, "record count mismatch"));
        }
        Ok(())
    }
}
