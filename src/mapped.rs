use std::fs::File;
use std::io::{self, IoSlice};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use nix::fcntl::{Flock, FlockArg};

use crate::io::FileExt;

/// Size the map in chunks so that steady appends do not remap on every
/// write. Pages past end-of-file are never dereferenced: `slice` bounds
/// every access by the tracked file length.
const MAP_CHUNK: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockLevel {
    Unlocked,
    Read,
    Write,
}

enum LockedFile {
    Unlocked(File),
    Shared(Flock<File>),
    Exclusive(Flock<File>),
    /// Transient placeholder while a transition owns the file.
    Moved,
}

impl LockedFile {
    fn file(&self) -> &File {
        match self {
            LockedFile::Unlocked(f) => f,
            LockedFile::Shared(l) => &**l,
            LockedFile::Exclusive(l) => &**l,
            LockedFile::Moved => unreachable!("lock transition left no file behind"),
        }
    }

    fn level(&self) -> LockLevel {
        match self {
            LockedFile::Unlocked(_) => LockLevel::Unlocked,
            LockedFile::Shared(_) => LockLevel::Read,
            LockedFile::Exclusive(_) => LockLevel::Write,
            LockedFile::Moved => unreachable!("lock transition left no file behind"),
        }
    }

    /// Release whatever lock is held, returning the bare file. On failure the
    /// previous state is restored before the error is surfaced.
    fn into_unlocked(self) -> Result<File, (Self, io::Error)> {
        match self {
            LockedFile::Unlocked(f) => Ok(f),
            LockedFile::Shared(l) => l
                .unlock()
                .map_err(|(l, e)| (LockedFile::Shared(l), e.into())),
            LockedFile::Exclusive(l) => l
                .unlock()
                .map_err(|(l, e)| (LockedFile::Exclusive(l), e.into())),
            LockedFile::Moved => unreachable!("lock transition left no file behind"),
        }
    }
}

/// A database file plus the machinery every engine operation goes through:
/// advisory whole-file locks, positioned writes, and a shared read mapping
/// that tracks the file as it grows.
pub(crate) struct MappedFile {
    path: PathBuf,
    lock: LockedFile,
    map: Mmap,
    len: u64,
    syncs: u64,
}

impl MappedFile {
    pub fn open(path: &Path, create: bool) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        let len = file.metadata()?.len();
        let map = Self::map(&file, len)?;

        Ok(Self {
            path: path.to_owned(),
            lock: LockedFile::Unlocked(file),
            map,
            len,
            syncs: 0,
        })
    }

    fn map(file: &File, len: u64) -> io::Result<Mmap> {
        let map_len = len.max(1).next_multiple_of(MAP_CHUNK);
        unsafe { MmapOptions::new().len(map_len as usize).map(file) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn lock_level(&self) -> LockLevel {
        self.lock.level()
    }

    /// Borrow `len` bytes of the map starting at `offset`, bounded by the
    /// current file length. `None` means the range runs off the end of the
    /// file, which every caller treats as corruption.
    pub fn slice(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(&self.map[offset as usize..end as usize])
    }

    /// Take (or change) the advisory lock. Blocks until granted. If the
    /// directory entry was replaced under us (checkpoint or rebuild from
    /// another process), reopens the new file and re-locks it.
    pub fn lock(&mut self, level: LockLevel) -> io::Result<()> {
        loop {
            self.lock_once(level)?;
            // reopen_if_replaced leaves the fresh file unlocked, so the next
            // iteration locks the inode the path now points at.
            if level == LockLevel::Unlocked || !self.reopen_if_replaced()? {
                return Ok(());
            }
        }
    }

    fn lock_once(&mut self, level: LockLevel) -> io::Result<()> {
        if self.lock.level() == level {
            return Ok(());
        }

        let state = std::mem::replace(&mut self.lock, LockedFile::Moved);
        let file = match state.into_unlocked() {
            Ok(file) => file,
            Err((state, e)) => {
                self.lock = state;
                return Err(e);
            }
        };

        let arg = match level {
            LockLevel::Unlocked => {
                self.lock = LockedFile::Unlocked(file);
                return Ok(());
            }
            LockLevel::Read => FlockArg::LockShared,
            LockLevel::Write => FlockArg::LockExclusive,
        };

        match Flock::lock(file, arg) {
            Ok(l) if level == LockLevel::Read => self.lock = LockedFile::Shared(l),
            Ok(l) => self.lock = LockedFile::Exclusive(l),
            Err((file, e)) => {
                self.lock = LockedFile::Unlocked(file);
                return Err(e.into());
            }
        }

        Ok(())
    }

    /// Compare the inode behind our descriptor with the one the path now
    /// resolves to; reopen and remap when they differ.
    fn reopen_if_replaced(&mut self) -> io::Result<bool> {
        let on_disk = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            // Unlinked under us; keep serving the open descriptor.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        let ours = self.lock.file().metadata()?;
        if on_disk.ino() == ours.ino() && on_disk.dev() == ours.dev() {
            return Ok(false);
        }

        tracing::debug!(path = ?self.path, "database file was replaced, reopening");
        let file = File::options().read(true).write(true).open(&self.path)?;
        self.len = file.metadata()?.len();
        self.map = Self::map(&file, self.len)?;
        self.lock = LockedFile::Unlocked(file);
        Ok(true)
    }

    /// Pick up a length change made by another process (detected after
    /// re-reading the header under a fresh lock).
    pub fn refresh_len(&mut self) -> io::Result<()> {
        let len = self.lock.file().metadata()?.len();
        self.set_tracked_len(len)
    }

    fn set_tracked_len(&mut self, len: u64) -> io::Result<()> {
        if len > self.map.len() as u64 || len < self.len {
            self.map = Self::map(self.lock.file(), len)?;
        }
        self.len = len;
        Ok(())
    }

    pub fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.lock.file().write_all_at(buf, offset)?;
        let end = offset + buf.len() as u64;
        if end > self.len {
            self.set_tracked_len(end)?;
        }
        Ok(())
    }

    pub fn write_all_at_vectored(&mut self, bufs: &[IoSlice], offset: u64) -> io::Result<()> {
        self.lock.file().write_all_at_vectored(bufs, offset)?;
        let end = offset + bufs.iter().map(|b| b.len() as u64).sum::<u64>();
        if end > self.len {
            self.set_tracked_len(end)?;
        }
        Ok(())
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.lock.file().read_exact_at(buf, offset)
    }

    /// Flush dirty pages and fsync.
    pub fn commit(&mut self) -> io::Result<()> {
        self.lock.file().sync_all()?;
        self.syncs += 1;
        Ok(())
    }

    pub fn sync_count(&self) -> u64 {
        self.syncs
    }

    pub fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.lock.file().set_len(len)?;
        self.set_tracked_len(len)
    }

    /// Atomically rename this file over `target` and adopt that name.
    pub fn rename_over(&mut self, target: &Path) -> io::Result<()> {
        std::fs::rename(&self.path, target)?;
        self.path = target.to_owned();
        Ok(())
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("lock", &self.lock.level())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn map_tracks_growth() {
        let (_dir, path) = scratch("db");
        let mut mf = MappedFile::open(&path, true).unwrap();
        assert_eq!(mf.len(), 0);

        mf.write_all_at(b"0123456789", 0).unwrap();
        assert_eq!(mf.slice(2, 4).unwrap(), b"2345");
        assert!(mf.slice(8, 4).is_none());

        let big = vec![7u8; MAP_CHUNK as usize];
        mf.write_all_at(&big, 10).unwrap();
        assert_eq!(mf.len(), 10 + MAP_CHUNK);
        assert_eq!(mf.slice(10 + MAP_CHUNK - 1, 1).unwrap(), &[7]);
    }

    #[test]
    fn truncate_shrinks_view() {
        let (_dir, path) = scratch("db");
        let mut mf = MappedFile::open(&path, true).unwrap();
        mf.write_all_at(&[1; 64], 0).unwrap();
        mf.truncate(16).unwrap();
        assert_eq!(mf.len(), 16);
        assert!(mf.slice(0, 17).is_none());
        assert_eq!(mf.slice(0, 16).unwrap(), &[1; 16]);
    }

    #[test]
    fn lock_cycle() {
        let (_dir, path) = scratch("db");
        let mut mf = MappedFile::open(&path, true).unwrap();
        assert_eq!(mf.lock_level(), LockLevel::Unlocked);
        mf.lock(LockLevel::Read).unwrap();
        assert_eq!(mf.lock_level(), LockLevel::Read);
        mf.lock(LockLevel::Write).unwrap();
        assert_eq!(mf.lock_level(), LockLevel::Write);
        mf.lock(LockLevel::Unlocked).unwrap();
        assert_eq!(mf.lock_level(), LockLevel::Unlocked);
    }

    #[test]
    fn rename_over_swaps_identity() {
        let (_dir, path) = scratch("db");
        let sidecar = path.with_extension("NEW");
        let mut mf = MappedFile::open(&sidecar, true).unwrap();
        mf.write_all_at(b"payload", 0).unwrap();
        mf.rename_over(&path).unwrap();

        assert!(path.exists());
        assert!(!sidecar.exists());
        assert_eq!(mf.path(), path);
        assert_eq!(mf.slice(0, 7).unwrap(), b"payload");
    }
}
