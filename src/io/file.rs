use std::fs::File;
use std::io::{self, ErrorKind, IoSlice, Result};

/// Positioned I/O over a plain file descriptor. The file cursor is never
/// used, so reads and writes from different call sites cannot interfere.
pub trait FileExt {
    fn len(&self) -> Result<u64>;

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut written = 0;

        while written != buf.len() {
            written += self.write_at(&buf[written..], offset + written as u64)?;
        }

        Ok(())
    }

    fn write_at_vectored(&self, bufs: &[IoSlice], offset: u64) -> Result<usize>;

    /// Vectored write that retries on short writes until every buffer is on
    /// disk. Short pwritev returns land on arbitrary byte boundaries, so the
    /// retry re-slices the remaining tail.
    fn write_all_at_vectored(&self, bufs: &[IoSlice], offset: u64) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut written = self.write_at_vectored(bufs, offset)?;

        while written < total {
            let mut skip = written;
            for buf in bufs {
                if skip < buf.len() {
                    let n = self.write_at(&buf[skip..], offset + written as u64)?;
                    written += n;
                    if skip + n < buf.len() {
                        break;
                    }
                    skip = 0;
                } else {
                    skip -= buf.len();
                }
            }
        }

        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut read = 0;

        while read != buf.len() {
            let n = self.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "unexpected end-of-file",
                ));
            }
            read += n;
        }

        Ok(())
    }

    fn sync_all(&self) -> Result<()>;

    fn set_len(&self, len: u64) -> Result<()>;
}

impl FileExt for File {
    fn len(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(nix::sys::uio::pwrite(self, buf, offset as _)?)
    }

    fn write_at_vectored(&self, bufs: &[IoSlice], offset: u64) -> Result<usize> {
        Ok(nix::sys::uio::pwritev(self, bufs, offset as _)?)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(nix::sys::uio::pread(self, buf, offset as _)?)
    }

    fn sync_all(&self) -> Result<()> {
        File::sync_all(self)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        File::set_len(self, len)
    }
}
