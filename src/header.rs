use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::mapped::MappedFile;

/// Four fixed bytes identifying the family, then the ASCII name padded with
/// NULs to 20 bytes. Readers match this to pick the backend at open time.
pub const MAGIC: [u8; 20] = *b"\xA1\x02\x8B\x0Dskiplog file\0\0\0\0";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: u64 = 64;

const CRC_OFFSET: usize = std::mem::offset_of!(FileHeader, crc);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u32 {
        /// An uncommitted transaction may have written past `current_size`;
        /// the file needs recovery before it can be trusted.
        const DIRTY = 1;
    }
}

/// The 64-byte block at offset 0. All integers big-endian; the CRC is last
/// and covers everything before it.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct FileHeader {
    magic: [u8; 20],
    version: U32,
    generation: U64,
    num_records: U64,
    repack_size: U64,
    current_size: U64,
    flags: U32,
    crc: U32,
}

impl FileHeader {
    fn checksum(&self) -> u32 {
        crc32fast::hash(&self.as_bytes()[..CRC_OFFSET])
    }

    fn check(&self) -> bool {
        self.checksum() == self.crc.get()
    }

    fn recompute_checksum(&mut self) {
        self.crc = self.checksum().into();
    }
}

/// Host-endian working copy of the header, the one the engine mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub generation: u64,
    pub num_records: u64,
    pub repack_size: u64,
    pub current_size: u64,
    pub flags: HeaderFlags,
}

impl Header {
    pub fn new(current_size: u64) -> Self {
        Self {
            generation: 1,
            num_records: 0,
            repack_size: current_size,
            current_size,
            flags: HeaderFlags::empty(),
        }
    }

    pub fn dirty(&self) -> bool {
        self.flags.contains(HeaderFlags::DIRTY)
    }

    /// Read and verify the header block. Every lock acquisition goes through
    /// this, because another process may have committed, compacted, or
    /// replaced the file since we last looked.
    pub fn read(mf: &MappedFile) -> Result<Self> {
        let mut raw = FileHeader::new_zeroed();
        mf.read_exact_at(raw.as_bytes_mut(), 0).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::corrupt(mf.path(), 0, "file shorter than header")
            } else {
                Error::Io(e)
            }
        })?;

        if raw.magic != MAGIC {
            return Err(Error::corrupt(mf.path(), 0, "bad magic"));
        }
        if raw.version.get() > VERSION {
            return Err(Error::corrupt(mf.path(), 0, "version from the future"));
        }
        if !raw.check() {
            return Err(Error::corrupt(mf.path(), 0, "header crc mismatch"));
        }

        Ok(Self {
            generation: raw.generation.get(),
            num_records: raw.num_records.get(),
            repack_size: raw.repack_size.get(),
            current_size: raw.current_size.get(),
            flags: HeaderFlags::from_bits_truncate(raw.flags.get()),
        })
    }

    /// Format and write the header block at offset 0. Durability is the
    /// caller's problem; the commit protocol decides when to fsync.
    pub fn write(&self, mf: &mut MappedFile) -> Result<()> {
        let mut raw = FileHeader {
            magic: MAGIC,
            version: VERSION.into(),
            generation: self.generation.into(),
            num_records: self.num_records.into(),
            repack_size: self.repack_size.into(),
            current_size: self.current_size.into(),
            flags: self.flags.bits().into(),
            crc: 0.into(),
        };
        raw.recompute_checksum();
        mf.write_all_at(raw.as_bytes(), 0)?;
        Ok(())
    }

    /// Write the header and fsync it.
    pub fn commit(&self, mf: &mut MappedFile) -> Result<()> {
        self.write(mf)?;
        mf.commit()?;
        Ok(())
    }
}

/// Does this buffer start with our family magic? Used by backend detection.
pub fn detect(prefix: &[u8]) -> bool {
    prefix.len() >= MAGIC.len() && prefix[..MAGIC.len()] == MAGIC
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_is_exactly_64_bytes() {
        assert_eq!(std::mem::size_of::<FileHeader>(), HEADER_SIZE as usize);
        assert_eq!(CRC_OFFSET, 60);
        assert_eq!(MAGIC.len(), 20);
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut mf = MappedFile::open(&dir.path().join("db"), true).unwrap();

        let mut hdr = Header::new(344);
        hdr.generation = 7;
        hdr.num_records = 3;
        hdr.flags = HeaderFlags::DIRTY;
        hdr.write(&mut mf).unwrap();

        let back = Header::read(&mf).unwrap();
        assert_eq!(back, hdr);
        assert!(back.dirty());
    }

    #[test]
    fn rejects_flipped_bits() {
        let dir = tempfile::tempdir().unwrap();
        let mut mf = MappedFile::open(&dir.path().join("db"), true).unwrap();
        Header::new(344).write(&mut mf).unwrap();

        // Corrupt one byte of the generation field.
        mf.write_all_at(&[0xFF], 25).unwrap();
        assert!(matches!(
            Header::read(&mf),
            Err(Error::Corrupt { offset: 0, .. })
        ));
    }

    #[test]
    fn rejects_future_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut mf = MappedFile::open(&dir.path().join("db"), true).unwrap();
        Header::new(344).write(&mut mf).unwrap();

        let mut raw = FileHeader::new_zeroed();
        mf.read_exact_at(raw.as_bytes_mut(), 0).unwrap();
        raw.version = (VERSION + 1).into();
        raw.recompute_checksum();
        mf.write_all_at(raw.as_bytes(), 0).unwrap();

        assert!(matches!(Header::read(&mf), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn magic_detection() {
        assert!(detect(&MAGIC));
        assert!(detect(b"\xA1\x02\x8B\x0Dskiplog file\0\0\0\0trailing"));
        assert!(!detect(b"\xA1\x02\x8B\x0Dflatfile db\0\0\0\0\0"));
        assert!(!detect(b"short"));
    }
}
