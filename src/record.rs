use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::header::HEADER_SIZE;
use crate::mapped::MappedFile;

/// Highest skiplist level a record can carry. The dummy always has it.
pub(crate) const MAX_LEVEL: u8 = 31;
/// Pointer slots of a maximum-level record: two for level 0, one per level
/// above it.
pub(crate) const MAX_SLOTS: usize = MAX_LEVEL as usize + 2;
/// The dummy sits immediately after the file header and is the head of the
/// list at every level.
pub(crate) const DUMMY_OFFSET: u64 = HEADER_SIZE;

const KEY_LEN_EXT: u16 = u16::MAX;
const VAL_LEN_EXT: u32 = u32::MAX;
const ZEROS: [u8; 8] = [0; 8];

pub(crate) fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordType {
    /// Sentinel head of the skiplist. Exactly one per file, never deleted.
    Dummy,
    /// A live key/value pair.
    Key,
    /// Tombstone: carries the deleted key, linked into the level-0 chain in
    /// place of the record it deletes.
    Delete,
    /// Transaction terminator; slot 0 points at the first record of the
    /// transaction it commits.
    Commit,
}

impl RecordType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'=' => Some(RecordType::Dummy),
            b'+' => Some(RecordType::Key),
            b'-' => Some(RecordType::Delete),
            b'$' => Some(RecordType::Commit),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            RecordType::Dummy => b'=',
            RecordType::Key => b'+',
            RecordType::Delete => b'-',
            RecordType::Commit => b'$',
        }
    }
}

/// Fixed 8-byte front of every record. Lengths hitting the sentinel values
/// spill into 64-bit extensions that follow this block.
#[repr(C)]
#[derive(Debug, AsBytes, FromBytes, FromZeroes)]
struct Prolog {
    rtype: u8,
    level: u8,
    key_len: U16,
    val_len: U32,
}

/// Decoded record. Plain data, no borrows into the map: key and value are
/// addressed by offset so the map can be remapped between uses.
#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub offset: u64,
    pub rtype: RecordType,
    pub level: u8,
    pub key_len: u64,
    pub val_len: u64,
    /// Slots 0 and 1 are the level-0 pair; slot 1+i is the level-i pointer.
    pub ptrs: [u64; MAX_SLOTS],
    pub tail_crc: u32,
    pub key_offset: u64,
    pub val_offset: u64,
    /// Total encoded length, 8-byte aligned.
    pub len: u64,
}

/// The live half of a level-0 slot pair. Offsets at or past the committed
/// size were written by the in-flight transaction and win outright; among
/// peers the greater offset is the newer link. Zero means end of chain.
pub(crate) fn live_level0(s0: u64, s1: u64, current_size: u64) -> u64 {
    let pair = [s0, s1];
    pair[live_level0_slot(s0, s1, current_size)]
}

fn live_level0_slot(s0: u64, s1: u64, current_size: u64) -> usize {
    let fresh0 = s0 != 0 && s0 >= current_size;
    let fresh1 = s1 != 0 && s1 >= current_size;
    match (fresh0, fresh1) {
        (true, false) => 0,
        (false, true) => 1,
        _ => {
            if s0 >= s1 {
                0
            } else {
                1
            }
        }
    }
}

impl Record {
    /// A fresh record with its layout fields computed for `offset`. Pointers
    /// start zeroed; CRCs are filled in by `tail_crc`/`prepare_record`.
    pub fn with_layout(rtype: RecordType, level: u8, offset: u64, key_len: u64, val_len: u64) -> Self {
        let mut rec = Self {
            offset,
            rtype,
            level,
            key_len,
            val_len,
            ptrs: [0; MAX_SLOTS],
            tail_crc: 0,
            key_offset: 0,
            val_offset: 0,
            len: 0,
        };
        rec.key_offset = offset + rec.header_len();
        rec.val_offset = rec.key_offset + key_len;
        rec.len = rec.header_len() + align8(key_len + val_len);
        rec
    }

    pub fn dummy() -> Self {
        Self::with_layout(RecordType::Dummy, MAX_LEVEL, DUMMY_OFFSET, 0, 0)
    }

    pub fn slots(&self) -> usize {
        self.level as usize + 2
    }

    fn header_len(&self) -> u64 {
        let mut len = 8;
        if self.key_len >= KEY_LEN_EXT as u64 {
            len += 8;
        }
        if self.val_len >= VAL_LEN_EXT as u64 {
            len += 8;
        }
        len + self.slots() as u64 * 8 + 8
    }

    /// Forward pointer at `level`, honoring the level-0 slot pair.
    pub fn next_at(&self, level: usize, current_size: u64) -> u64 {
        if level == 0 {
            live_level0(self.ptrs[0], self.ptrs[1], current_size)
        } else {
            self.ptrs[level + 1]
        }
    }

    /// Rewrite the forward pointer at `level`. Level 0 goes through the slot
    /// pair: a committed record keeps its committed live slot intact and
    /// scribbles on the other one, so aborting the transaction (truncate to
    /// `current_size`, zero dangling slots) restores the old chain. A record
    /// the transaction itself appended has no committed slot to protect.
    pub fn set_next(&mut self, level: usize, target: u64, current_size: u64) {
        if level > 0 {
            self.ptrs[level + 1] = target;
            return;
        }

        let live = live_level0_slot(self.ptrs[0], self.ptrs[1], current_size);
        let slot = if self.offset >= current_size {
            live
        } else if self.ptrs[live] != 0 && self.ptrs[live] >= current_size {
            // Already redirected by this transaction; keep using its slot.
            live
        } else {
            1 - live
        };
        self.ptrs[slot] = target;
    }

    pub fn key<'m>(&self, mf: &'m MappedFile) -> Result<&'m [u8]> {
        mf.slice(self.key_offset, self.key_len)
            .ok_or_else(|| Error::corrupt(mf.path(), self.offset, "key past end of file"))
    }

    pub fn value<'m>(&self, mf: &'m MappedFile) -> Result<&'m [u8]> {
        mf.slice(self.val_offset, self.val_len)
            .ok_or_else(|| Error::corrupt(mf.path(), self.offset, "value past end of file"))
    }

    /// Decode the record at `offset`, verifying bounds and the head CRC.
    /// Tail verification is deferred until the payload is consumed.
    pub fn decode(mf: &MappedFile, offset: u64) -> Result<Self> {
        let corrupt = |reason| Error::corrupt(mf.path(), offset, reason);

        let prolog_bytes = mf
            .slice(offset, 8)
            .ok_or_else(|| corrupt("record prolog past end of file"))?;
        let prolog = Prolog::read_from(prolog_bytes).ok_or_else(|| corrupt("short prolog"))?;

        let rtype = RecordType::from_byte(prolog.rtype).ok_or_else(|| corrupt("unknown record type"))?;
        if prolog.level > MAX_LEVEL {
            return Err(corrupt("level out of range"));
        }

        let ext_key = prolog.key_len.get() == KEY_LEN_EXT;
        let ext_val = prolog.val_len.get() == VAL_LEN_EXT;
        let slots = prolog.level as u64 + 2;
        let header_len = 8 + u64::from(ext_key) * 8 + u64::from(ext_val) * 8 + slots * 8 + 8;

        let hdr = mf
            .slice(offset, header_len)
            .ok_or_else(|| corrupt("record header past end of file"))?;

        let mut pos = 8usize;
        let key_len = if ext_key {
            read_be_u64(hdr, &mut pos)
        } else {
            prolog.key_len.get() as u64
        };
        let val_len = if ext_val {
            read_be_u64(hdr, &mut pos)
        } else {
            prolog.val_len.get() as u64
        };

        let mut ptrs = [0u64; MAX_SLOTS];
        for slot in ptrs.iter_mut().take(slots as usize) {
            *slot = read_be_u64(hdr, &mut pos);
        }

        let head_crc = read_be_u32(hdr, &mut pos);
        let tail_crc = read_be_u32(hdr, &mut pos);
        if crc32fast::hash(&hdr[..header_len as usize - 8]) != head_crc {
            return Err(corrupt("record head crc mismatch"));
        }

        // Hostile length fields must not be able to wrap the arithmetic.
        if key_len > mf.len() || val_len > mf.len() {
            return Err(corrupt("record length overflow"));
        }
        let len = header_len + align8(key_len + val_len);
        if offset + len > mf.len() {
            return Err(corrupt("record body past end of file"));
        }

        Ok(Self {
            offset,
            rtype,
            level: prolog.level,
            key_len,
            val_len,
            ptrs,
            tail_crc,
            key_offset: offset + header_len,
            val_offset: offset + header_len + key_len,
            len,
        })
    }

    /// CRC32 over key ‖ value ‖ alignment padding, the checksum the record
    /// tail carries.
    pub fn payload_crc(key: &[u8], value: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key);
        hasher.update(value);
        let pad = align8((key.len() + value.len()) as u64) - (key.len() + value.len()) as u64;
        hasher.update(&ZEROS[..pad as usize]);
        hasher.finalize()
    }

    /// Verify the deferred tail CRC against the mapped payload.
    pub fn check_tail(&self, mf: &MappedFile) -> Result<()> {
        let padded = align8(self.key_len + self.val_len);
        let payload = mf
            .slice(self.key_offset, padded)
            .ok_or_else(|| Error::corrupt(mf.path(), self.offset, "payload past end of file"))?;
        if crc32fast::hash(payload) != self.tail_crc {
            return Err(Error::corrupt(mf.path(), self.offset, "record tail crc mismatch"));
        }
        Ok(())
    }

    /// Encode everything up to and including the CRC pair. `tail_crc` must
    /// already be set (it is a function of the payload, which the caller
    /// appends separately). The head CRC is computed here, over the encoded
    /// header bytes.
    pub fn prepare(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len() as usize);
        let ext_key = self.key_len >= KEY_LEN_EXT as u64;
        let ext_val = self.val_len >= VAL_LEN_EXT as u64;

        let prolog = Prolog {
            rtype: self.rtype.as_byte(),
            level: self.level,
            key_len: if ext_key {
                KEY_LEN_EXT.into()
            } else {
                (self.key_len as u16).into()
            },
            val_len: if ext_val {
                VAL_LEN_EXT.into()
            } else {
                (self.val_len as u32).into()
            },
        };
        buf.extend_from_slice(prolog.as_bytes());
        if ext_key {
            buf.extend_from_slice(&self.key_len.to_be_bytes());
        }
        if ext_val {
            buf.extend_from_slice(&self.val_len.to_be_bytes());
        }
        for slot in 0..self.slots() {
            buf.extend_from_slice(&self.ptrs[slot].to_be_bytes());
        }
        let head_crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&head_crc.to_be_bytes());
        buf.extend_from_slice(&self.tail_crc.to_be_bytes());
        buf
    }

    /// Alignment padding that must follow the payload on disk.
    pub fn padding(&self) -> &'static [u8] {
        let pad = align8(self.key_len + self.val_len) - (self.key_len + self.val_len);
        &ZEROS[..pad as usize]
    }
}

fn read_be_u64(buf: &[u8], pos: &mut usize) -> u64 {
    let v = U64::read_from_prefix(&buf[*pos..]).unwrap_or_default();
    *pos += 8;
    v.get()
}

fn read_be_u32(buf: &[u8], pos: &mut usize) -> u32 {
    let v = U32::read_from_prefix(&buf[*pos..]).unwrap_or_default();
    *pos += 4;
    v.get()
}

#[cfg(test)]
mod test {
    use super::*;

    fn mf_with(bytes_at_64: &[u8]) -> (tempfile::TempDir, MappedFile) {
        let dir = tempfile::tempdir().unwrap();
        let mut mf = MappedFile::open(&dir.path().join("db"), true).unwrap();
        mf.write_all_at(&[0; HEADER_SIZE as usize], 0).unwrap();
        mf.write_all_at(bytes_at_64, HEADER_SIZE).unwrap();
        (dir, mf)
    }

    fn encode(rec: &Record, key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut out = rec.prepare();
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        out.extend_from_slice(rec.padding());
        out
    }

    #[test]
    fn dummy_layout() {
        let dummy = Record::dummy();
        // 8-byte prolog + 33 pointer slots + crc pair, no payload.
        assert_eq!(dummy.len, 8 + 33 * 8 + 8);
        assert_eq!(dummy.slots(), MAX_SLOTS);

        let mut on_disk = Record::dummy();
        on_disk.tail_crc = Record::payload_crc(b"", b"");
        let (_dir, mf) = mf_with(&encode(&on_disk, b"", b""));

        let back = Record::decode(&mf, DUMMY_OFFSET).unwrap();
        assert_eq!(back.rtype, RecordType::Dummy);
        assert_eq!(back.level, MAX_LEVEL);
        assert_eq!(back.len, 280);
        back.check_tail(&mf).unwrap();
    }

    #[test]
    fn key_record_layout() {
        let mut rec = Record::with_layout(RecordType::Key, 2, DUMMY_OFFSET, 5, 3);
        rec.set_next(0, 1024, 64);
        rec.set_next(1, 2048, 64);
        rec.tail_crc = Record::payload_crc(b"apple", b"red");
        let bytes = encode(&rec, b"apple", b"red");
        // prolog + 4 slots + crcs + align8(5 + 3)
        assert_eq!(bytes.len() as u64, 8 + 4 * 8 + 8 + 8);

        let (_dir, mf) = mf_with(&bytes);
        let back = Record::decode(&mf, DUMMY_OFFSET).unwrap();
        assert_eq!(back.rtype, RecordType::Key);
        assert_eq!(back.key(&mf).unwrap(), b"apple");
        assert_eq!(back.value(&mf).unwrap(), b"red");
        assert_eq!(back.next_at(1, u64::MAX), 2048);
        back.check_tail(&mf).unwrap();
    }

    #[test]
    fn extended_key_length_round_trips_encoding() {
        // Sentinel-sized keys must take the extended form even though the
        // inline field could hold the value.
        let rec = Record::with_layout(RecordType::Key, 0, 0, KEY_LEN_EXT as u64, 1);
        let buf = rec.prepare();
        assert_eq!(&buf[2..4], &KEY_LEN_EXT.to_be_bytes());
        assert_eq!(&buf[8..16], &(KEY_LEN_EXT as u64).to_be_bytes());
        // prolog + ext + 2 slots + crc pair
        assert_eq!(buf.len(), 8 + 8 + 2 * 8 + 8);
    }

    #[test]
    fn head_crc_rejects_pointer_damage() {
        let mut rec = Record::with_layout(RecordType::Key, 0, DUMMY_OFFSET, 1, 1);
        rec.tail_crc = Record::payload_crc(b"k", b"v");
        let bytes = encode(&rec, b"k", b"v");
        let (_dir, mut mf) = mf_with(&bytes);

        // Flip a byte inside the pointer array.
        mf.write_all_at(&[0xAB], HEADER_SIZE + 9).unwrap();
        assert!(matches!(
            Record::decode(&mf, DUMMY_OFFSET),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn tail_crc_rejects_payload_damage() {
        let mut rec = Record::with_layout(RecordType::Key, 0, DUMMY_OFFSET, 5, 0);
        rec.tail_crc = Record::payload_crc(b"fruit", b"");
        let bytes = encode(&rec, b"fruit", b"");
        let (_dir, mut mf) = mf_with(&bytes);

        let back = Record::decode(&mf, DUMMY_OFFSET).unwrap();
        back.check_tail(&mf).unwrap();

        mf.write_all_at(b"X", back.key_offset).unwrap();
        let back = Record::decode(&mf, DUMMY_OFFSET).unwrap();
        assert!(back.check_tail(&mf).is_err());
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut rec = Record::with_layout(RecordType::Key, 3, DUMMY_OFFSET, 4, 100);
        rec.tail_crc = 0;
        let mut bytes = rec.prepare();
        bytes.extend_from_slice(b"key1");
        // Value never written: body runs past end of file.
        let (_dir, mf) = mf_with(&bytes);
        assert!(matches!(
            Record::decode(&mf, DUMMY_OFFSET),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn two_slot_liveness() {
        // Committed file: greater offset wins.
        assert_eq!(live_level0(100, 200, 1000), 200);
        assert_eq!(live_level0(200, 100, 1000), 200);
        assert_eq!(live_level0(0, 0, 1000), 0);
        assert_eq!(live_level0(100, 0, 1000), 100);
        // Uncommitted writes win over anything committed.
        assert_eq!(live_level0(100, 1200, 1000), 1200);
        assert_eq!(live_level0(1200, 100, 1000), 1200);
        // Two uncommitted rewrites: newest wins.
        assert_eq!(live_level0(1200, 1400, 1000), 1400);
    }

    #[test]
    fn set_next_protects_committed_slot() {
        let cs = 1000;
        let mut rec = Record::with_layout(RecordType::Key, 0, 500, 1, 1);
        rec.ptrs[0] = 700;
        rec.ptrs[1] = 300;

        // First rewrite in a transaction lands in the dead slot.
        rec.set_next(0, 1500, cs);
        assert_eq!(rec.ptrs[0], 700);
        assert_eq!(rec.ptrs[1], 1500);
        assert_eq!(rec.next_at(0, cs), 1500);

        // A second rewrite reuses the scratch slot, still sparing slot 0.
        rec.set_next(0, 1800, cs);
        assert_eq!(rec.ptrs[0], 700);
        assert_eq!(rec.ptrs[1], 1800);

        // Records appended by the transaction just write their live slot.
        let mut fresh = Record::with_layout(RecordType::Key, 0, 1500, 1, 1);
        fresh.set_next(0, 1800, cs);
        fresh.set_next(0, 2000, cs);
        assert_eq!(fresh.ptrs[0], 2000);
        assert_eq!(fresh.ptrs[1], 0);
    }
}
