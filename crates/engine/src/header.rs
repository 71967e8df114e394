//! The 96-byte file header.
//!
//! ## Binary layout (all integers little-endian)
//!
//! ```text
//! [magic: 16][version: u32][flags: u32][uuid: 16]
//! [generation: u64][num_records: u64][num_commits: u64][dirty_size: u64]
//! [current_size: u64][repack_size: u64][max_level: u32][crc32: u32]
//! ```
//!
//! `flags` bits 0..2 select the record checksum engine, bit 2 marks an
//! external comparator, and bit 31 is the DIRTY bit — set before the first
//! append of a write transaction and cleared only after the post-commit
//! flush. The trailing CRC32 covers bytes 0..92 and is always CRC32
//! regardless of the record engine.

use byteorder::{ByteOrder, LittleEndian};

use crate::checksum::{header_checksum, ChecksumKind};
use crate::error::{badformat, Error, Result};

pub(crate) const HEADER_SIZE: u64 = 96;
pub(crate) const MAGIC: &[u8; 16] = b"ebbkv database\0\0";
pub(crate) const VERSION: u32 = 1;

const FLAG_CSUM_MASK: u32 = 0x3;
const FLAG_CSUM_XXH64: u32 = 0;
const FLAG_CSUM_NULL: u32 = 1;
const FLAG_CSUM_EXTERNAL: u32 = 2;
const FLAG_EXTERNAL_CMP: u32 = 1 << 2;
const FLAG_DIRTY: u32 = 1 << 31;

/// In-memory copy of the file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub flags: u32,
    pub uuid: [u8; 16],
    pub generation: u64,
    pub num_records: u64,
    pub num_commits: u64,
    pub dirty_size: u64,
    pub current_size: u64,
    pub repack_size: u64,
    pub max_level: u32,
}

impl Header {
    pub(crate) fn new(
        uuid: [u8; 16],
        generation: u64,
        checksum: ChecksumKind,
        external_cmp: bool,
        current_size: u64,
    ) -> Self {
        let mut flags = match checksum {
            ChecksumKind::Xxh64 => FLAG_CSUM_XXH64,
            ChecksumKind::Null => FLAG_CSUM_NULL,
            ChecksumKind::External => FLAG_CSUM_EXTERNAL,
        };
        if external_cmp {
            flags |= FLAG_EXTERNAL_CMP;
        }
        Self {
            flags,
            uuid,
            generation,
            num_records: 0,
            num_commits: 0,
            dirty_size: 0,
            current_size,
            repack_size: current_size,
            max_level: 1,
        }
    }

    /// Decodes and validates a header. The CRC is checked first, then the
    /// magic and version; a reader must not trust any field before this
    /// returns.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(badformat!("file shorter than the {HEADER_SIZE}-byte header"));
        }
        let stored = LittleEndian::read_u32(&buf[92..96]);
        if stored != header_checksum(&buf[..92]) {
            return Err(Error::BadChecksum(0));
        }
        if &buf[..16] != MAGIC {
            return Err(badformat!("bad magic"));
        }
        let version = LittleEndian::read_u32(&buf[16..20]);
        if version != VERSION {
            return Err(badformat!("unsupported version {version}"));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[24..40]);
        Ok(Self {
            flags: LittleEndian::read_u32(&buf[20..24]),
            uuid,
            generation: LittleEndian::read_u64(&buf[40..48]),
            num_records: LittleEndian::read_u64(&buf[48..56]),
            num_commits: LittleEndian::read_u64(&buf[56..64]),
            dirty_size: LittleEndian::read_u64(&buf[64..72]),
            current_size: LittleEndian::read_u64(&buf[72..80]),
            repack_size: LittleEndian::read_u64(&buf[80..88]),
            max_level: LittleEndian::read_u32(&buf[88..92]),
        })
    }

    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[..16].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut buf[16..20], VERSION);
        LittleEndian::write_u32(&mut buf[20..24], self.flags);
        buf[24..40].copy_from_slice(&self.uuid);
        LittleEndian::write_u64(&mut buf[40..48], self.generation);
        LittleEndian::write_u64(&mut buf[48..56], self.num_records);
        LittleEndian::write_u64(&mut buf[56..64], self.num_commits);
        LittleEndian::write_u64(&mut buf[64..72], self.dirty_size);
        LittleEndian::write_u64(&mut buf[72..80], self.current_size);
        LittleEndian::write_u64(&mut buf[80..88], self.repack_size);
        LittleEndian::write_u32(&mut buf[88..92], self.max_level);
        let crc = header_checksum(&buf[..92]);
        LittleEndian::write_u32(&mut buf[92..96], crc);
        buf
    }

    pub(crate) fn checksum_kind(&self) -> Result<ChecksumKind> {
        match self.flags & FLAG_CSUM_MASK {
            FLAG_CSUM_XXH64 => Ok(ChecksumKind::Xxh64),
            FLAG_CSUM_NULL => Ok(ChecksumKind::Null),
            FLAG_CSUM_EXTERNAL => Ok(ChecksumKind::External),
            other => Err(badformat!("unknown checksum engine flag {other}")),
        }
    }

    pub(crate) fn external_comparator(&self) -> bool {
        self.flags & FLAG_EXTERNAL_CMP != 0
    }

    pub(crate) fn dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        if dirty {
            self.flags |= FLAG_DIRTY;
        } else {
            self.flags &= !FLAG_DIRTY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        let mut h = Header::new([7u8; 16], 1, ChecksumKind::Xxh64, false, 368);
        h.num_records = 12;
        h.dirty_size = 4096;
        h.max_level = 5;
        h
    }

    #[test]
    fn roundtrip() {
        let h = sample();
        let buf = h.encode();
        assert_eq!(Header::decode(&buf).unwrap(), h);
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let mut buf = sample().encode();
        buf[40] ^= 0x01;
        assert!(matches!(Header::decode(&buf), Err(Error::BadChecksum(0))));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = sample().encode();
        buf[0] = b'X';
        // fix up the crc so only the magic is wrong
        let crc = header_checksum(&buf[..92]);
        LittleEndian::write_u32(&mut buf[92..96], crc);
        assert!(matches!(Header::decode(&buf), Err(Error::BadFormat(_))));
    }

    #[test]
    fn dirty_bit_roundtrips() {
        let mut h = sample();
        assert!(!h.dirty());
        h.set_dirty(true);
        let buf = h.encode();
        assert!(Header::decode(&buf).unwrap().dirty());
        h.set_dirty(false);
        assert!(!h.dirty());
    }
}
