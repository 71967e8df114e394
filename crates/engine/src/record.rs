//! The seven record kinds and their byte codec.
//!
//! ## Binary layout
//!
//! Every record starts on an 8-byte boundary and begins with a 16-byte
//! prefix:
//!
//! ```text
//! [type: u8][level: u8][keylen: u16][vallen: u32][head_crc: u32][tail_crc: u32]
//! ```
//!
//! After the prefix:
//!
//! | Kind       | Fields                                  | Total size  |
//! |------------|-----------------------------------------|-------------|
//! | DUMMY      | 32 pointer slots                        | 272         |
//! | ADD        | L+1 pointer slots                       | 24 + 8·L    |
//! | FATADD     | keylen u64, vallen u64, L+1 slots       | 40 + 8·L    |
//! | REPLACE    | ancestor u64, L+1 slots                 | 32 + 8·L    |
//! | FATREPLACE | keylen u64, vallen u64, ancestor, slots | 48 + 8·L    |
//! | DELETE     | ancestor u64                            | 24          |
//! | COMMIT     | start_offset u64                        | 24          |
//!
//! Slots 0 and 1 are the dual level-0 forward slots; slot `k+1` is the
//! forward pointer for skip level `k`. A record of level `L` participates in
//! the level-0 chain and in skip levels `1..L`. Kinds with a tail append
//! `key NUL value NUL` padded with zeroes to the next 8-byte boundary.
//!
//! The head checksum covers the first 8 prefix bytes and everything after
//! the two checksum fields *except* the dual level-0 slots, which mutate in
//! place as single atomic stores. The tail checksum covers the whole padded
//! tail. The codec never copies key or value bytes on read; views borrow
//! the mapping.

use byteorder::{ByteOrder, LittleEndian};

use crate::checksum::ChecksumEngine;
use crate::error::{badformat, Error, Result};
use crate::header::HEADER_SIZE;

/// Offset of the DUMMY sentinel: immediately after the file header.
pub(crate) const DUMMY_OFFSET: u64 = HEADER_SIZE;
/// Size of the DUMMY: 16-byte prefix plus 32 pointer slots.
pub(crate) const DUMMY_SIZE: u64 = 272;
/// Highest skip level; the DUMMY's level.
pub(crate) const MAX_LEVEL: u8 = 31;
/// Size of DELETE and COMMIT records.
pub(crate) const BARE_RECORD_SIZE: u64 = 24;

/// Largest key an ADD/REPLACE can carry before the fat form is required.
pub(crate) const MAX_THIN_KEYLEN: u64 = u16::MAX as u64;
/// Largest value an ADD/REPLACE can carry before the fat form is required.
pub(crate) const MAX_THIN_VALLEN: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Tag {
    Dummy = 1,
    Add = 2,
    FatAdd = 3,
    Replace = 4,
    FatReplace = 5,
    Delete = 6,
    Commit = 7,
}

impl Tag {
    fn from_byte(b: u8) -> Option<Tag> {
        match b {
            1 => Some(Tag::Dummy),
            2 => Some(Tag::Add),
            3 => Some(Tag::FatAdd),
            4 => Some(Tag::Replace),
            5 => Some(Tag::FatReplace),
            6 => Some(Tag::Delete),
            7 => Some(Tag::Commit),
            _ => None,
        }
    }

    /// Offset of the pointer-slot area relative to the record start, or
    /// `None` for kinds without slots.
    fn slots_rel(self) -> Option<u64> {
        match self {
            Tag::Dummy | Tag::Add => Some(16),
            Tag::Replace => Some(24),
            Tag::FatAdd => Some(32),
            Tag::FatReplace => Some(40),
            Tag::Delete | Tag::Commit => None,
        }
    }

    pub(crate) fn has_tail(self) -> bool {
        matches!(self, Tag::Add | Tag::FatAdd | Tag::Replace | Tag::FatReplace)
    }

    pub(crate) fn has_ancestor(self) -> bool {
        matches!(self, Tag::Replace | Tag::FatReplace | Tag::Delete)
    }
}

/// Rounds up to the next multiple of 8.
pub(crate) fn pad8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Tail length for a key/value pair: key, NUL, value, NUL, padding.
pub(crate) fn tail_len(keylen: u64, vallen: u64) -> u64 {
    pad8(keylen + vallen + 2)
}

/// A decoded, bounds-checked view of one record.
///
/// Key and value slices borrow the mapping; they stay valid until the next
/// operation that may remap it. Pointer slots are *not* captured here — they
/// mutate in place, so they are read through the mapping's atomic accessors
/// using [`RecordView::slot0_offset`] and [`RecordView::level_ptr_offset`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordView<'a> {
    pub offset: u64,
    pub tag: Tag,
    pub level: u8,
    pub keylen: u64,
    pub vallen: u64,
    /// Back-pointer for REPLACE/FATREPLACE/DELETE; for COMMIT this field
    /// holds the transaction's start offset. Zero otherwise.
    pub ancestor: u64,
    head: &'a [u8],
    tail: &'a [u8],
}

impl<'a> RecordView<'a> {
    /// Decodes the record at `offset` within `data` (the full mapping),
    /// refusing to read past `bound`.
    pub(crate) fn parse(data: &'a [u8], offset: u64, bound: u64) -> Result<RecordView<'a>> {
        let bound = bound.min(data.len() as u64);
        if offset % 8 != 0
            || offset < DUMMY_OFFSET
            || offset.checked_add(16).map_or(true, |end| end > bound)
        {
            return Err(badformat!("record offset {offset} out of bounds"));
        }
        let o = offset as usize;
        let prefix = &data[o..o + 16];
        let tag = Tag::from_byte(prefix[0])
            .ok_or_else(|| badformat!("unknown record type {} at offset {offset}", prefix[0]))?;
        let level = prefix[1];
        match tag {
            Tag::Dummy => {
                if level != MAX_LEVEL || offset != DUMMY_OFFSET {
                    return Err(badformat!("misplaced dummy record at offset {offset}"));
                }
            }
            Tag::Add | Tag::FatAdd | Tag::Replace | Tag::FatReplace => {
                if level < 1 || level > MAX_LEVEL {
                    return Err(badformat!("record level {level} at offset {offset}"));
                }
            }
            Tag::Delete | Tag::Commit => {
                if level != 0 {
                    return Err(badformat!("record level {level} at offset {offset}"));
                }
            }
        }

        let head_len = head_len(tag, level);
        if offset + head_len > bound {
            // head_len is at most DUMMY_SIZE, so this cannot overflow
            return Err(badformat!("truncated record head at offset {offset}"));
        }
        let head = &data[o..o + head_len as usize];

        let (keylen, vallen) = match tag {
            Tag::Add | Tag::Replace => (
                LittleEndian::read_u16(&prefix[2..4]) as u64,
                LittleEndian::read_u32(&prefix[4..8]) as u64,
            ),
            Tag::FatAdd | Tag::FatReplace => (
                LittleEndian::read_u64(&head[16..24]),
                LittleEndian::read_u64(&head[24..32]),
            ),
            _ => (0, 0),
        };

        let ancestor = match tag {
            Tag::Replace => LittleEndian::read_u64(&head[16..24]),
            Tag::FatReplace => LittleEndian::read_u64(&head[32..40]),
            Tag::Delete | Tag::Commit => LittleEndian::read_u64(&head[16..24]),
            _ => 0,
        };

        let tail = if tag.has_tail() {
            // lengths come straight off disk; treat arithmetic overflow as
            // corruption rather than trusting it
            let tail_end = keylen
                .checked_add(vallen)
                .and_then(|n| n.checked_add(2 + 7)) // separators + padding
                .map(|n| n & !7)
                .and_then(|tlen| (offset + head_len).checked_add(tlen));
            match tail_end {
                Some(end) if end <= bound => {
                    &data[o + head_len as usize..(end - offset) as usize + o]
                }
                _ => return Err(badformat!("truncated record tail at offset {offset}")),
            }
        } else {
            &[]
        };

        Ok(RecordView {
            offset,
            tag,
            level,
            keylen,
            vallen,
            ancestor,
            head,
            tail,
        })
    }

    pub(crate) fn key(&self) -> &'a [u8] {
        &self.tail[..self.keylen as usize]
    }

    pub(crate) fn value(&self) -> &'a [u8] {
        let start = self.keylen as usize + 1;
        &self.tail[start..start + self.vallen as usize]
    }

    /// Total on-disk size: head plus padded tail.
    pub(crate) fn size(&self) -> u64 {
        self.head.len() as u64 + self.tail.len() as u64
    }

    /// Absolute file offset of level-0 slot 0 (slot 1 is 8 bytes later).
    pub(crate) fn slot0_offset(&self) -> Option<u64> {
        self.tag.slots_rel().map(|rel| self.offset + rel)
    }

    /// Absolute file offset of the forward pointer for skip level `k`
    /// (1-based), if this record participates in that level.
    pub(crate) fn level_ptr_offset(&self, k: u8) -> Option<u64> {
        if k == 0 || k >= self.level {
            return None;
        }
        self.slot0_offset().map(|s| s + 8 * (k as u64 + 1))
    }

    /// Verifies the head checksum. Only meaningful in quiescent contexts
    /// (recovery, consistency check): skip-level pointers are covered and
    /// may legitimately be mid-rewrite under the writer's exclusive lock.
    pub(crate) fn verify_head(&self, engine: &ChecksumEngine) -> Result<()> {
        if !engine.verifies() {
            return Ok(());
        }
        let stored = LittleEndian::read_u32(&self.head[8..12]);
        if stored != head_checksum_of(self.head, self.tag, engine) {
            return Err(Error::BadChecksum(self.offset));
        }
        Ok(())
    }

    /// Recomputes and stores the head checksum after an in-place pointer
    /// rewrite. The head slice views the live mapping, so it already
    /// reflects the rewritten pointer.
    pub(crate) fn refresh_head_checksum(
        &self,
        map: &crate::mapfile::MapFile,
        engine: &ChecksumEngine,
    ) -> Result<()> {
        let crc = head_checksum_of(self.head, self.tag, engine);
        map.store_u32(self.offset + 8, crc)
    }

    /// Verifies the tail checksum. Tails are immutable once appended, so
    /// this is safe on every read path.
    pub(crate) fn verify_tail(&self, engine: &ChecksumEngine) -> Result<()> {
        if !engine.verifies() || !self.tag.has_tail() {
            return Ok(());
        }
        let stored = LittleEndian::read_u32(&self.head[12..16]);
        if stored != engine.sum(self.tail) {
            return Err(Error::BadChecksum(self.offset));
        }
        Ok(())
    }
}

fn head_len(tag: Tag, level: u8) -> u64 {
    match tag {
        Tag::Dummy => DUMMY_SIZE,
        Tag::Add => 16 + 8 * (level as u64 + 1),
        Tag::FatAdd => 32 + 8 * (level as u64 + 1),
        Tag::Replace => 24 + 8 * (level as u64 + 1),
        Tag::FatReplace => 40 + 8 * (level as u64 + 1),
        Tag::Delete | Tag::Commit => BARE_RECORD_SIZE,
    }
}

/// Head checksum over `head` bytes: the 8 identifying prefix bytes plus the
/// post-checksum fields, with the dual level-0 slots cut out.
pub(crate) fn head_checksum_of(head: &[u8], tag: Tag, engine: &ChecksumEngine) -> u32 {
    match tag.slots_rel() {
        Some(rel) => {
            let rel = rel as usize;
            engine.sum_parts(&[&head[..8], &head[16..rel], &head[rel + 16..]])
        }
        None => engine.sum_parts(&[&head[..8], &head[16..]]),
    }
}

/// Builder for the append image of one record.
pub(crate) struct RecordBuilder {
    buf: Vec<u8>,
    tag: Tag,
}

impl RecordBuilder {
    /// Encodes the DUMMY sentinel with all pointer slots nil.
    pub(crate) fn dummy(engine: &ChecksumEngine) -> Vec<u8> {
        let mut b = RecordBuilder {
            buf: Vec::with_capacity(DUMMY_SIZE as usize),
            tag: Tag::Dummy,
        };
        b.prefix(Tag::Dummy, MAX_LEVEL, 0, 0);
        b.buf.resize(DUMMY_SIZE as usize, 0);
        b.finish(engine)
    }

    /// Encodes an ADD/FATADD (no ancestor) or REPLACE/FATREPLACE. The fat
    /// form is chosen exactly when a thin length field would overflow.
    /// `slots` holds the dual level-0 slots followed by the skip-level
    /// pointers; its length fixes the record's level.
    pub(crate) fn data(
        key: &[u8],
        value: &[u8],
        ancestor: Option<u64>,
        slots: &[u64],
        engine: &ChecksumEngine,
    ) -> Vec<u8> {
        let (keylen, vallen) = (key.len() as u64, value.len() as u64);
        let fat = keylen > MAX_THIN_KEYLEN || vallen > MAX_THIN_VALLEN;
        let level = (slots.len() - 1) as u8;
        let tag = match (fat, ancestor.is_some()) {
            (false, false) => Tag::Add,
            (true, false) => Tag::FatAdd,
            (false, true) => Tag::Replace,
            (true, true) => Tag::FatReplace,
        };

        let total = head_len(tag, level) + tail_len(keylen, vallen);
        let mut b = RecordBuilder {
            buf: Vec::with_capacity(total as usize),
            tag,
        };
        if fat {
            b.prefix(tag, level, 0, 0);
            b.buf.extend_from_slice(&keylen.to_le_bytes());
            b.buf.extend_from_slice(&vallen.to_le_bytes());
        } else {
            b.prefix(tag, level, keylen as u16, vallen as u32);
        }
        if let Some(a) = ancestor {
            b.buf.extend_from_slice(&a.to_le_bytes());
        }
        for slot in slots {
            b.buf.extend_from_slice(&slot.to_le_bytes());
        }

        // tail: key NUL value NUL padding
        b.buf.extend_from_slice(key);
        b.buf.push(0);
        b.buf.extend_from_slice(value);
        b.buf.push(0);
        b.buf.resize(total as usize, 0);
        b.finish(engine)
    }

    pub(crate) fn delete(ancestor: u64, engine: &ChecksumEngine) -> Vec<u8> {
        Self::bare(Tag::Delete, ancestor, engine)
    }

    pub(crate) fn commit(start_offset: u64, engine: &ChecksumEngine) -> Vec<u8> {
        Self::bare(Tag::Commit, start_offset, engine)
    }

    fn bare(tag: Tag, word: u64, engine: &ChecksumEngine) -> Vec<u8> {
        let mut b = RecordBuilder {
            buf: Vec::with_capacity(BARE_RECORD_SIZE as usize),
            tag,
        };
        b.prefix(tag, 0, 0, 0);
        b.buf.extend_from_slice(&word.to_le_bytes());
        b.finish(engine)
    }

    fn prefix(&mut self, tag: Tag, level: u8, keylen: u16, vallen: u32) {
        self.buf.push(tag as u8);
        self.buf.push(level);
        self.buf.extend_from_slice(&keylen.to_le_bytes());
        self.buf.extend_from_slice(&vallen.to_le_bytes());
        // checksum fields, stamped in finish()
        self.buf.extend_from_slice(&[0u8; 8]);
    }

    fn finish(mut self, engine: &ChecksumEngine) -> Vec<u8> {
        let head_len = head_len(self.tag, self.buf[1]) as usize;
        let head_crc = head_checksum_of(&self.buf[..head_len], self.tag, engine);
        LittleEndian::write_u32(&mut self.buf[8..12], head_crc);
        if self.tag.has_tail() {
            let tail_crc = engine.sum(&self.buf[head_len..]);
            LittleEndian::write_u32(&mut self.buf[12..16], tail_crc);
        }
        debug_assert_eq!(self.buf.len() % 8, 0);
        self.buf
    }
}
