//! Skiplist engine: key location, the dual level-0 slot discipline, and the
//! caching position used by cursors and sorted bulk inserts.
//!
//! The level-0 chain is the authoritative record list. Each participating
//! record carries *two* level-0 forward slots; a reader picks the committed
//! one with [`advance0`], and the writer's [`set_level0`] always overwrites
//! the slot that does **not** point into committed data. Publication of a
//! whole transaction therefore needs no journal: every in-place mutation is
//! a single aligned 64-bit store whose old value survives in the sibling
//! slot until the commit point moves past it.
//!
//! Skip levels 1..31 are an acceleration structure only. They may pass
//! through superseded records (which keep their key, so comparisons stay
//! valid); correctness never depends on them.

use std::cmp::Ordering;

use rand::rngs::SmallRng;
use rand::Rng;

use crate::checksum::ChecksumEngine;
use crate::error::{badformat, internal, Result};
use crate::mapfile::MapFile;
use crate::record::{RecordView, Tag, DUMMY_OFFSET, MAX_LEVEL};

/// A key comparator. The default is byte-lexicographic order; a caller may
/// install its own at creation time, which is recorded in the header flags.
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

/// The default byte-order comparator.
pub fn byte_order(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Everything a walk needs: the mapping, the comparator, the traversal
/// bound, and the highest level worth searching.
pub(crate) struct SkipCtx<'a> {
    pub map: &'a MapFile,
    pub cmp: Comparator,
    /// Pointers at or beyond this offset are treated as nil.
    pub end: u64,
    pub engine: &'a ChecksumEngine,
    pub max_level: u8,
}

impl<'a> SkipCtx<'a> {
    pub(crate) fn decode(&self, offset: u64) -> Result<RecordView<'a>> {
        RecordView::parse(self.map.as_slice(), offset, self.end)
    }

    /// Decodes the record at `offset`; if it is a DELETE, follows the
    /// ancestor to the tombstoned record that still carries the chain.
    /// Returns the carrier and the tombstone offset (zero if none).
    pub(crate) fn resolve_carrier(&self, offset: u64) -> Result<(RecordView<'a>, u64)> {
        let v = self.decode(offset)?;
        if v.tag == Tag::Delete {
            let victim = self.decode(v.ancestor)?;
            if !victim.tag.has_tail() {
                return Err(badformat!(
                    "delete at {offset} points at a {:?} record",
                    victim.tag
                ));
            }
            Ok((victim, offset))
        } else {
            Ok((v, 0))
        }
    }

    /// Selects the live successor from the dual level-0 slots: a slot that
    /// refers past `end` is not a candidate; of two candidates the greater
    /// (more recently appended) wins. Returns 0 at the end of the chain.
    pub(crate) fn advance0(&self, rec: &RecordView<'_>) -> Result<u64> {
        let s = rec
            .slot0_offset()
            .ok_or_else(|| internal!("advance0 on a {:?} record", rec.tag))?;
        let s0 = self.map.load_u64(s)?;
        let s1 = self.map.load_u64(s + 8)?;
        let next = if s0 >= self.end {
            s1
        } else if s1 >= self.end {
            s0
        } else {
            s0.max(s1)
        };
        Ok(if next >= self.end { 0 } else { next })
    }

    /// The level-`k` forward pointer, normalised to 0 when nil or out of
    /// bounds for this walk.
    pub(crate) fn level_ptr(&self, rec: &RecordView<'_>, k: u8) -> Result<u64> {
        let off = rec
            .level_ptr_offset(k)
            .ok_or_else(|| badformat!("record at {} has no level-{k} pointer", rec.offset))?;
        let ptr = self.map.load_u64(off)?;
        Ok(if ptr == 0 || ptr >= self.end { 0 } else { ptr })
    }
}

/// A cached position in the list: the located key, the matched record (0 on
/// miss), an in-front tombstone if one exists, and the predecessor at every
/// level. Owned by a transaction or cursor and revalidated against the
/// traversal end and mapping epoch before reuse.
#[derive(Debug, Clone)]
pub(crate) struct Loc {
    pub key: Vec<u8>,
    pub match_off: u64,
    pub deleted_off: u64,
    pub backloc: [u64; MAX_LEVEL as usize],
    pub end: u64,
    pub epoch: u64,
    pub valid: bool,
}

impl Default for Loc {
    fn default() -> Self {
        Loc {
            key: Vec::new(),
            match_off: 0,
            deleted_off: 0,
            backloc: [DUMMY_OFFSET; MAX_LEVEL as usize],
            end: 0,
            epoch: 0,
            valid: false,
        }
    }
}

impl Loc {
    fn reset(&mut self, end: u64, epoch: u64) {
        self.match_off = 0;
        self.deleted_off = 0;
        self.backloc = [DUMMY_OFFSET; MAX_LEVEL as usize];
        self.end = end;
        self.epoch = epoch;
        self.valid = true;
    }

    /// Converts an exact-match position into a just-before position: the
    /// match becomes the predecessor at every level it participates in.
    pub(crate) fn fold_match(&mut self, level: u8) {
        if self.match_off != 0 {
            for k in 0..level as usize {
                self.backloc[k] = self.match_off;
            }
            self.match_off = 0;
            self.deleted_off = 0;
        }
    }

    /// The record whose level-0 slots lead onward from this position.
    pub(crate) fn carrier(&self) -> u64 {
        if self.match_off != 0 {
            self.match_off
        } else {
            self.backloc[0]
        }
    }
}

/// Full walk from the DUMMY. Records the predecessor at every level, the
/// exact match if any, and an in-front DELETE.
pub(crate) fn locate(ctx: &SkipCtx<'_>, key: &[u8], loc: &mut Loc, epoch: u64) -> Result<()> {
    loc.reset(ctx.end, epoch);
    loc.key.clear();
    loc.key.extend_from_slice(key);

    let dummy = ctx.decode(DUMMY_OFFSET)?;
    let mut cur = dummy;

    if !key.is_empty() {
        // memo for the future-offset optimisation: when the pointer at the
        // next level down is the same offset, the comparison outcome is too
        let mut memo_off = 0u64;
        let mut memo_less = false;

        let top = ctx.max_level.clamp(1, MAX_LEVEL);
        for k in (1..top).rev() {
            loop {
                let ptr = ctx.level_ptr(&cur, k)?;
                if ptr == 0 {
                    break;
                }
                let less = if ptr == memo_off {
                    memo_less
                } else {
                    let v = ctx.decode(ptr)?;
                    let less = (ctx.cmp)(v.key(), key) == Ordering::Less;
                    memo_off = ptr;
                    memo_less = less;
                    less
                };
                if !less {
                    break;
                }
                cur = ctx.decode(ptr)?;
            }
            loc.backloc[k as usize] = cur.offset;
        }
    }
    // an empty search key needs no descent: under the default order it
    // sorts before everything, and under any comparator the level-0 walk
    // below remains correct on its own

    loop {
        let next = ctx.advance0(&cur)?;
        if next == 0 {
            break;
        }
        let (carrier, del) = ctx.resolve_carrier(next)?;
        match (ctx.cmp)(carrier.key(), key) {
            Ordering::Less => cur = carrier,
            Ordering::Equal => {
                loc.match_off = carrier.offset;
                loc.deleted_off = del;
                break;
            }
            Ordering::Greater => break,
        }
    }
    loc.backloc[0] = cur.offset;
    Ok(())
}

/// Position-cached lookup. Sequential scans and sorted bulk inserts resolve
/// in O(1); anything else degrades to a full [`locate`].
pub(crate) fn find_loc(ctx: &SkipCtx<'_>, key: &[u8], loc: &mut Loc, epoch: u64) -> Result<()> {
    if !loc.valid || loc.end != ctx.end || loc.epoch != epoch {
        return locate(ctx, key, loc, epoch);
    }
    match (ctx.cmp)(key, &loc.key) {
        // cache hit: the position already describes this key
        Ordering::Equal => Ok(()),
        Ordering::Less => locate(ctx, key, loc, epoch),
        Ordering::Greater => {
            // the searched key may sit right at or right after this
            // position: one advance0 and at most one more comparison
            // settle it, which keeps sorted bulk inserts O(1)
            let carrier = ctx.decode(loc.carrier())?;
            let next = ctx.advance0(&carrier)?;
            let level = if loc.match_off != 0 {
                ctx.decode(loc.match_off)?.level
            } else {
                0
            };
            if next == 0 {
                // past the last record: the folded position is the exact
                // predecessor set for an insert
                loc.fold_match(level);
                loc.key.clear();
                loc.key.extend_from_slice(key);
                return Ok(());
            }
            let (cv, del) = ctx.resolve_carrier(next)?;
            match (ctx.cmp)(cv.key(), key) {
                Ordering::Equal => {
                    loc.fold_match(level);
                    loc.match_off = cv.offset;
                    loc.deleted_off = del;
                    loc.key.clear();
                    loc.key.extend_from_slice(key);
                    Ok(())
                }
                Ordering::Greater => {
                    // a miss just before the successor
                    loc.fold_match(level);
                    loc.key.clear();
                    loc.key.extend_from_slice(key);
                    Ok(())
                }
                Ordering::Less => locate(ctx, key, loc, epoch),
            }
        }
    }
}

/// Moves a position to the next record in level-0 order. On return,
/// `match_off == 0` means the chain is exhausted; otherwise the position
/// names the next carrier (with `deleted_off` set when a tombstone fronts
/// it). Re-locates first if the traversal end or mapping changed since the
/// position was computed.
pub(crate) fn advance_loc(ctx: &SkipCtx<'_>, loc: &mut Loc, epoch: u64) -> Result<()> {
    if !loc.valid || loc.end != ctx.end || loc.epoch != epoch {
        let key = std::mem::take(&mut loc.key);
        locate(ctx, &key, loc, epoch)?;
    }
    let level = if loc.match_off != 0 {
        ctx.decode(loc.match_off)?.level
    } else {
        0
    };
    loc.fold_match(level);

    let carrier = ctx.decode(loc.backloc[0])?;
    let next = ctx.advance0(&carrier)?;
    if next == 0 {
        loc.match_off = 0;
        loc.deleted_off = 0;
        return Ok(());
    }
    let (cv, del) = ctx.resolve_carrier(next)?;
    loc.match_off = cv.offset;
    loc.deleted_off = del;
    loc.key.clear();
    loc.key.extend_from_slice(cv.key());
    Ok(())
}

/// Writes a new level-0 successor into whichever dual slot does not point
/// into committed data, preserving the committed successor for concurrent
/// readers and for crash recovery.
pub(crate) fn set_level0(
    map: &MapFile,
    rec: &RecordView<'_>,
    new_next: u64,
    committed_size: u64,
) -> Result<()> {
    let s = rec
        .slot0_offset()
        .ok_or_else(|| internal!("set_level0 on a {:?} record", rec.tag))?;
    let s0 = map.load_u64(s)?;
    let s1 = map.load_u64(s + 8)?;
    let use_slot1 = s0 < committed_size && (s1 >= committed_size || s0 > s1);
    map.store_u64(if use_slot1 { s + 8 } else { s }, new_next)
}

/// Repoints the level-`k` forward pointer of `rec` and restamps its head
/// checksum. Writer-exclusive.
pub(crate) fn set_level_ptr(
    map: &MapFile,
    engine: &ChecksumEngine,
    rec: &RecordView<'_>,
    k: u8,
    new_next: u64,
) -> Result<()> {
    let off = rec
        .level_ptr_offset(k)
        .ok_or_else(|| internal!("record at {} has no level-{k} pointer", rec.offset))?;
    map.store_u64(off, new_next)?;
    rec.refresh_head_checksum(map, engine)
}

/// Draws a level for a new record: geometric with p = 1/4, clamped to 31.
pub(crate) fn choose_level(rng: &mut SmallRng) -> u8 {
    let mut level = 1u8;
    while level < MAX_LEVEL && rng.gen_range(0u8..4) == 0 {
        level += 1;
    }
    level
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{ChecksumEngine, ChecksumKind};
    use crate::record::RecordBuilder;
    use rand::SeedableRng;

    fn engine() -> ChecksumEngine {
        ChecksumEngine::new(ChecksumKind::Xxh64, None, true)
    }

    /// Builds a throwaway mapped file holding the DUMMY plus the given
    /// record images, returning the offsets they were appended at.
    fn build_file(images: &[Vec<u8>]) -> (tempfile::TempDir, MapFile, Vec<u64>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skip.db");
        let e = engine();
        let mut size: u64 = DUMMY_OFFSET;
        let dummy = RecordBuilder::dummy(&e);
        size += dummy.len() as u64;
        let mut offsets = Vec::new();
        for img in images {
            offsets.push(size);
            size += img.len() as u64;
        }
        let map = MapFile::open(&path, true, true, true)
            .unwrap()
            .grow(size)
            .unwrap();
        map.write_bytes(DUMMY_OFFSET, &dummy).unwrap();
        let mut at = DUMMY_OFFSET + dummy.len() as u64;
        for img in images {
            map.write_bytes(at, img).unwrap();
            at += img.len() as u64;
        }
        (dir, map, offsets)
    }

    #[test]
    fn advance0_prefers_committed_slot() {
        let e = engine();
        let add = RecordBuilder::data(b"a", b"1", None, &[0, 0], &e);
        let (_dir, map, offs) = build_file(&[add]);
        let rec_off = offs[0];
        let dummy_slot0 = DUMMY_OFFSET + 16;

        // dummy slot0 -> committed record, slot1 -> past the end
        map.store_u64(dummy_slot0, rec_off).unwrap();
        map.store_u64(dummy_slot0 + 8, 10_000).unwrap();
        let end = rec_off + 100;
        let ctx = SkipCtx {
            map: &map,
            cmp: byte_order,
            end,
            engine: &e,
            max_level: 1,
        };
        let dummy = ctx.decode(DUMMY_OFFSET).unwrap();
        assert_eq!(ctx.advance0(&dummy).unwrap(), rec_off);

        // both committed: the greater (fresher) one wins
        map.store_u64(dummy_slot0 + 8, rec_off - 8).unwrap();
        assert_eq!(ctx.advance0(&dummy).unwrap(), rec_off);
    }

    #[test]
    fn set_level0_preserves_the_committed_slot() {
        let e = engine();
        let add = RecordBuilder::data(b"a", b"1", None, &[0, 0], &e);
        let (_dir, map, offs) = build_file(&[add]);
        let committed = offs[0] + 100;
        let slot = DUMMY_OFFSET + 16;

        // slot0 committed, slot1 free: the write must land in slot1
        map.store_u64(slot, offs[0]).unwrap();
        map.store_u64(slot + 8, 0).unwrap();
        let dummy = RecordView::parse(map.as_slice(), DUMMY_OFFSET, map.len()).unwrap();
        set_level0(&map, &dummy, committed + 64, committed).unwrap();
        assert_eq!(map.load_u64(slot).unwrap(), offs[0]);
        assert_eq!(map.load_u64(slot + 8).unwrap(), committed + 64);

        // a second uncommitted store reuses the same slot
        set_level0(&map, &dummy, committed + 128, committed).unwrap();
        assert_eq!(map.load_u64(slot).unwrap(), offs[0]);
        assert_eq!(map.load_u64(slot + 8).unwrap(), committed + 128);
    }

    #[test]
    fn chosen_levels_stay_in_range() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut seen_two = false;
        for _ in 0..10_000 {
            let l = choose_level(&mut rng);
            assert!((1..=MAX_LEVEL).contains(&l));
            if l > 1 {
                seen_two = true;
            }
        }
        assert!(seen_two, "promotion should happen within 10k draws");
    }

    #[test]
    fn locate_walks_the_level0_chain() {
        let e = engine();
        let a = RecordBuilder::data(b"apple", b"1", None, &[0, 0], &e);
        let b = RecordBuilder::data(b"cherry", b"2", None, &[0, 0], &e);
        let (_dir, map, offs) = build_file(&[a, b]);
        // thread dummy -> apple -> cherry
        map.store_u64(DUMMY_OFFSET + 16, offs[0]).unwrap();
        map.store_u64(offs[0] + 16, offs[1]).unwrap();
        let end = map.len();
        let ctx = SkipCtx {
            map: &map,
            cmp: byte_order,
            end,
            engine: &e,
            max_level: 1,
        };

        let mut loc = Loc::default();
        locate(&ctx, b"cherry", &mut loc, 1).unwrap();
        assert_eq!(loc.match_off, offs[1]);
        assert_eq!(loc.backloc[0], offs[0]);

        locate(&ctx, b"banana", &mut loc, 1).unwrap();
        assert_eq!(loc.match_off, 0);
        assert_eq!(loc.backloc[0], offs[0]);

        // empty key: dummy is the predecessor, no match
        locate(&ctx, b"", &mut loc, 1).unwrap();
        assert_eq!(loc.match_off, 0);
        assert_eq!(loc.backloc[0], DUMMY_OFFSET);

        // sequential advance visits both records then exhausts
        locate(&ctx, b"", &mut loc, 1).unwrap();
        advance_loc(&ctx, &mut loc, 1).unwrap();
        assert_eq!(loc.match_off, offs[0]);
        advance_loc(&ctx, &mut loc, 1).unwrap();
        assert_eq!(loc.match_off, offs[1]);
        advance_loc(&ctx, &mut loc, 1).unwrap();
        assert_eq!(loc.match_off, 0);
    }
}
