//! Crash recovery: scrubbing pointers left behind by an interrupted
//! transaction.
//!
//! Recovery is safe for exactly one reason: an in-place pointer store
//! during a transaction only ever writes an offset at or beyond the
//! committed size, and [`set_level0`](crate::skiplist::set_level0) always
//! leaves the slot that points into committed data untouched. So after a
//! dirty shutdown, zeroing every pointer that refers past `current_size`
//! restores the exact committed chain. Abort uses the same procedure.
//!
//! Skip-level pointers are scrubbed too, at every level, since replacement
//! re-links predecessors there in place; the head checksum is restamped
//! after each zeroed pointer.

use crate::checksum::ChecksumEngine;
use crate::error::{badformat, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::mapfile::MapFile;
use crate::record::{RecordView, Tag, DUMMY_OFFSET, MAX_LEVEL};
use crate::skiplist::{Comparator, SkipCtx};

/// Runs full recovery: scrub, re-verify the committed chain, clear the
/// DIRTY bit, flush. Caller holds the exclusive data lock. Returns the
/// cleaned header.
pub(crate) fn recover(map: &MapFile, engine: &ChecksumEngine, cmp: Comparator) -> Result<Header> {
    let mut header = Header::decode(map.bytes(0, HEADER_SIZE)?)?;
    tracing::debug!(
        current_size = header.current_size,
        "recovering from dirty shutdown"
    );
    scrub(map, engine, header.current_size)?;
    verify_committed_chain(map, engine, cmp, &header)?;
    header.set_dirty(false);
    map.write_bytes(0, &header.encode())?;
    map.flush_all()?;
    Ok(header)
}

/// Zeroes every forward pointer that refers at or past `current_size`.
/// Also used by transaction abort, where `current_size` is the committed
/// size at transaction begin.
pub(crate) fn scrub(map: &MapFile, engine: &ChecksumEngine, current_size: u64) -> Result<()> {
    let data = map.as_slice();
    let dummy = RecordView::parse(data, DUMMY_OFFSET, current_size)?;

    // skip levels: truncate each chain at the first uncommitted pointer
    for k in (1..MAX_LEVEL).rev() {
        let mut cur = dummy;
        loop {
            let Some(ptr_off) = cur.level_ptr_offset(k) else {
                break;
            };
            let ptr = map.load_u64(ptr_off)?;
            if ptr == 0 {
                break;
            }
            if ptr >= current_size {
                map.store_u64(ptr_off, 0)?;
                cur.refresh_head_checksum(map, engine)?;
                break;
            }
            cur = RecordView::parse(data, ptr, current_size)?;
        }
    }

    // level 0: walk the carriers and zero dead slots in both positions
    let mut cur = dummy;
    loop {
        let slot = cur
            .slot0_offset()
            .ok_or_else(|| badformat!("chain carrier without slots at {}", cur.offset))?;
        let mut s0 = map.load_u64(slot)?;
        let mut s1 = map.load_u64(slot + 8)?;
        if s0 >= current_size {
            map.store_u64(slot, 0)?;
            s0 = 0;
        }
        if s1 >= current_size {
            map.store_u64(slot + 8, 0)?;
            s1 = 0;
        }
        let next = s0.max(s1);
        if next == 0 {
            break;
        }
        let v = RecordView::parse(data, next, current_size)?;
        cur = if v.tag == Tag::Delete {
            RecordView::parse(data, v.ancestor, current_size)?
        } else {
            v
        };
    }
    Ok(())
}

/// Walks the committed level-0 chain end to end, verifying checksums and
/// key order. Failure means the file is structurally damaged beyond what
/// recovery can repair.
fn verify_committed_chain(
    map: &MapFile,
    engine: &ChecksumEngine,
    cmp: Comparator,
    header: &Header,
) -> Result<()> {
    let ctx = SkipCtx {
        map,
        cmp,
        end: header.current_size,
        engine,
        max_level: header.max_level.min(MAX_LEVEL as u32) as u8,
    };
    let mut cur = ctx.decode(DUMMY_OFFSET)?;
    let mut prev_key: Option<Vec<u8>> = None;
    loop {
        let next = ctx.advance0(&cur)?;
        if next == 0 {
            return Ok(());
        }
        let (carrier, deleted) = ctx.resolve_carrier(next)?;
        if deleted != 0 {
            ctx.decode(deleted)?.verify_head(engine)?;
        }
        carrier.verify_head(engine)?;
        carrier.verify_tail(engine)?;
        if let Some(prev) = &prev_key {
            if cmp(prev, carrier.key()) != std::cmp::Ordering::Less {
                return Err(badformat!(
                    "key order violated at offset {}",
                    carrier.offset
                ));
            }
        }
        prev_key = Some(carrier.key().to_vec());
        cur = carrier;
    }
}
