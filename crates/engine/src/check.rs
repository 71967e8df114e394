//! Structural verification and the record dump.

use std::cmp::Ordering;
use std::io::Write;

use crate::error::{badformat, Result};
use crate::record::{RecordView, Tag, DUMMY_OFFSET, MAX_LEVEL};
use crate::skiplist::SkipCtx;
use crate::txn::Txn;

/// Verifies the at-rest invariants inside an active read transaction:
///
/// 1. every chained record decodes and its checksums verify;
/// 2. keys along the level-0 chain strictly increase;
/// 3. each skip-level chain is sorted and only visits records that
///    participate in that level (making it a subsequence of the keys
///    below);
/// 4. ancestor chains point backward, stay on one key, and terminate at
///    an ADD;
/// 5. the header's live-record count matches the chain.
pub(crate) fn run(txn: &Txn<'_>) -> Result<()> {
    let shared = &txn.db.shared;
    let ctx = SkipCtx {
        map: &txn.handle,
        cmp: shared.cmp,
        end: txn.end,
        engine: &shared.engine,
        max_level: txn.header.max_level.min(MAX_LEVEL as u32) as u8,
    };

    // level-0 walk: order, checksums, ancestors, live count
    let mut cur = ctx.decode(DUMMY_OFFSET)?;
    let mut prev_key: Option<Vec<u8>> = None;
    let mut live: u64 = 0;
    loop {
        let next = ctx.advance0(&cur)?;
        if next == 0 {
            break;
        }
        let (carrier, deleted) = ctx.resolve_carrier(next)?;
        carrier.verify_head(ctx.engine)?;
        carrier.verify_tail(ctx.engine)?;
        if deleted != 0 {
            let tomb = ctx.decode(deleted)?;
            tomb.verify_head(ctx.engine)?;
        } else {
            live += 1;
        }
        if let Some(prev) = &prev_key {
            if (ctx.cmp)(prev, carrier.key()) != Ordering::Less {
                return Err(badformat!("key order violated at offset {}", carrier.offset));
            }
        }
        check_ancestors(&ctx, &carrier)?;
        prev_key = Some(carrier.key().to_vec());
        cur = carrier;
    }
    if live != txn.header.num_records {
        return Err(badformat!(
            "header claims {} live records, chain has {live}",
            txn.header.num_records
        ));
    }

    // skip levels: sorted, and every member participates in the level
    for k in 1..ctx.max_level.max(1) {
        let mut cur = ctx.decode(DUMMY_OFFSET)?;
        let mut prev_key: Option<Vec<u8>> = None;
        loop {
            let ptr = ctx.level_ptr(&cur, k)?;
            if ptr == 0 {
                break;
            }
            let v = ctx.decode(ptr)?;
            if v.level <= k {
                return Err(badformat!(
                    "record at {ptr} sits on level {k} but has level {}",
                    v.level
                ));
            }
            if let Some(prev) = &prev_key {
                if (ctx.cmp)(prev, v.key()) != Ordering::Less {
                    return Err(badformat!("level-{k} order violated at offset {ptr}"));
                }
            }
            prev_key = Some(v.key().to_vec());
            cur = v;
        }
    }
    Ok(())
}

/// Every REPLACE/DELETE must point backward at an existing record for the
/// same key, through a finite chain ending at an ADD.
fn check_ancestors(ctx: &SkipCtx<'_>, rec: &RecordView<'_>) -> Result<()> {
    let mut cur = *rec;
    let mut hops = 0u32;
    while cur.tag.has_ancestor() {
        let anc_off = cur.ancestor;
        if anc_off == 0 || anc_off >= cur.offset {
            return Err(badformat!(
                "ancestor {anc_off} of record at {} does not point backward",
                cur.offset
            ));
        }
        let anc = ctx.decode(anc_off)?;
        match anc.tag {
            Tag::Add | Tag::FatAdd | Tag::Replace | Tag::FatReplace => {
                if cur.tag != Tag::Delete
                    && (ctx.cmp)(anc.key(), cur.key()) != Ordering::Equal
                {
                    return Err(badformat!("ancestor key mismatch at offset {}", cur.offset));
                }
            }
            Tag::Delete => {
                if cur.tag == Tag::Delete {
                    return Err(badformat!(
                        "delete at {} points at another delete",
                        cur.offset
                    ));
                }
            }
            _ => {
                return Err(badformat!(
                    "ancestor at {anc_off} is a {:?} record",
                    anc.tag
                ))
            }
        }
        cur = anc;
        hops += 1;
        if hops > 1_000_000 {
            return Err(badformat!("ancestor chain does not terminate"));
        }
    }
    Ok(())
}

/// Writes a sequential listing of every record up to the committed end.
/// Detail 1 is one line per record; detail 2 adds pointers and checksums.
pub(crate) fn dump<W: Write>(txn: &Txn<'_>, w: &mut W, detail: u32) -> Result<()> {
    let shared = &txn.db.shared;
    let h = &txn.header;
    writeln!(w, "ebbkv database {}", txn.db.shared.path.display())?;
    writeln!(
        w,
        "  generation={} num_records={} num_commits={} dirty_size={} current_size={} max_level={}",
        h.generation, h.num_records, h.num_commits, h.dirty_size, h.current_size, h.max_level
    )?;

    let data = txn.handle.as_slice();
    let mut offset = DUMMY_OFFSET;
    while offset < txn.end {
        let v = RecordView::parse(data, offset, txn.end)?;
        match v.tag {
            Tag::Dummy => writeln!(w, "{offset:>10} DUMMY level={}", v.level)?,
            Tag::Commit => writeln!(w, "{offset:>10} COMMIT start={}", v.ancestor)?,
            Tag::Delete => writeln!(w, "{offset:>10} DELETE ancestor={}", v.ancestor)?,
            _ => {
                writeln!(
                    w,
                    "{offset:>10} {:?} level={} keylen={} vallen={} key={:?}{}",
                    v.tag,
                    v.level,
                    v.keylen,
                    v.vallen,
                    String::from_utf8_lossy(&v.key()[..v.key().len().min(40)]),
                    if v.ancestor != 0 {
                        format!(" ancestor={}", v.ancestor)
                    } else {
                        String::new()
                    }
                )?;
            }
        }
        if detail >= 2 {
            if let Some(slot) = v.slot0_offset() {
                let s0 = txn.handle.load_u64(slot)?;
                let s1 = txn.handle.load_u64(slot + 8)?;
                write!(w, "{:>10} slots=[{s0}, {s1}] ptrs=[", "")?;
                for k in 1..v.level {
                    if let Some(ptr_off) = v.level_ptr_offset(k) {
                        let p = txn.handle.load_u64(ptr_off)?;
                        if k > 1 {
                            write!(w, ", ")?;
                        }
                        write!(w, "{p}")?;
                    }
                }
                writeln!(w, "]")?;
            }
        }
        offset += v.size();
    }
    writeln!(w, "{:>10} end of committed data", txn.end)?;
    Ok(())
}
