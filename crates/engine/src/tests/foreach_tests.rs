use std::ops::ControlFlow;

use anyhow::Result;
use tempfile::tempdir;

use super::helpers::*;
use crate::ForeachOptions;

#[test]
fn foreach_returns_sorted_byte_order() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    // space (0x20) sorts before dot (0x2e)
    fill(
        &db,
        &[
            (b"INBOX.a.b", b"aleut stoic muscovy"),
            (b"INBOX.a", b"delays maj bullish"),
            (b"INBOX.a b", b"bobby tswana cu"),
        ],
    )?;
    let all = collect(&db, b"")?;
    let keys: Vec<_> = all.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(
        keys,
        vec![&b"INBOX.a"[..], &b"INBOX.a b"[..], &b"INBOX.a.b"[..]]
    );
    Ok(())
}

#[test]
fn foreach_prefix_filters() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    fill(
        &db,
        &[
            (b"apple", b"1"),
            (b"banana", b"2"),
            (b"berry", b"3"),
            (b"cherry", b"4"),
        ],
    )?;
    let b_keys = collect(&db, b"b")?;
    assert_eq!(b_keys.len(), 2);
    assert_eq!(b_keys[0].0, b"banana");
    assert_eq!(b_keys[1].0, b"berry");

    // an exact-match prefix includes the root entry
    let exact = collect(&db, b"banana")?;
    assert_eq!(exact.len(), 1);

    // no match
    assert!(collect(&db, b"zebra")?.is_empty());
    Ok(())
}

#[test]
fn foreach_skips_deleted_entries() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    fill(&db, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")])?;
    db.delete(b"b")?;
    let all = collect(&db, b"")?;
    let keys: Vec<_> = all.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![&b"a"[..], &b"c"[..]]);
    Ok(())
}

#[test]
fn foreach_stops_on_break() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    fill(&db, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")])?;
    let mut seen = 0;
    db.foreach(b"", |_k, _v| {
        seen += 1;
        if seen == 2 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    assert_eq!(seen, 2);
    Ok(())
}

#[test]
fn foreach_skip_exact_and_filter() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    fill(
        &db,
        &[(b"cherry", b"keep"), (b"cranberry", b"drop"), (b"date", b"keep")],
    )?;

    // skip the entry equal to the prefix itself
    let mut keys = Vec::new();
    let mut txn = db.begin_read()?;
    txn.foreach_with(
        b"c",
        ForeachOptions {
            skip_exact: true,
            ..Default::default()
        },
        |k, _v| {
            keys.push(k.to_vec());
            ControlFlow::Continue(())
        },
    )?;
    txn.commit()?;
    // "c" itself is not stored, so nothing is skipped here
    assert_eq!(keys.len(), 2);

    // with a root that exists
    let mut keys = Vec::new();
    let mut txn = db.begin_read()?;
    txn.foreach_with(
        b"cherry",
        ForeachOptions {
            skip_exact: true,
            ..Default::default()
        },
        |k, _v| {
            keys.push(k.to_vec());
            ControlFlow::Continue(())
        },
    )?;
    txn.commit()?;
    assert!(keys.is_empty());

    // predicate filtering without the callback seeing dropped entries
    let mut filter = |_k: &[u8], v: &[u8]| v == b"keep";
    let mut keys = Vec::new();
    let mut txn = db.begin_read()?;
    txn.foreach_with(
        b"",
        ForeachOptions {
            filter: Some(&mut filter),
            ..Default::default()
        },
        |k, _v| {
            keys.push(k.to_vec());
            ControlFlow::Continue(())
        },
    )?;
    txn.commit()?;
    assert_eq!(keys, vec![b"cherry".to_vec(), b"date".to_vec()]);
    Ok(())
}

#[test]
fn foreach_in_write_txn_sees_uncommitted() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    let mut txn = db.begin_write()?;
    txn.store(b"one", b"val_1")?;
    txn.store(b"two", b"val_2")?;
    txn.store(b"three", b"val_3")?;

    let mut count = 0;
    txn.foreach(b"", |_k, _v| {
        count += 1;
        ControlFlow::Continue(())
    })?;
    assert_eq!(count, 3);
    txn.commit()?;
    Ok(())
}

#[test]
fn foreach_with_always_yield() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    fill(&db, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")])?;
    let mut count = 0;
    db.foreach_with(
        b"",
        ForeachOptions {
            always_yield: true,
            ..Default::default()
        },
        |_k, _v| {
            count += 1;
            ControlFlow::Continue(())
        },
    )?;
    assert_eq!(count, 3);
    Ok(())
}

#[test]
fn fetch_next_walks_forward() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    fill(&db, &[(b"apple", b"1"), (b"banana", b"2"), (b"cherry", b"3")])?;
    db.delete(b"banana")?;

    let (k, v) = db.fetch_next(b"apple")?.unwrap();
    // the deleted key is skipped
    assert_eq!(k, b"cherry");
    assert_eq!(v, b"3");

    // from before the first key
    let (k, _) = db.fetch_next(b"")?.unwrap();
    assert_eq!(k, b"apple");

    // past the end
    assert!(db.fetch_next(b"zzz")?.is_none());
    Ok(())
}
