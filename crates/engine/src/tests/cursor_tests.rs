use anyhow::Result;
use tempfile::tempdir;

use super::helpers::*;
use crate::{CursorOptions, Db, Error};

#[test]
fn cursor_full_iteration() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;
    fill(
        &db,
        &[
            (b"apple", b"val_a"),
            (b"banana", b"val_b"),
            (b"cherry", b"val_c"),
            (b"cranberry", b"val_cr"),
            (b"date", b"val_d"),
        ],
    )?;

    let mut cur = db.cursor(
        b"",
        CursorOptions {
            shared: true,
            ..Default::default()
        },
    )?;
    let mut seen = Vec::new();
    while let Some((k, v)) = cur.next()? {
        seen.push((k.to_vec(), v.to_vec()));
    }
    cur.abort()?;

    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0].0, b"apple");
    assert_eq!(seen[4].0, b"date");
    assert_eq!(seen[3].1, b"val_cr");
    Ok(())
}

#[test]
fn cursor_prefix_mode() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    fill(
        &db,
        &[
            (b"apple", b"val_a"),
            (b"cherry", b"val_c"),
            (b"cranberry", b"val_cr"),
            (b"date", b"val_d"),
        ],
    )?;

    let mut cur = db.cursor(
        b"c",
        CursorOptions {
            shared: true,
            prefix: true,
            ..Default::default()
        },
    )?;
    let mut keys = Vec::new();
    while let Some((k, _)) = cur.next()? {
        keys.push(k.to_vec());
    }
    cur.abort()?;
    assert_eq!(keys, vec![b"cherry".to_vec(), b"cranberry".to_vec()]);
    Ok(())
}

#[test]
fn cursor_skip_root() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    fill(
        &db,
        &[(b"cherry", b"val_c"), (b"cranberry", b"val_cr"), (b"date", b"val_d")],
    )?;

    // without prefix mode the cursor runs to the end of the database
    let mut cur = db.cursor(
        b"cherry",
        CursorOptions {
            shared: true,
            skip_root: true,
            ..Default::default()
        },
    )?;
    let (k, _) = cur.next()?.unwrap();
    assert_eq!(k, b"cranberry");
    let (k, _) = cur.next()?.unwrap();
    assert_eq!(k, b"date");
    assert!(cur.next()?.is_none());
    cur.abort()?;
    Ok(())
}

#[test]
fn cursor_replace_under_write_txn() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;
    fill(
        &db,
        &[(b"alpha", b"old_a"), (b"beta", b"old_b"), (b"gamma", b"old_g")],
    )?;

    // default cursor: write transaction
    let mut cur = db.cursor(b"", CursorOptions::default())?;
    let (k, _) = cur.next()?.unwrap();
    assert_eq!(k, b"alpha");
    let (k, v) = cur.next()?.unwrap();
    assert_eq!(k, b"beta");
    assert_eq!(v, b"old_b");
    cur.replace(b"new_b")?;
    let (k, v) = cur.next()?.unwrap();
    assert_eq!(k, b"gamma");
    assert_eq!(v, b"old_g");
    assert!(cur.next()?.is_none());
    cur.commit()?;

    drop(db);
    let db = Db::open(&path)?;
    assert_eq!(db.fetch(b"alpha")?.unwrap(), b"old_a");
    assert_eq!(db.fetch(b"beta")?.unwrap(), b"new_b");
    assert_eq!(db.fetch(b"gamma")?.unwrap(), b"old_g");
    db.check_consistency()?;
    Ok(())
}

#[test]
fn cursor_replace_needs_position() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;
    fill(&db, &[(b"a", b"1")])?;
    let mut cur = db.cursor(b"", CursorOptions::default())?;
    assert!(matches!(cur.replace(b"x"), Err(Error::BadUsage(_))));
    cur.abort()?;
    Ok(())
}

#[test]
fn cursor_inside_txn_sees_uncommitted_and_detaches() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;

    let mut txn = db.begin_write()?;
    txn.store(b"one", b"val_1")?;
    txn.store(b"two", b"val_2")?;
    txn.store(b"three", b"val_3")?;

    {
        let mut cur = txn.cursor(b"", CursorOptions::default());
        let mut count = 0;
        while cur.next()?.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        // finishing a borrowed cursor leaves the transaction alive
        cur.finish()?;
    }

    // committing a borrowed cursor is refused
    {
        let mut cur = txn.cursor(b"", CursorOptions::default());
        let _ = cur.next()?;
        assert!(matches!(cur.commit(), Err(Error::BadUsage(_))));
    }

    txn.commit()?;

    drop(db);
    let db = Db::open(&path)?;
    assert_eq!(db.fetch(b"one")?.unwrap(), b"val_1");
    assert_eq!(db.fetch(b"two")?.unwrap(), b"val_2");
    assert_eq!(db.fetch(b"three")?.unwrap(), b"val_3");
    Ok(())
}
