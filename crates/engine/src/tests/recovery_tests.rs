use anyhow::Result;
use tempfile::tempdir;

use super::helpers::*;
use crate::Db;

// --------------------- Crash and recover ---------------------

#[test]
fn abandoned_txn_recovers_on_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    {
        let db = create_db(&path)?;
        fill(&db, &[(b"good", b"data")])?;

        let mut txn = db.begin_write()?;
        txn.store(b"INVALID", b"CRASHME")?;
        // walk away mid-transaction, like a killed process
        txn.abandon();
        drop(db);
    }

    // the reopen finds the DIRTY bit and scrubs
    let db = Db::open(&path)?;
    db.check_consistency()?;
    assert!(db.fetch(b"INVALID")?.is_none());
    assert_eq!(db.fetch(b"good")?.unwrap(), b"data");
    assert_eq!(db.num_records(), 1);

    // and the database is fully writable again
    db.store(b"after", b"crash")?;
    assert_eq!(db.fetch(b"after")?.unwrap(), b"crash");
    db.check_consistency()?;
    Ok(())
}

#[test]
fn abandoned_txn_is_invisible_to_readers_before_recovery() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;
    fill(&db, &[(b"apple", b"1"), (b"cherry", b"2")])?;

    let mut txn = db.begin_write()?;
    txn.store(b"banana", b"x")?;
    txn.delete(b"apple")?;
    txn.abandon();

    // same handle, no recovery yet: reads are bounded by the committed
    // end, so the wreckage simply does not exist for them
    assert!(db.fetch(b"banana")?.is_none());
    assert_eq!(db.fetch(b"apple")?.unwrap(), b"1");
    assert_eq!(collect(&db, b"")?.len(), 2);
    Ok(())
}

#[test]
fn write_after_abandon_triggers_recovery_in_place() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;
    fill(&db, &[(b"k", b"v")])?;

    let mut txn = db.begin_write()?;
    txn.store(b"doomed", b"bytes")?;
    txn.abandon();

    // the next write transaction runs recovery before proceeding
    db.store(b"fresh", b"value")?;
    db.check_consistency()?;
    assert!(db.fetch(b"doomed")?.is_none());
    assert_eq!(db.fetch(b"fresh")?.unwrap(), b"value");
    Ok(())
}

#[test]
fn recovery_scrubs_partial_overwrites() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    {
        let db = create_db(&path)?;
        let mut txn = db.begin_write()?;
        // a burst of inserts at mixed levels, replaces, and deletes, all
        // torn away mid-flight
        for i in 0..100u32 {
            txn.store(format!("pre-{i:03}").as_bytes(), b"committed")?;
        }
        txn.commit()?;

        let mut txn = db.begin_write()?;
        for i in 0..100u32 {
            txn.store(format!("pre-{i:03}").as_bytes(), b"dirty")?;
        }
        for i in (0..100u32).step_by(3) {
            txn.delete(format!("pre-{i:03}").as_bytes())?;
        }
        for i in 0..50u32 {
            txn.store(format!("new-{i:03}").as_bytes(), b"dirty")?;
        }
        txn.abandon();
        drop(db);
    }

    let db = Db::open(&path)?;
    db.check_consistency()?;
    assert_eq!(db.num_records(), 100);
    for i in (0..100u32).step_by(17) {
        assert_eq!(
            db.fetch(format!("pre-{i:03}").as_bytes())?.unwrap(),
            b"committed"
        );
    }
    assert!(db.fetch(b"new-000")?.is_none());
    Ok(())
}

#[test]
fn recovery_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    {
        let db = create_db(&path)?;
        fill(&db, &[(b"a", b"1"), (b"b", b"2")])?;
        let mut txn = db.begin_write()?;
        txn.store(b"c", b"3")?;
        txn.abandon();
        drop(db);
    }

    // first recovery
    {
        let db = Db::open(&path)?;
        db.check_consistency()?;
        drop(db);
    }
    let first = std::fs::read(&path)?;

    // opening and closing again must not change a byte
    {
        let db = Db::open(&path)?;
        db.check_consistency()?;
        drop(db);
    }
    let second = std::fs::read(&path)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn abort_equals_recovery() -> Result<()> {
    // the same damage, once aborted and once crashed+recovered, must
    // converge to the same live state
    let dir = tempdir()?;
    let aborted = dir.path().join("aborted.ebb");
    let crashed = dir.path().join("crashed.ebb");

    for path in [&aborted, &crashed] {
        let db = create_db(path)?;
        fill(&db, &[(b"x", b"1"), (b"y", b"2")])?;
        let mut txn = db.begin_write()?;
        txn.store(b"x", b"overwritten")?;
        txn.delete(b"y")?;
        txn.store(b"z", b"created")?;
        if path == &aborted {
            txn.abort()?;
        } else {
            txn.abandon();
        }
        drop(db);
    }

    for path in [&aborted, &crashed] {
        let db = Db::open(path)?;
        db.check_consistency()?;
        assert_eq!(db.fetch(b"x")?.unwrap(), b"1");
        assert_eq!(db.fetch(b"y")?.unwrap(), b"2");
        assert!(db.fetch(b"z")?.is_none());
        assert_eq!(db.num_records(), 2);
        drop(db);
    }
    Ok(())
}
