use anyhow::Result;
use tempfile::tempdir;

use super::helpers::*;
use crate::Db;

#[test]
fn repack_drops_dead_space() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;

    fill(
        &db,
        &[(b"apple", b"val_a"), (b"banana", b"val_b"), (b"cherry", b"val_c")],
    )?;
    db.delete(b"banana")?;
    db.store(b"apple", b"new_a")?;

    let size_before = db.size();
    let gen_before = db.generation();
    let uuid_before = db.uuid();

    db.repack()?;

    assert_eq!(db.generation(), gen_before + 1);
    assert!(db.size() < size_before);
    assert_eq!(db.dirty_size(), 0);
    assert_eq!(db.uuid(), uuid_before);
    db.check_consistency()?;

    assert_eq!(db.fetch(b"apple")?.unwrap(), b"new_a");
    assert!(db.fetch(b"banana")?.is_none());
    assert_eq!(db.fetch(b"cherry")?.unwrap(), b"val_c");
    assert_eq!(db.num_records(), 2);

    // survives a reopen
    drop(db);
    let db = Db::open(&path)?;
    assert_eq!(db.fetch(b"apple")?.unwrap(), b"new_a");
    assert!(db.fetch(b"banana")?.is_none());
    assert_eq!(db.fetch(b"cherry")?.unwrap(), b"val_c");
    db.check_consistency()?;
    Ok(())
}

#[test]
fn bulk_delete_then_repack() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;

    let mut txn = db.begin_write()?;
    for i in 0..4096u32 {
        txn.store(format!("key-{i:06}").as_bytes(), b"some value payload")?;
    }
    txn.commit()?;

    let mut txn = db.begin_write()?;
    for i in (0..4096u32).step_by(2) {
        txn.delete(format!("key-{i:06}").as_bytes())?;
    }
    txn.commit()?;

    db.check_consistency()?;
    assert!(db.should_repack());

    let gen_before = db.generation();
    db.repack()?;
    db.check_consistency()?;

    assert_eq!(db.num_records(), 2048);
    assert_eq!(db.generation(), gen_before + 1);
    assert_eq!(db.dirty_size(), 0);
    assert!(!db.should_repack());

    // every odd key survived, every even key is gone
    assert!(db.fetch(b"key-000000")?.is_none());
    assert_eq!(db.fetch(b"key-000001")?.unwrap(), b"some value payload");
    assert!(db.fetch(b"key-004094")?.is_none());
    assert_eq!(db.fetch(b"key-004095")?.unwrap(), b"some value payload");
    Ok(())
}

#[test]
fn should_repack_thresholds() -> Result<()> {
    let dir = tempdir()?;
    let db = create_db(&db_path(&dir))?;

    // empty: nothing to reclaim
    assert!(!db.should_repack());

    let value = vec![b'x'; 256];
    let mut txn = db.begin_write()?;
    for i in 0..200u32 {
        txn.store(format!("key-{i:04}").as_bytes(), &value)?;
    }
    txn.commit()?;

    // live data only: still nothing to reclaim
    assert!(!db.should_repack());

    let mut txn = db.begin_write()?;
    for i in 0..200u32 {
        txn.delete(format!("key-{i:04}").as_bytes())?;
    }
    txn.commit()?;

    // now most of the file is dead space
    assert!(db.should_repack());

    db.repack()?;
    assert!(!db.should_repack());
    assert_eq!(db.num_records(), 0);
    db.check_consistency()?;
    Ok(())
}

#[test]
fn repack_preserves_interleaved_commits() -> Result<()> {
    // commits that land between the snapshot copy and the exclusive
    // replay phase must survive; with a single process the copy phase
    // cannot overlap a writer, but replay correctness still shows in the
    // values written after the snapshot was taken
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;
    fill(&db, &[(b"stable", b"untouched"), (b"moving", b"v1")])?;
    db.store(b"moving", b"v2")?;
    db.delete(b"stable")?;
    db.store(b"stable", b"rewritten")?;

    db.repack()?;
    db.check_consistency()?;
    assert_eq!(db.fetch(b"moving")?.unwrap(), b"v2");
    assert_eq!(db.fetch(b"stable")?.unwrap(), b"rewritten");
    assert_eq!(db.num_records(), 2);
    Ok(())
}

#[test]
fn double_repack_and_no_leftover_temp() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;
    fill(&db, &[(b"a", b"1"), (b"b", b"2")])?;

    db.repack()?;
    db.repack()?;
    assert_eq!(db.generation(), 3);
    db.check_consistency()?;

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".NEW");
    assert!(!std::path::Path::new(&tmp_name).exists());
    Ok(())
}

#[test]
fn stale_temp_file_is_swept() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;
    fill(&db, &[(b"a", b"1")])?;

    // simulate a crashed repack's leftovers
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".NEW");
    std::fs::write(&tmp_name, b"debris from a dead repack")?;

    db.repack()?;
    assert_eq!(db.fetch(b"a")?.unwrap(), b"1");
    assert!(!std::path::Path::new(&tmp_name).exists());
    Ok(())
}

#[test]
fn writes_keep_working_after_repack() -> Result<()> {
    let dir = tempdir()?;
    let path = db_path(&dir);
    let db = create_db(&path)?;
    fill(&db, &[(b"k1", b"v1"), (b"k2", b"v2")])?;
    db.delete(b"k1")?;
    db.repack()?;

    // the handle now serves the renamed file transparently
    db.store(b"k3", b"v3")?;
    assert_eq!(db.fetch(b"k3")?.unwrap(), b"v3");
    assert_eq!(db.fetch(b"k2")?.unwrap(), b"v2");
    assert_eq!(db.num_records(), 2);
    db.check_consistency()?;

    drop(db);
    let db = Db::open(&path)?;
    assert_eq!(db.fetch(b"k3")?.unwrap(), b"v3");
    db.check_consistency()?;
    Ok(())
}
