use std::path::{Path, PathBuf};

use crate::Db;

pub fn db_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("test.ebb")
}

pub fn create_db(path: &Path) -> crate::Result<Db> {
    Db::options().create(true).open(path)
}

/// Stores every pair in one committed transaction.
pub fn fill(db: &Db, pairs: &[(&[u8], &[u8])]) -> crate::Result<()> {
    let mut txn = db.begin_write()?;
    for (k, v) in pairs {
        txn.store(k, v)?;
    }
    txn.commit()
}

/// Collects all live pairs via foreach.
pub fn collect(db: &Db, prefix: &[u8]) -> crate::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    db.foreach(prefix, |k, v| {
        out.push((k.to_vec(), v.to_vec()));
        std::ops::ControlFlow::Continue(())
    })?;
    Ok(out)
}
