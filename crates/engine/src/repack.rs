//! Online repack: rebuild a compacted file while readers and writers
//! continue.
//!
//! The repacker copies every live pair out of an MVCC snapshot into a
//! sibling `<name>.NEW` file (yielding its lock periodically so writers
//! can commit), then takes the exclusive lock once, replays the commits
//! that landed after the snapshot, and renames the new file over the old
//! one. Processes holding the old file keep a valid mapping: an MVCC
//! reader re-acquires its lock against the old identity, and everyone
//! else reopens the path on their next lock acquisition.

use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::{Db, OpenOptions};
use crate::error::{internal, Error, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::lock;
use crate::mapfile::MapFile;
use crate::record::{RecordView, Tag};

/// Dead space below this many bytes is never worth rewriting.
const MIN_REWRITE: u64 = 16 * 1024;

impl Db {
    /// True when a repack would reclaim meaningful space: dead bytes
    /// exceed the minimum rewrite threshold and make up more than a
    /// quarter of the file.
    #[must_use]
    pub fn should_repack(&self) -> bool {
        let st = self.shared.state.lock();
        let h = &st.header;
        h.dirty_size > MIN_REWRITE && h.current_size < 4 * h.dirty_size
    }

    /// Rebuilds the database into a compacted file and renames it over
    /// this one. The UUID is kept; the generation increases by one;
    /// `dirty_size` drops to zero. Only one repack may run against a file
    /// at a time — concurrent attempts fail with [`Error::Locked`].
    pub fn repack(&self) -> Result<()> {
        if self.shared.read_only {
            return Err(Error::Locked);
        }
        let _active = RepackSlot::claim(self)?;
        let tmp_path = sibling_path(&self.shared.path);
        let mut tmp = TmpClaim::create(&tmp_path)?;
        let result = run(self, &tmp_path);
        if result.is_ok() {
            tmp.disarm();
        }
        result
    }
}

fn run(db: &Db, tmp_path: &Path) -> Result<()> {
    let shared = &db.shared;

    // phase 1: copy the snapshot, yielding so writers can interleave
    let mut src = db.begin_mvcc()?;
    let snapshot_end = src.end;
    let src_header = src.header.clone();

    let mut dopts = OpenOptions::new()
        .create(true)
        .no_sync(true)
        .checksum(shared.engine.kind());
    if let Some(f) = shared.engine.external_fn() {
        dopts = dopts.checksum_external(f);
    }
    if src_header.external_comparator() {
        dopts = dopts.comparator(shared.cmp);
    }
    dopts.preset_uuid = Some(src_header.uuid);
    dopts.preset_generation = src_header.generation + 1;
    let dest = dopts.open(tmp_path)?;

    {
        let mut dest_txn = dest.begin_write()?;
        let mut copy_err: Option<Error> = None;
        src.foreach(b"", |key, value| match dest_txn.store(key, value) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                copy_err = Some(e);
                ControlFlow::Break(())
            }
        })?;
        if let Some(e) = copy_err {
            return Err(e);
        }
        dest_txn.commit()?;
    }
    src.abort()?;

    // phase 2: under the exclusive lock, replay commits made during the
    // copy, in their on-disk (commit) order
    let wtxn = db.begin_write()?;
    let replay_end = wtxn.header.current_size;
    {
        let mut dest_txn = dest.begin_write()?;
        dest_txn.mark_repacked();
        let data = wtxn.handle.as_slice();
        let mut offset = snapshot_end;
        while offset < replay_end {
            let v = RecordView::parse(data, offset, replay_end)?;
            match v.tag {
                Tag::Add | Tag::FatAdd | Tag::Replace | Tag::FatReplace => {
                    dest_txn.store(v.key(), v.value())?;
                }
                Tag::Delete => {
                    let victim = RecordView::parse(data, v.ancestor, replay_end)?;
                    dest_txn.delete(victim.key())?;
                }
                Tag::Commit => {}
                Tag::Dummy => {
                    return Err(internal!("dummy record inside the replay region"));
                }
            }
            offset += v.size();
        }
        dest_txn.commit()?;
    }
    dest.sync()?;

    // phase 3: publish
    std::fs::rename(tmp_path, &shared.path)?;
    let fresh = MapFile::open(&shared.path, !shared.read_only, false, !shared.no_sync)?;
    let final_header = Header::decode(fresh.bytes(0, HEADER_SIZE)?)?;
    tracing::debug!(
        generation = final_header.generation,
        size = final_header.current_size,
        "repack complete"
    );
    shared.swap_handle(Arc::new(fresh));
    shared.cache_header(&final_header);

    // the old inode keeps serving in-flight MVCC readers; walking away
    // without touching its header is exactly what they expect
    wtxn.abandon();
    Ok(())
}

fn sibling_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".NEW");
    PathBuf::from(name)
}

/// In-process repack exclusion (fcntl locks cannot self-conflict).
struct RepackSlot<'db> {
    db: &'db Db,
}

impl<'db> RepackSlot<'db> {
    fn claim(db: &'db Db) -> Result<RepackSlot<'db>> {
        let mut st = db.shared.state.lock();
        if st.repacking {
            return Err(Error::Locked);
        }
        st.repacking = true;
        Ok(RepackSlot { db })
    }
}

impl Drop for RepackSlot<'_> {
    fn drop(&mut self) {
        self.db.shared.state.lock().repacking = false;
    }
}

/// Ownership of the `<name>.NEW` file: created exclusively, locked for
/// the duration, removed on failure. A leftover temp file whose lock can
/// be taken belonged to a crashed repack and is swept aside.
struct TmpClaim {
    path: PathBuf,
    _file: File,
    armed: bool,
}

impl TmpClaim {
    fn create(path: &Path) -> Result<TmpClaim> {
        for attempt in 0..2 {
            match FsOpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(file) => {
                    lock::lock(&file, lock::HEADER_LOCK, true, false)?;
                    return Ok(TmpClaim {
                        path: path.to_path_buf(),
                        _file: file,
                        armed: true,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt == 0 => {
                    let stale = FsOpenOptions::new().read(true).write(true).open(path)?;
                    match lock::lock(&stale, lock::HEADER_LOCK, true, false) {
                        Ok(()) => {
                            tracing::warn!(path = %path.display(), "removing stale repack file");
                            std::fs::remove_file(path)?;
                        }
                        Err(_) => return Err(Error::Locked),
                    }
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(Error::Locked),
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Locked)
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TmpClaim {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
