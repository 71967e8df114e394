//! Database handles, open options, and the in-process registry.
//!
//! ## Handle sharing
//!
//! `fcntl` range locks are per-process, so two opens of the same file within
//! one process must share lock state or they would silently not exclude each
//! other. The registry maps each canonicalised path to one [`SharedDb`];
//! opening a path twice yields two [`Db`] handles over the same shared
//! state, reference-counted through `Arc`. Cross-process exclusion uses the
//! file's lock regions; in-process exclusion uses the shared lock table
//! below.
//!
//! ## Open protocol
//!
//! Open takes the header lock, then a shared data lock, then drops the
//! header lock (two-phase, so a long-running transaction never starves an
//! opener), validates the header, and runs crash recovery if the DIRTY bit
//! is set on a writable open.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::checksum::{ChecksumEngine, ChecksumKind, ExternalChecksum};
use crate::cursor::{Cursor, CursorOptions};
use crate::error::{badformat, Error, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::lock;
use crate::mapfile::MapFile;
use crate::record::{RecordBuilder, DUMMY_OFFSET, DUMMY_SIZE};
use crate::skiplist::{byte_order, Comparator};
use crate::txn::{Cond, ForeachOptions, Txn, TxnKind};
use crate::{check, recovery};

/// Diagnostic sink for errors the library observes; the returned `Error`
/// remains the authoritative result.
pub type ErrorHook = fn(&Error);

/// Builder for opening or creating a database, in the style of
/// `std::fs::OpenOptions`.
#[derive(Clone)]
pub struct OpenOptions {
    create: bool,
    read_only: bool,
    no_checksum: bool,
    no_sync: bool,
    non_blocking: bool,
    no_yield: bool,
    checksum: ChecksumKind,
    external_checksum: Option<ExternalChecksum>,
    comparator: Option<Comparator>,
    error_hook: Option<ErrorHook>,
    pub(crate) preset_uuid: Option<[u8; 16]>,
    pub(crate) preset_generation: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        OpenOptions {
            create: false,
            read_only: false,
            no_checksum: false,
            no_sync: false,
            non_blocking: false,
            no_yield: false,
            checksum: ChecksumKind::Xxh64,
            external_checksum: None,
            comparator: None,
            error_hook: None,
            preset_uuid: None,
            preset_generation: 1,
        }
    }

    /// Create the file if it does not exist.
    pub fn create(mut self, yes: bool) -> Self {
        self.create = yes;
        self
    }

    /// Open shared: reads only, no write transactions.
    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    /// Disable checksum verification on reads. Required to open a file
    /// whose checksum engine differs from the requested one.
    pub fn no_checksum(mut self, yes: bool) -> Self {
        self.no_checksum = yes;
        self
    }

    /// Skip synchronous flushes. Dangerous: a crash may lose commits.
    pub fn no_sync(mut self, yes: bool) -> Self {
        self.no_sync = yes;
        self
    }

    /// Fail lock acquisitions with [`Error::Locked`] instead of blocking.
    pub fn non_blocking(mut self, yes: bool) -> Self {
        self.non_blocking = yes;
        self
    }

    /// Disable the automatic yield during long iterations.
    pub fn no_yield(mut self, yes: bool) -> Self {
        self.no_yield = yes;
        self
    }

    /// Select the checksum engine recorded at creation time.
    pub fn checksum(mut self, kind: ChecksumKind) -> Self {
        self.checksum = kind;
        self
    }

    /// Supply the function backing [`ChecksumKind::External`].
    pub fn checksum_external(mut self, f: ExternalChecksum) -> Self {
        self.external_checksum = Some(f);
        self.checksum = ChecksumKind::External;
        self
    }

    /// Install a custom key comparator. Its presence is recorded in the
    /// header; reopening with a mismatched comparator fails with
    /// [`Error::BadFormat`].
    pub fn comparator(mut self, cmp: Comparator) -> Self {
        self.comparator = Some(cmp);
        self
    }

    /// Install a diagnostic error sink.
    pub fn on_error(mut self, hook: ErrorHook) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// Opens the database at `path`.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Db> {
        Db::open_with(path.as_ref(), self)
    }
}

/// In-process lock accounting for one shared database.
struct LockTable {
    exclusive: bool,
    shared: u32,
}

pub(crate) struct SharedState {
    pub handle: Arc<MapFile>,
    /// Latest header this process has observed; refreshed on every lock
    /// acquisition and commit. Metadata accessors read this without
    /// touching the file.
    pub header: Header,
    /// In-process repack exclusion (file locks cannot self-conflict).
    pub repacking: bool,
    locks: LockTable,
}

/// Per-path shared state; see the module docs.
pub(crate) struct SharedDb {
    pub path: PathBuf,
    pub read_only: bool,
    pub no_sync: bool,
    pub non_blocking: bool,
    pub no_yield: bool,
    pub cmp: Comparator,
    pub engine: ChecksumEngine,
    pub error_hook: Option<ErrorHook>,
    pub state: Mutex<SharedState>,
    cond: Condvar,
}

impl SharedDb {
    pub(crate) fn report(&self, err: &Error) {
        if let Some(hook) = self.error_hook {
            hook(err);
        }
    }

    /// Takes the in-process side of the data lock.
    pub(crate) fn acquire_inproc(&self, exclusive: bool, block: bool) -> Result<()> {
        let mut st = self.state.lock();
        loop {
            if exclusive {
                if !st.locks.exclusive && st.locks.shared == 0 {
                    st.locks.exclusive = true;
                    return Ok(());
                }
            } else if !st.locks.exclusive {
                st.locks.shared += 1;
                return Ok(());
            }
            if !block {
                return Err(Error::Locked);
            }
            self.cond.wait(&mut st);
        }
    }

    pub(crate) fn release_inproc(&self, exclusive: bool) {
        {
            let mut st = self.state.lock();
            if exclusive {
                st.locks.exclusive = false;
            } else {
                st.locks.shared -= 1;
            }
        }
        self.cond.notify_all();
    }

    /// Two-phase file lock: header, then data, then drop the header lock.
    pub(crate) fn lock_file(&self, map: &MapFile, exclusive: bool, block: bool) -> Result<()> {
        lock::lock(map.file(), lock::HEADER_LOCK, exclusive, block)?;
        let r = lock::lock(map.file(), lock::DATA_LOCK, exclusive, block);
        let _ = lock::unlock(map.file(), lock::HEADER_LOCK);
        r
    }

    pub(crate) fn unlock_file(&self, map: &MapFile) {
        let _ = lock::unlock(map.file(), lock::DATA_LOCK);
    }

    pub(crate) fn current_handle(&self) -> Arc<MapFile> {
        self.state.lock().handle.clone()
    }

    /// Publishes a replacement mapping (growth, catch-up, or a repack's
    /// rename) so later transactions start from it.
    pub(crate) fn swap_handle(&self, map: Arc<MapFile>) {
        self.state.lock().handle = map;
    }

    pub(crate) fn cache_header(&self, header: &Header) {
        self.state.lock().header = header.clone();
    }

    /// Acquires the data lock, making sure the locked mapping is current:
    /// if the file at `path` was replaced by a repack the new file is
    /// opened, and if the file grew past the mapping it is remapped.
    /// Returns the mapping to use and the freshly read header.
    pub(crate) fn lock_current(&self, exclusive: bool, block: bool) -> Result<(Arc<MapFile>, Header)> {
        self.acquire_inproc(exclusive, block)?;
        match self.lock_current_file(exclusive, block) {
            Ok(out) => Ok(out),
            Err(e) => {
                self.release_inproc(exclusive);
                Err(e)
            }
        }
    }

    fn lock_current_file(&self, exclusive: bool, block: bool) -> Result<(Arc<MapFile>, Header)> {
        loop {
            let map = self.current_handle();
            self.lock_file(&map, exclusive, block)?;

            // a repack may have renamed a new file over the path
            match MapFile::path_identity(&self.path) {
                Ok(identity) if identity != map.identity() => {
                    self.unlock_file(&map);
                    let fresh = MapFile::open(&self.path, !self.read_only, false, !self.no_sync)?;
                    tracing::debug!(path = %self.path.display(), "reopened repacked database");
                    self.swap_handle(Arc::new(fresh));
                    continue;
                }
                // a vanished path is tolerable: the open descriptor is alive
                _ => {}
            }

            let map = self.remap_if_grown(map)?;
            let header = match Header::decode(map.bytes(0, HEADER_SIZE)?) {
                Ok(h) => h,
                Err(e) => {
                    self.unlock_file(&map);
                    self.report(&e);
                    return Err(e);
                }
            };
            self.cache_header(&header);
            return Ok((map, header));
        }
    }

    /// Remaps `map` over the same descriptor if the file has grown beyond
    /// it (another process extended the file). Publishes the replacement.
    pub(crate) fn remap_if_grown(&self, map: Arc<MapFile>) -> Result<Arc<MapFile>> {
        let file_len = map.file().metadata()?.len();
        if file_len <= map.len() {
            return Ok(map);
        }
        let fresh = Arc::new(map.catch_up()?);
        self.swap_handle(fresh.clone());
        Ok(fresh)
    }
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<SharedDb>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<SharedDb>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A handle to one open database.
///
/// Cheap to clone-by-reopen: opening the same path again in the same
/// process shares all state with this handle. Dropping the last handle
/// closes the file.
pub struct Db {
    pub(crate) shared: Arc<SharedDb>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Db")
            .field("path", &self.shared.path)
            .field("read_only", &self.shared.read_only)
            .field("generation", &st.header.generation)
            .field("num_records", &st.header.num_records)
            .field("current_size", &st.header.current_size)
            .field("dirty_size", &st.header.dirty_size)
            .finish()
    }
}

impl Db {
    /// Starts an options builder.
    pub fn options() -> OpenOptions {
        OpenOptions::new()
    }

    /// Opens `path` with default options (must already exist).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Db> {
        OpenOptions::new().open(path)
    }

    fn open_with(path: &Path, opts: OpenOptions) -> Result<Db> {
        if opts.create && opts.read_only {
            return Err(Error::BadUsage("create combined with read_only"));
        }
        if opts.checksum == ChecksumKind::External && opts.external_checksum.is_none() {
            return Err(Error::BadUsage("external checksum engine without a function"));
        }

        // an existing shared instance wins: same process, same state
        if let Some(shared) = Self::lookup(path) {
            if opts.comparator.is_some() != shared.state.lock().header.external_comparator() {
                return Err(badformat!("comparator does not match the open database"));
            }
            return Ok(Db { shared });
        }

        let writable = !opts.read_only;
        let map = MapFile::open(path, writable, opts.create && writable, !opts.no_sync)?;

        // header lock first; everything from file creation to header
        // validation happens inside it
        lock::lock(map.file(), lock::HEADER_LOCK, true, !opts.non_blocking)?;
        let result = Self::validate_or_init(&map, &opts);
        let _ = lock::unlock(map.file(), lock::HEADER_LOCK);
        let (map, header) = match result {
            Ok(out) => out,
            Err(e) => {
                if let Some(hook) = opts.error_hook {
                    hook(&e);
                }
                return Err(e);
            }
        };

        let engine = ChecksumEngine::new(
            header.checksum_kind()?,
            opts.external_checksum,
            !opts.no_checksum,
        );
        let shared = Arc::new(SharedDb {
            path: canonical(path)?,
            read_only: opts.read_only,
            no_sync: opts.no_sync,
            non_blocking: opts.non_blocking,
            no_yield: opts.no_yield,
            cmp: opts.comparator.unwrap_or(byte_order),
            engine,
            error_hook: opts.error_hook,
            state: Mutex::new(SharedState {
                handle: Arc::new(map),
                header,
                repacking: false,
                locks: LockTable {
                    exclusive: false,
                    shared: 0,
                },
            }),
            cond: Condvar::new(),
        });
        registry()
            .lock()
            .insert(shared.path.clone(), Arc::downgrade(&shared));
        Ok(Db { shared })
    }

    fn lookup(path: &Path) -> Option<Arc<SharedDb>> {
        let canon = canonical(path).ok()?;
        let mut reg = registry().lock();
        match reg.get(&canon).and_then(Weak::upgrade) {
            Some(shared) => Some(shared),
            None => {
                reg.remove(&canon);
                None
            }
        }
    }

    /// Under the header lock: initialise a fresh file, or validate an
    /// existing one and recover it if it was left dirty.
    fn validate_or_init(map: &MapFile, opts: &OpenOptions) -> Result<(MapFile, Header)> {
        let engine = ChecksumEngine::new(opts.checksum, opts.external_checksum, !opts.no_checksum);

        if map.file().metadata()?.len() == 0 {
            if !opts.create {
                return Err(badformat!("empty database file"));
            }
            let initial = DUMMY_OFFSET + DUMMY_SIZE;
            let map = map.grow(initial)?;
            let uuid = opts
                .preset_uuid
                .unwrap_or_else(|| *Uuid::new_v4().as_bytes());
            let header = Header::new(
                uuid,
                opts.preset_generation,
                opts.checksum,
                opts.comparator.is_some(),
                initial,
            );
            map.write_bytes(0, &header.encode())?;
            map.write_bytes(DUMMY_OFFSET, &RecordBuilder::dummy(&engine))?;
            map.flush_all()?;
            tracing::debug!(len = map.len(), "created database file");
            return Ok((map, header));
        }

        // the file may have been empty when we mapped it (another process
        // mid-creation); remap now that the header lock is ours
        let map = map.catch_up()?;

        // validate under a shared data lock so a committer is never
        // mid-rewrite of the header while we read it
        lock::lock(map.file(), lock::DATA_LOCK, false, !opts.non_blocking)?;
        let header = Header::decode(map.bytes(0, HEADER_SIZE)?);
        let _ = lock::unlock(map.file(), lock::DATA_LOCK);
        let mut header = header?;

        if header.checksum_kind()? != opts.checksum && !opts.no_checksum {
            return Err(badformat!("checksum engine does not match the file"));
        }
        if header.external_comparator() != opts.comparator.is_some() {
            return Err(badformat!("comparator does not match the file"));
        }

        if header.dirty() && !opts.read_only {
            // a writer died mid-transaction; scrub before anyone writes.
            // checksums are restamped with the engine the file was created
            // with, which under no_checksum may differ from the requested one
            let file_engine = ChecksumEngine::new(
                header.checksum_kind()?,
                opts.external_checksum,
                !opts.no_checksum,
            );
            lock::lock(map.file(), lock::DATA_LOCK, true, !opts.non_blocking)?;
            let r = recovery::recover(&map, &file_engine, opts.comparator.unwrap_or(byte_order));
            let _ = lock::unlock(map.file(), lock::DATA_LOCK);
            header = r?;
        }

        Ok((map, header))
    }

    // ---- transactions -------------------------------------------------

    /// Begins the single write transaction. Blocks while other
    /// transactions hold the data lock, unless the database was opened
    /// `non_blocking`.
    pub fn begin_write(&self) -> Result<Txn<'_>> {
        Txn::begin(self, TxnKind::Write)
    }

    /// Begins a shared read transaction; its view refreshes to the latest
    /// commit on every lock re-acquisition.
    pub fn begin_read(&self) -> Result<Txn<'_>> {
        Txn::begin(self, TxnKind::Read)
    }

    /// Begins a snapshot (MVCC) read transaction; its view is frozen at
    /// the moment it starts, even across yields and repacks.
    pub fn begin_mvcc(&self) -> Result<Txn<'_>> {
        Txn::begin(self, TxnKind::Mvcc)
    }

    // ---- one-shot conveniences ---------------------------------------

    /// Fetches a value through an ephemeral read transaction.
    pub fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut txn = self.begin_read()?;
        let out = txn.fetch(key)?.map(<[u8]>::to_vec);
        txn.commit()?;
        Ok(out)
    }

    /// Fetches the first entry *after* `key` in sort order.
    pub fn fetch_next(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut txn = self.begin_read()?;
        let out = txn
            .fetch_next(key)?
            .map(|(k, v)| (k.to_vec(), v.to_vec()));
        txn.commit()?;
        Ok(out)
    }

    /// Stores one pair through an ephemeral write transaction.
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut txn = self.begin_write()?;
        txn.store(key, value)?;
        txn.commit()
    }

    /// Deletes one key through an ephemeral write transaction. Deleting an
    /// absent key is a no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut txn = self.begin_write()?;
        txn.delete(key)?;
        txn.commit()
    }

    /// Conditional one-shot store; see [`Txn::store_cond`].
    pub fn store_cond(&self, key: &[u8], value: Option<&[u8]>, cond: Cond) -> Result<()> {
        let mut txn = self.begin_write()?;
        txn.store_cond(key, value, cond)?;
        txn.commit()
    }

    /// Iterates all live entries with the given prefix through an
    /// ephemeral read transaction.
    pub fn foreach<F>(&self, prefix: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> std::ops::ControlFlow<()>,
    {
        let mut txn = self.begin_read()?;
        txn.foreach(prefix, f)?;
        txn.commit()
    }

    /// Like [`Db::foreach`] with explicit options.
    pub fn foreach_with<F>(&self, prefix: &[u8], opts: ForeachOptions<'_>, f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> std::ops::ControlFlow<()>,
    {
        let mut txn = self.begin_read()?;
        txn.foreach_with(prefix, opts, f)?;
        txn.commit()
    }

    /// Opens a cursor rooted at `root`, owning its own transaction. The
    /// transaction kind is chosen by [`CursorOptions`]: write by default,
    /// shared or MVCC when requested.
    pub fn cursor(&self, root: &[u8], opts: CursorOptions) -> Result<Cursor<'_, '_>> {
        let txn = if !opts.shared {
            self.begin_write()?
        } else if opts.mvcc {
            self.begin_mvcc()?
        } else {
            self.begin_read()?
        };
        Ok(Cursor::owned(txn, root, opts))
    }

    // ---- maintenance --------------------------------------------------

    /// Flushes the whole mapping to disk, even under `no_sync`.
    pub fn sync(&self) -> Result<()> {
        let (map, _) = self.shared.lock_current(false, !self.shared.non_blocking)?;
        let r = map.flush_range_always(0, map.len());
        self.shared.unlock_file(&map);
        self.shared.release_inproc(false);
        r
    }

    /// Verifies the structural invariants: chain order, checksums,
    /// ancestor chains, level nesting, and the live-record count.
    pub fn check_consistency(&self) -> Result<()> {
        let mut txn = self.begin_read()?;
        let r = check::run(&txn);
        txn.commit()?;
        if let Err(ref e) = r {
            self.shared.report(e);
        }
        r
    }

    /// Writes a human-readable record listing to `w`. Detail `1` lists
    /// records; `2` adds pointers and checksums.
    pub fn dump<W: Write>(&self, w: &mut W, detail: u32) -> Result<()> {
        let mut txn = self.begin_read()?;
        let r = check::dump(&txn, w, detail);
        txn.commit()?;
        r
    }

    // ---- metadata -----------------------------------------------------

    /// The canonicalised path this database was opened at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// The stable per-database UUID (survives repack).
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.shared.state.lock().header.uuid)
    }

    /// The repack generation; starts at 1.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.state.lock().header.generation
    }

    /// Number of live (non-tombstoned) keys.
    #[must_use]
    pub fn num_records(&self) -> u64 {
        self.shared.state.lock().header.num_records
    }

    /// Number of commits since creation or last repack.
    #[must_use]
    pub fn num_commits(&self) -> u64 {
        self.shared.state.lock().header.num_commits
    }

    /// Logical size: the end of committed data.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shared.state.lock().header.current_size
    }

    /// Dead bytes reclaimable by a repack.
    #[must_use]
    pub fn dirty_size(&self) -> u64 {
        self.shared.state.lock().header.dirty_size
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    Ok(std::fs::canonicalize(path)?)
}
