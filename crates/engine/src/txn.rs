//! Transactions: the append-only write protocol, shared readers, and
//! frozen-snapshot (MVCC) readers.
//!
//! ## Write path
//!
//! A write transaction holds the exclusive data lock from begin to
//! commit/abort. Begin sets the header DIRTY bit and flushes it; every
//! store appends records at `written_size` and republishes level-0
//! successors through the dual-slot discipline; commit appends a COMMIT
//! record, flushes the appended range, then atomically advances the
//! header's `current_size` and clears DIRTY. Abort runs the crash-recovery
//! scrub, leaving the file indistinguishable from its pre-transaction
//! state.
//!
//! ## Read paths
//!
//! Both read kinds take the shared data lock. A plain reader's view is
//! `committed_size` as of its most recent lock acquisition; yielding and
//! re-acquiring refreshes it. An MVCC reader freezes its *visibility* end
//! at begin and keeps it across yields — even across a repack, because it
//! re-acquires against the same file identity — while its *traversal*
//! bound tracks the file's committed size so walks never follow pointers
//! into bytes it cannot see consistently. Visibility of an individual
//! record is then resolved by walking its ancestor chain below the frozen
//! end.

use std::ops::ControlFlow;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::db::Db;
use crate::error::{internal, Error, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::mapfile::MapFile;
use crate::record::{RecordBuilder, RecordView, Tag, BARE_RECORD_SIZE, MAX_LEVEL};
use crate::recovery;
use crate::skiplist::{
    advance_loc, choose_level, find_loc, set_level0, set_level_ptr, Loc, SkipCtx,
};

/// Default number of iteration callbacks between automatic lock yields.
const YIELD_EVERY: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnKind {
    Write,
    Read,
    Mvcc,
}

/// Conditions for [`Txn::store_cond`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cond {
    /// Unconditional upsert (or unconditional delete).
    #[default]
    Always,
    /// Fail with [`Error::NotFound`] unless the key is live.
    IfExist,
    /// Fail with [`Error::Exists`] if the key is live.
    IfNotExist,
}

/// Options for [`Txn::foreach_with`].
#[derive(Default)]
pub struct ForeachOptions<'a> {
    /// Do not emit the entry exactly matching the prefix itself.
    pub skip_exact: bool,
    /// Yield the lock before every callback instead of every 1024.
    pub always_yield: bool,
    /// Entries for which this returns false are skipped without invoking
    /// the callback.
    pub filter: Option<&'a mut dyn FnMut(&[u8], &[u8]) -> bool>,
}

/// One transaction. Obtained from [`Db::begin_write`], [`Db::begin_read`],
/// or [`Db::begin_mvcc`]; finished with [`Txn::commit`] or [`Txn::abort`].
/// A write transaction dropped without either is aborted.
///
/// Byte slices returned by fetches and passed to callbacks borrow the
/// mapping and stay valid until the next operation on the transaction.
pub struct Txn<'db> {
    pub(crate) db: &'db Db,
    kind: TxnKind,
    pub(crate) handle: Arc<MapFile>,
    /// Bumped whenever `handle` is replaced; invalidates cached positions.
    pub(crate) epoch: u64,
    /// Visibility end: offsets at or beyond it are not visible.
    pub(crate) end: u64,
    /// Traversal end: pointers at or beyond it are not followed.
    pub(crate) walk_end: u64,
    committed_size: u64,
    written_size: u64,
    /// `committed_size` at begin; a COMMIT record's start offset.
    start_size: u64,
    pub(crate) header: Header,
    locked: bool,
    done: bool,
    pub(crate) loc: Loc,
    rng: SmallRng,
    repacked: bool,
}

impl<'db> Txn<'db> {
    pub(crate) fn begin(db: &'db Db, kind: TxnKind) -> Result<Txn<'db>> {
        let shared = &db.shared;
        if kind == TxnKind::Write && shared.read_only {
            return Err(Error::Locked);
        }
        let exclusive = kind == TxnKind::Write;
        let block = !shared.non_blocking;
        let (handle, mut header) = shared.lock_current(exclusive, block)?;

        let unwind = |e: Error| {
            shared.unlock_file(&handle);
            shared.release_inproc(exclusive);
            e
        };

        if kind == TxnKind::Write && header.dirty() {
            // a writer in another process died mid-transaction after we
            // opened; scrub before touching anything
            header = recovery::recover(&handle, &shared.engine, shared.cmp).map_err(|e| {
                shared.report(&e);
                unwind(e)
            })?;
            shared.cache_header(&header);
        }

        let committed = header.current_size;
        let mut txn = Txn {
            db,
            kind,
            handle,
            epoch: 1,
            end: committed,
            walk_end: committed,
            committed_size: committed,
            written_size: committed,
            start_size: committed,
            header,
            locked: true,
            done: false,
            loc: Loc::default(),
            rng: SmallRng::from_entropy(),
            repacked: false,
        };

        if kind == TxnKind::Write {
            txn.header.set_dirty(true);
            if let Err(e) = txn.write_header() {
                txn.done = true;
                txn.locked = false;
                shared.unlock_file(&txn.handle);
                shared.release_inproc(true);
                return Err(e);
            }
        }
        Ok(txn)
    }

    fn is_write(&self) -> bool {
        self.kind == TxnKind::Write
    }

    // ---- locking -------------------------------------------------------

    /// Releases the data lock of a read transaction. A plain reader will
    /// observe the newest commit when it next operates; an MVCC reader's
    /// view stays frozen. Yielding a write transaction is refused.
    pub fn yield_lock(&mut self) -> Result<()> {
        if self.is_write() {
            return Err(Error::Locked);
        }
        if self.locked {
            self.db.shared.unlock_file(&self.handle);
            self.db.shared.release_inproc(false);
            self.locked = false;
        }
        Ok(())
    }

    /// Re-acquires the lock after a yield, refreshing the transaction's
    /// view per its kind.
    pub(crate) fn ensure_locked(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        let shared = &self.db.shared;
        let block = !shared.non_blocking;
        match self.kind {
            TxnKind::Write => Err(internal!("write transaction found unlocked")),
            TxnKind::Read => {
                let (handle, header) = shared.lock_current(false, block)?;
                if !Arc::ptr_eq(&handle, &self.handle) {
                    self.handle = handle;
                    self.epoch += 1;
                }
                self.committed_size = header.current_size;
                self.end = header.current_size;
                self.walk_end = header.current_size;
                self.header = header;
                self.locked = true;
                Ok(())
            }
            TxnKind::Mvcc => {
                // same file identity, even if the path was repacked over
                shared.acquire_inproc(false, block)?;
                if let Err(e) = shared.lock_file(&self.handle, false, block) {
                    shared.release_inproc(false);
                    return Err(e);
                }
                // pick up growth of this identity so the traversal bound
                // is reachable through the mapping
                let file_len = self.handle.file().metadata()?.len();
                if file_len > self.handle.len() {
                    self.handle = Arc::new(self.handle.catch_up()?);
                    self.epoch += 1;
                }
                let header = Header::decode(self.handle.bytes(0, HEADER_SIZE)?)?;
                self.committed_size = header.current_size;
                self.walk_end = header.current_size;
                self.header = header;
                // self.end stays frozen
                self.locked = true;
                Ok(())
            }
        }
    }

    fn release(&mut self) {
        if self.locked {
            self.db.shared.unlock_file(&self.handle);
            self.db.shared.release_inproc(self.is_write());
            self.locked = false;
        }
    }

    // ---- plumbing ------------------------------------------------------

    pub(crate) fn walk_parts(&mut self) -> (SkipCtx<'_>, &mut Loc, u64) {
        let ctx = SkipCtx {
            map: &self.handle,
            cmp: self.db.shared.cmp,
            end: self.walk_end,
            engine: &self.db.shared.engine,
            max_level: self.header.max_level.min(MAX_LEVEL as u32) as u8,
        };
        (ctx, &mut self.loc, self.epoch)
    }

    fn write_header(&self) -> Result<()> {
        self.handle.write_bytes(0, &self.header.encode())?;
        self.handle.flush_range(0, HEADER_SIZE)
    }

    /// Appends a record image at `written_size`, growing and remapping the
    /// file when needed. Returns the record's offset.
    fn append(&mut self, image: &[u8]) -> Result<u64> {
        debug_assert!(self.is_write());
        let offset = self.written_size;
        let needed = offset + image.len() as u64;
        if needed > self.handle.len() {
            let fresh = Arc::new(self.handle.grow(needed)?);
            self.db.shared.swap_handle(fresh.clone());
            self.handle = fresh;
            self.epoch += 1;
        }
        self.handle.write_bytes(offset, image)?;
        self.written_size = needed;
        // uncommitted appends are visible to this transaction's own reads
        self.end = needed;
        self.walk_end = needed;
        Ok(offset)
    }

    // ---- reads ---------------------------------------------------------

    /// Looks up `key`, returning its value slice if the key is live in
    /// this transaction's view.
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<&[u8]>> {
        self.ensure_locked()?;
        {
            let (ctx, loc, epoch) = self.walk_parts();
            find_loc(&ctx, key, loc, epoch)?;
        }
        self.visible_entry().map(|e| e.map(|(_, v)| v))
    }

    /// Returns the first live entry strictly after `key` in sort order.
    pub fn fetch_next(&mut self, key: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
        self.ensure_locked()?;
        {
            let (ctx, loc, epoch) = self.walk_parts();
            find_loc(&ctx, key, loc, epoch)?;
        }
        loop {
            {
                let (ctx, loc, epoch) = self.walk_parts();
                advance_loc(&ctx, loc, epoch)?;
            }
            if self.loc.match_off == 0 {
                return Ok(None);
            }
            if self.visible_entry()?.is_some() {
                break;
            }
        }
        self.visible_entry()
    }

    /// Resolves the current position to the entry this transaction sees:
    /// walks the ancestor chain below the frozen end for MVCC readers and
    /// turns tombstones into absence.
    pub(crate) fn visible_entry(&self) -> Result<Option<(&[u8], &[u8])>> {
        let mut offset = if self.loc.deleted_off != 0 {
            self.loc.deleted_off
        } else {
            self.loc.match_off
        };
        if offset == 0 {
            return Ok(None);
        }
        let data = self.handle.as_slice();
        loop {
            let v = RecordView::parse(data, offset, self.walk_end)?;
            if offset < self.end {
                if v.tag == Tag::Delete {
                    return Ok(None);
                }
                if let Err(e) = v.verify_tail(&self.db.shared.engine) {
                    self.db.shared.report(&e);
                    return Err(e);
                }
                return Ok(Some((v.key(), v.value())));
            }
            // too new for this snapshot: look at the version it superseded
            offset = v.ancestor;
            if offset == 0 {
                return Ok(None);
            }
        }
    }

    /// Iterates live entries whose keys start with `prefix`, in sort
    /// order. The callback returns [`ControlFlow::Break`] to stop early.
    pub fn foreach<F>(&mut self, prefix: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.foreach_with(prefix, ForeachOptions::default(), f)
    }

    /// [`Txn::foreach`] with filtering, skip-exact, and yield control.
    pub fn foreach_with<F>(
        &mut self,
        prefix: &[u8],
        mut opts: ForeachOptions<'_>,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        self.ensure_locked()?;
        {
            let (ctx, loc, epoch) = self.walk_parts();
            find_loc(&ctx, prefix, loc, epoch)?;
        }
        let mut on_match = self.loc.match_off != 0 && !opts.skip_exact;
        let mut callbacks: u32 = 0;
        loop {
            if !on_match {
                self.ensure_locked()?;
                let (ctx, loc, epoch) = self.walk_parts();
                advance_loc(&ctx, loc, epoch)?;
                if loc.match_off == 0 {
                    break;
                }
            }
            on_match = false;
            if !prefix.is_empty() && !self.loc.key.starts_with(prefix) {
                break;
            }
            if let Some((key, value)) = self.visible_entry()? {
                let wanted = match opts.filter.as_deref_mut() {
                    Some(filter) => filter(key, value),
                    None => true,
                };
                if wanted {
                    if let ControlFlow::Break(()) = f(key, value) {
                        break;
                    }
                    callbacks += 1;
                    if self.auto_yield(callbacks, opts.always_yield) {
                        self.yield_lock()?;
                    }
                }
            }
        }
        Ok(())
    }

    fn auto_yield(&self, callbacks: u32, always: bool) -> bool {
        if self.is_write() || self.db.shared.no_yield {
            return false;
        }
        always || callbacks % YIELD_EVERY == 0
    }

    // ---- writes --------------------------------------------------------

    /// Stores `value` under `key`, inserting or replacing.
    pub fn store(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store_cond(key, Some(value), Cond::Always)
    }

    /// Deletes `key`. Deleting an absent key is a no-op.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.store_cond(key, None, Cond::Always)
    }

    /// Stores or deletes with a condition. `None` deletes; an empty slice
    /// stores an empty value, which is distinct from absence. On a refused
    /// condition nothing is appended.
    pub fn store_cond(&mut self, key: &[u8], value: Option<&[u8]>, cond: Cond) -> Result<()> {
        if !self.is_write() {
            return Err(Error::ReadOnly);
        }
        {
            let (ctx, loc, epoch) = self.walk_parts();
            find_loc(&ctx, key, loc, epoch)?;
        }
        let live = self.loc.match_off != 0 && self.loc.deleted_off == 0;
        match cond {
            Cond::IfExist if !live => return Err(Error::NotFound),
            Cond::IfNotExist if live => return Err(Error::Exists),
            _ => {}
        }
        match value {
            Some(value) if self.loc.match_off != 0 => self.replace_record(key, value),
            Some(value) => self.insert_record(key, value),
            None if live => self.delete_record(),
            None => Ok(()), // deleting what is not there
        }
    }

    /// A brand-new key: append an ADD at a freshly drawn level and splice
    /// it in after the predecessors located at every level.
    fn insert_record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let level = choose_level(&mut self.rng);
        let mut slots = vec![0u64; level as usize + 1];
        {
            let (ctx, loc, _) = self.walk_parts();
            let pred0 = ctx.decode(loc.backloc[0])?;
            slots[0] = ctx.advance0(&pred0)?;
            for k in 1..level {
                let pred = ctx.decode(loc.backloc[k as usize])?;
                slots[k as usize + 1] = ctx.level_ptr(&pred, k)?;
            }
        }
        let image = RecordBuilder::data(key, value, None, &slots, &self.db.shared.engine);
        let offset = self.append(&image)?;
        self.link(offset, level)?;
        if level as u32 > self.header.max_level {
            // deferred to the header write at commit
            self.header.max_level = level as u32;
        }
        self.header.num_records += 1;
        self.point_loc_at(offset, key);
        Ok(())
    }

    /// An existing key (live or tombstoned): append a REPLACE that takes
    /// over the matched record's level and forward pointers, with its
    /// ancestor preserving the version history.
    fn replace_record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let victim_off = self.loc.match_off;
        let tombstone = self.loc.deleted_off;
        let ancestor = if tombstone != 0 { tombstone } else { victim_off };
        let (level, victim_size, slots) = {
            let (ctx, _, _) = self.walk_parts();
            let victim = ctx.decode(victim_off)?;
            let level = victim.level;
            let mut slots = vec![0u64; level as usize + 1];
            slots[0] = ctx.advance0(&victim)?;
            for k in 1..level {
                slots[k as usize + 1] = ctx.level_ptr(&victim, k)?;
            }
            (level, victim.size(), slots)
        };
        let image = RecordBuilder::data(key, value, Some(ancestor), &slots, &self.db.shared.engine);
        let offset = self.append(&image)?;
        self.link(offset, level)?;
        if tombstone != 0 {
            // the key comes back to life; its dead bytes were accounted
            // when it was tombstoned
            self.header.num_records += 1;
        } else {
            self.header.dirty_size += victim_size + 8;
        }
        self.point_loc_at(offset, key);
        Ok(())
    }

    /// Tombstone the matched record: a DELETE threads in front of it on
    /// the level-0 chain, and the record keeps carrying the chain until a
    /// later store or a repack unthreads the pair.
    fn delete_record(&mut self) -> Result<()> {
        let victim_off = self.loc.match_off;
        let victim_size = {
            let (ctx, _, _) = self.walk_parts();
            ctx.decode(victim_off)?.size()
        };
        let image = RecordBuilder::delete(victim_off, &self.db.shared.engine);
        let offset = self.append(&image)?;
        self.link(offset, 0)?;
        self.header.num_records -= 1;
        self.header.dirty_size += victim_size + BARE_RECORD_SIZE;
        self.loc.deleted_off = offset;
        self.loc.end = self.walk_end;
        self.loc.epoch = self.epoch;
        Ok(())
    }

    /// Splices the appended record in after the located predecessors:
    /// level 0 through the dual-slot discipline, skip levels 1..`level` by
    /// direct pointer rewrite under the exclusive lock.
    fn link(&mut self, offset: u64, level: u8) -> Result<()> {
        let committed = self.committed_size;
        let (ctx, loc, _) = self.walk_parts();
        let pred0 = ctx.decode(loc.backloc[0])?;
        set_level0(ctx.map, &pred0, offset, committed)?;
        for k in 1..level {
            let pred = ctx.decode(loc.backloc[k as usize])?;
            set_level_ptr(ctx.map, ctx.engine, &pred, k, offset)?;
        }
        Ok(())
    }

    fn point_loc_at(&mut self, offset: u64, key: &[u8]) {
        self.loc.match_off = offset;
        self.loc.deleted_off = 0;
        self.loc.key.clear();
        self.loc.key.extend_from_slice(key);
        self.loc.end = self.walk_end;
        self.loc.epoch = self.epoch;
        self.loc.valid = true;
    }

    // ---- lifecycle -----------------------------------------------------

    /// Commits. For a write transaction: append COMMIT, flush the appended
    /// bytes, publish the new header (advancing `current_size`, clearing
    /// DIRTY), flush it, release the lock. For readers this just releases.
    pub fn commit(mut self) -> Result<()> {
        self.finish(true)
    }

    /// Aborts. A write transaction's in-place slot updates are scrubbed by
    /// the recovery procedure, leaving the file as it was at begin. For
    /// readers this is identical to [`Txn::commit`].
    pub fn abort(mut self) -> Result<()> {
        self.finish(false)
    }

    /// Marks that this transaction finishes a repack; the commit stamps
    /// `repack_size` with the resulting file size.
    pub(crate) fn mark_repacked(&mut self) {
        self.repacked = true;
    }

    fn finish(&mut self, commit: bool) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if !self.is_write() {
            self.release();
            return Ok(());
        }
        let result = if commit { self.do_commit() } else { self.do_abort() };
        self.release();
        result
    }

    fn do_commit(&mut self) -> Result<()> {
        if self.written_size != self.start_size {
            let image = RecordBuilder::commit(self.start_size, &self.db.shared.engine);
            self.append(&image)?;
            self.handle
                .flush_range(self.start_size, self.written_size - self.start_size)?;
            self.header.current_size = self.written_size;
            self.header.num_commits += 1;
        }
        if self.repacked {
            self.header.repack_size = self.header.current_size;
        }
        self.header.set_dirty(false);
        self.write_header()?;
        self.db.shared.cache_header(&self.header);
        Ok(())
    }

    fn do_abort(&mut self) -> Result<()> {
        if self.written_size != self.start_size {
            recovery::scrub(&self.handle, &self.db.shared.engine, self.start_size)?;
            self.handle.flush_all()?;
        }
        // the on-disk header still holds the pre-transaction state apart
        // from the DIRTY bit we set at begin
        let mut header = Header::decode(self.handle.bytes(0, HEADER_SIZE)?)?;
        header.set_dirty(false);
        self.header = header;
        self.write_header()?;
        self.db.shared.cache_header(&self.header);
        Ok(())
    }

    /// Walks away from the transaction as a crashed process would: locks
    /// are dropped but the DIRTY bit and any appended bytes stay in place.
    /// The next writable open runs recovery. Only useful for testing the
    /// recovery path (the CLI's `damage` action).
    pub fn abandon(mut self) {
        self.done = true;
        self.release();
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.done {
            // abort writers, release readers; errors cannot propagate here
            let _ = self.finish(false);
        }
    }
}
