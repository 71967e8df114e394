//! Streaming cursors over the sorted key space.
//!
//! A cursor wraps a transaction — either one it owns (opened through
//! [`Db::cursor`](crate::Db::cursor)) or the caller's (through
//! [`Txn::cursor`]) — and walks the level-0 chain from a root key,
//! resolving snapshot visibility per entry. A cursor over a write
//! transaction may replace the entry it is parked on, which is the
//! supported way to mutate while iterating.

use crate::error::{Error, Result};
use crate::skiplist::{advance_loc, find_loc};
use crate::txn::Txn;

/// How a cursor iterates and which transaction kind a database-level
/// cursor opens.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorOptions {
    /// Open a shared (read) transaction instead of a write transaction.
    /// Ignored for [`Txn::cursor`], which inherits the transaction.
    pub shared: bool,
    /// With `shared`: freeze the snapshot (MVCC) instead of refreshing.
    pub mvcc: bool,
    /// Stop when keys no longer start with the root key.
    pub prefix: bool,
    /// Do not emit the entry exactly matching the root key.
    pub skip_root: bool,
}

enum Holder<'a, 'db> {
    Owned(Txn<'db>),
    Borrowed(&'a mut Txn<'db>),
}

/// A cursor; see the module docs. Obtained from
/// [`Db::cursor`](crate::Db::cursor) or [`Txn::cursor`].
pub struct Cursor<'a, 'db> {
    holder: Holder<'a, 'db>,
    root: Vec<u8>,
    prefix: bool,
    skip_root: bool,
    started: bool,
    done: bool,
}

macro_rules! txn_of {
    ($cursor:expr) => {
        match &mut $cursor.holder {
            Holder::Owned(t) => t,
            Holder::Borrowed(t) => &mut **t,
        }
    };
}

impl<'a, 'db> Cursor<'a, 'db> {
    pub(crate) fn owned(txn: Txn<'db>, root: &[u8], opts: CursorOptions) -> Cursor<'a, 'db> {
        Self::build(Holder::Owned(txn), root, opts)
    }

    fn build(holder: Holder<'a, 'db>, root: &[u8], opts: CursorOptions) -> Cursor<'a, 'db> {
        Cursor {
            holder,
            root: root.to_vec(),
            prefix: opts.prefix,
            skip_root: opts.skip_root,
            started: false,
            done: false,
        }
    }

    /// Advances to the next visible entry and returns it, or `None` when
    /// iteration is exhausted. The slices stay valid until the cursor (or
    /// its transaction) is used again.
    pub fn next(&mut self) -> Result<Option<(&[u8], &[u8])>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let on_root = !self.started;
            self.started = true;
            let txn = txn_of!(self);
            txn.ensure_locked()?;
            if on_root {
                let (ctx, loc, epoch) = txn.walk_parts();
                find_loc(&ctx, &self.root, loc, epoch)?;
                if txn.loc.match_off == 0 || self.skip_root {
                    continue;
                }
            } else {
                let (ctx, loc, epoch) = txn.walk_parts();
                advance_loc(&ctx, loc, epoch)?;
                if txn.loc.match_off == 0 {
                    self.done = true;
                    return Ok(None);
                }
            }
            if self.prefix && !self.root.is_empty() && !txn.loc.key.starts_with(&self.root) {
                self.done = true;
                return Ok(None);
            }
            if txn.visible_entry()?.is_some() {
                break;
            }
        }
        let txn = match &self.holder {
            Holder::Owned(t) => t,
            Holder::Borrowed(t) => &**t,
        };
        txn.visible_entry()
    }

    /// Replaces the value of the entry the cursor is parked on. Requires a
    /// write transaction.
    pub fn replace(&mut self, value: &[u8]) -> Result<()> {
        if !self.started || self.done {
            return Err(Error::BadUsage("cursor not positioned on an entry"));
        }
        let key = {
            let txn = txn_of!(self);
            if txn.loc.match_off == 0 {
                return Err(Error::BadUsage("cursor not positioned on an entry"));
            }
            txn.loc.key.clone()
        };
        txn_of!(self).store(&key, value)
    }

    /// Yields the underlying read transaction's lock; see
    /// [`Txn::yield_lock`].
    pub fn yield_lock(&mut self) -> Result<()> {
        txn_of!(self).yield_lock()
    }

    /// Commits the owned transaction, making any [`Cursor::replace`]
    /// effects durable. Refused for a cursor borrowed from a caller's
    /// transaction (commit that transaction instead).
    pub fn commit(self) -> Result<()> {
        match self.holder {
            Holder::Owned(txn) => txn.commit(),
            Holder::Borrowed(_) => Err(Error::BadUsage("commit of a borrowed cursor")),
        }
    }

    /// Aborts the owned transaction; a no-op for a borrowed one.
    pub fn abort(self) -> Result<()> {
        match self.holder {
            Holder::Owned(txn) => txn.abort(),
            Holder::Borrowed(_) => Ok(()),
        }
    }

    /// Detaches the cursor, leaving a borrowed transaction alive; an owned
    /// transaction is aborted.
    pub fn finish(self) -> Result<()> {
        self.abort()
    }
}

impl<'db> Txn<'db> {
    /// Opens a cursor inside this transaction. It sees the transaction's
    /// view — including its own uncommitted stores. `shared`/`mvcc` in the
    /// options are ignored; the transaction's kind governs.
    pub fn cursor<'a>(&'a mut self, root: &[u8], opts: CursorOptions) -> Cursor<'a, 'db> {
        Cursor::build(Holder::Borrowed(self), root, opts)
    }
}
