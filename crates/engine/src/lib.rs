//! # ebbkv — a single-file, memory-mapped, ordered key-value store
//!
//! A database is one regular file holding a skiplist of records, accessed
//! through a shared memory mapping. Keys and values are arbitrary byte
//! strings (NULs included). Writes are crash-safe transactions; readers
//! are either *shared* (refreshed to the newest commit on every lock
//! acquisition) or *MVCC* (frozen at a point-in-time snapshot); an online
//! repack compacts the file while both keep running.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌───────────────────────────────────────────────────┐
//! │                      ebbkv                        │
//! │                                                   │
//! │ db.rs       open / registry / one-shot ops        │
//! │   |                                               │
//! │   v                                               │
//! │ txn.rs      write txn ─ append records, publish   │
//! │             read txn ── refresh-on-resume view    │
//! │             mvcc txn ── frozen snapshot view      │
//! │   |                                               │
//! │   v                                               │
//! │ skiplist.rs locate / advance0 / dual-slot writes  │
//! │ record.rs   seven record kinds, checksummed       │
//! │ mapfile.rs  mmap, growth, flush                   │
//! │ lock.rs     fcntl byte-range locks                │
//! │                                                   │
//! │ recovery.rs scrub after dirty shutdown            │
//! │ repack.rs   online compaction into <name>.NEW     │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Crash safety
//!
//! All mutation is append-only except one thing: each record carries *two*
//! level-0 forward slots, and publishing a successor overwrites whichever
//! slot does not point into committed data — a single aligned 64-bit
//! store. The header's DIRTY bit brackets every write transaction; if a
//! process dies inside one, recovery walks the chains and zeroes every
//! pointer that refers past the committed end, restoring the exact
//! pre-transaction structure.
//!
//! ## Example
//!
//! ```no_run
//! use ebbkv::Db;
//!
//! let db = Db::options().create(true).open("/tmp/example.ebb")?;
//! let mut txn = db.begin_write()?;
//! txn.store(b"hello", b"world")?;
//! txn.commit()?;
//! assert_eq!(db.fetch(b"hello")?.as_deref(), Some(&b"world"[..]));
//! # Ok::<(), ebbkv::Error>(())
//! ```

mod check;
mod checksum;
mod cursor;
mod db;
mod error;
mod header;
mod lock;
mod mapfile;
mod record;
mod recovery;
mod repack;
mod skiplist;
mod txn;

pub use checksum::{ChecksumKind, ExternalChecksum};
pub use cursor::{Cursor, CursorOptions};
pub use db::{Db, ErrorHook, OpenOptions};
pub use error::{Error, Result};
pub use skiplist::{byte_order, Comparator};
pub use txn::{Cond, ForeachOptions, Txn};

#[cfg(test)]
mod tests;
