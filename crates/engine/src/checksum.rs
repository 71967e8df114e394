//! Checksum engines for record heads and tails.
//!
//! Three engines exist, selected at file creation and persisted in the
//! header flags: the default (XXH64 truncated to its low 32 bits), a null
//! engine that always returns zero (testing only), and an externally
//! supplied function. The 96-byte file header does not use the selected
//! engine for its own checksum — it is always CRC32, so the header can be
//! verified before the engine flags it carries are trusted.

use xxhash_rust::xxh64::xxh64;

/// An externally supplied checksum function.
pub type ExternalChecksum = fn(&[u8]) -> u32;

/// Which record checksum engine a database uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumKind {
    /// XXH64 truncated to 32 bits. The default.
    #[default]
    Xxh64,
    /// Always zero. Only useful for tests and benchmarks.
    Null,
    /// A caller-supplied function, passed via
    /// [`OpenOptions::checksum_external`](crate::OpenOptions::checksum_external).
    External,
}

/// The resolved engine for one open database.
#[derive(Clone, Copy)]
pub(crate) struct ChecksumEngine {
    kind: ChecksumKind,
    external: Option<ExternalChecksum>,
    /// When false, stored checksums are neither computed for verification
    /// nor compared (the `no_checksum` open option). Writes still stamp
    /// whatever the engine produces.
    verify: bool,
}

impl ChecksumEngine {
    pub(crate) fn new(kind: ChecksumKind, external: Option<ExternalChecksum>, verify: bool) -> Self {
        Self {
            kind,
            external,
            verify,
        }
    }

    pub(crate) fn kind(&self) -> ChecksumKind {
        self.kind
    }

    pub(crate) fn external_fn(&self) -> Option<ExternalChecksum> {
        self.external
    }

    pub(crate) fn verifies(&self) -> bool {
        self.verify && self.kind != ChecksumKind::Null
    }

    /// Checksums a single contiguous region.
    pub(crate) fn sum(&self, data: &[u8]) -> u32 {
        match self.kind {
            ChecksumKind::Xxh64 => xxh64(data, 0) as u32,
            ChecksumKind::Null => 0,
            ChecksumKind::External => match self.external {
                Some(f) => f(data),
                // Guarded at open: an external flag without a function is
                // rejected with BadFormat before an engine is built.
                None => 0,
            },
        }
    }

    /// Checksums a record head given as discontiguous parts (the checksum
    /// fields themselves and the dual level-0 slots are excluded by the
    /// caller). Heads are small, so the parts are gathered on the stack and
    /// hashed as one buffer, which also keeps external engines to the
    /// simple `fn(&[u8]) -> u32` contract.
    pub(crate) fn sum_parts(&self, parts: &[&[u8]]) -> u32 {
        if self.kind == ChecksumKind::Null {
            return 0;
        }
        let mut buf = [0u8; 288];
        let mut len = 0;
        for part in parts {
            buf[len..len + part.len()].copy_from_slice(part);
            len += part.len();
        }
        self.sum(&buf[..len])
    }
}

/// CRC32 of the first 92 header bytes; stored in bytes 92..96.
pub(crate) fn header_checksum(header_prefix: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_prefix);
    hasher.finalize()
}
