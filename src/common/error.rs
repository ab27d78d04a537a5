//! Error types for pagepool.

use crate::common::PageId;

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the pool surfaces to its callers.
///
/// Internal races (a descriptor relocated between lock releases) are
/// always retried inside the pool and never appear here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested page does not exist on disk.
    #[error("page {0} not found")]
    PageNotFound(PageId),

    /// No free block after the full eviction effort. The pool is
    /// under-provisioned for its workload; not retryable.
    #[error("buffer pool capacity exhausted: no block could be freed")]
    CapacityExhausted,

    /// Checksum mismatch on an otherwise plausible page. `fatal` is set
    /// for the system tablespace's metadata pages, whose corruption the
    /// engine cannot survive.
    #[error("page {id} is corrupted (fatal: {fatal})")]
    Corrupted { id: PageId, fatal: bool },

    /// The encrypted image carried a valid checksum but the decrypted
    /// content does not check out — a wrong key and corruption are
    /// indistinguishable here.
    #[error("page {0} failed post-decryption validation (bad key version or corruption)")]
    DecryptionFailed(PageId),

    /// The containing tablespace was dropped concurrently. Expected
    /// under DDL; the caller should abandon the request.
    #[error("tablespace {0} no longer exists")]
    TablespaceGone(u32),

    /// A long wait was abandoned because the pool is shutting down.
    #[error("operation interrupted by shutdown")]
    Interrupted,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}
