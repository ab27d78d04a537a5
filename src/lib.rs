//! pagepool - a sharded page buffer pool for an on-disk storage engine.
//!
//! The pool caches fixed-size disk pages in memory, loading them on
//! demand and writing dirty pages back under explicit ordering rules.
//!
//! # Architecture
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          BufferPool                            │
//! │   identity ── fold ──▶ PoolInstance (one of N, own locks)      │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │ partitioned hash index   ──▶  PageDescriptor             │  │
//! │  │ LRU (midpoint insertion) ──▶  frame | compressed image   │  │
//! │  │ free list / unzip list        buddy allocator            │  │
//! │  │ watch sentinels               I/O completion pipeline    │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! │        ▼                         ▼                    ▼        │
//! │   IoBackend                 PageEncryptor /        FlushSink   │
//! │   (disk pages)              PageCompressor         (dirty set) │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`buffer`] - the pool, instances, guards, eviction, watch
//! - [`storage`] - page format, checksums, I/O and crypto contracts
//! - [`flush`] - the dirty-page collaborator contract
//! - [`common`] - identifiers, configuration, errors
//!
//! # Quick start
//! ```no_run
//! use std::sync::Arc;
//! use pagepool::{BufferPool, FileIo, LatchMode, PageId, PoolConfig};
//!
//! let io = Arc::new(FileIo::open("./data").unwrap());
//! io.create_space(1).unwrap();
//! let pool = BufferPool::new(PoolConfig::default(), io).unwrap();
//!
//! let id = PageId::new(1, 0);
//! let mut page = pool.get_page_exclusive(id).unwrap();
//! page.data_mut()[100] = 0xAB;
//! page.mark_dirty(42);
//! drop(page);
//!
//! pool.flush_all().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod flush;
pub mod storage;

pub use buffer::{
    BufferPool, LatchMode, LatchedPage, OptimisticHandle, PageReadGuard, PageWriteGuard,
    StatsSnapshot, WatchOutcome,
};
pub use common::{Error, Lsn, PageId, PoolConfig, Result, PAGE_SIZE};
pub use flush::{FlushList, FlushSink};
pub use storage::checksum::ChecksumAlgorithm;
pub use storage::{FileIo, IoBackend, NoEncryption, PageCompressor, PageEncryptor, SnapCompressor};
