//! Buffer pool management.
//!
//! The in-memory page cache between the access layer and disk:
//! - [`BufferPool`] - the pool-of-instances manager and public API
//! - [`PageReadGuard`] / [`PageWriteGuard`] - RAII latched-page access
//! - [`OptimisticHandle`] - lock-free re-entry via the modify clock
//! - [`WatchOutcome`] - the sentinel-based existence watch
//! - [`PoolStats`] / [`StatsSnapshot`] - performance counters
//!
//! Internals: per-page descriptors with a tagged state machine, a
//! partitioned hash index, a midpoint-insertion LRU with an unzip
//! sub-list, a binary buddy allocator for compressed images, and the
//! I/O completion pipeline.

pub(crate) mod buddy;
pub(crate) mod chunk;
mod completion;
pub(crate) mod descriptor;
mod guard;
mod instance;
pub(crate) mod list;
pub(crate) mod lru;
pub(crate) mod page_table;
mod pool;
mod stats;
pub(crate) mod watch;

pub use buddy::{BuddyHandle, BuddyStats};
pub use descriptor::{DescMeta, IoFix, PageDescriptor, PageState, ZipData};
pub use guard::{LatchMode, LatchedPage, OptimisticHandle, PageReadGuard, PageWriteGuard};
pub use pool::BufferPool;
pub use stats::{PoolStats, StatsSnapshot};
pub use watch::WatchOutcome;
