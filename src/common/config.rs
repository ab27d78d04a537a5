//! Pool configuration.

use std::time::Duration;

use crate::storage::checksum::ChecksumAlgorithm;

/// Size of an uncompressed page in bytes (4KB).
///
/// Pages are aligned to 4096 bytes for efficient Direct I/O.
pub const PAGE_SIZE: usize = 4096;

/// Smallest buddy size class in bytes.
///
/// Compressed pages smaller than this still occupy one block of this
/// class; PAGE_SIZE is the largest class (one whole arena).
pub const BUDDY_LOW: usize = 1024;

/// Number of buddy size classes (BUDDY_LOW << (N-1) == PAGE_SIZE).
pub const BUDDY_CLASSES: usize = (PAGE_SIZE / BUDDY_LOW).trailing_zeros() as usize + 1;

/// Runtime-tunable configuration for a [`BufferPool`](crate::BufferPool).
///
/// All the policy knobs the pool exposes live here; construction fails
/// if the combination is unusable. Defaults are sized for tests — a
/// production embedder sets `total_blocks` and `instances` from its own
/// memory budget.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Total number of page frames across all instances.
    pub total_blocks: usize,

    /// Number of independent pool instances (identity-sharded).
    pub instances: usize,

    /// Hash partitions per instance; must be a power of two.
    pub hash_partitions: usize,

    /// Percentage of the LRU list kept in the "old" segment (5..=95).
    /// New pages enter at this boundary rather than at the head, so a
    /// single scan cannot flush the working set.
    pub old_ratio_pct: u32,

    /// A page in the old segment is promoted to the head only if its
    /// previous access is at least this long ago.
    pub old_threshold: Duration,

    /// LRU length below which no old segment is maintained.
    pub old_min_len: usize,

    /// Blocks inspected from the LRU tail per eviction attempt.
    pub eviction_scan_depth: usize,

    /// Full scan-plus-flush rounds before a free-block request gives up
    /// with [`Error::CapacityExhausted`](crate::Error).
    pub free_block_attempts: usize,

    /// Checksum algorithm stamped on writes and required on reads.
    pub checksum: ChecksumAlgorithm,

    /// Compress data pages on write-back.
    pub page_compression: bool,

    /// Watch sentinels per instance. One per concurrent background
    /// watcher is enough; exhaustion is a caller logic error.
    pub watch_pool_size: usize,

    /// Maximum buddy arenas (whole pages of compressed storage) per
    /// instance.
    pub buddy_arena_cap: usize,

    /// Re-reads attempted when a page looks corrupted (distinguishes a
    /// torn concurrent read from real corruption).
    pub io_read_retries: usize,

    /// Delay between such re-reads.
    pub io_retry_delay: Duration,

    /// Passes over a withdrawing chunk before shrink gives up.
    pub shrink_max_passes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            total_blocks: 256,
            instances: 1,
            hash_partitions: 16,
            old_ratio_pct: 37,
            old_threshold: Duration::from_millis(1000),
            old_min_len: 16,
            eviction_scan_depth: 100,
            free_block_attempts: 20,
            checksum: ChecksumAlgorithm::Crc32,
            page_compression: false,
            watch_pool_size: 4,
            buddy_arena_cap: 64,
            io_read_retries: 3,
            io_retry_delay: Duration::from_millis(10),
            shrink_max_passes: 100,
        }
    }
}

impl PoolConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns [`Error::Config`](crate::Error) describing the first
    /// offending field.
    pub fn validate(&self) -> crate::common::Result<()> {
        use crate::common::Error;

        if self.instances == 0 {
            return Err(Error::Config("instances must be > 0".into()));
        }
        if self.total_blocks < self.instances {
            return Err(Error::Config(format!(
                "total_blocks ({}) must cover every instance ({})",
                self.total_blocks, self.instances
            )));
        }
        if !self.hash_partitions.is_power_of_two() {
            return Err(Error::Config(format!(
                "hash_partitions ({}) must be a power of two",
                self.hash_partitions
            )));
        }
        if !(5..=95).contains(&self.old_ratio_pct) {
            return Err(Error::Config(format!(
                "old_ratio_pct ({}) must be within 5..=95",
                self.old_ratio_pct
            )));
        }
        if self.old_min_len < 4 {
            return Err(Error::Config("old_min_len must be at least 4".into()));
        }
        if self.watch_pool_size == 0 {
            return Err(Error::Config("watch_pool_size must be > 0".into()));
        }
        if self.eviction_scan_depth == 0 || self.free_block_attempts == 0 {
            return Err(Error::Config(
                "eviction_scan_depth and free_block_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Frames owned by one instance (the remainder goes to instance 0).
    pub fn blocks_per_instance(&self, instance_no: usize) -> usize {
        let base = self.total_blocks / self.instances;
        if instance_no == 0 {
            base + self.total_blocks % self.instances
        } else {
            base
        }
    }

    /// Old-segment ratio in 1/1024 units, as used by the boundary
    /// adjustment arithmetic.
    pub(crate) fn old_ratio_1024(&self) -> usize {
        self.old_ratio_pct as usize * 1024 / 100
    }
}
