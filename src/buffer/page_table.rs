//! Partitioned page hash index.
//!
//! The single source of truth for "is this page resident". Locks are
//! sharded over a power-of-two number of partitions, independent of
//! the instance's coarse list lock; every operation requires the
//! caller to hold the partition guard covering the identity, which is
//! why the mutating helpers take the map out of the guard explicitly —
//! the borrow checker then enforces the locking contract.
//!
//! Watch sentinels live in the same maps as real descriptors; readers
//! that must not treat a watch as a hit go through [`lookup`], which
//! filters them, while the watch machinery uses [`lookup_also_watch`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::descriptor::PageDescriptor;
use crate::common::PageId;

type Bucket = HashMap<PageId, Arc<PageDescriptor>>;

/// Hash index over one pool instance's pages.
pub struct PageTable {
    partitions: Vec<RwLock<Bucket>>,
    mask: u64,
}

impl PageTable {
    /// `n_partitions` must be a power of two.
    pub fn new(n_partitions: usize) -> Self {
        assert!(n_partitions.is_power_of_two());
        Self {
            partitions: (0..n_partitions)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            mask: (n_partitions - 1) as u64,
        }
    }

    #[inline]
    fn index_of(&self, id: PageId) -> usize {
        (id.fold() & self.mask) as usize
    }

    /// Shared lock on the partition covering `id`.
    pub fn read_lock(&self, id: PageId) -> RwLockReadGuard<'_, Bucket> {
        self.partitions[self.index_of(id)].read()
    }

    /// Exclusive lock on the partition covering `id`.
    pub fn write_lock(&self, id: PageId) -> RwLockWriteGuard<'_, Bucket> {
        self.partitions[self.index_of(id)].write()
    }

    /// Exclusive locks on every partition, in index order (the
    /// stop-the-world step of resize).
    pub fn write_lock_all(&self) -> Vec<RwLockWriteGuard<'_, Bucket>> {
        self.partitions.iter().map(|p| p.write()).collect()
    }

    /// Find a real (non-sentinel) descriptor.
    pub fn lookup(bucket: &Bucket, id: PageId) -> Option<Arc<PageDescriptor>> {
        bucket
            .get(&id)
            .filter(|d| !d.is_watch_sentinel())
            .cloned()
    }

    /// Find whatever occupies the slot, watch sentinels included.
    pub fn lookup_also_watch(bucket: &Bucket, id: PageId) -> Option<Arc<PageDescriptor>> {
        bucket.get(&id).cloned()
    }

    /// Insert a descriptor for `id`. The slot must be empty.
    pub fn insert(bucket: &mut Bucket, id: PageId, desc: Arc<PageDescriptor>) {
        let prev = bucket.insert(id, desc);
        debug_assert!(prev.is_none(), "duplicate hash entry for {id}");
    }

    /// Remove the entry for `id`.
    pub fn remove(bucket: &mut Bucket, id: PageId) -> Option<Arc<PageDescriptor>> {
        bucket.remove(&id)
    }

    /// Swap the entry for `id` in place: the relocation primitive. A
    /// concurrent reader sees either the old or the new descriptor,
    /// never a gap.
    pub fn replace(
        bucket: &mut Bucket,
        id: PageId,
        new: Arc<PageDescriptor>,
    ) -> Option<Arc<PageDescriptor>> {
        bucket.insert(id, new)
    }

    /// Total entries (watch sentinels included); for introspection.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compact every partition map; called after a shrink removed many
    /// entries.
    pub fn compact(&self) {
        for p in &self.partitions {
            p.write().shrink_to_fit();
        }
    }
}
