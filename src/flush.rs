//! Flush-list collaborator contract.
//!
//! The checkpoint/redo subsystem owns the ordering of dirty pages by
//! the LSN of their oldest unflushed modification; the pool only tells
//! it when pages become dirty, move, or are written back. [`FlushList`]
//! is the bundled implementation used by eviction and tests; an engine
//! embeds its own sink behind the same trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::descriptor::PageDescriptor;
use crate::common::Lsn;

/// Dirty-page tracking contract.
///
/// `oldest` is the page's `oldest_modification` at call time; it keys
/// the ordering and identifies the entry on removal.
pub trait FlushSink: Send + Sync {
    /// A clean page became dirty at `oldest`.
    fn enqueue_dirty(&self, desc: &Arc<PageDescriptor>, oldest: Lsn);

    /// A dirty page's descriptor moved to a new location (relocation
    /// keeps `oldest` unchanged).
    fn relocate(&self, old: &Arc<PageDescriptor>, new: &Arc<PageDescriptor>, oldest: Lsn);

    /// The page was written back (or discarded) and is clean again.
    fn remove(&self, desc: &Arc<PageDescriptor>, oldest: Lsn);

    /// Smallest `oldest_modification` currently tracked; the redo log
    /// may not be truncated past this point.
    fn oldest_lsn(&self) -> Option<Lsn>;

    /// Number of dirty pages tracked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// LSN-ordered dirty-page list.
pub struct FlushList {
    // Keyed by (oldest_modification, insertion seq) so equal LSNs keep
    // distinct entries in arrival order.
    inner: Mutex<Inner>,
}

struct Inner {
    entries: BTreeMap<(Lsn, u64), Arc<PageDescriptor>>,
    seq: u64,
}

impl FlushList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                seq: 0,
            }),
        }
    }

    /// Dirty pages in flush order (oldest first); snapshot for
    /// checkpoint-style sweeps.
    pub fn in_order(&self) -> Vec<Arc<PageDescriptor>> {
        self.inner.lock().entries.values().cloned().collect()
    }

    fn find_key(inner: &Inner, desc: &Arc<PageDescriptor>, oldest: Lsn) -> Option<(Lsn, u64)> {
        inner
            .entries
            .range((oldest, 0)..=(oldest, u64::MAX))
            .find(|(_, d)| Arc::ptr_eq(d, desc))
            .map(|(&k, _)| k)
    }
}

impl Default for FlushList {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushSink for FlushList {
    fn enqueue_dirty(&self, desc: &Arc<PageDescriptor>, oldest: Lsn) {
        debug_assert!(oldest != 0);
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        inner.entries.insert((oldest, seq), Arc::clone(desc));
    }

    fn relocate(&self, old: &Arc<PageDescriptor>, new: &Arc<PageDescriptor>, oldest: Lsn) {
        let mut inner = self.inner.lock();
        if let Some(key) = Self::find_key(&inner, old, oldest) {
            inner.entries.insert(key, Arc::clone(new));
        } else {
            debug_assert!(false, "relocating a page not on the flush list");
        }
    }

    fn remove(&self, desc: &Arc<PageDescriptor>, oldest: Lsn) {
        let mut inner = self.inner.lock();
        if let Some(key) = Self::find_key(&inner, desc, oldest) {
            inner.entries.remove(&key);
        }
    }

    fn oldest_lsn(&self) -> Option<Lsn> {
        self.inner
            .lock()
            .entries
            .keys()
            .next()
            .map(|&(lsn, _)| lsn)
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> Arc<PageDescriptor> {
        Arc::new(PageDescriptor::new_bare())
    }

    #[test]
    fn test_ordering_by_oldest_modification() {
        let list = FlushList::new();
        let (a, b, c) = (desc(), desc(), desc());

        list.enqueue_dirty(&a, 30);
        list.enqueue_dirty(&b, 10);
        list.enqueue_dirty(&c, 20);

        assert_eq!(list.oldest_lsn(), Some(10));
        let order = list.in_order();
        assert!(Arc::ptr_eq(&order[0], &b));
        assert!(Arc::ptr_eq(&order[1], &c));
        assert!(Arc::ptr_eq(&order[2], &a));
    }

    #[test]
    fn test_remove_specific_entry() {
        let list = FlushList::new();
        let (a, b) = (desc(), desc());

        // Same LSN; removal must pick the right descriptor.
        list.enqueue_dirty(&a, 5);
        list.enqueue_dirty(&b, 5);
        list.remove(&a, 5);

        assert_eq!(list.len(), 1);
        assert!(Arc::ptr_eq(&list.in_order()[0], &b));
    }

    #[test]
    fn test_relocate_keeps_position() {
        let list = FlushList::new();
        let (a, b, replacement) = (desc(), desc(), desc());
        list.enqueue_dirty(&a, 7);
        list.enqueue_dirty(&b, 9);

        list.relocate(&a, &replacement, 7);
        assert_eq!(list.len(), 2);
        assert_eq!(list.oldest_lsn(), Some(7));
        assert!(Arc::ptr_eq(&list.in_order()[0], &replacement));
    }

    #[test]
    fn test_empty() {
        let list = FlushList::new();
        assert!(list.is_empty());
        assert_eq!(list.oldest_lsn(), None);
    }
}
