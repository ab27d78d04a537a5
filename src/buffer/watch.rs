//! Watch / sentinel registry.
//!
//! A background consumer (typically purge) wants to know "did this
//! page get loaded while I was not holding any lock" without blocking
//! normal traffic. It plants a sentinel descriptor in the hash index;
//! a later real load replaces the sentinel (transferring its reference
//! count onto the real descriptor), so `occurred` is a single hash
//! probe: the slot no longer holds a sentinel.
//!
//! The sentinel pool is small and fixed. One watcher per concurrent
//! background worker is the design bound; running out is a logic
//! error, not a resource condition, and panics.

use std::sync::Arc;

use crate::buffer::descriptor::{PageDescriptor, PageState};
use crate::buffer::page_table::PageTable;
use crate::common::PageId;

/// Outcome of [`WatchRegistry::set_watch`].
#[derive(Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The page is already resident; no watch was planted.
    AlreadyLoaded,
    /// A sentinel now occupies the identity's hash slot.
    Watching,
}

/// Fixed pool of watch sentinels for one pool instance.
pub struct WatchRegistry {
    sentinels: Vec<Arc<PageDescriptor>>,
}

impl WatchRegistry {
    pub fn new(size: usize) -> Self {
        Self {
            sentinels: (0..size)
                .map(|_| Arc::new(PageDescriptor::new_watch_sentinel()))
                .collect(),
        }
    }

    /// Register interest in `id`.
    ///
    /// If a real descriptor exists the watch is unnecessary and none is
    /// planted. Re-watching an already-watched identity stacks another
    /// reference on the same sentinel.
    ///
    /// # Panics
    /// Panics when the sentinel pool is exhausted; the number of
    /// concurrent watchers is bounded by design.
    pub fn set_watch(&self, table: &PageTable, id: PageId) -> WatchOutcome {
        let mut bucket = table.write_lock(id);
        match PageTable::lookup_also_watch(&bucket, id) {
            Some(existing) if existing.is_watch_sentinel() => {
                existing.fix();
                WatchOutcome::Watching
            }
            Some(_) => WatchOutcome::AlreadyLoaded,
            None => {
                let sentinel = self.claim(id);
                sentinel.fix();
                PageTable::insert(&mut bucket, id, sentinel);
                WatchOutcome::Watching
            }
        }
    }

    fn claim(&self, id: PageId) -> Arc<PageDescriptor> {
        for s in &self.sentinels {
            let mut meta = s.meta();
            if meta.state == PageState::Unused {
                meta.state = PageState::Watch;
                meta.id = id;
                return Arc::clone(s);
            }
        }
        panic!("watch sentinel pool exhausted: more concurrent watchers than the pool was built for");
    }

    /// Did a real load happen since the watch was set?
    pub fn occurred(&self, table: &PageTable, id: PageId) -> bool {
        let bucket = table.read_lock(id);
        match PageTable::lookup_also_watch(&bucket, id) {
            Some(d) => !d.is_watch_sentinel(),
            None => {
                // The watcher's reference keeps the entry alive, real
                // or sentinel, until unset_watch.
                debug_assert!(false, "occurred({id}) without an outstanding watch");
                true
            }
        }
    }

    /// Drop one watch reference on `id`.
    ///
    /// If the slot still holds the sentinel and this was the last
    /// reference, the sentinel leaves the hash index and returns to the
    /// pool. If a real load replaced the sentinel, the reference now
    /// lives on the real descriptor and is released there.
    pub fn unset_watch(&self, table: &PageTable, id: PageId) {
        let mut bucket = table.write_lock(id);
        match PageTable::lookup_also_watch(&bucket, id) {
            Some(d) if d.is_watch_sentinel() => {
                if d.unfix() == 0 {
                    PageTable::remove(&mut bucket, id);
                    d.meta().state = PageState::Unused;
                }
            }
            Some(d) => {
                // A real load replaced the sentinel; the reference was
                // transferred onto the real descriptor.
                d.unfix();
                let mut meta = d.meta();
                if meta.watch_fixes > 0 {
                    meta.watch_fixes -= 1;
                }
            }
            None => {
                debug_assert!(false, "unset_watch({id}) without an outstanding watch");
            }
        }
    }

    /// Put a sentinel carrying `fixes` references back into a hash
    /// slot. Used when a read failed after the watchers' references
    /// had already been transferred onto the loading block: the world
    /// must look as it did before the load began. Caller holds the
    /// partition write lock and inserts the returned sentinel.
    pub fn replant(&self, id: PageId, fixes: u32) -> Arc<PageDescriptor> {
        let sentinel = self.claim(id);
        sentinel.add_fixes(fixes);
        sentinel
    }
}
