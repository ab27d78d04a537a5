//! LRU, free-list and unzip-list bookkeeping.
//!
//! [`LruManager`] is the state behind one instance's coarse lock. All
//! methods assume that lock is held; nothing here locks it. The
//! descriptor meta mutex *is* taken where the old flag lives, so
//! callers must not hold any meta mutex when calling in (coarse before
//! meta is the lock order).
//!
//! # Scan resistance
//! A freshly loaded page is inserted at the old/young boundary rather
//! than at the head, with the boundary kept near `old_ratio_pct` of the
//! list by [`adjust_old_boundary`](LruManager::adjust_old_boundary). A
//! page read once by a table scan therefore ages out from the old
//! segment without ever displacing the young working set. Promotion to
//! the head happens in [`make_young`](LruManager::make_young) and is
//! gated by the caller's too-old test.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::chunk::Chunk;
use crate::buffer::descriptor::{PageDescriptor, PageState};
use crate::buffer::list::{DescList, NIL};
use crate::common::PoolConfig;

/// Allowed drift of the old segment from its target length before the
/// boundary is walked back into place.
const OLD_TOLERANCE: usize = 1;

/// Coarse-locked list state of one pool instance.
pub struct LruManager {
    pub chunks: Vec<Chunk>,
    pub free: Vec<Arc<PageDescriptor>>,
    pub lru: DescList,
    pub unzip: DescList,
    /// First block of the old segment (NIL while the list is short).
    lru_old: u32,
    /// Blocks from the boundary to the tail, inclusive.
    old_len: usize,
    next_chunk_id: u64,
}

impl LruManager {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            free: Vec::new(),
            lru: DescList::new(),
            unzip: DescList::new(),
            lru_old: NIL,
            old_len: 0,
            next_chunk_id: 0,
        }
    }

    /// Allocate a chunk of `n_blocks` and put every block on the free
    /// list. Returns the chunk id.
    pub fn add_chunk(&mut self, n_blocks: usize) -> u64 {
        let id = self.reserve_chunk_id();
        let chunk = Chunk::new(id, n_blocks);
        self.free.extend(chunk.blocks.iter().cloned());
        self.chunks.push(chunk);
        id
    }

    /// Reserve a chunk id so grow can build the chunk outside the
    /// stop-the-world window.
    pub fn reserve_chunk_id(&mut self) -> u64 {
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;
        id
    }

    /// Whether a chunk is currently withdrawing.
    pub fn chunk_withdrawing(&self, chunk_id: u64) -> bool {
        self.chunks
            .iter()
            .any(|c| c.id == chunk_id && c.withdrawing)
    }

    /// Pop a usable free block, skipping (and parking) blocks of
    /// withdrawing chunks.
    pub fn pop_free(&mut self) -> Option<Arc<PageDescriptor>> {
        while let Some(block) = self.free.pop() {
            if self.chunk_withdrawing(block.chunk_id()) {
                // Parked: the chunk keeps its Arc until shrink drops it.
                continue;
            }
            block.meta().state = PageState::ReadyForUse;
            return Some(block);
        }
        None
    }

    /// Return a block to the free list.
    pub fn push_free(&mut self, block: Arc<PageDescriptor>) {
        debug_assert!(block.is_block());
        block.meta().reset();
        if !self.chunk_withdrawing(block.chunk_id()) {
            self.free.push(block);
        }
    }

    /// Frames available without eviction.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Usable capacity: blocks of non-withdrawing chunks.
    pub fn capacity(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| !c.withdrawing)
            .map(|c| c.len())
            .sum()
    }

    // ========================================================================
    // LRU insertion / removal
    // ========================================================================

    /// Insert a page at the midpoint (or at the head while the list is
    /// too short for an old segment). Stamps the access time: the get
    /// that caused the load is the first access.
    pub fn lru_insert(&mut self, desc: &Arc<PageDescriptor>, cfg: &PoolConfig) {
        debug_assert_eq!(desc.lru_node(), NIL);

        if self.lru_old == NIL {
            let node = self.lru.push_front(Arc::clone(desc));
            desc.set_lru_node(node);
            {
                let mut meta = desc.meta();
                meta.old = false;
                meta.access_time = Some(Instant::now());
            }
            if self.lru.len() >= cfg.old_min_len {
                self.old_init(cfg);
            }
        } else {
            // The new page becomes the first block of the old segment.
            let node = self.lru.insert_before(self.lru_old, Arc::clone(desc));
            desc.set_lru_node(node);
            self.lru_old = node;
            self.old_len += 1;
            {
                let mut meta = desc.meta();
                meta.old = true;
                meta.access_time = Some(Instant::now());
            }
            self.adjust_old_boundary(cfg);
        }
    }

    /// First time the list reaches `old_min_len`: everything becomes
    /// old, then the boundary walks to its target position.
    fn old_init(&mut self, cfg: &PoolConfig) {
        debug_assert_eq!(self.lru_old, NIL);
        let mut cur = self.lru.head();
        while cur != NIL {
            self.lru.get(cur).meta().old = true;
            cur = self.lru.next(cur);
        }
        self.lru_old = self.lru.head();
        self.old_len = self.lru.len();
        self.adjust_old_boundary(cfg);
    }

    /// Dissolve the old segment when the list shrinks below the
    /// threshold.
    fn old_dissolve(&mut self) {
        let mut cur = self.lru.head();
        while cur != NIL {
            self.lru.get(cur).meta().old = false;
            cur = self.lru.next(cur);
        }
        self.lru_old = NIL;
        self.old_len = 0;
    }

    /// Walk the boundary until the old segment is within tolerance of
    /// `old_ratio_pct` of the list.
    pub fn adjust_old_boundary(&mut self, cfg: &PoolConfig) {
        if self.lru_old == NIL {
            return;
        }
        let target = cfg.old_ratio_1024() * self.lru.len() / 1024;

        while self.old_len > target + OLD_TOLERANCE {
            // Shrink: the boundary block joins the young segment.
            let next = self.lru.next(self.lru_old);
            if next == NIL {
                break;
            }
            self.lru.get(self.lru_old).meta().old = false;
            self.lru_old = next;
            self.old_len -= 1;
        }
        while self.old_len + OLD_TOLERANCE < target {
            // Grow: the young block just above the boundary ages.
            let prev = self.lru.prev(self.lru_old);
            if prev == NIL {
                break;
            }
            self.lru.get(prev).meta().old = true;
            self.lru_old = prev;
            self.old_len += 1;
        }
    }

    /// Unlink a page from the LRU (and old-segment bookkeeping).
    /// The caller handles unzip membership and hash removal.
    pub fn lru_remove(&mut self, desc: &Arc<PageDescriptor>, cfg: &PoolConfig) {
        let node = desc.lru_node();
        debug_assert_ne!(node, NIL);

        let had_segment = self.lru_old != NIL;
        if node == self.lru_old {
            // Keep the boundary on an old block: the next block toward
            // the tail is old by construction (NIL if this was the
            // last old block).
            self.lru_old = self.lru.next(node);
        }
        if desc.meta().old {
            self.old_len -= 1;
        }

        self.lru.remove(node);
        desc.set_lru_node(NIL);

        if had_segment {
            if self.lru.len() < cfg.old_min_len {
                self.old_dissolve();
            } else if self.lru_old == NIL {
                // The old segment emptied from the tail; rebuild it.
                self.old_init(cfg);
            } else {
                self.adjust_old_boundary(cfg);
            }
        }
    }

    /// Replace the descriptor at a page's list positions with another
    /// one, preserving exact recency (the relocation primitive).
    pub fn lru_replace(&mut self, old: &Arc<PageDescriptor>, new: &Arc<PageDescriptor>) {
        let node = old.lru_node();
        debug_assert_ne!(node, NIL);
        self.lru.replace_at(node, Arc::clone(new));
        new.set_lru_node(node);
        old.set_lru_node(NIL);

        let unzip = old.unzip_node();
        if unzip != NIL {
            self.unzip.replace_at(unzip, Arc::clone(new));
            new.set_unzip_node(unzip);
            old.set_unzip_node(NIL);
        }
    }

    /// Move a page to the head of the LRU (promotion).
    pub fn make_young(&mut self, desc: &Arc<PageDescriptor>, cfg: &PoolConfig) {
        self.lru_remove(desc, cfg);
        let node = self.lru.push_front(Arc::clone(desc));
        desc.set_lru_node(node);
        desc.meta().old = false;

        // Keep the unzip list roughly aligned with main-LRU order.
        let unzip = desc.unzip_node();
        if unzip != NIL {
            self.unzip.remove(unzip);
            let n = self.unzip.push_front(Arc::clone(desc));
            desc.set_unzip_node(n);
        }

        if self.lru_old == NIL && self.lru.len() >= cfg.old_min_len {
            self.old_init(cfg);
        } else {
            self.adjust_old_boundary(cfg);
        }
    }

    // ========================================================================
    // unzip sub-list
    // ========================================================================

    /// Register a block that now holds both a frame and a compressed
    /// image. Old pages join at the tail end, young at the head, which
    /// keeps the sub-list in main-LRU relative order.
    pub fn unzip_insert(&mut self, desc: &Arc<PageDescriptor>) {
        debug_assert_eq!(desc.unzip_node(), NIL);
        let old = desc.meta().old;
        let node = if old {
            self.unzip.push_back(Arc::clone(desc))
        } else {
            self.unzip.push_front(Arc::clone(desc))
        };
        desc.set_unzip_node(node);
    }

    /// Remove from the unzip list only (the page stays on the LRU).
    pub fn unzip_remove(&mut self, desc: &Arc<PageDescriptor>) {
        let node = desc.unzip_node();
        if node != NIL {
            self.unzip.remove(node);
            desc.set_unzip_node(NIL);
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// (old segment length, boundary node) for tests and stats.
    pub fn old_segment(&self) -> (usize, u32) {
        (self.old_len, self.lru_old)
    }

    /// Verify the old-segment invariants; test support.
    #[cfg(test)]
    pub fn check_old_invariants(&self) {
        if self.lru_old == NIL {
            let mut cur = self.lru.head();
            while cur != NIL {
                assert!(!self.lru.get(cur).meta().old);
                cur = self.lru.next(cur);
            }
            return;
        }
        // Everything from the boundary to the tail is old, everything
        // before it young.
        let mut cur = self.lru.head();
        let mut seen_boundary = false;
        let mut old_count = 0;
        while cur != NIL {
            if cur == self.lru_old {
                seen_boundary = true;
            }
            assert_eq!(self.lru.get(cur).meta().old, seen_boundary);
            if seen_boundary {
                old_count += 1;
            }
            cur = self.lru.next(cur);
        }
        assert!(seen_boundary, "boundary not on the list");
        assert_eq!(old_count, self.old_len);
    }
}

impl Default for LruManager {
    fn default() -> Self {
        Self::new()
    }
}
