//! The buffer pool: N independent instances plus online resize.
//!
//! Identities shard to instances by their fold, so unrelated workloads
//! rarely touch the same coarse lock. The pool object itself holds no
//! page state — it routes, aggregates statistics, and orchestrates the
//! resize ceremony (whose stop-the-world window is only the final
//! pointer swap under every coarse lock and every hash partition
//! lock).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::buffer::chunk::Chunk;
use crate::buffer::descriptor::{PageDescriptor, PageState};
use crate::buffer::guard::{LatchMode, LatchedPage, PageReadGuard, PageWriteGuard};
use crate::buffer::instance::{EvictOutcome, PoolInstance};
use crate::buffer::list::NIL;
use crate::buffer::stats::StatsSnapshot;
use crate::buffer::watch::WatchOutcome;
use crate::common::{Error, Lsn, PageId, PoolConfig, Result};
use crate::flush::{FlushList, FlushSink};
use crate::storage::{IoBackend, NoEncryption, PageCompressor, PageEncryptor, SnapCompressor};

/// The page buffer pool.
///
/// Construct once, share by reference; every subsystem that needs
/// cache access receives it from the engine context, and shutdown is
/// explicit via [`shutdown`](Self::shutdown).
pub struct BufferPool {
    config: Arc<PoolConfig>,
    instances: Vec<Arc<PoolInstance>>,
    killed: Arc<AtomicBool>,
}

impl BufferPool {
    /// Create a pool with the default collaborators: no encryption,
    /// snappy page compression (if enabled), and the built-in flush
    /// list.
    pub fn new(config: PoolConfig, io: Arc<dyn IoBackend>) -> Result<Self> {
        Self::with_collaborators(
            config,
            io,
            Arc::new(NoEncryption),
            Arc::new(SnapCompressor),
            Arc::new(FlushList::new()),
        )
    }

    /// Create a pool wired to the embedder's collaborators.
    pub fn with_collaborators(
        config: PoolConfig,
        io: Arc<dyn IoBackend>,
        encryptor: Arc<dyn PageEncryptor>,
        compressor: Arc<dyn PageCompressor>,
        flush: Arc<dyn FlushSink>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let killed = Arc::new(AtomicBool::new(false));

        let instances = (0..config.instances)
            .map(|no| {
                PoolInstance::new(
                    no,
                    config.blocks_per_instance(no),
                    Arc::clone(&config),
                    Arc::clone(&io),
                    Arc::clone(&encryptor),
                    Arc::clone(&compressor),
                    Arc::clone(&flush),
                    Arc::clone(&killed),
                )
            })
            .collect();

        Ok(Self {
            config,
            instances,
            killed,
        })
    }

    #[inline]
    fn instance_for(&self, id: PageId) -> &Arc<PoolInstance> {
        let n = self.instances.len() as u64;
        &self.instances[(id.fold() % n) as usize]
    }

    // ========================================================================
    // Fetch API
    // ========================================================================

    /// Fetch a page, reading it from disk if necessary, and return it
    /// latched in the requested mode. May block on I/O, on the page
    /// latch, and on free-list pressure.
    ///
    /// # Errors
    /// - [`Error::PageNotFound`] for a never-written page
    /// - [`Error::Corrupted`] / [`Error::DecryptionFailed`] after the
    ///   bounded re-read effort
    /// - [`Error::TablespaceGone`] under concurrent tablespace drop
    /// - [`Error::CapacityExhausted`] when eviction cannot free a block
    pub fn get_page(&self, id: PageId, mode: LatchMode) -> Result<LatchedPage> {
        self.instance_for(id).get_page(id, mode)
    }

    /// [`get_page`](Self::get_page) in shared mode.
    pub fn get_page_shared(&self, id: PageId) -> Result<PageReadGuard> {
        match self.get_page(id, LatchMode::Shared)? {
            LatchedPage::Shared(g) => Ok(g),
            LatchedPage::Exclusive(_) => unreachable!("shared request returns a shared latch"),
        }
    }

    /// [`get_page`](Self::get_page) in exclusive mode.
    pub fn get_page_exclusive(&self, id: PageId) -> Result<PageWriteGuard> {
        match self.get_page(id, LatchMode::Exclusive)? {
            LatchedPage::Exclusive(g) => Ok(g),
            LatchedPage::Shared(_) => unreachable!("exclusive request returns an exclusive latch"),
        }
    }

    /// Allocate a zero-initialized page for a brand-new identity
    /// without reading from disk.
    pub fn create_page(&self, id: PageId, mode: LatchMode) -> Result<LatchedPage> {
        self.instance_for(id).create_page(id, mode)
    }

    /// Record a modification at `lsn`; equivalent to
    /// [`PageWriteGuard::mark_dirty`].
    pub fn mark_dirty(&self, guard: &mut PageWriteGuard, lsn: Lsn) {
        guard.mark_dirty(lsn);
    }

    // ========================================================================
    // Watch API (purge-style collaborators)
    // ========================================================================

    /// Register interest in an absent identity so a later real load is
    /// detectable via [`watch_occurred`](Self::watch_occurred).
    pub fn set_watch(&self, id: PageId) -> WatchOutcome {
        self.instance_for(id).set_watch(id)
    }

    /// Did a real load happen since [`set_watch`](Self::set_watch)?
    pub fn watch_occurred(&self, id: PageId) -> bool {
        self.instance_for(id).watch_occurred(id)
    }

    /// Drop one watch reference.
    pub fn unset_watch(&self, id: PageId) {
        self.instance_for(id).unset_watch(id)
    }

    // ========================================================================
    // Flushing and introspection
    // ========================================================================

    /// Write back one page if dirty. Returns whether a write happened.
    pub fn flush_page(&self, id: PageId) -> Result<bool> {
        self.instance_for(id).flush_page(id)
    }

    /// Write back every resident dirty page (single pass).
    pub fn flush_all(&self) -> Result<()> {
        for inst in &self.instances {
            inst.flush_all()?;
        }
        Ok(())
    }

    /// Whether the identity is resident (watch sentinels do not count).
    pub fn contains(&self, id: PageId) -> bool {
        self.instance_for(id).contains(id)
    }

    /// Total frames across instances.
    pub fn capacity(&self) -> usize {
        self.instances.iter().map(|i| i.capacity()).sum()
    }

    /// Frames available without eviction.
    pub fn free_count(&self) -> usize {
        self.instances.iter().map(|i| i.free_count()).sum()
    }

    /// Resident pages (LRU members across instances).
    pub fn page_count(&self) -> usize {
        self.instances.iter().map(|i| i.page_count()).sum()
    }

    /// Aggregated statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.instances
            .iter()
            .map(|i| i.stats.snapshot())
            .fold(StatsSnapshot::default(), |acc, s| acc.merge(&s))
    }

    /// Signal shutdown: long waits abort with [`Error::Interrupted`].
    /// Advisory — in-flight operations finish normally.
    pub fn shutdown(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    // ========================================================================
    // Online resize
    // ========================================================================

    /// Grow or shrink total capacity without stopping service.
    ///
    /// Shrink drains withdrawing chunks cooperatively (bounded passes,
    /// yielding to traffic); grow allocates chunks up front. Both end
    /// with one short stop-the-world swap under every instance's coarse
    /// lock and every hash partition's write lock.
    ///
    /// # Errors
    /// [`Error::CapacityExhausted`] if a withdrawing chunk could not be
    /// drained within the pass budget (the marks are rolled back and
    /// the pool keeps its old size).
    pub fn resize(&self, new_total: usize) -> Result<()> {
        if new_total < self.instances.len() {
            return Err(Error::Config(format!(
                "cannot shrink below one block per instance ({})",
                self.instances.len()
            )));
        }

        let n = self.instances.len();
        let base = new_total / n;
        let targets: Vec<usize> = (0..n)
            .map(|i| if i == 0 { base + new_total % n } else { base })
            .collect();

        // Cooperative phase: drain chunks that have to go.
        for (inst, &target) in self.instances.iter().zip(&targets) {
            if target < inst.capacity() {
                self.withdraw_to(inst, target)?;
            }
        }

        // Build grow chunks outside the stop-the-world window.
        let mut additions: Vec<(usize, Chunk)> = Vec::new();
        for (i, (inst, &target)) in self.instances.iter().zip(&targets).enumerate() {
            let cap = inst.capacity();
            if target > cap {
                let id = inst.lists.lock().reserve_chunk_id();
                additions.push((i, Chunk::new(id, target - cap)));
            }
        }

        // Stop-the-world swap: every coarse lock, every partition lock.
        {
            let mut coarse: Vec<_> = self.instances.iter().map(|i| i.lists.lock()).collect();
            let _tables: Vec<_> = self
                .instances
                .iter()
                .map(|i| i.table.write_lock_all())
                .collect();

            for (i, chunk) in additions {
                let lists = &mut *coarse[i];
                lists.free.extend(chunk.blocks.iter().cloned());
                lists.chunks.push(chunk);
            }
            for lists in coarse.iter_mut() {
                lists.chunks.retain(|c| {
                    if c.withdrawing {
                        debug_assert!(c.is_drained(), "swapping out a live chunk");
                        false
                    } else {
                        true
                    }
                });
            }
        }
        for inst in &self.instances {
            inst.table.compact();
        }

        info!(new_total, "buffer pool resized");
        Ok(())
    }

    /// Drain an instance down to `target` blocks by marking its newest
    /// chunks withdrawing and relocating or evicting their residents.
    fn withdraw_to(&self, inst: &Arc<PoolInstance>, target: usize) -> Result<()> {
        let withdrawn: HashSet<u64> = {
            let mut lists = inst.lists.lock();
            let mut cap = lists.capacity();
            let mut set = HashSet::new();
            for chunk in lists.chunks.iter_mut().rev() {
                if !chunk.withdrawing && cap - chunk.len() >= target {
                    chunk.withdrawing = true;
                    cap -= chunk.len();
                    set.insert(chunk.id);
                }
            }
            lists.free.retain(|b| !set.contains(&b.chunk_id()));
            set
        };
        if withdrawn.is_empty() {
            return Ok(());
        }

        for _pass in 0..self.config.shrink_max_passes {
            if self.killed.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }

            let mut to_flush: Vec<Arc<PageDescriptor>> = Vec::new();
            {
                let mut lists = inst.lists.lock();
                lists.free.retain(|b| !withdrawn.contains(&b.chunk_id()));

                let victims: Vec<Arc<PageDescriptor>> = lists
                    .lru
                    .iter_from_tail()
                    .filter(|(_, d)| withdrawn.contains(&d.chunk_id()))
                    .map(|(_, d)| Arc::clone(d))
                    .collect();

                for victim in victims {
                    if victim.meta().is_dirty() {
                        to_flush.push(victim);
                        continue;
                    }
                    // Prefer relocation so the page stays cached.
                    let relocated = match lists.pop_free() {
                        Some(fresh) => {
                            if inst.relocate_block(&mut lists, &victim, &fresh) {
                                true
                            } else {
                                lists.push_free(fresh);
                                false
                            }
                        }
                        None => false,
                    };
                    if !relocated {
                        match inst.try_evict(&mut lists, &victim) {
                            EvictOutcome::Evicted(b) => lists.push_free(b),
                            EvictOutcome::Dirty => to_flush.push(victim),
                            EvictOutcome::FreedBare | EvictOutcome::Skip => {}
                        }
                    }
                }
            }

            for desc in to_flush {
                inst.flush_page_internal(&desc)?;
            }

            let done = {
                let lists = inst.lists.lock();
                let lru_clear = lists
                    .lru
                    .iter_from_tail()
                    .all(|(_, d)| !withdrawn.contains(&d.chunk_id()));
                lru_clear
                    && lists
                        .chunks
                        .iter()
                        .filter(|c| withdrawn.contains(&c.id))
                        .all(|c| c.is_drained())
            };
            if done {
                return Ok(());
            }

            // Yield to the traffic we are competing with.
            std::thread::yield_now();
            std::thread::sleep(Duration::from_millis(1));
        }

        // Could not drain in budget: roll back and keep the old size.
        {
            let mut lists = inst.lists.lock();
            for chunk in lists.chunks.iter_mut() {
                if withdrawn.contains(&chunk.id) {
                    chunk.withdrawing = false;
                }
            }
            let restore: Vec<Arc<PageDescriptor>> = lists
                .chunks
                .iter()
                .filter(|c| withdrawn.contains(&c.id))
                .flat_map(|c| c.blocks.iter())
                .filter(|b| b.meta().state == PageState::Unused && b.lru_node() == NIL)
                .cloned()
                .collect();
            lists.free.extend(restore);
        }
        warn!(
            instance = inst.no,
            "shrink pass budget exhausted; resize rolled back"
        );
        Err(Error::CapacityExhausted)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("instances", &self.instances.len())
            .field("capacity", &self.capacity())
            .field("resident", &self.page_count())
            .finish()
    }
}
