//! One pool instance: the sharded unit of the buffer pool.
//!
//! An instance owns its chunks, lists, hash partitions, buddy arenas
//! and watch sentinels outright; descriptors never move between
//! instances. The lock hierarchy inside an instance is
//!
//! ```text
//! coarse list lock -> hash partition lock -> descriptor meta mutex
//! ```
//!
//! acquired in that order whenever more than one is needed. The page
//! latch is orthogonal: taken only via try-lock while any of the above
//! are held, and held across caller I/O otherwise.
//!
//! # The fetch protocol
//! A hit fixes the descriptor under the partition *read* lock, then
//! releases it before latching; the fix pins the block in the window
//! between. A miss claims a free block, publishes it (hash + LRU)
//! with a read pending, then performs the read while later arrivals
//! block on the descriptor's io condvar — so a cold page is read from
//! disk exactly once no matter how many threads want it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::buffer::buddy::BuddyAllocator;
use crate::buffer::completion::{self, ReadOutcome};
use crate::buffer::descriptor::{IoFix, PageDescriptor, PageState};
use crate::buffer::guard::{LatchMode, LatchedPage, PageReadGuard, PageWriteGuard};
use crate::buffer::list::NIL;
use crate::buffer::lru::LruManager;
use crate::buffer::page_table::PageTable;
use crate::buffer::stats::PoolStats;
use crate::buffer::watch::{WatchOutcome, WatchRegistry};
use crate::common::{Error, Lsn, PageId, PoolConfig, Result, PAGE_SIZE};
use crate::flush::FlushSink;
use crate::storage::format;
use crate::storage::{IoBackend, PageCompressor, PageEncryptor};

/// What the eviction scan decided about one candidate.
pub(crate) enum EvictOutcome {
    /// Evicted; here is the freed block (bare descriptors free no
    /// frame and report `FreedBare`).
    Evicted(Arc<PageDescriptor>),
    /// Evicted a compressed-only descriptor; buddy memory freed but no
    /// frame gained.
    FreedBare,
    /// Dirty but otherwise evictable; flush it and retry.
    Dirty,
    /// Fixed, io-busy, or gone; not a candidate right now.
    Skip,
}

pub(crate) struct PoolInstance {
    pub no: usize,
    pub config: Arc<PoolConfig>,
    pub lists: Mutex<LruManager>,
    pub table: PageTable,
    pub watch: WatchRegistry,
    pub buddy: BuddyAllocator,
    pub stats: PoolStats,
    pub io: Arc<dyn IoBackend>,
    pub encryptor: Arc<dyn PageEncryptor>,
    pub compressor: Arc<dyn PageCompressor>,
    pub flush: Arc<dyn FlushSink>,
    pub killed: Arc<AtomicBool>,
}

impl PoolInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        no: usize,
        n_blocks: usize,
        config: Arc<PoolConfig>,
        io: Arc<dyn IoBackend>,
        encryptor: Arc<dyn PageEncryptor>,
        compressor: Arc<dyn PageCompressor>,
        flush: Arc<dyn FlushSink>,
        killed: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let mut lists = LruManager::new();
        lists.add_chunk(n_blocks);
        Arc::new(Self {
            no,
            lists: Mutex::new(lists),
            table: PageTable::new(config.hash_partitions),
            watch: WatchRegistry::new(config.watch_pool_size),
            buddy: BuddyAllocator::new(config.buddy_arena_cap),
            stats: PoolStats::new(),
            config,
            io,
            encryptor,
            compressor,
            flush,
            killed,
        })
    }

    // ========================================================================
    // Public fetch path
    // ========================================================================

    pub fn get_page(self: &Arc<Self>, id: PageId, mode: LatchMode) -> Result<LatchedPage> {
        loop {
            enum Hit {
                File(Arc<PageDescriptor>),
                Compressed(Arc<PageDescriptor>),
                Transient,
                Miss,
            }

            let hit = {
                let bucket = self.table.read_lock(id);
                match PageTable::lookup(&bucket, id) {
                    Some(desc) => {
                        let meta = desc.meta();
                        match meta.state {
                            PageState::FilePage => {
                                drop(meta);
                                // Fixing under the partition read lock
                                // is what pins the block between the
                                // hash release and the latch.
                                desc.fix();
                                Hit::File(desc)
                            }
                            PageState::CompressedOnly => {
                                drop(meta);
                                Hit::Compressed(desc)
                            }
                            _ => Hit::Transient,
                        }
                    }
                    None => Hit::Miss,
                }
            };

            match hit {
                Hit::File(desc) => {
                    if let Err(e) = desc.wait_io_idle(&self.killed) {
                        desc.unfix();
                        return Err(e);
                    }
                    if desc.meta().state != PageState::FilePage {
                        // The loader abandoned a failed read while we
                        // were waiting; start over.
                        desc.unfix();
                        continue;
                    }
                    PoolStats::bump(&self.stats.hits);
                    self.touch(&desc);
                    return Ok(self.latch(desc, id, mode));
                }
                Hit::Compressed(desc) => {
                    match self.materialize(&desc, id)? {
                        Some(block) => {
                            PoolStats::bump(&self.stats.hits);
                            return Ok(self.latch(block, id, mode));
                        }
                        None => {
                            // Another thread owns the materialization;
                            // wait for it and retry.
                            desc.wait_io_idle(&self.killed)?;
                            continue;
                        }
                    }
                }
                Hit::Transient => {
                    std::thread::yield_now();
                    continue;
                }
                Hit::Miss => {
                    if let Some(block) = self.load_cold(id)? {
                        return Ok(self.latch(block, id, mode));
                    }
                    // Lost the publish race; the fast path will hit.
                }
            }
        }
    }

    /// Allocate a brand-new zero page without touching disk.
    pub fn create_page(self: &Arc<Self>, id: PageId, mode: LatchMode) -> Result<LatchedPage> {
        loop {
            let existing = {
                let bucket = self.table.read_lock(id);
                match PageTable::lookup(&bucket, id) {
                    Some(desc) => {
                        let state = desc.meta().state;
                        match state {
                            PageState::FilePage => {
                                desc.fix();
                                Some(desc)
                            }
                            // Re-creating a compressed-only page: evict
                            // the stale image first.
                            PageState::CompressedOnly => None,
                            _ => None,
                        }
                    }
                    None => None,
                }
            };

            if let Some(desc) = existing {
                desc.wait_io_idle(&self.killed)?;
                if desc.meta().state != PageState::FilePage {
                    desc.unfix();
                    continue;
                }
                let mut latch = desc.latch_exclusive();
                if let Some(frame) = latch.as_deref_mut() {
                    format::init_page(frame.as_mut_slice(), id);
                }
                drop(latch);
                PoolStats::bump(&self.stats.hits);
                return Ok(self.latch(desc, id, mode));
            }

            // Drop a stale compressed-only image if one is in the way.
            self.discard_compressed_only(id);

            match self.publish_new(id, IoFix::Pin)? {
                Some(block) => {
                    {
                        let mut latch = block.latch_exclusive();
                        if let Some(frame) = latch.as_deref_mut() {
                            format::init_page(frame.as_mut_slice(), id);
                        }
                    }
                    block.complete_io();
                    return Ok(self.latch(block, id, mode));
                }
                None => continue,
            }
        }
    }

    /// Record a modification (called through the write guard).
    pub fn note_modification(&self, desc: &Arc<PageDescriptor>, lsn: Lsn) {
        let (first_dirty, had_zip) = {
            let mut meta = desc.meta();
            meta.newest_modification = meta.newest_modification.max(lsn);
            let first = meta.oldest_modification == 0;
            if first {
                meta.oldest_modification = lsn;
            }
            (first, meta.zip.is_some())
        };
        if first_dirty {
            self.flush.enqueue_dirty(desc, lsn);
        }
        if had_zip {
            // The compressed image no longer matches the frame.
            let mut lists = self.lists.lock();
            let zip = desc.meta().zip.take();
            if let Some(z) = zip {
                lists.unzip_remove(desc);
                self.buddy.free(z.handle);
            }
        }
    }

    // ========================================================================
    // Watch API
    // ========================================================================

    pub fn set_watch(&self, id: PageId) -> WatchOutcome {
        self.watch.set_watch(&self.table, id)
    }

    pub fn watch_occurred(&self, id: PageId) -> bool {
        self.watch.occurred(&self.table, id)
    }

    pub fn unset_watch(&self, id: PageId) {
        self.watch.unset_watch(&self.table, id)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn contains(&self, id: PageId) -> bool {
        let bucket = self.table.read_lock(id);
        PageTable::lookup(&bucket, id).is_some()
    }

    pub fn capacity(&self) -> usize {
        self.lists.lock().capacity()
    }

    pub fn free_count(&self) -> usize {
        self.lists.lock().free_len()
    }

    pub fn page_count(&self) -> usize {
        self.lists.lock().lru.len()
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Write back one page if it is dirty and idle. Returns whether a
    /// write happened.
    pub fn flush_page(&self, id: PageId) -> Result<bool> {
        let desc = {
            let bucket = self.table.read_lock(id);
            PageTable::lookup(&bucket, id)
        };
        match desc {
            Some(d) => self.flush_page_internal(&d),
            None => Ok(false),
        }
    }

    /// Single pass over the resident dirty pages, writing each back.
    pub fn flush_all(&self) -> Result<()> {
        let dirty: Vec<Arc<PageDescriptor>> = {
            let lists = self.lists.lock();
            lists
                .lru
                .iter_from_tail()
                .map(|(_, d)| Arc::clone(d))
                .filter(|d| d.meta().is_dirty())
                .collect()
        };
        for desc in dirty {
            self.flush_page_internal(&desc)?;
        }
        Ok(())
    }

    pub(crate) fn flush_page_internal(&self, desc: &Arc<PageDescriptor>) -> Result<bool> {
        let (id, newest, oldest) = {
            let mut meta = desc.meta();
            if meta.state != PageState::FilePage
                || !meta.is_dirty()
                || meta.io_fix != IoFix::None
            {
                return Ok(false);
            }
            meta.io_fix = IoFix::Write;
            (meta.id, meta.newest_modification, meta.oldest_modification)
        };

        // Snapshot the frame under a shared latch; the write pipeline
        // runs on the copy so concurrent readers are unaffected.
        let snapshot = {
            let latch = desc.latch_shared();
            match latch.as_deref() {
                Some(frame) => frame.as_slice().to_vec(),
                None => unreachable!("dirty file page always owns a frame"),
            }
        };

        let image = match completion::prepare_write(
            id,
            &snapshot,
            newest,
            &self.config,
            &*self.encryptor,
            &*self.compressor,
        ) {
            Ok(image) => image,
            Err(e) => {
                desc.complete_io();
                return Err(e);
            }
        };
        if let Err(e) = self.io.write_page(id, &image) {
            desc.complete_io();
            return Err(e);
        }
        PoolStats::bump(&self.stats.pages_written);

        let clean = {
            let mut meta = desc.meta();
            meta.io_fix = IoFix::None;
            if meta.newest_modification == newest {
                // No modification landed mid-flight.
                meta.oldest_modification = 0;
                true
            } else {
                false
            }
        };
        if clean {
            self.flush.remove(desc, oldest);
        }
        desc.notify_io_waiters();
        Ok(true)
    }

    // ========================================================================
    // Miss path
    // ========================================================================

    /// Publish a block for `id` with a read pending and perform the
    /// read. `None` means another thread published first.
    fn load_cold(self: &Arc<Self>, id: PageId) -> Result<Option<Arc<PageDescriptor>>> {
        let block = match self.publish_new(id, IoFix::Read)? {
            Some(b) => b,
            None => return Ok(None),
        };

        match self.read_into(id, &block) {
            Ok(outcome) => {
                {
                    let mut meta = block.meta();
                    meta.real_size = outcome.real_size;
                    meta.key_version = outcome.key_version;
                }
                if let Some(zip) = outcome.zip_image {
                    self.attach_zip(&block, &zip);
                }
                block.complete_io();
                Ok(Some(block))
            }
            Err(e) => {
                self.abandon_failed_read(block, id);
                Err(e)
            }
        }
    }

    /// Claim a free block and hook it into the hash index and LRU for
    /// `id`, transferring any watch references. The block comes back
    /// fixed once, with `io_fix` already set (so a load is excluded
    /// from the moment the page becomes visible); `None` means a real
    /// descriptor beat us.
    fn publish_new(
        self: &Arc<Self>,
        id: PageId,
        io_fix: IoFix,
    ) -> Result<Option<Arc<PageDescriptor>>> {
        let block = self.get_free_block()?;

        {
            let mut bucket = self.table.write_lock(id);
            match PageTable::lookup_also_watch(&bucket, id) {
                Some(existing) if !existing.is_watch_sentinel() => {
                    drop(bucket);
                    let mut lists = self.lists.lock();
                    lists.push_free(block);
                    return Ok(None);
                }
                sentinel => {
                    {
                        let mut meta = block.meta();
                        meta.id = id;
                        meta.state = PageState::FilePage;
                        meta.io_fix = io_fix;
                        meta.real_size = PAGE_SIZE as u32;
                        if let Some(s) = &sentinel {
                            meta.watch_fixes = s.fix_count();
                        }
                    }
                    block.fix();
                    match sentinel {
                        Some(s) => {
                            // The single-entry rule: the sentinel's
                            // references move onto the real descriptor
                            // and the sentinel leaves the index.
                            s.transfer_fixes(&block);
                            s.meta().state = PageState::Unused;
                            PageTable::replace(&mut bucket, id, Arc::clone(&block));
                        }
                        None => {
                            PageTable::insert(&mut bucket, id, Arc::clone(&block));
                        }
                    }
                }
            }
        }

        {
            let mut lists = self.lists.lock();
            lists.lru_insert(&block, &self.config);
        }
        PoolStats::bump(&self.stats.misses);
        Ok(Some(block))
    }

    /// Read the page image into the block's frame, retrying transient
    /// corruption a bounded number of times.
    fn read_into(&self, id: PageId, block: &Arc<PageDescriptor>) -> Result<ReadOutcome> {
        let mut attempt = 0;
        loop {
            let result = {
                let mut latch = block.frame_cell().write();
                let frame = match latch.as_deref_mut() {
                    Some(f) => f,
                    None => unreachable!("loading into a block without a frame"),
                };
                self.io.read_page(id, frame.as_mut_slice())?;
                PoolStats::bump(&self.stats.pages_read);
                completion::complete_read(
                    id,
                    frame.as_mut_slice(),
                    &self.config,
                    &*self.encryptor,
                    &*self.compressor,
                )
            };
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    let transient =
                        matches!(e, Error::Corrupted { .. } | Error::DecryptionFailed(_));
                    if transient && attempt < self.config.io_read_retries {
                        attempt += 1;
                        debug!(
                            page = %id,
                            attempt,
                            "read validation failed; re-reading in case of a torn read"
                        );
                        std::thread::sleep(self.config.io_retry_delay);
                        continue;
                    }
                    if matches!(e, Error::Corrupted { fatal: true, .. }) {
                        error!(page = %id, "unrecoverable corruption on system metadata");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Keep the (decrypted) compressed image so the page can later
    /// shed its frame. Best-effort: under buddy pressure we try one
    /// round of freeing compressed-only pages, then give up — the copy
    /// is a cache, not a correctness requirement.
    fn attach_zip(&self, block: &Arc<PageDescriptor>, zip_image: &[u8]) {
        let handle = match self.buddy.alloc(zip_image) {
            Some(h) => Some(h),
            None => {
                self.release_zip_memory();
                self.buddy.alloc(zip_image)
            }
        };
        match handle {
            Some(h) => {
                let mut lists = self.lists.lock();
                block.meta().zip = Some(crate::buffer::descriptor::ZipData { handle: h });
                lists.unzip_insert(block);
            }
            None => {
                debug!(instance = self.no, "buddy arenas exhausted; not keeping compressed image");
            }
        }
    }

    /// Evict compressed-only pages from the LRU tail to relieve buddy
    /// pressure.
    fn release_zip_memory(&self) {
        let mut lists = self.lists.lock();
        let victims: Vec<Arc<PageDescriptor>> = lists
            .lru
            .iter_from_tail()
            .filter(|(_, d)| !d.is_block())
            .take(self.config.eviction_scan_depth)
            .map(|(_, d)| Arc::clone(d))
            .collect();
        for victim in victims {
            if let EvictOutcome::FreedBare = self.try_evict(&mut lists, &victim) {
                return;
            }
        }
    }

    /// Unhook a block whose read failed, re-planting the watch if one
    /// had been transferred, and recycle the block once concurrent
    /// waiters have drained.
    fn abandon_failed_read(&self, block: Arc<PageDescriptor>, id: PageId) {
        {
            let mut lists = self.lists.lock();
            let mut bucket = self.table.write_lock(id);
            let watch_fixes = {
                let mut meta = block.meta();
                meta.io_fix = IoFix::None;
                meta.state = PageState::RemoveHash;
                std::mem::take(&mut meta.watch_fixes)
            };
            PageTable::remove(&mut bucket, id);
            if watch_fixes > 0 {
                let sentinel = self.watch.replant(id, watch_fixes);
                block.remove_fixes(watch_fixes);
                PageTable::insert(&mut bucket, id, sentinel);
            }
            drop(bucket);
            lists.lru_remove(&block, &self.config);
        }
        block.bump_modify_clock();
        block.notify_io_waiters();
        block.unfix();

        // Waiters that fixed the block before the failure wake up, see
        // the state change and let go.
        while block.fix_count() > 0 {
            block.notify_io_waiters();
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut lists = self.lists.lock();
        lists.push_free(block);
    }

    // ========================================================================
    // Free-block supply and eviction
    // ========================================================================

    /// Produce a `ReadyForUse` block: from the free list, by stripping
    /// an unzip frame, or by evicting from the LRU tail; flushing a
    /// dirty victim and retrying when nothing clean is available.
    fn get_free_block(&self) -> Result<Arc<PageDescriptor>> {
        for _ in 0..self.config.free_block_attempts {
            if self.killed.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }

            let mut dirty_victim: Option<Arc<PageDescriptor>> = None;
            {
                let mut lists = self.lists.lock();
                if let Some(block) = lists.pop_free() {
                    return Ok(block);
                }

                // Prefer shedding an uncompressed frame whose page can
                // live on as compressed-only: the cache keeps the page.
                let unzip_tail: Vec<Arc<PageDescriptor>> = lists
                    .unzip
                    .iter_from_tail()
                    .take(self.config.eviction_scan_depth)
                    .map(|(_, d)| Arc::clone(d))
                    .collect();
                for candidate in unzip_tail {
                    if let Some(freed) = self.strip_frame(&mut lists, &candidate) {
                        return Ok(freed);
                    }
                }

                let scan: Vec<Arc<PageDescriptor>> = lists
                    .lru
                    .iter_from_tail()
                    .take(self.config.eviction_scan_depth)
                    .map(|(_, d)| Arc::clone(d))
                    .collect();
                for candidate in scan {
                    PoolStats::bump(&self.stats.eviction_scanned);
                    if !candidate.is_block() {
                        continue;
                    }
                    match self.try_evict(&mut lists, &candidate) {
                        EvictOutcome::Evicted(block) => return Ok(block),
                        EvictOutcome::Dirty => {
                            if dirty_victim.is_none() {
                                dirty_victim = Some(candidate);
                            }
                        }
                        EvictOutcome::FreedBare | EvictOutcome::Skip => {}
                    }
                }
            }

            match dirty_victim {
                Some(victim) => {
                    // Write it back; next pass finds it clean.
                    self.flush_page_internal(&victim)?;
                }
                None => {
                    // Everything in reach is fixed or io-busy.
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }

        error!(
            instance = self.no,
            "no free block after {} eviction and flush rounds; pool is under-provisioned",
            self.config.free_block_attempts
        );
        Err(Error::CapacityExhausted)
    }

    /// Attempt to evict one candidate. Caller holds the coarse lock.
    pub(crate) fn try_evict(&self, lists: &mut LruManager, desc: &Arc<PageDescriptor>) -> EvictOutcome {
        let id = desc.meta().id;
        let mut bucket = self.table.write_lock(id);

        let zip = {
            let mut meta = desc.meta();
            if !matches!(meta.state, PageState::FilePage | PageState::CompressedOnly) {
                return EvictOutcome::Skip;
            }
            if desc.fix_count() != 0 || meta.io_fix != IoFix::None {
                return EvictOutcome::Skip;
            }
            if meta.is_dirty() {
                return EvictOutcome::Dirty;
            }
            // Point of no return: the state change makes concurrent
            // optimistic fixers back off before we drop the meta lock.
            meta.state = PageState::RemoveHash;
            meta.zip.take()
        };

        PageTable::remove(&mut bucket, id);
        drop(bucket);

        lists.unzip_remove(desc);
        lists.lru_remove(desc, &self.config);
        if let Some(z) = zip {
            // Evicting an uncompressed+compressed pair frees both.
            self.buddy.free(z.handle);
        }
        desc.bump_modify_clock();
        desc.notify_io_waiters();
        PoolStats::bump(&self.stats.evictions);

        if desc.is_block() {
            {
                let mut meta = desc.meta();
                meta.reset();
                meta.state = PageState::ReadyForUse;
            }
            EvictOutcome::Evicted(Arc::clone(desc))
        } else {
            desc.meta().reset();
            EvictOutcome::FreedBare
        }
    }

    /// Reclaim the uncompressed frame of a clean unzip member; the page
    /// survives as a compressed-only descriptor in the same LRU
    /// position. Returns the freed block. Caller holds the coarse lock.
    fn strip_frame(
        &self,
        lists: &mut LruManager,
        block: &Arc<PageDescriptor>,
    ) -> Option<Arc<PageDescriptor>> {
        let id = block.meta().id;
        let mut bucket = self.table.write_lock(id);

        let bare = {
            let mut meta = block.meta();
            if meta.state != PageState::FilePage
                || block.fix_count() != 0
                || meta.io_fix != IoFix::None
                || meta.is_dirty()
                || meta.zip.is_none()
            {
                return None;
            }
            let bare = Arc::new(PageDescriptor::new_bare());
            {
                let mut bm = bare.meta();
                bm.id = id;
                bm.state = PageState::CompressedOnly;
                bm.real_size = meta.real_size;
                bm.key_version = meta.key_version;
                bm.access_time = meta.access_time;
                bm.old = meta.old;
                bm.zip = meta.zip.take();
            }
            meta.state = PageState::RemoveHash;
            bare
        };

        PageTable::replace(&mut bucket, id, Arc::clone(&bare));
        drop(bucket);

        lists.unzip_remove(block);
        lists.lru_replace(block, &bare);
        block.bump_modify_clock();
        block.notify_io_waiters();
        PoolStats::bump(&self.stats.relocations);

        {
            let mut meta = block.meta();
            meta.reset();
            meta.state = PageState::ReadyForUse;
        }
        Some(Arc::clone(block))
    }

    // ========================================================================
    // Compressed-only materialization
    // ========================================================================

    /// Bring a compressed-only page back to a full block. Returns the
    /// new descriptor, fixed once for the caller, or `None` if another
    /// thread owns the transition (or the descriptor moved on).
    fn materialize(
        self: &Arc<Self>,
        old: &Arc<PageDescriptor>,
        id: PageId,
    ) -> Result<Option<Arc<PageDescriptor>>> {
        // Claim the transition with an io pin so eviction and fellow
        // materializers back off.
        {
            let bucket = self.table.read_lock(id);
            match PageTable::lookup(&bucket, id) {
                Some(current) if Arc::ptr_eq(&current, old) => {
                    let mut meta = old.meta();
                    if meta.state != PageState::CompressedOnly
                        || meta.io_fix != IoFix::None
                        || old.fix_count() != 0
                    {
                        return Ok(None);
                    }
                    meta.io_fix = IoFix::Pin;
                }
                _ => return Ok(None),
            }
        }

        let block = match self.get_free_block() {
            Ok(b) => b,
            Err(e) => {
                old.complete_io();
                return Err(e);
            }
        };

        // Decompress outside all pool locks; the pin keeps the source
        // descriptor alive.
        let stored = {
            let meta = old.meta();
            match &meta.zip {
                Some(z) => self.buddy.read(&z.handle),
                None => unreachable!("compressed-only page always owns a zip image"),
            }
        };
        let image = match completion::decompress_stored(id, &stored, &*self.compressor) {
            Ok(image) => image,
            Err(e) => {
                {
                    let mut lists = self.lists.lock();
                    lists.push_free(block);
                }
                old.complete_io();
                warn!(page = %id, "resident compressed image failed to decompress");
                return Err(e);
            }
        };
        {
            let mut latch = block.frame_cell().write();
            match latch.as_deref_mut() {
                Some(frame) => frame.as_mut_slice().copy_from_slice(&image),
                None => unreachable!("free block always owns a frame"),
            }
        }

        // The swap: hash, LRU and unzip repointed under their locks.
        {
            let mut lists = self.lists.lock();
            let mut bucket = self.table.write_lock(id);
            {
                let mut old_meta = old.meta();
                let mut new_meta = block.meta();
                new_meta.id = id;
                new_meta.state = PageState::FilePage;
                new_meta.io_fix = IoFix::None;
                new_meta.oldest_modification = old_meta.oldest_modification;
                new_meta.newest_modification = old_meta.newest_modification;
                new_meta.access_time = old_meta.access_time;
                new_meta.old = old_meta.old;
                new_meta.real_size = old_meta.real_size;
                new_meta.key_version = old_meta.key_version;
                new_meta.watch_fixes = old_meta.watch_fixes;
                new_meta.zip = old_meta.zip.take();
                old_meta.state = PageState::RemoveHash;
                old_meta.io_fix = IoFix::None;
            }
            old.transfer_fixes(&block);
            block.fix();
            PageTable::replace(&mut bucket, id, Arc::clone(&block));
            drop(bucket);
            lists.lru_replace(old, &block);
            // Frame and compressed image are both resident again.
            lists.unzip_insert(&block);
        }
        old.bump_modify_clock();
        block.bump_modify_clock();
        old.notify_io_waiters();
        old.meta().reset();
        PoolStats::bump(&self.stats.relocations);

        Ok(Some(block))
    }

    /// Evict a stale compressed-only descriptor for `id` if present
    /// (create-page path).
    fn discard_compressed_only(&self, id: PageId) {
        let desc = {
            let bucket = self.table.read_lock(id);
            PageTable::lookup(&bucket, id)
                .filter(|d| d.meta().state == PageState::CompressedOnly)
        };
        if let Some(desc) = desc {
            let mut lists = self.lists.lock();
            let _ = self.try_evict(&mut lists, &desc);
        }
    }

    // ========================================================================
    // Relocation for shrink
    // ========================================================================

    /// Move a resident page from `old` (a withdrawing block) onto
    /// `new` (a fresh free block), preserving identity, dirtiness and
    /// recency. Caller holds the coarse lock. Returns false if the
    /// page was busy.
    pub(crate) fn relocate_block(
        &self,
        lists: &mut LruManager,
        old: &Arc<PageDescriptor>,
        new: &Arc<PageDescriptor>,
    ) -> bool {
        let id = old.meta().id;
        let mut bucket = self.table.write_lock(id);

        {
            let mut meta = old.meta();
            if meta.state != PageState::FilePage
                || old.fix_count() != 0
                || meta.io_fix != IoFix::None
            {
                return false;
            }
            // Pin so optimistic fixers back off while we copy.
            meta.io_fix = IoFix::Pin;
        }

        {
            let src = match old.try_latch_shared() {
                Some(l) => l,
                None => {
                    old.meta().io_fix = IoFix::None;
                    return false;
                }
            };
            let mut dst = match new.try_latch_exclusive() {
                Some(l) => l,
                None => {
                    old.meta().io_fix = IoFix::None;
                    return false;
                }
            };
            match (src.as_deref(), dst.as_deref_mut()) {
                (Some(s), Some(d)) => d.as_mut_slice().copy_from_slice(s.as_slice()),
                _ => unreachable!("blocks always own frames"),
            }
        }

        let (dirty, oldest) = {
            let mut old_meta = old.meta();
            let mut new_meta = new.meta();
            new_meta.id = id;
            new_meta.state = PageState::FilePage;
            new_meta.io_fix = IoFix::None;
            new_meta.oldest_modification = old_meta.oldest_modification;
            new_meta.newest_modification = old_meta.newest_modification;
            new_meta.access_time = old_meta.access_time;
            new_meta.old = old_meta.old;
            new_meta.real_size = old_meta.real_size;
            new_meta.key_version = old_meta.key_version;
            new_meta.watch_fixes = old_meta.watch_fixes;
            new_meta.zip = old_meta.zip.take();
            old_meta.state = PageState::RemoveHash;
            old_meta.io_fix = IoFix::None;
            (new_meta.oldest_modification != 0, new_meta.oldest_modification)
        };
        old.transfer_fixes(new);
        PageTable::replace(&mut bucket, id, Arc::clone(new));
        drop(bucket);

        lists.lru_replace(old, new);
        if dirty {
            self.flush.relocate(old, new, oldest);
        }
        old.bump_modify_clock();
        new.bump_modify_clock();
        old.notify_io_waiters();
        old.meta().reset();
        PoolStats::bump(&self.stats.relocations);
        true
    }

    // ========================================================================
    // Access policy and latching
    // ========================================================================

    /// The scan-resistance promotion rule: move an old-segment page to
    /// the LRU head only when its previous access is older than the
    /// configured threshold, so repeated touches within one logical
    /// operation cost one promotion at most.
    fn touch(&self, desc: &Arc<PageDescriptor>) {
        let now = Instant::now();
        let (was_old, stale) = {
            let mut meta = desc.meta();
            let was_old = meta.old;
            let stale = meta
                .access_time
                .map_or(true, |t| now.duration_since(t) >= self.config.old_threshold);
            meta.access_time = Some(now);
            (was_old, stale)
        };
        if was_old && stale {
            let mut lists = self.lists.lock();
            if desc.lru_node() != NIL {
                lists.make_young(desc, &self.config);
                PoolStats::bump(&self.stats.made_young);
            }
        } else if was_old {
            PoolStats::bump(&self.stats.not_made_young);
        }
    }

    fn latch(self: &Arc<Self>, desc: Arc<PageDescriptor>, id: PageId, mode: LatchMode) -> LatchedPage {
        match mode {
            LatchMode::Shared => {
                let latch = desc.latch_shared();
                LatchedPage::Shared(PageReadGuard::new(desc, latch, id))
            }
            LatchMode::Exclusive => {
                let latch = desc.latch_exclusive();
                LatchedPage::Exclusive(PageWriteGuard::new(desc, latch, id, Arc::clone(self)))
            }
        }
    }
}
