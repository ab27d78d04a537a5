//! Page descriptor - the per-page control block.
//!
//! A descriptor is either a *block* (it owns an uncompressed frame, was
//! carved out of a [`Chunk`](crate::buffer::chunk::Chunk)) or *bare*
//! (compressed-only pages and watch sentinels, which have no frame).
//! The state machine distinguishes the roles:
//!
//! ```text
//! Unused -> ReadyForUse -> FilePage <-> CompressedOnly -> RemoveHash -> Unused
//!                              \________________________/
//! ```
//!
//! plus the independent `Watch` state only a sentinel may occupy.
//!
//! # Locking
//! - `meta` is the short mutex: held for field updates only, never
//!   across I/O or latch waits.
//! - The frame `RwLock` is the long-lived page latch, held across
//!   whatever the caller does with the bytes. It is never acquired
//!   while holding `meta`, a hash-partition lock, or the coarse lock.
//! - `fix_count` pins the descriptor against eviction and relocation.
//!   It may only be *incremented* while holding the identity's hash
//!   partition lock or this descriptor's `meta` mutex; those are
//!   exactly the locks eviction holds while checking it.
//! - `modify_clock` increments whenever the descriptor's identity or
//!   frame association changes, which lets the optimistic path detect
//!   relocation without holding anything.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, MutexGuard, RawRwLock, RwLock};

use crate::buffer::buddy::BuddyHandle;
use crate::buffer::list::NIL;
use crate::common::{Error, Lsn, PageId, Result};
use crate::storage::Frame;

/// Chunk id carried by bare descriptors.
pub const NO_CHUNK: u64 = u64::MAX;

/// Shared read latch on a block's frame.
pub type FrameReadLatch = ArcRwLockReadGuard<RawRwLock, Option<Box<Frame>>>;
/// Exclusive write latch on a block's frame.
pub type FrameWriteLatch = ArcRwLockWriteGuard<RawRwLock, Option<Box<Frame>>>;

/// Life-cycle state of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Not in use; on the free list if it is a block.
    Unused,
    /// Claimed from the free list, not yet hash-indexed.
    ReadyForUse,
    /// A resident file page with a materialized frame.
    FilePage,
    /// Only the compressed image is resident; no frame.
    CompressedOnly,
    /// Mid-eviction: being unhooked from the hash index.
    RemoveHash,
    /// Watch sentinel occupying a hash slot for an absent page.
    Watch,
}

/// In-flight I/O marker, excluding conflicting access to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFix {
    /// No I/O in progress.
    None,
    /// A read is filling the frame; content is not yet valid.
    Read,
    /// A write-back snapshot is in flight.
    Write,
    /// Pinned for relocation; like `Read` but with valid content.
    Pin,
}

/// The compressed image of a page, held in the buddy allocator.
#[derive(Debug)]
pub struct ZipData {
    pub handle: BuddyHandle,
}

/// Mutable descriptor fields, guarded by the short mutex.
#[derive(Debug)]
pub struct DescMeta {
    pub id: PageId,
    pub state: PageState,
    pub io_fix: IoFix,
    /// LSN of the first unflushed modification; 0 = clean.
    pub oldest_modification: Lsn,
    /// LSN of the latest modification.
    pub newest_modification: Lsn,
    /// Last access, for the too-old promotion test.
    pub access_time: Option<Instant>,
    /// In the old segment of the LRU list.
    pub old: bool,
    /// Physical bytes of the on-disk image (= page size unless the
    /// stored image is compressed).
    pub real_size: u32,
    /// Key version of the on-disk image; 0 = plaintext.
    pub key_version: u32,
    /// Compressed image, if one is resident.
    pub zip: Option<ZipData>,
    /// How many of this page's fixes were transferred from a watch
    /// sentinel. Needed to re-plant the watch if a read fails after
    /// the transfer.
    pub watch_fixes: u32,
}

impl DescMeta {
    fn empty() -> Self {
        Self {
            id: PageId::new(0, 0),
            state: PageState::Unused,
            io_fix: IoFix::None,
            oldest_modification: 0,
            newest_modification: 0,
            access_time: None,
            old: false,
            real_size: 0,
            key_version: 0,
            zip: None,
            watch_fixes: 0,
        }
    }

    /// Dirty pages carry a non-zero oldest modification.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.oldest_modification != 0
    }

    /// Reset to the free state. The zip image must already be gone.
    pub fn reset(&mut self) {
        debug_assert!(self.zip.is_none(), "resetting a descriptor that still owns zip data");
        *self = Self::empty();
    }
}

/// The per-page control block.
pub struct PageDescriptor {
    meta: Mutex<DescMeta>,
    io_done: Condvar,
    fix_count: AtomicU32,
    modify_clock: AtomicU64,
    frame: Arc<RwLock<Option<Box<Frame>>>>,
    /// Node id in the instance's LRU list, NIL when unlinked.
    lru_node: AtomicU32,
    /// Node id in the instance's unzip list, NIL when unlinked.
    unzip_node: AtomicU32,
    /// Owning chunk for blocks, [`NO_CHUNK`] for bare descriptors.
    chunk: u64,
    /// True only for the fixed watch-sentinel pool.
    watch_sentinel: bool,
}

impl PageDescriptor {
    /// A block descriptor owning a zeroed frame, belonging to `chunk`.
    pub fn new_block(chunk: u64) -> Self {
        Self {
            meta: Mutex::new(DescMeta::empty()),
            io_done: Condvar::new(),
            fix_count: AtomicU32::new(0),
            modify_clock: AtomicU64::new(0),
            frame: Arc::new(RwLock::new(Some(Box::new(Frame::new())))),
            lru_node: AtomicU32::new(NIL),
            unzip_node: AtomicU32::new(NIL),
            chunk,
            watch_sentinel: false,
        }
    }

    /// A bare descriptor without a frame (compressed-only pages).
    pub fn new_bare() -> Self {
        Self {
            meta: Mutex::new(DescMeta::empty()),
            io_done: Condvar::new(),
            fix_count: AtomicU32::new(0),
            modify_clock: AtomicU64::new(0),
            frame: Arc::new(RwLock::new(None)),
            lru_node: AtomicU32::new(NIL),
            unzip_node: AtomicU32::new(NIL),
            chunk: NO_CHUNK,
            watch_sentinel: false,
        }
    }

    /// A watch sentinel for the fixed registry.
    pub fn new_watch_sentinel() -> Self {
        let mut d = Self::new_bare();
        d.watch_sentinel = true;
        d
    }

    // ========================================================================
    // Metadata access
    // ========================================================================

    /// Lock the short mutex.
    #[inline]
    pub fn meta(&self) -> MutexGuard<'_, DescMeta> {
        self.meta.lock()
    }

    /// Whether this descriptor is one of the watch sentinels. Constant
    /// per descriptor, so no lock is needed — this is the
    /// `is_sentinel` disambiguator used by hash-index readers.
    #[inline]
    pub fn is_watch_sentinel(&self) -> bool {
        self.watch_sentinel
    }

    /// Owning chunk id ([`NO_CHUNK`] for bare descriptors).
    #[inline]
    pub fn chunk_id(&self) -> u64 {
        self.chunk
    }

    /// Whether this descriptor owns a frame slot (is a block).
    #[inline]
    pub fn is_block(&self) -> bool {
        self.chunk != NO_CHUNK
    }

    // ========================================================================
    // Buffer-fix protocol
    // ========================================================================

    /// Increment the fix count. Caller must hold the identity's hash
    /// partition lock or this descriptor's meta mutex.
    #[inline]
    pub fn fix(&self) -> u32 {
        self.fix_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the fix count. Returns the new count.
    ///
    /// # Panics
    /// Panics on underflow; fixes and unfixes must pair.
    #[inline]
    pub fn unfix(&self) -> u32 {
        let old = self.fix_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "buffer-fix underflow");
        old - 1
    }

    /// Current fix count.
    #[inline]
    pub fn fix_count(&self) -> u32 {
        self.fix_count.load(Ordering::Acquire)
    }

    /// Move the entire fix count of `self` onto `to` (watch-sentinel
    /// and relocation handoff). Caller holds the partition write lock.
    pub fn transfer_fixes(&self, to: &PageDescriptor) {
        let n = self.fix_count.swap(0, Ordering::AcqRel);
        if n > 0 {
            to.fix_count.fetch_add(n, Ordering::AcqRel);
        }
    }

    /// Add `n` fixes at once (watch re-planting). Same locking rule as
    /// [`fix`](Self::fix).
    pub fn add_fixes(&self, n: u32) {
        self.fix_count.fetch_add(n, Ordering::AcqRel);
    }

    /// Drop `n` fixes at once.
    pub fn remove_fixes(&self, n: u32) {
        let old = self.fix_count.fetch_sub(n, Ordering::AcqRel);
        assert!(old >= n, "buffer-fix underflow");
    }

    // ========================================================================
    // Modify clock (optimistic access)
    // ========================================================================

    /// Current modify clock.
    #[inline]
    pub fn modify_clock(&self) -> u64 {
        self.modify_clock.load(Ordering::Acquire)
    }

    /// Bump the clock; called on every identity change or relocation,
    /// under the locks that make the change.
    #[inline]
    pub fn bump_modify_clock(&self) {
        self.modify_clock.fetch_add(1, Ordering::AcqRel);
    }

    // ========================================================================
    // Frame latch
    // ========================================================================

    /// The frame cell, for code that needs the raw lock (I/O
    /// completion, relocation).
    #[inline]
    pub(crate) fn frame_cell(&self) -> &Arc<RwLock<Option<Box<Frame>>>> {
        &self.frame
    }

    /// Acquire the page latch in shared mode. May block.
    pub fn latch_shared(&self) -> FrameReadLatch {
        self.frame.read_arc()
    }

    /// Acquire the page latch in exclusive mode. May block.
    pub fn latch_exclusive(&self) -> FrameWriteLatch {
        self.frame.write_arc()
    }

    /// Try the page latch in shared mode without blocking.
    pub fn try_latch_shared(&self) -> Option<FrameReadLatch> {
        self.frame.try_read_arc()
    }

    /// Try the page latch in exclusive mode without blocking.
    pub fn try_latch_exclusive(&self) -> Option<FrameWriteLatch> {
        self.frame.try_write_arc()
    }

    // ========================================================================
    // I/O fix waiting
    // ========================================================================

    /// Mark I/O complete and wake anyone waiting on it. Clears the
    /// io-fix under the meta mutex.
    pub fn complete_io(&self) {
        let mut meta = self.meta.lock();
        meta.io_fix = IoFix::None;
        drop(meta);
        self.io_done.notify_all();
    }

    /// Wake waiters without clearing the io-fix (used when the state
    /// changed underneath them, e.g. relocation).
    pub fn notify_io_waiters(&self) {
        self.io_done.notify_all();
    }

    /// Block until no read or relocation pin is in flight on this
    /// descriptor. A fast non-blocking check avoids the condvar on the
    /// hot path. Aborts with [`Error::Interrupted`] when the pool is
    /// shutting down.
    pub fn wait_io_idle(&self, killed: &AtomicBool) -> Result<()> {
        let mut meta = self.meta.lock();
        if matches!(meta.io_fix, IoFix::None | IoFix::Write) {
            return Ok(());
        }
        loop {
            let _ = self
                .io_done
                .wait_for(&mut meta, Duration::from_millis(50));
            if matches!(meta.io_fix, IoFix::None | IoFix::Write) {
                return Ok(());
            }
            if killed.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
        }
    }

    // ========================================================================
    // List membership (written under the coarse lock only)
    // ========================================================================

    #[inline]
    pub(crate) fn lru_node(&self) -> u32 {
        self.lru_node.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_lru_node(&self, node: u32) {
        self.lru_node.store(node, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn unzip_node(&self) -> u32 {
        self.unzip_node.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_unzip_node(&self, node: u32) {
        self.unzip_node.store(node, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("PageDescriptor")
            .field("id", &meta.id)
            .field("state", &meta.state)
            .field("io_fix", &meta.io_fix)
            .field("fix_count", &self.fix_count())
            .field("chunk", &self.chunk)
            .finish()
    }
}
