//! RAII guards for latched pages, and the optimistic re-entry handle.
//!
//! A guard pairs a buffer-fix (pinning the descriptor) with the page
//! latch (serializing access to the bytes). Drop order matters: the
//! latch is released first, then the fix, so the page can never be
//! evicted while its bytes are still borrowed.

use std::sync::Arc;

use crate::buffer::descriptor::{
    FrameReadLatch, FrameWriteLatch, IoFix, PageDescriptor, PageState,
};
use crate::buffer::instance::PoolInstance;
use crate::common::{Lsn, PageId};

/// Requested access mode for [`get_page`](crate::BufferPool::get_page).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// Shared read latch.
    Shared,
    /// Exclusive write latch.
    Exclusive,
}

/// A fetched page, latched per the requested mode.
pub enum LatchedPage {
    Shared(PageReadGuard),
    Exclusive(PageWriteGuard),
}

impl std::fmt::Debug for LatchedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LatchedPage::Shared(g) => f.debug_tuple("Shared").field(g).finish(),
            LatchedPage::Exclusive(g) => f.debug_tuple("Exclusive").field(g).finish(),
        }
    }
}

impl LatchedPage {
    pub fn id(&self) -> PageId {
        match self {
            LatchedPage::Shared(g) => g.id(),
            LatchedPage::Exclusive(g) => g.id(),
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            LatchedPage::Shared(g) => g.data(),
            LatchedPage::Exclusive(g) => g.data(),
        }
    }
}

fn frame_bytes(latch: &FrameReadLatch) -> &[u8] {
    match latch.as_deref() {
        Some(frame) => frame.as_slice(),
        None => unreachable!("latched file page always owns a frame"),
    }
}

/// Guard for shared read access to a page.
///
/// Multiple read guards may exist for the same page. Dropping the
/// guard releases the latch and the buffer-fix.
pub struct PageReadGuard {
    desc: Arc<PageDescriptor>,
    latch: Option<FrameReadLatch>,
    id: PageId,
}

impl std::fmt::Debug for PageReadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReadGuard").field("id", &self.id).finish()
    }
}

impl PageReadGuard {
    pub(crate) fn new(desc: Arc<PageDescriptor>, latch: FrameReadLatch, id: PageId) -> Self {
        Self {
            desc,
            latch: Some(latch),
            id,
        }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    /// The page bytes.
    pub fn data(&self) -> &[u8] {
        match &self.latch {
            Some(latch) => frame_bytes(latch),
            None => unreachable!("latch lives as long as the guard"),
        }
    }

    /// Release everything but remember the page's modify clock, so the
    /// caller can come back later and re-validate instead of paying the
    /// full lookup (the optimistic pattern).
    pub fn release_optimistic(self) -> OptimisticHandle {
        // Capture the clock while the latch still excludes relocation.
        let clock = self.desc.modify_clock();
        let desc = Arc::clone(&self.desc);
        let id = self.id;
        drop(self);
        OptimisticHandle { desc, id, clock }
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.latch = None;
        self.desc.unfix();
    }
}

/// Guard for exclusive write access to a page.
///
/// The holder calls [`mark_dirty`](Self::mark_dirty) after logging a
/// modification; dropping the guard releases the latch and the fix.
pub struct PageWriteGuard {
    desc: Arc<PageDescriptor>,
    latch: Option<FrameWriteLatch>,
    id: PageId,
    instance: Arc<PoolInstance>,
}

impl std::fmt::Debug for PageWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteGuard").field("id", &self.id).finish()
    }
}

impl PageWriteGuard {
    pub(crate) fn new(
        desc: Arc<PageDescriptor>,
        latch: FrameWriteLatch,
        id: PageId,
        instance: Arc<PoolInstance>,
    ) -> Self {
        Self {
            desc,
            latch: Some(latch),
            id,
            instance,
        }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        match self.latch.as_ref().and_then(|l| l.as_deref()) {
            Some(frame) => frame.as_slice(),
            None => unreachable!("latched file page always owns a frame"),
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.latch.as_mut().and_then(|l| l.as_deref_mut()) {
            Some(frame) => frame.as_mut_slice(),
            None => unreachable!("latched file page always owns a frame"),
        }
    }

    /// Record a modification at `lsn`. First dirtying enters the page
    /// into the flush list; the compressed image, if one was resident,
    /// is dropped since it no longer matches.
    pub fn mark_dirty(&mut self, lsn: Lsn) {
        self.instance.note_modification(&self.desc, lsn);
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.latch = None;
        self.desc.unfix();
    }
}

/// Capability to re-enter a previously fetched page cheaply.
///
/// Carries the descriptor and the modify clock observed at release. If
/// the block was evicted, relocated or reused since, the clock moved
/// and [`try_read`](Self::try_read) reports a miss; the caller then
/// retries through the full fetch path.
pub struct OptimisticHandle {
    desc: Arc<PageDescriptor>,
    id: PageId,
    clock: u64,
}

impl OptimisticHandle {
    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Attempt to re-latch the same logical page without any hash
    /// lookup. Never blocks; any contention or staleness is a `None`.
    pub fn try_read(&self) -> Option<PageReadGuard> {
        {
            // Fixing under the meta mutex is the other legal increment
            // site besides the hash-partition lock; it excludes the
            // eviction check.
            let meta = self.desc.meta();
            if meta.state != PageState::FilePage
                || meta.id != self.id
                || matches!(meta.io_fix, IoFix::Read | IoFix::Pin)
            {
                return None;
            }
            self.desc.fix();
        }

        let latch = match self.desc.try_latch_shared() {
            Some(l) => l,
            None => {
                self.desc.unfix();
                return None;
            }
        };

        if self.desc.modify_clock() != self.clock || latch.is_none() {
            drop(latch);
            self.desc.unfix();
            return None;
        }

        Some(PageReadGuard::new(Arc::clone(&self.desc), latch, self.id))
    }
}
