//! Binary buddy allocator for compressed page images.
//!
//! Compressed pages are variable-size; storing each in a whole frame
//! would defeat the point. The buddy allocator carves page-size arenas
//! into power-of-two blocks from [`BUDDY_LOW`] up to [`PAGE_SIZE`]:
//! allocation splits the smallest sufficient free block downwards,
//! freeing merges a block with its buddy (offset XOR size) back
//! upwards while the buddy is free.
//!
//! Payloads are write-once: stored at allocation, copied out on read,
//! untouched in between. Each arena has its own `RwLock`, so reading a
//! compressed image never contends with the free-list mutex.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::{BUDDY_CLASSES, BUDDY_LOW, PAGE_SIZE};
use crate::storage::Frame;

/// Handle to one allocated buddy block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyHandle {
    arena: u32,
    offset: u32,
    class: u8,
    /// Bytes actually stored (<= class size).
    len: u32,
}

impl BuddyHandle {
    /// Size class in bytes.
    #[inline]
    pub fn class_size(&self) -> usize {
        BUDDY_LOW << self.class
    }

    /// Stored payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Size class index for a payload of `len` bytes, or `None` if it does
/// not fit a page.
fn class_for(len: usize) -> Option<u8> {
    if len > PAGE_SIZE {
        return None;
    }
    let size = len.next_power_of_two().max(BUDDY_LOW);
    Some((size / BUDDY_LOW).trailing_zeros() as u8)
}

struct Arena {
    data: Arc<RwLock<Box<Frame>>>,
}

struct BuddyInner {
    arenas: Vec<Arena>,
    /// Free blocks per class: (arena, offset).
    free: Vec<Vec<(u32, u32)>>,
    used_bytes: usize,
    arena_cap: usize,
}

/// Accounting snapshot; free + used always equals the arena total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyStats {
    pub arena_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

/// Per-instance buddy allocator.
pub struct BuddyAllocator {
    inner: Mutex<BuddyInner>,
}

impl BuddyAllocator {
    pub fn new(arena_cap: usize) -> Self {
        Self {
            inner: Mutex::new(BuddyInner {
                arenas: Vec::new(),
                free: vec![Vec::new(); BUDDY_CLASSES],
                used_bytes: 0,
                arena_cap,
            }),
        }
    }

    /// Store `payload`, returning a handle, or `None` when every arena
    /// is exhausted and the cap forbids another. The caller reacts to
    /// `None` by driving eviction and retrying.
    pub fn alloc(&self, payload: &[u8]) -> Option<BuddyHandle> {
        let class = class_for(payload.len())?;
        let mut inner = self.inner.lock();

        let (arena, offset) = match Self::take_block(&mut inner, class) {
            Some(b) => b,
            None => {
                if inner.arenas.len() >= inner.arena_cap {
                    return None;
                }
                let id = inner.arenas.len() as u32;
                inner.arenas.push(Arena {
                    data: Arc::new(RwLock::new(Box::new(Frame::new()))),
                });
                let top = (BUDDY_CLASSES - 1) as u8;
                inner.free[top as usize].push((id, 0));
                match Self::take_block(&mut inner, class) {
                    Some(b) => b,
                    None => unreachable!("fresh arena must satisfy any class"),
                }
            }
        };

        let data = Arc::clone(&inner.arenas[arena as usize].data);
        inner.used_bytes += BUDDY_LOW << class;
        drop(inner);

        let mut frame = data.write();
        let at = offset as usize;
        frame.as_mut_slice()[at..at + payload.len()].copy_from_slice(payload);

        Some(BuddyHandle {
            arena,
            offset,
            class,
            len: payload.len() as u32,
        })
    }

    /// Pop a free block of `class`, splitting a larger one if needed.
    fn take_block(inner: &mut BuddyInner, class: u8) -> Option<(u32, u32)> {
        if let Some(b) = inner.free[class as usize].pop() {
            return Some(b);
        }
        // Find the nearest larger free block and split it down,
        // pushing the upper halves onto the smaller lists.
        let source = ((class as usize + 1)..BUDDY_CLASSES)
            .find(|&c| !inner.free[c].is_empty())?;
        let (arena, offset) = match inner.free[source].pop() {
            Some(b) => b,
            None => unreachable!("checked non-empty above"),
        };
        for c in (class as usize..source).rev() {
            let half = (BUDDY_LOW << c) as u32;
            inner.free[c].push((arena, offset + half));
        }
        Some((arena, offset))
    }

    /// Copy the stored payload out.
    pub fn read(&self, handle: &BuddyHandle) -> Vec<u8> {
        let data = {
            let inner = self.inner.lock();
            Arc::clone(&inner.arenas[handle.arena as usize].data)
        };
        let frame = data.read();
        let at = handle.offset as usize;
        frame.as_slice()[at..at + handle.len as usize].to_vec()
    }

    /// Return a block, coalescing with its buddy up the size ladder.
    pub fn free(&self, handle: BuddyHandle) {
        let mut inner = self.inner.lock();
        inner.used_bytes -= BUDDY_LOW << handle.class;

        let mut class = handle.class as usize;
        let mut offset = handle.offset;
        while class < BUDDY_CLASSES - 1 {
            let size = (BUDDY_LOW << class) as u32;
            let buddy = offset ^ size;
            let list = &mut inner.free[class];
            match list.iter().position(|&(a, o)| a == handle.arena && o == buddy) {
                Some(pos) => {
                    list.swap_remove(pos);
                    offset = offset.min(buddy);
                    class += 1;
                }
                None => break,
            }
        }
        inner.free[class].push((handle.arena, offset));
    }

    /// Accounting snapshot.
    pub fn stats(&self) -> BuddyStats {
        let inner = self.inner.lock();
        let arena_bytes = inner.arenas.len() * PAGE_SIZE;
        let free_bytes: usize = inner
            .free
            .iter()
            .enumerate()
            .map(|(c, list)| list.len() * (BUDDY_LOW << c))
            .sum();
        BuddyStats {
            arena_bytes,
            used_bytes: inner.used_bytes,
            free_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_for() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(BUDDY_LOW), Some(0));
        assert_eq!(class_for(BUDDY_LOW + 1), Some(1));
        assert_eq!(class_for(PAGE_SIZE), Some((BUDDY_CLASSES - 1) as u8));
        assert_eq!(class_for(PAGE_SIZE + 1), None);
    }

    #[test]
    fn test_alloc_read_round_trip() {
        let buddy = BuddyAllocator::new(4);
        let payload: Vec<u8> = (0..1500).map(|i| (i % 251) as u8).collect();
        let h = buddy.alloc(&payload).unwrap();
        assert_eq!(h.class_size(), 2048);
        assert_eq!(buddy.read(&h), payload);
    }

    #[test]
    fn test_split_and_coalesce() {
        let buddy = BuddyAllocator::new(1);
        // One arena = one page. Four quarter-page blocks fill it.
        let quarter = PAGE_SIZE / 4;
        let handles: Vec<BuddyHandle> = (0..4)
            .map(|i| buddy.alloc(&vec![i as u8; quarter]).unwrap())
            .collect();

        let stats = buddy.stats();
        assert_eq!(stats.arena_bytes, PAGE_SIZE);
        assert_eq!(stats.used_bytes, PAGE_SIZE);
        assert_eq!(stats.free_bytes, 0);

        // Cap reached and no free block: allocation fails.
        assert!(buddy.alloc(&vec![0u8; quarter]).is_none());

        // Free everything; buddies coalesce back to one full block.
        for h in handles {
            buddy.free(h);
        }
        let stats = buddy.stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.free_bytes, PAGE_SIZE);

        // The coalesced block satisfies a full-page allocation.
        assert!(buddy.alloc(&vec![9u8; PAGE_SIZE]).is_some());
    }

    #[test]
    fn test_conservation_under_interleaving() {
        let buddy = BuddyAllocator::new(8);
        let mut live = Vec::new();
        let mut outstanding = 0usize;

        // Deterministic interleave of allocs and frees.
        for i in 0..200usize {
            if i % 3 != 2 {
                let len = BUDDY_LOW + (i * 97) % (PAGE_SIZE - BUDDY_LOW);
                if let Some(h) = buddy.alloc(&vec![0xA5; len]) {
                    outstanding += h.class_size();
                    live.push(h);
                }
            } else if let Some(h) = live.pop() {
                outstanding -= h.class_size();
                buddy.free(h);
            }

            let stats = buddy.stats();
            assert_eq!(stats.used_bytes, outstanding);
            assert_eq!(stats.free_bytes + stats.used_bytes, stats.arena_bytes);
        }
    }

    #[test]
    fn test_payloads_do_not_interfere() {
        let buddy = BuddyAllocator::new(2);
        let a = buddy.alloc(&vec![0x11; BUDDY_LOW]).unwrap();
        let b = buddy.alloc(&vec![0x22; BUDDY_LOW]).unwrap();
        let c = buddy.alloc(&vec![0x33; 2 * BUDDY_LOW]).unwrap();

        assert!(buddy.read(&a).iter().all(|&x| x == 0x11));
        assert!(buddy.read(&b).iter().all(|&x| x == 0x22));
        assert!(buddy.read(&c).iter().all(|&x| x == 0x33));

        buddy.free(b);
        assert!(buddy.read(&a).iter().all(|&x| x == 0x11));
        assert!(buddy.read(&c).iter().all(|&x| x == 0x33));
    }
}
