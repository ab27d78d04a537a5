//! Chunks - the unit of pool growth and shrinkage.
//!
//! A chunk is a batch of block descriptors (each owning a page frame)
//! allocated together at pool init or online grow. Shrink works at
//! chunk granularity: a chunk is marked withdrawing, drained of live
//! pages, and dropped whole.

use std::sync::Arc;

use crate::buffer::descriptor::{PageDescriptor, PageState};

/// A batch of blocks created in one allocation step.
pub struct Chunk {
    pub id: u64,
    pub blocks: Vec<Arc<PageDescriptor>>,
    /// Set during shrink; blocks of a withdrawing chunk are never
    /// handed out from the free list again.
    pub withdrawing: bool,
}

impl Chunk {
    pub fn new(id: u64, n_blocks: usize) -> Self {
        Self {
            id,
            blocks: (0..n_blocks)
                .map(|_| Arc::new(PageDescriptor::new_block(id)))
                .collect(),
            withdrawing: false,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// A chunk may be dropped once every block is unused and
    /// unreferenced outside the chunk itself.
    pub fn is_drained(&self) -> bool {
        self.blocks.iter().all(|b| {
            Arc::strong_count(b) == 1
                && b.fix_count() == 0
                && b.meta().state == PageState::Unused
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_blocks_belong_to_it() {
        let chunk = Chunk::new(3, 8);
        assert_eq!(chunk.len(), 8);
        assert!(chunk.blocks.iter().all(|b| b.chunk_id() == 3));
        assert!(chunk.blocks.iter().all(|b| b.is_block()));
    }

    #[test]
    fn test_fresh_chunk_is_drained() {
        let chunk = Chunk::new(0, 4);
        assert!(chunk.is_drained());
    }

    #[test]
    fn test_referenced_block_blocks_drain() {
        let chunk = Chunk::new(0, 4);
        let held = Arc::clone(&chunk.blocks[2]);
        assert!(!chunk.is_drained());
        drop(held);
        assert!(chunk.is_drained());

        chunk.blocks[1].fix();
        assert!(!chunk.is_drained());
        chunk.blocks[1].unfix();
        assert!(chunk.is_drained());
    }
}
