//! Fixed-count pool of reference-counted KV cache blocks.
//!
//! ## Features
//!
//! - **Free list allocation**: O(1) per block
//! - **All-or-nothing batches**: [`BlockPool::malloc`] never partially allocates
//! - **Reference counting**: blocks shared between streams stay allocated
//!   until the last holder releases them
//!
//! Block `0` is reserved at construction and never handed out.
//!
//! ## Example
//!
//! ```
//! use nano_kvsched::core::block_pool::BlockPool;
//!
//! let mut pool = BlockPool::new(4);
//! assert_eq!(pool.free_block_nums(), 3);
//!
//! let blocks = pool.malloc(2).unwrap();
//! assert_eq!(pool.free_block_nums(), 1);
//!
//! pool.free(&blocks);
//! assert_eq!(pool.free_block_nums(), 3);
//! ```

use std::collections::VecDeque;

use tracing::warn;

use crate::core::block::Block;
use crate::error::{Error, Result};

/// Index of the block kept out of circulation.
pub const RESERVED_BLOCK_ID: usize = 0;

/// Arena of blocks plus a free list.
#[derive(Debug)]
pub struct BlockPool {
    /// All blocks indexed by block_id.
    blocks: Vec<Block>,
    /// Free block IDs, handed out front first.
    free_list: VecDeque<usize>,
}

impl BlockPool {
    /// Create a pool of `block_nums` blocks, one of which is reserved.
    pub fn new(block_nums: usize) -> Self {
        let blocks = (0..block_nums).map(Block::new).collect();
        let free_list = (0..block_nums)
            .filter(|&id| id != RESERVED_BLOCK_ID)
            .collect();

        Self { blocks, free_list }
    }

    /// Total number of blocks, including the reserved one.
    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks that can ever be allocated.
    pub fn usable_blocks(&self) -> usize {
        self.blocks.len().saturating_sub(1)
    }

    /// Number of blocks with no references.
    pub fn free_block_nums(&self) -> usize {
        self.free_list.len()
    }

    /// Number of blocks with at least one reference.
    pub fn used_block_nums(&self) -> usize {
        self.usable_blocks() - self.free_list.len()
    }

    /// Check if `num_blocks` blocks can be allocated right now.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Reference count of a block, or `None` for an unknown index.
    pub fn ref_count(&self, block_id: usize) -> Option<usize> {
        self.blocks.get(block_id).map(Block::ref_count)
    }

    /// Allocate `num_blocks` blocks, each with a reference count of 1.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientMemory`] without allocating anything if
    /// fewer than `num_blocks` blocks are free.
    pub fn malloc(&mut self, num_blocks: usize) -> Result<Vec<usize>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::InsufficientMemory {
                requested: num_blocks,
                free: self.free_list.len(),
            });
        }

        let block_ids: Vec<usize> = self.free_list.drain(..num_blocks).collect();
        for &block_id in &block_ids {
            self.blocks[block_id].increment_ref();
        }

        Ok(block_ids)
    }

    /// Drop one reference from each listed block.
    ///
    /// Blocks reaching zero go back to the free list. Releasing a block that
    /// is already free, reserved or out of range is logged and skipped.
    ///
    /// # Returns
    ///
    /// Number of blocks that became free.
    pub fn free(&mut self, block_ids: &[usize]) -> usize {
        let mut freed = 0;
        for &block_id in block_ids {
            if block_id == RESERVED_BLOCK_ID {
                warn!(block_id, "ignoring release of reserved block");
                continue;
            }
            let Some(block) = self.blocks.get_mut(block_id) else {
                warn!(block_id, "ignoring release of unknown block");
                continue;
            };
            match block.decrement_ref() {
                Ok(0) => {
                    self.free_list.push_back(block_id);
                    freed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("ignoring double release: {e}"),
            }
        }
        freed
    }

    /// Add a reference to an allocated block (sharing it with another chain).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the block is free, reserved
    /// or out of range; sharing such a block would hand out memory the pool
    /// still considers available.
    pub fn increment_ref(&mut self, block_id: usize) -> Result<usize> {
        match self.blocks.get_mut(block_id) {
            Some(block) if block_id != RESERVED_BLOCK_ID && block.in_use() => {
                Ok(block.increment_ref())
            }
            _ => Err(Error::InvariantViolation(format!(
                "cannot share block {block_id}: not allocated"
            ))),
        }
    }

    /// Verify that the free list and the reference counts agree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] describing the first mismatch.
    pub fn check_consistency(&self) -> Result<()> {
        let mut on_free_list = vec![false; self.blocks.len()];
        for &block_id in &self.free_list {
            if block_id == RESERVED_BLOCK_ID || block_id >= self.blocks.len() {
                return Err(Error::InvariantViolation(format!(
                    "free list holds invalid block {block_id}"
                )));
            }
            if std::mem::replace(&mut on_free_list[block_id], true) {
                return Err(Error::InvariantViolation(format!(
                    "block {block_id} appears twice on the free list"
                )));
            }
        }

        for block in self.blocks.iter().skip(1) {
            let free = on_free_list[block.block_id()];
            if free == block.in_use() {
                return Err(Error::InvariantViolation(format!(
                    "block {} has ref_count {} but free={}",
                    block.block_id(),
                    block.ref_count(),
                    free
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reserves_block_zero() {
        let pool = BlockPool::new(4);
        assert_eq!(pool.total_blocks(), 4);
        assert_eq!(pool.usable_blocks(), 3);
        assert_eq!(pool.free_block_nums(), 3);
        assert_eq!(pool.used_block_nums(), 0);

        let mut pool = BlockPool::new(4);
        let blocks = pool.malloc(3).unwrap();
        assert!(!blocks.contains(&RESERVED_BLOCK_ID));
    }

    #[test]
    fn test_malloc_is_all_or_nothing() {
        let mut pool = BlockPool::new(5);

        pool.malloc(3).unwrap();
        assert_eq!(pool.free_block_nums(), 1);

        let err = pool.malloc(2).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientMemory {
                requested: 2,
                free: 1
            }
        ));
        assert_eq!(pool.free_block_nums(), 1);
        assert!(pool.check_consistency().is_ok());
    }

    #[test]
    fn test_malloc_zero_blocks() {
        let mut pool = BlockPool::new(2);
        assert!(pool.malloc(0).unwrap().is_empty());
        assert_eq!(pool.free_block_nums(), 1);
    }

    #[test]
    fn test_shared_block_freed_on_last_release() {
        let mut pool = BlockPool::new(10);
        let blocks = pool.malloc(1).unwrap();
        let id = blocks[0];

        assert_eq!(pool.increment_ref(id).unwrap(), 2);
        assert_eq!(pool.free(&blocks), 0);
        assert_eq!(pool.ref_count(id), Some(1));
        assert_eq!(pool.free(&blocks), 1);
        assert_eq!(pool.free_block_nums(), 9);
    }

    #[test]
    fn test_double_free_is_guarded() {
        let mut pool = BlockPool::new(4);
        let blocks = pool.malloc(2).unwrap();

        assert_eq!(pool.free(&blocks), 2);
        assert_eq!(pool.free(&blocks), 0);
        assert_eq!(pool.free_block_nums(), 3);
        assert!(pool.check_consistency().is_ok());
    }

    #[test]
    fn test_cannot_share_free_block() {
        let mut pool = BlockPool::new(4);
        assert!(pool.increment_ref(1).is_err());
        assert!(pool.increment_ref(RESERVED_BLOCK_ID).is_err());
        assert!(pool.increment_ref(100).is_err());
    }
}
