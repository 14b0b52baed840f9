//! Block abstractions for the paged KV cache.
//!
//! The KV cache is split into fixed-size blocks addressed by integer index.
//! Ownership is expressed by index plus reference count: streams hold block
//! indices, the pool holds the counts.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// The hash includes the parent block's hash, so blocks at the same position
/// with different prefixes hash differently.
///
/// # Example
///
/// ```
/// use nano_kvsched::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();

    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }

    for &token in token_ids {
        token.hash(&mut hasher);
    }

    hasher.finish()
}

/// Bookkeeping for one physical cache block.
///
/// A block with `ref_count == 0` is free. Every stream chain that depends on
/// the block, and the prefix cache if it committed the block, holds one
/// reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    block_id: usize,
    ref_count: usize,
}

impl Block {
    /// Create a free block.
    pub fn new(block_id: usize) -> Self {
        Self {
            block_id,
            ref_count: 0,
        }
    }

    /// Get the block ID.
    pub fn block_id(&self) -> usize {
        self.block_id
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Whether any chain references this block.
    pub fn in_use(&self) -> bool {
        self.ref_count > 0
    }

    /// Increment reference count.
    pub fn increment_ref(&mut self) -> usize {
        self.ref_count += 1;
        self.ref_count
    }

    /// Decrement reference count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the block is already free;
    /// the count is left at zero.
    pub fn decrement_ref(&mut self) -> Result<usize> {
        if self.ref_count == 0 {
            return Err(Error::InvariantViolation(format!(
                "block {} released while free",
                self.block_id
            )));
        }
        self.ref_count -= 1;
        Ok(self.ref_count)
    }
}

/// Maps a stream's logical positions to physical block IDs.
///
/// Token at position `p` is stored in physical block
/// `block_ids[p / seq_size_per_block]` at slot `p % seq_size_per_block`.
///
/// # Example
///
/// ```
/// use nano_kvsched::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.append_block(3);   // Tokens 32-47
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    block_ids: Vec<usize>,
    seq_size_per_block: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(seq_size_per_block: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            seq_size_per_block,
        }
    }

    /// Tokens per block.
    pub fn seq_size_per_block(&self) -> usize {
        self.seq_size_per_block
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the logical block is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<usize> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "logical block {} out of bounds ({} allocated)",
                    logical_block_idx,
                    self.block_ids.len()
                ))
            })
    }

    /// Add a physical block to the end of the table.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Add several physical blocks in order.
    pub fn extend(&mut self, block_ids: impl IntoIterator<Item = usize>) {
        self.block_ids.extend(block_ids);
    }

    /// Number of blocks held.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Token capacity of the held blocks.
    pub fn capacity(&self) -> usize {
        self.block_ids.len() * self.seq_size_per_block
    }

    /// All physical block IDs in logical order.
    pub fn get_physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }

    /// Get physical slot indices for the first `seq_len` tokens.
    ///
    /// Global slot = `block_id * seq_size_per_block + slot_within_block`.
    /// Positions beyond the held blocks are skipped. A table without a block
    /// size maps nothing.
    pub fn get_slot_mapping(&self, seq_len: usize) -> Vec<usize> {
        if self.seq_size_per_block == 0 {
            return Vec::new();
        }

        let mut slots = Vec::with_capacity(seq_len);

        for pos in 0..seq_len {
            let logical_block = pos / self.seq_size_per_block;
            let slot_in_block = pos % self.seq_size_per_block;

            if let Some(&physical_block) = self.block_ids.get(logical_block) {
                slots.push(physical_block * self.seq_size_per_block + slot_in_block);
            }
        }

        slots
    }

    /// Move every block ID out, leaving the table empty.
    pub fn take(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.block_ids)
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use nano_kvsched::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);
/// assert_eq!(compute_num_blocks(32, 16), 2);
/// assert_eq!(compute_num_blocks(0, 16), 0);
/// ```
pub fn compute_num_blocks(seq_len: usize, seq_size_per_block: usize) -> usize {
    seq_len.div_ceil(seq_size_per_block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_starts_free() {
        let block = Block::new(42);
        assert_eq!(block.block_id(), 42);
        assert_eq!(block.ref_count(), 0);
        assert!(!block.in_use());
    }

    #[test]
    fn test_block_ref_counting() {
        let mut block = Block::new(0);

        assert_eq!(block.increment_ref(), 1);
        assert_eq!(block.increment_ref(), 2);
        assert!(block.in_use());

        assert_eq!(block.decrement_ref().unwrap(), 1);
        assert_eq!(block.decrement_ref().unwrap(), 0);

        // Guarded: never goes below zero
        assert!(matches!(
            block.decrement_ref(),
            Err(Error::InvariantViolation(_))
        ));
        assert_eq!(block.ref_count(), 0);
    }

    #[test]
    fn test_block_table_take() {
        let mut table = BlockTable::new(4);
        table.extend([3, 7, 1]);
        assert_eq!(table.capacity(), 12);

        let ids = table.take();
        assert_eq!(ids, vec![3, 7, 1]);
        assert!(table.is_empty());
        assert!(table.take().is_empty());
    }

    #[test]
    fn test_block_table_slot_mapping() {
        let mut table = BlockTable::new(16);
        table.append_block(5);
        table.append_block(12);

        let slots = table.get_slot_mapping(20);
        assert_eq!(slots.len(), 20);
        assert_eq!(slots[0], 5 * 16);
        assert_eq!(slots[15], 5 * 16 + 15);
        assert_eq!(slots[16], 12 * 16);
        assert_eq!(slots[19], 12 * 16 + 3);
    }

    #[test]
    fn test_default_table_maps_no_slots() {
        let table = BlockTable::default();
        assert!(table.get_slot_mapping(3).is_empty());
    }

    #[test]
    fn test_hash_token_block() {
        let tokens = [1u32, 2, 3, 4, 5];

        let hash1 = hash_token_block(&tokens, None);
        let hash2 = hash_token_block(&tokens, Some(999));
        assert_ne!(hash1, hash2);

        let hash3 = hash_token_block(&tokens, Some(999));
        assert_eq!(hash2, hash3);

        let hash4 = hash_token_block(&[1u32, 2, 3, 4, 6], None);
        assert_ne!(hash1, hash4);
    }

    #[test]
    fn test_compute_num_blocks() {
        assert_eq!(compute_num_blocks(0, 16), 0);
        assert_eq!(compute_num_blocks(1, 16), 1);
        assert_eq!(compute_num_blocks(16, 16), 1);
        assert_eq!(compute_num_blocks(17, 16), 2);
        assert_eq!(compute_num_blocks(5, 2), 3);
    }
}
