//! Cache manager: the single owner of KV cache blocks.
//!
//! Every allocation, release and prefix lookup goes through here. The pool and
//! the prefix cache sit behind one mutex, so each operation is atomic: no
//! other caller ever observes a half-finished allocation.
//!
//! ## Example
//!
//! ```
//! use candle_core::Device;
//! use nano_kvsched::config::CacheDataType;
//! use nano_kvsched::core::cache_config::CacheConfig;
//! use nano_kvsched::core::cache_manager::CacheManager;
//!
//! let config = CacheConfig::new(1, 4, 1, 4, 8, CacheDataType::Fp16);
//! let manager = CacheManager::new(config, &Device::Cpu).unwrap();
//! assert_eq!(manager.free_block_nums(), 3);
//!
//! let blocks = manager.malloc(2).unwrap();
//! assert_eq!(manager.free_block_nums(), 1);
//!
//! manager.free(&blocks);
//! assert_eq!(manager.free_block_nums(), 3);
//! ```

use candle_core::Device;
use parking_lot::Mutex;
use tracing::debug;

use crate::core::block::compute_num_blocks;
use crate::core::block_cache::BlockCache;
use crate::core::block_pool::BlockPool;
use crate::core::cache_config::CacheConfig;
use crate::core::kv_cache::KvCacheBuffer;
use crate::error::{Error, Result};

/// Blocks handed to a stream by [`CacheManager::malloc_with_cache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MallocResult {
    /// Reused prefix blocks first, then freshly allocated ones.
    pub block_ids: Vec<usize>,
    /// Leading tokens whose KV states are already in the reused blocks.
    pub reuse_length: usize,
}

#[derive(Debug)]
struct CacheState {
    pool: BlockPool,
    cache: BlockCache,
}

impl CacheState {
    fn evictable_block_nums(&self) -> usize {
        self.cache
            .cached_blocks()
            .filter(|&id| self.pool.ref_count(id) == Some(1))
            .count()
    }

    fn malloc(&mut self, num_blocks: usize) -> Result<Vec<usize>> {
        let free = self.pool.free_block_nums();
        if free < num_blocks {
            if free + self.evictable_block_nums() < num_blocks {
                return Err(Error::InsufficientMemory {
                    requested: num_blocks,
                    free,
                });
            }
            self.evict(num_blocks - free);
        }
        self.pool.malloc(num_blocks)
    }

    fn evict(&mut self, num_blocks: usize) {
        let mut evicted = 0;
        while evicted < num_blocks {
            let pool = &self.pool;
            let Some(block_id) = self.cache.pop_lru(|id| pool.ref_count(id) == Some(1)) else {
                break;
            };
            evicted += self.pool.free(&[block_id]);
        }
        debug!(evicted, "evicted cached blocks");
    }

    fn insert_into_cache(&mut self, token_ids: &[u32], block_ids: &[usize]) -> Result<()> {
        for block_id in self.cache.insert(token_ids, block_ids) {
            self.pool.increment_ref(block_id)?;
        }
        Ok(())
    }
}

/// Owns the block pool, the prefix cache and the block memory.
#[derive(Debug)]
pub struct CacheManager {
    config: CacheConfig,
    state: Mutex<CacheState>,
    kv_cache: KvCacheBuffer,
}

impl CacheManager {
    /// Allocate block memory for `config` on `device` and build an empty pool.
    pub fn new(config: CacheConfig, device: &Device) -> Result<Self> {
        if config.seq_size_per_block == 0 {
            return Err(Error::Config("seq_size_per_block must be positive".into()));
        }
        let kv_cache = KvCacheBuffer::new(&config, device)?;
        debug!(
            block_nums = config.block_nums,
            bytes = kv_cache.total_size_bytes(),
            "allocated kv cache"
        );

        Ok(Self {
            state: Mutex::new(CacheState {
                pool: BlockPool::new(config.block_nums),
                cache: BlockCache::new(config.seq_size_per_block),
            }),
            config,
            kv_cache,
        })
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.config
    }

    /// Block memory, for the compute engine.
    pub fn kv_cache(&self) -> &KvCacheBuffer {
        &self.kv_cache
    }

    /// Tokens per block.
    pub fn seq_size_per_block(&self) -> usize {
        self.config.seq_size_per_block
    }

    /// Number of blocks with no references.
    pub fn free_block_nums(&self) -> usize {
        self.state.lock().pool.free_block_nums()
    }

    /// Free blocks plus cached blocks nobody else references.
    pub fn available_block_nums(&self) -> usize {
        let state = self.state.lock();
        state.pool.free_block_nums() + state.evictable_block_nums()
    }

    /// Number of blocks that can ever be allocated.
    pub fn usable_block_nums(&self) -> usize {
        self.state.lock().pool.usable_blocks()
    }

    /// Number of blocks held by the prefix cache.
    pub fn cached_block_nums(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Reference count of a block.
    pub fn ref_count(&self, block_id: usize) -> Option<usize> {
        self.state.lock().pool.ref_count(block_id)
    }

    /// Fraction of usable blocks currently referenced.
    pub fn block_used_ratio(&self) -> f64 {
        let state = self.state.lock();
        let usable = state.pool.usable_blocks();
        if usable == 0 {
            return 0.0;
        }
        state.pool.used_block_nums() as f64 / usable as f64
    }

    /// Allocate `num_blocks` fresh blocks, evicting cache-only blocks if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientMemory`] without changing anything when
    /// even eviction cannot free enough blocks.
    pub fn malloc(&self, num_blocks: usize) -> Result<Vec<usize>> {
        self.state.lock().malloc(num_blocks)
    }

    /// Allocate every block `token_ids` needs, reusing a cached prefix when
    /// `reuse_cache` is set.
    ///
    /// Matched prefix blocks gain one reference each and only the remainder
    /// is allocated. On failure the matched references are dropped again.
    pub fn malloc_with_cache(&self, token_ids: &[u32], reuse_cache: bool) -> Result<MallocResult> {
        let mut state = self.state.lock();

        let matched = if reuse_cache {
            state.cache.match_prefix(token_ids)
        } else {
            Vec::new()
        };
        for &block_id in &matched {
            state.pool.increment_ref(block_id)?;
        }

        let needed = compute_num_blocks(token_ids.len(), self.config.seq_size_per_block)
            .saturating_sub(matched.len());
        let fresh = match state.malloc(needed) {
            Ok(fresh) => fresh,
            Err(e) => {
                state.pool.free(&matched);
                return Err(e);
            }
        };

        let reuse_length = matched.len() * self.config.seq_size_per_block;
        if reuse_length > 0 {
            debug!(reuse_length, "reused cached prefix");
        }

        let mut block_ids = matched;
        block_ids.extend(fresh);
        Ok(MallocResult {
            block_ids,
            reuse_length,
        })
    }

    /// Drop one reference from each listed block.
    ///
    /// # Returns
    ///
    /// Number of blocks that became free.
    pub fn free(&self, block_ids: &[usize]) -> usize {
        self.state.lock().pool.free(block_ids)
    }

    /// Commit the full blocks of `token_ids` to the prefix cache.
    pub fn insert_into_cache(&self, token_ids: &[u32], block_ids: &[usize]) -> Result<()> {
        self.state.lock().insert_into_cache(token_ids, block_ids)
    }

    /// Commit the full blocks to the prefix cache, then release the stream's references.
    pub fn free_with_cache(&self, token_ids: &[u32], block_ids: &[usize]) -> Result<usize> {
        let mut state = self.state.lock();
        state.insert_into_cache(token_ids, block_ids)?;
        Ok(state.pool.free(block_ids))
    }

    /// Drop every prefix cache entry and its block references.
    pub fn clear_cache(&self) -> usize {
        let mut state = self.state.lock();
        let blocks = state.cache.clear();
        state.pool.free(&blocks)
    }

    /// Verify pool accounting and that every cached block is still allocated.
    pub fn check_consistency(&self) -> Result<()> {
        let state = self.state.lock();
        state.pool.check_consistency()?;
        if let Some(block_id) = state
            .cache
            .cached_blocks()
            .find(|&id| state.pool.ref_count(id).unwrap_or(0) == 0)
        {
            return Err(Error::InvariantViolation(format!(
                "cached block {block_id} is not allocated"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheDataType;

    fn manager(block_nums: usize, seq_size_per_block: usize) -> CacheManager {
        let config = CacheConfig::new(1, block_nums, 1, 4, seq_size_per_block, CacheDataType::Fp16);
        CacheManager::new(config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_malloc_with_cache_without_reuse() {
        let manager = manager(5, 2);

        let result = manager.malloc_with_cache(&[1, 2, 3], false).unwrap();
        assert_eq!(result.block_ids.len(), 2);
        assert_eq!(result.reuse_length, 0);
        assert_eq!(manager.free_block_nums(), 2);
    }

    #[test]
    fn test_prefix_reuse_shares_blocks() {
        let manager = manager(11, 2);

        let first = manager.malloc_with_cache(&[1, 2, 3, 4, 5], true).unwrap();
        manager.insert_into_cache(&[1, 2, 3, 4, 5], &first.block_ids).unwrap();

        let second = manager.malloc_with_cache(&[1, 2, 3, 4, 9], true).unwrap();
        assert_eq!(second.reuse_length, 4);
        assert_eq!(&second.block_ids[..2], &first.block_ids[..2]);
        assert_ne!(second.block_ids[2], first.block_ids[2]);

        // stream 1 + stream 2 + cache
        assert_eq!(manager.ref_count(first.block_ids[0]), Some(3));
        assert!(manager.check_consistency().is_ok());
    }

    #[test]
    fn test_failed_malloc_rolls_back_matched_refs() {
        let manager = manager(4, 2);

        let first = manager.malloc_with_cache(&[1, 2, 3], true).unwrap();
        manager.insert_into_cache(&[1, 2, 3], &first.block_ids).unwrap();
        assert_eq!(manager.free_block_nums(), 1);

        let err = manager.malloc_with_cache(&[1, 2, 7, 8, 9, 10, 11], true).unwrap_err();
        assert!(err.is_insufficient_memory());
        assert_eq!(manager.ref_count(first.block_ids[0]), Some(2));
        assert_eq!(manager.free_block_nums(), 1);
    }

    #[test]
    fn test_malloc_evicts_cache_only_blocks() {
        let manager = manager(4, 2);

        let blocks = manager.malloc(2).unwrap();
        manager.free_with_cache(&[1, 2, 3, 4], &blocks).unwrap();
        assert_eq!(manager.free_block_nums(), 1);
        assert_eq!(manager.available_block_nums(), 3);

        let fresh = manager.malloc(3).unwrap();
        assert_eq!(fresh.len(), 3);
        assert_eq!(manager.cached_block_nums(), 0);
        assert!(manager.check_consistency().is_ok());
    }

    #[test]
    fn test_malloc_does_not_evict_when_hopeless() {
        let manager = manager(4, 2);

        let blocks = manager.malloc(1).unwrap();
        manager.free_with_cache(&[1, 2], &blocks).unwrap();

        assert!(manager.malloc(4).is_err());
        assert_eq!(manager.cached_block_nums(), 1);
    }

    #[test]
    fn test_block_used_ratio() {
        let manager = manager(5, 2);
        assert_eq!(manager.block_used_ratio(), 0.0);
        manager.malloc(2).unwrap();
        assert_eq!(manager.block_used_ratio(), 0.5);
    }

    #[test]
    fn test_clear_cache() {
        let manager = manager(5, 2);
        let blocks = manager.malloc(2).unwrap();
        manager.free_with_cache(&[1, 2, 3, 4], &blocks).unwrap();
        assert_eq!(manager.free_block_nums(), 2);

        assert_eq!(manager.clear_cache(), 2);
        assert_eq!(manager.free_block_nums(), 4);
    }
}
