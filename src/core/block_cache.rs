//! Content-addressed cache of committed block chains.
//!
//! Each entry maps the chained hash of one full block of tokens to the
//! physical block holding its KV states. Entries keep the block's tokens so a
//! lookup only matches on exact token equality, never on hash alone.
//!
//! The cache does not touch reference counts itself: the
//! [`CacheManager`](super::cache_manager::CacheManager) takes one pool
//! reference for every block this cache reports as newly committed, and
//! drops it when the entry is evicted.

use std::collections::{BTreeMap, HashMap};

use crate::core::block::hash_token_block;

#[derive(Debug, Clone)]
struct CacheItem {
    block_id: usize,
    tokens: Vec<u32>,
    last_used: u64,
}

/// LRU map from token-prefix chains to physical blocks.
#[derive(Debug)]
pub struct BlockCache {
    seq_size_per_block: usize,
    items: HashMap<u64, CacheItem>,
    /// last_used tick -> chain hash, oldest first.
    lru: BTreeMap<u64, u64>,
    tick: u64,
}

impl BlockCache {
    pub fn new(seq_size_per_block: usize) -> Self {
        Self {
            seq_size_per_block,
            items: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
        }
    }

    /// Number of committed blocks.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Physical blocks held by the cache, in no particular order.
    pub fn cached_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.items.values().map(|item| item.block_id)
    }

    /// Find the longest chain of cached full blocks equal to a prefix of `tokens`.
    ///
    /// At most `(tokens.len() - 1) / seq_size_per_block` blocks match, so the
    /// caller always has at least one token left to compute. Matched entries
    /// are marked as recently used.
    pub fn match_prefix(&mut self, tokens: &[u32]) -> Vec<usize> {
        let max_blocks = tokens.len().saturating_sub(1) / self.seq_size_per_block;
        let mut matched = Vec::new();
        let mut parent = None;

        for chunk in tokens.chunks_exact(self.seq_size_per_block).take(max_blocks) {
            let hash = hash_token_block(chunk, parent);
            let block_id = match self.items.get(&hash) {
                Some(item) if item.tokens == chunk => item.block_id,
                _ => break,
            };
            self.touch(hash);
            matched.push(block_id);
            parent = Some(hash);
        }

        matched
    }

    /// Commit the full blocks of `tokens`, stored in `block_ids`, to the cache.
    ///
    /// Chains already present are refreshed and keep their original block.
    ///
    /// # Returns
    ///
    /// Blocks newly held by the cache; the caller must add one pool
    /// reference to each.
    pub fn insert(&mut self, tokens: &[u32], block_ids: &[usize]) -> Vec<usize> {
        let mut committed = Vec::new();
        let mut parent = None;

        for (chunk, &block_id) in tokens
            .chunks_exact(self.seq_size_per_block)
            .zip(block_ids)
        {
            let hash = hash_token_block(chunk, parent);
            parent = Some(hash);

            match self.items.get(&hash) {
                Some(item) if item.tokens == chunk => {
                    self.touch(hash);
                }
                // Hash collision with different tokens: leave the older chain.
                Some(_) => break,
                None => {
                    let last_used = self.next_tick();
                    self.items.insert(
                        hash,
                        CacheItem {
                            block_id,
                            tokens: chunk.to_vec(),
                            last_used,
                        },
                    );
                    self.lru.insert(last_used, hash);
                    committed.push(block_id);
                }
            }
        }

        committed
    }

    /// Remove the least recently used entry whose block satisfies `evictable`.
    ///
    /// # Returns
    ///
    /// The block released by the cache, or `None` if no entry qualifies.
    pub fn pop_lru(&mut self, evictable: impl Fn(usize) -> bool) -> Option<usize> {
        let (tick, hash) = self
            .lru
            .iter()
            .map(|(&tick, &hash)| (tick, hash))
            .find(|(_, hash)| evictable(self.items[hash].block_id))?;

        self.lru.remove(&tick);
        self.items.remove(&hash).map(|item| item.block_id)
    }

    /// Drop every entry.
    ///
    /// # Returns
    ///
    /// The blocks the cache held.
    pub fn clear(&mut self) -> Vec<usize> {
        self.lru.clear();
        self.items.drain().map(|(_, item)| item.block_id).collect()
    }

    fn touch(&mut self, hash: u64) {
        let tick = self.next_tick();
        if let Some(item) = self.items.get_mut(&hash) {
            self.lru.remove(&item.last_used);
            item.last_used = tick;
            self.lru.insert(tick, hash);
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}
