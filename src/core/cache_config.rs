//! KV cache geometry and its derivation from a memory budget.

use tracing::info;

use crate::config::{CacheDataType, CacheMemoryConfig, ModelConfig};
use crate::error::{Error, Result};

const MIB: usize = 1024 * 1024;

/// Block geometry of the KV cache. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of transformer layers.
    pub layer_num: usize,
    /// Number of blocks in the pool, including the reserved one.
    pub block_nums: usize,
    /// KV heads held on this device.
    pub local_head_num_kv: usize,
    /// Dimension per head.
    pub size_per_head: usize,
    /// Tokens per block.
    pub seq_size_per_block: usize,
    /// Element type.
    pub dtype: CacheDataType,
}

impl CacheConfig {
    pub fn new(
        layer_num: usize,
        block_nums: usize,
        local_head_num_kv: usize,
        size_per_head: usize,
        seq_size_per_block: usize,
        dtype: CacheDataType,
    ) -> Self {
        Self {
            layer_num,
            block_nums,
            local_head_num_kv,
            size_per_head,
            seq_size_per_block,
            dtype,
        }
    }

    /// Bytes of K (or V) for one block in one layer.
    pub fn kv_block_stride_bytes(&self) -> usize {
        self.local_head_num_kv * self.size_per_head * self.seq_size_per_block * self.dtype.size_in_bytes()
    }

    /// Bytes one block occupies across all layers, K and V.
    pub fn block_size_bytes(&self) -> usize {
        self.kv_block_stride_bytes() * self.layer_num * 2
    }

    /// Bytes of the whole pool.
    pub fn total_size_bytes(&self) -> usize {
        self.block_size_bytes() * self.block_nums
    }
}

/// Derives a [`CacheConfig`] from model shape and available memory.
pub struct CacheConfigCreator;

impl CacheConfigCreator {
    /// Build the cache config for `model` within the memory budget.
    ///
    /// The budget is `cache.kv_cache_mem_mb` when set, otherwise
    /// `device_free_bytes` minus `cache.reserve_runtime_mem_mb`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the budget is empty or holds fewer than two
    /// blocks (one reserved plus one usable).
    pub fn create_config(
        model: &ModelConfig,
        cache: &CacheMemoryConfig,
        device_free_bytes: usize,
    ) -> Result<CacheConfig> {
        let mut config = Self::create_basic_config(model, cache)?;
        let budget = Self::kv_cache_memory_size(cache, device_free_bytes)?;

        let block_size = config.block_size_bytes();
        config.block_nums = budget / block_size;
        if config.block_nums < 2 {
            return Err(Error::Config(format!(
                "kv cache budget of {budget} bytes holds {} blocks of {block_size} bytes, need at least 2",
                config.block_nums
            )));
        }

        info!(
            block_nums = config.block_nums,
            block_size_bytes = block_size,
            budget_bytes = budget,
            seq_size_per_block = config.seq_size_per_block,
            "derived kv cache config"
        );
        Ok(config)
    }

    fn create_basic_config(model: &ModelConfig, cache: &CacheMemoryConfig) -> Result<CacheConfig> {
        if cache.seq_size_per_block == 0 {
            return Err(Error::Config("seq_size_per_block must be positive".into()));
        }
        if model.num_attention_heads == 0 || model.head_dim() == 0 {
            return Err(Error::Config("model has no attention heads".into()));
        }

        Ok(CacheConfig::new(
            model.num_hidden_layers,
            0,
            model.num_key_value_heads,
            model.head_dim(),
            cache.seq_size_per_block,
            model.dtype,
        ))
    }

    fn kv_cache_memory_size(cache: &CacheMemoryConfig, device_free_bytes: usize) -> Result<usize> {
        if let Some(mb) = cache.kv_cache_mem_mb {
            return Ok(mb * MIB);
        }

        let reserve = cache.reserve_runtime_mem_mb * MIB;
        if device_free_bytes <= reserve {
            return Err(Error::Config(format!(
                "device free memory {device_free_bytes} bytes does not exceed runtime reserve {reserve} bytes"
            )));
        }
        Ok(device_free_bytes - reserve)
    }
}
