//! Typed block memory backing the KV cache.
//!
//! One pool-sized allocation each for keys and values, sliced into
//! `block_nums` fixed blocks along dimension 1.
//!
//! ## Memory Layout
//!
//! `[layer_num, block_nums, local_head_num_kv, seq_size_per_block, size_per_head]`
//!
//! For a 2-layer model with 2 KV heads of dim 64, 16 tokens per block and
//! 1024 blocks:
//! - Key cache: `[2, 1024, 2, 16, 64]`
//! - Value cache: `[2, 1024, 2, 16, 64]`

use candle_core::{Device, Tensor};

use crate::core::cache_config::CacheConfig;
use crate::error::{Error, Result};

/// Key and value block storage for all layers.
#[derive(Debug)]
pub struct KvCacheBuffer {
    key_blocks: Tensor,
    value_blocks: Tensor,
    config: CacheConfig,
}

impl KvCacheBuffer {
    /// Allocate zero-filled key and value storage on `device`.
    pub fn new(config: &CacheConfig, device: &Device) -> Result<Self> {
        let shape = (
            config.layer_num,
            config.block_nums,
            config.local_head_num_kv,
            config.seq_size_per_block,
            config.size_per_head,
        );
        let dtype = config.dtype.dtype();

        let key_blocks = Tensor::zeros(shape, dtype, device)?;
        let value_blocks = Tensor::zeros(shape, dtype, device)?;

        Ok(Self {
            key_blocks,
            value_blocks,
            config: config.clone(),
        })
    }

    pub fn key_blocks(&self) -> &Tensor {
        &self.key_blocks
    }

    pub fn value_blocks(&self) -> &Tensor {
        &self.value_blocks
    }

    pub fn device(&self) -> &Device {
        self.key_blocks.device()
    }

    /// Bytes held by both tensors.
    pub fn total_size_bytes(&self) -> usize {
        let elements = self.key_blocks.elem_count() + self.value_blocks.elem_count();
        elements * self.key_blocks.dtype().size_in_bytes()
    }

    /// Keys of one block in one layer: `[local_head_num_kv, seq_size_per_block, size_per_head]`.
    pub fn block_keys(&self, layer: usize, block_id: usize) -> Result<Tensor> {
        self.validate(layer, &[block_id])?;
        Ok(self.key_blocks.get(layer)?.get(block_id)?)
    }

    /// Values of one block in one layer.
    pub fn block_values(&self, layer: usize, block_id: usize) -> Result<Tensor> {
        self.validate(layer, &[block_id])?;
        Ok(self.value_blocks.get(layer)?.get(block_id)?)
    }

    /// Gather the keys of several blocks in one layer.
    ///
    /// # Returns
    ///
    /// Tensor of shape `[block_ids.len(), local_head_num_kv, seq_size_per_block, size_per_head]`
    pub fn gather_keys(&self, layer: usize, block_ids: &[usize]) -> Result<Tensor> {
        self.gather(&self.key_blocks, layer, block_ids)
    }

    /// Gather the values of several blocks in one layer.
    pub fn gather_values(&self, layer: usize, block_ids: &[usize]) -> Result<Tensor> {
        self.gather(&self.value_blocks, layer, block_ids)
    }

    /// Copy block `src` over block `dst` in every layer, keys and values.
    pub fn copy_block(&mut self, src: usize, dst: usize) -> Result<()> {
        self.validate(0, &[src, dst])?;

        let keys = self.key_blocks.narrow(1, src, 1)?;
        self.key_blocks = self.key_blocks.slice_scatter(&keys, 1, dst)?;

        let values = self.value_blocks.narrow(1, src, 1)?;
        self.value_blocks = self.value_blocks.slice_scatter(&values, 1, dst)?;

        Ok(())
    }

    fn gather(&self, blocks: &Tensor, layer: usize, block_ids: &[usize]) -> Result<Tensor> {
        if block_ids.is_empty() {
            return Err(Error::InvalidInput("block_ids cannot be empty".into()));
        }
        self.validate(layer, block_ids)?;

        let indices: Vec<u32> = block_ids.iter().map(|&id| id as u32).collect();
        let index_tensor = Tensor::new(indices, blocks.device())?;
        Ok(blocks.get(layer)?.index_select(&index_tensor, 0)?)
    }

    fn validate(&self, layer: usize, block_ids: &[usize]) -> Result<()> {
        if layer >= self.config.layer_num {
            return Err(Error::InvalidInput(format!(
                "layer {} out of bounds (max {})",
                layer, self.config.layer_num
            )));
        }
        if let Some(&bad) = block_ids.iter().find(|&&id| id >= self.config.block_nums) {
            return Err(Error::InvalidInput(format!(
                "block_id {} out of bounds (max {})",
                bad, self.config.block_nums
            )));
        }
        Ok(())
    }
}
