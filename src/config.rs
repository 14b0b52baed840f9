//! Configuration types for nano-kvsched.
//!
//! All configs are plain serde structs so a whole [`EngineConfig`] can be
//! loaded from one JSON file.

use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type stored in the KV cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDataType {
    Fp32,
    #[default]
    Fp16,
    Bf16,
}

impl CacheDataType {
    /// The matching tensor dtype.
    pub fn dtype(&self) -> DType {
        match self {
            Self::Fp32 => DType::F32,
            Self::Fp16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }

    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.dtype().size_in_bytes()
    }
}

/// Model shape parameters that determine KV cache geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Number of transformer layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA).
    pub num_key_value_heads: usize,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// KV cache element type.
    pub dtype: CacheDataType,
}

impl Default for ModelConfig {
    fn default() -> Self {
        // TinyLlama-1.1B defaults
        Self {
            hidden_size: 2048,
            num_hidden_layers: 22,
            num_attention_heads: 32,
            num_key_value_heads: 4,
            max_position_embeddings: 2048,
            dtype: CacheDataType::default(),
        }
    }
}

impl ModelConfig {
    /// Head dimension (hidden_size / num_attention_heads).
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Memory budget for the KV cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheMemoryConfig {
    /// Tokens stored per block.
    pub seq_size_per_block: usize,
    /// Explicit KV cache budget in MiB. When unset the budget is the free
    /// device memory minus `reserve_runtime_mem_mb`.
    pub kv_cache_mem_mb: Option<usize>,
    /// Memory kept back for activations and runtime buffers, in MiB.
    pub reserve_runtime_mem_mb: usize,
}

impl Default for CacheMemoryConfig {
    fn default() -> Self {
        Self {
            seq_size_per_block: 8,
            kv_cache_mem_mb: None,
            reserve_runtime_mem_mb: 1024,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Stop a head-of-queue request that can never be served instead of
    /// blocking the queue behind it.
    pub enable_fallback: bool,
    /// Longest accepted input, in tokens.
    pub max_seq_len: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enable_fallback: false,
            max_seq_len: 8192,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: ModelConfig,
    pub cache: CacheMemoryConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Parse a config from a JSON string. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Reject configs that cannot produce a usable cache.
    pub fn validate(&self) -> Result<()> {
        if self.cache.seq_size_per_block == 0 {
            return Err(Error::Config("seq_size_per_block must be positive".into()));
        }
        if self.model.num_attention_heads == 0 || self.model.num_key_value_heads == 0 {
            return Err(Error::Config("head counts must be positive".into()));
        }
        if self.model.num_hidden_layers == 0 {
            return Err(Error::Config("num_hidden_layers must be positive".into()));
        }
        if self.scheduler.max_seq_len == 0 {
            return Err(Error::Config("max_seq_len must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.head_dim(), 64);
        assert_eq!(config.model.dtype, CacheDataType::Fp16);
        assert!(!config.scheduler.enable_fallback);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"scheduler": {"enable_fallback": true}, "model": {"dtype": "bf16"}}"#,
        )
        .unwrap();

        assert!(config.scheduler.enable_fallback);
        assert_eq!(config.scheduler.max_seq_len, 8192);
        assert_eq!(config.model.dtype, CacheDataType::Bf16);
        assert_eq!(config.cache.seq_size_per_block, 8);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let result = EngineConfig::from_json_str(r#"{"cache": {"seq_size_per_block": 0}}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(CacheDataType::Fp32.size_in_bytes(), 4);
        assert_eq!(CacheDataType::Fp16.size_in_bytes(), 2);
        assert_eq!(CacheDataType::Bf16.size_in_bytes(), 2);
    }
}
