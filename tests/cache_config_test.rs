//! Integration tests for CacheConfig and CacheConfigCreator.

use nano_kvsched::config::{CacheDataType, CacheMemoryConfig, ModelConfig};
use nano_kvsched::core::cache_config::{CacheConfig, CacheConfigCreator};

#[test]
fn test_block_size_accounts_for_layers_and_dtype() {
    let fp16 = CacheConfig::new(4, 10, 2, 64, 16, CacheDataType::Fp16);
    let fp32 = CacheConfig::new(4, 10, 2, 64, 16, CacheDataType::Fp32);

    assert_eq!(fp16.kv_block_stride_bytes(), 2 * 64 * 16 * 2);
    assert_eq!(fp16.block_size_bytes(), fp16.kv_block_stride_bytes() * 4 * 2);
    assert_eq!(fp32.block_size_bytes(), fp16.block_size_bytes() * 2);
    assert_eq!(fp16.total_size_bytes(), fp16.block_size_bytes() * 10);
}

#[test]
fn test_create_config_for_default_model() {
    let model = ModelConfig::default();
    let cache = CacheMemoryConfig {
        kv_cache_mem_mb: Some(64),
        ..Default::default()
    };

    let config = CacheConfigCreator::create_config(&model, &cache, 0).unwrap();
    assert_eq!(config.layer_num, model.num_hidden_layers);
    assert_eq!(config.local_head_num_kv, model.num_key_value_heads);
    assert_eq!(config.size_per_head, model.head_dim());
    assert_eq!(config.seq_size_per_block, 8);
    assert!(config.block_nums >= 2);
    assert!(config.total_size_bytes() <= 64 * 1024 * 1024);
}

#[test]
fn test_create_config_rejects_bad_shapes() {
    let model = ModelConfig {
        num_attention_heads: 0,
        ..Default::default()
    };
    let cache = CacheMemoryConfig {
        kv_cache_mem_mb: Some(64),
        ..Default::default()
    };
    assert!(CacheConfigCreator::create_config(&model, &cache, 0).is_err());

    let cache = CacheMemoryConfig {
        seq_size_per_block: 0,
        kv_cache_mem_mb: Some(64),
        ..Default::default()
    };
    assert!(CacheConfigCreator::create_config(&ModelConfig::default(), &cache, 0).is_err());
}
