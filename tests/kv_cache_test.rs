//! Integration tests for KvCacheBuffer.

use candle_core::{DType, Device};
use nano_kvsched::config::CacheDataType;
use nano_kvsched::core::cache_config::CacheConfig;
use nano_kvsched::core::kv_cache::KvCacheBuffer;

#[test]
fn test_buffer_follows_dtype() {
    let config = CacheConfig::new(2, 6, 1, 8, 4, CacheDataType::Bf16);
    let buffer = KvCacheBuffer::new(&config, &Device::Cpu).unwrap();

    assert_eq!(buffer.key_blocks().dtype(), DType::BF16);
    assert_eq!(buffer.total_size_bytes(), config.total_size_bytes());
    assert!(buffer.device().is_cpu());
}

#[test]
fn test_block_views() {
    let config = CacheConfig::new(2, 6, 1, 8, 4, CacheDataType::Fp32);
    let buffer = KvCacheBuffer::new(&config, &Device::Cpu).unwrap();

    assert_eq!(buffer.block_keys(1, 5).unwrap().dims(), &[1, 4, 8]);
    assert_eq!(buffer.block_values(0, 0).unwrap().dims(), &[1, 4, 8]);
    assert!(buffer.block_keys(0, 6).is_err());
    assert!(buffer.block_values(2, 0).is_err());
}

#[test]
fn test_copy_block_copies_values_too() {
    let config = CacheConfig::new(1, 4, 1, 2, 2, CacheDataType::Fp32);
    let mut buffer = KvCacheBuffer::new(&config, &Device::Cpu).unwrap();

    // Untouched zeros copy as zeros
    buffer.copy_block(1, 3).unwrap();
    let sum: f32 = buffer
        .gather_values(0, &[1, 3])
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert_eq!(sum, 0.0);

    assert!(buffer.copy_block(1, 4).is_err());
}
