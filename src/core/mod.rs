//! Core infrastructure for KV cache management.
//!
//! This module contains the fundamental building blocks:
//! - Block and BlockTable for paged storage
//! - BlockPool for reference-counted allocation
//! - BlockCache for prefix reuse
//! - CacheManager tying pool, prefix cache and block memory together
//! - GenerateStream for request tracking

pub mod block;
pub mod block_cache;
pub mod block_pool;
pub mod cache_config;
pub mod cache_manager;
pub mod kv_cache;
pub mod stream;

pub use block::{compute_num_blocks, BlockTable};
pub use cache_config::{CacheConfig, CacheConfigCreator};
pub use cache_manager::{CacheManager, MallocResult};
pub use kv_cache::KvCacheBuffer;
pub use stream::{GenerateConfig, GenerateInput, GenerateStream, GenerateStreamRef, StreamStatus};
