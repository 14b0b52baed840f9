//! nano-kvsched: request admission and KV cache block management for LLM inference.
//!
//! This crate implements the scheduling core of an inference server:
//! - A bounded pool of reference-counted KV cache blocks
//! - Prefix caching so requests sharing a prompt prefix share blocks
//! - Strict FIFO admission with optional fallback for hopeless requests
//! - A tick loop handing each running batch to a compute executor

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{CacheDataType, CacheMemoryConfig, EngineConfig, ModelConfig, SchedulerConfig};
pub use crate::core::{
    CacheConfig, CacheConfigCreator, CacheManager, GenerateConfig, GenerateInput, GenerateStream,
    GenerateStreamRef, StreamStatus,
};
pub use engine::{DecoderEngine, EngineStats, Executor, SyntheticExecutor};
pub use error::{Error, Result};
pub use scheduler::{FifoScheduler, Scheduler};
