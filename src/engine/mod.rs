//! Inference engine.
//!
//! This module contains:
//! - Executor, the seam to the model's compute
//! - DecoderEngine for driving scheduling ticks

pub mod decoder;
pub mod executor;

pub use decoder::{DecoderEngine, EngineStats};
pub use executor::{Executor, SyntheticExecutor};
