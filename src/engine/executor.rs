//! Compute executor seam.
//!
//! The engine hands each tick's running batch to an [`Executor`], which runs
//! the model over it, appends generated tokens and marks streams finished.
//! Model math lives behind this trait; the scheduler never sees it.

use crate::core::stream::{GenerateStream, GenerateStreamRef};
use crate::error::Result;

/// Runs one generation step over a batch of streams.
pub trait Executor: Send + Sync {
    /// Process every stream in `streams`.
    ///
    /// Implementations append tokens (or advance `seq_length`) and call
    /// `set_finished()` on streams that are done.
    ///
    /// # Errors
    ///
    /// Any error fails the whole batch; the engine stops every stream in it.
    fn process(&self, streams: &[GenerateStreamRef]) -> Result<()>;
}

/// Deterministic token generator standing in for a model.
///
/// Each step appends one token derived from the stream id and position, and
/// finishes a stream after `max_new_tokens` or on `eos_token_id`.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use nano_kvsched::core::stream::{GenerateInput, GenerateStream};
/// use nano_kvsched::engine::{Executor, SyntheticExecutor};
///
/// let mut input = GenerateInput::new(vec![1, 2, 3]);
/// input.generate_config.max_new_tokens = 2;
/// let stream = Arc::new(GenerateStream::new(1, input));
///
/// let executor = SyntheticExecutor::new(32000);
/// executor.process(&[stream.clone()]).unwrap();
/// executor.process(&[stream.clone()]).unwrap();
///
/// assert_eq!(stream.output_length(), 2);
/// assert!(stream.finished());
/// ```
#[derive(Debug, Clone)]
pub struct SyntheticExecutor {
    vocab_size: u32,
    eos_token_id: Option<u32>,
}

impl SyntheticExecutor {
    pub fn new(vocab_size: u32) -> Self {
        Self {
            vocab_size: vocab_size.max(1),
            eos_token_id: None,
        }
    }

    /// Finish streams as soon as they produce `eos_token_id`.
    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    /// Token produced for `stream` at its current position.
    pub fn next_token(&self, stream: &GenerateStream) -> u32 {
        let position = stream.seq_length() as u64;
        let mixed = stream
            .stream_id()
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(position.wrapping_mul(31));
        (mixed % u64::from(self.vocab_size)) as u32
    }

    fn step(&self, stream: &GenerateStream) {
        let token = self.next_token(stream);
        stream.append_token(token);

        let max_new_tokens = stream.generate_config().max_new_tokens;
        let hit_limit = max_new_tokens > 0 && stream.output_length() >= max_new_tokens;
        if hit_limit || self.eos_token_id == Some(token) {
            stream.set_finished();
        }
    }
}

impl Executor for SyntheticExecutor {
    fn process(&self, streams: &[GenerateStreamRef]) -> Result<()> {
        for stream in streams {
            if stream.is_terminal() {
                continue;
            }
            self.step(stream);
        }
        Ok(())
    }
}
