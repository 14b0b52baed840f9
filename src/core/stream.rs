//! Generation stream tracking.
//!
//! A stream is one request's mutable runtime state: its tokens, the cache
//! blocks it depends on, and where it is in its lifecycle.
//!
//! ```text
//! Waiting ──► Running ──► Finished   (generation completed)
//!    │           │
//!    └───────────┴──────► Stopped    (forced: memory, timeout, error)
//! ```
//!
//! Streams are shared between the submitter, the scheduler and the compute
//! executor, so all state sits behind an internal mutex and every method
//! takes `&self`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::core::block::{compute_num_blocks, BlockTable};
use crate::core::cache_manager::MallocResult;
use crate::error::{Error, Result};

/// Unique identifier for a stream.
pub type StreamId = u64;

/// Shared handle to a stream.
pub type GenerateStreamRef = Arc<GenerateStream>;

/// Status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    /// Queued, holds no blocks.
    Waiting,
    /// Admitted, holds blocks.
    Running,
    /// Generation completed normally.
    Finished,
    /// Terminated by the scheduler or the caller.
    Stopped,
}

impl StreamStatus {
    /// Finished and stopped are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Stopped)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Stopped => "Stopped",
        }
    }
}

/// Per-request generation settings.
#[derive(Debug, Clone, Default)]
pub struct GenerateConfig {
    /// Tokens to generate before finishing (0 = unbounded).
    pub max_new_tokens: usize,
    /// Give up on the request after this long (0 = never).
    pub timeout_ms: u64,
}

/// A request as submitted.
#[derive(Debug, Clone, Default)]
pub struct GenerateInput {
    pub input_ids: Vec<u32>,
    pub generate_config: GenerateConfig,
}

impl GenerateInput {
    pub fn new(input_ids: Vec<u32>) -> Self {
        Self {
            input_ids,
            generate_config: GenerateConfig::default(),
        }
    }
}

#[derive(Debug)]
struct StreamState {
    output_ids: Vec<u32>,
    seq_length: usize,
    block_table: BlockTable,
    reuse_length: usize,
    committed_blocks: usize,
    status: StreamStatus,
    stop_reason: String,
    reuse_cache: bool,
    enqueue_time: Instant,
}

/// One generation request's runtime state.
///
/// # Example
///
/// ```
/// use nano_kvsched::core::stream::{GenerateInput, GenerateStream, StreamStatus};
///
/// let stream = GenerateStream::new(1, GenerateInput::new(vec![1, 2, 3, 4]));
/// assert_eq!(stream.status(), StreamStatus::Waiting);
/// assert_eq!(stream.seq_length(), 4);
///
/// stream.append_token(5);
/// assert_eq!(stream.seq_length(), 5);
/// assert_eq!(stream.output_token_ids(), vec![5]);
/// ```
#[derive(Debug)]
pub struct GenerateStream {
    stream_id: StreamId,
    input: GenerateInput,
    state: Mutex<StreamState>,
}

impl GenerateStream {
    pub fn new(stream_id: StreamId, input: GenerateInput) -> Self {
        let seq_length = input.input_ids.len();
        Self {
            stream_id,
            input,
            state: Mutex::new(StreamState {
                output_ids: Vec::new(),
                seq_length,
                block_table: BlockTable::default(),
                reuse_length: 0,
                committed_blocks: 0,
                status: StreamStatus::Waiting,
                stop_reason: String::new(),
                reuse_cache: false,
                enqueue_time: Instant::now(),
            }),
        }
    }

    // ========== Getters ==========

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn input_ids(&self) -> &[u32] {
        &self.input.input_ids
    }

    pub fn input_length(&self) -> usize {
        self.input.input_ids.len()
    }

    pub fn generate_config(&self) -> &GenerateConfig {
        &self.input.generate_config
    }

    /// Current token count, advanced by the generation loop.
    pub fn seq_length(&self) -> usize {
        self.state.lock().seq_length
    }

    pub fn output_token_ids(&self) -> Vec<u32> {
        self.state.lock().output_ids.clone()
    }

    pub fn output_length(&self) -> usize {
        self.state.lock().output_ids.len()
    }

    /// Input followed by generated tokens.
    pub fn token_ids(&self) -> Vec<u32> {
        let state = self.state.lock();
        let mut tokens = self.input.input_ids.clone();
        tokens.extend(&state.output_ids);
        tokens
    }

    pub fn status(&self) -> StreamStatus {
        self.state.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn finished(&self) -> bool {
        self.status() == StreamStatus::Finished
    }

    pub fn stopped(&self) -> bool {
        self.status() == StreamStatus::Stopped
    }

    /// Why the stream was stopped; empty unless stopped.
    pub fn stop_reason(&self) -> String {
        self.state.lock().stop_reason.clone()
    }

    pub fn reuse_cache(&self) -> bool {
        self.state.lock().reuse_cache
    }

    /// Leading tokens whose KV states came from the prefix cache.
    pub fn reuse_length(&self) -> usize {
        self.state.lock().reuse_length
    }

    /// Physical blocks this stream depends on, in logical order.
    pub fn block_ids(&self) -> Vec<usize> {
        self.state
            .lock()
            .block_table
            .get_physical_block_ids()
            .to_vec()
    }

    pub fn block_num(&self) -> usize {
        self.state.lock().block_table.num_blocks()
    }

    /// Global cache slot of every token up to `seq_length`.
    pub fn slot_mapping(&self) -> Vec<usize> {
        let state = self.state.lock();
        state.block_table.get_slot_mapping(state.seq_length)
    }

    /// Additional blocks needed to cover `seq_length`.
    pub fn needed_block_nums(&self, seq_size_per_block: usize) -> usize {
        let state = self.state.lock();
        compute_num_blocks(state.seq_length, seq_size_per_block)
            .saturating_sub(state.block_table.num_blocks())
    }

    /// Time since the stream was queued.
    pub fn wait_time(&self) -> Duration {
        self.state.lock().enqueue_time.elapsed()
    }

    // ========== Generation loop ==========

    /// Append a generated token.
    pub fn append_token(&self, token_id: u32) {
        let mut state = self.state.lock();
        state.output_ids.push(token_id);
        state.seq_length += 1;
    }

    /// Set the token count directly.
    pub fn set_seq_length(&self, seq_length: usize) {
        self.state.lock().seq_length = seq_length;
    }

    pub fn set_reuse_cache(&self, reuse_cache: bool) {
        self.state.lock().reuse_cache = reuse_cache;
    }

    // ========== State transitions ==========

    /// Mark generation as complete. No effect on a terminal stream.
    pub fn set_finished(&self) {
        let mut state = self.state.lock();
        if !state.status.is_terminal() {
            state.status = StreamStatus::Finished;
        }
    }

    /// Force-terminate the stream. The first stop reason wins; no effect on a
    /// terminal stream.
    pub fn set_stopped(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.status = StreamStatus::Stopped;
        state.stop_reason = reason.into();
        warn!(
            stream_id = self.stream_id,
            reason = %state.stop_reason,
            "stream stopped"
        );
    }

    /// Stop the stream if it has outlived its `timeout_ms`.
    ///
    /// # Returns
    ///
    /// `true` if this call stopped the stream.
    pub fn check_timeout(&self) -> bool {
        let timeout_ms = self.input.generate_config.timeout_ms;
        if timeout_ms == 0 || self.is_terminal() {
            return false;
        }
        let elapsed_ms = self.wait_time().as_millis();
        if elapsed_ms <= u128::from(timeout_ms) {
            return false;
        }
        self.set_stopped(format!("timeout: {elapsed_ms} ms exceeds {timeout_ms} ms"));
        true
    }

    // ========== Scheduler hooks ==========

    pub(crate) fn mark_enqueued(&self) {
        self.state.lock().enqueue_time = Instant::now();
    }

    /// Move from waiting to running with the blocks just allocated.
    pub(crate) fn set_running(&self, blocks: &MallocResult, seq_size_per_block: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != StreamStatus::Waiting {
            return Err(Error::InvalidStateTransition {
                from: state.status.as_str(),
                to: "Running",
            });
        }
        let mut block_table = BlockTable::new(seq_size_per_block);
        block_table.extend(blocks.block_ids.iter().copied());

        state.block_table = block_table;
        state.reuse_length = blocks.reuse_length;
        state.committed_blocks = blocks.reuse_length / seq_size_per_block;
        state.status = StreamStatus::Running;
        Ok(())
    }

    /// Move from running back to waiting, handing back every block held.
    ///
    /// Generated tokens and `seq_length` are kept so the stream resumes where
    /// it left off once readmitted.
    pub(crate) fn set_waiting(&self) -> Result<Vec<usize>> {
        let mut state = self.state.lock();
        if state.status != StreamStatus::Running {
            return Err(Error::InvalidStateTransition {
                from: state.status.as_str(),
                to: "Waiting",
            });
        }
        let block_ids = std::mem::take(&mut state.block_table).take();
        state.reuse_length = 0;
        state.committed_blocks = 0;
        state.status = StreamStatus::Waiting;
        Ok(block_ids)
    }

    pub(crate) fn append_blocks(&self, block_ids: Vec<usize>) {
        self.state.lock().block_table.extend(block_ids);
    }

    /// Move the block list out; a second call returns nothing.
    pub(crate) fn take_block_ids(&self) -> Vec<usize> {
        self.state.lock().block_table.take()
    }

    /// Tokens and blocks of the full blocks covered by `seq_length`.
    pub(crate) fn full_block_prefix(&self) -> (Vec<u32>, Vec<usize>) {
        let state = self.state.lock();
        let seq_size_per_block = state.block_table.seq_size_per_block();
        if seq_size_per_block == 0 {
            return (Vec::new(), Vec::new());
        }

        let known = state
            .seq_length
            .min(self.input.input_ids.len() + state.output_ids.len());
        let full_blocks = (known / seq_size_per_block).min(state.block_table.num_blocks());
        let token_len = full_blocks * seq_size_per_block;

        let tokens = self
            .input
            .input_ids
            .iter()
            .chain(&state.output_ids)
            .take(token_len)
            .copied()
            .collect();
        let blocks = state.block_table.get_physical_block_ids()[..full_blocks].to_vec();
        (tokens, blocks)
    }

    pub(crate) fn committed_blocks(&self) -> usize {
        self.state.lock().committed_blocks
    }

    pub(crate) fn set_committed_blocks(&self, committed_blocks: usize) {
        self.state.lock().committed_blocks = committed_blocks;
    }
}
