//! First-in first-out scheduler.
//!
//! Streams are admitted strictly in enqueue order: a head that does not fit
//! blocks everything behind it, even smaller requests that would.
//!
//! ## Scheduling Flow
//!
//! ```text
//!   enqueue()                                         schedule()
//!      │                                                  │
//!      ▼                                                  ▼
//!  ┌─────────┐   admission (head fits)             ┌─────────────┐
//!  │ Waiting │ ──────────────────────────────────► │   Running   │
//!  │  Queue  │                                     │    List     │
//!  └─────────┘                                     └─────────────┘
//!      │                                                  │
//!      │ ▲                                                │
//!      │ └──────────── preempted (pool short) ────────────┤
//!      │ timeout / fallback            finished / stopped / cannot grow
//!      ▼                                                  ▼
//!   dropped                                     blocks released to the pool
//! ```
//!
//! Each tick runs, in order:
//! 1. Drop waiting streams that timed out or were terminated by the caller.
//! 2. Grow every running stream to cover its `seq_length`. When the pool is
//!    short the newest running stream goes back to the head of the waiting
//!    queue, freeing its blocks; a stream running alone that still cannot
//!    grow is stopped and its blocks are reclaimed at once.
//! 3. Release the blocks of finished and stopped running streams.
//! 4. Admit waiting streams from the head while their blocks fit.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use candle_core::Device;
//! use nano_kvsched::config::{CacheDataType, SchedulerConfig};
//! use nano_kvsched::core::cache_config::CacheConfig;
//! use nano_kvsched::core::cache_manager::CacheManager;
//! use nano_kvsched::core::stream::{GenerateInput, GenerateStream};
//! use nano_kvsched::scheduler::{FifoScheduler, Scheduler};
//!
//! let config = CacheConfig::new(1, 4, 1, 4, 8, CacheDataType::Fp16);
//! let cache_manager = Arc::new(CacheManager::new(config, &Device::Cpu).unwrap());
//! let mut scheduler = FifoScheduler::new(SchedulerConfig::default(), cache_manager.clone());
//!
//! let stream = Arc::new(GenerateStream::new(1, GenerateInput::new(vec![1])));
//! scheduler.enqueue(stream.clone()).unwrap();
//!
//! let running = scheduler.schedule().unwrap();
//! assert_eq!(running.len(), 1);
//! assert_eq!(cache_manager.free_block_nums(), 2);
//!
//! stream.set_finished();
//! assert!(scheduler.schedule().unwrap().is_empty());
//! assert_eq!(cache_manager.free_block_nums(), 3);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::core::block::compute_num_blocks;
use crate::core::cache_manager::{CacheManager, MallocResult};
use crate::core::stream::{GenerateStream, GenerateStreamRef, StreamStatus};
use crate::error::{Error, Result};
use crate::scheduler::{Scheduler, STOP_REASON_NO_MEMORY};

/// Strict FIFO scheduler over a shared [`CacheManager`].
pub struct FifoScheduler {
    config: SchedulerConfig,
    cache_manager: Arc<CacheManager>,
    waiting_streams: VecDeque<GenerateStreamRef>,
    running_streams: Vec<GenerateStreamRef>,
}

impl FifoScheduler {
    /// Create a scheduler allocating from `cache_manager`.
    ///
    /// # Arguments
    ///
    /// * `config` - Admission settings; `enable_fallback` stops hopeless
    ///   head-of-queue streams instead of letting them block the queue
    /// * `cache_manager` - Block owner shared with the compute engine
    pub fn new(config: SchedulerConfig, cache_manager: Arc<CacheManager>) -> Self {
        Self {
            config,
            cache_manager,
            waiting_streams: VecDeque::new(),
            running_streams: Vec::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    /// Whether any stream is still waiting or running.
    pub fn has_unfinished_streams(&self) -> bool {
        !self.waiting_streams.is_empty() || !self.running_streams.is_empty()
    }

    /// Drop waiting streams that timed out or were terminated while queued.
    fn sweep_waiting_streams(&mut self) {
        self.waiting_streams.retain(|stream| {
            stream.check_timeout();
            if stream.is_terminal() {
                debug!(stream_id = stream.stream_id(), "dropped waiting stream");
                return false;
            }
            true
        });
    }

    /// Grow running streams to cover their current length.
    fn grow_running_streams(&mut self) -> Result<()> {
        let mut idx = 0;
        while idx < self.running_streams.len() {
            let stream = self.running_streams[idx].clone();
            stream.check_timeout();
            if stream.is_terminal() {
                idx += 1;
                continue;
            }

            if !self.grow_stream(idx)? {
                continue;
            }
            if stream.reuse_cache() {
                self.commit_full_blocks(&stream)?;
            }
            idx += 1;
        }
        Ok(())
    }

    /// Allocate the blocks the stream at `idx` is missing.
    ///
    /// While the pool is short, the most recently admitted live stream is
    /// preempted back to the waiting queue; that may be the stream itself.
    /// A stream that is the only live one left is stopped instead.
    ///
    /// Returns `false` once the stream has left the running list.
    fn grow_stream(&mut self, idx: usize) -> Result<bool> {
        let seq_size_per_block = self.cache_manager.seq_size_per_block();
        let stream = self.running_streams[idx].clone();

        loop {
            let needed = stream.needed_block_nums(seq_size_per_block);
            if needed == 0 {
                return Ok(true);
            }

            match self.cache_manager.malloc(needed) {
                Ok(block_ids) => {
                    debug!(stream_id = stream.stream_id(), blocks = needed, "grew stream");
                    stream.append_blocks(block_ids);
                    return Ok(true);
                }
                Err(e) if e.is_insufficient_memory() => {
                    let live = self
                        .running_streams
                        .iter()
                        .filter(|s| !s.is_terminal())
                        .count();
                    let newest = self.running_streams.iter().rposition(|s| !s.is_terminal());

                    match newest {
                        Some(victim_idx) if live > 1 => {
                            let victim = self.running_streams.remove(victim_idx);
                            self.preempt_stream(victim)?;
                            if victim_idx == idx {
                                return Ok(false);
                            }
                        }
                        _ => {
                            stream.set_stopped(STOP_REASON_NO_MEMORY);
                            let released = self.cache_manager.free(&stream.take_block_ids());
                            warn!(
                                stream_id = stream.stream_id(),
                                needed,
                                released,
                                "stream cannot grow, blocks reclaimed"
                            );
                            self.running_streams.remove(idx);
                            return Ok(false);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Free a running stream's blocks and put it back at the head of the queue.
    fn preempt_stream(&mut self, stream: GenerateStreamRef) -> Result<()> {
        match stream.set_waiting() {
            Ok(block_ids) => {
                let released = self.cache_manager.free(&block_ids);
                warn!(
                    stream_id = stream.stream_id(),
                    released,
                    "preempted stream back to waiting"
                );
                self.waiting_streams.push_front(stream);
            }
            Err(_) => {
                // Terminated by the caller mid-tick
                self.release_stream(&stream)?;
            }
        }
        Ok(())
    }

    /// Publish a running stream's newly filled blocks to the prefix cache.
    fn commit_full_blocks(&self, stream: &GenerateStream) -> Result<()> {
        let (token_ids, block_ids) = stream.full_block_prefix();
        if block_ids.len() <= stream.committed_blocks() {
            return Ok(());
        }
        self.cache_manager.insert_into_cache(&token_ids, &block_ids)?;
        stream.set_committed_blocks(block_ids.len());
        Ok(())
    }

    /// Release the blocks of terminal running streams.
    fn release_finished_streams(&mut self) -> Result<()> {
        let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.running_streams)
            .into_iter()
            .partition(|stream| stream.is_terminal());
        self.running_streams = running;

        for stream in done {
            let released = self.release_stream(&stream)?;
            debug!(
                stream_id = stream.stream_id(),
                status = stream.status().as_str(),
                released,
                "released stream"
            );
        }
        Ok(())
    }

    fn release_stream(&self, stream: &GenerateStream) -> Result<usize> {
        let (token_ids, _) = stream.full_block_prefix();
        let block_ids = stream.take_block_ids();
        if stream.finished() && stream.reuse_cache() {
            self.cache_manager.free_with_cache(&token_ids, &block_ids)
        } else {
            Ok(self.cache_manager.free(&block_ids))
        }
    }

    /// Allocate every block a waiting stream needs, prefix matches included.
    ///
    /// A preempted stream may need blocks past its known tokens; nothing is
    /// kept if those do not fit.
    fn malloc_for_stream(&self, stream: &GenerateStream, token_ids: &[u32]) -> Result<MallocResult> {
        let seq_size_per_block = self.cache_manager.seq_size_per_block();
        let mut blocks = self
            .cache_manager
            .malloc_with_cache(token_ids, stream.reuse_cache())?;

        let missing = compute_num_blocks(stream.seq_length(), seq_size_per_block)
            .saturating_sub(blocks.block_ids.len());
        if missing > 0 {
            match self.cache_manager.malloc(missing) {
                Ok(block_ids) => blocks.block_ids.extend(block_ids),
                Err(e) => {
                    self.cache_manager.free(&blocks.block_ids);
                    return Err(e);
                }
            }
        }
        Ok(blocks)
    }

    /// Admit streams from the head of the queue while their blocks fit.
    fn admit_waiting_streams(&mut self) -> Result<()> {
        let seq_size_per_block = self.cache_manager.seq_size_per_block();

        while let Some(stream) = self.waiting_streams.front().cloned() {
            let token_ids = stream.token_ids();
            match self.malloc_for_stream(&stream, &token_ids) {
                Ok(blocks) => {
                    self.waiting_streams.pop_front();
                    if let Err(e) = stream.set_running(&blocks, seq_size_per_block) {
                        // Terminated by the caller since the sweep
                        self.cache_manager.free(&blocks.block_ids);
                        debug!(stream_id = stream.stream_id(), error = %e, "skipped admission");
                        continue;
                    }
                    debug!(
                        stream_id = stream.stream_id(),
                        blocks = blocks.block_ids.len(),
                        reuse_length = blocks.reuse_length,
                        "admitted stream"
                    );
                    self.running_streams.push(stream);
                }
                Err(e) if e.is_insufficient_memory() => {
                    let needed = compute_num_blocks(
                        token_ids.len().max(stream.seq_length()),
                        seq_size_per_block,
                    );
                    let hopeless = self.running_streams.is_empty()
                        || needed > self.cache_manager.usable_block_nums();
                    if !(self.config.enable_fallback && hopeless) {
                        break;
                    }
                    self.waiting_streams.pop_front();
                    stream.set_stopped(STOP_REASON_NO_MEMORY);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Scheduler for FifoScheduler {
    /// Append a stream to the tail of the waiting queue.
    ///
    /// Memory is not checked here; a stream that never fits is dealt with by
    /// admission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty input, an input longer
    /// than `max_seq_len`, or a stream that is no longer waiting.
    fn enqueue(&mut self, stream: GenerateStreamRef) -> Result<()> {
        let input_length = stream.input_length();
        if input_length == 0 {
            return Err(Error::InvalidInput("input_ids cannot be empty".into()));
        }
        if input_length > self.config.max_seq_len {
            return Err(Error::InvalidInput(format!(
                "input length {input_length} exceeds max_seq_len {}",
                self.config.max_seq_len
            )));
        }
        if stream.status() != StreamStatus::Waiting {
            return Err(Error::InvalidInput(format!(
                "stream {} is {}, not waiting",
                stream.stream_id(),
                stream.status().as_str()
            )));
        }

        stream.mark_enqueued();
        debug!(stream_id = stream.stream_id(), input_length, "enqueued stream");
        self.waiting_streams.push_back(stream);
        Ok(())
    }

    fn schedule(&mut self) -> Result<Vec<GenerateStreamRef>> {
        self.sweep_waiting_streams();
        self.grow_running_streams()?;
        self.release_finished_streams()?;
        self.admit_waiting_streams()?;

        if cfg!(debug_assertions) {
            self.cache_manager.check_consistency()?;
        }

        Ok(self.running_streams.clone())
    }

    fn waiting_streams_size(&self) -> usize {
        self.waiting_streams.len()
    }

    fn running_streams_size(&self) -> usize {
        self.running_streams.len()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::config::CacheDataType;
    use crate::core::cache_config::CacheConfig;
    use crate::core::stream::GenerateInput;

    fn scheduler(block_nums: usize, seq_size_per_block: usize, enable_fallback: bool) -> FifoScheduler {
        let config = CacheConfig::new(1, block_nums, 1, 4, seq_size_per_block, CacheDataType::Fp16);
        let cache_manager = Arc::new(CacheManager::new(config, &Device::Cpu).unwrap());
        let config = SchedulerConfig {
            enable_fallback,
            ..Default::default()
        };
        FifoScheduler::new(config, cache_manager)
    }

    fn stream(id: u64, tokens: Vec<u32>) -> GenerateStreamRef {
        Arc::new(GenerateStream::new(id, GenerateInput::new(tokens)))
    }

    #[test]
    fn test_enqueue_validation() {
        let mut scheduler = scheduler(4, 2, false);

        assert!(matches!(
            scheduler.enqueue(stream(1, vec![])),
            Err(Error::InvalidInput(_))
        ));
        let max_seq_len = scheduler.config().max_seq_len;
        assert!(scheduler.enqueue(stream(2, vec![0; max_seq_len + 1])).is_err());

        // Oversized for the pool is still accepted
        assert!(scheduler.enqueue(stream(3, vec![1; 100])).is_ok());
        assert_eq!(scheduler.waiting_streams_size(), 1);
    }

    #[test]
    fn test_enqueue_twice_rejected() {
        let mut scheduler = scheduler(4, 2, false);
        let s = stream(1, vec![1]);
        scheduler.enqueue(s.clone()).unwrap();
        scheduler.schedule().unwrap();

        assert!(scheduler.enqueue(s).is_err());
    }

    #[test]
    fn test_caller_stopped_while_waiting() {
        let mut scheduler = scheduler(4, 2, false);
        let s = stream(1, vec![1, 2]);
        scheduler.enqueue(s.clone()).unwrap();
        s.set_stopped("cancelled");

        assert!(scheduler.schedule().unwrap().is_empty());
        assert_eq!(scheduler.waiting_streams_size(), 0);
        assert_eq!(scheduler.cache_manager().free_block_nums(), 3);
    }

    #[test]
    fn test_growth_commits_reuse_blocks() {
        let mut scheduler = scheduler(8, 2, false);
        let s = stream(1, vec![1, 2, 3]);
        s.set_reuse_cache(true);
        scheduler.enqueue(s.clone()).unwrap();
        scheduler.schedule().unwrap();

        // First full block is committed on the next tick
        scheduler.schedule().unwrap();
        assert_eq!(scheduler.cache_manager().cached_block_nums(), 1);

        s.append_token(4);
        scheduler.schedule().unwrap();
        assert_eq!(scheduler.cache_manager().cached_block_nums(), 2);
        assert_eq!(s.block_num(), 2);
    }
}
