//! Decoder engine: the tick loop driving scheduler and executor.
//!
//! ## Engine Flow
//!
//! ```text
//!   enqueue() / submit()            step()  (or the background loop)
//!          │                            │
//!          ▼                            ▼
//!   ┌──────────────┐            ┌──────────────┐
//!   │  Scheduler   │◄───────────│   schedule   │  admit, grow, release
//!   │ waiting queue│            └──────────────┘
//!   └──────────────┘                    │ running batch
//!                                       ▼
//!                               ┌──────────────┐
//!                               │   Executor   │  append tokens, finish
//!                               │   process    │
//!                               └──────────────┘
//!                                       │
//!                                       ▼
//!                               ┌──────────────┐
//!                               │ EngineStats  │
//!                               └──────────────┘
//! ```
//!
//! The scheduler lock is held only while scheduling, so other threads can
//! enqueue while the executor runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use candle_core::Device;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::core::cache_config::CacheConfigCreator;
use crate::core::cache_manager::CacheManager;
use crate::core::stream::{GenerateInput, GenerateStream, GenerateStreamRef};
use crate::engine::executor::Executor;
use crate::error::{Error, Result};
use crate::scheduler::{FifoScheduler, Scheduler};

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Per-tick engine metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    /// Streams handed to the executor this tick.
    pub running_batch_size: usize,
    /// Streams still queued after admission.
    pub waiting_query_size: usize,
    /// Fraction of usable blocks referenced after the tick.
    pub block_used_ratio: f64,
    /// Wall time of the tick.
    pub iterate_latency_ms: f64,
}

struct EngineInner {
    scheduler: Mutex<FifoScheduler>,
    cache_manager: Arc<CacheManager>,
    executor: Arc<dyn Executor>,
    running: AtomicBool,
    next_stream_id: AtomicU64,
    last_stats: Mutex<EngineStats>,
}

impl EngineInner {
    fn step(&self) -> Result<EngineStats> {
        let start = Instant::now();

        let (batch, waiting_query_size) = {
            let mut scheduler = self.scheduler.lock();
            let batch = scheduler.schedule()?;
            (batch, scheduler.waiting_streams_size())
        };

        if !batch.is_empty() {
            if let Err(e) = self.executor.process(&batch) {
                error!(error = %e, batch = batch.len(), "executor failed, stopping batch");
                let reason = e.to_string();
                for stream in &batch {
                    stream.set_stopped(reason.clone());
                }
            }
        }

        let stats = EngineStats {
            running_batch_size: batch.len(),
            waiting_query_size,
            block_used_ratio: self.cache_manager.block_used_ratio(),
            iterate_latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        debug!(
            running_batch_size = stats.running_batch_size,
            waiting_query_size = stats.waiting_query_size,
            block_used_ratio = stats.block_used_ratio,
            iterate_latency_ms = stats.iterate_latency_ms,
            "engine step"
        );
        *self.last_stats.lock() = stats.clone();
        Ok(stats)
    }

    fn run_loop(&self) {
        while self.running.load(Ordering::Acquire) {
            match self.step() {
                Ok(stats) if stats.running_batch_size > 0 => {}
                Ok(_) => thread::sleep(IDLE_SLEEP),
                Err(e) => {
                    error!(error = %e, "engine step failed");
                    thread::sleep(IDLE_SLEEP);
                }
            }
        }
    }
}

/// Drives scheduling and generation, one tick at a time or on a background thread.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use candle_core::Device;
/// use nano_kvsched::config::{CacheDataType, SchedulerConfig};
/// use nano_kvsched::core::cache_config::CacheConfig;
/// use nano_kvsched::core::cache_manager::CacheManager;
/// use nano_kvsched::core::stream::GenerateInput;
/// use nano_kvsched::engine::{DecoderEngine, SyntheticExecutor};
/// use nano_kvsched::scheduler::FifoScheduler;
///
/// let config = CacheConfig::new(1, 16, 1, 4, 4, CacheDataType::Fp16);
/// let cache_manager = Arc::new(CacheManager::new(config, &Device::Cpu).unwrap());
/// let scheduler = FifoScheduler::new(SchedulerConfig::default(), cache_manager.clone());
/// let engine = DecoderEngine::new(scheduler, Arc::new(SyntheticExecutor::new(100)));
///
/// let mut input = GenerateInput::new(vec![1, 2, 3]);
/// input.generate_config.max_new_tokens = 4;
/// let stream = engine.submit(input).unwrap();
///
/// while engine.has_unfinished_streams() {
///     engine.step().unwrap();
/// }
/// assert_eq!(stream.output_length(), 4);
/// assert_eq!(cache_manager.free_block_nums(), 15);
/// ```
pub struct DecoderEngine {
    inner: Arc<EngineInner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DecoderEngine {
    pub fn new(scheduler: FifoScheduler, executor: Arc<dyn Executor>) -> Self {
        let cache_manager = scheduler.cache_manager().clone();
        Self {
            inner: Arc::new(EngineInner {
                scheduler: Mutex::new(scheduler),
                cache_manager,
                executor,
                running: AtomicBool::new(false),
                next_stream_id: AtomicU64::new(1),
                last_stats: Mutex::new(EngineStats::default()),
            }),
            loop_handle: Mutex::new(None),
        }
    }

    /// Build the cache and scheduler for `config` and wrap them in an engine.
    ///
    /// # Arguments
    ///
    /// * `config` - Model shape, cache budget and scheduler settings
    /// * `device_free_bytes` - Free device memory, used when no explicit
    ///   cache budget is configured
    /// * `device` - Where block memory is allocated
    /// * `executor` - Compute collaborator
    pub fn from_config(
        config: &EngineConfig,
        device_free_bytes: usize,
        device: &Device,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        config.validate()?;
        let cache_config =
            CacheConfigCreator::create_config(&config.model, &config.cache, device_free_bytes)?;
        let cache_manager = Arc::new(CacheManager::new(cache_config, device)?);
        let scheduler = FifoScheduler::new(config.scheduler.clone(), cache_manager);
        Ok(Self::new(scheduler, executor))
    }

    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.inner.cache_manager
    }

    /// Queue an existing stream.
    pub fn enqueue(&self, stream: GenerateStreamRef) -> Result<()> {
        self.inner.scheduler.lock().enqueue(stream)
    }

    /// Wrap `input` in a new stream with a fresh id and queue it.
    pub fn submit(&self, input: GenerateInput) -> Result<GenerateStreamRef> {
        let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(GenerateStream::new(stream_id, input));
        self.enqueue(stream.clone())?;
        Ok(stream)
    }

    /// Run one tick: schedule, process the running batch, report.
    ///
    /// # Errors
    ///
    /// Only scheduler failures propagate. An executor failure stops the
    /// affected streams and the tick still succeeds.
    pub fn step(&self) -> Result<EngineStats> {
        self.inner.step()
    }

    /// Metrics of the most recent tick.
    pub fn last_stats(&self) -> EngineStats {
        self.inner.last_stats.lock().clone()
    }

    pub fn waiting_streams_size(&self) -> usize {
        self.inner.scheduler.lock().waiting_streams_size()
    }

    pub fn running_streams_size(&self) -> usize {
        self.inner.scheduler.lock().running_streams_size()
    }

    /// Whether any stream is still waiting or running.
    pub fn has_unfinished_streams(&self) -> bool {
        self.inner.scheduler.lock().has_unfinished_streams()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn the background loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the loop is already running, or
    /// [`Error::Io`] if the thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.loop_handle.lock();
        if handle.is_some() {
            return Err(Error::Config("engine loop already started".into()));
        }

        self.inner.running.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("decoder-loop".into())
            .spawn(move || inner.run_loop());
        match spawned {
            Ok(join_handle) => *handle = Some(join_handle),
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        }

        info!("engine loop started");
        Ok(())
    }

    /// Signal the background loop to exit and wait for it.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(join_handle) = self.loop_handle.lock().take() {
            if join_handle.join().is_err() {
                error!("engine loop panicked");
            }
            info!("engine loop stopped");
        }
    }
}

impl Drop for DecoderEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheDataType, SchedulerConfig};
    use crate::core::cache_config::CacheConfig;
    use crate::engine::executor::SyntheticExecutor;

    struct FailingExecutor;

    impl Executor for FailingExecutor {
        fn process(&self, _streams: &[GenerateStreamRef]) -> Result<()> {
            Err(Error::Executor("device lost".into()))
        }
    }

    fn engine(executor: Arc<dyn Executor>) -> DecoderEngine {
        let config = CacheConfig::new(1, 9, 1, 4, 2, CacheDataType::Fp16);
        let cache_manager = Arc::new(CacheManager::new(config, &Device::Cpu).unwrap());
        DecoderEngine::new(
            FifoScheduler::new(SchedulerConfig::default(), cache_manager),
            executor,
        )
    }

    fn input(tokens: Vec<u32>, max_new_tokens: usize) -> GenerateInput {
        let mut input = GenerateInput::new(tokens);
        input.generate_config.max_new_tokens = max_new_tokens;
        input
    }

    #[test]
    fn test_step_reports_stats() {
        let engine = engine(Arc::new(SyntheticExecutor::new(100)));
        engine.submit(input(vec![1, 2, 3], 8)).unwrap();

        let stats = engine.step().unwrap();
        assert_eq!(stats.running_batch_size, 1);
        assert_eq!(stats.waiting_query_size, 0);
        assert_eq!(stats.block_used_ratio, 0.25);
        assert_eq!(engine.last_stats(), stats);
    }

    #[test]
    fn test_executor_failure_stops_batch() {
        let engine = engine(Arc::new(FailingExecutor));
        let stream = engine.submit(input(vec![1, 2, 3], 8)).unwrap();

        assert!(engine.step().is_ok());
        assert!(stream.stopped());
        assert!(stream.stop_reason().contains("device lost"));

        engine.step().unwrap();
        assert!(!engine.has_unfinished_streams());
        assert_eq!(engine.cache_manager().free_block_nums(), 8);
    }

    #[test]
    fn test_submit_assigns_ids() {
        let engine = engine(Arc::new(SyntheticExecutor::new(100)));
        let a = engine.submit(input(vec![1], 1)).unwrap();
        let b = engine.submit(input(vec![1], 1)).unwrap();
        assert_ne!(a.stream_id(), b.stream_id());
        assert_eq!(engine.waiting_streams_size(), 2);
    }

    #[test]
    fn test_start_twice_rejected() {
        let engine = engine(Arc::new(SyntheticExecutor::new(100)));
        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.stop();
        assert!(!engine.is_running());
    }
}
