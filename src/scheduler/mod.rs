//! Request admission and per-tick scheduling.
//!
//! This module handles:
//! - FIFO admission of waiting streams into the running set
//! - Growing running streams' block lists as they generate
//! - Releasing blocks of finished and stopped streams

pub mod fifo;

pub use fifo::FifoScheduler;

use crate::core::stream::GenerateStreamRef;
use crate::error::Result;

/// Stop reason given to streams that cannot get the blocks they need.
pub const STOP_REASON_NO_MEMORY: &str = "can not be add input queue";

/// Decides which streams run on each tick.
pub trait Scheduler: Send {
    /// Queue a stream for admission.
    fn enqueue(&mut self, stream: GenerateStreamRef) -> Result<()>;

    /// Run one scheduling tick.
    ///
    /// # Returns
    ///
    /// The streams the compute engine must process this tick, in admission order.
    fn schedule(&mut self) -> Result<Vec<GenerateStreamRef>>;

    fn waiting_streams_size(&self) -> usize;

    fn running_streams_size(&self) -> usize;
}
