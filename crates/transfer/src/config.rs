use std::time::Duration;

use crate::DEFAULT_CHUNK_SIZE;
use crate::retry::RetryPolicy;

/// Tuning knobs of the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Largest single write handed to the sink.
    pub chunk_size: usize,
    /// Chunks buffered between download and upload.
    pub buffer_chunks: usize,
    /// Wall-clock ceiling of one download attempt.
    pub download_timeout: Duration,
    /// Wall-clock ceiling of one upload attempt.
    pub upload_timeout: Duration,
    pub retry: RetryPolicy,
    /// Progress step in bytes when the total size is unknown.
    pub unknown_size_step: u64,
    /// Minimum spacing of intermediate progress updates. Zero disables it.
    pub progress_interval: Duration,
    /// Undelivered progress updates kept before new ones are dropped.
    pub progress_queue: usize,
    /// How long a finished transfer waits for pending updates to go out.
    pub progress_flush_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_chunks: 4,
            download_timeout: Duration::from_secs(600),
            upload_timeout: Duration::from_secs(600),
            retry: RetryPolicy::default(),
            unknown_size_step: 10 * 1024 * 1024,
            progress_interval: Duration::from_secs(1),
            progress_queue: 32,
            progress_flush_timeout: Duration::from_secs(2),
        }
    }
}

impl TransferConfig {
    /// Returns a copy with zero sizes replaced by their defaults.
    pub(crate) fn normalized(&self) -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: if self.chunk_size == 0 {
                defaults.chunk_size
            } else {
                self.chunk_size
            },
            buffer_chunks: self.buffer_chunks.max(1),
            unknown_size_step: if self.unknown_size_step == 0 {
                defaults.unknown_size_step
            } else {
                self.unknown_size_step
            },
            progress_queue: self.progress_queue.max(1),
            ..self.clone()
        }
    }
}
