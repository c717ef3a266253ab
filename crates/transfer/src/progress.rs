//! Progress reporting toward the chat notification channel.
//!
//! The engine hands updates to a [`ProgressReporter`], which de-duplicates
//! them and pushes them onto a bounded queue without waiting. A spawned
//! delivery task drains the queue, renders the text and calls the
//! [`Notifier`]. Delivery failures are logged and dropped; they never reach
//! the transfer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::types::{Phase, ProgressEvent};

/// One "update the text of message X" request.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// Chat message (or session) whose text is replaced.
    pub target: String,
    pub text: String,
    /// Set for progress updates, `None` for informational texts.
    pub event: Option<ProgressEvent>,
}

/// Fire-and-forget notification channel.
pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, update: &'a StatusUpdate) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Notifier that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify<'a>(&'a self, _update: &'a StatusUpdate) -> BoxFuture<'a, Result<(), NotifyError>> {
        Box::pin(async { Ok(()) })
    }
}

enum Outgoing {
    Info(String),
    Progress { name: Arc<str>, event: ProgressEvent },
}

/// Engine-side handle of the progress channel for one transfer.
pub(crate) struct ProgressReporter {
    tx: Option<mpsc::Sender<Outgoing>>,
    delivery: JoinHandle<()>,
    transfer_id: String,
    name: Arc<str>,
    interval: Duration,
    last_key: Option<(Phase, u64)>,
    last_phase: Option<Phase>,
    last_sent_at: Option<Instant>,
}

impl ProgressReporter {
    /// Spawns the delivery task for `target`.
    ///
    /// `queue` is the number of undelivered updates kept before new ones are
    /// dropped; `interval` is the minimum spacing of byte-count updates
    /// (zero disables throttling).
    pub(crate) fn spawn(
        notifier: Arc<dyn Notifier>,
        target: String,
        transfer_id: String,
        interval: Duration,
        queue: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let delivery = tokio::spawn(deliver(notifier, target, transfer_id.clone(), rx));
        Self {
            tx: Some(tx),
            delivery,
            transfer_id,
            name: Arc::from(""),
            interval,
            last_key: None,
            last_phase: None,
            last_sent_at: None,
        }
    }

    /// Sets the file name used in rendered progress texts.
    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = Arc::from(name);
    }

    /// Queues an informational text.
    pub(crate) fn info(&mut self, text: impl Into<String>) {
        self.enqueue(Outgoing::Info(text.into()));
    }

    /// Queues a progress event unless it repeats the previous one or falls
    /// inside the throttle interval. Returns `true` if it was queued.
    ///
    /// Events are keyed by percent, or by byte count in bytes-only mode. Only
    /// byte-count events are throttled: percent boundaries are already coarse
    /// and each one is reported exactly once.
    pub(crate) fn report(&mut self, event: ProgressEvent) -> bool {
        let key = (
            event.phase,
            event.percent.map_or(event.bytes_moved, u64::from),
        );
        if self.last_key == Some(key) {
            return false;
        }

        let phase_changed = self.last_phase != Some(event.phase);
        if event.percent.is_none()
            && !self.interval.is_zero()
            && !phase_changed
            && let Some(at) = self.last_sent_at
            && at.elapsed() < self.interval
        {
            debug!(transfer = %self.transfer_id, bytes = event.bytes_moved, "progress update throttled");
            return false;
        }

        self.last_key = Some(key);
        self.last_phase = Some(event.phase);
        self.last_sent_at = Some(Instant::now());
        self.enqueue(Outgoing::Progress {
            name: Arc::clone(&self.name),
            event,
        });
        true
    }

    fn enqueue(&mut self, item: Outgoing) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(transfer = %self.transfer_id, "notification queue full, update dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(transfer = %self.transfer_id, "notification channel closed");
                self.tx = None;
            }
        }
    }

    /// Closes the queue and waits up to `timeout` for pending updates to go
    /// out. Whatever is still undelivered afterwards is dropped.
    pub(crate) async fn flush(mut self, timeout: Duration) {
        self.tx = None;
        if tokio::time::timeout(timeout, &mut self.delivery).await.is_err() {
            warn!(transfer = %self.transfer_id, "progress flush timed out, dropping pending updates");
            self.delivery.abort();
        }
    }
}

async fn deliver(
    notifier: Arc<dyn Notifier>,
    target: String,
    transfer_id: String,
    mut rx: mpsc::Receiver<Outgoing>,
) {
    let mut quiet_until: Option<Instant> = None;

    while let Some(item) = rx.recv().await {
        let update = match item {
            Outgoing::Info(text) => StatusUpdate {
                target: target.clone(),
                text,
                event: None,
            },
            Outgoing::Progress { name, event } => {
                let is_final = event.percent == Some(100);
                if !is_final && quiet_until.is_some_and(|until| Instant::now() < until) {
                    debug!(transfer = %transfer_id, "rate limited, progress update skipped");
                    continue;
                }
                StatusUpdate {
                    target: target.clone(),
                    text: render_progress(&name, &event),
                    event: Some(event),
                }
            }
        };

        match notifier.notify(&update).await {
            Ok(()) => {}
            Err(NotifyError::RateLimited { retry_after }) => {
                warn!(transfer = %transfer_id, ?retry_after, "notification rate limited, update dropped");
                quiet_until = retry_after.map(|d| Instant::now() + d);
            }
            Err(e) => {
                warn!(transfer = %transfer_id, error = %e, "notification failed");
            }
        }
    }
}

/// Renders the user-visible progress line.
///
/// `Uploading report.pdf: 40% (12.0 MiB of 30.0 MiB, 1.5 MiB/s)`, or
/// `Uploading report.pdf: 20.0 MiB (1.5 MiB/s)` when the size is unknown.
pub fn render_progress(name: &str, event: &ProgressEvent) -> String {
    let speed = format_speed(event.bytes_per_second);
    match (event.percent, event.total_bytes) {
        (Some(percent), Some(total)) => format!(
            "Uploading {name}: {percent}% ({} of {}, {speed})",
            format_bytes(event.bytes_moved),
            format_bytes(total),
        ),
        _ => format!(
            "Uploading {name}: {} ({speed})",
            format_bytes(event.bytes_moved)
        ),
    }
}

/// Formats a byte count with binary units: `512 B`, `1.5 KiB`, `12.0 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn format_speed(bytes_per_second: f64) -> String {
    let per_sec = if bytes_per_second.is_finite() && bytes_per_second > 0.0 {
        bytes_per_second as u64
    } else {
        0
    };
    format!("{}/s", format_bytes(per_sec))
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: Vec::new(),
            max_samples: max_samples.unwrap_or(100),
            window_size: window_size.unwrap_or(Duration::from_secs(5)),
        }
    }

    /// Records `bytes` accepted at the current instant.
    pub fn add_sample(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(self.window_size) {
            self.samples.retain(|sample| sample.timestamp >= cutoff);
        }
        if self.samples.len() > self.max_samples {
            let excess = self.samples.len() - self.max_samples;
            self.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        // The first sample marks the start of the window.
        let total: u64 = self.samples[1..].iter().map(|s| s.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Clears all recorded samples.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
