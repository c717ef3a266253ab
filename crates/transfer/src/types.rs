use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Where the bytes of a transfer come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourceDescriptor {
    /// A remote URL to fetch.
    Url(String),
    /// An already-resolved handle (for example a local path of a chat attachment).
    Handle(String),
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceDescriptor::Url(url) => f.write_str(url),
            SourceDescriptor::Handle(handle) => write!(f, "handle:{handle}"),
        }
    }
}

/// A request to move one file into storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source: SourceDescriptor,
    /// Overrides the name derived from the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_name: Option<String>,
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size_hint: Option<u64>,
    /// Chat message whose text receives progress updates (session id if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_target: Option<String>,
}

impl TransferRequest {
    pub fn new(session: impl Into<String>, source: SourceDescriptor) -> Self {
        Self {
            source,
            desired_name: None,
            session: session.into(),
            total_size_hint: None,
            status_target: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.desired_name = Some(name.into());
        self
    }

    pub fn with_size_hint(mut self, total: u64) -> Self {
        self.total_size_hint = Some(total);
        self
    }

    pub fn with_status_target(mut self, target: impl Into<String>) -> Self {
        self.status_target = Some(target.into());
        self
    }

    /// Returns the notification target for this request.
    pub fn status_target(&self) -> &str {
        self.status_target.as_deref().unwrap_or(&self.session)
    }
}

/// Lifecycle phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Phase {
    Pending = 0,
    Downloading = 1,
    Uploading = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

impl Phase {
    /// Returns `true` for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Downloading,
            2 => Phase::Uploading,
            3 => Phase::Completed,
            4 => Phase::Failed,
            5 => Phase::Cancelled,
            _ => Phase::Pending,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "pending"),
            Phase::Downloading => write!(f, "downloading"),
            Phase::Uploading => write!(f, "uploading"),
            Phase::Completed => write!(f, "completed"),
            Phase::Failed => write!(f, "failed"),
            Phase::Cancelled => write!(f, "cancelled"),
        }
    }
}

const UNKNOWN_TOTAL: u64 = u64::MAX;
const NO_PERCENT: u8 = u8::MAX;

/// Live state of one admitted transfer.
///
/// Written only by the engine task that drives the transfer; any other task
/// may read it without locking and gets an eventually-consistent view.
#[derive(Debug)]
pub struct TransferState {
    id: String,
    session: String,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    phase: AtomicU8,
    bytes_moved: AtomicU64,
    total_bytes: AtomicU64,
    last_percent: AtomicU8,
    download_attempts: AtomicU32,
    upload_attempts: AtomicU32,
    cancel: CancellationToken,
}

impl TransferState {
    /// Creates a pending transfer state for `session`.
    pub fn new(id: String, session: String, total_hint: Option<u64>) -> Self {
        Self {
            id,
            session,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            phase: AtomicU8::new(Phase::Pending as u8),
            bytes_moved: AtomicU64::new(0),
            total_bytes: AtomicU64::new(total_hint.unwrap_or(UNKNOWN_TOTAL)),
            last_percent: AtomicU8::new(NO_PERCENT),
            download_attempts: AtomicU32::new(0),
            upload_attempts: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved.load(Ordering::Acquire)
    }

    /// Raises `bytes_moved` to `confirmed` if it is higher.
    ///
    /// A restarted upload replays bytes that were already counted, so the
    /// counter is a high-water mark and never decreases.
    pub(crate) fn record_confirmed(&self, confirmed: u64) -> u64 {
        let prev = self.bytes_moved.fetch_max(confirmed, Ordering::AcqRel);
        prev.max(confirmed)
    }

    pub fn total_bytes(&self) -> Option<u64> {
        match self.total_bytes.load(Ordering::Acquire) {
            UNKNOWN_TOTAL => None,
            n => Some(n),
        }
    }

    pub(crate) fn set_total_bytes(&self, total: Option<u64>) {
        self.total_bytes
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Release);
    }

    /// Last percent boundary handed to the progress reporter.
    pub fn last_progress_percent(&self) -> Option<u8> {
        match self.last_percent.load(Ordering::Acquire) {
            NO_PERCENT => None,
            p => Some(p),
        }
    }

    pub(crate) fn set_last_progress_percent(&self, percent: u8) {
        self.last_percent.store(percent, Ordering::Release);
    }

    pub fn download_attempts(&self) -> u32 {
        self.download_attempts.load(Ordering::Acquire)
    }

    pub fn upload_attempts(&self) -> u32 {
        self.upload_attempts.load(Ordering::Acquire)
    }

    pub(crate) fn begin_download_attempt(&self) -> u32 {
        self.download_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn begin_upload_attempt(&self) -> u32 {
        self.upload_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Requests cancellation. Idempotent; the flag is never cleared.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Returns the current percentage (0-100) if the total is known.
    pub fn percent(&self) -> Option<u8> {
        let total = self.total_bytes()?;
        Some(percent_of(self.bytes_moved(), total))
    }

    /// Returns a serializable snapshot for status display.
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id.clone(),
            session: self.session.clone(),
            phase: self.phase(),
            bytes_moved: self.bytes_moved(),
            total_bytes: self.total_bytes(),
            percent: self.percent(),
            download_attempts: self.download_attempts(),
            upload_attempts: self.upload_attempts(),
            cancel_requested: self.is_cancelled(),
            started_at: self.started_wall,
            elapsed_secs: self.elapsed().as_secs_f64(),
        }
    }
}

/// Computes `moved / total` as a whole percentage clamped to 0-100.
pub(crate) fn percent_of(moved: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (moved as u128 * 100 / total as u128).min(100);
    pct as u8
}

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSnapshot {
    pub id: String,
    pub session: String,
    pub phase: Phase,
    pub bytes_moved: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<u8>,
    pub download_attempts: u32,
    pub upload_attempts: u32,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
}

/// Progress notification payload. Never used for correctness decisions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub transfer_id: String,
    pub phase: Phase,
    /// `None` when the total size is unknown (bytes-only mode).
    pub percent: Option<u8>,
    pub bytes_moved: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second over the recent window.
    pub bytes_per_second: f64,
}

/// A file durably stored by the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    /// Shareable reference returned by the sink.
    pub reference: String,
    pub name: String,
    pub bytes: u64,
    /// SHA-256 hex digest of the bytes accepted by the sink.
    pub sha256: String,
}

/// Terminal value of a transfer. Exactly one is produced per admitted request.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub transfer_id: String,
    pub session: String,
    pub bytes_moved: u64,
    pub elapsed: Duration,
    pub outcome: Result<StoredFile, TransferError>,
}

impl TransferResult {
    /// Returns the storage reference on success.
    pub fn reference(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(|f| f.reference.as_str())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, Err(TransferError::Cancelled))
    }

    /// Terminal phase matching the outcome.
    pub fn phase(&self) -> Phase {
        match &self.outcome {
            Ok(_) => Phase::Completed,
            Err(TransferError::Cancelled) => Phase::Cancelled,
            Err(_) => Phase::Failed,
        }
    }

    /// User-visible message describing the outcome.
    pub fn summary(&self) -> String {
        match &self.outcome {
            Ok(file) => format!("File uploaded as: {}\n{}", file.name, file.reference),
            Err(TransferError::Cancelled) => "Transfer cancelled.".to_string(),
            Err(e) => format!("There was an error transferring your file: {e}"),
        }
    }
}
