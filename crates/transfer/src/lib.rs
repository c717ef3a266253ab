//! Streaming file relay: moves a file from a source (URL or chat attachment)
//! into a storage sink without buffering it whole, with bounded retries,
//! cooperative cancellation and throttled progress notifications.

mod config;
mod directory;
mod engine;
mod error;
mod naming;
mod progress;
mod registry;
mod relay;
mod retry;
mod scratch;
mod sink;
mod source;
mod types;

pub use config::TransferConfig;
pub use directory::{DirectorySink, NameConflict};
pub use engine::TransferEngine;
pub use error::{AdmitError, ErrorKind, NotifyError, TransferError};
pub use naming::{
    MAX_NAME_LEN, name_from_content_disposition, name_from_url, numbered_name, resolve_name,
    validate_name,
};
pub use progress::{
    Notifier, NullNotifier, SpeedCalculator, StatusUpdate, format_bytes, render_progress,
};
pub use registry::{Admission, TransferRegistry};
pub use relay::Relay;
pub use retry::{RetryDecision, RetryPolicy};
pub use scratch::ScratchFile;
pub use sink::{Sink, SinkProvider, StaticSinkProvider, UploadSession};
pub use source::{ByteStream, CompositeSource, FileSource, OpenedSource, Source, SourceMetadata};
pub use types::{
    Phase, ProgressEvent, SourceDescriptor, StoredFile, TransferRequest, TransferResult,
    TransferSnapshot, TransferState,
};

/// Default chunk size: 1 MiB.
///
/// Also the default read size of [`FileSource`] and the largest single write
/// handed to a sink.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
