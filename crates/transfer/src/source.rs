//! Source adapters: where the bytes of a transfer come from.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use tokio::io::AsyncSeekExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::DEFAULT_CHUNK_SIZE;
use crate::error::TransferError;
use crate::types::SourceDescriptor;

/// Stream of chunks pulled from a source. Dropping it closes the source.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// Metadata known about a source before its body is read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetadata {
    pub total_bytes: Option<u64>,
    pub suggested_name: Option<String>,
}

/// An opened source body.
pub struct OpenedSource {
    pub stream: ByteStream,
    /// Offset of the first byte the stream yields. Lower than the requested
    /// offset when the source could not honour it.
    pub offset: u64,
    /// Size of the whole object, not of the remaining range.
    pub total_bytes: Option<u64>,
}

impl std::fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSource")
            .field("offset", &self.offset)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

/// Abstract byte source.
///
/// Implementations classify their failures as `SourceUnreachable` (network,
/// DNS, timeouts; retried) or `SourceRejected` (the source refused; never
/// retried).
pub trait Source: Send + Sync {
    /// Looks up size and name without reading the body.
    ///
    /// Failures are non-fatal: the engine falls back to what `open` reports.
    fn probe<'a>(
        &'a self,
        _descriptor: &'a SourceDescriptor,
    ) -> BoxFuture<'a, Result<SourceMetadata, TransferError>> {
        Box::pin(async { Ok(SourceMetadata::default()) })
    }

    /// Opens the body starting at `offset`.
    fn open<'a>(
        &'a self,
        descriptor: &'a SourceDescriptor,
        offset: u64,
    ) -> BoxFuture<'a, Result<OpenedSource, TransferError>>;

    /// Returns `true` if `open` can start at a non-zero offset.
    fn supports_resume(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Reads handles that resolve to local files (downloaded chat attachments).
#[derive(Debug, Clone)]
pub struct FileSource {
    root: Option<PathBuf>,
    chunk_size: usize,
}

impl Default for FileSource {
    fn default() -> Self {
        Self::new(None, DEFAULT_CHUNK_SIZE)
    }
}

impl FileSource {
    /// Creates a file source.
    ///
    /// Relative handles are resolved against `root`. If `chunk_size` is 0,
    /// [`DEFAULT_CHUNK_SIZE`] is used.
    pub fn new(root: Option<PathBuf>, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self { root, chunk_size }
    }

    fn resolve(&self, descriptor: &SourceDescriptor) -> Result<PathBuf, TransferError> {
        let SourceDescriptor::Handle(handle) = descriptor else {
            return Err(TransferError::SourceRejected(format!(
                "file source cannot open {descriptor}"
            )));
        };
        let path = PathBuf::from(handle);
        Ok(match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        })
    }
}

impl Source for FileSource {
    fn probe<'a>(
        &'a self,
        descriptor: &'a SourceDescriptor,
    ) -> BoxFuture<'a, Result<SourceMetadata, TransferError>> {
        Box::pin(async move {
            let path = self.resolve(descriptor)?;
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| TransferError::from_source_io(&e))?;
            Ok(SourceMetadata {
                total_bytes: Some(meta.len()),
                suggested_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned()),
            })
        })
    }

    fn open<'a>(
        &'a self,
        descriptor: &'a SourceDescriptor,
        offset: u64,
    ) -> BoxFuture<'a, Result<OpenedSource, TransferError>> {
        Box::pin(async move {
            let path = self.resolve(descriptor)?;
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| TransferError::from_source_io(&e))?;
            let len = file
                .metadata()
                .await
                .map_err(|e| TransferError::from_source_io(&e))?
                .len();
            if len > 0 && offset > 0 {
                file.seek(std::io::SeekFrom::Start(offset.min(len)))
                    .await
                    .map_err(|e| TransferError::from_source_io(&e))?;
            }
            debug!(path = %path.display(), offset, len, "file source opened");

            let stream = ReaderStream::with_capacity(file, self.chunk_size)
                .map_err(|e| TransferError::from_source_io(&e))
                .boxed();
            Ok(OpenedSource {
                stream,
                offset: offset.min(len),
                total_bytes: Some(len),
            })
        })
    }

    fn supports_resume(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// CompositeSource
// ---------------------------------------------------------------------------

/// Routes URL descriptors and handle descriptors to different adapters.
#[derive(Clone)]
pub struct CompositeSource {
    urls: Arc<dyn Source>,
    handles: Arc<dyn Source>,
}

impl CompositeSource {
    pub fn new(urls: Arc<dyn Source>, handles: Arc<dyn Source>) -> Self {
        Self { urls, handles }
    }

    fn route(&self, descriptor: &SourceDescriptor) -> &dyn Source {
        match descriptor {
            SourceDescriptor::Url(_) => self.urls.as_ref(),
            SourceDescriptor::Handle(_) => self.handles.as_ref(),
        }
    }
}

impl Source for CompositeSource {
    fn probe<'a>(
        &'a self,
        descriptor: &'a SourceDescriptor,
    ) -> BoxFuture<'a, Result<SourceMetadata, TransferError>> {
        self.route(descriptor).probe(descriptor)
    }

    fn open<'a>(
        &'a self,
        descriptor: &'a SourceDescriptor,
        offset: u64,
    ) -> BoxFuture<'a, Result<OpenedSource, TransferError>> {
        self.route(descriptor).open(descriptor, offset)
    }

    /// Only true when both adapters resume; the engine copes either way.
    fn supports_resume(&self) -> bool {
        self.urls.supports_resume() && self.handles.supports_resume()
    }
}
