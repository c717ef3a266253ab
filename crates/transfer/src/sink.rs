//! Sink adapters: where the bytes of a transfer go.
//!
//! The credential layer hands the engine an already-authenticated [`Sink`]
//! through a [`SinkProvider`]; the pipeline never authenticates by itself.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::TransferError;

/// Abstract storage back end.
pub trait Sink: Send + Sync {
    /// Starts an upload of `name`. `total_bytes` is `None` when unknown.
    fn begin_upload<'a>(
        &'a self,
        name: &'a str,
        total_bytes: Option<u64>,
    ) -> BoxFuture<'a, Result<Box<dyn UploadSession>, TransferError>>;
}

/// One writable upload.
///
/// Failures are `SinkUnreachable` (network; retried) or `SinkRejected`
/// (quota, expired auth, invalid name; never retried).
pub trait UploadSession: Send {
    /// Writes a chunk and returns how many bytes the sink accepted.
    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, Result<usize, TransferError>>;

    /// Commits the upload and returns a shareable reference.
    fn finalize(self: Box<Self>) -> BoxFuture<'static, Result<String, TransferError>>;

    /// Abandons the upload, releasing server-side resources where possible.
    /// Safe to call at any point, including after a failed write.
    fn abort(self: Box<Self>) -> BoxFuture<'static, ()>;

    /// Bytes durably accepted so far.
    fn confirmed_bytes(&self) -> u64;

    /// Returns `true` if writing may continue at `confirmed_bytes()` after a
    /// transient write failure.
    fn is_resumable(&self) -> bool {
        false
    }
}

/// Supplies the authenticated sink for a chat session.
pub trait SinkProvider: Send + Sync {
    /// Fails fast with `SinkUnreachable` if the session has no usable handle.
    fn sink_for<'a>(&'a self, session: &'a str) -> BoxFuture<'a, Result<Arc<dyn Sink>, TransferError>>;
}

/// Serves the same sink to every session.
#[derive(Clone)]
pub struct StaticSinkProvider {
    sink: Arc<dyn Sink>,
}

impl StaticSinkProvider {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

impl SinkProvider for StaticSinkProvider {
    fn sink_for<'a>(&'a self, _session: &'a str) -> BoxFuture<'a, Result<Arc<dyn Sink>, TransferError>> {
        let sink = Arc::clone(&self.sink);
        Box::pin(async move { Ok(sink) })
    }
}
