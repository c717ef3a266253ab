//! Front door used by the chat layer.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::TransferEngine;
use crate::error::{AdmitError, TransferError};
use crate::registry::TransferRegistry;
use crate::sink::SinkProvider;
use crate::types::{Phase, TransferRequest, TransferResult, TransferSnapshot};

/// Accepts transfer requests and runs each one on its own task.
#[derive(Clone)]
pub struct Relay {
    registry: TransferRegistry,
    engine: Arc<TransferEngine>,
    sinks: Arc<dyn SinkProvider>,
}

impl Relay {
    pub fn new(engine: TransferEngine, sinks: Arc<dyn SinkProvider>) -> Self {
        Self {
            registry: TransferRegistry::new(),
            engine: Arc::new(engine),
            sinks,
        }
    }

    /// Admits `request` and starts it in the background.
    ///
    /// Fails immediately if the session already has a transfer running. The
    /// handle resolves to the transfer's single terminal result.
    pub fn submit(&self, request: TransferRequest) -> Result<JoinHandle<TransferResult>, AdmitError> {
        let admission = self.registry.admit(&request)?;
        let engine = Arc::clone(&self.engine);
        let sinks = Arc::clone(&self.sinks);

        Ok(tokio::spawn(async move {
            let cancel = admission.state().cancel_token();
            let found = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                found = sinks.sink_for(&request.session) => found,
            };
            let sink = match found {
                Ok(sink) => sink,
                Err(e) => {
                    let state = admission.state();
                    // A cancel always wins over whatever the lookup reported.
                    let (e, phase) = if state.is_cancelled() {
                        info!(transfer = %state.id(), session = %request.session, "transfer cancelled before storage was resolved");
                        (TransferError::Cancelled, Phase::Cancelled)
                    } else {
                        warn!(transfer = %state.id(), session = %request.session, error = %e, "no storage available for session");
                        (e, Phase::Failed)
                    };
                    state.set_phase(phase);
                    return TransferResult {
                        transfer_id: state.id().to_string(),
                        session: request.session.clone(),
                        bytes_moved: 0,
                        elapsed: state.elapsed(),
                        outcome: Err(e),
                    };
                }
            };
            engine.run(admission, request, sink).await
        }))
    }

    /// Requests cancellation of the session's transfer. Returns `false` if
    /// nothing was running.
    pub fn cancel(&self, session: &str) -> bool {
        self.registry.cancel(session)
    }

    pub fn status(&self, session: &str) -> Option<TransferSnapshot> {
        self.registry.get(session).map(|state| state.snapshot())
    }

    pub fn active(&self) -> Vec<TransferSnapshot> {
        self.registry.active()
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use tempfile::TempDir;

    use crate::config::TransferConfig;
    use crate::directory::DirectorySink;
    use crate::error::ErrorKind;
    use crate::progress::NullNotifier;
    use crate::sink::{Sink, StaticSinkProvider};
    use crate::source::FileSource;
    use crate::types::SourceDescriptor;

    fn relay(out: &TempDir) -> Relay {
        let engine = TransferEngine::new(
            Arc::new(FileSource::default()),
            Arc::new(NullNotifier),
            TransferConfig::default(),
        );
        let sink: Arc<dyn Sink> = Arc::new(DirectorySink::new(out.path()));
        Relay::new(engine, Arc::new(StaticSinkProvider::new(sink)))
    }

    #[tokio::test]
    async fn submit_copies_local_file() {
        let input = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let path = input.path().join("photo.jpg");
        std::fs::write(&path, b"jpeg bytes").unwrap();

        let relay = relay(&out);
        let handle = relay
            .submit(TransferRequest::new(
                "chat-1",
                SourceDescriptor::Handle(path.to_string_lossy().into_owned()),
            ))
            .unwrap();
        let result = handle.await.unwrap();

        let file = result.outcome.unwrap();
        assert_eq!(file.name, "photo.jpg");
        assert_eq!(
            std::fs::read(out.path().join("photo.jpg")).unwrap(),
            b"jpeg bytes"
        );
        assert!(relay.status("chat-1").is_none());
        assert!(relay.active().is_empty());
    }

    #[tokio::test]
    async fn second_submit_for_session_is_refused() {
        let out = TempDir::new().unwrap();
        let relay = relay(&out);
        // Hold the session's slot directly.
        let request = TransferRequest::new("chat-1", SourceDescriptor::Handle("x".into()));
        let _held = relay.registry().admit(&request).unwrap();

        let err = relay.submit(request).unwrap_err();
        assert!(matches!(err, AdmitError::AlreadyActive { .. }));
        assert!(!relay.cancel("chat-2"));
        assert!(relay.cancel("chat-1"));
    }

    struct NoSinks;

    impl SinkProvider for NoSinks {
        fn sink_for<'a>(
            &'a self,
            session: &'a str,
        ) -> BoxFuture<'a, Result<Arc<dyn Sink>, TransferError>> {
            Box::pin(async move {
                Err(TransferError::SinkUnreachable(format!(
                    "no storage linked for {session}"
                )))
            })
        }
    }

    #[tokio::test]
    async fn missing_sink_fails_fast_and_releases() {
        let engine = TransferEngine::new(
            Arc::new(FileSource::default()),
            Arc::new(NullNotifier),
            TransferConfig::default(),
        );
        let relay = Relay::new(engine, Arc::new(NoSinks));

        let result = relay
            .submit(TransferRequest::new(
                "chat-1",
                SourceDescriptor::Handle("/nonexistent".into()),
            ))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(
            result.outcome.unwrap_err().kind(),
            ErrorKind::SinkUnreachable
        );
        assert!(relay.registry().is_empty());
    }

    /// Never resolves a sink.
    struct PendingSinks;

    impl SinkProvider for PendingSinks {
        fn sink_for<'a>(
            &'a self,
            _session: &'a str,
        ) -> BoxFuture<'a, Result<Arc<dyn Sink>, TransferError>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test]
    async fn cancel_while_resolving_storage() {
        let engine = TransferEngine::new(
            Arc::new(FileSource::default()),
            Arc::new(NullNotifier),
            TransferConfig::default(),
        );
        let relay = Relay::new(engine, Arc::new(PendingSinks));

        let handle = relay
            .submit(TransferRequest::new(
                "chat-1",
                SourceDescriptor::Handle("/nonexistent".into()),
            ))
            .unwrap();
        tokio::task::yield_now().await;
        assert!(relay.cancel("chat-1"));

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("cancel did not stop the storage lookup")
            .unwrap();

        assert!(result.is_cancelled());
        assert_eq!(result.phase(), Phase::Cancelled);
        assert!(relay.registry().is_empty());
    }
}
