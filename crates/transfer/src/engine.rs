//! The transfer state machine.
//!
//! One [`TransferEngine::run`] call drives one admitted transfer from
//! `Pending` to a terminal phase. Within a transfer the download and upload
//! halves run concurrently over a bounded channel, so chunk N can be written
//! to the sink while chunk N+1 is being read.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TransferConfig;
use crate::error::{ErrorKind, TransferError};
use crate::naming::resolve_name;
use crate::progress::{Notifier, ProgressReporter, SpeedCalculator};
use crate::registry::Admission;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sink::{Sink, UploadSession};
use crate::source::{OpenedSource, Source};
use crate::types::{
    Phase, ProgressEvent, StoredFile, TransferRequest, TransferResult, TransferState, percent_of,
};

/// Runs transfers from a source to a sink.
pub struct TransferEngine {
    source: Arc<dyn Source>,
    notifier: Arc<dyn Notifier>,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(source: Arc<dyn Source>, notifier: Arc<dyn Notifier>, config: TransferConfig) -> Self {
        Self {
            source,
            notifier,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Drives one admitted transfer to completion.
    ///
    /// Always returns exactly one result. The registry slot held by
    /// `admission` is released before this returns.
    pub async fn run(
        &self,
        admission: Admission,
        request: TransferRequest,
        sink: Arc<dyn Sink>,
    ) -> TransferResult {
        let state = Arc::clone(admission.state());
        let mut reporter = ProgressReporter::spawn(
            Arc::clone(&self.notifier),
            request.status_target().to_string(),
            state.id().to_string(),
            self.config.progress_interval,
            self.config.progress_queue,
        );

        let run = Run {
            engine: self,
            state: &state,
            request: &request,
            sink: sink.as_ref(),
            reporter: &mut reporter,
            cancel: state.cancel_token(),
            name: String::new(),
            session: None,
            hasher: Sha256::new(),
            speed: SpeedCalculator::default(),
            next_byte_step: self.config.unknown_size_step,
            size_warned: false,
        };
        let outcome = run.execute().await;

        let result = TransferResult {
            transfer_id: state.id().to_string(),
            session: state.session().to_string(),
            bytes_moved: state.bytes_moved(),
            elapsed: state.elapsed(),
            outcome,
        };
        state.set_phase(result.phase());
        match &result.outcome {
            Ok(file) => info!(
                transfer = %result.transfer_id,
                session = %result.session,
                name = %file.name,
                bytes = file.bytes,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "transfer completed"
            ),
            Err(TransferError::Cancelled) => info!(
                transfer = %result.transfer_id,
                session = %result.session,
                bytes = result.bytes_moved,
                "transfer cancelled"
            ),
            Err(e) => error!(
                transfer = %result.transfer_id,
                session = %result.session,
                kind = %e.root_kind(),
                error = %e,
                "transfer failed"
            ),
        }

        drop(admission);
        reporter.info(result.summary());
        reporter.flush(self.config.progress_flush_timeout).await;
        result
    }
}

/// Why a pass over the pipeline stopped early.
#[derive(Debug)]
enum Interrupt {
    Source(TransferError),
    Sink(TransferError),
    Cancelled,
}

/// Mutable context of one running transfer.
struct Run<'a> {
    engine: &'a TransferEngine,
    state: &'a TransferState,
    request: &'a TransferRequest,
    sink: &'a dyn Sink,
    reporter: &'a mut ProgressReporter,
    cancel: CancellationToken,
    name: String,
    /// Live sink session, kept across source retries.
    session: Option<Box<dyn UploadSession>>,
    /// Digest of the bytes the current session accepted.
    hasher: Sha256,
    speed: SpeedCalculator,
    next_byte_step: u64,
    size_warned: bool,
}

impl Run<'_> {
    async fn execute(mut self) -> Result<StoredFile, TransferError> {
        let outcome = self.transfer().await;
        if outcome.is_err()
            && let Some(session) = self.session.take()
        {
            session.abort().await;
            debug!(transfer = %self.state.id(), "upload session aborted");
        }
        // Cancellation wins over whatever else went wrong.
        match outcome {
            Err(_) if self.cancel.is_cancelled() => Err(TransferError::Cancelled),
            other => other,
        }
    }

    async fn transfer(&mut self) -> Result<StoredFile, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.enter_phase(Phase::Downloading);
        self.reporter.info("Fetching file details...");

        let lookup_deadline = Instant::now() + self.engine.config.download_timeout;
        let meta = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            looked_up = tokio::time::timeout_at(lookup_deadline, self.engine.source.probe(&self.request.source)) => match looked_up {
                Ok(Ok(meta)) => meta,
                Ok(Err(e)) => {
                    debug!(transfer = %self.state.id(), error = %e, "probe failed, continuing without metadata");
                    Default::default()
                }
                Err(_) => {
                    warn!(transfer = %self.state.id(), "metadata lookup timed out, continuing without it");
                    Default::default()
                }
            },
        };
        if let Some(total) = meta.total_bytes.or(self.request.total_size_hint) {
            self.state.set_total_bytes(Some(total));
        }
        self.name = resolve_name(
            self.request.desired_name.as_deref(),
            meta.suggested_name.as_deref(),
            &self.request.source,
            self.state.id(),
        )?;
        self.reporter.set_name(&self.name);
        self.reporter.info(format!("Uploading {}...", self.name));

        let policy = self.engine.config.retry.clone();
        let mut download_attempt = self.state.begin_download_attempt();
        let mut upload_attempt = self.state.begin_upload_attempt();

        loop {
            let interrupt = match self.pass().await {
                Ok(reference) => return Ok(self.complete(reference)),
                Err(interrupt) => interrupt,
            };

            let (attempt, err, from_sink) = match interrupt {
                Interrupt::Cancelled => return Err(TransferError::Cancelled),
                Interrupt::Source(err) => (download_attempt, err, false),
                Interrupt::Sink(err) => (upload_attempt, err, true),
            };

            let delay = match policy.decide(attempt, err.clone()) {
                RetryDecision::Retry { delay } => delay,
                RetryDecision::GiveUp(e) => return Err(e),
            };
            warn!(
                transfer = %self.state.id(),
                attempt,
                max_attempts = policy.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "transfer attempt failed, retrying"
            );

            if from_sink {
                self.recover_session().await;
            }
            RetryPolicy::wait(delay, &self.cancel).await?;

            if from_sink {
                upload_attempt = self.state.begin_upload_attempt();
            } else {
                download_attempt = self.state.begin_download_attempt();
            }
        }
    }

    /// After a transient sink failure: keep a resumable session, otherwise
    /// throw it away so the next pass starts over at byte zero.
    async fn recover_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.is_resumable() {
            debug!(transfer = %self.state.id(), confirmed = session.confirmed_bytes(), "resuming upload session");
            self.session = Some(session);
            return;
        }
        session.abort().await;
        self.hasher = Sha256::new();
        self.speed.reset();
        debug!(transfer = %self.state.id(), "upload session discarded, restarting from zero");
    }

    /// Runs the pipeline once, from the session's confirmed offset to
    /// finalize. Returns the sink reference.
    async fn pass(&mut self) -> Result<String, Interrupt> {
        self.enter_phase(Phase::Downloading);
        let engine = self.engine;
        let config = &engine.config;
        let download_deadline = Instant::now() + config.download_timeout;
        let upload_deadline = Instant::now() + config.upload_timeout;
        let offset = self.session.as_ref().map_or(0, |s| s.confirmed_bytes());

        let opened = self.open_source(offset, download_deadline).await?;
        if opened.offset > offset {
            return Err(Interrupt::Source(TransferError::SourceRejected(format!(
                "source resumed at byte {} instead of {offset}",
                opened.offset
            ))));
        }
        if self.state.total_bytes().is_none()
            && let Some(total) = opened.total_bytes
        {
            self.state.set_total_bytes(Some(total));
        }
        if self.state.total_bytes().is_none() && !self.size_warned {
            self.size_warned = true;
            warn!(
                transfer = %self.state.id(),
                kind = %ErrorKind::SizeUnknown,
                "total size unknown, reporting progress in bytes"
            );
        }

        if self.session.is_none() {
            self.begin_session(upload_deadline).await?;
        }

        let skip = offset - opened.offset;
        if skip > 0 {
            debug!(transfer = %self.state.id(), skip, "source restarted from zero, discarding confirmed prefix");
        }

        let (tx, rx) = mpsc::channel::<Bytes>(config.buffer_chunks);
        let download = download_half(
            opened,
            skip,
            config.chunk_size,
            download_deadline,
            &self.cancel,
            self.state,
            tx,
        );
        let Some(session) = self.session.as_mut() else {
            return Err(Interrupt::Sink(TransferError::SinkUnreachable(
                "no upload session".into(),
            )));
        };
        let upload = upload_half(
            UploadHalf {
                session,
                hasher: &mut self.hasher,
                speed: &mut self.speed,
                reporter: &mut *self.reporter,
                state: self.state,
                cancel: &self.cancel,
                deadline: upload_deadline,
                next_byte_step: &mut self.next_byte_step,
                byte_step: config.unknown_size_step,
            },
            rx,
        );

        let (down, up) = tokio::join!(download, upload);
        match (down, up) {
            (Err(Interrupt::Cancelled), _) | (_, Err(Interrupt::Cancelled)) => {
                return Err(Interrupt::Cancelled);
            }
            (_, Err(e)) | (Err(e), Ok(())) => return Err(e),
            (Ok(()), Ok(())) => {}
        }

        let confirmed = self.session.as_ref().map_or(0, |s| s.confirmed_bytes());
        match self.state.total_bytes() {
            Some(total) if confirmed < total => {
                return Err(Interrupt::Source(TransferError::SourceUnreachable(format!(
                    "source ended after {confirmed} of {total} bytes"
                ))));
            }
            Some(_) => {}
            None => self.state.set_total_bytes(Some(confirmed)),
        }

        self.finalize(upload_deadline).await
    }

    async fn open_source(&mut self, offset: u64, deadline: Instant) -> Result<OpenedSource, Interrupt> {
        debug!(transfer = %self.state.id(), offset, "opening source");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            opened = tokio::time::timeout_at(deadline, self.engine.source.open(&self.request.source, offset)) => match opened {
                Ok(Ok(opened)) => Ok(opened),
                Ok(Err(e)) => Err(Interrupt::Source(e)),
                Err(_) => Err(Interrupt::Source(TransferError::SourceUnreachable(
                    "timed out opening source".into(),
                ))),
            },
        }
    }

    async fn begin_session(&mut self, deadline: Instant) -> Result<(), Interrupt> {
        let total = self.state.total_bytes();
        let begun = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Interrupt::Cancelled),
            begun = tokio::time::timeout_at(deadline, self.sink.begin_upload(&self.name, total)) => begun,
        };
        match begun {
            Ok(Ok(session)) => {
                self.hasher = Sha256::new();
                self.session = Some(session);
                debug!(transfer = %self.state.id(), name = %self.name, "upload session started");
                Ok(())
            }
            Ok(Err(e)) => Err(Interrupt::Sink(e)),
            Err(_) => Err(Interrupt::Sink(TransferError::SinkUnreachable(
                "timed out starting upload".into(),
            ))),
        }
    }

    async fn finalize(&mut self, deadline: Instant) -> Result<String, Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        let Some(session) = self.session.take() else {
            return Err(Interrupt::Sink(TransferError::SinkUnreachable(
                "no upload session".into(),
            )));
        };
        let confirmed = session.confirmed_bytes();
        // Once started, a commit is not interrupted by cancellation.
        match tokio::time::timeout_at(deadline, session.finalize()).await {
            Ok(Ok(reference)) => {
                debug!(transfer = %self.state.id(), bytes = confirmed, "upload finalized");
                Ok(reference)
            }
            Ok(Err(e)) => {
                self.hasher = Sha256::new();
                Err(Interrupt::Sink(e))
            }
            Err(_) => {
                self.hasher = Sha256::new();
                Err(Interrupt::Sink(TransferError::SinkUnreachable(
                    "timed out finalizing upload".into(),
                )))
            }
        }
    }

    fn complete(&mut self, reference: String) -> StoredFile {
        let bytes = self.state.bytes_moved();
        let total = self.state.total_bytes().unwrap_or(bytes);
        self.enter_phase(Phase::Uploading);
        self.state.set_last_progress_percent(100);
        self.reporter.report(ProgressEvent {
            transfer_id: self.state.id().to_string(),
            phase: Phase::Uploading,
            percent: Some(100),
            bytes_moved: bytes,
            total_bytes: Some(total),
            bytes_per_second: self.speed.bytes_per_second(),
        });

        let digest = std::mem::take(&mut self.hasher).finalize();
        StoredFile {
            reference,
            name: std::mem::take(&mut self.name),
            bytes,
            sha256: hex::encode(digest),
        }
    }

    fn enter_phase(&self, phase: Phase) {
        if self.state.phase() != phase {
            self.state.set_phase(phase);
            info!(transfer = %self.state.id(), session = %self.state.session(), %phase, "phase changed");
        }
    }
}

/// Pulls from the source and feeds `tx`.
///
/// A closed receiver means the upload half failed; its error is the one
/// reported, so this half returns `Ok` without waiting on the source.
async fn download_half(
    opened: OpenedSource,
    mut skip: u64,
    chunk_size: usize,
    deadline: Instant,
    cancel: &CancellationToken,
    state: &TransferState,
    tx: mpsc::Sender<Bytes>,
) -> Result<(), Interrupt> {
    let mut stream = opened.stream;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            _ = tx.closed() => return Ok(()),
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };
        let mut bytes = match next {
            Err(_) => {
                return Err(Interrupt::Source(TransferError::SourceUnreachable(
                    "download timed out".into(),
                )));
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(Interrupt::Source(e)),
            Ok(Some(Ok(bytes))) => bytes,
        };

        if skip > 0 {
            let n = skip.min(bytes.len() as u64) as usize;
            let _ = bytes.split_to(n);
            skip -= n as u64;
        }
        while !bytes.is_empty() {
            let piece = bytes.split_to(chunk_size.min(bytes.len()));
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
                sent = tx.send(piece) => sent,
            };
            if sent.is_err() {
                return Ok(());
            }
        }
    }

    if skip > 0 {
        return Err(Interrupt::Source(TransferError::SourceUnreachable(format!(
            "source ended {skip} bytes before the resume offset"
        ))));
    }
    if state.phase() != Phase::Uploading {
        state.set_phase(Phase::Uploading);
        info!(transfer = %state.id(), session = %state.session(), phase = %Phase::Uploading, "phase changed");
    }
    Ok(())
}

struct UploadHalf<'a> {
    session: &'a mut Box<dyn UploadSession>,
    hasher: &'a mut Sha256,
    speed: &'a mut SpeedCalculator,
    reporter: &'a mut ProgressReporter,
    state: &'a TransferState,
    cancel: &'a CancellationToken,
    deadline: Instant,
    next_byte_step: &'a mut u64,
    byte_step: u64,
}

/// Drains `rx` into the sink session, recording progress per accepted write.
async fn upload_half(mut half: UploadHalf<'_>, mut rx: mpsc::Receiver<Bytes>) -> Result<(), Interrupt> {
    while let Some(chunk) = rx.recv().await {
        if half.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        let confirmed = half.session.confirmed_bytes();
        if let Some(total) = half.state.total_bytes()
            && confirmed + chunk.len() as u64 > total
        {
            return Err(Interrupt::Source(TransferError::SourceRejected(format!(
                "source delivered more than the advertised {total} bytes"
            ))));
        }

        let mut rest: &[u8] = &chunk;
        while !rest.is_empty() {
            let written = tokio::select! {
                biased;
                _ = half.cancel.cancelled() => return Err(Interrupt::Cancelled),
                written = tokio::time::timeout_at(half.deadline, half.session.write(rest)) => written,
            };
            let accepted = match written {
                Ok(Ok(0)) => {
                    return Err(Interrupt::Sink(TransferError::SinkUnreachable(
                        "storage accepted no bytes".into(),
                    )));
                }
                Ok(Ok(n)) => n.min(rest.len()),
                Ok(Err(e)) => return Err(Interrupt::Sink(e)),
                Err(_) => {
                    return Err(Interrupt::Sink(TransferError::SinkUnreachable(
                        "upload timed out".into(),
                    )));
                }
            };
            half.hasher.update(&rest[..accepted]);
            rest = &rest[accepted..];

            let moved = half.state.record_confirmed(half.session.confirmed_bytes());
            half.speed.add_sample(accepted as u64);
            report_progress(&mut half, moved);
        }
    }
    Ok(())
}

/// Emits one event per crossed 10% boundary, or per `byte_step` bytes when
/// the size is unknown. 100% is left for after finalize.
fn report_progress(half: &mut UploadHalf<'_>, moved: u64) {
    let state = half.state;
    let event = |percent: Option<u8>| ProgressEvent {
        transfer_id: state.id().to_string(),
        phase: state.phase(),
        percent,
        bytes_moved: moved,
        total_bytes: state.total_bytes(),
        bytes_per_second: half.speed.bytes_per_second(),
    };

    match state.total_bytes() {
        Some(total) => {
            let reached = (percent_of(moved, total) / 10 * 10).min(90);
            let mut boundary = state.last_progress_percent().unwrap_or(0) + 10;
            let mut events = Vec::new();
            while boundary <= reached {
                state.set_last_progress_percent(boundary);
                events.push(event(Some(boundary)));
                boundary += 10;
            }
            for e in events {
                half.reporter.report(e);
            }
        }
        None => {
            if moved >= *half.next_byte_step {
                let e = event(None);
                half.reporter.report(e);
                *half.next_byte_step = (moved / half.byte_step + 1) * half.byte_step;
            }
        }
    }
}
