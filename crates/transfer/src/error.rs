//! Error taxonomy for the transfer pipeline.

use std::time::Duration;

use serde::Serialize;

/// Classification of a transfer failure.
///
/// `SizeUnknown` and `NotificationFailed` never terminate a transfer; they
/// exist so that degraded paths can be logged with the same vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnreachable,
    SourceRejected,
    SizeUnknown,
    SinkUnreachable,
    SinkRejected,
    Cancelled,
    RetriesExhausted,
    NotificationFailed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::SourceUnreachable => "source_unreachable",
            ErrorKind::SourceRejected => "source_rejected",
            ErrorKind::SizeUnknown => "size_unknown",
            ErrorKind::SinkUnreachable => "sink_unreachable",
            ErrorKind::SinkRejected => "sink_rejected",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::NotificationFailed => "notification_failed",
        };
        f.write_str(s)
    }
}

/// Errors produced by a transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("source rejected the request: {0}")]
    SourceRejected(String),

    #[error("storage unreachable: {0}")]
    SinkUnreachable(String),

    #[error("storage rejected the upload: {0}")]
    SinkRejected(String),

    #[error("cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransferError>,
    },
}

impl TransferError {
    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::SourceUnreachable(_) => ErrorKind::SourceUnreachable,
            TransferError::SourceRejected(_) => ErrorKind::SourceRejected,
            TransferError::SinkUnreachable(_) => ErrorKind::SinkUnreachable,
            TransferError::SinkRejected(_) => ErrorKind::SinkRejected,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
        }
    }

    /// Returns `true` for failures the retry policy may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::SourceUnreachable(_) | TransferError::SinkUnreachable(_)
        )
    }

    /// For `RetriesExhausted`, the kind of the last underlying failure.
    /// For every other error, its own kind.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            TransferError::RetriesExhausted { last, .. } => last.root_kind(),
            other => other.kind(),
        }
    }

    /// Maps a local I/O error raised while writing to storage.
    pub fn from_sink_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::PermissionDenied | Io::StorageFull | Io::ReadOnlyFilesystem => {
                TransferError::SinkRejected(err.to_string())
            }
            _ => TransferError::SinkUnreachable(err.to_string()),
        }
    }

    /// Maps a local I/O error raised while reading a source.
    pub fn from_source_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::NotFound | Io::PermissionDenied | Io::IsADirectory => {
                TransferError::SourceRejected(err.to_string())
            }
            _ => TransferError::SourceUnreachable(err.to_string()),
        }
    }
}

/// Returned by the registry when a session already has a running transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    #[error("session {session} already has an active transfer ({transfer_id})")]
    AlreadyActive { session: String, transfer_id: String },
}

/// Failures of the notification channel. Never fatal to a transfer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("notification failed: {0}")]
    Failed(String),
}

impl NotifyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NotificationFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(TransferError::SourceUnreachable("dns".into()).is_transient());
        assert!(TransferError::SinkUnreachable("reset".into()).is_transient());
        assert!(!TransferError::SourceRejected("404".into()).is_transient());
        assert!(!TransferError::SinkRejected("quota".into()).is_transient());
        assert!(!TransferError::Cancelled.is_transient());
    }

    #[test]
    fn retries_exhausted_keeps_last_kind() {
        let err = TransferError::RetriesExhausted {
            attempts: 3,
            last: Box::new(TransferError::SinkUnreachable("timeout".into())),
        };
        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert_eq!(err.root_kind(), ErrorKind::SinkUnreachable);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn sink_io_mapping() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(
            TransferError::from_sink_io(&denied).kind(),
            ErrorKind::SinkRejected
        );
        let broken = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert_eq!(
            TransferError::from_sink_io(&broken).kind(),
            ErrorKind::SinkUnreachable
        );
    }

    #[test]
    fn source_io_mapping() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(
            TransferError::from_source_io(&missing).kind(),
            ErrorKind::SourceRejected
        );
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(
            TransferError::from_source_io(&reset).kind(),
            ErrorKind::SourceUnreachable
        );
    }

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::SourceRejected.to_string(), "source_rejected");
        assert_eq!(ErrorKind::RetriesExhausted.to_string(), "retries_exhausted");
    }
}
