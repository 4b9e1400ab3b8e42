//! Error taxonomy shared by every metabase operation.

use thiserror::Error;
use uuid::Uuid;

use crate::models::SegmentPosition;

/// Coarse classification used by callers to decide whether to retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Referenced object or segment is absent or in the wrong status.
    NotFound,
    /// Uniqueness or idempotency violation.
    Conflict,
    /// Request rejected before touching the store.
    Invalid,
    /// Referential integrity is broken. Never retried.
    InvariantViolation,
    /// Store connectivity or timeout; safe to retry the whole call.
    Transient,
    /// Caller cancelled the operation.
    Canceled,
    /// Anything else reported by the store.
    Internal,
}

#[derive(Debug, Error)]
pub enum MetabaseError {
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("pending object not found for stream {0}")]
    PendingObjectNotFound(Uuid),
    #[error("segment {position} not found in stream {stream_id}")]
    SegmentNotFound {
        stream_id: Uuid,
        position: SegmentPosition,
    },
    #[error("object already exists: {0}")]
    ObjectAlreadyExists(String),
    #[error("segment {position} already exists in stream {stream_id}")]
    SegmentAlreadyExists {
        stream_id: Uuid,
        position: SegmentPosition,
    },
    #[error("segment {position} in stream {stream_id} already committed with different content")]
    SegmentConflict {
        stream_id: Uuid,
        position: SegmentPosition,
    },
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("referential integrity violated: {0}")]
    InvariantViolation(String),
    #[error("operation canceled")]
    Canceled,
    #[error(
        "purge batch {batch} failed after deleting {deleted_objects} objects and {deleted_segments} segments: {source}"
    )]
    BatchFailed {
        batch: u64,
        deleted_objects: u64,
        deleted_segments: u64,
        #[source]
        source: Box<MetabaseError>,
    },
    #[error("unknown database {0}")]
    UnknownDatabase(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("{0}")]
    Multiple(MultiError),
}

pub type MetabaseResult<T> = Result<T, MetabaseError>;

impl MetabaseError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ObjectNotFound(_)
            | Self::PendingObjectNotFound(_)
            | Self::SegmentNotFound { .. } => ErrorKind::NotFound,
            Self::ObjectAlreadyExists(_)
            | Self::SegmentAlreadyExists { .. }
            | Self::SegmentConflict { .. } => ErrorKind::Conflict,
            Self::Invalid(_) | Self::UnknownDatabase(_) => ErrorKind::Invalid,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::Canceled => ErrorKind::Canceled,
            Self::BatchFailed { source, .. } => source.kind(),
            Self::Sqlx(err) => classify_sqlx(err),
            Self::Multiple(errors) => errors.kind(),
        }
    }

    /// Transient failures may be retried by re-invoking the operation.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Several independent failures, e.g. one per configured database.
#[derive(Debug, Default)]
pub struct MultiError(pub Vec<MetabaseError>);

impl MultiError {
    /// Most severe kind among the collected errors.
    fn kind(&self) -> ErrorKind {
        let kinds: Vec<ErrorKind> = self.0.iter().map(MetabaseError::kind).collect();
        [
            ErrorKind::InvariantViolation,
            ErrorKind::Internal,
            ErrorKind::Transient,
        ]
        .into_iter()
        .find(|k| kinds.contains(k))
        .or_else(|| kinds.first().copied())
        .unwrap_or(ErrorKind::Internal)
    }

    /// Collapse into a single result: `Ok` when empty, the lone error when
    /// there is one.
    pub fn into_result(mut self) -> MetabaseResult<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(MetabaseError::Multiple(self)),
        }
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", messages.join("; "))
    }
}

fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ErrorKind::Transient
        }
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_ascii_lowercase();
            if message.contains("foreign key") {
                ErrorKind::InvariantViolation
            } else if message.contains("locked") || message.contains("busy") {
                ErrorKind::Transient
            } else if message.contains("unique") {
                ErrorKind::Conflict
            } else {
                ErrorKind::Internal
            }
        }
        _ => ErrorKind::Internal,
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
