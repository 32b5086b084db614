use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
        }
    }

    /// Whether a server error with this code will fail again if retried.
    ///
    /// Unauthenticated is transient because the stream refreshes the token before retrying.
    pub fn is_permanent(&self) -> bool {
        !matches!(
            self,
            FirestoreErrorCode::Cancelled
                | FirestoreErrorCode::Unknown
                | FirestoreErrorCode::DeadlineExceeded
                | FirestoreErrorCode::ResourceExhausted
                | FirestoreErrorCode::Internal
                | FirestoreErrorCode::Unavailable
                | FirestoreErrorCode::Unauthenticated
        )
    }

    /// Permanent errors that reject a write. Aborted writes are retried.
    pub fn is_permanent_write_error(&self) -> bool {
        self.is_permanent() && *self != FirestoreErrorCode::Aborted
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.code.is_permanent()
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}
