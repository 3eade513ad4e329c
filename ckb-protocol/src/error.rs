use thiserror::Error;

/// The error taxonomy shared by every component of the refresh core.
///
/// Each variant maps to one of the kinds named in the daemon's error-handling
/// design: callers match on `kind()` rather than string-matching `Display`
/// output.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The operation does not apply here (e.g. watching a non-git directory).
    /// Callers should treat this as "silently skip", never surface it as a
    /// failure.
    #[error("not applicable: {0}")]
    NotApplicable(String),

    /// A lock or PID file is already held by someone else.
    #[error("contention: {0}")]
    Contention(String),

    /// Malformed config, schedule expression, or metadata.
    #[error("parse error: {0}")]
    Parse(String),

    /// A git, indexer, or HTTP call failed.
    #[error("external error: {0}")]
    External(String),

    /// The caller's context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// An invariant was violated (unknown task type, impossible state).
    /// Never fatal — log and skip.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotApplicable,
    Contention,
    Parse,
    External,
    Cancelled,
    Internal,
    Io,
    Serde,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotApplicable(_) => ErrorKind::NotApplicable,
            CoreError::Contention(_) => ErrorKind::Contention,
            CoreError::Parse(_) => ErrorKind::Parse,
            CoreError::External(_) => ErrorKind::External,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Internal(_) => ErrorKind::Internal,
            CoreError::Io(_) => ErrorKind::Io,
            CoreError::Serde(_) => ErrorKind::Serde,
        }
    }

    pub fn cancelled() -> Self {
        CoreError::Cancelled
    }

    pub fn contention(message: impl Into<String>) -> Self {
        CoreError::Contention(message.into())
    }

    pub fn external(message: impl Into<String>) -> Self {
        CoreError::External(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CoreError::Internal(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        CoreError::Parse(message.into())
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
