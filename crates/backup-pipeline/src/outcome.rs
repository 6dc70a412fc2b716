use std::fmt;
use std::time::Duration;

/// Result of checking a freshly exported artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Success,
    /// The artifact could not be read back. Local and transient.
    ReadError(String),
    /// The artifact is unsound. Retrying the same export reproduces it.
    ValidationError(String),
}

/// Result of a call into the remote archive service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome<T> {
    Success(T),
    NetworkError(String),
    StatusError(u16, String),
    AppError(String),
}

impl<T> RemoteOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RemoteOutcome<U> {
        match self {
            Self::Success(v) => RemoteOutcome::Success(f(v)),
            Self::NetworkError(c) => RemoteOutcome::NetworkError(c),
            Self::StatusError(code, c) => RemoteOutcome::StatusError(code, c),
            Self::AppError(c) => RemoteOutcome::AppError(c),
        }
    }
}

/// What the scheduler should do after one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Retry(Duration),
    Failure,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Retry(b) => write!(f, "retry (backoff {}s)", b.as_secs()),
            Self::Failure => write!(f, "failure"),
        }
    }
}
