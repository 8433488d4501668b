use thiserror::Error;

/// Per-request failures, surfaced to callers as serving status codes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("internal: {0}")]
    Internal(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

impl ServeError {
    pub fn code(&self) -> StatusCode {
        match self {
            ServeError::InvalidArgument(_) => StatusCode::InvalidArgument,
            ServeError::NotFound(_) => StatusCode::NotFound,
            ServeError::Unavailable(_) => StatusCode::Unavailable,
            ServeError::DeadlineExceeded(_) => StatusCode::DeadlineExceeded,
            ServeError::Internal(_) => StatusCode::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ServeError::InvalidArgument(m)
            | ServeError::NotFound(m)
            | ServeError::Unavailable(m)
            | ServeError::DeadlineExceeded(m)
            | ServeError::Internal(m) => m,
        }
    }
}
