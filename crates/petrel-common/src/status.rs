// Status codes shared by every entry point. Nothing in the public API panics;
// failures are carried as a `Status` value.
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    NotFound,
    InvalidArgument,
    IoError,
    TimedOut,
    NotInitialized,
    QueueFull,
    InternalError,
}

/// Outcome of an operation, a code plus an optional human-readable detail.
///
/// ```
/// use petrel_common::Status;
///
/// let st = Status::ok();
/// assert!(st.is_ok());
/// let st = Status::invalid_argument("namespace is reserved");
/// assert!(!st.is_ok());
/// assert_eq!(st.to_string(), "InvalidArgument: namespace is reserved");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: Option<String>,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: Some(message.into()),
        }
    }

    pub fn ok() -> Self {
        Status {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::IoError, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TimedOut, message)
    }

    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotInitialized, message)
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(StatusCode::QueueFull, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalError, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{:?}: {message}", self.code),
            None => write!(f, "{:?}", self.code),
        }
    }
}

impl std::error::Error for Status {}
