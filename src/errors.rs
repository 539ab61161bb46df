// Error types for the lookup path and the bounded dispatcher
// "not found" is not an error anywhere in this crate: lookups return Ok(None).

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("dispatcher is shut down; submission rejected")]
    ShutDown,
    #[error("dispatcher worker dropped the job before completing it")]
    WorkerLost,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    /// Rejected by admission control before any work started.
    #[error("Server is at capacity; try again later")]
    Overloaded,
}

impl LookupError {
    /// Fixed machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            LookupError::Backend(_) | LookupError::Dispatch(_) => "BACKEND_ERROR",
            LookupError::Overloaded => "SERVICE_OVERLOADED",
        }
    }
}

/// JSON body for every HTTP error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

impl From<&LookupError> for ErrorResponse {
    fn from(err: &LookupError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl ErrorResponse {
    pub fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }
}
