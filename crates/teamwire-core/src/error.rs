use teamwire_media::EngineError;
use teamwire_util::validation::ValidationError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl CoreError {
    /// Stable code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unauthenticated => "unauthenticated",
            CoreError::Authorization(_) => "authorization_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::State(_) => "state_error",
            CoreError::Timeout(_) => "timeout",
            CoreError::BadRequest(_) => "bad_request",
            CoreError::Collaborator(_) => "collaborator_error",
        }
    }

    /// Whether an idempotent read may be retried after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::Timeout(_) | CoreError::Collaborator(_))
    }
}

impl From<ValidationError> for CoreError {
    fn from(err: ValidationError) -> Self {
        CoreError::BadRequest(err.to_string())
    }
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Rejected(msg) => CoreError::BadRequest(msg),
            EngineError::Unavailable(msg) => CoreError::Collaborator(msg),
        }
    }
}
