use scribe_providers::ProviderError;
use thiserror::Error;

use crate::storage::StoreError;

/// Terminal outcome of a session. `ContextLengthExceeded` only surfaces when
/// truncation was declined or impossible.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    WrongUserInput(String),

    #[error("{0}")]
    ContextLengthExceeded(String),

    #[error("{0}")]
    UnknownProvider(String),

    #[error("{0}")]
    MalformedStream(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session task stopped unexpectedly: {0}")]
    TaskFailed(String),
}

impl SessionError {
    /// Short heading shown next to the verbatim provider message.
    pub fn title(&self) -> &'static str {
        match self {
            SessionError::WrongUserInput(_) => "Wrong input",
            SessionError::ContextLengthExceeded(_) => "Context length exceeded",
            SessionError::UnknownProvider(_) => "Provider error",
            SessionError::MalformedStream(_) => "Malformed response",
            SessionError::Store(_) => "History unavailable",
            SessionError::TaskFailed(_) => "Session failed",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SessionError::WrongUserInput(_) => "WRONG_USER_INPUT",
            SessionError::ContextLengthExceeded(_) => "CONTEXT_LENGTH_EXCEEDED",
            SessionError::UnknownProvider(_) => "PROVIDER_REQUEST_FAILED",
            SessionError::MalformedStream(_) => "MALFORMED_FRAME",
            SessionError::Store(_) => "STORE_ERROR",
            SessionError::TaskFailed(_) => "SESSION_TASK_FAILED",
        }
    }
}

impl From<ProviderError> for SessionError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ContextLengthExceeded(message) => {
                SessionError::ContextLengthExceeded(message)
            }
            ProviderError::Unknown { message, .. } => SessionError::UnknownProvider(message),
            ProviderError::MalformedFrame { .. } => SessionError::MalformedStream(err.to_string()),
            ProviderError::InvalidEndpoint { .. } => SessionError::WrongUserInput(err.to_string()),
        }
    }
}
