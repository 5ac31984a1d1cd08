use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Retryable after dropping the oldest history.
    #[error("{0}")]
    ContextLengthExceeded(String),

    #[error("{message}")]
    Unknown { status: Option<u16>, message: String },

    #[error("malformed stream frame: {detail}")]
    MalformedFrame { detail: String },

    #[error("invalid endpoint url `{url}`: {reason}")]
    InvalidEndpoint { url: String, reason: String },
}

impl ProviderError {
    pub fn unknown(message: impl Into<String>) -> Self {
        ProviderError::Unknown {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_context_length_exceeded(&self) -> bool {
        matches!(self, ProviderError::ContextLengthExceeded(_))
    }

    /// Stable code used in observability events.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::ContextLengthExceeded(_) => "CONTEXT_LENGTH_EXCEEDED",
            ProviderError::Unknown {
                status: Some(401 | 403),
                ..
            } => "AUTHENTICATION_ERROR",
            ProviderError::Unknown {
                status: Some(429), ..
            } => "RATE_LIMIT_EXCEEDED",
            ProviderError::Unknown {
                status: Some(500..=599),
                ..
            } => "PROVIDER_SERVER_ERROR",
            ProviderError::Unknown { .. } => "PROVIDER_REQUEST_FAILED",
            ProviderError::MalformedFrame { .. } => "MALFORMED_FRAME",
            ProviderError::InvalidEndpoint { .. } => "INVALID_ENDPOINT",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProviderError::unknown(format!("request timed out: {err}"));
        }
        ProviderError::Unknown {
            status: err.status().map(|status| status.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Maps a 4xx/5xx body to a typed error. Non-JSON bodies keep their raw text.
pub fn classify_error_body(status: u16, body: &str) -> ProviderError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    if let Some(error) = parsed.as_ref().and_then(|value| value.get("error")) {
        return classify_error_object(Some(status), error);
    }
    let trimmed = body.trim();
    let message = if trimmed.is_empty() {
        format!("provider request failed with status {status}")
    } else {
        truncate_for_error(trimmed, 500)
    };
    ProviderError::Unknown {
        status: Some(status),
        message,
    }
}

/// `{message, code|type, param?}` as sent by OpenAI-compatible providers.
pub fn classify_error_object(status: Option<u16>, error: &Value) -> ProviderError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("provider reported an error without a message")
        .to_string();
    let code = error.get("code").and_then(Value::as_str);
    let kind = error.get("type").and_then(Value::as_str);
    let param = error.get("param").and_then(Value::as_str);

    let context_exceeded = code == Some("context_length_exceeded")
        || (kind == Some("invalid_request_error") && param == Some("max_tokens"));
    if context_exceeded {
        ProviderError::ContextLengthExceeded(message)
    } else {
        ProviderError::Unknown { status, message }
    }
}

pub(crate) fn truncate_for_error(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        None => input.to_string(),
        Some((cut, _)) => format!("{}...", &input[..cut]),
    }
}
