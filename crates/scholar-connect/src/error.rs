// Scholar API error taxonomy
use serde_json::Value;
use thiserror::Error;

/// Every failure the connectivity layer can surface. Layers above the request
/// executor only ever see this type, never raw transport errors.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Backend-classified error following the `{code, message, details}`
    /// contract. Authoritative; never retried.
    #[error("{message}")]
    Structured {
        code: String,
        message: String,
        details: Value,
        status: u16,
    },

    /// Backend failure without the structured contract. Never retried.
    #[error("{message}")]
    Legacy { message: String, status: u16 },

    /// Transport-level failure (connection refused, reset, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// Core misuse, e.g. a request issued before discovery assigned a port.
    /// Fatal; surfaced immediately.
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ApiError {
    pub fn code(&self) -> &str {
        match self {
            ApiError::Structured { code, .. } => code,
            ApiError::Legacy { .. } => "UNKNOWN_ERROR",
            ApiError::Network(_) => "NETWORK_ERROR",
            ApiError::Config(_) => "CONFIGURATION_ERROR",
        }
    }

    /// HTTP status, when a response was actually received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Structured { status, .. } | ApiError::Legacy { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

/// Classify a non-2xx response into a [`ApiError::Structured`] or
/// [`ApiError::Legacy`] error. Consumes the response body.
pub(crate) async fn classify_response(response: reqwest::Response) -> ApiError {
    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("Unknown Error");
    let body = response.text().await.unwrap_or_default();
    classify_body(status.as_u16(), status_text, &body)
}

/// Body classification rules: a `code` field marks the structured contract;
/// anything else is legacy, taking `detail`/`message` when available. A body
/// that fails to parse degrades to an empty object instead of aborting
/// classification.
pub(crate) fn classify_body(status: u16, status_text: &str, body: &str) -> ApiError {
    let parsed: Value = serde_json::from_str(body).unwrap_or_else(|_| Value::Object(Default::default()));

    if let Some(code) = parsed.get("code").and_then(Value::as_str) {
        let message = parsed
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(status_text)
            .to_string();
        let details = parsed
            .get("details")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        return ApiError::Structured {
            code: code.to_string(),
            message,
            details,
            status,
        };
    }

    let detail = parsed
        .get("detail")
        .or_else(|| parsed.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(status_text);

    ApiError::Legacy {
        message: format!("API Error: {} {}", status, detail),
        status,
    }
}
