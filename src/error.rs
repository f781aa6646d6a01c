use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// OpenAI-style error body carried inside the `{"error": ...}` envelope.
/// Upstream providers are parsed into this shape as well, so `code` stays a
/// loose JSON value (some vendors send numbers).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub code: serde_json::Value,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, code: &str) -> Self {
        Self {
            message: message.into(),
            kind: "relay_gateway_error".to_string(),
            param: None,
            code: serde_json::Value::String(code.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.kind.is_empty() && self.code.is_null()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{message}")]
    Malformed {
        code: &'static str,
        message: String,
    },
    #[error("invalid api key: {0}")]
    Unauthorized(String),
    #[error("invalid {provider} config: {message}")]
    AuthConfig {
        provider: &'static str,
        message: String,
    },
    #[error("{message}")]
    Quota {
        code: &'static str,
        message: String,
    },
    #[error("no channel available for group {group} and model {model}")]
    NoChannel { group: String, model: String },
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned {status}: {}", .error.message)]
    Upstream { status: u16, error: ErrorBody },
    #[error("{message}")]
    Internal {
        code: &'static str,
        message: String,
    },
}

impl RelayError {
    pub fn malformed(code: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            code,
            message: message.into(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::malformed("required_field_missing", format!("field {field} is required"))
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Malformed { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Quota { .. } => StatusCode::FORBIDDEN,
            Self::NoChannel { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::AuthConfig { .. } | Self::Transport(_) | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            Self::Malformed { code, message } => ErrorBody::new(message, code),
            Self::Unauthorized(message) => ErrorBody::new(message, "invalid_api_key"),
            Self::AuthConfig { provider, message } => {
                ErrorBody::new(message, &format!("invalid_{provider}_config"))
            }
            Self::Quota { code, message } => ErrorBody::new(message, code),
            Self::NoChannel { .. } => ErrorBody::new(self.to_string(), "no_channel_available"),
            Self::Transport(e) => ErrorBody::new(e.to_string(), "do_request_failed"),
            Self::Upstream { error, .. } => error.clone(),
            Self::Internal { code, message } => ErrorBody::new(message, code),
        }
    }

    /// True when quota preconsumed for this request must be given back.
    /// Validation failures happen before preconsumption, so they never refund.
    pub fn refundable(&self) -> bool {
        !matches!(self, Self::Malformed { .. })
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let envelope = ErrorEnvelope { error: self.body() };
        (status, Json(envelope)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
