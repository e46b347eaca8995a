//! OpenAI-shaped error envelope for everything the proxy itself decides.
//!
//! Provider errors (an upstream status >= 400) are never represented here;
//! they are relayed verbatim by `relay`.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::{json, Value};

pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_SERVER: &str = "server_error";

/// Paths advertised by the 404 fallback.
pub const AVAILABLE_ENDPOINTS: [&str; 3] = ["/health", "/v1/models", "/v1/chat/completions"];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Model parameter is required")]
    MissingModel,

    #[error("Messages parameter is required and must be a non-empty array")]
    MissingMessages,

    #[error("Model '{model}' is not supported. Available models: {}", .available.join(", "))]
    ModelNotFound {
        model: String,
        available: Vec<String>,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("API key not configured for provider: {provider}. Set {env_var} in the environment or .env file.")]
    MissingApiKey { provider: String, env_var: String },

    #[error("Unable to connect to AI provider API. Please check your internet connection.")]
    ProviderUnavailable,

    #[error("Request timeout to AI provider. The request took too long to complete.")]
    Timeout,

    #[error("Unable to resolve AI provider hostname. Please check your internet connection.")]
    Dns,

    #[error("Internal server error in proxy. Check proxy logs for details.")]
    Internal {
        /// Only rendered when verbose diagnostics are enabled.
        detail: Option<String>,
    },

    #[error("Endpoint not found: {method} {path}")]
    EndpointNotFound { method: String, path: String },
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingModel => "missing_model",
            Self::MissingMessages => "missing_messages",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MissingApiKey { .. } => "missing_api_key",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::Timeout => "timeout",
            Self::Dns => "dns_error",
            Self::Internal { .. } => "internal_error",
            Self::EndpointNotFound { .. } => "endpoint_not_found",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::MissingModel
            | Self::MissingMessages
            | Self::ModelNotFound { .. }
            | Self::InvalidRequest(_)
            | Self::EndpointNotFound { .. } => ERROR_TYPE_INVALID_REQUEST,
            _ => ERROR_TYPE_SERVER,
        }
    }

    /// `{error: {message, type, code}}` plus the variant-specific extras.
    pub fn envelope(&self) -> Value {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.error_type(),
            "code": self.code(),
        });
        match self {
            Self::Internal {
                detail: Some(detail),
            } => {
                error["details"] = json!(detail);
            }
            Self::EndpointNotFound { .. } => {
                error["available_endpoints"] = json!(AVAILABLE_ENDPOINTS);
            }
            _ => {}
        }
        json!({ "error": error })
    }

    /// Server-sent-event frame carrying the envelope, for failures after the
    /// caller's stream has been committed.
    pub fn sse_frame(&self) -> String {
        format!("data: {}\n\n", self.envelope())
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingModel
            | Self::MissingMessages
            | Self::ModelNotFound { .. }
            | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::MissingApiKey { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ProviderUnavailable | Self::Dns => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::EndpointNotFound { .. } => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.envelope())
    }
}
