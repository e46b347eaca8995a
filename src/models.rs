//! Wire types for the OpenAI-compatible surface.
//!
//! Only the fields the proxy makes decisions on are typed. Everything else a
//! caller sends rides along in `ChatCompletionRequest::extra` and is forwarded
//! to the provider untouched.

use serde::Serialize;
use serde_json::{Map, Value};

/// Outbound chat completion body: `model`, `messages`, `stream` and then
/// every pass-through field.
///
/// Messages stay raw JSON. Content parts, tool calls, `null` content and
/// roles this proxy has never heard of are the provider's business.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub stream: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    /// Split a JSON object into the fields the proxy acts on and the rest.
    /// Only a literal `true` turns streaming on; anything else sent as
    /// `stream` (`null`, strings, numbers) means buffered.
    pub fn from_fields(
        model: String,
        messages: Vec<Value>,
        mut fields: Map<String, Value>,
    ) -> Self {
        let stream = matches!(fields.remove("stream"), Some(Value::Bool(true)));
        fields.remove("model");
        fields.remove("messages");
        Self {
            model,
            messages,
            stream,
            extra: fields,
        }
    }
}

/// Entry of `GET /v1/models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
    pub permission: Vec<Value>,
    pub root: String,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyStatus {
    pub provider: String,
    pub configured: bool,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub available_models: Vec<String>,
    pub api_keys: Vec<ApiKeyStatus>,
    pub debug_mode: bool,
}
