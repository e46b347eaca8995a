//! Request Router
//!
//! Validates an inbound chat completion body, resolves the model to a
//! provider and credential, and builds the outbound payload. Checks run in a
//! fixed order and the first failure wins:
//!
//! 1. `model` present and non-empty
//! 2. `messages` a non-empty array
//! 3. `model` known to the registry
//! 4. the provider has a credential
//!
//! Nothing here touches the network.

use serde_json::Value;

use crate::credentials::{key_env_var, CredentialStore};
use crate::error::ProxyError;
use crate::models::ChatCompletionRequest;
use crate::normalize::normalize;
use crate::registry::{ModelDescriptor, ModelRegistry};

/// A validated request, ready to be relayed.
#[derive(Debug, Clone)]
pub struct RoutedCall {
    pub descriptor: ModelDescriptor,
    pub credential: String,
    pub payload: ChatCompletionRequest,
}

impl RoutedCall {
    pub fn is_stream(&self) -> bool {
        self.payload.stream
    }

    /// Number of turns merged away by normalization.
    pub fn merged_turns(&self, original_len: usize) -> usize {
        original_len.saturating_sub(self.payload.messages.len())
    }
}

/// Route a raw JSON body.
///
/// Once the four checks pass the body is forwarded whatever else it holds;
/// message shapes, roles and extra fields are the provider's to judge.
pub fn route(
    body: Value,
    registry: &ModelRegistry,
    credentials: &CredentialStore,
) -> Result<RoutedCall, ProxyError> {
    let Value::Object(mut fields) = body else {
        return Err(ProxyError::MissingModel);
    };

    let model = match fields.get("model").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => return Err(ProxyError::MissingModel),
    };

    let messages = match fields.remove("messages") {
        Some(Value::Array(messages)) if !messages.is_empty() => messages,
        _ => return Err(ProxyError::MissingMessages),
    };

    let descriptor = registry
        .resolve(&model)
        .ok_or_else(|| ProxyError::ModelNotFound {
            model: model.clone(),
            available: registry.model_ids(),
        })?;

    let credential = credentials
        .credential_for(&descriptor.provider)
        .ok_or_else(|| ProxyError::MissingApiKey {
            provider: descriptor.provider.clone(),
            env_var: key_env_var(&descriptor.provider),
        })?
        .to_string();

    let messages = normalize(
        &messages,
        registry.requires_alternation(&descriptor.provider),
    );
    let mut payload = ChatCompletionRequest::from_fields(model, messages, fields);

    for (key, value) in &descriptor.default_params {
        if matches!(key.as_str(), "model" | "messages" | "stream") {
            continue;
        }
        payload
            .extra
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }

    Ok(RoutedCall {
        descriptor: descriptor.clone(),
        credential,
        payload,
    })
}
