//! Model Registry
//!
//! Static mapping from model id to the provider and endpoint that serve it.
//! Built once at startup, either from the built-in catalog or from a
//! `models.json` file, and shared read-only afterwards.
//!
//! The file format matches what the IDE plugin generates:
//! ```json
//! {
//!   "version": "2.1.0",
//!   "providers": [{ "name": "perplexity", "requiresAlternation": true }],
//!   "models": [{
//!     "id": "sonar",
//!     "provider": "perplexity",
//!     "endpoint": "https://api.perplexity.ai/chat/completions",
//!     "enabled": true,
//!     "customHeaders": { "X-Trace": "1" },
//!     "customBodyParams": { "temperature": 0.2 }
//!   }]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub const DEEPSEEK_URL: &str = "https://api.deepseek.com/chat/completions";
pub const PERPLEXITY_URL: &str = "https://api.perplexity.ai/chat/completions";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read models config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid models config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate model id: {0}")]
    DuplicateModel(String),

    #[error("models config contains no enabled models")]
    Empty,
}

/// Static metadata binding a model id to its provider and endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub provider: String,
    pub upstream_url: String,
    pub display_name: String,
    pub description: String,
    /// Extra outbound headers. `Authorization` never appears here.
    pub headers: HashMap<String, String>,
    /// Body defaults applied where the caller did not set the key.
    pub default_params: Map<String, Value>,
}

impl ModelDescriptor {
    pub fn new(
        id: &str,
        provider: &str,
        upstream_url: &str,
        display_name: &str,
        description: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            provider: provider.to_string(),
            upstream_url: upstream_url.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            headers: HashMap::new(),
            default_params: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderEntry {
    name: String,
    #[serde(default)]
    requires_alternation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelEntry {
    id: String,
    provider: String,
    endpoint: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    custom_headers: HashMap<String, String>,
    #[serde(default)]
    custom_body_params: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelsFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    providers: Vec<ProviderEntry>,
    models: Vec<ModelEntry>,
}

/// Read-only model catalog plus the per-provider alternation policy.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
    alternation: HashSet<String>,
}

impl ModelRegistry {
    /// Build from descriptors, rejecting duplicate ids. Insertion order is the
    /// listing order.
    pub fn from_descriptors(models: Vec<ModelDescriptor>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::with_capacity(models.len());
        if let Some(dup) = models.iter().find(|m| !seen.insert(m.id.as_str())) {
            return Err(RegistryError::DuplicateModel(dup.id.clone()));
        }
        Ok(Self::indexed(models))
    }

    /// Later duplicates shadow earlier ones in the index.
    fn indexed(models: Vec<ModelDescriptor>) -> Self {
        let index = models
            .iter()
            .enumerate()
            .map(|(i, model)| (model.id.clone(), i))
            .collect();
        Self {
            models,
            index,
            alternation: HashSet::from(["perplexity".to_string()]),
        }
    }

    /// The DeepSeek and Perplexity Sonar catalog.
    pub fn builtin() -> Self {
        let models = vec![
            ModelDescriptor::new(
                "deepseek-chat",
                "deepseek",
                DEEPSEEK_URL,
                "DeepSeek Chat",
                "General purpose chat model (DeepSeek-V3)",
            ),
            ModelDescriptor::new(
                "deepseek-reasoner",
                "deepseek",
                DEEPSEEK_URL,
                "DeepSeek Reasoner",
                "Advanced reasoning model with Chain of Thought",
            ),
            ModelDescriptor::new(
                "sonar",
                "perplexity",
                PERPLEXITY_URL,
                "Sonar",
                "Lightweight, cost-effective search model with grounding",
            ),
            ModelDescriptor::new(
                "sonar-pro",
                "perplexity",
                PERPLEXITY_URL,
                "Sonar Pro",
                "Advanced search offering with complex query support",
            ),
            ModelDescriptor::new(
                "sonar-reasoning",
                "perplexity",
                PERPLEXITY_URL,
                "Sonar Reasoning",
                "Fast, real-time reasoning with search capabilities",
            ),
            ModelDescriptor::new(
                "sonar-reasoning-pro",
                "perplexity",
                PERPLEXITY_URL,
                "Sonar Reasoning Pro",
                "Precise reasoning powered by DeepSeek-R1 with CoT",
            ),
            ModelDescriptor::new(
                "sonar-deep-research",
                "perplexity",
                PERPLEXITY_URL,
                "Sonar Deep Research",
                "Expert-level research conducting exhaustive searches",
            ),
        ];
        Self::indexed(models)
    }

    /// Load a `models.json` catalog. Its enabled models replace the built-in
    /// ones.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, RegistryError> {
        let file: ModelsFile = serde_json::from_str(content)?;

        let mut models = Vec::new();
        for entry in file.models {
            if !entry.enabled {
                tracing::debug!("Skipping disabled model {}", entry.id);
                continue;
            }
            let mut headers = entry.custom_headers;
            headers.retain(|name, _| !name.eq_ignore_ascii_case("authorization"));
            let display_name = entry.display_name.unwrap_or_else(|| entry.id.clone());
            let description = entry
                .description
                .or(entry.category)
                .unwrap_or_default();
            models.push(ModelDescriptor {
                id: entry.id,
                provider: entry.provider,
                upstream_url: entry.endpoint,
                display_name,
                description,
                headers,
                default_params: entry.custom_body_params,
            });
        }
        if models.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut registry = Self::from_descriptors(models)?;
        for provider in file.providers {
            registry.set_requires_alternation(&provider.name, provider.requires_alternation);
        }
        if let Some(version) = file.version {
            tracing::info!(
                "Loaded models config version {} ({} models)",
                version,
                registry.len()
            );
        }
        Ok(registry)
    }

    pub fn set_requires_alternation(&mut self, provider: &str, required: bool) {
        if required {
            self.alternation.insert(provider.to_string());
        } else {
            self.alternation.remove(provider);
        }
    }

    /// Exact, case-sensitive lookup.
    pub fn resolve(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.index.get(model_id).map(|&i| &self.models[i])
    }

    /// Whether the provider demands strict user/assistant alternation.
    pub fn requires_alternation(&self, provider: &str) -> bool {
        self.alternation.contains(provider)
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.iter().map(|m| m.id.clone()).collect()
    }

    /// Distinct provider names in first-seen order.
    pub fn providers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.models
            .iter()
            .filter(|m| seen.insert(m.provider.as_str()))
            .map(|m| m.provider.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
