#![forbid(unsafe_code)]
#![doc = r#"
Chatrelay

One OpenAI-compatible chat completion endpoint in front of several LLM providers. The `model`
field of each request picks the provider; the body is forwarded with that provider's key and the
answer (or the provider's own error) comes back unchanged.

Crate highlights
- Library: `router::route` validates and resolves a request without touching the network.
- HTTP server (in `server`): `/health`, `/v1/models`, `/v1/chat/completions` (buffered or SSE).
- Catalog: built-in DeepSeek and Perplexity Sonar models, or a `models.json` file.

Modules
- `models`: Wire types for chat completions and the listing endpoints.
- `registry`: Model id → provider/endpoint catalog and alternation policy.
- `credentials`: Provider API keys from the environment.
- `normalize`: Merges consecutive user turns for providers that require alternation.
- `router`: Validation and outbound payload construction.
- `relay`: Upstream call, SSE passthrough and transport error mapping.
- `error`: OpenAI-shaped error envelope.
- `server`: Actix-web routes/handlers.
- `util`: Shared helpers (env, tracing, HTTP client, CORS, app state).
"#]

pub mod credentials;
pub mod error;
pub mod models;
pub mod normalize;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod util;

pub use crate::credentials::CredentialStore;
pub use crate::error::ProxyError;
pub use crate::models::ChatCompletionRequest;
pub use crate::normalize::normalize;
pub use crate::registry::{ModelDescriptor, ModelRegistry, RegistryError};
pub use crate::relay::{UpstreamReply, UPSTREAM_TIMEOUT};
pub use crate::router::{route, RoutedCall};
pub use crate::util::AppState;
