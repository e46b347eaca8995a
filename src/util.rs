use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

use crate::credentials::CredentialStore;
use crate::registry::ModelRegistry;
use crate::relay::UPSTREAM_TIMEOUT;

/// Load environment files before anything reads configuration.
///
/// Order:
/// - explicit path in ENV_FILE or DOTENV_PATH
/// - `.env` in the working directory (dotenvy discovery)
///
/// Existing process variables are never overwritten. Returns where the
/// environment came from, for the startup log.
pub fn load_env() -> String {
    for key in ["ENV_FILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                return format!("{p} ({key})");
            }
        }
    }

    match dotenvy::dotenv() {
        Ok(path) => path.display().to_string(),
        Err(_) => "process environment".into(),
    }
}

/// Initialize structured tracing. `RUST_LOG` wins; otherwise `info`, or
/// `debug` for our own crate when verbose diagnostics are on.
pub fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "info,chatrelay=debug"
    } else {
        "info"
    };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Shared HTTP client for all outbound calls. Timeouts are applied per call.
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(format!("chatrelay/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Shared application state used by the HTTP server and handlers. Everything
/// in here is read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub registry: Arc<ModelRegistry>,
    pub credentials: Arc<CredentialStore>,
    /// Verbose diagnostics: payload logging and internal error details.
    pub verbose: bool,
    pub upstream_timeout: Duration,
    /// Process start (unix seconds), reported as `created` in `/v1/models`.
    pub started_at: i64,
}

impl AppState {
    pub fn new(registry: ModelRegistry, credentials: CredentialStore, verbose: bool) -> Self {
        Self {
            http: build_http_client(),
            registry: Arc::new(registry),
            credentials: Arc::new(credentials),
            verbose,
            upstream_timeout: UPSTREAM_TIMEOUT,
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Credentials for every provider of the registry, read from the environment.
    pub fn from_env(registry: ModelRegistry, verbose: bool) -> Self {
        let credentials = CredentialStore::from_env(registry.providers());
        Self::new(registry, credentials, verbose)
    }

    /// Replace the process-wide upstream timeout. Not exposed per request.
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::from_env(ModelRegistry::builtin(), false)
    }
}

/// Build a CORS configuration from the environment.
///
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins
///
/// Everything else is permissive; IDE clients send arbitrary headers.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default()
        .allow_any_method()
        .allow_any_header();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" && !origins.trim().is_empty() => {
            for part in origins.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    cors
}
