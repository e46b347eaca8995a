use actix_web::dev::Service;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;

use chatrelay::credentials::key_env_var;
use chatrelay::registry::ModelRegistry;
use chatrelay::server::config_routes;
use chatrelay::util::{cors_config_from_env, init_tracing, load_env, AppState};

/// Seconds granted to in-flight requests after SIGINT/SIGTERM.
const SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Debug, Parser)]
#[command(name = "chatrelay", version, about = "OpenAI-compatible proxy routing chat completions by model")]
struct Cli {
    /// Interface to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Verbose diagnostics (payload logging, internal error details)
    #[arg(long, env = "DEBUG", value_parser = clap::builder::BoolishValueParser::new())]
    debug: bool,

    /// models.json catalog replacing the built-in model list
    #[arg(long, env = "CHATRELAY_MODELS_CONFIG")]
    models_config: Option<std::path::PathBuf>,
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("Uncaught panic: {}", info);
        default_hook(info);
        std::process::exit(1);
    }));
}

fn log_banner(cli: &Cli, state: &AppState) {
    tracing::info!("Chatrelay listening on http://{}:{}", cli.host, cli.port);
    tracing::info!("Client base URL: http://localhost:{}/v1", cli.port);
    tracing::info!(
        "Debug mode: {}",
        if state.verbose { "ENABLED" } else { "DISABLED" }
    );
    for model in state.registry.models() {
        tracing::info!(
            "  model {:<25} ({}) {}",
            model.id,
            model.provider,
            model.description
        );
    }
    for provider in state.registry.providers() {
        if state.credentials.is_configured(&provider) {
            tracing::info!("  key   {:<15} configured", provider);
        } else {
            tracing::warn!(
                "  key   {:<15} MISSING (set {})",
                provider,
                key_env_var(&provider)
            );
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let env_source = load_env();
    let cli = Cli::parse();
    init_tracing(cli.debug);
    install_panic_hook();
    tracing::info!("Environment loaded from: {}", env_source);

    let registry = match &cli.models_config {
        Some(path) => ModelRegistry::load_from_file(path)
            .with_context(|| format!("loading models config {}", path.display()))?,
        None => ModelRegistry::builtin(),
    };
    let state = AppState::from_env(registry, cli.debug);
    log_banner(&cli, &state);

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(cors_config_from_env())
            .wrap_fn(|req, srv| {
                tracing::debug!("{} {}", req.method(), req.path());
                srv.call(req)
            })
            .configure(config_routes)
    })
    .shutdown_timeout(SHUTDOWN_GRACE_SECS)
    .bind((cli.host.as_str(), cli.port))
    .with_context(|| format!("binding {}:{}", cli.host, cli.port))?
    .run()
    .await?;

    tracing::info!("Server closed");
    Ok(())
}
