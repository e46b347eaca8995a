use std::time::Instant;

use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::credentials::mask_key;
use crate::error::ProxyError;
use crate::models::{ApiKeyStatus, HealthReport, ModelList, ModelObject};
use crate::relay;
use crate::router::route;
use crate::util::AppState;

pub const SERVICE_NAME: &str = "chatrelay";

/// Conversations with pasted files get large.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Configure Actix-web routes with AppState. Unknown paths, and known paths
/// hit with the wrong method, get the 404 envelope.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .service(
            web::resource("/")
                .route(web::get().to(root))
                .default_service(web::to(not_found)),
        )
        .service(
            web::resource("/health")
                .route(web::get().to(health))
                .default_service(web::to(not_found)),
        )
        .service(
            web::resource("/v1/models")
                .route(web::get().to(list_models))
                .default_service(web::to(not_found)),
        )
        .service(
            web::resource("/v1/chat/completions")
                .route(web::post().to(chat_completions))
                .default_service(web::to(not_found)),
        )
        .service(
            web::resource("/v1/chat/completions/test")
                .route(web::post().to(chat_completions_test))
                .default_service(web::to(not_found)),
        )
        .default_service(web::to(not_found));
}

fn new_request_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

async fn health(state: web::Data<AppState>) -> impl Responder {
    let api_keys = state
        .registry
        .providers()
        .into_iter()
        .map(|provider| ApiKeyStatus {
            configured: state.credentials.is_configured(&provider),
            provider,
        })
        .collect();

    debug!("Health check");
    web::Json(HealthReport {
        status: "healthy",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        available_models: state.registry.model_ids(),
        api_keys,
        debug_mode: state.verbose,
    })
}

async fn list_models(state: web::Data<AppState>) -> impl Responder {
    let data = state
        .registry
        .models()
        .iter()
        .map(|m| ModelObject {
            id: m.id.clone(),
            object: "model",
            created: state.started_at,
            owned_by: m.provider.clone(),
            permission: Vec::new(),
            root: m.id.clone(),
            parent: None,
        })
        .collect();

    debug!("Models list requested");
    web::Json(ModelList {
        object: "list",
        data,
    })
}

async fn root(state: web::Data<AppState>, req: HttpRequest) -> impl Responder {
    let base_url = {
        let info = req.connection_info();
        format!("{}://{}/v1", info.scheme(), info.host())
    };
    let models: Vec<Value> = state
        .registry
        .models()
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "provider": m.provider,
                "display_name": m.display_name,
                "description": m.description,
            })
        })
        .collect();

    web::Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/health",
            "models": "/v1/models",
            "chat": "/v1/chat/completions",
        },
        "available_models": models,
        "client_configuration": {
            "provider": "OpenAI API",
            "url": base_url,
            "api_key": "(leave empty)",
        },
    }))
}

/// Canned completion so clients can check the response shape without
/// spending provider quota.
async fn chat_completions_test() -> impl Responder {
    let now = chrono::Utc::now();
    info!("Test endpoint called");
    web::Json(json!({
        "id": format!("test-{}", now.timestamp_millis()),
        "object": "chat.completion",
        "created": now.timestamp(),
        "model": "test-model",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": "Proxy is working correctly! You can now point your client at this endpoint."
            },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 10,
            "completion_tokens": 15,
            "total_tokens": 25
        }
    }))
}

/// `POST /v1/chat/completions`: route by model, then relay buffered or as SSE.
async fn chat_completions(
    state: web::Data<AppState>,
    body: Bytes,
) -> Result<HttpResponse, ProxyError> {
    let request_id = new_request_id();

    let body: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            warn!(request_id = %request_id, error = %e, "Request body is not valid JSON");
            ProxyError::InvalidRequest(format!("body is not valid JSON: {e}"))
        })?
    };

    let message_count = body
        .get("messages")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let model = body.get("model").and_then(Value::as_str).unwrap_or("");
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    info!(
        request_id = %request_id,
        model,
        messages = message_count,
        stream,
        "Received chat completion request"
    );

    let call = route(body, &state.registry, &state.credentials).map_err(|e| {
        warn!(request_id = %request_id, code = e.code(), "{}", e);
        e
    })?;

    let merged = call.merged_turns(message_count);
    if merged > 0 {
        info!(request_id = %request_id, "Merged {} consecutive user messages", merged);
    }
    info!(
        request_id = %request_id,
        provider = %call.descriptor.provider,
        url = %call.descriptor.upstream_url,
        api_key = %mask_key(&call.credential),
        "Routing to provider"
    );
    if state.verbose {
        debug!(
            request_id = %request_id,
            payload = %serde_json::to_string(&call.payload).unwrap_or_default(),
            "Sending to provider"
        );
    }

    if call.is_stream() {
        let stream = relay::stream(
            state.http.clone(),
            call,
            state.upstream_timeout,
            state.verbose,
            request_id,
        );
        return Ok(HttpResponse::Ok()
            .insert_header((header::CONTENT_TYPE, "text/event-stream"))
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .insert_header((header::CONNECTION, "keep-alive"))
            .streaming(stream));
    }

    let started = Instant::now();
    let reply = relay::send(&state.http, &call, state.upstream_timeout, state.verbose).await?;
    let duration_ms = started.elapsed().as_millis() as u64;

    if reply.is_error() {
        error!(
            request_id = %request_id,
            status = reply.status.as_u16(),
            body = %String::from_utf8_lossy(&reply.body),
            "Provider returned error"
        );
    } else {
        info!(request_id = %request_id, duration_ms, "Provider responded");
        if state.verbose {
            log_response_preview(&request_id, &reply.body);
        }
    }

    let status = StatusCode::from_u16(reply.status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok(HttpResponse::build(status)
        .insert_header((
            header::CONTENT_TYPE,
            reply.content_type.as_deref().unwrap_or("application/json"),
        ))
        .body(reply.body))
}

fn log_response_preview(request_id: &str, body: &[u8]) {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return;
    };
    let preview: String = parsed["choices"][0]["message"]["content"]
        .as_str()
        .map(|c| c.chars().take(100).collect())
        .unwrap_or_else(|| "(no content)".to_string());
    debug!(
        request_id = %request_id,
        prompt_tokens = ?parsed["usage"]["prompt_tokens"].as_u64(),
        completion_tokens = ?parsed["usage"]["completion_tokens"].as_u64(),
        "Response preview: {}",
        preview
    );
}

async fn not_found(req: HttpRequest) -> Result<HttpResponse, ProxyError> {
    warn!("404 - Path not found: {} {}", req.method(), req.path());
    Err(ProxyError::EndpointNotFound {
        method: req.method().to_string(),
        path: req.path().to_string(),
    })
}
