use actix_web::body::MessageBody;
use actix_web::{test, web, App};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{extract::State, routing::post, Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use chatrelay::credentials::CredentialStore;
use chatrelay::registry::{ModelDescriptor, ModelRegistry};
use chatrelay::server::config_routes;
use chatrelay::util::AppState;

const SSE_FRAMES: [&str; 3] = [
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
    "data: [DONE]\n\n",
];

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<AsyncMutex<Vec<(HeaderMap, Value)>>>,
    response: Value,
    stream_closed: Arc<Notify>,
}

/// Signals when the upstream body stream is dropped, which hyper does once
/// the peer connection is gone.
struct CloseSignal(Arc<Notify>);

impl Drop for CloseSignal {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

async fn handle_chat(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Json<Value> {
    state.requests.lock().await.push((headers, payload));
    Json(state.response.clone())
}

async fn handle_rate_limited() -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"error":"rate limited"}"#,
    )
}

async fn handle_slow(Json(_payload): Json<Value>) -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(json!({"late": true}))
}

async fn handle_sse() -> impl IntoResponse {
    let frames = futures_util::stream::iter(SSE_FRAMES).then(|frame| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, std::io::Error>(Bytes::from_static(frame.as_bytes()))
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        axum::body::Body::from_stream(frames),
    )
}

async fn handle_sse_broken() -> impl IntoResponse {
    let items = vec![
        Ok(Bytes::from_static(SSE_FRAMES[0].as_bytes())),
        Ok(Bytes::from_static(SSE_FRAMES[1].as_bytes())),
        Err(std::io::Error::other("upstream crashed")),
    ];
    let frames = futures_util::stream::iter(items).then(|item| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        item
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        axum::body::Body::from_stream(frames),
    )
}

async fn handle_sse_endless(State(state): State<UpstreamState>) -> impl IntoResponse {
    let signal = CloseSignal(state.stream_closed.clone());
    let frames = futures_util::stream::unfold(signal, |signal| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let frame = Bytes::from_static(b"data: {\"tick\":true}\n\n");
        Some((Ok::<_, std::io::Error>(frame), signal))
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        axum::body::Body::from_stream(frames),
    )
}

async fn handle_unauthorized() -> impl IntoResponse {
    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"error":{"message":"invalid api key"}}"#,
    )
}

struct MockUpstream {
    base_url: String,
    requests: Arc<AsyncMutex<Vec<(HeaderMap, Value)>>>,
    stream_closed: Arc<Notify>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(response: Value) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let stream_closed = Arc::new(Notify::new());
        let state = UpstreamState {
            requests: requests.clone(),
            response,
            stream_closed: stream_closed.clone(),
        };

        let app = Router::new()
            .route("/chat/completions", post(handle_chat))
            .route("/rate-limited", post(handle_rate_limited))
            .route("/slow", post(handle_slow))
            .route("/sse", post(handle_sse))
            .route("/sse-broken", post(handle_sse_broken))
            .route("/sse-endless", post(handle_sse_endless))
            .route("/unauthorized", post(handle_unauthorized))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self {
            base_url,
            requests,
            stream_closed,
            join,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn last_request(&self) -> (HeaderMap, Value) {
        let guard = self.requests.lock().await;
        guard
            .last()
            .cloned()
            .unwrap_or_else(|| (HeaderMap::new(), json!({})))
    }

    async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn completion() -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1,
        "model": "mock-chat",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "ok"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
    })
}

/// `mock-*` models are served by provider "mock"; `sonar-mock` by
/// "perplexity" so it inherits the alternation requirement.
fn registry_for(upstream: &MockUpstream) -> ModelRegistry {
    ModelRegistry::from_descriptors(vec![
        ModelDescriptor::new(
            "mock-chat",
            "mock",
            &upstream.url("/chat/completions"),
            "Mock",
            "",
        ),
        ModelDescriptor::new(
            "sonar-mock",
            "perplexity",
            &upstream.url("/chat/completions"),
            "Sonar Mock",
            "",
        ),
        ModelDescriptor::new(
            "mock-limited",
            "mock",
            &upstream.url("/rate-limited"),
            "Limited",
            "",
        ),
        ModelDescriptor::new("mock-slow", "mock", &upstream.url("/slow"), "Slow", ""),
        ModelDescriptor::new("mock-sse", "mock", &upstream.url("/sse"), "SSE", ""),
        ModelDescriptor::new(
            "mock-sse-broken",
            "mock",
            &upstream.url("/sse-broken"),
            "SSE broken",
            "",
        ),
        ModelDescriptor::new(
            "mock-sse-endless",
            "mock",
            &upstream.url("/sse-endless"),
            "SSE endless",
            "",
        ),
        ModelDescriptor::new(
            "mock-denied",
            "mock",
            &upstream.url("/unauthorized"),
            "Denied",
            "",
        ),
        ModelDescriptor::new(
            "mock-unkeyed",
            "nokey",
            &upstream.url("/chat/completions"),
            "No key",
            "",
        ),
    ])
    .expect("registry")
}

fn state_for(registry: ModelRegistry) -> AppState {
    let credentials = CredentialStore::from_pairs([
        ("mock", Some("sk-mock-123456")),
        ("perplexity", Some("pplx-mock")),
        ("nokey", None),
    ]);
    let direct = reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("http client");
    AppState::new(registry, credentials, false)
        .with_upstream_timeout(Duration::from_millis(1000))
        .with_http_client(direct)
}

macro_rules! proxy_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state))
                .configure(config_routes),
        )
        .await
    };
}

async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{}/chat/completions", addr)
}

#[actix_web::test]
async fn forwards_payload_with_credential_and_extras() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let payload = json!({
        "model": "mock-chat",
        "messages": [
            {"role": "user", "content": "a"},
            {"role": "user", "content": "b"}
        ],
        "temperature": 0.3,
        "max_tokens": 64,
        "response_format": {"type": "json_object"}
    });
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(&payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, completion());

    let (headers, forwarded) = upstream.last_request().await;
    assert_eq!(
        headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
        Some("Bearer sk-mock-123456")
    );
    assert_eq!(forwarded["model"], "mock-chat");
    assert_eq!(forwarded["stream"], false);
    assert_eq!(forwarded["temperature"], 0.3);
    assert_eq!(forwarded["max_tokens"], 64);
    assert_eq!(forwarded["response_format"]["type"], "json_object");
    // no alternation requirement for this provider
    assert_eq!(forwarded["messages"].as_array().map(Vec::len), Some(2));
}

#[actix_web::test]
async fn perplexity_conversation_is_merged_before_forwarding() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let payload = json!({
        "model": "sonar-mock",
        "messages": [
            {"role": "user", "content": "a"},
            {"role": "user", "content": "b"},
            {"role": "assistant", "content": "c"},
            {"role": "user", "content": "d"}
        ]
    });
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(&payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let (headers, forwarded) = upstream.last_request().await;
    assert_eq!(
        headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
        Some("Bearer pplx-mock")
    );
    assert_eq!(
        forwarded["messages"],
        json!([
            {"role": "user", "content": "a\n\nb"},
            {"role": "assistant", "content": "c"},
            {"role": "user", "content": "d"}
        ])
    );
}

#[actix_web::test]
async fn openai_message_shapes_are_forwarded_as_sent() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let messages = json!([
        {"role": "developer", "content": "answer tersely"},
        {"role": "user", "content": [
            {"type": "text", "text": "what is this"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
        ]},
        {"role": "assistant", "content": null, "tool_calls": [{
            "id": "call_1",
            "type": "function",
            "function": {"name": "lookup", "arguments": "{}"}
        }]},
        {"role": "tool", "tool_call_id": "call_1", "content": "a cat"}
    ]);
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"model": "mock-chat", "messages": messages.clone(), "stream": null}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);

    let (_, forwarded) = upstream.last_request().await;
    assert_eq!(forwarded["messages"], messages);
    assert_eq!(forwarded["stream"], false);
}

#[actix_web::test]
async fn provider_error_is_relayed_verbatim() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"model": "mock-limited", "messages": [{"role": "user", "content": "x"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 429);
    let body = test::read_body(resp).await;
    assert_eq!(body.as_ref(), br#"{"error":"rate limited"}"#);
}

#[actix_web::test]
async fn slow_provider_times_out_with_504() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"model": "mock-slow", "messages": [{"role": "user", "content": "x"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 504);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "timeout");
    assert_eq!(body["error"]["type"], "server_error");
}

#[actix_web::test]
async fn refused_connection_maps_to_provider_unavailable() {
    let url = closed_port_url().await;
    let registry = ModelRegistry::from_descriptors(vec![ModelDescriptor::new(
        "mock-down",
        "mock",
        &url,
        "Down",
        "",
    )])
    .expect("registry");
    let app = proxy_app!(state_for(registry));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"model": "mock-down", "messages": [{"role": "user", "content": "x"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 503);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "provider_unavailable");
    assert!(body["error"].get("details").is_none());
}

#[actix_web::test]
async fn validation_failures_never_reach_upstream() {
    let upstream = MockUpstream::start(completion()).await;
    let registry = registry_for(&upstream);
    let all_ids = registry.model_ids();
    let app = proxy_app!(state_for(registry));

    let cases = [
        (json!({"messages": [{"role": "user", "content": "x"}]}), 400, "missing_model"),
        (json!({"model": "mock-chat"}), 400, "missing_messages"),
        (json!({"model": "mock-chat", "messages": []}), 400, "missing_messages"),
        (json!({"model": "mock-chat", "messages": "hi"}), 400, "missing_messages"),
        (
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "x"}]}),
            400,
            "model_not_found",
        ),
        (
            json!({"model": "mock-unkeyed", "messages": [{"role": "user", "content": "x"}]}),
            500,
            "missing_api_key",
        ),
        (json!({"model": "mock-unkeyed", "messages": [42]}), 500, "missing_api_key"),
    ];

    for (payload, status, code) in cases {
        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(&payload)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), status, "payload {payload}");
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], code, "payload {payload}");
        if code == "model_not_found" {
            let message = body["error"]["message"].as_str().unwrap_or_default();
            for id in &all_ids {
                assert!(message.contains(id.as_str()), "{id} not listed");
            }
        }
    }

    assert_eq!(upstream.request_count().await, 0);
}

#[actix_web::test]
async fn invalid_json_body_is_rejected() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not json")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "invalid_request");
}

#[actix_web::test]
async fn streaming_relays_frames_in_order() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "mock-sse",
            "stream": true,
            "messages": [{"role": "user", "content": "x"}]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let headers = resp.headers();
    assert_eq!(
        headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        headers.get("cache-control").and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );

    let body = test::read_body(resp).await;
    assert_eq!(body.as_ref(), SSE_FRAMES.concat().as_bytes());
}

fn stream_request(model: &str) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": model,
            "stream": true,
            "messages": [{"role": "user", "content": "x"}]
        }))
}

#[actix_web::test]
async fn interrupted_stream_closes_without_extra_frame() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let resp = test::call_service(&app, stream_request("mock-sse-broken").to_request()).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body = test::read_body(resp).await;
    assert_eq!(
        body.as_ref(),
        [SSE_FRAMES[0], SSE_FRAMES[1]].concat().as_bytes()
    );
}

#[actix_web::test]
async fn client_disconnect_closes_upstream_stream() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let resp = test::call_service(&app, stream_request("mock-sse-endless").to_request()).await;
    assert_eq!(resp.status().as_u16(), 200);

    let mut body = resp.into_body();
    let first = futures_util::future::poll_fn(|cx| std::pin::Pin::new(&mut body).poll_next(cx))
        .await
        .expect("first chunk")
        .expect("chunk ok");
    assert!(first.starts_with(b"data: "));

    drop(body);
    tokio::time::timeout(Duration::from_secs(5), upstream.stream_closed.notified())
        .await
        .expect("upstream stream was not closed after client went away");
}

#[actix_web::test]
async fn streaming_provider_error_becomes_single_frame() {
    let upstream = MockUpstream::start(completion()).await;
    let app = proxy_app!(state_for(registry_for(&upstream)));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "mock-denied",
            "stream": true,
            "messages": [{"role": "user", "content": "x"}]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body = test::read_body(resp).await;
    let text = std::str::from_utf8(&body).expect("utf8");
    assert_eq!(
        text,
        "data: {\"error\":{\"error\":{\"message\":\"invalid api key\"}}}\n\n"
    );
}

#[actix_web::test]
async fn streaming_transport_failure_becomes_error_frame() {
    let url = closed_port_url().await;
    let registry = ModelRegistry::from_descriptors(vec![ModelDescriptor::new(
        "mock-down",
        "mock",
        &url,
        "Down",
        "",
    )])
    .expect("registry");
    let app = proxy_app!(state_for(registry));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "mock-down",
            "stream": true,
            "messages": [{"role": "user", "content": "x"}]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body = test::read_body(resp).await;
    let text = std::str::from_utf8(&body).expect("utf8");
    let data = text
        .strip_prefix("data: ")
        .and_then(|t| t.strip_suffix("\n\n"))
        .expect("single frame");
    let parsed: Value = serde_json::from_str(data).expect("json frame");
    assert_eq!(parsed["error"]["code"], "provider_unavailable");
}

#[actix_web::test]
async fn models_config_headers_and_defaults_are_applied() {
    let upstream = MockUpstream::start(completion()).await;

    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    let config = json!({
        "version": "2.1.0",
        "models": [{
            "id": "custom-chat",
            "provider": "mock",
            "endpoint": upstream.url("/chat/completions"),
            "customHeaders": {"X-Client": "ide", "Authorization": "Bearer nope"},
            "customBodyParams": {"temperature": 0.9, "top_p": 0.5}
        }]
    });
    write!(file, "{}", config).expect("write config");
    let registry = ModelRegistry::load_from_file(file.path()).expect("load config");
    let app = proxy_app!(state_for(registry));

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({
            "model": "custom-chat",
            "temperature": 0.1,
            "messages": [{"role": "user", "content": "x"}]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let (headers, forwarded) = upstream.last_request().await;
    assert_eq!(
        headers.get("x-client").and_then(|v| v.to_str().ok()),
        Some("ide")
    );
    assert_eq!(
        headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
        Some("Bearer sk-mock-123456")
    );
    assert_eq!(forwarded["temperature"], 0.1);
    assert_eq!(forwarded["top_p"], 0.5);
}
