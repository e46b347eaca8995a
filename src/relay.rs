//! Response Relay
//!
//! Executes the single outbound call for a `RoutedCall`.
//!
//! - Buffered: status, content type and body of the provider are handed back
//!   unchanged, including provider errors (status >= 400).
//! - Streaming: bytes are copied to the caller in arrival order without
//!   parsing SSE frames. The caller's stream is already committed when the
//!   upstream answers, so failures become at most one `data:` frame.
//!
//! Only transport failures are translated, see [`classify_transport_error`].

use std::error::Error as _;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use http::header;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::router::RoutedCall;

/// Sized for slow deep-research models.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

pub type Chunk = Result<Bytes, std::io::Error>;

/// A provider answer, success or not, relayed verbatim.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: http::StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl UpstreamReply {
    pub fn is_error(&self) -> bool {
        self.status.as_u16() >= 400
    }
}

/// Map a transport failure to the proxy's error taxonomy.
///
/// The `reqwest` error only says "error sending request"; the useful part is
/// further down the source chain (hyper connect error, resolver, io error).
pub fn classify_transport_error(err: &reqwest::Error, verbose: bool) -> ProxyError {
    if err.is_timeout() {
        return ProxyError::Timeout;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return ProxyError::ProviderUnavailable,
                std::io::ErrorKind::TimedOut => return ProxyError::Timeout,
                _ => {}
            }
        }
        let text = cause.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return ProxyError::Dns;
        }
        source = cause.source();
    }

    ProxyError::Internal {
        detail: verbose.then(|| err.to_string()),
    }
}

fn outbound_request(client: &reqwest::Client, call: &RoutedCall) -> reqwest::RequestBuilder {
    let mut rb = client
        .post(&call.descriptor.upstream_url)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in &call.descriptor.headers {
        if name.eq_ignore_ascii_case("authorization") {
            continue;
        }
        match (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => rb = rb.header(name, value),
            _ => warn!("Skipping invalid custom header for {}: {}", call.descriptor.id, name),
        }
    }
    rb.bearer_auth(&call.credential).json(&call.payload)
}

/// Non-streaming relay.
pub async fn send(
    client: &reqwest::Client,
    call: &RoutedCall,
    timeout: Duration,
    verbose: bool,
) -> Result<UpstreamReply, ProxyError> {
    let response = outbound_request(client, call)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            error!(error = %e, is_timeout = e.is_timeout(), is_connect = e.is_connect(), "Upstream request failed");
            classify_transport_error(&e, verbose)
        })?;

    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.bytes().await.map_err(|e| {
        error!(error = %e, "Failed reading upstream body");
        classify_transport_error(&e, verbose)
    })?;

    Ok(UpstreamReply {
        status,
        content_type,
        body,
    })
}

/// Frame used when the provider rejects a streaming request.
pub fn upstream_error_frame(body: &[u8]) -> String {
    let payload = serde_json::from_slice::<Value>(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));
    format!("data: {}\n\n", json!({ "error": payload }))
}

/// Logs when the caller goes away before the relay finished. Dropping the
/// stream drops the in-flight upstream request with it.
struct DisconnectGuard {
    request_id: String,
    finished: bool,
}

impl DisconnectGuard {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.finished {
            info!(request_id = %self.request_id, "Client disconnected, upstream request cancelled");
        }
    }
}

async fn open_upstream(
    client: &reqwest::Client,
    call: &RoutedCall,
    timeout: Duration,
    verbose: bool,
) -> Result<reqwest::Response, ProxyError> {
    let request = outbound_request(client, call).header(header::ACCEPT, "text/event-stream");
    match tokio::time::timeout(timeout, request.send()).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(error = %e, is_timeout = e.is_timeout(), is_connect = e.is_connect(), "Upstream stream request failed");
            Err(classify_transport_error(&e, verbose))
        }
        Err(_) => {
            error!(timeout_secs = timeout.as_secs_f64(), "Upstream stream request timed out");
            Err(ProxyError::Timeout)
        }
    }
}

/// Streaming relay. The timeout bounds the wait for the response head only.
pub fn stream(
    client: reqwest::Client,
    call: RoutedCall,
    timeout: Duration,
    verbose: bool,
    request_id: String,
) -> impl Stream<Item = Chunk> + 'static {
    async_stream::stream! {
        let mut guard = DisconnectGuard::new(request_id.clone());
        let started = Instant::now();

        match open_upstream(&client, &call, timeout, verbose).await {
            Err(err) => {
                let frame: Chunk = Ok(Bytes::from(err.sse_frame()));
                yield frame;
            }
            Ok(response) if response.status().as_u16() >= 400 => {
                let status = response.status();
                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "Failed to read provider error body");
                        Bytes::new()
                    }
                };
                error!(request_id = %request_id, status = status.as_u16(), "Provider returned error");
                yield Ok(Bytes::from(upstream_error_frame(&body)));
            }
            Ok(response) => {
                let mut upstream = response.bytes_stream();
                let mut chunks = 0usize;
                while let Some(next) = upstream.next().await {
                    match next {
                        Ok(bytes) => {
                            chunks += 1;
                            yield Ok(bytes);
                        }
                        Err(e) => {
                            warn!(request_id = %request_id, error = %e, "Upstream stream interrupted");
                            break;
                        }
                    }
                }
                debug!(request_id = %request_id, chunks, "Upstream stream drained");
            }
        }

        guard.finish();
        info!(
            request_id = %request_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "Stream completed"
        );
    }
}
