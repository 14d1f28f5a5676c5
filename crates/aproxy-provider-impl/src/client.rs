use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, warn};

use aproxy_provider_core::{
    AdapterBody, AdapterError, AdapterResponse, Headers, header_get, header_set,
};
use aproxy_transform::stage::{ChunkRewrite, Passthrough, SseRewriteStage};

/// Transient retries happen here; 429 handling belongs to the router layer
/// and is deliberately excluded.
const MAX_TRANSIENT_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const TRANSIENT_STATUSES: [u16; 5] = [408, 500, 502, 503, 504];

/// Upstream headers forwarded verbatim when proxying an SSE response.
const FORWARDED_HEADERS: [&str; 10] = [
    "x-request-id",
    "request-id",
    "anthropic-ratelimit-requests-limit",
    "anthropic-ratelimit-requests-remaining",
    "anthropic-ratelimit-tokens-limit",
    "anthropic-ratelimit-tokens-remaining",
    "x-ratelimit-limit-requests",
    "x-ratelimit-remaining-requests",
    "x-ratelimit-limit-tokens",
    "x-ratelimit-remaining-tokens",
];

#[derive(Debug)]
pub enum RawBody {
    Bytes(Bytes),
    Stream(tokio::sync::mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: RawBody,
}

/// Shared wreq client for provider traffic. Streaming bodies are bridged
/// over a channel with a per-chunk idle timeout.
pub struct UpstreamClient {
    client: wreq::Client,
    stream_idle_timeout: Duration,
}

impl UpstreamClient {
    pub fn new() -> Result<Self, AdapterError> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| AdapterError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            stream_idle_timeout: Duration::from_secs(30),
        })
    }

    /// POST with transient-error retry: network failures and
    /// {408, 500, 502, 503, 504} are retried with `500 ms × attempt`
    /// backoff, then the last answer is surfaced.
    pub async fn post_with_retry(
        &self,
        url: &str,
        headers: &Headers,
        body: Bytes,
        want_stream: bool,
    ) -> Result<RawResponse, AdapterError> {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            match self.post_once(url, headers, body.clone(), want_stream).await {
                Ok(response) => {
                    let transient = TRANSIENT_STATUSES.contains(&response.status);
                    if transient && attempt < MAX_TRANSIENT_RETRIES {
                        debug!(url, status = response.status, attempt, "retrying transient status");
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) if attempt < MAX_TRANSIENT_RETRIES => {
                    debug!(url, %err, attempt, "retrying transient transport error");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Single POST without retry; the Antigravity endpoint cascade owns its
    /// own failover policy.
    pub async fn post_once(
        &self,
        url: &str,
        headers: &Headers,
        body: Bytes,
        want_stream: bool,
    ) -> Result<RawResponse, AdapterError> {
        let mut request = self.client.post(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|err| AdapterError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let response_headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let success = (200..300).contains(&status);
        if !success || !want_stream {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| AdapterError::Transport(err.to_string()))?;
            return Ok(RawResponse {
                status,
                headers: response_headers,
                body: RawBody::Bytes(bytes),
            });
        }

        let idle = self.stream_idle_timeout;
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let Ok(item) = next else { break };
                let Some(item) = item else { break };
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(RawResponse {
            status,
            headers: response_headers,
            body: RawBody::Stream(rx),
        })
    }
}

/// Shapes a raw upstream answer into the response handed back to the
/// pipeline, wiring the SSE rewrite in for streamed bodies.
pub fn finish_response(
    raw: RawResponse,
    want_stream: bool,
    rewrite: Option<Box<dyn ChunkRewrite>>,
) -> AdapterResponse {
    let success = (200..300).contains(&raw.status);
    let sse = header_get(&raw.headers, "content-type")
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    if !success {
        if let RawBody::Bytes(body) = &raw.body {
            warn!(
                status = raw.status,
                body = %String::from_utf8_lossy(&body[..body.len().min(2048)]),
                "upstream returned an error response"
            );
        }
        return AdapterResponse {
            status: raw.status,
            headers: raw.headers,
            body: match raw.body {
                RawBody::Bytes(bytes) => AdapterBody::Bytes(bytes),
                RawBody::Stream(rx) => AdapterBody::Stream(rx),
            },
        };
    }

    if sse || want_stream {
        let headers = sse_headers(&raw.headers);
        let mut stage =
            SseRewriteStage::new(rewrite.unwrap_or_else(|| Box::new(Passthrough) as Box<dyn ChunkRewrite>));
        match raw.body {
            RawBody::Bytes(bytes) => {
                let mut out = stage.push(&bytes).to_vec();
                out.extend_from_slice(&stage.finish());
                AdapterResponse {
                    status: raw.status,
                    headers,
                    body: AdapterBody::Bytes(Bytes::from(out)),
                }
            }
            RawBody::Stream(mut upstream) => {
                let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
                tokio::spawn(async move {
                    while let Some(chunk) = upstream.recv().await {
                        let out = stage.push(&chunk);
                        if !out.is_empty() && tx.send(out).await.is_err() {
                            return;
                        }
                    }
                    let tail = stage.finish();
                    if !tail.is_empty() {
                        let _ = tx.send(tail).await;
                    }
                });
                AdapterResponse {
                    status: raw.status,
                    headers,
                    body: AdapterBody::Stream(rx),
                }
            }
        }
    } else {
        let body = match raw.body {
            RawBody::Bytes(bytes) => bytes,
            RawBody::Stream(rx) => {
                return AdapterResponse {
                    status: raw.status,
                    headers: raw.headers,
                    body: AdapterBody::Stream(rx),
                };
            }
        };
        let body = match rewrite {
            Some(mut rewrite) => {
                let text = String::from_utf8_lossy(&body);
                match rewrite.rewrite_body(&text) {
                    Some(rewritten) => Bytes::from(rewritten),
                    None => body,
                }
            }
            None => body,
        };
        AdapterResponse {
            status: raw.status,
            headers: raw.headers,
            body: AdapterBody::Bytes(body),
        }
    }
}

fn sse_headers(upstream: &Headers) -> Headers {
    let mut headers: Headers = vec![
        ("content-type".to_string(), "text/event-stream".to_string()),
        ("cache-control".to_string(), "no-cache".to_string()),
        ("connection".to_string(), "keep-alive".to_string()),
    ];
    for name in FORWARDED_HEADERS {
        if let Some(value) = header_get(upstream, name) {
            header_set(&mut headers, name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use aproxy_transform::ModelRewrite;

    #[test]
    fn sse_headers_forward_rate_limit_values() {
        let upstream = vec![
            (
                "anthropic-ratelimit-tokens-remaining".to_string(),
                "1000".to_string(),
            ),
            ("x-request-id".to_string(), "req-1".to_string()),
            ("set-cookie".to_string(), "secret".to_string()),
        ];
        let headers = sse_headers(&upstream);
        assert_eq!(
            header_get(&headers, "anthropic-ratelimit-tokens-remaining"),
            Some("1000")
        );
        assert_eq!(header_get(&headers, "x-request-id"), Some("req-1"));
        assert_eq!(header_get(&headers, "set-cookie"), None);
        assert_eq!(header_get(&headers, "cache-control"), Some("no-cache"));
    }

    #[test]
    fn buffered_sse_body_is_rewritten() {
        let raw = RawResponse {
            status: 200,
            headers: vec![(
                "content-type".to_string(),
                "text/event-stream".to_string(),
            )],
            body: RawBody::Bytes(Bytes::from_static(
                b"data: {\"model\":\"claude-sonnet-4-20250514\"}\n\n",
            )),
        };
        let response = finish_response(
            raw,
            true,
            Some(Box::new(ModelRewrite::new("claude-opus-4-6"))),
        );
        let AdapterBody::Bytes(body) = response.body else {
            panic!("expected buffered body");
        };
        assert_eq!(&body[..], b"data: {\"model\":\"claude-opus-4-6\"}\n\n");
    }

    #[test]
    fn non_stream_json_body_gets_rewrite_applied() {
        let raw = RawResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: RawBody::Bytes(Bytes::from_static(
                b"{\"model\":\"claude-sonnet-4-20250514\"}",
            )),
        };
        let response = finish_response(
            raw,
            false,
            Some(Box::new(ModelRewrite::new("claude-opus-4-6"))),
        );
        let AdapterBody::Bytes(body) = response.body else {
            panic!("expected buffered body");
        };
        assert_eq!(&body[..], b"{\"model\":\"claude-opus-4-6\"}");
    }

    #[test]
    fn error_statuses_pass_through_unchanged() {
        let raw = RawResponse {
            status: 429,
            headers: vec![("retry-after".to_string(), "3".to_string())],
            body: RawBody::Bytes(Bytes::from_static(b"{\"error\":\"rate\"}")),
        };
        let response = finish_response(raw, true, None);
        assert_eq!(response.status, 429);
        assert_eq!(header_get(&response.headers, "retry-after"), Some("3"));
    }
}
