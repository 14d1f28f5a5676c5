use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tracing::debug;

use aproxy_provider_core::{AdapterBody, AdapterResponse, Headers};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(String),
}

/// Response headers never replayed to the client: the body is re-framed by
/// the proxy, so upstream encoding and length claims are stale.
const STRIPPED_RESPONSE_HEADERS: [&str; 3] = ["content-encoding", "content-length", "transfer-encoding"];
const STRIPPED_REQUEST_HEADERS: [&str; 4] = ["host", "content-length", "connection", "accept-encoding"];

/// Pass-through forwarding to the paid gateway. Redirects are surfaced to
/// the client (`redirect: manual`), never followed here.
pub struct UpstreamProxy {
    client: wreq::Client,
    base: String,
    api_key: Option<String>,
}

impl UpstreamProxy {
    pub fn new(base: String, api_key: Option<String>) -> Result<Self, UpstreamError> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(600))
            .redirect(wreq::redirect::Policy::none())
            .build()
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base,
            api_key,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub async fn forward(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &Headers,
        body: Bytes,
    ) -> Result<AdapterResponse, UpstreamError> {
        let url = format!("{}{}", self.base.trim_end_matches('/'), path_and_query);
        debug!(method, url, "forwarding to paid upstream");

        let method = wreq::Method::from_bytes(method.as_bytes())
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in headers {
            if STRIPPED_REQUEST_HEADERS
                .iter()
                .any(|s| name.eq_ignore_ascii_case(s))
                || name.eq_ignore_ascii_case("authorization")
            {
                continue;
            }
            request = request.header(name, value);
        }
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }
        if !body.is_empty() || method_has_body(&method) {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;

        let status = response.status().as_u16();
        let response_headers: Headers = response
            .headers()
            .iter()
            .filter(|(name, _)| {
                !STRIPPED_RESPONSE_HEADERS
                    .iter()
                    .any(|s| name.as_str().eq_ignore_ascii_case(s))
            })
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        // Stream the body through untouched.
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(item) = stream.next().await {
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(AdapterResponse {
            status,
            headers: response_headers,
            body: AdapterBody::Stream(rx),
        })
    }
}

fn method_has_body(method: &wreq::Method) -> bool {
    *method == wreq::Method::POST || *method == wreq::Method::PUT || *method == wreq::Method::PATCH
}
