use async_trait::async_trait;
use bytes::Bytes;

use aproxy_common::RouteDecision;

use crate::headers::Headers;
use crate::pool::Pool;

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

/// Request handed to an adapter after routing.
#[derive(Debug)]
pub struct ForwardRequest {
    /// Provider sub-path as the client sent it (e.g. `/v1/messages`).
    pub path: String,
    pub body: Bytes,
    /// Inbound headers the adapter may merge from (e.g. `anthropic-beta`).
    pub client_headers: Headers,
    pub account: u32,
    /// Whether the client asked for a streaming response.
    pub stream: bool,
    /// Client-requested model name, for response rewriting.
    pub model: Option<String>,
    pub thread_id: Option<String>,
}

#[derive(Debug)]
pub enum AdapterBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

/// Provider response as delivered to the pipeline. Non-2xx statuses come
/// back as `Ok` responses; only transport-level failures use the error
/// channel.
#[derive(Debug)]
pub struct AdapterResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: AdapterBody,
}

impl AdapterResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        let bytes = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: AdapterBody::Bytes(bytes),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("no usable credential for account {0}")]
    NoCredential(u32),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Other(String),
}

/// One locally-served backend binding (Anthropic, Codex, Gemini,
/// Antigravity).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn pool(&self) -> Pool;

    fn route_decision(&self) -> RouteDecision {
        self.pool().decision()
    }

    /// Accounts that hold a refresh token, in slot order. The router only
    /// ever selects from this set.
    async fn accounts(&self) -> Vec<u32>;

    async fn is_available(&self, account: u32) -> bool;

    async fn account_count(&self) -> u32 {
        self.accounts().await.len() as u32
    }

    async fn forward(&self, request: ForwardRequest) -> Result<AdapterResponse, AdapterError>;
}
