use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use aproxy_oauth::{OauthEngine, codex};
use aproxy_provider_core::{
    AdapterError, AdapterResponse, ForwardRequest, Headers, Pool, ProviderAdapter, header_set,
};
use aproxy_transform::responses::{ResponsesToChat, chat_to_responses, normalize_responses_body};
use aproxy_transform::stage::ChunkRewrite;

use crate::client::{UpstreamClient, finish_response};

const BASE_URL: &str = "https://chatgpt.com/backend-api";
const RESPONSES_PATH: &str = "/codex/responses";
const USER_AGENT: &str = "codex_cli_rs/0.48.0 (aproxy)";
const VERSION: &str = "0.48.0";

pub struct CodexAdapter {
    oauth: Arc<OauthEngine>,
    client: Arc<UpstreamClient>,
}

impl CodexAdapter {
    pub fn new(oauth: Arc<OauthEngine>, client: Arc<UpstreamClient>) -> Self {
        Self { oauth, client }
    }
}

#[async_trait]
impl ProviderAdapter for CodexAdapter {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn pool(&self) -> Pool {
        Pool::Codex
    }

    async fn accounts(&self) -> Vec<u32> {
        let Ok(records) = self.oauth.store().get_all("codex").await else {
            return Vec::new();
        };
        records
            .into_iter()
            .filter(|(_, record)| record.usable())
            .map(|(account, _)| account)
            .collect()
    }

    async fn is_available(&self, account: u32) -> bool {
        matches!(
            self.oauth.store().get("codex", account).await,
            Ok(Some(record)) if record.usable()
        )
    }

    async fn forward(&self, request: ForwardRequest) -> Result<AdapterResponse, AdapterError> {
        let token = self
            .oauth
            .token(codex(), request.account)
            .await
            .map_err(|err| AdapterError::Other(err.to_string()))?
            .ok_or(AdapterError::NoCredential(request.account))?;
        let record = self
            .oauth
            .store()
            .get("codex", request.account)
            .await
            .map_err(|err| AdapterError::Other(err.to_string()))?
            .ok_or(AdapterError::NoCredential(request.account))?;

        let url = format!("{BASE_URL}{}", map_path(&request.path));

        // The backend only streams. Transcode Chat Completions bodies;
        // already-Responses-shaped bodies are normalized in place.
        let parsed: Option<Value> = serde_json::from_slice(&request.body).ok();
        let thread_id = request.thread_id.as_deref();
        let (body, transcoded) = match parsed {
            Some(value) => match chat_to_responses(&value, thread_id) {
                Some(transformed) => (Bytes::from(transformed.to_string()), true),
                None => {
                    let mut value = value;
                    normalize_responses_body(&mut value, "high", thread_id);
                    (Bytes::from(value.to_string()), false)
                }
            },
            None => (request.body.clone(), false),
        };
        if !request.stream {
            debug!("client asked for a non-streaming codex response; forcing stream");
        }

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", &format!("Bearer {token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "Accept", "text/event-stream");
        header_set(&mut headers, "OpenAI-Beta", "responses=experimental");
        header_set(&mut headers, "originator", "codex_cli_rs");
        header_set(&mut headers, "User-Agent", USER_AGENT);
        header_set(&mut headers, "Version", VERSION);
        if let Some(account_id) = record.account_id.as_deref() {
            header_set(&mut headers, "chatgpt-account-id", account_id);
        }
        if let Some(thread_id) = thread_id {
            header_set(&mut headers, "session_id", thread_id);
            header_set(&mut headers, "conversation_id", thread_id);
        }

        let raw = self.client.post_with_retry(&url, &headers, body, true).await?;
        let rewrite: Option<Box<dyn ChunkRewrite>> = transcoded.then(|| {
            let model = request.model.as_deref().unwrap_or("gpt-5.2");
            Box::new(ResponsesToChat::new(model)) as Box<dyn ChunkRewrite>
        });
        Ok(finish_response(raw, true, rewrite))
    }
}

/// Both Chat Completions and Responses land on the same backend route.
fn map_path(path: &str) -> &str {
    match path {
        "/v1/responses" | "/v1/chat/completions" => RESPONSES_PATH,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_and_responses_paths_collapse() {
        assert_eq!(map_path("/v1/chat/completions"), "/codex/responses");
        assert_eq!(map_path("/v1/responses"), "/codex/responses");
        assert_eq!(map_path("/v1/other"), "/v1/other");
    }
}
