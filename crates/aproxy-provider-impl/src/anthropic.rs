use std::sync::Arc;

use async_trait::async_trait;

use aproxy_oauth::{OauthEngine, anthropic};
use aproxy_provider_core::{
    AdapterError, AdapterResponse, ForwardRequest, Headers, Pool, ProviderAdapter, header_get,
    header_set,
};
use aproxy_transform::ModelRewrite;
use aproxy_transform::stage::ChunkRewrite;

use crate::client::{UpstreamClient, finish_response};

const BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const USER_AGENT: &str = "claude-cli/1.0.83 (external, cli)";

/// Features requested on every OAuth-authenticated call.
const FIXED_BETAS: [&str; 4] = [
    "claude-code-20250219",
    "oauth-2025-04-20",
    "interleaved-thinking-2025-05-14",
    "prompt-caching-scope-2026-01-05",
];
/// Client-requested features that must not ride along on subscription auth.
const DENIED_BETAS: [&str; 1] = ["context-1m-2025-08-07"];

const STAINLESS_HEADERS: [(&str, &str); 4] = [
    ("X-Stainless-Lang", "js"),
    ("X-Stainless-Runtime", "node"),
    ("X-Stainless-Retry-Count", "0"),
    ("X-Stainless-Timeout", "600"),
];

pub struct AnthropicAdapter {
    oauth: Arc<OauthEngine>,
    client: Arc<UpstreamClient>,
}

impl AnthropicAdapter {
    pub fn new(oauth: Arc<OauthEngine>, client: Arc<UpstreamClient>) -> Self {
        Self { oauth, client }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn pool(&self) -> Pool {
        Pool::Anthropic
    }

    async fn accounts(&self) -> Vec<u32> {
        let Ok(records) = self.oauth.store().get_all("anthropic").await else {
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
            self.oauth.store().get("anthropic", account).await,
            Ok(Some(record)) if record.usable()
        )
    }

    async fn forward(&self, request: ForwardRequest) -> Result<AdapterResponse, AdapterError> {
        let token = self
            .oauth
            .token(anthropic(), request.account)
            .await
            .map_err(|err| AdapterError::Other(err.to_string()))?
            .ok_or(AdapterError::NoCredential(request.account))?;

        let url = format!("{BASE_URL}{}", request.path);
        let mut headers: Headers = Vec::new();
        for (name, value) in STAINLESS_HEADERS {
            header_set(&mut headers, name, value);
        }
        header_set(&mut headers, "Authorization", &format!("Bearer {token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "Anthropic-Version", ANTHROPIC_VERSION);
        header_set(
            &mut headers,
            "Anthropic-Dangerous-Direct-Browser-Access",
            "true",
        );
        header_set(
            &mut headers,
            "Anthropic-Beta",
            &beta_header(header_get(&request.client_headers, "anthropic-beta")),
        );
        header_set(&mut headers, "User-Agent", USER_AGENT);
        header_set(&mut headers, "X-App", "cli");

        let raw = self
            .client
            .post_with_retry(&url, &headers, request.body, request.stream)
            .await?;
        let rewrite = request
            .model
            .as_deref()
            .map(|model| Box::new(ModelRewrite::new(model)) as Box<dyn ChunkRewrite>);
        Ok(finish_response(raw, request.stream, rewrite))
    }
}

/// Union of the fixed beta set with the client's `anthropic-beta` values,
/// minus the denylist, preserving first-seen order.
fn beta_header(client_betas: Option<&str>) -> String {
    let mut betas: Vec<String> = FIXED_BETAS.iter().map(|b| b.to_string()).collect();
    if let Some(client_betas) = client_betas {
        for beta in client_betas.split(',') {
            let beta = beta.trim();
            if beta.is_empty() || DENIED_BETAS.contains(&beta) {
                continue;
            }
            if !betas.iter().any(|b| b == beta) {
                betas.push(beta.to_string());
            }
        }
    }
    betas.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beta_header_unions_and_denies() {
        let merged = beta_header(Some("context-1m-2025-08-07, files-api-2025-04-14"));
        assert!(merged.contains("claude-code-20250219"));
        assert!(merged.contains("oauth-2025-04-20"));
        assert!(merged.contains("files-api-2025-04-14"));
        assert!(!merged.contains("context-1m-2025-08-07"));
    }

    #[test]
    fn beta_header_deduplicates_client_values() {
        let merged = beta_header(Some("oauth-2025-04-20"));
        assert_eq!(
            merged.matches("oauth-2025-04-20").count(),
            1,
            "fixed beta must not repeat"
        );
    }
}
