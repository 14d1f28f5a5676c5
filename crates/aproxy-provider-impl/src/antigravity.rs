use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::warn;

use aproxy_common::cca;
use aproxy_oauth::{FALLBACK_PROJECT_ID, OauthEngine, google};
use aproxy_provider_core::{
    AdapterError, AdapterResponse, ForwardRequest, Headers, Pool, ProviderAdapter, header_set,
};
use aproxy_transform::envelope::{EnvelopeConfig, EnvelopeUnwrap, wrap_request};

use crate::client::{UpstreamClient, finish_response};
use crate::gemini::parse_model_action;

const ENVELOPE: EnvelopeConfig = EnvelopeConfig {
    user_agent: "antigravity",
    request_id_prefix: "agent",
    request_type: Some("agent"),
};

/// Same wire shape as Gemini, but served off the sandbox tiers with a
/// failover cascade. The cascade order lives in `aproxy_common::cca` as
/// data; reliability depends on it staying visible.
pub struct AntigravityAdapter {
    oauth: Arc<OauthEngine>,
    client: Arc<UpstreamClient>,
}

impl AntigravityAdapter {
    pub fn new(oauth: Arc<OauthEngine>, client: Arc<UpstreamClient>) -> Self {
        Self { oauth, client }
    }
}

#[async_trait]
impl ProviderAdapter for AntigravityAdapter {
    fn name(&self) -> &'static str {
        "antigravity"
    }

    fn pool(&self) -> Pool {
        Pool::Antigravity
    }

    async fn accounts(&self) -> Vec<u32> {
        let Ok(records) = self.oauth.store().get_all("google").await else {
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
            self.oauth.store().get("google", account).await,
            Ok(Some(record)) if record.usable()
        )
    }

    async fn forward(&self, request: ForwardRequest) -> Result<AdapterResponse, AdapterError> {
        let Some((model, action)) = parse_model_action(&request.path) else {
            return Ok(AdapterResponse::json(
                401,
                json!({"error": "unsupported path"}),
            ));
        };

        let token = self
            .oauth
            .token(google(), request.account)
            .await
            .map_err(|err| AdapterError::Other(err.to_string()))?
            .ok_or(AdapterError::NoCredential(request.account))?;
        let record = self
            .oauth
            .store()
            .get("google", request.account)
            .await
            .map_err(|err| AdapterError::Other(err.to_string()))?
            .ok_or(AdapterError::NoCredential(request.account))?;
        let project = record
            .project_id
            .clone()
            .unwrap_or_else(|| FALLBACK_PROJECT_ID.to_string());

        let streaming_action = action.starts_with("stream");
        let want_stream = request.stream || streaming_action;

        let inner: Value = serde_json::from_slice(&request.body).unwrap_or(json!({}));
        let wrapped = wrap_request(&inner, &model, &project, &ENVELOPE);
        let body = Bytes::from(wrapped.to_string());

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", &format!("Bearer {token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "Accept", "application/json");
        header_set(&mut headers, "User-Agent", ENVELOPE.user_agent);

        // Advance on any HTTP >= 500 or connect failure; everything else is
        // an answer worth returning (429s included; the router owns those).
        let mut failures: Vec<String> = Vec::new();
        for endpoint in cca::ANTIGRAVITY_ORDER {
            let url = cca::action_url(endpoint, &action, streaming_action);
            match self
                .client
                .post_once(&url, &headers, body.clone(), want_stream)
                .await
            {
                Ok(raw) if raw.status >= 500 => {
                    warn!(endpoint, status = raw.status, "antigravity endpoint failed; advancing");
                    failures.push(format!("{endpoint}: HTTP {}", raw.status));
                }
                Ok(raw) => {
                    return Ok(finish_response(
                        raw,
                        want_stream,
                        Some(Box::new(EnvelopeUnwrap)),
                    ));
                }
                Err(err) => {
                    warn!(endpoint, %err, "antigravity endpoint unreachable; advancing");
                    failures.push(format!("{endpoint}: {err}"));
                }
            }
        }

        // All tiers down: aggregate the reasons rather than replaying the
        // last upstream body.
        Ok(AdapterResponse::json(
            502,
            json!({"error": "all antigravity endpoints failed", "attempts": failures}),
        ))
    }
}
