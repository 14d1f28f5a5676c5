use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};

use aproxy_common::cca;
use aproxy_oauth::{FALLBACK_PROJECT_ID, OauthEngine, google};
use aproxy_provider_core::{
    AdapterError, AdapterResponse, ForwardRequest, Headers, Pool, ProviderAdapter, header_set,
};
use aproxy_transform::envelope::{EnvelopeConfig, EnvelopeUnwrap, wrap_request};

use crate::client::{UpstreamClient, finish_response};

const ENVELOPE: EnvelopeConfig = EnvelopeConfig {
    user_agent: "pi-coding-agent",
    request_id_prefix: "pi",
    request_type: None,
};

pub struct GeminiAdapter {
    oauth: Arc<OauthEngine>,
    client: Arc<UpstreamClient>,
}

impl GeminiAdapter {
    pub fn new(oauth: Arc<OauthEngine>, client: Arc<UpstreamClient>) -> Self {
        Self { oauth, client }
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn pool(&self) -> Pool {
        Pool::Gemini
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
        let url = cca::action_url(cca::PROD, &action, streaming_action);

        let inner: Value = serde_json::from_slice(&request.body).unwrap_or(json!({}));
        let wrapped = wrap_request(&inner, &model, &project, &ENVELOPE);

        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", &format!("Bearer {token}"));
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "Accept", "application/json");
        header_set(&mut headers, "User-Agent", ENVELOPE.user_agent);

        let raw = self
            .client
            .post_with_retry(&url, &headers, Bytes::from(wrapped.to_string()), want_stream)
            .await?;
        Ok(finish_response(
            raw,
            want_stream,
            Some(Box::new(EnvelopeUnwrap)),
        ))
    }
}

/// `…/models/<model>:<action>` → `(model, action)`. Anything else is not a
/// locally servable Gemini call.
pub(crate) fn parse_model_action(path: &str) -> Option<(String, String)> {
    let (_, rest) = path.split_once("models/")?;
    let (model, action) = rest.split_once(':')?;
    if model.is_empty() || action.is_empty() {
        return None;
    }
    let action = action.split('?').next().unwrap_or(action);
    Some((model.to_string(), action.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_action_parses_stream_calls() {
        let (model, action) =
            parse_model_action("/v1beta/models/gemini-3-flash-preview:streamGenerateContent")
                .unwrap();
        assert_eq!(model, "gemini-3-flash-preview");
        assert_eq!(action, "streamGenerateContent");
    }

    #[test]
    fn query_strings_are_dropped_from_the_action() {
        let (_, action) =
            parse_model_action("/v1beta/models/gemini-3-pro:streamGenerateContent?alt=sse")
                .unwrap();
        assert_eq!(action, "streamGenerateContent");
    }

    #[test]
    fn non_model_paths_are_rejected() {
        assert!(parse_model_action("/v1beta/models").is_none());
        assert!(parse_model_action("/v1beta/models/gemini-3-pro").is_none());
        assert!(parse_model_action("/v1beta/tunedModels").is_none());
    }
}
