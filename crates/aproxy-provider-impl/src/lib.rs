//! The four local backend bindings and their shared upstream HTTP client.

mod anthropic;
mod antigravity;
mod client;
mod codex;
mod gemini;

pub use anthropic::AnthropicAdapter;
pub use antigravity::AntigravityAdapter;
pub use client::{RawBody, RawResponse, UpstreamClient};
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use aproxy_common::ProviderToggles;
use aproxy_oauth::OauthEngine;
use aproxy_provider_core::{Pool, ProviderAdapter};

/// Builds the adapter registry for the enabled providers.
pub fn build_adapters(
    toggles: &ProviderToggles,
    oauth: Arc<OauthEngine>,
    client: Arc<UpstreamClient>,
) -> HashMap<Pool, Arc<dyn ProviderAdapter>> {
    let mut adapters: HashMap<Pool, Arc<dyn ProviderAdapter>> = HashMap::new();
    if toggles.anthropic {
        adapters.insert(
            Pool::Anthropic,
            Arc::new(AnthropicAdapter::new(oauth.clone(), client.clone())),
        );
    }
    if toggles.codex {
        adapters.insert(
            Pool::Codex,
            Arc::new(CodexAdapter::new(oauth.clone(), client.clone())),
        );
    }
    if toggles.google {
        adapters.insert(
            Pool::Gemini,
            Arc::new(GeminiAdapter::new(oauth.clone(), client.clone())),
        );
        adapters.insert(
            Pool::Antigravity,
            Arc::new(AntigravityAdapter::new(oauth, client)),
        );
    }
    adapters
}
