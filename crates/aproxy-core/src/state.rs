use std::sync::Arc;

use arc_swap::ArcSwap;

use aproxy_common::ProxyConfig;
use aproxy_oauth::OauthEngine;
use aproxy_provider_core::{AffinityMap, CooldownTracker, Router, StatsRing};
use aproxy_provider_impl::{UpstreamClient, build_adapters};
use aproxy_storage::CredentialStore;

use crate::engine::Engine;
use crate::upstream::UpstreamProxy;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("credential store: {0}")]
    Store(#[from] aproxy_storage::StoreError),
    #[error("oauth engine: {0}")]
    Oauth(#[from] aproxy_oauth::OauthError),
    #[error("upstream client: {0}")]
    Upstream(#[from] crate::upstream::UpstreamError),
    #[error("adapter client: {0}")]
    Adapter(String),
}

/// Everything a request handler needs, constructed once before the server
/// starts and shared as explicit dependencies.
pub struct AppState {
    pub config: ArcSwap<ProxyConfig>,
    pub store: Arc<CredentialStore>,
    pub oauth: Arc<OauthEngine>,
    pub engine: Engine,
    pub stats: Arc<StatsRing>,
    pub upstream: UpstreamProxy,
    affinity: Arc<AffinityMap>,
}

impl AppState {
    pub async fn bootstrap(config: ProxyConfig) -> Result<Self, BootstrapError> {
        let store = Arc::new(CredentialStore::open(&config.data_dir).await?);
        let oauth = Arc::new(OauthEngine::new(store.clone())?);
        let client = Arc::new(
            UpstreamClient::new().map_err(|err| BootstrapError::Adapter(err.to_string()))?,
        );

        let affinity = Arc::new(AffinityMap::new());
        let cooldown = Arc::new(CooldownTracker::new());
        let adapters = build_adapters(&config.providers, oauth.clone(), client);
        let router = Arc::new(Router::new(adapters, affinity.clone(), cooldown));

        let upstream = UpstreamProxy::new(config.upstream_base.clone(), config.amp_api_key.clone())?;

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            store,
            oauth,
            engine: Engine::new(router),
            stats: Arc::new(StatsRing::new()),
            upstream,
            affinity,
        })
    }

    /// Starts the periodic sweeps; the returned handles are aborted at
    /// shutdown.
    pub fn start_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            crate::refresh::spawn_token_refresh(self.oauth.clone()),
            self.affinity.clone().start_cleanup(),
        ]
    }
}
