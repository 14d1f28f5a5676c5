use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use aproxy_common::RouteDecision;
use aproxy_provider_core::{
    AdapterError, AdapterResponse, AffinityMap, ClientProvider, CooldownTracker, ForwardRequest,
    Pool, ProviderAdapter, Router,
};

struct FakeAdapter {
    pool: Pool,
    accounts: Vec<u32>,
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn name(&self) -> &'static str {
        self.pool.as_str()
    }

    fn pool(&self) -> Pool {
        self.pool
    }

    async fn accounts(&self) -> Vec<u32> {
        self.accounts.clone()
    }

    async fn is_available(&self, account: u32) -> bool {
        self.accounts.contains(&account)
    }

    async fn forward(&self, _request: ForwardRequest) -> Result<AdapterResponse, AdapterError> {
        Ok(AdapterResponse::json(200, serde_json::json!({})))
    }
}

fn router_with(pools: Vec<(Pool, Vec<u32>)>) -> Router {
    let mut adapters: HashMap<Pool, Arc<dyn ProviderAdapter>> = HashMap::new();
    for (pool, accounts) in pools {
        adapters.insert(pool, Arc::new(FakeAdapter { pool, accounts }));
    }
    Router::new(
        adapters,
        Arc::new(AffinityMap::new()),
        Arc::new(CooldownTracker::new()),
    )
}

#[tokio::test]
async fn lowest_active_count_wins_ties_by_order() {
    let router = router_with(vec![(Pool::Codex, vec![0, 1])]);

    let first = router.route(ClientProvider::Openai, None, None).await;
    assert_eq!(first.decision, RouteDecision::LocalCodex);
    assert_eq!(first.account, 0);

    // Pin a thread on account 0; the next threadless request still sees
    // account 1 as least loaded.
    router
        .affinity()
        .set("t-a", ClientProvider::Openai, Pool::Codex, 0);
    let second = router.route(ClientProvider::Openai, None, None).await;
    assert_eq!(second.account, 1);
}

#[tokio::test]
async fn no_candidates_returns_upstream_sentinel() {
    let router = router_with(vec![]);
    let result = router.route(ClientProvider::Anthropic, Some("m"), None).await;
    assert_eq!(result.decision, RouteDecision::AmpUpstream);
    assert!(result.handler.is_none());
    assert_eq!(result.account, 0);
    assert!(result.pool.is_none());
}

#[tokio::test]
async fn cooling_candidates_are_filtered() {
    let router = router_with(vec![(Pool::Codex, vec![0, 1])]);
    router.cooldown().record_429(Pool::Codex, 0, Some(60));

    let result = router.route(ClientProvider::Openai, None, None).await;
    assert_eq!(result.account, 1);

    router.cooldown().record_429(Pool::Codex, 1, Some(60));
    let result = router.route(ClientProvider::Openai, None, None).await;
    assert_eq!(result.decision, RouteDecision::AmpUpstream);
}

#[tokio::test]
async fn thread_affinity_sticks_across_requests() {
    let router = router_with(vec![
        (Pool::Gemini, vec![0]),
        (Pool::Antigravity, vec![0]),
    ]);

    let first = router
        .route(ClientProvider::Google, None, Some("T"))
        .await;
    assert_eq!(first.pool, Some(Pool::Gemini));

    // Load up the pinned pair; stickiness must beat least-connections.
    router
        .affinity()
        .set("other-1", ClientProvider::Google, Pool::Gemini, 0);
    router
        .affinity()
        .set("other-2", ClientProvider::Google, Pool::Gemini, 0);

    let second = router
        .route(ClientProvider::Google, None, Some("T"))
        .await;
    assert_eq!(second.pool, Some(Pool::Gemini));
    assert_eq!(second.account, 0);
}

#[tokio::test]
async fn exhaustion_breaks_the_pin_and_reroutes() {
    let router = router_with(vec![
        (Pool::Gemini, vec![0]),
        (Pool::Antigravity, vec![0]),
    ]);

    let first = router
        .route(ClientProvider::Google, None, Some("T"))
        .await;
    assert_eq!(first.pool, Some(Pool::Gemini));

    let rerouted = router
        .reroute_after_429(ClientProvider::Google, Pool::Gemini, 0, Some(600), Some("T"))
        .await;
    assert_eq!(rerouted.pool, Some(Pool::Antigravity));

    // Pin moved to the surviving pool.
    let pin = router.affinity().peek("T", ClientProvider::Google).unwrap();
    assert_eq!(pin.pool, Pool::Antigravity);

    let next = router.route(ClientProvider::Google, None, Some("T")).await;
    assert_eq!(next.pool, Some(Pool::Antigravity));
}

#[tokio::test]
async fn burst_cooldown_routes_away_without_breaking_pin() {
    let router = router_with(vec![
        (Pool::Gemini, vec![0]),
        (Pool::Antigravity, vec![0]),
    ]);

    router.route(ClientProvider::Google, None, Some("T")).await;
    router.cooldown().record_429(Pool::Gemini, 0, Some(60));

    let rerouted = router.route(ClientProvider::Google, None, Some("T")).await;
    assert_eq!(rerouted.pool, Some(Pool::Antigravity));
    // select() re-pins to the pair it handed out.
    let pin = router.affinity().peek("T", ClientProvider::Google).unwrap();
    assert_eq!(pin.pool, Pool::Antigravity);
}

#[tokio::test]
async fn reroute_counts_429s_toward_exhaustion() {
    let router = router_with(vec![(Pool::Codex, vec![0, 1])]);

    for _ in 0..3 {
        router
            .reroute_after_429(ClientProvider::Openai, Pool::Codex, 0, None, None)
            .await;
    }
    assert!(router.cooldown().is_exhausted(Pool::Codex, 0));
}
