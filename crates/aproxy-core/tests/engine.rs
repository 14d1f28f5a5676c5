use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use aproxy_common::RouteDecision;
use aproxy_core::Engine;
use aproxy_provider_core::{
    AdapterBody, AdapterError, AdapterResponse, AffinityMap, ClientProvider, CooldownTracker,
    ForwardRequest, Pool, ProviderAdapter, Router,
};

/// Plays back a per-account script of responses and counts every call.
struct ScriptedAdapter {
    pool: Pool,
    scripts: Mutex<HashMap<u32, Vec<(u16, Option<u64>)>>>,
    calls: Arc<Mutex<Vec<u32>>>,
}

impl ScriptedAdapter {
    fn new(pool: Pool, scripts: HashMap<u32, Vec<(u16, Option<u64>)>>) -> (Self, Arc<Mutex<Vec<u32>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                pool,
                scripts: Mutex::new(scripts),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn pool(&self) -> Pool {
        self.pool
    }

    async fn accounts(&self) -> Vec<u32> {
        let mut accounts: Vec<u32> = self.scripts.lock().unwrap().keys().copied().collect();
        accounts.sort_unstable();
        accounts
    }

    async fn is_available(&self, account: u32) -> bool {
        self.scripts.lock().unwrap().contains_key(&account)
    }

    async fn forward(&self, request: ForwardRequest) -> Result<AdapterResponse, AdapterError> {
        self.calls.lock().unwrap().push(request.account);
        let (status, retry_after) = {
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.get_mut(&request.account).expect("scripted account");
            if script.is_empty() {
                (200, None)
            } else {
                script.remove(0)
            }
        };
        let mut headers = Vec::new();
        if let Some(retry_after) = retry_after {
            headers.push(("retry-after".to_string(), retry_after.to_string()));
        }
        Ok(AdapterResponse {
            status,
            headers,
            body: AdapterBody::Bytes(Bytes::from_static(b"{}")),
        })
    }
}

fn engine_with(pool: Pool, scripts: HashMap<u32, Vec<(u16, Option<u64>)>>) -> (Engine, Arc<Mutex<Vec<u32>>>) {
    let (adapter, calls) = ScriptedAdapter::new(pool, scripts);
    let mut adapters: HashMap<Pool, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(pool, Arc::new(adapter));
    let router = Router::new(
        adapters,
        Arc::new(AffinityMap::new()),
        Arc::new(CooldownTracker::new()),
    );
    (Engine::new(Arc::new(router)), calls)
}

fn body() -> Bytes {
    Bytes::from_static(b"{\"model\":\"gpt-5.2\",\"stream\":true,\"messages\":[]}")
}

#[tokio::test(start_paused = true)]
async fn cache_preserve_retry_then_reroute_serves_the_client() {
    // Account 0: 429 (retry-after 3s), then 429 again. Account 1: 200.
    let (engine, calls) = engine_with(
        Pool::Codex,
        HashMap::from([
            (0, vec![(429, Some(3)), (429, None)]),
            (1, vec![(200, None)]),
        ]),
    );

    let outcome = engine
        .handle(
            ClientProvider::Openai,
            "/v1/chat/completions",
            Vec::new(),
            body(),
            None,
        )
        .await;

    assert_eq!(outcome.decision, RouteDecision::LocalCodex);
    let response = outcome.response.expect("client must see the 200");
    assert_eq!(response.status, 200);
    assert_eq!(calls.lock().unwrap().as_slice(), &[0, 0, 1]);
}

#[tokio::test]
async fn local_401_falls_back_without_retry() {
    let (engine, calls) = engine_with(Pool::Codex, HashMap::from([(0, vec![(401, None)])]));

    let outcome = engine
        .handle(
            ClientProvider::Openai,
            "/v1/chat/completions",
            Vec::new(),
            body(),
            None,
        )
        .await;

    assert_eq!(outcome.decision, RouteDecision::AmpUpstream);
    assert!(outcome.response.is_none());
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn success_returns_response_and_clears_cooldown() {
    let (engine, _) = engine_with(Pool::Anthropic, HashMap::from([(0, vec![(200, None)])]));

    let outcome = engine
        .handle(
            ClientProvider::Anthropic,
            "/v1/messages",
            Vec::new(),
            Bytes::from_static(b"{\"model\":\"claude-opus-4-6\"}"),
            Some("T-1"),
        )
        .await;

    assert_eq!(outcome.decision, RouteDecision::LocalClaude);
    assert_eq!(outcome.response.unwrap().status, 200);
    assert!(!engine.router().cooldown().is_cooling_down(Pool::Anthropic, 0));
}

#[tokio::test]
async fn upstream_5xx_is_surfaced_not_rerouted() {
    let (engine, calls) = engine_with(Pool::Codex, HashMap::from([(0, vec![(503, None)])]));

    let outcome = engine
        .handle(
            ClientProvider::Openai,
            "/v1/chat/completions",
            Vec::new(),
            body(),
            None,
        )
        .await;

    // The adapter layer already retried transients; the engine surfaces
    // whatever came back.
    assert_eq!(outcome.response.unwrap().status, 503);
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rate_limited_without_alternatives_falls_back() {
    let (engine, calls) = engine_with(Pool::Codex, HashMap::from([(0, vec![(429, None)])]));

    let outcome = engine
        .handle(
            ClientProvider::Openai,
            "/v1/chat/completions",
            Vec::new(),
            body(),
            None,
        )
        .await;

    assert!(outcome.response.is_none());
    assert_eq!(outcome.decision, RouteDecision::AmpUpstream);
    // No cache-preserve (no retry-after) and no other candidate: one call.
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert!(engine.router().cooldown().is_cooling_down(Pool::Codex, 0));
}

#[tokio::test(start_paused = true)]
async fn thread_pin_follows_the_reroute() {
    let (engine, _) = engine_with(
        Pool::Codex,
        HashMap::from([
            (0, vec![(429, Some(600))]),
            (1, vec![(200, None)]),
        ]),
    );

    let outcome = engine
        .handle(
            ClientProvider::Openai,
            "/v1/chat/completions",
            Vec::new(),
            body(),
            Some("T-9"),
        )
        .await;

    assert_eq!(outcome.response.unwrap().status, 200);
    let pin = engine
        .router()
        .affinity()
        .peek("T-9", ClientProvider::Openai)
        .expect("pin must exist");
    assert_eq!(pin.account, 1);
    assert!(engine.router().cooldown().is_exhausted(Pool::Codex, 0));
}
