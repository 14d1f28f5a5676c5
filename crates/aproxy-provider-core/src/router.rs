use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use aproxy_common::RouteDecision;

use crate::adapter::ProviderAdapter;
use crate::affinity::AffinityMap;
use crate::cooldown::CooldownTracker;
use crate::pool::{ClientProvider, Pool};

/// Outcome of a routing decision. `handler == None` is the upstream-fallback
/// sentinel: no local account can serve this request.
#[derive(Clone)]
pub struct RouteResult {
    pub decision: RouteDecision,
    pub provider: ClientProvider,
    pub model: Option<String>,
    pub handler: Option<Arc<dyn ProviderAdapter>>,
    pub account: u32,
    pub pool: Option<Pool>,
}

impl RouteResult {
    fn upstream(provider: ClientProvider, model: Option<String>) -> Self {
        Self {
            decision: RouteDecision::AmpUpstream,
            provider,
            model,
            handler: None,
            account: 0,
            pool: None,
        }
    }
}

/// Account selection: thread affinity first, then a least-connections pick
/// over candidates that are not cooling down.
pub struct Router {
    adapters: HashMap<Pool, Arc<dyn ProviderAdapter>>,
    affinity: Arc<AffinityMap>,
    cooldown: Arc<CooldownTracker>,
}

impl Router {
    pub fn new(
        adapters: HashMap<Pool, Arc<dyn ProviderAdapter>>,
        affinity: Arc<AffinityMap>,
        cooldown: Arc<CooldownTracker>,
    ) -> Self {
        Self {
            adapters,
            affinity,
            cooldown,
        }
    }

    pub fn affinity(&self) -> &Arc<AffinityMap> {
        &self.affinity
    }

    pub fn cooldown(&self) -> &Arc<CooldownTracker> {
        &self.cooldown
    }

    pub fn adapter(&self, pool: Pool) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters.get(&pool)
    }

    pub async fn route(
        &self,
        provider: ClientProvider,
        model: Option<&str>,
        thread_id: Option<&str>,
    ) -> RouteResult {
        let model = model.map(str::to_string);

        if let Some(thread_id) = thread_id
            && let Some(pin) = self.affinity.get(thread_id, provider)
        {
            let exhausted = self.cooldown.is_exhausted(pin.pool, pin.account);
            let available = match self.adapters.get(&pin.pool) {
                Some(adapter) => adapter.is_available(pin.account).await,
                None => false,
            };
            if exhausted || !available {
                debug!(
                    thread = thread_id,
                    pool = pin.pool.as_str(),
                    account = pin.account,
                    exhausted,
                    "breaking affinity pin"
                );
                self.affinity.clear(thread_id, provider);
            } else if !self.cooldown.is_cooling_down(pin.pool, pin.account) {
                let adapter = self.adapters.get(&pin.pool).cloned();
                return RouteResult {
                    decision: pin.pool.decision(),
                    provider,
                    model,
                    handler: adapter,
                    account: pin.account,
                    pool: Some(pin.pool),
                };
            }
            // Burst cooldown on the pinned pair: route elsewhere for now
            // but leave the pin in place.
        }

        self.select(provider, model, thread_id).await
    }

    /// Records a 429 on the failed pair, clears the pin when that pushed it
    /// into exhaustion, and picks the next candidate.
    pub async fn reroute_after_429(
        &self,
        provider: ClientProvider,
        failed_pool: Pool,
        failed_account: u32,
        retry_after: Option<u64>,
        thread_id: Option<&str>,
    ) -> RouteResult {
        self.cooldown
            .record_429(failed_pool, failed_account, retry_after);
        if let Some(thread_id) = thread_id
            && self.cooldown.is_exhausted(failed_pool, failed_account)
            && let Some(pin) = self.affinity.peek(thread_id, provider)
            && pin.pool == failed_pool
            && pin.account == failed_account
        {
            self.affinity.clear(thread_id, provider);
        }
        self.select(provider, None, thread_id).await
    }

    async fn select(
        &self,
        provider: ClientProvider,
        model: Option<String>,
        thread_id: Option<&str>,
    ) -> RouteResult {
        let mut candidates: Vec<(Pool, u32)> = Vec::new();
        for pool in provider.pools() {
            let Some(adapter) = self.adapters.get(pool) else {
                continue;
            };
            for account in adapter.accounts().await {
                candidates.push((*pool, account));
            }
        }

        candidates.retain(|(pool, account)| !self.cooldown.is_cooling_down(*pool, *account));
        if candidates.is_empty() {
            return RouteResult::upstream(provider, model);
        }

        // Least connections; the first candidate wins ties, so candidate
        // order is the tie-breaker.
        let mut best = candidates[0];
        let mut best_count = self.affinity.active_count(best.0, best.1);
        for (pool, account) in candidates.iter().copied().skip(1) {
            let count = self.affinity.active_count(pool, account);
            if count < best_count {
                best = (pool, account);
                best_count = count;
            }
        }
        let (pool, account) = best;

        if let Some(thread_id) = thread_id {
            self.affinity.set(thread_id, provider, pool, account);
        }

        RouteResult {
            decision: pool.decision(),
            provider,
            model,
            handler: self.adapters.get(&pool).cloned(),
            account,
            pool: Some(pool),
        }
    }
}
