use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use aproxy_common::RouteDecision;
use aproxy_provider_core::{
    AdapterResponse, ClientProvider, ForwardRequest, Headers, RouteResult, Router, header_get,
    parse_retry_after,
};

use crate::body::{ParsedBody, resolve_model};

/// Bound on the cache-preserving same-account wait. Anything longer is
/// cheaper to reroute than to hold the connection open.
const CACHE_PRESERVE_WAIT_MAX_S: u64 = 10;
const MAX_REROUTE_ATTEMPTS: u32 = 4;

/// What the pipeline decided for one request. `response == None` means the
/// paid gateway takes over.
pub struct LocalOutcome {
    pub decision: RouteDecision,
    pub model: Option<String>,
    pub response: Option<AdapterResponse>,
}

impl LocalOutcome {
    fn fallback(model: Option<String>) -> Self {
        Self {
            decision: RouteDecision::AmpUpstream,
            model,
            response: None,
        }
    }
}

/// Drives one provider-routed request through routing, delivery, and the
/// 429/401 recovery state machine.
pub struct Engine {
    router: Arc<Router>,
}

impl Engine {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn handle(
        &self,
        provider: ClientProvider,
        subpath: &str,
        client_headers: Headers,
        raw_body: Bytes,
        thread_id: Option<&str>,
    ) -> LocalOutcome {
        let parsed = ParsedBody::new(raw_body, subpath);
        let model = parsed.amp_model();

        let route = self
            .router
            .route(provider, model.as_deref(), thread_id)
            .await;
        if route.handler.is_none() {
            info!(
                provider = provider.as_str(),
                model = model.as_deref().unwrap_or("<none>"),
                decision = route.decision.as_str(),
                "no local candidate; falling back to upstream"
            );
            return LocalOutcome::fallback(model);
        }
        info!(
            provider = provider.as_str(),
            model = model.as_deref().unwrap_or("<none>"),
            decision = route.decision.as_str(),
            account = route.account,
            "routing locally"
        );

        self.deliver(route, provider, subpath, &parsed, client_headers, thread_id)
            .await
    }

    async fn deliver(
        &self,
        route: RouteResult,
        provider: ClientProvider,
        subpath: &str,
        parsed: &ParsedBody,
        client_headers: Headers,
        thread_id: Option<&str>,
    ) -> LocalOutcome {
        let model = parsed.amp_model();

        let Some(response) = self
            .forward(&route, subpath, parsed, &client_headers, thread_id)
            .await
        else {
            return LocalOutcome::fallback(model);
        };

        let (pool, account) = match route.pool {
            Some(pool) => (pool, route.account),
            None => return LocalOutcome::fallback(model),
        };

        match response.status {
            401 => {
                // Credentials may have been revoked server-side; soft-fail
                // to the paid gateway rather than hammering the account.
                debug!(pool = pool.as_str(), account, "local 401; falling back");
                LocalOutcome::fallback(model)
            }
            429 => {
                self.recover_from_429(
                    route,
                    response,
                    provider,
                    subpath,
                    parsed,
                    client_headers,
                    thread_id,
                )
                .await
            }
            _ => {
                self.router.cooldown().record_success(pool, account);
                LocalOutcome {
                    decision: route.decision,
                    model,
                    response: Some(response),
                }
            }
        }
    }

    /// §429 recovery: an optional same-account cache-preserving wait, then
    /// a bounded reroute loop over the remaining candidates.
    #[allow(clippy::too_many_arguments)]
    async fn recover_from_429(
        &self,
        route: RouteResult,
        first_response: AdapterResponse,
        provider: ClientProvider,
        subpath: &str,
        parsed: &ParsedBody,
        client_headers: Headers,
        thread_id: Option<&str>,
    ) -> LocalOutcome {
        let model = parsed.amp_model();
        let (mut failed_pool, mut failed_account) = match route.pool {
            Some(pool) => (pool, route.account),
            None => return LocalOutcome::fallback(model),
        };
        let mut retry_after = retry_after_seconds(&first_response);

        // The wait runs at most once per original request; it keeps the
        // provider-side prompt cache warm across a short burst limit.
        if let Some(wait) = retry_after.filter(|s| *s <= CACHE_PRESERVE_WAIT_MAX_S) {
            debug!(
                pool = failed_pool.as_str(),
                account = failed_account,
                wait, "cache-preserve wait before same-account retry"
            );
            tokio::time::sleep(Duration::from_secs(wait)).await;
            let Some(retried) = self
                .forward(&route, subpath, parsed, &client_headers, thread_id)
                .await
            else {
                return LocalOutcome::fallback(model);
            };
            match retried.status {
                401 => return LocalOutcome::fallback(model),
                429 => {
                    // Does not consume a reroute attempt.
                    retry_after = retry_after_seconds(&retried);
                    self.router
                        .cooldown()
                        .record_429(failed_pool, failed_account, retry_after);
                }
                _ => {
                    self.router
                        .cooldown()
                        .record_success(failed_pool, failed_account);
                    return LocalOutcome {
                        decision: route.decision,
                        model,
                        response: Some(retried),
                    };
                }
            }
        }

        for attempt in 0..MAX_REROUTE_ATTEMPTS {
            let rerouted = self
                .router
                .reroute_after_429(provider, failed_pool, failed_account, retry_after, thread_id)
                .await;
            let Some(pool) = rerouted.pool else {
                break;
            };
            info!(
                provider = provider.as_str(),
                attempt,
                pool = pool.as_str(),
                account = rerouted.account,
                "rerouting after 429"
            );
            let Some(response) = self
                .forward(&rerouted, subpath, parsed, &client_headers, thread_id)
                .await
            else {
                break;
            };
            match response.status {
                401 => break,
                429 => {
                    failed_pool = pool;
                    failed_account = rerouted.account;
                    retry_after = retry_after_seconds(&response);
                }
                _ => {
                    self.router.cooldown().record_success(pool, rerouted.account);
                    return LocalOutcome {
                        decision: rerouted.decision,
                        model,
                        response: Some(response),
                    };
                }
            }
        }

        info!(
            provider = provider.as_str(),
            "reroute attempts exhausted; falling back to upstream"
        );
        LocalOutcome::fallback(model)
    }

    async fn forward(
        &self,
        route: &RouteResult,
        subpath: &str,
        parsed: &ParsedBody,
        client_headers: &Headers,
        thread_id: Option<&str>,
    ) -> Option<AdapterResponse> {
        let handler = route.handler.as_ref()?;
        let model = parsed.amp_model();
        let resolved = model.as_deref().map(resolve_model);
        let request = ForwardRequest {
            path: subpath.to_string(),
            body: parsed.forward_body(resolved),
            client_headers: client_headers.clone(),
            account: route.account,
            stream: parsed.stream(),
            model: model.clone(),
            thread_id: thread_id.map(str::to_string),
        };
        match handler.forward(request).await {
            Ok(response) => Some(response),
            Err(err) => {
                warn!(
                    adapter = handler.name(),
                    account = route.account,
                    %err,
                    "adapter forward failed; falling back"
                );
                None
            }
        }
    }
}

fn retry_after_seconds(response: &AdapterResponse) -> Option<u64> {
    header_get(&response.headers, "retry-after")
        .map(parse_retry_after)
        .and_then(|ra| ra.seconds())
}
