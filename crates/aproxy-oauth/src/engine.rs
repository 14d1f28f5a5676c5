use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::Shared;
use serde_json::Value;
use tracing::{debug, info, warn};

use aproxy_common::epoch_ms;
use aproxy_storage::{CredentialRecord, CredentialStore};

use crate::config::{BodyEncoding, IdentityHook, OauthProviderConfig};
use crate::error::OauthError;
use crate::identity::{self, IdentityParts};
use crate::listener;
use crate::pkce;

/// Stored `expires_at` runs this far ahead of the server's, so a token that
/// looks fresh locally is still accepted upstream.
pub const EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;

const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(1);

type LoginFuture =
    Shared<Pin<Box<dyn Future<Output = Result<CredentialRecord, OauthError>> + Send>>>;

pub struct OauthEngine {
    store: Arc<CredentialStore>,
    client: wreq::Client,
    /// Per-provider single-flight: late login callers await the in-flight
    /// attempt instead of opening a second browser.
    login_flights: Mutex<HashMap<&'static str, LoginFuture>>,
    /// Per-account refresh coalescing. Two tasks must never post the same
    /// refresh token in parallel; providers revoke the older grant.
    refresh_locks: Mutex<HashMap<(&'static str, u32), Arc<tokio::sync::Mutex<()>>>>,
}

impl OauthEngine {
    pub fn new(store: Arc<CredentialStore>) -> Result<Self, OauthError> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| OauthError::Http(err.to_string()))?;
        Ok(Self {
            store,
            client,
            login_flights: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Interactive PKCE login. Returns the stored record, reusing the slot
    /// of a previously seen identity.
    pub async fn login(
        self: Arc<Self>,
        config: &'static OauthProviderConfig,
    ) -> Result<CredentialRecord, OauthError> {
        let flight = {
            let mut flights = self.login_flights.lock().unwrap_or_else(|e| e.into_inner());
            match flights.get(config.provider) {
                Some(flight) => flight.clone(),
                None => {
                    let engine = Arc::clone(&self);
                    let flight: LoginFuture = async move {
                        let result = engine.login_inner(config).await;
                        engine
                            .login_flights
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(config.provider);
                        result
                    }
                    .boxed()
                    .shared();
                    flights.insert(config.provider, flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    async fn login_inner(
        &self,
        config: &'static OauthProviderConfig,
    ) -> Result<CredentialRecord, OauthError> {
        let verifier = pkce::generate_code_verifier();
        let challenge = pkce::generate_code_challenge(&verifier);
        let state = pkce::generate_state();

        let callback_listener =
            listener::bind(config.redirect_host, config.callback_port).await?;

        let authorize_url = build_authorize_url(config, &challenge, &state);
        if open::that(&authorize_url).is_err() {
            println!("Open this URL to continue login:\n{authorize_url}");
        }

        let callback =
            listener::wait_for_callback(callback_listener, config.callback_path, &state).await?;

        let token_response = self
            .exchange_code(config, &callback.code, &verifier, &state)
            .await?;

        let identity = self.extract_identity(config, &token_response).await;
        let mut record = record_from_token_response(config, &token_response, identity)?;

        let account = match self.store.find_by_identity(config.provider, &record).await? {
            Some(account) => {
                debug!(provider = config.provider, account, "login matched existing slot");
                account
            }
            None => self.store.next_account(config.provider).await?,
        };

        if record.refresh_token.is_empty() {
            // Some providers omit the refresh token on re-consent; the
            // prior grant for the same slot is still valid.
            match self.store.get(config.provider, account).await? {
                Some(prior) if !prior.refresh_token.is_empty() => {
                    record.refresh_token = prior.refresh_token;
                }
                _ => return Err(OauthError::MissingRefreshToken),
            }
        }

        self.store.save(config.provider, account, &record).await?;
        info!(
            provider = config.provider,
            account,
            email = record.email.as_deref().unwrap_or("<unknown>"),
            "login complete"
        );
        Ok(record)
    }

    /// Cached access token for one slot; refreshes when stale.
    pub async fn token(
        &self,
        config: &'static OauthProviderConfig,
        account: u32,
    ) -> Result<Option<String>, OauthError> {
        let Some(record) = self.store.get(config.provider, account).await? else {
            return Ok(None);
        };
        if record.fresh(epoch_ms()) {
            return Ok(Some(record.access_token));
        }
        if record.refresh_token.is_empty() {
            return Ok(None);
        }
        let refreshed = self.refresh(config, account).await?;
        Ok(Some(refreshed.access_token))
    }

    /// First fresh token across accounts; otherwise tries a refresh per
    /// account in slot order.
    pub async fn token_from_any(
        &self,
        config: &'static OauthProviderConfig,
    ) -> Result<Option<(String, u32)>, OauthError> {
        let records = self.store.get_all(config.provider).await?;
        let now = epoch_ms();
        for (account, record) in &records {
            if record.fresh(now) {
                return Ok(Some((record.access_token.clone(), *account)));
            }
        }
        for (account, record) in &records {
            if record.refresh_token.is_empty() {
                continue;
            }
            match self.refresh(config, *account).await {
                Ok(refreshed) => return Ok(Some((refreshed.access_token, *account))),
                Err(err) => warn!(
                    provider = config.provider,
                    account, %err, "refresh failed; trying next account"
                ),
            }
        }
        Ok(None)
    }

    pub async fn ready(&self, config: &'static OauthProviderConfig) -> bool {
        self.store.exists(config.provider).await.unwrap_or(false)
    }

    pub async fn account_count(&self, config: &'static OauthProviderConfig) -> u32 {
        self.store.count(config.provider).await.unwrap_or(0)
    }

    /// Refreshes one slot, retrying once after a second. Concurrent calls
    /// for the same slot coalesce: the second caller finds a fresh record
    /// and returns without a network round-trip.
    pub async fn refresh(
        &self,
        config: &'static OauthProviderConfig,
        account: u32,
    ) -> Result<CredentialRecord, OauthError> {
        let lock = self.refresh_lock(config.provider, account);
        let _guard = lock.lock().await;

        let Some(record) = self.store.get(config.provider, account).await? else {
            return Err(OauthError::RefreshFailed {
                provider: config.provider,
                account,
                message: "no stored credential".to_string(),
            });
        };
        if record.fresh(epoch_ms()) {
            return Ok(record);
        }

        let response = match self.post_refresh(config, &record.refresh_token).await {
            Ok(response) => response,
            Err(first_err) => {
                debug!(
                    provider = config.provider,
                    account, %first_err, "refresh failed; retrying once"
                );
                tokio::time::sleep(REFRESH_RETRY_DELAY).await;
                self.post_refresh(config, &record.refresh_token)
                    .await
                    .map_err(|err| OauthError::RefreshFailed {
                        provider: config.provider,
                        account,
                        message: err.to_string(),
                    })?
            }
        };

        let merged = merge_refresh_response(config, &record, &response);
        self.store.save(config.provider, account, &merged).await?;
        Ok(merged)
    }

    fn refresh_lock(&self, provider: &'static str, account: u32) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((provider, account))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn post_refresh(
        &self,
        config: &'static OauthProviderConfig,
        refresh_token: &str,
    ) -> Result<Value, OauthError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", config.client_id),
        ];
        if let Some(secret) = config.client_secret {
            params.push(("client_secret", secret));
        }
        self.post_token_endpoint(config, &params).await
    }

    async fn exchange_code(
        &self,
        config: &'static OauthProviderConfig,
        code: &str,
        verifier: &str,
        state: &str,
    ) -> Result<Value, OauthError> {
        let redirect_uri = config.redirect_uri();
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &redirect_uri),
            ("client_id", config.client_id),
            ("code_verifier", verifier),
        ];
        if config.state_in_token {
            params.push(("state", state));
        }
        if let Some(secret) = config.client_secret {
            params.push(("client_secret", secret));
        }
        self.post_token_endpoint(config, &params).await
    }

    async fn post_token_endpoint(
        &self,
        config: &'static OauthProviderConfig,
        params: &[(&str, &str)],
    ) -> Result<Value, OauthError> {
        let request = self.client.post(config.token_url);
        let request = match config.body_encoding {
            BodyEncoding::Json => {
                let mut body = serde_json::Map::new();
                for (key, value) in params {
                    body.insert((*key).to_string(), Value::String((*value).to_string()));
                }
                request
                    .header("Content-Type", "application/json")
                    .body(serde_json::to_vec(&Value::Object(body)).unwrap_or_default())
            }
            BodyEncoding::Form => {
                let body = params
                    .iter()
                    .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
                    .collect::<Vec<_>>()
                    .join("&");
                request
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .body(body)
            }
        };

        let response = request
            .send()
            .await
            .map_err(|err| OauthError::TokenEndpoint(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| OauthError::TokenEndpoint(err.to_string()))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(OauthError::TokenEndpoint(format!("{status}: {text}")));
        }
        serde_json::from_slice(&bytes).map_err(|err| OauthError::TokenEndpoint(err.to_string()))
    }

    async fn extract_identity(
        &self,
        config: &'static OauthProviderConfig,
        token_response: &Value,
    ) -> IdentityParts {
        let access_token = token_response
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match config.identity {
            IdentityHook::Anthropic => identity::extract_anthropic(token_response),
            IdentityHook::Codex => identity::extract_codex(&self.client, access_token).await,
            IdentityHook::Google => identity::extract_google(&self.client, access_token).await,
        }
    }
}

fn build_authorize_url(
    config: &'static OauthProviderConfig,
    challenge: &str,
    state: &str,
) -> String {
    let redirect_uri = config.redirect_uri();
    let mut params: Vec<(&str, &str)> = vec![
        ("client_id", config.client_id),
        ("response_type", "code"),
        ("redirect_uri", &redirect_uri),
        ("scope", config.scope),
        ("code_challenge", challenge),
        ("code_challenge_method", "S256"),
        ("state", state),
    ];
    params.extend_from_slice(config.extra_authorize_params);

    let query = params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{query}", config.authorize_url)
}

fn record_from_token_response(
    config: &'static OauthProviderConfig,
    response: &Value,
    identity: IdentityParts,
) -> Result<CredentialRecord, OauthError> {
    let access_token = response
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| OauthError::TokenEndpoint("missing access_token".to_string()))?
        .to_string();
    let refresh_token = response
        .get("refresh_token")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(CredentialRecord {
        access_token,
        refresh_token,
        expires_at: expires_at_from(config, response),
        project_id: identity.project_id,
        email: identity.email,
        account_id: identity.account_id,
    })
}

/// Merges a refresh response into the prior record, preserving the refresh
/// token and identity fields the response omits.
fn merge_refresh_response(
    config: &'static OauthProviderConfig,
    prior: &CredentialRecord,
    response: &Value,
) -> CredentialRecord {
    let access_token = response
        .get("access_token")
        .and_then(Value::as_str)
        .unwrap_or(&prior.access_token)
        .to_string();
    let refresh_token = response
        .get("refresh_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(&prior.refresh_token)
        .to_string();
    CredentialRecord {
        access_token,
        refresh_token,
        expires_at: expires_at_from(config, response),
        project_id: prior.project_id.clone(),
        email: prior.email.clone(),
        account_id: prior.account_id.clone(),
    }
}

fn expires_at_from(config: &'static OauthProviderConfig, response: &Value) -> i64 {
    let expires_in_s = response
        .get("expires_in")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let buffer = if config.expiry_buffer {
        EXPIRY_BUFFER_MS
    } else {
        0
    };
    epoch_ms() + expires_in_s * 1000 - buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use serde_json::json;

    #[test]
    fn authorize_url_carries_pkce_state_and_extras() {
        let url = build_authorize_url(config::codex(), "chal", "st4te");
        assert!(url.starts_with("https://auth.openai.com/oauth/authorize?"));
        assert!(url.contains("client_id=app_EMoamEEZ73f0CkXaXp7hrann"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("code_challenge=chal"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("codex_cli_simplified_flow=true"));
        assert!(url.contains(
            "redirect_uri=http%3A%2F%2Flocalhost%3A1455%2Fauth%2Fcallback"
        ));
    }

    #[test]
    fn refresh_merge_preserves_prior_refresh_token_and_identity() {
        let prior = CredentialRecord {
            access_token: "old-at".to_string(),
            refresh_token: "old-rt".to_string(),
            expires_at: 0,
            project_id: Some("p-1".to_string()),
            email: Some("a@example.com".to_string()),
            account_id: Some("u-1".to_string()),
        };
        let merged = merge_refresh_response(
            config::anthropic(),
            &prior,
            &json!({"access_token": "new-at", "expires_in": 3600}),
        );
        assert_eq!(merged.access_token, "new-at");
        assert_eq!(merged.refresh_token, "old-rt");
        assert_eq!(merged.email.as_deref(), Some("a@example.com"));
        assert_eq!(merged.project_id.as_deref(), Some("p-1"));
    }

    #[test]
    fn expiry_buffer_applies_per_config() {
        let now = epoch_ms();
        let buffered = expires_at_from(config::anthropic(), &json!({"expires_in": 3600}));
        assert!(buffered <= now + 3600 * 1000 - EXPIRY_BUFFER_MS + 1000);
        assert!(buffered > now + 3600 * 1000 - EXPIRY_BUFFER_MS - 10_000);

        let unbuffered = expires_at_from(config::google(), &json!({"expires_in": 3600}));
        assert!(unbuffered > buffered);
    }
}
