use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use aproxy_common::epoch_ms;
use aproxy_oauth::{OauthEngine, provider_configs};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Refresh anything that expires within this window.
const REFRESH_AHEAD_MS: i64 = 5 * 60 * 1000;

/// Periodic token refresh across every stored account. One bad account
/// must not abort the sweep.
pub fn spawn_token_refresh(oauth: Arc<OauthEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_once(&oauth).await;
        }
    })
}

pub async fn sweep_once(oauth: &Arc<OauthEngine>) {
    let now = epoch_ms();
    for config in provider_configs() {
        let records = match oauth.store().get_all(config.provider).await {
            Ok(records) => records,
            Err(err) => {
                warn!(provider = config.provider, %err, "refresh sweep could not list accounts");
                continue;
            }
        };
        for (account, record) in records {
            if !record.usable() || record.expires_at - now > REFRESH_AHEAD_MS {
                continue;
            }
            match oauth.refresh(config, account).await {
                Ok(_) => debug!(provider = config.provider, account, "token refreshed"),
                Err(err) => {
                    warn!(provider = config.provider, account, %err, "background refresh failed")
                }
            }
        }
    }
}
