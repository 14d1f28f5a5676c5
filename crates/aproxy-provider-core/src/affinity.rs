use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use aproxy_common::epoch_ms;

use crate::pool::{ClientProvider, Pool};

const TTL_MS: i64 = 2 * 60 * 60 * 1000;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityEntry {
    pub pool: Pool,
    pub account: u32,
    pub assigned_at: i64,
}

#[derive(Debug, Default)]
struct AffinityInner {
    entries: HashMap<(String, ClientProvider), AffinityEntry>,
    counts: HashMap<(Pool, u32), u32>,
}

impl AffinityInner {
    fn decrement(&mut self, pool: Pool, account: u32) {
        if let Some(count) = self.counts.get_mut(&(pool, account)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(&(pool, account));
            }
        }
    }
}

/// Thread-to-`(pool, account)` pinning with an active-count index.
///
/// The counts index is maintained inside the same lock as the primary map;
/// every set/clear/expire keeps `Σ counts == live entries`.
#[derive(Debug, Default)]
pub struct AffinityMap {
    inner: Mutex<AffinityInner>,
}

impl AffinityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-and-touch: a live pin gets its `assigned_at` bumped; an expired
    /// pin is evicted on the spot.
    pub fn get(&self, thread_id: &str, provider: ClientProvider) -> Option<AffinityEntry> {
        let now = epoch_ms();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (thread_id.to_string(), provider);
        let expired = match inner.entries.get_mut(&key) {
            Some(entry) if now - entry.assigned_at <= TTL_MS => {
                entry.assigned_at = now;
                return Some(*entry);
            }
            Some(entry) => (entry.pool, entry.account),
            None => return None,
        };
        inner.entries.remove(&key);
        inner.decrement(expired.0, expired.1);
        None
    }

    /// Read without touching; test and diagnostics hook.
    pub fn peek(&self, thread_id: &str, provider: ClientProvider) -> Option<AffinityEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .get(&(thread_id.to_string(), provider))
            .copied()
    }

    pub fn set(&self, thread_id: &str, provider: ClientProvider, pool: Pool, account: u32) {
        let now = epoch_ms();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (thread_id.to_string(), provider);
        if let Some(previous) = inner.entries.get(&key).copied() {
            if previous.pool == pool && previous.account == account {
                if let Some(entry) = inner.entries.get_mut(&key) {
                    entry.assigned_at = now;
                }
                return;
            }
            inner.decrement(previous.pool, previous.account);
        }
        inner.entries.insert(
            key,
            AffinityEntry {
                pool,
                account,
                assigned_at: now,
            },
        );
        *inner.counts.entry((pool, account)).or_insert(0) += 1;
    }

    pub fn clear(&self, thread_id: &str, provider: ClientProvider) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.entries.remove(&(thread_id.to_string(), provider)) {
            inner.decrement(entry.pool, entry.account);
        }
    }

    /// O(1) read of the active-thread count used for least-connections.
    pub fn active_count(&self, pool: Pool, account: u32) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.counts.get(&(pool, account)).copied().unwrap_or(0)
    }

    /// Evicts everything past the TTL. The periodic sweep calls this; it is
    /// public so shutdown-adjacent tests can drive it directly.
    pub fn evict_expired(&self) -> usize {
        let now = epoch_ms();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<((String, ClientProvider), AffinityEntry)> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.assigned_at > TTL_MS)
            .map(|(key, entry)| (key.clone(), *entry))
            .collect();
        for (key, entry) in &expired {
            inner.entries.remove(key);
            inner.decrement(entry.pool, entry.account);
        }
        expired.len()
    }

    /// Starts the 10-minute cleanup sweep. The handle is aborted at
    /// shutdown.
    pub fn start_cleanup(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let map = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = map.evict_expired();
                if evicted > 0 {
                    debug!(evicted, "affinity cleanup evicted stale pins");
                }
            }
        })
    }

    #[doc(hidden)]
    pub fn backdate_for_tests(&self, thread_id: &str, provider: ClientProvider, age_ms: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.entries.get_mut(&(thread_id.to_string(), provider)) {
            entry.assigned_at -= age_ms;
        }
    }
}
