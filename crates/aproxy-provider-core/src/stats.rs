use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

use aproxy_common::{RouteDecision, epoch_ms};

const CAPACITY: usize = 1_000;

/// One completed request, as it lands in the rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEntry {
    pub at_ms: i64,
    pub decision: RouteDecision,
    pub provider: String,
    pub model: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub requests_by_route: HashMap<String, u64>,
    pub count_429: u64,
    pub average_duration_ms: u64,
    pub uptime_ms: i64,
}

#[derive(Debug)]
struct StatsInner {
    entries: VecDeque<RequestEntry>,
    total: u64,
}

/// Fixed-capacity rolling window of request outcomes. In-memory only; the
/// window resets with the process.
#[derive(Debug)]
pub struct StatsRing {
    inner: Mutex<StatsInner>,
    started_at: i64,
}

impl StatsRing {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                entries: VecDeque::with_capacity(CAPACITY),
                total: 0,
            }),
            started_at: epoch_ms(),
        }
    }

    pub fn record(&self, entry: RequestEntry) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.len() == CAPACITY {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
        inner.total += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_route: HashMap<String, u64> = HashMap::new();
        let mut count_429 = 0u64;
        let mut duration_sum = 0u64;
        for entry in &inner.entries {
            *by_route.entry(entry.decision.as_str().to_string()).or_insert(0) += 1;
            if entry.status == 429 {
                count_429 += 1;
            }
            duration_sum += entry.duration_ms;
        }
        let average_duration_ms = if inner.entries.is_empty() {
            0
        } else {
            duration_sum / inner.entries.len() as u64
        };
        StatsSnapshot {
            total_requests: inner.total,
            requests_by_route: by_route,
            count_429,
            average_duration_ms,
            uptime_ms: epoch_ms() - self.started_at,
        }
    }

    /// Last `min(n, window)` entries in insertion order.
    pub fn recent_requests(&self, n: usize) -> Vec<RequestEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let len = inner.entries.len();
        inner.entries.iter().skip(len.saturating_sub(n)).cloned().collect()
    }
}

impl Default for StatsRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: u16, duration_ms: u64) -> RequestEntry {
        RequestEntry {
            at_ms: epoch_ms(),
            decision: RouteDecision::LocalCodex,
            provider: "openai".to_string(),
            model: None,
            status,
            duration_ms,
        }
    }

    #[test]
    fn overwrites_oldest_once_full_and_keeps_total() {
        let ring = StatsRing::new();
        for i in 0..(CAPACITY as u64 + 5) {
            ring.record(entry(200, i));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.total_requests, CAPACITY as u64 + 5);

        let recent = ring.recent_requests(3);
        let durations: Vec<u64> = recent.iter().map(|e| e.duration_ms).collect();
        assert_eq!(
            durations,
            vec![CAPACITY as u64 + 2, CAPACITY as u64 + 3, CAPACITY as u64 + 4]
        );
    }

    #[test]
    fn snapshot_counts_429s_and_averages() {
        let ring = StatsRing::new();
        ring.record(entry(200, 100));
        ring.record(entry(429, 300));
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.count_429, 1);
        assert_eq!(snapshot.average_duration_ms, 200);
        assert_eq!(snapshot.requests_by_route.get("LOCAL_CODEX"), Some(&2));
    }

    #[test]
    fn recent_requests_clamps_to_window() {
        let ring = StatsRing::new();
        ring.record(entry(200, 1));
        assert_eq!(ring.recent_requests(10).len(), 1);
    }
}
