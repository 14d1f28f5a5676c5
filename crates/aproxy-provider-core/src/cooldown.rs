use std::collections::HashMap;
use std::sync::Mutex;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::debug;

use aproxy_common::epoch_ms;

use crate::pool::Pool;

const BURST_MIN_MS: i64 = 30_000;
const EXHAUST_RETRY_AFTER_S: u64 = 300;
const EXHAUST_CONSECUTIVE: u32 = 3;
const EXHAUST_MS: i64 = 2 * 60 * 60 * 1000;
const FORBIDDEN_MS: i64 = 24 * 60 * 60 * 1000;

/// Parsed `Retry-After` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    Seconds(u64),
    Unknown,
}

impl RetryAfter {
    pub fn seconds(&self) -> Option<u64> {
        match self {
            RetryAfter::Seconds(s) => Some(*s),
            RetryAfter::Unknown => None,
        }
    }
}

static HTTP_DATE: &[FormatItem<'_>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Accepts integer seconds or an HTTP-date; anything else is `Unknown` and
/// the caller's 30 s floor applies.
pub fn parse_retry_after(value: &str) -> RetryAfter {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return RetryAfter::Seconds(seconds);
    }
    if let Ok(at) = PrimitiveDateTime::parse(value, HTTP_DATE) {
        let delta = at.assume_utc().unix_timestamp() - OffsetDateTime::now_utc().unix_timestamp();
        if delta > 0 {
            return RetryAfter::Seconds(delta as u64);
        }
        return RetryAfter::Seconds(0);
    }
    RetryAfter::Unknown
}

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    until: i64,
    exhausted: bool,
    consecutive_429: u32,
}

/// Per-`(pool, account)` burst/exhaustion state. Entries expire lazily on
/// read; a success removes the entry outright.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    entries: Mutex<HashMap<(Pool, u32), CooldownEntry>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_429(&self, pool: Pool, account: u32, retry_after: Option<u64>) {
        self.record_429_at(epoch_ms(), pool, account, retry_after);
    }

    fn record_429_at(&self, now: i64, pool: Pool, account: u32, retry_after: Option<u64>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry((pool, account)).or_insert(CooldownEntry {
            until: 0,
            exhausted: false,
            consecutive_429: 0,
        });
        entry.consecutive_429 += 1;

        let long_retry = retry_after.is_some_and(|s| s > EXHAUST_RETRY_AFTER_S);
        if long_retry || entry.consecutive_429 >= EXHAUST_CONSECUTIVE {
            entry.exhausted = true;
            entry.until = now + EXHAUST_MS;
            debug!(
                pool = pool.as_str(),
                account,
                consecutive = entry.consecutive_429,
                "account exhausted for 2h"
            );
        } else {
            let wait_ms = retry_after
                .map(|s| (s as i64) * 1000)
                .unwrap_or(0)
                .max(BURST_MIN_MS);
            entry.until = now + wait_ms;
        }
    }

    pub fn record_403(&self, pool: Pool, account: u32) {
        self.record_403_at(epoch_ms(), pool, account);
    }

    fn record_403_at(&self, now: i64, pool: Pool, account: u32) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            (pool, account),
            CooldownEntry {
                until: now + FORBIDDEN_MS,
                exhausted: true,
                consecutive_429: 0,
            },
        );
        debug!(pool = pool.as_str(), account, "account disabled for 24h after 403");
    }

    pub fn record_success(&self, pool: Pool, account: u32) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&(pool, account));
    }

    pub fn is_cooling_down(&self, pool: Pool, account: u32) -> bool {
        self.read_at(epoch_ms(), pool, account).is_some()
    }

    pub fn is_exhausted(&self, pool: Pool, account: u32) -> bool {
        self.read_at(epoch_ms(), pool, account)
            .map(|e| e.exhausted)
            .unwrap_or(false)
    }

    /// Lazy expiry: an entry past `until` is removed on read.
    fn read_at(&self, now: i64, pool: Pool, account: u32) -> Option<CooldownEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(&(pool, account)).copied() {
            Some(entry) if now >= entry.until => {
                entries.remove(&(pool, account));
                None
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_retry_after_sets_burst_cooldown() {
        let tracker = CooldownTracker::new();
        tracker.record_429_at(1_000, Pool::Codex, 0, Some(60));
        let entry = tracker.read_at(1_000, Pool::Codex, 0).unwrap();
        assert!(!entry.exhausted);
        assert_eq!(entry.until, 1_000 + 60_000);
    }

    #[test]
    fn missing_retry_after_uses_thirty_second_floor() {
        let tracker = CooldownTracker::new();
        tracker.record_429_at(0, Pool::Gemini, 2, None);
        let entry = tracker.read_at(0, Pool::Gemini, 2).unwrap();
        assert_eq!(entry.until, 30_000);
        tracker.record_429_at(0, Pool::Gemini, 3, Some(1));
        let entry = tracker.read_at(0, Pool::Gemini, 3).unwrap();
        assert_eq!(entry.until, 30_000);
    }

    #[test]
    fn long_retry_after_exhausts_immediately() {
        let tracker = CooldownTracker::new();
        tracker.record_429_at(0, Pool::Anthropic, 0, Some(600));
        let entry = tracker.read_at(0, Pool::Anthropic, 0).unwrap();
        assert!(entry.exhausted);
        assert_eq!(entry.until, EXHAUST_MS);
    }

    #[test]
    fn three_consecutive_429s_exhaust() {
        let tracker = CooldownTracker::new();
        tracker.record_429_at(0, Pool::Codex, 0, None);
        tracker.record_429_at(40_000, Pool::Codex, 0, None);
        assert!(!tracker.read_at(40_000, Pool::Codex, 0).unwrap().exhausted);
        tracker.record_429_at(80_000, Pool::Codex, 0, None);
        let entry = tracker.read_at(80_000, Pool::Codex, 0).unwrap();
        assert!(entry.exhausted);
        assert_eq!(entry.until, 80_000 + EXHAUST_MS);
    }

    #[test]
    fn forbidden_disables_for_a_day() {
        let tracker = CooldownTracker::new();
        tracker.record_403_at(0, Pool::Antigravity, 1);
        let entry = tracker.read_at(0, Pool::Antigravity, 1).unwrap();
        assert!(entry.exhausted);
        assert_eq!(entry.until, FORBIDDEN_MS);
        assert_eq!(entry.consecutive_429, 0);
    }

    #[test]
    fn success_clears_and_expiry_is_lazy() {
        let tracker = CooldownTracker::new();
        tracker.record_429_at(0, Pool::Codex, 0, Some(60));
        tracker.record_success(Pool::Codex, 0);
        assert!(tracker.read_at(0, Pool::Codex, 0).is_none());

        tracker.record_429_at(0, Pool::Codex, 1, Some(60));
        assert!(tracker.read_at(59_999, Pool::Codex, 1).is_some());
        assert!(tracker.read_at(60_000, Pool::Codex, 1).is_none());
        // Expired entry was removed, so the 429 counter restarted.
        tracker.record_429_at(70_000, Pool::Codex, 1, None);
        assert_eq!(
            tracker.read_at(70_000, Pool::Codex, 1).unwrap().consecutive_429,
            1
        );
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        assert_eq!(parse_retry_after("17"), RetryAfter::Seconds(17));
        assert_eq!(parse_retry_after("  5 "), RetryAfter::Seconds(5));
        assert_eq!(parse_retry_after("soon"), RetryAfter::Unknown);
        // A date in the past clamps to zero rather than going negative.
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            RetryAfter::Seconds(0)
        );
    }
}
