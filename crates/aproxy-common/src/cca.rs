//! Cloud Code Assist endpoint tiers.
//!
//! The tier order matters: project discovery probes prod first, while the
//! Antigravity surface prefers the sandbox tiers and only lands on prod as a
//! last resort. Both orders are exposed as data so callers never hard-code
//! the cascade.

pub const PROD: &str = "https://cloudcode-pa.googleapis.com";
pub const DAILY: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
pub const AUTOPUSH: &str = "https://autopush-cloudcode-pa.sandbox.googleapis.com";

/// Probe order for `loadCodeAssist` project discovery.
pub const DISCOVERY_ORDER: [&str; 3] = [PROD, DAILY, AUTOPUSH];

/// Failover order for Antigravity request traffic.
pub const ANTIGRAVITY_ORDER: [&str; 3] = [DAILY, AUTOPUSH, PROD];

/// `"{endpoint}/v1internal:{action}"`, optionally with `?alt=sse`.
pub fn action_url(endpoint: &str, action: &str, sse: bool) -> String {
    let base = endpoint.trim_end_matches('/');
    if sse {
        format!("{base}/v1internal:{action}?alt=sse")
    } else {
        format!("{base}/v1internal:{action}")
    }
}
