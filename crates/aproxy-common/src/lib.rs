use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod cca;

#[derive(Debug, thiserror::Error)]
pub enum ProxyConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged runtime configuration for the proxy process.
///
/// Merge order: defaults < environment < CLI flags, applied as patches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub port: u16,
    /// Base URL of the paid gateway used for fallback and pass-through.
    pub upstream_base: String,
    /// API key presented to the paid gateway on fallback, when known.
    pub amp_api_key: Option<String>,
    /// Directory holding the credential database. Created 0o700.
    pub data_dir: PathBuf,
    pub providers: ProviderToggles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderToggles {
    pub anthropic: bool,
    pub codex: bool,
    pub google: bool,
}

impl Default for ProviderToggles {
    fn default() -> Self {
        Self {
            anthropic: true,
            codex: true,
            google: true,
        }
    }
}

/// Optional layer used for merging proxy config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfigPatch {
    pub port: Option<u16>,
    pub upstream_base: Option<String>,
    pub amp_api_key: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub providers: Option<ProviderToggles>,
}

impl ProxyConfigPatch {
    pub fn overlay(&mut self, other: ProxyConfigPatch) {
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.upstream_base.is_some() {
            self.upstream_base = other.upstream_base;
        }
        if other.amp_api_key.is_some() {
            self.amp_api_key = other.amp_api_key;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.providers.is_some() {
            self.providers = other.providers;
        }
    }

    pub fn into_config(self) -> Result<ProxyConfig, ProxyConfigError> {
        Ok(ProxyConfig {
            port: self.port.unwrap_or(7867),
            upstream_base: self
                .upstream_base
                .unwrap_or_else(|| "https://ampcode.com".to_string()),
            amp_api_key: self.amp_api_key,
            data_dir: self
                .data_dir
                .ok_or(ProxyConfigError::MissingField("data_dir"))?,
            providers: self.providers.unwrap_or_default(),
        })
    }
}

impl From<ProxyConfig> for ProxyConfigPatch {
    fn from(value: ProxyConfig) -> Self {
        Self {
            port: Some(value.port),
            upstream_base: Some(value.upstream_base),
            amp_api_key: value.amp_api_key,
            data_dir: Some(value.data_dir),
            providers: Some(value.providers),
        }
    }
}

/// Route decision tags as they appear in logs and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteDecision {
    LocalClaude,
    LocalCodex,
    LocalGemini,
    LocalAntigravity,
    AmpUpstream,
}

impl RouteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteDecision::LocalClaude => "LOCAL_CLAUDE",
            RouteDecision::LocalCodex => "LOCAL_CODEX",
            RouteDecision::LocalGemini => "LOCAL_GEMINI",
            RouteDecision::LocalAntigravity => "LOCAL_ANTIGRAVITY",
            RouteDecision::AmpUpstream => "AMP_UPSTREAM",
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// All persisted and in-memory expiry state uses absolute epoch-ms values.
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overlay_prefers_latest() {
        let mut base = ProxyConfigPatch {
            port: Some(7867),
            upstream_base: Some("https://ampcode.com".to_string()),
            ..Default::default()
        };
        base.overlay(ProxyConfigPatch {
            port: Some(9100),
            ..Default::default()
        });
        assert_eq!(base.port, Some(9100));
        assert_eq!(base.upstream_base.as_deref(), Some("https://ampcode.com"));
    }

    #[test]
    fn into_config_requires_data_dir() {
        let err = ProxyConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, ProxyConfigError::MissingField("data_dir")));
    }
}
