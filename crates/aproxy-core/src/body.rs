use std::sync::OnceLock;

use bytes::Bytes;
use serde_json::Value;

use aproxy_transform::rewrite_body_model;

use crate::classify::model_from_url;

/// Lazily parsed request body.
///
/// `raw` is what the client sent; `forward_body` re-serializes only when a
/// model rewrite is actually required, otherwise the original bytes go out
/// untouched.
pub struct ParsedBody {
    raw: Bytes,
    url_model: Option<String>,
    parsed: OnceLock<Option<Value>>,
}

impl ParsedBody {
    pub fn new(raw: Bytes, path: &str) -> Self {
        Self {
            raw,
            url_model: model_from_url(path),
            parsed: OnceLock::new(),
        }
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Full parse, materialized once on first need.
    pub fn parsed(&self) -> Option<&Value> {
        self.parsed
            .get_or_init(|| serde_json::from_slice(&self.raw).ok())
            .as_ref()
    }

    /// Client-requested model: the body's `model` field, with the URL as a
    /// fallback for Gemini-style `models/<m>:<action>` paths.
    pub fn amp_model(&self) -> Option<String> {
        if let Some(model) = self
            .parsed()
            .and_then(|v| v.get("model"))
            .and_then(Value::as_str)
        {
            return Some(model.to_string());
        }
        self.url_model.clone()
    }

    pub fn stream(&self) -> bool {
        self.parsed()
            .and_then(|v| v.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Body to forward upstream. Identical to `raw` unless `resolved`
    /// differs from the model in the body.
    pub fn forward_body(&self, resolved: Option<&str>) -> Bytes {
        let Some(resolved) = resolved else {
            return self.raw.clone();
        };
        let Some(parsed) = self.parsed() else {
            return self.raw.clone();
        };
        match parsed.get("model").and_then(Value::as_str) {
            Some(current) if current != resolved => {
                Bytes::from(rewrite_body_model(parsed, resolved).to_string())
            }
            _ => self.raw.clone(),
        }
    }
}

/// Maps a client model name onto what the local subscription serves.
/// Normalization only; applying it twice changes nothing.
pub fn resolve_model(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_prefers_body_over_url() {
        let body = ParsedBody::new(
            Bytes::from_static(b"{\"model\":\"claude-opus-4-6\",\"stream\":true}"),
            "/v1/messages",
        );
        assert_eq!(body.amp_model().as_deref(), Some("claude-opus-4-6"));
        assert!(body.stream());
    }

    #[test]
    fn url_fallback_covers_gemini_paths() {
        let body = ParsedBody::new(
            Bytes::from_static(b"{\"contents\":[]}"),
            "/v1beta/models/gemini-3-pro:streamGenerateContent",
        );
        assert_eq!(body.amp_model().as_deref(), Some("gemini-3-pro"));
        assert!(!body.stream());
    }

    #[test]
    fn forward_body_is_raw_unless_model_changes() {
        let raw = Bytes::from_static(b"{\"model\":\"m1\",\"stream\":false}");
        let body = ParsedBody::new(raw.clone(), "/v1/messages");
        assert_eq!(body.forward_body(Some("m1")), raw);
        assert_eq!(body.forward_body(None), raw);

        let rewritten = body.forward_body(Some("m2"));
        let value: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "m2");
        assert_eq!(value["stream"], false);
    }

    #[test]
    fn malformed_bodies_stay_untouched() {
        let raw = Bytes::from_static(b"not json");
        let body = ParsedBody::new(raw.clone(), "/v1/messages");
        assert_eq!(body.amp_model(), None);
        assert_eq!(body.forward_body(Some("m")), raw);
    }

    #[test]
    fn resolve_model_is_idempotent() {
        assert_eq!(resolve_model("models/gemini-3-pro"), "gemini-3-pro");
        assert_eq!(resolve_model(resolve_model("models/gemini-3-pro")), "gemini-3-pro");
        assert_eq!(resolve_model("claude-opus-4-6"), "claude-opus-4-6");
    }
}
