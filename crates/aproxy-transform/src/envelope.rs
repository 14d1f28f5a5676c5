use rand::RngCore;
use serde_json::{Value, json};

use aproxy_common::epoch_ms;

use crate::sse::SseChunk;
use crate::stage::ChunkRewrite;

/// Per-surface knobs for the Cloud Code Assist envelope.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeConfig {
    pub user_agent: &'static str,
    pub request_id_prefix: &'static str,
    pub request_type: Option<&'static str>,
}

/// Wraps a provider-native body into the Cloud Code Assist envelope. Bodies
/// that already carry a `project` field are assumed pre-wrapped.
pub fn wrap_request(body: &Value, model: &str, project: &str, config: &EnvelopeConfig) -> Value {
    if body.get("project").is_some() {
        return body.clone();
    }
    let mut wrapped = json!({
        "project": project,
        "model": model,
        "request": body,
    });
    if let Some(request_type) = config.request_type {
        wrapped["requestType"] = Value::String(request_type.to_string());
    }
    wrapped["userAgent"] = Value::String(config.user_agent.to_string());
    wrapped["requestId"] = Value::String(request_id(config.request_id_prefix));
    wrapped
}

/// `"<prefix>-<epochMillis>-<8-hex>"`.
pub fn request_id(prefix: &str) -> String {
    let mut suffix = [0u8; 4];
    rand::rng().fill_bytes(&mut suffix);
    let hex: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}-{}-{hex}", epoch_ms())
}

/// Inbound half of the envelope: each data payload is `{response, traceId}`
/// and the inner response is what the client SDK expects. `[DONE]` is
/// swallowed entirely; the SDK treats end-of-stream as the terminator.
#[derive(Debug, Default)]
pub struct EnvelopeUnwrap;

impl ChunkRewrite for EnvelopeUnwrap {
    fn rewrite(&mut self, mut chunk: SseChunk) -> Vec<SseChunk> {
        if chunk.data == "[DONE]" {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(&chunk.data) else {
            return vec![chunk];
        };
        match value.get("response") {
            Some(inner) => {
                chunk.data = inner.to_string();
                vec![chunk]
            }
            None => vec![chunk],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CONFIG: EnvelopeConfig = EnvelopeConfig {
        user_agent: "antigravity",
        request_id_prefix: "agent",
        request_type: Some("agent"),
    };

    #[test]
    fn wraps_bare_bodies() {
        let body = json!({"contents": [{"parts": [{"text": "hi"}]}]});
        let wrapped = wrap_request(&body, "gemini-3-pro", "proj-1", &CONFIG);
        assert_eq!(wrapped["project"], "proj-1");
        assert_eq!(wrapped["model"], "gemini-3-pro");
        assert_eq!(wrapped["request"], body);
        assert_eq!(wrapped["requestType"], "agent");
        assert_eq!(wrapped["userAgent"], "antigravity");
        let request_id = wrapped["requestId"].as_str().unwrap();
        assert!(request_id.starts_with("agent-"));
        assert_eq!(request_id.split('-').count(), 3);
        assert_eq!(request_id.split('-').next_back().unwrap().len(), 8);
    }

    #[test]
    fn already_wrapped_bodies_pass_through() {
        let body = json!({"project": "p", "request": {}});
        assert_eq!(wrap_request(&body, "m", "other", &CONFIG), body);
    }

    #[test]
    fn unwrap_emits_inner_response_and_drops_done() {
        let mut unwrap = EnvelopeUnwrap;
        let out = unwrap.rewrite(SseChunk::data(
            "{\"response\":{\"candidates\":[]},\"traceId\":\"t\"}",
        ));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, "{\"candidates\":[]}");

        assert!(unwrap.rewrite(SseChunk::data("[DONE]")).is_empty());
    }
}
