use serde_json::Value;

use crate::sse::SseChunk;
use crate::stage::ChunkRewrite;

/// Dot-paths where upstream responses carry a model name the client did not
/// ask for. Anything else in the payload is left alone.
const MODEL_PATHS: &[&[&str]] = &[
    &["model"],
    &["message", "model"],
    &["modelVersion"],
    &["response", "model"],
    &["response", "modelVersion"],
];

/// Replaces the model name at each known path when it differs from the
/// client-requested one. Returns whether anything changed.
pub fn substitute_model(value: &mut Value, model: &str) -> bool {
    let mut changed = false;
    for path in MODEL_PATHS {
        let mut cursor = &mut *value;
        let mut found = true;
        for (i, key) in path.iter().enumerate() {
            let last = i + 1 == path.len();
            match cursor.get_mut(*key) {
                Some(next) if last => {
                    if let Value::String(existing) = next
                        && existing != model
                    {
                        *existing = model.to_string();
                        changed = true;
                    }
                    found = false;
                }
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
            if !found {
                break;
            }
        }
    }
    changed
}

/// Drops `thinking` blocks from a top-level `content` array, but only when a
/// `tool_use` block is present alongside them. The client cannot render
/// concurrent thinking + tool use within one message.
pub fn suppress_thinking(value: &mut Value) -> bool {
    let Some(content) = value.get_mut("content").and_then(Value::as_array_mut) else {
        return false;
    };
    let has_tool_use = content
        .iter()
        .any(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"));
    let has_thinking = content
        .iter()
        .any(|block| block.get("type").and_then(Value::as_str) == Some("thinking"));
    if !has_tool_use || !has_thinking {
        return false;
    }
    content.retain(|block| block.get("type").and_then(Value::as_str) != Some("thinking"));
    true
}

/// Non-mutating request-side remap: returns a copy of `parsed` with its
/// `model` field set to `model`.
pub fn rewrite_body_model(parsed: &Value, model: &str) -> Value {
    let mut out = parsed.clone();
    if let Some(slot) = out.get_mut("model") {
        *slot = Value::String(model.to_string());
    }
    out
}

/// The Anthropic response pass: model substitution plus thinking
/// suppression, applied to every JSON data payload. `[DONE]` and payloads
/// that fail to parse are forwarded unchanged.
pub struct ModelRewrite {
    model: String,
}

impl ModelRewrite {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }

    fn apply(&self, data: &str) -> Option<String> {
        if data == "[DONE]" {
            return None;
        }
        let mut value: Value = serde_json::from_str(data).ok()?;
        let mut changed = substitute_model(&mut value, &self.model);
        changed |= suppress_thinking(&mut value);
        changed.then(|| value.to_string())
    }
}

impl ChunkRewrite for ModelRewrite {
    fn rewrite(&mut self, mut chunk: SseChunk) -> Vec<SseChunk> {
        if let Some(rewritten) = self.apply(&chunk.data) {
            chunk.data = rewritten;
        }
        vec![chunk]
    }

    fn rewrite_body(&mut self, body: &str) -> Option<String> {
        self.apply(body)
    }
}
