//! Chat-Completions ⇄ Responses-API transcoder for the Codex backend.
//!
//! The client speaks Chat Completions; the Codex backend only accepts the
//! Responses API and only streams. The forward half rebuilds the request
//! body, the reverse half folds the Responses event stream back into Chat
//! Completions chunks.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use aproxy_common::epoch_ms;

use crate::sse::SseChunk;
use crate::stage::ChunkRewrite;

/// Chat-Completions fields with no Responses-API counterpart.
const STRIPPED_FIELDS: &[&str] = &[
    "max_tokens",
    "max_completion_tokens",
    "frequency_penalty",
    "logprobs",
    "top_logprobs",
    "n",
    "presence_penalty",
    "seed",
    "stop",
    "logit_bias",
    "response_format",
    "reasoning_effort",
    "stream_options",
];

const ORPHAN_OUTPUT_LIMIT: usize = 16_000;

/// Per-model reasoning-effort clamp. Model ids gate which efforts the
/// backend will actually accept.
pub fn clamp_reasoning_effort(model: &str, effort: &str) -> String {
    if model == "gpt-5.1-codex-mini" {
        return match effort {
            "high" | "xhigh" => "high".to_string(),
            _ => "medium".to_string(),
        };
    }
    if model == "gpt-5.1" && effort == "xhigh" {
        return "high".to_string();
    }
    if (model.starts_with("gpt-5.2") || model.starts_with("gpt-5.3")) && effort == "minimal" {
        return "low".to_string();
    }
    effort.to_string()
}

/// Translates a Chat-Completions body into a Responses-API body. Returns
/// `None` when the body carries no `messages` array (already Responses
/// shaped); callers then run [`normalize_responses_body`] directly.
pub fn chat_to_responses(body: &Value, thread_id: Option<&str>) -> Option<Value> {
    let messages = body.get("messages")?.as_array()?;

    let mut out = Map::new();
    if let Some(object) = body.as_object() {
        for (key, value) in object {
            if key == "messages" || STRIPPED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            out.insert(key.clone(), value.clone());
        }
    }

    let mut instructions: Option<String> = None;
    let mut input: Vec<Value> = Vec::new();
    let mut known_call_ids: Vec<String> = Vec::new();

    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("");
        match role {
            "system" | "developer" => {
                let text = content_text(message.get("content"));
                if instructions.is_none() {
                    instructions = Some(text);
                } else {
                    input.push(json!({
                        "role": "developer",
                        "content": [{"type": "input_text", "text": text}],
                    }));
                }
            }
            "user" => input.push(user_input_item(message.get("content"))),
            "assistant" => {
                let text = content_text(message.get("content"));
                if !text.is_empty() {
                    input.push(assistant_output_message(&text));
                }
                if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
                    for call in tool_calls {
                        let call_id = call.get("id").and_then(Value::as_str).unwrap_or("");
                        known_call_ids.push(call_id.to_string());
                        input.push(json!({
                            "type": "function_call",
                            "call_id": call_id,
                            "name": call
                                .get("function")
                                .and_then(|f| f.get("name"))
                                .and_then(Value::as_str)
                                .unwrap_or(""),
                            "arguments": call
                                .get("function")
                                .and_then(|f| f.get("arguments"))
                                .and_then(Value::as_str)
                                .unwrap_or(""),
                        }));
                    }
                }
            }
            "tool" => {
                let call_id = message
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let output = content_text(message.get("content"));
                if known_call_ids.iter().any(|known| known == call_id) {
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": call_id,
                        "output": output,
                    }));
                } else {
                    // The client truncates history aggressively; an output
                    // without its call must ride along as plain text or the
                    // backend rejects the whole conversation.
                    let tool = message
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("tool");
                    let text = truncate_chars(
                        &format!("[Previous {tool} result; call_id={call_id}]: {output}"),
                        ORPHAN_OUTPUT_LIMIT,
                    );
                    input.push(assistant_output_message(&text));
                }
            }
            _ => {}
        }
    }

    out.insert("input".to_string(), Value::Array(input));
    if let Some(instructions) = instructions {
        out.insert("instructions".to_string(), Value::String(instructions));
    }

    let effort = body
        .get("reasoning_effort")
        .and_then(Value::as_str)
        .unwrap_or("high")
        .to_string();
    let mut value = Value::Object(out);
    normalize_responses_body(&mut value, &effort, thread_id);
    Some(value)
}

/// Normalization shared by transcoded and already-Responses-shaped bodies:
/// forced streaming, non-persistent store, reasoning/text defaults, tool
/// shape fixups, and removal of fields the backend rejects.
pub fn normalize_responses_body(body: &mut Value, effort: &str, thread_id: Option<&str>) {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let Some(object) = body.as_object_mut() else {
        return;
    };

    for field in STRIPPED_FIELDS {
        object.remove(*field);
    }

    object.insert("store".to_string(), Value::Bool(false));
    object.insert("stream".to_string(), Value::Bool(true));
    object.entry("reasoning".to_string()).or_insert_with(|| {
        json!({
            "effort": clamp_reasoning_effort(&model, effort),
            "summary": "auto",
        })
    });
    object
        .entry("text".to_string())
        .or_insert_with(|| json!({"verbosity": "medium"}));
    object.insert(
        "include".to_string(),
        json!(["reasoning.encrypted_content"]),
    );
    if let Some(thread_id) = thread_id {
        object.insert(
            "prompt_cache_key".to_string(),
            Value::String(thread_id.to_string()),
        );
    }

    if let Some(input) = object.get_mut("input").and_then(Value::as_array_mut) {
        for item in input {
            if let Some(map) = item.as_object_mut() {
                map.remove("id");
            }
        }
    }

    if let Some(tools) = object.get_mut("tools").and_then(Value::as_array_mut) {
        for tool in tools {
            flatten_tool(tool);
        }
    }

    if let Some(choice) = object.get_mut("tool_choice")
        && choice.is_object()
    {
        let name = choice
            .get("function")
            .and_then(|f| f.get("name"))
            .or_else(|| choice.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        *choice = json!({"type": "function", "name": name});
    }
}

/// Chat tool definitions nest under `function`; Responses tools are flat.
fn flatten_tool(tool: &mut Value) {
    let Some(function) = tool.get("function").cloned() else {
        return;
    };
    let mut flat = Map::new();
    flat.insert("type".to_string(), Value::String("function".to_string()));
    if let Some(object) = function.as_object() {
        for (key, value) in object {
            flat.insert(key.clone(), value.clone());
        }
    }
    *tool = Value::Object(flat);
}

fn assistant_output_message(text: &str) -> Value {
    json!({
        "type": "message",
        "role": "assistant",
        "content": [{"type": "output_text", "text": text, "annotations": []}],
        "status": "completed",
    })
}

fn user_input_item(content: Option<&Value>) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    match content {
        Some(Value::String(text)) => {
            parts.push(json!({"type": "input_text", "text": text}));
        }
        Some(Value::Array(items)) => {
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("image_url") => {
                        let url = item
                            .get("image_url")
                            .map(|iu| {
                                iu.get("url")
                                    .and_then(Value::as_str)
                                    .unwrap_or_else(|| iu.as_str().unwrap_or(""))
                            })
                            .unwrap_or("");
                        let detail = item
                            .get("image_url")
                            .and_then(|iu| iu.get("detail"))
                            .and_then(Value::as_str)
                            .unwrap_or("auto");
                        parts.push(json!({
                            "type": "input_image",
                            "image_url": url,
                            "detail": detail,
                        }));
                    }
                    _ => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            parts.push(json!({"type": "input_text", "text": text}));
                        }
                    }
                }
            }
        }
        _ => {}
    }
    json!({"role": "user", "content": parts})
}

/// Flattens message content (string or part array) to plain text.
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => {
            let mut out = String::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}

/// Folds the Responses event stream back into Chat Completions chunks.
///
/// Emits bare `data:` records (no `event:` names) and a trailing
/// `data: [DONE]`, which is what Chat Completions clients expect.
pub struct ResponsesToChat {
    model: String,
    response_id: String,
    created: i64,
    next_tool_index: u64,
    tool_call_ids: HashMap<String, u64>,
    emitted_tool_calls: bool,
}

impl ResponsesToChat {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            response_id: String::new(),
            created: epoch_ms() / 1000,
            next_tool_index: 0,
            tool_call_ids: HashMap::new(),
            emitted_tool_calls: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> SseChunk {
        let mut value = json!({
            "id": format!("chatcmpl-{}", self.response_id),
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            value["usage"] = usage;
        }
        SseChunk::data(value.to_string())
    }

    fn on_event(&mut self, value: &Value) -> Option<SseChunk> {
        match value.get("type").and_then(Value::as_str)? {
            "response.created" => {
                if let Some(response) = value.get("response") {
                    if let Some(id) = response.get("id").and_then(Value::as_str) {
                        self.response_id = id.to_string();
                    }
                    if let Some(created) = response.get("created_at").and_then(Value::as_i64) {
                        self.created = created;
                    }
                }
                None
            }
            "response.output_item.added" => {
                let item = value.get("item")?;
                match item.get("type").and_then(Value::as_str) {
                    Some("message")
                        if item.get("role").and_then(Value::as_str) == Some("assistant") =>
                    {
                        Some(self.chunk(json!({"role": "assistant", "content": ""}), None, None))
                    }
                    Some("function_call") => {
                        let call_id = item.get("call_id").and_then(Value::as_str)?.to_string();
                        let name = item.get("name").and_then(Value::as_str).unwrap_or("");
                        let index = self.next_tool_index;
                        self.next_tool_index += 1;
                        self.tool_call_ids.insert(call_id.clone(), index);
                        self.emitted_tool_calls = true;
                        Some(self.chunk(
                            json!({"tool_calls": [{
                                "index": index,
                                "id": call_id,
                                "type": "function",
                                "function": {"name": name, "arguments": ""},
                            }]}),
                            None,
                            None,
                        ))
                    }
                    _ => None,
                }
            }
            "response.output_text.delta" | "response.reasoning_summary_text.delta" => {
                let delta = value.get("delta").and_then(Value::as_str)?;
                Some(self.chunk(json!({"content": delta}), None, None))
            }
            "response.function_call_arguments.delta" => {
                let call_id = value.get("call_id").and_then(Value::as_str)?;
                let index = *self.tool_call_ids.get(call_id)?;
                let delta = value.get("delta").and_then(Value::as_str)?;
                Some(self.chunk(
                    json!({"tool_calls": [{
                        "index": index,
                        "function": {"arguments": delta},
                    }]}),
                    None,
                    None,
                ))
            }
            "response.completed" => {
                let finish = if self.emitted_tool_calls {
                    "tool_calls"
                } else {
                    "stop"
                };
                let usage = value
                    .get("response")
                    .and_then(|r| r.get("usage"))
                    .map(chat_usage);
                Some(self.chunk(json!({}), Some(finish), usage))
            }
            _ => None,
        }
    }
}

fn chat_usage(usage: &Value) -> Value {
    let prompt = usage
        .get("input_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let completion = usage
        .get("output_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let mut out = json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": prompt + completion,
    });
    if let Some(cached) = usage
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_i64)
    {
        out["prompt_tokens_details"] = json!({"cached_tokens": cached});
    }
    out
}

impl ChunkRewrite for ResponsesToChat {
    fn rewrite(&mut self, chunk: SseChunk) -> Vec<SseChunk> {
        if chunk.data == "[DONE]" {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(&chunk.data) else {
            return Vec::new();
        };
        self.on_event(&value).into_iter().collect()
    }

    fn finish(&mut self) -> Vec<SseChunk> {
        vec![SseChunk::data("[DONE]")]
    }
}
