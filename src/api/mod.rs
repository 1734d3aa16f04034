//! OpenAI-compatible wire shapes.
//!
//! The schema grows over time, so every request struct is a known-fields
//! core plus a flattened extras bag: unknown fields survive the
//! decode/encode round trip and are forwarded to the upstream unchanged.
//! Responses are handled as raw `serde_json::Value` for the same reason;
//! only the legacy completions adapter reshapes them.

use crate::errors::{ProxyError, ProxyResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const ROLES: &[&str] = &["system", "user", "assistant", "tool"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// String or content-block array; kept raw so block shapes pass through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatCompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Validate the subset of fields the proxy inspects. Everything else is the
/// upstream's business.
pub fn validate_chat_request(req: &ChatCompletionRequest) -> ProxyResult<()> {
    if req.messages.is_empty() {
        return Err(ProxyError::Validation("messages must not be empty".into()));
    }
    for msg in &req.messages {
        if !ROLES.contains(&msg.role.as_str()) {
            return Err(ProxyError::Validation(format!(
                "invalid message role: {}",
                msg.role
            )));
        }
        if let Some(content) = &msg.content
            && !content.is_string()
            && !content.is_array()
        {
            return Err(ProxyError::Validation(
                "message content must be a string or an array of content blocks".into(),
            ));
        }
    }
    if let Some(max_tokens) = req.max_tokens
        && max_tokens < 0
    {
        return Err(ProxyError::Validation("max_tokens must be >= 0".into()));
    }
    if let Some(temperature) = req.temperature
        && !(0.0..=2.0).contains(&temperature)
    {
        return Err(ProxyError::Validation(
            "temperature must be within [0, 2]".into(),
        ));
    }
    if let Some(top_p) = req.top_p
        && !(0.0..=1.0).contains(&top_p)
    {
        return Err(ProxyError::Validation("top_p must be within [0, 1]".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// Static model listing derived from configuration. May be empty but is
/// never nil.
pub fn model_list(ids: &[String], created: i64) -> Vec<ModelInfo> {
    ids.iter()
        .map(|id| ModelInfo {
            id: id.clone(),
            object: "model".to_string(),
            created,
            owned_by: "qwen".to_string(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Legacy /v1/completions adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Adapt a legacy completion request into a one-message chat request. Extra
/// fields (max_tokens, temperature, ...) ride along in the extras bag.
pub fn completion_to_chat(req: CompletionRequest) -> ProxyResult<ChatCompletionRequest> {
    let prompt = match &req.prompt {
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let strings: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            if strings.len() != parts.len() {
                return Err(ProxyError::Validation(
                    "prompt array must contain only strings".into(),
                ));
            }
            strings.join("\n")
        }
        Value::Null => {
            return Err(ProxyError::Validation("prompt is required".into()));
        }
        _ => {
            return Err(ProxyError::Validation(
                "prompt must be a string or an array of strings".into(),
            ));
        }
    };

    Ok(ChatCompletionRequest {
        model: req.model,
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: Some(Value::String(prompt)),
            tool_calls: None,
            extra: Map::new(),
        }],
        stream: req.stream,
        extra: req.extra,
        ..ChatCompletionRequest::default()
    })
}

/// Reshape a chat-completion response into the legacy text-completion shape.
pub fn chat_response_to_completion(chat: &Value) -> Value {
    let choices: Vec<Value> = chat["choices"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .enumerate()
                .map(|(i, choice)| {
                    let text = choice["message"]["content"].as_str().unwrap_or_default();
                    json!({
                        "text": text,
                        "index": choice["index"].as_i64().unwrap_or(i as i64),
                        "logprobs": Value::Null,
                        "finish_reason": choice["finish_reason"].clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "id": chat["id"].clone(),
        "object": "text_completion",
        "created": chat["created"].clone(),
        "model": chat["model"].clone(),
        "choices": choices,
        "usage": chat["usage"].clone(),
    })
}
