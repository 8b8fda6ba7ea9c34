//! HTTP client for the LLM gateway.
//!
//! The gateway speaks the chat-completions contract: POST
//! `<base_url>/chat/completions` with `Authorization: Bearer <key>`.
//! Structured output is requested via `response_format = {type:
//! "json_schema", ...}`; some providers ignore `strict`, so returned
//! content is stripped of markdown code fences before JSON parsing.

use std::time::Duration;

use cortex_domain::error::{Error, Result};
use cortex_domain::tool::{Message, Role, ToolCall, ToolDefinition};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON-schema-constrained output request.
#[derive(Debug, Clone)]
pub struct ResponseFormat {
    pub name: String,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub provider_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn new(provider_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
            messages: Vec::new(),
            tools: Vec::new(),
            temperature: None,
            response_format: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Seam for the LLM gateway. The orchestrator and tests depend on this
/// trait; [`HttpLlmClient`] is the production implementation.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, req: &ChatRequest, timeout: Duration) -> Result<ChatResponse>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HttpLlmClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpLlmClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn build_body(req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();
        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(rf) = &req.response_format {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": rf.name,
                    "strict": true,
                    "schema": rf.schema,
                },
            });
        }
        body
    }
}

#[async_trait::async_trait]
impl ChatBackend for HttpLlmClient {
    async fn chat(&self, req: &ChatRequest, timeout: Duration) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(req);

        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("chat completion to {}", req.model))
                } else {
                    Error::LlmTransient {
                        provider: req.provider_id.clone(),
                        model: req.model.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_owned());
        let text = resp.text().await.map_err(|e| Error::LlmTransient {
            provider: req.provider_id.clone(),
            model: req.model.clone(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            let mut message = format!("status {}: {}", status.as_u16(), truncate(&text, 500));
            if let Some(ra) = retry_after {
                message.push_str(&format!(" retry-after: {ra}"));
            }
            let err = if crate::health::is_quota_error(Some(status.as_u16()), &text) {
                Error::LlmQuota {
                    provider: req.provider_id.clone(),
                    model: req.model.clone(),
                    message,
                }
            } else {
                Error::LlmTransient {
                    provider: req.provider_id.clone(),
                    model: req.model.clone(),
                    message,
                }
            };
            return Err(err);
        }

        parse_chat_response(&text).map_err(|e| Error::LlmTransient {
            provider: req.provider_id.clone(),
            model: req.model.clone(),
            message: format!("unparseable response: {e}"),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_wire(msg: &Message) -> Value {
    let mut obj = serde_json::json!({
        "role": role_to_str(msg.role),
        "content": msg.content,
    });
    if !msg.tool_calls.is_empty() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.call_id,
                    "type": "function",
                    "function": {
                        "name": tc.tool_name,
                        "arguments": tc.arguments.to_string(),
                    },
                })
            })
            .collect();
        obj["tool_calls"] = Value::Array(calls);
    }
    if let Some(id) = &msg.tool_call_id {
        obj["tool_call_id"] = Value::String(id.clone());
    }
    obj
}

fn tool_to_wire(def: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters,
        },
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(raw: &str) -> std::result::Result<ChatResponse, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let message = value
        .pointer("/choices/0/message")
        .ok_or_else(|| "missing choices[0].message".to_string())?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in calls {
            let call_id = call
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let Some(func) = call.get("function") else {
                continue;
            };
            let name = func
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            // Arguments arrive as a JSON-encoded string; empty means {}.
            let arguments = match func.get("arguments").and_then(|v| v.as_str()) {
                Some(s) if !s.trim().is_empty() => {
                    serde_json::from_str(s).unwrap_or(Value::Object(Default::default()))
                }
                _ => Value::Object(Default::default()),
            };
            tool_calls.push(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            });
        }
    }

    Ok(ChatResponse {
        content,
        tool_calls,
    })
}

/// Strip a wrapping markdown code fence (```json ... ``` or ``` ... ```)
/// from model output. Providers that ignore `strict` often wrap their
/// JSON this way.
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language hint line, then the closing fence.
    let body = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse model output as JSON after removing any code fences.
pub fn parse_json_output(content: &str) -> Result<Value> {
    let cleaned = strip_code_fences(content);
    serde_json::from_str(cleaned).map_err(Error::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_json() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"a\": 1}");

        let bare_fence = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(bare_fence), "{\"a\": 1}");

        let plain = "{\"a\": 1}";
        assert_eq!(strip_code_fences(plain), plain);
    }

    #[test]
    fn parse_json_output_tolerates_fences() {
        let v = parse_json_output("```json\n{\"mode\": \"quick\"}\n```").unwrap();
        assert_eq!(v["mode"], "quick");
        assert!(parse_json_output("not json at all").is_err());
    }

    #[test]
    fn parses_content_and_tool_calls() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": "let me search",
                    "tool_calls": [{
                        "id": "tc_1",
                        "type": "function",
                        "function": {"name": "search_web", "arguments": "{\"query\":\"rust\"}"}
                    }]
                }
            }]
        }"#;
        let resp = parse_chat_response(raw).unwrap();
        assert_eq!(resp.content, "let me search");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "search_web");
        assert_eq!(resp.tool_calls[0].arguments["query"], "rust");
    }

    #[test]
    fn empty_arguments_default_to_object() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "tc_1",
                        "function": {"name": "list_files", "arguments": ""}
                    }]
                }
            }]
        }"#;
        let resp = parse_chat_response(raw).unwrap();
        assert_eq!(resp.content, "");
        assert!(resp.tool_calls[0].arguments.is_object());
    }

    #[test]
    fn missing_choices_is_an_error() {
        assert!(parse_chat_response("{}").is_err());
    }

    #[test]
    fn request_body_includes_schema_format() {
        let mut req = ChatRequest::new("gw", "fast-1");
        req.messages.push(Message::user("hi"));
        req.response_format = Some(ResponseFormat {
            name: "classification".into(),
            schema: serde_json::json!({"type": "object"}),
        });
        let body = HttpLlmClient::build_body(&req);
        assert_eq!(body["model"], "fast-1");
        assert_eq!(body["stream"], false);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
    }

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_string() {
        let msg = Message::assistant_with_tools(
            "",
            vec![ToolCall {
                call_id: "tc_2".into(),
                tool_name: "read_file".into(),
                arguments: serde_json::json!({"path": "/tmp/x"}),
            }],
        );
        let wire = msg_to_wire(&msg);
        let args = wire["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        assert!(args.contains("\"path\""));
    }
}
