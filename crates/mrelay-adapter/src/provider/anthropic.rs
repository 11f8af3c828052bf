use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use mrelay_protocol::Usage;
use mrelay_protocol::claude::{MessagesResponse, StreamEvent};
use mrelay_protocol::openai::{
    ChatChoice, ChatChunkChoice, ChatCompletionChunk, ChatCompletionResponse, ChatDelta,
    ChatMessage, ChatCompletionRequest,
};
use mrelay_protocol::sse::{data_frame, done_frame};

use crate::adapter::{Adapter, read_body};
use crate::context::RelayContext;
use crate::count;
use crate::error::{AdapterError, AdapterResult};
use crate::provider::now_epoch_seconds;
use crate::request::RelayRequest;
use crate::response::{AdapterResponse, UsageAccumulator};
use crate::stream::{StreamMapper, relay_stream};
use crate::transform::stop_reason_to_finish_reason;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Default)]
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        match req {
            RelayRequest::Chat(_) => Ok(format!("{}/v1/messages", ctx.base_url())),
            _ => Err(AdapterError::InvalidRequest(format!(
                "{} is not an anthropic operation",
                req.operation()
            ))),
        }
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        Ok(builder
            .header("x-api-key", ctx.key.as_str())
            .header("anthropic-version", ANTHROPIC_VERSION))
    }

    fn convert_request(&self, req: &RelayRequest, ctx: &RelayContext) -> AdapterResult<Bytes> {
        let RelayRequest::Chat(chat) = req else {
            return Err(AdapterError::InvalidRequest(
                "anthropic adapter only relays chat".to_string(),
            ));
        };
        let body = chat_to_messages_payload(chat, &ctx.upstream_model)?;
        Ok(Bytes::from(body))
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        ctx: &RelayContext,
    ) -> AdapterResult<AdapterResponse> {
        let status = response.status();
        if !status.is_success() {
            let body = read_body(response).await.unwrap_or_default();
            return Err(AdapterError::upstream(status.as_u16(), body));
        }

        if ctx.is_stream {
            let usage = Arc::new(UsageAccumulator::with_prompt(ctx.prompt_tokens));
            let mapper = ClaudeToChatMapper::new(ctx.canonical_model.clone());
            let handle = relay_stream(response, ctx.stream_timeout, usage, Box::new(mapper));
            return Ok(AdapterResponse::Stream {
                status: http::StatusCode::OK,
                handle,
            });
        }

        let body = read_body(response).await?;
        let parsed: MessagesResponse =
            serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))?;
        let canonical = messages_to_chat_response(&parsed, &ctx.canonical_model);
        let usage = canonical.usage.clone();
        let body = serde_json::to_vec(&canonical)
            .map_err(|err| AdapterError::Parse(err.to_string()))?;
        Ok(AdapterResponse::Json {
            status: http::StatusCode::OK,
            body: Bytes::from(body),
            usage,
        })
    }
}

/// Canonical chat -> messages payload. System messages lift into `system`;
/// tool definitions map from the function shape to input_schema blocks.
fn chat_to_messages_payload(chat: &ChatCompletionRequest, model: &str) -> AdapterResult<Vec<u8>> {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();
    for message in &chat.messages {
        if message.role == "system" {
            system_parts.push(message.content_text());
        } else {
            messages.push(serde_json::json!({
                "role": if message.role == "assistant" { "assistant" } else { "user" },
                "content": message.content.clone(),
            }));
        }
    }

    let mut payload = serde_json::json!({
        "model": model,
        "max_tokens": chat.max_output_tokens().unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    let object = payload.as_object_mut().expect("payload is an object");
    if !system_parts.is_empty() {
        object.insert("system".to_string(), Value::String(system_parts.join("\n")));
    }
    if chat.is_stream() {
        object.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(Value::Array(tools)) = &chat.tools {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let function = tool.get("function").unwrap_or(tool);
                serde_json::json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": function.get("parameters").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        object.insert("tools".to_string(), Value::Array(mapped));
    }
    for (key, value) in &chat.extra {
        if matches!(key.as_str(), "temperature" | "top_p" | "top_k" | "stop_sequences" | "metadata") {
            object.insert(key.clone(), value.clone());
        }
    }

    serde_json::to_vec(&payload).map_err(|err| AdapterError::InvalidRequest(err.to_string()))
}

fn messages_to_chat_response(response: &MessagesResponse, model: &str) -> ChatCompletionResponse {
    let text = response
        .content
        .iter()
        .filter_map(|block| match block {
            mrelay_protocol::claude::ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", response.id.trim_start_matches("msg_")),
        object: "chat.completion".to_string(),
        created: now_epoch_seconds(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::text("assistant", text),
            finish_reason: Some(
                response
                    .stop_reason
                    .as_deref()
                    .map(stop_reason_to_finish_reason)
                    .unwrap_or("stop")
                    .to_string(),
            ),
        }],
        usage: Some(Usage::new(
            response.usage.input_tokens,
            response.usage.output_tokens,
        )),
        extra: Default::default(),
    }
}

/// Maps Anthropic stream events onto canonical chunks, carrying usage from
/// `message_start` (input) and `message_delta` (output).
struct ClaudeToChatMapper {
    canonical_model: String,
    id: String,
    created: i64,
    finish_reason: Option<String>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl ClaudeToChatMapper {
    fn new(canonical_model: String) -> Self {
        Self {
            canonical_model,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: now_epoch_seconds(),
            finish_reason: None,
            input_tokens: None,
            output_tokens: None,
        }
    }

    fn chunk(&self, delta: ChatDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.canonical_model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    fn emit(chunk: &ChatCompletionChunk) -> Vec<Bytes> {
        match serde_json::to_vec(chunk) {
            Ok(payload) => vec![data_frame(&payload)],
            Err(_) => Vec::new(),
        }
    }
}

impl StreamMapper for ClaudeToChatMapper {
    fn on_event(&mut self, data: &str, usage: &UsageAccumulator) -> Vec<Bytes> {
        let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
            return Vec::new();
        };
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(input) = message
                    .pointer("/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    self.input_tokens = Some(input as u32);
                }
                Self::emit(&self.chunk(
                    ChatDelta {
                        role: Some("assistant".to_string()),
                        ..Default::default()
                    },
                    None,
                ))
            }
            StreamEvent::ContentBlockDelta { delta, .. } => {
                let Some(text) = delta.get("text").and_then(Value::as_str) else {
                    return Vec::new();
                };
                usage.add_estimated_completion(count::estimate_text(
                    &self.canonical_model,
                    text,
                ));
                Self::emit(&self.chunk(
                    ChatDelta {
                        content: Some(text.to_string()),
                        ..Default::default()
                    },
                    None,
                ))
            }
            StreamEvent::MessageDelta { delta, usage: reported } => {
                if let Some(reported) = reported {
                    self.output_tokens = Some(reported.output_tokens);
                }
                if let Some(reason) = delta.get("stop_reason").and_then(Value::as_str) {
                    self.finish_reason =
                        Some(stop_reason_to_finish_reason(reason).to_string());
                }
                Vec::new()
            }
            StreamEvent::MessageStop => {
                let reason = self.finish_reason.clone().unwrap_or_else(|| "stop".to_string());
                let mut out = Self::emit(&self.chunk(ChatDelta::default(), Some(reason)));
                if let (Some(input), Some(output)) = (self.input_tokens, self.output_tokens) {
                    usage.observe_reported(&Usage::new(input, output));
                    let mut final_chunk = self.chunk(ChatDelta::default(), None);
                    final_chunk.choices.clear();
                    final_chunk.usage = Some(Usage::new(input, output));
                    out.extend(Self::emit(&final_chunk));
                }
                out
            }
            _ => Vec::new(),
        }
    }

    fn on_end(&mut self, _usage: &UsageAccumulator) -> Vec<Bytes> {
        vec![done_frame()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(raw: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn system_lifts_out_of_messages() {
        let request = chat(serde_json::json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
        }));
        let payload = chat_to_messages_payload(&request, "claude-3-5-sonnet-20241022").unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["system"], "be terse");
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
        assert_eq!(value["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(value["max_tokens"], 4096);
    }

    #[test]
    fn tool_definitions_map_to_input_schema() {
        let request = chat(serde_json::json!({
            "model": "claude-3-5-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "weather lookup",
                    "parameters": {"type": "object"},
                }
            }],
        }));
        let payload = chat_to_messages_payload(&request, "claude-3-5-sonnet").unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["tools"][0]["name"], "get_weather");
        assert_eq!(value["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn stream_events_become_canonical_chunks_in_order() {
        let usage = UsageAccumulator::with_prompt(3);
        let mut mapper = ClaudeToChatMapper::new("claude-3-5-sonnet".to_string());

        let start = r#"{"type":"message_start","message":{"usage":{"input_tokens":7,"output_tokens":0}}}"#;
        let frames = mapper.on_event(start, &usage);
        assert!(String::from_utf8_lossy(&frames[0]).contains("\"role\":\"assistant\""));

        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#;
        let frames = mapper.on_event(delta, &usage);
        assert!(String::from_utf8_lossy(&frames[0]).contains("\"content\":\"hi\""));

        let meta = r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"input_tokens":0,"output_tokens":4}}"#;
        assert!(mapper.on_event(meta, &usage).is_empty());

        let frames = mapper.on_event(r#"{"type":"message_stop"}"#, &usage);
        assert_eq!(frames.len(), 2, "finish chunk plus usage chunk");
        let snapshot = usage.snapshot();
        assert_eq!(snapshot.prompt_tokens, 7);
        assert_eq!(snapshot.completion_tokens, 4);
    }
}
