use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};

use mrelay_protocol::Usage;
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

/// Cohere v1 chat: one `message` plus `chat_history`, NDJSON streaming.
#[derive(Debug, Default)]
pub struct CohereAdapter;

impl CohereAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for CohereAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        match req {
            RelayRequest::Chat(_) => Ok(format!("{}/v1/chat", ctx.base_url())),
            RelayRequest::Embedding(_) => Ok(format!("{}/v1/embed", ctx.base_url())),
            _ => Err(AdapterError::InvalidRequest(format!(
                "{} is not a cohere operation",
                req.operation()
            ))),
        }
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        Ok(builder.header("authorization", format!("Bearer {}", ctx.key)))
    }

    fn convert_request(&self, req: &RelayRequest, ctx: &RelayContext) -> AdapterResult<Bytes> {
        let payload = match req {
            RelayRequest::Chat(chat) => chat_to_cohere_payload(chat, &ctx.upstream_model),
            RelayRequest::Embedding(embedding) => json!({
                "model": ctx.upstream_model,
                "texts": [embedding.input_text()],
                "input_type": "search_document",
            }),
            _ => {
                return Err(AdapterError::InvalidRequest(
                    "unsupported cohere payload".to_string(),
                ));
            }
        };
        serde_json::to_vec(&payload)
            .map(Bytes::from)
            .map_err(|err| AdapterError::InvalidRequest(err.to_string()))
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
            let mapper = CohereStreamMapper::new(ctx.canonical_model.clone());
            let handle = relay_stream(response, ctx.stream_timeout, usage, Box::new(mapper));
            return Ok(AdapterResponse::Stream {
                status: http::StatusCode::OK,
                handle,
            });
        }

        let body = read_body(response).await?;
        let value: Value =
            serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))?;
        let canonical = cohere_to_chat_response(&value, &ctx.canonical_model);
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

fn chat_to_cohere_payload(chat: &ChatCompletionRequest, model: &str) -> Value {
    let mut preamble = Vec::new();
    let mut history: Vec<Value> = Vec::new();
    let mut message = String::new();

    for chat_message in &chat.messages {
        let text = chat_message.content_text();
        match chat_message.role.as_str() {
            "system" => preamble.push(text),
            "assistant" => history.push(json!({"role": "CHATBOT", "message": text})),
            _ => history.push(json!({"role": "USER", "message": text})),
        }
    }
    // The trailing user turn becomes `message`.
    if let Some(last) = history.last()
        && last["role"] == "USER"
    {
        message = last["message"].as_str().unwrap_or_default().to_string();
        history.pop();
    }

    let mut payload = json!({
        "model": model,
        "message": message,
        "chat_history": history,
    });
    let object = payload.as_object_mut().expect("payload is an object");
    if !preamble.is_empty() {
        object.insert("preamble".to_string(), Value::String(preamble.join("\n")));
    }
    if chat.is_stream() {
        object.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(max) = chat.max_output_tokens() {
        object.insert("max_tokens".to_string(), json!(max));
    }
    payload
}

fn cohere_usage(value: &Value) -> Option<Usage> {
    let tokens = value.pointer("/meta/tokens")?;
    let prompt = tokens.get("input_tokens").and_then(Value::as_u64)? as u32;
    let completion = tokens
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    Some(Usage::new(prompt, completion))
}

fn cohere_to_chat_response(value: &Value, model: &str) -> ChatCompletionResponse {
    let text = value
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: now_epoch_seconds(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::text("assistant", text),
            finish_reason: Some("stop".to_string()),
        }],
        usage: cohere_usage(value),
        extra: Default::default(),
    }
}

struct CohereStreamMapper {
    canonical_model: String,
    id: String,
    created: i64,
}

impl CohereStreamMapper {
    fn new(canonical_model: String) -> Self {
        Self {
            canonical_model,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: now_epoch_seconds(),
        }
    }
}

impl StreamMapper for CohereStreamMapper {
    fn on_event(&mut self, data: &str, usage: &UsageAccumulator) -> Vec<Bytes> {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        match value.get("event_type").and_then(Value::as_str) {
            Some("text-generation") => {
                let text = value.get("text").and_then(Value::as_str).unwrap_or_default();
                if text.is_empty() {
                    return Vec::new();
                }
                usage.add_estimated_completion(count::estimate_text(
                    &self.canonical_model,
                    text,
                ));
                let chunk = ChatCompletionChunk {
                    id: self.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: self.created,
                    model: self.canonical_model.clone(),
                    choices: vec![ChatChunkChoice {
                        index: 0,
                        delta: ChatDelta {
                            role: None,
                            content: Some(text.to_string()),
                            tool_calls: None,
                        },
                        finish_reason: None,
                    }],
                    usage: None,
                };
                match serde_json::to_vec(&chunk) {
                    Ok(payload) => vec![data_frame(&payload)],
                    Err(_) => Vec::new(),
                }
            }
            Some("stream-end") => {
                if let Some(reported) = value
                    .get("response")
                    .and_then(cohere_usage_ref)
                {
                    usage.observe_reported(&reported);
                }
                let chunk = ChatCompletionChunk {
                    id: self.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: self.created,
                    model: self.canonical_model.clone(),
                    choices: vec![ChatChunkChoice {
                        index: 0,
                        delta: ChatDelta::default(),
                        finish_reason: Some("stop".to_string()),
                    }],
                    usage: None,
                };
                match serde_json::to_vec(&chunk) {
                    Ok(payload) => vec![data_frame(&payload)],
                    Err(_) => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_end(&mut self, _usage: &UsageAccumulator) -> Vec<Bytes> {
        vec![done_frame()]
    }
}

fn cohere_usage_ref(value: &Value) -> Option<Usage> {
    cohere_usage(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_user_turn_becomes_message() {
        let chat: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "command-r",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "answer"},
                {"role": "user", "content": "second"},
            ],
        }))
        .unwrap();
        let payload = chat_to_cohere_payload(&chat, "command-r-plus");
        assert_eq!(payload["message"], "second");
        let history = payload["chat_history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1]["role"], "CHATBOT");
    }
}
