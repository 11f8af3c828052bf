use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};

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

/// Workers AI. Channel key is `account_id|api_token`.
#[derive(Debug, Default)]
pub struct CloudflareAdapter;

impl CloudflareAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for CloudflareAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        let RelayRequest::Chat(_) = req else {
            return Err(AdapterError::InvalidRequest(format!(
                "{} is not a workers-ai operation",
                req.operation()
            )));
        };
        let (account_id, token) = ctx.key_parts();
        if token.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "cloudflare key must be account_id|api_token".to_string(),
            ));
        }
        Ok(format!(
            "{}/client/v4/accounts/{account_id}/ai/run/{}",
            ctx.base_url(),
            ctx.upstream_model,
        ))
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        let (_, token) = ctx.key_parts();
        Ok(builder.header("authorization", format!("Bearer {token}")))
    }

    fn convert_request(&self, req: &RelayRequest, _ctx: &RelayContext) -> AdapterResult<Bytes> {
        let RelayRequest::Chat(chat) = req else {
            return Err(AdapterError::InvalidRequest(
                "workers-ai adapter only relays chat".to_string(),
            ));
        };
        let payload = chat_to_workers_payload(chat);
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
            let mapper = WorkersStreamMapper::new(ctx.canonical_model.clone());
            let handle = relay_stream(response, ctx.stream_timeout, usage, Box::new(mapper));
            return Ok(AdapterResponse::Stream {
                status: http::StatusCode::OK,
                handle,
            });
        }

        let body = read_body(response).await?;
        let value: Value =
            serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))?;
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(AdapterError::upstream(400, body));
        }
        let text = value
            .pointer("/result/response")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let canonical = ChatCompletionResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: now_epoch_seconds(),
            model: ctx.canonical_model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::text("assistant", text),
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
            extra: Default::default(),
        };
        let body = serde_json::to_vec(&canonical)
            .map_err(|err| AdapterError::Parse(err.to_string()))?;
        Ok(AdapterResponse::Json {
            status: http::StatusCode::OK,
            body: Bytes::from(body),
            usage: None,
        })
    }
}

fn chat_to_workers_payload(chat: &ChatCompletionRequest) -> Value {
    let messages: Vec<Value> = chat
        .messages
        .iter()
        .map(|message| {
            json!({"role": message.role, "content": message.content_text()})
        })
        .collect();
    let mut payload = json!({"messages": messages});
    if chat.is_stream() {
        payload["stream"] = Value::Bool(true);
    }
    if let Some(max) = chat.max_output_tokens() {
        payload["max_tokens"] = json!(max);
    }
    payload
}

struct WorkersStreamMapper {
    canonical_model: String,
    id: String,
    created: i64,
}

impl WorkersStreamMapper {
    fn new(canonical_model: String) -> Self {
        Self {
            canonical_model,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: now_epoch_seconds(),
        }
    }
}

impl StreamMapper for WorkersStreamMapper {
    fn on_event(&mut self, data: &str, usage: &UsageAccumulator) -> Vec<Bytes> {
        if data.trim() == "[DONE]" {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        let text = value
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.is_empty() {
            return Vec::new();
        }
        usage.add_estimated_completion(count::estimate_text(&self.canonical_model, text));
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

    fn on_end(&mut self, _usage: &UsageAccumulator) -> Vec<Bytes> {
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
        let mut out = Vec::new();
        if let Ok(payload) = serde_json::to_vec(&chunk) {
            out.push(data_frame(&payload));
        }
        out.push(done_frame());
        out
    }
}
