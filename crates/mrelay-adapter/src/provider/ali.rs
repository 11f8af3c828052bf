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

/// DashScope text generation in `message` result format.
#[derive(Debug, Default)]
pub struct AliAdapter;

impl AliAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for AliAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        let path = match req {
            RelayRequest::Chat(_) => "/api/v1/services/aigc/text-generation/generation",
            RelayRequest::Embedding(_) => {
                "/api/v1/services/embeddings/text-embedding/text-embedding"
            }
            _ => {
                return Err(AdapterError::InvalidRequest(format!(
                    "{} is not a dashscope operation",
                    req.operation()
                )));
            }
        };
        Ok(format!("{}{path}", ctx.base_url()))
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        let mut builder = builder.header("authorization", format!("Bearer {}", ctx.key));
        if ctx.is_stream {
            builder = builder.header("x-dashscope-sse", "enable");
        }
        Ok(builder)
    }

    fn convert_request(&self, req: &RelayRequest, ctx: &RelayContext) -> AdapterResult<Bytes> {
        let payload = match req {
            RelayRequest::Chat(chat) => chat_to_dashscope_payload(chat, &ctx.upstream_model),
            RelayRequest::Embedding(embedding) => json!({
                "model": ctx.upstream_model,
                "input": {"texts": [embedding.input_text()]},
            }),
            _ => {
                return Err(AdapterError::InvalidRequest(
                    "unsupported dashscope payload".to_string(),
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
            let mapper = DashScopeStreamMapper::new(ctx.canonical_model.clone());
            let handle = relay_stream(response, ctx.stream_timeout, usage, Box::new(mapper));
            return Ok(AdapterResponse::Stream {
                status: http::StatusCode::OK,
                handle,
            });
        }

        let body = read_body(response).await?;
        let value: Value =
            serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))?;
        if value.get("code").and_then(Value::as_str).is_some_and(|c| !c.is_empty()) {
            return Err(AdapterError::upstream(400, body));
        }
        let canonical = dashscope_to_chat_response(&value, &ctx.canonical_model);
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

fn chat_to_dashscope_payload(chat: &ChatCompletionRequest, model: &str) -> Value {
    let messages: Vec<Value> = chat
        .messages
        .iter()
        .map(|message| {
            json!({
                "role": message.role,
                "content": message.content_text(),
            })
        })
        .collect();

    let mut parameters = serde_json::Map::new();
    parameters.insert("result_format".to_string(), json!("message"));
    if chat.is_stream() {
        parameters.insert("incremental_output".to_string(), json!(true));
    }
    if let Some(max) = chat.max_output_tokens() {
        parameters.insert("max_tokens".to_string(), json!(max));
    }
    if let Some(temperature) = chat.extra.get("temperature") {
        parameters.insert("temperature".to_string(), temperature.clone());
    }

    json!({
        "model": model,
        "input": {"messages": messages},
        "parameters": parameters,
    })
}

fn dashscope_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    let prompt = usage.get("input_tokens").and_then(Value::as_u64)? as u32;
    let completion = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    Some(Usage::new(prompt, completion))
}

fn dashscope_text(value: &Value) -> String {
    value
        .pointer("/output/choices/0/message/content")
        .and_then(Value::as_str)
        .or_else(|| value.pointer("/output/text").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn dashscope_to_chat_response(value: &Value, model: &str) -> ChatCompletionResponse {
    let finish = value
        .pointer("/output/choices/0/finish_reason")
        .and_then(Value::as_str)
        .filter(|reason| *reason != "null")
        .unwrap_or("stop");
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: now_epoch_seconds(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::text("assistant", dashscope_text(value)),
            finish_reason: Some(finish.to_string()),
        }],
        usage: dashscope_usage(value),
        extra: Default::default(),
    }
}

struct DashScopeStreamMapper {
    canonical_model: String,
    id: String,
    created: i64,
}

impl DashScopeStreamMapper {
    fn new(canonical_model: String) -> Self {
        Self {
            canonical_model,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: now_epoch_seconds(),
        }
    }
}

impl StreamMapper for DashScopeStreamMapper {
    fn on_event(&mut self, data: &str, usage: &UsageAccumulator) -> Vec<Bytes> {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        if let Some(reported) = dashscope_usage(&value) {
            usage.observe_reported(&reported);
        }
        let text = dashscope_text(&value);
        let finish = value
            .pointer("/output/choices/0/finish_reason")
            .and_then(Value::as_str)
            .filter(|reason| *reason != "null")
            .map(|reason| reason.to_string());
        if text.is_empty() && finish.is_none() {
            return Vec::new();
        }
        if !text.is_empty() {
            usage.add_estimated_completion(count::estimate_text(&self.canonical_model, &text));
        }

        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.canonical_model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta: ChatDelta {
                    role: None,
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: None,
                },
                finish_reason: finish,
            }],
            usage: None,
        };
        match serde_json::to_vec(&chunk) {
            Ok(payload) => vec![data_frame(&payload)],
            Err(_) => Vec::new(),
        }
    }

    fn on_end(&mut self, _usage: &UsageAccumulator) -> Vec<Bytes> {
        vec![done_frame()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_nests_messages_under_input() {
        let chat: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "qwen-max",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .unwrap();
        let payload = chat_to_dashscope_payload(&chat, "qwen-max-latest");
        assert_eq!(payload["model"], "qwen-max-latest");
        assert_eq!(payload["input"]["messages"][0]["content"], "hi");
        assert_eq!(payload["parameters"]["incremental_output"], true);
        assert_eq!(payload["parameters"]["result_format"], "message");
    }

    #[test]
    fn response_reads_message_result_format() {
        let upstream = json!({
            "output": {"choices": [{
                "finish_reason": "stop",
                "message": {"role": "assistant", "content": "ok"},
            }]},
            "usage": {"input_tokens": 8, "output_tokens": 2},
            "request_id": "r",
        });
        let canonical = dashscope_to_chat_response(&upstream, "qwen-max");
        assert_eq!(canonical.choices[0].message.content_text(), "ok");
        assert_eq!(canonical.usage.unwrap().total_tokens, 10);
    }
}
