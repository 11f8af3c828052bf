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
use crate::auth::baidu::access_token;
use crate::context::RelayContext;
use crate::error::{AdapterError, AdapterResult};
use crate::provider::now_epoch_seconds;
use crate::provider::openai::extract_usage;
use crate::request::RelayRequest;
use crate::response::{AdapterResponse, UsageAccumulator};
use crate::stream::{StreamMapper, relay_stream};

/// ERNIE. The channel key is `client_id|client_secret`; `init` resolves the
/// OAuth2 access token (cached, refresh-deduped) that every request URL
/// carries as a query parameter.
#[derive(Debug, Default)]
pub struct BaiduAdapter {
    token: String,
}

impl BaiduAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn endpoint(model: &str) -> String {
        // Endpoint slugs are lowercase variants of the public model names.
        match model {
            "ERNIE-4.0-8K" | "ernie-4.0-8k" => "completions_pro".to_string(),
            "ERNIE-3.5-8K" | "ernie-3.5-8k" => "completions".to_string(),
            other => other.to_ascii_lowercase(),
        }
    }
}

#[async_trait]
impl Adapter for BaiduAdapter {
    async fn init(&mut self, ctx: &RelayContext) -> AdapterResult<()> {
        let (client_id, client_secret) = ctx.key_parts();
        if client_secret.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "baidu key must be client_id|client_secret".to_string(),
            ));
        }
        self.token =
            access_token(ctx.base_url(), client_id, client_secret, ctx.proxy.as_deref()).await?;
        Ok(())
    }

    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        match req {
            RelayRequest::Chat(_) => Ok(format!(
                "{}/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/{}?access_token={}",
                ctx.base_url(),
                Self::endpoint(&ctx.upstream_model),
                urlencoding::encode(&self.token),
            )),
            RelayRequest::Embedding(_) => Ok(format!(
                "{}/rpc/2.0/ai_custom/v1/wenxinworkshop/embeddings/{}?access_token={}",
                ctx.base_url(),
                Self::endpoint(&ctx.upstream_model),
                urlencoding::encode(&self.token),
            )),
            _ => Err(AdapterError::InvalidRequest(format!(
                "{} is not an ernie operation",
                req.operation()
            ))),
        }
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        _ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        // Auth rides in the URL.
        Ok(builder)
    }

    fn convert_request(&self, req: &RelayRequest, _ctx: &RelayContext) -> AdapterResult<Bytes> {
        let payload = match req {
            RelayRequest::Chat(chat) => chat_to_ernie_payload(chat),
            RelayRequest::Embedding(embedding) => json!({
                "input": [embedding.input_text()],
            }),
            _ => {
                return Err(AdapterError::InvalidRequest(
                    "unsupported ernie payload".to_string(),
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
            let mapper = ErnieStreamMapper::new(ctx.canonical_model.clone());
            let handle = relay_stream(response, ctx.stream_timeout, usage, Box::new(mapper));
            return Ok(AdapterResponse::Stream {
                status: http::StatusCode::OK,
                handle,
            });
        }

        let body = read_body(response).await?;
        let value: Value =
            serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))?;
        // ERNIE reports hard failures inside a 200 body.
        if value.get("error_code").and_then(Value::as_i64).is_some() {
            return Err(AdapterError::upstream(400, body));
        }
        let canonical = ernie_to_chat_response(&value, &ctx.canonical_model);
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

/// ERNIE keeps system out of `messages` and insists on strict user/assistant
/// alternation starting with user.
fn chat_to_ernie_payload(chat: &ChatCompletionRequest) -> Value {
    let mut system_parts = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    for message in &chat.messages {
        let text = message.content_text();
        match message.role.as_str() {
            "system" => system_parts.push(text),
            "assistant" => messages.push(json!({"role": "assistant", "content": text})),
            _ => {
                if let Some(last) = messages.last_mut()
                    && last["role"] == "user"
                {
                    let merged = format!(
                        "{}\n{}",
                        last["content"].as_str().unwrap_or_default(),
                        text
                    );
                    last["content"] = Value::String(merged);
                } else {
                    messages.push(json!({"role": "user", "content": text}));
                }
            }
        }
    }

    let mut payload = json!({"messages": messages});
    let object = payload.as_object_mut().expect("payload is an object");
    if !system_parts.is_empty() {
        object.insert("system".to_string(), Value::String(system_parts.join("\n")));
    }
    if chat.is_stream() {
        object.insert("stream".to_string(), Value::Bool(true));
    }
    if let Some(max) = chat.max_output_tokens() {
        object.insert("max_output_tokens".to_string(), json!(max));
    }
    if let Some(temperature) = chat.extra.get("temperature") {
        object.insert("temperature".to_string(), temperature.clone());
    }
    payload
}

fn ernie_to_chat_response(value: &Value, model: &str) -> ChatCompletionResponse {
    let text = value
        .get("result")
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
        usage: extract_usage(value),
        extra: Default::default(),
    }
}

struct ErnieStreamMapper {
    canonical_model: String,
    id: String,
    created: i64,
}

impl ErnieStreamMapper {
    fn new(canonical_model: String) -> Self {
        Self {
            canonical_model,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: now_epoch_seconds(),
        }
    }
}

impl StreamMapper for ErnieStreamMapper {
    fn on_event(&mut self, data: &str, usage: &UsageAccumulator) -> Vec<Bytes> {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };
        if let Some(reported) = extract_usage(&value) {
            usage.observe_reported(&reported);
        }
        let text = value
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let is_end = value.get("is_end").and_then(Value::as_bool).unwrap_or(false);

        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.canonical_model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta: ChatDelta {
                    role: None,
                    content: (!text.is_empty()).then(|| text.to_string()),
                    tool_calls: None,
                },
                finish_reason: is_end.then(|| "stop".to_string()),
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
    fn consecutive_user_messages_merge() {
        let chat: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "ERNIE-4.0-8K",
            "messages": [
                {"role": "system", "content": "rule"},
                {"role": "user", "content": "a"},
                {"role": "user", "content": "b"},
            ],
        }))
        .unwrap();
        let payload = chat_to_ernie_payload(&chat);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"], "a\nb");
        assert_eq!(payload["system"], "rule");
    }

    #[test]
    fn known_models_map_to_endpoints() {
        assert_eq!(BaiduAdapter::endpoint("ERNIE-4.0-8K"), "completions_pro");
        assert_eq!(BaiduAdapter::endpoint("ERNIE-3.5-8K"), "completions");
        assert_eq!(BaiduAdapter::endpoint("ERNIE-Speed"), "ernie-speed");
    }
}
