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
use crate::client::shared_client;
use crate::context::RelayContext;
use crate::count;
use crate::error::{AdapterError, AdapterResult};
use crate::provider::now_epoch_seconds;
use crate::request::RelayRequest;
use crate::response::{AdapterResponse, UsageAccumulator};
use crate::stream::{StreamMapper, relay_stream};

#[derive(Debug, Default)]
pub struct GeminiAdapter;

impl GeminiAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for GeminiAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        match req {
            RelayRequest::Chat(_) => {
                let action = if ctx.is_stream {
                    "streamGenerateContent?alt=sse"
                } else {
                    "generateContent"
                };
                Ok(format!(
                    "{}/v1beta/models/{}:{action}",
                    ctx.base_url(),
                    ctx.upstream_model,
                ))
            }
            RelayRequest::Embedding(_) => Ok(format!(
                "{}/v1beta/models/{}:embedContent",
                ctx.base_url(),
                ctx.upstream_model,
            )),
            _ => Err(AdapterError::InvalidRequest(format!(
                "{} is not a gemini operation",
                req.operation()
            ))),
        }
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        Ok(builder.header("x-goog-api-key", ctx.key.as_str()))
    }

    fn convert_request(&self, req: &RelayRequest, _ctx: &RelayContext) -> AdapterResult<Bytes> {
        let payload = match req {
            RelayRequest::Chat(chat) => chat_to_gemini_payload(chat),
            RelayRequest::Embedding(embedding) => json!({
                "content": {"parts": [{"text": embedding.input_text()}]},
            }),
            _ => {
                return Err(AdapterError::InvalidRequest(
                    "unsupported gemini payload".to_string(),
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
            let mapper = GeminiStreamMapper::new(ctx.canonical_model.clone());
            let handle = relay_stream(response, ctx.stream_timeout, usage, Box::new(mapper));
            return Ok(AdapterResponse::Stream {
                status: http::StatusCode::OK,
                handle,
            });
        }

        let body = read_body(response).await?;
        let value: Value =
            serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))?;
        let canonical = gemini_to_chat_response(&value, &ctx.canonical_model);
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

fn chat_to_gemini_payload(chat: &ChatCompletionRequest) -> Value {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for message in &chat.messages {
        let text = message.content_text();
        match message.role.as_str() {
            "system" => system_parts.push(json!({"text": text})),
            "assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }

    let mut payload = json!({"contents": contents});
    let object = payload.as_object_mut().expect("payload is an object");
    if !system_parts.is_empty() {
        object.insert(
            "systemInstruction".to_string(),
            json!({"parts": system_parts}),
        );
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(max) = chat.max_output_tokens() {
        generation_config.insert("maxOutputTokens".to_string(), json!(max));
    }
    if let Some(temperature) = chat.extra.get("temperature") {
        generation_config.insert("temperature".to_string(), temperature.clone());
    }
    if let Some(top_p) = chat.extra.get("top_p") {
        generation_config.insert("topP".to_string(), top_p.clone());
    }
    if !generation_config.is_empty() {
        object.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }
    payload
}

fn candidate_text(value: &Value) -> String {
    value
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn gemini_usage(value: &Value) -> Option<Usage> {
    let metadata = value.get("usageMetadata")?;
    let prompt = metadata
        .get("promptTokenCount")
        .and_then(Value::as_u64)? as u32;
    let completion = metadata
        .get("candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    Some(Usage::new(prompt, completion))
}

fn finish_reason(value: &Value) -> Option<String> {
    value
        .pointer("/candidates/0/finishReason")
        .and_then(Value::as_str)
        .map(|reason| match reason {
            "MAX_TOKENS" => "length".to_string(),
            _ => "stop".to_string(),
        })
}

fn gemini_to_chat_response(value: &Value, model: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: now_epoch_seconds(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::text("assistant", candidate_text(value)),
            finish_reason: finish_reason(value).or_else(|| Some("stop".to_string())),
        }],
        usage: gemini_usage(value),
        extra: Default::default(),
    }
}

struct GeminiStreamMapper {
    canonical_model: String,
    id: String,
    created: i64,
    sent_role: bool,
}

impl GeminiStreamMapper {
    fn new(canonical_model: String) -> Self {
        Self {
            canonical_model,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: now_epoch_seconds(),
            sent_role: false,
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
}

impl StreamMapper for GeminiStreamMapper {
    fn on_event(&mut self, data: &str, usage: &UsageAccumulator) -> Vec<Bytes> {
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        if let Some(reported) = gemini_usage(&value) {
            usage.observe_reported(&reported);
        }

        let text = candidate_text(&value);
        if text.is_empty() {
            return Vec::new();
        }
        usage.add_estimated_completion(count::estimate_text(&self.canonical_model, &text));

        let delta = ChatDelta {
            role: (!self.sent_role).then(|| "assistant".to_string()),
            content: Some(text),
            tool_calls: None,
        };
        self.sent_role = true;
        match serde_json::to_vec(&self.chunk(delta, None)) {
            Ok(payload) => vec![data_frame(&payload)],
            Err(_) => Vec::new(),
        }
    }

    fn on_end(&mut self, _usage: &UsageAccumulator) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Ok(payload) =
            serde_json::to_vec(&self.chunk(ChatDelta::default(), Some("stop".to_string())))
        {
            out.push(data_frame(&payload));
        }
        out.push(done_frame());
        out
    }
}

/// Push client media to the Gemini Files API and return the file URI the
/// follow-up generation call references. Uploads expire upstream (~48 h);
/// the relay keeps only the URI.
pub async fn upload_file(
    ctx: &RelayContext,
    file_name: &str,
    mime_type: &str,
    data: Bytes,
) -> AdapterResult<String> {
    let client = shared_client(ctx.proxy.as_deref())?;
    let url = format!(
        "{}/upload/v1beta/files?uploadType=multipart",
        ctx.base_url(),
    );

    let metadata = json!({"file": {"display_name": file_name}}).to_string();
    let form = wreq::multipart::Form::new()
        .part(
            "metadata",
            wreq::multipart::Part::text(metadata)
                .mime_str("application/json")
                .map_err(|err| AdapterError::InvalidRequest(err.to_string()))?,
        )
        .part(
            "file",
            wreq::multipart::Part::stream(data)
                .mime_str(mime_type)
                .map_err(|err| AdapterError::InvalidRequest(err.to_string()))?,
        );

    let response = client
        .post(&url)
        .header("x-goog-api-key", ctx.key.as_str())
        .multipart(form)
        .send()
        .await
        .map_err(|err| AdapterError::Network(err.to_string()))?;

    let status = response.status();
    let body = read_body(response).await?;
    if !status.is_success() {
        return Err(AdapterError::upstream(status.as_u16(), body));
    }
    let value: Value =
        serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))?;
    value
        .pointer("/file/uri")
        .and_then(Value::as_str)
        .map(|uri| uri.to_string())
        .ok_or_else(|| AdapterError::Parse("upload response missing file.uri".to_string()))
}

/// Look up a previously uploaded file by its `files/<id>` name and report the
/// upstream lifecycle state (uploads expire server-side).
pub async fn file_status(ctx: &RelayContext, file_name: &str) -> AdapterResult<Value> {
    let client = shared_client(ctx.proxy.as_deref())?;
    let url = format!(
        "{}/v1beta/{}",
        ctx.base_url(),
        file_name.trim_start_matches('/'),
    );
    let response = client
        .get(&url)
        .header("x-goog-api-key", ctx.key.as_str())
        .send()
        .await
        .map_err(|err| AdapterError::Network(err.to_string()))?;
    let status = response.status();
    let body = read_body(response).await?;
    if !status.is_success() {
        return Err(AdapterError::upstream(status.as_u16(), body));
    }
    serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_converts_to_contents_and_system_instruction() {
        let chat: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.0-flash",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi"},
            ],
            "max_tokens": 64,
            "temperature": 0.2,
        }))
        .unwrap();
        let payload = chat_to_gemini_payload(&chat);
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(payload["contents"][0]["role"], "user");
        assert_eq!(payload["contents"][1]["role"], "model");
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(payload["generationConfig"]["temperature"], 0.2);
    }

    #[test]
    fn response_maps_usage_metadata() {
        let upstream = json!({
            "candidates": [{
                "content": {"parts": [{"text": "answer"}], "role": "model"},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 11, "candidatesTokenCount": 5},
        });
        let canonical = gemini_to_chat_response(&upstream, "gemini-2.0-flash");
        assert_eq!(canonical.choices[0].message.content_text(), "answer");
        let usage = canonical.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 11);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 16);
    }
}
