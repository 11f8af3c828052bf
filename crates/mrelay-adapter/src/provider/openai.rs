use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use mrelay_protocol::Usage;
use mrelay_protocol::sse::{data_frame, done_frame};

use crate::adapter::{Adapter, default_do_request, read_body};
use crate::context::RelayContext;
use crate::count;
use crate::error::{AdapterError, AdapterResult};
use crate::request::RelayRequest;
use crate::response::{AdapterResponse, UsageAccumulator};
use crate::stream::{StreamMapper, relay_stream};

/// The default adapter: OpenAI-compatible passthrough with model renaming.
/// Moonshot, DeepSeek, Groq, Mistral, Perplexity, OpenRouter, XAI and Ollama
/// ride on it with their own default base URLs.
#[derive(Debug, Default)]
pub struct OpenAIAdapter;

impl OpenAIAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for OpenAIAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        let path = match req {
            RelayRequest::Chat(_) => "/v1/chat/completions",
            RelayRequest::Completion(_) => "/v1/completions",
            RelayRequest::Embedding(_) => "/v1/embeddings",
            RelayRequest::Image(_) => "/v1/images/generations",
            RelayRequest::Speech(_) => "/v1/audio/speech",
            RelayRequest::Transcription { translate, .. } => {
                if *translate {
                    "/v1/audio/translations"
                } else {
                    "/v1/audio/transcriptions"
                }
            }
            RelayRequest::Moderation(_) => "/v1/moderations",
            _ => {
                return Err(AdapterError::InvalidRequest(format!(
                    "{} is not an openai operation",
                    req.operation()
                )));
            }
        };
        Ok(build_url(ctx.base_url(), path))
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        Ok(builder.header("authorization", format!("Bearer {}", ctx.key)))
    }

    fn convert_request(&self, req: &RelayRequest, ctx: &RelayContext) -> AdapterResult<Bytes> {
        serialize_with_model(req, &ctx.upstream_model)
    }

    /// Audio transcription/translation goes out as multipart; everything else
    /// takes the default JSON path.
    async fn do_request(
        &self,
        req: &RelayRequest,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::Response> {
        let RelayRequest::Transcription {
            file_name, data, ..
        } = req
        else {
            return default_do_request(self, req, ctx).await;
        };

        let url = self.get_url(ctx, req)?;
        let client = crate::client::shared_client(ctx.proxy.as_deref())?;
        let form = wreq::multipart::Form::new()
            .text("model", ctx.upstream_model.clone())
            .part(
                "file",
                wreq::multipart::Part::stream(data.clone()).file_name(file_name.clone()),
            );
        client
            .post(&url)
            .header("authorization", format!("Bearer {}", ctx.key))
            .multipart(form)
            .send()
            .await
            .map_err(|err| AdapterError::Network(err.to_string()))
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        ctx: &RelayContext,
    ) -> AdapterResult<AdapterResponse> {
        handle_openai_response(response, ctx).await
    }
}

/// `/v1` is deduplicated when the channel's base_url already ends with it,
/// mirroring how operators paste provider URLs.
pub(crate) fn build_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") && (path == "v1" || path.starts_with("v1/")) {
        path = path.trim_start_matches("v1").trim_start_matches('/');
    }
    format!("{base}/{path}")
}

/// Serialize a canonical request with the channel's model mapping applied.
pub(crate) fn serialize_with_model(req: &RelayRequest, model: &str) -> AdapterResult<Bytes> {
    let mut value = match req {
        RelayRequest::Chat(r) => serde_json::to_value(r),
        RelayRequest::Completion(r) => serde_json::to_value(r),
        RelayRequest::Embedding(r) => serde_json::to_value(r),
        RelayRequest::Image(r) => serde_json::to_value(r),
        RelayRequest::Speech(r) => serde_json::to_value(r),
        RelayRequest::Moderation(r) => serde_json::to_value(r),
        _ => {
            return Err(AdapterError::InvalidRequest(format!(
                "{} has no openai payload",
                req.operation()
            )));
        }
    }
    .map_err(|err| AdapterError::InvalidRequest(err.to_string()))?;

    rewrite_model(&mut value, model);
    let body = serde_json::to_vec(&value).map_err(|err| AdapterError::InvalidRequest(err.to_string()))?;
    Ok(Bytes::from(body))
}

pub(crate) fn rewrite_model(value: &mut Value, model: &str) {
    if let Some(object) = value.as_object_mut()
        && object.contains_key("model")
    {
        object.insert("model".to_string(), Value::String(model.to_string()));
    }
}

pub(crate) fn extract_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64)? as u32;
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    Some(Usage::new(prompt, completion))
}

pub(crate) fn is_event_stream(response: &wreq::Response) -> bool {
    response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/event-stream"))
        .unwrap_or(false)
}

/// Shared terminal handling for every upstream that answers in the OpenAI
/// shape (native OpenAI, Zhipu, Xunfei HTTP, DashScope-compatible mode).
pub(crate) async fn handle_openai_response(
    response: wreq::Response,
    ctx: &RelayContext,
) -> AdapterResult<AdapterResponse> {
    let status = response.status();
    if !status.is_success() {
        let body = read_body(response).await.unwrap_or_default();
        return Err(AdapterError::upstream(status.as_u16(), body));
    }

    if ctx.is_stream && is_event_stream(&response) {
        let usage = Arc::new(UsageAccumulator::with_prompt(ctx.prompt_tokens));
        let mapper = OpenAIStreamMapper::new(ctx.canonical_model.clone());
        let handle = relay_stream(response, ctx.stream_timeout, usage, Box::new(mapper));
        return Ok(AdapterResponse::Stream {
            status: http::StatusCode::OK,
            handle,
        });
    }

    let body = read_body(response).await?;
    let mut value: Value =
        serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))?;
    rewrite_model(&mut value, &ctx.canonical_model);
    let usage = extract_usage(&value);
    let body = serde_json::to_vec(&value).map_err(|err| AdapterError::Parse(err.to_string()))?;
    Ok(AdapterResponse::Json {
        status: http::StatusCode::OK,
        body: Bytes::from(body),
        usage,
    })
}

/// Re-emits OpenAI chunks with the canonical model name, harvesting the final
/// usage block when the provider sends one and estimating completion tokens
/// from deltas when it does not.
pub(crate) struct OpenAIStreamMapper {
    canonical_model: String,
}

impl OpenAIStreamMapper {
    pub(crate) fn new(canonical_model: String) -> Self {
        Self { canonical_model }
    }
}

impl StreamMapper for OpenAIStreamMapper {
    fn on_event(&mut self, data: &str, usage: &UsageAccumulator) -> Vec<Bytes> {
        if data.trim() == "[DONE]" {
            // Re-emitted from on_end so it always trails the last chunk.
            return Vec::new();
        }
        let Ok(mut value) = serde_json::from_str::<Value>(data) else {
            return vec![data_frame(data.as_bytes())];
        };

        if let Some(reported) = extract_usage(&value) {
            usage.observe_reported(&reported);
        } else if let Some(choices) = value.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(text) = choice
                    .pointer("/delta/content")
                    .and_then(Value::as_str)
                {
                    usage.add_estimated_completion(count::estimate_text(
                        &self.canonical_model,
                        text,
                    ));
                }
            }
        }

        rewrite_model(&mut value, &self.canonical_model);
        match serde_json::to_vec(&value) {
            Ok(payload) => vec![data_frame(&payload)],
            Err(_) => vec![data_frame(data.as_bytes())],
        }
    }

    fn on_end(&mut self, _usage: &UsageAccumulator) -> Vec<Bytes> {
        vec![done_frame()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use mrelay_common::ChannelKind;

    #[test]
    fn url_dedupes_v1() {
        assert_eq!(
            build_url("https://api.openai.com", "/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            build_url("https://gateway.example/v1", "/v1/chat/completions"),
            "https://gateway.example/v1/chat/completions"
        );
    }

    #[test]
    fn convert_applies_model_mapping() {
        let mut ctx = test_context(ChannelKind::OpenAI, "gpt-4o");
        ctx.upstream_model = "gpt-4o-2024-11-20".to_string();
        let req = RelayRequest::Chat(
            serde_json::from_value(serde_json::json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .unwrap(),
        );
        let body = OpenAIAdapter::new().convert_request(&req, &ctx).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["model"], "gpt-4o-2024-11-20");
    }

    #[test]
    fn stream_mapper_rewrites_model_and_estimates() {
        let usage = UsageAccumulator::with_prompt(5);
        let mut mapper = OpenAIStreamMapper::new("gpt-4o".to_string());
        let chunk = serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 0,
            "model": "gpt-4o-2024-11-20",
            "choices": [{"index": 0, "delta": {"content": "hello world"}, "finish_reason": null}],
        });
        let frames = mapper.on_event(&chunk.to_string(), &usage);
        let text = String::from_utf8_lossy(&frames[0]).to_string();
        assert!(text.contains("\"model\":\"gpt-4o\""));
        assert_eq!(usage.snapshot().completion_tokens, 2);
    }

    #[test]
    fn stream_mapper_prefers_reported_usage() {
        let usage = UsageAccumulator::with_prompt(5);
        let mut mapper = OpenAIStreamMapper::new("gpt-4o".to_string());
        let final_chunk = serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 0,
            "model": "gpt-4o",
            "choices": [],
            "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21},
        });
        mapper.on_event(&final_chunk.to_string(), &usage);
        let snapshot = usage.snapshot();
        assert_eq!(snapshot.prompt_tokens, 9);
        assert_eq!(snapshot.completion_tokens, 12);
    }
}
