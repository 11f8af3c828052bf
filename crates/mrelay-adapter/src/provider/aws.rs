use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use time::OffsetDateTime;

use mrelay_protocol::openai::{
    ChatChunkChoice, ChatCompletionChunk, ChatDelta, ChatCompletionRequest,
};
use mrelay_protocol::sse::{data_frame, done_frame};

use crate::adapter::{Adapter, read_body};
use crate::auth::sigv4::{SigV4Params, sign};
use crate::client::shared_client;
use crate::context::RelayContext;
use crate::error::{AdapterError, AdapterResult};
use crate::provider::now_epoch_seconds;
use crate::request::RelayRequest;
use crate::response::{AdapterResponse, StreamHandle, UsageAccumulator};

const SERVICE: &str = "bedrock";
const DEFAULT_REGION: &str = "us-east-1";

/// Bedrock invoke with SigV4-signed requests. The channel key is
/// `access_key|secret_key` and the region comes from the channel setting.
///
/// Responses always come back via the non-stream `invoke` call; a client
/// stream request is satisfied by replaying the complete answer as one
/// canonical chunk, which keeps the wire contract without speaking the AWS
/// binary event framing.
#[derive(Debug, Default)]
pub struct AwsAdapter;

impl AwsAdapter {
    pub fn new() -> Self {
        Self
    }

    fn host(region: &str) -> String {
        format!("bedrock-runtime.{region}.amazonaws.com")
    }
}

#[async_trait]
impl Adapter for AwsAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        let RelayRequest::Chat(_) = req else {
            return Err(AdapterError::InvalidRequest(format!(
                "{} is not a bedrock operation",
                req.operation()
            )));
        };
        let region = ctx.region.as_deref().unwrap_or(DEFAULT_REGION);
        Ok(format!(
            "https://{}/model/{}/invoke",
            Self::host(region),
            urlencoding::encode(&ctx.upstream_model),
        ))
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        _ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        // Signing happens in do_request where the payload is known.
        Ok(builder)
    }

    fn convert_request(&self, req: &RelayRequest, _ctx: &RelayContext) -> AdapterResult<Bytes> {
        let RelayRequest::Chat(chat) = req else {
            return Err(AdapterError::InvalidRequest(
                "bedrock adapter only relays chat".to_string(),
            ));
        };
        let payload = chat_to_bedrock_payload(chat);
        serde_json::to_vec(&payload)
            .map(Bytes::from)
            .map_err(|err| AdapterError::InvalidRequest(err.to_string()))
    }

    async fn do_request(
        &self,
        req: &RelayRequest,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::Response> {
        let (access_key, secret_key) = ctx.key_parts();
        if secret_key.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "aws key must be access_key|secret_key".to_string(),
            ));
        }
        let region = ctx.region.as_deref().unwrap_or(DEFAULT_REGION);
        let url = self.get_url(ctx, req)?;
        let body = self.convert_request(req, ctx)?;
        let path = url
            .splitn(4, '/')
            .nth(3)
            .map(|tail| format!("/{tail}"))
            .unwrap_or_else(|| "/".to_string());

        let signed = sign(&SigV4Params {
            access_key,
            secret_key,
            region,
            service: SERVICE,
            method: "POST",
            host: &Self::host(region),
            path: &path,
            query: "",
            payload: &body,
            now: OffsetDateTime::now_utc(),
        })?;

        let client = shared_client(ctx.proxy.as_deref())?;
        client
            .post(&url)
            .header("content-type", "application/json")
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization)
            .body(body)
            .send()
            .await
            .map_err(|err| AdapterError::Network(err.to_string()))
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

        let body = read_body(response).await?;
        let parsed: mrelay_protocol::claude::MessagesResponse =
            serde_json::from_slice(&body).map_err(|err| AdapterError::Parse(err.to_string()))?;

        let text = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                mrelay_protocol::claude::ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        let usage = mrelay_protocol::Usage::new(
            parsed.usage.input_tokens,
            parsed.usage.output_tokens,
        );

        if ctx.is_stream {
            return Ok(AdapterResponse::Stream {
                status: http::StatusCode::OK,
                handle: replay_as_stream(&ctx.canonical_model, text, usage, ctx.prompt_tokens),
            });
        }

        let canonical = mrelay_protocol::openai::ChatCompletionResponse {
            id: format!("chatcmpl-{}", parsed.id.trim_start_matches("msg_")),
            object: "chat.completion".to_string(),
            created: now_epoch_seconds(),
            model: ctx.canonical_model.clone(),
            choices: vec![mrelay_protocol::openai::ChatChoice {
                index: 0,
                message: mrelay_protocol::openai::ChatMessage::text("assistant", text),
                finish_reason: Some(
                    parsed
                        .stop_reason
                        .as_deref()
                        .map(crate::transform::stop_reason_to_finish_reason)
                        .unwrap_or("stop")
                        .to_string(),
                ),
            }],
            usage: Some(usage.clone()),
            extra: Default::default(),
        };
        let body = serde_json::to_vec(&canonical)
            .map_err(|err| AdapterError::Parse(err.to_string()))?;
        Ok(AdapterResponse::Json {
            status: http::StatusCode::OK,
            body: Bytes::from(body),
            usage: Some(usage),
        })
    }
}

fn chat_to_bedrock_payload(chat: &ChatCompletionRequest) -> Value {
    let mut system_parts = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    for message in &chat.messages {
        let text = message.content_text();
        match message.role.as_str() {
            "system" => system_parts.push(text),
            "assistant" => messages.push(json!({"role": "assistant", "content": text})),
            _ => messages.push(json!({"role": "user", "content": text})),
        }
    }
    let mut payload = json!({
        "anthropic_version": "bedrock-2023-05-31",
        "max_tokens": chat.max_output_tokens().unwrap_or(4096),
        "messages": messages,
    });
    if !system_parts.is_empty() {
        payload["system"] = Value::String(system_parts.join("\n"));
    }
    payload
}

fn replay_as_stream(
    model: &str,
    text: String,
    usage: mrelay_protocol::Usage,
    prompt_fallback: u32,
) -> StreamHandle {
    let accumulator = std::sync::Arc::new(UsageAccumulator::with_prompt(prompt_fallback));
    accumulator.observe_reported(&usage);

    let chunk = ChatCompletionChunk {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion.chunk".to_string(),
        created: now_epoch_seconds(),
        model: model.to_string(),
        choices: vec![ChatChunkChoice {
            index: 0,
            delta: ChatDelta {
                role: Some("assistant".to_string()),
                content: Some(text),
                tool_calls: None,
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(usage),
    };
    let frames: Vec<Result<Bytes, std::io::Error>> = match serde_json::to_vec(&chunk) {
        Ok(payload) => vec![Ok(data_frame(&payload)), Ok(done_frame())],
        Err(_) => vec![Ok(done_frame())],
    };

    StreamHandle {
        frames: Box::pin(futures_util::stream::iter(frames)),
        usage: accumulator,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_bedrock_version() {
        let chat: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "anthropic.claude-3-5-sonnet-20241022-v2:0",
            "messages": [
                {"role": "system", "content": "rule"},
                {"role": "user", "content": "hi"},
            ],
        }))
        .unwrap();
        let payload = chat_to_bedrock_payload(&chat);
        assert_eq!(payload["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(payload["system"], "rule");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
    }
}
