use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::adapter::Adapter;
use crate::auth::xunfei::assemble_auth_url;
use crate::context::RelayContext;
use crate::error::{AdapterError, AdapterResult};
use crate::provider::openai::{handle_openai_response, serialize_with_model};
use crate::request::RelayRequest;
use crate::response::AdapterResponse;

const CHAT_PATH: &str = "/v1/chat/completions";

/// Spark over HTTP. The channel key is `api_key|api_secret`; every request
/// URL carries an HMAC signature over host, date and request line, and the
/// response body is OpenAI-shaped.
#[derive(Debug, Default)]
pub struct XunfeiAdapter;

impl XunfeiAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for XunfeiAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        let RelayRequest::Chat(_) = req else {
            return Err(AdapterError::InvalidRequest(format!(
                "{} is not a spark operation",
                req.operation()
            )));
        };
        let (api_key, api_secret) = ctx.key_parts();
        if api_secret.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "xunfei key must be api_key|api_secret".to_string(),
            ));
        }
        assemble_auth_url(
            ctx.base_url(),
            CHAT_PATH,
            api_key,
            api_secret,
            "POST",
            SystemTime::now(),
        )
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        _ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        // Auth lives in the signed URL.
        Ok(builder)
    }

    fn convert_request(&self, req: &RelayRequest, ctx: &RelayContext) -> AdapterResult<Bytes> {
        serialize_with_model(req, &ctx.upstream_model)
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        ctx: &RelayContext,
    ) -> AdapterResult<AdapterResponse> {
        handle_openai_response(response, ctx).await
    }
}
