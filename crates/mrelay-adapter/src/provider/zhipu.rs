use async_trait::async_trait;
use bytes::Bytes;

use crate::adapter::Adapter;
use crate::auth::zhipu::bearer_token;
use crate::context::RelayContext;
use crate::error::{AdapterError, AdapterResult};
use crate::provider::openai::{handle_openai_response, serialize_with_model};
use crate::request::RelayRequest;
use crate::response::AdapterResponse;

/// GLM speaks the OpenAI wire shape behind a minted JWT.
#[derive(Debug, Default)]
pub struct ZhipuAdapter;

impl ZhipuAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for ZhipuAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        let path = match req {
            RelayRequest::Chat(_) => "/api/paas/v4/chat/completions",
            RelayRequest::Embedding(_) => "/api/paas/v4/embeddings",
            RelayRequest::Image(_) => "/api/paas/v4/images/generations",
            _ => {
                return Err(AdapterError::InvalidRequest(format!(
                    "{} is not a glm operation",
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
        let token = bearer_token(&ctx.key).await?;
        Ok(builder.header("authorization", format!("Bearer {token}")))
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
