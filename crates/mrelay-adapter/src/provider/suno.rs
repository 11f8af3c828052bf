use async_trait::async_trait;
use bytes::Bytes;

use crate::adapter::{Adapter, read_body};
use crate::context::RelayContext;
use crate::error::{AdapterError, AdapterResult};
use crate::request::RelayRequest;
use crate::response::AdapterResponse;

/// suno-api upstream, same submit/poll shape as midjourney with bearer auth.
#[derive(Debug, Default)]
pub struct SunoAdapter;

impl SunoAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for SunoAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        match req {
            RelayRequest::SunoSubmit { action, .. } => {
                Ok(format!("{}/suno/submit/{action}", ctx.base_url()))
            }
            RelayRequest::SunoFetch { task_id } => {
                Ok(format!("{}/suno/fetch/{task_id}", ctx.base_url()))
            }
            _ => Err(AdapterError::InvalidRequest(format!(
                "{} is not a suno operation",
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

    fn convert_request(&self, req: &RelayRequest, _ctx: &RelayContext) -> AdapterResult<Bytes> {
        match req {
            RelayRequest::SunoSubmit { body, .. } => serde_json::to_vec(body)
                .map(Bytes::from)
                .map_err(|err| AdapterError::InvalidRequest(err.to_string())),
            RelayRequest::SunoFetch { .. } => Ok(Bytes::new()),
            _ => Err(AdapterError::InvalidRequest(
                "unsupported suno payload".to_string(),
            )),
        }
    }

    async fn handle_response(
        &self,
        response: wreq::Response,
        _ctx: &RelayContext,
    ) -> AdapterResult<AdapterResponse> {
        let status = response.status();
        let body = read_body(response).await?;
        if !status.is_success() {
            return Err(AdapterError::upstream(status.as_u16(), body));
        }
        Ok(AdapterResponse::Json {
            status: http::StatusCode::OK,
            body,
            usage: None,
        })
    }
}
