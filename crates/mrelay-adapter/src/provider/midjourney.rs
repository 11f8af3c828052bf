use async_trait::async_trait;
use bytes::Bytes;

use crate::adapter::{Adapter, read_body};
use crate::context::RelayContext;
use crate::error::{AdapterError, AdapterResult};
use crate::request::RelayRequest;
use crate::response::AdapterResponse;

/// midjourney-proxy upstream: submit then poll. Generation completes through
/// the async task subsystem, so responses here are plain JSON passthrough and
/// billing happens against the action price table at submit time.
#[derive(Debug, Default)]
pub struct MidjourneyAdapter;

impl MidjourneyAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for MidjourneyAdapter {
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String> {
        match req {
            RelayRequest::MjSubmit { action, .. } => {
                Ok(format!("{}/mj/submit/{action}", ctx.base_url()))
            }
            RelayRequest::MjFetch { task_id } => {
                Ok(format!("{}/mj/task/{task_id}/fetch", ctx.base_url()))
            }
            _ => Err(AdapterError::InvalidRequest(format!(
                "{} is not a midjourney operation",
                req.operation()
            ))),
        }
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        Ok(builder.header("mj-api-secret", ctx.key.as_str()))
    }

    fn convert_request(&self, req: &RelayRequest, _ctx: &RelayContext) -> AdapterResult<Bytes> {
        match req {
            RelayRequest::MjSubmit { body, .. } => serde_json::to_vec(body)
                .map(Bytes::from)
                .map_err(|err| AdapterError::InvalidRequest(err.to_string())),
            RelayRequest::MjFetch { .. } => Ok(Bytes::new()),
            _ => Err(AdapterError::InvalidRequest(
                "unsupported midjourney payload".to_string(),
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
