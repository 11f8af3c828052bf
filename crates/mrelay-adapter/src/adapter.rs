use async_trait::async_trait;
use bytes::Bytes;
use http::Method;

use crate::client::shared_client;
use crate::context::RelayContext;
use crate::error::{AdapterError, AdapterResult};
use crate::request::RelayRequest;
use crate::response::AdapterResponse;

/// One provider protocol. Implementations are cheap per-request values
/// created by the registry; `init` runs once after selection so adapters can
/// derive per-request auth state (OAuth token, signed URL) before dispatch.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Per-request setup. Most adapters are stateless and keep the default.
    async fn init(&mut self, _ctx: &RelayContext) -> AdapterResult<()> {
        Ok(())
    }

    /// Absolute upstream URL for this request.
    fn get_url(&self, ctx: &RelayContext, req: &RelayRequest) -> AdapterResult<String>;

    /// Auth and provider-specific headers.
    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder>;

    /// Canonical request -> provider-native payload.
    fn convert_request(&self, req: &RelayRequest, ctx: &RelayContext) -> AdapterResult<Bytes>;

    fn http_method(&self, req: &RelayRequest) -> Method {
        match req {
            RelayRequest::MjFetch { .. } | RelayRequest::SunoFetch { .. } => Method::GET,
            _ => Method::POST,
        }
    }

    /// Open the upstream exchange. The default composes the other methods;
    /// adapters with exotic transports (signed bodies, multipart) override.
    async fn do_request(
        &self,
        req: &RelayRequest,
        ctx: &RelayContext,
    ) -> AdapterResult<wreq::Response> {
        default_do_request(self, req, ctx).await
    }

    /// Provider response -> canonical response (JSON or event stream).
    async fn handle_response(
        &self,
        response: wreq::Response,
        ctx: &RelayContext,
    ) -> AdapterResult<AdapterResponse>;

    /// Full round trip. The pipeline always goes through this seam, which is
    /// also where test doubles cut in without touching real HTTP types.
    async fn execute(
        &self,
        req: &RelayRequest,
        ctx: &RelayContext,
    ) -> AdapterResult<AdapterResponse> {
        let response = self.do_request(req, ctx).await?;
        self.handle_response(response, ctx).await
    }
}

/// JSON dispatch through the shared client; adapters that override
/// `do_request` for one operation fall back here for the rest.
pub async fn default_do_request<A: Adapter + ?Sized>(
    adapter: &A,
    req: &RelayRequest,
    ctx: &RelayContext,
) -> AdapterResult<wreq::Response> {
    let url = adapter.get_url(ctx, req)?;
    let method = adapter.http_method(req);
    let client = shared_client(ctx.proxy.as_deref())?;

    tracing::debug!(
        event = "upstream_request",
        trace_id = %ctx.trace_id,
        method = %method,
        url = %url,
    );
    let mut builder = match method {
        Method::GET => client.get(&url),
        _ => client.post(&url).header("content-type", "application/json"),
    };
    builder = adapter.set_headers(builder, ctx).await?;
    if method != Method::GET {
        builder = builder.body(adapter.convert_request(req, ctx)?);
    }

    builder
        .send()
        .await
        .map_err(|err| AdapterError::Network(err.to_string()))
}

/// Non-2xx responses become `Upstream` errors with the body attached so the
/// pipeline can classify them for retry / auto-disable.
pub async fn ensure_success(response: wreq::Response) -> AdapterResult<wreq::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    Err(AdapterError::upstream(status.as_u16(), body))
}

pub async fn read_body(response: wreq::Response) -> AdapterResult<Bytes> {
    response
        .bytes()
        .await
        .map_err(|err| AdapterError::Network(err.to_string()))
}
