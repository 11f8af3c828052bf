use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::Stream;
use http::StatusCode;
use tokio::sync::Notify;
use uuid::Uuid;

use mrelay_adapter::{
    AdapterRegistry, AdapterResponse, RelayContext, RelayRequest, UsageAccumulator, count,
};
use mrelay_common::{ChannelKind, ChannelStatus, TokenStatus, UserStatus};
use mrelay_protocol::Usage;
use mrelay_storage::{ChannelRow, LogInsert, LogKind, TaskInsert, TokenRow, UserRow};

use crate::ability::{AbilityCache, resolve_group};
use crate::error::{RelayError, classify_adapter_error};
use crate::ledger::Ledger;
use crate::limit::{ConcurrencyGuard, Limits};
use crate::price::{PriceTable, Ratios, actual_quota, pre_consume_quota};

/// Hot-reloadable knobs the pipeline reads per request.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry_times: u32,
    pub stream_timeout: Duration,
    pub default_proxy: Option<String>,
    pub task_query_limit: usize,
    /// Allow-listed directory for path-based file uploads.
    pub file_local_dir: Option<std::path::PathBuf>,
    /// Bounded fan-out for batch uploads.
    pub upload_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_times: 3,
            stream_timeout: Duration::from_secs(60),
            default_proxy: None,
            task_query_limit: 100,
            file_local_dir: None,
            upload_concurrency: 5,
        }
    }
}

/// Resolved caller identity: authenticated token plus its owning user.
#[derive(Clone)]
pub struct Caller {
    pub user: Arc<UserRow>,
    pub token: Arc<TokenRow>,
    pub group: String,
    /// Sticky routing from `specific_channel_id` or an admin `-<id>` key
    /// suffix.
    pub pinned_channel: Option<i64>,
}

pub enum RelayOutcome {
    Json {
        status: StatusCode,
        body: Bytes,
    },
    Stream {
        status: StatusCode,
        frames: GuardedStream,
    },
}

/// Per-request orchestrator: auth, routing, retry, billing, logging.
pub struct RelayPipeline {
    pub(crate) cache: Arc<AbilityCache>,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) registry: AdapterRegistry,
    pub(crate) limits: Limits,
    pub(crate) prices: ArcSwap<PriceTable>,
    pub(crate) config: ArcSwap<PipelineConfig>,
    /// Pinged on channel mutation; the refresher task listens.
    pub refresh: Arc<Notify>,
}

impl RelayPipeline {
    pub fn new(
        cache: Arc<AbilityCache>,
        ledger: Arc<Ledger>,
        registry: AdapterRegistry,
        limits: Limits,
        prices: PriceTable,
        config: PipelineConfig,
    ) -> Self {
        Self {
            cache,
            ledger,
            registry,
            limits,
            prices: ArcSwap::from_pointee(prices),
            config: ArcSwap::from_pointee(config),
            refresh: Arc::new(Notify::new()),
        }
    }

    pub fn update_config(&self, config: PipelineConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn update_prices(&self, prices: PriceTable) {
        self.prices.store(Arc::new(prices));
    }

    pub fn cache(&self) -> &Arc<AbilityCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Resolve a bearer key into a caller. An admin may suffix a key with
    /// `-<channel_id>` to pin routing, e.g. after a file upload.
    pub async fn authenticate(&self, bearer_key: &str) -> Result<Caller, RelayError> {
        let bearer_key = bearer_key.trim();
        if bearer_key.is_empty() {
            return Err(RelayError::unauthorized("missing api key"));
        }

        let (token, suffix_channel) = match self.ledger.token_by_key(bearer_key).await? {
            Some(token) => (token, None),
            None => match split_channel_suffix(bearer_key) {
                Some((base, channel_id)) => {
                    let token = self
                        .ledger
                        .token_by_key(base)
                        .await?
                        .ok_or_else(|| RelayError::unauthorized("invalid api key"))?;
                    (token, Some(channel_id))
                }
                None => return Err(RelayError::unauthorized("invalid api key")),
            },
        };

        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Disabled => {
                return Err(RelayError::unauthorized("this api key is disabled"));
            }
            TokenStatus::Expired => {
                return Err(RelayError::unauthorized("this api key has expired"));
            }
            TokenStatus::Exhausted => {
                return Err(RelayError::quota_exceeded("this api key has no quota left"));
            }
        }
        if token.is_expired(time::OffsetDateTime::now_utc().unix_timestamp()) {
            return Err(RelayError::unauthorized("this api key has expired"));
        }

        let user = self
            .ledger
            .user(token.user_id)
            .await?
            .ok_or_else(|| RelayError::unauthorized("user not found"))?;
        if user.status != UserStatus::Enabled {
            return Err(RelayError::unauthorized("user is disabled"));
        }

        if suffix_channel.is_some() && !user.is_admin {
            return Err(RelayError::forbidden(
                "channel pinning requires an admin key",
            ));
        }

        let group = resolve_group(&user.group).to_string();
        Ok(Caller {
            pinned_channel: suffix_channel.or(token.specific_channel_id),
            group,
            user,
            token,
        })
    }

    /// Relay one canonical request end to end.
    pub async fn relay(
        &self,
        caller: &Caller,
        request: RelayRequest,
    ) -> Result<RelayOutcome, RelayError> {
        let model = request
            .model()
            .ok_or_else(|| RelayError::invalid_request("missing model"))?
            .to_string();
        self.token_preflight(caller, &model)?;
        self.limits.check_model(&model)?;
        let slot = self.limits.acquire_user_slot(caller.user.id)?;

        let prompt_tokens = estimate_prompt(&request);
        let prices = self.prices.load_full();
        let ratios = prices.ratios(&model, &caller.group);
        let pre_consumed =
            pre_consume_quota(prompt_tokens, max_completion_of(&request), &ratios);
        self.ledger
            .pre_consume(&caller.user, &caller.token, pre_consumed)
            .await?;

        match self
            .routing_loop(caller, &request, &model, prompt_tokens, &ratios, pre_consumed, slot)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Any failure after PRECONSUMED and before SETTLED refunds.
                if let Err(refund_err) = self
                    .ledger
                    .refund(caller.user.id, &caller.token, pre_consumed)
                    .await
                {
                    tracing::error!(
                        event = "refund_failed",
                        user_id = caller.user.id,
                        error = %refund_err,
                    );
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn routing_loop(
        &self,
        caller: &Caller,
        request: &RelayRequest,
        model: &str,
        prompt_tokens: u32,
        ratios: &Ratios,
        pre_consumed: i64,
        slot: ConcurrencyGuard,
    ) -> Result<RelayOutcome, RelayError> {
        let config = self.config.load_full();
        let started = Instant::now();
        let trace_id = Uuid::new_v4().to_string();
        let mut tried: HashSet<i64> = HashSet::new();
        let mut last_error: Option<RelayError> = None;
        let attempts = config.retry_times.saturating_add(1);

        for attempt in 0..attempts {
            let Some(channel) = self.pick_channel(caller, model, attempt, &tried)? else {
                if attempt == 0 && last_error.is_none() {
                    return Err(RelayError::no_channel(format!(
                        "no channel serves model {model} for group {}",
                        caller.group
                    )));
                }
                break;
            };

            let ctx = self.build_context(&channel, model, request, prompt_tokens, &trace_id, &config);
            tracing::info!(
                event = "upstream_dispatch",
                trace_id = %trace_id,
                attempt,
                channel_id = channel.id,
                kind = channel.kind.as_str(),
                model = %model,
                upstream_model = %ctx.upstream_model,
                is_stream = ctx.is_stream,
            );

            let mut adapter = self.registry.create(channel.kind);
            let result = match adapter.init(&ctx).await {
                Ok(()) => adapter.execute(request, &ctx).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(AdapterResponse::Json { status, body, usage }) => {
                    let usage = usage.unwrap_or_else(|| Usage::new(prompt_tokens, 0));
                    let actual = actual_quota(&usage, ratios);
                    self.ledger
                        .settle(caller.user.id, &caller.token, pre_consumed, actual)
                        .await?;
                    self.ledger.log(consume_log(
                        caller,
                        &channel,
                        model,
                        &usage,
                        actual,
                        started.elapsed(),
                        false,
                        ratios,
                    ));
                    tracing::info!(
                        event = "relay_settled",
                        trace_id = %trace_id,
                        channel_id = channel.id,
                        quota = actual,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                    );
                    return Ok(RelayOutcome::Json { status, body });
                }
                Ok(AdapterResponse::Stream { status, handle }) => {
                    let settle = StreamSettle {
                        ledger: self.ledger.clone(),
                        caller: caller.clone(),
                        channel_id: channel.id,
                        model: model.to_string(),
                        ratios: *ratios,
                        pre_consumed,
                        usage: handle.usage.clone(),
                        started,
                        trace_id: trace_id.clone(),
                    };
                    return Ok(RelayOutcome::Stream {
                        status,
                        frames: GuardedStream {
                            inner: handle.frames,
                            settle: Some(settle),
                            _slot: Some(slot),
                        },
                    });
                }
                Err(err) => {
                    let relay_err =
                        classify_adapter_error(&err, channel.status_code_mapping.as_ref());
                    tracing::warn!(
                        event = "upstream_attempt_failed",
                        trace_id = %trace_id,
                        attempt,
                        channel_id = channel.id,
                        kind = ?relay_err.kind,
                        status = ?relay_err.upstream_status,
                        message = %relay_err.message,
                    );

                    if relay_err.kind.disables_channel() && channel.auto_ban {
                        self.auto_disable(&channel, &relay_err);
                    }
                    if relay_err.kind.is_retriable() {
                        tried.insert(channel.id);
                        last_error = Some(relay_err);
                        continue;
                    }
                    return Err(relay_err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RelayError::no_channel("all candidate channels failed")))
    }

    fn pick_channel(
        &self,
        caller: &Caller,
        model: &str,
        attempt: u32,
        tried: &HashSet<i64>,
    ) -> Result<Option<Arc<ChannelRow>>, RelayError> {
        if let Some(channel_id) = caller.pinned_channel {
            if tried.contains(&channel_id) {
                return Ok(None);
            }
            let channel = self
                .cache
                .channel(channel_id)
                .ok_or_else(|| RelayError::no_channel("pinned channel not found"))?;
            if !channel.status.is_enabled() {
                return Err(RelayError::no_channel("pinned channel is disabled"));
            }
            if !channel.serves(&caller.group, model) {
                return Err(RelayError::forbidden(format!(
                    "pinned channel does not serve {model} for group {}",
                    caller.group
                )));
            }
            return Ok(Some(channel));
        }
        Ok(self.cache.select(&caller.group, model, attempt, tried))
    }

    fn build_context(
        &self,
        channel: &ChannelRow,
        model: &str,
        request: &RelayRequest,
        prompt_tokens: u32,
        trace_id: &str,
        config: &PipelineConfig,
    ) -> RelayContext {
        RelayContext {
            trace_id: trace_id.to_string(),
            channel_id: channel.id,
            kind: channel.kind,
            base_url: channel.base_url.clone(),
            key: self.cache.next_key(channel),
            canonical_model: model.to_string(),
            upstream_model: channel.mapped_model(model).to_string(),
            is_stream: request.is_stream(),
            prompt_tokens,
            proxy: channel
                .setting
                .proxy
                .clone()
                .or_else(|| config.default_proxy.clone()),
            region: channel.setting.region.clone(),
            sdk_mode: channel.setting.sdk_mode,
            stream_timeout: config.stream_timeout,
        }
    }

    /// Best-effort: the retry proceeds even when the status write fails.
    fn auto_disable(&self, channel: &ChannelRow, reason: &RelayError) {
        self.cache.evict_channel(channel.id);
        self.refresh.notify_one();
        tracing::warn!(
            event = "channel_auto_disabled",
            channel_id = channel.id,
            reason = %reason.message,
        );
        let store = self.ledger.store().clone();
        let channel_id = channel.id;
        tokio::spawn(async move {
            if let Err(err) = store
                .set_channel_status(channel_id, ChannelStatus::AutoDisabled)
                .await
            {
                tracing::error!(
                    event = "auto_disable_persist_failed",
                    channel_id,
                    error = %err,
                );
            }
        });
    }

    fn token_preflight(&self, caller: &Caller, model: &str) -> Result<(), RelayError> {
        if let Some(allowed) = &caller.token.allowed_models
            && !allowed.iter().any(|m| m == model)
        {
            return Err(RelayError::forbidden(format!(
                "this api key cannot use model {model}"
            )));
        }
        if let Some(allowed) = &caller.token.allowed_groups
            && !allowed.iter().any(|g| g == &caller.group)
        {
            return Err(RelayError::forbidden(format!(
                "this api key cannot use group {}",
                caller.group
            )));
        }
        Ok(())
    }

    // ---- async task surface -------------------------------------------------

    /// Submit a long-running generation. The reservation stays open until the
    /// poller sees a terminal state.
    pub async fn relay_task_submit(
        &self,
        caller: &Caller,
        request: RelayRequest,
    ) -> Result<Bytes, RelayError> {
        let (platform, routing_model, action) = match &request {
            RelayRequest::MjSubmit { action, .. } => {
                (ChannelKind::Midjourney, "midjourney", action.clone())
            }
            RelayRequest::SunoSubmit { action, .. } => (ChannelKind::Suno, "suno", action.clone()),
            _ => {
                return Err(RelayError::invalid_request(
                    "not an async task submission",
                ));
            }
        };
        self.token_preflight(caller, routing_model)?;
        self.limits.check_model(routing_model)?;
        let _slot = self.limits.acquire_user_slot(caller.user.id)?;

        let prices = self.prices.load_full();
        let price_name = format!("{}_{action}", platform_prefix(platform));
        let fixed = prices
            .fixed_price(&price_name)
            .or_else(|| prices.fixed_price(routing_model))
            .unwrap_or(50.0);
        let ratios = Ratios {
            model_ratio: 0.0,
            completion_ratio: 0.0,
            group_ratio: prices.group_ratio(&caller.group),
            fixed_price: Some(fixed),
        };
        let reserved = pre_consume_quota(0, Some(0), &ratios);
        self.ledger
            .pre_consume(&caller.user, &caller.token, reserved)
            .await?;

        match self
            .task_submit_inner(caller, &request, routing_model, platform, &action, reserved)
            .await
        {
            Ok(body) => Ok(body),
            Err(err) => {
                if let Err(refund_err) = self
                    .ledger
                    .refund(caller.user.id, &caller.token, reserved)
                    .await
                {
                    tracing::error!(event = "refund_failed", error = %refund_err);
                }
                Err(err)
            }
        }
    }

    async fn task_submit_inner(
        &self,
        caller: &Caller,
        request: &RelayRequest,
        routing_model: &str,
        platform: ChannelKind,
        action: &str,
        reserved: i64,
    ) -> Result<Bytes, RelayError> {
        let config = self.config.load_full();
        let trace_id = Uuid::new_v4().to_string();
        let mut tried = HashSet::new();
        let mut last_error: Option<RelayError> = None;
        let attempts = config.retry_times.saturating_add(1);

        for attempt in 0..attempts {
            let Some(channel) = self.pick_channel(caller, routing_model, attempt, &tried)? else {
                if attempt == 0 && last_error.is_none() {
                    return Err(RelayError::no_channel(format!(
                        "no channel serves {routing_model} for group {}",
                        caller.group
                    )));
                }
                break;
            };
            let ctx = self.build_context(
                &channel,
                routing_model,
                request,
                0,
                &trace_id,
                &config,
            );
            let mut adapter = self.registry.create(channel.kind);
            let result = match adapter.init(&ctx).await {
                Ok(()) => adapter.execute(request, &ctx).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(AdapterResponse::Json { body, .. }) => {
                    let Some(remote_id) = parse_submit_task_id(platform, &body) else {
                        // Upstream answered but refused the job; pass the
                        // refusal through and give the reservation back.
                        self.ledger
                            .refund(caller.user.id, &caller.token, reserved)
                            .await?;
                        return Ok(body);
                    };
                    self.ledger
                        .store()
                        .insert_task(&TaskInsert {
                            task_id: remote_id.clone(),
                            platform: platform_prefix(platform).to_string(),
                            user_id: caller.user.id,
                            token_id: caller.token.id,
                            channel_id: channel.id,
                            action: action.to_string(),
                            quota: reserved,
                        })
                        .await?;
                    tracing::info!(
                        event = "task_submitted",
                        trace_id = %trace_id,
                        task_id = %remote_id,
                        platform = platform.as_str(),
                        channel_id = channel.id,
                        reserved,
                    );
                    return Ok(body);
                }
                Ok(AdapterResponse::Stream { .. }) => {
                    return Err(RelayError::internal(
                        "task submission cannot stream",
                    ));
                }
                Err(err) => {
                    let relay_err =
                        classify_adapter_error(&err, channel.status_code_mapping.as_ref());
                    if relay_err.kind.disables_channel() && channel.auto_ban {
                        self.auto_disable(&channel, &relay_err);
                    }
                    if relay_err.kind.is_retriable() {
                        tried.insert(channel.id);
                        last_error = Some(relay_err);
                        continue;
                    }
                    return Err(relay_err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RelayError::no_channel("all candidate channels failed")))
    }

    /// Fetch one task; cross-user access needs admin.
    pub async fn task_fetch(
        &self,
        caller: &Caller,
        task_id: &str,
    ) -> Result<mrelay_storage::TaskRow, RelayError> {
        let task = self
            .ledger
            .store()
            .task(task_id)
            .await?
            .ok_or_else(|| RelayError::invalid_request("task not found"))?;
        if task.user_id != caller.user.id && !caller.user.is_admin {
            return Err(RelayError::forbidden("task belongs to another user"));
        }
        Ok(task)
    }

    /// List the caller's tasks, page size bounded by `TASK_QUERY_LIMIT`.
    pub async fn task_list(
        &self,
        caller: &Caller,
        limit: Option<usize>,
    ) -> Result<Vec<mrelay_storage::TaskRow>, RelayError> {
        let cap = self.config.load().task_query_limit;
        let limit = limit.unwrap_or(cap).min(cap);
        Ok(self
            .ledger
            .store()
            .user_tasks(caller.user.id, limit)
            .await?)
    }
}

fn platform_prefix(platform: ChannelKind) -> &'static str {
    match platform {
        ChannelKind::Midjourney => "mj",
        _ => "suno",
    }
}

fn parse_submit_task_id(platform: ChannelKind, body: &Bytes) -> Option<String> {
    match platform {
        ChannelKind::Midjourney => {
            let parsed: mrelay_protocol::mj::SubmitResponse = serde_json::from_slice(body).ok()?;
            if parsed.accepted() { parsed.result } else { None }
        }
        _ => {
            let parsed: mrelay_protocol::suno::ApiResponse = serde_json::from_slice(body).ok()?;
            if parsed.is_success() { parsed.task_id() } else { None }
        }
    }
}

fn split_channel_suffix(key: &str) -> Option<(&str, i64)> {
    let (base, suffix) = key.rsplit_once('-')?;
    let channel_id = suffix.parse::<i64>().ok()?;
    if base.is_empty() {
        return None;
    }
    Some((base, channel_id))
}

fn estimate_prompt(request: &RelayRequest) -> u32 {
    match request {
        RelayRequest::Chat(chat) => count::count_chat_request(chat),
        RelayRequest::Completion(req) => count::estimate_text(&req.model, &req.prompt_text()),
        RelayRequest::Embedding(req) => count::estimate_text(&req.model, &req.input_text()),
        RelayRequest::Image(req) => count::estimate_text(&req.model, &req.prompt),
        RelayRequest::Speech(req) => count::estimate_text(&req.model, &req.input),
        RelayRequest::Moderation(req) => {
            let model = req.model.as_deref().unwrap_or("omni-moderation-latest");
            count::estimate_text(model, &req.input.to_string())
        }
        _ => 0,
    }
}

fn max_completion_of(request: &RelayRequest) -> Option<u32> {
    match request {
        RelayRequest::Chat(chat) => chat.max_output_tokens(),
        RelayRequest::Completion(req) => req.max_tokens,
        // Non-generative calls produce no completion tokens.
        RelayRequest::Embedding(_) | RelayRequest::Moderation(_) => Some(0),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn consume_log(
    caller: &Caller,
    channel: &ChannelRow,
    model: &str,
    usage: &Usage,
    quota: i64,
    elapsed: Duration,
    is_stream: bool,
    ratios: &Ratios,
) -> LogInsert {
    LogInsert {
        kind: LogKind::Consume,
        user_id: caller.user.id,
        token_id: Some(caller.token.id),
        channel_id: Some(channel.id),
        model: Some(model.to_string()),
        prompt_tokens: usage.prompt_tokens as i64,
        completion_tokens: usage.completion_tokens as i64,
        quota,
        elapsed_ms: elapsed.as_millis() as i64,
        is_stream,
        content: format!(
            "model ratio {:.3}, completion ratio {:.3}, group ratio {:.3}",
            ratios.model_ratio, ratios.completion_ratio, ratios.group_ratio,
        ),
    }
}

/// Billing state carried by a streamed response; the settle runs exactly once
/// when the stream finishes or the client goes away.
struct StreamSettle {
    ledger: Arc<Ledger>,
    caller: Caller,
    channel_id: i64,
    model: String,
    ratios: Ratios,
    pre_consumed: i64,
    usage: Arc<UsageAccumulator>,
    started: Instant,
    trace_id: String,
}

impl StreamSettle {
    async fn run(self) {
        let usage = self.usage.snapshot();
        let actual = actual_quota(&usage, &self.ratios);
        if let Err(err) = self
            .ledger
            .settle(self.caller.user.id, &self.caller.token, self.pre_consumed, actual)
            .await
        {
            tracing::error!(
                event = "stream_settle_failed",
                trace_id = %self.trace_id,
                error = %err,
            );
            return;
        }
        self.ledger.log(LogInsert {
            kind: LogKind::Consume,
            user_id: self.caller.user.id,
            token_id: Some(self.caller.token.id),
            channel_id: Some(self.channel_id),
            model: Some(self.model.clone()),
            prompt_tokens: usage.prompt_tokens as i64,
            completion_tokens: usage.completion_tokens as i64,
            quota: actual,
            elapsed_ms: self.started.elapsed().as_millis() as i64,
            is_stream: true,
            content: String::new(),
        });
        tracing::info!(
            event = "relay_settled",
            trace_id = %self.trace_id,
            channel_id = self.channel_id,
            quota = actual,
            is_stream = true,
        );
    }
}

/// Canonical frame stream handed to the HTTP layer. Dropping it (normal end
/// or client disconnect) cancels the upstream read and triggers the settle
/// with whatever usage was observed.
pub struct GuardedStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    settle: Option<StreamSettle>,
    _slot: Option<ConcurrencyGuard>,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for GuardedStream {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            tokio::spawn(settle.run());
        }
    }
}
