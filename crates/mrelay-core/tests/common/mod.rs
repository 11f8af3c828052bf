#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use mrelay_adapter::{
    Adapter, AdapterRegistry, AdapterResponse, AdapterResult, RelayContext, RelayRequest,
};
use mrelay_common::{ChannelKind, ChannelStatus, TokenStatus, UserStatus};
use mrelay_core::{Limits, PipelineConfig, PriceTable, RelayPipeline};
use mrelay_core::ability::AbilityCache;
use mrelay_core::ledger::Ledger;
use mrelay_storage::{ChannelRow, ChannelSetting, MemoryStore, Store, TokenRow, UserRow};

pub type Behavior =
    Arc<dyn Fn(&RelayContext, &RelayRequest) -> AdapterResult<AdapterResponse> + Send + Sync>;

/// Test double cutting in at the execute seam; no real HTTP is involved.
pub struct MockAdapter {
    behavior: Behavior,
}

impl MockAdapter {
    pub fn new(behavior: Behavior) -> Self {
        Self { behavior }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn get_url(&self, _ctx: &RelayContext, _req: &RelayRequest) -> AdapterResult<String> {
        Ok("http://mock.invalid".to_string())
    }

    async fn set_headers(
        &self,
        builder: wreq::RequestBuilder,
        _ctx: &RelayContext,
    ) -> AdapterResult<wreq::RequestBuilder> {
        Ok(builder)
    }

    fn convert_request(&self, _req: &RelayRequest, _ctx: &RelayContext) -> AdapterResult<Bytes> {
        Ok(Bytes::new())
    }

    async fn do_request(
        &self,
        _req: &RelayRequest,
        _ctx: &RelayContext,
    ) -> AdapterResult<wreq::Response> {
        unreachable!("mock adapters answer from execute")
    }

    async fn handle_response(
        &self,
        _response: wreq::Response,
        _ctx: &RelayContext,
    ) -> AdapterResult<AdapterResponse> {
        unreachable!("mock adapters answer from execute")
    }

    async fn execute(
        &self,
        req: &RelayRequest,
        ctx: &RelayContext,
    ) -> AdapterResult<AdapterResponse> {
        (self.behavior)(ctx, req)
    }
}

pub fn user(id: i64, quota: i64) -> UserRow {
    UserRow {
        id,
        group: "default".to_string(),
        quota,
        used_quota: 0,
        request_count: 0,
        status: UserStatus::Enabled,
        is_admin: false,
    }
}

pub fn token(id: i64, user_id: i64, key: &str, remain: i64, unlimited: bool) -> TokenRow {
    TokenRow {
        id,
        user_id,
        key: key.to_string(),
        name: None,
        remain_quota: remain,
        unlimited_quota: unlimited,
        expired_at: 0,
        allowed_models: None,
        allowed_groups: None,
        specific_channel_id: None,
        status: TokenStatus::Enabled,
    }
}

pub fn channel(id: i64, kind: ChannelKind, model: &str, priority: i64, weight: u32) -> ChannelRow {
    ChannelRow {
        id,
        name: format!("channel-{id}"),
        kind,
        keys: vec![format!("key-{id}")],
        base_url: None,
        models: vec![model.to_string()],
        groups: vec!["default".to_string()],
        model_mapping: Default::default(),
        priority,
        weight,
        status: ChannelStatus::Enabled,
        auto_ban: true,
        status_code_mapping: None,
        setting: ChannelSetting::default(),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub cache: Arc<AbilityCache>,
    pub pipeline: RelayPipeline,
}

/// Wire a pipeline over the in-memory store with every kind answered by the
/// supplied behavior.
pub async fn harness(
    users: Vec<UserRow>,
    tokens: Vec<TokenRow>,
    channels: Vec<ChannelRow>,
    behavior: Behavior,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    for user in &users {
        store.upsert_user(user).await.unwrap();
    }
    for token in &tokens {
        store.upsert_token(token).await.unwrap();
    }
    for channel in &channels {
        store.upsert_channel(channel).await.unwrap();
    }

    let cache = Arc::new(AbilityCache::new());
    cache.rebuild(&store.load_snapshot().await.unwrap());

    let mut registry = AdapterRegistry::builtin();
    for kind in [
        ChannelKind::OpenAI,
        ChannelKind::Anthropic,
        ChannelKind::Midjourney,
        ChannelKind::Suno,
    ] {
        let behavior = behavior.clone();
        registry.register(kind, move || Box::new(MockAdapter::new(behavior.clone())));
    }

    let store_dyn: Arc<dyn Store> = store.clone();
    let ledger = Arc::new(Ledger::new(store_dyn, None));
    let prices = PriceTable::with_overrides(Some(&serde_json::json!({
        "model_ratio": {"relay-test": 0.5},
    })));
    let pipeline = RelayPipeline::new(
        cache.clone(),
        ledger,
        registry,
        Limits::new(0, 16),
        prices,
        PipelineConfig {
            retry_times: 3,
            stream_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    );

    Harness {
        store,
        cache,
        pipeline,
    }
}

pub fn chat_request(model: &str, stream: bool) -> RelayRequest {
    let mut raw = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "hi"}],
    });
    if stream {
        raw["stream"] = serde_json::Value::Bool(true);
    }
    RelayRequest::Chat(serde_json::from_value(raw).unwrap())
}
