use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use mrelay_adapter::AdapterRegistry;
use mrelay_common::{GlobalConfig, GlobalConfigPatch};
use mrelay_storage::{SeaOrmStore, Store, StorageBus, StorageBusConfig};

use crate::ability::AbilityCache;
use crate::ledger::Ledger;
use crate::limit::Limits;
use crate::pipeline::{PipelineConfig, RelayPipeline};
use crate::price::PriceTable;
use crate::taskpoll::TaskPoller;

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(5);
const PER_USER_CONCURRENCY: usize = 64;

pub struct Bootstrap {
    pub global: GlobalConfig,
    pub store: Arc<dyn Store>,
    pub cache: Arc<AbilityCache>,
    pub pipeline: Arc<RelayPipeline>,
}

/// Bring the relay up: connect storage, sync the schema, merge config
/// (CLI/ENV layer over the DB row, persisted back), build the in-memory
/// indexes, and start the background workers.
pub async fn bootstrap(overlay: GlobalConfigPatch) -> anyhow::Result<Bootstrap> {
    let dsn = overlay
        .sql_dsn
        .clone()
        .context("SQL_DSN is required (flag, env, or config)")?;
    let store: Arc<dyn Store> = Arc::new(SeaOrmStore::connect(&dsn).await?);
    store.sync().await?;

    let mut merged = match store.load_global_config().await? {
        Some(db_config) => GlobalConfigPatch::from(db_config),
        None => GlobalConfigPatch::default(),
    };
    merged.overlay(overlay);
    let global = merged.into_config()?;
    store.upsert_global_config(&global).await?;

    let bus = Arc::new(StorageBus::spawn(
        store.clone(),
        StorageBusConfig {
            batch_quota_updates: global.batch_update_enabled,
            ..Default::default()
        },
    ));
    let ledger = Arc::new(Ledger::new(store.clone(), Some(bus)));

    let cache = Arc::new(AbilityCache::new());
    cache.rebuild(&store.load_snapshot().await?);

    let stream_timeout = Duration::from_secs(global.streaming_timeout.max(1));
    let prices = PriceTable::with_overrides(global.model_ratio_overrides.as_ref());
    let pipeline = Arc::new(RelayPipeline::new(
        cache.clone(),
        ledger.clone(),
        AdapterRegistry::builtin(),
        Limits::new(0, PER_USER_CONCURRENCY),
        prices.clone(),
        PipelineConfig {
            retry_times: global.retry_times,
            stream_timeout,
            default_proxy: global.proxy.clone(),
            task_query_limit: global.task_query_limit,
            ..Default::default()
        },
    ));

    spawn_cache_refresher(
        cache.clone(),
        store.clone(),
        Duration::from_secs(global.channel_update_frequency.max(1)),
        pipeline.refresh.clone(),
    );
    TaskPoller::new(
        ledger,
        cache.clone(),
        AdapterRegistry::builtin(),
        prices,
        TASK_POLL_INTERVAL,
        stream_timeout,
    )
    .spawn();

    tracing::info!(
        event = "bootstrap_complete",
        channel_refresh_secs = global.channel_update_frequency,
        retry_times = global.retry_times,
        batch_updates = global.batch_update_enabled,
    );

    Ok(Bootstrap {
        global,
        store,
        cache,
        pipeline,
    })
}

/// Periodic swap-on-refresh of the ability cache, with an out-of-band nudge
/// on channel mutation.
pub fn spawn_cache_refresher(
    cache: Arc<AbilityCache>,
    store: Arc<dyn Store>,
    interval: Duration,
    notify: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the cache was just built.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = notify.notified() => {}
            }
            match store.load_snapshot().await {
                Ok(snapshot) => cache.rebuild(&snapshot),
                Err(err) => {
                    tracing::error!(event = "ability_refresh_failed", error = %err);
                }
            }
        }
    })
}
