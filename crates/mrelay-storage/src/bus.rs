use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};

use crate::rows::{LogInsert, QuotaDelta};
use crate::store::Store;

#[derive(Debug, Clone)]
pub enum BillingEvent {
    Log(LogInsert),
    Quota(QuotaDelta),
}

#[derive(Debug, Clone)]
pub struct StorageBusConfig {
    pub capacity: usize,
    pub log_batch_size: usize,
    pub flush_interval: Duration,
    pub retry_delay: Duration,
    /// When false, quota events flush immediately instead of coalescing.
    pub batch_quota_updates: bool,
}

impl Default for StorageBusConfig {
    fn default() -> Self {
        Self {
            capacity: 65_536,
            log_batch_size: 200,
            flush_interval: Duration::from_millis(200),
            retry_delay: Duration::from_millis(200),
            batch_quota_updates: false,
        }
    }
}

/// Fire-and-forget sink for billing writes. Log rows are batched; quota
/// deltas are either applied per event or coalesced per (user, token) when
/// `BATCH_UPDATE_ENABLED` is on. Failed flushes retry until they land, so a
/// settle handed to the bus is never dropped.
pub struct StorageBus {
    tx: mpsc::Sender<BillingEvent>,
    _handle: JoinHandle<()>,
}

impl StorageBus {
    pub fn spawn(store: Arc<dyn Store>, config: StorageBusConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity);
        let handle = tokio::spawn(writer(store, rx, config));
        Self {
            tx,
            _handle: handle,
        }
    }

    pub fn submit(&self, event: BillingEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!(event = "billing_bus_full", "billing event dropped");
        }
    }
}

async fn writer(
    store: Arc<dyn Store>,
    mut rx: mpsc::Receiver<BillingEvent>,
    config: StorageBusConfig,
) {
    let mut logs: Vec<LogInsert> = Vec::with_capacity(config.log_batch_size);
    let mut quotas: HashMap<(i64, i64), QuotaDelta> = HashMap::new();
    let mut ticker = tokio_time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(BillingEvent::Log(log)) => {
                        logs.push(log);
                        if logs.len() >= config.log_batch_size {
                            flush_logs(&store, &mut logs, config.retry_delay).await;
                        }
                    }
                    Some(BillingEvent::Quota(delta)) => {
                        if config.batch_quota_updates {
                            merge_quota(&mut quotas, delta);
                        } else {
                            flush_quotas_now(&store, vec![delta], config.retry_delay).await;
                        }
                    }
                    None => {
                        flush_logs(&store, &mut logs, config.retry_delay).await;
                        let pending: Vec<QuotaDelta> = quotas.drain().map(|(_, v)| v).collect();
                        flush_quotas_now(&store, pending, config.retry_delay).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !logs.is_empty() {
                    flush_logs(&store, &mut logs, config.retry_delay).await;
                }
                if !quotas.is_empty() {
                    let pending: Vec<QuotaDelta> = quotas.drain().map(|(_, v)| v).collect();
                    flush_quotas_now(&store, pending, config.retry_delay).await;
                }
            }
        }
    }
}

fn merge_quota(quotas: &mut HashMap<(i64, i64), QuotaDelta>, delta: QuotaDelta) {
    quotas
        .entry((delta.user_id, delta.token_id))
        .and_modify(|entry| {
            entry.delta += delta.delta;
            entry.actual += delta.actual;
            entry.requests += delta.requests;
        })
        .or_insert(delta);
}

async fn flush_logs(store: &Arc<dyn Store>, buffer: &mut Vec<LogInsert>, retry_delay: Duration) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    loop {
        match store.insert_logs(&batch).await {
            Ok(()) => break,
            Err(err) => {
                tracing::error!(event = "log_flush_failed", error = %err);
                tokio_time::sleep(retry_delay).await;
            }
        }
    }
}

async fn flush_quotas_now(store: &Arc<dyn Store>, batch: Vec<QuotaDelta>, retry_delay: Duration) {
    if batch.is_empty() {
        return;
    }
    loop {
        match store.apply_quota_batch(&batch).await {
            Ok(()) => break,
            Err(err) => {
                tracing::error!(event = "quota_flush_failed", error = %err);
                tokio_time::sleep(retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::rows::{LogKind, TokenRow, UserRow};
    use mrelay_common::{TokenStatus, UserStatus};

    async fn seed(store: &MemoryStore) {
        let user = UserRow {
            id: 1,
            group: "default".to_string(),
            quota: 1000,
            used_quota: 0,
            request_count: 0,
            status: UserStatus::Enabled,
            is_admin: false,
        };
        let token = TokenRow {
            id: 7,
            user_id: 1,
            key: "sk-test".to_string(),
            name: None,
            remain_quota: 1000,
            unlimited_quota: false,
            expired_at: 0,
            allowed_models: None,
            allowed_groups: None,
            specific_channel_id: None,
            status: TokenStatus::Enabled,
        };
        store.upsert_user(&user).await.unwrap();
        store.upsert_token(&token).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn coalesced_quota_deltas_apply_once() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let bus = StorageBus::spawn(
            store.clone(),
            StorageBusConfig {
                flush_interval: Duration::from_millis(20),
                batch_quota_updates: true,
                ..Default::default()
            },
        );
        for _ in 0..3 {
            bus.submit(BillingEvent::Quota(QuotaDelta {
                user_id: 1,
                token_id: 7,
                delta: -10,
                actual: 10,
                requests: 1,
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let user = store.user(1).await.unwrap().unwrap();
        assert_eq!(user.quota, 970);
        assert_eq!(user.used_quota, 30);
        assert_eq!(user.request_count, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn logs_flush_on_interval() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let bus = StorageBus::spawn(
            store.clone(),
            StorageBusConfig {
                flush_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );
        bus.submit(BillingEvent::Log(LogInsert::system(1, "boot")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let logs = store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, LogKind::System);
    }
}
