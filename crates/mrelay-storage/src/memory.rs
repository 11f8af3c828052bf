use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;

use mrelay_common::{ChannelStatus, GlobalConfig};

use crate::rows::{
    AbilityRow, ChannelRow, LogInsert, QuotaDelta, StorageSnapshot, TaskInsert, TaskPatch, TaskRow,
    TaskStatus, TokenRow, UserRow,
};
use crate::store::{Store, StoreError, StoreResult};

/// In-memory `Store` for tests and ephemeral runs. Mirrors the transactional
/// behavior of the SeaORM backend on the quota paths, including the
/// nothing-written guarantee when `pre_consume` fails.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_task_id: AtomicI64,
}

#[derive(Default)]
struct Inner {
    global_config: Option<GlobalConfig>,
    users: HashMap<i64, UserRow>,
    tokens: HashMap<i64, TokenRow>,
    channels: HashMap<i64, ChannelRow>,
    abilities: Vec<AbilityRow>,
    logs: Vec<LogInsert>,
    tasks: Vec<TaskRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<LogInsert> {
        self.inner.lock().expect("memory store poisoned").logs.clone()
    }

    fn rebuild_abilities(inner: &mut Inner, channel_id: i64) {
        inner.abilities.retain(|a| a.channel_id != channel_id);
        let Some(channel) = inner.channels.get(&channel_id) else {
            return;
        };
        if !channel.status.is_enabled() {
            return;
        }
        for group in &channel.groups {
            for model in &channel.models {
                inner.abilities.push(AbilityRow {
                    group: group.clone(),
                    model: model.clone(),
                    channel_id,
                    enabled: true,
                    priority: channel.priority,
                    weight: channel.weight,
                });
            }
        }
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn sync(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn load_global_config(&self) -> StoreResult<Option<GlobalConfig>> {
        Ok(self
            .inner
            .lock()
            .expect("memory store poisoned")
            .global_config
            .clone())
    }

    async fn upsert_global_config(&self, config: &GlobalConfig) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("memory store poisoned")
            .global_config = Some(config.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> StoreResult<StorageSnapshot> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(StorageSnapshot {
            channels: inner.channels.values().cloned().collect(),
            abilities: inner.abilities.clone(),
        })
    }

    async fn user(&self, user_id: i64) -> StoreResult<Option<UserRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.users.get(&user_id).cloned())
    }

    async fn token_by_key(&self, key: &str) -> StoreResult<Option<TokenRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.tokens.values().find(|t| t.key == key).cloned())
    }

    async fn upsert_user(&self, user: &UserRow) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn upsert_token(&self, token: &TokenRow) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn channel(&self, channel_id: i64) -> StoreResult<Option<ChannelRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.channels.get(&channel_id).cloned())
    }

    async fn upsert_channel(&self, channel: &ChannelRow) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.channels.insert(channel.id, channel.clone());
        Self::rebuild_abilities(&mut inner, channel.id);
        Ok(())
    }

    async fn delete_channel(&self, channel_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.channels.remove(&channel_id);
        inner.abilities.retain(|a| a.channel_id != channel_id);
        Ok(())
    }

    async fn set_channel_status(&self, channel_id: i64, status: ChannelStatus) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let channel = inner
            .channels
            .get_mut(&channel_id)
            .ok_or(StoreError::NotFound("channel"))?;
        channel.status = status;
        Self::rebuild_abilities(&mut inner, channel_id);
        Ok(())
    }

    async fn pre_consume(&self, user_id: i64, token_id: i64, amount: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let user_quota = inner
            .users
            .get(&user_id)
            .ok_or(StoreError::NotFound("user"))?
            .quota;
        if user_quota < amount {
            return Err(StoreError::QuotaExceeded);
        }
        let token = inner
            .tokens
            .get(&token_id)
            .ok_or(StoreError::NotFound("token"))?;
        if !token.unlimited_quota && token.remain_quota < amount {
            return Err(StoreError::QuotaExceeded);
        }

        let unlimited = token.unlimited_quota;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.quota -= amount;
        }
        if !unlimited && let Some(token) = inner.tokens.get_mut(&token_id) {
            token.remain_quota -= amount;
        }
        Ok(())
    }

    async fn post_consume(
        &self,
        user_id: i64,
        token_id: i64,
        delta: i64,
        actual: i64,
    ) -> StoreResult<()> {
        self.apply_quota_batch(&[QuotaDelta {
            user_id,
            token_id,
            delta,
            actual,
            requests: 1,
        }])
        .await
    }

    async fn apply_quota_batch(&self, entries: &[QuotaDelta]) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        for entry in entries {
            if let Some(user) = inner.users.get_mut(&entry.user_id) {
                user.quota += entry.delta;
                user.used_quota += entry.actual;
                user.request_count += entry.requests;
            }
            if let Some(token) = inner.tokens.get_mut(&entry.token_id)
                && !token.unlimited_quota
            {
                token.remain_quota += entry.delta;
            }
        }
        Ok(())
    }

    async fn insert_log(&self, log: &LogInsert) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.logs.push(log.clone());
        Ok(())
    }

    async fn insert_logs(&self, logs: &[LogInsert]) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.logs.extend_from_slice(logs);
        Ok(())
    }

    async fn insert_task(&self, task: &TaskInsert) -> StoreResult<i64> {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.tasks.push(TaskRow {
            id,
            task_id: task.task_id.clone(),
            platform: task.platform.clone(),
            user_id: task.user_id,
            token_id: task.token_id,
            channel_id: task.channel_id,
            action: task.action.clone(),
            status: TaskStatus::Submitted,
            progress: 0,
            submit_at: OffsetDateTime::now_utc(),
            start_at: None,
            finish_at: None,
            quota: task.quota,
            quota_settled: false,
            fail_reason: None,
            result_data: None,
        });
        Ok(id)
    }

    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let Some(task) = inner.tasks.iter_mut().find(|t| t.task_id == task_id) else {
            return Err(StoreError::NotFound("task"));
        };
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(progress) = patch.progress {
            task.progress = progress;
        }
        if patch.start_at.is_some() {
            task.start_at = patch.start_at;
        }
        if patch.finish_at.is_some() {
            task.finish_at = patch.finish_at;
        }
        if let Some(settled) = patch.quota_settled {
            task.quota_settled = settled;
        }
        if patch.fail_reason.is_some() {
            task.fail_reason = patch.fail_reason.clone();
        }
        if patch.result_data.is_some() {
            task.result_data = patch.result_data.clone();
        }
        Ok(())
    }

    async fn task(&self, task_id: &str) -> StoreResult<Option<TaskRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.tasks.iter().find(|t| t.task_id == task_id).cloned())
    }

    async fn unfinished_tasks(&self) -> StoreResult<Vec<TaskRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn user_tasks(&self, user_id: i64, limit: usize) -> StoreResult<Vec<TaskRow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut rows: Vec<TaskRow> = inner
            .tasks
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }
}
