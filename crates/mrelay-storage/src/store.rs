use async_trait::async_trait;

use mrelay_common::{ChannelStatus, GlobalConfig};

use crate::rows::{
    ChannelRow, LogInsert, QuotaDelta, StorageSnapshot, TaskInsert, TaskPatch, TaskRow, TokenRow,
    UserRow,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("insufficient quota")]
    QuotaExceeded,
}

/// Durable record access for the relay core.
///
/// Hot request paths never query channel/ability rows here; they read the
/// ArcSwap-published ability cache, which this trait only feeds
/// (`load_snapshot`) and invalidates (channel mutations). User/token reads go
/// through a short-TTL cache in front of `user` / `token_by_key`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Entity-first schema sync (SeaORM 2.0). Run once at bootstrap.
    async fn sync(&self) -> StoreResult<()>;

    async fn load_global_config(&self) -> StoreResult<Option<GlobalConfig>>;
    async fn upsert_global_config(&self, config: &GlobalConfig) -> StoreResult<()>;

    /// Everything the ability cache is rebuilt from.
    async fn load_snapshot(&self) -> StoreResult<StorageSnapshot>;

    // Users / tokens
    async fn user(&self, user_id: i64) -> StoreResult<Option<UserRow>>;
    async fn token_by_key(&self, key: &str) -> StoreResult<Option<TokenRow>>;
    async fn upsert_user(&self, user: &UserRow) -> StoreResult<()>;
    async fn upsert_token(&self, token: &TokenRow) -> StoreResult<()>;

    // Channels / abilities
    async fn channel(&self, channel_id: i64) -> StoreResult<Option<ChannelRow>>;
    async fn upsert_channel(&self, channel: &ChannelRow) -> StoreResult<()>;
    async fn delete_channel(&self, channel_id: i64) -> StoreResult<()>;
    /// Also drops or restores the channel's ability rows atomically.
    async fn set_channel_status(&self, channel_id: i64, status: ChannelStatus) -> StoreResult<()>;

    // Quota ledger
    /// One transaction: `user.quota -= amount`, `token.remain_quota -= amount`
    /// unless the token is unlimited. Insufficient balance on either side
    /// leaves both untouched and returns `QuotaExceeded`.
    async fn pre_consume(&self, user_id: i64, token_id: i64, amount: i64) -> StoreResult<()>;
    /// `delta` flows back into the balances (positive = refund, negative =
    /// over-run deduction); `actual` lands in `used_quota` and bumps
    /// `request_count`.
    async fn post_consume(
        &self,
        user_id: i64,
        token_id: i64,
        delta: i64,
        actual: i64,
    ) -> StoreResult<()>;
    /// Batched form of `post_consume`, used when `BATCH_UPDATE_ENABLED`
    /// coalesces settles through the storage bus.
    async fn apply_quota_batch(&self, entries: &[QuotaDelta]) -> StoreResult<()>;

    // Logs
    async fn insert_log(&self, log: &LogInsert) -> StoreResult<()>;
    async fn insert_logs(&self, logs: &[LogInsert]) -> StoreResult<()>;

    // Async tasks
    async fn insert_task(&self, task: &TaskInsert) -> StoreResult<i64>;
    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> StoreResult<()>;
    async fn task(&self, task_id: &str) -> StoreResult<Option<TaskRow>>;
    async fn unfinished_tasks(&self) -> StoreResult<Vec<TaskRow>>;
    async fn user_tasks(&self, user_id: i64, limit: usize) -> StoreResult<Vec<TaskRow>>;
}
