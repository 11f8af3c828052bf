use std::sync::Arc;
use std::time::Duration;

use mrelay_storage::{
    BillingEvent, LogInsert, QuotaDelta, Store, StoreError, StorageBus, TokenRow, UserRow,
};

use crate::error::RelayError;

const CACHE_TTL: Duration = Duration::from_secs(30);
const CACHE_CAPACITY: u64 = 65_536;

/// Quota ledger: pre-consume / settle against user and token balances with a
/// short-TTL read cache in front of the store.
///
/// Read-your-writes holds per id: every balance write invalidates the cached
/// user and token, so the next read inside the same request goes to storage.
pub struct Ledger {
    store: Arc<dyn Store>,
    bus: Option<Arc<StorageBus>>,
    users: moka::sync::Cache<i64, Arc<UserRow>>,
    tokens: moka::sync::Cache<String, Arc<TokenRow>>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, bus: Option<Arc<StorageBus>>) -> Self {
        Self {
            store,
            bus,
            users: moka::sync::Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
            tokens: moka::sync::Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    pub async fn user(&self, user_id: i64) -> Result<Option<Arc<UserRow>>, RelayError> {
        if let Some(user) = self.users.get(&user_id) {
            return Ok(Some(user));
        }
        let Some(user) = self.store.user(user_id).await? else {
            return Ok(None);
        };
        let user = Arc::new(user);
        self.users.insert(user_id, user.clone());
        Ok(Some(user))
    }

    pub async fn token_by_key(&self, key: &str) -> Result<Option<Arc<TokenRow>>, RelayError> {
        if let Some(token) = self.tokens.get(key) {
            return Ok(Some(token));
        }
        let Some(token) = self.store.token_by_key(key).await? else {
            return Ok(None);
        };
        let token = Arc::new(token);
        self.tokens.insert(key.to_string(), token.clone());
        Ok(Some(token))
    }

    fn invalidate(&self, user_id: i64, token_key: &str) {
        self.users.invalidate(&user_id);
        self.tokens.invalidate(&token_key.to_string());
    }

    /// Atomic reservation; nothing is written when either balance is short.
    pub async fn pre_consume(
        &self,
        user: &UserRow,
        token: &TokenRow,
        amount: i64,
    ) -> Result<(), RelayError> {
        if amount <= 0 {
            return Ok(());
        }
        let result = self.store.pre_consume(user.id, token.id, amount).await;
        self.invalidate(user.id, &token.key);
        match result {
            Ok(()) => Ok(()),
            Err(StoreError::QuotaExceeded) => Err(RelayError::quota_exceeded(
                "quota is not enough for this request",
            )),
            Err(other) => Err(other.into()),
        }
    }

    /// Reconcile a reservation: `delta = pre_consumed - actual` flows back
    /// (negative on overrun), `actual` lands in used_quota.
    pub async fn settle(
        &self,
        user_id: i64,
        token: &TokenRow,
        pre_consumed: i64,
        actual: i64,
    ) -> Result<(), RelayError> {
        let delta = pre_consumed - actual;
        if let Some(bus) = &self.bus {
            bus.submit(BillingEvent::Quota(QuotaDelta {
                user_id,
                token_id: token.id,
                delta,
                actual,
                requests: 1,
            }));
        } else {
            self.store
                .post_consume(user_id, token.id, delta, actual)
                .await?;
        }
        self.invalidate(user_id, &token.key);
        Ok(())
    }

    /// Give the whole reservation back; used on any failure between
    /// pre-consume and settle. Does not count as a served request.
    pub async fn refund(
        &self,
        user_id: i64,
        token: &TokenRow,
        pre_consumed: i64,
    ) -> Result<(), RelayError> {
        if pre_consumed <= 0 {
            return Ok(());
        }
        // requests stays 0: a refunded request never counts as served.
        self.store
            .apply_quota_batch(&[QuotaDelta {
                user_id,
                token_id: token.id,
                delta: pre_consumed,
                actual: 0,
                requests: 0,
            }])
            .await?;
        self.invalidate(user_id, &token.key);
        Ok(())
    }

    /// Terminal failure of an async task: the whole reservation flows back.
    pub async fn finalize_task_refund(
        &self,
        user_id: i64,
        token_id: i64,
        amount: i64,
    ) -> Result<(), RelayError> {
        self.store
            .apply_quota_batch(&[QuotaDelta {
                user_id,
                token_id,
                delta: amount,
                actual: 0,
                requests: 0,
            }])
            .await?;
        self.users.invalidate(&user_id);
        Ok(())
    }

    /// Terminal success of an async task: `actual` becomes spend and any
    /// unused part of the reservation flows back (the action proved cheaper
    /// than what was reserved at submit time).
    pub async fn finalize_task_success(
        &self,
        user_id: i64,
        token_id: i64,
        reserved: i64,
        actual: i64,
    ) -> Result<(), RelayError> {
        self.store
            .apply_quota_batch(&[QuotaDelta {
                user_id,
                token_id,
                delta: reserved - actual,
                actual,
                requests: 1,
            }])
            .await?;
        self.users.invalidate(&user_id);
        Ok(())
    }

    /// Append-only accounting record, batched through the bus when present.
    pub fn log(&self, entry: LogInsert) {
        if let Some(bus) = &self.bus {
            bus.submit(BillingEvent::Log(entry));
        } else {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(err) = store.insert_log(&entry).await {
                    tracing::error!(event = "log_insert_failed", error = %err);
                }
            });
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
