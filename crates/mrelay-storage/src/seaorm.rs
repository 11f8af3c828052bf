use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, DatabaseBackend, DatabaseConnection, EntityTrait, ExprTrait,
    QueryFilter, QueryOrder, QuerySelect, Schema, TransactionTrait,
};
use time::OffsetDateTime;

use mrelay_common::{ChannelKind, ChannelStatus, GlobalConfig, TokenStatus, UserStatus};

use crate::db::connect_shared;
use crate::entities;
use crate::rows::{
    AbilityRow, ChannelRow, ChannelSetting, LogInsert, QuotaDelta, StatusCodeMapping,
    StorageSnapshot, TaskInsert, TaskPatch, TaskRow, TaskStatus, TokenRow, UserRow,
};
use crate::store::{Store, StoreError, StoreResult};

#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let db = connect_shared(dsn).await?;
        // Sqlite needs this for cascade + integrity.
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            use sea_orm::ConnectionTrait;
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn rebuild_abilities(&self, channel: &ChannelRow) -> StoreResult<()> {
        use entities::abilities::Column;

        entities::Abilities::delete_many()
            .filter(Column::ChannelId.eq(channel.id))
            .exec(&self.db)
            .await?;

        if !channel.status.is_enabled() {
            return Ok(());
        }

        let mut models = Vec::new();
        for group in &channel.groups {
            for model in &channel.models {
                models.push(entities::abilities::ActiveModel {
                    id: ActiveValue::NotSet,
                    user_group: ActiveValue::Set(group.clone()),
                    model: ActiveValue::Set(model.clone()),
                    channel_id: ActiveValue::Set(channel.id),
                    enabled: ActiveValue::Set(true),
                    priority: ActiveValue::Set(channel.priority),
                    weight: ActiveValue::Set(channel.weight as i32),
                    ..Default::default()
                });
            }
        }
        if !models.is_empty() {
            entities::Abilities::insert_many(models).exec(&self.db).await?;
        }
        Ok(())
    }
}

fn channel_from_model(model: entities::channels::Model) -> StoreResult<ChannelRow> {
    let kind = ChannelKind::parse(&model.kind).ok_or(StoreError::NotFound("channel kind"))?;
    let keys: Vec<String> = serde_json::from_value(model.keys)?;
    let models: Vec<String> = serde_json::from_value(model.models)?;
    let groups: Vec<String> = serde_json::from_value(model.groups)?;
    let model_mapping = match model.model_mapping {
        Some(value) => serde_json::from_value(value)?,
        None => Default::default(),
    };
    let status_code_mapping: Option<StatusCodeMapping> = match model.status_code_mapping {
        Some(value) => Some(serde_json::from_value(value)?),
        None => None,
    };
    let setting: ChannelSetting = match model.setting {
        Some(value) => serde_json::from_value(value)?,
        None => ChannelSetting::default(),
    };
    Ok(ChannelRow {
        id: model.id,
        name: model.name,
        kind,
        keys,
        base_url: model.base_url,
        models,
        groups,
        model_mapping,
        priority: model.priority,
        weight: Ord::max(model.weight, 0) as u32,
        status: ChannelStatus::from_i32(model.status),
        auto_ban: model.auto_ban,
        status_code_mapping,
        setting,
    })
}

fn channel_to_active(
    channel: &ChannelRow,
    now: OffsetDateTime,
) -> StoreResult<entities::channels::ActiveModel> {
    Ok(entities::channels::ActiveModel {
        id: ActiveValue::Set(channel.id),
        name: ActiveValue::Set(channel.name.clone()),
        kind: ActiveValue::Set(channel.kind.as_str().to_string()),
        keys: ActiveValue::Set(serde_json::to_value(&channel.keys)?),
        base_url: ActiveValue::Set(channel.base_url.clone()),
        models: ActiveValue::Set(serde_json::to_value(&channel.models)?),
        groups: ActiveValue::Set(serde_json::to_value(&channel.groups)?),
        model_mapping: ActiveValue::Set(if channel.model_mapping.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&channel.model_mapping)?)
        }),
        priority: ActiveValue::Set(channel.priority),
        weight: ActiveValue::Set(channel.weight as i32),
        status: ActiveValue::Set(channel.status.as_i32()),
        auto_ban: ActiveValue::Set(channel.auto_ban),
        status_code_mapping: ActiveValue::Set(match &channel.status_code_mapping {
            Some(mapping) => Some(serde_json::to_value(mapping)?),
            None => None,
        }),
        setting: ActiveValue::Set(Some(serde_json::to_value(&channel.setting)?)),
        test_at: ActiveValue::NotSet,
        response_time_ms: ActiveValue::NotSet,
        created_at: ActiveValue::Set(now),
        updated_at: ActiveValue::Set(now),
        ..Default::default()
    })
}

fn token_from_model(model: entities::tokens::Model) -> StoreResult<TokenRow> {
    let allowed_models = match model.allowed_models {
        Some(value) => Some(serde_json::from_value(value)?),
        None => None,
    };
    let allowed_groups = match model.allowed_groups {
        Some(value) => Some(serde_json::from_value(value)?),
        None => None,
    };
    Ok(TokenRow {
        id: model.id,
        user_id: model.user_id,
        key: model.key,
        name: model.name,
        remain_quota: model.remain_quota,
        unlimited_quota: model.unlimited_quota,
        expired_at: model.expired_at,
        allowed_models,
        allowed_groups,
        specific_channel_id: model.specific_channel_id,
        status: TokenStatus::from_i32(model.status),
    })
}

fn user_from_model(model: entities::users::Model) -> UserRow {
    UserRow {
        id: model.id,
        group: model.user_group,
        quota: model.quota,
        used_quota: model.used_quota,
        request_count: model.request_count,
        status: UserStatus::from_i32(model.status),
        is_admin: model.is_admin,
    }
}

fn task_from_model(model: entities::tasks::Model) -> TaskRow {
    TaskRow {
        id: model.id,
        task_id: model.task_id,
        platform: model.platform,
        user_id: model.user_id,
        token_id: model.token_id,
        channel_id: model.channel_id,
        action: model.action,
        status: TaskStatus::parse(&model.status),
        progress: model.progress,
        submit_at: model.submit_at,
        start_at: model.start_at,
        finish_at: model.finish_at,
        quota: model.quota,
        quota_settled: model.quota_settled,
        fail_reason: model.fail_reason,
        result_data: model.result_data,
    }
}

fn log_to_active(log: &LogInsert, now: OffsetDateTime) -> entities::logs::ActiveModel {
    entities::logs::ActiveModel {
        id: ActiveValue::NotSet,
        created_at: ActiveValue::Set(now),
        kind: ActiveValue::Set(log.kind.as_str().to_string()),
        user_id: ActiveValue::Set(log.user_id),
        token_id: ActiveValue::Set(log.token_id),
        channel_id: ActiveValue::Set(log.channel_id),
        model: ActiveValue::Set(log.model.clone()),
        prompt_tokens: ActiveValue::Set(log.prompt_tokens),
        completion_tokens: ActiveValue::Set(log.completion_tokens),
        quota: ActiveValue::Set(log.quota),
        elapsed_ms: ActiveValue::Set(log.elapsed_ms),
        is_stream: ActiveValue::Set(log.is_stream),
        content: ActiveValue::Set(log.content.clone()),
        ..Default::default()
    }
}

fn unwrap_txn_error(err: sea_orm::TransactionError<StoreError>) -> StoreError {
    match err {
        sea_orm::TransactionError::Connection(err) => StoreError::Db(err),
        sea_orm::TransactionError::Transaction(err) => err,
    }
}

#[async_trait::async_trait]
impl Store for SeaOrmStore {
    async fn sync(&self) -> StoreResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::GlobalConfig)
            .register(entities::Users)
            .register(entities::Tokens)
            .register(entities::Channels)
            .register(entities::Abilities)
            .register(entities::Logs)
            .register(entities::Tasks)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_global_config(&self) -> StoreResult<Option<GlobalConfig>> {
        use entities::global_config::Column;
        let row = entities::GlobalConfig::find()
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await?;
        match row {
            Some(model) => Ok(Some(serde_json::from_value(model.config_json)?)),
            None => Ok(None),
        }
    }

    async fn upsert_global_config(&self, config: &GlobalConfig) -> StoreResult<()> {
        use entities::global_config::Column;
        let active = entities::global_config::ActiveModel {
            id: ActiveValue::Set(1),
            config_json: ActiveValue::Set(serde_json::to_value(config)?),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::GlobalConfig::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([Column::ConfigJson, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn load_snapshot(&self) -> StoreResult<StorageSnapshot> {
        let channel_models = entities::Channels::find().all(&self.db).await?;
        let mut channels = Vec::with_capacity(channel_models.len());
        for model in channel_models {
            channels.push(channel_from_model(model)?);
        }

        let ability_models = entities::Abilities::find().all(&self.db).await?;
        let abilities = ability_models
            .into_iter()
            .map(|model| AbilityRow {
                group: model.user_group,
                model: model.model,
                channel_id: model.channel_id,
                enabled: model.enabled,
                priority: model.priority,
                weight: Ord::max(model.weight, 0) as u32,
            })
            .collect();

        Ok(StorageSnapshot {
            channels,
            abilities,
        })
    }

    async fn user(&self, user_id: i64) -> StoreResult<Option<UserRow>> {
        let row = entities::Users::find_by_id(user_id).one(&self.db).await?;
        Ok(row.map(user_from_model))
    }

    async fn token_by_key(&self, key: &str) -> StoreResult<Option<TokenRow>> {
        use entities::tokens::Column;
        let row = entities::Tokens::find()
            .filter(Column::Key.eq(key))
            .one(&self.db)
            .await?;
        row.map(token_from_model).transpose()
    }

    async fn upsert_user(&self, user: &UserRow) -> StoreResult<()> {
        use entities::users::Column;
        let now = OffsetDateTime::now_utc();
        let active = entities::users::ActiveModel {
            id: ActiveValue::Set(user.id),
            user_group: ActiveValue::Set(user.group.clone()),
            quota: ActiveValue::Set(user.quota),
            used_quota: ActiveValue::Set(user.used_quota),
            request_count: ActiveValue::Set(user.request_count),
            status: ActiveValue::Set(user.status.as_i32()),
            is_admin: ActiveValue::Set(user.is_admin),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        entities::Users::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::UserGroup,
                        Column::Quota,
                        Column::UsedQuota,
                        Column::RequestCount,
                        Column::Status,
                        Column::IsAdmin,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn upsert_token(&self, token: &TokenRow) -> StoreResult<()> {
        use entities::tokens::Column;
        let now = OffsetDateTime::now_utc();
        let active = entities::tokens::ActiveModel {
            id: ActiveValue::Set(token.id),
            user_id: ActiveValue::Set(token.user_id),
            key: ActiveValue::Set(token.key.clone()),
            name: ActiveValue::Set(token.name.clone()),
            remain_quota: ActiveValue::Set(token.remain_quota),
            unlimited_quota: ActiveValue::Set(token.unlimited_quota),
            expired_at: ActiveValue::Set(token.expired_at),
            allowed_models: ActiveValue::Set(match &token.allowed_models {
                Some(models) => Some(serde_json::to_value(models)?),
                None => None,
            }),
            allowed_groups: ActiveValue::Set(match &token.allowed_groups {
                Some(groups) => Some(serde_json::to_value(groups)?),
                None => None,
            }),
            specific_channel_id: ActiveValue::Set(token.specific_channel_id),
            status: ActiveValue::Set(token.status.as_i32()),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        entities::Tokens::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::UserId,
                        Column::Key,
                        Column::Name,
                        Column::RemainQuota,
                        Column::UnlimitedQuota,
                        Column::ExpiredAt,
                        Column::AllowedModels,
                        Column::AllowedGroups,
                        Column::SpecificChannelId,
                        Column::Status,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn channel(&self, channel_id: i64) -> StoreResult<Option<ChannelRow>> {
        let row = entities::Channels::find_by_id(channel_id)
            .one(&self.db)
            .await?;
        row.map(channel_from_model).transpose()
    }

    async fn upsert_channel(&self, channel: &ChannelRow) -> StoreResult<()> {
        use entities::channels::Column;
        let now = OffsetDateTime::now_utc();
        let active = channel_to_active(channel, now)?;
        entities::Channels::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::Name,
                        Column::Kind,
                        Column::Keys,
                        Column::BaseUrl,
                        Column::Models,
                        Column::Groups,
                        Column::ModelMapping,
                        Column::Priority,
                        Column::Weight,
                        Column::Status,
                        Column::AutoBan,
                        Column::StatusCodeMapping,
                        Column::Setting,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        self.rebuild_abilities(channel).await
    }

    async fn delete_channel(&self, channel_id: i64) -> StoreResult<()> {
        entities::Channels::delete_by_id(channel_id)
            .exec(&self.db)
            .await?;
        // Cascade covers abilities; sqlite without FK enforcement still needs it.
        entities::Abilities::delete_many()
            .filter(entities::abilities::Column::ChannelId.eq(channel_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn set_channel_status(&self, channel_id: i64, status: ChannelStatus) -> StoreResult<()> {
        use entities::channels::Column;
        entities::Channels::update_many()
            .col_expr(Column::Status, Expr::value(status.as_i32()))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(channel_id))
            .exec(&self.db)
            .await?;

        let Some(channel) = self.channel(channel_id).await? else {
            return Err(StoreError::NotFound("channel"));
        };
        self.rebuild_abilities(&channel).await
    }

    async fn pre_consume(&self, user_id: i64, token_id: i64, amount: i64) -> StoreResult<()> {
        use entities::{tokens, users};

        let result = self
            .db
            .transaction::<_, (), StoreError>(move |txn| {
                Box::pin(async move {
                    let updated = users::Entity::update_many()
                        .col_expr(
                            users::Column::Quota,
                            Expr::col(users::Column::Quota).sub(amount),
                        )
                        .filter(users::Column::Id.eq(user_id))
                        .filter(users::Column::Quota.gte(amount))
                        .exec(txn)
                        .await?;
                    if updated.rows_affected != 1 {
                        return Err(StoreError::QuotaExceeded);
                    }

                    let token = tokens::Entity::find_by_id(token_id)
                        .one(txn)
                        .await?
                        .ok_or(StoreError::NotFound("token"))?;
                    if !token.unlimited_quota {
                        let updated = tokens::Entity::update_many()
                            .col_expr(
                                tokens::Column::RemainQuota,
                                Expr::col(tokens::Column::RemainQuota).sub(amount),
                            )
                            .filter(tokens::Column::Id.eq(token_id))
                            .filter(tokens::Column::RemainQuota.gte(amount))
                            .exec(txn)
                            .await?;
                        if updated.rows_affected != 1 {
                            return Err(StoreError::QuotaExceeded);
                        }
                    }
                    Ok(())
                })
            })
            .await;
        result.map_err(unwrap_txn_error)
    }

    async fn post_consume(
        &self,
        user_id: i64,
        token_id: i64,
        delta: i64,
        actual: i64,
    ) -> StoreResult<()> {
        use entities::{tokens, users};

        let result = self
            .db
            .transaction::<_, (), StoreError>(move |txn| {
                Box::pin(async move {
                    users::Entity::update_many()
                        .col_expr(
                            users::Column::Quota,
                            Expr::col(users::Column::Quota).add(delta),
                        )
                        .col_expr(
                            users::Column::UsedQuota,
                            Expr::col(users::Column::UsedQuota).add(actual),
                        )
                        .col_expr(
                            users::Column::RequestCount,
                            Expr::col(users::Column::RequestCount).add(1),
                        )
                        .filter(users::Column::Id.eq(user_id))
                        .exec(txn)
                        .await?;

                    tokens::Entity::update_many()
                        .col_expr(
                            tokens::Column::RemainQuota,
                            Expr::col(tokens::Column::RemainQuota).add(delta),
                        )
                        .filter(tokens::Column::Id.eq(token_id))
                        .filter(tokens::Column::UnlimitedQuota.eq(false))
                        .exec(txn)
                        .await?;
                    Ok(())
                })
            })
            .await;
        result.map_err(unwrap_txn_error)
    }

    async fn apply_quota_batch(&self, entries: &[QuotaDelta]) -> StoreResult<()> {
        use entities::{tokens, users};

        if entries.is_empty() {
            return Ok(());
        }
        let entries = entries.to_vec();
        let result = self
            .db
            .transaction::<_, (), StoreError>(move |txn| {
                Box::pin(async move {
                    for entry in entries {
                        users::Entity::update_many()
                            .col_expr(
                                users::Column::Quota,
                                Expr::col(users::Column::Quota).add(entry.delta),
                            )
                            .col_expr(
                                users::Column::UsedQuota,
                                Expr::col(users::Column::UsedQuota).add(entry.actual),
                            )
                            .col_expr(
                                users::Column::RequestCount,
                                Expr::col(users::Column::RequestCount).add(entry.requests),
                            )
                            .filter(users::Column::Id.eq(entry.user_id))
                            .exec(txn)
                            .await?;
                        tokens::Entity::update_many()
                            .col_expr(
                                tokens::Column::RemainQuota,
                                Expr::col(tokens::Column::RemainQuota).add(entry.delta),
                            )
                            .filter(tokens::Column::Id.eq(entry.token_id))
                            .filter(tokens::Column::UnlimitedQuota.eq(false))
                            .exec(txn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .await;
        result.map_err(unwrap_txn_error)
    }

    async fn insert_log(&self, log: &LogInsert) -> StoreResult<()> {
        let active = log_to_active(log, OffsetDateTime::now_utc());
        entities::Logs::insert(active).exec(&self.db).await?;
        Ok(())
    }

    async fn insert_logs(&self, logs: &[LogInsert]) -> StoreResult<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let now = OffsetDateTime::now_utc();
        let models = logs.iter().map(|log| log_to_active(log, now));
        entities::Logs::insert_many(models).exec(&self.db).await?;
        Ok(())
    }

    async fn insert_task(&self, task: &TaskInsert) -> StoreResult<i64> {
        let active = entities::tasks::ActiveModel {
            id: ActiveValue::NotSet,
            task_id: ActiveValue::Set(task.task_id.clone()),
            platform: ActiveValue::Set(task.platform.clone()),
            user_id: ActiveValue::Set(task.user_id),
            token_id: ActiveValue::Set(task.token_id),
            channel_id: ActiveValue::Set(task.channel_id),
            action: ActiveValue::Set(task.action.clone()),
            status: ActiveValue::Set(TaskStatus::Submitted.as_str().to_string()),
            progress: ActiveValue::Set(0),
            submit_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            start_at: ActiveValue::Set(None),
            finish_at: ActiveValue::Set(None),
            quota: ActiveValue::Set(task.quota),
            quota_settled: ActiveValue::Set(false),
            fail_reason: ActiveValue::Set(None),
            result_data: ActiveValue::Set(None),
        };
        let result = entities::Tasks::insert(active).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> StoreResult<()> {
        use entities::tasks::Column;
        let mut update = entities::Tasks::update_many().filter(Column::TaskId.eq(task_id));
        if let Some(status) = patch.status {
            update = update.col_expr(Column::Status, Expr::value(status.as_str()));
        }
        if let Some(progress) = patch.progress {
            update = update.col_expr(Column::Progress, Expr::value(progress));
        }
        if let Some(start_at) = patch.start_at {
            update = update.col_expr(Column::StartAt, Expr::value(start_at));
        }
        if let Some(finish_at) = patch.finish_at {
            update = update.col_expr(Column::FinishAt, Expr::value(finish_at));
        }
        if let Some(quota_settled) = patch.quota_settled {
            update = update.col_expr(Column::QuotaSettled, Expr::value(quota_settled));
        }
        if let Some(fail_reason) = &patch.fail_reason {
            update = update.col_expr(Column::FailReason, Expr::value(fail_reason.clone()));
        }
        if let Some(result_data) = &patch.result_data {
            update = update.col_expr(Column::ResultData, Expr::value(result_data.clone()));
        }
        update.exec(&self.db).await?;
        Ok(())
    }

    async fn task(&self, task_id: &str) -> StoreResult<Option<TaskRow>> {
        use entities::tasks::Column;
        let row = entities::Tasks::find()
            .filter(Column::TaskId.eq(task_id))
            .one(&self.db)
            .await?;
        Ok(row.map(task_from_model))
    }

    async fn unfinished_tasks(&self) -> StoreResult<Vec<TaskRow>> {
        use entities::tasks::Column;
        let rows = entities::Tasks::find()
            .filter(Column::Status.is_in([
                TaskStatus::Submitted.as_str(),
                TaskStatus::InProgress.as_str(),
            ]))
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(task_from_model).collect())
    }

    async fn user_tasks(&self, user_id: i64, limit: usize) -> StoreResult<Vec<TaskRow>> {
        use entities::tasks::Column;
        let rows = entities::Tasks::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::Id)
            .limit(limit as u64)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(task_from_model).collect())
    }
}
