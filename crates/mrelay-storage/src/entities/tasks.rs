use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Relay-local task id handed to the client.
    #[sea_orm(unique_key = "task_local_id")]
    pub task_id: String,
    /// midjourney | suno
    pub platform: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub action: String,
    /// submitted | in_progress | success | failure
    pub status: String,
    pub progress: i32,
    pub submit_at: OffsetDateTime,
    pub start_at: Option<OffsetDateTime>,
    pub finish_at: Option<OffsetDateTime>,
    /// Quota reserved at submit time; reconciled on the terminal transition.
    pub quota: i64,
    /// Set exactly once, when the reservation is settled or refunded.
    pub quota_settled: bool,
    pub fail_reason: Option<String>,
    pub result_data: Option<Json>,
}

impl ActiveModelBehavior for ActiveModel {}
