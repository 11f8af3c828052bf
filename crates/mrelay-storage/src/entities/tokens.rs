use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    #[sea_orm(unique_key = "token_key")]
    pub key: String,
    pub name: Option<String>,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    /// Unix seconds; 0 means never.
    pub expired_at: i64,
    /// JSON array of model names; null means no restriction.
    pub allowed_models: Option<Json>,
    /// JSON array of group names; null means no restriction.
    pub allowed_groups: Option<Json>,
    /// Sticky routing: pin every request on this token to one channel.
    pub specific_channel_id: Option<i64>,
    pub status: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
