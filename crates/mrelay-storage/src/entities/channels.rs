use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// Provider family, `ChannelKind` string form.
    pub kind: String,
    /// JSON array of credentials; multi-key channels round-robin over it.
    pub keys: Json,
    pub base_url: Option<String>,
    /// JSON array of model names this channel claims.
    pub models: Json,
    /// JSON array of user groups this channel serves.
    pub groups: Json,
    /// JSON map canonical model -> provider-native model.
    pub model_mapping: Option<Json>,
    pub priority: i64,
    pub weight: i32,
    pub status: i32,
    pub auto_ban: bool,
    /// JSON: { "retry": [..], "disable": [..] } HTTP status classification.
    pub status_code_mapping: Option<Json>,
    /// Free-form: proxy, region, region_weights, sdk_mode.
    pub setting: Option<Json>,
    pub test_at: Option<OffsetDateTime>,
    pub response_time_ms: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub abilities: HasMany<super::abilities::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
