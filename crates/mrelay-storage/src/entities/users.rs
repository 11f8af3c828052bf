use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Routing tier; channels serve a set of groups.
    pub user_group: String,
    /// Remaining quota in ledger units.
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub status: i32,
    pub is_admin: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub tokens: HasMany<super::tokens::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
