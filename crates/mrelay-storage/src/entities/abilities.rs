use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "abilities")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "ability_slot")]
    pub user_group: String,
    #[sea_orm(unique_key = "ability_slot")]
    pub model: String,
    #[sea_orm(unique_key = "ability_slot")]
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: i32,
    #[sea_orm(belongs_to, from = "channel_id", to = "id", on_delete = "Cascade")]
    pub channel: HasOne<super::channels::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
