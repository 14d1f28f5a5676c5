use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    /// OAuth provider key: "anthropic" | "codex" | "google".
    #[sea_orm(primary_key, auto_increment = false)]
    pub provider: String,
    /// Dense slot index, assigned from 0 upward per provider.
    #[sea_orm(primary_key, auto_increment = false)]
    pub account: i64,
    pub secret: Json,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
