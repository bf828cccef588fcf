use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkout_session_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub checkout_session_id: Uuid,
    #[sea_orm(primary_key, auto_increment = false)]
    pub product_id: String,
    pub seller_id: String,
    pub unit_price_minor_units: i64,
    /// Cart order, so a reloaded session lists items as submitted
    pub position: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::checkout_session::Entity",
        from = "Column::CheckoutSessionId",
        to = "super::checkout_session::Column::Id",
        on_delete = "Cascade"
    )]
    Session,
}

impl Related<super::checkout_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Session.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
