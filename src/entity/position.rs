//! Position entity
//!
//! Table: positions

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "positions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "String(Some(150))")]
    pub name: String,

    pub is_active: bool,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::department_position::Entity")]
    DepartmentPositions,
}

impl Related<super::department_position::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DepartmentPositions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
