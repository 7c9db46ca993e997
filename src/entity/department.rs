//! Department entity
//!
//! Table: departments

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::hierarchy::DepartmentRecord;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "departments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "String(Some(150))")]
    pub name: String,

    /// Path segment of this node, globally unique
    #[sea_orm(column_type = "String(Some(150))", unique)]
    pub identifier: String,

    /// None for a root department
    #[sea_orm(nullable)]
    pub parent_id: Option<Uuid>,

    /// Ancestor identifiers joined by '.'
    #[sea_orm(column_type = "Text")]
    pub path: String,

    /// Written from `path` on every write, kept for ordering only
    pub depth: i32,

    pub is_active: bool,

    /// Row version for optimistic checks
    pub version: i64,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Entity",
        from = "Column::ParentId",
        to = "Column::Id",
        on_delete = "Restrict"
    )]
    Parent,

    #[sea_orm(has_many = "super::department_location::Entity")]
    DepartmentLocations,

    #[sea_orm(has_many = "super::department_position::Entity")]
    DepartmentPositions,
}

impl Related<super::department_location::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DepartmentLocations.def()
    }
}

impl Related<super::department_position::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DepartmentPositions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Combine the row with its link rows
    pub fn into_record(self, location_ids: Vec<Uuid>, position_ids: Vec<Uuid>) -> DepartmentRecord {
        DepartmentRecord {
            id: self.id,
            name: self.name,
            identifier: self.identifier,
            parent_id: self.parent_id,
            path: self.path,
            depth: self.depth,
            is_active: self.is_active,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            location_ids,
            position_ids,
        }
    }
}
