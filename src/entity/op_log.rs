//! OpLog entity - hierarchy audit trail
//!
//! Table: op_log

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Operation type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    CreateDepartment,
    MoveDepartment,
    DeleteDepartment,
    RestoreDepartment,
    ReplaceLocations,
    ReplacePositions,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::CreateDepartment => "create_department",
            OpType::MoveDepartment => "move_department",
            OpType::DeleteDepartment => "delete_department",
            OpType::RestoreDepartment => "restore_department",
            OpType::ReplaceLocations => "replace_locations",
            OpType::ReplacePositions => "replace_positions",
        }
    }
}

/// Operation result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResult {
    Success,
    Failed,
}

impl OpResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpResult::Success => "success",
            OpResult::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "op_log")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Unix timestamp
    pub op_time: i64,

    #[sea_orm(column_type = "String(Some(32))")]
    pub op_type: String,

    /// Department the operation targeted
    #[sea_orm(nullable)]
    pub department_id: Option<Uuid>,

    #[sea_orm(column_type = "Text")]
    pub op_desc: String,

    /// Previous value, e.g. the old path of a moved department
    #[sea_orm(column_type = "Text", nullable)]
    pub old_value: Option<String>,

    #[sea_orm(column_type = "String(Some(16))")]
    pub result: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
