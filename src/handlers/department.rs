//! Department handlers
//!
//! Thin JSON layer over [`DepartmentService`](crate::hierarchy::DepartmentService);
//! every mutation is recorded in the operation log.

use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::log_operation;
use crate::entity::op_log::{OpResult, OpType};
use crate::error::AppResult;
use crate::hierarchy::{CreateDepartment, Department, DepartmentId, LocationId, PositionId};
use crate::routes::ApiResponse;
use crate::state::AppState;

/// Department response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartmentResponse {
    pub id: Uuid,
    pub name: String,
    pub identifier: String,
    pub parent_id: Option<Uuid>,
    pub path: String,
    pub depth: i32,
    pub is_active: bool,
    pub version: i64,
    pub location_ids: Vec<Uuid>,
    pub position_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Department> for DepartmentResponse {
    fn from(d: &Department) -> Self {
        Self {
            id: d.id().as_uuid(),
            name: d.name().to_string(),
            identifier: d.identifier().to_string(),
            parent_id: d.parent_id().map(|p| p.as_uuid()),
            path: d.path().to_string(),
            depth: d.depth(),
            is_active: d.is_active(),
            version: d.version(),
            location_ids: d.location_ids().iter().map(|l| l.as_uuid()).collect(),
            position_ids: d.position_ids().iter().map(|p| p.as_uuid()).collect(),
            created_at: d.created_at(),
            updated_at: d.updated_at(),
        }
    }
}

/// Move request; a missing or null parent makes the department a root
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    #[serde(default)]
    pub parent_id: Option<DepartmentId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResponse {
    pub department: DepartmentResponse,
    pub old_path: String,
    pub rewritten: u64,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deactivated: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceLocationsRequest {
    pub location_ids: Vec<LocationId>,
    pub version: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacePositionsRequest {
    pub position_ids: Vec<PositionId>,
    pub version: i64,
}

fn audit<T>(
    op_type: OpType,
    id: Option<Uuid>,
    op_desc: String,
    old_value: Option<String>,
    outcome: &AppResult<T>,
) {
    let result = if outcome.is_ok() {
        OpResult::Success
    } else {
        OpResult::Failed
    };
    log_operation(op_type, id, op_desc, old_value, result);
}

/// POST /api/departments
pub async fn create_department(
    State(state): State<AppState>,
    Json(req): Json<CreateDepartment>,
) -> AppResult<Json<ApiResponse<DepartmentResponse>>> {
    let ctx = state.operation_context();
    let identifier = req.identifier.clone();

    let outcome = state.service.create_department(&ctx, req).await;
    audit(
        OpType::CreateDepartment,
        outcome.as_ref().ok().map(|id| id.as_uuid()),
        format!("identifier: {}", identifier),
        None,
        &outcome,
    );

    let department = state.service.get_department(&ctx, outcome?).await?;
    Ok(Json(ApiResponse::success(DepartmentResponse::from(&department))))
}

/// GET /api/departments/:id
pub async fn get_department(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<DepartmentResponse>>> {
    let ctx = state.operation_context();
    let department = state.service.get_department(&ctx, DepartmentId(id)).await?;
    Ok(Json(ApiResponse::success(DepartmentResponse::from(&department))))
}

/// GET /api/departments/:id/subtree
pub async fn get_subtree(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Vec<DepartmentResponse>>>> {
    let ctx = state.operation_context();
    let rows = state.service.get_subtree(&ctx, DepartmentId(id)).await?;
    Ok(Json(ApiResponse::success(
        rows.iter().map(DepartmentResponse::from).collect(),
    )))
}

/// POST /api/departments/:id/move
pub async fn move_department(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<MoveRequest>,
) -> AppResult<Json<ApiResponse<MoveResponse>>> {
    let ctx = state.operation_context();

    let outcome = state
        .service
        .move_department(&ctx, DepartmentId(id), req.parent_id)
        .await;
    let target = match req.parent_id {
        Some(parent) => format!("parent: {}", parent),
        None => "parent: none".to_string(),
    };
    audit(
        OpType::MoveDepartment,
        Some(id),
        target,
        outcome.as_ref().ok().map(|r| r.old_path.to_string()),
        &outcome,
    );

    let report = outcome?;
    Ok(Json(ApiResponse::success(MoveResponse {
        department: DepartmentResponse::from(&report.department),
        old_path: report.old_path.to_string(),
        rewritten: report.rewritten,
    })))
}

/// POST /api/departments/:id/delete
pub async fn delete_department(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<DeleteResponse>>> {
    let ctx = state.operation_context();

    let outcome = state.service.delete_department(&ctx, DepartmentId(id)).await;
    audit(
        OpType::DeleteDepartment,
        Some(id),
        "soft delete with subtree".to_string(),
        None,
        &outcome,
    );

    Ok(Json(ApiResponse::success(DeleteResponse {
        deactivated: outcome?,
    })))
}

/// POST /api/departments/:id/restore
pub async fn restore_department(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<DepartmentResponse>>> {
    let ctx = state.operation_context();

    let outcome = state.service.restore_department(&ctx, DepartmentId(id)).await;
    audit(
        OpType::RestoreDepartment,
        Some(id),
        "restore".to_string(),
        None,
        &outcome,
    );

    Ok(Json(ApiResponse::success(DepartmentResponse::from(&outcome?))))
}

/// PUT /api/departments/:id/locations
pub async fn replace_locations(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReplaceLocationsRequest>,
) -> AppResult<Json<ApiResponse<DepartmentResponse>>> {
    let ctx = state.operation_context();
    let count = req.location_ids.len();

    let outcome = state
        .service
        .replace_locations(&ctx, DepartmentId(id), req.location_ids, req.version)
        .await;
    audit(
        OpType::ReplaceLocations,
        Some(id),
        format!("{} locations", count),
        Some(format!("version {}", req.version)),
        &outcome,
    );

    Ok(Json(ApiResponse::success(DepartmentResponse::from(&outcome?))))
}

/// PUT /api/departments/:id/positions
pub async fn replace_positions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReplacePositionsRequest>,
) -> AppResult<Json<ApiResponse<DepartmentResponse>>> {
    let ctx = state.operation_context();
    let count = req.position_ids.len();

    let outcome = state
        .service
        .replace_positions(&ctx, DepartmentId(id), req.position_ids, req.version)
        .await;
    audit(
        OpType::ReplacePositions,
        Some(id),
        format!("{} positions", count),
        Some(format!("version {}", req.version)),
        &outcome,
    );

    Ok(Json(ApiResponse::success(DepartmentResponse::from(&outcome?))))
}
