//! Storage contract of the hierarchy engine
//!
//! A repository handle is always scoped to one open unit of work (see
//! [`crate::transaction`]); row locks it takes are released when that unit
//! commits, rolls back or is dropped.

use async_trait::async_trait;

use crate::error::AppResult;
use crate::hierarchy::{Department, DepartmentId, DepartmentPath, LocationId, PositionId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryDepartmentStore;
pub use postgres::PgDepartmentStore;

/// Row lock taken by a read
///
/// `Shared` rows can be held by many units at once but keep out `Exclusive`
/// holders, so a parent read under it cannot be moved or deactivated until
/// the reading unit ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    Shared,
    Exclusive,
}

/// Existence and activity of a referenced location or position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference<Id> {
    pub id: Id,
    pub is_active: bool,
}

#[async_trait]
pub trait DepartmentRepository: Send {
    async fn get_by_id(&mut self, id: DepartmentId, lock: LockMode) -> AppResult<Option<Department>>;

    /// Every department whose path is `path` or lies below it, ordered by
    /// depth then path; with a lock mode rows are locked in that order
    async fn get_descendants_by_path_prefix(
        &mut self,
        path: &DepartmentPath,
        lock: LockMode,
    ) -> AppResult<Vec<Department>>;

    /// True if `id` is a transitive descendant of `parent_id`
    async fn exists_child_of_parent(
        &mut self,
        id: DepartmentId,
        parent_id: DepartmentId,
    ) -> AppResult<bool>;

    async fn identifier_exists(&mut self, identifier: &str) -> AppResult<bool>;

    async fn find_locations(&mut self, ids: &[LocationId]) -> AppResult<Vec<Reference<LocationId>>>;

    async fn find_positions(&mut self, ids: &[PositionId]) -> AppResult<Vec<Reference<PositionId>>>;

    /// Persist a new department together with its link rows
    async fn insert(&mut self, department: &Department) -> AppResult<DepartmentId>;

    /// Persist scalar fields; `department.version()` is the expected stored version
    async fn save(&mut self, department: &Department) -> AppResult<()>;

    async fn replace_location_links(&mut self, id: DepartmentId, ids: &[LocationId]) -> AppResult<()>;

    async fn replace_position_links(&mut self, id: DepartmentId, ids: &[PositionId]) -> AppResult<()>;

    /// Rebase path and depth of every affected row from `old_prefix` to `new_prefix`
    async fn bulk_rewrite_paths(
        &mut self,
        old_prefix: &DepartmentPath,
        new_prefix: &DepartmentPath,
        affected: &[DepartmentId],
    ) -> AppResult<u64>;

    /// Mark the subtree rooted at `root_id` (root included) inactive
    async fn deactivate_descendants(&mut self, root_id: DepartmentId) -> AppResult<u64>;
}
