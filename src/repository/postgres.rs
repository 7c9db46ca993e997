//! PostgreSQL department store (SeaORM)
//!
//! Row locks are `SELECT ... FOR UPDATE` inside the unit's transaction.
//! Subtree queries match `path = p OR path LIKE 'p.%'`, served by the
//! `text_pattern_ops` index created in [`crate::db`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::{Expr, LikeExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DatabaseTransaction, EntityTrait,
    Order, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait, Value,
};
use uuid::Uuid;

use super::{DepartmentRepository, LockMode, Reference};
use crate::entity::{department, department_location, department_position, location, position};
use crate::error::{AppError, AppResult, ConflictKind};
use crate::hierarchy::{Department, DepartmentId, DepartmentPath, LocationId, PositionId, DELIMITER};
use crate::transaction::{IsolationLevel, TransactionManager, UnitOfWork};

/// Transaction manager over a SeaORM connection pool
#[derive(Clone)]
pub struct PgDepartmentStore {
    db: DatabaseConnection,
}

impl PgDepartmentStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransactionManager for PgDepartmentStore {
    async fn begin(&self, isolation: IsolationLevel) -> AppResult<Box<dyn UnitOfWork>> {
        let txn = self.db.begin_with_config(Some(isolation.into()), None).await?;
        Ok(Box::new(PgUnitOfWork { txn }))
    }
}

/// One open transaction; dropping it uncommitted rolls back
pub struct PgUnitOfWork {
    txn: DatabaseTransaction,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.txn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.txn.rollback().await?;
        Ok(())
    }
}

/// Escape LIKE wildcards in a literal prefix
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn stored_path(model: &department::Model) -> AppResult<DepartmentPath> {
    DepartmentPath::parse(&model.path).map_err(|e| {
        AppError::failure(format!("department {} has a corrupt path: {}", model.id, e))
    })
}

fn path_column() -> Expr {
    Expr::col((department::Entity, department::Column::Path))
}

/// Rows strictly below `path`
fn below(path: &DepartmentPath) -> LikeExpr {
    LikeExpr::new(format!("{}{}%", escape_like(path.as_str()), DELIMITER)).escape('\\')
}

/// Rows at or below `path`
fn subtree(path: &DepartmentPath) -> Condition {
    Condition::any()
        .add(department::Column::Path.eq(path.as_str()))
        .add(path_column().like(below(path)))
}

fn with_lock<Q: QuerySelect>(query: Q, lock: LockMode) -> Q {
    match lock {
        LockMode::None => query,
        LockMode::Shared => query.lock_shared(),
        LockMode::Exclusive => query.lock_exclusive(),
    }
}

impl PgUnitOfWork {
    /// Attach link rows and rebuild aggregates, keeping the input order
    async fn hydrate(&self, models: Vec<department::Model>) -> AppResult<Vec<Department>> {
        if models.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = models.iter().map(|m| m.id).collect();

        let mut locations: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for link in department_location::Entity::find()
            .filter(department_location::Column::DepartmentId.is_in(ids.clone()))
            .all(&self.txn)
            .await?
        {
            locations.entry(link.department_id).or_default().push(link.location_id);
        }

        let mut positions: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for link in department_position::Entity::find()
            .filter(department_position::Column::DepartmentId.is_in(ids))
            .all(&self.txn)
            .await?
        {
            positions.entry(link.department_id).or_default().push(link.position_id);
        }

        models
            .into_iter()
            .map(|m| {
                let l = locations.remove(&m.id).unwrap_or_default();
                let p = positions.remove(&m.id).unwrap_or_default();
                Department::from_record(m.into_record(l, p))
            })
            .collect()
    }

    async fn write_location_links(&self, id: Uuid, ids: &[Uuid]) -> AppResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let rows: Vec<department_location::ActiveModel> = ids
            .iter()
            .map(|location_id| department_location::ActiveModel {
                department_id: Set(id),
                location_id: Set(*location_id),
            })
            .collect();
        department_location::Entity::insert_many(rows)
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }

    async fn write_position_links(&self, id: Uuid, ids: &[Uuid]) -> AppResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let rows: Vec<department_position::ActiveModel> = ids
            .iter()
            .map(|position_id| department_position::ActiveModel {
                department_id: Set(id),
                position_id: Set(*position_id),
            })
            .collect();
        department_position::Entity::insert_many(rows)
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DepartmentRepository for PgUnitOfWork {
    async fn get_by_id(&mut self, id: DepartmentId, lock: LockMode) -> AppResult<Option<Department>> {
        let query = with_lock(department::Entity::find_by_id(id.as_uuid()), lock);

        match query.one(&self.txn).await? {
            Some(model) => Ok(self.hydrate(vec![model]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn get_descendants_by_path_prefix(
        &mut self,
        path: &DepartmentPath,
        lock: LockMode,
    ) -> AppResult<Vec<Department>> {
        // byte-wise collation so the database locks in the same order the service sorts
        let query = department::Entity::find()
            .filter(subtree(path))
            .order_by_asc(department::Column::Depth)
            .order_by(Expr::cust("path COLLATE \"C\""), Order::Asc);
        let query = with_lock(query, lock);

        let models = query.all(&self.txn).await?;
        self.hydrate(models).await
    }

    async fn exists_child_of_parent(
        &mut self,
        id: DepartmentId,
        parent_id: DepartmentId,
    ) -> AppResult<bool> {
        let Some(parent) = department::Entity::find_by_id(parent_id.as_uuid())
            .one(&self.txn)
            .await?
        else {
            return Ok(false);
        };
        let parent_path = stored_path(&parent)?;

        let count = department::Entity::find()
            .filter(department::Column::Id.eq(id.as_uuid()))
            .filter(path_column().like(below(&parent_path)))
            .count(&self.txn)
            .await?;
        Ok(count > 0)
    }

    async fn identifier_exists(&mut self, identifier: &str) -> AppResult<bool> {
        let count = department::Entity::find()
            .filter(department::Column::Identifier.eq(identifier))
            .count(&self.txn)
            .await?;
        Ok(count > 0)
    }

    async fn find_locations(&mut self, ids: &[LocationId]) -> AppResult<Vec<Reference<LocationId>>> {
        let uuids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let rows = location::Entity::find()
            .filter(location::Column::Id.is_in(uuids))
            .all(&self.txn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Reference {
                id: LocationId(row.id),
                is_active: row.is_active,
            })
            .collect())
    }

    async fn find_positions(&mut self, ids: &[PositionId]) -> AppResult<Vec<Reference<PositionId>>> {
        let uuids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let rows = position::Entity::find()
            .filter(position::Column::Id.is_in(uuids))
            .all(&self.txn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Reference {
                id: PositionId(row.id),
                is_active: row.is_active,
            })
            .collect())
    }

    async fn insert(&mut self, dept: &Department) -> AppResult<DepartmentId> {
        let model = department::ActiveModel {
            id: Set(dept.id().as_uuid()),
            name: Set(dept.name().to_string()),
            identifier: Set(dept.identifier().to_string()),
            parent_id: Set(dept.parent_id().map(|p| p.as_uuid())),
            path: Set(dept.path().as_str().to_string()),
            depth: Set(dept.depth()),
            is_active: Set(dept.is_active()),
            version: Set(dept.version()),
            created_at: Set(dept.created_at()),
            updated_at: Set(dept.updated_at()),
        };
        let inserted = model.insert(&self.txn).await?;

        let locations: Vec<Uuid> = dept.location_ids().iter().map(|l| l.as_uuid()).collect();
        self.write_location_links(inserted.id, &locations).await?;
        let positions: Vec<Uuid> = dept.position_ids().iter().map(|p| p.as_uuid()).collect();
        self.write_position_links(inserted.id, &positions).await?;

        Ok(DepartmentId(inserted.id))
    }

    async fn save(&mut self, dept: &Department) -> AppResult<()> {
        let result = department::Entity::update_many()
            .col_expr(department::Column::Name, Expr::value(dept.name()))
            .col_expr(
                department::Column::ParentId,
                Expr::value(dept.parent_id().map(|p| p.as_uuid())),
            )
            .col_expr(department::Column::Path, Expr::value(dept.path().as_str()))
            .col_expr(department::Column::Depth, Expr::value(dept.depth()))
            .col_expr(department::Column::IsActive, Expr::value(dept.is_active()))
            .col_expr(department::Column::UpdatedAt, Expr::value(dept.updated_at()))
            .col_expr(
                department::Column::Version,
                Expr::col(department::Column::Version).add(1),
            )
            .filter(department::Column::Id.eq(dept.id().as_uuid()))
            .filter(department::Column::Version.eq(dept.version()))
            .exec(&self.txn)
            .await?;

        if result.rows_affected == 0 {
            return Err(AppError::conflict(
                ConflictKind::VersionMismatch,
                format!(
                    "department {} was modified concurrently (expected version {})",
                    dept.id(),
                    dept.version()
                ),
            ));
        }
        Ok(())
    }

    async fn replace_location_links(&mut self, id: DepartmentId, ids: &[LocationId]) -> AppResult<()> {
        department_location::Entity::delete_many()
            .filter(department_location::Column::DepartmentId.eq(id.as_uuid()))
            .exec(&self.txn)
            .await?;
        let uuids: Vec<Uuid> = ids.iter().map(|l| l.as_uuid()).collect();
        self.write_location_links(id.as_uuid(), &uuids).await
    }

    async fn replace_position_links(&mut self, id: DepartmentId, ids: &[PositionId]) -> AppResult<()> {
        department_position::Entity::delete_many()
            .filter(department_position::Column::DepartmentId.eq(id.as_uuid()))
            .exec(&self.txn)
            .await?;
        let uuids: Vec<Uuid> = ids.iter().map(|p| p.as_uuid()).collect();
        self.write_position_links(id.as_uuid(), &uuids).await
    }

    async fn bulk_rewrite_paths(
        &mut self,
        old_prefix: &DepartmentPath,
        new_prefix: &DepartmentPath,
        affected: &[DepartmentId],
    ) -> AppResult<u64> {
        if affected.is_empty() {
            return Ok(0);
        }

        // substr() is 1-based and counts characters
        let tail_start = old_prefix.as_str().chars().count() as i32 + 1;
        let new_path = Expr::cust_with_values(
            "? || substr(path, ?)",
            [
                Value::from(new_prefix.as_str().to_string()),
                Value::from(tail_start),
            ],
        );
        let new_depth = Expr::cust_with_values(
            "array_length(string_to_array(? || substr(path, ?), ?), 1) - 1",
            [
                Value::from(new_prefix.as_str().to_string()),
                Value::from(tail_start),
                Value::from(DELIMITER.to_string()),
            ],
        );

        let ids: Vec<Uuid> = affected.iter().map(|id| id.as_uuid()).collect();
        let result = department::Entity::update_many()
            .col_expr(department::Column::Path, new_path)
            .col_expr(department::Column::Depth, new_depth)
            .col_expr(department::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(
                department::Column::Version,
                Expr::col(department::Column::Version).add(1),
            )
            .filter(department::Column::Id.is_in(ids))
            .filter(subtree(old_prefix))
            .exec(&self.txn)
            .await?;

        if result.rows_affected != affected.len() as u64 {
            return Err(AppError::failure(format!(
                "path rewrite matched {} of {} rows under '{}'",
                result.rows_affected,
                affected.len(),
                old_prefix
            )));
        }

        tracing::debug!(
            "Rewrote {} paths from '{}' to '{}'",
            result.rows_affected,
            old_prefix,
            new_prefix
        );
        Ok(result.rows_affected)
    }

    async fn deactivate_descendants(&mut self, root_id: DepartmentId) -> AppResult<u64> {
        let root = department::Entity::find_by_id(root_id.as_uuid())
            .one(&self.txn)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("department {}", root_id)))?;
        let root_path = stored_path(&root)?;

        let result = department::Entity::update_many()
            .col_expr(department::Column::IsActive, Expr::value(false))
            .col_expr(department::Column::UpdatedAt, Expr::value(Utc::now()))
            .col_expr(
                department::Column::Version,
                Expr::col(department::Column::Version).add(1),
            )
            .filter(subtree(&root_path))
            .filter(department::Column::IsActive.eq(true))
            .exec(&self.txn)
            .await?;

        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DbBackend, QueryTrait};

    #[test]
    fn like_prefix_is_escaped() {
        assert_eq!(escape_like("head"), "head");
        assert_eq!(escape_like("a_b%c\\"), "a\\_b\\%c\\\\");
    }

    #[test]
    fn locked_subtree_query_uses_for_update() {
        let path = DepartmentPath::parse("head.finance").unwrap();
        let sql = department::Entity::find()
            .filter(subtree(&path))
            .lock_exclusive()
            .build(DbBackend::Postgres)
            .to_string();
        assert!(sql.contains("FOR UPDATE"));
        assert!(sql.contains("'head.finance'"));
        assert!(sql.contains("LIKE 'head.finance.%'"));
        assert!(sql.contains("ESCAPE"));
    }

    #[test]
    fn shared_lock_reads_for_share() {
        let id = DepartmentId::generate();
        let sql = with_lock(department::Entity::find_by_id(id.as_uuid()), LockMode::Shared)
            .build(DbBackend::Postgres)
            .to_string();
        assert!(sql.contains("FOR SHARE"));
        assert!(!sql.contains("FOR UPDATE"));

        let plain = with_lock(department::Entity::find_by_id(id.as_uuid()), LockMode::None)
            .build(DbBackend::Postgres)
            .to_string();
        assert!(!plain.contains("FOR "));
    }
}
