//! Hierarchy operations
//!
//! Every public operation opens one unit of work, runs its `*_within` form
//! under the caller's [`OperationContext`] and commits only on success. The
//! `*_within` forms take an already open repository so that several steps can
//! share one transaction.
//!
//! Rows that are locked together are always locked in ascending
//! `(depth, path)` order.

use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use serde::Deserialize;

use super::department::{Department, DepartmentDraft};
use super::ids::{DepartmentId, LocationId, PositionId};
use super::path::{lock_order_key, DepartmentPath};
use crate::error::{AppError, AppResult, ConflictKind, OptionExt};
use crate::repository::{DepartmentRepository, LockMode, Reference};
use crate::transaction::{complete, IsolationLevel, OperationContext, TransactionManager};

/// Tuning of the hierarchy operations
#[derive(Debug, Clone, Copy)]
pub struct HierarchySettings {
    pub isolation: IsolationLevel,
    /// How often a move or delete re-plans its locks before giving up
    pub lock_retry_limit: u32,
}

impl Default for HierarchySettings {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            lock_retry_limit: 3,
        }
    }
}

/// Create request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDepartment {
    pub name: String,
    pub identifier: String,
    #[serde(default)]
    pub parent_id: Option<DepartmentId>,
    #[serde(default)]
    pub location_ids: Vec<LocationId>,
}

/// Result of a move
#[derive(Debug, Clone)]
pub struct MoveReport {
    pub department: Department,
    pub old_path: DepartmentPath,
    /// Descendant rows whose path was rewritten
    pub rewritten: u64,
}

impl MoveReport {
    pub fn is_noop(&self) -> bool {
        self.department.path() == &self.old_path
    }
}

/// Target, new parent and subtree as seen under lock
struct MovePlan {
    target: Department,
    parent: Option<Department>,
    subtree: Vec<Department>,
}

#[derive(Clone)]
pub struct DepartmentService {
    tx: Arc<dyn TransactionManager>,
    settings: HierarchySettings,
}

impl DepartmentService {
    pub fn new(tx: Arc<dyn TransactionManager>, settings: HierarchySettings) -> Self {
        Self { tx, settings }
    }

    pub fn settings(&self) -> &HierarchySettings {
        &self.settings
    }

    pub async fn create_department(
        &self,
        ctx: &OperationContext,
        input: CreateDepartment,
    ) -> AppResult<DepartmentId> {
        let draft = DepartmentDraft::parse(&input.name, &input.identifier, &input.location_ids)?;

        let mut uow = self.tx.begin(self.settings.isolation).await?;
        let outcome = ctx
            .guard(Self::create_within(uow.as_mut(), draft, input.parent_id))
            .await;
        let id = complete(uow, outcome).await?;

        tracing::info!("Created department {} ('{}')", id, input.identifier);
        Ok(id)
    }

    pub async fn create_within<R>(
        repo: &mut R,
        draft: DepartmentDraft,
        parent_id: Option<DepartmentId>,
    ) -> AppResult<DepartmentId>
    where
        R: DepartmentRepository + ?Sized,
    {
        let location_ids: Vec<LocationId> = draft.location_ids().iter().copied().collect();
        let found = repo.find_locations(&location_ids).await?;
        check_references("location", &location_ids, &found, ConflictKind::InactiveLocation)?;

        // shared lock: the parent cannot move or be deactivated before we commit
        let parent = match parent_id {
            Some(parent_id) => {
                let parent = repo
                    .get_by_id(parent_id, LockMode::Shared)
                    .await?
                    .ok_or_not_found(format!("parent department {}", parent_id))?;
                if !parent.is_active() {
                    return Err(AppError::conflict(
                        ConflictKind::InactiveParent,
                        format!("parent department {} is inactive", parent_id),
                    ));
                }
                Some(parent)
            }
            None => None,
        };

        if repo.identifier_exists(draft.identifier()).await? {
            return Err(AppError::conflict(
                ConflictKind::DuplicateIdentifier,
                format!("identifier '{}' is already in use", draft.identifier()),
            ));
        }

        let department = draft.into_department(parent.as_ref())?;
        repo.insert(&department).await
    }

    pub async fn move_department(
        &self,
        ctx: &OperationContext,
        id: DepartmentId,
        new_parent_id: Option<DepartmentId>,
    ) -> AppResult<MoveReport> {
        if new_parent_id == Some(id) {
            return Err(AppError::conflict(
                ConflictKind::ParentId,
                format!("department {} cannot be its own parent", id),
            ));
        }

        let mut uow = self.tx.begin(self.settings.isolation).await?;
        let outcome = ctx
            .guard(Self::move_within(
                uow.as_mut(),
                id,
                new_parent_id,
                self.settings.lock_retry_limit,
            ))
            .await;
        let report = complete(uow, outcome).await?;

        if report.is_noop() {
            tracing::debug!("Move of {} left it at '{}'", id, report.old_path);
        } else {
            tracing::info!(
                "Moved department {} from '{}' to '{}' ({} descendants)",
                id,
                report.old_path,
                report.department.path(),
                report.rewritten
            );
        }
        Ok(report)
    }

    pub async fn move_within<R>(
        repo: &mut R,
        id: DepartmentId,
        new_parent_id: Option<DepartmentId>,
        retry_limit: u32,
    ) -> AppResult<MoveReport>
    where
        R: DepartmentRepository + ?Sized,
    {
        if new_parent_id == Some(id) {
            return Err(AppError::conflict(
                ConflictKind::ParentId,
                format!("department {} cannot be its own parent", id),
            ));
        }

        let MovePlan {
            mut target,
            parent,
            subtree,
        } = Self::lock_move_plan(repo, id, new_parent_id, retry_limit).await?;

        if let Some(parent) = &parent {
            if !parent.is_active() {
                return Err(AppError::conflict(
                    ConflictKind::InactiveParent,
                    format!("parent department {} is inactive", parent.id()),
                ));
            }
            if repo.exists_child_of_parent(parent.id(), id).await? {
                return Err(cycle_conflict(id, parent.id()));
            }
        }

        let old_path = target.path().clone();
        let new_path =
            DepartmentPath::compose(parent.as_ref().map(|p| p.path()), target.identifier())?;
        if new_path == old_path {
            return Ok(MoveReport {
                department: target,
                old_path,
                rewritten: 0,
            });
        }

        target.assign_new_parent(parent.as_ref())?;
        repo.save(&target).await?;
        target.bump_version();

        let descendants: Vec<DepartmentId> = subtree
            .iter()
            .map(|d| d.id())
            .filter(|d| *d != id)
            .collect();
        let rewritten = repo
            .bulk_rewrite_paths(&old_path, target.path(), &descendants)
            .await?;

        Ok(MoveReport {
            department: target,
            old_path,
            rewritten,
        })
    }

    /// Read unlocked, lock everything in global order, then confirm nothing
    /// moved in between; re-plan when it did
    async fn lock_move_plan<R>(
        repo: &mut R,
        id: DepartmentId,
        new_parent_id: Option<DepartmentId>,
        retry_limit: u32,
    ) -> AppResult<MovePlan>
    where
        R: DepartmentRepository + ?Sized,
    {
        let mut attempts = 0;
        loop {
            let planned = Self::read_move_plan(repo, id, new_parent_id).await?;

            let mut order: Vec<&Department> =
                planned.subtree.iter().chain(planned.parent.iter()).collect();
            order.sort_by(|a, b| lock_order_key(a.path()).cmp(&lock_order_key(b.path())));
            for row in &order {
                repo.get_by_id(row.id(), LockMode::Exclusive).await?;
            }
            tracing::debug!("Locked {} rows to move department {}", order.len(), id);

            let locked = Self::read_move_plan(repo, id, new_parent_id).await?;
            let parent_path = |plan: &MovePlan| plan.parent.as_ref().map(|p| p.path().clone());
            if locked.target.path() == planned.target.path()
                && parent_path(&locked) == parent_path(&planned)
                && same_rows(&locked.subtree, &planned.subtree)
            {
                return Ok(locked);
            }

            attempts += 1;
            if attempts > retry_limit {
                return Err(AppError::conflict(
                    ConflictKind::ConcurrentModification,
                    format!(
                        "subtree of department {} kept changing while being locked",
                        id
                    ),
                ));
            }
            tracing::debug!(
                "Subtree of {} changed while locking, re-planning (attempt {})",
                id,
                attempts
            );
        }
    }

    async fn read_move_plan<R>(
        repo: &mut R,
        id: DepartmentId,
        new_parent_id: Option<DepartmentId>,
    ) -> AppResult<MovePlan>
    where
        R: DepartmentRepository + ?Sized,
    {
        let target = repo
            .get_by_id(id, LockMode::None)
            .await?
            .ok_or_not_found(format!("department {}", id))?;

        let parent = match new_parent_id {
            Some(parent_id) => Some(
                repo.get_by_id(parent_id, LockMode::None)
                    .await?
                    .ok_or_not_found(format!("parent department {}", parent_id))?,
            ),
            None => None,
        };

        if let Some(parent) = &parent {
            if parent.path().is_within(target.path()) {
                return Err(cycle_conflict(id, parent.id()));
            }
        }

        let subtree = repo
            .get_descendants_by_path_prefix(target.path(), LockMode::None)
            .await?;

        Ok(MovePlan {
            target,
            parent,
            subtree,
        })
    }

    /// Deactivate a department and its whole subtree
    ///
    /// Returns the number of rows that changed; 0 when already inactive.
    pub async fn delete_department(&self, ctx: &OperationContext, id: DepartmentId) -> AppResult<u64> {
        let mut uow = self.tx.begin(self.settings.isolation).await?;
        let outcome = ctx
            .guard(Self::delete_within(
                uow.as_mut(),
                id,
                self.settings.lock_retry_limit,
            ))
            .await;
        let deactivated = complete(uow, outcome).await?;

        if deactivated > 0 {
            tracing::info!("Deactivated department {} ({} rows)", id, deactivated);
        }
        Ok(deactivated)
    }

    pub async fn delete_within<R>(repo: &mut R, id: DepartmentId, retry_limit: u32) -> AppResult<u64>
    where
        R: DepartmentRepository + ?Sized,
    {
        let mut attempts = 0;
        loop {
            let planned = repo
                .get_by_id(id, LockMode::None)
                .await?
                .ok_or_not_found(format!("department {}", id))?;
            if !planned.is_active() {
                tracing::debug!("Department {} is already inactive", id);
                return Ok(0);
            }

            let locked = repo
                .get_descendants_by_path_prefix(planned.path(), LockMode::Exclusive)
                .await?;
            let target = repo
                .get_by_id(id, LockMode::Exclusive)
                .await?
                .ok_or_not_found(format!("department {}", id))?;

            if target.path() == planned.path() {
                tracing::debug!("Locked {} rows to delete department {}", locked.len(), id);
                if !target.is_active() {
                    return Ok(0);
                }
                return repo.deactivate_descendants(id).await;
            }

            attempts += 1;
            if attempts > retry_limit {
                return Err(AppError::conflict(
                    ConflictKind::ConcurrentModification,
                    format!("department {} kept moving while being locked", id),
                ));
            }
        }
    }

    /// Reactivate a single department whose parent is active
    pub async fn restore_department(
        &self,
        ctx: &OperationContext,
        id: DepartmentId,
    ) -> AppResult<Department> {
        let mut uow = self.tx.begin(self.settings.isolation).await?;
        let outcome = ctx.guard(Self::restore_within(uow.as_mut(), id)).await;
        let department = complete(uow, outcome).await?;

        tracing::info!("Restored department {}", id);
        Ok(department)
    }

    pub async fn restore_within<R>(repo: &mut R, id: DepartmentId) -> AppResult<Department>
    where
        R: DepartmentRepository + ?Sized,
    {
        let planned = repo
            .get_by_id(id, LockMode::None)
            .await?
            .ok_or_not_found(format!("department {}", id))?;

        // parent before child, matching the global lock order
        let parent = match planned.parent_id() {
            Some(parent_id) => Some(
                repo.get_by_id(parent_id, LockMode::Shared)
                    .await?
                    .ok_or_else(|| {
                        AppError::failure(format!(
                            "parent {} of department {} is missing",
                            parent_id, id
                        ))
                    })?,
            ),
            None => None,
        };

        let mut department = repo
            .get_by_id(id, LockMode::Exclusive)
            .await?
            .ok_or_not_found(format!("department {}", id))?;
        if department.parent_id() != planned.parent_id() {
            return Err(AppError::conflict(
                ConflictKind::ConcurrentModification,
                format!("department {} moved while being restored", id),
            ));
        }
        if department.is_active() {
            return Ok(department);
        }
        if let Some(parent) = parent.filter(|p| !p.is_active()) {
            return Err(AppError::conflict(
                ConflictKind::InactiveParent,
                format!("parent department {} is inactive", parent.id()),
            ));
        }

        department.reactivate();
        repo.save(&department).await?;
        department.bump_version();
        Ok(department)
    }

    pub async fn replace_locations(
        &self,
        ctx: &OperationContext,
        id: DepartmentId,
        location_ids: Vec<LocationId>,
        expected_version: i64,
    ) -> AppResult<Department> {
        let mut uow = self.tx.begin(self.settings.isolation).await?;
        let outcome = ctx
            .guard(Self::replace_locations_within(
                uow.as_mut(),
                id,
                &location_ids,
                expected_version,
            ))
            .await;
        let department = complete(uow, outcome).await?;

        tracing::info!(
            "Replaced locations of department {} ({} linked)",
            id,
            department.location_ids().len()
        );
        Ok(department)
    }

    pub async fn replace_locations_within<R>(
        repo: &mut R,
        id: DepartmentId,
        location_ids: &[LocationId],
        expected_version: i64,
    ) -> AppResult<Department>
    where
        R: DepartmentRepository + ?Sized,
    {
        let mut department = Self::lock_versioned(repo, id, expected_version).await?;
        department.replace_locations(location_ids)?;

        let found = repo.find_locations(location_ids).await?;
        check_references("location", location_ids, &found, ConflictKind::InactiveLocation)?;

        repo.save(&department).await?;
        let linked: Vec<LocationId> = department.location_ids().iter().copied().collect();
        repo.replace_location_links(id, &linked).await?;
        department.bump_version();
        Ok(department)
    }

    pub async fn replace_positions(
        &self,
        ctx: &OperationContext,
        id: DepartmentId,
        position_ids: Vec<PositionId>,
        expected_version: i64,
    ) -> AppResult<Department> {
        let mut uow = self.tx.begin(self.settings.isolation).await?;
        let outcome = ctx
            .guard(Self::replace_positions_within(
                uow.as_mut(),
                id,
                &position_ids,
                expected_version,
            ))
            .await;
        let department = complete(uow, outcome).await?;

        tracing::info!(
            "Replaced positions of department {} ({} linked)",
            id,
            department.position_ids().len()
        );
        Ok(department)
    }

    pub async fn replace_positions_within<R>(
        repo: &mut R,
        id: DepartmentId,
        position_ids: &[PositionId],
        expected_version: i64,
    ) -> AppResult<Department>
    where
        R: DepartmentRepository + ?Sized,
    {
        let mut department = Self::lock_versioned(repo, id, expected_version).await?;
        department.replace_positions(position_ids)?;

        let found = repo.find_positions(position_ids).await?;
        check_references("position", position_ids, &found, ConflictKind::InactivePosition)?;

        repo.save(&department).await?;
        let linked: Vec<PositionId> = department.position_ids().iter().copied().collect();
        repo.replace_position_links(id, &linked).await?;
        department.bump_version();
        Ok(department)
    }

    async fn lock_versioned<R>(
        repo: &mut R,
        id: DepartmentId,
        expected_version: i64,
    ) -> AppResult<Department>
    where
        R: DepartmentRepository + ?Sized,
    {
        let department = repo
            .get_by_id(id, LockMode::Exclusive)
            .await?
            .ok_or_not_found(format!("department {}", id))?;
        if department.version() != expected_version {
            return Err(AppError::conflict(
                ConflictKind::VersionMismatch,
                format!(
                    "department {} is at version {}, expected {}",
                    id,
                    department.version(),
                    expected_version
                ),
            ));
        }
        Ok(department)
    }

    pub async fn get_department(&self, ctx: &OperationContext, id: DepartmentId) -> AppResult<Department> {
        let mut uow = self.tx.begin(self.settings.isolation).await?;
        let outcome = ctx
            .guard(async {
                uow.get_by_id(id, LockMode::None)
                    .await?
                    .ok_or_not_found(format!("department {}", id))
            })
            .await;
        complete(uow, outcome).await
    }

    /// The department followed by all of its descendants, shallowest first
    pub async fn get_subtree(&self, ctx: &OperationContext, id: DepartmentId) -> AppResult<Vec<Department>> {
        let mut uow = self.tx.begin(self.settings.isolation).await?;
        let outcome = ctx
            .guard(async {
                let root = uow
                    .get_by_id(id, LockMode::None)
                    .await?
                    .ok_or_not_found(format!("department {}", id))?;
                uow.get_descendants_by_path_prefix(root.path(), LockMode::None)
                    .await
            })
            .await;
        complete(uow, outcome).await
    }
}

fn cycle_conflict(id: DepartmentId, parent_id: DepartmentId) -> AppError {
    AppError::conflict(
        ConflictKind::ParentIdAsChild,
        format!(
            "department {} cannot move under its descendant {}",
            id, parent_id
        ),
    )
}

/// Same rows at the same paths, in the same order
fn same_rows(a: &[Department], b: &[Department]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x.id() == y.id() && x.path() == y.path())
}

/// Missing references are NotFound, inactive ones a conflict of `inactive`
fn check_references<Id>(
    label: &str,
    requested: &[Id],
    found: &[Reference<Id>],
    inactive: ConflictKind,
) -> AppResult<()>
where
    Id: Copy + Eq + Hash + Display,
{
    let known: HashSet<Id> = found.iter().map(|r| r.id).collect();
    let missing: Vec<String> = requested
        .iter()
        .filter(|id| !known.contains(id))
        .map(|id| id.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(AppError::NotFound(format!(
            "{}s not found: {}",
            label,
            missing.join(", ")
        )));
    }

    let disabled: Vec<String> = found
        .iter()
        .filter(|r| !r.is_active)
        .map(|r| r.id.to_string())
        .collect();
    if !disabled.is_empty() {
        return Err(AppError::conflict(
            inactive,
            format!("inactive {}s: {}", label, disabled.join(", ")),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::repository::MemoryDepartmentStore;

    struct Fixture {
        store: MemoryDepartmentStore,
        service: DepartmentService,
        location: LocationId,
        ctx: OperationContext,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = MemoryDepartmentStore::new();
            let location = LocationId::generate();
            store.add_location(location, true).await;
            let service = DepartmentService::new(Arc::new(store.clone()), HierarchySettings::default());
            Self {
                store,
                service,
                location,
                ctx: OperationContext::new(),
            }
        }

        async fn create(&self, identifier: &str, parent: Option<DepartmentId>) -> DepartmentId {
            let input = CreateDepartment {
                name: format!("Department {}", identifier),
                identifier: identifier.to_string(),
                parent_id: parent,
                location_ids: vec![self.location],
            };
            self.service.create_department(&self.ctx, input).await.unwrap()
        }

        async fn path(&self, id: DepartmentId) -> String {
            self.store.department(id).await.unwrap().path().to_string()
        }

        async fn get(&self, id: DepartmentId) -> Department {
            self.store.department(id).await.unwrap()
        }

        /// alpha > beta > gamma
        async fn chain(&self) -> (DepartmentId, DepartmentId, DepartmentId) {
            let alpha = self.create("alpha", None).await;
            let beta = self.create("beta", Some(alpha)).await;
            let gamma = self.create("gamma", Some(beta)).await;
            (alpha, beta, gamma)
        }

        /// Every path is its parent's path plus its own identifier, and depth
        /// equals the number of ancestors
        async fn assert_consistent(&self) {
            let rows = self.store.departments().await;
            let by_id: HashMap<DepartmentId, &Department> = rows.iter().map(|d| (d.id(), d)).collect();
            for dept in &rows {
                let mut ancestors = 0;
                let mut cursor = dept.parent_id();
                while let Some(id) = cursor {
                    ancestors += 1;
                    cursor = by_id[&id].parent_id();
                }
                assert_eq!(dept.depth(), ancestors, "depth of {}", dept.path());

                let parent_path = dept.parent_id().map(|id| by_id[&id].path());
                let expected = DepartmentPath::compose(parent_path, dept.identifier()).unwrap();
                assert_eq!(dept.path(), &expected);
            }
        }
    }

    fn conflict_of<T: std::fmt::Debug>(result: Result<T, AppError>) -> ConflictKind {
        assert_err!(result).conflict_kind().unwrap()
    }

    #[tokio::test]
    async fn move_child_to_root_rebases_grandchild() {
        let fx = Fixture::new().await;
        let (alpha, beta, gamma) = fx.chain().await;
        assert_eq!(fx.path(gamma).await, "alpha.beta.gamma");
        assert_eq!(fx.get(gamma).await.depth(), 2);

        let report = assert_ok!(fx.service.move_department(&fx.ctx, beta, None).await);
        assert_eq!(report.old_path.as_str(), "alpha.beta");
        assert_eq!(report.rewritten, 1);

        let beta_row = fx.get(beta).await;
        assert_eq!(beta_row.path().as_str(), "beta");
        assert_eq!(beta_row.depth(), 0);
        assert!(beta_row.is_root());
        let gamma_row = fx.get(gamma).await;
        assert_eq!(gamma_row.path().as_str(), "beta.gamma");
        assert_eq!(gamma_row.depth(), 1);
        assert_eq!(fx.path(alpha).await, "alpha");
        assert_eq!(fx.get(alpha).await.version(), 1);

        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn move_under_own_grandchild_is_rejected() {
        let fx = Fixture::new().await;
        let (alpha, beta, gamma) = fx.chain().await;
        let before = fx.store.departments().await;

        let kind = conflict_of(fx.service.move_department(&fx.ctx, alpha, Some(gamma)).await);
        assert_eq!(kind, ConflictKind::ParentIdAsChild);

        assert_eq!(fx.store.departments().await, before);
        assert_eq!(fx.path(alpha).await, "alpha");
        assert_eq!(fx.path(beta).await, "alpha.beta");
        assert_eq!(fx.path(gamma).await, "alpha.beta.gamma");
    }

    #[tokio::test]
    async fn move_under_itself_is_rejected() {
        let fx = Fixture::new().await;
        let (alpha, _, _) = fx.chain().await;
        let kind = conflict_of(fx.service.move_department(&fx.ctx, alpha, Some(alpha)).await);
        assert_eq!(kind, ConflictKind::ParentId);
        assert_eq!(fx.path(alpha).await, "alpha");
    }

    #[tokio::test]
    async fn move_shifts_depth_of_every_descendant_by_same_delta() {
        let fx = Fixture::new().await;
        let (alpha, beta, gamma) = fx.chain().await;
        let delta = fx.create("delta", Some(gamma)).await;
        let omega = fx.create("omega", None).await;
        let sigma = fx.create("sigma", Some(omega)).await;
        let before: HashMap<DepartmentId, i32> = fx
            .store
            .departments()
            .await
            .iter()
            .map(|d| (d.id(), d.depth()))
            .collect();

        // beta goes from depth 1 to depth 2
        fx.service
            .move_department(&fx.ctx, beta, Some(sigma))
            .await
            .unwrap();

        for id in [beta, gamma, delta] {
            assert_eq!(fx.get(id).await.depth(), before[&id] + 1);
        }
        assert_eq!(fx.path(delta).await, "omega.sigma.beta.gamma.delta");
        assert_eq!(fx.path(alpha).await, "alpha");
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn move_to_current_parent_is_a_noop() {
        let fx = Fixture::new().await;
        let (alpha, beta, _) = fx.chain().await;
        let report = fx
            .service
            .move_department(&fx.ctx, beta, Some(alpha))
            .await
            .unwrap();
        assert!(report.is_noop());
        assert_eq!(fx.get(beta).await.version(), 1);
    }

    #[tokio::test]
    async fn move_under_inactive_parent_is_rejected() {
        let fx = Fixture::new().await;
        let (_, beta, _) = fx.chain().await;
        let omega = fx.create("omega", None).await;
        fx.service.delete_department(&fx.ctx, omega).await.unwrap();

        let kind = conflict_of(fx.service.move_department(&fx.ctx, beta, Some(omega)).await);
        assert_eq!(kind, ConflictKind::InactiveParent);
        assert_eq!(fx.path(beta).await, "alpha.beta");
    }

    #[tokio::test]
    async fn move_with_unknown_ids_is_not_found() {
        let fx = Fixture::new().await;
        let (alpha, _, _) = fx.chain().await;
        let ghost = DepartmentId::generate();
        assert!(matches!(
            fx.service.move_department(&fx.ctx, ghost, None).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            fx.service.move_department(&fx.ctx, alpha, Some(ghost)).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_with_bad_locations_fails_validation_without_writes() {
        let fx = Fixture::new().await;
        for location_ids in [vec![], vec![fx.location, fx.location]] {
            let input = CreateDepartment {
                name: "Finance".to_string(),
                identifier: "finance".to_string(),
                parent_id: None,
                location_ids,
            };
            let err = assert_err!(fx.service.create_department(&fx.ctx, input).await);
            match err {
                AppError::Validation(errors) => assert!(errors.has_field("location_ids")),
                other => panic!("expected validation error, got {:?}", other),
            }
        }
        assert!(fx.store.departments().await.is_empty());
    }

    #[tokio::test]
    async fn create_reports_missing_and_inactive_locations() {
        let fx = Fixture::new().await;
        let closed = LocationId::generate();
        fx.store.add_location(closed, false).await;

        let missing = LocationId::generate();
        let input = CreateDepartment {
            name: "Finance".to_string(),
            identifier: "finance".to_string(),
            parent_id: None,
            location_ids: vec![fx.location, missing],
        };
        match fx.service.create_department(&fx.ctx, input).await {
            Err(AppError::NotFound(msg)) => assert!(msg.contains(&missing.to_string())),
            other => panic!("expected not found, got {:?}", other),
        }

        let input = CreateDepartment {
            name: "Finance".to_string(),
            identifier: "finance".to_string(),
            parent_id: None,
            location_ids: vec![closed],
        };
        let kind = conflict_of(fx.service.create_department(&fx.ctx, input).await);
        assert_eq!(kind, ConflictKind::InactiveLocation);
        assert!(fx.store.departments().await.is_empty());
    }

    #[tokio::test]
    async fn create_under_missing_or_inactive_parent_fails() {
        let fx = Fixture::new().await;
        let input = CreateDepartment {
            name: "Orphan".to_string(),
            identifier: "orphan".to_string(),
            parent_id: Some(DepartmentId::generate()),
            location_ids: vec![fx.location],
        };
        assert!(matches!(
            fx.service.create_department(&fx.ctx, input).await,
            Err(AppError::NotFound(_))
        ));

        let alpha = fx.create("alpha", None).await;
        fx.service.delete_department(&fx.ctx, alpha).await.unwrap();
        let input = CreateDepartment {
            name: "Child".to_string(),
            identifier: "child".to_string(),
            parent_id: Some(alpha),
            location_ids: vec![fx.location],
        };
        let kind = conflict_of(fx.service.create_department(&fx.ctx, input).await);
        assert_eq!(kind, ConflictKind::InactiveParent);
    }

    // identifiers are unique across the whole tree, not per parent
    #[tokio::test]
    async fn identifier_is_globally_unique() {
        let fx = Fixture::new().await;
        let alpha = fx.create("alpha", None).await;
        let omega = fx.create("omega", None).await;
        fx.create("finance", Some(alpha)).await;

        let input = CreateDepartment {
            name: "Finance".to_string(),
            identifier: "finance".to_string(),
            parent_id: Some(omega),
            location_ids: vec![fx.location],
        };
        let kind = conflict_of(fx.service.create_department(&fx.ctx, input).await);
        assert_eq!(kind, ConflictKind::DuplicateIdentifier);
    }

    #[tokio::test]
    async fn delete_cascades_and_is_idempotent() {
        let fx = Fixture::new().await;
        let (alpha, beta, gamma) = fx.chain().await;

        assert_eq!(fx.service.delete_department(&fx.ctx, beta).await.unwrap(), 2);
        assert!(fx.get(alpha).await.is_active());
        assert!(!fx.get(beta).await.is_active());
        assert!(!fx.get(gamma).await.is_active());
        // bindings survive
        assert_eq!(fx.get(gamma).await.location_ids().len(), 1);

        assert_eq!(fx.service.delete_department(&fx.ctx, beta).await.unwrap(), 0);
        assert_eq!(fx.path(gamma).await, "alpha.beta.gamma");
    }

    #[tokio::test]
    async fn restore_requires_active_parent() {
        let fx = Fixture::new().await;
        let (alpha, beta, gamma) = fx.chain().await;
        fx.service.delete_department(&fx.ctx, alpha).await.unwrap();

        let kind = conflict_of(fx.service.restore_department(&fx.ctx, beta).await);
        assert_eq!(kind, ConflictKind::InactiveParent);

        let restored = fx.service.restore_department(&fx.ctx, alpha).await.unwrap();
        assert!(restored.is_active());
        assert_eq!(restored.version(), fx.get(alpha).await.version());
        assert!(!fx.get(beta).await.is_active());

        fx.service.restore_department(&fx.ctx, beta).await.unwrap();
        assert!(fx.get(beta).await.is_active());
        assert!(!fx.get(gamma).await.is_active());
    }

    #[tokio::test]
    async fn replace_locations_checks_version() {
        let fx = Fixture::new().await;
        let alpha = fx.create("alpha", None).await;
        let second = LocationId::generate();
        fx.store.add_location(second, true).await;

        let kind = conflict_of(
            fx.service
                .replace_locations(&fx.ctx, alpha, vec![second], 7)
                .await,
        );
        assert_eq!(kind, ConflictKind::VersionMismatch);

        let updated = fx
            .service
            .replace_locations(&fx.ctx, alpha, vec![fx.location, second], 1)
            .await
            .unwrap();
        assert_eq!(updated.version(), 2);

        let stored = fx.get(alpha).await;
        assert_eq!(stored.version(), 2);
        assert!(stored.location_ids().contains(&second));
        assert_eq!(stored.location_ids().len(), 2);

        // the old version is now stale
        let kind = conflict_of(
            fx.service
                .replace_locations(&fx.ctx, alpha, vec![second], 1)
                .await,
        );
        assert_eq!(kind, ConflictKind::VersionMismatch);
    }

    #[tokio::test]
    async fn replace_locations_rejects_empty_list() {
        let fx = Fixture::new().await;
        let alpha = fx.create("alpha", None).await;
        let result = fx.service.replace_locations(&fx.ctx, alpha, vec![], 1).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(fx.get(alpha).await.location_ids().len(), 1);
    }

    #[tokio::test]
    async fn replace_positions_rejects_inactive_position() {
        let fx = Fixture::new().await;
        let alpha = fx.create("alpha", None).await;
        let open = PositionId::generate();
        let closed = PositionId::generate();
        fx.store.add_position(open, true).await;
        fx.store.add_position(closed, false).await;

        let kind = conflict_of(
            fx.service
                .replace_positions(&fx.ctx, alpha, vec![open, closed], 1)
                .await,
        );
        assert_eq!(kind, ConflictKind::InactivePosition);
        assert!(fx.get(alpha).await.position_ids().is_empty());

        fx.service
            .replace_positions(&fx.ctx, alpha, vec![open], 1)
            .await
            .unwrap();
        assert!(fx.get(alpha).await.position_ids().contains(&open));
    }

    #[tokio::test]
    async fn subtree_is_returned_shallowest_first() {
        let fx = Fixture::new().await;
        let (alpha, _, _) = fx.chain().await;
        fx.create("delta", Some(alpha)).await;

        let rows = fx.service.get_subtree(&fx.ctx, alpha).await.unwrap();
        let paths: Vec<&str> = rows.iter().map(|d| d.path().as_str()).collect();
        assert_eq!(
            paths,
            vec!["alpha", "alpha.beta", "alpha.delta", "alpha.beta.gamma"]
        );
    }

    #[tokio::test]
    async fn disjoint_moves_run_concurrently() {
        let fx = Fixture::new().await;
        let (_, beta, gamma) = fx.chain().await;
        let omega = fx.create("omega", None).await;
        let sigma = fx.create("sigma", Some(omega)).await;
        let tau = fx.create("tau", Some(sigma)).await;

        let (first, second) = tokio::join!(
            fx.service.move_department(&fx.ctx, beta, None),
            fx.service.move_department(&fx.ctx, tau, Some(omega)),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(fx.path(gamma).await, "beta.gamma");
        assert_eq!(fx.path(tau).await, "omega.tau");
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn overlapping_moves_serialize() {
        let fx = Fixture::new().await;
        let (_, beta, gamma) = fx.chain().await;
        let delta = fx.create("delta", None).await;

        let mut holder = fx.store.begin(IsolationLevel::default()).await.unwrap();
        holder.get_by_id(beta, LockMode::Exclusive).await.unwrap();

        let service = fx.service.clone();
        let contender = tokio::spawn(async move {
            service
                .move_department(&OperationContext::new(), beta, Some(delta))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        // the lock holder moves beta to the top level first
        DepartmentService::move_within(holder.as_mut(), beta, None, 3)
            .await
            .unwrap();
        holder.commit().await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.old_path.as_str(), "beta");
        assert_eq!(fx.path(beta).await, "delta.beta");
        assert_eq!(fx.path(gamma).await, "delta.beta.gamma");
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn timed_out_move_rolls_back_and_releases_locks() {
        let fx = Fixture::new().await;
        let (alpha, beta, gamma) = fx.chain().await;

        let mut holder = fx.store.begin(IsolationLevel::default()).await.unwrap();
        holder.get_by_id(gamma, LockMode::Exclusive).await.unwrap();

        let ctx = OperationContext::new().with_timeout(Duration::from_millis(50));
        let result = fx.service.move_department(&ctx, beta, None).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(fx.path(beta).await, "alpha.beta");
        holder.rollback().await.unwrap();

        // beta was locked by the cancelled move; it must be free again
        let mut checker = fx.store.begin(IsolationLevel::default()).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            checker.get_by_id(beta, LockMode::Exclusive),
        )
        .await
        .unwrap()
        .unwrap();
        checker.rollback().await.unwrap();

        fx.service.move_department(&fx.ctx, beta, None).await.unwrap();
        assert_eq!(fx.path(gamma).await, "beta.gamma");
        assert_eq!(fx.path(alpha).await, "alpha");
    }

    #[tokio::test]
    async fn cancelled_create_writes_nothing() {
        let fx = Fixture::new().await;
        let token = CancellationToken::new();
        token.cancel();
        let ctx = OperationContext::with_cancellation(token);

        let input = CreateDepartment {
            name: "Finance".to_string(),
            identifier: "finance".to_string(),
            parent_id: None,
            location_ids: vec![fx.location],
        };
        let result = fx.service.create_department(&ctx, input).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(fx.store.departments().await.is_empty());
    }

    #[tokio::test]
    async fn composed_operations_share_one_unit() {
        let fx = Fixture::new().await;
        let mut uow = fx.store.begin(IsolationLevel::default()).await.unwrap();

        let draft = DepartmentDraft::parse("Alpha", "alpha", &[fx.location]).unwrap();
        let alpha = DepartmentService::create_within(uow.as_mut(), draft, None)
            .await
            .unwrap();
        let draft = DepartmentDraft::parse("Beta", "beta", &[fx.location]).unwrap();
        let beta = DepartmentService::create_within(uow.as_mut(), draft, Some(alpha))
            .await
            .unwrap();
        DepartmentService::move_within(uow.as_mut(), beta, None, 3)
            .await
            .unwrap();
        assert!(fx.store.departments().await.is_empty());

        uow.commit().await.unwrap();
        assert_eq!(fx.path(beta).await, "beta");
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn create_holds_parent_against_concurrent_move() {
        let fx = Fixture::new().await;
        let (alpha, beta, _) = fx.chain().await;

        let mut creator = fx.store.begin(IsolationLevel::default()).await.unwrap();
        let draft = DepartmentDraft::parse("Child", "child", &[fx.location]).unwrap();
        let child = DepartmentService::create_within(creator.as_mut(), draft, Some(beta))
            .await
            .unwrap();

        let service = fx.service.clone();
        let mover = tokio::spawn(async move {
            service
                .move_department(&OperationContext::new(), beta, None)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!mover.is_finished());
        creator.commit().await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(1), mover)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.rewritten, 2);
        assert_eq!(fx.path(beta).await, "beta");
        assert_eq!(fx.path(child).await, "beta.child");
        assert_eq!(fx.get(child).await.depth(), 1);
        assert_eq!(fx.path(alpha).await, "alpha");
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn create_holds_parent_against_concurrent_delete() {
        let fx = Fixture::new().await;
        let (_, beta, _) = fx.chain().await;

        let mut creator = fx.store.begin(IsolationLevel::default()).await.unwrap();
        let draft = DepartmentDraft::parse("Child", "child", &[fx.location]).unwrap();
        let child = DepartmentService::create_within(creator.as_mut(), draft, Some(beta))
            .await
            .unwrap();

        let service = fx.service.clone();
        let deleter = tokio::spawn(async move {
            service
                .delete_department(&OperationContext::new(), beta)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!deleter.is_finished());
        creator.commit().await.unwrap();

        let deactivated = tokio::time::timeout(Duration::from_secs(1), deleter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(deactivated, 3);
        assert!(!fx.get(beta).await.is_active());
        assert!(!fx.get(child).await.is_active());
    }

    #[tokio::test]
    async fn create_after_concurrent_delete_sees_inactive_parent() {
        let fx = Fixture::new().await;
        let (_, beta, _) = fx.chain().await;

        let mut deleter = fx.store.begin(IsolationLevel::default()).await.unwrap();
        DepartmentService::delete_within(deleter.as_mut(), beta, 3)
            .await
            .unwrap();

        let service = fx.service.clone();
        let location = fx.location;
        let creator = tokio::spawn(async move {
            let input = CreateDepartment {
                name: "Child".to_string(),
                identifier: "child".to_string(),
                parent_id: Some(beta),
                location_ids: vec![location],
            };
            service
                .create_department(&OperationContext::new(), input)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!creator.is_finished());
        deleter.commit().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), creator)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict_of(result), ConflictKind::InactiveParent);
        assert_eq!(fx.store.departments().await.len(), 3);
    }

    #[tokio::test]
    async fn creates_under_same_parent_do_not_block_each_other() {
        let fx = Fixture::new().await;
        let alpha = fx.create("alpha", None).await;

        let mut first = fx.store.begin(IsolationLevel::default()).await.unwrap();
        let draft = DepartmentDraft::parse("Finance", "finance", &[fx.location]).unwrap();
        DepartmentService::create_within(first.as_mut(), draft, Some(alpha))
            .await
            .unwrap();

        let mut second = fx.store.begin(IsolationLevel::default()).await.unwrap();
        let draft = DepartmentDraft::parse("Payroll", "payroll", &[fx.location]).unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            DepartmentService::create_within(second.as_mut(), draft, Some(alpha)),
        )
        .await
        .unwrap()
        .unwrap();

        second.commit().await.unwrap();
        first.commit().await.unwrap();
        assert_eq!(fx.store.departments().await.len(), 3);
        fx.assert_consistent().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crossing_moves_leave_exactly_one_winner() {
        let fx = Fixture::new().await;
        let xray = fx.create("xray", None).await;
        let yankee = fx.create("yankee", None).await;
        fx.create("zulu", Some(yankee)).await;

        let (first, second) = {
            let left = fx.service.clone();
            let right = fx.service.clone();
            let ctx = OperationContext::new();
            let ctx2 = ctx.clone();
            tokio::join!(
                tokio::spawn(async move { left.move_department(&ctx, xray, Some(yankee)).await }),
                tokio::spawn(async move { right.move_department(&ctx2, yankee, Some(xray)).await }),
            )
        };
        let (first, second) = (first.unwrap(), second.unwrap());

        assert!(first.is_ok() != second.is_ok(), "{:?} / {:?}", first, second);
        let failed = if first.is_ok() { second } else { first };
        assert_eq!(conflict_of(failed), ConflictKind::ParentIdAsChild);

        let rows = fx.store.departments().await;
        assert_eq!(rows.iter().filter(|d| d.is_root()).count(), 1);
        fx.assert_consistent().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn moves_of_ancestor_and_descendant_both_apply() {
        let fx = Fixture::new().await;
        let (alpha, beta, gamma) = fx.chain().await;
        let omega = fx.create("omega", None).await;
        let sigma = fx.create("sigma", None).await;

        let (first, second) = {
            let left = fx.service.clone();
            let right = fx.service.clone();
            tokio::join!(
                tokio::spawn(async move {
                    left.move_department(&OperationContext::new(), beta, Some(sigma))
                        .await
                }),
                tokio::spawn(async move {
                    right
                        .move_department(&OperationContext::new(), gamma, Some(omega))
                        .await
                }),
            )
        };
        first.unwrap().unwrap();
        second.unwrap().unwrap();

        assert_eq!(fx.path(beta).await, "sigma.beta");
        assert_eq!(fx.path(gamma).await, "omega.gamma");
        assert_eq!(fx.path(alpha).await, "alpha");
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn subtree_changing_past_retry_limit_is_concurrent_modification() {
        let fx = Fixture::new().await;
        let (_, beta, gamma) = fx.chain().await;
        let omega = fx.create("omega", None).await;
        let settings = HierarchySettings {
            lock_retry_limit: 0,
            ..HierarchySettings::default()
        };
        let service = DepartmentService::new(Arc::new(fx.store.clone()), settings);

        // gamma leaves beta's subtree while the move below waits for its lock
        let mut holder = fx.store.begin(IsolationLevel::default()).await.unwrap();
        DepartmentService::move_within(holder.as_mut(), gamma, None, 3)
            .await
            .unwrap();

        let contender = tokio::spawn(async move {
            service
                .move_department(&OperationContext::new(), beta, Some(omega))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());
        holder.commit().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict_of(result), ConflictKind::ConcurrentModification);
        assert_eq!(fx.path(beta).await, "alpha.beta");
        assert_eq!(fx.path(gamma).await, "gamma");
        fx.assert_consistent().await;
    }
}
