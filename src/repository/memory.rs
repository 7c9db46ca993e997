//! In-process department store
//!
//! Each row has its own async read-write lock standing in for a row lock,
//! read side for shared holders and write side for exclusive ones. A unit of
//! work stages its writes privately and publishes them on commit after
//! re-checking the versions it started from, so readers never observe a
//! half-applied move.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::{DepartmentRepository, LockMode, Reference};
use crate::error::{AppError, AppResult, ConflictKind};
use crate::hierarchy::path::lock_order_key;
use crate::hierarchy::{Department, DepartmentId, DepartmentPath, LocationId, PositionId};
use crate::transaction::{IsolationLevel, TransactionManager, UnitOfWork};

#[derive(Default)]
struct MemoryState {
    departments: HashMap<DepartmentId, Department>,
    locations: HashMap<LocationId, bool>,
    positions: HashMap<PositionId, bool>,
}

type RowLocks = DashMap<DepartmentId, Arc<RwLock<()>>>;

enum RowGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Shared store; clones see the same data
#[derive(Clone, Default)]
pub struct MemoryDepartmentStore {
    state: Arc<RwLock<MemoryState>>,
    row_locks: Arc<RowLocks>,
}

impl MemoryDepartmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_location(&self, id: LocationId, is_active: bool) {
        self.state.write().await.locations.insert(id, is_active);
    }

    pub async fn add_position(&self, id: PositionId, is_active: bool) {
        self.state.write().await.positions.insert(id, is_active);
    }

    /// Committed departments ordered by depth then path
    pub async fn departments(&self) -> Vec<Department> {
        let state = self.state.read().await;
        let mut rows: Vec<Department> = state.departments.values().cloned().collect();
        rows.sort_by(|a, b| lock_order_key(a.path()).cmp(&lock_order_key(b.path())));
        rows
    }

    pub async fn department(&self, id: DepartmentId) -> Option<Department> {
        self.state.read().await.departments.get(&id).cloned()
    }
}

#[async_trait]
impl TransactionManager for MemoryDepartmentStore {
    async fn begin(&self, isolation: IsolationLevel) -> AppResult<Box<dyn UnitOfWork>> {
        tracing::trace!("Begin in-memory unit of work ({:?})", isolation);
        Ok(Box::new(MemoryUnitOfWork {
            state: self.state.clone(),
            row_locks: self.row_locks.clone(),
            held: HashMap::new(),
            staged: HashMap::new(),
            inserted: HashSet::new(),
            baseline: HashMap::new(),
        }))
    }
}

pub struct MemoryUnitOfWork {
    state: Arc<RwLock<MemoryState>>,
    row_locks: Arc<RowLocks>,
    /// Row locks owned until commit, rollback or drop
    held: HashMap<DepartmentId, RowGuard>,
    /// Rows as this unit will publish them
    staged: HashMap<DepartmentId, Department>,
    inserted: HashSet<DepartmentId>,
    /// Committed version of every updated row when first written
    baseline: HashMap<DepartmentId, i64>,
}

impl MemoryUnitOfWork {
    async fn lock_row(&mut self, id: DepartmentId, lock: LockMode) {
        match (lock, self.held.get(&id)) {
            (LockMode::None, _)
            | (_, Some(RowGuard::Exclusive(_)))
            | (LockMode::Shared, Some(RowGuard::Shared(_))) => return,
            _ => {}
        }
        // a shared hold is released before upgrading
        self.held.remove(&id);

        // clone the Arc so no map guard lives across the await
        let row = self.row_locks.entry(id).or_default().clone();
        let guard = match lock {
            LockMode::Shared => RowGuard::Shared(row.read_owned().await),
            _ => RowGuard::Exclusive(row.write_owned().await),
        };
        self.held.insert(id, guard);
    }

    fn holds(&self, id: &DepartmentId, lock: LockMode) -> bool {
        match self.held.get(id) {
            Some(RowGuard::Exclusive(_)) => true,
            Some(RowGuard::Shared(_)) => lock != LockMode::Exclusive,
            None => lock == LockMode::None,
        }
    }

    /// Staged row if this unit wrote it, committed row otherwise
    async fn read(&self, id: DepartmentId) -> Option<Department> {
        if let Some(row) = self.staged.get(&id) {
            return Some(row.clone());
        }
        self.state.read().await.departments.get(&id).cloned()
    }

    /// Rows at or below `path`, staged writes taking precedence
    async fn subtree(&self, path: &DepartmentPath) -> Vec<Department> {
        let state = self.state.read().await;
        let mut rows: Vec<Department> = state
            .departments
            .iter()
            .filter(|(id, _)| !self.staged.contains_key(*id))
            .map(|(_, row)| row)
            .chain(self.staged.values())
            .filter(|row| row.path().is_within(path))
            .cloned()
            .collect();
        rows.sort_by(|a, b| lock_order_key(a.path()).cmp(&lock_order_key(b.path())));
        rows
    }

    async fn stage_update(&mut self, mut row: Department) {
        let id = row.id();
        if !self.inserted.contains(&id) && !self.baseline.contains_key(&id) {
            let committed = self.state.read().await.departments.get(&id).map(|d| d.version());
            if let Some(version) = committed {
                self.baseline.insert(id, version);
            }
        }
        row.bump_version();
        self.staged.insert(id, row);
    }

    async fn current(&self, id: DepartmentId) -> AppResult<Department> {
        self.read(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("department {}", id)))
    }
}

#[async_trait]
impl DepartmentRepository for MemoryUnitOfWork {
    async fn get_by_id(&mut self, id: DepartmentId, lock: LockMode) -> AppResult<Option<Department>> {
        self.lock_row(id, lock).await;
        Ok(self.read(id).await)
    }

    async fn get_descendants_by_path_prefix(
        &mut self,
        path: &DepartmentPath,
        lock: LockMode,
    ) -> AppResult<Vec<Department>> {
        if lock == LockMode::None {
            return Ok(self.subtree(path).await);
        }

        // rows may move in or out while we wait, so filter again once locked
        loop {
            let rows = self.subtree(path).await;
            let pending: Vec<DepartmentId> = rows
                .iter()
                .map(|row| row.id())
                .filter(|id| !self.holds(id, lock))
                .collect();
            if pending.is_empty() {
                return Ok(rows);
            }
            for id in pending {
                self.lock_row(id, lock).await;
            }
        }
    }

    async fn exists_child_of_parent(
        &mut self,
        id: DepartmentId,
        parent_id: DepartmentId,
    ) -> AppResult<bool> {
        let (Some(child), Some(parent)) = (self.read(id).await, self.read(parent_id).await) else {
            return Ok(false);
        };
        Ok(child.id() != parent.id() && child.path().is_within(parent.path()))
    }

    async fn identifier_exists(&mut self, identifier: &str) -> AppResult<bool> {
        if self.staged.values().any(|row| row.identifier() == identifier) {
            return Ok(true);
        }
        let state = self.state.read().await;
        Ok(state
            .departments
            .values()
            .any(|row| row.identifier() == identifier))
    }

    async fn find_locations(&mut self, ids: &[LocationId]) -> AppResult<Vec<Reference<LocationId>>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                state.locations.get(id).map(|active| Reference {
                    id: *id,
                    is_active: *active,
                })
            })
            .collect())
    }

    async fn find_positions(&mut self, ids: &[PositionId]) -> AppResult<Vec<Reference<PositionId>>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                state.positions.get(id).map(|active| Reference {
                    id: *id,
                    is_active: *active,
                })
            })
            .collect())
    }

    async fn insert(&mut self, department: &Department) -> AppResult<DepartmentId> {
        let id = department.id();
        if self.read(id).await.is_some() {
            return Err(AppError::failure(format!("department {} already exists", id)));
        }
        if self.identifier_exists(department.identifier()).await? {
            return Err(AppError::conflict(
                ConflictKind::DuplicateIdentifier,
                format!("identifier '{}' is taken", department.identifier()),
            ));
        }
        {
            let state = self.state.read().await;
            if let Some(missing) = department
                .location_ids()
                .iter()
                .find(|l| !state.locations.contains_key(*l))
            {
                return Err(AppError::NotFound(format!("location {}", missing)));
            }
        }

        self.lock_row(id, LockMode::Exclusive).await;
        self.staged.insert(id, department.clone());
        self.inserted.insert(id);
        Ok(id)
    }

    async fn save(&mut self, department: &Department) -> AppResult<()> {
        let stored = self.current(department.id()).await?;
        if stored.version() != department.version() {
            return Err(AppError::conflict(
                ConflictKind::VersionMismatch,
                format!(
                    "department {} is at version {}, expected {}",
                    department.id(),
                    stored.version(),
                    department.version()
                ),
            ));
        }

        // scalar save leaves link rows alone
        let mut row = department.clone();
        row.set_links(stored.location_ids().clone(), stored.position_ids().clone());
        self.stage_update(row).await;
        Ok(())
    }

    async fn replace_location_links(&mut self, id: DepartmentId, ids: &[LocationId]) -> AppResult<()> {
        let mut row = self.current(id).await?;
        let positions = row.position_ids().clone();
        row.set_links(ids.iter().copied().collect::<BTreeSet<_>>(), positions);
        self.staged.insert(id, row);
        Ok(())
    }

    async fn replace_position_links(&mut self, id: DepartmentId, ids: &[PositionId]) -> AppResult<()> {
        let mut row = self.current(id).await?;
        let locations = row.location_ids().clone();
        row.set_links(locations, ids.iter().copied().collect::<BTreeSet<_>>());
        self.staged.insert(id, row);
        Ok(())
    }

    async fn bulk_rewrite_paths(
        &mut self,
        old_prefix: &DepartmentPath,
        new_prefix: &DepartmentPath,
        affected: &[DepartmentId],
    ) -> AppResult<u64> {
        let mut rewritten = 0;
        for id in affected {
            let mut row = self.current(*id).await?;
            row.rebase_path(old_prefix, new_prefix)?;
            self.stage_update(row).await;
            rewritten += 1;
        }
        Ok(rewritten)
    }

    async fn deactivate_descendants(&mut self, root_id: DepartmentId) -> AppResult<u64> {
        let root = self.current(root_id).await?;
        let mut deactivated = 0;
        for mut row in self.subtree(root.path()).await {
            if row.is_active() {
                row.deactivate();
                self.stage_update(row).await;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn commit(self: Box<Self>) -> AppResult<()> {
        let mut this = self;
        let shared = this.state.clone();
        let mut state = shared.write().await;

        for (id, expected) in &this.baseline {
            let current = state.departments.get(id).map(|d| d.version());
            if current != Some(*expected) {
                return Err(AppError::conflict(
                    ConflictKind::VersionMismatch,
                    format!("department {} changed before commit", id),
                ));
            }
        }
        for id in &this.inserted {
            let Some(row) = this.staged.get(id) else {
                continue;
            };
            let taken = state
                .departments
                .values()
                .any(|other| other.id() != *id && other.identifier() == row.identifier());
            if taken {
                return Err(AppError::conflict(
                    ConflictKind::DuplicateIdentifier,
                    format!("identifier '{}' is taken", row.identifier()),
                ));
            }
        }

        let written = this.staged.len();
        state.departments.extend(this.staged.drain());
        drop(state);
        this.held.clear();

        tracing::trace!("Committed {} department rows", written);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        tracing::trace!("Rolled back {} staged rows", self.staged.len());
        Ok(())
    }
}
