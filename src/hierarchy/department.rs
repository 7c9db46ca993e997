//! Department aggregate
//!
//! Validated construction and state transitions. Path and depth of a
//! department are only ever changed through this type, and depth is always
//! derived from the path.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::ids::{DepartmentId, LocationId, PositionId};
use super::path::{DepartmentPath, PathError};
use crate::error::{AppError, AppResult, ConflictKind, ValidationErrors};

pub const NAME_MIN_LEN: usize = 3;
pub const NAME_MAX_LEN: usize = 150;
pub const IDENTIFIER_MIN_LEN: usize = 3;
pub const IDENTIFIER_MAX_LEN: usize = 150;

/// Raw row shape shared by the storage backends
#[derive(Debug, Clone)]
pub struct DepartmentRecord {
    pub id: Uuid,
    pub name: String,
    pub identifier: String,
    pub parent_id: Option<Uuid>,
    pub path: String,
    pub depth: i32,
    pub is_active: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub location_ids: Vec<Uuid>,
    pub position_ids: Vec<Uuid>,
}

/// Input of a new department that passed every shape check
#[derive(Debug, Clone)]
pub struct DepartmentDraft {
    name: String,
    identifier: String,
    location_ids: BTreeSet<LocationId>,
}

impl DepartmentDraft {
    /// Check name, identifier and location list, collecting every failure
    pub fn parse(
        name: &str,
        identifier: &str,
        location_ids: &[LocationId],
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        validate_name(name, &mut errors);
        validate_identifier(identifier, &mut errors);
        let locations = collect_unique("location_ids", location_ids, true, &mut errors);

        errors.into_result()?;

        Ok(Self {
            name: name.trim().to_string(),
            identifier: identifier.to_string(),
            location_ids: locations,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn location_ids(&self) -> &BTreeSet<LocationId> {
        &self.location_ids
    }

    /// Place the draft in the tree and give it an identity
    pub fn into_department(self, parent: Option<&Department>) -> Result<Department, ValidationErrors> {
        let path = DepartmentPath::compose(parent.map(|p| &p.path), &self.identifier).map_err(|e| {
            let mut errors = ValidationErrors::new();
            errors.add("identifier", e.to_string());
            errors
        })?;

        let now = Utc::now();
        Ok(Department {
            id: DepartmentId::generate(),
            name: self.name,
            identifier: self.identifier,
            parent_id: parent.map(|p| p.id),
            path,
            is_active: true,
            location_ids: self.location_ids,
            position_ids: BTreeSet::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Department {
    id: DepartmentId,
    name: String,
    identifier: String,
    parent_id: Option<DepartmentId>,
    path: DepartmentPath,
    is_active: bool,
    location_ids: BTreeSet<LocationId>,
    position_ids: BTreeSet<PositionId>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Department {
    /// Validate input and build a new department under `parent`
    pub fn create(
        name: &str,
        identifier: &str,
        parent: Option<&Department>,
        location_ids: &[LocationId],
    ) -> Result<Department, ValidationErrors> {
        DepartmentDraft::parse(name, identifier, location_ids)?.into_department(parent)
    }

    /// Rebuild from storage; the stored depth is only compared, never used
    pub fn from_record(record: DepartmentRecord) -> AppResult<Department> {
        let path = DepartmentPath::parse(&record.path).map_err(|e| {
            AppError::failure(format!("department {} has a corrupt path: {}", record.id, e))
        })?;

        if path.depth() != record.depth {
            tracing::warn!(
                "Stored depth {} of department {} disagrees with path '{}', using {}",
                record.depth,
                record.id,
                path,
                path.depth()
            );
        }

        Ok(Department {
            id: DepartmentId(record.id),
            name: record.name,
            identifier: record.identifier,
            parent_id: record.parent_id.map(DepartmentId),
            path,
            is_active: record.is_active,
            location_ids: record.location_ids.into_iter().map(LocationId).collect(),
            position_ids: record.position_ids.into_iter().map(PositionId).collect(),
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Re-parent this node, recomputing its own path
    ///
    /// Descendant rows are not touched here; the caller rebases them.
    pub fn assign_new_parent(&mut self, new_parent: Option<&Department>) -> AppResult<()> {
        if let Some(parent) = new_parent {
            if parent.id == self.id {
                return Err(AppError::conflict(
                    ConflictKind::ParentId,
                    format!("department {} cannot be its own parent", self.id),
                ));
            }
            if parent.path.is_within(&self.path) {
                return Err(AppError::conflict(
                    ConflictKind::ParentIdAsChild,
                    format!(
                        "department {} cannot move under its descendant {}",
                        self.id, parent.id
                    ),
                ));
            }
        }

        let path = DepartmentPath::compose(new_parent.map(|p| &p.path), &self.identifier)
            .map_err(|e| AppError::failure(e.to_string()))?;

        self.parent_id = new_parent.map(|p| p.id);
        self.path = path;
        self.touch();
        Ok(())
    }

    /// Swap the whole location list; it may never become empty
    pub fn replace_locations(&mut self, ids: &[LocationId]) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let locations = collect_unique("location_ids", ids, true, &mut errors);
        errors.into_result()?;

        self.location_ids = locations;
        self.touch();
        Ok(())
    }

    pub fn replace_positions(&mut self, ids: &[PositionId]) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let positions = collect_unique("position_ids", ids, false, &mut errors);
        errors.into_result()?;

        self.position_ids = positions;
        self.touch();
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.touch();
    }

    pub fn reactivate(&mut self) {
        self.is_active = true;
        self.touch();
    }

    /// Rewrite the leading `old_prefix` of the path (ancestor was moved)
    pub(crate) fn rebase_path(
        &mut self,
        old_prefix: &DepartmentPath,
        new_prefix: &DepartmentPath,
    ) -> Result<(), PathError> {
        self.path = self.path.rebase(old_prefix, new_prefix)?;
        self.touch();
        Ok(())
    }

    /// Overwrite link sets as stored, without validation
    pub(crate) fn set_links(
        &mut self,
        location_ids: BTreeSet<LocationId>,
        position_ids: BTreeSet<PositionId>,
    ) {
        self.location_ids = location_ids;
        self.position_ids = position_ids;
    }

    /// Record that a write of this row was persisted
    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn id(&self) -> DepartmentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn parent_id(&self) -> Option<DepartmentId> {
        self.parent_id
    }

    pub fn path(&self) -> &DepartmentPath {
        &self.path
    }

    pub fn depth(&self) -> i32 {
        self.path.depth()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn location_ids(&self) -> &BTreeSet<LocationId> {
        &self.location_ids
    }

    pub fn position_ids(&self) -> &BTreeSet<PositionId> {
        &self.position_ids
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

fn validate_name(name: &str, errors: &mut ValidationErrors) {
    let len = name.trim().chars().count();
    if len == 0 {
        errors.add("name", "name must not be empty");
    } else if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
        errors.add(
            "name",
            format!("name must be {}-{} characters", NAME_MIN_LEN, NAME_MAX_LEN),
        );
    }
}

fn validate_identifier(identifier: &str, errors: &mut ValidationErrors) {
    let len = identifier.chars().count();
    if !(IDENTIFIER_MIN_LEN..=IDENTIFIER_MAX_LEN).contains(&len) {
        errors.add(
            "identifier",
            format!(
                "identifier must be {}-{} characters",
                IDENTIFIER_MIN_LEN, IDENTIFIER_MAX_LEN
            ),
        );
    }
    if !identifier.chars().all(|c| c.is_ascii_alphabetic()) {
        errors.add("identifier", "identifier may contain latin letters only");
    }
}

/// Collect ids into a set, reporting duplicates (and emptiness if required)
fn collect_unique<T: Ord + Copy + std::fmt::Display>(
    field: &'static str,
    ids: &[T],
    required: bool,
    errors: &mut ValidationErrors,
) -> BTreeSet<T> {
    if required && ids.is_empty() {
        errors.add(field, "at least one id is required");
    }

    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for id in ids {
        if !seen.insert(*id) {
            duplicates.insert(*id);
        }
    }

    if !duplicates.is_empty() {
        let listed: Vec<String> = duplicates.iter().map(|id| id.to_string()).collect();
        errors.add(field, format!("duplicate ids: {}", listed.join(", ")));
    }

    seen
}
