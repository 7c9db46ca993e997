//! Department hierarchy engine
//!
//! Path codec, the department aggregate and the operations that create, move
//! and deactivate departments while keeping materialized paths consistent.

pub mod department;
pub mod ids;
pub mod path;
pub mod service;

pub use department::{Department, DepartmentDraft, DepartmentRecord};
pub use ids::{DepartmentId, LocationId, PositionId};
pub use path::{is_descendant_prefix, DepartmentPath, PathError, DELIMITER};
pub use service::{CreateDepartment, DepartmentService, HierarchySettings, MoveReport};
