//! Materialized path codec
//!
//! A department's path is the chain of ancestor identifiers, root first,
//! joined by [`DELIMITER`]. Everything here is pure; no storage access.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between path segments
pub const DELIMITER: char = '.';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("malformed path segment '{0}'")]
    MalformedSegment(String),

    #[error("path '{path}' is not under prefix '{prefix}'")]
    NotUnderPrefix { path: String, prefix: String },
}

/// Ancestor chain of a department, e.g. `head.finance.payroll`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepartmentPath(String);

impl DepartmentPath {
    /// Child path of `parent` ending in `segment`; a root when `parent` is None
    pub fn compose(parent: Option<&DepartmentPath>, segment: &str) -> Result<Self, PathError> {
        check_segment(segment)?;

        Ok(match parent {
            Some(parent) => Self(format!("{}{}{}", parent.0, DELIMITER, segment)),
            None => Self(segment.to_string()),
        })
    }

    /// Validate a stored path value
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        for segment in raw.split(DELIMITER) {
            check_segment(segment)?;
        }
        Ok(Self(raw.to_string()))
    }

    /// Number of ancestors (a root is 0)
    pub fn depth(&self) -> i32 {
        self.0.matches(DELIMITER).count() as i32
    }

    /// Segment contributed by the node itself
    pub fn own_segment(&self) -> &str {
        match self.0.rfind(DELIMITER) {
            Some(idx) => &self.0[idx + DELIMITER.len_utf8()..],
            None => &self.0,
        }
    }

    /// Path of the parent node, None for a root
    pub fn parent(&self) -> Option<DepartmentPath> {
        self.0.rfind(DELIMITER).map(|idx| Self(self.0[..idx].to_string()))
    }

    /// True if `self` equals `ancestor` or lies below it
    pub fn is_within(&self, ancestor: &DepartmentPath) -> bool {
        is_descendant_prefix(ancestor, self)
    }

    /// Swap a leading `old_prefix` for `new_prefix`
    pub fn rebase(
        &self,
        old_prefix: &DepartmentPath,
        new_prefix: &DepartmentPath,
    ) -> Result<DepartmentPath, PathError> {
        if !is_descendant_prefix(old_prefix, self) {
            return Err(PathError::NotUnderPrefix {
                path: self.0.clone(),
                prefix: old_prefix.0.clone(),
            });
        }

        let rest = &self.0[old_prefix.0.len()..];
        Ok(Self(format!("{}{}", new_prefix.0, rest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DepartmentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `path` equals `ancestor` or starts with `ancestor` followed by the delimiter
pub fn is_descendant_prefix(ancestor: &DepartmentPath, path: &DepartmentPath) -> bool {
    match path.0.strip_prefix(ancestor.0.as_str()) {
        Some("") => true,
        Some(rest) => rest.starts_with(DELIMITER),
        None => false,
    }
}

/// Ordering key used whenever several rows are locked together
pub fn lock_order_key(path: &DepartmentPath) -> (i32, &str) {
    (path.depth(), path.as_str())
}

fn check_segment(segment: &str) -> Result<(), PathError> {
    if segment.is_empty() || segment.contains(DELIMITER) {
        return Err(PathError::MalformedSegment(segment.to_string()));
    }
    Ok(())
}
