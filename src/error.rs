use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::{DbErr, RuntimeErr, SqlErr};
use serde::Serialize;
use thiserror::Error;

use crate::hierarchy::PathError;

/// A single rejected input field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Every validation failure found for one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldError {
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    /// Ok when nothing was collected
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for e in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
            first = false;
        }
        Ok(())
    }
}

/// Why a write was refused against the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Department named as its own parent
    ParentId,
    /// New parent lies inside the moved subtree
    ParentIdAsChild,
    DuplicateIdentifier,
    InactiveParent,
    InactiveLocation,
    InactivePosition,
    /// Expected row version did not match the stored one
    VersionMismatch,
    /// Subtree kept changing while its locks were being taken
    ConcurrentModification,
}

impl ConflictKind {
    pub fn code(&self) -> &'static str {
        match self {
            ConflictKind::ParentId => "parent.id.conflict",
            ConflictKind::ParentIdAsChild => "parent.id.as.child.conflict",
            ConflictKind::DuplicateIdentifier => "identifier.duplicate",
            ConflictKind::InactiveParent => "parent.inactive",
            ConflictKind::InactiveLocation => "location.inactive",
            ConflictKind::InactivePosition => "position.inactive",
            ConflictKind::VersionMismatch => "version.mismatch",
            ConflictKind::ConcurrentModification => "concurrent.modification",
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(ValidationErrors),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict ({}): {message}", .kind.code())]
    Conflict { kind: ConflictKind, message: String },

    #[error("Internal failure: {message}")]
    Failure { message: String, retryable: bool },

    #[error("Operation cancelled")]
    Cancelled,
}

impl AppError {
    pub fn conflict(kind: ConflictKind, message: impl Into<String>) -> Self {
        AppError::Conflict {
            kind,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        AppError::Failure {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        AppError::Failure {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            AppError::Conflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(errors: ValidationErrors) -> Self {
        AppError::Validation(errors)
    }
}

/// A malformed segment is bad input; a failed rebase is a broken invariant
impl From<PathError> for AppError {
    fn from(err: PathError) -> Self {
        match err {
            PathError::MalformedSegment(_) => {
                let mut errors = ValidationErrors::new();
                errors.add("identifier", err.to_string());
                AppError::Validation(errors)
            }
            PathError::NotUnderPrefix { .. } => {
                AppError::failure(format!("path invariant violated: {}", err))
            }
        }
    }
}

/// Storage errors are translated here so callers never see raw driver text
impl From<DbErr> for AppError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(detail)) => {
                return AppError::conflict(ConflictKind::DuplicateIdentifier, detail);
            }
            Some(SqlErr::ForeignKeyConstraintViolation(detail)) => {
                return AppError::NotFound(format!("referenced record is missing: {}", detail));
            }
            _ => {}
        }

        if sqlstate(&err).is_some_and(|code| is_transient_sqlstate(&code)) {
            return AppError::retryable(format!("transaction aborted: {}", err));
        }

        match err {
            DbErr::ConnectionAcquire(e) => AppError::retryable(format!("connection acquire: {}", e)),
            DbErr::Conn(e) => AppError::retryable(format!("connection: {}", e)),
            other => AppError::failure(other.to_string()),
        }
    }
}

/// serialization_failure and deadlock_detected
const TRANSIENT_SQLSTATES: [&str; 2] = ["40001", "40P01"];

fn is_transient_sqlstate(code: &str) -> bool {
    TRANSIENT_SQLSTATES.contains(&code)
}

fn sqlstate(err: &DbErr) -> Option<String> {
    match err {
        DbErr::Query(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(e)))
        | DbErr::Exec(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(e))) => {
            e.code().map(|code| code.into_owned())
        }
        _ => None,
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, kind, details) = match &self {
            AppError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                "Validation Error",
                None,
                serde_json::to_value(errors).ok(),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "Not Found",
                None,
                Some(serde_json::Value::String(msg.clone())),
            ),
            AppError::Conflict { kind, message } => (
                StatusCode::CONFLICT,
                "Conflict",
                Some(kind.code()),
                Some(serde_json::Value::String(message.clone())),
            ),
            AppError::Failure { message, retryable } => {
                tracing::error!("Internal failure (retryable: {}): {}", retryable, message);
                let status = if *retryable {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, "Internal Server Error", None, None)
            }
            AppError::Cancelled => (StatusCode::REQUEST_TIMEOUT, "Cancelled", None, None),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            message: message.to_string(),
            kind,
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for application
pub type AppResult<T> = Result<T, AppError>;

/// Helper trait for converting Option to AppError::NotFound
pub trait OptionExt<T> {
    fn ok_or_not_found(self, msg: impl Into<String>) -> AppResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, msg: impl Into<String>) -> AppResult<T> {
        self.ok_or_else(|| AppError::NotFound(msg.into()))
    }
}

/// Unexpected errors reach the boundary as an opaque failure
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::failure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let err = AppError::NotFound("Department not found".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_conflict_response() {
        let err = AppError::conflict(ConflictKind::ParentIdAsChild, "cycle");
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_failure_hides_detail_and_maps_retryable() {
        assert_eq!(
            AppError::retryable("pool timed out").into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::failure("boom").into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_option_ext() {
        let opt: Option<i32> = None;
        let result = opt.ok_or_not_found("Item not found");
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn validation_errors_accumulate() {
        let mut errors = ValidationErrors::new();
        errors.add("name", "too short");
        errors.add("identifier", "latin letters only");
        assert_eq!(errors.len(), 2);
        assert!(errors.has_field("identifier"));
        assert_eq!(
            errors.to_string(),
            "name: too short; identifier: latin letters only"
        );
        assert!(errors.into_result().is_err());
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn deadlock_and_serialization_failure_are_transient() {
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("40001"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("40002"));
    }

    #[test]
    fn connection_errors_are_retryable() {
        let err: AppError = DbErr::Conn(RuntimeErr::Internal("reset".to_string())).into();
        assert!(matches!(err, AppError::Failure { retryable: true, .. }));

        let err: AppError = DbErr::Query(RuntimeErr::Internal("40P01".to_string())).into();
        assert!(matches!(err, AppError::Failure { retryable: false, .. }));
    }

    #[test]
    fn generic_db_error_is_opaque_failure() {
        let err: AppError = DbErr::Custom("syntax".to_string()).into();
        assert!(matches!(err, AppError::Failure { retryable: false, .. }));
    }
}
