//! Unit-of-work boundary
//!
//! A [`UnitOfWork`] is an open storage transaction plus the row locks taken
//! through it. Dropping one without committing rolls it back.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::repository::DepartmentRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl From<IsolationLevel> for sea_orm::IsolationLevel {
    fn from(level: IsolationLevel) -> Self {
        match level {
            IsolationLevel::ReadCommitted => sea_orm::IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead => sea_orm::IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable => sea_orm::IsolationLevel::Serializable,
        }
    }
}

#[async_trait]
pub trait UnitOfWork: DepartmentRepository {
    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> AppResult<Box<dyn UnitOfWork>>;
}

/// Cancellation and deadline of one logical operation
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run `work` unless the token fires or the deadline passes first
    ///
    /// On cancellation `work` is dropped before returning, together with any
    /// unit of work it borrows.
    pub async fn guard<T, F>(&self, work: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!("Operation cancelled by caller");
                Err(AppError::Cancelled)
            }
            _ = deadline => {
                tracing::debug!("Operation deadline exceeded");
                Err(AppError::Cancelled)
            }
            result = work => result,
        }
    }
}

/// Commit on success, roll back on failure
///
/// A rollback error is logged; the caller still sees the original failure.
pub async fn complete<T>(uow: Box<dyn UnitOfWork>, outcome: AppResult<T>) -> AppResult<T> {
    match outcome {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                tracing::error!("Rollback failed after '{}': {}", err, rollback_err);
            }
            Err(err)
        }
    }
}
