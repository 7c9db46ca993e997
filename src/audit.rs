//! Operation log
//!
//! Entries are queued on a bounded channel and written to `op_log` by a
//! background task. Losing an entry never fails the operation it describes.

use sea_orm::{ActiveModelTrait, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::entity::op_log::{self, OpResult, OpType};

/// Log entry to be added
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub op_type: OpType,
    pub department_id: Option<Uuid>,
    pub op_desc: String,
    pub old_value: Option<String>,
    pub result: OpResult,
}

impl LogEntry {
    fn into_active_model(self, op_time: i64) -> op_log::ActiveModel {
        op_log::ActiveModel {
            op_time: Set(op_time),
            op_type: Set(self.op_type.as_str().to_string()),
            department_id: Set(self.department_id),
            op_desc: Set(self.op_desc),
            old_value: Set(self.old_value),
            result: Set(self.result.as_str().to_string()),
            ..Default::default()
        }
    }
}

/// Global log channel
static LOG_TX: std::sync::OnceLock<mpsc::Sender<LogEntry>> = std::sync::OnceLock::new();

/// Start the writer task; later calls are no-ops
pub fn init(db: sea_orm::DatabaseConnection) {
    if LOG_TX.get().is_some() {
        tracing::debug!("Audit log service already initialized, skipping");
        return;
    }

    let (tx, mut rx) = mpsc::channel::<LogEntry>(200);
    if LOG_TX.set(tx).is_err() {
        tracing::debug!("Audit log service initialized by another thread");
        return;
    }

    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = entry.into_active_model(now).insert(&db).await {
                tracing::error!("Failed to log operation: {}", e);
            }
        }
    });
}

/// Queue an entry without waiting
pub fn add_log(entry: LogEntry) {
    if let Some(tx) = LOG_TX.get() {
        if tx.try_send(entry).is_err() {
            tracing::warn!("Log channel is full, operation log dropped");
        }
    } else {
        tracing::debug!(
            "Audit log service not initialized, log dropped: {} - {}",
            entry.op_type.as_str(),
            entry.op_desc
        );
    }
}

pub fn log_operation(
    op_type: OpType,
    department_id: Option<Uuid>,
    op_desc: impl Into<String>,
    old_value: Option<String>,
    result: OpResult,
) {
    add_log(LogEntry {
        op_type,
        department_id,
        op_desc: op_desc.into(),
        old_value,
        result,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::ActiveValue;

    #[test]
    fn entry_maps_to_row() {
        let id = Uuid::new_v4();
        let entry = LogEntry {
            op_type: OpType::MoveDepartment,
            department_id: Some(id),
            op_desc: "path: head.sales".to_string(),
            old_value: Some("sales".to_string()),
            result: OpResult::Success,
        };
        let row = entry.into_active_model(1_700_000_000);
        assert_eq!(row.op_type, ActiveValue::Set("move_department".to_string()));
        assert_eq!(row.department_id, ActiveValue::Set(Some(id)));
        assert_eq!(row.result, ActiveValue::Set("success".to_string()));
        assert!(row.id.is_not_set());
    }

    #[test]
    fn logging_without_writer_is_harmless() {
        log_operation(OpType::DeleteDepartment, None, "nothing", None, OpResult::Failed);
    }
}
