use std::sync::Arc;

use crate::config::Config;
use crate::hierarchy::DepartmentService;
use crate::transaction::{OperationContext, TransactionManager};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Hierarchy operations over the configured store
    pub service: Arc<DepartmentService>,
    /// Application configuration
    pub config: Arc<Config>,
}

impl AppState {
    /// Create new application state
    pub fn new(store: Arc<dyn TransactionManager>, config: Config) -> Self {
        let service = DepartmentService::new(store, config.hierarchy.settings());
        Self {
            service: Arc::new(service),
            config: Arc::new(config),
        }
    }

    /// Context for one request, bounded by the configured deadline
    pub fn operation_context(&self) -> OperationContext {
        let ctx = OperationContext::new();
        match self.config.hierarchy.operation_timeout() {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }
}
