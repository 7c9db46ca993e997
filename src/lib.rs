//! Orgdir - organisational directory service
//!
//! This crate keeps a department hierarchy consistent under concurrent
//! create, move and soft-delete operations, using materialized paths and
//! row locks taken in a single global order.

pub mod audit;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod handlers;
pub mod hierarchy;
pub mod repository;
pub mod routes;
pub mod state;
pub mod transaction;

// Re-export commonly used types
pub use config::Config;
pub use error::{AppError, AppResult};
pub use state::AppState;
