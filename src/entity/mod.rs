//! Entity module - SeaORM entity definitions
//!
//! One module per table of the directory schema

pub mod department;
pub mod department_location;
pub mod department_position;
pub mod location;
pub mod op_log;
pub mod position;
