//! Database layer for tickscope
//!
//! SQLite storage for the state that must survive a restart:
//! - capture source index (capture id → locator and display metadata)
//! - upload content-hash index
//! - plugin records

pub mod repo;
pub mod schema;

pub use repo::{Database, UploadRecord};
