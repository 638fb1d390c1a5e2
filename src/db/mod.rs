//! Database module for dogdorm.
//!
//! Provides SQLite snapshot storage with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
