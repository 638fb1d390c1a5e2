//! Uptime tracking: server records, result ingestion, and ranking.

mod models;
mod score;
mod store;

pub use models::*;
pub use score::*;
pub use store::*;
