//! Persistence layer: pooled SQLite access with versioned migrations.

mod models;
mod pool;
mod store;

pub use models::*;
pub use pool::{ConnectionPool, PooledConn};
pub use store::{Store, StoreError};
