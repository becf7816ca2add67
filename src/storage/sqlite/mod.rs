//! Shared `SQLite` infrastructure for storage backends.
//!
//! Used by the graph store ([`crate::storage::graph::SqliteGraphStore`]) and
//! the entity index ([`crate::storage::index::SqliteEntityIndex`]). Each
//! backend keeps its own connection; WAL mode lets them share one file.

mod connection;
mod metrics;

pub use connection::{
    DEFAULT_BUSY_TIMEOUT, acquire_lock, configure_connection, is_constraint_violation,
    sqlite_error,
};
pub use metrics::{record_operation_metrics, record_result};
