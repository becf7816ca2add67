//! Storage layer abstraction.
//!
//! This module provides three storage concerns:
//! - **Graph**: Authoritative versioned entities (`SQLite`, Cypher graph databases)
//! - **Id index**: Entity id reservation (memory, append-only file)
//! - **Entity index**: Full-text search over names (`SQLite` + FTS5)

// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]

pub mod graph;
pub mod id_index;
pub mod index;
pub mod sqlite;
pub mod traits;

pub use graph::{CypherExecutor, CypherGraphStore, SqliteGraphStore};
pub use id_index::{FileIdIndex, InMemoryIdIndex};
pub use index::SqliteEntityIndex;
pub use traits::{EntityIndex, GraphStore, IdIndex, NAME_TAG};

use crate::{Error, Result};
use std::path::PathBuf;

/// Gets the user-level data directory for versioned-kg.
///
/// # Errors
///
/// Returns an error if the user data directory cannot be determined.
pub fn get_user_data_dir() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .map(|b| b.data_local_dir().join("versioned-kg"))
        .ok_or_else(|| Error::OperationFailed {
            operation: "get_user_data_dir".to_string(),
            cause: "Could not determine user data directory".to_string(),
        })
}
