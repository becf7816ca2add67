//! Graph storage backends for versioned entities.
//!
//! This module provides implementations of the [`GraphStore`] trait.
//!
//! # Available Backends
//!
//! | Backend | Use Case | Features |
//! |---------|----------|----------|
//! | [`SqliteGraphStore`] | Default; embedded | Transactions, partial unique index on the current state |
//! | [`CypherGraphStore`] | Graph databases with the versioner procedures | Drives the query builder |
//!
//! # Example
//!
//! ```rust,ignore
//! use versioned_kg::storage::graph::SqliteGraphStore;
//! use versioned_kg::storage::GraphStore;
//! use versioned_kg::models::{Entity, EntityId, PropertyMap};
//!
//! let store = SqliteGraphStore::new("graph.db")?;
//! let entity = Entity::new(EntityId::new("jack"), "User", chrono::Utc::now());
//! store.create_entity(&entity, &PropertyMap::new())?;
//! ```

pub mod cypher;
mod sqlite;

pub use cypher::{CypherExecutor, CypherGraphStore, CypherValue, Edge, Node, Row};
pub use sqlite::SqliteGraphStore;

pub use crate::storage::traits::GraphStore;

use crate::models::{EntityId, PropertyMap, Relationship, RelationshipChange};
use std::collections::BTreeMap;

/// Edge set of a state keyed by `(kind, target)`.
pub(crate) type EdgeSet = BTreeMap<(String, EntityId), PropertyMap>;

/// Copies a state's edges and applies relationship changes to the copy.
///
/// `Create` inserts or replaces, `Delete` drops, and `Update` merges
/// properties into an existing edge. Changes naming an absent edge are no-ops
/// except `Create`.
pub(crate) fn apply_relationship_changes(
    carried: &[Relationship],
    changes: &[RelationshipChange],
) -> EdgeSet {
    let mut edges: EdgeSet = carried
        .iter()
        .map(|r| ((r.kind.clone(), r.to.clone()), r.properties.clone()))
        .collect();
    for change in changes {
        match change {
            RelationshipChange::Create {
                kind,
                to,
                properties,
            } => {
                edges.insert((kind.clone(), to.clone()), properties.clone());
            },
            RelationshipChange::Delete { kind, to } => {
                edges.remove(&(kind.clone(), to.clone()));
            },
            RelationshipChange::Update {
                kind,
                to,
                properties,
            } => {
                if let Some(existing) = edges.get_mut(&(kind.clone(), to.clone())) {
                    existing.extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            },
        }
    }
    edges
}
