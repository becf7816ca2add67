//! Data models for the versioned knowledge graph.
//!
//! This module contains the core data structures shared by the query builder,
//! the ontology, the stores and the services.

pub mod graph;
pub mod temporal;
pub mod value;

pub use graph::{
    DiffOp, Entity, EntityId, EntityQuery, PropertyDiff, Relationship, RelationshipChange,
    RelationshipDiff, RelationshipQuery, State, StateDiff, StateId, StatePatch, diff_properties,
    diff_relationships, is_soft_deleted,
};
pub use temporal::{Timestamp, Validity, format_timestamp, parse_timestamp};
pub use value::{DELETED_KEY, PropertyMap, PropertyType, PropertyValue, zip_properties};
