//! Graph store trait for versioned entity storage.
//!
//! A graph store persists entities, their state chains and the relationship
//! set carried by each state. It enforces the structural invariants of the
//! chain (one current state per entity, validity intervals that partition
//! time) but performs no ontology validation; that happens in
//! [`crate::services::VersionedGraph`] before a store is called.
//!
//! # Available Implementations
//!
//! | Backend | Use Case | Features |
//! |---------|----------|----------|
//! | `SqliteGraphStore` | Default; embedded | One transaction per mutation |
//! | `CypherGraphStore` | Cypher-speaking graph databases | Versioner procedures |
//!
//! # Capability Map
//!
//! | Capability | Methods |
//! |------------|---------|
//! | Create entity | `create_entity` |
//! | Patch entity | `patch_entity` |
//! | Relationships | `patch_entity` with relationship changes, `relationships` |
//! | Query by date | `state_at`, `states` |
//! | Diff | `diff_properties` |
//!
//! # Relationship versioning
//!
//! Relationships hang off states, not entities. Every new state copies the
//! relationship set of the state it supersedes and then applies the patch's
//! relationship changes, so a historical state keeps the edges that were
//! true while it was current.

use crate::Outcome;
use crate::Result;
use crate::models::{
    Entity, EntityId, PropertyDiff, PropertyMap, Relationship, RelationshipQuery, State, StateId,
    StatePatch, Timestamp,
};

/// Trait for versioned graph backends.
///
/// # Implementor Notes
///
/// - Methods use `&self` to enable sharing via `Arc<dyn GraphStore>`
/// - Each mutation must be atomic: a failed `patch_entity` leaves the
///   previous state current
/// - `create_entity` must be at-most-once per id even under concurrent calls
pub trait GraphStore: Send + Sync {
    /// Stores an entity together with its first state.
    ///
    /// Returns [`Outcome::Skipped`] if the id already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn create_entity(&self, entity: &Entity, properties: &PropertyMap) -> Result<Outcome<State>>;

    /// Retrieves an entity by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>>;

    /// Returns the state whose validity is open-ended.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn current_state(&self, id: &EntityId) -> Result<Option<State>>;

    /// Supersedes the current state with a patched copy valid from `at`.
    ///
    /// The new state's properties are the current ones with `patch.set`
    /// applied and `patch.remove` dropped. Its relationship set is the
    /// current one with `patch.relationships` applied.
    ///
    /// # Errors
    ///
    /// Returns [`crate::NotFound`] if the entity or its current state is
    /// missing and [`crate::Error::InvalidInput`] if `at` precedes the start
    /// of the current state.
    fn patch_entity(&self, id: &EntityId, patch: &StatePatch, at: Timestamp) -> Result<State>;

    /// Retrieves a state by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn state(&self, id: &StateId) -> Result<Option<State>>;

    /// Returns the whole state chain of an entity, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn states(&self, id: &EntityId) -> Result<Vec<State>>;

    /// Returns the state whose validity contains `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn state_at(&self, id: &EntityId, at: Timestamp) -> Result<Option<State>>;

    /// Returns the current states of entities whose kind is one of `kinds`
    /// (any kind when empty) and whose properties equal every `filter` entry.
    ///
    /// Soft-deleted states are included; callers apply their own policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn search_entities(&self, kinds: &[String], filter: &PropertyMap) -> Result<Vec<State>>;

    /// Returns relationships matching the query, one per carrying state.
    ///
    /// Honors `kind`, `from`, `to`, `filter`, `kind_a`, `kind_b` and
    /// `search_all_states`. Soft-delete filtering, deduplication and limits
    /// are left to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>>;

    /// Returns the relationship set carried by one state.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn state_relationships(&self, state: &StateId) -> Result<Vec<Relationship>>;

    /// Diffs the properties of two states.
    ///
    /// # Errors
    ///
    /// Returns [`crate::NotFound::State`] if either state is missing.
    fn diff_properties(&self, from: &StateId, to: &StateId) -> Result<Vec<PropertyDiff>>;

    /// Removes an entity, its states and every edge touching it.
    ///
    /// Returns `true` if the entity existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    fn destroy_entity(&self, id: &EntityId) -> Result<bool>;

    /// Removes all data.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation fails.
    fn clear(&self) -> Result<()>;
}
