//! Entity index traits.
//!
//! Two secondary indexes sit next to the graph store:
//!
//! | Trait | Purpose | System of record? |
//! |-------|---------|-------------------|
//! | [`IdIndex`] | Every id ever created, for at-most-once creation | Yes, for id reservation |
//! | [`EntityIndex`] | Per-user substring lookup of entity names | No; may be dropped and rebuilt |
//!
//! ## Consistency with the Graph Store
//!
//! The entity index is a **derived view**. Losing it loses no graph data;
//! re-run `add_entities` over the entities to rebuild it.

use crate::Result;
use crate::models::EntityId;

/// Tag used for the one canonical name row per entity and user.
pub const NAME_TAG: &str = "name";

/// Trait for id reservation.
///
/// Ids are never reused: an id stays reserved after its entity is destroyed.
///
/// # Implementor Notes
///
/// - `insert_if_absent` must be a single critical section so that two
///   concurrent callers with the same id cannot both see `true`
pub trait IdIndex: Send + Sync {
    /// Returns `true` if the id was ever reserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn contains(&self, id: &EntityId) -> Result<bool>;

    /// Reserves an id, returning `false` if it was already reserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the reservation cannot be persisted.
    fn insert_if_absent(&self, id: &EntityId) -> Result<bool>;

    /// Lists reserved ids in reservation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn ids(&self) -> Result<Vec<EntityId>>;

    /// Forgets every reservation.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation fails.
    fn clear(&self) -> Result<()>;
}

/// Trait for the per-user substring index.
///
/// # Implementor Notes
///
/// - Methods use `&self` to enable sharing via `Arc<dyn EntityIndex>`
/// - Keep at most one [`NAME_TAG`] row per entity and user
pub trait EntityIndex: Send + Sync {
    /// Indexes parallel lists of substrings, entity ids and tags for a user.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ValidationError::LengthMismatch`] if the lists differ
    /// in length, or an error if the write fails.
    fn add_entities(
        &self,
        user_id: &str,
        substrings: &[String],
        ids: &[EntityId],
        tags: &[String],
    ) -> Result<()>;

    /// Returns the ids of entities indexed under `substring` for a user,
    /// optionally restricted to one tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails.
    fn search(&self, user_id: &str, substring: &str, tag: Option<&str>) -> Result<Vec<EntityId>>;

    /// Drops every entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation fails.
    fn drop_index(&self) -> Result<()>;
}
