//! Versioned graph types.
//!
//! An [`Entity`] is the stable identity of a real-world object: id, kind and
//! the immutable properties fixed at creation. Everything that changes lives
//! in [`State`] snapshots. Each state records the validity interval during
//! which it described the entity and a back-reference to the state it
//! superseded.
//!
//! Relationships hang off states rather than entities. Every new state copies
//! the relationship set of its predecessor, so asking "which edges did state X
//! have" answers "which edges existed while X was valid".
//!
//! ```text
//! (Entity) -[HAS_STATE {startDate, endDate}]-> (State) -[PREVIOUS]-> (State)
//!    |                                            |
//!    +-[CURRENT]-> (State)                        +-[KIND]-> (R) -[FOR]-> (Entity)
//! ```
//!
//! # Example
//!
//! ```rust
//! use versioned_kg::models::graph::{EntityId, RelationshipQuery};
//!
//! let query = RelationshipQuery::new()
//!     .with_kind("LIKES")
//!     .from(EntityId::new("jack"))
//!     .all_states();
//! assert!(query.search_all_states);
//! ```

use crate::models::temporal::{Timestamp, Validity};
use crate::models::value::{DELETED_KEY, PropertyMap, PropertyValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for an entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Creates a new entity ID from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the entity ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unique identifier for a state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(String);

impl StateId {
    /// Wraps an existing state ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new, time-ordered state ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("st_{}", uuid::Uuid::now_v7().simple()))
    }

    /// Returns the state ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The stable identity of a versioned object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique ID, never reused.
    pub id: EntityId,
    /// Ontology kind, fixed at creation.
    pub kind: String,
    /// Identity properties that never change.
    pub immutable: PropertyMap,
    /// Start of the first state's validity.
    pub created_at: Timestamp,
}

impl Entity {
    /// Creates an entity without immutable properties.
    #[must_use]
    pub fn new(id: EntityId, kind: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            id,
            kind: kind.into(),
            immutable: PropertyMap::new(),
            created_at,
        }
    }

    /// Adds an immutable property.
    #[must_use]
    pub fn with_immutable(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.immutable.insert(key.into(), value.into());
        self
    }
}

/// An immutable snapshot of an entity's mutable properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Snapshot ID.
    pub id: StateId,
    /// Owning entity.
    pub entity_id: EntityId,
    /// Kind of the owning entity.
    pub kind: String,
    /// Property values of this snapshot.
    pub properties: PropertyMap,
    /// Valid-time interval of the `HAS_STATE` edge.
    pub validity: Validity,
    /// Transaction time at which the snapshot was written.
    pub recorded_at: Timestamp,
    /// The state this one superseded.
    pub previous: Option<StateId>,
}

impl State {
    /// Returns `true` for the entity's current state.
    #[must_use]
    pub const fn is_current(&self) -> bool {
        self.validity.is_current()
    }

    /// Returns `true` if the snapshot carries `_deleted = true`.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        is_soft_deleted(&self.properties)
    }

    /// Returns a property value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Returns `true` if every filter entry equals the snapshot's value.
    #[must_use]
    pub fn matches(&self, filter: &PropertyMap) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.properties.get(key) == Some(value))
    }
}

/// Returns `true` if a property map carries `_deleted = true`.
#[must_use]
pub fn is_soft_deleted(properties: &PropertyMap) -> bool {
    properties
        .get(DELETED_KEY)
        .and_then(PropertyValue::as_bool)
        .unwrap_or(false)
}

/// A directed edge as seen from one state of its source entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Source entity.
    pub from: EntityId,
    /// Relationship kind.
    pub kind: String,
    /// Target entity.
    pub to: EntityId,
    /// Edge properties, including `_deleted`.
    pub properties: PropertyMap,
    /// Source state carrying the edge.
    pub state_id: StateId,
    /// Validity of the source state, or of the run of states a collapsed
    /// historical result stands for.
    pub validity: Validity,
}

impl Relationship {
    /// Returns `true` if the edge carries `_deleted = true`.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        is_soft_deleted(&self.properties)
    }

    /// Returns `true` if both edges join the same endpoints with the same kind.
    #[must_use]
    pub fn same_edge(&self, other: &Self) -> bool {
        self.from == other.from && self.kind == other.kind && self.to == other.to
    }
}

/// A change to the relationship set carried into a new state.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationshipChange {
    /// Add an edge.
    Create {
        /// Relationship kind.
        kind: String,
        /// Target entity.
        to: EntityId,
        /// Edge properties.
        properties: PropertyMap,
    },
    /// Drop an edge.
    Delete {
        /// Relationship kind.
        kind: String,
        /// Target entity.
        to: EntityId,
    },
    /// Merge new properties into an existing edge.
    Update {
        /// Relationship kind.
        kind: String,
        /// Target entity.
        to: EntityId,
        /// Properties to set.
        properties: PropertyMap,
    },
}

impl RelationshipChange {
    /// Target entity of the change.
    #[must_use]
    pub const fn to(&self) -> &EntityId {
        match self {
            Self::Create { to, .. } | Self::Delete { to, .. } | Self::Update { to, .. } => to,
        }
    }
}

/// Everything that distinguishes a new state from the current one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    /// Properties to set or override.
    pub set: PropertyMap,
    /// Property keys to drop from the new state.
    pub remove: Vec<String>,
    /// Edge changes applied to the copied relationship set.
    pub relationships: Vec<RelationshipChange>,
}

impl StatePatch {
    /// Creates an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets properties.
    #[must_use]
    pub fn with_set(mut self, set: PropertyMap) -> Self {
        self.set.extend(set);
        self
    }

    /// Removes property keys.
    #[must_use]
    pub fn with_removed(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.remove.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Appends a relationship change.
    #[must_use]
    pub fn with_relationship(mut self, change: RelationshipChange) -> Self {
        self.relationships.push(change);
        self
    }

    /// Applies the property part of the patch to a property map.
    #[must_use]
    pub fn apply_properties(&self, base: &PropertyMap) -> PropertyMap {
        let mut merged = base.clone();
        merged.extend(self.set.iter().map(|(k, v)| (k.clone(), v.clone())));
        for key in &self.remove {
            merged.remove(key);
        }
        merged
    }
}

/// Kind of change between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiffOp {
    /// Present only in the newer snapshot.
    Add,
    /// Present in both with different values.
    Update,
    /// Present only in the older snapshot.
    Remove,
}

impl DiffOp {
    /// Returns the operation name used by the versioner.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Remove => "REMOVE",
        }
    }

    /// Parses an operation name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ADD" => Some(Self::Add),
            "UPDATE" => Some(Self::Update),
            "REMOVE" => Some(Self::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One property-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDiff {
    /// Change kind.
    pub op: DiffOp,
    /// Property key.
    pub key: String,
    /// Value in the older snapshot.
    pub old: Option<PropertyValue>,
    /// Value in the newer snapshot.
    pub new: Option<PropertyValue>,
}

/// One relationship-level change, keyed by `(kind, target)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDiff {
    /// Change kind.
    pub op: DiffOp,
    /// Relationship kind.
    pub kind: String,
    /// Target entity.
    pub target: EntityId,
    /// Edge property changes, filled for `Update`.
    pub properties: Vec<PropertyDiff>,
}

/// Differences between two states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Property changes.
    pub properties: Vec<PropertyDiff>,
    /// Relationship changes.
    pub relationships: Vec<RelationshipDiff>,
}

impl StateDiff {
    /// Returns `true` if the two states are indistinguishable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.relationships.is_empty()
    }
}

/// Compares two property maps.
#[must_use]
pub fn diff_properties(old: &PropertyMap, new: &PropertyMap) -> Vec<PropertyDiff> {
    let mut diffs = Vec::new();
    for (key, old_value) in old {
        match new.get(key) {
            None => diffs.push(PropertyDiff {
                op: DiffOp::Remove,
                key: key.clone(),
                old: Some(old_value.clone()),
                new: None,
            }),
            Some(new_value) if new_value != old_value => diffs.push(PropertyDiff {
                op: DiffOp::Update,
                key: key.clone(),
                old: Some(old_value.clone()),
                new: Some(new_value.clone()),
            }),
            Some(_) => {},
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            diffs.push(PropertyDiff {
                op: DiffOp::Add,
                key: key.clone(),
                old: None,
                new: Some(new_value.clone()),
            });
        }
    }
    diffs
}

/// Set-compares the `(kind, target)` pairs reachable from two states.
///
/// Pairs on both sides produce an `Update` only when their properties differ.
#[must_use]
pub fn diff_relationships(old: &[Relationship], new: &[Relationship]) -> Vec<RelationshipDiff> {
    let key = |r: &Relationship| (r.kind.clone(), r.to.clone());
    let old_by_key: BTreeMap<_, _> = old.iter().map(|r| (key(r), r)).collect();
    let new_by_key: BTreeMap<_, _> = new.iter().map(|r| (key(r), r)).collect();

    let mut diffs = Vec::new();
    for ((kind, target), old_rel) in &old_by_key {
        match new_by_key.get(&(kind.clone(), target.clone())) {
            None => diffs.push(RelationshipDiff {
                op: DiffOp::Remove,
                kind: kind.clone(),
                target: target.clone(),
                properties: Vec::new(),
            }),
            Some(new_rel) => {
                let properties = diff_properties(&old_rel.properties, &new_rel.properties);
                if !properties.is_empty() {
                    diffs.push(RelationshipDiff {
                        op: DiffOp::Update,
                        kind: kind.clone(),
                        target: target.clone(),
                        properties,
                    });
                }
            },
        }
    }
    for (kind, target) in new_by_key.keys() {
        if !old_by_key.contains_key(&(kind.clone(), target.clone())) {
            diffs.push(RelationshipDiff {
                op: DiffOp::Add,
                kind: kind.clone(),
                target: target.clone(),
                properties: Vec::new(),
            });
        }
    }
    diffs
}

/// Query parameters for searching entities by their current state.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    /// Filter by kind.
    pub kind: Option<String>,
    /// Also match kinds descending from `kind`.
    pub include_descendants: bool,
    /// Exact-match property filter.
    pub filter: PropertyMap,
    /// Include soft-deleted entities.
    pub include_deleted: bool,
    /// Maximum results to return.
    pub limit: Option<usize>,
}

impl EntityQuery {
    /// Creates a new empty query.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kind: None,
            include_descendants: true,
            filter: PropertyMap::new(),
            include_deleted: false,
            limit: None,
        }
    }

    /// Filters by kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Matches only the exact kind, not its descendants.
    #[must_use]
    pub const fn exact_kind(mut self) -> Self {
        self.include_descendants = false;
        self
    }

    /// Adds an exact-match property filter.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    /// Includes soft-deleted entities.
    #[must_use]
    pub const fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Sets maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Query parameters for searching relationships.
#[derive(Debug, Clone, Default)]
pub struct RelationshipQuery {
    /// Filter by relationship kind.
    pub kind: Option<String>,
    /// Source entity.
    pub from: Option<EntityId>,
    /// Target entity.
    pub to: Option<EntityId>,
    /// Exact-match edge property filter.
    pub filter: PropertyMap,
    /// Source entity kind.
    pub kind_a: Option<String>,
    /// Target entity kind.
    pub kind_b: Option<String>,
    /// Traverse every `HAS_STATE` edge instead of only `CURRENT`.
    pub search_all_states: bool,
    /// Include soft-deleted edges and edges of soft-deleted entities.
    pub include_deleted: bool,
    /// Maximum results to return.
    pub limit: Option<usize>,
}

impl RelationshipQuery {
    /// Creates a new empty query.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kind: None,
            from: None,
            to: None,
            filter: PropertyMap::new(),
            kind_a: None,
            kind_b: None,
            search_all_states: false,
            include_deleted: false,
            limit: None,
        }
    }

    /// Filters by relationship kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Sets the source entity.
    #[must_use]
    pub fn from(mut self, id: EntityId) -> Self {
        self.from = Some(id);
        self
    }

    /// Sets the target entity.
    #[must_use]
    pub fn to(mut self, id: EntityId) -> Self {
        self.to = Some(id);
        self
    }

    /// Adds an exact-match edge property filter.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    /// Filters by endpoint kinds.
    #[must_use]
    pub fn with_endpoint_kinds(mut self, kind_a: Option<String>, kind_b: Option<String>) -> Self {
        self.kind_a = kind_a;
        self.kind_b = kind_b;
        self
    }

    /// Searches historical states as well as current ones.
    #[must_use]
    pub const fn all_states(mut self) -> Self {
        self.search_all_states = true;
        self
    }

    /// Includes soft-deleted edges.
    #[must_use]
    pub const fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Sets maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
