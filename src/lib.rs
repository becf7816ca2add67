//! # Versioned KG
//!
//! A knowledge-graph access layer with bitemporal versioning of entities and
//! relationships, guarded by a typed, inheritable ontology.
//!
//! Every entity owns a chain of immutable state snapshots. Each snapshot is
//! attached to the entity through a validity interval `[start, end)`, and the
//! intervals of one entity partition time. Property and relationship mutations
//! never rewrite a state: they close the current interval and open a new one.
//!
//! ## Layout
//!
//! - [`query`]: parameterized Cypher fragments and identifier sanitization
//! - [`ontology`]: kind-inheritance tree and relationship compatibility model
//! - [`storage`]: the [`storage::GraphStore`] capability trait and its adapters,
//!   the id index and the full-text entity index
//! - [`services`]: [`services::VersionedGraph`], the public state machine
//! - [`ingest`]: connector mapping external change records onto the graph
//!
//! ## Example
//!
//! ```rust,ignore
//! use versioned_kg::services::VersionedGraph;
//! use versioned_kg::models::{EntityId, PropertyMap};
//!
//! let graph = VersionedGraph::in_memory()?;
//! graph.ontology().create_entity_kind("User", None, &["name"], &["str"])?;
//! let outcome = graph.create_entity("User", &EntityId::new("jack"), props, None)?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod config;
pub mod ingest;
pub mod models;
pub mod observability;
pub mod ontology;
pub mod query;
pub mod services;
pub mod storage;

pub use config::KgConfig;
pub use models::{
    Entity, EntityId, PropertyMap, PropertyType, PropertyValue, Relationship, State, StateDiff,
    StateId, Timestamp,
};
pub use ontology::OntologyRegistry;
pub use services::VersionedGraph;
pub use storage::{EntityIndex, GraphStore, IdIndex};

/// Error type for knowledge graph operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Malformed records, unparsable dates, empty identifiers |
/// | `Validation` | Ontology rejects a kind, property, type or relationship pairing |
/// | `NotFound` | Unknown entity, missing current state, no state at a date |
/// | `Timeout` | The backing store stayed busy past the configured timeout |
/// | `OperationFailed` | I/O, transaction or transport failures in a backing store |
///
/// Duplicate creations are not errors; see [`Outcome`].
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - An ingestion record is not a JSON object or lacks `Id`/`Kind`
    /// - A date string cannot be parsed
    /// - A property type name is not recognised
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The ontology rejected a write before it reached storage.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The addressed entity, state or kind does not exist.
    #[error("not found: {0}")]
    NotFound(#[from] NotFound),

    /// The backing store did not answer within the configured timeout.
    ///
    /// Raised when:
    /// - `SQLite` returns `SQLITE_BUSY` after `busy_timeout` elapsed
    /// - A Cypher executor reports a timed out transaction
    #[error("operation '{operation}' timed out")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// An operation failed.
    ///
    /// Raised when:
    /// - `SQLite` database operations fail
    /// - Filesystem I/O errors occur on the ontology or id index files
    /// - A Cypher executor reports a transport or transaction error
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

/// Reasons the ontology rejects a mutation.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ValidationError {
    /// The kind is not registered in the kind tree.
    #[error("kind '{0}' is not in the ontology")]
    UnknownKind(String),

    /// The property is not declared on the kind or any of its ancestors.
    #[error("property '{property}' is not declared for kind '{kind}'")]
    UnknownProperty {
        /// Kind the property was checked against.
        kind: String,
        /// Offending property key.
        property: String,
    },

    /// The value's type differs from the declared type.
    #[error("property '{property}' of kind '{kind}' expects {expected}, got {found}")]
    TypeMismatch {
        /// Kind (or relationship kind) that declares the property.
        kind: String,
        /// Offending property key.
        property: String,
        /// Declared type name.
        expected: String,
        /// Type name of the supplied value.
        found: String,
    },

    /// The relationship kind has no entry in the relationship model.
    #[error("relationship kind '{0}' is not in the data model")]
    UnknownRelationshipKind(String),

    /// No registered triple allows this pairing.
    #[error("relationship '{kind_a}' -[{relationship}]-> '{kind_b}' is not allowed")]
    IncompatibleRelationship {
        /// Kind of the source entity.
        kind_a: String,
        /// Relationship kind.
        relationship: String,
        /// Kind of the target entity.
        kind_b: String,
    },

    /// Parallel key and value lists differ in length.
    #[error("got {keys} keys but {values} values")]
    LengthMismatch {
        /// Number of keys.
        keys: usize,
        /// Number of values.
        values: usize,
    },
}

/// Things that were looked up and did not exist.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum NotFound {
    /// No entity with this id.
    #[error("entity '{0}'")]
    Entity(String),

    /// The entity exists but has no state marked current.
    #[error("entity '{0}' has no current state")]
    NoCurrentState(String),

    /// No state of the entity was valid at the given instant.
    #[error("entity '{id}' has no state valid at {at}")]
    NoStateAt {
        /// Entity id.
        id: String,
        /// Inspected instant, formatted.
        at: String,
    },

    /// No state with this id.
    #[error("state '{0}'")]
    State(String),

    /// No kind with this name.
    #[error("kind '{0}'")]
    Kind(String),

    /// A relationship endpoint does not exist.
    #[error("relationship endpoint '{0}'")]
    Endpoint(String),

    /// No current relationship matches.
    #[error("relationship '{from}' -[{kind}]-> '{to}'")]
    Relationship {
        /// Source entity id.
        from: String,
        /// Relationship kind.
        kind: String,
        /// Target entity id.
        to: String,
    },
}

/// A creation that was skipped because its subject already existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// An entity with this id already exists.
    DuplicateId(String),
    /// The current state already carries this relationship.
    DuplicateRelationship {
        /// Source entity id.
        from: String,
        /// Relationship kind.
        kind: String,
        /// Target entity id.
        to: String,
    },
    /// The kind is already in the kind tree.
    DuplicateKind(String),
    /// The `(kind_a, kind_b)` pair is already registered for this relationship kind.
    DuplicateRelationshipModel {
        /// Kind of the source entity.
        kind_a: String,
        /// Relationship kind.
        relationship: String,
        /// Kind of the target entity.
        kind_b: String,
    },
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "entity '{id}' already exists"),
            Self::DuplicateRelationship { from, kind, to } => {
                write!(f, "relationship '{from}' -[{kind}]-> '{to}' already exists")
            },
            Self::DuplicateKind(kind) => write!(f, "kind '{kind}' already exists"),
            Self::DuplicateRelationshipModel {
                kind_a,
                relationship,
                kind_b,
            } => write!(
                f,
                "relationship model '{kind_a}' -[{relationship}]-> '{kind_b}' already exists"
            ),
        }
    }
}

/// Result of a mutation that tolerates replays.
///
/// `Applied` carries what was written; `Skipped` says nothing happened
/// because the subject was already there. Errors cover everything else.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Outcome<T> {
    /// The mutation was written.
    Applied(T),
    /// Nothing was written because of a conflict.
    Skipped(Conflict),
}

impl<T> Outcome<T> {
    /// Returns `true` if the mutation was written.
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Returns the written value, if any.
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Skipped(_) => None,
        }
    }

    /// Returns the conflict, if the mutation was skipped.
    pub const fn conflict(&self) -> Option<&Conflict> {
        match self {
            Self::Applied(_) => None,
            Self::Skipped(conflict) => Some(conflict),
        }
    }

    /// Maps the applied value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Applied(value) => Outcome::Applied(f(value)),
            Self::Skipped(conflict) => Outcome::Skipped(conflict),
        }
    }
}

/// Result type alias for knowledge graph operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Builds an [`Error::OperationFailed`] from any displayable cause.
    pub fn failed(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Returns `true` for validation failures.
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns `true` for not-found conditions.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");

        let err = Error::from(ValidationError::UnknownProperty {
            kind: "User".to_string(),
            property: "weight".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "validation failed: property 'weight' is not declared for kind 'User'"
        );

        let err = Error::from(NotFound::NoCurrentState("jack".to_string()));
        assert_eq!(err.to_string(), "not found: entity 'jack' has no current state");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::from(ValidationError::UnknownKind("X".into())).is_validation());
        assert!(Error::from(NotFound::Entity("x".into())).is_not_found());
        assert!(!Error::failed("op", "boom").is_not_found());
    }

    #[test]
    fn test_outcome_accessors() {
        let applied: Outcome<u8> = Outcome::Applied(3);
        assert!(applied.is_applied());
        assert_eq!(applied.map(|v| v * 2).applied(), Some(6));

        let skipped: Outcome<u8> = Outcome::Skipped(Conflict::DuplicateId("a".into()));
        assert!(!skipped.is_applied());
        assert_eq!(skipped.conflict(), Some(&Conflict::DuplicateId("a".into())));
        assert_eq!(
            Conflict::DuplicateKind("User".into()).to_string(),
            "kind 'User' already exists"
        );
    }
}
