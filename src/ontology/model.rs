//! Relationship compatibility model.
//!
//! Maps a relationship kind to the ordered list of `(kind_a, kind_b,
//! properties)` triples it may connect. [`ANY_KIND`] on either side matches
//! every entity kind.

use crate::models::{DELETED_KEY, PropertyMap, PropertyType};
use crate::ontology::kind::PropertySpecs;
use crate::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Wildcard entity kind.
pub const ANY_KIND: &str = "All";

/// One allowed pairing of a relationship kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipTriple {
    /// Kind of the source entity, or [`ANY_KIND`].
    pub kind_a: String,
    /// Kind of the target entity, or [`ANY_KIND`].
    pub kind_b: String,
    /// Properties an edge of this pairing may carry.
    #[serde(default)]
    pub properties: PropertySpecs,
}

impl RelationshipTriple {
    fn allows(&self, kind_a: &str, kind_b: &str) -> bool {
        (self.kind_a == kind_a || self.kind_a == ANY_KIND)
            && (self.kind_b == kind_b || self.kind_b == ANY_KIND)
    }
}

/// Relationship kind to its allowed triples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipModel {
    relationships: BTreeMap<String, Vec<RelationshipTriple>>,
}

impl RelationshipModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the relationship kind has at least one triple.
    #[must_use]
    pub fn contains(&self, relationship: &str) -> bool {
        self.relationships.contains_key(relationship)
    }

    /// Returns the triples of a relationship kind.
    #[must_use]
    pub fn triples(&self, relationship: &str) -> &[RelationshipTriple] {
        self.relationships
            .get(relationship)
            .map_or(&[], Vec::as_slice)
    }

    /// Appends a triple.
    ///
    /// Returns `false` without changing anything when the `(kind_a, kind_b)`
    /// pair is already registered for this relationship kind.
    pub fn add(
        &mut self,
        kind_a: &str,
        relationship: &str,
        kind_b: &str,
        properties: PropertySpecs,
    ) -> bool {
        let triples = self.relationships.entry(relationship.to_string()).or_default();
        if triples
            .iter()
            .any(|t| t.kind_a == kind_a && t.kind_b == kind_b)
        {
            return false;
        }
        triples.push(RelationshipTriple {
            kind_a: kind_a.to_string(),
            kind_b: kind_b.to_string(),
            properties,
        });
        true
    }

    /// Removes every triple mentioning the kind on either side.
    ///
    /// Relationship kinds left without triples are dropped.
    pub fn forget_kind(&mut self, kind: &str) {
        for triples in self.relationships.values_mut() {
            triples.retain(|t| t.kind_a != kind && t.kind_b != kind);
        }
        self.relationships.retain(|_, triples| !triples.is_empty());
    }

    /// Checks that an edge of `relationship` may join `kind_a` to `kind_b`
    /// carrying `properties`.
    ///
    /// The pairing is accepted if any triple allows it. Each property is
    /// then checked against every triple of the relationship kind, not just
    /// the matching ones, so a key must be declared with the same type on all
    /// of them. `_deleted` is accepted as a boolean on every edge.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate(
        &self,
        kind_a: &str,
        relationship: &str,
        kind_b: &str,
        properties: &PropertyMap,
    ) -> Result<(), ValidationError> {
        let triples = self
            .relationships
            .get(relationship)
            .ok_or_else(|| ValidationError::UnknownRelationshipKind(relationship.to_string()))?;

        if !triples.iter().any(|t| t.allows(kind_a, kind_b)) {
            return Err(ValidationError::IncompatibleRelationship {
                kind_a: kind_a.to_string(),
                relationship: relationship.to_string(),
                kind_b: kind_b.to_string(),
            });
        }

        for (key, value) in properties {
            if key == DELETED_KEY && value.property_type() == PropertyType::Bool {
                continue;
            }
            for triple in triples {
                let spec = triple.properties.get(key).ok_or_else(|| {
                    ValidationError::UnknownProperty {
                        kind: relationship.to_string(),
                        property: key.clone(),
                    }
                })?;
                if spec.property_type != value.property_type() {
                    return Err(ValidationError::TypeMismatch {
                        kind: relationship.to_string(),
                        property: key.clone(),
                        expected: spec.property_type.to_string(),
                        found: value.property_type().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Renders one line per triple: `(A)-[REL {props}]->(B)`.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (relationship, triples) in &self.relationships {
            for triple in triples {
                let props = triple
                    .properties
                    .iter()
                    .map(|(name, spec)| format!("{name}: {}", spec.property_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = writeln!(
                    out,
                    "({})-[{relationship} {{{props}}}]->({})",
                    triple.kind_a, triple.kind_b
                );
            }
        }
        out
    }
}
