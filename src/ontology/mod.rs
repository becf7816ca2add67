//! Ontology registry.
//!
//! The registry owns two structures, the [`KindTree`] and the
//! [`RelationshipModel`], and validates every mutation of the graph against
//! them before it reaches storage.
//!
//! # Persistence
//!
//! Both structures are persisted through an [`OntologyStore`] as whole
//! documents. Mutations run as a single-writer load/mutate/save cycle under
//! one lock: the change is applied to a copy, the copy is saved, and only a
//! successful save replaces the in-memory structure.
//!
//! # Evolution policy
//!
//! | Situation | Behavior |
//! |-----------|----------|
//! | Parent kind missing | Created under `Kind`, logged as a warning |
//! | Kind already exists | [`Outcome::Skipped`], logged as info |
//! | Pair already in the relationship model | [`Outcome::Skipped`], logged as info |
//! | Child redeclares an inherited key | Inherited declaration kept, logged as a warning |

pub mod kind;
pub mod model;
pub mod store;

pub use kind::{KindNode, KindTree, PropertySpec, PropertySpecs, ROOT_KIND};
pub use model::{ANY_KIND, RelationshipModel, RelationshipTriple};
pub use store::{InMemoryOntologyStore, JsonFileOntologyStore, OntologyStore};

use crate::models::{PropertyMap, PropertyType, PropertyValue};
use crate::query::sanitize;
use crate::{Conflict, Error, NotFound, Outcome, Result, ValidationError};
use kind::Insertion;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
struct OntologyState {
    kinds: KindTree,
    model: RelationshipModel,
}

/// Validates kinds, properties and relationship pairings.
pub struct OntologyRegistry {
    store: Arc<dyn OntologyStore>,
    state: Mutex<OntologyState>,
}

impl std::fmt::Debug for OntologyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OntologyRegistry").finish_non_exhaustive()
    }
}

fn normalize_kind(raw: &str) -> Result<String> {
    let kind = sanitize::identifier(raw);
    if kind.is_empty() {
        return Err(Error::InvalidInput(format!("empty kind name: {raw:?}")));
    }
    Ok(kind)
}

fn parse_specs(names: &[impl AsRef<str>], types: &[impl AsRef<str>]) -> Result<PropertySpecs> {
    if names.len() != types.len() {
        return Err(ValidationError::LengthMismatch {
            keys: names.len(),
            values: types.len(),
        }
        .into());
    }
    names
        .iter()
        .zip(types)
        .map(|(name, ty)| {
            let property_type: PropertyType = ty.as_ref().parse()?;
            Ok((sanitize::identifier(name.as_ref()), PropertySpec::new(property_type)))
        })
        .collect()
}

fn check_properties(
    kinds: &KindTree,
    kind: &str,
    properties: &PropertyMap,
) -> std::result::Result<(), ValidationError> {
    let declared = kinds
        .effective_properties(kind)
        .ok_or_else(|| ValidationError::UnknownKind(kind.to_string()))?;
    for (key, value) in properties {
        let spec = declared
            .get(key)
            .ok_or_else(|| ValidationError::UnknownProperty {
                kind: kind.to_string(),
                property: key.clone(),
            })?;
        if spec.property_type != value.property_type() {
            return Err(ValidationError::TypeMismatch {
                kind: kind.to_string(),
                property: key.clone(),
                expected: spec.property_type.to_string(),
                found: value.property_type().to_string(),
            });
        }
    }
    Ok(())
}

impl OntologyRegistry {
    /// Opens a registry over a store, starting from empty structures when
    /// nothing was saved yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a saved document cannot be read.
    pub fn open(store: Arc<dyn OntologyStore>) -> Result<Self> {
        let kinds = store.load_kinds()?.unwrap_or_default();
        let model = store.load_model()?.unwrap_or_default();
        Ok(Self {
            store,
            state: Mutex::new(OntologyState { kinds, model }),
        })
    }

    /// Creates a registry that persists nothing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryOntologyStore::new()),
            state: Mutex::new(OntologyState {
                kinds: KindTree::new(),
                model: RelationshipModel::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OntologyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Ontology registry mutex was poisoned, recovering");
                metrics::counter!("ontology_registry_mutex_poison_recovery_total").increment(1);
                poisoned.into_inner()
            },
        }
    }

    /// Adds a kind under `parent` (the root when `None`).
    ///
    /// `names` and `types` are parallel lists; types use the declaration names
    /// of [`PropertyType::parse`].
    ///
    /// # Errors
    ///
    /// Returns an error for mismatched lists, unknown type names, empty kind
    /// names or a failed save.
    pub fn create_entity_kind(
        &self,
        kind: &str,
        parent: Option<&str>,
        names: &[impl AsRef<str>],
        types: &[impl AsRef<str>],
    ) -> Result<Outcome<()>> {
        let specs = parse_specs(names, types)?;
        self.create_entity_kind_with_specs(kind, parent, specs)
    }

    /// Adds a kind with fully specified properties.
    ///
    /// # Errors
    ///
    /// Returns an error for empty kind names, a kind naming itself as parent,
    /// or a failed save.
    #[instrument(skip(self, properties), fields(kind = %kind))]
    pub fn create_entity_kind_with_specs(
        &self,
        kind: &str,
        parent: Option<&str>,
        properties: PropertySpecs,
    ) -> Result<Outcome<()>> {
        let kind = normalize_kind(kind)?;
        let parent = parent.map_or(Ok(ROOT_KIND.to_string()), normalize_kind)?;
        if kind == parent {
            return Err(Error::InvalidInput(format!("kind '{kind}' cannot be its own parent")));
        }

        let mut state = self.lock();
        let mut kinds = state.kinds.clone();
        match kinds.insert(&kind, &parent, properties) {
            Insertion::Duplicate => {
                info!(kind = %kind, "Kind exists in the ontology, no new kind has been created");
                Ok(Outcome::Skipped(Conflict::DuplicateKind(kind)))
            },
            Insertion::Created {
                auto_created,
                shadowed,
            } => {
                for missing in &auto_created {
                    warn!(parent = %missing, "Parent kind was not in the ontology, added as a child of '{ROOT_KIND}'");
                }
                if !shadowed.is_empty() {
                    warn!(kind = %kind, properties = ?shadowed, "Inherited declarations kept for redeclared properties");
                }
                self.store.save_kinds(&kinds)?;
                state.kinds = kinds;
                info!(kind = %kind, parent = %parent, "Kind created");
                Ok(Outcome::Applied(()))
            },
        }
    }

    /// Adds or replaces properties on an existing kind.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Kind`] if the kind is absent.
    pub fn create_entity_kind_properties(
        &self,
        kind: &str,
        names: &[impl AsRef<str>],
        types: &[impl AsRef<str>],
    ) -> Result<()> {
        let specs = parse_specs(names, types)?;
        self.create_entity_kind_properties_with_specs(kind, specs)
    }

    /// Adds or replaces fully specified properties on an existing kind.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Kind`] if the kind is absent.
    pub fn create_entity_kind_properties_with_specs(
        &self,
        kind: &str,
        properties: PropertySpecs,
    ) -> Result<()> {
        let kind = normalize_kind(kind)?;
        let mut state = self.lock();
        let mut kinds = state.kinds.clone();
        if !kinds.extend_properties(&kind, properties) {
            return Err(NotFound::Kind(kind).into());
        }
        self.store.save_kinds(&kinds)?;
        state.kinds = kinds;
        Ok(())
    }

    /// Removes a property declared on the kind itself.
    ///
    /// Returns `false` if the kind did not declare it.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Kind`] if the kind is absent.
    pub fn delete_property_kind(&self, kind: &str, name: &str) -> Result<bool> {
        let kind = normalize_kind(kind)?;
        let mut state = self.lock();
        let mut kinds = state.kinds.clone();
        let removed = kinds
            .remove_property(&kind, name)
            .ok_or_else(|| NotFound::Kind(kind.clone()))?;
        if removed {
            self.store.save_kinds(&kinds)?;
            state.kinds = kinds;
        }
        Ok(removed)
    }

    /// Removes a kind and its subtree, plus relationship triples naming them.
    ///
    /// Returns the removed kinds.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Kind`] for an unknown kind and
    /// [`Error::InvalidInput`] for the root.
    pub fn delete_entity_kind(&self, kind: &str) -> Result<Vec<String>> {
        let kind = normalize_kind(kind)?;
        if kind == ROOT_KIND {
            return Err(Error::InvalidInput("the root kind cannot be deleted".to_string()));
        }
        let mut state = self.lock();
        let mut kinds = state.kinds.clone();
        let removed = kinds
            .remove(&kind)
            .ok_or_else(|| NotFound::Kind(kind.clone()))?;
        let mut model = state.model.clone();
        for name in &removed {
            model.forget_kind(name);
        }
        self.store.save_kinds(&kinds)?;
        self.store.save_model(&model)?;
        state.kinds = kinds;
        state.model = model;
        info!(kind = %kind, removed = removed.len(), "Kind removed from the ontology");
        Ok(removed)
    }

    /// Checks parallel key/value lists against a kind's effective properties.
    ///
    /// Fails closed: one bad key rejects the whole batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first violation.
    pub fn are_valid_entity_kind_properties(
        &self,
        keys: &[impl AsRef<str>],
        values: &[PropertyValue],
        kind: &str,
    ) -> Result<()> {
        let properties = crate::models::zip_properties(keys, values.to_vec())?;
        self.validate_entity_properties(kind, &properties)
    }

    /// Checks a property map against a kind's effective properties.
    ///
    /// Every key must be declared on the kind or an ancestor, and the value's
    /// type must equal the declared type exactly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first violation.
    pub fn validate_entity_properties(&self, kind: &str, properties: &PropertyMap) -> Result<()> {
        let state = self.lock();
        check_properties(&state.kinds, kind, properties).map_err(|e| {
            warn!(kind = %kind, error = %e, "Entity properties rejected by the ontology");
            Error::from(e)
        })
    }

    /// Registers a `(kind_a, kind_b, properties)` triple for a relationship kind.
    ///
    /// # Errors
    ///
    /// Returns an error for empty names or a failed save.
    #[instrument(skip(self, properties))]
    pub fn create_relationship_kind(
        &self,
        kind_a: &str,
        relationship: &str,
        kind_b: &str,
        properties: PropertySpecs,
    ) -> Result<Outcome<()>> {
        let kind_a = normalize_kind(kind_a)?;
        let kind_b = normalize_kind(kind_b)?;
        let relationship = normalize_kind(relationship)?;

        let mut state = self.lock();
        let mut model = state.model.clone();
        if !model.add(&kind_a, &relationship, &kind_b, properties) {
            info!(
                "Relationship ({kind_a}, {relationship}, {kind_b}) is already in the data model"
            );
            return Ok(Outcome::Skipped(Conflict::DuplicateRelationshipModel {
                kind_a,
                relationship,
                kind_b,
            }));
        }
        self.store.save_model(&model)?;
        state.model = model;
        info!("Relationship ({kind_a}, {relationship}, {kind_b}) added to the data model");
        Ok(Outcome::Applied(()))
    }

    /// Checks a relationship against the relationship model, with properties
    /// given as parallel lists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first violation.
    pub fn is_valid_relationship_model(
        &self,
        kind_a: &str,
        relationship: &str,
        kind_b: &str,
        keys: &[impl AsRef<str>],
        values: &[PropertyValue],
    ) -> Result<()> {
        let properties = crate::models::zip_properties(keys, values.to_vec())?;
        self.validate_relationship(kind_a, relationship, kind_b, &properties)
    }

    /// Checks a relationship against the relationship model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first violation.
    pub fn validate_relationship(
        &self,
        kind_a: &str,
        relationship: &str,
        kind_b: &str,
        properties: &PropertyMap,
    ) -> Result<()> {
        let state = self.lock();
        state
            .model
            .validate(kind_a, relationship, kind_b, properties)
            .map_err(|e| {
                warn!(relationship = %relationship, error = %e, "Relationship rejected by the ontology");
                Error::from(e)
            })
    }

    /// Returns `true` if the kind exists.
    pub fn has_kind(&self, kind: &str) -> bool {
        self.lock().kinds.contains(kind)
    }

    /// Returns `true` if the relationship kind has at least one triple.
    pub fn has_relationship_kind(&self, relationship: &str) -> bool {
        self.lock().model.contains(relationship)
    }

    /// Returns every kind below `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Kind`] for an unknown kind.
    pub fn get_descendant_kinds(&self, kind: &str) -> Result<Vec<String>> {
        let state = self.lock();
        if !state.kinds.contains(kind) {
            return Err(NotFound::Kind(kind.to_string()).into());
        }
        Ok(state.kinds.descendants(kind))
    }

    /// Returns own and inherited properties of a kind.
    pub fn get_kind_properties(&self, kind: &str) -> Option<PropertySpecs> {
        self.lock().kinds.effective_properties(kind)
    }

    /// Returns a snapshot of the kind tree.
    pub fn kind_tree(&self) -> KindTree {
        self.lock().kinds.clone()
    }

    /// Returns a snapshot of the relationship model.
    pub fn relationship_model(&self) -> RelationshipModel {
        self.lock().model.clone()
    }

    /// Renders the kind tree.
    pub fn render_hierarchy(&self, with_properties: bool) -> String {
        self.lock().kinds.render(with_properties)
    }

    /// Renders the relationship model.
    pub fn render_data_model(&self) -> String {
        self.lock().model.render()
    }

    /// Resets both structures to empty and saves them.
    ///
    /// # Errors
    ///
    /// Returns an error if a save fails.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock();
        let kinds = KindTree::new();
        let model = RelationshipModel::new();
        self.store.save_kinds(&kinds)?;
        self.store.save_model(&model)?;
        state.kinds = kinds;
        state.model = model;
        Ok(())
    }
}
