//! Versioned graph service.
//!
//! [`VersionedGraph`] is the public state machine. It validates every write
//! against the [`OntologyRegistry`], serializes read-current-then-write
//! sequences per entity, reserves ids in the [`IdIndex`] and delegates
//! storage to a [`GraphStore`].
//!
//! # Example
//!
//! ```rust,ignore
//! use versioned_kg::services::VersionedGraph;
//! use versioned_kg::models::{EntityId, PropertyMap};
//!
//! let graph = VersionedGraph::in_memory()?;
//! graph.ontology().create_entity_kind("User", None, &["height"], &["int"])?;
//!
//! let jack = EntityId::new("User/Jack");
//! let mut props = PropertyMap::new();
//! props.insert("height".into(), 180.into());
//! graph.create_entity("User", &jack, props, None)?;
//! graph.create_or_update_property(&jack, "height", 175.into(), None)?;
//! ```

use crate::config::KgConfig;
use crate::models::{
    DELETED_KEY, Entity, EntityId, EntityQuery, PropertyMap, PropertyValue, Relationship,
    RelationshipChange, RelationshipQuery, State, StateDiff, StateId, StatePatch, Timestamp,
    diff_relationships, format_timestamp, temporal, zip_properties,
};
use crate::ontology::{JsonFileOntologyStore, OntologyRegistry};
use crate::query::sanitize;
use crate::storage::{
    FileIdIndex, GraphStore, IdIndex, InMemoryIdIndex, SqliteGraphStore,
};
use crate::{Conflict, Error, NotFound, Outcome, Result, ValidationError};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, instrument, warn};

const LOCK_STRIPES: usize = 64;

/// Striped per-entity locks.
///
/// Ids hash onto a fixed set of mutexes, so two entities may share a stripe
/// but one entity always maps to the same one.
struct EntityLocks {
    stripes: Vec<Mutex<()>>,
}

impl EntityLocks {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, id: &EntityId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let len = self.stripes.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() % len) as usize;
        match self.stripes[index].lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Entity lock was poisoned, recovering");
                metrics::counter!("kg_entity_lock_poison_recovery_total").increment(1);
                poisoned.into_inner()
            },
        }
    }
}

/// High-level service for versioned knowledge graph operations.
///
/// # Thread Safety
///
/// All methods take `&self`. Mutations of one entity are serialized by a
/// striped lock keyed by the entity id; the stores serialize their own
/// transactions.
pub struct VersionedGraph {
    store: Arc<dyn GraphStore>,
    ontology: Arc<OntologyRegistry>,
    ids: Arc<dyn IdIndex>,
    locks: EntityLocks,
}

impl VersionedGraph {
    /// Creates a service over explicit components.
    #[must_use]
    pub fn new(
        store: Arc<dyn GraphStore>,
        ontology: Arc<OntologyRegistry>,
        ids: Arc<dyn IdIndex>,
    ) -> Self {
        Self {
            store,
            ontology,
            ids,
            locks: EntityLocks::new(LOCK_STRIPES),
        }
    }

    /// Creates a service that keeps everything in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(
            Arc::new(SqliteGraphStore::in_memory()?),
            Arc::new(OntologyRegistry::in_memory()),
            Arc::new(InMemoryIdIndex::new()),
        ))
    }

    /// Opens every component named by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a database, ontology document or id log cannot be
    /// opened.
    pub fn open(config: &KgConfig) -> Result<Self> {
        let store: Arc<dyn GraphStore> = match &config.storage.path {
            Some(path) => Arc::new(SqliteGraphStore::with_busy_timeout(
                path,
                config.timeouts.busy_timeout,
            )?),
            None => Arc::new(SqliteGraphStore::in_memory()?),
        };
        let ontology = match &config.ontology.dir {
            Some(dir) => OntologyRegistry::open(Arc::new(JsonFileOntologyStore::in_dir(dir)))?,
            None => OntologyRegistry::in_memory(),
        };
        let ids: Arc<dyn IdIndex> = match &config.id_index.path {
            Some(path) => Arc::new(FileIdIndex::open(path)?),
            None => Arc::new(InMemoryIdIndex::new()),
        };
        Ok(Self::new(store, Arc::new(ontology), ids))
    }

    /// Returns the ontology registry.
    #[must_use]
    pub fn ontology(&self) -> &OntologyRegistry {
        &self.ontology
    }

    /// Returns the backing store.
    #[must_use]
    pub fn store(&self) -> &dyn GraphStore {
        self.store.as_ref()
    }

    /// Returns the id index.
    #[must_use]
    pub fn id_index(&self) -> &dyn IdIndex {
        self.ids.as_ref()
    }

    // =========================================================================
    // Entity Operations
    // =========================================================================

    /// Creates an entity with its first state.
    ///
    /// `_deleted: false` is added to the properties. The first state is valid
    /// from `created_at`, or now.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown kind or a property the kind
    /// does not declare. A known id is not an error: it yields
    /// [`Outcome::Skipped`] with [`Conflict::DuplicateId`].
    pub fn create_entity(
        &self,
        kind: &str,
        id: &EntityId,
        properties: PropertyMap,
        created_at: Option<Timestamp>,
    ) -> Result<Outcome<State>> {
        self.create_entity_with_immutable(kind, id, PropertyMap::new(), properties, created_at)
    }

    /// Creates an entity whose `immutable` properties live on the entity
    /// itself and never change.
    ///
    /// # Errors
    ///
    /// See [`Self::create_entity`].
    #[instrument(skip(self, immutable, properties), fields(entity_id = %id, kind = %kind))]
    pub fn create_entity_with_immutable(
        &self,
        kind: &str,
        id: &EntityId,
        immutable: PropertyMap,
        properties: PropertyMap,
        created_at: Option<Timestamp>,
    ) -> Result<Outcome<State>> {
        if id.as_str().trim().is_empty() {
            return Err(Error::InvalidInput("entity id is empty".to_string()));
        }
        let kind = sanitize::identifier(kind);
        if !self.ontology.has_kind(&kind) {
            return Err(ValidationError::UnknownKind(kind).into());
        }
        let immutable = sanitize::keys(&immutable);
        let mut properties = sanitize::keys(&properties);
        properties.insert(DELETED_KEY.to_string(), PropertyValue::Bool(false));

        let mut declared = immutable.clone();
        declared.extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.ontology.validate_entity_properties(&kind, &declared)?;

        let _guard = self.locks.lock(id);
        if self.ids.contains(id)? {
            info!("Entity {id} already exists");
            return Ok(Outcome::Skipped(Conflict::DuplicateId(id.to_string())));
        }
        let entity = Entity {
            id: id.clone(),
            kind,
            immutable,
            created_at: created_at.unwrap_or_else(temporal::now),
        };
        let outcome = self.store.create_entity(&entity, &properties)?;
        self.ids.insert_if_absent(id)?;

        match &outcome {
            Outcome::Applied(_) => {
                metrics::counter!("kg_states_created_total").increment(1);
                info!("Entity {id} created");
            },
            Outcome::Skipped(conflict) => info!("{conflict}"),
        }
        Ok(outcome)
    }

    /// Creates a batch of entities, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::LengthMismatch`] for unequal lists and the
    /// first error of [`Self::create_entity`].
    pub fn create_entities(
        &self,
        kinds: &[String],
        ids: &[EntityId],
        properties: Vec<PropertyMap>,
        created_at: Option<Timestamp>,
    ) -> Result<Vec<Outcome<State>>> {
        if kinds.len() != ids.len() || ids.len() != properties.len() {
            return Err(ValidationError::LengthMismatch {
                keys: ids.len(),
                values: kinds.len().min(properties.len()),
            }
            .into());
        }
        kinds
            .iter()
            .zip(ids)
            .zip(properties)
            .map(|((kind, id), props)| self.create_entity(kind, id, props, created_at))
            .collect()
    }

    /// Returns `true` if the store knows the entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn has_entity(&self, id: &EntityId) -> Result<bool> {
        Ok(self.store.get_entity(id)?.is_some())
    }

    /// Returns the entity's identity record.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Entity`] for an unknown id.
    pub fn get_entity(&self, id: &EntityId) -> Result<Entity> {
        self.store
            .get_entity(id)?
            .ok_or_else(|| NotFound::Entity(id.to_string()).into())
    }

    /// Returns the state the entity is in now.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Entity`] for an unknown id and
    /// [`NotFound::NoCurrentState`] when the entity exists without a current
    /// state.
    #[instrument(skip(self), fields(entity_id = %id))]
    pub fn get_current_state(&self, id: &EntityId) -> Result<State> {
        if let Some(state) = self.store.current_state(id)? {
            return Ok(state);
        }
        if self.store.get_entity(id)?.is_some() {
            return Err(NotFound::NoCurrentState(id.to_string()).into());
        }
        Err(NotFound::Entity(id.to_string()).into())
    }

    /// Returns the current properties of an entity.
    ///
    /// # Errors
    ///
    /// See [`Self::get_current_state`].
    pub fn get_properties_of_entity(&self, id: &EntityId) -> Result<PropertyMap> {
        Ok(self.get_current_state(id)?.properties)
    }

    /// Returns the current states of the given entities, sorted by id.
    ///
    /// Unknown ids are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if a lookup fails.
    pub fn get_properties_of_entities(&self, ids: &[EntityId]) -> Result<Vec<State>> {
        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(state) = self.store.current_state(id)? {
                states.push(state);
            }
        }
        states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(states)
    }

    /// Supersedes the current state with one carrying the merged properties.
    ///
    /// `keys` and `values` are parallel lists.
    ///
    /// # Errors
    ///
    /// Returns a validation error for mismatched lists or undeclared
    /// properties; no state is written then.
    pub fn create_or_update_properties(
        &self,
        id: &EntityId,
        keys: &[impl AsRef<str>],
        values: Vec<PropertyValue>,
        change_at: Option<Timestamp>,
    ) -> Result<State> {
        let properties = zip_properties(keys, values)?;
        self.update_properties(id, &properties, change_at)
    }

    /// Sets one property. See [`Self::create_or_update_properties`].
    ///
    /// # Errors
    ///
    /// See [`Self::create_or_update_properties`].
    pub fn create_or_update_property(
        &self,
        id: &EntityId,
        key: &str,
        value: PropertyValue,
        change_at: Option<Timestamp>,
    ) -> Result<State> {
        self.create_or_update_properties(id, &[key], vec![value], change_at)
    }

    /// Supersedes the current state with one carrying the merged properties.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Entity`] for an unknown id and a validation error
    /// for undeclared properties or wrong types.
    #[instrument(skip(self, properties), fields(entity_id = %id, count = properties.len()))]
    pub fn update_properties(
        &self,
        id: &EntityId,
        properties: &PropertyMap,
        change_at: Option<Timestamp>,
    ) -> Result<State> {
        let entity = self.get_entity(id)?;
        let properties = sanitize::keys(properties);
        self.ontology
            .validate_entity_properties(&entity.kind, &properties)?;

        let _guard = self.locks.lock(id);
        let patch = StatePatch::new().with_set(properties);
        let state = self
            .store
            .patch_entity(id, &patch, change_at.unwrap_or_else(temporal::now))?;
        metrics::counter!("kg_states_created_total").increment(1);
        Ok(state)
    }

    /// Updates several entities, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::LengthMismatch`] for unequal lists and the
    /// first error of [`Self::update_properties`].
    pub fn create_or_update_properties_of_entities(
        &self,
        ids: &[EntityId],
        properties: &[PropertyMap],
        change_at: Option<Timestamp>,
    ) -> Result<Vec<State>> {
        if ids.len() != properties.len() {
            return Err(ValidationError::LengthMismatch {
                keys: ids.len(),
                values: properties.len(),
            }
            .into());
        }
        ids.iter()
            .zip(properties)
            .map(|(id, props)| self.update_properties(id, props, change_at))
            .collect()
    }

    /// Supersedes the current state with one lacking `keys`.
    ///
    /// The keys are absent from the new state, not blanked.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Entity`] for an unknown id and
    /// [`Error::InvalidInput`] when asked to drop `_deleted`.
    #[instrument(skip(self, keys), fields(entity_id = %id))]
    pub fn delete_properties(
        &self,
        id: &EntityId,
        keys: &[impl AsRef<str>],
        change_at: Option<Timestamp>,
    ) -> Result<State> {
        let keys: Vec<String> = keys
            .iter()
            .map(|k| sanitize::identifier(k.as_ref()))
            .collect();
        if keys.iter().any(|k| k == DELETED_KEY) {
            return Err(Error::InvalidInput(format!(
                "'{DELETED_KEY}' cannot be removed; use remove_entity"
            )));
        }
        self.get_entity(id)?;

        let _guard = self.locks.lock(id);
        let patch = StatePatch::new().with_removed(keys);
        let state = self
            .store
            .patch_entity(id, &patch, change_at.unwrap_or_else(temporal::now))?;
        metrics::counter!("kg_states_created_total").increment(1);
        Ok(state)
    }

    /// Drops one property. See [`Self::delete_properties`].
    ///
    /// # Errors
    ///
    /// See [`Self::delete_properties`].
    pub fn delete_property(
        &self,
        id: &EntityId,
        key: &str,
        change_at: Option<Timestamp>,
    ) -> Result<State> {
        self.delete_properties(id, &[key], change_at)
    }

    /// Drops the same keys from several entities, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error of [`Self::delete_properties`].
    pub fn delete_properties_from_entities(
        &self,
        ids: &[EntityId],
        keys: &[impl AsRef<str>],
        change_at: Option<Timestamp>,
    ) -> Result<Vec<State>> {
        ids.iter()
            .map(|id| self.delete_properties(id, keys, change_at))
            .collect()
    }

    /// Soft-deletes an entity by writing `_deleted: true` into a new state.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Entity`] for an unknown id.
    pub fn remove_entity(&self, id: &EntityId, change_at: Option<Timestamp>) -> Result<State> {
        let mut deleted = PropertyMap::new();
        deleted.insert(DELETED_KEY.to_string(), PropertyValue::Bool(true));
        let state = self.update_properties(id, &deleted, change_at)?;
        info!("Entity {id} marked deleted");
        Ok(state)
    }

    /// Hard-deletes an entity with every state and edge. Irreversible.
    ///
    /// The id stays reserved in the id index.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[instrument(skip(self), fields(entity_id = %id))]
    pub fn destroy_entity(&self, id: &EntityId) -> Result<bool> {
        let _guard = self.locks.lock(id);
        let destroyed = self.store.destroy_entity(id)?;
        if destroyed {
            warn!("Entity {id} destroyed with its history");
        }
        Ok(destroyed)
    }

    // =========================================================================
    // Relationship Operations
    // =========================================================================

    fn endpoint(&self, id: &EntityId) -> Result<Entity> {
        self.store
            .get_entity(id)?
            .ok_or_else(|| NotFound::Endpoint(id.to_string()).into())
    }

    fn current_edge(
        &self,
        from: &EntityId,
        kind: &str,
        to: &EntityId,
    ) -> Result<Option<Relationship>> {
        let query = RelationshipQuery::new()
            .with_kind(kind)
            .from(from.clone())
            .to(to.clone());
        Ok(self.store.relationships(&query)?.into_iter().next())
    }

    fn relationship_kind(kind: &str) -> Result<String> {
        let kind = sanitize::identifier(kind);
        if kind.is_empty() {
            return Err(Error::InvalidInput("relationship kind is empty".to_string()));
        }
        Ok(kind)
    }

    /// Creates a relationship in a new state of `id_a`.
    ///
    /// `_deleted: false` is added to the properties.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Endpoint`] if either entity is unknown and a
    /// validation error if the relationship model rejects the pairing. An
    /// existing live edge yields [`Outcome::Skipped`].
    #[instrument(skip(self, properties), fields(from = %id_a, kind = %kind, to = %id_b))]
    pub fn create_relationship(
        &self,
        id_a: &EntityId,
        kind: &str,
        id_b: &EntityId,
        properties: PropertyMap,
        created_at: Option<Timestamp>,
    ) -> Result<Outcome<Relationship>> {
        let kind = Self::relationship_kind(kind)?;
        let entity_a = self.endpoint(id_a)?;
        let entity_b = self.endpoint(id_b)?;
        let mut properties = sanitize::keys(&properties);
        properties.insert(DELETED_KEY.to_string(), PropertyValue::Bool(false));
        self.ontology
            .validate_relationship(&entity_a.kind, &kind, &entity_b.kind, &properties)?;

        let _guard = self.locks.lock(id_a);
        let existing = self.current_edge(id_a, &kind, id_b)?;
        if existing.is_some_and(|edge| !edge.is_deleted()) {
            warn!("Relationship ({id_a})-[{kind}]->({id_b}) already exists");
            return Ok(Outcome::Skipped(Conflict::DuplicateRelationship {
                from: id_a.to_string(),
                kind,
                to: id_b.to_string(),
            }));
        }

        let patch = StatePatch::new().with_relationship(RelationshipChange::Create {
            kind: kind.clone(),
            to: id_b.clone(),
            properties: properties.clone(),
        });
        let state = self
            .store
            .patch_entity(id_a, &patch, created_at.unwrap_or_else(temporal::now))?;
        metrics::counter!("kg_relationships_created_total").increment(1);
        info!("Relationship ({id_a})-[{kind}]->({id_b}) created");

        Ok(Outcome::Applied(Relationship {
            from: id_a.clone(),
            kind,
            to: id_b.clone(),
            properties,
            state_id: state.id,
            validity: state.validity,
        }))
    }

    /// Creates a batch of property-less relationships, stopping at the first
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::LengthMismatch`] for unequal lists and the
    /// first error of [`Self::create_relationship`].
    pub fn create_relationships(
        &self,
        ids_a: &[EntityId],
        kinds: &[String],
        ids_b: &[EntityId],
        created_at: Option<Timestamp>,
    ) -> Result<Vec<Outcome<Relationship>>> {
        if ids_a.len() != kinds.len() || kinds.len() != ids_b.len() {
            return Err(ValidationError::LengthMismatch {
                keys: ids_a.len(),
                values: kinds.len().min(ids_b.len()),
            }
            .into());
        }
        ids_a
            .iter()
            .zip(kinds)
            .zip(ids_b)
            .map(|((a, kind), b)| {
                self.create_relationship(a, kind, b, PropertyMap::new(), created_at)
            })
            .collect()
    }

    /// Writes a new state of `id_a` without the `(kind, id_b)` edge.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Relationship`] if the current state has no such
    /// edge.
    #[instrument(skip(self), fields(from = %id_a, kind = %kind, to = %id_b))]
    pub fn delete_relationship(
        &self,
        id_a: &EntityId,
        kind: &str,
        id_b: &EntityId,
        deleted_at: Option<Timestamp>,
    ) -> Result<State> {
        let kind = Self::relationship_kind(kind)?;
        let _guard = self.locks.lock(id_a);
        if self.current_edge(id_a, &kind, id_b)?.is_none() {
            return Err(NotFound::Relationship {
                from: id_a.to_string(),
                kind,
                to: id_b.to_string(),
            }
            .into());
        }
        let patch = StatePatch::new().with_relationship(RelationshipChange::Delete {
            kind: kind.clone(),
            to: id_b.clone(),
        });
        let state = self
            .store
            .patch_entity(id_a, &patch, deleted_at.unwrap_or_else(temporal::now))?;
        metrics::counter!("kg_relationships_deleted_total").increment(1);
        info!("Relationship ({id_a})-[{kind}]->({id_b}) deleted");
        Ok(state)
    }

    /// Moves the `(kind, old_b)` edge of `id_a` to `new_b` in one new state.
    ///
    /// The edge keeps its properties.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Relationship`] if the edge does not exist,
    /// [`NotFound::Endpoint`] for an unknown `new_b` and a validation error
    /// if the model rejects the new pairing. An existing live `(kind, new_b)`
    /// edge yields [`Outcome::Skipped`].
    #[instrument(skip(self), fields(from = %id_a, kind = %kind, old = %old_b, new = %new_b))]
    pub fn update_relationship(
        &self,
        id_a: &EntityId,
        kind: &str,
        old_b: &EntityId,
        new_b: &EntityId,
        changed_at: Option<Timestamp>,
    ) -> Result<Outcome<State>> {
        let kind = Self::relationship_kind(kind)?;
        let entity_a = self.endpoint(id_a)?;
        let entity_b = self.endpoint(new_b)?;

        let _guard = self.locks.lock(id_a);
        let Some(edge) = self.current_edge(id_a, &kind, old_b)? else {
            return Err(NotFound::Relationship {
                from: id_a.to_string(),
                kind,
                to: old_b.to_string(),
            }
            .into());
        };
        self.ontology
            .validate_relationship(&entity_a.kind, &kind, &entity_b.kind, &edge.properties)?;
        if self
            .current_edge(id_a, &kind, new_b)?
            .is_some_and(|existing| !existing.is_deleted())
        {
            warn!("Relationship ({id_a})-[{kind}]->({new_b}) already exists");
            return Ok(Outcome::Skipped(Conflict::DuplicateRelationship {
                from: id_a.to_string(),
                kind,
                to: new_b.to_string(),
            }));
        }

        let patch = StatePatch::new()
            .with_relationship(RelationshipChange::Delete {
                kind: kind.clone(),
                to: old_b.clone(),
            })
            .with_relationship(RelationshipChange::Create {
                kind,
                to: new_b.clone(),
                properties: edge.properties,
            });
        let state = self
            .store
            .patch_entity(id_a, &patch, changed_at.unwrap_or_else(temporal::now))?;
        Ok(Outcome::Applied(state))
    }

    /// Sets properties on the `(kind, id_b)` edge in a new state of `id_a`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Relationship`] if the edge does not exist and a
    /// validation error if the model does not declare a property.
    #[instrument(skip(self, keys, values), fields(from = %id_a, kind = %kind, to = %id_b))]
    pub fn create_or_update_properties_of_relationship(
        &self,
        id_a: &EntityId,
        kind: &str,
        id_b: &EntityId,
        keys: &[impl AsRef<str>],
        values: Vec<PropertyValue>,
        changed_at: Option<Timestamp>,
    ) -> Result<State> {
        let kind = Self::relationship_kind(kind)?;
        let properties = sanitize::keys(&zip_properties(keys, values)?);
        let entity_a = self.endpoint(id_a)?;
        let entity_b = self.endpoint(id_b)?;
        self.ontology
            .validate_relationship(&entity_a.kind, &kind, &entity_b.kind, &properties)?;

        let _guard = self.locks.lock(id_a);
        if self.current_edge(id_a, &kind, id_b)?.is_none() {
            return Err(NotFound::Relationship {
                from: id_a.to_string(),
                kind,
                to: id_b.to_string(),
            }
            .into());
        }
        let patch = StatePatch::new().with_relationship(RelationshipChange::Update {
            kind,
            to: id_b.clone(),
            properties,
        });
        self.store
            .patch_entity(id_a, &patch, changed_at.unwrap_or_else(temporal::now))
    }

    /// Searches relationships.
    ///
    /// With `search_all_states` unset only current states are traversed,
    /// answering what is true now. With it set every state is traversed,
    /// answering what was ever true; states that merely carried an unchanged
    /// edge forward collapse into the oldest one, whose validity then spans
    /// all of them.
    ///
    /// Soft-deleted edges and edges touching soft-deleted entities are left
    /// out unless `include_deleted` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[instrument(skip(self, query), fields(kind = ?query.kind, all_states = query.search_all_states))]
    pub fn search_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        let mut store_query = query.clone();
        store_query.kind = query.kind.as_deref().map(sanitize::identifier);
        store_query.filter = sanitize::keys(&query.filter);
        store_query.limit = None;
        let found = self.store.relationships(&store_query)?;

        let mut deleted_entities: HashMap<EntityId, bool> = HashMap::new();
        let mut kept = Vec::with_capacity(found.len());
        for relationship in found {
            if !query.include_deleted
                && (relationship.is_deleted()
                    || self.is_entity_deleted(&relationship.from, &mut deleted_entities)?
                    || self.is_entity_deleted(&relationship.to, &mut deleted_entities)?)
            {
                continue;
            }
            kept.push(relationship);
        }

        let mut relationships = if query.search_all_states {
            collapse_unchanged_versions(kept)
        } else {
            kept.sort_by(|a, b| (&a.from, &a.kind, &a.to).cmp(&(&b.from, &b.kind, &b.to)));
            kept
        };
        if let Some(limit) = query.limit {
            relationships.truncate(limit);
        }
        Ok(relationships)
    }

    fn is_entity_deleted(
        &self,
        id: &EntityId,
        cache: &mut HashMap<EntityId, bool>,
    ) -> Result<bool> {
        if let Some(deleted) = cache.get(id) {
            return Ok(*deleted);
        }
        let deleted = self
            .store
            .current_state(id)?
            .is_some_and(|state| state.is_deleted());
        cache.insert(id.clone(), deleted);
        Ok(deleted)
    }

    /// Lists the current outgoing relationships of an entity.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Entity`] for an unknown id.
    pub fn get_relationships_of_entity(&self, id: &EntityId) -> Result<Vec<Relationship>> {
        self.get_entity(id)?;
        self.search_relationships(&RelationshipQuery::new().from(id.clone()))
    }

    // =========================================================================
    // Temporal Queries
    // =========================================================================

    /// Returns the state that was valid at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Entity`] for an unknown id and
    /// [`NotFound::NoStateAt`] for an instant before the entity existed.
    #[instrument(skip(self), fields(entity_id = %id, at = %at))]
    pub fn get_entity_by_date(&self, id: &EntityId, at: Timestamp) -> Result<State> {
        if let Some(state) = self.store.state_at(id, at)? {
            return Ok(state);
        }
        if self.store.get_entity(id)?.is_none() {
            return Err(NotFound::Entity(id.to_string()).into());
        }
        Err(NotFound::NoStateAt {
            id: id.to_string(),
            at: format_timestamp(at),
        }
        .into())
    }

    /// Looks up several entities at one instant, reporting misses per id.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store fails; misses are reported inline.
    pub fn get_entities_by_date(
        &self,
        ids: &[EntityId],
        at: Timestamp,
    ) -> Result<Vec<(EntityId, std::result::Result<State, NotFound>)>> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = match self.get_entity_by_date(id, at) {
                Ok(state) => Ok(state),
                Err(Error::NotFound(not_found)) => Err(not_found),
                Err(e) => return Err(e),
            };
            results.push((id.clone(), result));
        }
        Ok(results)
    }

    /// Returns the whole state chain, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Entity`] for an unknown id.
    pub fn history(&self, id: &EntityId) -> Result<Vec<State>> {
        let states = self.store.states(id)?;
        if states.is_empty() && self.store.get_entity(id)?.is_none() {
            return Err(NotFound::Entity(id.to_string()).into());
        }
        Ok(states)
    }

    /// Compares two states.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::State`] if either state is unknown.
    #[instrument(skip(self), fields(from = %from, to = %to))]
    pub fn diff(&self, from: &StateId, to: &StateId) -> Result<StateDiff> {
        for id in [from, to] {
            if self.store.state(id)?.is_none() {
                return Err(NotFound::State(id.to_string()).into());
            }
        }
        let properties = self.store.diff_properties(from, to)?;
        let relationships = diff_relationships(
            &self.store.state_relationships(from)?,
            &self.store.state_relationships(to)?,
        );
        Ok(StateDiff {
            properties,
            relationships,
        })
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Returns current states matching the query, sorted by entity id.
    ///
    /// A kind also matches its descendants unless the query asks for the
    /// exact kind.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound::Kind`] for an unknown kind.
    #[instrument(skip(self, query), fields(kind = ?query.kind))]
    pub fn search_for_entities(&self, query: &EntityQuery) -> Result<Vec<State>> {
        let kinds = match query.kind.as_deref().map(sanitize::identifier) {
            None => Vec::new(),
            Some(kind) if query.include_descendants => {
                let descendants = self.ontology.get_descendant_kinds(&kind)?;
                std::iter::once(kind).chain(descendants).collect()
            },
            Some(kind) => {
                if !self.ontology.has_kind(&kind) {
                    return Err(NotFound::Kind(kind).into());
                }
                vec![kind]
            },
        };
        let filter = sanitize::keys(&query.filter);

        let mut states = self.store.search_entities(&kinds, &filter)?;
        if !query.include_deleted {
            states.retain(|state| !state.is_deleted());
        }
        states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        if let Some(limit) = query.limit {
            states.truncate(limit);
        }
        Ok(states)
    }

    /// Lists the current state of every entity in the id index.
    ///
    /// Destroyed entities are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a lookup fails.
    pub fn get_all_entities(&self, include_deleted: bool) -> Result<Vec<State>> {
        let mut states = Vec::new();
        for id in self.ids.ids()? {
            match self.store.current_state(&id)? {
                Some(state) if include_deleted || !state.is_deleted() => states.push(state),
                _ => {},
            }
        }
        Ok(states)
    }

    /// Clears the backing store, the id index and the ontology.
    ///
    /// # Errors
    ///
    /// Returns an error if any component fails to clear.
    pub fn drop_database(&self) -> Result<()> {
        self.store.clear()?;
        self.ids.clear()?;
        self.ontology.clear()?;
        info!("Database was cleared");
        Ok(())
    }
}

/// Merges consecutive versions of one edge whose properties did not change.
///
/// Two versions are consecutive when the older carrying state ends where the
/// newer one starts.
fn collapse_unchanged_versions(mut found: Vec<Relationship>) -> Vec<Relationship> {
    found.sort_by(|a, b| {
        (&a.from, &a.kind, &a.to, a.validity.start).cmp(&(&b.from, &b.kind, &b.to, b.validity.start))
    });
    let mut collapsed: Vec<Relationship> = Vec::with_capacity(found.len());
    for relationship in found {
        if let Some(last) = collapsed.last_mut() {
            if last.same_edge(&relationship)
                && last.properties == relationship.properties
                && last.validity.end == Some(relationship.validity.start)
            {
                last.validity.end = relationship.validity.end;
                continue;
            }
        }
        collapsed.push(relationship);
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Validity;
    use chrono::{Duration, TimeZone, Utc};

    fn t(day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn props(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn graph() -> VersionedGraph {
        let graph = VersionedGraph::in_memory().unwrap();
        let _ = graph
            .ontology()
            .create_entity_kind("User", None, &["name", "height", "weight"], &["str", "int", "int"])
            .unwrap();
        let _ = graph
            .ontology()
            .create_entity_kind("Habit", None, &["label"], &["str"])
            .unwrap();
        graph
    }

    fn jack(graph: &VersionedGraph) -> EntityId {
        let id = EntityId::new("User/Jack");
        let outcome = graph
            .create_entity(
                "User",
                &id,
                props(&[("height", 180.into()), ("weight", 80.into())]),
                Some(t(1)),
            )
            .unwrap();
        assert!(outcome.is_applied());
        id
    }

    #[test]
    fn test_create_appends_deleted_flag() {
        let graph = graph();
        let id = jack(&graph);
        let state = graph.get_current_state(&id).unwrap();
        assert_eq!(state.get(DELETED_KEY), Some(&PropertyValue::Bool(false)));
        assert_eq!(state.get("height"), Some(&PropertyValue::Int(180)));
    }

    #[test]
    fn test_duplicate_id_is_skipped() {
        let graph = graph();
        let id = jack(&graph);
        let again = graph
            .create_entity("User", &id, PropertyMap::new(), None)
            .unwrap();
        assert_eq!(again, Outcome::Skipped(Conflict::DuplicateId(id.to_string())));
        assert_eq!(graph.history(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_kind_and_property_rejected() {
        let graph = graph();
        let err = graph
            .create_entity("Robot", &EntityId::new("r"), PropertyMap::new(), None)
            .unwrap_err();
        assert!(err.is_validation());

        let id = jack(&graph);
        let err = graph
            .create_or_update_property(&id, "age", 30.into(), Some(t(2)))
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(graph.history(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_property_removes_key() {
        let graph = graph();
        let id = jack(&graph);
        let state = graph.delete_property(&id, "weight", Some(t(2))).unwrap();
        assert!(!state.properties.contains_key("weight"));
        assert!(
            graph
                .delete_property(&id, DELETED_KEY, Some(t(3)))
                .is_err()
        );
    }

    #[test]
    fn test_missing_entity_vs_missing_state() {
        let graph = graph();
        let err = graph.get_current_state(&EntityId::new("nobody")).unwrap_err();
        assert!(matches!(err, Error::NotFound(NotFound::Entity(_))));

        let id = jack(&graph);
        let err = graph.get_entity_by_date(&id, t(1) - Duration::seconds(1)).unwrap_err();
        assert!(matches!(err, Error::NotFound(NotFound::NoStateAt { .. })));
    }

    #[test]
    fn test_relationship_lifecycle() {
        let graph = graph();
        let _ = graph
            .ontology()
            .create_relationship_kind("User", "LIKES", "Habit", Default::default())
            .unwrap();
        let id = jack(&graph);
        let habit = EntityId::new("Habit/Reading");
        let _ = graph
            .create_entity("Habit", &habit, props(&[("label", "Good".into())]), Some(t(1)))
            .unwrap();

        let created = graph
            .create_relationship(&id, "LIKES", &habit, PropertyMap::new(), Some(t(2)))
            .unwrap();
        assert!(created.is_applied());
        let duplicate = graph
            .create_relationship(&id, "LIKES", &habit, PropertyMap::new(), Some(t(3)))
            .unwrap();
        assert!(matches!(
            duplicate.conflict(),
            Some(Conflict::DuplicateRelationship { .. })
        ));
        assert_eq!(graph.get_relationships_of_entity(&id).unwrap().len(), 1);

        graph.delete_relationship(&id, "LIKES", &habit, Some(t(4))).unwrap();
        assert!(graph.get_relationships_of_entity(&id).unwrap().is_empty());
        let err = graph
            .delete_relationship(&id, "LIKES", &habit, Some(t(5)))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(NotFound::Relationship { .. })));

        let ever = graph
            .search_relationships(&RelationshipQuery::new().with_kind("LIKES").all_states())
            .unwrap();
        assert_eq!(ever.len(), 1);
        assert_eq!(ever[0].validity, Validity::between(t(2), t(4)));
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let graph = graph();
        let id = jack(&graph);
        let err = graph
            .create_relationship(&id, "LIKES", &EntityId::new("ghost"), PropertyMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(NotFound::Endpoint(_))));
    }

    #[test]
    fn test_soft_delete_hides_from_search_only() {
        let graph = graph();
        let id = jack(&graph);
        graph.remove_entity(&id, Some(t(2))).unwrap();

        let found = graph
            .search_for_entities(&EntityQuery::new().with_kind("User"))
            .unwrap();
        assert!(found.is_empty());
        let found = graph
            .search_for_entities(&EntityQuery::new().with_kind("User").include_deleted())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(graph.get_current_state(&id).unwrap().is_deleted());
        assert!(graph.get_all_entities(false).unwrap().is_empty());
        assert_eq!(graph.get_all_entities(true).unwrap().len(), 1);
    }

    #[test]
    fn test_get_entities_by_date_reports_misses() {
        let graph = graph();
        let id = jack(&graph);
        let results = graph
            .get_entities_by_date(&[id.clone(), EntityId::new("nobody")], t(2))
            .unwrap();
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].1, Err(NotFound::Entity("nobody".to_string())));
    }

    #[test]
    fn test_batch_length_mismatch() {
        let graph = graph();
        let err = graph
            .create_entities(&["User".to_string()], &[], Vec::new(), None)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_collapse_unchanged_versions() {
        let edge = |start: u32, end: Option<u32>, weight: i64| Relationship {
            from: EntityId::new("a"),
            kind: "LIKES".to_string(),
            to: EntityId::new("b"),
            properties: props(&[("w", weight.into())]),
            state_id: StateId::new(format!("s{start}")),
            validity: end.map_or_else(|| Validity::open(t(start)), |e| Validity::between(t(start), t(e))),
        };
        let collapsed =
            collapse_unchanged_versions(vec![edge(3, None, 2), edge(1, Some(2), 1), edge(2, Some(3), 1)]);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].state_id, StateId::new("s1"));
        assert_eq!(collapsed[0].validity, Validity::between(t(1), t(3)));
        assert_eq!(collapsed[1].state_id, StateId::new("s3"));
    }
}
