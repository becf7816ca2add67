//! Ontology persistence.
//!
//! The kind tree and the relationship model are each stored as one whole
//! document. Loads return `None` when nothing has been saved yet.

use crate::ontology::kind::KindTree;
use crate::ontology::model::RelationshipModel;
use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Ontology store mutex was poisoned, recovering");
            metrics::counter!("ontology_store_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Whole-document load/save of the two ontology structures.
///
/// Implementations need not serialize concurrent writers: the registry calls
/// them from a single writer at a time.
pub trait OntologyStore: Send + Sync {
    /// Loads the kind tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the document exists but cannot be read or parsed.
    fn load_kinds(&self) -> Result<Option<KindTree>>;

    /// Saves the kind tree, replacing the previous document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    fn save_kinds(&self, tree: &KindTree) -> Result<()>;

    /// Loads the relationship model.
    ///
    /// # Errors
    ///
    /// Returns an error if the document exists but cannot be read or parsed.
    fn load_model(&self) -> Result<Option<RelationshipModel>>;

    /// Saves the relationship model, replacing the previous document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    fn save_model(&self, model: &RelationshipModel) -> Result<()>;
}

/// Keeps both documents in memory only.
#[derive(Debug, Default)]
pub struct InMemoryOntologyStore {
    kinds: Mutex<Option<KindTree>>,
    model: Mutex<Option<RelationshipModel>>,
}

impl InMemoryOntologyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OntologyStore for InMemoryOntologyStore {
    fn load_kinds(&self) -> Result<Option<KindTree>> {
        Ok(acquire_lock(&self.kinds).clone())
    }

    fn save_kinds(&self, tree: &KindTree) -> Result<()> {
        *acquire_lock(&self.kinds) = Some(tree.clone());
        Ok(())
    }

    fn load_model(&self) -> Result<Option<RelationshipModel>> {
        Ok(acquire_lock(&self.model).clone())
    }

    fn save_model(&self, model: &RelationshipModel) -> Result<()> {
        *acquire_lock(&self.model) = Some(model.clone());
        Ok(())
    }
}

/// Stores each document as a pretty-printed JSON file.
///
/// Saves write a sibling temporary file and rename it over the target, so a
/// crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct JsonFileOntologyStore {
    kinds_path: PathBuf,
    model_path: PathBuf,
}

impl JsonFileOntologyStore {
    /// Uses `kinds.json` and `relationship_model.json` inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join("kinds.json"), dir.join("relationship_model.json"))
    }

    /// Uses explicit file paths.
    #[must_use]
    pub fn new(kinds_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            kinds_path: kinds_path.into(),
            model_path: model_path.into(),
        }
    }

    /// Path of the kind tree document.
    #[must_use]
    pub fn kinds_path(&self) -> &Path {
        &self.kinds_path
    }

    /// Path of the relationship model document.
    #[must_use]
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn load<T: DeserializeOwned>(path: &Path, operation: &str) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).map_err(|e| Error::failed(operation, e))?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::failed(operation, format!("{}: {e}", path.display())))
    }

    fn save<T: Serialize>(path: &Path, value: &T, operation: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::failed(operation, e))?;
        }
        let text = serde_json::to_string_pretty(value).map_err(|e| Error::failed(operation, e))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(|e| Error::failed(operation, e))?;
        std::fs::rename(&tmp, path).map_err(|e| Error::failed(operation, e))
    }
}

impl OntologyStore for JsonFileOntologyStore {
    fn load_kinds(&self) -> Result<Option<KindTree>> {
        Self::load(&self.kinds_path, "load_ontology_kinds")
    }

    fn save_kinds(&self, tree: &KindTree) -> Result<()> {
        Self::save(&self.kinds_path, tree, "save_ontology_kinds")
    }

    fn load_model(&self) -> Result<Option<RelationshipModel>> {
        Self::load(&self.model_path, "load_ontology_model")
    }

    fn save_model(&self, model: &RelationshipModel) -> Result<()> {
        Self::save(&self.model_path, model, "save_ontology_model")
    }
}
