//! Ontology integration tests.
//!
//! Covers the kind tree, the relationship model and their JSON persistence.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use tempfile::TempDir;
use versioned_kg::models::{PropertyMap, PropertyType, PropertyValue};
use versioned_kg::ontology::{
    ANY_KIND, JsonFileOntologyStore, OntologyRegistry, PropertySpec, PropertySpecs, ROOT_KIND,
};
use versioned_kg::{Conflict, Error, Outcome, ValidationError};

fn specs(pairs: &[(&str, PropertyType)]) -> PropertySpecs {
    pairs
        .iter()
        .map(|(name, ty)| ((*name).to_string(), PropertySpec::new(*ty)))
        .collect()
}

fn props(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn open_registry(dir: &TempDir) -> OntologyRegistry {
    let store = Arc::new(JsonFileOntologyStore::in_dir(dir.path()));
    OntologyRegistry::open(store).expect("Failed to open ontology")
}

#[test]
fn test_missing_parent_is_created_under_root() {
    let registry = OntologyRegistry::in_memory();
    let outcome = registry
        .create_entity_kind("Dog", Some("Animal"), &["breed"], &["str"])
        .unwrap();
    assert_eq!(outcome, Outcome::Applied(()));

    let tree = registry.kind_tree();
    assert_eq!(tree.get("Animal").unwrap().parent.as_deref(), Some(ROOT_KIND));
    assert_eq!(tree.get("Dog").unwrap().parent.as_deref(), Some("Animal"));
    assert_eq!(registry.get_descendant_kinds("Animal").unwrap(), vec!["Dog".to_string()]);
}

#[test]
fn test_recreating_a_kind_is_a_noop() {
    let registry = OntologyRegistry::in_memory();
    let _ = registry
        .create_entity_kind("User", None, &["name"], &["str"])
        .unwrap();
    let again = registry
        .create_entity_kind("User", None, &["age"], &["int"])
        .unwrap();
    assert_eq!(again, Outcome::Skipped(Conflict::DuplicateKind("User".to_string())));
    assert!(!registry.get_kind_properties("User").unwrap().contains_key("age"));
}

#[test]
fn test_inherited_properties_validate() {
    let registry = OntologyRegistry::in_memory();
    let _ = registry
        .create_entity_kind("Animal", None, &["name", "legs"], &["str", "int"])
        .unwrap();
    let _ = registry
        .create_entity_kind("Dog", Some("Animal"), &["breed", "legs"], &["str", "str"])
        .unwrap();

    let effective = registry.get_kind_properties("Dog").unwrap();
    assert_eq!(effective["legs"].property_type, PropertyType::Int);
    assert!(effective.contains_key("_deleted"));

    registry
        .are_valid_entity_kind_properties(
            &["name", "breed", "legs", "_deleted"],
            &["Rex".into(), "Collie".into(), 4.into(), false.into()],
            "Dog",
        )
        .unwrap();

    let err = registry
        .are_valid_entity_kind_properties(&["name", "tail"], &["Rex".into(), true.into()], "Dog")
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::UnknownProperty { ref property, .. }) if property == "tail"
    ));

    let err = registry
        .are_valid_entity_kind_properties(&["legs"], &[4.5.into()], "Dog")
        .unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::TypeMismatch { .. })));

    let err = registry
        .are_valid_entity_kind_properties(&["legs", "name"], &[4.into()], "Dog")
        .unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::LengthMismatch { .. })));

    // Explicit extension overrides the inherited declaration.
    registry
        .create_entity_kind_properties("Dog", &["legs"], &["str"])
        .unwrap();
    registry
        .are_valid_entity_kind_properties(&["legs"], &["four".into()], "Dog")
        .unwrap();
}

#[test]
fn test_extending_an_unknown_kind_fails() {
    let registry = OntologyRegistry::in_memory();
    let err = registry
        .create_entity_kind_properties("Ghost", &["name"], &["str"])
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_wildcard_relationship_pairs() {
    let registry = OntologyRegistry::in_memory();
    for kind in ["User", "Habit", "Place"] {
        let _ = registry
            .create_entity_kind(kind, None, &[] as &[&str], &[] as &[&str])
            .unwrap();
    }
    let _ = registry
        .create_relationship_kind("User", "VISITED", ANY_KIND, specs(&[("times", PropertyType::Int)]))
        .unwrap();

    registry
        .is_valid_relationship_model("User", "VISITED", "Place", &["times"], &[3.into()])
        .unwrap();
    registry
        .validate_relationship("User", "VISITED", "Habit", &PropertyMap::new())
        .unwrap();

    let err = registry
        .validate_relationship("Place", "VISITED", "User", &PropertyMap::new())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::IncompatibleRelationship { .. })
    ));

    let err = registry
        .validate_relationship("User", "OWNS", "Place", &PropertyMap::new())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::UnknownRelationshipKind(_))
    ));

    let duplicate = registry
        .create_relationship_kind("User", "VISITED", ANY_KIND, PropertySpecs::new())
        .unwrap();
    assert!(!duplicate.is_applied());
}

#[test]
fn test_relationship_properties_checked_against_every_triple() {
    let registry = OntologyRegistry::in_memory();
    for kind in ["User", "Habit", "Place"] {
        let _ = registry
            .create_entity_kind(kind, None, &[] as &[&str], &[] as &[&str])
            .unwrap();
    }
    let _ = registry
        .create_relationship_kind("User", "LIKES", "Habit", specs(&[("since", PropertyType::Date)]))
        .unwrap();
    registry
        .validate_relationship(
            "User",
            "LIKES",
            "Habit",
            &props(&[("since", chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().into())]),
        )
        .unwrap();

    // A second triple without `since` makes the property invalid for both.
    let _ = registry
        .create_relationship_kind("User", "LIKES", "Place", PropertySpecs::new())
        .unwrap();
    let err = registry
        .validate_relationship(
            "User",
            "LIKES",
            "Habit",
            &props(&[("since", chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap().into())]),
        )
        .unwrap_err();
    assert!(err.is_validation());

    // `_deleted` is accepted on every edge.
    registry
        .validate_relationship("User", "LIKES", "Place", &props(&[("_deleted", false.into())]))
        .unwrap();
}

#[test]
fn test_ontology_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let registry = open_registry(&dir);
        let _ = registry
            .create_entity_kind_with_specs(
                "User",
                None,
                [(
                    "height".to_string(),
                    PropertySpec::new(PropertyType::Int).with_unit("cm"),
                )]
                .into_iter()
                .collect(),
            )
            .unwrap();
        let _ = registry
            .create_relationship_kind("User", "KNOWS", "User", PropertySpecs::new())
            .unwrap();
    }

    let registry = open_registry(&dir);
    let height = &registry.get_kind_properties("User").unwrap()["height"];
    assert_eq!(height.unit.as_deref(), Some("cm"));
    assert!(registry.has_relationship_kind("KNOWS"));
    assert!(registry.render_hierarchy(true).contains("User"));
    assert!(registry.render_data_model().contains("KNOWS"));
}

#[test]
fn test_delete_kind_removes_subtree_and_triples() {
    let registry = OntologyRegistry::in_memory();
    let _ = registry
        .create_entity_kind("Dog", Some("Animal"), &["breed"], &["str"])
        .unwrap();
    let _ = registry
        .create_entity_kind("User", None, &["name"], &["str"])
        .unwrap();
    let _ = registry
        .create_relationship_kind("User", "OWNS", "Dog", PropertySpecs::new())
        .unwrap();

    let mut removed = registry.delete_entity_kind("Animal").unwrap();
    removed.sort();
    assert_eq!(removed, vec!["Animal".to_string(), "Dog".to_string()]);
    assert!(!registry.has_kind("Dog"));
    assert!(!registry.has_relationship_kind("OWNS"));

    assert!(registry.delete_entity_kind(ROOT_KIND).is_err());
    assert!(registry.delete_entity_kind("Animal").unwrap_err().is_not_found());

    assert!(registry.delete_property_kind("User", "name").unwrap());
    assert!(!registry.delete_property_kind("User", "name").unwrap());
}

#[test]
fn test_kind_names_are_sanitized() {
    let registry = OntologyRegistry::in_memory();
    let _ = registry
        .create_entity_kind("ZetUniverse.Kinds.Note", None, &["Title"], &["str"])
        .unwrap();
    assert!(registry.has_kind("ZetUniverseKindsNote"));
    assert!(
        registry
            .create_entity_kind("...", None, &[] as &[&str], &[] as &[&str])
            .is_err()
    );
}
