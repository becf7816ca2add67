//! Ingestion integration tests.
//!
//! Replays append-only files and scripted polling sources through the
//! connector into an on-disk graph.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use serde_json::{Value, json};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use versioned_kg::config::IngestConfig;
use versioned_kg::ingest::{AofSource, Connector, RecordSource};
use versioned_kg::models::{PropertyValue, RelationshipQuery};
use versioned_kg::storage::{EntityIndex, NAME_TAG, SqliteEntityIndex};
use versioned_kg::{EntityId, Error, KgConfig, Result, VersionedGraph};

fn record(id: &str, kind: &str, action: i64, changed: &str, title: &str, related: Value) -> Value {
    json!({
        "Id": id,
        "AppId": "zet",
        "Kind": kind,
        "SemanticAction": action,
        "TLChange": changed,
        "Created": "2022-01-01T08:00:00.0000000Z",
        "Title": title,
        "Keyphrases": ["ignored"],
        "Location": {"Space": "home", "Depth": 2},
        "Tags": ["one", "two"],
        "Comment": null,
        "Related": related
    })
}

fn write_aof(dir: &TempDir, records: &[Value]) -> std::path::PathBuf {
    let path = dir.path().join("appendonly.aof");
    let mut file = std::fs::File::create(&path).unwrap();
    for record in records {
        writeln!(file, "*3\r").unwrap();
        writeln!(file, "$3\r").unwrap();
        writeln!(file, "{record}").unwrap();
    }
    path
}

fn open_graph(dir: &TempDir) -> Arc<VersionedGraph> {
    let config = KgConfig::with_data_dir(dir.path().join("data"));
    Arc::new(VersionedGraph::open(&config).unwrap())
}

#[test]
fn test_replay_aof_file() {
    let dir = TempDir::new().unwrap();
    let path = write_aof(
        &dir,
        &[
            record(
                "note-1",
                "ZetUniverse.Kinds.Note",
                71,
                "2022-03-01T11:00:00.0000000Z",
                "Groceries, edited",
                json!([]),
            ),
            record(
                "note-1",
                "ZetUniverse.Kinds.Note",
                70,
                "2022-03-01T10:00:00.0000000Z",
                "Groceries",
                json!([{"Relation": "Mention", "EntityId": "task-1", "Direction": true,
                        "RelationshipEntityId": "rel-1", "Strength": 2}]),
            ),
            record(
                "task-1",
                "ZetUniverse.Kinds.Task",
                70,
                "2022-03-01T10:30:00.0000000Z",
                "Buy milk",
                json!([]),
            ),
            record(
                "topic-1",
                "ZetUniverse.Kinds.Topic",
                70,
                "2022-03-01T10:30:00.0000000Z",
                "Food",
                json!([]),
            ),
            record(
                "task-2",
                "ZetUniverse.Kinds.Task",
                72,
                "2022-03-01T10:40:00.0000000Z",
                "Deleted",
                json!([]),
            ),
        ],
    );

    let graph = open_graph(&dir);
    let connector = Connector::new(Arc::clone(&graph), IngestConfig::default());
    let mut source = AofSource::new(&path);
    let report = connector.ingest_source(&mut source).unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.ignored, 2);
    assert_eq!(report.relationships_created, 1);
    assert_eq!(report.failed, 0);

    let note = EntityId::new("note-1");
    let entity = graph.get_entity(&note).unwrap();
    assert_eq!(entity.kind, "ZetUniverseKindsNote");
    assert_eq!(entity.immutable.get("Id"), Some(&PropertyValue::from("note-1")));

    let current = graph.get_current_state(&note).unwrap();
    assert_eq!(current.get("Title"), Some(&PropertyValue::from("Groceries, edited")));
    assert_eq!(current.get("Location_Space"), Some(&PropertyValue::from("home")));
    assert_eq!(current.get("Location_Depth"), Some(&PropertyValue::Int(2)));
    assert_eq!(current.get("Tags"), Some(&PropertyValue::from("[\"one\",\"two\"]")));
    assert_eq!(current.get("Comment"), Some(&PropertyValue::from("")));
    assert!(current.get("Keyphrases").is_none());
    assert!(current.get("Created").is_none());
    assert!(matches!(
        current.get("SemanticActionDescription"),
        Some(PropertyValue::String(s)) if !s.is_empty()
    ));

    let history = graph.history(&note).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].get("Title"), Some(&PropertyValue::from("Groceries, edited")));

    let mentions = graph
        .search_relationships(&RelationshipQuery::new().with_kind("Mention"))
        .unwrap();
    assert_eq!(mentions.len(), 1);
    assert_eq!(mentions[0].from, note);
    assert_eq!(mentions[0].to, EntityId::new("task-1"));
    assert_eq!(mentions[0].properties.get("Strength"), Some(&PropertyValue::Int(2)));

    assert!(!graph.has_entity(&EntityId::new("topic-1")).unwrap());
    assert!(!graph.has_entity(&EntityId::new("task-2")).unwrap());

    // Replaying the same file changes nothing. The oldest note record
    // predates the current state and is refused.
    let mut replay = AofSource::new(&path);
    let again = connector.ingest_source(&mut replay).unwrap();
    assert!(again.is_noop());
    assert_eq!(again.unchanged, 2);
    assert_eq!(again.failed, 1);
    assert_eq!(again.duplicate_relationships, 1);
    assert_eq!(graph.history(&note).unwrap().len(), 3);
}

#[test]
fn test_incoming_direction_and_indexing() {
    let dir = TempDir::new().unwrap();
    let graph = open_graph(&dir);
    let index = Arc::new(SqliteEntityIndex::new(dir.path().join("index.db")).unwrap());
    let connector = Connector::new(Arc::clone(&graph), IngestConfig::default())
        .with_entity_index(index.clone(), "user/1");

    let report = connector.ingest_values(&[
        record(
            "person-1",
            "ZetUniverse.Kinds.Person",
            70,
            "2022-03-01T09:00:00.0Z",
            "Ada Lovelace",
            json!([]),
        ),
        record(
            "doc-1",
            "ZetUniverse.Kinds.Document",
            70,
            "2022-03-01T09:30:00.0Z",
            "Notes on engines",
            json!([{"Relation": "Author", "EntityId": "person-1", "Direction": false,
                    "RelationshipEntityId": "rel-9"}]),
        ),
    ]);
    assert_eq!(report.created, 2);
    assert_eq!(report.relationships_created, 1);

    let authored = graph
        .get_relationships_of_entity(&EntityId::new("person-1"))
        .unwrap();
    assert_eq!(authored.len(), 1);
    assert_eq!(authored[0].to, EntityId::new("doc-1"));
    assert!(
        graph
            .ontology()
            .validate_relationship(
                "ZetUniverseKindsPerson",
                "Author",
                "ZetUniverseKindsDocument",
                &Default::default()
            )
            .is_ok()
    );

    assert_eq!(
        index.search("user/1", "engine", Some(NAME_TAG)).unwrap(),
        vec![EntityId::new("doc-1")]
    );
    assert!(index.search("user/2", "engine", None).unwrap().is_empty());
}

#[test]
fn test_new_keys_extend_the_kind() {
    let dir = TempDir::new().unwrap();
    let graph = open_graph(&dir);
    let connector = Connector::new(Arc::clone(&graph), IngestConfig::default());

    let first = record(
        "n",
        "ZetUniverse.Kinds.Note",
        70,
        "2022-03-01T09:00:00.0Z",
        "A",
        json!([]),
    );
    let mut second = record(
        "n",
        "ZetUniverse.Kinds.Note",
        71,
        "2022-03-01T10:00:00.0Z",
        "A",
        json!([]),
    );
    second["Priority"] = json!(3);
    let mut clashing = record(
        "n",
        "ZetUniverse.Kinds.Note",
        71,
        "2022-03-01T11:00:00.0Z",
        "A",
        json!([]),
    );
    clashing["Priority"] = json!("high");

    let report = connector.ingest_values(&[first, second, clashing]);
    assert_eq!(report.created, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.failed, 1);

    let properties = graph.ontology().get_kind_properties("ZetUniverseKindsNote").unwrap();
    assert!(properties.contains_key("Priority"));
    let current = graph.get_current_state(&EntityId::new("n")).unwrap();
    assert_eq!(current.get("Priority"), Some(&PropertyValue::Int(3)));
}

#[test]
fn test_links_keep_the_source_in_record_time() {
    let dir = TempDir::new().unwrap();
    let graph = open_graph(&dir);
    let connector = Connector::new(Arc::clone(&graph), IngestConfig::default());

    let first = connector.ingest_values(&[
        record(
            "a",
            "ZetUniverse.Kinds.Note",
            70,
            "2022-03-01T09:00:00.0Z",
            "A",
            json!([{"Relation": "Mention", "EntityId": "b", "Direction": true,
                    "RelationshipEntityId": "r"}]),
        ),
        record(
            "b",
            "ZetUniverse.Kinds.Note",
            70,
            "2022-03-01T09:30:00.0Z",
            "B",
            json!([]),
        ),
    ]);
    assert_eq!(first.created, 2);
    assert_eq!(first.relationships_created, 1);

    let a = EntityId::new("a");
    let linked = graph.get_relationships_of_entity(&a).unwrap();
    assert_eq!(
        linked[0].validity.start,
        versioned_kg::models::parse_timestamp("2022-03-01T09:00:00").unwrap()
    );

    let second = connector.ingest_values(&[record(
        "a",
        "ZetUniverse.Kinds.Note",
        71,
        "2022-03-02T09:00:00.0Z",
        "A, edited",
        json!([]),
    )]);
    assert_eq!(second.updated, 1);
    assert_eq!(second.failed, 0);

    let current = graph.get_current_state(&a).unwrap();
    assert_eq!(current.get("Title"), Some(&PropertyValue::from("A, edited")));
    assert_eq!(graph.get_relationships_of_entity(&a).unwrap().len(), 1);
}

/// Source that replays scripted batches, failing where the script says so.
struct ScriptedSource {
    batches: VecDeque<Option<Vec<Value>>>,
}

impl RecordSource for ScriptedSource {
    fn next_batch(&mut self) -> Result<Vec<Value>> {
        match self.batches.pop_front() {
            Some(Some(batch)) => Ok(batch),
            Some(None) => Err(Error::failed("scripted_source", "connection reset")),
            None => Ok(Vec::new()),
        }
    }
}

#[test]
fn test_polling_survives_source_errors() {
    let dir = TempDir::new().unwrap();
    let graph = open_graph(&dir);
    let config = IngestConfig {
        poll_interval: Duration::ZERO,
        max_polls: Some(4),
        ..IngestConfig::default()
    };
    let connector = Connector::new(Arc::clone(&graph), config);

    let mut source = ScriptedSource {
        batches: VecDeque::from([
            Some(vec![record(
                "a",
                "ZetUniverse.Kinds.Note",
                70,
                "2022-03-01T09:00:00.0Z",
                "A",
                json!([]),
            )]),
            None,
            Some(vec![record(
                "b",
                "ZetUniverse.Kinds.Note",
                70,
                "2022-03-01T09:05:00.0Z",
                "B",
                json!([{"Relation": "Next", "EntityId": "a", "Direction": false,
                        "RelationshipEntityId": "r"}]),
            )]),
        ]),
    };

    let report = connector.run_polling(&mut source);
    assert_eq!(report.created, 2);
    assert_eq!(report.relationships_created, 1);
    assert!(source.batches.is_empty());

    let next = graph.get_relationships_of_entity(&EntityId::new("a")).unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].to, EntityId::new("b"));
}
