//! `SQLite` graph store for versioned entities.
//!
//! Stores entities, their state chains and per-state relationship sets in
//! three tables. Every mutation runs in one `IMMEDIATE` transaction, so the
//! read-current-then-write sequence of a patch cannot interleave with another
//! writer on the same database.

// SQLite hands back i64 for sequence numbers that are never negative.
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::redundant_closure_for_method_calls)]

use super::apply_relationship_changes;
use crate::models::temporal::{from_micros, now, to_micros};
use crate::models::{
    Entity, EntityId, PropertyDiff, PropertyMap, Relationship, RelationshipQuery, State, StateId,
    StatePatch, Timestamp, Validity, diff_properties, format_timestamp,
};
use crate::storage::sqlite::{
    DEFAULT_BUSY_TIMEOUT, acquire_lock, configure_connection, is_constraint_violation,
    record_result, sqlite_error,
};
use crate::storage::traits::GraphStore;
use crate::{Conflict, Error, NotFound, Outcome, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::instrument;

const BACKEND: &str = "sqlite";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kg_entities (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    immutable TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS kg_states (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL REFERENCES kg_entities(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    properties TEXT NOT NULL,
    valid_from INTEGER NOT NULL,
    valid_to INTEGER,
    recorded_at INTEGER NOT NULL,
    previous TEXT,
    UNIQUE (entity_id, seq)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_kg_states_current
    ON kg_states(entity_id) WHERE valid_to IS NULL;
CREATE TABLE IF NOT EXISTS kg_relationships (
    state_id TEXT NOT NULL REFERENCES kg_states(id) ON DELETE CASCADE,
    from_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    to_id TEXT NOT NULL,
    properties TEXT NOT NULL,
    PRIMARY KEY (state_id, kind, to_id)
);
CREATE INDEX IF NOT EXISTS idx_kg_entities_kind ON kg_entities(kind);
CREATE INDEX IF NOT EXISTS idx_kg_relationships_kind ON kg_relationships(kind);
CREATE INDEX IF NOT EXISTS idx_kg_relationships_to ON kg_relationships(to_id);
";

const STATE_SELECT: &str = "SELECT s.id, s.entity_id, e.kind, s.properties, s.valid_from, \
     s.valid_to, s.recorded_at, s.previous, s.seq \
     FROM kg_states s JOIN kg_entities e ON e.id = s.entity_id";

const RELATIONSHIP_SELECT: &str = "SELECT r.from_id, r.kind, r.to_id, r.properties, r.state_id, \
     s.valid_from, s.valid_to \
     FROM kg_relationships r \
     JOIN kg_states s ON s.id = r.state_id \
     JOIN kg_entities ea ON ea.id = r.from_id \
     JOIN kg_entities eb ON eb.id = r.to_id";

fn encode_properties(properties: &PropertyMap, operation: &str) -> Result<String> {
    serde_json::to_string(properties).map_err(|e| Error::failed(operation, e))
}

fn decode_properties(text: &str, operation: &str) -> Result<PropertyMap> {
    serde_json::from_str(text).map_err(|e| Error::failed(operation, e))
}

fn decode_time(micros: i64, operation: &str) -> Result<Timestamp> {
    from_micros(micros)
        .ok_or_else(|| Error::failed(operation, format!("timestamp out of range: {micros}")))
}

struct StateRow {
    id: String,
    entity_id: String,
    kind: String,
    properties: String,
    valid_from: i64,
    valid_to: Option<i64>,
    recorded_at: i64,
    previous: Option<String>,
    seq: i64,
}

impl StateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            kind: row.get(2)?,
            properties: row.get(3)?,
            valid_from: row.get(4)?,
            valid_to: row.get(5)?,
            recorded_at: row.get(6)?,
            previous: row.get(7)?,
            seq: row.get(8)?,
        })
    }

    fn into_state(self, operation: &str) -> Result<State> {
        let start = decode_time(self.valid_from, operation)?;
        let validity = match self.valid_to {
            Some(end) => Validity::between(start, decode_time(end, operation)?),
            None => Validity::open(start),
        };
        Ok(State {
            id: StateId::new(self.id),
            entity_id: EntityId::new(self.entity_id),
            kind: self.kind,
            properties: decode_properties(&self.properties, operation)?,
            validity,
            recorded_at: decode_time(self.recorded_at, operation)?,
            previous: self.previous.map(StateId::new),
        })
    }
}

struct RelationshipRow {
    from_id: String,
    kind: String,
    to_id: String,
    properties: String,
    state_id: String,
    valid_from: i64,
    valid_to: Option<i64>,
}

impl RelationshipRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            from_id: row.get(0)?,
            kind: row.get(1)?,
            to_id: row.get(2)?,
            properties: row.get(3)?,
            state_id: row.get(4)?,
            valid_from: row.get(5)?,
            valid_to: row.get(6)?,
        })
    }

    fn into_relationship(self, operation: &str) -> Result<Relationship> {
        let start = decode_time(self.valid_from, operation)?;
        let validity = match self.valid_to {
            Some(end) => Validity::between(start, decode_time(end, operation)?),
            None => Validity::open(start),
        };
        Ok(Relationship {
            from: EntityId::new(self.from_id),
            kind: self.kind,
            to: EntityId::new(self.to_id),
            properties: decode_properties(&self.properties, operation)?,
            state_id: StateId::new(self.state_id),
            validity,
        })
    }
}

fn query_state_rows(
    conn: &Connection,
    clause: &str,
    values: &[Value],
    operation: &str,
) -> Result<Vec<StateRow>> {
    let sql = format!("{STATE_SELECT} {clause}");
    let mut stmt = conn.prepare(&sql).map_err(|e| sqlite_error(operation, &e))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), StateRow::from_row)
        .map_err(|e| sqlite_error(operation, &e))?;
    rows.map(|row| row.map_err(|e| sqlite_error(operation, &e)))
        .collect()
}

fn query_states(
    conn: &Connection,
    clause: &str,
    values: &[Value],
    operation: &str,
) -> Result<Vec<State>> {
    query_state_rows(conn, clause, values, operation)?
        .into_iter()
        .map(|row| row.into_state(operation))
        .collect()
}

fn query_relationships(
    conn: &Connection,
    clause: &str,
    values: &[Value],
    operation: &str,
) -> Result<Vec<Relationship>> {
    let sql = format!("{RELATIONSHIP_SELECT} {clause}");
    let mut stmt = conn.prepare(&sql).map_err(|e| sqlite_error(operation, &e))?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), RelationshipRow::from_row)
        .map_err(|e| sqlite_error(operation, &e))?;
    rows.map(|row| {
        row.map_err(|e| sqlite_error(operation, &e))
            .and_then(|row| row.into_relationship(operation))
    })
    .collect()
}

fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

fn insert_state(conn: &Connection, state: &State, seq: i64, operation: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO kg_states (id, entity_id, seq, properties, valid_from, valid_to, recorded_at, previous)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            state.id.as_str(),
            state.entity_id.as_str(),
            seq,
            encode_properties(&state.properties, operation)?,
            to_micros(state.validity.start),
            state.validity.end.map(to_micros),
            to_micros(state.recorded_at),
            state.previous.as_ref().map(StateId::as_str),
        ],
    )
    .map_err(|e| sqlite_error(operation, &e))?;
    Ok(())
}

fn insert_relationship(
    conn: &Connection,
    state: &State,
    kind: &str,
    to: &EntityId,
    properties: &PropertyMap,
    operation: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO kg_relationships (state_id, from_id, kind, to_id, properties)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            state.id.as_str(),
            state.entity_id.as_str(),
            kind,
            to.as_str(),
            encode_properties(properties, operation)?,
        ],
    )
    .map_err(|e| sqlite_error(operation, &e))?;
    Ok(())
}

/// `SQLite`-based versioned graph store.
///
/// # Concurrency Model
///
/// Uses a `Mutex<Connection>` for thread-safe access within a process. WAL
/// mode, `busy_timeout` and `IMMEDIATE` transactions serialize writers across
/// processes sharing the file. A writer that stays blocked past the busy
/// timeout surfaces as [`Error::Timeout`].
///
/// # Schema
///
/// - `kg_entities`: id, kind, immutable properties, creation time
/// - `kg_states`: one row per snapshot; `valid_to IS NULL` marks the current
///   state and a partial unique index allows only one per entity
/// - `kg_relationships`: the edge set carried by each state
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteGraphStore {
    /// Opens (or creates) a store at `db_path` with the default busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_busy_timeout(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens (or creates) a store at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn with_busy_timeout(db_path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::failed("open_graph_sqlite", e))?;
        }
        let conn = Connection::open(&db_path).map_err(|e| sqlite_error("open_graph_sqlite", &e))?;
        configure_connection(&conn, busy_timeout);
        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Creates an in-memory store (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| sqlite_error("open_graph_sqlite_memory", &e))?;
        configure_connection(&conn, DEFAULT_BUSY_TIMEOUT);
        let store = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Returns the database path.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn initialize(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute_batch(SCHEMA)
            .map_err(|e| sqlite_error("create_graph_tables", &e))
    }

    fn create_entity_inner(&self, entity: &Entity, properties: &PropertyMap) -> Result<Outcome<State>> {
        const OP: &str = "create_entity";
        let mut conn = acquire_lock(&self.conn);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sqlite_error(OP, &e))?;

        let inserted = tx.execute(
            "INSERT INTO kg_entities (id, kind, immutable, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                entity.id.as_str(),
                entity.kind,
                encode_properties(&entity.immutable, OP)?,
                to_micros(entity.created_at),
            ],
        );
        match inserted {
            Ok(_) => {},
            Err(e) if is_constraint_violation(&e) => {
                return Ok(Outcome::Skipped(Conflict::DuplicateId(entity.id.to_string())));
            },
            Err(e) => return Err(sqlite_error(OP, &e)),
        }

        let state = State {
            id: StateId::generate(),
            entity_id: entity.id.clone(),
            kind: entity.kind.clone(),
            properties: properties.clone(),
            validity: Validity::open(entity.created_at),
            recorded_at: now(),
            previous: None,
        };
        insert_state(&tx, &state, 0, OP)?;
        tx.commit().map_err(|e| sqlite_error(OP, &e))?;
        Ok(Outcome::Applied(state))
    }

    fn patch_entity_inner(&self, id: &EntityId, patch: &StatePatch, at: Timestamp) -> Result<State> {
        const OP: &str = "patch_entity";
        let mut conn = acquire_lock(&self.conn);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sqlite_error(OP, &e))?;

        let Some(current) = query_state_rows(
            &tx,
            "WHERE s.entity_id = ?1 AND s.valid_to IS NULL",
            &[text(id.as_str())],
            OP,
        )?
        .into_iter()
        .next() else {
            let exists = tx
                .query_row("SELECT 1 FROM kg_entities WHERE id = ?1", [id.as_str()], |_| Ok(()))
                .optional()
                .map_err(|e| sqlite_error(OP, &e))?
                .is_some();
            return Err(if exists {
                NotFound::NoCurrentState(id.to_string()).into()
            } else {
                NotFound::Entity(id.to_string()).into()
            });
        };
        let seq = current.seq + 1;
        let current = current.into_state(OP)?;

        if at < current.validity.start {
            return Err(Error::InvalidInput(format!(
                "change at {} precedes the current state of '{id}' starting {}",
                format_timestamp(at),
                format_timestamp(current.validity.start)
            )));
        }

        let carried = query_relationships(&tx, "WHERE r.state_id = ?1", &[text(current.id.as_str())], OP)?;
        let edges = apply_relationship_changes(&carried, &patch.relationships);

        tx.execute(
            "UPDATE kg_states SET valid_to = ?1 WHERE id = ?2",
            params![to_micros(at), current.id.as_str()],
        )
        .map_err(|e| sqlite_error(OP, &e))?;

        let state = State {
            id: StateId::generate(),
            entity_id: id.clone(),
            kind: current.kind.clone(),
            properties: patch.apply_properties(&current.properties),
            validity: Validity::open(at),
            recorded_at: now(),
            previous: Some(current.id),
        };
        insert_state(&tx, &state, seq, OP)?;
        for ((kind, to), properties) in &edges {
            insert_relationship(&tx, &state, kind, to, properties, OP)?;
        }
        tx.commit().map_err(|e| sqlite_error(OP, &e))?;
        Ok(state)
    }

    fn relationships_inner(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        const OP: &str = "query_relationships";
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if !query.search_all_states {
            clauses.push("s.valid_to IS NULL".to_string());
        }
        let columns = [
            ("r.kind", query.kind.as_deref()),
            ("r.from_id", query.from.as_ref().map(EntityId::as_str)),
            ("r.to_id", query.to.as_ref().map(EntityId::as_str)),
            ("ea.kind", query.kind_a.as_deref()),
            ("eb.kind", query.kind_b.as_deref()),
        ];
        for (column, value) in columns {
            if let Some(value) = value {
                clauses.push(format!("{column} = ?"));
                values.push(text(value));
            }
        }
        let clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!("{clause} ORDER BY r.from_id, r.kind, r.to_id, s.seq");

        let conn = acquire_lock(&self.conn);
        let mut found = query_relationships(&conn, &sql, &values, OP)?;
        if !query.filter.is_empty() {
            found.retain(|rel| {
                query
                    .filter
                    .iter()
                    .all(|(key, value)| rel.properties.get(key) == Some(value))
            });
        }
        Ok(found)
    }

    fn search_entities_inner(&self, kinds: &[String], filter: &PropertyMap) -> Result<Vec<State>> {
        const OP: &str = "search_entities";
        let mut clause = "WHERE s.valid_to IS NULL".to_string();
        if !kinds.is_empty() {
            let marks = vec!["?"; kinds.len()].join(", ");
            clause.push_str(&format!(" AND e.kind IN ({marks})"));
        }
        clause.push_str(" ORDER BY e.created_at, e.id");
        let values: Vec<Value> = kinds.iter().map(|k| text(k.as_str())).collect();

        let conn = acquire_lock(&self.conn);
        let mut states = query_states(&conn, &clause, &values, OP)?;
        states.retain(|state| state.matches(filter));
        Ok(states)
    }

    fn destroy_entity_inner(&self, id: &EntityId) -> Result<bool> {
        const OP: &str = "destroy_entity";
        let mut conn = acquire_lock(&self.conn);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sqlite_error(OP, &e))?;
        tx.execute(
            "DELETE FROM kg_relationships WHERE from_id = ?1 OR to_id = ?1",
            [id.as_str()],
        )
        .map_err(|e| sqlite_error(OP, &e))?;
        tx.execute("DELETE FROM kg_states WHERE entity_id = ?1", [id.as_str()])
            .map_err(|e| sqlite_error(OP, &e))?;
        let removed = tx
            .execute("DELETE FROM kg_entities WHERE id = ?1", [id.as_str()])
            .map_err(|e| sqlite_error(OP, &e))?;
        tx.commit().map_err(|e| sqlite_error(OP, &e))?;
        Ok(removed > 0)
    }
}

impl GraphStore for SqliteGraphStore {
    #[instrument(skip(self, entity, properties), fields(entity_id = %entity.id))]
    fn create_entity(&self, entity: &Entity, properties: &PropertyMap) -> Result<Outcome<State>> {
        let start = Instant::now();
        let result = self.create_entity_inner(entity, properties);
        record_result(BACKEND, "create_entity", start, &result);
        result
    }

    fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        const OP: &str = "get_entity";
        let conn = acquire_lock(&self.conn);
        let row = conn
            .query_row(
                "SELECT kind, immutable, created_at FROM kg_entities WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| sqlite_error(OP, &e))?;
        row.map(|(kind, immutable, created_at)| {
            Ok(Entity {
                id: id.clone(),
                kind,
                immutable: decode_properties(&immutable, OP)?,
                created_at: decode_time(created_at, OP)?,
            })
        })
        .transpose()
    }

    fn current_state(&self, id: &EntityId) -> Result<Option<State>> {
        let conn = acquire_lock(&self.conn);
        Ok(query_states(
            &conn,
            "WHERE s.entity_id = ?1 AND s.valid_to IS NULL",
            &[text(id.as_str())],
            "current_state",
        )?
        .into_iter()
        .next())
    }

    #[instrument(skip(self, patch), fields(entity_id = %id))]
    fn patch_entity(&self, id: &EntityId, patch: &StatePatch, at: Timestamp) -> Result<State> {
        let start = Instant::now();
        let result = self.patch_entity_inner(id, patch, at);
        record_result(BACKEND, "patch_entity", start, &result);
        result
    }

    fn state(&self, id: &StateId) -> Result<Option<State>> {
        let conn = acquire_lock(&self.conn);
        Ok(query_states(&conn, "WHERE s.id = ?1", &[text(id.as_str())], "get_state")?
            .into_iter()
            .next())
    }

    fn states(&self, id: &EntityId) -> Result<Vec<State>> {
        let conn = acquire_lock(&self.conn);
        query_states(
            &conn,
            "WHERE s.entity_id = ?1 ORDER BY s.seq DESC",
            &[text(id.as_str())],
            "list_states",
        )
    }

    fn state_at(&self, id: &EntityId, at: Timestamp) -> Result<Option<State>> {
        let conn = acquire_lock(&self.conn);
        Ok(query_states(
            &conn,
            "WHERE s.entity_id = ?1 AND s.valid_from <= ?2 AND (s.valid_to IS NULL OR s.valid_to > ?2) \
             ORDER BY s.seq DESC LIMIT 1",
            &[text(id.as_str()), Value::Integer(to_micros(at))],
            "state_at",
        )?
        .into_iter()
        .next())
    }

    fn search_entities(&self, kinds: &[String], filter: &PropertyMap) -> Result<Vec<State>> {
        let start = Instant::now();
        let result = self.search_entities_inner(kinds, filter);
        record_result(BACKEND, "search_entities", start, &result);
        result
    }

    fn relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        let start = Instant::now();
        let result = self.relationships_inner(query);
        record_result(BACKEND, "query_relationships", start, &result);
        result
    }

    fn state_relationships(&self, state: &StateId) -> Result<Vec<Relationship>> {
        let conn = acquire_lock(&self.conn);
        query_relationships(
            &conn,
            "WHERE r.state_id = ?1 ORDER BY r.kind, r.to_id",
            &[text(state.as_str())],
            "state_relationships",
        )
    }

    fn diff_properties(&self, from: &StateId, to: &StateId) -> Result<Vec<PropertyDiff>> {
        let old = self
            .state(from)?
            .ok_or_else(|| NotFound::State(from.to_string()))?;
        let new = self
            .state(to)?
            .ok_or_else(|| NotFound::State(to.to_string()))?;
        Ok(diff_properties(&old.properties, &new.properties))
    }

    #[instrument(skip(self), fields(entity_id = %id))]
    fn destroy_entity(&self, id: &EntityId) -> Result<bool> {
        let start = Instant::now();
        let result = self.destroy_entity_inner(id);
        record_result(BACKEND, "destroy_entity", start, &result);
        result
    }

    fn clear(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute_batch(
            "DELETE FROM kg_relationships; DELETE FROM kg_states; DELETE FROM kg_entities;",
        )
        .map_err(|e| sqlite_error("clear_graph", &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PropertyValue, RelationshipChange};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn t(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn props(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn create(store: &SqliteGraphStore, id: &str, kind: &str, at: Timestamp) -> State {
        let entity = Entity::new(EntityId::new(id), kind, at);
        store
            .create_entity(&entity, &props(&[("height", PropertyValue::Int(180))]))
            .unwrap()
            .applied()
            .unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let state = create(&store, "jack", "User", t(1));
        assert!(state.is_current());
        assert_eq!(state.previous, None);

        let entity = store.get_entity(&EntityId::new("jack")).unwrap().unwrap();
        assert_eq!(entity.kind, "User");
        assert_eq!(entity.created_at, t(1));
        assert_eq!(
            store.current_state(&EntityId::new("jack")).unwrap(),
            Some(state)
        );
    }

    #[test]
    fn test_duplicate_create_is_skipped() {
        let store = SqliteGraphStore::in_memory().unwrap();
        create(&store, "jack", "User", t(1));
        let entity = Entity::new(EntityId::new("jack"), "User", t(2));
        let outcome = store.create_entity(&entity, &PropertyMap::new()).unwrap();
        assert_eq!(outcome, Outcome::Skipped(Conflict::DuplicateId("jack".into())));
        assert_eq!(store.states(&EntityId::new("jack")).unwrap().len(), 1);
    }

    #[test]
    fn test_patch_closes_previous_interval() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let id = EntityId::new("jack");
        let first = create(&store, "jack", "User", t(1));
        let patch = StatePatch::new().with_set(props(&[("height", PropertyValue::Int(175))]));
        let second = store.patch_entity(&id, &patch, t(2)).unwrap();

        assert_eq!(second.previous, Some(first.id.clone()));
        let old = store.state(&first.id).unwrap().unwrap();
        assert_eq!(old.validity, Validity::between(t(1), t(2)));

        let history = store.states(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);

        let at = store.state_at(&id, t(1) + ChronoDuration::minutes(30)).unwrap().unwrap();
        assert_eq!(at.id, first.id);
        assert_eq!(store.state_at(&id, t(2)).unwrap().unwrap().id, second.id);
        assert!(store.state_at(&id, t(0)).unwrap().is_none());
    }

    #[test]
    fn test_patch_rejects_backdated_change() {
        let store = SqliteGraphStore::in_memory().unwrap();
        create(&store, "jack", "User", t(5));
        let err = store
            .patch_entity(&EntityId::new("jack"), &StatePatch::new(), t(4))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_patch_unknown_entity() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let err = store
            .patch_entity(&EntityId::new("ghost"), &StatePatch::new(), t(1))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(NotFound::Entity(_))));
    }

    #[test]
    fn test_relationships_copied_into_new_states() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let jack = EntityId::new("jack");
        create(&store, "jack", "User", t(1));
        create(&store, "reading", "Habit", t(1));

        let link = StatePatch::new().with_relationship(RelationshipChange::Create {
            kind: "LIKES".into(),
            to: EntityId::new("reading"),
            properties: props(&[("_deleted", PropertyValue::Bool(false))]),
        });
        store.patch_entity(&jack, &link, t(2)).unwrap();
        let patch = StatePatch::new().with_set(props(&[("height", PropertyValue::Int(170))]));
        let latest = store.patch_entity(&jack, &patch, t(3)).unwrap();

        let current = store
            .relationships(&RelationshipQuery::new().with_kind("LIKES"))
            .unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].state_id, latest.id);

        let all = store
            .relationships(&RelationshipQuery::new().with_kind("LIKES").all_states())
            .unwrap();
        assert_eq!(all.len(), 2);

        let typed = store
            .relationships(
                &RelationshipQuery::new().with_endpoint_kinds(Some("User".into()), Some("Food".into())),
            )
            .unwrap();
        assert!(typed.is_empty());
    }

    #[test]
    fn test_search_entities_filters_kind_and_properties() {
        let store = SqliteGraphStore::in_memory().unwrap();
        create(&store, "jack", "User", t(1));
        create(&store, "reading", "Habit", t(1));

        let users = store.search_entities(&["User".to_string()], &PropertyMap::new()).unwrap();
        assert_eq!(users.len(), 1);
        let tall = store
            .search_entities(&[], &props(&[("height", PropertyValue::Int(180))]))
            .unwrap();
        assert_eq!(tall.len(), 2);
        let none = store
            .search_entities(&[], &props(&[("height", PropertyValue::Int(1))]))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_destroy_entity_removes_edges() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let jack = EntityId::new("jack");
        create(&store, "jack", "User", t(1));
        create(&store, "reading", "Habit", t(1));
        let link = StatePatch::new().with_relationship(RelationshipChange::Create {
            kind: "LIKES".into(),
            to: EntityId::new("reading"),
            properties: PropertyMap::new(),
        });
        store.patch_entity(&jack, &link, t(2)).unwrap();

        assert!(store.destroy_entity(&EntityId::new("reading")).unwrap());
        assert!(store.relationships(&RelationshipQuery::new()).unwrap().is_empty());
        assert!(!store.destroy_entity(&EntityId::new("reading")).unwrap());
        assert!(store.current_state(&jack).unwrap().is_some());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("graph.db");
        {
            let store = SqliteGraphStore::new(&path).unwrap();
            create(&store, "jack", "User", t(1));
        }
        let store = SqliteGraphStore::new(&path).unwrap();
        assert!(store.get_entity(&EntityId::new("jack")).unwrap().is_some());
        assert_eq!(store.db_path(), Some(path.as_path()));
    }
}
