//! Graph store over a Cypher-speaking database with the versioner procedures.
//!
//! Every operation is composed from the fragment builders in
//! [`crate::query::cypher`] and handed to a [`CypherExecutor`]. The database
//! maintains the entity/state chain itself through `graph.versioner.*`
//! procedures; this adapter only reads the resulting rows back into models.
//!
//! # Versioning granularity
//!
//! Each versioner procedure opens its own state. A [`StatePatch`] therefore
//! issues at most one of them: a lone edge creation or deletion goes through
//! the relationship procedures, anything else through one `patch` followed
//! by plain edge edits on the state it opened.

use crate::models::temporal::parse_timestamp;
use crate::models::{
    DiffOp, Entity, EntityId, PropertyDiff, PropertyMap, PropertyValue, Relationship,
    RelationshipChange, RelationshipQuery, State, StateId, StatePatch, Timestamp, Validity,
};
use crate::query::cypher::{self, StateEdge};
use crate::query::Query;
use crate::storage::traits::GraphStore;
use crate::{Conflict, Error, NotFound, Outcome, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Property holding the entity id on entity nodes.
pub const ID_KEY: &str = "Id";

/// Labels that mark versioning nodes rather than entity kinds.
const INTERNAL_LABELS: [&str; 2] = ["State", "R"];

/// A value returned by the database.
#[derive(Debug, Clone, PartialEq)]
pub enum CypherValue {
    /// `null`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    String(String),
    /// `date`.
    Date(NaiveDate),
    /// `localtime`.
    Time(NaiveTime),
    /// `localdatetime`.
    DateTime(NaiveDateTime),
    /// List.
    List(Vec<CypherValue>),
    /// Node.
    Node(Node),
    /// Relationship.
    Edge(Edge),
}

/// A node with its internal id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    /// Internal id.
    pub id: i64,
    /// Labels.
    pub labels: Vec<String>,
    /// Properties.
    pub properties: BTreeMap<String, CypherValue>,
}

/// A relationship with its internal id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Edge {
    /// Internal id.
    pub id: i64,
    /// Relationship type.
    pub kind: String,
    /// Properties.
    pub properties: BTreeMap<String, CypherValue>,
}

/// One result row, keyed by return column.
pub type Row = BTreeMap<String, CypherValue>;

impl CypherValue {
    /// Returns the string, if this is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer, if this is one.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Converts to a property value. Nulls, nodes, edges and non-string
    /// lists have no property representation.
    #[must_use]
    pub fn to_property_value(&self) -> Option<PropertyValue> {
        match self {
            Self::Bool(b) => Some(PropertyValue::Bool(*b)),
            Self::Int(i) => Some(PropertyValue::Int(*i)),
            Self::Float(f) => Some(PropertyValue::Float(*f)),
            Self::String(s) => Some(PropertyValue::String(s.clone())),
            Self::Date(d) => Some(PropertyValue::Date(*d)),
            Self::Time(t) => Some(PropertyValue::Time(*t)),
            Self::DateTime(dt) => Some(PropertyValue::DateTime(*dt)),
            Self::List(items) => items
                .iter()
                .map(|item| item.as_str().map(ToString::to_string))
                .collect::<Option<Vec<_>>>()
                .map(PropertyValue::StringList),
            Self::Null | Self::Node(_) | Self::Edge(_) => None,
        }
    }

    /// Reads a versioner date, given as `localdatetime` or an ISO string.
    #[must_use]
    pub fn to_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::DateTime(dt) => Some(dt.and_utc()),
            Self::String(s) => parse_timestamp(s).ok(),
            _ => None,
        }
    }
}

impl From<PropertyValue> for CypherValue {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::String(s) => Self::String(s),
            PropertyValue::Int(i) => Self::Int(i),
            PropertyValue::Float(f) => Self::Float(f),
            PropertyValue::Bool(b) => Self::Bool(b),
            PropertyValue::Date(d) => Self::Date(d),
            PropertyValue::Time(t) => Self::Time(t),
            PropertyValue::DateTime(dt) => Self::DateTime(dt),
            PropertyValue::StringList(items) => {
                Self::List(items.into_iter().map(Self::String).collect())
            },
        }
    }
}

fn property_map(properties: &BTreeMap<String, CypherValue>) -> PropertyMap {
    properties
        .iter()
        .filter_map(|(k, v)| v.to_property_value().map(|v| (k.clone(), v)))
        .collect()
}

/// Backing-store interface: runs one parameterized statement.
pub trait CypherExecutor: Send + Sync {
    /// Runs a statement and returns its rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] for timed out transactions and
    /// [`Error::OperationFailed`] for transport or statement failures.
    fn run(&self, query: &Query) -> Result<Vec<Row>>;

    /// Deletes every node and relationship.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation fails.
    fn clear(&self) -> Result<()>;
}

fn malformed(operation: &str, what: &str) -> Error {
    Error::failed(operation, format!("malformed row: {what}"))
}

fn node<'a>(row: &'a Row, column: &str, operation: &str) -> Result<&'a Node> {
    match row.get(column) {
        Some(CypherValue::Node(node)) => Ok(node),
        _ => Err(malformed(operation, column)),
    }
}

fn edge<'a>(row: &'a Row, column: &str, operation: &str) -> Result<&'a Edge> {
    match row.get(column) {
        Some(CypherValue::Edge(edge)) => Ok(edge),
        _ => Err(malformed(operation, column)),
    }
}

fn entity_ref(node: &Node, operation: &str) -> Result<(EntityId, String)> {
    let id = node
        .properties
        .get(ID_KEY)
        .and_then(CypherValue::as_str)
        .ok_or_else(|| malformed(operation, "entity id"))?;
    let kind = node
        .labels
        .iter()
        .find(|label| !INTERNAL_LABELS.contains(&label.as_str()))
        .cloned()
        .unwrap_or_default();
    Ok((EntityId::new(id), kind))
}

fn validity(has_state: &Edge, operation: &str) -> Result<Validity> {
    let start = has_state
        .properties
        .get("startDate")
        .and_then(CypherValue::to_timestamp)
        .ok_or_else(|| malformed(operation, "startDate"))?;
    Ok(
        match has_state
            .properties
            .get("endDate")
            .and_then(CypherValue::to_timestamp)
        {
            Some(end) => Validity::between(start, end),
            None => Validity::open(start),
        },
    )
}

fn state_from_row(row: &Row, operation: &str) -> Result<State> {
    let (entity_id, kind) = entity_ref(node(row, "a", operation)?, operation)?;
    let state = node(row, "state", operation)?;
    let validity = validity(edge(row, "has_state", operation)?, operation)?;
    Ok(State {
        id: StateId::new(state.id.to_string()),
        entity_id,
        kind,
        properties: property_map(&state.properties),
        validity,
        recorded_at: validity.start,
        previous: row
            .get("previous")
            .and_then(CypherValue::as_int)
            .map(|id| StateId::new(id.to_string())),
    })
}

fn relationship_from_row(row: &Row, operation: &str) -> Result<Relationship> {
    let (from, _) = entity_ref(node(row, "a", operation)?, operation)?;
    let (to, _) = entity_ref(node(row, "b", operation)?, operation)?;
    let r = edge(row, "r", operation)?;
    let state = node(row, "state", operation)?;
    Ok(Relationship {
        from,
        kind: r.kind.clone(),
        to,
        properties: property_map(&r.properties),
        state_id: StateId::new(state.id.to_string()),
        validity: validity(edge(row, "has_state", operation)?, operation)?,
    })
}

fn id_filter(id: &EntityId) -> PropertyMap {
    let mut filter = PropertyMap::new();
    filter.insert(ID_KEY.to_string(), PropertyValue::String(id.to_string()));
    filter
}

fn internal_id(id: &StateId) -> Option<i64> {
    id.as_str().parse().ok()
}

fn current_edge(kind: &str) -> Query {
    cypher::match_versioned_relationship("a", "r", Some(kind), &PropertyMap::new(), "b", StateEdge::Current)
}

/// A lone edge creation or deletion maps onto one versioner procedure, which
/// opens the new state itself.
fn versioner_relationship(entity: &Query, change: &RelationshipChange, at: Timestamp) -> Option<Query> {
    let target = cypher::match_node("b", None, &id_filter(change.to()));
    match change {
        RelationshipChange::Create {
            kind, properties, ..
        } => Some(Query::join([
            entity.clone(),
            target,
            cypher::create_relationship("a", kind, properties, "b", at),
            cypher::return_vars(&["relationship"]),
        ])),
        RelationshipChange::Delete { kind, .. } => Some(Query::join([
            entity.clone(),
            target,
            cypher::delete_relationship("a", kind, "b", at),
            cypher::return_vars(&["result"]),
        ])),
        RelationshipChange::Update { .. } => None,
    }
}

/// [`GraphStore`] driving a Cypher database through the versioner procedures.
pub struct CypherGraphStore<E: CypherExecutor> {
    executor: E,
}

impl<E: CypherExecutor> CypherGraphStore<E> {
    /// Wraps an executor.
    pub const fn new(executor: E) -> Self {
        Self { executor }
    }

    /// Returns the executor.
    pub const fn executor(&self) -> &E {
        &self.executor
    }

    fn run(&self, operation: &'static str, query: &Query) -> Result<Vec<Row>> {
        debug!(operation, query = %query.text, "Running cypher statement");
        metrics::counter!("cypher_statements_total", "operation" => operation).increment(1);
        self.executor.run(query)
    }

    fn query_states(&self, operation: &'static str, entity: Option<&EntityId>, condition: Query) -> Result<Vec<State>> {
        let anchor = entity.map_or_else(Query::default, |id| {
            cypher::match_node("a", None, &id_filter(id))
        });
        let query = Query::join([
            anchor,
            cypher::match_relationship("a", "has_state", Some("HAS_STATE"), &PropertyMap::new(), "state"),
            condition,
            Query::new("OPTIONAL MATCH (state)-[:PREVIOUS]->(prev)"),
            Query::new("RETURN a, has_state, state, id(prev) AS previous"),
        ]);
        self.run(operation, &query)?
            .iter()
            .map(|row| state_from_row(row, operation))
            .collect()
    }

    fn query_relationships(&self, operation: &'static str, prelude: Vec<Query>, versioned: Query, condition: Query) -> Result<Vec<Relationship>> {
        let mut parts = prelude;
        parts.push(versioned);
        parts.push(condition);
        parts.push(cypher::return_vars(&["a", "b", "r", "has_state", "state"]));
        self.run(operation, &Query::join(parts))?
            .iter()
            .map(|row| relationship_from_row(row, operation))
            .collect()
    }

    fn missing_current(&self, id: &EntityId) -> Result<Error> {
        Ok(if self.get_entity(id)?.is_some() {
            NotFound::NoCurrentState(id.to_string()).into()
        } else {
            NotFound::Entity(id.to_string()).into()
        })
    }
}

impl<E: CypherExecutor> GraphStore for CypherGraphStore<E> {
    #[instrument(skip(self, entity, properties), fields(entity_id = %entity.id))]
    fn create_entity(&self, entity: &Entity, properties: &PropertyMap) -> Result<Outcome<State>> {
        if self.get_entity(&entity.id)?.is_some() {
            return Ok(Outcome::Skipped(Conflict::DuplicateId(entity.id.to_string())));
        }
        let mut immutable = entity.immutable.clone();
        immutable.extend(id_filter(&entity.id));
        let query = Query::join([
            cypher::init_entity(&entity.kind, &immutable, properties, entity.created_at),
            cypher::return_vars(&["node"]),
        ]);
        self.run("create_entity", &query)?;
        self.current_state(&entity.id)?
            .map(Outcome::Applied)
            .ok_or_else(|| NotFound::NoCurrentState(entity.id.to_string()).into())
    }

    fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        const OP: &str = "get_entity";
        let query = Query::join([
            cypher::match_node("a", None, &id_filter(id)),
            cypher::match_relationship("a", "has_state", Some("HAS_STATE"), &PropertyMap::new(), "state"),
            Query::new("RETURN a, min(has_state.startDate) AS created_at"),
        ]);
        let rows = self.run(OP, &query)?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let a = node(row, "a", OP)?;
        let (entity_id, kind) = entity_ref(a, OP)?;
        let created_at = row
            .get("created_at")
            .and_then(CypherValue::to_timestamp)
            .ok_or_else(|| malformed(OP, "created_at"))?;
        let mut immutable = property_map(&a.properties);
        immutable.remove(ID_KEY);
        Ok(Some(Entity {
            id: entity_id,
            kind,
            immutable,
            created_at,
        }))
    }

    fn current_state(&self, id: &EntityId) -> Result<Option<State>> {
        Ok(self
            .query_states("current_state", Some(id), Query::new("WHERE has_state.endDate IS NULL"))?
            .into_iter()
            .next())
    }

    #[instrument(skip(self, patch), fields(entity_id = %id))]
    fn patch_entity(&self, id: &EntityId, patch: &StatePatch, at: Timestamp) -> Result<State> {
        let Some(current) = self.current_state(id)? else {
            return Err(self.missing_current(id)?);
        };
        if at < current.validity.start {
            return Err(Error::InvalidInput(format!(
                "change precedes the current state of '{id}'"
            )));
        }

        let entity = cypher::match_node("a", None, &id_filter(id));
        let changes_properties = !patch.set.is_empty() || !patch.remove.is_empty();
        let lone = match patch.relationships.as_slice() {
            [change] if !changes_properties => versioner_relationship(&entity, change, at),
            _ => None,
        };
        if let Some(query) = lone {
            self.run("patch_relationship", &query)?;
            return self
                .current_state(id)?
                .ok_or_else(|| NotFound::NoCurrentState(id.to_string()).into());
        }

        // The versioner patch is additive: blank the removed keys, then drop them.
        let mut updates = patch.set.clone();
        for key in &patch.remove {
            updates.insert(key.clone(), PropertyValue::String(String::new()));
        }
        let query = Query::join([
            entity.clone(),
            cypher::patch_properties("a", &updates, at, None),
            cypher::remove_properties("node", &patch.remove),
            cypher::return_vars(&["node"]),
        ]);
        self.run("patch_entity", &query)?;

        // Edges are edited in place on the state the patch just opened.
        for change in &patch.relationships {
            let target = cypher::match_node("b", None, &id_filter(change.to()));
            let query = match change {
                RelationshipChange::Create {
                    kind, properties, ..
                } => Query::join([
                    entity.clone(),
                    target,
                    cypher::match_node("state", Some("State"), &PropertyMap::new()),
                    cypher::match_relationship("a", "current", Some("CURRENT"), &PropertyMap::new(), "state"),
                    cypher::create_state_relationship("state", kind, properties, "b"),
                ]),
                RelationshipChange::Delete { kind, .. } => Query::join([
                    entity.clone(),
                    target,
                    current_edge(kind),
                    cypher::delete("r"),
                ]),
                RelationshipChange::Update {
                    kind, properties, ..
                } => Query::join([
                    entity.clone(),
                    target,
                    current_edge(kind),
                    cypher::set_properties("r", properties),
                ]),
            };
            self.run("patch_relationship", &query)?;
        }

        match self.current_state(id)? {
            Some(state) => Ok(state),
            None => Err(NotFound::NoCurrentState(id.to_string()).into()),
        }
    }

    fn state(&self, id: &StateId) -> Result<Option<State>> {
        let Some(internal) = internal_id(id) else {
            return Ok(None);
        };
        Ok(self
            .query_states(
                "get_state",
                None,
                cypher::where_internal_id(&[("state", internal)]),
            )?
            .into_iter()
            .next())
    }

    fn states(&self, id: &EntityId) -> Result<Vec<State>> {
        let mut states = self.query_states("list_states", Some(id), Query::default())?;
        states.sort_by(|a, b| {
            b.validity
                .start
                .cmp(&a.validity.start)
                .then_with(|| internal_id(&b.id).cmp(&internal_id(&a.id)))
        });
        Ok(states)
    }

    fn state_at(&self, id: &EntityId, at: Timestamp) -> Result<Option<State>> {
        Ok(self
            .query_states("state_at", Some(id), cypher::where_state_on_date("has_state", at))?
            .into_iter()
            .next())
    }

    fn search_entities(&self, kinds: &[String], filter: &PropertyMap) -> Result<Vec<State>> {
        let query = Query::join([
            cypher::match_node("a", None, &PropertyMap::new()),
            cypher::where_kind_in("a", kinds),
            cypher::match_relationship("a", "has_state", Some("HAS_STATE"), &PropertyMap::new(), "state"),
            Query::new("WHERE has_state.endDate IS NULL"),
            Query::new("OPTIONAL MATCH (state)-[:PREVIOUS]->(prev)"),
            Query::new("RETURN a, has_state, state, id(prev) AS previous"),
        ]);
        let mut states = self
            .run("search_entities", &query)?
            .iter()
            .map(|row| state_from_row(row, "search_entities"))
            .collect::<Result<Vec<_>>>()?;
        states.retain(|state| state.matches(filter));
        Ok(states)
    }

    fn relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        let mut prelude = Vec::new();
        if query.from.is_some() || query.kind_a.is_some() {
            let filter = query.from.as_ref().map(id_filter).unwrap_or_default();
            prelude.push(cypher::match_node("a", query.kind_a.as_deref(), &filter));
        }
        if query.to.is_some() || query.kind_b.is_some() {
            let filter = query.to.as_ref().map(id_filter).unwrap_or_default();
            prelude.push(cypher::match_node("b", query.kind_b.as_deref(), &filter));
        }
        let versioned = cypher::match_versioned_relationship(
            "a",
            "r",
            query.kind.as_deref(),
            &query.filter,
            "b",
            StateEdge::HasState,
        );
        let condition = if query.search_all_states {
            Query::default()
        } else {
            Query::new("WHERE has_state.endDate IS NULL")
        };
        self.query_relationships("query_relationships", prelude, versioned, condition)
    }

    fn state_relationships(&self, state: &StateId) -> Result<Vec<Relationship>> {
        let Some(internal) = internal_id(state) else {
            return Ok(Vec::new());
        };
        let versioned = cypher::match_versioned_relationship(
            "a",
            "r",
            None,
            &PropertyMap::new(),
            "b",
            StateEdge::HasState,
        );
        self.query_relationships(
            "state_relationships",
            Vec::new(),
            versioned,
            cypher::where_internal_id(&[("state", internal)]),
        )
    }

    fn diff_properties(&self, from: &StateId, to: &StateId) -> Result<Vec<PropertyDiff>> {
        const OP: &str = "diff_states";
        let (Some(a), Some(b)) = (internal_id(from), internal_id(to)) else {
            return Err(NotFound::State(format!("{from} or {to}")).into());
        };
        if self.state(from)?.is_none() {
            return Err(NotFound::State(from.to_string()).into());
        }
        if self.state(to)?.is_none() {
            return Err(NotFound::State(to.to_string()).into());
        }
        let query = Query::join([
            cypher::match_node("state_from", Some("State"), &PropertyMap::new()),
            cypher::match_node("state_to", Some("State"), &PropertyMap::new()),
            cypher::where_internal_id(&[("state_from", a), ("state_to", b)]),
            cypher::diff_states("state_from", "state_to"),
            cypher::return_vars(&["operation", "label", "oldValue", "newValue"]),
        ]);
        self.run(OP, &query)?
            .iter()
            .map(|row| {
                let op = row
                    .get("operation")
                    .and_then(CypherValue::as_str)
                    .and_then(DiffOp::parse)
                    .ok_or_else(|| malformed(OP, "operation"))?;
                let key = row
                    .get("label")
                    .and_then(CypherValue::as_str)
                    .ok_or_else(|| malformed(OP, "label"))?;
                Ok(PropertyDiff {
                    op,
                    key: key.to_string(),
                    old: row.get("oldValue").and_then(CypherValue::to_property_value),
                    new: row.get("newValue").and_then(CypherValue::to_property_value),
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(entity_id = %id))]
    fn destroy_entity(&self, id: &EntityId) -> Result<bool> {
        if self.get_entity(id)?.is_none() {
            return Ok(false);
        }
        let entity = cypher::match_node("a", None, &id_filter(id));
        let chain = Query::join([
            entity.clone(),
            cypher::match_relationship("a", "has_state", Some("HAS_STATE"), &PropertyMap::new(), "state"),
            Query::new("OPTIONAL MATCH (state)-->(r_node:R)"),
            Query::new("DETACH DELETE r_node, state"),
        ]);
        self.run("destroy_states", &chain)?;
        self.run("destroy_entity", &Query::join([entity, cypher::detach_delete("a")]))?;
        Ok(true)
    }

    fn clear(&self) -> Result<()> {
        self.executor.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned rows and records every statement.
    #[derive(Default)]
    struct ScriptedExecutor {
        responses: Mutex<VecDeque<Vec<Row>>>,
        statements: Mutex<Vec<Query>>,
    }

    impl ScriptedExecutor {
        fn respond(&self, rows: Vec<Row>) {
            self.responses.lock().unwrap().push_back(rows);
        }

        fn texts(&self) -> Vec<String> {
            self.statements
                .lock()
                .unwrap()
                .iter()
                .map(|q| q.text.clone())
                .collect()
        }
    }

    impl CypherExecutor for ScriptedExecutor {
        fn run(&self, query: &Query) -> Result<Vec<Row>> {
            self.statements.lock().unwrap().push(query.clone());
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or_default())
        }

        fn clear(&self) -> Result<()> {
            self.statements.lock().unwrap().push(Query::new("CLEAR"));
            Ok(())
        }
    }

    fn t(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn entity_node(id: &str, kind: &str) -> CypherValue {
        let mut properties = BTreeMap::new();
        properties.insert(ID_KEY.to_string(), CypherValue::String(id.into()));
        CypherValue::Node(Node {
            id: 1,
            labels: vec![kind.into()],
            properties,
        })
    }

    fn has_state(start: Timestamp, end: Option<Timestamp>) -> CypherValue {
        let mut properties = BTreeMap::new();
        properties.insert("startDate".into(), CypherValue::DateTime(start.naive_utc()));
        if let Some(end) = end {
            properties.insert("endDate".into(), CypherValue::DateTime(end.naive_utc()));
        }
        CypherValue::Edge(Edge {
            id: 7,
            kind: "HAS_STATE".into(),
            properties,
        })
    }

    fn state_row(state_id: i64, height: i64, start: Timestamp, previous: Option<i64>) -> Row {
        let mut properties = BTreeMap::new();
        properties.insert("height".into(), CypherValue::Int(height));
        let mut row = Row::new();
        row.insert("a".into(), entity_node("jack", "User"));
        row.insert("has_state".into(), has_state(start, None));
        row.insert(
            "state".into(),
            CypherValue::Node(Node {
                id: state_id,
                labels: vec!["State".into()],
                properties,
            }),
        );
        row.insert(
            "previous".into(),
            previous.map_or(CypherValue::Null, CypherValue::Int),
        );
        row
    }

    #[test]
    fn test_create_entity_uses_init_primitive() {
        let store = CypherGraphStore::new(ScriptedExecutor::default());
        store.executor().respond(Vec::new());
        store.executor().respond(Vec::new());
        store.executor().respond(vec![state_row(10, 180, t(1), None)]);

        let entity = Entity::new(EntityId::new("jack"), "User", t(1));
        let mut props = PropertyMap::new();
        props.insert("height".into(), PropertyValue::Int(180));
        let state = store.create_entity(&entity, &props).unwrap().applied().unwrap();

        assert_eq!(state.id, StateId::new("10"));
        assert_eq!(state.kind, "User");
        assert_eq!(state.get("height"), Some(&PropertyValue::Int(180)));
        let texts = store.executor().texts();
        assert!(texts[1].starts_with("CALL graph.versioner.init(\"User\""));
        assert!(texts[1].contains("Id: $new_Id_immutable"));
    }

    #[test]
    fn test_create_existing_entity_is_skipped() {
        let store = CypherGraphStore::new(ScriptedExecutor::default());
        let mut row = Row::new();
        row.insert("a".into(), entity_node("jack", "User"));
        row.insert("created_at".into(), CypherValue::DateTime(t(1).naive_utc()));
        store.executor().respond(vec![row]);

        let entity = Entity::new(EntityId::new("jack"), "User", t(2));
        let outcome = store.create_entity(&entity, &PropertyMap::new()).unwrap();
        assert_eq!(outcome, Outcome::Skipped(Conflict::DuplicateId("jack".into())));
        assert_eq!(store.executor().texts().len(), 1);
    }

    #[test]
    fn test_patch_removes_keys_after_blanking() {
        let store = CypherGraphStore::new(ScriptedExecutor::default());
        store.executor().respond(vec![state_row(10, 180, t(1), None)]);
        store.executor().respond(Vec::new());
        store.executor().respond(vec![state_row(11, 180, t(2), Some(10))]);

        let patch = StatePatch::new().with_removed(["weight"]);
        let state = store.patch_entity(&EntityId::new("jack"), &patch, t(2)).unwrap();
        assert_eq!(state.previous, Some(StateId::new("10")));

        let statements = store.executor().statements.lock().unwrap().clone();
        let patch_query = &statements[1];
        assert!(patch_query.text.contains("CALL graph.versioner.patch(a, {weight: $new_weight_a}"));
        assert!(patch_query.text.contains("REMOVE node.weight"));
        assert_eq!(
            patch_query.params.get("new_weight_a"),
            Some(&serde_json::json!(""))
        );
    }

    #[test]
    fn test_patch_rejects_backdated_change() {
        let store = CypherGraphStore::new(ScriptedExecutor::default());
        store.executor().respond(vec![state_row(10, 180, t(5), None)]);
        let err = store
            .patch_entity(&EntityId::new("jack"), &StatePatch::new(), t(4))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    fn versioner_calls(texts: &[String]) -> usize {
        texts.iter().filter(|t| t.contains("CALL graph.versioner.")).count()
    }

    #[test]
    fn test_lone_relationship_change_uses_versioner() {
        let store = CypherGraphStore::new(ScriptedExecutor::default());
        store.executor().respond(vec![state_row(10, 180, t(1), None)]);
        store.executor().respond(Vec::new());
        store.executor().respond(vec![state_row(11, 180, t(2), Some(10))]);
        let patch = StatePatch::new().with_relationship(RelationshipChange::Create {
            kind: "LIKES".into(),
            to: EntityId::new("reading"),
            properties: PropertyMap::new(),
        });
        store.patch_entity(&EntityId::new("jack"), &patch, t(2)).unwrap();

        let texts = store.executor().texts();
        assert!(texts[1].contains("graph.versioner.relationship.create(a, b, \"LIKES\""));
        assert_eq!(versioner_calls(&texts), 1);
    }

    #[test]
    fn test_replacing_an_edge_opens_one_state() {
        let store = CypherGraphStore::new(ScriptedExecutor::default());
        store.executor().respond(vec![state_row(10, 180, t(1), None)]);
        let patch = StatePatch::new()
            .with_relationship(RelationshipChange::Delete {
                kind: "LIKES".into(),
                to: EntityId::new("anna"),
            })
            .with_relationship(RelationshipChange::Create {
                kind: "LIKES".into(),
                to: EntityId::new("anna"),
                properties: [("level".to_string(), PropertyValue::Int(3))].into(),
            });
        store.executor().respond(Vec::new());
        store.executor().respond(Vec::new());
        store.executor().respond(Vec::new());
        store.executor().respond(vec![state_row(11, 180, t(2), Some(10))]);
        let state = store.patch_entity(&EntityId::new("jack"), &patch, t(2)).unwrap();
        assert_eq!(state.previous, Some(StateId::new("10")));

        let texts = store.executor().texts();
        assert_eq!(versioner_calls(&texts), 1);
        assert!(texts[1].contains("CALL graph.versioner.patch(a, {}"));
        assert!(texts[2].contains("MATCH (a)-[current:CURRENT]->(state)"));
        assert!(texts[2].ends_with("DELETE r"));
        assert!(texts[3].contains("CREATE (state)-[r:LIKES {level: $new_level_r}]->(r_node)"));
    }

    #[test]
    fn test_edge_update_with_properties_opens_one_state() {
        let store = CypherGraphStore::new(ScriptedExecutor::default());
        store.executor().respond(vec![state_row(10, 180, t(1), None)]);
        let mut since = PropertyMap::new();
        since.insert("since".into(), PropertyValue::Int(2020));
        let patch = StatePatch::new()
            .with_set([("height".to_string(), PropertyValue::Int(181))].into())
            .with_relationship(RelationshipChange::Update {
                kind: "KNOWS".into(),
                to: EntityId::new("anna"),
                properties: since,
            });
        store.executor().respond(Vec::new());
        store.executor().respond(Vec::new());
        store.executor().respond(vec![state_row(11, 181, t(2), Some(10))]);
        store.patch_entity(&EntityId::new("jack"), &patch, t(2)).unwrap();

        let texts = store.executor().texts();
        assert_eq!(versioner_calls(&texts), 1);
        assert!(texts[1].contains("{height: $new_height_a}"));
        assert!(texts[2].ends_with("SET r.since = $new_since_r"));
    }

    #[test]
    fn test_relationships_current_only_by_default() {
        let store = CypherGraphStore::new(ScriptedExecutor::default());
        store
            .relationships(&RelationshipQuery::new().with_kind("LIKES").from(EntityId::new("jack")))
            .unwrap();
        store
            .relationships(&RelationshipQuery::new().with_kind("LIKES").all_states())
            .unwrap();
        let texts = store.executor().texts();
        assert!(texts[0].starts_with("MATCH (a {Id: $Id_a})"));
        assert!(texts[0].contains("WHERE has_state.endDate IS NULL"));
        assert!(!texts[1].contains("endDate IS NULL"));
        assert!(texts[1].contains("-[r:LIKES]->(r_node)"));
    }

    #[test]
    fn test_diff_reads_versioner_rows() {
        let store = CypherGraphStore::new(ScriptedExecutor::default());
        store.executor().respond(vec![state_row(10, 180, t(1), None)]);
        store.executor().respond(vec![state_row(11, 175, t(2), Some(10))]);
        let mut row = Row::new();
        row.insert("operation".into(), CypherValue::String("UPDATE".into()));
        row.insert("label".into(), CypherValue::String("height".into()));
        row.insert("oldValue".into(), CypherValue::Int(180));
        row.insert("newValue".into(), CypherValue::Int(175));
        store.executor().respond(vec![row]);

        let diffs = store
            .diff_properties(&StateId::new("10"), &StateId::new("11"))
            .unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].op, DiffOp::Update);
        assert_eq!(diffs[0].new, Some(PropertyValue::Int(175)));
        assert!(store.executor().texts()[2].contains("CALL graph.versioner.diff(state_from, state_to)"));
    }

    #[test]
    fn test_cypher_value_conversions() {
        let list = CypherValue::from(PropertyValue::StringList(vec!["a".into()]));
        assert_eq!(
            list.to_property_value(),
            Some(PropertyValue::StringList(vec!["a".into()]))
        );
        assert_eq!(CypherValue::Null.to_property_value(), None);
        assert_eq!(
            CypherValue::String("2024-01-01T01:00:00".into()).to_timestamp(),
            Some(t(1))
        );
    }
}
