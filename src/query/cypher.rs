//! Cypher fragment builders over the state-versioning primitives.
//!
//! The backing store exposes a small set of versioner procedures
//! (`graph.versioner.*`) that maintain the entity/state chain. Builders here
//! wrap those procedures plus the plain clauses needed to reach them.
//!
//! # Parameter naming
//!
//! | Builder | Parameter key |
//! |---------|---------------|
//! | [`match_node`], [`match_relationship`] | `{key}_{var}` |
//! | [`patch_properties`], [`set_properties`] | `new_{key}_{var}` |
//! | [`init_entity`] | `new_{key}_immutable`, `new_{key}_state` |
//! | [`create_relationship`] | `new_{key}` |
//! | [`create_state_relationship`] | `new_{key}_r` |
//!
//! Builders never fail. They guarantee syntax safety only; whether a kind or
//! key makes sense is checked by the ontology before a query is built.

use crate::models::temporal::{Timestamp, format_timestamp};
use crate::models::PropertyMap;
use crate::query::sanitize;
use crate::query::{Params, Query};

/// Edge from an entity to the states reachable through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEdge {
    /// Only the current state.
    Current,
    /// Every state in the history.
    HasState,
}

impl StateEdge {
    /// Relationship type of the edge.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "CURRENT",
            Self::HasState => "HAS_STATE",
        }
    }

    /// Variable name the edge is bound to.
    #[must_use]
    pub const fn var(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::HasState => "has_state",
        }
    }
}

fn params(properties: &PropertyMap, key: impl Fn(&str) -> String) -> Params {
    properties
        .iter()
        .map(|(k, v)| (key(k), v.to_json()))
        .collect()
}

fn placeholders(properties: &PropertyMap, key: impl Fn(&str) -> String) -> String {
    properties
        .keys()
        .map(|k| format!("{k}: ${}", key(k)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn localdatetime(at: Timestamp) -> String {
    format!("localdatetime(\"{}\")", format_timestamp(at))
}

fn var_list(vars: &[&str]) -> String {
    vars.iter()
        .map(|v| sanitize::identifier(v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Creates an entity with its version-zero state.
#[must_use]
pub fn init_entity(
    kind: &str,
    immutable: &PropertyMap,
    state: &PropertyMap,
    created_at: Timestamp,
) -> Query {
    let kind = sanitize::identifier(kind);
    let immutable = sanitize::keys(immutable);
    let state = sanitize::keys(state);
    let immutable_key = |k: &str| format!("new_{k}_immutable");
    let state_key = |k: &str| format!("new_{k}_state");

    let text = format!(
        "CALL graph.versioner.init(\"{kind}\", {{{}}}, {{{}}}, \"\", {})\nYIELD node",
        placeholders(&immutable, immutable_key),
        placeholders(&state, state_key),
        localdatetime(created_at),
    );
    let mut all = params(&immutable, immutable_key);
    all.extend(params(&state, state_key));
    Query::new(text).with_params(all)
}

/// Matches nodes by optional kind label and exact property filter.
#[must_use]
pub fn match_node(var: &str, kind: Option<&str>, filter: &PropertyMap) -> Query {
    let var = sanitize::identifier(var);
    let filter = sanitize::keys(filter);
    let label = kind
        .map(sanitize::identifier)
        .filter(|k| !k.is_empty())
        .map(|k| format!(":{k}"))
        .unwrap_or_default();
    let suffixed = |k: &str| format!("{k}_{var}");

    let text = if filter.is_empty() {
        format!("MATCH ({var}{label})")
    } else {
        format!("MATCH ({var}{label} {{{}}})", placeholders(&filter, suffixed))
    };
    Query::new(text).with_params(params(&filter, suffixed))
}

/// Sets properties in place on a matched node or relationship.
#[must_use]
pub fn set_properties(var: &str, properties: &PropertyMap) -> Query {
    if properties.is_empty() {
        return Query::default();
    }
    let var = sanitize::identifier(var);
    let properties = sanitize::keys(properties);
    let new_key = |k: &str| format!("new_{k}_{var}");

    let assignments = properties
        .keys()
        .map(|k| format!("{var}.{k} = ${}", new_key(k)))
        .collect::<Vec<_>>()
        .join(", ");
    Query::new(format!("SET {assignments}")).with_params(params(&properties, new_key))
}

/// Creates a new state for a matched entity, closing the current interval.
#[must_use]
pub fn patch_properties(
    var: &str,
    updates: &PropertyMap,
    changed_at: Timestamp,
    additional_label: Option<&str>,
) -> Query {
    let var = sanitize::identifier(var);
    let updates = sanitize::keys(updates);
    let label = additional_label.map(sanitize::identifier).unwrap_or_default();
    let new_key = |k: &str| format!("new_{k}_{var}");

    let text = format!(
        "CALL graph.versioner.patch({var}, {{{}}}, \"{label}\", {})\nYIELD node",
        placeholders(&updates, new_key),
        localdatetime(changed_at),
    );
    Query::new(text).with_params(params(&updates, new_key))
}

/// Removes property keys from a matched node.
#[must_use]
pub fn remove_properties(var: &str, keys: &[impl AsRef<str>]) -> Query {
    if keys.is_empty() {
        return Query::default();
    }
    let var = sanitize::identifier(var);
    let targets = keys
        .iter()
        .map(|k| format!("{var}.{}", sanitize::identifier(k.as_ref())))
        .collect::<Vec<_>>()
        .join(", ");
    Query::new(format!("REMOVE {targets}"))
}

/// Returns the listed variables.
#[must_use]
pub fn return_vars(vars: &[&str]) -> Query {
    Query::new(format!("RETURN {}", var_list(vars)))
}

/// Pipes the listed variables to the next clause.
#[must_use]
pub fn with_vars(vars: &[&str]) -> Query {
    Query::new(format!("WITH {}", var_list(vars)))
}

/// Caps the number of rows.
#[must_use]
pub fn limit(max: usize) -> Query {
    Query::new(format!("LIMIT {max}"))
}

/// Orders rows by a property of a variable.
#[must_use]
pub fn order_by(var: &str, key: &str, descending: bool) -> Query {
    let direction = if descending { " DESC" } else { "" };
    Query::new(format!(
        "ORDER BY {}.{}{direction}",
        sanitize::identifier(var),
        sanitize::identifier(key)
    ))
}

/// Creates a versioned relationship, which also opens a new state for `a`.
///
/// Callers add `_deleted: false` to `properties` beforehand.
#[must_use]
pub fn create_relationship(
    var_a: &str,
    kind: &str,
    properties: &PropertyMap,
    var_b: &str,
    created_at: Timestamp,
) -> Query {
    let var_a = sanitize::identifier(var_a);
    let var_b = sanitize::identifier(var_b);
    let kind = sanitize::identifier(kind);
    let properties = sanitize::keys(properties);
    let new_key = |k: &str| format!("new_{k}");

    let text = format!(
        "CALL graph.versioner.relationship.create({var_a}, {var_b}, \"{kind}\", {{{}}}, {})\nYIELD relationship",
        placeholders(&properties, new_key),
        localdatetime(created_at),
    );
    Query::new(text).with_params(params(&properties, new_key))
}

/// Matches a plain relationship `(a)-[r:KIND {filter}]->(b)`.
#[must_use]
pub fn match_relationship(
    var_a: &str,
    var_r: &str,
    kind: Option<&str>,
    filter: &PropertyMap,
    var_b: &str,
) -> Query {
    let var_a = sanitize::identifier(var_a);
    let var_b = sanitize::identifier(var_b);
    let var_r = sanitize::identifier(var_r);
    let kind = kind
        .map(sanitize::identifier)
        .filter(|k| !k.is_empty())
        .map(|k| format!(":{k}"))
        .unwrap_or_default();
    let filter = sanitize::keys(filter);
    let suffixed = |k: &str| format!("{k}_{var_r}");

    let props = if filter.is_empty() {
        String::new()
    } else {
        format!(" {{{}}}", placeholders(&filter, suffixed))
    };
    Query::new(format!("MATCH ({var_a})-[{var_r}{kind}{props}]->({var_b})"))
        .with_params(params(&filter, suffixed))
}

/// Matches a relationship through the state chain.
///
/// The pattern is entity `a` to a state (current or any), from the state to
/// the relationship anchor `R`, and from the anchor along `FOR` to entity `b`.
/// Binds `state`, `r_node`, `for_node` and the edge variable of `edge`.
#[must_use]
pub fn match_versioned_relationship(
    var_a: &str,
    var_r: &str,
    kind: Option<&str>,
    filter: &PropertyMap,
    var_b: &str,
    edge: StateEdge,
) -> Query {
    Query::join([
        match_node("state", Some("State"), &PropertyMap::new()),
        match_relationship(var_a, edge.var(), Some(edge.as_str()), &PropertyMap::new(), "state"),
        match_node("r_node", Some("R"), &PropertyMap::new()),
        match_relationship("state", var_r, kind, filter, "r_node"),
        match_relationship("r_node", "for_node", Some("FOR"), &PropertyMap::new(), var_b),
    ])
}

/// Attaches an edge to an already open `state` without opening another one.
///
/// The anchor `R` of `var_b` is reused when present. Binds `r_node` and `r`.
#[must_use]
pub fn create_state_relationship(
    state: &str,
    kind: &str,
    properties: &PropertyMap,
    var_b: &str,
) -> Query {
    let state = sanitize::identifier(state);
    let var_b = sanitize::identifier(var_b);
    let kind = sanitize::identifier(kind);
    let properties = sanitize::keys(properties);
    let new_key = |k: &str| format!("new_{k}_r");

    let props = if properties.is_empty() {
        String::new()
    } else {
        format!(" {{{}}}", placeholders(&properties, new_key))
    };
    let text = format!("MERGE (r_node:R)-[:FOR]->({var_b})\nCREATE ({state})-[r:{kind}{props}]->(r_node)");
    Query::new(text).with_params(params(&properties, new_key))
}

/// Deletes a versioned relationship, which also opens a new state for `a`.
#[must_use]
pub fn delete_relationship(var_a: &str, kind: &str, var_b: &str, deleted_at: Timestamp) -> Query {
    Query::new(format!(
        "CALL graph.versioner.relationship.delete({}, {}, \"{}\", {})\nYIELD result",
        sanitize::identifier(var_a),
        sanitize::identifier(var_b),
        sanitize::identifier(kind),
        localdatetime(deleted_at),
    ))
}

/// Deletes a matched relationship.
#[must_use]
pub fn delete(var: &str) -> Query {
    Query::new(format!("DELETE {}", sanitize::identifier(var)))
}

/// Deletes a matched node with all its edges.
#[must_use]
pub fn detach_delete(var: &str) -> Query {
    Query::new(format!("DETACH DELETE {}", sanitize::identifier(var)))
}

/// Constrains internal node ids.
#[must_use]
pub fn where_internal_id(pairs: &[(&str, i64)]) -> Query {
    if pairs.is_empty() {
        return Query::default();
    }
    let clauses = pairs
        .iter()
        .map(|(var, id)| format!("id({}) = {id}", sanitize::identifier(var)))
        .collect::<Vec<_>>()
        .join(" AND ");
    Query::new(format!("WHERE {clauses}"))
}

/// Constrains a property to a list of literal ids.
#[must_use]
pub fn where_property_in(var: &str, key: &str, values: &[impl AsRef<str>]) -> Query {
    let list = values
        .iter()
        .map(|v| format!("'{}'", sanitize::id(v.as_ref())))
        .collect::<Vec<_>>()
        .join(", ");
    Query::new(format!(
        "WHERE {}.{} IN [{list}]",
        sanitize::identifier(var),
        sanitize::identifier(key)
    ))
}

/// Constrains a node to carry any of the kind labels.
#[must_use]
pub fn where_kind_in(var: &str, kinds: &[impl AsRef<str>]) -> Query {
    if kinds.is_empty() {
        return Query::default();
    }
    let var = sanitize::identifier(var);
    let clauses = kinds
        .iter()
        .map(|k| format!("'{}' IN labels({var})", sanitize::identifier(k.as_ref())))
        .collect::<Vec<_>>()
        .join(" OR ");
    Query::new(format!("WHERE {clauses}"))
}

/// Constrains a `HAS_STATE` edge to the interval containing `at`.
///
/// The interval is half-open: `startDate <= at < endDate`, or open-ended.
#[must_use]
pub fn where_state_on_date(edge_var: &str, at: Timestamp) -> Query {
    let edge = sanitize::identifier(edge_var);
    let at = localdatetime(at);
    Query::new(format!(
        "WHERE {edge}.startDate <= {at} AND ({edge}.endDate > {at} OR {edge}.endDate IS NULL)"
    ))
}

/// Resolves the current state of a matched entity into `node`.
#[must_use]
pub fn get_current_state(var: &str) -> Query {
    Query::new(format!(
        "CALL graph.versioner.get.current.state({}) YIELD node",
        sanitize::identifier(var)
    ))
}

/// Diffs two matched states.
#[must_use]
pub fn diff_states(state_from: &str, state_to: &str) -> Query {
    Query::new(format!(
        "CALL graph.versioner.diff({}, {})\nYIELD operation, label, oldValue, newValue",
        sanitize::identifier(state_from),
        sanitize::identifier(state_to)
    ))
}
