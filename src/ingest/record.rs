//! Change records.
//!
//! A record is one JSON object describing an entity after a change:
//!
//! ```json
//! {"Id": "b1f0", "AppId": "zu", "Kind": "ZetUniverse.Kinds.Note",
//!  "SemanticAction": 71, "TLChange": "2022-03-01T10:00:00.1234567",
//!  "Created": "2022-02-01T09:00:00.0000000", "Title": "Groceries",
//!  "Related": [{"Relation": "Mention", "EntityId": "c2", "Direction": true,
//!               "RelationshipEntityId": "r9"}]}
//! ```
//!
//! Nested objects are flattened to `outer_inner` keys, lists are stored as
//! their JSON text and nulls become empty strings.

use crate::models::{EntityId, PropertyMap, PropertyValue, Timestamp, parse_timestamp};
use crate::{Error, Result};
use serde_json::{Map, Value};

/// Record key holding the entity id.
pub const ID_KEY: &str = "Id";
/// Record key holding the entity kind.
pub const KIND_KEY: &str = "Kind";
/// Record key holding the semantic action code.
pub const SEMANTIC_ACTION_KEY: &str = "SemanticAction";
/// Record key holding the change timestamp.
pub const TL_CHANGE_KEY: &str = "TLChange";
/// Record key holding the creation timestamp.
pub const CREATED_KEY: &str = "Created";
/// Record key holding embedded relationships.
pub const RELATED_KEY: &str = "Related";
/// Record key holding extracted keyphrases; never stored.
pub const KEYPHRASES_KEY: &str = "Keyphrases";
/// Property added by the connector with the decoded semantic action.
pub const SEMANTIC_ACTION_DESCRIPTION_KEY: &str = "SemanticActionDescription";
/// Record key holding the display title.
pub const TITLE_KEY: &str = "Title";

/// A relationship embedded in a record.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedLink {
    /// Relationship kind.
    pub relation: String,
    /// The entity at the other end.
    pub other: EntityId,
    /// `true` when the edge points from the record's entity to `other`.
    pub outgoing: bool,
    /// Edge properties.
    pub properties: PropertyMap,
}

/// A parsed change record.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Entity id.
    pub id: EntityId,
    /// Raw record kind, before identifier sanitization.
    pub kind: String,
    /// Semantic action code.
    pub semantic_action: i64,
    /// When the change happened.
    pub changed_at: Timestamp,
    /// When the entity was created, if the record says.
    pub created_at: Option<Timestamp>,
    /// Identity properties.
    pub immutable: PropertyMap,
    /// Versioned properties, including `SemanticAction` and `TLChange`.
    pub properties: PropertyMap,
    /// Embedded relationships.
    pub related: Vec<RelatedLink>,
}

impl ChangeRecord {
    /// Parses one line of JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for malformed JSON or a malformed record.
    pub fn parse_line(line: &str, immutable_keys: &[String]) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| Error::InvalidInput(format!("record is not valid JSON: {e}")))?;
        Self::from_json(&value, immutable_keys)
    }

    /// Parses a JSON record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the value is not an object, lacks
    /// `Id`, `Kind`, `SemanticAction` or `TLChange`, or carries an unparsable
    /// timestamp.
    pub fn from_json(value: &Value, immutable_keys: &[String]) -> Result<Self> {
        let Value::Object(object) = value else {
            return Err(Error::InvalidInput("record is not a JSON object".to_string()));
        };
        let mut object = object.clone();

        let id = match object.get(ID_KEY) {
            Some(Value::String(id)) if !id.is_empty() => EntityId::new(id.clone()),
            Some(Value::Number(n)) => EntityId::new(n.to_string()),
            _ => return Err(missing(ID_KEY)),
        };
        let kind = match object.remove(KIND_KEY) {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            _ => return Err(missing(KIND_KEY)),
        };
        let semantic_action = object
            .get(SEMANTIC_ACTION_KEY)
            .and_then(Value::as_i64)
            .ok_or_else(|| missing(SEMANTIC_ACTION_KEY))?;
        let changed_at = match object.remove(TL_CHANGE_KEY) {
            Some(Value::String(raw)) => parse_record_timestamp(&raw)?,
            _ => return Err(missing(TL_CHANGE_KEY)),
        };
        let created_at = match object.remove(CREATED_KEY) {
            Some(Value::String(raw)) => Some(parse_record_timestamp(&raw)?),
            _ => None,
        };
        object.remove(KEYPHRASES_KEY);
        let related = match object.remove(RELATED_KEY) {
            Some(Value::Array(links)) => links.iter().filter_map(parse_link).collect(),
            _ => Vec::new(),
        };

        let mut flat = flatten(object);
        let mut immutable = PropertyMap::new();
        for key in immutable_keys {
            if let Some(value) = flat.remove(key) {
                immutable.insert(key.clone(), value);
            }
        }
        flat.insert(
            TL_CHANGE_KEY.to_string(),
            PropertyValue::DateTime(changed_at.naive_utc()),
        );

        Ok(Self {
            id,
            kind,
            semantic_action,
            changed_at,
            created_at,
            immutable,
            properties: flat,
            related,
        })
    }

    /// Returns the record's title, if it has a non-empty one.
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        self.properties
            .get(TITLE_KEY)
            .and_then(PropertyValue::as_str)
            .filter(|title| !title.is_empty())
    }

    /// Returns `(from, to)` of an embedded link.
    #[must_use]
    pub fn endpoints(&self, link: &RelatedLink) -> (EntityId, EntityId) {
        if link.outgoing {
            (self.id.clone(), link.other.clone())
        } else {
            (link.other.clone(), self.id.clone())
        }
    }
}

fn missing(key: &str) -> Error {
    Error::InvalidInput(format!("record lacks a valid '{key}'"))
}

/// Parses record timestamps.
///
/// Fraction digits beyond nanoseconds are cut, and a trailing `Z` is accepted.
pub fn parse_record_timestamp(raw: &str) -> Result<Timestamp> {
    let raw = raw.trim();
    let trimmed = raw.strip_suffix('Z').unwrap_or(raw);
    let truncated = match trimmed.split_once('.') {
        Some((whole, fraction)) => {
            let digits = fraction.bytes().take_while(u8::is_ascii_digit).count();
            let (fraction, offset) = fraction.split_at(digits);
            format!("{whole}.{}{offset}", &fraction[..digits.min(9)])
        },
        None => trimmed.to_string(),
    };
    parse_timestamp(&truncated)
}

fn parse_link(value: &Value) -> Option<RelatedLink> {
    let Value::Object(object) = value else {
        return None;
    };
    let mut object = object.clone();
    let relation = match object.remove("Relation") {
        Some(Value::String(relation)) if !relation.is_empty() => relation,
        _ => return None,
    };
    let other = match object.remove("EntityId") {
        Some(Value::String(id)) if !id.is_empty() => EntityId::new(id),
        _ => return None,
    };
    let outgoing = object
        .remove("Direction")
        .and_then(|d| d.as_bool())
        .unwrap_or(true);
    object.remove("RelationshipEntityId");
    Some(RelatedLink {
        relation,
        other,
        outgoing,
        properties: flatten(object),
    })
}

/// Converts a JSON object into a flat property map.
#[must_use]
pub fn flatten(object: Map<String, Value>) -> PropertyMap {
    let mut flat = PropertyMap::new();
    flatten_into(&mut flat, None, object);
    flat
}

fn flatten_into(flat: &mut PropertyMap, prefix: Option<&str>, object: Map<String, Value>) {
    for (key, value) in object {
        let key = prefix.map_or_else(|| key.clone(), |p| format!("{p}_{key}"));
        match value {
            Value::Object(inner) => flatten_into(flat, Some(&key), inner),
            Value::Array(_) => {
                flat.insert(key, PropertyValue::String(value.to_string()));
            },
            Value::Null => {
                flat.insert(key, PropertyValue::String(String::new()));
            },
            scalar => {
                if let Some(converted) = PropertyValue::from_json(&scalar) {
                    flat.insert(key, converted);
                }
            },
        }
    }
}
