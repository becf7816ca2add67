//! Parameterized query construction.
//!
//! Builders in [`cypher`] are pure functions from structured inputs to a
//! [`Query`]: a fragment of query text plus the parameters it references.
//! Fragments are designed to be concatenated with newlines and run as one
//! statement, so parameter keys are namespaced by the fragment's variable name.
//!
//! # Example
//!
//! ```rust
//! use versioned_kg::models::PropertyMap;
//! use versioned_kg::query::{Query, cypher};
//!
//! let mut filter = PropertyMap::new();
//! filter.insert("Id".into(), "jack".into());
//!
//! let query = Query::join([
//!     cypher::match_node("a", Some("User"), &filter),
//!     cypher::get_current_state("a"),
//!     cypher::return_vars(&["node"]),
//! ]);
//! assert!(query.text.starts_with("MATCH (a:User {Id: $Id_a})"));
//! assert!(query.params.contains_key("Id_a"));
//! ```

pub mod cypher;
pub mod sanitize;

use std::collections::BTreeMap;
use std::fmt;

/// Parameter name to JSON value.
pub type Params = BTreeMap<String, serde_json::Value>;

/// A query fragment and its parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Fragment text.
    pub text: String,
    /// Parameters referenced by the text.
    pub params: Params,
}

impl Query {
    /// Creates a fragment without parameters.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Params::new(),
        }
    }

    /// Attaches parameters.
    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    /// Concatenates fragments with newlines and merges their parameters.
    ///
    /// Empty fragments are dropped.
    #[must_use]
    pub fn join(parts: impl IntoIterator<Item = Self>) -> Self {
        let mut lines = Vec::new();
        let mut params = Params::new();
        for part in parts {
            if !part.text.is_empty() {
                lines.push(part.text);
            }
            params.extend(part.params);
        }
        Self {
            text: lines.join("\n"),
            params,
        }
    }

    /// Returns `true` if the fragment has no text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_skips_empty_and_merges_params() {
        let mut params = Params::new();
        params.insert("x".into(), serde_json::json!(1));
        let joined = Query::join([
            Query::new("MATCH (a)"),
            Query::default(),
            Query::new("RETURN a").with_params(params),
        ]);
        assert_eq!(joined.text, "MATCH (a)\nRETURN a");
        assert_eq!(joined.params.get("x"), Some(&serde_json::json!(1)));
    }
}
