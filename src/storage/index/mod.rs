//! Full-text entity index backends.
//!
//! Search indices map lower-cased title substrings to entity ids, scoped by
//! user and tag.

mod sqlite;

pub use sqlite::{SqliteEntityIndex, escape_token};
