//! `SQLite` + FTS5 entity index.
//!
//! One FTS5 table, `inverted_index(title, entity_id, raw_entity_id,
//! num_rels, tag, user_id, raw_user_id)`, tokenized with `porter ascii` so
//! that searches match stemmed words of a lower-cased title. The escaped
//! columns are what the tokenizer sees; the raw columns are compared and
//! returned as stored.

use crate::models::EntityId;
use crate::storage::sqlite::{DEFAULT_BUSY_TIMEOUT, acquire_lock, configure_connection, sqlite_error};
use crate::storage::traits::{EntityIndex, NAME_TAG};
use crate::{Error, Result, ValidationError};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, instrument};

const SCHEMA: &str = "CREATE VIRTUAL TABLE IF NOT EXISTS inverted_index USING fts5(\
     title, entity_id, raw_entity_id UNINDEXED, num_rels UNINDEXED, tag, user_id, \
     raw_user_id UNINDEXED, tokenize = 'porter ascii')";

/// Replaces characters the tokenizer would split on.
///
/// `/` becomes `slash` and `-` becomes `hyphen`.
#[must_use]
pub fn escape_token(raw: &str) -> String {
    raw.replace('/', "slash").replace('-', "hyphen")
}

/// Quotes a term as an FTS5 string, doubling embedded quotes.
fn fts_string(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

fn match_expression(title: &str, tag: Option<&str>, user_id: &str) -> String {
    let mut expression = format!("title:{}", fts_string(title));
    if let Some(tag) = tag {
        expression.push_str(" AND tag:");
        expression.push_str(&fts_string(tag));
    }
    expression.push_str(" AND user_id:");
    expression.push_str(&fts_string(user_id));
    expression
}

/// `SQLite`-based entity index with FTS5.
///
/// A derived view: [`EntityIndex::drop_index`] loses no graph data.
pub struct SqliteEntityIndex {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteEntityIndex {
    /// Opens (or creates) the index at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::failed("open_entity_index", e))?;
        }
        let conn = Connection::open(&db_path).map_err(|e| sqlite_error("open_entity_index", &e))?;
        Self::with_connection(conn, Some(db_path))
    }

    /// Creates an in-memory index (useful for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| sqlite_error("open_entity_index_memory", &e))?;
        Self::with_connection(conn, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        configure_connection(&conn, DEFAULT_BUSY_TIMEOUT);
        conn.execute(SCHEMA, [])
            .map_err(|e| sqlite_error("create_entity_index", &e))?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Returns the database path.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

impl EntityIndex for SqliteEntityIndex {
    #[instrument(skip(self, substrings, ids, tags), fields(user_id = %user_id, count = substrings.len()))]
    fn add_entities(
        &self,
        user_id: &str,
        substrings: &[String],
        ids: &[EntityId],
        tags: &[String],
    ) -> Result<()> {
        const OP: &str = "add_entities";
        if substrings.len() != ids.len() || ids.len() != tags.len() {
            return Err(ValidationError::LengthMismatch {
                keys: substrings.len(),
                values: ids.len().min(tags.len()),
            }
            .into());
        }
        let user = escape_token(user_id);
        let mut conn = acquire_lock(&self.conn);
        let tx = conn.transaction().map_err(|e| sqlite_error(OP, &e))?;

        for ((substring, id), tag) in substrings.iter().zip(ids).zip(tags) {
            let title = substring.trim().to_lowercase();
            if title.is_empty() {
                debug!(entity_id = %id, "Skipping empty index title");
                continue;
            }
            let entity_id = escape_token(id.as_str());

            if tag == NAME_TAG {
                tx.execute(
                    "DELETE FROM inverted_index
                     WHERE raw_entity_id = ?1 AND tag = ?2 AND raw_user_id = ?3",
                    params![id.as_str(), tag, user_id],
                )
                .map_err(|e| sqlite_error(OP, &e))?;
            } else {
                let existing: i64 = tx
                    .query_row(
                        "SELECT count(*) FROM inverted_index
                         WHERE inverted_index MATCH ?1 AND raw_entity_id = ?2 AND raw_user_id = ?3",
                        params![match_expression(&title, Some(tag), &user), id.as_str(), user_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| sqlite_error(OP, &e))?;
                if existing > 0 {
                    continue;
                }
            }
            tx.execute(
                "INSERT INTO inverted_index
                 (title, entity_id, raw_entity_id, num_rels, tag, user_id, raw_user_id)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
                params![title, entity_id, id.as_str(), tag, user, user_id],
            )
            .map_err(|e| sqlite_error(OP, &e))?;
        }
        tx.commit().map_err(|e| sqlite_error(OP, &e))
    }

    fn search(&self, user_id: &str, substring: &str, tag: Option<&str>) -> Result<Vec<EntityId>> {
        const OP: &str = "search_entity_index";
        let title = substring.trim().to_lowercase();
        if title.is_empty() {
            return Ok(Vec::new());
        }
        let expression = match_expression(&title, tag, &escape_token(user_id));

        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare(
                "SELECT raw_entity_id FROM inverted_index
                 WHERE inverted_index MATCH ?1 AND raw_user_id = ?2 ORDER BY rank",
            )
            .map_err(|e| sqlite_error(OP, &e))?;
        let rows = stmt
            .query_map(params![expression, user_id], |row| row.get::<_, String>(0))
            .map_err(|e| sqlite_error(OP, &e))?;

        let mut found = Vec::new();
        for row in rows {
            let id = EntityId::new(row.map_err(|e| sqlite_error(OP, &e))?);
            if !found.contains(&id) {
                found.push(id);
            }
        }
        Ok(found)
    }

    fn drop_index(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        conn.execute("DELETE FROM inverted_index", [])
            .map_err(|e| sqlite_error("drop_entity_index", &e))?;
        tracing::info!("Entity index was cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn add(index: &SqliteEntityIndex, user: &str, title: &str, id: &str, tag: &str) {
        index
            .add_entities(user, &[title.to_string()], &[EntityId::new(id)], &[tag.to_string()])
            .unwrap();
    }

    #[test_case("a/b", "aslashb" ; "slash")]
    #[test_case("user-1", "userhyphen1" ; "hyphen")]
    #[test_case("plain", "plain" ; "untouched")]
    fn test_escape_token(raw: &str, escaped: &str) {
        assert_eq!(escape_token(raw), escaped);
    }

    #[test_case("slashdot-feed" ; "literal slash text")]
    #[test_case("hyphenated/id-2" ; "literal hyphen text")]
    #[test_case("aslashb" ; "collides with escaped slash")]
    fn test_ids_returned_as_stored(id: &str) {
        let index = SqliteEntityIndex::in_memory().unwrap();
        add(&index, "u", "Newsletter", id, NAME_TAG);
        assert_eq!(
            index.search("u", "newsletter", Some(NAME_TAG)).unwrap(),
            vec![EntityId::new(id)]
        );
    }

    #[test]
    fn test_escaped_collisions_stay_apart() {
        let index = SqliteEntityIndex::in_memory().unwrap();
        add(&index, "u", "First", "a/b", NAME_TAG);
        add(&index, "u", "Second", "aslashb", NAME_TAG);
        add(&index, "uslash1", "Third", "c", NAME_TAG);

        assert_eq!(index.search("u", "first", None).unwrap(), vec![EntityId::new("a/b")]);
        assert_eq!(index.search("u", "second", None).unwrap(), vec![EntityId::new("aslashb")]);
        assert!(index.search("u/1", "third", None).unwrap().is_empty());
    }

    #[test]
    fn test_search_is_scoped_by_user() {
        let index = SqliteEntityIndex::in_memory().unwrap();
        add(&index, "user-1", "Reading Books", "habit/1", NAME_TAG);
        add(&index, "user-2", "Reading", "habit/2", NAME_TAG);

        let found = index.search("user-1", "reading", None).unwrap();
        assert_eq!(found, vec![EntityId::new("habit/1")]);
        assert!(index.search("user-3", "reading", None).unwrap().is_empty());
    }

    #[test]
    fn test_name_row_replaced() {
        let index = SqliteEntityIndex::in_memory().unwrap();
        add(&index, "u", "Old Title", "e1", NAME_TAG);
        add(&index, "u", "New Title", "e1", NAME_TAG);

        assert!(index.search("u", "old", Some(NAME_TAG)).unwrap().is_empty());
        assert_eq!(
            index.search("u", "new", Some(NAME_TAG)).unwrap(),
            vec![EntityId::new("e1")]
        );
    }

    #[test]
    fn test_other_tags_deduplicated() {
        let index = SqliteEntityIndex::in_memory().unwrap();
        add(&index, "u", "Coffee", "e1", "drink");
        add(&index, "u", "coffee", "e1", "drink");
        add(&index, "u", "coffee", "e2", "drink");

        let found = index.search("u", "coffee", Some("drink")).unwrap();
        assert_eq!(found.len(), 2);
        assert!(index.search("u", "coffee", Some("food")).unwrap().is_empty());
    }

    #[test]
    fn test_porter_stemming_and_drop() {
        let index = SqliteEntityIndex::in_memory().unwrap();
        add(&index, "u", "Running shoes", "e1", NAME_TAG);
        assert_eq!(index.search("u", "run", None).unwrap(), vec![EntityId::new("e1")]);

        index.drop_index().unwrap();
        assert!(index.search("u", "run", None).unwrap().is_empty());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let index = SqliteEntityIndex::in_memory().unwrap();
        let err = index
            .add_entities("u", &["a".to_string()], &[], &[NAME_TAG.to_string()])
            .unwrap_err();
        assert!(err.is_validation());
    }
}
