//! Shared connection handling for `SQLite` backends.
//!
//! Mutex handling with poison recovery, connection pragmas, and the mapping
//! from `rusqlite` errors onto the crate's error taxonomy.

use crate::Error;
use rusqlite::{Connection, ErrorCode};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Default time a connection waits on a locked database.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Helper to acquire mutex lock with poison recovery.
///
/// If the mutex is poisoned (due to a panic in a previous critical section),
/// we recover the inner value and log a warning. `SQLite` rolls back any open
/// transaction when its guard is dropped, so the connection is still usable.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Configures a `SQLite` connection for concurrent use.
///
/// # Configuration Applied
///
/// - **WAL mode**: concurrent readers with a single writer
/// - **NORMAL synchronous**: balances durability with performance
/// - **`busy_timeout`**: waits this long for locks before returning `SQLITE_BUSY`
/// - **foreign keys**: cascades state and relationship rows on entity removal
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) {
    // journal_mode answers with a row, so failures here are not fatal.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.busy_timeout(busy_timeout);
    let _ = conn.pragma_update(None, "foreign_keys", "ON");
}

/// Classifies a `rusqlite` error.
///
/// Busy and locked databases become [`Error::Timeout`]; everything else is
/// [`Error::OperationFailed`].
pub fn sqlite_error(operation: &str, err: &rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            metrics::counter!("sqlite_busy_timeout_total", "operation" => operation.to_string())
                .increment(1);
            Error::Timeout {
                operation: operation.to_string(),
            }
        },
        _ => Error::failed(operation, err),
    }
}

/// Returns `true` for `UNIQUE`/`PRIMARY KEY` violations.
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_lock_concurrent() {
        let mutex = Arc::new(Mutex::new(0));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    *acquire_lock(&mutex) += 1;
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*acquire_lock(&mutex), 10);
    }

    #[test]
    fn test_configure_connection() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn, Duration::from_millis(1500));

        let busy_timeout: i32 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(busy_timeout, 1500);
        let foreign_keys: i32 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn test_sqlite_error_classification() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (id TEXT PRIMARY KEY)", []).unwrap();
        conn.execute("INSERT INTO t VALUES ('a')", []).unwrap();
        let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
        assert!(is_constraint_violation(&err));
        assert!(matches!(
            sqlite_error("insert", &err),
            Error::OperationFailed { .. }
        ));

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(sqlite_error("insert", &busy), Error::Timeout { .. }));
    }
}
