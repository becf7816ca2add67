//! Record sources.
//!
//! A source yields batches of raw JSON records. [`AofSource`] tails an
//! append-only file; `RedisSource` (feature `redis`) polls a key-value store
//! and returns the values of keys it has not seen before.

use crate::{Error, Result};
use serde_json::Value;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A source of raw change records.
pub trait RecordSource {
    /// Returns the records that appeared since the previous call.
    ///
    /// An empty batch means nothing new, not end of input.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file or server cannot be read.
    fn next_batch(&mut self) -> Result<Vec<Value>>;
}

/// Reads records from an append-only file.
///
/// Lines starting with `{` are records; everything else (protocol framing,
/// blank lines) is skipped. Only complete lines are consumed, so a record
/// being written while the file is read is picked up by the next call.
#[derive(Debug)]
pub struct AofSource {
    path: PathBuf,
    offset: u64,
}

impl AofSource {
    /// Creates a source reading `path` from the beginning.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns how many bytes have been consumed.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl RecordSource for AofSource {
    fn next_batch(&mut self) -> Result<Vec<Value>> {
        let mut file = File::open(&self.path).map_err(|e| Error::failed("read_aof", e))?;
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| Error::failed("read_aof", e))?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)
            .map_err(|e| Error::failed("read_aof", e))?;

        let Some(complete) = buffer.rfind('\n').map(|end| &buffer[..=end]) else {
            return Ok(Vec::new());
        };
        self.offset += complete.len() as u64;

        let records = parse_lines(complete);
        debug!(path = %self.path.display(), records = records.len(), offset = self.offset, "Read AOF");
        Ok(records)
    }
}

/// Parses every line that starts with `{` as a JSON record.
///
/// Malformed lines are logged and skipped.
pub fn parse_lines(text: &str) -> Vec<Value> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Skipping malformed AOF line");
                metrics::counter!("kg_ingest_malformed_lines_total").increment(1);
                None
            },
        })
        .collect()
}

/// Orders keys by their second-to-last `.` segment.
///
/// Keys without a `.` sort by the whole key.
pub fn sort_keys(keys: &mut [String]) {
    keys.sort_by(|a, b| sort_segment(a).cmp(sort_segment(b)));
}

fn sort_segment(key: &str) -> &str {
    key.rsplit('.').nth(1).unwrap_or(key)
}

#[cfg(feature = "redis")]
mod redis_source {
    use super::{RecordSource, sort_keys};
    use crate::{Error, Result};
    use redis::{Client, Connection};
    use serde_json::Value;
    use std::collections::HashSet;
    use std::time::Duration;
    use tracing::{info, warn};

    /// Timeout for Redis reads and writes.
    const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

    /// Polls a Redis server for new keys.
    ///
    /// Keys present when the source connects are treated as already seen.
    pub struct RedisSource {
        connection: Connection,
        seen: HashSet<String>,
    }

    impl RedisSource {
        /// Connects to `url` and snapshots the keys already present.
        ///
        /// # Errors
        ///
        /// Returns an error if the connection or the initial key listing fails.
        pub fn connect(url: &str) -> Result<Self> {
            let client = Client::open(url).map_err(|e| Error::failed("redis_connect", e))?;
            let connection = client
                .get_connection()
                .map_err(|e| Error::failed("redis_get_connection", e))?;
            connection
                .set_read_timeout(Some(REDIS_TIMEOUT))
                .map_err(|e| Error::failed("redis_set_read_timeout", e))?;
            connection
                .set_write_timeout(Some(REDIS_TIMEOUT))
                .map_err(|e| Error::failed("redis_set_write_timeout", e))?;

            let mut source = Self {
                connection,
                seen: HashSet::new(),
            };
            let existing = source.keys()?;
            info!(keys = existing.len(), "Connected to Redis, existing keys treated as seen");
            source.seen.extend(existing);
            Ok(source)
        }

        fn keys(&mut self) -> Result<Vec<String>> {
            let mut keys: Vec<String> = redis::cmd("KEYS")
                .arg("*")
                .query(&mut self.connection)
                .map_err(|e| Error::failed("redis_keys", e))?;
            sort_keys(&mut keys);
            Ok(keys)
        }
    }

    impl RecordSource for RedisSource {
        fn next_batch(&mut self) -> Result<Vec<Value>> {
            let fresh: Vec<String> = self
                .keys()?
                .into_iter()
                .filter(|key| !self.seen.contains(key))
                .collect();
            if fresh.is_empty() {
                return Ok(Vec::new());
            }

            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&fresh)
                .query(&mut self.connection)
                .map_err(|e| Error::failed("redis_mget", e))?;

            let mut records = Vec::with_capacity(values.len());
            for (key, value) in fresh.iter().zip(values) {
                let Some(raw) = value else {
                    continue;
                };
                match serde_json::from_str(&raw) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(key = %key, error = %e, "Skipping malformed Redis value"),
                }
            }
            self.seen.extend(fresh);
            Ok(records)
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_source::RedisSource;
