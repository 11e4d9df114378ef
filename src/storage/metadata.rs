//! Metadata Database Module
//!
//! Owns the SQLite manifest file: schema creation, a prepared-statement
//! cache, typed row operations, and a bounded reopen gate that keeps a
//! flapping database from being hammered.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use tracing::{debug, error, info, warn};

use crate::error::{CacheError, Result};
use crate::storage::item::Item;

/// Reopen is refused while this many consecutive opens have failed and
/// the retry window has not yet elapsed.
const OPEN_RETRY_CAP: u32 = 8;
const OPEN_RETRY_WINDOW: Duration = Duration::from_secs(2);
const CLOSE_RETRY_PAUSE: Duration = Duration::from_millis(20);
const STATEMENT_CACHE_CAPACITY: usize = 32;

const SCHEMA_SQL: &str = "\
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS manifest (
  key               TEXT PRIMARY KEY,
  filename          TEXT,
  size              INTEGER,
  inline_data       BLOB,
  modification_time INTEGER,
  last_access_time  INTEGER,
  extended_data     BLOB
);
CREATE INDEX IF NOT EXISTS last_access_time_idx ON manifest(last_access_time);
";

/// Unix seconds now.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs() as i64
}

// == Trim Candidate ==
/// A row of the oldest-first scan used by bounded trims: just enough to
/// delete the entry and account for it.
#[derive(Debug)]
pub(crate) struct TrimCandidate {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
}

// == Connection State ==
/// `Closed` has never failed (or was reset); `Gated` remembers the
/// failure history that drives the reopen back-off.
enum DbState {
    Closed,
    Open(Connection),
    Gated { attempts: u32, last_failure: Instant },
}

// == Metadata DB ==
/// Not internally thread-safe; the enclosing store serializes access.
pub(crate) struct MetadataDb {
    path: PathBuf,
    state: DbState,
}

impl MetadataDb {
    /// The connection is opened lazily on first use.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: DbState::Closed,
        }
    }

    // == Connection Lifecycle ==

    /// Opens the connection if necessary, honoring the reopen gate.
    pub fn ensure_open(&mut self) -> Result<()> {
        self.connection().map(|_| ())
    }

    fn connection(&mut self) -> Result<&Connection> {
        if !matches!(self.state, DbState::Open(_)) {
            let attempts = match &self.state {
                DbState::Gated {
                    attempts,
                    last_failure,
                } => {
                    if *attempts >= OPEN_RETRY_CAP && last_failure.elapsed() < OPEN_RETRY_WINDOW {
                        debug!(path = %self.path.display(), attempts = *attempts, "reopen gated");
                        return Err(CacheError::DbUnavailable);
                    }
                    *attempts
                }
                _ => 0,
            };
            match Self::open(&self.path) {
                Ok(conn) => {
                    info!(path = %self.path.display(), "manifest database opened");
                    self.state = DbState::Open(conn);
                }
                Err(err) => {
                    error!(path = %self.path.display(), %err, "manifest database open failed");
                    self.state = DbState::Gated {
                        attempts: attempts.saturating_add(1),
                        last_failure: Instant::now(),
                    };
                    return Err(err);
                }
            }
        }
        match &self.state {
            DbState::Open(conn) => Ok(conn),
            _ => Err(CacheError::DbUnavailable),
        }
    }

    fn open(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(conn)
    }

    /// Closes the connection, finalizing cached statements first and
    /// retrying while SQLite reports BUSY/LOCKED.
    pub fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, DbState::Closed);
        let DbState::Open(mut conn) = state else {
            return;
        };
        loop {
            conn.flush_prepared_statement_cache();
            match conn.close() {
                Ok(()) => break,
                Err((returned, err)) => {
                    if is_busy(&err) {
                        warn!(%err, "close busy, retrying");
                        conn = returned;
                        std::thread::sleep(CLOSE_RETRY_PAUSE);
                    } else {
                        error!(%err, "manifest database close failed");
                        break;
                    }
                }
            }
        }
    }

    // == Writes ==

    /// INSERT OR REPLACE of one manifest row; both timestamps are set
    /// to now. Inline bytes are bound only when no filename is given.
    pub fn upsert(
        &mut self,
        key: &str,
        filename: Option<&str>,
        size: u64,
        inline: Option<&[u8]>,
        extended: Option<&[u8]>,
    ) -> Result<()> {
        let now = unix_now();
        let inline = if filename.is_some() { None } else { inline };
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO manifest \
             (key, filename, size, inline_data, modification_time, last_access_time, extended_data) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.execute(params![key, filename, size as i64, inline, now, now, extended])?;
        Ok(())
    }

    pub fn update_access_time(&mut self, key: &str) -> Result<()> {
        let now = unix_now();
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare_cached("UPDATE manifest SET last_access_time = ?1 WHERE key = ?2")?;
        stmt.execute(params![now, key])?;
        Ok(())
    }

    /// Variadic form; the statement text depends on the key count, so
    /// it is prepared ad hoc and finalized after use.
    pub fn update_access_times(&mut self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let now = unix_now();
        let conn = self.connection()?;
        let sql = format!(
            "UPDATE manifest SET last_access_time = ?1 WHERE key IN ({})",
            placeholders(keys.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bound: Vec<&dyn ToSql> = Vec::with_capacity(keys.len() + 1);
        bound.push(&now);
        for key in keys {
            bound.push(key);
        }
        stmt.execute(bound.as_slice())?;
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached("DELETE FROM manifest WHERE key = ?1")?;
        stmt.execute(params![key])?;
        Ok(())
    }

    pub fn delete_keys(&mut self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let conn = self.connection()?;
        let sql = format!(
            "DELETE FROM manifest WHERE key IN ({})",
            placeholders(keys.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        stmt.execute(params_from_iter(keys.iter()))?;
        Ok(())
    }

    pub fn delete_larger_than(&mut self, size: u64) -> Result<()> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached("DELETE FROM manifest WHERE size > ?1")?;
        stmt.execute(params![size as i64])?;
        Ok(())
    }

    pub fn delete_earlier_than(&mut self, timestamp: i64) -> Result<()> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare_cached("DELETE FROM manifest WHERE last_access_time < ?1")?;
        stmt.execute(params![timestamp])?;
        Ok(())
    }

    // == Reads ==

    pub fn get(&mut self, key: &str, with_inline: bool) -> Result<Option<Item>> {
        let conn = self.connection()?;
        let row = if with_inline {
            conn.prepare_cached(
                "SELECT key, filename, size, inline_data, modification_time, \
                 last_access_time, extended_data FROM manifest WHERE key = ?1",
            )?
            .query_row(params![key], |row| map_item_row(row, true))
            .optional()?
        } else {
            conn.prepare_cached(
                "SELECT key, filename, size, modification_time, last_access_time, \
                 extended_data FROM manifest WHERE key = ?1",
            )?
            .query_row(params![key], |row| map_item_row(row, false))
            .optional()?
        };
        Ok(row)
    }

    pub fn get_many(&mut self, keys: &[&str], with_inline: bool) -> Result<Vec<Item>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection()?;
        let columns = if with_inline {
            "key, filename, size, inline_data, modification_time, last_access_time, extended_data"
        } else {
            "key, filename, size, modification_time, last_access_time, extended_data"
        };
        let sql = format!(
            "SELECT {columns} FROM manifest WHERE key IN ({})",
            placeholders(keys.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(keys.iter()), |row| {
                map_item_row(row, with_inline)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_filename(&mut self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let filename = conn
            .prepare_cached("SELECT filename FROM manifest WHERE key = ?1")?
            .query_row(params![key], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(filename.flatten())
    }

    pub fn get_filenames(&mut self, keys: &[&str]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection()?;
        let sql = format!(
            "SELECT filename FROM manifest WHERE key IN ({}) AND filename IS NOT NULL",
            placeholders(keys.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(keys.iter()), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_filenames_larger_than(&mut self, size: u64) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let rows = conn
            .prepare_cached(
                "SELECT filename FROM manifest WHERE size > ?1 AND filename IS NOT NULL",
            )?
            .query_map(params![size as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_filenames_earlier_than(&mut self, timestamp: i64) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let rows = conn
            .prepare_cached(
                "SELECT filename FROM manifest WHERE last_access_time < ?1 \
                 AND filename IS NOT NULL",
            )?
            .query_map(params![timestamp], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Oldest rows by access time; ties fall back to natural row order.
    pub fn get_oldest(&mut self, limit: usize) -> Result<Vec<TrimCandidate>> {
        let conn = self.connection()?;
        let rows = conn
            .prepare_cached(
                "SELECT key, filename, size FROM manifest \
                 ORDER BY last_access_time ASC LIMIT ?1",
            )?
            .query_map(params![limit as i64], |row| {
                Ok(TrimCandidate {
                    key: row.get(0)?,
                    filename: row.get(1)?,
                    size: row.get::<_, Option<i64>>(2)?.unwrap_or(0).max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // == Scalars ==

    pub fn count_all(&mut self) -> Result<u64> {
        let conn = self.connection()?;
        let count: i64 = conn
            .prepare_cached("SELECT COUNT(*) FROM manifest")?
            .query_row([], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn count_key(&mut self, key: &str) -> Result<u64> {
        let conn = self.connection()?;
        let count: i64 = conn
            .prepare_cached("SELECT COUNT(key) FROM manifest WHERE key = ?1")?
            .query_row(params![key], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn sum_size(&mut self) -> Result<u64> {
        let conn = self.connection()?;
        let sum: Option<i64> = conn
            .prepare_cached("SELECT SUM(size) FROM manifest")?
            .query_row([], |row| row.get(0))?;
        Ok(sum.unwrap_or(0).max(0) as u64)
    }

    // == Checkpoint ==

    /// Folds the WAL back into the main database file; issued after
    /// bulk deletions to bound on-disk growth.
    pub fn checkpoint(&mut self) -> Result<()> {
        let conn = self.connection()?;
        conn.query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
        Ok(())
    }

    #[cfg(test)]
    pub fn backdate_access_time(&mut self, key: &str, timestamp: i64) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE manifest SET last_access_time = ?1 WHERE key = ?2",
            params![timestamp, key],
        )?;
        Ok(())
    }
}

impl Drop for MetadataDb {
    fn drop(&mut self) {
        self.close();
    }
}

// == Helpers ==

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

fn map_item_row(row: &rusqlite::Row<'_>, with_inline: bool) -> rusqlite::Result<Item> {
    let key: String = row.get(0)?;
    let filename: Option<String> = row.get(1)?;
    let size = row.get::<_, Option<i64>>(2)?.unwrap_or(0).max(0) as u64;
    let (value, base) = if with_inline {
        (row.get::<_, Option<Vec<u8>>>(3)?, 4)
    } else {
        (None, 3)
    };
    Ok(Item {
        key,
        value,
        filename,
        size,
        modification_time: row.get::<_, Option<i64>>(base)?.unwrap_or(0),
        last_access_time: row.get::<_, Option<i64>>(base + 1)?.unwrap_or(0),
        extended_data: row.get(base + 2)?,
    })
}
